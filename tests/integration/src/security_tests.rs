//! Security Tests - Authenticated Binds and Per-PDU Protection
//!
//! These tests exercise:
//! - The three-leg shared-key exchange across bind, bind_ack and auth3
//! - Signed and sealed calls, including fragmented ones
//! - Rejection of a client holding the wrong secret
//! - Server enforcement of a minimum authentication level
//! - Detection of a PDU modified in transit

mod common;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;

use common::*;
use dcerpc::{
    AuthLevel, DceRpcClient, DceRpcServer, DceRpcServerConfig, DceRpcTransport, FaultStatus,
    PacketType, RpcError, SecurityConfig, SecurityState, SharedKeyProvider,
};
use tokio::net::{TcpListener, TcpStream};

const SECRET: &[u8] = b"integration shared secret";

async fn start_secure_server(config: DceRpcServerConfig) -> TestServer {
    let server = DceRpcServer::with_config(config)
        .with_security_provider(Arc::new(SharedKeyProvider::new(SECRET)));
    start_configured(server, vec![create_echo_interface()]).await
}

async fn connect_secure(
    addr: SocketAddr,
    secret: &[u8],
    level: AuthLevel,
) -> dcerpc::Result<DceRpcClient> {
    let provider = Arc::new(SharedKeyProvider::new(secret));
    DceRpcClient::builder(syntax(ECHO_UUID, ECHO_VERSION))
        .security(SecurityConfig::new(provider, level))
        .connect(addr)
        .await
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_integrity_protected_calls() {
    init_logging();
    let server = start_secure_server(DceRpcServerConfig::default()).await;
    let client = connect_secure(server.addr, SECRET, AuthLevel::PktIntegrity)
        .await
        .unwrap();

    assert_eq!(client.auth_level(), AuthLevel::PktIntegrity);
    assert_eq!(client.security_state(), Some(SecurityState::Established));

    for i in 0..20u32 {
        let payload = Bytes::from(format!("signed call {}", i));
        let reply = client.call(0, payload.clone()).await.unwrap();
        assert_eq!(reply, payload);
    }
    println!("✓ 20 signed calls verified in both directions");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_privacy_protected_fragmented_call() {
    init_logging();
    let server = start_secure_server(DceRpcServerConfig::default()).await;
    let client = connect_secure(server.addr, SECRET, AuthLevel::PktPrivacy)
        .await
        .unwrap();

    // odd length so every fragment needs auth padding
    let payload = pattern_payload(30_001);
    let reply = client.call(0, payload.clone()).await.unwrap();
    assert_eq!(compute_checksum(&reply), compute_checksum(&payload));

    let small = client.call(0, Bytes::from_static(b"sealed")).await.unwrap();
    assert_eq!(small.as_ref(), b"sealed");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_connect_level_authenticates_without_verifiers() {
    init_logging();
    let server = start_secure_server(DceRpcServerConfig {
        min_auth_level: AuthLevel::Connect,
        ..Default::default()
    })
    .await;
    let client = connect_secure(server.addr, SECRET, AuthLevel::Connect)
        .await
        .unwrap();
    assert_eq!(client.security_state(), Some(SecurityState::Established));
    client.null_call().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_wrong_secret_rejected() {
    init_logging();
    let server = start_secure_server(DceRpcServerConfig::default()).await;

    let result = connect_secure(server.addr, b"not the secret", AuthLevel::PktIntegrity).await;
    assert!(
        matches!(result, Err(RpcError::AuthFailed(_))),
        "unexpected result: {:?}",
        result.err()
    );

    // the server keeps accepting well-behaved clients
    let client = connect_secure(server.addr, SECRET, AuthLevel::PktIntegrity)
        .await
        .unwrap();
    client.null_call().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_server_without_provider_rejects_authenticated_bind() {
    init_logging();
    let server = start_echo_server().await;
    let result = connect_secure(server.addr, SECRET, AuthLevel::PktIntegrity).await;
    // authentication_type_not_recognized
    assert!(matches!(result, Err(RpcError::BindRejected { reason: 8 })));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_minimum_auth_level_enforced() {
    init_logging();
    let server = start_secure_server(DceRpcServerConfig {
        min_auth_level: AuthLevel::PktIntegrity,
        ..Default::default()
    })
    .await;

    let anonymous = connect_client(server.addr, ECHO_UUID, ECHO_VERSION)
        .await
        .unwrap();
    match anonymous.call(0, Bytes::from_static(b"let me in")).await {
        Err(RpcError::Fault(status)) => assert_eq!(status, FaultStatus::AccessDenied as u32),
        other => panic!("expected access denied, got {:?}", other),
    }

    let weak = connect_secure(server.addr, SECRET, AuthLevel::Connect)
        .await
        .unwrap();
    assert!(matches!(
        weak.call(0, Bytes::new()).await,
        Err(RpcError::Fault(5))
    ));

    let strong = connect_secure(server.addr, SECRET, AuthLevel::PktPrivacy)
        .await
        .unwrap();
    strong.null_call().await.unwrap();
}

/// Forward one connection to `upstream`, flipping the first stub byte of
/// every request on the way
async fn tampering_proxy(upstream: SocketAddr) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let (client, _) = listener.accept().await.unwrap();
        let server = TcpStream::connect(upstream).await.unwrap();
        let (client_read, mut client_write) = client.into_split();
        let (mut server_read, server_write) = server.into_split();

        tokio::spawn(async move {
            let _ = tokio::io::copy(&mut server_read, &mut client_write).await;
        });

        let mut from_client = DceRpcTransport::new(client_read);
        let mut to_server = DceRpcTransport::new(server_write);
        while let Ok(pdu) = from_client.read_pdu().await {
            let mut bytes = pdu.to_vec();
            if bytes[2] == PacketType::Request as u8 && bytes.len() > 24 {
                bytes[24] ^= 0x01;
            }
            if to_server.write_pdu(&bytes).await.is_err() {
                break;
            }
        }
    });
    addr
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_modified_request_detected() {
    init_logging();
    let server = start_secure_server(DceRpcServerConfig::default()).await;
    let proxy = tampering_proxy(server.addr).await;

    let client = connect_secure(proxy, SECRET, AuthLevel::PktIntegrity)
        .await
        .unwrap();
    let result = client.call(0, Bytes::from_static(b"tamper with me")).await;
    match result {
        Err(RpcError::Fault(status)) => assert_eq!(status, FaultStatus::SecPkgError as u32),
        Err(RpcError::ConnectionClosed) => {}
        other => panic!("modified request was accepted: {:?}", other),
    }

    // the server drops a connection that failed verification
    let mut closed = false;
    for _ in 0..50 {
        if client.is_closed() {
            closed = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(closed);
}
