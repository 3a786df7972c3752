//! Binding Tests - Association and Presentation Context Negotiation
//!
//! These tests exercise:
//! - bind / bind_ack over TCP and the context ids the client assigns
//! - alter_context for a second interface on one association
//! - Rejections for unknown interfaces and unsupported versions
//! - Fragment size negotiation

mod common;

use bytes::Bytes;

use common::*;
use dcerpc::{
    AlterContextPdu, BindPdu, BindingState, ContextElement, DceRpcClient, DceRpcServerConfig,
    DceRpcTransport, InterfaceBuilder, Pdu, RequestPdu, RpcError, NDR_TRANSFER_SYNTAX,
};
use tokio::net::TcpStream;

const SECOND_UUID: &str = "5ec0dd1e-0000-4000-8000-00000000beef";
const V3_UUID: &str = "3a3a3a3a-0003-4000-8000-000000000003";

fn v3_interface() -> dcerpc::Interface {
    InterfaceBuilder::new(V3_UUID, 3, 0)
        .unwrap()
        .operation(0, |_args| async { Ok(Bytes::from_static(b"v3")) })
        .build()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_bind_ack_assigns_fresh_context() {
    init_logging();
    let server = start_server(
        DceRpcServerConfig::default(),
        vec![v3_interface(), create_echo_interface()],
    )
    .await;

    let stream = TcpStream::connect(server.addr).await.unwrap();
    let mut transport = DceRpcTransport::new(stream);
    transport
        .write_pdu_encoded(&Pdu::Bind(BindPdu::new(1, syntax(V3_UUID, (3, 0)))))
        .await
        .unwrap();

    let ack = match transport.read_pdu_decoded().await.unwrap() {
        Pdu::BindAck(ack) => ack,
        other => panic!("expected bind_ack, got {:?}", other),
    };
    assert_eq!(ack.header.call_id, 1);
    assert_ne!(ack.assoc_group_id, 0);
    assert_eq!(ack.results.len(), 1);
    assert!(ack.results[0].is_accepted());
    assert_eq!(ack.results[0].transfer_syntax, NDR_TRANSFER_SYNTAX);
    println!("✓ bind_ack accepted v3.0 on context 0, assoc group {}", ack.assoc_group_id);

    // a second presentation context on the same association
    transport
        .write_pdu_encoded(&Pdu::AlterContext(AlterContextPdu::new(
            2,
            vec![ContextElement::new(
                1,
                syntax(ECHO_UUID, ECHO_VERSION),
                NDR_TRANSFER_SYNTAX,
            )],
        )))
        .await
        .unwrap();
    match transport.read_pdu_decoded().await.unwrap() {
        Pdu::AlterContextResp(resp) => {
            assert_eq!(resp.assoc_group_id, ack.assoc_group_id);
            assert_eq!(resp.results.len(), 1);
            assert!(resp.results[0].is_accepted());
        }
        other => panic!("expected alter_context_resp, got {:?}", other),
    }

    // each context routes to its own interface
    let mut on_v3 = RequestPdu::new(3, 0, Bytes::new());
    on_v3.context_id = 0;
    let mut on_echo = RequestPdu::new(4, 0, Bytes::from_static(b"bound"));
    on_echo.context_id = 1;
    for request in [on_v3, on_echo] {
        transport
            .write_pdu_encoded(&Pdu::Request(request))
            .await
            .unwrap();
    }
    let mut replies = Vec::new();
    for _ in 0..2 {
        match transport.read_pdu_decoded().await.unwrap() {
            Pdu::Response(resp) => replies.push((resp.header.call_id, resp.stub_data)),
            other => panic!("expected response, got {:?}", other),
        }
    }
    replies.sort_by_key(|(call_id, _)| *call_id);
    assert_eq!(replies[0].1.as_ref(), b"v3");
    assert_eq!(replies[1].1.as_ref(), b"bound");

    // the high-level client hands out a fresh id for the added context
    let client = DceRpcClient::builder(syntax(V3_UUID, (3, 0)))
        .connect(server.addr)
        .await
        .unwrap();
    let added = client
        .alter_context(syntax(ECHO_UUID, ECHO_VERSION))
        .await
        .unwrap();
    assert_eq!(client.default_context(), Some(0));
    assert_ne!(added.context_id, 0);
    assert!(added.is_bound());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_client_bind_and_alter_context() {
    init_logging();
    let second = InterfaceBuilder::new(SECOND_UUID, 2, 1)
        .unwrap()
        .operation(0, |_args| async { Ok(Bytes::from_static(b"second")) })
        .build();
    let server = start_server(
        DceRpcServerConfig::default(),
        vec![create_echo_interface(), second],
    )
    .await;

    let client = connect_client(server.addr, ECHO_UUID, ECHO_VERSION)
        .await
        .unwrap();
    let first = client.binding(0).unwrap();
    assert_eq!(first.state, BindingState::Bound);
    assert_eq!(client.default_context(), Some(0));
    assert_ne!(client.assoc_group_id(), 0);

    // minor 0 is satisfied by the registered minor 1
    let binding = client.alter_context(syntax(SECOND_UUID, (2, 0))).await.unwrap();
    assert_eq!(binding.context_id, 1);
    assert!(binding.is_bound());

    let reply = client.invoke(1, 0, Bytes::new()).await.unwrap();
    assert_eq!(reply.as_ref(), b"second");
    let echo = client.invoke(0, 0, Bytes::from_static(b"first")).await.unwrap();
    assert_eq!(echo.as_ref(), b"first");
    println!("✓ two interfaces served over one association");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_unknown_interface_rejected() {
    init_logging();
    let server = start_echo_server().await;

    let result = connect_client(server.addr, SECOND_UUID, (1, 0)).await;
    assert!(
        matches!(result, Err(RpcError::ContextRejected { result: 2, reason: 1 })),
        "unexpected result: {:?}",
        result.err()
    );

    // a newer minor than the server offers is not satisfied
    let result = connect_client(server.addr, ECHO_UUID, (1, 5)).await;
    assert!(matches!(result, Err(RpcError::ContextRejected { .. })));

    // and neither is another major
    let result = connect_client(server.addr, ECHO_UUID, (2, 0)).await;
    assert!(matches!(result, Err(RpcError::ContextRejected { .. })));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_fragment_sizes_negotiated_down() {
    init_logging();
    let server = start_server(
        DceRpcServerConfig {
            max_xmit_frag: 2048,
            max_recv_frag: 3000,
            ..Default::default()
        },
        vec![create_echo_interface()],
    )
    .await;

    let client = DceRpcClient::builder(syntax(ECHO_UUID, ECHO_VERSION))
        .max_frag(4096, 4096)
        .connect(server.addr)
        .await
        .unwrap();
    // the client sends what the server can receive and vice versa
    assert_eq!(client.max_xmit_frag(), 3000);
    assert_eq!(client.max_recv_frag(), 2048);

    let payload = pattern_payload(20_000);
    let echoed = client.call(0, payload.clone()).await.unwrap();
    assert_eq!(compute_checksum(&echoed), compute_checksum(&payload));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_server_shutdown_closes_clients() {
    init_logging();
    let server = start_echo_server().await;
    let client = connect_client(server.addr, ECHO_UUID, ECHO_VERSION)
        .await
        .unwrap();
    client.null_call().await.unwrap();

    server.shutdown().await.unwrap();

    // the shutdown PDU tears the association down
    let mut closed = false;
    for _ in 0..50 {
        if client.is_closed() {
            closed = true;
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    }
    assert!(closed, "client never saw the server shut down");
    assert!(client.null_call().await.is_err());
}
