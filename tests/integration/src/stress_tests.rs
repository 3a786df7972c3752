//! Stress Tests - Multi-threading at Large Scale
//!
//! These tests exercise race conditions and concurrency issues by:
//! - Running many concurrent clients against a single server
//! - Multiplexing many outstanding calls over one connection
//! - Testing data integrity under load
//! - Checking server bookkeeping once the load is gone

mod common;

use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use futures::future::join_all;
use tokio::sync::Barrier;

use common::*;
use dcerpc::{DceRpcServerConfig, RpcError};

/// Test: High concurrency with many simultaneous clients
/// This tests race conditions in connection handling and request processing
#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn test_high_concurrency_many_clients() {
    init_logging();

    const NUM_CLIENTS: usize = 50;
    const REQUESTS_PER_CLIENT: usize = 100;

    let server = start_echo_server().await;
    let addr = server.addr;
    let stats = Arc::new(ConcurrentStats::new());
    let barrier = Arc::new(Barrier::new(NUM_CLIENTS));

    let start = Instant::now();
    let mut client_handles = Vec::new();
    for client_id in 0..NUM_CLIENTS {
        let stats = stats.clone();
        let barrier = barrier.clone();

        client_handles.push(tokio::spawn(async move {
            // Wait for all clients to be ready
            barrier.wait().await;

            let client = match connect_client(addr, ECHO_UUID, ECHO_VERSION).await {
                Ok(c) => c,
                Err(e) => {
                    eprintln!("Client {} failed to connect: {}", client_id, e);
                    stats.record_failure();
                    return;
                }
            };

            for req_id in 0..REQUESTS_PER_CLIENT {
                let payload = Bytes::from(format!("client_{}_request_{}", client_id, req_id));
                let call_start = Instant::now();
                match client.call(0, payload.clone()).await {
                    Ok(response) if response == payload => stats.record_success(call_start.elapsed()),
                    Ok(_) => {
                        eprintln!("Data mismatch for client {} request {}", client_id, req_id);
                        stats.record_failure();
                    }
                    Err(e) => {
                        eprintln!("Client {} request {} failed: {}", client_id, req_id, e);
                        stats.record_failure();
                    }
                }
            }
        }));
    }

    for handle in client_handles {
        handle.await.unwrap();
    }
    stats.print_summary("many clients", start.elapsed());

    assert_eq!(stats.failures(), 0);
    assert_eq!(stats.successes(), (NUM_CLIENTS * REQUESTS_PER_CLIENT) as u64);
    let snapshot = server.server.stats().snapshot();
    assert_eq!(snapshot.requests_processed, (NUM_CLIENTS * REQUESTS_PER_CLIENT) as u64);
    assert_eq!(snapshot.connections_accepted, NUM_CLIENTS as u64);
}

/// Test: Many outstanding calls multiplexed on one association, answered
/// out of order
#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn test_multiplexed_calls_one_connection() {
    init_logging();

    const CALLS: usize = 200;

    let server = start_echo_server().await;
    let client = connect_client(server.addr, ECHO_UUID, ECHO_VERSION)
        .await
        .unwrap();

    let start = Instant::now();
    let calls = (0..CALLS).map(|i| {
        let client = &client;
        async move {
            // later calls sleep less, so replies overtake each other
            let delay = ((CALLS - i) % 20) as u32;
            let mut stub = delay.to_le_bytes().to_vec();
            stub.extend_from_slice(format!("call {}", i).as_bytes());
            let stub = Bytes::from(stub);
            let reply = client.call(1, stub.clone()).await.unwrap();
            assert_eq!(reply, stub, "reply for call {} routed to the wrong caller", i);
        }
    });
    join_all(calls).await;
    println!("{} multiplexed calls in {:?}", CALLS, start.elapsed());

    assert_eq!(client.pending_calls(), 0);
}

/// Test: Mixed payload sizes from concurrent clients, with and without
/// fragmentation
#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn test_mixed_payload_sizes_under_load() {
    init_logging();

    const NUM_CLIENTS: usize = 10;
    const ROUNDS: usize = 10;
    const SIZES: [usize; 5] = [0, 1, 4_000, 16_000, 65_000];

    let server = start_server(
        DceRpcServerConfig {
            max_pdu_size: 1024 * 1024,
            ..Default::default()
        },
        vec![create_echo_interface()],
    )
    .await;
    let addr = server.addr;
    let stats = Arc::new(ConcurrentStats::new());

    let start = Instant::now();
    let workers = (0..NUM_CLIENTS).map(|client_id| {
        let stats = stats.clone();
        async move {
            let client = connect_client(addr, ECHO_UUID, ECHO_VERSION).await.unwrap();
            for round in 0..ROUNDS {
                let size = SIZES[(client_id + round) % SIZES.len()];
                let payload = pattern_payload(size);
                let call_start = Instant::now();
                match client.call(0, payload.clone()).await {
                    Ok(reply) if compute_checksum(&reply) == compute_checksum(&payload) => {
                        stats.record_success(call_start.elapsed())
                    }
                    _ => stats.record_failure(),
                }
            }
        }
    });
    join_all(workers).await;
    stats.print_summary("mixed sizes", start.elapsed());

    assert_eq!(stats.failures(), 0);
    assert_eq!(stats.successes(), (NUM_CLIENTS * ROUNDS) as u64);
}

/// Test: Connections beyond the configured limit are turned away while
/// existing ones keep working
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_connection_limit() {
    init_logging();

    let server = start_server(
        DceRpcServerConfig {
            max_connections: 2,
            ..Default::default()
        },
        vec![create_echo_interface()],
    )
    .await;

    let first = connect_client(server.addr, ECHO_UUID, ECHO_VERSION).await.unwrap();
    let second = connect_client(server.addr, ECHO_UUID, ECHO_VERSION).await.unwrap();

    let third = connect_client(server.addr, ECHO_UUID, ECHO_VERSION).await;
    assert!(matches!(
        third,
        Err(RpcError::ConnectionClosed) | Err(RpcError::Io(_))
    ));
    assert_eq!(server.server.stats().snapshot().connections_rejected, 1);

    first.null_call().await.unwrap();
    second.null_call().await.unwrap();
}

/// Test: Abandoned calls and dropped clients leave no state behind
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_churn_leaves_no_active_connections() {
    init_logging();

    const ROUNDS: usize = 20;
    let server = start_echo_server().await;

    for round in 0..ROUNDS {
        let client = connect_client(server.addr, ECHO_UUID, ECHO_VERSION)
            .await
            .unwrap();
        // start a slow call and walk away from it
        let pending = client
            .begin(0, 1, Bytes::copy_from_slice(&10_000u32.to_le_bytes()))
            .await
            .unwrap();
        drop(pending);
        client.call(0, Bytes::from(format!("round {}", round))).await.unwrap();
        client.close().await;
    }

    let mut active = u64::MAX;
    for _ in 0..100 {
        active = server.server.stats().snapshot().connections_active;
        if active == 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(active, 0);
}
