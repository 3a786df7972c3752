//! Fragmentation Tests - Large PDU Transfer Tests
//!
//! These tests exercise the multi-PDU fragmentation support for large data transfers:
//! - Requests exceeding max_xmit_frag
//! - Responses exceeding the negotiated receive size
//! - Reassembly limits enforced by the server
//! - Fragmentation under concurrent load

mod common;

use std::time::Instant;

use bytes::Bytes;
use futures::future::join_all;

use common::*;
use dcerpc::{
    BindPdu, DceRpcClient, DceRpcServerConfig, DceRpcTransport, FaultStatus, FragmentGenerator,
    PacketFlags, Pdu, Reassembler, RequestPdu, ResponsePdu,
};
use tokio::net::TcpStream;

const SCENARIO_STUB: usize = 70_000;
const SCENARIO_FRAG: u16 = 4096;

async fn bound_transport(addr: std::net::SocketAddr, max_frag: u16) -> DceRpcTransport<TcpStream> {
    let stream = TcpStream::connect(addr).await.unwrap();
    let mut transport = DceRpcTransport::new(stream);
    let mut bind = BindPdu::new(1, syntax(ECHO_UUID, ECHO_VERSION));
    bind.max_xmit_frag = max_frag;
    bind.max_recv_frag = max_frag;
    transport.write_pdu_encoded(&Pdu::Bind(bind)).await.unwrap();
    match transport.read_pdu_decoded().await.unwrap() {
        Pdu::BindAck(ack) => {
            assert_eq!(ack.max_xmit_frag, max_frag);
            assert_eq!(ack.max_recv_frag, max_frag);
        }
        other => panic!("expected bind_ack, got {:?}", other),
    }
    transport
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_seventy_kilobyte_call_in_eighteen_fragments() {
    init_logging();
    let server = start_server(
        DceRpcServerConfig {
            max_xmit_frag: SCENARIO_FRAG,
            max_recv_frag: SCENARIO_FRAG,
            ..Default::default()
        },
        vec![create_echo_interface()],
    )
    .await;
    let mut transport = bound_transport(server.addr, SCENARIO_FRAG).await;

    let payload = pattern_payload(SCENARIO_STUB);
    let request = RequestPdu::new(2, 0, payload.clone());
    let fragments = FragmentGenerator::fragment_request(&request, SCENARIO_FRAG).unwrap();
    assert_eq!(fragments.len(), 18);
    assert!(fragments[0].header.packet_flags.is_first_frag());
    assert!(fragments[17].header.packet_flags.is_last_frag());
    for fragment in &fragments {
        let encoded = Pdu::Request(fragment.clone()).encode().unwrap();
        assert!(encoded.len() <= SCENARIO_FRAG as usize);
        assert_eq!(fragment.alloc_hint as usize, SCENARIO_STUB);
        transport.write_pdu(&encoded).await.unwrap();
    }

    let mut reassembler: Reassembler<ResponsePdu> = Reassembler::new(1, 1 << 20);
    let mut received = 0;
    let response = loop {
        let fragment = match transport.read_pdu_decoded().await.unwrap() {
            Pdu::Response(fragment) => fragment,
            other => panic!("expected response fragment, got {:?}", other),
        };
        assert!(fragment.header.frag_length <= SCENARIO_FRAG);
        received += 1;
        if let Some(response) = reassembler.push(fragment).unwrap() {
            break response;
        }
    };

    assert_eq!(received, 18);
    assert_eq!(response.header.call_id, 2);
    assert_eq!(response.stub_data, payload);
    println!("✓ {} byte call crossed the wire as {} fragments each way", SCENARIO_STUB, received);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_large_request_through_client() {
    init_logging();
    let server = start_server(
        DceRpcServerConfig {
            max_pdu_size: 1024 * 1024,
            ..Default::default()
        },
        vec![create_echo_interface()],
    )
    .await;
    let client = DceRpcClient::builder(syntax(ECHO_UUID, ECHO_VERSION))
        .max_frag(SCENARIO_FRAG, SCENARIO_FRAG)
        .connect(server.addr)
        .await
        .unwrap();

    const REQUEST_SIZE: usize = 100_000;
    let payload = pattern_payload(REQUEST_SIZE);
    let expected = compute_checksum(&payload);

    let start = Instant::now();
    let response = client.call(0, payload).await.unwrap();
    println!("{} byte echo in {:?}", REQUEST_SIZE, start.elapsed());

    assert_eq!(response.len(), REQUEST_SIZE, "Response size mismatch");
    assert_eq!(compute_checksum(&response), expected, "Data corruption detected!");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_interleaved_fragmented_calls() {
    init_logging();
    let server = start_echo_server().await;
    let mut transport = bound_transport(server.addr, SCENARIO_FRAG).await;

    let first = pattern_payload(12_000);
    let second = Bytes::from(vec![0xab; 9_000]);
    let a = FragmentGenerator::fragment_request(&RequestPdu::new(10, 0, first.clone()), SCENARIO_FRAG)
        .unwrap();
    let b = FragmentGenerator::fragment_request(&RequestPdu::new(11, 0, second.clone()), SCENARIO_FRAG)
        .unwrap();

    // alternate fragments from both calls
    let mut a = a.into_iter();
    let mut b = b.into_iter();
    loop {
        let next_a = a.next();
        let next_b = b.next();
        if next_a.is_none() && next_b.is_none() {
            break;
        }
        for fragment in next_a.into_iter().chain(next_b) {
            transport.write_pdu_encoded(&Pdu::Request(fragment)).await.unwrap();
        }
    }

    let mut reassembler: Reassembler<ResponsePdu> = Reassembler::new(4, 1 << 20);
    let mut done = Vec::new();
    while done.len() < 2 {
        let Pdu::Response(fragment) = transport.read_pdu_decoded().await.unwrap() else {
            panic!("expected response fragment");
        };
        if let Some(response) = reassembler.push(fragment).unwrap() {
            done.push(response);
        }
    }
    done.sort_by_key(|response| response.header.call_id);
    assert_eq!(done[0].stub_data, first);
    assert_eq!(done[1].stub_data, second);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_reassembly_budget_faults_call_and_keeps_connection() {
    init_logging();
    let server = start_server(
        DceRpcServerConfig {
            max_connection_memory_budget: 8 * 1024,
            ..Default::default()
        },
        vec![create_echo_interface()],
    )
    .await;
    let mut transport = bound_transport(server.addr, SCENARIO_FRAG).await;

    let request = RequestPdu::new(5, 0, pattern_payload(20_000));
    let fragments = FragmentGenerator::fragment_request(&request, SCENARIO_FRAG).unwrap();
    // the third fragment pushes the call over budget; stop sending there
    for fragment in fragments.into_iter().take(3) {
        transport.write_pdu_encoded(&Pdu::Request(fragment)).await.unwrap();
    }
    match transport.read_pdu_decoded().await.unwrap() {
        Pdu::Fault(fault) => {
            assert_eq!(fault.header.call_id, 5);
            assert_eq!(fault.status, FaultStatus::RemoteNoMemory as u32);
            assert!(fault.did_not_execute());
        }
        other => panic!("expected fault, got {:?}", other),
    }

    transport
        .write_pdu_encoded(&Pdu::Request(RequestPdu::new(6, 0, Bytes::from_static(b"small"))))
        .await
        .unwrap();
    match transport.read_pdu_decoded().await.unwrap() {
        Pdu::Response(resp) => assert_eq!(resp.stub_data.as_ref(), b"small"),
        other => panic!("expected response, got {:?}", other),
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_middle_fragment_without_first_faults() {
    init_logging();
    let server = start_echo_server().await;
    let mut transport = bound_transport(server.addr, SCENARIO_FRAG).await;

    let mut stray = RequestPdu::new(7, 0, Bytes::from_static(b"orphan"));
    stray.header.packet_flags = PacketFlags::new();
    stray.header.packet_flags.set_last_frag();
    transport.write_pdu_encoded(&Pdu::Request(stray)).await.unwrap();

    match transport.read_pdu_decoded().await.unwrap() {
        Pdu::Fault(fault) => assert_eq!(fault.status, FaultStatus::ProtoError as u32),
        other => panic!("expected fault, got {:?}", other),
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn test_concurrent_fragmented_calls() {
    init_logging();
    const CALLS: usize = 16;
    let server = start_echo_server().await;
    let client = DceRpcClient::builder(syntax(ECHO_UUID, ECHO_VERSION))
        .max_frag(2048, 2048)
        .connect(server.addr)
        .await
        .unwrap();

    let calls = (0..CALLS).map(|i| {
        let payload = Bytes::from(vec![i as u8; 5_000 + i * 700]);
        let client = &client;
        async move {
            let response = client.call(0, payload.clone()).await.unwrap();
            assert_eq!(response, payload, "call {} corrupted", i);
        }
    });
    join_all(calls).await;
    assert_eq!(client.pending_calls(), 0);
}
