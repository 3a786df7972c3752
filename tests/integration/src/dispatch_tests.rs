//! Dispatch Tests - Operation Routing, Faults and Context Handles
//!
//! These tests exercise:
//! - Out of range opnums faulting without dropping the connection
//! - Context handles scoped to the connection that opened them
//! - Typed ServerHandle dispatch and interface inheritance
//! - Cancellation of calls in progress

mod common;

use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;

use common::*;
use dcerpc::{
    CallContext, ContextHandle, DceRpcClient, DceRpcServer, DceRpcServerConfig, DelegatingHandle,
    FaultStatus, InterfaceBuilder, NdrEncode, NdrReader, NdrWriter, NoOperation, Operation,
    RpcError, ServerHandle,
};

const WIDE_UUID: &str = "0b5e55ed-1111-4222-8333-444455556666";
const COUNTER_UUID: &str = "c0c0c0c0-aaaa-4bbb-8ccc-dddddddddddd";
const STATUS_OPNUM: u16 = 184;

/// An interface whose highest opnum is 184
fn wide_interface() -> dcerpc::Interface {
    InterfaceBuilder::new(WIDE_UUID, 1, 0)
        .unwrap()
        .operation(0, |args| async move { Ok(args) })
        .operation(STATUS_OPNUM, |_args| async {
            // a business status rides in the stub, not as a fault
            Ok(Bytes::copy_from_slice(&0xc000_0022u32.to_le_bytes()))
        })
        .build()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_opnum_out_of_range_faults_and_connection_survives() {
    init_logging();
    let server = start_server(DceRpcServerConfig::default(), vec![wide_interface()]).await;
    let client = connect_client(server.addr, WIDE_UUID, (1, 0)).await.unwrap();

    let result = client.call(250, Bytes::from_static(b"anything")).await;
    match result {
        Err(RpcError::Fault(status)) => assert_eq!(status, 0x1c01_0002),
        other => panic!("expected nca_s_op_rng_error, got {:?}", other),
    }
    assert!(!client.is_closed());

    let echoed = client.call(0, Bytes::from_static(b"still here")).await.unwrap();
    assert_eq!(echoed.as_ref(), b"still here");

    let status = client.call(STATUS_OPNUM, Bytes::new()).await.unwrap();
    assert_eq!(status.as_ref(), &0xc000_0022u32.to_le_bytes());
    println!("✓ opnum 250 faulted, connection kept serving");
}

/// Server-side state behind a context handle
struct Counter {
    value: AtomicI32,
}

/// `void Open([out] context_handle* h)`
#[derive(Default)]
struct Open {
    handle: ContextHandle,
}

impl Operation for Open {
    fn unmarshal_request(&mut self, _r: &mut NdrReader) -> dcerpc::Result<()> {
        Ok(())
    }

    fn marshal_response(&self, w: &mut NdrWriter) -> dcerpc::Result<()> {
        w.write_data(&self.handle)?;
        Ok(())
    }
}

/// `long Increment([in] context_handle h, [in] long by)`
#[derive(Default)]
struct Increment {
    handle: ContextHandle,
    by: i32,
    result: i32,
}

impl Operation for Increment {
    fn unmarshal_request(&mut self, r: &mut NdrReader) -> dcerpc::Result<()> {
        self.handle = r.read_data()?;
        self.by = r.read_data()?;
        Ok(())
    }

    fn marshal_response(&self, w: &mut NdrWriter) -> dcerpc::Result<()> {
        w.write_data(&self.result)?;
        Ok(())
    }
}

/// `void Close([in, out] context_handle* h)`
#[derive(Default)]
struct Close {
    handle: ContextHandle,
}

impl Operation for Close {
    fn unmarshal_request(&mut self, r: &mut NdrReader) -> dcerpc::Result<()> {
        self.handle = r.read_data()?;
        Ok(())
    }

    fn marshal_response(&self, w: &mut NdrWriter) -> dcerpc::Result<()> {
        w.write_data(&self.handle)?;
        Ok(())
    }
}

/// Client side of `Open`: no [in] arguments
struct OpenArgs;

impl NdrEncode for OpenArgs {
    fn ndr_encode(&self, _w: &mut NdrWriter) -> midl_ndr::Result<()> {
        Ok(())
    }
}

/// Client side of `Increment`
struct IncrementArgs {
    handle: ContextHandle,
    by: i32,
}

impl NdrEncode for IncrementArgs {
    fn ndr_encode(&self, w: &mut NdrWriter) -> midl_ndr::Result<()> {
        w.write(&self.handle)?;
        w.write(&self.by)
    }

    fn ndr_align() -> usize {
        4
    }
}

fn increment(handle: ContextHandle, by: i32) -> IncrementArgs {
    IncrementArgs { handle, by }
}

struct CounterService;

#[async_trait]
impl ServerHandle for CounterService {
    async fn server_handle(
        &self,
        ctx: &CallContext,
        opnum: u16,
        r: &mut NdrReader,
    ) -> dcerpc::Result<Box<dyn Operation>> {
        match opnum {
            0 => {
                let mut op = Open::default();
                op.unmarshal_request(r)?;
                op.handle = ctx.handles.open(Counter {
                    value: AtomicI32::new(0),
                })?;
                Ok(Box::new(op))
            }
            1 => {
                let mut op = Increment::default();
                op.unmarshal_request(r)?;
                let counter = ctx.handles.get::<Counter>(&op.handle)?;
                op.result = counter.value.fetch_add(op.by, Ordering::SeqCst) + op.by;
                Ok(Box::new(op))
            }
            2 => {
                let mut op = Close::default();
                op.unmarshal_request(r)?;
                ctx.handles.close(&op.handle)?;
                op.handle = ContextHandle::NIL;
                Ok(Box::new(op))
            }
            3 => Ok(Box::new(NoOperation)),
            other => Err(RpcError::UnknownOperation(other)),
        }
    }
}

async fn start_counter_server() -> TestServer {
    let server = DceRpcServer::new();
    server
        .register_server(syntax(COUNTER_UUID, (1, 0)), Arc::new(CounterService))
        .await;
    start_configured(server, Vec::new()).await
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_context_handle_from_other_connection_is_invalid() {
    init_logging();
    let server = start_counter_server().await;
    let owner = connect_client(server.addr, COUNTER_UUID, (1, 0)).await.unwrap();
    let intruder = connect_client(server.addr, COUNTER_UUID, (1, 0)).await.unwrap();

    let handle: ContextHandle = owner.call_ndr(0, &OpenArgs).await.unwrap();
    assert!(!handle.is_nil());
    let value: i32 = owner.call_ndr(1, &increment(handle, 5)).await.unwrap();
    assert_eq!(value, 5);

    let result: dcerpc::Result<i32> = intruder.call_ndr(1, &increment(handle, 1)).await;
    match result {
        Err(RpcError::Fault(status)) => assert_eq!(status, FaultStatus::InvalidHandle as u32),
        other => panic!("expected invalid handle fault, got {:?}", other),
    }
    assert!(!intruder.is_closed());

    // the owner's handle and connection are untouched
    let value: i32 = owner.call_ndr(1, &increment(handle, 2)).await.unwrap();
    assert_eq!(value, 7);

    let closed: ContextHandle = owner.call_ndr(2, &handle).await.unwrap();
    assert!(closed.is_nil());
    let result: dcerpc::Result<i32> = owner.call_ndr(1, &increment(handle, 1)).await;
    assert!(matches!(result, Err(RpcError::Fault(6))));
    println!("✓ foreign and closed handles fault with status 6");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_handles_released_when_connection_closes() {
    init_logging();
    let server = start_counter_server().await;

    let first = connect_client(server.addr, COUNTER_UUID, (1, 0)).await.unwrap();
    let handle: ContextHandle = first.call_ndr(0, &OpenArgs).await.unwrap();
    first.close().await;
    drop(first);

    let second = connect_client(server.addr, COUNTER_UUID, (1, 0)).await.unwrap();
    let result: dcerpc::Result<i32> = second.call_ndr(1, &increment(handle, 1)).await;
    assert!(matches!(result, Err(RpcError::Fault(6))));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_not_used_on_wire_opnum_returns_empty() {
    init_logging();
    let server = start_counter_server().await;
    let client = connect_client(server.addr, COUNTER_UUID, (1, 0)).await.unwrap();
    let reply = client.call(3, Bytes::new()).await.unwrap();
    assert!(reply.is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_delegating_handle_serves_base_and_derived() {
    init_logging();
    const DERIVED_UUID: &str = "de1e6a7e-0000-4000-8000-000000000001";

    let base: Arc<dyn ServerHandle> = Arc::new(CounterService);
    let own = InterfaceBuilder::new(DERIVED_UUID, 1, 0)
        .unwrap()
        .operation(4, |_args| async { Ok(Bytes::from_static(b"derived")) })
        .build();
    let derived = DelegatingHandle::new(base, 4, Arc::new(own));

    let server = DceRpcServer::new();
    server
        .register_server(syntax(DERIVED_UUID, (1, 0)), Arc::new(derived))
        .await;
    let server = start_configured(server, Vec::new()).await;

    let client = connect_client(server.addr, DERIVED_UUID, (1, 0)).await.unwrap();
    let handle: ContextHandle = client.call_ndr(0, &OpenArgs).await.unwrap();
    let value: i32 = client.call_ndr(1, &increment(handle, 3)).await.unwrap();
    assert_eq!(value, 3);
    let reply = client.call(4, Bytes::new()).await.unwrap();
    assert_eq!(reply.as_ref(), b"derived");
    assert!(matches!(
        client.call(5, Bytes::new()).await,
        Err(RpcError::Fault(0x1c01_0002))
    ));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_cancel_in_flight_call() {
    init_logging();
    let server = start_echo_server().await;
    let client = connect_client(server.addr, ECHO_UUID, ECHO_VERSION)
        .await
        .unwrap();

    let slow = client
        .begin(0, 1, Bytes::copy_from_slice(&60_000u32.to_le_bytes()))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    slow.cancel().await.unwrap();

    // the connection keeps serving after the cancel
    let reply = client.call(0, Bytes::from_static(b"after")).await.unwrap();
    assert_eq!(reply.as_ref(), b"after");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_call_timeout_orphans_call() {
    init_logging();
    let server = start_echo_server().await;
    let client = DceRpcClient::builder(syntax(ECHO_UUID, ECHO_VERSION))
        .timeout(Duration::from_millis(200))
        .connect(server.addr)
        .await
        .unwrap();

    let result = client
        .call(1, Bytes::copy_from_slice(&5_000u32.to_le_bytes()))
        .await;
    assert!(matches!(result, Err(RpcError::Timeout)));
    assert_eq!(client.pending_calls(), 0);

    let reply = client.call(0, Bytes::from_static(b"next")).await.unwrap();
    assert_eq!(reply.as_ref(), b"next");
}
