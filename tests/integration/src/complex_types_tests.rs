//! Complex Types Tests - Typed NDR Calls End to End
//!
//! These tests exercise typed stubs over a real connection:
//! - Conformant arrays of structures holding unique pointers
//! - Encapsulated unions, including an unknown discriminant
//! - Big-endian callers against a little-endian server
//! - Malformed stubs faulting as bad stub data

mod common;

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;

use common::*;
use dcerpc::{
    CallContext, DataRepresentation, DceRpcClient, DceRpcServer, FaultStatus, NdrDecode,
    NdrEncode, NdrReader, NdrWriter, Operation, RpcError, ServerHandle,
};
use midl_ndr::{invalid_discriminant, ConformantArray, NdrUnion, NdrWString, UniquePtr, Union};

const INVENTORY_UUID: &str = "1a2b3c4d-5e6f-4a0b-8c1d-2e3f4a5b6c7d";
const INVENTORY_VERSION: (u16, u16) = (2, 0);

/// ```idl
/// typedef struct {
///     unsigned long id;
///     [unique, string] wchar_t* name;
///     double weight;
/// } ITEM;
/// ```
#[derive(Debug, Clone, PartialEq, Default)]
struct Item {
    id: u32,
    name: UniquePtr<NdrWString>,
    weight: f64,
}

impl NdrEncode for Item {
    fn ndr_encode(&self, w: &mut NdrWriter) -> midl_ndr::Result<()> {
        w.write(&self.id)?;
        w.write(&self.name)?;
        w.write(&self.weight)
    }

    fn ndr_encode_deferred(&self, w: &mut NdrWriter) -> midl_ndr::Result<()> {
        w.write_deferred(&self.name)
    }

    fn ndr_align() -> usize {
        8
    }
}

impl NdrDecode for Item {
    fn ndr_decode(r: &mut NdrReader) -> midl_ndr::Result<Self> {
        Ok(Self {
            id: r.read()?,
            name: r.read()?,
            weight: r.read()?,
        })
    }

    fn ndr_decode_deferred(&mut self, r: &mut NdrReader) -> midl_ndr::Result<()> {
        r.read_deferred(&mut self.name)
    }

    fn ndr_align() -> usize {
        8
    }
}

/// ```idl
/// typedef struct {
///     unsigned long count;
///     double total_weight;
///     [unique, string] wchar_t* heaviest;
/// } SUMMARY;
/// ```
#[derive(Debug, Clone, PartialEq, Default)]
struct Summary {
    count: u32,
    total_weight: f64,
    heaviest: UniquePtr<NdrWString>,
}

impl NdrEncode for Summary {
    fn ndr_encode(&self, w: &mut NdrWriter) -> midl_ndr::Result<()> {
        w.write(&self.count)?;
        w.write(&self.total_weight)?;
        w.write(&self.heaviest)
    }

    fn ndr_encode_deferred(&self, w: &mut NdrWriter) -> midl_ndr::Result<()> {
        w.write_deferred(&self.heaviest)
    }

    fn ndr_align() -> usize {
        8
    }
}

impl NdrDecode for Summary {
    fn ndr_decode(r: &mut NdrReader) -> midl_ndr::Result<Self> {
        Ok(Self {
            count: r.read()?,
            total_weight: r.read()?,
            heaviest: r.read()?,
        })
    }

    fn ndr_decode_deferred(&mut self, r: &mut NdrReader) -> midl_ndr::Result<()> {
        r.read_deferred(&mut self.heaviest)
    }

    fn ndr_align() -> usize {
        8
    }
}

/// ```idl
/// typedef [switch_type(unsigned long)] union {
///     [case(1)] double radius;
///     [case(2)] struct { unsigned long w; unsigned long h; } rect;
/// } SHAPE;
/// ```
#[derive(Debug, Clone, PartialEq)]
enum Shape {
    Circle(f64),
    Rect(u32, u32),
}

impl NdrUnion for Shape {
    fn discriminant(&self) -> u32 {
        match self {
            Shape::Circle(_) => 1,
            Shape::Rect(..) => 2,
        }
    }

    fn arm_align() -> usize {
        8
    }

    fn encode_arm(&self, w: &mut NdrWriter) -> midl_ndr::Result<()> {
        match self {
            Shape::Circle(radius) => w.write(radius),
            Shape::Rect(width, height) => {
                w.write(width)?;
                w.write(height)
            }
        }
    }

    fn decode_arm(tag: u32, r: &mut NdrReader) -> midl_ndr::Result<Self> {
        match tag {
            1 => Ok(Shape::Circle(r.read()?)),
            2 => Ok(Shape::Rect(r.read()?, r.read()?)),
            other => invalid_discriminant(other),
        }
    }
}

/// `void Summarize([in] ITEM_LIST* items, [out] SUMMARY* summary)`
#[derive(Default)]
struct Summarize {
    items: ConformantArray<Item>,
    summary: Summary,
}

impl Operation for Summarize {
    fn unmarshal_request(&mut self, r: &mut NdrReader) -> dcerpc::Result<()> {
        self.items = r.read_data()?;
        Ok(())
    }

    fn marshal_response(&self, w: &mut NdrWriter) -> dcerpc::Result<()> {
        w.write_data(&self.summary)?;
        Ok(())
    }
}

/// `double Area([in] SHAPE shape)`
struct Area {
    shape: Union<Shape>,
    area: f64,
}

impl Operation for Area {
    fn unmarshal_request(&mut self, r: &mut NdrReader) -> dcerpc::Result<()> {
        self.shape = r.read_data()?;
        Ok(())
    }

    fn marshal_response(&self, w: &mut NdrWriter) -> dcerpc::Result<()> {
        w.write_data(&self.area)?;
        Ok(())
    }
}

struct Inventory;

#[async_trait]
impl ServerHandle for Inventory {
    async fn server_handle(
        &self,
        _ctx: &CallContext,
        opnum: u16,
        r: &mut NdrReader,
    ) -> dcerpc::Result<Box<dyn Operation>> {
        match opnum {
            0 => {
                let mut op = Summarize::default();
                op.unmarshal_request(r)?;
                let items = &op.items.elements;
                let heaviest = items
                    .iter()
                    .max_by(|a, b| a.weight.total_cmp(&b.weight))
                    .and_then(|item| item.name.get().cloned());
                op.summary = Summary {
                    count: items.len() as u32,
                    total_weight: items.iter().map(|item| item.weight).sum(),
                    heaviest: heaviest.into(),
                };
                Ok(Box::new(op))
            }
            1 => {
                let mut op = Area {
                    shape: Union(Shape::Circle(0.0)),
                    area: 0.0,
                };
                op.unmarshal_request(r)?;
                op.area = match op.shape.0 {
                    Shape::Circle(radius) => std::f64::consts::PI * radius * radius,
                    Shape::Rect(width, height) => width as f64 * height as f64,
                };
                Ok(Box::new(op))
            }
            other => Err(RpcError::UnknownOperation(other)),
        }
    }
}

async fn start_inventory_server() -> TestServer {
    let server = DceRpcServer::new();
    server
        .register_server(syntax(INVENTORY_UUID, INVENTORY_VERSION), Arc::new(Inventory))
        .await;
    start_configured(server, Vec::new()).await
}

fn items() -> ConformantArray<Item> {
    ConformantArray::new(vec![
        Item {
            id: 1,
            name: UniquePtr::new(NdrWString::new("anvil")),
            weight: 50.5,
        },
        Item {
            id: 2,
            name: UniquePtr::null(),
            weight: 0.25,
        },
        Item {
            id: 3,
            name: UniquePtr::new(NdrWString::new("feather ✓")),
            weight: 0.01,
        },
    ])
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_array_of_structures_with_pointers() {
    init_logging();
    let server = start_inventory_server().await;
    let client = connect_client(server.addr, INVENTORY_UUID, INVENTORY_VERSION)
        .await
        .unwrap();

    let summary: Summary = client.call_ndr(0, &items()).await.unwrap();
    assert_eq!(summary.count, 3);
    assert!((summary.total_weight - 50.76).abs() < 1e-9);
    assert_eq!(summary.heaviest.get().map(|name| name.as_str()), Some("anvil"));

    let empty: Summary = client
        .call_ndr(0, &ConformantArray::<Item>::new(Vec::new()))
        .await
        .unwrap();
    assert_eq!(empty.count, 0);
    assert!(empty.heaviest.is_null());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_big_endian_caller() {
    init_logging();
    let server = start_inventory_server().await;
    let client = DceRpcClient::builder(syntax(INVENTORY_UUID, INVENTORY_VERSION))
        .data_representation(DataRepresentation::big_endian())
        .connect(server.addr)
        .await
        .unwrap();

    let summary: Summary = client.call_ndr(0, &items()).await.unwrap();
    assert_eq!(summary.count, 3);
    assert_eq!(summary.heaviest.get().map(|name| name.as_str()), Some("anvil"));

    let area: f64 = client.call_ndr(1, &Union(Shape::Rect(6, 7))).await.unwrap();
    assert_eq!(area, 42.0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_union_arms_and_unknown_discriminant() {
    init_logging();
    let server = start_inventory_server().await;
    let client = connect_client(server.addr, INVENTORY_UUID, INVENTORY_VERSION)
        .await
        .unwrap();

    let area: f64 = client.call_ndr(1, &Union(Shape::Circle(2.0))).await.unwrap();
    assert!((area - 4.0 * std::f64::consts::PI).abs() < 1e-9);

    // discriminant 9 has no arm
    let mut stub = Vec::new();
    stub.extend_from_slice(&9u32.to_le_bytes());
    stub.extend_from_slice(&[0u8; 12]);
    match client.call(1, Bytes::from(stub)).await {
        Err(RpcError::Fault(status)) => assert_eq!(status, FaultStatus::InvalidTag as u32),
        other => panic!("expected invalid tag fault, got {:?}", other),
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_truncated_stub_is_bad_stub_data() {
    init_logging();
    let server = start_inventory_server().await;
    let client = connect_client(server.addr, INVENTORY_UUID, INVENTORY_VERSION)
        .await
        .unwrap();

    // a conformance of 1000 items with no items behind it
    let stub = Bytes::copy_from_slice(&1000u32.to_le_bytes());
    match client.call(0, stub).await {
        Err(RpcError::Fault(status)) => assert_eq!(status, FaultStatus::BadStubData as u32),
        other => panic!("expected bad stub data fault, got {:?}", other),
    }

    // the connection is still good for well-formed calls
    let summary: Summary = client.call_ndr(0, &items()).await.unwrap();
    assert_eq!(summary.count, 3);
}
