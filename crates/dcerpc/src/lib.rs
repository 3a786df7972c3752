//! DCE RPC (MS-RPC) client and server implementation
//!
//! This crate provides a wire-compatible implementation of connection-oriented
//! DCE RPC as specified in the DCE 1.1 RPC specification and MS-RPCE.
//!
//! # Features
//!
//! - PDU encoding and decoding for bind, alter_context, request, response,
//!   fault and the control PDUs
//! - Fragmentation and bounded reassembly of large calls
//! - Presentation context negotiation with version-aware interface lookup
//! - Pluggable security providers with per-PDU signing and sealing
//! - Multiplexed async client and server using Tokio
//! - Typed dispatch through [`ServerHandle`] with per-connection context
//!   handles
//!
//! # Example
//!
//! ## TCP Server
//!
//! ```no_run
//! use dcerpc::{DceRpcServer, InterfaceBuilder};
//! use bytes::Bytes;
//!
//! #[tokio::main]
//! async fn main() {
//!     // Define an interface with UUID
//!     let interface = InterfaceBuilder::new(
//!         "12345678-1234-1234-1234-123456789012",
//!         1,
//!         0,
//!     )
//!     .unwrap()
//!     // Operation 0: null procedure
//!     .operation(0, |_args| async { Ok(Bytes::new()) })
//!     // Operation 1: echo
//!     .operation(1, |args: Bytes| async move { Ok(args) })
//!     .build();
//!
//!     let server = DceRpcServer::new();
//!     server.register_interface(interface).await;
//!
//!     // Run server on port 12345
//!     server.run("127.0.0.1:12345".parse().unwrap()).await.unwrap();
//! }
//! ```
//!
//! ## TCP Client
//!
//! ```no_run
//! use dcerpc::{DceRpcClient, SyntaxId, Uuid};
//! use bytes::Bytes;
//!
//! #[tokio::main]
//! async fn main() {
//!     // Create interface syntax ID
//!     let interface = SyntaxId::new(
//!         Uuid::parse("12345678-1234-1234-1234-123456789012").unwrap(),
//!         1,
//!         0,
//!     );
//!
//!     let client = DceRpcClient::connect(
//!         "127.0.0.1:12345".parse().unwrap(),
//!         interface,
//!     ).await.unwrap();
//!
//!     // Call null procedure
//!     client.null_call().await.unwrap();
//!
//!     // Call operation 1 with arguments
//!     let result = client.call(1, Bytes::from("hello")).await.unwrap();
//!     assert_eq!(result.as_ref(), b"hello");
//! }
//! ```
//!
//! ## Authenticated Client
//!
//! ```no_run
//! use std::sync::Arc;
//! use dcerpc::{AuthLevel, DceRpcClient, SecurityConfig, SharedKeyProvider, SyntaxId, Uuid};
//!
//! #[tokio::main]
//! async fn main() {
//!     let interface = SyntaxId::new(
//!         Uuid::parse("12345678-1234-1234-1234-123456789012").unwrap(),
//!         1,
//!         0,
//!     );
//!     let provider = Arc::new(SharedKeyProvider::new(b"correct horse".to_vec()));
//!
//!     let client = DceRpcClient::builder(interface)
//!         .security(SecurityConfig::new(provider, AuthLevel::PktPrivacy))
//!         .connect("127.0.0.1:12345".parse().unwrap())
//!         .await
//!         .unwrap();
//!     client.null_call().await.unwrap();
//! }
//! ```

pub mod error;

// DCE RPC modules (connection-oriented)
pub mod dcerpc;
pub mod dcerpc_client;
pub mod dcerpc_dispatch;
pub mod dcerpc_server;
pub mod dcerpc_transport;
pub mod fragmentation;

// Security modules
pub mod security;
pub mod shared_key;

// Re-export error types
pub use error::{Result, RpcError};

// DCE RPC exports
pub use dcerpc::{
    // PDU structures
    AlterContextPdu,
    AlterContextRespPdu,
    Auth3Pdu,
    BindAckPdu,
    BindNakPdu,
    BindPdu,
    CharRep,
    ContextElement,
    ContextResult,
    ControlPdu,
    DataRepresentation,
    FaultPdu,
    FaultStatus,
    FloatRep,
    // Data representation
    IntRep,
    PacketFlags,
    PacketType,
    // PDU types
    Pdu,
    PduHeader,
    PresentationResult,
    ProviderReason,
    RejectReason,
    RequestPdu,
    ResponsePdu,
    SyntaxId,
    // Supporting types
    Uuid,
    // Constants
    DCE_RPC_VERSION,
    DCE_RPC_VERSION_MINOR,
    DEFAULT_MAX_FRAG,
    NDR_SYNTAX_UUID,
    NDR_SYNTAX_VERSION,
    NDR_TRANSFER_SYNTAX,
};
pub use dcerpc_client::{
    BindingContext, BindingState, DceRpcClient, DceRpcClientBuilder, PendingCall,
    DEFAULT_CALL_TIMEOUT,
};
pub use dcerpc_dispatch::{
    CallContext, ContextHandleTable, DelegatingHandle, Interface, InterfaceBuilder,
    InterfaceRegistry, NoOperation, Operation, OperationHandler, ServerHandle,
};
pub use dcerpc_server::{
    DceRpcServer, DceRpcServerConfig, ServerStats, ServerStatsSnapshot, MIN_FRAG_SIZE,
};
pub use dcerpc_transport::{DceRpcTransport, DEFAULT_MAX_PDU_SIZE};
pub use fragmentation::{
    FragmentGenerator, Reassembler, DEFAULT_MAX_FRAGMENTED_CALLS, DEFAULT_MAX_REASSEMBLY_BYTES,
};

// Security exports
pub use security::{
    AuthLevel, AuthSession, AuthStep, AuthType, AuthVerifier, ProtectionLevel, Role,
    SecurityConfig, SecurityContext, SecurityProvider, SecurityState,
};
pub use shared_key::SharedKeyProvider;

// NDR types used in dispatch signatures
pub use midl_ndr::{ContextHandle, NdrDecode, NdrEncode, NdrReader, NdrWriter};
