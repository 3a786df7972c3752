//! Server-side dispatch
//!
//! The contract between the runtime and generated stubs:
//!
//! - [`ServerHandle`] receives an opnum and a reader over the request stub,
//!   picks the concrete [`Operation`], unmarshals it, runs the business
//!   handler and returns the operation for the runtime to marshal.
//! - [`DelegatingHandle`] layers an interface over a base interface's
//!   opnum range.
//! - [`ContextHandleTable`] scopes server-side resources to one connection.
//! - [`InterfaceRegistry`] maps abstract syntaxes to handles.
//!
//! [`InterfaceBuilder`] covers the raw-stub case, where handlers work on
//! bytes rather than typed parameters.

use crate::dcerpc::{DataRepresentation, SyntaxId, Uuid};
use crate::error::{Result, RpcError};
use crate::security::AuthLevel;
use async_trait::async_trait;
use bytes::Bytes;
use midl_ndr::{ContextHandle, NdrReader, NdrWriter};
use parking_lot::Mutex;
use ring::rand::{SecureRandom, SystemRandom};
use std::any::Any;
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::info;

/// What a server operation knows about the call it is serving
#[derive(Clone)]
pub struct CallContext {
    pub connection_id: u64,
    pub call_id: u32,
    pub context_id: u16,
    pub opnum: u16,
    pub object: Option<Uuid>,
    pub data_rep: DataRepresentation,
    /// Context handles owned by this connection
    pub handles: Arc<ContextHandleTable>,
    pub auth_level: AuthLevel,
}

impl CallContext {
    pub fn new(connection_id: u64, handles: Arc<ContextHandleTable>) -> Self {
        Self {
            connection_id,
            call_id: 0,
            context_id: 0,
            opnum: 0,
            object: None,
            data_rep: DataRepresentation::ndr(),
            handles,
            auth_level: AuthLevel::None,
        }
    }
}

impl std::fmt::Debug for CallContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallContext")
            .field("connection_id", &self.connection_id)
            .field("call_id", &self.call_id)
            .field("context_id", &self.context_id)
            .field("opnum", &self.opnum)
            .field("object", &self.object)
            .field("auth_level", &self.auth_level)
            .finish()
    }
}

/// One invocation of an interface method.
pub trait Operation: Send {
    /// Read the [in] parameters.
    fn unmarshal_request(&mut self, r: &mut NdrReader) -> Result<()>;

    /// Write the [out] parameters and return value.
    fn marshal_response(&self, w: &mut NdrWriter) -> Result<()>;
}

/// Returned for opnums that are reserved but not used on the wire.
#[derive(Debug, Default)]
pub struct NoOperation;

impl Operation for NoOperation {
    fn unmarshal_request(&mut self, _r: &mut NdrReader) -> Result<()> {
        Ok(())
    }

    fn marshal_response(&self, _w: &mut NdrWriter) -> Result<()> {
        Ok(())
    }
}

/// Opnum dispatch entry point for one interface.
#[async_trait]
pub trait ServerHandle: Send + Sync {
    /// Run `opnum` against the request in `r`.
    ///
    /// Unknown opnums return [`RpcError::UnknownOperation`].
    async fn server_handle(
        &self,
        ctx: &CallContext,
        opnum: u16,
        r: &mut NdrReader,
    ) -> Result<Box<dyn Operation>>;
}

/// An interface that extends a base interface.
///
/// Opnums below `base_opnums` belong to the base; the rest go to `own`.
/// Opnums are passed through unchanged.
pub struct DelegatingHandle {
    base: Arc<dyn ServerHandle>,
    base_opnums: u16,
    own: Arc<dyn ServerHandle>,
}

impl DelegatingHandle {
    pub fn new(base: Arc<dyn ServerHandle>, base_opnums: u16, own: Arc<dyn ServerHandle>) -> Self {
        Self {
            base,
            base_opnums,
            own,
        }
    }
}

#[async_trait]
impl ServerHandle for DelegatingHandle {
    async fn server_handle(
        &self,
        ctx: &CallContext,
        opnum: u16,
        r: &mut NdrReader,
    ) -> Result<Box<dyn Operation>> {
        if opnum < self.base_opnums {
            self.base.server_handle(ctx, opnum, r).await
        } else {
            self.own.server_handle(ctx, opnum, r).await
        }
    }
}

type Resource = Arc<dyn Any + Send + Sync>;

/// Context handles minted on one connection.
///
/// Handles are random UUIDs. A handle from another connection, or one that
/// was closed, resolves to [`RpcError::InvalidHandle`].
pub struct ContextHandleTable {
    entries: Mutex<HashMap<Uuid, Resource>>,
    closed: Mutex<bool>,
    rng: SystemRandom,
}

impl ContextHandleTable {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            closed: Mutex::new(false),
            rng: SystemRandom::new(),
        }
    }

    /// Store `resource` and return the handle that names it.
    pub fn open<T: Any + Send + Sync>(&self, resource: T) -> Result<ContextHandle> {
        if *self.closed.lock() {
            return Err(RpcError::ConnectionClosed);
        }
        let mut entries = self.entries.lock();
        loop {
            let mut bytes = [0u8; 16];
            self.rng
                .fill(&mut bytes)
                .map_err(|_| RpcError::ResourceLimit("random source unavailable".into()))?;
            let uuid = Uuid::from_bytes_le(bytes);
            if uuid.is_nil() || entries.contains_key(&uuid) {
                continue;
            }
            entries.insert(uuid, Arc::new(resource));
            return Ok(ContextHandle::new(uuid));
        }
    }

    /// Resolve a handle to the resource it names.
    pub fn get<T: Any + Send + Sync>(&self, handle: &ContextHandle) -> Result<Arc<T>> {
        let resource = self
            .entries
            .lock()
            .get(&handle.uuid)
            .cloned()
            .ok_or(RpcError::InvalidHandle)?;
        resource.downcast::<T>().map_err(|_| RpcError::InvalidHandle)
    }

    /// Release a handle. The caller returns [`ContextHandle::NIL`] to the client.
    pub fn close(&self, handle: &ContextHandle) -> Result<()> {
        self.entries
            .lock()
            .remove(&handle.uuid)
            .map(|_| ())
            .ok_or(RpcError::InvalidHandle)
    }

    /// Invalidate every handle; later opens fail.
    pub fn close_all(&self) {
        *self.closed.lock() = true;
        self.entries.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

impl Default for ContextHandleTable {
    fn default() -> Self {
        Self::new()
    }
}

/// Interfaces a server offers, keyed by interface UUID.
///
/// Several versions of one interface may be registered; a lookup picks the
/// newest minor version that satisfies the request.
#[derive(Default)]
pub struct InterfaceRegistry {
    entries: RwLock<HashMap<Uuid, Vec<(SyntaxId, Arc<dyn ServerHandle>)>>>,
}

impl InterfaceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handle for `syntax`, replacing any handle for the same version.
    pub async fn register(&self, syntax: SyntaxId, handle: Arc<dyn ServerHandle>) {
        info!(interface = %syntax, "registering interface");
        let mut entries = self.entries.write().await;
        let versions = entries.entry(syntax.uuid).or_default();
        versions.retain(|(existing, _)| existing.version != syntax.version);
        versions.push((syntax, handle));
    }

    pub async fn register_interface(&self, interface: Interface) {
        let syntax = interface.syntax;
        self.register(syntax, Arc::new(interface)).await;
    }

    pub async fn lookup(&self, requested: &SyntaxId) -> Option<(SyntaxId, Arc<dyn ServerHandle>)> {
        let entries = self.entries.read().await;
        entries
            .get(&requested.uuid)?
            .iter()
            .filter(|(offered, _)| offered.satisfies(requested))
            .max_by_key(|(offered, _)| offered.minor_version())
            .map(|(offered, handle)| (*offered, Arc::clone(handle)))
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.values().map(Vec::len).sum()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

/// Operation handler function type
pub type OperationHandler = Arc<
    dyn Fn(CallContext, Bytes) -> Pin<Box<dyn Future<Output = Result<Bytes>> + Send>>
        + Send
        + Sync,
>;

/// Raw-stub interface: each opnum maps to an async function over bytes
pub struct Interface {
    pub syntax: SyntaxId,
    operations: HashMap<u16, OperationHandler>,
    not_used_on_wire: HashSet<u16>,
}

impl Interface {
    pub fn new(uuid: Uuid, major_version: u16, minor_version: u16) -> Self {
        Self::from_syntax(SyntaxId::new(uuid, major_version, minor_version))
    }

    pub fn from_syntax(syntax: SyntaxId) -> Self {
        Self {
            syntax,
            operations: HashMap::new(),
            not_used_on_wire: HashSet::new(),
        }
    }

    /// Register an operation handler
    pub fn register_operation<F, Fut>(&mut self, opnum: u16, handler: F)
    where
        F: Fn(Bytes) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Bytes>> + Send + 'static,
    {
        self.operations
            .insert(opnum, Arc::new(move |_ctx, args| Box::pin(handler(args))));
    }

    /// Register a handler that also sees the call context
    pub fn register_operation_with_context<F, Fut>(&mut self, opnum: u16, handler: F)
    where
        F: Fn(CallContext, Bytes) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Bytes>> + Send + 'static,
    {
        self.operations
            .insert(opnum, Arc::new(move |ctx, args| Box::pin(handler(ctx, args))));
    }

    /// Get an operation handler
    pub fn get_operation(&self, opnum: u16) -> Option<&OperationHandler> {
        self.operations.get(&opnum)
    }

    /// Highest opnum this interface answers, if any.
    pub fn highest_opnum(&self) -> Option<u16> {
        self.operations
            .keys()
            .chain(self.not_used_on_wire.iter())
            .copied()
            .max()
    }
}

#[derive(Default)]
struct RawOperation {
    request: Bytes,
    response: Bytes,
}

impl Operation for RawOperation {
    fn unmarshal_request(&mut self, r: &mut NdrReader) -> Result<()> {
        self.request = r.rest();
        Ok(())
    }

    fn marshal_response(&self, w: &mut NdrWriter) -> Result<()> {
        w.put_slice(&self.response);
        Ok(())
    }
}

#[async_trait]
impl ServerHandle for Interface {
    async fn server_handle(
        &self,
        ctx: &CallContext,
        opnum: u16,
        r: &mut NdrReader,
    ) -> Result<Box<dyn Operation>> {
        if self.not_used_on_wire.contains(&opnum) {
            return Ok(Box::new(NoOperation));
        }
        let handler = self
            .get_operation(opnum)
            .ok_or(RpcError::UnknownOperation(opnum))?;

        let mut op = RawOperation::default();
        op.unmarshal_request(r)?;
        op.response = handler(ctx.clone(), op.request.clone()).await?;
        Ok(Box::new(op))
    }
}

/// Builder for creating DCE RPC interfaces with a fluent API
pub struct InterfaceBuilder {
    interface: Interface,
}

impl InterfaceBuilder {
    pub fn new(uuid: &str, major_version: u16, minor_version: u16) -> Option<Self> {
        let uuid = Uuid::parse(uuid)?;
        Some(Self {
            interface: Interface::new(uuid, major_version, minor_version),
        })
    }

    pub fn from_syntax(syntax: SyntaxId) -> Self {
        Self {
            interface: Interface::from_syntax(syntax),
        }
    }

    pub fn operation<F, Fut>(mut self, opnum: u16, handler: F) -> Self
    where
        F: Fn(Bytes) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Bytes>> + Send + 'static,
    {
        self.interface.register_operation(opnum, handler);
        self
    }

    pub fn operation_with_context<F, Fut>(mut self, opnum: u16, handler: F) -> Self
    where
        F: Fn(CallContext, Bytes) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Bytes>> + Send + 'static,
    {
        self.interface.register_operation_with_context(opnum, handler);
        self
    }

    /// Reserve an opnum that exists in the IDL but is never sent.
    pub fn not_used_on_wire(mut self, opnum: u16) -> Self {
        self.interface.not_used_on_wire.insert(opnum);
        self
    }

    pub fn build(self) -> Interface {
        self.interface
    }
}
