//! DCE RPC Server
//!
//! A highly scalable server implementation for the DCE RPC protocol.
//!
//! # Scalability Features
//!
//! - Each connection handled in a separate Tokio task
//! - Each call dispatched in its own task, so one connection can have
//!   several calls running
//! - Semaphore-based connection limiting
//! - Bounded reassembly state per connection
//! - Server statistics tracking
//! - Graceful shutdown support

use crate::dcerpc::{
    AlterContextPdu, AlterContextRespPdu, Auth3Pdu, BindAckPdu, BindNakPdu, BindPdu,
    ContextElement, ControlPdu, FaultPdu, Pdu, PduHeader, PresentationResult, ProviderReason,
    RejectReason, RequestPdu, ResponsePdu, SyntaxId, DEFAULT_MAX_FRAG, NDR_TRANSFER_SYNTAX,
};
use crate::dcerpc_dispatch::{
    CallContext, ContextHandleTable, Interface, InterfaceRegistry, ServerHandle,
};
use crate::dcerpc_transport::{DceRpcTransport, DEFAULT_MAX_PDU_SIZE};
use crate::error::{Result, RpcError};
use crate::fragmentation::{
    FragmentGenerator, Reassembler, DEFAULT_MAX_FRAGMENTED_CALLS, DEFAULT_MAX_REASSEMBLY_BYTES,
};
use crate::security::{
    AuthLevel, AuthSession, AuthStep, AuthVerifier, Role, SecurityContext, SecurityProvider,
    SecurityState,
};
use bytes::Bytes;
use dashmap::DashMap;
use midl_ndr::{NdrContext, NdrReader, NdrWriter};
use std::collections::HashMap;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::{watch, Mutex, Semaphore};
use tokio::task::AbortHandle;
use tracing::{debug, error, info, trace, warn};

/// Smallest fragment size a client may propose
pub const MIN_FRAG_SIZE: u16 = 1432;

type BoxedReader = Box<dyn AsyncRead + Send + Sync + Unpin>;
type BoxedWriter = Box<dyn AsyncWrite + Send + Sync + Unpin>;

/// DCE RPC Server configuration
#[derive(Debug, Clone)]
pub struct DceRpcServerConfig {
    pub max_pdu_size: usize,
    pub max_connections: usize,
    pub max_xmit_frag: u16,
    pub max_recv_frag: u16,
    /// Calls that may be partially reassembled at once on one connection
    pub max_concurrent_fragments: usize,
    /// Stub bytes one connection may buffer for reassembly
    pub max_connection_memory_budget: usize,
    /// Requests on connections below this level fault with access denied
    pub min_auth_level: AuthLevel,
}

impl Default for DceRpcServerConfig {
    fn default() -> Self {
        Self {
            max_pdu_size: DEFAULT_MAX_PDU_SIZE,
            max_connections: 10000,
            max_xmit_frag: DEFAULT_MAX_FRAG,
            max_recv_frag: DEFAULT_MAX_FRAG,
            max_concurrent_fragments: DEFAULT_MAX_FRAGMENTED_CALLS,
            max_connection_memory_budget: DEFAULT_MAX_REASSEMBLY_BYTES,
            min_auth_level: AuthLevel::None,
        }
    }
}

/// Server statistics
#[derive(Debug, Default)]
pub struct ServerStats {
    pub connections_accepted: AtomicU64,
    pub connections_active: AtomicU64,
    pub connections_rejected: AtomicU64,
    pub requests_received: AtomicU64,
    pub requests_processed: AtomicU64,
    pub requests_failed: AtomicU64,
    pub bytes_received: AtomicU64,
    pub bytes_sent: AtomicU64,
}

impl ServerStats {
    pub fn snapshot(&self) -> ServerStatsSnapshot {
        ServerStatsSnapshot {
            connections_accepted: self.connections_accepted.load(Ordering::Relaxed),
            connections_active: self.connections_active.load(Ordering::Relaxed),
            connections_rejected: self.connections_rejected.load(Ordering::Relaxed),
            requests_received: self.requests_received.load(Ordering::Relaxed),
            requests_processed: self.requests_processed.load(Ordering::Relaxed),
            requests_failed: self.requests_failed.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
        }
    }
}

/// Snapshot of server statistics
#[derive(Debug, Clone)]
pub struct ServerStatsSnapshot {
    pub connections_accepted: u64,
    pub connections_active: u64,
    pub connections_rejected: u64,
    pub requests_received: u64,
    pub requests_processed: u64,
    pub requests_failed: u64,
    pub bytes_received: u64,
    pub bytes_sent: u64,
}

/// DCE RPC Server
///
/// A highly scalable DCE RPC server that handles connections concurrently
/// using Tokio tasks.
///
/// # Scalability
///
/// - Each connection runs in its own Tokio task
/// - A semaphore limits maximum concurrent connections
/// - Interfaces live in a shared [`InterfaceRegistry`]; handles are cloned
///   out of it before a call runs
pub struct DceRpcServer {
    registry: Arc<InterfaceRegistry>,
    config: DceRpcServerConfig,
    security: Option<Arc<dyn SecurityProvider>>,
    assoc_group_counter: AtomicU32,
    connection_counter: AtomicU64,
    stats: Arc<ServerStats>,
    shutdown: watch::Sender<bool>,
}

impl DceRpcServer {
    pub fn new() -> Self {
        Self::with_config(DceRpcServerConfig::default())
    }

    pub fn with_config(config: DceRpcServerConfig) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            registry: Arc::new(InterfaceRegistry::new()),
            config,
            security: None,
            assoc_group_counter: AtomicU32::new(1),
            connection_counter: AtomicU64::new(1),
            stats: Arc::new(ServerStats::default()),
            shutdown,
        }
    }

    /// Accept authenticated binds using `provider`
    pub fn with_security_provider(mut self, provider: Arc<dyn SecurityProvider>) -> Self {
        self.security = Some(provider);
        self
    }

    pub fn config(&self) -> &DceRpcServerConfig {
        &self.config
    }

    /// Get server statistics
    pub fn stats(&self) -> &Arc<ServerStats> {
        &self.stats
    }

    pub fn registry(&self) -> &Arc<InterfaceRegistry> {
        &self.registry
    }

    /// Register a raw-stub interface with the server
    pub async fn register_interface(&self, interface: Interface) {
        self.registry.register_interface(interface).await;
    }

    /// Register a dispatch handle for `syntax`
    pub async fn register_server(&self, syntax: SyntaxId, handle: Arc<dyn ServerHandle>) {
        self.registry.register(syntax, handle).await;
    }

    /// Run the server on the given address
    pub async fn run(&self, addr: SocketAddr) -> Result<()> {
        self.serve(TcpListener::bind(addr).await?).await
    }

    /// Run the server with graceful shutdown
    pub async fn run_until<F: Future<Output = ()>>(&self, addr: SocketAddr, shutdown: F) -> Result<()> {
        self.serve_until(TcpListener::bind(addr).await?, shutdown)
            .await
    }

    /// Serve connections from an already bound listener
    pub async fn serve(&self, listener: TcpListener) -> Result<()> {
        self.serve_until(listener, std::future::pending()).await
    }

    /// Serve until `shutdown` resolves, then tell every client to go away
    /// and wait for their connections to finish.
    pub async fn serve_until<F: Future<Output = ()>>(
        &self,
        listener: TcpListener,
        shutdown: F,
    ) -> Result<()> {
        info!(
            addr = ?listener.local_addr().ok(),
            max_connections = self.config.max_connections,
            "DCE RPC server listening"
        );

        // Semaphore to limit concurrent connections
        let semaphore = Arc::new(Semaphore::new(self.config.max_connections));

        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                biased;

                _ = &mut shutdown => {
                    info!("Server shutting down gracefully");
                    self.shutdown.send_replace(true);
                    // Wait for all connections to complete
                    let _ = semaphore.acquire_many(self.config.max_connections as u32).await;
                    info!("All connections closed");
                    return Ok(());
                }

                result = listener.accept() => {
                    let (stream, peer_addr) = result?;

                    // Try to acquire a permit for this connection
                    let permit = match semaphore.clone().try_acquire_owned() {
                        Ok(permit) => permit,
                        Err(_) => {
                            // At connection limit, reject
                            self.stats.connections_rejected.fetch_add(1, Ordering::Relaxed);
                            warn!(%peer_addr, "Connection limit reached, rejecting connection");
                            drop(stream);
                            continue;
                        }
                    };

                    if let Err(e) = stream.set_nodelay(true) {
                        trace!(%peer_addr, error = %e, "could not set TCP_NODELAY");
                    }
                    debug!(%peer_addr, "Accepted connection");

                    let connection = self.connection(stream);
                    tokio::spawn(async move {
                        // Permit is held until this task completes
                        let _permit = permit;
                        connection.run().await;
                    });
                }
            }
        }
    }

    /// Serve a single connection on the current task until it closes
    pub async fn handle_stream<S>(&self, stream: S)
    where
        S: AsyncRead + AsyncWrite + Send + Sync + Unpin + 'static,
    {
        self.connection(stream).run().await;
    }

    fn connection<S>(&self, stream: S) -> Connection
    where
        S: AsyncRead + AsyncWrite + Send + Sync + Unpin + 'static,
    {
        let (reader, writer) = tokio::io::split(stream);
        let reader: BoxedReader = Box::new(reader);
        let writer: BoxedWriter = Box::new(writer);

        Connection {
            id: self.connection_counter.fetch_add(1, Ordering::Relaxed),
            reader: DceRpcTransport::new(reader).with_max_pdu_size(self.config.max_pdu_size),
            outbound: Arc::new(Outbound {
                writer: Mutex::new(DceRpcTransport::new(writer)),
                stats: Arc::clone(&self.stats),
            }),
            registry: Arc::clone(&self.registry),
            provider: self.security.clone(),
            shutdown: self.shutdown.subscribe(),
            assoc_group_id: self.assoc_group_counter.fetch_add(1, Ordering::Relaxed),
            handles: Arc::new(ContextHandleTable::new()),
            calls: Arc::new(DashMap::new()),
            bound: false,
            contexts: HashMap::new(),
            max_xmit_frag: self.config.max_xmit_frag,
            max_recv_frag: self.config.max_recv_frag,
            security: None,
            auth_session: None,
            requests: Reassembler::new(
                self.config.max_concurrent_fragments,
                self.config.max_connection_memory_budget,
            ),
            config: self.config.clone(),
        }
    }
}

impl Default for DceRpcServer {
    fn default() -> Self {
        Self::new()
    }
}

/// Outgoing half of a connection, shared with running calls
struct Outbound {
    writer: Mutex<DceRpcTransport<BoxedWriter>>,
    stats: Arc<ServerStats>,
}

impl Outbound {
    /// Encode, sign and write PDUs back to back.
    async fn send(&self, pdus: Vec<Pdu>, security: Option<&SecurityContext>) -> Result<()> {
        let mut writer = self.writer.lock().await;
        for pdu in pdus {
            let mut bytes = pdu.encode()?.to_vec();
            if let Some(security) = security {
                security.protect(&mut bytes)?;
            }
            self.stats
                .bytes_sent
                .fetch_add(bytes.len() as u64, Ordering::Relaxed);
            writer.write_pdu(&bytes).await?;
        }
        Ok(())
    }
}

/// A presentation context accepted on a connection
struct BoundContext {
    abstract_syntax: SyntaxId,
    transfer_syntax: SyntaxId,
    handle: Arc<dyn ServerHandle>,
}

/// What a dispatched call needs once it leaves the read loop
struct CallTask {
    ctx: CallContext,
    stub: Bytes,
    handle: Arc<dyn ServerHandle>,
    outbound: Arc<Outbound>,
    security: Option<Arc<SecurityContext>>,
    calls: Arc<DashMap<u32, Option<AbortHandle>>>,
    max_xmit_frag: u16,
}

impl CallTask {
    async fn run(self) {
        let call_id = self.ctx.call_id;
        let opnum = self.ctx.opnum;
        let result = self.dispatch().await;

        // whoever removes the entry owns the reply; a cancel got there first
        if self.calls.remove(&call_id).is_none() {
            trace!(call_id, "call cancelled before reply");
            return;
        }

        let stats = &self.outbound.stats;
        let pdus = match result.and_then(|stub| self.response(stub)) {
            Ok(pdus) => {
                stats.requests_processed.fetch_add(1, Ordering::Relaxed);
                trace!(call_id, opnum, fragments = pdus.len(), "sending response");
                pdus
            }
            Err(e) => {
                stats.requests_failed.fetch_add(1, Ordering::Relaxed);
                match &e {
                    RpcError::Fault(_) | RpcError::UnknownOperation(_) | RpcError::InvalidHandle => {
                        debug!(call_id, opnum, error = %e, "call faulted")
                    }
                    _ => error!(call_id, opnum, error = %e, "operation failed"),
                }
                vec![Pdu::Fault(fault_for(
                    call_id,
                    self.ctx.context_id,
                    &e,
                    self.security.as_deref(),
                ))]
            }
        };

        if let Err(e) = self.outbound.send(pdus, self.security.as_deref()).await {
            warn!(call_id, error = %e, "could not send reply");
        }
    }

    async fn dispatch(&self) -> Result<Bytes> {
        let ndr = NdrContext::with_data_rep(self.ctx.data_rep);
        let mut reader = NdrReader::new(ndr, self.stub.clone());
        let operation = self
            .handle
            .server_handle(&self.ctx, self.ctx.opnum, &mut reader)
            .await?;
        let mut writer = NdrWriter::new(ndr);
        operation.marshal_response(&mut writer)?;
        Ok(writer.into_bytes())
    }

    fn response(&self, stub: Bytes) -> Result<Vec<Pdu>> {
        let mut response = ResponsePdu::new(self.ctx.call_id, stub);
        response.context_id = self.ctx.context_id;
        response.header.data_rep = self.ctx.data_rep;
        response.auth_verifier = self
            .security
            .as_ref()
            .and_then(|security| security.placeholder_verifier());
        Ok(FragmentGenerator::fragment_response(&response, self.max_xmit_frag)?
            .into_iter()
            .map(Pdu::Response)
            .collect())
    }
}

/// Build the fault PDU a runtime error maps to.
fn fault_for(
    call_id: u32,
    context_id: u16,
    err: &RpcError,
    security: Option<&SecurityContext>,
) -> FaultPdu {
    let mut fault = FaultPdu::new(call_id, err.fault_status());
    fault.context_id = context_id;
    fault.auth_verifier = security.and_then(|security| security.placeholder_verifier());
    if matches!(
        err,
        RpcError::UnknownOperation(_)
            | RpcError::Ndr(_)
            | RpcError::InterfaceNotFound(_)
            | RpcError::ContextNotBound(_)
            | RpcError::ContextMismatch
            | RpcError::AccessDenied
            | RpcError::FragmentSequence { .. }
            | RpcError::ResourceLimit(_)
    ) {
        fault = fault.with_did_not_execute();
    }
    fault
}

/// One accepted connection and its association state
struct Connection {
    id: u64,
    config: DceRpcServerConfig,
    reader: DceRpcTransport<BoxedReader>,
    outbound: Arc<Outbound>,
    registry: Arc<InterfaceRegistry>,
    provider: Option<Arc<dyn SecurityProvider>>,
    shutdown: watch::Receiver<bool>,
    assoc_group_id: u32,
    handles: Arc<ContextHandleTable>,
    calls: Arc<DashMap<u32, Option<AbortHandle>>>,
    bound: bool,
    contexts: HashMap<u16, BoundContext>,
    max_xmit_frag: u16,
    max_recv_frag: u16,
    security: Option<Arc<SecurityContext>>,
    auth_session: Option<Box<dyn AuthSession>>,
    requests: Reassembler<RequestPdu>,
}

impl Connection {
    async fn run(mut self) {
        let stats = Arc::clone(&self.outbound.stats);
        stats.connections_accepted.fetch_add(1, Ordering::Relaxed);
        stats.connections_active.fetch_add(1, Ordering::Relaxed);
        debug!(connection_id = self.id, "connection opened");

        let result = self.serve().await;

        // everything scoped to this connection goes with it
        for entry in self.calls.iter() {
            if let Some(task) = entry.value() {
                task.abort();
            }
        }
        self.calls.clear();
        self.handles.close_all();
        self.requests.clear();
        if let Some(security) = &self.security {
            security.close();
        }
        stats.connections_active.fetch_sub(1, Ordering::Relaxed);

        match result {
            Ok(()) | Err(RpcError::ConnectionClosed) => {
                debug!(connection_id = self.id, "Connection closed")
            }
            Err(e) => warn!(connection_id = self.id, error = %e, "Connection error"),
        }
    }

    async fn serve(&mut self) -> Result<()> {
        loop {
            let shutdown = &mut self.shutdown;
            let data = tokio::select! {
                result = self.reader.read_pdu() => result?,
                // the watch guard must not outlive this future
                _ = async move {
                    let _ = shutdown.wait_for(|stop| *stop).await;
                } => {
                    debug!(connection_id = self.id, "sending shutdown");
                    self.outbound
                        .send(vec![Pdu::Shutdown(ControlPdu::shutdown(0))], None)
                        .await?;
                    return Ok(());
                }
            };
            self.outbound
                .stats
                .bytes_received
                .fetch_add(data.len() as u64, Ordering::Relaxed);

            let pdu = self.open(data).await?;
            match pdu {
                Pdu::Bind(bind) => self.on_bind(bind).await?,
                Pdu::AlterContext(alter) => self.on_alter_context(alter).await?,
                Pdu::Auth3(auth3) => self.on_auth3(auth3)?,
                Pdu::Request(request) => self.on_request(request).await?,
                Pdu::CoCancel(cancel) => self.on_cancel(cancel.header.call_id).await?,
                Pdu::Orphaned(orphaned) => self.on_orphaned(orphaned.header.call_id),
                Pdu::Shutdown(_) => return Ok(()),
                other => {
                    warn!(
                        connection_id = self.id,
                        packet_type = ?other.header().packet_type,
                        "unexpected PDU from client"
                    );
                }
            }
        }
    }

    /// Verify (and unseal) then decode. A PDU that fails verification or
    /// does not decode is answered with a fault and ends the connection.
    async fn open(&mut self, data: Bytes) -> Result<Pdu> {
        let mut raw = data.to_vec();
        let opened = match &self.security {
            Some(security) => security.verify(&mut raw).and_then(|()| Pdu::decode(&raw)),
            None => Pdu::decode(&raw),
        };
        match opened {
            Ok(pdu) => Ok(pdu),
            Err(e) => {
                self.refuse(&raw, &e).await;
                Err(e)
            }
        }
    }

    /// Fault the call a rejected PDU belongs to, if its call id can be read.
    async fn refuse(&self, raw: &[u8], err: &RpcError) {
        let Some(call_id) = PduHeader::peek_call_id(raw) else {
            warn!(connection_id = self.id, error = %err, "unreadable PDU");
            return;
        };
        warn!(
            connection_id = self.id,
            call_id,
            status = format_args!("0x{:08x}", err.fault_status()),
            error = %err,
            "rejecting PDU"
        );
        // only an established context can sign the fault
        let security = self
            .security
            .as_deref()
            .filter(|security| security.state() == SecurityState::Established);
        let fault = fault_for(call_id, 0, err, security);
        // the peer is already out of step; the fault is best effort
        let _ = self.outbound.send(vec![Pdu::Fault(fault)], security).await;
    }

    async fn send(&self, pdu: Pdu) -> Result<()> {
        self.outbound.send(vec![pdu], None).await
    }

    async fn send_fault(&self, call_id: u32, context_id: u16, err: &RpcError) -> Result<()> {
        self.outbound
            .stats
            .requests_failed
            .fetch_add(1, Ordering::Relaxed);
        debug!(
            connection_id = self.id,
            call_id,
            status = format_args!("0x{:08x}", err.fault_status()),
            error = %err,
            "sending fault"
        );
        let security = self.security.as_deref();
        let fault = fault_for(call_id, context_id, err, security);
        self.outbound.send(vec![Pdu::Fault(fault)], security).await
    }

    async fn reject_bind(&self, call_id: u32, reason: RejectReason) -> Result<()> {
        debug!(connection_id = self.id, call_id, ?reason, "rejecting bind");
        self.send(Pdu::BindNak(BindNakPdu::new(call_id, reason))).await
    }

    async fn on_bind(&mut self, bind: BindPdu) -> Result<()> {
        let call_id = bind.header.call_id;
        debug!(
            connection_id = self.id,
            call_id,
            contexts = bind.context_list.len(),
            "Received bind"
        );

        if self.bound {
            return self.reject_bind(call_id, RejectReason::NotSpecified).await;
        }
        if bind.max_xmit_frag < MIN_FRAG_SIZE || bind.max_recv_frag < MIN_FRAG_SIZE {
            return self
                .reject_bind(call_id, RejectReason::LocalLimitExceeded)
                .await;
        }

        let mut ack_verifier = None;
        if let Some(verifier) = &bind.auth_verifier {
            let provider = match &self.provider {
                Some(provider) if provider.auth_type() == verifier.auth_type => Arc::clone(provider),
                _ => {
                    return self
                        .reject_bind(call_id, RejectReason::AuthenticationTypeNotRecognized)
                        .await
                }
            };
            match self.start_security(&provider, verifier) {
                Ok(reply) => ack_verifier = reply,
                Err(e) => {
                    warn!(connection_id = self.id, call_id, error = %e, "authentication failed at bind");
                    return self.reject_bind(call_id, RejectReason::InvalidChecksum).await;
                }
            }
        }

        self.max_xmit_frag = self.config.max_xmit_frag.min(bind.max_recv_frag);
        self.max_recv_frag = self.config.max_recv_frag.min(bind.max_xmit_frag);
        let results = self.negotiate(&bind.context_list).await;
        self.bound = true;

        let mut ack = BindAckPdu::new(call_id, self.assoc_group_id, results);
        ack.max_xmit_frag = self.max_xmit_frag;
        ack.max_recv_frag = self.max_recv_frag;
        ack.auth_verifier = ack_verifier;
        debug!(
            connection_id = self.id,
            call_id,
            max_xmit_frag = ack.max_xmit_frag,
            max_recv_frag = ack.max_recv_frag,
            "sending bind_ack"
        );
        self.send(Pdu::BindAck(ack)).await
    }

    /// Run the server's first authentication leg. Returns the verifier to
    /// put on the bind_ack.
    fn start_security(
        &mut self,
        provider: &Arc<dyn SecurityProvider>,
        verifier: &AuthVerifier,
    ) -> Result<Option<AuthVerifier>> {
        let context = SecurityContext::new(
            verifier.auth_type,
            verifier.auth_level,
            verifier.auth_context_id,
            Role::Server,
        );
        context.begin_negotiation();
        let mut session = provider.server_session()?;

        let reply = match session.step(Some(verifier.auth_value.as_ref()))? {
            AuthStep::Continue(token) => {
                self.auth_session = Some(session);
                Some(token)
            }
            AuthStep::Complete { token, session_key } => {
                context.establish(&session_key)?;
                token
            }
        };
        let reply = reply.map(|token| {
            AuthVerifier::new(
                verifier.auth_type,
                verifier.auth_level,
                verifier.auth_context_id,
                token,
            )
        });
        self.security = Some(Arc::new(context));
        Ok(reply)
    }

    fn on_auth3(&mut self, auth3: Auth3Pdu) -> Result<()> {
        let call_id = auth3.header.call_id;
        let (Some(mut session), Some(security)) = (self.auth_session.take(), self.security.clone())
        else {
            warn!(connection_id = self.id, call_id, "auth3 without a pending negotiation");
            return Err(RpcError::AuthFailed("unexpected auth3".into()));
        };
        let verifier = &auth3.auth_verifier;
        if verifier.auth_type != security.auth_type()
            || verifier.auth_context_id != security.auth_context_id()
        {
            return Err(RpcError::AuthFailed("auth3 names a different security context".into()));
        }

        match session.step(Some(verifier.auth_value.as_ref()))? {
            AuthStep::Complete { session_key, .. } => {
                security.establish(&session_key)?;
                debug!(
                    connection_id = self.id,
                    auth_level = ?security.auth_level(),
                    "security context established"
                );
                Ok(())
            }
            AuthStep::Continue(_) => Err(RpcError::AuthFailed(
                "negotiation not finished after auth3".into(),
            )),
        }
    }

    async fn on_alter_context(&mut self, alter: AlterContextPdu) -> Result<()> {
        let call_id = alter.header.call_id;
        if !self.bound {
            warn!(connection_id = self.id, call_id, "alter_context before bind");
            return self.send_fault(call_id, 0, &RpcError::InvalidPdu).await;
        }
        debug!(
            connection_id = self.id,
            call_id,
            contexts = alter.context_list.len(),
            "Received alter_context"
        );

        let results = self.negotiate(&alter.context_list).await;
        let mut resp = AlterContextRespPdu::new(call_id, self.assoc_group_id, results);
        resp.max_xmit_frag = self.max_xmit_frag;
        resp.max_recv_frag = self.max_recv_frag;
        self.send(Pdu::AlterContextResp(resp)).await
    }

    /// Accept or reject each proposed presentation context.
    async fn negotiate(&mut self, elements: &[ContextElement]) -> Vec<PresentationResult> {
        let mut results = Vec::with_capacity(elements.len());
        for element in elements {
            let result = match self.contexts.get(&element.context_id) {
                // a context id keeps the syntax it was first bound to
                Some(existing) if existing.abstract_syntax == element.abstract_syntax => {
                    PresentationResult::accepted(existing.transfer_syntax)
                }
                Some(_) => PresentationResult::rejected(ProviderReason::NotSpecified),
                None => match self.registry.lookup(&element.abstract_syntax).await {
                    None => PresentationResult::rejected(ProviderReason::AbstractSyntaxNotSupported),
                    Some(_) if !element.transfer_syntaxes.contains(&NDR_TRANSFER_SYNTAX) => {
                        PresentationResult::rejected(
                            ProviderReason::ProposedTransferSyntaxesNotSupported,
                        )
                    }
                    Some((offered, handle)) => {
                        debug!(
                            connection_id = self.id,
                            context_id = element.context_id,
                            interface = %offered,
                            "presentation context accepted"
                        );
                        self.contexts.insert(
                            element.context_id,
                            BoundContext {
                                abstract_syntax: element.abstract_syntax,
                                transfer_syntax: NDR_TRANSFER_SYNTAX,
                                handle,
                            },
                        );
                        PresentationResult::accepted(NDR_TRANSFER_SYNTAX)
                    }
                },
            };
            if !result.is_accepted() {
                debug!(
                    connection_id = self.id,
                    context_id = element.context_id,
                    interface = %element.abstract_syntax,
                    reason = ?result.reason,
                    "presentation context rejected"
                );
            }
            results.push(result);
        }
        results
    }

    /// Level of the established security context; a claim made at bind
    /// counts for nothing until the handshake completes.
    fn auth_level(&self) -> AuthLevel {
        self.security
            .as_ref()
            .filter(|security| security.state() == SecurityState::Established)
            .map(|security| security.auth_level())
            .unwrap_or_default()
    }

    async fn on_request(&mut self, fragment: RequestPdu) -> Result<()> {
        let call_id = fragment.header.call_id;
        trace!(
            connection_id = self.id,
            call_id,
            bytes = fragment.stub_data.len(),
            first = fragment.header.packet_flags.is_first_frag(),
            last = fragment.header.packet_flags.is_last_frag(),
            "request fragment"
        );
        if !self.bound {
            return self.send_fault(call_id, 0, &RpcError::InvalidPdu).await;
        }

        let request = match self.requests.push(fragment) {
            Ok(Some(request)) => request,
            Ok(None) => return Ok(()),
            Err(e) => {
                warn!(connection_id = self.id, call_id, error = %e, "reassembly failed");
                return self.send_fault(call_id, 0, &e).await;
            }
        };

        self.outbound
            .stats
            .requests_received
            .fetch_add(1, Ordering::Relaxed);
        let context_id = request.context_id;
        debug!(
            connection_id = self.id,
            call_id,
            opnum = request.opnum,
            context_id,
            bytes = request.stub_data.len(),
            "Received request"
        );

        let Some(handle) = self
            .contexts
            .get(&context_id)
            .map(|bound| Arc::clone(&bound.handle))
        else {
            return self
                .send_fault(call_id, context_id, &RpcError::ContextNotBound(context_id))
                .await;
        };
        if self.auth_level() < self.config.min_auth_level {
            return self
                .send_fault(call_id, context_id, &RpcError::AccessDenied)
                .await;
        }
        if self.calls.contains_key(&call_id) {
            return self
                .send_fault(call_id, context_id, &RpcError::FragmentSequence { call_id })
                .await;
        }

        let ctx = CallContext {
            connection_id: self.id,
            call_id,
            context_id,
            opnum: request.opnum,
            object: request.object_uuid,
            data_rep: request.header.data_rep,
            handles: Arc::clone(&self.handles),
            auth_level: self.auth_level(),
        };
        let task = CallTask {
            ctx,
            stub: request.stub_data,
            handle,
            outbound: Arc::clone(&self.outbound),
            security: self.security.clone(),
            calls: Arc::clone(&self.calls),
            max_xmit_frag: self.max_xmit_frag,
        };

        // the slot exists before the task can finish and look for it
        self.calls.insert(call_id, None);
        let running = tokio::spawn(task.run());
        if let Some(mut slot) = self.calls.get_mut(&call_id) {
            *slot = Some(running.abort_handle());
        }
        Ok(())
    }

    /// Stop a call in flight. Returns true if anything was stopped.
    fn stop_call(&mut self, call_id: u32) -> bool {
        let partial = self.requests.discard(call_id);
        let running = match self.calls.remove(&call_id) {
            Some((_, task)) => {
                if let Some(task) = task {
                    task.abort();
                }
                true
            }
            None => false,
        };
        partial || running
    }

    async fn on_cancel(&mut self, call_id: u32) -> Result<()> {
        if self.stop_call(call_id) {
            debug!(connection_id = self.id, call_id, "call cancelled");
            self.send_fault(call_id, 0, &RpcError::Cancelled).await?;
        }
        Ok(())
    }

    fn on_orphaned(&mut self, call_id: u32) {
        if self.stop_call(call_id) {
            debug!(connection_id = self.id, call_id, "call orphaned");
        }
    }
}
