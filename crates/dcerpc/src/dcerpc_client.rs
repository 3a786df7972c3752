//! DCE RPC Client
//!
//! One [`DceRpcClient`] owns one connection. A background task reads every
//! PDU the server sends, verifies it, reassembles fragmented responses and
//! hands each completed reply to the caller waiting on its call_id. Any
//! number of calls may be outstanding at once.
//!
//! Bind and alter_context are serialized on the connection; a presentation
//! context only becomes usable once the server has acknowledged it.

use crate::dcerpc::{
    AlterContextPdu, Auth3Pdu, BindPdu, ContextElement, ControlPdu, DataRepresentation, Pdu,
    PresentationResult, RequestPdu, ResponsePdu, SyntaxId, Uuid, DEFAULT_MAX_FRAG,
    NDR_TRANSFER_SYNTAX,
};
use crate::dcerpc_transport::{DceRpcTransport, DEFAULT_MAX_PDU_SIZE};
use crate::error::{Result, RpcError};
use crate::fragmentation::{
    FragmentGenerator, Reassembler, DEFAULT_MAX_FRAGMENTED_CALLS, DEFAULT_MAX_REASSEMBLY_BYTES,
};
use crate::security::{
    AuthLevel, AuthStep, AuthVerifier, Role, SecurityConfig, SecurityContext, SecurityState,
};
use bytes::Bytes;
use dashmap::DashMap;
use midl_ndr::{decode_from_bytes, encode_to_bytes, NdrContext, NdrDecode, NdrEncode};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU16, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

/// Default connect, bind and call timeout
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(30);

type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Negotiation state of a presentation context
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BindingState {
    Proposed,
    Bound,
    Rejected,
    Closed,
}

/// A presentation context negotiated on a connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BindingContext {
    pub context_id: u16,
    pub abstract_syntax: SyntaxId,
    pub transfer_syntax: SyntaxId,
    pub state: BindingState,
}

impl BindingContext {
    pub fn is_bound(&self) -> bool {
        self.state == BindingState::Bound
    }
}

#[derive(Debug, Clone)]
struct ClientConfig {
    timeout: Duration,
    max_xmit_frag: u16,
    max_recv_frag: u16,
    max_pdu_size: usize,
    data_rep: DataRepresentation,
    security: Option<SecurityConfig>,
    max_fragmented_calls: usize,
    max_reassembly_bytes: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_CALL_TIMEOUT,
            max_xmit_frag: DEFAULT_MAX_FRAG,
            max_recv_frag: DEFAULT_MAX_FRAG,
            max_pdu_size: DEFAULT_MAX_PDU_SIZE,
            data_rep: DataRepresentation::ndr(),
            security: None,
            max_fragmented_calls: DEFAULT_MAX_FRAGMENTED_CALLS,
            max_reassembly_bytes: DEFAULT_MAX_REASSEMBLY_BYTES,
        }
    }
}

/// State shared between callers and the read task
struct Shared {
    config: ClientConfig,
    writer: Mutex<DceRpcTransport<BoxedWriter>>,
    pending: DashMap<u32, oneshot::Sender<Result<Pdu>>>,
    next_call_id: AtomicU32,
    next_context_id: AtomicU16,
    contexts: RwLock<HashMap<u16, BindingContext>>,
    default_context: parking_lot::Mutex<Option<u16>>,
    negotiation: Mutex<()>,
    associated: AtomicBool,
    max_xmit_frag: AtomicU16,
    max_recv_frag: AtomicU16,
    assoc_group_id: AtomicU32,
    security: parking_lot::Mutex<Option<Arc<SecurityContext>>>,
    closed: AtomicBool,
}

impl Shared {
    fn next_call_id(&self) -> u32 {
        self.next_call_id.fetch_add(1, Ordering::Relaxed)
    }

    fn security(&self) -> Option<Arc<SecurityContext>> {
        self.security.lock().clone()
    }

    /// Start waiting for the reply to `call_id`.
    fn register(&self, call_id: u32) -> Result<oneshot::Receiver<Result<Pdu>>> {
        if self.closed.load(Ordering::Acquire) {
            return Err(RpcError::ConnectionClosed);
        }
        let (tx, rx) = oneshot::channel();
        self.pending.insert(call_id, tx);
        // the read task may have failed everything between the check and the insert
        if self.closed.load(Ordering::Acquire) {
            self.pending.remove(&call_id);
            return Err(RpcError::ConnectionClosed);
        }
        Ok(rx)
    }

    /// Deliver a reply to its waiter. Each call_id is delivered at most once.
    fn complete(&self, call_id: u32, result: Result<Pdu>) {
        match self.pending.remove(&call_id) {
            Some((_, tx)) => {
                let _ = tx.send(result);
            }
            None => trace!(call_id, "no caller waiting, dropping reply"),
        }
    }

    fn fail_all(&self) {
        self.closed.store(true, Ordering::Release);
        if let Some(security) = self.security() {
            security.close();
        }
        for binding in self.contexts.write().values_mut() {
            binding.state = BindingState::Closed;
        }
        let call_ids: Vec<u32> = self.pending.iter().map(|entry| *entry.key()).collect();
        for call_id in call_ids {
            self.complete(call_id, Err(RpcError::ConnectionClosed));
        }
    }

    /// Verify (and unseal) then decode one PDU from the server.
    fn open(&self, data: Bytes) -> Result<Pdu> {
        match self.security() {
            Some(security) => {
                let mut raw = data.to_vec();
                security.verify(&mut raw)?;
                Pdu::decode(&raw)
            }
            None => Pdu::decode(&data),
        }
    }

    async fn write_pdu(&self, pdu: &Pdu) -> Result<()> {
        let mut writer = self.writer.lock().await;
        writer.write_pdu_encoded(pdu).await
    }

    /// Fragment, sign and send a request. The writer lock is held across
    /// all fragments so sequence numbers follow wire order.
    async fn send_request(&self, mut request: RequestPdu) -> Result<()> {
        let security = self.security();
        request.auth_verifier = security.as_ref().and_then(|s| s.placeholder_verifier());

        let fragments =
            FragmentGenerator::fragment_request(&request, self.max_xmit_frag.load(Ordering::Acquire))?;

        let mut writer = self.writer.lock().await;
        for fragment in &fragments {
            let mut bytes = fragment.encode()?.to_vec();
            if let Some(security) = &security {
                security.protect(&mut bytes)?;
            }
            trace!(
                call_id = fragment.header.call_id,
                bytes = bytes.len(),
                first = fragment.header.packet_flags.is_first_frag(),
                last = fragment.header.packet_flags.is_last_frag(),
                "sending request fragment"
            );
            writer.write_pdu(&bytes).await?;
        }
        Ok(())
    }

    /// Tell the server nobody is waiting for `call_id` any more.
    fn spawn_orphaned(self: &Arc<Self>, call_id: u32) {
        if self.closed.load(Ordering::Acquire) {
            return;
        }
        if let Ok(runtime) = tokio::runtime::Handle::try_current() {
            let shared = Arc::clone(self);
            runtime.spawn(async move {
                if let Err(e) = shared.write_pdu(&Pdu::Orphaned(ControlPdu::orphaned(call_id))).await {
                    trace!(call_id, error = %e, "could not send orphaned");
                }
            });
        }
    }
}

async fn read_loop(shared: Arc<Shared>, mut transport: DceRpcTransport<BoxedReader>) {
    let mut responses: Reassembler<ResponsePdu> = Reassembler::new(
        shared.config.max_fragmented_calls,
        shared.config.max_reassembly_bytes,
    );

    let reason = loop {
        let data = match transport.read_pdu().await {
            Ok(data) => data,
            Err(e) => break e,
        };
        let pdu = match shared.open(data) {
            Ok(pdu) => pdu,
            Err(e) => break e,
        };

        match pdu {
            Pdu::Response(response) => {
                let call_id = response.header.call_id;
                if !shared.pending.contains_key(&call_id) {
                    responses.discard(call_id);
                    trace!(call_id, "dropping response for abandoned call");
                    continue;
                }
                match responses.push(response) {
                    Ok(Some(complete)) => {
                        trace!(call_id, bytes = complete.stub_data.len(), "response complete");
                        shared.complete(call_id, Ok(Pdu::Response(complete)));
                    }
                    Ok(None) => {}
                    Err(e) => {
                        warn!(call_id, error = %e, "bad response fragment");
                        shared.complete(call_id, Err(e));
                    }
                }
            }
            Pdu::Fault(fault) => {
                let call_id = fault.header.call_id;
                responses.discard(call_id);
                debug!(
                    call_id,
                    status = format_args!("0x{:08x}", fault.status),
                    did_not_execute = fault.did_not_execute(),
                    "fault received"
                );
                shared.complete(call_id, Err(RpcError::Fault(fault.status)));
            }
            reply @ (Pdu::BindAck(_) | Pdu::BindNak(_) | Pdu::AlterContextResp(_)) => {
                let call_id = reply.call_id();
                shared.complete(call_id, Ok(reply));
            }
            Pdu::Shutdown(_) => {
                debug!("server requested shutdown");
                break RpcError::ConnectionClosed;
            }
            other => {
                warn!(packet_type = ?other.header().packet_type, "unexpected PDU from server");
            }
        }
    };

    match &reason {
        RpcError::ConnectionClosed => debug!("connection closed"),
        e => warn!(error = %e, "connection failed"),
    }
    shared.fail_all();
}

/// Pick out the single result for a proposed context.
fn accept_context(element: &ContextElement, results: &[PresentationResult]) -> Result<BindingContext> {
    let result = results
        .first()
        .ok_or_else(|| RpcError::InvalidPduData("no presentation result".into()))?;
    if !result.is_accepted() {
        return Err(RpcError::ContextRejected {
            result: result.result as u16,
            reason: result.reason as u16,
        });
    }
    if !element.transfer_syntaxes.contains(&result.transfer_syntax) {
        return Err(RpcError::InvalidPduData(format!(
            "server chose transfer syntax {} which was not proposed",
            result.transfer_syntax
        )));
    }
    Ok(BindingContext {
        context_id: element.context_id,
        abstract_syntax: element.abstract_syntax,
        transfer_syntax: result.transfer_syntax,
        state: BindingState::Bound,
    })
}

/// DCE RPC Client for making calls to a DCE RPC server
pub struct DceRpcClient {
    shared: Arc<Shared>,
    read_task: JoinHandle<()>,
}

impl DceRpcClient {
    /// Connect to a DCE RPC server and bind to the specified interface
    pub async fn connect(addr: SocketAddr, interface: SyntaxId) -> Result<Self> {
        DceRpcClientBuilder::from_syntax(interface).connect(addr).await
    }

    pub fn builder(interface: SyntaxId) -> DceRpcClientBuilder {
        DceRpcClientBuilder::from_syntax(interface)
    }

    fn from_stream<S>(stream: S, config: ClientConfig) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let (reader, writer) = tokio::io::split(stream);
        let reader: BoxedReader = Box::new(reader);
        let writer: BoxedWriter = Box::new(writer);

        let shared = Arc::new(Shared {
            writer: Mutex::new(DceRpcTransport::new(writer)),
            pending: DashMap::new(),
            next_call_id: AtomicU32::new(1),
            next_context_id: AtomicU16::new(0),
            contexts: RwLock::new(HashMap::new()),
            default_context: parking_lot::Mutex::new(None),
            negotiation: Mutex::new(()),
            associated: AtomicBool::new(false),
            max_xmit_frag: AtomicU16::new(config.max_xmit_frag),
            max_recv_frag: AtomicU16::new(config.max_recv_frag),
            assoc_group_id: AtomicU32::new(0),
            security: parking_lot::Mutex::new(None),
            closed: AtomicBool::new(false),
            config,
        });

        let transport = DceRpcTransport::new(reader).with_max_pdu_size(shared.config.max_pdu_size);
        let read_task = tokio::spawn(read_loop(Arc::clone(&shared), transport));
        Self { shared, read_task }
    }

    /// Negotiate a presentation context for `abstract_syntax` with NDR
    /// as the transfer syntax.
    ///
    /// The first negotiation on a connection is a bind; later ones are
    /// alter_context.
    pub async fn bind(&self, abstract_syntax: SyntaxId) -> Result<BindingContext> {
        self.bind_with_transfer_syntaxes(abstract_syntax, vec![NDR_TRANSFER_SYNTAX])
            .await
    }

    pub async fn bind_with_transfer_syntaxes(
        &self,
        abstract_syntax: SyntaxId,
        transfer_syntaxes: Vec<SyntaxId>,
    ) -> Result<BindingContext> {
        let _negotiation = self.shared.negotiation.lock().await;
        let element = ContextElement {
            context_id: self.shared.next_context_id.fetch_add(1, Ordering::Relaxed),
            abstract_syntax,
            transfer_syntaxes,
        };
        let binding = if self.shared.associated.load(Ordering::Acquire) {
            self.negotiate_alter(&element).await?
        } else {
            self.negotiate_bind(&element).await?
        };
        self.record(binding.clone());
        Ok(binding)
    }

    /// Add another interface to an already bound connection
    pub async fn alter_context(&self, abstract_syntax: SyntaxId) -> Result<BindingContext> {
        if !self.shared.associated.load(Ordering::Acquire) {
            return Err(RpcError::ContextNotBound(
                self.shared.next_context_id.load(Ordering::Relaxed),
            ));
        }
        self.bind(abstract_syntax).await
    }

    fn record(&self, binding: BindingContext) {
        let context_id = binding.context_id;
        self.shared.contexts.write().insert(context_id, binding);
        self.shared.default_context.lock().get_or_insert(context_id);
    }

    /// Send a bind-type PDU and wait for its reply.
    async fn exchange(&self, call_id: u32, pdu: Pdu) -> Result<Pdu> {
        let rx = self.shared.register(call_id)?;
        if let Err(e) = self.shared.write_pdu(&pdu).await {
            self.shared.pending.remove(&call_id);
            return Err(e);
        }
        match tokio::time::timeout(self.shared.config.timeout, rx).await {
            Err(_) => {
                self.shared.pending.remove(&call_id);
                Err(RpcError::Timeout)
            }
            Ok(Err(_)) => Err(RpcError::ConnectionClosed),
            Ok(Ok(reply)) => reply,
        }
    }

    async fn negotiate_bind(&self, element: &ContextElement) -> Result<BindingContext> {
        let shared = &self.shared;
        let call_id = shared.next_call_id();
        let mut bind = BindPdu::with_contexts(call_id, vec![element.clone()]);
        bind.header.data_rep = shared.config.data_rep;
        bind.max_xmit_frag = shared.config.max_xmit_frag;
        bind.max_recv_frag = shared.config.max_recv_frag;

        let mut auth = None;
        if let Some(config) = &shared.config.security {
            let auth_type = config.provider.auth_type();
            let context = SecurityContext::new(
                auth_type,
                config.auth_level,
                config.auth_context_id,
                Role::Client,
            );
            context.begin_negotiation();
            let mut session = config.provider.client_session()?;
            let token = match session.step(None)? {
                AuthStep::Continue(token) => token,
                AuthStep::Complete { .. } => {
                    return Err(RpcError::AuthFailed(
                        "provider finished before hearing from the server".into(),
                    ))
                }
            };
            bind.auth_verifier = Some(AuthVerifier::new(
                auth_type,
                config.auth_level,
                config.auth_context_id,
                token,
            ));
            auth = Some((session, context));
        }

        debug!(
            call_id,
            context_id = element.context_id,
            interface = %element.abstract_syntax,
            "sending bind"
        );

        match self.exchange(call_id, Pdu::Bind(bind)).await? {
            Pdu::BindAck(ack) => {
                shared.max_xmit_frag.store(
                    shared.config.max_xmit_frag.min(ack.max_recv_frag),
                    Ordering::Release,
                );
                shared.max_recv_frag.store(
                    shared.config.max_recv_frag.min(ack.max_xmit_frag),
                    Ordering::Release,
                );
                shared.assoc_group_id.store(ack.assoc_group_id, Ordering::Release);

                if let Some((mut session, context)) = auth {
                    let server_token = ack
                        .auth_verifier
                        .as_ref()
                        .map(|verifier| verifier.auth_value.clone())
                        .ok_or_else(|| {
                            RpcError::AuthFailed("bind_ack carries no auth verifier".into())
                        })?;
                    match session.step(Some(&server_token))? {
                        AuthStep::Complete { token, session_key } => {
                            if let Some(token) = token {
                                let verifier = AuthVerifier::new(
                                    context.auth_type(),
                                    context.auth_level(),
                                    context.auth_context_id(),
                                    token,
                                );
                                let mut auth3 = Auth3Pdu::new(call_id, verifier);
                                auth3.header.data_rep = shared.config.data_rep;
                                shared.write_pdu(&Pdu::Auth3(auth3)).await?;
                            }
                            context.establish(&session_key)?;
                            debug!(
                                auth_type = ?context.auth_type(),
                                auth_level = ?context.auth_level(),
                                "security context established"
                            );
                            *shared.security.lock() = Some(Arc::new(context));
                        }
                        AuthStep::Continue(_) => {
                            return Err(RpcError::AuthFailed(
                                "provider needs more legs than bind and auth3".into(),
                            ))
                        }
                    }
                }

                shared.associated.store(true, Ordering::Release);
                debug!(
                    call_id,
                    max_xmit_frag = shared.max_xmit_frag.load(Ordering::Acquire),
                    max_recv_frag = shared.max_recv_frag.load(Ordering::Acquire),
                    assoc_group_id = ack.assoc_group_id,
                    "bind acknowledged"
                );
                accept_context(element, &ack.results)
            }
            Pdu::BindNak(nak) => {
                if let Some((_, context)) = auth {
                    context.close();
                }
                debug!(call_id, reason = ?nak.reject_reason, "bind rejected");
                Err(RpcError::BindRejected {
                    reason: nak.reject_reason as u16,
                })
            }
            other => Err(RpcError::InvalidMessageType(other.header().packet_type as u8)),
        }
    }

    async fn negotiate_alter(&self, element: &ContextElement) -> Result<BindingContext> {
        let call_id = self.shared.next_call_id();
        let mut alter = AlterContextPdu::new(call_id, vec![element.clone()]);
        alter.header.data_rep = self.shared.config.data_rep;
        alter.max_xmit_frag = self.shared.config.max_xmit_frag;
        alter.max_recv_frag = self.shared.config.max_recv_frag;
        alter.assoc_group_id = self.shared.assoc_group_id.load(Ordering::Acquire);

        debug!(
            call_id,
            context_id = element.context_id,
            interface = %element.abstract_syntax,
            "sending alter_context"
        );

        match self.exchange(call_id, Pdu::AlterContext(alter)).await? {
            Pdu::AlterContextResp(resp) => accept_context(element, &resp.results),
            other => Err(RpcError::InvalidMessageType(other.header().packet_type as u8)),
        }
    }

    fn check_context(&self, context_id: u16) -> Result<()> {
        if self.shared.closed.load(Ordering::Acquire) {
            return Err(RpcError::ConnectionClosed);
        }
        match self.shared.contexts.read().get(&context_id) {
            Some(binding) if binding.is_bound() => Ok(()),
            _ => Err(RpcError::ContextNotBound(context_id)),
        }
    }

    fn default_context_id(&self) -> Result<u16> {
        (*self.shared.default_context.lock()).ok_or(RpcError::ContextNotBound(0))
    }

    async fn begin_call(
        &self,
        context_id: u16,
        object: Option<Uuid>,
        opnum: u16,
        stub_data: Bytes,
    ) -> Result<PendingCall> {
        self.check_context(context_id)?;

        let call_id = self.shared.next_call_id();
        let rx = self.shared.register(call_id)?;

        let mut request = RequestPdu::new(call_id, opnum, stub_data);
        request.context_id = context_id;
        request.object_uuid = object;
        request.header.data_rep = self.shared.config.data_rep;

        debug!(
            call_id,
            opnum,
            context_id,
            bytes = request.stub_data.len(),
            "sending request"
        );

        if let Err(e) = self.shared.send_request(request).await {
            self.shared.pending.remove(&call_id);
            return Err(e);
        }

        Ok(PendingCall {
            call_id,
            rx,
            shared: Arc::clone(&self.shared),
            timeout: self.shared.config.timeout,
            finished: false,
        })
    }

    /// Send a request and return a handle to its outstanding reply
    pub async fn begin(&self, context_id: u16, opnum: u16, stub_data: Bytes) -> Result<PendingCall> {
        self.begin_call(context_id, None, opnum, stub_data).await
    }

    /// Invoke `opnum` on a bound presentation context
    ///
    /// The returned bytes are the response stub as the server marshaled it;
    /// any status codes inside it are for the caller to interpret.
    pub async fn invoke(&self, context_id: u16, opnum: u16, stub_data: Bytes) -> Result<Bytes> {
        self.begin(context_id, opnum, stub_data).await?.wait().await
    }

    /// Invoke `opnum` on a specific object
    pub async fn invoke_object(
        &self,
        context_id: u16,
        object: Uuid,
        opnum: u16,
        stub_data: Bytes,
    ) -> Result<Bytes> {
        self.begin_call(context_id, Some(object), opnum, stub_data)
            .await?
            .wait()
            .await
    }

    /// Make an RPC call on the first bound context
    pub async fn call(&self, opnum: u16, stub_data: Bytes) -> Result<Bytes> {
        self.invoke(self.default_context_id()?, opnum, stub_data).await
    }

    /// Call operation 0 (typically a null/ping operation)
    pub async fn null_call(&self) -> Result<()> {
        self.call(0, Bytes::new()).await?;
        Ok(())
    }

    /// Marshal `request`, invoke, and unmarshal the response
    pub async fn invoke_ndr<Req, Resp>(&self, context_id: u16, opnum: u16, request: &Req) -> Result<Resp>
    where
        Req: NdrEncode,
        Resp: NdrDecode,
    {
        let stub = encode_to_bytes(NdrContext::with_data_rep(self.shared.config.data_rep), request)?;
        let response = self
            .begin(context_id, opnum, stub)
            .await?
            .wait_response()
            .await?;
        Ok(decode_from_bytes(response.header.context(), response.stub_data)?)
    }

    pub async fn call_ndr<Req, Resp>(&self, opnum: u16, request: &Req) -> Result<Resp>
    where
        Req: NdrEncode,
        Resp: NdrDecode,
    {
        self.invoke_ndr(self.default_context_id()?, opnum, request).await
    }

    pub fn binding(&self, context_id: u16) -> Option<BindingContext> {
        self.shared.contexts.read().get(&context_id).cloned()
    }

    /// Context used by [`call`](Self::call)
    pub fn default_context(&self) -> Option<u16> {
        *self.shared.default_context.lock()
    }

    pub fn max_xmit_frag(&self) -> u16 {
        self.shared.max_xmit_frag.load(Ordering::Acquire)
    }

    pub fn max_recv_frag(&self) -> u16 {
        self.shared.max_recv_frag.load(Ordering::Acquire)
    }

    pub fn assoc_group_id(&self) -> u32 {
        self.shared.assoc_group_id.load(Ordering::Acquire)
    }

    pub fn auth_level(&self) -> AuthLevel {
        self.shared
            .security()
            .map(|security| security.auth_level())
            .unwrap_or_default()
    }

    pub fn security_state(&self) -> Option<SecurityState> {
        self.shared.security().map(|security| security.state())
    }

    /// Number of calls awaiting a reply
    pub fn pending_calls(&self) -> usize {
        self.shared.pending.len()
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::Acquire)
    }

    /// Close the connection, failing any outstanding calls
    pub async fn close(&self) {
        self.shared.closed.store(true, Ordering::Release);
        {
            let mut writer = self.shared.writer.lock().await;
            if let Err(e) = writer.shutdown().await {
                trace!(error = %e, "shutdown failed");
            }
        }
        self.read_task.abort();
        self.shared.fail_all();
    }
}

impl Drop for DceRpcClient {
    fn drop(&mut self) {
        self.read_task.abort();
    }
}

/// An outstanding call
///
/// Dropping it without waiting abandons the call: the reply is discarded
/// when it arrives and the server is told the call is orphaned.
pub struct PendingCall {
    call_id: u32,
    rx: oneshot::Receiver<Result<Pdu>>,
    shared: Arc<Shared>,
    timeout: Duration,
    finished: bool,
}

impl PendingCall {
    pub fn call_id(&self) -> u32 {
        self.call_id
    }

    /// Wait for the response stub
    pub async fn wait(self) -> Result<Bytes> {
        Ok(self.wait_response().await?.stub_data)
    }

    async fn wait_response(mut self) -> Result<ResponsePdu> {
        let outcome = tokio::time::timeout(self.timeout, &mut self.rx).await;
        self.finished = true;
        match outcome {
            Err(_) => {
                self.shared.pending.remove(&self.call_id);
                debug!(call_id = self.call_id, "call timed out");
                self.shared.spawn_orphaned(self.call_id);
                Err(RpcError::Timeout)
            }
            Ok(Err(_)) => Err(RpcError::ConnectionClosed),
            Ok(Ok(Ok(Pdu::Response(response)))) => Ok(response),
            Ok(Ok(Ok(other))) => Err(RpcError::InvalidMessageType(
                other.header().packet_type as u8,
            )),
            Ok(Ok(Err(e))) => Err(e),
        }
    }

    /// Ask the server to cancel the call. Any reply is discarded.
    pub async fn cancel(mut self) -> Result<()> {
        self.finished = true;
        self.shared.pending.remove(&self.call_id);
        debug!(call_id = self.call_id, "cancelling call");
        self.shared
            .write_pdu(&Pdu::CoCancel(ControlPdu::cancel(self.call_id)))
            .await
    }
}

impl Drop for PendingCall {
    fn drop(&mut self) {
        if !self.finished && self.shared.pending.remove(&self.call_id).is_some() {
            self.shared.spawn_orphaned(self.call_id);
        }
    }
}

/// Builder for DCE RPC clients
pub struct DceRpcClientBuilder {
    interface: SyntaxId,
    config: ClientConfig,
}

impl DceRpcClientBuilder {
    /// Create a builder for the specified interface
    pub fn new(interface_uuid: Uuid, major_version: u16, minor_version: u16) -> Self {
        Self::from_syntax(SyntaxId::new(interface_uuid, major_version, minor_version))
    }

    /// Create a builder from a SyntaxId
    pub fn from_syntax(interface: SyntaxId) -> Self {
        Self {
            interface,
            config: ClientConfig::default(),
        }
    }

    /// Set the connect, bind and per-call timeout
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.config.timeout = timeout;
        self
    }

    /// Fragment sizes proposed at bind
    pub fn max_frag(mut self, max_xmit_frag: u16, max_recv_frag: u16) -> Self {
        self.config.max_xmit_frag = max_xmit_frag;
        self.config.max_recv_frag = max_recv_frag;
        self
    }

    /// Set maximum PDU size
    pub fn max_pdu_size(mut self, size: usize) -> Self {
        self.config.max_pdu_size = size;
        self
    }

    pub fn data_representation(mut self, data_rep: DataRepresentation) -> Self {
        self.config.data_rep = data_rep;
        self
    }

    pub fn security(mut self, security: SecurityConfig) -> Self {
        self.config.security = Some(security);
        self
    }

    pub fn reassembly_limits(mut self, max_calls: usize, max_bytes: usize) -> Self {
        self.config.max_fragmented_calls = max_calls;
        self.config.max_reassembly_bytes = max_bytes;
        self
    }

    /// Connect to the server and perform bind
    pub async fn connect(self, addr: SocketAddr) -> Result<DceRpcClient> {
        let stream = tokio::time::timeout(self.config.timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| RpcError::Timeout)??;
        stream.set_nodelay(true)?;
        debug!(%addr, "connected");
        self.connect_stream(stream).await
    }

    /// Bind over an already connected stream
    pub async fn connect_stream<S>(self, stream: S) -> Result<DceRpcClient>
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let client = DceRpcClient::from_stream(stream, self.config);
        client.bind(self.interface).await?;
        Ok(client)
    }
}
