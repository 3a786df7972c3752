//! DCE RPC PDU (Protocol Data Unit) types
//!
//! This module implements the connection-oriented DCE RPC wire format as
//! defined in:
//! - DCE 1.1: Remote Procedure Call (C706)
//! - MS-RPCE: Remote Procedure Call Protocol Extensions
//!
//! DCE RPC PDU Header Format:
//! ```text
//! +--------+--------+--------+--------+
//! |  vers  |vers_min| ptype  | pflags |
//! +--------+--------+--------+--------+
//! |        data representation        |
//! +--------+--------+--------+--------+
//! |   frag_len      |   auth_len      |
//! +--------+--------+--------+--------+
//! |             call_id               |
//! +--------+--------+--------+--------+
//! ```
//!
//! Every decoder validates lengths before touching bytes: a short or
//! inconsistent PDU is an error, never a panic.

use crate::error::{Result, RpcError};
use crate::security::{calculate_auth_padding, AuthVerifier};
use bytes::{BufMut, Bytes, BytesMut};
use midl_ndr::NdrContext;

pub use midl_ndr::{CharRep, DataRepresentation, FloatRep, IntRep, Uuid};

/// DCE RPC protocol version
pub const DCE_RPC_VERSION: u8 = 5;
/// DCE RPC protocol minor version
pub const DCE_RPC_VERSION_MINOR: u8 = 0;

/// Default fragment size offered in bind PDUs
pub const DEFAULT_MAX_FRAG: u16 = 4280;

/// DCE RPC packet types (connection-oriented)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PacketType {
    Request = 0,
    Response = 2,
    Fault = 3,
    Bind = 11,
    BindAck = 12,
    BindNak = 13,
    AlterContext = 14,
    AlterContextResp = 15,
    /// Third leg of a three-leg authentication exchange
    Auth3 = 16,
    /// Server asks the client to close the association
    Shutdown = 17,
    /// Client cancels an outstanding call
    CoCancel = 18,
    /// Client abandons an outstanding call
    Orphaned = 19,
}

impl PacketType {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Request),
            2 => Some(Self::Response),
            3 => Some(Self::Fault),
            11 => Some(Self::Bind),
            12 => Some(Self::BindAck),
            13 => Some(Self::BindNak),
            14 => Some(Self::AlterContext),
            15 => Some(Self::AlterContextResp),
            16 => Some(Self::Auth3),
            17 => Some(Self::Shutdown),
            18 => Some(Self::CoCancel),
            19 => Some(Self::Orphaned),
            _ => None,
        }
    }
}

/// Packet flags
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PacketFlags(u8);

impl PacketFlags {
    /// First fragment
    pub const FIRST_FRAG: u8 = 0x01;
    /// Last fragment
    pub const LAST_FRAG: u8 = 0x02;
    /// Cancel pending
    pub const PENDING_CANCEL: u8 = 0x04;
    /// Reserved (must be zero)
    pub const RESERVED: u8 = 0x08;
    /// Supports concurrent multiplexing
    pub const CONC_MPX: u8 = 0x10;
    /// Did not execute
    pub const DID_NOT_EXECUTE: u8 = 0x20;
    /// Maybe semantics requested
    pub const MAYBE: u8 = 0x40;
    /// Object UUID present in a request
    pub const OBJECT_UUID: u8 = 0x80;

    pub fn new() -> Self {
        Self(0)
    }

    /// Create flags for a complete (non-fragmented) PDU
    pub fn complete() -> Self {
        Self(Self::FIRST_FRAG | Self::LAST_FRAG)
    }

    pub fn set_first_frag(&mut self) -> &mut Self {
        self.0 |= Self::FIRST_FRAG;
        self
    }

    pub fn set_last_frag(&mut self) -> &mut Self {
        self.0 |= Self::LAST_FRAG;
        self
    }

    pub fn set(&mut self, flag: u8) -> &mut Self {
        self.0 |= flag;
        self
    }

    pub fn clear(&mut self, flag: u8) -> &mut Self {
        self.0 &= !flag;
        self
    }

    pub fn contains(&self, flag: u8) -> bool {
        (self.0 & flag) != 0
    }

    pub fn is_first_frag(&self) -> bool {
        self.contains(Self::FIRST_FRAG)
    }

    pub fn is_last_frag(&self) -> bool {
        self.contains(Self::LAST_FRAG)
    }

    pub fn as_u8(&self) -> u8 {
        self.0
    }

    pub fn from_u8(value: u8) -> Self {
        Self(value)
    }
}

/// Syntax ID - interface UUID with version
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SyntaxId {
    pub uuid: Uuid,
    pub version: u32, // major in lower 16 bits, minor in upper 16 bits
}

impl SyntaxId {
    pub const fn new(uuid: Uuid, major: u16, minor: u16) -> Self {
        Self {
            uuid,
            version: (major as u32) | ((minor as u32) << 16),
        }
    }

    pub fn major_version(&self) -> u16 {
        self.version as u16
    }

    pub fn minor_version(&self) -> u16 {
        (self.version >> 16) as u16
    }

    /// True when a server offering `self` can serve a client asking for
    /// `requested`: same UUID, same major, and a minor at least as new.
    pub fn satisfies(&self, requested: &SyntaxId) -> bool {
        self.uuid == requested.uuid
            && self.major_version() == requested.major_version()
            && self.minor_version() >= requested.minor_version()
    }

    fn encode(&self, buf: &mut BytesMut, ctx: NdrContext) {
        self.uuid.put(buf, ctx);
        ctx.put_u32(buf, self.version);
    }

    fn decode(r: &mut WireReader<'_>) -> Result<Self> {
        let uuid = r.uuid("syntax uuid")?;
        let version = r.u32("syntax version")?;
        Ok(Self { uuid, version })
    }
}

impl std::fmt::Display for SyntaxId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} v{}.{}",
            self.uuid,
            self.major_version(),
            self.minor_version()
        )
    }
}

/// NDR Transfer Syntax UUID
pub const NDR_SYNTAX_UUID: &str = "8a885d04-1ceb-11c9-9fe8-08002b104860";
pub const NDR_SYNTAX_VERSION: u32 = 2;

/// NDR 2.0, the only transfer syntax this runtime speaks.
pub const NDR_TRANSFER_SYNTAX: SyntaxId = SyntaxId::new(
    Uuid {
        time_low: 0x8a885d04,
        time_mid: 0x1ceb,
        time_hi_and_version: 0x11c9,
        clock_seq_hi_and_reserved: 0x9f,
        clock_seq_low: 0xe8,
        node: [0x08, 0x00, 0x2b, 0x10, 0x48, 0x60],
    },
    NDR_SYNTAX_VERSION as u16,
    0,
);

/// Bounds-checked cursor over a received PDU.
///
/// Offsets are absolute within the PDU so that alignment matches the
/// sender's view.
struct WireReader<'a> {
    data: &'a [u8],
    pos: usize,
    ctx: NdrContext,
}

impl<'a> WireReader<'a> {
    fn new(data: &'a [u8], pos: usize, ctx: NdrContext) -> Self {
        Self { data, pos, ctx }
    }

    fn take(&mut self, len: usize, what: &str) -> Result<&'a [u8]> {
        let end = self
            .pos
            .checked_add(len)
            .filter(|end| *end <= self.data.len())
            .ok_or_else(|| RpcError::InvalidPduData(format!("truncated {what}")))?;
        let slice = &self.data[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn u8(&mut self, what: &str) -> Result<u8> {
        Ok(self.take(1, what)?[0])
    }

    fn u16(&mut self, what: &str) -> Result<u16> {
        let mut bytes = self.take(2, what)?;
        Ok(self.ctx.get_u16(&mut bytes))
    }

    fn u32(&mut self, what: &str) -> Result<u32> {
        let mut bytes = self.take(4, what)?;
        Ok(self.ctx.get_u32(&mut bytes))
    }

    fn uuid(&mut self, what: &str) -> Result<Uuid> {
        let mut bytes = self.take(16, what)?;
        Ok(Uuid::get(&mut bytes, self.ctx))
    }

    fn align(&mut self, alignment: usize, what: &str) -> Result<()> {
        let pad = NdrContext::align_padding(self.pos, alignment);
        self.take(pad, what).map(|_| ())
    }
}

/// Common PDU header (16 bytes)
#[derive(Debug, Clone)]
pub struct PduHeader {
    /// RPC version (should be 5)
    pub version: u8,
    /// RPC minor version (0 or 1)
    pub version_minor: u8,
    pub packet_type: PacketType,
    pub packet_flags: PacketFlags,
    pub data_rep: DataRepresentation,
    /// Total length of the PDU fragment
    pub frag_length: u16,
    /// Length of the auth_value in the trailer
    pub auth_length: u16,
    pub call_id: u32,
}

impl PduHeader {
    /// PDU header size in bytes
    pub const SIZE: usize = 16;

    pub fn new(packet_type: PacketType, call_id: u32) -> Self {
        Self {
            version: DCE_RPC_VERSION,
            version_minor: DCE_RPC_VERSION_MINOR,
            packet_type,
            packet_flags: PacketFlags::complete(),
            data_rep: DataRepresentation::ndr(),
            frag_length: 0, // set when encoding
            auth_length: 0,
            call_id,
        }
    }

    pub fn context(&self) -> NdrContext {
        NdrContext::with_data_rep(self.data_rep)
    }

    pub fn encode(&self, buf: &mut BytesMut) {
        let ctx = self.context();
        buf.put_u8(self.version);
        buf.put_u8(self.version_minor);
        buf.put_u8(self.packet_type as u8);
        buf.put_u8(self.packet_flags.as_u8());
        buf.put_slice(&self.data_rep.encode());
        ctx.put_u16(buf, self.frag_length);
        ctx.put_u16(buf, self.auth_length);
        ctx.put_u32(buf, self.call_id);
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        if data.len() < Self::SIZE {
            return Err(RpcError::InvalidPduData(format!(
                "PDU header too short: {} bytes",
                data.len()
            )));
        }

        let version = data[0];
        if version != DCE_RPC_VERSION {
            return Err(RpcError::VersionMismatch {
                expected: DCE_RPC_VERSION,
                got: version,
            });
        }
        let version_minor = data[1];
        if version_minor > 1 {
            return Err(RpcError::VersionMismatch {
                expected: DCE_RPC_VERSION_MINOR,
                got: version_minor,
            });
        }

        let packet_type =
            PacketType::from_u8(data[2]).ok_or(RpcError::InvalidMessageType(data[2]))?;
        let packet_flags = PacketFlags::from_u8(data[3]);
        let data_rep = DataRepresentation::decode([data[4], data[5], data[6], data[7]]);

        let mut r = WireReader::new(data, 8, NdrContext::with_data_rep(data_rep));
        let frag_length = r.u16("frag_length")?;
        let auth_length = r.u16("auth_length")?;
        let call_id = r.u32("call_id")?;

        Ok(Self {
            version,
            version_minor,
            packet_type,
            packet_flags,
            data_rep,
            frag_length,
            auth_length,
            call_id,
        })
    }

    /// Peek the fragment length of a PDU whose first 10 bytes are available.
    pub fn peek_frag_length(data: &[u8]) -> Option<u16> {
        let bytes = data.get(8..10)?;
        let little_endian = data[4] & 0xF0 != 0;
        Some(if little_endian {
            u16::from_le_bytes([bytes[0], bytes[1]])
        } else {
            u16::from_be_bytes([bytes[0], bytes[1]])
        })
    }

    /// Peek the call id of a PDU whose header may not decode, for
    /// addressing a fault at it.
    pub fn peek_call_id(data: &[u8]) -> Option<u32> {
        let bytes: [u8; 4] = data.get(12..16)?.try_into().ok()?;
        let little_endian = data[4] & 0xF0 != 0;
        Some(if little_endian {
            u32::from_le_bytes(bytes)
        } else {
            u32::from_be_bytes(bytes)
        })
    }
}

/// Start a PDU buffer with room for the header.
fn begin_pdu(capacity: usize) -> BytesMut {
    let mut buf = BytesMut::with_capacity(PduHeader::SIZE + capacity);
    buf.put_bytes(0, PduHeader::SIZE);
    buf
}

/// Append the auth trailer, then write the header with the final lengths.
fn finish_pdu(
    header: &PduHeader,
    mut buf: BytesMut,
    auth_verifier: Option<&AuthVerifier>,
) -> Result<Bytes> {
    let ctx = header.context();
    let auth_length = match auth_verifier {
        Some(auth) => {
            let auth_pad = calculate_auth_padding(buf.len(), auth.auth_type);
            buf.put_bytes(0, auth_pad);

            let mut auth_with_padding = auth.clone();
            auth_with_padding.auth_pad_length = auth_pad as u8;
            auth_with_padding.encode(&mut buf, ctx);
            auth.auth_value.len()
        }
        None => 0,
    };

    let max = u16::MAX as usize;
    if buf.len() > max {
        return Err(RpcError::PduTooLarge {
            size: buf.len(),
            max,
        });
    }

    let mut header = header.clone();
    header.frag_length = buf.len() as u16;
    header.auth_length = auth_length as u16;

    let mut header_buf = BytesMut::with_capacity(PduHeader::SIZE);
    header.encode(&mut header_buf);
    buf[..PduHeader::SIZE].copy_from_slice(&header_buf);

    Ok(buf.freeze())
}

/// Decode and check the header of a PDU expected to be `expected`.
fn open_pdu(data: &[u8], expected: PacketType) -> Result<PduHeader> {
    let header = PduHeader::decode(data)?;
    if header.packet_type != expected {
        return Err(RpcError::InvalidMessageType(header.packet_type as u8));
    }
    if header.frag_length as usize != data.len() {
        return Err(RpcError::FragLengthMismatch {
            declared: header.frag_length as usize,
            actual: data.len(),
        });
    }
    Ok(header)
}

/// Locate the auth trailer. Returns the end of the body (before the auth
/// padding) and the decoded verifier.
fn split_auth(
    header: &PduHeader,
    data: &[u8],
    body_start: usize,
) -> Result<(usize, Option<AuthVerifier>)> {
    if header.auth_length == 0 {
        return Ok((data.len(), None));
    }

    let trailer_len = AuthVerifier::HEADER_SIZE + header.auth_length as usize;
    let trailer_start = data
        .len()
        .checked_sub(trailer_len)
        .filter(|start| *start >= body_start)
        .ok_or_else(|| RpcError::InvalidPduData("auth trailer overruns PDU".into()))?;

    let verifier = AuthVerifier::decode(&data[trailer_start..], header.context())?;
    let body_end = trailer_start
        .checked_sub(verifier.auth_pad_length as usize)
        .filter(|end| *end >= body_start)
        .ok_or_else(|| RpcError::InvalidPduData("auth padding overruns body".into()))?;

    Ok((body_end, Some(verifier)))
}

/// Offset of the stub data within a PDU that may carry a signed stub.
pub fn stub_offset(header: &PduHeader) -> Option<usize> {
    match header.packet_type {
        PacketType::Request => {
            let object = if header.packet_flags.contains(PacketFlags::OBJECT_UUID) {
                16
            } else {
                0
            };
            Some(PduHeader::SIZE + RequestPdu::BODY_HEADER_SIZE + object)
        }
        PacketType::Response => Some(PduHeader::SIZE + ResponsePdu::BODY_HEADER_SIZE),
        PacketType::Fault => Some(PduHeader::SIZE + FaultPdu::BODY_HEADER_SIZE),
        _ => None,
    }
}

/// Context element for bind request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContextElement {
    pub context_id: u16,
    pub abstract_syntax: SyntaxId,
    pub transfer_syntaxes: Vec<SyntaxId>,
}

impl ContextElement {
    pub fn new(context_id: u16, abstract_syntax: SyntaxId, transfer_syntax: SyntaxId) -> Self {
        Self {
            context_id,
            abstract_syntax,
            transfer_syntaxes: vec![transfer_syntax],
        }
    }

    fn encode(&self, buf: &mut BytesMut, ctx: NdrContext) {
        ctx.put_u16(buf, self.context_id);
        buf.put_u8(self.transfer_syntaxes.len() as u8);
        buf.put_u8(0); // reserved
        self.abstract_syntax.encode(buf, ctx);
        for ts in &self.transfer_syntaxes {
            ts.encode(buf, ctx);
        }
    }

    fn decode(r: &mut WireReader<'_>) -> Result<Self> {
        let context_id = r.u16("context id")?;
        let num_transfer_syntaxes = r.u8("transfer syntax count")?;
        let _reserved = r.u8("context element")?;

        let abstract_syntax = SyntaxId::decode(r)?;
        let mut transfer_syntaxes = Vec::with_capacity(num_transfer_syntaxes as usize);
        for _ in 0..num_transfer_syntaxes {
            transfer_syntaxes.push(SyntaxId::decode(r)?);
        }

        Ok(Self {
            context_id,
            abstract_syntax,
            transfer_syntaxes,
        })
    }
}

/// Body shared by bind and alter_context.
#[derive(Debug, Clone)]
struct ContextListBody {
    max_xmit_frag: u16,
    max_recv_frag: u16,
    assoc_group_id: u32,
    context_list: Vec<ContextElement>,
}

impl ContextListBody {
    fn encode(&self, buf: &mut BytesMut, ctx: NdrContext) -> Result<()> {
        if self.context_list.len() > u8::MAX as usize {
            return Err(RpcError::InvalidPduData(format!(
                "{} presentation contexts do not fit one PDU",
                self.context_list.len()
            )));
        }
        ctx.put_u16(buf, self.max_xmit_frag);
        ctx.put_u16(buf, self.max_recv_frag);
        ctx.put_u32(buf, self.assoc_group_id);

        // p_cont_list_t
        buf.put_u8(self.context_list.len() as u8);
        buf.put_u8(0); // reserved
        ctx.put_u16(buf, 0); // reserved2
        for element in &self.context_list {
            element.encode(buf, ctx);
        }
        Ok(())
    }

    fn decode(r: &mut WireReader<'_>) -> Result<Self> {
        let max_xmit_frag = r.u16("max_xmit_frag")?;
        let max_recv_frag = r.u16("max_recv_frag")?;
        let assoc_group_id = r.u32("assoc_group_id")?;

        let num_contexts = r.u8("context count")?;
        let _reserved = r.u8("context list")?;
        let _reserved2 = r.u16("context list")?;

        let mut context_list = Vec::with_capacity(num_contexts as usize);
        for _ in 0..num_contexts {
            context_list.push(ContextElement::decode(r)?);
        }

        Ok(Self {
            max_xmit_frag,
            max_recv_frag,
            assoc_group_id,
            context_list,
        })
    }
}

/// Bind PDU
#[derive(Debug, Clone)]
pub struct BindPdu {
    pub header: PduHeader,
    pub max_xmit_frag: u16,
    pub max_recv_frag: u16,
    pub assoc_group_id: u32,
    pub context_list: Vec<ContextElement>,
    /// Optional authentication verifier
    pub auth_verifier: Option<AuthVerifier>,
}

impl BindPdu {
    pub fn new(call_id: u32, interface: SyntaxId) -> Self {
        Self::with_contexts(
            call_id,
            vec![ContextElement::new(0, interface, NDR_TRANSFER_SYNTAX)],
        )
    }

    pub fn with_contexts(call_id: u32, context_list: Vec<ContextElement>) -> Self {
        Self {
            header: PduHeader::new(PacketType::Bind, call_id),
            max_xmit_frag: DEFAULT_MAX_FRAG,
            max_recv_frag: DEFAULT_MAX_FRAG,
            assoc_group_id: 0,
            context_list,
            auth_verifier: None,
        }
    }

    pub fn encode(&self) -> Result<Bytes> {
        let mut buf = begin_pdu(128);
        ContextListBody {
            max_xmit_frag: self.max_xmit_frag,
            max_recv_frag: self.max_recv_frag,
            assoc_group_id: self.assoc_group_id,
            context_list: self.context_list.clone(),
        }
        .encode(&mut buf, self.header.context())?;
        finish_pdu(&self.header, buf, self.auth_verifier.as_ref())
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        let header = open_pdu(data, PacketType::Bind)?;
        let (body_end, auth_verifier) = split_auth(&header, data, PduHeader::SIZE)?;
        let mut r = WireReader::new(&data[..body_end], PduHeader::SIZE, header.context());
        let body = ContextListBody::decode(&mut r)?;

        Ok(Self {
            header,
            max_xmit_frag: body.max_xmit_frag,
            max_recv_frag: body.max_recv_frag,
            assoc_group_id: body.assoc_group_id,
            context_list: body.context_list,
            auth_verifier,
        })
    }
}

/// Alter Context PDU
///
/// Adds presentation contexts to an existing association, or continues a
/// security negotiation.
#[derive(Debug, Clone)]
pub struct AlterContextPdu {
    pub header: PduHeader,
    pub max_xmit_frag: u16,
    pub max_recv_frag: u16,
    pub assoc_group_id: u32,
    pub context_list: Vec<ContextElement>,
    pub auth_verifier: Option<AuthVerifier>,
}

impl AlterContextPdu {
    pub fn new(call_id: u32, context_list: Vec<ContextElement>) -> Self {
        Self {
            header: PduHeader::new(PacketType::AlterContext, call_id),
            max_xmit_frag: DEFAULT_MAX_FRAG,
            max_recv_frag: DEFAULT_MAX_FRAG,
            assoc_group_id: 0,
            context_list,
            auth_verifier: None,
        }
    }

    pub fn encode(&self) -> Result<Bytes> {
        let mut buf = begin_pdu(128);
        ContextListBody {
            max_xmit_frag: self.max_xmit_frag,
            max_recv_frag: self.max_recv_frag,
            assoc_group_id: self.assoc_group_id,
            context_list: self.context_list.clone(),
        }
        .encode(&mut buf, self.header.context())?;
        finish_pdu(&self.header, buf, self.auth_verifier.as_ref())
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        let header = open_pdu(data, PacketType::AlterContext)?;
        let (body_end, auth_verifier) = split_auth(&header, data, PduHeader::SIZE)?;
        let mut r = WireReader::new(&data[..body_end], PduHeader::SIZE, header.context());
        let body = ContextListBody::decode(&mut r)?;

        Ok(Self {
            header,
            max_xmit_frag: body.max_xmit_frag,
            max_recv_frag: body.max_recv_frag,
            assoc_group_id: body.assoc_group_id,
            context_list: body.context_list,
            auth_verifier,
        })
    }
}

/// Context result for bind acknowledgment
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum ContextResult {
    Acceptance = 0,
    UserRejection = 1,
    ProviderRejection = 2,
}

impl ContextResult {
    pub fn from_u16(value: u16) -> Self {
        match value {
            0 => Self::Acceptance,
            1 => Self::UserRejection,
            _ => Self::ProviderRejection,
        }
    }
}

/// Why a provider rejected a presentation context
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum ProviderReason {
    NotSpecified = 0,
    AbstractSyntaxNotSupported = 1,
    ProposedTransferSyntaxesNotSupported = 2,
    LocalLimitExceeded = 3,
}

impl ProviderReason {
    pub fn from_u16(value: u16) -> Self {
        match value {
            1 => Self::AbstractSyntaxNotSupported,
            2 => Self::ProposedTransferSyntaxesNotSupported,
            3 => Self::LocalLimitExceeded,
            _ => Self::NotSpecified,
        }
    }
}

/// Per-context entry of a bind_ack or alter_context_resp
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PresentationResult {
    pub result: ContextResult,
    pub reason: ProviderReason,
    pub transfer_syntax: SyntaxId,
}

impl PresentationResult {
    pub fn accepted(transfer_syntax: SyntaxId) -> Self {
        Self {
            result: ContextResult::Acceptance,
            reason: ProviderReason::NotSpecified,
            transfer_syntax,
        }
    }

    pub fn rejected(reason: ProviderReason) -> Self {
        Self {
            result: ContextResult::ProviderRejection,
            reason,
            transfer_syntax: SyntaxId::new(Uuid::NIL, 0, 0),
        }
    }

    pub fn is_accepted(&self) -> bool {
        self.result == ContextResult::Acceptance
    }
}

/// Body shared by bind_ack and alter_context_resp.
#[derive(Debug, Clone)]
struct ResultListBody {
    max_xmit_frag: u16,
    max_recv_frag: u16,
    assoc_group_id: u32,
    secondary_addr: String,
    results: Vec<PresentationResult>,
}

impl ResultListBody {
    fn encode(&self, buf: &mut BytesMut, ctx: NdrContext) -> Result<()> {
        if self.results.len() > u8::MAX as usize || self.secondary_addr.len() >= u16::MAX as usize
        {
            return Err(RpcError::InvalidPduData("result list too large".into()));
        }
        ctx.put_u16(buf, self.max_xmit_frag);
        ctx.put_u16(buf, self.max_recv_frag);
        ctx.put_u32(buf, self.assoc_group_id);

        // Secondary address (port as string), length includes the NUL
        if self.secondary_addr.is_empty() {
            ctx.put_u16(buf, 0);
        } else {
            ctx.put_u16(buf, self.secondary_addr.len() as u16 + 1);
            buf.put_slice(self.secondary_addr.as_bytes());
            buf.put_u8(0);
        }
        buf.put_bytes(0, NdrContext::align_padding(buf.len(), 4));

        // p_result_list_t
        buf.put_u8(self.results.len() as u8);
        buf.put_u8(0); // reserved
        ctx.put_u16(buf, 0); // reserved2
        for result in &self.results {
            ctx.put_u16(buf, result.result as u16);
            ctx.put_u16(buf, result.reason as u16);
            result.transfer_syntax.encode(buf, ctx);
        }
        Ok(())
    }

    fn decode(r: &mut WireReader<'_>) -> Result<Self> {
        let max_xmit_frag = r.u16("max_xmit_frag")?;
        let max_recv_frag = r.u16("max_recv_frag")?;
        let assoc_group_id = r.u32("assoc_group_id")?;

        let sec_addr_len = r.u16("secondary address length")? as usize;
        let mut sec_addr_bytes = r.take(sec_addr_len, "secondary address")?;
        if let Some((0, rest)) = sec_addr_bytes.split_last() {
            sec_addr_bytes = rest;
        }
        let secondary_addr = String::from_utf8_lossy(sec_addr_bytes).into_owned();
        r.align(4, "secondary address padding")?;

        let num_results = r.u8("result count")?;
        let _reserved = r.u8("result list")?;
        let _reserved2 = r.u16("result list")?;

        let mut results = Vec::with_capacity(num_results as usize);
        for _ in 0..num_results {
            let result = ContextResult::from_u16(r.u16("context result")?);
            let reason = ProviderReason::from_u16(r.u16("provider reason")?);
            let transfer_syntax = SyntaxId::decode(r)?;
            results.push(PresentationResult {
                result,
                reason,
                transfer_syntax,
            });
        }

        Ok(Self {
            max_xmit_frag,
            max_recv_frag,
            assoc_group_id,
            secondary_addr,
            results,
        })
    }
}

/// Bind acknowledgment PDU
#[derive(Debug, Clone)]
pub struct BindAckPdu {
    pub header: PduHeader,
    pub max_xmit_frag: u16,
    pub max_recv_frag: u16,
    pub assoc_group_id: u32,
    pub secondary_addr: String,
    pub results: Vec<PresentationResult>,
    /// Optional authentication verifier
    pub auth_verifier: Option<AuthVerifier>,
}

impl BindAckPdu {
    pub fn new(call_id: u32, assoc_group_id: u32, results: Vec<PresentationResult>) -> Self {
        Self {
            header: PduHeader::new(PacketType::BindAck, call_id),
            max_xmit_frag: DEFAULT_MAX_FRAG,
            max_recv_frag: DEFAULT_MAX_FRAG,
            assoc_group_id,
            secondary_addr: String::new(),
            results,
            auth_verifier: None,
        }
    }

    pub fn encode(&self) -> Result<Bytes> {
        let mut buf = begin_pdu(128);
        ResultListBody {
            max_xmit_frag: self.max_xmit_frag,
            max_recv_frag: self.max_recv_frag,
            assoc_group_id: self.assoc_group_id,
            secondary_addr: self.secondary_addr.clone(),
            results: self.results.clone(),
        }
        .encode(&mut buf, self.header.context())?;
        finish_pdu(&self.header, buf, self.auth_verifier.as_ref())
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        let header = open_pdu(data, PacketType::BindAck)?;
        let (body_end, auth_verifier) = split_auth(&header, data, PduHeader::SIZE)?;
        let mut r = WireReader::new(&data[..body_end], PduHeader::SIZE, header.context());
        let body = ResultListBody::decode(&mut r)?;

        Ok(Self {
            header,
            max_xmit_frag: body.max_xmit_frag,
            max_recv_frag: body.max_recv_frag,
            assoc_group_id: body.assoc_group_id,
            secondary_addr: body.secondary_addr,
            results: body.results,
            auth_verifier,
        })
    }
}

/// Alter Context Response PDU
#[derive(Debug, Clone)]
pub struct AlterContextRespPdu {
    pub header: PduHeader,
    pub max_xmit_frag: u16,
    pub max_recv_frag: u16,
    pub assoc_group_id: u32,
    pub secondary_addr: String,
    pub results: Vec<PresentationResult>,
    pub auth_verifier: Option<AuthVerifier>,
}

impl AlterContextRespPdu {
    pub fn new(call_id: u32, assoc_group_id: u32, results: Vec<PresentationResult>) -> Self {
        Self {
            header: PduHeader::new(PacketType::AlterContextResp, call_id),
            max_xmit_frag: DEFAULT_MAX_FRAG,
            max_recv_frag: DEFAULT_MAX_FRAG,
            assoc_group_id,
            secondary_addr: String::new(),
            results,
            auth_verifier: None,
        }
    }

    pub fn encode(&self) -> Result<Bytes> {
        let mut buf = begin_pdu(128);
        ResultListBody {
            max_xmit_frag: self.max_xmit_frag,
            max_recv_frag: self.max_recv_frag,
            assoc_group_id: self.assoc_group_id,
            secondary_addr: self.secondary_addr.clone(),
            results: self.results.clone(),
        }
        .encode(&mut buf, self.header.context())?;
        finish_pdu(&self.header, buf, self.auth_verifier.as_ref())
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        let header = open_pdu(data, PacketType::AlterContextResp)?;
        let (body_end, auth_verifier) = split_auth(&header, data, PduHeader::SIZE)?;
        let mut r = WireReader::new(&data[..body_end], PduHeader::SIZE, header.context());
        let body = ResultListBody::decode(&mut r)?;

        Ok(Self {
            header,
            max_xmit_frag: body.max_xmit_frag,
            max_recv_frag: body.max_recv_frag,
            assoc_group_id: body.assoc_group_id,
            secondary_addr: body.secondary_addr,
            results: body.results,
            auth_verifier,
        })
    }
}

/// Reasons carried by a bind_nak
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum RejectReason {
    NotSpecified = 0,
    TemporaryCongestion = 1,
    LocalLimitExceeded = 2,
    CalledPaddrUnknown = 3,
    ProtocolVersionNotSupported = 4,
    DefaultContextNotSupported = 5,
    UserDataNotReadable = 6,
    NoPsapAvailable = 7,
    AuthenticationTypeNotRecognized = 8,
    InvalidChecksum = 9,
}

impl RejectReason {
    pub fn from_u16(value: u16) -> Self {
        match value {
            1 => Self::TemporaryCongestion,
            2 => Self::LocalLimitExceeded,
            3 => Self::CalledPaddrUnknown,
            4 => Self::ProtocolVersionNotSupported,
            5 => Self::DefaultContextNotSupported,
            6 => Self::UserDataNotReadable,
            7 => Self::NoPsapAvailable,
            8 => Self::AuthenticationTypeNotRecognized,
            9 => Self::InvalidChecksum,
            _ => Self::NotSpecified,
        }
    }
}

/// Bind rejection PDU
#[derive(Debug, Clone)]
pub struct BindNakPdu {
    pub header: PduHeader,
    pub reject_reason: RejectReason,
    /// Supported (major, minor) protocol versions
    pub versions: Vec<(u8, u8)>,
}

impl BindNakPdu {
    pub fn new(call_id: u32, reject_reason: RejectReason) -> Self {
        Self {
            header: PduHeader::new(PacketType::BindNak, call_id),
            reject_reason,
            versions: vec![(DCE_RPC_VERSION, DCE_RPC_VERSION_MINOR)],
        }
    }

    pub fn encode(&self) -> Result<Bytes> {
        let mut buf = begin_pdu(8);
        let ctx = self.header.context();
        let versions = &self.versions[..self.versions.len().min(u8::MAX as usize)];
        ctx.put_u16(&mut buf, self.reject_reason as u16);
        buf.put_u8(versions.len() as u8);
        for (major, minor) in versions {
            buf.put_u8(*major);
            buf.put_u8(*minor);
        }
        finish_pdu(&self.header, buf, None)
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        let header = open_pdu(data, PacketType::BindNak)?;
        let mut r = WireReader::new(data, PduHeader::SIZE, header.context());
        let reject_reason = RejectReason::from_u16(r.u16("reject reason")?);

        // The version list is optional in practice
        let mut versions = Vec::new();
        if let Ok(count) = r.u8("version count") {
            for _ in 0..count {
                versions.push((r.u8("version")?, r.u8("version")?));
            }
        }

        Ok(Self {
            header,
            reject_reason,
            versions,
        })
    }
}

/// Request PDU
#[derive(Debug, Clone)]
pub struct RequestPdu {
    pub header: PduHeader,
    pub alloc_hint: u32,
    pub context_id: u16,
    pub opnum: u16,
    pub object_uuid: Option<Uuid>,
    pub stub_data: Bytes,
    /// Optional authentication verifier
    pub auth_verifier: Option<AuthVerifier>,
}

impl RequestPdu {
    /// alloc_hint(4) + context_id(2) + opnum(2)
    pub const BODY_HEADER_SIZE: usize = 8;

    pub fn new(call_id: u32, opnum: u16, stub_data: Bytes) -> Self {
        Self {
            header: PduHeader::new(PacketType::Request, call_id),
            alloc_hint: stub_data.len() as u32,
            context_id: 0,
            opnum,
            object_uuid: None,
            stub_data,
            auth_verifier: None,
        }
    }

    pub fn encode(&self) -> Result<Bytes> {
        let mut buf = begin_pdu(Self::BODY_HEADER_SIZE + 16 + self.stub_data.len() + 64);
        let ctx = self.header.context();

        ctx.put_u32(&mut buf, self.alloc_hint);
        ctx.put_u16(&mut buf, self.context_id);
        ctx.put_u16(&mut buf, self.opnum);
        if let Some(uuid) = &self.object_uuid {
            uuid.put(&mut buf, ctx);
        }
        buf.put_slice(&self.stub_data);

        let mut header = self.header.clone();
        if self.object_uuid.is_some() {
            header.packet_flags.set(PacketFlags::OBJECT_UUID);
        } else {
            header.packet_flags.clear(PacketFlags::OBJECT_UUID);
        }
        finish_pdu(&header, buf, self.auth_verifier.as_ref())
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        let header = open_pdu(data, PacketType::Request)?;
        let mut r = WireReader::new(data, PduHeader::SIZE, header.context());

        let alloc_hint = r.u32("alloc_hint")?;
        let context_id = r.u16("context id")?;
        let opnum = r.u16("opnum")?;
        let object_uuid = if header.packet_flags.contains(PacketFlags::OBJECT_UUID) {
            Some(r.uuid("object uuid")?)
        } else {
            None
        };

        let (body_end, auth_verifier) = split_auth(&header, data, r.pos)?;
        let stub_data = Bytes::copy_from_slice(&data[r.pos..body_end]);

        Ok(Self {
            header,
            alloc_hint,
            context_id,
            opnum,
            object_uuid,
            stub_data,
            auth_verifier,
        })
    }
}

/// Response PDU
#[derive(Debug, Clone)]
pub struct ResponsePdu {
    pub header: PduHeader,
    pub alloc_hint: u32,
    pub context_id: u16,
    pub cancel_count: u8,
    pub stub_data: Bytes,
    /// Optional authentication verifier
    pub auth_verifier: Option<AuthVerifier>,
}

impl ResponsePdu {
    /// alloc_hint(4) + context_id(2) + cancel_count(1) + reserved(1)
    pub const BODY_HEADER_SIZE: usize = 8;

    pub fn new(call_id: u32, stub_data: Bytes) -> Self {
        Self {
            header: PduHeader::new(PacketType::Response, call_id),
            alloc_hint: stub_data.len() as u32,
            context_id: 0,
            cancel_count: 0,
            stub_data,
            auth_verifier: None,
        }
    }

    pub fn encode(&self) -> Result<Bytes> {
        let mut buf = begin_pdu(Self::BODY_HEADER_SIZE + self.stub_data.len() + 64);
        let ctx = self.header.context();

        ctx.put_u32(&mut buf, self.alloc_hint);
        ctx.put_u16(&mut buf, self.context_id);
        buf.put_u8(self.cancel_count);
        buf.put_u8(0); // reserved
        buf.put_slice(&self.stub_data);

        finish_pdu(&self.header, buf, self.auth_verifier.as_ref())
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        let header = open_pdu(data, PacketType::Response)?;
        let mut r = WireReader::new(data, PduHeader::SIZE, header.context());

        let alloc_hint = r.u32("alloc_hint")?;
        let context_id = r.u16("context id")?;
        let cancel_count = r.u8("cancel count")?;
        let _reserved = r.u8("response header")?;

        let (body_end, auth_verifier) = split_auth(&header, data, r.pos)?;
        let stub_data = Bytes::copy_from_slice(&data[r.pos..body_end]);

        Ok(Self {
            header,
            alloc_hint,
            context_id,
            cancel_count,
            stub_data,
            auth_verifier,
        })
    }
}

/// Fault status codes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum FaultStatus {
    /// Access denied
    AccessDenied = 0x00000005,
    /// Invalid context handle
    InvalidHandle = 0x00000006,
    /// Stub data could not be unmarshalled
    BadStubData = 0x000006f7,
    /// Security package error
    SecPkgError = 0x00000721,
    /// General RPC error
    RpcError = 0x1c000000,
    /// Invalid union discriminant
    InvalidTag = 0x1c000006,
    /// Transfer syntax not supported
    NdrVersion = 0x1c000008,
    /// Call cancelled
    Cancel = 0x1c00000d,
    /// Server out of resources
    RemoteNoMemory = 0x1c000010,
    /// Context mismatch
    ContextMismatch = 0x1c00001a,
    /// Operation number out of range
    OpRngError = 0x1c010002,
    /// Unknown interface
    UnkIf = 0x1c010003,
    /// Protocol error
    ProtoError = 0x1c01000b,
}

impl From<FaultStatus> for u32 {
    fn from(status: FaultStatus) -> Self {
        status as u32
    }
}

/// Fault PDU
#[derive(Debug, Clone)]
pub struct FaultPdu {
    pub header: PduHeader,
    pub alloc_hint: u32,
    pub context_id: u16,
    pub cancel_count: u8,
    pub status: u32,
    pub stub_data: Bytes,
    pub auth_verifier: Option<AuthVerifier>,
}

impl FaultPdu {
    /// alloc_hint(4) + context_id(2) + cancel_count(1) + reserved(1) + status(4) + reserved(4)
    pub const BODY_HEADER_SIZE: usize = 16;

    pub fn new(call_id: u32, status: impl Into<u32>) -> Self {
        Self {
            header: PduHeader::new(PacketType::Fault, call_id),
            alloc_hint: 0,
            context_id: 0,
            cancel_count: 0,
            status: status.into(),
            stub_data: Bytes::new(),
            auth_verifier: None,
        }
    }

    /// Mark the fault as raised before the server ran the operation.
    pub fn with_did_not_execute(mut self) -> Self {
        self.header.packet_flags.set(PacketFlags::DID_NOT_EXECUTE);
        self
    }

    pub fn did_not_execute(&self) -> bool {
        self.header.packet_flags.contains(PacketFlags::DID_NOT_EXECUTE)
    }

    pub fn encode(&self) -> Result<Bytes> {
        let mut buf = begin_pdu(Self::BODY_HEADER_SIZE + self.stub_data.len() + 32);
        let ctx = self.header.context();

        ctx.put_u32(&mut buf, self.alloc_hint);
        ctx.put_u16(&mut buf, self.context_id);
        buf.put_u8(self.cancel_count);
        buf.put_u8(0); // reserved
        ctx.put_u32(&mut buf, self.status);
        ctx.put_u32(&mut buf, 0); // reserved
        buf.put_slice(&self.stub_data);

        finish_pdu(&self.header, buf, self.auth_verifier.as_ref())
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        let header = open_pdu(data, PacketType::Fault)?;
        let mut r = WireReader::new(data, PduHeader::SIZE, header.context());

        let alloc_hint = r.u32("alloc_hint")?;
        let context_id = r.u16("context id")?;
        let cancel_count = r.u8("cancel count")?;
        let _reserved = r.u8("fault header")?;
        let status = r.u32("fault status")?;
        let _reserved2 = r.u32("fault header")?;

        let (body_end, auth_verifier) = split_auth(&header, data, r.pos)?;
        let stub_data = Bytes::copy_from_slice(&data[r.pos..body_end]);

        Ok(Self {
            header,
            alloc_hint,
            context_id,
            cancel_count,
            status,
            stub_data,
            auth_verifier,
        })
    }
}

/// Auth3 PDU (MS-RPCE extension)
///
/// Completes a three-leg authentication after bind_ack. The server sends no
/// reply.
///
/// Wire format:
/// - Common header (16 bytes)
/// - max_xmit_frag (2 bytes)
/// - max_recv_frag (2 bytes)
/// - auth_verifier
#[derive(Debug, Clone)]
pub struct Auth3Pdu {
    pub header: PduHeader,
    pub max_xmit_frag: u16,
    pub max_recv_frag: u16,
    pub auth_verifier: AuthVerifier,
}

impl Auth3Pdu {
    pub fn new(call_id: u32, auth_verifier: AuthVerifier) -> Self {
        Self {
            header: PduHeader::new(PacketType::Auth3, call_id),
            max_xmit_frag: DEFAULT_MAX_FRAG,
            max_recv_frag: DEFAULT_MAX_FRAG,
            auth_verifier,
        }
    }

    pub fn encode(&self) -> Result<Bytes> {
        let mut buf =
            begin_pdu(4 + AuthVerifier::HEADER_SIZE + self.auth_verifier.auth_value.len());
        let ctx = self.header.context();
        ctx.put_u16(&mut buf, self.max_xmit_frag);
        ctx.put_u16(&mut buf, self.max_recv_frag);
        finish_pdu(&self.header, buf, Some(&self.auth_verifier))
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        let header = open_pdu(data, PacketType::Auth3)?;
        let mut r = WireReader::new(data, PduHeader::SIZE, header.context());
        let max_xmit_frag = r.u16("max_xmit_frag")?;
        let max_recv_frag = r.u16("max_recv_frag")?;

        let (_, auth_verifier) = split_auth(&header, data, r.pos)?;
        let auth_verifier = auth_verifier
            .ok_or_else(|| RpcError::InvalidPduData("auth3 without auth verifier".into()))?;

        Ok(Self {
            header,
            max_xmit_frag,
            max_recv_frag,
            auth_verifier,
        })
    }
}

/// Header-only PDU: shutdown, co_cancel and orphaned
#[derive(Debug, Clone)]
pub struct ControlPdu {
    pub header: PduHeader,
    pub auth_verifier: Option<AuthVerifier>,
}

impl ControlPdu {
    pub fn shutdown(call_id: u32) -> Self {
        Self::new(PacketType::Shutdown, call_id)
    }

    pub fn cancel(call_id: u32) -> Self {
        Self::new(PacketType::CoCancel, call_id)
    }

    pub fn orphaned(call_id: u32) -> Self {
        Self::new(PacketType::Orphaned, call_id)
    }

    fn new(packet_type: PacketType, call_id: u32) -> Self {
        Self {
            header: PduHeader::new(packet_type, call_id),
            auth_verifier: None,
        }
    }

    pub fn encode(&self) -> Result<Bytes> {
        finish_pdu(&self.header, begin_pdu(0), self.auth_verifier.as_ref())
    }

    fn decode(data: &[u8], packet_type: PacketType) -> Result<Self> {
        let header = open_pdu(data, packet_type)?;
        let (_, auth_verifier) = split_auth(&header, data, PduHeader::SIZE)?;
        Ok(Self {
            header,
            auth_verifier,
        })
    }
}

/// Represents any connection-oriented DCE RPC PDU
#[derive(Debug, Clone)]
pub enum Pdu {
    Bind(BindPdu),
    BindAck(BindAckPdu),
    BindNak(BindNakPdu),
    Auth3(Auth3Pdu),
    AlterContext(AlterContextPdu),
    AlterContextResp(AlterContextRespPdu),
    Request(RequestPdu),
    Response(ResponsePdu),
    Fault(FaultPdu),
    Shutdown(ControlPdu),
    CoCancel(ControlPdu),
    Orphaned(ControlPdu),
}

impl Pdu {
    /// Decode a PDU from raw bytes
    pub fn decode(data: &[u8]) -> Result<Self> {
        let header = PduHeader::decode(data)?;
        Ok(match header.packet_type {
            PacketType::Bind => Pdu::Bind(BindPdu::decode(data)?),
            PacketType::BindAck => Pdu::BindAck(BindAckPdu::decode(data)?),
            PacketType::BindNak => Pdu::BindNak(BindNakPdu::decode(data)?),
            PacketType::Auth3 => Pdu::Auth3(Auth3Pdu::decode(data)?),
            PacketType::AlterContext => Pdu::AlterContext(AlterContextPdu::decode(data)?),
            PacketType::AlterContextResp => {
                Pdu::AlterContextResp(AlterContextRespPdu::decode(data)?)
            }
            PacketType::Request => Pdu::Request(RequestPdu::decode(data)?),
            PacketType::Response => Pdu::Response(ResponsePdu::decode(data)?),
            PacketType::Fault => Pdu::Fault(FaultPdu::decode(data)?),
            PacketType::Shutdown => Pdu::Shutdown(ControlPdu::decode(data, PacketType::Shutdown)?),
            PacketType::CoCancel => Pdu::CoCancel(ControlPdu::decode(data, PacketType::CoCancel)?),
            PacketType::Orphaned => Pdu::Orphaned(ControlPdu::decode(data, PacketType::Orphaned)?),
        })
    }

    /// Encode the PDU to bytes
    pub fn encode(&self) -> Result<Bytes> {
        match self {
            Pdu::Bind(pdu) => pdu.encode(),
            Pdu::BindAck(pdu) => pdu.encode(),
            Pdu::BindNak(pdu) => pdu.encode(),
            Pdu::Auth3(pdu) => pdu.encode(),
            Pdu::AlterContext(pdu) => pdu.encode(),
            Pdu::AlterContextResp(pdu) => pdu.encode(),
            Pdu::Request(pdu) => pdu.encode(),
            Pdu::Response(pdu) => pdu.encode(),
            Pdu::Fault(pdu) => pdu.encode(),
            Pdu::Shutdown(pdu) | Pdu::CoCancel(pdu) | Pdu::Orphaned(pdu) => pdu.encode(),
        }
    }

    pub fn header(&self) -> &PduHeader {
        match self {
            Pdu::Bind(pdu) => &pdu.header,
            Pdu::BindAck(pdu) => &pdu.header,
            Pdu::BindNak(pdu) => &pdu.header,
            Pdu::Auth3(pdu) => &pdu.header,
            Pdu::AlterContext(pdu) => &pdu.header,
            Pdu::AlterContextResp(pdu) => &pdu.header,
            Pdu::Request(pdu) => &pdu.header,
            Pdu::Response(pdu) => &pdu.header,
            Pdu::Fault(pdu) => &pdu.header,
            Pdu::Shutdown(pdu) | Pdu::CoCancel(pdu) | Pdu::Orphaned(pdu) => &pdu.header,
        }
    }

    /// Get the call ID from the PDU header
    pub fn call_id(&self) -> u32 {
        self.header().call_id
    }
}
