//! DCE RPC Security Support
//!
//! This module provides authentication and per-PDU protection for DCE RPC.
//!
//! Authentication is pluggable: a [`SecurityProvider`] hands out
//! [`AuthSession`]s that exchange opaque tokens during bind, alter_context
//! and auth3. Once a session completes it yields a session key, from which a
//! [`SecurityContext`] derives directional signing and sealing keys.
//!
//! Protection levels:
//! - Integrity: HMAC-SHA256 over the sequence number and the PDU up to the
//!   verifier, truncated to 16 bytes
//! - Privacy: ChaCha20-Poly1305 over the stub and padding, with the header
//!   and trailer header as associated data
//!
//! Wire format follows MS-RPCE 2.2.2.11 for the auth trailer.

use crate::dcerpc::{stub_offset, PacketType, PduHeader};
use crate::error::{Result, RpcError};
use bytes::{BufMut, Bytes, BytesMut};
use midl_ndr::NdrContext;
use parking_lot::Mutex;
use ring::{aead, hkdf, hmac};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

/// Authentication types (MS-RPCE Section 2.2.1.1.7)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum AuthType {
    /// No authentication
    None = 0,
    /// OSF DCE private key authentication, used here for the shared-key provider
    DcePrivate = 1,
    /// OSF DCE public key authentication (deprecated)
    DcePublic = 2,
    /// GSS Negotiate (SPNEGO)
    GssNegotiate = 9,
    /// Windows NT LAN Manager (NTLM)
    Ntlm = 10,
    /// GSS Kerberos (also known as DCE Kerberos, auth type 16)
    GssKerberos = 16,
    /// Netlogon secure channel
    Netlogon = 68,
}

impl AuthType {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::None),
            1 => Some(Self::DcePrivate),
            2 => Some(Self::DcePublic),
            9 => Some(Self::GssNegotiate),
            10 => Some(Self::Ntlm),
            16 => Some(Self::GssKerberos),
            68 => Some(Self::Netlogon),
            _ => None,
        }
    }
}

/// Authentication levels (MS-RPCE Section 2.2.1.1.8)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
#[repr(u8)]
pub enum AuthLevel {
    /// No authentication
    #[default]
    None = 1,
    /// Connect-level authentication (authenticate at connection)
    Connect = 2,
    /// Call-level authentication (authenticate each call)
    Call = 3,
    /// Packet-level authentication (authenticate each packet)
    Pkt = 4,
    /// Packet integrity (sign each packet)
    PktIntegrity = 5,
    /// Packet privacy (encrypt each packet)
    PktPrivacy = 6,
}

impl AuthLevel {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(Self::None),
            2 => Some(Self::Connect),
            3 => Some(Self::Call),
            4 => Some(Self::Pkt),
            5 => Some(Self::PktIntegrity),
            6 => Some(Self::PktPrivacy),
            _ => None,
        }
    }

    /// Returns true if this level requires message signing
    pub fn requires_signing(&self) -> bool {
        self.protection_level() != ProtectionLevel::None
    }

    /// Returns true if this level requires message encryption
    pub fn requires_encryption(&self) -> bool {
        matches!(self, Self::PktPrivacy)
    }

    /// Per-PDU protection applied at this level.
    ///
    /// Call and Pkt levels are signed like PktIntegrity.
    pub fn protection_level(&self) -> ProtectionLevel {
        match self {
            Self::None | Self::Connect => ProtectionLevel::None,
            Self::Call | Self::Pkt | Self::PktIntegrity => ProtectionLevel::Integrity,
            Self::PktPrivacy => ProtectionLevel::Privacy,
        }
    }
}

impl FromStr for AuthLevel {
    type Err = RpcError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "none" => Ok(Self::None),
            "connect" => Ok(Self::Connect),
            "call" => Ok(Self::Call),
            "pkt" | "packet" => Ok(Self::Pkt),
            "integrity" | "pkt_integrity" => Ok(Self::PktIntegrity),
            "privacy" | "pkt_privacy" => Ok(Self::PktPrivacy),
            other => Err(RpcError::InvalidPduData(format!(
                "unknown authentication level: {other}"
            ))),
        }
    }
}

/// Protection applied to each request, response and fault PDU
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ProtectionLevel {
    None,
    Integrity,
    Privacy,
}

/// Authentication verifier (appended to authenticated PDUs)
///
/// Wire format (MS-RPCE 2.2.2.11):
/// ```text
/// +------------------+
/// | auth_type (1)    |
/// +------------------+
/// | auth_level (1)   |
/// +------------------+
/// | auth_pad_len (1) |
/// +------------------+
/// | reserved (1)     |
/// +------------------+
/// | auth_context_id  |
/// | (4 bytes)        |
/// +------------------+
/// | auth_value       |
/// | (variable)       |
/// +------------------+
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthVerifier {
    /// Authentication type
    pub auth_type: AuthType,
    /// Authentication level
    pub auth_level: AuthLevel,
    /// Number of padding bytes before this verifier
    pub auth_pad_length: u8,
    /// Reserved (must be zero)
    pub reserved: u8,
    /// Authentication context identifier
    pub auth_context_id: u32,
    /// Authentication token or per-PDU signature
    pub auth_value: Bytes,
}

impl AuthVerifier {
    /// Size of the fixed header portion (8 bytes)
    pub const HEADER_SIZE: usize = 8;

    pub fn new(
        auth_type: AuthType,
        auth_level: AuthLevel,
        auth_context_id: u32,
        auth_value: Bytes,
    ) -> Self {
        Self {
            auth_type,
            auth_level,
            auth_pad_length: 0,
            reserved: 0,
            auth_context_id,
            auth_value,
        }
    }

    /// Total size including header and auth value
    pub fn size(&self) -> usize {
        Self::HEADER_SIZE + self.auth_value.len()
    }

    /// Encode the auth verifier
    pub fn encode(&self, buf: &mut BytesMut, ctx: NdrContext) {
        buf.put_u8(self.auth_type as u8);
        buf.put_u8(self.auth_level as u8);
        buf.put_u8(self.auth_pad_length);
        buf.put_u8(self.reserved);
        ctx.put_u32(buf, self.auth_context_id);
        buf.put_slice(&self.auth_value);
    }

    /// Decode an auth verifier from exactly the trailer bytes of a PDU
    pub fn decode(data: &[u8], ctx: NdrContext) -> Result<Self> {
        if data.len() < Self::HEADER_SIZE {
            return Err(RpcError::InvalidPduData("auth trailer too short".into()));
        }

        let auth_type = AuthType::from_u8(data[0]).ok_or(RpcError::UnsupportedAuthType(data[0]))?;
        let auth_level = AuthLevel::from_u8(data[1])
            .ok_or_else(|| RpcError::InvalidPduData(format!("invalid auth level {}", data[1])))?;
        let auth_pad_length = data[2];
        let reserved = data[3];
        let auth_context_id = ctx.get_u32(&mut &data[4..8]);
        let auth_value = Bytes::copy_from_slice(&data[Self::HEADER_SIZE..]);

        Ok(Self {
            auth_type,
            auth_level,
            auth_pad_length,
            reserved,
            auth_context_id,
            auth_value,
        })
    }
}

/// Calculate the number of padding bytes needed to align stub data
/// before the auth verifier
pub fn calculate_auth_padding(stub_len: usize, auth_type: AuthType) -> usize {
    let alignment = match auth_type {
        AuthType::None => 1,
        _ => 4,
    };
    NdrContext::align_padding(stub_len, alignment)
}

/// Size of the per-PDU verifier: version, 16-byte checksum, sequence number.
pub const VERIFIER_SIZE: usize = 24;
const VERIFIER_VERSION: u32 = 1;
const CHECKSUM_SIZE: usize = 16;

/// Outcome of one authentication leg
#[derive(Debug, Clone)]
pub enum AuthStep {
    /// Send this token to the peer and wait for its answer.
    Continue(Bytes),
    /// Negotiation finished. `token`, when present, still goes to the peer.
    Complete {
        token: Option<Bytes>,
        session_key: Vec<u8>,
    },
}

/// One side of an authentication exchange.
///
/// Tokens are opaque to the runtime.
pub trait AuthSession: Send + Sync {
    /// Consume the peer's token (none for the client's first leg) and
    /// produce the next one.
    fn step(&mut self, input: Option<&[u8]>) -> Result<AuthStep>;
}

/// A source of authentication sessions for one auth type.
pub trait SecurityProvider: Send + Sync {
    fn auth_type(&self) -> AuthType;

    fn client_session(&self) -> Result<Box<dyn AuthSession>>;

    fn server_session(&self) -> Result<Box<dyn AuthSession>>;
}

/// Client security configuration
#[derive(Clone)]
pub struct SecurityConfig {
    pub provider: Arc<dyn SecurityProvider>,
    pub auth_level: AuthLevel,
    pub auth_context_id: u32,
}

impl SecurityConfig {
    pub fn new(provider: Arc<dyn SecurityProvider>, auth_level: AuthLevel) -> Self {
        Self {
            provider,
            auth_level,
            auth_context_id: 0,
        }
    }

    pub fn with_context_id(mut self, auth_context_id: u32) -> Self {
        self.auth_context_id = auth_context_id;
        self
    }
}

impl fmt::Debug for SecurityConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SecurityConfig")
            .field("auth_type", &self.provider.auth_type())
            .field("auth_level", &self.auth_level)
            .field("auth_context_id", &self.auth_context_id)
            .finish()
    }
}

/// Security context state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SecurityState {
    Unauthenticated,
    Negotiating,
    Established,
    Closed,
}

/// Which end of the connection owns a security context
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Client,
    Server,
}

impl Role {
    /// Nonce direction tag for PDUs this side sends.
    fn send_direction(self) -> u32 {
        match self {
            Role::Client => 0,
            Role::Server => 1,
        }
    }

    fn recv_direction(self) -> u32 {
        1 - self.send_direction()
    }
}

struct Len(usize);

impl hkdf::KeyType for Len {
    fn len(&self) -> usize {
        self.0
    }
}

fn derive_key(prk: &hkdf::Prk, label: &[u8]) -> Result<[u8; 32]> {
    let mut out = [0u8; 32];
    prk.expand(&[label], Len(out.len()))
        .and_then(|okm| okm.fill(&mut out))
        .map_err(|_| RpcError::AuthFailed("key derivation failed".into()))?;
    Ok(out)
}

fn seal_key(bytes: &[u8; 32]) -> Result<aead::LessSafeKey> {
    let key = aead::UnboundKey::new(&aead::CHACHA20_POLY1305, bytes)
        .map_err(|_| RpcError::AuthFailed("invalid sealing key".into()))?;
    Ok(aead::LessSafeKey::new(key))
}

struct SessionKeys {
    send_sign: hmac::Key,
    recv_sign: hmac::Key,
    send_seal: aead::LessSafeKey,
    recv_seal: aead::LessSafeKey,
}

impl SessionKeys {
    fn derive(session_key: &[u8], role: Role) -> Result<Self> {
        let prk = hkdf::Salt::new(hkdf::HKDF_SHA256, b"dcerpc session keys").extract(session_key);
        let c2s_sign = derive_key(&prk, b"client-to-server signing")?;
        let s2c_sign = derive_key(&prk, b"server-to-client signing")?;
        let c2s_seal = derive_key(&prk, b"client-to-server sealing")?;
        let s2c_seal = derive_key(&prk, b"server-to-client sealing")?;

        let (send_sign, recv_sign, send_seal, recv_seal) = match role {
            Role::Client => (c2s_sign, s2c_sign, c2s_seal, s2c_seal),
            Role::Server => (s2c_sign, c2s_sign, s2c_seal, c2s_seal),
        };
        Ok(Self {
            send_sign: hmac::Key::new(hmac::HMAC_SHA256, &send_sign),
            recv_sign: hmac::Key::new(hmac::HMAC_SHA256, &recv_sign),
            send_seal: seal_key(&send_seal)?,
            recv_seal: seal_key(&recv_seal)?,
        })
    }
}

struct Inner {
    state: SecurityState,
    keys: Option<SessionKeys>,
    send_seq: u32,
    recv_seq: u32,
}

/// Byte ranges of a PDU that carries a per-PDU verifier.
struct Layout {
    stub_offset: usize,
    trailer_start: usize,
    verifier_start: usize,
}

impl Layout {
    fn of(pdu: &[u8]) -> Result<Option<(PduHeader, Self)>> {
        let header = PduHeader::decode(pdu)?;
        let Some(stub_offset) = stub_offset(&header) else {
            return Ok(None);
        };
        if header.auth_length == 0 {
            return Ok(Some((
                header,
                Self {
                    stub_offset,
                    trailer_start: pdu.len(),
                    verifier_start: pdu.len(),
                },
            )));
        }
        if header.auth_length as usize != VERIFIER_SIZE {
            return Err(RpcError::IntegrityCheckFailed);
        }
        let verifier_start = pdu
            .len()
            .checked_sub(VERIFIER_SIZE)
            .ok_or(RpcError::IntegrityCheckFailed)?;
        let trailer_start = verifier_start
            .checked_sub(AuthVerifier::HEADER_SIZE)
            .filter(|start| *start >= stub_offset)
            .ok_or(RpcError::IntegrityCheckFailed)?;
        Ok(Some((
            header,
            Self {
                stub_offset,
                trailer_start,
                verifier_start,
            },
        )))
    }
}

fn nonce(direction: u32, seq: u32) -> aead::Nonce {
    let mut bytes = [0u8; aead::NONCE_LEN];
    bytes[..4].copy_from_slice(&direction.to_le_bytes());
    bytes[4..].copy_from_slice(&u64::from(seq).to_le_bytes());
    aead::Nonce::assume_unique_for_key(bytes)
}

fn checksum(key: &hmac::Key, seq: u32, signed: &[u8]) -> [u8; CHECKSUM_SIZE] {
    let mut ctx = hmac::Context::with_key(key);
    ctx.update(&seq.to_le_bytes());
    ctx.update(signed);
    let tag = ctx.sign();
    let mut out = [0u8; CHECKSUM_SIZE];
    out.copy_from_slice(&tag.as_ref()[..CHECKSUM_SIZE]);
    out
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    a.len() == b.len() && a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

/// Per-connection security state: negotiation progress, derived keys and
/// the two sequence counters.
///
/// Signing and verification take the inner lock, so concurrent calls on
/// one connection are serialized here.
pub struct SecurityContext {
    auth_type: AuthType,
    auth_level: AuthLevel,
    auth_context_id: u32,
    role: Role,
    inner: Mutex<Inner>,
}

impl SecurityContext {
    pub fn new(auth_type: AuthType, auth_level: AuthLevel, auth_context_id: u32, role: Role) -> Self {
        Self {
            auth_type,
            auth_level,
            auth_context_id,
            role,
            inner: Mutex::new(Inner {
                state: SecurityState::Unauthenticated,
                keys: None,
                send_seq: 0,
                recv_seq: 0,
            }),
        }
    }

    pub fn auth_type(&self) -> AuthType {
        self.auth_type
    }

    pub fn auth_level(&self) -> AuthLevel {
        self.auth_level
    }

    pub fn auth_context_id(&self) -> u32 {
        self.auth_context_id
    }

    pub fn protection_level(&self) -> ProtectionLevel {
        self.auth_level.protection_level()
    }

    pub fn state(&self) -> SecurityState {
        self.inner.lock().state
    }

    pub fn begin_negotiation(&self) {
        let mut inner = self.inner.lock();
        if inner.state == SecurityState::Unauthenticated {
            inner.state = SecurityState::Negotiating;
        }
    }

    /// Install the negotiated session key.
    pub fn establish(&self, session_key: &[u8]) -> Result<()> {
        let keys = SessionKeys::derive(session_key, self.role)?;
        let mut inner = self.inner.lock();
        if inner.state == SecurityState::Closed {
            return Err(RpcError::AuthFailed("security context closed".into()));
        }
        inner.keys = Some(keys);
        inner.state = SecurityState::Established;
        inner.send_seq = 0;
        inner.recv_seq = 0;
        Ok(())
    }

    pub fn close(&self) {
        let mut inner = self.inner.lock();
        inner.state = SecurityState::Closed;
        inner.keys = None;
    }

    /// Verifier to attach to an outgoing PDU before [`protect`] fills it in.
    ///
    /// [`protect`]: SecurityContext::protect
    pub fn placeholder_verifier(&self) -> Option<AuthVerifier> {
        if self.protection_level() == ProtectionLevel::None {
            return None;
        }
        Some(AuthVerifier::new(
            self.auth_type,
            self.auth_level,
            self.auth_context_id,
            Bytes::from(vec![0u8; VERIFIER_SIZE]),
        ))
    }

    /// Sign or seal an encoded PDU in place.
    ///
    /// PDUs other than request, response and fault pass through untouched,
    /// as do PDUs without a verifier at protection level none.
    pub fn protect(&self, pdu: &mut [u8]) -> Result<()> {
        let Some((header, layout)) = Layout::of(pdu)? else {
            return Ok(());
        };
        let level = self.protection_level();
        if header.auth_length == 0 {
            return match level {
                ProtectionLevel::None => Ok(()),
                _ => Err(RpcError::AuthFailed("PDU has no room for a verifier".into())),
            };
        }

        let mut inner = self.inner.lock();
        if inner.state != SecurityState::Established {
            return Err(RpcError::AuthFailed("security context not established".into()));
        }
        let seq = inner.send_seq;
        let keys = inner
            .keys
            .as_ref()
            .ok_or_else(|| RpcError::AuthFailed("no session keys".into()))?;

        let sum = match level {
            ProtectionLevel::None => return Ok(()),
            ProtectionLevel::Integrity => {
                checksum(&keys.send_sign, seq, &pdu[..layout.verifier_start])
            }
            ProtectionLevel::Privacy => {
                let mut aad = Vec::with_capacity(layout.stub_offset + AuthVerifier::HEADER_SIZE);
                aad.extend_from_slice(&pdu[..layout.stub_offset]);
                aad.extend_from_slice(&pdu[layout.trailer_start..layout.verifier_start]);
                let tag = keys
                    .send_seal
                    .seal_in_place_separate_tag(
                        nonce(self.role.send_direction(), seq),
                        aead::Aad::from(&aad[..]),
                        &mut pdu[layout.stub_offset..layout.trailer_start],
                    )
                    .map_err(|_| RpcError::AuthFailed("sealing failed".into()))?;
                let mut out = [0u8; CHECKSUM_SIZE];
                out.copy_from_slice(tag.as_ref());
                out
            }
        };

        let verifier = &mut pdu[layout.verifier_start..];
        verifier[..4].copy_from_slice(&VERIFIER_VERSION.to_le_bytes());
        verifier[4..4 + CHECKSUM_SIZE].copy_from_slice(&sum);
        verifier[4 + CHECKSUM_SIZE..].copy_from_slice(&seq.to_le_bytes());

        inner.send_seq = seq
            .checked_add(1)
            .ok_or_else(|| RpcError::AuthFailed("send sequence exhausted".into()))?;
        Ok(())
    }

    /// Check (and for privacy, decrypt) a received PDU in place.
    ///
    /// The receive sequence number only advances when the PDU verifies.
    pub fn verify(&self, pdu: &mut [u8]) -> Result<()> {
        let Some((header, layout)) = Layout::of(pdu)? else {
            return Ok(());
        };
        let level = self.protection_level();
        let mut inner = self.inner.lock();

        // no call traffic until the handshake has finished, at any level
        if inner.state != SecurityState::Established {
            return Err(RpcError::AuthFailed("security context not established".into()));
        }
        if level == ProtectionLevel::None {
            return if header.auth_length == 0 {
                Ok(())
            } else {
                Err(RpcError::IntegrityCheckFailed)
            };
        }
        if header.auth_length == 0 {
            // unsigned request, response or fault on a protected connection
            return Err(RpcError::IntegrityCheckFailed);
        }

        let trailer =
            AuthVerifier::decode(&pdu[layout.trailer_start..], header.context())?;
        if trailer.auth_type != self.auth_type
            || trailer.auth_level != self.auth_level
            || trailer.auth_context_id != self.auth_context_id
        {
            return Err(RpcError::IntegrityCheckFailed);
        }

        let verifier = &pdu[layout.verifier_start..];
        let version = u32::from_le_bytes([verifier[0], verifier[1], verifier[2], verifier[3]]);
        if version != VERIFIER_VERSION {
            return Err(RpcError::IntegrityCheckFailed);
        }
        let mut received = [0u8; CHECKSUM_SIZE];
        received.copy_from_slice(&verifier[4..4 + CHECKSUM_SIZE]);
        let seq_bytes = &verifier[4 + CHECKSUM_SIZE..];
        let seq = u32::from_le_bytes([seq_bytes[0], seq_bytes[1], seq_bytes[2], seq_bytes[3]]);

        let expected = inner.recv_seq;
        if seq != expected {
            return Err(RpcError::SequenceMismatch { expected, got: seq });
        }
        let keys = inner
            .keys
            .as_ref()
            .ok_or_else(|| RpcError::AuthFailed("no session keys".into()))?;

        match level {
            ProtectionLevel::None => {}
            ProtectionLevel::Integrity => {
                let sum = checksum(&keys.recv_sign, seq, &pdu[..layout.verifier_start]);
                if !constant_time_eq(&sum, &received) {
                    return Err(RpcError::IntegrityCheckFailed);
                }
            }
            ProtectionLevel::Privacy => {
                let mut aad = Vec::with_capacity(layout.stub_offset + AuthVerifier::HEADER_SIZE);
                aad.extend_from_slice(&pdu[..layout.stub_offset]);
                aad.extend_from_slice(&pdu[layout.trailer_start..layout.verifier_start]);

                let sealed_len = layout.trailer_start - layout.stub_offset;
                let mut in_out = Vec::with_capacity(sealed_len + CHECKSUM_SIZE);
                in_out.extend_from_slice(&pdu[layout.stub_offset..layout.trailer_start]);
                in_out.extend_from_slice(&received);

                let plain = keys
                    .recv_seal
                    .open_in_place(
                        nonce(self.role.recv_direction(), seq),
                        aead::Aad::from(&aad[..]),
                        &mut in_out,
                    )
                    .map_err(|_| RpcError::IntegrityCheckFailed)?;
                pdu[layout.stub_offset..layout.trailer_start].copy_from_slice(plain);
            }
        }

        inner.recv_seq = expected
            .checked_add(1)
            .ok_or(RpcError::IntegrityCheckFailed)?;
        Ok(())
    }

    /// True when `packet_type` travels signed once the context is established.
    pub fn is_protected_type(packet_type: PacketType) -> bool {
        matches!(
            packet_type,
            PacketType::Request | PacketType::Response | PacketType::Fault
        )
    }
}

impl fmt::Debug for SecurityContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("SecurityContext")
            .field("auth_type", &self.auth_type)
            .field("auth_level", &self.auth_level)
            .field("auth_context_id", &self.auth_context_id)
            .field("role", &self.role)
            .field("state", &inner.state)
            .field("send_seq", &inner.send_seq)
            .field("recv_seq", &inner.recv_seq)
            .finish()
    }
}
