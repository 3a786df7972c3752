//! Error types for DCE RPC

use crate::dcerpc::FaultStatus;
use midl_ndr::NdrError;
use thiserror::Error;

/// RPC error types
///
/// Runtime faults ([`RpcError::Fault`]) are kept apart from business status
/// codes, which travel inside successfully decoded response stubs and never
/// surface here.
#[derive(Debug, Error)]
pub enum RpcError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("NDR error: {0}")]
    Ndr(#[from] NdrError),

    #[error("DCE RPC version mismatch: expected {expected}, got {got}")]
    VersionMismatch { expected: u8, got: u8 },

    #[error("invalid message type: {0}")]
    InvalidMessageType(u8),

    #[error("invalid PDU")]
    InvalidPdu,

    #[error("invalid PDU: {0}")]
    InvalidPduData(String),

    #[error("frag_length {declared} does not match PDU size {actual}")]
    FragLengthMismatch { declared: usize, actual: usize },

    #[error("PDU too large: {size} bytes exceeds maximum {max}")]
    PduTooLarge { size: usize, max: usize },

    #[error("fragment out of sequence for call {call_id}")]
    FragmentSequence { call_id: u32 },

    #[error("resource limit exceeded: {0}")]
    ResourceLimit(String),

    #[error("bind rejected: reason {reason}")]
    BindRejected { reason: u16 },

    #[error("presentation context rejected: result {result}, reason {reason}")]
    ContextRejected { result: u16, reason: u16 },

    #[error("presentation context {0} is not bound")]
    ContextNotBound(u16),

    #[error("context mismatch")]
    ContextMismatch,

    #[error("interface not found: {0}")]
    InterfaceNotFound(String),

    #[error("fault: status 0x{0:08x}")]
    Fault(u32),

    #[error("unknown operation: opnum {0}")]
    UnknownOperation(u16),

    #[error("invalid context handle")]
    InvalidHandle,

    #[error("access denied")]
    AccessDenied,

    #[error("integrity check failed")]
    IntegrityCheckFailed,

    #[error("sequence number mismatch: expected {expected}, got {got}")]
    SequenceMismatch { expected: u32, got: u32 },

    #[error("authentication failed: {0}")]
    AuthFailed(String),

    #[error("unsupported authentication type: {0}")]
    UnsupportedAuthType(u8),

    #[error("call cancelled")]
    Cancelled,

    #[error("timeout")]
    Timeout,

    #[error("connection closed")]
    ConnectionClosed,

    #[error("task join error: {0}")]
    JoinError(#[from] tokio::task::JoinError),
}

impl RpcError {
    /// The DCE fault status a server reports for this error.
    pub fn fault_status(&self) -> u32 {
        let status = match self {
            Self::Fault(status) => return *status,
            Self::UnknownOperation(_) => FaultStatus::OpRngError,
            Self::InterfaceNotFound(_) => FaultStatus::UnkIf,
            Self::ContextNotBound(_) | Self::ContextMismatch => FaultStatus::ContextMismatch,
            Self::InvalidHandle => FaultStatus::InvalidHandle,
            Self::Ndr(NdrError::InvalidDiscriminant(_)) => FaultStatus::InvalidTag,
            Self::Ndr(_) => FaultStatus::BadStubData,
            Self::VersionMismatch { .. }
            | Self::InvalidMessageType(_)
            | Self::InvalidPdu
            | Self::InvalidPduData(_)
            | Self::FragLengthMismatch { .. }
            | Self::FragmentSequence { .. } => FaultStatus::ProtoError,
            Self::PduTooLarge { .. } | Self::ResourceLimit(_) => FaultStatus::RemoteNoMemory,
            Self::AccessDenied => FaultStatus::AccessDenied,
            Self::IntegrityCheckFailed
            | Self::SequenceMismatch { .. }
            | Self::AuthFailed(_)
            | Self::UnsupportedAuthType(_) => FaultStatus::SecPkgError,
            Self::Cancelled => FaultStatus::Cancel,
            _ => FaultStatus::RpcError,
        };
        status as u32
    }

    /// True for errors that mean the peer can no longer be trusted or reached.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::Io(_)
                | Self::ConnectionClosed
                | Self::IntegrityCheckFailed
                | Self::SequenceMismatch { .. }
                | Self::AuthFailed(_)
                | Self::VersionMismatch { .. }
                | Self::PduTooLarge { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, RpcError>;
