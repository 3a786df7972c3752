//! NDR error types

use thiserror::Error;

/// Upper bound on elements accepted for a single conformant array.
pub const MAX_NDR_ARRAY_ELEMENTS: usize = 16 * 1024 * 1024;

/// Upper bound on bytes a single decoded string or array may claim.
pub const MAX_NDR_ALLOCATION_SIZE: usize = 64 * 1024 * 1024;

/// NDR encoding/decoding errors
#[derive(Debug, Error)]
pub enum NdrError {
    /// Buffer underflow - not enough data
    #[error("buffer underflow: needed {needed} bytes, have {have}")]
    BufferUnderflow { needed: usize, have: usize },

    /// Padding bytes before an aligned field were not zero
    #[error("alignment mismatch at offset {offset}: padding to {alignment} is not zero")]
    Alignment { offset: usize, alignment: usize },

    /// Invalid string - bad encoding or malformed header
    #[error("invalid string: {0}")]
    InvalidString(String),

    /// Invalid pointer - unexpected referent ID
    #[error("invalid pointer: referent ID {0}")]
    InvalidPointer(u32),

    /// A `[ref]` pointer was given no referent
    #[error("null reference pointer")]
    NullRefPointer,

    /// A full pointer was reached again while its body was still being written or read
    #[error("cyclic pointer graph: referent {0} is still in progress")]
    CyclicReference(u32),

    /// Two full pointers sharing a referent ID disagree on the pointee type
    #[error("referent {0} was decoded as a different type")]
    ReferentTypeMismatch(u32),

    /// Array size mismatch
    #[error("array size mismatch: expected {expected}, got {got}")]
    ArraySizeMismatch { expected: usize, got: usize },

    /// Invalid discriminant for union
    #[error("invalid union discriminant: {0}")]
    InvalidDiscriminant(u32),

    /// Invalid enum value for a closed enumeration
    #[error("invalid enum value: {0}")]
    InvalidEnumValue(u32),

    /// Conformance mismatch
    #[error("conformance mismatch: max_count={max_count}, offset={offset}, actual_count={actual_count}")]
    ConformanceMismatch {
        max_count: u32,
        offset: u32,
        actual_count: u32,
    },

    /// Decoded size exceeds the configured limit
    #[error("allocation of {requested} exceeds limit {limit}")]
    AllocationLimitExceeded { requested: usize, limit: usize },

    /// A count multiplied by an element size overflowed
    #[error("integer overflow computing wire size")]
    IntegerOverflow,

    /// The stream's data representation uses a float format other than IEEE
    #[error("unsupported floating-point representation: {0}")]
    UnsupportedFloatFormat(u8),

    /// The stream's data representation uses EBCDIC for narrow characters
    #[error("unsupported character representation: EBCDIC")]
    UnsupportedCharacterSet,

    /// UTF-8 decoding error
    #[error("UTF-8 error: {0}")]
    Utf8Error(#[from] std::string::FromUtf8Error),

    /// UTF-16 decoding error
    #[error("UTF-16 error: {0}")]
    Utf16Error(#[from] std::string::FromUtf16Error),
}

/// Result type for NDR operations
pub type Result<T> = std::result::Result<T, NdrError>;
