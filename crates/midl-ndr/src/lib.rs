//! NDR (Network Data Representation) runtime library
//!
//! This crate provides the runtime support for MIDL-generated stubs,
//! implementing the NDR transfer syntax used by DCE RPC and MS-RPCE.
//!
//! # NDR Wire Format
//!
//! - Primitives align to their natural size (1, 2, 4, or 8 bytes),
//!   measured from the start of the stream
//! - Structures align to their largest member
//! - Embedded pointers write a referent ID in place; the pointee bodies
//!   follow at the end of the enclosing top-level parameter
//! - Strings are conformant varying arrays whose length is `actual_count`
//!
//! # Usage
//!
//! ```
//! use midl_ndr::{NdrContext, NdrReader, NdrWriter, NdrWString, UniquePtr};
//!
//! let mut w = NdrWriter::new(NdrContext::new());
//! w.write_data(&7u32).unwrap();
//! w.write_data(&UniquePtr::new(NdrWString::new("hello"))).unwrap();
//!
//! let mut r = NdrReader::new(NdrContext::new(), w.into_bytes());
//! assert_eq!(r.read_data::<u32>().unwrap(), 7);
//! let name: UniquePtr<NdrWString> = r.read_data().unwrap();
//! assert_eq!(name.get().unwrap().as_str(), "hello");
//! ```

mod arrays;
mod context;
mod decode;
mod encode;
mod error;
mod handle;
mod pointers;
mod primitives;
mod strings;
mod unions;
mod uuid;

pub use arrays::{ConformantArray, ConformantVaryingArray, FixedArray, VaryingArray};
pub use context::{CharRep, DataRepresentation, FloatRep, IntRep, NdrContext};
pub use decode::{decode_from_bytes, NdrDecode, NdrReader};
pub use encode::{encode_to_bytes, NdrEncode, NdrWriter};
pub use error::{NdrError, Result, MAX_NDR_ALLOCATION_SIZE, MAX_NDR_ARRAY_ELEMENTS};
pub use handle::{ContextHandle, CONTEXT_HANDLE_SIZE};
pub use pointers::{FullPtr, RefPtr, UniquePtr};
pub use primitives::{ErrorStatusT, NdrEnum, V1Enum};
pub use strings::{BString, FlaggedWordBlob, NdrString, NdrWString};
pub use unions::{invalid_discriminant, NdrUnion, Union};
pub use uuid::Uuid;

/// Re-export bytes for convenience
pub use bytes::{Buf, BufMut, Bytes, BytesMut};
