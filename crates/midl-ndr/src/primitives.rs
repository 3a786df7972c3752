//! NDR primitive type implementations
//!
//! | MIDL Type      | Rust Type    | Size | Alignment |
//! |----------------|--------------|------|-----------|
//! | boolean        | bool         | 4    | 4         |
//! | byte/char      | u8           | 1    | 1         |
//! | small          | i8           | 1    | 1         |
//! | short          | i16          | 2    | 2         |
//! | long/int       | i32          | 4    | 4         |
//! | hyper          | i64          | 8    | 8         |
//! | unsigned short | u16          | 2    | 2         |
//! | unsigned long  | u32          | 4    | 4         |
//! | unsigned hyper | u64          | 8    | 8         |
//! | float          | f32          | 4    | 4         |
//! | double         | f64          | 8    | 8         |
//! | v1_enum        | `V1Enum<E>`  | 4    | 4         |
//!
//! Booleans travel as a 32-bit 0/1. Any non-zero value decodes as `true`.

use crate::context::FloatRep;
use crate::error::NdrError;
use crate::{NdrDecode, NdrEncode, NdrReader, NdrWriter, Result};

macro_rules! impl_ndr_primitive {
    ($ty:ty, $align:expr, $put:ident, $get:ident, $wire:ty) => {
        impl NdrEncode for $ty {
            fn ndr_encode(&self, w: &mut NdrWriter) -> Result<()> {
                w.$put(*self as $wire);
                Ok(())
            }

            fn ndr_align() -> usize {
                $align
            }
        }

        impl NdrDecode for $ty {
            fn ndr_decode(r: &mut NdrReader) -> Result<Self> {
                Ok(r.$get()? as $ty)
            }

            fn ndr_align() -> usize {
                $align
            }
        }
    };
}

impl_ndr_primitive!(u8, 1, put_u8, get_u8, u8);
impl_ndr_primitive!(i8, 1, put_u8, get_u8, u8);
impl_ndr_primitive!(u16, 2, put_u16, get_u16, u16);
impl_ndr_primitive!(i16, 2, put_u16, get_u16, u16);
impl_ndr_primitive!(u32, 4, put_u32, get_u32, u32);
impl_ndr_primitive!(i32, 4, put_u32, get_u32, u32);
impl_ndr_primitive!(u64, 8, put_u64, get_u64, u64);
impl_ndr_primitive!(i64, 8, put_u64, get_u64, u64);

fn ensure_ieee(float_rep: FloatRep) -> Result<()> {
    if float_rep != FloatRep::Ieee {
        return Err(NdrError::UnsupportedFloatFormat(float_rep as u8));
    }
    Ok(())
}

impl NdrEncode for f32 {
    fn ndr_encode(&self, w: &mut NdrWriter) -> Result<()> {
        ensure_ieee(w.context().data_rep.float_rep)?;
        w.put_f32(*self);
        Ok(())
    }

    fn ndr_align() -> usize {
        4
    }
}

impl NdrDecode for f32 {
    fn ndr_decode(r: &mut NdrReader) -> Result<Self> {
        ensure_ieee(r.context().data_rep.float_rep)?;
        r.get_f32()
    }

    fn ndr_align() -> usize {
        4
    }
}

impl NdrEncode for f64 {
    fn ndr_encode(&self, w: &mut NdrWriter) -> Result<()> {
        ensure_ieee(w.context().data_rep.float_rep)?;
        w.put_f64(*self);
        Ok(())
    }

    fn ndr_align() -> usize {
        8
    }
}

impl NdrDecode for f64 {
    fn ndr_decode(r: &mut NdrReader) -> Result<Self> {
        ensure_ieee(r.context().data_rep.float_rep)?;
        r.get_f64()
    }

    fn ndr_align() -> usize {
        8
    }
}

impl NdrEncode for bool {
    fn ndr_encode(&self, w: &mut NdrWriter) -> Result<()> {
        w.put_u32(u32::from(*self));
        Ok(())
    }

    fn ndr_align() -> usize {
        4
    }
}

impl NdrDecode for bool {
    fn ndr_decode(r: &mut NdrReader) -> Result<Self> {
        Ok(r.get_u32()? != 0)
    }

    fn ndr_align() -> usize {
        4
    }
}

/// A C-style enumeration with a fixed set of declared values.
///
/// Implemented by generated code for each IDL `v1_enum`.
pub trait NdrEnum: Copy {
    fn from_u32(value: u32) -> Option<Self>;
    fn to_u32(self) -> u32;
}

/// Wire form of a `v1_enum`: a 32-bit value that may fall outside the
/// declared set. Unknown values are kept, not rejected, so a peer running a
/// newer IDL revision can still be talked to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum V1Enum<E> {
    Known(E),
    Unknown(u32),
}

impl<E: NdrEnum> V1Enum<E> {
    pub fn to_u32(self) -> u32 {
        match self {
            Self::Known(e) => e.to_u32(),
            Self::Unknown(v) => v,
        }
    }

    pub fn known(self) -> Option<E> {
        match self {
            Self::Known(e) => Some(e),
            Self::Unknown(_) => None,
        }
    }

    /// For enums the IDL declares closed: unknown values become an error.
    pub fn into_closed(self) -> Result<E> {
        match self {
            Self::Known(e) => Ok(e),
            Self::Unknown(v) => Err(NdrError::InvalidEnumValue(v)),
        }
    }
}

impl<E: NdrEnum> From<E> for V1Enum<E> {
    fn from(value: E) -> Self {
        Self::Known(value)
    }
}

impl<E: NdrEnum> NdrEncode for V1Enum<E> {
    fn ndr_encode(&self, w: &mut NdrWriter) -> Result<()> {
        w.put_u32(self.to_u32());
        Ok(())
    }

    fn ndr_align() -> usize {
        4
    }
}

impl<E: NdrEnum> NdrDecode for V1Enum<E> {
    fn ndr_decode(r: &mut NdrReader) -> Result<Self> {
        let raw = r.get_u32()?;
        Ok(E::from_u32(raw).map_or(Self::Unknown(raw), Self::Known))
    }

    fn ndr_align() -> usize {
        4
    }
}

/// NDR error_status_t. Carried verbatim; never interpreted by the codec.
pub type ErrorStatusT = u32;
