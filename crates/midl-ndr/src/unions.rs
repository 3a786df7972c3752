//! Discriminated unions
//!
//! A union is a discriminant followed by the single arm it selects. The arm
//! takes part in both encoding phases like any struct member, so an arm that
//! holds a pointer defers its body.
//!
//! Generated code implements [`NdrUnion`] on a Rust enum. The discriminant of
//! a non-encapsulated union lives in the enclosing structure and is passed to
//! [`NdrUnion::decode_arm`] directly; an encapsulated union carries its own
//! and is wrapped in [`Union`].

use crate::error::NdrError;
use crate::{NdrDecode, NdrEncode, NdrReader, NdrWriter, Result};

pub trait NdrUnion: Sized {
    /// Discriminant value selecting the current arm.
    fn discriminant(&self) -> u32;

    /// Largest alignment among the arms.
    fn arm_align() -> usize {
        1
    }

    fn encode_arm(&self, w: &mut NdrWriter) -> Result<()>;

    fn encode_arm_deferred(&self, _w: &mut NdrWriter) -> Result<()> {
        Ok(())
    }

    /// Decode the arm selected by `tag`.
    ///
    /// Implementations return [`NdrError::InvalidDiscriminant`] for tags with
    /// no arm and no default.
    fn decode_arm(tag: u32, r: &mut NdrReader) -> Result<Self>;

    fn decode_arm_deferred(&mut self, _r: &mut NdrReader) -> Result<()> {
        Ok(())
    }
}

/// Helper for `decode_arm` implementations: the error for an unmatched tag.
pub fn invalid_discriminant<T>(tag: u32) -> Result<T> {
    Err(NdrError::InvalidDiscriminant(tag))
}

/// Encapsulated union: a 32-bit discriminant, then the arm aligned to the
/// union's largest arm.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Union<U>(pub U);

impl<U> Union<U> {
    pub fn into_inner(self) -> U {
        self.0
    }
}

impl<U: NdrUnion> NdrEncode for Union<U> {
    fn ndr_encode(&self, w: &mut NdrWriter) -> Result<()> {
        w.put_u32(self.0.discriminant());
        w.align(U::arm_align());
        self.0.encode_arm(w)
    }

    fn ndr_encode_deferred(&self, w: &mut NdrWriter) -> Result<()> {
        self.0.encode_arm_deferred(w)
    }

    fn ndr_align() -> usize {
        U::arm_align().max(4)
    }
}

impl<U: NdrUnion> NdrDecode for Union<U> {
    fn ndr_decode(r: &mut NdrReader) -> Result<Self> {
        let tag = r.get_u32()?;
        r.align(U::arm_align())?;
        Ok(Self(U::decode_arm(tag, r)?))
    }

    fn ndr_decode_deferred(&mut self, r: &mut NdrReader) -> Result<()> {
        self.0.decode_arm_deferred(r)
    }

    fn ndr_align() -> usize {
        U::arm_align().max(4)
    }
}
