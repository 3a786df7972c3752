//! NDR decoding trait and stream reader

use crate::error::NdrError;
use crate::pointers::ReaderReferents;
use crate::{NdrContext, Result};
use bytes::Bytes;
use tracing::trace;

/// Trait for types that can be decoded from NDR format.
///
/// Mirrors [`NdrEncode`](crate::NdrEncode): `ndr_decode` reads the
/// immediate part and leaves embedded pointers pending, and
/// `ndr_decode_deferred` reads their bodies in declaration order.
pub trait NdrDecode: Sized {
    /// Read the immediate part of a value.
    fn ndr_decode(r: &mut NdrReader) -> Result<Self>;

    /// Read the deferred pointer bodies owned by this value.
    fn ndr_decode_deferred(&mut self, _r: &mut NdrReader) -> Result<()> {
        Ok(())
    }

    /// Alignment of the value's first byte, relative to the stream start.
    fn ndr_align() -> usize {
        1
    }
}

/// An NDR input stream over a stub body.
#[derive(Debug)]
pub struct NdrReader {
    ctx: NdrContext,
    buf: Bytes,
    pos: usize,
    strict_padding: bool,
    referents: ReaderReferents,
}

impl NdrReader {
    pub fn new(ctx: NdrContext, buf: Bytes) -> Self {
        Self {
            ctx,
            buf,
            pos: 0,
            strict_padding: true,
            referents: ReaderReferents::default(),
        }
    }

    /// Accept non-zero padding bytes instead of failing with [`NdrError::Alignment`].
    pub fn with_strict_padding(mut self, strict: bool) -> Self {
        self.strict_padding = strict;
        self
    }

    pub fn context(&self) -> NdrContext {
        self.ctx
    }

    /// Current offset from the start of the stream
    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    fn ensure(&self, needed: usize) -> Result<()> {
        if self.remaining() < needed {
            return Err(NdrError::BufferUnderflow {
                needed,
                have: self.remaining(),
            });
        }
        Ok(())
    }

    /// Consume the padding a writer would have emitted at this offset.
    pub fn align(&mut self, alignment: usize) -> Result<()> {
        let padding = NdrContext::align_padding(self.pos, alignment);
        if padding == 0 {
            return Ok(());
        }
        self.ensure(padding)?;
        let pad = &self.buf[self.pos..self.pos + padding];
        if self.strict_padding && pad.iter().any(|&b| b != 0) {
            trace!(offset = self.pos, alignment, "non-zero padding");
            return Err(NdrError::Alignment {
                offset: self.pos,
                alignment,
            });
        }
        self.pos += padding;
        Ok(())
    }

    pub fn get_u8(&mut self) -> Result<u8> {
        self.ensure(1)?;
        let value = self.buf[self.pos];
        self.pos += 1;
        Ok(value)
    }

    pub fn get_u16(&mut self) -> Result<u16> {
        self.align(2)?;
        self.ensure(2)?;
        let value = self.ctx.get_u16(&mut &self.buf[self.pos..]);
        self.pos += 2;
        Ok(value)
    }

    pub fn get_u32(&mut self) -> Result<u32> {
        self.align(4)?;
        self.ensure(4)?;
        let value = self.ctx.get_u32(&mut &self.buf[self.pos..]);
        self.pos += 4;
        Ok(value)
    }

    pub fn get_u64(&mut self) -> Result<u64> {
        self.align(8)?;
        self.ensure(8)?;
        let value = self.ctx.get_u64(&mut &self.buf[self.pos..]);
        self.pos += 8;
        Ok(value)
    }

    pub fn get_f32(&mut self) -> Result<f32> {
        Ok(f32::from_bits(self.get_u32()?))
    }

    pub fn get_f64(&mut self) -> Result<f64> {
        Ok(f64::from_bits(self.get_u64()?))
    }

    /// Take `len` raw bytes with no alignment
    pub fn get_bytes(&mut self, len: usize) -> Result<Bytes> {
        self.ensure(len)?;
        let out = self.buf.slice(self.pos..self.pos + len);
        self.pos += len;
        Ok(out)
    }

    /// Everything not yet consumed
    pub fn rest(&mut self) -> Bytes {
        let out = self.buf.slice(self.pos..);
        self.pos = self.buf.len();
        out
    }

    /// Check a decoded element count against the bytes left in the stream.
    ///
    /// Every NDR element occupies at least `min_element_size` bytes, so a
    /// count that cannot fit is rejected before anything is allocated.
    pub fn check_count(&self, count: usize, min_element_size: usize) -> Result<()> {
        if count > crate::error::MAX_NDR_ARRAY_ELEMENTS {
            trace!(count, "element count over limit");
            return Err(NdrError::AllocationLimitExceeded {
                requested: count,
                limit: crate::error::MAX_NDR_ARRAY_ELEMENTS,
            });
        }
        let bytes = count
            .checked_mul(min_element_size.max(1))
            .ok_or(NdrError::IntegerOverflow)?;
        self.ensure(bytes)
    }

    /// Read the immediate part of a `T`, aligned to its type.
    pub fn read<T: NdrDecode>(&mut self) -> Result<T> {
        self.align(T::ndr_align())?;
        T::ndr_decode(self)
    }

    /// Deferred checkpoint: read the pointer bodies owned by `value`.
    pub fn read_deferred<T: NdrDecode>(&mut self, value: &mut T) -> Result<()> {
        value.ndr_decode_deferred(self)
    }

    /// Read a complete top-level value: immediate part, then its deferred bodies.
    pub fn read_data<T: NdrDecode>(&mut self) -> Result<T> {
        let mut value = self.read::<T>()?;
        self.read_deferred(&mut value)?;
        Ok(value)
    }

    pub(crate) fn referents(&mut self) -> &mut ReaderReferents {
        &mut self.referents
    }
}

/// Decode a standalone top-level `T` from `data`.
pub fn decode_from_bytes<T: NdrDecode>(ctx: NdrContext, data: Bytes) -> Result<T> {
    NdrReader::new(ctx, data).read_data()
}
