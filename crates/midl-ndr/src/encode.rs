//! NDR encoding trait and stream writer

use crate::pointers::{ReferentState, WriterReferents};
use crate::{NdrContext, Result};
use bytes::{BufMut, Bytes, BytesMut};
use std::any::Any;
use std::sync::Arc;

/// Trait for types that can be encoded to NDR format.
///
/// Encoding is two-phase. `ndr_encode` writes the immediate representation
/// of a value, which for an embedded pointer is only its referent ID.
/// `ndr_encode_deferred` then writes the bodies of those pointers, in
/// declaration order. A structure forwards both calls to its fields in
/// order; a top-level parameter is written with [`NdrWriter::write_data`],
/// which runs both phases back to back.
pub trait NdrEncode {
    /// Write the immediate part of this value.
    fn ndr_encode(&self, w: &mut NdrWriter) -> Result<()>;

    /// Write the deferred pointer bodies reachable from this value.
    fn ndr_encode_deferred(&self, _w: &mut NdrWriter) -> Result<()> {
        Ok(())
    }

    /// Alignment of the value's first byte, relative to the stream start.
    fn ndr_align() -> usize
    where
        Self: Sized,
    {
        1
    }
}

/// An NDR output stream.
///
/// Offsets used for alignment are relative to the start of this stream,
/// so a writer is created per stub body, never per transport buffer.
#[derive(Debug)]
pub struct NdrWriter {
    ctx: NdrContext,
    buf: BytesMut,
    referents: WriterReferents,
}

impl NdrWriter {
    pub fn new(ctx: NdrContext) -> Self {
        Self::with_capacity(ctx, 256)
    }

    pub fn with_capacity(ctx: NdrContext, capacity: usize) -> Self {
        Self {
            ctx,
            buf: BytesMut::with_capacity(capacity),
            referents: WriterReferents::default(),
        }
    }

    pub fn context(&self) -> NdrContext {
        self.ctx
    }

    /// Current offset from the start of the stream
    pub fn position(&self) -> usize {
        self.buf.len()
    }

    /// Emit zero padding up to the next multiple of `alignment`
    pub fn align(&mut self, alignment: usize) {
        let padding = NdrContext::align_padding(self.buf.len(), alignment);
        self.buf.put_bytes(0, padding);
    }

    pub fn put_u8(&mut self, value: u8) {
        self.buf.put_u8(value);
    }

    pub fn put_u16(&mut self, value: u16) {
        self.align(2);
        self.ctx.put_u16(&mut self.buf, value);
    }

    pub fn put_u32(&mut self, value: u32) {
        self.align(4);
        self.ctx.put_u32(&mut self.buf, value);
    }

    pub fn put_u64(&mut self, value: u64) {
        self.align(8);
        self.ctx.put_u64(&mut self.buf, value);
    }

    pub fn put_f32(&mut self, value: f32) {
        self.align(4);
        self.ctx.put_f32(&mut self.buf, value);
    }

    pub fn put_f64(&mut self, value: f64) {
        self.align(8);
        self.ctx.put_f64(&mut self.buf, value);
    }

    /// Append raw bytes with no alignment
    pub fn put_slice(&mut self, data: &[u8]) {
        self.buf.put_slice(data);
    }

    /// Write the immediate part of `value`, aligned to its type.
    pub fn write<T: NdrEncode>(&mut self, value: &T) -> Result<()> {
        self.align(T::ndr_align());
        value.ndr_encode(self)
    }

    /// Deferred checkpoint: write the pointer bodies owned by `value`.
    pub fn write_deferred<T: NdrEncode>(&mut self, value: &T) -> Result<()> {
        value.ndr_encode_deferred(self)
    }

    /// Write a complete top-level value: immediate part, then its deferred bodies.
    pub fn write_data<T: NdrEncode>(&mut self, value: &T) -> Result<()> {
        self.write(value)?;
        self.write_deferred(value)
    }

    /// Allocate a fresh referent ID for a unique pointer.
    pub(crate) fn next_referent(&mut self) -> u32 {
        self.referents.allocate()
    }

    /// Look up or register a full pointer by the address of its referent.
    ///
    /// Returns the referent ID and whether the body still has to be written.
    pub(crate) fn full_referent(
        &mut self,
        key: usize,
        referent: Arc<dyn Any + Send + Sync>,
    ) -> Result<(u32, ReferentState)> {
        self.referents.lookup_or_insert(key, referent)
    }

    pub(crate) fn set_referent_state(&mut self, key: usize, state: ReferentState) {
        self.referents.set_state(key, state);
    }

    pub fn into_bytes(self) -> Bytes {
        self.buf.freeze()
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.buf
    }
}

impl Default for NdrWriter {
    fn default() -> Self {
        Self::new(NdrContext::default())
    }
}

/// Encode `value` as a standalone top-level stream.
pub fn encode_to_bytes<T: NdrEncode>(ctx: NdrContext, value: &T) -> Result<Bytes> {
    let mut w = NdrWriter::new(ctx);
    w.write_data(value)?;
    Ok(w.into_bytes())
}
