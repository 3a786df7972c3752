//! Context handles
//!
//! A context handle is 20 opaque bytes on the wire: a 32-bit attributes word
//! followed by a UUID. The nil handle (all zero) means "no handle" and is
//! what a server returns from a Close operation.

use crate::{NdrDecode, NdrEncode, NdrReader, NdrWriter, Result, Uuid};

/// Wire size of a context handle
pub const CONTEXT_HANDLE_SIZE: usize = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct ContextHandle {
    pub attributes: u32,
    pub uuid: Uuid,
}

impl ContextHandle {
    pub const NIL: Self = Self {
        attributes: 0,
        uuid: Uuid::NIL,
    };

    pub fn new(uuid: Uuid) -> Self {
        Self { attributes: 0, uuid }
    }

    pub fn is_nil(&self) -> bool {
        self.attributes == 0 && self.uuid.is_nil()
    }
}

impl NdrEncode for ContextHandle {
    fn ndr_encode(&self, w: &mut NdrWriter) -> Result<()> {
        w.put_u32(self.attributes);
        w.write(&self.uuid)
    }

    fn ndr_align() -> usize {
        4
    }
}

impl NdrDecode for ContextHandle {
    fn ndr_decode(r: &mut NdrReader) -> Result<Self> {
        Ok(Self {
            attributes: r.get_u32()?,
            uuid: r.read()?,
        })
    }

    fn ndr_align() -> usize {
        4
    }
}
