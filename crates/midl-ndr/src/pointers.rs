//! NDR pointer types
//!
//! | Flavor | Null | Wire ID | Aliasing |
//! |--------|------|---------|----------|
//! | ref    | no   | none    | no       |
//! | unique | yes  | yes     | no       |
//! | full   | yes  | yes     | yes      |
//!
//! A unique or full pointer writes its referent ID in the immediate phase and
//! its body in the deferred phase. A null pointer is referent ID 0 and
//! contributes no deferred bytes.
//!
//! Full pointers are tracked in per-stream tables. The writer keys its table
//! by the address of the shared referent, the reader by referent ID. Each
//! entry moves Pending -> InProgress -> Done; reaching an entry that is still
//! InProgress means the graph loops back into a body being written or read,
//! which is rejected with [`NdrError::CyclicReference`].

use crate::error::NdrError;
use crate::{NdrDecode, NdrEncode, NdrReader, NdrWriter, Result};
use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::ops::Deref;
use std::sync::Arc;

/// First referent ID handed out on a stream. Windows stubs start here too.
const FIRST_REFERENT_ID: u32 = 0x0002_0000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ReferentState {
    /// ID assigned, body not yet on the wire
    Pending,
    /// Body is being written or read
    InProgress,
    /// Body fully written or read
    Done,
}

#[derive(Debug)]
pub(crate) struct WriterReferents {
    next_id: u32,
    by_address: HashMap<usize, WriterEntry>,
}

/// The retained clone keeps the address allocated until the writer is dropped.
#[derive(Debug)]
struct WriterEntry {
    id: u32,
    state: ReferentState,
    _referent: Arc<dyn Any + Send + Sync>,
}

impl Default for WriterReferents {
    fn default() -> Self {
        Self {
            next_id: FIRST_REFERENT_ID,
            by_address: HashMap::new(),
        }
    }
}

impl WriterReferents {
    pub(crate) fn allocate(&mut self) -> u32 {
        let id = self.next_id;
        self.next_id = self.next_id.wrapping_add(4);
        id
    }

    pub(crate) fn lookup_or_insert(
        &mut self,
        key: usize,
        referent: Arc<dyn Any + Send + Sync>,
    ) -> Result<(u32, ReferentState)> {
        if let Some(entry) = self.by_address.get(&key) {
            if entry.state == ReferentState::InProgress {
                return Err(NdrError::CyclicReference(entry.id));
            }
            return Ok((entry.id, entry.state));
        }
        let id = self.allocate();
        self.by_address.insert(
            key,
            WriterEntry {
                id,
                state: ReferentState::Pending,
                _referent: referent,
            },
        );
        Ok((id, ReferentState::Pending))
    }

    pub(crate) fn set_state(&mut self, key: usize, state: ReferentState) {
        if let Some(entry) = self.by_address.get_mut(&key) {
            entry.state = state;
        }
    }
}

struct ReaderEntry {
    state: ReferentState,
    value: Option<Arc<dyn Any + Send + Sync>>,
}

#[derive(Default)]
pub(crate) struct ReaderReferents {
    by_id: HashMap<u32, ReaderEntry>,
}

impl fmt::Debug for ReaderReferents {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReaderReferents")
            .field("entries", &self.by_id.len())
            .finish()
    }
}

impl ReaderReferents {
    fn register(&mut self, id: u32) -> Result<()> {
        match self.by_id.get(&id) {
            Some(entry) if entry.state == ReferentState::InProgress => {
                Err(NdrError::CyclicReference(id))
            }
            Some(_) => Ok(()),
            None => {
                self.by_id.insert(
                    id,
                    ReaderEntry {
                        state: ReferentState::Pending,
                        value: None,
                    },
                );
                Ok(())
            }
        }
    }

    fn state(&self, id: u32) -> Result<ReferentState> {
        self.by_id
            .get(&id)
            .map(|e| e.state)
            .ok_or(NdrError::InvalidPointer(id))
    }

    fn begin(&mut self, id: u32) {
        if let Some(entry) = self.by_id.get_mut(&id) {
            entry.state = ReferentState::InProgress;
        }
    }

    fn finish(&mut self, id: u32, value: Arc<dyn Any + Send + Sync>) {
        if let Some(entry) = self.by_id.get_mut(&id) {
            entry.state = ReferentState::Done;
            entry.value = Some(value);
        }
    }

    fn shared<T: Send + Sync + 'static>(&self, id: u32) -> Result<Arc<T>> {
        let value = self
            .by_id
            .get(&id)
            .and_then(|e| e.value.clone())
            .ok_or(NdrError::InvalidPointer(id))?;
        value
            .downcast::<T>()
            .map_err(|_| NdrError::ReferentTypeMismatch(id))
    }
}

/// Reference pointer: never null, no referent ID on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RefPtr<T>(pub Box<T>);

impl<T> RefPtr<T> {
    pub fn new(value: T) -> Self {
        Self(Box::new(value))
    }

    pub fn into_inner(self) -> T {
        *self.0
    }
}

impl<T> TryFrom<UniquePtr<T>> for RefPtr<T> {
    type Error = NdrError;

    fn try_from(ptr: UniquePtr<T>) -> Result<Self> {
        ptr.into_option().map(Self::new).ok_or(NdrError::NullRefPointer)
    }
}

impl<T> Deref for RefPtr<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.0
    }
}

impl<T: NdrEncode> NdrEncode for RefPtr<T> {
    fn ndr_encode(&self, w: &mut NdrWriter) -> Result<()> {
        w.write(&*self.0)
    }

    fn ndr_encode_deferred(&self, w: &mut NdrWriter) -> Result<()> {
        w.write_deferred(&*self.0)
    }

    fn ndr_align() -> usize {
        T::ndr_align()
    }
}

impl<T: NdrDecode> NdrDecode for RefPtr<T> {
    fn ndr_decode(r: &mut NdrReader) -> Result<Self> {
        Ok(Self(Box::new(r.read::<T>()?)))
    }

    fn ndr_decode_deferred(&mut self, r: &mut NdrReader) -> Result<()> {
        r.read_deferred(&mut *self.0)
    }

    fn ndr_align() -> usize {
        T::ndr_align()
    }
}

#[derive(Debug, Clone)]
enum Slot<P> {
    Null,
    /// Referent ID read, body not yet decoded
    Pending(u32),
    Present(P),
}

/// Unique pointer: nullable, one referent, never aliased.
#[derive(Debug, Clone)]
pub struct UniquePtr<T>(Slot<Box<T>>);

impl<T> UniquePtr<T> {
    pub fn new(value: T) -> Self {
        Self(Slot::Present(Box::new(value)))
    }

    pub fn null() -> Self {
        Self(Slot::Null)
    }

    pub fn is_null(&self) -> bool {
        matches!(self.0, Slot::Null)
    }

    /// The pointee, once decoded. `None` for null pointers.
    pub fn get(&self) -> Option<&T> {
        match &self.0 {
            Slot::Present(v) => Some(&**v),
            _ => None,
        }
    }

    pub fn into_option(self) -> Option<T> {
        match self.0 {
            Slot::Present(v) => Some(*v),
            _ => None,
        }
    }
}

impl<T> Default for UniquePtr<T> {
    fn default() -> Self {
        Self::null()
    }
}

impl<T> From<Option<T>> for UniquePtr<T> {
    fn from(opt: Option<T>) -> Self {
        opt.map_or_else(Self::null, Self::new)
    }
}

impl<T: PartialEq> PartialEq for UniquePtr<T> {
    fn eq(&self, other: &Self) -> bool {
        self.get() == other.get() && self.is_null() == other.is_null()
    }
}

impl<T: NdrEncode> NdrEncode for UniquePtr<T> {
    fn ndr_encode(&self, w: &mut NdrWriter) -> Result<()> {
        let id = match self.0 {
            Slot::Null => 0,
            _ => w.next_referent(),
        };
        w.put_u32(id);
        Ok(())
    }

    fn ndr_encode_deferred(&self, w: &mut NdrWriter) -> Result<()> {
        match &self.0 {
            Slot::Present(value) => w.write_data(&**value),
            Slot::Null => Ok(()),
            Slot::Pending(id) => Err(NdrError::InvalidPointer(*id)),
        }
    }

    fn ndr_align() -> usize {
        4
    }
}

impl<T: NdrDecode> NdrDecode for UniquePtr<T> {
    fn ndr_decode(r: &mut NdrReader) -> Result<Self> {
        match r.get_u32()? {
            0 => Ok(Self::null()),
            id => Ok(Self(Slot::Pending(id))),
        }
    }

    fn ndr_decode_deferred(&mut self, r: &mut NdrReader) -> Result<()> {
        if let Slot::Pending(_) = self.0 {
            self.0 = Slot::Present(Box::new(r.read_data::<T>()?));
        }
        Ok(())
    }

    fn ndr_align() -> usize {
        4
    }
}

/// Full pointer: nullable, and several pointers may share one referent.
///
/// Sharing is expressed with `Arc`; two `FullPtr`s built from clones of the
/// same `Arc` are written with one referent ID and one body, and decode
/// back into clones of one `Arc`.
pub struct FullPtr<T>(Slot<Arc<T>>);

impl<T> FullPtr<T> {
    pub fn new(value: T) -> Self {
        Self(Slot::Present(Arc::new(value)))
    }

    pub fn from_arc(value: Arc<T>) -> Self {
        Self(Slot::Present(value))
    }

    pub fn null() -> Self {
        Self(Slot::Null)
    }

    pub fn is_null(&self) -> bool {
        matches!(self.0, Slot::Null)
    }

    pub fn get(&self) -> Option<&T> {
        match &self.0 {
            Slot::Present(v) => Some(&**v),
            _ => None,
        }
    }

    pub fn as_arc(&self) -> Option<&Arc<T>> {
        match &self.0 {
            Slot::Present(v) => Some(v),
            _ => None,
        }
    }

    /// True when both pointers refer to the same referent.
    pub fn ptr_eq(&self, other: &Self) -> bool {
        match (self.as_arc(), other.as_arc()) {
            (Some(a), Some(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }

    fn address(value: &Arc<T>) -> usize {
        Arc::as_ptr(value) as *const () as usize
    }
}

impl<T> Clone for FullPtr<T> {
    fn clone(&self) -> Self {
        Self(match &self.0 {
            Slot::Null => Slot::Null,
            Slot::Pending(id) => Slot::Pending(*id),
            Slot::Present(v) => Slot::Present(Arc::clone(v)),
        })
    }
}

impl<T> Default for FullPtr<T> {
    fn default() -> Self {
        Self::null()
    }
}

impl<T: fmt::Debug> fmt::Debug for FullPtr<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.0 {
            Slot::Null => f.write_str("FullPtr(null)"),
            Slot::Pending(id) => write!(f, "FullPtr(pending {id:#x})"),
            Slot::Present(v) => f.debug_tuple("FullPtr").field(v).finish(),
        }
    }
}

impl<T: PartialEq> PartialEq for FullPtr<T> {
    fn eq(&self, other: &Self) -> bool {
        self.get() == other.get() && self.is_null() == other.is_null()
    }
}

impl<T: NdrEncode + Send + Sync + 'static> NdrEncode for FullPtr<T> {
    fn ndr_encode(&self, w: &mut NdrWriter) -> Result<()> {
        let id = match &self.0 {
            Slot::Null => 0,
            Slot::Present(value) => w.full_referent(Self::address(value), value.clone())?.0,
            Slot::Pending(id) => return Err(NdrError::InvalidPointer(*id)),
        };
        w.put_u32(id);
        Ok(())
    }

    fn ndr_encode_deferred(&self, w: &mut NdrWriter) -> Result<()> {
        let Slot::Present(value) = &self.0 else {
            return Ok(());
        };
        let key = Self::address(value);
        let (_, state) = w.full_referent(key, value.clone())?;
        if state != ReferentState::Pending {
            return Ok(());
        }
        w.set_referent_state(key, ReferentState::InProgress);
        w.write_data(&**value)?;
        w.set_referent_state(key, ReferentState::Done);
        Ok(())
    }

    fn ndr_align() -> usize {
        4
    }
}

impl<T: NdrDecode + Send + Sync + 'static> NdrDecode for FullPtr<T> {
    fn ndr_decode(r: &mut NdrReader) -> Result<Self> {
        match r.get_u32()? {
            0 => Ok(Self::null()),
            id => {
                r.referents().register(id)?;
                Ok(Self(Slot::Pending(id)))
            }
        }
    }

    fn ndr_decode_deferred(&mut self, r: &mut NdrReader) -> Result<()> {
        let Slot::Pending(id) = self.0 else {
            return Ok(());
        };
        match r.referents().state(id)? {
            ReferentState::Pending => {
                r.referents().begin(id);
                let value = Arc::new(r.read_data::<T>()?);
                r.referents().finish(id, value.clone());
                self.0 = Slot::Present(value);
            }
            ReferentState::Done => {
                self.0 = Slot::Present(r.referents().shared::<T>(id)?);
            }
            ReferentState::InProgress => return Err(NdrError::CyclicReference(id)),
        }
        Ok(())
    }

    fn ndr_align() -> usize {
        4
    }
}
