//! NDR array types
//!
//! NDR supports several array types:
//!
//! - Fixed arrays: size known at compile time
//! - Conformant arrays: size determined at runtime, transmitted as prefix
//! - Varying arrays: subset of elements transmitted
//! - Conformant varying arrays: both conformant and varying
//!
//! Elements are written immediate-part first, all of them, and the deferred
//! pointer bodies of the elements follow in element order.

use crate::{NdrDecode, NdrEncode, NdrError, NdrReader, NdrWriter, Result};
use std::marker::PhantomData;

fn write_elements<T: NdrEncode>(w: &mut NdrWriter, elements: &[T]) -> Result<()> {
    for elem in elements {
        w.write(elem)?;
    }
    Ok(())
}

fn write_elements_deferred<T: NdrEncode>(w: &mut NdrWriter, elements: &[T]) -> Result<()> {
    for elem in elements {
        w.write_deferred(elem)?;
    }
    Ok(())
}

fn read_elements<T: NdrDecode>(r: &mut NdrReader, count: usize) -> Result<Vec<T>> {
    r.check_count(count, T::ndr_align())?;
    let mut elements = Vec::with_capacity(count);
    for _ in 0..count {
        elements.push(r.read::<T>()?);
    }
    Ok(elements)
}

fn read_elements_deferred<T: NdrDecode>(r: &mut NdrReader, elements: &mut [T]) -> Result<()> {
    for elem in elements {
        r.read_deferred(elem)?;
    }
    Ok(())
}

fn wire_count(n: usize) -> Result<u32> {
    u32::try_from(n).map_err(|_| NdrError::IntegerOverflow)
}

/// Fixed-size array
///
/// Wire format: just the elements (no size prefix)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FixedArray<T, const N: usize> {
    pub elements: [T; N],
}

impl<T: Default + Copy, const N: usize> Default for FixedArray<T, N> {
    fn default() -> Self {
        Self {
            elements: [T::default(); N],
        }
    }
}

impl<T, const N: usize> FixedArray<T, N> {
    pub fn new(elements: [T; N]) -> Self {
        Self { elements }
    }
}

impl<T: NdrEncode, const N: usize> NdrEncode for FixedArray<T, N> {
    fn ndr_encode(&self, w: &mut NdrWriter) -> Result<()> {
        write_elements(w, &self.elements)
    }

    fn ndr_encode_deferred(&self, w: &mut NdrWriter) -> Result<()> {
        write_elements_deferred(w, &self.elements)
    }

    fn ndr_align() -> usize {
        T::ndr_align()
    }
}

impl<T: NdrDecode, const N: usize> NdrDecode for FixedArray<T, N> {
    fn ndr_decode(r: &mut NdrReader) -> Result<Self> {
        let elements = read_elements::<T>(r, N)?;
        let elements: [T; N] = elements
            .try_into()
            .map_err(|v: Vec<T>| NdrError::ArraySizeMismatch {
                expected: N,
                got: v.len(),
            })?;
        Ok(Self { elements })
    }

    fn ndr_decode_deferred(&mut self, r: &mut NdrReader) -> Result<()> {
        read_elements_deferred(r, &mut self.elements)
    }

    fn ndr_align() -> usize {
        T::ndr_align()
    }
}

/// Conformant array - size determined at runtime
///
/// Wire format:
/// ```text
/// max_count: u32      # Maximum elements
/// elements[max_count] # Element data
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ConformantArray<T> {
    pub elements: Vec<T>,
}

impl<T> ConformantArray<T> {
    pub fn new(elements: Vec<T>) -> Self {
        Self { elements }
    }

    pub fn len(&self) -> usize {
        self.elements.len()
    }

    pub fn is_empty(&self) -> bool {
        self.elements.is_empty()
    }

    pub fn into_vec(self) -> Vec<T> {
        self.elements
    }
}

impl<T> From<Vec<T>> for ConformantArray<T> {
    fn from(elements: Vec<T>) -> Self {
        Self { elements }
    }
}

impl<T: NdrEncode> NdrEncode for ConformantArray<T> {
    fn ndr_encode(&self, w: &mut NdrWriter) -> Result<()> {
        w.put_u32(wire_count(self.elements.len())?);
        write_elements(w, &self.elements)
    }

    fn ndr_encode_deferred(&self, w: &mut NdrWriter) -> Result<()> {
        write_elements_deferred(w, &self.elements)
    }

    fn ndr_align() -> usize {
        4
    }
}

impl<T: NdrDecode> NdrDecode for ConformantArray<T> {
    fn ndr_decode(r: &mut NdrReader) -> Result<Self> {
        let max_count = r.get_u32()? as usize;
        Ok(Self {
            elements: read_elements(r, max_count)?,
        })
    }

    fn ndr_decode_deferred(&mut self, r: &mut NdrReader) -> Result<()> {
        read_elements_deferred(r, &mut self.elements)
    }

    fn ndr_align() -> usize {
        4
    }
}

/// Varying array - subset of fixed array transmitted
///
/// Wire format:
/// ```text
/// offset: u32       # First transmitted element
/// actual_count: u32 # Number of transmitted elements
/// elements[actual_count]
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VaryingArray<T, const N: usize> {
    pub offset: usize,
    pub elements: Vec<T>,
    _marker: PhantomData<[T; N]>,
}

impl<T, const N: usize> Default for VaryingArray<T, N> {
    fn default() -> Self {
        Self {
            offset: 0,
            elements: Vec::new(),
            _marker: PhantomData,
        }
    }
}

impl<T, const N: usize> VaryingArray<T, N> {
    pub fn new(elements: Vec<T>) -> Self {
        Self::with_offset(0, elements)
    }

    pub fn with_offset(offset: usize, elements: Vec<T>) -> Self {
        Self {
            offset,
            elements,
            _marker: PhantomData,
        }
    }
}

fn check_bounds(max_count: usize, offset: usize, actual_count: usize) -> Result<()> {
    let end = offset.checked_add(actual_count).ok_or(NdrError::IntegerOverflow)?;
    if end > max_count {
        return Err(NdrError::ConformanceMismatch {
            max_count: max_count as u32,
            offset: offset as u32,
            actual_count: actual_count as u32,
        });
    }
    Ok(())
}

impl<T: NdrEncode, const N: usize> NdrEncode for VaryingArray<T, N> {
    fn ndr_encode(&self, w: &mut NdrWriter) -> Result<()> {
        check_bounds(N, self.offset, self.elements.len())?;
        w.put_u32(wire_count(self.offset)?);
        w.put_u32(wire_count(self.elements.len())?);
        write_elements(w, &self.elements)
    }

    fn ndr_encode_deferred(&self, w: &mut NdrWriter) -> Result<()> {
        write_elements_deferred(w, &self.elements)
    }

    fn ndr_align() -> usize {
        4
    }
}

impl<T: NdrDecode, const N: usize> NdrDecode for VaryingArray<T, N> {
    fn ndr_decode(r: &mut NdrReader) -> Result<Self> {
        let offset = r.get_u32()? as usize;
        let actual_count = r.get_u32()? as usize;
        check_bounds(N, offset, actual_count)?;
        Ok(Self::with_offset(offset, read_elements(r, actual_count)?))
    }

    fn ndr_decode_deferred(&mut self, r: &mut NdrReader) -> Result<()> {
        read_elements_deferred(r, &mut self.elements)
    }

    fn ndr_align() -> usize {
        4
    }
}

/// Conformant varying array - size and subset determined at runtime
///
/// Wire format:
/// ```text
/// max_count: u32    # Maximum elements (conformance)
/// offset: u32       # First transmitted element
/// actual_count: u32 # Number of transmitted elements
/// elements[actual_count]
/// ```
///
/// Decoding rejects `offset + actual_count > max_count`.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ConformantVaryingArray<T> {
    pub max_count: usize,
    pub offset: usize,
    pub elements: Vec<T>,
}

impl<T> ConformantVaryingArray<T> {
    pub fn new(elements: Vec<T>) -> Self {
        let len = elements.len();
        Self {
            max_count: len,
            offset: 0,
            elements,
        }
    }

    pub fn with_max(max_count: usize, elements: Vec<T>) -> Self {
        Self {
            max_count,
            offset: 0,
            elements,
        }
    }

    pub fn len(&self) -> usize {
        self.elements.len()
    }

    pub fn is_empty(&self) -> bool {
        self.elements.is_empty()
    }
}

impl<T: NdrEncode> NdrEncode for ConformantVaryingArray<T> {
    fn ndr_encode(&self, w: &mut NdrWriter) -> Result<()> {
        check_bounds(self.max_count, self.offset, self.elements.len())?;
        w.put_u32(wire_count(self.max_count)?);
        w.put_u32(wire_count(self.offset)?);
        w.put_u32(wire_count(self.elements.len())?);
        write_elements(w, &self.elements)
    }

    fn ndr_encode_deferred(&self, w: &mut NdrWriter) -> Result<()> {
        write_elements_deferred(w, &self.elements)
    }

    fn ndr_align() -> usize {
        4
    }
}

impl<T: NdrDecode> NdrDecode for ConformantVaryingArray<T> {
    fn ndr_decode(r: &mut NdrReader) -> Result<Self> {
        let max_count = r.get_u32()? as usize;
        let offset = r.get_u32()? as usize;
        let actual_count = r.get_u32()? as usize;
        check_bounds(max_count, offset, actual_count)?;
        Ok(Self {
            max_count,
            offset,
            elements: read_elements(r, actual_count)?,
        })
    }

    fn ndr_decode_deferred(&mut self, r: &mut NdrReader) -> Result<()> {
        read_elements_deferred(r, &mut self.elements)
    }

    fn ndr_align() -> usize {
        4
    }
}
