//! NDR string types
//!
//! `[string]` strings are conformant varying arrays of characters:
//!
//! ```text
//! max_count: u32    # Maximum elements including terminator
//! offset: u32       # Always 0
//! actual_count: u32 # Transmitted elements including terminator
//! chars[actual_count]
//! ```
//!
//! The encoder always appends a terminator. The decoder takes exactly
//! `actual_count` characters and drops the last one only if it is NUL; it
//! never scans for a terminator. Nothing follows the characters: the next
//! field aligns itself.
//!
//! BSTRs travel as a `FLAGGED_WORD_BLOB`, a conformant structure whose
//! length comes from `clSize` and which carries no terminator at all.

use crate::context::CharRep;
use crate::error::MAX_NDR_ALLOCATION_SIZE;
use crate::{NdrDecode, NdrEncode, NdrError, NdrReader, NdrWriter, Result};

struct StringHeader {
    actual_count: usize,
}

fn write_string_header(w: &mut NdrWriter, len_with_null: usize) -> Result<()> {
    let count = u32::try_from(len_with_null).map_err(|_| NdrError::IntegerOverflow)?;
    w.put_u32(count);
    w.put_u32(0);
    w.put_u32(count);
    Ok(())
}

fn read_string_header(r: &mut NdrReader, unit_size: usize) -> Result<StringHeader> {
    let max_count = r.get_u32()? as usize;
    let offset = r.get_u32()? as usize;
    let actual_count = r.get_u32()? as usize;

    if offset != 0 {
        return Err(NdrError::InvalidString(format!("non-zero offset {offset}")));
    }
    if actual_count > max_count {
        return Err(NdrError::ConformanceMismatch {
            max_count: max_count as u32,
            offset: offset as u32,
            actual_count: actual_count as u32,
        });
    }
    let limit = MAX_NDR_ALLOCATION_SIZE / unit_size;
    if actual_count > limit {
        return Err(NdrError::AllocationLimitExceeded {
            requested: actual_count,
            limit,
        });
    }
    r.check_count(actual_count, unit_size)?;
    Ok(StringHeader { actual_count })
}

fn read_units(r: &mut NdrReader, count: usize) -> Result<Vec<u16>> {
    r.check_count(count, 2)?;
    let mut units = Vec::with_capacity(count);
    for _ in 0..count {
        units.push(r.get_u16()?);
    }
    Ok(units)
}

/// ANSI string type (null-terminated char*)
///
/// Used for [string] annotated char* parameters in MIDL.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct NdrString(pub String);

impl NdrString {
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }
}

impl From<String> for NdrString {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for NdrString {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl AsRef<str> for NdrString {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl NdrEncode for NdrString {
    fn ndr_encode(&self, w: &mut NdrWriter) -> Result<()> {
        if w.context().data_rep.char_rep == CharRep::Ebcdic {
            return Err(NdrError::UnsupportedCharacterSet);
        }
        let bytes = self.0.as_bytes();
        write_string_header(w, bytes.len() + 1)?;
        w.put_slice(bytes);
        w.put_u8(0);
        Ok(())
    }

    fn ndr_align() -> usize {
        4
    }
}

impl NdrDecode for NdrString {
    fn ndr_decode(r: &mut NdrReader) -> Result<Self> {
        if r.context().data_rep.char_rep == CharRep::Ebcdic {
            return Err(NdrError::UnsupportedCharacterSet);
        }
        let header = read_string_header(r, 1)?;
        let mut bytes = r.get_bytes(header.actual_count)?.to_vec();
        if bytes.last() == Some(&0) {
            bytes.pop();
        }
        Ok(Self(String::from_utf8(bytes)?))
    }

    fn ndr_align() -> usize {
        4
    }
}

/// Unicode string type (null-terminated wchar_t*)
///
/// Used for [string] annotated wchar_t* parameters in MIDL.
/// Encoded as UTF-16 in the stream's byte order.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct NdrWString(pub String);

impl NdrWString {
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }
}

impl From<String> for NdrWString {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for NdrWString {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl AsRef<str> for NdrWString {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl NdrEncode for NdrWString {
    fn ndr_encode(&self, w: &mut NdrWriter) -> Result<()> {
        let utf16: Vec<u16> = self.0.encode_utf16().collect();
        write_string_header(w, utf16.len() + 1)?;
        for unit in utf16 {
            w.put_u16(unit);
        }
        w.put_u16(0);
        Ok(())
    }

    fn ndr_align() -> usize {
        4
    }
}

impl NdrDecode for NdrWString {
    fn ndr_decode(r: &mut NdrReader) -> Result<Self> {
        let header = read_string_header(r, 2)?;
        let mut utf16 = read_units(r, header.actual_count)?;
        if utf16.last() == Some(&0) {
            utf16.pop();
        }
        Ok(Self(String::from_utf16(&utf16)?))
    }

    fn ndr_align() -> usize {
        4
    }
}

/// `FLAGGED_WORD_BLOB`, the wire body of a BSTR.
///
/// ```text
/// max_count: u32   # conformance, equal to cl_size
/// flags: u32
/// cl_size: u32     # number of UTF-16 units
/// units[cl_size]
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct FlaggedWordBlob {
    pub flags: u32,
    pub units: Vec<u16>,
}

impl NdrEncode for FlaggedWordBlob {
    fn ndr_encode(&self, w: &mut NdrWriter) -> Result<()> {
        let cl_size = u32::try_from(self.units.len()).map_err(|_| NdrError::IntegerOverflow)?;
        w.put_u32(cl_size);
        w.put_u32(self.flags);
        w.put_u32(cl_size);
        for &unit in &self.units {
            w.put_u16(unit);
        }
        Ok(())
    }

    fn ndr_align() -> usize {
        4
    }
}

impl NdrDecode for FlaggedWordBlob {
    fn ndr_decode(r: &mut NdrReader) -> Result<Self> {
        let max_count = r.get_u32()?;
        let flags = r.get_u32()?;
        let cl_size = r.get_u32()?;
        if cl_size > max_count {
            return Err(NdrError::ConformanceMismatch {
                max_count,
                offset: 0,
                actual_count: cl_size,
            });
        }
        Ok(Self {
            flags,
            units: read_units(r, cl_size as usize)?,
        })
    }

    fn ndr_align() -> usize {
        4
    }
}

/// BSTR - COM-style length-prefixed string
///
/// Length comes only from the blob's `cl_size`; embedded NULs survive.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct BString(pub String);

impl BString {
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }
}

impl From<String> for BString {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for BString {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl TryFrom<FlaggedWordBlob> for BString {
    type Error = NdrError;

    fn try_from(blob: FlaggedWordBlob) -> Result<Self> {
        Ok(Self(String::from_utf16(&blob.units)?))
    }
}

impl From<&BString> for FlaggedWordBlob {
    fn from(s: &BString) -> Self {
        Self {
            flags: 0,
            units: s.0.encode_utf16().collect(),
        }
    }
}

impl NdrEncode for BString {
    fn ndr_encode(&self, w: &mut NdrWriter) -> Result<()> {
        FlaggedWordBlob::from(self).ndr_encode(w)
    }

    fn ndr_align() -> usize {
        4
    }
}

impl NdrDecode for BString {
    fn ndr_decode(r: &mut NdrReader) -> Result<Self> {
        FlaggedWordBlob::ndr_decode(r)?.try_into()
    }

    fn ndr_align() -> usize {
        4
    }
}
