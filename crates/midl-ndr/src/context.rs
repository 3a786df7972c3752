//! NDR encoding/decoding context
//!
//! The context carries the negotiated data representation of a stream and
//! provides byte-order aware helpers for primitive encoding/decoding.

use bytes::{Buf, BufMut};

/// Data Representation Format Label
///
/// Wire format (4 bytes):
/// - Byte 0: bits 0-3 = character representation, bits 4-7 = integer representation
/// - Byte 1: floating point representation
/// - Bytes 2-3: reserved (zero)
///
/// Little-endian ASCII IEEE is `[0x10, 0x00, 0x00, 0x00]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DataRepresentation {
    pub int_rep: IntRep,
    pub char_rep: CharRep,
    pub float_rep: FloatRep,
}

/// Integer representation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IntRep {
    BigEndian = 0,
    LittleEndian = 1,
}

/// Character representation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CharRep {
    Ascii = 0,
    Ebcdic = 1,
}

/// Floating point representation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FloatRep {
    Ieee = 0,
    Vax = 1,
    Cray = 2,
    Ibm = 3,
}

impl DataRepresentation {
    /// Little-endian, ASCII, IEEE. What every Windows peer sends.
    pub const fn ndr() -> Self {
        Self {
            int_rep: IntRep::LittleEndian,
            char_rep: CharRep::Ascii,
            float_rep: FloatRep::Ieee,
        }
    }

    /// Big-endian, ASCII, IEEE
    pub const fn big_endian() -> Self {
        Self {
            int_rep: IntRep::BigEndian,
            char_rep: CharRep::Ascii,
            float_rep: FloatRep::Ieee,
        }
    }

    pub fn encode(&self) -> [u8; 4] {
        let byte0 = (self.char_rep as u8) | ((self.int_rep as u8) << 4);
        [byte0, self.float_rep as u8, 0, 0]
    }

    pub fn decode(data: [u8; 4]) -> Self {
        let int_rep = if (data[0] & 0xF0) == 0 {
            IntRep::BigEndian
        } else {
            IntRep::LittleEndian
        };
        let char_rep = if (data[0] & 0x0F) == 0 {
            CharRep::Ascii
        } else {
            CharRep::Ebcdic
        };
        let float_rep = match data[1] {
            0 => FloatRep::Ieee,
            1 => FloatRep::Vax,
            2 => FloatRep::Cray,
            _ => FloatRep::Ibm,
        };
        Self {
            int_rep,
            char_rep,
            float_rep,
        }
    }

    pub fn is_little_endian(&self) -> bool {
        self.int_rep == IntRep::LittleEndian
    }
}

impl Default for DataRepresentation {
    fn default() -> Self {
        Self::ndr()
    }
}

/// NDR encoding/decoding context
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NdrContext {
    pub data_rep: DataRepresentation,
}

impl NdrContext {
    /// Little-endian context (default)
    pub fn new() -> Self {
        Self::default()
    }

    pub fn big_endian() -> Self {
        Self {
            data_rep: DataRepresentation::big_endian(),
        }
    }

    pub fn with_data_rep(data_rep: DataRepresentation) -> Self {
        Self { data_rep }
    }

    #[inline]
    pub fn little_endian(&self) -> bool {
        self.data_rep.is_little_endian()
    }

    /// Calculate padding needed to align `position` to the given boundary
    #[inline]
    pub fn align_padding(position: usize, alignment: usize) -> usize {
        if alignment <= 1 {
            return 0;
        }
        let remainder = position % alignment;
        if remainder == 0 {
            0
        } else {
            alignment - remainder
        }
    }

    #[inline]
    pub fn put_u16<B: BufMut>(&self, buf: &mut B, value: u16) {
        if self.little_endian() {
            buf.put_u16_le(value);
        } else {
            buf.put_u16(value);
        }
    }

    #[inline]
    pub fn put_u32<B: BufMut>(&self, buf: &mut B, value: u32) {
        if self.little_endian() {
            buf.put_u32_le(value);
        } else {
            buf.put_u32(value);
        }
    }

    #[inline]
    pub fn put_u64<B: BufMut>(&self, buf: &mut B, value: u64) {
        if self.little_endian() {
            buf.put_u64_le(value);
        } else {
            buf.put_u64(value);
        }
    }

    #[inline]
    pub fn put_f32<B: BufMut>(&self, buf: &mut B, value: f32) {
        self.put_u32(buf, value.to_bits());
    }

    #[inline]
    pub fn put_f64<B: BufMut>(&self, buf: &mut B, value: f64) {
        self.put_u64(buf, value.to_bits());
    }

    /// Caller must have checked `buf.remaining() >= 2`.
    #[inline]
    pub fn get_u16<B: Buf>(&self, buf: &mut B) -> u16 {
        if self.little_endian() {
            buf.get_u16_le()
        } else {
            buf.get_u16()
        }
    }

    /// Caller must have checked `buf.remaining() >= 4`.
    #[inline]
    pub fn get_u32<B: Buf>(&self, buf: &mut B) -> u32 {
        if self.little_endian() {
            buf.get_u32_le()
        } else {
            buf.get_u32()
        }
    }

    /// Caller must have checked `buf.remaining() >= 8`.
    #[inline]
    pub fn get_u64<B: Buf>(&self, buf: &mut B) -> u64 {
        if self.little_endian() {
            buf.get_u64_le()
        } else {
            buf.get_u64()
        }
    }
}
