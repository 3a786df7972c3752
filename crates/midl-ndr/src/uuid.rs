//! DCE UUIDs
//!
//! On the wire a UUID is a structure `{u32, u16, u16, u8[8]}`: the first
//! three fields follow the stream's byte order and the last eight bytes are
//! copied as-is.

use crate::{NdrContext, NdrDecode, NdrEncode, NdrError, NdrReader, NdrWriter, Result};
use bytes::{Buf, BufMut};
use std::fmt;
use std::str::FromStr;

/// UUID structure (128 bits)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Hash, PartialOrd, Ord)]
pub struct Uuid {
    pub time_low: u32,
    pub time_mid: u16,
    pub time_hi_and_version: u16,
    pub clock_seq_hi_and_reserved: u8,
    pub clock_seq_low: u8,
    pub node: [u8; 6],
}

impl Uuid {
    /// Nil UUID (all zeros)
    pub const NIL: Self = Self {
        time_low: 0,
        time_mid: 0,
        time_hi_and_version: 0,
        clock_seq_hi_and_reserved: 0,
        clock_seq_low: 0,
        node: [0; 6],
    };

    /// Parse from string format "xxxxxxxx-xxxx-xxxx-xxxx-xxxxxxxxxxxx"
    pub fn parse(s: &str) -> Option<Self> {
        let s = s.trim();
        if s.len() != 36 || !s.is_ascii() {
            return None;
        }
        let parts: Vec<&str> = s.split('-').collect();
        if parts.len() != 5 || parts[3].len() != 4 || parts[4].len() != 12 {
            return None;
        }

        let time_low = u32::from_str_radix(parts[0], 16).ok()?;
        let time_mid = u16::from_str_radix(parts[1], 16).ok()?;
        let time_hi_and_version = u16::from_str_radix(parts[2], 16).ok()?;
        let clock = u16::from_str_radix(parts[3], 16).ok()?;

        let mut node = [0u8; 6];
        for (i, byte) in node.iter_mut().enumerate() {
            *byte = u8::from_str_radix(&parts[4][i * 2..i * 2 + 2], 16).ok()?;
        }

        Some(Self {
            time_low,
            time_mid,
            time_hi_and_version,
            clock_seq_hi_and_reserved: (clock >> 8) as u8,
            clock_seq_low: clock as u8,
            node,
        })
    }

    pub fn is_nil(&self) -> bool {
        *self == Self::NIL
    }

    /// Encode UUID to 16 bytes in little-endian format
    pub fn to_bytes_le(&self) -> [u8; 16] {
        let mut bytes = [0u8; 16];
        bytes[0..4].copy_from_slice(&self.time_low.to_le_bytes());
        bytes[4..6].copy_from_slice(&self.time_mid.to_le_bytes());
        bytes[6..8].copy_from_slice(&self.time_hi_and_version.to_le_bytes());
        bytes[8] = self.clock_seq_hi_and_reserved;
        bytes[9] = self.clock_seq_low;
        bytes[10..16].copy_from_slice(&self.node);
        bytes
    }

    /// Decode UUID from 16 bytes in little-endian format
    pub fn from_bytes_le(bytes: [u8; 16]) -> Self {
        let mut buf = &bytes[..];
        Self::get(&mut buf, NdrContext::new())
    }

    /// Append the wire form in the byte order of `ctx`.
    pub fn put<B: BufMut>(&self, buf: &mut B, ctx: NdrContext) {
        ctx.put_u32(buf, self.time_low);
        ctx.put_u16(buf, self.time_mid);
        ctx.put_u16(buf, self.time_hi_and_version);
        buf.put_u8(self.clock_seq_hi_and_reserved);
        buf.put_u8(self.clock_seq_low);
        buf.put_slice(&self.node);
    }

    /// Read the wire form. Caller must have checked `buf.remaining() >= 16`.
    pub fn get<B: Buf>(buf: &mut B, ctx: NdrContext) -> Self {
        let time_low = ctx.get_u32(buf);
        let time_mid = ctx.get_u16(buf);
        let time_hi_and_version = ctx.get_u16(buf);
        let clock_seq_hi_and_reserved = buf.get_u8();
        let clock_seq_low = buf.get_u8();
        let mut node = [0u8; 6];
        buf.copy_to_slice(&mut node);
        Self {
            time_low,
            time_mid,
            time_hi_and_version,
            clock_seq_hi_and_reserved,
            clock_seq_low,
            node,
        }
    }
}

impl fmt::Display for Uuid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:08x}-{:04x}-{:04x}-{:02x}{:02x}-{:02x}{:02x}{:02x}{:02x}{:02x}{:02x}",
            self.time_low,
            self.time_mid,
            self.time_hi_and_version,
            self.clock_seq_hi_and_reserved,
            self.clock_seq_low,
            self.node[0],
            self.node[1],
            self.node[2],
            self.node[3],
            self.node[4],
            self.node[5]
        )
    }
}

impl FromStr for Uuid {
    type Err = NdrError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s).ok_or_else(|| NdrError::InvalidString(format!("malformed UUID {s:?}")))
    }
}

impl NdrEncode for Uuid {
    fn ndr_encode(&self, w: &mut NdrWriter) -> Result<()> {
        w.put_u32(self.time_low);
        w.put_u16(self.time_mid);
        w.put_u16(self.time_hi_and_version);
        w.put_u8(self.clock_seq_hi_and_reserved);
        w.put_u8(self.clock_seq_low);
        w.put_slice(&self.node);
        Ok(())
    }

    fn ndr_align() -> usize {
        4
    }
}

impl NdrDecode for Uuid {
    fn ndr_decode(r: &mut NdrReader) -> Result<Self> {
        let time_low = r.get_u32()?;
        let time_mid = r.get_u16()?;
        let time_hi_and_version = r.get_u16()?;
        let clock_seq_hi_and_reserved = r.get_u8()?;
        let clock_seq_low = r.get_u8()?;
        let node_bytes = r.get_bytes(6)?;
        let mut node = [0u8; 6];
        node.copy_from_slice(&node_bytes);
        Ok(Self {
            time_low,
            time_mid,
            time_hi_and_version,
            clock_seq_hi_and_reserved,
            clock_seq_low,
            node,
        })
    }

    fn ndr_align() -> usize {
        4
    }
}
