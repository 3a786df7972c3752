//! DCE RPC PDU Fragmentation Support
//!
//! This module implements multi-PDU fragmentation for DCE RPC as defined in:
//! - DCE 1.1: Remote Procedure Call (C706) Section 12.5
//! - MS-RPCE: Remote Procedure Call Protocol Extensions
//!
//! When stub data exceeds the negotiated `max_xmit_frag`/`max_recv_frag` limits,
//! the PDU must be split into multiple fragments. Each fragment carries:
//! - The same call_id
//! - FIRST_FRAG flag on first fragment
//! - LAST_FRAG flag on last fragment
//! - Fragment of the stub data
//!
//! # Fragment Structure
//!
//! ```text
//! max_frag size limit (e.g., 4280 bytes)
//! ├── PDU Header (16 bytes)
//! ├── Request/Response body header (8 bytes)
//! ├── Object UUID (16 bytes, optional, request only)
//! ├── Stub data fragment (variable)
//! ├── Auth padding (0-15 bytes, if authenticated)
//! └── Auth verifier (8 + auth_value bytes, if authenticated)
//! ```
//!
//! Incoming fragments are collected per call by a [`Reassembler`], which
//! holds partial state for several interleaved calls at once.

use crate::dcerpc::{PacketFlags, PduHeader, RequestPdu, ResponsePdu};
use crate::error::{Result, RpcError};
use bytes::{Bytes, BytesMut};
use std::collections::HashMap;
use tracing::trace;

/// Default cap on calls held partially reassembled on one connection
pub const DEFAULT_MAX_FRAGMENTED_CALLS: usize = 64;

/// Default cap on stub bytes buffered for reassembly on one connection
pub const DEFAULT_MAX_REASSEMBLY_BYTES: usize = 16 * 1024 * 1024;

/// Fragment generator for splitting outgoing PDUs into multiple fragments.
///
/// When stub data exceeds the maximum fragment size negotiated during bind,
/// the generator splits the data across multiple PDUs while maintaining
/// proper fragment flags and call identification.
pub struct FragmentGenerator;

impl FragmentGenerator {
    /// Calculate the maximum stub data size that can fit in a single fragment.
    ///
    /// # Arguments
    /// * `max_frag` - Maximum fragment size negotiated during bind (e.g., 4280)
    /// * `auth_len` - Length of authentication value (0 if no auth)
    /// * `has_object_uuid` - Whether the request has an object UUID
    ///
    /// # Returns
    /// Maximum bytes of stub data per fragment
    pub fn max_stub_size(max_frag: u16, auth_len: u16, has_object_uuid: bool) -> usize {
        let header_size = PduHeader::SIZE; // 16 bytes
        let body_header_size = RequestPdu::BODY_HEADER_SIZE; // 8 bytes (alloc_hint + ctx_id + opnum)
        let object_uuid_size = if has_object_uuid { 16 } else { 0 };

        let auth_overhead = if auth_len > 0 {
            // Auth padding (worst case 15 bytes) + auth verifier header (8 bytes) + auth value
            15 + 8 + auth_len as usize
        } else {
            0
        };

        let overhead = header_size + body_header_size + object_uuid_size + auth_overhead;
        (max_frag as usize).saturating_sub(overhead)
    }

    /// Byte ranges of each fragment's stub. An empty stub still makes one
    /// fragment.
    fn chunks(total_len: usize, max_stub: usize) -> impl Iterator<Item = (usize, usize)> {
        let count = total_len.div_ceil(max_stub).max(1);
        (0..count).map(move |i| {
            let start = i * max_stub;
            (start, (start + max_stub).min(total_len))
        })
    }

    fn flags(index: usize, count: usize) -> PacketFlags {
        let mut flags = PacketFlags::new();
        if index == 0 {
            flags.set_first_frag();
        }
        if index + 1 == count {
            flags.set_last_frag();
        }
        flags
    }

    /// Fragment a Request PDU into multiple fragments if needed.
    ///
    /// Every fragment keeps the request's auth verifier, which is signed
    /// separately per fragment when sent.
    pub fn fragment_request(request: &RequestPdu, max_frag: u16) -> Result<Vec<RequestPdu>> {
        let auth_len = request
            .auth_verifier
            .as_ref()
            .map(|av| av.auth_value.len() as u16)
            .unwrap_or(0);
        let has_object = request.object_uuid.is_some();
        let max_stub = Self::max_stub_size(max_frag, auth_len, has_object);
        if max_stub == 0 {
            return Err(RpcError::ResourceLimit(format!(
                "fragment size {max_frag} leaves no room for stub data"
            )));
        }

        let total_len = request.stub_data.len();
        let ranges: Vec<_> = Self::chunks(total_len, max_stub).collect();
        let count = ranges.len();

        Ok(ranges
            .into_iter()
            .enumerate()
            .map(|(index, (start, end))| {
                let mut frag = RequestPdu {
                    header: request.header.clone(),
                    alloc_hint: total_len as u32, // Total stub size across all fragments
                    context_id: request.context_id,
                    opnum: request.opnum,
                    object_uuid: request.object_uuid,
                    stub_data: request.stub_data.slice(start..end),
                    auth_verifier: request.auth_verifier.clone(),
                };
                frag.header.packet_flags = Self::flags(index, count);
                frag
            })
            .collect())
    }

    /// Fragment a Response PDU into multiple fragments if needed.
    pub fn fragment_response(response: &ResponsePdu, max_frag: u16) -> Result<Vec<ResponsePdu>> {
        let auth_len = response
            .auth_verifier
            .as_ref()
            .map(|av| av.auth_value.len() as u16)
            .unwrap_or(0);
        // Response has no object UUID
        let max_stub = Self::max_stub_size(max_frag, auth_len, false);
        if max_stub == 0 {
            return Err(RpcError::ResourceLimit(format!(
                "fragment size {max_frag} leaves no room for stub data"
            )));
        }

        let total_len = response.stub_data.len();
        let ranges: Vec<_> = Self::chunks(total_len, max_stub).collect();
        let count = ranges.len();

        Ok(ranges
            .into_iter()
            .enumerate()
            .map(|(index, (start, end))| {
                let mut frag = ResponsePdu {
                    header: response.header.clone(),
                    alloc_hint: total_len as u32,
                    context_id: response.context_id,
                    cancel_count: response.cancel_count,
                    stub_data: response.stub_data.slice(start..end),
                    auth_verifier: response.auth_verifier.clone(),
                };
                frag.header.packet_flags = Self::flags(index, count);
                frag
            })
            .collect())
    }
}

/// Fragment assembler for reassembling one incoming fragmented call.
///
/// Collects fragments until all are received (FIRST_FRAG through LAST_FRAG),
/// then returns the complete reassembled stub data.
pub struct FragmentAssembler {
    call_id: u32,
    stub_data: BytesMut,
    context_id: u16,
    /// Operation number (for requests only)
    opnum: Option<u16>,
    received_first: bool,
    received_last: bool,
}

impl FragmentAssembler {
    pub fn new(call_id: u32) -> Self {
        Self {
            call_id,
            stub_data: BytesMut::new(),
            context_id: 0,
            opnum: None,
            received_first: false,
            received_last: false,
        }
    }

    pub fn call_id(&self) -> u32 {
        self.call_id
    }

    pub fn context_id(&self) -> u16 {
        self.context_id
    }

    pub fn opnum(&self) -> Option<u16> {
        self.opnum
    }

    /// Bytes buffered so far
    pub fn len(&self) -> usize {
        self.stub_data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stub_data.is_empty()
    }

    pub fn is_complete(&self) -> bool {
        self.received_first && self.received_last
    }

    /// Add a fragment to the assembler.
    ///
    /// # Returns
    /// * `Ok(Some(data))` - Assembly complete, returns full stub data
    /// * `Ok(None)` - Fragment added, waiting for more
    /// * `Err(_)` - The fragment does not continue this call
    pub fn add_fragment(
        &mut self,
        header: &PduHeader,
        stub: &[u8],
        ctx_id: u16,
        opnum: Option<u16>,
    ) -> Result<Option<Bytes>> {
        let out_of_sequence = || RpcError::FragmentSequence {
            call_id: header.call_id,
        };
        if header.call_id != self.call_id || self.received_last {
            return Err(out_of_sequence());
        }

        if header.packet_flags.is_first_frag() {
            if self.received_first {
                return Err(out_of_sequence());
            }
            self.received_first = true;
            self.context_id = ctx_id;
            self.opnum = opnum;
        } else if !self.received_first {
            return Err(out_of_sequence());
        }

        // every fragment of a call names the same context and operation
        if ctx_id != self.context_id || opnum != self.opnum {
            return Err(out_of_sequence());
        }

        self.stub_data.extend_from_slice(stub);

        if header.packet_flags.is_last_frag() {
            self.received_last = true;
            return Ok(Some(self.stub_data.split().freeze()));
        }
        Ok(None)
    }
}

/// A request or response PDU as seen by the reassembler.
pub trait FragmentPdu: Sized {
    fn header(&self) -> &PduHeader;
    fn stub(&self) -> &Bytes;
    fn context_id(&self) -> u16;
    fn opnum(&self) -> Option<u16>;
    fn alloc_hint(&self) -> u32;
    /// Turn the first fragment into the complete PDU carrying `stub`.
    fn into_complete(self, stub: Bytes) -> Self;
}

impl FragmentPdu for RequestPdu {
    fn header(&self) -> &PduHeader {
        &self.header
    }

    fn stub(&self) -> &Bytes {
        &self.stub_data
    }

    fn context_id(&self) -> u16 {
        self.context_id
    }

    fn opnum(&self) -> Option<u16> {
        Some(self.opnum)
    }

    fn alloc_hint(&self) -> u32 {
        self.alloc_hint
    }

    fn into_complete(mut self, stub: Bytes) -> Self {
        self.header.packet_flags.set(PacketFlags::FIRST_FRAG | PacketFlags::LAST_FRAG);
        self.alloc_hint = stub.len() as u32;
        self.stub_data = stub;
        self
    }
}

impl FragmentPdu for ResponsePdu {
    fn header(&self) -> &PduHeader {
        &self.header
    }

    fn stub(&self) -> &Bytes {
        &self.stub_data
    }

    fn context_id(&self) -> u16 {
        self.context_id
    }

    fn opnum(&self) -> Option<u16> {
        None
    }

    fn alloc_hint(&self) -> u32 {
        self.alloc_hint
    }

    fn into_complete(mut self, stub: Bytes) -> Self {
        self.header.packet_flags.set(PacketFlags::FIRST_FRAG | PacketFlags::LAST_FRAG);
        self.alloc_hint = stub.len() as u32;
        self.stub_data = stub;
        self
    }
}

/// Per-connection reassembly of interleaved fragmented calls.
///
/// Bounds the number of calls held partially and the bytes they buffer.
pub struct Reassembler<P> {
    max_calls: usize,
    max_bytes: usize,
    buffered: usize,
    partial: HashMap<u32, (P, FragmentAssembler)>,
}

impl<P: FragmentPdu> Reassembler<P> {
    pub fn new(max_calls: usize, max_bytes: usize) -> Self {
        Self {
            max_calls,
            max_bytes,
            buffered: 0,
            partial: HashMap::new(),
        }
    }

    /// Number of calls with fragments outstanding
    pub fn pending_calls(&self) -> usize {
        self.partial.len()
    }

    pub fn buffered_bytes(&self) -> usize {
        self.buffered
    }

    /// Drop partial state for a call. Returns true if any was held.
    pub fn discard(&mut self, call_id: u32) -> bool {
        match self.partial.remove(&call_id) {
            Some((_, assembler)) => {
                self.buffered -= assembler.len();
                true
            }
            None => false,
        }
    }

    pub fn clear(&mut self) {
        self.partial.clear();
        self.buffered = 0;
    }

    /// Feed one fragment. Returns the complete PDU once its last fragment
    /// arrives.
    ///
    /// On error the call's partial state is dropped; other calls are
    /// unaffected.
    pub fn push(&mut self, pdu: P) -> Result<Option<P>> {
        let call_id = pdu.header().call_id;
        let flags = pdu.header().packet_flags;
        let len = pdu.stub().len();

        if flags.is_first_frag() {
            if self.discard(call_id) {
                return Err(RpcError::FragmentSequence { call_id });
            }
            if flags.is_last_frag() {
                return Ok(Some(pdu));
            }
            if self.partial.len() >= self.max_calls {
                return Err(RpcError::ResourceLimit(format!(
                    "{} calls already awaiting fragments",
                    self.partial.len()
                )));
            }
            self.check_budget(call_id, len)?;

            let mut assembler = FragmentAssembler::new(call_id);
            let reserve = (pdu.alloc_hint() as usize).min(self.max_bytes - self.buffered);
            assembler.stub_data.reserve(reserve);
            assembler.add_fragment(pdu.header(), pdu.stub(), pdu.context_id(), pdu.opnum())?;
            self.buffered += len;
            trace!(call_id, bytes = len, "first fragment buffered");
            self.partial.insert(call_id, (pdu, assembler));
            return Ok(None);
        }

        if !self.partial.contains_key(&call_id) {
            return Err(RpcError::FragmentSequence { call_id });
        }
        if let Err(e) = self.check_budget(call_id, len) {
            self.discard(call_id);
            return Err(e);
        }

        let step = match self.partial.get_mut(&call_id) {
            Some((_, assembler)) => {
                assembler.add_fragment(pdu.header(), pdu.stub(), pdu.context_id(), pdu.opnum())
            }
            None => Err(RpcError::FragmentSequence { call_id }),
        };
        match step {
            Ok(Some(stub)) => {
                let (first, _) = self
                    .partial
                    .remove(&call_id)
                    .ok_or(RpcError::FragmentSequence { call_id })?;
                // everything but this fragment was charged
                self.buffered -= stub.len() - len;
                trace!(call_id, bytes = stub.len(), "call reassembled");
                Ok(Some(first.into_complete(stub)))
            }
            Ok(None) => {
                self.buffered += len;
                trace!(call_id, bytes = len, "fragment buffered");
                Ok(None)
            }
            Err(e) => {
                self.discard(call_id);
                Err(e)
            }
        }
    }

    fn check_budget(&self, call_id: u32, bytes: usize) -> Result<()> {
        if self.buffered.saturating_add(bytes) > self.max_bytes {
            return Err(RpcError::ResourceLimit(format!(
                "call {call_id} exceeds reassembly budget of {} bytes",
                self.max_bytes
            )));
        }
        Ok(())
    }
}
