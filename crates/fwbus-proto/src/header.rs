//! Asynchronous packet headers.
//!
//! Header quadlet 0 is `destination_id:16 | tlabel:6 | retry:2 | tcode:4 | priority:4` for every
//! async packet. Requests carry `source_id:16 | offset_high:16` and `offset_low:32` in quadlets 1
//! and 2; responses carry `source_id:16 | rcode:4 | reserved:12` and a reserved quadlet 2.
//! Quadlet 3, when present, holds quadlet data or `data_length:16 | extended_tcode:16`.
//!
//! The `fill_*` builders are the only place that lays out these fields. Callers never pack
//! header bits themselves.

use crate::codes::{ExtCode, Rcode, Tcode};
use crate::node::NodeId;
use crate::ADDRESS_MASK;

/// Retry code written by every builder (`retry_X`, i.e. first attempt).
const RETRY_X: u32 = 1;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HeaderError {
    #[error("packet truncated: need {needed} bytes, have {actual}")]
    Truncated { needed: usize, actual: usize },

    #[error("unknown transaction code {0:#x}")]
    UnknownTcode(u8),

    #[error("header must be 2..=4 quadlets, got {0}")]
    BadHeaderLength(usize),
}

/// Addressing shared by a request and its response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Route {
    pub destination: NodeId,
    pub source: NodeId,
    pub tlabel: u8,
}

impl Route {
    pub const fn new(destination: NodeId, source: NodeId, tlabel: u8) -> Self {
        Self {
            destination,
            source,
            tlabel,
        }
    }

    /// The route a responder uses to answer a request that arrived on `self`.
    pub const fn reply(self) -> Self {
        Self {
            destination: self.source,
            source: self.destination,
            tlabel: self.tlabel,
        }
    }
}

/// Up to four header quadlets in host order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AsyncHeader {
    quadlets: [u32; 4],
    len: usize,
}

impl AsyncHeader {
    pub fn from_quadlets(quadlets: &[u32]) -> Result<Self, HeaderError> {
        if !(1..=4).contains(&quadlets.len()) {
            return Err(HeaderError::BadHeaderLength(quadlets.len()));
        }
        let mut out = Self {
            quadlets: [0; 4],
            len: quadlets.len(),
        };
        out.quadlets[..quadlets.len()].copy_from_slice(quadlets);
        Ok(out)
    }

    pub fn as_slice(&self) -> &[u32] {
        &self.quadlets[..self.len]
    }

    pub fn quadlet(&self, index: usize) -> u32 {
        self.as_slice().get(index).copied().unwrap_or(0)
    }

    pub fn len_bytes(&self) -> usize {
        self.len * 4
    }

    pub fn tcode_raw(&self) -> u8 {
        ((self.quadlets[0] >> 4) & 0xf) as u8
    }

    pub fn tcode(&self) -> Option<Tcode> {
        Tcode::from_raw(self.tcode_raw())
    }

    pub fn destination(&self) -> NodeId {
        NodeId::from_raw((self.quadlets[0] >> 16) as u16)
    }

    pub fn source(&self) -> NodeId {
        NodeId::from_raw((self.quadlets[1] >> 16) as u16)
    }

    pub fn tlabel(&self) -> u8 {
        ((self.quadlets[0] >> 10) & 0x3f) as u8
    }

    /// Rewrites the tlabel field in place.
    pub fn set_tlabel(&mut self, tlabel: u8) {
        self.quadlets[0] = (self.quadlets[0] & !(0x3f << 10)) | ((u32::from(tlabel) & 0x3f) << 10);
    }

    /// Rewrites the source id field in place.
    pub fn set_source(&mut self, source: NodeId) {
        self.quadlets[1] = (self.quadlets[1] & 0xffff) | (u32::from(source.raw()) << 16);
    }

    pub fn rcode_raw(&self) -> u8 {
        ((self.quadlets[1] >> 12) & 0xf) as u8
    }

    pub fn rcode(&self) -> Option<Rcode> {
        Rcode::from_raw(self.rcode_raw())
    }

    /// 48-bit destination offset of a request.
    pub fn offset(&self) -> u64 {
        (u64::from(self.quadlets[1] & 0xffff) << 32) | u64::from(self.quadlets[2])
    }

    /// `data_length` field of block and lock packets.
    pub fn data_length(&self) -> usize {
        (self.quadlets[3] >> 16) as usize
    }

    pub fn ext_code_raw(&self) -> u16 {
        (self.quadlets[3] & 0xffff) as u16
    }

    /// Quadlet payload of quadlet writes and quadlet read responses.
    pub fn quadlet_data(&self) -> u32 {
        self.quadlets[3]
    }

    /// Channel of an isochronous header.
    pub fn iso_channel(&self) -> u8 {
        ((self.quadlets[0] >> 8) & 0x3f) as u8
    }

    /// Payload length of an isochronous header.
    pub fn iso_length(&self) -> usize {
        (self.quadlets[0] >> 16) as usize
    }

    fn with(quadlets: [u32; 4], len: usize) -> Self {
        Self { quadlets, len }
    }
}

fn head(route: Route, tcode: Tcode) -> u32 {
    (u32::from(route.destination.raw()) << 16)
        | ((u32::from(route.tlabel) & 0x3f) << 10)
        | (RETRY_X << 8)
        | (u32::from(tcode.raw()) << 4)
}

fn address_head(route: Route, tcode: Tcode, offset: u64) -> [u32; 4] {
    let offset = offset & ADDRESS_MASK;
    [
        head(route, tcode),
        (u32::from(route.source.raw()) << 16) | (offset >> 32) as u32,
        offset as u32,
        0,
    ]
}

fn rcode_head(route: Route, tcode: Tcode, rcode: Rcode) -> [u32; 4] {
    [
        head(route, tcode),
        (u32::from(route.source.raw()) << 16) | (u32::from(rcode.raw()) << 12),
        0,
        0,
    ]
}

pub fn fill_async_read_quadlet(route: Route, offset: u64) -> AsyncHeader {
    AsyncHeader::with(address_head(route, Tcode::ReadQuadlet, offset), 3)
}

pub fn fill_async_read_block(route: Route, offset: u64, length: u16) -> AsyncHeader {
    let mut q = address_head(route, Tcode::ReadBlock, offset);
    q[3] = u32::from(length) << 16;
    AsyncHeader::with(q, 4)
}

pub fn fill_async_write_quadlet(route: Route, offset: u64, data: u32) -> AsyncHeader {
    let mut q = address_head(route, Tcode::WriteQuadlet, offset);
    q[3] = data;
    AsyncHeader::with(q, 4)
}

pub fn fill_async_write_block(route: Route, offset: u64, length: u16) -> AsyncHeader {
    let mut q = address_head(route, Tcode::WriteBlock, offset);
    q[3] = u32::from(length) << 16;
    AsyncHeader::with(q, 4)
}

pub fn fill_async_lock(route: Route, offset: u64, ext: ExtCode, length: u16) -> AsyncHeader {
    let mut q = address_head(route, Tcode::LockRequest, offset);
    q[3] = (u32::from(length) << 16) | u32::from(ext.raw());
    AsyncHeader::with(q, 4)
}

pub fn fill_async_write_resp(route: Route, rcode: Rcode) -> AsyncHeader {
    AsyncHeader::with(rcode_head(route, Tcode::WriteResponse, rcode), 3)
}

pub fn fill_async_read_quadlet_resp(route: Route, rcode: Rcode, data: u32) -> AsyncHeader {
    let mut q = rcode_head(route, Tcode::ReadQuadletResponse, rcode);
    q[3] = if rcode.is_complete() { data } else { 0 };
    AsyncHeader::with(q, 4)
}

/// A failed block read answers with a zero data length.
pub fn fill_async_read_block_resp(route: Route, rcode: Rcode, length: u16) -> AsyncHeader {
    let mut q = rcode_head(route, Tcode::ReadBlockResponse, rcode);
    let length = if rcode.is_complete() { length } else { 0 };
    q[3] = u32::from(length) << 16;
    AsyncHeader::with(q, 4)
}

/// `ext_raw` echoes the request's extended code even when it was invalid.
pub fn fill_async_lock_resp(route: Route, rcode: Rcode, ext_raw: u16, length: u16) -> AsyncHeader {
    let mut q = rcode_head(route, Tcode::LockResponse, rcode);
    q[3] = (u32::from(length) << 16) | u32::from(ext_raw);
    AsyncHeader::with(q, 4)
}

/// Isochronous data block header: `length:16 | tag:2 | channel:6 | tcode:4 | sy:4`.
pub fn fill_iso(length: u16, channel: u8, tag: u8, sync: u8) -> AsyncHeader {
    let q0 = (u32::from(length) << 16)
        | ((u32::from(tag) & 0x3) << 14)
        | ((u32::from(channel) & 0x3f) << 8)
        | (u32::from(Tcode::IsoData.raw()) << 4)
        | (u32::from(sync) & 0xf);
    AsyncHeader::with([q0, 0, 0, 0], 1)
}

/// PHY packets are a quadlet followed by its bitwise complement.
pub fn fill_phy(data: u32) -> AsyncHeader {
    AsyncHeader::with([data, !data, 0, 0], 2)
}

/// Number of zero bytes needed to pad `len` to a quadlet boundary.
pub const fn quadlet_padding(len: usize) -> usize {
    (4 - (len % 4)) % 4
}

/// Serializes a header and data block into wire (big-endian) order, padding the data block to a
/// quadlet boundary.
pub fn encode_packet(header: &AsyncHeader, data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(header.len_bytes() + data.len() + quadlet_padding(data.len()));
    for q in header.as_slice() {
        out.extend_from_slice(&q.to_be_bytes());
    }
    out.extend_from_slice(data);
    out.resize(out.len() + quadlet_padding(data.len()), 0);
    out
}

/// A decoded inbound packet. `payload` is the (possibly padded) data block following the header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParsedPacket<'a> {
    pub tcode: Tcode,
    pub header: AsyncHeader,
    pub payload: &'a [u8],
}

impl<'a> ParsedPacket<'a> {
    /// The payload truncated to the header's `data_length` (or the iso length).
    pub fn data(&self) -> &'a [u8] {
        let len = match self.tcode {
            Tcode::IsoData => self.header.iso_length(),
            _ => self.header.data_length(),
        };
        &self.payload[..len.min(self.payload.len())]
    }
}

/// Parses a wire-order packet. The header length is derived from the tcode.
pub fn decode_packet(bytes: &[u8]) -> Result<ParsedPacket<'_>, HeaderError> {
    if bytes.len() < 4 {
        return Err(HeaderError::Truncated {
            needed: 4,
            actual: bytes.len(),
        });
    }
    let q0 = u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
    let raw = ((q0 >> 4) & 0xf) as u8;
    let tcode = Tcode::from_raw(raw).ok_or(HeaderError::UnknownTcode(raw))?;
    let header_len = tcode.header_len();
    if bytes.len() < header_len {
        return Err(HeaderError::Truncated {
            needed: header_len,
            actual: bytes.len(),
        });
    }

    let mut quadlets = [0u32; 4];
    for (i, chunk) in bytes[..header_len].chunks_exact(4).enumerate() {
        quadlets[i] = u32::from_be_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
    }

    Ok(ParsedPacket {
        tcode,
        header: AsyncHeader::with(quadlets, header_len / 4),
        payload: &bytes[header_len..],
    })
}
