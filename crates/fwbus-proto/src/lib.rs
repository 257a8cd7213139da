//! Wire-format vocabulary for the IEEE 1394 asynchronous transaction layer.
//!
//! This crate only describes bits on the wire: transaction/response/ack codes, node ids, async
//! packet headers, Self-ID packets and the standard CSR register offsets. It carries no runtime
//! state; the host/transaction machinery lives in `fwbus-core`.
//!
//! Quadlets are handled in host order everywhere in this crate. Byte buffers exchanged with a
//! link backend carry quadlets in big-endian (wire) order; see [`header::encode_packet`] and
//! [`header::decode_packet`].
#![forbid(unsafe_code)]

pub mod codes;
pub mod csr;
pub mod header;
pub mod node;
pub mod selfid;

pub use codes::{AckCode, ExtCode, Rcode, Speed, Tcode};
pub use header::{AsyncHeader, HeaderError, ParsedPacket, Route};
pub use node::NodeId;
pub use selfid::{BaseSelfId, ExtendedSelfId, PortState, SelfIdPacket};

/// 48-bit offset space addressable on each node.
pub const ADDRESS_SPACE_END: u64 = 1 << 48;

/// Mask selecting the 48-bit node offset of a bus address.
pub const ADDRESS_MASK: u64 = ADDRESS_SPACE_END - 1;
