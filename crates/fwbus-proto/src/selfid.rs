//! Self-ID packet decoding (IEEE 1394-1995 §4.3.4.1, 1394a extended Self-IDs).
//!
//! Every Self-ID quadlet starts with `0b10` in bits 31..30 and the sender's physical id in bits
//! 29..24. Bit 23 selects the layout: clear for the base packet (packet #0), set for an extended
//! packet carrying up to eight more port states.

use crate::codes::Speed;

const ID_MARKER: u32 = 0b10;
const EXTENDED_BIT: u32 = 1 << 23;

/// State of one PHY port as reported in a Self-ID.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum PortState {
    /// Port not present on this PHY.
    #[default]
    None,
    NotConnected,
    /// Connected towards the root.
    Parent,
    /// Connected to a child node.
    Child,
}

impl PortState {
    pub const fn from_bits(bits: u32) -> Self {
        match bits & 0x3 {
            0 => Self::None,
            1 => Self::NotConnected,
            2 => Self::Parent,
            _ => Self::Child,
        }
    }

    pub const fn bits(self) -> u32 {
        match self {
            Self::None => 0,
            Self::NotConnected => 1,
            Self::Parent => 2,
            Self::Child => 3,
        }
    }
}

/// Self-ID packet #0.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BaseSelfId {
    pub phy_id: u8,
    pub link_active: bool,
    pub gap_count: u8,
    pub speed: Speed,
    pub delay: u8,
    pub contender: bool,
    pub power_class: u8,
    pub ports: [PortState; 3],
    pub initiated_reset: bool,
    pub more_packets: bool,
}

impl BaseSelfId {
    pub fn decode(quadlet: u32) -> Self {
        // The 2-bit field tops out at code 3 (S800 and beyond in 1394b).
        let speed = Speed::from_code(((quadlet >> 14) & 0x3) as u8).unwrap_or(Speed::S800);
        Self {
            phy_id: ((quadlet >> 24) & 0x3f) as u8,
            link_active: quadlet & (1 << 22) != 0,
            gap_count: ((quadlet >> 16) & 0x3f) as u8,
            speed,
            delay: ((quadlet >> 12) & 0x3) as u8,
            contender: quadlet & (1 << 11) != 0,
            power_class: ((quadlet >> 8) & 0x7) as u8,
            ports: [
                PortState::from_bits(quadlet >> 6),
                PortState::from_bits(quadlet >> 4),
                PortState::from_bits(quadlet >> 2),
            ],
            initiated_reset: quadlet & (1 << 1) != 0,
            more_packets: quadlet & 1 != 0,
        }
    }

    pub fn encode(&self) -> u32 {
        (ID_MARKER << 30)
            | ((u32::from(self.phy_id) & 0x3f) << 24)
            | (u32::from(self.link_active) << 22)
            | ((u32::from(self.gap_count) & 0x3f) << 16)
            | ((u32::from(self.speed.code()).min(3)) << 14)
            | ((u32::from(self.delay) & 0x3) << 12)
            | (u32::from(self.contender) << 11)
            | ((u32::from(self.power_class) & 0x7) << 8)
            | (self.ports[0].bits() << 6)
            | (self.ports[1].bits() << 4)
            | (self.ports[2].bits() << 2)
            | (u32::from(self.initiated_reset) << 1)
            | u32::from(self.more_packets)
    }
}

/// Extended Self-ID packet (#1, #2, ...).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ExtendedSelfId {
    pub phy_id: u8,
    /// Packet sequence number; the first extended packet uses 0.
    pub seq: u8,
    pub ports: [PortState; 8],
    pub more_packets: bool,
}

impl ExtendedSelfId {
    pub fn decode(quadlet: u32) -> Self {
        let mut ports = [PortState::None; 8];
        for (i, port) in ports.iter_mut().enumerate() {
            *port = PortState::from_bits(quadlet >> (16 - 2 * i));
        }
        Self {
            phy_id: ((quadlet >> 24) & 0x3f) as u8,
            seq: ((quadlet >> 20) & 0x7) as u8,
            ports,
            more_packets: quadlet & 1 != 0,
        }
    }

    pub fn encode(&self) -> u32 {
        let mut q = (ID_MARKER << 30)
            | ((u32::from(self.phy_id) & 0x3f) << 24)
            | EXTENDED_BIT
            | ((u32::from(self.seq) & 0x7) << 20)
            | u32::from(self.more_packets);
        for (i, port) in self.ports.iter().enumerate() {
            q |= port.bits() << (16 - 2 * i);
        }
        q
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SelfIdPacket {
    Base(BaseSelfId),
    Extended(ExtendedSelfId),
}

impl SelfIdPacket {
    /// Decodes one Self-ID quadlet, or `None` if it does not carry the Self-ID marker.
    pub fn decode(quadlet: u32) -> Option<Self> {
        if quadlet >> 30 != ID_MARKER {
            return None;
        }
        Some(if quadlet & EXTENDED_BIT != 0 {
            Self::Extended(ExtendedSelfId::decode(quadlet))
        } else {
            Self::Base(BaseSelfId::decode(quadlet))
        })
    }

    pub fn encode(&self) -> u32 {
        match self {
            Self::Base(base) => base.encode(),
            Self::Extended(ext) => ext.encode(),
        }
    }

    pub fn phy_id(&self) -> u8 {
        match self {
            Self::Base(base) => base.phy_id,
            Self::Extended(ext) => ext.phy_id,
        }
    }

    pub fn more_packets(&self) -> bool {
        match self {
            Self::Base(base) => base.more_packets,
            Self::Extended(ext) => ext.more_packets,
        }
    }

    pub fn ports(&self) -> &[PortState] {
        match self {
            Self::Base(base) => &base.ports,
            Self::Extended(ext) => &ext.ports,
        }
    }
}

/// A Self-ID is only valid when followed by its bitwise complement.
pub const fn verify_pair(selfid: u32, check: u32) -> bool {
    selfid == !check
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_base_fields() {
        // phy 2, link active, gap 0x3f, S400, contender, power 4, ports child/parent/none, more.
        let q = 0x807f_8c00 | (0x02 << 24) | (3 << 6) | (2 << 4) | 1;
        let Some(SelfIdPacket::Base(sid)) = SelfIdPacket::decode(q) else {
            panic!("expected base self-id");
        };
        assert_eq!(sid.phy_id, 2);
        assert!(sid.link_active);
        assert_eq!(sid.gap_count, 0x3f);
        assert_eq!(sid.speed, Speed::S400);
        assert!(sid.contender);
        assert_eq!(sid.power_class, 4);
        assert_eq!(
            sid.ports,
            [PortState::Child, PortState::Parent, PortState::None]
        );
        assert!(!sid.initiated_reset);
        assert!(sid.more_packets);
        assert_eq!(sid.encode(), q);
    }

    #[test]
    fn decodes_extended_ports_in_order() {
        let ext = ExtendedSelfId {
            phy_id: 9,
            seq: 1,
            ports: [
                PortState::Child,
                PortState::None,
                PortState::NotConnected,
                PortState::Parent,
                PortState::None,
                PortState::None,
                PortState::None,
                PortState::Child,
            ],
            more_packets: false,
        };
        let q = ext.encode();
        assert_eq!(q & EXTENDED_BIT, EXTENDED_BIT);
        assert_eq!((q >> 16) & 3, 3);
        assert_eq!((q >> 2) & 3, 3);
        assert_eq!(SelfIdPacket::decode(q), Some(SelfIdPacket::Extended(ext)));
    }

    #[test]
    fn rejects_non_selfid_quadlets() {
        assert_eq!(SelfIdPacket::decode(0x4000_0000), None);
        assert_eq!(SelfIdPacket::decode(0), None);
    }

    #[test]
    fn complement_check() {
        let q = 0x8040_0000;
        assert!(verify_pair(q, !q));
        assert!(!verify_pair(q, q));
    }
}
