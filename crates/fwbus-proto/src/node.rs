use core::fmt;

/// 16-bit node id: 10-bit bus id in the high bits, 6-bit physical id in the low bits.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(u16);

impl NodeId {
    pub const BUS_MASK: u16 = 0x3ff;
    pub const PHY_MASK: u16 = 0x3f;

    /// Bus id meaning "the local bus".
    pub const LOCAL_BUS: u16 = 0x3ff;
    /// Physical id addressing every node on a bus.
    pub const BROADCAST_PHY: u8 = 63;

    pub const fn from_raw(raw: u16) -> Self {
        Self(raw)
    }

    pub const fn new(bus: u16, phy: u8) -> Self {
        Self(((bus & Self::BUS_MASK) << 6) | (phy as u16 & Self::PHY_MASK))
    }

    pub const fn local(phy: u8) -> Self {
        Self::new(Self::LOCAL_BUS, phy)
    }

    pub const fn broadcast(bus: u16) -> Self {
        Self::new(bus, Self::BROADCAST_PHY)
    }

    pub const fn raw(self) -> u16 {
        self.0
    }

    pub const fn bus(self) -> u16 {
        self.0 >> 6
    }

    pub const fn phy(self) -> u8 {
        (self.0 & Self::PHY_MASK) as u8
    }

    pub const fn is_broadcast(self) -> bool {
        self.phy() == Self::BROADCAST_PHY
    }

    pub const fn with_bus(self, bus: u16) -> Self {
        Self::new(bus, self.phy())
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeId({:#06x})", self.0)
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{:02}", self.bus(), self.phy())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_bus_and_phy() {
        let id = NodeId::new(0x155, 0x2a);
        assert_eq!(id.bus(), 0x155);
        assert_eq!(id.phy(), 0x2a);
        assert_eq!(NodeId::from_raw(id.raw()), id);
        assert_eq!(NodeId::local(2).raw(), 0xffc2);
        assert!(NodeId::broadcast(NodeId::LOCAL_BUS).is_broadcast());
        assert_eq!(NodeId::local(5).with_bus(1).raw(), (1 << 6) | 5);
    }
}
