//! Self-ID stream validation and speed map construction.

use fwbus_proto::selfid::{BaseSelfId, SelfIdPacket};
use fwbus_proto::{NodeId, PortState, Speed};
use thiserror::Error;

/// Largest number of nodes on one bus (physical ids 0..=62).
pub const MAX_NODES: usize = 63;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SelfIdError {
    #[error("no Self-ID packets received")]
    Empty,

    #[error("quadlet {0:#010x} is not a Self-ID packet")]
    NotSelfId(u32),

    #[error("Self-IDs failed monotony check: expected phy {expected}, got {got}")]
    NonMonotonic { expected: i32, got: u8 },

    #[error("extended Self-ID for phy {phy_id} out of sequence: expected {expected}, got {got}")]
    BadSequence { phy_id: u8, expected: u8, got: u8 },

    #[error("root node {0} reports a parent port")]
    RootHasParent(u8),

    #[error("Self-ID stream describes more than {MAX_NODES} nodes")]
    TooManyNodes,
}

/// Result of a successful validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SelfIdSummary {
    pub node_count: usize,
    /// Nodes whose link layer is active.
    pub nodes_active: usize,
    /// Highest-numbered node that is both link-active and a contender.
    pub irm: Option<u8>,
}

/// Checks that physical ids increase from 0, that every node's extended Self-IDs are numbered
/// consecutively from 0, and that the last node (the root) has no parent port.
pub fn check_selfids(selfids: &[u32]) -> Result<SelfIdSummary, SelfIdError> {
    let mut packets = Vec::with_capacity(selfids.len());
    for &quadlet in selfids {
        packets.push(SelfIdPacket::decode(quadlet).ok_or(SelfIdError::NotSelfId(quadlet))?);
    }
    if packets.is_empty() {
        return Err(SelfIdError::Empty);
    }

    let mut node: i32 = -1;
    let mut next_seq = 0u8;
    let mut nodes_active = 0;
    let mut irm = None;
    for packet in &packets {
        match packet {
            SelfIdPacket::Base(sid) => {
                node += 1;
                next_seq = 0;
                if i32::from(sid.phy_id) != node {
                    return Err(SelfIdError::NonMonotonic {
                        expected: node,
                        got: sid.phy_id,
                    });
                }
                if sid.link_active {
                    nodes_active += 1;
                    if sid.contender {
                        irm = Some(sid.phy_id);
                    }
                }
            }
            SelfIdPacket::Extended(esid) => {
                if i32::from(esid.phy_id) != node {
                    return Err(SelfIdError::NonMonotonic {
                        expected: node,
                        got: esid.phy_id,
                    });
                }
                if esid.seq != next_seq {
                    return Err(SelfIdError::BadSequence {
                        phy_id: esid.phy_id,
                        expected: next_seq,
                        got: esid.seq,
                    });
                }
                next_seq += 1;
            }
        }
    }
    let node_count = (node + 1) as usize;
    if node_count > MAX_NODES {
        return Err(SelfIdError::TooManyNodes);
    }

    // The root's packets are the trailing run ending the stream.
    for packet in packets.iter().rev() {
        if packet.ports().contains(&PortState::Parent) {
            return Err(SelfIdError::RootHasParent(packet.phy_id()));
        }
        if matches!(packet, SelfIdPacket::Base(_)) {
            break;
        }
    }

    Ok(SelfIdSummary {
        node_count,
        nodes_active,
        irm,
    })
}

/// Symmetric node-to-node speed matrix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpeedMap {
    node_count: usize,
    speeds: Vec<Speed>,
}

impl SpeedMap {
    pub fn empty() -> Self {
        Self {
            node_count: 0,
            speeds: Vec::new(),
        }
    }

    /// Every pair, including the diagonal, at `speed`.
    pub fn uniform(node_count: usize, speed: Speed) -> Self {
        Self {
            node_count,
            speeds: vec![speed; node_count * node_count],
        }
    }

    pub fn node_count(&self) -> usize {
        self.node_count
    }

    /// Speed between two physical ids, or `None` if either is not on the bus.
    pub fn get(&self, a: u8, b: u8) -> Option<Speed> {
        let (a, b) = (usize::from(a), usize::from(b));
        (a < self.node_count && b < self.node_count).then(|| self.speeds[a * self.node_count + b])
    }

    fn set(&mut self, a: usize, b: usize, speed: Speed) {
        self.speeds[a * self.node_count + b] = speed;
    }

    fn at(&self, a: usize, b: usize) -> Speed {
        self.speeds[a * self.node_count + b]
    }

    /// Speed codes laid out as the 64-column rows of the CSR `SPEED_MAP` image, for `rows`
    /// rows. Entries outside the bus are S100.
    pub fn to_csr_bytes(&self, rows: usize) -> Vec<u8> {
        let mut out = vec![Speed::S100.code(); rows * 64];
        for a in 0..self.node_count.min(rows) {
            for b in 0..self.node_count {
                out[a * 64 + b] = self.at(a, b).code();
            }
        }
        out
    }
}

/// Builds the speed map of a validated Self-ID stream.
///
/// Nodes are numbered in post-order, so the subtree below node `n` is the contiguous block of
/// `children[n]` ids immediately preceding `n`. The speed between two nodes is the minimum
/// capability along the tree path joining them.
pub fn build_speed_map(selfids: &[u32], node_count: usize) -> SpeedMap {
    let mut map = SpeedMap::uniform(node_count, Speed::MAX);
    if node_count == 0 {
        return map;
    }
    let mut children = vec![0usize; node_count];
    let mut speedcap = vec![Speed::S100; node_count];

    // Direct child counts and capabilities, walking the stream backwards.
    let mut n = node_count;
    for packet in selfids.iter().rev().filter_map(|&q| SelfIdPacket::decode(q)) {
        let Some(idx) = n.checked_sub(1) else {
            break;
        };
        children[idx] += packet
            .ports()
            .iter()
            .filter(|&&p| p == PortState::Child)
            .count();
        if let SelfIdPacket::Base(BaseSelfId { speed, .. }) = packet {
            speedcap[idx] = speed;
            n = idx;
        }
    }

    for (i, &cap) in speedcap.iter().enumerate() {
        map.set(i, i, cap);
    }

    // Turn direct child counts into subtree sizes; clamp each child's capability by its
    // parent's.
    for i in 1..node_count {
        let mut child = i as isize - 1;
        for _ in 0..children[i] {
            if child < 0 {
                break;
            }
            let c = child as usize;
            children[i] += children[c];
            speedcap[c] = speedcap[c].min(speedcap[i]);
            child -= children[c] as isize + 1;
        }
    }

    // Pairs with one end inside the subtree of `n` and the other outside pass through `n`.
    for n in 0..node_count {
        let first = n.saturating_sub(children[n]);
        for i in first..=n {
            for j in (0..first).chain(n + 1..node_count) {
                let speed = map.at(i, j).min(speedcap[n]);
                map.set(i, j, speed);
                map.set(j, i, speed);
            }
        }
    }
    map
}

/// Local bus node id of the IRM in `summary`.
pub fn irm_node(summary: &SelfIdSummary, bus: u16) -> Option<NodeId> {
    summary.irm.map(|phy| NodeId::new(bus, phy))
}
