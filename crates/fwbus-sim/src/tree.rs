//! Physical tree of the simulated bus and the Self-ID stream it produces.

use fwbus_proto::selfid::{BaseSelfId, ExtendedSelfId};
use fwbus_proto::{PortState, Speed};

use crate::SimError;

/// One PHY/link pair on the simulated bus.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeSpec {
    /// Index of the parent node; `None` only for the root, which must be the last node.
    pub parent: Option<usize>,
    pub speed: Speed,
    pub contender: bool,
    pub link_active: bool,
    pub rom: Vec<u8>,
}

impl NodeSpec {
    pub fn new(parent: Option<usize>) -> Self {
        Self {
            parent,
            speed: Speed::S400,
            contender: false,
            link_active: true,
            rom: Vec::new(),
        }
    }

    pub fn speed(mut self, speed: Speed) -> Self {
        self.speed = speed;
        self
    }

    pub fn contender(mut self) -> Self {
        self.contender = true;
        self
    }

    pub fn rom(mut self, rom: Vec<u8>) -> Self {
        self.rom = rom;
        self
    }
}

/// Largest node count a bus can number.
const MAX_NODES: usize = 63;

/// Checks that `nodes` is numbered in post-order: every subtree is the contiguous run of ids
/// ending at its root, and the last node is the tree root.
pub(crate) fn validate(nodes: &[NodeSpec]) -> Result<(), SimError> {
    if nodes.is_empty() {
        return Err(SimError::Empty);
    }
    if nodes.len() > MAX_NODES {
        return Err(SimError::TooManyNodes(nodes.len()));
    }
    let last = nodes.len() - 1;
    for (idx, node) in nodes.iter().enumerate() {
        match node.parent {
            None if idx != last => return Err(SimError::DetachedNode(idx)),
            Some(_) if idx == last => return Err(SimError::RootHasParent),
            Some(parent) if parent <= idx || parent > last => {
                return Err(SimError::BadParent { node: idx, parent })
            }
            _ => {}
        }
    }

    let sizes = subtree_sizes(nodes);
    for (idx, &size) in sizes.iter().enumerate() {
        let first = idx + 1 - size;
        for member in first..idx {
            if !descends_from(nodes, member, idx) {
                return Err(SimError::NotPostOrder(idx));
            }
        }
    }
    Ok(())
}

fn subtree_sizes(nodes: &[NodeSpec]) -> Vec<usize> {
    let mut sizes = vec![1usize; nodes.len()];
    for idx in 0..nodes.len() {
        if let Some(parent) = nodes[idx].parent {
            sizes[parent] += sizes[idx];
        }
    }
    sizes
}

fn descends_from(nodes: &[NodeSpec], mut node: usize, ancestor: usize) -> bool {
    while let Some(parent) = nodes[node].parent {
        if parent == ancestor {
            return true;
        }
        if parent > ancestor {
            return false;
        }
        node = parent;
    }
    false
}

/// Self-ID stream every node would emit after a reset, in physical id order.
pub(crate) fn selfid_stream(nodes: &[NodeSpec]) -> Vec<u32> {
    let mut stream = Vec::with_capacity(nodes.len());
    for (phy, node) in nodes.iter().enumerate() {
        let mut ports: Vec<PortState> = nodes
            .iter()
            .filter(|other| other.parent == Some(phy))
            .map(|_| PortState::Child)
            .collect();
        if node.parent.is_some() {
            ports.push(PortState::Parent);
        }

        let mut base_ports = [PortState::NotConnected; 3];
        for (slot, &port) in base_ports.iter_mut().zip(&ports) {
            *slot = port;
        }
        let extra = ports.get(3..).unwrap_or_default();
        stream.push(
            BaseSelfId {
                phy_id: phy as u8,
                link_active: node.link_active,
                gap_count: 0x3f,
                speed: node.speed,
                contender: node.contender,
                ports: base_ports,
                more_packets: !extra.is_empty(),
                ..BaseSelfId::default()
            }
            .encode(),
        );

        let chunks = extra.chunks(8).count();
        for (seq, chunk) in extra.chunks(8).enumerate() {
            let mut ext_ports = [PortState::None; 8];
            ext_ports[..chunk.len()].copy_from_slice(chunk);
            stream.push(
                ExtendedSelfId {
                    phy_id: phy as u8,
                    seq: seq as u8,
                    ports: ext_ports,
                    more_packets: seq + 1 < chunks,
                }
                .encode(),
            );
        }
    }
    stream
}

#[cfg(test)]
mod tests {
    use super::*;
    use fwbus_core::topology::check_selfids;

    fn star(leaves: usize) -> Vec<NodeSpec> {
        let root = leaves;
        let mut nodes: Vec<_> = (0..leaves).map(|_| NodeSpec::new(Some(root))).collect();
        nodes.push(NodeSpec::new(None).contender());
        nodes
    }

    #[test]
    fn star_with_many_ports_uses_extended_selfids() {
        let nodes = star(5);
        validate(&nodes).unwrap();
        let stream = selfid_stream(&nodes);
        assert_eq!(stream.len(), 7);
        let summary = check_selfids(&stream).unwrap();
        assert_eq!(summary.node_count, 6);
        assert_eq!(summary.irm, Some(5));
    }

    #[test]
    fn rejects_malformed_trees() {
        assert_eq!(validate(&[]), Err(SimError::Empty));
        assert_eq!(
            validate(&[NodeSpec::new(None), NodeSpec::new(None)]),
            Err(SimError::DetachedNode(0))
        );
        assert_eq!(
            validate(&[NodeSpec::new(Some(0))]),
            Err(SimError::RootHasParent)
        );
        assert_eq!(
            validate(&[NodeSpec::new(Some(0)), NodeSpec::new(None)]),
            Err(SimError::BadParent { node: 0, parent: 0 })
        );
        // Node 1 sits between node 0 and its parent 2 without belonging to that subtree.
        let interleaved = [
            NodeSpec::new(Some(2)),
            NodeSpec::new(Some(3)),
            NodeSpec::new(Some(3)),
            NodeSpec::new(None),
        ];
        assert_eq!(validate(&interleaved), Err(SimError::NotPostOrder(2)));
    }
}
