//! Deterministic in-process IEEE 1394 bus for exercising `fwbus-core` hosts.
//!
//! Every simulated node is a full [`Host`] whose backend is a [`SimLink`] into one shared
//! [`SimBus`]. Transmissions are acked and delivered synchronously on the sending thread, and a
//! bus reset replays the Self-ID phase on every host before returning.
#![forbid(unsafe_code)]

mod tree;

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use fwbus_core::{
    DevCtl, DriverError, Host, HostConfig, HostDriver, HostError, HostRegistry, Packet, PacketKind,
};
use fwbus_proto::AckCode;
use thiserror::Error;

pub use tree::NodeSpec;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SimError {
    #[error("a bus needs at least one node")]
    Empty,

    #[error("{0} nodes do not fit on one bus")]
    TooManyNodes(usize),

    #[error("node {0} has no parent but is not the last node")]
    DetachedNode(usize),

    #[error("the last node must be the root")]
    RootHasParent,

    #[error("node {node} names parent {parent}, which must follow it")]
    BadParent { node: usize, parent: usize },

    #[error("subtree of node {0} is not numbered contiguously")]
    NotPostOrder(usize),

    #[error(transparent)]
    Host(#[from] HostError),
}

/// How a node's link answers asynchronous packets addressed to it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum NodeMode {
    #[default]
    Normal,
    /// Acks requests pending but never sees them, so no response ever comes.
    Deaf,
    /// Answers every packet with `ack_busy_X`.
    Busy,
}

struct SimNode {
    spec: NodeSpec,
    mode: NodeMode,
    host: Option<Arc<Host>>,
}

#[derive(Default)]
struct SimState {
    nodes: Vec<SimNode>,
    resetting: bool,
    pending_reset: bool,
    /// Streams to hand out instead of the real one on the next resets.
    selfid_overrides: VecDeque<Vec<u32>>,
    cycle_time: u32,
    resets: usize,
}

pub struct SimBus {
    state: Mutex<SimState>,
}

impl SimBus {
    /// Creates one host per node in `nodes`, numbered in post-order, and runs the first reset.
    pub fn build(
        registry: &HostRegistry,
        nodes: Vec<NodeSpec>,
        config: HostConfig,
    ) -> Result<Arc<Self>, SimError> {
        tree::validate(&nodes)?;
        let count = nodes.len();
        let bus = Arc::new(Self {
            state: Mutex::new(SimState {
                nodes: nodes
                    .into_iter()
                    .map(|spec| SimNode {
                        spec,
                        mode: NodeMode::Normal,
                        host: None,
                    })
                    .collect(),
                ..SimState::default()
            }),
        });

        for phy in 0..count {
            let link = Arc::new(SimLink {
                bus: Arc::downgrade(&bus),
                phy,
            });
            let host = registry.add_host(link, config.clone())?;
            bus.lock().nodes[phy].host = Some(host);
        }
        tracing::debug!(nodes = count, "simulated bus built");

        bus.reset();
        Ok(bus)
    }

    fn lock(&self) -> MutexGuard<'_, SimState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn node_count(&self) -> usize {
        self.lock().nodes.len()
    }

    /// Host of the node with physical id `phy`.
    pub fn host(&self, phy: usize) -> Option<Arc<Host>> {
        self.lock().nodes.get(phy).and_then(|node| node.host.clone())
    }

    pub fn hosts(&self) -> Vec<Arc<Host>> {
        self.lock()
            .nodes
            .iter()
            .filter_map(|node| node.host.clone())
            .collect()
    }

    pub fn set_mode(&self, phy: usize, mode: NodeMode) {
        if let Some(node) = self.lock().nodes.get_mut(phy) {
            node.mode = mode;
        }
    }

    pub fn set_cycle_time(&self, cycle_time: u32) {
        self.lock().cycle_time = cycle_time;
    }

    /// Number of completed Self-ID phases.
    pub fn resets(&self) -> usize {
        self.lock().resets
    }

    /// Self-ID stream the current tree produces.
    pub fn selfids(&self) -> Vec<u32> {
        let state = self.lock();
        let specs: Vec<NodeSpec> = state.nodes.iter().map(|n| n.spec.clone()).collect();
        tree::selfid_stream(&specs)
    }

    /// Makes the next reset deliver `selfids` instead of the tree's real stream. Queued
    /// streams are used in order, one per reset.
    pub fn queue_selfid_stream(&self, selfids: Vec<u32>) {
        self.lock().selfid_overrides.push_back(selfids);
    }

    /// Runs a bus reset on every host. A reset requested while one is running is folded into
    /// another pass once the current one finishes.
    pub fn reset(&self) {
        {
            let mut state = self.lock();
            if state.resetting {
                state.pending_reset = true;
                return;
            }
            state.resetting = true;
        }

        loop {
            let (hosts, selfids) = {
                let mut state = self.lock();
                state.pending_reset = false;
                let selfids = match state.selfid_overrides.pop_front() {
                    Some(selfids) => selfids,
                    None => {
                        let specs: Vec<NodeSpec> =
                            state.nodes.iter().map(|n| n.spec.clone()).collect();
                        tree::selfid_stream(&specs)
                    }
                };
                let hosts: Vec<Arc<Host>> =
                    state.nodes.iter().filter_map(|n| n.host.clone()).collect();
                (hosts, selfids)
            };

            for host in &hosts {
                host.bus_reset();
            }
            for host in &hosts {
                for &quadlet in &selfids {
                    host.selfid_received_pair(quadlet, !quadlet);
                }
            }
            let root = hosts.len().saturating_sub(1);
            for (phy, host) in hosts.iter().enumerate() {
                host.selfid_complete(phy as u8, phy == root);
            }

            let mut state = self.lock();
            state.resets += 1;
            if !state.pending_reset {
                state.resetting = false;
                break;
            }
        }
    }

    fn transmit(&self, from: usize, packet: &Packet) -> bool {
        let wire = packet.to_wire();
        let (sender, targets, ack) = {
            let state = self.lock();
            let Some(sender) = state.nodes.get(from).and_then(|n| n.host.clone()) else {
                return false;
            };
            if state.resetting {
                return false;
            }

            let everyone_else = || {
                state
                    .nodes
                    .iter()
                    .enumerate()
                    .filter(|&(phy, _)| phy != from)
                    .filter_map(|(_, n)| n.host.clone())
                    .collect::<Vec<_>>()
            };
            match packet.kind() {
                PacketKind::Raw => (sender, Vec::new(), AckCode::Complete),
                PacketKind::Iso => (sender, everyone_else(), AckCode::Complete),
                PacketKind::Async if packet.destination().is_broadcast() => {
                    (sender, everyone_else(), AckCode::Complete)
                }
                PacketKind::Async => {
                    let phy = usize::from(packet.destination().phy());
                    match state.nodes.get(phy) {
                        None => (sender, Vec::new(), AckCode::NoAck),
                        Some(node) => {
                            let request = packet.tcode().is_some_and(|t| t.is_request());
                            let target: Vec<Arc<Host>> = node.host.clone().into_iter().collect();
                            match node.mode {
                                NodeMode::Normal if request => (sender, target, AckCode::Pending),
                                NodeMode::Normal => (sender, target, AckCode::Complete),
                                NodeMode::Deaf if request => (sender, Vec::new(), AckCode::Pending),
                                NodeMode::Deaf => (sender, Vec::new(), AckCode::Complete),
                                NodeMode::Busy => (sender, Vec::new(), AckCode::BusyX),
                            }
                        }
                    }
                }
            }
        };

        tracing::trace!(from, packet = %packet.id(), ?ack, targets = targets.len(), "sim transmit");
        sender.packet_sent(packet.id(), ack);
        for target in targets {
            target.packet_received(&wire, false);
        }
        true
    }
}

/// [`HostDriver`] of one simulated node.
pub struct SimLink {
    bus: Weak<SimBus>,
    phy: usize,
}

impl SimLink {
    fn bus(&self) -> Result<Arc<SimBus>, DriverError> {
        self.bus
            .upgrade()
            .ok_or_else(|| DriverError::Failed("simulated bus is gone".into()))
    }
}

impl HostDriver for SimLink {
    fn transmit_packet(&self, _host: &Host, packet: &Packet) -> bool {
        match self.bus() {
            Ok(bus) => bus.transmit(self.phy, packet),
            Err(_) => false,
        }
    }

    fn devctl(&self, _host: &Host, command: DevCtl) -> Result<u32, DriverError> {
        let bus = self.bus()?;
        match command {
            DevCtl::ResetBus(_) => {
                bus.reset();
                Ok(0)
            }
            DevCtl::GetCycleCounter => Ok(bus.lock().cycle_time),
            DevCtl::SetCycleCounter(value) => {
                bus.lock().cycle_time = value;
                Ok(0)
            }
            DevCtl::SetBusId(_)
            | DevCtl::ActCycleMaster(_)
            | DevCtl::CancelRequests
            | DevCtl::ModifyUsage(_)
            | DevCtl::IsoListenChannel(_)
            | DevCtl::IsoUnlistenChannel(_) => Ok(0),
        }
    }

    fn get_rom(&self, _host: &Host) -> Vec<u8> {
        self.bus()
            .ok()
            .and_then(|bus| bus.lock().nodes.get(self.phy).map(|n| n.spec.rom.clone()))
            .unwrap_or_default()
    }
}
