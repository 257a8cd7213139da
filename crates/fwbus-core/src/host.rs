//! Per-controller host state and the backend event entry points.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use fwbus_proto::selfid::verify_pair;
use fwbus_proto::{AckCode, NodeId};

use crate::clock::HostClock;
use crate::config::HostConfig;
use crate::csr::CsrBlock;
use crate::driver::{DevCtl, HostDriver};
use crate::error::HostError;
use crate::events::{EventQueue, HostEvent};
use crate::packet::PacketId;
use crate::registry::{HostId, ListenerSet};
use crate::router::AddressRouter;
use crate::timer::SweepTimer;
use crate::tlabel::TlabelPool;
use crate::topology::SpeedMap;
use crate::transaction::TransactionTable;

/// Where the host is in the bus-reset cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BusPhase {
    /// Topology published; transactions allowed.
    Idle,
    /// A reset was requested from the backend but has not started.
    Resetting,
    /// Bus reset in progress, collecting Self-ID quadlets.
    Collecting,
    /// Self-ID stream complete, being validated.
    Validating,
}

/// Node id and generation captured under one lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeSnapshot {
    pub node_id: NodeId,
    pub generation: u32,
    pub in_bus_reset: bool,
}

/// Role flags after the last completed reset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Roles {
    pub is_root: bool,
    pub is_irm: bool,
    pub is_cycle_master: bool,
    pub is_bus_manager: bool,
}

/// Topology published by the last completed reset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Topology {
    pub generation: u32,
    pub node_count: usize,
    pub nodes_active: usize,
    pub irm: Option<NodeId>,
    pub selfids: Vec<u32>,
    pub speed_map: SpeedMap,
}

pub(crate) struct BusState {
    pub bus_id: u16,
    pub node_id: NodeId,
    pub generation: u32,
    pub in_bus_reset: bool,
    pub phase: BusPhase,
    /// Self-IDs collected during the current reset.
    pub selfids: Vec<u32>,
    pub reset_retries: u32,
    pub is_root: bool,
    pub is_irm: bool,
    pub is_cycle_master: bool,
    pub topology: Topology,
}

impl BusState {
    fn new(config: &HostConfig) -> Self {
        Self {
            bus_id: config.local_bus,
            node_id: NodeId::new(config.local_bus, 0),
            generation: 0,
            in_bus_reset: false,
            phase: BusPhase::Idle,
            selfids: Vec::new(),
            reset_retries: 0,
            is_root: false,
            is_irm: false,
            is_cycle_master: false,
            topology: Topology {
                generation: 0,
                node_count: 0,
                nodes_active: 0,
                irm: None,
                selfids: Vec::new(),
                speed_map: SpeedMap::empty(),
            },
        }
    }
}

/// One bus controller as seen by the core.
pub struct Host {
    this: Weak<Host>,
    id: HostId,
    config: HostConfig,
    driver: Arc<dyn HostDriver>,
    clock: Arc<dyn HostClock>,
    listeners: Arc<ListenerSet>,
    pub(crate) bus: Mutex<BusState>,
    pub(crate) tlabels: Arc<TlabelPool>,
    pub(crate) transactions: Mutex<TransactionTable>,
    router: AddressRouter,
    csr: CsrBlock,
    events: EventQueue,
    next_packet_id: AtomicU64,
    iso_listeners: Mutex<[u32; 64]>,
    shutdown: AtomicBool,
    sweep: SweepTimer,
}

impl Host {
    pub(crate) fn new(
        this: Weak<Host>,
        id: HostId,
        config: HostConfig,
        driver: Arc<dyn HostDriver>,
        clock: Arc<dyn HostClock>,
        listeners: Arc<ListenerSet>,
    ) -> Self {
        Self {
            this,
            id,
            bus: Mutex::new(BusState::new(&config)),
            csr: CsrBlock::new(&config),
            config,
            driver,
            clock,
            listeners,
            tlabels: TlabelPool::new(),
            transactions: Mutex::new(TransactionTable::default()),
            router: AddressRouter::new(),
            events: EventQueue::default(),
            next_packet_id: AtomicU64::new(1),
            iso_listeners: Mutex::new([0; 64]),
            shutdown: AtomicBool::new(false),
            sweep: SweepTimer::new(),
        }
    }

    pub fn id(&self) -> HostId {
        self.id
    }

    pub fn config(&self) -> &HostConfig {
        &self.config
    }

    pub fn driver(&self) -> &dyn HostDriver {
        self.driver.as_ref()
    }

    pub(crate) fn clock(&self) -> &dyn HostClock {
        self.clock.as_ref()
    }

    /// Makes sure a timeout sweep runs once the clock reaches `deadline_ns`.
    pub(crate) fn schedule_sweep(&self, deadline_ns: u64) {
        self.sweep.arm(&self.this, &self.clock, deadline_ns);
    }

    pub(crate) fn listeners(&self) -> &ListenerSet {
        &self.listeners
    }

    pub fn router(&self) -> &AddressRouter {
        &self.router
    }

    pub fn csr(&self) -> &CsrBlock {
        &self.csr
    }

    pub fn tlabels(&self) -> &Arc<TlabelPool> {
        &self.tlabels
    }

    pub(crate) fn lock_bus(&self) -> MutexGuard<'_, BusState> {
        self.bus
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub(crate) fn next_packet_id(&self) -> PacketId {
        PacketId(self.next_packet_id.fetch_add(1, Ordering::Relaxed))
    }

    pub(crate) fn init_csr(&self) -> Result<(), HostError> {
        self.csr.init(self, &self.router)?;
        Ok(())
    }

    /// Node id, generation and reset flag read atomically. Anything that builds a packet from
    /// the node id must carry this generation along with it.
    pub fn node_snapshot(&self) -> NodeSnapshot {
        let bus = self.lock_bus();
        NodeSnapshot {
            node_id: bus.node_id,
            generation: bus.generation,
            in_bus_reset: bus.in_bus_reset,
        }
    }

    pub fn generation(&self) -> u32 {
        self.lock_bus().generation
    }

    pub fn node_id(&self) -> NodeId {
        self.lock_bus().node_id
    }

    pub fn in_bus_reset(&self) -> bool {
        self.lock_bus().in_bus_reset
    }

    pub fn phase(&self) -> BusPhase {
        self.lock_bus().phase
    }

    pub fn roles(&self) -> Roles {
        let (node_id, mut roles) = {
            let bus = self.lock_bus();
            let roles = Roles {
                is_root: bus.is_root,
                is_irm: bus.is_irm,
                is_cycle_master: bus.is_cycle_master,
                is_bus_manager: false,
            };
            (bus.node_id, roles)
        };
        roles.is_bus_manager = self.csr.lock().bus_manager_id == u32::from(node_id.phy());
        roles
    }

    pub fn topology(&self) -> Topology {
        self.lock_bus().topology.clone()
    }

    pub(crate) fn set_bus_id(&self, bus_id: u16) {
        let mut bus = self.lock_bus();
        bus.bus_id = bus_id & NodeId::BUS_MASK;
        bus.node_id = bus.node_id.with_bus(bus.bus_id);
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    pub(crate) fn mark_shutdown(&self) {
        self.shutdown.store(true, Ordering::Release);
        self.sweep.stop();
    }

    /// Starts listening on an isochronous channel; the backend is told on the first listener.
    pub fn listen_channel(&self, channel: u8) -> Result<(), HostError> {
        if channel > 63 {
            return Err(HostError::InvalidChannel(channel));
        }
        let first = {
            let mut counts = self
                .iso_listeners
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            counts[usize::from(channel)] += 1;
            counts[usize::from(channel)] == 1
        };
        if first {
            self.driver
                .devctl(self, DevCtl::IsoListenChannel(channel))
                .map_err(HostError::Driver)?;
        }
        Ok(())
    }

    /// Drops one listener of `channel`; the backend is told when the last one leaves.
    pub fn unlisten_channel(&self, channel: u8) -> Result<(), HostError> {
        if channel > 63 {
            return Err(HostError::InvalidChannel(channel));
        }
        let last = {
            let mut counts = self
                .iso_listeners
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            let count = &mut counts[usize::from(channel)];
            if *count == 0 {
                tracing::warn!(channel, "unlisten on a channel nobody listens to");
                return Ok(());
            }
            *count -= 1;
            *count == 0
        };
        if last {
            self.driver
                .devctl(self, DevCtl::IsoUnlistenChannel(channel))
                .map_err(HostError::Driver)?;
        }
        Ok(())
    }

    pub fn channel_listeners(&self, channel: u8) -> u32 {
        self.iso_listeners
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(usize::from(channel))
            .copied()
            .unwrap_or(0)
    }

    fn post(&self, event: HostEvent) {
        self.events.push(event, |event| self.handle_event(event));
    }

    fn handle_event(&self, event: HostEvent) {
        match event {
            HostEvent::BusReset => self.handle_bus_reset(),
            HostEvent::SelfId(quadlet) => self.handle_selfid(quadlet),
            HostEvent::SelfIdComplete { phy_id, is_root } => {
                self.handle_selfid_complete(phy_id, is_root)
            }
            HostEvent::PacketSent { id, ack } => self.handle_packet_sent(id, ack),
            HostEvent::PacketReceived { data, write_acked } => {
                self.handle_packet_received(&data, write_acked)
            }
            HostEvent::TimeoutTick => self.abort_timedouts(),
        }
    }

    /// Backend: a bus reset has started.
    pub fn bus_reset(&self) {
        self.post(HostEvent::BusReset);
    }

    /// Backend: one Self-ID quadlet was received.
    pub fn selfid_received(&self, quadlet: u32) {
        self.post(HostEvent::SelfId(quadlet));
    }

    /// Backend: a Self-ID quadlet and its check quadlet. Pairs that are not complements of each
    /// other are dropped.
    pub fn selfid_received_pair(&self, quadlet: u32, check: u32) {
        if !verify_pair(quadlet, check) {
            tracing::warn!(
                selfid = format_args!("{quadlet:#010x}"),
                check = format_args!("{check:#010x}"),
                "dropping Self-ID that fails its complement check"
            );
            return;
        }
        self.selfid_received(quadlet);
    }

    /// Backend: the Self-ID phase finished; `phy_id` is this node's physical id.
    pub fn selfid_complete(&self, phy_id: u8, is_root: bool) {
        self.post(HostEvent::SelfIdComplete { phy_id, is_root });
    }

    /// Backend: final send outcome of a packet it accepted through `transmit_packet`.
    pub fn packet_sent(&self, id: PacketId, ack: AckCode) {
        self.post(HostEvent::PacketSent { id, ack });
    }

    /// Backend: a packet arrived, in wire order. `write_acked` is set when the link already
    /// answered a write request with ack_complete, so no response must be sent.
    pub fn packet_received(&self, data: &[u8], write_acked: bool) {
        self.post(HostEvent::PacketReceived {
            data: data.to_vec(),
            write_acked,
        });
    }

    /// Runs a split-timeout sweep over pending requests. Hosts on a clock that advances on its
    /// own schedule these sweeps themselves.
    pub fn poll_timeouts(&self) {
        self.post(HostEvent::TimeoutTick);
    }
}

impl std::fmt::Debug for Host {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let snapshot = self.node_snapshot();
        f.debug_struct("Host")
            .field("id", &self.id)
            .field("node_id", &snapshot.node_id)
            .field("generation", &snapshot.generation)
            .field("in_bus_reset", &snapshot.in_bus_reset)
            .finish()
    }
}
