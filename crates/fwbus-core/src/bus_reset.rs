//! Bus reset and Self-ID phase.

use fwbus_proto::{NodeId, Speed};

use crate::csr::ResetInfo;
use crate::driver::{DevCtl, ResetType};
use crate::host::{BusPhase, Host, Topology};
use crate::topology::{build_speed_map, check_selfids, irm_node, SpeedMap};

impl Host {
    /// Asks the backend for a bus reset. Returns `false` if a reset is already in progress.
    pub fn reset_bus(&self, reset: ResetType) -> bool {
        {
            let mut bus = self.lock_bus();
            if bus.in_bus_reset {
                return false;
            }
            bus.phase = BusPhase::Resetting;
        }
        tracing::debug!(host = %self.id(), ?reset, "requesting bus reset");
        if let Err(err) = self.driver().devctl(self, DevCtl::ResetBus(reset)) {
            tracing::warn!(host = %self.id(), %err, "backend failed to reset the bus");
        }
        true
    }

    pub(crate) fn handle_bus_reset(&self) {
        {
            let mut bus = self.lock_bus();
            if bus.in_bus_reset {
                tracing::info!(host = %self.id(), "bus reset reported while one is already in progress");
                return;
            }
            bus.in_bus_reset = true;
            bus.phase = BusPhase::Collecting;
            bus.selfids.clear();
            bus.is_irm = false;
            bus.is_cycle_master = false;
        }
        self.abort_requests();
    }

    pub(crate) fn handle_selfid(&self, quadlet: u32) {
        let mut bus = self.lock_bus();
        if !bus.in_bus_reset {
            tracing::warn!(
                host = %self.id(),
                selfid = format_args!("{quadlet:#010x}"),
                bus_id = bus.bus_id,
                "spurious Self-ID outside bus reset"
            );
            return;
        }
        if bus.selfids.len() >= self.config().max_selfids {
            tracing::warn!(host = %self.id(), "Self-ID buffer full, dropping quadlet");
            return;
        }
        bus.selfids.push(quadlet);
    }

    pub(crate) fn handle_selfid_complete(&self, phy_id: u8, is_root: bool) {
        let mut bus = self.lock_bus();
        if !bus.in_bus_reset {
            tracing::warn!(host = %self.id(), "Self-ID complete outside bus reset");
            return;
        }
        bus.phase = BusPhase::Validating;
        bus.node_id = NodeId::new(bus.bus_id, phy_id);
        bus.is_root = is_root;

        let selfids = std::mem::take(&mut bus.selfids);
        let (node_count, nodes_active, irm, speed_map) = match check_selfids(&selfids) {
            Ok(summary) => {
                bus.reset_retries = 0;
                let speed_map = build_speed_map(&selfids, summary.node_count);
                (
                    summary.node_count,
                    summary.nodes_active,
                    irm_node(&summary, bus.bus_id),
                    speed_map,
                )
            }
            Err(err) if bus.reset_retries < self.config().max_selfid_retries => {
                bus.reset_retries += 1;
                bus.in_bus_reset = false;
                let retries = bus.reset_retries;
                drop(bus);
                tracing::warn!(host = %self.id(), %err, retries, "error in Self-ID stage, resetting");
                self.reset_bus(ResetType::Long);
                return;
            }
            Err(err) => {
                bus.reset_retries = 0;
                tracing::warn!(
                    host = %self.id(),
                    %err,
                    "stopping out-of-control reset loop; topology and speed map are best effort"
                );
                let node_count = selfids
                    .iter()
                    .filter(|&&q| q >> 30 == 0b10 && q & (1 << 23) == 0)
                    .count();
                (node_count, 0, None, SpeedMap::uniform(node_count, Speed::S100))
            }
        };

        bus.is_irm = irm == Some(bus.node_id);
        bus.is_cycle_master = is_root;
        bus.generation = bus.generation.wrapping_add(1);
        bus.in_bus_reset = false;
        bus.phase = BusPhase::Idle;
        bus.topology = Topology {
            generation: bus.generation,
            node_count,
            nodes_active,
            irm,
            selfids,
            speed_map,
        };

        let node_id = bus.node_id;
        let generation = bus.generation;
        let is_irm = bus.is_irm;
        let topology = bus.topology.clone();
        drop(bus);

        tracing::info!(
            host = %self.id(),
            generation,
            node_id = %node_id,
            node_count,
            is_root,
            is_irm,
            "bus reset complete"
        );

        if is_root {
            if let Err(err) = self.driver().devctl(self, DevCtl::ActCycleMaster(true)) {
                tracing::warn!(host = %self.id(), %err, "backend failed to enable cycle master");
            }
        }

        self.csr().bus_reset(
            self,
            &ResetInfo {
                node_id,
                is_root,
                is_irm,
                node_count,
                selfids: &topology.selfids,
                speed_map: &topology.speed_map,
            },
        );
        self.listeners().host_reset(self);
    }
}
