#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use fwbus_core::proto::header::encode_packet;
use fwbus_core::proto::selfid::BaseSelfId;
use fwbus_core::proto::{AsyncHeader, NodeId, PortState, Speed, Tcode};
use fwbus_core::{
    CsrLockReg, DevCtl, DriverError, FakeHostClock, Host, HostConfig, HostDriver, HostRegistry,
    Packet, PacketId,
};

/// What the backend was handed for one packet.
#[derive(Debug, Clone)]
pub struct SentPacket {
    pub id: PacketId,
    pub tcode: Option<Tcode>,
    pub destination: NodeId,
    pub tlabel: Option<u8>,
    pub generation: u32,
    pub speed: Speed,
    pub wire: Vec<u8>,
}

/// Backend that records everything and never reports send outcomes on its own.
pub struct RecordingDriver {
    pub sent: Mutex<Vec<SentPacket>>,
    pub devctls: Mutex<Vec<DevCtl>>,
    pub rom: Vec<u8>,
    pub accept: AtomicBool,
    pub cycle_time: AtomicU32,
    /// Emulated hardware lock registers, when set.
    pub hw_csr: Option<Mutex<[u32; 4]>>,
}

impl RecordingDriver {
    pub fn new() -> Self {
        Self {
            sent: Mutex::new(Vec::new()),
            devctls: Mutex::new(Vec::new()),
            rom: (0u8..32).collect(),
            accept: AtomicBool::new(true),
            cycle_time: AtomicU32::new(0),
            hw_csr: None,
        }
    }

    pub fn with_hw_csr(initial: [u32; 4]) -> Self {
        Self {
            hw_csr: Some(Mutex::new(initial)),
            ..Self::new()
        }
    }

    pub fn sent(&self) -> Vec<SentPacket> {
        self.sent.lock().unwrap().clone()
    }

    pub fn last_sent(&self) -> SentPacket {
        self.sent.lock().unwrap().last().cloned().expect("nothing sent")
    }

    pub fn take_sent(&self) -> Vec<SentPacket> {
        std::mem::take(&mut *self.sent.lock().unwrap())
    }

    pub fn devctls(&self) -> Vec<DevCtl> {
        self.devctls.lock().unwrap().clone()
    }

    pub fn count_devctl(&self, command: DevCtl) -> usize {
        self.devctls.lock().unwrap().iter().filter(|&&c| c == command).count()
    }
}

impl HostDriver for RecordingDriver {
    fn transmit_packet(&self, _host: &Host, packet: &Packet) -> bool {
        if !self.accept.load(Ordering::SeqCst) {
            return false;
        }
        self.sent.lock().unwrap().push(SentPacket {
            id: packet.id(),
            tcode: packet.tcode(),
            destination: packet.destination(),
            tlabel: packet.tlabel(),
            generation: packet.generation(),
            speed: packet.speed(),
            wire: packet.to_wire(),
        });
        true
    }

    fn devctl(&self, _host: &Host, command: DevCtl) -> Result<u32, DriverError> {
        self.devctls.lock().unwrap().push(command);
        match command {
            DevCtl::GetCycleCounter => Ok(self.cycle_time.load(Ordering::SeqCst)),
            _ => Ok(0),
        }
    }

    fn get_rom(&self, _host: &Host) -> Vec<u8> {
        self.rom.clone()
    }

    fn hw_csr_reg(&self, _host: &Host, reg: CsrLockReg, data: u32, compare: u32) -> Option<u32> {
        let regs = self.hw_csr.as_ref()?;
        let mut regs = regs.lock().unwrap();
        let slot = &mut regs[usize::from(reg.index())];
        let old = *slot;
        if old == compare {
            *slot = data;
        }
        Some(old)
    }
}

/// Linear chain of `count` nodes: node `n` hangs off `n + 1` and the last node is root.
/// Only the root is a contender.
pub fn chain_selfids(count: u8, speed: Speed) -> Vec<u32> {
    (0..count)
        .map(|phy| {
            let mut ports = [PortState::NotConnected; 3];
            if phy > 0 {
                ports[0] = PortState::Child;
            }
            if phy + 1 < count {
                ports[1] = PortState::Parent;
            }
            BaseSelfId {
                phy_id: phy,
                link_active: true,
                gap_count: 0x3f,
                speed,
                contender: phy + 1 == count,
                ports,
                ..BaseSelfId::default()
            }
            .encode()
        })
        .collect()
}

/// Drives one complete bus reset through the injection API.
pub fn complete_reset(host: &Host, selfids: &[u32], phy_id: u8) {
    host.bus_reset();
    for &quadlet in selfids {
        host.selfid_received(quadlet);
    }
    let is_root = usize::from(phy_id) + 1 == selfids.len();
    host.selfid_complete(phy_id, is_root);
}

/// Routes `tracing` output through the test harness; set `RUST_LOG` to see it.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub struct Harness {
    pub registry: HostRegistry,
    pub clock: Arc<FakeHostClock>,
    pub driver: Arc<RecordingDriver>,
    pub host: Arc<Host>,
}

impl Harness {
    /// Host at phy 0 of a `nodes`-node chain, one reset completed.
    pub fn new(nodes: u8) -> Self {
        Self::with(RecordingDriver::new(), HostConfig::default(), nodes)
    }

    pub fn with(driver: RecordingDriver, config: HostConfig, nodes: u8) -> Self {
        init_tracing();
        let clock = Arc::new(FakeHostClock::new(1_000));
        let registry = HostRegistry::with_clock(clock.clone());
        let driver = Arc::new(driver);
        let host = registry.add_host(driver.clone(), config).unwrap();
        complete_reset(&host, &chain_selfids(nodes, Speed::S400), 0);
        Self {
            registry,
            clock,
            driver,
            host,
        }
    }
}

/// Wire bytes of a response from `source` to `destination` with the given header fields.
pub fn response_wire(header: AsyncHeader, data: &[u8]) -> Vec<u8> {
    encode_packet(&header, data)
}
