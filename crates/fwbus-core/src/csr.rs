//! Emulated CSR register block.
//!
//! The register file, configuration ROM, FCP frames and topology/speed map images are each
//! mapped into the host's router as an independent range at [`CSR_BASE`].

use std::sync::{Arc, Mutex, MutexGuard};

use fwbus_proto::csr::{
    self, crc16, BANDWIDTH_AVAILABLE, BANDWIDTH_AVAILABLE_INITIAL, BROADCAST_CHANNEL,
    BROADCAST_CHANNEL_DEFAULT, BUSY_TIMEOUT, BUS_MANAGER_ID, BUS_MANAGER_ID_NONE, BUS_TIME,
    CHANNELS_AVAILABLE_HI, CHANNELS_AVAILABLE_HI_INITIAL, CHANNELS_AVAILABLE_LO,
    CHANNELS_AVAILABLE_LO_INITIAL, CSR_BASE, CYCLE_TIME, NODE_IDS, RESET_START, SPLIT_TIMEOUT_HI,
    SPLIT_TIMEOUT_HI_MASK, SPLIT_TIMEOUT_LO, SPLIT_TIMEOUT_LO_MASK, STATE_CLEAR, STATE_SET,
};
use fwbus_proto::{ExtCode, NodeId, Rcode};

use crate::config::HostConfig;
use crate::driver::{CsrLockReg, DevCtl};
use crate::error::RegisterError;
use crate::host::Host;
use crate::router::{AddressHandler, AddressOps, AddressRouter};
use crate::topology::SpeedMap;

/// Writable bit of `BROADCAST_CHANNEL`.
const BROADCAST_CHANNEL_VALID: u32 = 1 << 30;
/// `STATE` bits preserved across a bus reset.
const STATE_RESET_KEEP: u32 = 0x300;
/// `STATE.cmstr`.
const STATE_CMSTR: u32 = 0x100;
/// Largest FCP frame.
const FCP_MAX_FRAME: usize = 512;
/// Split timeouts below this floor are raised to it.
pub const MIN_SPLIT_TIMEOUT_NS: u64 = 100_000_000;

const TOPOLOGY_MAP_QUADLETS: usize = 0x400 / 4;
const SPEED_MAP_QUADLETS: usize = 0x1000 / 4;
/// Length field of the speed map header: the generation quadlet plus 63 rows of 64 bytes.
const SPEED_MAP_LENGTH: usize = 0x3f1;
const SPEED_MAP_ROWS: usize = 63;

/// Register values and map images.
#[derive(Debug, Clone)]
pub struct CsrRegisters {
    pub state: u32,
    pub node_ids: u32,
    pub split_timeout_hi: u32,
    pub split_timeout_lo: u32,
    pub cycle_time: u32,
    pub bus_time: u32,
    pub bus_manager_id: u32,
    pub bandwidth_available: u32,
    pub channels_available_hi: u32,
    pub channels_available_lo: u32,
    pub broadcast_channel: u32,
    pub rom: Vec<u8>,
    topology_map: Vec<u32>,
    speed_map: Vec<u32>,
}

impl CsrRegisters {
    fn new(config: &HostConfig) -> Self {
        Self {
            state: 0,
            node_ids: 0,
            split_timeout_hi: config.split_timeout_hi & SPLIT_TIMEOUT_HI_MASK,
            split_timeout_lo: config.split_timeout_lo & SPLIT_TIMEOUT_LO_MASK,
            cycle_time: 0,
            bus_time: 0,
            bus_manager_id: BUS_MANAGER_ID_NONE,
            bandwidth_available: BANDWIDTH_AVAILABLE_INITIAL,
            channels_available_hi: CHANNELS_AVAILABLE_HI_INITIAL,
            channels_available_lo: CHANNELS_AVAILABLE_LO_INITIAL,
            broadcast_channel: BROADCAST_CHANNEL_DEFAULT,
            rom: Vec::new(),
            topology_map: vec![0; TOPOLOGY_MAP_QUADLETS],
            speed_map: vec![0; SPEED_MAP_QUADLETS],
        }
    }

    /// Transaction timeout derived from the split-timeout registers.
    pub fn split_timeout_ns(&self) -> u64 {
        csr::split_timeout_ns(self.split_timeout_hi, self.split_timeout_lo).max(MIN_SPLIT_TIMEOUT_NS)
    }

    pub fn topology_map(&self) -> &[u32] {
        &self.topology_map
    }

    pub fn speed_map(&self) -> &[u32] {
        &self.speed_map
    }

    /// Folds a fresh cycle counter sample in, carrying a seconds rollover into `bus_time`.
    fn sample_cycle_time(&mut self, cycle_time: u32) {
        if cycle_time < self.cycle_time {
            self.bus_time = self.bus_time.wrapping_add(1 << 7);
        }
        self.cycle_time = cycle_time;
    }

    fn rebuild_topology_map(&mut self, node_count: usize, selfids: &[u32]) {
        let count = selfids.len().min(TOPOLOGY_MAP_QUADLETS - 3);
        let generation = self.topology_map[1].wrapping_add(1);
        self.topology_map.fill(0);
        self.topology_map[1] = generation;
        self.topology_map[2] = ((node_count as u32) << 16) | count as u32;
        self.topology_map[3..3 + count].copy_from_slice(&selfids[..count]);
        let crc = crc16(&self.topology_map[1..count + 3]);
        self.topology_map[0] = (((count + 2) as u32) << 16) | u32::from(crc);
    }

    fn rebuild_speed_map(&mut self, speeds: &SpeedMap) {
        let generation = self.speed_map[1].wrapping_add(1);
        self.speed_map.fill(0);
        self.speed_map[1] = generation;
        let bytes = speeds.to_csr_bytes(SPEED_MAP_ROWS);
        for (slot, chunk) in self.speed_map[2..].iter_mut().zip(bytes.chunks_exact(4)) {
            *slot = u32::from_be_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
        }
        let crc = crc16(&self.speed_map[1..1 + SPEED_MAP_LENGTH]);
        self.speed_map[0] = ((SPEED_MAP_LENGTH as u32) << 16) | u32::from(crc);
    }
}

/// What a completed bus reset tells the CSR block.
pub(crate) struct ResetInfo<'a> {
    pub node_id: NodeId,
    pub is_root: bool,
    pub is_irm: bool,
    pub node_count: usize,
    pub selfids: &'a [u32],
    pub speed_map: &'a SpeedMap,
}

pub struct CsrBlock {
    regs: Mutex<CsrRegisters>,
}

impl CsrBlock {
    pub(crate) fn new(config: &HostConfig) -> Self {
        Self {
            regs: Mutex::new(CsrRegisters::new(config)),
        }
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, CsrRegisters> {
        self.regs
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Copy of the current register values.
    pub fn snapshot(&self) -> CsrRegisters {
        self.lock().clone()
    }

    pub fn split_timeout_ns(&self) -> u64 {
        self.lock().split_timeout_ns()
    }

    /// Loads the ROM and maps every region.
    pub(crate) fn init(&self, host: &Host, router: &AddressRouter) -> Result<(), RegisterError> {
        let rom = host.driver().get_rom(host);
        self.lock().rom = rom;

        let regions: [(std::ops::Range<u64>, Arc<dyn AddressHandler>); 6] = [
            (csr::REGISTERS, Arc::new(RegisterFile)),
            (csr::CONFIG_ROM, Arc::new(ConfigRom)),
            (csr::FCP_COMMAND, Arc::new(Fcp { response: false })),
            (csr::FCP_RESPONSE, Arc::new(Fcp { response: true })),
            (csr::TOPOLOGY_MAP, Arc::new(MapImage::Topology)),
            (csr::SPEED_MAP, Arc::new(MapImage::Speed)),
        ];
        for (range, handler) in regions {
            router.register(CSR_BASE + range.start, CSR_BASE + range.end, None, handler)?;
        }
        Ok(())
    }

    /// Resets the bus-management registers and rebuilds the map images.
    pub(crate) fn bus_reset(&self, host: &Host, info: &ResetInfo<'_>) {
        {
            let mut regs = self.lock();
            regs.state &= STATE_RESET_KEEP;
            if !info.is_root {
                regs.state &= !STATE_CMSTR;
            }
            regs.bus_manager_id = BUS_MANAGER_ID_NONE;
            regs.bandwidth_available = BANDWIDTH_AVAILABLE_INITIAL;
            regs.channels_available_hi = CHANNELS_AVAILABLE_HI_INITIAL;
            regs.channels_available_lo = CHANNELS_AVAILABLE_LO_INITIAL;
            regs.broadcast_channel = BROADCAST_CHANNEL_DEFAULT;
            regs.node_ids = u32::from(info.node_id.raw()) << 16;
            regs.rebuild_topology_map(info.node_count, info.selfids);
            regs.rebuild_speed_map(info.speed_map);
        }

        if info.is_irm {
            host.driver().hw_csr_reg(
                host,
                CsrLockReg::ChannelsAvailableHi,
                CHANNELS_AVAILABLE_HI_INITIAL,
                CHANNELS_AVAILABLE_LO_INITIAL,
            );
        }
    }

    fn sample_cycle_time(&self, host: &Host) -> Result<(u32, u32), Rcode> {
        let cycle_time = host
            .driver()
            .devctl(host, DevCtl::GetCycleCounter)
            .map_err(|err| {
                tracing::warn!(%err, "cycle counter unavailable");
                Rcode::DataError
            })?;
        let mut regs = self.lock();
        regs.sample_cycle_time(cycle_time);
        Ok((regs.cycle_time, regs.bus_time))
    }

    fn compare_swap(&self, host: &Host, reg: CsrLockReg, data: u32, compare: u32) -> u32 {
        if let Some(old) = host.driver().hw_csr_reg(host, reg, data, compare) {
            return old;
        }
        let mut regs = self.lock();
        let slot = match reg {
            CsrLockReg::BusManagerId => &mut regs.bus_manager_id,
            CsrLockReg::BandwidthAvailable => &mut regs.bandwidth_available,
            CsrLockReg::ChannelsAvailableHi => &mut regs.channels_available_hi,
            CsrLockReg::ChannelsAvailableLo => &mut regs.channels_available_lo,
        };
        let old = *slot;
        if old == compare {
            *slot = data;
        }
        old
    }

    /// Reads one lockable register; the driver's copy wins when it has one.
    fn read_lockable(&self, host: &Host, reg: CsrLockReg) -> u32 {
        if let Some(value) = host.driver().hw_csr_reg(host, reg, 0, 0) {
            return value;
        }
        let regs = self.lock();
        match reg {
            CsrLockReg::BusManagerId => regs.bus_manager_id,
            CsrLockReg::BandwidthAvailable => regs.bandwidth_available,
            CsrLockReg::ChannelsAvailableHi => regs.channels_available_hi,
            CsrLockReg::ChannelsAvailableLo => regs.channels_available_lo,
        }
    }

    fn read_register(&self, host: &Host, offset: u64) -> Result<u32, Rcode> {
        match offset {
            STATE_CLEAR | STATE_SET => Ok(self.lock().state),
            NODE_IDS => Ok(self.lock().node_ids),
            SPLIT_TIMEOUT_HI => Ok(self.lock().split_timeout_hi),
            SPLIT_TIMEOUT_LO => Ok(self.lock().split_timeout_lo),
            CYCLE_TIME => self.sample_cycle_time(host).map(|(cycle, _)| cycle),
            BUS_TIME => self
                .sample_cycle_time(host)
                .map(|(cycle, bus)| bus | (cycle >> 25)),
            BUS_MANAGER_ID => Ok(self.read_lockable(host, CsrLockReg::BusManagerId)),
            BANDWIDTH_AVAILABLE => Ok(self.read_lockable(host, CsrLockReg::BandwidthAvailable)),
            CHANNELS_AVAILABLE_HI => Ok(self.read_lockable(host, CsrLockReg::ChannelsAvailableHi)),
            CHANNELS_AVAILABLE_LO => Ok(self.read_lockable(host, CsrLockReg::ChannelsAvailableLo)),
            BROADCAST_CHANNEL => Ok(self.lock().broadcast_channel),
            // RESET_START is write-only; INDIRECT_ADDRESS/INDIRECT_DATA are not implemented.
            RESET_START | 0x010 | 0x014 => Err(Rcode::TypeError),
            _ => Err(Rcode::AddressError),
        }
    }

    fn write_register(&self, host: &Host, offset: u64, value: u32) -> Rcode {
        match offset {
            STATE_CLEAR => self.lock().state &= !value,
            STATE_SET => self.lock().state |= value,
            NODE_IDS => {
                let bus = (value >> 22) as u16;
                host.set_bus_id(bus);
                if let Err(err) = host.driver().devctl(host, DevCtl::SetBusId(bus)) {
                    tracing::warn!(%err, bus, "backend refused bus id");
                }
            }
            RESET_START => {}
            SPLIT_TIMEOUT_HI => self.lock().split_timeout_hi = value & SPLIT_TIMEOUT_HI_MASK,
            SPLIT_TIMEOUT_LO => self.lock().split_timeout_lo = value & SPLIT_TIMEOUT_LO_MASK,
            CYCLE_TIME => {
                self.lock().cycle_time = value;
                if let Err(err) = host.driver().devctl(host, DevCtl::SetCycleCounter(value)) {
                    tracing::warn!(%err, "backend refused cycle counter");
                }
            }
            BUS_TIME => self.lock().bus_time = value & 0xffff_ff80,
            BUS_MANAGER_ID | BANDWIDTH_AVAILABLE | CHANNELS_AVAILABLE_HI | CHANNELS_AVAILABLE_LO => {
                return Rcode::TypeError;
            }
            BROADCAST_CHANNEL => {
                let mut regs = self.lock();
                regs.broadcast_channel = (regs.broadcast_channel & !BROADCAST_CHANNEL_VALID)
                    | (value & BROADCAST_CHANNEL_VALID);
            }
            0x010 | 0x014 => return Rcode::TypeError,
            BUSY_TIMEOUT => return Rcode::AddressError,
            _ => return Rcode::AddressError,
        }
        Rcode::Complete
    }
}

fn lock_reg(offset: u64) -> Option<CsrLockReg> {
    match offset {
        BUS_MANAGER_ID => Some(CsrLockReg::BusManagerId),
        BANDWIDTH_AVAILABLE => Some(CsrLockReg::BandwidthAvailable),
        CHANNELS_AVAILABLE_HI => Some(CsrLockReg::ChannelsAvailableHi),
        CHANNELS_AVAILABLE_LO => Some(CsrLockReg::ChannelsAvailableLo),
        _ => None,
    }
}

fn is_known_register(offset: u64) -> bool {
    matches!(
        offset,
        STATE_CLEAR
            | STATE_SET
            | NODE_IDS
            | RESET_START
            | SPLIT_TIMEOUT_HI
            | SPLIT_TIMEOUT_LO
            | CYCLE_TIME
            | BUS_TIME
            | BROADCAST_CHANNEL
    )
}

/// `STATE_CLEAR` through `BROADCAST_CHANNEL`.
struct RegisterFile;

impl AddressHandler for RegisterFile {
    fn ops(&self) -> AddressOps {
        AddressOps::READ | AddressOps::WRITE | AddressOps::LOCK | AddressOps::LOCK64
    }

    fn read(&self, host: &Host, _source: NodeId, buf: &mut [u8], addr: u64) -> Rcode {
        if (addr | buf.len() as u64) & 3 != 0 {
            return Rcode::TypeError;
        }
        let base = addr - CSR_BASE;
        for (i, chunk) in buf.chunks_exact_mut(4).enumerate() {
            match host.csr().read_register(host, base + 4 * i as u64) {
                Ok(value) => chunk.copy_from_slice(&value.to_be_bytes()),
                Err(rcode) => return rcode,
            }
        }
        Rcode::Complete
    }

    fn write(
        &self,
        host: &Host,
        _source: NodeId,
        _destination: NodeId,
        data: &[u8],
        addr: u64,
    ) -> Rcode {
        if (addr | data.len() as u64) & 3 != 0 {
            return Rcode::TypeError;
        }
        let base = addr - CSR_BASE;
        for (i, chunk) in data.chunks_exact(4).enumerate() {
            let value = u32::from_be_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
            let rcode = host.csr().write_register(host, base + 4 * i as u64, value);
            if !rcode.is_complete() {
                return rcode;
            }
        }
        Rcode::Complete
    }

    fn lock(
        &self,
        host: &Host,
        _source: NodeId,
        addr: u64,
        ext: ExtCode,
        data: u32,
        arg: u32,
    ) -> Result<u32, Rcode> {
        let offset = addr - CSR_BASE;
        if offset & 3 != 0 {
            return Err(Rcode::TypeError);
        }
        match lock_reg(offset) {
            Some(reg) if ext == ExtCode::CompareSwap => {
                Ok(host.csr().compare_swap(host, reg, data, arg))
            }
            Some(_) => Err(Rcode::TypeError),
            None if is_known_register(offset) => Err(Rcode::TypeError),
            None => Err(Rcode::AddressError),
        }
    }

    /// 64-bit compare-swap across `CHANNELS_AVAILABLE_HI:LO`.
    fn lock64(
        &self,
        host: &Host,
        _source: NodeId,
        addr: u64,
        ext: ExtCode,
        data: u64,
        arg: u64,
    ) -> Result<u64, Rcode> {
        if ext != ExtCode::CompareSwap || addr - CSR_BASE != CHANNELS_AVAILABLE_HI {
            return Err(Rcode::TypeError);
        }
        let csr = host.csr();
        let driver = host.driver();
        let (data_hi, data_lo) = ((data >> 32) as u32, data as u32);
        let (arg_hi, arg_lo) = ((arg >> 32) as u32, arg as u32);
        if let Some(old_hi) = driver.hw_csr_reg(host, CsrLockReg::ChannelsAvailableHi, data_hi, arg_hi) {
            let old_lo = driver
                .hw_csr_reg(host, CsrLockReg::ChannelsAvailableLo, data_lo, arg_lo)
                .unwrap_or(0);
            return Ok((u64::from(old_hi) << 32) | u64::from(old_lo));
        }

        let mut regs = csr.lock();
        let old = (u64::from(regs.channels_available_hi) << 32) | u64::from(regs.channels_available_lo);
        if old == arg {
            regs.channels_available_hi = data_hi;
            regs.channels_available_lo = data_lo;
        }
        Ok(old)
    }
}

struct ConfigRom;

impl AddressHandler for ConfigRom {
    fn ops(&self) -> AddressOps {
        AddressOps::READ
    }

    fn read(&self, host: &Host, _source: NodeId, buf: &mut [u8], addr: u64) -> Rcode {
        if (addr | buf.len() as u64) & 3 != 0 {
            return Rcode::TypeError;
        }
        let offset = (addr - CSR_BASE - csr::CONFIG_ROM.start) as usize;
        let regs = host.csr().lock();
        match regs.rom.get(offset..offset + buf.len()) {
            Some(bytes) => {
                buf.copy_from_slice(bytes);
                Rcode::Complete
            }
            None => Rcode::AddressError,
        }
    }
}

/// FCP command or response register.
struct Fcp {
    response: bool,
}

impl AddressHandler for Fcp {
    fn ops(&self) -> AddressOps {
        AddressOps::WRITE
    }

    fn write(
        &self,
        host: &Host,
        source: NodeId,
        _destination: NodeId,
        data: &[u8],
        addr: u64,
    ) -> Rcode {
        let region = if self.response {
            csr::FCP_RESPONSE
        } else {
            csr::FCP_COMMAND
        };
        if data.len() > FCP_MAX_FRAME || addr != CSR_BASE + region.start {
            return Rcode::TypeError;
        }
        host.listeners().fcp_request(host, source, self.response, data);
        Rcode::Complete
    }
}

enum MapImage {
    Topology,
    Speed,
}

impl AddressHandler for MapImage {
    fn ops(&self) -> AddressOps {
        AddressOps::READ
    }

    fn read(&self, host: &Host, _source: NodeId, buf: &mut [u8], addr: u64) -> Rcode {
        if (addr | buf.len() as u64) & 3 != 0 {
            return Rcode::TypeError;
        }
        let regs = host.csr().lock();
        let (image, region) = match self {
            Self::Topology => (regs.topology_map(), csr::TOPOLOGY_MAP),
            Self::Speed => (regs.speed_map(), csr::SPEED_MAP),
        };
        let first = ((addr - CSR_BASE - region.start) / 4) as usize;
        for (chunk, quadlet) in buf.chunks_exact_mut(4).zip(&image[first..]) {
            chunk.copy_from_slice(&quadlet.to_be_bytes());
        }
        Rcode::Complete
    }
}
