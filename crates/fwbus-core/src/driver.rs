//! Contract between the core and a link-layer backend.
//!
//! A backend implements [`HostDriver`]. In the other direction it reports hardware events
//! through [`Host`]'s injection methods: [`Host::bus_reset`], [`Host::selfid_received`],
//! [`Host::selfid_complete`], [`Host::packet_sent`] and [`Host::packet_received`].

use std::fmt;

use thiserror::Error;

use crate::host::Host;
use crate::packet::Packet;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResetType {
    /// Long (arbitrated) reset.
    Long,
    /// Short (arbitrated) reset, IEEE 1394a.
    Short,
    /// Long reset that also forces this node to become root.
    LongForceRoot,
    /// Short reset that also forces this node to become root.
    ShortForceRoot,
}

/// Device control commands issued by the core.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DevCtl {
    ResetBus(ResetType),
    /// Returns the current `CYCLE_TIME` register value.
    GetCycleCounter,
    SetCycleCounter(u32),
    SetBusId(u16),
    ActCycleMaster(bool),
    /// Cancel every queued transmission. The core aborts the matching requests itself.
    CancelRequests,
    ModifyUsage(bool),
    IsoListenChannel(u8),
    IsoUnlistenChannel(u8),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DriverError {
    #[error("device control {0:?} is not supported by this backend")]
    Unsupported(DevCtl),

    #[error("device control failed: {0}")]
    Failed(String),
}

/// Index of a lockable bus-management register for [`HostDriver::hw_csr_reg`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CsrLockReg {
    BusManagerId = 0,
    BandwidthAvailable = 1,
    ChannelsAvailableHi = 2,
    ChannelsAvailableLo = 3,
}

impl CsrLockReg {
    pub const fn index(self) -> u8 {
        self as u8
    }
}

impl fmt::Display for CsrLockReg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::BusManagerId => "BUS_MANAGER_ID",
            Self::BandwidthAvailable => "BANDWIDTH_AVAILABLE",
            Self::ChannelsAvailableHi => "CHANNELS_AVAILABLE_HI",
            Self::ChannelsAvailableLo => "CHANNELS_AVAILABLE_LO",
        };
        f.write_str(name)
    }
}

/// Hardware backend for one bus controller.
///
/// The core never holds one of its own locks while calling into the driver, so implementations
/// may call straight back into the host's injection methods.
pub trait HostDriver: Send + Sync {
    /// Queues `packet` for transmission. Returns `false` if the packet could not be queued; no
    /// send outcome is reported for it in that case.
    ///
    /// Every accepted packet must eventually be answered with [`Host::packet_sent`], unless a
    /// bus reset intervenes.
    fn transmit_packet(&self, host: &Host, packet: &Packet) -> bool;

    fn devctl(&self, host: &Host, command: DevCtl) -> Result<u32, DriverError>;

    /// Configuration ROM image served from the `CONFIG_ROM` region.
    fn get_rom(&self, host: &Host) -> Vec<u8>;

    /// Native compare-swap on one of the lockable CSR registers, returning the old value.
    ///
    /// `None` means the backend does not implement the register and the core's emulated copy is
    /// used instead.
    fn hw_csr_reg(&self, _host: &Host, _reg: CsrLockReg, _data: u32, _compare: u32) -> Option<u32> {
        None
    }
}
