//! Standard CSR register offsets (IEEE 1212 / IEEE 1394 serial bus registers).
//!
//! Offsets are relative to [`CSR_BASE`].

use core::ops::Range;

/// Start of initial register space in the 48-bit node address space.
pub const CSR_BASE: u64 = 0xffff_f000_0000;

pub const STATE_CLEAR: u64 = 0x000;
pub const STATE_SET: u64 = 0x004;
pub const NODE_IDS: u64 = 0x008;
pub const RESET_START: u64 = 0x00c;
pub const SPLIT_TIMEOUT_HI: u64 = 0x018;
pub const SPLIT_TIMEOUT_LO: u64 = 0x01c;
pub const CYCLE_TIME: u64 = 0x200;
pub const BUS_TIME: u64 = 0x204;
pub const BUSY_TIMEOUT: u64 = 0x210;
pub const BUS_MANAGER_ID: u64 = 0x21c;
pub const BANDWIDTH_AVAILABLE: u64 = 0x220;
pub const CHANNELS_AVAILABLE_HI: u64 = 0x224;
pub const CHANNELS_AVAILABLE_LO: u64 = 0x228;
pub const BROADCAST_CHANNEL: u64 = 0x234;

/// Register file covering `STATE_CLEAR` through `BROADCAST_CHANNEL`.
pub const REGISTERS: Range<u64> = 0x000..0x400;
pub const CONFIG_ROM: Range<u64> = 0x400..0x800;
pub const FCP_COMMAND: Range<u64> = 0xb00..0xd00;
pub const FCP_RESPONSE: Range<u64> = 0xd00..0xf00;
pub const TOPOLOGY_MAP: Range<u64> = 0x1000..0x1400;
pub const SPEED_MAP: Range<u64> = 0x2000..0x3000;

/// Reset value of `BUS_MANAGER_ID`: no bus manager.
pub const BUS_MANAGER_ID_NONE: u32 = 0x3f;
/// Reset value of `BANDWIDTH_AVAILABLE` in allocation units.
pub const BANDWIDTH_AVAILABLE_INITIAL: u32 = 4915;
/// Reset value of `CHANNELS_AVAILABLE_HI`; channel 31 is kept for the broadcast channel.
pub const CHANNELS_AVAILABLE_HI_INITIAL: u32 = 0xffff_fffe;
pub const CHANNELS_AVAILABLE_LO_INITIAL: u32 = 0xffff_ffff;
/// `BROADCAST_CHANNEL` value: valid bit plus channel 31.
pub const BROADCAST_CHANNEL_DEFAULT: u32 = (1 << 31) | 31;

/// Bits of `SPLIT_TIMEOUT_HI` that are implemented (whole seconds).
pub const SPLIT_TIMEOUT_HI_MASK: u32 = 0x0000_0007;
/// Bits of `SPLIT_TIMEOUT_LO` that are implemented (cycle count in bits 31..19).
pub const SPLIT_TIMEOUT_LO_MASK: u32 = 0xfff8_0000;
/// Default split timeout: 800 cycles = 100 ms.
pub const SPLIT_TIMEOUT_LO_DEFAULT: u32 = 800 << 19;

/// Nanoseconds per isochronous cycle (125 µs).
pub const CYCLE_NS: u64 = 125_000;
/// Cycles per second.
pub const CYCLES_PER_SECOND: u64 = 8000;

/// Converts the split-timeout register pair to nanoseconds.
pub fn split_timeout_ns(hi: u32, lo: u32) -> u64 {
    let seconds = u64::from(hi & SPLIT_TIMEOUT_HI_MASK);
    let cycles = u64::from((lo & SPLIT_TIMEOUT_LO_MASK) >> 19);
    (seconds * CYCLES_PER_SECOND + cycles) * CYCLE_NS
}

/// IEEE 1212 CRC-16 over a block of quadlets.
pub fn crc16(quadlets: &[u32]) -> u16 {
    let mut crc: u32 = 0;
    for &data in quadlets {
        for shift in (0..=28).rev().step_by(4) {
            let sum = ((crc >> 12) ^ (data >> shift)) & 0xf;
            crc = (crc << 4) ^ (sum << 12) ^ (sum << 5) ^ sum;
        }
        crc &= 0xffff;
    }
    crc as u16
}
