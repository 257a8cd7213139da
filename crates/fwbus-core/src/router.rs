//! 48-bit address space router.
//!
//! Feature modules register non-overlapping, quadlet-aligned `[start, end)` ranges. Incoming
//! requests are dispatched by address; a block access may span several adjacent ranges, a lock
//! may not.

use std::ops::Range;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use bitflags::bitflags;
use fwbus_proto::{ExtCode, NodeId, Rcode, ADDRESS_SPACE_END};

use crate::error::RegisterError;
use crate::host::Host;
use crate::registry::ListenerId;

bitflags! {
    /// Operations an [`AddressHandler`] implements. Dispatching an operation outside this set
    /// answers `TYPE_ERROR` without calling the handler.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct AddressOps: u8 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
        const LOCK = 1 << 2;
        const LOCK64 = 1 << 3;
    }
}

/// Handler for requests addressed to a registered range.
///
/// `addr` is always the full 48-bit offset of the first byte the handler is asked to serve.
pub trait AddressHandler: Send + Sync {
    fn ops(&self) -> AddressOps;

    fn read(&self, _host: &Host, _source: NodeId, _buf: &mut [u8], _addr: u64) -> Rcode {
        Rcode::TypeError
    }

    fn write(
        &self,
        _host: &Host,
        _source: NodeId,
        _destination: NodeId,
        _data: &[u8],
        _addr: u64,
    ) -> Rcode {
        Rcode::TypeError
    }

    /// Returns the old value. For single-operand codes `arg` is zero.
    fn lock(
        &self,
        _host: &Host,
        _source: NodeId,
        _addr: u64,
        _ext: ExtCode,
        _data: u32,
        _arg: u32,
    ) -> Result<u32, Rcode> {
        Err(Rcode::TypeError)
    }

    fn lock64(
        &self,
        _host: &Host,
        _source: NodeId,
        _addr: u64,
        _ext: ExtCode,
        _data: u64,
        _arg: u64,
    ) -> Result<u64, Rcode> {
        Err(Rcode::TypeError)
    }
}

struct Mapping {
    start: u64,
    end: u64,
    owner: Option<ListenerId>,
    handler: Arc<dyn AddressHandler>,
}

/// One piece of a block access, resolved while the range list is locked.
struct Segment {
    handler: Arc<dyn AddressHandler>,
    addr: u64,
    offset: usize,
    len: usize,
}

/// Sorted, non-overlapping range list. Handlers are always invoked with the list unlocked.
#[derive(Default)]
pub struct AddressRouter {
    ranges: RwLock<Vec<Mapping>>,
}

impl AddressRouter {
    pub fn new() -> Self {
        Self::default()
    }

    fn read_ranges(&self) -> RwLockReadGuard<'_, Vec<Mapping>> {
        self.ranges
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write_ranges(&self) -> RwLockWriteGuard<'_, Vec<Mapping>> {
        self.ranges
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn validate(start: u64, end: u64) -> Result<(), RegisterError> {
        if start >= end || end > ADDRESS_SPACE_END {
            return Err(RegisterError::OutOfBounds { start, end });
        }
        if (start | end) & 3 != 0 {
            return Err(RegisterError::Unaligned { start, end });
        }
        Ok(())
    }

    fn check_gap(ranges: &[Mapping], idx: usize, start: u64, end: u64) -> Result<(), RegisterError> {
        let prev = idx.checked_sub(1).and_then(|i| ranges.get(i));
        for existing in prev.into_iter().chain(ranges.get(idx)) {
            if start < existing.end && existing.start < end {
                return Err(RegisterError::Overlap {
                    start,
                    end,
                    existing_start: existing.start,
                    existing_end: existing.end,
                });
            }
        }
        Ok(())
    }

    /// Registers `[start, end)`. Fails without side effects on overlap or invalid bounds.
    pub fn register(
        &self,
        start: u64,
        end: u64,
        owner: Option<ListenerId>,
        handler: Arc<dyn AddressHandler>,
    ) -> Result<(), RegisterError> {
        Self::validate(start, end)?;
        let mut ranges = self.write_ranges();
        let idx = ranges.partition_point(|m| m.start < start);
        Self::check_gap(&ranges, idx, start, end)?;
        ranges.insert(
            idx,
            Mapping {
                start,
                end,
                owner,
                handler,
            },
        );
        tracing::debug!("registered address range {start:#x}..{end:#x}");
        Ok(())
    }

    /// Registers the lowest `size`-byte range aligned to `alignment` that fits in a gap inside
    /// `within`, returning its start.
    pub fn allocate(
        &self,
        size: u64,
        alignment: u64,
        within: Range<u64>,
        owner: Option<ListenerId>,
        handler: Arc<dyn AddressHandler>,
    ) -> Result<u64, RegisterError> {
        let alignment = alignment.max(4).next_power_of_two();
        let no_space = RegisterError::NoSpace { size, alignment };
        if size == 0 || size & 3 != 0 {
            return Err(RegisterError::Unaligned {
                start: within.start,
                end: within.start.saturating_add(size),
            });
        }
        let within_end = within.end.min(ADDRESS_SPACE_END);

        let mut ranges = self.write_ranges();
        let mut gap_start = within.start;
        let mut found = None;
        for idx in 0..=ranges.len() {
            let gap_end = ranges.get(idx).map_or(within_end, |m| m.start.min(within_end));
            if let Some(start) = gap_start.checked_next_multiple_of(alignment) {
                if start.checked_add(size).is_some_and(|end| end <= gap_end) {
                    found = Some((idx, start));
                    break;
                }
            }
            if let Some(mapping) = ranges.get(idx) {
                gap_start = gap_start.max(mapping.end);
            }
            if gap_start >= within_end {
                break;
            }
        }

        let (idx, start) = found.ok_or(no_space)?;
        ranges.insert(
            idx,
            Mapping {
                start,
                end: start + size,
                owner,
                handler,
            },
        );
        Ok(start)
    }

    /// Removes the range starting exactly at `start`.
    pub fn unregister(&self, start: u64) -> bool {
        let mut ranges = self.write_ranges();
        let idx = ranges.partition_point(|m| m.start < start);
        if ranges.get(idx).is_some_and(|m| m.start == start) {
            ranges.remove(idx);
            true
        } else {
            false
        }
    }

    /// Removes every range registered by `owner`, returning how many were removed.
    pub fn unregister_owner(&self, owner: ListenerId) -> usize {
        let mut ranges = self.write_ranges();
        let before = ranges.len();
        ranges.retain(|m| m.owner != Some(owner));
        before - ranges.len()
    }

    /// Snapshot of the registered ranges in address order.
    pub fn ranges(&self) -> Vec<Range<u64>> {
        self.read_ranges().iter().map(|m| m.start..m.end).collect()
    }

    /// Splits `[addr, addr + len)` over consecutive ranges. The flag reports whether bytes
    /// remained after a gap or the end of the list. A zero-length access inside a range yields
    /// one empty segment.
    fn plan(&self, addr: u64, len: usize) -> (Vec<Segment>, bool) {
        let ranges = self.read_ranges();
        let mut segments = Vec::new();
        let mut addr = addr;
        let mut offset = 0usize;
        let mut remaining = len as u64;

        let mut idx = ranges.partition_point(|m| m.end <= addr);
        while let Some(mapping) = ranges.get(idx) {
            if mapping.start > addr {
                break;
            }
            let part = (mapping.end - addr).min(remaining);
            segments.push(Segment {
                handler: Arc::clone(&mapping.handler),
                addr,
                offset,
                len: part as usize,
            });
            addr += part;
            offset += part as usize;
            remaining -= part;
            if remaining == 0 {
                break;
            }
            idx += 1;
        }
        (segments, remaining != 0)
    }

    pub fn read(&self, host: &Host, source: NodeId, buf: &mut [u8], addr: u64) -> Rcode {
        let (segments, incomplete) = self.plan(addr, buf.len());
        let mut rcode = Rcode::AddressError;
        for segment in segments {
            rcode = if segment.handler.ops().contains(AddressOps::READ) {
                let part = &mut buf[segment.offset..segment.offset + segment.len];
                segment.handler.read(host, source, part, segment.addr)
            } else {
                Rcode::TypeError
            };
            if !rcode.is_complete() {
                return rcode;
            }
        }
        if incomplete {
            Rcode::AddressError
        } else {
            rcode
        }
    }

    pub fn write(
        &self,
        host: &Host,
        source: NodeId,
        destination: NodeId,
        data: &[u8],
        addr: u64,
    ) -> Rcode {
        let (segments, incomplete) = self.plan(addr, data.len());
        let mut rcode = Rcode::AddressError;
        for segment in segments {
            rcode = if segment.handler.ops().contains(AddressOps::WRITE) {
                let part = &data[segment.offset..segment.offset + segment.len];
                segment
                    .handler
                    .write(host, source, destination, part, segment.addr)
            } else {
                Rcode::TypeError
            };
            if !rcode.is_complete() {
                return rcode;
            }
        }
        if incomplete {
            Rcode::AddressError
        } else {
            rcode
        }
    }

    /// Finds the single range containing `[addr, addr + len)`.
    fn containing(&self, addr: u64, len: u64) -> Option<Arc<dyn AddressHandler>> {
        let ranges = self.read_ranges();
        let idx = ranges.partition_point(|m| m.end <= addr);
        let mapping = ranges.get(idx)?;
        let end = addr.checked_add(len)?;
        (mapping.start <= addr && end <= mapping.end).then(|| Arc::clone(&mapping.handler))
    }

    pub fn lock(
        &self,
        host: &Host,
        source: NodeId,
        addr: u64,
        ext: ExtCode,
        data: u32,
        arg: u32,
    ) -> Result<u32, Rcode> {
        let handler = self.containing(addr, 4).ok_or(Rcode::AddressError)?;
        if !handler.ops().contains(AddressOps::LOCK) {
            return Err(Rcode::TypeError);
        }
        handler.lock(host, source, addr, ext, data, arg)
    }

    pub fn lock64(
        &self,
        host: &Host,
        source: NodeId,
        addr: u64,
        ext: ExtCode,
        data: u64,
        arg: u64,
    ) -> Result<u64, Rcode> {
        let handler = self.containing(addr, 8).ok_or(Rcode::AddressError)?;
        if !handler.ops().contains(AddressOps::LOCK64) {
            return Err(Rcode::TypeError);
        }
        handler.lock64(host, source, addr, ext, data, arg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Inert;

    impl AddressHandler for Inert {
        fn ops(&self) -> AddressOps {
            AddressOps::empty()
        }
    }

    fn inert() -> Arc<dyn AddressHandler> {
        Arc::new(Inert)
    }

    #[test]
    fn keeps_ranges_sorted() {
        let router = AddressRouter::new();
        router.register(0x3000, 0x4000, None, inert()).unwrap();
        router.register(0x1000, 0x2000, None, inert()).unwrap();
        router.register(0x2000, 0x3000, None, inert()).unwrap();
        assert_eq!(
            router.ranges(),
            vec![0x1000..0x2000, 0x2000..0x3000, 0x3000..0x4000]
        );
    }

    #[test]
    fn overlapping_registration_leaves_list_unchanged() {
        let router = AddressRouter::new();
        router.register(0x1000, 0x2000, None, inert()).unwrap();
        router.register(0x3000, 0x4000, None, inert()).unwrap();
        let before = router.ranges();

        for (start, end) in [(0x1ffc, 0x2100), (0x0, 0x1004), (0x2000, 0x3004), (0x1800, 0x1900)] {
            let err = router.register(start, end, None, inert()).unwrap_err();
            assert!(matches!(err, RegisterError::Overlap { .. }), "{err}");
        }
        assert_eq!(router.ranges(), before);
    }

    #[test]
    fn rejects_invalid_bounds() {
        let router = AddressRouter::new();
        assert!(matches!(
            router.register(0x1002, 0x2000, None, inert()),
            Err(RegisterError::Unaligned { .. })
        ));
        assert!(matches!(
            router.register(0x2000, 0x2000, None, inert()),
            Err(RegisterError::OutOfBounds { .. })
        ));
        assert!(matches!(
            router.register(ADDRESS_SPACE_END - 4, ADDRESS_SPACE_END + 4, None, inert()),
            Err(RegisterError::OutOfBounds { .. })
        ));
        router
            .register(ADDRESS_SPACE_END - 4, ADDRESS_SPACE_END, None, inert())
            .unwrap();
        assert!(router.ranges().len() == 1);
    }

    #[test]
    fn allocate_picks_lowest_aligned_gap() {
        let router = AddressRouter::new();
        router.register(0x0, 0x100, None, inert()).unwrap();
        router.register(0x180, 0x200, None, inert()).unwrap();

        // 0x100..0x180 fits 0x80 bytes at 0x100.
        let start = router.allocate(0x80, 0x80, 0..0x1000, None, inert()).unwrap();
        assert_eq!(start, 0x100);

        // Next 0x100-aligned gap is 0x200.
        let start = router.allocate(0x40, 0x100, 0..0x1000, None, inert()).unwrap();
        assert_eq!(start, 0x200);

        let err = router
            .allocate(0x1000, 4, 0..0x1000, None, inert())
            .unwrap_err();
        assert!(matches!(err, RegisterError::NoSpace { .. }));
    }

    #[test]
    fn unregister_by_owner() {
        let router = AddressRouter::new();
        let owner = ListenerId(1);
        router.register(0x0, 0x10, Some(owner), inert()).unwrap();
        router.register(0x10, 0x20, None, inert()).unwrap();
        router.register(0x20, 0x30, Some(owner), inert()).unwrap();

        assert_eq!(router.unregister_owner(owner), 2);
        assert_eq!(router.ranges(), vec![0x10..0x20]);
        assert!(router.unregister(0x10));
        assert!(!router.unregister(0x10));
    }
}
