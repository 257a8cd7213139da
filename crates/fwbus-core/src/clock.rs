use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// Monotonic time source used for send timestamps and split-timeout sweeps.
pub trait HostClock: Send + Sync {
    /// Monotonic nanoseconds since an arbitrary epoch.
    fn now_ns(&self) -> u64;

    /// Whether time passes without anyone advancing the clock. Hosts only schedule their own
    /// timeout sweeps on such clocks.
    fn advances_on_its_own(&self) -> bool {
        true
    }
}

/// [`HostClock`] backed by [`Instant`].
#[derive(Debug)]
pub struct StdHostClock {
    start: Instant,
}

impl StdHostClock {
    pub fn new() -> Self {
        Self {
            start: Instant::now(),
        }
    }
}

impl Default for StdHostClock {
    fn default() -> Self {
        Self::new()
    }
}

impl HostClock for StdHostClock {
    fn now_ns(&self) -> u64 {
        u64::try_from(self.start.elapsed().as_nanos()).unwrap_or(u64::MAX)
    }
}

/// Deterministic clock for tests. Time only moves when [`FakeHostClock::advance`] is called, so
/// timeout sweeps must be driven with `Host::poll_timeouts`.
#[derive(Debug, Default)]
pub struct FakeHostClock {
    now_ns: AtomicU64,
}

impl FakeHostClock {
    pub fn new(now_ns: u64) -> Self {
        Self {
            now_ns: AtomicU64::new(now_ns),
        }
    }

    pub fn advance(&self, ns: u64) {
        self.now_ns.fetch_add(ns, Ordering::SeqCst);
    }

    pub fn set_now_ns(&self, now_ns: u64) {
        self.now_ns.store(now_ns, Ordering::SeqCst);
    }
}

impl HostClock for FakeHostClock {
    fn now_ns(&self) -> u64 {
        self.now_ns.load(Ordering::SeqCst)
    }

    fn advances_on_its_own(&self) -> bool {
        false
    }
}
