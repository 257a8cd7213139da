//! Transaction label pool.

use std::fmt;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};

/// Number of distinct 6-bit labels.
pub const TLABEL_COUNT: usize = 64;
/// Labels that may be outstanding at once. One label is always left free.
pub const MAX_OUTSTANDING: usize = TLABEL_COUNT - 1;

#[derive(Debug, Default)]
struct PoolState {
    in_use: u64,
    outstanding: usize,
}

/// Per-host allocator of the 64 transaction labels.
///
/// Acquisition first takes a slot from a counting limit of [`MAX_OUTSTANDING`], then claims the
/// lowest clear bit of the label mask.
#[derive(Debug, Default)]
pub struct TlabelPool {
    state: Mutex<PoolState>,
    freed: Condvar,
}

impl TlabelPool {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn lock(&self) -> MutexGuard<'_, PoolState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Claims a label. With `blocking` set this waits for a release when the pool is exhausted;
    /// otherwise it returns `None` immediately.
    pub fn acquire(self: &Arc<Self>, blocking: bool) -> Option<Tlabel> {
        let mut state = self.lock();
        while state.outstanding >= MAX_OUTSTANDING {
            if !blocking {
                return None;
            }
            state = self
                .freed
                .wait(state)
                .unwrap_or_else(|poisoned| poisoned.into_inner());
        }

        let label = (!state.in_use).trailing_zeros() as u8;
        debug_assert!(usize::from(label) < TLABEL_COUNT);
        state.in_use |= 1 << label;
        state.outstanding += 1;
        Some(Tlabel {
            label,
            pool: Arc::clone(self),
        })
    }

    fn release(&self, label: u8) {
        let mut state = self.lock();
        let bit = 1u64 << label;
        if state.in_use & bit == 0 {
            tracing::warn!(tlabel = label, "releasing transaction label that is not in use");
            return;
        }
        state.in_use &= !bit;
        state.outstanding -= 1;
        drop(state);
        self.freed.notify_one();
    }

    pub fn outstanding(&self) -> usize {
        self.lock().outstanding
    }

    pub fn is_in_use(&self, label: u8) -> bool {
        label < 64 && self.lock().in_use & (1 << label) != 0
    }
}

/// A claimed transaction label. Dropping it returns the label to its pool.
pub struct Tlabel {
    label: u8,
    pool: Arc<TlabelPool>,
}

impl Tlabel {
    pub fn value(&self) -> u8 {
        self.label
    }

    /// Explicitly returns the label to the pool.
    pub fn release(self) {
        drop(self);
    }
}

impl Drop for Tlabel {
    fn drop(&mut self) {
        self.pool.release(self.label);
    }
}

impl fmt::Debug for Tlabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Tlabel").field(&self.label).finish()
    }
}
