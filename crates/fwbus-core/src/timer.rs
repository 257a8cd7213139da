//! Split-timeout sweep scheduling.
//!
//! Each host owns one [`SweepTimer`]. Arming it with a deadline starts (on first use) a worker
//! thread that waits until the host clock reaches the earliest armed deadline and then posts a
//! timeout tick to the host. The sweep re-arms the timer while requests remain pending.

use std::sync::{Arc, Condvar, Mutex, MutexGuard, Weak};
use std::time::Duration;

use crate::clock::HostClock;
use crate::host::Host;

#[derive(Debug, Default)]
struct TimerState {
    deadline_ns: Option<u64>,
    started: bool,
    stopped: bool,
}

#[derive(Debug, Default)]
struct Shared {
    state: Mutex<TimerState>,
    wake: Condvar,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, TimerState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

pub(crate) struct SweepTimer {
    shared: Arc<Shared>,
}

impl SweepTimer {
    pub(crate) fn new() -> Self {
        Self {
            shared: Arc::new(Shared::default()),
        }
    }

    /// Schedules a sweep of `host` no later than `deadline_ns` on `clock`.
    ///
    /// Clocks that do not advance on their own never start the worker; their sweeps are driven
    /// through [`Host::poll_timeouts`].
    pub(crate) fn arm(&self, host: &Weak<Host>, clock: &Arc<dyn HostClock>, deadline_ns: u64) {
        if !clock.advances_on_its_own() {
            return;
        }
        let spawn = {
            let mut state = self.shared.lock();
            if state.stopped {
                return;
            }
            state.deadline_ns = Some(state.deadline_ns.map_or(deadline_ns, |d| d.min(deadline_ns)));
            let spawn = !state.started;
            state.started = true;
            spawn
        };
        self.shared.wake.notify_one();
        if !spawn {
            return;
        }

        let shared = Arc::clone(&self.shared);
        let host = host.clone();
        let clock = Arc::clone(clock);
        let spawned = std::thread::Builder::new()
            .name("fwbus-sweep".into())
            .spawn(move || run(&shared, &host, clock.as_ref()));
        if let Err(err) = spawned {
            tracing::warn!(%err, "could not start split-timeout sweep thread");
            self.shared.lock().started = false;
        }
    }

    /// Pending deadline, if the timer is armed.
    pub(crate) fn deadline_ns(&self) -> Option<u64> {
        self.shared.lock().deadline_ns
    }

    /// Stops the worker; later arms are ignored.
    pub(crate) fn stop(&self) {
        let mut state = self.shared.lock();
        state.stopped = true;
        state.deadline_ns = None;
        drop(state);
        self.shared.wake.notify_all();
    }
}

impl Drop for SweepTimer {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run(shared: &Shared, host: &Weak<Host>, clock: &dyn HostClock) {
    loop {
        {
            let mut state = shared.lock();
            loop {
                if state.stopped {
                    return;
                }
                match state.deadline_ns {
                    None => {
                        state = shared
                            .wake
                            .wait(state)
                            .unwrap_or_else(|poisoned| poisoned.into_inner());
                    }
                    Some(deadline) => {
                        let now = clock.now_ns();
                        if now >= deadline {
                            state.deadline_ns = None;
                            break;
                        }
                        state = shared
                            .wake
                            .wait_timeout(state, Duration::from_nanos(deadline - now))
                            .unwrap_or_else(|poisoned| poisoned.into_inner())
                            .0;
                    }
                }
            }
        }

        let Some(host) = host.upgrade() else {
            return;
        };
        host.poll_timeouts();
    }
}
