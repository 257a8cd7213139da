use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard};

use fwbus_proto::AckCode;

use crate::packet::PacketId;

/// Hardware event reported by a backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostEvent {
    BusReset,
    SelfId(u32),
    SelfIdComplete { phy_id: u8, is_root: bool },
    PacketSent { id: PacketId, ack: AckCode },
    PacketReceived { data: Vec<u8>, write_acked: bool },
    TimeoutTick,
}

#[derive(Debug, Default)]
struct QueueState {
    events: VecDeque<HostEvent>,
    draining: bool,
}

/// Serializes backend events for one host.
///
/// Any thread may push. The first pusher that finds the queue idle becomes its consumer and
/// drains it, including events pushed while it is busy; every other push only enqueues. Events
/// are therefore handled one at a time in arrival order, and a handler that triggers further
/// events (for example by sending a packet the backend answers inline) never re-enters itself.
#[derive(Debug, Default)]
pub(crate) struct EventQueue {
    inner: Mutex<QueueState>,
}

impl EventQueue {
    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Queues `event` and, if no other caller is draining, drains the queue through `handle`.
    pub(crate) fn push(&self, event: HostEvent, mut handle: impl FnMut(HostEvent)) {
        {
            let mut state = self.lock();
            state.events.push_back(event);
            if state.draining {
                return;
            }
            state.draining = true;
        }

        loop {
            let next = {
                let mut state = self.lock();
                match state.events.pop_front() {
                    Some(event) => event,
                    None => {
                        state.draining = false;
                        return;
                    }
                }
            };
            handle(next);
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.lock().events.len()
    }
}
