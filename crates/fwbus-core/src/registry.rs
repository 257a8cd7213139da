//! Host and listener registry.

use std::fmt;
use std::ops::Range;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use fwbus_proto::NodeId;

use crate::clock::{HostClock, StdHostClock};
use crate::config::HostConfig;
use crate::driver::HostDriver;
use crate::error::HostError;
use crate::host::Host;
use crate::router::AddressHandler;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HostId(pub(crate) u32);

impl fmt::Display for HostId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "fw{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ListenerId(pub(crate) u64);

impl fmt::Display for ListenerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "listener{}", self.0)
    }
}

/// Consumer of host lifecycle and bus events. Every method defaults to doing nothing.
///
/// Callbacks run on the host's event path: they must not block on a transaction of the same
/// host, and `add_host`/`remove_host` must not add or remove hosts or listeners.
pub trait BusListener: Send + Sync {
    fn add_host(&self, _host: &Arc<Host>) {}

    fn remove_host(&self, _host: &Arc<Host>) {}

    /// A bus reset finished and the new topology is published.
    fn host_reset(&self, _host: &Host) {}

    /// An isochronous packet arrived; `packet` includes its header.
    fn iso_receive(&self, _host: &Host, _channel: u8, _packet: &[u8]) {}

    /// A frame was written into `FCP_COMMAND` (`response == false`) or `FCP_RESPONSE`.
    fn fcp_request(&self, _host: &Host, _source: NodeId, _response: bool, _frame: &[u8]) {}
}

/// Registered listeners, notified in registration order.
#[derive(Default)]
pub(crate) struct ListenerSet {
    listeners: RwLock<Vec<(ListenerId, Arc<dyn BusListener>)>>,
}

impl ListenerSet {
    fn snapshot(&self) -> Vec<Arc<dyn BusListener>> {
        self.listeners
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .iter()
            .map(|(_, listener)| Arc::clone(listener))
            .collect()
    }

    fn insert(&self, id: ListenerId, listener: Arc<dyn BusListener>) {
        self.listeners
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push((id, listener));
    }

    fn remove(&self, id: ListenerId) -> Option<Arc<dyn BusListener>> {
        let mut listeners = self
            .listeners
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let pos = listeners.iter().position(|(lid, _)| *lid == id)?;
        Some(listeners.remove(pos).1)
    }

    fn contains(&self, id: ListenerId) -> bool {
        self.listeners
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .iter()
            .any(|(lid, _)| *lid == id)
    }

    pub(crate) fn host_reset(&self, host: &Host) {
        for listener in self.snapshot() {
            listener.host_reset(host);
        }
    }

    pub(crate) fn iso_receive(&self, host: &Host, channel: u8, packet: &[u8]) {
        if host.channel_listeners(channel) == 0 {
            tracing::trace!(host = %host.id(), channel, "iso packet on a channel nobody listens to");
            return;
        }
        for listener in self.snapshot() {
            listener.iso_receive(host, channel, packet);
        }
    }

    pub(crate) fn fcp_request(&self, host: &Host, source: NodeId, response: bool, frame: &[u8]) {
        for listener in self.snapshot() {
            listener.fcp_request(host, source, response, frame);
        }
    }
}

/// Owns every host and listener.
pub struct HostRegistry {
    clock: Arc<dyn HostClock>,
    listeners: Arc<ListenerSet>,
    hosts: RwLock<Vec<Arc<Host>>>,
    /// Serializes host and listener (un)registration against each other.
    lifecycle: Mutex<()>,
    next_host_id: AtomicU32,
    next_listener_id: AtomicU64,
}

impl HostRegistry {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(StdHostClock::new()))
    }

    /// Registry whose hosts timestamp requests with `clock`.
    pub fn with_clock(clock: Arc<dyn HostClock>) -> Self {
        Self {
            clock,
            listeners: Arc::new(ListenerSet::default()),
            hosts: RwLock::new(Vec::new()),
            lifecycle: Mutex::new(()),
            next_host_id: AtomicU32::new(0),
            next_listener_id: AtomicU64::new(1),
        }
    }

    fn lock_lifecycle(&self) -> std::sync::MutexGuard<'_, ()> {
        self.lifecycle
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Creates a host for `driver`, maps its CSR space, and announces it to every listener.
    pub fn add_host(
        &self,
        driver: Arc<dyn HostDriver>,
        config: HostConfig,
    ) -> Result<Arc<Host>, HostError> {
        let _lifecycle = self.lock_lifecycle();
        let id = HostId(self.next_host_id.fetch_add(1, Ordering::Relaxed));
        let host = Arc::new_cyclic(|this| {
            Host::new(
                this.clone(),
                id,
                config,
                driver,
                Arc::clone(&self.clock),
                Arc::clone(&self.listeners),
            )
        });
        host.init_csr()?;

        self.hosts
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(Arc::clone(&host));
        tracing::info!(host = %id, "added host");

        for listener in self.listeners.snapshot() {
            listener.add_host(&host);
        }
        Ok(host)
    }

    /// Shuts a host down: later sends fail, pending requests are aborted, and listeners are
    /// told it is gone.
    pub fn remove_host(&self, id: HostId) -> Result<Arc<Host>, HostError> {
        let _lifecycle = self.lock_lifecycle();
        let host = {
            let mut hosts = self
                .hosts
                .write()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            let pos = hosts
                .iter()
                .position(|h| h.id() == id)
                .ok_or(HostError::UnknownHost(id))?;
            hosts.remove(pos)
        };

        host.mark_shutdown();
        host.abort_requests();
        for listener in self.listeners.snapshot() {
            listener.remove_host(&host);
        }
        tracing::info!(host = %id, "removed host");
        Ok(host)
    }

    pub fn host(&self, id: HostId) -> Option<Arc<Host>> {
        self.hosts
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .iter()
            .find(|h| h.id() == id)
            .cloned()
    }

    pub fn hosts(&self) -> Vec<Arc<Host>> {
        self.hosts
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Registers a listener and replays `add_host` for every existing host.
    pub fn register_listener(&self, listener: Arc<dyn BusListener>) -> ListenerId {
        let _lifecycle = self.lock_lifecycle();
        let id = ListenerId(self.next_listener_id.fetch_add(1, Ordering::Relaxed));
        self.listeners.insert(id, Arc::clone(&listener));
        for host in self.hosts() {
            listener.add_host(&host);
        }
        tracing::debug!(listener = %id, "registered listener");
        id
    }

    /// Unregisters a listener, dropping its address ranges on every host before telling it
    /// each host is gone.
    pub fn unregister_listener(&self, id: ListenerId) -> Result<(), HostError> {
        let _lifecycle = self.lock_lifecycle();
        let listener = self
            .listeners
            .remove(id)
            .ok_or(HostError::UnknownListener(id))?;
        for host in self.hosts() {
            let removed = host.router().unregister_owner(id);
            if removed > 0 {
                tracing::debug!(listener = %id, host = %host.id(), removed, "dropped address ranges");
            }
            listener.remove_host(&host);
        }
        Ok(())
    }

    /// Maps `[start, end)` on `host` to `handler`, owned by `owner`.
    pub fn register_address_space(
        &self,
        host: &Host,
        owner: ListenerId,
        start: u64,
        end: u64,
        handler: Arc<dyn AddressHandler>,
    ) -> Result<(), HostError> {
        if !self.listeners.contains(owner) {
            return Err(HostError::UnknownListener(owner));
        }
        host.router().register(start, end, Some(owner), handler)?;
        Ok(())
    }

    /// Maps the first free `size`-byte range aligned to `alignment` within `within`.
    pub fn allocate_address_space(
        &self,
        host: &Host,
        owner: ListenerId,
        size: u64,
        alignment: u64,
        within: Range<u64>,
        handler: Arc<dyn AddressHandler>,
    ) -> Result<u64, HostError> {
        if !self.listeners.contains(owner) {
            return Err(HostError::UnknownListener(owner));
        }
        Ok(host
            .router()
            .allocate(size, alignment, within, Some(owner), handler)?)
    }
}

impl Default for HostRegistry {
    fn default() -> Self {
        Self::new()
    }
}
