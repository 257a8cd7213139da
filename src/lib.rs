//! IEEE 1394 bus management and asynchronous transactions.
//!
//! [`proto`] holds the wire formats, [`bus`] the per-host engine and registry, and [`sim`] an
//! in-process bus that drives several hosts against each other.

pub use fwbus_core as bus;
pub use fwbus_proto as proto;
pub use fwbus_sim as sim;
