//! Bus management and asynchronous transactions for IEEE 1394 host controllers.
//!
//! A [`HostRegistry`] owns one [`Host`] per controller. Backends implement [`HostDriver`] and
//! report hardware events through the host's injection methods; consumers implement
//! [`BusListener`] and map [`AddressHandler`]s into each host's 48-bit address space.
//!
//! Every host processes backend events one at a time through an internal queue: a bus reset
//! aborts outstanding requests, the Self-ID stream is validated into a [`Topology`], and the
//! generation counter moves forward once per completed reset. Packets carry the generation
//! they were built for and are refused once it is stale.
#![forbid(unsafe_code)]

mod bus_reset;
pub mod clock;
pub mod config;
pub mod csr;
pub mod driver;
pub mod error;
mod events;
pub mod host;
pub mod packet;
pub mod registry;
pub mod router;
mod timer;
pub mod tlabel;
pub mod topology;
mod transaction;

pub use clock::{FakeHostClock, HostClock, StdHostClock};
pub use config::HostConfig;
pub use csr::{CsrBlock, CsrRegisters};
pub use driver::{CsrLockReg, DevCtl, DriverError, HostDriver, ResetType};
pub use error::{HostError, RegisterError, SendError, TransactionError};
pub use events::HostEvent;
pub use host::{BusPhase, Host, NodeSnapshot, Roles, Topology};
pub use packet::{Completion, Packet, PacketId, PacketKind, PacketState, Response, Transaction};
pub use registry::{BusListener, HostId, HostRegistry, ListenerId};
pub use router::{AddressHandler, AddressOps, AddressRouter};
pub use tlabel::{Tlabel, TlabelPool};
pub use topology::{SelfIdError, SpeedMap};
pub use transaction::MAX_PAYLOAD;

pub use fwbus_proto as proto;
