use fwbus_proto::{AckCode, Rcode, Tcode};
use thiserror::Error;

use crate::driver::DriverError;
use crate::registry::{HostId, ListenerId};

const EBUSY: i32 = 16;
const EAGAIN: i32 = 11;
const ENODEV: i32 = 19;
const EACCES: i32 = 13;
const EINVAL: i32 = 22;
const EREMOTEIO: i32 = 121;

/// Address range registration failures. Registration never partially succeeds.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegisterError {
    #[error("address range {start:#x}..{end:#x} is not quadlet aligned")]
    Unaligned { start: u64, end: u64 },

    #[error("address range {start:#x}..{end:#x} is empty or exceeds the 48-bit address space")]
    OutOfBounds { start: u64, end: u64 },

    #[error(
        "address range {start:#x}..{end:#x} overlaps {existing_start:#x}..{existing_end:#x}"
    )]
    Overlap {
        start: u64,
        end: u64,
        existing_start: u64,
        existing_end: u64,
    },

    #[error("no free {size:#x}-byte range aligned to {alignment:#x}")]
    NoSpace { size: u64, alignment: u64 },
}

/// Reasons the host refused to hand a packet to the backend.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SendError {
    #[error("host is in bus reset")]
    InBusReset,

    #[error("host has been removed")]
    Shutdown,

    #[error("packet built for generation {packet} but host is at generation {host}")]
    StaleGeneration { packet: u32, host: u32 },

    #[error("backend failed to queue the packet")]
    Rejected,

    #[error("no transaction label available")]
    NoTlabel,

    #[error("payload of {0} bytes does not fit one packet")]
    PayloadTooLarge(usize),
}

impl SendError {
    pub fn errno(&self) -> i32 {
        match self {
            Self::Shutdown => -ENODEV,
            Self::PayloadTooLarge(_) => -EINVAL,
            Self::InBusReset | Self::StaleGeneration { .. } | Self::Rejected | Self::NoTlabel => {
                -EAGAIN
            }
        }
    }
}

/// Outcome classification of a finished transaction.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransactionError {
    #[error("target node is busy ({0:?})")]
    Busy(AckCode),

    #[error("transaction should be retried (ack {ack:?}, rcode {rcode:?})")]
    Retry { ack: AckCode, rcode: Option<Rcode> },

    #[error("remote data error")]
    RemoteData,

    #[error("request not permitted by the target")]
    NotPermitted,

    #[error("invalid address or argument")]
    InvalidAddress,

    #[error("response carried {got} bytes, expected {expected}")]
    ShortResponse { expected: usize, got: usize },

    #[error(transparent)]
    Send(#[from] SendError),
}

impl TransactionError {
    /// Negative errno value for this outcome.
    pub fn errno(&self) -> i32 {
        match self {
            Self::Busy(_) => -EBUSY,
            Self::Retry { .. } | Self::ShortResponse { .. } => -EAGAIN,
            Self::RemoteData => -EREMOTEIO,
            Self::NotPermitted => -EACCES,
            Self::InvalidAddress => -EINVAL,
            Self::Send(err) => err.errno(),
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.errno() == -EAGAIN || self.errno() == -EBUSY
    }

    /// Classifies the final `(ack, rcode)` of a request with the given tcode.
    pub fn classify(tcode: Tcode, ack: AckCode, rcode: Option<Rcode>) -> Result<(), Self> {
        match ack {
            AckCode::Pending => match rcode {
                Some(Rcode::Complete) => Ok(()),
                Some(Rcode::DataError) => Err(Self::RemoteData),
                Some(Rcode::TypeError) => Err(Self::NotPermitted),
                Some(Rcode::AddressError) => Err(Self::InvalidAddress),
                Some(Rcode::ConflictError) | None => Err(Self::Retry { ack, rcode }),
            },
            AckCode::BusyX | AckCode::BusyA | AckCode::BusyB => Err(Self::Busy(ack)),
            AckCode::TypeError => Err(Self::NotPermitted),
            AckCode::AddressError => Err(Self::InvalidAddress),
            AckCode::Complete => match tcode {
                Tcode::WriteQuadlet | Tcode::WriteBlock => Ok(()),
                _ => {
                    tracing::warn!(?tcode, "ack complete for a request that expects a response");
                    Err(Self::Retry { ack, rcode })
                }
            },
            AckCode::DataError
            | AckCode::Tardy
            | AckCode::ConflictError
            | AckCode::NoAck
            | AckCode::SendError
            | AckCode::Aborted
            | AckCode::Timeout => Err(Self::Retry { ack, rcode }),
        }
    }
}

/// Host lifecycle and registry failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HostError {
    #[error("host {0} is not registered")]
    UnknownHost(HostId),

    #[error("listener {0} is not registered")]
    UnknownListener(ListenerId),

    #[error("failed to map CSR space: {0}")]
    Csr(#[from] RegisterError),

    #[error("isochronous channel {0} out of range")]
    InvalidChannel(u8),

    #[error(transparent)]
    Driver(#[from] DriverError),
}
