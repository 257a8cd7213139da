//! Transaction codes, response codes, acknowledge codes and speeds.

use core::fmt;

/// Transaction code (`tcode`) carried in bits 7..4 of header quadlet 0.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Tcode {
    WriteQuadlet = 0x0,
    WriteBlock = 0x1,
    WriteResponse = 0x2,
    ReadQuadlet = 0x4,
    ReadBlock = 0x5,
    ReadQuadletResponse = 0x6,
    ReadBlockResponse = 0x7,
    CycleStart = 0x8,
    LockRequest = 0x9,
    /// Isochronous data block; asynchronous stream packets share the same code.
    IsoData = 0xa,
    LockResponse = 0xb,
}

impl Tcode {
    pub const fn from_raw(raw: u8) -> Option<Self> {
        Some(match raw {
            0x0 => Self::WriteQuadlet,
            0x1 => Self::WriteBlock,
            0x2 => Self::WriteResponse,
            0x4 => Self::ReadQuadlet,
            0x5 => Self::ReadBlock,
            0x6 => Self::ReadQuadletResponse,
            0x7 => Self::ReadBlockResponse,
            0x8 => Self::CycleStart,
            0x9 => Self::LockRequest,
            0xa => Self::IsoData,
            0xb => Self::LockResponse,
            _ => return None,
        })
    }

    pub const fn raw(self) -> u8 {
        self as u8
    }

    pub const fn is_request(self) -> bool {
        matches!(
            self,
            Self::WriteQuadlet
                | Self::WriteBlock
                | Self::ReadQuadlet
                | Self::ReadBlock
                | Self::LockRequest
        )
    }

    pub const fn is_response(self) -> bool {
        matches!(
            self,
            Self::WriteResponse
                | Self::ReadQuadletResponse
                | Self::ReadBlockResponse
                | Self::LockResponse
        )
    }

    /// The response tcode a responder must use for this request tcode.
    pub const fn response(self) -> Option<Self> {
        match self {
            Self::WriteQuadlet | Self::WriteBlock => Some(Self::WriteResponse),
            Self::ReadQuadlet => Some(Self::ReadQuadletResponse),
            Self::ReadBlock => Some(Self::ReadBlockResponse),
            Self::LockRequest => Some(Self::LockResponse),
            _ => None,
        }
    }

    /// Header length in bytes for a packet with this tcode.
    pub const fn header_len(self) -> usize {
        match self {
            Self::WriteResponse | Self::ReadQuadlet => 12,
            Self::IsoData => 4,
            _ => 16,
        }
    }

    /// Whether the packet carries a data block after the header.
    pub const fn has_data_block(self) -> bool {
        matches!(
            self,
            Self::WriteBlock
                | Self::ReadBlockResponse
                | Self::LockRequest
                | Self::LockResponse
                | Self::IsoData
        )
    }
}

/// Response code carried in bits 15..12 of header quadlet 1 of a response.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Rcode {
    Complete = 0x0,
    ConflictError = 0x4,
    DataError = 0x5,
    TypeError = 0x6,
    AddressError = 0x7,
}

impl Rcode {
    pub const fn from_raw(raw: u8) -> Option<Self> {
        Some(match raw {
            0x0 => Self::Complete,
            0x4 => Self::ConflictError,
            0x5 => Self::DataError,
            0x6 => Self::TypeError,
            0x7 => Self::AddressError,
            _ => return None,
        })
    }

    pub const fn raw(self) -> u8 {
        self as u8
    }

    pub const fn is_complete(self) -> bool {
        matches!(self, Self::Complete)
    }
}

impl fmt::Display for Rcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Complete => "complete",
            Self::ConflictError => "conflict error",
            Self::DataError => "data error",
            Self::TypeError => "type error",
            Self::AddressError => "address error",
        };
        f.write_str(name)
    }
}

/// Link-layer acknowledge code, plus the synthetic outcomes the core reports when no wire ack
/// exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AckCode {
    Complete,
    Pending,
    BusyX,
    BusyA,
    BusyB,
    Tardy,
    ConflictError,
    DataError,
    TypeError,
    AddressError,
    /// The backend never reported an outcome.
    NoAck,
    /// The backend rejected the transmission.
    SendError,
    /// Cancelled by a bus reset.
    Aborted,
    /// No response arrived within the split timeout.
    Timeout,
}

impl AckCode {
    pub const fn from_wire(raw: u8) -> Option<Self> {
        Some(match raw {
            0x1 => Self::Complete,
            0x2 => Self::Pending,
            0x4 => Self::BusyX,
            0x5 => Self::BusyA,
            0x6 => Self::BusyB,
            0xb => Self::Tardy,
            0xc => Self::ConflictError,
            0xd => Self::DataError,
            0xe => Self::TypeError,
            0xf => Self::AddressError,
            _ => return None,
        })
    }

    /// The 4-bit wire encoding, or `None` for synthetic codes.
    pub const fn wire(self) -> Option<u8> {
        Some(match self {
            Self::Complete => 0x1,
            Self::Pending => 0x2,
            Self::BusyX => 0x4,
            Self::BusyA => 0x5,
            Self::BusyB => 0x6,
            Self::Tardy => 0xb,
            Self::ConflictError => 0xc,
            Self::DataError => 0xd,
            Self::TypeError => 0xe,
            Self::AddressError => 0xf,
            Self::NoAck | Self::SendError | Self::Aborted | Self::Timeout => return None,
        })
    }

    pub const fn is_busy(self) -> bool {
        matches!(self, Self::BusyX | Self::BusyA | Self::BusyB)
    }

    pub const fn is_synthetic(self) -> bool {
        self.wire().is_none()
    }
}

/// Extended transaction code of a lock request.
#[repr(u16)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExtCode {
    MaskSwap = 0x1,
    CompareSwap = 0x2,
    FetchAdd = 0x3,
    LittleAdd = 0x4,
    BoundedAdd = 0x5,
    WrapAdd = 0x6,
}

impl ExtCode {
    pub const fn from_raw(raw: u16) -> Option<Self> {
        Some(match raw {
            0x1 => Self::MaskSwap,
            0x2 => Self::CompareSwap,
            0x3 => Self::FetchAdd,
            0x4 => Self::LittleAdd,
            0x5 => Self::BoundedAdd,
            0x6 => Self::WrapAdd,
            _ => return None,
        })
    }

    pub const fn raw(self) -> u16 {
        self as u16
    }

    /// Fetch-add and little-add carry a single operand; every other lock carries an
    /// `(arg, data)` pair.
    pub const fn has_single_operand(self) -> bool {
        matches!(self, Self::FetchAdd | Self::LittleAdd)
    }
}

/// Transmission speed. The discriminant is the speed code used in Self-IDs and speed maps.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub enum Speed {
    #[default]
    S100 = 0,
    S200 = 1,
    S400 = 2,
    S800 = 3,
    S1600 = 4,
    S3200 = 5,
}

impl Speed {
    pub const MAX: Self = Self::S3200;

    pub const fn from_code(code: u8) -> Option<Self> {
        Some(match code {
            0 => Self::S100,
            1 => Self::S200,
            2 => Self::S400,
            3 => Self::S800,
            4 => Self::S1600,
            5 => Self::S3200,
            _ => return None,
        })
    }

    pub const fn code(self) -> u8 {
        self as u8
    }

    /// Nominal rate in Mbit/s.
    pub const fn mbps(self) -> u32 {
        100 << (self as u32)
    }
}

impl fmt::Display for Speed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "S{}", self.mbps())
    }
}
