//! Wire protocol: frame layout, command numbering, codec and comm handler.
//!
//! Request frames: `command_id, subfunction_id, data_length:u16, data, crc:u32`.
//! Response frames carry an extra `response_code` byte after the subfunction
//! and set the high bit of the command byte. All multi-byte integers are
//! big-endian; the CRC covers every preceding byte of the frame.

pub mod codec;
pub mod comm;

/// Set on the command byte of every response so a response can never be
/// mistaken for a request echo.
pub const RESPONSE_FLAG: u8 = 0x80;

/// cmd + subfn + len.
pub const REQUEST_HEADER_SIZE: usize = 4;
/// cmd + subfn + code + len.
pub const RESPONSE_HEADER_SIZE: usize = 5;
pub const CRC_SIZE: usize = 4;

/// Sent by the host in a Discover request and echoed back in the response.
pub const DISCOVER_MAGIC: [u8; 16] = [
    0x7E, 0x18, 0xFC, 0x9D, 0xAE, 0x52, 0x30, 0x6B, 0x84, 0xC1, 0x5D, 0x27, 0xF0, 0x39, 0x6E,
    0xB2,
];

/// Sent by the host in a Connect request.
pub const CONNECT_MAGIC: [u8; 4] = [0x82, 0x90, 0x22, 0x66];

pub const DISCOVER_CHALLENGE_SIZE: usize = 4;

#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum CommandId {
    GetInfo = 1,
    CommControl = 2,
    MemoryControl = 3,
    /// Reserved for the data-logging subsystem.
    DataLogControl = 4,
    /// Reserved for application-defined commands.
    UserCommand = 5,
}

impl CommandId {
    pub fn from_u8(raw: u8) -> Option<Self> {
        match raw {
            1 => Some(Self::GetInfo),
            2 => Some(Self::CommControl),
            3 => Some(Self::MemoryControl),
            4 => Some(Self::DataLogControl),
            5 => Some(Self::UserCommand),
            _ => None,
        }
    }
}

#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum GetInfoSubfunction {
    ProtocolVersion = 1,
    SoftwareId = 2,
    SupportedFeatures = 3,
}

impl GetInfoSubfunction {
    pub fn from_u8(raw: u8) -> Option<Self> {
        match raw {
            1 => Some(Self::ProtocolVersion),
            2 => Some(Self::SoftwareId),
            3 => Some(Self::SupportedFeatures),
            _ => None,
        }
    }
}

#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum CommControlSubfunction {
    Discover = 1,
    Heartbeat = 2,
    GetParams = 3,
    Connect = 4,
    Disconnect = 5,
}

impl CommControlSubfunction {
    pub fn from_u8(raw: u8) -> Option<Self> {
        match raw {
            1 => Some(Self::Discover),
            2 => Some(Self::Heartbeat),
            3 => Some(Self::GetParams),
            4 => Some(Self::Connect),
            5 => Some(Self::Disconnect),
            _ => None,
        }
    }
}

#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum MemoryControlSubfunction {
    Read = 1,
    Write = 2,
}

impl MemoryControlSubfunction {
    pub fn from_u8(raw: u8) -> Option<Self> {
        match raw {
            1 => Some(Self::Read),
            2 => Some(Self::Write),
            _ => None,
        }
    }
}

#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum ResponseCode {
    Ok = 0,
    InvalidRequest = 1,
    UnsupportedFeature = 2,
    Overflow = 3,
    Busy = 4,
    FailureToProceed = 5,
    Forbidden = 6,
}

/// A fully assembled, CRC-verified request, borrowed from the RX buffer for
/// the duration of one dispatch.
#[derive(Debug)]
pub struct Request<'a> {
    pub command_id: u8,
    pub subfunction_id: u8,
    pub data: &'a [u8],
}

/// Staging area for the response payload, borrowed from the TX buffer for
/// the duration of one dispatch. `data_length` tracks how much of `data` a
/// subhandler has filled in.
#[derive(Debug)]
pub struct Response<'a> {
    pub command_id: u8,
    pub subfunction_id: u8,
    pub data_length: u16,
    pub data: &'a mut [u8],
}
