//! ISO-TP engine errors

use thiserror::Error;

use crate::buffer::CapacityError;
use crate::frame::FrameKind;

/// Transport protocol errors reported by a [`Link`](crate::Link)
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum IsoTpError {
    #[error("Payload of {len} bytes exceeds send buffer capacity {capacity}")]
    PayloadTooLarge { len: usize, capacity: usize },

    #[error("Transmission already in progress")]
    Busy,

    #[error("Length error: {0}")]
    LengthError(&'static str),

    #[error("Wrong sequence number: expected {expected}, got {got}")]
    WrongSequenceNumber { expected: u8, got: u8 },

    #[error("Message of {len} bytes overflows receive buffer capacity {capacity}")]
    Overflow { len: usize, capacity: usize },

    #[error("Receiver reported buffer overflow")]
    RemoteOverflow,

    #[error("Unexpected {0} frame")]
    UnexpectedFrame(FrameKind),

    #[error("Invalid flow status 0x{0:X}")]
    InvalidFlowStatus(u8),

    #[error("Unknown PCI type 0x{0:X}")]
    UnknownFrameType(u8),

    #[error("Timeout waiting for flow control")]
    TimeoutWaitingForFlowControl,

    #[error("Timeout waiting for consecutive frame")]
    TimeoutWaitingForConsecutiveFrame,

    #[error("More than {0} flow control wait frames")]
    WaitFrameLimitExceeded(u8),

    #[error("No completed message")]
    NoData,
}

impl From<CapacityError> for IsoTpError {
    fn from(err: CapacityError) -> Self {
        IsoTpError::Overflow {
            len: err.offset + err.requested,
            capacity: err.capacity,
        }
    }
}

/// Link configuration errors
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Invalid CAN ID '{0}'")]
    InvalidCanId(String),

    #[error("Buffer capacity {0} outside 1..=4095")]
    InvalidCapacity(usize),

    #[error("Request and response IDs are both {0}")]
    SameIds(String),
}
