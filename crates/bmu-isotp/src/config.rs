//! Link configuration and protocol timing constants

use std::time::Duration;

use crate::error::ConfigError;
use crate::frame::{CanId, MAX_MESSAGE_LEN};

/// Block size advertised in our Flow Control frames
pub const DEFAULT_BLOCK_SIZE: u8 = 8;

/// STmin (ms) advertised in our Flow Control frames
pub const DEFAULT_ST_MIN_MS: u8 = 0;

/// Maximum number of consecutive FC.Wait frames accepted from the receiver
pub const MAX_WAIT_FRAMES: u8 = 10;

/// Timeout waiting for a Flow Control (N_Bs) or Consecutive Frame (N_Cr)
pub const RESPONSE_TIMEOUT: Duration = Duration::from_millis(1000);

/// Interval of the periodic poll tick driving consecutive frame emission
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(5);

/// Configuration of one ISO-TP link (a request/response ID pair)
#[derive(Debug, Clone)]
pub struct LinkConfig {
    /// ID we transmit on (viewer -> BMU)
    pub tx_id: CanId,
    /// ID we receive on (BMU -> viewer)
    pub rx_id: CanId,
    /// Send buffer capacity in bytes
    pub send_capacity: usize,
    /// Receive buffer capacity in bytes
    pub receive_capacity: usize,
    /// Block size advertised when receiving (0 = unlimited)
    pub block_size: u8,
    /// STmin advertised when receiving, in milliseconds
    pub st_min_ms: u8,
    /// Pad transmitted frames to 8 bytes with this value
    pub padding: Option<u8>,
}

impl LinkConfig {
    pub fn new(tx_id: CanId, rx_id: CanId) -> Self {
        Self {
            tx_id,
            rx_id,
            send_capacity: MAX_MESSAGE_LEN,
            receive_capacity: MAX_MESSAGE_LEN,
            block_size: DEFAULT_BLOCK_SIZE,
            st_min_ms: DEFAULT_ST_MIN_MS,
            padding: None,
        }
    }

    pub fn with_capacity(mut self, send: usize, receive: usize) -> Self {
        self.send_capacity = send;
        self.receive_capacity = receive;
        self
    }

    pub fn with_block_size(mut self, block_size: u8) -> Self {
        self.block_size = block_size;
        self
    }

    pub fn with_st_min_ms(mut self, st_min_ms: u8) -> Self {
        self.st_min_ms = st_min_ms;
        self
    }

    pub fn with_padding(mut self, padding: Option<u8>) -> Self {
        self.padding = padding;
        self
    }

    /// Reject capacities the 12-bit length field cannot express and mirrored IDs
    pub fn validate(&self) -> Result<(), ConfigError> {
        for capacity in [self.send_capacity, self.receive_capacity] {
            if capacity == 0 || capacity > MAX_MESSAGE_LEN {
                return Err(ConfigError::InvalidCapacity(capacity));
            }
        }
        if self.tx_id == self.rx_id {
            return Err(ConfigError::SameIds(self.tx_id.to_string()));
        }
        Ok(())
    }
}

/// Parse a CAN ID from string (hex with 0x prefix, or decimal).
///
/// Values above 0x7FF become 29-bit identifiers.
pub fn parse_can_id(s: &str) -> Result<CanId, ConfigError> {
    let trimmed = s.trim();
    let (digits, radix) = match trimmed
        .strip_prefix("0x")
        .or_else(|| trimmed.strip_prefix("0X"))
    {
        Some(hex) => (hex, 16),
        None => (trimmed, 10),
    };

    let raw = u32::from_str_radix(digits, radix)
        .map_err(|_| ConfigError::InvalidCanId(s.to_string()))?;

    match u16::try_from(raw).ok().and_then(CanId::standard) {
        Some(id) => Ok(id),
        None => CanId::extended(raw).ok_or_else(|| ConfigError::InvalidCanId(s.to_string())),
    }
}
