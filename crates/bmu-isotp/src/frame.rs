//! Classic CAN frames and ISO-TP protocol control information (PCI)
//!
//! Frame layouts (byte #0 high nibble is the PCI type):
//!
//! ```text
//! Single      | 0 | SF_DL |  data[0..7]                     |
//! First       | 1 | FF_DL (12 bit)    |  data[0..6]         |
//! Consecutive | 2 | SN    |  data[0..7]                     |
//! FlowControl | 3 | FS    |  BS       |  STmin  |  reserved |
//! ```

use std::fmt;

/// Maximum data length of a classic CAN frame
pub const MAX_DATA_LEN: usize = 8;

/// Largest payload a Single Frame can carry
pub const SINGLE_FRAME_MAX: usize = 7;

/// Payload bytes carried by a First Frame
pub const FIRST_FRAME_DATA: usize = 6;

/// Payload bytes carried by a full Consecutive Frame
pub const CONSECUTIVE_FRAME_DATA: usize = 7;

/// Largest message expressible in the 12-bit First Frame length field
pub const MAX_MESSAGE_LEN: usize = 0x0FFF;

/// CAN arbitration identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CanId {
    /// 11-bit identifier
    Standard(u16),
    /// 29-bit identifier
    Extended(u32),
}

impl CanId {
    pub fn standard(raw: u16) -> Option<Self> {
        (raw <= 0x7FF).then_some(Self::Standard(raw))
    }

    pub fn extended(raw: u32) -> Option<Self> {
        (raw <= 0x1FFF_FFFF).then_some(Self::Extended(raw))
    }

    /// Raw numeric identifier without the format flag
    pub fn raw(&self) -> u32 {
        match *self {
            Self::Standard(raw) => raw as u32,
            Self::Extended(raw) => raw,
        }
    }

    pub fn is_extended(&self) -> bool {
        matches!(self, Self::Extended(_))
    }
}

impl fmt::Display for CanId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Self::Standard(raw) => write!(f, "0x{:03X}", raw),
            Self::Extended(raw) => write!(f, "0x{:08X}", raw),
        }
    }
}

/// A classic CAN data frame: identifier plus 0-8 data bytes
#[derive(Clone, Copy)]
pub struct CanFrame {
    id: CanId,
    len: u8,
    data: [u8; MAX_DATA_LEN],
}

impl CanFrame {
    /// Create a frame, or `None` if `data` is longer than 8 bytes
    pub fn new(id: CanId, data: &[u8]) -> Option<Self> {
        if data.len() > MAX_DATA_LEN {
            return None;
        }
        let mut bytes = [0u8; MAX_DATA_LEN];
        bytes[..data.len()].copy_from_slice(data);
        Some(Self {
            id,
            len: data.len() as u8,
            data: bytes,
        })
    }

    pub fn id(&self) -> CanId {
        self.id
    }

    pub fn data(&self) -> &[u8] {
        &self.data[..self.len as usize]
    }

    pub fn len(&self) -> usize {
        self.len as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl PartialEq for CanFrame {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id && self.data() == other.data()
    }
}

impl Eq for CanFrame {}

impl fmt::Debug for CanFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CanFrame({} [{}])", self.id, hex::encode(self.data()))
    }
}

/// ISO-TP frame type, from the high nibble of the first data byte
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    Single,
    First,
    Consecutive,
    FlowControl,
}

impl FrameKind {
    pub fn from_pci(byte0: u8) -> Option<Self> {
        match byte0 >> 4 {
            0x0 => Some(Self::Single),
            0x1 => Some(Self::First),
            0x2 => Some(Self::Consecutive),
            0x3 => Some(Self::FlowControl),
            _ => None,
        }
    }

    fn pci_nibble(self) -> u8 {
        match self {
            Self::Single => 0x0,
            Self::First => 0x1,
            Self::Consecutive => 0x2,
            Self::FlowControl => 0x3,
        }
    }
}

impl fmt::Display for FrameKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Single => "single",
            Self::First => "first",
            Self::Consecutive => "consecutive",
            Self::FlowControl => "flow control",
        };
        f.write_str(s)
    }
}

/// Flow Control status (FS)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowStatus {
    Continue = 0x0,
    Wait = 0x1,
    Overflow = 0x2,
}

impl FlowStatus {
    pub fn from_nibble(nibble: u8) -> Option<Self> {
        match nibble {
            0x0 => Some(Self::Continue),
            0x1 => Some(Self::Wait),
            0x2 => Some(Self::Overflow),
            _ => None,
        }
    }
}

/// Decode a wire STmin byte into whole milliseconds.
///
/// 0x00-0x7F are milliseconds, 0xF1-0xF9 (100-900 µs) round up to 1 ms,
/// reserved values are treated as 0.
pub fn st_min_to_ms(st_min: u8) -> u8 {
    match st_min {
        0x00..=0x7F => st_min,
        0xF1..=0xF9 => 1,
        _ => 0,
    }
}

/// Encode milliseconds as a wire STmin byte, capped at 127 ms
pub fn ms_to_st_min(ms: u8) -> u8 {
    ms.min(0x7F)
}

/// Assemble a frame from a PCI byte and body, padding to 8 bytes if requested
fn assemble(id: CanId, header: &[u8], body: &[u8], padding: Option<u8>) -> CanFrame {
    let mut data = [padding.unwrap_or(0); MAX_DATA_LEN];
    data[..header.len()].copy_from_slice(header);
    data[header.len()..header.len() + body.len()].copy_from_slice(body);
    let len = match padding {
        Some(_) => MAX_DATA_LEN,
        None => header.len() + body.len(),
    };
    CanFrame {
        id,
        len: len as u8,
        data,
    }
}

pub(crate) fn single_frame(id: CanId, payload: &[u8], padding: Option<u8>) -> CanFrame {
    debug_assert!(!payload.is_empty() && payload.len() <= SINGLE_FRAME_MAX);
    let pci = (FrameKind::Single.pci_nibble() << 4) | payload.len() as u8;
    assemble(id, &[pci], payload, padding)
}

pub(crate) fn first_frame(id: CanId, total_len: usize, head: &[u8]) -> CanFrame {
    debug_assert!(total_len > SINGLE_FRAME_MAX && total_len <= MAX_MESSAGE_LEN);
    debug_assert_eq!(head.len(), FIRST_FRAME_DATA);
    let header = [
        (FrameKind::First.pci_nibble() << 4) | ((total_len >> 8) as u8 & 0x0F),
        total_len as u8,
    ];
    assemble(id, &header, head, None)
}

pub(crate) fn consecutive_frame(
    id: CanId,
    sequence: u8,
    chunk: &[u8],
    padding: Option<u8>,
) -> CanFrame {
    debug_assert!(chunk.len() <= CONSECUTIVE_FRAME_DATA);
    let pci = (FrameKind::Consecutive.pci_nibble() << 4) | (sequence & 0x0F);
    assemble(id, &[pci], chunk, padding)
}

pub(crate) fn flow_control(
    id: CanId,
    status: FlowStatus,
    block_size: u8,
    st_min_ms: u8,
    padding: Option<u8>,
) -> CanFrame {
    let header = [
        (FrameKind::FlowControl.pci_nibble() << 4) | status as u8,
        block_size,
        ms_to_st_min(st_min_ms),
    ];
    assemble(id, &header, &[], padding)
}
