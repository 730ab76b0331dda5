//! bmu-isotp - ISO-TP transport engine for the BMU calibration channel
//!
//! Segments outbound byte buffers into CAN frames and reassembles inbound
//! CAN frames into byte buffers (ISO 15765-2 normal addressing, classic CAN).
//! The crate never interprets payload contents.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      IsoTpSession                           │
//! │  One reactor task: poll tick, inbound frames, send requests │
//! │                                                             │
//! │                    ┌───────────┐                            │
//! │                    │   Link    │                            │
//! │                    │ (send/rcv │                            │
//! │                    │  state)   │                            │
//! │                    └─────┬─────┘                            │
//! │                          │                                  │
//! │                 ┌────────┴────────┐                         │
//! │                 │ FrameTransport  │                         │
//! │                 │ (SocketCAN/mock)│                         │
//! │                 └─────────────────┘                         │
//! └─────────────────────────────────────────────────────────────┘
//! ```

pub mod buffer;
pub mod config;
pub mod error;
pub mod frame;
pub mod link;
pub mod session;
pub mod transport;

pub use buffer::{CapacityError, FixedBuffer};
pub use config::{parse_can_id, LinkConfig};
pub use error::{ConfigError, IsoTpError};
pub use frame::{CanFrame, CanId, FlowStatus, FrameKind};
pub use link::{Link, LinkEvent, ReceiveStatus, SendStatus};
pub use session::{IsoTpSession, SessionError, SessionEvent};
pub use transport::{FrameTransport, TransportError, TransportFactory};
