//! CAN frame transports feeding an [`IsoTpSession`](crate::IsoTpSession)
//!
//! - SocketCAN raw sockets (Linux only)
//! - In-memory mock bus for tests and offline use

mod adapter;
pub mod error;
pub mod mock;

#[cfg(all(target_os = "linux", feature = "socketcan"))]
pub mod socketcan;

pub use adapter::{FrameTransport, TransportFactory};
pub use error::TransportError;

use tokio::sync::broadcast;

use crate::frame::CanFrame;

/// Capacity of each transport's inbound frame channel
pub const INCOMING_CHANNEL_CAPACITY: usize = 1024;

/// A receiver whose channel is already closed, handed out after `close()`
pub(crate) fn closed_receiver() -> broadcast::Receiver<CanFrame> {
    let (_tx, rx) = broadcast::channel(1);
    rx
}

/// Open the platform's real CAN transport
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemTransportFactory;

#[async_trait::async_trait]
impl TransportFactory for SystemTransportFactory {
    async fn open(
        &self,
        interface: &str,
    ) -> Result<std::sync::Arc<dyn FrameTransport>, TransportError> {
        #[cfg(all(target_os = "linux", feature = "socketcan"))]
        {
            let transport = socketcan::SocketCanTransport::open(interface).await?;
            Ok(std::sync::Arc::new(transport))
        }
        #[cfg(not(all(target_os = "linux", feature = "socketcan")))]
        {
            Err(TransportError::Unsupported(format!(
                "cannot open {}: SocketCAN requires Linux and the 'socketcan' feature",
                interface
            )))
        }
    }
}
