//! Frame transport traits

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::broadcast;

use super::TransportError;
use crate::frame::CanFrame;

/// A raw CAN frame channel bound to one network interface
///
/// Implementations deliver every frame seen on the bus (except their own
/// transmissions) to all subscribers. Once closed, `send_frame` fails and
/// subscribers observe a closed channel.
#[async_trait]
pub trait FrameTransport: Send + Sync {
    /// Write one frame to the bus
    async fn send_frame(&self, frame: &CanFrame) -> Result<(), TransportError>;

    /// Subscribe to inbound frames
    fn subscribe(&self) -> broadcast::Receiver<CanFrame>;

    /// Interface name, e.g. `can0`
    fn interface(&self) -> &str;

    fn is_open(&self) -> bool;

    /// Stop delivering frames and release the underlying socket
    async fn close(&self);
}

/// Opens a [`FrameTransport`] once an interface is up
#[async_trait]
pub trait TransportFactory: Send + Sync {
    async fn open(&self, interface: &str) -> Result<Arc<dyn FrameTransport>, TransportError>;
}
