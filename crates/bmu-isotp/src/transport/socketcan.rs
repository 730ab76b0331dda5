//! Raw SocketCAN transport (Linux only)

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use ::socketcan::{
    CanFrame as RawFrame, CanSocket, EmbeddedFrame, ExtendedId, Id, Socket, StandardId,
};
use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use super::{
    closed_receiver, FrameTransport, TransportError, INCOMING_CHANNEL_CAPACITY,
};
use crate::frame::{CanFrame, CanId};

struct Shared {
    socket: Mutex<CanSocket>,
    incoming: Mutex<Option<broadcast::Sender<CanFrame>>>,
    open: AtomicBool,
}

impl Shared {
    fn shutdown(&self) {
        self.open.store(false, Ordering::SeqCst);
        self.incoming.lock().take();
    }
}

/// Raw CAN socket bound to one interface
pub struct SocketCanTransport {
    interface: String,
    shared: Arc<Shared>,
    listener_handle: Mutex<Option<JoinHandle<()>>>,
}

impl SocketCanTransport {
    pub async fn open(interface: &str) -> Result<Self, TransportError> {
        let socket = CanSocket::open(interface).map_err(|e| {
            TransportError::ConnectionFailed(format!(
                "Failed to open raw CAN socket on {}: {}",
                interface, e
            ))
        })?;

        // Non-blocking so the listener can release the lock between reads
        socket
            .set_nonblocking(true)
            .map_err(|e| TransportError::InvalidConfig(format!("Failed to set non-blocking: {}", e)))?;

        let (incoming_tx, _) = broadcast::channel(INCOMING_CHANNEL_CAPACITY);

        let transport = Self {
            interface: interface.to_string(),
            shared: Arc::new(Shared {
                socket: Mutex::new(socket),
                incoming: Mutex::new(Some(incoming_tx)),
                open: AtomicBool::new(true),
            }),
            listener_handle: Mutex::new(None),
        };
        transport.start_listener();

        tracing::info!(interface, "SocketCAN transport opened");
        Ok(transport)
    }

    fn start_listener(&self) {
        let shared = self.shared.clone();
        let interface = self.interface.clone();

        let handle = tokio::task::spawn_blocking(move || {
            while shared.open.load(Ordering::SeqCst) {
                let result = shared.socket.lock().read_frame();
                match result {
                    Ok(raw @ RawFrame::Data(_)) => {
                        let Some(frame) = from_raw(&raw) else {
                            continue;
                        };
                        tracing::trace!(?frame, "Incoming CAN frame");
                        if let Some(tx) = shared.incoming.lock().as_ref() {
                            // No receivers, but that's okay
                            let _ = tx.send(frame);
                        }
                    }
                    Ok(_) => {
                        // Remote and error frames carry nothing for ISO-TP
                    }
                    Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                        std::thread::sleep(Duration::from_millis(1));
                    }
                    Err(e) => {
                        // The interface went away (link down, adapter unplugged)
                        tracing::error!(interface = %interface, error = %e, "SocketCAN read error");
                        shared.shutdown();
                    }
                }
            }
            tracing::debug!(interface = %interface, "SocketCAN listener stopped");
        });

        *self.listener_handle.lock() = Some(handle);
    }
}

fn to_raw(frame: &CanFrame) -> Result<RawFrame, TransportError> {
    let id = match frame.id() {
        CanId::Standard(raw) => StandardId::new(raw).map(Id::Standard),
        CanId::Extended(raw) => ExtendedId::new(raw).map(Id::Extended),
    }
    .ok_or_else(|| TransportError::InvalidFrame(format!("CAN ID {} out of range", frame.id())))?;

    <RawFrame as EmbeddedFrame>::new(id, frame.data())
        .ok_or_else(|| TransportError::InvalidFrame(format!("{:?}", frame)))
}

fn from_raw(frame: &RawFrame) -> Option<CanFrame> {
    let id = match EmbeddedFrame::id(frame) {
        Id::Standard(id) => CanId::Standard(id.as_raw()),
        Id::Extended(id) => CanId::Extended(id.as_raw()),
    };
    CanFrame::new(id, EmbeddedFrame::data(frame))
}

#[async_trait]
impl FrameTransport for SocketCanTransport {
    async fn send_frame(&self, frame: &CanFrame) -> Result<(), TransportError> {
        if !self.is_open() {
            return Err(TransportError::ConnectionClosed);
        }

        let raw = to_raw(frame)?;
        let shared = self.shared.clone();

        tokio::task::spawn_blocking(move || {
            let socket = shared.socket.lock();
            socket
                .write_frame(&raw)
                .map_err(|e| TransportError::SendFailed(e.to_string()))
        })
        .await
        .map_err(|e| TransportError::SendFailed(format!("Task join error: {}", e)))?
    }

    fn subscribe(&self) -> broadcast::Receiver<CanFrame> {
        match self.shared.incoming.lock().as_ref() {
            Some(tx) => tx.subscribe(),
            None => closed_receiver(),
        }
    }

    fn interface(&self) -> &str {
        &self.interface
    }

    fn is_open(&self) -> bool {
        self.shared.open.load(Ordering::SeqCst)
    }

    async fn close(&self) {
        self.shared.shutdown();
        let handle = self.listener_handle.lock().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
        tracing::info!(interface = %self.interface, "SocketCAN transport closed");
    }
}

impl Drop for SocketCanTransport {
    fn drop(&mut self) {
        self.shared.shutdown();
    }
}
