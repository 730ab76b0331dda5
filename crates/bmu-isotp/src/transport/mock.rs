//! In-memory CAN bus for testing
//!
//! Every [`MockTransport`] attached to a [`MockBus`] sees the frames the
//! others send, like nodes on a real bus. A node never receives its own
//! transmissions.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use tokio::sync::broadcast;

use super::{
    closed_receiver, FrameTransport, TransportError, TransportFactory, INCOMING_CHANNEL_CAPACITY,
};
use crate::frame::CanFrame;

struct Node {
    id: usize,
    incoming: broadcast::Sender<CanFrame>,
}

#[derive(Default)]
struct BusInner {
    nodes: RwLock<Vec<Node>>,
    next_id: AtomicUsize,
    /// Every frame put on the bus, in order
    log: Mutex<Vec<CanFrame>>,
    reject_opens: AtomicBool,
}

impl BusInner {
    fn deliver(&self, from: Option<usize>, frame: &CanFrame) {
        self.log.lock().push(*frame);
        for node in self.nodes.read().iter() {
            if Some(node.id) != from {
                // No subscribers is fine
                let _ = node.incoming.send(*frame);
            }
        }
    }

    fn detach(&self, id: usize) {
        self.nodes.write().retain(|node| node.id != id);
    }
}

/// Shared in-memory bus
#[derive(Clone, Default)]
pub struct MockBus {
    inner: Arc<BusInner>,
}

impl MockBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a new node to the bus
    pub fn attach(&self, interface: &str) -> Arc<MockTransport> {
        let id = self.inner.next_id.fetch_add(1, Ordering::SeqCst);
        let (incoming, _) = broadcast::channel(INCOMING_CHANNEL_CAPACITY);
        self.inner.nodes.write().push(Node {
            id,
            incoming: incoming.clone(),
        });
        tracing::debug!(interface, node = id, "Mock transport attached");
        Arc::new(MockTransport {
            id,
            interface: interface.to_string(),
            bus: self.inner.clone(),
            incoming: Mutex::new(Some(incoming)),
            open: AtomicBool::new(true),
            sent: Mutex::new(Vec::new()),
            fail_sends: AtomicBool::new(false),
        })
    }

    /// Put a frame on the bus from outside any attached node
    pub fn inject(&self, frame: CanFrame) {
        self.inner.deliver(None, &frame);
    }

    /// All frames seen on the bus so far
    pub fn frames(&self) -> Vec<CanFrame> {
        self.inner.log.lock().clone()
    }

    /// Make subsequent `open` calls fail (simulates a missing interface)
    pub fn reject_opens(&self, reject: bool) {
        self.inner.reject_opens.store(reject, Ordering::SeqCst);
    }

    pub fn node_count(&self) -> usize {
        self.inner.nodes.read().len()
    }
}

#[async_trait]
impl TransportFactory for MockBus {
    async fn open(&self, interface: &str) -> Result<Arc<dyn FrameTransport>, TransportError> {
        if self.inner.reject_opens.load(Ordering::SeqCst) {
            return Err(TransportError::ConnectionFailed(format!(
                "mock interface {} unavailable",
                interface
            )));
        }
        Ok(self.attach(interface))
    }
}

/// One node on a [`MockBus`]
pub struct MockTransport {
    id: usize,
    interface: String,
    bus: Arc<BusInner>,
    incoming: Mutex<Option<broadcast::Sender<CanFrame>>>,
    open: AtomicBool,
    sent: Mutex<Vec<CanFrame>>,
    fail_sends: AtomicBool,
}

impl MockTransport {
    /// Frames this node has sent
    pub fn sent_frames(&self) -> Vec<CanFrame> {
        self.sent.lock().clone()
    }

    /// Deliver a frame to this node only
    pub fn inject(&self, frame: CanFrame) {
        if let Some(tx) = self.incoming.lock().as_ref() {
            let _ = tx.send(frame);
        }
    }

    /// Make subsequent sends fail without closing the transport
    pub fn set_fail_sends(&self, fail: bool) {
        self.fail_sends.store(fail, Ordering::SeqCst);
    }

    fn shutdown(&self) {
        self.open.store(false, Ordering::SeqCst);
        self.bus.detach(self.id);
        self.incoming.lock().take();
    }
}

#[async_trait]
impl FrameTransport for MockTransport {
    async fn send_frame(&self, frame: &CanFrame) -> Result<(), TransportError> {
        if !self.open.load(Ordering::SeqCst) {
            return Err(TransportError::ConnectionClosed);
        }
        if self.fail_sends.load(Ordering::SeqCst) {
            return Err(TransportError::SendFailed("mock send failure".to_string()));
        }

        tracing::trace!(?frame, node = self.id, "Mock transport: sent frame");
        self.sent.lock().push(*frame);
        self.bus.deliver(Some(self.id), frame);
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<CanFrame> {
        match self.incoming.lock().as_ref() {
            Some(tx) => tx.subscribe(),
            None => closed_receiver(),
        }
    }

    fn interface(&self) -> &str {
        &self.interface
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    async fn close(&self) {
        self.shutdown();
    }
}

impl Drop for MockTransport {
    fn drop(&mut self) {
        self.shutdown();
    }
}
