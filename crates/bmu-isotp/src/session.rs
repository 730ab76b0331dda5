//! Async ISO-TP session: one reactor task driving a [`Link`] over a transport

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::config::LinkConfig;
use crate::error::{ConfigError, IsoTpError};
use crate::frame::{CanFrame, CanId, FrameKind};
use crate::link::{Link, LinkEvent, ReceiveStatus, SendStatus};
use crate::transport::{FrameTransport, TransportError};

const EVENT_CHANNEL_CAPACITY: usize = 256;
const COMMAND_CHANNEL_CAPACITY: usize = 32;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error(transparent)]
    IsoTp(#[from] IsoTpError),

    #[error("Invalid link configuration: {0}")]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("Session closed")]
    Closed,

    #[error("Timed out waiting for response")]
    Timeout,
}

/// Notifications broadcast by the session task
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// A complete inbound message
    Message(Vec<u8>),
    /// The last outbound message left the link completely
    SendComplete,
    SendFailed(IsoTpError),
    ReceiveFailed(IsoTpError),
    /// Writing to or reading from the transport failed; the session stops
    TransportFailed(TransportError),
}

enum Command {
    Send {
        id: Option<CanId>,
        payload: Vec<u8>,
        reply: oneshot::Sender<Result<(), IsoTpError>>,
    },
}

/// Handle to a running ISO-TP session
pub struct IsoTpSession {
    commands: mpsc::Sender<Command>,
    events: broadcast::Sender<SessionEvent>,
    transport: Arc<dyn FrameTransport>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl IsoTpSession {
    /// Validate `config` and start the reactor task
    pub fn open(
        transport: Arc<dyn FrameTransport>,
        config: LinkConfig,
        poll_interval: Duration,
    ) -> Result<Self, SessionError> {
        config.validate()?;

        let (commands, command_rx) = mpsc::channel(COMMAND_CHANNEL_CAPACITY);
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);

        info!(
            interface = transport.interface(),
            tx_id = %config.tx_id,
            rx_id = %config.rx_id,
            "ISO-TP session opened"
        );

        let reactor = Reactor {
            link: Link::new(config),
            transport: transport.clone(),
            events: events.clone(),
            pending: Vec::new(),
        };
        // Subscribe here so no frame is missed before the task first runs
        let frames = transport.subscribe();
        let task = tokio::spawn(reactor.run(frames, command_rx, poll_interval));

        Ok(Self {
            commands,
            events,
            transport,
            task: Mutex::new(Some(task)),
        })
    }

    /// Hand a payload to the link. Resolves once it was accepted or rejected.
    pub async fn send(&self, payload: &[u8]) -> Result<(), SessionError> {
        self.submit(None, payload).await
    }

    /// Like [`send`](Self::send) with an explicit ID for the single/first frame
    pub async fn send_with_id(&self, id: CanId, payload: &[u8]) -> Result<(), SessionError> {
        self.submit(Some(id), payload).await
    }

    /// Send a payload and wait for the next complete inbound message
    pub async fn send_receive(
        &self,
        payload: &[u8],
        timeout: Duration,
    ) -> Result<Vec<u8>, SessionError> {
        // Subscribe before sending so a fast response is not missed
        let mut events = self.subscribe();
        self.send(payload).await?;

        let wait = async {
            loop {
                match events.recv().await {
                    Ok(SessionEvent::Message(data)) => return Ok(data),
                    Ok(SessionEvent::SendFailed(err)) => return Err(SessionError::IsoTp(err)),
                    Ok(SessionEvent::TransportFailed(err)) => {
                        return Err(SessionError::Transport(err))
                    }
                    Ok(_) => continue,
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(skipped, "Session event receiver lagged");
                        continue;
                    }
                    Err(RecvError::Closed) => return Err(SessionError::Closed),
                }
            }
        };

        tokio::time::timeout(timeout, wait)
            .await
            .map_err(|_| SessionError::Timeout)?
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    pub fn transport(&self) -> &Arc<dyn FrameTransport> {
        &self.transport
    }

    pub fn is_running(&self) -> bool {
        self.task
            .lock()
            .as_ref()
            .is_some_and(|task| !task.is_finished())
    }

    /// Stop the reactor and abandon any in-flight transfer
    pub async fn close(&self) {
        let task = self.task.lock().take();
        if let Some(task) = task {
            task.abort();
            let _ = task.await;
            info!(interface = self.transport.interface(), "ISO-TP session closed");
        }
    }

    async fn submit(&self, id: Option<CanId>, payload: &[u8]) -> Result<(), SessionError> {
        let (reply, reply_rx) = oneshot::channel();
        self.commands
            .send(Command::Send {
                id,
                payload: payload.to_vec(),
                reply,
            })
            .await
            .map_err(|_| SessionError::Closed)?;

        reply_rx
            .await
            .map_err(|_| SessionError::Closed)?
            .map_err(SessionError::from)
    }
}

impl Drop for IsoTpSession {
    fn drop(&mut self) {
        if let Some(task) = self.task.lock().take() {
            task.abort();
        }
    }
}

struct Reactor {
    link: Link,
    transport: Arc<dyn FrameTransport>,
    events: broadcast::Sender<SessionEvent>,
    /// Events published once the frames they depend on are written
    pending: Vec<SessionEvent>,
}

impl Reactor {
    async fn run(
        mut self,
        mut frames: broadcast::Receiver<CanFrame>,
        mut commands: mpsc::Receiver<Command>,
        poll_interval: Duration,
    ) {
        let mut ticker = interval(poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            let outcome = tokio::select! {
                _ = ticker.tick() => {
                    for event in self.link.poll() {
                        self.emit_link_event(event);
                    }
                    Ok(())
                }
                frame = frames.recv() => match frame {
                    Ok(frame) => {
                        self.on_frame(&frame);
                        Ok(())
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(skipped, "Inbound CAN frames dropped");
                        Ok(())
                    }
                    Err(RecvError::Closed) => Err(TransportError::ConnectionClosed),
                },
                command = commands.recv() => match command {
                    Some(command) => {
                        self.on_command(command);
                        Ok(())
                    }
                    // Every handle is gone
                    None => break,
                },
            };

            let flushed = match outcome {
                Ok(()) => self.flush().await,
                Err(err) => Err(err),
            };

            match flushed {
                Ok(()) => self.publish(),
                Err(err) => {
                    warn!(error = %err, "Transport failed, stopping ISO-TP session");
                    self.link.reset();
                    self.pending.clear();
                    let _ = self.events.send(SessionEvent::TransportFailed(err));
                    break;
                }
            }
        }

        debug!("ISO-TP session reactor stopped");
    }

    fn on_frame(&mut self, frame: &CanFrame) {
        // Flow control only ever concerns the send side
        let flow_control = frame.data().first().and_then(|&pci| FrameKind::from_pci(pci))
            == Some(FrameKind::FlowControl);

        if let Err(err) = self.link.on_can_message(frame) {
            if flow_control {
                debug!(error = %err, ?frame, "Flow control rejected");
                self.pending.push(SessionEvent::SendFailed(err));
            } else {
                debug!(error = %err, ?frame, "Inbound frame rejected");
                self.pending.push(SessionEvent::ReceiveFailed(err));
            }
        }

        if self.link.receive_status() == ReceiveStatus::Full {
            if let Ok(message) = self.link.receive() {
                debug!(len = message.len(), "ISO-TP message received");
                self.pending.push(SessionEvent::Message(message));
            }
        }
    }

    fn on_command(&mut self, command: Command) {
        match command {
            Command::Send { id, payload, reply } => {
                let id = id.unwrap_or(self.link.config().tx_id);
                let result = self.link.send_with_id(id, &payload);
                let single_frame = result.is_ok() && self.link.send_status() == SendStatus::Idle;
                let _ = reply.send(result);
                if single_frame {
                    self.pending.push(SessionEvent::SendComplete);
                }
            }
        }
    }

    fn emit_link_event(&mut self, event: LinkEvent) {
        self.pending.push(match event {
            LinkEvent::SendComplete => SessionEvent::SendComplete,
            LinkEvent::SendFailed(err) => SessionEvent::SendFailed(err),
            LinkEvent::ReceiveAborted(err) => SessionEvent::ReceiveFailed(err),
        });
    }

    fn publish(&mut self) {
        for event in self.pending.drain(..) {
            // No subscribers is fine
            let _ = self.events.send(event);
        }
    }

    /// Write queued frames to the transport in order
    async fn flush(&mut self) -> Result<(), TransportError> {
        let frames: Vec<_> = self.link.drain_outgoing().collect();
        for frame in &frames {
            self.transport.send_frame(frame).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::mock::MockBus;

    const TX: CanId = CanId::Standard(0x7E0);
    const RX: CanId = CanId::Standard(0x7E8);

    #[tokio::test(start_paused = true)]
    async fn test_invalid_config_rejected() {
        let bus = MockBus::new();
        let config = LinkConfig::new(TX, RX).with_capacity(0, 16);
        let result = IsoTpSession::open(bus.attach("can0"), config, Duration::from_millis(5));
        assert!(matches!(result, Err(SessionError::Config(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_single_frame_send_completes() {
        let bus = MockBus::new();
        let peer = bus.attach("can0");
        let mut peer_rx = peer.subscribe();
        let session =
            IsoTpSession::open(bus.attach("can0"), LinkConfig::new(TX, RX), Duration::from_millis(5))
                .unwrap();
        let mut events = session.subscribe();

        session.send(&[0x22, 0xF1, 0x90]).await.unwrap();

        assert_eq!(events.recv().await.unwrap(), SessionEvent::SendComplete);
        let frame = peer_rx.recv().await.unwrap();
        assert_eq!(frame.id(), TX);
        assert_eq!(frame.data(), &[0x03, 0x22, 0xF1, 0x90]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_inbound_single_frame_is_broadcast() {
        let bus = MockBus::new();
        let peer = bus.attach("can0");
        let session =
            IsoTpSession::open(bus.attach("can0"), LinkConfig::new(TX, RX), Duration::from_millis(5))
                .unwrap();
        let mut events = session.subscribe();

        peer.send_frame(&CanFrame::new(RX, &[0x02, 0x50, 0x01]).unwrap())
            .await
            .unwrap();

        assert_eq!(
            events.recv().await.unwrap(),
            SessionEvent::Message(vec![0x50, 0x01])
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_receive_times_out() {
        let bus = MockBus::new();
        let _peer = bus.attach("can0");
        let session =
            IsoTpSession::open(bus.attach("can0"), LinkConfig::new(TX, RX), Duration::from_millis(5))
                .unwrap();

        let result = session
            .send_receive(&[0x3E, 0x00], Duration::from_millis(200))
            .await;
        assert!(matches!(result, Err(SessionError::Timeout)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_busy_send_rejected() {
        let bus = MockBus::new();
        let _peer = bus.attach("can0");
        let session =
            IsoTpSession::open(bus.attach("can0"), LinkConfig::new(TX, RX), Duration::from_millis(5))
                .unwrap();

        session.send(&[0u8; 32]).await.unwrap();
        let err = session.send(&[1]).await.unwrap_err();
        assert!(matches!(err, SessionError::IsoTp(IsoTpError::Busy)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_short_flow_control_is_send_failure() {
        let bus = MockBus::new();
        let peer = bus.attach("can0");
        let session =
            IsoTpSession::open(bus.attach("can0"), LinkConfig::new(TX, RX), Duration::from_millis(5))
                .unwrap();
        let mut events = session.subscribe();

        session.send(&[0u8; 32]).await.unwrap();
        peer.send_frame(&CanFrame::new(RX, &[0x30, 0x00]).unwrap())
            .await
            .unwrap();

        loop {
            match events.recv().await.unwrap() {
                SessionEvent::SendFailed(err) => {
                    assert!(matches!(err, IsoTpError::LengthError(_)));
                    break;
                }
                SessionEvent::ReceiveFailed(err) => panic!("classified as receive: {}", err),
                _ => continue,
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_transport_send_failure_stops_session() {
        let bus = MockBus::new();
        let transport = bus.attach("can0");
        let session = IsoTpSession::open(
            transport.clone(),
            LinkConfig::new(TX, RX),
            Duration::from_millis(5),
        )
        .unwrap();
        let mut events = session.subscribe();

        transport.set_fail_sends(true);
        session.send(&[0x01]).await.unwrap();

        loop {
            match events.recv().await.unwrap() {
                SessionEvent::TransportFailed(err) => {
                    assert!(matches!(err, TransportError::SendFailed(_)));
                    break;
                }
                _ => continue,
            }
        }
        tokio::task::yield_now().await;
        assert!(!session.is_running());
        assert!(matches!(
            session.send(&[0x01]).await,
            Err(SessionError::Closed)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_stops_task() {
        let bus = MockBus::new();
        let session =
            IsoTpSession::open(bus.attach("can0"), LinkConfig::new(TX, RX), Duration::from_millis(5))
                .unwrap();
        assert!(session.is_running());
        session.close().await;
        assert!(!session.is_running());
        assert!(matches!(session.send(&[1]).await, Err(SessionError::Closed)));
    }
}
