//! ISO-TP link: one send and one receive state machine bound to a CAN ID pair
//!
//! The link is purely event driven and never blocks. Callers feed it
//! inbound frames ([`Link::on_can_message`]), payloads to transmit
//! ([`Link::send`]) and a periodic tick ([`Link::poll`]). Frames the link
//! wants on the bus are queued and collected with [`Link::drain_outgoing`].
//!
//! Send and receive sides are independent, so a link is full duplex.

use std::collections::VecDeque;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, trace, warn};

use crate::buffer::FixedBuffer;
use crate::config::{LinkConfig, MAX_WAIT_FRAMES, RESPONSE_TIMEOUT};
use crate::error::IsoTpError;
use crate::frame::{
    self, st_min_to_ms, CanFrame, CanId, FlowStatus, FrameKind, CONSECUTIVE_FRAME_DATA,
    FIRST_FRAME_DATA, MAX_DATA_LEN, MAX_MESSAGE_LEN, SINGLE_FRAME_MAX,
};

/// Sender status
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendStatus {
    Idle,
    InProgress,
    Error,
}

/// Receiver status
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReceiveStatus {
    Idle,
    InProgress,
    Full,
}

/// Outcomes produced by [`Link::poll`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    /// The last consecutive frame of a multi-frame message was emitted
    SendComplete,
    /// The in-progress send was aborted
    SendFailed(IsoTpError),
    /// The in-progress receive was abandoned, partial data discarded
    ReceiveAborted(IsoTpError),
}

/// Consecutive frames the receiver currently permits
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BlockCredit {
    Unlimited,
    Remaining(u8),
}

impl BlockCredit {
    fn permits(self) -> bool {
        match self {
            Self::Unlimited => true,
            Self::Remaining(n) => n > 0,
        }
    }

    fn consume(&mut self) {
        if let Self::Remaining(n) = self {
            *n = n.saturating_sub(1);
        }
    }
}

struct Sender {
    status: SendStatus,
    buffer: FixedBuffer,
    offset: usize,
    sequence: u8,
    credit: BlockCredit,
    st_min: Duration,
    wait_frames: u8,
    /// Earliest time the next consecutive frame may go out
    st_deadline: Instant,
    /// Deadline for the next flow control frame (N_Bs)
    fc_deadline: Instant,
    result: Option<IsoTpError>,
}

struct Receiver {
    status: ReceiveStatus,
    buffer: FixedBuffer,
    expected_len: usize,
    offset: usize,
    sequence: u8,
    block_count: u8,
    /// Deadline for the next consecutive frame (N_Cr)
    cf_deadline: Instant,
    result: Option<IsoTpError>,
}

/// ISO-TP link state
pub struct Link {
    config: LinkConfig,
    send: Sender,
    receive: Receiver,
    outgoing: VecDeque<CanFrame>,
}

impl Link {
    /// Create a link with buffers allocated once at the configured capacities
    pub fn new(config: LinkConfig) -> Self {
        let now = Instant::now();
        Self {
            send: Sender {
                status: SendStatus::Idle,
                buffer: FixedBuffer::with_capacity(config.send_capacity),
                offset: 0,
                sequence: 0,
                credit: BlockCredit::Remaining(0),
                st_min: Duration::ZERO,
                wait_frames: 0,
                st_deadline: now,
                fc_deadline: now,
                result: None,
            },
            receive: Receiver {
                status: ReceiveStatus::Idle,
                buffer: FixedBuffer::with_capacity(config.receive_capacity),
                expected_len: 0,
                offset: 0,
                sequence: 0,
                block_count: 0,
                cf_deadline: now,
                result: None,
            },
            outgoing: VecDeque::new(),
            config,
        }
    }

    pub fn config(&self) -> &LinkConfig {
        &self.config
    }

    pub fn send_status(&self) -> SendStatus {
        self.send.status
    }

    pub fn receive_status(&self) -> ReceiveStatus {
        self.receive.status
    }

    /// Last send-side protocol result (`None` = OK)
    pub fn send_result(&self) -> Option<&IsoTpError> {
        self.send.result.as_ref()
    }

    /// Last receive-side protocol result (`None` = OK)
    pub fn receive_result(&self) -> Option<&IsoTpError> {
        self.receive.result.as_ref()
    }

    /// Frames queued for transmission, oldest first
    pub fn drain_outgoing(&mut self) -> std::collections::vec_deque::Drain<'_, CanFrame> {
        self.outgoing.drain(..)
    }

    pub fn has_outgoing(&self) -> bool {
        !self.outgoing.is_empty()
    }

    /// Send a payload on the link's request ID
    pub fn send(&mut self, payload: &[u8]) -> Result<(), IsoTpError> {
        self.send_with_id(self.config.tx_id, payload)
    }

    /// Send a payload whose single/first frame uses `id`.
    ///
    /// Consecutive frames always use the link's request ID.
    pub fn send_with_id(&mut self, id: CanId, payload: &[u8]) -> Result<(), IsoTpError> {
        // First frames carry a 12-bit length
        let capacity = self.send.buffer.capacity().min(MAX_MESSAGE_LEN);
        if payload.len() > capacity {
            warn!(len = payload.len(), capacity, "Payload too large for send buffer");
            return Err(IsoTpError::PayloadTooLarge {
                len: payload.len(),
                capacity,
            });
        }
        if payload.is_empty() {
            return Err(IsoTpError::LengthError("empty payload"));
        }
        if self.send.status == SendStatus::InProgress {
            debug!("Send rejected, transmission in progress");
            return Err(IsoTpError::Busy);
        }

        self.send.buffer.fill_from(payload)?;
        self.send.offset = 0;
        self.send.result = None;

        if payload.len() <= SINGLE_FRAME_MAX {
            self.outgoing
                .push_back(frame::single_frame(id, payload, self.config.padding));
            self.send.status = SendStatus::Idle;
            trace!(len = payload.len(), %id, "Single frame queued");
            return Ok(());
        }

        self.outgoing.push_back(frame::first_frame(
            id,
            payload.len(),
            &payload[..FIRST_FRAME_DATA],
        ));

        let now = Instant::now();
        self.send.offset = FIRST_FRAME_DATA;
        self.send.sequence = 1;
        // Nothing more goes out until the receiver's first flow control
        self.send.credit = BlockCredit::Remaining(0);
        self.send.st_min = Duration::ZERO;
        self.send.wait_frames = 0;
        self.send.st_deadline = now;
        self.send.fc_deadline = now + RESPONSE_TIMEOUT;
        self.send.status = SendStatus::InProgress;
        debug!(len = payload.len(), %id, "First frame queued, awaiting flow control");
        Ok(())
    }

    /// Periodic tick: emit at most one consecutive frame and check deadlines
    pub fn poll(&mut self) -> Vec<LinkEvent> {
        let now = Instant::now();
        let mut events = Vec::new();

        if self.send.status == SendStatus::InProgress {
            let st_elapsed = self.send.st_min.is_zero() || now >= self.send.st_deadline;
            if self.send.credit.permits() && st_elapsed {
                self.emit_consecutive_frame();
                self.send.credit.consume();
                self.send.fc_deadline = now + RESPONSE_TIMEOUT;
                self.send.st_deadline = now + self.send.st_min;

                if self.send.offset >= self.send.buffer.len() {
                    self.send.status = SendStatus::Idle;
                    debug!(len = self.send.buffer.len(), "Multi-frame send complete");
                    events.push(LinkEvent::SendComplete);
                }
            }

            if self.send.status == SendStatus::InProgress && now > self.send.fc_deadline {
                warn!("Timed out waiting for flow control");
                events.push(LinkEvent::SendFailed(
                    self.fail_send(IsoTpError::TimeoutWaitingForFlowControl),
                ));
            }
        }

        if self.receive.status == ReceiveStatus::InProgress && now > self.receive.cf_deadline {
            warn!(
                received = self.receive.offset,
                expected = self.receive.expected_len,
                "Timed out waiting for consecutive frame"
            );
            events.push(LinkEvent::ReceiveAborted(
                self.abort_receive(IsoTpError::TimeoutWaitingForConsecutiveFrame),
            ));
        }

        events
    }

    /// Feed one inbound CAN frame. Frames for other IDs are ignored.
    pub fn on_can_message(&mut self, frame: &CanFrame) -> Result<(), IsoTpError> {
        if frame.id() != self.config.rx_id {
            return Ok(());
        }

        let data = frame.data();
        if data.len() < 2 {
            return Err(IsoTpError::LengthError("frame shorter than 2 bytes"));
        }

        let Some(kind) = FrameKind::from_pci(data[0]) else {
            return Err(IsoTpError::UnknownFrameType(data[0] >> 4));
        };

        match kind {
            FrameKind::Single => self.receive_single_frame(data),
            FrameKind::First => self.receive_first_frame(data),
            FrameKind::Consecutive => self.receive_consecutive_frame(data),
            FrameKind::FlowControl => self.receive_flow_control(data),
        }
    }

    /// Take the completed message, if any, and return the receiver to idle
    pub fn receive(&mut self) -> Result<Vec<u8>, IsoTpError> {
        if self.receive.status != ReceiveStatus::Full {
            return Err(IsoTpError::NoData);
        }
        let message = self.receive.buffer.as_slice().to_vec();
        self.receive.status = ReceiveStatus::Idle;
        Ok(message)
    }

    /// Abandon any in-flight transfer in both directions
    pub fn reset(&mut self) {
        self.send.status = SendStatus::Idle;
        self.receive.status = ReceiveStatus::Idle;
        self.receive.buffer.clear();
        self.outgoing.clear();
    }

    fn emit_consecutive_frame(&mut self) {
        let end = (self.send.offset + CONSECUTIVE_FRAME_DATA).min(self.send.buffer.len());
        let chunk = self
            .send
            .buffer
            .get(self.send.offset..end)
            .unwrap_or_default();
        self.outgoing.push_back(frame::consecutive_frame(
            self.config.tx_id,
            self.send.sequence,
            chunk,
            self.config.padding,
        ));
        self.send.offset = end;
        self.send.sequence = (self.send.sequence + 1) & 0x0F;
    }

    fn fail_send(&mut self, err: IsoTpError) -> IsoTpError {
        self.send.status = SendStatus::Error;
        self.send.result = Some(err.clone());
        err
    }

    fn abort_receive(&mut self, err: IsoTpError) -> IsoTpError {
        self.receive.status = ReceiveStatus::Idle;
        self.receive.buffer.clear();
        self.receive.result = Some(err.clone());
        err
    }

    fn queue_flow_control(&mut self, status: FlowStatus) {
        let (block_size, st_min) = match status {
            FlowStatus::Continue => (self.config.block_size, self.config.st_min_ms),
            _ => (0, 0),
        };
        self.outgoing.push_back(frame::flow_control(
            self.config.tx_id,
            status,
            block_size,
            st_min,
            self.config.padding,
        ));
    }

    fn receive_single_frame(&mut self, data: &[u8]) -> Result<(), IsoTpError> {
        let len = (data[0] & 0x0F) as usize;
        if len == 0 || len > data.len() - 1 {
            debug!(len, frame_len = data.len(), "Invalid single frame length");
            return Err(IsoTpError::LengthError("single frame length"));
        }

        let interrupted = self.receive.status == ReceiveStatus::InProgress;
        self.receive.buffer.fill_from(&data[1..=len])?;
        self.receive.expected_len = len;
        self.receive.offset = len;
        self.receive.status = ReceiveStatus::Full;
        self.receive.result = interrupted.then_some(IsoTpError::UnexpectedFrame(FrameKind::Single));
        trace!(len, "Single frame received");
        Ok(())
    }

    fn receive_first_frame(&mut self, data: &[u8]) -> Result<(), IsoTpError> {
        if data.len() != MAX_DATA_LEN {
            debug!(frame_len = data.len(), "First frame should be 8 bytes");
            return Err(IsoTpError::LengthError("first frame must be 8 bytes"));
        }

        let len = (((data[0] & 0x0F) as usize) << 8) | data[1] as usize;
        if len <= SINGLE_FRAME_MAX {
            return Err(IsoTpError::LengthError("first frame carries a single frame length"));
        }

        let capacity = self.receive.buffer.capacity();
        if len > capacity {
            warn!(len, capacity, "Multi-frame message too large for receive buffer");
            self.queue_flow_control(FlowStatus::Overflow);
            return Err(self.abort_receive(IsoTpError::Overflow { len, capacity }));
        }

        let interrupted = self.receive.status == ReceiveStatus::InProgress;
        self.receive.buffer.clear();
        self.receive
            .buffer
            .write_at(0, &data[2..2 + FIRST_FRAME_DATA])?;
        self.receive.expected_len = len;
        self.receive.offset = FIRST_FRAME_DATA;
        self.receive.sequence = 1;
        self.receive.block_count = self.config.block_size;
        self.receive.status = ReceiveStatus::InProgress;
        self.receive.result = interrupted.then_some(IsoTpError::UnexpectedFrame(FrameKind::First));
        self.receive.cf_deadline = Instant::now() + RESPONSE_TIMEOUT;
        self.queue_flow_control(FlowStatus::Continue);
        debug!(len, "First frame received, flow control queued");
        Ok(())
    }

    fn receive_consecutive_frame(&mut self, data: &[u8]) -> Result<(), IsoTpError> {
        if self.receive.status != ReceiveStatus::InProgress {
            let err = IsoTpError::UnexpectedFrame(FrameKind::Consecutive);
            self.receive.result = Some(err.clone());
            return Err(err);
        }

        let sequence = data[0] & 0x0F;
        if sequence != self.receive.sequence {
            warn!(
                expected = self.receive.sequence,
                got = sequence,
                "Wrong sequence number, receive aborted"
            );
            return Err(self.abort_receive(IsoTpError::WrongSequenceNumber {
                expected: self.receive.sequence,
                got: sequence,
            }));
        }

        let remaining =
            (self.receive.expected_len - self.receive.offset).min(CONSECUTIVE_FRAME_DATA);
        if remaining > data.len() - 1 {
            return Err(IsoTpError::LengthError("consecutive frame too short"));
        }

        self.receive
            .buffer
            .write_at(self.receive.offset, &data[1..1 + remaining])?;
        self.receive.offset += remaining;
        self.receive.sequence = (self.receive.sequence + 1) & 0x0F;
        self.receive.cf_deadline = Instant::now() + RESPONSE_TIMEOUT;

        if self.receive.offset >= self.receive.expected_len {
            self.receive.status = ReceiveStatus::Full;
            debug!(len = self.receive.expected_len, "Multi-frame message received");
        } else if self.config.block_size > 0 {
            self.receive.block_count = self.receive.block_count.saturating_sub(1);
            if self.receive.block_count == 0 {
                self.receive.block_count = self.config.block_size;
                self.queue_flow_control(FlowStatus::Continue);
            }
        }
        Ok(())
    }

    fn receive_flow_control(&mut self, data: &[u8]) -> Result<(), IsoTpError> {
        if self.send.status != SendStatus::InProgress {
            return Ok(());
        }
        if data.len() < 3 {
            return Err(IsoTpError::LengthError("flow control frame shorter than 3 bytes"));
        }

        self.send.fc_deadline = Instant::now() + RESPONSE_TIMEOUT;

        match FlowStatus::from_nibble(data[0] & 0x0F) {
            Some(FlowStatus::Continue) => {
                self.send.credit = match data[1] {
                    0 => BlockCredit::Unlimited,
                    n => BlockCredit::Remaining(n),
                };
                self.send.st_min = Duration::from_millis(st_min_to_ms(data[2]) as u64);
                self.send.wait_frames = 0;
                trace!(block_size = data[1], st_min = data[2], "Flow control: continue");
                Ok(())
            }
            Some(FlowStatus::Wait) => {
                self.send.credit = BlockCredit::Remaining(0);
                self.send.wait_frames += 1;
                if self.send.wait_frames > MAX_WAIT_FRAMES {
                    warn!("Flow control wait limit exceeded, send aborted");
                    return Err(self.fail_send(IsoTpError::WaitFrameLimitExceeded(MAX_WAIT_FRAMES)));
                }
                Ok(())
            }
            Some(FlowStatus::Overflow) => {
                warn!("Receiver reported overflow, send aborted");
                Err(self.fail_send(IsoTpError::RemoteOverflow))
            }
            None => Err(self.fail_send(IsoTpError::InvalidFlowStatus(data[0] & 0x0F))),
        }
    }
}
