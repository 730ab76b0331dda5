//! ISO-TP sessions talking over the in-memory CAN bus

use std::sync::Arc;
use std::time::Duration;

use bmu_isotp::transport::mock::MockBus;
use bmu_isotp::{
    CanFrame, CanId, FrameTransport, IsoTpError, IsoTpSession, LinkConfig, SessionError,
    SessionEvent,
};

const VIEWER_TX: CanId = CanId::Standard(0x7E0);
const VIEWER_RX: CanId = CanId::Standard(0x7E8);
const POLL: Duration = Duration::from_millis(5);

/// A BMU stand-in that answers every request with its reversed payload
fn spawn_echo_peer(bus: &MockBus) -> Arc<IsoTpSession> {
    let session = Arc::new(
        IsoTpSession::open(
            bus.attach("can0"),
            LinkConfig::new(VIEWER_RX, VIEWER_TX),
            POLL,
        )
        .unwrap(),
    );
    let mut events = session.subscribe();
    let peer = session.clone();
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            if let SessionEvent::Message(mut data) = event {
                data.reverse();
                let _ = peer.send(&data).await;
            }
        }
    });
    session
}

#[tokio::test(start_paused = true)]
async fn test_multi_frame_request_response() {
    let bus = MockBus::new();
    let _peer = spawn_echo_peer(&bus);
    let viewer =
        IsoTpSession::open(bus.attach("can0"), LinkConfig::new(VIEWER_TX, VIEWER_RX), POLL)
            .unwrap();

    let request: Vec<u8> = (0..=255u8).chain(0..44).collect();
    let response = viewer
        .send_receive(&request, Duration::from_secs(5))
        .await
        .unwrap();

    let mut expected = request.clone();
    expected.reverse();
    assert_eq!(response, expected);
}

#[tokio::test(start_paused = true)]
async fn test_single_frame_request_response() {
    let bus = MockBus::new();
    let _peer = spawn_echo_peer(&bus);
    let viewer =
        IsoTpSession::open(bus.attach("can0"), LinkConfig::new(VIEWER_TX, VIEWER_RX), POLL)
            .unwrap();

    let response = viewer
        .send_receive(&[0x01, 0x02, 0x03], Duration::from_secs(1))
        .await
        .unwrap();
    assert_eq!(response, vec![0x03, 0x02, 0x01]);
}

#[tokio::test(start_paused = true)]
async fn test_send_without_flow_control_fails() {
    let bus = MockBus::new();
    let viewer =
        IsoTpSession::open(bus.attach("can0"), LinkConfig::new(VIEWER_TX, VIEWER_RX), POLL)
            .unwrap();

    let result = viewer
        .send_receive(&[0u8; 64], Duration::from_secs(5))
        .await;
    assert!(matches!(
        result,
        Err(SessionError::IsoTp(IsoTpError::TimeoutWaitingForFlowControl))
    ));
}

#[tokio::test(start_paused = true)]
async fn test_wrong_sequence_reported_and_recovered() {
    let bus = MockBus::new();
    let bmu = bus.attach("can0");
    let viewer =
        IsoTpSession::open(bus.attach("can0"), LinkConfig::new(VIEWER_TX, VIEWER_RX), POLL)
            .unwrap();
    let mut events = viewer.subscribe();

    let frame = |data: &[u8]| CanFrame::new(VIEWER_RX, data).unwrap();
    bmu.send_frame(&frame(&[0x10, 0x0A, 1, 2, 3, 4, 5, 6])).await.unwrap();
    bmu.send_frame(&frame(&[0x22, 7, 8, 9, 10])).await.unwrap();

    loop {
        if let SessionEvent::ReceiveFailed(err) = events.recv().await.unwrap() {
            assert_eq!(err, IsoTpError::WrongSequenceNumber { expected: 1, got: 2 });
            break;
        }
    }

    bmu.send_frame(&frame(&[0x02, 0x7E, 0x00])).await.unwrap();
    loop {
        if let SessionEvent::Message(data) = events.recv().await.unwrap() {
            assert_eq!(data, vec![0x7E, 0x00]);
            break;
        }
    }
}

#[tokio::test(start_paused = true)]
async fn test_closed_transport_surfaces_failure() {
    let bus = MockBus::new();
    let transport = bus.attach("can0");
    let viewer = IsoTpSession::open(
        transport.clone(),
        LinkConfig::new(VIEWER_TX, VIEWER_RX),
        POLL,
    )
    .unwrap();
    let mut events = viewer.subscribe();

    transport.close().await;

    assert_eq!(
        events.recv().await.unwrap(),
        SessionEvent::TransportFailed(bmu_isotp::TransportError::ConnectionClosed)
    );
}
