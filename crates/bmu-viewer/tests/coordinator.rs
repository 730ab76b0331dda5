//! Coordinator against an in-process helper over a real Unix socket

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bmu_helper::{run_connected, HelperConfig, HelperExit, OsActions};
use bmu_ipc::{HelperReply, LineWriter};
use bmu_isotp::transport::mock::MockBus;
use bmu_isotp::{CanId, IsoTpSession, LinkConfig};
use bmu_viewer::{
    Coordinator, CoordinatorError, CoordinatorEvent, CoordinatorHandle, CoordinatorSettings,
    CoordinatorState, EchoPeer, HelperProcess, Launcher, StaticEnumerator, Step,
};
use parking_lot::Mutex;
use pretty_assertions::assert_eq;
use tempfile::TempDir;
use tokio::sync::oneshot;

#[derive(Clone, Default)]
struct MockActions {
    calls: Arc<Mutex<Vec<String>>>,
    fail_up: bool,
    fail_driver: bool,
}

impl MockActions {
    fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }
}

#[async_trait]
impl OsActions for MockActions {
    async fn load_driver(&self) -> bool {
        self.calls.lock().push("modprobe".into());
        !self.fail_driver
    }

    async fn link_up(&self, interface: &str) -> bool {
        self.calls.lock().push(format!("up {}", interface));
        !self.fail_up
    }

    async fn link_down(&self, interface: &str) -> bool {
        self.calls.lock().push(format!("down {}", interface));
        true
    }
}

/// Runs the helper loop as a task instead of an elevated process
#[derive(Clone)]
struct InProcessLauncher {
    actions: MockActions,
    watchdog: Duration,
    exits: Arc<Mutex<Vec<HelperExit>>>,
}

impl InProcessLauncher {
    fn new(actions: MockActions) -> Self {
        Self {
            actions,
            watchdog: bmu_ipc::WATCHDOG_INTERVAL,
            exits: Arc::default(),
        }
    }

    async fn wait_for_exit(&self) -> HelperExit {
        for _ in 0..200 {
            if let Some(exit) = self.exits.lock().first().cloned() {
                return exit;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("helper did not exit");
    }
}

#[async_trait]
impl Launcher for InProcessLauncher {
    async fn launch(&self, endpoint: &Path) -> Result<HelperProcess, CoordinatorError> {
        let config = HelperConfig {
            endpoint: endpoint.to_path_buf(),
            watchdog: self.watchdog,
            ..Default::default()
        };
        let actions = self.actions.clone();
        let exits = self.exits.clone();
        let (tx, exit) = oneshot::channel();

        tokio::spawn(async move {
            let code = match run_connected(&config, actions).await {
                Ok(helper_exit) => {
                    let code = helper_exit.exit_code();
                    exits.lock().push(helper_exit);
                    code
                }
                Err(_) => 1,
            };
            let _ = tx.send(Some(code));
        });

        Ok(HelperProcess { exit })
    }
}

/// pkexec exiting on its own, e.g. after the password dialog was dismissed
struct ExitingLauncher {
    code: i32,
}

#[async_trait]
impl Launcher for ExitingLauncher {
    async fn launch(&self, _endpoint: &Path) -> Result<HelperProcess, CoordinatorError> {
        let (tx, exit) = oneshot::channel();
        let _ = tx.send(Some(self.code));
        Ok(HelperProcess { exit })
    }
}

/// Launches nothing. The test holds a clone so the exit never resolves.
#[derive(Clone, Default)]
struct SilentLauncher {
    senders: Arc<Mutex<Vec<oneshot::Sender<Option<i32>>>>>,
}

#[async_trait]
impl Launcher for SilentLauncher {
    async fn launch(&self, _endpoint: &Path) -> Result<HelperProcess, CoordinatorError> {
        let (tx, exit) = oneshot::channel();
        self.senders.lock().push(tx);
        Ok(HelperProcess { exit })
    }
}

/// Announces, then hangs up without answering
struct VanishingLauncher;

#[async_trait]
impl Launcher for VanishingLauncher {
    async fn launch(&self, endpoint: &Path) -> Result<HelperProcess, CoordinatorError> {
        let endpoint = endpoint.to_path_buf();
        let (tx, exit) = oneshot::channel();
        tokio::spawn(async move {
            let stream = bmu_ipc::connect(&endpoint).await.unwrap();
            let (_, write) = stream.into_split();
            let mut writer = LineWriter::new(write);
            writer.send(&HelperReply::ServerRunning).await.unwrap();
            writer.shutdown().await.unwrap();
            tokio::time::sleep(Duration::from_millis(200)).await;
            let _ = tx.send(Some(0));
        });
        Ok(HelperProcess { exit })
    }
}

fn settings(dir: &TempDir) -> CoordinatorSettings {
    CoordinatorSettings {
        endpoint: dir.path().join("bmu_viewer_helper"),
        heartbeat: Duration::from_millis(50),
        reply_timeout: Duration::from_secs(2),
        accept_timeout: Duration::from_secs(2),
        fatal_exit_codes: bmu_ipc::FATAL_ELEVATION_EXIT_CODES.to_vec(),
    }
}

async fn spawn(
    dir: &TempDir,
    launcher: impl Launcher + 'static,
    bus: &MockBus,
) -> CoordinatorHandle {
    Coordinator::new(
        settings(dir),
        Arc::new(launcher),
        Arc::new(StaticEnumerator::new(["can0", "can1"])),
        Arc::new(bus.clone()),
    )
    .spawn()
    .await
    .unwrap()
}

fn link_config() -> LinkConfig {
    LinkConfig::new(CanId::Standard(0x10E), CanId::Standard(0x10F))
}

#[tokio::test]
async fn test_full_lifecycle() {
    let dir = tempfile::tempdir().unwrap();
    let bus = MockBus::new();
    let actions = MockActions::default();
    let launcher = InProcessLauncher::new(actions.clone());
    let coordinator = spawn(&dir, launcher.clone(), &bus).await;

    assert_eq!(coordinator.devices().await.unwrap(), vec!["can0", "can1"]);
    assert_eq!(coordinator.state(), CoordinatorState::Enumerating);
    // Endpoint file is gone once the helper connected
    assert!(!dir.path().join("bmu_viewer_helper").exists());

    let transport = coordinator.connect("can0").await.unwrap();
    assert_eq!(coordinator.state(), CoordinatorState::Connected);
    assert_eq!(transport.interface(), "can0");

    // The opened transport carries ISO-TP traffic
    let _peer = EchoPeer::spawn(&bus, &link_config(), Duration::from_millis(1)).unwrap();
    let session =
        IsoTpSession::open(transport.clone(), link_config(), Duration::from_millis(1)).unwrap();
    let payload: Vec<u8> = (0..40).collect();
    let response = session
        .send_receive(&payload, Duration::from_secs(2))
        .await
        .unwrap();
    assert_eq!(response, payload);
    session.close().await;

    coordinator.disconnect().await.unwrap();
    assert_eq!(coordinator.state(), CoordinatorState::Disconnected);
    assert!(!transport.is_open());
    assert_eq!(actions.calls(), vec!["modprobe", "up can0", "down can0"]);

    // Reconnect without reloading the driver, then shut down while connected
    coordinator.connect("can1").await.unwrap();
    coordinator.shutdown().await;
    assert!(!coordinator.is_running());

    assert_eq!(launcher.wait_for_exit().await, HelperExit::Killed);
    assert_eq!(
        actions.calls(),
        vec!["modprobe", "up can0", "down can0", "up can1", "down can1"]
    );
}

#[tokio::test]
async fn test_connect_before_enumeration_is_queued() {
    let dir = tempfile::tempdir().unwrap();
    let bus = MockBus::new();
    let actions = MockActions::default();
    let coordinator = spawn(&dir, InProcessLauncher::new(actions.clone()), &bus).await;

    let transport = coordinator.connect("can0").await.unwrap();
    assert_eq!(transport.interface(), "can0");
    assert_eq!(actions.calls(), vec!["modprobe", "up can0"]);

    // Same interface again is a no-op
    coordinator.connect("can0").await.unwrap();
    assert!(matches!(
        coordinator.connect("can1").await,
        Err(CoordinatorError::InvalidState { .. })
    ));
    coordinator.shutdown().await;
}

#[tokio::test]
async fn test_up_failure_reports_step_and_reply() {
    let dir = tempfile::tempdir().unwrap();
    let bus = MockBus::new();
    let actions = MockActions {
        fail_up: true,
        ..Default::default()
    };
    let coordinator = spawn(&dir, InProcessLauncher::new(actions), &bus).await;
    coordinator.devices().await.unwrap();
    let mut events = coordinator.subscribe();

    let err = coordinator.connect("can0").await.err().unwrap();
    match &err {
        CoordinatorError::StepFailed { step, reply } => {
            assert_eq!(*step, Step::InterfaceUp);
            assert_eq!(reply, "pcan up failed");
        }
        other => panic!("unexpected error: {:?}", other),
    }
    assert!(err.to_string().starts_with("Could not bring can interface up!"));
    assert_eq!(coordinator.state(), CoordinatorState::Disconnected);

    let mut saw_error = false;
    while let Ok(event) = events.try_recv() {
        if let CoordinatorEvent::Error(CoordinatorError::StepFailed { .. }) = event {
            saw_error = true;
        }
    }
    assert!(saw_error);

    // Not fatal: the helper session is still usable
    assert_eq!(coordinator.devices().await.unwrap().len(), 2);
    coordinator.shutdown().await;
}

#[tokio::test]
async fn test_driver_failure_is_fatal() {
    let dir = tempfile::tempdir().unwrap();
    let bus = MockBus::new();
    let actions = MockActions {
        fail_driver: true,
        ..Default::default()
    };
    let coordinator = spawn(&dir, InProcessLauncher::new(actions), &bus).await;

    let err = coordinator.devices().await.err().unwrap();
    assert!(matches!(
        err,
        CoordinatorError::StepFailed {
            step: Step::InitDriver,
            ..
        }
    ));
    assert_eq!(
        err.to_string(),
        "Could not load pcan driver! (init driver: pcan init driver failed)"
    );
    // Every later request reports the same failure
    assert!(matches!(
        coordinator.connect("can0").await,
        Err(CoordinatorError::StepFailed { .. })
    ));
    coordinator.shutdown().await;
}

#[tokio::test]
async fn test_socket_open_failure_brings_interface_down() {
    let dir = tempfile::tempdir().unwrap();
    let bus = MockBus::new();
    bus.reject_opens(true);
    let actions = MockActions::default();
    let coordinator = spawn(&dir, InProcessLauncher::new(actions.clone()), &bus).await;

    let err = coordinator.connect("can0").await.err().unwrap();
    assert!(matches!(err, CoordinatorError::Transport(_)));
    assert!(err.to_string().starts_with("Could not connect to can socket!"));

    coordinator
        .wait_for_state(|s| *s == CoordinatorState::Disconnected)
        .await
        .unwrap();
    assert_eq!(actions.calls(), vec!["modprobe", "up can0", "down can0"]);
    coordinator.shutdown().await;
}

#[tokio::test]
async fn test_invalid_interface_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let bus = MockBus::new();
    let actions = MockActions::default();
    let coordinator = spawn(&dir, InProcessLauncher::new(actions.clone()), &bus).await;
    coordinator.devices().await.unwrap();

    assert!(matches!(
        coordinator.connect("can0; reboot").await,
        Err(CoordinatorError::InvalidInterface(_))
    ));
    assert_eq!(actions.calls(), vec!["modprobe"]);
    coordinator.shutdown().await;
}

#[tokio::test]
async fn test_heartbeat_keeps_helper_alive() {
    let dir = tempfile::tempdir().unwrap();
    let bus = MockBus::new();
    let mut launcher = InProcessLauncher::new(MockActions::default());
    launcher.watchdog = Duration::from_millis(300);
    let coordinator = spawn(&dir, launcher.clone(), &bus).await;
    coordinator.devices().await.unwrap();

    // Several watchdog intervals with no command besides heartbeats
    tokio::time::sleep(Duration::from_millis(1200)).await;
    assert!(launcher.exits.lock().is_empty());
    assert_eq!(coordinator.state(), CoordinatorState::Enumerating);

    coordinator.connect("can0").await.unwrap();
    coordinator.shutdown().await;
    assert_eq!(launcher.wait_for_exit().await, HelperExit::Killed);
}

#[tokio::test]
async fn test_shutdown_without_interface_closes_channel() {
    let dir = tempfile::tempdir().unwrap();
    let bus = MockBus::new();
    let actions = MockActions::default();
    let launcher = InProcessLauncher::new(actions.clone());
    let coordinator = spawn(&dir, launcher.clone(), &bus).await;
    coordinator.devices().await.unwrap();

    coordinator.shutdown().await;
    assert_eq!(launcher.wait_for_exit().await, HelperExit::ChannelLost);
    assert_eq!(actions.calls(), vec!["modprobe"]);
}

#[tokio::test]
async fn test_elevation_failure_is_fatal() {
    let dir = tempfile::tempdir().unwrap();
    let bus = MockBus::new();
    let coordinator = spawn(&dir, ExitingLauncher { code: 126 }, &bus).await;

    let err = coordinator.devices().await.err().unwrap();
    assert!(matches!(err, CoordinatorError::ElevationFailed { code: 126 }));
    assert!(err.is_fatal());
    assert!(!dir.path().join("bmu_viewer_helper").exists());
    coordinator.shutdown().await;
}

#[tokio::test]
async fn test_other_exit_code_is_unreachable() {
    let dir = tempfile::tempdir().unwrap();
    let bus = MockBus::new();
    let coordinator = spawn(&dir, ExitingLauncher { code: 1 }, &bus).await;

    assert!(matches!(
        coordinator.devices().await,
        Err(CoordinatorError::HelperUnreachable(_))
    ));
    coordinator.shutdown().await;
}

#[tokio::test]
async fn test_helper_hangup_is_fatal() {
    let dir = tempfile::tempdir().unwrap();
    let bus = MockBus::new();
    let coordinator = spawn(&dir, VanishingLauncher, &bus).await;

    assert!(matches!(
        coordinator.devices().await,
        Err(CoordinatorError::HelperUnreachable(_))
    ));
    assert_eq!(coordinator.state(), CoordinatorState::Disconnected);
    coordinator.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_accept_timeout() {
    let dir = tempfile::tempdir().unwrap();
    let bus = MockBus::new();
    let launcher = SilentLauncher::default();
    let coordinator = spawn(&dir, launcher.clone(), &bus).await;
    assert_eq!(coordinator.state(), CoordinatorState::AwaitingServer);

    let err = coordinator.devices().await.err().unwrap();
    assert!(
        matches!(
            err,
            CoordinatorError::Timeout {
                step: Step::Accept
            }
        ),
        "unexpected error: {:?}",
        err
    );
    assert!(err.is_fatal());
    assert_eq!(coordinator.state(), CoordinatorState::Disconnected);
    assert!(!dir.path().join("bmu_viewer_helper").exists());
    assert_eq!(launcher.senders.lock().len(), 1);
    coordinator.shutdown().await;
}

#[tokio::test]
async fn test_launch_failure_removes_endpoint() {
    struct Refusing;

    #[async_trait]
    impl Launcher for Refusing {
        async fn launch(&self, _endpoint: &Path) -> Result<HelperProcess, CoordinatorError> {
            Err(CoordinatorError::ElevationFailed { code: 127 })
        }
    }

    let dir = tempfile::tempdir().unwrap();
    let result = Coordinator::new(
        settings(&dir),
        Arc::new(Refusing),
        Arc::new(StaticEnumerator::default()),
        Arc::new(MockBus::new()),
    )
    .spawn()
    .await;

    assert!(matches!(
        result,
        Err(CoordinatorError::ElevationFailed { code: 127 })
    ));
    assert!(!dir.path().join("bmu_viewer_helper").exists());
}
