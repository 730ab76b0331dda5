//! Interface lifecycle coordinator
//!
//! Owns the viewer end of the helper channel. A single reactor task
//! sequences the bring-up (`server running` -> driver load -> enumeration
//! -> interface up -> CAN socket), sends heartbeats, and tears down in
//! mirror order. Callers talk to it through a [`CoordinatorHandle`].

use std::fmt;
use std::future::pending;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use bmu_ipc::{HelperCommand, HelperReply, IpcError, LineReader, LineWriter};
use bmu_isotp::{FrameTransport, TransportFactory};
use parking_lot::Mutex;
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval, sleep_until, Instant, MissedTickBehavior};
use tracing::{debug, error, info, trace, warn};

use crate::config::ViewerConfig;
use crate::enumerate::DeviceEnumerator;
use crate::error::{CoordinatorError, Step};
use crate::launcher::Launcher;

const EVENT_CHANNEL_CAPACITY: usize = 64;
const REQUEST_CHANNEL_CAPACITY: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoordinatorState {
    Disconnected,
    AwaitingServer,
    DriverLoading,
    Enumerating,
    InterfaceBringingUp,
    Connected,
    Disconnecting,
}

impl fmt::Display for CoordinatorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Disconnected => "disconnected",
            Self::AwaitingServer => "awaiting server",
            Self::DriverLoading => "loading driver",
            Self::Enumerating => "enumerating",
            Self::InterfaceBringingUp => "bringing interface up",
            Self::Connected => "connected",
            Self::Disconnecting => "disconnecting",
        };
        f.write_str(name)
    }
}

#[derive(Clone)]
pub enum CoordinatorEvent {
    StateChanged(CoordinatorState),
    DevicesAvailable(Vec<String>),
    /// Interface is up and its CAN socket open
    LinkReady {
        interface: String,
        transport: Arc<dyn FrameTransport>,
    },
    LinkDown {
        interface: String,
    },
    Error(CoordinatorError),
}

impl fmt::Debug for CoordinatorEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::StateChanged(state) => f.debug_tuple("StateChanged").field(state).finish(),
            Self::DevicesAvailable(devices) => {
                f.debug_tuple("DevicesAvailable").field(devices).finish()
            }
            Self::LinkReady { interface, .. } => f
                .debug_struct("LinkReady")
                .field("interface", interface)
                .finish_non_exhaustive(),
            Self::LinkDown { interface } => f
                .debug_struct("LinkDown")
                .field("interface", interface)
                .finish(),
            Self::Error(err) => f.debug_tuple("Error").field(err).finish(),
        }
    }
}

/// Timing and endpoint settings
#[derive(Debug, Clone)]
pub struct CoordinatorSettings {
    pub endpoint: PathBuf,
    pub heartbeat: Duration,
    /// Deadline for each helper reply
    pub reply_timeout: Duration,
    /// Deadline for the helper to connect
    pub accept_timeout: Duration,
    /// Helper exit codes meaning elevation failed
    pub fatal_exit_codes: Vec<i32>,
}

impl CoordinatorSettings {
    pub fn from_config(config: &ViewerConfig) -> Self {
        Self {
            endpoint: config.endpoint(),
            heartbeat: Duration::from_millis(config.helper.heartbeat_ms),
            reply_timeout: Duration::from_millis(config.helper.reply_timeout_ms),
            accept_timeout: Duration::from_millis(config.helper.accept_timeout_ms),
            fatal_exit_codes: config.helper.fatal_exit_codes.clone(),
        }
    }
}

impl Default for CoordinatorSettings {
    fn default() -> Self {
        Self::from_config(&ViewerConfig::default())
    }
}

type Reply<T> = oneshot::Sender<Result<T, CoordinatorError>>;

enum Request {
    Devices(Reply<Vec<String>>),
    Connect {
        interface: String,
        reply: Reply<Arc<dyn FrameTransport>>,
    },
    Disconnect(Reply<()>),
    Shutdown(oneshot::Sender<()>),
}

/// Builder for the coordinator task
pub struct Coordinator {
    settings: CoordinatorSettings,
    launcher: Arc<dyn Launcher>,
    enumerator: Arc<dyn DeviceEnumerator>,
    transports: Arc<dyn TransportFactory>,
}

impl Coordinator {
    pub fn new(
        settings: CoordinatorSettings,
        launcher: Arc<dyn Launcher>,
        enumerator: Arc<dyn DeviceEnumerator>,
        transports: Arc<dyn TransportFactory>,
    ) -> Self {
        Self {
            settings,
            launcher,
            enumerator,
            transports,
        }
    }

    /// Bind the endpoint, launch the helper and start the reactor task.
    ///
    /// The endpoint is listening before the helper starts, so the helper
    /// can connect as soon as it runs.
    pub async fn spawn(self) -> Result<CoordinatorHandle, CoordinatorError> {
        let listener = bmu_ipc::bind_listener(&self.settings.endpoint)?;

        let helper = match self.launcher.launch(&self.settings.endpoint).await {
            Ok(helper) => helper,
            Err(e) => {
                error!(error = %e, "Could not launch CAN helper");
                remove_endpoint(&self.settings.endpoint);
                return Err(e);
            }
        };

        let (requests, request_rx) = mpsc::channel(REQUEST_CHANNEL_CAPACITY);
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let (state_tx, state) = watch::channel(CoordinatorState::AwaitingServer);

        let reactor = Reactor {
            awaiting: Some(Awaiting::new(Step::Accept, self.settings.accept_timeout)),
            settings: self.settings,
            enumerator: self.enumerator,
            transports: self.transports,
            events: events.clone(),
            state: state_tx,
            listener: Some(listener),
            reader: None,
            writer: None,
            helper_exit: Some(helper.exit),
            driver_loaded: false,
            devices: None,
            device_waiters: Vec::new(),
            pending_connect: None,
            pending_disconnect: None,
            interface: None,
            transport: None,
            fatal: None,
        };
        let task = tokio::spawn(reactor.run(request_rx));

        Ok(CoordinatorHandle {
            requests,
            events,
            state,
            task: Mutex::new(Some(task)),
        })
    }
}

/// Handle to a running coordinator
pub struct CoordinatorHandle {
    requests: mpsc::Sender<Request>,
    events: broadcast::Sender<CoordinatorEvent>,
    state: watch::Receiver<CoordinatorState>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl CoordinatorHandle {
    /// Devices found after the driver loaded. Waits for enumeration.
    pub async fn devices(&self) -> Result<Vec<String>, CoordinatorError> {
        let (reply, rx) = oneshot::channel();
        self.request(Request::Devices(reply), rx).await
    }

    /// Bring `interface` up and open its CAN socket
    pub async fn connect(
        &self,
        interface: &str,
    ) -> Result<Arc<dyn FrameTransport>, CoordinatorError> {
        let (reply, rx) = oneshot::channel();
        let request = Request::Connect {
            interface: interface.to_string(),
            reply,
        };
        self.request(request, rx).await
    }

    /// Close the CAN socket and bring the interface down
    pub async fn disconnect(&self) -> Result<(), CoordinatorError> {
        let (reply, rx) = oneshot::channel();
        self.request(Request::Disconnect(reply), rx).await
    }

    /// Tear down, tell the helper to exit and stop the task
    pub async fn shutdown(&self) {
        let (reply, rx) = oneshot::channel();
        if self.requests.send(Request::Shutdown(reply)).await.is_ok() {
            let _ = rx.await;
        }
        let task = self.task.lock().take();
        if let Some(task) = task {
            let _ = task.await;
        }
    }

    pub fn state(&self) -> CoordinatorState {
        *self.state.borrow()
    }

    /// Wait until the state satisfies `f`
    pub async fn wait_for_state(
        &self,
        f: impl FnMut(&CoordinatorState) -> bool,
    ) -> Result<CoordinatorState, CoordinatorError> {
        let mut state = self.state.clone();
        let reached = state
            .wait_for(f)
            .await
            .map_err(|_| CoordinatorError::HelperUnreachable("coordinator stopped".into()))?;
        Ok(*reached)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CoordinatorEvent> {
        self.events.subscribe()
    }

    pub fn is_running(&self) -> bool {
        self.task
            .lock()
            .as_ref()
            .map(|task| !task.is_finished())
            .unwrap_or(false)
    }

    async fn request<T>(
        &self,
        request: Request,
        rx: oneshot::Receiver<Result<T, CoordinatorError>>,
    ) -> Result<T, CoordinatorError> {
        let stopped = || CoordinatorError::HelperUnreachable("coordinator stopped".into());
        self.requests.send(request).await.map_err(|_| stopped())?;
        rx.await.map_err(|_| stopped())?
    }
}

/// A helper reply (or connection) we are waiting for
#[derive(Debug, Clone, Copy)]
struct Awaiting {
    step: Step,
    deadline: Instant,
}

impl Awaiting {
    fn new(step: Step, timeout: Duration) -> Self {
        Self {
            step,
            deadline: Instant::now() + timeout,
        }
    }
}

struct Reactor {
    settings: CoordinatorSettings,
    enumerator: Arc<dyn DeviceEnumerator>,
    transports: Arc<dyn TransportFactory>,
    events: broadcast::Sender<CoordinatorEvent>,
    state: watch::Sender<CoordinatorState>,

    /// Present until the helper connects
    listener: Option<UnixListener>,
    reader: Option<LineReader<OwnedReadHalf>>,
    writer: Option<LineWriter<OwnedWriteHalf>>,
    helper_exit: Option<oneshot::Receiver<Option<i32>>>,
    awaiting: Option<Awaiting>,

    driver_loaded: bool,
    devices: Option<Vec<String>>,
    device_waiters: Vec<Reply<Vec<String>>>,
    pending_connect: Option<(String, Reply<Arc<dyn FrameTransport>>)>,
    pending_disconnect: Option<Reply<()>>,
    /// Interface the helper brought up for us
    interface: Option<String>,
    transport: Option<Arc<dyn FrameTransport>>,
    /// Set once the helper session is lost; every later request fails with it
    fatal: Option<CoordinatorError>,
}

impl Reactor {
    async fn run(mut self, mut requests: mpsc::Receiver<Request>) {
        let mut heartbeat = interval(self.settings.heartbeat);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                accepted = accept(self.listener.as_ref()) => self.on_accept(accepted),

                line = next_line(self.reader.as_mut()) => self.on_line(line).await,

                code = exited(self.helper_exit.as_mut()) => self.on_helper_exit(code),

                _ = until(self.awaiting.map(|a| a.deadline)) => self.on_timeout().await,

                _ = heartbeat.tick(), if self.writer.is_some() => {
                    trace!("heartbeat");
                    if let Err(e) = self.send(&HelperCommand::Heartbeat).await {
                        self.fail(e).await;
                    }
                }

                request = requests.recv() => match request {
                    Some(Request::Shutdown(done)) => {
                        self.shut_down().await;
                        let _ = done.send(());
                        return;
                    }
                    Some(request) => self.on_request(request).await,
                    None => {
                        debug!("Coordinator handle dropped");
                        self.shut_down().await;
                        return;
                    }
                },
            }
        }
    }

    fn set_state(&mut self, state: CoordinatorState) {
        let changed = self.state.send_if_modified(|current| {
            if *current == state {
                false
            } else {
                *current = state;
                true
            }
        });
        if changed {
            debug!(%state, "Coordinator state changed");
            self.emit(CoordinatorEvent::StateChanged(state));
        }
    }

    fn current_state(&self) -> CoordinatorState {
        *self.state.borrow()
    }

    fn emit(&self, event: CoordinatorEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }

    async fn send(&mut self, command: &HelperCommand) -> Result<(), CoordinatorError> {
        let writer = self
            .writer
            .as_mut()
            .ok_or_else(|| CoordinatorError::HelperUnreachable("not connected".into()))?;
        writer
            .send(command)
            .await
            .map_err(|e| CoordinatorError::HelperUnreachable(e.to_string()))
    }

    /// Send a command that expects a reply and arm its deadline
    async fn request_step(&mut self, command: HelperCommand, step: Step) {
        debug!(%command, "Sending helper command");
        match self.send(&command).await {
            Ok(()) => self.awaiting = Some(Awaiting::new(step, self.settings.reply_timeout)),
            Err(e) => self.fail(e).await,
        }
    }

    /// Take the awaited step if it is `step`
    fn take_awaited(&mut self, step: Step, reply: &HelperReply) -> bool {
        match self.awaiting {
            Some(awaiting) if awaiting.step == step => {
                self.awaiting = None;
                true
            }
            _ => {
                warn!(%reply, "Unexpected helper reply");
                false
            }
        }
    }

    // ---------------------------------------------------------------------
    // Helper channel
    // ---------------------------------------------------------------------

    fn on_accept(&mut self, accepted: std::io::Result<UnixStream>) {
        let stream = match accepted {
            Ok(stream) => stream,
            Err(e) => {
                // Transient accept errors leave the listener usable
                warn!(error = %e, "Accept failed");
                return;
            }
        };

        info!("CAN helper connected");
        self.listener = None;
        remove_endpoint(&self.settings.endpoint);

        let (reader, writer) = bmu_ipc::split(stream);
        self.reader = Some(reader);
        self.writer = Some(writer);
        self.awaiting = Some(Awaiting::new(Step::Announce, self.settings.reply_timeout));
    }

    async fn on_line(&mut self, line: Result<Option<String>, IpcError>) {
        let line = match line {
            Ok(Some(line)) => line,
            Ok(None) => {
                self.fail(CoordinatorError::HelperUnreachable(
                    "helper closed the channel".into(),
                ))
                .await;
                return;
            }
            Err(e) => {
                self.fail(CoordinatorError::HelperUnreachable(e.to_string()))
                    .await;
                return;
            }
        };

        let reply = match line.parse::<HelperReply>() {
            Ok(reply) => reply,
            Err(e) => {
                warn!(error = %e, "Ignoring helper line");
                return;
            }
        };
        debug!(%reply, "Helper reply");

        match reply {
            HelperReply::ServerRunning => {
                if self.take_awaited(Step::Announce, &reply) {
                    self.set_state(CoordinatorState::DriverLoading);
                    self.request_step(HelperCommand::InitDriver, Step::InitDriver)
                        .await;
                }
            }
            HelperReply::InitDriver(outcome) => {
                if !self.take_awaited(Step::InitDriver, &reply) {
                    return;
                }
                if outcome.is_success() {
                    self.driver_loaded = true;
                    self.enumerate().await;
                } else {
                    self.fail(CoordinatorError::StepFailed {
                        step: Step::InitDriver,
                        reply: reply.to_string(),
                    })
                    .await;
                }
            }
            HelperReply::Up(outcome) => {
                if !self.take_awaited(Step::InterfaceUp, &reply) {
                    return;
                }
                if outcome.is_success() {
                    self.open_socket().await;
                } else {
                    let err = CoordinatorError::StepFailed {
                        step: Step::InterfaceUp,
                        reply: reply.to_string(),
                    };
                    self.connect_failed(err);
                }
            }
            HelperReply::Down(outcome) => {
                if !self.take_awaited(Step::InterfaceDown, &reply) {
                    return;
                }
                let result = if outcome.is_success() {
                    if let Some(interface) = self.interface.take() {
                        info!(interface = %interface, "CAN interface down");
                        self.emit(CoordinatorEvent::LinkDown { interface });
                    }
                    Ok(())
                } else {
                    let err = CoordinatorError::StepFailed {
                        step: Step::InterfaceDown,
                        reply: reply.to_string(),
                    };
                    error!(error = %err, "Interface teardown failed");
                    self.emit(CoordinatorEvent::Error(err.clone()));
                    Err(err)
                };
                self.set_state(CoordinatorState::Disconnected);
                if let Some(reply) = self.pending_disconnect.take() {
                    let _ = reply.send(result);
                }
            }
        }
    }

    fn on_helper_exit(&mut self, code: Option<i32>) {
        self.helper_exit = None;
        let err = match code {
            Some(code) if self.settings.fatal_exit_codes.contains(&code) => {
                CoordinatorError::ElevationFailed { code }
            }
            code => CoordinatorError::HelperUnreachable(format!(
                "helper exited with code {}",
                code.map(|c| c.to_string())
                    .unwrap_or_else(|| "unknown".into())
            )),
        };
        self.fail_now(err);
    }

    async fn on_timeout(&mut self) {
        let Some(awaiting) = self.awaiting.take() else {
            return;
        };
        let err = CoordinatorError::Timeout {
            step: awaiting.step,
        };
        warn!(step = %awaiting.step, "Helper step timed out");

        match awaiting.step {
            _ if err.is_fatal() => self.fail(err).await,
            Step::InterfaceDown => {
                self.emit(CoordinatorEvent::Error(err.clone()));
                self.set_state(CoordinatorState::Disconnected);
                if let Some(reply) = self.pending_disconnect.take() {
                    let _ = reply.send(Err(err));
                }
            }
            _ => self.connect_failed(err),
        }
    }

    // ---------------------------------------------------------------------
    // Bring-up and teardown
    // ---------------------------------------------------------------------

    async fn enumerate(&mut self) {
        self.set_state(CoordinatorState::Enumerating);
        let devices = match self.enumerator.enumerate().await {
            Ok(devices) => devices,
            Err(e) => {
                self.fail(CoordinatorError::StepFailed {
                    step: Step::Enumerate,
                    reply: e.to_string(),
                })
                .await;
                return;
            }
        };

        info!(?devices, "CAN devices available");
        self.emit(CoordinatorEvent::DevicesAvailable(devices.clone()));
        for waiter in self.device_waiters.drain(..) {
            let _ = waiter.send(Ok(devices.clone()));
        }
        self.devices = Some(devices);

        // A connect requested during bring-up starts now
        if let Some((interface, reply)) = self.pending_connect.take() {
            self.start_up(interface, reply).await;
        }
    }

    async fn start_up(&mut self, interface: String, reply: Reply<Arc<dyn FrameTransport>>) {
        info!(interface = %interface, "Bringing CAN interface up");
        let command = HelperCommand::Up {
            interface: interface.clone(),
        };
        self.set_state(CoordinatorState::InterfaceBringingUp);
        self.pending_connect = Some((interface, reply));
        self.request_step(command, Step::InterfaceUp).await;
    }

    async fn open_socket(&mut self) {
        let Some((interface, reply)) = self.pending_connect.take() else {
            return;
        };
        self.interface = Some(interface.clone());

        match self.transports.open(&interface).await {
            Ok(transport) => {
                info!(interface = %interface, "CAN link ready");
                self.transport = Some(transport.clone());
                self.set_state(CoordinatorState::Connected);
                self.emit(CoordinatorEvent::LinkReady {
                    interface,
                    transport: transport.clone(),
                });
                let _ = reply.send(Ok(transport));
            }
            Err(e) => {
                let err = CoordinatorError::Transport(e);
                error!(interface = %interface, error = %err, "Could not open CAN socket");
                self.emit(CoordinatorEvent::Error(err.clone()));
                let _ = reply.send(Err(err));
                // The interface is up without a socket; bring it back down
                self.set_state(CoordinatorState::Disconnecting);
                self.request_step(HelperCommand::Down { interface }, Step::InterfaceDown)
                    .await;
            }
        }
    }

    fn connect_failed(&mut self, err: CoordinatorError) {
        error!(error = %err, "Interface bring-up failed");
        self.emit(CoordinatorEvent::Error(err.clone()));
        self.set_state(CoordinatorState::Disconnected);
        if let Some((_, reply)) = self.pending_connect.take() {
            let _ = reply.send(Err(err));
        }
    }

    async fn close_transport(&mut self) {
        if let Some(transport) = self.transport.take() {
            debug!(interface = transport.interface(), "Closing CAN socket");
            transport.close().await;
        }
    }

    // ---------------------------------------------------------------------
    // Requests
    // ---------------------------------------------------------------------

    async fn on_request(&mut self, request: Request) {
        if let Some(err) = &self.fatal {
            let err = err.clone();
            match request {
                Request::Devices(reply) => {
                    let _ = reply.send(Err(err));
                }
                Request::Connect { reply, .. } => {
                    let _ = reply.send(Err(err));
                }
                Request::Disconnect(reply) => {
                    let _ = reply.send(Err(err));
                }
                Request::Shutdown(done) => {
                    let _ = done.send(());
                }
            }
            return;
        }

        match request {
            Request::Devices(reply) => match &self.devices {
                Some(devices) => {
                    let _ = reply.send(Ok(devices.clone()));
                }
                None => self.device_waiters.push(reply),
            },
            Request::Connect { interface, reply } => self.on_connect(interface, reply).await,
            Request::Disconnect(reply) => self.on_disconnect(reply).await,
            Request::Shutdown(done) => {
                let _ = done.send(());
            }
        }
    }

    async fn on_connect(&mut self, interface: String, reply: Reply<Arc<dyn FrameTransport>>) {
        if let Err(e) = bmu_ipc::validate_interface(&interface) {
            debug!(error = %e, "Rejecting connect");
            let _ = reply.send(Err(CoordinatorError::InvalidInterface(interface)));
            return;
        }

        let state = self.current_state();
        match state {
            CoordinatorState::Connected => match (&self.interface, &self.transport) {
                (Some(current), Some(transport)) if *current == interface => {
                    let _ = reply.send(Ok(transport.clone()));
                }
                _ => {
                    let _ = reply.send(Err(CoordinatorError::InvalidState {
                        operation: "connect",
                        state: state.to_string(),
                    }));
                }
            },
            _ if self.pending_connect.is_some() => {
                let _ = reply.send(Err(CoordinatorError::InvalidState {
                    operation: "connect",
                    state: state.to_string(),
                }));
            }
            CoordinatorState::AwaitingServer | CoordinatorState::DriverLoading => {
                debug!(interface = %interface, "Connect queued until devices are known");
                self.pending_connect = Some((interface, reply));
            }
            CoordinatorState::Enumerating | CoordinatorState::Disconnected
                if self.driver_loaded =>
            {
                self.start_up(interface, reply).await;
            }
            _ => {
                let _ = reply.send(Err(CoordinatorError::InvalidState {
                    operation: "connect",
                    state: state.to_string(),
                }));
            }
        }
    }

    async fn on_disconnect(&mut self, reply: Reply<()>) {
        let state = self.current_state();
        match state {
            CoordinatorState::Connected => {
                let Some(interface) = self.interface.clone() else {
                    let _ = reply.send(Ok(()));
                    return;
                };
                self.close_transport().await;
                self.set_state(CoordinatorState::Disconnecting);
                self.pending_disconnect = Some(reply);
                info!(interface = %interface, "Bringing CAN interface down");
                self.request_step(HelperCommand::Down { interface }, Step::InterfaceDown)
                    .await;
            }
            CoordinatorState::Disconnected | CoordinatorState::Enumerating => {
                let _ = reply.send(Ok(()));
            }
            _ => {
                let _ = reply.send(Err(CoordinatorError::InvalidState {
                    operation: "disconnect",
                    state: state.to_string(),
                }));
            }
        }
    }

    // ---------------------------------------------------------------------
    // Failure and shutdown
    // ---------------------------------------------------------------------

    /// The helper session is lost: report once, then drop everything
    async fn fail(&mut self, err: CoordinatorError) {
        self.close_transport().await;
        self.fail_now(err);
    }

    fn fail_now(&mut self, err: CoordinatorError) {
        if self.fatal.is_some() {
            return;
        }
        error!(error = %err, "CAN helper session failed");

        if let Some(transport) = self.transport.take() {
            // Without the helper the interface state is unknown
            debug!(interface = transport.interface(), "Dropping CAN socket");
        }
        if self.listener.take().is_some() {
            remove_endpoint(&self.settings.endpoint);
        }
        self.reader = None;
        self.writer = None;
        self.helper_exit = None;
        self.awaiting = None;

        for waiter in self.device_waiters.drain(..) {
            let _ = waiter.send(Err(err.clone()));
        }
        if let Some((_, reply)) = self.pending_connect.take() {
            let _ = reply.send(Err(err.clone()));
        }
        if let Some(reply) = self.pending_disconnect.take() {
            let _ = reply.send(Err(err.clone()));
        }
        if let Some(interface) = self.interface.take() {
            self.emit(CoordinatorEvent::LinkDown { interface });
        }

        self.emit(CoordinatorEvent::Error(err.clone()));
        self.fatal = Some(err);
        self.set_state(CoordinatorState::Disconnected);
    }

    async fn shut_down(&mut self) {
        info!("Shutting down coordinator");
        self.close_transport().await;

        if self.writer.is_some() {
            if let Some(interface) = self.interface.clone() {
                info!(interface = %interface, "Killing CAN helper");
                if let Err(e) = self.send(&HelperCommand::Kill { interface }).await {
                    warn!(error = %e, "Could not send kill");
                }
            }
            if let Some(writer) = self.writer.as_mut() {
                let _ = writer.shutdown().await;
            }
        }
        if self.listener.take().is_some() {
            remove_endpoint(&self.settings.endpoint);
        }
        self.reader = None;
        self.writer = None;
        self.awaiting = None;

        let stopped = CoordinatorError::HelperUnreachable("coordinator shut down".into());
        for waiter in self.device_waiters.drain(..) {
            let _ = waiter.send(Err(stopped.clone()));
        }
        if let Some((_, reply)) = self.pending_connect.take() {
            let _ = reply.send(Err(stopped.clone()));
        }
        if let Some(reply) = self.pending_disconnect.take() {
            let _ = reply.send(Err(stopped));
        }
        if let Some(interface) = self.interface.take() {
            self.emit(CoordinatorEvent::LinkDown { interface });
        }
        self.set_state(CoordinatorState::Disconnected);
    }
}

fn remove_endpoint(path: &std::path::Path) {
    if let Err(e) = std::fs::remove_file(path) {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!(path = %path.display(), error = %e, "Could not remove endpoint");
        }
    }
}

async fn accept(listener: Option<&UnixListener>) -> std::io::Result<UnixStream> {
    match listener {
        Some(listener) => listener.accept().await.map(|(stream, _)| stream),
        None => pending().await,
    }
}

async fn next_line(
    reader: Option<&mut LineReader<OwnedReadHalf>>,
) -> Result<Option<String>, IpcError> {
    match reader {
        Some(reader) => reader.next_line().await,
        None => pending().await,
    }
}

async fn exited(exit: Option<&mut oneshot::Receiver<Option<i32>>>) -> Option<i32> {
    match exit {
        // A dropped sender means the exit code is unknown
        Some(exit) => exit.await.unwrap_or(None),
        None => pending().await,
    }
}

async fn until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => pending().await,
    }
}
