//! Command loop and watchdog

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use bmu_ipc::{HelperCommand, HelperReply, LineReader, LineWriter, Outcome};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::task::JoinSet;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, error, info, trace, warn};

use crate::actions::OsActions;
use crate::config::HelperConfig;
use crate::error::HelperError;

/// Why the helper stopped
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HelperExit {
    /// `kill <if>` received
    Killed,
    /// No line within the watchdog interval
    WatchdogExpired,
    /// The viewer closed the channel or it failed
    ChannelLost,
}

impl HelperExit {
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Killed | Self::WatchdogExpired => 0,
            Self::ChannelLost => 1,
        }
    }
}

/// An OS action started but not yet answered
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum PendingAction {
    InitDriver,
    Up(String),
    Down(String),
}

impl PendingAction {
    fn reply(&self, outcome: Outcome) -> HelperReply {
        match self {
            Self::InitDriver => HelperReply::InitDriver(outcome),
            Self::Up(_) => HelperReply::Up(outcome),
            Self::Down(_) => HelperReply::Down(outcome),
        }
    }
}

pub struct Helper<A> {
    actions: Arc<A>,
    watchdog: Duration,
    /// Last interface brought up successfully
    tracked: Option<String>,
    pending: HashSet<PendingAction>,
    running: JoinSet<(PendingAction, bool)>,
}

impl<A: OsActions> Helper<A> {
    pub fn new(actions: A, watchdog: Duration) -> Self {
        Self {
            actions: Arc::new(actions),
            watchdog,
            tracked: None,
            pending: HashSet::new(),
            running: JoinSet::new(),
        }
    }

    /// Announce, then serve commands until killed, silent, or disconnected
    pub async fn run<R, W>(
        mut self,
        mut reader: LineReader<R>,
        mut writer: LineWriter<W>,
    ) -> HelperExit
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        if let Err(e) = writer.send(&HelperReply::ServerRunning).await {
            error!(error = %e, "Could not announce to viewer");
            return self.shut_down(HelperExit::ChannelLost).await;
        }
        info!(watchdog_ms = self.watchdog.as_millis() as u64, "Server running");

        let watchdog = sleep_until(Instant::now() + self.watchdog);
        tokio::pin!(watchdog);

        loop {
            tokio::select! {
                line = reader.next_line() => {
                    let line = match line {
                        Ok(Some(line)) => line,
                        Ok(None) => {
                            warn!("Viewer closed the channel");
                            return self.shut_down(HelperExit::ChannelLost).await;
                        }
                        Err(e) => {
                            warn!(error = %e, "Channel error");
                            return self.shut_down(HelperExit::ChannelLost).await;
                        }
                    };

                    // Any traffic counts as liveness
                    watchdog.as_mut().reset(Instant::now() + self.watchdog);

                    match line.parse::<HelperCommand>() {
                        Ok(HelperCommand::Heartbeat) => trace!("heartbeat"),
                        Ok(HelperCommand::Kill { interface }) => {
                            info!(interface = %interface, "Kill requested");
                            return self.kill(&interface).await;
                        }
                        Ok(command) => {
                            if let Some(reply) = self.start(command) {
                                if writer.send(&reply).await.is_err() {
                                    return self.shut_down(HelperExit::ChannelLost).await;
                                }
                            }
                        }
                        Err(e) if is_kill(&line) => {
                            warn!(error = %e, "Kill with unusable interface");
                            return self.shut_down(HelperExit::Killed).await;
                        }
                        Err(e) => warn!(error = %e, "Ignoring line"),
                    }
                }

                _ = &mut watchdog => {
                    warn!("Watchdog expired, no traffic from viewer");
                    return self.shut_down(HelperExit::WatchdogExpired).await;
                }

                Some(joined) = self.running.join_next() => {
                    let Some(reply) = self.finish(joined) else {
                        continue;
                    };
                    if let Err(e) = writer.send(&reply).await {
                        warn!(error = %e, "Could not send reply");
                        return self.shut_down(HelperExit::ChannelLost).await;
                    }
                }
            }
        }
    }

    /// Start the OS action for `command`, or return an immediate failure
    /// reply if the same action is still outstanding.
    fn start(&mut self, command: HelperCommand) -> Option<HelperReply> {
        let action = match command {
            HelperCommand::InitDriver => PendingAction::InitDriver,
            HelperCommand::Up { interface } => PendingAction::Up(interface),
            HelperCommand::Down { interface } => PendingAction::Down(interface),
            HelperCommand::Heartbeat | HelperCommand::Kill { .. } => return None,
        };

        if !self.pending.insert(action.clone()) {
            warn!(?action, "Action already in progress");
            return Some(action.reply(Outcome::Failed));
        }

        debug!(?action, "Starting OS action");
        let actions = self.actions.clone();
        self.running.spawn(async move {
            let success = match &action {
                PendingAction::InitDriver => actions.load_driver().await,
                PendingAction::Up(interface) => actions.link_up(interface).await,
                PendingAction::Down(interface) => actions.link_down(interface).await,
            };
            (action, success)
        });
        None
    }

    fn finish(
        &mut self,
        joined: Result<(PendingAction, bool), tokio::task::JoinError>,
    ) -> Option<HelperReply> {
        let (action, success) = match joined {
            Ok(done) => done,
            Err(e) => {
                error!(error = %e, "OS action task failed");
                return None;
            }
        };
        self.pending.remove(&action);

        match (&action, success) {
            (PendingAction::Up(interface), true) => {
                self.tracked = Some(interface.clone());
            }
            (PendingAction::Down(interface), true) => {
                if self.tracked.as_deref() == Some(interface.as_str()) {
                    self.tracked = None;
                }
            }
            _ => {}
        }

        let reply = action.reply(Outcome::from_success(success));
        info!(%reply, "OS action finished");
        Some(reply)
    }

    async fn kill(mut self, interface: &str) -> HelperExit {
        self.running.abort_all();
        self.actions.link_down(interface).await;
        if self.tracked.as_deref() == Some(interface) {
            self.tracked = None;
        }
        self.shut_down(HelperExit::Killed).await
    }

    /// Bring the tracked interface down and wait for it
    async fn shut_down(mut self, exit: HelperExit) -> HelperExit {
        self.running.abort_all();
        if let Some(interface) = self.tracked.take() {
            info!(interface = %interface, "Tearing down tracked interface");
            if !self.actions.link_down(&interface).await {
                error!(interface = %interface, "Teardown failed");
            }
        }
        info!(?exit, "Helper exiting");
        exit
    }
}

/// `kill` always terminates, even when its argument does not parse
fn is_kill(line: &str) -> bool {
    line.split_whitespace().next() == Some("kill")
}

/// Connect to the viewer endpoint and serve until exit
pub async fn run_connected<A: OsActions>(
    config: &HelperConfig,
    actions: A,
) -> Result<HelperExit, HelperError> {
    let stream = bmu_ipc::connect(&config.endpoint)
        .await
        .map_err(|source| HelperError::Connect {
            path: config.endpoint.clone(),
            source,
        })?;
    let (reader, writer) = bmu_ipc::split(stream);
    Ok(Helper::new(actions, config.watchdog).run(reader, writer).await)
}
