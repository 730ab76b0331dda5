//! Starting the privileged helper

use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use tokio::process::Command;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use crate::error::CoordinatorError;

/// Exit code reported when the elevation program itself cannot be found
const NOT_FOUND_EXIT_CODE: i32 = 127;

/// A launched helper. `exit` resolves with the process exit code
/// (`None` when killed by a signal or when the code is unknown).
pub struct HelperProcess {
    pub exit: oneshot::Receiver<Option<i32>>,
}

/// Starts the helper so that it connects back to `endpoint`
#[async_trait]
pub trait Launcher: Send + Sync {
    async fn launch(&self, endpoint: &Path) -> Result<HelperProcess, CoordinatorError>;
}

/// Runs `<elevation> <helper> --endpoint <path>`
#[derive(Debug, Clone)]
pub struct ElevatedLauncher {
    elevation: String,
    helper: PathBuf,
    verbose: bool,
}

impl ElevatedLauncher {
    /// An empty `elevation` runs the helper directly
    pub fn new(elevation: impl Into<String>, helper: impl Into<PathBuf>) -> Self {
        Self {
            elevation: elevation.into(),
            helper: helper.into(),
            verbose: false,
        }
    }

    pub fn with_verbose(mut self, verbose: bool) -> Self {
        self.verbose = verbose;
        self
    }

    fn command(&self, endpoint: &Path) -> Command {
        let mut command = if self.elevation.is_empty() {
            Command::new(&self.helper)
        } else {
            let mut command = Command::new(&self.elevation);
            command.arg(&self.helper);
            command
        };
        command.arg("--endpoint").arg(endpoint);
        if self.verbose {
            command.arg("--verbose");
        }
        command
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .kill_on_drop(false);
        command
    }
}

#[async_trait]
impl Launcher for ElevatedLauncher {
    async fn launch(&self, endpoint: &Path) -> Result<HelperProcess, CoordinatorError> {
        info!(
            elevation = %self.elevation,
            helper = %self.helper.display(),
            "Launching CAN helper"
        );

        let mut child = match self.command(endpoint).spawn() {
            Ok(child) => child,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                warn!(error = %e, "Launcher program not found");
                return Err(CoordinatorError::ElevationFailed {
                    code: NOT_FOUND_EXIT_CODE,
                });
            }
            Err(e) => return Err(CoordinatorError::Io(e.to_string())),
        };

        let (tx, rx) = oneshot::channel();
        tokio::spawn(async move {
            let code = match child.wait().await {
                Ok(status) => status.code(),
                Err(e) => {
                    warn!(error = %e, "Could not wait for CAN helper");
                    None
                }
            };
            debug!(?code, "CAN helper process exited");
            let _ = tx.send(code);
        });

        Ok(HelperProcess { exit: rx })
    }
}
