//! Privileged OS actions

use std::process::Stdio;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::config::HelperConfig;

/// The three operations the helper performs with elevated rights.
///
/// Each resolves to `true` on success. Failure to start the underlying
/// program counts as failure.
#[async_trait]
pub trait OsActions: Send + Sync + 'static {
    async fn load_driver(&self) -> bool;
    async fn link_up(&self, interface: &str) -> bool;
    async fn link_down(&self, interface: &str) -> bool;
}

/// `modprobe` and `ip link` on the host
#[derive(Debug, Clone)]
pub struct SystemActions {
    driver_module: String,
    bitrate: u32,
    restart_ms: u32,
}

impl SystemActions {
    pub fn new(config: &HelperConfig) -> Self {
        Self {
            driver_module: config.driver_module.clone(),
            bitrate: config.bitrate,
            restart_ms: config.restart_ms,
        }
    }

    async fn run(program: &str, args: &[&str]) -> bool {
        debug!(program, ?args, "Running OS action");
        let status = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .status()
            .await;

        match status {
            Ok(status) if status.success() => true,
            Ok(status) => {
                warn!(program, ?args, code = ?status.code(), "OS action failed");
                false
            }
            Err(e) => {
                warn!(program, error = %e, "Could not start OS action");
                false
            }
        }
    }
}

#[async_trait]
impl OsActions for SystemActions {
    async fn load_driver(&self) -> bool {
        info!(module = %self.driver_module, "Loading CAN driver");
        Self::run("modprobe", &[&self.driver_module]).await
    }

    async fn link_up(&self, interface: &str) -> bool {
        info!(interface, bitrate = self.bitrate, "Bringing CAN interface up");
        let bitrate = self.bitrate.to_string();
        let restart_ms = self.restart_ms.to_string();
        Self::run(
            "ip",
            &[
                "link", "set", interface, "up", "type", "can", "bitrate", &bitrate,
                "restart-ms", &restart_ms,
            ],
        )
        .await
    }

    async fn link_down(&self, interface: &str) -> bool {
        info!(interface, "Bringing CAN interface down");
        Self::run("ip", &["link", "set", interface, "down"]).await
    }
}
