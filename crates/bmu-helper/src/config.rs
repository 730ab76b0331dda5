//! Helper runtime settings

use std::path::PathBuf;
use std::time::Duration;

/// Kernel module providing the PEAK CAN adapters
pub const DEFAULT_DRIVER_MODULE: &str = "pcan";

/// CAN bitrate applied on `pcan up`
pub const DEFAULT_BITRATE: u32 = 1_000_000;

/// Bus-off auto-restart delay applied on `pcan up`
pub const DEFAULT_RESTART_MS: u32 = 100;

#[derive(Debug, Clone)]
pub struct HelperConfig {
    /// Viewer endpoint to connect to
    pub endpoint: PathBuf,
    pub driver_module: String,
    pub bitrate: u32,
    pub restart_ms: u32,
    /// Silence after which the helper tears down and exits
    pub watchdog: Duration,
}

impl Default for HelperConfig {
    fn default() -> Self {
        Self {
            endpoint: bmu_ipc::default_endpoint(),
            driver_module: DEFAULT_DRIVER_MODULE.to_string(),
            bitrate: DEFAULT_BITRATE,
            restart_ms: DEFAULT_RESTART_MS,
            watchdog: bmu_ipc::WATCHDOG_INTERVAL,
        }
    }
}
