//! CAN device enumeration

use std::path::PathBuf;

use async_trait::async_trait;
use tracing::debug;

use crate::error::CoordinatorError;

/// `ARPHRD_CAN` as reported in `/sys/class/net/<if>/type`
const ARPHRD_CAN: &str = "280";

/// Lists the CAN interfaces available after the driver is loaded
#[async_trait]
pub trait DeviceEnumerator: Send + Sync {
    async fn enumerate(&self) -> Result<Vec<String>, CoordinatorError>;
}

/// SocketCAN interfaces from sysfs
#[derive(Debug, Clone)]
pub struct SysfsEnumerator {
    root: PathBuf,
}

impl SysfsEnumerator {
    pub fn new() -> Self {
        Self::with_root("/sys/class/net")
    }

    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

impl Default for SysfsEnumerator {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DeviceEnumerator for SysfsEnumerator {
    async fn enumerate(&self) -> Result<Vec<String>, CoordinatorError> {
        let mut entries = tokio::fs::read_dir(&self.root)
            .await
            .map_err(|e| CoordinatorError::Io(format!("{}: {}", self.root.display(), e)))?;

        let mut devices = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| CoordinatorError::Io(e.to_string()))?
        {
            // Interfaces without a readable type are not ours
            let Ok(kind) = tokio::fs::read_to_string(entry.path().join("type")).await else {
                continue;
            };
            if kind.trim() == ARPHRD_CAN {
                devices.push(entry.file_name().to_string_lossy().into_owned());
            }
        }
        devices.sort();
        debug!(?devices, "Enumerated CAN devices");
        Ok(devices)
    }
}

/// Fixed device list, for mock mode and tests
#[derive(Debug, Clone, Default)]
pub struct StaticEnumerator {
    devices: Vec<String>,
}

impl StaticEnumerator {
    pub fn new<I, S>(devices: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            devices: devices.into_iter().map(Into::into).collect(),
        }
    }
}

#[async_trait]
impl DeviceEnumerator for StaticEnumerator {
    async fn enumerate(&self) -> Result<Vec<String>, CoordinatorError> {
        Ok(self.devices.clone())
    }
}
