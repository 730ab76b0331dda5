//! Viewer configuration
//!
//! Every field has a default, so an empty or missing file is a valid
//! configuration. CLI flags override what the file sets.
//!
//! ```toml
//! [helper]
//! path = "/usr/libexec/bmu-viewer-helper"
//! elevation = "pkexec"
//!
//! [can]
//! interface = "can0"
//!
//! [isotp]
//! request_id = "0x10E"
//! response_id = "0x10F"
//! block_size = 8
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use bmu_isotp::config::{DEFAULT_BLOCK_SIZE, DEFAULT_POLL_INTERVAL, DEFAULT_ST_MIN_MS};
use bmu_isotp::frame::MAX_MESSAGE_LEN;
use bmu_isotp::{parse_can_id, LinkConfig};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Cannot read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Cannot parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Complete viewer configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ViewerConfig {
    #[serde(default)]
    pub helper: HelperSection,

    #[serde(default)]
    pub can: CanSection,

    #[serde(default)]
    pub isotp: IsoTpSection,
}

impl ViewerConfig {
    /// Load configuration from a TOML file
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Self = toml::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(config)
    }

    /// Endpoint path from the file, or the well-known default
    pub fn endpoint(&self) -> PathBuf {
        self.helper
            .endpoint
            .clone()
            .unwrap_or_else(bmu_ipc::default_endpoint)
    }
}

// =============================================================================
// Helper
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HelperSection {
    /// Helper executable
    #[serde(default = "default_helper_path")]
    pub path: PathBuf,

    /// Elevation program the helper runs under; empty runs it directly
    #[serde(default = "default_elevation")]
    pub elevation: String,

    /// Launcher exit codes that mean elevation itself is unusable
    #[serde(default = "default_fatal_exit_codes")]
    pub fatal_exit_codes: Vec<i32>,

    /// Unix socket path, defaults to `<temp dir>/bmu_viewer_helper`
    #[serde(default)]
    pub endpoint: Option<PathBuf>,

    #[serde(default = "default_heartbeat_ms")]
    pub heartbeat_ms: u64,

    /// Deadline for each helper reply
    #[serde(default = "default_reply_timeout_ms")]
    pub reply_timeout_ms: u64,

    /// Deadline for the helper to connect and announce (covers the password prompt)
    #[serde(default = "default_accept_timeout_ms")]
    pub accept_timeout_ms: u64,
}

fn default_helper_path() -> PathBuf {
    PathBuf::from("bmu-viewer-helper")
}

fn default_elevation() -> String {
    "pkexec".to_string()
}

fn default_fatal_exit_codes() -> Vec<i32> {
    bmu_ipc::FATAL_ELEVATION_EXIT_CODES.to_vec()
}

fn default_heartbeat_ms() -> u64 {
    bmu_ipc::HEARTBEAT_INTERVAL.as_millis() as u64
}

fn default_reply_timeout_ms() -> u64 {
    5000
}

fn default_accept_timeout_ms() -> u64 {
    30_000
}

impl Default for HelperSection {
    fn default() -> Self {
        Self {
            path: default_helper_path(),
            elevation: default_elevation(),
            fatal_exit_codes: default_fatal_exit_codes(),
            endpoint: None,
            heartbeat_ms: default_heartbeat_ms(),
            reply_timeout_ms: default_reply_timeout_ms(),
            accept_timeout_ms: default_accept_timeout_ms(),
        }
    }
}

// =============================================================================
// CAN
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CanSection {
    #[serde(default = "default_interface")]
    pub interface: String,
}

fn default_interface() -> String {
    "can0".to_string()
}

impl Default for CanSection {
    fn default() -> Self {
        Self {
            interface: default_interface(),
        }
    }
}

// =============================================================================
// ISO-TP
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IsoTpSection {
    /// Viewer -> BMU arbitration ID (hex with 0x prefix, or decimal)
    #[serde(default = "default_request_id")]
    pub request_id: String,

    /// BMU -> viewer arbitration ID
    #[serde(default = "default_response_id")]
    pub response_id: String,

    #[serde(default = "default_capacity")]
    pub send_capacity: usize,

    #[serde(default = "default_capacity")]
    pub receive_capacity: usize,

    #[serde(default = "default_block_size")]
    pub block_size: u8,

    #[serde(default = "default_st_min_ms")]
    pub st_min_ms: u8,

    /// Pad transmitted frames to 8 bytes with this value
    #[serde(default)]
    pub padding: Option<u8>,

    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

fn default_request_id() -> String {
    "0x10E".to_string()
}

fn default_response_id() -> String {
    "0x10F".to_string()
}

fn default_capacity() -> usize {
    MAX_MESSAGE_LEN
}

fn default_block_size() -> u8 {
    DEFAULT_BLOCK_SIZE
}

fn default_st_min_ms() -> u8 {
    DEFAULT_ST_MIN_MS
}

fn default_poll_interval_ms() -> u64 {
    DEFAULT_POLL_INTERVAL.as_millis() as u64
}

impl Default for IsoTpSection {
    fn default() -> Self {
        Self {
            request_id: default_request_id(),
            response_id: default_response_id(),
            send_capacity: default_capacity(),
            receive_capacity: default_capacity(),
            block_size: default_block_size(),
            st_min_ms: default_st_min_ms(),
            padding: None,
            poll_interval_ms: default_poll_interval_ms(),
        }
    }
}

impl IsoTpSection {
    /// Build and validate the link configuration
    pub fn to_link_config(&self) -> Result<LinkConfig, ConfigError> {
        let tx_id =
            parse_can_id(&self.request_id).map_err(|e| ConfigError::Invalid(e.to_string()))?;
        let rx_id =
            parse_can_id(&self.response_id).map_err(|e| ConfigError::Invalid(e.to_string()))?;

        let config = LinkConfig::new(tx_id, rx_id)
            .with_capacity(self.send_capacity, self.receive_capacity)
            .with_block_size(self.block_size)
            .with_st_min_ms(self.st_min_ms)
            .with_padding(self.padding);
        config
            .validate()
            .map_err(|e| ConfigError::Invalid(e.to_string()))?;
        Ok(config)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bmu_isotp::CanId;
    use std::io::Write;

    #[test]
    fn test_empty_file_gives_defaults() {
        let config: ViewerConfig = toml::from_str("").unwrap();
        assert_eq!(config.helper.elevation, "pkexec");
        assert_eq!(config.helper.fatal_exit_codes, vec![126, 127]);
        assert_eq!(config.helper.heartbeat_ms, 100);
        assert_eq!(config.can.interface, "can0");
        assert_eq!(config.isotp.block_size, 8);
        assert_eq!(config.isotp.poll_interval(), Duration::from_millis(5));
    }

    #[test]
    fn test_partial_sections() {
        let config: ViewerConfig = toml::from_str(
            r#"
            [helper]
            elevation = ""
            reply_timeout_ms = 250

            [isotp]
            request_id = "0x7E0"
            response_id = "0x7E8"
            padding = 0xAA
            "#,
        )
        .unwrap();

        assert_eq!(config.helper.elevation, "");
        assert_eq!(config.helper.reply_timeout_ms, 250);
        assert_eq!(config.helper.accept_timeout_ms, 30_000);

        let link = config.isotp.to_link_config().unwrap();
        assert_eq!(link.tx_id, CanId::Standard(0x7E0));
        assert_eq!(link.rx_id, CanId::Standard(0x7E8));
        assert_eq!(link.padding, Some(0xAA));
        assert_eq!(link.receive_capacity, 4095);
    }

    #[test]
    fn test_invalid_link_rejected() {
        let section = IsoTpSection {
            request_id: "0x10E".into(),
            response_id: "0x10E".into(),
            ..Default::default()
        };
        assert!(matches!(
            section.to_link_config(),
            Err(ConfigError::Invalid(_))
        ));

        let section = IsoTpSection {
            request_id: "zzz".into(),
            ..Default::default()
        };
        assert!(section.to_link_config().is_err());
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[can]\ninterface = \"can1\"").unwrap();

        let config = ViewerConfig::load(file.path()).unwrap();
        assert_eq!(config.can.interface, "can1");
    }

    #[test]
    fn test_load_errors() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("missing.toml");
        assert!(matches!(
            ViewerConfig::load(&missing),
            Err(ConfigError::Read { .. })
        ));

        let broken = dir.path().join("broken.toml");
        std::fs::write(&broken, "[can\ninterface = ").unwrap();
        assert!(matches!(
            ViewerConfig::load(&broken),
            Err(ConfigError::Parse { .. })
        ));
    }
}
