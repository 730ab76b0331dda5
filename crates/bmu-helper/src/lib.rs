//! bmu-helper - Privileged CAN interface helper
//!
//! Runs elevated (via pkexec) next to the unprivileged viewer. Connects back
//! to the viewer's endpoint, announces `server running`, then executes one OS
//! action per command. A watchdog brings the tracked interface down and exits
//! if the viewer falls silent, so a crashed viewer never leaves a privileged
//! interface configured.

pub mod actions;
pub mod config;
pub mod error;
pub mod helper;

pub use actions::{OsActions, SystemActions};
pub use config::HelperConfig;
pub use error::HelperError;
pub use helper::{run_connected, Helper, HelperExit};
