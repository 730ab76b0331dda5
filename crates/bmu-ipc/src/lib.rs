//! bmu-ipc - Viewer/helper line protocol
//!
//! The unprivileged viewer listens on a Unix domain socket and launches the
//! privileged helper, which connects back and announces itself. From then on
//! both sides exchange newline-terminated UTF-8 lines:
//!
//! ```text
//! viewer                               helper (root)
//!   │ ◄──────────── server running ──────── │
//!   │ ── pcan init driver ────────────────► │ modprobe
//!   │ ◄──────────── pcan init driver success│
//!   │ ── pcan up can0 ────────────────────► │ ip link set can0 up ...
//!   │ ◄──────────── pcan up success ─────── │
//!   │ ── heartbeat (every 100 ms) ────────► │ re-arm watchdog
//!   │ ── kill can0 ───────────────────────► │ ip link set can0 down, exit
//! ```

pub mod channel;
pub mod endpoint;
pub mod error;
pub mod protocol;

use std::time::Duration;

pub use channel::{split, LineReader, LineWriter};
pub use endpoint::{bind_listener, connect, default_endpoint, ENDPOINT_NAME};
pub use error::IpcError;
pub use protocol::{validate_interface, HelperCommand, HelperReply, Outcome};

/// Helper tears down if no line arrives for this long
pub const WATCHDOG_INTERVAL: Duration = Duration::from_millis(2000);

/// Viewer heartbeat period, well inside the watchdog interval
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_millis(100);

/// Longest accepted line, excluding the terminating newline
pub const MAX_LINE_LEN: usize = 256;

/// Launcher exit codes meaning the elevation mechanism itself is unusable
/// (pkexec: 126 authorization dismissed or denied, 127 not found / not authorized)
pub const FATAL_ELEVATION_EXIT_CODES: [i32; 2] = [126, 127];
