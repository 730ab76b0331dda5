//! bmu-viewer - CAN interface lifecycle and calibration channel
//!
//! The viewer runs unprivileged. Bringing a CAN interface up needs root, so
//! the [`Coordinator`] launches `bmu-viewer-helper` through pkexec and
//! drives it over the `bmu-ipc` line protocol. Once the interface is up the
//! opened [`FrameTransport`](bmu_isotp::FrameTransport) carries ISO-TP
//! sessions to the BMU.
//!
//! ```text
//! Disconnected -> AwaitingServer -> DriverLoading -> Enumerating
//!     ^                                                   |
//!     |                                                   v
//! Disconnecting <------------ Connected <------- InterfaceBringingUp
//! ```

pub mod config;
pub mod coordinator;
pub mod echo;
pub mod enumerate;
pub mod error;
pub mod launcher;

pub use config::{ConfigError, ViewerConfig};
pub use coordinator::{
    Coordinator, CoordinatorEvent, CoordinatorHandle, CoordinatorSettings, CoordinatorState,
};
pub use echo::EchoPeer;
pub use enumerate::{DeviceEnumerator, StaticEnumerator, SysfsEnumerator};
pub use error::{CoordinatorError, Step};
pub use launcher::{ElevatedLauncher, HelperProcess, Launcher};
