//! Coordinator errors and lifecycle steps

use std::fmt;

use bmu_isotp::TransportError;
use thiserror::Error;

/// One step of the interface lifecycle, named in errors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    Accept,
    Announce,
    InitDriver,
    Enumerate,
    InterfaceUp,
    InterfaceDown,
}

impl Step {
    /// Message shown to the operator when this step fails
    pub fn failure_message(&self) -> &'static str {
        match self {
            Self::Accept | Self::Announce => "CAN helper did not respond!",
            Self::InitDriver => "Could not load pcan driver!",
            Self::Enumerate => "Could not list can devices!",
            Self::InterfaceUp => "Could not bring can interface up!",
            Self::InterfaceDown => "Could not bring can interface down!",
        }
    }
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Accept => "accept helper",
            Self::Announce => "await server running",
            Self::InitDriver => "init driver",
            Self::Enumerate => "enumerate devices",
            Self::InterfaceUp => "interface up",
            Self::InterfaceDown => "interface down",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Error)]
pub enum CoordinatorError {
    #[error("CAN helper unreachable: {0}")]
    HelperUnreachable(String),

    #[error("Elevation failed (exit code {code}), cannot start the CAN helper")]
    ElevationFailed { code: i32 },

    #[error("{} ({step}: {reply})", step.failure_message())]
    StepFailed { step: Step, reply: String },

    #[error("{} ({step}: timed out)", step.failure_message())]
    Timeout { step: Step },

    #[error("Cannot {operation} while {state}")]
    InvalidState {
        operation: &'static str,
        state: String,
    },

    #[error("Invalid interface name: {0}")]
    InvalidInterface(String),

    #[error("Could not connect to can socket! ({0})")]
    Transport(TransportError),

    #[error("I/O error: {0}")]
    Io(String),
}

impl CoordinatorError {
    /// Errors that end the helper session
    ///
    /// Only interface up/down failures leave the helper usable.
    pub fn is_fatal(&self) -> bool {
        match self {
            Self::HelperUnreachable(_) | Self::ElevationFailed { .. } | Self::Io(_) => true,
            Self::StepFailed { step, .. } | Self::Timeout { step } => {
                !matches!(step, Step::InterfaceUp | Step::InterfaceDown)
            }
            Self::InvalidState { .. } | Self::InvalidInterface(_) | Self::Transport(_) => false,
        }
    }
}

impl From<TransportError> for CoordinatorError {
    fn from(err: TransportError) -> Self {
        Self::Transport(err)
    }
}

impl From<bmu_ipc::IpcError> for CoordinatorError {
    fn from(err: bmu_ipc::IpcError) -> Self {
        Self::Io(err.to_string())
    }
}
