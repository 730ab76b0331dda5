//! Command and reply vocabulary

use std::fmt;
use std::str::FromStr;

use crate::error::IpcError;

/// Longest Linux network interface name (IFNAMSIZ - 1)
pub const MAX_INTERFACE_LEN: usize = 15;

/// Check an interface name before it is handed to `ip`.
///
/// Accepts 1 to 15 ASCII alphanumerics, `-`, `_` and `.`.
pub fn validate_interface(name: &str) -> Result<(), IpcError> {
    let valid = !name.is_empty()
        && name.len() <= MAX_INTERFACE_LEN
        && name
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'-' | b'_' | b'.'));
    if valid {
        Ok(())
    } else {
        Err(IpcError::InvalidInterface(name.to_string()))
    }
}

/// Viewer -> helper
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HelperCommand {
    /// `pcan init driver`: load the CAN adapter kernel module
    InitDriver,
    /// `pcan up <if>`: set the link up with bitrate and auto-restart
    Up { interface: String },
    /// `pcan down <if>`
    Down { interface: String },
    /// `kill <if>`: set the link down, then exit
    Kill { interface: String },
    /// `heartbeat`: re-arm the watchdog, no reply
    Heartbeat,
}

impl fmt::Display for HelperCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InitDriver => f.write_str("pcan init driver"),
            Self::Up { interface } => write!(f, "pcan up {}", interface),
            Self::Down { interface } => write!(f, "pcan down {}", interface),
            Self::Kill { interface } => write!(f, "kill {}", interface),
            Self::Heartbeat => f.write_str("heartbeat"),
        }
    }
}

impl FromStr for HelperCommand {
    type Err = IpcError;

    fn from_str(line: &str) -> Result<Self, Self::Err> {
        let line = line.trim();
        let with_interface = |rest: &str| -> Result<String, IpcError> {
            let interface = rest.trim();
            validate_interface(interface)?;
            Ok(interface.to_string())
        };

        if line == "pcan init driver" {
            Ok(Self::InitDriver)
        } else if line == "heartbeat" {
            Ok(Self::Heartbeat)
        } else if let Some(rest) = line.strip_prefix("pcan up ") {
            Ok(Self::Up {
                interface: with_interface(rest)?,
            })
        } else if let Some(rest) = line.strip_prefix("pcan down ") {
            Ok(Self::Down {
                interface: with_interface(rest)?,
            })
        } else if let Some(rest) = line.strip_prefix("kill ") {
            Ok(Self::Kill {
                interface: with_interface(rest)?,
            })
        } else {
            Err(IpcError::UnknownCommand(line.to_string()))
        }
    }
}

/// Result of one OS action
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Success,
    Failed,
}

impl Outcome {
    pub fn from_success(success: bool) -> Self {
        if success {
            Self::Success
        } else {
            Self::Failed
        }
    }

    pub fn is_success(self) -> bool {
        self == Self::Success
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Success => f.write_str("success"),
            Self::Failed => f.write_str("failed"),
        }
    }
}

/// Helper -> viewer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HelperReply {
    /// Sent once right after connecting
    ServerRunning,
    InitDriver(Outcome),
    Up(Outcome),
    Down(Outcome),
}

impl fmt::Display for HelperReply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ServerRunning => f.write_str("server running"),
            Self::InitDriver(outcome) => write!(f, "pcan init driver {}", outcome),
            Self::Up(outcome) => write!(f, "pcan up {}", outcome),
            Self::Down(outcome) => write!(f, "pcan down {}", outcome),
        }
    }
}

impl FromStr for HelperReply {
    type Err = IpcError;

    fn from_str(line: &str) -> Result<Self, Self::Err> {
        let line = line.trim();
        if line == "server running" {
            return Ok(Self::ServerRunning);
        }

        let (action, outcome) = line
            .rsplit_once(' ')
            .ok_or_else(|| IpcError::UnknownReply(line.to_string()))?;
        let outcome = match outcome {
            "success" => Outcome::Success,
            "failed" => Outcome::Failed,
            _ => return Err(IpcError::UnknownReply(line.to_string())),
        };

        match action {
            "pcan init driver" => Ok(Self::InitDriver(outcome)),
            "pcan up" => Ok(Self::Up(outcome)),
            "pcan down" => Ok(Self::Down(outcome)),
            _ => Err(IpcError::UnknownReply(line.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_wire_format() {
        assert_eq!(HelperCommand::InitDriver.to_string(), "pcan init driver");
        assert_eq!(
            HelperCommand::Up {
                interface: "can0".into()
            }
            .to_string(),
            "pcan up can0"
        );
        assert_eq!(
            HelperCommand::Kill {
                interface: "can0".into()
            }
            .to_string(),
            "kill can0"
        );
        assert_eq!(HelperCommand::Heartbeat.to_string(), "heartbeat");
    }

    #[test]
    fn test_parse_commands() {
        assert_eq!(
            "pcan down pcan_usb.1".parse::<HelperCommand>().unwrap(),
            HelperCommand::Down {
                interface: "pcan_usb.1".into()
            }
        );
        assert_eq!(
            "heartbeat\r".parse::<HelperCommand>().unwrap(),
            HelperCommand::Heartbeat
        );
        assert!(matches!(
            "reboot".parse::<HelperCommand>(),
            Err(IpcError::UnknownCommand(_))
        ));
    }

    #[test]
    fn test_interface_names_are_checked() {
        for bad in ["can0; reboot", "", "a_very_long_interface0", "can 0", "../x/y"] {
            assert!(
                validate_interface(bad).is_err(),
                "{bad:?} should be rejected"
            );
        }
        assert!(matches!(
            "pcan up can0 type vcan".parse::<HelperCommand>(),
            Err(IpcError::InvalidInterface(_))
        ));
        assert!(validate_interface("vcan0").is_ok());
    }

    #[test]
    fn test_parse_replies() {
        assert_eq!(
            "pcan up failed".parse::<HelperReply>().unwrap(),
            HelperReply::Up(Outcome::Failed)
        );
        assert_eq!(
            "pcan init driver success".parse::<HelperReply>().unwrap(),
            HelperReply::InitDriver(Outcome::Success)
        );
        assert_eq!(
            "server running".parse::<HelperReply>().unwrap(),
            HelperReply::ServerRunning
        );
        assert!("pcan up maybe".parse::<HelperReply>().is_err());
        assert!("pcan sideways success".parse::<HelperReply>().is_err());
    }

    #[test]
    fn test_reply_wire_format() {
        assert_eq!(
            HelperReply::Down(Outcome::Success).to_string(),
            "pcan down success"
        );
        assert_eq!(
            HelperReply::InitDriver(Outcome::Failed).to_string(),
            "pcan init driver failed"
        );
    }
}
