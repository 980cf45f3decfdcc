use thiserror::Error;

use crate::types::DeviceRole;

/// Structured reason a device rejected a command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandErrorKind {
    /// The device is powered off and refuses the command.
    PowerOff,
    NotSupportedInState,
    DeviceControl,
    Unknown,
    Timeout,
    /// Anything the device reported that is not recognised as recoverable.
    Rejected,
}

/// How the dispatcher reacts to a failed command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    PowerOff,
    Transient,
    Fatal,
}

impl CommandErrorKind {
    pub fn class(self) -> ErrorClass {
        match self {
            Self::PowerOff => ErrorClass::PowerOff,
            Self::NotSupportedInState | Self::DeviceControl | Self::Unknown | Self::Timeout => {
                ErrorClass::Transient
            }
            Self::Rejected => ErrorClass::Fatal,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::PowerOff => "power_off",
            Self::NotSupportedInState => "command_not_supported_in_state",
            Self::DeviceControl => "fail_device_control",
            Self::Unknown => "unknown_error",
            Self::Timeout => "device_timeout",
            Self::Rejected => "rejected",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
#[error("{message} ({})", .kind.as_str())]
pub struct CommandError {
    pub kind: CommandErrorKind,
    pub message: String,
}

impl CommandError {
    pub fn new(kind: CommandErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    /// Maps a device-reported reason code and message onto a structured kind.
    /// A message mentioning "power off" wins over any code.
    pub fn from_reason(code: Option<&str>, message: &str) -> Self {
        let lower = message.to_ascii_lowercase();

        let kind = if lower.contains("power off") || code == Some("power_off") {
            CommandErrorKind::PowerOff
        } else {
            match code {
                Some("command_not_supported_in_state") => CommandErrorKind::NotSupportedInState,
                Some("fail_device_control") => CommandErrorKind::DeviceControl,
                Some("unknown_error") => CommandErrorKind::Unknown,
                Some("device_timeout") => CommandErrorKind::Timeout,
                _ if lower.contains("command not supported") && lower.contains("power") => {
                    CommandErrorKind::NotSupportedInState
                }
                _ if lower.contains("fail device control") => CommandErrorKind::DeviceControl,
                _ if lower.contains("timeout") => CommandErrorKind::Timeout,
                _ => CommandErrorKind::Rejected,
            }
        };

        Self::new(kind, message)
    }

    pub fn class(&self) -> ErrorClass {
        self.kind.class()
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConfigError {
    #[error("at least one of heating_device or cooling_device must be configured")]
    NoDevices,
    #[error("{field} = {value} is outside {min}..={max}")]
    OutOfRange {
        field: &'static str,
        value: f64,
        min: f64,
        max: f64,
    },
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ControllerError {
    #[error("{} device command failed: {source}", .role.as_str())]
    Command {
        role: DeviceRole,
        #[source]
        source: CommandError,
    },
    #[error("invalid temperature: {0}")]
    InvalidTemperature(f32),
    #[error(transparent)]
    Config(#[from] ConfigError),
}

pub type Result<T> = std::result::Result<T, ControllerError>;
