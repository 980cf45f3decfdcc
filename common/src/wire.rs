use serde::{Deserialize, Serialize};

use crate::{
    bus::{DeviceFeatures, DeviceState},
    error::CommandError,
    types::HvacMode,
};

fn default_available() -> bool {
    true
}

/// Retained state a device publishes on its state topic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceStateReport {
    #[serde(default = "default_available")]
    pub available: bool,
    /// Raw platform mode; modes the wrapper does not drive are kept verbatim.
    #[serde(default)]
    pub mode: String,
    #[serde(default)]
    pub target_temperature: Option<f32>,
    #[serde(default)]
    pub current_temperature: Option<f32>,
    #[serde(default)]
    pub features: DeviceFeatures,
}

impl DeviceStateReport {
    pub fn unavailable() -> Self {
        Self {
            available: false,
            mode: String::new(),
            target_temperature: None,
            current_temperature: None,
            features: DeviceFeatures::default(),
        }
    }

    pub fn to_state(&self) -> Option<DeviceState> {
        if !self.available {
            return None;
        }
        Some(DeviceState {
            mode: HvacMode::parse(&self.mode),
            target_temperature: self.target_temperature.filter(|value| value.is_finite()),
            current_temperature: self.current_temperature.filter(|value| value.is_finite()),
            features: self.features,
        })
    }
}

impl From<Option<DeviceState>> for DeviceStateReport {
    fn from(state: Option<DeviceState>) -> Self {
        match state {
            Some(state) => Self {
                available: true,
                mode: state.mode.map(HvacMode::as_str).unwrap_or("unknown").to_string(),
                target_temperature: state.target_temperature,
                current_temperature: state.current_temperature,
                features: state.features,
            },
            None => Self::unavailable(),
        }
    }
}

/// Command published on a device's command topic.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum DeviceCommand {
    SetHvacMode { mode: HvacMode },
    SetTemperature { temperature: f32 },
    TurnOn,
    TurnOff,
}

/// Failure a device reports for a command it could not carry out.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandErrorReport {
    #[serde(default)]
    pub code: Option<String>,
    pub message: String,
}

impl CommandErrorReport {
    pub fn to_error(&self) -> CommandError {
        CommandError::from_reason(self.code.as_deref(), &self.message)
    }
}

impl From<&CommandError> for CommandErrorReport {
    fn from(error: &CommandError) -> Self {
        Self {
            code: Some(error.kind.as_str().to_string()),
            message: error.message.clone(),
        }
    }
}
