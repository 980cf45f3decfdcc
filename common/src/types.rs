use std::ops::{Index, IndexMut};

use serde::{Deserialize, Serialize};

/// User-selected operating mode. Only these three values are ever stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HvacMode {
    Off,
    Heat,
    Cool,
}

impl HvacMode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Off => "off",
            Self::Heat => "heat",
            Self::Cool => "cool",
        }
    }

    /// Parses a wire/platform mode string. Modes the wrapper does not
    /// drive (`auto`, `dry`, `fan_only`, ...) yield `None`.
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "off" => Some(Self::Off),
            "heat" => Some(Self::Heat),
            "cool" => Some(Self::Cool),
            _ => None,
        }
    }

    pub fn is_active(self) -> bool {
        self != Self::Off
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunningMode {
    Idle,
    Heating,
    Cooling,
}

impl RunningMode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Heating => "heating",
            Self::Cooling => "cooling",
        }
    }

    pub fn role(self) -> Option<DeviceRole> {
        match self {
            Self::Idle => None,
            Self::Heating => Some(DeviceRole::Heating),
            Self::Cooling => Some(DeviceRole::Cooling),
        }
    }
}

/// Reportable running action derived from live device state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HvacAction {
    Off,
    Idle,
    Heating,
    Cooling,
}

impl HvacAction {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Off => "off",
            Self::Idle => "idle",
            Self::Heating => "heating",
            Self::Cooling => "cooling",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "off" => Some(Self::Off),
            "idle" => Some(Self::Idle),
            "heating" => Some(Self::Heating),
            "cooling" => Some(Self::Cooling),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceRole {
    Heating,
    Cooling,
}

impl DeviceRole {
    pub const ALL: [DeviceRole; 2] = [DeviceRole::Heating, DeviceRole::Cooling];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Heating => "heating",
            Self::Cooling => "cooling",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "heating" => Some(Self::Heating),
            "cooling" => Some(Self::Cooling),
            _ => None,
        }
    }

    /// The power mode a device in this role reports while conditioning.
    pub fn active_mode(self) -> HvacMode {
        match self {
            Self::Heating => HvacMode::Heat,
            Self::Cooling => HvacMode::Cool,
        }
    }

    pub fn running_mode(self) -> RunningMode {
        match self {
            Self::Heating => RunningMode::Heating,
            Self::Cooling => RunningMode::Cooling,
        }
    }

    pub fn other(self) -> Self {
        match self {
            Self::Heating => Self::Cooling,
            Self::Cooling => Self::Heating,
        }
    }
}

/// Fixed-shape per-role storage.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RoleMap<T> {
    pub heating: T,
    pub cooling: T,
}

impl<T> RoleMap<T> {
    pub fn new(heating: T, cooling: T) -> Self {
        Self { heating, cooling }
    }

    pub fn iter(&self) -> impl Iterator<Item = (DeviceRole, &T)> + '_ {
        [
            (DeviceRole::Heating, &self.heating),
            (DeviceRole::Cooling, &self.cooling),
        ]
        .into_iter()
    }
}

impl<T> Index<DeviceRole> for RoleMap<T> {
    type Output = T;

    fn index(&self, role: DeviceRole) -> &T {
        match role {
            DeviceRole::Heating => &self.heating,
            DeviceRole::Cooling => &self.cooling,
        }
    }
}

impl<T> IndexMut<DeviceRole> for RoleMap<T> {
    fn index_mut(&mut self, role: DeviceRole) -> &mut T {
        match role {
            DeviceRole::Heating => &mut self.heating,
            DeviceRole::Cooling => &mut self.cooling,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SensorKind {
    Temperature,
    Humidity,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct RoleStatus {
    pub configured: bool,
    #[serde(rename = "pendingMode")]
    pub pending_mode: Option<&'static str>,
    #[serde(rename = "pendingTemperature")]
    pub pending_temperature: Option<f32>,
    #[serde(rename = "modeRetryArmed")]
    pub mode_retry_armed: bool,
    #[serde(rename = "temperatureRetryArmed")]
    pub temperature_retry_armed: bool,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ControllerStatus {
    pub name: String,
    #[serde(rename = "hvacMode")]
    pub hvac_mode: &'static str,
    #[serde(rename = "runningMode")]
    pub running_mode: &'static str,
    #[serde(rename = "hvacAction")]
    pub hvac_action: &'static str,
    #[serde(rename = "lastActiveMode")]
    pub last_active_mode: &'static str,
    #[serde(rename = "supportedModes")]
    pub supported_modes: Vec<&'static str>,
    #[serde(rename = "currentTemperature")]
    pub current_temperature: Option<f32>,
    #[serde(rename = "currentHumidity")]
    pub current_humidity: Option<f32>,
    #[serde(rename = "targetTemperature")]
    pub target_temperature: f32,
    #[serde(rename = "targetTemperatureLow")]
    pub target_temperature_low: f32,
    #[serde(rename = "targetTemperatureHigh")]
    pub target_temperature_high: f32,
    #[serde(rename = "minTemp")]
    pub min_temp: f32,
    #[serde(rename = "maxTemp")]
    pub max_temp: f32,
    #[serde(rename = "targetStep")]
    pub target_step: f32,
    pub heating: RoleStatus,
    pub cooling: RoleStatus,
}
