use serde::{Deserialize, Serialize};

use crate::{
    error::CommandError,
    types::{DeviceRole, HvacMode, SensorKind},
};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceFeatures {
    #[serde(default)]
    pub turn_on: bool,
    #[serde(default)]
    pub turn_off: bool,
}

impl DeviceFeatures {
    pub const ALL: Self = Self {
        turn_on: true,
        turn_off: true,
    };
}

/// Last observed state of an available device.
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceState {
    /// `None` when the device runs in a mode the wrapper does not drive.
    pub mode: Option<HvacMode>,
    pub target_temperature: Option<f32>,
    pub current_temperature: Option<f32>,
    pub features: DeviceFeatures,
}

impl DeviceState {
    pub fn reports(&self, mode: HvacMode) -> bool {
        self.mode == Some(mode)
    }
}

/// State-query and command interface for the two controlled devices and
/// the optional sensors.
///
/// Queries return `None` for unavailable or unknown references. Commands
/// complete before returning; their failure reason is classified by the
/// dispatcher.
pub trait DeviceBus {
    fn device_state(&self, role: DeviceRole) -> Option<DeviceState>;

    fn sensor_value(&self, kind: SensorKind) -> Option<f32>;

    fn set_hvac_mode(&mut self, role: DeviceRole, mode: HvacMode) -> Result<(), CommandError>;

    fn set_temperature(&mut self, role: DeviceRole, value: f32) -> Result<(), CommandError>;

    fn turn_on(&mut self, role: DeviceRole) -> Result<(), CommandError>;

    fn turn_off(&mut self, role: DeviceRole) -> Result<(), CommandError>;
}
