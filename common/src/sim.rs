//! In-memory devices implementing [`DeviceBus`], shared by the tests and the
//! simulator binary.

use std::collections::VecDeque;

use crate::{
    bus::{DeviceBus, DeviceFeatures, DeviceState},
    config::WrapperConfig,
    error::{CommandError, CommandErrorKind},
    types::{DeviceRole, HvacMode, RoleMap, SensorKind},
};

/// Every command the bus received, in order, failed ones included.
#[derive(Debug, Clone, PartialEq)]
pub enum IssuedCall {
    SetHvacMode(DeviceRole, HvacMode),
    SetTemperature(DeviceRole, f32),
    TurnOn(DeviceRole),
    TurnOff(DeviceRole),
}

#[derive(Debug, Clone)]
pub struct SimulatedDevice {
    pub available: bool,
    pub mode: Option<HvacMode>,
    pub target_temperature: Option<f32>,
    pub current_temperature: Option<f32>,
    pub features: DeviceFeatures,
    /// Mode restored by `turn_on`.
    pub resume_mode: HvacMode,
    /// Refuse setpoint changes while powered off, like many split units do.
    pub reject_while_off: bool,
    /// Accept commands without changing state.
    pub sticky: bool,
    failures: VecDeque<CommandError>,
}

impl SimulatedDevice {
    pub fn new(role: DeviceRole) -> Self {
        Self {
            available: true,
            mode: Some(HvacMode::Off),
            target_temperature: Some(21.0),
            current_temperature: None,
            features: DeviceFeatures::ALL,
            resume_mode: role.active_mode(),
            reject_while_off: false,
            sticky: false,
            failures: VecDeque::new(),
        }
    }

    /// Queues an error returned by the next command.
    pub fn fail_next(&mut self, error: CommandError) {
        self.failures.push_back(error);
    }

    pub fn state(&self) -> Option<DeviceState> {
        self.available.then(|| DeviceState {
            mode: self.mode,
            target_temperature: self.target_temperature,
            current_temperature: self.current_temperature,
            features: self.features,
        })
    }

    fn accept(&mut self) -> Result<bool, CommandError> {
        if let Some(error) = self.failures.pop_front() {
            return Err(error);
        }
        if !self.available {
            return Err(CommandError::new(CommandErrorKind::Timeout, "device unavailable"));
        }
        Ok(!self.sticky)
    }

    pub fn apply_mode(&mut self, mode: HvacMode) -> Result<(), CommandError> {
        if self.accept()? {
            self.mode = Some(mode);
            if mode.is_active() {
                self.resume_mode = mode;
            }
        }
        Ok(())
    }

    pub fn apply_temperature(&mut self, value: f32) -> Result<(), CommandError> {
        if self.reject_while_off && self.mode == Some(HvacMode::Off) {
            return Err(CommandError::from_reason(
                Some("power_off"),
                "Command not supported: device is in power off state",
            ));
        }
        if self.accept()? {
            self.target_temperature = Some(value);
        }
        Ok(())
    }

    pub fn apply_turn_on(&mut self) -> Result<(), CommandError> {
        if self.accept()? {
            self.mode = Some(self.resume_mode);
        }
        Ok(())
    }

    pub fn apply_turn_off(&mut self) -> Result<(), CommandError> {
        if self.accept()? {
            self.mode = Some(HvacMode::Off);
        }
        Ok(())
    }

    pub fn is_conditioning(&self) -> bool {
        self.available && self.mode.is_some_and(HvacMode::is_active)
    }
}

#[derive(Debug, Clone)]
pub struct SimulatedDevices {
    pub devices: RoleMap<SimulatedDevice>,
    pub temperature: Option<f32>,
    pub humidity: Option<f32>,
    pub calls: Vec<IssuedCall>,
}

impl Default for SimulatedDevices {
    fn default() -> Self {
        Self {
            devices: RoleMap::new(
                SimulatedDevice::new(DeviceRole::Heating),
                SimulatedDevice::new(DeviceRole::Cooling),
            ),
            temperature: None,
            humidity: None,
            calls: Vec::new(),
        }
    }
}

impl SimulatedDevices {
    /// Devices for the roles `config` names; the others are unavailable.
    pub fn for_config(config: &WrapperConfig) -> Self {
        let mut bus = Self::default();
        for role in DeviceRole::ALL {
            bus.devices[role].available = config.has_device(role);
        }
        bus
    }
}

impl DeviceBus for SimulatedDevices {
    fn device_state(&self, role: DeviceRole) -> Option<DeviceState> {
        self.devices[role].state()
    }

    fn sensor_value(&self, kind: SensorKind) -> Option<f32> {
        match kind {
            SensorKind::Temperature => self.temperature,
            SensorKind::Humidity => self.humidity,
        }
    }

    fn set_hvac_mode(&mut self, role: DeviceRole, mode: HvacMode) -> Result<(), CommandError> {
        self.calls.push(IssuedCall::SetHvacMode(role, mode));
        self.devices[role].apply_mode(mode)
    }

    fn set_temperature(&mut self, role: DeviceRole, value: f32) -> Result<(), CommandError> {
        self.calls.push(IssuedCall::SetTemperature(role, value));
        self.devices[role].apply_temperature(value)
    }

    fn turn_on(&mut self, role: DeviceRole) -> Result<(), CommandError> {
        self.calls.push(IssuedCall::TurnOn(role));
        self.devices[role].apply_turn_on()
    }

    fn turn_off(&mut self, role: DeviceRole) -> Result<(), CommandError> {
        self.calls.push(IssuedCall::TurnOff(role));
        self.devices[role].apply_turn_off()
    }
}
