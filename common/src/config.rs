use serde::{Deserialize, Serialize};

use crate::{
    error::ConfigError,
    types::{DeviceRole, HvacMode, RoleMap, SensorKind},
};

pub const MIN_COMMAND_COOLDOWN_SECS: u64 = 30;
pub const MAX_COMMAND_COOLDOWN_SECS: u64 = 600;
pub const MIN_UPDATE_INTERVAL_SECS: u64 = 10;
pub const MAX_UPDATE_INTERVAL_SECS: u64 = 300;

const MIN_RETRY_DELAY_MS: u64 = 5_000;
const MAX_RETRY_DELAY_MS: u64 = 30_000;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct WrapperConfig {
    pub name: String,
    pub heating_device: Option<String>,
    pub cooling_device: Option<String>,
    pub temperature_sensor: Option<String>,
    pub humidity_sensor: Option<String>,
    pub command_cooldown_secs: u64,
    pub update_interval_secs: u64,
    pub min_temp: f32,
    pub max_temp: f32,
    pub target_step: f32,
}

impl Default for WrapperConfig {
    fn default() -> Self {
        Self {
            name: "Climate Wrapper".to_string(),
            heating_device: None,
            cooling_device: None,
            temperature_sensor: None,
            humidity_sensor: None,
            command_cooldown_secs: 120,
            update_interval_secs: 30,
            min_temp: 16.0,
            max_temp: 30.0,
            target_step: 0.5,
        }
    }
}

impl WrapperConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.heating_device.is_none() && self.cooling_device.is_none() {
            return Err(ConfigError::NoDevices);
        }

        check_range(
            "command_cooldown_secs",
            self.command_cooldown_secs,
            MIN_COMMAND_COOLDOWN_SECS,
            MAX_COMMAND_COOLDOWN_SECS,
        )?;
        check_range(
            "update_interval_secs",
            self.update_interval_secs,
            MIN_UPDATE_INTERVAL_SECS,
            MAX_UPDATE_INTERVAL_SECS,
        )?;

        Ok(())
    }

    pub fn sanitize(&mut self) {
        self.command_cooldown_secs = self
            .command_cooldown_secs
            .clamp(MIN_COMMAND_COOLDOWN_SECS, MAX_COMMAND_COOLDOWN_SECS);
        self.update_interval_secs = self
            .update_interval_secs
            .clamp(MIN_UPDATE_INTERVAL_SECS, MAX_UPDATE_INTERVAL_SECS);

        // Bounds are fixed by policy rather than taken from the devices.
        self.min_temp = 16.0;
        self.max_temp = 30.0;
        self.target_step = 0.5;

        self.heating_device = self.heating_device.take().filter(|id| !id.trim().is_empty());
        self.cooling_device = self.cooling_device.take().filter(|id| !id.trim().is_empty());
        self.temperature_sensor = self
            .temperature_sensor
            .take()
            .filter(|id| !id.trim().is_empty());
        self.humidity_sensor = self.humidity_sensor.take().filter(|id| !id.trim().is_empty());
    }

    pub fn cooldown_ms(&self) -> u64 {
        self.command_cooldown_secs.saturating_mul(1_000)
    }

    pub fn retry_delay_ms(&self) -> u64 {
        self.cooldown_ms()
            .clamp(MIN_RETRY_DELAY_MS, MAX_RETRY_DELAY_MS)
    }

    pub fn update_interval_ms(&self) -> u64 {
        self.update_interval_secs.saturating_mul(1_000)
    }

    pub fn device(&self, role: DeviceRole) -> Option<&str> {
        match role {
            DeviceRole::Heating => self.heating_device.as_deref(),
            DeviceRole::Cooling => self.cooling_device.as_deref(),
        }
    }

    pub fn has_device(&self, role: DeviceRole) -> bool {
        self.device(role).is_some()
    }

    pub fn devices(&self) -> RoleMap<Option<&str>> {
        RoleMap::new(self.heating_device.as_deref(), self.cooling_device.as_deref())
    }

    pub fn sensor(&self, kind: SensorKind) -> Option<&str> {
        match kind {
            SensorKind::Temperature => self.temperature_sensor.as_deref(),
            SensorKind::Humidity => self.humidity_sensor.as_deref(),
        }
    }

    pub fn supported_modes(&self) -> Vec<HvacMode> {
        let mut modes = vec![HvacMode::Off];
        if self.heating_device.is_some() {
            modes.push(HvacMode::Heat);
        }
        if self.cooling_device.is_some() {
            modes.push(HvacMode::Cool);
        }
        modes
    }

    pub fn supports_mode(&self, mode: HvacMode) -> bool {
        match mode {
            HvacMode::Off => true,
            HvacMode::Heat => self.heating_device.is_some(),
            HvacMode::Cool => self.cooling_device.is_some(),
        }
    }
}

fn check_range(field: &'static str, value: u64, min: u64, max: u64) -> Result<(), ConfigError> {
    if (min..=max).contains(&value) {
        Ok(())
    } else {
        Err(ConfigError::OutOfRange {
            field,
            value: value as f64,
            min: min as f64,
            max: max as f64,
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    pub mqtt_host: String,
    pub mqtt_port: u16,
    pub mqtt_user: String,
    pub mqtt_pass: String,
    pub http_port: u16,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            mqtt_host: "127.0.0.1".to_string(),
            mqtt_port: 1883,
            mqtt_user: String::new(),
            mqtt_pass: String::new(),
            http_port: 8080,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RuntimeConfig {
    #[serde(default)]
    pub wrapper: WrapperConfig,
    #[serde(default)]
    pub network: NetworkConfig,
}
