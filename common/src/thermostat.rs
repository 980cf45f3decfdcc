use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::{
    adoption::RestoreSnapshot,
    bus::DeviceBus,
    config::WrapperConfig,
    error::{ConfigError, ControllerError, Result},
    ledger::CommandLedger,
    targets::Targets,
    types::{
        ControllerStatus, DeviceRole, HvacAction, HvacMode, RoleMap, RoleStatus, RunningMode,
        SensorKind,
    },
};

/// A temperature change requested by the user. Any combination of fields
/// may be present.
#[derive(Debug, Clone, Copy, Default, PartialEq, Deserialize)]
pub struct TemperatureRequest {
    #[serde(default)]
    pub temperature: Option<f32>,
    #[serde(default)]
    pub target_low: Option<f32>,
    #[serde(default)]
    pub target_high: Option<f32>,
}

impl TemperatureRequest {
    pub fn single(value: f32) -> Self {
        Self {
            temperature: Some(value),
            ..Self::default()
        }
    }

    fn validate(&self) -> Result<()> {
        for value in [self.temperature, self.target_low, self.target_high]
            .into_iter()
            .flatten()
        {
            if !value.is_finite() {
                return Err(ControllerError::InvalidTemperature(value));
            }
        }
        Ok(())
    }
}

/// Desired mode and optional setpoint for one device in a command batch.
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) struct DevicePlan {
    pub mode: HvacMode,
    pub temperature: Option<f32>,
}

impl DevicePlan {
    const OFF: Self = Self {
        mode: HvacMode::Off,
        temperature: None,
    };
}

/// Virtual dual-setpoint thermostat driving one heating and/or one cooling
/// device through a [`DeviceBus`].
///
/// Every trigger (sensor tick, device echo, user command, startup) funnels
/// into [`ClimateController::ensure_consistency`].
#[derive(Debug)]
pub struct ClimateController<B> {
    pub(crate) config: WrapperConfig,
    pub(crate) bus: B,

    pub(crate) hvac_mode: HvacMode,
    pub(crate) running_mode: RunningMode,
    pub(crate) last_active_mode: HvacMode,
    pub(crate) action: HvacAction,

    pub(crate) targets: Targets,
    pub(crate) current_temperature: Option<f32>,
    pub(crate) current_humidity: Option<f32>,

    pub(crate) ledgers: RoleMap<CommandLedger>,
    // Held while a command batch runs; device notifications are ignored meanwhile.
    pub(crate) controlling_devices: bool,
}

impl<B: DeviceBus> ClimateController<B> {
    pub fn new(config: WrapperConfig, bus: B) -> std::result::Result<Self, ConfigError> {
        config.validate()?;

        let last_active_mode = if config.heating_device.is_some() {
            HvacMode::Heat
        } else {
            HvacMode::Cool
        };
        let targets = Targets::new(config.min_temp, config.max_temp);

        Ok(Self {
            config,
            bus,
            hvac_mode: HvacMode::Off,
            running_mode: RunningMode::Idle,
            last_active_mode,
            action: HvacAction::Off,
            targets,
            current_temperature: None,
            current_humidity: None,
            ledgers: RoleMap::default(),
            controlling_devices: false,
        })
    }

    pub fn config(&self) -> &WrapperConfig {
        &self.config
    }

    pub fn bus(&self) -> &B {
        &self.bus
    }

    pub fn bus_mut(&mut self) -> &mut B {
        &mut self.bus
    }

    pub fn hvac_mode(&self) -> HvacMode {
        self.hvac_mode
    }

    pub fn running_mode(&self) -> RunningMode {
        self.running_mode
    }

    pub fn last_active_mode(&self) -> HvacMode {
        self.last_active_mode
    }

    pub fn action(&self) -> HvacAction {
        self.action
    }

    pub fn targets(&self) -> &Targets {
        &self.targets
    }

    pub fn current_temperature(&self) -> Option<f32> {
        self.current_temperature
    }

    pub fn current_humidity(&self) -> Option<f32> {
        self.current_humidity
    }

    pub fn ledger(&self, role: DeviceRole) -> &CommandLedger {
        &self.ledgers[role]
    }

    pub fn is_controlling_devices(&self) -> bool {
        self.controlling_devices
    }

    /// Sensor references the host must watch.
    pub fn watched_sensors(&self) -> Vec<&str> {
        [SensorKind::Temperature, SensorKind::Humidity]
            .into_iter()
            .filter_map(|kind| self.config.sensor(kind))
            .collect()
    }

    /// Device references the host must watch.
    pub fn watched_devices(&self) -> Vec<&str> {
        DeviceRole::ALL
            .into_iter()
            .filter_map(|role| self.config.device(role))
            .collect()
    }

    // ---- lifecycle and event entry points ----

    pub fn startup(&mut self, snapshot: Option<&RestoreSnapshot>, now_ms: u64) -> Result<()> {
        if let Some(snapshot) = snapshot {
            self.restore_from_snapshot(snapshot);
        }
        self.update_measurements();
        self.adopt_device_state(true, now_ms);
        self.ensure_consistency("startup", true, now_ms)
    }

    pub fn handle_sensor_change(&mut self, now_ms: u64) -> Result<()> {
        self.update_measurements();
        self.ensure_consistency("sensor_update", false, now_ms)
    }

    /// Periodic coordinator tick.
    pub fn refresh(&mut self, now_ms: u64) -> Result<()> {
        self.update_measurements();
        self.ensure_consistency("refresh", false, now_ms)
    }

    pub fn handle_device_change(&mut self, role: DeviceRole, now_ms: u64) -> Result<()> {
        if self.controlling_devices {
            debug!(role = role.as_str(), "ignoring device change during command batch");
            return Ok(());
        }
        if !self.config.has_device(role) {
            return Ok(());
        }

        if let Some(state) = self.bus.device_state(role) {
            self.adopt_target_from_device(role, &state, now_ms);
        }
        self.adopt_device_state(false, now_ms);
        self.ensure_consistency("device_change", false, now_ms)
    }

    /// Cancels every armed retry. Call before dropping the controller.
    pub fn shutdown(&mut self) {
        for role in DeviceRole::ALL {
            self.ledgers[role].cancel_all();
        }
        info!(name = %self.config.name, "controller shut down");
    }

    // ---- user commands ----

    pub fn set_temperature(&mut self, request: TemperatureRequest, now_ms: u64) -> Result<()> {
        request.validate()?;

        match self.hvac_mode {
            HvacMode::Heat => {
                if let Some(value) = request.temperature.or(request.target_low) {
                    self.targets.set_heat(value);
                }
                if let Some(high) = request.target_high {
                    self.targets.set_cool(high);
                }
                if self.targets.cool() < self.targets.heat() {
                    self.targets.set_cool(self.targets.heat());
                }
                self.targets.set_target(self.targets.heat());
                self.last_active_mode = HvacMode::Heat;
            }
            HvacMode::Cool => {
                if let Some(value) = request.temperature.or(request.target_high) {
                    self.targets.set_cool(value);
                }
                if let Some(low) = request.target_low {
                    self.targets.set_heat(low);
                }
                if self.targets.heat() > self.targets.cool() {
                    self.targets.set_heat(self.targets.cool());
                }
                self.targets.set_target(self.targets.cool());
                self.last_active_mode = HvacMode::Cool;
            }
            HvacMode::Off => {
                let mut heat = request
                    .target_low
                    .map(|low| self.targets.clamp(low))
                    .unwrap_or(self.targets.heat());
                let mut cool = request
                    .target_high
                    .map(|high| self.targets.clamp(high))
                    .unwrap_or(self.targets.cool());

                if let (Some(value), None, None) =
                    (request.temperature, request.target_low, request.target_high)
                {
                    heat = self.targets.clamp(value);
                    cool = heat;
                }
                if heat > cool {
                    std::mem::swap(&mut heat, &mut cool);
                }

                self.targets.set_heat(heat);
                self.targets.set_cool(cool);
                self.targets.set_target(if self.last_active_mode == HvacMode::Cool {
                    cool
                } else {
                    heat
                });
            }
        }

        self.apply_limits();
        self.ensure_consistency("set_temperature", true, now_ms)
    }

    pub fn set_hvac_mode(&mut self, mode: HvacMode, now_ms: u64) -> Result<()> {
        let mode = if self.config.supports_mode(mode) {
            mode
        } else {
            debug!(mode = mode.as_str(), "unsupported hvac mode; falling back to off");
            HvacMode::Off
        };

        if mode == self.hvac_mode {
            return self.ensure_consistency("hvac_mode_reassert", true, now_ms);
        }

        let previous_running = self.running_mode;
        self.hvac_mode = mode;

        match mode {
            HvacMode::Off => {
                self.running_mode = RunningMode::Idle;
                let target = match previous_running {
                    RunningMode::Heating => self.targets.heat(),
                    RunningMode::Cooling => self.targets.cool(),
                    RunningMode::Idle => self.targets.target(),
                };
                self.targets.set_target(target);
            }
            HvacMode::Heat => {
                self.running_mode = RunningMode::Heating;
                self.targets.set_target(self.targets.heat());
                self.last_active_mode = HvacMode::Heat;
            }
            HvacMode::Cool => {
                self.running_mode = RunningMode::Cooling;
                self.targets.set_target(self.targets.cool());
                self.last_active_mode = HvacMode::Cool;
            }
        }

        self.apply_limits();
        self.ensure_consistency("hvac_mode_change", true, now_ms)
    }

    pub fn turn_on(&mut self, now_ms: u64) -> Result<()> {
        let preferred = if self.last_active_mode.is_active()
            && self.config.supports_mode(self.last_active_mode)
        {
            self.last_active_mode
        } else if self.config.heating_device.is_some() {
            HvacMode::Heat
        } else {
            HvacMode::Cool
        };
        self.set_hvac_mode(preferred, now_ms)
    }

    pub fn turn_off(&mut self, now_ms: u64) -> Result<()> {
        self.set_hvac_mode(HvacMode::Off, now_ms)
    }

    // ---- target arbiter ----

    pub(crate) fn apply_limits(&mut self) {
        self.targets
            .apply_limits(self.hvac_mode, self.last_active_mode);
    }

    // ---- mode reconciler ----

    pub fn decide_running_mode(&self) -> RunningMode {
        match self.hvac_mode {
            HvacMode::Off => RunningMode::Idle,
            HvacMode::Heat => RunningMode::Heating,
            HvacMode::Cool => RunningMode::Cooling,
        }
    }

    /// True when every configured device's observed power mode agrees with
    /// `mode`.
    pub fn devices_match(&self, mode: RunningMode) -> bool {
        DeviceRole::ALL.into_iter().all(|role| {
            if !self.config.has_device(role) {
                return true;
            }
            let active = self.device_reports(role, role.active_mode());
            match mode.role() {
                Some(wanted) if wanted == role => active,
                _ => !active,
            }
        })
    }

    pub(crate) fn device_reports(&self, role: DeviceRole, mode: HvacMode) -> bool {
        self.bus
            .device_state(role)
            .is_some_and(|state| state.reports(mode))
    }

    pub fn ensure_consistency(
        &mut self,
        reason: &str,
        force_apply: bool,
        now_ms: u64,
    ) -> Result<()> {
        let desired = self.decide_running_mode();

        if desired == RunningMode::Idle {
            self.running_mode = RunningMode::Idle;
            self.turn_off_all(reason, now_ms)?;
            self.apply_limits();
            self.update_action();
            return Ok(());
        }

        if force_apply || desired != self.running_mode || !self.devices_match(desired) {
            debug!(reason, mode = desired.as_str(), "switching running mode");
            if let Some(role) = desired.role() {
                self.activate(role, now_ms)?;
            }
            self.running_mode = desired;
        } else {
            self.sync_active_device_temperature(now_ms)?;
        }

        self.apply_limits();
        self.update_action();
        Ok(())
    }

    fn activate(&mut self, role: DeviceRole, now_ms: u64) -> Result<()> {
        if !self.config.has_device(role) {
            warn!(role = role.as_str(), "cannot activate: no device configured");
            return Ok(());
        }

        let target = self.role_target(role);
        self.targets.set_target(target);
        self.last_active_mode = role.active_mode();
        info!(role = role.as_str(), target, "activating device");

        let mut plan = RoleMap::new(DevicePlan::OFF, DevicePlan::OFF);
        plan[role] = DevicePlan {
            mode: role.active_mode(),
            temperature: Some(target),
        };
        self.apply_device_states(plan, now_ms)
    }

    fn turn_off_all(&mut self, reason: &str, now_ms: u64) -> Result<()> {
        debug!(reason, "turning all devices off");
        self.apply_device_states(RoleMap::new(DevicePlan::OFF, DevicePlan::OFF), now_ms)
    }

    fn sync_active_device_temperature(&mut self, now_ms: u64) -> Result<()> {
        let Some(role) = self.running_mode.role() else {
            return Ok(());
        };
        if !self.config.has_device(role) {
            return Ok(());
        }

        let target = self.role_target(role);
        self.targets.set_target(target);
        self.with_guard(|controller| controller.ensure_temperature(role, target, true, now_ms))
    }

    pub(crate) fn role_target(&self, role: DeviceRole) -> f32 {
        match role {
            DeviceRole::Heating => self.targets.heat(),
            DeviceRole::Cooling => self.targets.cool(),
        }
    }

    pub(crate) fn set_role_target(&mut self, role: DeviceRole, value: f32) {
        match role {
            DeviceRole::Heating => self.targets.set_heat(value),
            DeviceRole::Cooling => self.targets.set_cool(value),
        }
        if self.hvac_mode == role.active_mode() {
            self.targets.set_target(value);
        }
    }

    fn apply_device_states(&mut self, plan: RoleMap<DevicePlan>, now_ms: u64) -> Result<()> {
        self.with_guard(|controller| {
            for role in DeviceRole::ALL {
                if !controller.config.has_device(role) {
                    continue;
                }
                let DevicePlan { mode, temperature } = plan[role];

                if mode == HvacMode::Off && !controller.device_reports(role, HvacMode::Off) {
                    controller.try_turn_off(role);
                }
                let ready = controller.ensure_hvac_mode(role, mode, now_ms)?;

                if let Some(value) = temperature {
                    controller.ensure_temperature(role, value, mode.is_active() && ready, now_ms)?;
                }
            }
            Ok(())
        })
    }

    /// Runs a device-command batch with the reentrancy guard held.
    pub(crate) fn with_guard<T>(
        &mut self,
        batch: impl FnOnce(&mut Self) -> Result<T>,
    ) -> Result<T> {
        self.controlling_devices = true;
        let result = batch(self);
        self.controlling_devices = false;
        result
    }

    // ---- measurements ----

    pub fn update_measurements(&mut self) {
        if self.config.temperature_sensor.is_some() {
            if let Some(value) = self
                .bus
                .sensor_value(SensorKind::Temperature)
                .filter(|value| value.is_finite())
            {
                self.current_temperature = Some(value);
            }
        } else {
            let readings: Vec<f32> = DeviceRole::ALL
                .into_iter()
                .filter(|role| self.config.has_device(*role))
                .filter_map(|role| self.bus.device_state(role))
                .filter_map(|state| state.current_temperature)
                .filter(|value| value.is_finite())
                .collect();
            if !readings.is_empty() {
                let mean = readings.iter().sum::<f32>() / readings.len() as f32;
                self.current_temperature = Some(mean);
            }
        }

        if self.config.humidity_sensor.is_some() {
            if let Some(value) = self
                .bus
                .sensor_value(SensorKind::Humidity)
                .filter(|value| value.is_finite())
            {
                self.current_humidity = Some(value);
            }
        }
    }

    pub fn status(&self) -> ControllerStatus {
        ControllerStatus {
            name: self.config.name.clone(),
            hvac_mode: self.hvac_mode.as_str(),
            running_mode: self.running_mode.as_str(),
            hvac_action: self.action.as_str(),
            last_active_mode: self.last_active_mode.as_str(),
            supported_modes: self
                .config
                .supported_modes()
                .into_iter()
                .map(HvacMode::as_str)
                .collect(),
            current_temperature: self.current_temperature,
            current_humidity: self.current_humidity,
            target_temperature: self.targets.target(),
            target_temperature_low: self.targets.heat(),
            target_temperature_high: self.targets.cool(),
            min_temp: self.targets.min(),
            max_temp: self.targets.max(),
            target_step: self.config.target_step,
            heating: self.role_status(DeviceRole::Heating),
            cooling: self.role_status(DeviceRole::Cooling),
        }
    }

    fn role_status(&self, role: DeviceRole) -> RoleStatus {
        let ledger = &self.ledgers[role];
        RoleStatus {
            configured: self.config.has_device(role),
            pending_mode: ledger.pending_mode.map(HvacMode::as_str),
            pending_temperature: ledger.pending_temperature,
            mode_retry_armed: ledger.hvac_retry.is_some(),
            temperature_retry_armed: ledger.temp_retry.is_some(),
        }
    }
}
