use tracing::{debug, info, warn};

use crate::{
    bus::DeviceBus,
    error::{ControllerError, ErrorClass, Result},
    ledger::IssuedCommand,
    thermostat::ClimateController,
    types::{DeviceRole, HvacMode},
};

/// Reported setpoint counts as satisfied within this distance.
pub const TEMPERATURE_TOLERANCE: f32 = 0.05;
/// A re-issue inside the cooldown is skipped unless the device drifted further.
const COOLDOWN_DRIFT_TOLERANCE: f32 = 0.5;

pub(crate) fn close(a: f32, b: f32, tolerance: f32) -> bool {
    (a - b).abs() <= tolerance
}

impl<B: DeviceBus> ClimateController<B> {
    /// Drives `role` towards `mode`.
    ///
    /// `Ok(true)` means the device reports (or was just commanded into) the
    /// mode, `Ok(false)` means the command is deferred or in flight.
    pub(crate) fn ensure_hvac_mode(
        &mut self,
        role: DeviceRole,
        mode: HvacMode,
        now_ms: u64,
    ) -> Result<bool> {
        let cooldown_ms = self.config.cooldown_ms();

        let Some(state) = self.bus.device_state(role) else {
            debug!(
                role = role.as_str(),
                mode = mode.as_str(),
                "device unavailable; deferring mode"
            );
            self.schedule_hvac_retry(role, mode, now_ms);
            return Ok(false);
        };

        if state.reports(mode) {
            self.ledgers[role].confirm_mode();
            return Ok(true);
        }

        if let Some(last) = self.ledgers[role].last_hvac_command {
            if last.value == mode && last.within(cooldown_ms, now_ms) {
                debug!(role = role.as_str(), mode = mode.as_str(), "mode command in cooldown");
                let ledger = &mut self.ledgers[role];
                // A retry that lands inside the window waits for it to close.
                if ledger.pending_mode == Some(mode) && ledger.hvac_retry.is_none() {
                    ledger.arm_hvac_retry(mode, last.at_ms.saturating_add(cooldown_ms));
                }
                return Ok(false);
            }
        }

        match self.bus.set_hvac_mode(role, mode) {
            Ok(()) => {
                info!(role = role.as_str(), mode = mode.as_str(), "set hvac mode");
                let ledger = &mut self.ledgers[role];
                ledger.last_hvac_command = Some(IssuedCommand::new(mode, now_ms));
                ledger.pending_mode = None;
                ledger.cancel_hvac_retry();
                Ok(true)
            }
            Err(err) => match err.class() {
                ErrorClass::PowerOff if mode == HvacMode::Off => {
                    self.ledgers[role].confirm_mode();
                    Ok(true)
                }
                ErrorClass::PowerOff => {
                    if self.try_turn_on(role) {
                        self.schedule_hvac_retry(role, mode, now_ms);
                        self.ledgers[role].last_hvac_command =
                            Some(IssuedCommand::new(mode, now_ms));
                    } else {
                        warn!(
                            role = role.as_str(),
                            mode = mode.as_str(),
                            "device powered off and cannot be turned on"
                        );
                        let ledger = &mut self.ledgers[role];
                        ledger.pending_mode = None;
                        ledger.cancel_hvac_retry();
                    }
                    Ok(false)
                }
                ErrorClass::Transient => {
                    warn!(
                        role = role.as_str(),
                        mode = mode.as_str(),
                        error = %err,
                        "mode command failed; retrying"
                    );
                    self.schedule_hvac_retry(role, mode, now_ms);
                    self.ledgers[role].last_hvac_command = Some(IssuedCommand::new(mode, now_ms));
                    Ok(false)
                }
                ErrorClass::Fatal => {
                    let ledger = &mut self.ledgers[role];
                    ledger.pending_mode = None;
                    ledger.cancel_hvac_retry();
                    Err(ControllerError::Command { role, source: err })
                }
            },
        }
    }

    /// Drives the device setpoint of `role` towards `value`.
    pub(crate) fn ensure_temperature(
        &mut self,
        role: DeviceRole,
        value: f32,
        expect_power_on: bool,
        now_ms: u64,
    ) -> Result<()> {
        let cooldown_ms = self.config.cooldown_ms();

        let Some(state) = self.bus.device_state(role) else {
            debug!(role = role.as_str(), value, "device unavailable; deferring setpoint");
            self.ledgers[role].pending_temperature = Some(value);
            self.schedule_temp_retry(role, value, now_ms);
            return Ok(());
        };

        if expect_power_on && state.reports(HvacMode::Off) {
            self.ledgers[role].pending_temperature = Some(value);
            self.try_turn_on(role);
            self.schedule_temp_retry(role, value, now_ms);
            return Ok(());
        }

        let current = state.target_temperature;
        if let Some(current) = current {
            if close(current, value, TEMPERATURE_TOLERANCE) {
                self.ledgers[role].confirm_temperature(current);
                return Ok(());
            }
        }

        let ledger = &mut self.ledgers[role];
        let repeated_in_cooldown = ledger.last_temp_command.is_some_and(|last| {
            close(last.value, value, TEMPERATURE_TOLERANCE) && last.within(cooldown_ms, now_ms)
        });
        let drifted =
            current.map_or(true, |current| !close(current, value, COOLDOWN_DRIFT_TOLERANCE));
        if repeated_in_cooldown && !drifted {
            debug!(role = role.as_str(), value, "setpoint command in cooldown");
            ledger.pending_temperature.get_or_insert(value);
            return Ok(());
        }

        ledger.pending_temperature = Some(value);
        match self.bus.set_temperature(role, value) {
            Ok(()) => {
                info!(role = role.as_str(), value, "set temperature");
                let ledger = &mut self.ledgers[role];
                ledger.last_temp_command = Some(IssuedCommand::new(value, now_ms));
                ledger.cancel_temp_retry();
                Ok(())
            }
            Err(err) => match err.class() {
                ErrorClass::PowerOff if expect_power_on => {
                    self.try_turn_on(role);
                    self.ledgers[role].last_temp_command = Some(IssuedCommand::new(value, now_ms));
                    self.schedule_temp_retry(role, value, now_ms);
                    Ok(())
                }
                ErrorClass::PowerOff | ErrorClass::Transient => {
                    warn!(
                        role = role.as_str(),
                        value,
                        error = %err,
                        "setpoint command failed; retrying"
                    );
                    self.ledgers[role].last_temp_command = Some(IssuedCommand::new(value, now_ms));
                    self.schedule_temp_retry(role, value, now_ms);
                    Ok(())
                }
                ErrorClass::Fatal => {
                    let ledger = &mut self.ledgers[role];
                    ledger.pending_temperature = None;
                    ledger.cancel_temp_retry();
                    Err(ControllerError::Command { role, source: err })
                }
            },
        }
    }

    /// Powers the device on when it is available and advertises the
    /// capability. Returns whether the command succeeded.
    pub(crate) fn try_turn_on(&mut self, role: DeviceRole) -> bool {
        let Some(state) = self.bus.device_state(role) else {
            return false;
        };
        if !state.features.turn_on {
            return false;
        }
        match self.bus.turn_on(role) {
            Ok(()) => {
                debug!(role = role.as_str(), "turned device on");
                true
            }
            Err(err) => {
                warn!(role = role.as_str(), error = %err, "turn on failed");
                false
            }
        }
    }

    /// Powers the device off. A device that answers "already off" counts as
    /// success.
    pub(crate) fn try_turn_off(&mut self, role: DeviceRole) -> bool {
        let Some(state) = self.bus.device_state(role) else {
            return false;
        };
        if !state.features.turn_off {
            return false;
        }
        match self.bus.turn_off(role) {
            Ok(()) => {
                debug!(role = role.as_str(), "turned device off");
                true
            }
            Err(err) if err.class() == ErrorClass::PowerOff => true,
            Err(err) => {
                warn!(role = role.as_str(), error = %err, "turn off failed");
                false
            }
        }
    }

    fn schedule_hvac_retry(&mut self, role: DeviceRole, mode: HvacMode, now_ms: u64) {
        let due_ms = now_ms.saturating_add(self.config.retry_delay_ms());
        self.ledgers[role].arm_hvac_retry(mode, due_ms);
    }

    fn schedule_temp_retry(&mut self, role: DeviceRole, value: f32, now_ms: u64) {
        let due_ms = now_ms.saturating_add(self.config.retry_delay_ms());
        self.ledgers[role].arm_temp_retry(value, due_ms);
    }

    /// Earliest armed retry across both devices.
    pub fn next_retry_due(&self) -> Option<u64> {
        DeviceRole::ALL
            .into_iter()
            .flat_map(|role| {
                let ledger = &self.ledgers[role];
                [
                    ledger.hvac_retry.map(|timer| timer.due_ms),
                    ledger.temp_retry.map(|timer| timer.due_ms),
                ]
            })
            .flatten()
            .min()
    }

    /// Fires every retry that is due. A retry whose pending value changed
    /// since it was armed does nothing.
    pub fn run_due_retries(&mut self, now_ms: u64) -> Result<()> {
        let mut fired = false;

        for role in DeviceRole::ALL {
            if let Some(timer) = self.ledgers[role].take_due_hvac_retry(now_ms) {
                if self.ledgers[role].pending_mode == Some(timer.armed_for) {
                    fired = true;
                    self.with_guard(|controller| {
                        controller.ensure_hvac_mode(role, timer.armed_for, now_ms)
                    })?;
                } else {
                    debug!(role = role.as_str(), "dropping stale mode retry");
                }
            }

            if let Some(timer) = self.ledgers[role].take_due_temp_retry(now_ms) {
                match self.ledgers[role].pending_temperature {
                    Some(pending) if close(pending, timer.armed_for, TEMPERATURE_TOLERANCE) => {
                        fired = true;
                        self.with_guard(|controller| {
                            controller.ensure_temperature(role, pending, true, now_ms)
                        })?;
                    }
                    _ => debug!(role = role.as_str(), "dropping stale setpoint retry"),
                }
            }
        }

        if fired {
            self.update_action();
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::WrapperConfig,
        error::{CommandError, CommandErrorKind},
        sim::{IssuedCall, SimulatedDevices},
    };
    use pretty_assertions::assert_eq;

    fn heater_only() -> ClimateController<SimulatedDevices> {
        let config = WrapperConfig {
            heating_device: Some("climate.heater".to_string()),
            ..WrapperConfig::default()
        };
        let bus = SimulatedDevices::for_config(&config);
        ClimateController::new(config, bus).unwrap()
    }

    #[test]
    fn confirmed_mode_issues_nothing() {
        let mut controller = heater_only();
        controller.bus_mut().devices.heating.mode = Some(HvacMode::Heat);

        let ready = controller
            .ensure_hvac_mode(DeviceRole::Heating, HvacMode::Heat, 1_000)
            .unwrap();

        assert!(ready);
        assert!(controller.bus().calls.is_empty());
    }

    #[test]
    fn repeated_mode_inside_cooldown_is_skipped() {
        let mut controller = heater_only();
        controller.bus_mut().devices.heating.sticky = true;

        assert!(controller
            .ensure_hvac_mode(DeviceRole::Heating, HvacMode::Heat, 1_000)
            .unwrap());
        assert!(!controller
            .ensure_hvac_mode(DeviceRole::Heating, HvacMode::Heat, 60_000)
            .unwrap());
        assert_eq!(controller.bus().calls.len(), 1);

        controller
            .ensure_hvac_mode(DeviceRole::Heating, HvacMode::Heat, 121_000)
            .unwrap();
        assert_eq!(controller.bus().calls.len(), 2);
    }

    #[test]
    fn power_off_error_turns_device_on_and_retries() {
        let mut controller = heater_only();
        controller.bus_mut().devices.heating.fail_next(CommandError::new(
            CommandErrorKind::PowerOff,
            "device is in power off state",
        ));

        let ready = controller
            .ensure_hvac_mode(DeviceRole::Heating, HvacMode::Heat, 1_000)
            .unwrap();

        assert!(!ready);
        assert_eq!(
            controller.bus().calls,
            vec![
                IssuedCall::SetHvacMode(DeviceRole::Heating, HvacMode::Heat),
                IssuedCall::TurnOn(DeviceRole::Heating),
            ]
        );
        assert_eq!(
            controller.ledger(DeviceRole::Heating).hvac_retry.map(|t| t.due_ms),
            Some(31_000)
        );
    }

    #[test]
    fn power_off_error_while_commanding_off_counts_as_done() {
        let mut controller = heater_only();
        controller.bus_mut().devices.heating.mode = Some(HvacMode::Heat);
        controller.bus_mut().devices.heating.fail_next(CommandError::new(
            CommandErrorKind::PowerOff,
            "already power off",
        ));

        let ready = controller
            .ensure_hvac_mode(DeviceRole::Heating, HvacMode::Off, 1_000)
            .unwrap();

        assert!(ready);
        assert_eq!(controller.ledger(DeviceRole::Heating).pending_mode, None);
    }

    #[test]
    fn fatal_error_clears_pending_and_propagates() {
        let mut controller = heater_only();
        controller
            .bus_mut()
            .devices
            .heating
            .fail_next(CommandError::from_reason(None, "entity not found"));

        let err = controller
            .ensure_hvac_mode(DeviceRole::Heating, HvacMode::Heat, 1_000)
            .unwrap_err();

        assert!(matches!(
            err,
            ControllerError::Command {
                role: DeviceRole::Heating,
                ..
            }
        ));
        let ledger = controller.ledger(DeviceRole::Heating);
        assert_eq!(ledger.pending_mode, None);
        assert!(ledger.hvac_retry.is_none());
    }

    #[test]
    fn setpoint_within_tolerance_is_adopted() {
        let mut controller = heater_only();
        controller.bus_mut().devices.heating.mode = Some(HvacMode::Heat);
        controller.bus_mut().devices.heating.target_temperature = Some(21.03);

        controller
            .ensure_temperature(DeviceRole::Heating, 21.0, true, 1_000)
            .unwrap();

        assert!(controller.bus().calls.is_empty());
        assert_eq!(
            controller.ledger(DeviceRole::Heating).adopted_temperature,
            Some(21.03)
        );
    }

    #[test]
    fn repeated_setpoint_inside_cooldown_is_sent_once_until_device_drifts() {
        let mut controller = heater_only();
        let heater = &mut controller.bus_mut().devices.heating;
        heater.mode = Some(HvacMode::Heat);
        heater.target_temperature = Some(22.7);
        heater.sticky = true;
        let setpoint_commands = |controller: &ClimateController<SimulatedDevices>| {
            controller
                .bus()
                .calls
                .iter()
                .filter(|call| matches!(call, IssuedCall::SetTemperature(..)))
                .count()
        };

        controller
            .ensure_temperature(DeviceRole::Heating, 23.0, true, 1_000)
            .unwrap();
        controller
            .ensure_temperature(DeviceRole::Heating, 23.0, true, 60_000)
            .unwrap();
        assert_eq!(setpoint_commands(&controller), 1);
        assert_eq!(
            controller.ledger(DeviceRole::Heating).pending_temperature,
            Some(23.0)
        );

        controller.bus_mut().devices.heating.target_temperature = Some(21.0);
        controller
            .ensure_temperature(DeviceRole::Heating, 23.0, true, 70_000)
            .unwrap();
        assert_eq!(setpoint_commands(&controller), 2);
    }

    #[test]
    fn setpoint_for_powered_off_device_waits_for_power() {
        let mut controller = heater_only();
        controller.bus_mut().devices.heating.features.turn_on = false;

        controller
            .ensure_temperature(DeviceRole::Heating, 23.0, true, 1_000)
            .unwrap();

        let ledger = controller.ledger(DeviceRole::Heating);
        assert_eq!(ledger.pending_temperature, Some(23.0));
        assert_eq!(ledger.temp_retry.map(|t| t.armed_for), Some(23.0));
        assert!(controller.bus().calls.is_empty());
    }

    #[test]
    fn stale_setpoint_retry_is_dropped() {
        let mut controller = heater_only();
        controller.bus_mut().devices.heating.available = false;
        controller
            .ensure_temperature(DeviceRole::Heating, 23.0, true, 1_000)
            .unwrap();

        controller.ledgers[DeviceRole::Heating].pending_temperature = Some(24.0);
        controller.bus_mut().devices.heating.available = true;
        controller.bus_mut().devices.heating.mode = Some(HvacMode::Heat);
        controller.run_due_retries(31_000).unwrap();

        assert!(controller.bus().calls.is_empty());
        assert!(controller.ledger(DeviceRole::Heating).temp_retry.is_none());
    }

    #[test]
    fn due_retry_reissues_mode_once_device_returns() {
        let mut controller = heater_only();
        controller.bus_mut().devices.heating.available = false;
        controller
            .ensure_hvac_mode(DeviceRole::Heating, HvacMode::Heat, 1_000)
            .unwrap();
        assert_eq!(controller.next_retry_due(), Some(31_000));

        controller.bus_mut().devices.heating.available = true;
        controller.run_due_retries(30_999).unwrap();
        assert!(controller.bus().calls.is_empty());

        controller.run_due_retries(31_000).unwrap();
        assert_eq!(
            controller.bus().calls,
            vec![IssuedCall::SetHvacMode(DeviceRole::Heating, HvacMode::Heat)]
        );
        assert!(!controller.is_controlling_devices());
    }

    #[test]
    fn try_turn_off_treats_power_off_as_success() {
        let mut controller = heater_only();
        controller.bus_mut().devices.heating.fail_next(CommandError::new(
            CommandErrorKind::PowerOff,
            "already power off",
        ));
        assert!(controller.try_turn_off(DeviceRole::Heating));

        controller.bus_mut().devices.heating.features.turn_off = false;
        assert!(!controller.try_turn_off(DeviceRole::Heating));
    }
}
