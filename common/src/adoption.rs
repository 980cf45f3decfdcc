use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::{
    bus::{DeviceBus, DeviceState},
    dispatcher::{close, TEMPERATURE_TOLERANCE},
    thermostat::ClimateController,
    types::{DeviceRole, HvacAction, HvacMode, RoleMap, RunningMode},
};

/// A reported setpoint this close to the pending one is our own command
/// landing.
const PENDING_SNAP_TOLERANCE: f32 = 0.15;
/// Reconciliation adopts a device setpoint this close to the pending one.
const DEFERRED_ADOPTION_TOLERANCE: f32 = 0.3;

/// Persisted user-facing state, restored on startup.
///
/// Modes are kept as raw strings so snapshots written with modes this
/// wrapper no longer drives still load.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RestoreSnapshot {
    pub hvac_mode: String,
    #[serde(default)]
    pub hvac_action: Option<String>,
    #[serde(default)]
    pub temperature: Option<f32>,
    #[serde(default)]
    pub target_temp_low: Option<f32>,
    #[serde(default)]
    pub target_temp_high: Option<f32>,
    #[serde(default)]
    pub saved_at: Option<DateTime<Utc>>,
}

impl<B: DeviceBus> ClimateController<B> {
    pub fn snapshot(&self, saved_at: DateTime<Utc>) -> RestoreSnapshot {
        RestoreSnapshot {
            hvac_mode: self.hvac_mode.as_str().to_string(),
            hvac_action: Some(self.action.as_str().to_string()),
            temperature: Some(self.targets.target()),
            target_temp_low: Some(self.targets.heat()),
            target_temp_high: Some(self.targets.cool()),
            saved_at: Some(saved_at),
        }
    }

    pub(crate) fn restore_from_snapshot(&mut self, snapshot: &RestoreSnapshot) {
        let action = snapshot
            .hvac_action
            .as_deref()
            .and_then(HvacAction::parse)
            .unwrap_or(HvacAction::Off);
        self.action = action;

        let raw = snapshot.hvac_mode.trim().to_ascii_lowercase();
        let restored = if raw == "auto" {
            Some(if action == HvacAction::Cooling {
                HvacMode::Cool
            } else {
                HvacMode::Heat
            })
        } else {
            HvacMode::parse(&raw)
        };
        if let Some(mode) = restored.filter(|mode| self.config.supports_mode(*mode)) {
            self.hvac_mode = mode;
        }

        let finite = |value: Option<f32>| value.filter(|value| value.is_finite());
        let temperature = finite(snapshot.temperature);
        let low = finite(snapshot.target_temp_low);
        let high = finite(snapshot.target_temp_high);

        match self.hvac_mode {
            HvacMode::Heat => {
                if let Some(value) = temperature.or(low) {
                    self.targets.set_heat(value);
                }
                if let Some(high) = high {
                    self.targets.set_cool(high);
                }
                self.targets.set_target(self.targets.heat());
                self.running_mode = RunningMode::Heating;
                self.last_active_mode = HvacMode::Heat;
            }
            HvacMode::Cool => {
                if let Some(value) = temperature.or(high) {
                    self.targets.set_cool(value);
                }
                if let Some(low) = low {
                    self.targets.set_heat(low);
                }
                self.targets.set_target(self.targets.cool());
                self.running_mode = RunningMode::Cooling;
                self.last_active_mode = HvacMode::Cool;
            }
            HvacMode::Off => {
                if let Some(low) = low {
                    self.targets.set_heat(low);
                }
                if let Some(high) = high {
                    self.targets.set_cool(high);
                }
                let fallback = if self.last_active_mode == HvacMode::Heat {
                    self.targets.heat()
                } else {
                    self.targets.cool()
                };
                self.targets.set_target(temperature.unwrap_or(fallback));
                self.running_mode = RunningMode::Idle;
            }
        }

        self.apply_limits();
        info!(
            mode = self.hvac_mode.as_str(),
            heat = self.targets.heat(),
            cool = self.targets.cool(),
            "restored previous state"
        );
    }

    /// Folds a setpoint the device reports into our own targets, unless it
    /// is the echo of a command still in flight.
    pub(crate) fn adopt_target_from_device(
        &mut self,
        role: DeviceRole,
        state: &DeviceState,
        now_ms: u64,
    ) {
        if state.reports(HvacMode::Off) {
            return;
        }
        let Some(reported) = state.target_temperature.filter(|value| value.is_finite()) else {
            return;
        };

        let cooldown_ms = self.config.cooldown_ms();
        let mut value = self.targets.clamp(reported);
        let ledger = &mut self.ledgers[role];
        let pending = ledger.pending_temperature;

        match pending {
            Some(pending) if close(value, pending, PENDING_SNAP_TOLERANCE) => {
                value = pending;
                ledger.pending_temperature = None;
            }
            _ if ledger
                .adopted_temperature
                .is_some_and(|previous| close(value, previous, TEMPERATURE_TOLERANCE)) =>
            {
                debug!(role = role.as_str(), value, "ignoring repeated setpoint report");
                return;
            }
            // Reports sent before our setpoint command landed.
            Some(pending)
                if ledger.last_temp_command.is_some_and(|last| {
                    close(last.value, pending, TEMPERATURE_TOLERANCE)
                        && last.within(cooldown_ms, now_ms)
                }) =>
            {
                debug!(role = role.as_str(), value, pending, "setpoint command still in flight");
                return;
            }
            Some(_) => ledger.pending_temperature = None,
            None => {}
        }

        ledger.adopted_temperature = Some(value);
        self.set_role_target(role, value);
        self.apply_limits();
    }

    /// Derives the wrapper mode and setpoints from what the devices report.
    /// `initial` is set on startup, where a running device is adopted even
    /// right after our own power-off command.
    pub(crate) fn adopt_device_state(&mut self, initial: bool, now_ms: u64) {
        let states = RoleMap::new(
            self.observed_state(DeviceRole::Heating),
            self.observed_state(DeviceRole::Cooling),
        );
        let heating_on = states
            .heating
            .as_ref()
            .is_some_and(|state| state.reports(HvacMode::Heat));
        let cooling_on = states
            .cooling
            .as_ref()
            .is_some_and(|state| state.reports(HvacMode::Cool));

        for role in DeviceRole::ALL {
            let ledger = &mut self.ledgers[role];
            let echoed = ledger
                .last_hvac_command
                .zip(states[role].as_ref())
                .is_some_and(|(last, state)| state.reports(last.value));
            if echoed {
                ledger.confirm_mode();
            }
        }

        self.apply_limits();

        match self.hvac_mode {
            HvacMode::Off => {
                let recently_commanded_off = DeviceRole::ALL.into_iter().any(|role| {
                    self.ledgers[role]
                        .last_hvac_command
                        .is_some_and(|last| {
                            last.value == HvacMode::Off
                                && last.within(self.config.cooldown_ms(), now_ms)
                        })
                });

                if (heating_on || cooling_on) && (initial || !recently_commanded_off) {
                    let adopted = match (heating_on, cooling_on) {
                        (true, false) => HvacMode::Heat,
                        (false, true) => HvacMode::Cool,
                        _ => self.preferred_when_both_active(),
                    };
                    info!(mode = adopted.as_str(), "adopting mode from running device");
                    self.enter_active_mode(adopted);
                } else {
                    if heating_on || cooling_on {
                        debug!("device still running after power-off command");
                    }
                    self.running_mode = RunningMode::Idle;
                }
            }
            active => {
                let role = if active == HvacMode::Heat {
                    DeviceRole::Heating
                } else {
                    DeviceRole::Cooling
                };
                let own_on = if role == DeviceRole::Heating { heating_on } else { cooling_on };
                let other_on = if role == DeviceRole::Heating { cooling_on } else { heating_on };

                if own_on || states[role].is_none() || self.mode_command_in_flight(role, now_ms) {
                    self.enter_active_mode(active);
                } else if other_on {
                    self.enter_active_mode(role.other().active_mode());
                } else {
                    info!("devices report off; switching wrapper off");
                    self.hvac_mode = HvacMode::Off;
                    self.running_mode = RunningMode::Idle;
                }
            }
        }

        for role in DeviceRole::ALL {
            let Some(state) = &states[role] else {
                continue;
            };
            if state.reports(HvacMode::Off) {
                continue;
            }
            let Some(reported) = state.target_temperature.filter(|value| value.is_finite()) else {
                continue;
            };
            if self.should_defer_device_temperature(role, reported, now_ms) {
                continue;
            }

            let value = self.targets.clamp(reported);
            if self.ledgers[role]
                .adopted_temperature
                .is_some_and(|previous| close(value, previous, TEMPERATURE_TOLERANCE))
            {
                continue;
            }
            self.set_role_target(role, value);
            let ledger = &mut self.ledgers[role];
            ledger.adopted_temperature = Some(value);
            ledger.last_temp_command = None;
        }

        self.apply_limits();
        self.update_action();
    }

    fn observed_state(&self, role: DeviceRole) -> Option<DeviceState> {
        if self.config.has_device(role) {
            self.bus.device_state(role)
        } else {
            None
        }
    }

    fn enter_active_mode(&mut self, mode: HvacMode) {
        self.hvac_mode = mode;
        self.last_active_mode = mode;
        self.running_mode = match mode {
            HvacMode::Cool => RunningMode::Cooling,
            HvacMode::Heat => RunningMode::Heating,
            HvacMode::Off => RunningMode::Idle,
        };
    }

    fn preferred_when_both_active(&self) -> HvacMode {
        if self.last_active_mode.is_active() {
            self.last_active_mode
        } else {
            HvacMode::Cool
        }
    }

    /// Our own mode command for `role` has not been observed yet. An
    /// observed echo confirms the command and clears the record.
    fn mode_command_in_flight(&self, role: DeviceRole, now_ms: u64) -> bool {
        let ledger = &self.ledgers[role];
        let wanted = role.active_mode();
        ledger.pending_mode == Some(wanted)
            || ledger.last_hvac_command.is_some_and(|last| {
                last.value == wanted && last.within(self.config.cooldown_ms(), now_ms)
            })
    }

    /// Whether a device-reported setpoint should wait for our pending
    /// command instead of being adopted. Clears the pending value once it is
    /// matched or the command's cooldown has lapsed.
    pub(crate) fn should_defer_device_temperature(
        &mut self,
        role: DeviceRole,
        reported: f32,
        now_ms: u64,
    ) -> bool {
        let cooldown_ms = self.config.cooldown_ms();
        let ledger = &mut self.ledgers[role];
        let Some(pending) = ledger.pending_temperature else {
            return false;
        };

        if close(reported, pending, DEFERRED_ADOPTION_TOLERANCE) {
            ledger.pending_temperature = None;
            return false;
        }
        if ledger
            .last_temp_command
            .is_some_and(|last| last.within(cooldown_ms, now_ms))
        {
            debug!(role = role.as_str(), reported, pending, "deferring device setpoint");
            return true;
        }

        ledger.pending_temperature = None;
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{config::WrapperConfig, sim::SimulatedDevices};
    use chrono::TimeZone;
    use pretty_assertions::assert_eq;

    fn dual() -> ClimateController<SimulatedDevices> {
        let config = WrapperConfig {
            heating_device: Some("climate.heater".to_string()),
            cooling_device: Some("climate.aircon".to_string()),
            ..WrapperConfig::default()
        };
        let bus = SimulatedDevices::for_config(&config);
        ClimateController::new(config, bus).unwrap()
    }

    #[test]
    fn auto_snapshot_restores_from_action() {
        let mut controller = dual();
        controller.restore_from_snapshot(&RestoreSnapshot {
            hvac_mode: "auto".to_string(),
            hvac_action: Some("cooling".to_string()),
            temperature: Some(24.0),
            ..RestoreSnapshot::default()
        });

        assert_eq!(controller.hvac_mode(), HvacMode::Cool);
        assert_eq!(controller.targets().cool(), 24.0);
        assert_eq!(controller.targets().target(), 24.0);
    }

    #[test]
    fn unknown_snapshot_mode_keeps_default() {
        let mut controller = dual();
        controller.restore_from_snapshot(&RestoreSnapshot {
            hvac_mode: "fan_only".to_string(),
            target_temp_low: Some(19.0),
            target_temp_high: Some(26.0),
            ..RestoreSnapshot::default()
        });

        assert_eq!(controller.hvac_mode(), HvacMode::Off);
        assert_eq!(controller.targets().heat(), 19.0);
        assert_eq!(controller.targets().cool(), 26.0);
        assert_eq!(controller.targets().target(), 19.0);
    }

    #[test]
    fn snapshot_round_trips_through_restore() {
        let mut controller = dual();
        controller.set_hvac_mode(HvacMode::Heat, 1_000).unwrap();
        let saved_at = Utc.with_ymd_and_hms(2026, 1, 15, 7, 30, 0).unwrap();
        let snapshot = controller.snapshot(saved_at);

        assert_eq!(snapshot.hvac_mode, "heat");
        assert_eq!(snapshot.saved_at, Some(saved_at));

        let mut restored = dual();
        restored.restore_from_snapshot(&snapshot);
        assert_eq!(restored.hvac_mode(), HvacMode::Heat);
        assert_eq!(restored.targets(), controller.targets());
    }

    #[test]
    fn running_device_is_adopted_on_startup() {
        let mut controller = dual();
        controller.bus_mut().devices.cooling.mode = Some(HvacMode::Cool);
        controller.bus_mut().devices.cooling.target_temperature = Some(23.5);

        controller.adopt_device_state(true, 1_000);

        assert_eq!(controller.hvac_mode(), HvacMode::Cool);
        assert_eq!(controller.running_mode(), RunningMode::Cooling);
        assert_eq!(controller.targets().cool(), 23.5);
    }

    #[test]
    fn echo_after_power_off_is_not_adopted() {
        let mut controller = dual();
        controller.set_hvac_mode(HvacMode::Heat, 1_000).unwrap();
        controller.bus_mut().devices.heating.sticky = true;
        controller.turn_off(2_000).unwrap();

        controller.adopt_device_state(false, 3_000);

        assert_eq!(controller.hvac_mode(), HvacMode::Off);
        assert_eq!(controller.running_mode(), RunningMode::Idle);
    }

    #[test]
    fn external_power_off_switches_wrapper_off() {
        let mut controller = dual();
        controller.set_hvac_mode(HvacMode::Heat, 1_000).unwrap();
        controller.bus_mut().devices.heating.mode = Some(HvacMode::Off);

        controller.adopt_device_state(false, 500_000);

        assert_eq!(controller.hvac_mode(), HvacMode::Off);
    }

    #[test]
    fn external_switch_to_cooler_is_followed() {
        let mut controller = dual();
        controller.set_hvac_mode(HvacMode::Heat, 1_000).unwrap();
        controller.bus_mut().devices.heating.mode = Some(HvacMode::Off);
        controller.bus_mut().devices.cooling.mode = Some(HvacMode::Cool);

        controller.adopt_device_state(false, 500_000);

        assert_eq!(controller.hvac_mode(), HvacMode::Cool);
        assert_eq!(controller.last_active_mode(), HvacMode::Cool);
    }

    #[test]
    fn pending_setpoint_snaps_and_old_echo_is_ignored() {
        let mut controller = dual();
        controller.set_hvac_mode(HvacMode::Heat, 1_000).unwrap();
        let ledger = &mut controller.ledgers[DeviceRole::Heating];
        ledger.adopted_temperature = Some(20.0);
        ledger.pending_temperature = Some(21.5);

        let mut state = controller.bus().device_state(DeviceRole::Heating).unwrap();
        state.target_temperature = Some(20.02);
        controller.adopt_target_from_device(DeviceRole::Heating, &state, 2_000);
        assert_eq!(controller.targets().heat(), 20.0);
        assert_eq!(
            controller.ledger(DeviceRole::Heating).pending_temperature,
            Some(21.5)
        );

        state.target_temperature = Some(21.4);
        controller.adopt_target_from_device(DeviceRole::Heating, &state, 3_000);
        assert_eq!(controller.targets().heat(), 21.5);
        assert_eq!(controller.ledger(DeviceRole::Heating).pending_temperature, None);
    }

    #[test]
    fn reported_setpoint_deferred_while_command_cools_down() {
        let mut controller = dual();
        let ledger = &mut controller.ledgers[DeviceRole::Heating];
        ledger.pending_temperature = Some(23.0);
        ledger.last_temp_command = Some(crate::ledger::IssuedCommand::new(23.0, 1_000));

        assert!(controller.should_defer_device_temperature(DeviceRole::Heating, 21.0, 2_000));
        assert!(!controller.should_defer_device_temperature(DeviceRole::Heating, 22.8, 2_000));
        assert_eq!(controller.ledger(DeviceRole::Heating).pending_temperature, None);
    }
}
