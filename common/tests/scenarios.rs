use climate_wrapper_common::{
    sim::{IssuedCall, SimulatedDevices},
    ClimateController, CommandError, CommandErrorKind, DeviceRole, HvacMode, RestoreSnapshot,
    RunningMode, TemperatureRequest, WrapperConfig,
};
use pretty_assertions::assert_eq;

fn config(heating: bool, cooling: bool) -> WrapperConfig {
    WrapperConfig {
        name: "Living Room".to_string(),
        heating_device: heating.then(|| "climate.heater".to_string()),
        cooling_device: cooling.then(|| "climate.aircon".to_string()),
        ..WrapperConfig::default()
    }
}

fn controller(config: WrapperConfig) -> ClimateController<SimulatedDevices> {
    let bus = SimulatedDevices::for_config(&config);
    ClimateController::new(config, bus).unwrap()
}

fn mode_commands(controller: &ClimateController<SimulatedDevices>) -> usize {
    controller
        .bus()
        .calls
        .iter()
        .filter(|call| matches!(call, IssuedCall::SetHvacMode(..)))
        .count()
}

#[test]
fn startup_adopts_a_running_heater_without_commands() {
    let mut controller = controller(config(true, true));
    controller.bus_mut().devices.heating.mode = Some(HvacMode::Heat);
    controller.bus_mut().devices.heating.target_temperature = Some(20.0);

    controller.startup(None, 1_000).unwrap();

    assert_eq!(controller.hvac_mode(), HvacMode::Heat);
    assert_eq!(controller.running_mode(), RunningMode::Heating);
    assert!(controller.bus().calls.is_empty());

    controller.set_hvac_mode(HvacMode::Heat, 2_000).unwrap();
    assert!(controller.bus().calls.is_empty());
}

#[test]
fn repeated_mode_command_waits_for_cooldown() {
    let mut controller = controller(config(true, false));
    controller.bus_mut().devices.heating.sticky = true;

    controller.set_hvac_mode(HvacMode::Heat, 1_000).unwrap();
    assert_eq!(mode_commands(&controller), 1);

    controller.set_hvac_mode(HvacMode::Heat, 61_000).unwrap();
    assert_eq!(mode_commands(&controller), 1);

    controller.set_hvac_mode(HvacMode::Heat, 121_000).unwrap();
    assert_eq!(mode_commands(&controller), 2);
}

#[test]
fn setpoint_jitter_is_not_adopted() {
    let mut controller = controller(config(true, true));
    controller.bus_mut().devices.heating.mode = Some(HvacMode::Heat);
    controller.bus_mut().devices.heating.target_temperature = Some(22.0);
    controller.startup(None, 1_000).unwrap();
    assert_eq!(controller.targets().heat(), 22.0);

    controller.bus_mut().devices.heating.target_temperature = Some(22.03);
    controller
        .handle_device_change(DeviceRole::Heating, 2_000)
        .unwrap();

    assert_eq!(controller.targets().heat(), 22.0);
    assert_eq!(controller.targets().target(), 22.0);
    assert!(controller.bus().calls.is_empty());
}

#[test]
fn heating_only_off_to_heat_powers_on_then_sets_target() {
    let mut controller = controller(config(true, false));
    controller
        .set_temperature(TemperatureRequest::single(22.0), 1_000)
        .unwrap();
    assert!(controller.bus().calls.is_empty());

    controller.set_hvac_mode(HvacMode::Heat, 2_000).unwrap();

    assert_eq!(
        controller.bus().calls,
        vec![
            IssuedCall::SetHvacMode(DeviceRole::Heating, HvacMode::Heat),
            IssuedCall::SetTemperature(DeviceRole::Heating, 22.0),
        ]
    );
    assert_eq!(controller.running_mode(), RunningMode::Heating);
}

#[test]
fn both_devices_running_resolves_to_last_active_mode() {
    let mut controller = controller(config(true, true));
    controller.set_hvac_mode(HvacMode::Cool, 1_000).unwrap();
    controller.turn_off(2_000).unwrap();
    assert_eq!(controller.last_active_mode(), HvacMode::Cool);

    controller.bus_mut().devices.heating.mode = Some(HvacMode::Heat);
    controller.bus_mut().devices.cooling.mode = Some(HvacMode::Cool);
    controller
        .handle_device_change(DeviceRole::Heating, 500_000)
        .unwrap();

    assert_eq!(controller.hvac_mode(), HvacMode::Cool);
    assert_eq!(controller.running_mode(), RunningMode::Cooling);
    assert_eq!(
        controller.bus().devices.heating.mode,
        Some(HvacMode::Off)
    );
}

#[test]
fn device_timeout_defers_to_a_retry() {
    let mut controller = controller(config(true, false));
    controller.bus_mut().devices.heating.fail_next(CommandError::new(
        CommandErrorKind::Timeout,
        "device did not answer",
    ));

    controller.set_hvac_mode(HvacMode::Heat, 1_000).unwrap();

    let ledger = controller.ledger(DeviceRole::Heating);
    assert_eq!(ledger.pending_mode, Some(HvacMode::Heat));
    assert_eq!(ledger.hvac_retry.map(|timer| timer.due_ms), Some(31_000));
    assert_eq!(controller.bus().devices.heating.mode, Some(HvacMode::Off));

    // The retry lands inside the cooldown of the failed attempt and waits it out.
    controller.run_due_retries(31_000).unwrap();
    assert_eq!(mode_commands(&controller), 1);
    assert_eq!(controller.next_retry_due(), Some(121_000));

    controller.run_due_retries(121_000).unwrap();
    assert_eq!(mode_commands(&controller), 2);
    assert_eq!(controller.bus().devices.heating.mode, Some(HvacMode::Heat));
}

#[test]
fn physical_power_off_inside_cooldown_is_followed() {
    let mut controller = controller(config(true, false));
    controller.set_hvac_mode(HvacMode::Heat, 1_000).unwrap();
    controller
        .handle_device_change(DeviceRole::Heating, 2_000)
        .unwrap();
    controller.bus_mut().calls.clear();

    controller.bus_mut().devices.heating.mode = Some(HvacMode::Off);
    controller
        .handle_device_change(DeviceRole::Heating, 60_000)
        .unwrap();
    assert_eq!(controller.hvac_mode(), HvacMode::Off);

    controller.refresh(200_000).unwrap();
    assert_eq!(controller.hvac_mode(), HvacMode::Off);
    assert_eq!(controller.bus().devices.heating.mode, Some(HvacMode::Off));
    assert!(controller.bus().calls.is_empty());
}

#[test]
fn late_report_of_the_old_setpoint_keeps_the_user_target() {
    let mut controller = controller(config(true, false));
    controller
        .set_temperature(TemperatureRequest::single(24.0), 1_000)
        .unwrap();
    controller.set_hvac_mode(HvacMode::Heat, 2_000).unwrap();

    // The device reports its previous setpoint before ours landed.
    controller.bus_mut().devices.heating.target_temperature = Some(21.0);
    controller
        .handle_device_change(DeviceRole::Heating, 3_000)
        .unwrap();

    assert_eq!(controller.targets().heat(), 24.0);
    assert_eq!(controller.targets().target(), 24.0);
    assert_eq!(
        controller.bus().devices.heating.target_temperature,
        Some(24.0)
    );
}

#[test]
fn raising_heat_in_heat_mode_pushes_cool_up() {
    let mut controller = controller(config(true, true));
    controller.set_hvac_mode(HvacMode::Heat, 1_000).unwrap();

    controller
        .set_temperature(TemperatureRequest::single(27.0), 2_000)
        .unwrap();

    assert_eq!(controller.targets().heat(), 27.0);
    assert_eq!(controller.targets().cool(), 27.0);
    assert_eq!(controller.targets().target(), 27.0);
}

#[test]
fn unavailable_device_gets_the_pending_setpoint_when_it_returns() {
    let mut controller = controller(config(false, true));
    controller.set_hvac_mode(HvacMode::Cool, 1_000).unwrap();
    controller.bus_mut().devices.cooling.available = false;
    controller.bus_mut().calls.clear();

    controller
        .set_temperature(TemperatureRequest::single(23.5), 2_000)
        .unwrap();
    assert_eq!(
        controller.ledger(DeviceRole::Cooling).pending_temperature,
        Some(23.5)
    );
    assert!(controller.bus().calls.is_empty());

    controller.bus_mut().devices.cooling.available = true;
    controller.run_due_retries(32_000).unwrap();

    assert_eq!(
        controller.bus().devices.cooling.target_temperature,
        Some(23.5)
    );
}

#[test]
fn split_unit_rejecting_setpoints_while_off_is_powered_on() {
    let mut controller = controller(config(false, true));
    controller.bus_mut().devices.cooling.reject_while_off = true;
    controller.bus_mut().devices.cooling.fail_next(CommandError::new(
        CommandErrorKind::NotSupportedInState,
        "command not supported in current power state",
    ));

    controller.set_hvac_mode(HvacMode::Cool, 1_000).unwrap();

    assert_eq!(controller.hvac_mode(), HvacMode::Cool);
    assert!(controller.ledger(DeviceRole::Cooling).hvac_retry.is_some());

    controller.run_due_retries(121_000).unwrap();
    assert_eq!(controller.bus().devices.cooling.mode, Some(HvacMode::Cool));
    assert_eq!(
        controller.bus().devices.cooling.target_temperature,
        Some(25.0)
    );
}

fn saved_snapshot() -> RestoreSnapshot {
    serde_json::from_str(
        r#"{"hvac_mode":"cool","hvac_action":"cooling","temperature":24.0,
            "target_temp_low":19.5,"target_temp_high":24.0,
            "saved_at":"2026-01-15T07:30:00Z"}"#,
    )
    .unwrap()
}

#[test]
fn restart_restores_the_saved_snapshot() {
    let mut controller = controller(config(true, true));
    controller.bus_mut().devices.cooling.mode = Some(HvacMode::Cool);
    controller.bus_mut().devices.cooling.target_temperature = Some(24.0);

    controller.startup(Some(&saved_snapshot()), 1_000).unwrap();

    assert_eq!(controller.hvac_mode(), HvacMode::Cool);
    assert_eq!(controller.targets().heat(), 19.5);
    assert_eq!(controller.targets().cool(), 24.0);
    assert!(controller.bus().calls.is_empty());
}

#[test]
fn restart_with_devices_off_follows_the_devices() {
    let mut controller = controller(config(true, true));

    controller.startup(Some(&saved_snapshot()), 1_000).unwrap();

    assert_eq!(controller.hvac_mode(), HvacMode::Off);
    assert_eq!(controller.running_mode(), RunningMode::Idle);
    assert_eq!(controller.targets().heat(), 19.5);
    assert_eq!(controller.targets().cool(), 24.0);
}

#[test]
fn status_serializes_for_the_api() {
    let mut controller = controller(config(true, true));
    controller.set_hvac_mode(HvacMode::Heat, 1_000).unwrap();

    let json = serde_json::to_value(controller.status()).unwrap();

    assert_eq!(json["hvacMode"], "heat");
    assert_eq!(json["runningMode"], "heating");
    assert_eq!(json["targetTemperatureLow"], 20.0);
    assert_eq!(json["heating"]["configured"], true);
}
