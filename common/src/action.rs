use crate::{
    bus::DeviceBus,
    thermostat::ClimateController,
    types::{DeviceRole, HvacAction, HvacMode, RunningMode},
};

/// Room temperature must pass the setpoint by this much before the action
/// flips back to conditioning.
const ACTION_HYSTERESIS: f32 = 0.1;

impl<B: DeviceBus> ClimateController<B> {
    pub(crate) fn update_action(&mut self) {
        self.action = self.estimate_action();
    }

    fn estimate_action(&self) -> HvacAction {
        if self.hvac_mode == HvacMode::Off {
            return HvacAction::Off;
        }
        let Some(role) = self.running_mode.role() else {
            return HvacAction::Off;
        };
        if !self.config.has_device(role) || !self.device_reports(role, role.active_mode()) {
            return HvacAction::Idle;
        }

        let conditioning = match self.running_mode {
            RunningMode::Cooling => HvacAction::Cooling,
            _ => HvacAction::Heating,
        };
        let Some(current) = self.current_temperature else {
            return conditioning;
        };

        let demand = match role {
            DeviceRole::Heating => current < self.targets.heat() - ACTION_HYSTERESIS,
            DeviceRole::Cooling => current > self.targets.cool() + ACTION_HYSTERESIS,
        };
        if demand {
            conditioning
        } else {
            HvacAction::Idle
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::{
        config::WrapperConfig,
        sim::SimulatedDevices,
        thermostat::ClimateController,
        types::{HvacAction, HvacMode},
    };

    fn heating_controller() -> ClimateController<SimulatedDevices> {
        let config = WrapperConfig {
            heating_device: Some("climate.heater".to_string()),
            temperature_sensor: Some("sensor.room".to_string()),
            ..WrapperConfig::default()
        };
        let bus = SimulatedDevices::for_config(&config);
        let mut controller = ClimateController::new(config, bus).unwrap();
        controller.set_hvac_mode(HvacMode::Heat, 1_000).unwrap();
        controller
    }

    #[test]
    fn off_mode_reports_off() {
        let mut controller = heating_controller();
        controller.turn_off(2_000).unwrap();
        assert_eq!(controller.action(), HvacAction::Off);
    }

    #[test]
    fn unknown_temperature_is_optimistic() {
        let controller = heating_controller();
        assert_eq!(controller.current_temperature(), None);
        assert_eq!(controller.action(), HvacAction::Heating);
    }

    #[test]
    fn heating_stops_inside_hysteresis_band() {
        let mut controller = heating_controller();

        controller.bus_mut().temperature = Some(19.85);
        controller.handle_sensor_change(2_000).unwrap();
        assert_eq!(controller.action(), HvacAction::Heating);

        controller.bus_mut().temperature = Some(19.95);
        controller.handle_sensor_change(3_000).unwrap();
        assert_eq!(controller.action(), HvacAction::Idle);
    }

    #[test]
    fn device_not_running_reports_idle() {
        let mut controller = heating_controller();
        controller.bus_mut().devices.heating.mode = Some(HvacMode::Off);
        controller.update_action();
        assert_eq!(controller.action(), HvacAction::Idle);
    }
}
