use climate_wrapper_common::{sim::SimulatedDevice, DeviceRole, RoleMap};

/// Degrees per minute the room loses towards the outdoor temperature, per
/// degree of difference.
const LEAK_PER_MINUTE: f32 = 0.01;
const HEATING_PER_MINUTE: f32 = 0.15;
const COOLING_PER_MINUTE: f32 = 0.2;
const DRYING_PER_MINUTE: f32 = 0.3;

/// Single-zone room with one thermal mass.
#[derive(Debug, Clone, PartialEq)]
pub struct Room {
    pub temperature: f32,
    pub humidity: f32,
    pub outdoor: f32,
}

impl Room {
    pub fn new(temperature: f32, outdoor: f32) -> Self {
        Self {
            temperature,
            humidity: 45.0,
            outdoor,
        }
    }

    /// Advances the room by `minutes` and feeds the new reading back into
    /// the devices' own thermometers.
    pub fn step(&mut self, devices: &mut RoleMap<SimulatedDevice>, minutes: f32) {
        self.temperature += (self.outdoor - self.temperature) * LEAK_PER_MINUTE * minutes;

        let heater = &devices[DeviceRole::Heating];
        if heater.is_conditioning() {
            if let Some(target) = heater.target_temperature.filter(|t| *t > self.temperature) {
                self.temperature = (self.temperature + HEATING_PER_MINUTE * minutes).min(target);
            }
        }

        let cooler = &devices[DeviceRole::Cooling];
        if cooler.is_conditioning() {
            if let Some(target) = cooler.target_temperature.filter(|t| *t < self.temperature) {
                self.temperature = (self.temperature - COOLING_PER_MINUTE * minutes).max(target);
                self.humidity = (self.humidity - DRYING_PER_MINUTE * minutes).max(30.0);
            }
        }

        for role in DeviceRole::ALL {
            let device = &mut devices[role];
            if device.available {
                device.current_temperature = Some(round_tenth(self.temperature));
            }
        }
    }
}

fn round_tenth(value: f32) -> f32 {
    (value * 10.0).round() / 10.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use climate_wrapper_common::HvacMode;
    use pretty_assertions::assert_eq;

    fn devices() -> RoleMap<SimulatedDevice> {
        RoleMap::new(
            SimulatedDevice::new(DeviceRole::Heating),
            SimulatedDevice::new(DeviceRole::Cooling),
        )
    }

    #[test]
    fn idle_room_drifts_towards_outdoor() {
        let mut room = Room::new(22.0, 12.0);
        room.step(&mut devices(), 10.0);

        assert!(room.temperature < 22.0);
        assert!(room.temperature > 12.0);
    }

    #[test]
    fn heater_warms_up_to_its_setpoint() {
        let mut devices = devices();
        devices.heating.mode = Some(HvacMode::Heat);
        devices.heating.target_temperature = Some(21.0);
        let mut room = Room::new(20.0, 20.0);

        for _ in 0..30 {
            room.step(&mut devices, 1.0);
        }

        assert_eq!(room.temperature, 21.0);
        assert_eq!(devices.heating.current_temperature, Some(21.0));
    }

    #[test]
    fn cooler_dries_the_air() {
        let mut devices = devices();
        devices.cooling.mode = Some(HvacMode::Cool);
        devices.cooling.target_temperature = Some(22.0);
        let mut room = Room::new(27.0, 27.0);

        room.step(&mut devices, 5.0);

        assert!(room.temperature < 27.0);
        assert!(room.humidity < 45.0);
    }
}
