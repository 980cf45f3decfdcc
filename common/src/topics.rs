use crate::{
    config::WrapperConfig,
    types::{DeviceRole, SensorKind},
};

pub const TOPIC_PREFIX: &str = "climate_wrapper";

pub const TOPIC_CONTROLLER_STATE: &str = "climate_wrapper/controller/state";

pub const TOPIC_CMD_MODE: &str = "climate_wrapper/cmnd/mode";
pub const TOPIC_CMD_TARGET: &str = "climate_wrapper/cmnd/target";
pub const TOPIC_CMD_POWER: &str = "climate_wrapper/cmnd/power";

pub fn sensor_topic(sensor: &str) -> String {
    format!("{TOPIC_PREFIX}/sensor/{sensor}/state")
}

pub fn device_state_topic(device: &str) -> String {
    format!("{TOPIC_PREFIX}/device/{device}/state")
}

pub fn device_command_topic(device: &str) -> String {
    format!("{TOPIC_PREFIX}/device/{device}/command")
}

pub fn device_error_topic(device: &str) -> String {
    format!("{TOPIC_PREFIX}/device/{device}/error")
}

/// What an incoming topic refers to under a given configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    Sensor(SensorKind),
    DeviceState(DeviceRole),
    DeviceError(DeviceRole),
    DeviceCommand(DeviceRole),
    Mode,
    Target,
    Power,
}

pub fn route_topic(config: &WrapperConfig, topic: &str) -> Option<Route> {
    match topic {
        TOPIC_CMD_MODE => return Some(Route::Mode),
        TOPIC_CMD_TARGET => return Some(Route::Target),
        TOPIC_CMD_POWER => return Some(Route::Power),
        _ => {}
    }

    for kind in [SensorKind::Temperature, SensorKind::Humidity] {
        if config.sensor(kind).is_some_and(|sensor| sensor_topic(sensor) == topic) {
            return Some(Route::Sensor(kind));
        }
    }

    DeviceRole::ALL.into_iter().find_map(|role| {
        let device = config.device(role)?;
        if device_state_topic(device) == topic {
            Some(Route::DeviceState(role))
        } else if device_error_topic(device) == topic {
            Some(Route::DeviceError(role))
        } else if device_command_topic(device) == topic {
            Some(Route::DeviceCommand(role))
        } else {
            None
        }
    })
}
