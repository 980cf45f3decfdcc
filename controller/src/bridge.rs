use rumqttc::{AsyncClient, QoS};
use tracing::debug;

use climate_wrapper_common::{
    device_command_topic, CommandError, CommandErrorKind, DeviceBus, DeviceCommand, DeviceRole,
    DeviceState, DeviceStateReport, HvacMode, RoleMap, SensorKind, WrapperConfig,
};

/// [`DeviceBus`] over MQTT.
///
/// Queries answer from the last retained state each device published.
/// Commands are queued on the client without waiting for the broker and
/// folded into the cached state right away, so the rest of a command batch
/// sees the device as commanded. The device's next state report replaces
/// the guess.
pub struct MqttDeviceBus {
    client: AsyncClient,
    command_topics: RoleMap<Option<String>>,
    devices: RoleMap<Option<DeviceState>>,
    temperature: Option<f32>,
    humidity: Option<f32>,
}

impl MqttDeviceBus {
    pub fn new(client: AsyncClient, config: &WrapperConfig) -> Self {
        let topics = config.devices();
        Self {
            client,
            command_topics: RoleMap::new(
                topics.heating.map(device_command_topic),
                topics.cooling.map(device_command_topic),
            ),
            devices: RoleMap::default(),
            temperature: None,
            humidity: None,
        }
    }

    pub fn record_state(&mut self, role: DeviceRole, report: &DeviceStateReport) {
        self.devices[role] = report.to_state();
    }

    pub fn record_sensor(&mut self, kind: SensorKind, value: f32) {
        match kind {
            SensorKind::Temperature => self.temperature = Some(value),
            SensorKind::Humidity => self.humidity = Some(value),
        }
    }

    fn send(&mut self, role: DeviceRole, command: DeviceCommand) -> Result<(), CommandError> {
        let Some(topic) = self.command_topics[role].clone() else {
            return Err(CommandError::new(
                CommandErrorKind::Rejected,
                format!("no {} device configured", role.as_str()),
            ));
        };
        let payload = serde_json::to_vec(&command)
            .map_err(|err| CommandError::new(CommandErrorKind::Rejected, err.to_string()))?;

        self.client
            .try_publish(topic.as_str(), QoS::AtLeastOnce, false, payload)
            .map_err(|err| {
                CommandError::new(
                    CommandErrorKind::DeviceControl,
                    format!("fail device control: {err}"),
                )
            })?;
        debug!(topic = %topic, ?command, "queued device command");
        self.assume_applied(role, &command);
        Ok(())
    }

    fn assume_applied(&mut self, role: DeviceRole, command: &DeviceCommand) {
        let Some(state) = self.devices[role].as_mut() else {
            return;
        };
        match *command {
            DeviceCommand::SetHvacMode { mode } => state.mode = Some(mode),
            DeviceCommand::SetTemperature { temperature } => {
                state.target_temperature = Some(temperature);
            }
            DeviceCommand::TurnOn => {
                if state.reports(HvacMode::Off) {
                    state.mode = Some(role.active_mode());
                }
            }
            DeviceCommand::TurnOff => state.mode = Some(HvacMode::Off),
        }
    }
}

impl DeviceBus for MqttDeviceBus {
    fn device_state(&self, role: DeviceRole) -> Option<DeviceState> {
        self.devices[role].clone()
    }

    fn sensor_value(&self, kind: SensorKind) -> Option<f32> {
        match kind {
            SensorKind::Temperature => self.temperature,
            SensorKind::Humidity => self.humidity,
        }
    }

    fn set_hvac_mode(&mut self, role: DeviceRole, mode: HvacMode) -> Result<(), CommandError> {
        self.send(role, DeviceCommand::SetHvacMode { mode })
    }

    fn set_temperature(&mut self, role: DeviceRole, value: f32) -> Result<(), CommandError> {
        self.send(role, DeviceCommand::SetTemperature { temperature: value })
    }

    fn turn_on(&mut self, role: DeviceRole) -> Result<(), CommandError> {
        self.send(role, DeviceCommand::TurnOn)
    }

    fn turn_off(&mut self, role: DeviceRole) -> Result<(), CommandError> {
        self.send(role, DeviceCommand::TurnOff)
    }
}
