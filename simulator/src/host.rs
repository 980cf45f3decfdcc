use std::{sync::Arc, time::Duration};

use anyhow::Context;
use rumqttc::{AsyncClient, Event, Incoming, MqttOptions, QoS};
use tokio::sync::Mutex;
use tracing::{info, warn};

use climate_wrapper_common::{
    device_command_topic, device_error_topic, device_state_topic, route_topic,
    sim::{SimulatedDevice, SimulatedDevices},
    sensor_topic, CommandErrorReport, DeviceCommand, DeviceRole, DeviceStateReport, Route,
    SensorKind, WrapperConfig,
};

use crate::room::Room;

const TICK: Duration = Duration::from_secs(5);
/// Simulated minutes per tick.
const MINUTES_PER_TICK: f32 = 1.0;

struct World {
    devices: SimulatedDevices,
    room: Room,
}

pub async fn run() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let config = simulated_config();

    let mqtt_host = std::env::var("MQTT_HOST").unwrap_or_else(|_| "127.0.0.1".to_string());
    let mqtt_port = std::env::var("MQTT_PORT")
        .ok()
        .and_then(|value| value.parse::<u16>().ok())
        .unwrap_or(1883);

    let mut mqtt_options = MqttOptions::new("climate-wrapper-simulator", mqtt_host, mqtt_port);

    if let Ok(user) = std::env::var("MQTT_USER") {
        let pass = std::env::var("MQTT_PASS").unwrap_or_default();
        mqtt_options.set_credentials(user, pass);
    }

    let (mqtt, mut eventloop) = AsyncClient::new(mqtt_options, 32);

    let outdoor = std::env::var("SIM_OUTDOOR_TEMP")
        .ok()
        .and_then(|value| value.parse::<f32>().ok())
        .unwrap_or(14.0);
    let mut devices = SimulatedDevices::for_config(&config);
    // Split units commonly refuse setpoints while powered off.
    devices.devices.cooling.reject_while_off = true;
    let world = Arc::new(Mutex::new(World {
        devices,
        room: Room::new(19.0, outdoor),
    }));

    for role in DeviceRole::ALL {
        if let Some(device) = config.device(role) {
            mqtt.subscribe(device_command_topic(device), QoS::AtLeastOnce)
                .await
                .with_context(|| format!("failed to subscribe to {device} commands"))?;
        }
    }

    {
        let event_world = world.clone();
        let event_mqtt = mqtt.clone();
        let event_config = config.clone();
        tokio::spawn(async move {
            loop {
                match eventloop.poll().await {
                    Ok(Event::Incoming(Incoming::Publish(message))) => {
                        let mut world = event_world.lock().await;
                        handle_command(
                            &event_mqtt,
                            &event_config,
                            &mut world,
                            &message.topic,
                            &message.payload,
                        );
                    }
                    Ok(_) => {}
                    Err(err) => {
                        warn!("simulator mqtt poll error: {err}");
                        tokio::time::sleep(Duration::from_secs(2)).await;
                    }
                }
            }
        });
    }

    info!(
        heating = ?config.heating_device,
        cooling = ?config.cooling_device,
        "device simulator started"
    );

    let mut interval = tokio::time::interval(TICK);
    loop {
        interval.tick().await;

        let (reports, temperature, humidity) = {
            let mut world = world.lock().await;
            let World { devices, room } = &mut *world;
            room.step(&mut devices.devices, MINUTES_PER_TICK);
            let reports = DeviceRole::ALL.map(|role| (role, state_report(&devices.devices[role])));
            (reports, room.temperature, room.humidity)
        };

        for (role, report) in reports {
            if let Some(device) = config.device(role) {
                let payload = serde_json::to_vec(&report)?;
                mqtt.publish(device_state_topic(device), QoS::AtLeastOnce, true, payload)
                    .await
                    .context("failed to publish device state")?;
            }
        }

        let readings = [
            (SensorKind::Temperature, temperature),
            (SensorKind::Humidity, humidity),
        ];
        for (kind, value) in readings {
            if let Some(sensor) = config.sensor(kind) {
                mqtt.publish(sensor_topic(sensor), QoS::AtLeastOnce, true, format!("{value:.1}"))
                    .await
                    .context("failed to publish sensor reading")?;
            }
        }
    }
}

fn simulated_config() -> WrapperConfig {
    let var = |key: &str, default: &str| {
        let value = std::env::var(key).unwrap_or_else(|_| default.to_string());
        (!value.trim().is_empty()).then_some(value)
    };
    WrapperConfig {
        heating_device: var("HEATING_DEVICE", "climate.heater"),
        cooling_device: var("COOLING_DEVICE", "climate.aircon"),
        temperature_sensor: var("TEMPERATURE_SENSOR", "sensor.room_temperature"),
        humidity_sensor: var("HUMIDITY_SENSOR", "sensor.room_humidity"),
        ..WrapperConfig::default()
    }
}

fn state_report(device: &SimulatedDevice) -> DeviceStateReport {
    DeviceStateReport::from(device.state())
}

/// Applies one command and answers with the new state or an error report.
/// Runs on the event loop task, so it must not await the client.
fn handle_command(
    mqtt: &AsyncClient,
    config: &WrapperConfig,
    world: &mut World,
    topic: &str,
    payload: &[u8],
) {
    let Some(Route::DeviceCommand(role)) = route_topic(config, topic) else {
        return;
    };
    let Some(device_ref) = config.device(role) else {
        return;
    };
    let command: DeviceCommand = match serde_json::from_slice(payload) {
        Ok(command) => command,
        Err(err) => {
            warn!(%topic, "invalid device command: {err}");
            return;
        }
    };

    let device = &mut world.devices.devices[role];
    let result = match command {
        DeviceCommand::SetHvacMode { mode } => device.apply_mode(mode),
        DeviceCommand::SetTemperature { temperature } => device.apply_temperature(temperature),
        DeviceCommand::TurnOn => device.apply_turn_on(),
        DeviceCommand::TurnOff => device.apply_turn_off(),
    };

    let published = match result {
        Ok(()) => {
            info!(device = device_ref, ?command, "applied command");
            serde_json::to_vec(&state_report(device))
                .map(|body| (device_state_topic(device_ref), true, body))
        }
        Err(err) => {
            warn!(device = device_ref, ?command, "rejected command: {err}");
            serde_json::to_vec(&CommandErrorReport::from(&err))
                .map(|body| (device_error_topic(device_ref), false, body))
        }
    };

    match published {
        Ok((topic, retain, body)) => {
            if let Err(err) = mqtt.try_publish(topic, QoS::AtLeastOnce, retain, body) {
                warn!("simulator publish failed: {err}");
            }
        }
        Err(err) => warn!("simulator serialization failed: {err}"),
    }
}
