use std::{
    collections::HashMap,
    io::ErrorKind,
    net::SocketAddr,
    path::PathBuf,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, OnceLock,
    },
    time::{Duration, Instant},
};

use anyhow::Context;
use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use rumqttc::{AsyncClient, Event, Incoming, MqttOptions, QoS};
use serde::Serialize;
use tokio::{net::TcpListener, sync::Mutex, task::JoinHandle};
use tracing::{debug, info, warn};

use climate_wrapper_common::{
    device_error_topic, device_state_topic, route_topic, sensor_topic, ClimateController,
    CommandErrorReport, ControllerError, DeviceRole, DeviceStateReport, HvacMode, RestoreSnapshot,
    Route, RuntimeConfig, SensorKind, TemperatureRequest, WrapperConfig, TOPIC_CMD_MODE,
    TOPIC_CMD_POWER, TOPIC_CMD_TARGET, TOPIC_CONTROLLER_STATE,
};

use crate::bridge::MqttDeviceBus;

type Controller = ClimateController<MqttDeviceBus>;

#[derive(Clone)]
struct AppState {
    controller: Arc<Mutex<Controller>>,
    config: Arc<WrapperConfig>,
    started: Arc<AtomicBool>,
    mqtt: AsyncClient,
    store: AppStore,
}

#[derive(Clone)]
struct AppStore {
    runtime_path: Arc<PathBuf>,
    snapshot_path: Arc<PathBuf>,
    last_snapshot: Arc<Mutex<Option<RestoreSnapshot>>>,
    lock: Arc<Mutex<()>>,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

const MAX_MQTT_PAYLOAD_BYTES: usize = 1024;
/// Time given to retained device and sensor states to arrive before the
/// first reconciliation.
const STARTUP_SETTLE: Duration = Duration::from_secs(3);

pub async fn run() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let store = AppStore::new();
    let mut runtime = store.load_runtime_config().await.unwrap_or_else(|err| {
        warn!("failed to load runtime config from store: {err:#}");
        RuntimeConfig::default()
    });
    apply_env_overrides(&mut runtime.wrapper);
    runtime.wrapper.sanitize();

    let snapshot = store.load_snapshot().await.unwrap_or_else(|err| {
        warn!("failed to load saved state: {err:#}");
        None
    });

    let mqtt_host = std::env::var("MQTT_HOST").unwrap_or(runtime.network.mqtt_host.clone());
    let mqtt_port = std::env::var("MQTT_PORT")
        .ok()
        .and_then(|value| value.parse::<u16>().ok())
        .unwrap_or(runtime.network.mqtt_port);

    let mut mqtt_options = MqttOptions::new("climate-wrapper-controller", mqtt_host, mqtt_port);
    let mqtt_user = std::env::var("MQTT_USER").unwrap_or(runtime.network.mqtt_user.clone());
    let mqtt_pass = std::env::var("MQTT_PASS").unwrap_or(runtime.network.mqtt_pass.clone());
    if !mqtt_user.is_empty() {
        mqtt_options.set_credentials(mqtt_user, mqtt_pass);
    }

    let (mqtt, eventloop) = AsyncClient::new(mqtt_options, 64);

    let bus = MqttDeviceBus::new(mqtt.clone(), &runtime.wrapper);
    let controller = ClimateController::new(runtime.wrapper.clone(), bus)
        .context("invalid climate wrapper configuration")?;
    info!(
        name = %runtime.wrapper.name,
        devices = ?controller.watched_devices(),
        sensors = ?controller.watched_sensors(),
        "climate wrapper configured"
    );

    let app_state = AppState {
        controller: Arc::new(Mutex::new(controller)),
        config: Arc::new(runtime.wrapper.clone()),
        started: Arc::new(AtomicBool::new(false)),
        mqtt,
        store,
    };

    subscribe_topics(&app_state.mqtt, &app_state.config).await?;
    let tasks = vec![
        spawn_mqtt_loop(app_state.clone(), eventloop),
        spawn_control_loop(app_state.clone(), snapshot),
        spawn_state_publish_loop(app_state.clone()),
    ];

    let app = Router::new()
        .route("/api/status", get(handle_get_status))
        .route("/api/config", get(handle_get_config))
        .route("/api/mode", post(handle_set_mode))
        .route("/api/target", post(handle_set_target))
        .route("/api/power", post(handle_set_power))
        .with_state(app_state.clone());

    let port = std::env::var("CONTROLLER_HTTP_PORT")
        .ok()
        .and_then(|value| value.parse::<u16>().ok())
        .unwrap_or(runtime.network.http_port);
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind controller server at {addr}"))?;

    info!("controller listening on http://{addr}");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(app_state, tasks))
        .await?;
    Ok(())
}

fn apply_env_overrides(wrapper: &mut WrapperConfig) {
    let overrides = [
        ("HEATING_DEVICE", &mut wrapper.heating_device),
        ("COOLING_DEVICE", &mut wrapper.cooling_device),
        ("TEMPERATURE_SENSOR", &mut wrapper.temperature_sensor),
        ("HUMIDITY_SENSOR", &mut wrapper.humidity_sensor),
    ];
    for (key, slot) in overrides {
        if let Ok(value) = std::env::var(key) {
            *slot = Some(value);
        }
    }
}

async fn subscribe_topics(mqtt: &AsyncClient, config: &WrapperConfig) -> anyhow::Result<()> {
    let mut topics = vec![
        TOPIC_CMD_MODE.to_string(),
        TOPIC_CMD_TARGET.to_string(),
        TOPIC_CMD_POWER.to_string(),
    ];
    for kind in [SensorKind::Temperature, SensorKind::Humidity] {
        if let Some(sensor) = config.sensor(kind) {
            topics.push(sensor_topic(sensor));
        }
    }
    for role in DeviceRole::ALL {
        if let Some(device) = config.device(role) {
            topics.push(device_state_topic(device));
            topics.push(device_error_topic(device));
        }
    }

    for topic in topics {
        mqtt.subscribe(topic, QoS::AtLeastOnce).await?;
    }
    Ok(())
}

fn spawn_mqtt_loop(app_state: AppState, mut eventloop: rumqttc::EventLoop) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match eventloop.poll().await {
                Ok(Event::Incoming(Incoming::Publish(message))) => {
                    if let Err(err) =
                        handle_mqtt_message(&app_state, message.topic, message.payload.to_vec())
                            .await
                    {
                        warn!("mqtt message handling error: {err:#}");
                    }
                }
                Ok(Event::Incoming(Incoming::ConnAck(_))) => {
                    info!("mqtt connected");
                }
                Ok(_) => {}
                Err(err) => {
                    warn!("mqtt poll error: {err}");
                    tokio::time::sleep(Duration::from_secs(2)).await;
                }
            }
        }
    })
}

/// Waits for retained state, runs startup, then fires retries every second
/// and refreshes on the configured interval.
fn spawn_control_loop(
    app_state: AppState,
    snapshot: Option<RestoreSnapshot>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        tokio::time::sleep(STARTUP_SETTLE).await;

        {
            let mut controller = app_state.controller.lock().await;
            if let Err(err) = controller.startup(snapshot.as_ref(), monotonic_ms()) {
                warn!("startup reconciliation failed: {err}");
            }
        }
        app_state.started.store(true, Ordering::Release);
        info!("controller started");

        let refresh_every = app_state.config.update_interval_ms();
        let mut last_refresh_ms = monotonic_ms();
        let mut interval = tokio::time::interval(Duration::from_secs(1));

        loop {
            interval.tick().await;
            let now_ms = monotonic_ms();

            let result = {
                let mut controller = app_state.controller.lock().await;
                let retried = controller.run_due_retries(now_ms);
                if now_ms.saturating_sub(last_refresh_ms) >= refresh_every {
                    last_refresh_ms = now_ms;
                    retried.and(controller.refresh(now_ms))
                } else {
                    retried
                }
            };
            if let Err(err) = result {
                warn!("control loop error: {err}");
            }

            if let Err(err) = persist_snapshot(&app_state).await {
                warn!("failed to persist controller state: {err:#}");
            }
        }
    })
}

fn spawn_state_publish_loop(app_state: AppState) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(10));
        loop {
            interval.tick().await;

            let payload = {
                let controller = app_state.controller.lock().await;
                serde_json::to_vec(&controller.status())
            };

            match payload {
                Ok(body) => {
                    if let Err(err) = app_state
                        .mqtt
                        .publish(TOPIC_CONTROLLER_STATE, QoS::AtLeastOnce, true, body)
                        .await
                    {
                        warn!("controller state publish failed: {err}");
                    }
                }
                Err(err) => warn!("controller state serialization failed: {err}"),
            }
        }
    })
}

/// Stops the background tasks before the controller cancels its retries.
async fn shutdown_signal(app_state: AppState, tasks: Vec<JoinHandle<()>>) {
    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!("failed to listen for shutdown signal: {err}");
        return;
    }

    for task in &tasks {
        task.abort();
    }
    for task in tasks {
        let _ = task.await;
    }

    app_state.controller.lock().await.shutdown();
    if let Err(err) = persist_snapshot(&app_state).await {
        warn!("failed to persist controller state on shutdown: {err:#}");
    }
    info!("controller stopped");
}

async fn handle_mqtt_message(
    app_state: &AppState,
    topic: String,
    payload: Vec<u8>,
) -> anyhow::Result<()> {
    if payload.len() > MAX_MQTT_PAYLOAD_BYTES {
        warn!(
            "dropping oversized MQTT payload on topic {} ({} bytes)",
            topic,
            payload.len()
        );
        return Ok(());
    }

    let Some(route) = route_topic(&app_state.config, &topic) else {
        return Ok(());
    };
    let message = String::from_utf8(payload).context("non utf8 mqtt payload")?;
    let started = app_state.started.load(Ordering::Acquire);
    let now_ms = monotonic_ms();

    match route {
        Route::Sensor(kind) => {
            let Some(value) = parse_sensor_value(kind, &message) else {
                debug!(%topic, "ignoring invalid sensor reading");
                return Ok(());
            };
            let mut controller = app_state.controller.lock().await;
            controller.bus_mut().record_sensor(kind, value);
            if started {
                controller.handle_sensor_change(now_ms)?;
            }
        }
        Route::DeviceState(role) => {
            let report: DeviceStateReport =
                serde_json::from_str(&message).context("invalid device state report")?;
            let mut controller = app_state.controller.lock().await;
            controller.bus_mut().record_state(role, &report);
            if started {
                controller.handle_device_change(role, now_ms)?;
            }
        }
        Route::DeviceError(role) => {
            let report: CommandErrorReport =
                serde_json::from_str(&message).context("invalid device error report")?;
            let error = report.to_error();
            warn!(
                role = role.as_str(),
                class = ?error.class(),
                "device reported command failure: {error}"
            );
        }
        Route::DeviceCommand(_) => {}
        Route::Mode => {
            let mode = requested_mode(&message);
            app_state.controller.lock().await.set_hvac_mode(mode, now_ms)?;
        }
        Route::Target => {
            let request = match message.trim().parse::<f32>() {
                Ok(value) => TemperatureRequest::single(value),
                Err(_) => serde_json::from_str::<TemperatureRequest>(&message)
                    .context("invalid target payload")?,
            };
            app_state
                .controller
                .lock()
                .await
                .set_temperature(request, now_ms)?;
        }
        Route::Power => {
            let mut controller = app_state.controller.lock().await;
            match message.trim().to_ascii_lowercase().as_str() {
                "on" => controller.turn_on(now_ms)?,
                "off" => controller.turn_off(now_ms)?,
                other => debug!(payload = other, "ignoring unknown power command"),
            }
        }
    }

    Ok(())
}

fn parse_sensor_value(kind: SensorKind, message: &str) -> Option<f32> {
    let value = message.trim().parse::<f32>().ok()?;
    let range = match kind {
        SensorKind::Temperature => -40.0..=80.0,
        SensorKind::Humidity => 0.0..=100.0,
    };
    (value.is_finite() && range.contains(&value)).then_some(value)
}

/// Modes the wrapper does not drive collapse to off.
fn requested_mode(value: &str) -> HvacMode {
    HvacMode::parse(value).unwrap_or_else(|| {
        debug!(mode = value, "unsupported hvac mode requested; using off");
        HvacMode::Off
    })
}

async fn handle_get_status(State(state): State<AppState>) -> impl IntoResponse {
    let status = state.controller.lock().await.status();
    Json(status)
}

async fn handle_get_config(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.config.as_ref().clone())
}

async fn handle_set_mode(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
) -> impl IntoResponse {
    let Some(value) = params.get("value") else {
        return error_response(StatusCode::BAD_REQUEST, "Missing 'value' parameter");
    };

    let mode = requested_mode(value);
    let result = {
        let mut controller = state.controller.lock().await;
        controller.set_hvac_mode(mode, monotonic_ms())
    };
    respond_with_status(state, result).await
}

async fn handle_set_target(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
) -> impl IntoResponse {
    let mut request = TemperatureRequest::default();
    for (key, slot) in [
        ("value", &mut request.temperature),
        ("low", &mut request.target_low),
        ("high", &mut request.target_high),
    ] {
        if let Some(raw) = params.get(key) {
            let Ok(value) = raw.parse::<f32>() else {
                return error_response(StatusCode::BAD_REQUEST, "Invalid temperature value");
            };
            *slot = Some(value);
        }
    }
    if request == TemperatureRequest::default() {
        return error_response(
            StatusCode::BAD_REQUEST,
            "Missing 'value', 'low' or 'high' parameter",
        );
    }

    let result = {
        let mut controller = state.controller.lock().await;
        controller.set_temperature(request, monotonic_ms())
    };
    respond_with_status(state, result).await
}

async fn handle_set_power(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
) -> impl IntoResponse {
    let Some(value) = params.get("value") else {
        return error_response(StatusCode::BAD_REQUEST, "Missing 'value' parameter");
    };

    let now_ms = monotonic_ms();
    let result = {
        let mut controller = state.controller.lock().await;
        match value.to_ascii_lowercase().as_str() {
            "on" => controller.turn_on(now_ms),
            "off" => controller.turn_off(now_ms),
            _ => return error_response(StatusCode::BAD_REQUEST, "Invalid power. Use 'on' or 'off'"),
        }
    };
    respond_with_status(state, result).await
}

async fn respond_with_status(
    state: AppState,
    result: Result<(), ControllerError>,
) -> axum::response::Response {
    if let Err(err) = result {
        warn!("command failed: {err}");
        let status = match err {
            ControllerError::Command { .. } => StatusCode::BAD_GATEWAY,
            ControllerError::InvalidTemperature(_) => StatusCode::BAD_REQUEST,
            ControllerError::Config(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        return error_response(status, &err.to_string());
    }

    if let Err(err) = persist_snapshot(&state).await {
        warn!("failed to persist controller state: {err:#}");
        return error_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            "Failed to persist controller state",
        );
    }

    handle_get_status(State(state)).await.into_response()
}

impl AppStore {
    fn new() -> Self {
        let data_dir = std::env::var("CLIMATE_WRAPPER_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("./.climate_wrapper"));

        Self {
            runtime_path: Arc::new(data_dir.join("runtime.json")),
            snapshot_path: Arc::new(data_dir.join("snapshot.json")),
            last_snapshot: Arc::new(Mutex::new(None)),
            lock: Arc::new(Mutex::new(())),
        }
    }

    async fn load_runtime_config(&self) -> anyhow::Result<RuntimeConfig> {
        let _guard = self.lock.lock().await;
        match tokio::fs::read(self.runtime_path.as_ref()).await {
            Ok(raw) => Ok(serde_json::from_slice::<RuntimeConfig>(&raw)?),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(RuntimeConfig::default()),
            Err(err) => Err(err.into()),
        }
    }

    async fn load_snapshot(&self) -> anyhow::Result<Option<RestoreSnapshot>> {
        let _guard = self.lock.lock().await;
        match tokio::fs::read(self.snapshot_path.as_ref()).await {
            Ok(raw) => {
                let snapshot = serde_json::from_slice::<RestoreSnapshot>(&raw)?;
                *self.last_snapshot.lock().await = Some(snapshot.clone());
                Ok(Some(snapshot))
            }
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    /// Writes the snapshot unless it matches the last one written, ignoring
    /// the timestamp.
    async fn save_snapshot_if_changed(&self, snapshot: &RestoreSnapshot) -> anyhow::Result<()> {
        let _guard = self.lock.lock().await;
        let mut last = self.last_snapshot.lock().await;
        let unchanged = last.as_ref().is_some_and(|previous| {
            RestoreSnapshot {
                saved_at: None,
                ..previous.clone()
            } == RestoreSnapshot {
                saved_at: None,
                ..snapshot.clone()
            }
        });
        if unchanged {
            return Ok(());
        }

        let path = self.snapshot_path.as_ref().clone();
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let payload = serde_json::to_vec_pretty(snapshot)?;
        tokio::fs::write(path, payload).await?;
        *last = Some(snapshot.clone());
        Ok(())
    }
}

async fn persist_snapshot(state: &AppState) -> anyhow::Result<()> {
    let snapshot = state.controller.lock().await.snapshot(Utc::now());
    state.store.save_snapshot_if_changed(&snapshot).await
}

fn error_response(status: StatusCode, message: &str) -> axum::response::Response {
    (
        status,
        Json(ErrorBody {
            error: message.to_string(),
        }),
    )
        .into_response()
}

fn monotonic_ms() -> u64 {
    static START: OnceLock<Instant> = OnceLock::new();
    START
        .get_or_init(Instant::now)
        .elapsed()
        .as_millis()
        .try_into()
        .unwrap_or(u64::MAX)
}
