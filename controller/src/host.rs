use std::{
    collections::BTreeMap,
    io::ErrorKind,
    net::SocketAddr,
    path::{Path, PathBuf},
    sync::{
        mpsc::{self, RecvTimeoutError},
        OnceLock,
    },
    thread,
    time::{Duration, Instant},
};

use anyhow::Context;
use axum::{
    extract::{Path as UrlPath, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{delete, get, post, put},
    Json, Router,
};
use chrono::{Datelike, NaiveDateTime, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use tokio::{net::TcpListener, sync::oneshot};
use tracing::{error, info, warn};

use switch_common::{
    check_bounds, Clock, DeviceIdentity, HttpReply, LicenseTransport, NetworkLink,
    NetworkSettingsUpdate, OutputPin, PersistentStore, PortError, RuntimeConfig, SlotIndex,
    StorageError, StoredValue, TransportError, REGION_SIZE,
};

use crate::{
    api::{dispatch, ApiError, Reply, Request},
    device::{Device, Ports},
};

const REGION_FILE: &str = "eeprom.bin";
const PREFS_FILE: &str = "prefs.json";
const FALLBACK_MAC: &str = "02:00:00:00:00:01";

type Command = (Request, oneshot::Sender<Result<Reply, ApiError>>);

#[derive(Clone)]
struct AppState {
    requests: mpsc::Sender<Command>,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

#[derive(Debug, Deserialize)]
struct AddScheduleBody {
    #[serde(rename = "startHour")]
    start_hour: u8,
    #[serde(rename = "startMinute")]
    start_minute: u8,
    #[serde(rename = "durationSecs")]
    duration_secs: u32,
}

#[derive(Debug, Deserialize)]
struct DefaultLevelBody {
    level: bool,
}

#[derive(Debug, Deserialize)]
struct ForceBody {
    #[serde(rename = "durationMs")]
    duration_ms: u64,
}

pub async fn run() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let data_dir = std::env::var("SWITCH_DATA_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("./.smart-switch"));

    let mut runtime = load_runtime_config(&data_dir.join("runtime.json")).unwrap_or_else(|err| {
        warn!("failed to load runtime config: {err:#}");
        RuntimeConfig::default()
    });
    if let Ok(endpoint) = std::env::var("LICENSE_ENDPOINT") {
        runtime.license.endpoint = endpoint;
    }
    runtime.sanitize();

    let identity = std::env::var("DEVICE_MAC")
        .ok()
        .and_then(|mac| DeviceIdentity::parse_mac(&mac))
        .or_else(|| DeviceIdentity::parse_mac(FALLBACK_MAC))
        .context("no usable device MAC")?;

    let store = FileStore::open(&data_dir)
        .with_context(|| format!("failed to open store in {}", data_dir.display()))?;

    let (requests, inbox) = mpsc::channel();
    spawn_control_loop(runtime, store, identity, inbox)?;

    let app = Router::new()
        .route("/api/status", get(handle_get_status))
        .route(
            "/api/schedules",
            get(handle_list_schedules)
                .post(handle_add_schedule)
                .delete(handle_delete_all_schedules),
        )
        .route("/api/schedules/{index}", delete(handle_delete_schedule))
        .route("/api/default-level", put(handle_set_default_level))
        .route("/api/force", post(handle_force_activate))
        .route("/api/license/recheck", post(handle_recheck_license))
        .route(
            "/api/network",
            get(handle_get_network).put(handle_put_network),
        )
        .with_state(AppState { requests });

    let port = std::env::var("CONTROLLER_HTTP_PORT")
        .ok()
        .and_then(|value| value.parse::<u16>().ok())
        .unwrap_or(8080);
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind controller server at {addr}"))?;

    info!("controller listening on http://{addr}");
    axum::serve(listener, app).await?;
    Ok(())
}

fn load_runtime_config(path: &Path) -> anyhow::Result<RuntimeConfig> {
    match std::fs::read(path) {
        Ok(raw) => Ok(serde_json::from_slice::<RuntimeConfig>(&raw)?),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(RuntimeConfig::default()),
        Err(err) => Err(err.into()),
    }
}

/// The device is owned by this thread alone; HTTP handlers reach it through
/// the channel and wait for the reply.
fn spawn_control_loop(
    runtime: RuntimeConfig,
    store: FileStore,
    identity: DeviceIdentity,
    inbox: mpsc::Receiver<Command>,
) -> anyhow::Result<()> {
    let timezone: Tz = runtime.timezone.parse().unwrap_or_else(|_| {
        warn!("unknown timezone {}, using UTC", runtime.timezone);
        Tz::UTC
    });

    thread::Builder::new()
        .name("control-loop".to_string())
        .spawn(move || {
            let timeout = Duration::from_millis(runtime.license.timeout_ms);
            let transport = match HttpTransport::new(timeout) {
                Ok(transport) => transport,
                Err(err) => {
                    error!("failed to build license client: {err}");
                    return;
                }
            };
            let ports = Ports {
                transport: Box::new(transport),
                clock: Box::new(SystemClock { timezone }),
                output: Box::new(LoggedPin::new(runtime.output.pin)),
                network: Box::new(HostLink),
            };
            let mut device = Device::boot(&runtime, store, identity, ports, monotonic_ms());

            let interval = Duration::from_millis(runtime.controller.loop_interval_ms);
            let mut next_tick = Instant::now();
            loop {
                if Instant::now() >= next_tick {
                    device.iterate(monotonic_ms());
                    next_tick = Instant::now() + interval;
                }

                match inbox.recv_timeout(next_tick.saturating_duration_since(Instant::now())) {
                    Ok((request, reply)) => {
                        let _ = reply.send(dispatch(&mut device, request, monotonic_ms()));
                    }
                    Err(RecvTimeoutError::Timeout) => {}
                    Err(RecvTimeoutError::Disconnected) => break,
                }
            }
            info!("control loop stopped");
        })
        .context("failed to spawn control loop")?;
    Ok(())
}

async fn submit(state: &AppState, request: Request) -> axum::response::Response {
    let (reply_tx, reply_rx) = oneshot::channel();
    if state.requests.send((request, reply_tx)).is_err() {
        return error_response(StatusCode::SERVICE_UNAVAILABLE, "control loop is not running");
    }

    match reply_rx.await {
        Ok(Ok(reply)) => Json(reply).into_response(),
        Ok(Err(err)) => {
            let status = StatusCode::from_u16(err.status_code())
                .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
            error_response(status, &err.to_string())
        }
        Err(_) => error_response(
            StatusCode::SERVICE_UNAVAILABLE,
            "control loop dropped the request",
        ),
    }
}

async fn handle_get_status(State(state): State<AppState>) -> impl IntoResponse {
    submit(&state, Request::Status).await
}

async fn handle_list_schedules(State(state): State<AppState>) -> impl IntoResponse {
    submit(&state, Request::ListSchedules).await
}

async fn handle_add_schedule(
    State(state): State<AppState>,
    Json(body): Json<AddScheduleBody>,
) -> impl IntoResponse {
    let request = Request::AddSchedule {
        start_hour: body.start_hour,
        start_minute: body.start_minute,
        duration_secs: body.duration_secs,
    };
    submit(&state, request).await
}

async fn handle_delete_schedule(
    State(state): State<AppState>,
    UrlPath(index): UrlPath<SlotIndex>,
) -> impl IntoResponse {
    submit(&state, Request::DeleteSchedule { index }).await
}

async fn handle_delete_all_schedules(State(state): State<AppState>) -> impl IntoResponse {
    submit(&state, Request::DeleteAllSchedules).await
}

async fn handle_set_default_level(
    State(state): State<AppState>,
    Json(body): Json<DefaultLevelBody>,
) -> impl IntoResponse {
    submit(&state, Request::SetDefaultLevel { level: body.level }).await
}

async fn handle_force_activate(
    State(state): State<AppState>,
    Json(body): Json<ForceBody>,
) -> impl IntoResponse {
    submit(
        &state,
        Request::ForceActivate {
            duration_ms: body.duration_ms,
        },
    )
    .await
}

async fn handle_recheck_license(State(state): State<AppState>) -> impl IntoResponse {
    submit(&state, Request::RecheckLicense).await
}

async fn handle_get_network(State(state): State<AppState>) -> impl IntoResponse {
    submit(&state, Request::GetNetwork).await
}

async fn handle_put_network(
    State(state): State<AppState>,
    Json(update): Json<NetworkSettingsUpdate>,
) -> impl IntoResponse {
    submit(&state, Request::UpdateNetwork(update)).await
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

/// File-backed store: the schedule region lives in `eeprom.bin`, keyed values
/// in `prefs.json`. Writes are staged in memory and land on disk at commit.
pub struct FileStore {
    dir: PathBuf,
    region: Vec<u8>,
    entries: BTreeMap<String, StoredValue>,
}

impl FileStore {
    pub fn open(dir: &Path) -> Result<Self, StorageError> {
        std::fs::create_dir_all(dir).map_err(backend)?;
        let mut store = Self {
            dir: dir.to_path_buf(),
            region: Vec::new(),
            entries: BTreeMap::new(),
        };
        store.reload()?;
        Ok(store)
    }

    /// Replaces the in-memory image with what is on disk.
    fn reload(&mut self) -> Result<(), StorageError> {
        let mut region = match std::fs::read(self.dir.join(REGION_FILE)) {
            Ok(raw) => raw,
            Err(err) if err.kind() == ErrorKind::NotFound => Vec::new(),
            Err(err) => return Err(backend(err)),
        };
        if region.len() != REGION_SIZE {
            if !region.is_empty() {
                warn!("region file has {} bytes, resizing to {REGION_SIZE}", region.len());
            }
            region.resize(REGION_SIZE, 0);
        }

        let entries = match std::fs::read(self.dir.join(PREFS_FILE)) {
            Ok(raw) => serde_json::from_slice(&raw).unwrap_or_else(|err| {
                warn!("discarding unreadable {PREFS_FILE}: {err}");
                BTreeMap::new()
            }),
            Err(err) if err.kind() == ErrorKind::NotFound => BTreeMap::new(),
            Err(err) => return Err(backend(err)),
        };

        self.region = region;
        self.entries = entries;
        Ok(())
    }

    fn replace_file(&self, name: &str, contents: &[u8]) -> Result<(), StorageError> {
        let target = self.dir.join(name);
        let staging = self.dir.join(format!("{name}.tmp"));
        std::fs::write(&staging, contents).map_err(backend)?;
        std::fs::rename(&staging, &target).map_err(backend)
    }
}

impl PersistentStore for FileStore {
    fn read(&mut self, offset: usize, buf: &mut [u8]) -> Result<(), StorageError> {
        check_bounds(offset, buf.len())?;
        buf.copy_from_slice(&self.region[offset..offset + buf.len()]);
        Ok(())
    }

    fn write(&mut self, offset: usize, data: &[u8]) -> Result<(), StorageError> {
        check_bounds(offset, data.len())?;
        self.region[offset..offset + data.len()].copy_from_slice(data);
        Ok(())
    }

    fn get_u32(&mut self, key: &str) -> Result<Option<u32>, StorageError> {
        Ok(match self.entries.get(key) {
            Some(StoredValue::U32(value)) => Some(*value),
            _ => None,
        })
    }

    fn put_u32(&mut self, key: &str, value: u32) -> Result<(), StorageError> {
        self.entries.insert(key.to_string(), StoredValue::U32(value));
        Ok(())
    }

    fn get_str(&mut self, key: &str) -> Result<Option<String>, StorageError> {
        Ok(match self.entries.get(key) {
            Some(StoredValue::Str(value)) => Some(value.clone()),
            _ => None,
        })
    }

    fn put_str(&mut self, key: &str, value: &str) -> Result<(), StorageError> {
        self.entries
            .insert(key.to_string(), StoredValue::Str(value.to_string()));
        Ok(())
    }

    fn commit(&mut self) -> Result<(), StorageError> {
        self.replace_file(REGION_FILE, &self.region)?;
        let prefs = serde_json::to_vec_pretty(&self.entries)
            .map_err(|err| StorageError::Backend(err.to_string()))?;
        self.replace_file(PREFS_FILE, &prefs)
    }

    fn discard(&mut self) -> Result<(), StorageError> {
        self.reload()
    }
}

fn backend(err: std::io::Error) -> StorageError {
    StorageError::Backend(err.to_string())
}

pub struct HttpTransport {
    client: reqwest::blocking::Client,
}

impl HttpTransport {
    pub fn new(timeout: Duration) -> Result<Self, TransportError> {
        let client = reqwest::blocking::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|err| TransportError(err.to_string()))?;
        Ok(Self { client })
    }
}

impl LicenseTransport for HttpTransport {
    fn post_json(&mut self, url: &str, body: &[u8]) -> Result<HttpReply, TransportError> {
        let response = self
            .client
            .post(url)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .body(body.to_vec())
            .send()
            .map_err(|err| TransportError(err.to_string()))?;

        let status = response.status().as_u16();
        let body = response
            .bytes()
            .map_err(|err| TransportError(err.to_string()))?;
        Ok(HttpReply {
            status,
            body: body.to_vec(),
        })
    }
}

/// Wall clock of the host, viewed in the configured timezone. A clock that
/// reads earlier than 2020 is treated as never set.
struct SystemClock {
    timezone: Tz,
}

impl Clock for SystemClock {
    fn now_local(&self) -> Option<NaiveDateTime> {
        let now = Utc::now();
        (now.year() >= 2020).then(|| now.with_timezone(&self.timezone).naive_local())
    }

    fn resync(&mut self) -> bool {
        self.now_local().is_some()
    }
}

/// Stand-in for the relay GPIO; the simulator only logs level changes.
struct LoggedPin {
    pin: i32,
}

impl LoggedPin {
    fn new(pin: i32) -> Self {
        Self { pin }
    }
}

impl OutputPin for LoggedPin {
    fn set_level(&mut self, high: bool) -> Result<(), PortError> {
        info!(pin = self.pin, high, "output level");
        Ok(())
    }
}

struct HostLink;

impl NetworkLink for HostLink {
    fn is_connected(&self) -> bool {
        true
    }

    fn reconnect(&mut self) -> Result<(), PortError> {
        Ok(())
    }
}
