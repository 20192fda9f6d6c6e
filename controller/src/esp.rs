use core::convert::TryInto;
use std::{
    collections::BTreeMap,
    net::Ipv4Addr,
    sync::{mpsc, OnceLock},
    thread,
    time::{Duration, Instant},
};

use anyhow::{anyhow, Context};
use chrono::{Datelike, NaiveDateTime, Utc};
use chrono_tz::Tz;
use embedded_svc::{
    http::{client::Client as HttpClient, Headers, Method, Status},
    io::{Read, Write},
    wifi::{AccessPointConfiguration, AuthMethod, ClientConfiguration, Configuration},
};
use esp_idf_hal::gpio::{Output, PinDriver};
use esp_idf_svc::{
    eventloop::EspSystemEventLoop,
    hal::{gpio::AnyOutputPin, modem::Modem, prelude::Peripherals},
    http::client::{Configuration as HttpClientConfiguration, EspHttpConnection},
    http::server::{Configuration as HttpConfiguration, EspHttpServer},
    ipv4::{
        ClientConfiguration as IpClientConfiguration, ClientSettings as IpClientSettings,
        Configuration as IpConfiguration, Subnet,
    },
    log::EspLogger,
    netif::{EspNetif, NetifConfiguration},
    nvs::{EspDefaultNvsPartition, EspNvs, NvsDefault},
    sntp::EspSntp,
    wifi::{BlockingWifi, EspWifi},
};
use log::{info, warn};
use serde::{de::DeserializeOwned, Serialize};

use switch_common::{
    check_bounds, Clock, Credentials, DeviceIdentity, HttpReply, LicenseTransport, NetworkConfig,
    NetworkLink, NetworkSettings, NetworkSettingsUpdate, OutputPin, PersistentStore, PortError,
    RuntimeConfig, StorageError, StoredValue, TransportError, REGION_SIZE,
};

use crate::{
    api::{dispatch, ApiError, Reply, Request},
    device::{Device, Ports},
};

const NVS_NAMESPACE: &str = "switch";
const NVS_RUNTIME_KEY: &str = "runtime_json";
const NVS_REGION_KEY: &str = "region";
const MAX_HTTP_BODY: usize = 1024;
const MAX_NVS_STR: usize = 256;
const MAX_LICENSE_REPLY: usize = 2048;
const WATCHDOG_TIMEOUT_SEC: u32 = 30;
const TIME_SYNC_WAIT_MS: u64 = 20_000;
const REPLY_TIMEOUT: Duration = Duration::from_secs(15);

type Command = (Request, mpsc::SyncSender<Result<Reply, ApiError>>);

type HttpRequest<'r, 'c> =
    esp_idf_svc::http::server::Request<&'r mut esp_idf_svc::http::server::EspHttpConnection<'c>>;

pub fn run() -> anyhow::Result<()> {
    esp_idf_svc::sys::link_patches();
    EspLogger::initialize_default();

    let sys_loop = EspSystemEventLoop::take()?;
    let nvs_partition = EspDefaultNvsPartition::take()?;
    let mut store = NvsStore::open(nvs_partition.clone())?;

    let mut runtime = store.load_runtime_config().unwrap_or_else(|err| {
        warn!("failed to load runtime config from NVS: {err:#}");
        RuntimeConfig::default()
    });
    runtime.sanitize();

    let mut settings = NetworkSettings::load(&mut store, &runtime.network).unwrap_or_else(|err| {
        warn!("failed to load network settings from NVS: {err}");
        NetworkSettings::from_config(&runtime.network)
    });
    info!(
        "NVS config loaded: station=`{}`, ap=`{}`, ip_octet={:?}",
        settings.station.ssid, settings.access_point.ssid, settings.static_ip_octet
    );

    let Peripherals { modem, .. } = Peripherals::take()?;
    let (wifi, connected) = start_wifi(modem, sys_loop, nvs_partition, &settings, &runtime.network)
        .context("wifi startup failed")?;

    if connected {
        let confirmed = settings.station.clone();
        if let Err(err) = settings.save_station_credentials(&mut store, confirmed) {
            warn!("failed to remember station credentials: {err}");
        }
    }

    let identity = DeviceIdentity::from_mac(wifi.sta_netif().get_mac()?);
    info!("device identity {identity}");

    let output = unsafe { PinDriver::output(AnyOutputPin::new(runtime.output.pin)) }
        .with_context(|| format!("failed to claim output GPIO{}", runtime.output.pin))?;

    init_watchdog(WATCHDOG_TIMEOUT_SEC)?;

    let (requests, inbox) = mpsc::channel();
    spawn_control_loop(runtime, store, identity, wifi, output, inbox)?;
    let server = create_http_server(requests)?;

    // Keep services alive for the program lifetime.
    let _server = server;

    loop {
        thread::sleep(Duration::from_secs(60));
    }
}

fn start_wifi(
    modem: Modem,
    sys_loop: EspSystemEventLoop,
    nvs_partition: EspDefaultNvsPartition,
    settings: &NetworkSettings,
    network: &NetworkConfig,
) -> anyhow::Result<(EspWifi<'static>, bool)> {
    let mut esp_wifi = EspWifi::new(modem, sys_loop.clone(), Some(nvs_partition))?;

    let connected = {
        let mut wifi = BlockingWifi::wrap(&mut esp_wifi, sys_loop.clone())?;
        let access_point = access_point_configuration(&settings.access_point)?;

        if settings.station.ssid.trim().is_empty() {
            warn!("no station credentials, running access point only");
            wifi.set_configuration(&Configuration::AccessPoint(access_point))?;
            wifi.start()?;
            false
        } else {
            let station = station_configuration(&settings.station)?;
            wifi.set_configuration(&Configuration::Mixed(station, access_point))?;
            wifi.start()?;
            connect_station(&mut wifi, &settings.station.ssid, network)
        }
    };
    info!("access point `{}` up", settings.access_point.ssid);

    if let (true, Some(octet)) = (connected, settings.static_ip_octet) {
        if let Err(err) = apply_static_ip(&mut esp_wifi, sys_loop, octet, network) {
            warn!("failed to apply static IP octet {octet}, keeping DHCP lease: {err:#}");
        }
    }

    Ok((esp_wifi, connected))
}

fn station_configuration(station: &Credentials) -> anyhow::Result<ClientConfiguration> {
    let auth_method = if station.password.is_empty() {
        AuthMethod::None
    } else {
        AuthMethod::WPAWPA2Personal
    };

    Ok(ClientConfiguration {
        ssid: station
            .ssid
            .as_str()
            .try_into()
            .map_err(|_| anyhow!("station ssid too long"))?,
        password: station
            .password
            .as_str()
            .try_into()
            .map_err(|_| anyhow!("station password too long"))?,
        auth_method,
        ..Default::default()
    })
}

fn access_point_configuration(ap: &Credentials) -> anyhow::Result<AccessPointConfiguration> {
    let auth_method = if ap.password.is_empty() {
        AuthMethod::None
    } else {
        AuthMethod::WPA2Personal
    };

    Ok(AccessPointConfiguration {
        ssid: ap
            .ssid
            .as_str()
            .try_into()
            .map_err(|_| anyhow!("access point ssid too long"))?,
        password: ap
            .password
            .as_str()
            .try_into()
            .map_err(|_| anyhow!("access point password too long"))?,
        auth_method,
        channel: 1,
        ..Default::default()
    })
}

fn connect_station(
    wifi: &mut BlockingWifi<&mut EspWifi<'static>>,
    ssid: &str,
    network: &NetworkConfig,
) -> bool {
    info!("connecting to `{ssid}`");
    for attempt in 1..=network.connect_attempts {
        match wifi.connect().and_then(|()| wifi.wait_netif_up()) {
            Ok(()) => {
                info!("station connected on attempt {attempt}");
                return true;
            }
            Err(err) => warn!(
                "station connect attempt {attempt}/{} failed: {err}",
                network.connect_attempts
            ),
        }

        if attempt < network.connect_attempts {
            let _ = wifi.disconnect();
            thread::sleep(Duration::from_millis(network.connect_retry_ms));
        }
    }

    warn!("station unreachable after {} attempts", network.connect_attempts);
    false
}

/// Moves the station to `gateway[0..3].octet` on the subnet the DHCP lease
/// reported, with the configured DNS servers.
fn apply_static_ip(
    esp_wifi: &mut EspWifi<'static>,
    sys_loop: EspSystemEventLoop,
    octet: u8,
    network: &NetworkConfig,
) -> anyhow::Result<()> {
    let lease = esp_wifi.sta_netif().get_ip_info()?;
    let [a, b, c, _] = lease.subnet.gateway.octets();
    let ip = Ipv4Addr::new(a, b, c, octet);

    let conf = NetifConfiguration {
        ip_configuration: Some(IpConfiguration::Client(IpClientConfiguration::Fixed(
            IpClientSettings {
                ip,
                subnet: Subnet {
                    gateway: lease.subnet.gateway,
                    mask: lease.subnet.mask,
                },
                dns: Some(Ipv4Addr::from(network.dns[0])),
                secondary_dns: Some(Ipv4Addr::from(network.dns[1])),
            },
        ))),
        ..NetifConfiguration::wifi_default_client()
    };

    {
        let mut wifi = BlockingWifi::wrap(&mut *esp_wifi, sys_loop.clone())?;
        wifi.disconnect()?;
    }
    esp_wifi
        .swap_netif_sta(EspNetif::new_with_conf(&conf)?)
        .context("failed to swap station netif")?;

    let mut wifi = BlockingWifi::wrap(&mut *esp_wifi, sys_loop)?;
    wifi.connect()?;
    wifi.wait_netif_up()?;
    info!("station address fixed at {ip}");
    Ok(())
}

fn spawn_control_loop(
    runtime: RuntimeConfig,
    store: NvsStore,
    identity: DeviceIdentity,
    wifi: EspWifi<'static>,
    output: PinDriver<'static, AnyOutputPin, Output>,
    inbox: mpsc::Receiver<Command>,
) -> anyhow::Result<()> {
    let timezone: Tz = runtime.timezone.parse().unwrap_or_else(|_| {
        warn!("unknown timezone {}, using UTC", runtime.timezone);
        Tz::UTC
    });

    thread::Builder::new()
        .name("control-loop".into())
        .stack_size(16 * 1024)
        .spawn(move || {
            if let Err(err) = add_current_task_to_watchdog() {
                warn!("failed to register control loop with watchdog: {err:#}");
            }

            let mut clock = SntpClock {
                timezone,
                sntp: None,
            };
            clock.resync();
            wait_for_time(&clock);

            let ports = Ports {
                transport: Box::new(EspTransport {
                    timeout: Duration::from_millis(runtime.license.timeout_ms),
                }),
                clock: Box::new(clock),
                output: Box::new(RelayPin { pin: output }),
                network: Box::new(WifiLink { wifi }),
            };
            let mut device = Device::boot(&runtime, store, identity, ports, monotonic_ms());

            let interval = Duration::from_millis(runtime.controller.loop_interval_ms);
            let mut next_tick = Instant::now();
            loop {
                feed_watchdog();
                if Instant::now() >= next_tick {
                    device.iterate(monotonic_ms());
                    next_tick = Instant::now() + interval;
                }

                match inbox.recv_timeout(next_tick.saturating_duration_since(Instant::now())) {
                    Ok((request, reply)) => {
                        let _ = reply.send(dispatch(&mut device, request, monotonic_ms()));
                    }
                    Err(mpsc::RecvTimeoutError::Timeout) => {}
                    Err(mpsc::RecvTimeoutError::Disconnected) => {
                        warn!("request channel closed");
                        thread::sleep(interval);
                    }
                }
            }
        })
        .context("failed to spawn control loop thread")?;
    Ok(())
}

fn wait_for_time(clock: &SntpClock) {
    let started = monotonic_ms();
    while clock.now_local().is_none() {
        if monotonic_ms().saturating_sub(started) >= TIME_SYNC_WAIT_MS {
            warn!("time not synchronised after {TIME_SYNC_WAIT_MS}ms, continuing");
            return;
        }
        feed_watchdog();
        thread::sleep(Duration::from_millis(500));
    }
    info!("time synchronised");
}

fn create_http_server(requests: mpsc::Sender<Command>) -> anyhow::Result<EspHttpServer<'static>> {
    let conf = HttpConfiguration {
        stack_size: 12 * 1024,
        uri_match_wildcard: true,
        ..Default::default()
    };

    let mut server = EspHttpServer::new(&conf)?;

    {
        let requests = requests.clone();
        server.fn_handler("/api/status", Method::Get, move |req| {
            respond(req, forward(&requests, Request::Status))
        })?;
    }

    {
        let requests = requests.clone();
        server.fn_handler("/api/schedules", Method::Get, move |req| {
            respond(req, forward(&requests, Request::ListSchedules))
        })?;
    }

    {
        let requests = requests.clone();
        server.fn_handler("/api/schedules", Method::Post, move |mut req| {
            let body: AddScheduleBody = match read_json(&mut req) {
                Ok(body) => body,
                Err(message) => return write_error(req, 400, &message),
            };
            let request = Request::AddSchedule {
                start_hour: body.start_hour,
                start_minute: body.start_minute,
                duration_secs: body.duration_secs,
            };
            respond(req, forward(&requests, request))
        })?;
    }

    {
        let requests = requests.clone();
        server.fn_handler("/api/schedules", Method::Delete, move |req| {
            respond(req, forward(&requests, Request::DeleteAllSchedules))
        })?;
    }

    {
        let requests = requests.clone();
        server.fn_handler("/api/schedules/*", Method::Delete, move |req| {
            let index = req
                .uri()
                .rsplit('/')
                .next()
                .and_then(|tail| tail.parse::<usize>().ok());
            let Some(index) = index else {
                return write_error(req, 400, "schedule index must be a number");
            };
            respond(req, forward(&requests, Request::DeleteSchedule { index }))
        })?;
    }

    {
        let requests = requests.clone();
        server.fn_handler("/api/default-level", Method::Put, move |mut req| {
            let body: DefaultLevelBody = match read_json(&mut req) {
                Ok(body) => body,
                Err(message) => return write_error(req, 400, &message),
            };
            respond(req, forward(&requests, Request::SetDefaultLevel { level: body.level }))
        })?;
    }

    {
        let requests = requests.clone();
        server.fn_handler("/api/force", Method::Post, move |mut req| {
            let body: ForceBody = match read_json(&mut req) {
                Ok(body) => body,
                Err(message) => return write_error(req, 400, &message),
            };
            let request = Request::ForceActivate {
                duration_ms: body.duration_ms,
            };
            respond(req, forward(&requests, request))
        })?;
    }

    {
        let requests = requests.clone();
        server.fn_handler("/api/license/recheck", Method::Post, move |req| {
            respond(req, forward(&requests, Request::RecheckLicense))
        })?;
    }

    {
        let requests = requests.clone();
        server.fn_handler("/api/network", Method::Get, move |req| {
            respond(req, forward(&requests, Request::GetNetwork))
        })?;
    }

    server.fn_handler("/api/network", Method::Put, move |mut req| {
        let update: NetworkSettingsUpdate = match read_json(&mut req) {
            Ok(update) => update,
            Err(message) => return write_error(req, 400, &message),
        };
        respond(req, forward(&requests, Request::UpdateNetwork(update)))
    })?;

    Ok(server)
}

#[derive(Debug, serde::Deserialize)]
struct AddScheduleBody {
    #[serde(rename = "startHour")]
    start_hour: u8,
    #[serde(rename = "startMinute")]
    start_minute: u8,
    #[serde(rename = "durationSecs")]
    duration_secs: u32,
}

#[derive(Debug, serde::Deserialize)]
struct DefaultLevelBody {
    level: bool,
}

#[derive(Debug, serde::Deserialize)]
struct ForceBody {
    #[serde(rename = "durationMs")]
    duration_ms: u64,
}

fn forward(requests: &mpsc::Sender<Command>, request: Request) -> Result<Reply, ApiError> {
    let (reply_tx, reply_rx) = mpsc::sync_channel(1);
    requests
        .send((request, reply_tx))
        .map_err(|_| ApiError::Internal("control loop is not running".to_string()))?;
    reply_rx
        .recv_timeout(REPLY_TIMEOUT)
        .map_err(|_| ApiError::Internal("control loop did not answer".to_string()))?
}

fn respond(req: HttpRequest<'_, '_>, result: Result<Reply, ApiError>) -> anyhow::Result<()> {
    match result {
        Ok(reply) => write_json(req, &reply),
        Err(err) => write_error(req, err.status_code(), &err.to_string()),
    }
}

fn read_json<T: DeserializeOwned>(req: &mut HttpRequest<'_, '_>) -> Result<T, String> {
    let len = req.content_len().unwrap_or(0) as usize;
    if len > MAX_HTTP_BODY {
        return Err("request body too large".to_string());
    }

    let mut body = vec![0_u8; len];
    if len > 0 {
        req.read_exact(&mut body)
            .map_err(|err| format!("failed to read request body: {err:?}"))?;
    }
    serde_json::from_slice(&body).map_err(|err| format!("invalid JSON body: {err}"))
}

fn write_json<T: Serialize>(req: HttpRequest<'_, '_>, payload: &T) -> anyhow::Result<()> {
    let body = serde_json::to_vec(payload)?;
    req.into_response(
        200,
        Some("OK"),
        &[("Content-Type", "application/json; charset=utf-8")],
    )?
    .write_all(&body)?;
    Ok(())
}

fn write_error(req: HttpRequest<'_, '_>, status_code: u16, message: &str) -> anyhow::Result<()> {
    let payload = serde_json::json!({ "error": message });
    let body = serde_json::to_vec(&payload)?;
    req.into_response(
        status_code,
        None,
        &[("Content-Type", "application/json; charset=utf-8")],
    )?
    .write_all(&body)?;
    Ok(())
}

/// NVS-backed store. The schedule region is one blob; keyed values map to
/// native NVS entries. Everything is staged in RAM until `commit`.
struct NvsStore {
    nvs: EspNvs<NvsDefault>,
    region: Vec<u8>,
    region_dirty: bool,
    staged: BTreeMap<String, StoredValue>,
}

impl NvsStore {
    fn open(partition: EspDefaultNvsPartition) -> anyhow::Result<Self> {
        let nvs = EspNvs::new(partition, NVS_NAMESPACE, true)?;
        let mut store = Self {
            nvs,
            region: Vec::new(),
            region_dirty: false,
            staged: BTreeMap::new(),
        };
        store.reload_region();
        Ok(store)
    }

    fn reload_region(&mut self) {
        let mut buffer = vec![0_u8; REGION_SIZE];
        let mut region = match self.nvs.get_blob(NVS_REGION_KEY, &mut buffer) {
            Ok(Some(blob)) => blob.to_vec(),
            Ok(None) => Vec::new(),
            Err(err) => {
                warn!("failed to read schedule region, starting blank: {err}");
                Vec::new()
            }
        };
        region.resize(REGION_SIZE, 0);
        self.region = region;
        self.region_dirty = false;
    }

    fn load_runtime_config(&self) -> anyhow::Result<RuntimeConfig> {
        let mut buffer = vec![0_u8; 4096];
        match self.nvs.get_str(NVS_RUNTIME_KEY, &mut buffer)? {
            Some(value) => Ok(serde_json::from_str::<RuntimeConfig>(value)?),
            None => Ok(RuntimeConfig::default()),
        }
    }
}

impl PersistentStore for NvsStore {
    fn read(&mut self, offset: usize, buf: &mut [u8]) -> Result<(), StorageError> {
        check_bounds(offset, buf.len())?;
        buf.copy_from_slice(&self.region[offset..offset + buf.len()]);
        Ok(())
    }

    fn write(&mut self, offset: usize, data: &[u8]) -> Result<(), StorageError> {
        check_bounds(offset, data.len())?;
        self.region[offset..offset + data.len()].copy_from_slice(data);
        self.region_dirty = true;
        Ok(())
    }

    fn get_u32(&mut self, key: &str) -> Result<Option<u32>, StorageError> {
        match self.staged.get(key) {
            Some(StoredValue::U32(value)) => Ok(Some(*value)),
            Some(StoredValue::Str(_)) => Ok(None),
            None => self.nvs.get_u32(key).map_err(nvs_error),
        }
    }

    fn put_u32(&mut self, key: &str, value: u32) -> Result<(), StorageError> {
        self.staged.insert(key.to_string(), StoredValue::U32(value));
        Ok(())
    }

    fn get_str(&mut self, key: &str) -> Result<Option<String>, StorageError> {
        match self.staged.get(key) {
            Some(StoredValue::Str(value)) => Ok(Some(value.clone())),
            Some(StoredValue::U32(_)) => Ok(None),
            None => {
                let mut buffer = [0_u8; MAX_NVS_STR];
                let value = self.nvs.get_str(key, &mut buffer).map_err(nvs_error)?;
                Ok(value.map(str::to_string))
            }
        }
    }

    fn put_str(&mut self, key: &str, value: &str) -> Result<(), StorageError> {
        self.staged
            .insert(key.to_string(), StoredValue::Str(value.to_string()));
        Ok(())
    }

    fn commit(&mut self) -> Result<(), StorageError> {
        if self.region_dirty {
            self.nvs
                .set_blob(NVS_REGION_KEY, &self.region)
                .map_err(nvs_error)?;
            self.region_dirty = false;
        }

        while let Some((key, value)) = self.staged.pop_first() {
            let result = match &value {
                StoredValue::U32(number) => self.nvs.set_u32(&key, *number),
                StoredValue::Str(text) => self.nvs.set_str(&key, text),
            };
            if let Err(err) = result {
                self.staged.insert(key, value);
                return Err(nvs_error(err));
            }
        }
        Ok(())
    }

    fn discard(&mut self) -> Result<(), StorageError> {
        self.staged.clear();
        self.reload_region();
        Ok(())
    }
}

fn nvs_error(err: esp_idf_svc::sys::EspError) -> StorageError {
    StorageError::Backend(err.to_string())
}

struct EspTransport {
    timeout: Duration,
}

impl LicenseTransport for EspTransport {
    fn post_json(&mut self, url: &str, body: &[u8]) -> Result<HttpReply, TransportError> {
        let http_conf = HttpClientConfiguration {
            timeout: Some(self.timeout),
            ..Default::default()
        };
        let connection = EspHttpConnection::new(&http_conf).map_err(transport_error)?;
        let mut client = HttpClient::wrap(connection);

        let content_length = body.len().to_string();
        let headers = [
            ("Content-Type", "application/json"),
            ("Content-Length", content_length.as_str()),
        ];
        let mut request = client
            .request(Method::Post, url, &headers)
            .map_err(transport_error)?;
        request.write_all(body).map_err(transport_error)?;
        request.flush().map_err(transport_error)?;
        let mut response = request.submit().map_err(transport_error)?;

        let status = response.status();
        let mut reply = Vec::new();
        let mut chunk = [0_u8; 256];
        loop {
            let read = response.read(&mut chunk).map_err(transport_error)?;
            if read == 0 {
                break;
            }
            if reply.len() + read > MAX_LICENSE_REPLY {
                return Err(TransportError("license reply too large".to_string()));
            }
            reply.extend_from_slice(&chunk[..read]);
        }

        Ok(HttpReply {
            status,
            body: reply,
        })
    }
}

fn transport_error<E: core::fmt::Debug>(err: E) -> TransportError {
    TransportError(format!("{err:?}"))
}

/// System time set by SNTP, viewed in the configured timezone.
struct SntpClock {
    timezone: Tz,
    sntp: Option<EspSntp<'static>>,
}

impl Clock for SntpClock {
    fn now_local(&self) -> Option<NaiveDateTime> {
        let now = Utc::now();
        (now.year() >= 2020).then(|| now.with_timezone(&self.timezone).naive_local())
    }

    fn resync(&mut self) -> bool {
        self.sntp = None;
        match EspSntp::new_default() {
            Ok(sntp) => {
                self.sntp = Some(sntp);
                true
            }
            Err(err) => {
                warn!("failed to start SNTP: {err}");
                false
            }
        }
    }
}

struct RelayPin {
    pin: PinDriver<'static, AnyOutputPin, Output>,
}

impl OutputPin for RelayPin {
    fn set_level(&mut self, high: bool) -> Result<(), PortError> {
        let result = if high {
            self.pin.set_high()
        } else {
            self.pin.set_low()
        };
        result.map_err(|err| PortError(err.to_string()))
    }
}

struct WifiLink {
    wifi: EspWifi<'static>,
}

impl NetworkLink for WifiLink {
    fn is_connected(&self) -> bool {
        self.wifi.is_connected().unwrap_or(false)
    }

    fn reconnect(&mut self) -> Result<(), PortError> {
        self.wifi
            .connect()
            .map_err(|err| PortError(err.to_string()))
    }
}

fn init_watchdog(timeout_sec: u32) -> anyhow::Result<()> {
    let config = esp_idf_svc::sys::esp_task_wdt_config_t {
        timeout_ms: timeout_sec.saturating_mul(1000),
        idle_core_mask: 0,
        trigger_panic: true,
    };
    let rc = unsafe { esp_idf_svc::sys::esp_task_wdt_init(&config) };
    if rc == esp_idf_svc::sys::ESP_OK || rc == esp_idf_svc::sys::ESP_ERR_INVALID_STATE {
        return Ok(());
    }
    Err(anyhow!("esp_task_wdt_init failed with code {}", rc))
}

fn add_current_task_to_watchdog() -> anyhow::Result<()> {
    let rc = unsafe { esp_idf_svc::sys::esp_task_wdt_add(core::ptr::null_mut()) };
    if rc == esp_idf_svc::sys::ESP_OK || rc == esp_idf_svc::sys::ESP_ERR_INVALID_STATE {
        return Ok(());
    }
    Err(anyhow!("esp_task_wdt_add failed with code {}", rc))
}

fn feed_watchdog() {
    let _ = unsafe { esp_idf_svc::sys::esp_task_wdt_reset() };
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
