use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControllerConfig {
    pub loop_interval_ms: u64,
    pub clock_resync_interval_ms: u64,
    pub reconnect_interval_ms: u64,
    pub max_force_activate_ms: u64,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            loop_interval_ms: 1_000,
            clock_resync_interval_ms: 86_400_000,
            reconnect_interval_ms: 60_000,
            max_force_activate_ms: 3_600_000,
        }
    }
}

impl ControllerConfig {
    pub fn sanitize(&mut self) {
        self.loop_interval_ms = self.loop_interval_ms.clamp(100, 10_000);
        self.clock_resync_interval_ms = self.clock_resync_interval_ms.clamp(60_000, 604_800_000);
        self.reconnect_interval_ms = self.reconnect_interval_ms.clamp(5_000, 3_600_000);
        self.max_force_activate_ms = self.max_force_activate_ms.clamp(1_000, 86_400_000);
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LicenseConfig {
    pub endpoint: String,
    pub timeout_ms: u64,
}

impl Default for LicenseConfig {
    fn default() -> Self {
        Self {
            endpoint: "http://202.79.43.18:1080/get_expiry_date.php".to_string(),
            timeout_ms: 10_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    pub station_ssid: String,
    pub station_pass: String,
    pub ap_ssid: String,
    pub ap_pass: String,
    pub static_ip_octet: Option<u8>,
    pub dns: [[u8; 4]; 2],
    pub connect_attempts: u32,
    pub connect_retry_ms: u64,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            station_ssid: String::new(),
            station_pass: String::new(),
            ap_ssid: "Smart_Switch".to_string(),
            ap_pass: String::new(),
            static_ip_octet: Some(222),
            dns: [[8, 8, 8, 8], [8, 8, 4, 4]],
            connect_attempts: 20,
            connect_retry_ms: 500,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct OutputConfig {
    pub pin: i32,
    /// Idle level used until a default level has been persisted.
    pub default_level: bool,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            pin: 5,
            default_level: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    #[serde(default)]
    pub controller: ControllerConfig,
    #[serde(default)]
    pub license: LicenseConfig,
    #[serde(default)]
    pub network: NetworkConfig,
    #[serde(default)]
    pub output: OutputConfig,
    pub timezone: String,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            controller: ControllerConfig::default(),
            license: LicenseConfig::default(),
            network: NetworkConfig::default(),
            output: OutputConfig::default(),
            timezone: "Asia/Kathmandu".to_string(),
        }
    }
}

impl RuntimeConfig {
    pub fn sanitize(&mut self) {
        self.controller.sanitize();
        self.network.sanitize();
        self.license.timeout_ms = self.license.timeout_ms.clamp(1_000, 60_000);
        if self.license.endpoint.trim().is_empty() {
            self.license.endpoint = LicenseConfig::default().endpoint;
        }
        if self.output.pin < 0 {
            self.output.pin = OutputConfig::default().pin;
        }
    }
}

impl NetworkConfig {
    pub fn sanitize(&mut self) {
        self.static_ip_octet = self
            .static_ip_octet
            .filter(|octet| crate::network::is_valid_ip_octet(*octet));
        self.connect_attempts = self.connect_attempts.clamp(1, 100);
        self.connect_retry_ms = self.connect_retry_ms.clamp(100, 10_000);
        if self.ap_ssid.trim().is_empty() {
            self.ap_ssid = NetworkConfig::default().ap_ssid;
        }
    }
}
