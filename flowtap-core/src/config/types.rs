use serde::Deserialize;

/// Hash-table sizing and idle-timeout tuning for the two built-in muxes.
///
/// Defaults mirror the original dissector's constants: a 10 000-bucket,
/// hour-long-idle IP mux and a 67-bucket TCP mux with a shorter timeout
/// suited to short-lived connections.
#[derive(Debug, Deserialize, Clone)]
pub struct MuxConfig {
    #[serde(default = "default_ip_hash_size")]
    pub ip_hash_size: usize,
    #[serde(default = "default_ip_timeout_secs")]
    pub ip_timeout_secs: u64,
    #[serde(default = "default_tcp_hash_size")]
    pub tcp_hash_size: usize,
    #[serde(default = "default_tcp_timeout_secs")]
    pub tcp_timeout_secs: u64,
}

impl Default for MuxConfig {
    fn default() -> Self {
        Self {
            ip_hash_size: default_ip_hash_size(),
            ip_timeout_secs: default_ip_timeout_secs(),
            tcp_hash_size: default_tcp_hash_size(),
            tcp_timeout_secs: default_tcp_timeout_secs(),
        }
    }
}

fn default_ip_hash_size() -> usize {
    10_000
}
fn default_ip_timeout_secs() -> u64 {
    3_600
}
fn default_tcp_hash_size() -> usize {
    67
}
fn default_tcp_timeout_secs() -> u64 {
    600
}

/// Bounds applied to a single packet wait-list instance.
#[derive(Debug, Deserialize, Clone)]
pub struct WaitListConfig {
    /// Diagnostic name, e.g. "IP-reassembly" or "TCP-reordering".
    pub name: String,
    #[serde(default = "default_max_pending_bytes")]
    pub max_pending_bytes: usize,
    #[serde(default = "default_max_pending_packets")]
    pub max_pending_packets: usize,
    #[serde(default = "default_max_acquire_gap")]
    pub max_acquire_gap: u32,
    #[serde(default = "default_wl_timeout_secs")]
    pub timeout_secs: u64,
    /// Whether an out-of-band sync offset (e.g. a TCP ACK) may force an
    /// early drain of fragments below that offset.
    #[serde(default = "default_true")]
    pub acquirable: bool,
}

fn default_max_pending_bytes() -> usize {
    65_536
}
fn default_max_pending_packets() -> usize {
    100_000
}
fn default_max_acquire_gap() -> u32 {
    100_000
}
fn default_wl_timeout_secs() -> u64 {
    3
}
fn default_true() -> bool {
    true
}

impl WaitListConfig {
    pub fn ip_default() -> Self {
        Self {
            name: "IP-reassembly".to_string(),
            max_pending_bytes: 65_536,
            max_pending_packets: 5,
            max_acquire_gap: 65_536,
            timeout_secs: 60,
            acquirable: false,
        }
    }

    pub fn tcp_default() -> Self {
        Self {
            name: "TCP-reordering".to_string(),
            max_pending_bytes: 100_000,
            max_pending_packets: 20,
            max_acquire_gap: 100_000,
            timeout_secs: 3,
            acquirable: true,
        }
    }
}

/// A single `port_min..=port_max -> protocol` binding for the TCP port muxer.
#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
pub struct PortBinding {
    pub name: String,
    pub port_min: u16,
    pub port_max: u16,
}

/// A netmatch filter to register at startup: a shared object implementing
/// the `match` ABI plus the number of opaque registers it needs.
#[derive(Debug, Deserialize, Clone)]
pub struct NetmatchFilterConfig {
    pub name: String,
    pub library_path: String,
    #[serde(default)]
    pub register_count: usize,
}

/// Application-level structured logging configuration.
#[derive(Debug, Deserialize, Clone, Default)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub show_target: bool,
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Observability configuration: metrics exposition.
#[derive(Debug, Deserialize, Clone, Default)]
pub struct TelemetryConfig {
    /// Port to serve a Prometheus text exposition on, if the `flowtap`
    /// binary is asked to run one. The core itself never binds a socket.
    #[serde(default)]
    pub metrics_port: Option<u16>,
}

/// Top-level configuration loaded from TOML.
#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    #[serde(default)]
    pub mux: MuxConfig,
    #[serde(default)]
    pub ip_wait_list: Option<WaitListConfig>,
    #[serde(default)]
    pub tcp_wait_list: Option<WaitListConfig>,
    /// Initial TCP port -> protocol bindings.
    #[serde(default)]
    pub tcp_ports: Vec<PortBinding>,
    /// Netmatch filters to load at startup.
    #[serde(default)]
    pub netmatch: Vec<NetmatchFilterConfig>,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub telemetry: TelemetryConfig,
}

impl Config {
    pub fn ip_wait_list_config(&self) -> WaitListConfig {
        self.ip_wait_list.clone().unwrap_or_else(WaitListConfig::ip_default)
    }

    pub fn tcp_wait_list_config(&self) -> WaitListConfig {
        self.tcp_wait_list.clone().unwrap_or_else(WaitListConfig::tcp_default)
    }
}
