use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Deserialize;

/// Top-level configuration for the tarpit.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Logging verbosity (trace, debug, info, warn, error). Default: "info".
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Delay between consecutive lines sent to the same client. Default: 1s.
    #[serde(default = "default_interval", with = "humantime_serde")]
    pub interval: Duration,

    /// Exclusive upper bound on the random line length, in bytes. Default: 32.
    #[serde(default = "default_line_length")]
    pub line_length: u64,

    /// Ceiling on concurrently trapped clients. Default: 4096.
    #[serde(default = "default_max_clients")]
    pub max_clients: usize,

    /// Address family for the listeners (tcp, tcp4, tcp6). Default: tcp.
    #[serde(default)]
    pub conn_type: ConnType,

    /// Bind address for the listeners. Default: "0.0.0.0".
    #[serde(default = "default_host")]
    pub host: String,

    /// Listening ports. Default: [2222].
    #[serde(default = "default_ports")]
    pub ports: Vec<u16>,

    /// Prometheus exposition configuration.
    #[serde(default)]
    pub prometheus: PrometheusConfig,

    /// GeoIP lookup configuration.
    #[serde(default)]
    pub geoip: GeoIpConfig,
}

/// Prometheus exposition configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct PrometheusConfig {
    /// Enable the metrics endpoint. Default: false.
    #[serde(default)]
    pub enabled: bool,

    /// Metrics listen address. Default: "0.0.0.0".
    #[serde(default = "default_host")]
    pub host: String,

    /// Metrics listen port. Default: 2112.
    #[serde(default = "default_prometheus_port")]
    pub port: u16,

    /// URL path component the metrics are served under. Default: "metrics".
    #[serde(default = "default_prometheus_entry")]
    pub entry: String,

    /// Evict per-IP metric series once the IP has been silent this many
    /// seconds. 0 disables eviction. Default: 0.
    #[serde(default)]
    pub clean_unseen_seconds: u64,
}

/// GeoIP lookup configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct GeoIpConfig {
    /// Supplier for IP locations (off, ip-api, max-mind-db). Default: off.
    #[serde(default)]
    pub supplier: GeoSupplier,

    /// Path to a MaxMind City or Country database file.
    #[serde(default)]
    pub max_mind_db: String,
}

/// Address family selector for the tarpit listeners.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnType {
    /// Either address family, whichever the bind address resolves to first.
    #[default]
    Tcp,
    /// IPv4 only.
    Tcp4,
    /// IPv6 only.
    Tcp6,
}

impl ConnType {
    /// Returns the canonical flag spelling.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Tcp => "tcp",
            Self::Tcp4 => "tcp4",
            Self::Tcp6 => "tcp6",
        }
    }
}

impl fmt::Display for ConnType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ConnType {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "tcp" => Ok(Self::Tcp),
            "tcp4" => Ok(Self::Tcp4),
            "tcp6" => Ok(Self::Tcp6),
            other => bail!("invalid conn_type: {other} (expected tcp, tcp4 or tcp6)"),
        }
    }
}

/// GeoIP supplier selector.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum GeoSupplier {
    /// No lookups; every client is labeled "Geohash off".
    #[default]
    Off,
    /// Query the ip-api.com HTTP endpoint per client IP.
    IpApi,
    /// Read a local MaxMind database file.
    MaxMindDb,
}

impl GeoSupplier {
    /// Returns the canonical flag spelling.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Off => "off",
            Self::IpApi => "ip-api",
            Self::MaxMindDb => "max-mind-db",
        }
    }
}

impl fmt::Display for GeoSupplier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for GeoSupplier {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "off" => Ok(Self::Off),
            "ip-api" => Ok(Self::IpApi),
            "max-mind-db" => Ok(Self::MaxMindDb),
            other => bail!("invalid geoip_supplier: {other} (expected off, ip-api or max-mind-db)"),
        }
    }
}

// --- Default value functions ---

fn default_log_level() -> String {
    "info".to_string()
}

fn default_interval() -> Duration {
    Duration::from_millis(1000)
}

fn default_line_length() -> u64 {
    32
}

fn default_max_clients() -> usize {
    4096
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_ports() -> Vec<u16> {
    vec![2222]
}

fn default_prometheus_port() -> u16 {
    2112
}

fn default_prometheus_entry() -> String {
    "metrics".to_string()
}

// --- Default trait impls ---

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            interval: default_interval(),
            line_length: default_line_length(),
            max_clients: default_max_clients(),
            conn_type: ConnType::default(),
            host: default_host(),
            ports: default_ports(),
            prometheus: PrometheusConfig::default(),
            geoip: GeoIpConfig::default(),
        }
    }
}

impl Default for PrometheusConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            host: default_host(),
            port: default_prometheus_port(),
            entry: default_prometheus_entry(),
            clean_unseen_seconds: 0,
        }
    }
}

// --- Validation and loading ---

impl Config {
    /// Load configuration from a YAML file.
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;

        let cfg: Config = serde_yaml::from_str(&data)
            .with_context(|| format!("parsing config file {}", path.display()))?;

        Ok(cfg)
    }

    /// Validate the configuration for required fields and consistency.
    pub fn validate(&self) -> Result<()> {
        if self.interval.is_zero() {
            bail!("interval must be positive");
        }

        if self.line_length == 0 {
            bail!("line_length must be positive");
        }

        if self.max_clients == 0 {
            bail!("max_clients must be positive");
        }

        if self.ports.is_empty() {
            bail!("at least one port is required");
        }

        if self.prometheus.enabled {
            if self.prometheus.entry.is_empty() {
                bail!("prometheus entry point must not be empty");
            }

            if self.prometheus.entry.contains('/') {
                bail!("prometheus entry point must be a single path component");
            }
        }

        if self.geoip.supplier == GeoSupplier::MaxMindDb && self.geoip.max_mind_db.is_empty() {
            bail!("max_mind_db path is required for the max-mind-db supplier");
        }

        Ok(())
    }

    /// Returns the bind host with the wildcard rewritten for IPv6-only mode.
    ///
    /// "0.0.0.0" is the IPv4 wildcard; when the listeners are tcp6 the
    /// intended meaning is "any address", which spells "[::]" there.
    pub fn effective_host(&self, host: &str) -> String {
        if self.conn_type == ConnType::Tcp6 && host == "0.0.0.0" {
            "[::]".to_string()
        } else {
            host.to_string()
        }
    }

    /// Eviction horizon as a Duration; None when eviction is disabled.
    pub fn clean_horizon(&self) -> Option<Duration> {
        if self.prometheus.clean_unseen_seconds == 0 {
            None
        } else {
            Some(Duration::from_secs(self.prometheus.clean_unseen_seconds))
        }
    }
}
