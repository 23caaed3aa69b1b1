//! Configuration for the lookout-discover daemon.

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::time::Duration;

use ipnet::IpNet;
use serde::Deserialize;

use lookout_core::{AuthMode, Device, IdentityToken};
use lookout_store::Credentials;

use crate::error::{DiscoverError, Result};

/// Top-level discover configuration.
///
/// Loaded from `lookout.toml` `[discover]` section or
/// `LOOKOUT_DISCOVER__` environment variables.
#[derive(Debug, Clone, Deserialize)]
pub struct DiscoverConfig {
    /// CIDR subnets swept by netscan discovery (e.g., "192.168.1.0/24").
    #[serde(default)]
    pub discovery_subnets: Vec<String>,

    /// Which discovery mechanisms run on each discovery pass.
    #[serde(default)]
    pub discovery_mode: DiscoveryMode,

    /// Ports probed on every netscan host.
    #[serde(default = "default_netscan_ports")]
    pub netscan_ports: Vec<u16>,

    /// Per-dial timeout in milliseconds, also the read window for replies.
    #[serde(default = "default_probe_timeout_ms")]
    pub probe_timeout_ms: u64,

    /// Worker pool size for netscan.
    #[serde(default = "default_probe_async_limit")]
    pub probe_async_limit: usize,

    /// Upper bound for one discovery pass; 0 disables the bound.
    #[serde(default = "default_max_discover_duration")]
    pub max_discover_duration_secs: u64,

    /// Discovery cadence in seconds; 0 disables scheduled discovery.
    #[serde(default = "default_discovery_interval")]
    pub discovery_interval_secs: u64,

    /// Health-check cadence in seconds; 0 disables scheduled health checks.
    #[serde(default = "default_check_status_interval")]
    pub check_status_interval_secs: u64,

    /// Ceiling for the health-check cadence; 0 removes it.
    #[serde(default = "default_max_interval")]
    pub max_interval_secs: u64,

    /// Ceiling for the discovery cadence; 0 removes it.
    #[serde(default = "default_max_discovery_interval")]
    pub max_discovery_interval_secs: u64,

    /// Timeout for each application-level request in seconds.
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    /// Auth mode assigned to newly discovered devices.
    #[serde(default)]
    pub default_auth_mode: AuthMode,

    /// Secret reference assigned to newly discovered devices.
    #[serde(default = "default_secret_ref")]
    pub default_secret_ref: String,

    /// Poll interval when waiting for credentials to appear.
    #[serde(default = "default_credentials_retry")]
    pub credentials_retry_secs: u64,

    /// Maximum time to wait for credentials to appear.
    #[serde(default = "default_credentials_wait")]
    pub credentials_wait_secs: u64,

    /// Local IPv4 address of the interface used for multicast discovery.
    #[serde(default)]
    pub discovery_interface_addr: Option<Ipv4Addr>,

    /// Statically registered devices.
    #[serde(default)]
    pub devices: Vec<StaticDevice>,

    /// Credentials keyed by secret reference.
    #[serde(default)]
    pub credentials: HashMap<String, Credentials>,
}

/// Discovery mechanisms, matching the gateway's `DiscoveryMode` setting.
#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum DiscoveryMode {
    /// Unicast probe to every host:port in the configured subnets.
    Netscan,
    /// One multicast probe on the local segment.
    #[default]
    Multicast,
    Both,
}

impl DiscoveryMode {
    pub fn uses_multicast(self) -> bool {
        matches!(self, Self::Multicast | Self::Both)
    }

    pub fn uses_netscan(self) -> bool {
        matches!(self, Self::Netscan | Self::Both)
    }
}

/// A device registered by hand rather than found by discovery.
#[derive(Debug, Clone, Deserialize)]
pub struct StaticDevice {
    pub name: String,
    pub address: String,
    #[serde(default = "default_onvif_port")]
    pub port: u16,
    /// Endpoint reference, if known. Without it the device never matches
    /// discovery results.
    pub identity: Option<String>,
    pub auth_mode: Option<AuthMode>,
    pub secret_ref: Option<String>,
}

impl StaticDevice {
    /// Convert into an inventory record, filling gaps from `config` defaults.
    pub fn to_device(&self, config: &DiscoverConfig) -> Result<Device> {
        let mut device = Device::new(&self.name, &self.address, self.port);
        if let Some(raw) = &self.identity {
            let token = IdentityToken::new(raw.as_str())
                .map_err(|e| DiscoverError::Config(format!("device {}: {e}", self.name)))?;
            device = device.with_identity(token);
        }
        device.auth_mode = self.auth_mode.unwrap_or(config.default_auth_mode);
        device.secret_ref = self
            .secret_ref
            .clone()
            .unwrap_or_else(|| config.default_secret_ref.clone());
        Ok(device)
    }
}

impl DiscoverConfig {
    /// Reject values that would make every scan fail.
    pub fn validate(&self) -> Result<()> {
        self.parsed_subnets()?;
        if self.probe_async_limit == 0 {
            return Err(DiscoverError::Config(
                "probe_async_limit must be greater than zero".to_string(),
            ));
        }
        if self.netscan_ports.is_empty() {
            return Err(DiscoverError::Config(
                "netscan_ports must not be empty".to_string(),
            ));
        }
        if self.probe_timeout_ms == 0 {
            return Err(DiscoverError::Config(
                "probe_timeout_ms must be greater than zero".to_string(),
            ));
        }
        for device in &self.devices {
            device.to_device(self)?;
        }
        Ok(())
    }

    pub fn parsed_subnets(&self) -> Result<Vec<IpNet>> {
        parse_subnets(&self.discovery_subnets)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn max_discover_duration(&self) -> Option<Duration> {
        (self.max_discover_duration_secs > 0)
            .then(|| Duration::from_secs(self.max_discover_duration_secs))
    }

    pub fn credentials_retry(&self) -> Duration {
        Duration::from_secs(self.credentials_retry_secs)
    }

    pub fn credentials_wait(&self) -> Duration {
        Duration::from_secs(self.credentials_wait_secs)
    }

    pub fn static_devices(&self) -> Result<Vec<Device>> {
        self.devices.iter().map(|d| d.to_device(self)).collect()
    }
}

/// Load the `[discover]` section from `<file_prefix>.toml` (optional) and
/// `LOOKOUT_DISCOVER__*` environment variables, then validate it.
///
/// A missing section yields the defaults. List values given through the
/// environment are comma separated.
pub fn load(file_prefix: &str) -> Result<DiscoverConfig> {
    let cfg = ::config::Config::builder()
        .add_source(::config::File::with_name(file_prefix).required(false))
        .add_source(
            ::config::Environment::with_prefix("LOOKOUT")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true)
                .list_separator(",")
                .with_list_parse_key("discover.discovery_subnets")
                .with_list_parse_key("discover.netscan_ports"),
        )
        .build()
        .map_err(|e| DiscoverError::Config(e.to_string()))?;

    let discover = match cfg.get::<DiscoverConfig>("discover") {
        Ok(c) => c,
        Err(::config::ConfigError::NotFound(_)) => DiscoverConfig::default(),
        Err(e) => return Err(DiscoverError::Config(e.to_string())),
    };
    discover.validate()?;
    Ok(discover)
}

/// Parse CIDR strings, tolerating surrounding whitespace and blank entries.
pub fn parse_subnets<S: AsRef<str>>(raw: &[S]) -> Result<Vec<IpNet>> {
    raw.iter()
        .map(|s| s.as_ref().trim())
        .filter(|s| !s.is_empty())
        .map(|s| {
            s.parse::<IpNet>()
                .map_err(|e| DiscoverError::Config(format!("invalid subnet '{s}': {e}")))
        })
        .collect()
}

fn default_netscan_ports() -> Vec<u16> {
    vec![crate::wsdiscovery::DISCOVERY_PORT]
}

fn default_probe_timeout_ms() -> u64 {
    2000
}

fn default_probe_async_limit() -> usize {
    4000
}

fn default_max_discover_duration() -> u64 {
    300
}

fn default_discovery_interval() -> u64 {
    3600
}

fn default_check_status_interval() -> u64 {
    30
}

fn default_max_interval() -> u64 {
    300
}

fn default_max_discovery_interval() -> u64 {
    86_400
}

fn default_request_timeout() -> u64 {
    5
}

fn default_secret_ref() -> String {
    "credentials001".to_string()
}

fn default_credentials_retry() -> u64 {
    1
}

fn default_credentials_wait() -> u64 {
    10
}

fn default_onvif_port() -> u16 {
    80
}

impl Default for DiscoverConfig {
    fn default() -> Self {
        Self {
            discovery_subnets: Vec::new(),
            discovery_mode: DiscoveryMode::default(),
            netscan_ports: default_netscan_ports(),
            probe_timeout_ms: default_probe_timeout_ms(),
            probe_async_limit: default_probe_async_limit(),
            max_discover_duration_secs: default_max_discover_duration(),
            discovery_interval_secs: default_discovery_interval(),
            check_status_interval_secs: default_check_status_interval(),
            max_interval_secs: default_max_interval(),
            max_discovery_interval_secs: default_max_discovery_interval(),
            request_timeout_secs: default_request_timeout(),
            default_auth_mode: AuthMode::default(),
            default_secret_ref: default_secret_ref(),
            credentials_retry_secs: default_credentials_retry(),
            credentials_wait_secs: default_credentials_wait(),
            discovery_interface_addr: None,
            devices: Vec::new(),
            credentials: HashMap::new(),
        }
    }
}
