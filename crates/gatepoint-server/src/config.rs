//! Gateway configuration: TOML file + CLI overrides.

use gatepoint_core::{GatewayError, GatewayResult};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use tracing::info;

/// Top-level config file structure.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub framed: FramedSection,
    #[serde(default)]
    pub registration: RegistrationSection,
    #[serde(default)]
    pub relay: RelaySection,
    #[serde(default)]
    pub links: Vec<LinkSection>,
}

/// `[framed]` section of the config TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct FramedSection {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_framed_bind")]
    pub bind: String,
    #[serde(default = "default_idle_timeout_ms")]
    pub idle_timeout_ms: u64,
    #[serde(default = "default_check_interval_ms")]
    pub check_interval_ms: u64,
    #[serde(default = "default_true")]
    pub use_client_names: bool,
    #[serde(default)]
    pub client_names: Vec<String>,
}

impl Default for FramedSection {
    fn default() -> Self {
        Self {
            enabled: true,
            bind: default_framed_bind(),
            idle_timeout_ms: default_idle_timeout_ms(),
            check_interval_ms: default_check_interval_ms(),
            use_client_names: true,
            client_names: Vec::new(),
        }
    }
}

/// `[registration]` section of the config TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct RegistrationSection {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_registration_bind")]
    pub bind: String,
    #[serde(default)]
    pub use_client_names: bool,
    #[serde(default)]
    pub client_names: Vec<String>,
}

impl Default for RegistrationSection {
    fn default() -> Self {
        Self {
            enabled: false,
            bind: default_registration_bind(),
            use_client_names: false,
            client_names: Vec::new(),
        }
    }
}

/// `[relay]` section of the config TOML. `ports` maps port numbers
/// (as TOML keys) to client names.
#[derive(Debug, Clone, Deserialize)]
pub struct RelaySection {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_relay_host")]
    pub host: String,
    #[serde(default)]
    pub ports: BTreeMap<String, String>,
}

impl Default for RelaySection {
    fn default() -> Self {
        Self {
            enabled: false,
            host: default_relay_host(),
            ports: BTreeMap::new(),
        }
    }
}

/// One `[[links]]` entry: traffic received by `from` goes to `to`.
#[derive(Debug, Clone, Deserialize)]
pub struct LinkSection {
    pub from: String,
    pub to: String,
}

fn default_framed_bind() -> String {
    "0.0.0.0:5000".to_string()
}
fn default_registration_bind() -> String {
    "0.0.0.0:5100".to_string()
}
fn default_relay_host() -> String {
    "0.0.0.0".to_string()
}
fn default_idle_timeout_ms() -> u64 {
    180_000
}
fn default_check_interval_ms() -> u64 {
    1_000
}
fn default_true() -> bool {
    true
}

/// The points a config can enable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum PointKind {
    Framed,
    Registration,
    Relay,
}

impl PointKind {
    pub fn as_str(self) -> &'static str {
        match self {
            PointKind::Framed => "framed",
            PointKind::Registration => "registration",
            PointKind::Relay => "relay",
        }
    }
}

impl fmt::Display for PointKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PointKind {
    type Err = GatewayError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "framed" => Ok(PointKind::Framed),
            "registration" => Ok(PointKind::Registration),
            "relay" => Ok(PointKind::Relay),
            other => Err(GatewayError::Config(format!("unknown point in link: {other}"))),
        }
    }
}

/// Resolved framed-point settings.
#[derive(Debug, Clone)]
pub struct FramedConfig {
    pub bind: String,
    pub idle_timeout: Duration,
    pub check_interval: Duration,
    pub use_client_names: bool,
    pub client_names: Vec<String>,
}

/// Resolved name-registration settings.
#[derive(Debug, Clone)]
pub struct RegistrationConfig {
    pub bind: String,
    pub use_client_names: bool,
    pub client_names: Vec<String>,
}

/// Resolved port-relay settings.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub host: IpAddr,
    pub ports: BTreeMap<u16, String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Link {
    pub from: PointKind,
    pub to: PointKind,
}

/// Resolved gateway configuration (validated, CLI overrides applied).
/// Disabled points are `None`.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub framed: Option<FramedConfig>,
    pub registration: Option<RegistrationConfig>,
    pub relay: Option<RelayConfig>,
    pub links: Vec<Link>,
}

impl ServerConfig {
    /// Load config from TOML file, then apply CLI overrides.
    pub fn load(
        config_path: Option<&Path>,
        cli_framed_port: Option<u16>,
        cli_registration_port: Option<u16>,
    ) -> GatewayResult<Self> {
        let mut file_config = match config_path {
            Some(path) => {
                let expanded = expand_tilde(path);
                if expanded.exists() {
                    info!(path = %expanded.display(), "loading config file");
                    let content = std::fs::read_to_string(&expanded)?;
                    parse_config_file(&content)?
                } else {
                    info!(path = %expanded.display(), "config file not found, using defaults");
                    ConfigFile::default()
                }
            }
            None => ConfigFile::default(),
        };

        // Merge CLI overrides
        if let Some(port) = cli_framed_port {
            file_config.framed.bind = with_port(&file_config.framed.bind, port)?;
        }
        if let Some(port) = cli_registration_port {
            file_config.registration.bind = with_port(&file_config.registration.bind, port)?;
        }

        Self::from_file(file_config)
    }

    /// Validate a parsed config file.
    pub fn from_file(file: ConfigFile) -> GatewayResult<Self> {
        if file.framed.enabled {
            for (key, value) in [
                ("idle_timeout_ms", file.framed.idle_timeout_ms),
                ("check_interval_ms", file.framed.check_interval_ms),
            ] {
                if value == 0 {
                    return Err(GatewayError::Config(format!(
                        "framed.{key} must be greater than 0"
                    )));
                }
            }
        }

        let framed = file.framed.enabled.then(|| FramedConfig {
            bind: file.framed.bind,
            idle_timeout: Duration::from_millis(file.framed.idle_timeout_ms),
            check_interval: Duration::from_millis(file.framed.check_interval_ms),
            use_client_names: file.framed.use_client_names,
            client_names: file.framed.client_names,
        });

        let registration = file.registration.enabled.then(|| RegistrationConfig {
            bind: file.registration.bind,
            use_client_names: file.registration.use_client_names,
            client_names: file.registration.client_names,
        });

        let relay = if file.relay.enabled {
            Some(resolve_relay(file.relay)?)
        } else {
            None
        };

        let mut config = Self {
            framed,
            registration,
            relay,
            links: Vec::new(),
        };

        for link in file.links {
            let resolved = Link {
                from: link.from.parse()?,
                to: link.to.parse()?,
            };
            if resolved.from == resolved.to {
                return Err(GatewayError::Config(format!(
                    "point cannot link to itself: {}",
                    resolved.from
                )));
            }
            for kind in [resolved.from, resolved.to] {
                if !config.is_enabled(kind) {
                    return Err(GatewayError::Config(format!(
                        "link {} -> {} names disabled point {kind}",
                        resolved.from, resolved.to
                    )));
                }
            }
            config.links.push(resolved);
        }

        Ok(config)
    }

    pub fn is_enabled(&self, kind: PointKind) -> bool {
        match kind {
            PointKind::Framed => self.framed.is_some(),
            PointKind::Registration => self.registration.is_some(),
            PointKind::Relay => self.relay.is_some(),
        }
    }
}

/// Parse TOML text into a [`ConfigFile`].
pub fn parse_config_file(content: &str) -> GatewayResult<ConfigFile> {
    toml::from_str::<ConfigFile>(content)
        .map_err(|e| GatewayError::Config(format!("config parse error: {e}")))
}

fn resolve_relay(section: RelaySection) -> GatewayResult<RelayConfig> {
    let host: IpAddr = section
        .host
        .parse()
        .map_err(|_| GatewayError::InvalidAddress(section.host.clone()))?;

    let mut ports = BTreeMap::new();
    for (port, client) in section.ports {
        let port: u16 = port
            .parse()
            .map_err(|_| GatewayError::Config(format!("invalid relay port: {port}")))?;
        ports.insert(port, client);
    }

    Ok(RelayConfig { host, ports })
}

/// Replace the port of a `host:port` bind address.
fn with_port(bind: &str, port: u16) -> GatewayResult<String> {
    let mut addr: SocketAddr = bind
        .parse()
        .map_err(|_| GatewayError::InvalidAddress(bind.to_string()))?;
    addr.set_port(port);
    Ok(addr.to_string())
}

/// Expand `~` to the user's home directory.
fn expand_tilde(path: &Path) -> PathBuf {
    let s = path.to_string_lossy();
    if let Some(rest) = s.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    path.to_path_buf()
}
