use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::net::SocketAddr;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    pub server: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub interval_secs: u64,
    pub protocol: ProtocolFamily,
    pub debug: bool,
    pub io_timeout_secs: u64,
    pub status_listen: Option<String>,
    pub probe: ProbeConfig,
    pub disk_io_interval_secs: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ProbeConfig {
    pub interval_secs: u64,
    pub timeout_ms: u64,
    pub history_len: usize,
    pub targets: Vec<ProbeTargetConfig>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct ProbeTargetConfig {
    pub name: String,
    pub host: String,
    #[serde(default = "default_probe_port")]
    pub port: u16,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum ProtocolFamily {
    #[default]
    Ip4,
    Ip6,
}

impl ProtocolFamily {
    pub fn matches(&self, addr: &SocketAddr) -> bool {
        match self {
            ProtocolFamily::Ip4 => addr.is_ipv4(),
            ProtocolFamily::Ip6 => addr.is_ipv6(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: "127.0.0.1".to_string(),
            port: 35601,
            username: "s01".to_string(),
            password: "USER_DEFAULT_PASSWORD".to_string(),
            interval_secs: 3,
            protocol: ProtocolFamily::Ip4,
            debug: false,
            io_timeout_secs: 3,
            status_listen: None,
            probe: ProbeConfig::default(),
            disk_io_interval_secs: 1,
        }
    }
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            interval_secs: 1,
            timeout_ms: 1000,
            history_len: 100,
            targets: ["cu", "ct", "cm"]
                .into_iter()
                .map(|name| ProbeTargetConfig {
                    name: name.to_string(),
                    host: format!("{name}.tz.vizan.cc"),
                    port: default_probe_port(),
                })
                .collect(),
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },
    #[error("failed to parse YAML in {path}: {source}")]
    Parse {
        path: String,
        source: serde_yaml::Error,
    },
    #[error("invalid configuration: {0}")]
    Validation(String),
}

impl Config {
    pub fn load_from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path_ref = path.as_ref();
        let path_display = path_ref.display().to_string();
        let text = fs::read_to_string(path_ref).map_err(|source| ConfigError::Read {
            path: path_display.clone(),
            source,
        })?;

        serde_yaml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path_display,
            source,
        })
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.server.trim().is_empty() {
            return Err(ConfigError::Validation("server is required".to_string()));
        }
        if self.port == 0 {
            return Err(ConfigError::Validation(
                "port must be in 1..65535".to_string(),
            ));
        }
        if self.username.trim().is_empty() {
            return Err(ConfigError::Validation("username is required".to_string()));
        }
        if self.interval_secs < 1 {
            return Err(ConfigError::Validation(
                "interval_secs must be >= 1".to_string(),
            ));
        }
        if self.io_timeout_secs < 1 {
            return Err(ConfigError::Validation(
                "io_timeout_secs must be >= 1".to_string(),
            ));
        }
        if self.disk_io_interval_secs < 1 {
            return Err(ConfigError::Validation(
                "disk_io_interval_secs must be >= 1".to_string(),
            ));
        }
        if let Some(listen) = &self.status_listen {
            if SocketAddr::from_str(listen).is_err() {
                return Err(ConfigError::Validation(
                    "status_listen must be a host:port socket address".to_string(),
                ));
            }
        }

        validate_probe(&self.probe)
    }

    pub fn server_address(&self) -> String {
        format!("{}:{}", self.server, self.port)
    }

    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn io_timeout(&self) -> Duration {
        Duration::from_secs(self.io_timeout_secs)
    }

    pub fn example_yaml() -> &'static str {
        include_str!("../config.yaml.example")
    }
}

impl ProbeConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

fn validate_probe(cfg: &ProbeConfig) -> Result<(), ConfigError> {
    if cfg.interval_secs < 1 {
        return Err(ConfigError::Validation(
            "probe.interval_secs must be >= 1".to_string(),
        ));
    }
    if cfg.timeout_ms == 0 {
        return Err(ConfigError::Validation(
            "probe.timeout_ms must be > 0".to_string(),
        ));
    }
    if cfg.history_len == 0 {
        return Err(ConfigError::Validation(
            "probe.history_len must be > 0".to_string(),
        ));
    }

    let mut names = HashSet::new();
    for target in &cfg.targets {
        if target.name.trim().is_empty() {
            return Err(ConfigError::Validation(
                "probe.targets[*].name must not be empty".to_string(),
            ));
        }
        if !names.insert(target.name.clone()) {
            return Err(ConfigError::Validation(format!(
                "probe target name '{}' must be unique",
                target.name
            )));
        }
        if target.host.trim().is_empty() {
            return Err(ConfigError::Validation(format!(
                "probe target '{}' host must not be empty",
                target.name
            )));
        }
        if target.port == 0 {
            return Err(ConfigError::Validation(format!(
                "probe target '{}' port must be in 1..65535",
                target.name
            )));
        }
    }
    Ok(())
}

const fn default_probe_port() -> u16 {
    80
}
