//! Room configuration using Figment.
//!
//! Configuration is loaded from:
//! 1. a TOML file (base configuration)
//! 2. environment variables prefixed with `AV_CONTROL_`, where `__`
//!    separates nesting levels
//!
//! # Example
//! ```no_run
//! use av_control::config::RoomConfig;
//!
//! // AV_CONTROL_HANDLERS__POLL_INTERVAL=2s overrides [handlers] poll_interval
//! let config = RoomConfig::load("config/room.toml")?;
//! config.validate()?;
//! println!("Room: {}", config.application.name);
//! # Ok::<(), av_control::error::AvError>(())
//! ```

use crate::connection::HandlerOptions;
use crate::console::ConsoleConfig;
use crate::device::planar_urx::UrxCommand;
use crate::device::sony_srg::SrgCommand;
use crate::device::Qualifier;
use crate::error::{AvError, AvResult};
use crate::logging::{parse_log_level, LogFormat};
use crate::transport::dispatch::VISCA_PORT;
use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::path::Path;

/// Prefix of environment overrides.
pub const ENV_PREFIX: &str = "AV_CONTROL_";

/// Top-level room configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RoomConfig {
    #[serde(default)]
    pub application: ApplicationConfig,
    /// Keep-alive, reconnect and idle-client tuning shared by all handlers
    #[serde(default)]
    pub handlers: HandlerOptions,
    #[serde(default)]
    pub console: ConsoleConfig,
    #[serde(default)]
    pub visca: ViscaConfig,
    #[serde(default)]
    pub devices: Vec<DeviceConfig>,
}

/// Application-level configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApplicationConfig {
    #[serde(default = "default_name")]
    pub name: String,
    /// Logging level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default)]
    pub log_format: LogFormat,
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            name: default_name(),
            log_level: default_log_level(),
            log_format: LogFormat::default(),
        }
    }
}

/// Shared VISCA-over-IP socket
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ViscaConfig {
    #[serde(default = "default_visca_port")]
    pub port: u16,
}

impl Default for ViscaConfig {
    fn default() -> Self {
        Self {
            port: default_visca_port(),
        }
    }
}

/// Device model
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DriverKind {
    /// Planar UltraRes X display
    PlanarUrx,
    /// Sony SRG-300 camera, VISCA over IP
    SonySrg300,
}

impl DriverKind {
    /// Keep-alive command used when a device names none.
    #[must_use]
    pub fn default_keep_alive(self) -> &'static str {
        match self {
            DriverKind::PlanarUrx | DriverKind::SonySrg300 => "Power",
        }
    }

    fn knows_command(self, command: &str) -> bool {
        match self {
            DriverKind::PlanarUrx => command.parse::<UrxCommand>().is_ok(),
            DriverKind::SonySrg300 => command.parse::<SrgCommand>().is_ok(),
        }
    }
}

impl fmt::Display for DriverKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            DriverKind::PlanarUrx => "planar_urx",
            DriverKind::SonySrg300 => "sony_srg300",
        })
    }
}

/// How a device is reached
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum TransportConfig {
    Tcp {
        host: String,
        port: u16,
    },
    Udp {
        host: String,
        port: u16,
        /// Local port, 0 for any
        #[serde(default)]
        local_port: u16,
    },
    /// Needs the `serial` feature
    Serial {
        path: String,
        #[serde(default = "default_baud_rate")]
        baud_rate: u32,
    },
    /// Endpoint on the shared VISCA socket
    Visca {
        host: String,
        #[serde(default = "default_visca_port")]
        port: u16,
    },
}

impl TransportConfig {
    fn check(&self) -> Result<(), String> {
        match self {
            TransportConfig::Tcp { host, port }
            | TransportConfig::Udp { host, port, .. }
            | TransportConfig::Visca { host, port } => {
                if host.trim().is_empty() {
                    return Err("host must not be empty".to_string());
                }
                if *port == 0 {
                    return Err("port must not be 0".to_string());
                }
            }
            TransportConfig::Serial { path, baud_rate } => {
                if path.trim().is_empty() {
                    return Err("serial path must not be empty".to_string());
                }
                if *baud_rate == 0 {
                    return Err("baud_rate must not be 0".to_string());
                }
            }
        }
        Ok(())
    }
}

/// Keep-alive query of one device
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KeepAliveConfig {
    pub command: String,
    #[serde(default)]
    pub qualifier: Qualifier,
}

/// One `[[devices]]` entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceConfig {
    /// Name used in logs and as the bus event name
    pub name: String,
    pub driver: DriverKind,
    pub transport: TransportConfig,
    #[serde(default)]
    pub keep_alive: Option<KeepAliveConfig>,
    /// Send only: status queries are discarded
    #[serde(default)]
    pub unidirectional: bool,
}

impl DeviceConfig {
    /// Configured keep-alive, or the driver default.
    #[must_use]
    pub fn keep_alive(&self) -> KeepAliveConfig {
        self.keep_alive.clone().unwrap_or_else(|| KeepAliveConfig {
            command: self.driver.default_keep_alive().to_string(),
            qualifier: Qualifier::new(),
        })
    }

    fn check(&self) -> Result<(), String> {
        self.transport.check()?;
        let command = self.keep_alive().command;
        if !self.driver.knows_command(&command) {
            return Err(format!(
                "keep-alive command '{command}' is not a {} command",
                self.driver
            ));
        }
        match (self.driver, &self.transport) {
            (DriverKind::PlanarUrx, TransportConfig::Visca { .. }) => {
                Err("planar_urx cannot use a visca transport".to_string())
            }
            (DriverKind::SonySrg300, TransportConfig::Tcp { .. } | TransportConfig::Serial { .. }) => {
                Err("sony_srg300 needs a visca or udp transport".to_string())
            }
            _ => Ok(()),
        }
    }
}

fn default_name() -> String {
    "AV Control".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_visca_port() -> u16 {
    VISCA_PORT
}

fn default_baud_rate() -> u32 {
    9600
}

impl RoomConfig {
    /// Load from `path` merged with `AV_CONTROL_` environment variables.
    ///
    /// A missing file is not an error; defaults and the environment apply.
    pub fn load<P: AsRef<Path>>(path: P) -> AvResult<Self> {
        Ok(Self::figment(path.as_ref()).extract()?)
    }

    /// The provider stack `load` extracts from.
    #[must_use]
    pub fn figment(path: &Path) -> Figment {
        Figment::new()
            .merge(Toml::file(path))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
    }

    /// Check the configuration, naming the first problem found.
    pub fn validate(&self) -> AvResult<()> {
        parse_log_level(&self.application.log_level).map_err(AvError::Configuration)?;
        self.handlers
            .validate()
            .map_err(|reason| AvError::Configuration(format!("[handlers] {reason}")))?;

        if self.console.enabled {
            if self.console.port == 0 {
                return Err(AvError::Configuration("[console] port must not be 0".to_string()));
            }
            if self.console.users.is_empty() {
                return Err(AvError::Configuration(
                    "[console] needs at least one user".to_string(),
                ));
            }
        }
        if self.visca.port == 0 {
            return Err(AvError::Configuration("[visca] port must not be 0".to_string()));
        }

        // Bus event names are case-insensitive, so device names are too.
        let mut names = HashSet::new();
        let mut visca_hosts = HashSet::new();
        for device in &self.devices {
            if device.name.trim().is_empty() {
                return Err(AvError::Configuration("device with an empty name".to_string()));
            }
            if !names.insert(device.name.to_lowercase()) {
                return Err(AvError::Configuration(format!(
                    "Duplicate device name: {}",
                    device.name
                )));
            }
            device
                .check()
                .map_err(|reason| AvError::Configuration(format!("device '{}': {reason}", device.name)))?;
            if let TransportConfig::Visca { host, .. } = &device.transport {
                if !visca_hosts.insert(host.as_str()) {
                    return Err(AvError::Configuration(format!(
                        "device '{}': another visca device already uses {host}",
                        device.name
                    )));
                }
            }
        }
        Ok(())
    }

    /// Whether the shared VISCA socket is needed.
    #[must_use]
    pub fn uses_visca(&self) -> bool {
        self.devices
            .iter()
            .any(|d| matches!(d.transport, TransportConfig::Visca { .. }))
    }
}
