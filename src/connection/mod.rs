//! Connection handlers: keep-alive polling, reconnection and idle-client
//! eviction layered over a transport.
//!
//! # Handler variants
//!
//! | Transport                     | Raw callback            | Device module           |
//! |-------------------------------|-------------------------|-------------------------|
//! | Serial, UDP, SP interface     | [`ConnectionHandler`] pipe   | [`ModuleHandler`] pipe   |
//! | TCP, SSH, Dante               | [`ConnectionHandler`] stream | [`ModuleHandler`] stream |
//! | HTTP                          | rejected                | [`ModuleHandler`] pipe   |
//! | TCP server                    | [`ServerHandler`]       |                         |
//!
//! The variant is chosen by [`link_mode`] from the transport protocol and the
//! backing; constructors call it and return
//! [`AvError::UnsupportedTransport`] for combinations without a handler.
//!
//! # Status state machine
//!
//! ```text
//! Unknown ──accepted response / link up──> Connected
//!    │                                        │
//!    │                       missed limit / link down
//!    │                                        ▼
//!    └──────────missed limit / link down──> Disconnected
//!                                             │
//!                        accepted response / reconnect ──> Connected
//! ```
//!
//! Same-value transitions are suppressed, so status callbacks fire only on
//! change.

use crate::error::{AvError, AvResult};
use crate::transport::Protocol;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

pub mod events;
mod handler;
pub mod keepalive;
mod module;
pub mod reconnect;
mod server;
pub mod timer;

pub use events::{Callback, ClientEvents, ServerEvents};
pub use handler::ConnectionHandler;
pub use keepalive::SendCounter;
pub use module::{ConnectHistory, ModuleHandler, StatusSubscription};
pub use reconnect::ReconnectSupervisor;
pub use server::{ClientTable, ServerHandler};
pub use timer::{Timer, TimerState};

/// Tri-state link health.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum ConnectionStatus {
    /// Nothing observed yet.
    #[default]
    Unknown,
    Connected,
    Disconnected,
}

impl ConnectionStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            ConnectionStatus::Unknown => "Unknown",
            ConnectionStatus::Connected => "Connected",
            ConnectionStatus::Disconnected => "Disconnected",
        }
    }
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ConnectionStatus {
    type Err = AvError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Unknown" => Ok(ConnectionStatus::Unknown),
            "Connected" => Ok(ConnectionStatus::Connected),
            "Disconnected" => Ok(ConnectionStatus::Disconnected),
            other => Err(AvError::invalid("ConnectionStatus", format!("'{other}'"))),
        }
    }
}

/// What `send` does once the missed-response limit is exceeded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum DeadLinkPolicy {
    /// Still hand the data to the transport.
    #[default]
    Forward,
    /// Discard the data.
    Drop,
}

fn default_disconnect_limit() -> u32 {
    15
}

fn default_poll_interval() -> Duration {
    Duration::from_secs(1)
}

fn default_connect_retry() -> Duration {
    Duration::from_secs(5)
}

fn default_client_idle_timeout() -> Duration {
    Duration::from_secs(5 * 60)
}

fn default_auto_reconnect() -> bool {
    true
}

/// Tuning shared by every handler variant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HandlerOptions {
    /// Consecutive unanswered sends tolerated before the link is judged dead.
    #[serde(default = "default_disconnect_limit")]
    pub disconnect_limit: u32,

    /// Keep-alive query period.
    #[serde(default = "default_poll_interval", with = "humantime_serde")]
    pub poll_interval: Duration,

    /// Wait between reconnect attempts.
    #[serde(default = "default_connect_retry", with = "humantime_serde")]
    pub connect_retry: Duration,

    /// Per-attempt connect timeout. `None` uses the transport default.
    #[serde(default, with = "humantime_serde")]
    pub connect_timeout: Option<Duration>,

    #[serde(default)]
    pub dead_link_policy: DeadLinkPolicy,

    #[serde(default = "default_auto_reconnect")]
    pub auto_reconnect: bool,

    /// Server handlers drop clients silent for longer than this.
    #[serde(default = "default_client_idle_timeout", with = "humantime_serde")]
    pub client_idle_timeout: Duration,

    /// Wait before retrying a failed listen. `None` uses `connect_retry`.
    #[serde(default, with = "humantime_serde")]
    pub listen_retry: Option<Duration>,
}

impl Default for HandlerOptions {
    fn default() -> Self {
        Self {
            disconnect_limit: default_disconnect_limit(),
            poll_interval: default_poll_interval(),
            connect_retry: default_connect_retry(),
            connect_timeout: None,
            dead_link_policy: DeadLinkPolicy::default(),
            auto_reconnect: default_auto_reconnect(),
            client_idle_timeout: default_client_idle_timeout(),
            listen_retry: None,
        }
    }
}

impl HandlerOptions {
    /// Builder: set the missed-response limit.
    #[must_use]
    pub fn with_disconnect_limit(mut self, limit: u32) -> Self {
        self.disconnect_limit = limit;
        self
    }

    /// Builder: set the keep-alive period.
    #[must_use]
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Builder: set the reconnect retry period.
    #[must_use]
    pub fn with_connect_retry(mut self, retry: Duration) -> Self {
        self.connect_retry = retry;
        self
    }

    /// Builder: set the idle-client timeout.
    #[must_use]
    pub fn with_client_idle_timeout(mut self, timeout: Duration) -> Self {
        self.client_idle_timeout = timeout;
        self
    }

    /// Builder: set the dead-link send policy.
    #[must_use]
    pub fn with_dead_link_policy(mut self, policy: DeadLinkPolicy) -> Self {
        self.dead_link_policy = policy;
        self
    }

    /// Builder: enable or disable automatic reconnection.
    #[must_use]
    pub fn with_auto_reconnect(mut self, enabled: bool) -> Self {
        self.auto_reconnect = enabled;
        self
    }

    /// Effective listen retry period.
    #[must_use]
    pub fn listen_retry(&self) -> Duration {
        self.listen_retry.unwrap_or(self.connect_retry)
    }

    /// Reject values no handler can work with.
    pub fn validate(&self) -> Result<(), String> {
        if self.disconnect_limit == 0 {
            return Err("disconnect_limit must be at least 1".to_string());
        }
        if self.poll_interval.is_zero() {
            return Err("poll_interval must be greater than zero".to_string());
        }
        if self.connect_retry.is_zero() {
            return Err("connect_retry must be greater than zero".to_string());
        }
        if self.client_idle_timeout.is_zero() {
            return Err("client_idle_timeout must be greater than zero".to_string());
        }
        Ok(())
    }
}

/// Who answers the keep-alive query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backing {
    /// A user callback sends raw bytes and calls `response_accepted`.
    Raw,
    /// A device module issues an update and writes statuses itself.
    Module,
}

/// Link semantics a client handler applies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkMode {
    /// No session: a dead link is only marked, never severed.
    Pipe,
    /// Session link: a dead link is severed and re-established.
    Stream,
}

/// Select the client handler mode for a transport.
pub fn link_mode(protocol: Protocol, backing: Backing) -> AvResult<LinkMode> {
    match (protocol, backing) {
        (Protocol::Tcp | Protocol::Ssh | Protocol::Dante, _) => Ok(LinkMode::Stream),
        (Protocol::Serial | Protocol::Udp | Protocol::SpInterface, _) => Ok(LinkMode::Pipe),
        (Protocol::Http, Backing::Module) => Ok(LinkMode::Pipe),
        (Protocol::Http, Backing::Raw) => Err(AvError::UnsupportedTransport {
            handler: "ConnectionHandler",
            protocol,
        }),
    }
}

/// Check that a server transport can be supervised.
pub fn server_mode(protocol: Protocol) -> AvResult<()> {
    match protocol {
        Protocol::Tcp => Ok(()),
        other => Err(AvError::UnsupportedTransport {
            handler: "ServerHandler",
            protocol: other,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn raw_handlers_by_protocol() {
        assert_eq!(link_mode(Protocol::Tcp, Backing::Raw).unwrap(), LinkMode::Stream);
        assert_eq!(link_mode(Protocol::Ssh, Backing::Raw).unwrap(), LinkMode::Stream);
        assert_eq!(link_mode(Protocol::Dante, Backing::Raw).unwrap(), LinkMode::Stream);
        assert_eq!(link_mode(Protocol::Udp, Backing::Raw).unwrap(), LinkMode::Pipe);
        assert_eq!(link_mode(Protocol::Serial, Backing::Raw).unwrap(), LinkMode::Pipe);
        assert_eq!(
            link_mode(Protocol::SpInterface, Backing::Raw).unwrap(),
            LinkMode::Pipe
        );
        assert!(matches!(
            link_mode(Protocol::Http, Backing::Raw),
            Err(AvError::UnsupportedTransport { .. })
        ));
    }

    #[test]
    fn module_handlers_accept_http_as_pipe() {
        assert_eq!(link_mode(Protocol::Http, Backing::Module).unwrap(), LinkMode::Pipe);
        assert_eq!(link_mode(Protocol::Tcp, Backing::Module).unwrap(), LinkMode::Stream);
    }

    #[test]
    fn only_tcp_servers() {
        assert!(server_mode(Protocol::Tcp).is_ok());
        let err = server_mode(Protocol::Udp).unwrap_err();
        assert_eq!(err.to_string(), "ServerHandler does not support UDP transports");
    }

    #[test]
    fn status_text_round_trips() {
        for status in [
            ConnectionStatus::Unknown,
            ConnectionStatus::Connected,
            ConnectionStatus::Disconnected,
        ] {
            assert_eq!(status.to_string().parse::<ConnectionStatus>().unwrap(), status);
        }
        assert!("connected".parse::<ConnectionStatus>().is_err());
    }

    #[test]
    fn options_defaults() {
        let options = HandlerOptions::default();
        assert_eq!(options.disconnect_limit, 15);
        assert_eq!(options.poll_interval, Duration::from_secs(1));
        assert_eq!(options.connect_retry, Duration::from_secs(5));
        assert_eq!(options.client_idle_timeout, Duration::from_secs(300));
        assert_eq!(options.listen_retry(), Duration::from_secs(5));
        assert_eq!(options.dead_link_policy, DeadLinkPolicy::Forward);
        assert!(options.auto_reconnect);
        assert!(options.validate().is_ok());
        assert!(options.with_disconnect_limit(0).validate().is_err());
    }

    #[test]
    fn options_from_toml() {
        let options: HandlerOptions = toml::from_str(
            r#"
            disconnect_limit = 3
            poll_interval = "500ms"
            connect_timeout = "2s"
            dead_link_policy = "drop"
            "#,
        )
        .unwrap();
        assert_eq!(options.disconnect_limit, 3);
        assert_eq!(options.poll_interval, Duration::from_millis(500));
        assert_eq!(options.connect_timeout, Some(Duration::from_secs(2)));
        assert_eq!(options.dead_link_policy, DeadLinkPolicy::Drop);
        assert_eq!(options.connect_retry, Duration::from_secs(5));
    }
}
