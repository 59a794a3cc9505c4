//! Telnet-style debug console.
//!
//! Clients log in with a username and password from [`ConsoleConfig::users`],
//! then run built-in or registered commands. With an event bus attached,
//! sessions can subscribe to bus events and see them as they happen.
//!
//! [`ConsoleCore`] holds the session logic; [`Console::serve`] drives it from
//! a [`ServerHandler`].

mod commands;
mod engine;
mod session;

pub use commands::{format_uptime, Builtin, BuiltinInfo, CommandHandler, CustomCommand, BUILTINS};
pub use engine::{ConnectionInfo, ConsoleAction, ConsoleCore, ECHO_OFF, MAX_LOGIN_ATTEMPTS};
pub use session::{Edit, LineEditor, Session, SessionState};

use crate::connection::ServerHandler;
use crate::error::AvResult;
use crate::pubsub::PubSub;
use crate::transport::ServerTransport;
use chrono::Local;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Console permission level. Admins can use every user command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AccessLevel {
    User,
    Admin,
}

impl fmt::Display for AccessLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AccessLevel::User => f.write_str("user"),
            AccessLevel::Admin => f.write_str("admin"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserEntry {
    pub password: String,
    pub access: AccessLevel,
}

fn default_enabled() -> bool {
    true
}

fn default_port() -> u16 {
    9823
}

fn default_title() -> String {
    "AV Control Debug Console".to_string()
}

fn default_users() -> HashMap<String, UserEntry> {
    HashMap::from([
        (
            "admin".to_string(),
            UserEntry {
                password: "extron".to_string(),
                access: AccessLevel::Admin,
            },
        ),
        (
            "user".to_string(),
            UserEntry {
                password: "password".to_string(),
                access: AccessLevel::User,
            },
        ),
    ])
}

/// `[console]` section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsoleConfig {
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// TCP port to listen on
    #[serde(default = "default_port")]
    pub port: u16,
    /// First line of the login banner
    #[serde(default = "default_title")]
    pub title: String,
    /// Login table keyed by username
    #[serde(default = "default_users")]
    pub users: HashMap<String, UserEntry>,
}

impl Default for ConsoleConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            port: default_port(),
            title: default_title(),
            users: default_users(),
        }
    }
}

/// Applies console actions to the server.
fn apply<S: ServerTransport + 'static>(handler: &mut ServerHandler<S>, actions: Vec<ConsoleAction>) {
    for action in actions {
        match action {
            ConsoleAction::Send(client, bytes) => {
                if let Err(err) = handler.send(client, &bytes) {
                    debug!(%client, error = %err, "console send failed");
                }
            }
            ConsoleAction::Disconnect(client) => handler.disconnect(client),
        }
    }
}

/// Console bound to a server handler.
#[derive(Debug, Clone)]
pub struct Console {
    core: Arc<Mutex<ConsoleCore>>,
    bus: Option<PubSub>,
}

impl Console {
    pub fn new(config: &ConsoleConfig, bus: Option<PubSub>) -> Self {
        Self {
            core: Arc::new(Mutex::new(ConsoleCore::new(config, bus.clone()))),
            bus,
        }
    }

    /// Add a custom command. See [`ConsoleCore::register_command`].
    pub fn register_command(&self, command: CustomCommand) -> AvResult<()> {
        self.core.lock().register_command(command)
    }

    /// Every connected client.
    #[must_use]
    pub fn connections(&self) -> Vec<ConnectionInfo> {
        self.core.lock().connections()
    }

    /// Shared session state, for inspection.
    #[must_use]
    pub fn core(&self) -> Arc<Mutex<ConsoleCore>> {
        Arc::clone(&self.core)
    }

    /// Install the console on `handler`, start listening and serve forever.
    pub async fn serve<S: ServerTransport + 'static>(self, mut handler: ServerHandler<S>) {
        let (events_tx, mut events_rx) = mpsc::unbounded_channel();
        if let Some(bus) = &self.bus {
            bus.register_listener(move |name, data| {
                let _ = events_tx.send((name.to_string(), data.clone()));
            });
        }

        let core = Arc::clone(&self.core);
        handler.on_connected(move |h, client| {
            let address = h.client_address(client);
            let actions = core.lock().client_connected(client, address);
            apply(h, actions);
        });
        let core = Arc::clone(&self.core);
        handler.on_receive_data(move |h, (client, data)| {
            let actions = core.lock().receive(client, &data);
            apply(h, actions);
        });
        let core = Arc::clone(&self.core);
        handler.on_disconnected(move |_, client| core.lock().client_disconnected(client));
        handler.on_listen_failed(|_, reason| warn!(%reason, "console port unavailable"));

        handler.start_listen(None).await;
        loop {
            tokio::select! {
                () = handler.step() => {}
                Some((name, data)) = events_rx.recv() => {
                    let actions = self.core.lock().bus_event(&name, &data, Local::now());
                    apply(&mut handler, actions);
                }
            }
        }
    }
}
