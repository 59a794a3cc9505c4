//! Transport-free console logic.
//!
//! [`ConsoleCore`] consumes client events and returns the bytes to send and
//! the clients to drop as [`ConsoleAction`]s; the server loop applies them.

use super::commands::{builtin, format_uptime, Builtin, CustomCommand, BUILTINS};
use super::session::{Edit, Session, SessionState};
use super::{AccessLevel, ConsoleConfig, UserEntry};
use crate::error::{AvError, AvResult};
use crate::pubsub::PubSub;
use crate::transport::ClientId;
use bytes::Bytes;
use chrono::{DateTime, Local};
use serde_json::{json, Value};
use std::collections::{BTreeMap, HashMap};
use std::net::SocketAddr;
use std::time::Instant;
use tracing::{debug, info, warn};

/// Telnet `IAC DONT ECHO`, sent on connect.
pub const ECHO_OFF: &[u8] = b"\xFF\xFE\x01";

/// Failed logins before the client is dropped.
pub const MAX_LOGIN_ATTEMPTS: u32 = 3;

const PROMPT: &str = "\r\n> ";

/// Something the server loop must do.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsoleAction {
    Send(ClientId, Bytes),
    Disconnect(ClientId),
}

/// Connected client as shown by `who`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionInfo {
    pub client: ClientId,
    pub user: Option<String>,
    pub address: Option<SocketAddr>,
    pub access: Option<AccessLevel>,
}

/// Console sessions, users and commands.
#[derive(Debug)]
pub struct ConsoleCore {
    title: String,
    users: HashMap<String, UserEntry>,
    sessions: BTreeMap<ClientId, Session>,
    custom: Vec<CustomCommand>,
    bus: Option<PubSub>,
    started: Instant,
    actions: Vec<ConsoleAction>,
}

impl ConsoleCore {
    pub fn new(config: &ConsoleConfig, bus: Option<PubSub>) -> Self {
        if bus.is_none() {
            debug!("console without event bus, subscription commands disabled");
        }
        Self {
            title: config.title.clone(),
            users: config.users.clone(),
            sessions: BTreeMap::new(),
            custom: Vec::new(),
            bus,
            started: Instant::now(),
            actions: Vec::new(),
        }
    }

    /// Add a command. Names of built-ins and existing commands are refused.
    pub fn register_command(&mut self, command: CustomCommand) -> AvResult<()> {
        let taken = builtin(command.name(), self.bus.is_some()).is_some()
            || self.custom.iter().any(|c| c.name == command.name);
        if taken || command.name.is_empty() || command.name.contains(' ') {
            return Err(AvError::Console(format!(
                "command name '{}' is not available",
                command.name
            )));
        }
        self.custom.push(command);
        Ok(())
    }

    #[must_use]
    pub fn session(&self, client: ClientId) -> Option<&Session> {
        self.sessions.get(&client)
    }

    /// Every connected client.
    #[must_use]
    pub fn connections(&self) -> Vec<ConnectionInfo> {
        self.sessions
            .iter()
            .map(|(client, session)| ConnectionInfo {
                client: *client,
                user: session.user.clone(),
                address: session.address,
                access: session.access,
            })
            .collect()
    }

    /// Say goodbye to `client` and drop it.
    pub fn disconnect_client(&mut self, client: ClientId) -> Vec<ConsoleAction> {
        if let Some(session) = self.sessions.get_mut(&client) {
            session.closing = true;
            self.send(client, "\r\nYou have been disconnected. Goodbye.");
            self.actions.push(ConsoleAction::Disconnect(client));
        }
        self.take_actions()
    }

    pub fn disconnect_all(&mut self) -> Vec<ConsoleAction> {
        let clients: Vec<ClientId> = self.sessions.keys().copied().collect();
        clients
            .into_iter()
            .flat_map(|client| self.disconnect_client(client))
            .collect()
    }

    pub fn client_connected(&mut self, client: ClientId, address: Option<SocketAddr>) -> Vec<ConsoleAction> {
        self.sessions.insert(client, Session::new(address));
        info!(%client, ?address, "console client connected");
        self.publish_system(
            "client_connect",
            format!(
                "Incoming connection from {} on console port. {} connections.",
                display_address(address),
                self.sessions.len()
            ),
        );
        self.actions
            .push(ConsoleAction::Send(client, Bytes::from_static(ECHO_OFF)));
        let banner = format!(
            "{} (av-control v{})\r\nUsername: ",
            self.title,
            env!("CARGO_PKG_VERSION")
        );
        self.send(client, &banner);
        self.take_actions()
    }

    pub fn client_disconnected(&mut self, client: ClientId) {
        let Some(session) = self.sessions.remove(&client) else {
            return;
        };
        info!(%client, "console client disconnected");
        self.publish_system(
            "client_disconnect",
            format!(
                "{} disconnected from console. {} connections.",
                display_address(session.address),
                self.sessions.len()
            ),
        );
    }

    /// Feed bytes typed by `client`.
    pub fn receive(&mut self, client: ClientId, data: &[u8]) -> Vec<ConsoleAction> {
        for byte in data {
            let Some(session) = self.sessions.get_mut(&client) else {
                break;
            };
            if session.closing {
                break;
            }
            let echoes = session.echoes();
            match session.editor.feed(*byte) {
                Edit::None => {}
                Edit::Echo(bytes) if echoes => {
                    self.actions
                        .push(ConsoleAction::Send(client, Bytes::from_static(bytes)));
                }
                Edit::Echo(_) => {}
                Edit::Char(c) if echoes => {
                    self.actions
                        .push(ConsoleAction::Send(client, Bytes::copy_from_slice(&[c])));
                }
                Edit::Char(_) => {}
                Edit::Line(line) => self.line(client, line),
            }
        }
        self.take_actions()
    }

    /// Show a bus event to every session subscribed to it.
    pub fn bus_event(&mut self, name: &str, data: &Value, at: DateTime<Local>) -> Vec<ConsoleAction> {
        let text = format!(
            "\r\n[{}] [{}] {}\r\n> ",
            at.format("%Y-%m-%d %H:%M:%S"),
            name,
            display_value(data)
        );
        let targets: Vec<ClientId> = self
            .sessions
            .iter()
            .filter(|(_, s)| s.state == SessionState::LoggedIn && !s.closing && s.wants(name))
            .map(|(client, _)| *client)
            .collect();
        for client in targets {
            self.send(client, &text);
        }
        self.take_actions()
    }

    fn line(&mut self, client: ClientId, line: String) {
        let Some(session) = self.sessions.get_mut(&client) else {
            return;
        };
        match session.state.clone() {
            SessionState::Username => {
                if line.is_empty() {
                    self.send(client, "Username: ");
                } else {
                    session.state = SessionState::Password { user: line };
                    self.send(client, "\r\nPassword: ");
                }
            }
            SessionState::Password { user } => self.login(client, user, &line),
            SessionState::LoggedIn => {
                if line.is_empty() {
                    self.send(client, PROMPT);
                    return;
                }
                self.command(client, &line);
                if self.sessions.get(&client).is_some_and(|s| !s.closing) {
                    self.send(client, PROMPT);
                }
            }
        }
    }

    fn login(&mut self, client: ClientId, user: String, password: &str) {
        let access = self
            .users
            .get(&user)
            .filter(|entry| entry.password == password)
            .map(|entry| entry.access);
        let Some(session) = self.sessions.get_mut(&client) else {
            return;
        };
        let address = display_address(session.address);

        if let Some(access) = access {
            session.state = SessionState::LoggedIn;
            session.access = Some(access);
            session.user = Some(user.clone());
            info!(%client, %user, "console login");
            self.send(client, &format!("\r\n\r\nWelcome, {user}.{PROMPT}"));
            self.publish_system("valid_login", format!("{user} logged in from {address}."));
            return;
        }

        session.failed_logins += 1;
        if session.failed_logins < MAX_LOGIN_ATTEMPTS {
            session.state = SessionState::Username;
            warn!(%client, %user, "invalid console login");
            self.publish_system(
                "invalid_login",
                format!("Invalid login from {address} using username: {user}"),
            );
            self.send(client, "\r\nInvalid login.\r\n\r\nUsername: ");
        } else {
            session.closing = true;
            warn!(%client, %user, "too many console login attempts");
            self.publish_system(
                "bad_login_attempt",
                format!("Disconnecting console port for too many login attempts: {address}"),
            );
            self.send(client, "\r\nToo many login attempts.");
            self.actions.push(ConsoleAction::Disconnect(client));
        }
    }

    fn command(&mut self, client: ClientId, line: &str) {
        let access = self
            .sessions
            .get(&client)
            .and_then(|s| s.access)
            .unwrap_or(AccessLevel::User);
        let (name, rest) = match line.split_once(' ') {
            Some((name, rest)) => (name.to_lowercase(), rest),
            None => (line.to_lowercase(), ""),
        };
        let args: Vec<&str> = rest.split(' ').filter(|a| !a.is_empty()).collect();

        if let Some(entry) = builtin(&name, self.bus.is_some()).filter(|s| access >= s.access) {
            debug!(%client, command = entry.name, "console command");
            match entry.command {
                Builtin::Help => self.help(client, access, args.first().copied()),
                Builtin::Uptime => {
                    let minutes = self.started.elapsed().as_secs() / 60;
                    self.send(client, &format!("\r\n{}", format_uptime(minutes)));
                }
                Builtin::Who => self.who(client),
                Builtin::Kick => self.kick(client, args.first().copied()),
                Builtin::Exit => {
                    if let Some(session) = self.sessions.get_mut(&client) {
                        session.closing = true;
                    }
                    self.send(client, "\r\nGoodbye.");
                    self.actions.push(ConsoleAction::Disconnect(client));
                }
                Builtin::Subscribe => {
                    if let Some(session) = self.sessions.get_mut(&client) {
                        session.subscribe(args.iter().copied());
                    }
                    self.send_subscriptions(client);
                }
                Builtin::Unsubscribe => {
                    if let Some(session) = self.sessions.get_mut(&client) {
                        session.unsubscribe(args.iter().copied());
                    }
                    self.send_subscriptions(client);
                }
                Builtin::List => self.list(client),
                Builtin::Trigger => self.trigger(client, rest),
            }
            return;
        }

        let output = self
            .custom
            .iter()
            .find(|c| c.name == name && access >= c.access)
            .map(|c| (c.handler)(rest));
        match output {
            Some(text) => self.send(client, &format!("\r\n{text}")),
            None => self.send(client, "\r\nInvalid command. Please see \"help\"."),
        }
    }

    fn help(&mut self, client: ClientId, access: AccessLevel, topic: Option<&str>) {
        let with_bus = self.bus.is_some();
        if let Some(topic) = topic.map(str::to_lowercase) {
            let long = builtin(&topic, with_bus)
                .filter(|s| access >= s.access)
                .map(|s| s.long.to_string())
                .or_else(|| {
                    self.custom
                        .iter()
                        .find(|c| c.name == topic && access >= c.access)
                        .map(|c| c.long.clone())
                });
            match long {
                Some(long) => self.send(client, &format!("\r\n{long}\r\n")),
                None => self.send(client, "\r\nThat command doesn't exist. Try again.\r\n"),
            }
            return;
        }

        let mut text = String::from("\r\n\r\nAvailable commands:\r\n");
        for entry in BUILTINS
            .iter()
            .filter(|s| s.visible && access >= s.access && (with_bus || !s.needs_bus))
        {
            text.push_str(&format!(" {:16}{}\r\n", entry.name, entry.short));
        }
        let custom: Vec<&CustomCommand> = self.custom.iter().filter(|c| access >= c.access).collect();
        if !custom.is_empty() {
            text.push_str("\r\nCustom commands:\r\n");
            for command in custom {
                text.push_str(&format!(" {:16}{}\r\n", command.name, command.short));
            }
        }
        self.send(client, &text);
    }

    fn who(&mut self, client: ClientId) {
        let mut text = String::new();
        for info in self.connections() {
            text.push_str(&format!(
                "\r\nClient Id: {}, User: {}, IP: {}, Access level: {}",
                info.client.0,
                info.user.as_deref().unwrap_or("-"),
                display_address(info.address),
                info.access.map_or_else(|| "-".to_string(), |a| a.to_string()),
            ));
        }
        self.send(client, &text);
    }

    fn kick(&mut self, client: ClientId, target: Option<&str>) {
        let Some(target) = target.and_then(|t| t.parse::<u64>().ok()).map(ClientId) else {
            self.send(client, "\r\nPlease use the client ID shown in the WHO command.");
            return;
        };
        if target == client {
            self.send(client, "\r\nPlease don't kick yourself. People will stare.");
            return;
        }
        match self.sessions.get_mut(&target) {
            Some(session) => session.closing = true,
            None => {
                self.send(client, "\r\nNo client with that ID.");
                return;
            }
        }
        info!(%client, %target, "console client kicked");
        self.send(target, "\r\nYou have been kicked. Goodbye.");
        self.actions.push(ConsoleAction::Disconnect(target));
    }

    fn send_subscriptions(&mut self, client: ClientId) {
        let Some(session) = self.sessions.get(&client) else {
            return;
        };
        let mut text = String::from("\r\nActive subscriptions:\r\n");
        if session.subscriptions.is_empty() {
            text.push_str(" None.\r\n");
        }
        for name in &session.subscriptions {
            text.push_str(&format!(" {name}\r\n"));
        }
        self.send(client, &text);
    }

    fn list(&mut self, client: ClientId) {
        let names = self.bus.as_ref().map(PubSub::event_names).unwrap_or_default();
        let mut text = String::from("\r\nAvailable devices or events:\r\n");
        for name in names {
            text.push_str(&format!(" {name}\r\n"));
        }
        self.send(client, &text);
    }

    fn trigger(&mut self, client: ClientId, rest: &str) {
        let rest = rest.trim();
        if rest.is_empty() {
            self.send(
                client,
                "\r\nError: Trigger requires an event name. Please see \"help trigger\".\r\n",
            );
            return;
        }
        let (event, data) = match rest.split_once(' ') {
            Some((event, data)) => (event, Value::from(data)),
            None => (rest, Value::Null),
        };
        if let Some(bus) = &self.bus {
            info!(%client, event, "console trigger");
            bus.trigger(event, data);
        }
    }

    fn publish_system(&self, event: &str, msg: String) {
        if let Some(bus) = &self.bus {
            bus.trigger("System", json!({ "event": event, "msg": msg }));
        }
    }

    fn send(&mut self, client: ClientId, text: &str) {
        self.actions
            .push(ConsoleAction::Send(client, Bytes::copy_from_slice(text.as_bytes())));
    }

    fn take_actions(&mut self) -> Vec<ConsoleAction> {
        std::mem::take(&mut self.actions)
    }
}

fn display_address(address: Option<SocketAddr>) -> String {
    address.map_or_else(|| "unknown".to_string(), |a| a.ip().to_string())
}

fn display_value(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}
