//! Per-client console state: line editing and login progress.

use super::AccessLevel;
use std::net::SocketAddr;

const BACKSPACE: u8 = 0x08;
const DELETE: u8 = 0x7F;
const CR: u8 = b'\r';
const LF: u8 = b'\n';

/// Where a session is in the login sequence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionState {
    /// Waiting for a username.
    Username,
    /// Waiting for the password of `user`.
    Password { user: String },
    LoggedIn,
}

/// Result of feeding one byte to a [`LineEditor`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Edit {
    /// Nothing to show.
    None,
    /// Echo these bytes back.
    Echo(&'static [u8]),
    /// Echo the typed character.
    Char(u8),
    /// A complete line.
    Line(String),
}

/// Line buffer with backspace handling. CR ends a line, as does LF not
/// preceded by CR. Bytes outside printable ASCII are ignored.
#[derive(Debug, Default)]
pub struct LineEditor {
    buffer: String,
    last: Option<u8>,
}

impl LineEditor {
    pub fn feed(&mut self, byte: u8) -> Edit {
        let previous = self.last.replace(byte);
        match byte {
            BACKSPACE | DELETE => {
                if self.buffer.pop().is_some() {
                    Edit::Echo(b"\x08 \x08")
                } else {
                    Edit::None
                }
            }
            CR => Edit::Line(std::mem::take(&mut self.buffer)),
            LF if previous != Some(CR) => Edit::Line(std::mem::take(&mut self.buffer)),
            0x20..=0x7E => {
                self.buffer.push(char::from(byte));
                Edit::Char(byte)
            }
            _ => Edit::None,
        }
    }

    #[must_use]
    pub fn pending(&self) -> &str {
        &self.buffer
    }
}

/// One connected console client.
#[derive(Debug)]
pub struct Session {
    pub(crate) state: SessionState,
    pub(crate) editor: LineEditor,
    pub(crate) failed_logins: u32,
    pub(crate) user: Option<String>,
    pub(crate) access: Option<AccessLevel>,
    pub(crate) address: Option<SocketAddr>,
    pub(crate) subscriptions: Vec<String>,
    pub(crate) closing: bool,
}

impl Session {
    pub(crate) fn new(address: Option<SocketAddr>) -> Self {
        Self {
            state: SessionState::Username,
            editor: LineEditor::default(),
            failed_logins: 0,
            user: None,
            access: None,
            address,
            subscriptions: Vec::new(),
            closing: false,
        }
    }

    #[must_use]
    pub fn state(&self) -> &SessionState {
        &self.state
    }

    #[must_use]
    pub fn user(&self) -> Option<&str> {
        self.user.as_deref()
    }

    #[must_use]
    pub fn access(&self) -> Option<AccessLevel> {
        self.access
    }

    #[must_use]
    pub fn subscriptions(&self) -> &[String] {
        &self.subscriptions
    }

    /// Typed characters are echoed except while entering a password.
    pub(crate) fn echoes(&self) -> bool {
        !matches!(self.state, SessionState::Password { .. })
    }

    /// Whether a bus event named `event` should be shown.
    pub(crate) fn wants(&self, event: &str) -> bool {
        let event = event.to_lowercase();
        self.subscriptions
            .iter()
            .any(|sub| sub == "all" || event.contains(sub.as_str()))
    }

    /// Add subscriptions. `all` replaces everything and absorbs later ones.
    pub(crate) fn subscribe<'a>(&mut self, names: impl IntoIterator<Item = &'a str>) {
        if self.subscriptions.iter().any(|s| s == "all") {
            return;
        }
        let names: Vec<String> = names.into_iter().map(str::to_lowercase).collect();
        if names.iter().any(|n| n == "all") {
            self.subscriptions = vec!["all".to_string()];
            return;
        }
        for name in names {
            if !self.subscriptions.contains(&name) {
                self.subscriptions.push(name);
            }
        }
    }

    pub(crate) fn unsubscribe<'a>(&mut self, names: impl IntoIterator<Item = &'a str>) {
        for name in names {
            let name = name.to_lowercase();
            if name == "all" {
                self.subscriptions.clear();
            } else {
                self.subscriptions.retain(|s| *s != name);
            }
        }
    }
}
