//! Error types for the AV control runtime.
//!
//! `AvError` is the single error type used across the library. It follows the
//! failure classes the connection handlers distinguish:
//!
//! - **Setup errors** (`Config`, `Configuration`, `UnsupportedTransport`): raised
//!   while building handlers or loading configuration. Fatal to the setup call,
//!   never to the process.
//! - **Capability errors** (`CapabilityMissing`): an operation the wrapped
//!   transport cannot perform. Both the handler and the transport are named so
//!   it is obvious which layer lacks the operation.
//! - **Link errors** (`NotConnected`, `Io`): produced by transports. Handlers
//!   treat these as transient; they are logged and reflected in connection
//!   status instead of being returned to callers of `send`.
//! - **Device errors** (`UnknownCommand`, `InvalidCommand`): a driver refused
//!   to encode a command.

use crate::transport::Protocol;
use thiserror::Error;

/// Convenience alias for results using the library error type.
pub type AvResult<T> = std::result::Result<T, AvError>;

#[derive(Error, Debug)]
pub enum AvError {
    #[error("Configuration error: {0}")]
    Config(#[from] Box<figment::Error>),

    #[error("Configuration validation error: {0}")]
    Configuration(String),

    #[error("{handler} does not support {protocol} transports")]
    UnsupportedTransport {
        handler: &'static str,
        protocol: Protocol,
    },

    #[error("'{handler}' has no operation '{operation}' nor does the underlying '{transport}'")]
    CapabilityMissing {
        handler: &'static str,
        transport: String,
        operation: &'static str,
    },

    #[error("Transport not connected")]
    NotConnected,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Unknown command: {0}")]
    UnknownCommand(String),

    #[error("Invalid command for {command}: {reason}")]
    InvalidCommand { command: String, reason: String },

    #[error("Console error: {0}")]
    Console(String),
}

impl From<figment::Error> for AvError {
    fn from(value: figment::Error) -> Self {
        AvError::Config(Box::new(value))
    }
}

impl AvError {
    /// True for errors a handler absorbs and reports through connection status.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, AvError::NotConnected | AvError::Io(_))
    }

    pub(crate) fn invalid(command: impl ToString, reason: impl Into<String>) -> Self {
        AvError::InvalidCommand {
            command: command.to_string(),
            reason: reason.into(),
        }
    }
}
