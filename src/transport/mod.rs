//! Transport facade.
//!
//! Connection handlers never open sockets themselves. They drive a transport
//! through one of two traits:
//!
//! - [`ClientTransport`] for a single outbound link (TCP, UDP, serial, ...)
//! - [`ServerTransport`] for a listening endpoint with many clients
//!
//! Both report what happened on the wire through an async `next_event()`
//! that handlers poll from their own task. `next_event()` must be cancel
//! safe because handlers race it against their timers in `tokio::select!`.
//!
//! Sends are synchronous: a transport queues the bytes to its writer task and
//! returns immediately, so a send can be issued from inside an event callback.

use crate::error::AvResult;
use async_trait::async_trait;
use bytes::Bytes;
use std::fmt;
use std::net::SocketAddr;
use std::time::Duration;

pub mod dispatch;
mod inbox;
pub mod mock;
#[cfg(feature = "serial")]
pub mod serial;
pub mod server;
pub mod tcp;
pub mod udp;

pub use dispatch::{DispatchedUdp, UdpDispatcher};
pub use mock::{MockClient, MockPeer, MockServer, MockServerPeer};
#[cfg(feature = "serial")]
pub use serial::SerialClient;
pub use server::TcpServer;
pub use tcp::TcpClient;
pub use udp::UdpClient;

/// Connect timeout used when the caller does not supply one.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Wire protocol of a transport. Handler selection depends on it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Protocol {
    /// RS-232/422/485 port
    Serial,
    /// TCP stream
    Tcp,
    /// UDP datagrams
    Udp,
    /// SSH session
    Ssh,
    /// Dante control channel
    Dante,
    /// Processor expansion port
    SpInterface,
    /// HTTP request/response device
    Http,
}

impl Protocol {
    /// True for protocols with a session that can drop and be re-established.
    #[must_use]
    pub fn is_stream(self) -> bool {
        matches!(self, Protocol::Tcp | Protocol::Ssh | Protocol::Dante)
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Protocol::Serial => "Serial",
            Protocol::Tcp => "TCP",
            Protocol::Udp => "UDP",
            Protocol::Ssh => "SSH",
            Protocol::Dante => "Dante",
            Protocol::SpInterface => "SPInterface",
            Protocol::Http => "HTTP",
        };
        f.write_str(name)
    }
}

/// Result of a connect attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectOutcome {
    /// A new link was established.
    Connected,
    /// The link was already up; nothing changed.
    AlreadyConnected,
    /// The attempt failed; the string is the transport's reason.
    Failed(String),
}

impl ConnectOutcome {
    /// True unless the attempt failed.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        !matches!(self, ConnectOutcome::Failed(_))
    }
}

/// Result of a listen attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ListenOutcome {
    /// The server is accepting clients.
    Listening,
    /// Binding failed; the string is the reason.
    Failed(String),
}

/// Event reported by a client transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// Link established.
    Connected,
    /// Link lost or closed.
    Disconnected,
    /// Bytes received.
    Data(Bytes),
}

/// Identifier of a client connected to a server transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClientId(pub u64);

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Event reported by a server transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerEvent {
    /// A client connected.
    Connected(ClientId),
    /// A client went away or was disconnected.
    Disconnected(ClientId),
    /// Bytes received from a client.
    Data(ClientId, Bytes),
}

/// Completion condition for [`ClientTransport::send_and_wait`].
#[derive(Debug, Clone)]
pub enum Delimiter {
    /// Response is complete after this many bytes.
    Length(usize),
    /// Response ends with this byte sequence.
    Tag(Vec<u8>),
    /// Response ends where this expression first matches.
    Regex(regex::bytes::Regex),
}

impl Delimiter {
    /// End offset of the first complete response in `buffer`, if any.
    #[must_use]
    pub fn find_end(&self, buffer: &[u8]) -> Option<usize> {
        match self {
            Delimiter::Length(len) => (buffer.len() >= *len).then_some(*len),
            Delimiter::Tag(tag) if tag.is_empty() => None,
            Delimiter::Tag(tag) => buffer
                .windows(tag.len())
                .position(|window| window == tag.as_slice())
                .map(|pos| pos + tag.len()),
            Delimiter::Regex(regex) => regex.find(buffer).map(|m| m.end()),
        }
    }
}

/// A single outbound link.
#[async_trait]
pub trait ClientTransport: Send {
    /// Wire protocol of this transport.
    fn protocol(&self) -> Protocol;

    /// Human readable identity, used in logs and error messages.
    fn describe(&self) -> String;

    /// Try to establish the link. Pipe transports that are open from
    /// construction answer [`ConnectOutcome::AlreadyConnected`].
    async fn connect(&mut self, timeout: Option<Duration>) -> ConnectOutcome;

    /// Close the link. A [`TransportEvent::Disconnected`] follows if it was up.
    fn disconnect(&mut self);

    /// Queue bytes for transmission.
    fn send(&mut self, data: &[u8]) -> AvResult<()>;

    /// Whether [`send_and_wait`](Self::send_and_wait) is available.
    fn supports_send_and_wait(&self) -> bool {
        true
    }

    /// Send and collect the response. Returns empty bytes when `timeout`
    /// elapses without a response satisfying `delimiter`. Without a delimiter
    /// everything received before the timeout is returned.
    async fn send_and_wait(
        &mut self,
        data: &[u8],
        timeout: Duration,
        delimiter: Option<&Delimiter>,
    ) -> AvResult<Bytes>;

    /// Next link event. Stays pending while nothing happens.
    async fn next_event(&mut self) -> TransportEvent;
}

#[async_trait]
impl<T: ClientTransport + ?Sized> ClientTransport for Box<T> {
    fn protocol(&self) -> Protocol {
        (**self).protocol()
    }

    fn describe(&self) -> String {
        (**self).describe()
    }

    async fn connect(&mut self, timeout: Option<Duration>) -> ConnectOutcome {
        (**self).connect(timeout).await
    }

    fn disconnect(&mut self) {
        (**self).disconnect();
    }

    fn send(&mut self, data: &[u8]) -> AvResult<()> {
        (**self).send(data)
    }

    fn supports_send_and_wait(&self) -> bool {
        (**self).supports_send_and_wait()
    }

    async fn send_and_wait(
        &mut self,
        data: &[u8],
        timeout: Duration,
        delimiter: Option<&Delimiter>,
    ) -> AvResult<Bytes> {
        (**self).send_and_wait(data, timeout, delimiter).await
    }

    async fn next_event(&mut self) -> TransportEvent {
        (**self).next_event().await
    }
}

/// A listening endpoint serving many clients.
#[async_trait]
pub trait ServerTransport: Send {
    /// Wire protocol of this transport.
    fn protocol(&self) -> Protocol;

    /// Human readable identity, used in logs.
    fn describe(&self) -> String;

    /// Start accepting clients. `timeout` limits how long the server keeps
    /// accepting; `None` means until dropped.
    async fn start_listen(&mut self, timeout: Option<Duration>) -> ListenOutcome;

    /// Drop a client. A [`ServerEvent::Disconnected`] follows.
    fn disconnect(&mut self, client: ClientId);

    /// Currently connected clients.
    fn clients(&self) -> Vec<ClientId>;

    /// Remote address of a client.
    fn client_address(&self, client: ClientId) -> Option<SocketAddr>;

    /// Queue bytes for one client.
    fn send(&mut self, client: ClientId, data: &[u8]) -> AvResult<()>;

    /// Next server event. Stays pending while nothing happens.
    async fn next_event(&mut self) -> ServerEvent;
}
