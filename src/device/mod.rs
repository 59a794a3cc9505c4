//! Device modules: typed command sets over a transport.
//!
//! A [`Device`] pairs a protocol [`Driver`] with a transport. The driver only
//! encodes commands and decodes replies; the device keeps the status table,
//! the subscriptions and the device-level connection bookkeeping:
//!
//! - **Counted** drivers stream replies that are matched out of a receive
//!   buffer. Every update increments a counter; past the limit the device
//!   reports `Disconnected`. Any written status resets it.
//! - **Paced** drivers allow one request in flight. A missing reply after the
//!   response timeout counts as a miss; a valid reply releases the next
//!   queued request.
//!
//! Connection status is a pseudo-command (`CommandId::CONNECTION_STATUS`)
//! written through the same status table, so subscribers see it like any
//! other status.

use crate::connection::timer::Timer;
use crate::connection::ConnectionStatus;
use crate::error::{AvError, AvResult};
use crate::transport::{ClientTransport, TransportEvent};
use bytes::{Bytes, BytesMut};
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::time::Duration;
use tracing::{debug, info, warn};

pub mod command;
pub mod matcher;
pub mod planar_urx;
pub mod sony_srg;

pub use command::{CommandId, Qualifier, Value};
pub use matcher::MatchTable;
pub use planar_urx::PlanarUrx;
pub use sony_srg::SonySrg300;

use command::StatusKey;

/// Receive buffer cap for counted drivers.
pub const MAX_RECEIVE_BUFFER: usize = 2048;

/// Default missed-response limit of a device.
pub const DEFAULT_CONNECTION_LIMIT: u32 = 15;

/// How a driver relates requests to replies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pacing {
    /// Fire-and-forget; replies are scanned out of the stream.
    Counted,
    /// One request in flight, answered within `response_timeout`.
    Paced { response_timeout: Duration },
}

/// Whether a request changes or queries a status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestKind {
    Set,
    Update,
}

/// An encoded request of a paced driver.
#[derive(Debug, Clone)]
pub struct Request<C> {
    pub command: C,
    pub qualifier: Qualifier,
    pub kind: RequestKind,
    pub bytes: Bytes,
}

/// Something a driver decoded from the device.
#[derive(Debug, Clone, PartialEq)]
pub enum Reply<C> {
    /// A status value.
    Status {
        command: C,
        value: Value,
        qualifier: Qualifier,
    },
    /// The device reported an error. Still proves it is alive.
    Error(String),
    /// A reply that only proves the device is alive.
    Ack,
}

impl<C> Reply<C> {
    /// Unqualified status reply.
    pub fn status(command: C, value: impl Into<Value>) -> Self {
        Reply::Status {
            command,
            value: value.into(),
            qualifier: Qualifier::new(),
        }
    }
}

/// Wire protocol of one device model.
pub trait Driver: Send + 'static {
    type Command: CommandId;

    /// Model name for logs.
    fn model(&self) -> &str;

    fn pacing(&self) -> Pacing {
        Pacing::Counted
    }

    /// Encode a control command. Fails for values the device does not accept.
    fn encode_set(
        &mut self,
        command: Self::Command,
        value: &Value,
        qualifier: &Qualifier,
    ) -> AvResult<Bytes>;

    /// Encode a status query.
    fn encode_update(&mut self, command: Self::Command, qualifier: &Qualifier) -> AvResult<Bytes>;

    /// Counted drivers: pull replies out of the receive buffer.
    fn scan(&mut self, _buffer: &mut BytesMut) -> Vec<Reply<Self::Command>> {
        Vec::new()
    }

    /// Paced drivers: decide whether `reply` answers `request`. `None` keeps
    /// waiting.
    fn answer(
        &mut self,
        _request: &Request<Self::Command>,
        _reply: &[u8],
    ) -> Option<Vec<Reply<Self::Command>>> {
        None
    }

    /// Bytes to send when the device comes up.
    fn on_connected(&mut self) -> Option<Bytes> {
        None
    }

    fn on_disconnected(&mut self) {}
}

/// Status subscription callback: `(command, value, qualifier)`.
pub type StatusCallback<C> = Box<dyn FnMut(C, &Value, &Qualifier) + Send>;

struct Subscription<C> {
    path: Vec<String>,
    callback: StatusCallback<C>,
}

/// Event a device wants its owner to act on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceIo {
    /// Something happened on the transport.
    Transport(TransportEvent),
    /// The in-flight request of a paced driver went unanswered.
    ResponseTimeout,
}

#[derive(Debug)]
struct Pacer<C> {
    queue: VecDeque<Request<C>>,
    in_flight: Option<Request<C>>,
    timer: Timer,
}

/// A driver bound to a transport, with status table and subscriptions.
pub struct Device<D: Driver, T> {
    name: String,
    driver: D,
    transport: T,
    statuses: HashMap<StatusKey<D::Command>, Value>,
    subscriptions: HashMap<D::Command, Vec<Subscription<D::Command>>>,
    counter: u32,
    limit: u32,
    connected_flag: bool,
    initialization_check: bool,
    unidirectional: bool,
    receive_buffer: BytesMut,
    pacer: Pacer<D::Command>,
    connection_changes: VecDeque<ConnectionStatus>,
}

impl<D: Driver, T: ClientTransport> Device<D, T> {
    pub fn new(name: impl Into<String>, driver: D, transport: T) -> Self {
        let response_timeout = match driver.pacing() {
            Pacing::Paced { response_timeout } => response_timeout,
            Pacing::Counted => Duration::from_secs(1),
        };
        Self {
            name: name.into(),
            driver,
            transport,
            statuses: HashMap::new(),
            subscriptions: HashMap::new(),
            counter: 0,
            limit: DEFAULT_CONNECTION_LIMIT,
            connected_flag: true,
            initialization_check: true,
            unidirectional: false,
            receive_buffer: BytesMut::new(),
            pacer: Pacer {
                queue: VecDeque::new(),
                in_flight: None,
                timer: Timer::one_shot(response_timeout),
            },
            connection_changes: VecDeque::new(),
        }
    }

    /// Builder: discard updates and send sets without waiting.
    #[must_use]
    pub fn unidirectional(mut self) -> Self {
        self.unidirectional = true;
        self
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn driver(&self) -> &D {
        &self.driver
    }

    #[must_use]
    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    /// Missed replies since the last status.
    #[must_use]
    pub fn counter(&self) -> u32 {
        self.counter
    }

    #[must_use]
    pub fn disconnect_limit(&self) -> u32 {
        self.limit
    }

    pub fn set_disconnect_limit(&mut self, limit: u32) {
        self.limit = limit;
    }

    /// Push the counter past the limit, as after a failed connect.
    pub fn force_missed_limit(&mut self) {
        self.counter = self.limit.saturating_add(1);
    }

    /// True while the device considers itself connected.
    #[must_use]
    pub fn connected_flag(&self) -> bool {
        self.connected_flag
    }

    /// Consider the device connected again so the next disconnect is
    /// reported.
    pub fn rearm(&mut self) {
        self.connected_flag = true;
    }

    /// Send a control command.
    pub fn set(
        &mut self,
        command: D::Command,
        value: impl Into<Value>,
        qualifier: &Qualifier,
    ) -> AvResult<()> {
        let value = value.into();
        let encoded = self.driver.encode_set(command, &value, qualifier);
        let bytes = self.discard_on_error(encoded)?;
        debug!(device = %self.name, %command, %value, "set");

        match self.driver.pacing() {
            Pacing::Counted => self.write(&bytes),
            Pacing::Paced { .. } if self.unidirectional => self.write(&bytes),
            Pacing::Paced { .. } => {
                self.initialize();
                self.enqueue(Request {
                    command,
                    qualifier: qualifier.clone(),
                    kind: RequestKind::Set,
                    bytes,
                });
            }
        }
        Ok(())
    }

    /// Query a status. The reply arrives through the status table.
    pub fn update(&mut self, command: D::Command, qualifier: &Qualifier) -> AvResult<()> {
        if self.unidirectional {
            return self.discard_on_error(Err(AvError::invalid(command, "Inappropriate Command")));
        }
        let encoded = self.driver.encode_update(command, qualifier);
        let bytes = self.discard_on_error(encoded)?;
        self.initialize();

        match self.driver.pacing() {
            Pacing::Counted => {
                self.counter = self.counter.saturating_add(1);
                if self.counter > self.limit && self.connected_flag {
                    self.on_disconnected();
                }
                self.write(&bytes);
            }
            Pacing::Paced { .. } => self.enqueue(Request {
                command,
                qualifier: qualifier.clone(),
                kind: RequestKind::Update,
                bytes,
            }),
        }
        Ok(())
    }

    /// Stored status, if any was received.
    #[must_use]
    pub fn read_status(&self, command: D::Command, qualifier: &Qualifier) -> Option<&Value> {
        let key = StatusKey::full(command, qualifier)?;
        self.statuses.get(&key)
    }

    /// Call `callback` whenever the status of `command` changes.
    ///
    /// The qualifier may name a prefix of the command's parameters; when
    /// several subscriptions cover a status the one with the longest prefix
    /// wins. A later subscription for the same prefix replaces the earlier.
    pub fn subscribe_status<F>(&mut self, command: D::Command, qualifier: &Qualifier, callback: F)
    where
        F: FnMut(D::Command, &Value, &Qualifier) + Send + 'static,
    {
        let path = qualifier.path(command.parameters());
        let subscriptions = self.subscriptions.entry(command).or_default();
        subscriptions.retain(|s| s.path != path);
        subscriptions.push(Subscription {
            path,
            callback: Box::new(callback),
        });
    }

    /// Record a status received from the device.
    ///
    /// Resets the counter and, if the device was considered down, reports
    /// it connected first.
    pub fn write_status(&mut self, command: D::Command, value: impl Into<Value>, qualifier: &Qualifier) {
        self.counter = 0;
        if !self.connected_flag {
            self.on_connected();
        }
        self.store(command, value.into(), qualifier);
    }

    /// Feed received bytes.
    pub fn receive(&mut self, data: &[u8]) {
        match self.driver.pacing() {
            Pacing::Counted => {
                self.receive_buffer.extend_from_slice(data);
                let replies = self.driver.scan(&mut self.receive_buffer);
                if self.receive_buffer.len() > MAX_RECEIVE_BUFFER {
                    let excess = self.receive_buffer.len() - MAX_RECEIVE_BUFFER;
                    let _ = self.receive_buffer.split_to(excess);
                }
                self.apply(replies);
            }
            Pacing::Paced { .. } => {
                let Some(request) = self.pacer.in_flight.as_ref() else {
                    debug!(device = %self.name, len = data.len(), "unsolicited reply ignored");
                    return;
                };
                let Some(replies) = self.driver.answer(request, data) else {
                    return;
                };
                self.pacer.timer.stop();
                self.pacer.in_flight = None;
                self.counter = 0;
                self.apply(replies);
                self.process_send();
            }
        }
    }

    /// The in-flight request went unanswered.
    pub fn response_timed_out(&mut self) {
        if self.pacer.in_flight.take().is_none() {
            return;
        }
        if self.connected_flag {
            self.counter = self.counter.saturating_add(1);
            debug!(device = %self.name, counter = self.counter, "no reply");
            if self.counter > self.limit {
                self.counter = 0;
                self.on_disconnected();
            }
        } else {
            self.pacer.queue.clear();
        }
        self.process_send();
    }

    /// Report the device up.
    pub fn on_connected(&mut self) {
        self.connected_flag = true;
        self.store(
            D::Command::CONNECTION_STATUS,
            ConnectionStatus::Connected.as_str().into(),
            &Qualifier::new(),
        );
        self.counter = 0;
        self.pacer.in_flight = None;
        self.pacer.timer.stop();
        if let Some(bytes) = self.driver.on_connected() {
            self.write(&bytes);
        }
        self.process_send();
    }

    /// Report the device down.
    pub fn on_disconnected(&mut self) {
        self.store(
            D::Command::CONNECTION_STATUS,
            ConnectionStatus::Disconnected.as_str().into(),
            &Qualifier::new(),
        );
        self.connected_flag = false;
        self.driver.on_disconnected();
    }

    /// Close the transport and report the device down.
    pub fn disconnect(&mut self) {
        self.transport.disconnect();
        self.on_disconnected();
    }

    /// Oldest connection status change not yet collected.
    pub fn pop_connection_change(&mut self) -> Option<ConnectionStatus> {
        self.connection_changes.pop_front()
    }

    /// Wait for the next transport event or response timeout.
    pub async fn next_io(&mut self) -> DeviceIo {
        tokio::select! {
            event = self.transport.next_event() => DeviceIo::Transport(event),
            _ = self.pacer.timer.tick() => DeviceIo::ResponseTimeout,
        }
    }

    /// Process one [`DeviceIo`] that needs no outside decision: data and
    /// response timeouts. Link events are returned for the owner.
    pub fn handle_io(&mut self, io: DeviceIo) -> Option<TransportEvent> {
        match io {
            DeviceIo::Transport(TransportEvent::Data(bytes)) => {
                self.receive(&bytes);
                Some(TransportEvent::Data(bytes))
            }
            DeviceIo::Transport(event) => Some(event),
            DeviceIo::ResponseTimeout => {
                self.response_timed_out();
                None
            }
        }
    }

    fn initialize(&mut self) {
        if self.initialization_check {
            self.initialization_check = false;
            self.on_connected();
        }
    }

    fn enqueue(&mut self, request: Request<D::Command>) {
        self.pacer.queue.push_back(request);
        self.process_send();
    }

    fn process_send(&mut self) {
        if self.pacer.in_flight.is_some() {
            return;
        }
        let Some(request) = self.pacer.queue.pop_front() else {
            return;
        };
        self.pacer.timer.restart();
        self.write(&request.bytes);
        self.pacer.in_flight = Some(request);
    }

    fn apply(&mut self, replies: Vec<Reply<D::Command>>) {
        for reply in replies {
            match reply {
                Reply::Status {
                    command,
                    value,
                    qualifier,
                } => self.write_status(command, value, &qualifier),
                Reply::Error(message) => {
                    self.counter = 0;
                    warn!(device = %self.name, model = self.driver.model(), "{message}");
                }
                Reply::Ack => self.counter = 0,
            }
        }
    }

    fn store(&mut self, command: D::Command, value: Value, qualifier: &Qualifier) {
        let Some(key) = StatusKey::full(command, qualifier) else {
            debug!(device = %self.name, %command, %qualifier, "status without full qualifier ignored");
            return;
        };
        if self.statuses.get(&key) == Some(&value) {
            return;
        }

        if command == D::Command::CONNECTION_STATUS {
            if let Some(status) = value.as_text().and_then(|text| text.parse::<ConnectionStatus>().ok()) {
                info!(device = %self.name, %status, "device connection status");
                self.connection_changes.push_back(status);
            }
        }
        self.notify(command, &key.path, &value, qualifier);
        self.statuses.insert(key, value);
    }

    fn notify(&mut self, command: D::Command, path: &[String], value: &Value, qualifier: &Qualifier) {
        let Some(subscriptions) = self.subscriptions.get_mut(&command) else {
            return;
        };
        let best = subscriptions
            .iter_mut()
            .filter(|s| path.starts_with(&s.path))
            .max_by_key(|s| s.path.len());
        if let Some(subscription) = best {
            (subscription.callback)(command, value, qualifier);
        }
    }

    fn write(&mut self, bytes: &[u8]) {
        if let Err(err) = self.transport.send(bytes) {
            debug!(device = %self.name, %err, "device send failed");
        }
    }

    fn discard_on_error<V>(&self, result: AvResult<V>) -> AvResult<V> {
        if let Err(err) = &result {
            warn!(device = %self.name, model = self.driver.model(), %err, "command discarded");
        }
        result
    }
}

impl<D: Driver, T> fmt::Debug for Device<D, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Device")
            .field("name", &self.name)
            .field("model", &self.driver.model())
            .field("counter", &self.counter)
            .field("limit", &self.limit)
            .field("connected_flag", &self.connected_flag)
            .field("statuses", &self.statuses.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{MockClient, MockPeer, Protocol};
    use std::sync::{Arc, Mutex};

    command::command_set! {
        enum Probe {
            ConnectionStatus => "ConnectionStatus",
            Level => "Level" ["Channel", "Band"],
        }
    }

    struct ProbeDriver {
        pacing: Pacing,
    }

    impl Driver for ProbeDriver {
        type Command = Probe;

        fn model(&self) -> &str {
            "Probe"
        }

        fn pacing(&self) -> Pacing {
            self.pacing
        }

        fn encode_set(&mut self, _: Probe, value: &Value, _: &Qualifier) -> AvResult<Bytes> {
            match value.as_int() {
                Some(n) if (0..=10).contains(&n) => Ok(Bytes::from(format!("SET {n}\r"))),
                _ => Err(AvError::invalid("Level", "out of range")),
            }
        }

        fn encode_update(&mut self, _: Probe, _: &Qualifier) -> AvResult<Bytes> {
            Ok(Bytes::from_static(b"GET\r"))
        }

        fn scan(&mut self, buffer: &mut BytesMut) -> Vec<Reply<Probe>> {
            let Some(end) = buffer.iter().position(|b| *b == b'\r') else {
                return Vec::new();
            };
            let line = buffer.split_to(end + 1);
            vec![Reply::Status {
                command: Probe::Level,
                value: Value::Text(String::from_utf8_lossy(&line[..end]).into_owned()),
                qualifier: Qualifier::new().with("Channel", 1).with("Band", 2),
            }]
        }

        fn answer(&mut self, request: &Request<Probe>, reply: &[u8]) -> Option<Vec<Reply<Probe>>> {
            (reply == b"OK").then(|| {
                vec![Reply::Status {
                    command: request.command,
                    value: "ok".into(),
                    qualifier: Qualifier::new().with("Channel", 1).with("Band", 2),
                }]
            })
        }
    }

    fn device(pacing: Pacing) -> (Device<ProbeDriver, MockClient>, MockPeer) {
        let (client, peer) = MockClient::pair(Protocol::Serial);
        (Device::new("probe", ProbeDriver { pacing }, client), peer)
    }

    fn paced() -> Pacing {
        Pacing::Paced {
            response_timeout: Duration::from_secs(1),
        }
    }

    #[test]
    fn first_update_reports_connected() {
        let (mut device, peer) = device(Pacing::Counted);
        device.update(Probe::Level, &Qualifier::new()).unwrap();
        assert_eq!(device.pop_connection_change(), Some(ConnectionStatus::Connected));
        assert_eq!(device.pop_connection_change(), None);
        assert_eq!(peer.sent(), vec![Bytes::from_static(b"GET\r")]);
    }

    #[test]
    fn counted_limit_reports_disconnected() {
        let (mut device, _peer) = device(Pacing::Counted);
        device.set_disconnect_limit(2);
        for _ in 0..3 {
            device.update(Probe::Level, &Qualifier::new()).unwrap();
        }
        assert_eq!(device.pop_connection_change(), Some(ConnectionStatus::Connected));
        assert_eq!(device.pop_connection_change(), Some(ConnectionStatus::Disconnected));
        assert!(!device.connected_flag());

        // The next status brings it back.
        device.receive(b"5\r");
        assert_eq!(device.pop_connection_change(), Some(ConnectionStatus::Connected));
        assert_eq!(device.counter(), 0);
    }

    #[test]
    fn deepest_subscription_wins() {
        let (mut device, _peer) = device(Pacing::Counted);
        let seen = Arc::new(Mutex::new(Vec::new()));

        let root = Arc::clone(&seen);
        device.subscribe_status(Probe::Level, &Qualifier::new(), move |_, v, _| {
            root.lock().unwrap().push(format!("root {v}"));
        });
        let channel = Arc::clone(&seen);
        device.subscribe_status(Probe::Level, &Qualifier::new().with("Channel", 1), move |_, v, _| {
            channel.lock().unwrap().push(format!("channel {v}"));
        });

        device.receive(b"7\r");
        device.receive(b"7\r");
        assert_eq!(*seen.lock().unwrap(), vec!["channel 7"]);

        let full = Qualifier::new().with("Channel", 1).with("Band", 2);
        assert_eq!(device.read_status(Probe::Level, &full), Some(&Value::from("7")));
        assert_eq!(device.read_status(Probe::Level, &Qualifier::new()), None);
    }

    #[test]
    fn invalid_set_is_discarded() {
        let (mut device, peer) = device(Pacing::Counted);
        assert!(device.set(Probe::Level, 11, &Qualifier::new()).is_err());
        device.set(Probe::Level, 3, &Qualifier::new()).unwrap();
        assert_eq!(peer.sent(), vec![Bytes::from_static(b"SET 3\r")]);
    }

    #[test]
    fn unidirectional_rejects_updates() {
        let (device, peer) = device(Pacing::Counted);
        let mut device = device.unidirectional();
        assert!(matches!(
            device.update(Probe::Level, &Qualifier::new()),
            Err(AvError::InvalidCommand { .. })
        ));
        assert!(peer.sent().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn paced_requests_wait_for_reply() {
        let (mut device, peer) = device(paced());
        device.update(Probe::Level, &Qualifier::new()).unwrap();
        device.update(Probe::Level, &Qualifier::new()).unwrap();
        assert_eq!(peer.sent().len(), 1);

        device.receive(b"junk");
        assert_eq!(peer.sent().len(), 1);
        device.receive(b"OK");
        assert_eq!(peer.sent().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn paced_timeouts_count_misses() {
        let (mut device, _peer) = device(paced());
        device.set_disconnect_limit(1);
        assert_eq!(device.pop_connection_change(), None);

        for _ in 0..2 {
            device.update(Probe::Level, &Qualifier::new()).unwrap();
            assert_eq!(device.next_io().await, DeviceIo::ResponseTimeout);
            device.response_timed_out();
        }
        assert_eq!(device.pop_connection_change(), Some(ConnectionStatus::Connected));
        assert_eq!(device.pop_connection_change(), Some(ConnectionStatus::Disconnected));
        assert_eq!(device.counter(), 0);
    }
}
