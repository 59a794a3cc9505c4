//! Connection handler for raw transports.
//!
//! The caller supplies the keep-alive query as a closure that sends whatever
//! the device understands, and calls
//! [`response_accepted`](ConnectionHandler::response_accepted) when it
//! recognises a good reply in its `on_receive_data` callback.

use super::events::{client_event_setters, fire, ClientEvents, StatusCell};
use super::keepalive::SendCounter;
use super::reconnect::ReconnectSupervisor;
use super::timer::{tick_optional, Timer, TimerState};
use super::{link_mode, Backing, ConnectionStatus, DeadLinkPolicy, HandlerOptions, LinkMode};
use crate::error::{AvError, AvResult};
use crate::transport::{ClientTransport, ConnectOutcome, Delimiter, TransportEvent};
use bytes::Bytes;
use std::fmt;
use std::time::Duration;
use tracing::{debug, info, warn};

type KeepAlive<T> = Box<dyn FnMut(&mut ConnectionHandler<T>) + Send>;

/// Keep-alive poller and reconnect supervisor around a raw transport.
pub struct ConnectionHandler<T: ClientTransport> {
    transport: T,
    mode: LinkMode,
    status: StatusCell,
    counter: SendCounter,
    dead_link_policy: DeadLinkPolicy,
    poll: Timer,
    keep_alive: Option<KeepAlive<T>>,
    reconnect: ReconnectSupervisor,
    pub(crate) events: ClientEvents<Self>,
}

impl<T: ClientTransport + 'static> ConnectionHandler<T> {
    /// Wrap `transport`. The poll timer stays paused until
    /// [`connect`](Self::connect).
    ///
    /// Fails with [`AvError::UnsupportedTransport`] for protocols a raw
    /// handler cannot supervise.
    pub fn new<F>(transport: T, options: &HandlerOptions, keep_alive: F) -> AvResult<Self>
    where
        F: FnMut(&mut Self) + Send + 'static,
    {
        let mode = link_mode(transport.protocol(), Backing::Raw)?;
        debug!(transport = %transport.describe(), ?mode, "connection handler created");
        Ok(Self {
            transport,
            mode,
            status: StatusCell::default(),
            counter: SendCounter::new(options.disconnect_limit),
            dead_link_policy: options.dead_link_policy,
            poll: Timer::periodic(options.poll_interval).paused(),
            keep_alive: Some(Box::new(keep_alive)),
            reconnect: ReconnectSupervisor::new(
                options.connect_retry,
                options.auto_reconnect,
                options.connect_timeout,
            ),
            events: ClientEvents::default(),
        })
    }

    client_event_setters!();

    /// Start polling. Stream links also attempt to connect now unless the
    /// status is already `Connected`.
    pub async fn connect(&mut self) {
        let timeout = self.reconnect.timeout();
        self.connect_with_timeout(timeout).await;
    }

    /// As [`connect`](Self::connect), recording `timeout` for this and every
    /// later attempt.
    pub async fn connect_with_timeout(&mut self, timeout: Option<Duration>) {
        self.reconnect.set_timeout(timeout);
        if self.mode == LinkMode::Stream && self.status.get() != ConnectionStatus::Connected {
            self.attempt_connect().await;
        }
        if self.poll.state() != TimerState::Running {
            self.poll.restart();
        }
    }

    /// Send without waiting. Counts towards the missed-response limit; link
    /// errors are logged and reflected in the status, never returned.
    pub fn send(&mut self, data: &[u8]) {
        let exceeded = self.counter.record();
        debug!(count = self.counter.count(), len = data.len(), "send");
        if exceeded {
            self.link_dead();
            if self.dead_link_policy == DeadLinkPolicy::Drop {
                return;
            }
        }
        if let Err(err) = self.transport.send(data) {
            debug!(%err, "transport send failed");
        }
    }

    /// Send and wait for the response, counted like [`send`](Self::send).
    ///
    /// Returns empty bytes when nothing satisfying `delimiter` arrives within
    /// `timeout`, and when the link is down.
    pub async fn send_and_wait(
        &mut self,
        data: &[u8],
        timeout: Duration,
        delimiter: Option<&Delimiter>,
    ) -> AvResult<Bytes> {
        if !self.transport.supports_send_and_wait() {
            return Err(AvError::CapabilityMissing {
                handler: "ConnectionHandler",
                transport: self.transport.describe(),
                operation: "send_and_wait",
            });
        }

        let exceeded = self.counter.record();
        debug!(count = self.counter.count(), len = data.len(), "send and wait");
        if exceeded {
            self.link_dead();
            if self.dead_link_policy == DeadLinkPolicy::Drop {
                return Ok(Bytes::new());
            }
        }

        match self.transport.send_and_wait(data, timeout, delimiter).await {
            Ok(response) => Ok(response),
            Err(err) if err.is_transient() => {
                debug!(%err, "transport send and wait failed");
                Ok(Bytes::new())
            }
            Err(err) => Err(err),
        }
    }

    /// The caller saw a good reply: reset the counter and report `Connected`.
    pub fn response_accepted(&mut self) {
        self.counter.reset();
        self.set_status(ConnectionStatus::Connected);
    }

    #[must_use]
    pub fn status(&self) -> ConnectionStatus {
        self.status.get()
    }

    #[must_use]
    pub fn mode(&self) -> LinkMode {
        self.mode
    }

    /// Sends since the last accepted response.
    #[must_use]
    pub fn send_count(&self) -> u32 {
        self.counter.count()
    }

    #[must_use]
    pub fn disconnect_limit(&self) -> u32 {
        self.counter.limit()
    }

    #[must_use]
    pub fn auto_reconnect(&self) -> bool {
        self.reconnect.auto_reconnect()
    }

    pub fn set_auto_reconnect(&mut self, enabled: bool) {
        self.reconnect.set_auto_reconnect(enabled);
    }

    #[must_use]
    pub fn poll_timer(&self) -> &Timer {
        &self.poll
    }

    /// Retry timer. Only stream links ever run it.
    #[must_use]
    pub fn reconnect_timer(&self) -> &Timer {
        self.reconnect.timer()
    }

    #[must_use]
    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    pub fn into_transport(self) -> T {
        self.transport
    }

    /// Wait for the next transport event or timer tick and process it.
    pub async fn step(&mut self) {
        let reconnect = match self.mode {
            LinkMode::Stream => Some(self.reconnect.timer_mut()),
            LinkMode::Pipe => None,
        };
        tokio::select! {
            event = self.transport.next_event() => self.handle_event(event),
            _ = self.poll.tick() => self.poll_triggered(),
            _ = tick_optional(reconnect) => self.attempt_connect().await,
        }
    }

    /// Process events forever.
    pub async fn run(mut self) {
        loop {
            self.step().await;
        }
    }

    async fn attempt_connect(&mut self) {
        self.reconnect.set_attempting(true);
        match self.transport.connect(self.reconnect.timeout()).await {
            ConnectOutcome::Connected => {
                debug!(transport = %self.transport.describe(), "connect attempt succeeded");
            }
            ConnectOutcome::AlreadyConnected => self.reconnect.link_up(),
            ConnectOutcome::Failed(reason) => {
                warn!(transport = %self.transport.describe(), %reason, "connect failed");
                fire!(self, connect_failed, reason);
                self.counter.force_exceeded();
                self.set_status(ConnectionStatus::Disconnected);
                self.reconnect.arm();
            }
        }
    }

    fn handle_event(&mut self, event: TransportEvent) {
        match (event, self.mode) {
            (TransportEvent::Connected, LinkMode::Stream) => {
                self.counter.reset();
                self.reconnect.link_up();
                self.set_status(ConnectionStatus::Connected);
            }
            (TransportEvent::Connected, LinkMode::Pipe) => {}
            (TransportEvent::Disconnected, mode) => {
                if mode == LinkMode::Stream {
                    self.reconnect.arm();
                }
                self.set_status(ConnectionStatus::Disconnected);
            }
            (TransportEvent::Data(bytes), _) => {
                fire!(self, receive_data, bytes);
            }
        }
    }

    fn poll_triggered(&mut self) {
        if self.reconnect.attempting() {
            return;
        }
        if let Some(mut keep_alive) = self.keep_alive.take() {
            keep_alive(self);
            self.keep_alive = Some(keep_alive);
        }
    }

    fn link_dead(&mut self) {
        if self.mode == LinkMode::Stream {
            debug!(transport = %self.transport.describe(), "missed response limit, closing link");
            self.transport.disconnect();
        }
        self.set_status(ConnectionStatus::Disconnected);
    }

    fn set_status(&mut self, status: ConnectionStatus) {
        if !self.status.set(status) {
            return;
        }
        info!(transport = %self.transport.describe(), %status, "connection status changed");
        match status {
            ConnectionStatus::Connected => fire!(self, connected, status),
            ConnectionStatus::Disconnected => fire!(self, disconnected, status),
            ConnectionStatus::Unknown => {}
        }
    }
}

impl<T: ClientTransport> fmt::Debug for ConnectionHandler<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionHandler")
            .field("transport", &self.transport.describe())
            .field("mode", &self.mode)
            .field("status", &self.status.get())
            .field("counter", &self.counter)
            .field("events", &self.events)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{MockClient, MockPeer, Protocol};
    use std::sync::{Arc, Mutex};
    use tokio::time::Instant;
    use tracing_test::traced_test;

    fn options(limit: u32) -> HandlerOptions {
        HandlerOptions::default().with_disconnect_limit(limit)
    }

    fn handler(
        protocol: Protocol,
        limit: u32,
    ) -> (ConnectionHandler<MockClient>, MockPeer) {
        let (client, peer) = MockClient::pair(protocol);
        let handler = ConnectionHandler::new(client, &options(limit), |h| h.send(b"(STA?)\r")).unwrap();
        (handler, peer)
    }

    fn record_status(
        handler: &mut ConnectionHandler<MockClient>,
    ) -> Arc<Mutex<Vec<ConnectionStatus>>> {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let on_up = Arc::clone(&seen);
        handler.on_connected(move |_, status| on_up.lock().unwrap().push(status));
        let on_down = Arc::clone(&seen);
        handler.on_disconnected(move |_, status| on_down.lock().unwrap().push(status));
        seen
    }

    #[tokio::test(start_paused = true)]
    async fn pipe_limit_marks_disconnected_once() {
        let (mut handler, peer) = handler(Protocol::Serial, 3);
        let seen = record_status(&mut handler);

        for _ in 0..3 {
            handler.send(b"q");
        }
        assert_eq!(handler.status(), ConnectionStatus::Unknown);
        for _ in 0..3 {
            handler.send(b"q");
        }
        assert_eq!(handler.status(), ConnectionStatus::Disconnected);
        assert_eq!(*seen.lock().unwrap(), vec![ConnectionStatus::Disconnected]);
        // Forward policy still writes, and a pipe is never severed.
        assert_eq!(peer.sent().len(), 6);
        assert_eq!(peer.disconnects(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn response_accepted_fires_once() {
        let (mut handler, _peer) = handler(Protocol::Udp, 15);
        let seen = record_status(&mut handler);
        handler.response_accepted();
        handler.response_accepted();
        assert_eq!(*seen.lock().unwrap(), vec![ConnectionStatus::Connected]);
        assert_eq!(handler.send_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn drop_policy_discards_when_dead() {
        let (client, peer) = MockClient::pair(Protocol::Serial);
        let options = options(1).with_dead_link_policy(DeadLinkPolicy::Drop);
        let mut handler = ConnectionHandler::new(client, &options, |_| {}).unwrap();
        handler.send(b"a");
        handler.send(b"b");
        assert_eq!(peer.sent(), vec![Bytes::from_static(b"a")]);
    }

    #[tokio::test(start_paused = true)]
    async fn poll_runs_keep_alive_after_connect() {
        let (mut handler, peer) = handler(Protocol::Serial, 15);
        assert_eq!(handler.poll_timer().state(), TimerState::Paused);

        handler.connect().await;
        let start = Instant::now();
        handler.step().await;
        handler.step().await;
        assert_eq!(start.elapsed(), Duration::from_secs(2));
        assert_eq!(peer.sent().len(), 2);
        assert_eq!(handler.send_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn stream_connect_and_link_events() {
        let (mut handler, peer) = handler(Protocol::Tcp, 15);
        let seen = record_status(&mut handler);

        handler.connect().await;
        handler.step().await;
        assert_eq!(handler.status(), ConnectionStatus::Connected);

        peer.drop_link();
        handler.step().await;
        assert_eq!(handler.status(), ConnectionStatus::Disconnected);
        assert_eq!(handler.reconnect_timer().state(), TimerState::Running);
        assert_eq!(
            *seen.lock().unwrap(),
            vec![ConnectionStatus::Connected, ConnectionStatus::Disconnected]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn stream_limit_severs_link() {
        let (mut handler, peer) = handler(Protocol::Tcp, 2);
        handler.connect().await;
        handler.step().await;

        for _ in 0..3 {
            handler.send(b"q");
        }
        assert_eq!(peer.disconnects(), 1);
        assert_eq!(handler.status(), ConnectionStatus::Disconnected);
        handler.step().await;
        assert_eq!(handler.reconnect_timer().state(), TimerState::Running);
    }

    #[tokio::test(start_paused = true)]
    async fn connect_is_skipped_while_connected() {
        let (mut handler, peer) = handler(Protocol::Tcp, 15);
        handler.connect().await;
        handler.step().await;
        handler.connect().await;
        assert_eq!(peer.connect_attempts().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_connect_reports_reason() {
        let (mut handler, peer) = handler(Protocol::Ssh, 4);
        peer.set_connect_outcome(ConnectOutcome::Failed("Timeout".into()));
        let reasons = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&reasons);
        handler.on_connect_failed(move |_, reason| sink.lock().unwrap().push(reason));

        handler.connect().await;
        assert_eq!(*reasons.lock().unwrap(), vec!["Timeout".to_string()]);
        assert_eq!(handler.send_count(), 5);
        assert_eq!(handler.status(), ConnectionStatus::Disconnected);
        assert_eq!(handler.reconnect_timer().state(), TimerState::Running);
    }

    #[tokio::test(start_paused = true)]
    async fn send_and_wait_needs_capability() {
        let (client, _peer) = MockClient::pair(Protocol::SpInterface);
        let mut handler = ConnectionHandler::new(client, &options(15), |_| {}).unwrap();
        let err = handler
            .send_and_wait(b"q", Duration::from_secs(1), None)
            .await
            .unwrap_err();
        assert!(matches!(err, AvError::CapabilityMissing { .. }));
        assert_eq!(handler.send_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn send_and_wait_returns_reply() {
        let (mut handler, peer) = handler(Protocol::Serial, 15);
        peer.queue_reply(&b"(0;STA=2)\r"[..]);
        let reply = handler
            .send_and_wait(b"(STA?)\r", Duration::from_secs(1), None)
            .await
            .unwrap();
        assert_eq!(&reply[..], b"(0;STA=2)\r");
        assert_eq!(handler.send_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn receive_data_reaches_callback() {
        let (mut handler, peer) = handler(Protocol::Serial, 15);
        handler.on_receive_data(|h, data| {
            if data.as_ref() == b"(0;STA=2)\r" {
                h.response_accepted();
            }
        });
        handler.send(b"(STA?)\r");
        peer.push_data(&b"(0;STA=2)\r"[..]);
        handler.step().await;
        assert_eq!(handler.status(), ConnectionStatus::Connected);
        assert_eq!(handler.send_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    #[traced_test]
    async fn failed_connect_is_logged() {
        let (mut handler, peer) = handler(Protocol::Tcp, 15);
        peer.set_connect_outcome(ConnectOutcome::Failed("Connection refused".into()));
        handler.connect().await;
        assert_eq!(handler.status(), ConnectionStatus::Disconnected);
        assert!(logs_contain("connect failed"));
        assert!(logs_contain("Connection refused"));
        assert!(logs_contain("connection status changed"));
    }

    #[test]
    fn raw_http_is_rejected() {
        let (client, _peer) = MockClient::pair(Protocol::Http);
        let err = ConnectionHandler::new(client, &options(15), |_| {}).unwrap_err();
        assert!(matches!(err, AvError::UnsupportedTransport { .. }));
    }
}
