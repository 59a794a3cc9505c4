//! Connection handler around a device module.
//!
//! The device issues the keep-alive update itself and proves the link alive
//! by writing statuses, so there is no `response_accepted` here. The handler
//! mirrors the device's connection status changes into its own de-duplicated
//! status and event surface.

use super::events::{client_event_setters, fire, ClientEvents, StatusCell};
use super::reconnect::ReconnectSupervisor;
use super::timer::{tick_optional, Timer, TimerState};
use super::{link_mode, Backing, ConnectionStatus, HandlerOptions, LinkMode};
use crate::device::{CommandId, Device, DeviceIo, Driver, Qualifier, StatusCallback, Value};
use crate::error::AvResult;
use crate::transport::{ClientTransport, ConnectOutcome, TransportEvent};
use ringbuf::{ring_buffer::RbBase, HeapRb, Rb};
use std::fmt;
use std::time::Duration;
use tracing::{debug, info, warn};

/// The last `capacity` statuses seen by the poller of a stream link.
pub struct ConnectHistory {
    samples: HeapRb<ConnectionStatus>,
}

impl ConnectHistory {
    #[must_use]
    pub fn new(capacity: u32) -> Self {
        let capacity = usize::try_from(capacity.max(1)).unwrap_or(1);
        Self {
            samples: HeapRb::new(capacity),
        }
    }

    pub fn push(&mut self, status: ConnectionStatus) {
        self.samples.push_overwrite(status);
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    #[must_use]
    pub fn is_full(&self) -> bool {
        self.samples.is_full()
    }

    /// False only once the history is full and holds no `Connected` sample.
    #[must_use]
    pub fn has_been_connected(&self) -> bool {
        !self.samples.is_full()
            || self
                .samples
                .iter()
                .any(|status| *status == ConnectionStatus::Connected)
    }

    pub fn clear(&mut self) {
        self.samples.clear();
    }
}

impl fmt::Debug for ConnectHistory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectHistory")
            .field("len", &self.samples.len())
            .field("capacity", &self.samples.capacity())
            .finish()
    }
}

/// Routes status subscriptions: the connection-status pseudo-command stays
/// with the handler, everything else goes to the device.
pub struct StatusSubscription<C> {
    connection: Option<StatusCallback<C>>,
}

impl<C: CommandId> Default for StatusSubscription<C> {
    fn default() -> Self {
        Self { connection: None }
    }
}

impl<C: CommandId> StatusSubscription<C> {
    /// Subscribe through `device` unless `command` is the connection status.
    pub fn subscribe<D, T, F>(&mut self, device: &mut Device<D, T>, command: C, qualifier: &Qualifier, callback: F)
    where
        D: Driver<Command = C>,
        T: ClientTransport,
        F: FnMut(C, &Value, &Qualifier) + Send + 'static,
    {
        if command == C::CONNECTION_STATUS {
            self.connection = Some(Box::new(callback));
        } else {
            device.subscribe_status(command, qualifier, callback);
        }
    }

    /// Deliver a connection status change.
    pub fn notify(&mut self, status: ConnectionStatus) {
        if let Some(callback) = self.connection.as_mut() {
            callback(C::CONNECTION_STATUS, &Value::from(status.as_str()), &Qualifier::new());
        }
    }

    #[must_use]
    pub fn has_connection_subscriber(&self) -> bool {
        self.connection.is_some()
    }
}

impl<C> fmt::Debug for StatusSubscription<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StatusSubscription")
            .field("connection", &self.connection.is_some())
            .finish()
    }
}

/// Keep-alive poller and reconnect supervisor around a [`Device`].
pub struct ModuleHandler<D: Driver, T: ClientTransport> {
    device: Device<D, T>,
    mode: LinkMode,
    status: StatusCell,
    keep_alive: (D::Command, Qualifier),
    poll: Timer,
    reconnect: ReconnectSupervisor,
    history: ConnectHistory,
    subscription: StatusSubscription<D::Command>,
    pub(crate) events: ClientEvents<Self>,
}

impl<D: Driver, T: ClientTransport + 'static> ModuleHandler<D, T> {
    /// Supervise `device`, polling it with `update(keep_alive)`.
    ///
    /// The device's missed-response limit is set from `options`.
    pub fn new(
        mut device: Device<D, T>,
        options: &HandlerOptions,
        keep_alive: (D::Command, Qualifier),
    ) -> AvResult<Self> {
        let mode = link_mode(device.transport().protocol(), Backing::Module)?;
        device.set_disconnect_limit(options.disconnect_limit);
        debug!(
            device = device.name(),
            transport = %device.transport().describe(),
            ?mode,
            keep_alive = %keep_alive.0,
            "module handler created"
        );
        Ok(Self {
            device,
            mode,
            status: StatusCell::default(),
            keep_alive,
            poll: Timer::periodic(options.poll_interval).paused(),
            reconnect: ReconnectSupervisor::new(
                options.connect_retry,
                options.auto_reconnect,
                options.connect_timeout,
            ),
            history: ConnectHistory::new(options.disconnect_limit),
            subscription: StatusSubscription::default(),
            events: ClientEvents::default(),
        })
    }

    client_event_setters!();

    /// Start polling. Stream links also attempt to connect unless an
    /// attempt is pending or the status is already `Connected`.
    pub async fn connect(&mut self) {
        let timeout = self.reconnect.timeout();
        self.connect_with_timeout(timeout).await;
    }

    /// As [`connect`](Self::connect), recording `timeout` for this and every
    /// later attempt.
    pub async fn connect_with_timeout(&mut self, timeout: Option<Duration>) {
        self.reconnect.set_timeout(timeout);
        if self.mode == LinkMode::Stream
            && !self.reconnect.attempting()
            && self.status.get() != ConnectionStatus::Connected
        {
            self.attempt_connect().await;
        }
        if self.poll.state() != TimerState::Running {
            self.poll.restart();
        }
    }

    /// Send a control command to the device.
    pub fn set(&mut self, command: D::Command, value: impl Into<Value>, qualifier: &Qualifier) -> AvResult<()> {
        let result = self.device.set(command, value, qualifier);
        self.sync_status();
        result
    }

    /// Query a status from the device.
    pub fn update(&mut self, command: D::Command, qualifier: &Qualifier) -> AvResult<()> {
        let result = self.device.update(command, qualifier);
        self.sync_status();
        result
    }

    #[must_use]
    pub fn read_status(&self, command: D::Command, qualifier: &Qualifier) -> Option<&Value> {
        self.device.read_status(command, qualifier)
    }

    /// Subscribe to a status. The connection status is reported from the
    /// handler's de-duplicated status, others come from the device.
    pub fn subscribe_status<F>(&mut self, command: D::Command, qualifier: &Qualifier, callback: F)
    where
        F: FnMut(D::Command, &Value, &Qualifier) + Send + 'static,
    {
        self.subscription
            .subscribe(&mut self.device, command, qualifier, callback);
    }

    #[must_use]
    pub fn status(&self) -> ConnectionStatus {
        self.status.get()
    }

    #[must_use]
    pub fn mode(&self) -> LinkMode {
        self.mode
    }

    #[must_use]
    pub fn device(&self) -> &Device<D, T> {
        &self.device
    }

    pub fn device_mut(&mut self) -> &mut Device<D, T> {
        &mut self.device
    }

    #[must_use]
    pub fn history(&self) -> &ConnectHistory {
        &self.history
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

    #[must_use]
    pub fn reconnect_timer(&self) -> &Timer {
        self.reconnect.timer()
    }

    /// Wait for the next device event or timer tick and process it.
    pub async fn step(&mut self) {
        let reconnect = match self.mode {
            LinkMode::Stream => Some(self.reconnect.timer_mut()),
            LinkMode::Pipe => None,
        };
        tokio::select! {
            io = self.device.next_io() => self.handle_io(io),
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
        let timeout = self.reconnect.timeout();
        match self.device.transport_mut().connect(timeout).await {
            ConnectOutcome::Connected => {
                debug!(device = self.device.name(), "connect attempt succeeded");
            }
            ConnectOutcome::AlreadyConnected => self.reconnect.link_up(),
            ConnectOutcome::Failed(reason) => {
                warn!(device = self.device.name(), %reason, "connect failed");
                fire!(self, connect_failed, reason);
                self.device.force_missed_limit();
                self.device.on_disconnected();
                self.sync_status();
                self.reconnect.arm();
            }
        }
    }

    fn handle_io(&mut self, io: DeviceIo) {
        match self.device.handle_io(io) {
            Some(TransportEvent::Connected) if self.mode == LinkMode::Stream => {
                self.history.push(ConnectionStatus::Connected);
                self.reconnect.link_up();
            }
            Some(TransportEvent::Connected) => {}
            Some(TransportEvent::Disconnected) => {
                if self.mode == LinkMode::Stream && self.reconnect.arm() {
                    self.reconnect.set_attempting(true);
                }
                self.device.on_disconnected();
                self.sync_status();
            }
            Some(TransportEvent::Data(bytes)) => {
                self.sync_status();
                fire!(self, receive_data, bytes);
            }
            None => self.sync_status(),
        }
    }

    fn poll_triggered(&mut self) {
        if self.reconnect.attempting() {
            return;
        }
        let (command, qualifier) = self.keep_alive.clone();
        // Errors were already logged by the device.
        let _ = self.device.update(command, &qualifier);
        self.sync_status();

        if self.mode == LinkMode::Stream {
            self.history.push(self.status.get());
            if !self.history.has_been_connected() {
                debug!(device = self.device.name(), "no connection in history, closing link");
                self.device.rearm();
                self.device.disconnect();
                self.sync_status();
            }
        }
    }

    /// Pull connection changes out of the device.
    fn sync_status(&mut self) {
        while let Some(status) = self.device.pop_connection_change() {
            self.set_status(status);
        }
    }

    fn set_status(&mut self, status: ConnectionStatus) {
        if !self.status.set(status) {
            return;
        }
        info!(device = self.device.name(), %status, "connection status changed");
        self.subscription.notify(status);
        match status {
            ConnectionStatus::Connected => fire!(self, connected, status),
            ConnectionStatus::Disconnected => fire!(self, disconnected, status),
            ConnectionStatus::Unknown => {}
        }
    }
}

impl<D: Driver, T: ClientTransport> fmt::Debug for ModuleHandler<D, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModuleHandler")
            .field("device", &self.device)
            .field("mode", &self.mode)
            .field("status", &self.status.get())
            .field("history", &self.history)
            .field("events", &self.events)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::planar_urx::UrxCommand;
    use crate::device::PlanarUrx;
    use crate::transport::{MockClient, MockPeer, Protocol};
    use std::sync::{Arc, Mutex};

    fn handler(protocol: Protocol, limit: u32) -> (ModuleHandler<PlanarUrx, MockClient>, MockPeer) {
        let (client, peer) = MockClient::pair(protocol);
        let device = Device::new("display", PlanarUrx::new().unwrap(), client);
        let options = HandlerOptions::default().with_disconnect_limit(limit);
        let handler = ModuleHandler::new(device, &options, (UrxCommand::Power, Qualifier::new())).unwrap();
        (handler, peer)
    }

    #[test]
    fn history_needs_to_fill() {
        let mut history = ConnectHistory::new(3);
        history.push(ConnectionStatus::Disconnected);
        history.push(ConnectionStatus::Disconnected);
        assert!(history.has_been_connected());
        history.push(ConnectionStatus::Disconnected);
        assert!(!history.has_been_connected());
        history.push(ConnectionStatus::Connected);
        assert!(history.has_been_connected());
        assert_eq!(history.len(), 3);
    }

    #[test]
    fn history_overwrites_oldest_and_clears() {
        let mut history = ConnectHistory::new(2);
        assert!(history.is_empty());
        history.push(ConnectionStatus::Connected);
        history.push(ConnectionStatus::Disconnected);
        assert!(history.is_full());
        history.push(ConnectionStatus::Disconnected);
        assert_eq!(history.len(), 2);
        assert!(!history.has_been_connected());
        assert_eq!(format!("{history:?}"), "ConnectHistory { len: 2, capacity: 2 }");

        history.clear();
        assert!(history.is_empty());
        assert!(history.has_been_connected());
    }

    #[tokio::test(start_paused = true)]
    async fn pipe_poll_reports_connection_from_device() {
        let (mut handler, peer) = handler(Protocol::Serial, 2);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        handler.subscribe_status(UrxCommand::ConnectionStatus, &Qualifier::new(), move |_, v, _| {
            sink.lock().unwrap().push(v.to_string());
        });

        handler.connect().await;
        handler.step().await;
        assert_eq!(handler.status(), ConnectionStatus::Connected);
        assert_eq!(peer.sent()[0].as_ref(), b"(STA?)\r");

        for _ in 0..3 {
            handler.step().await;
        }
        assert_eq!(handler.status(), ConnectionStatus::Disconnected);

        peer.push_data(&b"(0;STA=2)\r"[..]);
        handler.step().await;
        assert_eq!(handler.status(), ConnectionStatus::Connected);
        assert_eq!(
            handler.read_status(UrxCommand::Power, &Qualifier::new()),
            Some(&Value::from("On"))
        );
        assert_eq!(*seen.lock().unwrap(), vec!["Connected", "Disconnected", "Connected"]);
        assert_eq!(peer.disconnects(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn forced_disconnect_needs_full_history() {
        let (mut handler, peer) = handler(Protocol::Tcp, 3);
        handler.connect().await;
        handler.step().await;

        // Polls 1-3 keep the device connected, 4 and 5 leave a Connected
        // sample in the history.
        for _ in 0..5 {
            handler.step().await;
        }
        assert_eq!(handler.status(), ConnectionStatus::Disconnected);
        assert_eq!(peer.disconnects(), 0);

        handler.step().await;
        assert_eq!(peer.disconnects(), 1);

        handler.step().await;
        assert_eq!(handler.reconnect_timer().state(), TimerState::Running);
    }

    #[tokio::test(start_paused = true)]
    async fn link_events_drive_reconnect() {
        let (mut handler, peer) = handler(Protocol::Tcp, 15);
        handler.connect().await;
        handler.step().await;
        assert_eq!(handler.reconnect_timer().state(), TimerState::Stopped);
        assert_eq!(handler.history().len(), 1);

        peer.drop_link();
        handler.step().await;
        assert_eq!(handler.status(), ConnectionStatus::Disconnected);
        assert_eq!(handler.reconnect_timer().state(), TimerState::Running);

        // Polls are skipped until the retry reconnects.
        while peer.connect_attempts().len() < 2 {
            handler.step().await;
        }
        while handler.reconnect_timer().state() != TimerState::Stopped {
            handler.step().await;
        }
        assert!(peer.is_connected());
        assert_eq!(peer.sent().len(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_connect_marks_device_down() {
        let (mut handler, peer) = handler(Protocol::Tcp, 4);
        peer.set_connect_outcome(ConnectOutcome::Failed("Timeout".into()));
        let reasons = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&reasons);
        handler.on_connect_failed(move |_, reason| sink.lock().unwrap().push(reason));

        handler.connect().await;
        assert_eq!(*reasons.lock().unwrap(), vec!["Timeout".to_string()]);
        assert_eq!(handler.device().counter(), 5);
        assert_eq!(handler.status(), ConnectionStatus::Disconnected);
        assert_eq!(handler.reconnect_timer().state(), TimerState::Running);
    }

    #[test]
    fn http_modules_are_pipes() {
        let (handler, _peer) = handler(Protocol::Http, 15);
        assert_eq!(handler.mode(), LinkMode::Pipe);
    }
}
