//! Multi-client server handler with idle-client eviction.

use super::events::{fire, ServerEvents};
use super::timer::{Timer, TimerState};
use super::{server_mode, HandlerOptions};
use crate::error::AvResult;
use crate::transport::{ClientId, ListenOutcome, ServerEvent, ServerTransport};
use bytes::Bytes;
use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Idle scan period.
pub const IDLE_SCAN_INTERVAL: Duration = Duration::from_secs(1);

/// Last activity of every connected client.
#[derive(Debug, Default)]
pub struct ClientTable {
    last_seen: HashMap<ClientId, Instant>,
}

impl ClientTable {
    /// Record activity now. Returns true for a client not seen before.
    pub fn touch(&mut self, client: ClientId, now: Instant) -> bool {
        self.last_seen.insert(client, now).is_none()
    }

    pub fn remove(&mut self, client: ClientId) -> bool {
        self.last_seen.remove(&client).is_some()
    }

    #[must_use]
    pub fn contains(&self, client: ClientId) -> bool {
        self.last_seen.contains_key(&client)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.last_seen.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.last_seen.is_empty()
    }

    /// Clients silent for longer than `timeout`, oldest first.
    #[must_use]
    pub fn idle(&self, now: Instant, timeout: Duration) -> Vec<ClientId> {
        let mut idle: Vec<(ClientId, Instant)> = self
            .last_seen
            .iter()
            .filter(|(_, seen)| now.saturating_duration_since(**seen) > timeout)
            .map(|(client, seen)| (*client, *seen))
            .collect();
        idle.sort_by_key(|(client, seen)| (*seen, *client));
        idle.into_iter().map(|(client, _)| client).collect()
    }
}

/// Listen supervisor and idle-client reaper around a server transport.
pub struct ServerHandler<S: ServerTransport> {
    server: S,
    clients: ClientTable,
    idle_timeout: Duration,
    scan: Timer,
    relisten: Timer,
    listen_pending: bool,
    listen_timeout: Option<Duration>,
    pub(crate) events: ServerEvents<Self>,
}

impl<S: ServerTransport + 'static> ServerHandler<S> {
    /// Wrap `server`. Only TCP servers are supervised.
    pub fn new(server: S, options: &HandlerOptions) -> AvResult<Self> {
        server_mode(server.protocol())?;
        debug!(server = %server.describe(), idle_timeout = ?options.client_idle_timeout, "server handler created");
        Ok(Self {
            server,
            clients: ClientTable::default(),
            idle_timeout: options.client_idle_timeout,
            scan: Timer::periodic(IDLE_SCAN_INTERVAL).paused(),
            relisten: Timer::one_shot(options.listen_retry()),
            listen_pending: false,
            listen_timeout: None,
            events: ServerEvents::default(),
        })
    }

    /// Called with each new client.
    pub fn on_connected<F>(&mut self, callback: F)
    where
        F: FnMut(&mut Self, ClientId) + Send + 'static,
    {
        self.events.connected = Some(Box::new(callback));
    }

    /// Called with each client that left or was disconnected.
    pub fn on_disconnected<F>(&mut self, callback: F)
    where
        F: FnMut(&mut Self, ClientId) + Send + 'static,
    {
        self.events.disconnected = Some(Box::new(callback));
    }

    /// Called with every chunk a client sends.
    pub fn on_receive_data<F>(&mut self, callback: F)
    where
        F: FnMut(&mut Self, (ClientId, Bytes)) + Send + 'static,
    {
        self.events.receive_data = Some(Box::new(callback));
    }

    /// Called with the reason of every failed listen attempt.
    pub fn on_listen_failed<F>(&mut self, callback: F)
    where
        F: FnMut(&mut Self, String) + Send + 'static,
    {
        self.events.listen_failed = Some(Box::new(callback));
    }

    /// Start accepting clients. A failure is reported and retried after the
    /// listen retry period, again on every failure.
    pub async fn start_listen(&mut self, timeout: Option<Duration>) {
        self.listen_timeout = timeout;
        let outcome = self.server.start_listen(timeout).await;
        self.listen_pending = false;
        match outcome {
            ListenOutcome::Listening => {
                info!(server = %self.server.describe(), "listening");
                self.relisten.stop();
            }
            ListenOutcome::Failed(reason) => {
                warn!(server = %self.server.describe(), %reason, "listen failed");
                fire!(self, listen_failed, reason);
                self.relisten.restart();
            }
        }
    }

    pub fn send(&mut self, client: ClientId, data: &[u8]) -> AvResult<()> {
        self.server.send(client, data)
    }

    /// Drop a client. Its `Disconnected` event follows.
    pub fn disconnect(&mut self, client: ClientId) {
        self.server.disconnect(client);
    }

    #[must_use]
    pub fn clients(&self) -> Vec<ClientId> {
        self.server.clients()
    }

    #[must_use]
    pub fn client_address(&self, client: ClientId) -> Option<SocketAddr> {
        self.server.client_address(client)
    }

    /// Activity table used by the idle scan.
    #[must_use]
    pub fn client_table(&self) -> &ClientTable {
        &self.clients
    }

    #[must_use]
    pub fn idle_scan_state(&self) -> TimerState {
        self.scan.state()
    }

    #[must_use]
    pub fn idle_timeout(&self) -> Duration {
        self.idle_timeout
    }

    #[must_use]
    pub fn server(&self) -> &S {
        &self.server
    }

    pub fn server_mut(&mut self) -> &mut S {
        &mut self.server
    }

    /// Wait for the next server event or timer tick and process it.
    ///
    /// Cancel safe: a listen retry interrupted by dropping the future is
    /// repeated by the next call.
    pub async fn step(&mut self) {
        if self.listen_pending {
            let timeout = self.listen_timeout;
            self.start_listen(timeout).await;
            return;
        }
        tokio::select! {
            event = self.server.next_event() => self.handle_event(event),
            _ = self.scan.tick() => self.reap_idle(),
            _ = self.relisten.tick() => self.listen_pending = true,
        }
    }

    /// Process events forever.
    pub async fn run(mut self) {
        loop {
            self.step().await;
        }
    }

    fn handle_event(&mut self, event: ServerEvent) {
        match event {
            ServerEvent::Connected(client) => {
                self.clients.touch(client, Instant::now());
                if self.clients.len() == 1 {
                    self.scan.resume();
                }
                debug!(%client, address = ?self.server.client_address(client), "client connected");
                fire!(self, connected, client);
            }
            ServerEvent::Data(client, bytes) => {
                self.clients.touch(client, Instant::now());
                fire!(self, receive_data, (client, bytes));
            }
            ServerEvent::Disconnected(client) => {
                self.clients.remove(client);
                if self.clients.is_empty() {
                    self.scan.pause();
                }
                debug!(%client, "client disconnected");
                fire!(self, disconnected, client);
            }
        }
    }

    fn reap_idle(&mut self) {
        let idle = self.clients.idle(Instant::now(), self.idle_timeout);
        for client in idle {
            info!(%client, timeout = ?self.idle_timeout, "disconnecting idle client");
            self.server.disconnect(client);
        }
    }
}

impl<S: ServerTransport> fmt::Debug for ServerHandler<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerHandler")
            .field("server", &self.server.describe())
            .field("clients", &self.clients.len())
            .field("idle_timeout", &self.idle_timeout)
            .field("scan", &self.scan.state())
            .field("events", &self.events)
            .finish_non_exhaustive()
    }
}
