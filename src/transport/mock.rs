//! Scripted in-memory transports.
//!
//! Each mock comes with a peer handle standing in for the far end: tests use
//! it to script connect results, inject data and link drops, and inspect
//! what the handler sent. All timing uses `tokio::time`, so the mocks work
//! under a paused clock.
//!
//! ```
//! use av_control::transport::{MockClient, Protocol};
//! use av_control::{ConnectionHandler, ConnectionStatus, HandlerOptions};
//!
//! tokio_test::block_on(async {
//!     let (client, peer) = MockClient::pair(Protocol::Tcp);
//!     let mut handler = ConnectionHandler::new(client, &HandlerOptions::default(), |_| {}).unwrap();
//!     handler.connect().await;
//!     // The link-up event is delivered on the next step.
//!     handler.step().await;
//!     assert_eq!(handler.status(), ConnectionStatus::Connected);
//!
//!     handler.send(b"(STA?)\r");
//!     assert_eq!(peer.sent()[0].as_ref(), b"(STA?)\r");
//! });
//! ```

use super::{
    ClientId, ClientTransport, ConnectOutcome, Delimiter, ListenOutcome, Protocol, ServerEvent,
    ServerTransport, TransportEvent,
};
use crate::error::{AvError, AvResult};
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::{BTreeMap, VecDeque};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;

#[derive(Debug)]
struct ClientState {
    connected: bool,
    connect_script: VecDeque<ConnectOutcome>,
    default_outcome: ConnectOutcome,
    connect_attempts: Vec<Instant>,
    sent: Vec<Bytes>,
    replies: VecDeque<Bytes>,
    disconnects: usize,
    send_and_wait: bool,
}

/// In-memory client transport.
#[derive(Debug)]
pub struct MockClient {
    protocol: Protocol,
    state: Arc<Mutex<ClientState>>,
    events: mpsc::UnboundedReceiver<TransportEvent>,
    pending: VecDeque<TransportEvent>,
}

/// Far end of a [`MockClient`].
#[derive(Debug, Clone)]
pub struct MockPeer {
    state: Arc<Mutex<ClientState>>,
    events: mpsc::UnboundedSender<TransportEvent>,
}

impl MockClient {
    /// Create a mock with its peer. Pipe protocols start connected; stream
    /// protocols accept every connect attempt until scripted otherwise.
    pub fn pair(protocol: Protocol) -> (Self, MockPeer) {
        let (tx, rx) = mpsc::unbounded_channel();
        let state = Arc::new(Mutex::new(ClientState {
            connected: !protocol.is_stream(),
            connect_script: VecDeque::new(),
            default_outcome: ConnectOutcome::Connected,
            connect_attempts: Vec::new(),
            sent: Vec::new(),
            replies: VecDeque::new(),
            disconnects: 0,
            send_and_wait: !matches!(protocol, Protocol::SpInterface | Protocol::Dante),
        }));
        let client = Self {
            protocol,
            state: Arc::clone(&state),
            events: rx,
            pending: VecDeque::new(),
        };
        (client, MockPeer { state, events: tx })
    }
}

impl MockPeer {
    /// Every subsequent connect attempt yields `outcome`.
    pub fn set_connect_outcome(&self, outcome: ConnectOutcome) {
        self.state.lock().default_outcome = outcome;
    }

    /// The next connect attempt yields `outcome`, then the default resumes.
    pub fn script_connect(&self, outcome: ConnectOutcome) {
        self.state.lock().connect_script.push_back(outcome);
    }

    /// Reply handed back by the next `send_and_wait`.
    pub fn queue_reply(&self, reply: impl Into<Bytes>) {
        self.state.lock().replies.push_back(reply.into());
    }

    /// Deliver bytes as if the device sent them.
    pub fn push_data(&self, data: impl Into<Bytes>) {
        let _ = self.events.send(TransportEvent::Data(data.into()));
    }

    /// Drop the link from the far side.
    pub fn drop_link(&self) {
        let was_connected = std::mem::replace(&mut self.state.lock().connected, false);
        if was_connected {
            let _ = self.events.send(TransportEvent::Disconnected);
        }
    }

    /// Everything sent so far.
    #[must_use]
    pub fn sent(&self) -> Vec<Bytes> {
        self.state.lock().sent.clone()
    }

    /// Forget recorded sends.
    pub fn clear_sent(&self) {
        self.state.lock().sent.clear();
    }

    /// When each connect attempt happened.
    #[must_use]
    pub fn connect_attempts(&self) -> Vec<Instant> {
        self.state.lock().connect_attempts.clone()
    }

    /// How often the handler closed the link.
    #[must_use]
    pub fn disconnects(&self) -> usize {
        self.state.lock().disconnects
    }

    /// Whether the link is currently up.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.state.lock().connected
    }
}

#[async_trait]
impl ClientTransport for MockClient {
    fn protocol(&self) -> Protocol {
        self.protocol
    }

    fn describe(&self) -> String {
        format!("MockClient({})", self.protocol)
    }

    async fn connect(&mut self, _timeout: Option<Duration>) -> ConnectOutcome {
        let mut state = self.state.lock();
        state.connect_attempts.push(Instant::now());
        if state.connected {
            return ConnectOutcome::AlreadyConnected;
        }
        let outcome = state
            .connect_script
            .pop_front()
            .unwrap_or_else(|| state.default_outcome.clone());
        if outcome == ConnectOutcome::Connected {
            state.connected = true;
            self.pending.push_back(TransportEvent::Connected);
        }
        outcome
    }

    fn disconnect(&mut self) {
        let mut state = self.state.lock();
        state.disconnects += 1;
        if self.protocol.is_stream() && state.connected {
            state.connected = false;
            self.pending.push_back(TransportEvent::Disconnected);
        }
    }

    fn send(&mut self, data: &[u8]) -> AvResult<()> {
        let mut state = self.state.lock();
        state.sent.push(Bytes::copy_from_slice(data));
        if state.connected {
            Ok(())
        } else {
            Err(AvError::NotConnected)
        }
    }

    fn supports_send_and_wait(&self) -> bool {
        self.state.lock().send_and_wait
    }

    async fn send_and_wait(
        &mut self,
        data: &[u8],
        timeout: Duration,
        _delimiter: Option<&Delimiter>,
    ) -> AvResult<Bytes> {
        let reply = {
            let mut state = self.state.lock();
            state.sent.push(Bytes::copy_from_slice(data));
            if !state.connected {
                return Err(AvError::NotConnected);
            }
            state.replies.pop_front()
        };
        match reply {
            Some(reply) => Ok(reply),
            None => {
                tokio::time::sleep(timeout).await;
                Ok(Bytes::new())
            }
        }
    }

    async fn next_event(&mut self) -> TransportEvent {
        if let Some(event) = self.pending.pop_front() {
            return event;
        }
        match self.events.recv().await {
            Some(event) => event,
            None => std::future::pending().await,
        }
    }
}

#[derive(Debug)]
struct ServerState {
    listen_script: VecDeque<ListenOutcome>,
    listen_attempts: Vec<Instant>,
    clients: BTreeMap<ClientId, SocketAddr>,
    next_id: u64,
    sent: Vec<(ClientId, Bytes)>,
    kicked: Vec<ClientId>,
}

/// In-memory server transport.
#[derive(Debug)]
pub struct MockServer {
    state: Arc<Mutex<ServerState>>,
    events: mpsc::UnboundedReceiver<ServerEvent>,
    pending: VecDeque<ServerEvent>,
}

/// Far end of a [`MockServer`]: the population of remote clients.
#[derive(Debug, Clone)]
pub struct MockServerPeer {
    state: Arc<Mutex<ServerState>>,
    events: mpsc::UnboundedSender<ServerEvent>,
}

impl MockServer {
    /// Create a mock server with its peer handle.
    pub fn pair() -> (Self, MockServerPeer) {
        let (tx, rx) = mpsc::unbounded_channel();
        let state = Arc::new(Mutex::new(ServerState {
            listen_script: VecDeque::new(),
            listen_attempts: Vec::new(),
            clients: BTreeMap::new(),
            next_id: 0,
            sent: Vec::new(),
            kicked: Vec::new(),
        }));
        let server = Self {
            state: Arc::clone(&state),
            events: rx,
            pending: VecDeque::new(),
        };
        (server, MockServerPeer { state, events: tx })
    }
}

impl MockServerPeer {
    /// The next listen attempt yields `outcome`; afterwards listening succeeds.
    pub fn script_listen(&self, outcome: ListenOutcome) {
        self.state.lock().listen_script.push_back(outcome);
    }

    /// When each listen attempt happened.
    #[must_use]
    pub fn listen_attempts(&self) -> Vec<Instant> {
        self.state.lock().listen_attempts.clone()
    }

    /// Connect a new remote client.
    pub fn connect_client(&self) -> ClientId {
        let mut state = self.state.lock();
        state.next_id += 1;
        let id = ClientId(state.next_id);
        let port = 40_000 + u16::try_from(state.next_id % 20_000).unwrap_or(0);
        state.clients.insert(id, SocketAddr::from(([10, 0, 0, 1], port)));
        let _ = self.events.send(ServerEvent::Connected(id));
        id
    }

    /// Deliver bytes from a client.
    pub fn client_data(&self, client: ClientId, data: impl Into<Bytes>) {
        let _ = self.events.send(ServerEvent::Data(client, data.into()));
    }

    /// Remote client closes its side.
    pub fn client_leaves(&self, client: ClientId) {
        if self.state.lock().clients.remove(&client).is_some() {
            let _ = self.events.send(ServerEvent::Disconnected(client));
        }
    }

    /// Everything sent to clients so far.
    #[must_use]
    pub fn sent(&self) -> Vec<(ClientId, Bytes)> {
        self.state.lock().sent.clone()
    }

    /// Bytes sent to one client, concatenated.
    #[must_use]
    pub fn sent_to(&self, client: ClientId) -> Vec<u8> {
        self.state
            .lock()
            .sent
            .iter()
            .filter(|(id, _)| *id == client)
            .flat_map(|(_, bytes)| bytes.iter().copied())
            .collect()
    }

    /// Clients the server disconnected.
    #[must_use]
    pub fn kicked(&self) -> Vec<ClientId> {
        self.state.lock().kicked.clone()
    }
}

#[async_trait]
impl ServerTransport for MockServer {
    fn protocol(&self) -> Protocol {
        Protocol::Tcp
    }

    fn describe(&self) -> String {
        "MockServer".to_string()
    }

    async fn start_listen(&mut self, _timeout: Option<Duration>) -> ListenOutcome {
        let mut state = self.state.lock();
        state.listen_attempts.push(Instant::now());
        state
            .listen_script
            .pop_front()
            .unwrap_or(ListenOutcome::Listening)
    }

    fn disconnect(&mut self, client: ClientId) {
        let mut state = self.state.lock();
        if state.clients.remove(&client).is_some() {
            state.kicked.push(client);
            self.pending.push_back(ServerEvent::Disconnected(client));
        }
    }

    fn clients(&self) -> Vec<ClientId> {
        self.state.lock().clients.keys().copied().collect()
    }

    fn client_address(&self, client: ClientId) -> Option<SocketAddr> {
        self.state.lock().clients.get(&client).copied()
    }

    fn send(&mut self, client: ClientId, data: &[u8]) -> AvResult<()> {
        let mut state = self.state.lock();
        if !state.clients.contains_key(&client) {
            return Err(AvError::NotConnected);
        }
        state.sent.push((client, Bytes::copy_from_slice(data)));
        Ok(())
    }

    async fn next_event(&mut self) -> ServerEvent {
        if let Some(event) = self.pending.pop_front() {
            return event;
        }
        match self.events.recv().await {
            Some(event) => event,
            None => std::future::pending().await,
        }
    }
}
