//! TCP server transport.

use super::{ClientId, ListenOutcome, Protocol, ServerEvent, ServerTransport};
use crate::error::{AvError, AvResult};
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::{BTreeMap, VecDeque};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

#[derive(Debug)]
struct ClientLink {
    address: SocketAddr,
    writer: mpsc::UnboundedSender<Bytes>,
    reader: JoinHandle<()>,
}

impl ClientLink {
    /// Stop reading. The writer task flushes what is queued, then closes
    /// the socket.
    fn close(self) {
        self.reader.abort();
    }
}

#[derive(Debug)]
enum Signal {
    Accepted(ClientId, ClientLink),
    Closed(ClientId),
    Data(ClientId, Bytes),
}

/// Listening TCP endpoint. Each accepted client gets its own reader and
/// writer task; the client table is only touched from `next_event` and the
/// handler-facing methods.
#[derive(Debug)]
pub struct TcpServer {
    bind_ip: IpAddr,
    port: u16,
    local_addr: Option<SocketAddr>,
    signals_tx: mpsc::UnboundedSender<Signal>,
    signals_rx: mpsc::UnboundedReceiver<Signal>,
    pending: VecDeque<ServerEvent>,
    clients: BTreeMap<ClientId, ClientLink>,
    /// Last id handed out. Survives re-listening, so ids are never reused.
    last_id: Arc<AtomicU64>,
    accept_task: Option<JoinHandle<()>>,
}

impl TcpServer {
    /// Server on all interfaces. Nothing is bound until `start_listen`.
    pub fn new(port: u16) -> Self {
        Self::bind_to(IpAddr::V4(Ipv4Addr::UNSPECIFIED), port)
    }

    /// Server on a specific interface.
    pub fn bind_to(bind_ip: IpAddr, port: u16) -> Self {
        let (signals_tx, signals_rx) = mpsc::unbounded_channel();
        Self {
            bind_ip,
            port,
            local_addr: None,
            signals_tx,
            signals_rx,
            pending: VecDeque::new(),
            clients: BTreeMap::new(),
            last_id: Arc::new(AtomicU64::new(0)),
            accept_task: None,
        }
    }

    /// Bound address once listening. Useful with port 0.
    #[must_use]
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    fn listening(&self) -> bool {
        self.accept_task
            .as_ref()
            .is_some_and(|task| !task.is_finished())
    }

    fn apply(&mut self, signal: Signal) -> Option<ServerEvent> {
        match signal {
            Signal::Accepted(id, link) => {
                info!(client = %id, address = %link.address, "client connected");
                self.clients.insert(id, link);
                Some(ServerEvent::Connected(id))
            }
            Signal::Closed(id) => {
                let link = self.clients.remove(&id)?;
                info!(client = %id, address = %link.address, "client disconnected");
                link.close();
                Some(ServerEvent::Disconnected(id))
            }
            Signal::Data(id, bytes) => self
                .clients
                .contains_key(&id)
                .then_some(ServerEvent::Data(id, bytes)),
        }
    }
}

impl Drop for TcpServer {
    fn drop(&mut self) {
        if let Some(task) = self.accept_task.take() {
            task.abort();
        }
        for (_, link) in std::mem::take(&mut self.clients) {
            link.close();
        }
    }
}

async fn accept_loop(
    listener: TcpListener,
    last_id: Arc<AtomicU64>,
    signals: mpsc::UnboundedSender<Signal>,
) {
    loop {
        let (stream, address) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(err) => {
                warn!(%err, "accept failed");
                continue;
            }
        };
        let id = ClientId(last_id.fetch_add(1, Ordering::Relaxed) + 1);
        let link = spawn_client(id, stream, address, signals.clone());
        if signals.send(Signal::Accepted(id, link)).is_err() {
            break;
        }
    }
}

fn spawn_client(
    id: ClientId,
    stream: TcpStream,
    address: SocketAddr,
    signals: mpsc::UnboundedSender<Signal>,
) -> ClientLink {
    let (mut reader, mut writer) = stream.into_split();
    let (tx, mut rx) = mpsc::unbounded_channel::<Bytes>();

    let read_signals = signals.clone();
    let read_task = tokio::spawn(async move {
        let mut buf = vec![0u8; 4096];
        loop {
            match reader.read(&mut buf).await {
                Ok(0) | Err(_) => {
                    let _ = read_signals.send(Signal::Closed(id));
                    break;
                }
                Ok(n) => {
                    let data = Bytes::copy_from_slice(&buf[..n]);
                    if read_signals.send(Signal::Data(id, data)).is_err() {
                        break;
                    }
                }
            }
        }
    });

    tokio::spawn(async move {
        while let Some(bytes) = rx.recv().await {
            if let Err(err) = writer.write_all(&bytes).await {
                debug!(client = %id, %err, "write failed");
                let _ = signals.send(Signal::Closed(id));
                break;
            }
        }
    });

    ClientLink {
        address,
        writer: tx,
        reader: read_task,
    }
}

#[async_trait]
impl ServerTransport for TcpServer {
    fn protocol(&self) -> Protocol {
        Protocol::Tcp
    }

    fn describe(&self) -> String {
        format!("TcpServer({}:{})", self.bind_ip, self.port)
    }

    async fn start_listen(&mut self, timeout: Option<Duration>) -> ListenOutcome {
        if self.listening() {
            return ListenOutcome::Listening;
        }
        let listener = match TcpListener::bind((self.bind_ip, self.port)).await {
            Ok(listener) => listener,
            Err(err) => return ListenOutcome::Failed(err.to_string()),
        };
        self.local_addr = listener.local_addr().ok();
        info!(address = ?self.local_addr, "listening");

        let signals = self.signals_tx.clone();
        let last_id = Arc::clone(&self.last_id);
        let task = match timeout.filter(|t| !t.is_zero()) {
            Some(limit) => tokio::spawn(async move {
                let _ = tokio::time::timeout(limit, accept_loop(listener, last_id, signals)).await;
            }),
            None => tokio::spawn(accept_loop(listener, last_id, signals)),
        };
        self.accept_task = Some(task);
        ListenOutcome::Listening
    }

    fn disconnect(&mut self, client: ClientId) {
        if let Some(link) = self.clients.remove(&client) {
            info!(%client, address = %link.address, "disconnecting client");
            link.close();
            self.pending.push_back(ServerEvent::Disconnected(client));
        }
    }

    fn clients(&self) -> Vec<ClientId> {
        self.clients.keys().copied().collect()
    }

    fn client_address(&self, client: ClientId) -> Option<SocketAddr> {
        self.clients.get(&client).map(|link| link.address)
    }

    fn send(&mut self, client: ClientId, data: &[u8]) -> AvResult<()> {
        let link = self.clients.get(&client).ok_or(AvError::NotConnected)?;
        link.writer
            .send(Bytes::copy_from_slice(data))
            .map_err(|_| AvError::NotConnected)
    }

    async fn next_event(&mut self) -> ServerEvent {
        if let Some(event) = self.pending.pop_front() {
            return event;
        }
        loop {
            let Some(signal) = self.signals_rx.recv().await else {
                return std::future::pending().await;
            };
            if let Some(event) = self.apply(signal) {
                return event;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn listening_server() -> (TcpServer, SocketAddr) {
        let mut server = TcpServer::bind_to(IpAddr::V4(Ipv4Addr::LOCALHOST), 0);
        assert_eq!(server.start_listen(None).await, ListenOutcome::Listening);
        let addr = server.local_addr().unwrap();
        (server, addr)
    }

    #[tokio::test]
    async fn tracks_clients_and_data() {
        let (mut server, addr) = listening_server().await;
        let mut peer = TcpStream::connect(addr).await.unwrap();

        let ServerEvent::Connected(id) = server.next_event().await else {
            panic!("expected a connection");
        };
        assert_eq!(server.clients(), vec![id]);
        assert!(server.client_address(id).is_some());

        peer.write_all(b"hello").await.unwrap();
        assert_eq!(
            server.next_event().await,
            ServerEvent::Data(id, Bytes::from_static(b"hello"))
        );

        server.send(id, b"welcome").unwrap();
        let mut buf = [0u8; 7];
        peer.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"welcome");

        drop(peer);
        assert_eq!(server.next_event().await, ServerEvent::Disconnected(id));
        assert!(server.clients().is_empty());
    }

    #[tokio::test]
    async fn local_disconnect_closes_socket() {
        let (mut server, addr) = listening_server().await;
        let mut peer = TcpStream::connect(addr).await.unwrap();
        let ServerEvent::Connected(id) = server.next_event().await else {
            panic!("expected a connection");
        };

        server.disconnect(id);
        assert_eq!(server.next_event().await, ServerEvent::Disconnected(id));
        let mut buf = [0u8; 1];
        assert_eq!(peer.read(&mut buf).await.unwrap(), 0);
        assert!(matches!(server.send(id, b"x"), Err(AvError::NotConnected)));
    }

    #[tokio::test]
    async fn bind_conflict_fails_listen() {
        let (_server, addr) = listening_server().await;
        let mut second = TcpServer::bind_to(addr.ip(), addr.port());
        assert!(matches!(
            second.start_listen(None).await,
            ListenOutcome::Failed(_)
        ));
    }

    #[tokio::test]
    async fn ids_stay_unique_across_listens() {
        let mut server = TcpServer::bind_to(IpAddr::V4(Ipv4Addr::LOCALHOST), 0);
        let window = Duration::from_millis(100);
        assert_eq!(server.start_listen(Some(window)).await, ListenOutcome::Listening);
        let _first_peer = TcpStream::connect(server.local_addr().unwrap()).await.unwrap();
        let ServerEvent::Connected(first) = server.next_event().await else {
            panic!("expected a connection");
        };

        tokio::time::sleep(window * 2).await;
        assert_eq!(server.start_listen(None).await, ListenOutcome::Listening);
        let mut second_peer = TcpStream::connect(server.local_addr().unwrap()).await.unwrap();
        let ServerEvent::Connected(second) = server.next_event().await else {
            panic!("expected a connection");
        };

        assert_ne!(first, second);
        assert_eq!(server.clients(), vec![first, second]);
        second_peer.write_all(b"hi").await.unwrap();
        assert_eq!(
            server.next_event().await,
            ServerEvent::Data(second, Bytes::from_static(b"hi"))
        );
    }
}
