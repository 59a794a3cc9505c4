//! Shared UDP socket with per-device routing.
//!
//! Some devices (VISCA-over-IP cameras) answer on a fixed well-known port, so
//! every device of that kind shares one local socket. The [`UdpDispatcher`]
//! owns that socket and routes each inbound datagram to the endpoint
//! registered for the sender's IP address. It is created once at startup and
//! handed by reference to whatever builds the endpoints.

use super::inbox::{Inbox, InboxSender};
use super::{ClientTransport, ConnectOutcome, Delimiter, Protocol, TransportEvent};
use crate::error::{AvError, AvResult};
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Local port VISCA-over-IP replies arrive on.
pub const VISCA_PORT: u16 = 52381;

type Routes = Arc<RwLock<HashMap<IpAddr, InboxSender>>>;

/// Routes datagrams from one shared socket to registered endpoints.
#[derive(Debug)]
pub struct UdpDispatcher {
    socket: Arc<UdpSocket>,
    routes: Routes,
    task: JoinHandle<()>,
}

impl UdpDispatcher {
    /// Bind the shared socket on `port` and start routing.
    pub async fn bind(port: u16) -> AvResult<Self> {
        let socket = Arc::new(UdpSocket::bind(("0.0.0.0", port)).await?);
        info!(local = %socket.local_addr()?, "UDP dispatch started");

        let routes: Routes = Arc::new(RwLock::new(HashMap::new()));
        let task = tokio::spawn(dispatch_loop(Arc::clone(&socket), Arc::clone(&routes)));
        Ok(Self {
            socket,
            routes,
            task,
        })
    }

    /// Local address of the shared socket.
    pub fn local_addr(&self) -> AvResult<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    /// Register an endpoint for `remote`. One endpoint per IP address.
    ///
    /// Spawns the endpoint's writer task, so it must run inside a tokio runtime.
    pub fn endpoint(&self, remote: SocketAddr) -> AvResult<DispatchedUdp> {
        let mut routes = self.routes.write();
        if routes.contains_key(&remote.ip()) {
            return Err(AvError::Configuration(format!(
                "a device is already registered for {}",
                remote.ip()
            )));
        }
        let mut inbox = Inbox::new();
        routes.insert(remote.ip(), inbox.open_silently());
        debug!(%remote, "UDP endpoint registered");

        // Ends once the endpoint drops its sender and the queue is flushed.
        let (writer, mut outgoing) = mpsc::unbounded_channel::<Bytes>();
        let socket = Arc::clone(&self.socket);
        tokio::spawn(async move {
            while let Some(datagram) = outgoing.recv().await {
                if let Err(err) = socket.send_to(&datagram, remote).await {
                    debug!(%remote, %err, "UDP send failed");
                }
            }
        });

        Ok(DispatchedUdp {
            remote,
            writer,
            routes: Arc::clone(&self.routes),
            inbox,
        })
    }

    /// Number of registered endpoints.
    #[must_use]
    pub fn registered(&self) -> usize {
        self.routes.read().len()
    }
}

impl Drop for UdpDispatcher {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn dispatch_loop(socket: Arc<UdpSocket>, routes: Routes) {
    let mut buf = vec![0u8; 2048];
    loop {
        let (n, from) = match socket.recv_from(&mut buf).await {
            Ok(received) => received,
            Err(err) => {
                debug!(%err, "UDP dispatch receive error");
                continue;
            }
        };
        let route = routes.read().get(&from.ip()).cloned();
        match route {
            Some(sender) => {
                sender.data(Bytes::copy_from_slice(&buf[..n]));
            }
            None => warn!(%from, "datagram from unknown device"),
        }
    }
}

/// Endpoint sending from the dispatcher's socket to one remote device.
#[derive(Debug)]
pub struct DispatchedUdp {
    remote: SocketAddr,
    writer: mpsc::UnboundedSender<Bytes>,
    routes: Routes,
    inbox: Inbox,
}

impl DispatchedUdp {
    /// Remote device address.
    #[must_use]
    pub fn remote(&self) -> SocketAddr {
        self.remote
    }
}

impl Drop for DispatchedUdp {
    fn drop(&mut self) {
        self.routes.write().remove(&self.remote.ip());
    }
}

#[async_trait]
impl ClientTransport for DispatchedUdp {
    fn protocol(&self) -> Protocol {
        Protocol::Udp
    }

    fn describe(&self) -> String {
        format!("DispatchedUdp({})", self.remote)
    }

    async fn connect(&mut self, _timeout: Option<Duration>) -> ConnectOutcome {
        ConnectOutcome::AlreadyConnected
    }

    fn disconnect(&mut self) {}

    fn send(&mut self, data: &[u8]) -> AvResult<()> {
        self.writer
            .send(Bytes::copy_from_slice(data))
            .map_err(|_| AvError::NotConnected)
    }

    async fn send_and_wait(
        &mut self,
        data: &[u8],
        timeout: Duration,
        delimiter: Option<&Delimiter>,
    ) -> AvResult<Bytes> {
        self.send(data)?;
        Ok(self.inbox.collect(timeout, delimiter).await)
    }

    async fn next_event(&mut self) -> TransportEvent {
        self.inbox.next().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn routes_by_source_address() {
        let dispatcher = UdpDispatcher::bind(0).await.unwrap();
        let shared = dispatcher.local_addr().unwrap();
        let shared = SocketAddr::from(([127, 0, 0, 1], shared.port()));

        let camera = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let mut endpoint = dispatcher.endpoint(camera.local_addr().unwrap()).unwrap();
        assert_eq!(dispatcher.registered(), 1);

        endpoint.send(b"\x81\x09\x04\x00\xff").unwrap();
        let mut buf = [0u8; 16];
        let (n, from) = camera.recv_from(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"\x81\x09\x04\x00\xff");
        assert_eq!(from.port(), shared.port());

        camera.send_to(b"\x90\x50\x02\xff", shared).await.unwrap();
        assert_eq!(
            endpoint.next_event().await,
            TransportEvent::Data(Bytes::from_static(b"\x90\x50\x02\xff"))
        );
    }

    #[tokio::test]
    async fn rejects_duplicate_registration_until_dropped() {
        let dispatcher = UdpDispatcher::bind(0).await.unwrap();
        let remote: SocketAddr = "127.0.0.1:52381".parse().unwrap();

        let first = dispatcher.endpoint(remote).unwrap();
        assert!(matches!(
            dispatcher.endpoint(remote),
            Err(AvError::Configuration(_))
        ));
        drop(first);
        assert_eq!(dispatcher.registered(), 0);
        assert!(dispatcher.endpoint(remote).is_ok());
    }

    #[tokio::test]
    async fn first_packets_of_a_new_endpoint_are_sent() {
        let dispatcher = UdpDispatcher::bind(0).await.unwrap();
        let camera = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let mut endpoint = dispatcher.endpoint(camera.local_addr().unwrap()).unwrap();

        endpoint.send(&[0x02, 0x00, 0x00, 0x01, 0, 0, 0, 0, 0x01]).unwrap();
        endpoint.send(b"\x81\x09\x04\x00\xff").unwrap();

        let mut buf = [0u8; 16];
        let (n, _) = tokio::time::timeout(Duration::from_secs(5), camera.recv_from(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&buf[..n], [0x02, 0x00, 0x00, 0x01, 0, 0, 0, 0, 0x01]);
        let (n, _) = tokio::time::timeout(Duration::from_secs(5), camera.recv_from(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&buf[..n], b"\x81\x09\x04\x00\xff");
    }
}
