//! UDP client transport.

use super::inbox::Inbox;
use super::{ClientTransport, ConnectOutcome, Delimiter, Protocol, TransportEvent};
use crate::error::{AvError, AvResult};
use async_trait::async_trait;
use bytes::Bytes;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

const MAX_DATAGRAM: usize = 65_507;

/// Connected UDP socket. Open from construction, so it behaves as a pipe:
/// `connect` reports `AlreadyConnected` and `disconnect` does nothing.
#[derive(Debug)]
pub struct UdpClient {
    remote: SocketAddr,
    socket: Arc<UdpSocket>,
    inbox: Inbox,
    writer: mpsc::UnboundedSender<Bytes>,
    reader: JoinHandle<()>,
}

impl UdpClient {
    /// Bind `local_port` (0 for any) and fix the remote peer.
    pub async fn open(remote: &str, local_port: u16) -> AvResult<Self> {
        let socket = UdpSocket::bind(("0.0.0.0", local_port)).await?;
        socket.connect(remote).await?;
        let remote = socket.peer_addr()?;
        let socket = Arc::new(socket);

        let mut inbox = Inbox::new();
        let sender = inbox.open_silently();
        let reader_socket = Arc::clone(&socket);
        let reader = tokio::spawn(async move {
            let mut buf = vec![0u8; MAX_DATAGRAM];
            loop {
                match reader_socket.recv(&mut buf).await {
                    Ok(n) => {
                        if !sender.data(Bytes::copy_from_slice(&buf[..n])) {
                            break;
                        }
                    }
                    // ICMP errors surface here per datagram; the socket stays usable.
                    Err(err) => debug!(%err, "UDP receive error"),
                }
            }
        });

        let (writer, mut outgoing) = mpsc::unbounded_channel::<Bytes>();
        let writer_socket = Arc::clone(&socket);
        tokio::spawn(async move {
            while let Some(datagram) = outgoing.recv().await {
                if let Err(err) = writer_socket.send(&datagram).await {
                    debug!(%err, "UDP send failed");
                }
            }
        });

        Ok(Self {
            remote,
            socket,
            inbox,
            writer,
            reader,
        })
    }

    /// Local address the socket is bound to.
    pub fn local_addr(&self) -> AvResult<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }
}

impl Drop for UdpClient {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

#[async_trait]
impl ClientTransport for UdpClient {
    fn protocol(&self) -> Protocol {
        Protocol::Udp
    }

    fn describe(&self) -> String {
        format!("UdpClient({})", self.remote)
    }

    async fn connect(&mut self, _timeout: Option<Duration>) -> ConnectOutcome {
        ConnectOutcome::AlreadyConnected
    }

    fn disconnect(&mut self) {
        debug!(remote = %self.remote, "disconnect ignored on connectionless transport");
    }

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
