//! TCP client transport.

use super::inbox::{Inbox, InboxSender};
use super::{
    ClientTransport, ConnectOutcome, Delimiter, Protocol, TransportEvent, DEFAULT_CONNECT_TIMEOUT,
};
use crate::error::{AvError, AvResult};
use async_trait::async_trait;
use bytes::Bytes;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info};

const READ_CHUNK: usize = 4096;

/// Outbound TCP link with reader and writer tasks.
///
/// Not connected at construction; the handler calls
/// [`connect`](ClientTransport::connect).
#[derive(Debug)]
pub struct TcpClient {
    host: String,
    port: u16,
    inbox: Inbox,
    writer: Option<mpsc::UnboundedSender<Bytes>>,
    tasks: Vec<JoinHandle<()>>,
}

impl TcpClient {
    /// Create a client for `host:port`.
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            inbox: Inbox::new(),
            writer: None,
            tasks: Vec::new(),
        }
    }

    /// Remote host name or address.
    #[must_use]
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Remote port.
    #[must_use]
    pub fn port(&self) -> u16 {
        self.port
    }

    fn teardown(&mut self) {
        self.writer = None;
        for task in self.tasks.drain(..) {
            task.abort();
        }
    }
}

impl Drop for TcpClient {
    fn drop(&mut self) {
        self.teardown();
    }
}

/// Spawn the reader and writer tasks of one link generation.
///
/// Shared by every byte-stream transport.
pub(crate) fn spawn_link<R, W>(
    mut reader: R,
    mut writer: W,
    sender: InboxSender,
) -> (mpsc::UnboundedSender<Bytes>, Vec<JoinHandle<()>>)
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (tx, mut rx) = mpsc::unbounded_channel::<Bytes>();

    let read_sender = sender.clone();
    let read_task = tokio::spawn(async move {
        let mut buf = vec![0u8; READ_CHUNK];
        loop {
            match reader.read(&mut buf).await {
                Ok(0) => {
                    debug!("peer closed the link");
                    read_sender.closed();
                    break;
                }
                Ok(n) => {
                    if !read_sender.data(Bytes::copy_from_slice(&buf[..n])) {
                        break;
                    }
                }
                Err(err) => {
                    debug!(%err, "read failed");
                    read_sender.closed();
                    break;
                }
            }
        }
    });

    let write_task = tokio::spawn(async move {
        while let Some(bytes) = rx.recv().await {
            if let Err(err) = writer.write_all(&bytes).await {
                debug!(%err, "write failed");
                sender.closed();
                break;
            }
        }
    });

    (tx, vec![read_task, write_task])
}

#[async_trait]
impl ClientTransport for TcpClient {
    fn protocol(&self) -> Protocol {
        Protocol::Tcp
    }

    fn describe(&self) -> String {
        format!("TcpClient({}:{})", self.host, self.port)
    }

    async fn connect(&mut self, timeout: Option<Duration>) -> ConnectOutcome {
        if self.inbox.is_open() {
            return ConnectOutcome::AlreadyConnected;
        }
        self.teardown();

        let address = format!("{}:{}", self.host, self.port);
        let timeout = timeout.unwrap_or(DEFAULT_CONNECT_TIMEOUT);
        let stream = match tokio::time::timeout(timeout, TcpStream::connect(&address)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(err)) => return ConnectOutcome::Failed(err.to_string()),
            Err(_) => return ConnectOutcome::Failed("Timeout".to_string()),
        };
        if let Err(err) = stream.set_nodelay(true) {
            debug!(%err, "could not disable Nagle");
        }

        info!(%address, "TCP link established");
        let (reader, writer) = stream.into_split();
        let sender = self.inbox.open();
        let (tx, tasks) = spawn_link(reader, writer, sender);
        self.writer = Some(tx);
        self.tasks = tasks;
        ConnectOutcome::Connected
    }

    fn disconnect(&mut self) {
        self.teardown();
        if self.inbox.close() {
            info!(host = %self.host, port = self.port, "TCP link closed");
        }
    }

    fn send(&mut self, data: &[u8]) -> AvResult<()> {
        if !self.inbox.is_open() {
            return Err(AvError::NotConnected);
        }
        let writer = self.writer.as_ref().ok_or(AvError::NotConnected)?;
        writer
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
        let event = self.inbox.next().await;
        if event == TransportEvent::Disconnected {
            self.teardown();
        }
        event
    }
}
