//! Serial port transport (feature `serial`).

use super::inbox::Inbox;
use super::tcp::spawn_link;
use super::{ClientTransport, ConnectOutcome, Delimiter, Protocol, TransportEvent};
use crate::error::{AvError, AvResult};
use async_trait::async_trait;
use bytes::Bytes;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_serial::SerialPortBuilderExt;
use tracing::info;

/// RS-232 port opened at construction. Behaves as a pipe: there is no
/// session to re-establish, and `connect` reports `AlreadyConnected`.
#[derive(Debug)]
pub struct SerialClient {
    path: String,
    baud_rate: u32,
    inbox: Inbox,
    writer: mpsc::UnboundedSender<Bytes>,
    tasks: Vec<JoinHandle<()>>,
}

impl SerialClient {
    /// Open `path` at `baud_rate`, 8N1, no flow control.
    pub fn open(path: &str, baud_rate: u32) -> AvResult<Self> {
        let port = tokio_serial::new(path, baud_rate)
            .open_native_async()
            .map_err(|err| AvError::Io(err.into()))?;
        info!(path, baud_rate, "serial port opened");

        let (reader, writer) = tokio::io::split(port);
        let mut inbox = Inbox::new();
        let sender = inbox.open_silently();
        let (writer, tasks) = spawn_link(reader, writer, sender);

        Ok(Self {
            path: path.to_string(),
            baud_rate,
            inbox,
            writer,
            tasks,
        })
    }
}

impl Drop for SerialClient {
    fn drop(&mut self) {
        for task in self.tasks.drain(..) {
            task.abort();
        }
    }
}

#[async_trait]
impl ClientTransport for SerialClient {
    fn protocol(&self) -> Protocol {
        Protocol::Serial
    }

    fn describe(&self) -> String {
        format!("SerialClient({} @ {})", self.path, self.baud_rate)
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
