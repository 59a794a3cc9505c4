//! Event queue shared by the tokio client transports.
//!
//! Reader tasks push into an unbounded channel tagged with the generation of
//! the link they serve. Each reconnect opens a new generation, so a reader
//! from a link that was already torn down can never report data or a
//! disconnect against its successor.

use super::{Delimiter, TransportEvent};
use bytes::{Bytes, BytesMut};
use std::collections::VecDeque;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;

#[derive(Debug)]
struct Tagged {
    generation: u64,
    event: TransportEvent,
}

/// Handle given to reader and writer tasks of one link generation.
#[derive(Debug, Clone)]
pub(crate) struct InboxSender {
    tx: mpsc::UnboundedSender<Tagged>,
    generation: u64,
}

impl InboxSender {
    /// Returns false once the owning transport is gone.
    pub(crate) fn data(&self, bytes: Bytes) -> bool {
        self.push(TransportEvent::Data(bytes))
    }

    pub(crate) fn closed(&self) {
        self.push(TransportEvent::Disconnected);
    }

    fn push(&self, event: TransportEvent) -> bool {
        self.tx
            .send(Tagged {
                generation: self.generation,
                event,
            })
            .is_ok()
    }
}

#[derive(Debug)]
pub(crate) struct Inbox {
    tx: mpsc::UnboundedSender<Tagged>,
    rx: mpsc::UnboundedReceiver<Tagged>,
    pending: VecDeque<TransportEvent>,
    generation: u64,
    live: Option<u64>,
}

impl Inbox {
    pub(crate) fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            tx,
            rx,
            pending: VecDeque::new(),
            generation: 0,
            live: None,
        }
    }

    /// Start a new link generation and queue its `Connected` event.
    pub(crate) fn open(&mut self) -> InboxSender {
        self.generation += 1;
        self.live = Some(self.generation);
        self.pending.push_back(TransportEvent::Connected);
        InboxSender {
            tx: self.tx.clone(),
            generation: self.generation,
        }
    }

    /// Start a generation for a pipe that has no connect event of its own.
    pub(crate) fn open_silently(&mut self) -> InboxSender {
        let sender = self.open();
        self.pending.pop_back();
        sender
    }

    pub(crate) fn is_open(&self) -> bool {
        self.live.is_some()
    }

    /// End the live generation locally. Queues `Disconnected` if one was live.
    pub(crate) fn close(&mut self) -> bool {
        if self.live.take().is_some() {
            self.pending.push_back(TransportEvent::Disconnected);
            true
        } else {
            false
        }
    }

    pub(crate) async fn next(&mut self) -> TransportEvent {
        if let Some(event) = self.pending.pop_front() {
            return event;
        }
        loop {
            let Some(tagged) = self.rx.recv().await else {
                return std::future::pending().await;
            };
            if let Some(event) = self.accept(tagged) {
                return event;
            }
        }
    }

    fn accept(&mut self, tagged: Tagged) -> Option<TransportEvent> {
        if self.live != Some(tagged.generation) {
            return None;
        }
        if tagged.event == TransportEvent::Disconnected {
            self.live = None;
        }
        Some(tagged.event)
    }

    /// Gather a response for `send_and_wait`.
    ///
    /// Data already queued for `next()` is consumed first. Link events seen
    /// while waiting are kept for `next()`. Bytes past the delimiter, or
    /// everything gathered when no delimited response completes, go back to
    /// the front of the queue as one data event.
    pub(crate) async fn collect(
        &mut self,
        timeout: Duration,
        delimiter: Option<&Delimiter>,
    ) -> Bytes {
        let deadline = Instant::now() + timeout;
        let mut buffer = BytesMut::new();
        let mut closed = false;

        let mut kept = VecDeque::with_capacity(self.pending.len());
        for event in self.pending.drain(..) {
            match event {
                TransportEvent::Data(bytes) => buffer.extend_from_slice(&bytes),
                event => {
                    closed |= event == TransportEvent::Disconnected;
                    kept.push_back(event);
                }
            }
        }
        self.pending = kept;

        if let Some(response) = self.split_response(&mut buffer, delimiter) {
            return response;
        }

        while !closed {
            let tagged = match tokio::time::timeout_at(deadline, self.rx.recv()).await {
                Ok(Some(tagged)) => tagged,
                Ok(None) | Err(_) => break,
            };
            match self.accept(tagged) {
                Some(TransportEvent::Data(bytes)) => {
                    buffer.extend_from_slice(&bytes);
                    if let Some(response) = self.split_response(&mut buffer, delimiter) {
                        return response;
                    }
                }
                Some(event) => {
                    closed = event == TransportEvent::Disconnected;
                    self.pending.push_back(event);
                }
                None => {}
            }
        }

        if delimiter.is_none() {
            return buffer.freeze();
        }
        if !buffer.is_empty() {
            self.pending.push_front(TransportEvent::Data(buffer.freeze()));
        }
        Bytes::new()
    }

    /// Cut the first complete response off `buffer`, requeueing the rest.
    fn split_response(&mut self, buffer: &mut BytesMut, delimiter: Option<&Delimiter>) -> Option<Bytes> {
        let end = delimiter?.find_end(buffer)?;
        let response = buffer.split_to(end).freeze();
        if !buffer.is_empty() {
            self.pending.push_front(TransportEvent::Data(buffer.split().freeze()));
        }
        Some(response)
    }
}
