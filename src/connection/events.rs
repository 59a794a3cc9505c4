//! Status event surface shared by the handler variants.
//!
//! Every event is a single callback slot. A callback receives the handler
//! itself, so it can send, toggle auto-reconnect or install a different
//! callback for its own slot while it runs.

use super::ConnectionStatus;
use crate::transport::ClientId;
use bytes::Bytes;

/// Callback stored in an event slot.
pub type Callback<H, V> = Box<dyn FnMut(&mut H, V) + Send>;

/// Event slots of client handlers.
pub struct ClientEvents<H> {
    pub(crate) connected: Option<Callback<H, ConnectionStatus>>,
    pub(crate) disconnected: Option<Callback<H, ConnectionStatus>>,
    pub(crate) connect_failed: Option<Callback<H, String>>,
    pub(crate) receive_data: Option<Callback<H, Bytes>>,
}

impl<H> Default for ClientEvents<H> {
    fn default() -> Self {
        Self {
            connected: None,
            disconnected: None,
            connect_failed: None,
            receive_data: None,
        }
    }
}

impl<H> std::fmt::Debug for ClientEvents<H> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientEvents")
            .field("connected", &self.connected.is_some())
            .field("disconnected", &self.disconnected.is_some())
            .field("connect_failed", &self.connect_failed.is_some())
            .field("receive_data", &self.receive_data.is_some())
            .finish()
    }
}

/// Event slots of the server handler.
pub struct ServerEvents<H> {
    pub(crate) connected: Option<Callback<H, ClientId>>,
    pub(crate) disconnected: Option<Callback<H, ClientId>>,
    pub(crate) receive_data: Option<Callback<H, (ClientId, Bytes)>>,
    pub(crate) listen_failed: Option<Callback<H, String>>,
}

impl<H> Default for ServerEvents<H> {
    fn default() -> Self {
        Self {
            connected: None,
            disconnected: None,
            receive_data: None,
            listen_failed: None,
        }
    }
}

impl<H> std::fmt::Debug for ServerEvents<H> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerEvents")
            .field("connected", &self.connected.is_some())
            .field("disconnected", &self.disconnected.is_some())
            .field("receive_data", &self.receive_data.is_some())
            .field("listen_failed", &self.listen_failed.is_some())
            .finish()
    }
}

/// Invoke an event slot with the handler.
///
/// The callback is taken out of its slot while it runs and put back
/// afterwards unless it installed a replacement.
macro_rules! fire {
    ($handler:expr, $slot:ident, $value:expr) => {{
        if let Some(mut callback) = $handler.events.$slot.take() {
            callback(&mut *$handler, $value);
            if $handler.events.$slot.is_none() {
                $handler.events.$slot = Some(callback);
            }
        }
    }};
}
pub(crate) use fire;

/// Setters for the client event slots.
macro_rules! client_event_setters {
    () => {
        /// Called with `Connected` whenever the status changes to it.
        pub fn on_connected<F>(&mut self, callback: F)
        where
            F: FnMut(&mut Self, ConnectionStatus) + Send + 'static,
        {
            self.events.connected = Some(Box::new(callback));
        }

        /// Called with `Disconnected` whenever the status changes to it.
        pub fn on_disconnected<F>(&mut self, callback: F)
        where
            F: FnMut(&mut Self, ConnectionStatus) + Send + 'static,
        {
            self.events.disconnected = Some(Box::new(callback));
        }

        /// Called with the transport's reason after each failed connect
        /// attempt. Only stream links attempt connections.
        pub fn on_connect_failed<F>(&mut self, callback: F)
        where
            F: FnMut(&mut Self, String) + Send + 'static,
        {
            self.events.connect_failed = Some(Box::new(callback));
        }

        /// Called with every chunk of received bytes.
        pub fn on_receive_data<F>(&mut self, callback: F)
        where
            F: FnMut(&mut Self, bytes::Bytes) + Send + 'static,
        {
            self.events.receive_data = Some(Box::new(callback));
        }
    };
}
pub(crate) use client_event_setters;

/// Status holder that suppresses same-value transitions.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct StatusCell {
    status: ConnectionStatus,
}

impl StatusCell {
    pub(crate) fn get(self) -> ConnectionStatus {
        self.status
    }

    /// Store `status`; true when it differs from the previous value.
    pub(crate) fn set(&mut self, status: ConnectionStatus) -> bool {
        if self.status == status {
            false
        } else {
            self.status = status;
            true
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Probe {
        events: ClientEvents<Probe>,
        seen: Vec<String>,
    }

    #[test]
    fn status_cell_reports_changes_only() {
        let mut cell = StatusCell::default();
        assert_eq!(cell.get(), ConnectionStatus::Unknown);
        assert!(cell.set(ConnectionStatus::Connected));
        assert!(!cell.set(ConnectionStatus::Connected));
        assert!(cell.set(ConnectionStatus::Disconnected));
    }

    #[test]
    fn callback_is_restored_after_firing() {
        let mut probe = Probe {
            events: ClientEvents::default(),
            seen: Vec::new(),
        };
        probe.events.connect_failed = Some(Box::new(|p: &mut Probe, reason| p.seen.push(reason)));

        let handler = &mut probe;
        fire!(handler, connect_failed, "first".to_string());
        fire!(handler, connect_failed, "second".to_string());
        assert_eq!(probe.seen, vec!["first", "second"]);
    }

    #[test]
    fn callback_can_replace_itself() {
        let mut probe = Probe {
            events: ClientEvents::default(),
            seen: Vec::new(),
        };
        probe.events.connect_failed = Some(Box::new(|p: &mut Probe, _| {
            p.events.connect_failed = Some(Box::new(|p: &mut Probe, reason| {
                p.seen.push(format!("replacement {reason}"));
            }));
        }));

        let handler = &mut probe;
        fire!(handler, connect_failed, "a".to_string());
        fire!(handler, connect_failed, "b".to_string());
        assert_eq!(probe.seen, vec!["replacement b"]);
    }
}
