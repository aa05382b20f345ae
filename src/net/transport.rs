//! Transport boundary
//!
//! The server core never touches sockets. A [`Transport`] reports
//! connection events and inbound packets, and accepts outbound payloads for
//! a client slot. [`LoopbackTransport`] is an in-memory implementation that
//! queues scripted events and records everything sent.

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use crate::net::protocol::{self, ClientMessage, ServerMessage};

/// Index of a client slot
pub type ClientId = usize;

/// Delivery flags for an outbound message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SendFlags {
    /// Reliable, ordered delivery
    pub vital: bool,
    /// Push the message out without waiting for the next batch
    pub flush: bool,
}

impl SendFlags {
    pub const VITAL: SendFlags = SendFlags { vital: true, flush: false };
    pub const VITAL_FLUSH: SendFlags = SendFlags { vital: true, flush: true };
    pub const UNRELIABLE: SendFlags = SendFlags { vital: false, flush: false };
    pub const UNRELIABLE_FLUSH: SendFlags = SendFlags { vital: false, flush: true };
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// New connection that must complete the INFO handshake
    Connected { client: ClientId, addr: SocketAddr },
    /// New connection already authenticated by the transport
    ConnectedNoAuth { client: ClientId, addr: SocketAddr },
    /// A timed-out connection re-established on the same slot
    Rejoined { client: ClientId },
    /// Connection lost or closed by the peer
    Disconnected { client: ClientId, reason: String },
    Packet {
        client: ClientId,
        data: Vec<u8>,
        vital: bool,
    },
}

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("client {0} is not connected")]
    NotConnected(ClientId),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Encode(#[from] protocol::EncodeError),
}

pub trait Transport {
    /// Collect everything received since the last call
    fn poll(&mut self) -> Vec<TransportEvent>;

    fn send(&mut self, client: ClientId, payload: &[u8], flags: SendFlags) -> Result<(), TransportError>;

    /// Close a connection. Must not report a `Disconnected` event for it.
    fn drop_client(&mut self, client: ClientId, reason: &str);

    /// Block until data arrives or `timeout` elapses
    fn wait(&mut self, timeout: Duration);
}

/// A recorded outbound message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentMessage {
    pub client: ClientId,
    pub flags: SendFlags,
    pub message: ServerMessage,
}

#[derive(Debug, Default)]
struct LoopbackInner {
    inbound: VecDeque<TransportEvent>,
    sent: Vec<SentMessage>,
    dropped: Vec<(ClientId, String)>,
    waited: Vec<Duration>,
}

/// In-memory transport. Clones share state, so a test keeps one handle
/// while the server owns another.
#[derive(Debug, Clone, Default)]
pub struct LoopbackTransport {
    inner: Arc<Mutex<LoopbackInner>>,
}

impl LoopbackTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_event(&self, event: TransportEvent) {
        self.inner.lock().inbound.push_back(event);
    }

    pub fn connect(&self, client: ClientId, addr: SocketAddr) {
        self.push_event(TransportEvent::Connected { client, addr });
    }

    pub fn disconnect(&self, client: ClientId, reason: &str) {
        self.push_event(TransportEvent::Disconnected {
            client,
            reason: reason.to_string(),
        });
    }

    /// Queue a client message as a vital packet
    pub fn deliver(&self, client: ClientId, message: &ClientMessage) {
        self.deliver_with(client, message, true);
    }

    pub fn deliver_with(&self, client: ClientId, message: &ClientMessage, vital: bool) {
        if let Ok(data) = protocol::encode(message) {
            self.push_event(TransportEvent::Packet { client, data, vital });
        }
    }

    pub fn sent(&self) -> Vec<SentMessage> {
        self.inner.lock().sent.clone()
    }

    /// Messages sent to one client, in order
    pub fn sent_to(&self, client: ClientId) -> Vec<ServerMessage> {
        self.inner
            .lock()
            .sent
            .iter()
            .filter(|sent| sent.client == client)
            .map(|sent| sent.message.clone())
            .collect()
    }

    /// Take and clear the sent log
    pub fn take_sent(&self) -> Vec<SentMessage> {
        std::mem::take(&mut self.inner.lock().sent)
    }

    pub fn dropped(&self) -> Vec<(ClientId, String)> {
        self.inner.lock().dropped.clone()
    }

    pub fn waits(&self) -> Vec<Duration> {
        self.inner.lock().waited.clone()
    }
}

impl Transport for LoopbackTransport {
    fn poll(&mut self) -> Vec<TransportEvent> {
        self.inner.lock().inbound.drain(..).collect()
    }

    fn send(&mut self, client: ClientId, payload: &[u8], flags: SendFlags) -> Result<(), TransportError> {
        let message = protocol::decode(payload)
            .map_err(|e| TransportError::Io(std::io::Error::new(std::io::ErrorKind::InvalidData, e)))?;
        self.inner.lock().sent.push(SentMessage {
            client,
            flags,
            message,
        });
        Ok(())
    }

    fn drop_client(&mut self, client: ClientId, reason: &str) {
        self.inner.lock().dropped.push((client, reason.to_string()));
    }

    fn wait(&mut self, timeout: Duration) {
        self.inner.lock().waited.push(timeout);
    }
}
