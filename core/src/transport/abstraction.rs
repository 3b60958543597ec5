//! Transport abstraction layer
//!
//! A transport carries one connection attempt between two peers. It is fed
//! negotiation data through `signal`, emits its own negotiation data through
//! the `send_signal` callback, and reports progress on an event channel.

use crate::error::TransportError;
use crate::keys::{PeerId, Topic};
use crate::signal::TransportSignal;
use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;
use tokio::sync::mpsc;
use uuid::Uuid;

/// Kind of transport, used to tag log output
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportKind {
    /// WebRTC data channel
    WebRtc,
    /// Same-process transport for testing
    InMemory,
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportKind::WebRtc => write!(f, "WebRTC"),
            TransportKind::InMemory => write!(f, "InMemory"),
        }
    }
}

/// Sending half of a wire channel
#[derive(Debug, Clone)]
pub struct WireSender(mpsc::UnboundedSender<Vec<u8>>);

impl WireSender {
    pub fn send(&self, data: Vec<u8>) -> Result<(), TransportError> {
        self.0
            .send(data)
            .map_err(|_| TransportError::SendFailed("Channel closed".to_string()))
    }

    pub fn is_closed(&self) -> bool {
        self.0.is_closed()
    }
}

/// Message-oriented duplex stream handed to the application protocol
pub struct WireChannel {
    tx: WireSender,
    rx: mpsc::UnboundedReceiver<Vec<u8>>,
}

impl WireChannel {
    /// Build a channel from an outgoing sender and an incoming receiver
    pub fn from_parts(
        tx: mpsc::UnboundedSender<Vec<u8>>,
        rx: mpsc::UnboundedReceiver<Vec<u8>>,
    ) -> Self {
        Self {
            tx: WireSender(tx),
            rx,
        }
    }

    /// Two channels wired directly to each other
    pub fn pair() -> (WireChannel, WireChannel) {
        let (a_tx, a_rx) = mpsc::unbounded_channel();
        let (b_tx, b_rx) = mpsc::unbounded_channel();
        (Self::from_parts(a_tx, b_rx), Self::from_parts(b_tx, a_rx))
    }

    pub fn send(&self, data: Vec<u8>) -> Result<(), TransportError> {
        self.tx.send(data)
    }

    /// Next frame from the remote side; `None` once the transport is gone
    pub async fn recv(&mut self) -> Option<Vec<u8>> {
        self.rx.recv().await
    }

    /// Cloneable sending half, for writing from other tasks
    pub fn sender(&self) -> WireSender {
        self.tx.clone()
    }
}

impl fmt::Debug for WireChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WireChannel")
            .field("closed", &self.tx.is_closed())
            .finish()
    }
}

/// Events from a transport to its connection
#[derive(Debug)]
pub enum TransportEvent {
    /// The application stream is ready
    Connected(WireChannel),
    /// The transport is gone
    Closed,
    /// Something failed; the connection should close
    Error(TransportError),
}

impl fmt::Display for TransportEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportEvent::Connected(_) => write!(f, "Connected"),
            TransportEvent::Closed => write!(f, "Closed"),
            TransportEvent::Error(e) => write!(f, "Error({})", e),
        }
    }
}

/// Callback used by a transport to emit local negotiation data
pub type SignalSender = Arc<dyn Fn(TransportSignal) + Send + Sync>;

/// Everything a transport needs to know about its connection attempt
#[derive(Clone)]
pub struct TransportOptions {
    pub topic: Topic,
    pub own_id: PeerId,
    pub remote_id: PeerId,
    pub session_id: Uuid,
    /// Initiators create the channel and the first description
    pub initiator: bool,
    pub send_signal: SignalSender,
    pub events: mpsc::UnboundedSender<TransportEvent>,
}

impl fmt::Debug for TransportOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransportOptions")
            .field("topic", &self.topic)
            .field("own_id", &self.own_id)
            .field("remote_id", &self.remote_id)
            .field("session_id", &self.session_id)
            .field("initiator", &self.initiator)
            .finish()
    }
}

/// One connection attempt between two peers
#[async_trait]
pub trait Transport: Send + Sync {
    fn kind(&self) -> TransportKind;

    /// Start the attempt; signals fed earlier are replayed
    async fn connect(&self) -> Result<(), TransportError>;

    /// Feed negotiation data from the remote peer
    async fn signal(&self, signal: TransportSignal) -> Result<(), TransportError>;

    async fn close(&self) -> Result<(), TransportError>;
}

/// Creates a transport per connection attempt
pub trait TransportFactory: Send + Sync {
    fn create(&self, options: TransportOptions) -> Result<Arc<dyn Transport>, TransportError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transport_kind_display() {
        assert_eq!(TransportKind::WebRtc.to_string(), "WebRTC");
        assert_eq!(TransportKind::InMemory.to_string(), "InMemory");
    }

    #[tokio::test]
    async fn test_wire_channel_pair() {
        let (mut a, mut b) = WireChannel::pair();
        a.send(b"1234".to_vec()).unwrap();
        b.sender().send(b"5678".to_vec()).unwrap();
        assert_eq!(b.recv().await.unwrap(), b"1234".to_vec());
        assert_eq!(a.recv().await.unwrap(), b"5678".to_vec());

        drop(b);
        assert!(a.send(vec![1]).is_err());
        assert!(a.recv().await.is_none());
    }

    #[test]
    fn test_event_display() {
        assert_eq!(TransportEvent::Closed.to_string(), "Closed");
        assert_eq!(
            TransportEvent::Error(TransportError::Closed).to_string(),
            "Error(Transport closed)"
        );
    }
}
