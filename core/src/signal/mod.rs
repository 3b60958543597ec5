// Signal module - peer discovery and negotiation message exchange

pub mod client;
pub mod manager;
pub mod memory;
pub mod message;
pub mod server;

use crate::error::SignalError;
use crate::keys::{PeerId, Topic};
use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};

pub use client::{CommandTrace, ReconnectBackoff, SignalClient, SignalClientState, SignalStatus};
pub use manager::WebsocketSignalManager;
pub use memory::{InMemorySignalManager, SignalBroker};
pub use message::{Answer, SignalMessage, SignalPayload, SwarmEvent, TransportSignal};
pub use server::SignalServer;

/// Event delivered by a signal manager to its single consumer
#[derive(Debug)]
pub enum SignalEvent {
    /// A peer joined or left a topic
    Swarm { topic: Topic, event: SwarmEvent },
    /// A one-way message (signal, ack, answer) addressed to us
    Message(SignalMessage),
    /// An offer waiting for our answer
    Offer {
        message: SignalMessage,
        responder: oneshot::Sender<Answer>,
    },
}

/// Fans signaling operations out to one or more signaling backends
#[async_trait]
pub trait SignalManager: Send + Sync {
    /// Announce `peer_id` in `topic`. Peers already present are reported
    /// through `SignalEvent::Swarm` events.
    async fn join(&self, topic: Topic, peer_id: PeerId) -> Result<(), SignalError>;

    async fn leave(&self, topic: Topic, peer_id: PeerId) -> Result<(), SignalError>;

    /// Peers currently announced in `topic`
    async fn lookup(&self, topic: Topic) -> Result<Vec<PeerId>, SignalError>;

    /// Deliver an offer and wait for the recipient's answer
    async fn offer(&self, message: SignalMessage) -> Result<Answer, SignalError>;

    /// Deliver a one-way message
    async fn signal(&self, message: SignalMessage) -> Result<(), SignalError>;

    /// Event stream; can be taken exactly once
    fn take_events(&self) -> Option<mpsc::UnboundedReceiver<SignalEvent>>;

    async fn destroy(&self);
}
