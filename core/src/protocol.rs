//! Application protocol capability
//!
//! Once a connection's transport is up, the connection asks its
//! `ProtocolProvider` for a fresh `Protocol`, runs the handshake and then
//! hands the channel over to `run` until either side goes away.

use crate::error::ConnectionError;
use crate::keys::{PeerId, Topic};
use crate::transport::WireChannel;
use async_trait::async_trait;
use std::sync::Arc;
use uuid::Uuid;

/// What a protocol instance knows about the connection it serves
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProtocolContext {
    pub topic: Topic,
    pub local_peer_id: PeerId,
    pub remote_peer_id: PeerId,
    pub session_id: Uuid,
    pub initiator: bool,
}

/// One protocol instance per connection
#[async_trait]
pub trait Protocol: Send {
    /// Runs before the protocol is considered open
    async fn handshake(&mut self, channel: &mut WireChannel) -> Result<(), ConnectionError>;

    /// Serve the connection; returns when the channel closes
    async fn run(self: Box<Self>, channel: WireChannel) -> Result<(), ConnectionError>;
}

/// Creates protocol instances for new connections
pub trait ProtocolProvider: Send + Sync {
    fn create(&self, context: ProtocolContext) -> Box<dyn Protocol>;
}

impl<F> ProtocolProvider for F
where
    F: Fn(ProtocolContext) -> Box<dyn Protocol> + Send + Sync,
{
    fn create(&self, context: ProtocolContext) -> Box<dyn Protocol> {
        self(context)
    }
}

/// Provider shared by every connection of a swarm
pub type SharedProtocolProvider = Arc<dyn ProtocolProvider>;
