//! In-process signaling for tests
//!
//! `SignalBroker` is an explicit registry shared by every
//! `InMemorySignalManager` created from it. It plays the role of a signaling
//! server: topic membership, message relay and offer relay.

use super::{Answer, SignalEvent, SignalManager, SignalMessage, SwarmEvent};
use crate::error::SignalError;
use crate::keys::{PeerId, Topic};
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tracing::debug;

#[derive(Default)]
struct BrokerState {
    /// topic -> peer -> owning manager
    topics: HashMap<Topic, HashMap<PeerId, u64>>,
    /// manager -> event sink
    managers: HashMap<u64, mpsc::UnboundedSender<SignalEvent>>,
}

impl BrokerState {
    fn notify(&self, manager: u64, event: SignalEvent) {
        if let Some(tx) = self.managers.get(&manager) {
            let _ = tx.send(event);
        }
    }
}

/// Shared in-memory signaling registry
#[derive(Clone, Default)]
pub struct SignalBroker {
    state: Arc<RwLock<BrokerState>>,
    next_id: Arc<AtomicU64>,
}

impl SignalBroker {
    pub fn new() -> Self {
        Self::default()
    }

    fn register(&self, tx: mpsc::UnboundedSender<SignalEvent>) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.state.write().managers.insert(id, tx);
        id
    }

    fn join(&self, manager: u64, topic: Topic, peer_id: PeerId) {
        let mut state = self.state.write();
        let members = state.topics.entry(topic).or_default();
        if members.insert(peer_id, manager).is_some() {
            return;
        }
        let others: Vec<(PeerId, u64)> = members
            .iter()
            .filter(|(peer, _)| **peer != peer_id)
            .map(|(peer, owner)| (*peer, *owner))
            .collect();

        for (peer, owner) in others {
            state.notify(
                owner,
                SignalEvent::Swarm {
                    topic,
                    event: SwarmEvent::PeerAvailable { peer: peer_id },
                },
            );
            state.notify(
                manager,
                SignalEvent::Swarm {
                    topic,
                    event: SwarmEvent::PeerAvailable { peer },
                },
            );
        }
    }

    fn leave(&self, topic: Topic, peer_id: PeerId) {
        let mut state = self.state.write();
        let Some(members) = state.topics.get_mut(&topic) else {
            return;
        };
        if members.remove(&peer_id).is_none() {
            return;
        }
        let owners: HashSet<u64> = members.values().copied().collect();
        if members.is_empty() {
            state.topics.remove(&topic);
        }
        for owner in owners {
            state.notify(
                owner,
                SignalEvent::Swarm {
                    topic,
                    event: SwarmEvent::PeerLeft { peer: peer_id },
                },
            );
        }
    }

    fn lookup(&self, topic: &Topic) -> Vec<PeerId> {
        self.state
            .read()
            .topics
            .get(topic)
            .map(|members| members.keys().copied().collect())
            .unwrap_or_default()
    }

    fn owner_of(&self, topic: &Topic, peer: &PeerId) -> Option<u64> {
        self.state
            .read()
            .topics
            .get(topic)
            .and_then(|members| members.get(peer).copied())
    }

    fn send(&self, manager: u64, event: SignalEvent) {
        self.state.read().notify(manager, event);
    }

    fn unregister(&self, manager: u64) -> Vec<(Topic, PeerId)> {
        let owned: Vec<(Topic, PeerId)> = {
            let state = self.state.read();
            state
                .topics
                .iter()
                .flat_map(|(topic, members)| {
                    members
                        .iter()
                        .filter(|(_, owner)| **owner == manager)
                        .map(move |(peer, _)| (*topic, *peer))
                })
                .collect()
        };
        for (topic, peer) in &owned {
            self.leave(*topic, *peer);
        }
        self.state.write().managers.remove(&manager);
        owned
    }
}

/// Signal manager backed by a `SignalBroker`
pub struct InMemorySignalManager {
    broker: SignalBroker,
    id: u64,
    events: Mutex<Option<mpsc::UnboundedReceiver<SignalEvent>>>,
}

impl InMemorySignalManager {
    pub fn new(broker: SignalBroker) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = broker.register(tx);
        Self {
            broker,
            id,
            events: Mutex::new(Some(rx)),
        }
    }
}

#[async_trait]
impl SignalManager for InMemorySignalManager {
    async fn join(&self, topic: Topic, peer_id: PeerId) -> Result<(), SignalError> {
        debug!("Memory join {} as {}", topic.truncate(), peer_id.truncate());
        self.broker.join(self.id, topic, peer_id);
        Ok(())
    }

    async fn leave(&self, topic: Topic, peer_id: PeerId) -> Result<(), SignalError> {
        debug!("Memory leave {} as {}", topic.truncate(), peer_id.truncate());
        self.broker.leave(topic, peer_id);
        Ok(())
    }

    async fn lookup(&self, topic: Topic) -> Result<Vec<PeerId>, SignalError> {
        Ok(self.broker.lookup(&topic))
    }

    async fn offer(&self, message: SignalMessage) -> Result<Answer, SignalError> {
        let owner = self
            .broker
            .owner_of(&message.topic, &message.recipient)
            .ok_or_else(|| {
                SignalError::Server(format!("Peer {} not in topic", message.recipient))
            })?;
        let (responder, answer) = oneshot::channel();
        self.broker
            .send(owner, SignalEvent::Offer { message, responder });
        answer
            .await
            .map_err(|_| SignalError::Server("Offer dropped by recipient".to_string()))
    }

    async fn signal(&self, message: SignalMessage) -> Result<(), SignalError> {
        match self.broker.owner_of(&message.topic, &message.recipient) {
            Some(owner) => self.broker.send(owner, SignalEvent::Message(message)),
            None => debug!(
                "Dropping {} for absent peer {}",
                message.data.kind(),
                message.recipient.truncate()
            ),
        }
        Ok(())
    }

    fn take_events(&self) -> Option<mpsc::UnboundedReceiver<SignalEvent>> {
        self.events.lock().take()
    }

    async fn destroy(&self) {
        let left = self.broker.unregister(self.id);
        debug!("Memory signal manager {} destroyed ({} memberships)", self.id, left.len());
    }
}
