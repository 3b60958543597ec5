//! Swarm mapper - read-only map of the peers around us
//!
//! Combines the swarm's direct connections with the graph reported by an
//! optional presence protocol and republishes the result on every change.

use super::Swarm;
use crate::connection::ConnectionState;
use crate::keys::PeerId;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::{Arc, Weak};
use tokio::sync::watch;
use tokio::task::JoinHandle;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "type", content = "state", rename_all = "snake_case")]
pub enum PeerState {
    /// Direct connection in the given state
    Connection(ConnectionState),
    /// Only known through the presence graph
    IndirectlyConnected,
    Me,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PeerInfo {
    pub id: PeerId,
    pub state: PeerState,
    pub connections: Vec<PeerId>,
}

/// Indirect view of the peer graph, e.g. from a presence protocol
pub trait PresenceProvider: Send + Sync {
    fn peer_id(&self) -> PeerId;

    /// Each known peer with the peers it reports being connected to
    fn graph(&self) -> Vec<(PeerId, Vec<PeerId>)>;

    /// Bumped whenever `graph` changes
    fn subscribe(&self) -> watch::Receiver<u64>;
}

pub struct SwarmMapper {
    peers: watch::Sender<Vec<PeerInfo>>,
    task: JoinHandle<()>,
}

impl SwarmMapper {
    pub fn new(swarm: &Arc<Swarm>, presence: Option<Arc<dyn PresenceProvider>>) -> Self {
        let (peers, _) = watch::channel(build_map(swarm, presence.as_deref()));
        let task = tokio::spawn(track(
            Arc::downgrade(swarm),
            swarm.subscribe_changes(),
            presence,
            peers.clone(),
        ));
        Self { peers, task }
    }

    /// Current snapshot; our own entry comes first
    pub fn peers(&self) -> Vec<PeerInfo> {
        self.peers.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<Vec<PeerInfo>> {
        self.peers.subscribe()
    }

    pub fn destroy(&self) {
        self.task.abort();
    }
}

impl Drop for SwarmMapper {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn track(
    swarm: Weak<Swarm>,
    mut changes: watch::Receiver<u64>,
    presence: Option<Arc<dyn PresenceProvider>>,
    peers: watch::Sender<Vec<PeerInfo>>,
) {
    let mut presence_changes = presence.as_ref().map(|p| p.subscribe());
    loop {
        let changed = match presence_changes.as_mut() {
            Some(presence_rx) => tokio::select! {
                r = changes.changed() => r.is_ok(),
                r = presence_rx.changed() => r.is_ok(),
            },
            None => changes.changed().await.is_ok(),
        };
        let Some(swarm) = swarm.upgrade() else {
            break;
        };
        if !changed {
            break;
        }
        let map = build_map(&swarm, presence.as_deref());
        peers.send_if_modified(|current| {
            if *current == map {
                false
            } else {
                *current = map;
                true
            }
        });
    }
}

pub(crate) fn build_map(swarm: &Swarm, presence: Option<&dyn PresenceProvider>) -> Vec<PeerInfo> {
    let own = swarm.own_peer_id();
    let graph: BTreeMap<PeerId, Vec<PeerId>> = presence
        .map(|p| p.graph().into_iter().collect())
        .unwrap_or_default();

    let connections = swarm.connections();
    let mut peers = vec![PeerInfo {
        id: own,
        state: PeerState::Me,
        connections: connections.iter().map(|c| c.remote_id()).collect(),
    }];

    for connection in &connections {
        let id = connection.remote_id();
        peers.push(PeerInfo {
            id,
            state: PeerState::Connection(connection.state()),
            connections: graph.get(&id).cloned().unwrap_or_else(|| vec![own]),
        });
    }

    let mut indirect: BTreeMap<PeerId, Vec<PeerId>> = BTreeMap::new();
    for (peer, neighbors) in &graph {
        for id in std::iter::once(peer).chain(neighbors) {
            if peers.iter().any(|p| p.id == *id) {
                continue;
            }
            let entry = indirect.entry(*id).or_default();
            if id == peer {
                *entry = neighbors.clone();
            }
        }
    }
    peers.extend(indirect.into_iter().map(|(id, connections)| PeerInfo {
        id,
        state: PeerState::IndirectlyConnected,
        connections,
    }));
    peers
}
