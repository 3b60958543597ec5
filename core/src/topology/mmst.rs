//! MMST topology: bounded-degree mesh built from XOR-close peers
//!
//! Each peer originates a few connections to the closest peers out of a
//! random sample and refuses offers once it reaches `max_peers`. Peers above
//! the bound drop their farthest connections.

use super::{SwarmController, Topology};
use crate::keys::PeerId;
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;

/// Minimum time between two lookups requested by the topology
pub const MIN_LOOKUP_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MmstConfig {
    /// Connections this peer opens on its own
    pub originate_connections: usize,
    /// Upper bound on connections, including accepted ones
    pub max_peers: usize,
    /// Number of candidates considered per update
    pub sample_size: usize,
}

impl Default for MmstConfig {
    fn default() -> Self {
        Self {
            originate_connections: 2,
            max_peers: 4,
            sample_size: 10,
        }
    }
}

pub struct MmstTopology {
    config: MmstConfig,
    controller: Option<Arc<dyn SwarmController>>,
    last_lookup: Option<Instant>,
}

impl MmstTopology {
    pub fn new(config: MmstConfig) -> Self {
        Self {
            config,
            controller: None,
            last_lookup: None,
        }
    }

    pub fn config(&self) -> &MmstConfig {
        &self.config
    }

    fn request_lookup(&mut self, controller: &Arc<dyn SwarmController>) {
        let due = self
            .last_lookup
            .map_or(true, |at| at.elapsed() >= MIN_LOOKUP_INTERVAL);
        if due {
            self.last_lookup = Some(Instant::now());
            controller.lookup();
        }
    }
}

impl Default for MmstTopology {
    fn default() -> Self {
        Self::new(MmstConfig::default())
    }
}

impl Topology for MmstTopology {
    fn init(&mut self, controller: Arc<dyn SwarmController>) {
        self.controller = Some(controller);
    }

    fn update(&mut self) {
        let Some(controller) = self.controller.clone() else {
            return;
        };
        let state = controller.get_state();
        let own = state.own_peer_id;

        if state.connected.len() > self.config.max_peers {
            let mut connected = state.connected;
            connected.sort_by_key(|peer| std::cmp::Reverse(own.distance(peer)));
            let excess = connected.len() - self.config.max_peers;
            for peer in connected.into_iter().take(excess) {
                debug!("{}: dropping far peer {}", self, peer.truncate());
                controller.disconnect(peer);
            }
        } else if state.connected.len() < self.config.originate_connections {
            let needed = self.config.originate_connections - state.connected.len();
            let mut sample: Vec<PeerId> = state
                .candidates
                .choose_multiple(&mut rand::thread_rng(), self.config.sample_size)
                .copied()
                .collect();
            sample.sort_by_key(|peer| own.distance(peer));

            if sample.len() < needed {
                self.request_lookup(&controller);
            }
            for peer in sample.into_iter().take(needed) {
                debug!("{}: connecting to {}", self, peer.truncate());
                controller.connect(peer);
            }
        }
    }

    fn on_offer(&mut self, _peer: PeerId) -> bool {
        self.controller
            .as_ref()
            .map_or(false, |c| c.get_state().connected.len() < self.config.max_peers)
    }

    fn destroy(&mut self) {
        self.controller = None;
    }
}

impl fmt::Display for MmstTopology {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "MMSTTopology(originate={}, max={}, sample={})",
            self.config.originate_connections, self.config.max_peers, self.config.sample_size
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::topology::test_support::FakeController;

    fn peers(n: usize) -> Vec<PeerId> {
        (0..n).map(|_| PeerId::random()).collect()
    }

    #[test]
    fn test_originates_to_closest() {
        let own = PeerId::random();
        let candidates = peers(8);
        let controller = FakeController::new(own, vec![], candidates.clone());
        let mut topology = MmstTopology::default();
        topology.init(controller.clone());
        topology.update();

        let mut expected = candidates;
        expected.sort_by_key(|p| own.distance(p));
        let connected = controller.get_state().connected;
        assert_eq!(connected, expected[..2].to_vec());
    }

    #[test]
    fn test_drops_farthest_above_bound() {
        let own = PeerId::random();
        let connected = peers(7);
        let controller = FakeController::new(own, connected.clone(), vec![]);
        let mut topology = MmstTopology::default();
        topology.init(controller.clone());
        topology.update();

        let mut expected = connected;
        expected.sort_by_key(|p| own.distance(p));
        let mut remaining = controller.get_state().connected;
        remaining.sort_by_key(|p| own.distance(p));
        assert_eq!(remaining, expected[..4].to_vec());
    }

    #[test]
    fn test_offer_limit() {
        let controller = FakeController::new(PeerId::random(), peers(3), vec![]);
        let mut topology = MmstTopology::default();
        assert!(!topology.on_offer(PeerId::random()));
        topology.init(controller.clone());
        assert!(topology.on_offer(PeerId::random()));
        controller.connect(PeerId::random());
        assert!(!topology.on_offer(PeerId::random()));
    }

    #[test]
    fn test_lookup_rate_limited() {
        let controller = FakeController::new(PeerId::random(), vec![], peers(1));
        let mut topology = MmstTopology::default();
        topology.init(controller.clone());
        topology.update();
        // The one candidate got connected, the second slot is still open
        topology.update();
        topology.update();
        assert_eq!(*controller.lookups.lock(), 1);
        assert_eq!(controller.get_state().connected.len(), 1);
    }
}
