//! Fully connected topology: connect to every peer in the swarm

use super::{SwarmController, Topology};
use crate::keys::PeerId;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::debug;

/// Interval between candidate refreshes
pub const LOOKUP_INTERVAL: Duration = Duration::from_secs(10);

#[derive(Default)]
pub struct FullyConnectedTopology {
    controller: Option<Arc<dyn SwarmController>>,
    lookup_task: Option<JoinHandle<()>>,
}

impl FullyConnectedTopology {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Topology for FullyConnectedTopology {
    fn init(&mut self, controller: Arc<dyn SwarmController>) {
        let lookup = Arc::clone(&controller);
        self.lookup_task = Some(tokio::spawn(async move {
            let mut interval = tokio::time::interval(LOOKUP_INTERVAL);
            loop {
                interval.tick().await;
                lookup.lookup();
            }
        }));
        self.controller = Some(controller);
    }

    fn update(&mut self) {
        let Some(controller) = &self.controller else {
            return;
        };
        let state = controller.get_state();
        for peer in state.candidates {
            debug!("{}: connecting to {}", self, peer.truncate());
            controller.connect(peer);
        }
    }

    fn on_offer(&mut self, _peer: PeerId) -> bool {
        true
    }

    fn destroy(&mut self) {
        if let Some(task) = self.lookup_task.take() {
            task.abort();
        }
        self.controller = None;
    }
}

impl Drop for FullyConnectedTopology {
    fn drop(&mut self) {
        self.destroy();
    }
}

impl fmt::Display for FullyConnectedTopology {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FullyConnectedTopology")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::topology::test_support::FakeController;

    #[tokio::test]
    async fn test_connects_to_all_candidates() {
        let candidates: Vec<_> = (0..5).map(|_| PeerId::random()).collect();
        let controller = FakeController::new(PeerId::random(), vec![], candidates.clone());
        let mut topology = FullyConnectedTopology::new();
        topology.init(controller.clone());
        topology.update();

        let state = controller.get_state();
        assert_eq!(state.connected, candidates);
        assert!(state.candidates.is_empty());
        assert!(topology.on_offer(PeerId::random()));

        // The refresh task runs its first lookup right away
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(*controller.lookups.lock(), 1);
        topology.destroy();
    }
}
