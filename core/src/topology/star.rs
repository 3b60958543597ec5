//! Star topology: every peer connects only to a fixed center

use super::{SwarmController, Topology};
use crate::keys::PeerId;
use std::fmt;
use std::sync::Arc;
use tracing::debug;

pub struct StarTopology {
    center: PeerId,
    controller: Option<Arc<dyn SwarmController>>,
}

impl StarTopology {
    pub fn new(center: PeerId) -> Self {
        Self {
            center,
            controller: None,
        }
    }

    pub fn center(&self) -> PeerId {
        self.center
    }
}

impl Topology for StarTopology {
    fn init(&mut self, controller: Arc<dyn SwarmController>) {
        self.controller = Some(controller);
    }

    fn update(&mut self) {
        let Some(controller) = &self.controller else {
            return;
        };
        let state = controller.get_state();

        if state.own_peer_id == self.center {
            for peer in state.candidates {
                controller.connect(peer);
            }
            return;
        }

        for peer in state.connected.iter().filter(|p| **p != self.center) {
            debug!("{}: dropping non-center peer {}", self, peer.truncate());
            controller.disconnect(*peer);
        }
        if state.candidates.contains(&self.center) {
            controller.connect(self.center);
        }
    }

    fn on_offer(&mut self, peer: PeerId) -> bool {
        let own = self.controller.as_ref().map(|c| c.get_state().own_peer_id);
        own == Some(self.center) || peer == self.center
    }

    fn destroy(&mut self) {
        self.controller = None;
    }
}

impl fmt::Display for StarTopology {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "StarTopology(center={})", self.center.truncate())
    }
}
