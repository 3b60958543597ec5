// Topology - pluggable peer selection for a swarm
//
// A topology looks at the swarm through a `SwarmController` and decides
// which discovered peers to connect to, which connections to drop and
// which incoming offers to accept. Every call comes from the swarm's driver
// task; controller actions are applied by the swarm right after the call
// returns.

pub mod fully_connected;
pub mod mmst;
pub mod star;

use crate::keys::PeerId;
use std::fmt;
use std::sync::Arc;

pub use fully_connected::FullyConnectedTopology;
pub use mmst::{MmstConfig, MmstTopology};
pub use star::StarTopology;

/// Snapshot of a swarm as seen by its topology
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SwarmState {
    pub own_peer_id: PeerId,
    /// Peers with a live connection (any state but closed)
    pub connected: Vec<PeerId>,
    /// Discovered peers without a connection
    pub candidates: Vec<PeerId>,
}

/// Handle a topology uses to drive its swarm
pub trait SwarmController: Send + Sync {
    fn get_state(&self) -> SwarmState;

    /// Start a connection to `peer` unless one exists
    fn connect(&self, peer: PeerId);

    fn disconnect(&self, peer: PeerId);

    /// Ask the signaling layer for the current members of the topic
    fn lookup(&self);
}

/// Peer selection strategy. One instance per swarm; `destroy` is final.
pub trait Topology: Send + Sync + fmt::Display {
    fn init(&mut self, controller: Arc<dyn SwarmController>);

    /// Called whenever discovered peers or connections change
    fn update(&mut self);

    /// Whether to accept an offer from `peer`
    fn on_offer(&mut self, peer: PeerId) -> bool;

    fn destroy(&mut self);
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use parking_lot::Mutex;

    /// Controller that applies connects and disconnects to an in-memory state
    pub struct FakeController {
        pub state: Mutex<SwarmState>,
        pub lookups: Mutex<usize>,
    }

    impl FakeController {
        pub fn new(own: PeerId, connected: Vec<PeerId>, candidates: Vec<PeerId>) -> Arc<Self> {
            Arc::new(Self {
                state: Mutex::new(SwarmState {
                    own_peer_id: own,
                    connected,
                    candidates,
                }),
                lookups: Mutex::new(0),
            })
        }
    }

    impl SwarmController for FakeController {
        fn get_state(&self) -> SwarmState {
            self.state.lock().clone()
        }

        fn connect(&self, peer: PeerId) {
            let mut state = self.state.lock();
            state.candidates.retain(|p| *p != peer);
            if !state.connected.contains(&peer) {
                state.connected.push(peer);
            }
        }

        fn disconnect(&self, peer: PeerId) {
            let mut state = self.state.lock();
            if let Some(pos) = state.connected.iter().position(|p| *p == peer) {
                state.connected.remove(pos);
                state.candidates.push(peer);
            }
        }

        fn lookup(&self) {
            *self.lookups.lock() += 1;
        }
    }
}
