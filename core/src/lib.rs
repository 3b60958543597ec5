// Swarmnet Core - peer-to-peer swarm networking
//
// Peers announce themselves on a topic through a signaling layer, negotiate
// direct transport connections with reliable signaling, and let a pluggable
// topology decide which connections to keep.

pub mod config;
pub mod connection;
pub mod error;
pub mod events;
pub mod keys;
pub mod manager;
pub mod protocol;
pub mod router;
pub mod signal;
pub mod swarm;
#[cfg(any(test, feature = "test-utils"))]
pub mod testing;
pub mod topology;
pub mod transport;

pub use config::{
    IceServerConfig, NetworkConfig, NetworkManagerOptions, RouterConfig, SignalClientConfig,
};
pub use connection::{Connection, ConnectionState};
pub use error::{ConnectionError, NetworkError, RouterError, SignalError, TransportError};
pub use events::{init_logging, NetworkEvent, NetworkEventLog};
pub use keys::{KeyError, PeerId, PublicKey, Topic};
pub use manager::{
    JoinSwarmOptions, JoinSwarmOptionsBuilder, LeaveHandle, MemoryNetwork, NetworkManager,
};
pub use protocol::{Protocol, ProtocolContext, ProtocolProvider, SharedProtocolProvider};
pub use router::MessageRouter;
pub use signal::{SignalManager, SignalServer};
pub use swarm::{PeerInfo, PeerState, PresenceProvider, Swarm, SwarmError, SwarmMapper};
pub use topology::{
    FullyConnectedTopology, MmstConfig, MmstTopology, StarTopology, SwarmController, SwarmState,
    Topology,
};
pub use transport::{Transport, TransportFactory, TransportKind, WireChannel};
