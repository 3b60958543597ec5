// Network manager - entry point for joining protocol swarms
//
// Owns the signal manager and the message router shared by every swarm,
// keeps the topic -> swarm registry and runs the dispatcher task that routes
// signaling events to the swarm they belong to.

use crate::config::{NetworkConfig, NetworkManagerOptions};
use crate::connection::ConnectionContext;
use crate::error::NetworkError;
use crate::events::{init_logging, NetworkEvent, NetworkEventLog};
use crate::keys::{PeerId, Topic};
use crate::protocol::SharedProtocolProvider;
use crate::router::MessageRouter;
use crate::signal::{
    Answer, InMemorySignalManager, SignalBroker, SignalEvent, SignalManager,
    WebsocketSignalManager,
};
use crate::swarm::{PeerInfo, PresenceProvider, Swarm, SwarmMapper};
use crate::topology::Topology;
use crate::transport::{
    MemoryTransportFactory, MemoryTransportRegistry, TransportFactory, WebRtcTransportFactory,
};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Weak};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

// ============================================================================
// IN-MEMORY NETWORK
// ============================================================================

/// Shared in-memory signaling and transports for peers in one process
#[derive(Clone, Default)]
pub struct MemoryNetwork {
    pub broker: SignalBroker,
    pub transports: MemoryTransportRegistry,
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }
}

// ============================================================================
// JOIN OPTIONS
// ============================================================================

pub struct JoinSwarmOptions {
    pub topic: Topic,
    pub peer_id: PeerId,
    pub topology: Box<dyn Topology>,
    pub protocol: SharedProtocolProvider,
    pub presence: Option<Arc<dyn PresenceProvider>>,
    pub label: Option<String>,
}

impl JoinSwarmOptions {
    pub fn builder() -> JoinSwarmOptionsBuilder {
        JoinSwarmOptionsBuilder::default()
    }
}

impl fmt::Debug for JoinSwarmOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JoinSwarmOptions")
            .field("topic", &self.topic)
            .field("peer_id", &self.peer_id)
            .field("topology", &self.topology.to_string())
            .field("label", &self.label)
            .finish()
    }
}

#[derive(Default)]
pub struct JoinSwarmOptionsBuilder {
    topic: Option<Topic>,
    peer_id: Option<PeerId>,
    topology: Option<Box<dyn Topology>>,
    protocol: Option<SharedProtocolProvider>,
    presence: Option<Arc<dyn PresenceProvider>>,
    label: Option<String>,
}

impl JoinSwarmOptionsBuilder {
    pub fn topic(mut self, topic: Topic) -> Self {
        self.topic = Some(topic);
        self
    }

    pub fn peer_id(mut self, peer_id: PeerId) -> Self {
        self.peer_id = Some(peer_id);
        self
    }

    pub fn topology(mut self, topology: impl Topology + 'static) -> Self {
        self.topology = Some(Box::new(topology));
        self
    }

    pub fn protocol(mut self, protocol: SharedProtocolProvider) -> Self {
        self.protocol = Some(protocol);
        self
    }

    pub fn presence(mut self, presence: Arc<dyn PresenceProvider>) -> Self {
        self.presence = Some(presence);
        self
    }

    pub fn label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    pub fn build(self) -> Result<JoinSwarmOptions, NetworkError> {
        let missing = |what: &str| NetworkError::InvalidOptions(format!("Missing {}", what));
        Ok(JoinSwarmOptions {
            topic: self.topic.ok_or_else(|| missing("topic"))?,
            peer_id: self.peer_id.ok_or_else(|| missing("peer id"))?,
            topology: self.topology.ok_or_else(|| missing("topology"))?,
            protocol: self.protocol.ok_or_else(|| missing("protocol"))?,
            presence: self.presence,
            label: self.label,
        })
    }
}

// ============================================================================
// NETWORK MANAGER
// ============================================================================

struct SwarmEntry {
    peer_id: PeerId,
    swarm: Arc<Swarm>,
    mapper: SwarmMapper,
}

struct ManagerInner {
    signal_manager: Arc<dyn SignalManager>,
    router: Arc<MessageRouter>,
    transport_factory: Arc<dyn TransportFactory>,
    swarms: RwLock<HashMap<Topic, SwarmEntry>>,
    event_log: Arc<NetworkEventLog>,
    config: NetworkConfig,
}

impl ManagerInner {
    fn swarm(&self, topic: &Topic) -> Option<Arc<Swarm>> {
        self.swarms.read().get(topic).map(|e| Arc::clone(&e.swarm))
    }

    /// Tears the swarm down while the signaling leave is still in flight,
    /// so no new connection is started to peers of a topic being left
    async fn leave(&self, topic: Topic) -> Result<(), NetworkError> {
        let entry = self
            .swarms
            .write()
            .remove(&topic)
            .ok_or(NetworkError::NotJoined(topic))?;
        entry.mapper.destroy();

        let (left, ()) = tokio::join!(
            self.signal_manager.leave(topic, entry.peer_id),
            entry.swarm.destroy()
        );
        if let Err(e) = left {
            warn!("Failed to leave {} on signaling: {}", topic.truncate(), e);
        }
        self.event_log.emit(NetworkEvent::SwarmLeft {
            topic,
            peer_id: entry.peer_id,
        });
        info!("Left swarm {} as {}", topic.truncate(), entry.peer_id.truncate());
        Ok(())
    }
}

/// Returned by `join_protocol_swarm`; leaves the swarm when asked to
pub struct LeaveHandle {
    topic: Topic,
    inner: Weak<ManagerInner>,
}

impl LeaveHandle {
    pub fn topic(&self) -> Topic {
        self.topic
    }

    pub async fn leave(self) -> Result<(), NetworkError> {
        match self.inner.upgrade() {
            Some(inner) => inner.leave(self.topic).await,
            None => Ok(()),
        }
    }
}

pub struct NetworkManager {
    inner: Arc<ManagerInner>,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
}

impl NetworkManager {
    /// Websocket signaling and WebRTC transports
    pub fn new(options: NetworkManagerOptions) -> Result<Self, NetworkError> {
        if options.signal.is_empty() {
            return Err(NetworkError::InvalidOptions(
                "No signaling servers given; use NetworkManager::in_memory for local networks"
                    .to_string(),
            ));
        }
        if options.log {
            init_logging();
        }
        let signal_manager = Arc::new(WebsocketSignalManager::new(
            &options.signal,
            options.timing.signal.clone(),
        )?);
        let transport_factory = Arc::new(WebRtcTransportFactory::new(options.ice.clone()));
        Self::with_components(signal_manager, transport_factory, options)
    }

    /// Shared in-memory network, for tests and single-process setups
    pub fn in_memory(
        network: &MemoryNetwork,
        options: NetworkManagerOptions,
    ) -> Result<Self, NetworkError> {
        if options.log {
            init_logging();
        }
        let signal_manager = Arc::new(InMemorySignalManager::new(network.broker.clone()));
        let transport_factory = Arc::new(MemoryTransportFactory::new(
            network.transports.clone(),
            options.timing.memory_transport_delay(),
        ));
        Self::with_components(signal_manager, transport_factory, options)
    }

    pub fn with_components(
        signal_manager: Arc<dyn SignalManager>,
        transport_factory: Arc<dyn TransportFactory>,
        options: NetworkManagerOptions,
    ) -> Result<Self, NetworkError> {
        let events = signal_manager.take_events().ok_or_else(|| {
            NetworkError::InvalidOptions("Signal manager is already in use".to_string())
        })?;
        let router = Arc::new(MessageRouter::new(
            Arc::clone(&signal_manager),
            options.timing.router.clone(),
        ));
        let inner = Arc::new(ManagerInner {
            signal_manager,
            router,
            transport_factory,
            swarms: RwLock::new(HashMap::new()),
            event_log: Arc::new(NetworkEventLog::new(options.log)),
            config: options.timing,
        });
        let dispatcher = tokio::spawn(dispatch(Arc::downgrade(&inner), events));
        Ok(Self {
            inner,
            dispatcher: Mutex::new(Some(dispatcher)),
        })
    }

    pub async fn join_protocol_swarm(
        &self,
        options: JoinSwarmOptions,
    ) -> Result<LeaveHandle, NetworkError> {
        let JoinSwarmOptions {
            topic,
            peer_id,
            topology,
            protocol,
            presence,
            label,
        } = options;

        {
            let mut swarms = self.inner.swarms.write();
            if swarms.contains_key(&topic) {
                return Err(NetworkError::AlreadyJoined(topic));
            }
            let (notices_tx, notices) = mpsc::unbounded_channel();
            let ctx = ConnectionContext {
                topic,
                own_id: peer_id,
                router: Arc::clone(&self.inner.router),
                transport_factory: Arc::clone(&self.inner.transport_factory),
                protocol,
                event_log: Arc::clone(&self.inner.event_log),
                offer_timeout: self.inner.config.offer_timeout(),
                connect_timeout: self.inner.config.connect_timeout(),
                notices: notices_tx,
            };
            let swarm = Swarm::new(
                ctx,
                notices,
                Arc::clone(&self.inner.signal_manager),
                topology,
                label,
            );
            let mapper = SwarmMapper::new(&swarm, presence);
            swarms.insert(
                topic,
                SwarmEntry {
                    peer_id,
                    swarm,
                    mapper,
                },
            );
        }

        if let Err(e) = self.inner.signal_manager.join(topic, peer_id).await {
            let entry = self.inner.swarms.write().remove(&topic);
            if let Some(entry) = entry {
                entry.swarm.destroy().await;
            }
            return Err(e.into());
        }

        self.inner
            .event_log
            .emit(NetworkEvent::SwarmJoined { topic, peer_id });
        info!("Joined swarm {} as {}", topic.truncate(), peer_id.truncate());
        Ok(LeaveHandle {
            topic,
            inner: Arc::downgrade(&self.inner),
        })
    }

    pub async fn leave_protocol_swarm(&self, topic: Topic) -> Result<(), NetworkError> {
        self.inner.leave(topic).await
    }

    /// Leave every swarm and shut down signaling. Connections that fail to
    /// close end up on their swarm's error stream.
    pub async fn destroy(&self) {
        for topic in self.topics() {
            if let Err(e) = self.inner.leave(topic).await {
                debug!("Swarm {} already gone: {}", topic.truncate(), e);
            }
        }
        self.inner.router.destroy();
        self.inner.signal_manager.destroy().await;
        if let Some(dispatcher) = self.dispatcher.lock().take() {
            dispatcher.abort();
        }
        debug!("Network manager destroyed");
    }

    pub fn get_swarm(&self, topic: &Topic) -> Option<Arc<Swarm>> {
        self.inner.swarm(topic)
    }

    /// Peer map of a joined swarm
    pub fn get_swarm_map(&self, topic: &Topic) -> Option<Vec<PeerInfo>> {
        self.inner.swarms.read().get(topic).map(|e| e.mapper.peers())
    }

    pub fn subscribe_swarm_map(&self, topic: &Topic) -> Option<watch::Receiver<Vec<PeerInfo>>> {
        self.inner
            .swarms
            .read()
            .get(topic)
            .map(|e| e.mapper.subscribe())
    }

    pub fn topics(&self) -> Vec<Topic> {
        let mut topics: Vec<_> = self.inner.swarms.read().keys().copied().collect();
        topics.sort();
        topics
    }

    pub fn event_log(&self) -> Arc<NetworkEventLog> {
        Arc::clone(&self.inner.event_log)
    }

    pub fn signal_manager(&self) -> Arc<dyn SignalManager> {
        Arc::clone(&self.inner.signal_manager)
    }

    pub fn config(&self) -> &NetworkConfig {
        &self.inner.config
    }
}

impl Drop for NetworkManager {
    fn drop(&mut self) {
        if let Some(dispatcher) = self.dispatcher.get_mut().take() {
            dispatcher.abort();
        }
    }
}

/// Route signaling events to the swarm of their topic
async fn dispatch(inner: Weak<ManagerInner>, mut events: mpsc::UnboundedReceiver<SignalEvent>) {
    while let Some(event) = events.recv().await {
        let Some(inner) = inner.upgrade() else {
            break;
        };
        match event {
            SignalEvent::Swarm { topic, event } => match inner.swarm(&topic) {
                Some(swarm) => swarm.handle_swarm_event(event),
                None => debug!("Swarm event for unknown topic {}", topic.truncate()),
            },
            SignalEvent::Message(message) => {
                let Some(message) = inner.router.handle_message(message) else {
                    continue;
                };
                match inner.swarm(&message.topic) {
                    Some(swarm) => swarm.handle_signal(message),
                    None => debug!("Message for unknown topic {}", message.topic.truncate()),
                }
            }
            SignalEvent::Offer { message, responder } => match inner.swarm(&message.topic) {
                Some(swarm) => swarm.handle_offer(message, responder),
                None => {
                    debug!("Rejecting offer for unknown topic {}", message.topic.truncate());
                    let _ = responder.send(Answer::REJECT);
                }
            },
        }
    }
    debug!("Signal dispatcher stopped");
}
