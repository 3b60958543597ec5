// Swarm - connections to the peers of one topic
//
// A single driver task owns the topology and processes every event for the
// swarm in order: offers, signals, membership changes, connection notices
// and topology actions. Shared state is only touched in short synchronous
// sections so the public handle and the topology controller can read it.

pub mod mapper;

use crate::connection::{Connection, ConnectionContext, ConnectionNotice, ConnectionState};
use crate::error::ConnectionError;
use crate::keys::{PeerId, Topic};
use crate::signal::{Answer, SignalManager, SignalMessage, SignalPayload, SwarmEvent};
use crate::topology::{SwarmController, SwarmState, Topology};
use futures::future::join_all;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant, SystemTime};
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

pub use mapper::{PeerInfo, PeerState, PresenceProvider, SwarmMapper};

/// Maximum number of errors kept in a swarm's error history
pub const MAX_ERROR_HISTORY: usize = 100;

/// Delay before a peer whose offer failed becomes a candidate again
pub const OFFER_RETRY_DELAY: Duration = Duration::from_millis(500);

/// Failure of one connection in a swarm
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SwarmError {
    pub time: SystemTime,
    pub peer: PeerId,
    pub session_id: Uuid,
    pub error: ConnectionError,
}

/// Commands accepted by the swarm driver
#[derive(Debug)]
pub enum SwarmCommand {
    Offer {
        message: SignalMessage,
        responder: oneshot::Sender<Answer>,
    },
    Signal(SignalMessage),
    Swarm(SwarmEvent),
    Destroy { reply: oneshot::Sender<()> },
}

/// Work the driver schedules for itself
#[derive(Debug)]
enum DriverAction {
    Connect(PeerId),
    Disconnect(PeerId),
    Lookup,
    Discovered(Vec<PeerId>),
    OfferFailed {
        peer: PeerId,
        session_id: Uuid,
        error: ConnectionError,
    },
    Update,
}

struct SwarmShared {
    own_peer_id: PeerId,
    connections: Mutex<HashMap<PeerId, Arc<Connection>>>,
    discovered: Mutex<HashSet<PeerId>>,
    /// Peers whose last offer failed, with the time they may be retried
    retry_after: Mutex<HashMap<PeerId, Instant>>,
    errors: Mutex<VecDeque<SwarmError>>,
    errors_tx: broadcast::Sender<SwarmError>,
    changes: watch::Sender<u64>,
}

impl SwarmShared {
    fn state(&self) -> SwarmState {
        let connected: Vec<PeerId> = {
            let connections = self.connections.lock();
            let mut peers: Vec<_> = connections
                .iter()
                .filter(|(_, c)| !c.state().is_closed())
                .map(|(peer, _)| *peer)
                .collect();
            peers.sort();
            peers
        };
        let now = Instant::now();
        let retry_after = self.retry_after.lock();
        let mut candidates: Vec<PeerId> = self
            .discovered
            .lock()
            .iter()
            .filter(|peer| **peer != self.own_peer_id)
            .filter(|peer| !connected.contains(peer))
            .filter(|peer| retry_after.get(*peer).map_or(true, |at| *at <= now))
            .copied()
            .collect();
        candidates.sort();
        SwarmState {
            own_peer_id: self.own_peer_id,
            connected,
            candidates,
        }
    }

    fn changed(&self) {
        self.changes.send_modify(|version| *version += 1);
    }

    fn push_error(&self, error: SwarmError) {
        {
            let mut errors = self.errors.lock();
            if errors.len() >= MAX_ERROR_HISTORY {
                errors.pop_front();
            }
            errors.push_back(error.clone());
        }
        let _ = self.errors_tx.send(error);
    }
}

/// Topology's view of the swarm; actions are queued for the driver
struct Controller {
    shared: Weak<SwarmShared>,
    actions: mpsc::UnboundedSender<DriverAction>,
}

impl SwarmController for Controller {
    fn get_state(&self) -> SwarmState {
        match self.shared.upgrade() {
            Some(shared) => shared.state(),
            None => SwarmState {
                own_peer_id: PeerId::from_bytes([0u8; 32]),
                connected: Vec::new(),
                candidates: Vec::new(),
            },
        }
    }

    fn connect(&self, peer: PeerId) {
        let _ = self.actions.send(DriverAction::Connect(peer));
    }

    fn disconnect(&self, peer: PeerId) {
        let _ = self.actions.send(DriverAction::Disconnect(peer));
    }

    fn lookup(&self) {
        let _ = self.actions.send(DriverAction::Lookup);
    }
}

/// Handle to a running swarm
pub struct Swarm {
    topic: Topic,
    label: Option<String>,
    topology: String,
    shared: Arc<SwarmShared>,
    commands: mpsc::UnboundedSender<SwarmCommand>,
    driver: Mutex<Option<JoinHandle<()>>>,
}

impl Swarm {
    /// Start the driver for `topology`. Connections are built from `ctx`.
    pub fn new(
        ctx: ConnectionContext,
        notices: mpsc::UnboundedReceiver<ConnectionNotice>,
        signal_manager: Arc<dyn SignalManager>,
        topology: Box<dyn Topology>,
        label: Option<String>,
    ) -> Arc<Self> {
        let (errors_tx, _) = broadcast::channel(64);
        let (changes, _) = watch::channel(0);
        let shared = Arc::new(SwarmShared {
            own_peer_id: ctx.own_id,
            connections: Mutex::new(HashMap::new()),
            discovered: Mutex::new(HashSet::new()),
            retry_after: Mutex::new(HashMap::new()),
            errors: Mutex::new(VecDeque::new()),
            errors_tx,
            changes,
        });
        let (commands, commands_rx) = mpsc::unbounded_channel();
        let (actions, actions_rx) = mpsc::unbounded_channel();
        let description = topology.to_string();

        let driver = SwarmDriver {
            topic: ctx.topic,
            own_id: ctx.own_id,
            ctx,
            topology,
            shared: Arc::clone(&shared),
            signal_manager,
            actions: actions.clone(),
        };
        let controller: Arc<dyn SwarmController> = Arc::new(Controller {
            shared: Arc::downgrade(&shared),
            actions,
        });
        let topic = driver.topic;
        let handle = tokio::spawn(driver.run(controller, commands_rx, notices, actions_rx));

        info!(
            "Swarm {} started as {} with {}",
            topic.truncate(),
            shared.own_peer_id.truncate(),
            description
        );
        Arc::new(Self {
            topic,
            label,
            topology: description,
            shared,
            commands,
            driver: Mutex::new(Some(handle)),
        })
    }

    pub fn topic(&self) -> Topic {
        self.topic
    }

    pub fn own_peer_id(&self) -> PeerId {
        self.shared.own_peer_id
    }

    pub fn label(&self) -> Option<&str> {
        self.label.as_deref()
    }

    /// Description of the topology
    pub fn topology(&self) -> &str {
        &self.topology
    }

    /// Live connections, ordered by remote peer
    pub fn connections(&self) -> Vec<Arc<Connection>> {
        let mut connections: Vec<_> = self.shared.connections.lock().values().cloned().collect();
        connections.sort_by_key(|c| c.remote_id());
        connections
    }

    pub fn connection(&self, peer: &PeerId) -> Option<Arc<Connection>> {
        self.shared.connections.lock().get(peer).cloned()
    }

    pub fn discovered_peers(&self) -> Vec<PeerId> {
        let mut peers: Vec<_> = self.shared.discovered.lock().iter().copied().collect();
        peers.sort();
        peers
    }

    pub fn subscribe_errors(&self) -> broadcast::Receiver<SwarmError> {
        self.shared.errors_tx.subscribe()
    }

    /// Recent errors, oldest first
    pub fn errors(&self) -> Vec<SwarmError> {
        self.shared.errors.lock().iter().cloned().collect()
    }

    /// Version counter bumped whenever the connection set or a connection state changes
    pub fn subscribe_changes(&self) -> watch::Receiver<u64> {
        self.shared.changes.subscribe()
    }

    pub fn handle_offer(&self, message: SignalMessage, responder: oneshot::Sender<Answer>) {
        if let Err(mpsc::error::SendError(SwarmCommand::Offer { responder, .. })) =
            self.commands.send(SwarmCommand::Offer { message, responder })
        {
            let _ = responder.send(Answer::REJECT);
        }
    }

    pub fn handle_signal(&self, message: SignalMessage) {
        let _ = self.commands.send(SwarmCommand::Signal(message));
    }

    pub fn handle_swarm_event(&self, event: SwarmEvent) {
        let _ = self.commands.send(SwarmCommand::Swarm(event));
    }

    /// Destroy the topology, then close every connection concurrently.
    /// Connections that fail to close are reported on the error stream.
    pub async fn destroy(&self) {
        let (reply, done) = oneshot::channel();
        if self.commands.send(SwarmCommand::Destroy { reply }).is_ok() {
            let _ = done.await;
        }
        if let Some(driver) = self.driver.lock().take() {
            driver.abort();
        }
    }
}

impl Drop for Swarm {
    fn drop(&mut self) {
        if let Some(driver) = self.driver.get_mut().take() {
            driver.abort();
        }
    }
}

impl std::fmt::Debug for Swarm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Swarm")
            .field("topic", &self.topic)
            .field("own_peer_id", &self.shared.own_peer_id)
            .field("topology", &self.topology)
            .field("connections", &self.shared.connections.lock().len())
            .finish()
    }
}

struct SwarmDriver {
    topic: Topic,
    own_id: PeerId,
    ctx: ConnectionContext,
    topology: Box<dyn Topology>,
    shared: Arc<SwarmShared>,
    signal_manager: Arc<dyn SignalManager>,
    actions: mpsc::UnboundedSender<DriverAction>,
}

impl SwarmDriver {
    async fn run(
        mut self,
        controller: Arc<dyn SwarmController>,
        mut commands: mpsc::UnboundedReceiver<SwarmCommand>,
        mut notices: mpsc::UnboundedReceiver<ConnectionNotice>,
        mut actions: mpsc::UnboundedReceiver<DriverAction>,
    ) {
        self.topology.init(controller);
        self.update(&mut actions);

        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(SwarmCommand::Destroy { reply }) => {
                        self.destroy().await;
                        let _ = reply.send(());
                        break;
                    }
                    Some(command) => self.handle_command(command, &mut actions),
                    None => {
                        self.destroy().await;
                        break;
                    }
                },
                Some(notice) = notices.recv() => self.handle_notice(notice, &mut actions),
                Some(action) = actions.recv() => {
                    self.apply(action);
                    self.drain(&mut actions);
                }
            }
        }
        debug!("Swarm {} driver stopped", self.topic.truncate());
    }

    fn handle_command(
        &mut self,
        command: SwarmCommand,
        actions: &mut mpsc::UnboundedReceiver<DriverAction>,
    ) {
        match command {
            SwarmCommand::Offer { message, responder } => {
                let answer = self.on_offer(&message);
                let _ = responder.send(answer);
                self.drain(actions);
            }
            SwarmCommand::Signal(message) => self.on_signal(message),
            SwarmCommand::Swarm(event) => {
                self.on_swarm_event(event);
                self.update(actions);
            }
            SwarmCommand::Destroy { .. } => {}
        }
    }

    fn on_offer(&mut self, message: &SignalMessage) -> Answer {
        let remote = message.author;
        if message.recipient != self.own_id || message.topic != self.topic || remote == self.own_id {
            warn!("Rejecting misaddressed offer from {}", remote.truncate());
            return Answer::REJECT;
        }

        if let Some(existing) = self.live_connection(&remote) {
            if existing.session_id() == message.session_id {
                return Answer::ACCEPT;
            }
            // Only an offer of ours still waiting for its answer competes with
            // the incoming one. Any other session is one the remote gave up on.
            let own_offer = existing.initiator()
                && matches!(
                    existing.state(),
                    ConnectionState::Initial | ConnectionState::Offering
                );
            if own_offer && self.own_id > remote {
                debug!("Simultaneous offer with {}: keeping own attempt", remote.truncate());
                return Answer::REJECT;
            }
            debug!(
                "Offer from {} replaces session {} ({})",
                remote.truncate(),
                existing.session_id(),
                existing.state()
            );
            self.shared.connections.lock().remove(&remote);
            self.shared.changed();
            tokio::spawn(async move {
                let _ = existing.close().await;
            });
        }

        if !self.topology.on_offer(remote) {
            debug!("{} rejected offer from {}", self.topology, remote.truncate());
            return Answer::REJECT;
        }

        let connection = match Connection::new(self.ctx.clone(), remote, message.session_id, false) {
            Ok(connection) => connection,
            Err(e) => {
                self.record_error(remote, message.session_id, e);
                return Answer::REJECT;
            }
        };
        self.shared
            .connections
            .lock()
            .insert(remote, Arc::clone(&connection));
        self.shared.changed();

        let shared = Arc::downgrade(&self.shared);
        tokio::spawn(async move {
            if let Err(e) = connection.open_connection().await {
                if let Some(shared) = shared.upgrade() {
                    shared.push_error(SwarmError {
                        time: SystemTime::now(),
                        peer: connection.remote_id(),
                        session_id: connection.session_id(),
                        error: e,
                    });
                }
            }
        });
        Answer::ACCEPT
    }

    fn on_signal(&mut self, message: SignalMessage) {
        let signal = match message.data {
            SignalPayload::Signal(signal) => signal,
            other => {
                debug!("Ignoring {} outside the router", other.kind());
                return;
            }
        };
        match self.shared.connections.lock().get(&message.author) {
            Some(connection) if connection.session_id() == message.session_id => {
                connection.signal(signal);
            }
            _ => debug!(
                "Dropping stray signal from {} ({})",
                message.author.truncate(),
                message.session_id
            ),
        }
    }

    fn on_swarm_event(&mut self, event: SwarmEvent) {
        let peer = event.peer();
        if peer == self.own_id {
            return;
        }
        match event {
            SwarmEvent::PeerAvailable { .. } => {
                debug!("Swarm {}: peer available {}", self.topic.truncate(), peer.truncate());
                self.shared.discovered.lock().insert(peer);
            }
            SwarmEvent::PeerLeft { .. } => {
                debug!("Swarm {}: peer left {}", self.topic.truncate(), peer.truncate());
                self.shared.discovered.lock().remove(&peer);
                self.shared.retry_after.lock().remove(&peer);
            }
        }
    }

    fn handle_notice(
        &mut self,
        notice: ConnectionNotice,
        actions: &mut mpsc::UnboundedReceiver<DriverAction>,
    ) {
        match notice {
            ConnectionNotice::StateChanged {
                remote_id,
                session_id,
                state,
            } => {
                if state == ConnectionState::Closed {
                    let mut connections = self.shared.connections.lock();
                    if connections
                        .get(&remote_id)
                        .map_or(false, |c| c.session_id() == session_id)
                    {
                        connections.remove(&remote_id);
                    }
                }
                self.shared.changed();
                if state == ConnectionState::Closed {
                    self.update(actions);
                }
            }
            ConnectionNotice::Error {
                remote_id,
                session_id,
                error,
            } => self.record_error(remote_id, session_id, error),
        }
    }

    /// Run the topology and apply whatever it asked for
    fn update(&mut self, actions: &mut mpsc::UnboundedReceiver<DriverAction>) {
        self.topology.update();
        self.drain(actions);
    }

    fn drain(&mut self, actions: &mut mpsc::UnboundedReceiver<DriverAction>) {
        while let Ok(action) = actions.try_recv() {
            self.apply(action);
        }
    }

    fn apply(&mut self, action: DriverAction) {
        match action {
            DriverAction::Connect(peer) => self.connect(peer),
            DriverAction::Disconnect(peer) => {
                let removed = self.shared.connections.lock().remove(&peer);
                if let Some(connection) = removed {
                    debug!("Disconnecting from {}", peer.truncate());
                    self.shared.changed();
                    tokio::spawn(async move {
                        let _ = connection.close().await;
                    });
                }
            }
            DriverAction::Lookup => {
                let signal_manager = Arc::clone(&self.signal_manager);
                let actions = self.actions.clone();
                let topic = self.topic;
                tokio::spawn(async move {
                    match signal_manager.lookup(topic).await {
                        Ok(peers) => {
                            let _ = actions.send(DriverAction::Discovered(peers));
                        }
                        Err(e) => warn!("Lookup of {} failed: {}", topic.truncate(), e),
                    }
                });
            }
            DriverAction::Discovered(peers) => {
                {
                    let mut discovered = self.shared.discovered.lock();
                    discovered.extend(peers.into_iter().filter(|p| *p != self.own_id));
                }
                self.topology.update();
            }
            DriverAction::OfferFailed {
                peer,
                session_id,
                error,
            } => {
                self.record_error(peer, session_id, error);
                self.shared
                    .retry_after
                    .lock()
                    .insert(peer, Instant::now() + OFFER_RETRY_DELAY);
                let actions = self.actions.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(OFFER_RETRY_DELAY).await;
                    let _ = actions.send(DriverAction::Update);
                });
            }
            DriverAction::Update => self.topology.update(),
        }
    }

    fn connect(&mut self, peer: PeerId) {
        if peer == self.own_id || self.live_connection(&peer).is_some() {
            return;
        }
        let session_id = Uuid::new_v4();
        let connection = match Connection::new(self.ctx.clone(), peer, session_id, true) {
            Ok(connection) => connection,
            Err(e) => {
                self.record_error(peer, session_id, e);
                return;
            }
        };
        self.shared
            .connections
            .lock()
            .insert(peer, Arc::clone(&connection));
        self.shared.changed();

        let actions = self.actions.clone();
        tokio::spawn(async move {
            if let Err(error) = connection.make_offer().await {
                let _ = actions.send(DriverAction::OfferFailed {
                    peer,
                    session_id,
                    error,
                });
            }
        });
    }

    fn live_connection(&self, peer: &PeerId) -> Option<Arc<Connection>> {
        self.shared
            .connections
            .lock()
            .get(peer)
            .filter(|c| !c.state().is_closed())
            .cloned()
    }

    fn record_error(&self, peer: PeerId, session_id: Uuid, error: ConnectionError) {
        debug!("Swarm {} error with {}: {}", self.topic.truncate(), peer.truncate(), error);
        self.shared.push_error(SwarmError {
            time: SystemTime::now(),
            peer,
            session_id,
            error,
        });
    }

    async fn destroy(&mut self) {
        self.topology.destroy();
        let connections: Vec<Arc<Connection>> = self
            .shared
            .connections
            .lock()
            .drain()
            .map(|(_, c)| c)
            .collect();
        let results = join_all(connections.iter().map(|c| c.close())).await;
        self.shared.changed();

        let mut failed = 0;
        for (result, connection) in results.into_iter().zip(&connections) {
            if let Err(error) = result {
                failed += 1;
                warn!(
                    "Swarm {} failed to close connection to {}: {}",
                    self.topic.truncate(),
                    connection.remote_id().truncate(),
                    error
                );
                self.record_error(connection.remote_id(), connection.session_id(), error);
            }
        }
        info!(
            "Swarm {} destroyed, closed {} connection(s), {} failed",
            self.topic.truncate(),
            connections.len(),
            failed
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RouterConfig;
    use crate::events::NetworkEventLog;
    use crate::router::MessageRouter;
    use crate::error::TransportError;
    use crate::signal::{InMemorySignalManager, SignalBroker, TransportSignal};
    use crate::testing::{RecordingTransportFactory, TestProtocolPlugin};
    use crate::topology::FullyConnectedTopology;
    use crate::transport::{MemoryTransportFactory, MemoryTransportRegistry, TransportFactory};

    fn swarm(broker: &SignalBroker, topic: Topic, own_id: PeerId) -> Arc<Swarm> {
        let transports = MemoryTransportFactory::new(MemoryTransportRegistry::new(), Duration::ZERO);
        swarm_with(broker, topic, own_id, Arc::new(transports), Duration::from_secs(5))
    }

    fn swarm_with(
        broker: &SignalBroker,
        topic: Topic,
        own_id: PeerId,
        transport_factory: Arc<dyn TransportFactory>,
        connect_timeout: Duration,
    ) -> Arc<Swarm> {
        let manager: Arc<dyn SignalManager> = Arc::new(InMemorySignalManager::new(broker.clone()));
        let (notices_tx, notices) = mpsc::unbounded_channel();
        let ctx = ConnectionContext {
            topic,
            own_id,
            router: Arc::new(MessageRouter::new(Arc::clone(&manager), RouterConfig::default())),
            transport_factory,
            protocol: TestProtocolPlugin::new(own_id).provider(),
            event_log: Arc::new(NetworkEventLog::default()),
            offer_timeout: Duration::from_secs(5),
            connect_timeout,
            notices: notices_tx,
        };
        Swarm::new(ctx, notices, manager, Box::new(FullyConnectedTopology::new()), None)
    }

    /// Two random ids, smaller first
    fn ordered_pair() -> (PeerId, PeerId) {
        let (x, y) = (PeerId::random(), PeerId::random());
        if x < y {
            (x, y)
        } else {
            (y, x)
        }
    }

    fn candidate(session_id: Uuid) -> TransportSignal {
        TransportSignal::Candidate {
            candidate: format!("candidate:{}", session_id),
            sdp_mid: None,
            sdp_mline_index: None,
        }
    }

    async fn wait_until(mut condition: impl FnMut() -> bool) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while !condition() {
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
        })
        .await
        .expect("condition not reached");
    }

    /// Registers `peer` in the topic without ever answering its offers
    async fn silent_peer(broker: &SignalBroker, topic: Topic, peer: PeerId) -> InMemorySignalManager {
        let manager = InMemorySignalManager::new(broker.clone());
        manager.join(topic, peer).await.unwrap();
        manager
    }

    fn offer(from: PeerId, to: PeerId, topic: Topic, session_id: Uuid) -> SignalMessage {
        SignalMessage::new(from, to, topic, session_id, SignalPayload::Offer)
    }

    async fn answer(swarm: &Swarm, message: SignalMessage) -> Answer {
        let (tx, rx) = oneshot::channel();
        swarm.handle_offer(message, tx);
        rx.await.unwrap_or(Answer::REJECT)
    }

    async fn wait_for_connection(swarm: &Swarm, peer: &PeerId) -> Arc<Connection> {
        loop {
            if let Some(connection) = swarm.connection(peer) {
                return connection;
            }
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    }

    #[tokio::test]
    async fn test_offer_accepted_once_per_session() {
        let (broker, topic, own) = (SignalBroker::new(), Topic::random(), PeerId::random());
        let swarm = swarm(&broker, topic, own);
        let remote = PeerId::random();
        let session = Uuid::new_v4();

        assert_eq!(answer(&swarm, offer(remote, own, topic, session)).await, Answer::ACCEPT);
        let first = swarm.connection(&remote).unwrap();
        // Same session again is a no-op accept
        assert_eq!(answer(&swarm, offer(remote, own, topic, session)).await, Answer::ACCEPT);
        assert_eq!(swarm.connections().len(), 1);
        let current = swarm.connection(&remote).unwrap();
        assert!(Arc::ptr_eq(&first, &current));
        assert_eq!(current.session_id(), session);
        assert!(!current.state().is_closed());
    }

    #[tokio::test]
    async fn test_misaddressed_offer_rejected() {
        let (broker, topic, own) = (SignalBroker::new(), Topic::random(), PeerId::random());
        let swarm = swarm(&broker, topic, own);
        let remote = PeerId::random();
        assert_eq!(
            answer(&swarm, offer(remote, PeerId::random(), topic, Uuid::new_v4())).await,
            Answer::REJECT
        );
        assert_eq!(
            answer(&swarm, offer(remote, own, Topic::random(), Uuid::new_v4())).await,
            Answer::REJECT
        );
        assert!(swarm.connections().is_empty());
    }

    #[tokio::test]
    async fn test_tie_break_on_concurrent_offer() {
        let (broker, topic) = (SignalBroker::new(), Topic::random());
        let (a, b) = ordered_pair();
        let _a_silent = silent_peer(&broker, topic, a).await;
        let _b_silent = silent_peer(&broker, topic, b).await;

        // Smaller side replaces its pending attempt with the remote offer
        let small = swarm(&broker, topic, a);
        small.handle_swarm_event(SwarmEvent::PeerAvailable { peer: b });
        let own_attempt = wait_for_connection(&small, &b).await.session_id();
        let incoming = Uuid::new_v4();
        assert_eq!(answer(&small, offer(b, a, topic, incoming)).await, Answer::ACCEPT);
        assert_eq!(small.connection(&b).unwrap().session_id(), incoming);
        assert_ne!(own_attempt, incoming);
        assert_eq!(small.connections().len(), 1);

        // Larger side keeps its own attempt
        let large = swarm(&broker, topic, b);
        large.handle_swarm_event(SwarmEvent::PeerAvailable { peer: a });
        let kept = wait_for_connection(&large, &a).await.session_id();
        assert_eq!(answer(&large, offer(a, b, topic, Uuid::new_v4())).await, Answer::REJECT);
        assert_eq!(large.connection(&a).unwrap().session_id(), kept);
    }

    #[tokio::test]
    async fn test_discovery_ignores_self_and_destroy_clears() {
        let (broker, topic, own) = (SignalBroker::new(), Topic::random(), PeerId::random());
        let remote = PeerId::random();
        let _silent = silent_peer(&broker, topic, remote).await;
        let swarm = swarm(&broker, topic, own);
        swarm.handle_swarm_event(SwarmEvent::PeerAvailable { peer: own });
        swarm.handle_swarm_event(SwarmEvent::PeerAvailable { peer: remote });
        wait_for_connection(&swarm, &remote).await;
        assert_eq!(swarm.discovered_peers(), vec![remote]);

        swarm.destroy().await;
        assert!(swarm.connections().is_empty());
        // Offers after destroy are rejected
        assert_eq!(
            answer(&swarm, offer(remote, own, topic, Uuid::new_v4())).await,
            Answer::REJECT
        );
    }

    #[tokio::test]
    async fn test_larger_peer_replaces_accepted_session() {
        // The larger id only defends an offer of its own. A session it merely
        // accepted gives way to a fresh offer from the same peer.
        let (broker, topic) = (SignalBroker::new(), Topic::random());
        let (small, large) = ordered_pair();
        let swarm = swarm(&broker, topic, large);

        let stale = Uuid::new_v4();
        assert_eq!(answer(&swarm, offer(small, large, topic, stale)).await, Answer::ACCEPT);
        let stale_connection = swarm.connection(&small).unwrap();
        wait_until(|| stale_connection.state() == ConnectionState::WaitingForConnection).await;

        let fresh = Uuid::new_v4();
        assert_eq!(answer(&swarm, offer(small, large, topic, fresh)).await, Answer::ACCEPT);
        assert_eq!(swarm.connection(&small).unwrap().session_id(), fresh);
        assert_eq!(swarm.connections().len(), 1);
        wait_until(|| stale_connection.state().is_closed()).await;
        // Closing the replaced session must not evict the fresh one
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(swarm.connection(&small).unwrap().session_id(), fresh);
    }

    #[tokio::test]
    async fn test_stalled_accept_expires() {
        let (broker, topic, own) = (SignalBroker::new(), Topic::random(), PeerId::random());
        let remote = PeerId::random();
        let transports = MemoryTransportFactory::new(MemoryTransportRegistry::new(), Duration::ZERO);
        let swarm = swarm_with(&broker, topic, own, Arc::new(transports), Duration::from_millis(100));
        let mut errors = swarm.subscribe_errors();

        let session = Uuid::new_v4();
        assert_eq!(answer(&swarm, offer(remote, own, topic, session)).await, Answer::ACCEPT);
        let error = tokio::time::timeout(Duration::from_secs(5), errors.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(error.peer, remote);
        assert_eq!(error.session_id, session);
        assert_eq!(error.error, ConnectionError::ConnectTimeout);
        wait_until(|| swarm.connection(&remote).is_none()).await;
    }

    #[tokio::test]
    async fn test_stray_messages_create_nothing() {
        let (broker, topic, own) = (SignalBroker::new(), Topic::random(), PeerId::random());
        let remote = PeerId::random();
        let transports = RecordingTransportFactory::new();
        let swarm = swarm_with(&broker, topic, own, Arc::new(transports.clone()), Duration::from_secs(5));

        // Nothing is created for sessions we never accepted
        let unknown = Uuid::new_v4();
        swarm.handle_signal(SignalMessage::new(
            remote,
            own,
            topic,
            unknown,
            SignalPayload::Signal(candidate(unknown)),
        ));
        swarm.handle_signal(SignalMessage::new(
            remote,
            own,
            topic,
            unknown,
            SignalPayload::Answer(Answer::ACCEPT),
        ));

        let old = Uuid::new_v4();
        assert_eq!(answer(&swarm, offer(remote, own, topic, old)).await, Answer::ACCEPT);
        let current = Uuid::new_v4();
        assert_eq!(answer(&swarm, offer(remote, own, topic, current)).await, Answer::ACCEPT);
        assert_eq!(swarm.connections().len(), 1);

        // A late answer and a late signal for the replaced session are dropped,
        // a signal for the live session goes through
        swarm.handle_signal(SignalMessage::new(
            remote,
            own,
            topic,
            old,
            SignalPayload::Answer(Answer::REJECT),
        ));
        swarm.handle_signal(SignalMessage::new(
            remote,
            own,
            topic,
            old,
            SignalPayload::Signal(candidate(old)),
        ));
        swarm.handle_signal(SignalMessage::new(
            remote,
            own,
            topic,
            current,
            SignalPayload::Signal(candidate(current)),
        ));
        wait_until(|| !transports.signals(current).is_empty()).await;

        assert_eq!(transports.signals(current), vec![candidate(current)]);
        assert!(transports.signals(old).is_empty());
        assert!(transports.signals(unknown).is_empty());
        let connection = swarm.connection(&remote).unwrap();
        assert_eq!(connection.session_id(), current);
        assert_eq!(connection.state(), ConnectionState::WaitingForConnection);
        assert_eq!(swarm.connections().len(), 1);
    }

    #[tokio::test]
    async fn test_destroy_reports_close_failures() {
        let (broker, topic, own) = (SignalBroker::new(), Topic::random(), PeerId::random());
        let remote = PeerId::random();
        let transports = RecordingTransportFactory::failing_close();
        let swarm = swarm_with(&broker, topic, own, Arc::new(transports), Duration::from_secs(5));

        let session = Uuid::new_v4();
        assert_eq!(answer(&swarm, offer(remote, own, topic, session)).await, Answer::ACCEPT);
        let connection = swarm.connection(&remote).unwrap();
        wait_until(|| connection.state() == ConnectionState::WaitingForConnection).await;

        swarm.destroy().await;
        assert!(swarm.connections().is_empty());
        assert!(connection.state().is_closed());
        let errors = swarm.errors();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].session_id, session);
        assert_eq!(
            errors[0].error,
            ConnectionError::Transport(TransportError::Internal("Close refused".to_string()))
        );
    }
}
