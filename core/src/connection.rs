//! Connection - one negotiation attempt with a remote peer
//!
//! ```text
//! Initial ─make_offer─▶ Offering ─accept─▶ InitiatingConnection ─┐
//!    └──open_connection──▶ WaitingForConnection ─────────────────┴─▶ Connected ─▶ Closed
//! ```
//!
//! Any state may move to `Closed`, which is final. Remote transport signals
//! are queued until the transport is started and then applied in arrival
//! order. Local transport signals go out through the message router.

use crate::error::ConnectionError;
use crate::events::{NetworkEvent, NetworkEventLog};
use crate::keys::{PeerId, Topic};
use crate::protocol::{ProtocolContext, SharedProtocolProvider};
use crate::router::MessageRouter;
use crate::signal::{SignalMessage, SignalPayload, TransportSignal};
use crate::transport::{Transport, TransportEvent, TransportFactory, TransportOptions, WireChannel};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConnectionState {
    /// Created, nothing sent yet
    Initial,
    /// Offer sent, waiting for the answer
    Offering,
    /// Offer accepted, transport negotiating
    InitiatingConnection,
    /// Offer accepted by us, waiting for the initiator's transport
    WaitingForConnection,
    Connected,
    Closed,
}

impl ConnectionState {
    pub fn is_closed(&self) -> bool {
        matches!(self, ConnectionState::Closed)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConnectionState::Initial => "INITIAL",
            ConnectionState::Offering => "OFFERING",
            ConnectionState::InitiatingConnection => "INITIATING_CONNECTION",
            ConnectionState::WaitingForConnection => "WAITING_FOR_CONNECTION",
            ConnectionState::Connected => "CONNECTED",
            ConnectionState::Closed => "CLOSED",
        };
        write!(f, "{}", s)
    }
}

/// Reported by a connection to the swarm that owns it
#[derive(Debug, Clone)]
pub enum ConnectionNotice {
    StateChanged {
        remote_id: PeerId,
        session_id: Uuid,
        state: ConnectionState,
    },
    Error {
        remote_id: PeerId,
        session_id: Uuid,
        error: ConnectionError,
    },
}

/// Shared collaborators of every connection in a swarm
#[derive(Clone)]
pub struct ConnectionContext {
    pub topic: Topic,
    pub own_id: PeerId,
    pub router: Arc<MessageRouter>,
    pub transport_factory: Arc<dyn TransportFactory>,
    pub protocol: SharedProtocolProvider,
    pub event_log: Arc<NetworkEventLog>,
    pub offer_timeout: Duration,
    /// Time allowed between starting the transport and `Connected`
    pub connect_timeout: Duration,
    pub notices: mpsc::UnboundedSender<ConnectionNotice>,
}

struct ConnectionInner {
    state: ConnectionState,
    /// Remote signals received before the transport was started
    pending_signals: Option<mpsc::UnboundedReceiver<TransportSignal>>,
    tasks: Vec<JoinHandle<()>>,
}

pub struct Connection {
    remote_id: PeerId,
    session_id: Uuid,
    initiator: bool,
    ctx: ConnectionContext,
    transport: Arc<dyn Transport>,
    signal_tx: mpsc::UnboundedSender<TransportSignal>,
    state_tx: watch::Sender<ConnectionState>,
    inner: Mutex<ConnectionInner>,
}

impl Connection {
    /// Create a connection and its transport. Nothing is sent until
    /// `make_offer` or `open_connection` is called.
    pub fn new(
        ctx: ConnectionContext,
        remote_id: PeerId,
        session_id: Uuid,
        initiator: bool,
    ) -> Result<Arc<Self>, ConnectionError> {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let transport = ctx.transport_factory.create(TransportOptions {
            topic: ctx.topic,
            own_id: ctx.own_id,
            remote_id,
            session_id,
            initiator,
            send_signal: signal_sender(&ctx, remote_id, session_id),
            events: events_tx,
        })?;
        let (signal_tx, signal_rx) = mpsc::unbounded_channel();
        let (state_tx, _) = watch::channel(ConnectionState::Initial);

        let connection = Arc::new(Self {
            remote_id,
            session_id,
            initiator,
            ctx,
            transport,
            signal_tx,
            state_tx,
            inner: Mutex::new(ConnectionInner {
                state: ConnectionState::Initial,
                pending_signals: Some(signal_rx),
                tasks: Vec::new(),
            }),
        });

        let task = tokio::spawn(drive_transport(Arc::downgrade(&connection), events_rx));
        connection.inner.lock().tasks.push(task);
        debug!(
            "Created {} connection {} -> {} ({})",
            connection.transport.kind(),
            connection.ctx.own_id.truncate(),
            remote_id.truncate(),
            session_id
        );
        Ok(connection)
    }

    pub fn remote_id(&self) -> PeerId {
        self.remote_id
    }

    pub fn session_id(&self) -> Uuid {
        self.session_id
    }

    pub fn initiator(&self) -> bool {
        self.initiator
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.lock().state
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }

    /// Send an offer and start the transport once it is accepted
    pub async fn make_offer(self: &Arc<Self>) -> Result<(), ConnectionError> {
        self.transition(&[ConnectionState::Initial], ConnectionState::Offering)?;

        let message = SignalMessage::new(
            self.ctx.own_id,
            self.remote_id,
            self.ctx.topic,
            self.session_id,
            SignalPayload::Offer,
        );
        let answer = match tokio::time::timeout(self.ctx.offer_timeout, self.ctx.router.offer(message)).await {
            Ok(Ok(answer)) => answer,
            Ok(Err(e)) => return self.fail_offer(e.into()).await,
            Err(_) => return self.fail_offer(ConnectionError::OfferTimeout).await,
        };

        if !answer.accept {
            return self.fail_offer(ConnectionError::OfferRejected).await;
        }
        if self
            .transition(&[ConnectionState::Offering], ConnectionState::InitiatingConnection)
            .is_err()
        {
            debug!("Offer to {} accepted after close", self.remote_id.truncate());
            return Ok(());
        }
        self.start_transport().await
    }

    /// Accept side: wait for the initiator's transport
    pub async fn open_connection(self: &Arc<Self>) -> Result<(), ConnectionError> {
        self.transition(&[ConnectionState::Initial], ConnectionState::WaitingForConnection)?;
        self.start_transport().await
    }

    /// Queue a remote transport signal
    pub fn signal(&self, signal: TransportSignal) {
        if self.signal_tx.send(signal).is_err() {
            debug!("Dropping signal for finished connection {}", self.session_id);
        }
    }

    /// Close the connection and its transport. Idempotent.
    pub async fn close(&self) -> Result<(), ConnectionError> {
        let tasks = {
            let mut inner = self.inner.lock();
            if inner.state.is_closed() {
                return Ok(());
            }
            self.apply_state(&mut inner, ConnectionState::Closed);
            inner.pending_signals = None;
            std::mem::take(&mut inner.tasks)
        };

        let result = self.transport.close().await;
        for task in tasks {
            task.abort();
        }
        result.map_err(ConnectionError::from)
    }

    async fn fail_offer(&self, error: ConnectionError) -> Result<(), ConnectionError> {
        if self.state().is_closed() {
            debug!(
                "Offer to {} ended after close: {}",
                self.remote_id.truncate(),
                error
            );
            return Ok(());
        }
        let _ = self.close().await;
        Err(error)
    }

    async fn start_transport(self: &Arc<Self>) -> Result<(), ConnectionError> {
        if let Err(e) = self.transport.connect().await {
            let _ = self.close().await;
            return Err(e.into());
        }

        let pending = {
            let mut inner = self.inner.lock();
            if inner.state.is_closed() {
                return Ok(());
            }
            inner.pending_signals.take()
        };
        let Some(mut pending) = pending else {
            return Ok(());
        };

        let weak = Arc::downgrade(self);
        let transport = Arc::clone(&self.transport);
        let pump = tokio::spawn(async move {
            while let Some(signal) = pending.recv().await {
                if let Err(e) = transport.signal(signal).await {
                    if let Some(connection) = weak.upgrade() {
                        connection.report(e.into());
                        let _ = connection.close().await;
                    }
                    break;
                }
            }
        });
        let deadline = tokio::spawn(expire_negotiation(
            Arc::downgrade(self),
            self.ctx.connect_timeout,
        ));
        self.inner.lock().tasks.extend([pump, deadline]);
        Ok(())
    }

    fn on_transport_connected(self: &Arc<Self>, mut channel: WireChannel) {
        if self
            .transition(
                &[
                    ConnectionState::InitiatingConnection,
                    ConnectionState::WaitingForConnection,
                ],
                ConnectionState::Connected,
            )
            .is_err()
        {
            debug!("Ignoring transport connect in state {}", self.state());
            return;
        }

        let mut protocol = self.ctx.protocol.create(ProtocolContext {
            topic: self.ctx.topic,
            local_peer_id: self.ctx.own_id,
            remote_peer_id: self.remote_id,
            session_id: self.session_id,
            initiator: self.initiator,
        });
        let weak = Arc::downgrade(self);
        let task = tokio::spawn(async move {
            let handshake = protocol.handshake(&mut channel).await;
            let result = match handshake {
                Ok(()) => {
                    if let Some(connection) = weak.upgrade() {
                        connection.emit(NetworkEvent::ProtocolHandshake {
                            topic: connection.ctx.topic,
                            peer_id: connection.ctx.own_id,
                            remote_id: connection.remote_id,
                            session_id: connection.session_id,
                        });
                    }
                    protocol.run(channel).await
                }
                Err(e) => Err(e),
            };

            let Some(connection) = weak.upgrade() else {
                return;
            };
            if let Err(e) = result {
                connection.emit(NetworkEvent::ProtocolError {
                    topic: connection.ctx.topic,
                    peer_id: connection.ctx.own_id,
                    remote_id: connection.remote_id,
                    session_id: connection.session_id,
                    error: e.to_string(),
                });
                connection.report(e);
            }
            let _ = connection.close().await;
        });
        self.inner.lock().tasks.push(task);
    }

    fn transition(
        &self,
        from: &[ConnectionState],
        to: ConnectionState,
    ) -> Result<(), ConnectionError> {
        let mut inner = self.inner.lock();
        if !from.contains(&inner.state) {
            return Err(ConnectionError::InvalidState(format!(
                "Cannot move from {} to {}",
                inner.state, to
            )));
        }
        self.apply_state(&mut inner, to);
        Ok(())
    }

    /// Caller holds the inner lock, so state changes are published in order
    fn apply_state(&self, inner: &mut ConnectionInner, state: ConnectionState) {
        debug!(
            "Connection {} -> {}: {} -> {}",
            self.ctx.own_id.truncate(),
            self.remote_id.truncate(),
            inner.state,
            state
        );
        inner.state = state;
        self.state_tx.send_replace(state);
        let _ = self.ctx.notices.send(ConnectionNotice::StateChanged {
            remote_id: self.remote_id,
            session_id: self.session_id,
            state,
        });
        self.emit(NetworkEvent::ConnectionStateChanged {
            topic: self.ctx.topic,
            peer_id: self.ctx.own_id,
            remote_id: self.remote_id,
            session_id: self.session_id,
            state,
        });
    }

    fn emit(&self, event: NetworkEvent) {
        self.ctx.event_log.emit(event);
    }

    fn report(&self, error: ConnectionError) {
        warn!(
            "Connection {} -> {} failed: {}",
            self.ctx.own_id.truncate(),
            self.remote_id.truncate(),
            error
        );
        let _ = self.ctx.notices.send(ConnectionNotice::Error {
            remote_id: self.remote_id,
            session_id: self.session_id,
            error,
        });
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        for task in self.inner.get_mut().tasks.drain(..) {
            task.abort();
        }
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("remote_id", &self.remote_id)
            .field("session_id", &self.session_id)
            .field("initiator", &self.initiator)
            .field("state", &self.state())
            .finish()
    }
}

/// Local transport signals are sent reliably, each on its own task
fn signal_sender(
    ctx: &ConnectionContext,
    remote_id: PeerId,
    session_id: Uuid,
) -> crate::transport::SignalSender {
    let router = Arc::clone(&ctx.router);
    let notices = ctx.notices.clone();
    let (topic, own_id) = (ctx.topic, ctx.own_id);
    Arc::new(move |signal: TransportSignal| {
        let message = SignalMessage::new(
            own_id,
            remote_id,
            topic,
            session_id,
            SignalPayload::Signal(signal),
        );
        let router = Arc::clone(&router);
        let notices = notices.clone();
        tokio::spawn(async move {
            if let Err(e) = router.signal(message).await {
                let _ = notices.send(ConnectionNotice::Error {
                    remote_id,
                    session_id,
                    error: e.into(),
                });
            }
        });
    })
}

/// Close a connection whose transport is still negotiating after `timeout`
async fn expire_negotiation(connection: Weak<Connection>, timeout: Duration) {
    tokio::time::sleep(timeout).await;
    let Some(connection) = connection.upgrade() else {
        return;
    };
    if matches!(
        connection.state(),
        ConnectionState::InitiatingConnection | ConnectionState::WaitingForConnection
    ) {
        connection.report(ConnectionError::ConnectTimeout);
        let _ = connection.close().await;
    }
}

async fn drive_transport(
    connection: Weak<Connection>,
    mut events: mpsc::UnboundedReceiver<TransportEvent>,
) {
    while let Some(event) = events.recv().await {
        let Some(connection) = connection.upgrade() else {
            break;
        };
        debug!(
            "Transport event for {}: {}",
            connection.remote_id.truncate(),
            event
        );
        match event {
            TransportEvent::Connected(channel) => connection.on_transport_connected(channel),
            TransportEvent::Closed => {
                let _ = connection.close().await;
            }
            TransportEvent::Error(e) => {
                connection.report(e.into());
                let _ = connection.close().await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RouterConfig;
    use crate::signal::{Answer, InMemorySignalManager, SignalBroker, SignalEvent, SignalManager};
    use crate::testing::{RecordingTransportFactory, TestProtocolEvent, TestProtocolPlugin};
    use crate::transport::{MemoryTransportFactory, MemoryTransportRegistry};
    use tokio::time::timeout;

    struct Peer {
        ctx: ConnectionContext,
        manager: Arc<InMemorySignalManager>,
        plugin: TestProtocolPlugin,
        notices: mpsc::UnboundedReceiver<ConnectionNotice>,
    }

    fn peer(broker: &SignalBroker, registry: &MemoryTransportRegistry, topic: Topic) -> Peer {
        let own_id = PeerId::random();
        let manager = Arc::new(InMemorySignalManager::new(broker.clone()));
        let router = Arc::new(MessageRouter::new(manager.clone(), RouterConfig::default()));
        let plugin = TestProtocolPlugin::new(own_id);
        let (notices_tx, notices) = mpsc::unbounded_channel();
        Peer {
            ctx: ConnectionContext {
                topic,
                own_id,
                router,
                transport_factory: Arc::new(MemoryTransportFactory::new(
                    registry.clone(),
                    Duration::from_millis(1),
                )),
                protocol: plugin.provider(),
                event_log: Arc::new(NetworkEventLog::new(true)),
                offer_timeout: Duration::from_secs(2),
                connect_timeout: Duration::from_secs(5),
                notices: notices_tx,
            },
            manager,
            plugin,
            notices,
        }
    }

    async fn wait_for(connection: &Connection, state: ConnectionState) {
        let mut rx = connection.subscribe_state();
        timeout(Duration::from_secs(5), rx.wait_for(|s| *s == state))
            .await
            .expect("state not reached")
            .unwrap();
    }

    #[tokio::test]
    async fn test_offer_accept_connect_and_close() {
        let (broker, registry, topic) = (SignalBroker::new(), MemoryTransportRegistry::new(), Topic::random());
        let a = peer(&broker, &registry, topic);
        let b = peer(&broker, &registry, topic);
        a.manager.join(topic, a.ctx.own_id).await.unwrap();
        b.manager.join(topic, b.ctx.own_id).await.unwrap();
        let mut b_events = b.manager.take_events().unwrap();
        let mut b_protocol = b.plugin.subscribe();

        let session = Uuid::new_v4();
        let a_conn = Connection::new(a.ctx.clone(), b.ctx.own_id, session, true).unwrap();
        let offer = tokio::spawn({
            let a_conn = Arc::clone(&a_conn);
            async move { a_conn.make_offer().await }
        });

        // Answer the offer on b's side
        let b_conn = loop {
            match timeout(Duration::from_secs(5), b_events.recv()).await.unwrap().unwrap() {
                SignalEvent::Offer { message, responder } => {
                    assert_eq!(message.session_id, session);
                    let conn = Connection::new(b.ctx.clone(), message.author, message.session_id, false).unwrap();
                    conn.open_connection().await.unwrap();
                    responder.send(Answer::ACCEPT).unwrap();
                    break conn;
                }
                _ => continue,
            }
        };
        offer.await.unwrap().unwrap();

        wait_for(&a_conn, ConnectionState::Connected).await;
        wait_for(&b_conn, ConnectionState::Connected).await;
        assert_eq!(
            timeout(Duration::from_secs(5), b_protocol.recv()).await.unwrap().unwrap(),
            TestProtocolEvent::Connect(a.ctx.own_id)
        );

        a_conn.close().await.unwrap();
        assert_eq!(a_conn.state(), ConnectionState::Closed);
        wait_for(&b_conn, ConnectionState::Closed).await;
        // Closing twice is harmless
        a_conn.close().await.unwrap();

        let history: Vec<_> = a
            .ctx
            .event_log
            .history()
            .into_iter()
            .filter_map(|r| match r.event {
                NetworkEvent::ConnectionStateChanged { state, .. } => Some(state),
                _ => None,
            })
            .collect();
        assert_eq!(
            history,
            vec![
                ConnectionState::Offering,
                ConnectionState::InitiatingConnection,
                ConnectionState::Connected,
                ConnectionState::Closed
            ]
        );
    }

    #[tokio::test]
    async fn test_rejected_offer_closes() {
        let (broker, registry, topic) = (SignalBroker::new(), MemoryTransportRegistry::new(), Topic::random());
        let mut a = peer(&broker, &registry, topic);
        let b = peer(&broker, &registry, topic);
        b.manager.join(topic, b.ctx.own_id).await.unwrap();
        let mut b_events = b.manager.take_events().unwrap();

        let a_conn = Connection::new(a.ctx.clone(), b.ctx.own_id, Uuid::new_v4(), true).unwrap();
        let offer = tokio::spawn({
            let a_conn = Arc::clone(&a_conn);
            async move { a_conn.make_offer().await }
        });
        loop {
            if let SignalEvent::Offer { responder, .. } = b_events.recv().await.unwrap() {
                responder.send(Answer::REJECT).unwrap();
                break;
            }
        }

        assert_eq!(offer.await.unwrap(), Err(ConnectionError::OfferRejected));
        assert_eq!(a_conn.state(), ConnectionState::Closed);

        let mut states = Vec::new();
        while let Ok(notice) = a.notices.try_recv() {
            if let ConnectionNotice::StateChanged { state, .. } = notice {
                states.push(state);
            }
        }
        assert_eq!(states, vec![ConnectionState::Offering, ConnectionState::Closed]);
    }

    #[tokio::test]
    async fn test_invalid_transitions() {
        let (broker, registry, topic) = (SignalBroker::new(), MemoryTransportRegistry::new(), Topic::random());
        let a = peer(&broker, &registry, topic);
        let conn = Connection::new(a.ctx.clone(), PeerId::random(), Uuid::new_v4(), false).unwrap();
        conn.open_connection().await.unwrap();
        assert_eq!(conn.state(), ConnectionState::WaitingForConnection);
        assert!(matches!(
            conn.make_offer().await,
            Err(ConnectionError::InvalidState(_))
        ));

        conn.close().await.unwrap();
        assert!(matches!(
            conn.open_connection().await,
            Err(ConnectionError::InvalidState(_))
        ));
        // Signals after close are dropped quietly
        conn.signal(TransportSignal::Candidate {
            candidate: "candidate".into(),
            sdp_mid: None,
            sdp_mline_index: None,
        });
    }

    fn candidate(n: u32) -> TransportSignal {
        TransportSignal::Candidate {
            candidate: format!("candidate:{}", n),
            sdp_mid: Some("0".into()),
            sdp_mline_index: Some(0),
        }
    }

    #[tokio::test]
    async fn test_early_signals_replayed_in_arrival_order() {
        let (broker, registry, topic) = (SignalBroker::new(), MemoryTransportRegistry::new(), Topic::random());
        let a = peer(&broker, &registry, topic);
        let transports = RecordingTransportFactory::new();
        let mut ctx = a.ctx.clone();
        ctx.transport_factory = Arc::new(transports.clone());

        let session = Uuid::new_v4();
        let conn = Connection::new(ctx, PeerId::random(), session, false).unwrap();
        let description = TransportSignal::Description {
            sdp_type: "offer".into(),
            sdp: "v=0".into(),
        };
        conn.signal(description.clone());
        for n in 0..3 {
            conn.signal(candidate(n));
        }
        tokio::task::yield_now().await;
        assert!(transports.signals(session).is_empty());

        conn.open_connection().await.unwrap();
        conn.signal(candidate(3));

        let expected = vec![description, candidate(0), candidate(1), candidate(2), candidate(3)];
        timeout(Duration::from_secs(5), async {
            while transports.signals(session).len() < expected.len() {
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
        })
        .await
        .expect("signals not replayed");
        assert_eq!(transports.signals(session), expected);
    }

    #[tokio::test]
    async fn test_negotiation_expires_without_remote() {
        let (broker, registry, topic) = (SignalBroker::new(), MemoryTransportRegistry::new(), Topic::random());
        let mut a = peer(&broker, &registry, topic);
        let mut ctx = a.ctx.clone();
        ctx.connect_timeout = Duration::from_millis(100);

        // Nobody ever shows up on the other side of the memory transport
        let conn = Connection::new(ctx, PeerId::random(), Uuid::new_v4(), false).unwrap();
        conn.open_connection().await.unwrap();
        assert_eq!(conn.state(), ConnectionState::WaitingForConnection);
        wait_for(&conn, ConnectionState::Closed).await;

        let mut errors = Vec::new();
        while let Ok(notice) = a.notices.try_recv() {
            if let ConnectionNotice::Error { error, .. } = notice {
                errors.push(error);
            }
        }
        assert_eq!(errors, vec![ConnectionError::ConnectTimeout]);
    }

    #[test]
    fn test_state_display() {
        assert_eq!(ConnectionState::WaitingForConnection.to_string(), "WAITING_FOR_CONNECTION");
        assert_eq!(
            serde_json::to_string(&ConnectionState::InitiatingConnection).unwrap(),
            "\"INITIATING_CONNECTION\""
        );
    }
}
