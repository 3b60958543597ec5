//! Signal Server - websocket rendezvous for swarm peers
//!
//! Tracks which peers are announced in which topic, relays one-way messages
//! by recipient and relays offers, holding the offerer's request open until
//! the recipient answers.

use super::message::{Answer, Frame, ResponseBody, ServerPush, SignalRequest, SwarmEvent};
use crate::error::SignalError;
use crate::keys::{PeerId, Topic};
use futures::{SinkExt, StreamExt};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_tungstenite::accept_async;
use tokio_tungstenite::tungstenite::protocol::Message;
use tracing::{debug, info, warn};

/// Signal server configuration
#[derive(Debug, Clone)]
pub struct SignalServerConfig {
    /// How long an offer is held open waiting for the recipient's answer
    pub offer_timeout: Duration,
    /// Maximum concurrent websocket connections
    pub max_connections: usize,
}

impl Default for SignalServerConfig {
    fn default() -> Self {
        Self {
            offer_timeout: Duration::from_secs(10),
            max_connections: 1000,
        }
    }
}

/// Statistics about signal server operations
#[derive(Debug, Clone, Default)]
pub struct SignalServerStats {
    pub connections_active: usize,
    pub topics_active: usize,
    pub messages_relayed: u64,
    pub offers_relayed: u64,
}

type ConnectionId = u64;

#[derive(Default)]
struct ServerState {
    connections: HashMap<ConnectionId, mpsc::UnboundedSender<Message>>,
    /// topic -> peer -> connection it was announced on
    topics: HashMap<Topic, HashMap<PeerId, ConnectionId>>,
}

/// The signal server
pub struct SignalServer {
    config: SignalServerConfig,
    state: RwLock<ServerState>,
    pending_offers: Mutex<HashMap<u64, oneshot::Sender<Answer>>>,
    stats: RwLock<SignalServerStats>,
    next_connection: AtomicU64,
    next_offer: AtomicU64,
    accept_task: Mutex<Option<JoinHandle<()>>>,
}

impl SignalServer {
    /// Create a new signal server with default configuration
    pub fn new() -> Arc<Self> {
        Self::with_config(SignalServerConfig::default())
    }

    /// Create a new signal server with custom configuration
    pub fn with_config(config: SignalServerConfig) -> Arc<Self> {
        Arc::new(Self {
            config,
            state: RwLock::new(ServerState::default()),
            pending_offers: Mutex::new(HashMap::new()),
            stats: RwLock::new(SignalServerStats::default()),
            next_connection: AtomicU64::new(1),
            next_offer: AtomicU64::new(1),
            accept_task: Mutex::new(None),
        })
    }

    /// Bind `addr` and start accepting websocket connections
    pub async fn listen(self: &Arc<Self>, addr: &str) -> Result<SocketAddr, SignalError> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| SignalError::NotConnected(format!("{}: {}", addr, e)))?;
        let local = listener
            .local_addr()
            .map_err(|e| SignalError::NotConnected(e.to_string()))?;
        info!("Signal server listening on {}", local);

        let server = Arc::clone(self);
        let task = tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, peer_addr)) => {
                        let server = Arc::clone(&server);
                        tokio::spawn(async move {
                            server.serve_connection(stream, peer_addr).await;
                        });
                    }
                    Err(e) => {
                        warn!("Accept failed: {}", e);
                    }
                }
            }
        });
        if let Some(previous) = self.accept_task.lock().replace(task) {
            previous.abort();
        }
        Ok(local)
    }

    /// Stop accepting and drop every connection
    pub fn shutdown(&self) {
        if let Some(task) = self.accept_task.lock().take() {
            task.abort();
        }
        let mut state = self.state.write();
        state.connections.clear();
        state.topics.clear();
        self.pending_offers.lock().clear();
        info!("Signal server shut down");
    }

    pub fn get_stats(&self) -> SignalServerStats {
        let state = self.state.read();
        let mut stats = self.stats.read().clone();
        stats.connections_active = state.connections.len();
        stats.topics_active = state.topics.len();
        stats
    }

    /// Peers currently announced in `topic`
    pub fn members(&self, topic: &Topic) -> Vec<PeerId> {
        self.state
            .read()
            .topics
            .get(topic)
            .map(|members| members.keys().copied().collect())
            .unwrap_or_default()
    }

    async fn serve_connection(self: Arc<Self>, stream: TcpStream, peer_addr: SocketAddr) {
        let socket = match accept_async(stream).await {
            Ok(socket) => socket,
            Err(e) => {
                debug!("Websocket handshake with {} failed: {}", peer_addr, e);
                return;
            }
        };
        let (mut sink, mut source) = socket.split();
        let (tx, mut rx) = mpsc::unbounded_channel::<Message>();
        let Some(connection) = self.register_connection(tx) else {
            warn!("Connection limit reached, rejecting {}", peer_addr);
            let _ = sink.close().await;
            return;
        };
        debug!("Signal connection {} from {}", connection, peer_addr);

        let writer = tokio::spawn(async move {
            while let Some(message) = rx.recv().await {
                if sink.send(message).await.is_err() {
                    return;
                }
            }
            // Dropped from the connection table: tell the client
            let _ = sink.close().await;
        });

        while let Some(message) = source.next().await {
            match message {
                Ok(Message::Text(text)) => match Frame::decode(&text) {
                    Ok(Frame::Request { id, request }) => {
                        Arc::clone(&self).handle_request(connection, id, request);
                    }
                    Ok(other) => warn!("Unexpected frame from {}: {:?}", peer_addr, other),
                    Err(e) => warn!("Bad frame from {}: {}", peer_addr, e),
                },
                Ok(Message::Close(_)) => break,
                Ok(_) => {}
                Err(e) => {
                    debug!("Connection {} errored: {}", connection, e);
                    break;
                }
            }
        }

        self.remove_connection(connection);
        writer.abort();
        debug!("Signal connection {} closed", connection);
    }

    fn register_connection(&self, tx: mpsc::UnboundedSender<Message>) -> Option<ConnectionId> {
        let mut state = self.state.write();
        if state.connections.len() >= self.config.max_connections {
            return None;
        }
        let id = self.next_connection.fetch_add(1, Ordering::Relaxed);
        state.connections.insert(id, tx);
        Some(id)
    }

    /// Forget a connection and announce every peer it carried as gone
    fn remove_connection(&self, connection: ConnectionId) {
        let departed: Vec<(Topic, PeerId)> = {
            let mut state = self.state.write();
            state.connections.remove(&connection);
            state
                .topics
                .iter()
                .flat_map(|(topic, members)| {
                    members
                        .iter()
                        .filter(|(_, owner)| **owner == connection)
                        .map(move |(peer, _)| (*topic, *peer))
                })
                .collect()
        };
        for (topic, peer) in departed {
            self.leave(topic, peer);
        }
    }

    fn handle_request(self: Arc<Self>, connection: ConnectionId, id: u64, request: SignalRequest) {
        match request {
            SignalRequest::Join { topic, peer_id } => {
                let peers = self.join(connection, topic, peer_id);
                self.respond(connection, id, Ok(ResponseBody::Peers(peers)));
            }
            SignalRequest::Leave { topic, peer_id } => {
                self.leave(topic, peer_id);
                self.respond(connection, id, Ok(ResponseBody::Done));
            }
            SignalRequest::Lookup { topic } => {
                let peers = self.members(&topic);
                self.respond(connection, id, Ok(ResponseBody::Peers(peers)));
            }
            SignalRequest::Signal(message) => {
                match self.route(&message.topic, &message.recipient) {
                    Some(target) => {
                        self.push(target, ServerPush::Message(message));
                        self.stats.write().messages_relayed += 1;
                    }
                    None => debug!(
                        "Dropping {} for unknown peer {}",
                        message.data.kind(),
                        message.recipient.truncate()
                    ),
                }
                self.respond(connection, id, Ok(ResponseBody::Done));
            }
            SignalRequest::Offer(message) => {
                let Some(target) = self.route(&message.topic, &message.recipient) else {
                    let error = format!("Peer {} not in topic", message.recipient);
                    self.respond(connection, id, Err(error));
                    return;
                };
                let request_id = self.next_offer.fetch_add(1, Ordering::Relaxed);
                let (tx, rx) = oneshot::channel();
                self.pending_offers.lock().insert(request_id, tx);
                self.push(target, ServerPush::Offer { request_id, message });
                self.stats.write().offers_relayed += 1;

                tokio::spawn(async move {
                    let result = match tokio::time::timeout(self.config.offer_timeout, rx).await {
                        Ok(Ok(answer)) => Ok(ResponseBody::Answer(answer)),
                        Ok(Err(_)) => Err("Offer dropped".to_string()),
                        Err(_) => {
                            self.pending_offers.lock().remove(&request_id);
                            Err("Offer timed out".to_string())
                        }
                    };
                    self.respond(connection, id, result);
                });
            }
            SignalRequest::Answer { request_id, answer } => {
                let result = match self.pending_offers.lock().remove(&request_id) {
                    Some(tx) => {
                        let _ = tx.send(answer);
                        Ok(ResponseBody::Done)
                    }
                    None => Err(format!("Unknown offer {}", request_id)),
                };
                self.respond(connection, id, result);
            }
        }
    }

    /// Add a member; returns the peers that were already present
    fn join(&self, connection: ConnectionId, topic: Topic, peer_id: PeerId) -> Vec<PeerId> {
        let (existing, targets) = {
            let mut state = self.state.write();
            let members = state.topics.entry(topic).or_default();
            let fresh = members.insert(peer_id, connection).is_none();
            let existing: Vec<(PeerId, ConnectionId)> = members
                .iter()
                .filter(|(peer, _)| **peer != peer_id)
                .map(|(peer, owner)| (*peer, *owner))
                .collect();
            let targets: Vec<ConnectionId> = if fresh {
                existing.iter().map(|(_, owner)| *owner).collect()
            } else {
                Vec::new()
            };
            (existing, targets)
        };

        debug!("{} joined {}", peer_id.truncate(), topic.truncate());
        for target in targets {
            self.push(
                target,
                ServerPush::Swarm {
                    topic,
                    event: SwarmEvent::PeerAvailable { peer: peer_id },
                },
            );
        }
        existing.into_iter().map(|(peer, _)| peer).collect()
    }

    fn leave(&self, topic: Topic, peer_id: PeerId) {
        let targets: Vec<ConnectionId> = {
            let mut state = self.state.write();
            let Some(members) = state.topics.get_mut(&topic) else {
                return;
            };
            if members.remove(&peer_id).is_none() {
                return;
            }
            let targets = members.values().copied().collect();
            if members.is_empty() {
                state.topics.remove(&topic);
            }
            targets
        };

        debug!("{} left {}", peer_id.truncate(), topic.truncate());
        for target in targets {
            self.push(
                target,
                ServerPush::Swarm {
                    topic,
                    event: SwarmEvent::PeerLeft { peer: peer_id },
                },
            );
        }
    }

    fn route(&self, topic: &Topic, peer: &PeerId) -> Option<ConnectionId> {
        self.state
            .read()
            .topics
            .get(topic)
            .and_then(|members| members.get(peer).copied())
    }

    fn push(&self, connection: ConnectionId, event: ServerPush) {
        self.send_frame(connection, Frame::Push { event });
    }

    fn respond(&self, connection: ConnectionId, id: u64, result: Result<ResponseBody, String>) {
        self.send_frame(connection, Frame::Response { id, result });
    }

    fn send_frame(&self, connection: ConnectionId, frame: Frame) {
        let text = match frame.encode() {
            Ok(text) => text,
            Err(e) => {
                warn!("Failed to encode frame: {}", e);
                return;
            }
        };
        if let Some(tx) = self.state.read().connections.get(&connection) {
            let _ = tx.send(Message::Text(text));
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signal::{SignalMessage, SignalPayload};
    use uuid::Uuid;

    fn fake_connection(server: &SignalServer) -> (ConnectionId, mpsc::UnboundedReceiver<Message>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (server.register_connection(tx).unwrap(), rx)
    }

    fn next_frame(rx: &mut mpsc::UnboundedReceiver<Message>) -> Frame {
        match rx.try_recv() {
            Ok(Message::Text(text)) => Frame::decode(&text).unwrap(),
            other => panic!("Expected text frame, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_join_notifies_existing_members() {
        let server = SignalServer::new();
        let (a, mut a_rx) = fake_connection(&server);
        let (b, mut b_rx) = fake_connection(&server);
        let topic = Topic::random();
        let (peer_a, peer_b) = (PeerId::random(), PeerId::random());

        Arc::clone(&server).handle_request(a, 1, SignalRequest::Join { topic, peer_id: peer_a });
        assert_eq!(
            next_frame(&mut a_rx),
            Frame::Response {
                id: 1,
                result: Ok(ResponseBody::Peers(vec![]))
            }
        );

        Arc::clone(&server).handle_request(b, 1, SignalRequest::Join { topic, peer_id: peer_b });
        assert_eq!(
            next_frame(&mut a_rx),
            Frame::Push {
                event: ServerPush::Swarm {
                    topic,
                    event: SwarmEvent::PeerAvailable { peer: peer_b }
                }
            }
        );
        assert_eq!(
            next_frame(&mut b_rx),
            Frame::Response {
                id: 1,
                result: Ok(ResponseBody::Peers(vec![peer_a]))
            }
        );
        assert_eq!(server.get_stats().topics_active, 1);
    }

    #[tokio::test]
    async fn test_disconnect_announces_departure() {
        let server = SignalServer::new();
        let (a, mut a_rx) = fake_connection(&server);
        let (b, _b_rx) = fake_connection(&server);
        let topic = Topic::random();
        let peer_b = PeerId::random();

        Arc::clone(&server).handle_request(a, 1, SignalRequest::Join { topic, peer_id: PeerId::random() });
        Arc::clone(&server).handle_request(b, 1, SignalRequest::Join { topic, peer_id: peer_b });
        let _ = next_frame(&mut a_rx);
        let _ = next_frame(&mut a_rx);

        server.remove_connection(b);
        assert_eq!(
            next_frame(&mut a_rx),
            Frame::Push {
                event: ServerPush::Swarm {
                    topic,
                    event: SwarmEvent::PeerLeft { peer: peer_b }
                }
            }
        );
        assert_eq!(server.members(&topic).len(), 1);
        assert_eq!(server.get_stats().connections_active, 1);
    }

    #[tokio::test]
    async fn test_signal_relay_by_recipient() {
        let server = SignalServer::new();
        let (a, mut a_rx) = fake_connection(&server);
        let (b, mut b_rx) = fake_connection(&server);
        let topic = Topic::random();
        let (peer_a, peer_b) = (PeerId::random(), PeerId::random());
        Arc::clone(&server).handle_request(a, 1, SignalRequest::Join { topic, peer_id: peer_a });
        Arc::clone(&server).handle_request(b, 1, SignalRequest::Join { topic, peer_id: peer_b });
        while a_rx.try_recv().is_ok() {}
        while b_rx.try_recv().is_ok() {}

        let message = SignalMessage::new(
            peer_a,
            peer_b,
            topic,
            Uuid::new_v4(),
            SignalPayload::Ack {
                message_id: Uuid::new_v4(),
            },
        );
        Arc::clone(&server).handle_request(a, 2, SignalRequest::Signal(message.clone()));
        assert_eq!(
            next_frame(&mut b_rx),
            Frame::Push {
                event: ServerPush::Message(message)
            }
        );
        assert_eq!(server.get_stats().messages_relayed, 1);
    }

    #[tokio::test]
    async fn test_offer_to_unknown_peer_fails() {
        let server = SignalServer::new();
        let (a, mut a_rx) = fake_connection(&server);
        let message = SignalMessage::new(
            PeerId::random(),
            PeerId::random(),
            Topic::random(),
            Uuid::new_v4(),
            SignalPayload::Offer,
        );
        Arc::clone(&server).handle_request(a, 5, SignalRequest::Offer(message));
        assert!(matches!(
            next_frame(&mut a_rx),
            Frame::Response { id: 5, result: Err(_) }
        ));
    }

    #[tokio::test]
    async fn test_connection_limit() {
        let server = SignalServer::with_config(SignalServerConfig {
            max_connections: 1,
            ..Default::default()
        });
        let (tx, _rx) = mpsc::unbounded_channel();
        assert!(server.register_connection(tx.clone()).is_some());
        assert!(server.register_connection(tx).is_none());
    }
}
