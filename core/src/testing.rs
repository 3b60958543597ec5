//! Test harness
//!
//! `TestProtocolPlugin` is a minimal protocol used by tests and the CLI: the
//! handshake exchanges peer ids, after which raw frames can be sent to any
//! connected peer and every connect/receive/disconnect is broadcast to
//! subscribers.
//!
//! `RecordingTransportFactory` builds transports that never connect. They
//! record the remote signals they are fed and can be told to fail on close.

use crate::error::{ConnectionError, TransportError};
use crate::keys::PeerId;
use crate::protocol::{Protocol, ProtocolContext, ProtocolProvider, SharedProtocolProvider};
use crate::signal::TransportSignal;
use crate::transport::{
    Transport, TransportFactory, TransportKind, TransportOptions, WireChannel, WireSender,
};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::debug;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TestProtocolEvent {
    Connect(PeerId),
    Receive { peer: PeerId, data: Vec<u8> },
    Disconnect(PeerId),
}

#[derive(Clone)]
pub struct TestProtocolPlugin {
    peer_id: PeerId,
    peers: Arc<Mutex<HashMap<PeerId, (Uuid, WireSender)>>>,
    events: broadcast::Sender<TestProtocolEvent>,
}

impl TestProtocolPlugin {
    pub fn new(peer_id: PeerId) -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            peer_id,
            peers: Arc::new(Mutex::new(HashMap::new())),
            events,
        }
    }

    pub fn peer_id(&self) -> PeerId {
        self.peer_id
    }

    /// Provider to hand to `JoinSwarmOptions`
    pub fn provider(&self) -> SharedProtocolProvider {
        Arc::new(self.clone())
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TestProtocolEvent> {
        self.events.subscribe()
    }

    /// Peers with an open protocol
    pub fn connected(&self) -> Vec<PeerId> {
        let mut peers: Vec<_> = self.peers.lock().keys().copied().collect();
        peers.sort();
        peers
    }

    pub fn send(&self, peer: &PeerId, data: Vec<u8>) -> Result<(), TransportError> {
        let sender = self
            .peers
            .lock()
            .get(peer)
            .map(|(_, sender)| sender.clone())
            .ok_or_else(|| TransportError::SendFailed(format!("Not connected to {}", peer.truncate())))?;
        sender.send(data)
    }
}

impl ProtocolProvider for TestProtocolPlugin {
    fn create(&self, context: ProtocolContext) -> Box<dyn Protocol> {
        Box::new(TestProtocol {
            context,
            plugin: self.clone(),
        })
    }
}

struct TestProtocol {
    context: ProtocolContext,
    plugin: TestProtocolPlugin,
}

/// Unregisters the peer when the protocol stops, including when its task is aborted
struct PeerGuard {
    plugin: TestProtocolPlugin,
    peer: PeerId,
    session_id: Uuid,
}

impl Drop for PeerGuard {
    fn drop(&mut self) {
        let removed = {
            let mut peers = self.plugin.peers.lock();
            match peers.get(&self.peer) {
                Some((session, _)) if *session == self.session_id => {
                    peers.remove(&self.peer);
                    true
                }
                _ => false,
            }
        };
        if removed {
            let _ = self.plugin.events.send(TestProtocolEvent::Disconnect(self.peer));
        }
    }
}

#[async_trait]
impl Protocol for TestProtocol {
    async fn handshake(&mut self, channel: &mut WireChannel) -> Result<(), ConnectionError> {
        channel.send(self.context.local_peer_id.as_bytes().to_vec())?;
        let frame = channel
            .recv()
            .await
            .ok_or_else(|| ConnectionError::Protocol("Channel closed during handshake".into()))?;
        let remote = PeerId::try_from(frame.as_slice())
            .map_err(|e| ConnectionError::Protocol(format!("Bad handshake: {}", e)))?;
        if remote != self.context.remote_peer_id {
            return Err(ConnectionError::Protocol(format!(
                "Handshake from unexpected peer {}",
                remote.truncate()
            )));
        }
        Ok(())
    }

    async fn run(self: Box<Self>, mut channel: WireChannel) -> Result<(), ConnectionError> {
        let peer = self.context.remote_peer_id;
        self.plugin
            .peers
            .lock()
            .insert(peer, (self.context.session_id, channel.sender()));
        let _guard = PeerGuard {
            plugin: self.plugin.clone(),
            peer,
            session_id: self.context.session_id,
        };
        debug!(
            "Test protocol {} open to {}",
            self.plugin.peer_id.truncate(),
            peer.truncate()
        );
        let _ = self.plugin.events.send(TestProtocolEvent::Connect(peer));

        while let Some(data) = channel.recv().await {
            let _ = self
                .plugin
                .events
                .send(TestProtocolEvent::Receive { peer, data });
        }
        Ok(())
    }
}

/// Creates `RecordingTransport`s sharing one signal log
#[derive(Clone, Default)]
pub struct RecordingTransportFactory {
    signals: Arc<Mutex<Vec<(Uuid, TransportSignal)>>>,
    fail_close: bool,
}

impl RecordingTransportFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every transport's `close` returns an error
    pub fn failing_close() -> Self {
        Self {
            fail_close: true,
            ..Self::default()
        }
    }

    /// Signals fed to transports of `session_id`, in the order they arrived
    pub fn signals(&self, session_id: Uuid) -> Vec<TransportSignal> {
        self.signals
            .lock()
            .iter()
            .filter(|(session, _)| *session == session_id)
            .map(|(_, signal)| signal.clone())
            .collect()
    }
}

impl TransportFactory for RecordingTransportFactory {
    fn create(&self, options: TransportOptions) -> Result<Arc<dyn Transport>, TransportError> {
        Ok(Arc::new(RecordingTransport {
            session_id: options.session_id,
            signals: Arc::clone(&self.signals),
            fail_close: self.fail_close,
        }))
    }
}

pub struct RecordingTransport {
    session_id: Uuid,
    signals: Arc<Mutex<Vec<(Uuid, TransportSignal)>>>,
    fail_close: bool,
}

#[async_trait]
impl Transport for RecordingTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::InMemory
    }

    async fn connect(&self) -> Result<(), TransportError> {
        Ok(())
    }

    async fn signal(&self, signal: TransportSignal) -> Result<(), TransportError> {
        self.signals.lock().push((self.session_id, signal));
        Ok(())
    }

    async fn close(&self) -> Result<(), TransportError> {
        if self.fail_close {
            return Err(TransportError::Internal("Close refused".to_string()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::Topic;

    fn context(local: PeerId, remote: PeerId, session_id: Uuid) -> ProtocolContext {
        ProtocolContext {
            topic: Topic::random(),
            local_peer_id: local,
            remote_peer_id: remote,
            session_id,
            initiator: false,
        }
    }

    #[tokio::test]
    async fn test_handshake_and_exchange() {
        let (a_id, b_id) = (PeerId::random(), PeerId::random());
        let session = Uuid::new_v4();
        let a = TestProtocolPlugin::new(a_id);
        let b = TestProtocolPlugin::new(b_id);
        let mut b_events = b.subscribe();

        let (mut a_chan, mut b_chan) = WireChannel::pair();
        let mut a_proto = a.create(context(a_id, b_id, session));
        let mut b_proto = b.create(context(b_id, a_id, session));
        let (ra, rb) = tokio::join!(a_proto.handshake(&mut a_chan), b_proto.handshake(&mut b_chan));
        ra.unwrap();
        rb.unwrap();

        let a_task = tokio::spawn(a_proto.run(a_chan));
        let _b_task = tokio::spawn(b_proto.run(b_chan));

        assert_eq!(b_events.recv().await.unwrap(), TestProtocolEvent::Connect(a_id));
        // a registers asynchronously as well
        while a.connected().is_empty() {
            tokio::task::yield_now().await;
        }
        a.send(&b_id, b"1234".to_vec()).unwrap();
        assert_eq!(
            b_events.recv().await.unwrap(),
            TestProtocolEvent::Receive {
                peer: a_id,
                data: b"1234".to_vec()
            }
        );

        a_task.abort();
        assert_eq!(b_events.recv().await.unwrap(), TestProtocolEvent::Disconnect(a_id));
        assert!(b.connected().is_empty());
    }

    #[tokio::test]
    async fn test_handshake_rejects_wrong_peer() {
        let (a_id, b_id, c_id) = (PeerId::random(), PeerId::random(), PeerId::random());
        let (mut a_chan, b_chan) = WireChannel::pair();
        b_chan.send(c_id.as_bytes().to_vec()).unwrap();

        let mut proto = TestProtocolPlugin::new(a_id).create(context(a_id, b_id, Uuid::new_v4()));
        let result = proto.handshake(&mut a_chan).await;
        assert!(matches!(result, Err(ConnectionError::Protocol(_))));
    }

    #[test]
    fn test_send_to_unknown_peer_fails() {
        let plugin = TestProtocolPlugin::new(PeerId::random());
        assert!(plugin.send(&PeerId::random(), vec![1]).is_err());
    }
}
