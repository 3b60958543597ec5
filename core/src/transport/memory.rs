//! In-memory transport
//!
//! Both sides of a connection register in a shared `MemoryTransportRegistry`.
//! Whichever side arrives second splices the two application streams together
//! through a delay stage and reports `Connected` to both.

use super::abstraction::{
    Transport, TransportEvent, TransportFactory, TransportKind, TransportOptions, WireChannel,
};
use crate::error::TransportError;
use crate::keys::{PeerId, Topic};
use crate::signal::TransportSignal;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;
use uuid::Uuid;

type EndpointKey = (Topic, PeerId, PeerId);

struct Endpoint {
    session_id: Uuid,
    events: mpsc::UnboundedSender<TransportEvent>,
    /// Delay pumps shared with the mirror endpoint once spliced
    pumps: Arc<Mutex<Vec<JoinHandle<()>>>>,
}

/// Shared table of in-memory transports, keyed by (topic, own, remote)
#[derive(Clone, Default)]
pub struct MemoryTransportRegistry {
    endpoints: Arc<Mutex<HashMap<EndpointKey, Endpoint>>>,
}

impl MemoryTransportRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of registered endpoints
    pub fn len(&self) -> usize {
        self.endpoints.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Creates `InMemoryTransport`s sharing one registry
#[derive(Clone)]
pub struct MemoryTransportFactory {
    registry: MemoryTransportRegistry,
    delay: Duration,
}

impl MemoryTransportFactory {
    pub fn new(registry: MemoryTransportRegistry, delay: Duration) -> Self {
        Self { registry, delay }
    }
}

impl TransportFactory for MemoryTransportFactory {
    fn create(&self, options: TransportOptions) -> Result<Arc<dyn Transport>, TransportError> {
        Ok(Arc::new(InMemoryTransport::new(
            self.registry.clone(),
            options,
            self.delay,
        )))
    }
}

/// Same-process transport for tests
pub struct InMemoryTransport {
    registry: MemoryTransportRegistry,
    options: TransportOptions,
    delay: Duration,
}

impl InMemoryTransport {
    pub fn new(registry: MemoryTransportRegistry, options: TransportOptions, delay: Duration) -> Self {
        Self {
            registry,
            options,
            delay,
        }
    }

    fn own_key(&self) -> EndpointKey {
        (self.options.topic, self.options.own_id, self.options.remote_id)
    }

    fn mirror_key(&self) -> EndpointKey {
        (self.options.topic, self.options.remote_id, self.options.own_id)
    }
}

/// Forward frames with an artificial delay so tests exercise real asynchrony
fn spawn_pump(
    mut rx: mpsc::UnboundedReceiver<Vec<u8>>,
    tx: mpsc::UnboundedSender<Vec<u8>>,
    delay: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(data) = rx.recv().await {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            if tx.send(data).is_err() {
                break;
            }
        }
    })
}

#[async_trait]
impl Transport for InMemoryTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::InMemory
    }

    async fn connect(&self) -> Result<(), TransportError> {
        let mut endpoints = self.registry.endpoints.lock();
        let pumps = Arc::new(Mutex::new(Vec::new()));
        if let Some(stale) = endpoints.insert(
            self.own_key(),
            Endpoint {
                session_id: self.options.session_id,
                events: self.options.events.clone(),
                pumps: Arc::clone(&pumps),
            },
        ) {
            for pump in stale.pumps.lock().drain(..) {
                pump.abort();
            }
        }

        let Some(mirror) = endpoints.get_mut(&self.mirror_key()) else {
            debug!(
                "Memory transport {} waiting for {}",
                self.options.own_id.truncate(),
                self.options.remote_id.truncate()
            );
            return Ok(());
        };
        if mirror.session_id != self.options.session_id {
            debug!("Memory transport found stale mirror session, waiting");
            return Ok(());
        }

        let (own_out_tx, own_out_rx) = mpsc::unbounded_channel();
        let (own_in_tx, own_in_rx) = mpsc::unbounded_channel();
        let (remote_out_tx, remote_out_rx) = mpsc::unbounded_channel();
        let (remote_in_tx, remote_in_rx) = mpsc::unbounded_channel();

        {
            let mut handles = pumps.lock();
            handles.push(spawn_pump(own_out_rx, remote_in_tx, self.delay));
            handles.push(spawn_pump(remote_out_rx, own_in_tx, self.delay));
        }
        mirror.pumps = Arc::clone(&pumps);

        let _ = mirror.events.send(TransportEvent::Connected(WireChannel::from_parts(
            remote_out_tx,
            remote_in_rx,
        )));
        let _ = self
            .options
            .events
            .send(TransportEvent::Connected(WireChannel::from_parts(
                own_out_tx, own_in_rx,
            )));
        debug!(
            "Memory transport spliced {} <-> {}",
            self.options.own_id.truncate(),
            self.options.remote_id.truncate()
        );
        Ok(())
    }

    async fn signal(&self, _signal: TransportSignal) -> Result<(), TransportError> {
        // No negotiation happens in memory
        Ok(())
    }

    async fn close(&self) -> Result<(), TransportError> {
        let removed = {
            let mut endpoints = self.registry.endpoints.lock();
            let own = match endpoints.get(&self.own_key()) {
                Some(endpoint) if endpoint.session_id == self.options.session_id => {
                    endpoints.remove(&self.own_key())
                }
                _ => None,
            };
            if let Some(own) = &own {
                for pump in own.pumps.lock().drain(..) {
                    pump.abort();
                }
                if let Some(mirror) = endpoints.get(&self.mirror_key()) {
                    if mirror.session_id == self.options.session_id {
                        let _ = mirror.events.send(TransportEvent::Closed);
                    }
                }
            }
            own.is_some()
        };

        if removed {
            let _ = self.options.events.send(TransportEvent::Closed);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn options(
        topic: Topic,
        own: PeerId,
        remote: PeerId,
        session_id: Uuid,
        initiator: bool,
    ) -> (TransportOptions, mpsc::UnboundedReceiver<TransportEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        (
            TransportOptions {
                topic,
                own_id: own,
                remote_id: remote,
                session_id,
                initiator,
                send_signal: Arc::new(|_| {}),
                events,
            },
            rx,
        )
    }

    async fn expect_connected(rx: &mut mpsc::UnboundedReceiver<TransportEvent>) -> WireChannel {
        match rx.recv().await {
            Some(TransportEvent::Connected(channel)) => channel,
            other => panic!("Expected Connected, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_splice_and_exchange() {
        let registry = MemoryTransportRegistry::new();
        let factory = MemoryTransportFactory::new(registry.clone(), Duration::from_millis(10));
        let topic = Topic::random();
        let (a, b) = (PeerId::random(), PeerId::random());
        let session = Uuid::new_v4();

        let (a_opts, mut a_events) = options(topic, a, b, session, true);
        let (b_opts, mut b_events) = options(topic, b, a, session, false);
        let a_transport = factory.create(a_opts).unwrap();
        let b_transport = factory.create(b_opts).unwrap();
        assert_eq!(a_transport.kind(), TransportKind::InMemory);

        a_transport.connect().await.unwrap();
        assert!(a_events.try_recv().is_err());
        b_transport.connect().await.unwrap();

        let mut a_channel = expect_connected(&mut a_events).await;
        let mut b_channel = expect_connected(&mut b_events).await;

        a_channel.send(b"1234".to_vec()).unwrap();
        assert_eq!(b_channel.recv().await.unwrap(), b"1234".to_vec());
        b_channel.send(b"5678".to_vec()).unwrap();
        assert_eq!(a_channel.recv().await.unwrap(), b"5678".to_vec());
        assert_eq!(registry.len(), 2);

        a_transport.close().await.unwrap();
        assert!(matches!(a_events.recv().await, Some(TransportEvent::Closed)));
        assert!(matches!(b_events.recv().await, Some(TransportEvent::Closed)));
        assert!(b_channel.recv().await.is_none());

        b_transport.close().await.unwrap();
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_mismatched_sessions_do_not_splice() {
        let registry = MemoryTransportRegistry::new();
        let factory = MemoryTransportFactory::new(registry.clone(), Duration::ZERO);
        let topic = Topic::random();
        let (a, b) = (PeerId::random(), PeerId::random());

        let (a_opts, mut a_events) = options(topic, a, b, Uuid::new_v4(), true);
        let (b_opts, mut b_events) = options(topic, b, a, Uuid::new_v4(), false);
        factory.create(a_opts).unwrap().connect().await.unwrap();
        factory.create(b_opts).unwrap().connect().await.unwrap();

        assert!(a_events.try_recv().is_err());
        assert!(b_events.try_recv().is_err());
    }
}
