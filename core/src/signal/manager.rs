//! Websocket signal manager
//!
//! Fans every signaling operation out across one `SignalClient` per server
//! URL and reconciles the desired set of (topic, peer) memberships against
//! what each server has actually acknowledged.

use super::client::{CommandTrace, SignalClient, SignalClientState, SignalStatus};
use super::{Answer, SignalEvent, SignalManager, SignalMessage, SwarmEvent};
use crate::config::SignalClientConfig;
use crate::error::SignalError;
use crate::keys::{PeerId, Topic};
use async_trait::async_trait;
use futures::future::{join_all, select_ok};
use futures::FutureExt;
use parking_lot::{Mutex, RwLock};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

type Membership = (Topic, PeerId);

struct ClientSlot {
    client: SignalClient,
    /// Memberships this server has acknowledged
    actual: Mutex<HashSet<Membership>>,
}

struct ManagerInner {
    slots: Vec<ClientSlot>,
    desired: RwLock<HashSet<Membership>>,
    config: SignalClientConfig,
    events: mpsc::UnboundedSender<SignalEvent>,
    reconcile_lock: tokio::sync::Mutex<()>,
    retry_scheduled: AtomicBool,
}

/// Signal manager over one or more websocket signaling servers
pub struct WebsocketSignalManager {
    inner: Arc<ManagerInner>,
    events: Mutex<Option<mpsc::UnboundedReceiver<SignalEvent>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl WebsocketSignalManager {
    /// Connect to every server in `hosts`
    pub fn new(hosts: &[String], config: SignalClientConfig) -> Result<Self, SignalError> {
        if hosts.is_empty() {
            return Err(SignalError::NoServers);
        }

        let (raw_tx, raw_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let slots = hosts
            .iter()
            .map(|host| ClientSlot {
                client: SignalClient::new(host.clone(), config.clone(), raw_tx.clone()),
                actual: Mutex::new(HashSet::new()),
            })
            .collect();

        let inner = Arc::new(ManagerInner {
            slots,
            desired: RwLock::new(HashSet::new()),
            config,
            events: events_tx,
            reconcile_lock: tokio::sync::Mutex::new(()),
            retry_scheduled: AtomicBool::new(false),
        });

        let mut tasks = vec![tokio::spawn(forward_events(
            Arc::downgrade(&inner),
            raw_rx,
        ))];
        for index in 0..inner.slots.len() {
            tasks.push(tokio::spawn(watch_reconnects(Arc::downgrade(&inner), index)));
        }

        info!("Signal manager started with {} server(s)", hosts.len());
        Ok(Self {
            inner,
            events: Mutex::new(Some(events_rx)),
            tasks: Mutex::new(tasks),
        })
    }

    /// Link status of every server
    pub fn statuses(&self) -> Vec<SignalStatus> {
        self.inner.slots.iter().map(|s| s.client.status()).collect()
    }

    /// Combined command trace of every server
    pub fn command_trace(&self) -> Vec<CommandTrace> {
        let mut trace: Vec<CommandTrace> = self
            .inner
            .slots
            .iter()
            .flat_map(|s| s.client.command_trace())
            .collect();
        trace.sort_by_key(|entry| entry.time);
        trace
    }
}

#[async_trait]
impl SignalManager for WebsocketSignalManager {
    async fn join(&self, topic: Topic, peer_id: PeerId) -> Result<(), SignalError> {
        info!("Joining {} as {}", topic.truncate(), peer_id.truncate());
        self.inner.desired.write().insert((topic, peer_id));
        reconcile(&self.inner).await;
        Ok(())
    }

    async fn leave(&self, topic: Topic, peer_id: PeerId) -> Result<(), SignalError> {
        info!("Leaving {} as {}", topic.truncate(), peer_id.truncate());
        self.inner.desired.write().remove(&(topic, peer_id));
        reconcile(&self.inner).await;
        Ok(())
    }

    async fn lookup(&self, topic: Topic) -> Result<Vec<PeerId>, SignalError> {
        let results = join_all(self.inner.slots.iter().map(|s| s.client.lookup(topic))).await;
        let mut peers = HashSet::new();
        let mut last_error = None;
        let mut any_ok = false;
        for result in results {
            match result {
                Ok(found) => {
                    any_ok = true;
                    peers.extend(found);
                }
                Err(e) => last_error = Some(e),
            }
        }
        match (any_ok, last_error) {
            (false, Some(e)) => Err(e),
            _ => Ok(peers.into_iter().collect()),
        }
    }

    async fn offer(&self, message: SignalMessage) -> Result<Answer, SignalError> {
        let attempts = self
            .inner
            .slots
            .iter()
            .map(|s| s.client.offer(message.clone()).boxed());
        let (answer, _) = select_ok(attempts).await?;
        Ok(answer)
    }

    async fn signal(&self, message: SignalMessage) -> Result<(), SignalError> {
        let results = join_all(
            self.inner
                .slots
                .iter()
                .map(|s| s.client.signal(message.clone())),
        )
        .await;
        let mut last_error = None;
        for result in results {
            match result {
                Ok(()) => return Ok(()),
                Err(e) => last_error = Some(e),
            }
        }
        Err(last_error.unwrap_or(SignalError::NoServers))
    }

    fn take_events(&self) -> Option<mpsc::UnboundedReceiver<SignalEvent>> {
        self.events.lock().take()
    }

    async fn destroy(&self) {
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
        self.inner.desired.write().clear();
        for slot in &self.inner.slots {
            slot.client.close();
        }
        debug!("Signal manager destroyed");
    }
}

/// Drop swarm events about our own peers and forward the rest
async fn forward_events(
    inner: Weak<ManagerInner>,
    mut raw: mpsc::UnboundedReceiver<SignalEvent>,
) {
    while let Some(event) = raw.recv().await {
        let Some(inner) = inner.upgrade() else {
            break;
        };
        if let SignalEvent::Swarm { topic, event: swarm } = &event {
            if inner.desired.read().contains(&(*topic, swarm.peer())) {
                continue;
            }
        }
        let _ = inner.events.send(event);
    }
}

/// Re-run reconciliation every time a server link comes back
async fn watch_reconnects(inner: Weak<ManagerInner>, index: usize) {
    let mut states = match inner.upgrade() {
        Some(inner) => inner.slots[index].client.subscribe_state(),
        None => return,
    };
    loop {
        let state = *states.borrow_and_update();
        if let Some(inner) = inner.upgrade() {
            match state {
                SignalClientState::Connected => {
                    // A fresh socket starts with no memberships on the server side
                    inner.slots[index].actual.lock().clear();
                    reconcile(&inner).await;
                }
                SignalClientState::Closed => break,
                _ => {}
            }
        } else {
            break;
        }
        if states.changed().await.is_err() {
            break;
        }
    }
}

async fn reconcile(inner: &Arc<ManagerInner>) {
    let _guard = inner.reconcile_lock.lock().await;
    let desired = inner.desired.read().clone();
    let mut failed = false;

    for slot in &inner.slots {
        if slot.client.state() != SignalClientState::Connected {
            continue;
        }
        let actual = slot.actual.lock().clone();

        for &(topic, peer_id) in desired.difference(&actual) {
            match slot.client.join(topic, peer_id).await {
                Ok(peers) => {
                    slot.actual.lock().insert((topic, peer_id));
                    for peer in peers.into_iter().filter(|p| *p != peer_id) {
                        let _ = inner.events.send(SignalEvent::Swarm {
                            topic,
                            event: SwarmEvent::PeerAvailable { peer },
                        });
                    }
                }
                Err(e) => {
                    warn!("Join {} on {} failed: {}", topic.truncate(), slot.client.host(), e);
                    failed = true;
                }
            }
        }

        for &(topic, peer_id) in actual.difference(&desired) {
            match slot.client.leave(topic, peer_id).await {
                Ok(()) => {
                    slot.actual.lock().remove(&(topic, peer_id));
                }
                Err(e) => {
                    warn!("Leave {} on {} failed: {}", topic.truncate(), slot.client.host(), e);
                    failed = true;
                }
            }
        }
    }

    if failed {
        schedule_retry(inner);
    }
}

fn schedule_retry(inner: &Arc<ManagerInner>) {
    if inner.retry_scheduled.swap(true, Ordering::SeqCst) {
        return;
    }
    let weak = Arc::downgrade(inner);
    let delay = inner.config.reconcile_retry();
    tokio::spawn(async move {
        tokio::time::sleep(delay).await;
        if let Some(inner) = weak.upgrade() {
            inner.retry_scheduled.store(false, Ordering::SeqCst);
            debug!("Retrying signal reconciliation");
            reconcile(&inner).await;
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signal::SignalPayload;

    #[test]
    fn test_requires_at_least_one_server() {
        let result = WebsocketSignalManager::new(&[], SignalClientConfig::default());
        assert!(matches!(result, Err(SignalError::NoServers)));
    }

    #[tokio::test]
    async fn test_events_taken_once() {
        let manager = WebsocketSignalManager::new(
            &["ws://127.0.0.1:9".to_string()],
            SignalClientConfig::default(),
        )
        .unwrap();
        assert!(manager.take_events().is_some());
        assert!(manager.take_events().is_none());
        assert_eq!(manager.statuses().len(), 1);
        manager.destroy().await;
        assert_eq!(manager.statuses()[0].state, SignalClientState::Closed);
    }

    #[tokio::test]
    async fn test_offer_fails_without_connection() {
        let manager = WebsocketSignalManager::new(
            &["ws://127.0.0.1:9".to_string(), "ws://127.0.0.1:9".to_string()],
            SignalClientConfig::default(),
        )
        .unwrap();
        let message = SignalMessage::new(
            PeerId::random(),
            PeerId::random(),
            Topic::random(),
            uuid::Uuid::new_v4(),
            SignalPayload::Offer,
        );
        assert!(manager.offer(message.clone()).await.is_err());
        assert!(manager.signal(message).await.is_err());
        manager.destroy().await;
    }
}
