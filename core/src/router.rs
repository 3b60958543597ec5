//! Message Router - reliable signaling on top of a signal manager
//!
//! Signals get a message id and are resent until acknowledged or until the
//! retry timeout elapses. Receivers acknowledge every copy they see but hand
//! each message id to the application only once. Offers are correlated with
//! their answers by session id.

use crate::config::RouterConfig;
use crate::error::RouterError;
use crate::signal::{Answer, SignalManager, SignalMessage, SignalPayload};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{debug, warn};
use uuid::Uuid;

/// Reliable delivery and offer/answer correlation
pub struct MessageRouter {
    signal_manager: Arc<dyn SignalManager>,
    config: RouterConfig,
    /// message id -> resolver of the retry loop waiting for its ack
    pending_acks: Mutex<HashMap<Uuid, oneshot::Sender<()>>>,
    /// message id -> time first received
    received: Mutex<HashMap<Uuid, Instant>>,
    /// session id -> resolver of the offer waiting for its answer
    pending_offers: Mutex<HashMap<Uuid, oneshot::Sender<Answer>>>,
    destroyed: AtomicBool,
}

impl MessageRouter {
    pub fn new(signal_manager: Arc<dyn SignalManager>, config: RouterConfig) -> Self {
        Self {
            signal_manager,
            config,
            pending_acks: Mutex::new(HashMap::new()),
            received: Mutex::new(HashMap::new()),
            pending_offers: Mutex::new(HashMap::new()),
            destroyed: AtomicBool::new(false),
        }
    }

    pub fn signal_manager(&self) -> &Arc<dyn SignalManager> {
        &self.signal_manager
    }

    /// Send a signal, resending it until acknowledged.
    ///
    /// Resolves `Ok` once the recipient acknowledged it, or
    /// `RouterError::DeliveryTimeout` when the retry timeout elapsed first.
    pub async fn signal(&self, mut message: SignalMessage) -> Result<(), RouterError> {
        if self.destroyed.load(Ordering::SeqCst) {
            return Err(RouterError::Destroyed);
        }
        let message_id = Uuid::new_v4();
        message.message_id = Some(message_id);

        let (tx, mut acked) = oneshot::channel();
        self.pending_acks.lock().insert(message_id, tx);

        let deadline = Instant::now() + self.config.retry_timeout();
        let mut retry = tokio::time::interval(self.config.retry_interval());
        let mut attempts = 0u32;

        let outcome = loop {
            tokio::select! {
                result = &mut acked => {
                    break match result {
                        Ok(()) => Ok(()),
                        Err(_) => Err(RouterError::Destroyed),
                    };
                }
                _ = tokio::time::sleep_until(deadline) => {
                    break Err(RouterError::DeliveryTimeout(message_id));
                }
                _ = retry.tick() => {
                    attempts += 1;
                    if let Err(e) = self.signal_manager.signal(message.clone()).await {
                        debug!("Signal {} attempt {} failed: {}", message_id, attempts, e);
                    }
                }
            }
        };

        self.pending_acks.lock().remove(&message_id);
        match &outcome {
            Ok(()) => debug!("Signal {} acknowledged after {} attempt(s)", message_id, attempts),
            Err(e) => warn!(
                "Giving up on {} to {} after {} attempt(s): {}",
                message.data.kind(),
                message.recipient.truncate(),
                attempts,
                e
            ),
        }
        outcome
    }

    /// Send an offer and wait for the matching answer. Offers are not retried.
    pub async fn offer(&self, message: SignalMessage) -> Result<Answer, RouterError> {
        if self.destroyed.load(Ordering::SeqCst) {
            return Err(RouterError::Destroyed);
        }
        let session_id = message.session_id;
        let (tx, rx) = oneshot::channel();
        self.pending_offers.lock().insert(session_id, tx);

        let outcome = tokio::select! {
            answer = rx => answer.map_err(|_| RouterError::Destroyed),
            response = self.signal_manager.offer(message) => response.map_err(RouterError::from),
        };

        self.pending_offers.lock().remove(&session_id);
        outcome
    }

    /// Process an incoming message.
    ///
    /// Returns the message if the application should see it. Acks and
    /// answers are consumed here; duplicate signals are acknowledged again
    /// and dropped.
    pub fn handle_message(&self, message: SignalMessage) -> Option<SignalMessage> {
        match &message.data {
            SignalPayload::Ack { message_id } => {
                if let Some(tx) = self.pending_acks.lock().remove(message_id) {
                    let _ = tx.send(());
                }
                None
            }
            SignalPayload::Answer(answer) => {
                match self.pending_offers.lock().remove(&message.session_id) {
                    Some(tx) => {
                        let _ = tx.send(*answer);
                    }
                    None => debug!("Ignoring answer for unknown session {}", message.session_id),
                }
                None
            }
            SignalPayload::Signal(_) => {
                let Some(message_id) = message.message_id else {
                    return Some(message);
                };
                self.send_ack(&message, message_id);

                let now = Instant::now();
                let mut received = self.received.lock();
                let horizon = self.config.retry_timeout() * 2;
                received.retain(|_, seen| now.duration_since(*seen) < horizon);
                if received.insert(message_id, now).is_some() {
                    debug!("Dropping duplicate signal {}", message_id);
                    return None;
                }
                Some(message)
            }
            SignalPayload::Offer => Some(message),
        }
    }

    /// Reject pending offers and stop every retry loop
    pub fn destroy(&self) {
        self.destroyed.store(true, Ordering::SeqCst);
        self.pending_offers.lock().clear();
        self.pending_acks.lock().clear();
        self.received.lock().clear();
    }

    /// Signals still waiting for an ack
    pub fn pending_signals(&self) -> usize {
        self.pending_acks.lock().len()
    }

    fn send_ack(&self, message: &SignalMessage, message_id: Uuid) {
        let ack = message.ack(message_id);
        let signal_manager = Arc::clone(&self.signal_manager);
        tokio::spawn(async move {
            if let Err(e) = signal_manager.signal(ack).await {
                debug!("Failed to send ack for {}: {}", message_id, e);
            }
        });
    }
}

impl std::fmt::Debug for MessageRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageRouter")
            .field("pending_acks", &self.pending_acks.lock().len())
            .field("pending_offers", &self.pending_offers.lock().len())
            .finish()
    }
}
