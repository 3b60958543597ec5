// Network event log - devtools feed of swarm and connection activity
//
// Every event goes out on a broadcast channel. When logging is enabled the
// log also keeps a bounded history so a late subscriber can render the past.

use crate::connection::ConnectionState;
use crate::keys::{PeerId, Topic};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::VecDeque;
use std::time::SystemTime;
use tokio::sync::broadcast;
use uuid::Uuid;

/// Maximum number of events retained in the history
pub const MAX_EVENT_HISTORY: usize = 1000;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum NetworkEvent {
    SwarmJoined {
        topic: Topic,
        peer_id: PeerId,
    },
    SwarmLeft {
        topic: Topic,
        peer_id: PeerId,
    },
    ConnectionStateChanged {
        topic: Topic,
        peer_id: PeerId,
        remote_id: PeerId,
        session_id: Uuid,
        state: ConnectionState,
    },
    ProtocolHandshake {
        topic: Topic,
        peer_id: PeerId,
        remote_id: PeerId,
        session_id: Uuid,
    },
    ProtocolError {
        topic: Topic,
        peer_id: PeerId,
        remote_id: PeerId,
        session_id: Uuid,
        error: String,
    },
}

impl NetworkEvent {
    pub fn topic(&self) -> Topic {
        match self {
            NetworkEvent::SwarmJoined { topic, .. }
            | NetworkEvent::SwarmLeft { topic, .. }
            | NetworkEvent::ConnectionStateChanged { topic, .. }
            | NetworkEvent::ProtocolHandshake { topic, .. }
            | NetworkEvent::ProtocolError { topic, .. } => *topic,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct NetworkEventRecord {
    pub time: SystemTime,
    #[serde(flatten)]
    pub event: NetworkEvent,
}

pub struct NetworkEventLog {
    tx: broadcast::Sender<NetworkEvent>,
    history: Option<Mutex<VecDeque<NetworkEventRecord>>>,
}

impl NetworkEventLog {
    pub fn new(keep_history: bool) -> Self {
        let (tx, _) = broadcast::channel(1024);
        Self {
            tx,
            history: keep_history.then(|| Mutex::new(VecDeque::new())),
        }
    }

    pub fn emit(&self, event: NetworkEvent) {
        if let Some(history) = &self.history {
            let mut history = history.lock();
            if history.len() >= MAX_EVENT_HISTORY {
                history.pop_front();
            }
            history.push_back(NetworkEventRecord {
                time: SystemTime::now(),
                event: event.clone(),
            });
        }
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<NetworkEvent> {
        self.tx.subscribe()
    }

    /// Retained events, oldest first. Empty unless history is enabled.
    pub fn history(&self) -> Vec<NetworkEventRecord> {
        self.history
            .as_ref()
            .map(|h| h.lock().iter().cloned().collect())
            .unwrap_or_default()
    }
}

impl Default for NetworkEventLog {
    fn default() -> Self {
        Self::new(false)
    }
}

/// Install the default fmt subscriber (idempotent)
pub fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .try_init();
}
