//! Signal Client - one reconnecting websocket link to a signaling server
//!
//! Requests are JSON frames correlated by id. Pushes from the server are
//! forwarded to the owning manager as `SignalEvent`s.

use super::message::{Answer, Frame, ResponseBody, ServerPush, SignalMessage, SignalRequest};
use super::SignalEvent;
use crate::config::SignalClientConfig;
use crate::error::SignalError;
use crate::keys::{PeerId, Topic};
use futures::{SinkExt, StreamExt};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

/// Number of commands kept in the rolling trace
pub const MAX_COMMAND_TRACE: usize = 100;

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;
type PendingMap = HashMap<u64, oneshot::Sender<Result<ResponseBody, SignalError>>>;

/// Connection state of a signal client
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SignalClientState {
    /// First connection attempt in progress
    Connecting,
    Connected,
    /// Link lost; a reconnect is scheduled
    Disconnected,
    /// Reconnect attempt in progress
    ReConnecting,
    /// Explicitly closed; terminal
    Closed,
}

impl fmt::Display for SignalClientState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SignalClientState::Connecting => write!(f, "CONNECTING"),
            SignalClientState::Connected => write!(f, "CONNECTED"),
            SignalClientState::Disconnected => write!(f, "DISCONNECTED"),
            SignalClientState::ReConnecting => write!(f, "RE_CONNECTING"),
            SignalClientState::Closed => write!(f, "CLOSED"),
        }
    }
}

/// Reconnect delay that doubles on each consecutive failure
#[derive(Debug, Clone)]
pub struct ReconnectBackoff {
    base: Duration,
    max: Duration,
    failures: u32,
}

impl ReconnectBackoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max,
            failures: 0,
        }
    }

    /// Delay before the next attempt; counts one more failure
    pub fn next_delay(&mut self) -> Duration {
        let factor = 1u64 << self.failures.min(31);
        let delay_ms = (self.base.as_millis() as u64).saturating_mul(factor);
        self.failures = self.failures.saturating_add(1);
        Duration::from_millis(delay_ms).min(self.max)
    }

    /// Called after a successful connection
    pub fn reset(&mut self) {
        self.failures = 0;
    }

    pub fn failures(&self) -> u32 {
        self.failures
    }
}

/// One entry of the rolling command trace
#[derive(Debug, Clone, Serialize)]
pub struct CommandTrace {
    pub message_id: u64,
    pub host: String,
    pub incoming: bool,
    pub time: SystemTime,
    pub method: String,
    pub payload: serde_json::Value,
    pub response: Option<serde_json::Value>,
    pub error: Option<String>,
}

/// Snapshot of a client's link health
#[derive(Debug, Clone)]
pub struct SignalStatus {
    pub host: String,
    pub state: SignalClientState,
    pub error: Option<String>,
    pub reconnect_in: Option<Duration>,
    pub connection_started: Option<SystemTime>,
    pub last_state_change: SystemTime,
}

#[derive(Debug)]
struct StatusInner {
    error: Option<String>,
    reconnect_in: Option<Duration>,
    connection_started: Option<SystemTime>,
    last_state_change: SystemTime,
}

struct ClientInner {
    host: String,
    config: SignalClientConfig,
    state: watch::Sender<SignalClientState>,
    status: RwLock<StatusInner>,
    outgoing: Mutex<Option<mpsc::UnboundedSender<Message>>>,
    pending: Mutex<PendingMap>,
    next_id: AtomicU64,
    trace: Mutex<VecDeque<CommandTrace>>,
    events: mpsc::UnboundedSender<SignalEvent>,
    closed: AtomicBool,
}

/// Reconnecting RPC + push link to one signaling server
pub struct SignalClient {
    inner: Arc<ClientInner>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl SignalClient {
    /// Create a client and start connecting to `host` (a `ws://` or `wss://` URL)
    pub fn new(
        host: impl Into<String>,
        config: SignalClientConfig,
        events: mpsc::UnboundedSender<SignalEvent>,
    ) -> Self {
        let (state, _) = watch::channel(SignalClientState::Connecting);
        let inner = Arc::new(ClientInner {
            host: host.into(),
            config,
            state,
            status: RwLock::new(StatusInner {
                error: None,
                reconnect_in: None,
                connection_started: None,
                last_state_change: SystemTime::now(),
            }),
            outgoing: Mutex::new(None),
            pending: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            trace: Mutex::new(VecDeque::with_capacity(MAX_COMMAND_TRACE)),
            events,
            closed: AtomicBool::new(false),
        });
        let task = tokio::spawn(run(Arc::clone(&inner)));
        Self {
            inner,
            task: Mutex::new(Some(task)),
        }
    }

    pub fn host(&self) -> &str {
        &self.inner.host
    }

    pub fn state(&self) -> SignalClientState {
        *self.inner.state.borrow()
    }

    /// Observe state transitions
    pub fn subscribe_state(&self) -> watch::Receiver<SignalClientState> {
        self.inner.state.subscribe()
    }

    pub fn status(&self) -> SignalStatus {
        let status = self.inner.status.read();
        SignalStatus {
            host: self.inner.host.clone(),
            state: self.state(),
            error: status.error.clone(),
            reconnect_in: status.reconnect_in,
            connection_started: status.connection_started,
            last_state_change: status.last_state_change,
        }
    }

    /// Most recent commands, oldest first
    pub fn command_trace(&self) -> Vec<CommandTrace> {
        self.inner.trace.lock().iter().cloned().collect()
    }

    /// Announce a peer in a topic; returns the peers already present
    pub async fn join(&self, topic: Topic, peer_id: PeerId) -> Result<Vec<PeerId>, SignalError> {
        let response = self
            .inner
            .request(
                SignalRequest::Join { topic, peer_id },
                Some(self.inner.config.rpc_timeout()),
            )
            .await?;
        match response {
            ResponseBody::Peers(peers) => Ok(peers),
            other => Err(unexpected("join", &other)),
        }
    }

    pub async fn leave(&self, topic: Topic, peer_id: PeerId) -> Result<(), SignalError> {
        self.inner
            .request(
                SignalRequest::Leave { topic, peer_id },
                Some(self.inner.config.rpc_timeout()),
            )
            .await
            .map(|_| ())
    }

    pub async fn lookup(&self, topic: Topic) -> Result<Vec<PeerId>, SignalError> {
        let response = self
            .inner
            .request(
                SignalRequest::Lookup { topic },
                Some(self.inner.config.rpc_timeout()),
            )
            .await?;
        match response {
            ResponseBody::Peers(peers) => Ok(peers),
            other => Err(unexpected("lookup", &other)),
        }
    }

    /// Relay an offer; waits for the answer without a fixed timeout
    pub async fn offer(&self, message: SignalMessage) -> Result<Answer, SignalError> {
        let response = self
            .inner
            .request(SignalRequest::Offer(message), None)
            .await?;
        match response {
            ResponseBody::Answer(answer) => Ok(answer),
            other => Err(unexpected("offer", &other)),
        }
    }

    /// Fire-and-forget message relay
    pub async fn signal(&self, message: SignalMessage) -> Result<(), SignalError> {
        self.inner.send_only(SignalRequest::Signal(message))
    }

    /// Close the link for good; pending requests fail with `Closed`
    pub fn close(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(task) = self.task.lock().take() {
            task.abort();
        }
        self.inner.outgoing.lock().take();
        self.inner.fail_pending(SignalError::Closed);
        self.inner.set_state(SignalClientState::Closed);
        debug!("Signal client for {} closed", self.inner.host);
    }
}

impl Drop for SignalClient {
    fn drop(&mut self) {
        self.close();
    }
}

fn unexpected(method: &str, body: &ResponseBody) -> SignalError {
    SignalError::UnexpectedResponse(format!("{} -> {:?}", method, body))
}

async fn run(inner: Arc<ClientInner>) {
    let mut backoff = ReconnectBackoff::new(
        inner.config.reconnect_base(),
        inner.config.reconnect_max(),
    );
    let mut first_attempt = true;

    loop {
        if inner.closed.load(Ordering::SeqCst) {
            break;
        }
        inner.set_state(if first_attempt {
            SignalClientState::Connecting
        } else {
            SignalClientState::ReConnecting
        });
        first_attempt = false;

        match connect_async(inner.host.as_str()).await {
            Ok((socket, _)) => {
                backoff.reset();
                {
                    let mut status = inner.status.write();
                    status.error = None;
                    status.reconnect_in = None;
                    status.connection_started = Some(SystemTime::now());
                }
                info!("Signal client connected to {}", inner.host);
                let reason = Arc::clone(&inner).serve(socket).await;
                inner.fail_pending(SignalError::NotConnected(inner.host.clone()));
                if inner.closed.load(Ordering::SeqCst) {
                    break;
                }
                warn!("Signal link to {} lost: {}", inner.host, reason);
                inner.status.write().error = Some(reason);
            }
            Err(e) => {
                debug!("Signal connect to {} failed: {}", inner.host, e);
                inner.status.write().error = Some(e.to_string());
            }
        }

        if inner.closed.load(Ordering::SeqCst) {
            break;
        }
        inner.set_state(SignalClientState::Disconnected);
        let delay = backoff.next_delay();
        inner.status.write().reconnect_in = Some(delay);
        debug!("Reconnecting to {} in {:?}", inner.host, delay);
        tokio::time::sleep(delay).await;
    }
}

impl ClientInner {
    fn set_state(&self, state: SignalClientState) {
        let previous = *self.state.borrow();
        if previous == SignalClientState::Closed || previous == state {
            return;
        }
        self.state.send_replace(state);
        self.status.write().last_state_change = SystemTime::now();
        debug!("Signal client {}: {} -> {}", self.host, previous, state);
    }

    /// Pump one websocket until it closes; returns the reason
    async fn serve(self: Arc<Self>, socket: Socket) -> String {
        let (mut sink, mut stream) = socket.split();
        let (tx, mut rx) = mpsc::unbounded_channel::<Message>();
        *self.outgoing.lock() = Some(tx);
        self.set_state(SignalClientState::Connected);

        let writer = tokio::spawn(async move {
            while let Some(message) = rx.recv().await {
                if sink.send(message).await.is_err() {
                    break;
                }
            }
            let _ = sink.close().await;
        });

        let reason = loop {
            match stream.next().await {
                Some(Ok(Message::Text(text))) => self.handle_text(&text),
                Some(Ok(Message::Close(_))) | None => break "closed by server".to_string(),
                Some(Ok(_)) => {}
                Some(Err(e)) => break e.to_string(),
            }
        };

        self.outgoing.lock().take();
        writer.abort();
        reason
    }

    fn handle_text(self: &Arc<Self>, text: &str) {
        let frame = match Frame::decode(text) {
            Ok(frame) => frame,
            Err(e) => {
                warn!("Bad frame from {}: {}", self.host, e);
                return;
            }
        };

        match frame {
            Frame::Response { id, result } => {
                self.trace_response(id, &result);
                if let Some(tx) = self.pending.lock().remove(&id) {
                    let _ = tx.send(result.map_err(SignalError::Server));
                }
            }
            Frame::Push { event } => {
                self.record(CommandTrace {
                    message_id: 0,
                    host: self.host.clone(),
                    incoming: true,
                    time: SystemTime::now(),
                    method: event.method().to_string(),
                    payload: serde_json::to_value(&event).unwrap_or_default(),
                    response: None,
                    error: None,
                });
                self.dispatch_push(event);
            }
            Frame::Request { id, .. } => {
                warn!("Unexpected request {} from server {}", id, self.host);
            }
        }
    }

    fn dispatch_push(self: &Arc<Self>, event: ServerPush) {
        match event {
            ServerPush::Swarm { topic, event } => {
                let _ = self.events.send(SignalEvent::Swarm { topic, event });
            }
            ServerPush::Message(message) => {
                let _ = self.events.send(SignalEvent::Message(message));
            }
            ServerPush::Offer {
                request_id,
                message,
            } => {
                let (responder, answer) = oneshot::channel();
                let _ = self.events.send(SignalEvent::Offer { message, responder });
                let inner = Arc::clone(self);
                tokio::spawn(async move {
                    // Dropped responders reject the offer
                    let answer = answer.await.unwrap_or(Answer::REJECT);
                    let timeout = Some(inner.config.rpc_timeout());
                    if let Err(e) = inner
                        .request(SignalRequest::Answer { request_id, answer }, timeout)
                        .await
                    {
                        warn!("Failed to answer offer {}: {}", request_id, e);
                    }
                });
            }
        }
    }

    fn encode_request(&self, request: SignalRequest) -> Result<(u64, String), SignalError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.record(CommandTrace {
            message_id: id,
            host: self.host.clone(),
            incoming: false,
            time: SystemTime::now(),
            method: request.method().to_string(),
            payload: serde_json::to_value(&request).unwrap_or_default(),
            response: None,
            error: None,
        });
        let text = Frame::Request { id, request }.encode()?;
        Ok((id, text))
    }

    fn sender(&self) -> Result<mpsc::UnboundedSender<Message>, SignalError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(SignalError::Closed);
        }
        self.outgoing
            .lock()
            .clone()
            .ok_or_else(|| SignalError::NotConnected(self.host.clone()))
    }

    fn send_only(&self, request: SignalRequest) -> Result<(), SignalError> {
        let sender = self.sender()?;
        let (id, text) = self.encode_request(request)?;
        sender.send(Message::Text(text)).map_err(|_| {
            let err = SignalError::NotConnected(self.host.clone());
            self.trace_error(id, &err);
            err
        })
    }

    async fn request(
        &self,
        request: SignalRequest,
        timeout: Option<Duration>,
    ) -> Result<ResponseBody, SignalError> {
        let method = request.method();
        let sender = self.sender()?;
        let (id, text) = self.encode_request(request)?;

        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(id, tx);
        if sender.send(Message::Text(text)).is_err() {
            self.pending.lock().remove(&id);
            let err = SignalError::NotConnected(self.host.clone());
            self.trace_error(id, &err);
            return Err(err);
        }

        let received = match timeout {
            Some(limit) => match tokio::time::timeout(limit, rx).await {
                Ok(received) => received,
                Err(_) => {
                    self.pending.lock().remove(&id);
                    let err = SignalError::Timeout(format!("{} to {}", method, self.host));
                    self.trace_error(id, &err);
                    return Err(err);
                }
            },
            None => rx.await,
        };

        let result =
            received.unwrap_or_else(|_| Err(SignalError::NotConnected(self.host.clone())));
        if let Err(e) = &result {
            self.trace_error(id, e);
        }
        result
    }

    fn fail_pending(&self, error: SignalError) {
        let pending: Vec<_> = self.pending.lock().drain().collect();
        for (_, tx) in pending {
            let _ = tx.send(Err(error.clone()));
        }
    }

    fn record(&self, entry: CommandTrace) {
        let mut trace = self.trace.lock();
        if trace.len() >= MAX_COMMAND_TRACE {
            trace.pop_front();
        }
        trace.push_back(entry);
    }

    fn with_outgoing_entry(&self, id: u64, update: impl FnOnce(&mut CommandTrace)) {
        let mut trace = self.trace.lock();
        if let Some(entry) = trace
            .iter_mut()
            .rev()
            .find(|entry| !entry.incoming && entry.message_id == id)
        {
            update(entry);
        }
    }

    fn trace_response(&self, id: u64, result: &Result<ResponseBody, String>) {
        self.with_outgoing_entry(id, |entry| match result {
            Ok(body) => entry.response = serde_json::to_value(body).ok(),
            Err(e) => entry.error = Some(e.clone()),
        });
    }

    fn trace_error(&self, id: u64, error: &SignalError) {
        self.with_outgoing_entry(id, |entry| entry.error = Some(error.to_string()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    async fn unused_url() -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        format!("ws://{}", addr)
    }

    fn fast_config() -> SignalClientConfig {
        SignalClientConfig {
            rpc_timeout_ms: 200,
            reconnect_base_ms: 10,
            reconnect_max_ms: 40,
            reconcile_retry_ms: 100,
        }
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let mut backoff =
            ReconnectBackoff::new(Duration::from_millis(100), Duration::from_secs(5));
        assert_eq!(backoff.next_delay(), Duration::from_millis(100));
        assert_eq!(backoff.next_delay(), Duration::from_millis(200));
        assert_eq!(backoff.next_delay(), Duration::from_millis(400));
        assert_eq!(backoff.failures(), 3);

        for _ in 0..10 {
            backoff.next_delay();
        }
        assert_eq!(backoff.next_delay(), Duration::from_secs(5));
    }

    #[test]
    fn test_backoff_reset() {
        let mut backoff =
            ReconnectBackoff::new(Duration::from_millis(100), Duration::from_secs(5));
        backoff.next_delay();
        backoff.next_delay();
        backoff.reset();
        assert_eq!(backoff.failures(), 0);
        assert_eq!(backoff.next_delay(), Duration::from_millis(100));
    }

    #[test]
    fn test_backoff_survives_many_failures() {
        let mut backoff = ReconnectBackoff::new(Duration::from_millis(100), Duration::from_secs(5));
        for _ in 0..200 {
            assert!(backoff.next_delay() <= Duration::from_secs(5));
        }
    }

    #[test]
    fn test_state_display() {
        assert_eq!(SignalClientState::ReConnecting.to_string(), "RE_CONNECTING");
        assert_eq!(SignalClientState::Closed.to_string(), "CLOSED");
    }

    #[tokio::test]
    async fn test_requests_fail_when_not_connected() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let client = SignalClient::new(unused_url().await, fast_config(), tx);

        let result = client.lookup(Topic::random()).await;
        assert!(matches!(result, Err(SignalError::NotConnected(_))));

        client.close();
        let result = client.lookup(Topic::random()).await;
        assert!(matches!(result, Err(SignalError::Closed)));
        assert_eq!(client.state(), SignalClientState::Closed);
    }

    #[tokio::test]
    async fn test_reconnects_after_failure() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let client = SignalClient::new(unused_url().await, fast_config(), tx);
        let mut states = client.subscribe_state();

        let reconnecting = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if *states.borrow_and_update() == SignalClientState::ReConnecting {
                    break;
                }
                states.changed().await.unwrap();
            }
        })
        .await;
        assert!(reconnecting.is_ok());

        let status = client.status();
        assert!(status.error.is_some());
        assert!(status.connection_started.is_none());
        client.close();
    }

    #[tokio::test]
    async fn test_command_trace_is_bounded() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let client = SignalClient::new(unused_url().await, fast_config(), tx);
        client.close();

        for _ in 0..(MAX_COMMAND_TRACE + 25) {
            let _ = client.inner.encode_request(SignalRequest::Lookup {
                topic: Topic::random(),
            });
        }
        let trace = client.command_trace();
        assert_eq!(trace.len(), MAX_COMMAND_TRACE);
        assert_eq!(trace[0].message_id, 26);
        assert!(trace.iter().all(|entry| entry.method == "lookup" && !entry.incoming));
    }
}
