//! WebRTC transport
//!
//! One `RTCPeerConnection` per connection attempt with a single data channel.
//! The initiator creates the channel and the offer; the responder answers
//! once the remote description arrives. ICE candidates are trickled through
//! the signaling layer and queued until a remote description is set.

use super::abstraction::{
    SignalSender, Transport, TransportEvent, TransportFactory, TransportKind, TransportOptions,
    WireChannel,
};
use crate::config::IceServerConfig;
use crate::error::TransportError;
use crate::signal::TransportSignal;
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, warn};
use webrtc::api::APIBuilder;
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;

/// Label of the application data channel
pub const DATA_CHANNEL_LABEL: &str = "swarm";

fn engine_error(e: webrtc::Error) -> TransportError {
    TransportError::NegotiationFailed(e.to_string())
}

impl From<&IceServerConfig> for RTCIceServer {
    fn from(config: &IceServerConfig) -> Self {
        RTCIceServer {
            urls: config.urls.clone(),
            username: config.username.clone().unwrap_or_default(),
            credential: config.credential.clone().unwrap_or_default(),
            ..Default::default()
        }
    }
}

/// Parse a signaled description into an engine description
pub fn parse_description(sdp_type: &str, sdp: String) -> Result<RTCSessionDescription, TransportError> {
    let description = match sdp_type {
        "offer" => RTCSessionDescription::offer(sdp),
        "answer" => RTCSessionDescription::answer(sdp),
        other => {
            return Err(TransportError::InvalidSignal(format!(
                "Unsupported description type: {}",
                other
            )))
        }
    };
    description.map_err(|e| TransportError::InvalidSignal(e.to_string()))
}

/// Creates a `WebRtcTransport` per connection attempt
#[derive(Debug, Clone, Default)]
pub struct WebRtcTransportFactory {
    ice: Vec<IceServerConfig>,
}

impl WebRtcTransportFactory {
    pub fn new(ice: Vec<IceServerConfig>) -> Self {
        Self { ice }
    }
}

impl TransportFactory for WebRtcTransportFactory {
    fn create(&self, options: TransportOptions) -> Result<Arc<dyn Transport>, TransportError> {
        Ok(Arc::new(WebRtcTransport::new(options, self.ice.clone())))
    }
}

/// Event sink that reports `Closed` at most once
struct EventSink {
    tx: mpsc::UnboundedSender<TransportEvent>,
    closed: AtomicBool,
}

impl EventSink {
    fn emit(&self, event: TransportEvent) {
        if self.closed.load(Ordering::SeqCst) {
            return;
        }
        let _ = self.tx.send(event);
    }

    fn emit_closed(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            let _ = self.tx.send(TransportEvent::Closed);
        }
    }
}

#[derive(Default)]
struct RtcState {
    peer: Option<Arc<RTCPeerConnection>>,
    /// Signals received before `connect()`
    pending_signals: Vec<TransportSignal>,
    /// Candidates received before the remote description
    pending_candidates: Vec<RTCIceCandidateInit>,
    closed: bool,
}

/// Transport over a WebRTC data channel
pub struct WebRtcTransport {
    options: TransportOptions,
    ice: Vec<IceServerConfig>,
    sink: Arc<EventSink>,
    state: tokio::sync::Mutex<RtcState>,
}

impl WebRtcTransport {
    pub fn new(options: TransportOptions, ice: Vec<IceServerConfig>) -> Self {
        let sink = Arc::new(EventSink {
            tx: options.events.clone(),
            closed: AtomicBool::new(false),
        });
        Self {
            options,
            ice,
            sink,
            state: tokio::sync::Mutex::new(RtcState::default()),
        }
    }

    /// Number of signals waiting for `connect()`
    pub async fn pending_signals(&self) -> usize {
        self.state.lock().await.pending_signals.len()
    }

    async fn create_peer(&self) -> Result<Arc<RTCPeerConnection>, TransportError> {
        let api = APIBuilder::new().build();
        let config = RTCConfiguration {
            ice_servers: self.ice.iter().map(RTCIceServer::from).collect(),
            ..Default::default()
        };
        let peer = Arc::new(api.new_peer_connection(config).await.map_err(engine_error)?);

        let send_signal = Arc::clone(&self.options.send_signal);
        peer.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            let send_signal = Arc::clone(&send_signal);
            Box::pin(async move {
                let Some(candidate) = candidate else {
                    return;
                };
                match candidate.to_json() {
                    Ok(init) => send_signal(TransportSignal::Candidate {
                        candidate: init.candidate,
                        sdp_mid: init.sdp_mid,
                        sdp_mline_index: init.sdp_mline_index,
                    }),
                    Err(e) => warn!("Failed to encode ICE candidate: {}", e),
                }
            })
        }));

        let sink = Arc::clone(&self.sink);
        peer.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
            let sink = Arc::clone(&sink);
            Box::pin(async move {
                debug!("Peer connection state: {}", state);
                match state {
                    RTCPeerConnectionState::Failed => {
                        sink.emit(TransportEvent::Error(TransportError::ConnectionFailed(
                            "ICE negotiation failed".to_string(),
                        )));
                        sink.emit_closed();
                    }
                    RTCPeerConnectionState::Closed => sink.emit_closed(),
                    _ => {}
                }
            })
        }));

        if self.options.initiator {
            let channel = peer
                .create_data_channel(DATA_CHANNEL_LABEL, None)
                .await
                .map_err(engine_error)?;
            bridge_data_channel(channel, Arc::clone(&self.sink));
        } else {
            let sink = Arc::clone(&self.sink);
            peer.on_data_channel(Box::new(move |channel: Arc<RTCDataChannel>| {
                let sink = Arc::clone(&sink);
                Box::pin(async move {
                    bridge_data_channel(channel, sink);
                })
            }));
        }

        Ok(peer)
    }

    async fn apply_signal(
        &self,
        state: &mut RtcState,
        peer: &Arc<RTCPeerConnection>,
        signal: TransportSignal,
    ) -> Result<(), TransportError> {
        match signal {
            TransportSignal::Description { sdp_type, sdp } => {
                let description = parse_description(&sdp_type, sdp)?;
                peer.set_remote_description(description)
                    .await
                    .map_err(engine_error)?;

                if sdp_type == "offer" {
                    let answer = peer.create_answer(None).await.map_err(engine_error)?;
                    peer.set_local_description(answer.clone())
                        .await
                        .map_err(engine_error)?;
                    send_description(&self.options.send_signal, &answer);
                }

                for candidate in state.pending_candidates.drain(..) {
                    peer.add_ice_candidate(candidate).await.map_err(engine_error)?;
                }
            }
            TransportSignal::Candidate {
                candidate,
                sdp_mid,
                sdp_mline_index,
            } => {
                let init = RTCIceCandidateInit {
                    candidate,
                    sdp_mid,
                    sdp_mline_index,
                    username_fragment: None,
                };
                if peer.remote_description().await.is_none() {
                    state.pending_candidates.push(init);
                } else {
                    peer.add_ice_candidate(init).await.map_err(engine_error)?;
                }
            }
        }
        Ok(())
    }
}

fn send_description(send_signal: &SignalSender, description: &RTCSessionDescription) {
    send_signal(TransportSignal::Description {
        sdp_type: description.sdp_type.to_string(),
        sdp: description.sdp.clone(),
    });
}

/// Hand the data channel to the application once it opens
fn bridge_data_channel(channel: Arc<RTCDataChannel>, sink: Arc<EventSink>) {
    let (incoming_tx, incoming_rx) = mpsc::unbounded_channel::<Vec<u8>>();
    let (outgoing_tx, outgoing_rx) = mpsc::unbounded_channel::<Vec<u8>>();

    channel.on_message(Box::new(move |message: DataChannelMessage| {
        let incoming_tx = incoming_tx.clone();
        Box::pin(async move {
            let _ = incoming_tx.send(message.data.to_vec());
        })
    }));

    let parts = Arc::new(Mutex::new(Some((
        WireChannel::from_parts(outgoing_tx, incoming_rx),
        outgoing_rx,
    ))));
    let writer_channel = Arc::clone(&channel);
    let open_sink = Arc::clone(&sink);
    channel.on_open(Box::new(move || {
        let parts = parts.lock().take();
        let sink = Arc::clone(&open_sink);
        let writer_channel = Arc::clone(&writer_channel);
        Box::pin(async move {
            let Some((wire, mut outgoing_rx)) = parts else {
                return;
            };
            debug!("Data channel {} open", writer_channel.label());
            sink.emit(TransportEvent::Connected(wire));
            tokio::spawn(async move {
                while let Some(data) = outgoing_rx.recv().await {
                    if let Err(e) = writer_channel.send(&Bytes::from(data)).await {
                        warn!("Data channel send failed: {}", e);
                        break;
                    }
                }
            });
        })
    }));

    channel.on_close(Box::new(move || {
        let sink = Arc::clone(&sink);
        Box::pin(async move {
            sink.emit_closed();
        })
    }));
}

#[async_trait]
impl Transport for WebRtcTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::WebRtc
    }

    async fn connect(&self) -> Result<(), TransportError> {
        let mut state = self.state.lock().await;
        if state.closed {
            return Err(TransportError::Closed);
        }
        if state.peer.is_some() {
            return Err(TransportError::ConnectionFailed(
                "Already connecting".to_string(),
            ));
        }

        let peer = self.create_peer().await?;
        state.peer = Some(Arc::clone(&peer));

        if self.options.initiator {
            let offer = peer.create_offer(None).await.map_err(engine_error)?;
            peer.set_local_description(offer.clone())
                .await
                .map_err(engine_error)?;
            send_description(&self.options.send_signal, &offer);
        }

        let buffered: Vec<TransportSignal> = state.pending_signals.drain(..).collect();
        debug!(
            "WebRTC transport to {} connecting, replaying {} signal(s)",
            self.options.remote_id.truncate(),
            buffered.len()
        );
        for signal in buffered {
            self.apply_signal(&mut state, &peer, signal).await?;
        }
        Ok(())
    }

    async fn signal(&self, signal: TransportSignal) -> Result<(), TransportError> {
        let mut state = self.state.lock().await;
        if state.closed {
            return Ok(());
        }
        match state.peer.clone() {
            Some(peer) => self.apply_signal(&mut state, &peer, signal).await,
            None => {
                state.pending_signals.push(signal);
                Ok(())
            }
        }
    }

    async fn close(&self) -> Result<(), TransportError> {
        let peer = {
            let mut state = self.state.lock().await;
            if state.closed {
                return Ok(());
            }
            state.closed = true;
            state.pending_signals.clear();
            state.pending_candidates.clear();
            state.peer.take()
        };
        if let Some(peer) = peer {
            peer.close().await.map_err(engine_error)?;
        }
        self.sink.emit_closed();
        Ok(())
    }
}
