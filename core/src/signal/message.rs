//! Signaling messages and the websocket wire frames that carry them

use crate::error::SignalError;
use crate::keys::{PeerId, Topic};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Reply to an offer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Answer {
    pub accept: bool,
}

impl Answer {
    pub const ACCEPT: Answer = Answer { accept: true };
    pub const REJECT: Answer = Answer { accept: false };
}

/// Negotiation data produced and consumed by a transport
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TransportSignal {
    /// Session description (offer or answer SDP)
    Description { sdp_type: String, sdp: String },
    /// Trickled ICE candidate
    Candidate {
        candidate: String,
        #[serde(default)]
        sdp_mid: Option<String>,
        #[serde(default)]
        sdp_mline_index: Option<u16>,
    },
}

/// Payload of a signal message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalPayload {
    Offer,
    Answer(Answer),
    Signal(TransportSignal),
    Ack { message_id: Uuid },
}

impl SignalPayload {
    /// Short name for logs and the command trace
    pub fn kind(&self) -> &'static str {
        match self {
            SignalPayload::Offer => "offer",
            SignalPayload::Answer(_) => "answer",
            SignalPayload::Signal(_) => "signal",
            SignalPayload::Ack { .. } => "ack",
        }
    }
}

/// Message exchanged between two peers through the signaling layer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignalMessage {
    pub author: PeerId,
    pub recipient: PeerId,
    pub topic: Topic,
    /// Negotiation attempt this message belongs to
    pub session_id: Uuid,
    /// Assigned by the router for `Signal` payloads
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_id: Option<Uuid>,
    pub data: SignalPayload,
}

impl SignalMessage {
    pub fn new(
        author: PeerId,
        recipient: PeerId,
        topic: Topic,
        session_id: Uuid,
        data: SignalPayload,
    ) -> Self {
        Self {
            author,
            recipient,
            topic,
            session_id,
            message_id: None,
            data,
        }
    }

    /// Acknowledgement for this message, addressed back to its author
    pub fn ack(&self, message_id: Uuid) -> Self {
        Self::new(
            self.recipient,
            self.author,
            self.topic,
            self.session_id,
            SignalPayload::Ack { message_id },
        )
    }
}

/// Membership change within a topic
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SwarmEvent {
    PeerAvailable { peer: PeerId },
    PeerLeft { peer: PeerId },
}

impl SwarmEvent {
    pub fn peer(&self) -> PeerId {
        match self {
            SwarmEvent::PeerAvailable { peer } | SwarmEvent::PeerLeft { peer } => *peer,
        }
    }
}

// ============================================================================
// WIRE FRAMES
// ============================================================================

/// Request sent from a client to the signaling server
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalRequest {
    Join { topic: Topic, peer_id: PeerId },
    Leave { topic: Topic, peer_id: PeerId },
    Lookup { topic: Topic },
    Offer(SignalMessage),
    Signal(SignalMessage),
    /// Reply to a pushed offer
    Answer { request_id: u64, answer: Answer },
}

impl SignalRequest {
    pub fn method(&self) -> &'static str {
        match self {
            SignalRequest::Join { .. } => "join",
            SignalRequest::Leave { .. } => "leave",
            SignalRequest::Lookup { .. } => "lookup",
            SignalRequest::Offer(_) => "offer",
            SignalRequest::Signal(_) => "signal",
            SignalRequest::Answer { .. } => "answer",
        }
    }
}

/// Successful response body
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseBody {
    Peers(Vec<PeerId>),
    Answer(Answer),
    Done,
}

/// Unsolicited event pushed from the server to a client
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServerPush {
    Swarm { topic: Topic, event: SwarmEvent },
    Message(SignalMessage),
    Offer { request_id: u64, message: SignalMessage },
}

impl ServerPush {
    pub fn method(&self) -> &'static str {
        match self {
            ServerPush::Swarm { .. } => "swarm",
            ServerPush::Message(_) => "message",
            ServerPush::Offer { .. } => "offer",
        }
    }
}

/// Single JSON text frame on the signaling websocket
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Frame {
    Request { id: u64, request: SignalRequest },
    Response { id: u64, result: Result<ResponseBody, String> },
    Push { event: ServerPush },
}

impl Frame {
    pub fn encode(&self) -> Result<String, SignalError> {
        serde_json::to_string(self).map_err(|e| SignalError::Serialization(e.to_string()))
    }

    pub fn decode(text: &str) -> Result<Self, SignalError> {
        serde_json::from_str(text).map_err(|e| SignalError::Serialization(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message(data: SignalPayload) -> SignalMessage {
        SignalMessage::new(
            PeerId::random(),
            PeerId::random(),
            Topic::random(),
            Uuid::new_v4(),
            data,
        )
    }

    #[test]
    fn test_ack_is_addressed_to_author() {
        let msg = message(SignalPayload::Offer);
        let id = Uuid::new_v4();
        let ack = msg.ack(id);
        assert_eq!(ack.author, msg.recipient);
        assert_eq!(ack.recipient, msg.author);
        assert_eq!(ack.session_id, msg.session_id);
        assert_eq!(ack.data, SignalPayload::Ack { message_id: id });
    }

    #[test]
    fn test_message_id_omitted_when_unset() {
        let msg = message(SignalPayload::Offer);
        let json = serde_json::to_string(&msg).unwrap();
        assert!(!json.contains("message_id"));
        assert!(json.contains("\"data\":\"offer\""));
    }

    #[test]
    fn test_candidate_signal_frame() {
        let mut msg = message(SignalPayload::Signal(TransportSignal::Candidate {
            candidate: "candidate:1 1 udp 2122260223 10.0.0.1 50000 typ host".into(),
            sdp_mid: Some("0".into()),
            sdp_mline_index: Some(0),
        }));
        msg.message_id = Some(Uuid::new_v4());

        let frame = Frame::Request {
            id: 7,
            request: SignalRequest::Signal(msg.clone()),
        };
        let text = frame.encode().unwrap();
        match Frame::decode(&text).unwrap() {
            Frame::Request {
                id,
                request: SignalRequest::Signal(decoded),
            } => {
                assert_eq!(id, 7);
                assert_eq!(decoded, msg);
            }
            other => panic!("Wrong frame: {:?}", other),
        }
    }

    #[test]
    fn test_error_response_frame() {
        let frame = Frame::Response {
            id: 3,
            result: Err("unknown peer".into()),
        };
        let decoded = Frame::decode(&frame.encode().unwrap()).unwrap();
        assert_eq!(decoded, frame);
    }

    #[test]
    fn test_decode_garbage() {
        assert!(matches!(
            Frame::decode("{not json"),
            Err(SignalError::Serialization(_))
        ));
    }

    #[test]
    fn test_method_names() {
        let topic = Topic::random();
        assert_eq!(SignalRequest::Lookup { topic }.method(), "lookup");
        let push = ServerPush::Swarm {
            topic,
            event: SwarmEvent::PeerLeft {
                peer: PeerId::random(),
            },
        };
        assert_eq!(push.method(), "swarm");
    }
}
