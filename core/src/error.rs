//! Error types for every layer of the networking stack
//!
//! Payloads are plain strings so errors can be cloned onto broadcast
//! channels (swarm error stream, transport events).

use crate::keys::Topic;
use thiserror::Error;
use uuid::Uuid;

/// Errors raised by a transport or its negotiation
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Negotiation failed: {0}")]
    NegotiationFailed(String),

    #[error("Invalid signal: {0}")]
    InvalidSignal(String),

    #[error("Send failed: {0}")]
    SendFailed(String),

    #[error("Transport closed")]
    Closed,

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Errors raised by the signaling layer
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SignalError {
    #[error("Not connected to {0}")]
    NotConnected(String),

    #[error("Request timed out: {0}")]
    Timeout(String),

    #[error("Server error: {0}")]
    Server(String),

    #[error("Unexpected response: {0}")]
    UnexpectedResponse(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("No signaling servers configured")]
    NoServers,

    #[error("Signal client closed")]
    Closed,
}

/// Errors raised by the reliable message router
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RouterError {
    #[error("Signal {0} was not acknowledged in time")]
    DeliveryTimeout(Uuid),

    #[error("Router destroyed")]
    Destroyed,

    #[error(transparent)]
    Signal(#[from] SignalError),
}

/// Errors raised by a single connection
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConnectionError {
    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Offer rejected")]
    OfferRejected,

    #[error("Offer timed out")]
    OfferTimeout,

    #[error("Transport did not connect in time")]
    ConnectTimeout,

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error(transparent)]
    Router(#[from] RouterError),

    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Errors surfaced by the network manager
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum NetworkError {
    #[error("Already joined swarm {0}")]
    AlreadyJoined(Topic),

    #[error("Not joined to swarm {0}")]
    NotJoined(Topic),

    #[error("Invalid options: {0}")]
    InvalidOptions(String),

    #[error(transparent)]
    Signal(#[from] SignalError),

    #[error(transparent)]
    Connection(#[from] ConnectionError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let id = Uuid::nil();
        assert_eq!(
            RouterError::DeliveryTimeout(id).to_string(),
            format!("Signal {} was not acknowledged in time", id)
        );
        assert_eq!(
            ConnectionError::ConnectTimeout.to_string(),
            "Transport did not connect in time"
        );
    }

    #[test]
    fn test_error_conversions() {
        let err: ConnectionError = RouterError::from(SignalError::NoServers).into();
        assert_eq!(err.to_string(), "No signaling servers configured");

        let err: ConnectionError = TransportError::Closed.into();
        assert!(matches!(err, ConnectionError::Transport(TransportError::Closed)));
    }
}
