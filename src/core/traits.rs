use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::error::Error;
use std::sync::Arc;

use super::domain::*;
use super::error::{SinkError, SwarmError, TransportError};
use crate::connection::manager::TransportEvents;

/// Result type returned by event handlers
pub type HandlerResult = Result<(), Box<dyn Error + Send + Sync>>;

/// Signaling data exchanged out of band to establish a peer connection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum SignalData {
    Offer {
        sdp: String,
    },
    Answer {
        sdp: String,
    },
    #[serde(rename_all = "camelCase")]
    Candidate {
        candidate: String,
        sdp_mid: Option<String>,
        sdp_m_line_index: Option<u16>,
    },
}

/// A payload ready to be written to a data channel
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    Text(String),
    Binary(Vec<u8>),
    Json(serde_json::Value),
}

impl Payload {
    pub fn json<T: Serialize>(value: &T) -> Result<Self, serde_json::Error> {
        Ok(Payload::Json(serde_json::to_value(value)?))
    }

    /// Transport-compatible byte form; JSON values are serialized compactly
    pub fn into_bytes(self) -> Vec<u8> {
        match self {
            Payload::Text(text) => text.into_bytes(),
            Payload::Binary(bytes) => bytes,
            Payload::Json(value) => value.to_string().into_bytes(),
        }
    }
}

impl From<String> for Payload {
    fn from(text: String) -> Self {
        Payload::Text(text)
    }
}

impl From<&str> for Payload {
    fn from(text: &str) -> Self {
        Payload::Text(text.to_string())
    }
}

impl From<Vec<u8>> for Payload {
    fn from(bytes: Vec<u8>) -> Self {
        Payload::Binary(bytes)
    }
}

impl From<serde_json::Value> for Payload {
    fn from(value: serde_json::Value) -> Self {
        Payload::Json(value)
    }
}

/// A transport-level peer object (one WebRTC peer connection plus its data channel).
///
/// Implementations report asynchronous happenings through the
/// [`TransportEvents`] handle they were created with.
pub trait PeerTransport: Send + Sync {
    /// Feed remote signaling data (offer, answer or candidate)
    fn signal(&self, data: &SignalData) -> Result<(), TransportError>;

    /// Write bytes to the data channel
    fn send(&self, payload: &[u8]) -> Result<(), TransportError>;

    /// Release all transport resources; must be idempotent
    fn destroy(&self);
}

/// Creates transport peer objects for the connection manager
pub trait TransportFactory: Send + Sync {
    fn create(
        &self,
        peer_id: &PeerId,
        role: Role,
        events: TransportEvents,
    ) -> Result<Arc<dyn PeerTransport>, TransportError>;
}

/// The narrow send/broadcast primitive the transfer layer rides on
pub trait PeerMessenger: Send + Sync {
    /// Returns `false` when the peer is unknown or not connected
    fn send_to_peer(&self, peer_id: &PeerId, payload: Payload) -> bool;

    /// Sends to every connected peer except `exclude`; returns the delivery count
    fn broadcast(&self, payload: Payload, exclude: Option<&PeerId>) -> usize;
}

/// Counters polled from a swarm session
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SwarmStats {
    pub downloaded: u64,
    pub uploaded: u64,
    pub total: u64,
    pub done: bool,
}

/// External magnet-style distribution client used for large files
#[async_trait]
pub trait SwarmClient: Send + Sync {
    /// Start seeding `file`; resolves with the magnet descriptor once metadata is ready
    async fn seed(&self, transfer_id: &TransferId, file: &SourceFile) -> Result<String, SwarmError>;

    /// Join the swarm described by `magnet_uri`
    async fn join(&self, transfer_id: &TransferId, magnet_uri: &str) -> Result<(), SwarmError>;

    fn stats(&self, transfer_id: &TransferId) -> Option<SwarmStats>;

    /// Blobs of a completed download session
    fn files(&self, transfer_id: &TransferId) -> Result<Vec<Vec<u8>>, SwarmError>;

    /// Tear down the session for `transfer_id`; unknown ids are ignored
    fn destroy(&self, transfer_id: &TransferId);
}

/// Browser-integration collaborator that saves a received file
pub trait FileSink: Send + Sync {
    fn save(&self, file: &ReceivedFile) -> Result<(), SinkError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_signal_data_wire_shape() {
        let signal = SignalData::Candidate {
            candidate: "candidate:1".into(),
            sdp_mid: Some("0".into()),
            sdp_m_line_index: Some(0),
        };
        let json = serde_json::to_value(&signal).unwrap();
        assert_eq!(json["type"], "candidate");
        assert_eq!(json["sdpMLineIndex"], 0);
    }

    #[test]
    fn test_payload_bytes() {
        assert_eq!(Payload::from("hi").into_bytes(), b"hi".to_vec());
        let json = Payload::json(&serde_json::json!({"type": "ping"})).unwrap();
        assert_eq!(json.into_bytes(), br#"{"type":"ping"}"#.to_vec());
    }
}
