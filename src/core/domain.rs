use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

use crate::utils;

/// Identifier of a remote peer as assigned by the signaling layer
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeerId {
    pub id: String,
}

impl PeerId {
    pub fn new(id: impl Into<String>) -> Self {
        Self { id: id.into() }
    }

    pub fn as_str(&self) -> &str {
        &self.id
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.id)
    }
}

impl From<&str> for PeerId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<PeerId> for String {
    fn from(peer_id: PeerId) -> String {
        peer_id.id
    }
}

impl Serialize for PeerId {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        self.id.serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for PeerId {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let id = String::deserialize(deserializer)?;
        Ok(PeerId::new(id))
    }
}

/// Strongly typed transfer identifier (UUID v4 in string form)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TransferId(pub String);

impl TransferId {
    pub fn new() -> Self {
        Self(utils::generate_id())
    }

    pub fn from_string(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for TransferId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TransferId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Which side of the offer/answer exchange a peer object plays
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Initiator,
    Receiver,
}

/// How a file travels once the negotiation is accepted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransferMethod {
    /// Chunked messages over the peer data channel
    Direct,
    /// Magnet-descriptor based distribution through a swarm client
    Swarm,
}

impl fmt::Display for TransferMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransferMethod::Direct => f.write_str("direct"),
            TransferMethod::Swarm => f.write_str("swarm"),
        }
    }
}

/// File metadata as announced in a transfer request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileMetadata {
    pub id: String,
    pub name: String,
    pub size: u64,
    #[serde(rename = "type")]
    pub mime_type: String,
    /// Milliseconds since the Unix epoch
    pub last_modified: u64,
    pub chunk_count: u32,
    pub chunk_size: u32,
    /// Hex SHA-256 of the whole file, when the sender computed one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checksum: Option<String>,
}

/// A file held in memory, ready to be offered to a peer.
///
/// Bytes are shared, so cloning a `SourceFile` is cheap.
#[derive(Debug, Clone)]
pub struct SourceFile {
    pub name: String,
    pub mime_type: String,
    pub last_modified: u64,
    pub bytes: Arc<[u8]>,
}

impl SourceFile {
    pub fn new(name: impl Into<String>, mime_type: impl Into<String>, bytes: impl Into<Arc<[u8]>>) -> Self {
        Self {
            name: name.into(),
            mime_type: mime_type.into(),
            last_modified: crate::utils::now_millis(),
            bytes: bytes.into(),
        }
    }

    pub fn with_last_modified(mut self, last_modified: u64) -> Self {
        self.last_modified = last_modified;
        self
    }

    pub fn size(&self) -> u64 {
        self.bytes.len() as u64
    }
}

/// A fully received file handed to the download collaborator
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedFile {
    pub transfer_id: TransferId,
    pub name: String,
    pub mime_type: String,
    pub last_modified: u64,
    pub data: Vec<u8>,
}

impl ReceivedFile {
    pub fn size(&self) -> u64 {
        self.data.len() as u64
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransferDirection {
    Upload,
    Download,
}

/// Transfer status enumeration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TransferStatus {
    Pending,
    InProgress,
    Completed,
    Failed { reason: String },
    Cancelled,
}

impl TransferStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TransferStatus::Completed | TransferStatus::Failed { .. } | TransferStatus::Cancelled
        )
    }
}

/// Post-acceptance view of one transfer, exposed to callers as a snapshot
#[derive(Debug, Clone)]
pub struct TransferState {
    pub transfer_id: TransferId,
    pub direction: TransferDirection,
    pub status: TransferStatus,
    pub peer_id: PeerId,
    pub method: TransferMethod,
    pub file_name: String,
    pub total_bytes: u64,
    pub bytes_transferred: u64,
    pub percentage: f32,
    pub started_at: Instant,
    pub updated_at: Instant,
}

impl TransferState {
    pub fn new(
        transfer_id: TransferId,
        direction: TransferDirection,
        peer_id: PeerId,
        method: TransferMethod,
        file_name: String,
        total_bytes: u64,
    ) -> Self {
        let now = Instant::now();
        Self {
            transfer_id,
            direction,
            status: TransferStatus::Pending,
            peer_id,
            method,
            file_name,
            total_bytes,
            bytes_transferred: 0,
            percentage: 0.0,
            started_at: now,
            updated_at: now,
        }
    }

    pub fn update(&mut self, bytes_transferred: u64) {
        self.bytes_transferred = bytes_transferred.min(self.total_bytes);
        self.percentage = if self.total_bytes > 0 {
            (self.bytes_transferred as f32 / self.total_bytes as f32) * 100.0
        } else {
            100.0
        };
        self.updated_at = Instant::now();
    }

    /// Average throughput since the transfer started, in bytes per second
    pub fn speed_bps(&self) -> f64 {
        let elapsed = self.updated_at.duration_since(self.started_at).as_secs_f64();
        if elapsed <= f64::EPSILON {
            return 0.0;
        }
        self.bytes_transferred as f64 / elapsed
    }

    /// Estimated time remaining at the current average speed
    pub fn eta(&self) -> Option<Duration> {
        let speed = self.speed_bps();
        if speed <= 0.0 {
            return None;
        }
        let remaining = self.total_bytes.saturating_sub(self.bytes_transferred);
        Some(Duration::from_secs_f64(remaining as f64 / speed))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transfer_id_is_uuid() {
        let id = TransferId::new();
        assert_eq!(id.as_str().len(), 36);
        assert_ne!(id, TransferId::new());
    }

    #[test]
    fn test_metadata_uses_wire_field_names() {
        let meta = FileMetadata {
            id: "f1".into(),
            name: "a.txt".into(),
            size: 3,
            mime_type: "text/plain".into(),
            last_modified: 7,
            chunk_count: 1,
            chunk_size: 65536,
            checksum: None,
        };
        let json = serde_json::to_value(&meta).unwrap();
        assert_eq!(json["type"], "text/plain");
        assert_eq!(json["lastModified"], 7);
        assert_eq!(json["chunkCount"], 1);
        assert!(json.get("checksum").is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_speed_and_eta() {
        let mut state = TransferState::new(
            TransferId::new(),
            TransferDirection::Upload,
            PeerId::new("p"),
            TransferMethod::Direct,
            "f".into(),
            1000,
        );
        assert_eq!(state.eta(), None);
        tokio::time::advance(Duration::from_secs(2)).await;
        state.update(500);
        assert!((state.speed_bps() - 250.0).abs() < 1e-6);
        assert_eq!(state.eta(), Some(Duration::from_secs(2)));
        assert!((state.percentage - 50.0).abs() < f32::EPSILON);
    }
}
