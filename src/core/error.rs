use thiserror::Error;

use super::domain::{PeerId, TransferId};
use crate::connection::state::ConnectionState;

/// Errors reported by a transport peer object
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("Data channel is not open")]
    ChannelClosed,

    #[error("Failed to apply signal data: {0}")]
    Signal(String),

    #[error("Failed to create transport: {0}")]
    Create(String),

    #[error("Transport error: {0}")]
    Other(String),
}

/// Peer connection manager errors
#[derive(Error, Debug)]
pub enum ConnectionError {
    #[error("No peer with id {0}")]
    PeerNotFound(PeerId),

    #[error("Peer {peer_id} is {state}, operation not allowed")]
    InvalidState { peer_id: PeerId, state: ConnectionState },

    #[error("Invalid state transition {from} -> {to}")]
    InvalidTransition { from: ConnectionState, to: ConnectionState },

    #[error("Connection manager has been destroyed")]
    ManagerDestroyed,

    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Chunk emission errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ChunkerError {
    #[error("Chunk size {size} exceeds maximum of {max} bytes")]
    ChunkSizeTooLarge { size: usize, max: usize },

    #[error("Chunk size must be greater than 0")]
    InvalidChunkSize,

    #[error("File has more chunks than the protocol can index")]
    TooManyChunks,

    #[error("Chunking aborted")]
    Aborted,
}

/// Reassembly errors, surfaced on the failing operation's result
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ReassemblyError {
    #[error("File size {size} exceeds maximum of {max} bytes")]
    FileTooLarge { size: u64, max: u64 },

    #[error("Reassembly for transfer {0} already exists")]
    AlreadyExists(TransferId),

    #[error("Reassembly memory limit exceeded ({used} of {max} bytes in use)")]
    MemoryLimitExceeded { used: u64, max: u64 },

    #[error("Unknown transfer {0}")]
    UnknownTransfer(TransferId),

    #[error("Invalid file metadata: {0}")]
    InvalidMetadata(String),

    #[error("Chunk index {index} out of range for {total} chunks")]
    InvalidChunkIndex { index: u32, total: u32 },

    #[error("Chunk {index} has {actual} bytes, expected {expected}")]
    InvalidChunkLength { index: u32, expected: u64, actual: u64 },

    #[error("Reassembled {actual} bytes, expected {expected}")]
    SizeMismatch { expected: u64, actual: u64 },

    /// `missing` lists at most the first few indices; `count` is the full number
    #[error("Transfer {transfer_id} is missing chunks {}", format_indices(.missing, .count))]
    MissingChunks {
        transfer_id: TransferId,
        missing: Vec<u32>,
        count: u32,
    },
}

fn format_indices(indices: &[u32], count: &u32) -> String {
    const SHOWN: usize = 10;
    let shown = indices.len().min(SHOWN);
    let mut text = indices[..shown]
        .iter()
        .map(u32::to_string)
        .collect::<Vec<_>>()
        .join(", ");
    let hidden = (*count as usize).saturating_sub(shown);
    if hidden > 0 {
        text.push_str(&format!(" and {} more", hidden));
    }
    text
}

/// Negotiation handshake errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum NegotiationError {
    #[error("Concurrent negotiation limit exceeded ({max} pending)")]
    LimitExceeded { max: usize },

    #[error("Failed to send {kind} to peer {peer_id}")]
    SendFailed { kind: &'static str, peer_id: PeerId },

    #[error("Unknown transfer request {0}")]
    UnknownTransfer(TransferId),

    #[error("Transfer request {0} has expired")]
    Expired(TransferId),
}

/// Wire decoding errors
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("Malformed message: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("Invalid chunk payload: {0}")]
    InvalidPayload(#[from] base64::DecodeError),
}

/// Swarm distribution errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SwarmError {
    #[error("Seeding failed: {0}")]
    Seed(String),

    #[error("Joining swarm failed: {0}")]
    Join(String),

    #[error("No files found in swarm session")]
    NoFiles,

    #[error("Unknown swarm session {0}")]
    UnknownSession(TransferId),
}

/// Errors from the download/save collaborator
#[derive(Error, Debug)]
pub enum SinkError {
    #[error("Failed to save file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Rejected file: {0}")]
    Rejected(String),
}

/// Orchestrator-level transfer errors
#[derive(Error, Debug)]
pub enum TransferError {
    #[error("Unknown transfer {0}")]
    UnknownTransfer(TransferId),

    #[error("Transfer {0} already finished")]
    AlreadyFinished(TransferId),

    #[error(transparent)]
    Negotiation(#[from] NegotiationError),

    #[error(transparent)]
    Chunker(#[from] ChunkerError),

    #[error(transparent)]
    Reassembly(#[from] ReassemblyError),

    #[error(transparent)]
    Swarm(#[from] SwarmError),
}

/// Configuration loading and validation errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Invalid value for {name}: {value}")]
    InvalidEnv { name: &'static str, value: String },

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_chunks_message_names_indices() {
        let err = ReassemblyError::MissingChunks {
            transfer_id: TransferId::from_string("t1"),
            missing: vec![2, 5],
            count: 2,
        };
        assert_eq!(err.to_string(), "Transfer t1 is missing chunks 2, 5");
    }

    #[test]
    fn test_missing_chunks_message_truncates() {
        let err = ReassemblyError::MissingChunks {
            transfer_id: TransferId::from_string("t1"),
            missing: (0..12).collect(),
            count: 12,
        };
        assert!(err.to_string().ends_with("9 and 2 more"));
    }

    #[test]
    fn test_missing_chunks_message_counts_unlisted() {
        let err = ReassemblyError::MissingChunks {
            transfer_id: TransferId::from_string("t1"),
            missing: vec![0, 1],
            count: 5_000,
        };
        assert!(err.to_string().ends_with("0, 1 and 4998 more"));
    }
}
