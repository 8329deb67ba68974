use base64::{Engine as _, engine::general_purpose::STANDARD};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::core::domain::{FileMetadata, PeerId, TransferId, TransferMethod};
use crate::core::error::ProtocolError;
use crate::core::traits::Payload;

/// Envelope `type` strings of the transfer protocol
pub mod kind {
    pub const REQUEST: &str = "file-transfer-request";
    pub const RESPONSE: &str = "file-transfer-response";
    pub const START: &str = "file-transfer-start";
    pub const CHUNK: &str = "file-transfer-chunk";
    pub const COMPLETE: &str = "file-transfer-complete";
    pub const CANCEL: &str = "file-transfer-cancel";
    pub const SWARM_DESCRIPTOR: &str = "file-transfer-webtorrent";
    pub const SWARM_COMPLETE: &str = "file-transfer-webtorrent-complete";
}

/// Offer of a file, sent by the initiator
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferRequest {
    pub transfer_id: TransferId,
    pub metadata: FileMetadata,
    pub sender_id: PeerId,
    /// Milliseconds since the Unix epoch
    pub timestamp: u64,
    pub expires_at: u64,
    pub transfer_method: TransferMethod,
}

impl TransferRequest {
    pub fn is_expired(&self, now_millis: u64) -> bool {
        self.expires_at <= now_millis
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferResponse {
    pub transfer_id: TransferId,
    pub accepted: bool,
    pub receiver_id: PeerId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub timestamp: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferStart {
    pub transfer_id: TransferId,
    pub sender_id: PeerId,
    pub timestamp: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferComplete {
    pub transfer_id: TransferId,
    pub sender_id: PeerId,
    pub timestamp: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferCancel {
    pub transfer_id: TransferId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// One chunk as it travels on the wire; `data` is base64
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkMessage {
    pub transfer_id: TransferId,
    pub chunk_index: u32,
    pub total_chunks: u32,
    pub chunk_size: u32,
    pub file_name: String,
    pub file_size: u64,
    pub file_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_modified: Option<u64>,
    pub data: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checksum: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SwarmDescriptor {
    pub transfer_id: TransferId,
    #[serde(rename = "magnetURI")]
    pub magnet_uri: String,
    pub metadata: FileMetadata,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SwarmComplete {
    pub transfer_id: TransferId,
}

/// A decoded chunk with raw bytes
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileChunk {
    pub transfer_id: TransferId,
    pub index: u32,
    pub total_chunks: u32,
    pub chunk_size: u32,
    pub file_name: String,
    pub file_size: u64,
    pub file_type: String,
    pub last_modified: Option<u64>,
    pub data: Vec<u8>,
    /// Hex SHA-256 of `data`
    pub checksum: Option<String>,
}

impl FileChunk {
    pub fn to_message(&self) -> ChunkMessage {
        ChunkMessage {
            transfer_id: self.transfer_id.clone(),
            chunk_index: self.index,
            total_chunks: self.total_chunks,
            chunk_size: self.chunk_size,
            file_name: self.file_name.clone(),
            file_size: self.file_size,
            file_type: self.file_type.clone(),
            last_modified: self.last_modified,
            data: STANDARD.encode(&self.data),
            checksum: self.checksum.clone(),
        }
    }
}

impl TryFrom<ChunkMessage> for FileChunk {
    type Error = ProtocolError;

    fn try_from(message: ChunkMessage) -> Result<Self, Self::Error> {
        let data = STANDARD.decode(message.data.as_bytes())?;
        Ok(Self {
            transfer_id: message.transfer_id,
            index: message.chunk_index,
            total_chunks: message.total_chunks,
            chunk_size: message.chunk_size,
            file_name: message.file_name,
            file_size: message.file_size,
            file_type: message.file_type,
            last_modified: message.last_modified,
            data,
            checksum: message.checksum,
        })
    }
}

/// Closed set of transfer protocol messages, decoded once at the boundary
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferMessage {
    Request(TransferRequest),
    Response(TransferResponse),
    Start(TransferStart),
    Chunk(ChunkMessage),
    Complete(TransferComplete),
    Cancel(TransferCancel),
    SwarmDescriptor(SwarmDescriptor),
    SwarmComplete(SwarmComplete),
    /// Any other application message sharing the data channel
    Unknown { kind: String },
}

#[derive(Deserialize)]
struct Envelope {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    data: Value,
}

impl TransferMessage {
    /// Decode a `{ type, data }` envelope.
    ///
    /// Unrecognised types decode to [`TransferMessage::Unknown`]; a recognised
    /// type with a malformed body is an error.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let envelope: Envelope = serde_json::from_slice(bytes)?;
        let data = envelope.data;
        let message = match envelope.kind.as_str() {
            kind::REQUEST => TransferMessage::Request(serde_json::from_value(data)?),
            kind::RESPONSE => TransferMessage::Response(serde_json::from_value(data)?),
            kind::START => TransferMessage::Start(serde_json::from_value(data)?),
            kind::CHUNK => TransferMessage::Chunk(serde_json::from_value(data)?),
            kind::COMPLETE => TransferMessage::Complete(serde_json::from_value(data)?),
            kind::CANCEL => TransferMessage::Cancel(serde_json::from_value(data)?),
            kind::SWARM_DESCRIPTOR => TransferMessage::SwarmDescriptor(serde_json::from_value(data)?),
            kind::SWARM_COMPLETE => TransferMessage::SwarmComplete(serde_json::from_value(data)?),
            _ => TransferMessage::Unknown { kind: envelope.kind },
        };
        Ok(message)
    }

    pub fn kind(&self) -> &str {
        match self {
            TransferMessage::Request(_) => kind::REQUEST,
            TransferMessage::Response(_) => kind::RESPONSE,
            TransferMessage::Start(_) => kind::START,
            TransferMessage::Chunk(_) => kind::CHUNK,
            TransferMessage::Complete(_) => kind::COMPLETE,
            TransferMessage::Cancel(_) => kind::CANCEL,
            TransferMessage::SwarmDescriptor(_) => kind::SWARM_DESCRIPTOR,
            TransferMessage::SwarmComplete(_) => kind::SWARM_COMPLETE,
            TransferMessage::Unknown { kind } => kind,
        }
    }

    pub fn transfer_id(&self) -> Option<&TransferId> {
        match self {
            TransferMessage::Request(m) => Some(&m.transfer_id),
            TransferMessage::Response(m) => Some(&m.transfer_id),
            TransferMessage::Start(m) => Some(&m.transfer_id),
            TransferMessage::Chunk(m) => Some(&m.transfer_id),
            TransferMessage::Complete(m) => Some(&m.transfer_id),
            TransferMessage::Cancel(m) => Some(&m.transfer_id),
            TransferMessage::SwarmDescriptor(m) => Some(&m.transfer_id),
            TransferMessage::SwarmComplete(m) => Some(&m.transfer_id),
            TransferMessage::Unknown { .. } => None,
        }
    }

    pub fn encode(&self) -> Value {
        let data = match self {
            TransferMessage::Request(m) => serde_json::to_value(m),
            TransferMessage::Response(m) => serde_json::to_value(m),
            TransferMessage::Start(m) => serde_json::to_value(m),
            TransferMessage::Chunk(m) => serde_json::to_value(m),
            TransferMessage::Complete(m) => serde_json::to_value(m),
            TransferMessage::Cancel(m) => serde_json::to_value(m),
            TransferMessage::SwarmDescriptor(m) => serde_json::to_value(m),
            TransferMessage::SwarmComplete(m) => serde_json::to_value(m),
            TransferMessage::Unknown { .. } => Ok(json!({})),
        }
        // Plain structs with string keys always serialize.
        .unwrap_or(Value::Null);
        json!({ "type": self.kind(), "data": data })
    }

    pub fn to_payload(&self) -> Payload {
        Payload::Json(self.encode())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn metadata() -> FileMetadata {
        FileMetadata {
            id: "f".into(),
            name: "notes.txt".into(),
            size: 5,
            mime_type: "text/plain".into(),
            last_modified: 1,
            chunk_count: 1,
            chunk_size: 65536,
            checksum: None,
        }
    }

    #[test]
    fn test_request_wire_shape() {
        let message = TransferMessage::Request(TransferRequest {
            transfer_id: TransferId::from_string("t1"),
            metadata: metadata(),
            sender_id: PeerId::new("alice"),
            timestamp: 10,
            expires_at: 20,
            transfer_method: TransferMethod::Direct,
        });
        let value = message.encode();
        assert_eq!(value["type"], "file-transfer-request");
        assert_eq!(value["data"]["transferId"], "t1");
        assert_eq!(value["data"]["senderId"], "alice");
        assert_eq!(value["data"]["expiresAt"], 20);
        assert_eq!(value["data"]["transferMethod"], "direct");
        assert_eq!(value["data"]["metadata"]["type"], "text/plain");

        let decoded = TransferMessage::decode(value.to_string().as_bytes()).unwrap();
        assert_eq!(decoded, message);
    }

    #[test]
    fn test_swarm_descriptor_uses_magnet_uri_key() {
        let message = TransferMessage::SwarmDescriptor(SwarmDescriptor {
            transfer_id: TransferId::from_string("t1"),
            magnet_uri: "magnet:?xt=urn:btih:abc".into(),
            metadata: metadata(),
        });
        let value = message.encode();
        assert_eq!(value["type"], "file-transfer-webtorrent");
        assert_eq!(value["data"]["magnetURI"], "magnet:?xt=urn:btih:abc");
    }

    #[test]
    fn test_chunk_data_is_base64() {
        let chunk = FileChunk {
            transfer_id: TransferId::from_string("t1"),
            index: 0,
            total_chunks: 1,
            chunk_size: 4,
            file_name: "a.bin".into(),
            file_size: 4,
            file_type: "application/octet-stream".into(),
            last_modified: None,
            data: vec![0, 1, 2, 255],
            checksum: None,
        };
        let message = chunk.to_message();
        assert_eq!(message.data, "AAEC/w==");
        let bytes = TransferMessage::Chunk(message).encode().to_string();
        let TransferMessage::Chunk(decoded) = TransferMessage::decode(bytes.as_bytes()).unwrap() else {
            panic!("expected chunk");
        };
        assert!(!bytes.contains("lastModified"));
        assert_eq!(FileChunk::try_from(decoded).unwrap(), chunk);
    }

    #[test]
    fn test_unknown_kind_is_not_an_error() {
        let decoded = TransferMessage::decode(br#"{"type":"chat","data":{"text":"hi"}}"#).unwrap();
        assert_eq!(decoded, TransferMessage::Unknown { kind: "chat".into() });
        assert_eq!(decoded.transfer_id(), None);
    }

    #[test]
    fn test_malformed_payloads() {
        assert!(matches!(
            TransferMessage::decode(b"not json"),
            Err(ProtocolError::Malformed(_))
        ));
        assert!(TransferMessage::decode(br#"{"type":"file-transfer-cancel","data":{}}"#).is_err());

        let mut message = FileChunk {
            transfer_id: TransferId::from_string("t1"),
            index: 0,
            total_chunks: 1,
            chunk_size: 1,
            file_name: "a".into(),
            file_size: 1,
            file_type: "x".into(),
            last_modified: None,
            data: vec![1],
            checksum: None,
        }
        .to_message();
        message.data = "***".into();
        assert!(matches!(
            FileChunk::try_from(message),
            Err(ProtocolError::InvalidPayload(_))
        ));
    }
}
