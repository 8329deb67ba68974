pub mod chunker;
pub mod negotiation;
pub mod reassembler;
pub mod types;

// Re-exports for easier access from crate::file_transfer::{...}
pub use chunker::{ChunkCancelHandle, ChunkProgress, FileChunker};
pub use negotiation::{IncomingRequest, NegotiationOutcome, PendingNegotiation, RequestDisposition, TransferNegotiator};
pub use reassembler::{ChunkAck, ChunkStatus, FileReassembler, ReassembledFile, ReassemblyMetadata, ReassemblyProgress};
pub use types::{FileChunk, TransferMessage, TransferRequest, TransferResponse};
