pub mod connection;
pub mod core;
pub mod crypto;
pub mod file_transfer;
pub mod infrastructure;
pub mod orchestrator;
pub mod utils;

// Re-export the main entry points for integration tests and embedders
pub use connection::{ConnectionState, EventKind, PeerConnectionManager, PeerEvent};
pub use core::{PeerId, Role, SourceFile, TransferId, TransferMethod, TransferStatus};
pub use file_transfer::{FileChunker, FileReassembler, TransferNegotiator};
pub use infrastructure::config::AppConfig;
pub use orchestrator::{TransferEvent, TransferOrchestrator};
