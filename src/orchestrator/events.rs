use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::connection::events::invoke_guarded;
use crate::core::domain::{PeerId, TransferId, TransferState, TransferStatus};
use crate::core::traits::HandlerResult;
use crate::file_transfer::types::TransferRequest;

/// What the orchestrator reports to the UI layer
#[derive(Debug, Clone)]
pub enum TransferEvent {
    /// A fresh request awaiting accept or reject
    IncomingRequest { from: PeerId, request: TransferRequest },
    StatusChanged { transfer_id: TransferId, status: TransferStatus },
    Progress(TransferState),
    /// A download was reassembled and handed to the file sink
    FileReceived {
        transfer_id: TransferId,
        file_name: String,
        size: u64,
        verification_passed: Option<bool>,
    },
}

pub type TransferCallback = Arc<dyn Fn(&TransferEvent) -> HandlerResult + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

#[derive(Default)]
pub struct TransferListeners {
    handlers: Mutex<Vec<(ListenerId, TransferCallback)>>,
    next_id: AtomicU64,
}

impl TransferListeners {
    fn handlers(&self) -> MutexGuard<'_, Vec<(ListenerId, TransferCallback)>> {
        self.handlers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn subscribe(&self, handler: TransferCallback) -> ListenerId {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.handlers().push((id, handler));
        id
    }

    pub fn unsubscribe(&self, id: ListenerId) -> bool {
        let mut handlers = self.handlers();
        let before = handlers.len();
        handlers.retain(|(existing, _)| *existing != id);
        handlers.len() != before
    }

    /// Deliver to every listener; failures are logged and skipped
    pub fn emit(&self, event: &TransferEvent) -> usize {
        let snapshot: Vec<TransferCallback> = self.handlers().iter().map(|(_, h)| h.clone()).collect();
        snapshot
            .iter()
            .filter(|handler| invoke_guarded("transfer", &***handler, event))
            .count()
    }

    pub fn clear(&self) {
        self.handlers().clear();
    }
}
