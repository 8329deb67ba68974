//! Per-file transfer coordination on top of the connection manager.
//!
//! Files at or below the swarm threshold are chunked over the data channel;
//! larger files are seeded through a [`SwarmClient`] and only a magnet
//! descriptor crosses the data channel. The orchestrator owns the map of
//! active transfers and drives the negotiator, chunker and reassembler.

pub mod events;

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use tokio::task::{AbortHandle, JoinHandle};
use tracing::{debug, info, warn};

pub use events::{ListenerId, TransferCallback, TransferEvent, TransferListeners};

use crate::connection::events::{EventKind, PeerEvent, SubscriptionId};
use crate::connection::manager::PeerConnectionManager;
use crate::core::domain::{
    FileMetadata, PeerId, ReceivedFile, SourceFile, TransferDirection, TransferId, TransferMethod, TransferState,
    TransferStatus,
};
use crate::core::error::{ChunkerError, NegotiationError, ReassemblyError, SinkError, SwarmError, TransferError};
use crate::core::traits::{FileSink, PeerMessenger, SwarmClient};
use crate::crypto;
use crate::file_transfer::chunker::{ChunkCancelHandle, FileChunker};
use crate::file_transfer::negotiation::{
    IncomingRequest, NegotiationOutcome, PendingNegotiation, RequestDisposition, TransferNegotiator,
};
use crate::file_transfer::reassembler::{self, ChunkStatus, FileReassembler, ReassemblyMetadata, ReassemblyProgress};
use crate::file_transfer::types::{
    ChunkMessage, FileChunk, SwarmComplete, SwarmDescriptor, TransferCancel, TransferComplete, TransferMessage,
    TransferRequest, TransferStart,
};
use crate::infrastructure::config::AppConfig;
use crate::utils;

const STALLED: &str = "Transfer stalled, no chunks received";

/// Direct for sizes at or below `threshold`, swarm above it
pub fn select_method(size: u64, threshold: u64) -> TransferMethod {
    if size <= threshold {
        TransferMethod::Direct
    } else {
        TransferMethod::Swarm
    }
}

/// Handle on an outgoing transfer's driver task
#[derive(Debug)]
pub struct TransferHandle {
    pub transfer_id: TransferId,
    pub method: TransferMethod,
    task: JoinHandle<TransferStatus>,
}

impl TransferHandle {
    /// Wait for the driver task and return the transfer's final status
    pub async fn wait(self) -> TransferStatus {
        match self.task.await {
            Ok(status) => status,
            Err(e) if e.is_cancelled() => TransferStatus::Cancelled,
            Err(e) => TransferStatus::Failed {
                reason: format!("transfer task failed: {}", e),
            },
        }
    }
}

struct ActiveTransfer {
    state: TransferState,
    metadata: FileMetadata,
    cancel: Option<ChunkCancelHandle>,
    task: Option<AbortHandle>,
    cleanup: Option<JoinHandle<()>>,
}

#[derive(Default)]
struct OrchestratorState {
    transfers: HashMap<TransferId, ActiveTransfer>,
    destroyed: bool,
}

struct OrchestratorInner {
    local_id: PeerId,
    config: AppConfig,
    messenger: Arc<dyn PeerMessenger>,
    negotiator: TransferNegotiator,
    reassembler: Arc<Mutex<FileReassembler>>,
    swarm: Option<Arc<dyn SwarmClient>>,
    sink: Arc<dyn FileSink>,
    listeners: TransferListeners,
    state: Mutex<OrchestratorState>,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl OrchestratorInner {
    fn lock(&self) -> MutexGuard<'_, OrchestratorState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn reassembler(&self) -> MutexGuard<'_, FileReassembler> {
        self.reassembler.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for OrchestratorInner {
    fn drop(&mut self) {
        if let Some(sweeper) = self.sweeper.get_mut().unwrap_or_else(PoisonError::into_inner).take() {
            sweeper.abort();
        }
    }
}

#[derive(Clone)]
pub struct TransferOrchestrator {
    inner: Arc<OrchestratorInner>,
}

impl TransferOrchestrator {
    /// Orchestrator without a swarm client; every file takes the direct path
    pub fn new(local_id: PeerId, config: AppConfig, messenger: Arc<dyn PeerMessenger>, sink: Arc<dyn FileSink>) -> Self {
        Self::build(local_id, config, messenger, sink, None)
    }

    pub fn with_swarm(
        local_id: PeerId,
        config: AppConfig,
        messenger: Arc<dyn PeerMessenger>,
        sink: Arc<dyn FileSink>,
        swarm: Arc<dyn SwarmClient>,
    ) -> Self {
        Self::build(local_id, config, messenger, sink, Some(swarm))
    }

    fn build(
        local_id: PeerId,
        config: AppConfig,
        messenger: Arc<dyn PeerMessenger>,
        sink: Arc<dyn FileSink>,
        swarm: Option<Arc<dyn SwarmClient>>,
    ) -> Self {
        let negotiator = TransferNegotiator::new(local_id.clone(), config.negotiation.clone(), messenger.clone());
        let reassembler = Arc::new(Mutex::new(FileReassembler::new(config.reassembler.clone())));
        let inner = Arc::new(OrchestratorInner {
            local_id,
            config,
            messenger,
            negotiator,
            reassembler,
            swarm,
            sink,
            listeners: TransferListeners::default(),
            state: Mutex::new(OrchestratorState::default()),
            sweeper: Mutex::new(None),
        });

        let weak = Arc::downgrade(&inner);
        let sweeper = reassembler::spawn_sweeper(&inner.reassembler, move |evicted| {
            if let Some(inner) = weak.upgrade() {
                TransferOrchestrator { inner }.fail_evicted(evicted);
            }
        });
        *inner.sweeper.lock().unwrap_or_else(PoisonError::into_inner) = Some(sweeper);

        Self { inner }
    }

    pub fn local_id(&self) -> &PeerId {
        &self.inner.local_id
    }

    pub fn config(&self) -> &AppConfig {
        &self.inner.config
    }

    pub fn negotiator(&self) -> &TransferNegotiator {
        &self.inner.negotiator
    }

    /// Method used for a file of `size` bytes, falling back to direct without a swarm client
    pub fn method_for(&self, size: u64) -> TransferMethod {
        match select_method(size, self.inner.config.orchestrator.swarm_threshold) {
            TransferMethod::Swarm if self.inner.swarm.is_none() => {
                warn!(size, "File exceeds swarm threshold but no swarm client is configured");
                TransferMethod::Direct
            }
            method => method,
        }
    }

    /// Subscribe to transfer events
    pub fn on_event(&self, handler: TransferCallback) -> ListenerId {
        self.inner.listeners.subscribe(handler)
    }

    pub fn off_event(&self, id: ListenerId) -> bool {
        self.inner.listeners.unsubscribe(id)
    }

    /// Route incoming data, peer loss and reconnect failures from `manager` into this orchestrator
    pub fn attach(&self, manager: &PeerConnectionManager) -> Vec<SubscriptionId> {
        let data = {
            let weak = Arc::downgrade(&self.inner);
            manager.on(
                EventKind::Data,
                Arc::new(move |event: &PeerEvent| {
                    if let (PeerEvent::Data { peer_id, data }, Some(inner)) = (event, weak.upgrade()) {
                        TransferOrchestrator { inner }.handle_message(peer_id, data);
                    }
                    Ok(())
                }),
            )
        };
        let close = {
            let weak = Arc::downgrade(&self.inner);
            manager.on(
                EventKind::Close,
                Arc::new(move |event: &PeerEvent| {
                    if let Some(inner) = weak.upgrade() {
                        TransferOrchestrator { inner }.handle_peer_lost(event.peer_id(), "Peer disconnected");
                    }
                    Ok(())
                }),
            )
        };
        let failed = {
            let weak = Arc::downgrade(&self.inner);
            manager.on(
                EventKind::ReconnectFailed,
                Arc::new(move |event: &PeerEvent| {
                    if let (PeerEvent::ReconnectFailed { peer_id, reason, .. }, Some(inner)) = (event, weak.upgrade()) {
                        let reason = format!("Connection failed ({})", reason.as_str());
                        TransferOrchestrator { inner }.handle_peer_lost(peer_id, &reason);
                    }
                    Ok(())
                }),
            )
        };
        vec![data, close, failed]
    }

    /// Offer `file` to `peer_id` and drive the transfer once accepted
    pub fn send_file(&self, peer_id: &PeerId, file: SourceFile) -> Result<TransferHandle, TransferError> {
        let method = self.method_for(file.size());
        let transfer_id = TransferId::new();
        let chunker = FileChunker::new(file.clone(), transfer_id.clone(), &self.inner.config.chunker)?;
        let metadata = chunker.metadata();

        let pending = self
            .inner
            .negotiator
            .request_transfer(peer_id, transfer_id.clone(), metadata.clone(), method)?;

        let state = TransferState::new(
            transfer_id.clone(),
            TransferDirection::Upload,
            peer_id.clone(),
            method,
            file.name.clone(),
            file.size(),
        );
        self.inner.lock().transfers.insert(
            transfer_id.clone(),
            ActiveTransfer {
                state,
                metadata,
                cancel: Some(chunker.cancel_handle()),
                task: None,
                cleanup: None,
            },
        );
        self.emit_status(&transfer_id, TransferStatus::Pending);

        let orchestrator = self.clone();
        let peer = peer_id.clone();
        let task = tokio::spawn(async move { orchestrator.run_upload(peer, pending, chunker, file).await });
        if let Some(transfer) = self.inner.lock().transfers.get_mut(&transfer_id) {
            transfer.task = Some(task.abort_handle());
        }

        info!(%peer_id, %transfer_id, %method, "Sending file");
        Ok(TransferHandle {
            transfer_id,
            method,
            task,
        })
    }

    /// Send several files to one peer concurrently; each result pairs with its input
    pub async fn send_files(&self, peer_id: &PeerId, files: Vec<SourceFile>) -> Vec<Result<TransferStatus, TransferError>> {
        let handles: Vec<_> = files.into_iter().map(|file| self.send_file(peer_id, file)).collect();
        let waits = handles.into_iter().map(|handle| async move {
            match handle {
                Ok(handle) => Ok(handle.wait().await),
                Err(e) => Err(e),
            }
        });
        futures::future::join_all(waits).await
    }

    /// Accept a pending incoming request
    pub fn accept_transfer(&self, transfer_id: &TransferId) -> Result<(), TransferError> {
        let incoming = self
            .inner
            .negotiator
            .incoming_request(transfer_id)
            .ok_or_else(|| NegotiationError::UnknownTransfer(transfer_id.clone()))?;
        let request = &incoming.request;
        let method = request.transfer_method;

        match method {
            TransferMethod::Direct => {
                let metadata = ReassemblyMetadata::from_file_metadata(transfer_id, &request.metadata);
                let (initialized, evicted) = {
                    let mut reassembler = self.inner.reassembler();
                    (reassembler.initialize(metadata), reassembler.take_evicted())
                };
                self.fail_evicted(&evicted);
                if let Err(e) = initialized {
                    warn!(%transfer_id, "Refusing transfer: {}", e);
                    let _ = self.inner.negotiator.reject(transfer_id, Some(e.to_string()));
                    return Err(e.into());
                }
            }
            TransferMethod::Swarm if self.inner.swarm.is_none() => {
                let reason = "Swarm transfers are not supported".to_string();
                let _ = self.inner.negotiator.reject(transfer_id, Some(reason.clone()));
                return Err(SwarmError::Join(reason).into());
            }
            TransferMethod::Swarm => {}
        }

        // Registered before responding so the first chunks find the transfer.
        let state = TransferState::new(
            transfer_id.clone(),
            TransferDirection::Download,
            incoming.from.clone(),
            method,
            request.metadata.name.clone(),
            request.metadata.size,
        );
        self.inner.lock().transfers.insert(
            transfer_id.clone(),
            ActiveTransfer {
                state,
                metadata: request.metadata.clone(),
                cancel: None,
                task: None,
                cleanup: None,
            },
        );

        if let Err(e) = self.inner.negotiator.accept(transfer_id) {
            self.inner.lock().transfers.remove(transfer_id);
            self.inner.reassembler().cancel_reassembly(transfer_id);
            return Err(e.into());
        }
        info!(%transfer_id, from = %incoming.from, %method, "Transfer accepted");
        self.emit_status(transfer_id, TransferStatus::Pending);
        Ok(())
    }

    pub fn reject_transfer(&self, transfer_id: &TransferId, reason: Option<String>) -> Result<(), TransferError> {
        self.inner.negotiator.reject(transfer_id, reason)?;
        info!(%transfer_id, "Transfer rejected");
        Ok(())
    }

    /// Cancel a transfer: mark it cancelled, stop emission or the swarm session,
    /// release the reassembly buffer and notify the peer
    pub fn cancel_transfer(&self, transfer_id: &TransferId) -> Result<(), TransferError> {
        let known = self.inner.lock().transfers.contains_key(transfer_id);
        if !known {
            // Possibly still an unanswered incoming request.
            if self.inner.negotiator.cancel(transfer_id, Some("cancelled".to_string())) {
                return Ok(());
            }
            return Err(TransferError::UnknownTransfer(transfer_id.clone()));
        }
        self.teardown(transfer_id, TransferStatus::Cancelled, true)
    }

    /// Fail every live transfer with `peer_id`; returns how many were affected
    pub fn handle_peer_lost(&self, peer_id: &PeerId, reason: &str) -> usize {
        let affected: Vec<TransferId> = {
            let state = self.inner.lock();
            state
                .transfers
                .iter()
                .filter(|(_, t)| t.state.peer_id == *peer_id && !t.state.status.is_terminal())
                .map(|(id, _)| id.clone())
                .collect()
        };
        for transfer_id in &affected {
            let status = TransferStatus::Failed {
                reason: reason.to_string(),
            };
            // Already-finished transfers are skipped.
            let _ = self.teardown(transfer_id, status, false);
        }
        if !affected.is_empty() {
            warn!(%peer_id, count = affected.len(), "Failed transfers after losing peer: {}", reason);
        }
        affected.len()
    }

    /// Dispatch one data-channel message; `false` when it is not a transfer message
    pub fn handle_message(&self, from: &PeerId, bytes: &[u8]) -> bool {
        let message = match TransferMessage::decode(bytes) {
            Ok(message) => message,
            Err(e) => {
                debug!(%from, "Ignoring undecodable message: {}", e);
                return false;
            }
        };
        match message {
            TransferMessage::Request(request) => self.on_request(from, request),
            TransferMessage::Response(response) => {
                self.inner.negotiator.handle_response(from, &response);
            }
            TransferMessage::Start(start) => self.on_start(from, start),
            TransferMessage::Chunk(chunk) => self.on_chunk(from, chunk),
            TransferMessage::Complete(complete) => self.on_complete(from, complete),
            TransferMessage::Cancel(cancel) => self.on_cancel(from, cancel),
            TransferMessage::SwarmDescriptor(descriptor) => self.on_swarm_descriptor(from, descriptor),
            TransferMessage::SwarmComplete(complete) => self.on_swarm_complete(from, complete),
            TransferMessage::Unknown { kind } => {
                debug!(%from, %kind, "Not a transfer message");
                return false;
            }
        }
        true
    }

    pub fn transfer(&self, transfer_id: &TransferId) -> Option<TransferState> {
        self.inner.lock().transfers.get(transfer_id).map(|t| t.state.clone())
    }

    /// File metadata announced for an active transfer
    pub fn file_metadata(&self, transfer_id: &TransferId) -> Option<FileMetadata> {
        self.inner.lock().transfers.get(transfer_id).map(|t| t.metadata.clone())
    }

    pub fn transfers(&self) -> Vec<TransferState> {
        let mut transfers: Vec<_> = self.inner.lock().transfers.values().map(|t| t.state.clone()).collect();
        transfers.sort_by_key(|state| state.started_at);
        transfers
    }

    pub fn incoming_requests(&self) -> Vec<IncomingRequest> {
        self.inner.negotiator.incoming_requests()
    }

    pub fn reassembly_progress(&self, transfer_id: &TransferId) -> Option<ReassemblyProgress> {
        self.inner.reassembler().progress(transfer_id)
    }

    /// Stop everything; live transfers end as cancelled without notifying peers
    pub fn destroy(&self) {
        let ids: Vec<TransferId> = {
            let mut state = self.inner.lock();
            if state.destroyed {
                return;
            }
            state.destroyed = true;
            state.transfers.keys().cloned().collect()
        };
        for transfer_id in &ids {
            let _ = self.teardown(transfer_id, TransferStatus::Cancelled, false);
        }
        self.inner.negotiator.destroy();
        if let Some(sweeper) = self.inner.sweeper.lock().unwrap_or_else(PoisonError::into_inner).take() {
            sweeper.abort();
        }
        let transfers: Vec<ActiveTransfer> = self.inner.lock().transfers.drain().map(|(_, t)| t).collect();
        for transfer in transfers {
            if let Some(cleanup) = transfer.cleanup {
                cleanup.abort();
            }
        }
        self.inner.listeners.clear();
        info!("Transfer orchestrator destroyed");
    }

    async fn run_upload(
        self,
        peer_id: PeerId,
        pending: PendingNegotiation,
        chunker: FileChunker,
        file: SourceFile,
    ) -> TransferStatus {
        let transfer_id = pending.transfer_id().clone();
        let method = pending.request.transfer_method;
        let metadata = pending.request.metadata.clone();

        match pending.outcome().await {
            NegotiationOutcome::Accepted => {}
            NegotiationOutcome::Rejected { reason } => {
                let reason = match reason {
                    Some(reason) => format!("Rejected by peer: {}", reason),
                    None => "Rejected by peer".to_string(),
                };
                self.fail(&transfer_id, reason);
                return self.status_of(&transfer_id);
            }
            NegotiationOutcome::Expired => {
                self.fail(&transfer_id, "Transfer request expired".to_string());
                return self.status_of(&transfer_id);
            }
            NegotiationOutcome::Cancelled => {
                self.set_status(&transfer_id, TransferStatus::Cancelled);
                return self.status_of(&transfer_id);
            }
        }

        if self.set_status(&transfer_id, TransferStatus::InProgress) {
            match method {
                TransferMethod::Direct => self.run_direct_upload(&peer_id, chunker).await,
                TransferMethod::Swarm => self.run_swarm_upload(&peer_id, &transfer_id, file, metadata).await,
            }
        }
        self.status_of(&transfer_id)
    }

    async fn run_direct_upload(&self, peer_id: &PeerId, chunker: FileChunker) {
        let transfer_id = chunker.transfer_id().clone();
        let start = TransferMessage::Start(TransferStart {
            transfer_id: transfer_id.clone(),
            sender_id: self.inner.local_id.clone(),
            timestamp: utils::now_millis(),
        });
        if !self.inner.messenger.send_to_peer(peer_id, start.to_payload()) {
            self.fail(&transfer_id, "Failed to send transfer start".to_string());
            return;
        }

        let pacing = self.inner.config.orchestrator.chunk_pacing();
        for item in chunker {
            let (chunk, progress) = match item {
                Ok(next) => next,
                Err(ChunkerError::Aborted) => {
                    debug!(%transfer_id, "Chunk emission stopped");
                    return;
                }
                Err(e) => {
                    self.fail(&transfer_id, e.to_string());
                    return;
                }
            };
            let index = chunk.index;
            let message = TransferMessage::Chunk(chunk.to_message());
            if !self.inner.messenger.send_to_peer(peer_id, message.to_payload()) {
                self.fail(&transfer_id, format!("Failed to send chunk {}", index));
                return;
            }
            self.record_progress(&transfer_id, progress.bytes_emitted);

            tokio::task::yield_now().await;
            if let Some(delay) = pacing {
                tokio::time::sleep(delay).await;
            }
        }

        let complete = TransferMessage::Complete(TransferComplete {
            transfer_id: transfer_id.clone(),
            sender_id: self.inner.local_id.clone(),
            timestamp: utils::now_millis(),
        });
        if !self.inner.messenger.send_to_peer(peer_id, complete.to_payload()) {
            self.fail(&transfer_id, "Failed to send transfer complete".to_string());
            return;
        }
        info!(%transfer_id, "All chunks sent");
        self.set_status(&transfer_id, TransferStatus::Completed);
    }

    async fn run_swarm_upload(&self, peer_id: &PeerId, transfer_id: &TransferId, file: SourceFile, metadata: FileMetadata) {
        let Some(swarm) = self.inner.swarm.clone() else {
            self.fail(transfer_id, "No swarm client configured".to_string());
            return;
        };

        let magnet_uri = match swarm.seed(transfer_id, &file).await {
            Ok(magnet_uri) => magnet_uri,
            Err(e) => {
                self.fail_swarm(transfer_id, e.to_string());
                return;
            }
        };
        if self.is_terminal(transfer_id) {
            swarm.destroy(transfer_id);
            return;
        }

        let descriptor = TransferMessage::SwarmDescriptor(SwarmDescriptor {
            transfer_id: transfer_id.clone(),
            magnet_uri,
            metadata,
        });
        if !self.inner.messenger.send_to_peer(peer_id, descriptor.to_payload()) {
            self.fail_swarm(transfer_id, "Failed to send swarm descriptor".to_string());
            return;
        }
        info!(%transfer_id, "Seeding, descriptor sent");

        // Completion arrives as an acknowledgment from the peer.
        let poll = self.inner.config.orchestrator.swarm_poll_interval();
        loop {
            tokio::time::sleep(poll).await;
            if self.is_terminal(transfer_id) {
                break;
            }
            if let Some(stats) = swarm.stats(transfer_id) {
                self.record_progress(transfer_id, stats.uploaded);
            }
        }
    }

    async fn run_swarm_download(&self, peer_id: PeerId, descriptor: SwarmDescriptor) {
        let transfer_id = descriptor.transfer_id.clone();
        let Some(swarm) = self.inner.swarm.clone() else {
            self.fail(&transfer_id, "No swarm client configured".to_string());
            return;
        };

        if let Err(e) = swarm.join(&transfer_id, &descriptor.magnet_uri).await {
            self.fail_swarm(&transfer_id, e.to_string());
            return;
        }

        let poll = self.inner.config.orchestrator.swarm_poll_interval();
        loop {
            if self.is_terminal(&transfer_id) {
                return;
            }
            match swarm.stats(&transfer_id) {
                Some(stats) => {
                    self.record_progress(&transfer_id, stats.downloaded);
                    if stats.done {
                        break;
                    }
                }
                None => {
                    self.fail_swarm(&transfer_id, "Swarm session disappeared".to_string());
                    return;
                }
            }
            tokio::time::sleep(poll).await;
        }

        let data = match swarm.files(&transfer_id).map(|files| files.into_iter().next()) {
            Ok(Some(data)) => data,
            Ok(None) => {
                self.fail_swarm(&transfer_id, SwarmError::NoFiles.to_string());
                return;
            }
            Err(e) => {
                self.fail_swarm(&transfer_id, e.to_string());
                return;
            }
        };

        let metadata = descriptor.metadata;
        let verification_passed = metadata
            .checksum
            .as_ref()
            .map(|expected| crypto::sha256_hex(&data).eq_ignore_ascii_case(expected));
        if verification_passed == Some(false) {
            self.fail_swarm(&transfer_id, "Whole-file checksum verification failed".to_string());
            return;
        }
        let file = ReceivedFile {
            transfer_id: transfer_id.clone(),
            name: metadata.name,
            mime_type: metadata.mime_type,
            last_modified: metadata.last_modified,
            data,
        };

        match self.deliver(file, verification_passed) {
            Ok(true) => {
                let ack = TransferMessage::SwarmComplete(SwarmComplete {
                    transfer_id: transfer_id.clone(),
                });
                if !self.inner.messenger.send_to_peer(&peer_id, ack.to_payload()) {
                    debug!(%transfer_id, "Could not acknowledge swarm completion");
                }
            }
            Ok(false) => {}
            Err(e) => {
                self.fail_swarm(&transfer_id, e.to_string());
                return;
            }
        }
        swarm.destroy(&transfer_id);
    }

    fn on_request(&self, from: &PeerId, request: TransferRequest) {
        let transfer_id = request.transfer_id.clone();
        if self.inner.negotiator.handle_request(from, request.clone()) != RequestDisposition::Surfaced {
            return;
        }
        self.inner.listeners.emit(&TransferEvent::IncomingRequest {
            from: from.clone(),
            request,
        });
        if self.inner.config.orchestrator.auto_accept {
            if let Err(e) = self.accept_transfer(&transfer_id) {
                warn!(%transfer_id, "Auto-accept failed: {}", e);
            }
        }
    }

    fn on_start(&self, from: &PeerId, start: TransferStart) {
        if self.is_download_from(&start.transfer_id, from) {
            self.set_status(&start.transfer_id, TransferStatus::InProgress);
        }
    }

    fn on_chunk(&self, from: &PeerId, message: ChunkMessage) {
        let chunk = match FileChunk::try_from(message) {
            Ok(chunk) => chunk,
            Err(e) => {
                warn!(%from, "Dropping chunk: {}", e);
                return;
            }
        };
        let transfer_id = chunk.transfer_id.clone();
        if !self.is_download_from(&transfer_id, from) {
            debug!(%from, %transfer_id, "Chunk for unknown or finished transfer");
            return;
        }

        let (ack, evicted) = {
            let mut reassembler = self.inner.reassembler();
            (reassembler.add_chunk(chunk), reassembler.take_evicted())
        };
        self.fail_evicted(&evicted);
        let ack = match ack {
            Ok(ack) => ack,
            Err(e @ (ReassemblyError::InvalidChunkIndex { .. } | ReassemblyError::InvalidChunkLength { .. })) => {
                warn!(%from, %transfer_id, "Malformed chunk: {}", e);
                let status = TransferStatus::Failed { reason: e.to_string() };
                let _ = self.teardown(&transfer_id, status, true);
                return;
            }
            Err(e) => {
                warn!(%transfer_id, "Chunk rejected: {}", e);
                let evicted = self.inner.reassembler().progress(&transfer_id).is_none();
                if evicted {
                    self.fail(&transfer_id, e.to_string());
                }
                return;
            }
        };

        self.set_status(&transfer_id, TransferStatus::InProgress);
        self.record_progress(&transfer_id, ack.progress.bytes_received);
        if ack.status == ChunkStatus::Stored && ack.progress.is_complete() {
            self.finish_direct_download(&transfer_id);
        }
    }

    fn finish_direct_download(&self, transfer_id: &TransferId) {
        let result = self.inner.reassembler().reassemble(transfer_id);
        let file = match result {
            Ok(file) => file,
            Err(e @ ReassemblyError::MissingChunks { .. }) => {
                warn!(%transfer_id, "Reassembly failed: {}", e);
                return;
            }
            Err(e) => {
                self.inner.reassembler().cancel_reassembly(transfer_id);
                self.fail(transfer_id, e.to_string());
                return;
            }
        };
        let verification_passed = file.verification_passed;
        if verification_passed == Some(false) {
            self.fail(transfer_id, "Whole-file checksum verification failed".to_string());
            return;
        }
        if let Err(e) = self.deliver(file.into_received_file(), verification_passed) {
            self.fail(transfer_id, e.to_string());
        }
    }

    /// Hand a finished file to the sink; `Ok(false)` if the transfer ended meanwhile
    fn deliver(&self, file: ReceivedFile, verification_passed: Option<bool>) -> Result<bool, SinkError> {
        let transfer_id = file.transfer_id.clone();
        self.inner.sink.save(&file)?;
        self.record_progress(&transfer_id, file.size());
        if !self.set_status(&transfer_id, TransferStatus::Completed) {
            return Ok(false);
        }
        info!(%transfer_id, file = %file.name, bytes = file.size(), "File received");
        self.inner.listeners.emit(&TransferEvent::FileReceived {
            transfer_id,
            file_name: file.name,
            size: file.data.len() as u64,
            verification_passed,
        });
        Ok(true)
    }

    fn on_complete(&self, from: &PeerId, complete: TransferComplete) {
        if !self.is_download_from(&complete.transfer_id, from) || self.is_terminal(&complete.transfer_id) {
            return;
        }
        let progress = self.inner.reassembler().progress(&complete.transfer_id);
        match progress {
            // Empty files have no chunks to trigger reassembly.
            Some(progress) if progress.is_complete() => self.finish_direct_download(&complete.transfer_id),
            Some(progress) => warn!(
                transfer_id = %complete.transfer_id,
                missing = progress.total_chunks - progress.received_chunks,
                "Sender finished but chunks are missing"
            ),
            None => {}
        }
    }

    fn on_cancel(&self, from: &PeerId, cancel: TransferCancel) {
        self.inner.negotiator.handle_cancel(from, &cancel);
        let ours = self
            .inner
            .lock()
            .transfers
            .get(&cancel.transfer_id)
            .is_some_and(|t| t.state.peer_id == *from);
        if ours {
            info!(%from, transfer_id = %cancel.transfer_id, reason = ?cancel.reason, "Peer cancelled transfer");
            let _ = self.teardown(&cancel.transfer_id, TransferStatus::Cancelled, false);
        }
    }

    fn on_swarm_descriptor(&self, from: &PeerId, descriptor: SwarmDescriptor) {
        let transfer_id = descriptor.transfer_id.clone();
        let expected = {
            let state = self.inner.lock();
            state.transfers.get(&transfer_id).is_some_and(|t| {
                t.state.peer_id == *from
                    && t.state.direction == TransferDirection::Download
                    && t.state.method == TransferMethod::Swarm
                    && t.state.status == TransferStatus::Pending
            })
        };
        if !expected {
            debug!(%from, %transfer_id, "Unexpected swarm descriptor");
            return;
        }
        self.set_status(&transfer_id, TransferStatus::InProgress);

        let orchestrator = self.clone();
        let peer_id = from.clone();
        let task = tokio::spawn(async move { orchestrator.run_swarm_download(peer_id, descriptor).await });
        if let Some(transfer) = self.inner.lock().transfers.get_mut(&transfer_id) {
            transfer.task = Some(task.abort_handle());
        }
    }

    fn on_swarm_complete(&self, from: &PeerId, complete: SwarmComplete) {
        let transfer_id = complete.transfer_id;
        let total = {
            let state = self.inner.lock();
            match state.transfers.get(&transfer_id) {
                Some(t) if t.state.peer_id == *from && t.state.direction == TransferDirection::Upload => {
                    Some(t.state.total_bytes)
                }
                _ => None,
            }
        };
        let Some(total) = total else {
            return;
        };
        self.record_progress(&transfer_id, total);
        self.set_status(&transfer_id, TransferStatus::Completed);
        if let Some(swarm) = &self.inner.swarm {
            swarm.destroy(&transfer_id);
        }
        info!(%transfer_id, "Peer finished swarm download");
    }

    /// Move a live transfer to a terminal status and release everything it holds
    fn teardown(&self, transfer_id: &TransferId, status: TransferStatus, notify: bool) -> Result<(), TransferError> {
        let (peer_id, cancel, task, method) = {
            let mut state = self.inner.lock();
            let transfer = state
                .transfers
                .get_mut(transfer_id)
                .ok_or_else(|| TransferError::UnknownTransfer(transfer_id.clone()))?;
            if transfer.state.status.is_terminal() {
                return Err(TransferError::AlreadyFinished(transfer_id.clone()));
            }
            transfer.state.status = status.clone();
            (
                transfer.state.peer_id.clone(),
                transfer.cancel.clone(),
                transfer.task.take(),
                transfer.state.method,
            )
        };

        if let Some(cancel) = cancel {
            cancel.cancel();
        }
        if method == TransferMethod::Swarm {
            if let Some(task) = task {
                task.abort();
            }
            if let Some(swarm) = &self.inner.swarm {
                swarm.destroy(transfer_id);
            }
        }
        self.inner.reassembler().cancel_reassembly(transfer_id);

        let reason = match &status {
            TransferStatus::Failed { reason } => Some(reason.clone()),
            _ => Some("cancelled".to_string()),
        };
        let negotiating = self.inner.negotiator.cancel(transfer_id, reason.clone());
        if notify && !negotiating {
            let message = TransferMessage::Cancel(TransferCancel {
                transfer_id: transfer_id.clone(),
                reason,
            });
            if !self.inner.messenger.send_to_peer(&peer_id, message.to_payload()) {
                debug!(%peer_id, %transfer_id, "Could not notify peer of cancellation");
            }
        }

        info!(%transfer_id, ?status, "Transfer stopped");
        self.emit_status(transfer_id, status);
        self.schedule_cleanup(transfer_id);
        Ok(())
    }

    /// Apply a non-terminal-to-any transition; terminal statuses never change again
    fn set_status(&self, transfer_id: &TransferId, status: TransferStatus) -> bool {
        {
            let mut state = self.inner.lock();
            let Some(transfer) = state.transfers.get_mut(transfer_id) else {
                return false;
            };
            if transfer.state.status.is_terminal() {
                return false;
            }
            if transfer.state.status == status {
                return true;
            }
            transfer.state.status = status.clone();
        }
        if status.is_terminal() {
            self.schedule_cleanup(transfer_id);
        }
        self.emit_status(transfer_id, status);
        true
    }

    fn fail(&self, transfer_id: &TransferId, reason: String) {
        warn!(%transfer_id, "Transfer failed: {}", reason);
        self.set_status(transfer_id, TransferStatus::Failed { reason });
    }

    /// Fail transfers whose buffers the reassembler dropped as stale
    fn fail_evicted(&self, evicted: &[TransferId]) {
        for transfer_id in evicted {
            self.fail(transfer_id, STALLED.to_string());
        }
    }

    /// Fail a swarm transfer from inside its own task and tell the peer
    fn fail_swarm(&self, transfer_id: &TransferId, reason: String) {
        warn!(%transfer_id, "Swarm transfer failed: {}", reason);
        // Detach our own task so the teardown does not abort it.
        if let Some(transfer) = self.inner.lock().transfers.get_mut(transfer_id) {
            transfer.task = None;
        }
        if self.teardown(transfer_id, TransferStatus::Failed { reason }, true).is_err() {
            if let Some(swarm) = &self.inner.swarm {
                swarm.destroy(transfer_id);
            }
        }
    }

    fn record_progress(&self, transfer_id: &TransferId, bytes: u64) {
        let snapshot = {
            let mut state = self.inner.lock();
            match state.transfers.get_mut(transfer_id) {
                Some(transfer) if !transfer.state.status.is_terminal() => {
                    transfer.state.update(bytes);
                    transfer.state.clone()
                }
                _ => return,
            }
        };
        self.inner.listeners.emit(&TransferEvent::Progress(snapshot));
    }

    fn emit_status(&self, transfer_id: &TransferId, status: TransferStatus) {
        self.inner.listeners.emit(&TransferEvent::StatusChanged {
            transfer_id: transfer_id.clone(),
            status,
        });
    }

    /// Drop a terminal transfer after the grace period
    fn schedule_cleanup(&self, transfer_id: &TransferId) {
        let grace = self.inner.config.orchestrator.terminal_grace();
        let weak: Weak<OrchestratorInner> = Arc::downgrade(&self.inner);
        let id = transfer_id.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            if let Some(inner) = weak.upgrade() {
                let mut state = inner.lock();
                if state.transfers.get(&id).is_some_and(|t| t.state.status.is_terminal()) {
                    state.transfers.remove(&id);
                    debug!(transfer_id = %id, "Removed finished transfer");
                }
            }
        });
        let mut state = self.inner.lock();
        match state.transfers.get_mut(transfer_id) {
            Some(transfer) => {
                if let Some(previous) = transfer.cleanup.replace(handle) {
                    previous.abort();
                }
            }
            None => handle.abort(),
        }
    }

    fn status_of(&self, transfer_id: &TransferId) -> TransferStatus {
        self.inner
            .lock()
            .transfers
            .get(transfer_id)
            .map(|t| t.state.status.clone())
            .unwrap_or(TransferStatus::Cancelled)
    }

    fn is_terminal(&self, transfer_id: &TransferId) -> bool {
        self.inner
            .lock()
            .transfers
            .get(transfer_id)
            .is_none_or(|t| t.state.status.is_terminal())
    }

    fn is_download_from(&self, transfer_id: &TransferId, from: &PeerId) -> bool {
        self.inner.lock().transfers.get(transfer_id).is_some_and(|t| {
            t.state.peer_id == *from && t.state.direction == TransferDirection::Download && !t.state.status.is_terminal()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MIB: u64 = 1024 * 1024;

    #[test]
    fn test_select_method_by_threshold() {
        assert_eq!(select_method(50 * MIB, 20 * MIB), TransferMethod::Swarm);
        assert_eq!(select_method(5 * MIB, 20 * MIB), TransferMethod::Direct);
        assert_eq!(select_method(20 * MIB, 20 * MIB), TransferMethod::Direct);
        assert_eq!(select_method(20 * MIB + 1, 20 * MIB), TransferMethod::Swarm);
    }
}
