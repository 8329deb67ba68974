//! Receiver-side chunk buffering and file reconstruction.
//!
//! Chunks are stored by index, so arrival order does not matter and
//! re-deliveries are no-ops. Buffers that stop receiving chunks are evicted
//! by [`FileReassembler::sweep_stale`], either from the background sweeper or
//! proactively when the memory ceiling is crossed. Proactive evictions are
//! queued for [`FileReassembler::take_evicted`].

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::types::FileChunk;
use crate::core::domain::{FileMetadata, ReceivedFile, TransferId};
use crate::core::error::ReassemblyError;
use crate::crypto;
use crate::infrastructure::config::ReassemblerConfig;

/// Cap on the indices listed by a missing-chunks report
pub const MAX_REPORTED_MISSING: usize = 1024;

/// What the receiver knows about a file before its chunks arrive
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReassemblyMetadata {
    pub transfer_id: TransferId,
    pub file_name: String,
    pub file_size: u64,
    pub file_type: String,
    pub last_modified: u64,
    pub total_chunks: u32,
    pub chunk_size: u32,
    /// Declared whole-file SHA-256, verified after concatenation
    pub checksum: Option<String>,
}

impl ReassemblyMetadata {
    pub fn from_file_metadata(transfer_id: &TransferId, metadata: &FileMetadata) -> Self {
        Self {
            transfer_id: transfer_id.clone(),
            file_name: metadata.name.clone(),
            file_size: metadata.size,
            file_type: metadata.mime_type.clone(),
            last_modified: metadata.last_modified,
            total_chunks: metadata.chunk_count,
            chunk_size: metadata.chunk_size,
            checksum: metadata.checksum.clone(),
        }
    }

    /// Check a peer's announcement before any buffer is allocated for it
    pub fn validate(&self, config: &ReassemblerConfig) -> Result<(), ReassemblyError> {
        if self.file_size > config.max_file_size {
            return Err(ReassemblyError::FileTooLarge {
                size: self.file_size,
                max: config.max_file_size,
            });
        }
        if u64::from(self.chunk_size) > config.max_chunk_size {
            return Err(ReassemblyError::InvalidMetadata(format!(
                "chunk size {} exceeds maximum of {} bytes",
                self.chunk_size, config.max_chunk_size
            )));
        }
        let expected = match (self.file_size, self.chunk_size) {
            (0, _) => 0,
            (_, 0) => {
                return Err(ReassemblyError::InvalidMetadata(
                    "chunk size must be greater than 0".to_string(),
                ));
            }
            (size, chunk_size) => size.div_ceil(u64::from(chunk_size)),
        };
        if u64::from(self.total_chunks) != expected {
            return Err(ReassemblyError::InvalidMetadata(format!(
                "{} chunks declared but {} bytes in {}-byte chunks make {}",
                self.total_chunks, self.file_size, self.chunk_size, expected
            )));
        }
        Ok(())
    }

    /// Exact byte length of chunk `index`; only the last chunk may be short
    pub fn expected_chunk_len(&self, index: u32) -> u64 {
        let chunk_size = u64::from(self.chunk_size);
        let offset = u64::from(index) * chunk_size;
        self.file_size.saturating_sub(offset).min(chunk_size)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkStatus {
    Stored,
    /// Index already held; nothing changed
    Duplicate,
    /// Checksum did not match; the chunk was dropped
    ChecksumMismatch,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReassemblyProgress {
    pub transfer_id: TransferId,
    pub received_chunks: u32,
    pub total_chunks: u32,
    pub bytes_received: u64,
    pub total_bytes: u64,
}

impl ReassemblyProgress {
    pub fn percentage(&self) -> f32 {
        if self.total_chunks == 0 {
            return 100.0;
        }
        (self.received_chunks as f32 / self.total_chunks as f32) * 100.0
    }

    pub fn is_complete(&self) -> bool {
        self.received_chunks == self.total_chunks
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkAck {
    pub status: ChunkStatus,
    pub progress: ReassemblyProgress,
}

/// Output of a successful reassembly
#[derive(Debug, Clone)]
pub struct ReassembledFile {
    pub transfer_id: TransferId,
    pub name: String,
    pub mime_type: String,
    pub last_modified: u64,
    pub data: Vec<u8>,
    /// `None` when no whole-file checksum was declared
    pub verification_passed: Option<bool>,
    pub elapsed: Duration,
}

impl ReassembledFile {
    pub fn into_received_file(self) -> ReceivedFile {
        ReceivedFile {
            transfer_id: self.transfer_id,
            name: self.name,
            mime_type: self.mime_type,
            last_modified: self.last_modified,
            data: self.data,
        }
    }
}

/// Bookkeeping kept for a transfer after its buffer is released
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletedReassembly {
    pub transfer_id: TransferId,
    pub file_name: String,
    pub size: u64,
    pub verification_passed: Option<bool>,
    pub completed_at: Instant,
}

struct ChunkBuffer {
    metadata: ReassemblyMetadata,
    chunks: BTreeMap<u32, Vec<u8>>,
    checksums: HashMap<u32, String>,
    bytes_received: u64,
    started_at: Instant,
    last_chunk_at: Instant,
}

impl ChunkBuffer {
    fn new(metadata: ReassemblyMetadata) -> Self {
        let now = Instant::now();
        Self {
            metadata,
            chunks: BTreeMap::new(),
            checksums: HashMap::new(),
            bytes_received: 0,
            started_at: now,
            last_chunk_at: now,
        }
    }

    fn progress(&self) -> ReassemblyProgress {
        ReassemblyProgress {
            transfer_id: self.metadata.transfer_id.clone(),
            received_chunks: self.chunks.len() as u32,
            total_chunks: self.metadata.total_chunks,
            bytes_received: self.bytes_received,
            total_bytes: self.metadata.file_size,
        }
    }

    /// Lowest missing indices, at most `MAX_REPORTED_MISSING` of them
    fn missing(&self) -> Vec<u32> {
        (0..self.metadata.total_chunks)
            .filter(|index| !self.chunks.contains_key(index))
            .take(MAX_REPORTED_MISSING)
            .collect()
    }

    fn missing_count(&self) -> u32 {
        self.metadata.total_chunks - self.chunks.len() as u32
    }
}

pub struct FileReassembler {
    config: ReassemblerConfig,
    active: HashMap<TransferId, ChunkBuffer>,
    completed: HashMap<TransferId, CompletedReassembly>,
    evicted: Vec<TransferId>,
    memory_usage: u64,
}

impl FileReassembler {
    pub fn new(config: ReassemblerConfig) -> Self {
        Self {
            config,
            active: HashMap::new(),
            completed: HashMap::new(),
            evicted: Vec::new(),
            memory_usage: 0,
        }
    }

    pub fn config(&self) -> &ReassemblerConfig {
        &self.config
    }

    /// Register a transfer; refused when its metadata is invalid, it is a
    /// duplicate, or memory is exhausted
    pub fn initialize(&mut self, metadata: ReassemblyMetadata) -> Result<(), ReassemblyError> {
        metadata.validate(&self.config)?;
        if self.active.contains_key(&metadata.transfer_id) {
            return Err(ReassemblyError::AlreadyExists(metadata.transfer_id));
        }
        if self.memory_usage >= self.config.max_memory_usage {
            self.sweep_for_memory(Instant::now());
            if self.memory_usage >= self.config.max_memory_usage {
                return Err(ReassemblyError::MemoryLimitExceeded {
                    used: self.memory_usage,
                    max: self.config.max_memory_usage,
                });
            }
        }

        info!(
            transfer_id = %metadata.transfer_id,
            file = %metadata.file_name,
            chunks = metadata.total_chunks,
            "Reassembly initialized"
        );
        self.completed.remove(&metadata.transfer_id);
        self.active
            .insert(metadata.transfer_id.clone(), ChunkBuffer::new(metadata));
        Ok(())
    }

    /// Store one chunk; duplicates and checksum failures still report progress
    pub fn add_chunk(&mut self, chunk: FileChunk) -> Result<ChunkAck, ReassemblyError> {
        let validate = self.config.enable_checksum_validation;
        let buffer = self
            .active
            .get_mut(&chunk.transfer_id)
            .ok_or_else(|| ReassemblyError::UnknownTransfer(chunk.transfer_id.clone()))?;

        if chunk.index >= buffer.metadata.total_chunks {
            return Err(ReassemblyError::InvalidChunkIndex {
                index: chunk.index,
                total: buffer.metadata.total_chunks,
            });
        }

        let expected = buffer.metadata.expected_chunk_len(chunk.index);
        if chunk.data.len() as u64 != expected {
            return Err(ReassemblyError::InvalidChunkLength {
                index: chunk.index,
                expected,
                actual: chunk.data.len() as u64,
            });
        }

        if buffer.chunks.contains_key(&chunk.index) {
            debug!(transfer_id = %chunk.transfer_id, index = chunk.index, "Duplicate chunk ignored");
            return Ok(ChunkAck {
                status: ChunkStatus::Duplicate,
                progress: buffer.progress(),
            });
        }

        if validate {
            if let Some(expected) = &chunk.checksum {
                if !crypto::verify_chunk(&chunk.data, expected) {
                    warn!(transfer_id = %chunk.transfer_id, index = chunk.index, "Chunk checksum mismatch, dropping");
                    return Ok(ChunkAck {
                        status: ChunkStatus::ChecksumMismatch,
                        progress: buffer.progress(),
                    });
                }
            }
        }

        let size = chunk.data.len() as u64;
        buffer.bytes_received += size;
        buffer.last_chunk_at = Instant::now();
        if let Some(checksum) = chunk.checksum {
            buffer.checksums.insert(chunk.index, checksum);
        }
        buffer.chunks.insert(chunk.index, chunk.data);
        let progress = buffer.progress();
        self.memory_usage += size;

        if self.memory_usage > self.config.max_memory_usage {
            warn!(
                used = self.memory_usage,
                max = self.config.max_memory_usage,
                "Reassembly memory ceiling exceeded, sweeping stale transfers"
            );
            self.sweep_for_memory(Instant::now());
        }

        Ok(ChunkAck {
            status: ChunkStatus::Stored,
            progress,
        })
    }

    pub fn is_complete(&self, transfer_id: &TransferId) -> bool {
        self.active
            .get(transfer_id)
            .is_some_and(|buffer| buffer.chunks.len() as u32 == buffer.metadata.total_chunks)
    }

    pub fn progress(&self, transfer_id: &TransferId) -> Option<ReassemblyProgress> {
        self.active.get(transfer_id).map(ChunkBuffer::progress)
    }

    /// Checksum a stored chunk was verified against
    pub fn chunk_checksum(&self, transfer_id: &TransferId, index: u32) -> Option<&str> {
        self.active
            .get(transfer_id)
            .and_then(|buffer| buffer.checksums.get(&index))
            .map(String::as_str)
    }

    /// Lowest missing indices, capped at [`MAX_REPORTED_MISSING`]
    pub fn missing_chunks(&self, transfer_id: &TransferId) -> Option<Vec<u32>> {
        self.active.get(transfer_id).map(ChunkBuffer::missing)
    }

    /// Concatenate in index order; fails naming the missing indices if incomplete
    pub fn reassemble(&mut self, transfer_id: &TransferId) -> Result<ReassembledFile, ReassemblyError> {
        let buffer = self
            .active
            .get(transfer_id)
            .ok_or_else(|| ReassemblyError::UnknownTransfer(transfer_id.clone()))?;

        let count = buffer.missing_count();
        if count > 0 {
            return Err(ReassemblyError::MissingChunks {
                transfer_id: transfer_id.clone(),
                missing: buffer.missing(),
                count,
            });
        }
        if buffer.bytes_received != buffer.metadata.file_size {
            return Err(ReassemblyError::SizeMismatch {
                expected: buffer.metadata.file_size,
                actual: buffer.bytes_received,
            });
        }

        let buffer = self
            .active
            .remove(transfer_id)
            .ok_or_else(|| ReassemblyError::UnknownTransfer(transfer_id.clone()))?;
        self.memory_usage = self.memory_usage.saturating_sub(buffer.bytes_received);

        let mut data = Vec::with_capacity(buffer.bytes_received as usize);
        for chunk in buffer.chunks.values() {
            data.extend_from_slice(chunk);
        }

        let verification_passed = buffer
            .metadata
            .checksum
            .as_ref()
            .map(|expected| crypto::sha256_hex(&data).eq_ignore_ascii_case(expected));
        if verification_passed == Some(false) {
            warn!(%transfer_id, "Whole-file checksum verification failed");
        }

        let metadata = buffer.metadata;
        self.completed.insert(
            transfer_id.clone(),
            CompletedReassembly {
                transfer_id: transfer_id.clone(),
                file_name: metadata.file_name.clone(),
                size: data.len() as u64,
                verification_passed,
                completed_at: Instant::now(),
            },
        );
        info!(%transfer_id, bytes = data.len(), "Reassembly complete");

        Ok(ReassembledFile {
            transfer_id: transfer_id.clone(),
            name: metadata.file_name,
            mime_type: metadata.file_type,
            last_modified: metadata.last_modified,
            data,
            verification_passed,
            elapsed: buffer.started_at.elapsed(),
        })
    }

    /// Release a transfer's buffer; returns whether one existed
    pub fn cancel_reassembly(&mut self, transfer_id: &TransferId) -> bool {
        match self.active.remove(transfer_id) {
            Some(buffer) => {
                self.memory_usage = self.memory_usage.saturating_sub(buffer.bytes_received);
                info!(%transfer_id, "Reassembly cancelled");
                true
            }
            None => false,
        }
    }

    /// Evict active buffers idle for longer than the staleness window
    pub fn sweep_stale(&mut self, now: Instant) -> Vec<TransferId> {
        let window = self.config.stale_timeout();
        let stale: Vec<TransferId> = self
            .active
            .iter()
            .filter(|(_, buffer)| now.saturating_duration_since(buffer.last_chunk_at) >= window)
            .map(|(id, _)| id.clone())
            .collect();

        for transfer_id in &stale {
            if let Some(buffer) = self.active.remove(transfer_id) {
                self.memory_usage = self.memory_usage.saturating_sub(buffer.bytes_received);
                warn!(%transfer_id, received = buffer.chunks.len(), "Evicted stale reassembly");
            }
        }
        self.completed
            .retain(|_, done| now.saturating_duration_since(done.completed_at) < window);
        stale
    }

    fn sweep_for_memory(&mut self, now: Instant) {
        let evicted = self.sweep_stale(now);
        self.evicted.extend(evicted);
    }

    /// Transfers evicted by memory-pressure sweeps since the last call
    pub fn take_evicted(&mut self) -> Vec<TransferId> {
        std::mem::take(&mut self.evicted)
    }

    pub fn memory_usage(&self) -> u64 {
        self.memory_usage
    }

    pub fn active_count(&self) -> usize {
        self.active.len()
    }

    pub fn completed(&self, transfer_id: &TransferId) -> Option<&CompletedReassembly> {
        self.completed.get(transfer_id)
    }
}

/// Periodically sweep stale buffers until the reassembler is dropped.
///
/// `on_evict` runs outside the lock with the ids evicted by each sweep.
pub fn spawn_sweeper<F>(reassembler: &Arc<Mutex<FileReassembler>>, on_evict: F) -> JoinHandle<()>
where
    F: Fn(&[TransferId]) + Send + 'static,
{
    let interval = reassembler
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .config
        .cleanup_interval();
    let weak = Arc::downgrade(reassembler);
    tokio::spawn(async move {
        if interval.is_zero() {
            return;
        }
        loop {
            tokio::time::sleep(interval).await;
            let Some(reassembler) = weak.upgrade() else { break };
            let evicted = reassembler
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .sweep_stale(Instant::now());
            drop(reassembler);
            if !evicted.is_empty() {
                debug!(count = evicted.len(), "Sweeper evicted stale reassemblies");
                on_evict(&evicted);
            }
        }
    })
}
