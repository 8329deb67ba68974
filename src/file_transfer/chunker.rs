//! Sender-side file chunking.
//!
//! [`FileChunker`] is a single-use iterator over `(chunk, progress)` pairs in
//! byte-offset order. A [`ChunkCancelHandle`] can stop it from another task;
//! the flag is checked before every chunk and the iterator then yields one
//! `Err(ChunkerError::Aborted)` and ends.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::debug;

use super::types::FileChunk;
use crate::core::domain::{FileMetadata, SourceFile, TransferId};
use crate::core::error::ChunkerError;
use crate::crypto;
use crate::infrastructure::config::ChunkerConfig;
use crate::utils;

/// Monotonic progress reported after each chunk
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkProgress {
    pub chunks_emitted: u32,
    pub total_chunks: u32,
    pub bytes_emitted: u64,
    pub total_bytes: u64,
}

impl ChunkProgress {
    pub fn percentage(&self) -> f32 {
        if self.total_bytes == 0 {
            return 100.0;
        }
        (self.bytes_emitted as f32 / self.total_bytes as f32) * 100.0
    }
}

/// Shared cancellation flag for a running chunker
#[derive(Debug, Clone, Default)]
pub struct ChunkCancelHandle(Arc<AtomicBool>);

impl ChunkCancelHandle {
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

pub struct FileChunker {
    file: SourceFile,
    transfer_id: TransferId,
    chunk_size: usize,
    total_chunks: u32,
    checksums: bool,
    next_index: u32,
    bytes_emitted: u64,
    cancel: ChunkCancelHandle,
    finished: bool,
}

impl FileChunker {
    /// Fails immediately when the configured chunk size is zero or above the maximum
    pub fn new(file: SourceFile, transfer_id: TransferId, config: &ChunkerConfig) -> Result<Self, ChunkerError> {
        if config.chunk_size == 0 {
            return Err(ChunkerError::InvalidChunkSize);
        }
        if config.chunk_size > config.max_chunk_size {
            return Err(ChunkerError::ChunkSizeTooLarge {
                size: config.chunk_size,
                max: config.max_chunk_size,
            });
        }
        let total_chunks = u32::try_from(utils::calculate_chunks(file.size(), config.chunk_size))
            .map_err(|_| ChunkerError::TooManyChunks)?;
        u32::try_from(config.chunk_size).map_err(|_| ChunkerError::TooManyChunks)?;

        Ok(Self {
            file,
            transfer_id,
            chunk_size: config.chunk_size,
            total_chunks,
            checksums: config.enable_checksum_validation,
            next_index: 0,
            bytes_emitted: 0,
            cancel: ChunkCancelHandle::default(),
            finished: false,
        })
    }

    pub fn cancel_handle(&self) -> ChunkCancelHandle {
        self.cancel.clone()
    }

    pub fn total_chunks(&self) -> u32 {
        self.total_chunks
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    pub fn transfer_id(&self) -> &TransferId {
        &self.transfer_id
    }

    /// Request metadata, with a whole-file SHA-256 when checksums are enabled
    pub fn metadata(&self) -> FileMetadata {
        FileMetadata {
            id: self.transfer_id.to_string(),
            name: self.file.name.clone(),
            size: self.file.size(),
            mime_type: self.file.mime_type.clone(),
            last_modified: self.file.last_modified,
            chunk_count: self.total_chunks,
            chunk_size: self.chunk_size as u32,
            checksum: self.checksums.then(|| crypto::sha256_hex(&self.file.bytes)),
        }
    }

    fn progress(&self) -> ChunkProgress {
        ChunkProgress {
            chunks_emitted: self.next_index,
            total_chunks: self.total_chunks,
            bytes_emitted: self.bytes_emitted,
            total_bytes: self.file.size(),
        }
    }
}

impl Iterator for FileChunker {
    type Item = Result<(FileChunk, ChunkProgress), ChunkerError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.finished {
            return None;
        }
        if self.cancel.is_cancelled() {
            self.finished = true;
            debug!(transfer_id = %self.transfer_id, at = self.next_index, "Chunking aborted");
            return Some(Err(ChunkerError::Aborted));
        }
        if self.next_index >= self.total_chunks {
            self.finished = true;
            return None;
        }

        let start = self.next_index as usize * self.chunk_size;
        let end = (start + self.chunk_size).min(self.file.bytes.len());
        let data = self.file.bytes[start..end].to_vec();
        let checksum = self.checksums.then(|| crypto::chunk_checksum(&data));

        let chunk = FileChunk {
            transfer_id: self.transfer_id.clone(),
            index: self.next_index,
            total_chunks: self.total_chunks,
            chunk_size: self.chunk_size as u32,
            file_name: self.file.name.clone(),
            file_size: self.file.size(),
            file_type: self.file.mime_type.clone(),
            last_modified: Some(self.file.last_modified),
            data,
            checksum,
        };

        self.next_index += 1;
        self.bytes_emitted += chunk.data.len() as u64;
        Some(Ok((chunk, self.progress())))
    }

    /// A cancel from another task can cut the run short to a single `Aborted`
    fn size_hint(&self) -> (usize, Option<usize>) {
        if self.finished {
            return (0, Some(0));
        }
        if self.cancel.is_cancelled() {
            return (1, Some(1));
        }
        let remaining = (self.total_chunks - self.next_index) as usize;
        (remaining.min(1), Some(remaining + 1))
    }
}

impl std::iter::FusedIterator for FileChunker {}
