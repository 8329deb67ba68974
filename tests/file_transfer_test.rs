use peerclip::core::error::ReassemblyError;
use peerclip::core::{SourceFile, TransferId};
use peerclip::crypto;
use peerclip::file_transfer::reassembler::{ChunkStatus, ReassemblyMetadata};
use peerclip::file_transfer::types::TransferMessage;
use peerclip::file_transfer::{FileChunk, FileChunker, FileReassembler};
use peerclip::infrastructure::config::{ChunkerConfig, ReassemblerConfig};

const KIB: usize = 1024;

fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

fn chunker_config(chunk_size: usize) -> ChunkerConfig {
    ChunkerConfig {
        chunk_size,
        ..ChunkerConfig::default()
    }
}

fn chunk_all(bytes: &[u8], chunk_size: usize) -> (TransferId, ReassemblyMetadata, Vec<FileChunk>) {
    let transfer_id = TransferId::new();
    let file = SourceFile::new("data.bin", "application/octet-stream", bytes.to_vec());
    let chunker = FileChunker::new(file, transfer_id.clone(), &chunker_config(chunk_size)).unwrap();
    let metadata = ReassemblyMetadata::from_file_metadata(&transfer_id, &chunker.metadata());
    let chunks = chunker.map(|item| item.unwrap().0).collect();
    (transfer_id, metadata, chunks)
}

#[test]
fn test_chunk_lengths_for_300k_file() {
    let bytes = pattern(300 * KIB);
    let (_, metadata, chunks) = chunk_all(&bytes, 128 * KIB);
    let lengths: Vec<usize> = chunks.iter().map(|chunk| chunk.data.len()).collect();
    assert_eq!(lengths, vec![131_072, 131_072, 45_056]);
    assert_eq!(metadata.total_chunks, 3);
    assert!(chunks.iter().all(|chunk| chunk.total_chunks == 3));
    assert_eq!(chunks.iter().map(|c| c.index).collect::<Vec<_>>(), vec![0, 1, 2]);
}

#[test]
fn test_progress_is_monotonic_and_ends_at_total() {
    let transfer_id = TransferId::new();
    let file = SourceFile::new("data.bin", "application/octet-stream", pattern(10 * KIB));
    let chunker = FileChunker::new(file, transfer_id, &chunker_config(3 * KIB)).unwrap();
    let progress: Vec<(u32, u64)> = chunker
        .map(|item| item.unwrap().1)
        .map(|p| (p.chunks_emitted, p.bytes_emitted))
        .collect();
    assert_eq!(progress, vec![(1, 3072), (2, 6144), (3, 9216), (4, 10240)]);
}

#[test]
fn test_reverse_order_reassembly_is_byte_identical() {
    let bytes = pattern(300 * KIB);
    let (transfer_id, metadata, chunks) = chunk_all(&bytes, 128 * KIB);
    let mut reassembler = FileReassembler::new(ReassemblerConfig::default());
    reassembler.initialize(metadata).unwrap();

    for chunk in chunks.into_iter().rev() {
        let ack = reassembler.add_chunk(chunk).unwrap();
        assert_eq!(ack.status, ChunkStatus::Stored);
    }
    let file = reassembler.reassemble(&transfer_id).unwrap();
    assert_eq!(file.data, bytes);
    assert_eq!(file.verification_passed, Some(true));
    assert_eq!(reassembler.memory_usage(), 0);
}

#[test]
fn test_chunks_survive_the_wire_format() {
    let bytes = pattern(5 * KIB);
    let (transfer_id, metadata, chunks) = chunk_all(&bytes, 2 * KIB);
    let mut reassembler = FileReassembler::new(ReassemblerConfig::default());
    reassembler.initialize(metadata).unwrap();

    for chunk in chunks {
        let encoded = TransferMessage::Chunk(chunk.to_message()).to_payload().into_bytes();
        let TransferMessage::Chunk(message) = TransferMessage::decode(&encoded).unwrap() else {
            panic!("expected a chunk message");
        };
        reassembler.add_chunk(FileChunk::try_from(message).unwrap()).unwrap();
    }
    assert_eq!(reassembler.reassemble(&transfer_id).unwrap().data, bytes);
}

#[test]
fn test_duplicate_delivery_is_idempotent() {
    let bytes = pattern(4 * KIB);
    let (transfer_id, metadata, chunks) = chunk_all(&bytes, KIB);
    let mut reassembler = FileReassembler::new(ReassemblerConfig::default());
    reassembler.initialize(metadata).unwrap();

    for chunk in chunks.iter().chain(chunks.iter()) {
        reassembler.add_chunk(chunk.clone()).unwrap();
    }
    let progress = reassembler.progress(&transfer_id).unwrap();
    assert_eq!(progress.received_chunks, 4);
    assert_eq!(progress.bytes_received, 4096);
    assert_eq!(reassembler.memory_usage(), 4096);
    assert_eq!(reassembler.reassemble(&transfer_id).unwrap().data, bytes);
}

#[test]
fn test_missing_chunk_is_named() {
    let bytes = pattern(4 * KIB);
    let (transfer_id, metadata, chunks) = chunk_all(&bytes, KIB);
    let mut reassembler = FileReassembler::new(ReassemblerConfig::default());
    reassembler.initialize(metadata).unwrap();
    for chunk in chunks.into_iter().filter(|chunk| chunk.index != 2) {
        reassembler.add_chunk(chunk).unwrap();
    }

    let err = reassembler.reassemble(&transfer_id).unwrap_err();
    assert!(matches!(&err, ReassemblyError::MissingChunks { missing, .. } if missing == &vec![2]));
    assert!(err.to_string().ends_with("is missing chunks 2"));
    assert!(reassembler.progress(&transfer_id).is_some());
}

#[test]
fn test_corrupted_chunk_is_dropped() {
    let bytes = pattern(2 * KIB);
    let (transfer_id, metadata, mut chunks) = chunk_all(&bytes, KIB);
    let mut reassembler = FileReassembler::new(ReassemblerConfig::default());
    reassembler.initialize(metadata).unwrap();

    chunks[1].data[0] ^= 0xff;
    reassembler.add_chunk(chunks[0].clone()).unwrap();
    let ack = reassembler.add_chunk(chunks[1].clone()).unwrap();
    assert_eq!(ack.status, ChunkStatus::ChecksumMismatch);
    assert_eq!(reassembler.missing_chunks(&transfer_id), Some(vec![1]));
    assert_eq!(
        reassembler.chunk_checksum(&transfer_id, 0),
        Some(crypto::chunk_checksum(&chunks[0].data).as_str())
    );
}

#[test]
fn test_empty_file_has_no_chunks() {
    let (transfer_id, metadata, chunks) = chunk_all(&[], KIB);
    assert!(chunks.is_empty());
    let mut reassembler = FileReassembler::new(ReassemblerConfig::default());
    reassembler.initialize(metadata).unwrap();
    assert!(reassembler.is_complete(&transfer_id));
    assert!(reassembler.reassemble(&transfer_id).unwrap().data.is_empty());
}
