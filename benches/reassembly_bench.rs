use criterion::{Criterion, black_box, criterion_group, criterion_main};
use peerclip::core::{SourceFile, TransferId};
use peerclip::file_transfer::{FileChunk, FileChunker, FileReassembler, ReassemblyMetadata};
use peerclip::infrastructure::config::{ChunkerConfig, ReassemblerConfig};

fn chunks_for(size: usize) -> (ReassemblyMetadata, Vec<FileChunk>) {
    let transfer_id = TransferId::new();
    let file = SourceFile::new("bench.bin", "application/octet-stream", vec![0x24; size]);
    let chunker = FileChunker::new(file, transfer_id.clone(), &ChunkerConfig::default()).unwrap();
    let metadata = ReassemblyMetadata::from_file_metadata(&transfer_id, &chunker.metadata());
    (metadata, chunker.map(|item| item.unwrap().0).collect())
}

fn bench_reassembly(c: &mut Criterion) {
    let sizes = [1024usize * 64, 1024 * 1024, 4 * 1024 * 1024];
    for &size in &sizes {
        let (metadata, chunks) = chunks_for(size);
        c.bench_function(&format!("reassemble_reversed_{}KB", size / 1024), |b| {
            b.iter(|| {
                let mut reassembler = FileReassembler::new(ReassemblerConfig::default());
                reassembler.initialize(metadata.clone()).unwrap();
                for chunk in chunks.iter().rev() {
                    reassembler.add_chunk(chunk.clone()).unwrap();
                }
                let file = reassembler.reassemble(&metadata.transfer_id).unwrap();
                black_box(file.verification_passed);
            })
        });
    }
}

criterion_group!(benches, bench_reassembly);
criterion_main!(benches);
