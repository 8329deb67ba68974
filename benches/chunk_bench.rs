use criterion::{Criterion, black_box, criterion_group, criterion_main};
use peerclip::core::{SourceFile, TransferId};
use peerclip::file_transfer::{FileChunker, TransferMessage};
use peerclip::infrastructure::config::ChunkerConfig;

fn bench_chunk_file(c: &mut Criterion) {
    let file = SourceFile::new("bench.bin", "application/octet-stream", vec![0x42; 1024 * 1024]);
    let config = ChunkerConfig::default();

    c.bench_function("chunk_1MB_64KB_chunks", |b| {
        b.iter(|| {
            let chunker = FileChunker::new(file.clone(), TransferId::new(), &config).unwrap();
            let count = chunker.map(|item| item.unwrap()).count();
            black_box(count);
        })
    });

    c.bench_function("chunk_and_encode_1MB", |b| {
        b.iter(|| {
            let chunker = FileChunker::new(file.clone(), TransferId::new(), &config).unwrap();
            for item in chunker {
                let (chunk, _) = item.unwrap();
                // encode phase, as sent over the data channel
                let bytes = TransferMessage::Chunk(chunk.to_message()).to_payload().into_bytes();
                black_box(bytes);
            }
        })
    });
}

criterion_group!(benches, bench_chunk_file);
criterion_main!(benches);
