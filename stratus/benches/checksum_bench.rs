//! Benchmarks for trailing checksum validation.

use bytes::Bytes;
use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use std::io::Read;
use stratus::integrity::{md5, TrailingChecksumReader, TrailingChecksumSplitter};

const PAYLOAD_SIZE: usize = 1 << 20;
const CHUNK_SIZE: usize = 16 * 1024;

fn wire_body() -> Vec<u8> {
    let payload: Vec<u8> = (0..PAYLOAD_SIZE).map(|i| (i % 251) as u8).collect();
    let mut wire = payload.clone();
    wire.extend_from_slice(&md5(&payload));
    wire
}

fn checksum_benchmark(c: &mut Criterion) {
    let wire = Bytes::from(wire_body());
    let length = wire.len() as u64;

    let mut group = c.benchmark_group("trailing_checksum");
    group.throughput(Throughput::Bytes(PAYLOAD_SIZE as u64));

    group.bench_function("splitter", |b| {
        b.iter(|| {
            let mut splitter = TrailingChecksumSplitter::new(length).unwrap();
            let mut delivered = 0usize;
            for chunk in wire.chunks(CHUNK_SIZE) {
                if let Some(out) = splitter.push(wire.slice_ref(chunk)).unwrap() {
                    delivered += out.len();
                }
            }
            splitter.finish().unwrap();
            black_box(delivered)
        });
    });

    group.bench_function("reader", |b| {
        b.iter(|| {
            let mut reader = TrailingChecksumReader::new(&wire[..], length).unwrap();
            let mut buf = vec![0u8; CHUNK_SIZE];
            let mut delivered = 0usize;
            loop {
                let n = reader.read(&mut buf).unwrap();
                if n == 0 {
                    break;
                }
                delivered += n;
            }
            black_box(delivered)
        });
    });

    group.finish();
}

criterion_group!(benches, checksum_benchmark);
criterion_main!(benches);
