//! Benchmarks for buffer block reassembly
//!
//! Compares in-order delivery against a window that has to hold blocks
//! until a gap closes.

use bytes::Bytes;
use criterion::{BenchmarkId, Criterion, Throughput, criterion_group, criterion_main};
use feedline::reassembly::BufferBlockReassembler;
use feedline::test_utils::packets;
use feedline::types::{BufferBlock, Ticks};
use std::hint::black_box;
use std::sync::Arc;

fn block(sequence_number: u32, payload: &Bytes) -> BufferBlock {
    BufferBlock {
        signal_id: packets::sample_signal_id(0),
        source: Arc::from("PPA"),
        point_id: 1,
        timestamp: Ticks(0),
        payload: payload.clone(),
        sequence_number,
    }
}

/// Sequence numbers in pairs swapped: 1, 0, 3, 2, ...
fn swapped_pairs(count: u32) -> Vec<u32> {
    (0..count).map(|n| n ^ 1).collect()
}

/// Every block but the first arrives before the first.
fn late_head(count: u32) -> Vec<u32> {
    (1..count).chain(std::iter::once(0)).collect()
}

fn bench_orderings(c: &mut Criterion) {
    let payload = Bytes::from_static(&[0xAB; 256]);
    let mut group = c.benchmark_group("buffer_block_reassembly");

    let orderings: [(&str, Vec<u32>); 3] = [
        ("in_order", (0..256).collect()),
        ("swapped_pairs", swapped_pairs(256)),
        ("late_head", late_head(256)),
    ];

    for (name, order) in orderings {
        group.throughput(Throughput::Elements(order.len() as u64));
        group.bench_with_input(BenchmarkId::from_parameter(name), &order, |b, order| {
            b.iter(|| {
                let reassembler = BufferBlockReassembler::new();
                let mut delivered = 0usize;
                for &sequence_number in order {
                    let outcome = reassembler
                        .submit(sequence_number, || Ok(block(sequence_number, &payload)))
                        .expect("submit");
                    delivered += outcome.delivered.len();
                }
                black_box(delivered)
            })
        });
    }

    group.finish();
}

criterion_group!(benches, bench_orderings);
criterion_main!(benches);
