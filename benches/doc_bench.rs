// Benchmarks for local editing and replication.

use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use tandem::Doc;
use tandem::Options;

const CONTENT: &str = "the quick brown fox jumps over the lazy dog. ";

fn doc(client_id: u64) -> Doc {
    return Doc::with_options(Options::new().with_client_id(client_id));
}

/// Type `count` characters left to right, one transaction per keystroke.
fn type_forward(doc: &mut Doc, count: usize) {
    let text = doc.get_text("text");
    for (i, c) in CONTENT.chars().cycle().take(count).enumerate() {
        text.insert(doc, i as u32, c.encode_utf8(&mut [0; 4])).unwrap();
    }
}

// =============================================================================
// Local edits
// =============================================================================

fn bench_typing(c: &mut Criterion) {
    let mut group = c.benchmark_group("typing");
    for size in [100, 1_000, 5_000] {
        group.throughput(Throughput::Elements(size as u64));
        group.bench_with_input(BenchmarkId::new("forward", size), &size, |b, &size| {
            b.iter(|| {
                let mut doc = doc(1);
                type_forward(&mut doc, size);
                black_box(doc.get_text("text").len(&doc))
            });
        });
        group.bench_with_input(BenchmarkId::new("random", size), &size, |b, &size| {
            b.iter(|| {
                let mut doc = doc(1);
                let mut rng = StdRng::seed_from_u64(7);
                let text = doc.get_text("text");
                for _ in 0..size {
                    let pos = rng.gen_range(0..=text.len(&doc));
                    text.insert(&mut doc, pos, "x").unwrap();
                }
                black_box(text.len(&doc))
            });
        });
    }
    group.finish();
}

fn bench_array(c: &mut Criterion) {
    let mut group = c.benchmark_group("array");
    for size in [100, 1_000] {
        group.throughput(Throughput::Elements(size as u64));
        group.bench_with_input(BenchmarkId::new("push_remove", size), &size, |b, &size| {
            b.iter(|| {
                let mut doc = doc(1);
                let array = doc.get_array("array");
                {
                    let mut txn = doc.transact();
                    array.push(&mut txn, 0..size as i64).unwrap();
                }
                let mut rng = StdRng::seed_from_u64(11);
                while !array.is_empty(&doc) {
                    let pos = rng.gen_range(0..array.len(&doc));
                    array.remove(&mut doc, pos).unwrap();
                }
                black_box(array.len(&doc))
            });
        });
    }
    group.finish();
}

// =============================================================================
// Replication
// =============================================================================

fn bench_sync(c: &mut Criterion) {
    let mut group = c.benchmark_group("sync");
    for size in [1_000, 5_000] {
        let mut source = doc(1);
        type_forward(&mut source, size);
        let update = source.encode_state_as_update();

        group.throughput(Throughput::Bytes(update.len() as u64));
        group.bench_with_input(BenchmarkId::new("encode", size), &source, |b, source| {
            b.iter(|| black_box(source.encode_state_as_update()));
        });
        group.bench_with_input(BenchmarkId::new("apply", size), &update, |b, update| {
            b.iter(|| {
                let mut sink = doc(2);
                sink.apply_update(update).unwrap();
                black_box(sink.state_vector())
            });
        });
    }
    group.finish();
}

fn bench_concurrent_merge(c: &mut Criterion) {
    c.bench_function("concurrent_merge/3x200", |b| {
        b.iter(|| {
            let mut peers: Vec<Doc> = (1..=3).map(doc).collect();
            for peer in peers.iter_mut() {
                type_forward(peer, 200);
            }
            let updates: Vec<Vec<u8>> = peers.iter().map(|p| p.encode_state_as_update()).collect();
            for peer in peers.iter_mut() {
                for update in &updates {
                    peer.apply_update(update).unwrap();
                }
            }
            black_box(peers[0].get_text("text").len(&peers[0]))
        });
    });
}

criterion_group!(benches, bench_typing, bench_array, bench_sync, bench_concurrent_merge);
criterion_main!(benches);
