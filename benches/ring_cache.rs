use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

use audio_stream_client::buffer::{BufferGeometry, RingCache, SharedRingBuffer};

const SPAN_BYTES: usize = 960 * 4;

fn cache_throughput(c: &mut Criterion) {
    let mut group = c.benchmark_group("ring_cache");
    for chunk in [256usize, 1024, SPAN_BYTES] {
        group.throughput(Throughput::Bytes(chunk as u64));
        group.bench_with_input(BenchmarkId::new("enqueue_dequeue", chunk), &chunk, |b, &chunk| {
            let cache = RingCache::create(SPAN_BYTES * 2).unwrap();
            let input = vec![0x5au8; chunk];
            let mut output = vec![0u8; chunk];
            b.iter(|| {
                cache.enqueue(black_box(&input)).unwrap();
                cache.dequeue(black_box(&mut output)).unwrap();
            });
        });
    }
    group.finish();
}

fn shared_span_handoff(c: &mut Criterion) {
    let geometry = BufferGeometry::new(960 * 4, 960, 4);
    let ring = SharedRingBuffer::create_anonymous(geometry).unwrap();
    let span = vec![1u8; ring.span_bytes()];
    let mut out = vec![0u8; ring.span_bytes()];

    let mut group = c.benchmark_group("shared_ring");
    group.throughput(Throughput::Bytes(span.len() as u64));
    group.bench_function("write_read_span", |b| {
        b.iter(|| {
            let frame = ring.cur_write_frame();
            ring.write_span(frame, black_box(&span)).unwrap();
            ring.advance_write(960).unwrap();
            let frame = ring.cur_read_frame();
            ring.read_span(frame, black_box(&mut out)).unwrap();
            ring.advance_read(960).unwrap();
        });
    });
    group.finish();
}

criterion_group!(benches, cache_throughput, shared_span_handoff);
criterion_main!(benches);
