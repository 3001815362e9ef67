//! Ring transport throughput: reserve/commit/publish on one side,
//! record-by-record drain on the other.

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use ringws::ring::ring;

fn bench_push_drain(c: &mut Criterion) {
    let mut group = c.benchmark_group("ring_push_drain");

    for &record_size in &[16usize, 128, 1024] {
        group.throughput(Throughput::Bytes(record_size as u64 * 1024));
        group.bench_with_input(
            BenchmarkId::from_parameter(record_size),
            &record_size,
            |b, &record_size| {
                let (mut producer, mut consumer) = ring(1 << 20, 2, 64);
                let payload = vec![0xA5u8; record_size];
                b.iter(|| {
                    for _ in 0..1024 {
                        producer.push_record(&payload);
                    }
                    producer.publish_writer();
                    let mut drained = 0;
                    while let Some(rec) = consumer.next_record() {
                        drained += rec.len();
                    }
                    consumer.publish_reader();
                    assert_eq!(drained, record_size * 1024);
                });
            },
        );
    }
    group.finish();
}

fn bench_reserve_in_place(c: &mut Criterion) {
    c.bench_function("ring_reserve_in_place_64b", |b| {
        let (mut producer, mut consumer) = ring(1 << 20, 2, 64);
        b.iter(|| {
            let region = producer.reserve(64);
            region[0] = 1;
            region[63] = 2;
            producer.commit(64);
            producer.publish_writer();
            while consumer.next_record().is_some() {}
            consumer.publish_reader();
        });
    });
}

criterion_group!(benches, bench_push_drain, bench_reserve_in_place);
criterion_main!(benches);
