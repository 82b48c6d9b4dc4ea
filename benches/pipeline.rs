use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use serde_json::json;
use shardloader::{Document, GeneratorInput, Loader, MemoryCluster, Settings, WaitQueue};
use std::sync::Arc;

fn bench_wait_queue(c: &mut Criterion) {
    let mut group = c.benchmark_group("wait_queue");
    for capacity in [16usize, 1024] {
        group.throughput(Throughput::Elements(10_000));
        group.bench_with_input(
            BenchmarkId::from_parameter(capacity),
            &capacity,
            |b, &capacity| {
                b.iter(|| {
                    let queue: Arc<WaitQueue<u64>> = Arc::new(WaitQueue::new(capacity));
                    let consumer = {
                        let queue = Arc::clone(&queue);
                        std::thread::spawn(move || {
                            let mut total = 0u64;
                            while let Some(v) = queue.pop() {
                                total += v;
                            }
                            total
                        })
                    };
                    for n in 0..10_000u64 {
                        queue.push(n).unwrap();
                    }
                    queue.end_wait();
                    consumer.join().unwrap()
                });
            },
        );
    }
    group.finish();
}

fn bench_end_to_end_load(c: &mut Criterion) {
    let mut group = c.benchmark_group("load");
    group.sample_size(10);
    for strategy in ["direct", "ram"] {
        group.throughput(Throughput::Elements(20_000));
        group.bench_with_input(
            BenchmarkId::from_parameter(strategy),
            &strategy,
            |b, &strategy| {
                b.iter(|| {
                    let mut settings = Settings::default();
                    settings.connstr = "localhost:27017".to_string();
                    settings.database = "bench".to_string();
                    settings.collection = "docs".to_string();
                    settings.sharded = true;
                    settings.shard_key_json = r#"{"user_id": "hashed"}"#.to_string();
                    settings.load_queue_json = format!(r#"{{"{strategy}": 2}}"#);
                    settings.threads = 4;
                    settings.batcher.batch_size = 500;
                    settings.end_point.thread_count = 2;
                    settings.end_point.direct_load = true;

                    let cluster = Arc::new(MemoryCluster::new(2));
                    let loader = Loader::new(settings, cluster).unwrap();
                    let mut input = GeneratorInput::new(|sink: shardloader::DocumentSink| {
                        for n in 0..20_000i64 {
                            sink.push(Document::new(json!({"user_id": n})));
                        }
                    });
                    loader.run(&mut input).unwrap()
                });
            },
        );
    }
    group.finish();
}

criterion_group!(benches, bench_wait_queue, bench_end_to_end_load);
criterion_main!(benches);
