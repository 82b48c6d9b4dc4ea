//! End-to-end pipeline scenarios over the in-memory cluster.

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use serde_json::json;
use shardloader::{
    Cluster, Document, GeneratorInput, Loader, MemoryCluster, Namespace, Settings, ShardId,
    ShardKeyValue,
};
use std::sync::Arc;

fn base_settings() -> Settings {
    let mut settings = Settings::default();
    settings.connstr = "localhost:27017".to_string();
    settings.database = "bulk".to_string();
    settings.collection = "docs".to_string();
    settings.end_point.direct_load = true;
    settings.end_point.retry.base_backoff_ms = 1;
    settings.threads = 4;
    settings
}

fn key_int(doc: &shardloader::KeyedDoc) -> i64 {
    match doc.key.0[0] {
        ShardKeyValue::Int(n) => n,
        ShardKeyValue::Hashed(n) => n,
        _ => panic!("unexpected key type"),
    }
}

#[test]
fn test_single_shard_ram_load_sorts_on_finalize() {
    let mut settings = base_settings();
    settings.sharded = true;
    settings.shard_key_json = r#"{"n": 1}"#.to_string();
    settings.load_queue_json = r#"{"ram": 1}"#.to_string();
    settings.batcher.batch_size = 500;
    settings.end_point.thread_count = 1;

    let cluster = Arc::new(MemoryCluster::new(1));
    let loader = Loader::new(settings, cluster.clone()).unwrap();

    let mut values: Vec<i64> = (1..=10_000).collect();
    values.shuffle(&mut StdRng::seed_from_u64(7));
    let mut input = GeneratorInput::new(move |sink: shardloader::DocumentSink| {
        for n in values {
            sink.push(Document::new(json!({"n": n, "payload": "x"})));
        }
    });

    let summary = loader.run(&mut input).unwrap();
    assert_eq!(summary.stats.accepted, 10_000);
    assert_eq!(summary.stats.rejected, 0);
    assert_eq!(summary.stats.batches_sealed, 20);
    assert_eq!(summary.stats.docs_written, 10_000);

    let ns = Namespace::new("bulk", "docs");
    assert_eq!(cluster.doc_count(&ns), 10_000);

    // A single connection preserves submission order, so the destination
    // sees the finalize-sorted sequence.
    let docs = cluster.shard_docs(ShardId(0), &ns);
    let keys: Vec<i64> = docs.iter().map(key_int).collect();
    let mut sorted = keys.clone();
    sorted.sort_unstable();
    assert_eq!(keys, sorted);
    assert_eq!(keys.first(), Some(&1));
    assert_eq!(keys.last(), Some(&10_000));
}

#[test]
fn test_hashed_load_balances_two_shards() {
    let mut settings = base_settings();
    settings.sharded = true;
    settings.shard_key_json = r#"{"user_id": "hashed"}"#.to_string();
    settings.load_queue_json = r#"{"ram": 4}"#.to_string();
    settings.batcher.batch_size = 1_000;
    settings.end_point.thread_count = 2;

    let cluster = Arc::new(MemoryCluster::new(2));
    let loader = Loader::new(settings, cluster.clone()).unwrap();
    let pattern = loader.settings().key_pattern().unwrap().clone();

    let total = 100_000usize;
    let mut rng = StdRng::seed_from_u64(42);
    let ids: Vec<u64> = (0..total).map(|_| rng.gen_range(0..u32::MAX as u64)).collect();
    let mut input = GeneratorInput::new(move |sink: shardloader::DocumentSink| {
        for id in ids {
            sink.push(Document::new(json!({"user_id": id})));
        }
    });

    let summary = loader.run(&mut input).unwrap();
    assert_eq!(summary.stats.accepted as usize, total);
    assert_eq!(summary.stats.docs_written as usize, total);

    let ns = Namespace::new("bulk", "docs");
    assert_eq!(cluster.doc_count(&ns), total);

    // Shards land within 5% of an even split.
    let per_shard = total / 2;
    let tolerance = per_shard / 20;
    for shard in [ShardId(0), ShardId(1)] {
        let count = cluster.shard_doc_count(shard, &ns);
        assert!(
            count.abs_diff(per_shard) <= tolerance,
            "shard {shard} holds {count}, expected {per_shard} +/- {tolerance}"
        );
    }

    // And each of the 8 chunks within 5% of its share.
    let map = cluster.chunk_map(&ns, &pattern).unwrap();
    assert_eq!(map.len(), 8);
    let mut per_chunk = std::collections::HashMap::new();
    for shard in [ShardId(0), ShardId(1)] {
        for doc in cluster.shard_docs(shard, &ns) {
            let chunk = map.locate(&doc.key).expect("every key has an owner");
            assert_eq!(chunk.shard, shard, "document landed on the wrong shard");
            *per_chunk.entry(chunk.id).or_insert(0usize) += 1;
        }
    }
    let share = total / 8;
    for (chunk, count) in per_chunk {
        assert!(
            count.abs_diff(share) <= share / 20,
            "chunk {chunk} holds {count}, expected {share} +/- {}",
            share / 20
        );
    }
}

#[test]
fn test_graceful_shutdown_drains_everything() {
    let mut settings = base_settings();
    settings.sharded = true;
    settings.shard_key_json = r#"{"user_id": "hashed"}"#.to_string();
    settings.load_queue_json = r#"{"direct": 2}"#.to_string();
    settings.batcher.batch_size = 32;
    settings.end_point.thread_count = 2;

    let cluster = Arc::new(MemoryCluster::new(2));
    let loader = Loader::new(settings, cluster.clone()).unwrap();

    let mut input = GeneratorInput::new(|sink: shardloader::DocumentSink| {
        for n in 0..1_000i64 {
            sink.push(Document::new(json!({"user_id": n, "seq": n})));
        }
    });

    let summary = loader.run(&mut input).unwrap();
    assert_eq!(summary.stats.accepted, 1_000);
    assert_eq!(summary.stats.docs_written, 1_000);
    assert_eq!(summary.stats.rejected, 0);
    assert_eq!(summary.stats.write_failures, 0);

    let ns = Namespace::new("bulk", "docs");
    assert_eq!(cluster.doc_count(&ns), 1_000);
}

#[test]
fn test_mixed_strategies_and_disk_spill() {
    let work_dir = tempfile::tempdir().unwrap();
    let mut settings = base_settings();
    settings.sharded = true;
    settings.shard_key_json = r#"{"user_id": "hashed"}"#.to_string();
    settings.load_queue_json = r#"{"direct": 1, "ram": 1, "disk": 1}"#.to_string();
    settings.batcher.batch_size = 64;
    settings.end_point.thread_count = 2;
    settings.work_path = work_dir.path().to_path_buf();
    // Force spills with a tiny threshold.
    settings.dispatch.spill_threshold = Some(4 * 1024);

    let cluster = Arc::new(MemoryCluster::new(2));
    let loader = Loader::new(settings, cluster.clone()).unwrap();

    let mut input = GeneratorInput::new(|sink: shardloader::DocumentSink| {
        for n in 0..20_000i64 {
            sink.push(Document::new(json!({"user_id": n, "body": "some ballast text"})));
        }
    });

    let summary = loader.run(&mut input).unwrap();
    assert_eq!(summary.stats.accepted, 20_000);
    assert_eq!(summary.stats.docs_written, 20_000);

    let ns = Namespace::new("bulk", "docs");
    assert_eq!(cluster.doc_count(&ns), 20_000);
}

#[test]
fn test_add_id_synthesis_round_trip() {
    let mut settings = base_settings();
    settings.sharded = true;
    settings.shard_key_json = r#"{"_id": 1}"#.to_string();
    settings.add_id = true;
    settings.load_queue_json = r#"{"direct": 1}"#.to_string();
    settings.end_point.thread_count = 1;

    let cluster = Arc::new(MemoryCluster::new(1));
    let loader = Loader::new(settings, cluster.clone()).unwrap();

    let mut input = GeneratorInput::new(|sink: shardloader::DocumentSink| {
        for n in 0..100i64 {
            sink.push(Document::new(json!({"value": n})));
        }
    });

    let summary = loader.run(&mut input).unwrap();
    assert_eq!(summary.stats.accepted, 100);
    assert_eq!(summary.stats.rejected, 0);

    let ns = Namespace::new("bulk", "docs");
    let docs = cluster.shard_docs(ShardId(0), &ns);
    assert_eq!(docs.len(), 100);
    for doc in docs {
        assert!(doc.body.get("_id").is_some(), "every document gained an _id");
    }
}
