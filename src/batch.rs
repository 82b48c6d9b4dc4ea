//! # Batches and Builders
//!
//! Sealed batches are the unit of hand-off between the batcher pool, the
//! dispatcher, and the end-point workers. Each chunk accumulates documents
//! in a `BatchBuilder`; a full builder is sealed and swapped for a fresh
//! one inside the per-chunk critical section.

use crate::model::{ChunkId, ShardKey};
use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Queue-slot strategy selected at configuration time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LoadStrategy {
    /// Accumulate in memory, sort by shard key at finalization.
    Ram,
    /// Hand off to the end-point pool as soon as a batch seals.
    Direct,
    /// Accumulate in memory, spilling sorted runs to the work directory
    /// under memory pressure; merge at finalization.
    Disk,
}

impl LoadStrategy {
    pub fn parse(name: &str) -> Option<LoadStrategy> {
        match name {
            "ram" => Some(LoadStrategy::Ram),
            "direct" => Some(LoadStrategy::Direct),
            "disk" => Some(LoadStrategy::Disk),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            LoadStrategy::Ram => "ram",
            LoadStrategy::Direct => "direct",
            LoadStrategy::Disk => "disk",
        }
    }
}

impl fmt::Display for LoadStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Expand a load-queue document `{"strategy": count, ...}` into the
/// per-shard queue list. Unknown strategies, non-numeric counts, and an
/// empty result are configuration errors.
pub fn parse_load_queues(json: &str) -> Result<Vec<LoadStrategy>> {
    let parsed: Value = serde_json::from_str(json)
        .map_err(|e| anyhow::anyhow!("unable to parse load queues {json}: {e}"))?;
    let Value::Object(map) = parsed else {
        bail!("load queues must be a JSON object: {json}");
    };
    let mut queues = Vec::new();
    for (name, count) in &map {
        let Some(strategy) = LoadStrategy::parse(name) else {
            bail!("no such queue type: {name}");
        };
        let Some(count) = count.as_u64() else {
            bail!("{name} is not a number: {count}");
        };
        for _ in 0..count {
            queues.push(strategy);
        }
    }
    if queues.is_empty() {
        bail!("no load queues were created from: {json}");
    }
    Ok(queues)
}

/// A document with its extracted shard key, ready to route and write.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeyedDoc {
    pub key: ShardKey,
    pub body: Value,
    pub bytes: usize,
}

/// Sealed, immutable group of documents all destined for one chunk.
#[derive(Debug)]
pub struct Batch {
    chunk: ChunkId,
    docs: Vec<KeyedDoc>,
    bytes: usize,
}

impl Batch {
    pub fn chunk(&self) -> ChunkId {
        self.chunk
    }

    pub fn docs(&self) -> &[KeyedDoc] {
        &self.docs
    }

    pub fn into_docs(self) -> Vec<KeyedDoc> {
        self.docs
    }

    pub fn len(&self) -> usize {
        self.docs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.docs.is_empty()
    }

    pub fn bytes(&self) -> usize {
        self.bytes
    }

    /// Assemble a batch directly, used when re-batching buffered documents
    /// at finalization.
    pub fn from_docs(chunk: ChunkId, docs: Vec<KeyedDoc>) -> Self {
        let bytes = docs.iter().map(|d| d.bytes).sum();
        Self { chunk, docs, bytes }
    }
}

/// Per-chunk accumulator. One builder per chunk is shared across batcher
/// workers behind a mutex; `seal` swaps the contents out so the lock is
/// held only for the append and the swap.
#[derive(Debug)]
pub struct BatchBuilder {
    chunk: ChunkId,
    capacity: usize,
    docs: Vec<KeyedDoc>,
    bytes: usize,
}

impl BatchBuilder {
    pub fn new(chunk: ChunkId, capacity: usize) -> Self {
        Self {
            chunk,
            capacity: capacity.max(1),
            docs: Vec::with_capacity(capacity.max(1)),
            bytes: 0,
        }
    }

    pub fn append(&mut self, doc: KeyedDoc) {
        self.bytes += doc.bytes;
        self.docs.push(doc);
    }

    pub fn is_full(&self) -> bool {
        self.docs.len() >= self.capacity
    }

    pub fn is_empty(&self) -> bool {
        self.docs.is_empty()
    }

    pub fn len(&self) -> usize {
        self.docs.len()
    }

    /// Seal the current contents into an immutable batch and reset.
    pub fn seal(&mut self) -> Batch {
        let docs = std::mem::replace(&mut self.docs, Vec::with_capacity(self.capacity));
        let bytes = std::mem::take(&mut self.bytes);
        Batch {
            chunk: self.chunk,
            docs,
            bytes,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ShardKeyValue;
    use serde_json::json;

    fn doc(n: i64) -> KeyedDoc {
        KeyedDoc {
            key: ShardKey::single(ShardKeyValue::Int(n)),
            body: json!({"n": n}),
            bytes: 16,
        }
    }

    #[test]
    fn test_parse_load_queues_expands_counts() {
        let queues = parse_load_queues(r#"{"direct": 2, "ram": 1}"#).unwrap();
        assert_eq!(
            queues,
            vec![LoadStrategy::Direct, LoadStrategy::Direct, LoadStrategy::Ram]
        );
    }

    #[test]
    fn test_parse_load_queues_rejects_unknown_type() {
        let err = parse_load_queues(r#"{"tape": 1}"#).unwrap_err();
        assert!(err.to_string().contains("no such queue type"));
    }

    #[test]
    fn test_parse_load_queues_rejects_non_numeric() {
        let err = parse_load_queues(r#"{"ram": "three"}"#).unwrap_err();
        assert!(err.to_string().contains("not a number"));
    }

    #[test]
    fn test_parse_load_queues_rejects_empty() {
        assert!(parse_load_queues(r#"{}"#).is_err());
        assert!(parse_load_queues(r#"{"ram": 0}"#).is_err());
    }

    #[test]
    fn test_builder_seals_at_capacity() {
        let mut builder = BatchBuilder::new(ChunkId(3), 2);
        builder.append(doc(1));
        assert!(!builder.is_full());
        builder.append(doc(2));
        assert!(builder.is_full());

        let batch = builder.seal();
        assert_eq!(batch.chunk(), ChunkId(3));
        assert_eq!(batch.len(), 2);
        assert_eq!(batch.bytes(), 32);
        assert!(builder.is_empty());
    }
}
