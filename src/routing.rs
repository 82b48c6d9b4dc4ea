//! # Chunk Routing
//!
//! The immutable chunk map used to resolve the owning chunk for every
//! extracted shard key. The balancer is stopped before a load begins, so
//! the map is frozen for the whole run and lookups take `&self`.

use crate::model::{ChunkId, KeyPattern, ShardId, ShardKey};
use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

/// A contiguous shard-key range `[min, max)` owned by exactly one shard.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chunk {
    pub id: ChunkId,
    pub shard: ShardId,
    pub min: ShardKey,
    pub max: ShardKey,
}

/// Ordered, immutable view of a collection's chunks.
#[derive(Debug, Clone)]
pub struct ChunkMap {
    pattern: KeyPattern,
    chunks: Vec<Chunk>,
}

impl ChunkMap {
    pub fn new(pattern: KeyPattern, mut chunks: Vec<Chunk>) -> Result<Self> {
        if chunks.is_empty() {
            bail!("chunk map has no chunks");
        }
        chunks.sort_by(|a, b| pattern.compare(&a.min, &b.min));
        Ok(Self { pattern, chunks })
    }

    pub fn pattern(&self) -> &KeyPattern {
        &self.pattern
    }

    pub fn chunks(&self) -> &[Chunk] {
        &self.chunks
    }

    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    /// Resolve the chunk owning a key via ordered-range binary search.
    /// Hashed keys are already in hash space after extraction, so the same
    /// search covers both ranged and hashed patterns.
    pub fn locate(&self, key: &ShardKey) -> Option<&Chunk> {
        let idx = self
            .chunks
            .partition_point(|chunk| self.pattern.compare(&chunk.min, key) != Ordering::Greater);
        if idx == 0 {
            return None;
        }
        let chunk = &self.chunks[idx - 1];
        if self.pattern.compare(key, &chunk.max) == Ordering::Less {
            Some(chunk)
        } else {
            None
        }
    }

    /// Destination shards in id order, deduplicated.
    pub fn shards(&self) -> Vec<ShardId> {
        let mut shards: Vec<ShardId> = self.chunks.iter().map(|c| c.shard).collect();
        shards.sort();
        shards.dedup();
        shards
    }

    /// The chunks owned by one shard, in key order.
    pub fn chunks_for(&self, shard: ShardId) -> Vec<&Chunk> {
        self.chunks.iter().filter(|c| c.shard == shard).collect()
    }
}
