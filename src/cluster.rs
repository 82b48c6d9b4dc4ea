//! # Cluster Facade
//!
//! The seam between the load pipeline and the destination cluster:
//! topology, sharding setup, balancer control, and per-shard connections.
//! The wire protocol lives behind these traits; `MemoryCluster` is the
//! in-process implementation used by the tests and the load harness.

use crate::batch::KeyedDoc;
use crate::model::{ChunkId, KeyPattern, Namespace, ShardId, ShardKey, WriteConcern};
use crate::routing::{Chunk, ChunkMap};
use anyhow::{bail, Result};
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use std::collections::HashSet;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Whether a failed write may be retried on another attempt or connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteErrorKind {
    Retryable,
    NotRetryable,
}

/// Error returned by a shard connection for a failed batch write.
#[derive(Debug)]
pub struct WriteError {
    pub kind: WriteErrorKind,
    pub message: String,
}

impl WriteError {
    pub fn retryable(message: impl Into<String>) -> Self {
        Self {
            kind: WriteErrorKind::Retryable,
            message: message.into(),
        }
    }

    pub fn not_retryable(message: impl Into<String>) -> Self {
        Self {
            kind: WriteErrorKind::NotRetryable,
            message: message.into(),
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.kind == WriteErrorKind::Retryable
    }
}

impl fmt::Display for WriteError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            WriteErrorKind::Retryable => write!(f, "retryable write error: {}", self.message),
            WriteErrorKind::NotRetryable => write!(f, "write error: {}", self.message),
        }
    }
}

impl std::error::Error for WriteError {}

/// Result of a successful batch write.
#[derive(Debug, Clone, Copy)]
pub struct WriteReport {
    pub written: usize,
}

/// One persistent connection to a shard (or to the routing tier).
pub trait ShardConnection: Send {
    fn write_batch(
        &mut self,
        ns: &Namespace,
        docs: &[KeyedDoc],
        wc: WriteConcern,
    ) -> std::result::Result<WriteReport, WriteError>;
}

/// Cluster topology and administration, consumed by the loader during
/// setup and by the end-point pools for connections.
pub trait Cluster: Send + Sync {
    fn load_topology(&self) -> Result<()>;
    fn is_sharded(&self) -> bool;
    fn shards(&self) -> Vec<ShardId>;
    fn enable_sharding(&self, database: &str) -> Result<()>;
    fn shard_collection(
        &self,
        ns: &Namespace,
        pattern: &KeyPattern,
        unique: bool,
        total_chunks: Option<usize>,
    ) -> Result<()>;
    fn balancer_stop(&self) -> Result<()>;
    fn stop_balancer_wait(&self, timeout: Duration) -> Result<()>;
    fn wait_for_chunks_per_shard(&self, ns: &Namespace, per_shard: usize) -> Result<()>;
    fn drop_database(&self, database: &str) -> Result<()>;
    fn drop_collection(&self, ns: &Namespace) -> Result<()>;
    fn drop_indexes(&self, ns: &Namespace) -> Result<()>;
    /// The collection's frozen chunk map. An unsharded collection maps to a
    /// single whole-range chunk on the first shard.
    fn chunk_map(&self, ns: &Namespace, pattern: &KeyPattern) -> Result<ChunkMap>;
    /// Direct connection to one shard, bypassing the routing tier.
    fn connect(&self, shard: ShardId) -> Result<Box<dyn ShardConnection>>;
    /// Connection through the routing tier.
    fn connect_router(&self) -> Result<Box<dyn ShardConnection>>;
}

#[derive(Default)]
struct ShardStore {
    collections: Mutex<FxHashMap<String, Vec<KeyedDoc>>>,
}

impl ShardStore {
    fn append(&self, ns: &Namespace, docs: &[KeyedDoc]) {
        let mut collections = self.collections.lock();
        collections
            .entry(ns.to_string())
            .or_default()
            .extend_from_slice(docs);
    }
}

struct MetaState {
    sharded_dbs: HashSet<String>,
    collections: FxHashMap<String, Arc<ChunkMap>>,
    next_chunk_id: u32,
}

/// In-memory sharded cluster. Holds per-shard document stores, a chunk map
/// per sharded collection, and per-connection fault plans so tests can
/// exercise the retry and eviction paths.
pub struct MemoryCluster {
    shards: Vec<ShardId>,
    stores: FxHashMap<ShardId, Arc<ShardStore>>,
    meta: Mutex<MetaState>,
    balancer_stopped: AtomicBool,
    conn_counters: Mutex<FxHashMap<ShardId, usize>>,
    faults: Mutex<FxHashMap<(ShardId, usize), WriteErrorKind>>,
    write_calls: Arc<AtomicU64>,
    docs_attempted: Arc<AtomicU64>,
}

impl MemoryCluster {
    pub fn new(shard_count: u16) -> Self {
        let shards: Vec<ShardId> = (0..shard_count.max(1)).map(ShardId).collect();
        let stores = shards
            .iter()
            .map(|&s| (s, Arc::new(ShardStore::default())))
            .collect();
        Self {
            shards,
            stores,
            meta: Mutex::new(MetaState {
                sharded_dbs: HashSet::new(),
                collections: FxHashMap::default(),
                next_chunk_id: 0,
            }),
            balancer_stopped: AtomicBool::new(false),
            conn_counters: Mutex::new(FxHashMap::default()),
            faults: Mutex::new(FxHashMap::default()),
            write_calls: Arc::new(AtomicU64::new(0)),
            docs_attempted: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Make every write on the n-th connection handed out for `shard` fail
    /// with the given error kind.
    pub fn fail_connection(&self, shard: ShardId, ordinal: usize, kind: WriteErrorKind) {
        self.faults.lock().insert((shard, ordinal), kind);
    }

    pub fn doc_count(&self, ns: &Namespace) -> usize {
        self.shards
            .iter()
            .map(|&s| self.shard_doc_count(s, ns))
            .sum()
    }

    pub fn shard_doc_count(&self, shard: ShardId, ns: &Namespace) -> usize {
        self.stores[&shard]
            .collections
            .lock()
            .get(&ns.to_string())
            .map_or(0, Vec::len)
    }

    /// Snapshot of one shard's collection, in arrival order.
    pub fn shard_docs(&self, shard: ShardId, ns: &Namespace) -> Vec<KeyedDoc> {
        self.stores[&shard]
            .collections
            .lock()
            .get(&ns.to_string())
            .cloned()
            .unwrap_or_default()
    }

    /// Total `write_batch` calls observed across all connections.
    pub fn write_calls(&self) -> u64 {
        self.write_calls.load(Ordering::Relaxed)
    }

    /// Total documents presented to connections, including retries.
    pub fn docs_attempted(&self) -> u64 {
        self.docs_attempted.load(Ordering::Relaxed)
    }

    fn single_chunk_map(&self, pattern: &KeyPattern, chunk_id: u32) -> Result<ChunkMap> {
        let fields = pattern.fields().len();
        ChunkMap::new(
            pattern.clone(),
            vec![Chunk {
                id: ChunkId(chunk_id),
                shard: self.shards[0],
                min: ShardKey::min(fields),
                max: ShardKey::max(fields),
            }],
        )
    }

    fn hashed_chunks(&self, total: usize, first_id: u32) -> Vec<Chunk> {
        // Split the signed 64-bit hash space into `total` equal ranges and
        // deal them round-robin across the shards.
        let span = (u64::MAX as u128) + 1;
        let bound = |i: usize| -> ShardKey {
            if i == 0 {
                ShardKey::min(1)
            } else if i == total {
                ShardKey::max(1)
            } else {
                let offset = span * i as u128 / total as u128;
                let value = (i64::MIN as i128 + offset as i128) as i64;
                ShardKey::single(crate::model::ShardKeyValue::Hashed(value))
            }
        };
        (0..total)
            .map(|i| Chunk {
                id: ChunkId(first_id + i as u32),
                shard: self.shards[i % self.shards.len()],
                min: bound(i),
                max: bound(i + 1),
            })
            .collect()
    }
}

impl Cluster for MemoryCluster {
    fn load_topology(&self) -> Result<()> {
        Ok(())
    }

    fn is_sharded(&self) -> bool {
        true
    }

    fn shards(&self) -> Vec<ShardId> {
        self.shards.clone()
    }

    fn enable_sharding(&self, database: &str) -> Result<()> {
        self.meta.lock().sharded_dbs.insert(database.to_string());
        Ok(())
    }

    fn shard_collection(
        &self,
        ns: &Namespace,
        pattern: &KeyPattern,
        _unique: bool,
        total_chunks: Option<usize>,
    ) -> Result<()> {
        let mut meta = self.meta.lock();
        if !meta.sharded_dbs.contains(&ns.database) {
            bail!("sharding not enabled for database {}", ns.database);
        }
        if meta.collections.contains_key(&ns.to_string()) {
            return Ok(());
        }
        let first_id = meta.next_chunk_id;
        let chunks = match total_chunks {
            Some(total) if total > 0 => {
                if !pattern.is_hashed() {
                    bail!("pre-split chunk counts require a hashed key");
                }
                self.hashed_chunks(total, first_id)
            }
            _ => {
                let fields = pattern.fields().len();
                vec![Chunk {
                    id: ChunkId(first_id),
                    shard: self.shards[0],
                    min: ShardKey::min(fields),
                    max: ShardKey::max(fields),
                }]
            }
        };
        meta.next_chunk_id += chunks.len() as u32;
        let map = Arc::new(ChunkMap::new(pattern.clone(), chunks)?);
        meta.collections.insert(ns.to_string(), map);
        Ok(())
    }

    fn balancer_stop(&self) -> Result<()> {
        self.balancer_stopped.store(true, Ordering::Release);
        Ok(())
    }

    fn stop_balancer_wait(&self, _timeout: Duration) -> Result<()> {
        if self.balancer_stopped.load(Ordering::Acquire) {
            Ok(())
        } else {
            bail!("balancer is still running")
        }
    }

    fn wait_for_chunks_per_shard(&self, ns: &Namespace, per_shard: usize) -> Result<()> {
        let meta = self.meta.lock();
        let Some(map) = meta.collections.get(&ns.to_string()) else {
            bail!("collection {ns} is not sharded");
        };
        for &shard in &self.shards {
            let count = map.chunks_for(shard).len();
            if count < per_shard {
                bail!("shard {shard} has {count} chunks, expected {per_shard}");
            }
        }
        Ok(())
    }

    fn drop_database(&self, database: &str) -> Result<()> {
        let prefix = format!("{database}.");
        for store in self.stores.values() {
            store.collections.lock().retain(|ns, _| !ns.starts_with(&prefix));
        }
        let mut meta = self.meta.lock();
        meta.collections.retain(|ns, _| !ns.starts_with(&prefix));
        meta.sharded_dbs.remove(database);
        Ok(())
    }

    fn drop_collection(&self, ns: &Namespace) -> Result<()> {
        let key = ns.to_string();
        for store in self.stores.values() {
            store.collections.lock().remove(&key);
        }
        self.meta.lock().collections.remove(&key);
        Ok(())
    }

    fn drop_indexes(&self, _ns: &Namespace) -> Result<()> {
        Ok(())
    }

    fn chunk_map(&self, ns: &Namespace, pattern: &KeyPattern) -> Result<ChunkMap> {
        let mut meta = self.meta.lock();
        if let Some(map) = meta.collections.get(&ns.to_string()) {
            return Ok(map.as_ref().clone());
        }
        let chunk_id = meta.next_chunk_id;
        meta.next_chunk_id += 1;
        drop(meta);
        self.single_chunk_map(pattern, chunk_id)
    }

    fn connect(&self, shard: ShardId) -> Result<Box<dyn ShardConnection>> {
        let Some(store) = self.stores.get(&shard) else {
            bail!("unknown shard {shard}");
        };
        let ordinal = {
            let mut counters = self.conn_counters.lock();
            let counter = counters.entry(shard).or_insert(0);
            let ordinal = *counter;
            *counter += 1;
            ordinal
        };
        let fault = self.faults.lock().get(&(shard, ordinal)).copied();
        Ok(Box::new(MemoryConnection {
            store: Arc::clone(store),
            fault,
            write_calls: Arc::clone(&self.write_calls),
            docs_attempted: Arc::clone(&self.docs_attempted),
        }))
    }

    fn connect_router(&self) -> Result<Box<dyn ShardConnection>> {
        let maps = self.meta.lock().collections.clone();
        Ok(Box::new(RouterConnection {
            maps,
            stores: self.stores.clone(),
            write_calls: Arc::clone(&self.write_calls),
            docs_attempted: Arc::clone(&self.docs_attempted),
        }))
    }
}

struct MemoryConnection {
    store: Arc<ShardStore>,
    fault: Option<WriteErrorKind>,
    write_calls: Arc<AtomicU64>,
    docs_attempted: Arc<AtomicU64>,
}

impl ShardConnection for MemoryConnection {
    fn write_batch(
        &mut self,
        ns: &Namespace,
        docs: &[KeyedDoc],
        _wc: WriteConcern,
    ) -> std::result::Result<WriteReport, WriteError> {
        self.write_calls.fetch_add(1, Ordering::Relaxed);
        self.docs_attempted
            .fetch_add(docs.len() as u64, Ordering::Relaxed);
        match self.fault {
            Some(WriteErrorKind::Retryable) => Err(WriteError::retryable("connection reset")),
            Some(WriteErrorKind::NotRetryable) => {
                Err(WriteError::not_retryable("duplicate key"))
            }
            None => {
                self.store.append(ns, docs);
                Ok(WriteReport {
                    written: docs.len(),
                })
            }
        }
    }
}

struct RouterConnection {
    maps: FxHashMap<String, Arc<ChunkMap>>,
    stores: FxHashMap<ShardId, Arc<ShardStore>>,
    write_calls: Arc<AtomicU64>,
    docs_attempted: Arc<AtomicU64>,
}

impl ShardConnection for RouterConnection {
    fn write_batch(
        &mut self,
        ns: &Namespace,
        docs: &[KeyedDoc],
        _wc: WriteConcern,
    ) -> std::result::Result<WriteReport, WriteError> {
        self.write_calls.fetch_add(1, Ordering::Relaxed);
        self.docs_attempted
            .fetch_add(docs.len() as u64, Ordering::Relaxed);
        // Route per-document the way the routing tier would. A collection
        // without a registered map lands whole on the first shard.
        let map = self.maps.get(&ns.to_string()).cloned();
        let mut written = 0usize;
        for doc in docs {
            let shard = match &map {
                Some(map) => map
                    .locate(&doc.key)
                    .map(|chunk| chunk.shard)
                    .ok_or_else(|| WriteError::not_retryable("no chunk owns document key"))?,
                None => *self.stores.keys().min().expect("cluster has shards"),
            };
            self.stores[&shard].append(ns, std::slice::from_ref(doc));
            written += 1;
        }
        Ok(WriteReport { written })
    }
}
