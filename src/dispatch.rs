//! # Chunk Dispatch
//!
//! One queue slot per (shard, chunk) pair. Direct slots hand sealed
//! batches straight through a bounded queue to the shard's end-point
//! workers; ram and disk slots accumulate until finalization, with disk
//! slots spilling sorted runs under memory pressure. The waterfall orders
//! finalization so no single shard drains last.

use crate::batch::{Batch, KeyedDoc, LoadStrategy};
use crate::endpoint::{EndPointPool, WriteTask};
use crate::model::{ChunkId, KeyPattern, ShardId};
use crate::routing::ChunkMap;
use crate::sync::{RoundRobin, WaitQueue};
use anyhow::{anyhow, Context, Result};
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

/// Dispatcher build parameters, derived from the settings and the startup
/// RAM sample.
#[derive(Debug, Clone)]
pub struct DispatchConfig {
    /// Capacity of each direct slot's batch queue.
    pub queue_size: usize,
    /// Directory receiving disk-spill runs.
    pub work_path: PathBuf,
    /// Total bytes the disk strategy may buffer before spilling, shared
    /// across all disk slots.
    pub spill_threshold: u64,
    /// Documents per batch when re-batching buffered state.
    pub batch_size: usize,
}

struct SlotBuffer {
    docs: Vec<KeyedDoc>,
    bytes: usize,
    runs: Vec<PathBuf>,
}

/// Per-(shard, chunk) logical queue inside the dispatcher.
pub struct QueueSlot {
    chunk: ChunkId,
    shard: ShardId,
    index: usize,
    strategy: LoadStrategy,
    pattern: Arc<KeyPattern>,
    queue: WaitQueue<Batch>,
    buffer: Mutex<SlotBuffer>,
    spill_limit: usize,
    work_path: PathBuf,
    received: AtomicU64,
    done: AtomicBool,
}

impl QueueSlot {
    pub fn chunk(&self) -> ChunkId {
        self.chunk
    }

    pub fn shard(&self) -> ShardId {
        self.shard
    }

    /// Position of this slot among its shard's slots; the waterfall
    /// preserves this order within a shard.
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn strategy(&self) -> LoadStrategy {
        self.strategy
    }

    pub fn is_done(&self) -> bool {
        self.done.load(Ordering::Acquire)
    }

    /// Documents pushed into this slot over the whole load.
    pub fn docs_received(&self) -> u64 {
        self.received.load(Ordering::Relaxed)
    }

    pub fn queue_len(&self) -> usize {
        self.queue.len()
    }

    pub fn buffered_docs(&self) -> usize {
        self.buffer.lock().docs.len()
    }

    fn push(&self, batch: Batch) -> Result<()> {
        self.received.fetch_add(batch.len() as u64, Ordering::Relaxed);
        match self.strategy {
            LoadStrategy::Direct => self
                .queue
                .push(batch)
                .map_err(|_| anyhow!("queue slot for chunk {} is closed", self.chunk)),
            LoadStrategy::Ram => {
                let mut buffer = self.buffer.lock();
                buffer.bytes += batch.bytes();
                buffer.docs.extend(batch.into_docs());
                Ok(())
            }
            LoadStrategy::Disk => {
                let mut buffer = self.buffer.lock();
                buffer.bytes += batch.bytes();
                buffer.docs.extend(batch.into_docs());
                if buffer.bytes >= self.spill_limit {
                    self.spill(&mut buffer)
                        .with_context(|| format!("spilling chunk {}", self.chunk))?;
                }
                Ok(())
            }
        }
    }

    fn try_pop_direct(&self) -> Option<Batch> {
        self.queue.try_pop()
    }

    /// Write the buffered documents out as one sorted run.
    fn spill(&self, buffer: &mut SlotBuffer) -> Result<()> {
        if buffer.docs.is_empty() {
            return Ok(());
        }
        let pattern = Arc::clone(&self.pattern);
        buffer.docs.sort_by(|a, b| pattern.compare(&a.key, &b.key));
        let path = self
            .work_path
            .join(format!("chunk_{}_run{}.jsonl", self.chunk.0, buffer.runs.len()));
        let file = File::create(&path)?;
        let mut writer = BufWriter::new(file);
        for doc in &buffer.docs {
            serde_json::to_writer(&mut writer, doc)?;
            writer.write_all(b"\n")?;
        }
        writer.flush()?;
        tracing::debug!(chunk = %self.chunk, docs = buffer.docs.len(), path = %path.display(), "spilled run");
        buffer.runs.push(path);
        buffer.docs.clear();
        buffer.bytes = 0;
        Ok(())
    }

    /// Strategy-dependent finalization step: sort buffered documents (ram)
    /// or flush the tail run so the merge sees only sorted runs (disk).
    pub fn prep(&self) -> Result<()> {
        match self.strategy {
            LoadStrategy::Direct => Ok(()),
            LoadStrategy::Ram => {
                let mut buffer = self.buffer.lock();
                let pattern = Arc::clone(&self.pattern);
                buffer.docs.sort_by(|a, b| pattern.compare(&a.key, &b.key));
                Ok(())
            }
            LoadStrategy::Disk => {
                let mut buffer = self.buffer.lock();
                if buffer.runs.is_empty() {
                    // Everything still fits in memory; sort in place instead.
                    let pattern = Arc::clone(&self.pattern);
                    buffer.docs.sort_by(|a, b| pattern.compare(&a.key, &b.key));
                    Ok(())
                } else {
                    self.spill(&mut buffer)
                }
            }
        }
    }

    /// Push every remaining batch to the shard's end-point pool and wait
    /// for completion.
    pub fn do_load(&self, pool: &EndPointPool, batch_size: usize) -> Result<()> {
        let (tx, rx) = crossbeam_channel::unbounded();
        match self.strategy {
            LoadStrategy::Direct => {
                while let Some(batch) = self.queue.try_pop() {
                    pool.submit(WriteTask::tracked(batch, tx.clone()));
                }
            }
            LoadStrategy::Ram => {
                let docs = std::mem::take(&mut self.buffer.lock().docs);
                self.submit_rebatched(pool, docs, batch_size, &tx);
            }
            LoadStrategy::Disk => {
                let (docs, runs) = {
                    let mut buffer = self.buffer.lock();
                    (std::mem::take(&mut buffer.docs), std::mem::take(&mut buffer.runs))
                };
                if runs.is_empty() {
                    self.submit_rebatched(pool, docs, batch_size, &tx);
                } else {
                    self.merge_runs(pool, runs, batch_size, &tx)?;
                }
            }
        }
        drop(tx);
        // Completion channel closes once every submitted task has been
        // written, dropped, or accounted as failed.
        for _ in rx.iter() {}
        self.done.store(true, Ordering::Release);
        Ok(())
    }

    fn submit_rebatched(
        &self,
        pool: &EndPointPool,
        mut docs: Vec<KeyedDoc>,
        batch_size: usize,
        tx: &crossbeam_channel::Sender<()>,
    ) {
        while !docs.is_empty() {
            let tail = docs.split_off(docs.len().min(batch_size.max(1)));
            let batch = Batch::from_docs(self.chunk, docs);
            docs = tail;
            pool.submit(WriteTask::tracked(batch, tx.clone()));
        }
    }

    /// K-way merge of the sorted spill runs, re-batching on the fly.
    fn merge_runs(
        &self,
        pool: &EndPointPool,
        runs: Vec<PathBuf>,
        batch_size: usize,
        tx: &crossbeam_channel::Sender<()>,
    ) -> Result<()> {
        let mut readers = Vec::with_capacity(runs.len());
        for path in &runs {
            readers.push(RunReader::open(path)?);
        }
        let mut heads: Vec<Option<KeyedDoc>> = Vec::with_capacity(readers.len());
        for reader in &mut readers {
            heads.push(reader.next()?);
        }

        let mut group: Vec<KeyedDoc> = Vec::with_capacity(batch_size);
        loop {
            let mut min_at: Option<usize> = None;
            for (i, head) in heads.iter().enumerate() {
                let Some(doc) = head else { continue };
                min_at = match min_at {
                    None => Some(i),
                    Some(j) => {
                        let current = heads[j].as_ref().map(|d| &d.key);
                        if let Some(current) = current {
                            if self.pattern.compare(&doc.key, current) == std::cmp::Ordering::Less {
                                Some(i)
                            } else {
                                Some(j)
                            }
                        } else {
                            Some(i)
                        }
                    }
                };
            }
            let Some(i) = min_at else { break };
            let doc = heads[i].take().ok_or_else(|| anyhow!("merge head vanished"))?;
            heads[i] = readers[i].next()?;
            group.push(doc);
            if group.len() >= batch_size.max(1) {
                let batch = Batch::from_docs(self.chunk, std::mem::take(&mut group));
                pool.submit(WriteTask::tracked(batch, tx.clone()));
            }
        }
        if !group.is_empty() {
            pool.submit(WriteTask::tracked(Batch::from_docs(self.chunk, group), tx.clone()));
        }
        for path in runs {
            let _ = std::fs::remove_file(path);
        }
        Ok(())
    }

    fn close(&self) {
        self.queue.end_wait();
    }
}

struct RunReader {
    stream: serde_json::StreamDeserializer<
        'static,
        serde_json::de::IoRead<BufReader<File>>,
        KeyedDoc,
    >,
}

impl RunReader {
    fn open(path: &Path) -> Result<Self> {
        let file =
            File::open(path).with_context(|| format!("opening run {}", path.display()))?;
        Ok(Self {
            stream: serde_json::Deserializer::from_reader(BufReader::new(file)).into_iter(),
        })
    }

    fn next(&mut self) -> Result<Option<KeyedDoc>> {
        match self.stream.next() {
            None => Ok(None),
            Some(doc) => Ok(Some(doc?)),
        }
    }
}

/// Owns every queue slot and the per-shard cursors the end-point workers
/// cycle while draining direct slots.
pub struct ChunkDispatcher {
    slots: Vec<Arc<QueueSlot>>,
    by_chunk: FxHashMap<ChunkId, Arc<QueueSlot>>,
    by_shard: Vec<(ShardId, Vec<Arc<QueueSlot>>)>,
    direct_slots: FxHashMap<ShardId, Vec<Arc<QueueSlot>>>,
    direct_cursors: FxHashMap<ShardId, RoundRobin<usize>>,
}

impl ChunkDispatcher {
    pub fn new(
        map: &ChunkMap,
        strategies: &[LoadStrategy],
        config: &DispatchConfig,
    ) -> Result<Self> {
        if strategies.is_empty() {
            anyhow::bail!("no load queues configured");
        }
        let pattern = Arc::new(map.pattern().clone());
        let has_disk = strategies.contains(&LoadStrategy::Disk);
        if has_disk {
            std::fs::create_dir_all(&config.work_path).with_context(|| {
                format!("creating work directory {}", config.work_path.display())
            })?;
        }
        let shard_ids = map.shards();
        let disk_per_shard = strategies
            .iter()
            .filter(|s| **s == LoadStrategy::Disk)
            .count();
        let disk_slots = disk_per_shard * shard_ids.len();
        let spill_limit = if disk_slots > 0 {
            ((config.spill_threshold / disk_slots as u64).max(1)) as usize
        } else {
            0
        };

        let mut slots = Vec::with_capacity(map.len());
        let mut by_chunk = FxHashMap::default();
        let mut by_shard = Vec::with_capacity(shard_ids.len());
        let mut direct_slots: FxHashMap<ShardId, Vec<Arc<QueueSlot>>> = FxHashMap::default();

        for shard in shard_ids {
            let mut shard_slots = Vec::new();
            for (index, chunk) in map.chunks_for(shard).into_iter().enumerate() {
                let strategy = strategies[index % strategies.len()];
                let slot = Arc::new(QueueSlot {
                    chunk: chunk.id,
                    shard,
                    index,
                    strategy,
                    pattern: Arc::clone(&pattern),
                    queue: WaitQueue::new(config.queue_size),
                    buffer: Mutex::new(SlotBuffer {
                        docs: Vec::new(),
                        bytes: 0,
                        runs: Vec::new(),
                    }),
                    spill_limit,
                    work_path: config.work_path.clone(),
                    received: AtomicU64::new(0),
                    done: AtomicBool::new(false),
                });
                slots.push(Arc::clone(&slot));
                by_chunk.insert(chunk.id, Arc::clone(&slot));
                if strategy == LoadStrategy::Direct {
                    direct_slots.entry(shard).or_default().push(Arc::clone(&slot));
                }
                shard_slots.push(slot);
            }
            by_shard.push((shard, shard_slots));
        }

        let direct_cursors = direct_slots
            .iter()
            .map(|(&shard, slots)| (shard, RoundRobin::new((0..slots.len()).collect())))
            .collect();

        Ok(Self {
            slots,
            by_chunk,
            by_shard,
            direct_slots,
            direct_cursors,
        })
    }

    /// Route a sealed batch to its chunk's slot. Blocks only on a full
    /// direct slot queue.
    pub fn push(&self, chunk: ChunkId, batch: Batch) -> Result<()> {
        let slot = self
            .by_chunk
            .get(&chunk)
            .ok_or_else(|| anyhow!("no queue slot for chunk {chunk}"))?;
        slot.push(batch)
    }

    /// One round-robin pass over a shard's direct slots; the first batch
    /// found is handed to the caller.
    pub fn next_direct_batch(&self, shard: ShardId) -> Option<Batch> {
        let slots = self.direct_slots.get(&shard)?;
        let cursor = self.direct_cursors.get(&shard)?;
        for _ in 0..slots.len() {
            let i = cursor.next()?;
            if let Some(batch) = slots[i].try_pop_direct() {
                return Some(batch);
            }
        }
        None
    }

    /// Finalization order: slot-index order within each shard, shards
    /// interleaved round-robin so no shard drains last.
    pub fn waterfall(&self) -> Vec<Arc<QueueSlot>> {
        let most = self
            .by_shard
            .iter()
            .map(|(_, slots)| slots.len())
            .max()
            .unwrap_or(0);
        let mut order = Vec::with_capacity(self.slots.len());
        for index in 0..most {
            for (_, slots) in &self.by_shard {
                if let Some(slot) = slots.get(index) {
                    order.push(Arc::clone(slot));
                }
            }
        }
        order
    }

    /// Reject any further pushes; buffered work is still drained.
    pub fn close(&self) {
        for slot in &self.slots {
            slot.close();
        }
    }

    pub fn slots(&self) -> &[Arc<QueueSlot>] {
        &self.slots
    }

    pub fn slot(&self, chunk: ChunkId) -> Option<&Arc<QueueSlot>> {
        self.by_chunk.get(&chunk)
    }
}
