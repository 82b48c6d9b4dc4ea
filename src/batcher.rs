//! # Batcher Pool
//!
//! Worker threads that pop parsed documents from the inbox, extract the
//! shard key, resolve the owning chunk against the frozen chunk map, and
//! append to that chunk's builder. Full builders are sealed inside the
//! per-chunk critical section and pushed to the dispatcher outside it.

use crate::batch::{BatchBuilder, KeyedDoc};
use crate::dispatch::ChunkDispatcher;
use crate::model::{ChunkId, Document, IdSource};
use crate::routing::ChunkMap;
use crate::stats::LoadStats;
use crate::sync::WaitQueue;
use parking_lot::{Mutex, RwLock};
use rustc_hash::FxHashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use tracing::warn;

/// State shared by every batcher worker.
pub struct BatcherContext {
    inbox: Arc<WaitQueue<Document>>,
    map: Arc<ChunkMap>,
    dispatcher: Arc<ChunkDispatcher>,
    builders: RwLock<FxHashMap<ChunkId, Arc<Mutex<BatchBuilder>>>>,
    batch_size: usize,
    ids: Option<IdSource>,
    stats: Arc<LoadStats>,
    active: AtomicUsize,
}

impl BatcherContext {
    pub fn new(
        inbox: Arc<WaitQueue<Document>>,
        map: Arc<ChunkMap>,
        dispatcher: Arc<ChunkDispatcher>,
        batch_size: usize,
        synthesize_ids: bool,
        stats: Arc<LoadStats>,
    ) -> Arc<Self> {
        Arc::new(Self {
            inbox,
            map,
            dispatcher,
            builders: RwLock::new(FxHashMap::default()),
            batch_size: batch_size.max(1),
            ids: synthesize_ids.then(IdSource::new),
            stats,
            active: AtomicUsize::new(0),
        })
    }

    fn builder(&self, chunk: ChunkId) -> Arc<Mutex<BatchBuilder>> {
        if let Some(builder) = self.builders.read().get(&chunk) {
            return Arc::clone(builder);
        }
        let mut builders = self.builders.write();
        Arc::clone(
            builders
                .entry(chunk)
                .or_insert_with(|| Arc::new(Mutex::new(BatchBuilder::new(chunk, self.batch_size)))),
        )
    }

    fn route(&self, mut doc: Document) {
        let key = match self
            .map
            .pattern()
            .extract(&mut doc.body, self.ids.as_ref())
        {
            Ok(key) => key,
            Err(err) => {
                self.stats.add_rejected(1);
                warn!(error = %err, "rejecting document");
                return;
            }
        };
        let Some(chunk) = self.map.locate(&key) else {
            self.stats.add_rejected(1);
            warn!("rejecting document: no chunk owns its shard key");
            return;
        };
        let chunk_id = chunk.id;

        let builder = self.builder(chunk_id);
        let sealed = {
            let mut builder = builder.lock();
            builder.append(KeyedDoc {
                key,
                body: doc.body,
                bytes: doc.bytes_hint,
            });
            self.stats.add_accepted(1);
            builder.is_full().then(|| builder.seal())
        };
        if let Some(batch) = sealed {
            self.stats.add_batches_sealed(1);
            if let Err(err) = self.dispatcher.push(chunk_id, batch) {
                warn!(chunk = %chunk_id, error = %err, "failed to dispatch sealed batch");
            }
        }
    }

    /// Seal and push every non-empty builder; run by the last worker out.
    fn flush_partials(&self) {
        let builders = self.builders.read();
        for (&chunk, builder) in builders.iter() {
            let sealed = {
                let mut builder = builder.lock();
                (!builder.is_empty()).then(|| builder.seal())
            };
            if let Some(batch) = sealed {
                self.stats.add_batches_sealed(1);
                if let Err(err) = self.dispatcher.push(chunk, batch) {
                    warn!(chunk = %chunk, error = %err, "failed to dispatch final batch");
                }
            }
        }
    }
}

/// The batcher worker threads. Workers exit when the inbox reaches its
/// terminal empty state; the last one flushes all partial builders.
pub struct BatcherPool {
    workers: Vec<JoinHandle<()>>,
}

impl BatcherPool {
    pub fn start(context: &Arc<BatcherContext>, threads: usize) -> Self {
        let threads = threads.max(1);
        context.active.store(threads, Ordering::Release);
        let workers = (0..threads)
            .map(|_| {
                let context = Arc::clone(context);
                std::thread::spawn(move || {
                    while let Some(doc) = context.inbox.pop() {
                        context.route(doc);
                    }
                    if context.active.fetch_sub(1, Ordering::AcqRel) == 1 {
                        context.flush_partials();
                    }
                })
            })
            .collect();
        Self { workers }
    }

    pub fn join(self) {
        for worker in self.workers {
            let _ = worker.join();
        }
    }
}
