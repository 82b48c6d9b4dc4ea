//! # End-Point Pools
//!
//! Per-shard sets of persistent connections. Each end point owns one
//! connection, one bounded task queue, and one worker thread; a round-robin
//! cursor spreads submitted batches across the live connections. Idle
//! workers also cycle their shard's direct queue slots, which pairs K
//! connections with C chunk queues without per-pair threads.

use crate::batch::Batch;
use crate::cluster::{Cluster, ShardConnection};
use crate::config::{EndPointSettings, RetrySettings};
use crate::dispatch::ChunkDispatcher;
use crate::model::{Namespace, ShardId, WriteConcern};
use crate::stats::LoadStats;
use crate::sync::{RoundRobin, WaitQueue};
use anyhow::Result;
use parking_lot::Mutex;
use rand::Rng;
use rustc_hash::FxHashMap;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, warn};

/// How long an idle worker parks on its own queue between slot sweeps.
const IDLE_WAIT: Duration = Duration::from_millis(20);

/// A sealed batch on its way to one shard, with an optional completion
/// signal for finalization.
pub struct WriteTask {
    batch: Batch,
    done: Option<crossbeam_channel::Sender<()>>,
}

impl WriteTask {
    pub fn new(batch: Batch) -> Self {
        Self { batch, done: None }
    }

    /// A task whose completion (written, dropped, or failed) is signalled
    /// on the given channel.
    pub fn tracked(batch: Batch, done: crossbeam_channel::Sender<()>) -> Self {
        Self {
            batch,
            done: Some(done),
        }
    }

    pub fn batch(&self) -> &Batch {
        &self.batch
    }

    fn complete(self) {
        if let Some(done) = self.done {
            let _ = done.send(());
        }
    }
}

struct EndPoint {
    index: usize,
    queue: WaitQueue<WriteTask>,
}

/// Fixed set of connections to one shard.
pub struct EndPointPool {
    shard: ShardId,
    ns: Namespace,
    write_concern: WriteConcern,
    endpoints: Vec<Arc<EndPoint>>,
    cursor: RoundRobin<usize>,
    retry: RetrySettings,
    stats: Arc<LoadStats>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl EndPointPool {
    pub fn new(
        shard: ShardId,
        ns: Namespace,
        write_concern: WriteConcern,
        settings: &EndPointSettings,
        stats: Arc<LoadStats>,
    ) -> Self {
        let endpoints: Vec<Arc<EndPoint>> = (0..settings.thread_count.max(1))
            .map(|index| {
                Arc::new(EndPoint {
                    index,
                    queue: WaitQueue::new(settings.queue_size),
                })
            })
            .collect();
        let cursor = RoundRobin::new((0..endpoints.len()).collect());
        Self {
            shard,
            ns,
            write_concern,
            endpoints,
            cursor,
            retry: settings.retry.clone(),
            stats,
            workers: Mutex::new(Vec::new()),
        }
    }

    /// Open the connections and start one worker per end point.
    pub fn start(
        self: &Arc<Self>,
        cluster: &dyn Cluster,
        direct_load: bool,
        dispatcher: Arc<ChunkDispatcher>,
    ) -> Result<()> {
        let mut workers = self.workers.lock();
        for endpoint in &self.endpoints {
            let conn = if direct_load {
                cluster.connect(self.shard)?
            } else {
                cluster.connect_router()?
            };
            let pool = Arc::clone(self);
            let endpoint = Arc::clone(endpoint);
            let dispatcher = Arc::clone(&dispatcher);
            workers.push(std::thread::spawn(move || {
                pool.worker_loop(&endpoint, conn, &dispatcher);
            }));
        }
        Ok(())
    }

    fn worker_loop(
        &self,
        endpoint: &EndPoint,
        mut conn: Box<dyn ShardConnection>,
        dispatcher: &ChunkDispatcher,
    ) {
        loop {
            if let Some(task) = endpoint.queue.try_pop() {
                if !self.process(endpoint, &mut conn, task) {
                    return;
                }
                continue;
            }
            if let Some(batch) = dispatcher.next_direct_batch(self.shard) {
                if !self.process(endpoint, &mut conn, WriteTask::new(batch)) {
                    return;
                }
                continue;
            }
            match endpoint.queue.pop_timeout(IDLE_WAIT) {
                Some(task) => {
                    if !self.process(endpoint, &mut conn, task) {
                        return;
                    }
                }
                None => {
                    if endpoint.queue.is_ended() {
                        // Shutdown: one last sweep for straggler batches.
                        match dispatcher.next_direct_batch(self.shard) {
                            Some(batch) => {
                                if !self.process(endpoint, &mut conn, WriteTask::new(batch)) {
                                    return;
                                }
                            }
                            None => return,
                        }
                    }
                }
            }
        }
    }

    /// Send one task, absorbing retryable failures. Returns `false` when
    /// the connection has been evicted and the worker must retire.
    fn process(
        &self,
        endpoint: &EndPoint,
        conn: &mut Box<dyn ShardConnection>,
        task: WriteTask,
    ) -> bool {
        let mut attempt: u32 = 0;
        loop {
            match conn.write_batch(&self.ns, task.batch.docs(), self.write_concern) {
                Ok(report) => {
                    self.stats.add_docs_written(report.written as u64);
                    task.complete();
                    return true;
                }
                Err(err) if err.is_retryable() => {
                    attempt += 1;
                    self.stats.add_write_retries(1);
                    if attempt > self.retry.max_retries {
                        warn!(
                            shard = %self.shard,
                            endpoint = endpoint.index,
                            error = %err,
                            "retry budget exhausted, evicting connection"
                        );
                        self.evict(endpoint, task);
                        return false;
                    }
                    std::thread::sleep(self.backoff(attempt));
                }
                Err(err) => {
                    warn!(
                        shard = %self.shard,
                        docs = task.batch.len(),
                        error = %err,
                        "dropping batch after non-retryable write error"
                    );
                    self.stats.add_write_failures(task.batch.len() as u64);
                    task.complete();
                    return true;
                }
            }
        }
    }

    /// Remove the end point from rotation and move its work, including the
    /// failing task, onto the surviving connections.
    fn evict(&self, endpoint: &EndPoint, task: WriteTask) {
        self.stats.add_connections_evicted(1);
        self.cursor.remove(&endpoint.index);
        endpoint.queue.end_wait();
        self.submit(task);
        while let Some(queued) = endpoint.queue.try_pop() {
            self.submit(queued);
        }
    }

    fn backoff(&self, attempt: u32) -> Duration {
        let base = self.retry.base_backoff_ms.max(1);
        let exp = base.saturating_mul(1u64 << (attempt - 1).min(10));
        let jitter = rand::thread_rng().gen_range(0..=base);
        Duration::from_millis(exp + jitter)
    }

    /// Queue a task on the next connection in rotation. With every
    /// connection evicted the task is accounted as failed so waiting
    /// finalizers are not stranded.
    pub fn submit(&self, task: WriteTask) {
        let mut task = task;
        loop {
            let Some(index) = self.cursor.next() else {
                warn!(
                    shard = %self.shard,
                    docs = task.batch.len(),
                    "no live connections remain, dropping batch"
                );
                self.stats.add_write_failures(task.batch.len() as u64);
                task.complete();
                return;
            };
            match self.endpoints[index].queue.push(task) {
                Ok(()) => return,
                Err(rejected) => {
                    // The queue closed under us (eviction race); drop the
                    // connection from rotation and try the next one.
                    self.cursor.remove(&index);
                    task = rejected;
                }
            }
        }
    }

    pub fn shard(&self) -> ShardId {
        self.shard
    }

    /// Connections still in rotation.
    pub fn live_connections(&self) -> usize {
        self.cursor.len()
    }

    /// Tasks currently queued across all end points.
    pub fn queued_tasks(&self) -> usize {
        self.endpoints.iter().map(|ep| ep.queue.len()).sum()
    }

    /// Drain the queues and join every worker.
    pub fn graceful_shutdown_join(&self) {
        for endpoint in &self.endpoints {
            endpoint.queue.end_wait();
        }
        let handles: Vec<_> = self.workers.lock().drain(..).collect();
        for handle in handles {
            let _ = handle.join();
        }
        debug!(shard = %self.shard, "end point pool drained");
    }
}

/// All per-shard pools for one load.
pub struct EndPointHolder {
    pools: FxHashMap<ShardId, Arc<EndPointPool>>,
    direct_load: bool,
}

impl EndPointHolder {
    pub fn new(
        settings: &EndPointSettings,
        ns: &Namespace,
        write_concern: WriteConcern,
        shards: &[ShardId],
        stats: &Arc<LoadStats>,
    ) -> Self {
        let pools = shards
            .iter()
            .map(|&shard| {
                (
                    shard,
                    Arc::new(EndPointPool::new(
                        shard,
                        ns.clone(),
                        write_concern,
                        settings,
                        Arc::clone(stats),
                    )),
                )
            })
            .collect();
        Self {
            pools,
            direct_load: settings.direct_load,
        }
    }

    pub fn start(&self, cluster: &dyn Cluster, dispatcher: &Arc<ChunkDispatcher>) -> Result<()> {
        for pool in self.pools.values() {
            pool.start(cluster, self.direct_load, Arc::clone(dispatcher))?;
        }
        Ok(())
    }

    pub fn pool(&self, shard: ShardId) -> Option<&Arc<EndPointPool>> {
        self.pools.get(&shard)
    }

    pub fn queued_tasks(&self) -> usize {
        self.pools.values().map(|pool| pool.queued_tasks()).sum()
    }

    pub fn graceful_shutdown_join(&self) {
        for pool in self.pools.values() {
            pool.graceful_shutdown_join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch::{KeyedDoc, LoadStrategy};
    use crate::cluster::{MemoryCluster, WriteErrorKind};
    use crate::dispatch::DispatchConfig;
    use crate::model::{KeyPattern, ShardKey, ShardKeyValue};
    use crate::routing::ChunkMap;
    use crate::ChunkId;
    use serde_json::json;

    fn single_chunk_dispatcher(strategy: LoadStrategy) -> Arc<ChunkDispatcher> {
        let pattern = KeyPattern::parse(r#"{"n": 1}"#).unwrap();
        let map = ChunkMap::new(
            pattern,
            vec![crate::routing::Chunk {
                id: ChunkId(0),
                shard: ShardId(0),
                min: ShardKey::min(1),
                max: ShardKey::max(1),
            }],
        )
        .unwrap();
        Arc::new(
            ChunkDispatcher::new(
                &map,
                &[strategy],
                &DispatchConfig {
                    queue_size: 8,
                    work_path: std::path::PathBuf::from("."),
                    spill_threshold: 1 << 20,
                    batch_size: 100,
                },
            )
            .unwrap(),
        )
    }

    fn batch(values: &[i64]) -> Batch {
        Batch::from_docs(
            ChunkId(0),
            values
                .iter()
                .map(|&n| KeyedDoc {
                    key: ShardKey::single(ShardKeyValue::Int(n)),
                    body: json!({"n": n}),
                    bytes: 16,
                })
                .collect(),
        )
    }

    fn pool_settings(connections: usize) -> EndPointSettings {
        EndPointSettings {
            thread_count: connections,
            direct_load: true,
            queue_size: 16,
            retry: RetrySettings {
                max_retries: 2,
                base_backoff_ms: 1,
            },
        }
    }

    #[test]
    fn test_submitted_tasks_complete() {
        let cluster = MemoryCluster::new(1);
        let ns = Namespace::new("db", "c");
        let stats = Arc::new(LoadStats::new());
        let dispatcher = single_chunk_dispatcher(LoadStrategy::Ram);
        let pool = Arc::new(EndPointPool::new(
            ShardId(0),
            ns.clone(),
            WriteConcern::default(),
            &pool_settings(2),
            Arc::clone(&stats),
        ));
        pool.start(&cluster, true, Arc::clone(&dispatcher)).unwrap();

        let (tx, rx) = crossbeam_channel::unbounded();
        for i in 0..10 {
            pool.submit(WriteTask::tracked(batch(&[i, i + 100]), tx.clone()));
        }
        drop(tx);
        assert_eq!(rx.iter().count(), 10);

        pool.graceful_shutdown_join();
        assert_eq!(cluster.doc_count(&ns), 20);
        assert_eq!(stats.snapshot().docs_written, 20);
        assert_eq!(pool.queued_tasks(), 0);
    }

    #[test]
    fn test_retryable_failure_evicts_and_redistributes() {
        let cluster = MemoryCluster::new(1);
        cluster.fail_connection(ShardId(0), 0, WriteErrorKind::Retryable);
        let ns = Namespace::new("db", "c");
        let stats = Arc::new(LoadStats::new());
        let dispatcher = single_chunk_dispatcher(LoadStrategy::Ram);
        let pool = Arc::new(EndPointPool::new(
            ShardId(0),
            ns.clone(),
            WriteConcern::default(),
            &pool_settings(3),
            Arc::clone(&stats),
        ));
        pool.start(&cluster, true, Arc::clone(&dispatcher)).unwrap();

        let (tx, rx) = crossbeam_channel::unbounded();
        for i in 0..30 {
            pool.submit(WriteTask::tracked(batch(&[i]), tx.clone()));
        }
        drop(tx);
        assert_eq!(rx.iter().count(), 30);

        pool.graceful_shutdown_join();
        assert_eq!(cluster.doc_count(&ns), 30, "no batch may be lost");
        assert_eq!(pool.live_connections(), 2);
        assert_eq!(stats.snapshot().connections_evicted, 1);
    }

    #[test]
    fn test_non_retryable_failure_drops_batch_only() {
        let cluster = MemoryCluster::new(1);
        cluster.fail_connection(ShardId(0), 0, WriteErrorKind::NotRetryable);
        let ns = Namespace::new("db", "c");
        let stats = Arc::new(LoadStats::new());
        let dispatcher = single_chunk_dispatcher(LoadStrategy::Ram);
        let pool = Arc::new(EndPointPool::new(
            ShardId(0),
            ns.clone(),
            WriteConcern::default(),
            &pool_settings(1),
            Arc::clone(&stats),
        ));
        pool.start(&cluster, true, Arc::clone(&dispatcher)).unwrap();

        let (tx, rx) = crossbeam_channel::unbounded();
        pool.submit(WriteTask::tracked(batch(&[1, 2, 3]), tx.clone()));
        drop(tx);
        assert_eq!(rx.iter().count(), 1);

        pool.graceful_shutdown_join();
        assert_eq!(cluster.doc_count(&ns), 0);
        let snap = stats.snapshot();
        assert_eq!(snap.write_failures, 3);
        assert_eq!(snap.connections_evicted, 0);
        assert_eq!(pool.live_connections(), 1);
    }
}
