//! # Loader
//!
//! Orchestrates one load: cluster setup (drops, balancer stop, sharding),
//! the staged pipeline (input → batcher → dispatcher → end points), and
//! the waterfall finalization that drains every buffered queue slot.

use crate::batcher::{BatcherContext, BatcherPool};
use crate::cluster::Cluster;
use crate::config::{Settings, BALANCER_STOP_TIMEOUT_SECS};
use crate::dispatch::{ChunkDispatcher, DispatchConfig};
use crate::endpoint::EndPointHolder;
use crate::input::{DocumentSink, InputProcessor};
use crate::stats::{append_stats_line, format_minutes, LoadStats, StatsSnapshot};
use crate::sync::{ThreadPool, WaitQueue};
use anyhow::{bail, Context, Result};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, warn};

/// Outcome of a completed load.
#[derive(Debug, Clone)]
pub struct LoadSummary {
    pub load_seconds: u64,
    pub read_seconds: u64,
    pub stats: StatsSnapshot,
}

/// One bulk load against one cluster. Construction runs the fatal setup
/// phase; `run` drives the pipeline and never aborts on per-document or
/// per-batch failures.
pub struct Loader {
    settings: Settings,
    cluster: Arc<dyn Cluster>,
    ram_max: u64,
    threads_max: usize,
    stats: Arc<LoadStats>,
}

impl std::fmt::Debug for Loader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Loader")
            .field("settings", &self.settings)
            .field("ram_max", &self.ram_max)
            .field("threads_max", &self.threads_max)
            .field("stats", &self.stats)
            .finish_non_exhaustive()
    }
}

impl Loader {
    pub fn new(mut settings: Settings, cluster: Arc<dyn Cluster>) -> Result<Self> {
        settings.process()?;
        cluster.load_topology()?;

        let mut system = sysinfo::System::new();
        system.refresh_memory();
        let ram_max = system.available_memory();

        let threads_max = settings.threads_resolved();
        let loader = Self {
            settings,
            cluster,
            ram_max,
            threads_max,
            stats: Arc::new(LoadStats::new()),
        };
        loader.setup_load()?;
        Ok(loader)
    }

    pub fn stats(&self) -> Arc<LoadStats> {
        Arc::clone(&self.stats)
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// Fatal setup: anything failing here aborts before the pipeline starts.
    fn setup_load(&self) -> Result<()> {
        let settings = &self.settings;
        if !self.cluster.is_sharded() {
            bail!("only sharded clusters are supported");
        }

        if settings.stop_balancer {
            self.cluster.balancer_stop()?;
        }

        if settings.drop_db {
            self.cluster.drop_database(&settings.database)?;
        } else if settings.drop_coll {
            self.cluster.drop_collection(&settings.ns())?;
        } else if settings.drop_indexes {
            self.cluster.drop_indexes(&settings.ns())?;
        }

        if settings.stop_balancer {
            self.cluster
                .stop_balancer_wait(Duration::from_secs(BALANCER_STOP_TIMEOUT_SECS))
                .context("unable to stop the balancer")?;
        }

        if settings.sharded {
            let pattern = settings.key_pattern()?;
            self.cluster
                .enable_sharding(&settings.database)
                .with_context(|| format!("sharding database {} failed", settings.database))?;
            if pattern.is_hashed() {
                let total = settings.chunks_per_shard() * self.cluster.shards().len();
                self.cluster
                    .shard_collection(&settings.ns(), pattern, settings.shard_key_unique, Some(total))
                    .with_context(|| format!("sharding collection {} failed", settings.ns()))?;
                self.cluster
                    .wait_for_chunks_per_shard(&settings.ns(), settings.chunks_per_shard())?;
            } else {
                // No pre-split for ranged keys: nothing is known about the
                // data yet.
                self.cluster
                    .shard_collection(&settings.ns(), pattern, settings.shard_key_unique, None)
                    .with_context(|| format!("sharding collection {} failed", settings.ns()))?;
            }
        }
        Ok(())
    }

    /// Drive the full pipeline: input, batching, dispatch, waterfall
    /// finalization, shutdown, and the optional stats row.
    pub fn run(&self, input: &mut dyn InputProcessor) -> Result<LoadSummary> {
        let settings = &self.settings;
        let ns = settings.ns();
        let pattern = settings.key_pattern()?;
        let load_timer = Instant::now();

        info!(
            threads = self.threads_max,
            ram_mb = self.ram_max / 1024 / 1024,
            ns = %ns,
            "starting read of data"
        );

        let map = Arc::new(
            self.cluster
                .chunk_map(&ns, pattern)
                .context("loading chunk map")?,
        );
        let dispatch_config = DispatchConfig {
            queue_size: settings.dispatch.queue_size,
            work_path: settings.dispatch.work_path.clone(),
            spill_threshold: settings
                .dispatch
                .spill_threshold
                .unwrap_or_else(|| (self.ram_max / 2).max(1)),
            batch_size: settings.batcher.batch_size,
        };
        let dispatcher = Arc::new(ChunkDispatcher::new(
            &map,
            settings.load_queues(),
            &dispatch_config,
        )?);

        let holder = Arc::new(EndPointHolder::new(
            &settings.end_point,
            &ns,
            settings.dispatch.write_concern,
            &map.shards(),
            &self.stats,
        ));
        holder.start(self.cluster.as_ref(), &dispatcher)?;

        let inbox = Arc::new(WaitQueue::new(settings.batcher.queue_size));
        let context = BatcherContext::new(
            Arc::clone(&inbox),
            Arc::clone(&map),
            Arc::clone(&dispatcher),
            settings.batcher.batch_size,
            settings.add_id,
            Arc::clone(&self.stats),
        );
        let batchers = BatcherPool::start(&context, self.threads_max);

        let read_timer = Instant::now();
        let sink = DocumentSink::new(Arc::clone(&inbox), Arc::clone(&self.stats));
        let input_result = input.start(sink).and_then(|()| input.wait());
        let read_seconds = read_timer.elapsed().as_secs();
        if let Err(err) = input_result {
            // Unwind the pipeline before surfacing the input failure so no
            // worker thread is left parked.
            inbox.end_wait();
            batchers.join();
            dispatcher.close();
            holder.graceful_shutdown_join();
            return Err(err);
        }

        // Input is closed; batchers drain the inbox, flush their partial
        // builders, and exit.
        batchers.join();
        dispatcher.close();

        info!("entering finalize phase");
        let waterfall = Arc::new(Mutex::new(VecDeque::from(dispatcher.waterfall())));
        let batch_size = settings.batcher.batch_size;
        let finalizers = ThreadPool::new(self.threads_max);
        for _ in 0..self.threads_max {
            let waterfall = Arc::clone(&waterfall);
            let holder = Arc::clone(&holder);
            finalizers.queue(move || loop {
                let Some(slot) = waterfall.lock().pop_front() else {
                    break;
                };
                if let Err(err) = slot.prep() {
                    warn!(chunk = %slot.chunk(), error = %err, "prep failed, flushing unsorted");
                }
                let Some(pool) = holder.pool(slot.shard()) else {
                    warn!(shard = %slot.shard(), "no end point pool for shard");
                    continue;
                };
                if let Err(err) = slot.do_load(pool, batch_size) {
                    warn!(chunk = %slot.chunk(), error = %err, "finalize load failed");
                }
            });
        }
        finalizers.end_wait_initiate();
        finalizers.join_all();

        holder.graceful_shutdown_join();

        let load_seconds = load_timer.elapsed().as_secs();
        let stats = self.stats.snapshot();
        info!(
            load_time = %format_minutes(load_seconds),
            read_time = %format_minutes(read_seconds),
            accepted = stats.accepted,
            written = stats.docs_written,
            rejected = stats.rejected,
            failed = stats.write_failures,
            "load complete"
        );

        if let Some(path) = &settings.stats_file {
            if let Err(err) = append_stats_line(path, settings, load_seconds, read_seconds) {
                warn!(path = %path.display(), error = %err, "failed to write stats line");
            }
        }

        Ok(LoadSummary {
            load_seconds,
            read_seconds,
            stats,
        })
    }
}
