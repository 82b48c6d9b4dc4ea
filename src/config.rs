//! # Load Settings
//!
//! The full configuration surface of a load run, plus the validation pass
//! that derives the runtime plan (key pattern, load queues, thread count)
//! before any pipeline component is built. Validation failures are fatal;
//! nothing aborts once the pipeline is running.

use crate::batch::{parse_load_queues, LoadStrategy};
use crate::model::{KeyPattern, Namespace, WriteConcern};
use anyhow::{bail, Context, Result};
use std::path::PathBuf;

/// Connection strings are normalized to carry this prefix.
pub const URI_PREFIX: &str = "mongodb://";

/// Balancer stop is given this long to take effect before the load aborts.
pub const BALANCER_STOP_TIMEOUT_SECS: u64 = 120;

/// Batcher stage settings.
#[derive(Debug, Clone)]
pub struct BatcherSettings {
    /// Capacity of the document inbox between the input adapter and the
    /// batcher workers.
    pub queue_size: usize,
    /// Documents per sealed batch.
    pub batch_size: usize,
}

impl Default for BatcherSettings {
    fn default() -> Self {
        Self {
            queue_size: 10_000,
            batch_size: 1_000,
        }
    }
}

/// Dispatcher stage settings.
#[derive(Debug, Clone)]
pub struct DispatchSettings {
    /// Capacity of each direct queue slot, in sealed batches.
    pub queue_size: usize,
    /// Directory for disk-spill runs. Mirrors the top-level `work_path`.
    pub work_path: PathBuf,
    /// Override for the disk-spill threshold; defaults to half the free
    /// RAM sampled at startup.
    pub spill_threshold: Option<u64>,
    pub write_concern: WriteConcern,
}

impl Default for DispatchSettings {
    fn default() -> Self {
        Self {
            queue_size: 10,
            work_path: PathBuf::from("."),
            spill_threshold: None,
            write_concern: WriteConcern::default(),
        }
    }
}

/// Retry policy for the end-point workers.
#[derive(Debug, Clone)]
pub struct RetrySettings {
    pub max_retries: u32,
    pub base_backoff_ms: u64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_retries: 5,
            base_backoff_ms: 50,
        }
    }
}

/// End-point pool settings.
#[derive(Debug, Clone)]
pub struct EndPointSettings {
    /// Persistent connections (and worker threads) per shard.
    pub thread_count: usize,
    /// Bypass the routing tier and write straight to shards.
    pub direct_load: bool,
    /// Capacity of each connection's inbound task queue.
    pub queue_size: usize,
    pub retry: RetrySettings,
}

impl Default for EndPointSettings {
    fn default() -> Self {
        Self {
            thread_count: 2,
            direct_load: false,
            queue_size: 100,
            retry: RetrySettings::default(),
        }
    }
}

/// Everything a load run can be told. `process()` must succeed before a
/// `Loader` is built from this.
#[derive(Debug, Clone)]
pub struct Settings {
    pub connstr: String,
    pub database: String,
    pub collection: String,
    pub sharded: bool,
    pub shard_key_json: String,
    pub shard_key_unique: bool,
    /// Synthesize `_id` when the key includes it and a document lacks it.
    pub add_id: bool,
    pub drop_db: bool,
    pub drop_coll: bool,
    pub drop_indexes: bool,
    pub stop_balancer: bool,
    /// `{"strategy": count, ...}` queues per shard.
    pub load_queue_json: String,
    /// 0 means twice the hardware concurrency; a negative value means
    /// hardware concurrency minus that many.
    pub threads: i64,
    pub batcher: BatcherSettings,
    pub dispatch: DispatchSettings,
    pub end_point: EndPointSettings,
    pub work_path: PathBuf,
    pub stats_file: Option<PathBuf>,
    pub stats_note: String,
    pub input_type: String,
    pub load_dir: PathBuf,
    pub file_regex: String,

    key_pattern: Option<KeyPattern>,
    load_queues: Vec<LoadStrategy>,
    resolved_threads: usize,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            connstr: String::new(),
            database: "test".to_string(),
            collection: "load".to_string(),
            sharded: false,
            shard_key_json: String::new(),
            shard_key_unique: false,
            add_id: false,
            drop_db: false,
            drop_coll: false,
            drop_indexes: false,
            stop_balancer: true,
            load_queue_json: r#"{"direct": 1}"#.to_string(),
            threads: 0,
            batcher: BatcherSettings::default(),
            dispatch: DispatchSettings::default(),
            end_point: EndPointSettings::default(),
            work_path: PathBuf::from("."),
            stats_file: None,
            stats_note: String::new(),
            input_type: "json".to_string(),
            load_dir: PathBuf::from("."),
            file_regex: String::from(".*"),
            key_pattern: None,
            load_queues: Vec::new(),
            resolved_threads: 0,
        }
    }
}

impl Settings {
    pub fn ns(&self) -> Namespace {
        Namespace::new(self.database.clone(), self.collection.clone())
    }

    /// Validate and derive the runtime plan. Every failure here is a
    /// configuration error reported once, before the pipeline exists.
    pub fn process(&mut self) -> Result<()> {
        if self.sharded && self.shard_key_json.is_empty() {
            bail!("no shard key for sharded setup");
        }
        if self.shard_key_json.is_empty() {
            // Unsharded loads still route; everything lands in one chunk.
            self.shard_key_json = r#"{"_id": 1}"#.to_string();
        }
        let pattern = KeyPattern::parse(&self.shard_key_json)?;
        if !pattern.includes_id() {
            self.add_id = false;
        }
        self.key_pattern = Some(pattern);

        self.load_queues = parse_load_queues(&self.load_queue_json)?;

        let hardware = std::thread::available_parallelism()
            .context("unable to determine hardware concurrency")?
            .get() as i64;
        self.resolved_threads = if self.threads == 0 {
            (hardware * 2) as usize
        } else if self.threads < 0 {
            let reduced = hardware + self.threads;
            if reduced < 1 {
                bail!(
                    "requested hardware threads ({hardware}) minus {}; that is less than 1",
                    self.threads.abs()
                );
            }
            reduced as usize
        } else {
            self.threads as usize
        };

        if self.end_point.thread_count == 0 {
            bail!("at least one end point connection per shard is required");
        }

        if self.end_point.direct_load {
            self.stop_balancer = true;
        }

        if !self.connstr.starts_with(URI_PREFIX) {
            self.connstr = format!("{URI_PREFIX}{}", self.connstr);
        }
        let hosts = &self.connstr[URI_PREFIX.len()..];
        if hosts.is_empty() || hosts.contains(char::is_whitespace) {
            bail!("unable to parse connection string: {}", self.connstr);
        }

        self.dispatch.work_path = self.work_path.clone();
        Ok(())
    }

    /// The parsed shard-key pattern. Only available after `process()`.
    pub fn key_pattern(&self) -> Result<&KeyPattern> {
        self.key_pattern
            .as_ref()
            .context("settings have not been processed")
    }

    /// The expanded per-shard queue list. Only available after `process()`.
    pub fn load_queues(&self) -> &[LoadStrategy] {
        &self.load_queues
    }

    pub fn chunks_per_shard(&self) -> usize {
        self.load_queues.len()
    }

    /// The resolved batcher thread count. Only available after `process()`.
    pub fn threads_resolved(&self) -> usize {
        self.resolved_threads
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base() -> Settings {
        Settings {
            connstr: "localhost:27017".to_string(),
            ..Settings::default()
        }
    }

    #[test]
    fn test_process_prefixes_connstr() {
        let mut settings = base();
        settings.process().unwrap();
        assert_eq!(settings.connstr, "mongodb://localhost:27017");
    }

    #[test]
    fn test_process_rejects_blank_connstr() {
        let mut settings = base();
        settings.connstr = String::new();
        assert!(settings.process().is_err());
    }

    #[test]
    fn test_sharded_requires_key() {
        let mut settings = base();
        settings.sharded = true;
        let err = settings.process().unwrap_err();
        assert!(err.to_string().contains("no shard key"));
    }

    #[test]
    fn test_threads_zero_doubles_hardware() {
        let mut settings = base();
        settings.process().unwrap();
        let hardware = std::thread::available_parallelism().unwrap().get();
        assert_eq!(settings.threads_resolved(), hardware * 2);
    }

    #[test]
    fn test_threads_negative_offsets_hardware() {
        let hardware = std::thread::available_parallelism().unwrap().get() as i64;
        let mut settings = base();
        settings.threads = -(hardware - 1);
        settings.process().unwrap();
        assert_eq!(settings.threads_resolved(), 1);

        let mut settings = base();
        settings.threads = -hardware;
        assert!(settings.process().is_err());
    }

    #[test]
    fn test_direct_load_forces_balancer_stop() {
        let mut settings = base();
        settings.stop_balancer = false;
        settings.end_point.direct_load = true;
        settings.process().unwrap();
        assert!(settings.stop_balancer);
    }

    #[test]
    fn test_add_id_dropped_without_id_in_key() {
        let mut settings = base();
        settings.sharded = true;
        settings.shard_key_json = r#"{"user_id": 1}"#.to_string();
        settings.add_id = true;
        settings.process().unwrap();
        assert!(!settings.add_id);

        let mut settings = base();
        settings.sharded = true;
        settings.shard_key_json = r#"{"_id": 1}"#.to_string();
        settings.add_id = true;
        settings.process().unwrap();
        assert!(settings.add_id);
    }

    #[test]
    fn test_empty_load_queues_fatal() {
        let mut settings = base();
        settings.load_queue_json = "{}".to_string();
        assert!(settings.process().is_err());
    }

    #[test]
    fn test_unsharded_defaults_to_id_routing() {
        let mut settings = base();
        settings.process().unwrap();
        assert!(settings.key_pattern().unwrap().includes_id());
        assert_eq!(settings.chunks_per_shard(), 1);
    }
}
