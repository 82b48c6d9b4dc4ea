//! # Load Statistics
//!
//! Atomic counters shared across the pipeline stages, and the optional
//! per-run CSV stats line.

use crate::config::Settings;
use anyhow::Result;
use std::fmt::Write as _;
use std::io::Write as _;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};

/// Pipeline-wide counters. Everything is monotonic and updated with
/// relaxed ordering; exact values are read after the pipeline has joined.
#[derive(Debug, Default)]
pub struct LoadStats {
    accepted: AtomicU64,
    rejected: AtomicU64,
    batches_sealed: AtomicU64,
    docs_written: AtomicU64,
    write_retries: AtomicU64,
    write_failures: AtomicU64,
    connections_evicted: AtomicU64,
}

impl LoadStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_accepted(&self, n: u64) {
        self.accepted.fetch_add(n, Ordering::Relaxed);
    }

    pub fn add_rejected(&self, n: u64) {
        self.rejected.fetch_add(n, Ordering::Relaxed);
    }

    pub fn add_batches_sealed(&self, n: u64) {
        self.batches_sealed.fetch_add(n, Ordering::Relaxed);
    }

    pub fn add_docs_written(&self, n: u64) {
        self.docs_written.fetch_add(n, Ordering::Relaxed);
    }

    pub fn add_write_retries(&self, n: u64) {
        self.write_retries.fetch_add(n, Ordering::Relaxed);
    }

    pub fn add_write_failures(&self, n: u64) {
        self.write_failures.fetch_add(n, Ordering::Relaxed);
    }

    pub fn add_connections_evicted(&self, n: u64) {
        self.connections_evicted.fetch_add(n, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            accepted: self.accepted.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            batches_sealed: self.batches_sealed.load(Ordering::Relaxed),
            docs_written: self.docs_written.load(Ordering::Relaxed),
            write_retries: self.write_retries.load(Ordering::Relaxed),
            write_failures: self.write_failures.load(Ordering::Relaxed),
            connections_evicted: self.connections_evicted.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of the counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub accepted: u64,
    pub rejected: u64,
    pub batches_sealed: u64,
    pub docs_written: u64,
    pub write_retries: u64,
    pub write_failures: u64,
    pub connections_evicted: u64,
}

/// `XmYs` wall-time rendering used in the summary log and the stats row.
pub fn format_minutes(seconds: u64) -> String {
    format!("{}m{}s", seconds / 60, seconds % 60)
}

/// Append one run's row to the stats file, writing the header first when
/// the file is empty.
pub fn append_stats_line(
    path: &Path,
    settings: &Settings,
    load_seconds: u64,
    read_seconds: u64,
) -> Result<()> {
    let mut file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)?;
    if file.metadata()?.len() == 0 {
        writeln!(
            file,
            "\"time(s)\",\"time\",\"bypass\",\"type\",\"input time(s)\",\"key\",\"queuing\",\
             \"queue size\",\"threads\",\"endpoint conns\",\"wc\",\"note\""
        )?;
    }
    let mut row = String::new();
    write!(row, "\"{load_seconds}\", ")?;
    write!(row, "\"{}\", ", format_minutes(load_seconds))?;
    write!(row, "\"{}\", ", settings.end_point.direct_load)?;
    write!(row, "\"{}\", ", settings.input_type)?;
    write!(row, "\"{read_seconds}\", ")?;
    write!(row, "\"{}\", ", settings.shard_key_json)?;
    write!(row, "\"{}\", ", settings.load_queue_json)?;
    write!(row, "\"{}\", ", settings.batcher.queue_size)?;
    write!(row, "\"{}\", ", settings.threads_resolved())?;
    write!(row, "\"{}\", ", settings.end_point.thread_count)?;
    write!(row, "\"{}\", ", settings.dispatch.write_concern)?;
    write!(row, "\"{}\"", settings.stats_note)?;
    writeln!(file, "{row}")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_minutes() {
        assert_eq!(format_minutes(0), "0m0s");
        assert_eq!(format_minutes(59), "0m59s");
        assert_eq!(format_minutes(61), "1m1s");
        assert_eq!(format_minutes(3600), "60m0s");
    }

    #[test]
    fn test_snapshot_reflects_counters() {
        let stats = LoadStats::new();
        stats.add_accepted(10);
        stats.add_docs_written(9);
        stats.add_write_failures(1);
        let snap = stats.snapshot();
        assert_eq!(snap.accepted, 10);
        assert_eq!(snap.docs_written, 9);
        assert_eq!(snap.write_failures, 1);
        assert_eq!(snap.connections_evicted, 0);
    }
}
