//! # Shardloader
//!
//! A staged, back-pressured bulk-load pipeline for sharded document
//! stores. Parsed documents flow through a batcher pool that routes each
//! one to the chunk owning its shard key, per-(shard, chunk) queue slots,
//! and per-shard end-point pools with round-robin connection cycling;
//! buffered state drains in a shard-interleaved waterfall at the end.

pub mod batch;
pub mod batcher;
pub mod cluster;
pub mod config;
pub mod dispatch;
pub mod endpoint;
pub mod input;
pub mod loader;
pub mod model;
pub mod routing;
pub mod stats;
pub mod sync;

// Re-export main types for convenience
pub use batch::{Batch, BatchBuilder, KeyedDoc, LoadStrategy};
pub use cluster::{Cluster, MemoryCluster, ShardConnection, WriteError, WriteErrorKind};
pub use config::{BatcherSettings, DispatchSettings, EndPointSettings, RetrySettings, Settings};
pub use dispatch::{ChunkDispatcher, DispatchConfig, QueueSlot};
pub use endpoint::{EndPointHolder, EndPointPool, WriteTask};
pub use input::{DocumentSink, FileInputProcessor, GeneratorInput, InputProcessor};
pub use loader::{LoadSummary, Loader};
pub use model::{
    ChunkId, Document, KeyOrder, KeyPattern, Namespace, ShardId, ShardKey, ShardKeyValue,
    WriteConcern,
};
pub use routing::{Chunk, ChunkMap};
pub use stats::{LoadStats, StatsSnapshot};
pub use sync::{RoundRobin, ThreadPool, WaitQueue};
