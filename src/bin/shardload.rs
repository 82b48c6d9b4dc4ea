//! Bulk-load harness: reads JSON-lines files from a directory and drives
//! the full pipeline against an in-memory sharded cluster.
//!
//! Usage:
//! ```bash
//! cargo run --bin shardload -- \
//!   --connstr localhost:27017 \
//!   --db test --collection load \
//!   --sharded --shard-key '{"user_id": "hashed"}' \
//!   --load-queues '{"direct": 2, "ram": 1}' \
//!   --load-dir ./data --file-regex '\.json$' \
//!   --shards 3
//! ```

use anyhow::{bail, Result};
use shardloader::{FileInputProcessor, Loader, MemoryCluster, Settings};
use std::path::PathBuf;
use std::sync::Arc;

struct HarnessArgs {
    settings: Settings,
    sim_shards: u16,
}

fn usage() -> ! {
    eprintln!(
        "shardload [options]\n\
         \n\
         --connstr <str>          cluster connection string\n\
         --db <name>              destination database (default: test)\n\
         --collection <name>      destination collection (default: load)\n\
         --sharded                shard the destination namespace\n\
         --shard-key <json>       ordered key document, e.g. '{{\"uid\": \"hashed\"}}'\n\
         --shard-key-unique       declare the shard-key index unique\n\
         --add-id                 synthesize _id when the key includes it\n\
         --drop-db | --drop-coll | --drop-indexes\n\
         --no-stop-balancer       leave the balancer running\n\
         --load-queues <json>     queues per shard, e.g. '{{\"direct\": 2}}'\n\
         --threads <n>            0 = 2x hardware, negative = hardware - n\n\
         --batch-size <n>         documents per sealed batch\n\
         --queue-size <n>         batcher inbox capacity\n\
         --endpoint-threads <n>   connections per shard\n\
         --direct                 bypass the routing tier\n\
         --work-path <dir>        disk-spill directory\n\
         --stats-file <path>      append a CSV stats row\n\
         --stats-note <str>       note column for the stats row\n\
         --input-type <type>      input format (json)\n\
         --load-dir <dir>         directory of input files\n\
         --file-regex <re>        input file name filter\n\
         --shards <n>             simulated cluster shard count (default: 2)"
    );
    std::process::exit(2);
}

fn parse_args() -> Result<HarnessArgs> {
    let mut settings = Settings::default();
    let mut sim_shards: u16 = 2;
    let mut args = std::env::args().skip(1);

    macro_rules! value {
        ($flag:expr) => {
            match args.next() {
                Some(v) => v,
                None => bail!("{} requires a value", $flag),
            }
        };
    }

    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--connstr" => settings.connstr = value!("--connstr"),
            "--db" => settings.database = value!("--db"),
            "--collection" => settings.collection = value!("--collection"),
            "--sharded" => settings.sharded = true,
            "--shard-key" => settings.shard_key_json = value!("--shard-key"),
            "--shard-key-unique" => settings.shard_key_unique = true,
            "--add-id" => settings.add_id = true,
            "--drop-db" => settings.drop_db = true,
            "--drop-coll" => settings.drop_coll = true,
            "--drop-indexes" => settings.drop_indexes = true,
            "--no-stop-balancer" => settings.stop_balancer = false,
            "--load-queues" => settings.load_queue_json = value!("--load-queues"),
            "--threads" => settings.threads = value!("--threads").parse()?,
            "--batch-size" => settings.batcher.batch_size = value!("--batch-size").parse()?,
            "--queue-size" => settings.batcher.queue_size = value!("--queue-size").parse()?,
            "--endpoint-threads" => {
                settings.end_point.thread_count = value!("--endpoint-threads").parse()?
            }
            "--direct" => settings.end_point.direct_load = true,
            "--work-path" => settings.work_path = PathBuf::from(value!("--work-path")),
            "--stats-file" => settings.stats_file = Some(PathBuf::from(value!("--stats-file"))),
            "--stats-note" => settings.stats_note = value!("--stats-note"),
            "--input-type" => settings.input_type = value!("--input-type"),
            "--load-dir" => settings.load_dir = PathBuf::from(value!("--load-dir")),
            "--file-regex" => settings.file_regex = value!("--file-regex"),
            "--shards" => sim_shards = value!("--shards").parse()?,
            "-h" | "--help" => usage(),
            other => {
                eprintln!("unknown option: {other}\n");
                usage();
            }
        }
    }

    if settings.connstr.is_empty() {
        settings.connstr = "localhost:27017".to_string();
    }
    Ok(HarnessArgs {
        settings,
        sim_shards,
    })
}

fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let args = parse_args()?;
    let cluster = Arc::new(MemoryCluster::new(args.sim_shards));
    let loader = Loader::new(args.settings, cluster.clone())?;

    let settings = loader.settings();
    let mut input = FileInputProcessor::new(
        settings.threads_resolved(),
        &settings.input_type,
        settings.load_dir.clone(),
        &settings.file_regex,
    )?;
    let ns = settings.ns();

    let summary = loader.run(&mut input)?;

    println!(
        "Load time: {}m{}s",
        summary.load_seconds / 60,
        summary.load_seconds % 60
    );
    println!(
        "Read time: {}m{}s",
        summary.read_seconds / 60,
        summary.read_seconds % 60
    );
    println!(
        "Accepted: {}  Written: {}  Rejected: {}  Failed: {}",
        summary.stats.accepted,
        summary.stats.docs_written,
        summary.stats.rejected,
        summary.stats.write_failures
    );
    println!("Destination {} now holds {} documents", ns, cluster.doc_count(&ns));
    Ok(())
}
