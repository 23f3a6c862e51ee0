//! Range server binary entry point.

use std::io::IsTerminal;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;

use range_server::{Config, FsCoordinator, LogOnlyMaster, RangeServer};

/// CLI options for running a range server node.
#[derive(Parser, Debug)]
#[command(name = "range-server")]
struct Args {
    /// Listen port, used to derive the server location name.
    #[arg(long, env = "RANGESERVER_PORT", default_value_t = 38_060)]
    port: u16,

    /// Local directory standing in for the distributed file system.
    #[arg(long, env = "RANGESERVER_DATA_DIR", default_value = "./data")]
    data_dir: PathBuf,

    /// Namespace root in the coordinator and DFS.
    #[arg(long, env = "RANGESERVER_TOPLEVEL_DIR", default_value = "/tablestore")]
    toplevel_dir: String,

    /// Explicit server location name (defaults to host_port).
    #[arg(long, env = "RANGESERVER_LOCATION", default_value = "")]
    location: String,

    /// Per-range split threshold in bytes.
    #[arg(long, env = "RANGESERVER_RANGE_MAX_BYTES", default_value_t = 256 * 1024 * 1024)]
    range_max_bytes: u64,

    /// Split threshold for METADATA ranges (0 disables the extra check).
    #[arg(long, env = "RANGESERVER_RANGE_METADATA_MAX_BYTES", default_value_t = 0)]
    range_metadata_max_bytes: u64,

    /// Maximum on-disk file count per access group before merging.
    #[arg(long, env = "RANGESERVER_AG_MAX_FILES", default_value_t = 10)]
    access_group_max_files: u32,

    /// File count merged per compaction pass.
    #[arg(long, env = "RANGESERVER_AG_MERGE_FILES", default_value_t = 4)]
    access_group_merge_files: u32,

    /// Memtable bytes that mark an access group for compaction.
    #[arg(long, env = "RANGESERVER_AG_MAX_MEMORY", default_value_t = 64 * 1024 * 1024)]
    access_group_max_mem: u64,

    /// Maintenance worker pool size.
    #[arg(long, env = "RANGESERVER_MAINTENANCE_THREADS", default_value_t = 1)]
    maintenance_threads: usize,

    /// Idle scanner expiry in milliseconds (min 10000).
    #[arg(long, env = "RANGESERVER_SCANNER_TTL_MS", default_value_t = 120_000)]
    scanner_ttl_ms: u64,

    /// Periodic maintenance tick in milliseconds (min 1000).
    #[arg(long, env = "RANGESERVER_TIMER_INTERVAL_MS", default_value_t = 60_000)]
    timer_interval_ms: u64,

    /// Tolerated clock skew in microseconds.
    #[arg(long, env = "RANGESERVER_CLOCK_SKEW_MAX_US", default_value_t = 60_000_000)]
    max_clock_skew_us: i64,

    /// File block cache budget in bytes.
    #[arg(long, env = "RANGESERVER_BLOCK_CACHE_MAX_MEMORY", default_value_t = 200 * 1024 * 1024)]
    block_cache_max_memory: u64,

    /// Commit log fragment rotation size in bytes.
    #[arg(long, env = "RANGESERVER_LOG_ROLL_LIMIT", default_value_t = 100 * 1024 * 1024)]
    log_roll_limit: u64,

    /// Log cleanup threshold clamp, minimum (defaults to 2x the roll limit).
    #[arg(long, env = "RANGESERVER_LOG_PRUNE_MIN")]
    log_prune_threshold_min: Option<u64>,

    /// Log cleanup threshold clamp, maximum (defaults to 10x the minimum).
    #[arg(long, env = "RANGESERVER_LOG_PRUNE_MAX")]
    log_prune_threshold_max: Option<u64>,
}

impl Args {
    fn into_config(self) -> Config {
        Config {
            port: self.port,
            toplevel_dir: self.toplevel_dir,
            data_root: self.data_dir,
            location: self.location,
            range_max_bytes: self.range_max_bytes,
            range_metadata_max_bytes: self.range_metadata_max_bytes,
            access_group_max_files: self.access_group_max_files,
            access_group_merge_files: self.access_group_merge_files,
            access_group_max_mem: self.access_group_max_mem,
            maintenance_threads: self.maintenance_threads,
            scanner_ttl_ms: self.scanner_ttl_ms,
            timer_interval_ms: self.timer_interval_ms,
            max_clock_skew_us: self.max_clock_skew_us,
            block_cache_max_memory: self.block_cache_max_memory,
            log_roll_limit: self.log_roll_limit,
            log_prune_threshold_min: self.log_prune_threshold_min,
            log_prune_threshold_max: self.log_prune_threshold_max,
            ..Config::default()
        }
    }
}

fn main() -> anyhow::Result<()> {
    // Enable ANSI colors only when stdout is a terminal and NO_COLOR is unset.
    let ansi = std::io::stdout().is_terminal() && std::env::var_os("NO_COLOR").is_none();
    tracing_subscriber::fmt()
        .with_ansi(ansi)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let args = Args::parse();
    let config = args
        .into_config()
        .validate()
        .context("invalid configuration")?;

    let coordinator = Arc::new(FsCoordinator::new(config.data_root.join("coordinator")));
    let server = RangeServer::start(config, coordinator, Arc::new(LogOnlyMaster))
        .context("range server startup failed")?;

    // Serve until the supervisor closes our stdin; the transport layer hands
    // requests to `RangeServer::dispatch`.
    let (shutdown_tx, shutdown_rx) = std::sync::mpsc::channel::<()>();
    watch_stdin_close(shutdown_tx);
    let _ = shutdown_rx.recv();

    server.shutdown();
    Ok(())
}

/// Signal shutdown once stdin reaches EOF. The supervisor stops the node by
/// closing its stdin pipe; no OS signal handling is installed here.
fn watch_stdin_close(tx: std::sync::mpsc::Sender<()>) {
    std::thread::Builder::new()
        .name("shutdown-wait".to_string())
        .spawn(move || {
            let mut sink = String::new();
            loop {
                sink.clear();
                match std::io::stdin().read_line(&mut sink) {
                    Ok(0) | Err(_) => break,
                    Ok(_) => continue,
                }
            }
            let _ = tx.send(());
        })
        .expect("spawn shutdown watch thread");
}
