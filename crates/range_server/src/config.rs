//! Runtime configuration for the range server node.

use std::path::PathBuf;

use crate::error::{Error, Result};

/// Floor for the scanner TTL; smaller configured values are clamped.
pub const MIN_SCANNER_TTL_MS: u64 = 10_000;
/// Floor for the maintenance timer interval; smaller values are fatal.
pub const MIN_TIMER_INTERVAL_MS: u64 = 1_000;

/// All recognized configuration knobs.
#[derive(Clone, Debug)]
pub struct Config {
    /// Listen port, used only to derive the server location name.
    pub port: u16,
    /// Namespace root in the coordinator and DFS.
    pub toplevel_dir: String,
    /// Local directory standing in for the DFS.
    pub data_root: PathBuf,
    /// Server location name; derived from host/port when empty.
    pub location: String,
    /// Per-range split threshold in bytes.
    pub range_max_bytes: u64,
    /// Split threshold for METADATA ranges; 0 disables the extra check.
    pub range_metadata_max_bytes: u64,
    pub access_group_max_files: u32,
    pub access_group_merge_files: u32,
    /// Memtable size that marks an access group for compaction.
    pub access_group_max_mem: u64,
    pub maintenance_threads: usize,
    /// Idle scanner expiry in milliseconds.
    pub scanner_ttl_ms: u64,
    /// Periodic maintenance tick in milliseconds.
    pub timer_interval_ms: u64,
    /// Tolerated clock skew in microseconds.
    pub max_clock_skew_us: i64,
    pub block_cache_max_memory: u64,
    /// Commit log fragment rotation size.
    pub log_roll_limit: u64,
    /// Log cleanup threshold clamp; `None` derives from the roll limit.
    pub log_prune_threshold_min: Option<u64>,
    pub log_prune_threshold_max: Option<u64>,
    /// Upper bound for one scan response block.
    pub scan_block_bytes: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 38_060,
            toplevel_dir: "/tablestore".into(),
            data_root: PathBuf::from("./data"),
            location: String::new(),
            range_max_bytes: 256 * 1024 * 1024,
            range_metadata_max_bytes: 0,
            access_group_max_files: 10,
            access_group_merge_files: 4,
            access_group_max_mem: 64 * 1024 * 1024,
            maintenance_threads: 1,
            scanner_ttl_ms: 120_000,
            timer_interval_ms: 60_000,
            max_clock_skew_us: 60_000_000,
            block_cache_max_memory: 200 * 1024 * 1024,
            log_roll_limit: 100 * 1024 * 1024,
            log_prune_threshold_min: None,
            log_prune_threshold_max: None,
            scan_block_bytes: 64 * 1024,
        }
    }
}

impl Config {
    /// Validate and normalize. A too-small timer interval is fatal; a
    /// too-small scanner TTL is clamped with a warning.
    pub fn validate(mut self) -> Result<Self> {
        if self.timer_interval_ms < MIN_TIMER_INTERVAL_MS {
            return Err(Error::ConfigBadValue(format!(
                "Timer.Interval too small: {}",
                self.timer_interval_ms
            )));
        }
        if self.scanner_ttl_ms < MIN_SCANNER_TTL_MS {
            tracing::warn!(
                configured = self.scanner_ttl_ms,
                floor = MIN_SCANNER_TTL_MS,
                "Scanner.Ttl too small, clamping"
            );
            self.scanner_ttl_ms = MIN_SCANNER_TTL_MS;
        }
        if self.location.is_empty() {
            self.location = format!("127.0.0.1_{}", self.port);
        }
        Ok(self)
    }

    /// Coordinator namespace node of this server's existence file.
    pub fn server_namespace(&self) -> String {
        format!("{}/servers/{}", self.toplevel_dir, self.location)
    }

    /// Coordinator namespace node carrying the ROOT location attribute.
    pub fn root_namespace(&self) -> String {
        format!("{}/root", self.toplevel_dir)
    }

    /// Coordinator namespace node of a table (schema attribute lives here).
    pub fn table_namespace(&self, table_name: &str) -> String {
        format!("{}/tables/{}", self.toplevel_dir, table_name)
    }

    /// Local commit log directory for this server.
    pub fn log_dir(&self) -> PathBuf {
        self.data_root
            .join("servers")
            .join(&self.location)
            .join("log")
    }

    /// Local data directory of one table.
    pub fn table_dir(&self, table_name: &str) -> PathBuf {
        self.data_root.join("tables").join(table_name)
    }

    /// Effective log prune threshold clamp.
    pub fn prune_thresholds(&self) -> (u64, u64) {
        let min = self
            .log_prune_threshold_min
            .unwrap_or(2 * self.log_roll_limit);
        let max = self.log_prune_threshold_max.unwrap_or(10 * min);
        (min, max)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn small_timer_interval_is_fatal() {
        let config = Config {
            timer_interval_ms: 500,
            ..Default::default()
        };
        let err = config.validate().expect_err("too small");
        assert!(matches!(err, Error::ConfigBadValue(_)));
    }

    #[test]
    fn small_scanner_ttl_is_clamped() {
        let config = Config {
            scanner_ttl_ms: 1_000,
            ..Default::default()
        };
        let config = config.validate().expect("clamped");
        assert_eq!(config.scanner_ttl_ms, MIN_SCANNER_TTL_MS);
    }

    #[test]
    fn prune_thresholds_derive_from_roll_limit() {
        let config = Config {
            log_roll_limit: 1_000,
            ..Default::default()
        };
        assert_eq!(config.prune_thresholds(), (2_000, 20_000));

        let config = Config {
            log_prune_threshold_min: Some(50),
            log_prune_threshold_max: Some(75),
            ..Default::default()
        };
        assert_eq!(config.prune_thresholds(), (50, 75));
    }
}
