//! Server and per-range statistics snapshots.

use serde::Serialize;
use std::sync::atomic::Ordering;

use crate::server::RangeServer;

/// Statistics for one hosted range.
#[derive(Clone, Debug, Serialize)]
pub struct RangeStatistics {
    pub table_id: u32,
    pub table_name: String,
    pub start_row: String,
    pub end_row: String,
    pub cells: u64,
    pub memory_used: u64,
    pub disk_used: u64,
    pub latest_revision: i64,
    pub scan_count: u32,
    pub update_count: u32,
}

/// Snapshot returned by `get_statistics`.
#[derive(Clone, Debug, Serialize)]
pub struct ServerStatistics {
    pub location: String,
    pub bytes_loaded: u64,
    pub live_scanners: usize,
    pub block_cache_max_memory: u64,
    pub ranges: Vec<RangeStatistics>,
}

impl RangeServer {
    pub fn get_statistics(&self) -> ServerStatistics {
        let mut ranges = Vec::new();
        self.ctx.live_map.get_range_vector(&mut ranges);

        let range_stats = ranges
            .iter()
            .map(|range| {
                let spec = range.spec();
                RangeStatistics {
                    table_id: range.table().id,
                    table_name: range.table().name.clone(),
                    start_row: String::from_utf8_lossy(&spec.start_row).into_owned(),
                    end_row: String::from_utf8_lossy(&spec.end_row).into_owned(),
                    cells: range.cell_count(),
                    memory_used: range.memory_usage(),
                    disk_used: range.disk_usage(),
                    latest_revision: range.latest_revision(),
                    scan_count: range.scan_count(),
                    update_count: range.update_count(),
                }
            })
            .collect();

        ServerStatistics {
            location: self.ctx.config.location.clone(),
            bytes_loaded: self.ctx.bytes_loaded.load(Ordering::SeqCst),
            live_scanners: self.ctx.scanner_map.len(),
            block_cache_max_memory: self.ctx.config.block_cache_max_memory,
            ranges: range_stats,
        }
    }

    /// Log one line per hosted range.
    pub fn dump_stats(&self) {
        let mut ranges = Vec::new();
        self.ctx.live_map.get_range_vector(&mut ranges);
        for range in &ranges {
            tracing::info!(
                range = %range.name(),
                cells = range.cell_count(),
                memory = range.memory_usage(),
                disk = range.disk_usage(),
                latest_revision = range.latest_revision(),
                "range stats"
            );
        }
    }
}
