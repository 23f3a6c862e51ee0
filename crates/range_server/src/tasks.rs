//! Maintenance task implementations: compaction, split, and log cleanup.

use std::collections::BTreeMap;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use crate::commit_log::{epoch_micros, CommitLog, FragmentPriority};
use crate::error::Result;
use crate::maintenance::MaintenanceTask;
use crate::range::{Range, SplitPredicate};
use crate::server::RangeServer;
use crate::types::{RangeSpec, RangeState, METADATA_ID, TIMESTAMP_MAX, TIMESTAMP_NULL};

/// Merge marked (or all, when major) memtables of one range into its flushed
/// image.
pub struct CompactionTask {
    range: Arc<Range>,
    major: bool,
}

impl CompactionTask {
    pub fn new(range: Arc<Range>, major: bool) -> Self {
        Self { range, major }
    }
}

impl MaintenanceTask for CompactionTask {
    fn name(&self) -> &'static str {
        "compaction"
    }

    fn run(&self) {
        self.range.wait_quiesced();
        let flushed = self.range.compact(self.major);
        self.range.clear_maintenance();
        tracing::info!(
            range = %self.range.name(),
            major = self.major,
            bytes = flushed,
            "compaction finished"
        );
    }
}

/// Split one oversized range: export the high half into a fresh split log
/// (buffering concurrent writes there too), shrink the retained interval,
/// report the split to the master, and reload the split-off half from the
/// transfer log so it stays servable.
pub struct SplitTask {
    server: RangeServer,
    range: Arc<Range>,
}

impl SplitTask {
    pub fn new(server: RangeServer, range: Arc<Range>) -> Self {
        Self { server, range }
    }

    fn run_inner(&self) -> Result<()> {
        let Some(split_row) = self.range.suggest_split_row() else {
            tracing::debug!(range = %self.range.name(), "no usable split row");
            return Ok(());
        };

        let split_log_dir = self
            .server
            .log_dir()
            .join(format!("split-{}", epoch_micros()));
        let split_log = Arc::new(CommitLog::open(
            &split_log_dir,
            self.server.ctx.config.log_roll_limit,
        )?);

        // From here on, writes above the split row route into the split log
        // instead of the tier log.
        self.range
            .set_split_info(SplitPredicate::new(split_row.clone()), split_log.clone());
        self.range.wait_quiesced();

        // Export the high half's existing cells into the split log; together
        // with the buffered writes above, the log now holds everything the
        // new range needs.
        let mut exported = Vec::new();
        self.range.table().encode(&mut exported);
        let header_len = exported.len();
        let (exported_cells, max_revision) =
            self.range.export_cells_above(&split_row, &mut exported);
        if exported.len() > header_len {
            split_log.write(&exported, max_revision)?;
        }

        let old_spec = self.range.spec();
        let split_off = RangeSpec::new(split_row.clone(), old_spec.end_row.clone());
        let split_off_state = RangeState {
            latest_revision: self.range.latest_revision(),
            split_row: Vec::new(),
        };

        // The live map is keyed by end row, so the shrink has to re-key.
        let table_info = self
            .server
            .ctx
            .live_map
            .get(self.range.table().id)
            .ok_or_else(|| {
                crate::error::Error::TableNotFound(format!(
                    "table {} vanished during split",
                    self.range.table().name
                ))
            })?;
        table_info.remove_range(&old_spec);
        self.range.shrink_to(&split_row);
        table_info.add_range(self.range.clone());
        let retained = self.range.spec();

        if let Some(txn) = self.server.range_txn_log() {
            txn.log_range_loaded(self.range.table(), &retained, &self.range.state())?;
        }

        split_log.close()?;
        self.server.ctx.master.report_split(
            self.range.table(),
            &old_spec,
            &split_off,
            split_log.log_dir(),
        )?;

        // Reload the split-off half from the transfer log so it is hosted
        // here until the master moves it elsewhere. This links the split log
        // into the tier log and re-advertises the range in METADATA.
        self.server.load_range(
            self.range.table(),
            &split_off,
            Some(split_log.log_dir()),
            &split_off_state,
        )?;

        tracing::info!(
            range = %self.range.name(),
            split_off = %split_off,
            exported_cells,
            "split finished"
        );
        Ok(())
    }
}

impl MaintenanceTask for SplitTask {
    fn name(&self) -> &'static str {
        "split"
    }

    fn run(&self) {
        if let Err(err) = self.run_inner() {
            self.range.clear_split_info();
            tracing::error!(range = %self.range.name(), error = %err, "split failed");
        }
        self.range.clear_maintenance();
    }
}

/// Prune commit-log fragments, scheduling compactions for the access groups
/// pinning too much log space.
pub struct LogCleanupTask {
    server: RangeServer,
}

impl LogCleanupTask {
    pub fn new(server: RangeServer) -> Self {
        Self { server }
    }
}

impl MaintenanceTask for LogCleanupTask {
    fn name(&self) -> &'static str {
        "log-cleanup"
    }

    fn run(&self) {
        if let Err(err) = self.server.log_cleanup() {
            tracing::error!(error = %err, "log cleanup failed");
        }
    }
}

impl RangeServer {
    /// Walk the hosted ranges tier by tier: METADATA ranges (minus ROOT)
    /// against the metadata log with the minimum threshold, then user ranges
    /// against the user log with a threshold scaled by the recent write rate.
    pub fn log_cleanup(&self) -> Result<()> {
        self.ctx.recovery.wait_user_done();

        let mut tables = Vec::new();
        self.ctx.live_map.get_all(&mut tables);
        if tables.is_empty() {
            return Ok(());
        }

        let prune_min = self.ctx.prune_threshold_min.load(Ordering::SeqCst);
        let prune_max = self.ctx.prune_threshold_max.load(Ordering::SeqCst);

        let mut first_user_table = 0usize;
        if tables[0].id() == METADATA_ID {
            first_user_table = 1;
            let metadata_log = self.ctx.logs.read().expect("logs lock").metadata.clone();
            if let Some(log) = metadata_log {
                let mut ranges = Vec::new();
                tables[0].get_range_vector(&mut ranges);
                ranges.retain(|r| !r.is_root());
                self.schedule_log_cleanup_compactions(&ranges, &log, prune_min);
            }
        }

        let mut ranges = Vec::new();
        for table in &tables[first_user_table..] {
            table.get_range_vector(&mut ranges);
        }

        // Threshold scales with the recent ingest rate (bytes per second of
        // the timer interval), clamped to the configured window.
        let bytes_loaded = self.ctx.bytes_loaded.swap(0, Ordering::SeqCst);
        let interval_s = self.ctx.config.timer_interval_ms as f64 / 1_000.0;
        let mut prune_threshold =
            ((bytes_loaded as f64 / interval_s / 1_000_000.0) * prune_max as f64) as u64;
        prune_threshold = prune_threshold.clamp(prune_min, prune_max);

        tracing::info!(threshold = prune_threshold, "cleaning user commit log");
        let user_log = self.user_log()?;
        self.schedule_log_cleanup_compactions(&ranges, &user_log, prune_threshold);
        Ok(())
    }

    /// For every access group anchoring more cumulative log space than the
    /// threshold, set its compaction bit and schedule the owning range; then
    /// prune fragments below the earliest revision still cached anywhere.
    fn schedule_log_cleanup_compactions(
        &self,
        ranges: &[Arc<Range>],
        log: &CommitLog,
        prune_threshold: u64,
    ) {
        let mut earliest_cached_revision = TIMESTAMP_MAX;
        let mut priority = Vec::new();
        let mut owners = Vec::new();
        for (index, range) in ranges.iter().enumerate() {
            let start = priority.len();
            range.get_compaction_priority_data(&mut priority);
            for data in &priority[start..] {
                owners.push(index);
                if data.earliest_cached_revision != TIMESTAMP_NULL
                    && data.earliest_cached_revision < earliest_cached_revision
                {
                    earliest_cached_revision = data.earliest_cached_revision;
                }
            }
        }

        let mut frag_map: BTreeMap<i64, FragmentPriority> = BTreeMap::new();
        log.load_fragment_priority_map(&mut frag_map);

        for (data, owner) in priority.iter().zip(owners.iter()) {
            if data.earliest_cached_revision == TIMESTAMP_NULL {
                continue;
            }
            let Some((_, fragment)) = frag_map
                .range(data.earliest_cached_revision..)
                .next()
            else {
                continue;
            };
            if fragment.cumulative_size > prune_threshold {
                let range = &ranges[*owner];
                if data.mem_used > 0 {
                    range.set_compaction_bit(data.access_group);
                }
                if range.test_and_set_maintenance() {
                    self.ctx
                        .maintenance_queue
                        .add(Box::new(CompactionTask::new(range.clone(), false)));
                }
            }
        }

        log.purge(earliest_cached_revision);
    }
}
