//! A single contiguous key interval of one table.
//!
//! The range owns per-access-group cell stores (an in-memory memtable plus a
//! flushed image standing in for the on-disk file set), scan/update counters,
//! the maintenance admission flag, and soft split state. Structure is guarded
//! by one internal mutex; counters and the maintenance flag are atomics so
//! the hot paths never take the structure lock just to gate maintenance.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, RwLock};

use crate::commit_log::{CommitLog, CommitLogReader};
use crate::error::{Error, Result};
use crate::key::{self, Key};
use crate::schema::Schema;
use crate::types::{
    RangeSpec, RangeState, TableIdentifier, END_ROOT_ROW, METADATA_ID, TIMESTAMP_NULL,
};

/// Decides whether a row moves to the new half of a pending split.
#[derive(Clone, Debug)]
pub struct SplitPredicate {
    split_row: Vec<u8>,
}

impl SplitPredicate {
    pub fn new(split_row: Vec<u8>) -> Self {
        Self { split_row }
    }

    /// The high half `(split_row..end]` splits off to the new range.
    pub fn split_off(&self, row: &[u8]) -> bool {
        row > self.split_row.as_slice()
    }

    pub fn split_row(&self) -> &[u8] {
        &self.split_row
    }
}

/// Per-access-group snapshot used to pick compaction and split work.
#[derive(Clone, Debug)]
pub struct CompactionPriorityData {
    pub access_group: usize,
    pub mem_used: u64,
    pub disk_used: u64,
    pub in_memory: bool,
    pub earliest_cached_revision: i64,
    pub log_space_pinned: u64,
}

/// Cell coordinates ordered row-major with newest revision first.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CellKey {
    pub row: Vec<u8>,
    pub column_family: u8,
    pub qualifier: Vec<u8>,
    pub revision: i64,
}

impl Ord for CellKey {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.row
            .cmp(&other.row)
            .then(self.column_family.cmp(&other.column_family))
            .then(self.qualifier.cmp(&other.qualifier))
            // Descending revision: newer cells sort first within a column.
            .then(other.revision.cmp(&self.revision))
    }
}

impl PartialOrd for CellKey {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

#[derive(Clone, Debug)]
struct CellValue {
    timestamp: i64,
    value: Vec<u8>,
}

struct AccessGroupState {
    name: String,
    in_memory: bool,
    column_families: Vec<u8>,
    mem: BTreeMap<CellKey, CellValue>,
    disk: BTreeMap<CellKey, CellValue>,
    mem_used: u64,
    disk_used: u64,
    earliest_cached_revision: i64,
    compaction_bit: bool,
}

impl AccessGroupState {
    fn cell_weight(key: &CellKey, value: &CellValue) -> u64 {
        (key.row.len() + key.qualifier.len() + value.value.len() + 18) as u64
    }
}

struct RangeInner {
    access_groups: Vec<AccessGroupState>,
    latest_revision: i64,
    split: Option<(SplitPredicate, Arc<CommitLog>)>,
}

/// One hosted range.
pub struct Range {
    table: TableIdentifier,
    start_row: RwLock<Vec<u8>>,
    end_row: RwLock<Vec<u8>>,
    schema: Arc<Schema>,
    size_limit: u64,
    inner: Mutex<RangeInner>,
    maintenance_flag: AtomicBool,
    update_counter: AtomicU32,
    scan_counter: AtomicU32,
    error: AtomicU32,
    dropped: AtomicBool,
    quiesce_lock: Mutex<()>,
    quiesce_cond: Condvar,
}

impl Range {
    pub fn new(
        table: TableIdentifier,
        schema: Arc<Schema>,
        spec: &RangeSpec,
        state: &RangeState,
        size_limit: u64,
    ) -> Self {
        let access_groups = schema
            .access_groups
            .iter()
            .map(|ag| AccessGroupState {
                name: ag.name.clone(),
                in_memory: ag.in_memory,
                column_families: ag.column_families.iter().map(|cf| cf.id).collect(),
                mem: BTreeMap::new(),
                disk: BTreeMap::new(),
                mem_used: 0,
                disk_used: 0,
                earliest_cached_revision: TIMESTAMP_NULL,
                compaction_bit: false,
            })
            .collect();

        Self {
            start_row: RwLock::new(spec.start_row.clone()),
            end_row: RwLock::new(spec.normalized_end_row()),
            schema,
            size_limit,
            inner: Mutex::new(RangeInner {
                access_groups,
                latest_revision: state.latest_revision,
                split: None,
            }),
            maintenance_flag: AtomicBool::new(false),
            update_counter: AtomicU32::new(0),
            scan_counter: AtomicU32::new(0),
            error: AtomicU32::new(crate::error::code::OK),
            dropped: AtomicBool::new(false),
            quiesce_lock: Mutex::new(()),
            quiesce_cond: Condvar::new(),
            table,
        }
    }

    pub fn table(&self) -> &TableIdentifier {
        &self.table
    }

    pub fn start_row(&self) -> Vec<u8> {
        self.start_row.read().expect("start row lock").clone()
    }

    pub fn end_row(&self) -> Vec<u8> {
        self.end_row.read().expect("end row lock").clone()
    }

    pub fn spec(&self) -> RangeSpec {
        RangeSpec::new(self.start_row(), self.end_row())
    }

    pub fn is_root(&self) -> bool {
        self.table.id == METADATA_ID
            && self.end_row.read().expect("end row lock").as_slice() == END_ROOT_ROW
    }

    pub fn size_limit(&self) -> u64 {
        self.size_limit
    }

    /// Whether `row` currently falls inside this range. False after shrink.
    pub fn belongs(&self, row: &[u8]) -> bool {
        let start = self.start_row.read().expect("start row lock");
        let end = self.end_row.read().expect("end row lock");
        row > start.as_slice() && row <= end.as_slice()
    }

    /// Human-readable name used in error messages.
    pub fn name(&self) -> String {
        format!(
            "{}[{}..{}]",
            self.table.name,
            String::from_utf8_lossy(&self.start_row()),
            String::from_utf8_lossy(&self.end_row())
        )
    }

    /// Sticky error preventing this range from receiving updates.
    pub fn get_error(&self) -> u32 {
        self.error.load(Ordering::SeqCst)
    }

    pub fn set_error(&self, code: u32) {
        self.error.store(code, Ordering::SeqCst);
    }

    /// Mark the range dropped; later updates bounce with the sticky error.
    pub fn drop_range(&self) {
        self.dropped.store(true, Ordering::SeqCst);
        self.set_error(crate::error::code::TABLE_NOT_FOUND);
    }

    pub fn is_dropped(&self) -> bool {
        self.dropped.load(Ordering::SeqCst)
    }

    // ---- counters and the maintenance admission gate ----

    /// Atomically claim the maintenance slot. Returns true iff it was clear;
    /// this is the sole admission gate for background work on the range.
    pub fn test_and_set_maintenance(&self) -> bool {
        !self.maintenance_flag.swap(true, Ordering::SeqCst)
    }

    pub fn clear_maintenance(&self) {
        self.maintenance_flag.store(false, Ordering::SeqCst);
    }

    pub fn maintenance_in_progress(&self) -> bool {
        self.maintenance_flag.load(Ordering::SeqCst)
    }

    pub fn increment_update_counter(&self) {
        self.update_counter.fetch_add(1, Ordering::SeqCst);
    }

    pub fn decrement_update_counter(&self) {
        self.update_counter.fetch_sub(1, Ordering::SeqCst);
        self.quiesce_cond.notify_all();
    }

    pub fn increment_scan_counter(&self) {
        self.scan_counter.fetch_add(1, Ordering::SeqCst);
    }

    pub fn decrement_scan_counter(&self) {
        self.scan_counter.fetch_sub(1, Ordering::SeqCst);
        self.quiesce_cond.notify_all();
    }

    pub fn update_count(&self) -> u32 {
        self.update_counter.load(Ordering::SeqCst)
    }

    pub fn scan_count(&self) -> u32 {
        self.scan_counter.load(Ordering::SeqCst)
    }

    /// Block until no scans or updates reference the range. Maintenance must
    /// not restructure the range while either counter is non-zero.
    pub fn wait_quiesced(&self) {
        let mut guard = self.quiesce_lock.lock().expect("quiesce lock");
        while self.update_counter.load(Ordering::SeqCst) > 0
            || self.scan_counter.load(Ordering::SeqCst) > 0
        {
            let (next, _) = self
                .quiesce_cond
                .wait_timeout(guard, std::time::Duration::from_millis(50))
                .expect("quiesce wait");
            guard = next;
        }
    }

    // ---- write path ----

    /// Take the structure lock for a run of `add` calls.
    pub fn lock(&self) -> RangeWriteGuard<'_> {
        RangeWriteGuard {
            schema: &self.schema,
            inner: self.inner.lock().expect("range lock"),
        }
    }

    pub fn latest_revision(&self) -> i64 {
        self.inner.lock().expect("range lock").latest_revision
    }

    /// Revision at which new scanners snapshot the range.
    pub fn scan_revision(&self) -> i64 {
        self.latest_revision()
    }

    /// Split status: the predicate and split log when a split is pending,
    /// plus the latest revision already seen by this range.
    pub fn get_split_info(&self) -> (Option<(SplitPredicate, Arc<CommitLog>)>, i64) {
        let inner = self.inner.lock().expect("range lock");
        (inner.split.clone(), inner.latest_revision)
    }

    pub fn set_split_info(&self, predicate: SplitPredicate, splitlog: Arc<CommitLog>) {
        let mut inner = self.inner.lock().expect("range lock");
        inner.split = Some((predicate, splitlog));
    }

    pub fn clear_split_info(&self) {
        let mut inner = self.inner.lock().expect("range lock");
        inner.split = None;
    }

    /// Persisted bookkeeping snapshot.
    pub fn state(&self) -> RangeState {
        let inner = self.inner.lock().expect("range lock");
        RangeState {
            latest_revision: inner.latest_revision,
            split_row: inner
                .split
                .as_ref()
                .map(|(p, _)| p.split_row.clone())
                .unwrap_or_default(),
        }
    }

    // ---- scans ----

    /// Snapshot iterator over the range at `scan_revision`. Cells stamped
    /// after the snapshot revision are invisible for the scanner's lifetime,
    /// no matter what splits or compactions do afterwards.
    pub fn create_scanner(&self, spec: &ScanSpec, scan_revision: i64) -> Result<RangeScanner> {
        let column_filter = resolve_columns(&self.schema, &spec.columns)?;
        let inner = self.inner.lock().expect("range lock");

        let mut merged: BTreeMap<CellKey, CellValue> = BTreeMap::new();
        for ag in &inner.access_groups {
            if let Some(filter) = &column_filter {
                if !ag.column_families.iter().any(|cf| filter.contains(cf)) {
                    continue;
                }
            }
            for source in [&ag.disk, &ag.mem] {
                for (cell, value) in source {
                    if cell.revision > scan_revision {
                        continue;
                    }
                    if let Some(filter) = &column_filter {
                        if !filter.contains(&cell.column_family) {
                            continue;
                        }
                    }
                    if !spec.matches(cell) {
                        continue;
                    }
                    merged.insert(cell.clone(), value.clone());
                }
            }
        }

        let mut cells = Vec::with_capacity(merged.len());
        let mut versions_seen = 0u32;
        let mut last_coord: Option<(Vec<u8>, u8, Vec<u8>)> = None;
        for (cell, value) in merged {
            let coord = (cell.row.clone(), cell.column_family, cell.qualifier.clone());
            if last_coord.as_ref() == Some(&coord) {
                versions_seen += 1;
            } else {
                versions_seen = 1;
                last_coord = Some(coord);
            }
            if spec.max_versions > 0 && versions_seen > spec.max_versions {
                continue;
            }
            let mut key_bytes = Vec::new();
            key::encode_stamped_key(
                &mut key_bytes,
                &cell.row,
                cell.column_family,
                &cell.qualifier,
                value.timestamp,
                cell.revision,
            );
            cells.push((key_bytes, value.value));
        }

        Ok(RangeScanner {
            cells,
            pos: 0,
            scan_revision,
        })
    }

    // ---- maintenance support ----

    pub fn get_compaction_priority_data(&self, out: &mut Vec<CompactionPriorityData>) {
        let inner = self.inner.lock().expect("range lock");
        for (idx, ag) in inner.access_groups.iter().enumerate() {
            out.push(CompactionPriorityData {
                access_group: idx,
                mem_used: ag.mem_used,
                disk_used: ag.disk_used,
                in_memory: ag.in_memory,
                earliest_cached_revision: ag.earliest_cached_revision,
                log_space_pinned: 0,
            });
        }
    }

    pub fn set_compaction_bit(&self, access_group: usize) {
        let mut inner = self.inner.lock().expect("range lock");
        if let Some(ag) = inner.access_groups.get_mut(access_group) {
            ag.compaction_bit = true;
        }
    }

    pub fn disk_usage(&self) -> u64 {
        let inner = self.inner.lock().expect("range lock");
        inner.access_groups.iter().map(|ag| ag.disk_used).sum()
    }

    pub fn memory_usage(&self) -> u64 {
        let inner = self.inner.lock().expect("range lock");
        inner.access_groups.iter().map(|ag| ag.mem_used).sum()
    }

    pub fn cell_count(&self) -> u64 {
        let inner = self.inner.lock().expect("range lock");
        inner
            .access_groups
            .iter()
            .map(|ag| (ag.mem.len() + ag.disk.len()) as u64)
            .sum()
    }

    /// Merge memtables into the flushed image. `major` compacts every access
    /// group; otherwise only groups with the compaction bit set.
    pub fn compact(&self, major: bool) -> u64 {
        let mut inner = self.inner.lock().expect("range lock");
        let mut flushed = 0u64;
        for ag in &mut inner.access_groups {
            if !major && !ag.compaction_bit {
                continue;
            }
            ag.compaction_bit = false;
            if ag.mem.is_empty() {
                continue;
            }
            tracing::debug!(access_group = %ag.name, bytes = ag.mem_used, "compacting memtable");
            flushed += ag.mem_used;
            ag.disk_used += ag.mem_used;
            ag.mem_used = 0;
            ag.earliest_cached_revision = TIMESTAMP_NULL;
            let mem = std::mem::take(&mut ag.mem);
            ag.disk.extend(mem);
        }
        flushed
    }

    /// Median row of the stored cells, used to pick a split point.
    pub fn suggest_split_row(&self) -> Option<Vec<u8>> {
        let inner = self.inner.lock().expect("range lock");
        let mut rows: Vec<&Vec<u8>> = Vec::new();
        for ag in &inner.access_groups {
            for cell in ag.mem.keys().chain(ag.disk.keys()) {
                rows.push(&cell.row);
            }
        }
        rows.sort();
        rows.dedup();
        if rows.len() < 2 {
            return None;
        }
        let candidate = rows[rows.len() / 2 - 1].clone();
        drop(inner);
        // A split at either boundary would produce an empty half.
        if candidate.as_slice() >= self.end_row().as_slice()
            || candidate.as_slice() <= self.start_row().as_slice()
        {
            return None;
        }
        Some(candidate)
    }

    /// Serialize every cell above `split_row` (memtable and flushed image
    /// alike) into `out` as stamped key/value pairs. Returns the cell count
    /// and the highest revision exported.
    pub fn export_cells_above(&self, split_row: &[u8], out: &mut Vec<u8>) -> (u64, i64) {
        let inner = self.inner.lock().expect("range lock");
        let mut merged: BTreeMap<CellKey, CellValue> = BTreeMap::new();
        for ag in &inner.access_groups {
            for source in [&ag.disk, &ag.mem] {
                for (cell, value) in source {
                    if cell.row.as_slice() > split_row {
                        merged.insert(cell.clone(), value.clone());
                    }
                }
            }
        }

        let count = merged.len() as u64;
        let mut max_revision = TIMESTAMP_NULL;
        for (cell, value) in merged {
            key::encode_stamped_key(
                out,
                &cell.row,
                cell.column_family,
                &cell.qualifier,
                value.timestamp,
                cell.revision,
            );
            key::encode_value(out, &value.value);
            max_revision = max_revision.max(cell.revision);
        }
        (count, max_revision)
    }

    /// Finish a split: drop cells above `split_row` and shrink the interval
    /// to the retained low half. The high half must already have been
    /// exported to its transfer log when this runs.
    pub fn shrink_to(&self, split_row: &[u8]) {
        let mut inner = self.inner.lock().expect("range lock");
        for ag in &mut inner.access_groups {
            let mut dropped_mem = 0;
            ag.mem.retain(|cell, value| {
                let keep = cell.row.as_slice() <= split_row;
                if !keep {
                    dropped_mem += AccessGroupState::cell_weight(cell, value);
                }
                keep
            });
            ag.mem_used = ag.mem_used.saturating_sub(dropped_mem);
            let mut dropped_disk = 0;
            ag.disk.retain(|cell, value| {
                let keep = cell.row.as_slice() <= split_row;
                if !keep {
                    dropped_disk += AccessGroupState::cell_weight(cell, value);
                }
                keep
            });
            ag.disk_used = ag.disk_used.saturating_sub(dropped_disk);
            ag.earliest_cached_revision = ag
                .mem
                .keys()
                .map(|c| c.revision)
                .min()
                .unwrap_or(TIMESTAMP_NULL);
        }
        inner.split = None;
        drop(inner);
        *self.end_row.write().expect("end row lock") = split_row.to_vec();
    }

    // ---- recovery ----

    /// Reset in-memory state ahead of a replay into this range.
    pub fn recovery_initialize(&self) {
        let mut inner = self.inner.lock().expect("range lock");
        for ag in &mut inner.access_groups {
            ag.mem.clear();
            ag.mem_used = 0;
            ag.earliest_cached_revision = TIMESTAMP_NULL;
        }
    }

    /// Post-replay hook run before the range is merged into the live map.
    pub fn recovery_finalize(&self) {
        let cells = self.cell_count();
        tracing::debug!(range = %self.name(), cells, "recovery finalized");
    }

    /// Fold a linked transfer log into this range. The range is not yet
    /// published, so no locking discipline beyond the structure lock applies.
    pub fn replay_transfer_log(&self, reader: &mut CommitLogReader) -> Result<u64> {
        let mut applied = 0u64;
        while let Some(block) = reader.next()? {
            let mut offset = 0usize;
            let _table = TableIdentifier::decode(&block.payload, &mut offset)?;
            let mut guard = self.lock();
            while offset < block.payload.len() {
                let cell = Key::load(&block.payload, &mut offset)?;
                let value = key::decode_value(&block.payload, &mut offset)?;
                if !self.belongs(&cell.row) {
                    continue;
                }
                guard.add(&cell, &value)?;
                applied += 1;
            }
        }
        Ok(applied)
    }
}

/// Guard over the range structure for a run of inserts.
pub struct RangeWriteGuard<'a> {
    schema: &'a Arc<Schema>,
    inner: MutexGuard<'a, RangeInner>,
}

impl RangeWriteGuard<'_> {
    /// Insert one stamped cell into its access group's memtable.
    pub fn add(&mut self, cell: &Key, value: &[u8]) -> Result<()> {
        let ag_index = self
            .schema
            .access_group_for(cell.column_family)
            .ok_or_else(|| {
                Error::BadKey(format!("unknown column family {}", cell.column_family))
            })?;
        let ag = &mut self.inner.access_groups[ag_index];

        let cell_key = CellKey {
            row: cell.row.clone(),
            column_family: cell.column_family,
            qualifier: cell.column_qualifier.clone(),
            revision: cell.revision,
        };
        let cell_value = CellValue {
            timestamp: cell.timestamp,
            value: value.to_vec(),
        };
        let weight = AccessGroupState::cell_weight(&cell_key, &cell_value);

        if ag.earliest_cached_revision == TIMESTAMP_NULL
            || cell.revision < ag.earliest_cached_revision
        {
            ag.earliest_cached_revision = cell.revision;
        }
        if ag.mem.insert(cell_key, cell_value).is_none() {
            ag.mem_used += weight;
        }
        if cell.revision > self.inner.latest_revision {
            self.inner.latest_revision = cell.revision;
        }
        Ok(())
    }
}

/// A single row interval of a scan. Empty `end` means unbounded above.
#[derive(Clone, Debug, Default)]
pub struct RowInterval {
    pub start: Vec<u8>,
    pub start_inclusive: bool,
    pub end: Vec<u8>,
    pub end_inclusive: bool,
}

/// A single cell interval of a scan, bounded by (row, qualifier) pairs.
#[derive(Clone, Debug, Default)]
pub struct CellInterval {
    pub start_row: Vec<u8>,
    pub start_qualifier: Vec<u8>,
    pub end_row: Vec<u8>,
    pub end_qualifier: Vec<u8>,
}

/// What a scanner should return.
#[derive(Clone, Debug, Default)]
pub struct ScanSpec {
    pub row_intervals: Vec<RowInterval>,
    pub cell_intervals: Vec<CellInterval>,
    /// Column family names to include; empty means all.
    pub columns: Vec<String>,
    /// Newest N versions per cell; 0 means all versions.
    pub max_versions: u32,
}

impl ScanSpec {
    /// Validate the interval shape: at most one row interval, at most one
    /// cell interval, never both.
    pub fn validate(&self) -> Result<()> {
        if self.row_intervals.len() > 1 {
            return Err(Error::BadScanSpec("can only scan one row interval".into()));
        }
        if !self.row_intervals.is_empty() && !self.cell_intervals.is_empty() {
            return Err(Error::BadScanSpec(
                "both row and cell intervals defined".into(),
            ));
        }
        if self.cell_intervals.len() > 1 {
            return Err(Error::BadScanSpec("can only scan one cell interval".into()));
        }
        Ok(())
    }

    fn matches(&self, cell: &CellKey) -> bool {
        if let Some(interval) = self.row_intervals.first() {
            if !interval.start.is_empty() {
                let above = if interval.start_inclusive {
                    cell.row.as_slice() >= interval.start.as_slice()
                } else {
                    cell.row.as_slice() > interval.start.as_slice()
                };
                if !above {
                    return false;
                }
            }
            if !interval.end.is_empty() {
                let below = if interval.end_inclusive {
                    cell.row.as_slice() <= interval.end.as_slice()
                } else {
                    cell.row.as_slice() < interval.end.as_slice()
                };
                if !below {
                    return false;
                }
            }
        }
        if let Some(interval) = self.cell_intervals.first() {
            let coord = (cell.row.as_slice(), cell.qualifier.as_slice());
            if !interval.start_row.is_empty()
                && coord < (interval.start_row.as_slice(), interval.start_qualifier.as_slice())
            {
                return false;
            }
            if !interval.end_row.is_empty()
                && coord > (interval.end_row.as_slice(), interval.end_qualifier.as_slice())
            {
                return false;
            }
        }
        true
    }
}

fn resolve_columns(schema: &Schema, columns: &[String]) -> Result<Option<Vec<u8>>> {
    if columns.is_empty() {
        return Ok(None);
    }
    let mut ids = Vec::with_capacity(columns.len());
    for name in columns {
        let id = schema
            .column_family_id(name)
            .ok_or_else(|| Error::BadScanSpec(format!("unknown column family '{name}'")))?;
        ids.push(id);
    }
    Ok(Some(ids))
}

/// Materialized snapshot scanner over one range.
pub struct RangeScanner {
    cells: Vec<(Vec<u8>, Vec<u8>)>,
    pos: usize,
    scan_revision: i64,
}

impl RangeScanner {
    pub fn scan_revision(&self) -> i64 {
        self.scan_revision
    }

    /// Fill the next response block up to `max_bytes`. Returns the block,
    /// the number of cells in it, and whether more remain.
    pub fn fill_block(&mut self, max_bytes: usize) -> (Vec<u8>, usize, bool) {
        let mut block = Vec::new();
        let mut count = 0usize;
        while self.pos < self.cells.len() {
            let (key_bytes, value) = &self.cells[self.pos];
            let cell_len = key_bytes.len() + value.len() + 5;
            if count > 0 && block.len() + cell_len > max_bytes {
                break;
            }
            block.extend_from_slice(key_bytes);
            key::encode_value(&mut block, value);
            self.pos += 1;
            count += 1;
        }
        let more = self.pos < self.cells.len();
        (block, count, more)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{AccessGroupSpec, ColumnFamilySpec, Schema};

    fn two_group_schema() -> Arc<Schema> {
        Arc::new(Schema {
            generation: 1,
            access_groups: vec![
                AccessGroupSpec {
                    name: "hot".into(),
                    in_memory: true,
                    column_families: vec![ColumnFamilySpec {
                        id: 1,
                        name: "a".into(),
                    }],
                },
                AccessGroupSpec {
                    name: "cold".into(),
                    in_memory: false,
                    column_families: vec![ColumnFamilySpec {
                        id: 2,
                        name: "b".into(),
                    }],
                },
            ],
        })
    }

    fn sample_range() -> Range {
        Range::new(
            TableIdentifier::new(1, "t", 1),
            two_group_schema(),
            &RangeSpec::new(Vec::new(), b"m".to_vec()),
            &RangeState::default(),
            1 << 20,
        )
    }

    fn cell(row: &[u8], cf: u8, revision: i64) -> Key {
        Key {
            control: key::HAVE_REVISION | key::HAVE_TIMESTAMP | key::REV_IS_TS,
            row: row.to_vec(),
            column_family: cf,
            column_qualifier: Vec::new(),
            timestamp: revision,
            revision,
        }
    }

    #[test]
    fn add_routes_to_access_group_and_tracks_revisions() {
        let range = sample_range();
        {
            let mut guard = range.lock();
            guard.add(&cell(b"d", 1, 10), b"x").expect("add");
            guard.add(&cell(b"e", 2, 12), b"y").expect("add");
        }
        assert_eq!(range.latest_revision(), 12);

        let mut data = Vec::new();
        range.get_compaction_priority_data(&mut data);
        assert_eq!(data.len(), 2);
        assert!(data[0].mem_used > 0);
        assert!(data[1].mem_used > 0);
        assert_eq!(data[0].earliest_cached_revision, 10);
        assert_eq!(data[1].earliest_cached_revision, 12);
    }

    #[test]
    fn unknown_column_family_is_rejected() {
        let range = sample_range();
        let mut guard = range.lock();
        let err = guard.add(&cell(b"d", 9, 10), b"x").expect_err("bad cf");
        assert!(matches!(err, Error::BadKey(_)));
    }

    #[test]
    fn belongs_respects_exclusive_start_and_inclusive_end() {
        let range = Range::new(
            TableIdentifier::new(1, "t", 1),
            two_group_schema(),
            &RangeSpec::new(b"d".to_vec(), b"m".to_vec()),
            &RangeState::default(),
            1 << 20,
        );
        assert!(!range.belongs(b"d"));
        assert!(range.belongs(b"e"));
        assert!(range.belongs(b"m"));
        assert!(!range.belongs(b"n"));
    }

    #[test]
    fn scanner_snapshot_hides_later_revisions() {
        let range = sample_range();
        {
            let mut guard = range.lock();
            guard.add(&cell(b"a", 1, 5), b"old").expect("add");
        }
        let mut scanner = range
            .create_scanner(&ScanSpec::default(), range.scan_revision())
            .expect("scanner");
        {
            let mut guard = range.lock();
            guard.add(&cell(b"b", 1, 50), b"new").expect("add");
        }
        let (block, count, more) = scanner.fill_block(1 << 20);
        assert_eq!(count, 1);
        assert!(!more);

        let mut offset = 0;
        let decoded = Key::load(&block, &mut offset).expect("key");
        assert_eq!(decoded.row, b"a");
        assert_eq!(decoded.revision, 5);
    }

    #[test]
    fn scanner_survives_shrink_during_scan() {
        let range = sample_range();
        {
            let mut guard = range.lock();
            guard.add(&cell(b"b", 1, 1), b"1").expect("add");
            guard.add(&cell(b"f", 1, 2), b"2").expect("add");
            guard.add(&cell(b"k", 1, 3), b"3").expect("add");
        }
        let mut scanner = range
            .create_scanner(&ScanSpec::default(), range.scan_revision())
            .expect("scanner");
        range.shrink_to(b"f");
        assert!(!range.belongs(b"k"));
        assert!(range.belongs(b"b"));

        let (block, count, _) = scanner.fill_block(1 << 20);
        assert_eq!(count, 3);
        assert!(!block.is_empty());
    }

    #[test]
    fn max_versions_keeps_newest() {
        let range = sample_range();
        {
            let mut guard = range.lock();
            for revision in [10, 20, 30] {
                guard.add(&cell(b"a", 1, revision), b"v").expect("add");
            }
        }
        let spec = ScanSpec {
            max_versions: 2,
            ..Default::default()
        };
        let mut scanner = range
            .create_scanner(&spec, range.scan_revision())
            .expect("scanner");
        let (block, count, _) = scanner.fill_block(1 << 20);
        assert_eq!(count, 2);

        let mut offset = 0;
        let first = Key::load(&block, &mut offset).expect("key");
        assert_eq!(first.revision, 30);
    }

    #[test]
    fn export_cells_above_covers_memtable_and_flushed_image() {
        let range = sample_range();
        {
            let mut guard = range.lock();
            guard.add(&cell(b"b", 1, 1), b"low").expect("add");
            guard.add(&cell(b"h", 1, 2), b"flushed-high").expect("add");
        }
        range.compact(true);
        {
            let mut guard = range.lock();
            guard.add(&cell(b"k", 1, 3), b"mem-high").expect("add");
        }

        let mut out = Vec::new();
        let (count, max_revision) = range.export_cells_above(b"f", &mut out);
        assert_eq!(count, 2);
        assert_eq!(max_revision, 3);

        let mut offset = 0;
        let first = Key::load(&out, &mut offset).expect("first key");
        let first_value = key::decode_value(&out, &mut offset).expect("first value");
        let second = Key::load(&out, &mut offset).expect("second key");
        let second_value = key::decode_value(&out, &mut offset).expect("second value");
        assert_eq!(offset, out.len());
        assert_eq!(first.row, b"h");
        assert_eq!(first_value, b"flushed-high");
        assert_eq!(second.row, b"k");
        assert_eq!(second_value, b"mem-high");
    }

    #[test]
    fn compaction_moves_memtable_to_disk_image() {
        let range = sample_range();
        {
            let mut guard = range.lock();
            guard.add(&cell(b"a", 1, 1), b"v").expect("add");
        }
        assert_eq!(range.disk_usage(), 0);
        let flushed = range.compact(true);
        assert!(flushed > 0);
        assert_eq!(range.memory_usage(), 0);
        assert_eq!(range.disk_usage(), flushed);

        let mut data = Vec::new();
        range.get_compaction_priority_data(&mut data);
        assert_eq!(data[0].earliest_cached_revision, TIMESTAMP_NULL);
    }

    #[test]
    fn maintenance_gate_is_exclusive() {
        let range = sample_range();
        assert!(range.test_and_set_maintenance());
        assert!(!range.test_and_set_maintenance());
        range.clear_maintenance();
        assert!(range.test_and_set_maintenance());
    }

    #[test]
    fn scan_spec_shape_validation() {
        let mut spec = ScanSpec::default();
        spec.row_intervals.push(RowInterval::default());
        spec.row_intervals.push(RowInterval::default());
        assert!(spec.validate().is_err());

        let mut spec = ScanSpec::default();
        spec.row_intervals.push(RowInterval::default());
        spec.cell_intervals.push(CellInterval::default());
        assert!(spec.validate().is_err());

        let mut spec = ScanSpec::default();
        spec.cell_intervals.push(CellInterval::default());
        assert!(spec.validate().is_ok());
    }
}
