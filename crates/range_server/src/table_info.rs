//! Per-table range registry and the process-wide table map.

use std::collections::{BTreeMap, HashMap};
use std::ops::Bound;
use std::sync::{Arc, Mutex, RwLock};

use crate::range::Range;
use crate::schema::Schema;
use crate::types::{RangeSpec, TableIdentifier};

/// One table hosted (wholly or partly) on this server: cached schema plus
/// the ranges indexed by their normalized end row. `TableInfo` owns its
/// ranges; a `Range` reaches back only through its `TableIdentifier`.
pub struct TableInfo {
    id: u32,
    name: String,
    schema: RwLock<Option<Arc<Schema>>>,
    ranges: Mutex<BTreeMap<Vec<u8>, Arc<Range>>>,
}

impl TableInfo {
    pub fn new(table: &TableIdentifier, schema: Option<Arc<Schema>>) -> Self {
        Self {
            id: table.id,
            name: table.name.clone(),
            schema: RwLock::new(schema),
            ranges: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn get_schema(&self) -> Option<Arc<Schema>> {
        self.schema.read().expect("schema lock").clone()
    }

    pub fn update_schema(&self, schema: Arc<Schema>) {
        *self.schema.write().expect("schema lock") = Some(schema);
    }

    /// Same id/name/schema, empty range set; used to seed the replay map.
    pub fn create_shallow_copy(&self) -> TableInfo {
        TableInfo {
            id: self.id,
            name: self.name.clone(),
            schema: RwLock::new(self.get_schema()),
            ranges: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn add_range(&self, range: Arc<Range>) {
        let mut ranges = self.ranges.lock().expect("ranges lock");
        ranges.insert(range.end_row(), range);
    }

    /// Exact-match lookup by the spec's interval.
    pub fn get_range(&self, spec: &RangeSpec) -> Option<Arc<Range>> {
        let ranges = self.ranges.lock().expect("ranges lock");
        let range = ranges.get(&spec.normalized_end_row())?;
        if range.start_row() == spec.start_row {
            Some(range.clone())
        } else {
            None
        }
    }

    pub fn remove_range(&self, spec: &RangeSpec) -> Option<Arc<Range>> {
        let mut ranges = self.ranges.lock().expect("ranges lock");
        let end_row = spec.normalized_end_row();
        match ranges.get(&end_row) {
            Some(range) if range.start_row() == spec.start_row => ranges.remove(&end_row),
            _ => None,
        }
    }

    /// The range whose interval currently contains `row`, if any.
    pub fn find_containing_range(&self, row: &[u8]) -> Option<Arc<Range>> {
        let ranges = self.ranges.lock().expect("ranges lock");
        let (_, range) = ranges
            .range::<[u8], _>((Bound::Included(row), Bound::Unbounded))
            .next()?;
        if range.belongs(row) {
            Some(range.clone())
        } else {
            None
        }
    }

    /// Append every range, ordered by end row.
    pub fn get_range_vector(&self, out: &mut Vec<Arc<Range>>) {
        let ranges = self.ranges.lock().expect("ranges lock");
        out.extend(ranges.values().cloned());
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.lock().expect("ranges lock").is_empty()
    }

    pub fn clear_ranges(&self) {
        self.ranges.lock().expect("ranges lock").clear();
    }

    fn drain_ranges(&self) -> Vec<Arc<Range>> {
        let mut ranges = self.ranges.lock().expect("ranges lock");
        let drained = std::mem::take(&mut *ranges);
        drained.into_values().collect()
    }
}

/// Concurrent `table id -> TableInfo` map. The server keeps two: the live
/// map serving requests and the replay map staging recovery work.
#[derive(Default)]
pub struct TableInfoMap {
    inner: Mutex<HashMap<u32, Arc<TableInfo>>>,
}

impl TableInfoMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, id: u32) -> Option<Arc<TableInfo>> {
        self.inner.lock().expect("table map lock").get(&id).cloned()
    }

    pub fn set(&self, id: u32, info: Arc<TableInfo>) {
        self.inner.lock().expect("table map lock").insert(id, info);
    }

    pub fn remove(&self, id: u32) -> Option<Arc<TableInfo>> {
        self.inner.lock().expect("table map lock").remove(&id)
    }

    pub fn get_all(&self, out: &mut Vec<Arc<TableInfo>>) {
        let inner = self.inner.lock().expect("table map lock");
        let mut tables: Vec<_> = inner.values().cloned().collect();
        tables.sort_by_key(|t| t.id());
        out.extend(tables);
    }

    /// Every hosted range across every table.
    pub fn get_range_vector(&self, out: &mut Vec<Arc<Range>>) {
        let mut tables = Vec::new();
        self.get_all(&mut tables);
        for table in tables {
            table.get_range_vector(out);
        }
    }

    pub fn is_empty(&self) -> bool {
        let inner = self.inner.lock().expect("table map lock");
        inner.values().all(|t| t.is_empty())
    }

    /// Drop tables and ranges alike.
    pub fn clear(&self) {
        self.inner.lock().expect("table map lock").clear();
    }

    /// Drop ranges but keep the tables (and their cached schemas).
    pub fn clear_ranges(&self) {
        let inner = self.inner.lock().expect("table map lock");
        for table in inner.values() {
            table.clear_ranges();
        }
    }

    /// Fold `other` into this map, table by table: ranges of tables already
    /// present move into the existing `TableInfo`; new tables transfer
    /// wholesale. `other` is left empty.
    pub fn merge(&self, other: &TableInfoMap) {
        let mut ours = self.inner.lock().expect("table map lock");
        let mut theirs = other.inner.lock().expect("table map lock");
        for (id, info) in theirs.drain() {
            match ours.get(&id) {
                Some(existing) => {
                    for range in info.drain_ranges() {
                        existing.add_range(range);
                    }
                }
                None => {
                    ours.insert(id, info);
                }
            }
        }
    }
}
