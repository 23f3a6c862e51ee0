//! Process-wide registry of live scanners with TTL-based expiry.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::range::{Range, RangeScanner};

struct ScannerEntry {
    scanner: Arc<Mutex<RangeScanner>>,
    range: Arc<Range>,
    last_touch: Instant,
}

/// Registry of scanners that still have blocks to return. Ids are allocated
/// monotonically starting at 1; id 0 means "fully drained on create".
#[derive(Default)]
pub struct ScannerMap {
    inner: Mutex<HashMap<u32, ScannerEntry>>,
    next_id: AtomicU32,
}

impl ScannerMap {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(HashMap::new()),
            next_id: AtomicU32::new(1),
        }
    }

    pub fn put(&self, scanner: RangeScanner, range: Arc<Range>) -> u32 {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let mut inner = self.inner.lock().expect("scanner map lock");
        inner.insert(
            id,
            ScannerEntry {
                scanner: Arc::new(Mutex::new(scanner)),
                range,
                last_touch: Instant::now(),
            },
        );
        id
    }

    /// Look up a scanner, refreshing its TTL clock.
    pub fn get(&self, id: u32) -> Option<(Arc<Mutex<RangeScanner>>, Arc<Range>)> {
        let mut inner = self.inner.lock().expect("scanner map lock");
        let entry = inner.get_mut(&id)?;
        entry.last_touch = Instant::now();
        Some((entry.scanner.clone(), entry.range.clone()))
    }

    pub fn remove(&self, id: u32) -> bool {
        self.inner
            .lock()
            .expect("scanner map lock")
            .remove(&id)
            .is_some()
    }

    /// Drop scanners idle longer than `ttl`, releasing their range handles.
    pub fn purge_expired(&self, ttl: Duration) -> usize {
        let mut inner = self.inner.lock().expect("scanner map lock");
        let now = Instant::now();
        let before = inner.len();
        inner.retain(|id, entry| {
            let keep = now.duration_since(entry.last_touch) < ttl;
            if !keep {
                tracing::info!(scanner_id = id, range = %entry.range.name(), "expired scanner");
            }
            keep
        });
        before - inner.len()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect("scanner map lock").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
