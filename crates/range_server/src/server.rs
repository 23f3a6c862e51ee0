//! The range server: shared context, startup, and the foreground paths other
//! than `update` (which lives in `update.rs`).

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, OnceLock, RwLock};
use std::time::{Duration, Instant};

use crate::commit_log::{CommitLog, CommitLogReader};
use crate::config::Config;
use crate::coordinator::{Coordinator, ExistenceLock};
use crate::error::{Error, Result};
use crate::key;
use crate::maintenance::MaintenanceQueue;
use crate::master::MasterClient;
use crate::meta_log::RangeTxnLog;
use crate::range::{Range, ScanSpec};
use crate::scanner_map::ScannerMap;
use crate::schema::{metadata_schema, Schema};
use crate::table_info::{TableInfo, TableInfoMap};
use crate::types::{RangeSpec, RangeState, TableIdentifier, END_ROOT_ROW, METADATA_ID};

/// Replay tier selector carried by the replay command group.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReplayGroup {
    MetadataRoot,
    Metadata,
    User,
}

impl TryFrom<u16> for ReplayGroup {
    type Error = Error;

    fn try_from(value: u16) -> Result<Self> {
        match value {
            0 => Ok(ReplayGroup::MetadataRoot),
            1 => Ok(ReplayGroup::Metadata),
            2 => Ok(ReplayGroup::User),
            other => Err(Error::Protocol(format!("unknown replay group {other}"))),
        }
    }
}

#[derive(Default)]
pub(crate) struct RecoveryFlags {
    pub root_done: bool,
    pub metadata_done: bool,
    pub user_done: bool,
}

/// Recovery completion flags plus the condition variable foreground
/// operations block on.
pub(crate) struct RecoveryState {
    pub flags: Mutex<RecoveryFlags>,
    pub cond: Condvar,
}

impl RecoveryState {
    fn new() -> Self {
        Self {
            flags: Mutex::new(RecoveryFlags::default()),
            cond: Condvar::new(),
        }
    }

    pub fn set_root_done(&self) {
        let mut flags = self.flags.lock().expect("recovery lock");
        flags.root_done = true;
        drop(flags);
        self.cond.notify_all();
    }

    pub fn set_metadata_done(&self) {
        let mut flags = self.flags.lock().expect("recovery lock");
        flags.metadata_done = true;
        drop(flags);
        self.cond.notify_all();
    }

    pub fn set_user_done(&self) {
        let mut flags = self.flags.lock().expect("recovery lock");
        flags.user_done = true;
        drop(flags);
        self.cond.notify_all();
    }

    pub fn user_done(&self) -> bool {
        self.flags.lock().expect("recovery lock").user_done
    }

    pub fn root_done(&self) -> bool {
        self.flags.lock().expect("recovery lock").root_done
    }

    pub fn metadata_done(&self) -> bool {
        self.flags.lock().expect("recovery lock").metadata_done
    }

    /// Block until the whole replay (all tiers) has finished.
    pub fn wait_user_done(&self) {
        let mut flags = self.flags.lock().expect("recovery lock");
        while !flags.user_done {
            tracing::info!("waiting for recovery to complete");
            flags = self.cond.wait(flags).expect("recovery wait");
        }
    }

    /// Block on the flag matching the target range's tier.
    pub fn wait_for(&self, table_id: u32, end_row: &[u8]) {
        let mut flags = self.flags.lock().expect("recovery lock");
        if table_id == METADATA_ID {
            if end_row == END_ROOT_ROW {
                while !flags.root_done {
                    tracing::info!("waiting for ROOT recovery to complete");
                    flags = self.cond.wait(flags).expect("recovery wait");
                }
            } else {
                while !flags.metadata_done {
                    tracing::info!("waiting for METADATA recovery to complete");
                    flags = self.cond.wait(flags).expect("recovery wait");
                }
            }
        } else {
            while !flags.user_done {
                tracing::info!("waiting for recovery to complete");
                flags = self.cond.wait(flags).expect("recovery wait");
            }
        }
    }
}

/// Tier commit logs, opened lazily as their first range arrives.
#[derive(Default)]
pub(crate) struct TierLogs {
    pub root: Option<Arc<CommitLog>>,
    pub metadata: Option<Arc<CommitLog>>,
    pub user: Option<Arc<CommitLog>>,
}

/// A foreign-initiated replay session. Commands must present the session id
/// handed out by `replay_begin`, so interleaved cycles cannot cross tiers.
pub(crate) struct ReplaySession {
    pub id: u64,
    pub group: ReplayGroup,
    pub log: Arc<CommitLog>,
}

/// Shared state of one server process. This is deliberately an explicit
/// context object handed to every operation; nothing here is a process-wide
/// static, and all fields are wired once at construction.
pub(crate) struct ServerContext {
    pub config: Config,
    pub coordinator: Arc<dyn Coordinator>,
    pub master: Arc<dyn MasterClient>,
    pub live_map: TableInfoMap,
    pub replay_map: TableInfoMap,
    pub scanner_map: ScannerMap,
    pub maintenance_queue: MaintenanceQueue,
    pub recovery: RecoveryState,
    pub logs: RwLock<TierLogs>,
    pub range_txn_log: RwLock<Option<Arc<RangeTxnLog>>>,
    pub replay_session: Mutex<Option<ReplaySession>>,
    pub replay_session_seq: AtomicU64,
    pub metadata_table: OnceLock<Arc<TableInfo>>,
    /// Serializes table registration and the metadata one-shot initializer.
    pub state_mutex: Mutex<()>,
    pub update_mutex_a: Mutex<()>,
    pub update_mutex_b: Mutex<()>,
    pub bytes_loaded: AtomicU64,
    pub last_log_cleanup: Mutex<Instant>,
    pub prune_threshold_min: AtomicU64,
    pub prune_threshold_max: AtomicU64,
    pub shutting_down: AtomicBool,
    pub timer_lock: Mutex<bool>,
    pub timer_cond: Condvar,
    pub existence_lock: Mutex<Option<ExistenceLock>>,
}

/// Handle to a running range server. Cheap to clone; all clones share one
/// [`ServerContext`].
#[derive(Clone)]
pub struct RangeServer {
    pub(crate) ctx: Arc<ServerContext>,
}

/// Output of `create_scanner` / `fetch_scanblock`.
#[derive(Clone, Debug)]
pub struct ScanBlock {
    pub scanner_id: u32,
    pub more: bool,
    pub data: Vec<u8>,
    pub cell_count: usize,
}

impl RangeServer {
    /// Bring up a node: take the existence lock, create the log directories,
    /// run local recovery, then start maintenance and the periodic timer.
    pub fn start(
        config: Config,
        coordinator: Arc<dyn Coordinator>,
        master: Arc<dyn MasterClient>,
    ) -> Result<Self> {
        let maintenance_queue = MaintenanceQueue::new(config.maintenance_threads);
        let (prune_min, prune_max) = config.prune_thresholds();

        let ctx = Arc::new(ServerContext {
            coordinator,
            master,
            live_map: TableInfoMap::new(),
            replay_map: TableInfoMap::new(),
            scanner_map: ScannerMap::new(),
            maintenance_queue,
            recovery: RecoveryState::new(),
            logs: RwLock::new(TierLogs::default()),
            range_txn_log: RwLock::new(None),
            replay_session: Mutex::new(None),
            replay_session_seq: AtomicU64::new(1),
            metadata_table: OnceLock::new(),
            state_mutex: Mutex::new(()),
            update_mutex_a: Mutex::new(()),
            update_mutex_b: Mutex::new(()),
            bytes_loaded: AtomicU64::new(0),
            last_log_cleanup: Mutex::new(Instant::now()),
            prune_threshold_min: AtomicU64::new(prune_min),
            prune_threshold_max: AtomicU64::new(prune_max),
            shutting_down: AtomicBool::new(false),
            timer_lock: Mutex::new(false),
            timer_cond: Condvar::new(),
            existence_lock: Mutex::new(None),
            config,
        });
        let server = Self { ctx };

        server.initialize()?;

        // No maintenance may run while the tiers replay.
        server.ctx.maintenance_queue.stop();
        server.local_recover()?;
        server.ctx.maintenance_queue.start();

        server.spawn_timer_thread();
        tracing::info!(location = %server.ctx.config.location, "range server started");
        Ok(server)
    }

    /// Create the namespace, take the exclusive existence lock, and create
    /// the user/range-txn log directories.
    fn initialize(&self) -> Result<()> {
        let config = &self.ctx.config;
        let coordinator = &self.ctx.coordinator;

        coordinator.mkdirs(&format!("{}/servers", config.toplevel_dir))?;
        let server_node = config.server_namespace();
        loop {
            if coordinator.try_lock_exclusive(&server_node)? {
                break;
            }
            tracing::info!(node = %server_node, "waiting for exclusive lock on existence file");
            std::thread::sleep(Duration::from_millis(5_000));
        }
        *self.ctx.existence_lock.lock().expect("existence lock slot") = Some(ExistenceLock::new(
            self.ctx.coordinator.clone(),
            server_node,
        ));

        let log_dir = config.log_dir();
        std::fs::create_dir_all(log_dir.join("user"))?;
        std::fs::create_dir_all(log_dir.join("range_txn"))?;
        tracing::info!(log_dir = %log_dir.display(), "log directory ready");
        Ok(())
    }

    pub fn location(&self) -> &str {
        &self.ctx.config.location
    }

    pub(crate) fn log_dir(&self) -> PathBuf {
        self.ctx.config.log_dir()
    }

    // ---- tier log management ----

    pub(crate) fn user_log(&self) -> Result<Arc<CommitLog>> {
        self.ctx
            .logs
            .read()
            .expect("logs lock")
            .user
            .clone()
            .ok_or_else(|| Error::Io("user commit log not open".into()))
    }

    pub(crate) fn ensure_user_log(&self) -> Result<Arc<CommitLog>> {
        let mut logs = self.ctx.logs.write().expect("logs lock");
        if let Some(log) = &logs.user {
            return Ok(log.clone());
        }
        let log = Arc::new(CommitLog::open(
            self.log_dir().join("user"),
            self.ctx.config.log_roll_limit,
        )?);
        logs.user = Some(log.clone());
        Ok(log)
    }

    pub(crate) fn ensure_root_log(&self) -> Result<Arc<CommitLog>> {
        let mut logs = self.ctx.logs.write().expect("logs lock");
        if let Some(log) = &logs.root {
            return Ok(log.clone());
        }
        let log = Arc::new(CommitLog::open(
            self.log_dir().join("root"),
            self.ctx.config.log_roll_limit,
        )?);
        logs.root = Some(log.clone());
        Ok(log)
    }

    pub(crate) fn ensure_metadata_log(&self) -> Result<Arc<CommitLog>> {
        let mut logs = self.ctx.logs.write().expect("logs lock");
        if let Some(log) = &logs.metadata {
            return Ok(log.clone());
        }
        let log = Arc::new(CommitLog::open(
            self.log_dir().join("metadata"),
            self.ctx.config.log_roll_limit,
        )?);
        logs.metadata = Some(log.clone());
        Ok(log)
    }

    pub(crate) fn tier_log(&self, group: ReplayGroup) -> Result<Arc<CommitLog>> {
        match group {
            ReplayGroup::MetadataRoot => self.ensure_root_log(),
            ReplayGroup::Metadata => self.ensure_metadata_log(),
            ReplayGroup::User => self.ensure_user_log(),
        }
    }

    pub(crate) fn range_txn_log(&self) -> Option<Arc<RangeTxnLog>> {
        self.ctx.range_txn_log.read().expect("range txn lock").clone()
    }

    // ---- schema handling ----

    /// Ensure `table_info` carries a schema at least as new as the request's
    /// generation, fetching the document from the coordinator when needed.
    pub(crate) fn verify_schema(
        &self,
        table_info: &TableInfo,
        table: &TableIdentifier,
    ) -> Result<Arc<Schema>> {
        if let Some(schema) = table_info.get_schema() {
            if schema.generation >= table.generation {
                return Ok(schema);
            }
        }

        let schema = if table.id == METADATA_ID {
            Arc::new(metadata_schema())
        } else {
            let document = self
                .ctx
                .coordinator
                .attr_get(&self.ctx.config.table_namespace(&table.name), "schema")?;
            let text = String::from_utf8(document)
                .map_err(|_| Error::SchemaParse("schema document is not utf-8".into()))?;
            Arc::new(Schema::parse(&text)?)
        };

        if schema.generation < table.generation {
            return Err(Error::GenerationMismatch(format!(
                "fetched schema generation for table '{}' is {} but supplied is {}",
                table.name, schema.generation, table.generation
            )));
        }
        table_info.update_schema(schema.clone());
        Ok(schema)
    }

    /// One-shot METADATA table accessor, initialized under the state mutex.
    pub(crate) fn metadata_table(&self) -> Result<Arc<TableInfo>> {
        if let Some(info) = self.ctx.metadata_table.get() {
            return Ok(info.clone());
        }
        let _guard = self.ctx.state_mutex.lock().expect("state mutex");
        if let Some(info) = self.ctx.metadata_table.get() {
            return Ok(info.clone());
        }
        let info = self
            .ctx
            .live_map
            .get(METADATA_ID)
            .ok_or_else(|| Error::TableNotFound("METADATA table not loaded".into()))?;
        let _ = self.ctx.metadata_table.set(info.clone());
        Ok(info)
    }

    /// Write a `Location` cell (or tombstone) for `table_id:end_row` through
    /// the regular update path into the METADATA table.
    pub(crate) fn write_metadata_location(
        &self,
        table_id: u32,
        end_row: &[u8],
        value: &[u8],
    ) -> Result<()> {
        let metadata = self.metadata_table()?;
        let schema = metadata
            .get_schema()
            .unwrap_or_else(|| Arc::new(metadata_schema()));
        let location_cf = schema
            .column_family_id("Location")
            .ok_or_else(|| Error::SchemaParse("METADATA schema lacks Location".into()))?;

        let mut row = format!("{table_id}:").into_bytes();
        row.extend_from_slice(end_row);

        let mut buffer = Vec::new();
        key::encode_key(&mut buffer, &row, location_cf, b"", None);
        key::encode_value(&mut buffer, value);

        let table = TableIdentifier::new(METADATA_ID, metadata.name(), schema.generation);
        let response = self.update(&table, 1, buffer)?;
        if let Some(rec) = response.send_back.first() {
            return Err(Error::OutOfRange(format!(
                "METADATA location write bounced with code {:#x}",
                rec.error
            )));
        }
        Ok(())
    }

    // ---- scanner path ----

    pub fn create_scanner(
        &self,
        table: &TableIdentifier,
        spec: &RangeSpec,
        scan_spec: &ScanSpec,
    ) -> Result<ScanBlock> {
        self.ctx
            .recovery
            .wait_for(table.id, &spec.normalized_end_row());

        scan_spec.validate()?;

        let table_info = self
            .ctx
            .live_map
            .get(table.id)
            .ok_or_else(|| Error::RangeNotFound(format!("unknown table '{}'", table.name)))?;
        let range = table_info
            .get_range(spec)
            .ok_or_else(|| Error::RangeNotFound(format!("{}{}", table.name, spec)))?;
        self.verify_schema(&table_info, table)?;

        range.increment_scan_counter();
        let result = self.create_scanner_locked(table, spec, scan_spec, &range);
        range.decrement_scan_counter();
        result
    }

    fn create_scanner_locked(
        &self,
        table: &TableIdentifier,
        spec: &RangeSpec,
        scan_spec: &ScanSpec,
        range: &Arc<Range>,
    ) -> Result<ScanBlock> {
        // The range may have shrunk between lookup and counter acquisition.
        if range.start_row() != spec.start_row || range.end_row() != spec.normalized_end_row() {
            return Err(Error::RangeNotFound(format!("{}{}", table.name, spec)));
        }

        let mut scanner = range.create_scanner(scan_spec, range.scan_revision())?;
        let (data, cell_count, more) = scanner.fill_block(self.ctx.config.scan_block_bytes);
        let scanner_id = if more {
            self.ctx.scanner_map.put(scanner, range.clone())
        } else {
            0
        };
        tracing::debug!(
            table = %table.name,
            scanner_id,
            cells = cell_count,
            more,
            "created scanner"
        );
        Ok(ScanBlock {
            scanner_id,
            more,
            data,
            cell_count,
        })
    }

    pub fn fetch_scanblock(&self, scanner_id: u32) -> Result<ScanBlock> {
        let (scanner, _range) = self
            .ctx
            .scanner_map
            .get(scanner_id)
            .ok_or(Error::InvalidScannerId(scanner_id))?;

        let mut scanner = scanner.lock().expect("scanner lock");
        let (data, cell_count, more) = scanner.fill_block(self.ctx.config.scan_block_bytes);
        drop(scanner);

        if !more {
            self.ctx.scanner_map.remove(scanner_id);
        }
        Ok(ScanBlock {
            scanner_id,
            more,
            data,
            cell_count,
        })
    }

    pub fn destroy_scanner(&self, scanner_id: u32) {
        tracing::debug!(scanner_id, "destroying scanner");
        self.ctx.scanner_map.remove(scanner_id);
    }

    // ---- load/drop path ----

    pub fn load_range(
        &self,
        table: &TableIdentifier,
        spec: &RangeSpec,
        transfer_log_dir: Option<&std::path::Path>,
        state: &RangeState,
    ) -> Result<()> {
        self.ctx.recovery.wait_user_done();

        let is_root = table.id == METADATA_ID
            && spec.start_row.is_empty()
            && spec.normalized_end_row() == END_ROOT_ROW;

        // Insert-or-get the table entry, double-checked under the state lock.
        let (table_info, register) = {
            let _guard = self.ctx.state_mutex.lock().expect("state mutex");
            match self.ctx.live_map.get(table.id) {
                Some(info) => (info, false),
                None => (Arc::new(TableInfo::new(table, None)), true),
            }
        };
        let schema = self.verify_schema(&table_info, table)?;
        if register {
            self.ctx.live_map.set(table.id, table_info.clone());
        }

        if table_info.get_range(spec).is_some() {
            return Err(Error::RangeAlreadyLoaded(format!(
                "{}{}",
                table.name, spec
            )));
        }

        // Take ownership: the ROOT location lives in the coordinator, every
        // other range advertises itself in METADATA.
        if is_root {
            tracing::info!("loading ROOT metadata range");
            self.ctx.coordinator.attr_set(
                &self.ctx.config.root_namespace(),
                "Location",
                self.ctx.config.location.as_bytes(),
            )?;
        } else {
            self.write_metadata_location(
                table.id,
                &spec.normalized_end_row(),
                self.ctx.config.location.as_bytes(),
            )?;
        }

        // Per-access-group data directories keyed by the hashed end row.
        let end_row = spec.normalized_end_row();
        let digest = format!("{:x}", md5::compute(&end_row));
        let range_subdir = &digest[..24];
        let table_dir = self.ctx.config.table_dir(&table.name);
        for ag in &schema.access_groups {
            std::fs::create_dir_all(table_dir.join(&ag.name).join(range_subdir))?;
        }

        let range = Arc::new(Range::new(
            table.clone(),
            schema,
            spec,
            state,
            self.ctx.config.range_max_bytes,
        ));

        // Make sure the tier log exists before its first commit.
        if table.id == METADATA_ID {
            if is_root {
                self.ensure_root_log()?;
            } else {
                self.ensure_metadata_log()?;
            }
        }

        // The range is not yet published, so replaying the transfer log needs
        // no locking discipline beyond the structure lock.
        if let Some(dir) = transfer_log_dir {
            let mut reader = CommitLogReader::open(dir)?;
            let applied = range.replay_transfer_log(&mut reader)?;
            let tier = if is_root {
                ReplayGroup::MetadataRoot
            } else if table.id == METADATA_ID {
                ReplayGroup::Metadata
            } else {
                ReplayGroup::User
            };
            let foreign = CommitLog::open(dir, self.ctx.config.log_roll_limit)?;
            self.tier_log(tier)?.link_log(&foreign)?;
            tracing::info!(
                range = %range.name(),
                cells = applied,
                transfer_log = %dir.display(),
                "replayed transfer log"
            );
        }

        table_info.add_range(range.clone());

        if let Some(txn) = self.range_txn_log() {
            txn.log_range_loaded(table, spec, state)?;
        }
        tracing::info!(range = %range.name(), "loaded range");
        Ok(())
    }

    pub fn drop_range(&self, table: &TableIdentifier, spec: &RangeSpec) -> Result<()> {
        let table_info = self.ctx.live_map.get(table.id).ok_or_else(|| {
            Error::RangeNotFound(format!("no ranges loaded for table '{}'", table.name))
        })?;
        let range = table_info
            .remove_range(spec)
            .ok_or_else(|| Error::RangeNotFound(format!("{}{}", table.name, spec)))?;
        range.drop_range();
        Ok(())
    }

    pub fn drop_table(&self, table: &TableIdentifier) -> Result<()> {
        self.ctx.recovery.wait_user_done();

        match self.ctx.live_map.remove(table.id) {
            Some(table_info) => {
                let mut ranges = Vec::new();
                table_info.get_range_vector(&mut ranges);
                for range in &ranges {
                    range.drop_range();
                    // Tombstone the METADATA location entry.
                    if table.id != METADATA_ID {
                        if let Err(err) =
                            self.write_metadata_location(table.id, &range.end_row(), b"!")
                        {
                            tracing::error!(
                                range = %range.name(),
                                error = %err,
                                "failed to tombstone METADATA location"
                            );
                        }
                    }
                }
            }
            None => {
                tracing::error!(table = %table.name, id = table.id, "drop_table: table not found");
            }
        }

        if let Some(txn) = self.range_txn_log() {
            txn.log_table_dropped(table)?;
        }
        tracing::info!(table = %table.name, "dropped table");
        Ok(())
    }

    pub fn compact(&self, table: &TableIdentifier, spec: &RangeSpec, major: bool) -> Result<()> {
        self.ctx.recovery.wait_user_done();

        let table_info = self.ctx.live_map.get(table.id).ok_or_else(|| {
            Error::RangeNotFound(format!("no ranges loaded for table '{}'", table.name))
        })?;
        let range = table_info
            .get_range(spec)
            .ok_or_else(|| Error::RangeNotFound(format!("{}{}", table.name, spec)))?;

        if range.test_and_set_maintenance() {
            self.ctx
                .maintenance_queue
                .add(Box::new(crate::tasks::CompactionTask::new(range, major)));
        }
        tracing::debug!(
            table = %table.name,
            end_row = %String::from_utf8_lossy(&spec.end_row),
            major,
            "compaction scheduled"
        );
        Ok(())
    }

    pub fn status(&self) -> Result<()> {
        Ok(())
    }

    /// Look up a hosted range by its exact interval. Embedding surface for
    /// admin tooling and tests.
    pub fn get_range(&self, table_id: u32, spec: &RangeSpec) -> Option<Arc<Range>> {
        self.ctx.live_map.get(table_id)?.get_range(spec)
    }

    /// Recovery completion flags `(root, metadata, user)`.
    pub fn recovery_state(&self) -> (bool, bool, bool) {
        (
            self.ctx.recovery.root_done(),
            self.ctx.recovery.metadata_done(),
            self.ctx.recovery.user_done(),
        )
    }

    // ---- periodic maintenance ----

    fn spawn_timer_thread(&self) {
        let server = self.clone();
        // Detached; shutdown stops it through the timer flag and condvar.
        let _ = std::thread::Builder::new()
            .name("maintenance-timer".to_string())
            .spawn(move || server.timer_loop())
            .expect("spawn timer thread");
    }

    fn timer_loop(&self) {
        let interval = Duration::from_millis(self.ctx.config.timer_interval_ms);
        let mut stopped = self.ctx.timer_lock.lock().expect("timer lock");
        loop {
            let (next, timeout) = self
                .ctx
                .timer_cond
                .wait_timeout(stopped, interval)
                .expect("timer wait");
            stopped = next;
            if *stopped {
                return;
            }
            if timeout.timed_out() {
                drop(stopped);
                self.do_maintenance();
                stopped = self.ctx.timer_lock.lock().expect("timer lock");
            }
        }
    }

    /// One periodic tick: purge expired scanners and, when enough of the
    /// interval has passed since the last cleanup, enqueue a log cleanup.
    pub fn do_maintenance(&self) {
        let ttl = Duration::from_millis(self.ctx.config.scanner_ttl_ms);
        self.ctx.scanner_map.purge_expired(ttl);

        let cleanup_due = {
            let mut last = self.ctx.last_log_cleanup.lock().expect("cleanup clock");
            let threshold = Duration::from_millis(self.ctx.config.timer_interval_ms * 4 / 5);
            if last.elapsed() >= threshold {
                *last = Instant::now();
                true
            } else {
                false
            }
        };
        if cleanup_due {
            self.ctx
                .maintenance_queue
                .add(Box::new(crate::tasks::LogCleanupTask::new(self.clone())));
        }

        let mut ranges = Vec::new();
        self.ctx.live_map.get_range_vector(&mut ranges);
        let memory: u64 = ranges.iter().map(|r| r.memory_usage()).sum();
        tracing::info!(bytes = memory, "memory usage");
    }

    // ---- shutdown ----

    /// Quiesce writers, bar further maintenance, close every log, and let go
    /// of the coordinator session.
    pub fn shutdown(&self) {
        if self.ctx.shutting_down.swap(true, Ordering::SeqCst) {
            return;
        }
        tracing::info!("shutting down range server");

        // Stop the timer first so no new cleanup tasks arrive.
        {
            let mut stopped = self.ctx.timer_lock.lock().expect("timer lock");
            *stopped = true;
        }
        self.ctx.timer_cond.notify_all();
        self.ctx.maintenance_queue.shutdown();

        // Block updates for good.
        let _guard_a = self.ctx.update_mutex_a.lock().expect("update mutex a");
        let _guard_b = self.ctx.update_mutex_b.lock().expect("update mutex b");

        // Bump the update counter on every live range so no maintenance task
        // could ever quiesce again.
        let mut ranges = Vec::new();
        self.ctx.live_map.get_range_vector(&mut ranges);
        for range in &ranges {
            range.increment_update_counter();
        }

        if let Some(txn) = self.range_txn_log() {
            if let Err(err) = txn.close() {
                tracing::warn!(error = %err, "failed to close range txn log");
            }
        }
        let logs = self.ctx.logs.read().expect("logs lock");
        for log in [&logs.root, &logs.metadata, &logs.user].into_iter().flatten() {
            if let Err(err) = log.close() {
                tracing::warn!(error = %err, "failed to close commit log");
            }
        }
        drop(logs);

        // Release the coordinator session.
        self.ctx
            .existence_lock
            .lock()
            .expect("existence lock slot")
            .take();
    }
}
