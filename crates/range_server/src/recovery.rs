//! Cold-start recovery.
//!
//! When the range transaction log exists, the server replays its hosted
//! ranges tier by tier (ROOT first, then the other METADATA ranges, then
//! user ranges), opening each tier's live commit log and waking waiters as
//! the tier completes. Without it, the node starts empty with every tier
//! immediately available.

use crate::commit_log::CommitLogReader;
use crate::error::Result;
use crate::key::{self, Key};
use crate::meta_log::{self, RangeStateInfo, RangeTxnLog};
use crate::server::RangeServer;
use crate::types::{TableIdentifier, END_ROOT_ROW, METADATA_ID};

impl RangeServer {
    /// Replay local state from the commit logs. Any failure here is fatal to
    /// startup; the caller aborts the process.
    pub(crate) fn local_recover(&self) -> Result<()> {
        let meta_log_path = self.log_dir().join("range_txn").join("0.log");

        if !meta_log_path.exists() {
            // Nothing was hosted here. Open fresh logs and report every tier
            // recovered.
            self.ensure_user_log()?;
            *self.ctx.range_txn_log.write().expect("range txn lock") =
                Some(std::sync::Arc::new(RangeTxnLog::open(&meta_log_path)?));
            self.ctx.recovery.set_root_done();
            self.ctx.recovery.set_metadata_done();
            self.ctx.recovery.set_user_done();
            return Ok(());
        }

        tracing::info!(log = %meta_log_path.display(), "found range transaction log, recovering");
        let range_states = meta_log::load_range_states(&meta_log_path)?;

        // Tier 1: the ROOT metadata range.
        self.ctx.replay_map.clear();
        for info in range_states.iter().filter(|i| is_root_state(i)) {
            self.replay_load_range_core(&info.table, &info.spec, &info.state)?;
        }
        let had_root = !self.ctx.replay_map.is_empty();
        if had_root {
            let mut reader = CommitLogReader::open(self.log_dir().join("root"))?;
            self.replay_log(&mut reader)?;
            self.finalize_and_merge();
        }
        if had_root {
            self.ensure_root_log()?;
        }
        self.ctx.recovery.set_root_done();

        // Tier 2: the remaining METADATA ranges.
        self.ctx.replay_map.clear();
        for info in range_states
            .iter()
            .filter(|i| i.table.id == METADATA_ID && !is_root_state(i))
        {
            self.replay_load_range_core(&info.table, &info.spec, &info.state)?;
        }
        let had_metadata = !self.ctx.replay_map.is_empty();
        if had_metadata {
            let mut reader = CommitLogReader::open(self.log_dir().join("metadata"))?;
            self.replay_log(&mut reader)?;
            self.finalize_and_merge();
        }
        if had_metadata {
            self.ensure_metadata_log()?;
        }
        self.ctx.recovery.set_metadata_done();

        // Tier 3: user ranges.
        self.ctx.replay_map.clear();
        for info in range_states.iter().filter(|i| i.table.id != METADATA_ID) {
            self.replay_load_range_core(&info.table, &info.spec, &info.state)?;
        }
        if !self.ctx.replay_map.is_empty() {
            let mut reader = CommitLogReader::open(self.log_dir().join("user"))?;
            self.replay_log(&mut reader)?;
            self.finalize_and_merge();
        }
        self.ensure_user_log()?;
        *self.ctx.range_txn_log.write().expect("range txn lock") =
            Some(std::sync::Arc::new(RangeTxnLog::open(&meta_log_path)?));
        self.ctx.recovery.set_user_done();

        tracing::info!(ranges = range_states.len(), "local recovery complete");
        Ok(())
    }

    /// Run post-replay hooks on every replayed range, then fold the replay
    /// map into the live map.
    pub(crate) fn finalize_and_merge(&self) {
        let mut ranges = Vec::new();
        self.ctx.replay_map.get_range_vector(&mut ranges);
        for range in &ranges {
            range.recovery_finalize();
        }
        self.ctx.live_map.merge(&self.ctx.replay_map);
    }

    /// Replay every block of one tier's log into the replay map. Cells whose
    /// table or range is not staged there are skipped; the log may carry
    /// neighbours that moved away since.
    pub(crate) fn replay_log(&self, reader: &mut CommitLogReader) -> Result<()> {
        let mut block_count = 0u32;
        loop {
            let block = match reader.next() {
                Ok(Some(block)) => block,
                Ok(None) => break,
                // A torn tail block never committed; replay ends here.
                Err(crate::error::Error::RequestTruncated(msg)) => {
                    tracing::warn!(
                        log = %reader.log_dir().display(),
                        detail = %msg,
                        "stopping replay at truncated block"
                    );
                    break;
                }
                Err(err) => return Err(err),
            };
            let mut offset = 0usize;
            let table = TableIdentifier::decode(&block.payload, &mut offset)?;
            let Some(table_info) = self.ctx.replay_map.get(table.id) else {
                continue;
            };

            while offset < block.payload.len() {
                let cell = Key::load(&block.payload, &mut offset)?;
                let value = key::decode_value(&block.payload, &mut offset)?;
                let Some(range) = table_info.find_containing_range(&cell.row) else {
                    continue;
                };
                let mut guard = range.lock();
                if let Err(err) = guard.add(&cell, &value) {
                    tracing::warn!(error = %err, "replay: Range::add failed");
                }
            }
            block_count += 1;
        }
        tracing::info!(
            blocks = block_count,
            log = %reader.log_dir().display(),
            "replayed update blocks"
        );
        Ok(())
    }
}

fn is_root_state(info: &RangeStateInfo) -> bool {
    info.table.id == METADATA_ID && info.spec.normalized_end_row() == END_ROOT_ROW
}
