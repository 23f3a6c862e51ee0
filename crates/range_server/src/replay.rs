//! Foreign-initiated replay.
//!
//! Another node (or the master, recovering a dead server) streams commit-log
//! blocks at us: `replay_begin` opens a scratch log and hands back a session
//! id, `replay_load_range` stages ranges in the replay map, `replay_update`
//! writes blocks through the scratch log and applies them in place, and
//! `replay_commit` links the scratch log into the tier log and promotes the
//! staged ranges. Every call after `replay_begin` must present the session
//! id, so two interleaved cycles can never commit into each other's tier.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use crate::commit_log::CommitLog;
use crate::error::{Error, Result};
use crate::key::{self, Key};
use crate::range::Range;
use crate::server::{RangeServer, ReplayGroup, ReplaySession};
use crate::table_info::TableInfo;
use crate::types::{read_i64, read_u32, RangeSpec, RangeState, TableIdentifier, METADATA_ID};

impl RangeServer {
    /// Open a fresh replay session for `group`, recreating the scratch log
    /// directory. Returns the session id the other calls must present.
    pub fn replay_begin(&self, group: ReplayGroup) -> Result<u64> {
        let replay_dir = self.log_dir().join("replay");

        self.ctx.replay_map.clear_ranges();

        if replay_dir.exists() {
            std::fs::remove_dir_all(&replay_dir)?;
        }
        std::fs::create_dir_all(&replay_dir)?;

        let log = Arc::new(CommitLog::open(
            &replay_dir,
            self.ctx.config.log_roll_limit,
        )?);
        let id = self.ctx.replay_session_seq.fetch_add(1, Ordering::SeqCst);
        *self.ctx.replay_session.lock().expect("replay session lock") = Some(ReplaySession {
            id,
            group,
            log,
        });
        tracing::info!(session = id, ?group, "replay started");
        Ok(id)
    }

    /// Stage a range in the replay map. Unlike `load_range` this never
    /// writes a METADATA location entry.
    pub fn replay_load_range(
        &self,
        session_id: u64,
        table: &TableIdentifier,
        spec: &RangeSpec,
        state: &RangeState,
    ) -> Result<()> {
        self.check_session(session_id)?;
        let range = self.replay_load_range_core(table, spec, state)?;
        if let Some(txn) = self.range_txn_log() {
            txn.log_range_loaded(table, spec, state)?;
        }
        tracing::info!(range = %range.name(), "replay loaded range");
        Ok(())
    }

    /// Decode framed blocks, write them through the session's scratch log,
    /// and apply them to the staged ranges.
    pub fn replay_update(&self, session_id: u64, data: &[u8]) -> Result<()> {
        let log = {
            let session = self.ctx.replay_session.lock().expect("replay session lock");
            let session = session
                .as_ref()
                .filter(|s| s.id == session_id)
                .ok_or_else(|| stale_session(session_id))?;
            session.log.clone()
        };

        let mut offset = 0usize;
        while offset < data.len() {
            let block_size = read_u32(data, &mut offset)? as usize;
            let revision = read_i64(data, &mut offset)?;
            if offset + block_size > data.len() {
                return Err(Error::MalformedRequest(format!(
                    "block (size={block_size}) exceeds end of message"
                )));
            }
            let payload = &data[offset..offset + block_size];
            offset += block_size;

            log.write(payload, revision)?;
            self.replay_apply_block(payload)?;
        }
        Ok(())
    }

    /// Link the scratch log into the tier log selected at `replay_begin`,
    /// finalize the staged ranges, and merge them into the live map.
    pub fn replay_commit(&self, session_id: u64) -> Result<()> {
        let session = {
            let mut slot = self.ctx.replay_session.lock().expect("replay session lock");
            match slot.take() {
                Some(session) if session.id == session_id => session,
                other => {
                    // Put back whatever was there; this caller is stale.
                    *slot = other;
                    return Err(stale_session(session_id));
                }
            }
        };

        let tier = self.tier_log(session.group)?;
        tier.link_log(&session.log)?;

        self.finalize_and_merge();
        tracing::info!(session = session.id, group = ?session.group, "replay committed");
        Ok(())
    }

    fn check_session(&self, session_id: u64) -> Result<()> {
        let session = self.ctx.replay_session.lock().expect("replay session lock");
        match session.as_ref() {
            Some(session) if session.id == session_id => Ok(()),
            _ => Err(stale_session(session_id)),
        }
    }

    /// Apply one decoded block payload to the replay map. Unknown tables or
    /// rows are hard errors here; the sender chose what we host.
    pub(crate) fn replay_apply_block(&self, payload: &[u8]) -> Result<()> {
        let mut offset = 0usize;
        let table = TableIdentifier::decode(payload, &mut offset)?;
        let table_info = self.ctx.replay_map.get(table.id).ok_or_else(|| {
            Error::RangeNotFound(format!(
                "unable to find table info for table name='{}' id={}",
                table.name, table.id
            ))
        })?;

        while offset < payload.len() {
            let cell = Key::load(payload, &mut offset)?;
            let value = key::decode_value(payload, &mut offset)?;
            let range = table_info.find_containing_range(&cell.row).ok_or_else(|| {
                Error::RangeNotFound(format!(
                    "unable to find range for row '{}'",
                    String::from_utf8_lossy(&cell.row)
                ))
            })?;
            let mut guard = range.lock();
            if let Err(err) = guard.add(&cell, &value) {
                tracing::warn!(error = %err, "replay apply: Range::add failed");
            }
        }
        Ok(())
    }

    /// Stage one range in the replay map: reuse the staged table entry, or
    /// shallow-copy the live one, or create it fresh.
    pub(crate) fn replay_load_range_core(
        &self,
        table: &TableIdentifier,
        spec: &RangeSpec,
        state: &RangeState,
    ) -> Result<Arc<Range>> {
        let (table_info, register) = match self.ctx.replay_map.get(table.id) {
            Some(info) => (info, false),
            None => match self.ctx.live_map.get(table.id) {
                Some(live) => (Arc::new(live.create_shallow_copy()), true),
                None => (Arc::new(TableInfo::new(table, None)), true),
            },
        };
        let schema = self.verify_schema(&table_info, table)?;
        if register {
            self.ctx.replay_map.set(table.id, table_info.clone());
        }

        if table_info.get_range(spec).is_some() {
            return Err(Error::RangeAlreadyLoaded(format!("{}{}", table.name, spec)));
        }

        let size_limit = if table.id == METADATA_ID && self.ctx.config.range_metadata_max_bytes > 0
        {
            self.ctx.config.range_metadata_max_bytes
        } else {
            self.ctx.config.range_max_bytes
        };
        let range = Arc::new(Range::new(table.clone(), schema, spec, state, size_limit));
        range.recovery_initialize();
        table_info.add_range(range.clone());
        Ok(range)
    }
}

fn stale_session(session_id: u64) -> Error {
    Error::Protocol(format!("replay session {session_id} is not active"))
}
