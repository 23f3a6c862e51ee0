//! The write path.
//!
//! An update call runs through two serialized phases: phase A (classify and
//! stamp, under `update_mutex_a`) walks the buffer, routes each run of cells
//! to its range's destination buffer, and assigns revisions; phase B (commit
//! and apply, under `update_mutex_b`, with A released after B is taken)
//! writes the buffers to the tier logs and folds the cells into the
//! memtables. The A-to-B handoff lets the next writer classify while this
//! one commits, while keeping log-append order identical to stamp order.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use crate::commit_log::CommitLog;
use crate::error::{code, Error, Result};
use crate::key::{self, Key};
use crate::range::Range;
use crate::server::RangeServer;
use crate::types::{TableIdentifier, METADATA_ID, TIMESTAMP_NULL};

/// One packed send-back record: a run of cells bounced back to the client.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SendBackRec {
    pub error: u32,
    pub count: u32,
    pub offset: u32,
    pub len: u32,
}

/// Result of an update call. An empty send-back list means every cell was
/// accepted.
#[derive(Clone, Debug, Default)]
pub struct UpdateResponse {
    pub send_back: Vec<SendBackRec>,
}

/// Which destination buffer a run of stamped cells landed in.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum BufTarget {
    Go,
    Root,
    Split(usize),
}

struct RangeRun {
    range: Arc<Range>,
    target: BufTarget,
    offset: usize,
    len: usize,
}

struct SplitBuf {
    log: Arc<CommitLog>,
    buf: Vec<u8>,
}

struct OpenRun {
    range: Arc<Range>,
    target: BufTarget,
    offset: usize,
}

/// Working state of one update call.
struct UpdateState {
    encoded_table_len: usize,
    go_buf: Vec<u8>,
    root_buf: Vec<u8>,
    split_bufs: Vec<SplitBuf>,
    runs: Vec<RangeRun>,
    open: Option<OpenRun>,
    referenced: Vec<Arc<Range>>,
    send_back: Vec<SendBackRec>,
    pending: Option<(u32, u32, usize)>,
    last_revision: i64,
    total_added: u32,
    split_added: u32,
    misses: u32,
    cells_seen: u32,
}

impl UpdateState {
    fn new(table: &TableIdentifier, buffer_len: usize, count: u32) -> Self {
        // Each key can grow by up to 9 bytes when stamped (8 for the revision
        // plus a possible extra vint byte).
        let mut go_buf = Vec::with_capacity(
            table.encoded_length() + buffer_len + (count as usize) * 9,
        );
        table.encode(&mut go_buf);
        Self {
            encoded_table_len: table.encoded_length(),
            go_buf,
            root_buf: Vec::new(),
            split_bufs: Vec::new(),
            runs: Vec::new(),
            open: None,
            referenced: Vec::new(),
            send_back: Vec::new(),
            pending: None,
            last_revision: TIMESTAMP_NULL,
            total_added: 0,
            split_added: 0,
            misses: 0,
            cells_seen: 0,
        }
    }

    fn buf_len(&self, target: BufTarget) -> usize {
        match target {
            BufTarget::Go => self.go_buf.len(),
            BufTarget::Root => self.root_buf.len(),
            BufTarget::Split(idx) => self.split_bufs[idx].buf.len(),
        }
    }

    fn buf_mut(&mut self, target: BufTarget) -> &mut Vec<u8> {
        match target {
            BufTarget::Go => &mut self.go_buf,
            BufTarget::Root => &mut self.root_buf,
            BufTarget::Split(idx) => &mut self.split_bufs[idx].buf,
        }
    }

    fn buf(&self, target: BufTarget) -> &Vec<u8> {
        match target {
            BufTarget::Go => &self.go_buf,
            BufTarget::Root => &self.root_buf,
            BufTarget::Split(idx) => &self.split_bufs[idx].buf,
        }
    }

    fn open_run(&mut self, range: Arc<Range>, target: BufTarget) {
        self.open = Some(OpenRun {
            offset: self.buf_len(target),
            range,
            target,
        });
    }

    /// Close the open run, recording it if it routed any bytes.
    fn close_run(&mut self) {
        if let Some(open) = self.open.take() {
            let len = self.buf_len(open.target) - open.offset;
            if len > 0 {
                self.runs.push(RangeRun {
                    range: open.range,
                    target: open.target,
                    offset: open.offset,
                    len,
                });
            }
        }
    }

    /// Accumulate one bounced cell into the pending send-back run, closing
    /// the previous run when the error code changes.
    fn bounce(&mut self, error: u32, offset: usize) {
        match &mut self.pending {
            Some((code, count, _)) if *code == error => {
                *count += 1;
            }
            Some(_) => {
                self.flush_pending(offset);
                self.pending = Some((error, 1, offset));
            }
            None => {
                self.pending = Some((error, 1, offset));
            }
        }
        self.cells_seen += 1;
    }

    fn flush_pending(&mut self, end_offset: usize) {
        if let Some((error, count, offset)) = self.pending.take() {
            self.send_back.push(SendBackRec {
                error,
                count,
                offset: offset as u32,
                len: (end_offset - offset) as u32,
            });
        }
    }

    /// Reference a range once per call, bumping its update counter.
    /// Returns whether this call took the reference just now.
    fn reference(&mut self, range: &Arc<Range>) -> bool {
        if self.referenced.iter().any(|r| Arc::ptr_eq(r, range)) {
            return false;
        }
        range.increment_update_counter();
        self.referenced.push(range.clone());
        true
    }

    fn unreference(&mut self, range: &Arc<Range>) {
        if let Some(pos) = self.referenced.iter().position(|r| Arc::ptr_eq(r, range)) {
            let range = self.referenced.swap_remove(pos);
            range.decrement_update_counter();
        }
    }

    fn release_references(&mut self) {
        for range in self.referenced.drain(..) {
            range.decrement_update_counter();
        }
    }
}

impl RangeServer {
    /// Absorb a batch of mutations: classify and stamp each cell, commit the
    /// routed buffers to the tier logs, then apply them to the memtables.
    pub fn update(
        &self,
        table: &TableIdentifier,
        count: u32,
        buffer: Vec<u8>,
    ) -> Result<UpdateResponse> {
        self.ctx.recovery.wait_user_done();

        // The shared log clock is only available after local recovery.
        let user_log = self.user_log()?;
        let mut auto_revision = user_log.get_timestamp();

        let Some(table_info) = self.ctx.live_map.get(table.id) else {
            tracing::error!(table = %table.name, "unable to find table info");
            return Ok(UpdateResponse {
                send_back: vec![SendBackRec {
                    error: code::TABLE_NOT_FOUND,
                    count,
                    offset: 0,
                    len: buffer.len() as u32,
                }],
            });
        };
        self.verify_schema(&table_info, table)?;

        let mut state = UpdateState::new(table, buffer.len(), count);

        let guard_a = self.ctx.update_mutex_a.lock().expect("update mutex a");

        let classify = self.classify_and_stamp(
            table,
            &table_info,
            &buffer,
            count,
            &user_log,
            &mut auto_revision,
            &mut state,
        );
        if let Err(err) = classify {
            state.release_references();
            drop(guard_a);
            tracing::error!(table = %table.name, error = %err, "update classify failed");
            return Err(err);
        }

        tracing::debug!(
            table = %table.name,
            added = state.total_added,
            split_off = state.split_added,
            "classified updates"
        );

        let guard_b = self.ctx.update_mutex_b.lock().expect("update mutex b");
        drop(guard_a);

        if let Err(err) = self.commit(table, &user_log, &state) {
            state.release_references();
            drop(guard_b);
            tracing::error!(table = %table.name, error = %err, "update commit failed");
            return Err(err);
        }

        self.apply(&state);
        self.maintenance_kick(table, &state);

        state.release_references();
        drop(guard_b);

        self.ctx
            .bytes_loaded
            .fetch_add(buffer.len() as u64, Ordering::SeqCst);
        if state.misses > 0 {
            tracing::debug!(misses = state.misses, "sent back out-of-range updates");
        }

        Ok(UpdateResponse {
            send_back: state.send_back,
        })
    }

    /// Phase A: walk the buffer and route each run of cells, stamping
    /// revisions as they go.
    #[allow(clippy::too_many_arguments)]
    fn classify_and_stamp(
        &self,
        table: &TableIdentifier,
        table_info: &crate::table_info::TableInfo,
        buffer: &[u8],
        count: u32,
        user_log: &Arc<CommitLog>,
        auto_revision: &mut i64,
        state: &mut UpdateState,
    ) -> Result<()> {
        let max_clock_skew = self.ctx.config.max_clock_skew_us;
        let mut offset = 0usize;

        while offset < buffer.len() {
            let row = key::serialized_row(buffer, offset)?.to_vec();

            // A NUL-prefixed row means the rest of the buffer is suspect;
            // bounce everything from here on.
            if row.is_empty() {
                state.flush_pending(offset);
                state.send_back.push(SendBackRec {
                    error: code::BAD_KEY,
                    count: count.saturating_sub(state.cells_seen),
                    offset: offset as u32,
                    len: (buffer.len() - offset) as u32,
                });
                break;
            }

            let Some(range) = table_info.find_containing_range(&row) else {
                state.bounce(code::OUT_OF_RANGE, offset);
                state.misses += 1;
                offset += key::serialized_length(buffer, offset)?;
                offset += key::serialized_length(buffer, offset)?;
                continue;
            };

            // A sticky range error bounces its cells with that error.
            let range_error = range.get_error();
            if range_error != code::OK {
                state.bounce(range_error, offset);
                offset += key::serialized_length(buffer, offset)?;
                offset += key::serialized_length(buffer, offset)?;
                continue;
            }

            state.flush_pending(offset);

            let newly_referenced = state.reference(&range);

            // The range may have shrunk between lookup and reference.
            if !range.belongs(&row) {
                if newly_referenced {
                    state.unreference(&range);
                }
                continue;
            }

            let end_row = range.end_row();
            let (split, latest_range_revision) = range.get_split_info();

            // Clock-skew gate, evaluated against the first key of the run.
            let control = key::serialized_control(buffer, offset)?;
            if control & key::HAVE_REVISION == 0
                && latest_range_revision > TIMESTAMP_NULL
                && *auto_revision < latest_range_revision
            {
                let fresh = user_log.get_timestamp();
                if fresh > *auto_revision {
                    *auto_revision = fresh;
                }
                if *auto_revision < latest_range_revision {
                    let skew_us = (latest_range_revision - *auto_revision) / 1_000;
                    if skew_us > max_clock_skew {
                        return Err(Error::ClockSkew {
                            skew_us,
                            max_us: max_clock_skew,
                            range: range.name(),
                        });
                    }
                }
            }

            let split_target = split.as_ref().map(|(_, log)| {
                let mut buf = Vec::with_capacity(state.encoded_table_len);
                table.encode(&mut buf);
                state.split_bufs.push(SplitBuf {
                    log: log.clone(),
                    buf,
                });
                state.split_bufs.len() - 1
            });

            let home_target = if range.is_root() {
                if state.root_buf.is_empty() {
                    table.encode(&mut state.root_buf);
                }
                BufTarget::Root
            } else {
                BufTarget::Go
            };

            let mut target = home_target;
            let mut in_split_region = false;
            state.open_run(range.clone(), target);

            let mut run_row = row;
            while offset < buffer.len() {
                // A NUL row ends the run; the outer pass bounces the rest.
                if run_row.is_empty() || run_row.as_slice() > end_row.as_slice() {
                    break;
                }

                if let (Some((predicate, _)), Some(split_idx)) = (&split, split_target) {
                    if predicate.split_off(&run_row) {
                        if !in_split_region {
                            state.close_run();
                            target = BufTarget::Split(split_idx);
                            state.open_run(range.clone(), target);
                            in_split_region = true;
                        }
                        state.split_added += 1;
                    } else if in_split_region {
                        state.close_run();
                        target = home_target;
                        state.open_run(range.clone(), target);
                        in_split_region = false;
                    }
                }

                *auto_revision += 1;
                let dest = state.buf_mut(target);
                let stamped = key::transform_key(buffer, &mut offset, dest, *auto_revision)?;
                state.last_revision = stamped;

                // Reject client-supplied revisions that run backwards; the
                // auto-assigned lag case was already vetted by the skew gate.
                if stamped < latest_range_revision && stamped != *auto_revision {
                    return Err(Error::RevisionOrder(format!(
                        "supplied revision ({stamped}) is less than the most recently seen \
                         revision ({latest_range_revision}) for range {}",
                        range.name()
                    )));
                }

                let value_start = offset;
                let value_len = key::serialized_length(buffer, offset)?;
                offset += value_len;
                let dest = state.buf_mut(target);
                dest.extend_from_slice(&buffer[value_start..value_start + value_len]);

                state.total_added += 1;
                state.cells_seen += 1;

                if offset < buffer.len() {
                    run_row = key::serialized_row(buffer, offset)?.to_vec();
                }
            }
            state.close_run();
        }

        state.flush_pending(offset);
        Ok(())
    }

    /// Phase B: write the routed buffers to their logs. A failed log write
    /// aborts the whole call; the log is the durability point.
    fn commit(
        &self,
        table: &TableIdentifier,
        user_log: &Arc<CommitLog>,
        state: &UpdateState,
    ) -> Result<()> {
        if state.root_buf.len() > state.encoded_table_len {
            let root_log = self.ensure_root_log()?;
            root_log.write(&state.root_buf, state.last_revision)?;
        }

        if state.go_buf.len() > state.encoded_table_len {
            let log = if table.id == METADATA_ID {
                self.ensure_metadata_log()?
            } else {
                user_log.clone()
            };
            log.write(&state.go_buf, state.last_revision)?;
        }

        for split in &state.split_bufs {
            if split.buf.len() > state.encoded_table_len {
                split.log.write(&split.buf, state.last_revision)?;
            }
        }
        Ok(())
    }

    /// Apply pass: fold every committed run into its range's memtable.
    /// Failures are warnings, not request failures; the log already holds
    /// the authoritative record.
    fn apply(&self, state: &UpdateState) {
        for run in &state.runs {
            if matches!(run.target, BufTarget::Split(_)) {
                // Split-off cells belong to the new half; the split log is
                // their only local home.
                continue;
            }
            let buf = state.buf(run.target);
            let end = run.offset + run.len;
            let mut offset = run.offset;
            let mut guard = run.range.lock();
            while offset < end {
                let cell = match Key::load(buf, &mut offset) {
                    Ok(cell) => cell,
                    Err(err) => {
                        tracing::warn!(error = %err, "apply: failed to reload stamped key");
                        break;
                    }
                };
                let value = match key::decode_value(buf, &mut offset) {
                    Ok(value) => value,
                    Err(err) => {
                        tracing::warn!(error = %err, "apply: failed to reload value");
                        break;
                    }
                };
                if let Err(err) = guard.add(&cell, &value) {
                    tracing::warn!(range = %run.range.name(), error = %err, "Range::add failed");
                }
            }
        }
    }

    /// Per touched range: schedule a split when it outgrew its budget, or a
    /// compaction when an access group's memtable crossed the limit.
    fn maintenance_kick(&self, table: &TableIdentifier, state: &UpdateState) {
        let mut kicked: Vec<*const Range> = Vec::new();
        for run in &state.runs {
            let range = &run.range;
            let ptr = Arc::as_ptr(range);
            if kicked.contains(&ptr) {
                continue;
            }
            kicked.push(ptr);

            if range.maintenance_in_progress() {
                continue;
            }

            let mut priority = Vec::new();
            range.get_compaction_priority_data(&mut priority);

            let mut disk_usage = 0u64;
            let mut compactions = Vec::new();
            for data in &priority {
                disk_usage += data.disk_used;
                if !data.in_memory && data.mem_used >= self.ctx.config.access_group_max_mem {
                    compactions.push(data.access_group);
                }
            }

            let metadata_limit = self.ctx.config.range_metadata_max_bytes;
            let oversized = disk_usage > range.size_limit()
                || (metadata_limit > 0 && table.id == METADATA_ID && disk_usage > metadata_limit);

            if !range.is_root() && oversized {
                if range.test_and_set_maintenance() {
                    self.ctx.maintenance_queue.add(Box::new(
                        crate::tasks::SplitTask::new(self.clone(), range.clone()),
                    ));
                }
            } else if !compactions.is_empty() && range.test_and_set_maintenance() {
                for ag in compactions {
                    range.set_compaction_bit(ag);
                }
                self.ctx.maintenance_queue.add(Box::new(
                    crate::tasks::CompactionTask::new(range.clone(), false),
                ));
            }
        }
    }
}

/// Pack send-back records into the wire form: 16 bytes per record.
pub fn encode_send_back(records: &[SendBackRec]) -> Vec<u8> {
    let mut out = Vec::with_capacity(records.len() * 16);
    for rec in records {
        out.extend_from_slice(&rec.error.to_be_bytes());
        out.extend_from_slice(&rec.count.to_be_bytes());
        out.extend_from_slice(&rec.offset.to_be_bytes());
        out.extend_from_slice(&rec.len.to_be_bytes());
    }
    out
}

/// Decode the packed send-back array.
pub fn decode_send_back(data: &[u8]) -> Result<Vec<SendBackRec>> {
    if data.len() % 16 != 0 {
        return Err(Error::MalformedRequest(
            "send-back array length is not a multiple of 16".into(),
        ));
    }
    let mut out = Vec::with_capacity(data.len() / 16);
    let mut offset = 0usize;
    while offset < data.len() {
        out.push(SendBackRec {
            error: crate::types::read_u32(data, &mut offset)?,
            count: crate::types::read_u32(data, &mut offset)?,
            offset: crate::types::read_u32(data, &mut offset)?,
            len: crate::types::read_u32(data, &mut offset)?,
        });
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn send_back_records_round_trip() {
        let records = vec![
            SendBackRec {
                error: code::OUT_OF_RANGE,
                count: 2,
                offset: 10,
                len: 40,
            },
            SendBackRec {
                error: code::BAD_KEY,
                count: 1,
                offset: 50,
                len: 8,
            },
        ];
        let packed = encode_send_back(&records);
        assert_eq!(packed.len(), 32);
        assert_eq!(decode_send_back(&packed).expect("decode"), records);
    }
}
