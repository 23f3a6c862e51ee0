//! Range transaction log.
//!
//! A single append-only file recording range load and table drop events.
//! Records are framed as `[len: u32][crc32: u32][payload]` and replayed at
//! cold start to reconstruct the set of ranges this server was hosting.

use std::fs::{File, OpenOptions};
use std::io::{BufReader, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crate::error::{Error, Result};
use crate::types::{RangeSpec, RangeState, TableIdentifier};

const ENTRY_RANGE_LOADED: u8 = 1;
const ENTRY_TABLE_DROPPED: u8 = 2;

/// One surviving range from the transaction log.
#[derive(Clone, Debug)]
pub struct RangeStateInfo {
    pub table: TableIdentifier,
    pub spec: RangeSpec,
    pub state: RangeState,
}

/// Append-side handle for the range transaction log.
pub struct RangeTxnLog {
    path: PathBuf,
    file: Mutex<Option<File>>,
}

impl RangeTxnLog {
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(Self {
            path,
            file: Mutex::new(Some(file)),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Record that a range is now hosted here.
    pub fn log_range_loaded(
        &self,
        table: &TableIdentifier,
        spec: &RangeSpec,
        state: &RangeState,
    ) -> Result<()> {
        let mut payload = Vec::new();
        payload.push(ENTRY_RANGE_LOADED);
        table.encode(&mut payload);
        spec.encode(&mut payload);
        state.encode(&mut payload);
        self.append(&payload)
    }

    /// Record that every range of `table` was dropped.
    pub fn log_table_dropped(&self, table: &TableIdentifier) -> Result<()> {
        let mut payload = Vec::new();
        payload.push(ENTRY_TABLE_DROPPED);
        table.encode(&mut payload);
        self.append(&payload)
    }

    fn append(&self, payload: &[u8]) -> Result<()> {
        let mut guard = self.file.lock().expect("range txn log lock");
        let file = guard
            .as_mut()
            .ok_or_else(|| Error::Io("range transaction log is closed".into()))?;

        let mut hasher = crc32fast::Hasher::new();
        hasher.update(payload);
        let checksum = hasher.finalize();

        let mut record = Vec::with_capacity(8 + payload.len());
        record.extend_from_slice(&(payload.len() as u32).to_be_bytes());
        record.extend_from_slice(&checksum.to_be_bytes());
        record.extend_from_slice(payload);
        file.write_all(&record)?;
        file.flush()?;
        Ok(())
    }

    pub fn close(&self) -> Result<()> {
        let mut guard = self.file.lock().expect("range txn log lock");
        if let Some(file) = guard.take() {
            file.sync_all()?;
        }
        Ok(())
    }
}

/// Load the surviving range set from a transaction log: loads accumulate,
/// drops remove every range of the dropped table.
pub fn load_range_states(path: &Path) -> Result<Vec<RangeStateInfo>> {
    let file = File::open(path)?;
    let mut reader = BufReader::new(file);
    let mut states: Vec<RangeStateInfo> = Vec::new();

    loop {
        let mut frame = [0u8; 8];
        match reader.read_exact(&mut frame) {
            Ok(()) => {}
            Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => break,
            Err(err) => return Err(err.into()),
        }
        let len = u32::from_be_bytes(frame[0..4].try_into().expect("frame")) as usize;
        let expected_crc = u32::from_be_bytes(frame[4..8].try_into().expect("frame"));

        let mut payload = vec![0u8; len];
        match reader.read_exact(&mut payload) {
            Ok(()) => {}
            Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => {
                tracing::warn!(log = %path.display(), "truncated record at range txn log tail");
                break;
            }
            Err(err) => return Err(err.into()),
        }

        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&payload);
        if hasher.finalize() != expected_crc {
            return Err(Error::Io(format!(
                "range txn log checksum mismatch in {}",
                path.display()
            )));
        }

        let mut offset = 0usize;
        if payload.is_empty() {
            return Err(Error::MalformedRequest("empty range txn record".into()));
        }
        let tag = payload[0];
        offset += 1;
        match tag {
            ENTRY_RANGE_LOADED => {
                let table = TableIdentifier::decode(&payload, &mut offset)?;
                let spec = RangeSpec::decode(&payload, &mut offset)?;
                let state = RangeState::decode(&payload, &mut offset)?;
                // A later entry with the same start row supersedes the
                // earlier interval (splits re-log the shrunk range).
                states.retain(|info| {
                    info.table.id != table.id || info.spec.start_row != spec.start_row
                });
                states.push(RangeStateInfo { table, spec, state });
            }
            ENTRY_TABLE_DROPPED => {
                let table = TableIdentifier::decode(&payload, &mut offset)?;
                states.retain(|info| info.table.id != table.id);
            }
            other => {
                return Err(Error::MalformedRequest(format!(
                    "unknown range txn record tag {other}"
                )))
            }
        }
    }
    Ok(states)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{RangeSpec, RangeState, TableIdentifier};

    fn sample_table(id: u32) -> TableIdentifier {
        TableIdentifier::new(id, format!("table{id}"), 1)
    }

    #[test]
    fn loads_survive_and_drops_remove() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("0.log");
        let log = RangeTxnLog::open(&path).expect("open");

        let spec_a = RangeSpec::new(Vec::new(), b"m".to_vec());
        let spec_b = RangeSpec::new(b"m".to_vec(), Vec::new());
        log.log_range_loaded(&sample_table(1), &spec_a, &RangeState::default())
            .expect("load a");
        log.log_range_loaded(&sample_table(2), &spec_b, &RangeState::default())
            .expect("load b");
        log.log_table_dropped(&sample_table(1)).expect("drop");
        log.close().expect("close");

        let states = load_range_states(&path).expect("replay");
        assert_eq!(states.len(), 1);
        assert_eq!(states[0].table.id, 2);
        assert_eq!(states[0].spec, spec_b);
    }

    #[test]
    fn later_entry_with_same_start_row_supersedes() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("0.log");
        let log = RangeTxnLog::open(&path).expect("open");

        let wide = RangeSpec::new(b"a".to_vec(), b"m".to_vec());
        let shrunk = RangeSpec::new(b"a".to_vec(), b"g".to_vec());
        log.log_range_loaded(&sample_table(1), &wide, &RangeState::default())
            .expect("load wide");
        log.log_range_loaded(&sample_table(1), &shrunk, &RangeState::default())
            .expect("load shrunk");
        log.close().expect("close");

        let states = load_range_states(&path).expect("replay");
        assert_eq!(states.len(), 1);
        assert_eq!(states[0].spec, shrunk);
    }

    #[test]
    fn truncated_tail_record_is_tolerated() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("0.log");
        let log = RangeTxnLog::open(&path).expect("open");
        log.log_range_loaded(
            &sample_table(1),
            &RangeSpec::new(Vec::new(), b"z".to_vec()),
            &RangeState::default(),
        )
        .expect("load");
        log.close().expect("close");

        // Append a frame header that promises more bytes than exist.
        let mut file = OpenOptions::new().append(true).open(&path).expect("reopen");
        file.write_all(&[0, 0, 0, 64, 0, 0, 0, 0, 1, 2, 3])
            .expect("garbage");
        drop(file);

        let states = load_range_states(&path).expect("replay tolerates tail");
        assert_eq!(states.len(), 1);
    }

    #[test]
    fn corrupt_checksum_is_an_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("0.log");
        let log = RangeTxnLog::open(&path).expect("open");
        log.log_range_loaded(
            &sample_table(1),
            &RangeSpec::new(Vec::new(), b"z".to_vec()),
            &RangeState::default(),
        )
        .expect("load");
        log.close().expect("close");

        let mut bytes = std::fs::read(&path).expect("read");
        let last = bytes.len() - 1;
        bytes[last] ^= 0xff;
        std::fs::write(&path, &bytes).expect("rewrite");

        let err = load_range_states(&path).expect_err("checksum mismatch");
        assert!(matches!(err, Error::Io(_)));
    }
}
