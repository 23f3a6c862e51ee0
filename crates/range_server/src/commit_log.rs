//! Append-only, fragment-rotated commit log.
//!
//! A log is a directory of numbered fragment files. Each fragment is a
//! sequence of blocks framed as `[block_size: u32][revision: i64][payload]`,
//! all big-endian; the payload is an encoded table identifier followed by
//! serialized key/value pairs. Fragments rotate at the roll limit, foreign
//! logs are linked in by renaming their fragments into place, and fragments
//! whose highest revision has been fully flushed are pruned.

use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::error::{Error, Result};
use crate::types::TIMESTAMP_NULL;

const FRAGMENT_SUFFIX: &str = ".frag";
const BLOCK_HEADER_SIZE: u64 = 12;

/// Current wall clock in microseconds since the epoch.
pub fn epoch_micros() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros().min(i64::MAX as u128) as i64)
        .unwrap_or(0)
}

/// Metadata for one fragment file.
#[derive(Clone, Debug)]
pub struct FragmentInfo {
    pub id: u64,
    pub path: PathBuf,
    pub size: u64,
    pub max_revision: i64,
}

/// Entry of the fragment priority map: the fragment holding a revision and
/// the cumulative log bytes from the newest fragment back through it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FragmentPriority {
    pub fragment_id: u64,
    pub cumulative_size: u64,
}

struct LogState {
    fragments: Vec<FragmentInfo>,
    writer: Option<File>,
    /// Id of the fragment the writer appends to, while one is open.
    current_id: Option<u64>,
    next_id: u64,
    closed: bool,
}

/// Append-only commit log over one directory of fragments.
pub struct CommitLog {
    dir: PathBuf,
    max_fragment_size: u64,
    state: Mutex<LogState>,
    clock: AtomicI64,
}

impl CommitLog {
    /// Open (creating if necessary) the log at `dir`. Existing fragments are
    /// scanned to recover their sizes and highest revisions.
    pub fn open(dir: impl Into<PathBuf>, max_fragment_size: u64) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;

        let mut fragments = scan_fragments(&dir)?;
        fragments.sort_by_key(|f| f.id);

        // Seed fragment ids from the clock so fragments created by separate
        // logs (transfer, replay) never share names with ours.
        let max_seen = fragments.last().map(|f| f.id + 1).unwrap_or(0);
        let next_id = max_seen.max(epoch_micros().max(0) as u64);

        Ok(Self {
            dir,
            max_fragment_size,
            state: Mutex::new(LogState {
                fragments,
                writer: None,
                current_id: None,
                next_id,
                closed: false,
            }),
            clock: AtomicI64::new(0),
        })
    }

    pub fn log_dir(&self) -> &Path {
        &self.dir
    }

    /// Rotation threshold for fragment files.
    pub fn get_max_fragment_size(&self) -> u64 {
        self.max_fragment_size
    }

    /// Monotone microsecond clock; never decreases within one process.
    pub fn get_timestamp(&self) -> i64 {
        let now = epoch_micros();
        let prev = self.clock.fetch_max(now, Ordering::SeqCst);
        now.max(prev)
    }

    /// Atomically append one block. A failed write truncates the fragment
    /// back so a partial block is never published.
    pub fn write(&self, payload: &[u8], revision: i64) -> Result<()> {
        let mut guard = self.state.lock().expect("commit log lock");
        let state = &mut *guard;
        if state.closed {
            return Err(Error::Io(format!(
                "commit log {} is closed",
                self.dir.display()
            )));
        }

        if state.writer.is_none() {
            let id = state.next_id;
            state.next_id += 1;
            let path = fragment_path(&self.dir, id);
            let file = OpenOptions::new().create_new(true).append(true).open(&path)?;
            state.fragments.push(FragmentInfo {
                id,
                path,
                size: 0,
                max_revision: TIMESTAMP_NULL,
            });
            state.writer = Some(file);
            state.current_id = Some(id);
        }

        let mut block = Vec::with_capacity(BLOCK_HEADER_SIZE as usize + payload.len());
        block.extend_from_slice(&(payload.len() as u32).to_be_bytes());
        block.extend_from_slice(&revision.to_be_bytes());
        block.extend_from_slice(payload);

        let current_id = state.current_id.expect("open fragment id");
        let current = state
            .fragments
            .iter_mut()
            .find(|f| f.id == current_id)
            .expect("open fragment");
        let previous_size = current.size;
        let current_path = current.path.clone();
        let writer = state.writer.as_mut().expect("open writer");
        if let Err(err) = writer.write_all(&block).and_then(|_| writer.flush()) {
            // Roll back to the last published block boundary.
            let _ = writer.set_len(previous_size);
            return Err(Error::Io(format!(
                "short write to {}: {err}",
                current_path.display()
            )));
        }

        let current = state
            .fragments
            .iter_mut()
            .find(|f| f.id == current_id)
            .expect("open fragment");
        current.size += block.len() as u64;
        current.max_revision = current.max_revision.max(revision);

        if current.size >= self.max_fragment_size {
            if let Some(writer) = state.writer.take() {
                let _ = writer.sync_all();
            }
            state.current_id = None;
            tracing::debug!(
                log = %self.dir.display(),
                fragment = current_id,
                "rolled commit log fragment"
            );
        }
        Ok(())
    }

    /// Fold `other`'s fragments into this log by renaming them into this
    /// log's directory. Fails without moving anything if any fragment name
    /// already exists here.
    pub fn link_log(&self, other: &CommitLog) -> Result<()> {
        other.close()?;
        let mut state = self.state.lock().expect("commit log lock");
        let mut other_state = other.state.lock().expect("commit log lock");

        for fragment in &other_state.fragments {
            let dest = fragment_path(&self.dir, fragment.id);
            if dest.exists() {
                return Err(Error::Io(format!(
                    "fragment name collision linking {} into {}: {}",
                    other.dir.display(),
                    self.dir.display(),
                    dest.display()
                )));
            }
        }

        for fragment in other_state.fragments.drain(..) {
            let dest = fragment_path(&self.dir, fragment.id);
            fs::rename(&fragment.path, &dest)?;
            state.next_id = state.next_id.max(fragment.id + 1);
            state.fragments.push(FragmentInfo {
                path: dest,
                ..fragment
            });
        }
        state.fragments.sort_by_key(|f| f.id);
        Ok(())
    }

    /// Delete closed fragments whose highest revision is strictly below
    /// `min_revision`.
    pub fn purge(&self, min_revision: i64) {
        let mut guard = self.state.lock().expect("commit log lock");
        let state = &mut *guard;
        let current_id = state.current_id;
        let mut removed = 0usize;
        state.fragments.retain(|fragment| {
            let is_open = current_id == Some(fragment.id);
            if is_open || fragment.max_revision >= min_revision {
                return true;
            }
            if let Err(err) = fs::remove_file(&fragment.path) {
                tracing::warn!(
                    fragment = %fragment.path.display(),
                    error = %err,
                    "failed to remove pruned fragment"
                );
                return true;
            }
            removed += 1;
            false
        });
        if removed > 0 {
            tracing::info!(
                log = %self.dir.display(),
                removed,
                min_revision,
                "pruned commit log fragments"
            );
        }
    }

    /// Build `revision -> (fragment, cumulative size)` sorted by revision.
    /// Cumulative sizes accumulate from the newest fragment backwards, so an
    /// old anchored revision maps to the full span of bytes it pins.
    pub fn load_fragment_priority_map(&self, out: &mut BTreeMap<i64, FragmentPriority>) {
        let state = self.state.lock().expect("commit log lock");
        let mut cumulative = 0u64;
        for fragment in state.fragments.iter().rev() {
            cumulative += fragment.size;
            if fragment.max_revision != TIMESTAMP_NULL {
                out.insert(
                    fragment.max_revision,
                    FragmentPriority {
                        fragment_id: fragment.id,
                        cumulative_size: cumulative,
                    },
                );
            }
        }
    }

    /// Flush and close the log; subsequent writes fail.
    pub fn close(&self) -> Result<()> {
        let mut state = self.state.lock().expect("commit log lock");
        if let Some(writer) = state.writer.take() {
            writer.sync_all()?;
        }
        state.current_id = None;
        state.closed = true;
        Ok(())
    }

    /// Total bytes across all fragments.
    pub fn size(&self) -> u64 {
        let state = self.state.lock().expect("commit log lock");
        state.fragments.iter().map(|f| f.size).sum()
    }
}

fn fragment_path(dir: &Path, id: u64) -> PathBuf {
    dir.join(format!("{id:020}{FRAGMENT_SUFFIX}"))
}

fn fragment_id_from_path(path: &Path) -> Option<u64> {
    path.file_name()?
        .to_str()?
        .strip_suffix(FRAGMENT_SUFFIX)?
        .parse()
        .ok()
}

fn scan_fragments(dir: &Path) -> Result<Vec<FragmentInfo>> {
    let mut fragments = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        let Some(id) = fragment_id_from_path(&path) else {
            continue;
        };
        let size = entry.metadata()?.len();
        let max_revision = scan_max_revision(&path).unwrap_or(TIMESTAMP_NULL);
        fragments.push(FragmentInfo {
            id,
            path,
            size,
            max_revision,
        });
    }
    Ok(fragments)
}

/// Highest revision of the well-formed prefix of a fragment. A truncated
/// tail block ends the scan without failing the open.
fn scan_max_revision(path: &Path) -> Result<i64> {
    let mut file = File::open(path)?;
    let mut max_revision = TIMESTAMP_NULL;
    let mut header = [0u8; BLOCK_HEADER_SIZE as usize];
    loop {
        match read_exact_or_eof(&mut file, &mut header)? {
            ReadOutcome::Eof => break,
            ReadOutcome::Short => {
                tracing::warn!(fragment = %path.display(), "truncated block header at fragment tail");
                break;
            }
            ReadOutcome::Full => {}
        }
        let block_size = u32::from_be_bytes(header[0..4].try_into().expect("header")) as u64;
        let revision = i64::from_be_bytes(header[4..12].try_into().expect("header"));
        let pos = file.stream_position()?;
        let len = file.metadata()?.len();
        if pos + block_size > len {
            tracing::warn!(fragment = %path.display(), "truncated block payload at fragment tail");
            break;
        }
        file.seek(SeekFrom::Current(block_size as i64))?;
        max_revision = max_revision.max(revision);
    }
    Ok(max_revision)
}

enum ReadOutcome {
    Full,
    Short,
    Eof,
}

fn read_exact_or_eof(file: &mut File, buf: &mut [u8]) -> Result<ReadOutcome> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = file.read(&mut buf[filled..])?;
        if n == 0 {
            return Ok(if filled == 0 {
                ReadOutcome::Eof
            } else {
                ReadOutcome::Short
            });
        }
        filled += n;
    }
    Ok(ReadOutcome::Full)
}

/// One block read back from a commit log.
#[derive(Clone, Debug)]
pub struct LogBlock {
    pub revision: i64,
    pub payload: Vec<u8>,
}

/// Sequential reader over every fragment of a log directory, oldest first.
pub struct CommitLogReader {
    dir: PathBuf,
    fragments: Vec<PathBuf>,
    next_fragment: usize,
    current: Option<File>,
}

impl CommitLogReader {
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        let mut fragments: Vec<(u64, PathBuf)> = Vec::new();
        if dir.exists() {
            for entry in fs::read_dir(&dir)? {
                let path = entry?.path();
                if let Some(id) = fragment_id_from_path(&path) {
                    fragments.push((id, path));
                }
            }
        }
        fragments.sort_by_key(|(id, _)| *id);
        Ok(Self {
            dir,
            fragments: fragments.into_iter().map(|(_, p)| p).collect(),
            next_fragment: 0,
            current: None,
        })
    }

    pub fn log_dir(&self) -> &Path {
        &self.dir
    }

    /// Next block across the fragment sequence, or `None` when exhausted.
    /// A block extending past the end of its fragment is `REQUEST_TRUNCATED`.
    pub fn next(&mut self) -> Result<Option<LogBlock>> {
        loop {
            if self.current.is_none() {
                if self.next_fragment >= self.fragments.len() {
                    return Ok(None);
                }
                self.current = Some(File::open(&self.fragments[self.next_fragment])?);
                self.next_fragment += 1;
            }

            let file = self.current.as_mut().expect("open fragment");
            let mut header = [0u8; BLOCK_HEADER_SIZE as usize];
            match read_exact_or_eof(file, &mut header)? {
                ReadOutcome::Eof => {
                    self.current = None;
                    continue;
                }
                ReadOutcome::Short => {
                    return Err(Error::RequestTruncated(
                        "short block header in commit log".into(),
                    ));
                }
                ReadOutcome::Full => {}
            }

            let block_size = u32::from_be_bytes(header[0..4].try_into().expect("header")) as usize;
            let revision = i64::from_be_bytes(header[4..12].try_into().expect("header"));
            let mut payload = vec![0u8; block_size];
            match read_exact_or_eof(file, &mut payload)? {
                ReadOutcome::Full => {}
                _ => {
                    return Err(Error::RequestTruncated(
                        "short block payload in commit log".into(),
                    ));
                }
            }
            return Ok(Some(LogBlock { revision, payload }));
        }
    }
}
