//! Core identifiers and interval types shared across the node.

use crate::error::{Error, Result};

/// Reserved table id of the METADATA table.
pub const METADATA_ID: u32 = 0;

/// Marker sorting after every real row; an empty `end_row` normalizes to it.
pub const END_ROW_MARKER: &[u8] = b"\xff\xff";

/// End row of the ROOT metadata range.
pub const END_ROOT_ROW: &[u8] = b"0:\xff\xff";

/// Revision value meaning "never set".
pub const TIMESTAMP_NULL: i64 = i64::MIN;

/// Revision value meaning "any".
pub const TIMESTAMP_MAX: i64 = i64::MAX;

/// Identifies one table: numeric id, name, and schema generation.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TableIdentifier {
    pub id: u32,
    pub name: String,
    pub generation: u32,
}

impl TableIdentifier {
    pub fn new(id: u32, name: impl Into<String>, generation: u32) -> Self {
        Self {
            id,
            name: name.into(),
            generation,
        }
    }

    pub fn is_metadata(&self) -> bool {
        self.id == METADATA_ID
    }

    pub fn encoded_length(&self) -> usize {
        4 + 4 + 4 + self.name.len()
    }

    pub fn encode(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.id.to_be_bytes());
        out.extend_from_slice(&self.generation.to_be_bytes());
        out.extend_from_slice(&(self.name.len() as u32).to_be_bytes());
        out.extend_from_slice(self.name.as_bytes());
    }

    pub fn decode(data: &[u8], offset: &mut usize) -> Result<Self> {
        let id = read_u32(data, offset)?;
        let generation = read_u32(data, offset)?;
        let name_len = read_u32(data, offset)? as usize;
        if *offset + name_len > data.len() {
            return Err(Error::RequestTruncated("short table name".into()));
        }
        let name = String::from_utf8(data[*offset..*offset + name_len].to_vec())
            .map_err(|_| Error::MalformedRequest("table name is not utf-8".into()))?;
        *offset += name_len;
        Ok(Self {
            id,
            generation,
            name,
        })
    }
}

/// One contiguous row interval of a table. `start_row` is exclusive,
/// `end_row` inclusive; an empty `end_row` means unbounded above.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RangeSpec {
    pub start_row: Vec<u8>,
    pub end_row: Vec<u8>,
}

impl RangeSpec {
    pub fn new(start_row: impl Into<Vec<u8>>, end_row: impl Into<Vec<u8>>) -> Self {
        Self {
            start_row: start_row.into(),
            end_row: end_row.into(),
        }
    }

    /// End row with the empty-means-unbounded convention applied.
    pub fn normalized_end_row(&self) -> Vec<u8> {
        if self.end_row.is_empty() {
            END_ROW_MARKER.to_vec()
        } else {
            self.end_row.clone()
        }
    }

    pub fn encode(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&(self.start_row.len() as u32).to_be_bytes());
        out.extend_from_slice(&self.start_row);
        out.extend_from_slice(&(self.end_row.len() as u32).to_be_bytes());
        out.extend_from_slice(&self.end_row);
    }

    pub fn decode(data: &[u8], offset: &mut usize) -> Result<Self> {
        let start_row = read_bytes(data, offset)?;
        let end_row = read_bytes(data, offset)?;
        Ok(Self { start_row, end_row })
    }
}

impl std::fmt::Display for RangeSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "[{}..{}]",
            String::from_utf8_lossy(&self.start_row),
            String::from_utf8_lossy(&self.end_row)
        )
    }
}

/// Persisted per-range bookkeeping written to the range transaction log.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RangeState {
    /// Last revision known committed for this range.
    pub latest_revision: i64,
    /// Split row of an in-progress split; empty when no split is underway.
    pub split_row: Vec<u8>,
}

impl RangeState {
    pub fn encode(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.latest_revision.to_be_bytes());
        out.extend_from_slice(&(self.split_row.len() as u32).to_be_bytes());
        out.extend_from_slice(&self.split_row);
    }

    pub fn decode(data: &[u8], offset: &mut usize) -> Result<Self> {
        let latest_revision = read_i64(data, offset)?;
        let split_row = read_bytes(data, offset)?;
        Ok(Self {
            latest_revision,
            split_row,
        })
    }
}

/// Read a big-endian u32 from `data` at `offset`.
pub fn read_u32(data: &[u8], offset: &mut usize) -> Result<u32> {
    if *offset + 4 > data.len() {
        return Err(Error::RequestTruncated("short u32".into()));
    }
    let mut buf = [0u8; 4];
    buf.copy_from_slice(&data[*offset..*offset + 4]);
    *offset += 4;
    Ok(u32::from_be_bytes(buf))
}

/// Read a big-endian i64 from `data` at `offset`.
pub fn read_i64(data: &[u8], offset: &mut usize) -> Result<i64> {
    if *offset + 8 > data.len() {
        return Err(Error::RequestTruncated("short i64".into()));
    }
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&data[*offset..*offset + 8]);
    *offset += 8;
    Ok(i64::from_be_bytes(buf))
}

/// Read a big-endian u64 from `data` at `offset`.
pub fn read_u64(data: &[u8], offset: &mut usize) -> Result<u64> {
    if *offset + 8 > data.len() {
        return Err(Error::RequestTruncated("short u64".into()));
    }
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&data[*offset..*offset + 8]);
    *offset += 8;
    Ok(u64::from_be_bytes(buf))
}

/// Read a u32-length-prefixed byte string from `data` at `offset`.
pub fn read_bytes(data: &[u8], offset: &mut usize) -> Result<Vec<u8>> {
    let len = read_u32(data, offset)? as usize;
    if *offset + len > data.len() {
        return Err(Error::RequestTruncated("short byte string".into()));
    }
    let out = data[*offset..*offset + len].to_vec();
    *offset += len;
    Ok(out)
}
