//! Request dispatch: the typed command surface of the range server.
//!
//! The transport itself (socket framing, connection handling) lives outside
//! this crate; what arrives here is one decoded request, and what leaves is
//! one response ready for the reply callback.

use std::path::PathBuf;

use crate::error::Error;
use crate::range::ScanSpec;
use crate::server::{RangeServer, ReplayGroup};
use crate::types::{RangeSpec, RangeState, TableIdentifier};
use crate::update::{encode_send_back, UpdateResponse};

/// One decoded command.
#[derive(Debug)]
pub enum Request {
    Compact {
        table: TableIdentifier,
        range: RangeSpec,
        major: bool,
    },
    CreateScanner {
        table: TableIdentifier,
        range: RangeSpec,
        spec: ScanSpec,
    },
    FetchScanblock {
        scanner_id: u32,
    },
    DestroyScanner {
        scanner_id: u32,
    },
    LoadRange {
        table: TableIdentifier,
        range: RangeSpec,
        transfer_log_dir: Option<PathBuf>,
        state: RangeState,
    },
    Update {
        table: TableIdentifier,
        count: u32,
        buffer: Vec<u8>,
    },
    DropTable {
        table: TableIdentifier,
    },
    DropRange {
        table: TableIdentifier,
        range: RangeSpec,
    },
    DumpStats,
    GetStatistics,
    ReplayBegin {
        group: u16,
    },
    ReplayLoadRange {
        session: u64,
        table: TableIdentifier,
        range: RangeSpec,
        state: RangeState,
    },
    ReplayUpdate {
        session: u64,
        data: Vec<u8>,
    },
    ReplayCommit {
        session: u64,
    },
    Status,
    Shutdown,
}

/// One response handed to the reply callback.
#[derive(Debug)]
pub enum Response {
    Ok,
    Error { code: u32, message: String },
    ScanBlock { scanner_id: u32, more: bool, data: Vec<u8> },
    UpdateErrors { data: Vec<u8> },
    Statistics { json: String },
    ReplaySession { session: u64 },
}

impl Response {
    fn from_error(err: Error) -> Self {
        Response::Error {
            code: err.code(),
            message: err.to_string(),
        }
    }

    fn from_update(response: UpdateResponse) -> Self {
        if response.send_back.is_empty() {
            Response::Ok
        } else {
            Response::UpdateErrors {
                data: encode_send_back(&response.send_back),
            }
        }
    }
}

impl RangeServer {
    /// Execute one command and format its response.
    pub fn dispatch(&self, request: Request) -> Response {
        match request {
            Request::Compact {
                table,
                range,
                major,
            } => match self.compact(&table, &range, major) {
                Ok(()) => Response::Ok,
                Err(err) => Response::from_error(err),
            },
            Request::CreateScanner { table, range, spec } => {
                match self.create_scanner(&table, &range, &spec) {
                    Ok(block) => Response::ScanBlock {
                        scanner_id: block.scanner_id,
                        more: block.more,
                        data: block.data,
                    },
                    Err(err) => Response::from_error(err),
                }
            }
            Request::FetchScanblock { scanner_id } => match self.fetch_scanblock(scanner_id) {
                Ok(block) => Response::ScanBlock {
                    scanner_id: block.scanner_id,
                    more: block.more,
                    data: block.data,
                },
                Err(err) => Response::from_error(err),
            },
            Request::DestroyScanner { scanner_id } => {
                self.destroy_scanner(scanner_id);
                Response::Ok
            }
            Request::LoadRange {
                table,
                range,
                transfer_log_dir,
                state,
            } => match self.load_range(&table, &range, transfer_log_dir.as_deref(), &state) {
                Ok(()) => Response::Ok,
                Err(err) => Response::from_error(err),
            },
            Request::Update {
                table,
                count,
                buffer,
            } => match self.update(&table, count, buffer) {
                Ok(response) => Response::from_update(response),
                Err(err) => Response::from_error(err),
            },
            Request::DropTable { table } => match self.drop_table(&table) {
                Ok(()) => Response::Ok,
                Err(err) => Response::from_error(err),
            },
            Request::DropRange { table, range } => match self.drop_range(&table, &range) {
                Ok(()) => Response::Ok,
                Err(err) => Response::from_error(err),
            },
            Request::DumpStats => {
                self.dump_stats();
                Response::Ok
            }
            Request::GetStatistics => {
                let stats = self.get_statistics();
                match serde_json::to_string(&stats) {
                    Ok(json) => Response::Statistics { json },
                    Err(err) => Response::Error {
                        code: crate::error::code::IO_ERROR,
                        message: err.to_string(),
                    },
                }
            }
            Request::ReplayBegin { group } => {
                let group = match ReplayGroup::try_from(group) {
                    Ok(group) => group,
                    Err(err) => return Response::from_error(err),
                };
                match self.replay_begin(group) {
                    Ok(session) => Response::ReplaySession { session },
                    Err(err) => Response::from_error(err),
                }
            }
            Request::ReplayLoadRange {
                session,
                table,
                range,
                state,
            } => match self.replay_load_range(session, &table, &range, &state) {
                Ok(()) => Response::Ok,
                Err(err) => Response::from_error(err),
            },
            Request::ReplayUpdate { session, data } => {
                match self.replay_update(session, &data) {
                    Ok(()) => Response::Ok,
                    Err(err) => Response::from_error(err),
                }
            }
            Request::ReplayCommit { session } => match self.replay_commit(session) {
                Ok(()) => Response::Ok,
                Err(err) => Response::from_error(err),
            },
            Request::Status => match self.status() {
                Ok(()) => Response::Ok,
                Err(err) => Response::from_error(err),
            },
            Request::Shutdown => {
                self.shutdown();
                Response::Ok
            }
        }
    }
}
