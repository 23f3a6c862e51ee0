//! Range server node for an ordered, range-partitioned table store.
//!
//! This crate implements the storage worker of the table service: it hosts
//! ranges (contiguous key intervals of tables), serves scans, absorbs
//! updates through a two-phase write pipeline backed by tiered commit logs,
//! replays local state at cold start in ROOT, METADATA, user order, and
//! runs compaction/split/log-cleanup maintenance in the background.

pub mod commit_log;
pub mod config;
pub mod coordinator;
pub mod dispatch;
pub mod error;
pub mod key;
pub mod maintenance;
pub mod master;
pub mod meta_log;
pub mod range;
pub mod recovery;
pub mod replay;
pub mod scanner_map;
pub mod schema;
pub mod server;
pub mod stats;
pub mod table_info;
pub mod tasks;
pub mod types;
pub mod update;

pub use config::Config;
pub use coordinator::{Coordinator, FsCoordinator};
pub use error::{Error, Result};
pub use master::{LogOnlyMaster, MasterClient};
pub use server::{RangeServer, ReplayGroup, ScanBlock};
pub use update::{SendBackRec, UpdateResponse};
