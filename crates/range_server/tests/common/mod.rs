//! Shared fixtures for the integration tests.
#![allow(dead_code)]

use std::path::Path;
use std::sync::Arc;

use range_server::coordinator::Coordinator;
use range_server::key::{self, Key};
use range_server::range::ScanSpec;
use range_server::types::{RangeSpec, RangeState, TableIdentifier, END_ROOT_ROW};
use range_server::{Config, FsCoordinator, LogOnlyMaster, RangeServer};

/// One test node plus the handles the tests poke at directly.
pub struct TestCluster {
    pub server: RangeServer,
    pub coordinator: Arc<FsCoordinator>,
    pub config: Config,
}

pub fn test_config(dir: &Path) -> Config {
    Config {
        data_root: dir.join("data"),
        location: "test_38060".into(),
        timer_interval_ms: 1_000,
        scanner_ttl_ms: 10_000,
        // Small blocks so scans return multiple blocks with little data.
        scan_block_bytes: 64,
        ..Config::default()
    }
    .validate()
    .expect("valid test config")
}

/// Start a node rooted at `dir`. Restartable: the same `dir` recovers.
pub fn start_cluster(dir: &Path) -> TestCluster {
    start_cluster_with(dir, test_config(dir))
}

pub fn start_cluster_with(dir: &Path, config: Config) -> TestCluster {
    let coordinator = Arc::new(FsCoordinator::new(dir.join("coordinator")));
    let server = RangeServer::start(config.clone(), coordinator.clone(), Arc::new(LogOnlyMaster))
        .expect("server start");
    TestCluster {
        server,
        coordinator,
        config,
    }
}

pub fn metadata_table() -> TableIdentifier {
    TableIdentifier::new(0, "METADATA", 1)
}

/// Load the ROOT range and the remaining METADATA range so user-range loads
/// can advertise their locations.
pub fn load_metadata_ranges(cluster: &TestCluster) {
    let table = metadata_table();
    cluster
        .server
        .load_range(
            &table,
            &RangeSpec::new(Vec::new(), END_ROOT_ROW.to_vec()),
            None,
            &RangeState::default(),
        )
        .expect("load ROOT range");
    cluster
        .server
        .load_range(
            &table,
            &RangeSpec::new(END_ROOT_ROW.to_vec(), Vec::new()),
            None,
            &RangeState::default(),
        )
        .expect("load metadata range");
}

/// Schema document with a single `default` access group owning column
/// family 1 (`data`).
pub fn user_schema_doc(generation: u32) -> String {
    format!(
        r#"{{
            "generation": {generation},
            "access_groups": [
                {{"name": "default", "column_families": [{{"id": 1, "name": "data"}}]}}
            ]
        }}"#
    )
}

/// Register a user table schema in the coordinator and return its identity.
pub fn register_user_table(cluster: &TestCluster, id: u32, name: &str) -> TableIdentifier {
    cluster
        .coordinator
        .attr_set(
            &cluster.config.table_namespace(name),
            "schema",
            user_schema_doc(1).as_bytes(),
        )
        .expect("store schema");
    TableIdentifier::new(id, name, 1)
}

/// Register and load one user table covering `spec`.
pub fn load_user_range(
    cluster: &TestCluster,
    id: u32,
    name: &str,
    spec: &RangeSpec,
) -> TableIdentifier {
    let table = register_user_table(cluster, id, name);
    cluster
        .server
        .load_range(&table, spec, None, &RangeState::default())
        .expect("load user range");
    table
}

/// Build an update buffer of `AUTO_TIMESTAMP` cells on column family 1.
pub fn auto_cells(rows: &[&[u8]], value: &[u8]) -> (u32, Vec<u8>) {
    let mut buffer = Vec::new();
    for row in rows {
        key::encode_key(&mut buffer, row, 1, b"", None);
        key::encode_value(&mut buffer, value);
    }
    (rows.len() as u32, buffer)
}

/// Decode a scan/response block into `(key, value)` pairs.
pub fn decode_cells(block: &[u8]) -> Vec<(Key, Vec<u8>)> {
    let mut cells = Vec::new();
    let mut offset = 0usize;
    while offset < block.len() {
        let cell = Key::load(block, &mut offset).expect("decode key");
        let value = key::decode_value(block, &mut offset).expect("decode value");
        cells.push((cell, value));
    }
    cells
}

/// Scan the whole range, following the scanner id through every block.
pub fn scan_all(
    cluster: &TestCluster,
    table: &TableIdentifier,
    spec: &RangeSpec,
) -> Vec<(Key, Vec<u8>)> {
    let mut block = cluster
        .server
        .create_scanner(table, spec, &ScanSpec::default())
        .expect("create scanner");
    let mut cells = decode_cells(&block.data);
    while block.more {
        block = cluster
            .server
            .fetch_scanblock(block.scanner_id)
            .expect("fetch scanblock");
        cells.extend(decode_cells(&block.data));
    }
    cells
}

/// Read every `(revision, cells)` block of a commit log directory.
pub fn read_log_blocks(dir: &Path) -> Vec<(i64, Vec<(Key, Vec<u8>)>)> {
    let mut reader =
        range_server::commit_log::CommitLogReader::open(dir).expect("open log reader");
    let mut blocks = Vec::new();
    while let Some(block) = reader.next().expect("read block") {
        let mut offset = 0usize;
        let _table =
            TableIdentifier::decode(&block.payload, &mut offset).expect("decode table");
        let mut cells = Vec::new();
        while offset < block.payload.len() {
            let cell = Key::load(&block.payload, &mut offset).expect("decode key");
            let value = key::decode_value(&block.payload, &mut offset).expect("decode value");
            cells.push((cell, value));
        }
        blocks.push((block.revision, cells));
    }
    blocks
}

/// The user commit log directory of a cluster.
pub fn user_log_dir(cluster: &TestCluster) -> std::path::PathBuf {
    cluster.config.log_dir().join("user")
}
