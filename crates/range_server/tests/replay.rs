//! Foreign-initiated replay sessions: staging, write-through, idempotent
//! application, commit, and session-token enforcement.

mod common;

use common::*;
use range_server::error::Error;
use range_server::key;
use range_server::types::{RangeSpec, RangeState, TableIdentifier};
use range_server::ReplayGroup;

/// Frame one commit-log block the way the wire carries it:
/// `[block_size][revision][table][cells...]`.
fn frame_block(table: &TableIdentifier, cells: &[(&[u8], i64)], value: &[u8]) -> Vec<u8> {
    let mut payload = Vec::new();
    table.encode(&mut payload);
    let mut max_revision = 0;
    for (row, revision) in cells {
        key::encode_stamped_key(&mut payload, row, 1, b"", *revision, *revision);
        key::encode_value(&mut payload, value);
        max_revision = max_revision.max(*revision);
    }

    let mut framed = Vec::with_capacity(12 + payload.len());
    framed.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    framed.extend_from_slice(&max_revision.to_be_bytes());
    framed.extend_from_slice(&payload);
    framed
}

#[test]
fn replay_cycle_promotes_ranges_into_the_live_map() {
    let dir = tempfile::tempdir().expect("tempdir");
    let cluster = start_cluster(dir.path());
    load_metadata_ranges(&cluster);

    let table = register_user_table(&cluster, 9, "events");
    let spec = RangeSpec::new(Vec::new(), Vec::new());

    let session = cluster
        .server
        .replay_begin(ReplayGroup::User)
        .expect("replay begin");
    cluster
        .server
        .replay_load_range(session, &table, &spec, &RangeState::default())
        .expect("replay load range");

    let block = frame_block(&table, &[(b"x", 100), (b"y", 101)], b"v");
    cluster
        .server
        .replay_update(session, &block)
        .expect("replay update");
    cluster
        .server
        .replay_commit(session)
        .expect("replay commit");

    // The staged range is now live and scannable.
    let cells = scan_all(&cluster, &table, &spec);
    let rows: Vec<_> = cells.iter().map(|(k, _)| k.row.clone()).collect();
    assert_eq!(rows, vec![b"x".to_vec(), b"y".to_vec()]);

    // The replay log was linked into the user tier log.
    let blocks = read_log_blocks(&user_log_dir(&cluster));
    assert!(blocks.iter().any(|(revision, _)| *revision == 101));
    cluster.server.shutdown();
}

#[test]
fn replay_apply_is_idempotent() {
    let dir = tempfile::tempdir().expect("tempdir");
    let cluster = start_cluster(dir.path());
    load_metadata_ranges(&cluster);

    let table = register_user_table(&cluster, 9, "events");
    let spec = RangeSpec::new(Vec::new(), Vec::new());

    let session = cluster
        .server
        .replay_begin(ReplayGroup::User)
        .expect("replay begin");
    cluster
        .server
        .replay_load_range(session, &table, &spec, &RangeState::default())
        .expect("replay load range");

    let block = frame_block(&table, &[(b"x", 100), (b"y", 101)], b"v");
    cluster
        .server
        .replay_update(session, &block)
        .expect("first apply");
    cluster
        .server
        .replay_update(session, &block)
        .expect("second apply");
    cluster
        .server
        .replay_commit(session)
        .expect("replay commit");

    // Applying the same log bytes twice yields the same cell set.
    let cells = scan_all(&cluster, &table, &spec);
    assert_eq!(cells.len(), 2);
    cluster.server.shutdown();
}

#[test]
fn stale_session_ids_are_rejected() {
    let dir = tempfile::tempdir().expect("tempdir");
    let cluster = start_cluster(dir.path());
    load_metadata_ranges(&cluster);

    let table = register_user_table(&cluster, 9, "events");
    let spec = RangeSpec::new(Vec::new(), Vec::new());

    let first = cluster
        .server
        .replay_begin(ReplayGroup::User)
        .expect("first begin");
    // A second cycle supersedes the first.
    let second = cluster
        .server
        .replay_begin(ReplayGroup::Metadata)
        .expect("second begin");
    assert_ne!(first, second);

    let err = cluster
        .server
        .replay_load_range(first, &table, &spec, &RangeState::default())
        .expect_err("stale load");
    assert!(matches!(err, Error::Protocol(_)));

    let err = cluster
        .server
        .replay_commit(first)
        .expect_err("stale commit");
    assert!(matches!(err, Error::Protocol(_)));

    // The active session still works.
    cluster
        .server
        .replay_commit(second)
        .expect("active commit");
    cluster.server.shutdown();
}

#[test]
fn replay_update_rejects_rows_without_a_staged_range() {
    let dir = tempfile::tempdir().expect("tempdir");
    let cluster = start_cluster(dir.path());
    load_metadata_ranges(&cluster);

    let table = register_user_table(&cluster, 9, "events");
    let session = cluster
        .server
        .replay_begin(ReplayGroup::User)
        .expect("replay begin");

    // No replay_load_range: the block's table is unknown to the replay map.
    let block = frame_block(&table, &[(b"x", 100)], b"v");
    let err = cluster
        .server
        .replay_update(session, &block)
        .expect_err("unstaged table");
    assert!(matches!(err, Error::RangeNotFound(_)));
    cluster.server.shutdown();
}

#[test]
fn truncated_replay_block_is_malformed() {
    let dir = tempfile::tempdir().expect("tempdir");
    let cluster = start_cluster(dir.path());
    load_metadata_ranges(&cluster);

    let table = register_user_table(&cluster, 9, "events");
    let spec = RangeSpec::new(Vec::new(), Vec::new());
    let session = cluster
        .server
        .replay_begin(ReplayGroup::User)
        .expect("replay begin");
    cluster
        .server
        .replay_load_range(session, &table, &spec, &RangeState::default())
        .expect("replay load range");

    let mut block = frame_block(&table, &[(b"x", 100)], b"v");
    block.truncate(block.len() - 3);
    let err = cluster
        .server
        .replay_update(session, &block)
        .expect_err("truncated block");
    assert!(matches!(
        err,
        Error::MalformedRequest(_) | Error::RequestTruncated(_)
    ));
    cluster.server.shutdown();
}
