//! Cold-start recovery: fresh starts, restart-with-state, and tier ordering.

mod common;

use common::*;
use range_server::types::{RangeSpec, END_ROOT_ROW};

#[test]
fn fresh_start_reports_every_tier_recovered() {
    let dir = tempfile::tempdir().expect("tempdir");
    let cluster = start_cluster(dir.path());
    assert_eq!(cluster.server.recovery_state(), (true, true, true));

    // The range transaction log now exists, empty.
    let txn_log = cluster.config.log_dir().join("range_txn").join("0.log");
    assert!(txn_log.exists());
    cluster.server.shutdown();
}

#[test]
fn restart_recovers_ranges_and_data() {
    let dir = tempfile::tempdir().expect("tempdir");
    let spec = RangeSpec::new(Vec::new(), Vec::new());

    let table = {
        let cluster = start_cluster(dir.path());
        load_metadata_ranges(&cluster);
        let table = load_user_range(&cluster, 7, "orders", &spec);
        let (count, buffer) = auto_cells(&[b"alpha", b"beta", b"gamma"], b"v1");
        cluster.server.update(&table, count, buffer).expect("update");
        cluster.server.shutdown();
        table
    };

    let cluster = start_cluster(dir.path());
    assert_eq!(cluster.server.recovery_state(), (true, true, true));

    // ROOT, the metadata range, and the user range all came back.
    assert!(cluster
        .server
        .get_range(0, &RangeSpec::new(Vec::new(), END_ROOT_ROW.to_vec()))
        .is_some());
    assert!(cluster
        .server
        .get_range(0, &RangeSpec::new(END_ROOT_ROW.to_vec(), Vec::new()))
        .is_some());
    assert!(cluster.server.get_range(7, &spec).is_some());

    // The user cells replayed from the user tier log.
    let cells = scan_all(&cluster, &table, &spec);
    let rows: Vec<_> = cells.iter().map(|(k, _)| k.row.clone()).collect();
    assert_eq!(
        rows,
        vec![b"alpha".to_vec(), b"beta".to_vec(), b"gamma".to_vec()]
    );

    // Revisions survive replay, so the range's latest revision is restored.
    let range = cluster.server.get_range(7, &spec).expect("range");
    assert!(range.latest_revision() > 0);
    cluster.server.shutdown();
}

#[test]
fn restart_after_drop_table_forgets_the_table() {
    let dir = tempfile::tempdir().expect("tempdir");
    let spec = RangeSpec::new(Vec::new(), Vec::new());

    {
        let cluster = start_cluster(dir.path());
        load_metadata_ranges(&cluster);
        let table = load_user_range(&cluster, 7, "orders", &spec);
        let (count, buffer) = auto_cells(&[b"alpha"], b"v1");
        cluster.server.update(&table, count, buffer).expect("update");
        cluster.server.drop_table(&table).expect("drop table");
        cluster.server.shutdown();
    }

    let cluster = start_cluster(dir.path());
    assert!(cluster.server.get_range(7, &spec).is_none());
    // The metadata tiers are still hosted.
    assert!(cluster
        .server
        .get_range(0, &RangeSpec::new(Vec::new(), END_ROOT_ROW.to_vec()))
        .is_some());
    cluster.server.shutdown();
}

#[test]
fn updates_made_after_restart_keep_revisions_monotone() {
    let dir = tempfile::tempdir().expect("tempdir");
    let spec = RangeSpec::new(Vec::new(), Vec::new());

    let first_max = {
        let cluster = start_cluster(dir.path());
        load_metadata_ranges(&cluster);
        let table = load_user_range(&cluster, 7, "orders", &spec);
        let (count, buffer) = auto_cells(&[b"one"], b"v1");
        cluster.server.update(&table, count, buffer).expect("update");
        let max = cluster
            .server
            .get_range(7, &spec)
            .expect("range")
            .latest_revision();
        cluster.server.shutdown();
        max
    };

    let cluster = start_cluster(dir.path());
    let table = register_user_table(&cluster, 7, "orders");
    let (count, buffer) = auto_cells(&[b"two"], b"v2");
    cluster.server.update(&table, count, buffer).expect("update");

    let range = cluster.server.get_range(7, &spec).expect("range");
    assert!(range.latest_revision() > first_max);
    cluster.server.shutdown();
}
