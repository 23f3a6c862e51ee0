//! Load/drop/compact command behavior, schema verification, statistics, and
//! the dispatch surface.

mod common;

use common::*;
use range_server::coordinator::Coordinator;
use range_server::dispatch::{Request, Response};
use range_server::error::{code, Error};
use range_server::types::{RangeSpec, RangeState, TableIdentifier};

#[test]
fn loading_the_same_range_twice_fails() {
    let dir = tempfile::tempdir().expect("tempdir");
    let cluster = start_cluster(dir.path());
    load_metadata_ranges(&cluster);
    let spec = RangeSpec::new(Vec::new(), Vec::new());
    let table = load_user_range(&cluster, 7, "orders", &spec);

    let err = cluster
        .server
        .load_range(&table, &spec, None, &RangeState::default())
        .expect_err("double load");
    assert!(matches!(err, Error::RangeAlreadyLoaded(_)));
    cluster.server.shutdown();
}

#[test]
fn root_load_publishes_location_in_the_coordinator() {
    let dir = tempfile::tempdir().expect("tempdir");
    let cluster = start_cluster(dir.path());
    load_metadata_ranges(&cluster);

    let location = cluster
        .coordinator
        .attr_get(&cluster.config.root_namespace(), "Location")
        .expect("root location attr");
    assert_eq!(location, cluster.config.location.as_bytes());
    cluster.server.shutdown();
}

#[test]
fn drop_range_removes_only_the_named_interval() {
    let dir = tempfile::tempdir().expect("tempdir");
    let cluster = start_cluster(dir.path());
    load_metadata_ranges(&cluster);

    let table = register_user_table(&cluster, 7, "orders");
    let low = RangeSpec::new(Vec::new(), b"m".to_vec());
    let high = RangeSpec::new(b"m".to_vec(), Vec::new());
    cluster
        .server
        .load_range(&table, &low, None, &RangeState::default())
        .expect("load low");
    cluster
        .server
        .load_range(&table, &high, None, &RangeState::default())
        .expect("load high");

    cluster.server.drop_range(&table, &low).expect("drop low");
    assert!(cluster.server.get_range(7, &low).is_none());
    assert!(cluster.server.get_range(7, &high).is_some());

    let err = cluster
        .server
        .drop_range(&table, &low)
        .expect_err("already dropped");
    assert!(matches!(err, Error::RangeNotFound(_)));
    cluster.server.shutdown();
}

#[test]
fn stale_schema_generation_is_rejected() {
    let dir = tempfile::tempdir().expect("tempdir");
    let cluster = start_cluster(dir.path());
    load_metadata_ranges(&cluster);

    // The coordinator holds generation 1; the request claims generation 5.
    register_user_table(&cluster, 7, "orders");
    let stale = TableIdentifier::new(7, "orders", 5);
    let err = cluster
        .server
        .load_range(
            &stale,
            &RangeSpec::new(Vec::new(), Vec::new()),
            None,
            &RangeState::default(),
        )
        .expect_err("newer generation than stored");
    assert!(matches!(err, Error::GenerationMismatch(_)));
    cluster.server.shutdown();
}

#[test]
fn schema_upgrades_are_picked_up_from_the_coordinator() {
    let dir = tempfile::tempdir().expect("tempdir");
    let cluster = start_cluster(dir.path());
    load_metadata_ranges(&cluster);
    let spec = RangeSpec::new(Vec::new(), Vec::new());
    let table = load_user_range(&cluster, 7, "orders", &spec);

    // Publish generation 2 and send a request stamped with it.
    cluster
        .coordinator
        .attr_set(
            &cluster.config.table_namespace("orders"),
            "schema",
            user_schema_doc(2).as_bytes(),
        )
        .expect("upgrade schema");
    let upgraded = TableIdentifier::new(table.id, table.name.clone(), 2);
    let (count, buffer) = auto_cells(&[b"a"], b"v");
    cluster
        .server
        .update(&upgraded, count, buffer)
        .expect("update with new generation");
    cluster.server.shutdown();
}

#[test]
fn compact_schedules_at_most_one_task_per_range() {
    let dir = tempfile::tempdir().expect("tempdir");
    let cluster = start_cluster(dir.path());
    load_metadata_ranges(&cluster);
    let spec = RangeSpec::new(Vec::new(), Vec::new());
    let table = load_user_range(&cluster, 7, "orders", &spec);

    let (count, buffer) = auto_cells(&[b"a", b"b"], b"v");
    cluster.server.update(&table, count, buffer).expect("update");

    cluster.server.compact(&table, &spec, true).expect("compact");
    // The maintenance flag is held until the worker finishes; a second
    // request is accepted but not double-scheduled.
    cluster.server.compact(&table, &spec, true).expect("compact again");

    // Wait for the flushed image to absorb the memtable.
    let range = cluster.server.get_range(7, &spec).expect("range");
    for _ in 0..200 {
        if range.memory_usage() == 0 && !range.maintenance_in_progress() {
            break;
        }
        std::thread::sleep(std::time::Duration::from_millis(5));
    }
    assert_eq!(range.memory_usage(), 0);
    assert!(range.disk_usage() > 0);

    // Compaction preserves the data.
    let cells = scan_all(&cluster, &table, &spec);
    assert_eq!(cells.len(), 2);
    cluster.server.shutdown();
}

#[test]
fn statistics_cover_every_hosted_range() {
    let dir = tempfile::tempdir().expect("tempdir");
    let cluster = start_cluster(dir.path());
    load_metadata_ranges(&cluster);
    let spec = RangeSpec::new(Vec::new(), Vec::new());
    let table = load_user_range(&cluster, 7, "orders", &spec);

    let (count, buffer) = auto_cells(&[b"a"], b"v");
    cluster.server.update(&table, count, buffer).expect("update");

    let stats = cluster.server.get_statistics();
    assert_eq!(stats.location, cluster.config.location);
    // ROOT, the second metadata range, and the user range.
    assert_eq!(stats.ranges.len(), 3);
    let user = stats
        .ranges
        .iter()
        .find(|r| r.table_id == 7)
        .expect("user range stats");
    assert_eq!(user.cells, 1);
    assert!(user.memory_used > 0);
    cluster.server.shutdown();
}

#[test]
fn dispatch_maps_errors_and_payloads() {
    let dir = tempfile::tempdir().expect("tempdir");
    let cluster = start_cluster(dir.path());
    load_metadata_ranges(&cluster);
    let spec = RangeSpec::new(Vec::new(), b"m".to_vec());
    let table = load_user_range(&cluster, 7, "orders", &spec);

    // Fetching an unknown scanner maps to an error response.
    match cluster.server.dispatch(Request::FetchScanblock { scanner_id: 404 }) {
        Response::Error { code: c, .. } => assert_eq!(c, code::INVALID_SCANNER_ID),
        other => panic!("unexpected response: {other:?}"),
    }

    // An update with out-of-range rows returns the packed error array.
    let (count, buffer) = auto_cells(&[b"a", b"z"], b"v");
    match cluster.server.dispatch(Request::Update {
        table: table.clone(),
        count,
        buffer,
    }) {
        Response::UpdateErrors { data } => {
            let records = range_server::update::decode_send_back(&data).expect("decode");
            assert_eq!(records.len(), 1);
            assert_eq!(records[0].error, code::OUT_OF_RANGE);
        }
        other => panic!("unexpected response: {other:?}"),
    }

    // Statistics serialize as JSON.
    match cluster.server.dispatch(Request::GetStatistics) {
        Response::Statistics { json } => assert!(json.contains("\"ranges\"")),
        other => panic!("unexpected response: {other:?}"),
    }

    match cluster.server.dispatch(Request::Status) {
        Response::Ok => {}
        other => panic!("unexpected response: {other:?}"),
    }
    cluster.server.shutdown();
}
