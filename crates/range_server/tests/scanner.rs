//! Scanner lifecycle: creation, block fetching, destruction, and spec
//! validation.

mod common;

use common::*;
use range_server::error::Error;
use range_server::range::{CellInterval, RowInterval, ScanSpec};
use range_server::types::RangeSpec;

#[test]
fn scanner_pages_through_blocks() {
    let dir = tempfile::tempdir().expect("tempdir");
    let cluster = start_cluster(dir.path());
    load_metadata_ranges(&cluster);
    let spec = RangeSpec::new(Vec::new(), Vec::new());
    let table = load_user_range(&cluster, 7, "orders", &spec);

    let rows: Vec<Vec<u8>> = (0..20).map(|i| format!("row{i:02}").into_bytes()).collect();
    let row_refs: Vec<&[u8]> = rows.iter().map(|r| r.as_slice()).collect();
    let (count, buffer) = auto_cells(&row_refs, b"some-value-padding");
    cluster.server.update(&table, count, buffer).expect("update");

    // The tiny test block size forces paging through several blocks.
    let mut block = cluster
        .server
        .create_scanner(&table, &spec, &ScanSpec::default())
        .expect("create scanner");
    assert!(block.more);
    assert!(block.scanner_id > 0);
    let scanner_id = block.scanner_id;

    let mut cells = decode_cells(&block.data);
    let mut fetches = 0;
    while block.more {
        block = cluster
            .server
            .fetch_scanblock(scanner_id)
            .expect("fetch scanblock");
        cells.extend(decode_cells(&block.data));
        fetches += 1;
    }
    assert!(fetches > 1);
    assert_eq!(cells.len(), 20);

    // A drained scanner leaves the map; fetching it again is an error.
    let err = cluster
        .server
        .fetch_scanblock(scanner_id)
        .expect_err("drained scanner");
    assert!(matches!(err, Error::InvalidScannerId(_)));
    cluster.server.shutdown();
}

#[test]
fn destroyed_scanner_id_is_invalid() {
    let dir = tempfile::tempdir().expect("tempdir");
    let cluster = start_cluster(dir.path());
    load_metadata_ranges(&cluster);
    let spec = RangeSpec::new(Vec::new(), Vec::new());
    let table = load_user_range(&cluster, 7, "orders", &spec);

    let rows: Vec<Vec<u8>> = (0..20).map(|i| format!("row{i:02}").into_bytes()).collect();
    let row_refs: Vec<&[u8]> = rows.iter().map(|r| r.as_slice()).collect();
    let (count, buffer) = auto_cells(&row_refs, b"some-value-padding");
    cluster.server.update(&table, count, buffer).expect("update");

    let block = cluster
        .server
        .create_scanner(&table, &spec, &ScanSpec::default())
        .expect("create scanner");
    assert!(block.more);

    cluster.server.destroy_scanner(block.scanner_id);
    let err = cluster
        .server
        .fetch_scanblock(block.scanner_id)
        .expect_err("destroyed scanner");
    assert!(matches!(err, Error::InvalidScannerId(_)));
    cluster.server.shutdown();
}

#[test]
fn row_interval_restricts_the_scan() {
    let dir = tempfile::tempdir().expect("tempdir");
    let cluster = start_cluster(dir.path());
    load_metadata_ranges(&cluster);
    let spec = RangeSpec::new(Vec::new(), Vec::new());
    let table = load_user_range(&cluster, 7, "orders", &spec);

    let (count, buffer) = auto_cells(&[b"a", b"b", b"c", b"d"], b"v");
    cluster.server.update(&table, count, buffer).expect("update");

    let scan_spec = ScanSpec {
        row_intervals: vec![RowInterval {
            start: b"b".to_vec(),
            start_inclusive: true,
            end: b"c".to_vec(),
            end_inclusive: true,
        }],
        ..Default::default()
    };
    let block = cluster
        .server
        .create_scanner(&table, &spec, &scan_spec)
        .expect("scanner");
    let rows: Vec<_> = decode_cells(&block.data)
        .into_iter()
        .map(|(k, _)| k.row)
        .collect();
    assert_eq!(rows, vec![b"b".to_vec(), b"c".to_vec()]);
    cluster.server.shutdown();
}

#[test]
fn malformed_scan_specs_are_rejected() {
    let dir = tempfile::tempdir().expect("tempdir");
    let cluster = start_cluster(dir.path());
    load_metadata_ranges(&cluster);
    let spec = RangeSpec::new(Vec::new(), Vec::new());
    let table = load_user_range(&cluster, 7, "orders", &spec);

    let two_rows = ScanSpec {
        row_intervals: vec![RowInterval::default(), RowInterval::default()],
        ..Default::default()
    };
    let err = cluster
        .server
        .create_scanner(&table, &spec, &two_rows)
        .expect_err("two row intervals");
    assert!(matches!(err, Error::BadScanSpec(_)));

    let mixed = ScanSpec {
        row_intervals: vec![RowInterval::default()],
        cell_intervals: vec![CellInterval::default()],
        ..Default::default()
    };
    let err = cluster
        .server
        .create_scanner(&table, &spec, &mixed)
        .expect_err("row and cell intervals");
    assert!(matches!(err, Error::BadScanSpec(_)));
    cluster.server.shutdown();
}

#[test]
fn scanning_an_unloaded_range_is_range_not_found() {
    let dir = tempfile::tempdir().expect("tempdir");
    let cluster = start_cluster(dir.path());
    load_metadata_ranges(&cluster);
    let table = load_user_range(&cluster, 7, "orders", &RangeSpec::new(Vec::new(), b"m".to_vec()));

    let err = cluster
        .server
        .create_scanner(&table, &RangeSpec::new(b"m".to_vec(), Vec::new()), &ScanSpec::default())
        .expect_err("unloaded interval");
    assert!(matches!(err, Error::RangeNotFound(_)));
    cluster.server.shutdown();
}
