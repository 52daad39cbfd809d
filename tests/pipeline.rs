//! End-to-end pipeline tests: general log text through the parser, the
//! checkpoint/risk filters, and the batch sink into an in-memory store.

mod common;

use std::sync::Arc;

use chrono::{TimeZone, Utc};
use common::init_tracing;
use mla_parse::{GeneralLogParser, RiskLevel, RiskRuleSet};
use mla_scan::CheckpointWindow;
use mla_store::{ActivityBatchSink, ActivityFilter, MlaStore, StatsFilter};

const FIXTURE: &str = "2024-05-10T08:00:00.000000Z\t    8 Connect\troot@localhost on orders\n\
2024-05-10T08:00:01.123456Z\t    8 Query\tSELECT * FROM orders WHERE id = 1\n\
2024-05-10T08:00:02.000000Z\t    8 Query\tUPDATE orders SET status = 'paid' WHERE id = 1\n\
2024-05-10T08:00:03.000000Z\t    9 Connect\tapp@10.0.0.5 on inventory\n\
not a log line at all\n\
2024-05-10T08:00:04.500000Z\t    9 Query\tDROP TABLE staging_items\n\
2024-05-10T08:00:05.000000Z\t    8 Quit\t\n";

fn run_pipeline(
    store: &Arc<MlaStore>,
    window: &CheckpointWindow,
    allowed: &[RiskLevel],
    batch_size: usize,
) -> usize {
    let mut parser = GeneralLogParser::new(1, RiskRuleSet::default());
    let mut sink = ActivityBatchSink::new(Arc::clone(store), batch_size);
    for line in FIXTURE.lines() {
        if let Some(record) = parser.feed_line(line) {
            if window.accepts(record.timestamp) && allowed.contains(&record.risk_level) {
                sink.push(record).unwrap();
            }
        }
    }
    sink.finish().unwrap()
}

const ALL_LEVELS: &[RiskLevel] = &[RiskLevel::High, RiskLevel::Medium, RiskLevel::Low];

#[test]
fn test_parse_store_query_end_to_end() {
    init_tracing();
    let store = Arc::new(MlaStore::open_memory().unwrap());
    let window = CheckpointWindow::begin(None);

    let stored = run_pipeline(&store, &window, ALL_LEVELS, 2);
    assert_eq!(stored, 3);

    // the DROP is classified DDL/High and carries thread 9's session context
    let (rows, total) = store
        .list_activities(&ActivityFilter {
            risk_level: Some("High".to_string()),
            ..Default::default()
        })
        .unwrap();
    assert_eq!(total, 1);
    assert_eq!(rows[0].operation_type.as_deref(), Some("DDL"));
    assert_eq!(rows[0].user_name.as_deref(), Some("app"));
    assert_eq!(rows[0].client_host.as_deref(), Some("10.0.0.5"));
    assert_eq!(rows[0].db_name.as_deref(), Some("inventory"));
    assert_eq!(rows[0].thread_id, 9);

    let stats = store.activity_stats(&StatsFilter::default()).unwrap();
    assert_eq!(stats.total_count, 3);
    assert_eq!(stats.hourly_distribution[8], 3);
    let risks: Vec<_> = stats
        .risk_levels
        .iter()
        .map(|r| (r.risk_level.as_str(), r.count))
        .collect();
    assert_eq!(risks, vec![("High", 1), ("Medium", 1), ("Low", 1)]);
}

#[test]
fn test_checkpoint_blocks_rescan_of_old_records() {
    init_tracing();
    let store = Arc::new(MlaStore::open_memory().unwrap());

    // first scan: no watermark, everything qualifies
    let first = CheckpointWindow::begin(store.get_checkpoint(1).unwrap());
    let stored = run_pipeline(&store, &first, ALL_LEVELS, 500);
    assert_eq!(stored, 3);
    store.set_checkpoint(1, first.scan_start()).unwrap();

    // second scan: all fixture records predate the watermark
    let second = CheckpointWindow::begin(store.get_checkpoint(1).unwrap());
    let stored = run_pipeline(&store, &second, ALL_LEVELS, 500);
    assert_eq!(stored, 0);

    let (_, total) = store.list_activities(&ActivityFilter::default()).unwrap();
    assert_eq!(total, 3);
}

#[test]
fn test_risk_policy_drops_filtered_levels() {
    init_tracing();
    let store = Arc::new(MlaStore::open_memory().unwrap());
    let window = CheckpointWindow::begin(None);

    let stored = run_pipeline(&store, &window, &[RiskLevel::High], 500);
    assert_eq!(stored, 1);

    let (rows, _) = store.list_activities(&ActivityFilter::default()).unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].risk_level, "High");
}

#[test]
fn test_time_range_query_over_stored_records() {
    init_tracing();
    let store = Arc::new(MlaStore::open_memory().unwrap());
    let window = CheckpointWindow::begin(None);
    run_pipeline(&store, &window, ALL_LEVELS, 500);

    // only the first two queries fall inside this window
    let (rows, total) = store
        .list_activities(&ActivityFilter {
            start: Some(Utc.with_ymd_and_hms(2024, 5, 10, 8, 0, 1).unwrap()),
            end: Some(Utc.with_ymd_and_hms(2024, 5, 10, 8, 0, 3).unwrap()),
            ..Default::default()
        })
        .unwrap();
    assert_eq!(total, 2);
    assert!(rows.iter().all(|r| r.thread_id == 8));
}
