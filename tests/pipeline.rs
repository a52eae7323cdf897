//! End-to-end tests across the CIF loader, the TRUST ingester, and the
//! full-timetable reconciler sharing one store, using only the public
//! `nr_rail_core` surface.

use std::sync::Arc;

use chrono::{TimeZone, Utc};
use nr_rail_core::cif::loader::{CifLoader, ScheduleApplyError};
use nr_rail_core::cif::parse_file;
use nr_rail_core::reconcile::Reconciler;
use nr_rail_core::store::memory::MemoryStore;
use nr_rail_core::store::StoreBackend;
use nr_rail_core::trust::TrustIngester;

fn header(update_indicator: char, hour: &str) -> String {
    let mut line: Vec<char> = vec![' '; 80];
    for (i, c) in "HD".chars().enumerate() {
        line[i] = c;
    }
    for (at, text) in [(22, "03"), (24, "06"), (26, "23"), (28, hour), (30, "00")] {
        for (i, c) in text.chars().enumerate() {
            line[at + i] = c;
        }
    }
    line[46] = update_indicator;
    line.into_iter().collect()
}

fn bs_card(transaction_type: char, uid: &str, stp: char) -> String {
    let mut line: Vec<char> = vec![' '; 80];
    for (at, text) in [(0, "BS"), (3, uid), (9, "230101"), (15, "231231"), (21, "1111111")] {
        for (i, c) in text.chars().enumerate() {
            line[at + i] = c;
        }
    }
    line[2] = transaction_type;
    line[32] = 'X';
    line[33] = 'X';
    line[34] = '1';
    line[35] = '2';
    line[79] = stp;
    line.into_iter().collect()
}

fn loc_card(kind: &str, tiploc: &str, time: &str) -> String {
    let mut line: Vec<char> = vec![' '; 80];
    for (i, c) in kind.chars().enumerate() {
        line[i] = c;
    }
    for (i, c) in tiploc.chars().enumerate() {
        line[2 + i] = c;
    }
    for (i, c) in time.chars().enumerate() {
        line[10 + i] = c;
    }
    line.into_iter().collect()
}

fn full_extract_with_one_schedule(hour: &str) -> String {
    format!(
        "{}\n{}\n{}\n{}\nZZ\n",
        header('F', hour),
        bs_card('N', "C12345", 'P'),
        loc_card("LO", "EUSTON ", "1000"),
        loc_card("LT", "GLGC   ", "1800"),
    )
}

fn schedule_dates() -> (chrono::NaiveDate, chrono::NaiveDate) {
    (
        chrono::NaiveDate::from_ymd_opt(2023, 1, 1).unwrap(),
        chrono::NaiveDate::from_ymd_opt(2023, 12, 31).unwrap(),
    )
}

/// S1: re-applying an identical full extract is rejected at the header
/// check, never reaching card processing a second time.
#[tokio::test]
async fn identical_full_extract_is_rejected_on_reapply() {
    let store: Arc<dyn StoreBackend> = Arc::new(MemoryStore::new());
    let loader = CifLoader::new(store);
    let file = parse_file(&full_extract_with_one_schedule("14")).unwrap();
    let now = Utc.with_ymd_and_hms(2023, 6, 1, 0, 0, 0).unwrap();

    loader.load(&file, true, false, now).await.unwrap();
    let err = loader.load(&file, true, false, now).await.unwrap_err();
    assert!(matches!(err, ScheduleApplyError::StaleExtract));
}

/// S2: a BSN + LO + LT card sequence produces one live schedule with two
/// locations, quantised to quarter-minute sort times.
#[tokio::test]
async fn bsn_lo_lt_sequence_creates_one_schedule_with_quarter_minute_sort_times() {
    let store = Arc::new(MemoryStore::new());
    let loader = CifLoader::new(store.clone());
    let file = parse_file(&full_extract_with_one_schedule("14")).unwrap();
    let now = Utc.with_ymd_and_hms(2023, 6, 1, 0, 0, 0).unwrap();

    let stats = loader.load(&file, true, false, now).await.unwrap();
    assert_eq!(stats.schedules_created, 1);
    assert_eq!(stats.locations_created, 2);

    let (start, end) = schedule_dates();
    let matches = store.find_live_schedules_by_uid_dates("C12345", start, end, None).await.unwrap();
    assert_eq!(matches.len(), 1);
    let locations = store.locations_for_schedule(matches[0].id).await.unwrap();
    let sort_times: Vec<u32> = locations.iter().map(|l| l.sort_time).collect();
    assert_eq!(sort_times, vec![2400, 4320]);
}

/// S3: a 0001 activation for the loaded schedule's uid binds to it and
/// counts as a good message.
#[tokio::test]
async fn activation_binds_to_loaded_schedule() {
    let store = Arc::new(MemoryStore::new());
    let loader = CifLoader::new(store.clone());
    let file = parse_file(&full_extract_with_one_schedule("14")).unwrap();
    let load_now = Utc.with_ymd_and_hms(2023, 6, 1, 0, 0, 0).unwrap();
    loader.load(&file, true, false, load_now).await.unwrap();

    let (start, end) = schedule_dates();
    let schedule_id = store.find_live_schedules_by_uid_dates("C12345", start, end, None).await.unwrap()[0].id;

    let mut ingester = TrustIngester::new(store.clone(), chrono_tz::Europe::London, false);
    let now = Utc.with_ymd_and_hms(2023, 6, 3, 9, 0, 0).unwrap();
    let json = r#"{"msg_type":"0001","train_id":"122P12345678","train_uid":"C12345","schedule_start_date":"2023-01-01","schedule_end_date":"2023-12-31","msg_queue_timestamp":"2023-06-03T09:00:00Z"}"#;
    ingester.ingest_frame(json, now).await.unwrap();

    assert_eq!(ingester.stats.today.good_message, 1);
    assert_eq!(ingester.stats.today.activations, 1);
    let activation = store
        .live_activation_for_train("122P12345678", now - chrono::Duration::hours(1))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(activation.schedule_id, schedule_id);
}

/// S6: a BSD for the loaded schedule soft-deletes exactly one row; a
/// second BSD against the now-deleted schedule counts a delete-miss
/// instead of a second hit.
#[tokio::test]
async fn basic_schedule_delete_soft_deletes_once_then_misses_on_reapply() {
    let store = Arc::new(MemoryStore::new());
    let loader = CifLoader::new(store.clone());
    let file = parse_file(&full_extract_with_one_schedule("14")).unwrap();
    let now = Utc.with_ymd_and_hms(2023, 6, 1, 0, 0, 0).unwrap();
    loader.load(&file, true, false, now).await.unwrap();

    let delete_text = format!("{}\n{}\nZZ\n", header('U', "15"), bs_card('D', "C12345", 'P'));
    let delete_file = parse_file(&delete_text).unwrap();
    let stats = loader.load(&delete_file, false, false, now).await.unwrap();
    assert_eq!(stats.schedules_deleted, 1);
    assert_eq!(stats.schedule_delete_miss, 0);

    let reapply_text = format!("{}\n{}\nZZ\n", header('U', "16"), bs_card('D', "C12345", 'P'));
    let reapply_file = parse_file(&reapply_text).unwrap();
    let stats2 = loader.load(&reapply_file, false, false, now).await.unwrap();
    assert_eq!(stats2.schedules_deleted, 0);
    assert_eq!(stats2.schedule_delete_miss, 1);
}

/// Reconciler completeness (spec property 8): a schedule the loader
/// created but a fresh full extract no longer mentions is reported, and
/// soft-deleted when run with `apply`.
#[tokio::test]
async fn reconciler_orphans_a_schedule_missing_from_a_fresh_extract() {
    let store = Arc::new(MemoryStore::new());
    let loader = CifLoader::new(store.clone());
    let file = parse_file(&full_extract_with_one_schedule("14")).unwrap();
    let now = Utc.with_ymd_and_hms(2023, 6, 1, 0, 0, 0).unwrap();
    loader.load(&file, true, false, now).await.unwrap();

    let (start, end) = schedule_dates();
    let schedule_id = store.find_live_schedules_by_uid_dates("C12345", start, end, None).await.unwrap()[0].id;

    let fresh_text = format!("{}\nZZ\n", header('F', "15"));
    let fresh_file = parse_file(&fresh_text).unwrap();
    let reconciler = Reconciler::new(store.clone());
    let stats = reconciler.run(&fresh_file, now, true, None).await.unwrap();

    assert_eq!(stats.orphaned_schedule_ids, vec![schedule_id]);
    let schedule = store.get_schedule(schedule_id).await.unwrap().unwrap();
    assert!(schedule.deleted.is_some());
}
