//! Applies a parsed `CIFFile` to a `StoreBackend` (spec §4.C). One
//! `CifLoader::load` call is one Store transaction, matching the
//! teacher's preference for a single object owning a unit of work.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::store::{
    LocationRecordType, NewChangeEnRoute, NewSchedule, NewScheduleLocation, SourceKind,
    StoreBackend, StoreError, StpIndicator,
};
use crate::time::CifTime;

use super::parser::parse_cif_date;
use super::types::{CIFFile, CIFRecord, CIFUpdateIndicator};

#[derive(Debug, Error)]
pub enum ScheduleApplyError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("a full extract was received but this load expected update-only")]
    UnexpectedFullExtract,
    #[error("extract timestamp is not newer than the last loaded extract for this source")]
    StaleExtract,
    #[error("{0} card without a preceding BS schedule context")]
    MissingScheduleContext(&'static str),
    #[error("malformed days_run field {0:?}")]
    BadDaysRun(String),
    #[error("malformed CIF date {0:?}")]
    BadDate(String),
    #[error("malformed STP indicator {0:?}")]
    BadStpIndicator(char),
    #[error("file did not start with a header card")]
    MissingHeader,
}

/// Card/row counters for the progress log and the caller's summary
/// (spec §4.C "Progress telemetry").
#[derive(Debug, Clone, Default)]
pub struct LoadStats {
    pub cards_processed: u64,
    pub schedules_created: u64,
    pub schedules_deleted: u64,
    pub schedule_delete_multi: u64,
    pub schedule_delete_miss: u64,
    pub associations_created: u64,
    pub association_delete_multi: u64,
    pub association_delete_miss: u64,
    pub locations_created: u64,
    pub tiplocs_upserted: u64,
}

fn parse_days_run(s: &str) -> Result<u8, ScheduleApplyError> {
    if s.len() != 7 || !s.bytes().all(|b| b == b'0' || b == b'1') {
        return Err(ScheduleApplyError::BadDaysRun(s.to_string()));
    }
    let mut bits = 0u8;
    for (i, b) in s.bytes().enumerate() {
        if b == b'1' {
            bits |= 1 << i;
        }
    }
    Ok(bits)
}

fn require_date(s: &str) -> Result<chrono::NaiveDate, ScheduleApplyError> {
    parse_cif_date(s).ok_or_else(|| ScheduleApplyError::BadDate(s.to_string()))
}

fn require_stp(c: char) -> Result<StpIndicator, ScheduleApplyError> {
    StpIndicator::from_char(c).ok_or(ScheduleApplyError::BadStpIndicator(c))
}

/// Progress telemetry cadence: every 10 minutes by default, every
/// minute with `verbose` (spec §4.C).
fn progress_interval(verbose: bool) -> Duration {
    if verbose {
        Duration::from_secs(60)
    } else {
        Duration::from_secs(600)
    }
}

pub struct CifLoader {
    store: Arc<dyn StoreBackend>,
}

impl CifLoader {
    pub fn new(store: Arc<dyn StoreBackend>) -> Self {
        Self { store }
    }

    /// Load `file`, applying every record as one Store transaction.
    /// `expect_full` is the caller's declared intent (the full-timetable
    /// loader binary passes `true`, the daily-update loader `false`);
    /// a mismatched `HD` update indicator is rejected before anything
    /// else runs.
    pub async fn load(
        &self,
        file: &CIFFile,
        expect_full: bool,
        verbose: bool,
        now: DateTime<Utc>,
    ) -> Result<LoadStats, ScheduleApplyError> {
        let mut records = file.records().iter();
        let header = match records.next() {
            Some(CIFRecord::Header {
                date_of_extract,
                time_of_extract,
                update_indicator,
                ..
            }) => (*date_of_extract, *time_of_extract, *update_indicator),
            _ => return Err(ScheduleApplyError::MissingHeader),
        };
        let (extract_date, extract_time, update_indicator) = header;
        if update_indicator == CIFUpdateIndicator::Full && !expect_full {
            return Err(ScheduleApplyError::UnexpectedFullExtract);
        }
        let source_kind = if update_indicator == CIFUpdateIndicator::Full {
            SourceKind::Full
        } else {
            SourceKind::DailyUpdate
        };
        let extract_timestamp = DateTime::from_naive_utc_and_offset(
            extract_date.and_time(extract_time),
            Utc,
        );

        self.store.begin().await?;
        let result = self
            .load_within_transaction(&mut records, source_kind, extract_timestamp, verbose, now)
            .await;
        match result {
            Ok(stats) => {
                self.store.commit().await?;
                Ok(stats)
            }
            Err(e) => {
                // Best-effort: a rollback failure shouldn't mask the
                // original error that triggered it.
                let _ = self.store.rollback().await;
                Err(e)
            }
        }
    }

    async fn load_within_transaction<'a>(
        &self,
        records: &mut impl Iterator<Item = &'a CIFRecord>,
        source_kind: SourceKind,
        extract_timestamp: DateTime<Utc>,
        verbose: bool,
        now: DateTime<Utc>,
    ) -> Result<LoadStats, ScheduleApplyError> {
        if let Some(latest) = self.store.latest_update_extract_timestamp(source_kind).await? {
            if extract_timestamp <= latest {
                return Err(ScheduleApplyError::StaleExtract);
            }
        }
        let update_id = self.store.insert_update_batch(extract_timestamp, source_kind).await?;

        let mut stats = LoadStats::default();
        let mut pending: Option<NewSchedule> = None;
        let mut current_schedule_id: Option<i64> = None;
        let mut last_progress = Instant::now();
        let interval = progress_interval(verbose);

        for record in records {
            stats.cards_processed += 1;
            if last_progress.elapsed() >= interval {
                log::info!(
                    "CIF load progress: {} cards, {} schedules, {} locations",
                    stats.cards_processed,
                    stats.schedules_created,
                    stats.locations_created,
                );
                last_progress = Instant::now();
            }

            match record {
                CIFRecord::Header { .. } => {}
                CIFRecord::Trailer => {}
                CIFRecord::TIPLOCInsert { tiploc, nlc, tps_description, stanox, three_alpha_code } => {
                    self.flush_pending(&mut pending, &mut current_schedule_id, update_id, now, &mut stats).await?;
                    self.store
                        .upsert_tiploc(&crate::store::Tiploc {
                            tiploc: tiploc.clone(),
                            nalco: *nlc,
                            tps_description: tps_description.clone(),
                            stanox: *stanox,
                            three_alpha: three_alpha_code.clone(),
                        })
                        .await?;
                    stats.tiplocs_upserted += 1;
                }
                CIFRecord::TIPLOCAmend { tiploc, nlc, tps_description, stanox, three_alpha_code, new_tiploc } => {
                    self.flush_pending(&mut pending, &mut current_schedule_id, update_id, now, &mut stats).await?;
                    let t = crate::store::Tiploc {
                        tiploc: if new_tiploc.is_empty() { tiploc.clone() } else { new_tiploc.clone() },
                        nalco: *nlc,
                        tps_description: tps_description.clone(),
                        stanox: *stanox,
                        three_alpha: three_alpha_code.clone(),
                    };
                    if new_tiploc.is_empty() || new_tiploc == tiploc {
                        self.store.upsert_tiploc(&t).await?;
                    } else {
                        self.store.rename_tiploc(tiploc, &t).await?;
                    }
                    stats.tiplocs_upserted += 1;
                }
                CIFRecord::TIPLOCDelete { tiploc } => {
                    self.flush_pending(&mut pending, &mut current_schedule_id, update_id, now, &mut stats).await?;
                    self.store.delete_tiploc(tiploc).await?;
                }
                CIFRecord::BasicSchedule {
                    transaction_type,
                    train_uid,
                    date_runs_from,
                    date_runs_to,
                    days_run,
                    train_category,
                    signalling_id,
                    headcode,
                    service_code,
                    power_type,
                    speed,
                    train_class,
                    stp_indicator,
                    ..
                } => {
                    self.flush_pending(&mut pending, &mut current_schedule_id, update_id, now, &mut stats).await?;
                    let start = require_date(date_runs_from)?;
                    let stp = require_stp(*stp_indicator)?;
                    match transaction_type {
                        'R' | 'D' => {
                            let matches = self
                                .store
                                .find_live_schedules_for_delete(train_uid, start, stp)
                                .await?;
                            if matches.len() > 1 {
                                log::warn!("ScheduleDeleteMulti: {train_uid} {start} {stp:?}");
                                stats.schedule_delete_multi += 1;
                            }
                            if matches.is_empty() {
                                if *transaction_type == 'D' {
                                    log::warn!("ScheduleDeleteMiss: {train_uid} {start} {stp:?}");
                                    stats.schedule_delete_miss += 1;
                                }
                            } else {
                                for m in &matches {
                                    self.store.soft_delete_schedule(m.id, now).await?;
                                    stats.schedules_deleted += 1;
                                }
                            }
                            if *transaction_type == 'D' {
                                continue;
                            }
                        }
                        _ => {}
                    }
                    let end = require_date(date_runs_to)?;
                    let bits = parse_days_run(days_run)?;
                    let mut new = NewSchedule {
                        train_uid: train_uid.clone(),
                        stp_indicator: stp,
                        schedule_start_date: start,
                        schedule_end_date: end,
                        days_run: bits,
                        atoc_code: String::new(),
                        uic_code: String::new(),
                        category: train_category.clone(),
                        signalling_id: signalling_id.clone(),
                        headcode: headcode.clone(),
                        service_code: service_code.clone(),
                        power_type: power_type.clone(),
                        speed: speed.clone(),
                        train_class: *train_class,
                        update_id,
                        created: now,
                        deduced_headcode: String::new(),
                        deduced_headcode_status: None,
                    };
                    if stp != StpIndicator::Permanent {
                        if let Some(prev) = self.store.most_recent_schedule_for_uid(train_uid, now).await? {
                            if !prev.deduced_headcode.is_empty() {
                                new.deduced_headcode = prev.deduced_headcode;
                                new.deduced_headcode_status = Some('D');
                            }
                        }
                    }
                    pending = Some(new);
                }
                CIFRecord::BasicScheduleExtra { uic_code, atoc_code, .. } => {
                    if let Some(p) = pending.as_mut() {
                        p.uic_code = uic_code.clone();
                        p.atoc_code = atoc_code.clone();
                    }
                }
                CIFRecord::LocationOrigin { tiploc, tiploc_instance, scheduled_departure, public_departure, platform, line, engineering_allowance, pathing_allowance, activity, performance_allowance } => {
                    self.flush_pending(&mut pending, &mut current_schedule_id, update_id, now, &mut stats).await?;
                    let schedule_id = current_schedule_id.ok_or(ScheduleApplyError::MissingScheduleContext("LO"))?;
                    let departure = CifTime::parse(scheduled_departure).ok();
                    self.store
                        .insert_location(&NewScheduleLocation {
                            schedule_id,
                            record_type: LocationRecordType::Origin,
                            tiploc: tiploc.clone(),
                            tiploc_instance: *tiploc_instance,
                            activities: activity.clone(),
                            arrival: None,
                            departure,
                            pass: None,
                            public_arrival: None,
                            public_departure: Some(public_departure.clone()),
                            platform: platform.clone(),
                            line: line.clone(),
                            path: String::new(),
                            engineering_allowance: engineering_allowance.clone(),
                            pathing_allowance: pathing_allowance.clone(),
                            performance_allowance: performance_allowance.clone(),
                        })
                        .await?;
                    stats.locations_created += 1;
                }
                CIFRecord::LocationIntermediate { tiploc, tiploc_instance, scheduled_arrival, scheduled_departure, scheduled_pass, public_arrival, public_departure, platform, line, path, activity, engineering_allowance, pathing_allowance, performance_allowance } => {
                    self.flush_pending(&mut pending, &mut current_schedule_id, update_id, now, &mut stats).await?;
                    let schedule_id = current_schedule_id.ok_or(ScheduleApplyError::MissingScheduleContext("LI"))?;
                    let arrival = CifTime::parse(scheduled_arrival).ok();
                    let departure = CifTime::parse(scheduled_departure).ok();
                    let pass = CifTime::parse(scheduled_pass).ok();
                    self.store
                        .insert_location(&NewScheduleLocation {
                            schedule_id,
                            record_type: LocationRecordType::Intermediate,
                            tiploc: tiploc.clone(),
                            tiploc_instance: *tiploc_instance,
                            activities: activity.clone(),
                            arrival,
                            departure,
                            pass,
                            public_arrival: Some(public_arrival.clone()),
                            public_departure: Some(public_departure.clone()),
                            platform: platform.clone(),
                            line: line.clone(),
                            path: path.clone(),
                            engineering_allowance: engineering_allowance.clone(),
                            pathing_allowance: pathing_allowance.clone(),
                            performance_allowance: performance_allowance.clone(),
                        })
                        .await?;
                    stats.locations_created += 1;
                }
                CIFRecord::LocationTerminus { tiploc, tiploc_instance, scheduled_arrival, public_arrival, platform, path, activity } => {
                    self.flush_pending(&mut pending, &mut current_schedule_id, update_id, now, &mut stats).await?;
                    let schedule_id = current_schedule_id.ok_or(ScheduleApplyError::MissingScheduleContext("LT"))?;
                    let arrival = CifTime::parse(scheduled_arrival).ok();
                    self.store
                        .insert_location(&NewScheduleLocation {
                            schedule_id,
                            record_type: LocationRecordType::Terminus,
                            tiploc: tiploc.clone(),
                            tiploc_instance: *tiploc_instance,
                            activities: activity.clone(),
                            arrival,
                            departure: None,
                            pass: None,
                            public_arrival: Some(public_arrival.clone()),
                            public_departure: None,
                            platform: platform.clone(),
                            line: String::new(),
                            path: path.clone(),
                            engineering_allowance: String::new(),
                            pathing_allowance: String::new(),
                            performance_allowance: String::new(),
                        })
                        .await?;
                    stats.locations_created += 1;
                }
                CIFRecord::ChangeEnRoute { tiploc, train_category, headcode, service_code, power_type, timing_load, .. } => {
                    self.flush_pending(&mut pending, &mut current_schedule_id, update_id, now, &mut stats).await?;
                    let schedule_id = current_schedule_id.ok_or(ScheduleApplyError::MissingScheduleContext("CR"))?;
                    self.store
                        .insert_change_en_route(&NewChangeEnRoute {
                            schedule_id,
                            tiploc: tiploc.clone(),
                            category: train_category.clone(),
                            headcode: headcode.clone(),
                            service_code: service_code.clone(),
                            power_type: power_type.clone(),
                            timing_load: timing_load.clone(),
                        })
                        .await?;
                }
                CIFRecord::Association { transaction_type, main_uid, assoc_uid, assoc_start_date, assoc_end_date, days_run, category, location, stp_indicator } => {
                    self.flush_pending(&mut pending, &mut current_schedule_id, update_id, now, &mut stats).await?;
                    let start = require_date(assoc_start_date)?;
                    let stp = require_stp(*stp_indicator)?;
                    let key = crate::store::AssociationKey {
                        main_uid: main_uid.clone(),
                        assoc_uid: assoc_uid.clone(),
                        assoc_start_date: start,
                        location: location.clone(),
                        stp_indicator: Some(stp),
                    };
                    if matches!(transaction_type, 'R' | 'D') {
                        let matches = self.store.find_live_associations(&key).await?;
                        if matches.len() > 1 {
                            stats.association_delete_multi += 1;
                        }
                        if matches.is_empty() {
                            if *transaction_type == 'D' {
                                stats.association_delete_miss += 1;
                            }
                        } else {
                            for id in &matches {
                                self.store.soft_delete_association(*id, now).await?;
                            }
                        }
                        if *transaction_type == 'D' {
                            continue;
                        }
                    }
                    let end = require_date(assoc_end_date)?;
                    let bits = parse_days_run(days_run)?;
                    self.store
                        .insert_association(&crate::store::NewAssociation {
                            main_uid: main_uid.clone(),
                            assoc_uid: assoc_uid.clone(),
                            assoc_start_date: start,
                            assoc_end_date: end,
                            days_run: bits,
                            category: category.clone(),
                            location: location.clone(),
                            stp_indicator: stp,
                            created: now,
                        })
                        .await?;
                    stats.associations_created += 1;
                }
            }
        }
        self.flush_pending(&mut pending, &mut current_schedule_id, update_id, now, &mut stats).await?;
        Ok(stats)
    }

    async fn flush_pending(
        &self,
        pending: &mut Option<NewSchedule>,
        current_schedule_id: &mut Option<i64>,
        _update_id: i64,
        _now: DateTime<Utc>,
        stats: &mut LoadStats,
    ) -> Result<(), ScheduleApplyError> {
        if let Some(new) = pending.take() {
            let id = self.store.insert_schedule(&new).await?;
            *current_schedule_id = Some(id);
            stats.schedules_created += 1;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cif::parse_file;
    use crate::store::memory::MemoryStore;
    use chrono::TimeZone;

    fn header(indicator: char) -> String {
        let mut line: Vec<char> = vec![' '; 80];
        for (i, c) in "HD".chars().enumerate() {
            line[i] = c;
        }
        for (at, text) in [(22, "03"), (24, "06"), (26, "23"), (28, "14"), (30, "00")] {
            for (i, c) in text.chars().enumerate() {
                line[at + i] = c;
            }
        }
        line[46] = indicator;
        line.into_iter().collect::<String>()
    }

    fn bs_card(transaction_type: char, uid: &str, stp: char) -> String {
        let mut line: Vec<char> = vec![' '; 80];
        for (at, text) in [
            (0, "BS"),
            (3, uid),
            (9, "230603"),
            (15, "231006"),
            (21, "1111100"),
        ] {
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
        line.into_iter().collect::<String>()
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
        line.into_iter().collect::<String>()
    }

    #[test]
    fn s2_basic_schedule_with_two_locations() {
        tokio_test_block_on(async {
            let store = std::sync::Arc::new(MemoryStore::new());
            let loader = CifLoader::new(store.clone());
            let text = format!(
                "{}\n{}\n{}\n{}\nZZ\n",
                header('U'),
                bs_card('N', "C12345", 'P'),
                loc_card("LO", "EUSTON ", "1000"),
                loc_card("LT", "GLGC   ", "1830"),
            );
            let file = parse_file(&text).unwrap();
            let now = Utc.with_ymd_and_hms(2023, 6, 1, 0, 0, 0).unwrap();
            let stats = loader.load(&file, false, false, now).await.unwrap();
            assert_eq!(stats.schedules_created, 1);
            assert_eq!(stats.locations_created, 2);

            let schedules = store
                .find_live_schedules_by_uid_dates(
                    "C12345",
                    chrono::NaiveDate::from_ymd_opt(2023, 6, 3).unwrap(),
                    chrono::NaiveDate::from_ymd_opt(2023, 10, 6).unwrap(),
                    None,
                )
                .await
                .unwrap();
            assert_eq!(schedules.len(), 1);
            assert_eq!(schedules[0].signalling_id, "XX12");

            let locations = store.locations_for_schedule(schedules[0].id).await.unwrap();
            assert_eq!(locations.len(), 2);
            assert_eq!(locations[0].departure.unwrap().sort_time(), 2400);
            assert_eq!(locations[1].arrival.unwrap().sort_time(), 4440);
        });
    }

    #[test]
    fn rejects_stale_extract() {
        tokio_test_block_on(async {
            let store = std::sync::Arc::new(MemoryStore::new());
            let loader = CifLoader::new(store.clone());
            let text = format!("{}\nZZ\n", header('U'));
            let file = parse_file(&text).unwrap();
            let now = Utc.with_ymd_and_hms(2023, 6, 1, 0, 0, 0).unwrap();
            loader.load(&file, false, false, now).await.unwrap();
            let err = loader.load(&file, false, false, now).await.unwrap_err();
            assert!(matches!(err, ScheduleApplyError::StaleExtract));
        });
    }

    /// Minimal single-threaded block_on so these tests don't need the
    /// `#[tokio::test]` macro's runtime bootstrap for such small futures.
    fn tokio_test_block_on<F: std::future::Future>(f: F) -> F::Output {
        let rt = tokio::runtime::Builder::new_current_thread()
            .build()
            .expect("build current-thread runtime");
        rt.block_on(f)
    }
}
