//! Full-timetable reconciler (spec §4.F). Run on demand against a fresh
//! CIF full extract: rather than reloading, it snapshots the live
//! non-VSTP schedule ids, walks the extract card-group by card-group,
//! and reports (or applies) the differences.

use std::collections::HashSet;
use std::io::Write;
use std::sync::Arc;

use chrono::{DateTime, NaiveDate, Utc};
use thiserror::Error;

use crate::cif::types::{CIFFile, CIFRecord};
use crate::store::{
    LocationRecordType, NewSchedule, NewScheduleLocation, Schedule, ScheduleLocation, SourceKind,
    StoreBackend, StoreError, StpIndicator,
};
use crate::time::CifTime;

#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("file did not start with a header card")]
    MissingHeader,
}

#[derive(Debug, Clone, Default)]
pub struct ReconcileStats {
    pub schedule_examined: u64,
    pub schedule_old: u64,
    pub schedule_missing: u64,
    pub schedule_match1: u64,
    pub schedule_matchm: u64,
    pub schedule_unmatched: u64,
    pub schedules_created: u64,
    /// Ids still set in the bitmap after the walk: live in the store,
    /// absent from the authoritative extract (spec §4.F step 7).
    pub orphaned_schedule_ids: Vec<i64>,
}

struct ParsedGroup {
    train_uid: String,
    stp_indicator: StpIndicator,
    schedule_start_date: NaiveDate,
    schedule_end_date: NaiveDate,
    days_run: u8,
    category: String,
    signalling_id: String,
    headcode: String,
    service_code: String,
    power_type: String,
    speed: String,
    train_class: char,
    atoc_code: String,
    uic_code: String,
    locations: Vec<NewScheduleLocation>,
}

pub struct Reconciler {
    store: Arc<dyn StoreBackend>,
}

impl Reconciler {
    pub fn new(store: Arc<dyn StoreBackend>) -> Self {
        Self { store }
    }

    /// Run one reconcile pass. `apply` gates whether missing schedules
    /// are actually created and orphans actually soft-deleted — without
    /// it the pass only counts and reports (spec §6 `-m`).
    /// `revise_out`, when given, receives a demote-to-revise card
    /// sequence for every `ScheduleUnmatched` group (spec §4.F step 6).
    pub async fn run(
        &self,
        file: &CIFFile,
        now: DateTime<Utc>,
        apply: bool,
        mut revise_out: Option<&mut dyn Write>,
    ) -> Result<ReconcileStats, ReconcileError> {
        let mut records = file.records().iter();
        let extract_timestamp = match records.next() {
            Some(CIFRecord::Header { date_of_extract, time_of_extract, .. }) => {
                DateTime::from_naive_utc_and_offset(date_of_extract.and_time(*time_of_extract), Utc)
            }
            _ => return Err(ReconcileError::MissingHeader),
        };

        let mut bitmap: HashSet<i64> = self.store.all_live_non_vstp_schedule_ids().await?.into_iter().collect();
        let mut stats = ReconcileStats::default();
        let mut update_id: Option<i64> = None;
        let today = now.date_naive();

        for group in group_cards(records) {
            stats.schedule_examined += 1;

            if group.schedule_end_date <= today {
                stats.schedule_old += 1;
                continue;
            }

            let matches: Vec<Schedule> = self
                .store
                .find_live_schedules_for_delete(&group.train_uid, group.schedule_start_date, group.stp_indicator)
                .await?
                .into_iter()
                .filter(|s| s.schedule_end_date > today)
                .collect();

            match matches.len() {
                0 => {
                    stats.schedule_missing += 1;
                    if apply {
                        if update_id.is_none() {
                            update_id = Some(self.store.insert_update_batch(extract_timestamp, SourceKind::Full).await?);
                        }
                        self.create_schedule(&group, update_id.unwrap(), now).await?;
                        stats.schedules_created += 1;
                    }
                }
                1 => {
                    let schedule = &matches[0];
                    bitmap.remove(&schedule.id);
                    let stored = self.store.locations_for_schedule(schedule.id).await?;
                    if locations_match(&group.locations, &stored) {
                        stats.schedule_match1 += 1;
                    } else {
                        stats.schedule_unmatched += 1;
                        if let Some(out) = revise_out.as_deref_mut() {
                            write_revise_sequence(out, &group, schedule.id);
                        }
                    }
                }
                _ => {
                    stats.schedule_matchm += 1;
                    for m in &matches {
                        bitmap.remove(&m.id);
                    }
                }
            }
        }

        stats.orphaned_schedule_ids = bitmap.into_iter().collect();
        if apply {
            for id in &stats.orphaned_schedule_ids {
                log::warn!("reconcile: schedule {id} is live in the store but absent from the full extract");
                self.store.soft_delete_schedule(*id, now).await?;
            }
        } else {
            for id in &stats.orphaned_schedule_ids {
                log::info!("reconcile: schedule {id} is live in the store but absent from the full extract");
            }
        }

        Ok(stats)
    }

    async fn create_schedule(&self, group: &ParsedGroup, update_id: i64, now: DateTime<Utc>) -> Result<(), ReconcileError> {
        let new = NewSchedule {
            train_uid: group.train_uid.clone(),
            stp_indicator: group.stp_indicator,
            schedule_start_date: group.schedule_start_date,
            schedule_end_date: group.schedule_end_date,
            days_run: group.days_run,
            atoc_code: group.atoc_code.clone(),
            uic_code: group.uic_code.clone(),
            category: group.category.clone(),
            signalling_id: group.signalling_id.clone(),
            headcode: group.headcode.clone(),
            service_code: group.service_code.clone(),
            power_type: group.power_type.clone(),
            speed: group.speed.clone(),
            train_class: group.train_class,
            update_id,
            created: now,
            deduced_headcode: String::new(),
            deduced_headcode_status: None,
        };
        let schedule_id = self.store.insert_schedule(&new).await?;
        for loc in &group.locations {
            let mut loc = loc.clone();
            loc.schedule_id = schedule_id;
            self.store.insert_location(&loc).await?;
        }
        Ok(())
    }
}

fn locations_match(parsed: &[NewScheduleLocation], stored: &[ScheduleLocation]) -> bool {
    if parsed.len() != stored.len() {
        return false;
    }
    parsed.iter().zip(stored.iter()).all(|(p, s)| {
        p.record_type == s.record_type
            && p.tiploc == s.tiploc
            && p.tiploc_instance == s.tiploc_instance
            && p.activities == s.activities
            && p.arrival == s.arrival
            && p.departure == s.departure
            && p.pass == s.pass
            && p.platform == s.platform
            && p.line == s.line
    })
}

fn write_revise_sequence(out: &mut dyn Write, group: &ParsedGroup, existing_schedule_id: i64) {
    let _ = writeln!(
        out,
        "DEMOTE-TO-REVISE schedule_id={existing_schedule_id} uid={} start={} end={} stp={:?}",
        group.train_uid, group.schedule_start_date, group.schedule_end_date, group.stp_indicator
    );
}

/// Walk the card stream, accumulating each `BS` and the `BX`/`LO`/`LI`/
/// `LT`/`CR` cards that follow it until the next `BS` (spec §4.F step 2).
/// Malformed groups (bad dates, bad days-run) are skipped with a log
/// line rather than aborting the whole pass — one bad card group must
/// never block reconciling the rest of the extract.
fn group_cards<'a>(records: impl Iterator<Item = &'a CIFRecord>) -> Vec<ParsedGroup> {
    let mut groups = Vec::new();
    let mut current: Option<ParsedGroup> = None;

    for record in records {
        match record {
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
                if let Some(g) = current.take() {
                    groups.push(g);
                }
                if *transaction_type == 'D' {
                    continue;
                }
                let (Some(start), Some(end), Some(stp)) = (
                    crate::cif::parse_cif_date(date_runs_from),
                    crate::cif::parse_cif_date(date_runs_to),
                    StpIndicator::from_char(*stp_indicator),
                ) else {
                    log::warn!("reconcile: skipping unparseable BS card for uid {train_uid}");
                    continue;
                };
                let Some(bits) = parse_days_run(days_run) else {
                    log::warn!("reconcile: skipping BS card with malformed days_run for uid {train_uid}");
                    continue;
                };
                current = Some(ParsedGroup {
                    train_uid: train_uid.clone(),
                    stp_indicator: stp,
                    schedule_start_date: start,
                    schedule_end_date: end,
                    days_run: bits,
                    category: train_category.clone(),
                    signalling_id: signalling_id.clone(),
                    headcode: headcode.clone(),
                    service_code: service_code.clone(),
                    power_type: power_type.clone(),
                    speed: speed.clone(),
                    train_class: *train_class,
                    atoc_code: String::new(),
                    uic_code: String::new(),
                    locations: Vec::new(),
                });
            }
            CIFRecord::BasicScheduleExtra { uic_code, atoc_code, .. } => {
                if let Some(g) = current.as_mut() {
                    g.uic_code = uic_code.clone();
                    g.atoc_code = atoc_code.clone();
                }
            }
            CIFRecord::LocationOrigin { tiploc, tiploc_instance, scheduled_departure, public_departure, platform, line, engineering_allowance, pathing_allowance, activity, performance_allowance } => {
                if let Some(g) = current.as_mut() {
                    g.locations.push(NewScheduleLocation {
                        schedule_id: 0,
                        record_type: LocationRecordType::Origin,
                        tiploc: tiploc.clone(),
                        tiploc_instance: *tiploc_instance,
                        activities: activity.clone(),
                        arrival: None,
                        departure: CifTime::parse(scheduled_departure).ok(),
                        pass: None,
                        public_arrival: None,
                        public_departure: Some(public_departure.clone()),
                        platform: platform.clone(),
                        line: line.clone(),
                        path: String::new(),
                        engineering_allowance: engineering_allowance.clone(),
                        pathing_allowance: pathing_allowance.clone(),
                        performance_allowance: performance_allowance.clone(),
                    });
                }
            }
            CIFRecord::LocationIntermediate { tiploc, tiploc_instance, scheduled_arrival, scheduled_departure, scheduled_pass, public_arrival, public_departure, platform, line, path, activity, engineering_allowance, pathing_allowance, performance_allowance } => {
                if let Some(g) = current.as_mut() {
                    g.locations.push(NewScheduleLocation {
                        schedule_id: 0,
                        record_type: LocationRecordType::Intermediate,
                        tiploc: tiploc.clone(),
                        tiploc_instance: *tiploc_instance,
                        activities: activity.clone(),
                        arrival: CifTime::parse(scheduled_arrival).ok(),
                        departure: CifTime::parse(scheduled_departure).ok(),
                        pass: CifTime::parse(scheduled_pass).ok(),
                        public_arrival: Some(public_arrival.clone()),
                        public_departure: Some(public_departure.clone()),
                        platform: platform.clone(),
                        line: line.clone(),
                        path: path.clone(),
                        engineering_allowance: engineering_allowance.clone(),
                        pathing_allowance: pathing_allowance.clone(),
                        performance_allowance: performance_allowance.clone(),
                    });
                }
            }
            CIFRecord::LocationTerminus { tiploc, tiploc_instance, scheduled_arrival, public_arrival, platform, path, activity } => {
                if let Some(g) = current.as_mut() {
                    g.locations.push(NewScheduleLocation {
                        schedule_id: 0,
                        record_type: LocationRecordType::Terminus,
                        tiploc: tiploc.clone(),
                        tiploc_instance: *tiploc_instance,
                        activities: activity.clone(),
                        arrival: CifTime::parse(scheduled_arrival).ok(),
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
                    });
                }
            }
            _ => {}
        }
    }
    if let Some(g) = current.take() {
        groups.push(g);
    }
    groups
}

fn parse_days_run(s: &str) -> Option<u8> {
    if s.len() != 7 || !s.bytes().all(|b| b == b'0' || b == b'1') {
        return None;
    }
    let mut bits = 0u8;
    for (i, b) in s.bytes().enumerate() {
        if b == b'1' {
            bits |= 1 << i;
        }
    }
    Some(bits)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cif::parse_file;
    use crate::store::memory::MemoryStore;
    use chrono::TimeZone;

    fn header() -> String {
        let mut line: Vec<char> = vec![' '; 80];
        for (i, c) in "HD".chars().enumerate() {
            line[i] = c;
        }
        for (at, text) in [(22, "03"), (24, "06"), (26, "23"), (28, "14"), (30, "00")] {
            for (i, c) in text.chars().enumerate() {
                line[at + i] = c;
            }
        }
        line[46] = 'F';
        line.into_iter().collect::<String>()
    }

    fn bs_card(uid: &str) -> String {
        let mut line: Vec<char> = vec![' '; 80];
        for (at, text) in [(0, "BS"), (3, uid), (9, "230603"), (15, "231006"), (21, "1111100")] {
            for (i, c) in text.chars().enumerate() {
                line[at + i] = c;
            }
        }
        line[2] = 'N';
        line[32] = 'X';
        line[33] = 'X';
        line[34] = '1';
        line[35] = '2';
        line[79] = 'P';
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

    fn rt_block_on<F: std::future::Future>(f: F) -> F::Output {
        tokio::runtime::Builder::new_current_thread().build().unwrap().block_on(f)
    }

    #[test]
    fn schedule_absent_from_store_counts_as_missing_and_can_be_created() {
        rt_block_on(async {
            let store = Arc::new(MemoryStore::new());
            let reconciler = Reconciler::new(store.clone());
            let text = format!("{}\n{}\n{}\n{}\nZZ\n", header(), bs_card("C12345"), loc_card("LO", "EUSTON ", "1000"), loc_card("LT", "GLGC   ", "1830"));
            let file = parse_file(&text).unwrap();
            let now = Utc.with_ymd_and_hms(2023, 6, 1, 0, 0, 0).unwrap();

            let stats = reconciler.run(&file, now, true, None).await.unwrap();
            assert_eq!(stats.schedule_examined, 1);
            assert_eq!(stats.schedule_missing, 1);
            assert_eq!(stats.schedules_created, 1);
        });
    }

    #[test]
    fn schedule_present_with_matching_locations_counts_as_match1_and_clears_bitmap() {
        rt_block_on(async {
            let store = Arc::new(MemoryStore::new());
            let reconciler = Reconciler::new(store.clone());
            let text = format!("{}\n{}\n{}\n{}\nZZ\n", header(), bs_card("C12345"), loc_card("LO", "EUSTON ", "1000"), loc_card("LT", "GLGC   ", "1830"));
            let file = parse_file(&text).unwrap();
            let now = Utc.with_ymd_and_hms(2023, 6, 1, 0, 0, 0).unwrap();

            reconciler.run(&file, now, true, None).await.unwrap();
            let second_pass = reconciler.run(&file, now, true, None).await.unwrap();
            assert_eq!(second_pass.schedule_match1, 1);
            assert_eq!(second_pass.schedule_missing, 0);
            assert!(second_pass.orphaned_schedule_ids.is_empty());
        });
    }
}
