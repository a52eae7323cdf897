//! TRUST movement-message ingester (spec §4.E): activation matching with
//! a bounded deferred-retry queue, headcode obfuscation reverse-lookup,
//! deduced headcode/TSC/activation, and the counters the daily report
//! rolls up.

use std::collections::VecDeque;
use std::sync::Arc;

use chrono::{DateTime, Datelike, Duration, NaiveDate, Timelike, Utc};
use chrono_tz::Tz;
use thiserror::Error;

use crate::store::{
    MovementFlags, MovementSource, NewActivation, NewCancellation, NewChangeOfId,
    NewChangeOfLocation, NewChangeOfOrigin, NewMovement, Schedule, StoreBackend, StoreError,
    StpIndicator, VariationBucket,
};
use crate::time::correct_trust_timestamp;

use super::messages::{parse_frame, TrustEventType, TrustMessage, TrustMessageError, VariationStatus};
use super::stats::DailyStatsReport;

#[derive(Debug, Error)]
pub enum TrustError {
    #[error(transparent)]
    Message(#[from] TrustMessageError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

const DEFERRED_QUEUE_CAP: usize = 16;
const DEFERRED_TTL: Duration = Duration::seconds(32);
const OBFUS_LOOKUP_TTL: Duration = Duration::hours(24);
const ACTIVATION_LOOKBACK: Duration = Duration::days(4);
const DEDUCED_ACT_WINDOW_MINUTES: i64 = 8;

struct DeferredActivation {
    train_id: String,
    train_uid: String,
    start: NaiveDate,
    end: NaiveDate,
    due: DateTime<Utc>,
    retried: bool,
}

pub struct TrustIngester {
    store: Arc<dyn StoreBackend>,
    local_tz: Tz,
    no_deduce_act: bool,
    deferred: VecDeque<DeferredActivation>,
    pub stats: DailyStatsReport,
}

impl TrustIngester {
    pub fn new(store: Arc<dyn StoreBackend>, local_tz: Tz, no_deduce_act: bool) -> Self {
        Self {
            store,
            local_tz,
            no_deduce_act,
            deferred: VecDeque::new(),
            stats: DailyStatsReport::new(4, 2),
        }
    }

    /// Parse and apply one broker frame. The deferred-activation queue
    /// is drained first, matching the main-loop order of spec §4.E.
    /// Everything the frame touches runs inside a single store
    /// transaction; any store error rolls it back, leaving no partial
    /// writes from the frame behind.
    pub async fn ingest_frame(&mut self, json: &str, now: DateTime<Utc>) -> Result<(), TrustError> {
        let messages = match parse_frame(json) {
            Ok(m) => m,
            Err(e) => {
                self.stats.today.not_recognised += 1;
                return Err(e.into());
            }
        };

        self.store.begin().await?;
        let result = self.process_frame(messages, now).await;
        match result {
            Ok(()) => {
                self.store.commit().await?;
                Ok(())
            }
            Err(e) => {
                let _ = self.store.rollback().await;
                Err(e)
            }
        }
    }

    async fn process_frame(&mut self, messages: Vec<TrustMessage>, now: DateTime<Utc>) -> Result<(), TrustError> {
        self.drain_deferred(now).await?;
        for msg in messages {
            self.apply(msg, now).await?;
            self.stats.today.good_message += 1;
        }
        Ok(())
    }

    async fn drain_deferred(&mut self, now: DateTime<Utc>) -> Result<(), TrustError> {
        let mut remaining = VecDeque::new();
        while let Some(entry) = self.deferred.pop_front() {
            if entry.due > now {
                remaining.push_back(entry);
                continue;
            }
            let matches = self
                .store
                .find_live_schedules_by_uid_dates(&entry.train_uid, entry.start, entry.end, None)
                .await?;
            if let Some(winner) = pick_by_stp_precedence(matches) {
                self.stats.today.mess1_miss_hit += 1;
                self.bind_activation(&entry.train_id, &entry.train_uid, entry.start, entry.end, &winner, now, false)
                    .await?;
            } else if entry.retried {
                self.store
                    .insert_activation(&NewActivation {
                        train_id: entry.train_id.clone(),
                        schedule_id: 0,
                        train_uid: entry.train_uid.clone(),
                        schedule_start_date: entry.start,
                        schedule_end_date: entry.end,
                        created: now,
                        deduced: false,
                        origin_stanox: None,
                        tsc: None,
                        wtt_id: None,
                    })
                    .await?;
            } else {
                remaining.push_back(DeferredActivation { retried: true, due: now + DEFERRED_TTL, ..entry });
            }
        }
        self.deferred = remaining;
        Ok(())
    }

    async fn apply(&mut self, msg: TrustMessage, now: DateTime<Utc>) -> Result<(), TrustError> {
        match msg {
            TrustMessage::Activation { train_id, train_uid, schedule_start_date, schedule_end_date, tsc, .. } => {
                self.stats.today.activations += 1;
                let matches = self
                    .store
                    .find_live_schedules_by_uid_dates(&train_uid, schedule_start_date, schedule_end_date, None)
                    .await?;
                match pick_by_stp_precedence(matches) {
                    Some(winner) => {
                        let cancelled = winner.stp_indicator == StpIndicator::Cancellation;
                        if cancelled {
                            self.stats.today.mess1_cape += 1;
                        }
                        self.bind_activation(&train_id, &train_uid, schedule_start_date, schedule_end_date, &winner, now, cancelled)
                            .await?;
                        if !cancelled {
                            if let Some(tsc) = tsc {
                                self.deduce_tsc(&winner, &tsc).await?;
                            }
                        }
                    }
                    None => {
                        if self.deferred.len() >= DEFERRED_QUEUE_CAP {
                            self.stats.today.deferred_overflow += 1;
                            log::warn!("deferred-activation queue overflow, dropping {train_id}");
                        } else {
                            self.deferred.push_back(DeferredActivation {
                                train_id,
                                train_uid,
                                start: schedule_start_date,
                                end: schedule_end_date,
                                due: now + DEFERRED_TTL,
                                retried: false,
                            });
                        }
                    }
                }
            }
            TrustMessage::Cancellation { train_id, timestamp, reason_code, cancelled_stanox, reinstate, .. } => {
                if reinstate {
                    self.stats.today.reinstates += 1;
                } else {
                    self.stats.today.cancellations += 1;
                }
                let timestamp = correct_trust_timestamp(timestamp, self.local_tz);
                self.store
                    .insert_cancellation(&NewCancellation { train_id, timestamp, reason_code, cancelled_stanox, reinstate })
                    .await?;
            }
            TrustMessage::Movement {
                train_id,
                event_type,
                planned_timestamp,
                actual_timestamp,
                loc_stanox,
                platform,
                variation_minutes,
                variation_status,
                manual,
                off_route,
                terminated,
                correction,
                next_report_stanox,
                next_report_run_time,
                ..
            } => {
                self.stats.today.movements += 1;
                let planned_timestamp = correct_trust_timestamp(planned_timestamp, self.local_tz);
                let actual_timestamp = correct_trust_timestamp(actual_timestamp, self.local_tz);
                let flags = MovementFlags {
                    event_kind: match event_type {
                        TrustEventType::Departure => crate::store::EventKind::Departure,
                        TrustEventType::Arrival if terminated => crate::store::EventKind::ArrivalAtDestination,
                        TrustEventType::Arrival => crate::store::EventKind::Arrival,
                    },
                    source: if manual { MovementSource::Manual } else { MovementSource::Auto },
                    variation_bucket: match variation_status {
                        VariationStatus::Early => VariationBucket::Early,
                        VariationStatus::OnTime => VariationBucket::OnTime,
                        VariationStatus::Late => VariationBucket::Late,
                        VariationStatus::OffRoute => VariationBucket::OffRoute,
                    },
                    off_route,
                    terminated,
                    correction,
                };
                self.store
                    .insert_movement(&NewMovement {
                        train_id: train_id.clone(),
                        flags,
                        planned_timestamp,
                        actual_timestamp,
                        variation_minutes,
                        platform,
                        stanox: loc_stanox,
                        next_report_stanox,
                        next_report_run_time,
                    })
                    .await?;

                let has_live_activation = self
                    .store
                    .live_activation_for_train(&train_id, now - ACTIVATION_LOOKBACK)
                    .await?
                    .is_some();
                if !has_live_activation && !self.no_deduce_act {
                    self.try_deduced_activation(&train_id, loc_stanox, planned_timestamp, now).await?;
                } else if !has_live_activation {
                    self.stats.today.movt_no_act += 1;
                }
            }
            TrustMessage::ChangeOfOrigin { train_id, timestamp, new_origin_stanox, new_departure_time, reason_code, .. } => {
                self.stats.today.changes_of_origin += 1;
                let timestamp = correct_trust_timestamp(timestamp, self.local_tz);
                self.store
                    .insert_change_of_origin(&NewChangeOfOrigin { train_id, timestamp, new_origin_stanox, new_departure_time, reason_code })
                    .await?;
            }
            TrustMessage::ChangeOfId { old_train_id, new_train_id, timestamp, .. } => {
                self.stats.today.changes_of_id += 1;
                let timestamp = correct_trust_timestamp(timestamp, self.local_tz);
                if let Some(activation) = self.store.live_activation_for_train(&old_train_id, now - ACTIVATION_LOOKBACK).await? {
                    if let Some(schedule) = self.store.get_schedule(activation.schedule_id).await? {
                        self.reverse_lookup_obfuscation(&new_train_id, &schedule, now).await?;
                    }
                }
                self.store
                    .insert_change_of_id(&NewChangeOfId { old_train_id, new_train_id, timestamp })
                    .await?;
            }
            TrustMessage::ChangeOfLocation { train_id, timestamp, new_location_stanox, .. } => {
                self.stats.today.changes_of_location += 1;
                let timestamp = correct_trust_timestamp(timestamp, self.local_tz);
                self.store
                    .insert_change_of_location(&NewChangeOfLocation { train_id, timestamp, new_location_stanox })
                    .await?;
            }
        }
        Ok(())
    }

    async fn bind_activation(
        &mut self,
        train_id: &str,
        train_uid: &str,
        start: NaiveDate,
        end: NaiveDate,
        schedule: &Schedule,
        now: DateTime<Utc>,
        cancelled: bool,
    ) -> Result<(), TrustError> {
        self.store
            .insert_activation(&NewActivation {
                train_id: train_id.to_string(),
                schedule_id: schedule.id,
                train_uid: train_uid.to_string(),
                schedule_start_date: start,
                schedule_end_date: end,
                created: now,
                deduced: false,
                origin_stanox: None,
                tsc: None,
                wtt_id: None,
            })
            .await?;
        if !cancelled {
            self.reverse_lookup_obfuscation(train_id, schedule, now).await?;
            self.deduce_headcode(schedule, train_id).await?;
        }
        Ok(())
    }

    /// Deduced-activation path for a 0003 movement with no live
    /// activation (spec §4.E). Refusal reasons are logged, never fatal.
    async fn try_deduced_activation(
        &mut self,
        train_id: &str,
        stanox: u32,
        planned_timestamp: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<(), TrustError> {
        let tiploc = match self.store.tiploc_by_stanox(stanox).await? {
            Some(t) => t.tiploc,
            None => {
                self.stats.today.movt_no_act += 1;
                log::debug!("deduced activation refused: no TIPLOC for STANOX {stanox}");
                return Ok(());
            }
        };
        let candidates = self.store.schedules_with_location(&tiploc).await?;
        let planned_minutes = planned_timestamp.naive_utc().time().num_seconds_from_midnight() / 60;
        let weekday_bit = 1u8 << planned_timestamp.naive_utc().date().weekday().num_days_from_monday();

        let mut matching: Vec<Schedule> = candidates
            .into_iter()
            .filter(|(s, _)| s.is_live(now) && !s.is_vstp() && !is_bus(s))
            .filter(|(s, _)| s.runs_on(weekday_bit))
            .filter(|(_, loc)| {
                let loc_minutes = loc
                    .arrival
                    .or(loc.departure)
                    .or(loc.pass)
                    .map(|t| (t.sort_time() / 4) as i64)
                    .unwrap_or(-9999);
                minutes_within(planned_minutes as i64, loc_minutes, DEDUCED_ACT_WINDOW_MINUTES)
            })
            .map(|(s, _)| s)
            .collect();

        let winner = if matching.len() == 1 {
            matching.pop()
        } else if matching.len() > 1 {
            let uids: std::collections::HashSet<_> = matching.iter().map(|s| s.train_uid.clone()).collect();
            let overlays = matching.iter().filter(|s| s.stp_indicator == StpIndicator::Overlay).count();
            if uids.len() == 1 && overlays <= 1 {
                pick_by_stp_precedence(matching.clone())
            } else {
                let headcode = train_id.chars().take(4).collect::<String>();
                let narrowed: Vec<Schedule> =
                    matching.into_iter().filter(|s| s.signalling_id == headcode).collect();
                if narrowed.len() == 1 {
                    narrowed.into_iter().next()
                } else {
                    None
                }
            }
        } else {
            None
        };

        match winner {
            Some(schedule) => {
                self.stats.today.deduced_act += 1;
                self.store
                    .insert_activation(&NewActivation {
                        train_id: train_id.to_string(),
                        schedule_id: schedule.id,
                        train_uid: schedule.train_uid.clone(),
                        schedule_start_date: schedule.schedule_start_date,
                        schedule_end_date: schedule.schedule_end_date,
                        created: now,
                        deduced: true,
                        origin_stanox: Some(stanox),
                        tsc: None,
                        wtt_id: None,
                    })
                    .await?;
                self.reverse_lookup_obfuscation(train_id, &schedule, now).await?;
                self.deduce_headcode(&schedule, train_id).await?;
            }
            None => {
                self.stats.today.movt_no_act += 1;
                log::debug!("deduced activation refused for {train_id}: no unambiguous candidate");
            }
        }
        Ok(())
    }

    /// Headcode obfuscation reverse-lookup (spec §4.E). Only inserted
    /// when the true and obfuscated headcodes share a class letter —
    /// the invariant a port must never violate (spec §8 testable
    /// property 5).
    async fn reverse_lookup_obfuscation(&self, train_id: &str, schedule: &Schedule, now: DateTime<Utc>) -> Result<(), TrustError> {
        let Some(obfus_hc) = extract_obfuscated_headcode(train_id) else {
            return Ok(());
        };
        let true_hc = if !schedule.signalling_id.trim().is_empty() {
            Some(schedule.signalling_id.clone())
        } else if schedule.deduced_headcode_status == Some('A') && !schedule.deduced_headcode.is_empty() {
            Some(schedule.deduced_headcode.clone())
        } else {
            None
        };
        if let Some(true_hc) = true_hc {
            if true_hc.chars().next() == obfus_hc.chars().next() {
                self.store.insert_obfus_lookup(&true_hc, &obfus_hc, now).await?;
                self.store.prune_obfus_lookup(now - OBFUS_LOOKUP_TTL).await?;
            }
        }
        Ok(())
    }

    /// Deduced-headcode on activation (spec §4.E): borrow the 4-char
    /// headcode out of the activation's own train-id when the schedule
    /// has none of its own.
    async fn deduce_headcode(&mut self, schedule: &Schedule, train_id: &str) -> Result<(), TrustError> {
        if !schedule.signalling_id.trim().is_empty() {
            return Ok(());
        }
        let candidate: String = train_id.chars().take(4).collect();
        if candidate.len() < 4 {
            return Ok(());
        }
        match schedule.deduced_headcode_status {
            Some('A') if schedule.deduced_headcode == candidate => {}
            Some('A') => {
                self.store.set_schedule_headcode(schedule.id, &candidate, 'A').await?;
                self.stats.today.deduced_hc_replaced += 1;
            }
            _ => {
                self.store.set_schedule_headcode(schedule.id, &candidate, 'A').await?;
                self.stats.today.deduced_hc += 1;
            }
        }
        Ok(())
    }

    async fn deduce_tsc(&mut self, schedule: &Schedule, tsc: &str) -> Result<(), TrustError> {
        if schedule.service_code.trim().is_empty() && !tsc.trim().is_empty() {
            self.store.set_schedule_tsc(schedule.id, tsc).await?;
            self.stats.today.deduced_tsc += 1;
        }
        Ok(())
    }
}

fn pick_by_stp_precedence(candidates: Vec<Schedule>) -> Option<Schedule> {
    crate::store::resolve_stp_precedence(candidates)
}

fn minutes_within(a: i64, b: i64, window: i64) -> bool {
    let diff = (a - b).abs();
    diff <= window || (1440 - diff).abs() <= window
}

fn is_bus(schedule: &Schedule) -> bool {
    schedule.category.trim().eq_ignore_ascii_case("BUS") || schedule.category.trim() == "BR"
}

/// TRUST train-ids of the form `cc9xx...` (class code, `9`, then a
/// 4-char obfuscated headcode in place of a genuine one) carry the
/// obfuscated form at offset 3. Genuine headcodes at that position
/// don't have a literal `9` marker, so absence of the marker means
/// "not obfuscated".
fn extract_obfuscated_headcode(train_id: &str) -> Option<String> {
    let chars: Vec<char> = train_id.chars().collect();
    if chars.len() < 7 || chars[2] != '9' {
        return None;
    }
    let candidate: String = chars[3..7].iter().collect();
    if candidate.chars().any(|c| c.is_ascii_alphanumeric()) && !candidate.chars().all(|c| c.is_ascii_digit()) {
        Some(candidate)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::MemoryStore;
    use crate::store::{LocationRecordType, NewSchedule, NewScheduleLocation, Tiploc};
    use chrono::{NaiveDate, TimeZone};

    fn rt_block_on<F: std::future::Future>(f: F) -> F::Output {
        tokio::runtime::Builder::new_current_thread().build().unwrap().block_on(f)
    }

    fn sample_schedule(train_uid: &str, signalling_id: &str) -> NewSchedule {
        NewSchedule {
            train_uid: train_uid.to_string(),
            stp_indicator: StpIndicator::Permanent,
            schedule_start_date: NaiveDate::from_ymd_opt(2023, 1, 1).unwrap(),
            schedule_end_date: NaiveDate::from_ymd_opt(2023, 12, 31).unwrap(),
            days_run: 0b1111111,
            atoc_code: String::new(),
            uic_code: String::new(),
            category: String::new(),
            signalling_id: signalling_id.to_string(),
            headcode: String::new(),
            service_code: String::new(),
            power_type: String::new(),
            speed: String::new(),
            train_class: ' ',
            update_id: 1,
            created: Utc.with_ymd_and_hms(2023, 1, 1, 0, 0, 0).unwrap(),
            deduced_headcode: String::new(),
            deduced_headcode_status: None,
        }
    }

    fn activation_json(train_id: &str, train_uid: &str) -> String {
        format!(
            r#"{{"msg_type":"0001","train_id":"{train_id}","train_uid":"{train_uid}","schedule_start_date":"2023-01-01","schedule_end_date":"2023-12-31","msg_queue_timestamp":"2023-01-03T09:00:00Z"}}"#
        )
    }

    fn cancellation_json(train_id: &str, at: DateTime<Utc>) -> String {
        let at = at.to_rfc3339();
        format!(r#"{{"msg_type":"0002","train_id":"{train_id}","canx_timestamp":"{at}","msg_queue_timestamp":"{at}"}}"#)
    }

    #[test]
    fn activation_binds_to_live_schedule_and_deduces_headcode() {
        rt_block_on(async {
            let store = Arc::new(MemoryStore::new());
            let schedule_id = store.insert_schedule(&sample_schedule("C12345", "")).await.unwrap();
            let mut ingester = TrustIngester::new(store.clone(), chrono_tz::Europe::London, false);
            let now = Utc.with_ymd_and_hms(2023, 1, 3, 9, 0, 0).unwrap();

            ingester.ingest_frame(&activation_json("1A23", "C12345"), now).await.unwrap();

            assert_eq!(ingester.stats.today.activations, 1);
            assert_eq!(ingester.stats.today.good_message, 1);
            let activation = store
                .live_activation_for_train("1A23", now - Duration::hours(1))
                .await
                .unwrap()
                .unwrap();
            assert_eq!(activation.schedule_id, schedule_id);
            let schedule = store.get_schedule(schedule_id).await.unwrap().unwrap();
            assert_eq!(schedule.deduced_headcode, "1A23");
            assert_eq!(schedule.deduced_headcode_status, Some('A'));
        });
    }

    #[test]
    fn activation_with_no_match_is_deferred_then_resolved_when_schedule_appears() {
        rt_block_on(async {
            let store = Arc::new(MemoryStore::new());
            let mut ingester = TrustIngester::new(store.clone(), chrono_tz::Europe::London, false);
            let t0 = Utc.with_ymd_and_hms(2023, 1, 3, 9, 0, 0).unwrap();

            ingester.ingest_frame(&activation_json("1A23", "Z99999"), t0).await.unwrap();
            assert_eq!(ingester.stats.today.mess1_miss_hit, 0);

            let schedule_id = store.insert_schedule(&sample_schedule("Z99999", "")).await.unwrap();

            let t1 = t0 + Duration::seconds(33);
            ingester.ingest_frame(&cancellation_json("9Z99", t1), t1).await.unwrap();

            assert_eq!(ingester.stats.today.mess1_miss_hit, 1);
            let activation = store.live_activation_for_train("1A23", t0).await.unwrap().unwrap();
            assert_eq!(activation.schedule_id, schedule_id);
        });
    }

    #[test]
    fn activation_with_no_match_drops_after_one_retry() {
        rt_block_on(async {
            let store = Arc::new(MemoryStore::new());
            let mut ingester = TrustIngester::new(store.clone(), chrono_tz::Europe::London, false);
            let t0 = Utc.with_ymd_and_hms(2023, 1, 3, 9, 0, 0).unwrap();

            ingester.ingest_frame(&activation_json("1A23", "Q99999"), t0).await.unwrap();
            let t1 = t0 + Duration::seconds(33);
            ingester.ingest_frame(&cancellation_json("9Z99", t1), t1).await.unwrap();
            let t2 = t1 + Duration::seconds(33);
            ingester.ingest_frame(&cancellation_json("9Z98", t2), t2).await.unwrap();

            // The schedule only turns up after the deferred entry has
            // already been dropped, so it must never retroactively bind.
            store.insert_schedule(&sample_schedule("Q99999", "")).await.unwrap();
            let t3 = t2 + Duration::seconds(1);
            ingester.ingest_frame(&cancellation_json("9Z97", t3), t3).await.unwrap();

            assert_eq!(ingester.stats.today.mess1_miss_hit, 0);
            assert!(store.live_activation_for_train("1A23", t0).await.unwrap().is_none());
        });
    }

    #[test]
    fn deferred_queue_overflow_is_counted() {
        rt_block_on(async {
            let store = Arc::new(MemoryStore::new());
            let mut ingester = TrustIngester::new(store.clone(), chrono_tz::Europe::London, false);
            let now = Utc.with_ymd_and_hms(2023, 1, 3, 9, 0, 0).unwrap();
            for i in 0..DEFERRED_QUEUE_CAP + 2 {
                let uid = format!("U{i:05}");
                ingester.ingest_frame(&activation_json("1A23", &uid), now).await.unwrap();
            }
            assert_eq!(ingester.stats.today.deferred_overflow, 2);
        });
    }

    #[test]
    fn movement_with_no_activation_binds_via_deduced_activation() {
        rt_block_on(async {
            let store = Arc::new(MemoryStore::new());
            let schedule_id = store.insert_schedule(&sample_schedule("C12345", "")).await.unwrap();
            store
                .upsert_tiploc(&Tiploc {
                    tiploc: "EUSTON".to_string(),
                    nalco: 0,
                    tps_description: String::new(),
                    stanox: 87701,
                    three_alpha: String::new(),
                })
                .await
                .unwrap();
            store
                .insert_location(&NewScheduleLocation {
                    schedule_id,
                    record_type: LocationRecordType::Origin,
                    tiploc: "EUSTON".to_string(),
                    tiploc_instance: ' ',
                    activities: String::new(),
                    arrival: None,
                    departure: Some(crate::time::CifTime::parse("1000").unwrap()),
                    pass: None,
                    public_arrival: None,
                    public_departure: None,
                    platform: String::new(),
                    line: String::new(),
                    path: String::new(),
                    engineering_allowance: String::new(),
                    pathing_allowance: String::new(),
                    performance_allowance: String::new(),
                })
                .await
                .unwrap();

            let mut ingester = TrustIngester::new(store.clone(), chrono_tz::Europe::London, false);
            let now = Utc.with_ymd_and_hms(2023, 1, 3, 10, 5, 0).unwrap();
            let json = r#"{"msg_type":"0003","train_id":"1A23","event_type":"DEPARTURE","planned_timestamp":"2023-01-03T10:03:00Z","actual_timestamp":"2023-01-03T10:03:00Z","loc_stanox":87701,"msg_queue_timestamp":"2023-01-03T10:04:00Z"}"#;

            ingester.ingest_frame(json, now).await.unwrap();

            assert_eq!(ingester.stats.today.deduced_act, 1);
            assert_eq!(ingester.stats.today.movt_no_act, 0);
            let activation = store
                .live_activation_for_train("1A23", now - Duration::hours(1))
                .await
                .unwrap()
                .unwrap();
            assert_eq!(activation.schedule_id, schedule_id);
            assert!(activation.deduced);
        });
    }

    #[test]
    fn movement_with_existing_activation_does_not_deduce_again() {
        rt_block_on(async {
            let store = Arc::new(MemoryStore::new());
            let schedule_id = store.insert_schedule(&sample_schedule("C12345", "")).await.unwrap();
            let now = Utc.with_ymd_and_hms(2023, 1, 3, 10, 5, 0).unwrap();
            store
                .insert_activation(&NewActivation {
                    train_id: "1A23".to_string(),
                    schedule_id,
                    train_uid: "C12345".to_string(),
                    schedule_start_date: NaiveDate::from_ymd_opt(2023, 1, 1).unwrap(),
                    schedule_end_date: NaiveDate::from_ymd_opt(2023, 12, 31).unwrap(),
                    created: now - Duration::minutes(5),
                    deduced: false,
                    origin_stanox: None,
                    tsc: None,
                    wtt_id: None,
                })
                .await
                .unwrap();

            let mut ingester = TrustIngester::new(store.clone(), chrono_tz::Europe::London, false);
            let json = r#"{"msg_type":"0003","train_id":"1A23","event_type":"DEPARTURE","planned_timestamp":"2023-01-03T10:03:00Z","actual_timestamp":"2023-01-03T10:03:00Z","loc_stanox":87701,"msg_queue_timestamp":"2023-01-03T10:04:00Z"}"#;
            ingester.ingest_frame(json, now).await.unwrap();

            assert_eq!(ingester.stats.today.deduced_act, 0);
            assert_eq!(ingester.stats.today.movt_no_act, 0);
        });
    }

    #[test]
    fn extract_obfuscated_headcode_requires_marker_and_non_numeric_content() {
        assert_eq!(extract_obfuscated_headcode("1A9B234"), Some("B234".to_string()));
        assert_eq!(extract_obfuscated_headcode("1A1234"), None);
        assert_eq!(extract_obfuscated_headcode("1A91234"), None);
        assert_eq!(extract_obfuscated_headcode("1A9"), None);
    }
}
