//! VSTP (Very Short Term Plan) JSON ingester (spec §4.D). Each frame off
//! the VSTP STOMP port carries one `VSTPCIFMsgV1` envelope; `update_id`
//! is always zero on the rows it writes, marking them as VSTP-origin
//! (`Schedule::is_vstp`).

use std::sync::Arc;

use chrono::{DateTime, Duration, NaiveDate, Utc};
use serde::Deserialize;
use thiserror::Error;

use crate::cif::parse_cif_date;
use crate::store::{
    LocationRecordType, NewScheduleLocation, NewSchedule, StoreBackend, StoreError, StpIndicator,
};
use crate::time::CifTime;

#[derive(Debug, Error)]
pub enum VstpError {
    #[error("malformed VSTP frame: {0}")]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("invalid date {0:?} in VSTP schedule")]
    BadDate(String),
    #[error("invalid STP indicator {0:?} in VSTP schedule")]
    BadStp(String),
}

#[derive(Debug, Deserialize)]
struct VstpFrame {
    #[serde(rename = "VSTPCIFMsgV1")]
    msg: VstpCifMsgV1,
}

#[derive(Debug, Deserialize)]
struct VstpCifMsgV1 {
    transaction_type: VstpTransactionType,
    schedule: VstpSchedule,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
enum VstpTransactionType {
    Create,
    Update,
    Delete,
}

#[derive(Debug, Deserialize)]
struct VstpSchedule {
    train_uid: String,
    stp_indicator: String,
    schedule_start_date: String,
    schedule_end_date: String,
    #[serde(default)]
    days_run: String,
    #[serde(default)]
    category: String,
    #[serde(default)]
    signalling_id: String,
    #[serde(default)]
    service_code: String,
    #[serde(default)]
    power_type: String,
    #[serde(default)]
    speed: String,
    #[serde(default = "default_train_class")]
    train_class: String,
    #[serde(default)]
    locations: Vec<VstpLocation>,
}

fn default_train_class() -> String {
    " ".to_string()
}

#[derive(Debug, Deserialize)]
struct VstpLocation {
    record_type: VstpLocationKind,
    tiploc: String,
    #[serde(default)]
    tiploc_instance: String,
    #[serde(default)]
    arrival: Option<String>,
    #[serde(default)]
    departure: Option<String>,
    #[serde(default)]
    pass: Option<String>,
    #[serde(default)]
    platform: String,
    #[serde(default)]
    line: String,
    #[serde(default)]
    activity: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
enum VstpLocationKind {
    Lo,
    Li,
    Lt,
}

/// Per-frame outcome counters (spec §4.D).
#[derive(Debug, Clone, Default)]
pub struct VstpStats {
    pub delete_hit: u64,
    pub delete_miss: u64,
    pub delete_multi: u64,
    pub update_delete_miss: u64,
    pub update_delete_multi: u64,
    pub created: u64,
    pub locations_created: u64,
}

fn vstp_date(s: &str) -> Result<NaiveDate, VstpError> {
    // VSTP carries ISO dates; CIF's yymmdd parser also accepts the
    // 6-digit form some gateways still emit, so try both.
    NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .ok()
        .or_else(|| parse_cif_date(s))
        .ok_or_else(|| VstpError::BadDate(s.to_string()))
}

fn vstp_time(raw: &str) -> Option<CifTime> {
    // VSTP uses a trailing `3` in place of CIF's `H` for the half-minute
    // suffix; CifTime::parse already treats the two as equivalent.
    CifTime::parse(raw).ok()
}

pub struct VstpIngester {
    store: Arc<dyn StoreBackend>,
}

impl VstpIngester {
    pub fn new(store: Arc<dyn StoreBackend>) -> Self {
        Self { store }
    }

    /// Parse and apply one VSTP frame inside a single store transaction;
    /// any store error rolls it back, leaving no partial writes behind.
    pub async fn ingest_frame(&self, json: &str, now: DateTime<Utc>) -> Result<VstpStats, VstpError> {
        let frame: VstpFrame = serde_json::from_str(json)?;

        self.store.begin().await?;
        let mut stats = VstpStats::default();
        let result = self.apply(frame.msg, now, &mut stats).await;
        match result {
            Ok(()) => {
                self.store.commit().await?;
                Ok(stats)
            }
            Err(e) => {
                let _ = self.store.rollback().await;
                Err(e)
            }
        }
    }

    async fn apply(
        &self,
        msg: VstpCifMsgV1,
        now: DateTime<Utc>,
        stats: &mut VstpStats,
    ) -> Result<(), VstpError> {
        let sched = &msg.schedule;
        let train_uid = sched.train_uid.clone();
        let start = vstp_date(&sched.schedule_start_date)?;
        let end = vstp_date(&sched.schedule_end_date)?;
        let stp = StpIndicator::from_char(sched.stp_indicator.chars().next().unwrap_or(' '))
            .ok_or_else(|| VstpError::BadStp(sched.stp_indicator.clone()))?;

        match msg.transaction_type {
            VstpTransactionType::Delete => {
                let matches = self.find_by_key(&train_uid, start, end, stp).await?;
                self.soft_delete_all(&matches, now, stats).await?;
            }
            VstpTransactionType::Update => {
                let matches = self.find_by_key(&train_uid, start, end, stp).await?;
                if matches.len() > 1 {
                    stats.update_delete_multi += 1;
                } else if matches.is_empty() {
                    stats.update_delete_miss += 1;
                }
                self.soft_delete_all(&matches, now, stats).await?;
                self.create(sched, stp, start, end, now, stats).await?;
            }
            VstpTransactionType::Create => {
                self.create(sched, stp, start, end, now, stats).await?;
            }
        }
        Ok(())
    }

    /// Live VSTP schedules matching the full Delete/Update key — `train_uid`,
    /// dates, and `stp_indicator` (spec §4.D) — `find_live_schedules_by_uid_dates`
    /// doesn't take an STP filter, so narrow its result here.
    async fn find_by_key(
        &self,
        train_uid: &str,
        start: NaiveDate,
        end: NaiveDate,
        stp: StpIndicator,
    ) -> Result<Vec<crate::store::Schedule>, VstpError> {
        let matches = self
            .store
            .find_live_schedules_by_uid_dates(train_uid, start, end, Some(true))
            .await?;
        Ok(matches.into_iter().filter(|s| s.stp_indicator == stp).collect())
    }

    async fn soft_delete_all(
        &self,
        matches: &[crate::store::Schedule],
        now: DateTime<Utc>,
        stats: &mut VstpStats,
    ) -> Result<(), VstpError> {
        match matches.len() {
            0 => stats.delete_miss += 1,
            1 => stats.delete_hit += 1,
            _ => stats.delete_multi += 1,
        }
        for m in matches {
            self.store.soft_delete_schedule(m.id, now).await?;
        }
        Ok(())
    }

    async fn create(
        &self,
        sched: &VstpSchedule,
        stp: StpIndicator,
        start: NaiveDate,
        end: NaiveDate,
        now: DateTime<Utc>,
        stats: &mut VstpStats,
    ) -> Result<(), VstpError> {
        let days_run = parse_days_run(&sched.days_run);
        let mut new = NewSchedule {
            train_uid: sched.train_uid.clone(),
            stp_indicator: stp,
            schedule_start_date: start,
            schedule_end_date: end,
            days_run,
            atoc_code: String::new(),
            uic_code: String::new(),
            category: sched.category.clone(),
            signalling_id: sched.signalling_id.clone(),
            headcode: String::new(),
            service_code: sched.service_code.clone(),
            power_type: sched.power_type.clone(),
            speed: sched.speed.clone(),
            train_class: sched.train_class.chars().next().unwrap_or(' '),
            update_id: 0,
            created: now,
            deduced_headcode: String::new(),
            deduced_headcode_status: None,
        };

        // Overlay headcode deduction (spec §4.D): an STP O create with
        // no signalling id inherits the most recent deduced headcode
        // for the same UID, if one was recorded in the last 64 days.
        if stp == StpIndicator::Overlay && new.signalling_id.trim().is_empty() {
            if let Some(prev) = self.store.most_recent_schedule_for_uid(&sched.train_uid, now).await? {
                if !prev.deduced_headcode.is_empty() && now - prev.created <= Duration::days(64) {
                    new.deduced_headcode = prev.deduced_headcode;
                    new.deduced_headcode_status = Some('D');
                }
            }
        }

        let schedule_id = self.store.insert_schedule(&new).await?;
        stats.created += 1;

        for loc in &sched.locations {
            let record_type = match loc.record_type {
                VstpLocationKind::Lo => LocationRecordType::Origin,
                VstpLocationKind::Li => LocationRecordType::Intermediate,
                VstpLocationKind::Lt => LocationRecordType::Terminus,
            };
            self.store
                .insert_location(&NewScheduleLocation {
                    schedule_id,
                    record_type,
                    tiploc: loc.tiploc.clone(),
                    tiploc_instance: loc.tiploc_instance.chars().next().unwrap_or(' '),
                    activities: loc.activity.clone(),
                    arrival: loc.arrival.as_deref().and_then(vstp_time),
                    departure: loc.departure.as_deref().and_then(vstp_time),
                    pass: loc.pass.as_deref().and_then(vstp_time),
                    public_arrival: None,
                    public_departure: None,
                    platform: loc.platform.clone(),
                    line: loc.line.clone(),
                    path: String::new(),
                    engineering_allowance: String::new(),
                    pathing_allowance: String::new(),
                    performance_allowance: String::new(),
                })
                .await?;
            stats.locations_created += 1;
        }
        Ok(())
    }
}

fn parse_days_run(s: &str) -> u8 {
    let mut bits = 0u8;
    for (i, b) in s.bytes().enumerate().take(7) {
        if b == b'1' {
            bits |= 1 << i;
        }
    }
    bits
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::MemoryStore;
    use chrono::TimeZone;

    fn block_on<F: std::future::Future>(f: F) -> F::Output {
        tokio::runtime::Builder::new_current_thread().build().unwrap().block_on(f)
    }

    fn create_frame(train_uid: &str, stp: &str, signalling_id: &str) -> String {
        format!(
            r#"{{"VSTPCIFMsgV1":{{"transaction_type":"Create","schedule":{{
                "train_uid":"{train_uid}","stp_indicator":"{stp}",
                "schedule_start_date":"2023-06-03","schedule_end_date":"2023-06-03",
                "days_run":"1111100","signalling_id":"{signalling_id}",
                "locations":[
                    {{"record_type":"LO","tiploc":"EUSTON","departure":"1000"}},
                    {{"record_type":"LT","tiploc":"GLGC","arrival":"1830"}}
                ]
            }}}}}}"#
        )
    }

    #[test]
    fn create_inserts_schedule_and_locations() {
        block_on(async {
            let store = Arc::new(MemoryStore::new());
            let ingester = VstpIngester::new(store.clone());
            let now = Utc.with_ymd_and_hms(2023, 6, 1, 0, 0, 0).unwrap();
            let stats = ingester
                .ingest_frame(&create_frame("C99999", "N", "XX12"), now)
                .await
                .unwrap();
            assert_eq!(stats.created, 1);
            assert_eq!(stats.locations_created, 2);
        });
    }

    #[test]
    fn delete_with_no_match_counts_miss() {
        block_on(async {
            let store = Arc::new(MemoryStore::new());
            let ingester = VstpIngester::new(store.clone());
            let now = Utc.with_ymd_and_hms(2023, 6, 1, 0, 0, 0).unwrap();
            let frame = r#"{"VSTPCIFMsgV1":{"transaction_type":"Delete","schedule":{
                "train_uid":"C00000","stp_indicator":"O",
                "schedule_start_date":"2023-06-03","schedule_end_date":"2023-06-03"
            }}}"#;
            let stats = ingester.ingest_frame(frame, now).await.unwrap();
            assert_eq!(stats.delete_miss, 1);
            assert_eq!(stats.delete_hit, 0);
        });
    }

    #[test]
    fn update_replaces_existing_schedule() {
        block_on(async {
            let store = Arc::new(MemoryStore::new());
            let ingester = VstpIngester::new(store.clone());
            let now = Utc.with_ymd_and_hms(2023, 6, 1, 0, 0, 0).unwrap();
            ingester.ingest_frame(&create_frame("C11111", "N", "AA11"), now).await.unwrap();

            let update_frame = r#"{"VSTPCIFMsgV1":{"transaction_type":"Update","schedule":{
                "train_uid":"C11111","stp_indicator":"N",
                "schedule_start_date":"2023-06-03","schedule_end_date":"2023-06-03",
                "days_run":"1111100","signalling_id":"BB22","locations":[]
            }}}"#;
            let stats = ingester.ingest_frame(update_frame, now).await.unwrap();
            assert_eq!(stats.update_delete_miss, 0);
            assert_eq!(stats.created, 1);

            let live = store
                .find_live_schedules_by_uid_dates(
                    "C11111",
                    NaiveDate::from_ymd_opt(2023, 6, 3).unwrap(),
                    NaiveDate::from_ymd_opt(2023, 6, 3).unwrap(),
                    Some(true),
                )
                .await
                .unwrap();
            assert_eq!(live.len(), 1);
            assert_eq!(live[0].signalling_id, "BB22");
        });
    }
}
