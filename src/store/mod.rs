//! Relational schema + transactional access to the tables of spec §3
//! (Store component, spec §4.A). `StoreBackend` is the seam: the
//! Postgres-backed `PgStore` (`store::pg`) is the production
//! implementation, `MemoryStore` (`store::memory`) is the deterministic
//! test double every ingester unit test runs against, matching the
//! teacher's preference for plain traits over a migration/mocking
//! framework.

pub mod memory;
pub mod model;
pub mod pg;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use thiserror::Error;

pub use model::*;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database connection failed: {0}")]
    Connect(String),
    #[error("query failed: {0}")]
    Query(String),
    #[error("no transaction is open")]
    NoTransaction,
    #[error("a transaction is already open")]
    TransactionAlreadyOpen,
    #[error("schema migration failed: {0}")]
    Migration(String),
}

/// One component's database surface, per spec §4.A: connect,
/// begin-transaction, query, commit, rollback. `escape`/`disconnect`
/// are not modelled explicitly — parameterised queries make manual
/// escaping unnecessary (spec §9), and `disconnect` is just dropping
/// the backend.
#[async_trait]
pub trait StoreBackend: Send + Sync {
    async fn begin(&self) -> Result<(), StoreError>;
    async fn commit(&self) -> Result<(), StoreError>;
    async fn rollback(&self) -> Result<(), StoreError>;

    async fn run_migrations(&self, caller: &str) -> Result<(), StoreError>;

    async fn latest_update_extract_timestamp(
        &self,
        source_kind: SourceKind,
    ) -> Result<Option<DateTime<Utc>>, StoreError>;
    async fn insert_update_batch(
        &self,
        extract_timestamp: DateTime<Utc>,
        source_kind: SourceKind,
    ) -> Result<i64, StoreError>;

    async fn upsert_tiploc(&self, t: &Tiploc) -> Result<(), StoreError>;
    async fn rename_tiploc(&self, old: &str, t: &Tiploc) -> Result<(), StoreError>;
    async fn delete_tiploc(&self, tiploc: &str) -> Result<(), StoreError>;
    async fn tiploc_by_stanox(&self, stanox: u32) -> Result<Option<Tiploc>, StoreError>;

    async fn insert_schedule(&self, sch: &NewSchedule) -> Result<i64, StoreError>;
    async fn get_schedule(&self, id: i64) -> Result<Option<Schedule>, StoreError>;
    async fn soft_delete_schedule(&self, id: i64, now: DateTime<Utc>) -> Result<(), StoreError>;
    /// Live schedules matching `(train_uid, schedule_start_date, stp_indicator)`
    /// where `update_id != 0`, per spec §4.C BS R/D matching.
    async fn find_live_schedules_for_delete(
        &self,
        train_uid: &str,
        schedule_start_date: NaiveDate,
        stp_indicator: StpIndicator,
    ) -> Result<Vec<Schedule>, StoreError>;
    /// Live schedules on `(train_uid, start, end)`, ordered by STP
    /// precedence then newest `created` (spec §4.E 0001 activation
    /// matching, §8.1).
    async fn find_live_schedules_by_uid_dates(
        &self,
        train_uid: &str,
        schedule_start_date: NaiveDate,
        schedule_end_date: NaiveDate,
        vstp_only: Option<bool>,
    ) -> Result<Vec<Schedule>, StoreError>;
    async fn most_recent_schedule_for_uid(
        &self,
        train_uid: &str,
        before: DateTime<Utc>,
    ) -> Result<Option<Schedule>, StoreError>;
    async fn set_schedule_headcode(
        &self,
        schedule_id: i64,
        headcode: &str,
        status: char,
    ) -> Result<(), StoreError>;
    async fn set_schedule_tsc(&self, schedule_id: i64, tsc: &str) -> Result<(), StoreError>;

    async fn insert_location(&self, loc: &NewScheduleLocation) -> Result<i64, StoreError>;
    async fn locations_for_schedule(
        &self,
        schedule_id: i64,
    ) -> Result<Vec<ScheduleLocation>, StoreError>;
    async fn schedules_with_location(
        &self,
        tiploc: &str,
    ) -> Result<Vec<(Schedule, ScheduleLocation)>, StoreError>;

    async fn insert_change_en_route(&self, cer: &NewChangeEnRoute) -> Result<(), StoreError>;

    async fn insert_association(&self, assoc: &NewAssociation) -> Result<i64, StoreError>;
    async fn find_live_associations(
        &self,
        key: &AssociationKey,
    ) -> Result<Vec<i64>, StoreError>;
    async fn soft_delete_association(&self, id: i64, now: DateTime<Utc>) -> Result<(), StoreError>;

    async fn insert_activation(&self, act: &NewActivation) -> Result<i64, StoreError>;
    async fn live_activation_for_train(
        &self,
        train_id: &str,
        since: DateTime<Utc>,
    ) -> Result<Option<Activation>, StoreError>;

    async fn insert_movement(&self, m: &NewMovement) -> Result<i64, StoreError>;
    async fn insert_cancellation(&self, c: &NewCancellation) -> Result<i64, StoreError>;
    async fn insert_change_of_origin(&self, c: &NewChangeOfOrigin) -> Result<i64, StoreError>;
    async fn insert_change_of_id(&self, c: &NewChangeOfId) -> Result<i64, StoreError>;
    async fn insert_change_of_location(&self, c: &NewChangeOfLocation) -> Result<i64, StoreError>;

    async fn insert_obfus_lookup(
        &self,
        true_hc: &str,
        obfus_hc: &str,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError>;
    async fn prune_obfus_lookup(&self, before: DateTime<Utc>) -> Result<(), StoreError>;

    async fn get_status(&self) -> Result<Status, StoreError>;
    async fn set_status(&self, status: &Status) -> Result<(), StoreError>;

    async fn all_live_non_vstp_schedule_ids(&self) -> Result<Vec<i64>, StoreError>;
}

/// Resolve STP precedence across a candidate set, returning the winner
/// (`O > N > P > C`, then newest `created`) — spec §3 invariant, §8.1.
pub fn resolve_stp_precedence(mut candidates: Vec<Schedule>) -> Option<Schedule> {
    candidates.sort_by(|a, b| {
        a.stp_indicator
            .precedence_rank()
            .cmp(&b.stp_indicator.precedence_rank())
            .then(b.created.cmp(&a.created))
    });
    candidates.into_iter().next()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Timelike};

    fn sched(stp: StpIndicator, created_hour: u32) -> Schedule {
        Schedule {
            id: 1,
            train_uid: "C12345".into(),
            stp_indicator: stp,
            schedule_start_date: NaiveDate::from_ymd_opt(2023, 6, 3).unwrap(),
            schedule_end_date: NaiveDate::from_ymd_opt(2023, 6, 10).unwrap(),
            days_run: 0b1111111,
            atoc_code: String::new(),
            uic_code: String::new(),
            category: String::new(),
            signalling_id: String::new(),
            headcode: String::new(),
            service_code: String::new(),
            power_type: String::new(),
            speed: String::new(),
            train_class: ' ',
            update_id: 1,
            created: Utc.with_ymd_and_hms(2023, 6, 1, created_hour, 0, 0).unwrap(),
            deleted: None,
            deduced_headcode: String::new(),
            deduced_headcode_status: None,
        }
    }

    #[test]
    fn stp_precedence_order_is_o_n_p_c() {
        let candidates = vec![
            sched(StpIndicator::Cancellation, 5),
            sched(StpIndicator::Permanent, 5),
            sched(StpIndicator::New, 5),
            sched(StpIndicator::Overlay, 5),
        ];
        let winner = resolve_stp_precedence(candidates).unwrap();
        assert_eq!(winner.stp_indicator, StpIndicator::Overlay);
    }

    #[test]
    fn equal_stp_prefers_newest_created() {
        let candidates = vec![sched(StpIndicator::Permanent, 5), sched(StpIndicator::Permanent, 9)];
        let winner = resolve_stp_precedence(candidates).unwrap();
        assert_eq!(winner.created.hour(), 9);
    }
}
