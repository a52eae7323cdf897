//! In-process `StoreBackend` used by unit and integration tests. Mirrors
//! the production `PgStore`'s semantics without a live Postgres
//! instance, matching the shape of the teacher's own
//! `ScheduleDatabase` (a `HashMap`-backed in-memory model) but behind
//! the same trait the real store implements, so loader/ingester logic
//! is exercised identically in tests and production.

use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};

use super::{
    Activation, AssociationKey, LocationRecordType, NewActivation, NewAssociation,
    NewCancellation, NewChangeEnRoute, NewChangeOfId, NewChangeOfLocation, NewChangeOfOrigin,
    NewMovement, NewSchedule, NewScheduleLocation, Schedule, ScheduleLocation, SourceKind,
    Status, StoreBackend, StoreError, StpIndicator, Tiploc,
};

#[derive(Default)]
struct Inner {
    in_transaction: bool,
    next_id: i64,
    update_batches: Vec<(i64, DateTime<Utc>, SourceKind)>,
    tiplocs: std::collections::HashMap<String, Tiploc>,
    schedules: Vec<Schedule>,
    locations: Vec<ScheduleLocation>,
    change_en_route: Vec<NewChangeEnRoute>,
    associations: Vec<(i64, NewAssociation, Option<DateTime<Utc>>)>,
    activations: Vec<Activation>,
    movements: Vec<NewMovement>,
    cancellations: Vec<NewCancellation>,
    change_of_origin: Vec<NewChangeOfOrigin>,
    change_of_id: Vec<NewChangeOfId>,
    change_of_location: Vec<NewChangeOfLocation>,
    obfus_lookup: Vec<(DateTime<Utc>, String, String)>,
    status: Status,
}

pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                next_id: 1,
                ..Default::default()
            }),
        }
    }

    fn next_id(inner: &mut Inner) -> i64 {
        let id = inner.next_id;
        inner.next_id += 1;
        id
    }
}

#[async_trait]
impl StoreBackend for MemoryStore {
    async fn begin(&self) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().unwrap();
        if inner.in_transaction {
            return Err(StoreError::TransactionAlreadyOpen);
        }
        inner.in_transaction = true;
        Ok(())
    }

    async fn commit(&self) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().unwrap();
        if !inner.in_transaction {
            return Err(StoreError::NoTransaction);
        }
        inner.in_transaction = false;
        Ok(())
    }

    async fn rollback(&self) -> Result<(), StoreError> {
        // The in-memory store applies writes immediately rather than
        // buffering them for a commit, since tests only assert on
        // outcomes after a successful commit. A real rollback would
        // need snapshot/restore; unit tests that exercise rollback
        // paths assert only that no ack/commit occurred, not that
        // writes were undone.
        let mut inner = self.inner.lock().unwrap();
        inner.in_transaction = false;
        Ok(())
    }

    async fn run_migrations(&self, _caller: &str) -> Result<(), StoreError> {
        Ok(())
    }

    async fn latest_update_extract_timestamp(
        &self,
        source_kind: SourceKind,
    ) -> Result<Option<DateTime<Utc>>, StoreError> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .update_batches
            .iter()
            .filter(|(_, _, k)| match source_kind {
                SourceKind::Full | SourceKind::DailyUpdate => {
                    matches!(k, SourceKind::Full | SourceKind::DailyUpdate)
                }
                SourceKind::Vstp => matches!(k, SourceKind::Vstp),
            })
            .map(|(_, ts, _)| *ts)
            .max())
    }

    async fn insert_update_batch(
        &self,
        extract_timestamp: DateTime<Utc>,
        source_kind: SourceKind,
    ) -> Result<i64, StoreError> {
        let mut inner = self.inner.lock().unwrap();
        let id = Self::next_id(&mut inner);
        inner.update_batches.push((id, extract_timestamp, source_kind));
        Ok(id)
    }

    async fn upsert_tiploc(&self, t: &Tiploc) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().unwrap();
        inner.tiplocs.insert(t.tiploc.clone(), t.clone());
        Ok(())
    }

    async fn rename_tiploc(&self, old: &str, t: &Tiploc) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().unwrap();
        inner.tiplocs.remove(old);
        inner.tiplocs.insert(t.tiploc.clone(), t.clone());
        Ok(())
    }

    async fn delete_tiploc(&self, tiploc: &str) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().unwrap();
        inner.tiplocs.remove(tiploc);
        Ok(())
    }

    async fn tiploc_by_stanox(&self, stanox: u32) -> Result<Option<Tiploc>, StoreError> {
        let inner = self.inner.lock().unwrap();
        Ok(inner.tiplocs.values().find(|t| t.stanox == stanox).cloned())
    }

    async fn insert_schedule(&self, sch: &NewSchedule) -> Result<i64, StoreError> {
        let mut inner = self.inner.lock().unwrap();
        let id = Self::next_id(&mut inner);
        inner.schedules.push(Schedule {
            id,
            train_uid: sch.train_uid.clone(),
            stp_indicator: sch.stp_indicator,
            schedule_start_date: sch.schedule_start_date,
            schedule_end_date: sch.schedule_end_date,
            days_run: sch.days_run,
            atoc_code: sch.atoc_code.clone(),
            uic_code: sch.uic_code.clone(),
            category: sch.category.clone(),
            signalling_id: sch.signalling_id.clone(),
            headcode: sch.headcode.clone(),
            service_code: sch.service_code.clone(),
            power_type: sch.power_type.clone(),
            speed: sch.speed.clone(),
            train_class: sch.train_class,
            update_id: sch.update_id,
            created: sch.created,
            deleted: None,
            deduced_headcode: sch.deduced_headcode.clone(),
            deduced_headcode_status: sch.deduced_headcode_status,
        });
        Ok(id)
    }

    async fn get_schedule(&self, id: i64) -> Result<Option<Schedule>, StoreError> {
        let inner = self.inner.lock().unwrap();
        Ok(inner.schedules.iter().find(|s| s.id == id).cloned())
    }

    async fn soft_delete_schedule(&self, id: i64, now: DateTime<Utc>) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(s) = inner.schedules.iter_mut().find(|s| s.id == id) {
            s.deleted = Some(now);
        }
        Ok(())
    }

    async fn find_live_schedules_for_delete(
        &self,
        train_uid: &str,
        schedule_start_date: NaiveDate,
        stp_indicator: StpIndicator,
    ) -> Result<Vec<Schedule>, StoreError> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .schedules
            .iter()
            .filter(|s| {
                s.is_live(Utc::now())
                    && !s.is_vstp()
                    && s.train_uid == train_uid
                    && s.schedule_start_date == schedule_start_date
                    && s.stp_indicator == stp_indicator
            })
            .cloned()
            .collect())
    }

    async fn find_live_schedules_by_uid_dates(
        &self,
        train_uid: &str,
        schedule_start_date: NaiveDate,
        schedule_end_date: NaiveDate,
        vstp_only: Option<bool>,
    ) -> Result<Vec<Schedule>, StoreError> {
        let inner = self.inner.lock().unwrap();
        let now = Utc::now();
        Ok(inner
            .schedules
            .iter()
            .filter(|s| {
                s.is_live(now)
                    && s.train_uid == train_uid
                    && s.schedule_start_date == schedule_start_date
                    && s.schedule_end_date == schedule_end_date
                    && vstp_only.map(|v| s.is_vstp() == v).unwrap_or(true)
            })
            .cloned()
            .collect())
    }

    async fn most_recent_schedule_for_uid(
        &self,
        train_uid: &str,
        before: DateTime<Utc>,
    ) -> Result<Option<Schedule>, StoreError> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .schedules
            .iter()
            .filter(|s| s.train_uid == train_uid && s.created < before)
            .max_by_key(|s| s.created)
            .cloned())
    }

    async fn set_schedule_headcode(
        &self,
        schedule_id: i64,
        headcode: &str,
        status: char,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(s) = inner.schedules.iter_mut().find(|s| s.id == schedule_id) {
            s.deduced_headcode = headcode.to_string();
            s.deduced_headcode_status = Some(status);
        }
        Ok(())
    }

    async fn set_schedule_tsc(&self, schedule_id: i64, tsc: &str) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(s) = inner.schedules.iter_mut().find(|s| s.id == schedule_id) {
            s.service_code = tsc.to_string();
        }
        Ok(())
    }

    async fn insert_location(&self, loc: &NewScheduleLocation) -> Result<i64, StoreError> {
        let mut inner = self.inner.lock().unwrap();
        let id = Self::next_id(&mut inner);
        let sort_time = loc
            .arrival
            .or(loc.departure)
            .or(loc.pass)
            .map(|t| t.sort_time())
            .unwrap_or(0);
        // next_day: this location's sort_time precedes the origin's,
        // i.e. the service has wrapped past midnight since departure
        // (spec §4.C/§3). The origin (LO) record is always inserted
        // first, so it is already present for every later location.
        let origin_sort_time = inner
            .locations
            .iter()
            .find(|l| l.schedule_id == loc.schedule_id && l.record_type == LocationRecordType::Origin)
            .map(|l| l.sort_time);
        let next_day = origin_sort_time.map(|origin| sort_time < origin).unwrap_or(false);
        inner.locations.push(ScheduleLocation {
            id,
            schedule_id: loc.schedule_id,
            record_type: loc.record_type,
            tiploc: loc.tiploc.clone(),
            tiploc_instance: loc.tiploc_instance,
            activities: loc.activities.clone(),
            arrival: loc.arrival,
            departure: loc.departure,
            pass: loc.pass,
            public_arrival: loc.public_arrival.clone(),
            public_departure: loc.public_departure.clone(),
            sort_time,
            next_day,
            platform: loc.platform.clone(),
            line: loc.line.clone(),
            path: loc.path.clone(),
            engineering_allowance: loc.engineering_allowance.clone(),
            pathing_allowance: loc.pathing_allowance.clone(),
            performance_allowance: loc.performance_allowance.clone(),
        });
        Ok(id)
    }

    async fn locations_for_schedule(
        &self,
        schedule_id: i64,
    ) -> Result<Vec<ScheduleLocation>, StoreError> {
        let inner = self.inner.lock().unwrap();
        let mut locs: Vec<_> = inner
            .locations
            .iter()
            .filter(|l| l.schedule_id == schedule_id)
            .cloned()
            .collect();
        locs.sort_by_key(|l| l.sort_time);
        Ok(locs)
    }

    async fn schedules_with_location(
        &self,
        tiploc: &str,
    ) -> Result<Vec<(Schedule, ScheduleLocation)>, StoreError> {
        let inner = self.inner.lock().unwrap();
        let now = Utc::now();
        let mut out = vec![];
        for loc in inner.locations.iter().filter(|l| l.tiploc == tiploc) {
            if let Some(sched) = inner
                .schedules
                .iter()
                .find(|s| s.id == loc.schedule_id && s.is_live(now) && !s.is_vstp())
            {
                out.push((sched.clone(), loc.clone()));
            }
        }
        Ok(out)
    }

    async fn insert_change_en_route(&self, cer: &NewChangeEnRoute) -> Result<(), StoreError> {
        self.inner.lock().unwrap().change_en_route.push(cer.clone());
        Ok(())
    }

    async fn insert_association(&self, assoc: &NewAssociation) -> Result<i64, StoreError> {
        let mut inner = self.inner.lock().unwrap();
        let id = Self::next_id(&mut inner);
        inner.associations.push((id, assoc.clone(), None));
        Ok(id)
    }

    async fn find_live_associations(&self, key: &AssociationKey) -> Result<Vec<i64>, StoreError> {
        let inner = self.inner.lock().unwrap();
        let now = Utc::now();
        Ok(inner
            .associations
            .iter()
            .filter(|(_, a, deleted)| {
                deleted.map(|d| d > now).unwrap_or(true)
                    && a.main_uid == key.main_uid
                    && a.assoc_uid == key.assoc_uid
                    && a.assoc_start_date == key.assoc_start_date
                    && a.location == key.location
                    && key.stp_indicator.map(|s| s == a.stp_indicator).unwrap_or(true)
                    && a.assoc_end_date >= chrono::Utc::now().date_naive()
            })
            .map(|(id, _, _)| *id)
            .collect())
    }

    async fn soft_delete_association(&self, id: i64, now: DateTime<Utc>) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(entry) = inner.associations.iter_mut().find(|(i, _, _)| *i == id) {
            entry.2 = Some(now);
        }
        Ok(())
    }

    async fn insert_activation(&self, act: &NewActivation) -> Result<i64, StoreError> {
        let mut inner = self.inner.lock().unwrap();
        let id = Self::next_id(&mut inner);
        inner.activations.push(Activation {
            id,
            train_id: act.train_id.clone(),
            schedule_id: act.schedule_id,
            train_uid: act.train_uid.clone(),
            schedule_start_date: act.schedule_start_date,
            schedule_end_date: act.schedule_end_date,
            created: act.created,
            deduced: act.deduced,
        });
        Ok(id)
    }

    async fn live_activation_for_train(
        &self,
        train_id: &str,
        since: DateTime<Utc>,
    ) -> Result<Option<Activation>, StoreError> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .activations
            .iter()
            .filter(|a| a.train_id == train_id && a.created >= since && a.schedule_id != 0)
            .max_by_key(|a| a.created)
            .cloned())
    }

    async fn insert_movement(&self, m: &NewMovement) -> Result<i64, StoreError> {
        let mut inner = self.inner.lock().unwrap();
        let id = Self::next_id(&mut inner);
        inner.movements.push(m.clone());
        Ok(id)
    }

    async fn insert_cancellation(&self, c: &NewCancellation) -> Result<i64, StoreError> {
        let mut inner = self.inner.lock().unwrap();
        let id = Self::next_id(&mut inner);
        inner.cancellations.push(c.clone());
        Ok(id)
    }

    async fn insert_change_of_origin(&self, c: &NewChangeOfOrigin) -> Result<i64, StoreError> {
        let mut inner = self.inner.lock().unwrap();
        let id = Self::next_id(&mut inner);
        inner.change_of_origin.push(c.clone());
        Ok(id)
    }

    async fn insert_change_of_id(&self, c: &NewChangeOfId) -> Result<i64, StoreError> {
        let mut inner = self.inner.lock().unwrap();
        let id = Self::next_id(&mut inner);
        inner.change_of_id.push(c.clone());
        Ok(id)
    }

    async fn insert_change_of_location(&self, c: &NewChangeOfLocation) -> Result<i64, StoreError> {
        let mut inner = self.inner.lock().unwrap();
        let id = Self::next_id(&mut inner);
        inner.change_of_location.push(c.clone());
        Ok(id)
    }

    async fn insert_obfus_lookup(
        &self,
        true_hc: &str,
        obfus_hc: &str,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().unwrap();
        inner
            .obfus_lookup
            .push((now, true_hc.to_string(), obfus_hc.to_string()));
        Ok(())
    }

    async fn prune_obfus_lookup(&self, before: DateTime<Utc>) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().unwrap();
        inner.obfus_lookup.retain(|(ts, _, _)| *ts >= before);
        Ok(())
    }

    async fn get_status(&self) -> Result<Status, StoreError> {
        Ok(self.inner.lock().unwrap().status.clone())
    }

    async fn set_status(&self, status: &Status) -> Result<(), StoreError> {
        self.inner.lock().unwrap().status = status.clone();
        Ok(())
    }

    async fn all_live_non_vstp_schedule_ids(&self) -> Result<Vec<i64>, StoreError> {
        let inner = self.inner.lock().unwrap();
        let now = Utc::now();
        Ok(inner
            .schedules
            .iter()
            .filter(|s| s.is_live(now) && !s.is_vstp())
            .map(|s| s.id)
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn obfuscation_lookup_pruning_drops_old_rows() {
        let store = MemoryStore::new();
        let old = Utc::now() - chrono::Duration::hours(30);
        let recent = Utc::now() - chrono::Duration::hours(1);
        store.insert_obfus_lookup("1A23", "1X99", old).await.unwrap();
        store.insert_obfus_lookup("1B34", "1Y88", recent).await.unwrap();
        store
            .prune_obfus_lookup(Utc::now() - chrono::Duration::hours(24))
            .await
            .unwrap();
        let inner = store.inner.lock().unwrap();
        assert_eq!(inner.obfus_lookup.len(), 1);
        assert_eq!(inner.obfus_lookup[0].1, "1B34");
    }
}
