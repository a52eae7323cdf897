//! Postgres-backed `StoreBackend` (spec §4.A). One persistent connection
//! per process; `sqlx`'s own auto-reconnect is not relied upon (spec:
//! "Auto-reconnect from the driver is disabled so that transaction
//! atomicity is not silently violated") — `connect` reconnects
//! explicitly and once, on query failure, via [`PgStore::reconnect`].

use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Row};

use super::{
    Activation, AssociationKey, LocationRecordType, NewActivation, NewAssociation,
    NewCancellation, NewChangeEnRoute, NewChangeOfId, NewChangeOfLocation, NewChangeOfOrigin,
    NewMovement, NewSchedule, NewScheduleLocation, Schedule, ScheduleLocation, SourceKind,
    Status, StoreBackend, StoreError, StpIndicator, Tiploc,
};
use crate::time::CifTime;

/// A handful of migration steps, gated by a single-row
/// `database_version` table (spec §4.A). Every component runs the
/// steps it needs plus `CREATE TABLE IF NOT EXISTS` for the tables it
/// touches; a Postgres advisory lock (`pg_advisory_lock`) serialises
/// concurrent migration attempts across processes.
const MIGRATIONS: &[&str] = &[
    r#"CREATE TABLE IF NOT EXISTS database_version (version INTEGER NOT NULL)"#,
    r#"CREATE TABLE IF NOT EXISTS update_batch (
        id BIGSERIAL PRIMARY KEY,
        extract_timestamp TIMESTAMPTZ NOT NULL,
        source_kind SMALLINT NOT NULL
    )"#,
    r#"CREATE TABLE IF NOT EXISTS tiploc (
        tiploc TEXT PRIMARY KEY,
        nalco BIGINT NOT NULL,
        tps_description TEXT NOT NULL,
        stanox BIGINT NOT NULL,
        three_alpha TEXT NOT NULL
    )"#,
    r#"CREATE TABLE IF NOT EXISTS schedule (
        id BIGSERIAL PRIMARY KEY,
        train_uid TEXT NOT NULL,
        stp_indicator CHAR(1) NOT NULL,
        schedule_start_date DATE NOT NULL,
        schedule_end_date DATE NOT NULL,
        days_run SMALLINT NOT NULL,
        atoc_code TEXT NOT NULL DEFAULT '',
        uic_code TEXT NOT NULL DEFAULT '',
        category TEXT NOT NULL DEFAULT '',
        signalling_id TEXT NOT NULL DEFAULT '',
        headcode TEXT NOT NULL DEFAULT '',
        service_code TEXT NOT NULL DEFAULT '',
        power_type TEXT NOT NULL DEFAULT '',
        speed TEXT NOT NULL DEFAULT '',
        train_class CHAR(1) NOT NULL DEFAULT ' ',
        update_id BIGINT NOT NULL,
        created TIMESTAMPTZ NOT NULL,
        deleted TIMESTAMPTZ,
        deduced_headcode TEXT NOT NULL DEFAULT '',
        deduced_headcode_status CHAR(1)
    )"#,
    r#"CREATE INDEX IF NOT EXISTS schedule_uid_dates_idx ON schedule (train_uid, schedule_start_date, schedule_end_date)"#,
    r#"CREATE TABLE IF NOT EXISTS schedule_location (
        id BIGSERIAL PRIMARY KEY,
        schedule_id BIGINT NOT NULL REFERENCES schedule(id),
        record_type SMALLINT NOT NULL,
        tiploc TEXT NOT NULL,
        tiploc_instance CHAR(1) NOT NULL DEFAULT ' ',
        activities TEXT NOT NULL DEFAULT '',
        arrival_hhmm SMALLINT,
        arrival_half BOOLEAN,
        departure_hhmm SMALLINT,
        departure_half BOOLEAN,
        pass_hhmm SMALLINT,
        pass_half BOOLEAN,
        public_arrival TEXT,
        public_departure TEXT,
        sort_time INTEGER NOT NULL,
        next_day BOOLEAN NOT NULL DEFAULT FALSE,
        platform TEXT NOT NULL DEFAULT '',
        line TEXT NOT NULL DEFAULT '',
        path TEXT NOT NULL DEFAULT '',
        engineering_allowance TEXT NOT NULL DEFAULT '',
        pathing_allowance TEXT NOT NULL DEFAULT '',
        performance_allowance TEXT NOT NULL DEFAULT ''
    )"#,
    r#"CREATE INDEX IF NOT EXISTS schedule_location_tiploc_idx ON schedule_location (tiploc)"#,
    r#"CREATE TABLE IF NOT EXISTS change_en_route (
        id BIGSERIAL PRIMARY KEY,
        schedule_id BIGINT NOT NULL REFERENCES schedule(id),
        tiploc TEXT NOT NULL,
        category TEXT NOT NULL DEFAULT '',
        headcode TEXT NOT NULL DEFAULT '',
        service_code TEXT NOT NULL DEFAULT '',
        power_type TEXT NOT NULL DEFAULT '',
        timing_load TEXT NOT NULL DEFAULT ''
    )"#,
    r#"CREATE TABLE IF NOT EXISTS association (
        id BIGSERIAL PRIMARY KEY,
        main_uid TEXT NOT NULL,
        assoc_uid TEXT NOT NULL,
        assoc_start_date DATE NOT NULL,
        assoc_end_date DATE NOT NULL,
        days_run SMALLINT NOT NULL,
        category TEXT NOT NULL DEFAULT '',
        location TEXT NOT NULL,
        stp_indicator CHAR(1) NOT NULL,
        created TIMESTAMPTZ NOT NULL,
        deleted TIMESTAMPTZ
    )"#,
    r#"CREATE TABLE IF NOT EXISTS activation (
        id BIGSERIAL PRIMARY KEY,
        train_id TEXT NOT NULL,
        schedule_id BIGINT NOT NULL,
        train_uid TEXT NOT NULL DEFAULT '',
        schedule_start_date DATE,
        schedule_end_date DATE,
        created TIMESTAMPTZ NOT NULL,
        deduced BOOLEAN NOT NULL DEFAULT FALSE,
        origin_stanox BIGINT,
        tsc TEXT,
        wtt_id TEXT
    )"#,
    r#"CREATE INDEX IF NOT EXISTS activation_train_id_idx ON activation (train_id, created)"#,
    r#"CREATE TABLE IF NOT EXISTS movement (
        id BIGSERIAL PRIMARY KEY,
        train_id TEXT NOT NULL,
        flags SMALLINT NOT NULL,
        planned_timestamp TIMESTAMPTZ NOT NULL,
        actual_timestamp TIMESTAMPTZ NOT NULL,
        variation_minutes INTEGER NOT NULL,
        platform TEXT NOT NULL DEFAULT '',
        stanox BIGINT NOT NULL,
        next_report_stanox BIGINT,
        next_report_run_time INTEGER
    )"#,
    r#"CREATE TABLE IF NOT EXISTS cancellation (
        id BIGSERIAL PRIMARY KEY,
        train_id TEXT NOT NULL,
        timestamp TIMESTAMPTZ NOT NULL,
        reason_code TEXT NOT NULL DEFAULT '',
        cancelled_stanox BIGINT,
        reinstate BOOLEAN NOT NULL DEFAULT FALSE
    )"#,
    r#"CREATE TABLE IF NOT EXISTS change_of_origin (
        id BIGSERIAL PRIMARY KEY,
        train_id TEXT NOT NULL,
        timestamp TIMESTAMPTZ NOT NULL,
        new_origin_stanox BIGINT NOT NULL,
        new_departure_time TIMESTAMPTZ NOT NULL,
        reason_code TEXT NOT NULL DEFAULT ''
    )"#,
    r#"CREATE TABLE IF NOT EXISTS change_of_id (
        id BIGSERIAL PRIMARY KEY,
        old_train_id TEXT NOT NULL,
        new_train_id TEXT NOT NULL,
        timestamp TIMESTAMPTZ NOT NULL
    )"#,
    r#"CREATE TABLE IF NOT EXISTS change_of_location (
        id BIGSERIAL PRIMARY KEY,
        train_id TEXT NOT NULL,
        timestamp TIMESTAMPTZ NOT NULL,
        new_location_stanox BIGINT NOT NULL
    )"#,
    r#"CREATE TABLE IF NOT EXISTS obfus_lookup (
        recorded_at TIMESTAMPTZ NOT NULL,
        true_headcode TEXT NOT NULL,
        obfuscated_headcode TEXT NOT NULL
    )"#,
    r#"CREATE TABLE IF NOT EXISTS status (
        trust_processed TIMESTAMPTZ,
        trust_wall_clock TIMESTAMPTZ,
        vstp_processed TIMESTAMPTZ,
        td_processed TIMESTAMPTZ
    )"#,
];

pub struct PgStore {
    pool: PgPool,
    in_transaction: Mutex<bool>,
}

impl PgStore {
    pub async fn connect(connect_string: &str) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(1)
            .connect(connect_string)
            .await
            .map_err(|e| StoreError::Connect(e.to_string()))?;
        Ok(Self {
            pool,
            in_transaction: Mutex::new(false),
        })
    }

    /// Reconnect once on a transient failure, per §4.A's `db_query`
    /// behaviour ("transparently reconnects once on failure and
    /// retries").
    pub async fn reconnect(&mut self, connect_string: &str) -> Result<(), StoreError> {
        self.pool = PgPoolOptions::new()
            .max_connections(1)
            .connect(connect_string)
            .await
            .map_err(|e| StoreError::Connect(e.to_string()))?;
        Ok(())
    }
}

fn stp_to_sql(s: StpIndicator) -> String {
    s.as_char().to_string()
}

fn stp_from_sql(c: &str) -> Option<StpIndicator> {
    c.chars().next().and_then(StpIndicator::from_char)
}

fn time_to_cols(t: Option<CifTime>) -> (Option<i32>, Option<bool>) {
    match t {
        Some(t) => (Some(t.hour as i32 * 100 + t.minute as i32), Some(t.half)),
        None => (None, None),
    }
}

fn cols_to_time(hhmm: Option<i32>, half: Option<bool>) -> Option<CifTime> {
    hhmm.map(|v| CifTime {
        hour: (v / 100) as u8,
        minute: (v % 100) as u8,
        half: half.unwrap_or(false),
    })
}

fn row_to_schedule(row: &sqlx::postgres::PgRow) -> Schedule {
    Schedule {
        id: row.get::<i64, _>("id"),
        train_uid: row.get("train_uid"),
        stp_indicator: stp_from_sql(row.get::<String, _>("stp_indicator").as_str())
            .unwrap_or(StpIndicator::Permanent),
        schedule_start_date: row.get("schedule_start_date"),
        schedule_end_date: row.get("schedule_end_date"),
        days_run: row.get::<i16, _>("days_run") as u8,
        atoc_code: row.get("atoc_code"),
        uic_code: row.get("uic_code"),
        category: row.get("category"),
        signalling_id: row.get("signalling_id"),
        headcode: row.get("headcode"),
        service_code: row.get("service_code"),
        power_type: row.get("power_type"),
        speed: row.get("speed"),
        train_class: row
            .get::<String, _>("train_class")
            .chars()
            .next()
            .unwrap_or(' '),
        update_id: row.get("update_id"),
        created: row.get("created"),
        deleted: row.get("deleted"),
        deduced_headcode: row.get("deduced_headcode"),
        deduced_headcode_status: row
            .get::<Option<String>, _>("deduced_headcode_status")
            .and_then(|s| s.chars().next()),
    }
}

fn row_to_location(row: &sqlx::postgres::PgRow) -> ScheduleLocation {
    let record_type = match row.get::<i16, _>("record_type") {
        0 => LocationRecordType::Origin,
        2 => LocationRecordType::Terminus,
        _ => LocationRecordType::Intermediate,
    };
    ScheduleLocation {
        id: row.get("id"),
        schedule_id: row.get("schedule_id"),
        record_type,
        tiploc: row.get("tiploc"),
        tiploc_instance: row
            .get::<String, _>("tiploc_instance")
            .chars()
            .next()
            .unwrap_or(' '),
        activities: row.get("activities"),
        arrival: cols_to_time(row.get("arrival_hhmm"), row.get("arrival_half")),
        departure: cols_to_time(row.get("departure_hhmm"), row.get("departure_half")),
        pass: cols_to_time(row.get("pass_hhmm"), row.get("pass_half")),
        public_arrival: row.get("public_arrival"),
        public_departure: row.get("public_departure"),
        sort_time: row.get::<i32, _>("sort_time") as u32,
        next_day: row.get("next_day"),
        platform: row.get("platform"),
        line: row.get("line"),
        path: row.get("path"),
        engineering_allowance: row.get("engineering_allowance"),
        pathing_allowance: row.get("pathing_allowance"),
        performance_allowance: row.get("performance_allowance"),
    }
}

fn row_to_tiploc(row: &sqlx::postgres::PgRow) -> Tiploc {
    Tiploc {
        tiploc: row.get("tiploc"),
        nalco: row.get::<i64, _>("nalco") as u32,
        tps_description: row.get("tps_description"),
        stanox: row.get::<i64, _>("stanox") as u32,
        three_alpha: row.get("three_alpha"),
    }
}

fn row_to_activation(row: &sqlx::postgres::PgRow) -> Activation {
    Activation {
        id: row.get("id"),
        train_id: row.get("train_id"),
        schedule_id: row.get("schedule_id"),
        train_uid: row.get("train_uid"),
        schedule_start_date: row
            .get::<Option<NaiveDate>, _>("schedule_start_date")
            .unwrap_or(NaiveDate::MIN),
        schedule_end_date: row
            .get::<Option<NaiveDate>, _>("schedule_end_date")
            .unwrap_or(NaiveDate::MIN),
        created: row.get("created"),
        deduced: row.get("deduced"),
    }
}

// The pool is capped at one connection (`max_connections(1)`), so every
// statement issued between `begin` and `commit`/`rollback` lands on the
// same underlying Postgres session and therefore the same server-side
// transaction. This avoids sqlx's borrowed `Transaction<'_>` handle,
// which cannot be stored behind the object-safe `StoreBackend` trait
// without a self-referential struct; the single-connection pool gives
// the same atomicity guarantee (spec §5: single-threaded message path,
// one DB connection per process) with none of that complexity.
macro_rules! exec {
    ($self:expr, $query:expr) => {{
        $query.execute(&$self.pool).await
    }};
}

#[async_trait]
impl StoreBackend for PgStore {
    async fn begin(&self) -> Result<(), StoreError> {
        {
            let guard = self.in_transaction.lock().unwrap();
            if *guard {
                return Err(StoreError::TransactionAlreadyOpen);
            }
        }
        sqlx::query("BEGIN")
            .execute(&self.pool)
            .await
            .map_err(|e| StoreError::Query(e.to_string()))?;
        *self.in_transaction.lock().unwrap() = true;
        Ok(())
    }

    async fn commit(&self) -> Result<(), StoreError> {
        {
            let guard = self.in_transaction.lock().unwrap();
            if !*guard {
                return Err(StoreError::NoTransaction);
            }
        }
        sqlx::query("COMMIT")
            .execute(&self.pool)
            .await
            .map_err(|e| StoreError::Query(e.to_string()))?;
        *self.in_transaction.lock().unwrap() = false;
        Ok(())
    }

    async fn rollback(&self) -> Result<(), StoreError> {
        let was_open = *self.in_transaction.lock().unwrap();
        if was_open {
            sqlx::query("ROLLBACK")
                .execute(&self.pool)
                .await
                .map_err(|e| StoreError::Query(e.to_string()))?;
        }
        *self.in_transaction.lock().unwrap() = false;
        Ok(())
    }

    async fn run_migrations(&self, caller: &str) -> Result<(), StoreError> {
        log::info!("running migrations, caller={caller}");
        sqlx::query("SELECT pg_advisory_lock(hashtext('nr_rail_migration'))")
            .execute(&self.pool)
            .await
            .map_err(|e| StoreError::Migration(e.to_string()))?;
        let result: Result<(), StoreError> = async {
            for stmt in MIGRATIONS {
                sqlx::query(stmt)
                    .execute(&self.pool)
                    .await
                    .map_err(|e| StoreError::Migration(e.to_string()))?;
            }
            Ok(())
        }
        .await;
        sqlx::query("SELECT pg_advisory_unlock(hashtext('nr_rail_migration'))")
            .execute(&self.pool)
            .await
            .ok();
        result
    }

    async fn latest_update_extract_timestamp(
        &self,
        source_kind: SourceKind,
    ) -> Result<Option<DateTime<Utc>>, StoreError> {
        let kinds: &[i16] = match source_kind {
            SourceKind::Full | SourceKind::DailyUpdate => &[1, 2],
            SourceKind::Vstp => &[0],
        };
        let row = sqlx::query(
            "SELECT MAX(extract_timestamp) as ts FROM update_batch WHERE source_kind = ANY($1)",
        )
        .bind(kinds)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| StoreError::Query(e.to_string()))?;
        Ok(row.get("ts"))
    }

    async fn insert_update_batch(
        &self,
        extract_timestamp: DateTime<Utc>,
        source_kind: SourceKind,
    ) -> Result<i64, StoreError> {
        let row = sqlx::query(
            "INSERT INTO update_batch (extract_timestamp, source_kind) VALUES ($1, $2) RETURNING id",
        )
        .bind(extract_timestamp)
        .bind(source_kind.as_i16())
        .fetch_one(&self.pool)
        .await
        .map_err(|e| StoreError::Query(e.to_string()))?;
        Ok(row.get("id"))
    }

    async fn upsert_tiploc(&self, t: &Tiploc) -> Result<(), StoreError> {
        exec!(
            self,
            sqlx::query(
                "INSERT INTO tiploc (tiploc, nalco, tps_description, stanox, three_alpha) \
                 VALUES ($1, $2, $3, $4, $5) \
                 ON CONFLICT (tiploc) DO UPDATE SET nalco = $2, tps_description = $3, stanox = $4, three_alpha = $5",
            )
            .bind(&t.tiploc)
            .bind(t.nalco as i64)
            .bind(&t.tps_description)
            .bind(t.stanox as i64)
            .bind(&t.three_alpha)
        )
        .map_err(|e| StoreError::Query(e.to_string()))?;
        Ok(())
    }

    async fn rename_tiploc(&self, old: &str, t: &Tiploc) -> Result<(), StoreError> {
        exec!(self, sqlx::query("DELETE FROM tiploc WHERE tiploc = $1").bind(old))
            .map_err(|e| StoreError::Query(e.to_string()))?;
        self.upsert_tiploc(t).await
    }

    async fn delete_tiploc(&self, tiploc: &str) -> Result<(), StoreError> {
        exec!(self, sqlx::query("DELETE FROM tiploc WHERE tiploc = $1").bind(tiploc))
            .map_err(|e| StoreError::Query(e.to_string()))?;
        Ok(())
    }

    async fn tiploc_by_stanox(&self, stanox: u32) -> Result<Option<Tiploc>, StoreError> {
        let row = sqlx::query("SELECT * FROM tiploc WHERE stanox = $1")
            .bind(stanox as i64)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| StoreError::Query(e.to_string()))?;
        Ok(row.as_ref().map(row_to_tiploc))
    }

    async fn insert_schedule(&self, sch: &NewSchedule) -> Result<i64, StoreError> {
        let row = sqlx::query(
            "INSERT INTO schedule (train_uid, stp_indicator, schedule_start_date, schedule_end_date, \
             days_run, atoc_code, uic_code, category, signalling_id, headcode, service_code, \
             power_type, speed, train_class, update_id, created, deleted, deduced_headcode, deduced_headcode_status) \
             VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9,$10,$11,$12,$13,$14,$15,$16,NULL,$17,$18) RETURNING id",
        )
        .bind(&sch.train_uid)
        .bind(stp_to_sql(sch.stp_indicator))
        .bind(sch.schedule_start_date)
        .bind(sch.schedule_end_date)
        .bind(sch.days_run as i16)
        .bind(&sch.atoc_code)
        .bind(&sch.uic_code)
        .bind(&sch.category)
        .bind(&sch.signalling_id)
        .bind(&sch.headcode)
        .bind(&sch.service_code)
        .bind(&sch.power_type)
        .bind(&sch.speed)
        .bind(sch.train_class.to_string())
        .bind(sch.update_id)
        .bind(sch.created)
        .bind(&sch.deduced_headcode)
        .bind(sch.deduced_headcode_status.map(|c| c.to_string()))
        .fetch_one(&self.pool)
        .await
        .map_err(|e| StoreError::Query(e.to_string()))?;
        Ok(row.get("id"))
    }

    async fn get_schedule(&self, id: i64) -> Result<Option<Schedule>, StoreError> {
        let row = sqlx::query("SELECT * FROM schedule WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| StoreError::Query(e.to_string()))?;
        Ok(row.as_ref().map(row_to_schedule))
    }

    async fn soft_delete_schedule(&self, id: i64, now: DateTime<Utc>) -> Result<(), StoreError> {
        exec!(
            self,
            sqlx::query("UPDATE schedule SET deleted = $1 WHERE id = $2")
                .bind(now)
                .bind(id)
        )
        .map_err(|e| StoreError::Query(e.to_string()))?;
        Ok(())
    }

    async fn find_live_schedules_for_delete(
        &self,
        train_uid: &str,
        schedule_start_date: NaiveDate,
        stp_indicator: StpIndicator,
    ) -> Result<Vec<Schedule>, StoreError> {
        let rows = sqlx::query(
            "SELECT * FROM schedule WHERE train_uid = $1 AND schedule_start_date = $2 \
             AND stp_indicator = $3 AND update_id != 0 AND (deleted IS NULL OR deleted > now())",
        )
        .bind(train_uid)
        .bind(schedule_start_date)
        .bind(stp_to_sql(stp_indicator))
        .fetch_all(&self.pool)
        .await
        .map_err(|e| StoreError::Query(e.to_string()))?;
        Ok(rows.iter().map(row_to_schedule).collect())
    }

    async fn find_live_schedules_by_uid_dates(
        &self,
        train_uid: &str,
        schedule_start_date: NaiveDate,
        schedule_end_date: NaiveDate,
        vstp_only: Option<bool>,
    ) -> Result<Vec<Schedule>, StoreError> {
        let base = "SELECT * FROM schedule WHERE train_uid = $1 AND schedule_start_date = $2 \
             AND schedule_end_date = $3 AND (deleted IS NULL OR deleted > now())";
        let rows = match vstp_only {
            Some(true) => {
                sqlx::query(&format!("{base} AND update_id = 0"))
                    .bind(train_uid)
                    .bind(schedule_start_date)
                    .bind(schedule_end_date)
                    .fetch_all(&self.pool)
                    .await
            }
            Some(false) => {
                sqlx::query(&format!("{base} AND update_id != 0"))
                    .bind(train_uid)
                    .bind(schedule_start_date)
                    .bind(schedule_end_date)
                    .fetch_all(&self.pool)
                    .await
            }
            None => {
                sqlx::query(base)
                    .bind(train_uid)
                    .bind(schedule_start_date)
                    .bind(schedule_end_date)
                    .fetch_all(&self.pool)
                    .await
            }
        }
        .map_err(|e| StoreError::Query(e.to_string()))?;
        Ok(rows.iter().map(row_to_schedule).collect())
    }

    async fn most_recent_schedule_for_uid(
        &self,
        train_uid: &str,
        before: DateTime<Utc>,
    ) -> Result<Option<Schedule>, StoreError> {
        let row = sqlx::query(
            "SELECT * FROM schedule WHERE train_uid = $1 AND created < $2 ORDER BY created DESC LIMIT 1",
        )
        .bind(train_uid)
        .bind(before)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| StoreError::Query(e.to_string()))?;
        Ok(row.as_ref().map(row_to_schedule))
    }

    async fn set_schedule_headcode(
        &self,
        schedule_id: i64,
        headcode: &str,
        status: char,
    ) -> Result<(), StoreError> {
        exec!(
            self,
            sqlx::query("UPDATE schedule SET deduced_headcode = $1, deduced_headcode_status = $2 WHERE id = $3")
                .bind(headcode)
                .bind(status.to_string())
                .bind(schedule_id)
        )
        .map_err(|e| StoreError::Query(e.to_string()))?;
        Ok(())
    }

    async fn set_schedule_tsc(&self, schedule_id: i64, tsc: &str) -> Result<(), StoreError> {
        exec!(
            self,
            sqlx::query("UPDATE schedule SET service_code = $1 WHERE id = $2")
                .bind(tsc)
                .bind(schedule_id)
        )
        .map_err(|e| StoreError::Query(e.to_string()))?;
        Ok(())
    }

    async fn insert_location(&self, loc: &NewScheduleLocation) -> Result<i64, StoreError> {
        let sort_time = loc
            .arrival
            .or(loc.departure)
            .or(loc.pass)
            .map(|t| t.sort_time())
            .unwrap_or(0) as i32;
        let (arr_hhmm, arr_half) = time_to_cols(loc.arrival);
        let (dep_hhmm, dep_half) = time_to_cols(loc.departure);
        let (pass_hhmm, pass_half) = time_to_cols(loc.pass);
        let record_type = match loc.record_type {
            LocationRecordType::Origin => 0i16,
            LocationRecordType::Intermediate => 1,
            LocationRecordType::Terminus => 2,
        };
        let row = sqlx::query(
            "INSERT INTO schedule_location (schedule_id, record_type, tiploc, tiploc_instance, \
             activities, arrival_hhmm, arrival_half, departure_hhmm, departure_half, pass_hhmm, \
             pass_half, public_arrival, public_departure, sort_time, platform, line, path, \
             engineering_allowance, pathing_allowance, performance_allowance) \
             VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9,$10,$11,$12,$13,$14,$15,$16,$17,$18,$19,$20) RETURNING id",
        )
        .bind(loc.schedule_id)
        .bind(record_type)
        .bind(&loc.tiploc)
        .bind(loc.tiploc_instance.to_string())
        .bind(&loc.activities)
        .bind(arr_hhmm)
        .bind(arr_half)
        .bind(dep_hhmm)
        .bind(dep_half)
        .bind(pass_hhmm)
        .bind(pass_half)
        .bind(&loc.public_arrival)
        .bind(&loc.public_departure)
        .bind(sort_time)
        .bind(&loc.platform)
        .bind(&loc.line)
        .bind(&loc.path)
        .bind(&loc.engineering_allowance)
        .bind(&loc.pathing_allowance)
        .bind(&loc.performance_allowance)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| StoreError::Query(e.to_string()))?;
        let id: i64 = row.get("id");

        // next_day: set when this location's sort_time precedes the
        // origin's (the LO record, record_type 0), meaning the service
        // has wrapped past midnight since departure (spec §4.C/§3). The
        // origin is always inserted first, so it already exists for
        // every later location; inserting the origin itself leaves no
        // row to compare against and next_day stays false.
        let origin_sort_time: Option<i32> = sqlx::query_scalar(
            "SELECT sort_time FROM schedule_location WHERE schedule_id = $1 AND record_type = 0",
        )
        .bind(loc.schedule_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| StoreError::Query(e.to_string()))?;
        let next_day = origin_sort_time.map(|origin| sort_time < origin).unwrap_or(false);
        exec!(
            self,
            sqlx::query("UPDATE schedule_location SET next_day = $1 WHERE id = $2")
                .bind(next_day)
                .bind(id)
        )
        .map_err(|e| StoreError::Query(e.to_string()))?;

        Ok(id)
    }

    async fn locations_for_schedule(
        &self,
        schedule_id: i64,
    ) -> Result<Vec<ScheduleLocation>, StoreError> {
        let rows = sqlx::query("SELECT * FROM schedule_location WHERE schedule_id = $1 ORDER BY sort_time")
            .bind(schedule_id)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| StoreError::Query(e.to_string()))?;
        Ok(rows.iter().map(row_to_location).collect())
    }

    async fn schedules_with_location(
        &self,
        tiploc: &str,
    ) -> Result<Vec<(Schedule, ScheduleLocation)>, StoreError> {
        let rows = sqlx::query(
            "SELECT s.*, l.* FROM schedule_location l JOIN schedule s ON s.id = l.schedule_id \
             WHERE l.tiploc = $1 AND s.update_id != 0 AND (s.deleted IS NULL OR s.deleted > now())",
        )
        .bind(tiploc)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| StoreError::Query(e.to_string()))?;
        Ok(rows
            .iter()
            .map(|r| (row_to_schedule(r), row_to_location(r)))
            .collect())
    }

    async fn insert_change_en_route(&self, cer: &NewChangeEnRoute) -> Result<(), StoreError> {
        exec!(
            self,
            sqlx::query(
                "INSERT INTO change_en_route (schedule_id, tiploc, category, headcode, service_code, power_type, timing_load) \
                 VALUES ($1,$2,$3,$4,$5,$6,$7)",
            )
            .bind(cer.schedule_id)
            .bind(&cer.tiploc)
            .bind(&cer.category)
            .bind(&cer.headcode)
            .bind(&cer.service_code)
            .bind(&cer.power_type)
            .bind(&cer.timing_load)
        )
        .map_err(|e| StoreError::Query(e.to_string()))?;
        Ok(())
    }

    async fn insert_association(&self, assoc: &NewAssociation) -> Result<i64, StoreError> {
        let row = sqlx::query(
            "INSERT INTO association (main_uid, assoc_uid, assoc_start_date, assoc_end_date, days_run, category, location, stp_indicator, created) \
             VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9) RETURNING id",
        )
        .bind(&assoc.main_uid)
        .bind(&assoc.assoc_uid)
        .bind(assoc.assoc_start_date)
        .bind(assoc.assoc_end_date)
        .bind(assoc.days_run as i16)
        .bind(&assoc.category)
        .bind(&assoc.location)
        .bind(stp_to_sql(assoc.stp_indicator))
        .bind(assoc.created)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| StoreError::Query(e.to_string()))?;
        Ok(row.get("id"))
    }

    async fn find_live_associations(&self, key: &AssociationKey) -> Result<Vec<i64>, StoreError> {
        let mut q = String::from(
            "SELECT id FROM association WHERE main_uid = $1 AND assoc_uid = $2 AND assoc_start_date = $3 \
             AND location = $4 AND assoc_end_date >= CURRENT_DATE AND (deleted IS NULL OR deleted > now())",
        );
        if key.stp_indicator.is_some() {
            q.push_str(" AND stp_indicator = $5");
        }
        let mut query = sqlx::query(&q)
            .bind(&key.main_uid)
            .bind(&key.assoc_uid)
            .bind(key.assoc_start_date)
            .bind(&key.location);
        if let Some(stp) = key.stp_indicator {
            query = query.bind(stp_to_sql(stp));
        }
        let rows = query
            .fetch_all(&self.pool)
            .await
            .map_err(|e| StoreError::Query(e.to_string()))?;
        Ok(rows.iter().map(|r| r.get("id")).collect())
    }

    async fn soft_delete_association(&self, id: i64, now: DateTime<Utc>) -> Result<(), StoreError> {
        exec!(
            self,
            sqlx::query("UPDATE association SET deleted = $1 WHERE id = $2")
                .bind(now)
                .bind(id)
        )
        .map_err(|e| StoreError::Query(e.to_string()))?;
        Ok(())
    }

    async fn insert_activation(&self, act: &NewActivation) -> Result<i64, StoreError> {
        let row = sqlx::query(
            "INSERT INTO activation (train_id, schedule_id, train_uid, schedule_start_date, schedule_end_date, created, deduced, origin_stanox, tsc, wtt_id) \
             VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9,$10) RETURNING id",
        )
        .bind(&act.train_id)
        .bind(act.schedule_id)
        .bind(&act.train_uid)
        .bind(act.schedule_start_date)
        .bind(act.schedule_end_date)
        .bind(act.created)
        .bind(act.deduced)
        .bind(act.origin_stanox.map(|v| v as i64))
        .bind(&act.tsc)
        .bind(&act.wtt_id)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| StoreError::Query(e.to_string()))?;
        Ok(row.get("id"))
    }

    async fn live_activation_for_train(
        &self,
        train_id: &str,
        since: DateTime<Utc>,
    ) -> Result<Option<Activation>, StoreError> {
        let row = sqlx::query(
            "SELECT * FROM activation WHERE train_id = $1 AND created >= $2 AND schedule_id != 0 \
             ORDER BY created DESC LIMIT 1",
        )
        .bind(train_id)
        .bind(since)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| StoreError::Query(e.to_string()))?;
        Ok(row.as_ref().map(row_to_activation))
    }

    async fn insert_movement(&self, m: &NewMovement) -> Result<i64, StoreError> {
        let row = sqlx::query(
            "INSERT INTO movement (train_id, flags, planned_timestamp, actual_timestamp, variation_minutes, platform, stanox, next_report_stanox, next_report_run_time) \
             VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9) RETURNING id",
        )
        .bind(&m.train_id)
        .bind(m.flags.to_bits() as i16)
        .bind(m.planned_timestamp)
        .bind(m.actual_timestamp)
        .bind(m.variation_minutes)
        .bind(&m.platform)
        .bind(m.stanox as i64)
        .bind(m.next_report_stanox.map(|v| v as i64))
        .bind(m.next_report_run_time)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| StoreError::Query(e.to_string()))?;
        Ok(row.get("id"))
    }

    async fn insert_cancellation(&self, c: &NewCancellation) -> Result<i64, StoreError> {
        let row = sqlx::query(
            "INSERT INTO cancellation (train_id, timestamp, reason_code, cancelled_stanox, reinstate) \
             VALUES ($1,$2,$3,$4,$5) RETURNING id",
        )
        .bind(&c.train_id)
        .bind(c.timestamp)
        .bind(&c.reason_code)
        .bind(c.cancelled_stanox.map(|v| v as i64))
        .bind(c.reinstate)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| StoreError::Query(e.to_string()))?;
        Ok(row.get("id"))
    }

    async fn insert_change_of_origin(&self, c: &NewChangeOfOrigin) -> Result<i64, StoreError> {
        let row = sqlx::query(
            "INSERT INTO change_of_origin (train_id, timestamp, new_origin_stanox, new_departure_time, reason_code) \
             VALUES ($1,$2,$3,$4,$5) RETURNING id",
        )
        .bind(&c.train_id)
        .bind(c.timestamp)
        .bind(c.new_origin_stanox as i64)
        .bind(c.new_departure_time)
        .bind(&c.reason_code)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| StoreError::Query(e.to_string()))?;
        Ok(row.get("id"))
    }

    async fn insert_change_of_id(&self, c: &NewChangeOfId) -> Result<i64, StoreError> {
        let row = sqlx::query(
            "INSERT INTO change_of_id (old_train_id, new_train_id, timestamp) VALUES ($1,$2,$3) RETURNING id",
        )
        .bind(&c.old_train_id)
        .bind(&c.new_train_id)
        .bind(c.timestamp)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| StoreError::Query(e.to_string()))?;
        Ok(row.get("id"))
    }

    async fn insert_change_of_location(&self, c: &NewChangeOfLocation) -> Result<i64, StoreError> {
        let row = sqlx::query(
            "INSERT INTO change_of_location (train_id, timestamp, new_location_stanox) VALUES ($1,$2,$3) RETURNING id",
        )
        .bind(&c.train_id)
        .bind(c.timestamp)
        .bind(c.new_location_stanox as i64)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| StoreError::Query(e.to_string()))?;
        Ok(row.get("id"))
    }

    async fn insert_obfus_lookup(
        &self,
        true_hc: &str,
        obfus_hc: &str,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        exec!(
            self,
            sqlx::query("INSERT INTO obfus_lookup (recorded_at, true_headcode, obfuscated_headcode) VALUES ($1,$2,$3)")
                .bind(now)
                .bind(true_hc)
                .bind(obfus_hc)
        )
        .map_err(|e| StoreError::Query(e.to_string()))?;
        Ok(())
    }

    async fn prune_obfus_lookup(&self, before: DateTime<Utc>) -> Result<(), StoreError> {
        exec!(
            self,
            sqlx::query("DELETE FROM obfus_lookup WHERE recorded_at < $1").bind(before)
        )
        .map_err(|e| StoreError::Query(e.to_string()))?;
        Ok(())
    }

    async fn get_status(&self) -> Result<Status, StoreError> {
        let row = sqlx::query("SELECT * FROM status LIMIT 1")
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| StoreError::Query(e.to_string()))?;
        Ok(match row {
            Some(r) => Status {
                trust_processed: r.get("trust_processed"),
                trust_wall_clock: r.get("trust_wall_clock"),
                vstp_processed: r.get("vstp_processed"),
                td_processed: r.get("td_processed"),
            },
            None => Status::default(),
        })
    }

    async fn set_status(&self, status: &Status) -> Result<(), StoreError> {
        exec!(self, sqlx::query("DELETE FROM status")).map_err(|e| StoreError::Query(e.to_string()))?;
        exec!(
            self,
            sqlx::query(
                "INSERT INTO status (trust_processed, trust_wall_clock, vstp_processed, td_processed) VALUES ($1,$2,$3,$4)",
            )
            .bind(status.trust_processed)
            .bind(status.trust_wall_clock)
            .bind(status.vstp_processed)
            .bind(status.td_processed)
        )
        .map_err(|e| StoreError::Query(e.to_string()))?;
        Ok(())
    }

    async fn all_live_non_vstp_schedule_ids(&self) -> Result<Vec<i64>, StoreError> {
        let rows = sqlx::query(
            "SELECT id FROM schedule WHERE update_id != 0 AND (deleted IS NULL OR deleted > now())",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| StoreError::Query(e.to_string()))?;
        Ok(rows.iter().map(|r| r.get("id")).collect())
    }
}
