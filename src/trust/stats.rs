//! Per-category counters and the daily statistics report (spec §4.E
//! "Telemetry"). Counters accumulate for the current day and are rolled
//! into a lifetime grand total when the daily report fires.

use chrono::{DateTime, Timelike};

#[derive(Debug, Clone, Copy, Default)]
pub struct TrustCounters {
    pub activations: u64,
    pub cancellations: u64,
    pub reinstates: u64,
    pub movements: u64,
    pub changes_of_origin: u64,
    pub changes_of_id: u64,
    pub changes_of_location: u64,
    pub good_message: u64,
    pub not_vstp: u64,
    pub not_recognised: u64,
    pub mess1_miss_hit: u64,
    pub mess1_cape: u64,
    pub deferred_overflow: u64,
    pub deduced_hc: u64,
    pub deduced_hc_replaced: u64,
    pub deduced_tsc: u64,
    pub deduced_act: u64,
    pub movt_no_act: u64,
}

impl TrustCounters {
    fn add(&mut self, other: &TrustCounters) {
        self.activations += other.activations;
        self.cancellations += other.cancellations;
        self.reinstates += other.reinstates;
        self.movements += other.movements;
        self.changes_of_origin += other.changes_of_origin;
        self.changes_of_id += other.changes_of_id;
        self.changes_of_location += other.changes_of_location;
        self.good_message += other.good_message;
        self.not_vstp += other.not_vstp;
        self.not_recognised += other.not_recognised;
        self.mess1_miss_hit += other.mess1_miss_hit;
        self.mess1_cape += other.mess1_cape;
        self.deferred_overflow += other.deferred_overflow;
        self.deduced_hc += other.deduced_hc;
        self.deduced_hc_replaced += other.deduced_hc_replaced;
        self.deduced_tsc += other.deduced_tsc;
        self.deduced_act += other.deduced_act;
        self.movt_no_act += other.movt_no_act;
    }
}

/// Tracks today's counters plus the running lifetime total, and decides
/// when the daily report is due (default 04:02 local, spec §4.E).
pub struct DailyStatsReport {
    pub today: TrustCounters,
    pub grand_total: TrustCounters,
    report_hour: u32,
    report_minute: u32,
    last_report_date: Option<chrono::NaiveDate>,
}

impl DailyStatsReport {
    pub fn new(report_hour: u32, report_minute: u32) -> Self {
        Self {
            today: TrustCounters::default(),
            grand_total: TrustCounters::default(),
            report_hour,
            report_minute,
            last_report_date: None,
        }
    }

    /// True once per local day, the first tick at or after
    /// `report_hour:report_minute`.
    pub fn due(&self, local_now: DateTime<chrono_tz::Tz>) -> bool {
        let today = local_now.date_naive();
        if self.last_report_date == Some(today) {
            return false;
        }
        local_now.hour() > self.report_hour
            || (local_now.hour() == self.report_hour && local_now.minute() >= self.report_minute)
    }

    /// Roll `today`'s counters into the grand total and reset the
    /// per-day accumulator, returning the snapshot to report.
    pub fn emit(&mut self, local_now: DateTime<chrono_tz::Tz>) -> TrustCounters {
        let snapshot = self.today;
        self.grand_total.add(&snapshot);
        self.today = TrustCounters::default();
        self.last_report_date = Some(local_now.date_naive());
        snapshot
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn due_fires_once_per_day_after_the_configured_hour() {
        let mut report = DailyStatsReport::new(4, 2);
        let london = chrono_tz::Europe::London;
        let before = london.with_ymd_and_hms(2023, 6, 3, 4, 1, 0).unwrap();
        let after = london.with_ymd_and_hms(2023, 6, 3, 4, 5, 0).unwrap();
        assert!(!report.due(before));
        assert!(report.due(after));
        report.emit(after);
        assert!(!report.due(after));
    }

    #[test]
    fn emit_rolls_today_into_grand_total_and_resets() {
        let mut report = DailyStatsReport::new(4, 2);
        report.today.activations = 5;
        let london = chrono_tz::Europe::London;
        let now = london.with_ymd_and_hms(2023, 6, 3, 4, 5, 0).unwrap();
        let snapshot = report.emit(now);
        assert_eq!(snapshot.activations, 5);
        assert_eq!(report.grand_total.activations, 5);
        assert_eq!(report.today.activations, 0);
    }
}
