//! CIF record shapes, reworked from the teacher crate's `types.rs` to
//! cover every record this platform needs (BS/BX/LO/LI/LT/CR/AA), not
//! just the header/TIPLOC records the original parser stubbed out.

use chrono::{NaiveDate, NaiveTime};
use getset::Getters;

#[derive(Debug, Clone, Default, Getters)]
pub struct CIFFile {
    #[getset(get = "pub")]
    records: Vec<CIFRecord>,
}

impl CIFFile {
    pub(crate) fn new() -> Self {
        Self { records: vec![] }
    }

    pub(crate) fn push(&mut self, record: CIFRecord) {
        self.records.push(record);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CIFUpdateIndicator {
    Update,
    Full,
}

#[derive(Debug, Clone)]
pub enum CIFRecord {
    Header {
        file_mainframe_identity: String,
        date_of_extract: NaiveDate,
        time_of_extract: NaiveTime,
        current_file_reference: String,
        last_file_reference: String,
        update_indicator: CIFUpdateIndicator,
        version: char,
        user_start_date: NaiveDate,
        user_end_date: NaiveDate,
    },
    TIPLOCInsert {
        tiploc: String,
        nlc: u32,
        tps_description: String,
        stanox: u32,
        three_alpha_code: String,
    },
    TIPLOCAmend {
        tiploc: String,
        nlc: u32,
        tps_description: String,
        stanox: u32,
        three_alpha_code: String,
        new_tiploc: String,
    },
    TIPLOCDelete {
        tiploc: String,
    },
    /// `BS` basic schedule (spec §4.C, field offsets spec §6).
    BasicSchedule {
        transaction_type: char,
        train_uid: String,
        date_runs_from: String,
        date_runs_to: String,
        days_run: String,
        bank_holiday_running: char,
        train_status: char,
        train_category: String,
        signalling_id: String,
        headcode: String,
        service_code: String,
        power_type: String,
        timing_load: String,
        speed: String,
        operating_characteristics: String,
        train_class: char,
        sleepers: char,
        reservations: char,
        catering_code: String,
        branding: String,
        stp_indicator: char,
    },
    /// `BX` basic schedule extra.
    BasicScheduleExtra {
        uic_code: String,
        atoc_code: String,
        applicable_timetable_code: char,
    },
    /// `LO` origin location.
    LocationOrigin {
        tiploc: String,
        tiploc_instance: char,
        scheduled_departure: String,
        public_departure: String,
        platform: String,
        line: String,
        engineering_allowance: String,
        pathing_allowance: String,
        activity: String,
        performance_allowance: String,
    },
    /// `LI` intermediate location.
    LocationIntermediate {
        tiploc: String,
        tiploc_instance: char,
        scheduled_arrival: String,
        scheduled_departure: String,
        scheduled_pass: String,
        public_arrival: String,
        public_departure: String,
        platform: String,
        line: String,
        path: String,
        activity: String,
        engineering_allowance: String,
        pathing_allowance: String,
        performance_allowance: String,
    },
    /// `LT` terminus location.
    LocationTerminus {
        tiploc: String,
        tiploc_instance: char,
        scheduled_arrival: String,
        public_arrival: String,
        platform: String,
        path: String,
        activity: String,
    },
    /// `CR` change en route.
    ChangeEnRoute {
        tiploc: String,
        tiploc_instance: char,
        train_category: String,
        headcode: String,
        service_code: String,
        power_type: String,
        timing_load: String,
    },
    /// `AA` association.
    Association {
        transaction_type: char,
        main_uid: String,
        assoc_uid: String,
        assoc_start_date: String,
        assoc_end_date: String,
        days_run: String,
        category: String,
        location: String,
        stp_indicator: char,
    },
    Trailer,
}

impl CIFRecord {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Header { .. } => "HD",
            Self::TIPLOCInsert { .. } => "TI",
            Self::TIPLOCAmend { .. } => "TA",
            Self::TIPLOCDelete { .. } => "TD",
            Self::BasicSchedule { .. } => "BS",
            Self::BasicScheduleExtra { .. } => "BX",
            Self::LocationOrigin { .. } => "LO",
            Self::LocationIntermediate { .. } => "LI",
            Self::LocationTerminus { .. } => "LT",
            Self::ChangeEnRoute { .. } => "CR",
            Self::Association { .. } => "AA",
            Self::Trailer => "ZZ",
        }
    }
}
