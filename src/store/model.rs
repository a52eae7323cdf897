//! Row shapes for every table in spec §3. Soft-deletion and the `999999`
//! CIF date sentinel are represented with `Option` at this layer (spec
//! §9 design note); the SQL boundary translates to/from the wire
//! sentinels (`store::pg`).

use chrono::{DateTime, NaiveDate, Utc};

/// STP precedence order is `O > N > P > C` (spec §3 invariant, §8.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StpIndicator {
    Overlay,
    New,
    Permanent,
    Cancellation,
}

impl StpIndicator {
    pub fn from_char(c: char) -> Option<Self> {
        match c {
            'O' => Some(Self::Overlay),
            'N' => Some(Self::New),
            'P' => Some(Self::Permanent),
            'C' => Some(Self::Cancellation),
            _ => None,
        }
    }

    pub fn as_char(&self) -> char {
        match self {
            Self::Overlay => 'O',
            Self::New => 'N',
            Self::Permanent => 'P',
            Self::Cancellation => 'C',
        }
    }

    /// Lower is preferred, matching the resolver's exact tie-break
    /// (spec §3 invariant, §8.1).
    pub fn precedence_rank(&self) -> u8 {
        match self {
            Self::Overlay => 0,
            Self::New => 1,
            Self::Permanent => 2,
            Self::Cancellation => 3,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceKind {
    DailyUpdate,
    Full,
    Vstp,
}

impl SourceKind {
    pub fn as_i16(&self) -> i16 {
        match self {
            Self::DailyUpdate => 1,
            Self::Full => 2,
            Self::Vstp => 0,
        }
    }

    pub fn from_i16(v: i16) -> Option<Self> {
        match v {
            1 => Some(Self::DailyUpdate),
            2 => Some(Self::Full),
            0 => Some(Self::Vstp),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScheduleKey {
    pub train_uid: String,
    pub schedule_start_date: NaiveDate,
    pub schedule_end_date: NaiveDate,
    pub stp_indicator: Option<StpIndicator>,
}

#[derive(Debug, Clone)]
pub struct NewSchedule {
    pub train_uid: String,
    pub stp_indicator: StpIndicator,
    pub schedule_start_date: NaiveDate,
    pub schedule_end_date: NaiveDate,
    pub days_run: u8,
    pub atoc_code: String,
    pub uic_code: String,
    pub category: String,
    pub signalling_id: String,
    pub headcode: String,
    pub service_code: String,
    pub power_type: String,
    pub speed: String,
    pub train_class: char,
    pub update_id: i64,
    pub created: DateTime<Utc>,
    pub deduced_headcode: String,
    pub deduced_headcode_status: Option<char>,
}

#[derive(Debug, Clone)]
pub struct Schedule {
    pub id: i64,
    pub train_uid: String,
    pub stp_indicator: StpIndicator,
    pub schedule_start_date: NaiveDate,
    pub schedule_end_date: NaiveDate,
    pub days_run: u8,
    pub atoc_code: String,
    pub uic_code: String,
    pub category: String,
    pub signalling_id: String,
    pub headcode: String,
    pub service_code: String,
    pub power_type: String,
    pub speed: String,
    pub train_class: char,
    pub update_id: i64,
    pub created: DateTime<Utc>,
    pub deleted: Option<DateTime<Utc>>,
    pub deduced_headcode: String,
    pub deduced_headcode_status: Option<char>,
}

impl Schedule {
    pub fn is_vstp(&self) -> bool {
        self.update_id == 0
    }

    pub fn is_live(&self, now: DateTime<Utc>) -> bool {
        self.deleted.map(|d| d > now).unwrap_or(true)
    }

    pub fn runs_on(&self, weekday_bit: u8) -> bool {
        self.days_run & weekday_bit != 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LocationRecordType {
    Origin,
    Intermediate,
    Terminus,
}

#[derive(Debug, Clone)]
pub struct NewScheduleLocation {
    pub schedule_id: i64,
    pub record_type: LocationRecordType,
    pub tiploc: String,
    pub tiploc_instance: char,
    pub activities: String,
    pub arrival: Option<crate::time::CifTime>,
    pub departure: Option<crate::time::CifTime>,
    pub pass: Option<crate::time::CifTime>,
    pub public_arrival: Option<String>,
    pub public_departure: Option<String>,
    pub platform: String,
    pub line: String,
    pub path: String,
    pub engineering_allowance: String,
    pub pathing_allowance: String,
    pub performance_allowance: String,
}

#[derive(Debug, Clone)]
pub struct ScheduleLocation {
    pub id: i64,
    pub schedule_id: i64,
    pub record_type: LocationRecordType,
    pub tiploc: String,
    pub tiploc_instance: char,
    pub activities: String,
    pub arrival: Option<crate::time::CifTime>,
    pub departure: Option<crate::time::CifTime>,
    pub pass: Option<crate::time::CifTime>,
    pub public_arrival: Option<String>,
    pub public_departure: Option<String>,
    pub sort_time: u32,
    pub next_day: bool,
    pub platform: String,
    pub line: String,
    pub path: String,
    pub engineering_allowance: String,
    pub pathing_allowance: String,
    pub performance_allowance: String,
}

impl PartialEq for ScheduleLocation {
    /// Record-for-record identity used by the reconciler (spec §4.F
    /// step 3: "location list is identical record-for-record"). Ignores
    /// surrogate ids, which differ between the store row and a freshly
    /// parsed candidate.
    fn eq(&self, other: &Self) -> bool {
        self.record_type == other.record_type
            && self.tiploc == other.tiploc
            && self.tiploc_instance == other.tiploc_instance
            && self.activities == other.activities
            && self.arrival == other.arrival
            && self.departure == other.departure
            && self.pass == other.pass
            && self.platform == other.platform
            && self.line == other.line
    }
}

#[derive(Debug, Clone)]
pub struct NewChangeEnRoute {
    pub schedule_id: i64,
    pub tiploc: String,
    pub category: String,
    pub headcode: String,
    pub service_code: String,
    pub power_type: String,
    pub timing_load: String,
}

#[derive(Debug, Clone)]
pub struct AssociationKey {
    pub main_uid: String,
    pub assoc_uid: String,
    pub assoc_start_date: NaiveDate,
    pub location: String,
    pub stp_indicator: Option<StpIndicator>,
}

#[derive(Debug, Clone)]
pub struct NewAssociation {
    pub main_uid: String,
    pub assoc_uid: String,
    pub assoc_start_date: NaiveDate,
    pub assoc_end_date: NaiveDate,
    pub days_run: u8,
    pub category: String,
    pub location: String,
    pub stp_indicator: StpIndicator,
    pub created: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct Tiploc {
    pub tiploc: String,
    pub nalco: u32,
    pub tps_description: String,
    pub stanox: u32,
    pub three_alpha: String,
}

#[derive(Debug, Clone)]
pub struct NewActivation {
    pub train_id: String,
    pub schedule_id: i64,
    pub train_uid: String,
    pub schedule_start_date: NaiveDate,
    pub schedule_end_date: NaiveDate,
    pub created: DateTime<Utc>,
    pub deduced: bool,
    pub origin_stanox: Option<u32>,
    pub tsc: Option<String>,
    pub wtt_id: Option<String>,
}

#[derive(Debug, Clone)]
pub struct Activation {
    pub id: i64,
    pub train_id: String,
    pub schedule_id: i64,
    pub train_uid: String,
    pub schedule_start_date: NaiveDate,
    pub schedule_end_date: NaiveDate,
    pub created: DateTime<Utc>,
    pub deduced: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    Departure,
    Arrival,
    ArrivalAtDestination,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VariationBucket {
    Early,
    OnTime,
    Late,
    OffRoute,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MovementSource {
    Auto,
    Manual,
}

/// The movement `flags` bit-packing of spec §4.E, modelled as a
/// structured type and translated to/from the single word only at the
/// store boundary (spec §9 open question).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MovementFlags {
    pub event_kind: EventKind,
    pub source: MovementSource,
    pub variation_bucket: VariationBucket,
    pub off_route: bool,
    pub terminated: bool,
    pub correction: bool,
}

impl MovementFlags {
    pub fn to_bits(self) -> u8 {
        let mut bits: u8 = match self.event_kind {
            EventKind::Departure => 1,
            EventKind::Arrival => 2,
            EventKind::ArrivalAtDestination => 3,
        };
        if self.source == MovementSource::Manual {
            bits |= 1 << 2;
        }
        let variation = match self.variation_bucket {
            VariationBucket::Early => 0u8,
            VariationBucket::OnTime => 1,
            VariationBucket::Late => 2,
            VariationBucket::OffRoute => 3,
        };
        bits |= variation << 3;
        if self.off_route {
            bits |= 1 << 5;
        }
        if self.terminated {
            bits |= 1 << 6;
        }
        if self.correction {
            bits |= 1 << 7;
        }
        bits
    }

    pub fn from_bits(bits: u8) -> Option<Self> {
        let event_kind = match bits & 0b11 {
            1 => EventKind::Departure,
            2 => EventKind::Arrival,
            3 => EventKind::ArrivalAtDestination,
            _ => return None,
        };
        let source = if bits & (1 << 2) != 0 {
            MovementSource::Manual
        } else {
            MovementSource::Auto
        };
        let variation_bucket = match (bits >> 3) & 0b11 {
            0 => VariationBucket::Early,
            1 => VariationBucket::OnTime,
            2 => VariationBucket::Late,
            3 => VariationBucket::OffRoute,
            _ => unreachable!(),
        };
        Some(Self {
            event_kind,
            source,
            variation_bucket,
            off_route: bits & (1 << 5) != 0,
            terminated: bits & (1 << 6) != 0,
            correction: bits & (1 << 7) != 0,
        })
    }
}

#[derive(Debug, Clone)]
pub struct NewMovement {
    pub train_id: String,
    pub flags: MovementFlags,
    pub planned_timestamp: DateTime<Utc>,
    pub actual_timestamp: DateTime<Utc>,
    pub variation_minutes: i32,
    pub platform: String,
    pub stanox: u32,
    pub next_report_stanox: Option<u32>,
    pub next_report_run_time: Option<i32>,
}

#[derive(Debug, Clone)]
pub struct NewCancellation {
    pub train_id: String,
    pub timestamp: DateTime<Utc>,
    pub reason_code: String,
    pub cancelled_stanox: Option<u32>,
    pub reinstate: bool,
}

#[derive(Debug, Clone)]
pub struct NewChangeOfOrigin {
    pub train_id: String,
    pub timestamp: DateTime<Utc>,
    pub new_origin_stanox: u32,
    pub new_departure_time: DateTime<Utc>,
    pub reason_code: String,
}

#[derive(Debug, Clone)]
pub struct NewChangeOfId {
    pub old_train_id: String,
    pub new_train_id: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewChangeOfLocation {
    pub train_id: String,
    pub timestamp: DateTime<Utc>,
    pub new_location_stanox: u32,
}

#[derive(Debug, Clone, Default)]
pub struct Status {
    pub trust_processed: Option<DateTime<Utc>>,
    pub trust_wall_clock: Option<DateTime<Utc>>,
    pub vstp_processed: Option<DateTime<Utc>>,
    pub td_processed: Option<DateTime<Utc>>,
}

/// Rolling 24-hour obfuscated-headcode reverse lookup (spec §3, §4.E).
#[derive(Debug, Clone)]
pub struct ObfusLookupEntry {
    pub recorded_at: DateTime<Utc>,
    pub true_headcode: String,
    pub obfuscated_headcode: String,
}
