//! TRUST frame shapes and `msg_type` dispatch (spec §4.E). Frames arrive
//! as a JSON array, or a single object, of these; `msg_queue_timestamp`
//! is the broker-side enqueue time used for latency telemetry.

use chrono::{DateTime, Utc};
use serde::Deserialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TrustMessageError {
    #[error("malformed TRUST frame: {0}")]
    Json(#[from] serde_json::Error),
    #[error("unrecognised msg_type {0:?}")]
    UnknownMsgType(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrustEventType {
    Arrival,
    Departure,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VariationStatus {
    Early,
    OnTime,
    Late,
    OffRoute,
}

#[derive(Debug, Clone)]
pub enum TrustMessage {
    Activation {
        train_id: String,
        train_uid: String,
        schedule_start_date: chrono::NaiveDate,
        schedule_end_date: chrono::NaiveDate,
        origin_stanox: Option<u32>,
        tsc: Option<String>,
        wtt_id: Option<String>,
        msg_queue_timestamp: DateTime<Utc>,
    },
    Cancellation {
        train_id: String,
        timestamp: DateTime<Utc>,
        reason_code: String,
        cancelled_stanox: Option<u32>,
        reinstate: bool,
        msg_queue_timestamp: DateTime<Utc>,
    },
    Movement {
        train_id: String,
        event_type: TrustEventType,
        planned_timestamp: DateTime<Utc>,
        actual_timestamp: DateTime<Utc>,
        loc_stanox: u32,
        platform: String,
        variation_minutes: i32,
        variation_status: VariationStatus,
        manual: bool,
        off_route: bool,
        terminated: bool,
        correction: bool,
        next_report_stanox: Option<u32>,
        next_report_run_time: Option<i32>,
        msg_queue_timestamp: DateTime<Utc>,
    },
    ChangeOfOrigin {
        train_id: String,
        timestamp: DateTime<Utc>,
        new_origin_stanox: u32,
        new_departure_time: DateTime<Utc>,
        reason_code: String,
        msg_queue_timestamp: DateTime<Utc>,
    },
    ChangeOfId {
        old_train_id: String,
        new_train_id: String,
        timestamp: DateTime<Utc>,
        msg_queue_timestamp: DateTime<Utc>,
    },
    ChangeOfLocation {
        train_id: String,
        timestamp: DateTime<Utc>,
        new_location_stanox: u32,
        msg_queue_timestamp: DateTime<Utc>,
    },
}

impl TrustMessage {
    pub fn msg_queue_timestamp(&self) -> DateTime<Utc> {
        match self {
            Self::Activation { msg_queue_timestamp, .. }
            | Self::Cancellation { msg_queue_timestamp, .. }
            | Self::Movement { msg_queue_timestamp, .. }
            | Self::ChangeOfOrigin { msg_queue_timestamp, .. }
            | Self::ChangeOfId { msg_queue_timestamp, .. }
            | Self::ChangeOfLocation { msg_queue_timestamp, .. } => *msg_queue_timestamp,
        }
    }
}

#[derive(Debug, Deserialize)]
struct RawActivation {
    train_id: String,
    train_uid: String,
    schedule_start_date: chrono::NaiveDate,
    schedule_end_date: chrono::NaiveDate,
    #[serde(default)]
    origin_stanox: Option<u32>,
    #[serde(default)]
    tsc: Option<String>,
    #[serde(default)]
    wtt_id: Option<String>,
    msg_queue_timestamp: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
struct RawCancellation {
    train_id: String,
    #[serde(rename = "canx_timestamp")]
    timestamp: DateTime<Utc>,
    #[serde(default)]
    canx_reason_code: String,
    #[serde(default)]
    canx_loc_stanox: Option<u32>,
    msg_queue_timestamp: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
struct RawMovement {
    train_id: String,
    event_type: String,
    planned_timestamp: DateTime<Utc>,
    actual_timestamp: DateTime<Utc>,
    loc_stanox: u32,
    #[serde(default)]
    platform: String,
    #[serde(default)]
    timetable_variation: i32,
    #[serde(default)]
    variation_status: String,
    #[serde(default)]
    manual_ind: bool,
    #[serde(default)]
    off_route: bool,
    #[serde(default)]
    train_terminated: bool,
    #[serde(default)]
    correction_ind: bool,
    #[serde(default)]
    next_report_stanox: Option<u32>,
    #[serde(default)]
    next_report_run_time: Option<i32>,
    msg_queue_timestamp: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
struct RawChangeOfOrigin {
    train_id: String,
    timestamp: DateTime<Utc>,
    new_loc_stanox: u32,
    new_schedule_departure_timestamp: DateTime<Utc>,
    #[serde(default)]
    canx_reason_code: String,
    msg_queue_timestamp: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
struct RawChangeOfId {
    current_train_id: String,
    train_id: String,
    timestamp: DateTime<Utc>,
    msg_queue_timestamp: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
struct RawChangeOfLocation {
    train_id: String,
    timestamp: DateTime<Utc>,
    new_loc_stanox: u32,
    msg_queue_timestamp: DateTime<Utc>,
}

fn event_type(s: &str) -> TrustEventType {
    match s.to_ascii_uppercase().as_str() {
        "DEPARTURE" => TrustEventType::Departure,
        _ => TrustEventType::Arrival,
    }
}

fn variation_status(s: &str, off_route: bool) -> VariationStatus {
    if off_route {
        return VariationStatus::OffRoute;
    }
    match s.to_ascii_uppercase().as_str() {
        "EARLY" => VariationStatus::Early,
        "LATE" => VariationStatus::Late,
        "OFF ROUTE" | "OFF_ROUTE" => VariationStatus::OffRoute,
        _ => VariationStatus::OnTime,
    }
}

/// Parse one JSON object with a `msg_type` discriminator into a
/// `TrustMessage`. Frames containing several messages are an array at
/// the caller's level; this parses a single element.
pub fn parse_message(value: &serde_json::Value) -> Result<TrustMessage, TrustMessageError> {
    let msg_type = value
        .get("msg_type")
        .and_then(|v| v.as_str())
        .ok_or_else(|| TrustMessageError::UnknownMsgType("<missing>".to_string()))?
        .to_string();
    match msg_type.as_str() {
        "0001" => {
            let raw: RawActivation = serde_json::from_value(value.clone())?;
            Ok(TrustMessage::Activation {
                train_id: raw.train_id,
                train_uid: raw.train_uid,
                schedule_start_date: raw.schedule_start_date,
                schedule_end_date: raw.schedule_end_date,
                origin_stanox: raw.origin_stanox,
                tsc: raw.tsc,
                wtt_id: raw.wtt_id,
                msg_queue_timestamp: raw.msg_queue_timestamp,
            })
        }
        "0002" | "0005" => {
            let raw: RawCancellation = serde_json::from_value(value.clone())?;
            Ok(TrustMessage::Cancellation {
                train_id: raw.train_id,
                timestamp: raw.timestamp,
                reason_code: raw.canx_reason_code,
                cancelled_stanox: raw.canx_loc_stanox,
                reinstate: msg_type == "0005",
                msg_queue_timestamp: raw.msg_queue_timestamp,
            })
        }
        "0003" => {
            let raw: RawMovement = serde_json::from_value(value.clone())?;
            Ok(TrustMessage::Movement {
                train_id: raw.train_id,
                event_type: event_type(&raw.event_type),
                planned_timestamp: raw.planned_timestamp,
                actual_timestamp: raw.actual_timestamp,
                loc_stanox: raw.loc_stanox,
                platform: raw.platform,
                variation_minutes: raw.timetable_variation,
                variation_status: variation_status(&raw.variation_status, raw.off_route),
                manual: raw.manual_ind,
                off_route: raw.off_route,
                terminated: raw.train_terminated,
                correction: raw.correction_ind,
                next_report_stanox: raw.next_report_stanox,
                next_report_run_time: raw.next_report_run_time,
                msg_queue_timestamp: raw.msg_queue_timestamp,
            })
        }
        "0006" => {
            let raw: RawChangeOfOrigin = serde_json::from_value(value.clone())?;
            Ok(TrustMessage::ChangeOfOrigin {
                train_id: raw.train_id,
                timestamp: raw.timestamp,
                new_origin_stanox: raw.new_loc_stanox,
                new_departure_time: raw.new_schedule_departure_timestamp,
                reason_code: raw.canx_reason_code,
                msg_queue_timestamp: raw.msg_queue_timestamp,
            })
        }
        "0007" => {
            let raw: RawChangeOfId = serde_json::from_value(value.clone())?;
            Ok(TrustMessage::ChangeOfId {
                old_train_id: raw.current_train_id,
                new_train_id: raw.train_id,
                timestamp: raw.timestamp,
                msg_queue_timestamp: raw.msg_queue_timestamp,
            })
        }
        "0008" => {
            let raw: RawChangeOfLocation = serde_json::from_value(value.clone())?;
            Ok(TrustMessage::ChangeOfLocation {
                train_id: raw.train_id,
                timestamp: raw.timestamp,
                new_location_stanox: raw.new_loc_stanox,
                msg_queue_timestamp: raw.msg_queue_timestamp,
            })
        }
        other => Err(TrustMessageError::UnknownMsgType(other.to_string())),
    }
}

/// Parse a whole frame body: either a single message object or an array.
pub fn parse_frame(json: &str) -> Result<Vec<TrustMessage>, TrustMessageError> {
    let value: serde_json::Value = serde_json::from_str(json)?;
    match value {
        serde_json::Value::Array(items) => items.iter().map(parse_message).collect(),
        single => Ok(vec![parse_message(&single)?]),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_activation() {
        let json = r#"{"msg_type":"0001","train_id":"122P12345678","train_uid":"C12345",
            "schedule_start_date":"2023-06-03","schedule_end_date":"2023-06-10",
            "msg_queue_timestamp":"2023-06-03T09:00:00Z"}"#;
        let msgs = parse_frame(json).unwrap();
        assert_eq!(msgs.len(), 1);
        assert!(matches!(msgs[0], TrustMessage::Activation { .. }));
    }

    #[test]
    fn rejects_unknown_msg_type() {
        let json = r#"{"msg_type":"0099"}"#;
        assert!(matches!(parse_frame(json), Err(TrustMessageError::UnknownMsgType(_))));
    }

    #[test]
    fn parses_array_of_mixed_messages() {
        let json = r#"[
            {"msg_type":"0002","train_id":"122P12345678","canx_timestamp":"2023-06-03T09:00:00Z","msg_queue_timestamp":"2023-06-03T09:00:01Z"},
            {"msg_type":"0005","train_id":"122P12345678","canx_timestamp":"2023-06-03T09:05:00Z","msg_queue_timestamp":"2023-06-03T09:05:01Z"}
        ]"#;
        let msgs = parse_frame(json).unwrap();
        assert_eq!(msgs.len(), 2);
        match &msgs[1] {
            TrustMessage::Cancellation { reinstate, .. } => assert!(reinstate),
            other => panic!("expected Cancellation, got {other:?}"),
        }
    }
}
