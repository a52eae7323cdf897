//! Fixed-width line parsing for the 80-column CIF card format (spec §4.C,
//! bit-exact offsets spec §6). Offsets below are 0-indexed start, inclusive
//! end, matching `extract_field_s(card, start, length)` calls in the
//! original loader's source rather than the published BR 220 spec's
//! 1-indexed column numbers — confirmed against the header timestamp
//! fields, which are unambiguous in both documents.

use chrono::NaiveDate;
use thiserror::Error;

use super::types::{CIFRecord, CIFUpdateIndicator};

#[derive(Debug, Error)]
pub enum CIFParseError {
    #[error("line {0} is shorter than the minimum card length for a {1} record")]
    TooShort(usize, &'static str),
    #[error("line {0}: unrecognised record identity {1:?}")]
    UnknownRecordType(usize, String),
    #[error("line {0}: invalid date {1:?}")]
    BadDate(usize, String),
    #[error("line {0}: invalid update indicator {1:?}")]
    BadUpdateIndicator(usize, String),
}

/// Slice `line` at a 0-indexed, inclusive `[start, end]` column range,
/// trimming trailing spaces. Panics are impossible: short lines are
/// padded first by `parse_card`.
fn field(line: &str, start: usize, end_inclusive: usize) -> String {
    line.chars()
        .skip(start)
        .take(end_inclusive + 1 - start)
        .collect::<String>()
        .trim_end()
        .to_string()
}

fn char_at(line: &str, idx: usize) -> char {
    line.chars().nth(idx).unwrap_or(' ')
}

/// Parse a `yymmdd` CIF date, pivoting the two-digit year at 60 (spec
/// §9: the format predates 2000 and never needed a four-digit year).
/// `999999` is the "not deleted" / open-ended sentinel and has no date
/// value, so it parses to `None` like any other malformed string.
pub fn parse_cif_date(s: &str) -> Option<NaiveDate> {
    if s.trim().is_empty() || s.len() < 6 {
        return None;
    }
    let yy: i32 = s[0..2].parse().ok()?;
    let mm: u32 = s[2..4].parse().ok()?;
    let dd: u32 = s[4..6].parse().ok()?;
    let year = if yy < 60 { 2000 + yy } else { 1900 + yy };
    NaiveDate::from_ymd_opt(year, mm, dd)
}

fn cif_date(line_no: usize, s: &str) -> Result<NaiveDate, CIFParseError> {
    parse_cif_date(s).ok_or_else(|| CIFParseError::BadDate(line_no, s.to_string()))
}

/// Parse one 80-column (or shorter, space-padded) card into a `CIFRecord`.
/// `line_no` is 1-based, used only for error messages.
pub fn parse_card(line_no: usize, raw: &str) -> Result<CIFRecord, CIFParseError> {
    let mut line = raw.trim_end_matches(['\r', '\n']).to_string();
    if line.len() < 80 {
        line.push_str(&" ".repeat(80 - line.len()));
    }
    let kind = field(&line, 0, 1);
    match kind.as_str() {
        "HD" => parse_header(line_no, &line),
        "TI" => Ok(CIFRecord::TIPLOCInsert {
            tiploc: field(&line, 2, 8),
            nlc: field(&line, 11, 16).trim().parse().unwrap_or(0),
            tps_description: field(&line, 18, 43),
            stanox: field(&line, 44, 48).trim().parse().unwrap_or(0),
            three_alpha_code: field(&line, 53, 55),
        }),
        "TA" => Ok(CIFRecord::TIPLOCAmend {
            tiploc: field(&line, 2, 8),
            nlc: field(&line, 11, 16).trim().parse().unwrap_or(0),
            tps_description: field(&line, 18, 43),
            stanox: field(&line, 44, 48).trim().parse().unwrap_or(0),
            three_alpha_code: field(&line, 53, 55),
            new_tiploc: field(&line, 71, 77),
        }),
        "TD" => Ok(CIFRecord::TIPLOCDelete { tiploc: field(&line, 2, 8) }),
        "BS" => parse_basic_schedule(line_no, &line),
        "BX" => Ok(CIFRecord::BasicScheduleExtra {
            uic_code: field(&line, 6, 10),
            atoc_code: field(&line, 11, 12),
            applicable_timetable_code: char_at(&line, 13),
        }),
        "LO" => Ok(CIFRecord::LocationOrigin {
            tiploc: field(&line, 2, 8),
            tiploc_instance: char_at(&line, 9),
            scheduled_departure: field(&line, 10, 14),
            public_departure: field(&line, 15, 18),
            platform: field(&line, 19, 21),
            line: field(&line, 22, 24),
            engineering_allowance: field(&line, 25, 26),
            pathing_allowance: field(&line, 27, 28),
            activity: field(&line, 29, 40),
            performance_allowance: field(&line, 41, 42),
        }),
        "LI" => Ok(CIFRecord::LocationIntermediate {
            tiploc: field(&line, 2, 8),
            tiploc_instance: char_at(&line, 9),
            scheduled_arrival: field(&line, 10, 14),
            scheduled_departure: field(&line, 15, 19),
            scheduled_pass: field(&line, 20, 24),
            public_arrival: field(&line, 25, 28),
            public_departure: field(&line, 29, 32),
            platform: field(&line, 33, 35),
            line: field(&line, 36, 38),
            path: field(&line, 39, 41),
            activity: field(&line, 42, 53),
            engineering_allowance: field(&line, 54, 55),
            pathing_allowance: field(&line, 56, 57),
            performance_allowance: field(&line, 58, 59),
        }),
        "LT" => Ok(CIFRecord::LocationTerminus {
            tiploc: field(&line, 2, 8),
            tiploc_instance: char_at(&line, 9),
            scheduled_arrival: field(&line, 10, 14),
            public_arrival: field(&line, 15, 18),
            platform: field(&line, 19, 21),
            path: field(&line, 22, 24),
            activity: field(&line, 25, 36),
        }),
        "CR" => Ok(CIFRecord::ChangeEnRoute {
            tiploc: field(&line, 2, 8),
            tiploc_instance: char_at(&line, 9),
            train_category: field(&line, 10, 11),
            headcode: field(&line, 16, 19),
            service_code: field(&line, 21, 28),
            power_type: field(&line, 30, 32),
            timing_load: field(&line, 33, 36),
        }),
        "AA" => parse_association(line_no, &line),
        "ZZ" => Ok(CIFRecord::Trailer),
        other => Err(CIFParseError::UnknownRecordType(line_no, other.to_string())),
    }
}

fn parse_header(line_no: usize, line: &str) -> Result<CIFRecord, CIFParseError> {
    if line.trim().len() < 30 {
        return Err(CIFParseError::TooShort(line_no, "HD"));
    }
    let dd = field(line, 22, 23);
    let mm = field(line, 24, 25);
    let yy = field(line, 26, 27);
    let hh = field(line, 28, 29);
    let mi = field(line, 30, 31);
    let date_of_extract = cif_date(line_no, &format!("{yy}{mm}{dd}"))?;
    let hour: u32 = hh.trim().parse().unwrap_or(0);
    let minute: u32 = mi.trim().parse().unwrap_or(0);
    let time_of_extract = chrono::NaiveTime::from_hms_opt(hour, minute, 0)
        .ok_or_else(|| CIFParseError::BadDate(line_no, format!("{hh}{mi}")))?;
    let update_indicator = match char_at(line, 46) {
        'U' => CIFUpdateIndicator::Update,
        'F' => CIFUpdateIndicator::Full,
        other => return Err(CIFParseError::BadUpdateIndicator(line_no, other.to_string())),
    };
    Ok(CIFRecord::Header {
        file_mainframe_identity: field(line, 2, 21),
        date_of_extract,
        time_of_extract,
        current_file_reference: field(line, 32, 38),
        last_file_reference: field(line, 39, 45),
        update_indicator,
        version: char_at(line, 47),
        user_start_date: cif_date(line_no, &field(line, 48, 53)).unwrap_or(date_of_extract),
        user_end_date: cif_date(line_no, &field(line, 54, 59)).unwrap_or(date_of_extract),
    })
}

fn parse_basic_schedule(line_no: usize, line: &str) -> Result<CIFRecord, CIFParseError> {
    let transaction_type = char_at(line, 2);
    if !matches!(transaction_type, 'N' | 'R' | 'D') {
        return Err(CIFParseError::BadUpdateIndicator(line_no, transaction_type.to_string()));
    }
    Ok(CIFRecord::BasicSchedule {
        transaction_type,
        train_uid: field(line, 3, 8),
        date_runs_from: field(line, 9, 14),
        date_runs_to: field(line, 15, 20),
        days_run: field(line, 21, 27),
        bank_holiday_running: char_at(line, 28),
        train_status: char_at(line, 29),
        train_category: field(line, 30, 31),
        signalling_id: field(line, 32, 35),
        headcode: field(line, 36, 39),
        service_code: field(line, 41, 48),
        power_type: field(line, 50, 52),
        timing_load: field(line, 53, 56),
        speed: field(line, 57, 59),
        operating_characteristics: field(line, 60, 65),
        train_class: char_at(line, 66),
        sleepers: char_at(line, 67),
        reservations: char_at(line, 68),
        catering_code: field(line, 70, 73),
        branding: field(line, 74, 77),
        stp_indicator: char_at(line, 79),
    })
}

fn parse_association(line_no: usize, line: &str) -> Result<CIFRecord, CIFParseError> {
    let transaction_type = char_at(line, 2);
    if !matches!(transaction_type, 'N' | 'R' | 'D') {
        return Err(CIFParseError::BadUpdateIndicator(line_no, transaction_type.to_string()));
    }
    Ok(CIFRecord::Association {
        transaction_type,
        main_uid: field(line, 3, 8),
        assoc_uid: field(line, 9, 14),
        assoc_start_date: field(line, 15, 20),
        assoc_end_date: field(line, 21, 26),
        days_run: field(line, 27, 33),
        category: field(line, 34, 35),
        location: field(line, 37, 43),
        stp_indicator: char_at(line, 79),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Build an 80-column card by dropping `text` at 0-indexed `at`,
    /// space-padding everywhere else, avoiding hand-counted literals.
    fn card(fields: &[(usize, &str)]) -> String {
        let mut line: Vec<char> = vec![' '; 80];
        for (at, text) in fields {
            for (i, c) in text.chars().enumerate() {
                line[at + i] = c;
            }
        }
        line.into_iter().collect()
    }

    #[test]
    fn parses_basic_schedule_transaction_type_and_uid() {
        let line = card(&[(0, "BS"), (2, "N"), (3, "C12345"), (79, "O")]);
        let rec = parse_card(1, &line).unwrap();
        match rec {
            CIFRecord::BasicSchedule { transaction_type, train_uid, stp_indicator, .. } => {
                assert_eq!(transaction_type, 'N');
                assert_eq!(train_uid, "C12345");
                assert_eq!(stp_indicator, 'O');
            }
            other => panic!("expected BasicSchedule, got {other:?}"),
        }
    }

    #[test]
    fn rejects_unknown_record_type() {
        let line = card(&[(0, "XX")]);
        assert!(matches!(parse_card(1, &line), Err(CIFParseError::UnknownRecordType(1, _))));
    }

    #[test]
    fn rejects_bad_transaction_type() {
        let line = card(&[(0, "BS"), (2, "Z"), (3, "C12345")]);
        assert!(matches!(parse_card(1, &line), Err(CIFParseError::BadUpdateIndicator(1, _))));
    }

    #[test]
    fn parses_header_timestamp_fields() {
        // dd=03 mm=06 yy=23, hh=14 mi=05, update indicator 'U' at col 46
        let line = card(&[(0, "HD"), (22, "03"), (24, "06"), (26, "23"), (28, "14"), (30, "05"), (46, "U")]);
        let rec = parse_card(1, &line).unwrap();
        match rec {
            CIFRecord::Header { date_of_extract, time_of_extract, update_indicator, .. } => {
                assert_eq!(date_of_extract, NaiveDate::from_ymd_opt(2023, 6, 3).unwrap());
                assert_eq!(time_of_extract.format("%H:%M").to_string(), "14:05");
                assert_eq!(update_indicator, CIFUpdateIndicator::Update);
            }
            other => panic!("expected Header, got {other:?}"),
        }
    }

    #[test]
    fn parses_origin_location_times() {
        let line = card(&[(0, "LO"), (2, "EUSTON"), (10, "1000"), (15, "1000")]);
        let rec = parse_card(1, &line).unwrap();
        match rec {
            CIFRecord::LocationOrigin { tiploc, scheduled_departure, public_departure, .. } => {
                assert_eq!(tiploc, "EUSTON");
                assert_eq!(scheduled_departure, "1000");
                assert_eq!(public_departure, "1000");
            }
            other => panic!("expected LocationOrigin, got {other:?}"),
        }
    }

    #[test]
    fn parses_association_uids_and_location() {
        let line = card(&[(0, "AA"), (2, "N"), (3, "C12345"), (9, "C54321"), (37, "EUSTON "), (79, "P")]);
        let rec = parse_card(1, &line).unwrap();
        match rec {
            CIFRecord::Association { main_uid, assoc_uid, location, stp_indicator, .. } => {
                assert_eq!(main_uid, "C12345");
                assert_eq!(assoc_uid, "C54321");
                assert_eq!(location, "EUSTON");
                assert_eq!(stp_indicator, 'P');
            }
            other => panic!("expected Association, got {other:?}"),
        }
    }
}
