//! Quarter-minute quantisation of CIF/VSTP `hhmm[H]` times (spec §3, §8.6)
//! and the TRUST daylight-saving timestamp correction (spec §4.E, §9).

use chrono::{DateTime, Offset, Utc};
use chrono_tz::Tz;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TimeParseError {
    #[error("malformed hhmm time '{0}'")]
    Malformed(String),
}

/// A schedule location time as carried in CIF/VSTP: hour, minute, and
/// whether the half-minute (`H`) suffix was present.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct CifTime {
    pub hour: u8,
    pub minute: u8,
    pub half: bool,
}

impl CifTime {
    /// Parse a 4 or 5 character `hhmm` / `hhmmH` field. VSTP also uses a
    /// trailing `3` to denote the half-minute (spec §4.D); both map to
    /// the same representation.
    pub fn parse(raw: &str) -> Result<Self, TimeParseError> {
        let raw = raw.trim_end();
        if raw.len() < 4 {
            return Err(TimeParseError::Malformed(raw.to_string()));
        }
        let hour: u8 = raw[0..2]
            .parse()
            .map_err(|_| TimeParseError::Malformed(raw.to_string()))?;
        let minute: u8 = raw[2..4]
            .parse()
            .map_err(|_| TimeParseError::Malformed(raw.to_string()))?;
        let half = match raw.as_bytes().get(4) {
            None | Some(b' ') => false,
            Some(b'H') | Some(b'3') => true,
            _ => return Err(TimeParseError::Malformed(raw.to_string())),
        };
        if hour > 27 || minute > 59 {
            return Err(TimeParseError::Malformed(raw.to_string()));
        }
        Ok(Self { hour, minute, half })
    }

    /// Quarter-minute-of-day quantisation: `(hh*60 + mm)*4 + (H ? 2 : 0)`
    /// (spec §8 testable property 6).
    pub fn sort_time(&self) -> u32 {
        (self.hour as u32 * 60 + self.minute as u32) * 4 + if self.half { 2 } else { 0 }
    }

    /// Reconstruct an `CifTime` from a `sort_time`, the inverse of
    /// [`CifTime::sort_time`]. Loses nothing beyond the half-minute
    /// granularity that `sort_time` itself already collapses to.
    pub fn from_sort_time(sort_time: u32) -> Self {
        let half = sort_time % 4 >= 2;
        let minute_of_day = sort_time / 4;
        Self {
            hour: (minute_of_day / 60) as u8,
            minute: (minute_of_day % 60) as u8,
            half,
        }
    }
}

/// TRUST timestamps arrive in a local-epoch convention that runs one
/// hour fast during daylight saving (spec §4.E, §9). Kept behind a
/// single helper, parameterised on the time zone so tests can pick a
/// fixed DST window instead of depending on wall-clock "now".
pub fn correct_trust_timestamp(raw: DateTime<Utc>, local_tz: Tz) -> DateTime<Utc> {
    let local = raw.with_timezone(&local_tz);
    if local.offset().fix().local_minus_utc() != 0 {
        raw - chrono::Duration::seconds(3600)
    } else {
        raw
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn sort_time_round_trips() {
        for hour in 0..28u8 {
            for minute in 0..60u8 {
                for half in [false, true] {
                    let t = CifTime { hour, minute, half };
                    let st = t.sort_time();
                    assert_eq!(st, (hour as u32 * 60 + minute as u32) * 4 + if half { 2 } else { 0 });
                    assert_eq!(CifTime::from_sort_time(st), t);
                }
            }
        }
    }

    #[test]
    fn parses_half_minute_suffix() {
        let t = CifTime::parse("1830H").unwrap();
        assert_eq!(t, CifTime { hour: 18, minute: 30, half: true });
        assert_eq!(t.sort_time(), 4322);
    }

    #[test]
    fn quarter_minute_quantisation_matches_minutes_since_midnight() {
        assert_eq!(CifTime::parse("1000").unwrap().sort_time(), 2400);
        assert_eq!(CifTime::parse("1800").unwrap().sort_time(), 4320);
        assert_eq!(CifTime::parse("1830").unwrap().sort_time(), 4440);
    }

    #[test]
    fn dst_correction_only_applies_in_summer() {
        let london: Tz = chrono_tz::Europe::London;
        let winter = Utc.with_ymd_and_hms(2023, 1, 3, 10, 0, 0).unwrap();
        let summer = Utc.with_ymd_and_hms(2023, 6, 3, 10, 0, 0).unwrap();
        assert_eq!(correct_trust_timestamp(winter, london), winter);
        assert_eq!(
            correct_trust_timestamp(summer, london),
            summer - chrono::Duration::seconds(3600)
        );
    }
}
