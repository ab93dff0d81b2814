//! Conversions between UTC instants and the provider's local calendar.
//!
//! Everything here is computed against the provider timezone from
//! `GlobalSettings`, never the host's local zone.

use chrono::{DateTime, Datelike, LocalResult, NaiveDate, NaiveTime, TimeZone, Timelike, Utc};
use chrono_tz::Tz;

use crate::model::{DayKey, WeekdayKey};

use super::EngineError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WallClock {
    pub hour: u32,
    pub minute: u32,
}

impl WallClock {
    pub fn minute_of_day(&self) -> u32 {
        self.hour * 60 + self.minute
    }
}

/// Resolve an IANA zone name. An unknown name is a configuration error.
pub fn parse_timezone(name: &str) -> Result<Tz, EngineError> {
    name.parse::<Tz>()
        .map_err(|_| EngineError::Configuration(format!("unknown timezone: {name}")))
}

pub fn day_key_of(instant: DateTime<Utc>, tz: Tz) -> DayKey {
    DayKey(instant.with_timezone(&tz).date_naive())
}

pub fn weekday_key_of(instant: DateTime<Utc>, tz: Tz) -> WeekdayKey {
    instant.with_timezone(&tz).weekday().into()
}

pub fn weekday_key_of_date(date: NaiveDate) -> WeekdayKey {
    date.weekday().into()
}

pub fn local_wall_clock(instant: DateTime<Utc>, tz: Tz) -> WallClock {
    let local = instant.with_timezone(&tz);
    WallClock {
        hour: local.hour(),
        minute: local.minute(),
    }
}

pub fn today(now: DateTime<Utc>, tz: Tz) -> NaiveDate {
    now.with_timezone(&tz).date_naive()
}

/// Local `date` + minute-of-day → UTC instant.
///
/// Returns `None` for wall-clock times skipped by a DST spring-forward.
/// Ambiguous fall-back times resolve to the earlier instant.
pub fn local_to_utc(date: NaiveDate, minute_of_day: u32, tz: Tz) -> Option<DateTime<Utc>> {
    let time = NaiveTime::from_hms_opt(minute_of_day / 60, minute_of_day % 60, 0)?;
    match tz.from_local_datetime(&date.and_time(time)) {
        LocalResult::Single(dt) => Some(dt.with_timezone(&Utc)),
        LocalResult::Ambiguous(earliest, _) => Some(earliest.with_timezone(&Utc)),
        LocalResult::None => None,
    }
}

/// Parse a `HH:mm` wall-clock string into minutes since local midnight.
pub fn parse_hhmm(s: &str) -> Option<u32> {
    let (h, m) = s.split_once(':')?;
    if h.len() != 2 || m.len() != 2 {
        return None;
    }
    let h: u32 = h.parse().ok()?;
    let m: u32 = m.parse().ok()?;
    // 24:00 is accepted as end-of-day for closing times.
    if (h < 24 && m < 60) || (h == 24 && m == 0) {
        Some(h * 60 + m)
    } else {
        None
    }
}

pub fn format_hhmm(minute_of_day: u32) -> String {
    format!("{:02}:{:02}", minute_of_day / 60, minute_of_day % 60)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn utc(y: i32, mo: u32, d: u32, h: u32, mi: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, h, mi, 0).unwrap()
    }

    #[test]
    fn invalid_timezone_is_configuration_error() {
        assert!(parse_timezone("Europe/Madrid").is_ok());
        assert!(matches!(
            parse_timezone("Mars/Olympus"),
            Err(EngineError::Configuration(_))
        ));
    }

    #[test]
    fn day_key_uses_provider_zone_not_utc() {
        let tz = parse_timezone("America/Mexico_City").unwrap();
        // 03:30 UTC on Jan 1 is still Dec 31 evening in Mexico City.
        let instant = utc(2026, 1, 1, 3, 30);
        assert_eq!(day_key_of(instant, tz).to_string(), "2025-12-31");
        assert_eq!(weekday_key_of(instant, tz), WeekdayKey::Wed);
        assert_eq!(local_wall_clock(instant, tz), WallClock { hour: 21, minute: 30 });
    }

    #[test]
    fn day_key_rolls_forward_east_of_utc() {
        let tz = parse_timezone("Asia/Tokyo").unwrap();
        let instant = utc(2026, 2, 28, 16, 0);
        assert_eq!(day_key_of(instant, tz).to_string(), "2026-03-01");
        assert_eq!(weekday_key_of(instant, tz), WeekdayKey::Sun);
    }

    #[test]
    fn wall_clock_across_dst_change() {
        let tz = parse_timezone("Europe/Madrid").unwrap();
        // Before the March 29 2026 switch Madrid is UTC+1, after it UTC+2.
        assert_eq!(local_wall_clock(utc(2026, 3, 28, 9, 0), tz).hour, 10);
        assert_eq!(local_wall_clock(utc(2026, 3, 30, 9, 0), tz).hour, 11);
    }

    #[test]
    fn spring_forward_gap_has_no_instant() {
        let tz = parse_timezone("Europe/Madrid").unwrap();
        let date = NaiveDate::from_ymd_opt(2026, 3, 29).unwrap();
        // 02:30 local does not exist on the switch day.
        assert_eq!(local_to_utc(date, 2 * 60 + 30, tz), None);
        assert_eq!(local_to_utc(date, 3 * 60, tz), Some(utc(2026, 3, 29, 1, 0)));
    }

    #[test]
    fn fall_back_ambiguity_takes_earliest() {
        let tz = parse_timezone("Europe/Madrid").unwrap();
        let date = NaiveDate::from_ymd_opt(2026, 10, 25).unwrap();
        // 02:30 happens twice; the first one is still CEST (UTC+2).
        assert_eq!(local_to_utc(date, 2 * 60 + 30, tz), Some(utc(2026, 10, 25, 0, 30)));
    }

    #[test]
    fn hhmm_round_trip_and_rejects_garbage() {
        assert_eq!(parse_hhmm("09:30"), Some(570));
        assert_eq!(parse_hhmm("24:00"), Some(1440));
        assert_eq!(parse_hhmm("24:30"), None);
        assert_eq!(parse_hhmm("9:30"), None);
        assert_eq!(parse_hhmm("09:60"), None);
        assert_eq!(parse_hhmm("nope"), None);
        assert_eq!(format_hhmm(570), "09:30");
    }

    #[test]
    fn weekday_of_date() {
        let d = NaiveDate::from_ymd_opt(2026, 10, 18).unwrap();
        assert_eq!(weekday_key_of_date(d), WeekdayKey::Sun);
    }
}
