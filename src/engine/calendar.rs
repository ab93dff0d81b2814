use chrono::NaiveDate;

use crate::limits::*;
use crate::model::{BusinessHours, DayHours, GlobalSettings, WeekdayKey};

use super::timezone::{parse_hhmm, parse_timezone, weekday_key_of_date};
use super::EngineError;

/// Opening window of one calendar day, in minutes since local midnight.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DayWindow {
    pub start: u32,
    pub end: u32,
}

/// Business hours for `date` (already a provider-local calendar date).
/// `Ok(None)` means the provider is closed that day.
pub fn window_for(date: NaiveDate, settings: &GlobalSettings) -> Result<Option<DayWindow>, EngineError> {
    let weekday = weekday_key_of_date(date);
    let hours = settings.business_hours.get(weekday);
    if !hours.enabled {
        return Ok(None);
    }
    parse_day(weekday, hours).map(Some)
}

fn parse_day(weekday: WeekdayKey, hours: &DayHours) -> Result<DayWindow, EngineError> {
    let start = parse_hhmm(&hours.start).ok_or_else(|| {
        EngineError::Configuration(format!("{}: bad start time {:?}", weekday.as_str(), hours.start))
    })?;
    let end = parse_hhmm(&hours.end).ok_or_else(|| {
        EngineError::Configuration(format!("{}: bad end time {:?}", weekday.as_str(), hours.end))
    })?;
    if end <= start {
        return Err(EngineError::Configuration(format!(
            "{}: closing time {} must be after opening time {}",
            weekday.as_str(),
            hours.end,
            hours.start
        )));
    }
    Ok(DayWindow { start, end })
}

/// Every enabled day must parse and satisfy `end > start`. Disabled days are not inspected.
pub fn validate_business_hours(hours: &BusinessHours) -> Result<(), EngineError> {
    for (weekday, day) in hours.iter() {
        if day.enabled {
            parse_day(weekday, day)?;
        }
    }
    Ok(())
}

impl GlobalSettings {
    /// Checked when the operator saves settings, so booking never meets a broken schedule.
    pub fn validate(&self) -> Result<(), EngineError> {
        parse_timezone(&self.timezone)?;
        validate_business_hours(&self.business_hours)?;
        if self.slot_interval_minutes <= 0 || self.slot_interval_minutes > MAX_DURATION_MINUTES {
            return Err(EngineError::Configuration(format!(
                "slotIntervalMinutes must be between 1 and {MAX_DURATION_MINUTES}, got {}",
                self.slot_interval_minutes
            )));
        }
        if !(0..=MAX_LEAD_MINUTES).contains(&self.booking_min_lead_minutes) {
            return Err(EngineError::Configuration(format!(
                "bookingMinLeadMinutes must be between 0 and {MAX_LEAD_MINUTES}, got {}",
                self.booking_min_lead_minutes
            )));
        }
        if !(0..=MAX_BOOKING_DAYS).contains(&self.booking_max_days) {
            return Err(EngineError::Configuration(format!(
                "bookingMaxDays must be between 0 and {MAX_BOOKING_DAYS}, got {}",
                self.booking_max_days
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[test]
    fn weekday_window_from_defaults() {
        let settings = GlobalSettings::default();
        // 2026-10-19 is a Monday.
        let w = window_for(date(2026, 10, 19), &settings).unwrap();
        assert_eq!(w, Some(DayWindow { start: 540, end: 1020 }));
    }

    #[test]
    fn disabled_day_is_closed() {
        let settings = GlobalSettings::default();
        // Sunday
        assert_eq!(window_for(date(2026, 10, 18), &settings).unwrap(), None);
    }

    #[test]
    fn malformed_hours_fail_instead_of_defaulting() {
        let mut settings = GlobalSettings::default();
        settings.business_hours.mon = DayHours::open("9am", "17:00");
        assert!(matches!(
            window_for(date(2026, 10, 19), &settings),
            Err(EngineError::Configuration(_))
        ));
        assert!(settings.validate().is_err());
    }

    #[test]
    fn end_must_follow_start() {
        let mut hours = BusinessHours::default();
        hours.tue = DayHours::open("12:00", "12:00");
        assert!(validate_business_hours(&hours).is_err());
        hours.tue = DayHours::open("12:00", "11:00");
        assert!(validate_business_hours(&hours).is_err());
    }

    #[test]
    fn disabled_day_with_garbage_is_ignored() {
        let mut hours = BusinessHours::default();
        hours.sun = DayHours {
            enabled: false,
            start: "xx".into(),
            end: "yy".into(),
        };
        assert!(validate_business_hours(&hours).is_ok());
    }

    #[test]
    fn settings_validation_bounds() {
        let mut s = GlobalSettings::default();
        assert!(s.validate().is_ok());

        s.slot_interval_minutes = 0;
        assert!(s.validate().is_err());
        s.slot_interval_minutes = 15;

        s.booking_min_lead_minutes = -1;
        assert!(s.validate().is_err());
        s.booking_min_lead_minutes = 0;

        s.booking_max_days = MAX_BOOKING_DAYS + 1;
        assert!(s.validate().is_err());
        s.booking_max_days = 0;
        assert!(s.validate().is_ok());

        s.timezone = "Not/AZone".into();
        assert!(matches!(s.validate(), Err(EngineError::Configuration(_))));
    }
}
