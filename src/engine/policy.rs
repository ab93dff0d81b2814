use chrono::{DateTime, Duration, NaiveDate, Timelike, Utc};
use chrono_tz::Tz;

use crate::model::{CandidateSlot, DayKey, GlobalSettings};

use super::calendar::window_for;
use super::timezone::{day_key_of, local_wall_clock, today};
use super::{EngineError, PolicyViolation};

/// First and last bookable dates, inclusive: today through today + `bookingMaxDays`.
pub fn horizon(now: DateTime<Utc>, settings: &GlobalSettings, tz: Tz) -> (NaiveDate, NaiveDate) {
    let first = today(now, tz);
    let last = first + Duration::days(settings.booking_max_days);
    (first, last)
}

pub fn check_horizon(
    date: NaiveDate,
    now: DateTime<Utc>,
    settings: &GlobalSettings,
    tz: Tz,
) -> Result<(), PolicyViolation> {
    let (first, last) = horizon(now, settings, tz);
    if date < first || date > last {
        return Err(PolicyViolation::OutsideHorizon {
            day: DayKey(date),
            earliest: DayKey(first),
            latest: DayKey(last),
        });
    }
    Ok(())
}

/// Earliest instant a booking may start at.
pub fn earliest_start(now: DateTime<Utc>, settings: &GlobalSettings) -> DateTime<Utc> {
    now + Duration::minutes(settings.booking_min_lead_minutes)
}

/// Drop candidates that violate the horizon or the lead time.
///
/// Lead time compares full instants, so it is correct on every day, including
/// when `now + lead` already falls on a later calendar date.
pub fn filter_by_policy(
    date: NaiveDate,
    candidates: Vec<CandidateSlot>,
    now: DateTime<Utc>,
    settings: &GlobalSettings,
    tz: Tz,
) -> Vec<CandidateSlot> {
    if check_horizon(date, now, settings, tz).is_err() {
        return Vec::new();
    }
    let earliest = earliest_start(now, settings);
    candidates
        .into_iter()
        .filter(|slot| slot.start >= earliest)
        .collect()
}

/// Validate a concrete booking request against the same rules that produce the
/// offered slots. Returns the provider-local day the booking falls on.
pub fn check_request(
    start: DateTime<Utc>,
    duration_minutes: i64,
    now: DateTime<Utc>,
    settings: &GlobalSettings,
    tz: Tz,
) -> Result<DayKey, EngineError> {
    let day = day_key_of(start, tz);
    check_horizon(day.date(), now, settings, tz)?;

    let window = window_for(day.date(), settings)?.ok_or(PolicyViolation::Closed(day))?;
    let offset = local_wall_clock(start, tz).minute_of_day();
    if offset < window.start || i64::from(offset) + duration_minutes > i64::from(window.end) {
        return Err(PolicyViolation::OutsideBusinessHours.into());
    }
    let aligned = start.second() == 0
        && start.nanosecond() == 0
        && i64::from(offset - window.start) % settings.slot_interval_minutes == 0;
    if !aligned {
        return Err(PolicyViolation::NotOnSlotBoundary.into());
    }

    if start < earliest_start(now, settings) {
        return Err(PolicyViolation::TooSoon {
            lead_minutes: settings.booking_min_lead_minutes,
        }
        .into());
    }
    Ok(day)
}
