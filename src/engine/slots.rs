use chrono::{Duration, NaiveDate};
use chrono_tz::Tz;

use crate::model::CandidateSlot;

use super::calendar::DayWindow;
use super::timezone::{format_hhmm, local_to_utc};
use super::EngineError;

/// Candidate start offsets (minutes since local midnight) inside `window`.
///
/// Steps from `window.start` by `interval_minutes` and keeps every start whose
/// service fits before closing: `start + duration <= window.end`. Ascending, no
/// duplicates.
pub fn generate_slots(
    window: DayWindow,
    interval_minutes: i64,
    duration_minutes: i64,
) -> Result<Vec<u32>, EngineError> {
    if interval_minutes <= 0 {
        return Err(EngineError::Configuration(format!(
            "slot interval must be positive, got {interval_minutes}"
        )));
    }
    if duration_minutes <= 0 {
        return Err(EngineError::Configuration(format!(
            "service duration must be positive, got {duration_minutes}"
        )));
    }

    let end = i64::from(window.end);
    let mut slots = Vec::new();
    let mut candidate = i64::from(window.start);
    while candidate + duration_minutes <= end {
        slots.push(candidate as u32);
        candidate += interval_minutes;
    }
    Ok(slots)
}

/// Turn offsets on a provider-local `date` into concrete UTC slots.
/// Offsets that do not exist locally (DST gap) are dropped.
pub fn materialize(date: NaiveDate, offsets: &[u32], duration_minutes: i64, tz: Tz) -> Vec<CandidateSlot> {
    offsets
        .iter()
        .filter_map(|&offset| {
            let start = local_to_utc(date, offset, tz)?;
            Some(CandidateSlot {
                start,
                end: start + Duration::minutes(duration_minutes),
                label: format_hhmm(offset),
            })
        })
        .collect()
}
