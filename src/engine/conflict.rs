use ulid::Ulid;

use crate::model::*;

/// Assumed length of an appointment that carries no duration of its own.
pub const DEFAULT_DURATION_MINUTES: i64 = 60;

/// Effective `[start, end)` of an appointment: the operator's final interval when
/// both ends are set, otherwise the requested start plus its duration.
pub fn effective_span(appt: &Appointment) -> Span {
    match (appt.final_start_at, appt.final_end_at) {
        (Some(start), Some(end)) if start < end => Span::from_instants(start, end),
        _ => {
            let minutes = appt
                .duration_minutes
                .filter(|d| *d > 0)
                .unwrap_or(DEFAULT_DURATION_MINUTES);
            let start = appt.requested_start_at.timestamp_millis();
            Span::new(start, start + minutes * MINUTE_MS)
        }
    }
}

/// First blocking appointment on `day` that overlaps `candidate`.
/// `exclude` skips the appointment being moved, so it never conflicts with itself.
pub fn find_conflict<'a>(
    candidate: &Span,
    day: DayKey,
    existing: impl IntoIterator<Item = &'a Appointment>,
    exclude: Option<Ulid>,
) -> Option<Ulid> {
    existing
        .into_iter()
        .filter(|a| a.day_key == day && a.status.is_blocking())
        .filter(|a| Some(a.id) != exclude)
        .find(|a| effective_span(a).overlaps(candidate))
        .map(|a| a.id)
}

pub fn has_conflict<'a>(
    candidate: &Span,
    day: DayKey,
    existing: impl IntoIterator<Item = &'a Appointment>,
) -> bool {
    find_conflict(candidate, day, existing, None).is_some()
}
