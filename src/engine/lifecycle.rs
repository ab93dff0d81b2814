//! Appointment state machine.
//!
//! ```text
//! requested ──propose──▶ adjusted ──accept──▶ confirmed
//!     │                     └──reject──▶ cancelled
//!     ├──approve──▶ confirmed
//!     └──request payment──▶ awaiting_payment ──paid──▶ confirmed
//!                                  └──deadline──▶ expired
//! any non-terminal ──cancel──▶ cancelled
//! ```
//!
//! Transitions are pure: they take a snapshot and return a new one. Persisting
//! and conflict re-checks are the engine's job.

use chrono::{DateTime, Duration, Utc};
use chrono_tz::Tz;
use ulid::Ulid;

use crate::model::*;

use super::timezone::day_key_of;
use super::{EngineError, PolicyViolation};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    /// Operator proposes a different time.
    ProposeTime {
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        admin_notes: Option<String>,
    },
    AcceptAdjustment,
    RejectAdjustment,
    /// Operator approves as requested, no payment needed.
    Approve,
    /// Operator approves as requested and asks for a deposit.
    RequestPayment {
        deposit_amount: i64,
        payment_due_at: DateTime<Utc>,
    },
    /// Payment-provider webhook.
    PaymentReceived,
    /// Payment deadline passed; driven by the expiry sweep.
    Expire,
    Cancel,
}

impl Action {
    pub fn name(&self) -> &'static str {
        match self {
            Action::ProposeTime { .. } => "propose a new time",
            Action::AcceptAdjustment => "accept the adjustment",
            Action::RejectAdjustment => "reject the adjustment",
            Action::Approve => "approve",
            Action::RequestPayment { .. } => "request payment",
            Action::PaymentReceived => "record payment",
            Action::Expire => "expire",
            Action::Cancel => "cancel",
        }
    }

    fn notification(&self) -> NotificationKind {
        match self {
            Action::ProposeTime { .. } => NotificationKind::Adjusted,
            Action::AcceptAdjustment => NotificationKind::AdjustmentAccepted,
            Action::RejectAdjustment => NotificationKind::AdjustmentRejected,
            Action::Approve => NotificationKind::Approved,
            Action::RequestPayment { .. } => NotificationKind::PaymentRequested,
            Action::PaymentReceived => NotificationKind::PaymentReceived,
            Action::Expire => NotificationKind::Expired,
            Action::Cancel => NotificationKind::Cancelled,
        }
    }

    /// Whether applying this action changes the authoritative time.
    pub fn moves_time(&self) -> bool {
        matches!(self, Action::ProposeTime { .. })
    }
}

/// Outcome of a legal transition request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Step {
    Applied {
        appointment: Appointment,
        notification: Notification,
    },
    /// Replay of an externally triggered transition that already happened.
    Unchanged(Appointment),
}

/// The transition table. `None` means illegal.
pub fn next_status(from: AppointmentStatus, action: &Action) -> Option<AppointmentStatus> {
    use AppointmentStatus::*;
    match (from, action) {
        (from, _) if from.is_terminal() => None,
        (Requested, Action::ProposeTime { .. }) => Some(Adjusted),
        (Requested, Action::Approve) => Some(Confirmed),
        (Requested, Action::RequestPayment { .. }) => Some(AwaitingPayment),
        (Adjusted, Action::AcceptAdjustment) => Some(Confirmed),
        (Adjusted, Action::RejectAdjustment) => Some(Cancelled),
        (AwaitingPayment, Action::PaymentReceived) => Some(Confirmed),
        (AwaitingPayment, Action::Expire) => Some(Expired),
        (Requested | Adjusted | AwaitingPayment | Confirmed, Action::Cancel) => Some(Cancelled),
        _ => None,
    }
}

fn is_idempotent_replay(from: AppointmentStatus, action: &Action) -> bool {
    matches!(
        (from, action),
        (AppointmentStatus::Confirmed, Action::PaymentReceived)
            | (AppointmentStatus::Expired, Action::Expire)
    )
}

pub fn apply(appt: &Appointment, action: &Action, now: DateTime<Utc>, tz: Tz) -> Result<Step, EngineError> {
    if is_idempotent_replay(appt.status, action) {
        return Ok(Step::Unchanged(appt.clone()));
    }
    let illegal = || EngineError::IllegalTransition {
        id: appt.id,
        from: appt.status,
        action: action.name(),
    };
    let status = next_status(appt.status, action).ok_or_else(illegal)?;

    let mut next = appt.clone();
    match action {
        Action::ProposeTime { start, end, admin_notes } => {
            if end <= start {
                return Err(PolicyViolation::EmptyInterval.into());
            }
            next.final_start_at = Some(*start);
            next.final_end_at = Some(*end);
            if admin_notes.is_some() {
                next.admin_notes = admin_notes.clone();
            }
        }
        Action::RequestPayment { deposit_amount, payment_due_at } => {
            if *deposit_amount < 0 {
                return Err(EngineError::Configuration(format!(
                    "deposit must not be negative, got {deposit_amount}"
                )));
            }
            if *payment_due_at <= now {
                return Err(PolicyViolation::DeadlineInPast.into());
            }
            next.deposit_amount = Some(*deposit_amount);
            next.payment_due_at = Some(*payment_due_at);
        }
        Action::Expire => {
            let overdue = appt.payment_due_at.is_some_and(|due| due <= now);
            if !overdue {
                return Err(EngineError::IllegalTransition {
                    id: appt.id,
                    from: appt.status,
                    action: "expire before the payment deadline",
                });
            }
        }
        Action::AcceptAdjustment
        | Action::RejectAdjustment
        | Action::Approve
        | Action::PaymentReceived
        | Action::Cancel => {}
    }

    next.status = status;
    next.day_key = day_key_of(next.authoritative_start(), tz);
    next.updated_at = now;
    let notification = Notification::for_appointment(action.notification(), &next);
    Ok(Step::Applied {
        appointment: next,
        notification,
    })
}

/// What a client submits when booking.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BookingRequest {
    pub id: Ulid,
    pub user_id: String,
    pub service_id: Ulid,
    pub start: DateTime<Utc>,
    pub notes: Option<String>,
}

/// Build the initial `requested` document.
pub fn new_request(req: &BookingRequest, service: &Service, now: DateTime<Utc>, tz: Tz) -> Appointment {
    Appointment {
        id: req.id,
        user_id: req.user_id.clone(),
        service_id: service.id,
        service_name: service.name.clone(),
        price: service.price,
        requested_start_at: req.start,
        final_start_at: None,
        final_end_at: None,
        day_key: day_key_of(req.start, tz),
        duration_minutes: Some(service.duration_min),
        notes: req.notes.clone(),
        admin_notes: None,
        deposit_amount: None,
        payment_due_at: None,
        status: AppointmentStatus::Requested,
        created_at: now,
        updated_at: now,
    }
}

/// Default payment window when the operator does not name a deadline.
pub fn default_payment_due(now: DateTime<Utc>) -> DateTime<Utc> {
    now + Duration::hours(24)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    const ALL_STATUSES: [AppointmentStatus; 6] = [
        AppointmentStatus::Requested,
        AppointmentStatus::Adjusted,
        AppointmentStatus::AwaitingPayment,
        AppointmentStatus::Confirmed,
        AppointmentStatus::Cancelled,
        AppointmentStatus::Expired,
    ];

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 10, 18, 12, 0, 0).unwrap()
    }

    fn all_actions() -> Vec<Action> {
        vec![
            Action::ProposeTime {
                start: now() + Duration::days(1),
                end: now() + Duration::days(1) + Duration::hours(1),
                admin_notes: None,
            },
            Action::AcceptAdjustment,
            Action::RejectAdjustment,
            Action::Approve,
            Action::RequestPayment {
                deposit_amount: 500,
                payment_due_at: now() + Duration::hours(2),
            },
            Action::PaymentReceived,
            Action::Expire,
            Action::Cancel,
        ]
    }

    fn requested() -> Appointment {
        let service = Service {
            id: Ulid::new(),
            name: "Color".into(),
            duration_min: 90,
            duration_max: Some(120),
            price: Some(4000),
        };
        let req = BookingRequest {
            id: Ulid::new(),
            user_id: "client-7".into(),
            service_id: service.id,
            start: Utc.with_ymd_and_hms(2026, 10, 19, 10, 0, 0).unwrap(),
            notes: Some("first visit".into()),
        };
        new_request(&req, &service, now(), chrono_tz::UTC)
    }

    fn in_status(status: AppointmentStatus) -> Appointment {
        let mut a = requested();
        a.status = status;
        a.payment_due_at = Some(now() - Duration::minutes(1));
        a
    }

    fn applied(step: Step) -> Appointment {
        match step {
            Step::Applied { appointment, .. } => appointment,
            Step::Unchanged(_) => panic!("expected an applied transition"),
        }
    }

    #[test]
    fn new_request_snapshot() {
        let a = requested();
        assert_eq!(a.status, AppointmentStatus::Requested);
        assert_eq!(a.day_key.to_string(), "2026-10-19");
        assert_eq!(a.duration_minutes, Some(90));
        assert_eq!(a.price, Some(4000));
        assert_eq!(a.service_name, "Color");
    }

    #[test]
    fn only_listed_transitions_are_legal() {
        use AppointmentStatus::*;
        let legal = [
            (Requested, "propose a new time", Adjusted),
            (Requested, "approve", Confirmed),
            (Requested, "request payment", AwaitingPayment),
            (Requested, "cancel", Cancelled),
            (Adjusted, "accept the adjustment", Confirmed),
            (Adjusted, "reject the adjustment", Cancelled),
            (Adjusted, "cancel", Cancelled),
            (AwaitingPayment, "record payment", Confirmed),
            (AwaitingPayment, "expire", Expired),
            (AwaitingPayment, "cancel", Cancelled),
            (Confirmed, "cancel", Cancelled),
        ];
        for from in ALL_STATUSES {
            for action in all_actions() {
                let expected = legal
                    .iter()
                    .find(|(f, a, _)| *f == from && *a == action.name())
                    .map(|(_, _, to)| *to);
                assert_eq!(next_status(from, &action), expected, "{from} / {}", action.name());
            }
        }
    }

    #[test]
    fn terminal_states_admit_nothing() {
        for status in [AppointmentStatus::Cancelled, AppointmentStatus::Expired] {
            for action in all_actions() {
                assert_eq!(next_status(status, &action), None);
            }
        }
    }

    #[test]
    fn illegal_transition_does_not_mutate() {
        let original = in_status(AppointmentStatus::Cancelled);
        let err = apply(&original, &Action::AcceptAdjustment, now(), chrono_tz::UTC).unwrap_err();
        assert!(matches!(err, EngineError::IllegalTransition { .. }));
        assert_eq!(original.status, AppointmentStatus::Cancelled);
    }

    #[test]
    fn propose_keeps_requested_time_and_moves_day_key() {
        let a = requested();
        let start = Utc.with_ymd_and_hms(2026, 10, 21, 15, 0, 0).unwrap();
        let action = Action::ProposeTime {
            start,
            end: start + Duration::minutes(90),
            admin_notes: Some("afternoon works better".into()),
        };
        let next = applied(apply(&a, &action, now(), chrono_tz::UTC).unwrap());
        assert_eq!(next.status, AppointmentStatus::Adjusted);
        assert_eq!(next.requested_start_at, a.requested_start_at);
        assert_eq!(next.final_start_at, Some(start));
        assert_eq!(next.day_key.to_string(), "2026-10-21");
        assert_eq!(next.admin_notes.as_deref(), Some("afternoon works better"));
        assert_eq!(next.updated_at, now());
    }

    #[test]
    fn propose_rejects_empty_interval() {
        let a = requested();
        let start = now() + Duration::days(1);
        let action = Action::ProposeTime { start, end: start, admin_notes: None };
        assert!(matches!(
            apply(&a, &action, now(), chrono_tz::UTC),
            Err(EngineError::Policy(PolicyViolation::EmptyInterval))
        ));
    }

    #[test]
    fn accept_changes_only_status() {
        let a = in_status(AppointmentStatus::Adjusted);
        let next = applied(apply(&a, &Action::AcceptAdjustment, now(), chrono_tz::UTC).unwrap());
        assert_eq!(next.status, AppointmentStatus::Confirmed);
        assert_eq!(next.requested_start_at, a.requested_start_at);
        assert_eq!(next.final_start_at, a.final_start_at);
    }

    #[test]
    fn request_payment_sets_terms() {
        let a = requested();
        let due = now() + Duration::hours(3);
        let action = Action::RequestPayment { deposit_amount: 1000, payment_due_at: due };
        let step = apply(&a, &action, now(), chrono_tz::UTC).unwrap();
        let Step::Applied { appointment, notification } = step else {
            panic!("expected applied");
        };
        assert_eq!(appointment.status, AppointmentStatus::AwaitingPayment);
        assert_eq!(appointment.deposit_amount, Some(1000));
        assert_eq!(appointment.payment_due_at, Some(due));
        assert_eq!(notification.kind, NotificationKind::PaymentRequested);
        assert_eq!(notification.appointment_id, Some(a.id));
    }

    #[test]
    fn request_payment_with_past_deadline_is_rejected() {
        let action = Action::RequestPayment {
            deposit_amount: 1000,
            payment_due_at: now() - Duration::minutes(5),
        };
        assert!(apply(&requested(), &action, now(), chrono_tz::UTC).is_err());
    }

    #[test]
    fn webhook_and_sweep_replays_are_noops() {
        let confirmed = in_status(AppointmentStatus::Confirmed);
        assert_eq!(
            apply(&confirmed, &Action::PaymentReceived, now(), chrono_tz::UTC).unwrap(),
            Step::Unchanged(confirmed.clone())
        );
        let expired = in_status(AppointmentStatus::Expired);
        assert_eq!(
            apply(&expired, &Action::Expire, now(), chrono_tz::UTC).unwrap(),
            Step::Unchanged(expired.clone())
        );
    }

    #[test]
    fn expire_waits_for_deadline() {
        let mut a = in_status(AppointmentStatus::AwaitingPayment);
        a.payment_due_at = Some(now() + Duration::minutes(10));
        assert!(apply(&a, &Action::Expire, now(), chrono_tz::UTC).is_err());
        let later = now() + Duration::minutes(10);
        let next = applied(apply(&a, &Action::Expire, later, chrono_tz::UTC).unwrap());
        assert_eq!(next.status, AppointmentStatus::Expired);
    }

    #[test]
    fn cancel_from_every_live_state() {
        for status in [
            AppointmentStatus::Requested,
            AppointmentStatus::Adjusted,
            AppointmentStatus::AwaitingPayment,
            AppointmentStatus::Confirmed,
        ] {
            let next = applied(apply(&in_status(status), &Action::Cancel, now(), chrono_tz::UTC).unwrap());
            assert_eq!(next.status, AppointmentStatus::Cancelled);
            assert!(!next.status.is_blocking());
        }
    }
}
