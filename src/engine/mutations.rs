use chrono::{DateTime, Utc};
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;
use crate::observability;

use super::conflict::{effective_span, find_conflict};
use super::lifecycle::{self, default_payment_due, new_request, Action, BookingRequest, Step};
use super::policy::check_request;
use super::timezone::{day_key_of, parse_timezone};
use super::{Engine, EngineError, PolicyViolation, WalCommand};

fn check_len(value: &str, max: usize, what: &'static str) -> Result<(), EngineError> {
    if value.len() > max {
        return Err(EngineError::LimitExceeded(what));
    }
    Ok(())
}

impl Engine {
    /// Replace the provider settings. Rejected settings leave the old ones in force.
    pub async fn update_settings(&self, settings: GlobalSettings) -> Result<(), EngineError> {
        settings.validate()?;
        let _gate = self.compaction_gate.read().await;
        let mut current = self.settings.write().await;
        let event = Event::SettingsUpdated(settings.clone());
        self.wal_append(&event).await?;
        *current = settings;
        drop(current);
        tracing::info!("settings updated");
        self.notify
            .send(SETTINGS_CHANNEL, &Notification::settings_changed());
        Ok(())
    }

    pub async fn upsert_service(&self, service: Service) -> Result<(), EngineError> {
        if service.name.trim().is_empty() {
            return Err(EngineError::Configuration("service name must not be empty".into()));
        }
        check_len(&service.name, MAX_NAME_LEN, "service name too long")?;
        if !(1..=MAX_DURATION_MINUTES).contains(&service.duration_min) {
            return Err(EngineError::Configuration(format!(
                "service duration must be between 1 and {MAX_DURATION_MINUTES} minutes, got {}",
                service.duration_min
            )));
        }
        if let Some(max) = service.duration_max
            && !(service.duration_min..=MAX_DURATION_MINUTES).contains(&max)
        {
            return Err(EngineError::Configuration(format!(
                "maximum duration {max} must be between {} and {MAX_DURATION_MINUTES}",
                service.duration_min
            )));
        }
        if service.price.is_some_and(|p| p < 0) {
            return Err(EngineError::Configuration("price must not be negative".into()));
        }

        let _gate = self.compaction_gate.read().await;
        let _serial = self.services_lock.lock().await;
        if !self.services.contains_key(&service.id) && self.services.len() >= MAX_SERVICES {
            return Err(EngineError::LimitExceeded("too many services"));
        }
        self.wal_append(&Event::ServiceUpserted(service.clone())).await?;
        self.services.insert(service.id, service);
        Ok(())
    }

    /// Existing appointments keep their service name and price snapshot.
    pub async fn remove_service(&self, id: Ulid) -> Result<(), EngineError> {
        let _gate = self.compaction_gate.read().await;
        let _serial = self.services_lock.lock().await;
        if !self.services.contains_key(&id) {
            return Err(EngineError::not_found(format!("service {id}")));
        }
        self.wal_append(&Event::ServiceRemoved { id }).await?;
        self.services.remove(&id);
        Ok(())
    }

    /// Create a `requested` appointment at a slot the client picked.
    ///
    /// Policy is re-validated against the current settings, then the conflict
    /// check, journal write and insert all happen under the day's write lock:
    /// of two concurrent requests for one slot, exactly one succeeds.
    pub async fn request_appointment(&self, req: BookingRequest) -> Result<Appointment, EngineError> {
        if req.user_id.is_empty() {
            return Err(EngineError::Configuration("user id must not be empty".into()));
        }
        check_len(&req.user_id, MAX_USER_ID_LEN, "user id too long")?;
        if let Some(notes) = &req.notes {
            check_len(notes, MAX_NOTES_LEN, "notes too long")?;
        }
        if self.appointment_day.contains_key(&req.id) {
            return Err(EngineError::AlreadyExists(req.id));
        }

        let settings = self.settings.read().await.clone();
        let tz = parse_timezone(&settings.timezone)?;
        let service = self
            .services
            .get(&req.service_id)
            .map(|s| s.clone())
            .ok_or_else(|| EngineError::not_found(format!("service {}", req.service_id)))?;
        let now = self.clock.now();
        let day = match check_request(req.start, service.duration_min, now, &settings, tz) {
            Ok(day) => day,
            Err(e) => {
                metrics::counter!(observability::BOOKINGS_TOTAL, "outcome" => "rejected").increment(1);
                return Err(e);
            }
        };

        let _gate = self.compaction_gate.read().await;
        let shard = self.day_shard(day);
        let mut guard = shard.write().await;
        if guard.get(req.id).is_some() {
            return Err(EngineError::AlreadyExists(req.id));
        }
        let appt = new_request(&req, &service, now, tz);
        if let Some(other) = find_conflict(&effective_span(&appt), day, &guard.appointments, None) {
            metrics::counter!(observability::BOOKINGS_TOTAL, "outcome" => "conflict").increment(1);
            tracing::debug!("booking {} at {} conflicts with {other}", req.id, req.start);
            return Err(EngineError::Conflict(other));
        }
        if guard.appointments.len() >= MAX_APPOINTMENTS_PER_DAY {
            return Err(EngineError::LimitExceeded("too many appointments on this day"));
        }

        self.wal_append(&Event::AppointmentCreated(appt.clone())).await?;
        guard.upsert(appt.clone());
        self.index(&appt);
        drop(guard);

        metrics::counter!(observability::BOOKINGS_TOTAL, "outcome" => "requested").increment(1);
        tracing::info!("appointment {} requested for {} on {day}", appt.id, appt.user_id);
        self.publish(
            &[day],
            &appt,
            &Notification::for_appointment(NotificationKind::Requested, &appt),
        );
        Ok(appt)
    }

    /// Drive one appointment through the state machine.
    ///
    /// Locks the day the appointment is on and the day it would land on, in
    /// key order, and re-checks conflicts whenever the authoritative time
    /// becomes binding (propose, accept).
    pub async fn transition(&self, id: Ulid, action: Action) -> Result<Appointment, EngineError> {
        if let Action::ProposeTime { start, end, admin_notes } = &action {
            if (*end - *start).num_minutes() > MAX_DURATION_MINUTES {
                return Err(EngineError::LimitExceeded("proposed interval longer than a day"));
            }
            if let Some(notes) = admin_notes {
                check_len(notes, MAX_NOTES_LEN, "admin notes too long")?;
            }
        }
        let tz = parse_timezone(&self.settings.read().await.timezone)?;
        let _gate = self.compaction_gate.read().await;

        let mut landing: Option<DayKey> = None;
        loop {
            let current = self
                .appointment_day
                .get(&id)
                .map(|d| *d)
                .ok_or_else(|| EngineError::not_found(format!("appointment {id}")))?;
            let target = landing.unwrap_or(match &action {
                Action::ProposeTime { start, .. } => day_key_of(*start, tz),
                _ => current,
            });
            let mut locks = self.lock_days(current, target).await;
            let Some(appt) = locks.day(current).and_then(|d| d.get(id)).cloned() else {
                // Moved by a concurrent transition; look it up again.
                continue;
            };

            let now = self.clock.now();
            let (next, notification) = match lifecycle::apply(&appt, &action, now, tz)? {
                Step::Unchanged(appt) => {
                    tracing::debug!("{} on {id} already applied", action.name());
                    return Ok(appt);
                }
                Step::Applied { appointment, notification } => (appointment, notification),
            };
            if !locks.holds(next.day_key) {
                landing = Some(next.day_key);
                continue;
            }

            if matches!(action, Action::ProposeTime { .. } | Action::AcceptAdjustment) {
                let day = locks.day(next.day_key).map(|d| d.appointments.as_slice()).unwrap_or_default();
                if let Some(other) = find_conflict(&effective_span(&next), next.day_key, day, Some(id)) {
                    metrics::counter!(observability::CONFLICTS_TOTAL, "action" => observability::action_label(&action))
                        .increment(1);
                    return Err(EngineError::Conflict(other));
                }
            }

            self.wal_append(&Event::AppointmentChanged {
                previous_day: current,
                appointment: next.clone(),
            })
            .await?;
            self.apply_change(&mut locks, current, &next);
            drop(locks);

            metrics::counter!(observability::TRANSITIONS_TOTAL, "action" => observability::action_label(&action))
                .increment(1);
            tracing::info!("appointment {id}: {} -> {}", appt.status, next.status);
            self.publish(&[current, next.day_key], &next, &notification);
            return Ok(next);
        }
    }

    pub async fn propose_time(
        &self,
        id: Ulid,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        admin_notes: Option<String>,
    ) -> Result<Appointment, EngineError> {
        self.transition(id, Action::ProposeTime { start, end, admin_notes }).await
    }

    /// Approve as requested. With payment terms the appointment waits for a
    /// deposit; a missing deadline defaults to 24 hours from now.
    pub async fn approve(
        &self,
        id: Ulid,
        payment: Option<(i64, Option<DateTime<Utc>>)>,
    ) -> Result<Appointment, EngineError> {
        let action = match payment {
            None => Action::Approve,
            Some((deposit_amount, due)) => {
                if !self.settings.read().await.payments_enabled {
                    return Err(PolicyViolation::PaymentsDisabled.into());
                }
                Action::RequestPayment {
                    deposit_amount,
                    payment_due_at: due.unwrap_or_else(|| default_payment_due(self.clock.now())),
                }
            }
        };
        self.transition(id, action).await
    }

    pub async fn accept_adjustment(&self, id: Ulid) -> Result<Appointment, EngineError> {
        self.transition(id, Action::AcceptAdjustment).await
    }

    pub async fn reject_adjustment(&self, id: Ulid) -> Result<Appointment, EngineError> {
        self.transition(id, Action::RejectAdjustment).await
    }

    pub async fn cancel(&self, id: Ulid) -> Result<Appointment, EngineError> {
        self.transition(id, Action::Cancel).await
    }

    /// Payment webhook. Redelivery after confirmation is a no-op.
    pub async fn record_payment(&self, id: Ulid) -> Result<Appointment, EngineError> {
        self.transition(id, Action::PaymentReceived).await
    }

    pub async fn expire(&self, id: Ulid) -> Result<Appointment, EngineError> {
        self.transition(id, Action::Expire).await
    }

    /// Awaiting-payment appointments whose deadline is at or before `now`.
    /// Shards locked by a writer are skipped until the next sweep.
    pub fn collect_overdue_payments(&self, now: DateTime<Utc>) -> Vec<Ulid> {
        let mut overdue = Vec::new();
        for entry in self.days.iter() {
            let shard = entry.value().clone();
            let Ok(day) = shard.try_read() else { continue };
            overdue.extend(
                day.appointments
                    .iter()
                    .filter(|a| a.status == AppointmentStatus::AwaitingPayment)
                    .filter(|a| a.payment_due_at.is_some_and(|due| due <= now))
                    .map(|a| a.id),
            );
        }
        overdue
    }

    /// Rewrite the journal as one record per live settings, service and appointment.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        let _exclusive = self.compaction_gate.write().await;

        let mut events = vec![Event::SettingsUpdated(self.settings.read().await.clone())];
        let mut services: Vec<Service> = self.services.iter().map(|s| s.value().clone()).collect();
        services.sort_by_key(|s| s.id);
        events.extend(services.into_iter().map(Event::ServiceUpserted));

        let mut shards: Vec<_> = self.days.iter().map(|e| (*e.key(), e.value().clone())).collect();
        shards.sort_by_key(|(key, _)| *key);
        for (_, shard) in shards {
            let day = shard.read().await;
            events.extend(day.appointments.iter().cloned().map(Event::AppointmentCreated));
        }

        let count = events.len();
        self.wal_command(|response| WalCommand::Compact { events, response })
            .await?
            .map_err(|e| EngineError::StoreUnavailable(e.to_string()))?;
        metrics::counter!(observability::WAL_COMPACTIONS_TOTAL).increment(1);
        tracing::info!("journal compacted to {count} records");
        Ok(())
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        self.wal_command(|response| WalCommand::AppendsSinceCompact { response })
            .await
            .unwrap_or(0)
    }
}
