use chrono::NaiveDate;
use ulid::Ulid;

use crate::model::*;

use super::calendar::window_for;
use super::conflict::find_conflict;
use super::policy::filter_by_policy;
use super::slots::{generate_slots, materialize};
use super::timezone::parse_timezone;
use super::{Engine, EngineError};

impl Engine {
    pub async fn get_settings(&self) -> GlobalSettings {
        self.settings.read().await.clone()
    }

    /// All services, alphabetical.
    pub fn list_services(&self) -> Vec<Service> {
        let mut services: Vec<Service> = self.services.iter().map(|s| s.value().clone()).collect();
        services.sort_by(|a, b| a.name.cmp(&b.name).then(a.id.cmp(&b.id)));
        services
    }

    pub fn service(&self, id: Ulid) -> Result<Service, EngineError> {
        self.services
            .get(&id)
            .map(|s| s.clone())
            .ok_or_else(|| EngineError::not_found(format!("service {id}")))
    }

    /// Bookable slots for `service_id` on the provider-local `date`.
    ///
    /// Business hours, interval grid, horizon and lead time decide the
    /// candidates; slots already taken by a blocking appointment are removed.
    /// A closed day or one outside the horizon yields an empty list.
    pub async fn available_slots(
        &self,
        date: NaiveDate,
        service_id: Ulid,
    ) -> Result<Vec<CandidateSlot>, EngineError> {
        let settings = self.get_settings().await;
        let tz = parse_timezone(&settings.timezone)?;
        let service = self.service(service_id)?;
        let Some(window) = window_for(date, &settings)? else {
            return Ok(Vec::new());
        };
        let offsets = generate_slots(window, settings.slot_interval_minutes, service.duration_min)?;
        let candidates = materialize(date, &offsets, service.duration_min, tz);
        let candidates = filter_by_policy(date, candidates, self.clock.now(), &settings, tz);
        if candidates.is_empty() {
            return Ok(candidates);
        }

        let key = DayKey(date);
        let Some(shard) = self.days.get(&key).map(|e| e.value().clone()) else {
            return Ok(candidates);
        };
        let day = shard.read().await;
        Ok(candidates
            .into_iter()
            .filter(|slot| {
                let span = Span::from_instants(slot.start, slot.end);
                find_conflict(&span, key, &day.appointments, None).is_none()
            })
            .collect())
    }

    pub async fn appointment(&self, id: Ulid) -> Result<Appointment, EngineError> {
        // Retry once if a concurrent transition moved it between lookup and read.
        for _ in 0..2 {
            let key = self
                .appointment_day
                .get(&id)
                .map(|d| *d)
                .ok_or_else(|| EngineError::not_found(format!("appointment {id}")))?;
            let Some(shard) = self.days.get(&key).map(|e| e.value().clone()) else {
                continue;
            };
            if let Some(appt) = shard.read().await.get(id) {
                return Ok(appt.clone());
            }
        }
        Err(EngineError::not_found(format!("appointment {id}")))
    }

    /// Every appointment on `day`, history included, ordered by start.
    pub async fn appointments_for_day(&self, day: DayKey) -> Vec<Appointment> {
        let Some(shard) = self.days.get(&day).map(|e| e.value().clone()) else {
            return Vec::new();
        };
        shard.read().await.appointments.clone()
    }

    /// A client's appointments, ordered by start.
    pub async fn appointments_for_user(&self, user_id: &str) -> Vec<Appointment> {
        let ids = self
            .by_user
            .get(user_id)
            .map(|ids| ids.clone())
            .unwrap_or_default();
        let mut found = Vec::with_capacity(ids.len());
        for id in ids {
            if let Ok(appt) = self.appointment(id).await {
                found.push(appt);
            }
        }
        found.sort_by_key(|a| (a.authoritative_start(), a.id));
        found
    }
}
