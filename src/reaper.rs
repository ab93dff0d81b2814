use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::engine::Engine;
use crate::observability;

/// Expire every overdue awaiting-payment appointment once. Returns how many moved.
pub async fn sweep_once(engine: &Engine) -> usize {
    let now = engine.clock.now();
    let mut expired = 0;
    for id in engine.collect_overdue_payments(now) {
        match engine.expire(id).await {
            Ok(_) => {
                expired += 1;
                info!("expired unpaid appointment {id}");
            }
            // Paid or cancelled since it was collected.
            Err(e) => debug!("sweep skip {id}: {e}"),
        }
    }
    if expired > 0 {
        metrics::counter!(observability::EXPIRED_TOTAL).increment(expired as u64);
    }
    expired
}

/// Background task: payment-deadline sweep every `period`.
pub async fn run_expiry_sweep(engine: Arc<Engine>, period: Duration) {
    let mut interval = tokio::time::interval(period);
    loop {
        interval.tick().await;
        sweep_once(&engine).await;
        engine.notify.prune();
    }
}

/// Background task: compact the journal once enough records piled up.
pub async fn run_compactor(engine: Arc<Engine>, threshold: u64) {
    let mut interval = tokio::time::interval(Duration::from_secs(30));
    loop {
        interval.tick().await;
        let appends = engine.wal_appends_since_compact().await;
        if appends < threshold {
            continue;
        }
        if let Err(e) = engine.compact_wal().await {
            warn!("journal compaction failed after {appends} appends: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::engine::BookingRequest;
    use crate::model::*;
    use crate::notify::NotifyHub;
    use chrono::TimeZone;
    use std::path::PathBuf;
    use ulid::Ulid;

    fn test_wal_path(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("slotwise_test_reaper");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        let _ = std::fs::remove_file(&path);
        path
    }

    #[tokio::test]
    async fn sweep_expires_only_overdue_payments() {
        let path = test_wal_path("sweep.wal");
        let clock = Arc::new(ManualClock::new(
            chrono::Utc.with_ymd_and_hms(2026, 10, 18, 12, 0, 0).unwrap(),
        ));
        let dyn_clock: Arc<dyn Clock> = clock.clone();
        let engine = Engine::new(path, Arc::new(NotifyHub::new()), dyn_clock, Duration::from_secs(5)).unwrap();

        let mut settings = engine.get_settings().await;
        settings.payments_enabled = true;
        engine.update_settings(settings).await.unwrap();
        let service = Service {
            id: Ulid::new(),
            name: "Massage".into(),
            duration_min: 60,
            duration_max: None,
            price: Some(6000),
        };
        engine.upsert_service(service.clone()).await.unwrap();

        let mut ids = Vec::new();
        for (hour, due_hours) in [(10, 1), (12, 6)] {
            let appt = engine
                .request_appointment(BookingRequest {
                    id: Ulid::new(),
                    user_id: "sam".into(),
                    service_id: service.id,
                    start: chrono::Utc.with_ymd_and_hms(2026, 10, 19, hour, 0, 0).unwrap(),
                    notes: None,
                })
                .await
                .unwrap();
            let due = clock.now() + chrono::Duration::hours(due_hours);
            engine.approve(appt.id, Some((1500, Some(due)))).await.unwrap();
            ids.push(appt.id);
        }

        assert_eq!(sweep_once(&engine).await, 0);
        clock.advance(chrono::Duration::hours(2));
        assert_eq!(sweep_once(&engine).await, 1);
        assert_eq!(engine.appointment(ids[0]).await.unwrap().status, AppointmentStatus::Expired);
        assert_eq!(engine.appointment(ids[1]).await.unwrap().status, AppointmentStatus::AwaitingPayment);

        // Second pass finds nothing new.
        assert_eq!(sweep_once(&engine).await, 0);
    }
}
