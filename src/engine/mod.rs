pub mod calendar;
pub mod conflict;
mod error;
pub mod lifecycle;
mod mutations;
pub mod policy;
mod queries;
pub mod slots;
pub mod timezone;

pub use error::{EngineError, PolicyViolation};
pub use lifecycle::{Action, BookingRequest};

use std::collections::BTreeMap;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot, OwnedRwLockWriteGuard, RwLock};
use ulid::Ulid;

use crate::clock::Clock;
use crate::model::*;
use crate::notify::NotifyHub;
use crate::observability;
use crate::wal::Wal;

/// Appointments whose current `dayKey` is one provider-local date, kept
/// sorted by authoritative start. Cancelled and expired ones stay as history.
#[derive(Debug)]
pub struct DayState {
    pub key: DayKey,
    pub appointments: Vec<Appointment>,
}

impl DayState {
    fn new(key: DayKey) -> Self {
        Self {
            key,
            appointments: Vec::new(),
        }
    }

    pub fn get(&self, id: Ulid) -> Option<&Appointment> {
        self.appointments.iter().find(|a| a.id == id)
    }

    fn upsert(&mut self, appt: Appointment) {
        self.remove(appt.id);
        let start = appt.authoritative_start();
        let pos = self
            .appointments
            .partition_point(|a| a.authoritative_start() <= start);
        self.appointments.insert(pos, appt);
    }

    fn remove(&mut self, id: Ulid) -> Option<Appointment> {
        let pos = self.appointments.iter().position(|a| a.id == id)?;
        Some(self.appointments.remove(pos))
    }
}

pub type SharedDayState = Arc<RwLock<DayState>>;

// ── Group-commit WAL channel ─────────────────────────────

const PENDING: u8 = 0;
const CLAIMED: u8 = 1;
const ABANDONED: u8 = 2;

/// Ownership of one queued append. The writer claims it before buffering the
/// record; a caller whose write timeout fires abandons it. Exactly one wins,
/// so an abandoned record is never written and a claimed one is always reported.
#[derive(Clone, Default)]
pub(super) struct Claim(Arc<AtomicU8>);

impl Claim {
    fn claim(&self) -> bool {
        self.transition(CLAIMED)
    }

    fn abandon(&self) -> bool {
        self.transition(ABANDONED)
    }

    fn transition(&self, to: u8) -> bool {
        self.0
            .compare_exchange(PENDING, to, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}

pub(super) struct PendingAppend {
    event: Event,
    claim: Claim,
    response: oneshot::Sender<io::Result<()>>,
}

pub(super) enum WalCommand {
    Append(PendingAppend),
    Compact {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

/// Owns the journal. Blocks for one append, drains whatever else is already
/// queued, then commits the whole batch with a single fsync.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        let first = match cmd {
            WalCommand::Append(pending) => pending,
            other => {
                handle_non_append(&mut wal, other);
                continue;
            }
        };
        let mut batch = vec![first];
        let mut deferred = None;
        loop {
            match rx.try_recv() {
                Ok(WalCommand::Append(pending)) => batch.push(pending),
                Ok(other) => {
                    deferred = Some(other);
                    break;
                }
                Err(_) => break,
            }
        }
        commit_batch(&mut wal, batch);
        if let Some(cmd) = deferred {
            handle_non_append(&mut wal, cmd);
        }
    }
}

fn commit_batch(wal: &mut Wal, mut batch: Vec<PendingAppend>) {
    // Abandoned appends were reported as failed and must never reach disk.
    batch.retain(|pending| pending.claim.claim());
    if batch.is_empty() {
        return;
    }
    metrics::histogram!(observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
    let started = std::time::Instant::now();
    let result = flush_batch(wal, &batch);
    metrics::histogram!(observability::WAL_FLUSH_DURATION_SECONDS)
        .record(started.elapsed().as_secs_f64());
    if let Err(e) = &result {
        tracing::error!("journal flush failed for {} records: {e}", batch.len());
    }
    for pending in batch {
        let _ = pending.response.send(match &result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        });
    }
}

/// Write and fsync the batch, or leave the journal exactly as it was.
fn flush_batch(wal: &mut Wal, batch: &[PendingAppend]) -> io::Result<()> {
    let result = batch
        .iter()
        .try_for_each(|pending| wal.append_buffered(&pending.event))
        .and_then(|()| wal.flush_sync());
    if result.is_err()
        && let Err(e) = wal.discard_unflushed()
    {
        tracing::error!("journal rollback failed, refusing further appends: {e}");
    }
    result
}

fn handle_non_append(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { events, response } => {
            let result = Wal::write_compact_file(wal.path(), &events)
                .and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append(pending) => commit_batch(wal, vec![pending]),
    }
}

/// In-memory calendar rebuilt from the journal before any lock exists.
#[derive(Default)]
struct Replayed {
    settings: GlobalSettings,
    services: BTreeMap<Ulid, Service>,
    days: BTreeMap<DayKey, DayState>,
}

impl Replayed {
    fn apply(&mut self, event: Event) {
        match event {
            Event::SettingsUpdated(settings) => self.settings = settings,
            Event::ServiceUpserted(service) => {
                self.services.insert(service.id, service);
            }
            Event::ServiceRemoved { id } => {
                self.services.remove(&id);
            }
            Event::AppointmentCreated(appt) => self.place(appt),
            Event::AppointmentChanged {
                previous_day,
                appointment,
            } => {
                if let Some(day) = self.days.get_mut(&previous_day) {
                    day.remove(appointment.id);
                }
                self.place(appointment);
            }
        }
    }

    fn place(&mut self, appt: Appointment) {
        self.days
            .entry(appt.day_key)
            .or_insert_with(|| DayState::new(appt.day_key))
            .upsert(appt);
    }
}

/// Write guards over one or two day shards, taken in key order.
pub(super) struct DayLocks {
    guards: Vec<OwnedRwLockWriteGuard<DayState>>,
}

impl DayLocks {
    pub(super) fn day(&self, key: DayKey) -> Option<&DayState> {
        self.guards.iter().map(|g| &**g).find(|d| d.key == key)
    }

    fn day_mut(&mut self, key: DayKey) -> Option<&mut DayState> {
        self.guards.iter_mut().map(|g| &mut **g).find(|d| d.key == key)
    }

    fn holds(&self, key: DayKey) -> bool {
        self.day(key).is_some()
    }
}

pub struct Engine {
    pub(super) days: DashMap<DayKey, SharedDayState>,
    /// Reverse lookup: appointment id → shard currently holding it.
    pub(super) appointment_day: DashMap<Ulid, DayKey>,
    pub(super) by_user: DashMap<String, Vec<Ulid>>,
    pub(super) services: DashMap<Ulid, Service>,
    pub(super) settings: RwLock<GlobalSettings>,
    /// Serializes service upserts so journal order matches memory order.
    pub(super) services_lock: tokio::sync::Mutex<()>,
    /// Mutations hold it shared for their whole commit; compaction takes it
    /// exclusively so no append can fall between snapshot and swap.
    pub(super) compaction_gate: RwLock<()>,
    pub(super) wal_tx: mpsc::Sender<WalCommand>,
    pub notify: Arc<NotifyHub>,
    pub(super) clock: Arc<dyn Clock>,
    pub(super) write_timeout: Duration,
}

impl Engine {
    /// Replay the journal at `wal_path` and start its writer task.
    /// Must be called from inside a tokio runtime.
    pub fn new(
        wal_path: PathBuf,
        notify: Arc<NotifyHub>,
        clock: Arc<dyn Clock>,
        write_timeout: Duration,
    ) -> io::Result<Self> {
        let events = Wal::replay(&wal_path)?;
        let replayed_count = events.len();
        let mut replayed = Replayed::default();
        for event in events {
            replayed.apply(event);
        }

        let wal = Wal::open(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let engine = Self {
            days: DashMap::new(),
            appointment_day: DashMap::new(),
            by_user: DashMap::new(),
            services: replayed.services.into_iter().collect(),
            settings: RwLock::new(replayed.settings),
            services_lock: tokio::sync::Mutex::new(()),
            compaction_gate: RwLock::new(()),
            wal_tx,
            notify,
            clock,
            write_timeout,
        };
        for (key, day) in replayed.days {
            for appt in &day.appointments {
                engine.index(appt);
            }
            engine.days.insert(key, Arc::new(RwLock::new(day)));
        }
        tracing::info!(
            "replayed {replayed_count} journal records: {} services, {} appointments",
            engine.services.len(),
            engine.appointment_day.len()
        );
        Ok(engine)
    }

    /// Hand an event to the group-commit writer and wait for its fsync.
    ///
    /// `Ok` means the record is durable; `Err` means it never will be. If the
    /// write timeout fires after the writer claimed the record, the caller
    /// keeps waiting for the writer's verdict instead of guessing.
    pub(super) async fn wal_append(&self, event: &Event) -> Result<(), EngineError> {
        let deadline = tokio::time::Instant::now() + self.write_timeout;
        let claim = Claim::default();
        let (tx, mut rx) = oneshot::channel();
        let command = WalCommand::Append(PendingAppend {
            event: event.clone(),
            claim: claim.clone(),
            response: tx,
        });
        match tokio::time::timeout_at(deadline, self.wal_tx.send(command)).await {
            Ok(Ok(())) => {}
            Ok(Err(_)) => return Err(EngineError::StoreUnavailable("journal writer shut down".into())),
            Err(_) => return Err(self.write_timed_out()),
        }
        let waited = tokio::time::timeout_at(deadline, &mut rx).await;
        let outcome = match waited {
            Ok(outcome) => outcome,
            Err(_) if claim.abandon() => return Err(self.write_timed_out()),
            Err(_) => rx.await,
        };
        outcome
            .map_err(|_| EngineError::StoreUnavailable("journal writer dropped response".into()))?
            .map_err(|e| EngineError::StoreUnavailable(e.to_string()))
    }

    fn write_timed_out(&self) -> EngineError {
        metrics::counter!(observability::WAL_WRITE_TIMEOUTS_TOTAL).increment(1);
        EngineError::StoreUnavailable(format!(
            "journal write timed out after {}ms",
            self.write_timeout.as_millis()
        ))
    }

    pub(super) async fn wal_command<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> WalCommand,
    ) -> Result<T, EngineError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(build(tx))
            .await
            .map_err(|_| EngineError::StoreUnavailable("journal writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::StoreUnavailable("journal writer dropped response".into()))
    }

    pub(super) fn day_shard(&self, key: DayKey) -> SharedDayState {
        self.days
            .entry(key)
            .or_insert_with(|| Arc::new(RwLock::new(DayState::new(key))))
            .clone()
    }

    /// Lock `a` and `b` for writing in sorted order (one lock if equal).
    pub(super) async fn lock_days(&self, a: DayKey, b: DayKey) -> DayLocks {
        let (first, second) = if a <= b { (a, b) } else { (b, a) };
        let mut guards = vec![self.day_shard(first).write_owned().await];
        if second != first {
            guards.push(self.day_shard(second).write_owned().await);
        }
        DayLocks { guards }
    }

    fn index(&self, appt: &Appointment) {
        self.appointment_day.insert(appt.id, appt.day_key);
        let mut ids = self.by_user.entry(appt.user_id.clone()).or_default();
        if !ids.contains(&appt.id) {
            ids.push(appt.id);
        }
    }

    /// Move a committed snapshot into its shard. Caller holds both day locks.
    pub(super) fn apply_change(&self, locks: &mut DayLocks, previous_day: DayKey, appt: &Appointment) {
        if let Some(day) = locks.day_mut(previous_day) {
            day.remove(appt.id);
        }
        if let Some(day) = locks.day_mut(appt.day_key) {
            day.upsert(appt.clone());
        }
        self.index(appt);
    }

    /// Publish to the user's channel and to every day channel the change touched.
    pub(super) fn publish(&self, days: &[DayKey], appt: &Appointment, notification: &Notification) {
        let mut days = days.to_vec();
        days.sort();
        days.dedup();
        for day in days {
            self.notify.send(&day.channel(), notification);
        }
        self.notify.send(&appt.user_channel(), notification);
    }
}
