//! Newline-delimited JSON protocol.
//!
//! Each line from the client is one request object tagged by `op`. Each
//! request gets exactly one reply line, `{"ok":true,"data":...}` or
//! `{"ok":false,"error":{"kind":...,"message":...}}`. Live-query pushes
//! (`{"channel":...,"notification":...}`) are interleaved between replies.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, NaiveDate, Utc};
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_util::codec::{Framed, LinesCodec, LinesCodecError};
use ulid::Ulid;

use crate::auth::{AuthError, Authenticator, Identity, Role};
use crate::engine::{BookingRequest, Engine, EngineError};
use crate::limits::{MAX_LINE_LEN, MAX_LISTENS_PER_CONNECTION};
use crate::model::*;
use crate::observability;

#[derive(Debug, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum Request {
    Hello {
        role: Role,
        user_id: Option<String>,
        token: Option<String>,
    },
    GetSettings,
    PutSettings {
        settings: GlobalSettings,
    },
    PutService {
        id: Option<Ulid>,
        name: String,
        duration_min: i64,
        duration_max: Option<i64>,
        price: Option<i64>,
    },
    RemoveService {
        id: Ulid,
    },
    ListServices,
    Slots {
        date: NaiveDate,
        service_id: Ulid,
    },
    Book {
        id: Option<Ulid>,
        service_id: Ulid,
        start: DateTime<Utc>,
        notes: Option<String>,
        /// Operators book on behalf of a client.
        user_id: Option<String>,
    },
    Appointment {
        id: Ulid,
    },
    AppointmentsForDay {
        day: DayKey,
    },
    AppointmentsForUser {
        user_id: Option<String>,
    },
    Propose {
        id: Ulid,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        admin_notes: Option<String>,
    },
    Approve {
        id: Ulid,
        deposit_amount: Option<i64>,
        payment_due_at: Option<DateTime<Utc>>,
    },
    Accept {
        id: Ulid,
    },
    Reject {
        id: Ulid,
    },
    Cancel {
        id: Ulid,
    },
    PaymentReceived {
        id: Ulid,
    },
    Listen {
        channel: String,
    },
    Unlisten {
        channel: String,
    },
}

impl Request {
    pub fn op(&self) -> &'static str {
        match self {
            Request::Hello { .. } => "hello",
            Request::GetSettings => "get_settings",
            Request::PutSettings { .. } => "put_settings",
            Request::PutService { .. } => "put_service",
            Request::RemoveService { .. } => "remove_service",
            Request::ListServices => "list_services",
            Request::Slots { .. } => "slots",
            Request::Book { .. } => "book",
            Request::Appointment { .. } => "appointment",
            Request::AppointmentsForDay { .. } => "appointments_for_day",
            Request::AppointmentsForUser { .. } => "appointments_for_user",
            Request::Propose { .. } => "propose",
            Request::Approve { .. } => "approve",
            Request::Accept { .. } => "accept",
            Request::Reject { .. } => "reject",
            Request::Cancel { .. } => "cancel",
            Request::PaymentReceived { .. } => "payment_received",
            Request::Listen { .. } => "listen",
            Request::Unlisten { .. } => "unlisten",
        }
    }
}

#[derive(Debug, Error)]
pub enum WireError {
    #[error("malformed request: {0}")]
    Malformed(String),
    #[error("not allowed: {0}")]
    Forbidden(&'static str),
    #[error("authentication failed")]
    BadCredentials,
    #[error("limit exceeded: {0}")]
    LimitExceeded(&'static str),
    #[error(transparent)]
    Engine(#[from] EngineError),
}

impl WireError {
    pub fn kind(&self) -> &'static str {
        match self {
            WireError::Malformed(_) => "bad_request",
            WireError::Forbidden(_) => "forbidden",
            WireError::BadCredentials => "unauthorized",
            WireError::LimitExceeded(_) => "limit_exceeded",
            WireError::Engine(e) => e.kind(),
        }
    }

    pub fn user_message(&self) -> String {
        match self {
            WireError::Engine(e) => e.user_message(),
            other => other.to_string(),
        }
    }
}

impl From<AuthError> for WireError {
    fn from(e: AuthError) -> Self {
        match e {
            AuthError::BadToken => WireError::BadCredentials,
            AuthError::MissingUserId => WireError::Malformed("client hello needs a userId".into()),
        }
    }
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    kind: &'static str,
    message: String,
}

#[derive(Debug, Serialize)]
#[serde(untagged)]
enum Outbound {
    Success {
        ok: bool,
        data: Value,
    },
    Failure {
        ok: bool,
        error: ErrorBody,
    },
    Push {
        channel: String,
        notification: Notification,
    },
}

impl Outbound {
    fn reply(result: Result<Value, WireError>) -> Self {
        match result {
            Ok(data) => Outbound::Success { ok: true, data },
            Err(e) => Outbound::Failure {
                ok: false,
                error: ErrorBody {
                    kind: e.kind(),
                    message: e.user_message(),
                },
            },
        }
    }
}

fn to_data<T: Serialize>(value: T) -> Result<Value, WireError> {
    serde_json::to_value(value).map_err(|e| WireError::Malformed(e.to_string()))
}

/// Per-connection state: who is talking and which channels it follows.
pub struct Session {
    engine: Arc<Engine>,
    auth: Arc<Authenticator>,
    identity: Identity,
    listens: HashMap<String, JoinHandle<()>>,
    push_tx: mpsc::Sender<(String, Notification)>,
}

impl Drop for Session {
    fn drop(&mut self) {
        for (_, task) in self.listens.drain() {
            task.abort();
        }
    }
}

impl Session {
    fn new(engine: Arc<Engine>, auth: Arc<Authenticator>, push_tx: mpsc::Sender<(String, Notification)>) -> Self {
        Self {
            engine,
            auth,
            identity: Identity::Anonymous,
            listens: HashMap::new(),
            push_tx,
        }
    }

    fn require_operator(&self) -> Result<(), WireError> {
        if self.identity.is_operator() {
            Ok(())
        } else {
            Err(WireError::Forbidden("operator only"))
        }
    }

    /// Load an appointment the caller is allowed to see.
    async fn owned(&self, id: Ulid) -> Result<Appointment, WireError> {
        let appt = self.engine.appointment(id).await?;
        if !self.identity.may_access(&appt.user_id) {
            // Indistinguishable from a missing id.
            return Err(EngineError::not_found(format!("appointment {id}")).into());
        }
        Ok(appt)
    }

    fn may_listen(&self, channel: &str) -> bool {
        if channel == SETTINGS_CHANNEL {
            return true;
        }
        if let Some(user) = channel.strip_prefix("user_") {
            return self.identity.may_access(user);
        }
        channel.starts_with("day_") && self.identity.is_operator()
    }

    pub async fn execute(&mut self, req: Request) -> Result<Value, WireError> {
        let engine = self.engine.clone();
        match req {
            Request::Hello { role, user_id, token } => {
                // A failed hello must not leave the earlier identity in place.
                self.identity = Identity::Anonymous;
                let identity = match self.auth.hello(role, user_id, token.as_deref()) {
                    Ok(identity) => identity,
                    Err(e) => {
                        metrics::counter!(observability::AUTH_FAILURES_TOTAL).increment(1);
                        return Err(e.into());
                    }
                };
                self.identity = identity;
                let user_id = match &self.identity {
                    Identity::Client { user_id } => Some(user_id.clone()),
                    _ => None,
                };
                to_data(serde_json::json!({ "role": role, "userId": user_id }))
            }
            Request::GetSettings => to_data(engine.get_settings().await),
            Request::PutSettings { settings } => {
                self.require_operator()?;
                engine.update_settings(settings).await?;
                to_data(engine.get_settings().await)
            }
            Request::PutService { id, name, duration_min, duration_max, price } => {
                self.require_operator()?;
                let service = Service {
                    id: id.unwrap_or_else(Ulid::new),
                    name,
                    duration_min,
                    duration_max,
                    price,
                };
                engine.upsert_service(service.clone()).await?;
                to_data(service)
            }
            Request::RemoveService { id } => {
                self.require_operator()?;
                engine.remove_service(id).await?;
                Ok(Value::Null)
            }
            Request::ListServices => to_data(engine.list_services()),
            Request::Slots { date, service_id } => to_data(engine.available_slots(date, service_id).await?),
            Request::Book { id, service_id, start, notes, user_id } => {
                let user_id = match (&self.identity, user_id) {
                    (Identity::Client { user_id: me }, None) => me.clone(),
                    (Identity::Client { user_id: me }, Some(other)) if *me == other => other,
                    (Identity::Operator, Some(user_id)) => user_id,
                    (Identity::Operator, None) => {
                        return Err(WireError::Malformed("operator bookings need a userId".into()));
                    }
                    _ => return Err(WireError::Forbidden("say hello as a client before booking")),
                };
                let appt = engine
                    .request_appointment(BookingRequest {
                        id: id.unwrap_or_else(Ulid::new),
                        user_id,
                        service_id,
                        start,
                        notes,
                    })
                    .await?;
                to_data(appt)
            }
            Request::Appointment { id } => to_data(self.owned(id).await?),
            Request::AppointmentsForDay { day } => {
                self.require_operator()?;
                to_data(engine.appointments_for_day(day).await)
            }
            Request::AppointmentsForUser { user_id } => {
                let user_id = match (&self.identity, user_id) {
                    (Identity::Client { user_id: me }, None) => me.clone(),
                    (identity, Some(user_id)) if identity.may_access(&user_id) => user_id,
                    _ => return Err(WireError::Forbidden("cannot list another user's appointments")),
                };
                to_data(engine.appointments_for_user(&user_id).await)
            }
            Request::Propose { id, start, end, admin_notes } => {
                self.require_operator()?;
                to_data(engine.propose_time(id, start, end, admin_notes).await?)
            }
            Request::Approve { id, deposit_amount, payment_due_at } => {
                self.require_operator()?;
                let payment = match (deposit_amount, payment_due_at) {
                    (Some(amount), due) => Some((amount, due)),
                    (None, None) => None,
                    (None, Some(_)) => {
                        return Err(WireError::Malformed("paymentDueAt needs a depositAmount".into()));
                    }
                };
                to_data(engine.approve(id, payment).await?)
            }
            Request::Accept { id } => {
                self.owned(id).await?;
                to_data(engine.accept_adjustment(id).await?)
            }
            Request::Reject { id } => {
                self.owned(id).await?;
                to_data(engine.reject_adjustment(id).await?)
            }
            Request::Cancel { id } => {
                self.owned(id).await?;
                to_data(engine.cancel(id).await?)
            }
            Request::PaymentReceived { id } => {
                self.require_operator()?;
                to_data(engine.record_payment(id).await?)
            }
            Request::Listen { channel } => {
                if !self.may_listen(&channel) {
                    return Err(WireError::Forbidden("not allowed to listen on this channel"));
                }
                if !self.listens.contains_key(&channel) {
                    if self.listens.len() >= MAX_LISTENS_PER_CONNECTION {
                        return Err(WireError::LimitExceeded("too many listened channels"));
                    }
                    let rx = engine.notify.subscribe(&channel);
                    let task = tokio::spawn(forward(channel.clone(), rx, self.push_tx.clone()));
                    self.listens.insert(channel.clone(), task);
                }
                to_data(serde_json::json!({ "listening": channel }))
            }
            Request::Unlisten { channel } => {
                if let Some(task) = self.listens.remove(&channel) {
                    task.abort();
                }
                Ok(Value::Null)
            }
        }
    }
}

/// Copy one broadcast channel into the connection's outbound queue.
async fn forward(
    channel: String,
    mut rx: broadcast::Receiver<Notification>,
    tx: mpsc::Sender<(String, Notification)>,
) {
    loop {
        match rx.recv().await {
            Ok(notification) => {
                if tx.send((channel.clone(), notification)).await.is_err() {
                    return;
                }
            }
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                tracing::warn!("listener on {channel} lagged, {skipped} notifications dropped");
            }
            Err(broadcast::error::RecvError::Closed) => return,
        }
    }
}

async fn handle_line(session: &mut Session, line: &str) -> Outbound {
    let req: Request = match serde_json::from_str(line) {
        Ok(req) => req,
        Err(e) => {
            metrics::counter!(observability::REQUESTS_TOTAL, "op" => "unknown", "status" => "error")
                .increment(1);
            return Outbound::reply(Err(WireError::Malformed(e.to_string())));
        }
    };
    let op = req.op();
    let started = Instant::now();
    let result = session.execute(req).await;
    metrics::histogram!(observability::REQUEST_DURATION_SECONDS, "op" => op)
        .record(started.elapsed().as_secs_f64());
    let status = if result.is_ok() { "ok" } else { "error" };
    metrics::counter!(observability::REQUESTS_TOTAL, "op" => op, "status" => status).increment(1);
    if let Err(e) = &result {
        tracing::debug!("{op} failed: {e}");
    }
    Outbound::reply(result)
}

fn encode(msg: &Outbound) -> String {
    serde_json::to_string(msg).unwrap_or_else(|e| {
        format!(r#"{{"ok":false,"error":{{"kind":"internal","message":"{e}"}}}}"#)
    })
}

/// Serve one client until it disconnects.
pub async fn process_connection<S>(
    socket: S,
    engine: Arc<Engine>,
    auth: Arc<Authenticator>,
) -> Result<(), LinesCodecError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut framed = Framed::new(socket, LinesCodec::new_with_max_length(MAX_LINE_LEN));
    let (push_tx, mut push_rx) = mpsc::channel::<(String, Notification)>(256);
    let mut session = Session::new(engine, auth, push_tx);

    loop {
        tokio::select! {
            line = framed.next() => {
                let reply = match line {
                    None => return Ok(()),
                    Some(Ok(line)) if line.trim().is_empty() => continue,
                    Some(Ok(line)) => handle_line(&mut session, &line).await,
                    Some(Err(LinesCodecError::MaxLineLengthExceeded)) => {
                        Outbound::reply(Err(WireError::LimitExceeded("request line too long")))
                    }
                    Some(Err(e)) => return Err(e),
                };
                framed.send(encode(&reply)).await?;
            }
            Some((channel, notification)) = push_rx.recv() => {
                framed.send(encode(&Outbound::Push { channel, notification })).await?;
            }
        }
    }
}
