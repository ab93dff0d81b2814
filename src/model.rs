use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Unix milliseconds, used for interval arithmetic.
pub type Ms = i64;

pub const MINUTE_MS: Ms = 60_000;

/// Half-open interval `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Span {
    pub start: Ms,
    pub end: Ms,
}

impl Span {
    pub fn new(start: Ms, end: Ms) -> Self {
        debug_assert!(start < end, "Span start must be before end");
        Self { start, end }
    }

    pub fn from_instants(start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        Self::new(start.timestamp_millis(), end.timestamp_millis())
    }

    pub fn duration_ms(&self) -> Ms {
        self.end - self.start
    }

    /// Back-to-back spans (one's end equals the other's start) do not overlap.
    pub fn overlaps(&self, other: &Span) -> bool {
        self.start < other.end && other.start < self.end
    }
}

/// Calendar date in the provider's timezone, rendered `YYYY-MM-DD`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DayKey(pub NaiveDate);

impl DayKey {
    pub fn date(&self) -> NaiveDate {
        self.0
    }

    /// Channel name of the "appointments where dayKey = X" live query.
    pub fn channel(&self) -> String {
        format!("day_{self}")
    }
}

impl fmt::Display for DayKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.format("%Y-%m-%d"))
    }
}

impl FromStr for DayKey {
    type Err = chrono::ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        NaiveDate::parse_from_str(s, "%Y-%m-%d").map(DayKey)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WeekdayKey {
    Sun,
    Mon,
    Tue,
    Wed,
    Thu,
    Fri,
    Sat,
}

impl WeekdayKey {
    pub fn as_str(&self) -> &'static str {
        match self {
            WeekdayKey::Sun => "sun",
            WeekdayKey::Mon => "mon",
            WeekdayKey::Tue => "tue",
            WeekdayKey::Wed => "wed",
            WeekdayKey::Thu => "thu",
            WeekdayKey::Fri => "fri",
            WeekdayKey::Sat => "sat",
        }
    }
}

impl From<chrono::Weekday> for WeekdayKey {
    fn from(w: chrono::Weekday) -> Self {
        match w {
            chrono::Weekday::Sun => WeekdayKey::Sun,
            chrono::Weekday::Mon => WeekdayKey::Mon,
            chrono::Weekday::Tue => WeekdayKey::Tue,
            chrono::Weekday::Wed => WeekdayKey::Wed,
            chrono::Weekday::Thu => WeekdayKey::Thu,
            chrono::Weekday::Fri => WeekdayKey::Fri,
            chrono::Weekday::Sat => WeekdayKey::Sat,
        }
    }
}

/// Opening window for one weekday, wall-clock `HH:mm` in the provider timezone.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DayHours {
    pub enabled: bool,
    pub start: String,
    pub end: String,
}

impl DayHours {
    pub fn open(start: &str, end: &str) -> Self {
        Self {
            enabled: true,
            start: start.to_string(),
            end: end.to_string(),
        }
    }

    pub fn closed() -> Self {
        Self {
            enabled: false,
            start: "00:00".to_string(),
            end: "00:00".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BusinessHours {
    pub mon: DayHours,
    pub tue: DayHours,
    pub wed: DayHours,
    pub thu: DayHours,
    pub fri: DayHours,
    pub sat: DayHours,
    pub sun: DayHours,
}

impl BusinessHours {
    pub fn get(&self, day: WeekdayKey) -> &DayHours {
        match day {
            WeekdayKey::Mon => &self.mon,
            WeekdayKey::Tue => &self.tue,
            WeekdayKey::Wed => &self.wed,
            WeekdayKey::Thu => &self.thu,
            WeekdayKey::Fri => &self.fri,
            WeekdayKey::Sat => &self.sat,
            WeekdayKey::Sun => &self.sun,
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (WeekdayKey, &DayHours)> {
        [
            (WeekdayKey::Mon, &self.mon),
            (WeekdayKey::Tue, &self.tue),
            (WeekdayKey::Wed, &self.wed),
            (WeekdayKey::Thu, &self.thu),
            (WeekdayKey::Fri, &self.fri),
            (WeekdayKey::Sat, &self.sat),
            (WeekdayKey::Sun, &self.sun),
        ]
        .into_iter()
    }
}

impl Default for BusinessHours {
    fn default() -> Self {
        Self {
            mon: DayHours::open("09:00", "17:00"),
            tue: DayHours::open("09:00", "17:00"),
            wed: DayHours::open("09:00", "17:00"),
            thu: DayHours::open("09:00", "17:00"),
            fri: DayHours::open("09:00", "17:00"),
            sat: DayHours::closed(),
            sun: DayHours::closed(),
        }
    }
}

/// Provider-wide singleton. Passed explicitly into every scheduling function.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GlobalSettings {
    pub timezone: String,
    pub business_hours: BusinessHours,
    #[serde(default = "default_slot_interval")]
    pub slot_interval_minutes: i64,
    #[serde(default = "default_min_lead")]
    pub booking_min_lead_minutes: i64,
    #[serde(default = "default_max_days")]
    pub booking_max_days: i64,
    #[serde(default)]
    pub payments_enabled: bool,
}

fn default_slot_interval() -> i64 {
    30
}

fn default_min_lead() -> i64 {
    60
}

fn default_max_days() -> i64 {
    30
}

impl Default for GlobalSettings {
    fn default() -> Self {
        Self {
            timezone: "UTC".to_string(),
            business_hours: BusinessHours::default(),
            slot_interval_minutes: default_slot_interval(),
            booking_min_lead_minutes: default_min_lead(),
            booking_max_days: default_max_days(),
            payments_enabled: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Service {
    pub id: Ulid,
    pub name: String,
    pub duration_min: i64,
    #[serde(default)]
    pub duration_max: Option<i64>,
    /// Minor currency units. `None` means quote-only: the price is set after assessment.
    #[serde(default)]
    pub price: Option<i64>,
}

impl Service {
    pub fn is_quote_only(&self) -> bool {
        self.price.is_none()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AppointmentStatus {
    Requested,
    Adjusted,
    AwaitingPayment,
    Confirmed,
    Cancelled,
    Expired,
}

impl AppointmentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AppointmentStatus::Requested => "requested",
            AppointmentStatus::Adjusted => "adjusted",
            AppointmentStatus::AwaitingPayment => "awaiting_payment",
            AppointmentStatus::Confirmed => "confirmed",
            AppointmentStatus::Cancelled => "cancelled",
            AppointmentStatus::Expired => "expired",
        }
    }

    /// Statuses that occupy calendar time.
    pub fn is_blocking(&self) -> bool {
        matches!(
            self,
            AppointmentStatus::Requested
                | AppointmentStatus::AwaitingPayment
                | AppointmentStatus::Confirmed
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, AppointmentStatus::Cancelled | AppointmentStatus::Expired)
    }
}

impl fmt::Display for AppointmentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Persisted appointment document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Appointment {
    pub id: Ulid,
    pub user_id: String,
    pub service_id: Ulid,
    pub service_name: String,
    pub price: Option<i64>,
    pub requested_start_at: DateTime<Utc>,
    pub final_start_at: Option<DateTime<Utc>>,
    pub final_end_at: Option<DateTime<Utc>>,
    pub day_key: DayKey,
    pub duration_minutes: Option<i64>,
    pub notes: Option<String>,
    pub admin_notes: Option<String>,
    pub deposit_amount: Option<i64>,
    pub payment_due_at: Option<DateTime<Utc>>,
    pub status: AppointmentStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Appointment {
    /// The start time that is currently authoritative: the operator's final
    /// time once set, the client's requested time otherwise.
    pub fn authoritative_start(&self) -> DateTime<Utc> {
        self.final_start_at.unwrap_or(self.requested_start_at)
    }

    /// Channel name of the "appointments where userId = U" live query.
    pub fn user_channel(&self) -> String {
        user_channel(&self.user_id)
    }
}

pub fn user_channel(user_id: &str) -> String {
    format!("user_{user_id}")
}

pub const SETTINGS_CHANNEL: &str = "settings";

/// Ephemeral slot offered to a client. Never persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CandidateSlot {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    /// Local wall-clock start, `HH:mm`.
    pub label: String,
}

/// Event descriptor emitted by every applied transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    Requested,
    Adjusted,
    AdjustmentAccepted,
    AdjustmentRejected,
    Approved,
    PaymentRequested,
    PaymentReceived,
    Expired,
    Cancelled,
    SettingsChanged,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Notification {
    #[serde(rename = "type")]
    pub kind: NotificationKind,
    pub appointment_id: Option<Ulid>,
    pub appointment: Option<Appointment>,
}

impl Notification {
    pub fn for_appointment(kind: NotificationKind, appointment: &Appointment) -> Self {
        Self {
            kind,
            appointment_id: Some(appointment.id),
            appointment: Some(appointment.clone()),
        }
    }

    pub fn settings_changed() -> Self {
        Self {
            kind: NotificationKind::SettingsChanged,
            appointment_id: None,
            appointment: None,
        }
    }
}

/// WAL record format. Appointment records carry full document snapshots.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    SettingsUpdated(GlobalSettings),
    ServiceUpserted(Service),
    ServiceRemoved {
        id: Ulid,
    },
    AppointmentCreated(Appointment),
    AppointmentChanged {
        previous_day: DayKey,
        appointment: Appointment,
    },
}
