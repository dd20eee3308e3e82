//! Core domain model for the hubcal event aggregation pipeline.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use uuid::Uuid;

pub const CRATE_NAME: &str = "hubcal-core";

#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("unknown {what}: {value}")]
pub struct UnknownVariant {
    pub what: &'static str,
    pub value: String,
}

/// Category of external origin for imported events.
///
/// The kind decides which adapter handles a source and how external
/// identities are derived, so it never changes after the source is created.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SourceKind {
    GroupPlatform,
    RegistrationPlatform,
    GenericFeed,
}

impl SourceKind {
    pub const ALL: [SourceKind; 3] = [
        SourceKind::GroupPlatform,
        SourceKind::RegistrationPlatform,
        SourceKind::GenericFeed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            SourceKind::GroupPlatform => "group-platform",
            SourceKind::RegistrationPlatform => "registration-platform",
            SourceKind::GenericFeed => "generic-feed",
        }
    }

    /// Whether adapters of this kind always hand out a stable native id.
    /// Generic feeds may omit `UID`, in which case identity falls back to a content hash.
    pub fn guarantees_native_id(&self) -> bool {
        !matches!(self, SourceKind::GenericFeed)
    }
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SourceKind {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "group-platform" => Ok(SourceKind::GroupPlatform),
            "registration-platform" => Ok(SourceKind::RegistrationPlatform),
            "generic-feed" => Ok(SourceKind::GenericFeed),
            other => Err(UnknownVariant {
                what: "source kind",
                value: other.to_string(),
            }),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EventKind {
    Virtual,
    InPerson,
    Hybrid,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Virtual => "virtual",
            EventKind::InPerson => "in-person",
            EventKind::Hybrid => "hybrid",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventKind {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "virtual" => Ok(EventKind::Virtual),
            "in-person" => Ok(EventKind::InPerson),
            "hybrid" => Ok(EventKind::Hybrid),
            other => Err(UnknownVariant {
                what: "event kind",
                value: other.to_string(),
            }),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventOrigin {
    Internal,
    Imported,
}

impl EventOrigin {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventOrigin::Internal => "internal",
            EventOrigin::Imported => "imported",
        }
    }
}

impl FromStr for EventOrigin {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "internal" => Ok(EventOrigin::Internal),
            "imported" => Ok(EventOrigin::Imported),
            other => Err(UnknownVariant {
                what: "event origin",
                value: other.to_string(),
            }),
        }
    }
}

/// Approval state owned by the approval workflow. The pipeline only reads it,
/// except for the initial value given to freshly imported rows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PublicationStatus {
    Pending,
    Published,
    Rejected,
}

impl PublicationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PublicationStatus::Pending => "pending",
            PublicationStatus::Published => "published",
            PublicationStatus::Rejected => "rejected",
        }
    }
}

impl FromStr for PublicationStatus {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "pending" => Ok(PublicationStatus::Pending),
            "published" => Ok(PublicationStatus::Published),
            "rejected" => Ok(PublicationStatus::Rejected),
            other => Err(UnknownVariant {
                what: "publication status",
                value: other.to_string(),
            }),
        }
    }
}

/// Configured external origin of imported events.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventSource {
    pub id: Uuid,
    pub display_name: String,
    pub kind: SourceKind,
    pub url: String,
    pub active: bool,
    pub last_synced_at: Option<DateTime<Utc>>,
    pub last_sync_error: Option<String>,
    pub imported_count: i64,
    pub owner_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl EventSource {
    pub fn health(&self) -> SourceHealth {
        match (&self.last_synced_at, &self.last_sync_error) {
            (None, _) => SourceHealth::NeverSynced,
            (Some(_), Some(_)) => SourceHealth::Failing,
            (Some(_), None) => SourceHealth::Healthy,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewEventSource {
    pub display_name: String,
    pub kind: SourceKind,
    pub url: String,
    pub active: bool,
    pub owner_id: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceHealth {
    NeverSynced,
    Healthy,
    Failing,
}

/// Persisted result of one sync run, applied to the source row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncOutcome {
    pub finished_at: DateTime<Utc>,
    pub error: Option<String>,
    pub inserted: u64,
}

/// Start of an event in the hub timezone. A missing time means all-day.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StartInstant {
    pub date: NaiveDate,
    pub time: Option<NaiveTime>,
}

impl StartInstant {
    pub fn all_day(date: NaiveDate) -> Self {
        Self { date, time: None }
    }

    pub fn at(date: NaiveDate, time: NaiveTime) -> Self {
        Self {
            date,
            time: Some(time),
        }
    }
}

impl fmt::Display for StartInstant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.time {
            Some(time) => write!(f, "{}T{}", self.date.format("%Y-%m-%d"), time.format("%H:%M:%S")),
            None => write!(f, "{}", self.date.format("%Y-%m-%d")),
        }
    }
}

/// Adapter handoff contract: one upstream event before normalization.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RawItem {
    pub native_id: Option<String>,
    pub title: Option<String>,
    pub description: Option<String>,
    pub start: Option<StartInstant>,
    pub location: Option<String>,
    pub capacity: Option<i64>,
    pub registration_url: Option<String>,
    /// Attendance mode stated by the upstream payload, when it states one.
    pub attendance_hint: Option<EventKind>,
}

/// A single upstream item that could not be turned into an event.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("{item}: {reason}")]
pub struct ItemError {
    pub item: String,
    pub reason: String,
}

impl ItemError {
    pub fn new(item: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            item: item.into(),
            reason: reason.into(),
        }
    }
}

/// Fields an import owns. A resync overwrites every one of them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventFields {
    pub title: String,
    pub description: String,
    pub start_date: NaiveDate,
    pub start_time: Option<NaiveTime>,
    pub location: Option<String>,
    pub event_kind: EventKind,
    pub capacity: Option<i64>,
    pub registration_url: Option<String>,
}

impl EventFields {
    pub fn start(&self) -> StartInstant {
        StartInstant {
            date: self.start_date,
            time: self.start_time,
        }
    }
}

/// Unified representation of an event regardless of origin.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CanonicalEvent {
    pub id: Uuid,
    pub title: String,
    pub description: String,
    pub start_date: NaiveDate,
    pub start_time: Option<NaiveTime>,
    pub location: Option<String>,
    pub event_kind: EventKind,
    pub capacity: Option<i64>,
    pub attendee_count: i64,
    pub registration_url: Option<String>,
    pub origin: EventOrigin,
    pub status: PublicationStatus,
    pub source_id: Option<Uuid>,
    pub external_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl CanonicalEvent {
    pub fn fields(&self) -> EventFields {
        EventFields {
            title: self.title.clone(),
            description: self.description.clone(),
            start_date: self.start_date,
            start_time: self.start_time,
            location: self.location.clone(),
            event_kind: self.event_kind,
            capacity: self.capacity,
            registration_url: self.registration_url.clone(),
        }
    }

    pub fn apply_fields(&mut self, fields: &EventFields) {
        self.title = fields.title.clone();
        self.description = fields.description.clone();
        self.start_date = fields.start_date;
        self.start_time = fields.start_time;
        self.location = fields.location.clone();
        self.event_kind = fields.event_kind;
        self.capacity = fields.capacity;
        self.registration_url = fields.registration_url.clone();
    }
}

/// Stable key distinguishing one externally sourced item within a source.
///
/// Sources with a stable native id use `"{source_id}:{native_id}"`. Without
/// one, the key is a content hash over (title, start, source id); two distinct
/// upstream events sharing a title and start time in one feed collapse into a
/// single canonical event. That collision is an accepted limitation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ExternalIdentity(String);

impl ExternalIdentity {
    pub fn from_native(source_id: Uuid, native_id: &str) -> Self {
        Self(format!("{}:{}", source_id, native_id.trim()))
    }

    pub fn from_content(source_id: Uuid, title: &str, start: &StartInstant) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(title.trim().as_bytes());
        hasher.update([0x1f]);
        hasher.update(start.to_string().as_bytes());
        hasher.update([0x1f]);
        hasher.update(source_id.as_bytes());
        Self(format!("{}:sha256:{}", source_id, hex::encode(hasher.finalize())))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ExternalIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Per-source sync state machine phases.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncPhase {
    Idle,
    Fetching,
    Parsing,
    Merging,
    Succeeded,
    Failed,
}

/// Outcome of one orchestrator run over one source. Only the counters and the
/// error message outlive the run, on the source row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncResult {
    pub source_id: Uuid,
    pub inserted: u64,
    pub updated: u64,
    pub unchanged: u64,
    pub skipped: u64,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub item_errors: Vec<ItemError>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub phase: SyncPhase,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl SyncResult {
    pub fn succeeded(&self) -> bool {
        self.phase == SyncPhase::Succeeded && self.error.is_none()
    }
}

/// Which events a feed request wants. Derived per request, never stored as-is.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeedSelection {
    pub source_ids: BTreeSet<Uuid>,
    pub include_all: bool,
    pub include_internal: bool,
    pub user_id: Option<String>,
}

impl FeedSelection {
    pub fn everything() -> Self {
        Self {
            source_ids: BTreeSet::new(),
            include_all: true,
            include_internal: true,
            user_id: None,
        }
    }

    pub fn only_sources(ids: impl IntoIterator<Item = Uuid>, include_internal: bool) -> Self {
        Self {
            source_ids: ids.into_iter().collect(),
            include_all: false,
            include_internal,
            user_id: None,
        }
    }

    pub fn from_preference(pref: &FeedPreference, include_internal: bool) -> Self {
        Self {
            source_ids: pref.selected_sources.iter().copied().collect(),
            include_all: pref.include_all_sources,
            include_internal,
            user_id: Some(pref.user_id.clone()),
        }
    }
}

/// Saved per-user feed preference.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeedPreference {
    pub user_id: String,
    pub include_all_sources: bool,
    pub selected_sources: Vec<Uuid>,
    pub updated_at: DateTime<Utc>,
}
