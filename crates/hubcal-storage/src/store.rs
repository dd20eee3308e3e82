use std::collections::BTreeSet;

use async_trait::async_trait;
use chrono::NaiveDate;
use hubcal_core::{
    CanonicalEvent, EventFields, EventSource, FeedPreference, FeedSelection, NewEventSource,
    PublicationStatus, SourceKind, SyncOutcome,
};
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("external identity {external_id} is already claimed in source {source_id}")]
    Conflict { source_id: Uuid, external_id: String },
    #[error("{what} {id} not found")]
    NotFound { what: &'static str, id: String },
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("invalid stored row: {0}")]
    InvalidRow(String),
    #[error(transparent)]
    Database(#[from] sqlx::Error),
    #[error(transparent)]
    Migration(#[from] sqlx::migrate::MigrateError),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceScope {
    /// Events of every source whose active flag is set.
    AllActive,
    Only(BTreeSet<Uuid>),
}

/// Store-level form of a feed selection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeedFilter {
    pub scope: SourceScope,
    pub include_internal: bool,
    pub starts_on_or_after: Option<NaiveDate>,
}

impl FeedFilter {
    pub fn from_selection(selection: &FeedSelection, starts_on_or_after: Option<NaiveDate>) -> Self {
        let scope = if selection.include_all {
            SourceScope::AllActive
        } else {
            SourceScope::Only(selection.source_ids.clone())
        };
        Self {
            scope,
            include_internal: selection.include_internal,
            starts_on_or_after,
        }
    }

    /// Same predicate the Postgres feed query encodes.
    pub fn admits(&self, event: &CanonicalEvent, source: Option<&EventSource>) -> bool {
        if event.status != PublicationStatus::Published {
            return false;
        }
        if let Some(bound) = self.starts_on_or_after {
            if event.start_date < bound {
                return false;
            }
        }
        match event.source_id {
            None => self.include_internal,
            Some(source_id) => match &self.scope {
                SourceScope::AllActive => source.map(|s| s.active).unwrap_or(false),
                SourceScope::Only(ids) => ids.contains(&source_id),
            },
        }
    }
}

/// Canonical event store. The CRUD layer owns most of it; the sync pipeline
/// writes imported rows and source counters, the feed composer only reads.
///
/// `(source_id, external_id)` uniqueness is enforced here and nowhere else.
#[async_trait]
pub trait EventStore: Send + Sync {
    async fn insert_source(&self, source: NewEventSource) -> Result<EventSource, StoreError>;

    async fn get_source(&self, id: Uuid) -> Result<Option<EventSource>, StoreError>;

    async fn find_source(&self, kind: SourceKind, url: &str) -> Result<Option<EventSource>, StoreError>;

    async fn list_sources(&self) -> Result<Vec<EventSource>, StoreError>;

    async fn list_active_sources(&self) -> Result<Vec<EventSource>, StoreError> {
        Ok(self
            .list_sources()
            .await?
            .into_iter()
            .filter(|s| s.active)
            .collect())
    }

    async fn set_source_active(&self, id: Uuid, active: bool) -> Result<(), StoreError>;

    /// Stamps the run on the source. `imported_count` only ever grows.
    async fn record_sync_outcome(&self, id: Uuid, outcome: &SyncOutcome) -> Result<(), StoreError>;

    async fn find_imported(
        &self,
        source_id: Uuid,
        external_id: &str,
    ) -> Result<Option<CanonicalEvent>, StoreError>;

    /// Fails with [`StoreError::Conflict`] when the identity is already taken.
    async fn insert_imported(
        &self,
        source_id: Uuid,
        external_id: &str,
        fields: &EventFields,
        status: PublicationStatus,
    ) -> Result<Uuid, StoreError>;

    async fn update_imported(&self, id: Uuid, fields: &EventFields) -> Result<(), StoreError>;

    async fn insert_internal(
        &self,
        fields: &EventFields,
        status: PublicationStatus,
    ) -> Result<Uuid, StoreError>;

    async fn get_event(&self, id: Uuid) -> Result<Option<CanonicalEvent>, StoreError>;

    /// Eligible events ordered by start.
    async fn feed_events(&self, filter: &FeedFilter) -> Result<Vec<CanonicalEvent>, StoreError>;

    async fn get_preference(&self, user_id: &str) -> Result<Option<FeedPreference>, StoreError>;

    async fn upsert_preference(&self, preference: &FeedPreference) -> Result<FeedPreference, StoreError>;
}
