use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use chrono::Utc;
use hubcal_core::{
    CanonicalEvent, EventFields, EventOrigin, EventSource, FeedPreference, NewEventSource,
    PublicationStatus, SourceKind, SyncOutcome,
};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::store::{EventStore, FeedFilter, StoreError};

#[derive(Debug, Default)]
struct MemoryState {
    sources: Vec<EventSource>,
    events: HashMap<Uuid, CanonicalEvent>,
    external_index: HashMap<(Uuid, String), Uuid>,
    preferences: HashMap<String, FeedPreference>,
}

/// In-process store used when no database is configured, and by tests.
#[derive(Debug, Default)]
pub struct MemoryEventStore {
    state: RwLock<MemoryState>,
    unavailable: AtomicBool,
}

impl MemoryEventStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every call fail with [`StoreError::Unavailable`] until reset.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    fn check_available(&self) -> Result<(), StoreError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("memory store switched off".into()));
        }
        Ok(())
    }
}

fn new_event(fields: &EventFields, status: PublicationStatus, origin: EventOrigin) -> CanonicalEvent {
    let now = Utc::now();
    CanonicalEvent {
        id: Uuid::new_v4(),
        title: fields.title.clone(),
        description: fields.description.clone(),
        start_date: fields.start_date,
        start_time: fields.start_time,
        location: fields.location.clone(),
        event_kind: fields.event_kind,
        capacity: fields.capacity,
        attendee_count: 0,
        registration_url: fields.registration_url.clone(),
        origin,
        status,
        source_id: None,
        external_id: None,
        created_at: now,
        updated_at: now,
    }
}

#[async_trait]
impl EventStore for MemoryEventStore {
    async fn insert_source(&self, source: NewEventSource) -> Result<EventSource, StoreError> {
        self.check_available()?;
        let mut state = self.state.write().await;
        let row = EventSource {
            id: Uuid::new_v4(),
            display_name: source.display_name,
            kind: source.kind,
            url: source.url,
            active: source.active,
            last_synced_at: None,
            last_sync_error: None,
            imported_count: 0,
            owner_id: source.owner_id,
            created_at: Utc::now(),
        };
        state.sources.push(row.clone());
        Ok(row)
    }

    async fn get_source(&self, id: Uuid) -> Result<Option<EventSource>, StoreError> {
        self.check_available()?;
        let state = self.state.read().await;
        Ok(state.sources.iter().find(|s| s.id == id).cloned())
    }

    async fn find_source(&self, kind: SourceKind, url: &str) -> Result<Option<EventSource>, StoreError> {
        self.check_available()?;
        let state = self.state.read().await;
        Ok(state
            .sources
            .iter()
            .find(|s| s.kind == kind && s.url == url)
            .cloned())
    }

    async fn list_sources(&self) -> Result<Vec<EventSource>, StoreError> {
        self.check_available()?;
        Ok(self.state.read().await.sources.clone())
    }

    async fn set_source_active(&self, id: Uuid, active: bool) -> Result<(), StoreError> {
        self.check_available()?;
        let mut state = self.state.write().await;
        let source = state
            .sources
            .iter_mut()
            .find(|s| s.id == id)
            .ok_or_else(|| StoreError::NotFound {
                what: "source",
                id: id.to_string(),
            })?;
        source.active = active;
        Ok(())
    }

    async fn record_sync_outcome(&self, id: Uuid, outcome: &SyncOutcome) -> Result<(), StoreError> {
        self.check_available()?;
        let mut state = self.state.write().await;
        let source = state
            .sources
            .iter_mut()
            .find(|s| s.id == id)
            .ok_or_else(|| StoreError::NotFound {
                what: "source",
                id: id.to_string(),
            })?;
        source.last_synced_at = Some(outcome.finished_at);
        source.last_sync_error = outcome.error.clone();
        source.imported_count += outcome.inserted as i64;
        Ok(())
    }

    async fn find_imported(
        &self,
        source_id: Uuid,
        external_id: &str,
    ) -> Result<Option<CanonicalEvent>, StoreError> {
        self.check_available()?;
        let state = self.state.read().await;
        Ok(state
            .external_index
            .get(&(source_id, external_id.to_string()))
            .and_then(|id| state.events.get(id))
            .cloned())
    }

    async fn insert_imported(
        &self,
        source_id: Uuid,
        external_id: &str,
        fields: &EventFields,
        status: PublicationStatus,
    ) -> Result<Uuid, StoreError> {
        self.check_available()?;
        let mut state = self.state.write().await;
        let key = (source_id, external_id.to_string());
        if state.external_index.contains_key(&key) {
            return Err(StoreError::Conflict {
                source_id,
                external_id: external_id.to_string(),
            });
        }

        let mut event = new_event(fields, status, EventOrigin::Imported);
        event.source_id = Some(source_id);
        event.external_id = Some(external_id.to_string());
        let id = event.id;
        state.external_index.insert(key, id);
        state.events.insert(id, event);
        Ok(id)
    }

    async fn update_imported(&self, id: Uuid, fields: &EventFields) -> Result<(), StoreError> {
        self.check_available()?;
        let mut state = self.state.write().await;
        let event = state.events.get_mut(&id).ok_or_else(|| StoreError::NotFound {
            what: "event",
            id: id.to_string(),
        })?;
        event.apply_fields(fields);
        event.updated_at = Utc::now();
        Ok(())
    }

    async fn insert_internal(
        &self,
        fields: &EventFields,
        status: PublicationStatus,
    ) -> Result<Uuid, StoreError> {
        self.check_available()?;
        let mut state = self.state.write().await;
        let event = new_event(fields, status, EventOrigin::Internal);
        let id = event.id;
        state.events.insert(id, event);
        Ok(id)
    }

    async fn get_event(&self, id: Uuid) -> Result<Option<CanonicalEvent>, StoreError> {
        self.check_available()?;
        Ok(self.state.read().await.events.get(&id).cloned())
    }

    async fn feed_events(&self, filter: &FeedFilter) -> Result<Vec<CanonicalEvent>, StoreError> {
        self.check_available()?;
        let state = self.state.read().await;
        let mut events: Vec<CanonicalEvent> = state
            .events
            .values()
            .filter(|event| {
                let source = event
                    .source_id
                    .and_then(|id| state.sources.iter().find(|s| s.id == id));
                filter.admits(event, source)
            })
            .cloned()
            .collect();
        events.sort_by(|a, b| {
            (a.start_date, a.start_time, a.id).cmp(&(b.start_date, b.start_time, b.id))
        });
        Ok(events)
    }

    async fn get_preference(&self, user_id: &str) -> Result<Option<FeedPreference>, StoreError> {
        self.check_available()?;
        Ok(self.state.read().await.preferences.get(user_id).cloned())
    }

    async fn upsert_preference(&self, preference: &FeedPreference) -> Result<FeedPreference, StoreError> {
        self.check_available()?;
        let mut state = self.state.write().await;
        let mut stored = preference.clone();
        stored.updated_at = Utc::now();
        state
            .preferences
            .insert(stored.user_id.clone(), stored.clone());
        Ok(stored)
    }
}
