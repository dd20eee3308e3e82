use std::str::FromStr;

use async_trait::async_trait;
use chrono::Utc;
use hubcal_core::{
    CanonicalEvent, EventFields, EventOrigin, EventSource, FeedPreference, NewEventSource,
    PublicationStatus, SourceKind, SyncOutcome,
};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::Row;
use tracing::info;
use uuid::Uuid;

use crate::store::{EventStore, FeedFilter, SourceScope, StoreError};

const SOURCE_COLUMNS: &str = "id, display_name, kind, url, active, last_synced_at, \
     last_sync_error, imported_count, owner_id, created_at";

const EVENT_COLUMNS: &str = "e.id, e.title, e.description, e.start_date, e.start_time, \
     e.location, e.event_kind, e.capacity, e.attendee_count, e.registration_url, e.origin, \
     e.status, e.source_id, e.external_id, e.created_at, e.updated_at";

/// Postgres-backed event store.
#[derive(Debug, Clone)]
pub struct PgEventStore {
    pool: PgPool,
}

impl PgEventStore {
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("../../migrations").run(&self.pool).await?;
        info!("database migrations applied");
        Ok(())
    }
}

fn parse_column<T>(row: &PgRow, column: &str) -> Result<T, StoreError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    let raw: String = row.try_get(column)?;
    raw.parse::<T>()
        .map_err(|err| StoreError::InvalidRow(format!("{column}: {err}")))
}

fn source_from_row(row: &PgRow) -> Result<EventSource, StoreError> {
    Ok(EventSource {
        id: row.try_get("id")?,
        display_name: row.try_get("display_name")?,
        kind: parse_column(row, "kind")?,
        url: row.try_get("url")?,
        active: row.try_get("active")?,
        last_synced_at: row.try_get("last_synced_at")?,
        last_sync_error: row.try_get("last_sync_error")?,
        imported_count: row.try_get("imported_count")?,
        owner_id: row.try_get("owner_id")?,
        created_at: row.try_get("created_at")?,
    })
}

fn event_from_row(row: &PgRow) -> Result<CanonicalEvent, StoreError> {
    Ok(CanonicalEvent {
        id: row.try_get("id")?,
        title: row.try_get("title")?,
        description: row.try_get("description")?,
        start_date: row.try_get("start_date")?,
        start_time: row.try_get("start_time")?,
        location: row.try_get("location")?,
        event_kind: parse_column(row, "event_kind")?,
        capacity: row.try_get("capacity")?,
        attendee_count: row.try_get("attendee_count")?,
        registration_url: row.try_get("registration_url")?,
        origin: parse_column(row, "origin")?,
        status: parse_column(row, "status")?,
        source_id: row.try_get("source_id")?,
        external_id: row.try_get("external_id")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn preference_from_row(row: &PgRow) -> Result<FeedPreference, StoreError> {
    Ok(FeedPreference {
        user_id: row.try_get("user_id")?,
        include_all_sources: row.try_get("include_all_sources")?,
        selected_sources: row.try_get("selected_sources")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Database(db) if db.is_unique_violation())
}

#[async_trait]
impl EventStore for PgEventStore {
    async fn insert_source(&self, source: NewEventSource) -> Result<EventSource, StoreError> {
        let row = sqlx::query(&format!(
            r#"
            INSERT INTO event_sources (id, display_name, kind, url, active, owner_id, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            RETURNING {SOURCE_COLUMNS}
            "#
        ))
        .bind(Uuid::new_v4())
        .bind(&source.display_name)
        .bind(source.kind.as_str())
        .bind(&source.url)
        .bind(source.active)
        .bind(&source.owner_id)
        .bind(Utc::now())
        .fetch_one(&self.pool)
        .await?;
        source_from_row(&row)
    }

    async fn get_source(&self, id: Uuid) -> Result<Option<EventSource>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {SOURCE_COLUMNS} FROM event_sources WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(source_from_row).transpose()
    }

    async fn find_source(&self, kind: SourceKind, url: &str) -> Result<Option<EventSource>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {SOURCE_COLUMNS} FROM event_sources WHERE kind = $1 AND url = $2"
        ))
        .bind(kind.as_str())
        .bind(url)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(source_from_row).transpose()
    }

    async fn list_sources(&self) -> Result<Vec<EventSource>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {SOURCE_COLUMNS} FROM event_sources ORDER BY created_at, display_name"
        ))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(source_from_row).collect()
    }

    async fn set_source_active(&self, id: Uuid, active: bool) -> Result<(), StoreError> {
        let done = sqlx::query("UPDATE event_sources SET active = $2 WHERE id = $1")
            .bind(id)
            .bind(active)
            .execute(&self.pool)
            .await?;
        if done.rows_affected() == 0 {
            return Err(StoreError::NotFound {
                what: "source",
                id: id.to_string(),
            });
        }
        Ok(())
    }

    async fn record_sync_outcome(&self, id: Uuid, outcome: &SyncOutcome) -> Result<(), StoreError> {
        let done = sqlx::query(
            r#"
            UPDATE event_sources
               SET last_synced_at = $2,
                   last_sync_error = $3,
                   imported_count = imported_count + $4
             WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(outcome.finished_at)
        .bind(&outcome.error)
        .bind(outcome.inserted as i64)
        .execute(&self.pool)
        .await?;
        if done.rows_affected() == 0 {
            return Err(StoreError::NotFound {
                what: "source",
                id: id.to_string(),
            });
        }
        Ok(())
    }

    async fn find_imported(
        &self,
        source_id: Uuid,
        external_id: &str,
    ) -> Result<Option<CanonicalEvent>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {EVENT_COLUMNS} FROM events e WHERE e.source_id = $1 AND e.external_id = $2"
        ))
        .bind(source_id)
        .bind(external_id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(event_from_row).transpose()
    }

    async fn insert_imported(
        &self,
        source_id: Uuid,
        external_id: &str,
        fields: &EventFields,
        status: PublicationStatus,
    ) -> Result<Uuid, StoreError> {
        let id = Uuid::new_v4();
        let now = Utc::now();
        let result = sqlx::query(
            r#"
            INSERT INTO events (
                id, title, description, start_date, start_time, location, event_kind,
                capacity, registration_url, origin, status, source_id, external_id,
                created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $14)
            "#,
        )
        .bind(id)
        .bind(&fields.title)
        .bind(&fields.description)
        .bind(fields.start_date)
        .bind(fields.start_time)
        .bind(&fields.location)
        .bind(fields.event_kind.as_str())
        .bind(fields.capacity)
        .bind(&fields.registration_url)
        .bind(EventOrigin::Imported.as_str())
        .bind(status.as_str())
        .bind(source_id)
        .bind(external_id)
        .bind(now)
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(id),
            Err(err) if is_unique_violation(&err) => Err(StoreError::Conflict {
                source_id,
                external_id: external_id.to_string(),
            }),
            Err(err) => Err(err.into()),
        }
    }

    async fn update_imported(&self, id: Uuid, fields: &EventFields) -> Result<(), StoreError> {
        let done = sqlx::query(
            r#"
            UPDATE events
               SET title = $2,
                   description = $3,
                   start_date = $4,
                   start_time = $5,
                   location = $6,
                   event_kind = $7,
                   capacity = $8,
                   registration_url = $9,
                   updated_at = NOW()
             WHERE id = $1
               AND origin = 'imported'
            "#,
        )
        .bind(id)
        .bind(&fields.title)
        .bind(&fields.description)
        .bind(fields.start_date)
        .bind(fields.start_time)
        .bind(&fields.location)
        .bind(fields.event_kind.as_str())
        .bind(fields.capacity)
        .bind(&fields.registration_url)
        .execute(&self.pool)
        .await?;
        if done.rows_affected() == 0 {
            return Err(StoreError::NotFound {
                what: "imported event",
                id: id.to_string(),
            });
        }
        Ok(())
    }

    async fn insert_internal(
        &self,
        fields: &EventFields,
        status: PublicationStatus,
    ) -> Result<Uuid, StoreError> {
        let id = Uuid::new_v4();
        sqlx::query(
            r#"
            INSERT INTO events (
                id, title, description, start_date, start_time, location, event_kind,
                capacity, registration_url, origin, status
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, 'internal', $10)
            "#,
        )
        .bind(id)
        .bind(&fields.title)
        .bind(&fields.description)
        .bind(fields.start_date)
        .bind(fields.start_time)
        .bind(&fields.location)
        .bind(fields.event_kind.as_str())
        .bind(fields.capacity)
        .bind(&fields.registration_url)
        .bind(status.as_str())
        .execute(&self.pool)
        .await?;
        Ok(id)
    }

    async fn get_event(&self, id: Uuid) -> Result<Option<CanonicalEvent>, StoreError> {
        let row = sqlx::query(&format!("SELECT {EVENT_COLUMNS} FROM events e WHERE e.id = $1"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(event_from_row).transpose()
    }

    async fn feed_events(&self, filter: &FeedFilter) -> Result<Vec<CanonicalEvent>, StoreError> {
        let (all_active, only): (bool, Vec<Uuid>) = match &filter.scope {
            SourceScope::AllActive => (true, Vec::new()),
            SourceScope::Only(ids) => (false, ids.iter().copied().collect()),
        };

        let rows = sqlx::query(&format!(
            r#"
            SELECT {EVENT_COLUMNS}
              FROM events e
              LEFT JOIN event_sources s ON s.id = e.source_id
             WHERE e.status = 'published'
               AND ($1::date IS NULL OR e.start_date >= $1::date)
               AND (
                    (e.source_id IS NULL AND $2)
                 OR (e.source_id IS NOT NULL AND $3 AND s.active)
                 OR (e.source_id IS NOT NULL AND NOT $3 AND e.source_id = ANY($4))
               )
             ORDER BY e.start_date, e.start_time NULLS FIRST, e.id
            "#
        ))
        .bind(filter.starts_on_or_after)
        .bind(filter.include_internal)
        .bind(all_active)
        .bind(only)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(event_from_row).collect()
    }

    async fn get_preference(&self, user_id: &str) -> Result<Option<FeedPreference>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT user_id, include_all_sources, selected_sources, updated_at
              FROM feed_preferences
             WHERE user_id = $1
            "#,
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(preference_from_row).transpose()
    }

    async fn upsert_preference(&self, preference: &FeedPreference) -> Result<FeedPreference, StoreError> {
        let row = sqlx::query(
            r#"
            INSERT INTO feed_preferences (user_id, include_all_sources, selected_sources, updated_at)
            VALUES ($1, $2, $3, NOW())
            ON CONFLICT (user_id) DO UPDATE
               SET include_all_sources = EXCLUDED.include_all_sources,
                   selected_sources = EXCLUDED.selected_sources,
                   updated_at = NOW()
            RETURNING user_id, include_all_sources, selected_sources, updated_at
            "#,
        )
        .bind(&preference.user_id)
        .bind(preference.include_all_sources)
        .bind(&preference.selected_sources)
        .fetch_one(&self.pool)
        .await?;
        preference_from_row(&row)
    }
}
