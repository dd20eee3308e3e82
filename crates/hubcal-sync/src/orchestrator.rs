use std::collections::HashSet;
use std::sync::{Arc, Mutex, PoisonError};

use chrono::Utc;
use chrono_tz::Tz;
use futures::stream::{self, StreamExt};
use hubcal_adapters::{AdapterContext, AdapterRegistry};
use hubcal_core::{
    EventSource, ItemError, PublicationStatus, SourceKind, SyncOutcome, SyncPhase, SyncResult,
};
use hubcal_storage::{EventStore, HttpFetcher, StoreError};
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::config::HubConfig;
use crate::dedup::{DedupEngine, MergeEffect, Resolution};
use crate::normalize::Normalizer;

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("source {0} not found")]
    SourceNotFound(Uuid),
    #[error("a sync of source {0} is already running")]
    AlreadyRunning(Uuid),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// One entry of a "sync all" batch. `rejected` is set when the run never
/// started (overlap) or could not record its outcome.
#[derive(Debug, Clone, Serialize)]
pub struct SourceSyncReport {
    pub source_id: Uuid,
    pub display_name: String,
    pub kind: SourceKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<SyncResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rejected: Option<String>,
}

#[derive(Debug, Default)]
struct InFlight(Mutex<HashSet<Uuid>>);

/// Held for the duration of a run; releases the source on drop.
struct InFlightGuard {
    registry: Arc<InFlight>,
    source_id: Uuid,
}

impl InFlight {
    fn claim(self: &Arc<Self>, source_id: Uuid) -> Result<InFlightGuard, SyncError> {
        let mut running = self.0.lock().unwrap_or_else(PoisonError::into_inner);
        if !running.insert(source_id) {
            return Err(SyncError::AlreadyRunning(source_id));
        }
        Ok(InFlightGuard {
            registry: Arc::clone(self),
            source_id,
        })
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.registry
            .0
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.source_id);
    }
}

/// Drives adapter → normalizer → dedup for one source or a batch.
///
/// At most one run per source is in flight inside this process.
pub struct SyncOrchestrator {
    store: Arc<dyn EventStore>,
    http: Arc<HttpFetcher>,
    adapters: AdapterRegistry,
    normalizer: Normalizer,
    timezone: Tz,
    concurrency: usize,
    imported_status: PublicationStatus,
    in_flight: Arc<InFlight>,
}

impl SyncOrchestrator {
    pub fn new(store: Arc<dyn EventStore>, http: Arc<HttpFetcher>, config: &HubConfig) -> Self {
        Self {
            store,
            http,
            adapters: AdapterRegistry::standard(),
            normalizer: Normalizer,
            timezone: config.timezone,
            concurrency: config.sync_concurrency.max(1),
            imported_status: config.imported_status,
            in_flight: Arc::new(InFlight::default()),
        }
    }

    pub fn with_adapters(mut self, adapters: AdapterRegistry) -> Self {
        self.adapters = adapters;
        self
    }

    /// "Sync now" for one source, active or not.
    pub async fn sync_source(&self, source_id: Uuid) -> Result<SyncResult, SyncError> {
        let source = self
            .store
            .get_source(source_id)
            .await?
            .ok_or(SyncError::SourceNotFound(source_id))?;
        let _guard = self.in_flight.claim(source.id)?;
        Ok(self.run(&source).await?)
    }

    /// Syncs every active source, up to the configured number in parallel.
    /// Reports come back in source listing order.
    pub async fn sync_all(&self) -> Result<Vec<SourceSyncReport>, SyncError> {
        let sources = self.store.list_active_sources().await?;
        info!(sources = sources.len(), "sync all started");

        let mut reports: Vec<(usize, SourceSyncReport)> = stream::iter(sources.into_iter().enumerate())
            .map(|(index, source)| async move {
                let mut report = SourceSyncReport {
                    source_id: source.id,
                    display_name: source.display_name.clone(),
                    kind: source.kind,
                    result: None,
                    rejected: None,
                };
                match self.in_flight.claim(source.id) {
                    Err(err) => report.rejected = Some(err.to_string()),
                    Ok(_guard) => match self.run(&source).await {
                        Ok(result) => report.result = Some(result),
                        Err(err) => {
                            warn!(source_id = %source.id, error = %err, "could not record sync outcome");
                            report.rejected = Some(err.to_string());
                        }
                    },
                }
                (index, report)
            })
            .buffer_unordered(self.concurrency)
            .collect()
            .await;

        reports.sort_by_key(|(index, _)| *index);
        Ok(reports.into_iter().map(|(_, report)| report).collect())
    }

    async fn run(&self, source: &EventSource) -> Result<SyncResult, StoreError> {
        let span = info_span!("source_sync", source_id = %source.id, kind = %source.kind);
        self.run_phases(source).instrument(span).await
    }

    async fn run_phases(&self, source: &EventSource) -> Result<SyncResult, StoreError> {
        let started_at = Utc::now();
        let mut result = SyncResult {
            source_id: source.id,
            inserted: 0,
            updated: 0,
            unchanged: 0,
            skipped: 0,
            item_errors: Vec::new(),
            error: None,
            phase: SyncPhase::Idle,
            started_at,
            finished_at: started_at,
        };

        enter(&mut result, SyncPhase::Fetching);
        let fetched = match self.adapters.get(source.kind) {
            Some(adapter) => {
                let ctx = AdapterContext::new(source.id, self.timezone);
                adapter
                    .fetch(&self.http, &ctx, &source.url)
                    .await
                    .map_err(|err| err.to_string())
            }
            None => Err(format!("no adapter registered for {}", source.kind)),
        };
        let outcome = match fetched {
            Ok(outcome) => outcome,
            Err(message) => {
                result.error = Some(message);
                return self.finish(source, result, SyncPhase::Failed).await;
            }
        };

        enter(&mut result, SyncPhase::Parsing);
        for rejected in outcome.rejected {
            skip(&mut result, rejected);
        }
        let drafts: Vec<_> = outcome
            .items
            .into_iter()
            .map(|item| self.normalizer.normalize(item, source.kind))
            .collect();

        enter(&mut result, SyncPhase::Merging);
        let mut dedup = DedupEngine::new(Arc::clone(&self.store), source.id, source.kind);
        for draft in &drafts {
            let merged = match dedup.resolve(draft).await {
                Ok(Resolution::Skip { reason }) => {
                    skip(&mut result, ItemError::new(draft.label(), reason));
                    continue;
                }
                Ok(resolution) => dedup.apply(resolution, self.imported_status).await,
                Err(err) => Err(err),
            };
            match merged {
                Ok(MergeEffect::Inserted(_)) => result.inserted += 1,
                Ok(MergeEffect::Updated(_)) => result.updated += 1,
                Ok(MergeEffect::Unchanged(_)) => result.unchanged += 1,
                Ok(MergeEffect::Skipped) => result.skipped += 1,
                Err(err) => skip(&mut result, ItemError::new(draft.label(), err.to_string())),
            }
        }

        self.finish(source, result, SyncPhase::Succeeded).await
    }

    async fn finish(
        &self,
        source: &EventSource,
        mut result: SyncResult,
        phase: SyncPhase,
    ) -> Result<SyncResult, StoreError> {
        enter(&mut result, phase);
        result.finished_at = Utc::now();
        self.store
            .record_sync_outcome(
                source.id,
                &SyncOutcome {
                    finished_at: result.finished_at,
                    error: result.error.clone(),
                    inserted: result.inserted,
                },
            )
            .await?;

        match &result.error {
            None => info!(
                inserted = result.inserted,
                updated = result.updated,
                unchanged = result.unchanged,
                skipped = result.skipped,
                "source sync succeeded"
            ),
            Some(error) => warn!(%error, "source sync failed"),
        }
        Ok(result)
    }
}

fn enter(result: &mut SyncResult, phase: SyncPhase) {
    debug!(from = ?result.phase, to = ?phase, "sync phase");
    result.phase = phase;
}

fn skip(result: &mut SyncResult, error: ItemError) {
    warn!(item = %error.item, reason = %error.reason, "item skipped");
    result.skipped += 1;
    result.item_errors.push(error);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{fixture, serve, ServedPage};
    use async_trait::async_trait;
    use hubcal_adapters::{FetchOutcome, SourceAdapter};
    use hubcal_core::{NewEventSource, SourceHealth};
    use hubcal_storage::{FetchError, HttpClientConfig, MemoryEventStore};
    use std::time::Duration;
    use tokio::sync::Notify;

    fn orchestrator(store: Arc<dyn EventStore>, timeout: Duration) -> SyncOrchestrator {
        let http = HttpFetcher::new(HttpClientConfig {
            timeout,
            ..HttpClientConfig::default()
        })
        .unwrap();
        SyncOrchestrator::new(store, Arc::new(http), &HubConfig::default())
    }

    async fn add_source(
        store: &Arc<dyn EventStore>,
        name: &str,
        kind: SourceKind,
        url: String,
    ) -> EventSource {
        store
            .insert_source(NewEventSource {
                display_name: name.into(),
                kind,
                url,
                active: true,
                owner_id: Some("owner-1".into()),
            })
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn five_good_one_malformed_feed() {
        let server = serve(vec![ServedPage::new(
            "/guild.ics",
            fixture("generic-feed/makers-guild.ics"),
        )])
        .await;
        let store: Arc<dyn EventStore> = Arc::new(MemoryEventStore::new());
        let source = add_source(&store, "Makers Guild", SourceKind::GenericFeed, server.url("/guild.ics")).await;

        let result = orchestrator(store.clone(), Duration::from_secs(5))
            .sync_source(source.id)
            .await
            .unwrap();
        assert_eq!(result.inserted, 5);
        assert_eq!(result.skipped, 1);
        assert!(result.error.is_none());
        assert!(result.succeeded());

        let stored = store.get_source(source.id).await.unwrap().unwrap();
        assert_eq!(stored.imported_count, 5);
        assert_eq!(stored.health(), SourceHealth::Healthy);
    }

    #[tokio::test]
    async fn second_sync_is_idempotent_and_keeps_ids() {
        let server = serve(vec![ServedPage::new(
            "/meetup",
            fixture("group-platform/rust-meetup.html"),
        )])
        .await;
        let store: Arc<dyn EventStore> = Arc::new(MemoryEventStore::new());
        let source = add_source(&store, "Rust Meetup", SourceKind::GroupPlatform, server.url("/meetup")).await;
        let orch = orchestrator(store.clone(), Duration::from_secs(5));

        let first = orch.sync_source(source.id).await.unwrap();
        assert_eq!(first.inserted, 3);
        let before = store
            .find_imported(source.id, &format!("{}:301000001", source.id))
            .await
            .unwrap()
            .unwrap();

        let second = orch.sync_source(source.id).await.unwrap();
        assert_eq!(second.inserted, 0);
        assert_eq!(second.updated, 0);
        assert_eq!(second.unchanged, 3);

        let after = store
            .find_imported(source.id, &format!("{}:301000001", source.id))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(before.id, after.id);
        assert_eq!(store.get_source(source.id).await.unwrap().unwrap().imported_count, 3);
    }

    #[tokio::test]
    async fn upstream_title_change_is_exactly_one_update() {
        let original = fixture("generic-feed/makers-guild.ics");
        let renamed = original.replace("SUMMARY:CAD Clinic", "SUMMARY:CAD Clinic (moved online)");
        let server = serve(vec![
            ServedPage::new("/v1.ics", original),
            ServedPage::new("/v2.ics", renamed),
        ])
        .await;
        let store: Arc<dyn EventStore> = Arc::new(MemoryEventStore::new());
        let source = add_source(&store, "Makers Guild", SourceKind::GenericFeed, server.url("/v1.ics")).await;
        let orch = orchestrator(store.clone(), Duration::from_secs(5));
        orch.sync_source(source.id).await.unwrap();

        // Owner repoints the source; identities are per source, not per URL.
        let mut repointed = store.get_source(source.id).await.unwrap().unwrap();
        repointed.url = server.url("/v2.ics");
        let result = orch.run(&repointed).await.unwrap();

        assert_eq!(result.updated, 1);
        assert_eq!(result.inserted, 0);
        let event = store
            .find_imported(
                source.id,
                &format!("{}:guild-2026-04-cad-clinic@makers.example.org", source.id),
            )
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event.title, "CAD Clinic (moved online)");
    }

    #[tokio::test]
    async fn timeout_marks_source_failed_without_counts() {
        let server = serve(vec![ServedPage::new("/slow.ics", String::new()).delayed(Duration::from_secs(5))]).await;
        let store: Arc<dyn EventStore> = Arc::new(MemoryEventStore::new());
        let source = add_source(&store, "Slow", SourceKind::GenericFeed, server.url("/slow.ics")).await;

        let result = orchestrator(store.clone(), Duration::from_millis(300))
            .sync_source(source.id)
            .await
            .unwrap();
        assert!(result.error.is_some());
        assert_eq!(result.phase, SyncPhase::Failed);
        assert_eq!(result.inserted, 0);
        assert_eq!(result.skipped, 0);

        let stored = store.get_source(source.id).await.unwrap().unwrap();
        assert!(stored.last_sync_error.is_some());
        assert!(stored.last_synced_at.is_some());
        assert_eq!(stored.health(), SourceHealth::Failing);
    }

    #[tokio::test]
    async fn one_failing_source_does_not_block_another() {
        let server = serve(vec![ServedPage::new(
            "/guild.ics",
            fixture("generic-feed/makers-guild.ics"),
        )])
        .await;
        let store: Arc<dyn EventStore> = Arc::new(MemoryEventStore::new());
        let broken = add_source(&store, "Broken", SourceKind::GenericFeed, server.url("/gone.ics")).await;
        let healthy = add_source(&store, "Healthy", SourceKind::GenericFeed, server.url("/guild.ics")).await;

        let reports = orchestrator(store.clone(), Duration::from_secs(5))
            .sync_all()
            .await
            .unwrap();
        assert_eq!(reports.len(), 2);
        assert_eq!(reports[0].source_id, broken.id);
        assert!(reports[0].result.as_ref().unwrap().error.is_some());
        assert_eq!(reports[1].result.as_ref().unwrap().inserted, 5);

        let broken = store.get_source(broken.id).await.unwrap().unwrap();
        let healthy = store.get_source(healthy.id).await.unwrap().unwrap();
        assert!(broken.last_sync_error.as_deref().unwrap().contains("404"));
        assert_eq!(broken.imported_count, 0);
        assert!(healthy.last_sync_error.is_none());
        assert_eq!(healthy.imported_count, 5);
    }

    #[tokio::test]
    async fn inactive_sources_are_left_out_of_sync_all() {
        let store: Arc<dyn EventStore> = Arc::new(MemoryEventStore::new());
        let source = add_source(&store, "Paused", SourceKind::GenericFeed, "http://127.0.0.1:9/x.ics".into()).await;
        store.set_source_active(source.id, false).await.unwrap();
        let reports = orchestrator(store, Duration::from_secs(1)).sync_all().await.unwrap();
        assert!(reports.is_empty());
    }

    #[tokio::test]
    async fn unknown_source_is_not_found() {
        let store: Arc<dyn EventStore> = Arc::new(MemoryEventStore::new());
        let err = orchestrator(store, Duration::from_secs(1))
            .sync_source(Uuid::new_v4())
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::SourceNotFound(_)));
    }

    struct BlockingAdapter {
        started: Arc<Notify>,
        release: Arc<Notify>,
    }

    #[async_trait]
    impl SourceAdapter for BlockingAdapter {
        fn kind(&self) -> SourceKind {
            SourceKind::GenericFeed
        }

        async fn fetch(
            &self,
            _http: &HttpFetcher,
            _ctx: &AdapterContext,
            _url: &str,
        ) -> Result<FetchOutcome, FetchError> {
            self.started.notify_one();
            self.release.notified().await;
            Ok(FetchOutcome::default())
        }
    }

    #[tokio::test]
    async fn overlapping_run_on_the_same_source_is_rejected() {
        let store: Arc<dyn EventStore> = Arc::new(MemoryEventStore::new());
        let source = add_source(&store, "Held", SourceKind::GenericFeed, "http://held.invalid/x.ics".into()).await;
        let started = Arc::new(Notify::new());
        let release = Arc::new(Notify::new());
        let orch = Arc::new(
            orchestrator(store, Duration::from_secs(1)).with_adapters(
                AdapterRegistry::default().with_adapter(Arc::new(BlockingAdapter {
                    started: started.clone(),
                    release: release.clone(),
                })),
            ),
        );

        let first = tokio::spawn({
            let orch = orch.clone();
            async move { orch.sync_source(source.id).await }
        });
        started.notified().await;

        let err = orch.sync_source(source.id).await.unwrap_err();
        assert!(matches!(err, SyncError::AlreadyRunning(id) if id == source.id));

        release.notify_one();
        let result = first.await.unwrap().unwrap();
        assert!(result.succeeded());

        // Released: a fresh run is accepted again.
        release.notify_one();
        assert!(orch.sync_source(source.id).await.is_ok());
    }
}
