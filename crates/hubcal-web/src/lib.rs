//! HTTP surface: calendar feed, sync triggers, source health, preferences.

use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use hubcal_core::{EventSource, FeedPreference, SourceHealth};
use hubcal_storage::{EventStore, HttpFetcher};
use hubcal_sync::{feed, FeedComposer, FeedRequest, HubConfig, SyncError, SyncOrchestrator};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tracing::{info, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "hubcal-web";

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn EventStore>,
    pub orchestrator: Arc<SyncOrchestrator>,
    pub composer: Arc<FeedComposer>,
    pub public_base_url: String,
}

impl AppState {
    pub fn new(
        store: Arc<dyn EventStore>,
        orchestrator: Arc<SyncOrchestrator>,
        composer: Arc<FeedComposer>,
        public_base_url: impl Into<String>,
    ) -> Self {
        Self {
            store,
            orchestrator,
            composer,
            public_base_url: public_base_url.into(),
        }
    }

    /// Wires the orchestrator and composer over one shared store.
    pub fn from_config(config: &HubConfig, store: Arc<dyn EventStore>) -> anyhow::Result<Self> {
        let http = Arc::new(HttpFetcher::new(config.http_client_config())?);
        let orchestrator = Arc::new(SyncOrchestrator::new(Arc::clone(&store), http, config));
        let composer = Arc::new(FeedComposer::new(Arc::clone(&store), config));
        Ok(Self::new(store, orchestrator, composer, config.public_base_url.clone()))
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SourceView {
    #[serde(flatten)]
    pub source: EventSource,
    pub health: SourceHealth,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PreferenceBody {
    #[serde(default)]
    pub include_all_sources: bool,
    #[serde(default)]
    pub selected_sources: Vec<Uuid>,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/calendar.ics", get(calendar_handler))
        .route("/feed/links", get(feed_links_handler))
        .route("/sources", get(sources_handler))
        .route("/sources/sync", post(sync_all_handler))
        .route("/sources/{id}/sync", post(sync_source_handler))
        .route(
            "/preferences/{user}",
            get(get_preference_handler).put(put_preference_handler),
        )
        .with_state(Arc::new(state))
}

pub async fn serve(state: AppState, port: u16) -> anyhow::Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "hubcal web listening");
    axum::serve(listener, app(state)).await?;
    Ok(())
}

/// Serves `https://` and `webcal://` subscribers alike.
async fn calendar_handler(
    State(state): State<Arc<AppState>>,
    Query(request): Query<FeedRequest>,
) -> Response {
    match state.composer.compose_request(&request).await {
        Ok(doc) => (
            [
                (header::CONTENT_TYPE, feed::CONTENT_TYPE),
                (header::CONTENT_DISPOSITION, "inline; filename=\"calendar.ics\""),
            ],
            doc.body,
        )
            .into_response(),
        Err(err) => {
            warn!(error = %err, "calendar feed unavailable");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
                "calendar feed temporarily unavailable",
            )
                .into_response()
        }
    }
}

async fn feed_links_handler(
    State(state): State<Arc<AppState>>,
    Query(request): Query<FeedRequest>,
) -> Response {
    match hubcal_sync::feed_links(&state.public_base_url, &request) {
        Ok(links) => Json(links).into_response(),
        Err(err) => server_error(format!("bad public base url: {err}")),
    }
}

async fn sources_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.store.list_sources().await {
        Ok(sources) => {
            let views: Vec<SourceView> = sources
                .into_iter()
                .map(|source| SourceView {
                    health: source.health(),
                    source,
                })
                .collect();
            Json(views).into_response()
        }
        Err(err) => server_error(err),
    }
}

async fn sync_all_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.orchestrator.sync_all().await {
        Ok(reports) => Json(reports).into_response(),
        Err(err) => sync_error(err),
    }
}

async fn sync_source_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Response {
    match state.orchestrator.sync_source(id).await {
        Ok(result) if result.error.is_some() => (StatusCode::BAD_GATEWAY, Json(result)).into_response(),
        Ok(result) => Json(result).into_response(),
        Err(err) => sync_error(err),
    }
}

async fn get_preference_handler(
    State(state): State<Arc<AppState>>,
    Path(user): Path<String>,
) -> Response {
    match state.store.get_preference(&user).await {
        Ok(Some(pref)) => Json(pref).into_response(),
        Ok(None) => error_json(StatusCode::NOT_FOUND, format!("no saved preference for {user}")),
        Err(err) => server_error(err),
    }
}

async fn put_preference_handler(
    State(state): State<Arc<AppState>>,
    Path(user): Path<String>,
    Json(body): Json<PreferenceBody>,
) -> Response {
    let preference = FeedPreference {
        user_id: user,
        include_all_sources: body.include_all_sources,
        selected_sources: body.selected_sources,
        updated_at: Utc::now(),
    };
    match state.store.upsert_preference(&preference).await {
        Ok(saved) => Json(saved).into_response(),
        Err(err) => server_error(err),
    }
}

fn sync_error(err: SyncError) -> Response {
    let status = match &err {
        SyncError::SourceNotFound(_) => StatusCode::NOT_FOUND,
        SyncError::AlreadyRunning(_) => StatusCode::CONFLICT,
        SyncError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };
    error_json(status, err.to_string())
}

fn error_json(status: StatusCode, message: String) -> Response {
    (status, Json(serde_json::json!({ "error": message }))).into_response()
}

fn server_error(err: impl std::fmt::Display) -> Response {
    warn!(error = %err, "request failed");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        format!("Server error: {err}"),
    )
        .into_response()
}
