use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use chrono_tz::Tz;
use hubcal_core::PublicationStatus;
use hubcal_storage::{EventStore, HttpClientConfig, MemoryEventStore, PgEventStore};
use tracing::{info, warn};

/// Process-wide settings, read from the environment.
#[derive(Debug, Clone)]
pub struct HubConfig {
    /// `None` runs against the in-memory store.
    pub database_url: Option<String>,
    pub http_timeout_secs: u64,
    pub user_agent: String,
    pub timezone: Tz,
    pub sync_concurrency: usize,
    pub scheduler_enabled: bool,
    pub sync_cron: String,
    pub web_port: u16,
    pub public_base_url: String,
    pub feed_name: String,
    pub feed_past_days: Option<i64>,
    /// Initial publication status of newly imported events.
    pub imported_status: PublicationStatus,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            database_url: None,
            http_timeout_secs: 20,
            user_agent: "hubcal-bot/0.1".to_string(),
            timezone: Tz::UTC,
            sync_concurrency: 4,
            scheduler_enabled: false,
            sync_cron: "0 0 */6 * * *".to_string(),
            web_port: 8000,
            public_base_url: "http://localhost:8000".to_string(),
            feed_name: "Community Hub Events".to_string(),
            feed_past_days: Some(180),
            imported_status: PublicationStatus::Published,
        }
    }
}

fn flag(value: &str) -> bool {
    matches!(value.trim(), "1" | "true" | "TRUE" | "True" | "yes")
}

impl HubConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(get: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let defaults = Self::default();

        let timezone = match get("HUBCAL_TIMEZONE") {
            Some(name) => name
                .trim()
                .parse::<Tz>()
                .map_err(|err| anyhow::anyhow!("{err}"))
                .with_context(|| format!("HUBCAL_TIMEZONE={name} is not an IANA timezone"))?,
            None => defaults.timezone,
        };

        let imported_status = match get("HUBCAL_IMPORTED_STATUS") {
            Some(raw) => raw
                .parse::<PublicationStatus>()
                .context("parsing HUBCAL_IMPORTED_STATUS")?,
            None => defaults.imported_status,
        };

        let http_timeout_secs = get("HUBCAL_HTTP_TIMEOUT_SECS")
            .and_then(|v| v.trim().parse::<u64>().ok())
            .unwrap_or(defaults.http_timeout_secs);
        let clamped_timeout = http_timeout_secs.clamp(10, 30);
        if clamped_timeout != http_timeout_secs {
            warn!(
                requested = http_timeout_secs,
                used = clamped_timeout,
                "HUBCAL_HTTP_TIMEOUT_SECS outside 10..=30; clamped"
            );
        }

        let feed_past_days = match get("HUBCAL_FEED_PAST_DAYS") {
            Some(raw) => match raw.trim().parse::<i64>() {
                Ok(days) if days >= 0 => Some(days),
                Ok(_) => None,
                Err(_) => defaults.feed_past_days,
            },
            None => defaults.feed_past_days,
        };

        Ok(Self {
            database_url: get("DATABASE_URL").filter(|v| !v.trim().is_empty()),
            http_timeout_secs: clamped_timeout,
            user_agent: get("HUBCAL_USER_AGENT").unwrap_or(defaults.user_agent),
            timezone,
            sync_concurrency: get("HUBCAL_SYNC_CONCURRENCY")
                .and_then(|v| v.trim().parse::<usize>().ok())
                .unwrap_or(defaults.sync_concurrency)
                .max(1),
            scheduler_enabled: get("HUBCAL_SCHEDULER_ENABLED")
                .map(|v| flag(&v))
                .unwrap_or(defaults.scheduler_enabled),
            sync_cron: get("HUBCAL_SYNC_CRON").unwrap_or(defaults.sync_cron),
            web_port: get("HUBCAL_WEB_PORT")
                .and_then(|v| v.trim().parse().ok())
                .unwrap_or(defaults.web_port),
            public_base_url: get("HUBCAL_PUBLIC_BASE_URL").unwrap_or(defaults.public_base_url),
            feed_name: get("HUBCAL_FEED_NAME").unwrap_or(defaults.feed_name),
            feed_past_days,
            imported_status,
        })
    }

    pub fn http_client_config(&self) -> HttpClientConfig {
        HttpClientConfig {
            timeout: Duration::from_secs(self.http_timeout_secs),
            user_agent: Some(self.user_agent.clone()),
            ..Default::default()
        }
    }

    pub async fn open_store(&self) -> Result<Arc<dyn EventStore>> {
        match &self.database_url {
            Some(url) => {
                let store = PgEventStore::connect(url)
                    .await
                    .context("connecting to DATABASE_URL")?;
                Ok(Arc::new(store))
            }
            None => {
                info!("DATABASE_URL not set; using the in-memory event store");
                Ok(Arc::new(MemoryEventStore::new()))
            }
        }
    }

    /// Postgres only. One-shot commands would lose everything an in-memory
    /// store holds when the process exits.
    pub async fn open_durable_store(&self, command: &str) -> Result<Arc<dyn EventStore>> {
        if self.database_url.is_none() {
            bail!("DATABASE_URL must be set to run `{command}`");
        }
        self.open_store().await
    }
}
