//! Source adapter contracts + one adapter per source kind.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono_tz::Tz;
use hubcal_core::{ItemError, RawItem, SourceKind};
use hubcal_storage::{FetchError, HttpFetcher};
use uuid::Uuid;

mod generic_feed;
mod group_platform;
mod jsonld;
mod registration_platform;
mod time;

pub use generic_feed::{parse_feed, GenericFeedAdapter};
pub use group_platform::{parse_group_page, GroupPlatformAdapter};
pub use registration_platform::{parse_registration_page, RegistrationPage, RegistrationPlatformAdapter};
pub use time::{parse_datetime_text, resolve_local};

pub const CRATE_NAME: &str = "hubcal-adapters";

/// Per-run inputs every adapter receives alongside the source URL.
#[derive(Debug, Clone)]
pub struct AdapterContext {
    pub source_id: Uuid,
    /// Hub timezone; every start instant an adapter emits is expressed in it.
    pub timezone: Tz,
}

impl AdapterContext {
    pub fn new(source_id: Uuid, timezone: Tz) -> Self {
        Self {
            source_id,
            timezone,
        }
    }
}

/// Items parsed from one source, plus the upstream items that could not be read.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FetchOutcome {
    pub items: Vec<RawItem>,
    pub rejected: Vec<ItemError>,
}

impl FetchOutcome {
    pub fn is_empty(&self) -> bool {
        self.items.is_empty() && self.rejected.is_empty()
    }
}

#[async_trait]
pub trait SourceAdapter: Send + Sync {
    fn kind(&self) -> SourceKind;

    /// Fetches and parses one source. Only source-level failures are errors;
    /// a bad item lands in [`FetchOutcome::rejected`].
    async fn fetch(
        &self,
        http: &HttpFetcher,
        ctx: &AdapterContext,
        url: &str,
    ) -> Result<FetchOutcome, FetchError>;
}

/// Lookup table from source kind to adapter.
#[derive(Clone, Default)]
pub struct AdapterRegistry {
    adapters: HashMap<SourceKind, Arc<dyn SourceAdapter>>,
}

impl AdapterRegistry {
    pub fn standard() -> Self {
        SourceKind::ALL
            .into_iter()
            .fold(Self::default(), |registry, kind| {
                registry.with_adapter(Arc::from(adapter_for_kind(kind)))
            })
    }

    /// Registers `adapter` under its own kind, replacing any previous one.
    pub fn with_adapter(mut self, adapter: Arc<dyn SourceAdapter>) -> Self {
        self.adapters.insert(adapter.kind(), adapter);
        self
    }

    pub fn get(&self, kind: SourceKind) -> Option<Arc<dyn SourceAdapter>> {
        self.adapters.get(&kind).cloned()
    }
}

impl std::fmt::Debug for AdapterRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut kinds: Vec<_> = self.adapters.keys().map(SourceKind::as_str).collect();
        kinds.sort_unstable();
        f.debug_struct("AdapterRegistry").field("kinds", &kinds).finish()
    }
}

pub fn adapter_for_kind(kind: SourceKind) -> Box<dyn SourceAdapter> {
    match kind {
        SourceKind::GroupPlatform => Box::new(GroupPlatformAdapter),
        SourceKind::RegistrationPlatform => Box::new(RegistrationPlatformAdapter::default()),
        SourceKind::GenericFeed => Box::new(GenericFeedAdapter),
    }
}

pub(crate) fn text_or_none(value: &str) -> Option<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}
