//! Sync pipeline (normalize → dedup → store) and feed composition.

pub mod config;
pub mod dedup;
pub mod feed;
pub mod normalize;
pub mod orchestrator;
pub mod schedule;
pub mod seed;

pub use config::HubConfig;
pub use dedup::{external_identity, DedupEngine, MergeEffect, Resolution};
pub use feed::{feed_links, CalendarDocument, FeedComposer, FeedError, FeedLinks, FeedRequest};
pub use normalize::{CanonicalEventDraft, Normalizer, ValidationError};
pub use orchestrator::{SourceSyncReport, SyncError, SyncOrchestrator};
pub use schedule::maybe_build_scheduler;
pub use seed::{apply_seed, load_seed_file, SeedSummary, SourceSeed, SourceSeedFile};

pub const CRATE_NAME: &str = "hubcal-sync";
