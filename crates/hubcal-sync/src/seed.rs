use std::path::Path;

use anyhow::{Context, Result};
use hubcal_core::{NewEventSource, SourceKind};
use hubcal_storage::{EventStore, StoreError};
use serde::{Deserialize, Serialize};
use tokio::fs;
use tracing::info;

#[derive(Debug, Clone, Deserialize)]
pub struct SourceSeedFile {
    pub sources: Vec<SourceSeed>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SourceSeed {
    pub display_name: String,
    pub kind: SourceKind,
    pub url: String,
    #[serde(default = "default_active")]
    pub active: bool,
    #[serde(default)]
    pub owner_id: Option<String>,
}

fn default_active() -> bool {
    true
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SeedSummary {
    pub created: usize,
    pub updated: usize,
    pub unchanged: usize,
}

pub async fn load_seed_file(path: &Path) -> Result<SourceSeedFile> {
    let text = fs::read_to_string(path)
        .await
        .with_context(|| format!("reading {}", path.display()))?;
    serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))
}

/// Registers every seeded source, matching existing ones on (kind, url).
/// Only the active flag of an existing source is touched.
pub async fn apply_seed(store: &dyn EventStore, file: &SourceSeedFile) -> Result<SeedSummary, StoreError> {
    let mut summary = SeedSummary::default();
    for seed in &file.sources {
        let url = seed.url.trim();
        match store.find_source(seed.kind, url).await? {
            Some(existing) if existing.active == seed.active => summary.unchanged += 1,
            Some(existing) => {
                store.set_source_active(existing.id, seed.active).await?;
                summary.updated += 1;
            }
            None => {
                let created = store
                    .insert_source(NewEventSource {
                        display_name: seed.display_name.clone(),
                        kind: seed.kind,
                        url: url.to_string(),
                        active: seed.active,
                        owner_id: seed.owner_id.clone(),
                    })
                    .await?;
                info!(source_id = %created.id, kind = %created.kind, "seeded source");
                summary.created += 1;
            }
        }
    }
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use hubcal_storage::MemoryEventStore;
    use std::io::Write;

    const SEED: &str = r#"
sources:
  - display_name: Rust Meetup
    kind: group-platform
    url: https://groups.example.com/rust-springfield/events/
    owner_id: organizer-1
  - display_name: Makers Guild
    kind: generic-feed
    url: https://makers.example.org/calendar.ics
    active: false
"#;

    #[tokio::test]
    async fn seeding_twice_only_creates_once() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(SEED.as_bytes()).unwrap();
        let seed = load_seed_file(file.path()).await.unwrap();
        assert_eq!(seed.sources.len(), 2);
        assert!(seed.sources[0].active);
        assert!(!seed.sources[1].active);

        let store = MemoryEventStore::new();
        let first = apply_seed(&store, &seed).await.unwrap();
        assert_eq!(first, SeedSummary { created: 2, updated: 0, unchanged: 0 });

        let mut toggled = seed.clone();
        toggled.sources[1].active = true;
        let second = apply_seed(&store, &toggled).await.unwrap();
        assert_eq!(second, SeedSummary { created: 0, updated: 1, unchanged: 1 });
        assert_eq!(store.list_active_sources().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn unknown_kind_is_a_parse_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sources.yaml");
        std::fs::write(
            &path,
            "sources:\n  - display_name: X\n    kind: carrier-pigeon\n    url: https://x.example\n",
        )
        .unwrap();
        let err = load_seed_file(&path).await.unwrap_err();
        assert!(format!("{err:#}").contains("parsing"));
    }
}
