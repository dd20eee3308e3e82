use std::collections::HashSet;
use std::sync::Arc;

use hubcal_core::{EventFields, ExternalIdentity, PublicationStatus, SourceKind};
use hubcal_storage::{EventStore, StoreError};
use uuid::Uuid;

use crate::normalize::CanonicalEventDraft;

/// What the merge step should do with one draft.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    Insert {
        external_id: ExternalIdentity,
        fields: EventFields,
    },
    Update {
        existing_id: Uuid,
        fields: EventFields,
    },
    /// Already imported with identical fields.
    Unchanged { existing_id: Uuid },
    Skip { reason: String },
}

/// Effect of applying a resolution to the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeEffect {
    Inserted(Uuid),
    Updated(Uuid),
    Unchanged(Uuid),
    Skipped,
}

/// Native id when present. Only kinds that cannot promise one fall back to
/// a content hash of title and start.
pub fn external_identity(
    source_id: Uuid,
    kind: SourceKind,
    draft: &CanonicalEventDraft,
) -> Option<ExternalIdentity> {
    if let Some(native) = &draft.native_id {
        return Some(ExternalIdentity::from_native(source_id, native));
    }
    if kind.guarantees_native_id() {
        return None;
    }
    match (&draft.title, &draft.start) {
        (Some(title), Some(start)) => Some(ExternalIdentity::from_content(source_id, title, start)),
        _ => None,
    }
}

/// Insert-or-update decisions for one source run.
///
/// Remembers the identities it has seen, so a feed listing the same event
/// twice yields one insert and one skip.
pub struct DedupEngine {
    store: Arc<dyn EventStore>,
    source_id: Uuid,
    kind: SourceKind,
    seen: HashSet<ExternalIdentity>,
}

impl DedupEngine {
    pub fn new(store: Arc<dyn EventStore>, source_id: Uuid, kind: SourceKind) -> Self {
        Self {
            store,
            source_id,
            kind,
            seen: HashSet::new(),
        }
    }

    pub async fn resolve(&mut self, draft: &CanonicalEventDraft) -> Result<Resolution, StoreError> {
        let fields = match draft.fields() {
            Ok(fields) => fields,
            Err(err) => {
                return Ok(Resolution::Skip {
                    reason: err.to_string(),
                })
            }
        };
        let Some(external_id) = external_identity(self.source_id, self.kind, draft) else {
            let reason = if self.kind.guarantees_native_id() {
                "no native id"
            } else {
                "no stable identity"
            };
            return Ok(Resolution::Skip {
                reason: reason.to_string(),
            });
        };
        if !self.seen.insert(external_id.clone()) {
            return Ok(Resolution::Skip {
                reason: "duplicate within feed".to_string(),
            });
        }

        match self
            .store
            .find_imported(self.source_id, external_id.as_str())
            .await?
        {
            None => Ok(Resolution::Insert {
                external_id,
                fields,
            }),
            Some(existing) if existing.fields() == fields => Ok(Resolution::Unchanged {
                existing_id: existing.id,
            }),
            Some(existing) => Ok(Resolution::Update {
                existing_id: existing.id,
                fields,
            }),
        }
    }

    /// Writes a resolution. An insert that loses a race on the unique
    /// identity turns into an update of the winning row.
    pub async fn apply(
        &self,
        resolution: Resolution,
        status: PublicationStatus,
    ) -> Result<MergeEffect, StoreError> {
        match resolution {
            Resolution::Insert {
                external_id,
                fields,
            } => {
                match self
                    .store
                    .insert_imported(self.source_id, external_id.as_str(), &fields, status)
                    .await
                {
                    Ok(id) => Ok(MergeEffect::Inserted(id)),
                    Err(StoreError::Conflict { .. }) => {
                        let existing = self
                            .store
                            .find_imported(self.source_id, external_id.as_str())
                            .await?
                            .ok_or_else(|| StoreError::NotFound {
                                what: "imported event",
                                id: external_id.to_string(),
                            })?;
                        self.store.update_imported(existing.id, &fields).await?;
                        Ok(MergeEffect::Updated(existing.id))
                    }
                    Err(err) => Err(err),
                }
            }
            Resolution::Update {
                existing_id,
                fields,
            } => {
                self.store.update_imported(existing_id, &fields).await?;
                Ok(MergeEffect::Updated(existing_id))
            }
            Resolution::Unchanged { existing_id } => Ok(MergeEffect::Unchanged(existing_id)),
            Resolution::Skip { .. } => Ok(MergeEffect::Skipped),
        }
    }
}
