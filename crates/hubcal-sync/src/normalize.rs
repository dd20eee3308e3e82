use std::sync::LazyLock;

use hubcal_core::{EventFields, EventKind, RawItem, SourceKind, StartInstant};
use regex::Regex;
use scraper::Html;
use serde::Serialize;
use thiserror::Error;

/// Conferencing links that mark an event as online.
static MEETING_URL_REGEXES: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [
        r"https?://([^/\s]*\.)?zoom\.us/",
        r"https?://([^/\s]*\.)?zoomgov\.com/",
        r"https?://meet\.google\.com/",
        r"https?://teams\.microsoft\.com/",
        r"https?://teams\.live\.com/",
        r"https?://meet\.jit\.si/",
        r"https?://([^/\s]*\.)?webex\.com/",
    ]
    .iter()
    .map(|pattern| Regex::new(pattern).expect("valid meeting url regex"))
    .collect()
});

static BARE_URL: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^https?://\S+$").expect("valid url regex"));

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error, Serialize)]
pub enum ValidationError {
    #[error("missing title")]
    MissingTitle,
    #[error("missing start date")]
    MissingStart,
}

/// A normalized item on its way to the merge step. Invalid drafts are
/// carried, not dropped, so the orchestrator can count them as skips.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CanonicalEventDraft {
    pub native_id: Option<String>,
    pub title: Option<String>,
    pub description: String,
    pub start: Option<StartInstant>,
    pub location: Option<String>,
    pub event_kind: EventKind,
    pub capacity: Option<i64>,
    pub registration_url: Option<String>,
    pub invalid: Option<ValidationError>,
}

impl CanonicalEventDraft {
    pub fn is_valid(&self) -> bool {
        self.invalid.is_none()
    }

    /// Store-ready fields; fails for drafts marked invalid.
    pub fn fields(&self) -> Result<EventFields, ValidationError> {
        if let Some(err) = self.invalid {
            return Err(err);
        }
        let title = self.title.clone().ok_or(ValidationError::MissingTitle)?;
        let start = self.start.ok_or(ValidationError::MissingStart)?;
        Ok(EventFields {
            title,
            description: self.description.clone(),
            start_date: start.date,
            start_time: start.time,
            location: self.location.clone(),
            event_kind: self.event_kind,
            capacity: self.capacity,
            registration_url: self.registration_url.clone(),
        })
    }

    /// How the draft is named in item errors and logs.
    pub fn label(&self) -> String {
        self.native_id
            .clone()
            .or_else(|| self.title.clone())
            .unwrap_or_else(|| "untitled item".to_string())
    }
}

pub fn is_meeting_url(text: &str) -> bool {
    MEETING_URL_REGEXES.iter().any(|re| re.is_match(text))
}

fn collapse_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Drops markup and decodes entities, keeping only text.
pub fn strip_html(text: &str) -> String {
    if !text.contains('<') && !text.contains('&') {
        return collapse_whitespace(text);
    }
    let fragment = Html::parse_fragment(text);
    let joined = fragment.root_element().text().collect::<Vec<_>>().join(" ");
    collapse_whitespace(&joined)
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.is_empty())
}

/// Maps adapter output to canonical drafts. Never fails.
#[derive(Debug, Clone, Copy, Default)]
pub struct Normalizer;

impl Normalizer {
    pub fn normalize(&self, item: RawItem, kind: SourceKind) -> CanonicalEventDraft {
        let title = non_empty(item.title.as_deref().map(strip_html));
        let description = item.description.as_deref().map(strip_html).unwrap_or_default();
        let location = non_empty(item.location.as_deref().map(collapse_whitespace));
        let registration_url = non_empty(item.registration_url.map(|u| u.trim().to_string()));

        let event_kind = item
            .attendance_hint
            .unwrap_or_else(|| infer_event_kind(location.as_deref(), &description, kind));

        let invalid = if title.is_none() {
            Some(ValidationError::MissingTitle)
        } else if item.start.is_none() {
            Some(ValidationError::MissingStart)
        } else {
            None
        };

        CanonicalEventDraft {
            native_id: non_empty(item.native_id.map(|id| id.trim().to_string())),
            title,
            description,
            start: item.start,
            location,
            event_kind,
            capacity: item.capacity.filter(|c| *c > 0),
            registration_url,
            invalid,
        }
    }
}

fn infer_event_kind(location: Option<&str>, description: &str, kind: SourceKind) -> EventKind {
    match location {
        Some(loc) if is_meeting_url(loc) => EventKind::Virtual,
        Some(loc) if kind == SourceKind::GenericFeed && BARE_URL.is_match(loc) => EventKind::Virtual,
        Some(_) if is_meeting_url(description) => EventKind::Hybrid,
        Some(_) => EventKind::InPerson,
        None if is_meeting_url(description) => EventKind::Virtual,
        // Registration items without a venue type, and everything else.
        None => EventKind::InPerson,
    }
}
