use std::collections::HashSet;
use std::sync::LazyLock;

use async_trait::async_trait;
use chrono_tz::Tz;
use hubcal_core::{EventKind, ItemError, RawItem, SourceKind};
use hubcal_storage::{FetchError, HttpFetcher};
use regex::Regex;
use scraper::{Html, Selector};
use serde_json::Value as JsonValue;
use tracing::{debug, warn};

use crate::jsonld::{self, str_field};
use crate::time::parse_datetime_text;
use crate::{text_or_none, AdapterContext, FetchOutcome, SourceAdapter};

static EVENT_ID: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"/events/(\d+)").expect("valid event id regex"));

static NEXT_DATA: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse("script#__NEXT_DATA__").expect("valid next data selector"));

/// Public group pages on a group-meeting platform.
#[derive(Debug, Clone, Copy, Default)]
pub struct GroupPlatformAdapter;

#[async_trait]
impl SourceAdapter for GroupPlatformAdapter {
    fn kind(&self) -> SourceKind {
        SourceKind::GroupPlatform
    }

    async fn fetch(
        &self,
        http: &HttpFetcher,
        ctx: &AdapterContext,
        url: &str,
    ) -> Result<FetchOutcome, FetchError> {
        let response = http.fetch(&ctx.source_id.to_string(), url).await?;
        parse_group_page(&response.text(), &ctx.timezone)
    }
}

fn native_id_from_url(url: &str) -> Option<String> {
    EVENT_ID
        .captures(url)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().to_string())
}

/// Extracts events from a group page: schema.org JSON-LD first, then the
/// embedded Apollo cache for events the JSON-LD omits.
pub fn parse_group_page(html: &str, hub: &Tz) -> Result<FetchOutcome, FetchError> {
    let document = Html::parse_document(html);
    let ld_nodes = jsonld::nodes(&document);
    let apollo = apollo_state(&document);

    if ld_nodes.is_empty() && apollo.is_none() {
        return Err(FetchError::parse_failure(
            "group page carries neither JSON-LD nor an embedded event cache",
        ));
    }

    let mut outcome = FetchOutcome::default();
    let mut seen = HashSet::new();

    for (position, node) in ld_nodes.iter().filter(|n| jsonld::is_event(n)).enumerate() {
        let mut item = jsonld::event_to_raw(node, hub);
        match item.registration_url.as_deref().and_then(native_id_from_url) {
            Some(id) => {
                seen.insert(id.clone());
                item.native_id = Some(id);
                outcome.items.push(item);
            }
            None => {
                let label = item
                    .title
                    .clone()
                    .unwrap_or_else(|| format!("json-ld event #{}", position + 1));
                warn!(item = %label, "group event without an event id");
                outcome
                    .rejected
                    .push(ItemError::new(label, "no event id in event url"));
            }
        }
    }

    if let Some(state) = apollo {
        for (key, entry) in state.iter() {
            if entry.get("__typename").and_then(JsonValue::as_str) != Some("Event") {
                continue;
            }
            let native_id = str_field(entry, "id")
                .or_else(|| str_field(entry, "eventUrl").and_then(|u| native_id_from_url(&u)));
            let Some(native_id) = native_id else {
                outcome
                    .rejected
                    .push(ItemError::new(key.clone(), "cached event has no id"));
                continue;
            };
            if !seen.insert(native_id.clone()) {
                continue;
            }
            let mut item = apollo_event_to_raw(entry, &state, hub);
            item.native_id = Some(native_id);
            outcome.items.push(item);
        }
    }

    debug!(
        items = outcome.items.len(),
        rejected = outcome.rejected.len(),
        "parsed group page"
    );
    Ok(outcome)
}

fn apollo_state(document: &Html) -> Option<serde_json::Map<String, JsonValue>> {
    let script = document.select(&NEXT_DATA).next()?;
    let value: JsonValue = serde_json::from_str(script.text().collect::<String>().trim()).ok()?;
    value
        .pointer("/props/pageProps/__APOLLO_STATE__")
        .and_then(JsonValue::as_object)
        .cloned()
}

fn resolve_ref<'a>(
    value: &'a JsonValue,
    state: &'a serde_json::Map<String, JsonValue>,
) -> Option<&'a JsonValue> {
    match value.get("__ref").and_then(JsonValue::as_str) {
        Some(key) => state.get(key),
        None => Some(value),
    }
}

fn apollo_event_to_raw(
    entry: &JsonValue,
    state: &serde_json::Map<String, JsonValue>,
    hub: &Tz,
) -> RawItem {
    let venue = entry.get("venue").and_then(|v| resolve_ref(v, state));
    let location = venue.and_then(|v| {
        let parts: Vec<String> = ["name", "address", "city"]
            .iter()
            .filter_map(|key| str_field(v, key))
            .collect();
        text_or_none(&parts.join(", "))
    });

    let attendance_hint = match entry.get("eventType").and_then(JsonValue::as_str) {
        Some("ONLINE") => Some(EventKind::Virtual),
        Some("PHYSICAL") => Some(EventKind::InPerson),
        Some("HYBRID") => Some(EventKind::Hybrid),
        _ => match entry.get("isOnline").and_then(JsonValue::as_bool) {
            Some(true) => Some(EventKind::Virtual),
            _ => None,
        },
    };

    RawItem {
        native_id: None,
        title: str_field(entry, "title"),
        description: str_field(entry, "description"),
        start: str_field(entry, "dateTime").and_then(|s| parse_datetime_text(&s, hub)),
        location,
        capacity: entry
            .get("maxTickets")
            .and_then(JsonValue::as_i64)
            .filter(|n| *n > 0),
        registration_url: str_field(entry, "eventUrl"),
        attendance_hint,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::fixture;
    use hubcal_storage::FetchErrorKind;

    #[test]
    fn json_ld_and_apollo_events_are_merged_by_event_id() {
        let outcome =
            parse_group_page(&fixture("group-platform/rust-meetup.html"), &Tz::UTC).unwrap();
        let ids: Vec<_> = outcome
            .items
            .iter()
            .map(|i| i.native_id.clone().unwrap())
            .collect();
        assert_eq!(ids, vec!["301000001", "301000002", "301000003"]);
        assert!(outcome.rejected.is_empty());
    }

    #[test]
    fn json_ld_fields_are_carried_over() {
        let outcome =
            parse_group_page(&fixture("group-platform/rust-meetup.html"), &Tz::UTC).unwrap();
        let first = &outcome.items[0];
        assert_eq!(first.title.as_deref(), Some("Rust Hack Night"));
        assert_eq!(first.start.unwrap().to_string(), "2026-04-14T23:00:00");
        assert_eq!(first.attendance_hint, Some(EventKind::InPerson));
        assert!(first.location.as_deref().unwrap().contains("Foundry Coworking"));

        let online = &outcome.items[1];
        assert_eq!(online.attendance_hint, Some(EventKind::Virtual));
    }

    #[test]
    fn apollo_only_event_resolves_its_venue() {
        let outcome =
            parse_group_page(&fixture("group-platform/rust-meetup.html"), &Tz::UTC).unwrap();
        let third = &outcome.items[2];
        assert_eq!(third.title.as_deref(), Some("Async Rust Deep Dive"));
        assert_eq!(
            third.location.as_deref(),
            Some("Public Library Room 4, 200 Elm St, Springfield")
        );
        assert_eq!(third.capacity, Some(30));
        assert_eq!(third.start.unwrap().to_string(), "2026-05-05T22:30:00");
    }

    #[test]
    fn page_without_known_structure_is_a_parse_failure() {
        let err = parse_group_page("<html><body><h1>Log in</h1></body></html>", &Tz::UTC)
            .unwrap_err();
        assert_eq!(err.kind, FetchErrorKind::ParseFailure);
    }

    #[test]
    fn event_url_without_id_is_rejected_not_fatal() {
        let html = r#"<html><head><script type="application/ld+json">
            {"@type":"Event","name":"Mystery","startDate":"2026-04-01T10:00:00Z","url":"https://groups.example.com/x/"}
            </script></head></html>"#;
        let outcome = parse_group_page(html, &Tz::UTC).unwrap();
        assert!(outcome.items.is_empty());
        assert_eq!(outcome.rejected[0].item, "Mystery");
    }
}
