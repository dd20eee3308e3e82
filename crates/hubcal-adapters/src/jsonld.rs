//! schema.org JSON-LD extraction shared by the web-page adapters.

use std::sync::LazyLock;

use chrono_tz::Tz;
use hubcal_core::{EventKind, RawItem};
use scraper::{Html, Selector};
use serde_json::Value as JsonValue;

use crate::text_or_none;
use crate::time::parse_datetime_text;

static LD_JSON: LazyLock<Selector> = LazyLock::new(|| {
    Selector::parse(r#"script[type="application/ld+json"]"#).expect("valid ld+json selector")
});

/// Every typed top-level JSON-LD node on the page, with `@graph` containers
/// and arrays flattened. Blocks that are not valid JSON are ignored.
pub(crate) fn nodes(document: &Html) -> Vec<JsonValue> {
    let mut out = Vec::new();
    for script in document.select(&LD_JSON) {
        let text = script.text().collect::<String>();
        let Ok(value) = serde_json::from_str::<JsonValue>(text.trim()) else {
            continue;
        };
        flatten_into(value, &mut out);
    }
    out
}

fn flatten_into(value: JsonValue, out: &mut Vec<JsonValue>) {
    match value {
        JsonValue::Array(items) => {
            for item in items {
                flatten_into(item, out);
            }
        }
        JsonValue::Object(mut map) => {
            if let Some(graph) = map.remove("@graph") {
                flatten_into(graph, out);
            }
            if map.contains_key("@type") {
                out.push(JsonValue::Object(map));
            }
        }
        _ => {}
    }
}

fn type_names(node: &JsonValue) -> Vec<&str> {
    match node.get("@type") {
        Some(JsonValue::String(s)) => vec![s.as_str()],
        Some(JsonValue::Array(items)) => items.iter().filter_map(JsonValue::as_str).collect(),
        _ => Vec::new(),
    }
}

/// `Event` and its schema.org subtypes (`SocialEvent`, `EducationEvent`, ...).
pub(crate) fn is_event(node: &JsonValue) -> bool {
    type_names(node).iter().any(|t| t.ends_with("Event"))
}

pub(crate) fn is_item_list(node: &JsonValue) -> bool {
    type_names(node).contains(&"ItemList")
}

pub(crate) fn str_field(node: &JsonValue, key: &str) -> Option<String> {
    match node.get(key)? {
        JsonValue::String(s) => text_or_none(s),
        JsonValue::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn capacity(node: &JsonValue) -> Option<i64> {
    match node.get("maximumAttendeeCapacity")? {
        JsonValue::Number(n) => n.as_i64(),
        JsonValue::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn attendance_mode(node: &JsonValue) -> Option<EventKind> {
    let mode = str_field(node, "eventAttendanceMode")?;
    if mode.ends_with("OnlineEventAttendanceMode") {
        Some(EventKind::Virtual)
    } else if mode.ends_with("OfflineEventAttendanceMode") {
        Some(EventKind::InPerson)
    } else if mode.ends_with("MixedEventAttendanceMode") {
        Some(EventKind::Hybrid)
    } else {
        None
    }
}

fn address_text(address: &JsonValue) -> Option<String> {
    match address {
        JsonValue::String(s) => text_or_none(s),
        JsonValue::Object(_) => {
            let parts: Vec<String> = ["streetAddress", "addressLocality", "addressRegion", "postalCode"]
                .iter()
                .filter_map(|key| str_field(address, key))
                .collect();
            if parts.is_empty() {
                None
            } else {
                Some(parts.join(", "))
            }
        }
        _ => None,
    }
}

fn place_text(place: &JsonValue) -> Option<String> {
    match place {
        JsonValue::String(s) => text_or_none(s),
        JsonValue::Array(items) => {
            let parts: Vec<String> = items.iter().filter_map(place_text).collect();
            if parts.is_empty() {
                None
            } else {
                Some(parts.join(" / "))
            }
        }
        JsonValue::Object(_) => {
            if type_names(place).contains(&"VirtualLocation") {
                return str_field(place, "url").or_else(|| str_field(place, "name"));
            }
            let name = str_field(place, "name");
            let address = place.get("address").and_then(address_text);
            match (name, address) {
                (Some(name), Some(address)) if !address.contains(&name) => {
                    Some(format!("{name}, {address}"))
                }
                (_, Some(address)) => Some(address),
                (Some(name), None) => Some(name),
                (None, None) => None,
            }
        }
        _ => None,
    }
}

/// Maps a JSON-LD `Event` node to a raw item. The native id is left to the caller.
pub(crate) fn event_to_raw(node: &JsonValue, hub: &Tz) -> RawItem {
    RawItem {
        native_id: None,
        title: str_field(node, "name"),
        description: str_field(node, "description"),
        start: str_field(node, "startDate").and_then(|s| parse_datetime_text(&s, hub)),
        location: node.get("location").and_then(place_text),
        capacity: capacity(node),
        registration_url: str_field(node, "url"),
        attendance_hint: attendance_mode(node),
    }
}
