//! iCalendar feed composition for subscribed calendar clients.

use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::{DateTime, Days, Duration, NaiveDate, NaiveDateTime, Utc};
use chrono_tz::Tz;
use hubcal_adapters::resolve_local;
use hubcal_core::{CanonicalEvent, FeedSelection};
use hubcal_storage::{EventStore, FeedFilter, StoreError};
use icalendar::{Calendar, Component, EventLike, Property, ValueType};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};
use url::Url;
use uuid::Uuid;

use crate::config::HubConfig;

pub const CONTENT_TYPE: &str = "text/calendar; charset=utf-8";

const PRODID: &str = "PRODID:-//hubcal//community hub feed//EN";
const UID_DOMAIN: &str = "hubcal";
const DEFAULT_DURATION_MINUTES: i64 = 120;

#[derive(Debug, Error)]
pub enum FeedError {
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Raw query of a feed request, as it arrives on the URL.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeedRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sources: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub internal: Option<String>,
}

impl FeedRequest {
    fn explicit_sources(&self) -> Option<BTreeSet<Uuid>> {
        let raw = self.sources.as_deref().map(str::trim).filter(|s| !s.is_empty())?;
        let ids = raw
            .split(',')
            .map(str::trim)
            .filter(|token| !token.is_empty())
            .filter_map(|token| match Uuid::parse_str(token) {
                Ok(id) => Some(id),
                Err(_) => {
                    warn!(token, "ignoring malformed source id in feed request");
                    None
                }
            })
            .collect();
        Some(ids)
    }

    fn internal_flag(&self) -> Option<bool> {
        match self.internal.as_deref().map(|v| v.trim().to_ascii_lowercase()) {
            Some(v) if matches!(v.as_str(), "false" | "0" | "no") => Some(false),
            Some(v) if matches!(v.as_str(), "true" | "1" | "yes") => Some(true),
            _ => None,
        }
    }

    fn user_id(&self) -> Option<&str> {
        self.user.as_deref().map(str::trim).filter(|u| !u.is_empty())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CalendarDocument {
    pub body: String,
    pub event_count: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FeedLinks {
    pub https: String,
    pub webcal: String,
}

/// Builds the direct-fetch and subscription URLs for a feed request.
pub fn feed_links(base_url: &str, request: &FeedRequest) -> Result<FeedLinks, url::ParseError> {
    let base = if base_url.ends_with('/') {
        Url::parse(base_url)?
    } else {
        Url::parse(&format!("{base_url}/"))?
    };
    let mut feed = base.join("calendar.ics")?;
    {
        let mut query = feed.query_pairs_mut();
        if let Some(sources) = request.sources.as_deref().filter(|s| !s.trim().is_empty()) {
            query.append_pair("sources", sources.trim());
        }
        if let Some(user) = request.user_id() {
            query.append_pair("user", user);
        }
        if let Some(internal) = request.internal_flag() {
            query.append_pair("internal", if internal { "true" } else { "false" });
        }
    }
    if feed.query() == Some("") {
        feed.set_query(None);
    }

    let https = feed.to_string();
    let webcal = match https.split_once("://") {
        Some((_, rest)) => format!("webcal://{rest}"),
        None => https.clone(),
    };
    Ok(FeedLinks { https, webcal })
}

/// Read-only view over the event store that renders feeds.
pub struct FeedComposer {
    store: Arc<dyn EventStore>,
    timezone: Tz,
    calendar_name: String,
    past_days: Option<i64>,
}

impl FeedComposer {
    pub fn new(store: Arc<dyn EventStore>, config: &HubConfig) -> Self {
        Self {
            store,
            timezone: config.timezone,
            calendar_name: config.feed_name.clone(),
            past_days: config.feed_past_days,
        }
    }

    pub fn with_past_days(mut self, past_days: Option<i64>) -> Self {
        self.past_days = past_days;
        self
    }

    /// Explicit `sources` wins over a saved preference, which wins over the
    /// default of everything. Internal events are in by default except when
    /// an explicit source list is given.
    pub async fn resolve_selection(&self, request: &FeedRequest) -> Result<FeedSelection, FeedError> {
        let internal = request.internal_flag();

        if let Some(ids) = request.explicit_sources() {
            return Ok(FeedSelection::only_sources(ids, internal.unwrap_or(false)));
        }

        let include_internal = internal.unwrap_or(true);
        if let Some(user_id) = request.user_id() {
            match self.store.get_preference(user_id).await? {
                Some(pref) => return Ok(FeedSelection::from_preference(&pref, include_internal)),
                None => debug!(user_id, "no saved feed preference; serving everything"),
            }
        }

        let mut selection = FeedSelection::everything();
        selection.include_internal = include_internal;
        Ok(selection)
    }

    pub async fn compose(&self, selection: &FeedSelection) -> Result<CalendarDocument, FeedError> {
        let filter = FeedFilter::from_selection(selection, self.window_start());
        let events = self.store.feed_events(&filter).await?;
        debug!(events = events.len(), include_all = selection.include_all, "feed composed");
        Ok(CalendarDocument {
            body: render(&events, &self.calendar_name, &self.timezone),
            event_count: events.len(),
        })
    }

    pub async fn compose_request(&self, request: &FeedRequest) -> Result<CalendarDocument, FeedError> {
        let selection = self.resolve_selection(request).await?;
        self.compose(&selection).await
    }

    fn window_start(&self) -> Option<NaiveDate> {
        let days = self.past_days?;
        let today = Utc::now().with_timezone(&self.timezone).date_naive();
        today.checked_sub_days(Days::new(days.unsigned_abs()))
    }
}

/// Renders events as one VCALENDAR. Same events in, same bytes out.
pub fn render(events: &[CanonicalEvent], calendar_name: &str, timezone: &Tz) -> String {
    let mut cal = Calendar::new();
    cal.name(calendar_name);

    for event in events {
        let mut ics_event = icalendar::Event::new();
        ics_event.uid(&format!("{}@{UID_DOMAIN}", event.id));
        ics_event.add_property("DTSTAMP", event.updated_at.format("%Y%m%dT%H%M%SZ").to_string());
        ics_event.summary(&single_line(&event.title));

        match event.start_time {
            Some(time) => {
                let start = utc_start(event.start_date.and_time(time), timezone);
                let end = start + Duration::minutes(DEFAULT_DURATION_MINUTES);
                ics_event.add_property("DTSTART", start.format("%Y%m%dT%H%M%SZ").to_string());
                ics_event.add_property("DTEND", end.format("%Y%m%dT%H%M%SZ").to_string());
            }
            None => {
                add_date_property(&mut ics_event, "DTSTART", event.start_date);
                let next = event.start_date.succ_opt().unwrap_or(event.start_date);
                add_date_property(&mut ics_event, "DTEND", next);
            }
        }

        if !event.description.is_empty() {
            ics_event.description(&unix_newlines(&event.description));
        }
        if let Some(location) = &event.location {
            ics_event.location(&single_line(location));
        }
        if let Some(url) = &event.registration_url {
            ics_event.add_property("URL", url);
        }
        ics_event.add_property("CATEGORIES", event.event_kind.as_str());

        cal.push(ics_event.done());
    }

    replace_prodid(&cal.done().to_string())
}

fn utc_start(local: NaiveDateTime, timezone: &Tz) -> DateTime<Utc> {
    resolve_local(local, timezone).unwrap_or_else(|| local.and_utc())
}

fn add_date_property(ics_event: &mut icalendar::Event, name: &str, date: NaiveDate) {
    let mut prop = Property::new(name, date.format("%Y%m%d").to_string());
    prop.append_parameter(ValueType::Date);
    ics_event.append_property(prop);
}

fn unix_newlines(text: &str) -> String {
    text.replace("\r\n", "\n").replace('\r', "\n")
}

fn single_line(text: &str) -> String {
    text.replace("\r\n", " ").replace(['\r', '\n'], " ")
}

fn replace_prodid(ics: &str) -> String {
    let mut out = String::with_capacity(ics.len());
    for line in ics.lines() {
        if line.starts_with("PRODID:") {
            out.push_str(PRODID);
        } else {
            out.push_str(line);
        }
        out.push_str("\r\n");
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{NaiveTime, TimeZone};
    use hubcal_core::{EventFields, EventKind, FeedPreference, NewEventSource, PublicationStatus, SourceKind};
    use hubcal_storage::MemoryEventStore;
    use icalendar::parser::{read_calendar, unfold};

    fn fields(title: &str, date: NaiveDate, time: Option<(u32, u32)>) -> EventFields {
        EventFields {
            title: title.into(),
            description: String::new(),
            start_date: date,
            start_time: time.and_then(|(h, m)| NaiveTime::from_hms_opt(h, m, 0)),
            location: Some("Hub Hall".into()),
            event_kind: EventKind::InPerson,
            capacity: None,
            registration_url: None,
        }
    }

    fn day(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 5, d).unwrap()
    }

    fn composer(store: Arc<dyn EventStore>, timezone: Tz) -> FeedComposer {
        let config = HubConfig {
            timezone,
            ..HubConfig::default()
        };
        FeedComposer::new(store, &config).with_past_days(None)
    }

    async fn source(store: &Arc<dyn EventStore>, name: &str) -> Uuid {
        store
            .insert_source(NewEventSource {
                display_name: name.into(),
                kind: SourceKind::GenericFeed,
                url: format!("https://{name}.example.org/cal.ics"),
                active: true,
                owner_id: None,
            })
            .await
            .unwrap()
            .id
    }

    fn vevent_summaries(body: &str) -> Vec<String> {
        let unfolded = unfold(body);
        let calendar = read_calendar(&unfolded).unwrap();
        calendar
            .components
            .iter()
            .filter(|c| c.name == "VEVENT")
            .filter_map(|c| c.find_prop("SUMMARY").map(|p| p.val.to_string()))
            .collect()
    }

    #[tokio::test]
    async fn zero_matches_is_still_a_valid_calendar() {
        let store: Arc<dyn EventStore> = Arc::new(MemoryEventStore::new());
        let doc = composer(store, Tz::UTC)
            .compose(&FeedSelection::only_sources([Uuid::new_v4()], false))
            .await
            .unwrap();
        assert_eq!(doc.event_count, 0);
        assert!(doc.body.starts_with("BEGIN:VCALENDAR\r\n"));
        assert!(doc.body.ends_with("END:VCALENDAR\r\n"));
        assert!(doc.body.contains("X-WR-CALNAME:Community Hub Events"));
        assert!(vevent_summaries(&doc.body).is_empty());
    }

    #[tokio::test]
    async fn explicit_source_never_leaks_other_sources_or_internal_events() {
        let store: Arc<dyn EventStore> = Arc::new(MemoryEventStore::new());
        let a = source(&store, "alpha").await;
        let b = source(&store, "beta").await;
        store
            .insert_imported(a, &format!("{a}:1"), &fields("Alpha Night", day(2), Some((18, 0))), PublicationStatus::Published)
            .await
            .unwrap();
        store
            .insert_imported(b, &format!("{b}:1"), &fields("Beta Brunch", day(3), Some((10, 0))), PublicationStatus::Published)
            .await
            .unwrap();
        store
            .insert_internal(&fields("Board Meeting", day(4), None), PublicationStatus::Published)
            .await
            .unwrap();

        let composer = composer(store, Tz::UTC);
        let request = FeedRequest {
            sources: Some(a.to_string()),
            ..FeedRequest::default()
        };
        let doc = composer.compose_request(&request).await.unwrap();
        assert_eq!(vevent_summaries(&doc.body), vec!["Alpha Night".to_string()]);

        let everything = composer.compose_request(&FeedRequest::default()).await.unwrap();
        assert_eq!(
            vevent_summaries(&everything.body),
            vec!["Alpha Night".to_string(), "Beta Brunch".to_string(), "Board Meeting".to_string()]
        );

        let no_internal = FeedRequest {
            internal: Some("false".into()),
            ..FeedRequest::default()
        };
        assert_eq!(composer.compose_request(&no_internal).await.unwrap().event_count, 2);

        let with_internal = FeedRequest {
            sources: Some(format!("{a}, not-a-uuid")),
            internal: Some("true".into()),
            ..FeedRequest::default()
        };
        assert_eq!(
            vevent_summaries(&composer.compose_request(&with_internal).await.unwrap().body),
            vec!["Alpha Night".to_string(), "Board Meeting".to_string()]
        );
    }

    #[tokio::test]
    async fn unpublished_events_stay_out() {
        let store: Arc<dyn EventStore> = Arc::new(MemoryEventStore::new());
        let a = source(&store, "alpha").await;
        store
            .insert_imported(a, &format!("{a}:p"), &fields("Pending Talk", day(2), None), PublicationStatus::Pending)
            .await
            .unwrap();
        let doc = composer(store, Tz::UTC)
            .compose(&FeedSelection::everything())
            .await
            .unwrap();
        assert_eq!(doc.event_count, 0);
    }

    #[tokio::test]
    async fn saved_preference_drives_the_user_variant() {
        let store: Arc<dyn EventStore> = Arc::new(MemoryEventStore::new());
        let a = source(&store, "alpha").await;
        let b = source(&store, "beta").await;
        store
            .upsert_preference(&FeedPreference {
                user_id: "member-7".into(),
                include_all_sources: false,
                selected_sources: vec![b],
                updated_at: Utc::now(),
            })
            .await
            .unwrap();
        let composer = composer(store, Tz::UTC);

        let selection = composer
            .resolve_selection(&FeedRequest {
                user: Some("member-7".into()),
                ..FeedRequest::default()
            })
            .await
            .unwrap();
        assert!(!selection.include_all);
        assert!(selection.include_internal);
        assert_eq!(selection.source_ids, BTreeSet::from([b]));
        assert_eq!(selection.user_id.as_deref(), Some("member-7"));

        let explicit = composer
            .resolve_selection(&FeedRequest {
                sources: Some(a.to_string()),
                user: Some("member-7".into()),
                ..FeedRequest::default()
            })
            .await
            .unwrap();
        assert_eq!(explicit.source_ids, BTreeSet::from([a]));
        assert!(!explicit.include_internal);

        let stranger = composer
            .resolve_selection(&FeedRequest {
                user: Some("nobody".into()),
                ..FeedRequest::default()
            })
            .await
            .unwrap();
        assert_eq!(stranger, FeedSelection::everything());
    }

    #[tokio::test]
    async fn repeated_composition_is_byte_identical() {
        let store: Arc<dyn EventStore> = Arc::new(MemoryEventStore::new());
        let a = source(&store, "alpha").await;
        for n in 1..=3 {
            store
                .insert_imported(a, &format!("{a}:{n}"), &fields(&format!("Session {n}"), day(n), Some((19, 0))), PublicationStatus::Published)
                .await
                .unwrap();
        }
        let composer = composer(store, Tz::UTC);
        let first = composer.compose(&FeedSelection::everything()).await.unwrap();
        let second = composer.compose(&FeedSelection::everything()).await.unwrap();
        assert_eq!(first.body, second.body);
    }

    #[tokio::test]
    async fn store_outage_is_an_error_not_a_document() {
        let memory = Arc::new(MemoryEventStore::new());
        memory.set_unavailable(true);
        let store: Arc<dyn EventStore> = memory;
        let err = composer(store, Tz::UTC)
            .compose(&FeedSelection::everything())
            .await
            .unwrap_err();
        assert!(matches!(err, FeedError::Store(StoreError::Unavailable(_))));
    }

    #[tokio::test]
    async fn events_before_the_window_are_omitted() {
        let store: Arc<dyn EventStore> = Arc::new(MemoryEventStore::new());
        let today = Utc::now().date_naive();
        store
            .insert_internal(&fields("Long Ago", today - Days::new(400), None), PublicationStatus::Published)
            .await
            .unwrap();
        store
            .insert_internal(&fields("Upcoming", today + Days::new(10), None), PublicationStatus::Published)
            .await
            .unwrap();
        let doc = composer(store, Tz::UTC)
            .with_past_days(Some(30))
            .compose(&FeedSelection::everything())
            .await
            .unwrap();
        assert_eq!(vevent_summaries(&doc.body), vec!["Upcoming".to_string()]);
    }

    fn event(fields: &EventFields) -> CanonicalEvent {
        let stamp = Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap();
        CanonicalEvent {
            id: Uuid::nil(),
            title: fields.title.clone(),
            description: fields.description.clone(),
            start_date: fields.start_date,
            start_time: fields.start_time,
            location: fields.location.clone(),
            event_kind: fields.event_kind,
            capacity: fields.capacity,
            registration_url: fields.registration_url.clone(),
            attendee_count: 0,
            origin: hubcal_core::EventOrigin::Internal,
            status: PublicationStatus::Published,
            source_id: None,
            external_id: None,
            created_at: stamp,
            updated_at: stamp,
        }
    }

    #[test]
    fn timed_events_are_emitted_in_utc_from_the_hub_zone() {
        let lisbon: Tz = "Europe/Lisbon".parse().unwrap();
        let body = render(&[event(&fields("Summer Talk", day(20), Some((19, 30))))], "Hub", &lisbon);
        assert!(body.contains("DTSTART:20260520T183000Z"));
        assert!(body.contains("DTEND:20260520T203000Z"));
        assert!(body.contains("DTSTAMP:20260301T120000Z"));
        assert!(body.contains(&format!("UID:{}@hubcal", Uuid::nil())));
        assert!(body.contains("CATEGORIES:in-person"));
        assert!(body.contains(PRODID));
    }

    #[test]
    fn all_day_events_use_date_values() {
        let mut all_day = fields("Swap Meet", day(31), None);
        all_day.description = "Bring things.\nTake things.".into();
        let body = render(&[event(&all_day)], "Hub", &Tz::UTC);
        assert!(body.contains("DTSTART;VALUE=DATE:20260531"));
        assert!(body.contains("DTEND;VALUE=DATE:20260601"));
        assert_eq!(vevent_summaries(&body), vec!["Swap Meet".to_string()]);
    }

    #[test]
    fn descriptions_keep_line_breaks_and_locations_stay_on_one_line() {
        let mut talk = fields("Repair Night", day(12), Some((18, 0)));
        talk.description = "Bring things.\r\nTake things, too.\nNo fees.".into();
        talk.location = Some("Hub Hall\nBack room".into());
        let body = render(&[event(&talk)], "Hub", &Tz::UTC);
        assert!(body.contains(r"DESCRIPTION:Bring things.\nTake things\, too.\nNo fees."));
        assert!(body.contains("LOCATION:Hub Hall Back room"));
    }

    #[test]
    fn links_carry_the_same_query_under_both_schemes() {
        let links = feed_links(
            "https://hub.example.org",
            &FeedRequest {
                sources: Some("a,b".into()),
                user: None,
                internal: Some("false".into()),
            },
        )
        .unwrap();
        assert_eq!(
            links.https,
            "https://hub.example.org/calendar.ics?sources=a%2Cb&internal=false"
        );
        assert_eq!(
            links.webcal,
            "webcal://hub.example.org/calendar.ics?sources=a%2Cb&internal=false"
        );

        let plain = feed_links("http://localhost:8000/", &FeedRequest::default()).unwrap();
        assert_eq!(plain.https, "http://localhost:8000/calendar.ics");
        assert_eq!(plain.webcal, "webcal://localhost:8000/calendar.ics");
    }
}
