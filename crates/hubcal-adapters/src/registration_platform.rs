use std::collections::HashSet;
use std::sync::LazyLock;

use async_trait::async_trait;
use chrono_tz::Tz;
use futures::stream::{self, StreamExt};
use hubcal_core::{ItemError, RawItem, SourceKind};
use hubcal_storage::{FetchError, HttpFetcher};
use regex::Regex;
use scraper::{Html, Selector};
use serde_json::Value as JsonValue;
use tracing::{debug, warn};
use url::Url;

use crate::jsonld::{self, str_field};
use crate::{AdapterContext, FetchOutcome, SourceAdapter};

static TICKET_ID: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"/e/(?:[A-Za-z0-9-]*-)?(\d+)/?$").expect("valid ticket id regex")
});

static ANCHORS: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse("a[href]").expect("valid anchor selector"));

/// Event-registration platform pages: one event, or an organizer collection.
#[derive(Debug, Clone)]
pub struct RegistrationPlatformAdapter {
    member_concurrency: usize,
}

impl Default for RegistrationPlatformAdapter {
    fn default() -> Self {
        Self {
            member_concurrency: 4,
        }
    }
}

impl RegistrationPlatformAdapter {
    pub fn with_member_concurrency(member_concurrency: usize) -> Self {
        Self {
            member_concurrency: member_concurrency.max(1),
        }
    }

    async fn fetch_member(
        &self,
        http: &HttpFetcher,
        ctx: &AdapterContext,
        member_url: String,
    ) -> Result<RawItem, ItemError> {
        let response = http
            .fetch(&ctx.source_id.to_string(), &member_url)
            .await
            .map_err(|err| ItemError::new(&member_url, err.to_string()))?;
        parse_event_page(&response.text(), &response.final_url, &ctx.timezone)
            .map_err(|err| ItemError::new(&member_url, err.message))
    }
}

#[async_trait]
impl SourceAdapter for RegistrationPlatformAdapter {
    fn kind(&self) -> SourceKind {
        SourceKind::RegistrationPlatform
    }

    async fn fetch(
        &self,
        http: &HttpFetcher,
        ctx: &AdapterContext,
        url: &str,
    ) -> Result<FetchOutcome, FetchError> {
        let response = http.fetch(&ctx.source_id.to_string(), url).await?;
        let page = parse_registration_page(&response.text(), &response.final_url, &ctx.timezone)?;

        match page {
            RegistrationPage::Single(item) => Ok(FetchOutcome {
                items: vec![item],
                rejected: Vec::new(),
            }),
            RegistrationPage::Collection {
                embedded,
                member_urls,
                rejected,
            } => {
                debug!(
                    embedded = embedded.len(),
                    members = member_urls.len(),
                    "enumerating registration collection"
                );
                let mut outcome = FetchOutcome {
                    items: embedded,
                    rejected,
                };
                let members: Vec<Result<RawItem, ItemError>> = stream::iter(member_urls)
                    .map(|member_url| self.fetch_member(http, ctx, member_url))
                    .buffered(self.member_concurrency)
                    .collect()
                    .await;
                for member in members {
                    match member {
                        Ok(item) => outcome.items.push(item),
                        Err(err) => {
                            warn!(item = %err.item, reason = %err.reason, "skipping collection member");
                            outcome.rejected.push(err);
                        }
                    }
                }
                Ok(outcome)
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistrationPage {
    Single(RawItem),
    Collection {
        /// Members whose event data is embedded in the collection page.
        embedded: Vec<RawItem>,
        /// Members that need their own page fetched.
        member_urls: Vec<String>,
        rejected: Vec<ItemError>,
    },
}

fn ticket_id(url: &str) -> Option<String> {
    let path = Url::parse(url).map(|u| u.path().to_string()).unwrap_or_else(|_| url.to_string());
    TICKET_ID
        .captures(&path)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().to_string())
}

/// Trailing ticket id when the URL has one, otherwise the URL itself.
fn native_id_for(url: &str) -> String {
    ticket_id(url).unwrap_or_else(|| url.trim().to_string())
}

fn resolve(base: Option<&Url>, href: &str) -> Option<String> {
    match base {
        Some(base) => base.join(href.trim()).ok().map(|mut u| {
            u.set_fragment(None);
            u.to_string()
        }),
        None => Url::parse(href.trim()).ok().map(|u| u.to_string()),
    }
}

fn event_with_identity(node: &JsonValue, page_url: &str, hub: &Tz) -> RawItem {
    let mut item = jsonld::event_to_raw(node, hub);
    let url = item
        .registration_url
        .clone()
        .unwrap_or_else(|| page_url.to_string());
    item.native_id = Some(native_id_for(&url));
    item.registration_url = Some(url);
    item
}

/// Parses a page that must describe exactly one event.
pub fn parse_event_page(html: &str, page_url: &str, hub: &Tz) -> Result<RawItem, FetchError> {
    let document = Html::parse_document(html);
    jsonld::nodes(&document)
        .iter()
        .find(|n| jsonld::is_event(n))
        .map(|node| event_with_identity(node, page_url, hub))
        .ok_or_else(|| FetchError::parse_failure(format!("no event data on {page_url}")))
}

/// Classifies a registration page and extracts what it carries.
///
/// A page whose URL is itself a ticket URL and that has no `ItemList` is a
/// single event. Anything else is a collection: `ItemList` members and links
/// to ticket pages are enumerated, deduplicated by native id.
pub fn parse_registration_page(
    html: &str,
    page_url: &str,
    hub: &Tz,
) -> Result<RegistrationPage, FetchError> {
    let document = Html::parse_document(html);
    let nodes = jsonld::nodes(&document);
    let lists: Vec<&JsonValue> = nodes.iter().filter(|n| jsonld::is_item_list(n)).collect();
    let events: Vec<&JsonValue> = nodes.iter().filter(|n| jsonld::is_event(n)).collect();

    if lists.is_empty() && ticket_id(page_url).is_some() {
        return events
            .first()
            .map(|node| RegistrationPage::Single(event_with_identity(node, page_url, hub)))
            .ok_or_else(|| FetchError::parse_failure(format!("no event data on {page_url}")));
    }

    let base = Url::parse(page_url).ok();
    let mut seen = HashSet::new();
    let mut embedded = Vec::new();
    let mut member_urls = Vec::new();
    let mut rejected = Vec::new();

    let page_is_ticket = ticket_id(page_url).is_some();
    for (position, node) in events.iter().enumerate() {
        let mut item = jsonld::event_to_raw(node, hub);
        let url = item
            .registration_url
            .as_deref()
            .and_then(|href| resolve(base.as_ref(), href))
            .or_else(|| page_is_ticket.then(|| page_url.to_string()));
        let Some(url) = url else {
            rejected.push(ItemError::new(
                item.title.unwrap_or_else(|| format!("embedded event #{}", position + 1)),
                "collection member has no url",
            ));
            continue;
        };
        let id = native_id_for(&url);
        if seen.insert(id.clone()) {
            item.native_id = Some(id);
            item.registration_url = Some(url);
            embedded.push(item);
        }
    }

    for list in &lists {
        let members = list
            .get("itemListElement")
            .and_then(JsonValue::as_array)
            .cloned()
            .unwrap_or_default();
        for (position, element) in members.iter().enumerate() {
            let body = element.get("item").unwrap_or(element);
            let member_url = str_field(body, "url")
                .or_else(|| str_field(element, "url"))
                .and_then(|href| resolve(base.as_ref(), &href));

            if jsonld::is_event(body) {
                let mut item = jsonld::event_to_raw(body, hub);
                let Some(url) = member_url else {
                    rejected.push(ItemError::new(
                        item.title.unwrap_or_else(|| format!("list member #{}", position + 1)),
                        "collection member has no url",
                    ));
                    continue;
                };
                let id = native_id_for(&url);
                if seen.insert(id.clone()) {
                    item.native_id = Some(id);
                    item.registration_url = Some(url);
                    embedded.push(item);
                }
                continue;
            }

            match member_url {
                Some(url) => {
                    if seen.insert(native_id_for(&url)) {
                        member_urls.push(url);
                    }
                }
                None => rejected.push(ItemError::new(
                    format!("list member #{}", position + 1),
                    "collection member has no url",
                )),
            }
        }
    }

    for anchor in document.select(&ANCHORS) {
        let Some(href) = anchor.value().attr("href") else {
            continue;
        };
        let Some(url) = resolve(base.as_ref(), href) else {
            continue;
        };
        let Some(id) = ticket_id(&url) else {
            continue;
        };
        if seen.insert(id) {
            member_urls.push(url);
        }
    }

    if lists.is_empty() && embedded.is_empty() && member_urls.is_empty() && rejected.is_empty() {
        return Err(FetchError::parse_failure(format!(
            "no events or event links on {page_url}"
        )));
    }

    Ok(RegistrationPage::Collection {
        embedded,
        member_urls,
        rejected,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{fixture, serve_pages};
    use hubcal_storage::{FetchErrorKind, HttpClientConfig};
    use std::time::Duration;
    use uuid::Uuid;

    const WORKSHOP_PATH: &str = "/e/intro-to-embedded-rust-tickets-700100200300";

    #[test]
    fn ticket_ids_come_from_the_url_path() {
        assert_eq!(
            ticket_id("https://tickets.example.com/e/intro-to-embedded-rust-tickets-700100200300?aff=x"),
            Some("700100200300".into())
        );
        assert_eq!(ticket_id("https://tickets.example.com/e/700100200301/"), Some("700100200301".into()));
        assert_eq!(ticket_id("https://tickets.example.com/o/springfield-makers-123"), None);
        assert_eq!(
            native_id_for("https://other.example.org/events/spring"),
            "https://other.example.org/events/spring"
        );
    }

    #[test]
    fn single_event_page_yields_one_item() {
        let page = parse_registration_page(
            &fixture("registration-platform/embedded-rust-workshop.html"),
            &format!("https://tickets.example.com{WORKSHOP_PATH}"),
            &Tz::UTC,
        )
        .unwrap();
        let RegistrationPage::Single(item) = page else {
            panic!("expected a single event page");
        };
        assert_eq!(item.native_id.as_deref(), Some("700100200300"));
        assert_eq!(item.title.as_deref(), Some("Intro to Embedded Rust"));
        assert_eq!(item.capacity, Some(24));
        assert!(item.attendance_hint.is_none());
        assert_eq!(item.start.unwrap().to_string(), "2026-05-16T14:00:00");
    }

    #[test]
    fn collection_page_lists_embedded_and_linked_members() {
        let page = parse_registration_page(
            &fixture("registration-platform/organizer-collection.html"),
            "https://tickets.example.com/o/springfield-makers-5550001",
            &Tz::UTC,
        )
        .unwrap();
        let RegistrationPage::Collection {
            embedded,
            member_urls,
            rejected,
        } = page
        else {
            panic!("expected a collection page");
        };
        assert_eq!(embedded.len(), 1);
        assert_eq!(embedded[0].native_id.as_deref(), Some("700100200301"));
        assert_eq!(
            member_urls,
            vec![
                format!("https://tickets.example.com{WORKSHOP_PATH}"),
                "https://tickets.example.com/e/retired-meetup-tickets-700100200399".to_string(),
                "https://tickets.example.com/e/async-book-club-tickets-700100200302".to_string(),
            ]
        );
        assert!(rejected.is_empty());
    }

    #[test]
    fn collection_events_without_url_are_recorded_not_dropped() {
        let html = r#"<html><head>
            <script type="application/ld+json">
            {"@type":"Event","name":"Alpha","startDate":"2026-06-01T18:00:00Z"}
            </script>
            <script type="application/ld+json">
            {"@type":"Event","name":"Beta","startDate":"2026-06-08T18:00:00Z"}
            </script>
            <script type="application/ld+json">
            {"@type":"Event","name":"Gamma","startDate":"2026-06-15T18:00:00Z",
             "url":"https://tickets.example.com/e/gamma-tickets-700100200500"}
            </script>
            </head></html>"#;
        let page = parse_registration_page(html, "https://tickets.example.com/o/org-55", &Tz::UTC).unwrap();
        let RegistrationPage::Collection {
            embedded,
            member_urls,
            rejected,
        } = page
        else {
            panic!("expected a collection page");
        };
        assert_eq!(embedded.len(), 1);
        assert_eq!(embedded[0].native_id.as_deref(), Some("700100200500"));
        assert!(member_urls.is_empty());
        let names: Vec<_> = rejected.iter().map(|r| r.item.as_str()).collect();
        assert_eq!(names, vec!["Alpha", "Beta"]);
        assert!(rejected.iter().all(|r| r.reason == "collection member has no url"));
    }

    #[test]
    fn page_with_nothing_recognisable_fails() {
        let err = parse_registration_page(
            "<html><body><p>Sold out</p></body></html>",
            "https://tickets.example.com/o/someone-1",
            &Tz::UTC,
        )
        .unwrap_err();
        assert_eq!(err.kind, FetchErrorKind::ParseFailure);
    }

    #[tokio::test]
    async fn failing_member_fetch_is_an_item_error() {
        let book_club = r#"<html><head><script type="application/ld+json">
            {"@type":"Event","name":"Async Book Club","startDate":"2026-05-20T18:00:00Z",
             "eventAttendanceMode":"https://schema.org/OnlineEventAttendanceMode"}
            </script></head></html>"#;
        let base = serve_pages(vec![
            (
                "/o/springfield-makers-5550001",
                fixture("registration-platform/organizer-collection.html"),
            ),
            (
                WORKSHOP_PATH,
                fixture("registration-platform/embedded-rust-workshop.html"),
            ),
            ("/e/async-book-club-tickets-700100200302", book_club.to_string()),
        ])
        .await;

        let http = HttpFetcher::new(HttpClientConfig {
            timeout: Duration::from_secs(5),
            ..HttpClientConfig::default()
        })
        .unwrap();
        let ctx = AdapterContext::new(Uuid::new_v4(), Tz::UTC);
        let outcome = RegistrationPlatformAdapter::with_member_concurrency(2)
            .fetch(&http, &ctx, &format!("{base}/o/springfield-makers-5550001"))
            .await
            .unwrap();

        let mut ids: Vec<_> = outcome
            .items
            .iter()
            .map(|i| i.native_id.clone().unwrap())
            .collect();
        ids.sort();
        assert_eq!(ids, vec!["700100200300", "700100200301", "700100200302"]);
        assert_eq!(outcome.rejected.len(), 1);
        assert!(outcome.rejected[0].item.contains("700100200399"));
        assert!(outcome.rejected[0].reason.contains("404"));
    }
}
