use async_trait::async_trait;
use chrono_tz::Tz;
use hubcal_core::{ItemError, RawItem, SourceKind, StartInstant};
use hubcal_storage::{FetchError, HttpFetcher};
use icalendar::parser::{read_calendar, unfold};
use icalendar::{CalendarDateTime, DatePerhapsTime};
use tracing::{debug, warn};

use crate::time::{instant_in_hub, wall_clock_in_hub};
use crate::{text_or_none, AdapterContext, FetchOutcome, SourceAdapter};

/// Any RFC 5545 calendar published over HTTP.
#[derive(Debug, Clone, Copy, Default)]
pub struct GenericFeedAdapter;

#[async_trait]
impl SourceAdapter for GenericFeedAdapter {
    fn kind(&self) -> SourceKind {
        SourceKind::GenericFeed
    }

    async fn fetch(
        &self,
        http: &HttpFetcher,
        ctx: &AdapterContext,
        url: &str,
    ) -> Result<FetchOutcome, FetchError> {
        let response = http.fetch(&ctx.source_id.to_string(), url).await?;
        parse_feed(&response.text(), &ctx.timezone)
    }
}

/// Parses an iCalendar document one `VEVENT` at a time, so a malformed
/// component costs only that component.
///
/// Fails only when the payload is not a calendar at all.
pub fn parse_feed(document: &str, hub: &Tz) -> Result<FetchOutcome, FetchError> {
    let unfolded = unfold(document);
    let is_calendar = unfolded
        .lines()
        .any(|line| line.trim().eq_ignore_ascii_case("BEGIN:VCALENDAR"));
    if !is_calendar {
        return Err(FetchError::parse_failure(
            "payload has no BEGIN:VCALENDAR; not an iCalendar feed",
        ));
    }

    let mut outcome = FetchOutcome::default();
    for (position, block) in vevent_blocks(&unfolded).iter().enumerate() {
        match parse_component(block, position, hub) {
            Ok(item) => outcome.items.push(item),
            Err(err) => {
                warn!(item = %err.item, reason = %err.reason, "skipping calendar component");
                outcome.rejected.push(err);
            }
        }
    }
    debug!(
        items = outcome.items.len(),
        rejected = outcome.rejected.len(),
        "parsed generic feed"
    );
    Ok(outcome)
}

fn vevent_blocks(unfolded: &str) -> Vec<String> {
    let mut blocks = Vec::new();
    let mut current: Option<Vec<&str>> = None;
    for line in unfolded.lines() {
        let trimmed = line.trim_end();
        if trimmed.eq_ignore_ascii_case("BEGIN:VEVENT") {
            if let Some(open) = current.take() {
                blocks.push(open.join("\r\n"));
            }
            current = Some(vec![trimmed]);
            continue;
        }
        if let Some(lines) = current.as_mut() {
            lines.push(trimmed);
            if trimmed.eq_ignore_ascii_case("END:VEVENT") {
                if let Some(done) = current.take() {
                    blocks.push(done.join("\r\n"));
                }
            }
        }
    }
    if let Some(open) = current {
        blocks.push(open.join("\r\n"));
    }
    blocks
}

fn parse_component(block: &str, position: usize, hub: &Tz) -> Result<RawItem, ItemError> {
    let fallback_label = format!("component #{}", position + 1);
    let wrapped = format!("BEGIN:VCALENDAR\r\n{block}\r\nEND:VCALENDAR\r\n");
    let calendar = read_calendar(&wrapped)
        .map_err(|err| ItemError::new(&fallback_label, format!("malformed component: {err}")))?;
    let vevent = calendar
        .components
        .iter()
        .find(|c| c.name == "VEVENT")
        .ok_or_else(|| ItemError::new(&fallback_label, "component has no VEVENT body"))?;

    let text_prop = |name: &str| {
        vevent
            .find_prop(name)
            .and_then(|p| text_or_none(&unescape_text(p.val.as_ref())))
    };

    let uid = text_prop("UID");
    let label = uid.clone().unwrap_or(fallback_label);

    let cancelled = vevent
        .find_prop("STATUS")
        .map(|p| p.val.as_ref().trim().eq_ignore_ascii_case("CANCELLED"))
        .unwrap_or(false);
    if cancelled {
        return Err(ItemError::new(label, "cancelled upstream"));
    }

    let native_id = match (uid, vevent.find_prop("RECURRENCE-ID")) {
        (Some(uid), Some(recurrence)) => Some(format!("{uid}#{}", recurrence.val.as_ref().trim())),
        (uid, _) => uid,
    };

    let start = match vevent.find_prop("DTSTART") {
        None => None,
        Some(prop) => {
            let parsed = DatePerhapsTime::try_from(prop).map_err(|_| {
                ItemError::new(&label, format!("unparseable DTSTART {:?}", prop.val.as_ref()))
            })?;
            Some(start_in_hub(parsed, hub))
        }
    };

    Ok(RawItem {
        native_id,
        title: text_prop("SUMMARY"),
        description: text_prop("DESCRIPTION"),
        start,
        location: text_prop("LOCATION"),
        capacity: None,
        registration_url: text_prop("URL"),
        attendance_hint: None,
    })
}

fn start_in_hub(value: DatePerhapsTime, hub: &Tz) -> StartInstant {
    match value {
        DatePerhapsTime::Date(date) => StartInstant::all_day(date),
        DatePerhapsTime::DateTime(CalendarDateTime::Utc(at)) => instant_in_hub(at, hub),
        DatePerhapsTime::DateTime(CalendarDateTime::Floating(naive)) => {
            StartInstant::at(naive.date(), naive.time())
        }
        DatePerhapsTime::DateTime(CalendarDateTime::WithTimezone { date_time, tzid }) => {
            match tzid.parse::<Tz>() {
                Ok(zone) => wall_clock_in_hub(date_time, &zone, hub),
                Err(_) => {
                    debug!(%tzid, "unknown TZID; reading start as hub-local time");
                    StartInstant::at(date_time.date(), date_time.time())
                }
            }
        }
    }
}

fn unescape_text(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut chars = raw.chars();
    while let Some(ch) = chars.next() {
        if ch != '\\' {
            out.push(ch);
            continue;
        }
        match chars.next() {
            Some('n') | Some('N') => out.push('\n'),
            Some(other) => out.push(other),
            None => out.push('\\'),
        }
    }
    out
}
