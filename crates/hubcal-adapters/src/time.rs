use chrono::{DateTime, Duration, NaiveDate, NaiveDateTime, TimeZone, Utc};
use chrono_tz::Tz;
use hubcal_core::StartInstant;

/// Resolves a wall-clock time in `zone` to an absolute instant.
///
/// Ambiguous times (DST fall-back) take the earlier offset. Times that do not
/// exist (DST spring-forward gap) are moved one hour later.
pub fn resolve_local(naive: NaiveDateTime, zone: &Tz) -> Option<DateTime<Utc>> {
    zone.from_local_datetime(&naive)
        .earliest()
        .or_else(|| zone.from_local_datetime(&(naive + Duration::hours(1))).earliest())
        .map(|dt| dt.with_timezone(&Utc))
}

pub(crate) fn instant_in_hub(at: DateTime<Utc>, hub: &Tz) -> StartInstant {
    let local = at.with_timezone(hub).naive_local();
    StartInstant::at(local.date(), local.time())
}

pub(crate) fn wall_clock_in_hub(naive: NaiveDateTime, zone: &Tz, hub: &Tz) -> StartInstant {
    if zone == hub {
        return StartInstant::at(naive.date(), naive.time());
    }
    match resolve_local(naive, zone) {
        Some(at) => instant_in_hub(at, hub),
        None => StartInstant::at(naive.date(), naive.time()),
    }
}

const NAIVE_FORMATS: [&str; 3] = ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%dT%H:%M", "%Y-%m-%d %H:%M:%S"];

/// Offset forms RFC 3339 rejects: minute precision, or `+hhmm` offsets.
const OFFSET_FORMATS: [&str; 3] = ["%Y-%m-%dT%H:%M%:z", "%Y-%m-%dT%H:%M:%S%.f%z", "%Y-%m-%dT%H:%M%z"];

/// Parses the date/time strings found in web payloads (ISO 8601 with or
/// without offset, or a bare date) into the hub timezone.
///
/// Strings without an offset are read as hub-local wall-clock time.
pub fn parse_datetime_text(raw: &str, hub: &Tz) -> Option<StartInstant> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    if let Ok(at) = DateTime::parse_from_rfc3339(raw) {
        return Some(instant_in_hub(at.with_timezone(&Utc), hub));
    }
    for format in OFFSET_FORMATS {
        if let Ok(at) = DateTime::parse_from_str(raw, format) {
            return Some(instant_in_hub(at.with_timezone(&Utc), hub));
        }
    }
    if let Some(utc) = raw.strip_suffix(['Z', 'z']) {
        for format in NAIVE_FORMATS {
            if let Ok(naive) = NaiveDateTime::parse_from_str(utc, format) {
                return Some(instant_in_hub(Utc.from_utc_datetime(&naive), hub));
            }
        }
    }
    for format in NAIVE_FORMATS {
        if let Ok(naive) = NaiveDateTime::parse_from_str(raw, format) {
            return Some(StartInstant::at(naive.date(), naive.time()));
        }
    }
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .ok()
        .map(StartInstant::all_day)
}
