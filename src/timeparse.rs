#![forbid(unsafe_code)]

//! Timezone-aware parsing of free-form reset-time strings.
//!
//! Recognized shapes:
//!   - `"6:30 PM"` / `"6pm"`            (12-hour, time only)
//!   - `"14:30"`                        (24-hour)
//!   - `"Oct 7, 1am"`                   (explicit month + day)
//!   - `"3pm (America/Santiago)"`       (explicit IANA timezone)
//!
//! Resolution order: an explicit timezone wins over the host's local zone; an
//! explicit date is used with the current year; a candidate in the past is an
//! error when the string carried a date (the message is stale, the caller
//! falls back to backoff) and rolls forward 24 hours when it was time-only.

use std::sync::LazyLock;

use anyhow::Context as _;
use chrono::{DateTime, Datelike as _, Local, TimeZone, Utc};
use chrono_tz::Tz;
use regex::Regex;
use time::OffsetDateTime;

static RE_TIMEZONE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\(([A-Za-z_]+/[A-Za-z_]+)\)").expect("timezone regex"));

static RE_DATE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)\b(jan(?:uary)?|feb(?:ruary)?|mar(?:ch)?|apr(?:il)?|may|jun(?:e)?|jul(?:y)?|aug(?:ust)?|sep(?:tember)?|oct(?:ober)?|nov(?:ember)?|dec(?:ember)?)\s+(\d{1,2})\b",
    )
    .expect("date regex")
});

static RE_TIME_12H: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)(\d{1,2})(?::(\d{2}))?\s*(am|pm)").expect("12h regex"));

static RE_TIME_24H: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(\d{1,2}):(\d{2})").expect("24h regex"));

/// Parses a reset-time string against the current wall clock, returning the
/// resolved instant in UTC.
pub fn parse_reset_time(s: &str) -> anyhow::Result<OffsetDateTime> {
    let resolved = parse_at(s, Utc::now())?;
    OffsetDateTime::from_unix_timestamp(resolved.timestamp())
        .context("reset time out of representable range")
}

pub(crate) fn parse_at(s: &str, now: DateTime<Utc>) -> anyhow::Result<DateTime<Utc>> {
    let s = s.trim();
    if s.is_empty() {
        anyhow::bail!("empty reset time string");
    }

    let (tz, rest) = extract_timezone(s);
    match tz {
        Some(tz) => resolve_in_zone(&tz, now.with_timezone(&tz), &rest),
        None => resolve_in_zone(&Local, now.with_timezone(&Local), &rest),
    }
}

fn resolve_in_zone<Z>(zone: &Z, now: DateTime<Z>, s: &str) -> anyhow::Result<DateTime<Utc>>
where
    Z: TimeZone,
    Z::Offset: std::fmt::Display,
{
    let date = extract_date(s);
    let (hour, minute) =
        extract_time(s).with_context(|| format!("parse reset time {s:?}"))?;

    let (month, day) = date.unwrap_or((now.month(), now.day()));
    let mut candidate = zone
        .with_ymd_and_hms(now.year(), month, day, hour, minute, 0)
        .earliest()
        .with_context(|| format!("unrepresentable local time in {s:?}"))?;

    if candidate < now {
        if date.is_some() {
            anyhow::bail!("reset time {} is in the past", candidate.to_rfc3339());
        }
        candidate += chrono::Duration::hours(24);
    }

    Ok(candidate.with_timezone(&Utc))
}

/// Splits off a `(Area/City)` timezone, returning the loaded zone and the
/// string with the parenthesized portion removed. Unknown zone names are
/// treated as absent.
fn extract_timezone(s: &str) -> (Option<Tz>, String) {
    let Some(caps) = RE_TIMEZONE.captures(s) else {
        return (None, s.to_owned());
    };
    let Ok(tz) = caps[1].parse::<Tz>() else {
        return (None, s.to_owned());
    };
    let cleaned = s.replacen(&caps[0], "", 1);
    (Some(tz), cleaned.trim().to_owned())
}

fn extract_date(s: &str) -> Option<(u32, u32)> {
    let caps = RE_DATE.captures(s)?;
    let month = match caps[1].to_lowercase().as_bytes().get(..3)? {
        b"jan" => 1,
        b"feb" => 2,
        b"mar" => 3,
        b"apr" => 4,
        b"may" => 5,
        b"jun" => 6,
        b"jul" => 7,
        b"aug" => 8,
        b"sep" => 9,
        b"oct" => 10,
        b"nov" => 11,
        b"dec" => 12,
        _ => return None,
    };
    let day: u32 = caps[2].parse().ok()?;
    if !(1..=31).contains(&day) {
        return None;
    }
    Some((month, day))
}

fn extract_time(s: &str) -> anyhow::Result<(u32, u32)> {
    // 12-hour first: am/pm makes it the more specific match.
    if let Some(caps) = RE_TIME_12H.captures(s) {
        let hour: u32 = caps[1].parse().unwrap_or(0);
        let minute: u32 = caps.get(2).map_or(0, |m| m.as_str().parse().unwrap_or(0));
        if !(1..=12).contains(&hour) {
            anyhow::bail!("invalid 12hr hour: {hour}");
        }
        let pm = caps[3].eq_ignore_ascii_case("pm");
        let hour = match (hour, pm) {
            (12, false) => 0,
            (12, true) => 12,
            (h, false) => h,
            (h, true) => h + 12,
        };
        return Ok((hour, minute));
    }

    if let Some(caps) = RE_TIME_24H.captures(s) {
        let hour: u32 = caps[1].parse().unwrap_or(99);
        let minute: u32 = caps[2].parse().unwrap_or(99);
        if hour > 23 || minute > 59 {
            anyhow::bail!("invalid 24hr time: {hour:02}:{minute:02}");
        }
        return Ok((hour, minute));
    }

    anyhow::bail!("no recognizable time pattern in {s:?}")
}
