#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **soc-cluster** – Derive a stable cluster key from
//! *(event_type, user, ip, time_bucket)* and produce an explanation object.
//!
//! This is a pure function of its inputs: no persistence, no state. Events
//! that are "the same activity" within the same time bucket yield the same
//! key; events separated by more than the bucket width yield different
//! keys.

use chrono::{DateTime, TimeZone, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;
use soc_types::LogEvent;

static USER_IN_TEXT_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)user\s+([^\s\]]+)").unwrap());
static IP_IN_TEXT_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\b(\d{1,3}(?:\.\d{1,3}){3})\b").unwrap());
static FROM_TOKEN_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)from\s+([^\s\]]+)").unwrap());

/// The four feature tokens used to derive a cluster key.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ClusterTokens {
    /// Lowercased event type.
    pub event_type: String,
    /// Lowercased username, from the `user` field or extracted from text.
    pub user: String,
    /// Lowercased source IP, from the `ip` field or extracted from text.
    pub ip: String,
    /// Bucket index as a string (stable across processes).
    pub time_bucket: String,
}

/// The time window a cluster key's bucket covers.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ClusterWindow {
    /// Bucket width in seconds.
    pub bucket_seconds: u64,
    /// Bucket index (epoch_seconds / bucket_seconds).
    pub bucket_index: i64,
    /// ISO-8601 start of the window, inclusive.
    pub window_start_iso: String,
    /// ISO-8601 end of the window, inclusive.
    pub window_end_iso: String,
}

/// A pure explanation of why an event landed in a given cluster.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ClusterExplanation {
    /// The extracted feature tokens.
    pub tokens: ClusterTokens,
    /// The time window the bucket covers.
    pub window: ClusterWindow,
}

fn extract_user(event: &LogEvent, normalized: &str) -> String {
    if let Some(user) = event.user.as_deref() {
        let trimmed = user.trim();
        if !trimmed.is_empty() {
            return trimmed.to_lowercase();
        }
    }
    USER_IN_TEXT_RE
        .captures(normalized)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().to_lowercase())
        .unwrap_or_default()
}

fn extract_ip(event: &LogEvent, normalized: &str) -> String {
    if let Some(ip) = event.ip.as_deref() {
        let trimmed = ip.trim();
        if !trimmed.is_empty() {
            return trimmed.to_lowercase();
        }
    }
    if let Some(m) = IP_IN_TEXT_RE.find(normalized) {
        return m.as_str().to_lowercase();
    }
    FROM_TOKEN_RE
        .captures(normalized)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().to_lowercase())
        .unwrap_or_default()
}

fn parse_timestamp(ts: Option<&str>) -> Option<DateTime<Utc>> {
    let ts = ts?;
    let normalized = if let Some(stripped) = ts.strip_suffix('Z') {
        format!("{stripped}+00:00")
    } else {
        ts.to_string()
    };
    DateTime::parse_from_rfc3339(&normalized)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

fn bucket_for(ts: Option<&str>, bucket_seconds: u64, now: DateTime<Utc>) -> (i64, DateTime<Utc>, DateTime<Utc>) {
    let dt = parse_timestamp(ts).unwrap_or(now);
    let epoch = dt.timestamp();
    let bucket_seconds = bucket_seconds.max(1) as i64;
    let index = epoch.div_euclid(bucket_seconds);
    let start_epoch = index * bucket_seconds;
    let end_epoch = start_epoch + bucket_seconds - 1;
    let start = Utc.timestamp_opt(start_epoch, 0).single().unwrap_or(now);
    let end = Utc.timestamp_opt(end_epoch, 0).single().unwrap_or(now);
    (index, start, end)
}

/// Derive the stable cluster key for an event.
///
/// `normalized` must be the event's post-redaction, post-normalization
/// text (see `soc-normalize`). `now` is the ingest wall-clock time, used
/// only when the event carries no parseable timestamp.
pub fn cluster_key(event: &LogEvent, normalized: &str, bucket_seconds: u64, now: DateTime<Utc>) -> String {
    let tokens = tokens_for(event, normalized, bucket_seconds, now);
    let material = format!(
        "{}|{}|{}|{}",
        tokens.event_type, tokens.user, tokens.ip, tokens.time_bucket
    );
    let digest = blake3::hash(material.as_bytes());
    let hex = digest.to_hex();
    hex[..16].to_string()
}

fn tokens_for(
    event: &LogEvent,
    normalized: &str,
    bucket_seconds: u64,
    now: DateTime<Utc>,
) -> ClusterTokens {
    let (index, _, _) = bucket_for(event.ts.as_deref(), bucket_seconds, now);
    ClusterTokens {
        event_type: event.event_type.trim().to_lowercase(),
        user: extract_user(event, normalized),
        ip: extract_ip(event, normalized),
        time_bucket: index.to_string(),
    }
}

/// Derive a short human label for a newly created incident.
pub fn incident_title(event: &LogEvent, normalized: &str) -> String {
    let et = event.event_type.trim().to_lowercase();
    let user = extract_user(event, normalized);
    format!(
        "{} cluster for {}",
        if et.is_empty() { "event" } else { &et },
        if user.is_empty() { "unknown" } else { &user }
    )
}

/// Produce the pure explanation object for an event's cluster assignment.
pub fn explain(
    event: &LogEvent,
    normalized: &str,
    bucket_seconds: u64,
    now: DateTime<Utc>,
) -> ClusterExplanation {
    let (index, start, end) = bucket_for(event.ts.as_deref(), bucket_seconds, now);
    let tokens = ClusterTokens {
        event_type: event.event_type.trim().to_lowercase(),
        user: extract_user(event, normalized),
        ip: extract_ip(event, normalized),
        time_bucket: index.to_string(),
    };
    ClusterExplanation {
        tokens,
        window: ClusterWindow {
            bucket_seconds,
            bucket_index: index,
            window_start_iso: start.to_rfc3339(),
            window_end_iso: end.to_rfc3339(),
        },
    }
}
