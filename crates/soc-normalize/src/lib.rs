#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **soc-normalize** – Collapse a configured field subset of an event into a
//! single lowercase normalized string, the clustering substrate.
//!
//! Normalization must run *after* redaction: callers pass in the
//! already-redacted message rather than the raw one.

use once_cell::sync::Lazy;
use regex::Regex;
use soc_types::LogEvent;

static WHITESPACE_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s+").unwrap());

/// Normalize an event for clustering and evidence.
///
/// `redacted_message` replaces `event.message` in the concatenation — the
/// aggregator is expected to have already run [`soc_redact::redact`] on it.
pub fn normalize(event: &LogEvent, redacted_message: &str) -> String {
    let parts: Vec<&str> = [
        redacted_message,
        event.action.as_deref().unwrap_or(""),
        event.status.as_deref().unwrap_or(""),
        event.event_type.as_str(),
    ]
    .into_iter()
    .filter(|s| !s.is_empty())
    .collect();

    let joined = if parts.is_empty() {
        format!("{event:?}")
    } else {
        parts.join(" ")
    };

    let lowered = joined.to_lowercase();
    let collapsed = WHITESPACE_RE.replace_all(&lowered, " ");
    collapsed.trim().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(message: &str, event_type: &str) -> LogEvent {
        LogEvent {
            source: "app".to_string(),
            event_type: event_type.to_string(),
            message: message.to_string(),
            user: None,
            ip: None,
            email: None,
            region: None,
            action: None,
            status: None,
            ts: None,
        }
    }

    #[test]
    fn lowercases_and_collapses_whitespace() {
        let evt = event("Failed   LOGIN for USER X", "Auth_Failure");
        let out = normalize(&evt, "Failed   LOGIN for USER X");
        assert_eq!(out, "failed login for user x auth_failure");
    }

    #[test]
    fn normalize_is_idempotent() {
        let evt = event("Hello World", "auth_failure");
        let once = normalize(&evt, "Hello World");
        let twice = normalize(&evt, &once);
        assert_eq!(once, twice);
    }

    #[test]
    fn falls_back_to_event_debug_when_all_fields_empty() {
        let mut evt = event("", "");
        evt.event_type = String::new();
        let out = normalize(&evt, "");
        assert!(out.contains("logevent") || out.len() > 0);
    }

    #[test]
    fn skips_empty_optional_fields() {
        let mut evt = event("login ok", "auth_success");
        evt.action = Some("".to_string());
        evt.status = Some("accepted".to_string());
        let out = normalize(&evt, "login ok");
        assert_eq!(out, "login ok accepted auth_success");
    }
}
