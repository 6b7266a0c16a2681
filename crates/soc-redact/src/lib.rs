#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **soc-redact** – Replace PII substrings with stable sentinels before any
//! persistence or clustering touches the text.
//!
//! Patterns are compiled once as process-wide constants and applied in a
//! fixed order: EMAIL, then IP, then PHONE, then CARD. The order matters —
//! IP addresses must be redacted before phone numbers so that a dotted-quad
//! like `192.168.1.22` is not partially swallowed by the phone matcher, and
//! CARD runs last so card-like digit runs are not masked by an earlier
//! pattern first.

use std::collections::HashMap;

use once_cell::sync::Lazy;
use regex::Regex;

/// The kind of PII a pattern detects, also the sentinel's `[REDACTED:KIND]` label.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RedactionKind {
    /// `local@domain.tld` email addresses.
    Email,
    /// Dotted-quad IPv4 addresses (syntactic match, no range validation).
    Ip,
    /// Phone numbers with optional country code and area code.
    Phone,
    /// 13-16 digit card numbers, optionally separated by spaces or dashes.
    Card,
}

impl RedactionKind {
    /// The sentinel label used in `[REDACTED:<label>]`.
    pub fn label(&self) -> &'static str {
        match self {
            RedactionKind::Email => "EMAIL",
            RedactionKind::Ip => "IP",
            RedactionKind::Phone => "PHONE",
            RedactionKind::Card => "CARD",
        }
    }
}

struct RedactionPattern {
    kind: RedactionKind,
    regex: &'static Lazy<Regex>,
}

static EMAIL_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\b[A-Za-z0-9._%+-]+@[A-Za-z0-9.-]+\.[A-Za-z]{2,}\b").unwrap()
});

static IPV4_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\b(?:\d{1,3}\.){3}\d{1,3}\b").unwrap());

static PHONE_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\b(?:\+?\d{1,2}[ -]?)?(?:\(\d{3}\)|\d{3})[ -]?\d{3}[ -]?\d{4}\b").unwrap()
});

static CARD_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\b(?:\d[ -]*?){13,16}\b").unwrap());

/// Patterns in the fixed application order required by the redaction
/// invariant: EMAIL, IP, PHONE, then CARD.
static PATTERNS: Lazy<Vec<RedactionPattern>> = Lazy::new(|| {
    vec![
        RedactionPattern {
            kind: RedactionKind::Email,
            regex: &EMAIL_RE,
        },
        RedactionPattern {
            kind: RedactionKind::Ip,
            regex: &IPV4_RE,
        },
        RedactionPattern {
            kind: RedactionKind::Phone,
            regex: &PHONE_RE,
        },
        RedactionPattern {
            kind: RedactionKind::Card,
            regex: &CARD_RE,
        },
    ]
});

/// Per-kind redaction counts, keyed by [`RedactionKind`].
pub type RedactionCounts = HashMap<RedactionKind, usize>;

/// Redact PII substrings from `text`, returning the redacted text and the
/// total number of redactions performed.
///
/// Never fails. Empty input maps to `("", 0)`.
pub fn redact(text: &str) -> (String, usize) {
    let (redacted, counts) = redact_with_counts(text);
    let total = counts.values().sum();
    (redacted, total)
}

/// Redact PII substrings from `text`, returning the redacted text and a
/// by-kind breakdown usable for evidence aggregation (§4.7).
pub fn redact_with_counts(text: &str) -> (String, RedactionCounts) {
    let mut counts = RedactionCounts::new();
    let mut out = text.to_string();

    if out.is_empty() {
        return (out, counts);
    }

    for pattern in PATTERNS.iter() {
        let kind = pattern.kind;
        let label = kind.label();
        let mut n = 0usize;
        let replaced = pattern
            .regex
            .replace_all(&out, |_: &regex::Captures| {
                n += 1;
                format!("[REDACTED:{label}]")
            })
            .into_owned();
        out = replaced;
        if n > 0 {
            *counts.entry(kind).or_insert(0) += n;
        }
    }

    (out, counts)
}
