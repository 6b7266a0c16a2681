#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **soc-residency** – Map a region/country hint to a two-letter
//! jurisdiction tag, with a caller-supplied default.

use soc_types::LogEvent;

const SA_ALIASES: &[&str] = &["sa", "saudi", "saudi arabia", "ksa"];
const AE_ALIASES: &[&str] = &[
    "ae",
    "uae",
    "united arab emirates",
    "dubai",
    "abudhabi",
    "abu dhabi",
];

/// Derive the two-letter residency tag for an event.
///
/// The region hint is matched case-insensitively and trimmed; anything
/// that does not match a known SA/AE alias falls back to `default_tag`.
pub fn residency_tag(event: &LogEvent, default_tag: &str) -> String {
    let region = event
        .region
        .as_deref()
        .unwrap_or("")
        .trim()
        .to_lowercase();

    if SA_ALIASES.contains(&region.as_str()) {
        "SA".to_string()
    } else if AE_ALIASES.contains(&region.as_str()) {
        "AE".to_string()
    } else {
        default_tag.to_string()
    }
}
