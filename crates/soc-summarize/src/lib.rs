#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **soc-summarize** – Produce a human-readable rollup string from the
//! redacted sample and current incident count.

const SNIPPET_LEN: usize = 120;

/// Produce the incident summary text shown to analysts.
///
/// Truncates `sample_redacted` to 120 characters, appending an ellipsis
/// only when truncation actually occurred.
pub fn summarize(sample_redacted: &str, count: i64) -> String {
    let char_count = sample_redacted.chars().count();
    let snippet = if char_count > SNIPPET_LEN {
        let truncated: String = sample_redacted.chars().take(SNIPPET_LEN).collect();
        format!("{truncated}…")
    } else {
        sample_redacted.to_string()
    };
    format!("Repeated event clustered ({count} hits). Example: {snippet}")
}
