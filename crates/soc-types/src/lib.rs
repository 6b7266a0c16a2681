#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **soc-types** – Shared primitive data structures for the SOC Copilot
//! ingestion and triage pipeline.
//!
//! The crate is dependency-light and sits at the bottom of the crate graph
//! so every other crate can depend on it without causing cycles. It makes
//! no assumptions about I/O, persistence, or HTTP.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

//─────────────────────────────
//  Ingest request schema
//─────────────────────────────

fn default_source() -> String {
    "app".to_string()
}

fn default_event_type() -> String {
    "auth_failure".to_string()
}

/// A single raw log event as submitted to `/ingest/logs`.
///
/// Unknown fields in the request body are ignored (the default serde
/// behaviour), matching the source's pydantic model which simply drops
/// fields it does not declare.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEvent {
    /// Emitter/source label.
    #[serde(default = "default_source")]
    pub source: String,
    /// Type of event (e.g. `auth_failure`, `auth_success`).
    #[serde(default = "default_event_type")]
    pub event_type: String,
    /// Message payload. The only required field.
    pub message: String,
    /// Username associated with the event, if known.
    #[serde(default)]
    pub user: Option<String>,
    /// Source IP address, if known.
    #[serde(default)]
    pub ip: Option<String>,
    /// Email address associated with the event, if known.
    #[serde(default)]
    pub email: Option<String>,
    /// Region/country hint used by the residency tagger.
    #[serde(default)]
    pub region: Option<String>,
    /// Action taken, free text.
    #[serde(default)]
    pub action: Option<String>,
    /// Status string, free text.
    #[serde(default)]
    pub status: Option<String>,
    /// Optional ISO-8601 timestamp used for clustering; falls back to
    /// ingest wall-clock time when absent or unparseable.
    #[serde(default)]
    pub ts: Option<String>,
}

/// Request body for `POST /ingest/logs`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestRequest {
    /// The batch of events to ingest, processed in order.
    pub events: Vec<LogEvent>,
}

fn default_notes() -> String {
    String::new()
}

/// Request body for `POST /incidents/{id}/approve_action`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApproveRequest {
    /// Name of the approved action.
    pub action_name: String,
    /// Free-text notes from the approving analyst.
    #[serde(default = "default_notes")]
    pub notes: String,
}

//─────────────────────────────
//  Incident status
//─────────────────────────────

/// Lifecycle status of an [`IncidentRow`].
///
/// ```text
///     (first benign event)            promotion predicate
///  ∅ ──────────────▶ noise ──────────────────────────▶ open
///  ∅ ──────────────▶ open    (first non-benign event)
///          open is terminal from the core's perspective (no auto-close)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IncidentStatus {
    /// Actively tracked, requires analyst attention.
    Open,
    /// Created from a benign event; excluded from the active-incident metric.
    Noise,
    /// Closed by an analyst. The core never sets this state itself.
    Closed,
}

impl IncidentStatus {
    /// The string stored in the `incidents.status` column.
    pub fn as_str(&self) -> &'static str {
        match self {
            IncidentStatus::Open => "open",
            IncidentStatus::Noise => "noise",
            IncidentStatus::Closed => "closed",
        }
    }

    /// Parse a status string as persisted in the database.
    ///
    /// Unknown values fall back to `open` rather than failing, since the
    /// status column has no foreign-key-like enforcement in SQLite.
    pub fn from_str_lenient(s: &str) -> Self {
        match s {
            "noise" => IncidentStatus::Noise,
            "closed" => IncidentStatus::Closed,
            _ => IncidentStatus::Open,
        }
    }
}

impl fmt::Display for IncidentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

//─────────────────────────────
//  Persisted rows
//─────────────────────────────

/// An `incidents` table row — the deduplication target.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IncidentRow {
    /// Monotonic integer id, assigned on insert.
    pub id: i64,
    /// 16-hex-char cluster key, unique across incidents at the application level.
    pub cluster_key: String,
    /// Short human label derived at creation time.
    pub title: String,
    /// Current rollup text, mutated on every event attach.
    pub summary: String,
    /// Non-negative, strictly monotonic event count.
    pub count: i64,
    /// Current lifecycle status.
    pub status: IncidentStatus,
    /// Timestamp of the most recently attached event.
    pub last_seen: DateTime<Utc>,
}

/// An `events` table row — the raw observation record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventRow {
    /// Monotonic integer id.
    pub id: i64,
    /// Emitter/source label, lowercased.
    pub source: String,
    /// Event type, lowercased.
    pub event_type: String,
    /// Original message text; empty when raw-storage is disabled.
    pub raw: String,
    /// Post-normalization string used for clustering and evidence.
    pub normalized: String,
    /// Post-redaction message; the text shown to humans.
    pub redacted: String,
    /// Two-character jurisdiction tag.
    pub residency_tag: String,
    /// Denormalized from the parent incident for index-only lookups.
    pub cluster_key: String,
    /// Id of the incident this event was attached to.
    pub incident_id: i64,
    /// Insertion timestamp.
    pub created_at: DateTime<Utc>,
}

/// An `approvals` table row — append-only analyst decision log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApprovalRow {
    /// Monotonic integer id.
    pub id: i64,
    /// Incident the decision was recorded against.
    pub incident_id: i64,
    /// Name of the approved action.
    pub action_name: String,
    /// Analyst identity; defaults to `"human@operator"`.
    pub approved_by: String,
    /// Timestamp the approval was recorded.
    pub approved_at: DateTime<Utc>,
    /// Free-text notes.
    pub notes: String,
}
