#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **soc-query** – Read-only projections over committed state (§4.7) plus
//! the approvals/suggester analyst surface (§4.8).
//!
//! Every function here takes a `&soc_store::Store` and reads directly from
//! the pool — no transaction is opened, since queries only ever observe
//! state a prior ingest has already committed.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;

use soc_store::{Store, StoreError};
use soc_types::{ApprovalRow, IncidentStatus};

/// Default `limit` for `/events/recent` when the caller omits it.
pub const DEFAULT_RECENT_LIMIT: i64 = 50;
/// Maximum allowed `limit` for `/events/recent`, clamped per §4.7.
pub const MAX_RECENT_LIMIT: i64 = 500;
/// Maximum number of events sampled for the incident evidence view.
const EVIDENCE_SAMPLE_SIZE: i64 = 50;

/// Errors surfaced by the query layer. Maps directly to HTTP status in the
/// service binary: [`QueryError::NotFound`] to 404, [`QueryError::Store`]
/// to 5xx.
#[derive(Debug, Error)]
pub enum QueryError {
    /// The requested incident, event or cluster has no matching row.
    #[error("not found: {0}")]
    NotFound(String),
    /// Underlying storage failure.
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Result type alias for this crate.
pub type Result<T> = std::result::Result<T, QueryError>;

/// Clamp a caller-supplied `limit` query parameter to `[1, 500]`, defaulting
/// to 50 when absent.
pub fn clamp_limit(limit: Option<i64>) -> i64 {
    limit
        .unwrap_or(DEFAULT_RECENT_LIMIT)
        .clamp(1, MAX_RECENT_LIMIT)
}

//─────────────────────────────
//  Response projections
//─────────────────────────────

/// Projection for `GET /incidents`.
#[derive(Debug, Clone, Serialize)]
pub struct IncidentSummary {
    /// Incident id.
    pub id: i64,
    /// Short human label.
    pub title: String,
    /// Current rollup summary text.
    pub summary: String,
    /// Attached event count.
    pub count: i64,
    /// Current lifecycle status.
    pub status: IncidentStatus,
}

/// Projection for `GET /incidents/{id}`.
#[derive(Debug, Clone, Serialize)]
pub struct IncidentDetail {
    /// Incident id.
    pub id: i64,
    /// Unique cluster key.
    pub cluster_key: String,
    /// Short human label.
    pub title: String,
    /// Current rollup summary text.
    pub summary: String,
    /// Attached event count.
    pub count: i64,
    /// Current lifecycle status.
    pub status: IncidentStatus,
    /// Timestamp of the most recently attached event.
    pub last_seen: DateTime<Utc>,
    /// Redacted text of the most recently attached event, if any.
    pub sample_redacted: Option<String>,
}

/// One event row as surfaced in the incident evidence view.
#[derive(Debug, Clone, Serialize)]
pub struct EvidenceEvent {
    /// Event id.
    pub id: i64,
    /// Event type, lowercased.
    pub event_type: String,
    /// Redacted message text.
    pub redacted: String,
    /// Two-character residency tag.
    pub residency_tag: String,
    /// Insertion timestamp.
    pub created_at: DateTime<Utc>,
}

/// Response for `GET /incidents/{id}/evidence`.
#[derive(Debug, Clone, Serialize)]
pub struct EvidenceResponse {
    /// Incident id.
    pub incident_id: i64,
    /// Current lifecycle status.
    pub status: IncidentStatus,
    /// Up to 50 most recent events, newest first.
    pub events: Vec<EvidenceEvent>,
    /// The cluster explanation computed from the latest event's normalized
    /// text. Named `why_clustered` on the wire per §4.7/§8's literal field
    /// name.
    #[serde(rename = "why_clustered")]
    pub cluster_explanation: soc_cluster::ClusterExplanation,
    /// Per-kind sentinel counts aggregated by re-scanning each sampled
    /// event's `redacted` text (verifies sentinels, not original PII).
    pub redaction_counts: HashMap<String, usize>,
    /// All approvals recorded against this incident.
    pub approvals: Vec<ApprovalRow>,
}

/// Response for `GET /incidents/by-event/{event_id}`.
#[derive(Debug, Clone, Serialize)]
pub struct ByEventResponse {
    /// Owning incident id.
    pub incident_id: i64,
    /// Owning incident's cluster key.
    pub cluster_key: String,
    /// Owning incident's current status.
    pub status: IncidentStatus,
}

/// Response for `GET /incidents/by-cluster/{ck}`.
#[derive(Debug, Clone, Serialize)]
pub struct ByClusterResponse {
    /// Incident id.
    pub incident_id: i64,
    /// Cluster key (echoed back).
    pub cluster_key: String,
    /// Current status.
    pub status: IncidentStatus,
    /// Attached event count.
    pub count: i64,
}

/// Response for `GET /evidence/{event_id}`.
#[derive(Debug, Clone, Serialize)]
pub struct EventEvidenceResponse {
    /// Event id.
    pub event_id: i64,
    /// Two-character residency tag.
    pub residency_tag: String,
    /// Redacted message text.
    pub redacted: String,
    /// Owning incident id.
    pub incident_id: i64,
    /// Cluster key.
    pub cluster_key: String,
}

/// Response for `GET /events/recent`.
#[derive(Debug, Clone, Serialize)]
pub struct RecentEventSummary {
    /// Event id.
    pub id: i64,
    /// Owning incident id.
    pub incident_id: i64,
    /// Event type, lowercased.
    pub event_type: String,
    /// Owning incident's current status, joined in.
    pub incident_status: IncidentStatus,
    /// Redacted message text.
    pub redacted: String,
}

/// Response for `GET /metrics`.
#[derive(Debug, Clone, Serialize)]
pub struct MetricsResponse {
    /// Total event rows.
    pub events: i64,
    /// Total incident rows.
    pub incidents: i64,
    /// Incidents with status other than `noise`.
    pub incidents_active: i64,
    /// Σ max(0, count_per_cluster − 1).
    pub suppressed_events: i64,
    /// `1 - incidents / events`.
    pub suppression_rate: f64,
    /// `1 - incidents_active / events`.
    pub suppression_rate_active: f64,
    /// `suppressed_events / events`.
    pub dup_rate: f64,
}

/// Response for `POST /incidents/{id}/suggest_actions`.
#[derive(Debug, Clone, Serialize)]
pub struct SuggestResponse {
    /// Incident id.
    pub incident_id: i64,
    /// Suggested remediation actions.
    pub actions: Vec<String>,
}

/// Response for `POST /incidents/{id}/approve_action`.
#[derive(Debug, Clone, Serialize)]
pub struct ApproveResponse {
    /// Always `true`; failures are surfaced as errors instead.
    pub ok: bool,
    /// Id of the newly inserted approval row.
    pub approval_id: i64,
}

//─────────────────────────────
//  Queries
//─────────────────────────────

/// List all incidents ordered by `last_seen` descending.
pub async fn list_incidents(store: &Store) -> Result<Vec<IncidentSummary>> {
    let rows = store.list_incidents().await?;
    Ok(rows
        .into_iter()
        .map(|r| IncidentSummary {
            id: r.id,
            title: r.title,
            summary: r.summary,
            count: r.count,
            status: r.status,
        })
        .collect())
}

/// Fetch an incident plus its most recent event's redacted text.
pub async fn incident_detail(store: &Store, incident_id: i64) -> Result<IncidentDetail> {
    let incident = store
        .get_incident(incident_id)
        .await?
        .ok_or_else(|| QueryError::NotFound(format!("incident {incident_id}")))?;

    let sample_redacted = store
        .events_for_incident(incident_id, 1)
        .await?
        .into_iter()
        .next()
        .map(|e| e.redacted);

    Ok(IncidentDetail {
        id: incident.id,
        cluster_key: incident.cluster_key,
        title: incident.title,
        summary: incident.summary,
        count: incident.count,
        status: incident.status,
        last_seen: incident.last_seen,
        sample_redacted,
    })
}

/// Fetch the full evidence bundle for an incident (§4.7).
///
/// `bucket_seconds` should be the same cluster time-bucket width the
/// aggregator used to ingest these events, so the recomputed window lines
/// up with the one that actually produced the cluster key.
pub async fn incident_evidence(
    store: &Store,
    incident_id: i64,
    bucket_seconds: u64,
) -> Result<EvidenceResponse> {
    let incident = store
        .get_incident(incident_id)
        .await?
        .ok_or_else(|| QueryError::NotFound(format!("incident {incident_id}")))?;

    let events = store
        .events_for_incident(incident_id, EVIDENCE_SAMPLE_SIZE)
        .await?;

    let mut redaction_counts: HashMap<String, usize> = HashMap::new();
    for event in &events {
        let (_, counts) = soc_redact::redact_with_counts(&event.redacted);
        for (kind, n) in counts {
            *redaction_counts.entry(kind.label().to_string()).or_insert(0) += n;
        }
    }

    let cluster_explanation = match events.first() {
        Some(latest) => soc_cluster::explain(
            &placeholder_event_for_explanation(latest),
            &latest.normalized,
            bucket_seconds,
            latest.created_at,
        ),
        None => soc_cluster::explain(
            &placeholder_event_for_explanation_empty(),
            "",
            bucket_seconds,
            incident.last_seen,
        ),
    };

    let approvals = store.approvals_for_incident(incident_id).await?;

    Ok(EvidenceResponse {
        incident_id: incident.id,
        status: incident.status,
        events: events
            .into_iter()
            .map(|e| EvidenceEvent {
                id: e.id,
                event_type: e.event_type,
                redacted: e.redacted,
                residency_tag: e.residency_tag,
                created_at: e.created_at,
            })
            .collect(),
        cluster_explanation,
        redaction_counts,
        approvals,
    })
}

/// `soc_cluster::explain` takes a `LogEvent` so it can re-derive tokens from
/// the event's structured fields; evidence only has the persisted
/// normalized text, so this synthesizes a minimal event carrying just the
/// event type, leaving user/ip to be extracted from `normalized` as the
/// clusterer already does when those fields are absent.
fn placeholder_event_for_explanation(event: &soc_types::EventRow) -> soc_types::LogEvent {
    soc_types::LogEvent {
        source: event.source.clone(),
        event_type: event.event_type.clone(),
        message: event.normalized.clone(),
        user: None,
        ip: None,
        email: None,
        region: None,
        action: None,
        status: None,
        ts: None,
    }
}

fn placeholder_event_for_explanation_empty() -> soc_types::LogEvent {
    soc_types::LogEvent {
        source: "app".to_string(),
        event_type: String::new(),
        message: String::new(),
        user: None,
        ip: None,
        email: None,
        region: None,
        action: None,
        status: None,
        ts: None,
    }
}

/// Resolve which incident an event belongs to.
pub async fn by_event(store: &Store, event_id: i64) -> Result<ByEventResponse> {
    let event = store
        .get_event(event_id)
        .await?
        .ok_or_else(|| QueryError::NotFound(format!("event {event_id}")))?;
    let incident = store
        .get_incident(event.incident_id)
        .await?
        .ok_or_else(|| QueryError::NotFound(format!("incident {}", event.incident_id)))?;

    Ok(ByEventResponse {
        incident_id: incident.id,
        cluster_key: incident.cluster_key,
        status: incident.status,
    })
}

/// Resolve the incident for a cluster key.
pub async fn by_cluster(store: &Store, cluster_key: &str) -> Result<ByClusterResponse> {
    let incident = store
        .get_incident_by_cluster_key(cluster_key)
        .await?
        .ok_or_else(|| QueryError::NotFound(format!("cluster_key {cluster_key}")))?;

    Ok(ByClusterResponse {
        incident_id: incident.id,
        cluster_key: incident.cluster_key,
        status: incident.status,
        count: incident.count,
    })
}

/// Single-event evidence view.
pub async fn event_evidence(store: &Store, event_id: i64) -> Result<EventEvidenceResponse> {
    let event = store
        .get_event(event_id)
        .await?
        .ok_or_else(|| QueryError::NotFound(format!("event {event_id}")))?;

    Ok(EventEvidenceResponse {
        event_id: event.id,
        residency_tag: event.residency_tag,
        redacted: event.redacted,
        incident_id: event.incident_id,
        cluster_key: event.cluster_key,
    })
}

/// The most recent `limit` events, each joined with its incident's status.
pub async fn recent_events(store: &Store, limit: Option<i64>) -> Result<Vec<RecentEventSummary>> {
    let limit = clamp_limit(limit);
    let events = store.recent_events(limit).await?;

    let mut out = Vec::with_capacity(events.len());
    for event in events {
        let status = store
            .get_incident(event.incident_id)
            .await?
            .map(|i| i.status)
            .unwrap_or(IncidentStatus::Open);
        out.push(RecentEventSummary {
            id: event.id,
            incident_id: event.incident_id,
            event_type: event.event_type,
            incident_status: status,
            redacted: event.redacted,
        });
    }
    Ok(out)
}

/// Aggregate metrics derived from persisted state (§4.7).
pub async fn metrics(store: &Store) -> Result<MetricsResponse> {
    let counts = store.counts().await?;
    let events = counts.events;

    let (suppression_rate, suppression_rate_active, dup_rate) = if events == 0 {
        (0.0, 0.0, 0.0)
    } else {
        (
            1.0 - (counts.incidents as f64 / events as f64),
            1.0 - (counts.incidents_active as f64 / events as f64),
            counts.suppressed_events as f64 / events as f64,
        )
    };

    Ok(MetricsResponse {
        events,
        incidents: counts.incidents,
        incidents_active: counts.incidents_active,
        suppressed_events: counts.suppressed_events,
        suppression_rate,
        suppression_rate_active,
        dup_rate,
    })
}

/// Suggest remediation actions for an incident, keyed off its most recent
/// event's type (§4.8).
pub async fn suggest_actions(store: &Store, incident_id: i64) -> Result<SuggestResponse> {
    store
        .get_incident(incident_id)
        .await?
        .ok_or_else(|| QueryError::NotFound(format!("incident {incident_id}")))?;

    let event_type = store
        .events_for_incident(incident_id, 1)
        .await?
        .into_iter()
        .next()
        .map(|e| e.event_type)
        .unwrap_or_default();

    Ok(SuggestResponse {
        incident_id,
        actions: soc_playbook::suggest_actions(&event_type),
    })
}

/// Record an analyst's approval of a suggested action (§4.8). Append-only.
pub async fn record_approval(
    store: &Store,
    incident_id: i64,
    action_name: &str,
    notes: &str,
) -> Result<ApproveResponse> {
    store
        .get_incident(incident_id)
        .await?
        .ok_or_else(|| QueryError::NotFound(format!("incident {incident_id}")))?;

    let approval = store
        .insert_approval(incident_id, action_name, notes, Utc::now())
        .await?;

    Ok(ApproveResponse {
        ok: true,
        approval_id: approval.id,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use soc_aggregator::ingest_batch;
    use soc_config::Config;
    use soc_store::Store;
    use soc_types::LogEvent;
    use std::collections::HashSet;

    fn test_config() -> Config {
        Config {
            database_url: "sqlite::memory:".to_string(),
            cors_allow_origins: vec!["*".to_string()],
            default_residency_tag: "SA".to_string(),
            store_raw: false,
            benign_types: HashSet::from(["auth_success".to_string()]),
            critical_types: HashSet::from(["auth_failure".to_string()]),
            cluster_bucket_seconds: 900,
        }
    }

    fn event(event_type: &str, user: &str, ip: &str, message: &str) -> LogEvent {
        LogEvent {
            source: "app".to_string(),
            event_type: event_type.to_string(),
            message: message.to_string(),
            user: Some(user.to_string()),
            ip: Some(ip.to_string()),
            email: None,
            region: None,
            action: None,
            status: None,
            ts: None,
        }
    }

    #[tokio::test]
    async fn list_incidents_reflects_ingested_batch() {
        let store = Store::in_memory().await.unwrap();
        let config = test_config();
        ingest_batch(&store, &config, &[event("auth_failure", "bob", "1.2.3.4", "failed login")])
            .await
            .unwrap();

        let incidents = list_incidents(&store).await.unwrap();
        assert_eq!(incidents.len(), 1);
        assert_eq!(incidents[0].count, 1);
    }

    #[tokio::test]
    async fn incident_detail_missing_id_is_not_found() {
        let store = Store::in_memory().await.unwrap();
        let err = incident_detail(&store, 999).await.unwrap_err();
        assert!(matches!(err, QueryError::NotFound(_)));
    }

    #[tokio::test]
    async fn evidence_aggregates_redaction_counts_from_sentinels() {
        let store = Store::in_memory().await.unwrap();
        let config = test_config();
        ingest_batch(
            &store,
            &config,
            &[event("auth_failure", "bob", "9.9.9.9", "contact a@b.com now")],
        )
        .await
        .unwrap();

        let incidents = list_incidents(&store).await.unwrap();
        let evidence = incident_evidence(&store, incidents[0].id, 900).await.unwrap();
        assert_eq!(*evidence.redaction_counts.get("EMAIL").unwrap_or(&0), 1);
    }

    /// §8 scenario 6: `why_clustered.tokens` carries all four features and
    /// `why_clustered.window` carries the bucket metadata.
    #[tokio::test]
    async fn evidence_cluster_explanation_exposes_tokens_and_window() {
        let store = Store::in_memory().await.unwrap();
        let config = test_config();
        ingest_batch(
            &store,
            &config,
            &[event(
                "auth_failure",
                "bob",
                "1.2.3.4",
                "failed login for user bob from 1.2.3.4",
            )],
        )
        .await
        .unwrap();

        let incidents = list_incidents(&store).await.unwrap();
        let evidence = incident_evidence(&store, incidents[0].id, 900).await.unwrap();

        // The evidence explanation re-derives tokens from the stored
        // `normalized` text only (user/ip struct fields are not persisted
        // separately), so the message must carry them as literal tokens.
        let tokens = &evidence.cluster_explanation.tokens;
        assert_eq!(tokens.event_type, "auth_failure");
        assert_eq!(tokens.user, "bob");
        assert_eq!(tokens.ip, "1.2.3.4");
        assert!(!tokens.time_bucket.is_empty());

        let window = &evidence.cluster_explanation.window;
        assert_eq!(window.bucket_seconds, 900);
        assert!(!window.window_start_iso.is_empty());
        assert!(!window.window_end_iso.is_empty());
    }

    #[tokio::test]
    async fn metrics_are_zero_on_empty_store() {
        let store = Store::in_memory().await.unwrap();
        let m = metrics(&store).await.unwrap();
        assert_eq!(m.events, 0);
        assert_eq!(m.suppression_rate, 0.0);
        assert_eq!(m.dup_rate, 0.0);
    }

    /// §8 scenario 5, literal: 10 events collapsing into 3 incidents with
    /// counts 6/3/1 yields `suppressed_events=7`, `suppression_rate=0.7`,
    /// `dup_rate=0.7`.
    #[tokio::test]
    async fn metrics_match_the_literal_suppression_scenario() {
        let store = Store::in_memory().await.unwrap();
        let config = test_config();
        let mut events = Vec::new();
        for _ in 0..6 {
            events.push(event("auth_failure", "a", "1.1.1.1", "failed login a"));
        }
        for _ in 0..3 {
            events.push(event("auth_failure", "b", "2.2.2.2", "failed login b"));
        }
        events.push(event("auth_failure", "c", "3.3.3.3", "failed login c"));

        ingest_batch(&store, &config, &events).await.unwrap();

        let m = metrics(&store).await.unwrap();
        assert_eq!(m.events, 10);
        assert_eq!(m.incidents, 3);
        assert_eq!(m.suppressed_events, 7);
        assert!((m.suppression_rate - 0.7).abs() < 1e-9);
        assert!((m.dup_rate - 0.7).abs() < 1e-9);
    }

    #[tokio::test]
    async fn recent_events_limit_is_clamped() {
        assert_eq!(clamp_limit(None), DEFAULT_RECENT_LIMIT);
        assert_eq!(clamp_limit(Some(0)), 1);
        assert_eq!(clamp_limit(Some(10_000)), MAX_RECENT_LIMIT);
    }

    #[tokio::test]
    async fn suggest_actions_picks_playbook_from_latest_event_type() {
        let store = Store::in_memory().await.unwrap();
        let config = test_config();
        ingest_batch(&store, &config, &[event("port_scan", "bob", "1.2.3.4", "scan detected")])
            .await
            .unwrap();

        let incidents = list_incidents(&store).await.unwrap();
        let suggestion = suggest_actions(&store, incidents[0].id).await.unwrap();
        assert_eq!(suggestion.actions, soc_playbook::PORT_SCAN_PLAYBOOK.to_vec());
    }

    #[tokio::test]
    async fn approve_action_requires_existing_incident() {
        let store = Store::in_memory().await.unwrap();
        let err = record_approval(&store, 999, "lock_account", "").await.unwrap_err();
        assert!(matches!(err, QueryError::NotFound(_)));
    }

    #[tokio::test]
    async fn approve_action_records_row() {
        let store = Store::in_memory().await.unwrap();
        let config = test_config();
        ingest_batch(&store, &config, &[event("auth_failure", "bob", "1.2.3.4", "failed login")])
            .await
            .unwrap();

        let incidents = list_incidents(&store).await.unwrap();
        let resp = record_approval(&store, incidents[0].id, "lock_account", "confirmed")
            .await
            .unwrap();
        assert!(resp.ok);
        assert!(resp.approval_id > 0);
    }
}
