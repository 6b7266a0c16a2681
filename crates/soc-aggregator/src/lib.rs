#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **soc-aggregator** – The transactional ingest core.
//!
//! For each event in a batch: redact → tag residency → normalize → derive
//! cluster key → get-or-create the owning incident → append the event row
//! → update the incident rollup → run the promotion heuristic. The whole
//! batch runs inside a single transaction, committed once at the end
//! (§4.6/§5). A cancelled request rolls the transaction back wholesale;
//! there is no partial commit.

use chrono::Utc;
use serde::Serialize;
use tracing::warn;

use soc_config::Config;
use soc_store::{Store, StoreError};
use soc_types::{IncidentStatus, LogEvent};

/// Response body for `POST /ingest/logs`.
#[derive(Debug, Clone, Serialize)]
pub struct IngestResponse {
    /// Number of events in this batch.
    pub ingested: usize,
    /// Total event rows across all time.
    pub events: i64,
    /// Total incident rows across all time.
    pub incidents: i64,
    /// `1 - incidents / events`, `0` when `events == 0`.
    pub suppression_rate: f64,
}

/// Number of most-recent events on a cluster examined by the promotion
/// heuristic, per §4.6 step 6.
const PROMOTION_LOOKBACK: i64 = 8;
/// Minimum failure count required to consider promotion.
const PROMOTION_MIN_FAILURES: i64 = 5;
/// How many of the most-recent entries are checked for a trailing success.
const PROMOTION_RECENT_WINDOW: usize = 2;

/// Ingest a batch of events, running the full pipeline inside one
/// transaction and committing once at the end.
pub async fn ingest_batch(
    store: &Store,
    config: &Config,
    events: &[LogEvent],
) -> Result<IngestResponse, StoreError> {
    let mut tx = store.begin().await?;
    let now = Utc::now();

    for event in events {
        process_one(&mut tx, config, event, now).await?;
    }

    tx.commit().await?;

    let counts = store.counts().await?;
    let suppression_rate = if counts.events == 0 {
        0.0
    } else {
        1.0 - (counts.incidents as f64 / counts.events as f64)
    };

    Ok(IngestResponse {
        ingested: events.len(),
        events: counts.events,
        incidents: counts.incidents,
        suppression_rate,
    })
}

async fn process_one(
    tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
    config: &Config,
    event: &LogEvent,
    now: chrono::DateTime<Utc>,
) -> Result<(), StoreError> {
    let (redacted, _) = soc_redact::redact(&event.message);
    let residency_tag = soc_residency::residency_tag(event, &config.default_residency_tag);
    let normalized = soc_normalize::normalize(event, &redacted);
    let cluster_key = soc_cluster::cluster_key(event, &normalized, config.cluster_bucket_seconds, now);

    let event_type_lower = event.event_type.trim().to_lowercase();
    let benign = config.is_benign(&event_type_lower);

    let initial_status = if benign {
        IncidentStatus::Noise
    } else {
        IncidentStatus::Open
    };
    let title = soc_cluster::incident_title(event, &normalized);

    let incident = soc_store::get_or_create_incident(tx, &cluster_key, &title, initial_status, now).await?;

    let raw = if config.store_raw { event.message.as_str() } else { "" };
    soc_store::insert_event(
        tx,
        soc_store::NewEvent {
            source: event.source.trim().to_lowercase().as_str(),
            event_type: event_type_lower.as_str(),
            raw,
            normalized: normalized.as_str(),
            redacted: redacted.as_str(),
            residency_tag: residency_tag.as_str(),
            cluster_key: cluster_key.as_str(),
            incident_id: incident.id,
            created_at: now,
        },
    )
    .await?;

    let new_count = incident.count + 1;
    let summary = soc_summarize::summarize(&redacted, new_count);
    let mut new_status = incident.status;
    let mut new_summary = summary;

    if incident.status == IncidentStatus::Noise {
        match run_promotion_heuristic(tx, &cluster_key, new_count).await {
            Ok(Some(promoted_summary)) => {
                new_status = IncidentStatus::Open;
                new_summary = promoted_summary;
            }
            Ok(None) => {}
            Err(e) => {
                // Promotion failures never abort ingest (§4.6, §7).
                warn!(error = %e, cluster_key = %cluster_key, "promotion heuristic failed; leaving incident unchanged");
            }
        }
    }

    soc_store::update_incident_rollup(tx, incident.id, new_count, &new_summary, new_status, now).await?;

    Ok(())
}

/// Run the noise→open promotion predicate for a cluster whose incident is
/// currently `noise`. Returns the new summary text on promotion, `None`
/// when the predicate does not hold.
async fn run_promotion_heuristic(
    tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
    cluster_key: &str,
    _current_count: i64,
) -> Result<Option<String>, StoreError> {
    let recent = soc_store::recent_events_for_cluster(tx, cluster_key, PROMOTION_LOOKBACK).await?;

    let failures = recent
        .iter()
        .filter(|e| e.event_type.eq_ignore_ascii_case("auth_failure"))
        .count() as i64;

    let has_recent_success = recent
        .iter()
        .take(PROMOTION_RECENT_WINDOW)
        .any(|e| e.event_type.eq_ignore_ascii_case("auth_success"));

    if failures >= PROMOTION_MIN_FAILURES && has_recent_success {
        Ok(Some(format!(
            "Promotion: {failures} failures then success (possible credential stuffing → takeover)"
        )))
    } else {
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use soc_config::Config;
    use std::collections::HashSet;

    fn test_config() -> Config {
        Config {
            database_url: "sqlite::memory:".to_string(),
            cors_allow_origins: vec!["*".to_string()],
            default_residency_tag: "SA".to_string(),
            store_raw: false,
            benign_types: HashSet::from(["auth_success".to_string()]),
            critical_types: HashSet::from([
                "auth_failure".to_string(),
                "mfa_bypass".to_string(),
                "api_key_use".to_string(),
                "privilege_escalation".to_string(),
            ]),
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
    async fn single_benign_event_creates_noise_incident() {
        let store = Store::in_memory().await.unwrap();
        let config = test_config();
        let events = vec![event("auth_success", "bob", "1.2.3.4", "login ok")];

        let resp = ingest_batch(&store, &config, &events).await.unwrap();
        assert_eq!(resp.ingested, 1);
        assert_eq!(resp.incidents, 1);

        let incidents = store.list_incidents().await.unwrap();
        assert_eq!(incidents[0].status, IncidentStatus::Noise);
    }

    #[tokio::test]
    async fn non_benign_event_creates_open_incident() {
        let store = Store::in_memory().await.unwrap();
        let config = test_config();
        let events = vec![event("auth_failure", "bob", "1.2.3.4", "failed login")];

        ingest_batch(&store, &config, &events).await.unwrap();
        let incidents = store.list_incidents().await.unwrap();
        assert_eq!(incidents[0].status, IncidentStatus::Open);
    }

    #[tokio::test]
    async fn repeated_events_on_same_cluster_collapse_into_one_incident() {
        let store = Store::in_memory().await.unwrap();
        let config = test_config();
        let events: Vec<_> = (0..5)
            .map(|_| event("auth_failure", "bob", "1.2.3.4", "failed login"))
            .collect();

        let resp = ingest_batch(&store, &config, &events).await.unwrap();
        assert_eq!(resp.incidents, 1);
        assert_eq!(resp.events, 5);

        let incidents = store.list_incidents().await.unwrap();
        assert_eq!(incidents[0].count, 5);
    }

    #[tokio::test]
    async fn raw_is_empty_when_store_raw_disabled() {
        let store = Store::in_memory().await.unwrap();
        let config = test_config();
        let events = vec![event("auth_failure", "bob", "1.2.3.4", "failed login")];

        ingest_batch(&store, &config, &events).await.unwrap();
        let recent = store.recent_events(1).await.unwrap();
        assert_eq!(recent[0].raw, "");
    }

    #[tokio::test]
    async fn pii_is_redacted_before_persistence() {
        let store = Store::in_memory().await.unwrap();
        let config = test_config();
        let events = vec![event(
            "auth_failure",
            "bob",
            "1.2.3.4",
            "User john.doe@example.com from 192.168.1.1 called +1 (416) 555-1212",
        )];

        ingest_batch(&store, &config, &events).await.unwrap();
        let recent = store.recent_events(1).await.unwrap();
        assert!(!recent[0].redacted.contains("example.com"));
        assert!(!recent[0].redacted.contains("192.168.1.1"));
    }

    #[tokio::test]
    async fn suppression_rate_reflects_collapsed_clusters() {
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

        let resp = ingest_batch(&store, &config, &events).await.unwrap();
        assert_eq!(resp.events, 10);
        assert_eq!(resp.incidents, 3);
        assert!((resp.suppression_rate - 0.7).abs() < 1e-9);
    }

    #[tokio::test]
    async fn empty_batch_yields_zero_suppression_rate() {
        let store = Store::in_memory().await.unwrap();
        let config = test_config();
        let resp = ingest_batch(&store, &config, &[]).await.unwrap();
        assert_eq!(resp.events, 0);
        assert_eq!(resp.suppression_rate, 0.0);
    }

    /// §4.6 step 6 in isolation: 5 failures plus a trailing success on the
    /// *same* cluster_key promotes noise → open. `run_promotion_heuristic`
    /// only ever sees one cluster_key's events, so this drives it directly
    /// rather than through `ingest_batch` (see the next test for why a real
    /// batch can't reach this path under the default config).
    #[tokio::test]
    async fn promotion_fires_on_five_failures_then_success_on_same_cluster() {
        let store = Store::in_memory().await.unwrap();
        let now = Utc::now();
        let mut tx = store.begin().await.unwrap();
        let incident =
            soc_store::get_or_create_incident(&mut tx, "ck-promo", "t", IncidentStatus::Noise, now)
                .await
                .unwrap();

        for _ in 0..5 {
            soc_store::insert_event(
                &mut tx,
                soc_store::NewEvent {
                    source: "app",
                    event_type: "auth_failure",
                    raw: "",
                    normalized: "x",
                    redacted: "x",
                    residency_tag: "SA",
                    cluster_key: "ck-promo",
                    incident_id: incident.id,
                    created_at: now,
                },
            )
            .await
            .unwrap();
        }
        soc_store::insert_event(
            &mut tx,
            soc_store::NewEvent {
                source: "app",
                event_type: "auth_success",
                raw: "",
                normalized: "x",
                redacted: "x",
                residency_tag: "SA",
                cluster_key: "ck-promo",
                incident_id: incident.id,
                created_at: now,
            },
        )
        .await
        .unwrap();

        let promoted = run_promotion_heuristic(&mut tx, "ck-promo", 6).await.unwrap();
        tx.commit().await.unwrap();

        let summary = promoted.expect("predicate should hold: 5 failures + trailing success");
        assert!(summary.starts_with("Promotion:"));
    }

    /// Confirms the literal (largely unreachable) behavior documented in
    /// §9 / DESIGN.md's Open Question 1: because `event_type` is part of
    /// the cluster key, an `auth_success` event lands on a different
    /// cluster_key than the preceding `auth_failure` events on the same
    /// user/ip/bucket, so a real ingest batch never promotes that success
    /// event's (separate, noise) incident.
    #[tokio::test]
    async fn real_batch_does_not_promote_because_success_has_a_different_cluster_key() {
        let store = Store::in_memory().await.unwrap();
        let config = test_config();
        let mut events: Vec<_> = (0..5)
            .map(|_| event("auth_failure", "bob", "1.2.3.4", "failed login"))
            .collect();
        events.push(event("auth_success", "bob", "1.2.3.4", "login ok"));

        ingest_batch(&store, &config, &events).await.unwrap();

        let incidents = store.list_incidents().await.unwrap();
        assert_eq!(incidents.len(), 2, "failure and success land in separate clusters");
        let success_incident = incidents
            .iter()
            .find(|i| i.count == 1)
            .expect("the auth_success event's own incident");
        assert_eq!(success_incident.status, IncidentStatus::Noise);
    }
}
