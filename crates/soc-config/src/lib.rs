#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **soc-config** – Environment-sourced configuration for the SOC Copilot
//! service.
//!
//! All knobs described in the service's operational surface are collected
//! once, at process startup, into a single [`Config`] value. No other crate
//! reads environment variables directly — the aggregator, store and query
//! layers all take a `Config` (or the fields they need from it) at
//! construction time instead.

use std::collections::HashSet;
use std::env;

use tracing::debug;

/// Default bucket width used by the clusterer, in seconds (15 minutes).
pub const DEFAULT_BUCKET_SECONDS: u64 = 900;

/// Default residency tag used when a region hint does not match SA/AE.
pub const DEFAULT_RESIDENCY_TAG: &str = "SA";

/// Default SQLite connection string (§6).
pub const DEFAULT_DATABASE_URL: &str = "sqlite:///./soc.db";

/// Collected, process-wide configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    /// SQLite connection string (`DATABASE_URL`).
    pub database_url: String,
    /// Allowed CORS origins (`CORS_ALLOW_ORIGINS`), empty means none allowed.
    pub cors_allow_origins: Vec<String>,
    /// Default residency tag (`DEFAULT_RESIDENCY_TAG`).
    pub default_residency_tag: String,
    /// Whether to persist the original, un-redacted message (`STORE_RAW`).
    pub store_raw: bool,
    /// Event types classified as benign (`BENIGN_TYPES`), lowercased.
    pub benign_types: HashSet<String>,
    /// Event types that are never benign regardless of `benign_types`
    /// (`CRITICAL_TYPES`), lowercased.
    pub critical_types: HashSet<String>,
    /// Cluster time-bucket width in seconds (`CLUSTER_BUCKET_SECONDS`).
    pub cluster_bucket_seconds: u64,
}

impl Config {
    /// Load configuration from process environment variables, applying the
    /// documented defaults for anything unset.
    pub fn from_env() -> Self {
        let loader = EnvLoader;

        let database_url =
            loader.get_string("DATABASE_URL", DEFAULT_DATABASE_URL);
        let cors_allow_origins = loader.get_csv_list("CORS_ALLOW_ORIGINS", "*");
        let default_residency_tag =
            loader.get_string("DEFAULT_RESIDENCY_TAG", DEFAULT_RESIDENCY_TAG);
        let store_raw = loader.get_bool("STORE_RAW", false);
        let benign_types = loader.get_csv_set("BENIGN_TYPES", "auth_success");
        let critical_types = loader.get_csv_set(
            "CRITICAL_TYPES",
            "auth_failure,mfa_bypass,api_key_use,privilege_escalation",
        );
        let cluster_bucket_seconds =
            loader.get_numeric("CLUSTER_BUCKET_SECONDS", DEFAULT_BUCKET_SECONDS);

        debug!(
            database_url = %database_url,
            store_raw,
            cluster_bucket_seconds,
            "loaded SOC Copilot configuration"
        );

        Self {
            database_url,
            cors_allow_origins,
            default_residency_tag,
            store_raw,
            benign_types,
            critical_types,
            cluster_bucket_seconds,
        }
    }

    /// Classify an event type as benign per §4.6: `t ∈ BENIGN_TYPES \ CRITICAL_TYPES`.
    pub fn is_benign(&self, event_type_lower: &str) -> bool {
        self.benign_types.contains(event_type_lower)
            && !self.critical_types.contains(event_type_lower)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::from_env()
    }
}

/// Thin wrapper over `std::env::var` with typed getters and documented
/// defaults. Kept separate from [`Config`] so construction can be unit
/// tested without needing a live process environment (see tests below,
/// which scope `env::set_var`/`remove_var` calls around each assertion).
struct EnvLoader;

impl EnvLoader {
    fn get_string(&self, key: &str, default: &str) -> String {
        env::var(key).unwrap_or_else(|_| default.to_string())
    }

    fn get_bool(&self, key: &str, default: bool) -> bool {
        match env::var(key) {
            Ok(v) => matches!(v.to_lowercase().as_str(), "true" | "1" | "yes" | "on"),
            Err(_) => default,
        }
    }

    fn get_numeric<T>(&self, key: &str, default: T) -> T
    where
        T: std::str::FromStr,
    {
        env::var(key)
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(default)
    }

    fn get_csv_list(&self, key: &str, default: &str) -> Vec<String> {
        env::var(key)
            .unwrap_or_else(|_| default.to_string())
            .split(',')
            .map(|s| s.to_string())
            .filter(|s| !s.is_empty())
            .collect()
    }

    fn get_csv_set(&self, key: &str, default: &str) -> HashSet<String> {
        env::var(key)
            .unwrap_or_else(|_| default.to_string())
            .split(',')
            .map(|s| s.trim().to_lowercase())
            .filter(|s| !s.is_empty())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_apply_when_unset() {
        env::remove_var("SOC_TEST_ABSENT_KEY");
        let loader = EnvLoader;
        assert_eq!(loader.get_string("SOC_TEST_ABSENT_KEY", "fallback"), "fallback");
        assert!(!loader.get_bool("SOC_TEST_ABSENT_KEY", false));
        assert_eq!(loader.get_numeric("SOC_TEST_ABSENT_KEY", 900u64), 900u64);
    }

    #[test]
    fn csv_set_lowercases_and_trims() {
        let loader = EnvLoader;
        env::set_var("SOC_TEST_CSV_SET", " Auth_Failure, MFA_Bypass ,,");
        let set = loader.get_csv_set("SOC_TEST_CSV_SET", "");
        assert!(set.contains("auth_failure"));
        assert!(set.contains("mfa_bypass"));
        assert_eq!(set.len(), 2);
        env::remove_var("SOC_TEST_CSV_SET");
    }

    #[test]
    fn cors_empty_string_yields_no_origins() {
        let loader = EnvLoader;
        env::set_var("SOC_TEST_CORS", "");
        let origins = loader.get_csv_list("SOC_TEST_CORS", "*");
        assert!(origins.is_empty());
        env::remove_var("SOC_TEST_CORS");
    }

    #[test]
    fn is_benign_excludes_critical_overlap() {
        let mut cfg = Config {
            database_url: DEFAULT_DATABASE_URL.to_string(),
            cors_allow_origins: vec!["*".to_string()],
            default_residency_tag: DEFAULT_RESIDENCY_TAG.to_string(),
            store_raw: false,
            benign_types: HashSet::from(["auth_success".to_string()]),
            critical_types: HashSet::from(["auth_failure".to_string()]),
            cluster_bucket_seconds: DEFAULT_BUCKET_SECONDS,
        };
        assert!(cfg.is_benign("auth_success"));
        assert!(!cfg.is_benign("auth_failure"));

        cfg.critical_types.insert("auth_success".to_string());
        assert!(!cfg.is_benign("auth_success"));
    }
}
