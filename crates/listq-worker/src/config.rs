use std::path::PathBuf;
use std::time::Duration;

use listq_core::StrategyKind;
use listq_storage::{StorageError, TableNames};
use tracing::warn;

use crate::retry::RetryPolicy;

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub database_url: String,
    pub strategy: StrategyKind,
    pub engine_url: String,
    pub extraction_timeout: Duration,
    pub poll_interval: Duration,
    pub stale_after: Duration,
    pub retry: RetryPolicy,
    pub auto_requeue_captcha: bool,
    pub sweep_cron: Option<String>,
    pub artifacts_dir: Option<PathBuf>,
    pub user_agents: String,
    pub proxies: String,
    pub jobs_table: String,
    pub results_table: String,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self::from_lookup(|_| None)
    }
}

impl WorkerConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let secs = |key: &str, default: u64| {
            Duration::from_secs(lookup(key).and_then(|v| v.trim().parse().ok()).unwrap_or(default))
        };
        let non_empty = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let strategy = match lookup("LISTQ_STRATEGY") {
            Some(raw) => raw.parse().unwrap_or_else(|err| {
                warn!(error = %err, "ignoring LISTQ_STRATEGY; using network capture");
                StrategyKind::Network
            }),
            None => StrategyKind::Network,
        };

        Self {
            database_url: non_empty("DATABASE_URL").unwrap_or_else(|| "sqlite:listq.db".to_string()),
            strategy,
            engine_url: non_empty("LISTQ_ENGINE_URL")
                .unwrap_or_else(|| "http://127.0.0.1:9222".to_string()),
            extraction_timeout: secs("LISTQ_EXTRACTION_TIMEOUT_SECS", 90),
            poll_interval: secs("LISTQ_POLL_INTERVAL_SECS", 5),
            stale_after: secs("LISTQ_STALE_AFTER_SECS", 600),
            retry: RetryPolicy {
                base_delay: secs("LISTQ_RETRY_BASE_SECS", 60),
                max_delay: secs("LISTQ_RETRY_MAX_SECS", 3600),
                max_attempts: lookup("LISTQ_MAX_ATTEMPTS")
                    .and_then(|v| v.trim().parse().ok())
                    .unwrap_or(5),
                captcha_cooldown: secs("LISTQ_CAPTCHA_COOLDOWN_SECS", 21_600),
            },
            auto_requeue_captcha: lookup("LISTQ_AUTO_REQUEUE_CAPTCHA")
                .map(|v| matches!(v.trim(), "1" | "true" | "TRUE" | "True"))
                .unwrap_or(true),
            sweep_cron: non_empty("LISTQ_SWEEP_CRON"),
            artifacts_dir: non_empty("LISTQ_ARTIFACTS_DIR").map(PathBuf::from),
            user_agents: lookup("LISTQ_USER_AGENTS").unwrap_or_default(),
            proxies: lookup("LISTQ_PROXIES").unwrap_or_default(),
            jobs_table: non_empty("LISTQ_JOBS_TABLE").unwrap_or_else(|| "jobs".to_string()),
            results_table: non_empty("LISTQ_RESULTS_TABLE")
                .unwrap_or_else(|| "listing_results".to_string()),
        }
    }

    pub fn table_names(&self) -> Result<TableNames, StorageError> {
        TableNames::new(&self.jobs_table, &self.results_table)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let config = WorkerConfig::default();
        assert_eq!(config.database_url, "sqlite:listq.db");
        assert_eq!(config.strategy, StrategyKind::Network);
        assert_eq!(config.extraction_timeout, Duration::from_secs(90));
        assert_eq!(config.stale_after, Duration::from_secs(600));
        assert_eq!(config.retry.max_attempts, 5);
        assert!(config.auto_requeue_captcha);
        assert!(config.sweep_cron.is_none());
        assert_eq!(config.table_names().unwrap(), TableNames::default());
    }

    #[test]
    fn overrides_are_read_and_bad_values_fall_back() {
        let vars: HashMap<&str, &str> = HashMap::from([
            ("LISTQ_STRATEGY", "markup"),
            ("LISTQ_EXTRACTION_TIMEOUT_SECS", "30"),
            ("LISTQ_MAX_ATTEMPTS", "not-a-number"),
            ("LISTQ_AUTO_REQUEUE_CAPTCHA", "false"),
            ("LISTQ_SWEEP_CRON", "0 */5 * * * *"),
            ("LISTQ_ARTIFACTS_DIR", "  "),
        ]);
        let config = WorkerConfig::from_lookup(|key| vars.get(key).map(|v| v.to_string()));
        assert_eq!(config.strategy, StrategyKind::Markup);
        assert_eq!(config.extraction_timeout, Duration::from_secs(30));
        assert_eq!(config.retry.max_attempts, 5);
        assert!(!config.auto_requeue_captcha);
        assert_eq!(config.sweep_cron.as_deref(), Some("0 */5 * * * *"));
        assert!(config.artifacts_dir.is_none());
    }
}
