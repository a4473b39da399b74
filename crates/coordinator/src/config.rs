//! Coordinator configuration

use serde::Deserialize;
use std::time::Duration;

/// Operator-configured heuristic applied to prepared branches when no
/// log-based decision is available. Startup-only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HeuristicRecover {
    #[default]
    NotUsed,
    Commit,
    Rollback,
}

/// Server-level knobs the coordinator reads. Session-level overrides
/// (`sql_log_bin`, `lock_wait_timeout`) live on the session itself and are
/// seeded from here.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CoordinatorConfig {
    /// Server id embedded into internally generated XIDs.
    pub server_id: u32,

    /// Heuristic decision for prepared branches at startup.
    pub tc_heuristic_recover: HeuristicRecover,

    /// How long XA finalization waits for the commit metadata lock.
    pub lock_wait_timeout: Duration,

    /// Whether the binlog participates in two-phase commit.
    pub log_bin: bool,

    /// Whether applier sessions write their changes to the binlog.
    pub log_replica_updates: bool,

    /// Compatibility mode selecting the single-quoted XID literal form.
    pub ddc_mode: bool,

    /// Transaction-coordinator log named in startup failure messages.
    pub tc_log_file: String,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            server_id: 1,
            tc_heuristic_recover: HeuristicRecover::NotUsed,
            // Matches the server default: effectively wait forever.
            lock_wait_timeout: Duration::from_secs(31_536_000),
            log_bin: true,
            log_replica_updates: false,
            ddc_mode: false,
            tc_log_file: "tandem-tc.log".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = CoordinatorConfig::default();
        assert_eq!(config.tc_heuristic_recover, HeuristicRecover::NotUsed);
        assert!(config.log_bin);
        assert!(!config.ddc_mode);
    }

    #[test]
    fn test_deserialize_partial() {
        let config: CoordinatorConfig = serde_json::from_str(
            r#"{
                "server_id": 7,
                "tc_heuristic_recover": "rollback",
                "log_bin": false
            }"#,
        )
        .unwrap();
        assert_eq!(config.server_id, 7);
        assert_eq!(config.tc_heuristic_recover, HeuristicRecover::Rollback);
        assert!(!config.log_bin);
        assert!(!config.log_replica_updates);
    }
}
