//! Orchestrator configuration, sourced from the environment with working
//! defaults for local development.

use std::time::Duration;

/// Runtime knobs for the coordinator and the polling driver.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Seconds between discovery passes.
    pub poll_interval: Duration,
    /// Implementation attempts per ticket before escalating.
    pub max_retries: u32,
    /// Pause between failed attempts.
    pub retry_delay: Duration,
    /// Below this confidence a first-attempt miss escalates immediately.
    pub low_confidence_threshold: i32,
    /// Directory holding per-ticket lock lease files.
    pub lock_dir: String,
    /// Age at which a lease counts as abandoned.
    pub lock_staleness: Duration,
    /// Command the verify stage runs inside the workspace.
    pub test_command: String,
    /// JSONL sink for per-ticket outcome records.
    pub analytics_path: String,
    /// Lock owner label for this instance.
    pub owner: String,
    /// Tracker CLI binary.
    pub tracker_bin: String,
    /// Stage commands, each a program speaking JSON on stdin/stdout.
    pub plan_command: String,
    pub implement_command: String,
    pub verify_command: String,
    pub communicate_command: String,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self::from_env()
    }
}

impl OrchestratorConfig {
    pub fn from_env() -> Self {
        Self {
            poll_interval: Duration::from_secs(env_u64("POLL_INTERVAL_SECONDS", 60)),
            max_retries: env_u64("MAX_RETRIES", 4) as u32,
            retry_delay: Duration::from_secs(env_u64("RETRY_DELAY_SECONDS", 5)),
            low_confidence_threshold: env_u64("LOW_CONFIDENCE_THRESHOLD", 60) as i32,
            lock_dir: env_str("TICKET_LOCK_DIR", "/tmp/bugfix_ai_locks"),
            lock_staleness: Duration::from_secs(env_u64("LOCK_STALENESS_SECONDS", 3600)),
            test_command: env_str("TEST_COMMAND", "npm test"),
            analytics_path: env_str("ANALYTICS_LOG_PATH", "bugfix-analytics.jsonl"),
            owner: env_str("ORCHESTRATOR_OWNER", "orchestrator"),
            tracker_bin: env_str("TRACKER_BIN", "bugtracker"),
            plan_command: env_str("PLAN_STAGE_CMD", "bugfix-plan"),
            implement_command: env_str("IMPLEMENT_STAGE_CMD", "bugfix-implement"),
            verify_command: env_str("VERIFY_STAGE_CMD", "bugfix-verify"),
            communicate_command: env_str("COMMUNICATE_STAGE_CMD", "bugfix-communicate"),
        }
    }
}

fn env_str(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_u64(key: &str, default: u64) -> u64 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}
