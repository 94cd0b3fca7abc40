//! `OrchestratorConfig`: the single aggregation point for every named
//! timeout, TTL, and key prefix the orchestrator and its subsystems need.
//! Configuration is built through `OrchestratorConfigBuilder`'s `with_*`
//! methods over a sensible `Default`.

use std::time::Duration;

use crate::tier::TierLevel;

/// `FetchRequest.strategy`: how aggressively to pick a starting tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    Auto,
    RequestOnly,
    BrowserOnly,
}

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// First full-browser tier; used by `browser_only` and by the skip rule.
    pub first_browser_tier: TierLevel,
    pub hitl_tier: TierLevel,
    pub last_tier: TierLevel,

    pub admin_connect_timeout: Duration,
    pub solve_timeout: Duration,

    pub default_session_ttl: Duration,
    pub max_session_ttl: Duration,

    pub task_timeout: Duration,
    pub task_lock_ttl: Duration,
    pub worker_wait_for_solution_timeout: Duration,

    pub job_timeout: Duration,
    pub job_queue_worker_count: usize,

    pub session_prefix: String,
    pub task_lock_prefix: String,
    pub hitl_session_prefix: String,
    pub events_channel: String,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            first_browser_tier: TierLevel::FULL_BROWSER,
            hitl_tier: TierLevel::HITL,
            last_tier: TierLevel::HITL,
            admin_connect_timeout: Duration::from_secs(300),
            solve_timeout: Duration::from_secs(600),
            default_session_ttl: Duration::from_secs(3600),
            max_session_ttl: Duration::from_secs(24 * 3600),
            task_timeout: Duration::from_secs(600),
            task_lock_ttl: Duration::from_secs(30 * 60),
            worker_wait_for_solution_timeout: Duration::from_secs(600),
            job_timeout: Duration::from_secs(300),
            job_queue_worker_count: 10,
            session_prefix: "session".to_string(),
            task_lock_prefix: "task_lock".to_string(),
            hitl_session_prefix: "hitl_session".to_string(),
            events_channel: "titan_events".to_string(),
        }
    }
}

pub struct OrchestratorConfigBuilder {
    config: OrchestratorConfig,
}

impl OrchestratorConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: OrchestratorConfig::default(),
        }
    }

    pub fn with_first_browser_tier(mut self, tier: TierLevel) -> Self {
        self.config.first_browser_tier = tier;
        self
    }

    pub fn with_last_tier(mut self, tier: TierLevel) -> Self {
        self.config.last_tier = tier;
        self
    }

    pub fn with_admin_connect_timeout(mut self, timeout: Duration) -> Self {
        self.config.admin_connect_timeout = timeout;
        self
    }

    pub fn with_solve_timeout(mut self, timeout: Duration) -> Self {
        self.config.solve_timeout = timeout;
        self
    }

    pub fn with_default_session_ttl(mut self, ttl: Duration) -> Self {
        self.config.default_session_ttl = ttl;
        self
    }

    pub fn with_max_session_ttl(mut self, ttl: Duration) -> Self {
        self.config.max_session_ttl = ttl;
        self
    }

    pub fn with_task_timeout(mut self, timeout: Duration) -> Self {
        self.config.task_timeout = timeout;
        self
    }

    pub fn with_task_lock_ttl(mut self, ttl: Duration) -> Self {
        self.config.task_lock_ttl = ttl;
        self
    }

    pub fn with_job_timeout(mut self, timeout: Duration) -> Self {
        self.config.job_timeout = timeout;
        self
    }

    pub fn with_job_queue_worker_count(mut self, count: usize) -> Self {
        self.config.job_queue_worker_count = count;
        self
    }

    pub fn with_key_prefixes(mut self, session_prefix: impl Into<String>, task_lock_prefix: impl Into<String>, hitl_session_prefix: impl Into<String>) -> Self {
        self.config.session_prefix = session_prefix.into();
        self.config.task_lock_prefix = task_lock_prefix.into();
        self.config.hitl_session_prefix = hitl_session_prefix.into();
        self
    }

    pub fn build(self) -> OrchestratorConfig {
        self.config
    }
}

impl Default for OrchestratorConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_has_expected_defaults() {
        let config = OrchestratorConfig::default();
        assert_eq!(config.job_queue_worker_count, 10);
        assert_eq!(config.task_lock_ttl, Duration::from_secs(30 * 60));
    }

    #[test]
    fn builder_overrides_apply() {
        let config = OrchestratorConfigBuilder::new().with_job_queue_worker_count(4).with_task_timeout(Duration::from_secs(120)).build();
        assert_eq!(config.job_queue_worker_count, 4);
        assert_eq!(config.task_timeout, Duration::from_secs(120));
    }
}
