//! The Escalation Orchestrator: the state machine that drives a fetch
//! request through an ordered sequence of tiers, deciding after each tier
//! whether to succeed, fail-fast, escalate, or short-circuit to HITL.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use url::Url;

use crate::config::{OrchestratorConfig, Strategy};
use crate::detector::DetectedChallenge;
use crate::event_bus::EventBus;
use crate::hitl::{BrowserHandle, BrowserHandleError, CaptchaTaskManager, HitlConfig, HitlCoordinator};
use crate::tier::{ErrorType, FetchOptions, TierExecutor, TierLevel, TierResult};
use crate::ticket_store::TicketStore;

/// Supplies a live `BrowserHandle` for a URL when orchestration reaches the
/// HITL tier. A full-browser tier is a black box: it returns a `TierResult`,
/// not a running session, so the crate models the handoff to a human
/// operator as a separate, caller-supplied provider rather than inventing
/// browser-process ownership inside the orchestrator.
#[async_trait]
pub trait HitlBrowserProvider: Send + Sync {
    async fn acquire(&self, url: &Url) -> Result<Arc<dyn BrowserHandle>, BrowserHandleError>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct TierMetrics {
    pub attempts: u64,
    pub successes: u64,
    pub escalations: u64,
}

/// Per-tier attempt/success/escalation counters, observable for tuning.
/// Keyed by raw tier level so a snapshot survives even for tiers added
/// after construction.
#[derive(Default)]
pub struct OrchestratorMetrics {
    counters: DashMap<u8, TierMetrics>,
}

impl OrchestratorMetrics {
    fn record_attempt(&self, tier: TierLevel) {
        self.counters.entry(tier.0).or_default().attempts += 1;
    }

    fn record_success(&self, tier: TierLevel) {
        self.counters.entry(tier.0).or_default().successes += 1;
    }

    fn record_escalation(&self, tier: TierLevel) {
        self.counters.entry(tier.0).or_default().escalations += 1;
    }

    /// Read-only snapshot keyed by tier level, safe to hand to a metrics
    /// exporter outside the hot path.
    pub fn snapshot(&self) -> HashMap<u8, TierMetrics> {
        self.counters.iter().map(|entry| (*entry.key(), *entry.value())).collect()
    }
}

pub struct Orchestrator {
    /// Index `i` holds the executor for `TierLevel(i + 1)`. Only index 0
    /// (tier 1) is populated by the crate itself; callers supply the rest.
    tiers: Vec<Arc<dyn TierExecutor>>,
    config: OrchestratorConfig,
    ticket_store: Arc<dyn TicketStore>,
    event_bus: Arc<EventBus>,
    task_manager: Arc<CaptchaTaskManager>,
    hitl: HitlCoordinator,
    hitl_browser_provider: Option<Arc<dyn HitlBrowserProvider>>,
    metrics: OrchestratorMetrics,
}

impl Orchestrator {
    pub fn new(
        tiers: Vec<Arc<dyn TierExecutor>>,
        config: OrchestratorConfig,
        ticket_store: Arc<dyn TicketStore>,
        event_bus: Arc<EventBus>,
        task_manager: Arc<CaptchaTaskManager>,
        hitl_browser_provider: Option<Arc<dyn HitlBrowserProvider>>,
    ) -> Self {
        let hitl_config = HitlConfig {
            admin_connect_timeout: config.admin_connect_timeout,
            solve_timeout: config.solve_timeout,
            session_ttl_seconds: config.default_session_ttl.as_secs() as i64,
            max_ttl_seconds: config.max_session_ttl.as_secs() as i64,
        };
        let hitl = HitlCoordinator::new(task_manager.clone(), ticket_store.clone(), event_bus.clone(), hitl_config);
        Self {
            tiers,
            config,
            ticket_store,
            event_bus,
            task_manager,
            hitl,
            hitl_browser_provider,
            metrics: OrchestratorMetrics::default(),
        }
    }

    pub fn metrics_snapshot(&self) -> HashMap<u8, TierMetrics> {
        self.metrics.snapshot()
    }

    fn tier_bounds(&self, strategy: Strategy, start_tier: TierLevel, max_tier: TierLevel) -> (TierLevel, TierLevel) {
        match strategy {
            Strategy::RequestOnly => (TierLevel::HTTP, TierLevel::HTTP),
            Strategy::BrowserOnly => (TierLevel(start_tier.0.max(self.config.first_browser_tier.0)), max_tier),
            Strategy::Auto => (start_tier, max_tier),
        }
    }

    fn executor_for(&self, tier: TierLevel) -> Option<&Arc<dyn TierExecutor>> {
        self.tiers.get((tier.0 as usize).checked_sub(1)?)
    }

    pub async fn execute(&self, url: &Url, mut options: FetchOptions, strategy: Strategy, start_tier: TierLevel, max_tier: TierLevel) -> TierResult {
        let domain = url.host_str().unwrap_or("").to_string();
        let (start_tier, max_tier) = self.tier_bounds(strategy, start_tier, max_tier);

        // Ticket usage: inject a fresh ticket's cookies/UA/proxy into the
        // lightest tier attempted.
        let mut ticket_in_use = false;
        if let Ok(Some(ticket)) = self.ticket_store.get(&domain).await {
            log::debug!("orchestrator: golden ticket hit for domain={domain}");
            let cookies = ticket.cookies.iter().map(|c| (c.name.clone(), c.value.clone())).collect();
            options.merge_cookies(cookies);
            if options.proxy_url.is_none() {
                options.proxy_url = ticket.proxy_url.clone();
            }
            if let Some(user_agent) = &ticket.user_agent {
                options.extra_headers.entry("User-Agent".to_string()).or_insert_with(|| user_agent.clone());
            }
            ticket_in_use = true;
        }

        let mut current = start_tier;
        let mut history: Vec<String> = Vec::new();

        loop {
            if current == self.config.hitl_tier {
                let mut result = self.run_hitl(url, &domain, None).await;
                result = result.with_metadata("escalation_history", history.join(","));
                return result;
            }

            let Some(executor) = self.executor_for(current) else {
                // No executor registered for this level (a pluggable tier the
                // caller never supplied): skip straight to the next level
                // rather than stall the ladder on an absent black box.
                if current == max_tier {
                    return TierResult::failure(current, ErrorType::Unknown, format!("no executor registered for {current}")).with_escalate(false);
                }
                current = current.next();
                continue;
            };

            self.metrics.record_attempt(current);
            let mut result = executor.execute(url, &options).await;

            if result.success {
                self.metrics.record_success(current);
                if ticket_in_use {
                    result = result.with_metadata("golden_ticket_used", true);
                }
                result = result.with_metadata("escalation_history", history.join(","));
                return result;
            }

            // A ticket that triggers a blocked response must be invalidated
            // before escalation.
            if ticket_in_use && matches!(result.error_type, ErrorType::Blocked | ErrorType::CaptchaRequired) {
                log::info!("orchestrator: invalidating golden ticket for domain={domain} after blocked response");
                let _ = self.ticket_store.invalidate(&domain).await;
                self.event_bus
                    .publish_kind(crate::event_bus::EventKind::SessionInvalidated, domain.clone(), serde_json::json!({"tier": current.0}));
                ticket_in_use = false;
            }

            if result.error_type.is_fail_fast() {
                return result.with_metadata("escalation_history", history.join(","));
            }

            if result.error_type == ErrorType::CaptchaRequired && current < self.config.hitl_tier {
                let mut hitl_result = self.run_hitl(url, &domain, result.detected_challenge).await;
                hitl_result = hitl_result.with_metadata("escalation_history", history.join(","));
                return hitl_result;
            }

            if current == max_tier || !result.should_escalate {
                return result.with_metadata("escalation_history", history.join(","));
            }

            self.metrics.record_escalation(current);
            let mut next = current.next();

            // Skip rule: a tier-1 JS-gate signal makes tier 2 (browser-backed
            // HTTP, no JS render) pointless to try.
            if current == TierLevel::HTTP && next == TierLevel::BROWSER_HTTP {
                if let Some(challenge) = result.detected_challenge {
                    if challenge.skips_browser_http_tier() {
                        log::debug!("orchestrator: skip rule fired on {:?}, jumping to first browser tier", challenge);
                        history.push(format!("tier{}:skipped({})", next.0, challenge.tag()));
                        next = self.config.first_browser_tier;
                    }
                }
            }

            history.push(format!(
                "tier{}:{}",
                current.0,
                result.detected_challenge.map(DetectedChallenge::tag).unwrap_or("escalated")
            ));
            current = next;
        }
    }

    async fn run_hitl(&self, url: &Url, domain: &str, challenge_type: Option<DetectedChallenge>) -> TierResult {
        let Some(provider) = &self.hitl_browser_provider else {
            log::warn!("orchestrator: hitl tier reached but no browser provider configured for domain={domain}");
            return TierResult::failure(self.config.hitl_tier, ErrorType::CaptchaRequired, "no hitl browser provider configured")
                .with_metadata("hitl_status", "harvesting_error")
                .with_escalate(false);
        };

        let browser = match provider.acquire(url).await {
            Ok(browser) => browser,
            Err(err) => {
                log::error!("orchestrator: failed to acquire hitl browser for domain={domain}: {err}");
                return TierResult::failure(self.config.hitl_tier, ErrorType::BrowserCrash, err.to_string()).with_escalate(false);
            }
        };

        let task = match self.task_manager.create(url.as_str(), challenge_type, None, None, 5) {
            Ok(task) => task,
            Err(err) => {
                return TierResult::failure(self.config.hitl_tier, ErrorType::CaptchaRequired, err.to_string())
                    .with_metadata("hitl_status", "harvesting_error")
                    .with_escalate(false);
            }
        };

        self.metrics.record_attempt(self.config.hitl_tier);
        let result = self.hitl.run(task.uuid, url.as_str(), domain, challenge_type, browser).await;
        if result.success {
            self.metrics.record_success(self.config.hitl_tier);
        }
        result
    }
}
