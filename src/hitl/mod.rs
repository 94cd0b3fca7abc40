//! Human-in-the-loop coordination layer. Ties the CAPTCHA Task Manager,
//! Ticket Store, Event Bus, and a caller-supplied `BrowserHandle` together
//! into the cache-check, session, await-admin, stream, await-solve,
//! harvest, persist flow.

pub mod harvester;
pub mod session;
pub mod task_manager;

pub use harvester::{HarvestError, SessionHarvester};
pub use session::{BrowserHandle, BrowserHandleError, ClientInputEvent, HITLSession, HarvestContext, HitlFailureSubtype, MouseButton, SessionStatus, StatusMessage};
pub use task_manager::{CaptchaTask, CaptchaTaskManager, SolverResult, TaskManagerError, TaskStatus};

use std::sync::Arc;
use std::time::Duration;

use tokio::time::{interval, sleep, timeout};
use uuid::Uuid;

use crate::detector::{ChallengeDetector, DetectedChallenge};
use crate::event_bus::EventBus;
use crate::tier::{ErrorType, TierLevel, TierResult};
use crate::ticket_store::TicketStore;

/// How often the concurrent auto-resolution / solve-detection pollers check
/// the browser while waiting.
const POLL_INTERVAL: Duration = Duration::from_millis(750);

pub struct HitlConfig {
    pub admin_connect_timeout: Duration,
    pub solve_timeout: Duration,
    pub session_ttl_seconds: i64,
    pub max_ttl_seconds: i64,
}

impl Default for HitlConfig {
    fn default() -> Self {
        Self {
            admin_connect_timeout: Duration::from_secs(300),
            solve_timeout: Duration::from_secs(600),
            session_ttl_seconds: 3600,
            max_ttl_seconds: 24 * 3600,
        }
    }
}

pub struct HitlCoordinator {
    task_manager: Arc<CaptchaTaskManager>,
    ticket_store: Arc<dyn TicketStore>,
    event_bus: Arc<EventBus>,
    detector: ChallengeDetector,
    harvester: SessionHarvester,
    config: HitlConfig,
}

impl HitlCoordinator {
    pub fn new(task_manager: Arc<CaptchaTaskManager>, ticket_store: Arc<dyn TicketStore>, event_bus: Arc<EventBus>, config: HitlConfig) -> Self {
        let harvester = SessionHarvester::new(config.max_ttl_seconds);
        Self {
            task_manager,
            ticket_store,
            event_bus,
            detector: ChallengeDetector::new(),
            harvester,
            config,
        }
    }

    /// The full HITL flow, run once a tier has surfaced `captcha_required`
    /// (or the escalation ladder bottomed out at the HITL tier). `browser`
    /// is the full-browser tier's handle into the session that's already
    /// navigated to `url`.
    pub async fn run(&self, task_uuid: Uuid, url: &str, domain: &str, challenge_type: Option<DetectedChallenge>, browser: Arc<dyn BrowserHandle>) -> TierResult {
        // Step 1: cache check.
        if let Ok(Some(ticket)) = self.ticket_store.get(domain).await {
            log::info!("hitl: cache hit for domain={domain}, skipping human operator");
            return TierResult::success(TierLevel::HITL, String::new(), 200).with_metadata("golden_ticket", ticket.summary());
        }

        // Step 2: session creation.
        let mut session = HITLSession::new(task_uuid, url, domain);
        self.event_bus.publish_kind(
            crate::event_bus::EventKind::HitlRequired,
            domain,
            serde_json::json!({
                "session_id": session.session_id,
                "url": url,
                "domain": domain,
                "challenge_type": challenge_type.map(|c| c.tag()),
            }),
        );

        // Step 3: await admin, concurrent to polling the browser for
        // auto-resolution (the challenge may clear itself).
        let admin_connected = self.await_admin_or_auto_resolve(task_uuid, browser.as_ref()).await;

        match admin_connected {
            AdminWaitOutcome::AutoResolved => {
                session.mark_solved();
                return self.harvest_and_finish(&session, url, domain, browser.as_ref()).await;
            }
            AdminWaitOutcome::Timeout => {
                session.mark_failed();
                log::warn!("hitl: admin_connect_timeout for session={}", session.session_id);
                return self.hitl_failure(HitlFailureSubtype::AdminTimeout);
            }
            AdminWaitOutcome::AdminConnected => {
                session.mark_admin_connected();
            }
        }

        // Steps 4-5: browser streaming happens on the transport the caller
        // owns (out of scope here); we just poll for solved indicators
        // within `solve_timeout`.
        match timeout(self.config.solve_timeout, self.poll_until_solved(browser.as_ref())).await {
            Ok(true) => {
                session.mark_solved();
                self.harvest_and_finish(&session, url, domain, browser.as_ref()).await
            }
            Ok(false) => {
                session.mark_failed();
                self.hitl_failure(HitlFailureSubtype::HarvestingError)
            }
            Err(_) => {
                session.mark_expired();
                log::warn!("hitl: solve_timeout for session={}", session.session_id);
                self.hitl_failure(HitlFailureSubtype::SolveTimeout)
            }
        }
    }

    async fn await_admin_or_auto_resolve(&self, task_uuid: Uuid, browser: &dyn BrowserHandle) -> AdminWaitOutcome {
        let assignment_wait = async {
            loop {
                if let Some(task) = self.task_manager.get(task_uuid) {
                    if task.status == TaskStatus::Assigned || task.status == TaskStatus::Solving {
                        return AdminWaitOutcome::AdminConnected;
                    }
                }
                sleep(POLL_INTERVAL).await;
            }
        };

        let auto_resolve_wait = async {
            let mut ticker = interval(POLL_INTERVAL);
            loop {
                ticker.tick().await;
                if self.looks_solved(browser).await {
                    return AdminWaitOutcome::AutoResolved;
                }
            }
        };

        tokio::select! {
            outcome = timeout(self.config.admin_connect_timeout, assignment_wait) => {
                outcome.unwrap_or(AdminWaitOutcome::Timeout)
            }
            outcome = auto_resolve_wait => outcome,
        }
    }

    async fn poll_until_solved(&self, browser: &dyn BrowserHandle) -> bool {
        let mut ticker = interval(POLL_INTERVAL);
        loop {
            ticker.tick().await;
            if self.looks_solved(browser).await {
                return true;
            }
        }
    }

    /// Solved indicator: absence of all known challenge signatures and a
    /// non-trivial document body.
    async fn looks_solved(&self, browser: &dyn BrowserHandle) -> bool {
        match browser.current_document().await {
            Ok(document) => document.len() > 256 && self.detector.classify(&document, 200).is_none(),
            Err(_) => false,
        }
    }

    async fn harvest_and_finish(&self, session: &HITLSession, url: &str, domain: &str, browser: &dyn BrowserHandle) -> TierResult {
        let context = match browser.harvest_context().await {
            Ok(context) => context,
            Err(err) => {
                log::error!("hitl: harvesting failed for session={}: {err}", session.session_id);
                return self.hitl_failure(HitlFailureSubtype::HarvestingError);
            }
        };

        let ticket = match self.harvester.harvest(domain, url, context, self.config.session_ttl_seconds) {
            Ok(ticket) => ticket,
            Err(err) => {
                log::error!("hitl: harvest validation failed for session={}: {err}", session.session_id);
                return self.hitl_failure(HitlFailureSubtype::HarvestingError);
            }
        };

        let document = browser.current_document().await.unwrap_or_default();
        let summary = ticket.summary();

        if let Err(err) = self.ticket_store.put(ticket).await {
            log::error!("hitl: failed to persist golden ticket for domain={domain}: {err}");
            return self.hitl_failure(HitlFailureSubtype::HarvestingError);
        }
        self.event_bus
            .publish_kind(crate::event_bus::EventKind::TicketStored, domain, serde_json::json!({"session_id": session.session_id}));

        log::info!("hitl: session={} solved, ticket stored for domain={domain}", session.session_id);
        TierResult::success(TierLevel::HITL, document, 200).with_metadata("golden_ticket", summary)
    }

    /// HITL failures are returned as `captcha_required` with descriptive
    /// metadata, never escalated since there is no higher tier.
    fn hitl_failure(&self, subtype: HitlFailureSubtype) -> TierResult {
        TierResult::failure(TierLevel::HITL, ErrorType::CaptchaRequired, format!("hitl session did not resolve: {}", subtype.as_str()))
            .with_metadata("hitl_status", subtype.as_str())
            .with_escalate(false)
    }
}

enum AdminWaitOutcome {
    AdminConnected,
    AutoResolved,
    Timeout,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event_bus::EventBus;
    use crate::ticket_store::{Cookie, InMemoryTicketStore};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct StubBrowser {
        solved_after_polls: u32,
        polls: AtomicU32,
    }

    #[async_trait]
    impl BrowserHandle for StubBrowser {
        async fn capture_frame(&self) -> Result<bytes::Bytes, BrowserHandleError> {
            Ok(bytes::Bytes::new())
        }

        async fn dispatch_input(&self, _event: ClientInputEvent) -> Result<(), BrowserHandleError> {
            Ok(())
        }

        async fn current_document(&self) -> Result<String, BrowserHandleError> {
            let polls = self.polls.fetch_add(1, Ordering::SeqCst);
            if polls >= self.solved_after_polls {
                Ok("x".repeat(300))
            } else {
                Ok(r#"<div class="g-recaptcha"></div>"#.to_string())
            }
        }

        async fn harvest_context(&self) -> Result<HarvestContext, BrowserHandleError> {
            Ok(HarvestContext {
                cookies: vec![Cookie::new("cf_clearance", "abc", "example.com")],
                user_agent: Some("test-agent".to_string()),
                proxy_url: None,
            })
        }
    }

    fn coordinator(config: HitlConfig) -> (HitlCoordinator, Arc<CaptchaTaskManager>) {
        let event_bus = Arc::new(EventBus::new());
        let ticket_store: Arc<dyn TicketStore> = Arc::new(InMemoryTicketStore::new());
        let task_manager = Arc::new(CaptchaTaskManager::new(event_bus.clone(), ticket_store.clone(), Duration::from_secs(600), Duration::from_secs(1800)));
        let coordinator = HitlCoordinator::new(task_manager.clone(), ticket_store, event_bus, config);
        (coordinator, task_manager)
    }

    #[tokio::test]
    async fn cache_hit_returns_success_without_waiting_for_admin() {
        let (coordinator, task_manager) = coordinator(HitlConfig::default());
        coordinator
            .ticket_store
            .put(crate::ticket_store::GoldenTicket::new(
                "example.com",
                "https://example.com/",
                vec![Cookie::new("cf_clearance", "abc", "example.com")],
                300,
                3600,
            ))
            .await
            .unwrap();
        let task = task_manager.create("https://example.com/", None, None, None, 5).unwrap();
        let browser = Arc::new(StubBrowser {
            solved_after_polls: 0,
            polls: AtomicU32::new(0),
        });

        let result = coordinator.run(task.uuid, "https://example.com/", "example.com", None, browser).await;
        assert!(result.success);
    }

    #[tokio::test]
    async fn admin_never_connects_returns_captcha_required_admin_timeout() {
        let mut config = HitlConfig::default();
        config.admin_connect_timeout = Duration::from_millis(50);
        let (coordinator, task_manager) = coordinator(config);
        let task = task_manager.create("https://example.com/", None, None, None, 5).unwrap();
        let browser = Arc::new(StubBrowser {
            solved_after_polls: u32::MAX,
            polls: AtomicU32::new(0),
        });

        let result = coordinator.run(task.uuid, "https://example.com/", "example.com", None, browser).await;
        assert!(!result.success);
        assert_eq!(result.error_type, ErrorType::CaptchaRequired);
        assert!(!result.should_escalate);
        assert_eq!(result.metadata.get("hitl_status").and_then(|v| v.as_str()), Some("admin_timeout"));
    }

    #[tokio::test]
    async fn admin_connects_then_solve_harvests_and_stores_ticket() {
        let (coordinator, task_manager) = coordinator(HitlConfig::default());
        let task = task_manager.create("https://example.com/", None, None, None, 5).unwrap();
        task_manager.assign(task.uuid, "operator-1").unwrap();
        let browser = Arc::new(StubBrowser {
            solved_after_polls: 1,
            polls: AtomicU32::new(0),
        });

        let result = coordinator.run(task.uuid, "https://example.com/", "example.com", None, browser).await;
        assert!(result.success);
        assert!(result.metadata.contains_key("golden_ticket"));
        let ticket = coordinator.ticket_store.get("example.com").await.unwrap();
        assert!(ticket.is_some());
    }
}
