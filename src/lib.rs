//! Multi-tier web-scraping orchestrator with human-in-the-loop CAPTCHA
//! fallback and credential caching.
//!
//! The four tightly coupled subsystems: the Escalation [`orchestrator`], the
//! [`tier`] executor contract (plus the one concrete tier the crate ships),
//! the [`hitl`] coordination layer (CAPTCHA Task Manager, HITL Session,
//! credential harvesting), and the [`job_queue`] glue between submission and
//! the orchestrator. [`ticket_store`] and [`event_bus`] are the shared
//! infrastructure all of the above depend on.

pub mod config;
pub mod detector;
pub mod event_bus;
pub mod hitl;
pub mod job_queue;
pub mod orchestrator;
pub mod tier;
pub mod ticket_store;

pub use config::{OrchestratorConfig, OrchestratorConfigBuilder, Strategy};
pub use detector::{ChallengeDetector, DetectedChallenge};
pub use event_bus::{Event, EventBus, EventKind};
pub use hitl::{BrowserHandle, CaptchaTask, CaptchaTaskManager, HITLSession, HitlConfig, HitlCoordinator, TaskStatus};
pub use job_queue::{FetchRequest, JobQueue, JobRecord, JobStatus};
pub use orchestrator::{HitlBrowserProvider, Orchestrator, OrchestratorMetrics, TierMetrics};
pub use tier::{ErrorType, FetchOptions, HttpTier, TierExecutor, TierLevel, TierResult};
pub use ticket_store::{Cookie, GoldenTicket, InMemoryTicketStore, RedbTicketStore, TicketStore};

/// Initializes the `env_logger` backend for `log`, honoring `RUST_LOG`.
/// Safe to call more than once; subsequent calls are no-ops.
pub fn init_logging() {
    let _ = env_logger::try_init();
}
