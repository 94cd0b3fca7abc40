//! CAPTCHA Task Manager: lifecycle of a manual-solve work item, from
//! creation through assignment, solving, and a terminal outcome. Assignment
//! locks carry a TTL so a solver that disappears mid-task doesn't block the
//! task forever.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use url::Url;
use uuid::Uuid;

use crate::detector::DetectedChallenge;
use crate::event_bus::{Event, EventBus, EventKind};
use crate::ticket_store::{Cookie, GoldenTicket, TicketStore, TicketStoreError};

/// `CaptchaTask.status` transitions: `pending -> assigned -> solving ->
/// {solved | failed | unsolvable | expired}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Assigned,
    Solving,
    Solved,
    Failed,
    Unsolvable,
    Expired,
}

impl TaskStatus {
    /// A task is *assignable* iff status ∈ `{pending, failed}`.
    pub fn is_assignable(self) -> bool {
        matches!(self, TaskStatus::Pending | TaskStatus::Failed)
    }

    /// A task is *solvable* iff status ∈ `{pending, assigned, solving, failed}`.
    pub fn is_solvable(self) -> bool {
        matches!(
            self,
            TaskStatus::Pending | TaskStatus::Assigned | TaskStatus::Solving | TaskStatus::Failed
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, TaskStatus::Solved | TaskStatus::Unsolvable | TaskStatus::Expired)
    }
}

/// A solver's output: cookies plus an optional token and session identifier.
/// There is no separate legacy `cf_clearance` field; a Cloudflare clearance
/// cookie is just another entry in `cookies`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SolverResult {
    pub cookies: Vec<Cookie>,
    pub token: Option<String>,
    pub session: Option<String>,
    pub expires_at: DateTime<Utc>,
}

/// Manual-solve work item.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaptchaTask {
    pub id: u64,
    pub uuid: Uuid,
    pub url: String,
    pub domain: String,
    pub status: TaskStatus,
    pub priority: u8,
    pub assigned_to: Option<String>,
    pub challenge_type: Option<String>,
    pub solver_result: Option<SolverResult>,
    pub proxy_url: Option<String>,
    pub user_agent: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub solved_at: Option<DateTime<Utc>>,
    pub expires_at: DateTime<Utc>,
    pub attempts: u32,
    pub metadata: HashMap<String, Value>,
}

#[derive(Debug, thiserror::Error)]
pub enum TaskManagerError {
    #[error("task {0} not found")]
    NotFound(Uuid),
    #[error("task {0} is not assignable in status {1:?}")]
    NotAssignable(Uuid, TaskStatus),
    #[error("task {0} is not solvable in status {1:?}")]
    NotSolvable(Uuid, TaskStatus),
    #[error("task {0} is already assigned to {1}")]
    AlreadyAssigned(Uuid, String),
    #[error("invalid url: {0}")]
    InvalidUrl(#[from] url::ParseError),
    #[error(transparent)]
    TicketStore(#[from] TicketStoreError),
}

fn domain_of(url: &str) -> Result<String, url::ParseError> {
    Url::parse(url).map(|parsed| parsed.host_str().unwrap_or("").to_string())
}

/// Coordinates the manual-solve queue. Backed by a concurrent map rather
/// than a lock around a `HashMap`, since creating, assigning, and solving
/// tasks land on independent entries in the common case and shouldn't
/// serialise on each other.
pub struct CaptchaTaskManager {
    tasks: DashMap<Uuid, CaptchaTask>,
    next_id: std::sync::atomic::AtomicU64,
    event_bus: Arc<EventBus>,
    ticket_store: Arc<dyn TicketStore>,
    task_timeout: Duration,
    task_lock_ttl: Duration,
}

impl CaptchaTaskManager {
    pub fn new(event_bus: Arc<EventBus>, ticket_store: Arc<dyn TicketStore>, task_timeout: Duration, task_lock_ttl: Duration) -> Self {
        Self {
            tasks: DashMap::new(),
            next_id: std::sync::atomic::AtomicU64::new(1),
            event_bus,
            ticket_store,
            task_timeout,
            task_lock_ttl,
        }
    }

    pub fn create(
        &self,
        url: impl Into<String>,
        challenge_type: Option<DetectedChallenge>,
        proxy_url: Option<String>,
        user_agent: Option<String>,
        priority: u8,
    ) -> Result<CaptchaTask, TaskManagerError> {
        let url = url.into();
        let domain = domain_of(&url)?;
        let now = Utc::now();
        let id = self.next_id.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        let task = CaptchaTask {
            id,
            uuid: Uuid::new_v4(),
            url,
            domain: domain.clone(),
            status: TaskStatus::Pending,
            priority: priority.clamp(1, 10),
            assigned_to: None,
            challenge_type: challenge_type.map(|c| c.tag().to_string()),
            solver_result: None,
            proxy_url,
            user_agent,
            created_at: now,
            updated_at: now,
            solved_at: None,
            expires_at: now + chrono::Duration::from_std(self.task_timeout).unwrap_or(chrono::Duration::seconds(600)),
            attempts: 0,
            metadata: HashMap::new(),
        };

        self.tasks.insert(task.uuid, task.clone());
        log::info!("captcha_task_manager: created task={} domain={}", task.uuid, task.domain);
        self.event_bus.publish(Event::new(
            EventKind::TaskCreated,
            domain,
            serde_json::json!({"task_uuid": task.uuid}),
        ));
        Ok(task)
    }

    pub fn assign(&self, task_uuid: Uuid, operator_id: impl Into<String>) -> Result<CaptchaTask, TaskManagerError> {
        let operator_id = operator_id.into();
        let mut entry = self.tasks.get_mut(&task_uuid).ok_or(TaskManagerError::NotFound(task_uuid))?;

        if !entry.status.is_assignable() {
            if entry.status == TaskStatus::Assigned {
                if let Some(holder) = &entry.assigned_to {
                    return Err(TaskManagerError::AlreadyAssigned(task_uuid, holder.clone()));
                }
            }
            return Err(TaskManagerError::NotAssignable(task_uuid, entry.status));
        }

        entry.status = TaskStatus::Assigned;
        entry.assigned_to = Some(operator_id);
        entry.attempts += 1;
        entry.updated_at = Utc::now();
        entry.expires_at = entry.updated_at + chrono::Duration::from_std(self.task_lock_ttl).unwrap_or(chrono::Duration::minutes(30));

        log::info!("captcha_task_manager: assigned task={} to operator", task_uuid);
        self.event_bus.publish(Event::new(
            EventKind::TaskAssigned,
            entry.domain.clone(),
            serde_json::json!({"task_uuid": task_uuid}),
        ));
        Ok(entry.clone())
    }

    pub fn mark_solving(&self, task_uuid: Uuid) -> Result<CaptchaTask, TaskManagerError> {
        let mut entry = self.tasks.get_mut(&task_uuid).ok_or(TaskManagerError::NotFound(task_uuid))?;
        entry.status = TaskStatus::Solving;
        entry.updated_at = Utc::now();
        self.event_bus.publish(Event::new(
            EventKind::TaskSolving,
            entry.domain.clone(),
            serde_json::json!({"task_uuid": task_uuid}),
        ));
        Ok(entry.clone())
    }

    pub async fn submit_solution(&self, task_uuid: Uuid, solution: SolverResult, max_ttl: i64) -> Result<CaptchaTask, TaskManagerError> {
        let (domain, source_url, challenge_type) = {
            let entry = self.tasks.get(&task_uuid).ok_or(TaskManagerError::NotFound(task_uuid))?;
            if !entry.status.is_solvable() {
                return Err(TaskManagerError::NotSolvable(task_uuid, entry.status));
            }
            (entry.domain.clone(), entry.url.clone(), entry.challenge_type.clone())
        };

        let ttl_seconds = (solution.expires_at - Utc::now()).num_seconds().max(0);
        let mut ticket = GoldenTicket::new(domain.clone(), source_url, solution.cookies.clone(), ttl_seconds, max_ttl);
        if let Some(challenge) = &challenge_type {
            ticket.challenge_type = Some(challenge.clone());
        }
        self.ticket_store.put(ticket).await?;

        let mut entry = self.tasks.get_mut(&task_uuid).ok_or(TaskManagerError::NotFound(task_uuid))?;
        entry.status = TaskStatus::Solved;
        entry.solver_result = Some(solution);
        entry.solved_at = Some(Utc::now());
        entry.updated_at = Utc::now();

        log::info!("captcha_task_manager: solved task={} domain={}", task_uuid, domain);
        self.event_bus.publish(Event::new(
            EventKind::Solved,
            domain.clone(),
            serde_json::json!({"task_uuid": task_uuid}),
        ));
        self.event_bus.publish(Event::new(EventKind::TicketStored, domain, serde_json::json!({"task_uuid": task_uuid})));
        Ok(entry.clone())
    }

    pub fn mark_unsolvable(&self, task_uuid: Uuid, reason: impl Into<String>) -> Result<CaptchaTask, TaskManagerError> {
        let mut entry = self.tasks.get_mut(&task_uuid).ok_or(TaskManagerError::NotFound(task_uuid))?;
        entry.status = TaskStatus::Unsolvable;
        entry.updated_at = Utc::now();
        let reason = reason.into();
        log::warn!("captcha_task_manager: task={} unsolvable: {}", task_uuid, reason);
        self.event_bus.publish(Event::new(
            EventKind::Unsolvable,
            entry.domain.clone(),
            serde_json::json!({"task_uuid": task_uuid, "reason": reason}),
        ));
        Ok(entry.clone())
    }

    /// Ordered `(priority desc, created_at asc)`.
    pub fn list(&self, status: Option<TaskStatus>, domain: Option<&str>, limit: usize, offset: usize) -> (Vec<CaptchaTask>, usize) {
        let mut matching: Vec<CaptchaTask> = self
            .tasks
            .iter()
            .map(|entry| entry.value().clone())
            .filter(|task| status.is_none_or(|s| task.status == s))
            .filter(|task| domain.is_none_or(|d| task.domain == d))
            .collect();

        matching.sort_by(|a, b| b.priority.cmp(&a.priority).then(a.created_at.cmp(&b.created_at)));
        let total = matching.len();
        let page = matching.into_iter().skip(offset).take(limit).collect();
        (page, total)
    }

    /// Sweep: tasks past `expires_at` in a non-terminal status become `expired`.
    pub fn expire_due(&self) {
        let now = Utc::now();
        let mut expired_domains = Vec::new();
        for mut entry in self.tasks.iter_mut() {
            if entry.expires_at < now && !entry.status.is_terminal() {
                entry.status = TaskStatus::Expired;
                entry.assigned_to = None;
                entry.updated_at = now;
                expired_domains.push((entry.uuid, entry.domain.clone()));
            }
        }
        for (task_uuid, domain) in expired_domains {
            log::debug!("captcha_task_manager: task={} expired", task_uuid);
            self.event_bus
                .publish(Event::new(EventKind::Expired, domain, serde_json::json!({"task_uuid": task_uuid})));
        }
    }

    pub async fn get_cached_session(&self, domain: &str) -> Result<Option<GoldenTicket>, TicketStoreError> {
        self.ticket_store.get(domain).await
    }

    pub async fn wait_for_solution(&self, domain: &str, timeout_duration: Duration) -> Option<GoldenTicket> {
        let matched = self
            .event_bus
            .wait_for(domain, |event| matches!(event.kind, EventKind::Solved | EventKind::SessionCached), timeout_duration)
            .await;
        matched?;
        self.ticket_store.get(domain).await.ok().flatten()
    }

    pub fn get(&self, task_uuid: Uuid) -> Option<CaptchaTask> {
        self.tasks.get(&task_uuid).map(|entry| entry.clone())
    }
}
