//! Job Queue: durable FIFO with out-of-order result retrieval, the glue
//! between the submission API and the Orchestrator. Jobs run to completion
//! or time out and fail, with cleanup always running regardless of outcome.
//! The backend is an in-process `tokio::mpsc` channel plus a `dashmap` job
//! table rather than an external queue, treated as an internal, swappable
//! resource.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot};
use tokio::time::timeout;
use url::Url;
use uuid::Uuid;

use crate::config::Strategy;
use crate::orchestrator::Orchestrator;
use crate::tier::{ErrorType, FetchOptions, TierLevel, TierResult};

/// `FetchRequest`: immutable, created on submission.
#[derive(Debug, Clone)]
pub struct FetchRequest {
    pub job_id: Uuid,
    pub url: Url,
    pub strategy: Strategy,
    pub options: FetchOptions,
    pub start_tier: TierLevel,
    pub max_tier: TierLevel,
}

impl FetchRequest {
    pub fn new(url: Url, strategy: Strategy) -> Self {
        Self {
            job_id: Uuid::new_v4(),
            url,
            strategy,
            options: FetchOptions::default(),
            start_tier: TierLevel::HTTP,
            max_tier: TierLevel::HITL,
        }
    }
}

/// Job status transitions: `queued -> in_progress -> {complete, failed, cancelled}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobStatus {
    Queued,
    InProgress,
    Complete,
    Failed,
    Cancelled,
}

#[derive(Debug, Clone)]
pub struct JobRecord {
    pub job_id: Uuid,
    pub status: JobStatus,
    pub result: Option<TierResult>,
    pub enqueue_time: DateTime<Utc>,
    pub start_time: Option<DateTime<Utc>>,
    pub finish_time: Option<DateTime<Utc>>,
}

impl JobRecord {
    fn queued(job_id: Uuid) -> Self {
        Self {
            job_id,
            status: JobStatus::Queued,
            result: None,
            enqueue_time: Utc::now(),
            start_time: None,
            finish_time: None,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum JobQueueError {
    #[error("job {0} not found")]
    NotFound(Uuid),
    #[error("job {0} is in_progress and cannot be cancelled")]
    InProgressConflict(Uuid),
    #[error("job {0} is already complete")]
    AlreadyComplete(Uuid),
    #[error("worker pool channel closed")]
    ChannelClosed,
}

struct WorkItem {
    request: FetchRequest,
    done: oneshot::Sender<()>,
}

/// Durable FIFO handle. Cloning shares the same underlying queue and job
/// table (cheap `Arc` clone), matching how callers hand the queue to an API
/// layer and a worker pool separately.
#[derive(Clone)]
pub struct JobQueue {
    jobs: Arc<DashMap<Uuid, JobRecord>>,
    sender: mpsc::UnboundedSender<WorkItem>,
}

impl JobQueue {
    /// Spawns `worker_count` workers pulling from the queue and invoking
    /// `orchestrator` as the handler for each fetch job.
    pub fn start(orchestrator: Arc<Orchestrator>, worker_count: usize, job_timeout: Duration) -> Self {
        let (sender, receiver) = mpsc::unbounded_channel::<WorkItem>();
        let jobs: Arc<DashMap<Uuid, JobRecord>> = Arc::new(DashMap::new());
        let receiver = Arc::new(tokio::sync::Mutex::new(receiver));

        for worker_id in 0..worker_count.max(1) {
            let receiver = receiver.clone();
            let jobs = jobs.clone();
            let orchestrator = orchestrator.clone();
            tokio::spawn(async move {
                loop {
                    let item = {
                        let mut receiver = receiver.lock().await;
                        receiver.recv().await
                    };
                    let Some(item) = item else {
                        log::debug!("job_queue: worker {worker_id} shutting down, channel closed");
                        break;
                    };
                    Self::run_job(&jobs, &orchestrator, item, job_timeout).await;
                }
            });
        }

        Self { jobs, sender }
    }

    async fn run_job(jobs: &DashMap<Uuid, JobRecord>, orchestrator: &Orchestrator, item: WorkItem, job_timeout: Duration) {
        let job_id = item.request.job_id;

        {
            let mut record = jobs.get_mut(&job_id).expect("job record inserted at enqueue time");
            if record.status == JobStatus::Cancelled {
                let _ = item.done.send(());
                return;
            }
            record.status = JobStatus::InProgress;
            record.start_time = Some(Utc::now());
        }

        log::info!("job_queue: job={job_id} started");
        let outcome = timeout(
            job_timeout,
            orchestrator.execute(&item.request.url, item.request.options.clone(), item.request.strategy, item.request.start_tier, item.request.max_tier),
        )
        .await;

        let mut record = jobs.get_mut(&job_id).expect("job record inserted at enqueue time");
        match outcome {
            Ok(result) => {
                let status = if result.success { JobStatus::Complete } else { JobStatus::Failed };
                log::info!("job_queue: job={job_id} finished status={:?}", status);
                record.status = status;
                record.result = Some(result);
            }
            Err(_) => {
                log::warn!("job_queue: job={job_id} exceeded job_timeout");
                record.status = JobStatus::Failed;
                record.result = Some(TierResult::failure(item.request.max_tier, ErrorType::Timeout, "job exceeded job_timeout").with_escalate(false));
            }
        }
        record.finish_time = Some(Utc::now());
        let _ = item.done.send(());
    }

    pub fn enqueue(&self, request: FetchRequest) -> Uuid {
        let job_id = request.job_id;
        self.jobs.insert(job_id, JobRecord::queued(job_id));
        let (done_tx, _done_rx) = oneshot::channel();
        // The send failing means every worker has shut down; the job stays
        // `queued` forever, which is an accurate reflection of reality
        // rather than a silently swallowed error.
        if self.sender.send(WorkItem { request, done: done_tx }).is_err() {
            log::error!("job_queue: enqueue failed, no workers available for job={job_id}");
        }
        job_id
    }

    pub fn status(&self, job_id: Uuid) -> Result<JobStatus, JobQueueError> {
        self.jobs.get(&job_id).map(|record| record.status).ok_or(JobQueueError::NotFound(job_id))
    }

    pub fn result(&self, job_id: Uuid) -> Result<Option<TierResult>, JobQueueError> {
        self.jobs
            .get(&job_id)
            .map(|record| record.result.clone())
            .ok_or(JobQueueError::NotFound(job_id))
    }

    pub fn record(&self, job_id: Uuid) -> Result<JobRecord, JobQueueError> {
        self.jobs.get(&job_id).map(|record| record.clone()).ok_or(JobQueueError::NotFound(job_id))
    }

    /// Cancel succeeds only while `queued`; `in_progress` rejects with
    /// conflict; `complete` rejects as already-done.
    pub fn cancel(&self, job_id: Uuid) -> Result<(), JobQueueError> {
        let mut record = self.jobs.get_mut(&job_id).ok_or(JobQueueError::NotFound(job_id))?;
        match record.status {
            JobStatus::Queued => {
                record.status = JobStatus::Cancelled;
                record.finish_time = Some(Utc::now());
                Ok(())
            }
            JobStatus::InProgress => Err(JobQueueError::InProgressConflict(job_id)),
            JobStatus::Complete | JobStatus::Failed | JobStatus::Cancelled => Err(JobQueueError::AlreadyComplete(job_id)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::OrchestratorConfig;
    use crate::event_bus::EventBus;
    use crate::hitl::CaptchaTaskManager;
    use crate::tier::TierExecutor;
    use crate::ticket_store::InMemoryTicketStore;
    use async_trait::async_trait;

    struct InstantSuccessTier;

    #[async_trait]
    impl TierExecutor for InstantSuccessTier {
        fn name(&self) -> &'static str {
            "instant"
        }
        fn level(&self) -> TierLevel {
            TierLevel::HTTP
        }
        async fn execute(&self, _url: &Url, _options: &FetchOptions) -> TierResult {
            TierResult::success(TierLevel::HTTP, "ok", 200)
        }
    }

    struct NeverReturnsTier;

    #[async_trait]
    impl TierExecutor for NeverReturnsTier {
        fn name(&self) -> &'static str {
            "stuck"
        }
        fn level(&self) -> TierLevel {
            TierLevel::HTTP
        }
        async fn execute(&self, _url: &Url, _options: &FetchOptions) -> TierResult {
            std::future::pending::<()>().await;
            unreachable!()
        }
    }

    fn orchestrator_with(tier: Arc<dyn TierExecutor>) -> Arc<Orchestrator> {
        let event_bus = Arc::new(EventBus::new());
        let ticket_store: Arc<dyn crate::ticket_store::TicketStore> = Arc::new(InMemoryTicketStore::new());
        let task_manager = Arc::new(CaptchaTaskManager::new(event_bus.clone(), ticket_store.clone(), Duration::from_secs(600), Duration::from_secs(1800)));
        Arc::new(Orchestrator::new(vec![tier], OrchestratorConfig::default(), ticket_store, event_bus, task_manager, None))
    }

    #[tokio::test]
    async fn enqueued_job_completes_and_is_retrievable() {
        let orchestrator = orchestrator_with(Arc::new(InstantSuccessTier));
        let queue = JobQueue::start(orchestrator, 2, Duration::from_secs(5));
        let request = FetchRequest::new(Url::parse("https://example.com/").unwrap(), Strategy::RequestOnly);
        let job_id = queue.enqueue(request);

        for _ in 0..50 {
            if queue.status(job_id).unwrap() == JobStatus::Complete {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        assert_eq!(queue.status(job_id).unwrap(), JobStatus::Complete);
        let result = queue.result(job_id).unwrap().unwrap();
        assert!(result.success);
    }

    #[tokio::test]
    async fn cancel_queued_job_succeeds() {
        // Zero workers: the job never leaves `queued`, letting us exercise
        // cancel's queued-only success path deterministically.
        let orchestrator = orchestrator_with(Arc::new(InstantSuccessTier));
        let (sender, _receiver) = mpsc::unbounded_channel::<WorkItem>();
        let jobs: Arc<DashMap<Uuid, JobRecord>> = Arc::new(DashMap::new());
        let queue = JobQueue { jobs, sender };
        let _ = orchestrator;
        let request = FetchRequest::new(Url::parse("https://example.com/").unwrap(), Strategy::RequestOnly);
        let job_id = queue.enqueue(request);
        queue.cancel(job_id).unwrap();
        assert_eq!(queue.status(job_id).unwrap(), JobStatus::Cancelled);
    }

    #[tokio::test]
    async fn job_exceeding_timeout_is_marked_failed() {
        let orchestrator = orchestrator_with(Arc::new(NeverReturnsTier));
        let queue = JobQueue::start(orchestrator, 1, Duration::from_millis(30));
        let request = FetchRequest::new(Url::parse("https://example.com/").unwrap(), Strategy::RequestOnly);
        let job_id = queue.enqueue(request);

        for _ in 0..50 {
            if queue.status(job_id).unwrap() == JobStatus::Failed {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        assert_eq!(queue.status(job_id).unwrap(), JobStatus::Failed);
        let result = queue.result(job_id).unwrap().unwrap();
        assert_eq!(result.error_type, ErrorType::Timeout);
    }

    #[tokio::test]
    async fn cancel_in_progress_job_conflicts() {
        let orchestrator = orchestrator_with(Arc::new(NeverReturnsTier));
        let queue = JobQueue::start(orchestrator, 1, Duration::from_secs(5));
        let request = FetchRequest::new(Url::parse("https://example.com/").unwrap(), Strategy::RequestOnly);
        let job_id = queue.enqueue(request);

        for _ in 0..50 {
            if queue.status(job_id).unwrap() == JobStatus::InProgress {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        let result = queue.cancel(job_id);
        assert!(matches!(result, Err(JobQueueError::InProgressConflict(_))));
    }
}
