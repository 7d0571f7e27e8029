//! Deployment scheduler.
//!
//! The scheduler ties the durable queue, the per-resource concurrency guard
//! and the log store to a pool of workers. Callers enqueue jobs and observe
//! them through status and log streams; a job's failure is never surfaced
//! as an error from `enqueue`.

pub mod guard;
pub mod queue;
mod worker;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::errors::EngineError;
use crate::exec::channel::{ExecutionChannel, ExecutionTarget};
use crate::models::job::{DeploymentJob, JobStatus, LogRecord};
use crate::scheduler::guard::ConcurrencyGuard;
use crate::scheduler::queue::DurableQueue;
use crate::storage::layout::StorageLayout;
use crate::storage::settings::Settings;
use crate::store::logstore::DeploymentLogStore;
use crate::store::resources::ResourceStore;

/// Opens an execution channel for a resolved target. Swappable so embedders
/// and tests can script command outcomes without a Docker engine.
pub type ChannelFactory =
    Arc<dyn Fn(&ExecutionTarget) -> Arc<dyn ExecutionChannel> + Send + Sync>;

pub(crate) struct SchedulerInner {
    pub(crate) settings: Settings,
    pub(crate) layout: StorageLayout,
    pub(crate) queue: DurableQueue,
    pub(crate) guard: ConcurrencyGuard,
    pub(crate) logs: Arc<DeploymentLogStore>,
    pub(crate) resources: Arc<dyn ResourceStore>,
    pub(crate) channel_factory: ChannelFactory,
    cancellations: Mutex<HashMap<String, Arc<AtomicBool>>>,
}

impl SchedulerInner {
    /// Get-or-create the cancellation flag for a job. Shared between the
    /// worker running the job and `Scheduler::cancel`, so neither side can
    /// miss a request that races the claim.
    pub(crate) fn cancellation_flag(&self, job_id: &str) -> Arc<AtomicBool> {
        let mut map = self.cancellations.lock().unwrap_or_else(|e| e.into_inner());
        map.entry(job_id.to_string())
            .or_insert_with(|| Arc::new(AtomicBool::new(false)))
            .clone()
    }

    pub(crate) fn clear_cancellation(&self, job_id: &str) {
        let mut map = self.cancellations.lock().unwrap_or_else(|e| e.into_inner());
        map.remove(job_id);
    }
}

/// Queue-backed deployment scheduler
pub struct Scheduler {
    inner: Arc<SchedulerInner>,
    shutdown: broadcast::Sender<()>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl Scheduler {
    /// Build a scheduler executing over real local/SSH channels
    pub async fn new(
        settings: Settings,
        layout: StorageLayout,
        resources: Arc<dyn ResourceStore>,
    ) -> Result<Self, EngineError> {
        Self::with_channel_factory(
            settings,
            layout,
            resources,
            Arc::new(|target: &ExecutionTarget| target.channel()),
        )
        .await
    }

    /// Build a scheduler with a custom channel factory
    pub async fn with_channel_factory(
        settings: Settings,
        layout: StorageLayout,
        resources: Arc<dyn ResourceStore>,
        channel_factory: ChannelFactory,
    ) -> Result<Self, EngineError> {
        layout.setup().await?;

        let queue =
            DurableQueue::open(layout.queue_pending_dir(), layout.queue_claimed_dir()).await?;
        let guard = ConcurrencyGuard::new(Duration::from_secs(settings.lease_timeout_secs));
        let logs = Arc::new(DeploymentLogStore::with_persistence(layout.logs_dir()));
        let (shutdown, _) = broadcast::channel(1);

        Ok(Self {
            inner: Arc::new(SchedulerInner {
                settings,
                layout,
                queue,
                guard,
                logs,
                resources,
                channel_factory,
                cancellations: Mutex::new(HashMap::new()),
            }),
            shutdown,
            handles: Mutex::new(Vec::new()),
        })
    }

    /// Recover persisted queue state and start the worker pool.
    ///
    /// A job found claimed-but-unacked is requeued once; one that already
    /// used its redelivery is marked failed here instead of being retried
    /// forever.
    pub async fn start(&self) -> Result<(), EngineError> {
        let crashed = self.inner.queue.recover().await?;
        for job in crashed {
            self.inner.logs.register(&job.job_id, &job.resource_id).await;
            let _ = self
                .inner
                .logs
                .append(&job.job_id, "Interrupted twice by engine restarts, giving up")
                .await;
            if let Err(e) = self
                .inner
                .logs
                .set_status(
                    &job.job_id,
                    JobStatus::Error,
                    Some("interrupted by engine restart".to_string()),
                )
                .await
            {
                warn!("Could not mark crashed job {} failed: {}", job.job_id, e);
            }
        }

        let workers = self.inner.settings.concurrency.max(1);
        let mut handles = self.handles.lock().unwrap_or_else(|e| e.into_inner());
        for worker_id in 0..workers {
            handles.push(tokio::spawn(worker::run_worker(
                worker_id,
                self.inner.clone(),
                self.shutdown.subscribe(),
            )));
        }
        handles.push(tokio::spawn(reap_leases(
            self.inner.clone(),
            self.shutdown.subscribe(),
        )));

        info!("Scheduler started with {} workers", workers);
        Ok(())
    }

    /// Queue a job, returning its id. The job's own outcome is observed
    /// through `status` and `stream_log`, never through this call.
    pub async fn enqueue(&self, job: DeploymentJob) -> Result<String, EngineError> {
        let job_id = job.job_id.clone();
        self.inner.logs.register(&job_id, &job.resource_id).await;
        let _ = self
            .inner
            .logs
            .append(&job_id, format!("Queued: {}", job.title_log))
            .await;
        self.inner.queue.enqueue(job).await?;
        Ok(job_id)
    }

    /// Cancel a job. A still-pending job is removed from the queue and
    /// marked failed immediately; a running job is asked to stop at its
    /// next phase boundary. Returns false for unknown or finished jobs.
    pub async fn cancel(&self, job_id: &str) -> Result<bool, EngineError> {
        if self.inner.queue.cancel(job_id).await? {
            let _ = self
                .inner
                .logs
                .append(job_id, "Cancelled before a worker picked it up")
                .await;
            self.inner
                .logs
                .set_status(job_id, JobStatus::Error, Some(EngineError::Cancelled.to_string()))
                .await?;
            return Ok(true);
        }

        match self.inner.logs.status(job_id).await {
            Some((status, _)) if !status.is_terminal() => {
                self.inner
                    .cancellation_flag(job_id)
                    .store(true, Ordering::SeqCst);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    /// Whether a job for this resource is queued, waiting or running
    pub async fn is_in_flight(&self, resource_id: &str) -> bool {
        self.inner.guard.is_in_flight(resource_id)
            || self.inner.queue.has_pending_for(resource_id).await
    }

    /// Current status and error message of a job
    pub async fn status(&self, job_id: &str) -> Option<(JobStatus, Option<String>)> {
        self.inner.logs.status(job_id).await
    }

    /// Snapshot of a job's log lines
    pub async fn log_lines(&self, job_id: &str) -> Result<Vec<LogRecord>, EngineError> {
        self.inner.logs.lines(job_id).await
    }

    /// Stream a job's log: full replay, then live tail until terminal
    pub async fn stream_log(
        &self,
        job_id: &str,
    ) -> Result<mpsc::UnboundedReceiver<LogRecord>, EngineError> {
        self.inner.logs.stream(job_id).await
    }

    /// Job ids recorded for a resource
    pub async fn jobs_for_resource(&self, resource_id: &str) -> Vec<String> {
        self.inner.logs.jobs_for_resource(resource_id).await
    }

    /// Stop claiming new jobs and wait for workers to finish their current
    /// job. Jobs left claimed are redelivered on the next `start`.
    pub async fn shutdown(&self) {
        let _ = self.shutdown.send(());
        let handles: Vec<_> = {
            let mut handles = self.handles.lock().unwrap_or_else(|e| e.into_inner());
            handles.drain(..).collect()
        };
        for handle in handles {
            let _ = handle.await;
        }
    }
}

/// Periodically reclaim leases whose holder exceeded the timeout and force
/// the orphaned jobs to a terminal error. A reclaimed job is never resumed.
async fn reap_leases(inner: Arc<SchedulerInner>, mut shutdown: broadcast::Receiver<()>) {
    let period = Duration::from_secs((inner.settings.lease_timeout_secs / 4).max(1));

    loop {
        tokio::select! {
            _ = shutdown.recv() => return,
            _ = tokio::time::sleep(period) => {}
        }

        for (resource_id, job_id) in inner.guard.reclaim_expired() {
            let _ = inner
                .logs
                .append(&job_id, format!("Lease on {} expired, job abandoned", resource_id))
                .await;
            if let Err(e) = inner
                .logs
                .set_status(
                    &job_id,
                    JobStatus::Error,
                    Some(EngineError::LeaseTimeout(resource_id.clone()).to_string()),
                )
                .await
            {
                warn!("Could not mark reclaimed job {} failed: {}", job_id, e);
            }
        }
    }
}
