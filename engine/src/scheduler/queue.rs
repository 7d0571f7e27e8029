//! Durable deployment queue.
//!
//! Every job is a JSON file: enqueued under `queue/pending/`, moved to
//! `queue/claimed/` while a worker runs it, deleted on ack. File names
//! carry a monotonic sequence number so recovery preserves enqueue order.
//! A claimed file found at startup is redelivered exactly once (marked in
//! the file name); found a second time it is reported as crashed instead,
//! so no job is ever lost silently.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::{Mutex, Semaphore};
use tracing::{debug, info, warn};

use crate::errors::EngineError;
use crate::filesys::dir::Dir;
use crate::models::job::DeploymentJob;

const RETRY_MARKER: &str = ".retry.json";

/// A claimed queue entry
#[derive(Debug)]
pub struct QueuedJob {
    pub job: DeploymentJob,
    /// Whether this entry was already redelivered after a crash
    pub redelivered: bool,
    file_name: String,
}

/// File-backed FIFO queue of deployment jobs
pub struct DurableQueue {
    pending_dir: Dir,
    claimed_dir: Dir,
    pending: Mutex<VecDeque<QueuedJob>>,
    available: Semaphore,
    seq: AtomicU64,
}

impl DurableQueue {
    /// Open the queue directories, creating them as needed
    pub async fn open(pending_dir: Dir, claimed_dir: Dir) -> Result<Self, EngineError> {
        pending_dir.create().await?;
        claimed_dir.create().await?;

        Ok(Self {
            pending_dir,
            claimed_dir,
            pending: Mutex::new(VecDeque::new()),
            available: Semaphore::new(0),
            seq: AtomicU64::new(1),
        })
    }

    /// Reload persisted jobs after a restart.
    ///
    /// Claimed-but-unacked jobs are requeued once; jobs that already used
    /// their redelivery are returned so the caller can mark them failed.
    /// Must run before workers start claiming.
    pub async fn recover(&self) -> Result<Vec<DeploymentJob>, EngineError> {
        let mut crashed = Vec::new();

        // Claimed files: redeliver or report
        for path in self.claimed_dir.list_files().await? {
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            let file = self.claimed_dir.file(name);

            if name.ends_with(RETRY_MARKER) {
                match file.read_json::<DeploymentJob>().await {
                    Ok(job) => {
                        warn!("Job {} crashed twice, giving up", job.job_id);
                        crashed.push(job);
                    }
                    Err(e) => warn!("Dropping unreadable claimed entry {}: {}", name, e),
                }
                file.delete().await?;
            } else {
                let retry_name = name.replace(".json", RETRY_MARKER);
                info!("Requeueing interrupted job file {} once", name);
                tokio::fs::rename(&path, self.pending_dir.path().join(&retry_name)).await?;
            }
        }

        // Pending files, in sequence order
        let mut queue = self.pending.lock().await;
        let mut max_seq = 0u64;
        for path in self.pending_dir.list_files().await? {
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            let file = self.pending_dir.file(name);
            let job = match file.read_json::<DeploymentJob>().await {
                Ok(job) => job,
                Err(e) => {
                    warn!("Dropping unreadable queue entry {}: {}", name, e);
                    file.delete().await?;
                    continue;
                }
            };

            if let Some(seq) = parse_seq(name) {
                max_seq = max_seq.max(seq);
            }
            queue.push_back(QueuedJob {
                job,
                redelivered: name.ends_with(RETRY_MARKER),
                file_name: name.to_string(),
            });
            self.available.add_permits(1);
        }
        drop(queue);

        self.seq.store(max_seq + 1, Ordering::SeqCst);
        Ok(crashed)
    }

    /// Persist and enqueue a job
    pub async fn enqueue(&self, job: DeploymentJob) -> Result<(), EngineError> {
        let seq = self.seq.fetch_add(1, Ordering::SeqCst);
        let file_name = format!("{:020}-{}.json", seq, job.job_id);

        let contents = serde_json::to_vec_pretty(&job)?;
        self.pending_dir
            .file(&file_name)
            .write_atomic(&contents)
            .await?;

        debug!("Enqueued job {} as {}", job.job_id, file_name);
        self.pending.lock().await.push_back(QueuedJob {
            job,
            redelivered: false,
            file_name,
        });
        self.available.add_permits(1);
        Ok(())
    }

    /// Claim the next job, waiting until one is available. The entry's
    /// file moves to the claimed directory until `ack`.
    pub async fn claim(&self) -> Result<QueuedJob, EngineError> {
        self.claim_with(|_| ()).await.map(|(entry, _)| entry)
    }

    /// Like `claim`, but runs `on_claim` while the queue lock is still
    /// held. This is the scheduler's ordering point: enrolling the job in
    /// the concurrency guard here means same-resource jobs take their
    /// leases in claim order even across racing workers.
    pub async fn claim_with<T>(
        &self,
        on_claim: impl FnOnce(&DeploymentJob) -> T,
    ) -> Result<(QueuedJob, T), EngineError> {
        loop {
            let permit = self
                .available
                .acquire()
                .await
                .map_err(|_| EngineError::QueueError("queue closed".to_string()))?;
            permit.forget();

            let mut pending = self.pending.lock().await;
            let Some(entry) = pending.pop_front() else {
                // Its job was cancelled between notify and claim
                drop(pending);
                continue;
            };

            tokio::fs::rename(
                self.pending_dir.path().join(&entry.file_name),
                self.claimed_dir.path().join(&entry.file_name),
            )
            .await?;

            let token = on_claim(&entry.job);
            drop(pending);
            return Ok((entry, token));
        }
    }

    /// Acknowledge a finished job, removing its durable entry
    pub async fn ack(&self, entry: &QueuedJob) -> Result<(), EngineError> {
        self.claimed_dir.file(&entry.file_name).delete().await
    }

    /// Remove a still-pending job. Returns false if the job was already
    /// claimed (or never queued).
    pub async fn cancel(&self, job_id: &str) -> Result<bool, EngineError> {
        let mut queue = self.pending.lock().await;
        let Some(pos) = queue.iter().position(|e| e.job.job_id == job_id) else {
            return Ok(false);
        };

        let entry = queue.remove(pos).expect("position just found");
        drop(queue);

        self.pending_dir.file(&entry.file_name).delete().await?;
        debug!("Cancelled pending job {}", job_id);
        Ok(true)
    }

    /// Whether any pending job targets the given resource
    pub async fn has_pending_for(&self, resource_id: &str) -> bool {
        self.pending
            .lock()
            .await
            .iter()
            .any(|e| e.job.resource_id == resource_id)
    }

    /// Number of jobs waiting to be claimed
    pub async fn len(&self) -> usize {
        self.pending.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

fn parse_seq(file_name: &str) -> Option<u64> {
    file_name.split('-').next()?.parse().ok()
}
