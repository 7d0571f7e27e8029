//! Deployment log and status store.
//!
//! Per job: an append-only sequence of log lines plus a terminal status set
//! exactly once. Subscribers always replay from offset 0 and then tail live
//! lines until the job reaches a terminal state. Lines are also appended to
//! a per-job file under the storage layout, best-effort, and replayed from
//! that file when the job is registered again after a restart.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::{broadcast, mpsc, Mutex, RwLock};
use tracing::{debug, warn};

use crate::errors::EngineError;
use crate::filesys::dir::Dir;
use crate::models::job::{JobStatus, LogRecord};

const BROADCAST_CAPACITY: usize = 1024;

#[derive(Debug, Clone)]
enum LogEvent {
    Line(LogRecord),
    Terminal,
}

struct JobRecord {
    resource_id: String,
    lines: Vec<LogRecord>,
    status: JobStatus,
    error: Option<String>,
    events: broadcast::Sender<LogEvent>,
}

/// Store for per-job deployment logs and terminal status
pub struct DeploymentLogStore {
    jobs: RwLock<HashMap<String, Arc<Mutex<JobRecord>>>>,
    persist_dir: Option<Dir>,
}

impl DeploymentLogStore {
    pub fn new() -> Self {
        Self {
            jobs: RwLock::new(HashMap::new()),
            persist_dir: None,
        }
    }

    /// Also append log lines to `<dir>/<job_id>.log`
    pub fn with_persistence(dir: Dir) -> Self {
        Self {
            jobs: RwLock::new(HashMap::new()),
            persist_dir: Some(dir),
        }
    }

    /// Register a job in `Queued` state, replaying any lines a previous
    /// process persisted for it. Idempotent for the same job id.
    pub async fn register(&self, job_id: &str, resource_id: &str) {
        {
            let jobs = self.jobs.read().await;
            if jobs.contains_key(job_id) {
                return;
            }
        }

        // Loaded outside the write lock; a concurrent registration wins below
        let lines = self.load_persisted(job_id).await;

        let mut jobs = self.jobs.write().await;
        jobs.entry(job_id.to_string()).or_insert_with(|| {
            let (events, _) = broadcast::channel(BROADCAST_CAPACITY);
            Arc::new(Mutex::new(JobRecord {
                resource_id: resource_id.to_string(),
                lines,
                status: JobStatus::Queued,
                error: None,
                events,
            }))
        });
    }

    /// Lines written to the per-job file by an earlier process
    async fn load_persisted(&self, job_id: &str) -> Vec<LogRecord> {
        let Some(dir) = &self.persist_dir else {
            return Vec::new();
        };
        let file = dir.file(&format!("{}.log", job_id));
        if !file.exists().await {
            return Vec::new();
        }

        let contents = match file.read_string().await {
            Ok(contents) => contents,
            Err(e) => {
                warn!("Could not replay persisted log for {}: {}", job_id, e);
                return Vec::new();
            }
        };

        contents
            .lines()
            .filter_map(|raw| {
                let (timestamp, line) = raw.split_once(' ')?;
                let timestamp = DateTime::parse_from_rfc3339(timestamp).ok()?;
                Some(LogRecord {
                    timestamp: timestamp.with_timezone(&Utc),
                    line: line.to_string(),
                })
            })
            .collect()
    }

    async fn record(&self, job_id: &str) -> Result<Arc<Mutex<JobRecord>>, EngineError> {
        self.jobs
            .read()
            .await
            .get(job_id)
            .cloned()
            .ok_or_else(|| EngineError::NotFound(format!("job {}", job_id)))
    }

    /// Append one line to a job's log
    pub async fn append(&self, job_id: &str, line: impl Into<String>) -> Result<(), EngineError> {
        let record = self.record(job_id).await?;
        let entry = LogRecord {
            timestamp: Utc::now(),
            line: line.into(),
        };

        {
            let mut record = record.lock().await;
            record.lines.push(entry.clone());
            let _ = record.events.send(LogEvent::Line(entry.clone()));
        }

        if let Some(dir) = &self.persist_dir {
            let file = dir.file(&format!("{}.log", job_id));
            let rendered = format!("{} {}", entry.timestamp.to_rfc3339(), entry.line);
            if let Err(e) = file.append_line(&rendered).await {
                warn!("Failed to persist log line for {}: {}", job_id, e);
            }
        }

        Ok(())
    }

    /// Set a job's status. Transitions are restricted to
    /// `queued -> running -> {done, error}`; terminal states are immutable
    /// and a second terminal write is an error.
    pub async fn set_status(
        &self,
        job_id: &str,
        status: JobStatus,
        error: Option<String>,
    ) -> Result<(), EngineError> {
        let record = self.record(job_id).await?;
        let mut record = record.lock().await;

        if !record.status.can_transition_to(status) {
            return Err(EngineError::StorageError(format!(
                "illegal status transition {:?} -> {:?} for job {}",
                record.status, status, job_id
            )));
        }

        debug!("Job {} status {:?} -> {:?}", job_id, record.status, status);
        record.status = status;
        record.error = error;

        if status.is_terminal() {
            let _ = record.events.send(LogEvent::Terminal);
        }
        Ok(())
    }

    /// Current status and error message of a job
    pub async fn status(&self, job_id: &str) -> Option<(JobStatus, Option<String>)> {
        let record = self.jobs.read().await.get(job_id).cloned()?;
        let record = record.lock().await;
        Some((record.status, record.error.clone()))
    }

    /// Snapshot of a job's log lines
    pub async fn lines(&self, job_id: &str) -> Result<Vec<LogRecord>, EngineError> {
        let record = self.record(job_id).await?;
        let record = record.lock().await;
        Ok(record.lines.clone())
    }

    /// Job ids recorded for a resource, most-recently-registered unordered
    pub async fn jobs_for_resource(&self, resource_id: &str) -> Vec<String> {
        let jobs = self.jobs.read().await;
        let mut ids = Vec::new();
        for (job_id, record) in jobs.iter() {
            if record.lock().await.resource_id == resource_id {
                ids.push(job_id.clone());
            }
        }
        ids
    }

    /// Stream a job's log: replays all existing lines, then tails live
    /// lines. The stream ends once the job is terminal; for a job already
    /// terminal the stream is finite immediately.
    pub async fn stream(&self, job_id: &str) -> Result<mpsc::UnboundedReceiver<LogRecord>, EngineError> {
        let record = self.record(job_id).await?;
        let (tx, rx) = mpsc::unbounded_channel();

        // Snapshot and subscribe under the same lock so no line can slip
        // between the replay and the live tail.
        let (snapshot, terminal, mut events) = {
            let record = record.lock().await;
            (
                record.lines.clone(),
                record.status.is_terminal(),
                record.events.subscribe(),
            )
        };

        tokio::spawn(async move {
            for line in snapshot {
                if tx.send(line).is_err() {
                    return;
                }
            }
            if terminal {
                return;
            }

            loop {
                match events.recv().await {
                    Ok(LogEvent::Line(line)) => {
                        if tx.send(line).is_err() {
                            return;
                        }
                    }
                    Ok(LogEvent::Terminal) => return,
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => return,
                }
            }
        });

        Ok(rx)
    }
}

impl Default for DeploymentLogStore {
    fn default() -> Self {
        Self::new()
    }
}
