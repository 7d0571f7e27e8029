//! Deployment job models

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::models::resource::ResourceKind;

/// What the job does to its resource
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobType {
    /// First-time or routine deployment
    Deploy,

    /// Rebuild from source and deploy again
    Redeploy,

    /// Stop the running containers, keep them around
    Stop,

    /// Start previously stopped containers
    Start,
}

impl JobType {
    /// Whether the job needs the source resolved and the compose document
    /// transformed. Stop/start act on the compose project name alone.
    pub fn needs_source(&self) -> bool {
        matches!(self, JobType::Deploy | JobType::Redeploy)
    }
}

/// A deployment request, immutable once enqueued and consumed exactly once
/// by a worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeploymentJob {
    /// Unique job ID, assigned at enqueue time
    pub job_id: String,

    /// Resource this job targets
    pub resource_id: String,

    pub resource_kind: ResourceKind,

    pub job_type: JobType,

    /// Human-readable title for the deployment log (e.g. "Manual deployment")
    pub title_log: String,

    /// Free-form description for the deployment log
    #[serde(default)]
    pub description_log: String,

    /// Target server; None means the local Docker host
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_id: Option<String>,

    pub created_at: DateTime<Utc>,
}

impl DeploymentJob {
    pub fn new(
        resource_id: impl Into<String>,
        resource_kind: ResourceKind,
        job_type: JobType,
        title_log: impl Into<String>,
    ) -> Self {
        Self {
            job_id: crate::utils::generate_uuid(),
            resource_id: resource_id.into(),
            resource_kind,
            job_type,
            title_log: title_log.into(),
            description_log: String::new(),
            server_id: None,
            created_at: Utc::now(),
        }
    }

    pub fn with_server(mut self, server_id: impl Into<String>) -> Self {
        self.server_id = Some(server_id.into());
        self
    }
}

/// Job status state machine: `Queued -> Running -> {Done, Error}`.
/// Terminal states are immutable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Queued,
    Running,
    Done,
    Error,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Done | JobStatus::Error)
    }

    /// Whether `next` is a legal transition from this state
    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        match (self, next) {
            (JobStatus::Queued, JobStatus::Running) => true,
            // Cancelled-before-claim jobs go straight to error
            (JobStatus::Queued, JobStatus::Error) => true,
            (JobStatus::Running, JobStatus::Done) => true,
            (JobStatus::Running, JobStatus::Error) => true,
            _ => false,
        }
    }
}

/// One line of a job's append-only deployment log
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogRecord {
    pub timestamp: DateTime<Utc>,
    pub line: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_transitions() {
        assert!(JobStatus::Queued.can_transition_to(JobStatus::Running));
        assert!(JobStatus::Running.can_transition_to(JobStatus::Done));
        assert!(JobStatus::Running.can_transition_to(JobStatus::Error));
        assert!(!JobStatus::Done.can_transition_to(JobStatus::Running));
        assert!(!JobStatus::Error.can_transition_to(JobStatus::Done));
        assert!(!JobStatus::Done.can_transition_to(JobStatus::Error));
    }

    #[test]
    fn test_needs_source() {
        assert!(JobType::Deploy.needs_source());
        assert!(JobType::Redeploy.needs_source());
        assert!(!JobType::Stop.needs_source());
        assert!(!JobType::Start.needs_source());
    }
}
