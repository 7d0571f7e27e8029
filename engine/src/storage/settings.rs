//! Settings file management

use serde::{Deserialize, Serialize};

use crate::logs::LogLevel;
use crate::models::server::RemoteServer;

/// Engine settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    /// Log level
    #[serde(default)]
    pub log_level: LogLevel,

    /// Worker pool size. Kept small by default so concurrent compose
    /// operations do not contend on a single local Docker engine.
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,

    /// Seconds a concurrency lease may be held before it is reclaimed
    #[serde(default = "default_lease_timeout")]
    pub lease_timeout_secs: u64,

    /// Per-phase timeout for source resolution (git fetch/clone)
    #[serde(default = "default_source_timeout")]
    pub source_timeout_secs: u64,

    /// Per-phase timeout for Docker operations
    #[serde(default = "default_docker_timeout")]
    pub docker_timeout_secs: u64,

    /// Which job types an inactive resource blocks
    #[serde(default)]
    pub inactive_gate: InactiveGate,

    /// Registry settings for the update checker
    #[serde(default)]
    pub registry: RegistrySettings,

    /// Known remote servers, keyed into by `DeployableResource.server_id`
    #[serde(default)]
    pub servers: Vec<RemoteServer>,
}

fn default_concurrency() -> usize {
    2
}

fn default_lease_timeout() -> u64 {
    1800
}

fn default_source_timeout() -> u64 {
    300
}

fn default_docker_timeout() -> u64 {
    900
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            log_level: LogLevel::Info,
            concurrency: default_concurrency(),
            lease_timeout_secs: default_lease_timeout(),
            source_timeout_secs: default_source_timeout(),
            docker_timeout_secs: default_docker_timeout(),
            inactive_gate: InactiveGate::default(),
            registry: RegistrySettings::default(),
            servers: Vec::new(),
        }
    }
}

/// Scope of the inactive/quota gate.
///
/// Billing collaborators disagreed on whether hitting a plan limit blocks
/// only new deployments or also redeploys of existing resources, so the
/// engine honors whichever the operator configures.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum InactiveGate {
    /// Only `deploy` jobs are refused for inactive resources
    #[default]
    DeployOnly,

    /// `deploy` and `redeploy` jobs are refused
    DeployAndRedeploy,
}

impl InactiveGate {
    pub fn blocks(&self, job_type: crate::models::job::JobType) -> bool {
        use crate::models::job::JobType;
        match self {
            InactiveGate::DeployOnly => matches!(job_type, JobType::Deploy),
            InactiveGate::DeployAndRedeploy => {
                matches!(job_type, JobType::Deploy | JobType::Redeploy)
            }
        }
    }
}

/// Registry polled by the update checker
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistrySettings {
    /// Registry base URL
    #[serde(default = "default_registry_url")]
    pub base_url: String,

    /// Repository whose tags are polled
    #[serde(default = "default_registry_repo")]
    pub repository: String,
}

fn default_registry_url() -> String {
    "https://ghcr.io".to_string()
}

fn default_registry_repo() -> String {
    "dockhand/dockhand".to_string()
}

impl Default for RegistrySettings {
    fn default() -> Self {
        Self {
            base_url: default_registry_url(),
            repository: default_registry_repo(),
        }
    }
}
