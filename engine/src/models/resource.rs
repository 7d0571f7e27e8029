//! Deployable resource models

use serde::{Deserialize, Serialize};

/// Whether a resource is a multi-service stack or a single Swarm service
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceKind {
    /// Multi-service unit described by a compose document
    Stack,

    /// Single container/process unit managed as a Swarm service
    Service,
}

/// Git provider the source lives on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GitProviderKind {
    Github,
    Gitlab,
    Bitbucket,
    Gitea,
    Custom,
}

/// Format of an inline compose document
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ComposeFormat {
    #[default]
    Yaml,
    Toml,
}

/// Where the deployable artifact comes from
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ComposeSource {
    /// A git-hosted compose project, checked out on demand
    Git {
        provider: GitProviderKind,

        /// Clone URL, credentials embedded by the persistence collaborator
        repo_url: String,

        /// Branch, tag or commit to check out
        reference: String,

        /// Path of the compose file inside the repository
        #[serde(default = "default_compose_path")]
        compose_path: String,
    },

    /// An inline compose document stored with the resource
    RawCompose {
        content: String,

        #[serde(default)]
        format: ComposeFormat,
    },
}

fn default_compose_path() -> String {
    "docker-compose.yml".to_string()
}

/// A domain routed to one service of the resource.
///
/// Host uniqueness is enforced by the collaborator creating bindings; the
/// transformer never drops a binding it cannot render.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DomainBinding {
    /// Hostname to match (e.g. "app.example.com")
    pub host: String,

    /// Container port the proxy forwards to
    pub port: u16,

    /// Optional path prefix to match
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,

    /// Compose service the traffic is routed to
    pub service_name: String,

    /// Optional ACME cert resolver name for TLS
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cert_resolver: Option<String>,
}

/// A stack or service registered for deployment.
///
/// Owned by a project; the orchestration core reads it through the resource
/// store and never mutates it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeployableResource {
    /// Unique resource ID
    pub id: String,

    /// Owning project
    pub project_id: String,

    /// Owning organization
    pub organization_id: String,

    /// Compose project name, also used for working directory isolation
    pub app_name: String,

    pub kind: ResourceKind,

    pub source: ComposeSource,

    /// Target server; None means the local Docker host
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_id: Option<String>,

    /// Domains routed to this resource
    #[serde(default)]
    pub domains: Vec<DomainBinding>,

    /// Active flag maintained by the billing/webhook collaborator. The
    /// engine refuses to bring up inactive resources but never computes
    /// this flag itself.
    #[serde(default = "default_true")]
    pub active: bool,

    /// Isolation suffix for preview/parallel deployments. Set by the
    /// collaborator that created the preview, so the compose transform
    /// stays deterministic.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub isolation_suffix: Option<String>,
}

fn default_true() -> bool {
    true
}

impl DeployableResource {
    /// Compose project name for this deployment, suffix included when the
    /// resource is an isolated preview.
    pub fn project_name(&self) -> String {
        match &self.isolation_suffix {
            Some(suffix) => format!("{}-{}", self.app_name, suffix),
            None => self.app_name.clone(),
        }
    }
}
