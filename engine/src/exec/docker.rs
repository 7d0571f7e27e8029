//! Docker operations over an execution channel.
//!
//! One method per operation; every method streams command output to an
//! optional deployment log sink. Engine rejections surface as
//! `ExecutionFailed` with stderr preserved and are never retried here.

use std::path::Path;
use std::sync::Arc;

use serde::Deserialize;
use tracing::{info, warn};

use crate::errors::EngineError;
use crate::exec::channel::{CommandOutput, CommandSpec, ExecutionChannel, LogSink};

/// What `prune` removes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PruneKind {
    Images,
    Volumes,
    Containers,
    Builder,
    All,
}

/// A volume mount attached to a running container
#[derive(Debug, Clone, Deserialize)]
pub struct MountInfo {
    #[serde(rename = "Type")]
    pub mount_type: String,

    #[serde(rename = "Name", default)]
    pub name: Option<String>,

    #[serde(rename = "Source", default)]
    pub source: String,

    #[serde(rename = "Destination")]
    pub destination: String,
}

/// Docker executor bound to one execution target
pub struct DockerExecutor {
    channel: Arc<dyn ExecutionChannel>,
}

impl DockerExecutor {
    pub fn new(channel: Arc<dyn ExecutionChannel>) -> Self {
        Self { channel }
    }

    async fn run(
        &self,
        spec: CommandSpec,
        sink: Option<&LogSink>,
    ) -> Result<CommandOutput, EngineError> {
        if let Some(sink) = sink {
            let _ = sink.send(format!("$ {}", spec.display()));
        }
        let output = self.channel.exec(&spec, sink.cloned()).await?;
        output.into_result()
    }

    /// Bring a compose project up from a rendered compose file.
    ///
    /// Images are pulled first; a failed pull is tolerated since services
    /// may use locally built images, but `up` itself must succeed.
    pub async fn up(
        &self,
        project: &str,
        compose_file: &Path,
        sink: Option<&LogSink>,
    ) -> Result<(), EngineError> {
        let file = compose_file.to_string_lossy().into_owned();

        info!("Bringing up compose project {}", project);

        let pull = CommandSpec::new("docker").args([
            "compose",
            "-p",
            project,
            "-f",
            file.as_str(),
            "pull",
        ]);
        if let Some(sink) = sink {
            let _ = sink.send(format!("$ {}", pull.display()));
        }
        let pull_output = self.channel.exec(&pull, sink.cloned()).await?;
        if !pull_output.success() {
            warn!(
                "Image pull for {} failed, continuing with local images",
                project
            );
            if let Some(sink) = sink {
                let _ = sink.send("Image pull failed, using local images".to_string());
            }
        }

        let up = CommandSpec::new("docker").args([
            "compose",
            "-p",
            project,
            "-f",
            file.as_str(),
            "up",
            "-d",
            "--remove-orphans",
        ]);
        self.run(up, sink).await?;
        Ok(())
    }

    /// Tear a compose project down, optionally removing its volumes
    pub async fn down(
        &self,
        project: &str,
        remove_volumes: bool,
        sink: Option<&LogSink>,
    ) -> Result<(), EngineError> {
        let mut spec = CommandSpec::new("docker").args(["compose", "-p", project, "down"]);
        if remove_volumes {
            spec = spec.arg("--volumes");
        }
        self.run(spec, sink).await?;
        Ok(())
    }

    /// Stop a compose project's containers without removing them
    pub async fn stop(&self, project: &str, sink: Option<&LogSink>) -> Result<(), EngineError> {
        let spec = CommandSpec::new("docker").args(["compose", "-p", project, "stop"]);
        self.run(spec, sink).await?;
        Ok(())
    }

    /// Start a compose project's previously stopped containers
    pub async fn start(&self, project: &str, sink: Option<&LogSink>) -> Result<(), EngineError> {
        let spec = CommandSpec::new("docker").args(["compose", "-p", project, "start"]);
        self.run(spec, sink).await?;
        Ok(())
    }

    /// Create a single Swarm service
    pub async fn service_create(
        &self,
        name: &str,
        image: &str,
        sink: Option<&LogSink>,
    ) -> Result<(), EngineError> {
        let spec = CommandSpec::new("docker").args([
            "service",
            "create",
            "--name",
            name,
            "--replicas",
            "1",
            image,
        ]);
        self.run(spec, sink).await?;
        Ok(())
    }

    /// Roll a Swarm service to a new image
    pub async fn service_update(
        &self,
        name: &str,
        image: &str,
        sink: Option<&LogSink>,
    ) -> Result<(), EngineError> {
        let spec =
            CommandSpec::new("docker").args(["service", "update", "--image", image, name]);
        self.run(spec, sink).await?;
        Ok(())
    }

    /// Whether a Swarm service with this name already exists
    pub async fn service_exists(&self, name: &str) -> Result<bool, EngineError> {
        let spec = CommandSpec::new("docker").args([
            "service",
            "inspect",
            name,
            "--format",
            "{{.ID}}",
        ]);
        let output = self.channel.exec(&spec, None).await?;
        Ok(output.success())
    }

    /// Image tag a Swarm service is currently running
    pub async fn service_image_tag(&self, name: &str) -> Result<String, EngineError> {
        let spec = CommandSpec::new("docker").args([
            "service",
            "inspect",
            name,
            "--format",
            "{{.Spec.TaskTemplate.ContainerSpec.Image}}",
        ]);
        let output = self.channel.exec(&spec, None).await?.into_result()?;

        let image = output.stdout.trim();
        let tag = image
            .rsplit(':')
            .next()
            .map(|t| t.split('@').next().unwrap_or(t))
            .filter(|t| !t.is_empty() && !t.contains('/'))
            .ok_or_else(|| {
                EngineError::Internal(format!("could not extract image tag from '{}'", image))
            })?;
        Ok(tag.to_string())
    }

    /// Pull an image
    pub async fn pull(&self, image: &str, sink: Option<&LogSink>) -> Result<(), EngineError> {
        let spec = CommandSpec::new("docker").args(["pull", image]);
        self.run(spec, sink).await?;
        Ok(())
    }

    /// Prune unused Docker resources
    pub async fn prune(&self, kind: PruneKind, sink: Option<&LogSink>) -> Result<(), EngineError> {
        let commands: Vec<Vec<&str>> = match kind {
            PruneKind::Images => vec![vec!["image", "prune", "--force"]],
            PruneKind::Volumes => vec![vec!["volume", "prune", "--force"]],
            PruneKind::Containers => vec![vec!["container", "prune", "--force"]],
            PruneKind::Builder => vec![vec!["builder", "prune", "--force"]],
            PruneKind::All => vec![
                vec!["image", "prune", "--force"],
                vec!["volume", "prune", "--force"],
                vec!["container", "prune", "--force"],
                vec!["system", "prune", "--force", "--volumes"],
                vec!["builder", "prune", "--force"],
            ],
        };

        for args in commands {
            self.run(CommandSpec::new("docker").args(args), sink).await?;
        }
        Ok(())
    }

    /// Volume mounts of one running service container (read-only, used by
    /// callers to show persisted volumes)
    pub async fn inspect_mounts(
        &self,
        project: &str,
        service: &str,
    ) -> Result<Vec<MountInfo>, EngineError> {
        let ps = CommandSpec::new("docker").args([
            "ps",
            "-q",
            "--filter",
            &format!("label=com.docker.compose.project={}", project),
            "--filter",
            &format!("label=com.docker.compose.service={}", service),
        ]);
        let output = self.channel.exec(&ps, None).await?.into_result()?;

        let container_id = output
            .stdout
            .lines()
            .next()
            .map(str::trim)
            .filter(|id| !id.is_empty())
            .ok_or_else(|| {
                EngineError::NotFound(format!(
                    "no running container for service {} in project {}",
                    service, project
                ))
            })?
            .to_string();

        let inspect = CommandSpec::new("docker").args([
            "inspect",
            &container_id,
            "--format",
            "{{json .Mounts}}",
        ]);
        let output = self.channel.exec(&inspect, None).await?.into_result()?;

        let mounts: Vec<MountInfo> = serde_json::from_str(output.stdout.trim())?;
        Ok(mounts
            .into_iter()
            .filter(|m| m.mount_type == "volume" && !m.source.is_empty())
            .collect())
    }
}
