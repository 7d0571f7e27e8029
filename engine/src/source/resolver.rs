//! Source resolver.
//!
//! Git-backed resources are checked out through the execution channel, so
//! the working directory is created on the host that will run the
//! containers and is never copied between machines. Failures here are
//! `SourceUnavailable` and are reported, not retried: retrying a bad ref
//! or bad credentials cannot succeed.

use std::path::Path;
use std::sync::Arc;

use tracing::{debug, info};

use crate::compose::ComposeDocument;
use crate::errors::EngineError;
use crate::exec::channel::{CommandSpec, ExecutionChannel, LogSink};
use crate::models::resource::{ComposeFormat, ComposeSource, DeployableResource};

/// Resolves a resource's source into a compose document
pub struct SourceResolver {
    channel: Arc<dyn ExecutionChannel>,
}

impl SourceResolver {
    pub fn new(channel: Arc<dyn ExecutionChannel>) -> Self {
        Self { channel }
    }

    /// Materialize the resource's source under `work_dir` and parse its
    /// compose document.
    pub async fn resolve(
        &self,
        resource: &DeployableResource,
        work_dir: &Path,
        sink: Option<&LogSink>,
    ) -> Result<ComposeDocument, EngineError> {
        match &resource.source {
            ComposeSource::Git {
                repo_url,
                reference,
                compose_path,
                ..
            } => {
                self.checkout(repo_url, reference, work_dir, sink).await?;
                self.read_compose(work_dir, compose_path).await
            }
            ComposeSource::RawCompose { content, format } => {
                debug!("Parsing inline compose for {}", resource.app_name);
                match format {
                    ComposeFormat::Yaml => ComposeDocument::from_yaml_str(content),
                    ComposeFormat::Toml => ComposeDocument::from_toml_str(content),
                }
            }
        }
    }

    /// Idempotent pull-or-clone: reuse an existing clone with a fetch and
    /// forced checkout, clone fresh otherwise. A failed fresh clone removes
    /// the partial directory so nothing half-populated is left behind.
    async fn checkout(
        &self,
        repo_url: &str,
        reference: &str,
        work_dir: &Path,
        sink: Option<&LogSink>,
    ) -> Result<(), EngineError> {
        let dir = work_dir.to_string_lossy().into_owned();

        let probe = CommandSpec::new("git").args([
            "-C",
            dir.as_str(),
            "rev-parse",
            "--is-inside-work-tree",
        ]);
        let is_clone = self
            .channel
            .exec(&probe, None)
            .await
            .map(|out| out.success())
            .unwrap_or(false);

        if is_clone {
            info!("Reusing clone in {}, fetching {}", dir, reference);
            if let Some(sink) = sink {
                let _ = sink.send(format!("Fetching {} from {}", reference, repo_url));
            }

            let fetch = CommandSpec::new("git").args([
                "-C",
                dir.as_str(),
                "fetch",
                "--depth",
                "1",
                "origin",
                reference,
            ]);
            self.git(&fetch, sink).await?;

            let checkout =
                CommandSpec::new("git").args(["-C", dir.as_str(), "checkout", "-f", "FETCH_HEAD"]);
            self.git(&checkout, sink).await?;
        } else {
            info!("Cloning {} ({}) into {}", repo_url, reference, dir);
            if let Some(sink) = sink {
                let _ = sink.send(format!("Cloning {} ({})", repo_url, reference));
            }

            // A stale non-repo directory would make the clone fail
            self.channel.remove_dir(work_dir).await?;

            let clone = CommandSpec::new("git").args([
                "clone",
                "--depth",
                "1",
                "--branch",
                reference,
                repo_url,
                dir.as_str(),
            ]);
            if let Err(e) = self.git(&clone, sink).await {
                let _ = self.channel.remove_dir(work_dir).await;
                return Err(e);
            }
        }

        Ok(())
    }

    async fn git(&self, spec: &CommandSpec, sink: Option<&LogSink>) -> Result<(), EngineError> {
        let output = self.channel.exec(spec, sink.cloned()).await?;
        if !output.success() {
            return Err(EngineError::SourceUnavailable(
                output.stderr.trim().to_string(),
            ));
        }
        Ok(())
    }

    async fn read_compose(
        &self,
        work_dir: &Path,
        compose_path: &str,
    ) -> Result<ComposeDocument, EngineError> {
        let file = work_dir.join(compose_path);
        let spec = CommandSpec::new("cat").arg(file.to_string_lossy().into_owned());

        let output = self.channel.exec(&spec, None).await?;
        if !output.success() {
            return Err(EngineError::SourceUnavailable(format!(
                "compose file {} not found in checkout: {}",
                compose_path,
                output.stderr.trim()
            )));
        }

        if compose_path.ends_with(".toml") {
            ComposeDocument::from_toml_str(&output.stdout)
        } else {
            ComposeDocument::from_yaml_str(&output.stdout)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec::channel::LocalChannel;
    use crate::models::resource::{GitProviderKind, ResourceKind};
    use std::process::Command;

    fn resource(source: ComposeSource) -> DeployableResource {
        DeployableResource {
            id: "r1".to_string(),
            project_id: "p1".to_string(),
            organization_id: "o1".to_string(),
            app_name: "app".to_string(),
            kind: ResourceKind::Stack,
            source,
            server_id: None,
            domains: Vec::new(),
            active: true,
            isolation_suffix: None,
        }
    }

    fn resolver() -> SourceResolver {
        SourceResolver::new(Arc::new(LocalChannel::new()))
    }

    /// Create a bare-bones git repo with a committed compose file
    fn init_repo(dir: &Path) {
        let compose = "services:\n  web:\n    image: nginx\n";
        std::fs::write(dir.join("docker-compose.yml"), compose).unwrap();
        for args in [
            vec!["init", "-q", "-b", "main"],
            vec!["config", "user.email", "test@test"],
            vec!["config", "user.name", "test"],
            vec!["add", "."],
            vec!["commit", "-q", "-m", "init"],
        ] {
            let status = Command::new("git")
                .current_dir(dir)
                .args(&args)
                .status()
                .unwrap();
            assert!(status.success(), "git {:?} failed", args);
        }
    }

    #[tokio::test]
    async fn test_resolve_raw_yaml() {
        let source = ComposeSource::RawCompose {
            content: "services:\n  web:\n    image: nginx\n".to_string(),
            format: ComposeFormat::Yaml,
        };
        let doc = resolver()
            .resolve(&resource(source), Path::new("/unused"), None)
            .await
            .unwrap();
        assert_eq!(doc.service_names(), vec!["web"]);
    }

    #[tokio::test]
    async fn test_resolve_raw_toml() {
        let source = ComposeSource::RawCompose {
            content: "[services.web]\nimage = \"nginx\"\n".to_string(),
            format: ComposeFormat::Toml,
        };
        let doc = resolver()
            .resolve(&resource(source), Path::new("/unused"), None)
            .await
            .unwrap();
        assert_eq!(doc.service_names(), vec!["web"]);
    }

    #[tokio::test]
    async fn test_resolve_git_clone_then_reuse() {
        let upstream = tempfile::tempdir().unwrap();
        init_repo(upstream.path());

        let work = tempfile::tempdir().unwrap();
        let work_dir = work.path().join("checkout");

        let source = ComposeSource::Git {
            provider: GitProviderKind::Custom,
            repo_url: upstream.path().to_string_lossy().into_owned(),
            reference: "main".to_string(),
            compose_path: "docker-compose.yml".to_string(),
        };
        let resource = resource(source);
        let resolver = resolver();

        // Fresh clone
        let doc = resolver.resolve(&resource, &work_dir, None).await.unwrap();
        assert_eq!(doc.service_names(), vec!["web"]);

        // Second resolve reuses the clone (fetch + checkout fast path)
        let doc = resolver.resolve(&resource, &work_dir, None).await.unwrap();
        assert_eq!(doc.service_names(), vec!["web"]);
    }

    #[tokio::test]
    async fn test_resolve_git_bad_ref_leaves_no_partial_dir() {
        let upstream = tempfile::tempdir().unwrap();
        init_repo(upstream.path());

        let work = tempfile::tempdir().unwrap();
        let work_dir = work.path().join("checkout");

        let source = ComposeSource::Git {
            provider: GitProviderKind::Custom,
            repo_url: upstream.path().to_string_lossy().into_owned(),
            reference: "no-such-branch".to_string(),
            compose_path: "docker-compose.yml".to_string(),
        };

        let err = resolver()
            .resolve(&resource(source), &work_dir, None)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::SourceUnavailable(_)));
        assert!(!work_dir.exists());
    }
}
