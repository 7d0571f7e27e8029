//! Scheduler end-to-end tests against a scripted execution channel

use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use dockhand::errors::EngineError;
use dockhand::exec::channel::{CommandOutput, CommandSpec, ExecutionChannel, LogSink};
use dockhand::models::job::{DeploymentJob, JobStatus, JobType};
use dockhand::models::resource::{ComposeFormat, ComposeSource, DeployableResource, ResourceKind};
use dockhand::scheduler::Scheduler;
use dockhand::storage::layout::StorageLayout;
use dockhand::storage::settings::Settings;
use dockhand::store::resources::MemoryResourceStore;

const COMPOSE: &str = "services:\n  web:\n    image: nginx\n";

/// Records every command and scripts failures by substring match
struct FakeChannel {
    commands: Mutex<Vec<String>>,
    files: Mutex<Vec<(String, String)>>,
    failures: Vec<(String, String)>,
    delay: Duration,
}

impl FakeChannel {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            commands: Mutex::new(Vec::new()),
            files: Mutex::new(Vec::new()),
            failures: Vec::new(),
            delay: Duration::ZERO,
        })
    }

    /// Every command takes `delay`, keeping jobs observably in flight
    fn slow(delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            commands: Mutex::new(Vec::new()),
            files: Mutex::new(Vec::new()),
            failures: Vec::new(),
            delay,
        })
    }

    fn failing(failures: &[(&str, &str)]) -> Arc<Self> {
        Arc::new(Self {
            commands: Mutex::new(Vec::new()),
            files: Mutex::new(Vec::new()),
            failures: failures
                .iter()
                .map(|(needle, stderr)| (needle.to_string(), stderr.to_string()))
                .collect(),
            delay: Duration::ZERO,
        })
    }

    fn commands(&self) -> Vec<String> {
        self.commands.lock().unwrap().clone()
    }
}

#[async_trait]
impl ExecutionChannel for FakeChannel {
    async fn exec(
        &self,
        spec: &CommandSpec,
        sink: Option<LogSink>,
    ) -> Result<CommandOutput, EngineError> {
        let rendered = spec.display();
        self.commands.lock().unwrap().push(rendered.clone());

        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }

        for (needle, stderr) in &self.failures {
            if rendered.contains(needle.as_str()) {
                return Ok(CommandOutput {
                    stdout: String::new(),
                    stderr: stderr.clone(),
                    exit_code: 1,
                });
            }
        }

        if let Some(sink) = sink {
            let _ = sink.send(format!("ok: {}", rendered));
        }
        Ok(CommandOutput {
            stdout: String::new(),
            stderr: String::new(),
            exit_code: 0,
        })
    }

    async fn write_file(&self, path: &Path, contents: &str) -> Result<(), EngineError> {
        self.files
            .lock()
            .unwrap()
            .push((path.to_string_lossy().into_owned(), contents.to_string()));
        Ok(())
    }

    async fn remove_dir(&self, _path: &Path) -> Result<(), EngineError> {
        Ok(())
    }

    fn describe(&self) -> String {
        "scripted".to_string()
    }
}

fn resource(id: &str, app_name: &str, source: ComposeSource) -> DeployableResource {
    DeployableResource {
        id: id.to_string(),
        project_id: "p1".to_string(),
        organization_id: "o1".to_string(),
        app_name: app_name.to_string(),
        kind: ResourceKind::Stack,
        source,
        server_id: None,
        domains: Vec::new(),
        active: true,
        isolation_suffix: None,
    }
}

fn raw_compose() -> ComposeSource {
    ComposeSource::RawCompose {
        content: COMPOSE.to_string(),
        format: ComposeFormat::Yaml,
    }
}

async fn scheduler_with(
    base_dir: &Path,
    store: Arc<MemoryResourceStore>,
    channel: Arc<FakeChannel>,
) -> Scheduler {
    Scheduler::with_channel_factory(
        Settings::default(),
        StorageLayout::new(base_dir),
        store,
        Arc::new(move |_target: &dockhand::exec::channel::ExecutionTarget| {
            channel.clone() as Arc<dyn ExecutionChannel>
        }),
    )
    .await
    .unwrap()
}

async fn wait_terminal(scheduler: &Scheduler, job_id: &str) -> (JobStatus, Option<String>) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        if let Some((status, error)) = scheduler.status(job_id).await {
            if status.is_terminal() {
                return (status, error);
            }
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "job {} never reached a terminal state",
            job_id
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[tokio::test]
async fn test_deploy_pulls_and_brings_up_stack() {
    let tmp = tempfile::tempdir().unwrap();
    let store = Arc::new(MemoryResourceStore::new());
    store.upsert(resource("r1", "shop", raw_compose()));

    let channel = FakeChannel::new();
    let scheduler = scheduler_with(tmp.path(), store, channel.clone()).await;
    scheduler.start().await.unwrap();

    let job = DeploymentJob::new("r1", ResourceKind::Stack, JobType::Deploy, "Manual deployment");
    let job_id = scheduler.enqueue(job).await.unwrap();

    let (status, error) = wait_terminal(&scheduler, &job_id).await;
    assert_eq!(status, JobStatus::Done);
    assert!(error.is_none());

    let commands = channel.commands();
    assert!(commands.iter().any(|c| c.starts_with("docker compose -p shop") && c.ends_with("pull")));
    assert!(commands.iter().any(|c| c.contains("up -d --remove-orphans")));

    // The rendered document was placed on the target before `up`
    let files = channel.files.lock().unwrap().clone();
    assert_eq!(files.len(), 1);
    assert!(files[0].0.ends_with("compose.rendered.yml"));
    assert!(files[0].1.contains("image: nginx"));

    // The log carries the streamed command lines and the final marker
    let lines = scheduler.log_lines(&job_id).await.unwrap();
    assert!(lines.iter().any(|l| l.line.starts_with("$ docker compose")));
    assert!(lines.iter().any(|l| l.line == "Deployment finished"));

    scheduler.shutdown().await;
}

#[tokio::test]
async fn test_same_resource_jobs_serialize_in_order() {
    let tmp = tempfile::tempdir().unwrap();
    let store = Arc::new(MemoryResourceStore::new());
    store.upsert(resource("r1", "shop", raw_compose()));

    let channel = FakeChannel::new();
    let scheduler = scheduler_with(tmp.path(), store, channel.clone()).await;
    scheduler.start().await.unwrap();

    let deploy = DeploymentJob::new("r1", ResourceKind::Stack, JobType::Deploy, "Deploy");
    let stop = DeploymentJob::new("r1", ResourceKind::Stack, JobType::Stop, "Stop");
    let deploy_id = scheduler.enqueue(deploy).await.unwrap();
    let stop_id = scheduler.enqueue(stop).await.unwrap();

    assert_eq!(wait_terminal(&scheduler, &deploy_id).await.0, JobStatus::Done);
    assert_eq!(wait_terminal(&scheduler, &stop_id).await.0, JobStatus::Done);

    // The stop ran strictly after the deploy's `up`
    let commands = channel.commands();
    let up = commands
        .iter()
        .position(|c| c.contains("up -d"))
        .expect("deploy ran");
    let stop = commands
        .iter()
        .position(|c| c.contains("-p shop stop"))
        .expect("stop ran");
    assert!(up < stop);

    scheduler.shutdown().await;
}

#[tokio::test]
async fn test_running_status_never_overlaps_for_one_resource() {
    let tmp = tempfile::tempdir().unwrap();
    let store = Arc::new(MemoryResourceStore::new());
    store.upsert(resource("r1", "shop", raw_compose()));

    // Slow commands keep each job running long enough to sample both
    let channel = FakeChannel::slow(Duration::from_millis(100));
    let scheduler = scheduler_with(tmp.path(), store, channel).await;
    scheduler.start().await.unwrap();

    let first = DeploymentJob::new("r1", ResourceKind::Stack, JobType::Deploy, "Deploy");
    let second = DeploymentJob::new("r1", ResourceKind::Stack, JobType::Deploy, "Deploy");
    let first_id = scheduler.enqueue(first).await.unwrap();
    let second_id = scheduler.enqueue(second).await.unwrap();

    // The waiter must stay `queued` while the holder is `running`
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    loop {
        assert!(
            tokio::time::Instant::now() < deadline,
            "deploys never finished"
        );
        let a = scheduler.status(&first_id).await.map(|(s, _)| s);
        let b = scheduler.status(&second_id).await.map(|(s, _)| s);
        assert!(
            !(a == Some(JobStatus::Running) && b == Some(JobStatus::Running)),
            "both jobs for one resource reported running"
        );
        if a == Some(JobStatus::Done) && b == Some(JobStatus::Done) {
            break;
        }
        assert_ne!(a, Some(JobStatus::Error), "first deploy failed");
        assert_ne!(b, Some(JobStatus::Error), "second deploy failed");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    scheduler.shutdown().await;
}

#[tokio::test]
async fn test_bad_git_ref_fails_with_source_unavailable() {
    let tmp = tempfile::tempdir().unwrap();
    let store = Arc::new(MemoryResourceStore::new());
    store.upsert(resource(
        "r1",
        "shop",
        ComposeSource::Git {
            provider: dockhand::models::resource::GitProviderKind::Github,
            repo_url: "git@github.com:acme/shop.git".to_string(),
            reference: "no-such-branch".to_string(),
            compose_path: "docker-compose.yml".to_string(),
        },
    ));

    let channel = FakeChannel::failing(&[
        ("rev-parse", "not a git repository"),
        ("clone", "Remote branch no-such-branch not found"),
    ]);
    let scheduler = scheduler_with(tmp.path(), store, channel.clone()).await;
    scheduler.start().await.unwrap();

    let job = DeploymentJob::new("r1", ResourceKind::Stack, JobType::Deploy, "Deploy");
    let job_id = scheduler.enqueue(job).await.unwrap();

    let (status, error) = wait_terminal(&scheduler, &job_id).await;
    assert_eq!(status, JobStatus::Error);
    assert!(error.unwrap().contains("Source unavailable"));

    // Docker was never touched
    assert!(!channel.commands().iter().any(|c| c.starts_with("docker")));

    scheduler.shutdown().await;
}

#[tokio::test]
async fn test_inactive_resource_refuses_deploy() {
    let tmp = tempfile::tempdir().unwrap();
    let store = Arc::new(MemoryResourceStore::new());
    let mut inactive = resource("r1", "shop", raw_compose());
    inactive.active = false;
    store.upsert(inactive);

    let channel = FakeChannel::new();
    let scheduler = scheduler_with(tmp.path(), store, channel.clone()).await;
    scheduler.start().await.unwrap();

    let job = DeploymentJob::new("r1", ResourceKind::Stack, JobType::Deploy, "Deploy");
    let job_id = scheduler.enqueue(job).await.unwrap();

    let (status, error) = wait_terminal(&scheduler, &job_id).await;
    assert_eq!(status, JobStatus::Error);
    assert!(error.unwrap().contains("Resource inactive"));
    assert!(channel.commands().is_empty());

    scheduler.shutdown().await;
}

#[tokio::test]
async fn test_cancel_pending_job_before_start() {
    let tmp = tempfile::tempdir().unwrap();
    let store = Arc::new(MemoryResourceStore::new());
    store.upsert(resource("r1", "shop", raw_compose()));

    // Workers not started: the job stays pending
    let channel = FakeChannel::new();
    let scheduler = scheduler_with(tmp.path(), store, channel).await;

    let job = DeploymentJob::new("r1", ResourceKind::Stack, JobType::Deploy, "Deploy");
    let job_id = scheduler.enqueue(job).await.unwrap();
    assert!(scheduler.is_in_flight("r1").await);

    assert!(scheduler.cancel(&job_id).await.unwrap());
    let (status, error) = scheduler.status(&job_id).await.unwrap();
    assert_eq!(status, JobStatus::Error);
    assert!(error.unwrap().contains("cancelled"));
    assert!(!scheduler.is_in_flight("r1").await);

    // Cancelling a finished job reports false
    assert!(!scheduler.cancel(&job_id).await.unwrap());
}
