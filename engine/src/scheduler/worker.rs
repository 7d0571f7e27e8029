//! Worker loop and per-job pipeline.
//!
//! Each worker claims jobs from the durable queue and runs them through the
//! fixed pipeline: resolve the source, transform the compose document,
//! execute against Docker, finalize. Every phase runs under its own timeout
//! and the cancellation flag is checked at each phase boundary, so a stuck
//! phase or an operator cancel can only stop the job between phases, never
//! leave it half-finalized.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, mpsc};
use tracing::{error, info, warn};

use crate::compose::transform;
use crate::errors::EngineError;
use crate::exec::channel::{ExecutionChannel, ExecutionTarget, LogSink};
use crate::exec::docker::DockerExecutor;
use crate::models::job::{DeploymentJob, JobStatus, JobType};
use crate::models::resource::{DeployableResource, ResourceKind};
use crate::scheduler::guard::Enrollment;
use crate::scheduler::queue::QueuedJob;
use crate::scheduler::SchedulerInner;
use crate::source::SourceResolver;

/// File name the rendered compose document is written to inside the
/// resource's working directory
const RENDERED_COMPOSE_FILE: &str = "compose.rendered.yml";

pub(crate) async fn run_worker(
    worker_id: usize,
    inner: Arc<SchedulerInner>,
    mut shutdown: broadcast::Receiver<()>,
) {
    info!("Worker {} started", worker_id);

    loop {
        // Guard enrollment happens inside the claim so same-resource jobs
        // take their leases in queue order even across racing workers
        let claimed = tokio::select! {
            _ = shutdown.recv() => {
                info!("Worker {} shutting down", worker_id);
                return;
            }
            claimed = inner
                .queue
                .claim_with(|job| inner.guard.enroll(&job.resource_id, &job.job_id)) => claimed,
        };

        let (entry, enrollment) = match claimed {
            Ok(claimed) => claimed,
            Err(e) => {
                error!("Worker {} failed to claim a job: {}", worker_id, e);
                tokio::time::sleep(Duration::from_millis(500)).await;
                continue;
            }
        };

        let job_id = entry.job.job_id.clone();
        if let Err(e) = process_job(&inner, entry, enrollment).await {
            // Bookkeeping failure; job failures end up in the job's own
            // terminal status instead
            warn!("Worker {}: bookkeeping for job {} failed: {}", worker_id, job_id, e);
        }
    }
}

/// Run one claimed job to a terminal state and ack it.
///
/// The terminal status is set exactly once, the lease is always released
/// and partial log output is retained on error.
async fn process_job(
    inner: &SchedulerInner,
    entry: QueuedJob,
    enrollment: Enrollment,
) -> Result<(), EngineError> {
    let job = entry.job.clone();
    let cancel = inner.cancellation_flag(&job.job_id);

    // Jobs recovered from disk are not in the in-memory log store yet
    inner.logs.register(&job.job_id, &job.resource_id).await;

    // Forward streamed command output into the job's log
    let (sink, mut lines) = mpsc::unbounded_channel::<String>();
    let forwarder = {
        let logs = inner.logs.clone();
        let job_id = job.job_id.clone();
        tokio::spawn(async move {
            while let Some(line) = lines.recv().await {
                if logs.append(&job_id, line).await.is_err() {
                    break;
                }
            }
        })
    };

    // A job stays `queued` until it holds the lease: two jobs for the same
    // resource must never both report `running`
    let lease = enrollment.acquire().await?;
    let result = match inner
        .logs
        .set_status(&job.job_id, JobStatus::Running, None)
        .await
    {
        Ok(()) => {
            if !job.description_log.is_empty() {
                let _ = inner.logs.append(&job.job_id, job.description_log.clone()).await;
            }
            if entry.redelivered {
                let _ = inner
                    .logs
                    .append(&job.job_id, "Requeued after an interrupted run")
                    .await;
            }
            run_pipeline(inner, &job, &cancel, &sink).await
        }
        Err(e) => Err(e),
    };
    inner.guard.release(lease);

    drop(sink);
    let _ = forwarder.await;

    match &result {
        Ok(()) => {
            let _ = inner.logs.append(&job.job_id, "Deployment finished").await;
            if let Err(e) = inner.logs.set_status(&job.job_id, JobStatus::Done, None).await {
                // The lease reaper got here first and marked the job failed
                warn!("Job {} finished but could not be marked done: {}", job.job_id, e);
            }
        }
        Err(e) => {
            let _ = inner.logs.append(&job.job_id, format!("Error: {}", e)).await;
            if let Err(set_err) = inner
                .logs
                .set_status(&job.job_id, JobStatus::Error, Some(e.to_string()))
                .await
            {
                warn!("Job {} failed but could not be marked: {}", job.job_id, set_err);
            }
        }
    }

    inner.queue.ack(&entry).await?;
    inner.clear_cancellation(&job.job_id);
    Ok(())
}

async fn run_pipeline(
    inner: &SchedulerInner,
    job: &DeploymentJob,
    cancel: &AtomicBool,
    sink: &LogSink,
) -> Result<(), EngineError> {
    let resource = inner.resources.get(&job.resource_id).await?;

    // The active flag is maintained by the billing/quota collaborator; the
    // gate's scope (deploy only, or deploy and redeploy) is operator config
    if !resource.active && inner.settings.inactive_gate.blocks(job.job_type) {
        return Err(EngineError::ResourceInactive(resource.id.clone()));
    }

    // Resolved exactly once per job; a record change mid-run cannot move it
    let target = resolve_target(inner, &resource, job).await?;
    let channel = (inner.channel_factory)(&target);
    let _ = sink.send(format!("Target: {}", channel.describe()));
    check_cancelled(cancel)?;

    let docker = DockerExecutor::new(channel.clone());
    let docker_timeout = Duration::from_secs(inner.settings.docker_timeout_secs);
    let project = resource.project_name();

    match job.job_type {
        JobType::Stop => {
            phase(docker_timeout, "docker stop", docker.stop(&project, Some(sink))).await
        }
        JobType::Start => {
            phase(docker_timeout, "docker start", docker.start(&project, Some(sink))).await
        }
        JobType::Deploy | JobType::Redeploy => {
            deploy(inner, &resource, channel, &docker, cancel, sink).await
        }
    }
}

async fn deploy(
    inner: &SchedulerInner,
    resource: &DeployableResource,
    channel: Arc<dyn ExecutionChannel>,
    docker: &DockerExecutor,
    cancel: &AtomicBool,
    sink: &LogSink,
) -> Result<(), EngineError> {
    let source_timeout = Duration::from_secs(inner.settings.source_timeout_secs);
    let docker_timeout = Duration::from_secs(inner.settings.docker_timeout_secs);
    let project = resource.project_name();
    let work_dir = inner.layout.work_dir(&project);

    let resolver = SourceResolver::new(channel.clone());
    let doc = match tokio::time::timeout(
        source_timeout,
        resolver.resolve(resource, work_dir.path(), Some(sink)),
    )
    .await
    {
        Ok(result) => result?,
        Err(_) => {
            return Err(EngineError::SourceUnavailable(format!(
                "source resolution timed out after {:?}",
                source_timeout
            )))
        }
    };
    check_cancelled(cancel)?;

    let transformed = transform(
        &doc,
        &resource.domains,
        &resource.app_name,
        resource.isolation_suffix.as_deref(),
    )?;
    let _ = sink.send(format!("Compose digest: {}", transformed.digest()?));
    check_cancelled(cancel)?;

    match resource.kind {
        ResourceKind::Stack => {
            let compose_file = work_dir.path().join(RENDERED_COMPOSE_FILE);
            channel
                .write_file(&compose_file, &transformed.to_yaml()?)
                .await?;
            phase(
                docker_timeout,
                "docker compose up",
                docker.up(&project, &compose_file, Some(sink)),
            )
            .await
        }
        ResourceKind::Service => {
            deploy_service(docker, &project, &transformed, docker_timeout, sink).await
        }
    }
}

/// Single-service resources roll as a Swarm service named after the project
async fn deploy_service(
    docker: &DockerExecutor,
    project: &str,
    doc: &crate::compose::ComposeDocument,
    limit: Duration,
    sink: &LogSink,
) -> Result<(), EngineError> {
    let service = doc
        .service_names()
        .into_iter()
        .next()
        .ok_or_else(|| EngineError::TransformInvalid("document has no services".to_string()))?;
    let image = doc.service_image(&service).ok_or_else(|| {
        EngineError::TransformInvalid(format!("service {} declares no image", service))
    })?;

    if docker.service_exists(project).await? {
        phase(limit, "service update", docker.service_update(project, &image, Some(sink))).await
    } else {
        phase(limit, "service create", docker.service_create(project, &image, Some(sink))).await
    }
}

async fn resolve_target(
    inner: &SchedulerInner,
    resource: &DeployableResource,
    job: &DeploymentJob,
) -> Result<ExecutionTarget, EngineError> {
    let server_id = job.server_id.as_deref().or(resource.server_id.as_deref());
    let Some(server_id) = server_id else {
        return Ok(ExecutionTarget::Local);
    };

    // Settings-declared servers take precedence over the store
    if let Some(server) = inner
        .settings
        .servers
        .iter()
        .find(|s| s.server_id == server_id)
    {
        return Ok(ExecutionTarget::Remote(server.clone()));
    }
    Ok(ExecutionTarget::Remote(
        inner.resources.get_server(server_id).await?,
    ))
}

async fn phase<F>(limit: Duration, label: &str, fut: F) -> Result<(), EngineError>
where
    F: Future<Output = Result<(), EngineError>>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result,
        Err(_) => Err(EngineError::ExecutionFailed {
            stderr: format!("{} timed out after {:?}", label, limit),
        }),
    }
}

fn check_cancelled(cancel: &AtomicBool) -> Result<(), EngineError> {
    if cancel.load(Ordering::SeqCst) {
        Err(EngineError::Cancelled)
    } else {
        Ok(())
    }
}
