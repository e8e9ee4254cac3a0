// src/core/jobs/worker.rs

//! Scheduling and execution of deferred requests.
//!
//! One scheduler loop promotes due records onto the queue and hands them to
//! bounded executor tasks. Execution replays the persisted request through
//! the same handler table the RPC server uses, with a synthetic context in
//! place of the network connection.

use crate::core::agent_state::AgentContext;
use crate::core::errors::AgentError;
use crate::core::jobs::{JobRecord, JobStatus};
use crate::rpc::{ResponseMeta, ensure_response_meta, response_meta_status};
use crate::server::dispatch::{RequestContext, ServiceRegistry};
use chrono::Utc;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Semaphore, broadcast};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

const SCHEDULER_TICK: Duration = Duration::from_secs(1);

pub struct JobEngine {
    agent: Arc<AgentContext>,
    // Set once at startup, after the registry (which contains handlers that
    // hold this engine) has been fully built.
    registry: std::sync::OnceLock<Arc<ServiceRegistry>>,
    running: DashMap<u64, CancellationToken>,
    permits: Arc<Semaphore>,
}

impl JobEngine {
    pub fn new(agent: Arc<AgentContext>) -> Arc<Self> {
        let permits = Arc::new(Semaphore::new(agent.config.max_rpc_workers));
        Arc::new(Self {
            agent,
            registry: std::sync::OnceLock::new(),
            running: DashMap::new(),
            permits,
        })
    }

    pub fn set_registry(&self, registry: Arc<ServiceRegistry>) {
        let _ = self.registry.set(registry);
    }

    /// The scheduler loop: promote due records, then start executors for
    /// queued ones. Runs until shutdown.
    pub async fn run(self: Arc<Self>, mut shutdown_rx: broadcast::Receiver<()>) {
        let mut tick = tokio::time::interval(SCHEDULER_TICK);
        info!("Job engine started");
        loop {
            tokio::select! {
                _ = tick.tick() => {
                    if let Err(e) = self.agent.jobs.promote_due() {
                        warn!("Failed to promote due jobs: {e}");
                    }
                    self.spawn_queued();
                }
                _ = shutdown_rx.recv() => {
                    info!("Job engine shutting down");
                    for entry in self.running.iter() {
                        entry.value().cancel();
                    }
                    return;
                }
            }
        }
    }

    fn spawn_queued(self: &Arc<Self>) {
        for job in self.agent.jobs.queued() {
            if self.running.contains_key(&job.id) {
                continue;
            }
            let token = CancellationToken::new();
            self.running.insert(job.id, token.clone());
            let engine = self.clone();
            tokio::spawn(async move {
                let _permit = match engine.permits.clone().acquire_owned().await {
                    Ok(permit) => permit,
                    Err(_) => return,
                };
                engine.execute(job, token).await;
            });
        }
    }

    async fn execute(self: &Arc<Self>, job: JobRecord, token: CancellationToken) {
        let job_id = job.id;
        let outcome = self.execute_inner(job, token).await;
        if let Err(e) = outcome {
            error!(job_id, "Job bookkeeping failed: {e}");
        }
        self.running.remove(&job_id);
    }

    async fn execute_inner(
        self: &Arc<Self>,
        job: JobRecord,
        token: CancellationToken,
    ) -> Result<(), AgentError> {
        let started = self.agent.jobs.update_with(job.id, |j| {
            if j.status != JobStatus::Queued {
                return;
            }
            j.status = JobStatus::Running;
            j.enqueued_at.get_or_insert_with(Utc::now);
            j.started_at = Some(Utc::now());
        })?;
        if started.status != JobStatus::Running {
            // Cancelled (or otherwise finished) between queueing and pickup.
            return Ok(());
        }

        let Some(registry) = self.registry.get() else {
            self.fail(job.id, "handler registry is not initialized", None)?;
            return Ok(());
        };
        let Some(entry) = registry.get(&job.service, &job.method) else {
            self.fail(job.id, "request type not found in the handler registry", None)?;
            return Ok(());
        };
        if !entry.supports_meta {
            self.fail(
                job.id,
                "method does not support deferred execution metadata",
                None,
            )?;
            return Ok(());
        }

        let handler = entry.handler.clone();
        let timeout = Duration::from_secs(job.timeout_seconds);
        let request = job.request_blob.clone();

        let result = tokio::select! {
            _ = token.cancelled() => {
                info!(job_id = job.id, "Job cancelled while running");
                // Cancel already stamped the record; nothing more to write.
                return Ok(());
            }
            run = tokio::time::timeout(timeout, handler.call(RequestContext::background(), request)) => {
                match run {
                    Ok(inner) => inner,
                    Err(_) => Err(AgentError::Timeout(format!(
                        "job {} exceeded its {}s timeout",
                        job.id, job.timeout_seconds
                    ))),
                }
            }
        };

        match result {
            Ok(mut payload) => {
                let meta = ResponseMeta {
                    status: Some(JobStatus::Success.to_string()),
                    ..Default::default()
                };
                ensure_response_meta(&mut payload, &meta);
                let status = response_meta_status(&payload)
                    .and_then(|s| s.parse::<JobStatus>().ok())
                    .unwrap_or(JobStatus::Success);
                self.agent.jobs.update_with(job.id, |j| {
                    if j.status != JobStatus::Running {
                        return;
                    }
                    j.status = status;
                    j.response_type = format!("{}.{}Response", j.service, j.method);
                    j.response_blob = payload.clone();
                    j.ended_at = Some(Utc::now());
                })?;
            }
            Err(err) => {
                self.fail(job.id, &err.to_string(), Some(format!("{err:?}")))?;
            }
        }
        Ok(())
    }

    fn fail(&self, job_id: u64, message: &str, trace: Option<String>) -> Result<(), AgentError> {
        warn!(job_id, "Job failed: {message}");
        self.agent.jobs.update_with(job_id, |j| {
            if j.status.is_terminal() {
                return;
            }
            j.status = JobStatus::Failure;
            j.error_message = Some(message.to_string());
            j.trace = trace.clone();
            j.ended_at = Some(Utc::now());
        })?;
        Ok(())
    }

    /// Cancels a job in any non-terminal state. Running jobs have their task
    /// cancelled; queued/scheduled/draft ones just flip to Cancelled.
    pub fn cancel(&self, job_id: u64) -> Result<JobStatus, AgentError> {
        let record = self.agent.jobs.require(job_id)?;
        if record.status.is_terminal() {
            return Ok(record.status);
        }

        if let Some(token) = self.running.get(&job_id) {
            token.cancel();
        }

        let updated = self.agent.jobs.update_with(job_id, |j| {
            if j.status.is_terminal() {
                return;
            }
            j.status = JobStatus::Cancelled;
            j.ended_at = Some(Utc::now());
        })?;
        Ok(updated.status)
    }
}
