// src/core/jobs/mod.rs

//! Durable records for deferred RPC execution.
//!
//! An RPC tagged `is_async` is not executed inline: it is persisted here as a
//! draft, acknowledged to the caller immediately, and replayed later by the
//! job worker against the same handler table. Every durable mutation is also
//! published on the `job_update_stream` broker channel so `Job/Listen`
//! streams can follow along.

pub mod worker;

use crate::core::errors::AgentError;
use crate::core::pubsub::{Broker, JOB_UPDATE_STREAM};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use strum_macros::{Display, EnumString};
use tracing::warn;

pub const DEFAULT_JOB_TIMEOUT_SECS: u64 = 3600;

#[derive(
    Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Display, EnumString,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    Draft,
    Scheduled,
    Queued,
    Running,
    Success,
    Failure,
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobStatus::Success | JobStatus::Failure | JobStatus::Cancelled
        )
    }
}

/// One deferred RPC invocation and its outcome.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct JobRecord {
    pub id: u64,
    #[serde(rename = "ref", default)]
    pub reference: Option<String>,
    pub status: JobStatus,
    pub service: String,
    pub method: String,
    pub request_type: String,
    pub request_blob: serde_json::Value,
    #[serde(default)]
    pub response_type: String,
    #[serde(default)]
    pub response_blob: serde_json::Value,
    pub timeout_seconds: u64,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub scheduled_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub enqueued_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub ended_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub error_message: Option<String>,
    #[serde(default)]
    pub trace: Option<String>,
    #[serde(default)]
    pub acknowledged: bool,
}

#[derive(Serialize, Deserialize, Debug, Default)]
struct JobFile {
    next_id: u64,
    jobs: BTreeMap<u64, JobRecord>,
}

/// Durable job store backed by a single JSON file, publishing every record
/// mutation to the broker.
pub struct JobStore {
    path: PathBuf,
    broker: Arc<Broker>,
    inner: Mutex<JobFile>,
}

impl JobStore {
    pub fn open(data_dir: &Path, broker: Arc<Broker>) -> Result<Self, AgentError> {
        std::fs::create_dir_all(data_dir)?;
        let path = data_dir.join("jobs.json");
        let inner = if path.exists() {
            let contents = std::fs::read(&path)?;
            serde_json::from_slice(&contents)?
        } else {
            JobFile { next_id: 1, jobs: BTreeMap::new() }
        };
        Ok(Self {
            path,
            broker,
            inner: Mutex::new(inner),
        })
    }

    fn persist(&self, file: &JobFile) -> Result<(), AgentError> {
        let tmp_path = self.path.with_extension("json.tmp");
        let data = serde_json::to_vec_pretty(file)?;
        std::fs::write(&tmp_path, data)?;
        std::fs::rename(&tmp_path, &self.path)?;
        Ok(())
    }

    fn publish(&self, record: &JobRecord) {
        match serde_json::to_vec(record) {
            Ok(bytes) => {
                self.broker.publish(JOB_UPDATE_STREAM, bytes);
            }
            Err(e) => warn!(job_id = record.id, "Failed to serialize job update: {e}"),
        }
    }

    /// Persists a new draft for a deferred request and announces it.
    pub fn create(
        &self,
        service: &str,
        method: &str,
        request_type: &str,
        request_blob: serde_json::Value,
        reference: Option<String>,
        scheduled_at: Option<DateTime<Utc>>,
        timeout_seconds: Option<u64>,
    ) -> Result<JobRecord, AgentError> {
        let mut inner = self.inner.lock();
        let id = inner.next_id;
        inner.next_id += 1;

        let record = JobRecord {
            id,
            reference,
            status: JobStatus::Draft,
            service: service.to_string(),
            method: method.to_string(),
            request_type: request_type.to_string(),
            request_blob,
            response_type: String::new(),
            response_blob: serde_json::Value::Null,
            timeout_seconds: timeout_seconds.unwrap_or(DEFAULT_JOB_TIMEOUT_SECS),
            created_at: Utc::now(),
            scheduled_at,
            enqueued_at: None,
            started_at: None,
            ended_at: None,
            error_message: None,
            trace: None,
            acknowledged: false,
        };

        inner.jobs.insert(id, record.clone());
        self.persist(&inner)?;
        drop(inner);
        self.publish(&record);
        Ok(record)
    }

    pub fn get(&self, id: u64) -> Option<JobRecord> {
        self.inner.lock().jobs.get(&id).cloned()
    }

    pub fn require(&self, id: u64) -> Result<JobRecord, AgentError> {
        self.get(id).ok_or(AgentError::JobNotFound(id))
    }

    pub fn status(&self, id: u64) -> Option<JobStatus> {
        self.inner.lock().jobs.get(&id).map(|j| j.status)
    }

    /// Applies a mutation to a record, persists, and publishes the result.
    pub fn update_with<F>(&self, id: u64, mutate: F) -> Result<JobRecord, AgentError>
    where
        F: FnOnce(&mut JobRecord),
    {
        let mut inner = self.inner.lock();
        let record = inner.jobs.get_mut(&id).ok_or(AgentError::JobNotFound(id))?;
        mutate(record);
        let snapshot = record.clone();
        self.persist(&inner)?;
        drop(inner);
        self.publish(&snapshot);
        Ok(snapshot)
    }

    /// Promotes a draft: future `scheduled_at` parks it as Scheduled,
    /// otherwise it goes straight onto the queue. Non-drafts are returned
    /// unchanged.
    pub fn schedule(&self, id: u64) -> Result<JobRecord, AgentError> {
        let now = Utc::now();
        self.update_with(id, |job| {
            if job.status != JobStatus::Draft {
                return;
            }
            match job.scheduled_at {
                Some(at) if at > now => job.status = JobStatus::Scheduled,
                _ => {
                    job.scheduled_at.get_or_insert(now);
                    job.status = JobStatus::Queued;
                    job.enqueued_at = Some(now);
                }
            }
        })
    }

    /// Moves every due Draft/Scheduled record onto the queue. Returns the
    /// promoted records.
    pub fn promote_due(&self) -> Result<Vec<JobRecord>, AgentError> {
        let now = Utc::now();
        let due: Vec<u64> = {
            let inner = self.inner.lock();
            inner
                .jobs
                .values()
                .filter(|j| match j.status {
                    JobStatus::Draft => true,
                    JobStatus::Scheduled => j.scheduled_at.is_none_or(|at| at <= now),
                    _ => false,
                })
                .map(|j| j.id)
                .collect()
        };

        let mut promoted = Vec::new();
        for id in due {
            let record = self.update_with(id, |job| {
                if job.status == JobStatus::Draft
                    && job.scheduled_at.is_some_and(|at| at > now)
                {
                    job.status = JobStatus::Scheduled;
                    return;
                }
                if matches!(job.status, JobStatus::Draft | JobStatus::Scheduled) {
                    job.scheduled_at.get_or_insert(now);
                    job.status = JobStatus::Queued;
                    job.enqueued_at = Some(now);
                }
            })?;
            if record.status == JobStatus::Queued {
                promoted.push(record);
            }
        }
        Ok(promoted)
    }

    /// All queued jobs in id order (creation order).
    pub fn queued(&self) -> Vec<JobRecord> {
        self.inner
            .lock()
            .jobs
            .values()
            .filter(|j| j.status == JobStatus::Queued)
            .cloned()
            .collect()
    }

    /// Records whose one-way acknowledgement flag is still unset, in id
    /// order. `Job/Listen` replays these before any live message.
    pub fn unacknowledged(&self) -> Vec<JobRecord> {
        self.inner
            .lock()
            .jobs
            .values()
            .filter(|j| !j.acknowledged)
            .cloned()
            .collect()
    }

    /// Flips the monotonic acknowledgement flag. Re-acknowledging is a no-op.
    pub fn acknowledge(&self, id: u64) -> Result<(), AgentError> {
        let already = self
            .get(id)
            .ok_or(AgentError::JobNotFound(id))?
            .acknowledged;
        if already {
            return Ok(());
        }
        self.update_with(id, |job| job.acknowledged = true)?;
        Ok(())
    }
}
