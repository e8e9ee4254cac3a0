// src/domain/runtime.rs

//! Collaborator seams for process/container supervision.
//!
//! The agent does not own unit-file generation or container lifecycles; it
//! drives them through these traits. The provided implementations shell out
//! to `systemctl` and `podman`, which is what the deployment tooling
//! provisions on every host. Tests substitute in-memory fakes.

use crate::core::catalog::ServiceRecord;
use crate::core::errors::AgentError;
use async_trait::async_trait;
use std::process::Output;
use strum_macros::{Display, EnumString};
use tokio::process::Command;
use tracing::debug;

/// Observed state of a managed unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum ServiceState {
    Active,
    Inactive,
    Failed,
}

/// Supervision of long-running service units.
#[async_trait]
pub trait ServiceRuntime: Send + Sync {
    /// Ensures the unit for `record` is installed and running.
    async fn start(&self, record: &ServiceRecord) -> Result<(), AgentError>;
    async fn stop(&self, id: &str) -> Result<(), AgentError>;
    async fn restart(&self, id: &str) -> Result<(), AgentError>;
    async fn status(&self, id: &str) -> Result<ServiceState, AgentError>;
}

/// Parameters for the throwaway sshd sidecar that exports a data directory
/// during replica bootstrap.
#[derive(Debug, Clone)]
pub struct RsyncSidecarSpec {
    pub instance_id: String,
    pub image: String,
    pub data_path: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub uid: u32,
    pub gid: u32,
}

/// Supervision of short-lived sidecar containers.
#[async_trait]
pub trait SidecarRuntime: Send + Sync {
    async fn launch_rsync(&self, spec: &RsyncSidecarSpec) -> Result<(), AgentError>;
    async fn exists(&self, instance_id: &str) -> Result<bool, AgentError>;
    async fn remove(&self, instance_id: &str) -> Result<(), AgentError>;
}

fn check_output(context: &str, output: &Output) -> Result<(), AgentError> {
    if output.status.success() {
        return Ok(());
    }
    let stderr = String::from_utf8_lossy(&output.stderr);
    Err(AgentError::Runtime(format!(
        "{context} failed ({}): {}",
        output.status,
        stderr.trim()
    )))
}

/// `systemctl`-backed runtime. Unit files are generated by the provisioning
/// layer; this runtime only flips them.
pub struct SystemdRuntime {
    user_mode: bool,
}

impl SystemdRuntime {
    pub fn new() -> Self {
        // Root runs system units; anything else manages its own user units.
        let user_mode = !is_root_user();
        Self { user_mode }
    }

    fn systemctl(&self) -> Command {
        let mut cmd = Command::new("systemctl");
        if self.user_mode {
            cmd.arg("--user");
        }
        cmd
    }
}

fn is_root_user() -> bool {
    std::env::var("USER").is_ok_and(|u| u == "root") || std::env::var("UID").is_ok_and(|u| u == "0")
}

impl Default for SystemdRuntime {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ServiceRuntime for SystemdRuntime {
    async fn start(&self, record: &ServiceRecord) -> Result<(), AgentError> {
        let reload = self.systemctl().arg("daemon-reload").output().await?;
        check_output("systemctl daemon-reload", &reload)?;
        let output = self
            .systemctl()
            .args(["restart", &record.id])
            .output()
            .await?;
        check_output("systemctl restart", &output)
    }

    async fn stop(&self, id: &str) -> Result<(), AgentError> {
        let output = self.systemctl().args(["stop", id]).output().await?;
        // A missing unit is already stopped.
        if !output.status.success() {
            debug!(id, "systemctl stop reported failure, treating as stopped");
        }
        let reload = self.systemctl().arg("daemon-reload").output().await?;
        check_output("systemctl daemon-reload", &reload)
    }

    async fn restart(&self, id: &str) -> Result<(), AgentError> {
        let reload = self.systemctl().arg("daemon-reload").output().await?;
        check_output("systemctl daemon-reload", &reload)?;
        let output = self.systemctl().args(["restart", id]).output().await?;
        check_output("systemctl restart", &output)
    }

    async fn status(&self, id: &str) -> Result<ServiceState, AgentError> {
        let output = self
            .systemctl()
            .args(["show", id, "--property=ActiveState", "--value"])
            .output()
            .await?;
        let state = String::from_utf8_lossy(&output.stdout).trim().to_string();
        Ok(match state.as_str() {
            "active" => ServiceState::Active,
            "inactive" | "activating" => ServiceState::Inactive,
            _ => ServiceState::Failed,
        })
    }
}

/// `podman`-backed sidecar runtime.
pub struct PodmanRuntime;

#[async_trait]
impl SidecarRuntime for PodmanRuntime {
    async fn launch_rsync(&self, spec: &RsyncSidecarSpec) -> Result<(), AgentError> {
        let output = Command::new("podman")
            .args([
                "run",
                "--detach",
                "--name",
                &spec.instance_id,
                "--volume",
                &format!("{}:/data", spec.data_path),
                "--publish",
                &format!("{}:2222", spec.port),
                "--env",
                "SSH_PORT=2222",
                "--env",
                &format!("USER_UID={}", spec.uid),
                "--env",
                &format!("USER_GID={}", spec.gid),
                "--env",
                &format!("USER_NAME={}", spec.username),
                "--env",
                &format!("USER_PASSWORD={}", spec.password),
                &spec.image,
            ])
            .output()
            .await?;
        check_output("podman run", &output)
    }

    async fn exists(&self, instance_id: &str) -> Result<bool, AgentError> {
        let output = Command::new("podman")
            .args(["container", "exists", instance_id])
            .output()
            .await?;
        Ok(output.status.success())
    }

    async fn remove(&self, instance_id: &str) -> Result<(), AgentError> {
        if !self.exists(instance_id).await? {
            return Ok(());
        }
        let output = Command::new("podman")
            .args(["rm", "--force", instance_id])
            .output()
            .await?;
        check_output("podman rm", &output)
    }
}
