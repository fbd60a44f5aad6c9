//! Orchestrator facade
//!
//! Wires the session manager, provisioner and health monitor to one set of
//! collaborators and exposes the operations callers use. Long-running
//! operations (start, retry) are meant to be spawned; the rest return promptly.

use std::sync::Arc;

use serde::Serialize;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::config::OrchestratorConfig;
use crate::connection::{ConnectionRegistry, ConnectionStatus, SessionError, SessionManager};
use crate::health::HealthMonitor;
use crate::provision::{ProvisionError, Provisioner};
use crate::tasks::{Task, TaskStatus, TaskStore, TaskStoreError};
use crate::transcript::{needs_attention, TranscriptChunk, TranscriptError, TranscriptStore};
use crate::transport::{InstanceProvider, RemoteShell};

/// Point-in-time view of one task
#[derive(Debug, Clone, Serialize)]
pub struct TaskOverview {
    pub id: String,
    pub status: TaskStatus,
    pub vm_name: Option<String>,
    pub vm_zone: Option<String>,
    pub connection: Option<ConnectionStatus>,
    pub reconnect_attempts: u32,
    pub transcript_length: u64,
    pub idle_minutes: Option<u64>,
    pub needs_attention: bool,
}

pub struct Orchestrator {
    sessions: Arc<SessionManager>,
    provisioner: Arc<Provisioner>,
    health: Arc<HealthMonitor>,
    tasks: Arc<dyn TaskStore>,
    transcripts: Arc<TranscriptStore>,
    config: Arc<OrchestratorConfig>,
}

impl Orchestrator {
    pub fn new(
        shell: Arc<dyn RemoteShell>,
        provider: Arc<dyn InstanceProvider>,
        tasks: Arc<dyn TaskStore>,
        transcripts: Arc<TranscriptStore>,
        config: OrchestratorConfig,
    ) -> Self {
        let config = Arc::new(config);
        let sessions = SessionManager::new(
            Arc::new(ConnectionRegistry::new()),
            shell.clone(),
            provider.clone(),
            tasks.clone(),
            transcripts.clone(),
            config.clone(),
        );
        let provisioner = Arc::new(Provisioner::new(
            sessions.clone(),
            shell,
            provider,
            tasks.clone(),
            transcripts.clone(),
            config.clone(),
        ));
        let health = Arc::new(HealthMonitor::new(
            sessions.clone(),
            config.health_period,
            config.stale_after,
        ));

        Self {
            sessions,
            provisioner,
            health,
            tasks,
            transcripts,
            config,
        }
    }

    pub fn sessions(&self) -> &Arc<SessionManager> {
        &self.sessions
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        self.sessions.registry()
    }

    pub fn health(&self) -> &Arc<HealthMonitor> {
        &self.health
    }

    pub fn tasks(&self) -> &Arc<dyn TaskStore> {
        &self.tasks
    }

    pub fn transcripts(&self) -> &Arc<TranscriptStore> {
        &self.transcripts
    }

    /// Start the periodic health sweep
    pub fn spawn_health_monitor(&self) -> JoinHandle<()> {
        self.health.clone().spawn()
    }

    // ─── Task lifecycle ───

    pub async fn start_task(&self, task_id: &str) -> Result<(), ProvisionError> {
        self.provisioner.start_task(task_id).await
    }

    /// Run `start_task` in the background. The outcome lands in the task status
    /// and transcript.
    pub fn spawn_start(&self, task_id: &str) -> JoinHandle<Result<(), ProvisionError>> {
        let provisioner = self.provisioner.clone();
        let task_id = task_id.to_string();
        tokio::spawn(async move { provisioner.start_task(&task_id).await })
    }

    pub async fn stop_task(&self, task_id: &str) -> Result<(), ProvisionError> {
        self.provisioner.stop_task(task_id).await
    }

    pub async fn complete_task(&self, task_id: &str) -> Result<(), ProvisionError> {
        self.provisioner.complete_task(task_id).await
    }

    pub async fn retry_task(&self, task_id: &str) -> Result<(), ProvisionError> {
        self.provisioner.retry_task(task_id).await
    }

    pub fn spawn_retry(&self, task_id: &str) -> JoinHandle<Result<(), ProvisionError>> {
        let provisioner = self.provisioner.clone();
        let task_id = task_id.to_string();
        tokio::spawn(async move { provisioner.retry_task(&task_id).await })
    }

    // ─── Session ───

    pub async fn send_instruction(&self, task_id: &str, text: &str) -> Result<(), SessionError> {
        self.sessions.send_instruction(task_id, text).await
    }

    pub async fn resize_terminal(&self, task_id: &str, cols: u16, rows: u16) -> Result<bool, SessionError> {
        self.sessions.resize(task_id, cols, rows).await
    }

    pub async fn manual_reconnect(&self, task_id: &str) -> Result<ConnectionStatus, SessionError> {
        self.sessions.manual_reconnect(task_id).await
    }

    pub fn connection_status(&self, task_id: &str) -> Option<ConnectionStatus> {
        self.sessions.status(task_id)
    }

    pub fn update_activity(&self, task_id: &str) -> bool {
        self.sessions.touch(task_id)
    }

    /// Rebuild connections for tasks that were live before a restart
    pub async fn reattach(&self, tasks: &[Task]) -> usize {
        let mut attached = 0;
        for task in tasks {
            if task.deleted || !matches!(task.status, TaskStatus::Running | TaskStatus::Cloning) {
                continue;
            }
            match self.sessions.manual_reconnect(&task.id).await {
                Ok(_) => attached += 1,
                Err(e) => warn!(task_id = %task.id, error = %e, "Reattach failed"),
            }
        }
        info!(attached, "Reattach complete");
        attached
    }

    // ─── Transcript ───

    pub fn read_transcript(&self, task_id: &str, lines: Option<usize>) -> Result<String, TranscriptError> {
        self.transcripts.read(task_id, lines)
    }

    pub fn read_transcript_from(&self, task_id: &str, offset: u64) -> Result<TranscriptChunk, TranscriptError> {
        self.transcripts.read_from_offset(task_id, offset)
    }

    pub async fn overview(&self, task_id: &str) -> Result<TaskOverview, OverviewError> {
        let task = self.tasks.get_task(task_id).await?;
        let state = self.registry().get(task_id);
        let idle = self.transcripts.age(task_id)?;
        Ok(TaskOverview {
            needs_attention: needs_attention(task.status, idle, self.config.attention_after),
            idle_minutes: idle.map(|d| d.as_secs() / 60),
            transcript_length: self.transcripts.len(task_id)?,
            connection: state.as_ref().map(|s| s.status),
            reconnect_attempts: state.map(|s| s.reconnect_attempts).unwrap_or(0),
            id: task.id,
            status: task.status,
            vm_name: task.vm_name,
            vm_zone: task.vm_zone,
        })
    }
}

#[derive(Debug, thiserror::Error)]
pub enum OverviewError {
    #[error(transparent)]
    Store(#[from] TaskStoreError),

    #[error(transparent)]
    Transcript(#[from] TranscriptError),
}
