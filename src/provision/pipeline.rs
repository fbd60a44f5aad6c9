//! Provisioning pipeline
//!
//! Drives one task from `pending` to `running`:
//!
//! ```text
//! pending
//!   │ record VM name/zone
//!   ▼
//! provisioning ── create VM ── probe shell (5 tries, 10/15/20/30s back-off)
//!   ▼
//! initializing ── stage + run startup script (streamed into the transcript)
//!   │             verify agent CLI
//!   ▼
//! cloning ─────── open session ─► attach ─► setup commands ─► start agent
//!   │             type the task description + CR
//!   ▼
//! running
//! ```
//!
//! Any fatal error appends an `[error]` notice, marks the task `failed` and
//! drops its connection. A task stopped or completed mid-flight wins: the
//! pipeline notices at its next step, drops any session it opened and aborts
//! with [`ProvisionError::Cancelled`] without touching the status.

use std::io::Write;
use std::os::unix::fs::OpenOptionsExt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, error, info, info_span, warn, Instrument};

use super::commands::{
    setup_plan, tmux_session_name, type_commands, type_text, vm_name_for, workspace_path_for,
    SetupContext,
};
use super::script::{render_startup_script, StartupScript, REMOTE_SCRIPT_PATH};
use crate::config::OrchestratorConfig;
use crate::connection::{SessionError, SessionManager};
use crate::metrics::{PROVISION_DURATION, SSH_PROBE_ATTEMPTS, TASKS_STARTED, TASK_OUTCOMES};
use crate::tasks::{AgentKind, Task, TaskMetadata, TaskStatus, TaskStore, TaskStoreError};
use crate::transcript::{TranscriptError, TranscriptStore, NOTICE_PREFIX};
use crate::transport::{
    shell_quote, InstanceProvider, InstanceSpec, OutputChunk, RemoteShell, TransportError,
    TransportEvent, VmTarget,
};

/// Characters that show up in a shell prompt
const PROMPT_CHARS: [char; 3] = ['$', '#', '>'];

/// Error type for provisioning and task lifecycle operations
#[derive(Debug, Error)]
pub enum ProvisionError {
    #[error("task {id} is {status}; expected {expected}")]
    InvalidState {
        id: String,
        status: TaskStatus,
        expected: &'static str,
    },

    #[error("task {id} was {outcome} while provisioning")]
    Cancelled { id: String, outcome: &'static str },

    #[error("failed to create VM: {0}")]
    CreateVm(#[source] TransportError),

    #[error("VM never became reachable over SSH after {0} attempts")]
    Unreachable(u32),

    #[error("startup script exited with code {0}")]
    StartupScript(i32),

    #[error("agent CLI `{0}` is not installed on the VM")]
    AgentMissing(&'static str),

    #[error("failed to stage startup script: {0}")]
    Staging(#[source] std::io::Error),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Store(#[from] TaskStoreError),

    #[error(transparent)]
    Transcript(#[from] TranscriptError),

    #[error(transparent)]
    Session(#[from] SessionError),
}

/// Task lifecycle driver: start, stop, complete, retry
pub struct Provisioner {
    sessions: Arc<SessionManager>,
    shell: Arc<dyn RemoteShell>,
    provider: Arc<dyn InstanceProvider>,
    tasks: Arc<dyn TaskStore>,
    transcripts: Arc<TranscriptStore>,
    config: Arc<OrchestratorConfig>,
}

impl Provisioner {
    pub fn new(
        sessions: Arc<SessionManager>,
        shell: Arc<dyn RemoteShell>,
        provider: Arc<dyn InstanceProvider>,
        tasks: Arc<dyn TaskStore>,
        transcripts: Arc<TranscriptStore>,
        config: Arc<OrchestratorConfig>,
    ) -> Self {
        Self {
            sessions,
            shell,
            provider,
            tasks,
            transcripts,
            config,
        }
    }

    /// Provision a pending task through to `running`
    pub async fn start_task(&self, task_id: &str) -> Result<(), ProvisionError> {
        let task = self.tasks.get_task(task_id).await?;
        if task.deleted || task.status != TaskStatus::Pending {
            return Err(ProvisionError::InvalidState {
                id: task_id.to_string(),
                status: task.status,
                expected: "pending",
            });
        }

        TASKS_STARTED.inc();
        let started = Instant::now();
        let span = info_span!("provision", task_id = %task_id, agent = ?task.agent);
        let result = self.provision(task).instrument(span).await;

        match result {
            Ok(()) => {
                PROVISION_DURATION.observe(started.elapsed().as_secs_f64());
                Ok(())
            }
            Err(e) => {
                let aborted = match e {
                    ProvisionError::Cancelled { .. } => e,
                    e => match self.finished(task_id).await {
                        Some(task) => {
                            debug!(task_id, error = %e, "Provisioning error after the task finished");
                            cancelled(&task)
                        }
                        None => {
                            self.fail(task_id, &e).await;
                            return Err(e);
                        }
                    },
                };
                if let ProvisionError::Cancelled { outcome, .. } = &aborted {
                    info!(task_id, outcome = *outcome, "Provisioning aborted, task already finished");
                    self.notice(task_id, &format!("provisioning aborted: task was {}", outcome));
                }
                // A session opened after the stop would otherwise outlive the task
                self.sessions.disconnect(task_id).await;
                Err(aborted)
            }
        }
    }

    async fn provision(&self, task: Task) -> Result<(), ProvisionError> {
        let id = task.id.as_str();
        let target = VmTarget::new(vm_name_for(id), self.config.zone.clone(), self.config.project.clone());

        self.tasks.update_task_vm_name(id, Some(target.name.clone())).await?;
        self.tasks.update_task_vm_zone(id, Some(target.zone.clone())).await?;
        self.transcripts.init(id)?;
        self.advance(id, TaskStatus::Provisioning).await?;

        // ─── VM ───
        self.notice(id, &format!("creating VM {} in {}", target.name, target.zone));
        let spec = InstanceSpec {
            target: target.clone(),
            machine_type: self.config.machine_type.clone(),
            image_family: self.config.image_family.clone(),
            image_project: self.config.image_project.clone(),
            disk_size_gb: self.config.disk_size_gb,
            labels: vec![
                ("agentvisor-task".to_string(), id.to_ascii_lowercase()),
                ("agentvisor-agent".to_string(), agent_label(task.agent)),
            ],
        };
        let instance = self
            .provider
            .create_instance(&spec)
            .await
            .map_err(ProvisionError::CreateVm)?;
        if let Some(ip) = &instance.external_ip {
            self.tasks.update_task_external_ip(id, Some(ip.clone())).await?;
        }
        self.notice(id, &format!("VM {} created", target.name));

        let attempts = self.wait_for_shell(id, &target).await?;
        SSH_PROBE_ATTEMPTS.observe(attempts as f64);
        self.notice(id, &format!("shell reachable after {} attempt(s)", attempts));
        self.advance(id, TaskStatus::Initializing).await?;

        // ─── Toolchain ───
        let vm_user = task
            .metadata
            .vm_user
            .clone()
            .unwrap_or_else(|| self.config.vm_user.clone());
        let workspace = task
            .metadata
            .workspace_path
            .clone()
            .unwrap_or_else(|| workspace_path_for(&task, &vm_user));
        self.tasks
            .update_task_metadata(
                id,
                TaskMetadata {
                    vm_user: Some(vm_user.clone()),
                    workspace_path: Some(workspace.clone()),
                    ..Default::default()
                },
            )
            .await?;

        self.run_startup_script(id, &target, &vm_user, task.agent).await?;
        self.verify_agent_cli(id, &target, task.agent).await?;
        self.advance(id, TaskStatus::Cloning).await?;

        // ─── Persistent session ───
        self.sessions
            .begin_connecting(id, target.clone(), vm_user.clone())
            .await;
        let (session, events) = self.shell.open(&target).await?;
        self.sessions
            .attach(id, target.clone(), vm_user.clone(), session.clone(), events)
            .await;
        self.ensure_active(id).await?;

        let tmux_session = tmux_session_name(id);
        let launch = self.config.launch_command(task.agent);
        let plan = setup_plan(&SetupContext {
            task: &task,
            vm_user: &vm_user,
            workspace_path: &workspace,
            tmux_session: &tmux_session,
            launch_command: &launch,
        });
        self.notice(id, &format!("running {} setup commands", plan.len()));
        type_commands(session.as_ref(), &plan, &self.config.settle).await?;
        self.ensure_active(id).await?;

        type_text(session.as_ref(), &task.description, &self.config.settle).await?;
        self.advance(id, TaskStatus::Running).await?;
        self.notice(id, "agent started");
        info!("Task running");
        Ok(())
    }

    /// Probe until a shell prompt answers. Returns the attempt that succeeded.
    ///
    /// The first attempt is immediate; waits only follow failures.
    async fn wait_for_shell(&self, task_id: &str, target: &VmTarget) -> Result<u32, ProvisionError> {
        let policy = &self.config.probe;
        for attempt in 1..=policy.attempts {
            self.ensure_active(task_id).await?;
            match self.probe(target).await {
                Ok(()) => return Ok(attempt),
                Err(e) => {
                    warn!(attempt, error = %e, "SSH probe failed");
                    if attempt < policy.attempts {
                        let wait = policy.wait_after_failure(attempt);
                        self.notice(
                            task_id,
                            &format!(
                                "SSH not ready (attempt {}/{}: {}); retrying in {}s",
                                attempt,
                                policy.attempts,
                                e,
                                wait.as_secs()
                            ),
                        );
                        tokio::time::sleep(wait).await;
                    }
                }
            }
        }
        self.notice(
            task_id,
            &format!("SSH connection failed: VM unreachable after {} attempts", policy.attempts),
        );
        Err(ProvisionError::Unreachable(policy.attempts))
    }

    /// Open a throwaway session, send a test command and wait for prompt characters
    async fn probe(&self, target: &VmTarget) -> Result<(), TransportError> {
        let timeout = self.config.probe.timeout;
        let (session, mut events) = self.shell.open(target).await?;

        let outcome = tokio::time::timeout(timeout, async {
            session.write(b"echo agentvisor-probe\r").await?;
            let mut seen = String::new();
            while let Some(event) = events.recv().await {
                match event {
                    TransportEvent::Data(bytes) => {
                        seen.push_str(&String::from_utf8_lossy(&bytes));
                        if seen.contains(PROMPT_CHARS) {
                            return Ok(());
                        }
                    }
                    TransportEvent::Error(message) => return Err(TransportError::Tunnel(message)),
                    TransportEvent::Closed(_) => return Err(TransportError::Closed),
                }
            }
            Err(TransportError::Closed)
        })
        .await;

        session.close().await;
        match outcome {
            Ok(result) => result,
            Err(_) => Err(TransportError::Timeout(timeout)),
        }
    }

    async fn run_startup_script(
        &self,
        task_id: &str,
        target: &VmTarget,
        vm_user: &str,
        agent: AgentKind,
    ) -> Result<(), ProvisionError> {
        let script = render_startup_script(&StartupScript {
            vm_user,
            agent,
            env: &self.config.agent_env,
        });

        let local = stage_script(&script).map_err(ProvisionError::Staging)?;
        let copied = self.shell.copy_to(target, &local, REMOTE_SCRIPT_PATH).await;
        if let Err(e) = std::fs::remove_file(&local) {
            debug!(path = %local.display(), error = %e, "Failed to remove staged script");
        }
        copied?;

        self.notice(task_id, "running startup script");
        let script_path = shell_quote(REMOTE_SCRIPT_PATH);
        let command = format!(
            "sudo bash {p}; rc=$?; sudo rm -f {p}; exit $rc",
            p = script_path
        );
        let (tx, mut rx) = mpsc::unbounded_channel();
        let exec = self
            .shell
            .exec_streaming(target, &command, tx, self.config.startup_timeout);
        tokio::pin!(exec);

        // The command's end decides, not the channel's: a leftover remote
        // process may keep the output open long after the script returned.
        let code = loop {
            tokio::select! {
                biased;
                Some(chunk) = rx.recv() => self.mirror_startup_line(task_id, chunk),
                code = &mut exec => break code,
            }
        };
        while let Ok(chunk) = rx.try_recv() {
            self.mirror_startup_line(task_id, chunk);
        }
        let code = code?;

        if code != 0 {
            return Err(ProvisionError::StartupScript(code));
        }
        self.notice(task_id, "startup script finished");
        Ok(())
    }

    fn mirror_startup_line(&self, task_id: &str, chunk: OutputChunk) {
        let line = match chunk {
            OutputChunk::Stdout(line) | OutputChunk::Stderr(line) => line,
        };
        if let Err(e) = self.transcripts.append_line(task_id, &format!("[startup] {}", line)) {
            warn!(error = %e, "Failed to mirror startup output");
        }
    }

    async fn verify_agent_cli(&self, task_id: &str, target: &VmTarget, agent: AgentKind) -> Result<(), ProvisionError> {
        let binary = agent.cli_binary();
        let output = self
            .shell
            .exec(target, &format!("command -v {}", binary))
            .await?;
        if !output.success() {
            return Err(ProvisionError::AgentMissing(binary));
        }
        self.notice(task_id, &format!("{} found at {}", binary, output.stdout.trim()));
        Ok(())
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Terminal transitions
    // ─────────────────────────────────────────────────────────────────────────

    /// Stop an active task and tear down its VM
    pub async fn stop_task(&self, task_id: &str) -> Result<(), ProvisionError> {
        self.finish(task_id, TaskStatus::Stopped).await
    }

    /// Mark an active task completed and tear down its VM
    pub async fn complete_task(&self, task_id: &str) -> Result<(), ProvisionError> {
        self.finish(task_id, TaskStatus::Completed).await
    }

    /// Status first, then the session, then the VM. The event pump checks the
    /// status when the session closes, so writing it first keeps the close from
    /// being treated as a connection loss.
    async fn finish(&self, task_id: &str, status: TaskStatus) -> Result<(), ProvisionError> {
        let task = self.tasks.get_task(task_id).await?;
        if !task.status.can_transition_to(status) {
            return Err(ProvisionError::InvalidState {
                id: task_id.to_string(),
                status: task.status,
                expected: "an active status",
            });
        }

        self.tasks.update_task_status(task_id, status).await?;
        TASK_OUTCOMES.with_label_values(&[status.as_str()]).inc();
        self.notice(task_id, &format!("task {}", status));
        info!(task_id, status = %status, "Task finished");

        self.sessions.disconnect(task_id).await;
        self.delete_vm(&task).await;
        Ok(())
    }

    /// Reset a finished task and provision it again from scratch
    pub async fn retry_task(&self, task_id: &str) -> Result<(), ProvisionError> {
        let task = self.tasks.get_task(task_id).await?;
        if task.deleted || !task.status.is_terminal() {
            return Err(ProvisionError::InvalidState {
                id: task_id.to_string(),
                status: task.status,
                expected: "completed, failed or stopped",
            });
        }

        info!(task_id, previous = %task.status, "Retrying task");
        self.sessions.disconnect(task_id).await;
        self.delete_vm(&task).await;
        self.transcripts.reset(
            task_id,
            &format!("{} task reset for retry at {}", NOTICE_PREFIX, Utc::now().to_rfc3339()),
        )?;
        self.tasks.reset_task(task_id).await?;
        self.start_task(task_id).await
    }

    /// Best effort: an orphaned VM can be cleaned up later, a stuck status cannot
    async fn delete_vm(&self, task: &Task) {
        let (Some(name), Some(zone)) = (task.vm_name.clone(), task.vm_zone.clone()) else {
            return;
        };
        let target = VmTarget::new(name, zone, self.config.project.clone());
        match self.provider.delete_instance(&target).await {
            Ok(()) => self.notice(&task.id, &format!("VM {} deleted", target.name)),
            Err(e) => {
                warn!(task_id = %task.id, vm = %target, error = %e, "VM deletion failed");
                self.notice(&task.id, &format!("VM {} could not be deleted: {}", target.name, e));
            }
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Helpers
    // ─────────────────────────────────────────────────────────────────────────

    /// Move along the status graph, refusing to leave a terminal status
    async fn advance(&self, task_id: &str, next: TaskStatus) -> Result<(), ProvisionError> {
        let task = self.tasks.get_task(task_id).await?;
        if task.deleted || task.status.is_terminal() {
            return Err(cancelled(&task));
        }
        if !task.status.can_transition_to(next) {
            return Err(ProvisionError::InvalidState {
                id: task_id.to_string(),
                status: task.status,
                expected: "the preceding provisioning status",
            });
        }
        self.tasks.update_task_status(task_id, next).await?;
        info!(status = %next, "Task status advanced");
        Ok(())
    }

    async fn ensure_active(&self, task_id: &str) -> Result<(), ProvisionError> {
        let task = self.tasks.get_task(task_id).await?;
        if task.is_active() {
            Ok(())
        } else {
            Err(cancelled(&task))
        }
    }

    /// The task, if something else has already ended it
    async fn finished(&self, task_id: &str) -> Option<Task> {
        self.tasks
            .get_task(task_id)
            .await
            .ok()
            .filter(|task| task.deleted || task.status.is_terminal())
    }

    async fn fail(&self, task_id: &str, err: &ProvisionError) {
        error!(task_id, error = %err, "Provisioning failed");
        self.notice(task_id, &format!("[error] provisioning failed: {}", err));
        match self.tasks.get_task(task_id).await {
            Ok(task) if task.status.can_transition_to(TaskStatus::Failed) => {
                match self.tasks.update_task_status(task_id, TaskStatus::Failed).await {
                    Ok(()) => TASK_OUTCOMES.with_label_values(&["failed"]).inc(),
                    Err(e) => warn!(task_id, error = %e, "Failed to mark task failed"),
                }
            }
            Ok(_) => {}
            Err(e) => warn!(task_id, error = %e, "Failed to load task"),
        }
        self.sessions.disconnect(task_id).await;
    }

    fn notice(&self, task_id: &str, message: &str) {
        if let Err(e) = self.transcripts.append_notice(task_id, message) {
            warn!(task_id, error = %e, "Failed to append transcript notice");
        }
    }
}

fn cancelled(task: &Task) -> ProvisionError {
    let outcome = if task.deleted {
        "deleted"
    } else {
        match task.status {
            TaskStatus::Stopped => "stopped",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "marked failed",
            _ => "taken out of provisioning",
        }
    };
    ProvisionError::Cancelled {
        id: task.id.clone(),
        outcome,
    }
}

fn agent_label(agent: AgentKind) -> String {
    serde_json::to_value(agent)
        .ok()
        .and_then(|v| v.as_str().map(str::to_string))
        .unwrap_or_else(|| agent.cli_binary().to_string())
}

/// Write the rendered script to a private local file for upload
fn stage_script(script: &str) -> std::io::Result<PathBuf> {
    let path = std::env::temp_dir().join(format!("agentvisor-startup-{}.sh", uuid::Uuid::now_v7()));
    let mut file = std::fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .mode(0o600)
        .open(&path)?;
    file.write_all(script.as_bytes())?;
    Ok(path)
}
