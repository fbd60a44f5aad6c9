//! Session manager
//!
//! Owns the per-task event pump and the reconnection state machine, and
//! exposes the caller-facing session operations (instructions, resize, manual
//! reconnect).
//!
//! # Event pump
//!
//! ```text
//! EventStream ──► Data(bytes)  ──► line buffer ─► transcript.append (whole lines)
//!                                  + touch last_activity
//!             ──► Error(msg)   ──► transcript notice + handle_disconnect
//!             ──► Closed(code) ──► handle_disconnect
//!                                     │
//!                  task inactive? ────┼──► drop the entry
//!                                     ▼
//!                           disconnected ─► trigger_reconnect
//! ```
//!
//! Each attached session gets a generation number. A pump only acts while its
//! generation still owns the registry entry, so events from a replaced or
//! deliberately closed session are ignored.

use std::sync::Arc;

use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, info, info_span, warn, Instrument};

use super::registry::{ConnectionRegistry, ConnectionState, ConnectionStatus};
use crate::config::OrchestratorConfig;
use crate::metrics::{RECONNECT_ATTEMPTS, TASK_OUTCOMES};
use crate::provision::commands::{resume_plan, tmux_session_name, type_commands, type_text};
use crate::tasks::{TaskStatus, TaskStore, TaskStoreError};
use crate::transcript::{LineBuffer, TranscriptError, TranscriptStore};
use crate::transport::{
    EventStream, InstanceProvider, RemoteShell, ShellSession, TransportError, TransportEvent, VmTarget,
};

/// Error type for session operations
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("no active connection for task {0}")]
    NoActiveConnection(String),

    #[error("task {0} is not in an active status")]
    TaskInactive(String),

    #[error("task {0} has no VM recorded")]
    MissingVm(String),

    #[error("VM {0} no longer exists")]
    InstanceMissing(String),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Store(#[from] TaskStoreError),

    #[error(transparent)]
    Transcript(#[from] TranscriptError),
}

/// Keeps every task's interactive session alive
pub struct SessionManager {
    registry: Arc<ConnectionRegistry>,
    shell: Arc<dyn RemoteShell>,
    provider: Arc<dyn InstanceProvider>,
    tasks: Arc<dyn TaskStore>,
    transcripts: Arc<TranscriptStore>,
    config: Arc<OrchestratorConfig>,
}

impl SessionManager {
    pub fn new(
        registry: Arc<ConnectionRegistry>,
        shell: Arc<dyn RemoteShell>,
        provider: Arc<dyn InstanceProvider>,
        tasks: Arc<dyn TaskStore>,
        transcripts: Arc<TranscriptStore>,
        config: Arc<OrchestratorConfig>,
    ) -> Arc<Self> {
        Arc::new(Self {
            registry,
            shell,
            provider,
            tasks,
            transcripts,
            config,
        })
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    pub fn tasks(&self) -> &Arc<dyn TaskStore> {
        &self.tasks
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Attaching sessions
    // ─────────────────────────────────────────────────────────────────────────

    /// Register a placeholder while a session is being opened
    pub async fn begin_connecting(&self, task_id: &str, target: VmTarget, vm_user: String) {
        let state = ConnectionState {
            session: None,
            status: ConnectionStatus::Connecting,
            tmux_session: tmux_session_name(task_id),
            last_activity: Instant::now(),
            reconnect_attempts: 0,
            target,
            vm_user,
            generation: self.registry.next_generation(),
        };
        if let Some(previous) = self.registry.upsert(task_id, state) {
            close_quietly(previous.session).await;
        }
    }

    /// Make `session` the task's live connection and start pumping its events.
    ///
    /// Any previous entry is replaced and its session closed.
    pub async fn attach(
        self: &Arc<Self>,
        task_id: &str,
        target: VmTarget,
        vm_user: String,
        session: Arc<dyn ShellSession>,
        events: EventStream,
    ) -> u64 {
        let generation = self.registry.next_generation();
        let state = ConnectionState {
            session: Some(session.clone()),
            status: ConnectionStatus::Connected,
            tmux_session: tmux_session_name(task_id),
            last_activity: Instant::now(),
            reconnect_attempts: 0,
            target,
            vm_user,
            generation,
        };
        if let Some(previous) = self.registry.upsert(task_id, state) {
            if let Some(old) = previous.session {
                if !Arc::ptr_eq(&old, &session) {
                    old.close().await;
                }
            }
        }
        self.spawn_pump(task_id, generation, events);
        debug!(task_id, generation, "Session attached");
        generation
    }

    fn spawn_pump(self: &Arc<Self>, task_id: &str, generation: u64, events: EventStream) {
        let span = info_span!("session_pump", task_id = %task_id, generation);
        let this = self.clone();
        let task_id = task_id.to_string();
        tokio::spawn(async move { this.pump(task_id, generation, events).await }.instrument(span));
    }

    async fn pump(self: Arc<Self>, task_id: String, generation: u64, mut events: EventStream) {
        let mut carry = Vec::new();
        let mut lines = LineBuffer::default();
        let reason = loop {
            let next = if lines.is_empty() {
                events.recv().await
            } else {
                match tokio::time::timeout(self.config.output_flush, events.recv()).await {
                    Ok(next) => next,
                    Err(_) => {
                        self.record(&task_id, lines.take());
                        continue;
                    }
                }
            };
            let Some(event) = next else {
                break "event stream ended".to_string();
            };
            if !self.owns(&task_id, generation) {
                debug!("Dropping events from a replaced session");
                self.record(&task_id, lines.take());
                return;
            }
            match event {
                TransportEvent::Data(bytes) => {
                    let text = decode_utf8(&mut carry, &bytes);
                    self.record(&task_id, lines.push(&text));
                    self.registry.touch(&task_id);
                }
                TransportEvent::Error(message) => {
                    self.record(&task_id, lines.take());
                    self.notice(&task_id, &format!("connection error: {}", message));
                    break format!("transport error: {}", message);
                }
                TransportEvent::Closed(code) => {
                    break match code {
                        Some(code) => format!("session closed with exit code {}", code),
                        None => "session closed".to_string(),
                    };
                }
            }
        };
        self.record(&task_id, lines.take());
        self.handle_disconnect(&task_id, generation, &reason).await;
    }

    /// Append terminal output released by the line buffer
    fn record(&self, task_id: &str, text: Option<String>) {
        let Some(text) = text else {
            return;
        };
        if let Err(e) = self.transcripts.append(task_id, &text) {
            warn!(error = %e, "Failed to append terminal output");
        }
    }

    fn owns(&self, task_id: &str, generation: u64) -> bool {
        self.registry.get(task_id).map(|s| s.generation) == Some(generation)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Reconnection
    // ─────────────────────────────────────────────────────────────────────────

    /// React to the end of a session owned by `generation`
    pub async fn handle_disconnect(self: &Arc<Self>, task_id: &str, generation: u64, reason: &str) {
        if !self.owns(task_id, generation) {
            return;
        }

        if !self.task_is_active(task_id).await {
            if let Some(state) = self.registry.remove_if_generation(task_id, generation) {
                info!(task_id, reason, "Session ended for inactive task, dropping connection state");
                close_quietly(state.session).await;
            }
            return;
        }

        let marked = self.registry.update(task_id, |s| {
            let live = matches!(s.status, ConnectionStatus::Connected | ConnectionStatus::Connecting);
            if s.generation == generation && live {
                s.status = ConnectionStatus::Disconnected;
                true
            } else {
                false
            }
        });
        if marked == Some(true) {
            warn!(task_id, reason, "Connection lost");
            self.notice(
                task_id,
                &format!(
                    "connection lost ({}); reconnecting in {}s",
                    reason,
                    self.config.reconnect.delay.as_secs()
                ),
            );
            self.trigger_reconnect(task_id);
        }
    }

    /// Mark a silent connection dead and reconnect it. Used by the health monitor.
    pub async fn mark_stale(self: &Arc<Self>, task_id: &str, generation: u64) -> bool {
        let marked = self.registry.update(task_id, |s| {
            if s.generation == generation && s.status == ConnectionStatus::Connected {
                s.status = ConnectionStatus::Disconnected;
                true
            } else {
                false
            }
        });
        if marked != Some(true) {
            return false;
        }
        self.notice(task_id, "no terminal activity, assuming the connection is dead; reconnecting");
        self.trigger_reconnect(task_id)
    }

    /// Start the reconnect loop unless one is already running.
    ///
    /// Returns true if this call started it.
    pub fn trigger_reconnect(self: &Arc<Self>, task_id: &str) -> bool {
        let claimed = self.registry.update(task_id, |s| {
            if s.status == ConnectionStatus::Reconnecting {
                false
            } else {
                s.status = ConnectionStatus::Reconnecting;
                true
            }
        });
        if claimed != Some(true) {
            return false;
        }

        let span = info_span!("reconnect", task_id = %task_id);
        let this = self.clone();
        let task_id = task_id.to_string();
        tokio::spawn(async move { this.run_reconnect(task_id).await }.instrument(span));
        true
    }

    async fn run_reconnect(self: Arc<Self>, task_id: String) {
        let max_attempts = self.config.reconnect.max_attempts;
        loop {
            let Some(state) = self.registry.get(&task_id) else {
                return;
            };
            if state.status != ConnectionStatus::Reconnecting {
                return;
            }

            if state.session.is_some() {
                self.registry.update(&task_id, |s| s.session = None);
                close_quietly(state.session.clone()).await;
            }

            tokio::time::sleep(self.config.reconnect.delay).await;

            if !self.task_is_active(&task_id).await {
                if let Some(state) = self.registry.remove(&task_id) {
                    close_quietly(state.session).await;
                }
                RECONNECT_ATTEMPTS.with_label_values(&["abandoned"]).inc();
                info!("Task no longer active, abandoning reconnect");
                return;
            }
            if self.registry.status(&task_id) != Some(ConnectionStatus::Reconnecting) {
                return;
            }

            let attempt = state.reconnect_attempts + 1;
            info!(attempt, max_attempts, vm = %state.target, "Reconnecting");

            match self.shell.open(&state.target).await {
                Ok((session, events)) => {
                    let generation = self.registry.next_generation();
                    let installed = self.registry.update(&task_id, |s| {
                        if s.status != ConnectionStatus::Reconnecting {
                            return false;
                        }
                        s.session = Some(session.clone());
                        s.status = ConnectionStatus::Connected;
                        s.reconnect_attempts = 0;
                        s.generation = generation;
                        s.last_activity = Instant::now();
                        true
                    });
                    if installed != Some(true) {
                        debug!("Connection state changed while reconnecting, discarding new session");
                        session.close().await;
                        return;
                    }

                    self.spawn_pump(&task_id, generation, events);
                    let plan = resume_plan(&state.vm_user, &state.tmux_session);
                    if let Err(e) = type_commands(session.as_ref(), &plan, &self.config.settle).await {
                        warn!(error = %e, "Failed to replay session resume sequence");
                    }
                    RECONNECT_ATTEMPTS.with_label_values(&["success"]).inc();
                    info!(attempt, "Reconnected");
                    self.notice(&task_id, "reconnected");
                    return;
                }
                Err(e) => {
                    let attempts = self.registry.update(&task_id, |s| {
                        s.reconnect_attempts += 1;
                        s.status = ConnectionStatus::Disconnected;
                        s.reconnect_attempts
                    });
                    let Some(attempts) = attempts else {
                        return;
                    };
                    RECONNECT_ATTEMPTS.with_label_values(&["failure"]).inc();
                    warn!(attempt = attempts, error = %e, "Reconnect attempt failed");
                    self.notice(
                        &task_id,
                        &format!("reconnect attempt {}/{} failed: {}", attempts, max_attempts, e),
                    );

                    if attempts >= max_attempts {
                        self.give_up(&task_id, attempts).await;
                        return;
                    }

                    let again = self.registry.update(&task_id, |s| {
                        if s.status == ConnectionStatus::Disconnected {
                            s.status = ConnectionStatus::Reconnecting;
                            true
                        } else {
                            false
                        }
                    });
                    if again != Some(true) {
                        return;
                    }
                }
            }
        }
    }

    /// Reconnection budget exhausted: fail the task and forget the connection
    async fn give_up(&self, task_id: &str, attempts: u32) {
        RECONNECT_ATTEMPTS.with_label_values(&["exhausted"]).inc();
        warn!(task_id, attempts, "Reconnection budget exhausted, failing task");

        match self.tasks.get_task(task_id).await {
            Ok(task) if task.status.can_transition_to(TaskStatus::Failed) => {
                if let Err(e) = self.tasks.update_task_status(task_id, TaskStatus::Failed).await {
                    warn!(task_id, error = %e, "Failed to mark task failed");
                } else {
                    TASK_OUTCOMES.with_label_values(&["failed"]).inc();
                }
            }
            Ok(_) => {}
            Err(e) => warn!(task_id, error = %e, "Failed to load task"),
        }
        self.notice(
            task_id,
            &format!("could not reconnect after {} attempts; task marked failed", attempts),
        );
        if let Some(state) = self.registry.remove(task_id) {
            close_quietly(state.session).await;
        }
    }

    /// Reconnect on request, even without in-memory state (e.g. after a restart).
    ///
    /// Uses the VM coordinates persisted on the task and confirms the instance
    /// still exists first. Resets the attempt counter.
    pub async fn manual_reconnect(self: &Arc<Self>, task_id: &str) -> Result<ConnectionStatus, SessionError> {
        let task = self.tasks.get_task(task_id).await?;
        if !task.is_active() {
            return Err(SessionError::TaskInactive(task_id.to_string()));
        }
        let (Some(vm_name), Some(zone)) = (task.vm_name.clone(), task.vm_zone.clone()) else {
            return Err(SessionError::MissingVm(task_id.to_string()));
        };
        let target = VmTarget::new(vm_name, zone, self.config.project.clone());

        if !self.provider.instance_exists(&target).await? {
            self.notice(task_id, &format!("manual reconnect failed: VM {} no longer exists", target.name));
            return Err(SessionError::InstanceMissing(target.name));
        }

        let vm_user = task
            .metadata
            .vm_user
            .clone()
            .unwrap_or_else(|| self.config.vm_user.clone());

        info!(task_id, vm = %target, "Manual reconnect");
        self.notice(task_id, "manual reconnect requested");
        self.begin_connecting(task_id, target.clone(), vm_user.clone()).await;

        let (session, events) = match self.shell.open(&target).await {
            Ok(opened) => opened,
            Err(e) => {
                self.registry.remove(task_id);
                RECONNECT_ATTEMPTS.with_label_values(&["failure"]).inc();
                self.notice(task_id, &format!("manual reconnect failed: {}", e));
                return Err(e.into());
            }
        };

        self.attach(task_id, target, vm_user.clone(), session.clone(), events)
            .await;
        let plan = resume_plan(&vm_user, &tmux_session_name(task_id));
        type_commands(session.as_ref(), &plan, &self.config.settle).await?;

        RECONNECT_ATTEMPTS.with_label_values(&["success"]).inc();
        self.notice(task_id, "reconnected");
        Ok(ConnectionStatus::Connected)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Caller-facing operations
    // ─────────────────────────────────────────────────────────────────────────

    /// Type `text` into the agent's terminal followed by a carriage return
    pub async fn send_instruction(&self, task_id: &str, text: &str) -> Result<(), SessionError> {
        let session = self.connected_session(task_id)?;
        type_text(session.as_ref(), text, &self.config.settle).await?;
        self.registry.touch(task_id);
        debug!(task_id, len = text.len(), "Instruction sent");
        Ok(())
    }

    /// Propagate a terminal size change. Returns false (and logs) when there is
    /// no connected session to resize.
    pub async fn resize(&self, task_id: &str, cols: u16, rows: u16) -> Result<bool, SessionError> {
        let Ok(session) = self.connected_session(task_id) else {
            warn!(task_id, cols, rows, "Resize ignored, task is not connected");
            return Ok(false);
        };
        session.resize(cols, rows).await?;
        Ok(true)
    }

    pub fn status(&self, task_id: &str) -> Option<ConnectionStatus> {
        self.registry.status(task_id)
    }

    /// Record activity on a task's connection
    pub fn touch(&self, task_id: &str) -> bool {
        self.registry.touch(task_id)
    }

    /// Forget a task's connection and close its session. Returns true if there was one.
    pub async fn disconnect(&self, task_id: &str) -> bool {
        match self.registry.remove(task_id) {
            Some(state) => {
                close_quietly(state.session).await;
                debug!(task_id, "Connection closed");
                true
            }
            None => false,
        }
    }

    fn connected_session(&self, task_id: &str) -> Result<Arc<dyn ShellSession>, SessionError> {
        self.registry
            .get(task_id)
            .filter(|s| s.status == ConnectionStatus::Connected)
            .and_then(|s| s.session)
            .ok_or_else(|| SessionError::NoActiveConnection(task_id.to_string()))
    }

    async fn task_is_active(&self, task_id: &str) -> bool {
        match self.tasks.get_task(task_id).await {
            Ok(task) => task.is_active(),
            Err(e) => {
                debug!(task_id, error = %e, "Task lookup failed, treating as inactive");
                false
            }
        }
    }

    fn notice(&self, task_id: &str, message: &str) {
        if let Err(e) = self.transcripts.append_notice(task_id, message) {
            warn!(task_id, error = %e, "Failed to append transcript notice");
        }
    }
}

async fn close_quietly(session: Option<Arc<dyn ShellSession>>) {
    if let Some(session) = session {
        session.close().await;
    }
}

/// Decode `bytes` as UTF-8, holding back an incomplete trailing sequence in
/// `carry` until the next chunk completes it
fn decode_utf8(carry: &mut Vec<u8>, bytes: &[u8]) -> String {
    carry.extend_from_slice(bytes);
    let mut out = String::new();
    loop {
        match std::str::from_utf8(carry) {
            Ok(text) => {
                out.push_str(text);
                carry.clear();
                return out;
            }
            Err(e) => {
                let valid = e.valid_up_to();
                out.push_str(std::str::from_utf8(&carry[..valid]).unwrap_or_default());
                match e.error_len() {
                    Some(bad) => {
                        out.push(char::REPLACEMENT_CHARACTER);
                        carry.drain(..valid + bad);
                    }
                    None => {
                        carry.drain(..valid);
                        return out;
                    }
                }
            }
        }
    }
}
