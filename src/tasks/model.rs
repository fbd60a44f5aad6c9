//! Task records as seen by the orchestrator
//!
//! The task record is owned by the surrounding service. The orchestrator only
//! reads it and writes back a handful of fields (status, VM coordinates,
//! metadata) through the [`TaskStore`](super::TaskStore) seam.
//!
//! # Status graph
//!
//! ```text
//! pending ─► provisioning ─► initializing ─► cloning ─► running
//!                 │                │             │          │
//!                 └────────────────┴──────┬──────┴──────────┘
//!                                         ▼
//!                           failed | stopped | completed
//! ```
//!
//! Terminal statuses are only left through an explicit retry reset.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Lifecycle status of a task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Provisioning,
    Initializing,
    Cloning,
    Running,
    Completed,
    Failed,
    Stopped,
}

impl TaskStatus {
    /// Statuses during which a VM exists and a connection may be kept alive
    pub fn is_active(self) -> bool {
        matches!(
            self,
            TaskStatus::Provisioning
                | TaskStatus::Initializing
                | TaskStatus::Cloning
                | TaskStatus::Running
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Stopped
        )
    }

    /// Whether `self -> next` is an edge of the status graph.
    ///
    /// Retry resets (terminal -> pending) are deliberately not edges; they go
    /// through `Provisioner::retry_task`.
    pub fn can_transition_to(self, next: TaskStatus) -> bool {
        use TaskStatus::*;
        match (self, next) {
            (Pending, Provisioning) => true,
            (Provisioning, Initializing) => true,
            (Initializing, Cloning) => true,
            (Cloning, Running) => true,
            (from, Failed | Stopped | Completed) => from.is_active(),
            _ => false,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Provisioning => "provisioning",
            TaskStatus::Initializing => "initializing",
            TaskStatus::Cloning => "cloning",
            TaskStatus::Running => "running",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Stopped => "stopped",
        }
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which coding agent CLI runs on the VM
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum AgentKind {
    #[default]
    ClaudeCode,
    Codex,
    Gemini,
}

impl AgentKind {
    /// Binary that must be on PATH once the startup script has run
    pub fn cli_binary(self) -> &'static str {
        match self {
            AgentKind::ClaudeCode => "claude",
            AgentKind::Codex => "codex",
            AgentKind::Gemini => "gemini",
        }
    }

    /// Global npm package providing the CLI
    pub fn npm_package(self) -> &'static str {
        match self {
            AgentKind::ClaudeCode => "@anthropic-ai/claude-code",
            AgentKind::Codex => "@openai/codex",
            AgentKind::Gemini => "@google/gemini-cli",
        }
    }

    /// Command typed into the tmux session to start the agent
    pub fn launch_command(self) -> &'static str {
        match self {
            AgentKind::ClaudeCode => "claude --dangerously-skip-permissions",
            AgentKind::Codex => "codex --full-auto",
            AgentKind::Gemini => "gemini --yolo",
        }
    }
}

/// Structured metadata stashed on the task record.
///
/// `vm_user` and `workspace_path` are written once during provisioning so that
/// reconnects resume into the same place even if configuration changes.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vm_user: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workspace_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repository_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_branch: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub git_user_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub git_user_email: Option<String>,
    /// Integration-specific fields the orchestrator passes through untouched
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl TaskMetadata {
    /// Shallow merge: every field set in `partial` overwrites ours.
    pub fn merge(&mut self, partial: TaskMetadata) {
        fn take(slot: &mut Option<String>, value: Option<String>) {
            if value.is_some() {
                *slot = value;
            }
        }
        take(&mut self.vm_user, partial.vm_user);
        take(&mut self.workspace_path, partial.workspace_path);
        take(&mut self.repository_url, partial.repository_url);
        take(&mut self.base_branch, partial.base_branch);
        take(&mut self.branch_name, partial.branch_name);
        take(&mut self.git_user_name, partial.git_user_name);
        take(&mut self.git_user_email, partial.git_user_email);
        self.extra.extend(partial.extra);
    }

    /// Repository directory name derived from the clone URL
    pub fn repository_name(&self) -> Option<String> {
        let url = self.repository_url.as_deref()?;
        let last = url
            .trim_end_matches('/')
            .rsplit(|c: char| c == '/' || c == ':')
            .next()?;
        let name = last.trim_end_matches(".git");
        if name.is_empty() {
            None
        } else {
            Some(name.to_string())
        }
    }
}

/// A unit of work: one coding agent working on one repository branch
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub status: TaskStatus,
    #[serde(default)]
    pub vm_name: Option<String>,
    #[serde(default)]
    pub vm_zone: Option<String>,
    #[serde(default)]
    pub vm_external_ip: Option<String>,
    #[serde(default)]
    pub agent: AgentKind,
    pub description: String,
    #[serde(default)]
    pub metadata: TaskMetadata,
    /// Soft-delete flag, orthogonal to status
    #[serde(default)]
    pub deleted: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Task {
    /// Create a new pending task
    pub fn new(description: impl Into<String>, agent: AgentKind) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            status: TaskStatus::Pending,
            vm_name: None,
            vm_zone: None,
            vm_external_ip: None,
            agent,
            description: description.into(),
            metadata: TaskMetadata::default(),
            deleted: false,
            created_at: now,
            updated_at: now,
        }
    }

    /// Active and not soft-deleted
    pub fn is_active(&self) -> bool {
        !self.deleted && self.status.is_active()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_graph_happy_path() {
        use TaskStatus::*;
        let path = [Pending, Provisioning, Initializing, Cloning, Running];
        for pair in path.windows(2) {
            assert!(pair[0].can_transition_to(pair[1]), "{} -> {}", pair[0], pair[1]);
        }
        assert!(!Pending.can_transition_to(Running));
        assert!(!Running.can_transition_to(Cloning));
    }

    #[test]
    fn test_terminal_statuses_are_sticky() {
        use TaskStatus::*;
        for terminal in [Completed, Failed, Stopped] {
            for next in [Pending, Provisioning, Initializing, Cloning, Running, Failed, Stopped, Completed] {
                assert!(!terminal.can_transition_to(next), "{} -> {}", terminal, next);
            }
        }
    }

    #[test]
    fn test_active_statuses_can_stop_or_fail() {
        use TaskStatus::*;
        for active in [Provisioning, Initializing, Cloning, Running] {
            assert!(active.can_transition_to(Stopped));
            assert!(active.can_transition_to(Completed));
            assert!(active.can_transition_to(Failed));
        }
        assert!(!Pending.can_transition_to(Stopped));
    }

    #[test]
    fn test_status_serializes_lowercase() {
        let json = serde_json::to_string(&TaskStatus::Initializing).unwrap();
        assert_eq!(json, "\"initializing\"");
    }

    #[test]
    fn test_metadata_merge_keeps_unset_fields() {
        let mut meta = TaskMetadata {
            vm_user: Some("agent".into()),
            repository_url: Some("https://github.com/acme/widgets.git".into()),
            ..Default::default()
        };
        meta.merge(TaskMetadata {
            workspace_path: Some("/home/agent/widgets".into()),
            ..Default::default()
        });
        assert_eq!(meta.vm_user.as_deref(), Some("agent"));
        assert_eq!(meta.workspace_path.as_deref(), Some("/home/agent/widgets"));
    }

    #[test]
    fn test_repository_name() {
        let mut meta = TaskMetadata::default();
        meta.repository_url = Some("git@github.com:acme/widgets.git".into());
        assert_eq!(meta.repository_name().as_deref(), Some("widgets"));
        meta.repository_url = Some("https://gitlab.com/acme/tools/".into());
        assert_eq!(meta.repository_name().as_deref(), Some("tools"));
    }

    #[test]
    fn test_deleted_task_is_inactive() {
        let mut task = Task::new("fix the build", AgentKind::Codex);
        task.status = TaskStatus::Running;
        assert!(task.is_active());
        task.deleted = true;
        assert!(!task.is_active());
    }
}
