//! Task persistence seam
//!
//! The orchestrator never owns task records. Everything it needs from the
//! surrounding service goes through [`TaskStore`]. Two implementations ship
//! with the crate:
//!
//! - [`JsonTaskStore`] - one pretty-printed JSON document per task on disk,
//!   used by the `agentvisor` binary
//! - [`MemoryTaskStore`] - in-process map, used by tests and embedders

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::Utc;
use thiserror::Error;

use super::model::{Task, TaskMetadata, TaskStatus};

/// Error type for task store operations
#[derive(Debug, Error)]
pub enum TaskStoreError {
    #[error("task not found: {0}")]
    NotFound(String),

    #[error("invalid task id: {0:?}")]
    InvalidId(String),

    #[error("task store I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("task record is corrupt: {0}")]
    Serde(#[from] serde_json::Error),
}

/// Calls the orchestrator makes into the task owner
#[async_trait]
pub trait TaskStore: Send + Sync {
    async fn get_task(&self, id: &str) -> Result<Task, TaskStoreError>;

    async fn update_task_status(&self, id: &str, status: TaskStatus) -> Result<(), TaskStoreError>;

    async fn update_task_vm_name(&self, id: &str, vm_name: Option<String>) -> Result<(), TaskStoreError>;

    async fn update_task_vm_zone(&self, id: &str, zone: Option<String>) -> Result<(), TaskStoreError>;

    async fn update_task_external_ip(&self, id: &str, ip: Option<String>) -> Result<(), TaskStoreError>;

    /// Shallow-merge `partial` into the task's metadata
    async fn update_task_metadata(&self, id: &str, partial: TaskMetadata) -> Result<(), TaskStoreError>;

    /// Put a terminal task back to `pending` with its VM coordinates cleared
    async fn reset_task(&self, id: &str) -> Result<(), TaskStoreError>;
}

/// Apply a field update shared by both stores
fn apply(task: &mut Task, update: Update) {
    match update {
        Update::Status(status) => task.status = status,
        Update::VmName(name) => task.vm_name = name,
        Update::VmZone(zone) => task.vm_zone = zone,
        Update::ExternalIp(ip) => task.vm_external_ip = ip,
        Update::Metadata(partial) => task.metadata.merge(partial),
        Update::Reset => {
            task.status = TaskStatus::Pending;
            task.vm_name = None;
            task.vm_zone = None;
            task.vm_external_ip = None;
        }
    }
    task.updated_at = Utc::now();
}

enum Update {
    Status(TaskStatus),
    VmName(Option<String>),
    VmZone(Option<String>),
    ExternalIp(Option<String>),
    Metadata(TaskMetadata),
    Reset,
}

// ─────────────────────────────────────────────────────────────────────────────
// JsonTaskStore
// ─────────────────────────────────────────────────────────────────────────────

/// File-backed task store (`{base_dir}/{task_id}.json`)
pub struct JsonTaskStore {
    base_dir: PathBuf,
    /// Serializes read-modify-write cycles
    write_lock: Mutex<()>,
}

impl JsonTaskStore {
    /// Create a new task store, creating the directory if needed
    pub fn new(base_dir: impl Into<PathBuf>) -> std::io::Result<Self> {
        let base_dir = base_dir.into();
        std::fs::create_dir_all(&base_dir)?;
        Ok(Self {
            base_dir,
            write_lock: Mutex::new(()),
        })
    }

    /// Persist a brand new task
    pub fn create(&self, task: &Task) -> Result<(), TaskStoreError> {
        let _guard = self.write_lock.lock().unwrap_or_else(|e| e.into_inner());
        self.save(task)
    }

    /// List all non-deleted tasks, newest first
    pub fn list(&self) -> Result<Vec<Task>, TaskStoreError> {
        let mut tasks = Vec::new();
        for entry in std::fs::read_dir(&self.base_dir)? {
            let path = entry?.path();
            if path.extension().map(|e| e == "json").unwrap_or(false) {
                match load_from_path(&path) {
                    Ok(task) if !task.deleted => tasks.push(task),
                    Ok(_) => {}
                    Err(e) => tracing::warn!(path = %path.display(), error = %e, "Skipping unreadable task record"),
                }
            }
        }
        tasks.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(tasks)
    }

    /// Mark a task deleted without removing its record
    pub fn soft_delete(&self, id: &str) -> Result<(), TaskStoreError> {
        let _guard = self.write_lock.lock().unwrap_or_else(|e| e.into_inner());
        let mut task = self.load(id)?;
        task.deleted = true;
        task.updated_at = Utc::now();
        self.save(&task)
    }

    fn modify(&self, id: &str, update: Update) -> Result<(), TaskStoreError> {
        let _guard = self.write_lock.lock().unwrap_or_else(|e| e.into_inner());
        let mut task = self.load(id)?;
        apply(&mut task, update);
        self.save(&task)
    }

    fn load(&self, id: &str) -> Result<Task, TaskStoreError> {
        let path = self.task_path(id)?;
        if !path.exists() {
            return Err(TaskStoreError::NotFound(id.to_string()));
        }
        load_from_path(&path)
    }

    fn save(&self, task: &Task) -> Result<(), TaskStoreError> {
        let path = self.task_path(&task.id)?;
        let json = serde_json::to_string_pretty(task)?;
        // Write-then-rename so readers never see a half-written record
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, json)?;
        std::fs::rename(&tmp, &path)?;
        Ok(())
    }

    fn task_path(&self, id: &str) -> Result<PathBuf, TaskStoreError> {
        if !is_safe_id(id) {
            return Err(TaskStoreError::InvalidId(id.to_string()));
        }
        Ok(self.base_dir.join(format!("{}.json", id)))
    }
}

fn load_from_path(path: &Path) -> Result<Task, TaskStoreError> {
    let json = std::fs::read_to_string(path)?;
    Ok(serde_json::from_str(&json)?)
}

/// Task ids end up in file names and tmux session names
pub(crate) fn is_safe_id(id: &str) -> bool {
    !id.is_empty()
        && id.len() <= 128
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

#[async_trait]
impl TaskStore for JsonTaskStore {
    async fn get_task(&self, id: &str) -> Result<Task, TaskStoreError> {
        self.load(id)
    }

    async fn update_task_status(&self, id: &str, status: TaskStatus) -> Result<(), TaskStoreError> {
        self.modify(id, Update::Status(status))
    }

    async fn update_task_vm_name(&self, id: &str, vm_name: Option<String>) -> Result<(), TaskStoreError> {
        self.modify(id, Update::VmName(vm_name))
    }

    async fn update_task_vm_zone(&self, id: &str, zone: Option<String>) -> Result<(), TaskStoreError> {
        self.modify(id, Update::VmZone(zone))
    }

    async fn update_task_external_ip(&self, id: &str, ip: Option<String>) -> Result<(), TaskStoreError> {
        self.modify(id, Update::ExternalIp(ip))
    }

    async fn update_task_metadata(&self, id: &str, partial: TaskMetadata) -> Result<(), TaskStoreError> {
        self.modify(id, Update::Metadata(partial))
    }

    async fn reset_task(&self, id: &str) -> Result<(), TaskStoreError> {
        self.modify(id, Update::Reset)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// MemoryTaskStore
// ─────────────────────────────────────────────────────────────────────────────

/// In-memory task store
#[derive(Default)]
pub struct MemoryTaskStore {
    tasks: Mutex<HashMap<String, Task>>,
    /// Every status written, in order, per task
    history: Mutex<HashMap<String, Vec<TaskStatus>>>,
}

impl MemoryTaskStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, task: Task) {
        let mut tasks = self.tasks.lock().unwrap_or_else(|e| e.into_inner());
        tasks.insert(task.id.clone(), task);
    }

    /// Statuses written through `update_task_status`, oldest first
    pub fn status_history(&self, id: &str) -> Vec<TaskStatus> {
        let history = self.history.lock().unwrap_or_else(|e| e.into_inner());
        history.get(id).cloned().unwrap_or_default()
    }

    fn modify(&self, id: &str, update: Update) -> Result<(), TaskStoreError> {
        let status = match &update {
            Update::Status(s) => Some(*s),
            _ => None,
        };
        {
            let mut tasks = self.tasks.lock().unwrap_or_else(|e| e.into_inner());
            let task = tasks
                .get_mut(id)
                .ok_or_else(|| TaskStoreError::NotFound(id.to_string()))?;
            apply(task, update);
        }
        if let Some(status) = status {
            let mut history = self.history.lock().unwrap_or_else(|e| e.into_inner());
            history.entry(id.to_string()).or_default().push(status);
        }
        Ok(())
    }
}

#[async_trait]
impl TaskStore for MemoryTaskStore {
    async fn get_task(&self, id: &str) -> Result<Task, TaskStoreError> {
        let tasks = self.tasks.lock().unwrap_or_else(|e| e.into_inner());
        tasks
            .get(id)
            .cloned()
            .ok_or_else(|| TaskStoreError::NotFound(id.to_string()))
    }

    async fn update_task_status(&self, id: &str, status: TaskStatus) -> Result<(), TaskStoreError> {
        self.modify(id, Update::Status(status))
    }

    async fn update_task_vm_name(&self, id: &str, vm_name: Option<String>) -> Result<(), TaskStoreError> {
        self.modify(id, Update::VmName(vm_name))
    }

    async fn update_task_vm_zone(&self, id: &str, zone: Option<String>) -> Result<(), TaskStoreError> {
        self.modify(id, Update::VmZone(zone))
    }

    async fn update_task_external_ip(&self, id: &str, ip: Option<String>) -> Result<(), TaskStoreError> {
        self.modify(id, Update::ExternalIp(ip))
    }

    async fn update_task_metadata(&self, id: &str, partial: TaskMetadata) -> Result<(), TaskStoreError> {
        self.modify(id, Update::Metadata(partial))
    }

    async fn reset_task(&self, id: &str) -> Result<(), TaskStoreError> {
        self.modify(id, Update::Reset)
    }
}
