//! AgentVisor - runs autonomous coding agents on ephemeral cloud VMs
//!
//! Each task gets its own VM. The orchestrator provisions it, drives a
//! persistent terminal session into a tmux session on it, records a redacted
//! transcript of everything the terminal shows, and keeps the session alive
//! across network drops.
//!
//! # Modules
//!
//! - `transport` - remote shell sessions and VM lifecycle (`gcloud` + local PTY)
//! - `transcript` - append-only, redacted per-task transcripts
//! - `connection` - connection registry, event pump and reconnection
//! - `health` - periodic sweep for silently dead sessions
//! - `provision` - task lifecycle: VM, startup script, setup keystrokes
//! - `tasks` - task records and the store seam
//! - `orchestrator` - facade wiring the above together
//! - `api` - HTTP surface (axum)
//! - `config` - CLI, TOML file and runtime settings
//! - `metrics` - Prometheus metrics for observability
//!
//! # Quick Start
//!
//! ```ignore
//! use agentvisor::{Orchestrator, OrchestratorConfig, GcloudCompute};
//!
//! let cloud = Arc::new(GcloudCompute::new(config.gcloud.clone()));
//! let orchestrator = Orchestrator::new(cloud.clone(), cloud, tasks, transcripts, config);
//! orchestrator.spawn_health_monitor();
//! orchestrator.start_task(&task_id).await?;
//! ```

pub mod api;
pub mod config;
pub mod connection;
pub mod health;
pub mod metrics;
pub mod orchestrator;
pub mod provision;
pub mod tasks;
pub mod tracing;
pub mod transcript;
pub mod transport;

// Re-export commonly used types at crate root for convenience
pub use config::{Args, OrchestratorConfig};
pub use connection::{ConnectionRegistry, ConnectionStatus, SessionError, SessionManager};
pub use health::HealthMonitor;
pub use orchestrator::{Orchestrator, TaskOverview};
pub use provision::{ProvisionError, Provisioner};
pub use tasks::{AgentKind, JsonTaskStore, MemoryTaskStore, Task, TaskStatus, TaskStore};
pub use transcript::TranscriptStore;
pub use transport::GcloudCompute;
