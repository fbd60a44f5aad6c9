//! Remote Session Transport
//!
//! Everything the orchestrator does to a VM goes through two traits:
//!
//! - [`RemoteShell`] - interactive pseudo-terminal sessions plus one-shot
//!   command execution and file staging
//! - [`InstanceProvider`] - create / delete / probe VM instances
//!
//! # Event model
//!
//! An interactive session is split into a write half ([`ShellSession`]) and an
//! ordered stream of [`TransportEvent`]s. The consumer iterates the stream; there
//! are no callbacks to register, so nothing can be missed between `open()`
//! returning and the consumer starting to listen.
//!
//! ```text
//! RemoteShell::open(vm) ──► (Arc<dyn ShellSession>, EventStream)
//!                                  │                    │
//!                       write / resize / close     Data(bytes) ...
//!                                                  Error(msg)
//!                                                  Closed(exit code)   ← always last
//! ```
//!
//! The production implementation ([`GcloudCompute`]) drives the `gcloud` CLI.

pub mod gcloud;
pub mod pty;

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;

pub use gcloud::{GcloudCompute, GcloudConfig};
pub use pty::PtySession;

/// Coordinates needed to reach a VM without consulting the task record
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VmTarget {
    pub name: String,
    pub zone: String,
    pub project: String,
}

impl VmTarget {
    pub fn new(name: impl Into<String>, zone: impl Into<String>, project: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            zone: zone.into(),
            project: project.into(),
        }
    }
}

impl std::fmt::Display for VmTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}/{}", self.project, self.zone, self.name)
    }
}

/// Events produced by an interactive session, in arrival order
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// Bytes read from the remote terminal
    Data(Vec<u8>),
    /// The local tunnel process reported an error; a `Closed` usually follows
    Error(String),
    /// The session ended. `None` when the exit code is unknown.
    Closed(Option<i32>),
}

/// Receiving half of a session's event stream
pub type EventStream = mpsc::UnboundedReceiver<TransportEvent>;

/// A chunk of output from a streamed one-shot command
#[derive(Debug, Clone, PartialEq)]
pub enum OutputChunk {
    Stdout(String),
    Stderr(String),
}

/// Result of a blocking one-shot command
#[derive(Debug, Clone)]
pub struct ExecOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

impl ExecOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// What to create when provisioning a VM
#[derive(Debug, Clone)]
pub struct InstanceSpec {
    pub target: VmTarget,
    pub machine_type: String,
    pub image_family: String,
    pub image_project: String,
    pub disk_size_gb: u32,
    pub labels: Vec<(String, String)>,
}

/// What the provider reports after creating a VM
#[derive(Debug, Clone, Default)]
pub struct InstanceInfo {
    pub external_ip: Option<String>,
}

/// Error type for transport and provider operations
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("pty error: {0}")]
    Pty(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("command timed out after {0:?}")]
    Timeout(Duration),

    #[error("command exited with code {code}: {stderr}")]
    CommandFailed { code: i32, stderr: String },

    #[error("session is closed")]
    Closed,

    #[error("tunnel error: {0}")]
    Tunnel(String),

    #[error("unexpected provider response: {0}")]
    Parse(String),
}

/// Write half of an interactive session
#[async_trait]
pub trait ShellSession: Send + Sync {
    /// Feed bytes to the remote shell
    async fn write(&self, data: &[u8]) -> Result<(), TransportError>;

    /// Propagate a terminal geometry change
    async fn resize(&self, cols: u16, rows: u16) -> Result<(), TransportError>;

    /// Terminate the local process driving the tunnel. Idempotent.
    async fn close(&self);
}

/// Shell access to named VMs
#[async_trait]
pub trait RemoteShell: Send + Sync {
    /// Open a pseudo-terminal backed shell on the VM
    async fn open(&self, target: &VmTarget) -> Result<(Arc<dyn ShellSession>, EventStream), TransportError>;

    /// Run a command to completion and collect its output
    async fn exec(&self, target: &VmTarget, command: &str) -> Result<ExecOutput, TransportError>;

    /// Run a command, forwarding output chunks as they arrive.
    ///
    /// Returns the exit code. Fails with [`TransportError::Timeout`] (after
    /// killing the process) when the command does not finish within `timeout`.
    async fn exec_streaming(
        &self,
        target: &VmTarget,
        command: &str,
        chunks: mpsc::UnboundedSender<OutputChunk>,
        timeout: Duration,
    ) -> Result<i32, TransportError>;

    /// Copy a local file onto the VM
    async fn copy_to(&self, target: &VmTarget, local_path: &Path, remote_path: &str) -> Result<(), TransportError>;
}

/// VM instance lifecycle
#[async_trait]
pub trait InstanceProvider: Send + Sync {
    async fn create_instance(&self, spec: &InstanceSpec) -> Result<InstanceInfo, TransportError>;

    async fn delete_instance(&self, target: &VmTarget) -> Result<(), TransportError>;

    async fn instance_exists(&self, target: &VmTarget) -> Result<bool, TransportError>;
}

/// Quote a string for safe interpolation into a POSIX shell command line
pub fn shell_quote(s: &str) -> String {
    if !s.is_empty()
        && s
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./:@=+,".contains(c))
    {
        return s.to_string();
    }
    format!("'{}'", s.replace('\'', r"'\''"))
}
