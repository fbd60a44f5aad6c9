//! In-process fake cloud shared by the integration tests

#![allow(dead_code)]

use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use agentvisor::config::{OrchestratorConfig, SettleDelays};
use agentvisor::tasks::{AgentKind, MemoryTaskStore, Task, TaskMetadata, TaskStatus};
use agentvisor::transcript::TranscriptStore;
use agentvisor::transport::{
    EventStream, ExecOutput, InstanceInfo, InstanceProvider, InstanceSpec, OutputChunk, RemoteShell,
    ShellSession, TransportError, TransportEvent, VmTarget,
};
use agentvisor::Orchestrator;

/// Line the fake startup script prints; carries a secret that must be redacted
pub const STARTUP_SECRET: &str = "sk-ant-REDACTED";

// ─────────────────────────────────────────────────────────────────────────────
// FakeSession
// ─────────────────────────────────────────────────────────────────────────────

/// Interactive session whose remote side is driven by the test
pub struct FakeSession {
    events: mpsc::UnboundedSender<TransportEvent>,
    writes: Mutex<Vec<String>>,
    resizes: Mutex<Vec<(u16, u16)>>,
    closed: AtomicBool,
}

impl FakeSession {
    fn new() -> (Arc<Self>, EventStream) {
        let (tx, rx) = mpsc::unbounded_channel();
        let session = Arc::new(Self {
            events: tx,
            writes: Mutex::new(Vec::new()),
            resizes: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        });
        (session, rx)
    }

    /// Pretend the remote terminal printed `text`
    pub fn emit(&self, text: &str) {
        let _ = self.events.send(TransportEvent::Data(text.as_bytes().to_vec()));
    }

    /// Pretend the tunnel process exited
    pub fn drop_connection(&self, code: Option<i32>) {
        self.closed.store(true, Ordering::SeqCst);
        let _ = self.events.send(TransportEvent::Closed(code));
    }

    pub fn writes(&self) -> Vec<String> {
        self.writes.lock().unwrap().clone()
    }

    /// All writes joined, as the remote shell would see the byte stream
    pub fn typed(&self) -> String {
        self.writes().concat()
    }

    pub fn resizes(&self) -> Vec<(u16, u16)> {
        self.resizes.lock().unwrap().clone()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ShellSession for FakeSession {
    async fn write(&self, data: &[u8]) -> Result<(), TransportError> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }
        let text = String::from_utf8_lossy(data).into_owned();
        if text.contains("echo agentvisor-probe") {
            self.emit("agentvisor-probe\r\nagent@vm:~$ ");
        }
        self.writes.lock().unwrap().push(text);
        Ok(())
    }

    async fn resize(&self, cols: u16, rows: u16) -> Result<(), TransportError> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }
        self.resizes.lock().unwrap().push((cols, rows));
        Ok(())
    }

    async fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            let _ = self.events.send(TransportEvent::Closed(None));
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// FakeCloud
// ─────────────────────────────────────────────────────────────────────────────

/// Scriptable stand-in for the gcloud CLI
pub struct FakeCloud {
    reachable: AtomicBool,
    instance_exists: AtomicBool,
    agent_installed: AtomicBool,
    startup_exit: AtomicI32,
    startup_hangs: AtomicBool,
    /// Output senders kept alive past the command, like an orphaned remote process
    lingering: Mutex<Vec<mpsc::UnboundedSender<OutputChunk>>>,
    opens: AtomicU32,
    /// (n, delay): the n-th `open` call takes `delay` before answering
    slow_open: Mutex<Option<(u32, Duration)>>,
    sessions: Mutex<Vec<Arc<FakeSession>>>,
    created: Mutex<Vec<InstanceSpec>>,
    deleted: Mutex<Vec<String>>,
    execs: Mutex<Vec<String>>,
    staged_scripts: Mutex<Vec<String>>,
}

impl FakeCloud {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            reachable: AtomicBool::new(true),
            instance_exists: AtomicBool::new(true),
            agent_installed: AtomicBool::new(true),
            startup_exit: AtomicI32::new(0),
            startup_hangs: AtomicBool::new(false),
            lingering: Mutex::new(Vec::new()),
            opens: AtomicU32::new(0),
            slow_open: Mutex::new(None),
            sessions: Mutex::new(Vec::new()),
            created: Mutex::new(Vec::new()),
            deleted: Mutex::new(Vec::new()),
            execs: Mutex::new(Vec::new()),
            staged_scripts: Mutex::new(Vec::new()),
        })
    }

    pub fn set_reachable(&self, reachable: bool) {
        self.reachable.store(reachable, Ordering::SeqCst);
    }

    pub fn set_instance_exists(&self, exists: bool) {
        self.instance_exists.store(exists, Ordering::SeqCst);
    }

    pub fn set_agent_installed(&self, installed: bool) {
        self.agent_installed.store(installed, Ordering::SeqCst);
    }

    pub fn set_startup_exit(&self, code: i32) {
        self.startup_exit.store(code, Ordering::SeqCst);
    }

    /// Make the `n`-th open (1-based) hang for `delay`
    pub fn delay_open(&self, n: u32, delay: Duration) {
        *self.slow_open.lock().unwrap() = Some((n, delay));
    }

    /// Sessions that have not been closed
    pub fn open_sessions(&self) -> usize {
        self.sessions().iter().filter(|s| !s.is_closed()).count()
    }

    /// Startup script times out while something on the VM keeps its output open
    pub fn set_startup_hangs(&self, hangs: bool) {
        self.startup_hangs.store(hangs, Ordering::SeqCst);
    }

    pub fn opens(&self) -> u32 {
        self.opens.load(Ordering::SeqCst)
    }

    pub fn sessions(&self) -> Vec<Arc<FakeSession>> {
        self.sessions.lock().unwrap().clone()
    }

    /// The most recently opened session
    pub fn last_session(&self) -> Arc<FakeSession> {
        self.sessions().last().cloned().expect("no session opened")
    }

    pub fn created(&self) -> Vec<InstanceSpec> {
        self.created.lock().unwrap().clone()
    }

    pub fn deleted(&self) -> Vec<String> {
        self.deleted.lock().unwrap().clone()
    }

    pub fn execs(&self) -> Vec<String> {
        self.execs.lock().unwrap().clone()
    }

    pub fn staged_scripts(&self) -> Vec<String> {
        self.staged_scripts.lock().unwrap().clone()
    }
}

#[async_trait]
impl RemoteShell for FakeCloud {
    async fn open(&self, _target: &VmTarget) -> Result<(Arc<dyn ShellSession>, EventStream), TransportError> {
        let n = self.opens.fetch_add(1, Ordering::SeqCst) + 1;
        let slow = *self.slow_open.lock().unwrap();
        if let Some((at, delay)) = slow {
            if at == n {
                tokio::time::sleep(delay).await;
            }
        }
        if !self.reachable.load(Ordering::SeqCst) {
            return Err(TransportError::Tunnel("Connection refused".into()));
        }
        let (session, events) = FakeSession::new();
        self.sessions.lock().unwrap().push(session.clone());
        Ok((session, events))
    }

    async fn exec(&self, _target: &VmTarget, command: &str) -> Result<ExecOutput, TransportError> {
        self.execs.lock().unwrap().push(command.to_string());
        let installed = self.agent_installed.load(Ordering::SeqCst);
        if command.starts_with("command -v") && !installed {
            return Ok(ExecOutput {
                stdout: String::new(),
                stderr: String::new(),
                exit_code: 1,
            });
        }
        Ok(ExecOutput {
            stdout: "/usr/bin/claude\n".into(),
            stderr: String::new(),
            exit_code: 0,
        })
    }

    async fn exec_streaming(
        &self,
        _target: &VmTarget,
        command: &str,
        chunks: mpsc::UnboundedSender<OutputChunk>,
        timeout: Duration,
    ) -> Result<i32, TransportError> {
        self.execs.lock().unwrap().push(command.to_string());
        let _ = chunks.send(OutputChunk::Stdout("==> Installing base packages".into()));
        if self.startup_hangs.load(Ordering::SeqCst) {
            self.lingering.lock().unwrap().push(chunks);
            tokio::time::sleep(timeout).await;
            return Err(TransportError::Timeout(timeout));
        }
        let _ = chunks.send(OutputChunk::Stderr(format!("export ANTHROPIC_API_KEY={}", STARTUP_SECRET)));
        let _ = chunks.send(OutputChunk::Stdout("==> Startup complete".into()));
        Ok(self.startup_exit.load(Ordering::SeqCst))
    }

    async fn copy_to(&self, _target: &VmTarget, local_path: &Path, _remote_path: &str) -> Result<(), TransportError> {
        let script = std::fs::read_to_string(local_path)?;
        self.staged_scripts.lock().unwrap().push(script);
        Ok(())
    }
}

#[async_trait]
impl InstanceProvider for FakeCloud {
    async fn create_instance(&self, spec: &InstanceSpec) -> Result<InstanceInfo, TransportError> {
        self.created.lock().unwrap().push(spec.clone());
        Ok(InstanceInfo {
            external_ip: Some("203.0.113.10".into()),
        })
    }

    async fn delete_instance(&self, target: &VmTarget) -> Result<(), TransportError> {
        self.deleted.lock().unwrap().push(target.name.clone());
        Ok(())
    }

    async fn instance_exists(&self, _target: &VmTarget) -> Result<bool, TransportError> {
        Ok(self.instance_exists.load(Ordering::SeqCst))
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Harness
// ─────────────────────────────────────────────────────────────────────────────

/// Production timings shrunk so scenarios finish in milliseconds
pub fn test_config() -> OrchestratorConfig {
    let mut config = OrchestratorConfig::default();
    config.project = "test-project".into();
    config.zone = "us-central1-a".into();
    config.probe.waits = vec![Duration::from_millis(1)];
    config.probe.timeout = Duration::from_secs(2);
    config.reconnect.delay = Duration::from_millis(5);
    config.output_flush = Duration::from_millis(20);
    config.settle = SettleDelays::none();
    config
}

pub struct Harness {
    pub dir: tempfile::TempDir,
    pub cloud: Arc<FakeCloud>,
    pub tasks: Arc<MemoryTaskStore>,
    pub transcripts: Arc<TranscriptStore>,
    pub orchestrator: Orchestrator,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(test_config())
    }

    pub fn with_config(config: OrchestratorConfig) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let cloud = FakeCloud::new();
        let tasks = Arc::new(MemoryTaskStore::new());
        let transcripts = Arc::new(TranscriptStore::new(dir.path()).unwrap());
        let orchestrator = Orchestrator::new(
            cloud.clone(),
            cloud.clone(),
            tasks.clone(),
            transcripts.clone(),
            config,
        );
        Self {
            dir,
            cloud,
            tasks,
            transcripts,
            orchestrator,
        }
    }

    /// Insert a pending task with a repository to clone
    pub fn pending_task(&self, description: &str) -> String {
        let mut task = Task::new(description, AgentKind::ClaudeCode);
        task.metadata = TaskMetadata {
            repository_url: Some("https://github.com/acme/widgets.git".into()),
            branch_name: Some("agent/fix-login".into()),
            ..Default::default()
        };
        let id = task.id.clone();
        self.tasks.insert(task);
        id
    }

    /// Insert a task that already has a VM, as if provisioned by an earlier run
    pub fn provisioned_task(&self, status: TaskStatus) -> String {
        let mut task = Task::new("keep going", AgentKind::ClaudeCode);
        task.status = status;
        task.vm_name = Some(format!("agent-{}", &task.id[..8]));
        task.vm_zone = Some("us-central1-a".into());
        task.metadata.vm_user = Some("agent".into());
        let id = task.id.clone();
        self.tasks.insert(task);
        id
    }

    /// Provision a fresh task all the way to `running`
    pub async fn running_task(&self) -> String {
        let id = self.pending_task("fix the login redirect");
        self.orchestrator.start_task(&id).await.unwrap();
        id
    }

    pub async fn status(&self, id: &str) -> TaskStatus {
        use agentvisor::tasks::TaskStore;
        self.tasks.get_task(id).await.unwrap().status
    }

    pub fn transcript(&self, id: &str) -> String {
        self.transcripts.read(id, None).unwrap()
    }
}

/// Poll `check` until it holds, failing the test after `timeout`
pub async fn wait_until<F: Fn() -> bool>(timeout: Duration, check: F) {
    let deadline = tokio::time::Instant::now() + timeout;
    while !check() {
        assert!(tokio::time::Instant::now() < deadline, "condition not met within {:?}", timeout);
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
}
