//! Configuration
//!
//! Three layers, later wins:
//!
//! ```text
//! built-in defaults ─► TOML file (--config) ─► CLI flags / AGENTVISOR_* env
//!                                    │
//!                                    ▼
//!                          OrchestratorConfig (Durations)
//! ```
//!
//! The defaults are the observable timing contract: 5 SSH probes with
//! 10s/15s/20s/30s back-off, 5 reconnect attempts 5s apart, a 30s health sweep,
//! and 5 minute staleness and idle-attention thresholds.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::Parser;
use serde::Deserialize;
use thiserror::Error;

use crate::provision::commands::CommandKind;
use crate::tasks::AgentKind;
use crate::transport::GcloudConfig;

/// Error type for configuration loading
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid config file: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// agentvisor - runs coding agents on ephemeral cloud VMs
#[derive(Parser, Debug, Clone)]
#[command(name = "agentvisor", version)]
pub struct Args {
    /// HTTP bind address
    #[arg(long, env = "AGENTVISOR_LISTEN", default_value = "127.0.0.1:7420")]
    pub listen: String,

    /// TOML configuration file
    #[arg(long, env = "AGENTVISOR_CONFIG")]
    pub config: Option<PathBuf>,

    /// Directory for task records and transcripts
    #[arg(long, env = "AGENTVISOR_DATA_DIR")]
    pub data_dir: Option<PathBuf>,

    /// Cloud project (overrides the config file)
    #[arg(long, env = "AGENTVISOR_PROJECT")]
    pub project: Option<String>,

    /// Default zone for new VMs (overrides the config file)
    #[arg(long, env = "AGENTVISOR_ZONE")]
    pub zone: Option<String>,

    /// OTLP collector endpoint; spans are exported only when set
    #[arg(long, env = "AGENTVISOR_OTLP_ENDPOINT")]
    pub otlp_endpoint: Option<String>,

    /// Emit logs as JSON lines
    #[arg(long, env = "AGENTVISOR_LOG_JSON")]
    pub log_json: bool,

    /// Reconnect to every running task at startup
    #[arg(long, env = "AGENTVISOR_REATTACH")]
    pub reattach: bool,
}

impl Args {
    pub fn data_dir(&self) -> PathBuf {
        self.data_dir.clone().unwrap_or_else(|| {
            std::env::var("HOME")
                .map(|h| PathBuf::from(h).join(".agentvisor"))
                .unwrap_or_else(|_| PathBuf::from("/tmp/agentvisor"))
        })
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// File format
// ─────────────────────────────────────────────────────────────────────────────

/// On-disk configuration. Every field has a default.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FileConfig {
    pub cloud: CloudSection,
    pub ssh: SshSection,
    pub session: SessionSection,
    pub health: HealthSection,
    pub setup: SetupSection,
    pub agent: AgentSection,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CloudSection {
    pub project: String,
    pub zone: String,
    pub machine_type: String,
    pub image_family: String,
    pub image_project: String,
    pub disk_size_gb: u32,
    pub gcloud_bin: String,
    pub tunnel_through_iap: bool,
}

impl Default for CloudSection {
    fn default() -> Self {
        Self {
            project: String::new(),
            zone: "us-central1-a".to_string(),
            machine_type: "e2-standard-4".to_string(),
            image_family: "ubuntu-2204-lts".to_string(),
            image_project: "ubuntu-os-cloud".to_string(),
            disk_size_gb: 50,
            gcloud_bin: "gcloud".to_string(),
            tunnel_through_iap: true,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SshSection {
    pub keepalive_interval_secs: u32,
    pub keepalive_count_max: u32,
    pub probe_attempts: u32,
    pub probe_waits_secs: Vec<u64>,
    pub probe_timeout_secs: u64,
    pub cols: u16,
    pub rows: u16,
}

impl Default for SshSection {
    fn default() -> Self {
        Self {
            keepalive_interval_secs: 15,
            keepalive_count_max: 4,
            probe_attempts: 5,
            probe_waits_secs: vec![10, 15, 20, 30],
            probe_timeout_secs: 20,
            cols: 120,
            rows: 40,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SessionSection {
    pub vm_user: String,
    pub reconnect_max_attempts: u32,
    pub reconnect_delay_secs: u64,
    /// How long a partial output line may wait for its newline
    pub output_flush_ms: u64,
}

impl Default for SessionSection {
    fn default() -> Self {
        Self {
            vm_user: "agent".to_string(),
            reconnect_max_attempts: 5,
            reconnect_delay_secs: 5,
            output_flush_ms: 250,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct HealthSection {
    pub period_secs: u64,
    pub stale_after_secs: u64,
    pub attention_after_secs: u64,
}

impl Default for HealthSection {
    fn default() -> Self {
        Self {
            period_secs: 30,
            stale_after_secs: 300,
            attention_after_secs: 300,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SetupSection {
    pub settle_simple_ms: u64,
    pub settle_multiplexer_ms: u64,
    pub settle_clone_ms: u64,
    pub settle_install_ms: u64,
    pub settle_agent_start_ms: u64,
    pub settle_submit_ms: u64,
    pub startup_timeout_secs: u64,
}

impl Default for SetupSection {
    fn default() -> Self {
        let settle = SettleDelays::default();
        Self {
            settle_simple_ms: settle.simple.as_millis() as u64,
            settle_multiplexer_ms: settle.multiplexer.as_millis() as u64,
            settle_clone_ms: settle.clone.as_millis() as u64,
            settle_install_ms: settle.install.as_millis() as u64,
            settle_agent_start_ms: settle.agent_start.as_millis() as u64,
            settle_submit_ms: settle.submit.as_millis() as u64,
            startup_timeout_secs: 900,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AgentSection {
    /// Exported into the VM user's profile before the agent starts
    pub env: BTreeMap<String, String>,
    /// Launch command overrides keyed by agent kind (`claude-code`, `codex`, `gemini`)
    pub launch: BTreeMap<String, String>,
}

impl FileConfig {
    /// Load from `path`, or return defaults when no path is given
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let Some(path) = path else {
            return Ok(Self::default());
        };
        let contents = std::fs::read_to_string(path).map_err(|e| ConfigError::Read {
            path: path.to_path_buf(),
            source: e,
        })?;
        Ok(toml::from_str(&contents)?)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Runtime configuration
// ─────────────────────────────────────────────────────────────────────────────

/// Connectivity probe schedule used while waiting for a fresh VM
#[derive(Debug, Clone)]
pub struct ProbePolicy {
    pub attempts: u32,
    /// Wait after the n-th failed attempt; the last entry repeats
    pub waits: Vec<Duration>,
    /// How long one probe waits for a shell prompt
    pub timeout: Duration,
}

impl ProbePolicy {
    /// Wait before attempt `attempt + 1`, given `attempt` (1-based) just failed
    pub fn wait_after_failure(&self, attempt: u32) -> Duration {
        let idx = (attempt.saturating_sub(1) as usize).min(self.waits.len().saturating_sub(1));
        self.waits.get(idx).copied().unwrap_or_default()
    }
}

impl Default for ProbePolicy {
    fn default() -> Self {
        Self {
            attempts: 5,
            waits: [10, 15, 20, 30].into_iter().map(Duration::from_secs).collect(),
            timeout: Duration::from_secs(20),
        }
    }
}

/// Reconnection ceiling and spacing
#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    pub max_attempts: u32,
    pub delay: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            delay: Duration::from_secs(5),
        }
    }
}

/// Pause after each interactive command, by kind.
///
/// The interactive shell gives no completion signal, so each command is
/// followed by a fixed wait sized for what it usually takes.
#[derive(Debug, Clone)]
pub struct SettleDelays {
    pub simple: Duration,
    pub multiplexer: Duration,
    pub clone: Duration,
    pub install: Duration,
    pub agent_start: Duration,
    /// Between typed free text and its carriage return
    pub submit: Duration,
}

impl SettleDelays {
    pub fn for_kind(&self, kind: CommandKind) -> Duration {
        match kind {
            CommandKind::Simple => self.simple,
            CommandKind::Multiplexer => self.multiplexer,
            CommandKind::Clone => self.clone,
            CommandKind::Install => self.install,
            CommandKind::AgentStart => self.agent_start,
        }
    }

    /// All zero; for tests driving a fake shell
    pub fn none() -> Self {
        Self {
            simple: Duration::ZERO,
            multiplexer: Duration::ZERO,
            clone: Duration::ZERO,
            install: Duration::ZERO,
            agent_start: Duration::ZERO,
            submit: Duration::ZERO,
        }
    }
}

impl Default for SettleDelays {
    fn default() -> Self {
        Self {
            simple: Duration::from_millis(1_000),
            multiplexer: Duration::from_millis(2_000),
            clone: Duration::from_millis(15_000),
            install: Duration::from_millis(10_000),
            agent_start: Duration::from_millis(8_000),
            submit: Duration::from_millis(200),
        }
    }
}

/// Everything the orchestrator components read at runtime
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub project: String,
    pub zone: String,
    pub machine_type: String,
    pub image_family: String,
    pub image_project: String,
    pub disk_size_gb: u32,
    /// Unix user the agent runs as on the VM
    pub vm_user: String,
    pub probe: ProbePolicy,
    pub reconnect: ReconnectPolicy,
    /// Idle time after which a held-back partial output line is written
    pub output_flush: Duration,
    pub health_period: Duration,
    pub stale_after: Duration,
    pub attention_after: Duration,
    pub settle: SettleDelays,
    pub startup_timeout: Duration,
    pub agent_env: BTreeMap<String, String>,
    pub launch_overrides: BTreeMap<String, String>,
    pub gcloud: GcloudConfig,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self::from_file(FileConfig::default())
    }
}

impl OrchestratorConfig {
    /// Convert a parsed file into runtime settings
    pub fn from_file(file: FileConfig) -> Self {
        let FileConfig {
            cloud,
            ssh,
            session,
            health,
            setup,
            agent,
        } = file;

        Self {
            project: cloud.project,
            zone: cloud.zone,
            machine_type: cloud.machine_type,
            image_family: cloud.image_family,
            image_project: cloud.image_project,
            disk_size_gb: cloud.disk_size_gb,
            vm_user: session.vm_user,
            probe: ProbePolicy {
                attempts: ssh.probe_attempts,
                waits: ssh.probe_waits_secs.into_iter().map(Duration::from_secs).collect(),
                timeout: Duration::from_secs(ssh.probe_timeout_secs),
            },
            reconnect: ReconnectPolicy {
                max_attempts: session.reconnect_max_attempts,
                delay: Duration::from_secs(session.reconnect_delay_secs),
            },
            output_flush: Duration::from_millis(session.output_flush_ms),
            health_period: Duration::from_secs(health.period_secs),
            stale_after: Duration::from_secs(health.stale_after_secs),
            attention_after: Duration::from_secs(health.attention_after_secs),
            settle: SettleDelays {
                simple: Duration::from_millis(setup.settle_simple_ms),
                multiplexer: Duration::from_millis(setup.settle_multiplexer_ms),
                clone: Duration::from_millis(setup.settle_clone_ms),
                install: Duration::from_millis(setup.settle_install_ms),
                agent_start: Duration::from_millis(setup.settle_agent_start_ms),
                submit: Duration::from_millis(setup.settle_submit_ms),
            },
            startup_timeout: Duration::from_secs(setup.startup_timeout_secs),
            agent_env: agent.env,
            launch_overrides: agent.launch,
            gcloud: GcloudConfig {
                gcloud_bin: cloud.gcloud_bin,
                tunnel_through_iap: cloud.tunnel_through_iap,
                server_alive_interval: ssh.keepalive_interval_secs,
                server_alive_count_max: ssh.keepalive_count_max,
                cols: ssh.cols,
                rows: ssh.rows,
            },
        }
    }

    /// Load the file named by `--config` and apply CLI overrides
    pub fn resolve(args: &Args) -> Result<Self, ConfigError> {
        let file = FileConfig::load(args.config.as_deref())?;
        let mut config = Self::from_file(file);
        if let Some(project) = &args.project {
            config.project = project.clone();
        }
        if let Some(zone) = &args.zone {
            config.zone = zone.clone();
        }
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.project.trim().is_empty() {
            return Err(ConfigError::Invalid(
                "cloud.project is required (config file, --project or AGENTVISOR_PROJECT)".into(),
            ));
        }
        if self.zone.trim().is_empty() {
            return Err(ConfigError::Invalid("cloud.zone must not be empty".into()));
        }
        if self.probe.attempts == 0 {
            return Err(ConfigError::Invalid("ssh.probe_attempts must be at least 1".into()));
        }
        if self.probe.waits.is_empty() {
            return Err(ConfigError::Invalid("ssh.probe_waits_secs must not be empty".into()));
        }
        if self.output_flush.is_zero() {
            return Err(ConfigError::Invalid("session.output_flush_ms must be positive".into()));
        }
        if self.health_period.is_zero() {
            return Err(ConfigError::Invalid("health.period_secs must be positive".into()));
        }
        for key in self.launch_overrides.keys() {
            if parse_agent_kind(key).is_none() {
                return Err(ConfigError::Invalid(format!("unknown agent kind in agent.launch: {key}")));
            }
        }
        for name in self.agent_env.keys() {
            let valid = !name.is_empty()
                && !name.starts_with(|c: char| c.is_ascii_digit())
                && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_');
            if !valid {
                return Err(ConfigError::Invalid(format!("invalid environment variable name: {name:?}")));
            }
        }
        Ok(())
    }

    /// Launch command for `kind`, honouring overrides
    pub fn launch_command(&self, kind: AgentKind) -> String {
        self.launch_overrides
            .iter()
            .find(|(key, _)| parse_agent_kind(key) == Some(kind))
            .map(|(_, cmd)| cmd.clone())
            .unwrap_or_else(|| kind.launch_command().to_string())
    }
}

fn parse_agent_kind(name: &str) -> Option<AgentKind> {
    serde_json::from_value(serde_json::Value::String(name.to_string())).ok()
}
