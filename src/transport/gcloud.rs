//! `gcloud` CLI implementation of the transport traits
//!
//! Interactive sessions run `gcloud compute ssh` inside a local PTY; one-shot
//! commands run the same tunnel with `--command` as a plain child process.
//! Instance lifecycle goes through `gcloud compute instances`.

use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::pty::PtySession;
use super::{
    EventStream, ExecOutput, InstanceInfo, InstanceProvider, InstanceSpec, OutputChunk,
    RemoteShell, ShellSession, TransportError, VmTarget,
};

/// How long output may keep flowing after a streamed command has exited
const READER_DRAIN_GRACE: Duration = Duration::from_secs(2);

/// Settings for the `gcloud` driven transport
#[derive(Debug, Clone)]
pub struct GcloudConfig {
    /// Path or name of the `gcloud` executable
    pub gcloud_bin: String,
    /// Tunnel ssh through Identity-Aware Proxy instead of the external IP
    pub tunnel_through_iap: bool,
    /// Seconds between ssh keepalive probes
    pub server_alive_interval: u32,
    /// Unanswered keepalive probes tolerated before the channel is declared dead
    pub server_alive_count_max: u32,
    /// Initial PTY geometry for interactive sessions
    pub cols: u16,
    pub rows: u16,
}

impl Default for GcloudConfig {
    fn default() -> Self {
        Self {
            gcloud_bin: "gcloud".to_string(),
            tunnel_through_iap: true,
            server_alive_interval: 15,
            server_alive_count_max: 4,
            cols: 120,
            rows: 40,
        }
    }
}

/// Google Compute Engine access through the `gcloud` CLI
#[derive(Debug, Clone, Default)]
pub struct GcloudCompute {
    config: GcloudConfig,
}

impl GcloudCompute {
    pub fn new(config: GcloudConfig) -> Self {
        Self { config }
    }

    fn target_args(&self, target: &VmTarget) -> Vec<String> {
        let mut args = vec![
            format!("--zone={}", target.zone),
            format!("--project={}", target.project),
        ];
        if self.config.tunnel_through_iap {
            args.push("--tunnel-through-iap".to_string());
        }
        args
    }

    fn keepalive_args(&self) -> Vec<String> {
        vec![
            "-o".to_string(),
            format!("ServerAliveInterval={}", self.config.server_alive_interval),
            "-o".to_string(),
            format!("ServerAliveCountMax={}", self.config.server_alive_count_max),
            "-o".to_string(),
            "TCPKeepAlive=yes".to_string(),
        ]
    }

    /// Arguments for an interactive ssh session with a forced remote TTY
    fn interactive_args(&self, target: &VmTarget) -> Vec<String> {
        let mut args = vec!["compute".to_string(), "ssh".to_string(), target.name.clone()];
        args.extend(self.target_args(target));
        args.push("--quiet".to_string());
        args.push("--".to_string());
        args.push("-tt".to_string());
        args.extend(self.keepalive_args());
        args
    }

    /// Arguments for a one-shot remote command
    fn command_args(&self, target: &VmTarget, command: &str) -> Vec<String> {
        let mut args = vec!["compute".to_string(), "ssh".to_string(), target.name.clone()];
        args.extend(self.target_args(target));
        args.push("--quiet".to_string());
        args.push(format!("--command={}", command));
        args.push("--".to_string());
        args.extend(self.keepalive_args());
        args
    }

    fn command(&self, args: &[String]) -> Command {
        let mut cmd = Command::new(&self.config.gcloud_bin);
        cmd.args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }

    async fn run(&self, args: &[String]) -> Result<ExecOutput, TransportError> {
        let output = self
            .command(args)
            .output()
            .await
            .map_err(|e| TransportError::Spawn {
                program: self.config.gcloud_bin.clone(),
                source: e,
            })?;

        Ok(ExecOutput {
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            exit_code: output.status.code().unwrap_or(-1),
        })
    }

    async fn run_checked(&self, args: &[String]) -> Result<ExecOutput, TransportError> {
        let output = self.run(args).await?;
        if !output.success() {
            return Err(TransportError::CommandFailed {
                code: output.exit_code,
                stderr: output.stderr.trim().to_string(),
            });
        }
        Ok(output)
    }
}

#[async_trait]
impl RemoteShell for GcloudCompute {
    async fn open(&self, target: &VmTarget) -> Result<(Arc<dyn ShellSession>, EventStream), TransportError> {
        let args = self.interactive_args(target);
        debug!(vm = %target, "Opening interactive session");
        let (session, events) = PtySession::spawn(
            target.name.clone(),
            &self.config.gcloud_bin,
            &args,
            self.config.cols,
            self.config.rows,
        )?;
        Ok((session as Arc<dyn ShellSession>, events))
    }

    async fn exec(&self, target: &VmTarget, command: &str) -> Result<ExecOutput, TransportError> {
        debug!(vm = %target, command, "Running remote command");
        self.run(&self.command_args(target, command)).await
    }

    async fn exec_streaming(
        &self,
        target: &VmTarget,
        command: &str,
        chunks: mpsc::UnboundedSender<OutputChunk>,
        timeout: Duration,
    ) -> Result<i32, TransportError> {
        let args = self.command_args(target, command);
        let mut child = self.command(&args).spawn().map_err(|e| TransportError::Spawn {
            program: self.config.gcloud_bin.clone(),
            source: e,
        })?;

        let stdout = child.stdout.take().map(|out| {
            let tx = chunks.clone();
            tokio::spawn(forward_lines(out, tx, OutputChunk::Stdout))
        });
        let stderr = child.stderr.take().map(|err| {
            let tx = chunks.clone();
            tokio::spawn(forward_lines(err, tx, OutputChunk::Stderr))
        });

        let readers: Vec<JoinHandle<()>> = [stdout, stderr].into_iter().flatten().collect();

        let status = match tokio::time::timeout(timeout, child.wait()).await {
            Ok(status) => status?,
            Err(_) => {
                warn!(vm = %target, ?timeout, "Streaming command timed out, killing it");
                if let Err(e) = child.kill().await {
                    debug!(error = %e, "Kill after timeout failed");
                }
                // Grandchildren (ssh) can hold the pipes open; release the
                // readers and their senders now
                for reader in &readers {
                    reader.abort();
                }
                return Err(TransportError::Timeout(timeout));
            }
        };

        // Drain whatever the readers still hold so no line is lost
        for reader in readers {
            let abort = reader.abort_handle();
            if tokio::time::timeout(READER_DRAIN_GRACE, reader).await.is_err() {
                debug!(vm = %target, "Output still open after exit, detaching readers");
                abort.abort();
            }
        }

        Ok(status.code().unwrap_or(-1))
    }

    async fn copy_to(&self, target: &VmTarget, local_path: &Path, remote_path: &str) -> Result<(), TransportError> {
        let mut args = vec![
            "compute".to_string(),
            "scp".to_string(),
            local_path.display().to_string(),
            format!("{}:{}", target.name, remote_path),
        ];
        args.extend(self.target_args(target));
        args.push("--quiet".to_string());
        self.run_checked(&args).await?;
        debug!(vm = %target, remote_path, "Copied file to VM");
        Ok(())
    }
}

/// Subset of `instances create --format=json` output we read
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreatedInstance {
    #[serde(default)]
    network_interfaces: Vec<NetworkInterface>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct NetworkInterface {
    #[serde(default)]
    access_configs: Vec<AccessConfig>,
}

#[derive(Debug, Deserialize)]
struct AccessConfig {
    #[serde(rename = "natIP")]
    nat_ip: Option<String>,
}

fn parse_external_ip(json: &str) -> Result<Option<String>, TransportError> {
    let created: Vec<CreatedInstance> =
        serde_json::from_str(json).map_err(|e| TransportError::Parse(e.to_string()))?;
    Ok(created
        .into_iter()
        .flat_map(|i| i.network_interfaces)
        .flat_map(|n| n.access_configs)
        .find_map(|a| a.nat_ip))
}

#[async_trait]
impl InstanceProvider for GcloudCompute {
    async fn create_instance(&self, spec: &InstanceSpec) -> Result<InstanceInfo, TransportError> {
        let target = &spec.target;
        let mut args = vec![
            "compute".to_string(),
            "instances".to_string(),
            "create".to_string(),
            target.name.clone(),
            format!("--zone={}", target.zone),
            format!("--project={}", target.project),
            format!("--machine-type={}", spec.machine_type),
            format!("--image-family={}", spec.image_family),
            format!("--image-project={}", spec.image_project),
            format!("--boot-disk-size={}GB", spec.disk_size_gb),
            "--format=json".to_string(),
        ];
        if !spec.labels.is_empty() {
            let labels: Vec<String> = spec.labels.iter().map(|(k, v)| format!("{}={}", k, v)).collect();
            args.push(format!("--labels={}", labels.join(",")));
        }

        let output = self.run_checked(&args).await?;
        let external_ip = parse_external_ip(&output.stdout)?;
        info!(vm = %target, ip = ?external_ip, "Instance created");
        Ok(InstanceInfo { external_ip })
    }

    async fn delete_instance(&self, target: &VmTarget) -> Result<(), TransportError> {
        let args = vec![
            "compute".to_string(),
            "instances".to_string(),
            "delete".to_string(),
            target.name.clone(),
            format!("--zone={}", target.zone),
            format!("--project={}", target.project),
            "--quiet".to_string(),
        ];
        self.run_checked(&args).await?;
        info!(vm = %target, "Instance deleted");
        Ok(())
    }

    async fn instance_exists(&self, target: &VmTarget) -> Result<bool, TransportError> {
        let args = vec![
            "compute".to_string(),
            "instances".to_string(),
            "describe".to_string(),
            target.name.clone(),
            format!("--zone={}", target.zone),
            format!("--project={}", target.project),
            "--format=value(status)".to_string(),
        ];
        let output = self.run(&args).await?;
        if output.success() {
            return Ok(!output.stdout.trim().is_empty());
        }
        if is_not_found(&output.stderr) {
            return Ok(false);
        }
        Err(TransportError::CommandFailed {
            code: output.exit_code,
            stderr: output.stderr.trim().to_string(),
        })
    }
}

/// `describe` failed because the instance is gone, not because of auth or network
fn is_not_found(stderr: &str) -> bool {
    let stderr = stderr.to_ascii_lowercase();
    stderr.contains("was not found") || stderr.contains("notfound")
}

async fn forward_lines<R>(reader: R, tx: mpsc::UnboundedSender<OutputChunk>, wrap: fn(String) -> OutputChunk)
where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(reader).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        if tx.send(wrap(line)).is_err() {
            break;
        }
    }
}
