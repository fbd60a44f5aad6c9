//! Interactive command sequences
//!
//! Both provisioning and reconnection drive a raw interactive shell: a command
//! is typed, a carriage return is sent, and the only way to know it finished is
//! to wait. Every command therefore carries a [`CommandKind`] that picks its
//! settle delay from [`SettleDelays`].

use crate::config::SettleDelays;
use crate::tasks::Task;
use crate::transport::{shell_quote, ShellSession, TransportError};

/// Rough cost class of an interactive command
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandKind {
    /// `cd`, `git config`, user switches
    Simple,
    /// Creating, attaching or reconfiguring the tmux session
    Multiplexer,
    /// `git clone`
    Clone,
    /// Package or hook installation
    Install,
    /// Starting the agent CLI
    AgentStart,
}

/// One line typed into the remote shell
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShellCommand {
    pub line: String,
    pub kind: CommandKind,
}

impl ShellCommand {
    pub fn new(line: impl Into<String>, kind: CommandKind) -> Self {
        Self {
            line: line.into(),
            kind,
        }
    }
}

/// Short prefix of a task id, reduced to what instance names allow
pub fn short_id(task_id: &str) -> String {
    task_id
        .chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .take(8)
        .collect::<String>()
        .to_ascii_lowercase()
}

/// tmux session name for a task: `session-` plus the first 8 characters of the
/// id, verbatim. Stable across reconnects and restarts.
pub fn tmux_session_name(task_id: &str) -> String {
    format!("session-{}", task_id.chars().take(8).collect::<String>())
}

/// VM instance name for a task
pub fn vm_name_for(task_id: &str) -> String {
    format!("agent-{}", short_id(task_id))
}

/// Default workspace directory on the VM
pub fn workspace_path_for(task: &Task, vm_user: &str) -> String {
    let dir = task
        .metadata
        .repository_name()
        .unwrap_or_else(|| "workspace".to_string());
    format!("/home/{}/{}", vm_user, dir)
}

const RELOAD_TMUX_CONF: &str = "tmux source-file ~/.tmux.conf 2>/dev/null || true";

/// Commands that re-enter an existing task session after a reconnect.
///
/// `screen` is the last resort for sessions started before tmux was used.
pub fn resume_plan(vm_user: &str, tmux_session: &str) -> Vec<ShellCommand> {
    let session = shell_quote(tmux_session);
    vec![
        ShellCommand::new(format!("sudo su - {}", shell_quote(vm_user)), CommandKind::Simple),
        ShellCommand::new(
            format!(
                "tmux attach -t {s} || tmux new-session -s {s} || screen -DR {s}",
                s = session
            ),
            CommandKind::Multiplexer,
        ),
        ShellCommand::new(RELOAD_TMUX_CONF, CommandKind::Multiplexer),
    ]
}

/// Inputs for the first-run setup sequence
#[derive(Debug, Clone)]
pub struct SetupContext<'a> {
    pub task: &'a Task,
    pub vm_user: &'a str,
    pub workspace_path: &'a str,
    pub tmux_session: &'a str,
    pub launch_command: &'a str,
}

/// Commands typed after the persistent session opens, ending with the agent start
pub fn setup_plan(ctx: &SetupContext<'_>) -> Vec<ShellCommand> {
    let meta = &ctx.task.metadata;
    let workspace = shell_quote(ctx.workspace_path);
    let mut plan = vec![
        ShellCommand::new(format!("sudo su - {}", shell_quote(ctx.vm_user)), CommandKind::Simple),
        ShellCommand::new(
            format!("tmux new-session -A -s {}", shell_quote(ctx.tmux_session)),
            CommandKind::Multiplexer,
        ),
        ShellCommand::new(RELOAD_TMUX_CONF, CommandKind::Multiplexer),
    ];

    match meta.repository_url.as_deref() {
        Some(url) => {
            let mut clone = format!("[ -d {ws}/.git ] || git clone", ws = workspace);
            if let Some(base) = meta.base_branch.as_deref() {
                clone.push_str(&format!(" --branch {}", shell_quote(base)));
            }
            clone.push_str(&format!(" -- {} {}", shell_quote(url), workspace));
            plan.push(ShellCommand::new(clone, CommandKind::Clone));
        }
        None => plan.push(ShellCommand::new(format!("mkdir -p {}", workspace), CommandKind::Simple)),
    }
    plan.push(ShellCommand::new(format!("cd {}", workspace), CommandKind::Simple));

    if let Some(name) = meta.git_user_name.as_deref() {
        plan.push(ShellCommand::new(
            format!("git config user.name {}", shell_quote(name)),
            CommandKind::Simple,
        ));
    }
    if let Some(email) = meta.git_user_email.as_deref() {
        plan.push(ShellCommand::new(
            format!("git config user.email {}", shell_quote(email)),
            CommandKind::Simple,
        ));
    }

    if meta.repository_url.is_some() {
        plan.push(ShellCommand::new(
            "if [ -f .pre-commit-config.yaml ]; then pip3 install --user -q pre-commit && python3 -m pre_commit install; fi",
            CommandKind::Install,
        ));
        if let Some(branch) = meta.branch_name.as_deref() {
            let branch = shell_quote(branch);
            plan.push(ShellCommand::new(
                format!("git checkout -b {b} 2>/dev/null || git checkout {b}", b = branch),
                CommandKind::Simple,
            ));
        }
    }

    plan.push(ShellCommand::new(ctx.launch_command, CommandKind::AgentStart));
    plan
}

/// Type each command followed by a carriage return, pausing per kind
pub async fn type_commands(
    session: &dyn ShellSession,
    commands: &[ShellCommand],
    settle: &SettleDelays,
) -> Result<(), TransportError> {
    for command in commands {
        session.write(format!("{}\r", command.line).as_bytes()).await?;
        tokio::time::sleep(settle.for_kind(command.kind)).await;
    }
    Ok(())
}

/// Send free text the way a person would type it: the text, a short pause,
/// then an explicit carriage return
pub async fn type_text(session: &dyn ShellSession, text: &str, settle: &SettleDelays) -> Result<(), TransportError> {
    session.write(text.as_bytes()).await?;
    tokio::time::sleep(settle.submit).await;
    session.write(b"\r").await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tasks::{AgentKind, TaskMetadata};

    fn task_with(meta: TaskMetadata) -> Task {
        let mut task = Task::new("add a healthcheck endpoint", AgentKind::ClaudeCode);
        task.id = "3F2a9C1e-0000-4000-8000-000000000000".to_string();
        task.metadata = meta;
        task
    }

    #[test]
    fn test_names_derive_from_id_prefix() {
        let id = "3F2a9C1e-0000-4000-8000-000000000000";
        assert_eq!(tmux_session_name(id), "session-3F2a9C1e");
        assert_eq!(vm_name_for(id), "agent-3f2a9c1e");
    }

    #[test]
    fn test_tmux_name_keeps_id_characters() {
        let id = "AB-CD-EF-GH-1234";
        assert_eq!(tmux_session_name(id), "session-AB-CD-EF");
        assert_eq!(vm_name_for(id), "agent-abcdefgh");
    }

    #[test]
    fn test_resume_plan_falls_back_to_create_then_screen() {
        let plan = resume_plan("agent", "session-3f2a9c1e");
        assert_eq!(plan[0].line, "sudo su - agent");
        assert_eq!(
            plan[1].line,
            "tmux attach -t session-3f2a9c1e || tmux new-session -s session-3f2a9c1e || screen -DR session-3f2a9c1e"
        );
        assert!(plan[2].line.starts_with("tmux source-file"));
    }

    #[test]
    fn test_setup_plan_full_repository() {
        let task = task_with(TaskMetadata {
            repository_url: Some("https://github.com/acme/widgets.git".into()),
            base_branch: Some("main".into()),
            branch_name: Some("agent/healthcheck".into()),
            git_user_name: Some("Agent Smith".into()),
            git_user_email: Some("agent@acme.dev".into()),
            ..Default::default()
        });
        let ctx = SetupContext {
            task: &task,
            vm_user: "agent",
            workspace_path: "/home/agent/widgets",
            tmux_session: "session-3f2a9c1e",
            launch_command: "claude --dangerously-skip-permissions",
        };
        let plan = setup_plan(&ctx);
        let lines: Vec<&str> = plan.iter().map(|c| c.line.as_str()).collect();

        assert_eq!(lines[0], "sudo su - agent");
        assert_eq!(lines[1], "tmux new-session -A -s session-3f2a9c1e");
        assert_eq!(
            lines[3],
            "[ -d /home/agent/widgets/.git ] || git clone --branch main -- https://github.com/acme/widgets.git /home/agent/widgets"
        );
        assert_eq!(lines[4], "cd /home/agent/widgets");
        assert_eq!(lines[5], "git config user.name 'Agent Smith'");
        assert!(lines[7].contains("pre-commit install"));
        assert_eq!(lines[8], "git checkout -b agent/healthcheck 2>/dev/null || git checkout agent/healthcheck");
        assert_eq!(plan.last().unwrap().kind, CommandKind::AgentStart);
        assert_eq!(plan[3].kind, CommandKind::Clone);
        assert_eq!(plan[7].kind, CommandKind::Install);
    }

    #[test]
    fn test_setup_plan_without_repository() {
        let task = task_with(TaskMetadata::default());
        let ctx = SetupContext {
            task: &task,
            vm_user: "agent",
            workspace_path: "/home/agent/workspace",
            tmux_session: "session-3f2a9c1e",
            launch_command: "codex --full-auto",
        };
        let plan = setup_plan(&ctx);
        assert!(plan.iter().all(|c| !c.line.contains("git ")));
        assert!(plan.iter().any(|c| c.line == "mkdir -p /home/agent/workspace"));
        assert_eq!(plan.last().unwrap().line, "codex --full-auto");
    }

    #[test]
    fn test_workspace_path() {
        let task = task_with(TaskMetadata {
            repository_url: Some("git@github.com:acme/widgets.git".into()),
            ..Default::default()
        });
        assert_eq!(workspace_path_for(&task, "dev"), "/home/dev/widgets");
        assert_eq!(workspace_path_for(&task_with(TaskMetadata::default()), "dev"), "/home/dev/workspace");
    }
}
