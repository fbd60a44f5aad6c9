//! Startup script rendering
//!
//! The script runs once as root through a one-shot command before the
//! interactive session opens. It must be idempotent: a retried task may land
//! on an image that already has some of the tooling.

use std::collections::BTreeMap;
use std::fmt::Write;

use crate::tasks::AgentKind;
use crate::transport::shell_quote;

/// Remote path the script is staged to
pub const REMOTE_SCRIPT_PATH: &str = "/tmp/agentvisor-startup.sh";

/// Inputs for [`render_startup_script`]
#[derive(Debug, Clone)]
pub struct StartupScript<'a> {
    pub vm_user: &'a str,
    pub agent: AgentKind,
    /// Exported into the user's shell profile
    pub env: &'a BTreeMap<String, String>,
}

const TMUX_CONF: &str = "\
set -g mouse on
set -g history-limit 50000
setw -g aggressive-resize on
set -g default-terminal \"xterm-256color\"
set -g status-interval 5
";

/// Render the bash startup script for one task
pub fn render_startup_script(spec: &StartupScript<'_>) -> String {
    let user = shell_quote(spec.vm_user);
    let home = format!("/home/{}", spec.vm_user);
    let home_q = shell_quote(&home);
    let package = spec.agent.npm_package();
    let binary = spec.agent.cli_binary();

    let mut s = String::new();
    s.push_str("#!/usr/bin/env bash\n");
    s.push_str("set -euo pipefail\n");
    s.push_str("export DEBIAN_FRONTEND=noninteractive\n\n");

    s.push_str("echo \"==> Installing base packages\"\n");
    s.push_str("apt-get update -y -qq\n");
    s.push_str("apt-get install -y -qq git tmux curl ca-certificates build-essential python3-pip\n\n");

    s.push_str("if ! command -v node >/dev/null 2>&1; then\n");
    s.push_str("  echo \"==> Installing Node.js\"\n");
    s.push_str("  curl -fsSL https://deb.nodesource.com/setup_20.x | bash -\n");
    s.push_str("  apt-get install -y -qq nodejs\n");
    s.push_str("fi\n\n");

    let _ = writeln!(s, "if ! command -v {} >/dev/null 2>&1; then", binary);
    let _ = writeln!(s, "  echo \"==> Installing {}\"", package);
    let _ = writeln!(s, "  npm install -g {}", shell_quote(package));
    s.push_str("fi\n\n");

    let _ = writeln!(s, "if ! id -u {u} >/dev/null 2>&1; then", u = user);
    let _ = writeln!(s, "  echo \"==> Creating user {}\"", spec.vm_user);
    let _ = writeln!(s, "  useradd -m -s /bin/bash {}", user);
    s.push_str("fi\n");
    let sudoers = shell_quote(&format!("/etc/sudoers.d/90-{}", spec.vm_user));
    let _ = writeln!(
        s,
        "echo {} > {}",
        shell_quote(&format!("{} ALL=(ALL) NOPASSWD:ALL", spec.vm_user)),
        sudoers
    );
    let _ = writeln!(s, "chmod 440 {}\n", sudoers);

    let _ = writeln!(s, "cat > {}/.tmux.conf <<'TMUX_CONF'", home_q);
    s.push_str(TMUX_CONF);
    s.push_str("TMUX_CONF\n\n");

    let env_file = format!("{}/.agentvisor_env", home_q);
    let _ = writeln!(s, "cat > {} <<'AGENT_ENV'", env_file);
    for (name, value) in spec.env {
        let _ = writeln!(s, "export {}={}", name, shell_quote(value));
    }
    s.push_str("AGENT_ENV\n");
    let _ = writeln!(s, "chmod 600 {}", env_file);
    let _ = writeln!(
        s,
        "grep -q agentvisor_env {h}/.bashrc 2>/dev/null || echo '[ -f ~/.agentvisor_env ] && . ~/.agentvisor_env' >> {h}/.bashrc",
        h = home_q
    );
    let _ = writeln!(s, "chown {u}:{u} {h}/.tmux.conf {e} {h}/.bashrc\n", u = user, h = home_q, e = env_file);

    let _ = writeln!(s, "command -v {} >/dev/null", binary);
    s.push_str("echo \"==> Startup complete\"\n");
    s
}

#[cfg(test)]
mod tests {
    use super::*;

    fn render(env: &BTreeMap<String, String>, agent: AgentKind) -> String {
        render_startup_script(&StartupScript {
            vm_user: "agent",
            agent,
            env,
        })
    }

    #[test]
    fn test_script_installs_toolchain_for_agent() {
        let script = render(&BTreeMap::new(), AgentKind::Codex);
        assert!(script.starts_with("#!/usr/bin/env bash\nset -euo pipefail\n"));
        assert!(script.contains("apt-get install -y -qq git tmux curl"));
        assert!(script.contains("npm install -g @openai/codex"));
        assert!(script.contains("if ! command -v codex"));
        assert!(script.contains("useradd -m -s /bin/bash agent"));
    }

    #[test]
    fn test_script_writes_tmux_conf() {
        let script = render(&BTreeMap::new(), AgentKind::ClaudeCode);
        assert!(script.contains("cat > /home/agent/.tmux.conf <<'TMUX_CONF'\nset -g mouse on\n"));
        assert!(script.contains("setw -g aggressive-resize on"));
    }

    #[test]
    fn test_script_exports_env_quoted() {
        let mut env = BTreeMap::new();
        env.insert("ANTHROPIC_API_KEY".to_string(), "sk-ant-secret value".to_string());
        env.insert("GIT_TERMINAL_PROMPT".to_string(), "0".to_string());
        let script = render(&env, AgentKind::ClaudeCode);
        assert!(script.contains("export ANTHROPIC_API_KEY='sk-ant-secret value'\n"));
        assert!(script.contains("export GIT_TERMINAL_PROMPT=0\n"));
        assert!(script.contains("chmod 600 /home/agent/.agentvisor_env"));
    }
}
