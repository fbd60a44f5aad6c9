//! Task lifecycle against the fake cloud: start, stop, complete, retry

mod common;

use std::time::Duration;

use agentvisor::config::ProbePolicy;
use agentvisor::provision::commands::vm_name_for;
use agentvisor::tasks::{TaskStatus, TaskStore};
use agentvisor::transport::TransportError;
use agentvisor::{ConnectionStatus, ProvisionError, SessionError};

use common::{test_config, wait_until, Harness, STARTUP_SECRET};

const WAIT: Duration = Duration::from_secs(5);

#[tokio::test]
async fn test_start_task_reaches_running() {
    let h = Harness::new();
    let id = h.running_task().await;

    assert_eq!(
        h.tasks.status_history(&id),
        vec![
            TaskStatus::Provisioning,
            TaskStatus::Initializing,
            TaskStatus::Cloning,
            TaskStatus::Running
        ]
    );
    assert_eq!(h.orchestrator.connection_status(&id), Some(ConnectionStatus::Connected));

    let task = h.tasks.get_task(&id).await.unwrap();
    assert_eq!(task.vm_name.as_deref(), Some(vm_name_for(&id).as_str()));
    assert_eq!(task.vm_zone.as_deref(), Some("us-central1-a"));
    assert_eq!(task.vm_external_ip.as_deref(), Some("203.0.113.10"));
    assert_eq!(task.metadata.vm_user.as_deref(), Some("agent"));
    assert_eq!(task.metadata.workspace_path.as_deref(), Some("/home/agent/widgets"));

    let created = h.cloud.created();
    assert_eq!(created.len(), 1);
    assert_eq!(created[0].target.project, "test-project");
}

#[tokio::test]
async fn test_setup_sequence_is_typed_in_order() {
    let h = Harness::new();
    let id = h.running_task().await;

    // First session is the reachability probe
    assert_eq!(h.cloud.sessions().len(), 2);
    let session = h.cloud.last_session();
    let typed = session.typed();

    let order = [
        "sudo su - agent\r",
        "tmux new-session -A -s session-",
        "tmux source-file ~/.tmux.conf",
        "git clone -- https://github.com/acme/widgets.git /home/agent/widgets\r",
        "cd /home/agent/widgets\r",
        "python3 -m pre_commit install",
        "git checkout -b agent/fix-login",
        "claude --dangerously-skip-permissions\r",
        "fix the login redirect\r",
    ];
    let mut from = 0;
    for step in order {
        let at = typed[from..]
            .find(step)
            .unwrap_or_else(|| panic!("{:?} missing or out of order in {:?}", step, typed));
        from += at + step.len();
    }

    // The description and its carriage return are separate writes
    let writes = session.writes();
    assert_eq!(writes[writes.len() - 2], "fix the login redirect");
    assert_eq!(writes[writes.len() - 1], "\r");
    assert!(h.transcript(&id).contains("[agentvisor] agent started"));
}

#[tokio::test]
async fn test_startup_script_is_staged_streamed_and_redacted() {
    let h = Harness::new();
    let id = h.running_task().await;

    let scripts = h.cloud.staged_scripts();
    assert_eq!(scripts.len(), 1);
    assert!(scripts[0].contains("npm install -g @anthropic-ai/claude-code"));

    let execs = h.cloud.execs();
    assert!(execs[0].starts_with("sudo bash /tmp/agentvisor-startup.sh"));
    assert!(execs.iter().any(|c| c == "command -v claude"));

    let transcript = h.transcript(&id);
    assert!(transcript.contains("[startup] ==> Installing base packages\n"));
    assert!(transcript.contains("[startup] export ANTHROPIC_API_KEY=[REDACTED]\n"));
    assert!(!transcript.contains(STARTUP_SECRET));
}

#[tokio::test]
async fn test_unreachable_vm_fails_task() {
    let h = Harness::new();
    h.cloud.set_reachable(false);
    let id = h.pending_task("never reachable");

    let err = h.orchestrator.start_task(&id).await.unwrap_err();
    assert!(matches!(err, ProvisionError::Unreachable(5)), "{:?}", err);

    assert_eq!(h.status(&id).await, TaskStatus::Failed);
    assert_eq!(h.cloud.opens(), 5);
    assert!(h.transcript(&id).contains("SSH connection failed"));
    assert!(h.orchestrator.registry().get(&id).is_none());
}

#[tokio::test(start_paused = true)]
async fn test_probe_backs_off_only_after_failures() {
    let mut config = test_config();
    config.probe = ProbePolicy::default();
    let h = Harness::with_config(config);
    h.cloud.set_reachable(false);
    let id = h.pending_task("slow boot");

    let started = tokio::time::Instant::now();
    h.orchestrator.start_task(&id).await.unwrap_err();
    let elapsed = started.elapsed();

    // 10 + 15 + 20 + 30, no wait before the first probe or after the last
    assert!(elapsed >= Duration::from_secs(75), "{:?}", elapsed);
    assert!(elapsed < Duration::from_secs(76), "{:?}", elapsed);
}

#[tokio::test]
async fn test_startup_script_failure_fails_task() {
    let h = Harness::new();
    h.cloud.set_startup_exit(2);
    let id = h.pending_task("broken image");

    let err = h.orchestrator.start_task(&id).await.unwrap_err();
    assert!(matches!(err, ProvisionError::StartupScript(2)), "{:?}", err);
    assert_eq!(h.status(&id).await, TaskStatus::Failed);
    assert!(h.transcript(&id).contains("startup script exited with code 2"));
    assert!(h.orchestrator.registry().is_empty());
}

#[tokio::test]
async fn test_startup_timeout_fails_task_despite_open_output() {
    let mut config = test_config();
    config.startup_timeout = Duration::from_millis(50);
    let h = Harness::with_config(config);
    h.cloud.set_startup_hangs(true);
    let id = h.pending_task("hung installer");

    let err = tokio::time::timeout(WAIT, h.orchestrator.start_task(&id))
        .await
        .expect("provisioning hung past the startup timeout")
        .unwrap_err();
    assert!(matches!(err, ProvisionError::Transport(TransportError::Timeout(_))), "{:?}", err);
    assert_eq!(h.status(&id).await, TaskStatus::Failed);
    assert!(h.transcript(&id).contains("[startup] ==> Installing base packages"));
}

#[tokio::test]
async fn test_missing_agent_cli_fails_task() {
    let h = Harness::new();
    h.cloud.set_agent_installed(false);
    let id = h.pending_task("no cli");

    let err = h.orchestrator.start_task(&id).await.unwrap_err();
    assert!(matches!(err, ProvisionError::AgentMissing("claude")), "{:?}", err);
    assert_eq!(h.status(&id).await, TaskStatus::Failed);
}

#[tokio::test]
async fn test_stop_running_task() {
    let h = Harness::new();
    let id = h.running_task().await;
    let session = h.cloud.last_session();
    let opens = h.cloud.opens();

    h.orchestrator.stop_task(&id).await.unwrap();

    assert_eq!(h.status(&id).await, TaskStatus::Stopped);
    assert_eq!(h.cloud.deleted(), vec![vm_name_for(&id)]);
    assert!(session.is_closed());
    assert!(h.orchestrator.registry().get(&id).is_none());

    // Closing the session must not be mistaken for a dropped connection
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(h.cloud.opens(), opens);
    assert_eq!(h.status(&id).await, TaskStatus::Stopped);
    assert!(!h.tasks.status_history(&id).contains(&TaskStatus::Failed));
}

#[tokio::test]
async fn test_complete_running_task() {
    let h = Harness::new();
    let id = h.running_task().await;

    h.orchestrator.complete_task(&id).await.unwrap();

    assert_eq!(h.status(&id).await, TaskStatus::Completed);
    assert_eq!(h.cloud.deleted().len(), 1);
    assert!(h.transcript(&id).contains("[agentvisor] task completed"));
}

#[tokio::test]
async fn test_stop_requires_active_task() {
    let h = Harness::new();
    let id = h.pending_task("not started");

    let err = h.orchestrator.stop_task(&id).await.unwrap_err();
    assert!(matches!(err, ProvisionError::InvalidState { .. }), "{:?}", err);
    assert!(h.cloud.deleted().is_empty());
}

#[tokio::test]
async fn test_start_requires_pending() {
    let h = Harness::new();
    let id = h.running_task().await;

    let err = h.orchestrator.start_task(&id).await.unwrap_err();
    assert!(matches!(err, ProvisionError::InvalidState { status: TaskStatus::Running, .. }));
    assert_eq!(h.cloud.created().len(), 1);
}

#[tokio::test]
async fn test_retry_resets_and_provisions_again() {
    let h = Harness::new();
    h.cloud.set_startup_exit(1);
    let id = h.pending_task("flaky first boot");
    h.orchestrator.start_task(&id).await.unwrap_err();
    assert_eq!(h.status(&id).await, TaskStatus::Failed);

    h.cloud.set_startup_exit(0);
    h.orchestrator.retry_task(&id).await.unwrap();

    assert_eq!(h.status(&id).await, TaskStatus::Running);
    assert_eq!(h.cloud.deleted(), vec![vm_name_for(&id)]);
    assert_eq!(h.cloud.created().len(), 2);

    let transcript = h.transcript(&id);
    assert!(transcript.starts_with("[agentvisor] task reset for retry at "));
    assert!(!transcript.contains("exited with code 1"));
}

#[tokio::test]
async fn test_retry_requires_terminal_status() {
    let h = Harness::new();
    let id = h.running_task().await;

    let err = h.orchestrator.retry_task(&id).await.unwrap_err();
    assert!(matches!(err, ProvisionError::InvalidState { .. }));
    assert_eq!(h.status(&id).await, TaskStatus::Running);
}

/// Start a task whose interactive session is slow to open, and end it with
/// `finish` while `open` is still pending
async fn finish_while_session_opens<F, Fut>(h: &Harness, finish: F) -> (String, ProvisionError)
where
    F: FnOnce(String) -> Fut,
    Fut: std::future::Future<Output = Result<(), ProvisionError>>,
{
    // Open 1 is the reachability check, open 2 the persistent session
    h.cloud.delay_open(2, Duration::from_millis(300));
    let id = h.pending_task("ended mid-clone");

    let start = h.orchestrator.spawn_start(&id);
    wait_until(WAIT, || h.cloud.opens() == 2).await;
    finish(id.clone()).await.unwrap();

    let err = start.await.unwrap().unwrap_err();
    (id, err)
}

#[tokio::test]
async fn test_stop_while_session_opens_leaves_no_connection() {
    let h = Harness::new();
    let orchestrator = &h.orchestrator;
    let (id, err) = finish_while_session_opens(&h, |id| async move { orchestrator.stop_task(&id).await }).await;

    assert!(matches!(err, ProvisionError::Cancelled { outcome: "stopped", .. }), "{:?}", err);
    assert_eq!(h.status(&id).await, TaskStatus::Stopped);
    assert!(h.orchestrator.registry().get(&id).is_none());
    assert!(h.cloud.last_session().is_closed());

    let err = h.orchestrator.send_instruction(&id, "still there?").await.unwrap_err();
    assert!(matches!(err, SessionError::NoActiveConnection(_)), "{:?}", err);
    assert!(h.transcript(&id).contains("provisioning aborted: task was stopped"));
}

#[tokio::test]
async fn test_abort_notice_names_the_winning_outcome() {
    let h = Harness::new();
    let orchestrator = &h.orchestrator;
    let (id, err) =
        finish_while_session_opens(&h, |id| async move { orchestrator.complete_task(&id).await }).await;

    assert!(matches!(err, ProvisionError::Cancelled { outcome: "completed", .. }), "{:?}", err);
    assert_eq!(err.to_string(), format!("task {} was completed while provisioning", id));
    let transcript = h.transcript(&id);
    assert!(transcript.contains("provisioning aborted: task was completed"));
    assert!(!transcript.contains("task was stopped"));
    assert!(h.orchestrator.registry().is_empty());
}

#[tokio::test]
async fn test_start_stop_race_never_leaks_a_session() {
    for spins in 0..24 {
        let h = Harness::new();
        let id = h.pending_task("race");

        let (_, _) = tokio::join!(h.orchestrator.start_task(&id), async {
            for _ in 0..spins {
                tokio::task::yield_now().await;
            }
            h.orchestrator.stop_task(&id).await
        });
        tokio::time::sleep(Duration::from_millis(20)).await;

        let status = h.status(&id).await;
        if status == TaskStatus::Stopped {
            assert!(h.orchestrator.registry().is_empty(), "entry left after stop (spins={})", spins);
            assert_eq!(h.cloud.open_sessions(), 0, "live session after stop (spins={})", spins);
        } else {
            assert_eq!(status, TaskStatus::Running, "spins={}", spins);
            assert_eq!(h.orchestrator.registry().len(), 1);
            assert_eq!(h.cloud.open_sessions(), 1);
        }
    }
}
