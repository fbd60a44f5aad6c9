//! Health Monitor
//!
//! Some tunnels go quiet without ever reporting a close. A periodic sweep
//! treats a connected session with no inbound bytes for longer than the
//! staleness threshold as dead and hands it to the reconnection logic.
//!
//! ```text
//! every period:
//!   for each registry entry
//!     reconnecting | disconnected  → skip (already being handled)
//!     task missing or inactive     → discard entry
//!     connected and silent > stale → mark disconnected, trigger reconnect
//! ```

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::connection::{ConnectionStatus, SessionManager};
use crate::metrics::{HEALTH_SWEEPS, STALE_CONNECTIONS};

/// What one sweep did
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Entries inspected (not already reconnecting or disconnected)
    pub checked: usize,
    /// Entries dropped because their task is no longer active
    pub discarded: Vec<String>,
    /// Entries found stale and sent to reconnect
    pub stale: Vec<String>,
}

/// Periodic connection audit
pub struct HealthMonitor {
    sessions: Arc<SessionManager>,
    period: Duration,
    stale_after: Duration,
}

impl HealthMonitor {
    pub fn new(sessions: Arc<SessionManager>, period: Duration, stale_after: Duration) -> Self {
        Self {
            sessions,
            period,
            stale_after,
        }
    }

    /// Inspect every registered connection once
    pub async fn sweep(&self) -> SweepReport {
        HEALTH_SWEEPS.inc();
        let mut report = SweepReport::default();
        let registry = self.sessions.registry();

        for (task_id, state) in registry.snapshot() {
            if matches!(
                state.status,
                ConnectionStatus::Reconnecting | ConnectionStatus::Disconnected
            ) {
                continue;
            }
            report.checked += 1;

            let active = match self.sessions.tasks().get_task(&task_id).await {
                Ok(task) => task.is_active(),
                Err(e) => {
                    debug!(task_id = %task_id, error = %e, "Task lookup failed during sweep");
                    false
                }
            };
            if !active {
                if let Some(removed) = registry.remove_if_generation(&task_id, state.generation) {
                    if let Some(session) = removed.session {
                        session.close().await;
                    }
                    info!(task_id = %task_id, "Discarded connection of inactive task");
                    report.discarded.push(task_id);
                }
                continue;
            }

            if state.status == ConnectionStatus::Connected {
                let idle = state.last_activity.elapsed();
                if idle > self.stale_after && self.sessions.mark_stale(&task_id, state.generation).await {
                    STALE_CONNECTIONS.inc();
                    warn!(task_id = %task_id, idle_secs = idle.as_secs(), "Connection stale, reconnecting");
                    report.stale.push(task_id);
                }
            }
        }

        debug!(
            checked = report.checked,
            discarded = report.discarded.len(),
            stale = report.stale.len(),
            "Health sweep complete"
        );
        report
    }

    /// Sweep every `period` for the life of the process. The first sweep runs
    /// one period after start.
    pub fn spawn(self: Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = interval_at(Instant::now() + self.period, self.period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                interval.tick().await;
                self.sweep().await;
            }
        })
    }
}
