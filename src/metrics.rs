//! Prometheus metrics for the orchestrator
//!
//! All metrics live in the default registry and are scraped from `GET /metrics`
//! (see [`gather_text`]).

use lazy_static::lazy_static;
use prometheus::{
    register_histogram, register_int_counter, register_int_counter_vec, register_int_gauge,
    Encoder, Histogram, IntCounter, IntCounterVec, IntGauge, TextEncoder,
};

lazy_static! {
    // ─────────────────────────────────────────────────────────────────────────────
    // Provisioning Metrics
    // ─────────────────────────────────────────────────────────────────────────────

    /// Tasks handed to the provisioning pipeline
    pub static ref TASKS_STARTED: IntCounter = register_int_counter!(
        "agentvisor_tasks_started_total",
        "Tasks that entered the provisioning pipeline"
    ).expect("failed to register TASKS_STARTED metric");

    /// Terminal task outcomes.
    ///
    /// Labels:
    /// - outcome: "completed", "failed", "stopped"
    pub static ref TASK_OUTCOMES: IntCounterVec = register_int_counter_vec!(
        "agentvisor_task_outcomes_total",
        "Tasks that reached a terminal status",
        &["outcome"]
    ).expect("failed to register TASK_OUTCOMES metric");

    /// Wall time from `start_task` until the agent is running
    pub static ref PROVISION_DURATION: Histogram = register_histogram!(
        "agentvisor_provision_duration_seconds",
        "Time from start_task until the task reaches running",
        vec![30.0, 60.0, 120.0, 180.0, 300.0, 450.0, 600.0, 900.0]
    ).expect("failed to register PROVISION_DURATION metric");

    /// Probe attempts needed before a shell prompt was seen
    pub static ref SSH_PROBE_ATTEMPTS: Histogram = register_histogram!(
        "agentvisor_ssh_probe_attempts",
        "Connectivity probe attempts per provisioning run",
        vec![1.0, 2.0, 3.0, 4.0, 5.0]
    ).expect("failed to register SSH_PROBE_ATTEMPTS metric");

    // ─────────────────────────────────────────────────────────────────────────────
    // Connection Metrics
    // ─────────────────────────────────────────────────────────────────────────────

    /// Entries currently held in the connection registry
    pub static ref ACTIVE_CONNECTIONS: IntGauge = register_int_gauge!(
        "agentvisor_active_connections",
        "Connection states currently registered"
    ).expect("failed to register ACTIVE_CONNECTIONS metric");

    /// Reconnection attempts.
    ///
    /// Labels:
    /// - result: "success", "failure", "exhausted", "abandoned"
    pub static ref RECONNECT_ATTEMPTS: IntCounterVec = register_int_counter_vec!(
        "agentvisor_reconnect_attempts_total",
        "Automatic and manual reconnection attempts by result",
        &["result"]
    ).expect("failed to register RECONNECT_ATTEMPTS metric");

    /// Health sweeps performed
    pub static ref HEALTH_SWEEPS: IntCounter = register_int_counter!(
        "agentvisor_health_sweeps_total",
        "Health monitor sweeps"
    ).expect("failed to register HEALTH_SWEEPS metric");

    /// Connected sessions found silent past the staleness threshold
    pub static ref STALE_CONNECTIONS: IntCounter = register_int_counter!(
        "agentvisor_stale_connections_total",
        "Connections declared stale by the health monitor"
    ).expect("failed to register STALE_CONNECTIONS metric");

    // ─────────────────────────────────────────────────────────────────────────────
    // Transcript Metrics
    // ─────────────────────────────────────────────────────────────────────────────

    /// Bytes persisted to transcripts (post-redaction)
    pub static ref TRANSCRIPT_BYTES: IntCounter = register_int_counter!(
        "agentvisor_transcript_bytes_total",
        "Bytes appended to task transcripts after redaction"
    ).expect("failed to register TRANSCRIPT_BYTES metric");

    /// Redaction hits.
    ///
    /// Labels:
    /// - rule: name of the redaction rule that matched
    pub static ref REDACTIONS: IntCounterVec = register_int_counter_vec!(
        "agentvisor_redactions_total",
        "Secret spans replaced before persisting, by rule",
        &["rule"]
    ).expect("failed to register REDACTIONS metric");
}

/// Render every registered metric in the Prometheus text exposition format
pub fn gather_text() -> Result<String, prometheus::Error> {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    encoder.encode(&prometheus::gather(), &mut buffer)?;
    String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
}
