//! Connection registry
//!
//! The single shared mutable structure of the orchestrator: task id →
//! [`ConnectionState`]. At most one entry exists per task; `upsert` replaces.
//! Critical sections are short and never await, so a plain `std::sync::Mutex`
//! is enough.
//!
//! Every status change is also published on a broadcast channel so streaming
//! clients and tests can observe transitions without polling.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use serde::Serialize;
use tokio::sync::broadcast;
use tokio::time::Instant;

use crate::metrics::ACTIVE_CONNECTIONS;
use crate::transport::{ShellSession, VmTarget};

const EVENT_CAPACITY: usize = 256;

/// Connection lifecycle
///
/// ```text
/// connecting ─► connected ─► disconnected ─► reconnecting ─► connected
///                                 ▲               │
///                                 └───────────────┘ (attempt failed)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionStatus {
    Connecting,
    Connected,
    Disconnected,
    Reconnecting,
}

impl ConnectionStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ConnectionStatus::Connecting => "connecting",
            ConnectionStatus::Connected => "connected",
            ConnectionStatus::Disconnected => "disconnected",
            ConnectionStatus::Reconnecting => "reconnecting",
        }
    }
}

impl std::fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Everything needed to keep one task's session alive
#[derive(Clone)]
pub struct ConnectionState {
    /// Live session; `None` once closed
    pub session: Option<Arc<dyn ShellSession>>,
    pub status: ConnectionStatus,
    pub tmux_session: String,
    pub last_activity: Instant,
    pub reconnect_attempts: u32,
    pub target: VmTarget,
    pub vm_user: String,
    /// Identifies which session's event pump owns this entry
    pub generation: u64,
}

impl std::fmt::Debug for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionState")
            .field("session", &self.session.as_ref().map(|_| "<live>"))
            .field("status", &self.status)
            .field("tmux_session", &self.tmux_session)
            .field("last_activity", &self.last_activity)
            .field("reconnect_attempts", &self.reconnect_attempts)
            .field("target", &self.target)
            .field("vm_user", &self.vm_user)
            .field("generation", &self.generation)
            .finish()
    }
}

/// A status change; `status` is `None` when the entry was removed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionEvent {
    pub task_id: String,
    pub status: Option<ConnectionStatus>,
}

/// Task id → connection state
pub struct ConnectionRegistry {
    entries: Mutex<HashMap<String, ConnectionState>>,
    generations: AtomicU64,
    events: broadcast::Sender<ConnectionEvent>,
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            entries: Mutex::new(HashMap::new()),
            generations: AtomicU64::new(1),
            events,
        }
    }

    /// A fresh generation number for a new session
    pub fn next_generation(&self) -> u64 {
        self.generations.fetch_add(1, Ordering::SeqCst)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.events.subscribe()
    }

    pub fn get(&self, task_id: &str) -> Option<ConnectionState> {
        self.lock().get(task_id).cloned()
    }

    pub fn status(&self, task_id: &str) -> Option<ConnectionStatus> {
        self.lock().get(task_id).map(|s| s.status)
    }

    /// Insert or replace, returning the previous entry
    pub fn upsert(&self, task_id: &str, state: ConnectionState) -> Option<ConnectionState> {
        let status = state.status;
        let (previous, len) = {
            let mut entries = self.lock();
            let previous = entries.insert(task_id.to_string(), state);
            (previous, entries.len())
        };
        ACTIVE_CONNECTIONS.set(len as i64);
        self.publish(task_id, Some(status));
        previous
    }

    pub fn remove(&self, task_id: &str) -> Option<ConnectionState> {
        let (removed, len) = {
            let mut entries = self.lock();
            let removed = entries.remove(task_id);
            (removed, entries.len())
        };
        if removed.is_some() {
            ACTIVE_CONNECTIONS.set(len as i64);
            self.publish(task_id, None);
        }
        removed
    }

    /// Remove only if the entry still belongs to `generation`
    pub fn remove_if_generation(&self, task_id: &str, generation: u64) -> Option<ConnectionState> {
        let (removed, len) = {
            let mut entries = self.lock();
            if entries.get(task_id).map(|s| s.generation) != Some(generation) {
                return None;
            }
            let removed = entries.remove(task_id);
            (removed, entries.len())
        };
        ACTIVE_CONNECTIONS.set(len as i64);
        self.publish(task_id, None);
        removed
    }

    /// Mutate an entry in place. Returns `None` if there is no entry.
    pub fn update<R>(&self, task_id: &str, f: impl FnOnce(&mut ConnectionState) -> R) -> Option<R> {
        let (result, before, after) = {
            let mut entries = self.lock();
            let state = entries.get_mut(task_id)?;
            let before = state.status;
            let result = f(state);
            (result, before, state.status)
        };
        if before != after {
            self.publish(task_id, Some(after));
        }
        Some(result)
    }

    /// Record inbound activity. Returns false if there is no entry.
    pub fn touch(&self, task_id: &str) -> bool {
        self.update(task_id, |s| s.last_activity = Instant::now()).is_some()
    }

    /// Visit every entry. The callback must not call back into the registry.
    pub fn for_each(&self, mut f: impl FnMut(&str, &ConnectionState)) {
        let entries = self.lock();
        for (id, state) in entries.iter() {
            f(id, state);
        }
    }

    /// Owned copy of every entry, for callers that need to await per entry
    pub fn snapshot(&self) -> Vec<(String, ConnectionState)> {
        self.lock()
            .iter()
            .map(|(id, state)| (id.clone(), state.clone()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn publish(&self, task_id: &str, status: Option<ConnectionStatus>) {
        // No subscribers is fine
        let _ = self.events.send(ConnectionEvent {
            task_id: task_id.to_string(),
            status,
        });
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, ConnectionState>> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }
}
