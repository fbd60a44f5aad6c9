//! Connection State Manager
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │  SessionManager                                                  │
//! │                                                                  │
//! │   attach() ──► ConnectionRegistry ◄── HealthMonitor (sweep)      │
//! │      │          task id → state                                  │
//! │      ▼                                                           │
//! │   event pump ──► transcript                                      │
//! │      │                                                           │
//! │      └─ close/error ─► reconnect loop ─► open ─► resume tmux     │
//! │                           (5 attempts, 5s apart, then failed)    │
//! └──────────────────────────────────────────────────────────────────┘
//! ```
//!
//! State lives only in process memory. After a restart, a manual reconnect
//! rebuilds it from the VM coordinates persisted on the task.

pub mod manager;
pub mod registry;

pub use manager::{SessionError, SessionManager};
pub use registry::{ConnectionEvent, ConnectionRegistry, ConnectionState, ConnectionStatus};
