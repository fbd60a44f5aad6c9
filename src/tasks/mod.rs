//! Task records and the persistence seam to the surrounding service
//!
//! The orchestrator reads tasks and writes back status, VM coordinates and a
//! little metadata. It never creates or owns them.

pub mod model;
pub mod store;

pub use model::{AgentKind, Task, TaskMetadata, TaskStatus};
pub use store::{JsonTaskStore, MemoryTaskStore, TaskStore, TaskStoreError};
