//! Provisioning Pipeline
//!
//! - `commands` - the keystroke plans typed into the persistent session
//! - `script` - the root startup script run once per VM
//! - `pipeline` - the task lifecycle driver tying VM, script and session together

pub mod commands;
pub mod pipeline;
pub mod script;

pub use commands::{resume_plan, setup_plan, CommandKind, SetupContext, ShellCommand};
pub use pipeline::{ProvisionError, Provisioner};
pub use script::{render_startup_script, StartupScript, REMOTE_SCRIPT_PATH};
