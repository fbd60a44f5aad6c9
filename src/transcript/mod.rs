//! Redacting Transcript Store
//!
//! Persisted, append-only record of everything a task's terminal produced plus
//! the orchestrator's own status lines. Content is redacted at write time and
//! never at read time.
//!
//! ```text
//! transport Data ──┐
//! pipeline lines ──┼─► redact (ordered rules) ─► <data>/transcripts/<id>.log
//! reconnect notes ─┘                                   │
//!                                   read / tail / read_from_offset (polling clients)
//! ```

pub mod lines;
pub mod redact;
pub mod store;

pub use lines::LineBuffer;
pub use redact::{redact, RedactionRule, Redactor, Strategy, REDACTION_MARKER};
pub use store::{needs_attention, TranscriptChunk, NOTICE_PREFIX, TranscriptError, TranscriptStore};
