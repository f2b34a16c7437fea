//! Terminal session monitor with automatic fault remediation.
//!
//! termfix tails the captured output of an external terminal session,
//! classifies failures from the free-form text (tracebacks, missing
//! dependencies, missing commands), and remediates them: source files are
//! rewritten via a remote fix-analysis service, missing dependencies get
//! an installer invocation, and the original command is relaunched once
//! the fix lands. At most one remediation is in flight at a time and no
//! fault is handled twice in a session.

pub mod classify;
pub mod client;
pub mod command;
pub mod engine;
pub mod launcher;
pub mod ledger;
pub mod monitor;
pub mod tailer;
pub mod translate;
