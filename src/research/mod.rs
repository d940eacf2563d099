//! Multi-stage research workflows
//!
//! A research request becomes a context that walks through the configured
//! stages (by default plan → search → synthesize → review). Each stage is a
//! dispatched task addressed to the stage's capability; the coordinator
//! listens to the dispatcher's outcome feed and advances, fails or pauses the
//! context accordingly.
//!
//! # Resume
//!
//! A paused or failed context resumes at its current stage only. The stage
//! receives the output of the last completed stage, read back from the
//! context's traces, so finished work is never replayed.
//!
//! ```ignore
//! let context = coordinator.start("CRISPR off-target effects", None, Some(&session_id))?;
//! // ... search stage fails ...
//! coordinator.resume(&context.context_id, Some(&session_id))?;
//! ```

/// Stage sequencing over dispatched tasks.
pub mod coordinator;

pub use coordinator::{ResearchCoordinator, ResearchStatus};
