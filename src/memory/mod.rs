//! Workflow context storage.
//!
//! Contexts and their traces live in memory for the lifetime of the process.

pub mod context_manager;

pub use context_manager::{
    ContextFilter, ContextManager, ContextStatus, ContextTrace, SessionContext, TraceInput,
};
