//! Per-workflow execution contexts and their append-only traces.
//!
//! A context moves through
//!
//! ```text
//! active --stage done--> active(next) --...--> completed
//!   |  \--stage failed--> failed --resume--> active
//!   \----pause----------> paused --resume--> active
//! ```
//!
//! `completed` is terminal: no status change and no new traces.
//! Each context has its own lock, so writers to different contexts never
//! contend.

use crate::types::{AppError, Result};
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use tracing::{debug, info};
use utoipa::{IntoParams, ToSchema};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum ContextStatus {
    Active,
    Paused,
    Completed,
    Failed,
}

impl ContextStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ContextStatus::Active => "active",
            ContextStatus::Paused => "paused",
            ContextStatus::Completed => "completed",
            ContextStatus::Failed => "failed",
        }
    }

    pub fn is_resumable(&self) -> bool {
        matches!(self, ContextStatus::Paused | ContextStatus::Failed)
    }
}

impl fmt::Display for ContextStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ContextStatus {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "active" => Ok(ContextStatus::Active),
            "paused" => Ok(ContextStatus::Paused),
            "completed" => Ok(ContextStatus::Completed),
            "failed" => Ok(ContextStatus::Failed),
            other => Err(AppError::InvalidInput(format!(
                "unknown context status '{}'",
                other
            ))),
        }
    }
}

/// State of one multi-stage workflow.
#[derive(Debug, Clone, PartialEq, Serialize, ToSchema)]
pub struct SessionContext {
    pub context_id: String,
    pub status: ContextStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_stage: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub seed_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[schema(value_type = Object)]
    pub metadata: Value,
    pub trace_count: usize,
}

/// One immutable entry in a context's history.
#[derive(Debug, Clone, PartialEq, Serialize, ToSchema)]
pub struct ContextTrace {
    pub trace_id: String,
    pub context_id: String,
    /// 1-based position within the context
    pub sequence: u64,
    pub stage: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
    #[schema(value_type = Object)]
    pub content: Value,
    #[schema(value_type = Object)]
    pub metadata: Value,
    pub timestamp: DateTime<Utc>,
}

/// Data for a new trace entry.
#[derive(Debug, Clone)]
pub struct TraceInput {
    pub stage: String,
    pub content: Value,
    pub task_id: Option<String>,
    pub metadata: Value,
}

impl TraceInput {
    pub fn new(stage: impl Into<String>, content: Value) -> Self {
        Self {
            stage: stage.into(),
            content,
            task_id: None,
            metadata: Value::Null,
        }
    }

    pub fn with_task(mut self, task_id: impl Into<String>) -> Self {
        self.task_id = Some(task_id.into());
        self
    }

    pub fn with_metadata(mut self, metadata: Value) -> Self {
        self.metadata = metadata;
        self
    }
}

/// Filter for [`ContextManager::list_contexts`].
#[derive(Debug, Clone, Default, Deserialize, IntoParams)]
#[into_params(parameter_in = Query)]
pub struct ContextFilter {
    pub status: Option<ContextStatus>,
    pub stage: Option<String>,
    pub limit: Option<usize>,
}

#[derive(Debug)]
struct ContextRecord {
    context: SessionContext,
    traces: Vec<ContextTrace>,
}

impl ContextRecord {
    fn ensure_mutable(&self) -> Result<()> {
        if self.context.status == ContextStatus::Completed {
            return Err(AppError::InvalidTransition(format!(
                "context {} is completed",
                self.context.context_id
            )));
        }
        Ok(())
    }

    fn append(&mut self, input: TraceInput) -> ContextTrace {
        // Clock skew must not reorder history
        let now = Utc::now();
        let timestamp = match self.traces.last() {
            Some(last) if last.timestamp > now => last.timestamp,
            _ => now,
        };
        let trace = ContextTrace {
            trace_id: Uuid::new_v4().to_string(),
            context_id: self.context.context_id.clone(),
            sequence: self.traces.len() as u64 + 1,
            stage: input.stage,
            task_id: input.task_id,
            content: input.content,
            metadata: input.metadata,
            timestamp,
        };
        self.traces.push(trace.clone());
        self.context.trace_count = self.traces.len();
        self.context.updated_at = timestamp;
        trace
    }
}

/// Sole owner of contexts and traces.
#[derive(Debug, Default)]
pub struct ContextManager {
    contexts: DashMap<String, Arc<Mutex<ContextRecord>>>,
}

impl ContextManager {
    pub fn new() -> Self {
        Self::default()
    }

    fn record(&self, context_id: &str) -> Result<Arc<Mutex<ContextRecord>>> {
        self.contexts
            .get(context_id)
            .map(|r| Arc::clone(r.value()))
            .ok_or_else(|| AppError::ContextNotFound(context_id.to_string()))
    }

    /// Create an active context. A given seed becomes the context id.
    pub fn create_context(&self, seed_id: Option<&str>) -> Result<SessionContext> {
        self.create_context_with(seed_id, Value::Null)
    }

    pub fn create_context_with(
        &self,
        seed_id: Option<&str>,
        metadata: Value,
    ) -> Result<SessionContext> {
        let seed = seed_id.map(str::trim).filter(|s| !s.is_empty());
        let context_id = seed
            .map(str::to_string)
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let now = Utc::now();
        let context = SessionContext {
            context_id: context_id.clone(),
            status: ContextStatus::Active,
            current_stage: None,
            seed_id: seed.map(str::to_string),
            created_at: now,
            updated_at: now,
            metadata,
            trace_count: 0,
        };

        match self.contexts.entry(context_id.clone()) {
            Entry::Occupied(_) => Err(AppError::InvalidInput(format!(
                "context {} already exists",
                context_id
            ))),
            Entry::Vacant(vacant) => {
                vacant.insert(Arc::new(Mutex::new(ContextRecord {
                    context: context.clone(),
                    traces: Vec::new(),
                })));
                info!(context_id = %context_id, "Context created");
                Ok(context)
            }
        }
    }

    pub fn get_context(&self, context_id: &str) -> Result<SessionContext> {
        Ok(self.record(context_id)?.lock().context.clone())
    }

    /// Append a trace; rejected once the context is completed.
    pub fn add_context_trace(&self, context_id: &str, input: TraceInput) -> Result<String> {
        let record = self.record(context_id)?;
        let mut record = record.lock();
        record.ensure_mutable()?;
        let trace = record.append(input);
        debug!(
            context_id = %context_id,
            stage = %trace.stage,
            sequence = trace.sequence,
            "Trace appended"
        );
        Ok(trace.trace_id)
    }

    /// Traces in creation order.
    pub fn get_context_traces(&self, context_id: &str) -> Result<Vec<ContextTrace>> {
        Ok(self.record(context_id)?.lock().traces.clone())
    }

    pub fn list_contexts(&self, filter: &ContextFilter) -> Vec<SessionContext> {
        let records: Vec<_> = self
            .contexts
            .iter()
            .map(|r| Arc::clone(r.value()))
            .collect();

        let mut contexts: Vec<SessionContext> = records
            .iter()
            .map(|r| r.lock().context.clone())
            .filter(|c| filter.status.is_none_or(|s| c.status == s))
            .filter(|c| {
                filter
                    .stage
                    .as_deref()
                    .is_none_or(|s| c.current_stage.as_deref() == Some(s))
            })
            .collect();
        contexts.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.context_id.cmp(&b.context_id))
        });
        if let Some(limit) = filter.limit {
            contexts.truncate(limit);
        }
        contexts
    }

    /// Reactivate a paused or failed context at its current stage.
    pub fn resume_context(&self, context_id: &str) -> Result<SessionContext> {
        let record = self.record(context_id)?;
        let mut record = record.lock();
        let previous = record.context.status;
        if !previous.is_resumable() {
            return Err(AppError::InvalidTransition(format!(
                "cannot resume context {} from {}",
                context_id, previous
            )));
        }

        record.context.status = ContextStatus::Active;
        let stage = record
            .context
            .current_stage
            .clone()
            .unwrap_or_else(|| "resume".to_string());
        record.append(TraceInput::new(
            stage,
            json!({ "event": "resumed", "from": previous }),
        ));
        info!(context_id = %context_id, from = %previous, "Context resumed");
        Ok(record.context.clone())
    }

    /// Set status and optionally move to `stage`.
    pub fn update_context_status(
        &self,
        context_id: &str,
        status: ContextStatus,
        stage: Option<&str>,
    ) -> Result<SessionContext> {
        let record = self.record(context_id)?;
        let mut record = record.lock();
        record.ensure_mutable()?;

        if record.context.status != status {
            info!(
                context_id = %context_id,
                from = %record.context.status,
                to = %status,
                "Context status changed"
            );
        }
        record.context.status = status;
        if let Some(stage) = stage {
            record.context.current_stage = Some(stage.to_string());
        }
        record.context.updated_at = Utc::now().max(record.context.updated_at);
        Ok(record.context.clone())
    }

    /// Merge keys into the context metadata object.
    pub fn merge_metadata(&self, context_id: &str, patch: Value) -> Result<SessionContext> {
        let record = self.record(context_id)?;
        let mut record = record.lock();
        record.ensure_mutable()?;
        if !record.context.metadata.is_object() {
            record.context.metadata = json!({});
        }
        if let (Some(target), Value::Object(patch)) = (record.context.metadata.as_object_mut(), patch)
        {
            target.extend(patch);
        }
        Ok(record.context.clone())
    }

    pub fn len(&self) -> usize {
        self.contexts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.contexts.is_empty()
    }
}
