//! # A.R.E.S MCP Hub
//!
//! Orchestration hub for multi-agent research. Worker agents (planners,
//! literature search, PRISMA screening, synthesis, writers, ...) connect over
//! a WebSocket, register their capabilities and receive tasks; clients submit
//! tasks or whole research workflows and get exactly one terminal result per
//! task.
//!
//! ## Overview
//!
//! The hub can be used in two ways:
//!
//! 1. **As a standalone server** - Run the `ares-mcp-server` binary
//! 2. **As a library** - Embed a [`Hub`] behind your own transport
//!
//! ### Embedding
//!
//! ```rust,ignore
//! use ares_mcp::{Hub, HubConfigManager};
//! use std::sync::Arc;
//!
//! let config = Arc::new(HubConfigManager::new_or_default("ares-mcp.toml")?);
//! let hub = Arc::new(Hub::new(Arc::clone(&config)));
//! hub.start();
//!
//! let (session_id, mut outbound) = hub.connect()?;
//! hub.handle_text(&session_id, r#"{"jsonrpc":"2.0","id":1,"method":"ping"}"#);
//! assert_eq!(outbound.recv().await.unwrap().to_json(), r#"{"jsonrpc":"2.0","id":1,"result":"pong"}"#);
//! ```
//!
//! ## Feature Flags
//!
//! | Feature | Description |
//! |---------|-------------|
//! | `mcp` | MCP stdio tool server exposing hub operations |
//! | `swagger-ui` | Interactive API documentation |
//!
//! ## Modules
//!
//! - [`protocol`] - Envelope and JSON-RPC wire format
//! - [`session`] - Connection sessions and outbound queues
//! - [`agents`] - Agent registry, health and load accounting
//! - [`dispatch`] - Task routing, load balancing, circuit breaking, retry
//! - [`memory`] - Research contexts and their trace history
//! - [`research`] - Multi-stage research workflows
//! - [`hub`] - Composition root and message routing
//! - [`api`] - WebSocket and REST surface
//! - [`types`] - Common types and error handling
//!
//! ## Configuration
//!
//! A TOML file (`ares-mcp.toml`) overlaid with `MCP_*` environment variables.
//! The file is watched and hot-reloaded; the load-balancing strategy, task
//! timeout and retry budget apply to the next dispatch.

#![cfg_attr(docsrs, feature(doc_cfg))]
#![warn(rustdoc::missing_crate_level_docs)]

/// Registry of connected worker agents.
pub mod agents;
/// HTTP and WebSocket surface.
pub mod api;
/// Task routing and resilience.
pub mod dispatch;
/// Hub composition root.
pub mod hub;
/// Model Context Protocol (MCP) tool server.
#[cfg(feature = "mcp")]
pub mod mcp;
/// Research contexts and traces.
pub mod memory;
/// Wire protocol.
pub mod protocol;
/// Multi-stage research workflows.
pub mod research;
/// Connection sessions.
pub mod session;
/// Core types and errors.
pub mod types;
/// Configuration loading.
pub mod utils;

pub use agents::{AgentRegistration, AgentRegistry, AgentSnapshot};
pub use dispatch::{Dispatcher, LoadBalanceStrategy, TaskRequest};
pub use hub::Hub;
pub use memory::{ContextManager, ContextStatus, SessionContext};
pub use protocol::{Envelope, Message};
pub use research::ResearchCoordinator;
pub use types::{AppError, Result};
pub use utils::toml_config::{HubConfig, HubConfigManager};

use std::sync::Arc;

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    /// TOML configuration with hot-reload support
    pub config_manager: Arc<HubConfigManager>,
    /// The running hub
    pub hub: Arc<Hub>,
}

impl AppState {
    pub fn new(config_manager: Arc<HubConfigManager>) -> Self {
        let hub = Arc::new(Hub::new(Arc::clone(&config_manager)));
        Self {
            config_manager,
            hub,
        }
    }
}
