//! MCP tool server over stdio.

pub mod server;

pub use server::{start_stdio_server, HubMcpServer};
