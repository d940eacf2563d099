//! API request handlers.

/// Registered agent listing.
pub mod agents;
/// Context, trace and task inspection.
pub mod contexts;
/// Liveness endpoint.
pub mod health;
/// WebSocket session transport.
pub mod ws;
