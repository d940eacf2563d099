//! Task routing: agent selection, circuit breaking, retry and timeouts.

pub mod balancer;
pub mod circuit_breaker;
pub mod dispatcher;
pub mod task;

pub use balancer::{LoadBalanceStrategy, LoadBalancer};
pub use circuit_breaker::{BreakerSnapshot, CircuitBreaker, CircuitBreakerRegistry, CircuitState};
pub use dispatcher::{DispatchStats, Dispatcher};
pub use task::{DispatchOutcome, TaskRequest, TaskSnapshot};

use crate::protocol::Envelope;
use crate::types::Result;

/// Outbound delivery used by the dispatcher.
///
/// Implementations must not block; delivery only enqueues the frame on the
/// target connection.
pub trait TaskTransport: Send + Sync {
    /// Send to the session currently bound to `agent_id`.
    fn deliver_to_agent(&self, agent_id: &str, envelope: Envelope) -> Result<()>;

    /// Send to a session by id.
    fn deliver_to_session(&self, session_id: &str, envelope: Envelope) -> Result<()>;
}
