//! Relay connection management
//!
//! The bridge keeps a live set of relays it reads the operator's events from
//! and publishes bridged events to. Each relay has an independent circuit
//! breaker; the set can be reconfigured at runtime and an active
//! subscription follows the change without waiting for a reconnect backoff.

pub mod circuit;
pub mod manager;
pub mod subscription;

pub use circuit::{CircuitBreaker, CircuitState};
pub use manager::{PublishOutcome, RelayManager, RelayTransport, WebSocketTransport};
