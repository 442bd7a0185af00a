//! Causeway bridges a single operator's Nostr identity into the
//! ActivityPub fediverse and mirrors remote activity back onto the relays.
//!
//! The two pipelines share one set of collaborators
//! ([handlers::Bridge]): outbound, the relay subscription feeds the
//! [handlers::event_handler::EventHandler], which transmutes events and
//! fans them out through the [federator::Federator]; inbound, the
//! [ingress] gateway verifies HTTP signatures and hands activities to the
//! [handlers::activity_handler::ActivityHandler], which signs the mirrored
//! events with deterministic derived keys and publishes through the
//! [relay::RelayManager].

/// Third-network session handling and notification mirroring
pub mod atproto;
/// Data structures for the federated side
pub mod apub;
/// Bridge configuration, read from the environment
pub mod config;
/// Error types returned across the bridge
pub mod error;
/// Fan-out of outbound activities to remote inboxes
pub mod federator;
/// Fetching and caching remote documents
pub mod fetch;
/// The two bridging pipelines
pub mod handlers;
/// Creating and verifying HTTP signatures
pub mod httpsig;
/// Operator identity and derived identities
pub mod identity;
/// The HTTP surface
pub mod ingress;
/// Relay connection management
pub mod relay;
/// Persistence contract and the in-memory store
pub mod storage;
/// Pure conversions between events and activities
pub mod transmute;
/// Background maintenance tasks
pub mod workers;
