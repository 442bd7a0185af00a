//! Data structures for the federated side of the bridge
//!
//! These model the ActivityStreams documents the bridge produces and
//! consumes. Remote input is deliberately forgiving (single values or
//! arrays, unknown tag items, unknown object types), while everything the
//! bridge emits is typed.

use serde::{Deserialize, Serialize};

pub mod activity;
pub mod actor;
pub mod context;
pub mod helpers;
pub mod object;

/// Mime type for Activitypub, used for `Accept` and `Content-Type` HTTP headers
pub static FEDERATION_CONTENT_TYPE: &str = "application/activity+json";

/// The ActivityStreams public addressing collection.
pub static PUBLIC: &str = "https://www.w3.org/ns/activitystreams#Public";

/// Back-reference placed on every object the bridge federates out, naming
/// the native protocol and the bech32-encoded native id. The counterpart of
/// the `proxy` tag on bridged-in events; together they prevent loops.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
pub struct ProxyOf {
    /// Name of the proxied protocol, `nostr`
    pub protocol: String,
    /// Bech32-encoded native identifier (`note1…` for objects, `npub1…` for actors)
    pub proxied: String,
}

impl ProxyOf {
    /// Back-reference to a native event or key.
    pub fn nostr(proxied: impl Into<String>) -> Self {
        ProxyOf {
            protocol: "nostr".to_string(),
            proxied: proxied.into(),
        }
    }
}
