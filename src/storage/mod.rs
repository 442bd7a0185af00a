//! Contract the bridge requires from the external key/value store
//!
//! The production database lives outside this crate; [memory::MemoryStorage]
//! is the reference implementation used by tests and by the binary when no
//! `DATABASE_URL` is configured.

use crate::error::Error;
use async_trait::async_trait;

pub mod memory;

/// Prefix distinguishing third-network (AT-protocol style) identifiers from
/// fediverse actor urls in the follow graph.
pub const THIRD_NETWORK_PREFIX: &str = "at://";

/// Is this participant id a fediverse actor url (as opposed to a native
/// pubkey or third-network id)?
pub fn is_ap_id(id: &str) -> bool {
    id.starts_with("https://") || id.starts_with("http://")
}

/// Operations the bridge core needs from persistence.
///
/// All follow operations are idempotent. Identifiers on either side of a
/// follow edge may be a native pubkey (hex), a fediverse actor url, or a
/// prefixed third-network id.
#[async_trait]
pub trait Storage: Send + Sync {
    /// Record a follow edge. Repeated calls for the same pair are a no-op.
    async fn add_follow(&self, follower: &str, followed: &str) -> Result<(), Error>;
    /// Remove a follow edge if present.
    async fn remove_follow(&self, follower: &str, followed: &str) -> Result<(), Error>;
    /// All followers of the given participant.
    async fn get_followers(&self, actor: &str) -> Result<Vec<String>, Error>;
    /// Followers which are fediverse actors.
    async fn get_ap_followers(&self, actor: &str) -> Result<Vec<String>, Error>;
    /// Everyone the given participant follows.
    async fn get_following(&self, actor: &str) -> Result<Vec<String>, Error>;
    /// Followees which are fediverse actors.
    async fn get_ap_following(&self, actor: &str) -> Result<Vec<String>, Error>;

    /// Record a `foreign object id -> native event id` pair. Each side is
    /// unique; storing an existing pair again is a no-op.
    async fn add_object(&self, foreign_id: &str, native_id: &str) -> Result<(), Error>;
    /// Drop a stored object mapping.
    async fn delete_object(&self, foreign_id: &str, native_id: &str) -> Result<(), Error>;
    /// Native event id a foreign object was bridged to, if any.
    async fn get_native_id_for(&self, foreign_id: &str) -> Result<Option<String>, Error>;
    /// Foreign object id a native event was bridged to, if any.
    async fn get_foreign_id_for(&self, native_id: &str) -> Result<Option<String>, Error>;
    /// Most recently stored foreign ids starting with `prefix`, newest first.
    async fn get_recent_local_objects(
        &self,
        prefix: &str,
        limit: usize,
    ) -> Result<Vec<String>, Error>;
    /// Count of stored foreign ids starting with `prefix`.
    async fn get_local_object_count(&self, prefix: &str) -> Result<usize, Error>;

    /// Persist the reverse index `derived native pubkey -> foreign actor id`.
    ///
    /// The forward direction is deterministic and never persisted; losing
    /// this index only forces a webfinger re-lookup.
    async fn store_actor_key(&self, pubkey: &str, foreign_actor_id: &str) -> Result<(), Error>;
    /// Foreign actor id behind a derived pubkey, if known.
    async fn get_actor_for_key(&self, pubkey: &str) -> Result<Option<String>, Error>;
    /// All known `derived pubkey -> foreign actor id` pairs.
    async fn get_all_actor_keys(&self) -> Result<Vec<(String, String)>, Error>;

    /// Freeform string setting.
    async fn set_kv(&self, key: &str, value: &str) -> Result<(), Error>;
    /// Read back a freeform setting. `None` when the key was never written.
    async fn get_kv(&self, key: &str) -> Result<Option<String>, Error>;
}
