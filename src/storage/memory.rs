//! In-memory [Storage] implementation

use super::{is_ap_id, Storage};
use crate::error::Error;
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use tokio::sync::RwLock;

#[derive(Default)]
struct Inner {
    follows: HashSet<(String, String)>,
    object_by_foreign: HashMap<String, String>,
    object_by_native: HashMap<String, String>,
    /// foreign ids in insertion order, for the outbox page
    object_log: Vec<String>,
    actor_keys: HashMap<String, String>,
    kv: HashMap<String, String>,
}

/// Storage backed by process memory. Contents are lost on restart, which is
/// acceptable for tests and for single-operator trial runs: derived keys are
/// deterministic and follow state is re-learned from inbound activities.
#[derive(Default)]
pub struct MemoryStorage {
    inner: RwLock<Inner>,
}

impl MemoryStorage {
    /// New empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    async fn add_follow(&self, follower: &str, followed: &str) -> Result<(), Error> {
        let mut inner = self.inner.write().await;
        inner
            .follows
            .insert((follower.to_string(), followed.to_string()));
        Ok(())
    }

    async fn remove_follow(&self, follower: &str, followed: &str) -> Result<(), Error> {
        let mut inner = self.inner.write().await;
        inner
            .follows
            .remove(&(follower.to_string(), followed.to_string()));
        Ok(())
    }

    async fn get_followers(&self, actor: &str) -> Result<Vec<String>, Error> {
        let inner = self.inner.read().await;
        Ok(inner
            .follows
            .iter()
            .filter(|(_, followed)| followed == actor)
            .map(|(follower, _)| follower.clone())
            .collect())
    }

    async fn get_ap_followers(&self, actor: &str) -> Result<Vec<String>, Error> {
        Ok(self
            .get_followers(actor)
            .await?
            .into_iter()
            .filter(|id| is_ap_id(id))
            .collect())
    }

    async fn get_following(&self, actor: &str) -> Result<Vec<String>, Error> {
        let inner = self.inner.read().await;
        Ok(inner
            .follows
            .iter()
            .filter(|(follower, _)| follower == actor)
            .map(|(_, followed)| followed.clone())
            .collect())
    }

    async fn get_ap_following(&self, actor: &str) -> Result<Vec<String>, Error> {
        Ok(self
            .get_following(actor)
            .await?
            .into_iter()
            .filter(|id| is_ap_id(id))
            .collect())
    }

    async fn add_object(&self, foreign_id: &str, native_id: &str) -> Result<(), Error> {
        let mut inner = self.inner.write().await;
        if inner.object_by_foreign.contains_key(foreign_id) {
            return Ok(());
        }
        inner
            .object_by_foreign
            .insert(foreign_id.to_string(), native_id.to_string());
        inner
            .object_by_native
            .insert(native_id.to_string(), foreign_id.to_string());
        inner.object_log.push(foreign_id.to_string());
        Ok(())
    }

    async fn delete_object(&self, foreign_id: &str, native_id: &str) -> Result<(), Error> {
        let mut inner = self.inner.write().await;
        inner.object_by_foreign.remove(foreign_id);
        inner.object_by_native.remove(native_id);
        inner.object_log.retain(|id| id != foreign_id);
        Ok(())
    }

    async fn get_native_id_for(&self, foreign_id: &str) -> Result<Option<String>, Error> {
        let inner = self.inner.read().await;
        Ok(inner.object_by_foreign.get(foreign_id).cloned())
    }

    async fn get_foreign_id_for(&self, native_id: &str) -> Result<Option<String>, Error> {
        let inner = self.inner.read().await;
        Ok(inner.object_by_native.get(native_id).cloned())
    }

    async fn get_recent_local_objects(
        &self,
        prefix: &str,
        limit: usize,
    ) -> Result<Vec<String>, Error> {
        let inner = self.inner.read().await;
        Ok(inner
            .object_log
            .iter()
            .rev()
            .filter(|id| id.starts_with(prefix))
            .take(limit)
            .cloned()
            .collect())
    }

    async fn get_local_object_count(&self, prefix: &str) -> Result<usize, Error> {
        let inner = self.inner.read().await;
        Ok(inner
            .object_log
            .iter()
            .filter(|id| id.starts_with(prefix))
            .count())
    }

    async fn store_actor_key(&self, pubkey: &str, foreign_actor_id: &str) -> Result<(), Error> {
        let mut inner = self.inner.write().await;
        inner
            .actor_keys
            .insert(pubkey.to_string(), foreign_actor_id.to_string());
        Ok(())
    }

    async fn get_actor_for_key(&self, pubkey: &str) -> Result<Option<String>, Error> {
        let inner = self.inner.read().await;
        Ok(inner.actor_keys.get(pubkey).cloned())
    }

    async fn get_all_actor_keys(&self) -> Result<Vec<(String, String)>, Error> {
        let inner = self.inner.read().await;
        Ok(inner
            .actor_keys
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }

    async fn set_kv(&self, key: &str, value: &str) -> Result<(), Error> {
        let mut inner = self.inner.write().await;
        inner.kv.insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn get_kv(&self, key: &str) -> Result<Option<String>, Error> {
        let inner = self.inner.read().await;
        Ok(inner.kv.get(key).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_follow_idempotent() {
        let storage = MemoryStorage::new();
        storage.add_follow("a", "b").await.unwrap();
        storage.add_follow("a", "b").await.unwrap();
        assert_eq!(storage.get_followers("b").await.unwrap(), vec!["a"]);
        storage.remove_follow("a", "b").await.unwrap();
        assert!(storage.get_followers("b").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_ap_follower_split() {
        let storage = MemoryStorage::new();
        storage
            .add_follow("https://mastodon.example/users/alice", "operator")
            .await
            .unwrap();
        storage
            .add_follow("at://did:plc:abc123", "operator")
            .await
            .unwrap();
        storage.add_follow("deadbeef", "operator").await.unwrap();

        let all = storage.get_followers("operator").await.unwrap();
        assert_eq!(all.len(), 3);
        let ap = storage.get_ap_followers("operator").await.unwrap();
        assert_eq!(ap, vec!["https://mastodon.example/users/alice"]);
    }

    #[tokio::test]
    async fn test_object_mapping() {
        let storage = MemoryStorage::new();
        storage
            .add_object("https://mastodon.example/notes/1", "eventid1")
            .await
            .unwrap();
        // second insert with a different native id does not clobber
        storage
            .add_object("https://mastodon.example/notes/1", "eventid2")
            .await
            .unwrap();
        assert_eq!(
            storage
                .get_native_id_for("https://mastodon.example/notes/1")
                .await
                .unwrap(),
            Some("eventid1".to_string())
        );
        assert_eq!(
            storage.get_foreign_id_for("eventid1").await.unwrap(),
            Some("https://mastodon.example/notes/1".to_string())
        );
    }

    #[tokio::test]
    async fn test_recent_local_objects() {
        let storage = MemoryStorage::new();
        for i in 0..5 {
            storage
                .add_object(&format!("https://bridge.example/objects/{i}"), &format!("n{i}"))
                .await
                .unwrap();
        }
        storage
            .add_object("https://mastodon.example/notes/9", "n9")
            .await
            .unwrap();

        let recent = storage
            .get_recent_local_objects("https://bridge.example/", 3)
            .await
            .unwrap();
        assert_eq!(
            recent,
            vec![
                "https://bridge.example/objects/4",
                "https://bridge.example/objects/3",
                "https://bridge.example/objects/2"
            ]
        );
        assert_eq!(
            storage
                .get_local_object_count("https://bridge.example/")
                .await
                .unwrap(),
            5
        );
    }
}
