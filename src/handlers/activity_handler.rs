//! Verified remote activities flowing onto the relays

use crate::{
    apub::{
        activity::{Activity, ActivityType},
        object::{Note, RemoteObject, TagItem},
    },
    error::Error,
    handlers::Bridge,
    transmute::{self, to_nostr},
};
use nostr::{EventBuilder, PublicKey};
use serde_json::Value;
use std::{sync::Arc, time::Duration};
use tracing::{debug, info, warn};
use url::Url;

/// How long the deferred contact-list republish waits, batching a burst of
/// follows into one event.
const CONTACT_LIST_DELAY: Duration = Duration::from_secs(5);

/// Dispatches verified inbound activities by type.
pub struct ActivityHandler {
    bridge: Arc<Bridge>,
}

impl ActivityHandler {
    pub fn new(bridge: Arc<Bridge>) -> Self {
        ActivityHandler { bridge }
    }

    /// Process one verified activity end to end.
    pub async fn handle_activity(&self, activity: Activity) -> Result<(), Error> {
        let kind = activity.activity_type();
        if kind != ActivityType::Update {
            // warm the actor cache while we work
            let fetcher = self.bridge.fetcher.clone();
            let actor_url = activity.actor.clone();
            tokio::spawn(async move {
                let _ = fetcher.fetch_actor(&actor_url).await;
            });
        }

        match kind {
            ActivityType::Follow => self.on_follow(&activity).await,
            ActivityType::Create => self.on_create(&activity).await,
            ActivityType::Announce => self.on_announce(&activity).await,
            ActivityType::Like => self.on_reaction(&activity, "+".to_string()).await,
            ActivityType::EmojiReact => {
                let content = activity.content.clone().unwrap_or_else(|| "+".to_string());
                self.on_reaction(&activity, content).await
            }
            ActivityType::Delete => self.on_delete(&activity).await,
            ActivityType::Undo => self.on_undo(&activity).await,
            ActivityType::Update => self.on_update(&activity).await,
            ActivityType::Accept | ActivityType::Reject => {
                debug!("{} from {} acknowledged", activity.kind, activity.actor);
                Ok(())
            }
            ActivityType::Move => {
                // not implemented, intentionally
                debug!("ignoring Move from {}", activity.actor);
                Ok(())
            }
            ActivityType::Unknown => {
                debug!("ignoring {} from {}", activity.kind, activity.actor);
                Ok(())
            }
        }
    }

    /// Sign with the operator key only for the operator's own actor;
    /// everything else signs with that actor's derived key.
    fn sign_for(&self, builder: EventBuilder, actor: &Url) -> Result<nostr::Event, Error> {
        if *actor == self.bridge.config.actor_url() {
            self.bridge.signer.sign_as_self(builder)
        } else {
            self.bridge.signer.sign_as_derived(builder, actor.as_str())
        }
    }

    async fn on_follow(&self, activity: &Activity) -> Result<(), Error> {
        let follower = activity.actor.as_str();
        let operator = self.bridge.operator_id();

        // non-essential persistence failures don't stop the notification
        if let Err(e) = self.bridge.storage.add_follow(follower, &operator).await {
            warn!("persisting follow edge from {follower}: {e}");
        }
        if let Err(e) = self
            .bridge
            .storage
            .store_actor_key(
                &self.bridge.signer.public_key_for(follower)?.to_hex(),
                follower,
            )
            .await
        {
            warn!("persisting actor key for {follower}: {e}");
        }

        // accept immediately; the object is the original follow activity
        let accept_id = Url::parse(&format!(
            "{}#accepts/{}",
            self.bridge.config.actor_url(),
            nostr::Timestamp::now().as_u64()
        ))?;
        let mut accept = Activity::new(
            "Accept",
            accept_id,
            self.bridge.config.actor_url(),
            serde_json::to_value(activity).map_err(Error::MalformedActivity)?,
        );
        accept.to = vec![follower.to_string()];
        self.bridge.federator.federate(&accept).await?;

        let handle = match self.bridge.fetcher.fetch_actor(&activity.actor).await {
            Ok(actor) => actor.handle().unwrap_or_else(|| follower.to_string()),
            Err(_) => follower.to_string(),
        };
        let dm = self
            .bridge
            .signer
            .create_self_dm(&format!("🔔 New Fediverse follower: @{handle}"))?;
        self.bridge.relays.publish(dm).await?;
        info!("new follower @{handle}");

        self.schedule_contact_list_republish(activity.actor.clone());
        Ok(())
    }

    /// Publish the derived identity's contact list after a short delay, so
    /// its follow of the operator is visible on the relays.
    fn schedule_contact_list_republish(&self, follower: Url) {
        let bridge = self.bridge.clone();
        tokio::spawn(async move {
            tokio::time::sleep(CONTACT_LIST_DELAY).await;
            let result = async {
                let mut contacts = vec![bridge.signer.public_key()];
                for followed in bridge
                    .storage
                    .get_following(follower.as_str())
                    .await
                    .unwrap_or_default()
                {
                    if let Ok(pubkey) = PublicKey::from_hex(&followed) {
                        contacts.push(pubkey);
                    }
                }
                contacts.dedup();
                let tags = contacts
                    .into_iter()
                    .map(nostr::Tag::public_key)
                    .chain(std::iter::once(transmute::proxy_tag(follower.as_str())));
                let builder = EventBuilder::new(nostr::Kind::ContactList, "", tags);
                let event = bridge
                    .signer
                    .sign_as_derived(builder, follower.as_str())?;
                bridge.relays.publish(event).await
            }
            .await;
            if let Err(e) = result {
                warn!("contact list republish for {follower}: {e}");
            }
        });
    }

    async fn on_create(&self, activity: &Activity) -> Result<(), Error> {
        let note: Note = serde_json::from_value(activity.object.clone())?;
        if !matches!(note.kind.as_str(), "Note" | "Article" | "Question" | "Page") {
            debug!("ignoring Create({})", note.kind);
            return Ok(());
        }
        if !note.is_public() {
            debug!("ignoring non-public note {}", note.id);
            return Ok(());
        }
        if self
            .bridge
            .storage
            .get_native_id_for(note.id.as_str())
            .await?
            .is_some()
        {
            debug!("note {} already bridged", note.id);
            return Ok(());
        }

        let author = note.attributed_to.clone().unwrap_or_else(|| activity.actor.clone());
        let event = self.native_event_for_note(&note, &author).await?;
        self.bridge
            .storage
            .add_object(note.id.as_str(), &event.id.to_hex())
            .await?;
        self.bridge
            .storage
            .store_actor_key(&event.pubkey.to_hex(), author.as_str())
            .await?;
        self.bridge.relays.publish(event).await?;
        Ok(())
    }

    /// Convert a note, synchronously resolving reply and quote parents
    /// first so their threading tags are not silently dropped.
    async fn native_event_for_note(
        &self,
        note: &Note,
        author: &Url,
    ) -> Result<nostr::Event, Error> {
        let reply_parent = match &note.in_reply_to {
            Some(parent) => self.resolve_foreign_object(parent).await,
            None => None,
        };
        let quote = match &note.quote_url {
            Some(quoted) => self.resolve_foreign_object(quoted).await,
            None => None,
        };

        let mut mentions = Vec::new();
        for item in &note.tag {
            if let TagItem::Mention { href, .. } = item {
                let pubkey = self.bridge.signer.public_key_for(href.as_str())?;
                if let Err(e) = self
                    .bridge
                    .storage
                    .store_actor_key(&pubkey.to_hex(), href.as_str())
                    .await
                {
                    warn!("persisting mention key for {href}: {e}");
                }
                mentions.push(pubkey);
            }
        }

        let refs = to_nostr::InboundRefs {
            reply_parent,
            root: None,
            quote,
            mentions,
        };
        let builder = to_nostr::note_event_from_note(note, refs)?;
        self.sign_for(builder, author)
    }

    /// Native id of a foreign object, bridging it in on the spot when it is
    /// not cached yet. The parent is published before the child referencing
    /// it so the thread is never dangling.
    async fn resolve_foreign_object(&self, foreign: &Url) -> Option<String> {
        if self.bridge.config.is_local_url(foreign) {
            // our own object: the native id is the last path segment
            return foreign
                .path_segments()
                .and_then(|mut segments| segments.next_back())
                .map(str::to_string);
        }
        match self.bridge.storage.get_native_id_for(foreign.as_str()).await {
            Ok(Some(native)) => return Some(native),
            Ok(None) => {}
            Err(e) => {
                warn!("object lookup for {foreign}: {e}");
                return None;
            }
        }

        let raw = match self.bridge.fetcher.fetch_object(foreign).await {
            Ok(raw) => raw,
            Err(e) => {
                debug!("cannot fetch parent {foreign}: {e}");
                return None;
            }
        };
        let (RemoteObject::Note(parent) | RemoteObject::Article(parent) | RemoteObject::Question(parent)) =
            RemoteObject::from_value(Value::clone(&raw))
        else {
            debug!("parent {foreign} is not a content object");
            return None;
        };
        let author = parent.attributed_to.clone()?;
        let event = match Box::pin(self.native_event_for_note(&parent, &author)).await {
            Ok(event) => event,
            Err(e) => {
                debug!("cannot convert parent {foreign}: {e}");
                return None;
            }
        };
        let native_id = event.id.to_hex();
        if let Err(e) = self
            .bridge
            .storage
            .add_object(foreign.as_str(), &native_id)
            .await
        {
            warn!("storing parent mapping for {foreign}: {e}");
        }
        if let Err(e) = self.bridge.relays.publish(event).await {
            warn!("publishing parent {foreign}: {e}");
        }
        Some(native_id)
    }

    async fn on_announce(&self, activity: &Activity) -> Result<(), Error> {
        let Some(target) = activity.object_id() else {
            return Ok(());
        };
        // repost only what we can resolve
        let Some(native) = self.resolve_foreign_object(&target).await else {
            debug!("announced object {target} is not resolvable, skipping");
            return Ok(());
        };
        let builder = to_nostr::repost_from_announce(&activity.id, &native, None)?;
        let event = self.sign_for(builder, &activity.actor)?;
        self.bridge.relays.publish(event).await?;
        Ok(())
    }

    async fn on_reaction(&self, activity: &Activity, content: String) -> Result<(), Error> {
        let Some(target) = activity.object_id() else {
            return Ok(());
        };
        let Some(native) = self.native_id_for(&target).await else {
            debug!("reaction target {target} unknown, skipping");
            return Ok(());
        };
        let builder = to_nostr::reaction_event(&activity.id, &native, &content)?;
        let event = self.sign_for(builder, &activity.actor)?;
        self.bridge.relays.publish(event).await?;
        Ok(())
    }

    async fn on_delete(&self, activity: &Activity) -> Result<(), Error> {
        let Some(target) = activity.object_id() else {
            return Ok(());
        };
        let Some(native) = self.native_id_for(&target).await else {
            return Ok(());
        };
        let builder = to_nostr::deletion_event(&activity.id, &native)?;
        let event = self.sign_for(builder, &activity.actor)?;
        self.bridge.relays.publish(event).await?;
        if let Err(e) = self
            .bridge
            .storage
            .delete_object(target.as_str(), &native)
            .await
        {
            warn!("dropping mapping for deleted {target}: {e}");
        }
        Ok(())
    }

    async fn on_undo(&self, activity: &Activity) -> Result<(), Error> {
        if activity.object_type() == Some("Follow") {
            let operator = self.bridge.operator_id();
            self.bridge
                .storage
                .remove_follow(activity.actor.as_str(), &operator)
                .await?;
            info!("unfollowed by {}", activity.actor);
            return Ok(());
        }
        debug!("ignoring Undo({:?})", activity.object_type());
        Ok(())
    }

    async fn on_update(&self, activity: &Activity) -> Result<(), Error> {
        if !matches!(
            activity.object_type(),
            Some("Person" | "Service" | "Application")
        ) {
            debug!("ignoring Update({:?})", activity.object_type());
            return Ok(());
        }
        self.bridge.fetcher.invalidate(&activity.actor).await;
        let actor: crate::apub::actor::ActorDoc =
            serde_json::from_value(activity.object.clone())?;

        let domain = self.bridge.config.domain();
        let metadata = to_nostr::metadata_from_actor(&actor, &domain)?;
        let event = self.sign_for(metadata, &activity.actor)?;
        self.bridge.relays.publish(event).await?;

        let relays = self.bridge.relays.relays().await;
        let relay_list = to_nostr::relay_list_event(&activity.actor, &relays)?;
        let event = self.sign_for(relay_list, &activity.actor)?;
        self.bridge.relays.publish(event).await?;
        Ok(())
    }

    /// Mapping-only native id lookup (no fetch), for verbs that target an
    /// already-bridged object.
    async fn native_id_for(&self, foreign: &Url) -> Option<String> {
        if self.bridge.config.is_local_url(foreign) {
            return foreign
                .path_segments()
                .and_then(|mut segments| segments.next_back())
                .map(str::to_string);
        }
        self.bridge
            .storage
            .get_native_id_for(foreign.as_str())
            .await
            .ok()
            .flatten()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::tests::test_config,
        federator::Federator,
        fetch::Fetcher,
        identity::Signer,
        relay::{manager::RelayTransport, RelayManager},
        storage::{memory::MemoryStorage, Storage},
    };
    use async_trait::async_trait;
    use nostr::{Event, Kind};
    use std::sync::Mutex;

    /// Collects published events instead of touching the network.
    struct RecordingTransport {
        published: Mutex<Vec<Event>>,
    }

    #[async_trait]
    impl RelayTransport for RecordingTransport {
        async fn publish(&self, _relay_url: &str, event: &Event) -> Result<(), Error> {
            self.published.lock().unwrap().push(event.clone());
            Ok(())
        }
    }

    fn test_setup() -> (ActivityHandler, Arc<MemoryStorage>, Arc<RecordingTransport>) {
        let config = Arc::new(test_config());
        let signer = Arc::new(
            Signer::new("67dea2ed018072d675f5415ecfaed7d2597555e202d85b3d65ea4e58d2d92ffa")
                .unwrap(),
        );
        let storage = Arc::new(MemoryStorage::new());
        let fetcher = Arc::new(Fetcher::new(config.clone()));
        let transport = Arc::new(RecordingTransport {
            published: Mutex::new(Vec::new()),
        });
        let relays = RelayManager::new(config.clone(), transport.clone());
        let federator = Arc::new(Federator::new(
            config.clone(),
            fetcher.clone(),
            storage.clone(),
            signer.public_key().to_hex(),
        ));
        let bridge = Arc::new(Bridge {
            config,
            signer,
            storage: storage.clone(),
            fetcher,
            relays,
            federator,
        });
        (ActivityHandler::new(bridge), storage, transport)
    }

    fn activity(kind: &str, object: Value) -> Activity {
        let mut activity = Activity::new(
            kind,
            Url::parse("https://mastodon.example/activities/1").unwrap(),
            Url::parse("https://mastodon.example/users/alice").unwrap(),
            object,
        );
        activity.to = vec![crate::apub::PUBLIC.to_string()];
        activity
    }

    #[tokio::test]
    async fn test_public_note_is_bridged() {
        let (handler, storage, transport) = test_setup();
        let note = serde_json::json!({
            "type": "Note",
            "id": "https://mastodon.example/notes/1",
            "attributedTo": "https://mastodon.example/users/alice",
            "to": [crate::apub::PUBLIC],
            "content": "<p>hello relay world</p>"
        });
        handler.handle_activity(activity("Create", note)).await.unwrap();

        let native = storage
            .get_native_id_for("https://mastodon.example/notes/1")
            .await
            .unwrap()
            .expect("mapping stored");
        let published = transport.published.lock().unwrap();
        assert_eq!(published.len(), 1);
        let event = &published[0];
        assert_eq!(event.id.to_hex(), native);
        assert_eq!(event.kind, Kind::TextNote);
        assert_eq!(event.content, "hello relay world");
        assert!(crate::transmute::has_proxy_tag(event));
        // signed by alice's derived key, not the operator
        assert_ne!(
            event.pubkey.to_hex(),
            handler.bridge.operator_id()
        );
    }

    #[tokio::test]
    async fn test_non_public_note_skipped() {
        let (handler, storage, transport) = test_setup();
        let note = serde_json::json!({
            "type": "Note",
            "id": "https://mastodon.example/notes/2",
            "attributedTo": "https://mastodon.example/users/alice",
            "to": ["https://mastodon.example/users/bob"],
            "content": "<p>private</p>"
        });
        handler.handle_activity(activity("Create", note)).await.unwrap();
        assert!(storage
            .get_native_id_for("https://mastodon.example/notes/2")
            .await
            .unwrap()
            .is_none());
        assert!(transport.published.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_reply_to_local_object_needs_no_lookup() {
        let (handler, _storage, transport) = test_setup();
        let parent_native = "ab".repeat(32);
        let note = serde_json::json!({
            "type": "Note",
            "id": "https://mastodon.example/notes/3",
            "attributedTo": "https://mastodon.example/users/alice",
            "to": [crate::apub::PUBLIC],
            "inReplyTo": format!("https://bridge.example/objects/{parent_native}"),
            "content": "<p>replying to the operator</p>"
        });
        handler.handle_activity(activity("Create", note)).await.unwrap();

        let published = transport.published.lock().unwrap();
        let event = published.last().unwrap();
        let e_tag = event
            .tags
            .iter()
            .map(|t| t.as_slice().to_vec())
            .find(|v| v.first().map(String::as_str) == Some("e"))
            .expect("reply tag present");
        assert_eq!(e_tag[1], parent_native);
    }

    #[tokio::test]
    async fn test_like_creates_reaction() {
        let (handler, storage, transport) = test_setup();
        storage
            .add_object("https://mastodon.example/notes/5", &"cd".repeat(32))
            .await
            .unwrap();
        handler
            .handle_activity(activity(
                "Like",
                Value::String("https://mastodon.example/notes/5".to_string()),
            ))
            .await
            .unwrap();

        let published = transport.published.lock().unwrap();
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].kind, Kind::Reaction);
        assert_eq!(published[0].content, "+");
    }

    #[tokio::test]
    async fn test_emoji_react() {
        let (handler, storage, transport) = test_setup();
        storage
            .add_object("https://mastodon.example/notes/5", &"cd".repeat(32))
            .await
            .unwrap();
        let mut react = activity(
            "EmojiReact",
            Value::String("https://mastodon.example/notes/5".to_string()),
        );
        react.content = Some("🔥".to_string());
        handler.handle_activity(react).await.unwrap();

        let published = transport.published.lock().unwrap();
        assert_eq!(published[0].content, "🔥");
    }

    #[tokio::test]
    async fn test_delete_removes_mapping() {
        let (handler, storage, transport) = test_setup();
        let native = "ef".repeat(32);
        storage
            .add_object("https://mastodon.example/notes/6", &native)
            .await
            .unwrap();
        handler
            .handle_activity(activity(
                "Delete",
                Value::String("https://mastodon.example/notes/6".to_string()),
            ))
            .await
            .unwrap();

        assert!(storage
            .get_native_id_for("https://mastodon.example/notes/6")
            .await
            .unwrap()
            .is_none());
        let published = transport.published.lock().unwrap();
        assert_eq!(published[0].kind, Kind::EventDeletion);
    }

    #[tokio::test]
    async fn test_undo_follow_removes_edge() {
        let (handler, storage, _transport) = test_setup();
        let operator = handler.bridge.operator_id();
        storage
            .add_follow("https://mastodon.example/users/alice", &operator)
            .await
            .unwrap();

        let undo = activity(
            "Undo",
            serde_json::json!({
                "type": "Follow",
                "id": "https://mastodon.example/activities/0",
                "actor": "https://mastodon.example/users/alice",
                "object": "https://bridge.example/users/operator"
            }),
        );
        handler.handle_activity(undo).await.unwrap();
        assert!(storage.get_followers(&operator).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_update_person_publishes_metadata_and_relays() {
        let (handler, _storage, transport) = test_setup();
        let update = activity(
            "Update",
            serde_json::json!({
                "type": "Person",
                "id": "https://mastodon.example/users/alice",
                "preferredUsername": "alice",
                "name": "Alice",
                "inbox": "https://mastodon.example/users/alice/inbox"
            }),
        );
        handler.handle_activity(update).await.unwrap();

        let published = transport.published.lock().unwrap();
        let kinds: Vec<Kind> = published.iter().map(|e| e.kind).collect();
        assert!(kinds.contains(&Kind::Metadata));
        assert!(kinds.contains(&Kind::RelayList));
    }

    #[tokio::test]
    async fn test_follow_persists_edge_and_notifies() {
        let (handler, storage, transport) = test_setup();
        let operator = handler.bridge.operator_id();
        let follow = activity(
            "Follow",
            Value::String("https://bridge.example/users/operator".to_string()),
        );
        handler.handle_activity(follow).await.unwrap();

        assert_eq!(
            storage.get_followers(&operator).await.unwrap(),
            vec!["https://mastodon.example/users/alice"]
        );
        // the derived-key reverse index is in place
        let derived = handler
            .bridge
            .signer
            .public_key_for("https://mastodon.example/users/alice")
            .unwrap();
        assert_eq!(
            storage
                .get_actor_for_key(&derived.to_hex())
                .await
                .unwrap()
                .unwrap(),
            "https://mastodon.example/users/alice"
        );
        // an encrypted notification DM went out to the operator
        let published = transport.published.lock().unwrap();
        let dm = published
            .iter()
            .find(|e| e.kind == Kind::EncryptedDirectMessage)
            .expect("follower DM published");
        assert_eq!(dm.pubkey.to_hex(), operator);
        assert!(!dm.content.contains("Fediverse"));
    }

    #[tokio::test]
    async fn test_move_is_stubbed() {
        let (handler, _storage, transport) = test_setup();
        handler
            .handle_activity(activity("Move", Value::Null))
            .await
            .unwrap();
        assert!(transport.published.lock().unwrap().is_empty());
    }
}
