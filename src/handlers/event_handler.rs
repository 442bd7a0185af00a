//! Native events flowing out to the fediverse

use crate::{
    handlers::Bridge,
    relay::subscription::EventSink,
    transmute::{self, event_refs, to_apub},
};
use async_trait::async_trait;
use nostr::{Event, Kind};
use std::sync::Arc;
use tracing::{debug, warn};
use url::Url;

/// Dispatches the operator's events by kind.
pub struct EventHandler {
    bridge: Arc<Bridge>,
}

impl EventHandler {
    pub fn new(bridge: Arc<Bridge>) -> Self {
        EventHandler { bridge }
    }

    async fn process(&self, event: &Event) -> Result<(), crate::error::Error> {
        if event.verify().is_err() {
            debug!("dropping event {} with bad signature", event.id);
            return Ok(());
        }
        if transmute::has_proxy_tag(event) {
            // our own round-trip coming back from a relay
            debug!("skipping proxied event {}", event.id);
            return Ok(());
        }

        let bridge = &self.bridge;
        let config = &bridge.config;
        match event.kind {
            Kind::Metadata => {
                // keep the latest profile for the actor endpoint
                if let Err(e) = bridge
                    .storage
                    .set_kv("profile_metadata", &event.content)
                    .await
                {
                    warn!("persisting profile metadata: {e}");
                }
                let update = to_apub::update_from_metadata(config, event)?;
                bridge.federator.federate(&update).await?;
            }
            Kind::TextNote => {
                let refs = event_refs(event);
                let quote_foreign = match &refs.quote {
                    Some(id) => self.foreign_id_for(id).await,
                    None => None,
                };
                if to_apub::is_bare_repost(event, refs.quote.as_deref()) {
                    if let Some(target) = &quote_foreign {
                        let announce = to_apub::announce_activity(config, event, target)?;
                        bridge.federator.federate(&announce).await?;
                        return Ok(());
                    }
                }
                let outbound = to_apub::OutboundRefs {
                    in_reply_to: match &refs.reply {
                        Some(id) => self.foreign_id_for(id).await,
                        None => None,
                    },
                    quote: quote_foreign,
                    mentions: self.resolve_mentions(event).await,
                };
                let note = to_apub::note_from_event(config, event, outbound)?;
                let object_id = note.id.to_string();
                let create = to_apub::create_activity(config, note)?;
                if let Err(e) = bridge
                    .storage
                    .add_object(&object_id, &event.id.to_hex())
                    .await
                {
                    warn!("storing object mapping for {object_id}: {e}");
                }
                bridge.federator.federate(&create).await?;
            }
            Kind::EventDeletion => {
                for target in event_tag_ids(event) {
                    let Some(foreign) = self.foreign_id_for(&target).await else {
                        continue;
                    };
                    let delete = to_apub::delete_activity(config, event, &foreign)?;
                    bridge.federator.federate(&delete).await?;
                    if let Err(e) = bridge
                        .storage
                        .delete_object(foreign.as_str(), &target)
                        .await
                    {
                        warn!("dropping object mapping for {foreign}: {e}");
                    }
                }
            }
            Kind::Repost => {
                let Some(target) = event_tag_ids(event).into_iter().next() else {
                    return Ok(());
                };
                if let Some(foreign) = self.foreign_id_for(&target).await {
                    let announce = to_apub::announce_activity(config, event, &foreign)?;
                    bridge.federator.federate(&announce).await?;
                }
            }
            Kind::Reaction => {
                let Some(target) = event_tag_ids(event).into_iter().last() else {
                    return Ok(());
                };
                if let Some(foreign) = self.foreign_id_for(&target).await {
                    let reaction = to_apub::reaction_activity(config, event, &foreign)?;
                    bridge.federator.federate(&reaction).await?;
                }
            }
            Kind::ZapReceipt => {
                let target = match event_tag_ids(event).into_iter().next() {
                    Some(id) => self.foreign_id_for(&id).await,
                    None => None,
                };
                let zap = to_apub::zap_activity(config, event, target.as_ref())?;
                bridge.federator.federate(&zap).await?;
            }
            Kind::RelayList => {
                self.reconcile_relays(event).await;
            }
            Kind::LongFormTextNote => {
                let refs = event_refs(event);
                let outbound = to_apub::OutboundRefs {
                    in_reply_to: match &refs.reply {
                        Some(id) => self.foreign_id_for(id).await,
                        None => None,
                    },
                    ..Default::default()
                };
                let article = to_apub::article_from_event(config, event, outbound)?;
                let object_id = article.id.to_string();
                let create = to_apub::create_activity(config, article)?;
                if let Err(e) = bridge
                    .storage
                    .add_object(&object_id, &event.id.to_hex())
                    .await
                {
                    warn!("storing object mapping for {object_id}: {e}");
                }
                bridge.federator.federate(&create).await?;
            }
            kind if kind == Kind::Custom(1068) => {
                let question = to_apub::question_from_event(config, event)?;
                let object_id = question.id.to_string();
                let create = to_apub::create_activity(config, question)?;
                if let Err(e) = bridge
                    .storage
                    .add_object(&object_id, &event.id.to_hex())
                    .await
                {
                    warn!("storing object mapping for {object_id}: {e}");
                }
                bridge.federator.federate(&create).await?;
            }
            other => {
                debug!("no federation mapping for kind {}", other.as_u16());
            }
        }
        Ok(())
    }

    /// Federated object id behind a native event id.
    ///
    /// Locally produced objects need no lookup; their url is derived from
    /// the event id alone.
    async fn foreign_id_for(&self, native_id: &str) -> Option<Url> {
        match self.bridge.storage.get_foreign_id_for(native_id).await {
            Ok(Some(foreign)) => Url::parse(&foreign).ok(),
            Ok(None) => None,
            Err(e) => {
                warn!("object lookup for {native_id}: {e}");
                None
            }
        }
    }

    /// Actor urls and handles for the event's `p` tags, where known.
    async fn resolve_mentions(&self, event: &Event) -> Vec<(Url, String)> {
        let mut mentions = Vec::new();
        for tag in event.tags.iter() {
            let values = tag.as_slice();
            if values.first().map(String::as_str) != Some("p") {
                continue;
            }
            let Some(pubkey) = values.get(1) else { continue };
            let actor_url = match self.bridge.storage.get_actor_for_key(pubkey).await {
                Ok(Some(url)) => url,
                _ => continue,
            };
            let Ok(url) = Url::parse(&actor_url) else {
                continue;
            };
            let handle = match self.bridge.fetcher.fetch_actor(&url).await {
                Ok(actor) => actor.handle().map(|h| format!("@{h}")),
                Err(_) => None,
            };
            let handle = handle.unwrap_or_else(|| url.to_string());
            mentions.push((url, handle));
        }
        mentions
    }

    /// A relay-list event replaces the manager's active set and persists it.
    async fn reconcile_relays(&self, event: &Event) {
        let relays: Vec<String> = event
            .tags
            .iter()
            .filter_map(|tag| {
                let values = tag.as_slice();
                if values.first().map(String::as_str) == Some("r") {
                    values.get(1).cloned()
                } else {
                    None
                }
            })
            .collect();
        if relays.is_empty() {
            return;
        }
        self.bridge.relays.reconcile(&relays).await;
        if let Err(e) = self
            .bridge
            .storage
            .set_kv("nostr_relays", &relays.join(","))
            .await
        {
            warn!("persisting relay list: {e}");
        }
    }
}

fn event_tag_ids(event: &Event) -> Vec<String> {
    event
        .tags
        .iter()
        .filter_map(|tag| {
            let values = tag.as_slice();
            if values.first().map(String::as_str) == Some("e") {
                values.get(1).cloned()
            } else {
                None
            }
        })
        .collect()
}

#[async_trait]
impl EventSink for EventHandler {
    async fn handle_event(&self, event: Event) {
        if let Err(e) = self.process(&event).await {
            warn!("handling event {} failed: {e}", event.id);
        }
    }
}
