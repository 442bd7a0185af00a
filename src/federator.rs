//! Fan-out of outbound activities to remote inboxes

use crate::{
    apub::{activity::Activity, actor::main_key_id, context::WithContext, PUBLIC},
    config::BridgeConfig,
    error::Error,
    fetch::Fetcher,
    storage::Storage,
};
use futures::StreamExt;
use itertools::Itertools;
use std::{collections::HashSet, sync::Arc};
use tracing::{debug, info, warn};
use url::Url;

/// Outcome counts of one fan-out. Per-inbox failures are logged, not fatal.
#[derive(Debug, Default, Clone, Copy)]
pub struct DeliveryReport {
    pub delivered: usize,
    pub failed: usize,
}

/// Expands recipients, resolves inboxes and delivers signed activities.
pub struct Federator {
    config: Arc<BridgeConfig>,
    fetcher: Arc<Fetcher>,
    storage: Arc<dyn Storage>,
    /// Identity whose follower list backs the followers collection
    operator_id: String,
}

impl Federator {
    pub fn new(
        config: Arc<BridgeConfig>,
        fetcher: Arc<Fetcher>,
        storage: Arc<dyn Storage>,
        operator_id: String,
    ) -> Self {
        Federator {
            config,
            fetcher,
            storage,
            operator_id,
        }
    }

    /// Deliver an activity to every expanded recipient.
    pub async fn federate(&self, activity: &Activity) -> Result<DeliveryReport, Error> {
        let recipients = self.expand_recipients(activity).await?;
        if recipients.is_empty() {
            debug!("activity {} has no remote recipients", activity.id);
            return Ok(DeliveryReport::default());
        }

        let inboxes = self.resolve_inboxes(recipients).await;
        let body = serde_json::to_vec(&WithContext::new_default(activity))
            .map_err(Error::MalformedActivity)?;
        let key_id = main_key_id(&activity.actor);

        let results: Vec<Result<(), Error>> = futures::stream::iter(inboxes)
            .map(|inbox| {
                let body = body.as_slice();
                let key_id = key_id.as_str();
                async move {
                    let result = self.fetcher.deliver(body, &inbox, key_id).await;
                    if let Err(e) = &result {
                        warn!("delivery to {inbox} failed: {e}");
                    }
                    result
                }
            })
            .buffer_unordered(self.config.federation_concurrency)
            .collect()
            .await;

        let delivered = results.iter().filter(|r| r.is_ok()).count();
        let report = DeliveryReport {
            delivered,
            failed: results.len() - delivered,
        };
        info!(
            "federated {} to {} inboxes ({} failed)",
            activity.id, report.delivered, report.failed
        );
        Ok(report)
    }

    /// Collect `to` and `cc`, expanding the followers collection into the
    /// actual follower list and dropping the public pseudo-address and our
    /// own urls.
    async fn expand_recipients(&self, activity: &Activity) -> Result<Vec<Url>, Error> {
        let followers_url = self.config.followers_url().to_string();
        let mut recipients: Vec<Url> = Vec::new();
        for address in activity.to.iter().chain(activity.cc.iter()).unique() {
            if address == PUBLIC {
                continue;
            }
            if *address == followers_url {
                for follower in self.storage.get_ap_followers(&self.operator_id).await? {
                    if let Ok(url) = Url::parse(&follower) {
                        recipients.push(url);
                    }
                }
                continue;
            }
            if let Ok(url) = Url::parse(address) {
                recipients.push(url);
            }
        }
        recipients.retain(|url| !self.config.is_local_url(url));
        Ok(recipients.into_iter().unique().collect())
    }

    /// Fetch every recipient actor concurrently and collapse their inboxes.
    async fn resolve_inboxes(&self, recipients: Vec<Url>) -> Vec<Url> {
        let resolved: Vec<Option<(Url, bool)>> = futures::stream::iter(recipients)
            .map(|actor_url| async move {
                match self.fetcher.fetch_actor(&actor_url).await {
                    Ok(actor) => {
                        let shared = actor
                            .endpoints
                            .as_ref()
                            .and_then(|e| e.shared_inbox.as_ref())
                            .is_some();
                        Some((actor.shared_inbox_or_inbox(), shared))
                    }
                    Err(e) => {
                        debug!("cannot resolve inbox of {actor_url}: {e}");
                        None
                    }
                }
            })
            .buffer_unordered(self.config.federation_concurrency)
            .collect()
            .await;

        dedup_inboxes(resolved.into_iter().flatten().collect())
    }
}

/// One delivery per shared-inbox origin; personal inboxes dedup by full url.
pub(crate) fn dedup_inboxes(inboxes: Vec<(Url, bool)>) -> Vec<Url> {
    let mut seen: HashSet<String> = HashSet::new();
    let mut result = Vec::new();
    for (inbox, shared) in inboxes {
        let key = if shared {
            inbox.host_str().unwrap_or_default().to_string()
        } else {
            inbox.to_string()
        };
        if seen.insert(key) {
            result.push(inbox);
        }
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{config::tests::test_config, storage::memory::MemoryStorage};

    fn url(s: &str) -> Url {
        Url::parse(s).unwrap()
    }

    #[test]
    fn test_dedup_shared_by_origin() {
        let inboxes = vec![
            (url("https://mastodon.example/inbox"), true),
            (url("https://mastodon.example/inbox"), true),
            (url("https://mastodon.example/other-inbox"), true),
            (url("https://pleroma.example/users/bob/inbox"), false),
            (url("https://pleroma.example/users/carol/inbox"), false),
            (url("https://pleroma.example/users/bob/inbox"), false),
        ];
        let deduped = dedup_inboxes(inboxes);
        // one delivery per shared origin, one per distinct personal inbox
        assert_eq!(
            deduped,
            vec![
                url("https://mastodon.example/inbox"),
                url("https://pleroma.example/users/bob/inbox"),
                url("https://pleroma.example/users/carol/inbox"),
            ]
        );
    }

    #[tokio::test]
    async fn test_expand_recipients_followers_collection() {
        let config = Arc::new(test_config());
        let storage = Arc::new(MemoryStorage::new());
        storage
            .add_follow("https://mastodon.example/users/alice", "operatorpubkey")
            .await
            .unwrap();
        storage
            .add_follow("https://pleroma.example/users/bob", "operatorpubkey")
            .await
            .unwrap();
        // native and third-network followers have no fediverse inbox
        storage.add_follow("deadbeef", "operatorpubkey").await.unwrap();

        let federator = Federator::new(
            config.clone(),
            Arc::new(Fetcher::new(config.clone())),
            storage,
            "operatorpubkey".to_string(),
        );

        let mut activity = Activity::new(
            "Create",
            url("https://bridge.example/objects/x#create"),
            config.actor_url(),
            serde_json::Value::Null,
        );
        activity.to = vec![PUBLIC.to_string()];
        activity.cc = vec![config.followers_url().to_string()];

        let mut recipients = federator.expand_recipients(&activity).await.unwrap();
        recipients.sort_by_key(ToString::to_string);
        assert_eq!(
            recipients,
            vec![
                url("https://mastodon.example/users/alice"),
                url("https://pleroma.example/users/bob"),
            ]
        );
    }

    #[tokio::test]
    async fn test_direct_recipients_and_local_skip() {
        let config = Arc::new(test_config());
        let federator = Federator::new(
            config.clone(),
            Arc::new(Fetcher::new(config.clone())),
            Arc::new(MemoryStorage::new()),
            "operatorpubkey".to_string(),
        );

        let mut activity = Activity::new(
            "Accept",
            url("https://bridge.example/activities/1"),
            config.actor_url(),
            serde_json::Value::Null,
        );
        activity.to = vec![
            "https://mastodon.example/users/alice".to_string(),
            // our own urls never become recipients
            "https://bridge.example/users/operator".to_string(),
            "https://mastodon.example/users/alice".to_string(),
        ];

        let recipients = federator.expand_recipients(&activity).await.unwrap();
        assert_eq!(
            recipients,
            vec![url("https://mastodon.example/users/alice")]
        );
    }
}
