//! Third-network (AT-protocol style) session handling and notification
//! mirroring
//!
//! The HTTP client for the third network is an external collaborator behind
//! [ThirdNetworkClient]; this module owns what the bridge core needs from
//! it: serialized session refresh, back-off on rate limits, and the mapping
//! from notifications to native events.

use crate::{
    error::Error,
    handlers::Bridge,
    storage::THIRD_NETWORK_PREFIX,
    transmute::build_tag,
};
use async_trait::async_trait;
use nostr::{EventBuilder, Kind};
use serde::Deserialize;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

/// Access and refresh tokens of one session.
#[derive(Clone, Debug, Deserialize)]
pub struct SessionTokens {
    pub access: String,
    pub refresh: String,
}

/// What kind of interaction a notification reports.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NotificationKind {
    Like,
    Repost,
    Reply,
}

/// One notification from the third network.
#[derive(Clone, Debug, Deserialize)]
pub struct Notification {
    pub kind: NotificationKind,
    /// Stable id of the acting account, e.g. `did:plc:…`
    pub author: String,
    /// Uri of the subject record
    pub subject: String,
    /// Reply text, when `kind` is a reply
    #[serde(default)]
    pub text: Option<String>,
}

/// The operations the bridge consumes from the third-network client.
#[async_trait]
pub trait ThirdNetworkClient: Send + Sync {
    async fn create_session(&self) -> Result<SessionTokens, Error>;
    async fn refresh_session(&self, refresh_token: &str) -> Result<SessionTokens, Error>;
    /// May fail with [Error::Unauthorized] or [Error::RateLimited].
    async fn list_notifications(&self, access_token: &str) -> Result<Vec<Notification>, Error>;
}

/// Session tokens with single-flight refresh.
///
/// Concurrent 401s race to refresh; the mutex serializes them and the
/// stale-token compare lets every loser reuse the winner's fresh token
/// instead of refreshing again.
pub struct SessionManager {
    client: Arc<dyn ThirdNetworkClient>,
    tokens: RwLock<Option<SessionTokens>>,
    refresh_gate: Mutex<()>,
}

impl SessionManager {
    pub fn new(client: Arc<dyn ThirdNetworkClient>) -> Self {
        SessionManager {
            client,
            tokens: RwLock::new(None),
            refresh_gate: Mutex::new(()),
        }
    }

    /// Current access token, creating the initial session when needed.
    pub async fn access_token(&self) -> Result<String, Error> {
        if let Some(tokens) = self.tokens.read().await.as_ref() {
            return Ok(tokens.access.clone());
        }
        let _gate = self.refresh_gate.lock().await;
        if let Some(tokens) = self.tokens.read().await.as_ref() {
            return Ok(tokens.access.clone());
        }
        let fresh = self.client.create_session().await?;
        let access = fresh.access.clone();
        *self.tokens.write().await = Some(fresh);
        Ok(access)
    }

    /// Exchange a rejected access token for a fresh one.
    pub async fn refresh_after_401(&self, stale_access: &str) -> Result<String, Error> {
        let _gate = self.refresh_gate.lock().await;
        if let Some(tokens) = self.tokens.read().await.as_ref() {
            if tokens.access != stale_access {
                // someone else already refreshed while we queued
                return Ok(tokens.access.clone());
            }
        }
        let refresh_token = self
            .tokens
            .read()
            .await
            .as_ref()
            .map(|t| t.refresh.clone());
        let fresh = match refresh_token {
            Some(token) => match self.client.refresh_session(&token).await {
                Ok(fresh) => fresh,
                Err(_) => self.client.create_session().await?,
            },
            None => self.client.create_session().await?,
        };
        let access = fresh.access.clone();
        *self.tokens.write().await = Some(fresh);
        Ok(access)
    }
}

/// Poll notifications and mirror interactions by followed parties.
pub struct NotificationPoller {
    bridge: Arc<Bridge>,
    session: SessionManager,
    client: Arc<dyn ThirdNetworkClient>,
}

impl NotificationPoller {
    pub fn new(bridge: Arc<Bridge>, client: Arc<dyn ThirdNetworkClient>) -> Self {
        NotificationPoller {
            bridge,
            session: SessionManager::new(Arc::clone(&client)),
            client,
        }
    }

    /// One polling round. Returns how long to wait before the next one when
    /// the server asked us to back off.
    pub async fn poll_once(&self) -> Result<Option<u64>, Error> {
        let access = self.session.access_token().await?;
        let notifications = match self.client.list_notifications(&access).await {
            Ok(list) => list,
            Err(Error::Unauthorized) => {
                let refreshed = self.session.refresh_after_401(&access).await?;
                self.client.list_notifications(&refreshed).await?
            }
            Err(Error::RateLimited(seconds)) => {
                info!("third network rate limited us for {seconds}s");
                return Ok(Some(seconds));
            }
            Err(e) => return Err(e),
        };

        for notification in notifications {
            if let Err(e) = self.mirror(&notification).await {
                warn!("mirroring {:?} from {}: {e}", notification.kind, notification.author);
            }
        }
        Ok(None)
    }

    /// Only interactions from parties in the follow graph cross over.
    async fn mirror(&self, notification: &Notification) -> Result<(), Error> {
        let author_id = format!("{THIRD_NETWORK_PREFIX}{}", notification.author);
        let operator = self.bridge.operator_id();
        let follows = self
            .bridge
            .storage
            .get_following(&operator)
            .await?
            .contains(&author_id);
        if !follows {
            debug!("ignoring notification from unfollowed {author_id}");
            return Ok(());
        }

        let Some(native_target) = self
            .bridge
            .storage
            .get_native_id_for(&notification.subject)
            .await?
        else {
            debug!("subject {} has no native counterpart", notification.subject);
            return Ok(());
        };

        let builder = match notification.kind {
            NotificationKind::Like => EventBuilder::new(Kind::Reaction, "+", [
                proxy(&notification.subject)?,
                build_tag(&["e", &native_target])?,
            ]),
            NotificationKind::Repost => EventBuilder::new(Kind::Repost, "", [
                proxy(&notification.subject)?,
                build_tag(&["e", &native_target])?,
            ]),
            NotificationKind::Reply => {
                let text = notification.text.clone().unwrap_or_default();
                EventBuilder::new(Kind::TextNote, text, [
                    proxy(&notification.subject)?,
                    build_tag(&["e", &native_target, "", "reply"])?,
                ])
            }
        };
        let event = self
            .bridge
            .signer
            .sign_as_derived(builder, &author_id)?;
        self.bridge.relays.publish(event).await?;
        Ok(())
    }
}

fn proxy(subject: &str) -> Result<nostr::Tag, Error> {
    Ok(nostr::Tag::custom(
        nostr::TagKind::Custom("proxy".into()),
        [subject.to_string(), "atproto".to_string()],
    ))
}
