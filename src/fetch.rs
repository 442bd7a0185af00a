//! Fetching and caching remote documents, handle resolution, and signed
//! delivery
//!
//! Every outbound HTTP request in the bridge goes through here: actor and
//! object fetches with a shared TTL cache, webfinger lookups with their own
//! cache keyed by lowercase `user@host`, and signed inbox deliveries.

use crate::{
    apub::{actor::ActorDoc, FEDERATION_CONTENT_TYPE},
    config::BridgeConfig,
    error::Error,
    httpsig::sign_request_headers,
};
use moka::future::Cache;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::{sync::Arc, time::Duration};
use tracing::{debug, info};
use url::Url;

/// How long fetched remote documents and resolved handles stay cached.
const REMOTE_CACHE_TTL: Duration = Duration::from_secs(60 * 60);

/// Shared HTTP side of the bridge.
pub struct Fetcher {
    config: Arc<BridgeConfig>,
    client: reqwest::Client,
    objects: Cache<String, Arc<Value>>,
    handles: Cache<String, Url>,
}

impl Fetcher {
    /// Build the fetcher with its caches.
    pub fn new(config: Arc<BridgeConfig>) -> Self {
        Fetcher {
            config,
            client: reqwest::Client::new(),
            objects: Cache::builder()
                .max_capacity(10_000)
                .time_to_live(REMOTE_CACHE_TTL)
                .build(),
            handles: Cache::builder()
                .max_capacity(10_000)
                .time_to_live(REMOTE_CACHE_TTL)
                .build(),
        }
    }

    /// Fetch a remote document with the Activitypub accept header, through
    /// the cache. A 410 response maps to [Error::Gone] so callers can treat
    /// deleted actors specially.
    pub async fn fetch_object(&self, url: &Url) -> Result<Arc<Value>, Error> {
        if let Some(cached) = self.objects.get(url.as_str()).await {
            return Ok(cached);
        }
        let value = Arc::new(self.fetch_uncached(url).await?);
        self.objects.insert(url.to_string(), value.clone()).await;
        Ok(value)
    }

    async fn fetch_uncached(&self, url: &Url) -> Result<Value, Error> {
        info!("Fetching remote object {url}");
        let response = self
            .client
            .get(url.as_str())
            .header("Accept", FEDERATION_CONTENT_TYPE)
            .timeout(self.config.fetch_timeout)
            .send()
            .await?;
        if response.status() == StatusCode::GONE {
            return Err(Error::Gone);
        }
        if !response.status().is_success() {
            return Err(Error::Other(format!(
                "fetching {url} returned {}",
                response.status()
            )));
        }
        Ok(response.json().await?)
    }

    /// Fetch and parse a remote actor document.
    pub async fn fetch_actor(&self, url: &Url) -> Result<ActorDoc, Error> {
        let raw = self.fetch_object(url).await?;
        serde_json::from_value(Value::clone(&raw)).map_err(Error::MalformedActivity)
    }

    /// Drop a document from the cache, forcing the next fetch to go out.
    pub async fn invalidate(&self, url: &Url) {
        self.objects.invalidate(url.as_str()).await;
    }

    /// Resolve `user@host` to an actor url via webfinger, cached.
    pub async fn resolve_handle(&self, handle: &str) -> Result<Url, Error> {
        let key = handle.trim_start_matches('@').to_lowercase();
        if let Some(cached) = self.handles.get(&key).await {
            return Ok(cached);
        }

        let (user, host) = key.split_once('@').ok_or(Error::WebfingerResolveFailed)?;
        let fetch_url =
            format!("https://{host}/.well-known/webfinger?resource=acct:{user}@{host}");
        debug!("Fetching webfinger url: {}", &fetch_url);
        let jrd: Webfinger = self
            .client
            .get(&fetch_url)
            .header("Accept", "application/jrd+json")
            .timeout(self.config.fetch_timeout)
            .send()
            .await?
            .json()
            .await?;

        let actor_url = select_self_link(&jrd).ok_or(Error::WebfingerResolveFailed)?;
        self.handles.insert(key, actor_url.clone()).await;
        Ok(actor_url)
    }

    /// Deliver an activity to one inbox with an HTTP signature. Non-2xx
    /// responses are failures.
    pub async fn deliver(&self, body: &[u8], inbox: &Url, key_id: &str) -> Result<(), Error> {
        let private_key = self.config.keypair.rsa_private_key()?;
        let headers = sign_request_headers("POST", inbox, body, key_id, &private_key)?;

        let mut request = self
            .client
            .post(inbox.as_str())
            .header("Content-Type", FEDERATION_CONTENT_TYPE)
            .timeout(self.config.fetch_timeout)
            .body(body.to_vec());
        for (name, value) in headers {
            request = request.header(name, value);
        }

        let response = request.send().await?;
        if !response.status().is_success() {
            return Err(Error::Other(format!(
                "delivery to {inbox} returned {}",
                response.status()
            )));
        }
        debug!("Delivered activity to {inbox}");
        Ok(())
    }
}

/// A webfinger response describing an actor.
#[derive(Serialize, Deserialize, Debug, Default)]
pub struct Webfinger {
    /// The actor which is described here, for example `acct:alice@mastodon.example`
    pub subject: String,
    /// Links where further data about `subject` can be retrieved
    #[serde(default)]
    pub links: Vec<WebfingerLink>,
    /// Other urls which identify the same actor as the `subject`
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub aliases: Vec<Url>,
}

/// A single link included as part of a [Webfinger] response.
#[derive(Serialize, Deserialize, Debug, Default)]
pub struct WebfingerLink {
    /// Relationship of the link, such as `self`
    pub rel: Option<String>,
    /// Media type of the target resource
    #[serde(rename = "type")]
    pub kind: Option<String>,
    /// Url pointing to the target resource
    pub href: Option<Url>,
}

/// Pick the `self` link pointing at the Activitypub representation.
///
/// Accepts `application/activity+json` and the ActivityStreams-profile
/// `ld+json` variant, case-insensitively and with whitespace tolerance
/// around the parameter.
pub fn select_self_link(jrd: &Webfinger) -> Option<Url> {
    jrd.links
        .iter()
        .filter(|link| link.rel.as_deref() == Some("self"))
        .filter(|link| {
            link.kind
                .as_deref()
                .is_some_and(is_activitypub_media_type)
        })
        .find_map(|link| link.href.clone())
}

fn is_activitypub_media_type(raw: &str) -> bool {
    let normalized: String = raw
        .chars()
        .filter(|c| !c.is_whitespace())
        .collect::<String>()
        .to_lowercase();
    normalized == "application/activity+json"
        || (normalized.starts_with("application/ld+json")
            && normalized.contains("profile=\"https://www.w3.org/ns/activitystreams\""))
}

/// Build the webfinger response served for the local actor.
pub fn build_webfinger_response(subject: String, url: Url) -> Webfinger {
    Webfinger {
        subject,
        links: vec![
            WebfingerLink {
                rel: Some("http://webfinger.net/rel/profile-page".to_string()),
                kind: Some("text/html".to_string()),
                href: Some(url.clone()),
            },
            WebfingerLink {
                rel: Some("self".to_string()),
                kind: Some(FEDERATION_CONTENT_TYPE.to_string()),
                href: Some(url),
            },
        ],
        aliases: vec![],
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_select_self_link_plain() {
        let jrd: Webfinger = serde_json::from_str(
            r#"{
                "subject": "acct:alice@mastodon.example",
                "links": [
                    {"rel": "http://webfinger.net/rel/profile-page", "type": "text/html", "href": "https://mastodon.example/@alice"},
                    {"rel": "self", "type": "application/activity+json", "href": "https://mastodon.example/users/alice"}
                ]
            }"#,
        )
        .unwrap();
        assert_eq!(
            select_self_link(&jrd).unwrap().as_str(),
            "https://mastodon.example/users/alice"
        );
    }

    #[test]
    fn test_select_self_link_ld_json_variant() {
        let jrd: Webfinger = serde_json::from_str(
            r#"{
                "subject": "acct:bob@pleroma.example",
                "links": [
                    {"rel": "self", "type": "application/ld+json; profile=\"https://www.w3.org/ns/activitystreams\"", "href": "https://pleroma.example/users/bob"}
                ]
            }"#,
        )
        .unwrap();
        assert_eq!(
            select_self_link(&jrd).unwrap().as_str(),
            "https://pleroma.example/users/bob"
        );
    }

    #[test]
    fn test_media_type_matching_is_tolerant() {
        assert!(is_activitypub_media_type("Application/Activity+JSON"));
        assert!(is_activitypub_media_type(
            "application/ld+json ;  profile=\"https://www.w3.org/ns/activitystreams\""
        ));
        assert!(!is_activitypub_media_type("text/html"));
    }

    #[test]
    fn test_no_self_link() {
        let jrd: Webfinger = serde_json::from_str(
            r#"{"subject": "acct:x@y.example", "links": [{"rel": "self", "type": "text/html", "href": "https://y.example/x"}]}"#,
        )
        .unwrap();
        assert!(select_self_link(&jrd).is_none());
    }

    #[test]
    fn test_webfinger_response_shape() {
        let response = build_webfinger_response(
            "acct:operator@bridge.example".to_string(),
            Url::parse("https://bridge.example/users/operator").unwrap(),
        );
        let self_link = select_self_link(&response).unwrap();
        assert_eq!(self_link.as_str(), "https://bridge.example/users/operator");
    }
}
