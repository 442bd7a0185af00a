//! Actor documents: remote people and the local bridged operator

use crate::apub::{
    helpers::{deserialize_icon, deserialize_lossy_vec},
    object::TagItem,
    ProxyOf,
};
use serde::{Deserialize, Serialize};
use url::Url;

/// Public key of actors which is used for HTTP signatures.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PublicKey {
    /// Id of this key, `{owner}#main-key`
    pub id: String,
    /// ID of the actor that this public key belongs to
    pub owner: Url,
    /// The actual public key in PEM format
    pub public_key_pem: String,
}

impl PublicKey {
    /// Create a new [PublicKey] struct for the `owner` with `public_key_pem`.
    pub fn new(owner: Url, public_key_pem: String) -> Self {
        let id = main_key_id(&owner);
        PublicKey {
            id,
            owner,
            public_key_pem,
        }
    }
}

/// Standard key id used in the `keyId` of outbound signatures.
pub fn main_key_id(owner: &Url) -> String {
    format!("{}#main-key", &owner)
}

/// Actor-level endpoints. Only the shared inbox matters to us.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Endpoints {
    /// Server-wide inbox accepting deliveries for all local actors
    #[serde(skip_serializing_if = "Option::is_none")]
    pub shared_inbox: Option<Url>,
}

/// An avatar or banner image.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Image {
    #[serde(rename = "type", default = "image_type")]
    pub kind: String,
    pub url: Url,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub media_type: Option<String>,
}

impl Image {
    /// Plain image reference.
    pub fn new(url: Url) -> Self {
        Image {
            kind: image_type(),
            url,
            media_type: None,
        }
    }
}

fn image_type() -> String {
    "Image".to_string()
}

/// A fediverse actor document: the operator as seen by remote servers, or a
/// remote person as fetched from their server.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ActorDoc {
    pub id: Url,
    /// `Person` for people, `Service`/`Application` for automated actors
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub preferred_username: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    pub inbox: Url,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub outbox: Option<Url>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub followers: Option<Url>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub following: Option<Url>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoints: Option<Endpoints>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub public_key: Option<PublicKey>,
    /// Avatar
    #[serde(default, deserialize_with = "deserialize_icon", skip_serializing_if = "Option::is_none")]
    pub icon: Option<Image>,
    /// Banner
    #[serde(default, deserialize_with = "deserialize_icon", skip_serializing_if = "Option::is_none")]
    pub image: Option<Image>,
    #[serde(default, deserialize_with = "deserialize_lossy_vec", skip_serializing_if = "Vec::is_empty")]
    pub tag: Vec<TagItem>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub published: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub proxy_of: Option<ProxyOf>,
}

impl ActorDoc {
    /// Delivery target for this actor: shared inbox when advertised,
    /// personal inbox otherwise.
    pub fn shared_inbox_or_inbox(&self) -> Url {
        self.endpoints
            .as_ref()
            .and_then(|e| e.shared_inbox.clone())
            .unwrap_or_else(|| self.inbox.clone())
    }

    /// `user@host` handle of this actor, when it advertises a username.
    pub fn handle(&self) -> Option<String> {
        let username = self.preferred_username.as_ref()?;
        let host = self.id.host_str()?;
        Some(format!("{username}@{host}"))
    }
}
