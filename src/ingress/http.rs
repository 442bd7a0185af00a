//! Discovery and document endpoints

use crate::{
    apub::{actor::ActorDoc, actor::PublicKey as ApubPublicKey, context::WithContext,
        FEDERATION_CONTENT_TYPE},
    error::Error,
    fetch::build_webfinger_response,
    ingress::AppState,
    transmute::to_apub,
};
use axum::{
    extract::{Path, Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::debug;

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let status = match &self {
            Error::NotFound => StatusCode::NOT_FOUND,
            Error::Gone => StatusCode::GONE,
            Error::MalformedActivity(_) => StatusCode::BAD_REQUEST,
            Error::WebfingerResolveFailed => StatusCode::NOT_FOUND,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, self.to_string()).into_response()
    }
}

/// Json response carrying the Activitypub content type.
pub struct ApubJson<T>(pub T);

impl<T: Serialize> IntoResponse for ApubJson<T> {
    fn into_response(self) -> Response {
        match serde_json::to_vec(&self.0) {
            Ok(body) => (
                [(header::CONTENT_TYPE, FEDERATION_CONTENT_TYPE)],
                body,
            )
                .into_response(),
            Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
        }
    }
}

#[derive(Deserialize)]
pub struct WebfingerQuery {
    resource: String,
}

pub async fn webfinger(
    Query(query): Query<WebfingerQuery>,
    State(state): State<Arc<AppState>>,
) -> Result<Json<crate::fetch::Webfinger>, Error> {
    let config = &state.bridge.config;
    let expected = format!("acct:{}@{}", config.username, config.domain());
    let normalized = query.resource.to_lowercase();
    if normalized != expected.to_lowercase() {
        return Err(Error::NotFound);
    }
    Ok(Json(build_webfinger_response(expected, config.actor_url())))
}

pub async fn nodeinfo_index(State(state): State<Arc<AppState>>) -> Json<Value> {
    let base = &state.bridge.config.local_url;
    Json(json!({
        "links": [
            {
                "rel": "http://nodeinfo.diaspora.software/ns/schema/2.0",
                "href": format!("{base}nodeinfo/2.0"),
            },
            {
                "rel": "http://nodeinfo.diaspora.software/ns/schema/2.1",
                "href": format!("{base}nodeinfo/2.1"),
            }
        ]
    }))
}

pub async fn nodeinfo(
    Path(version): Path<String>,
    State(state): State<Arc<AppState>>,
) -> Result<Json<Value>, Error> {
    if version != "2.0" && version != "2.1" {
        return Err(Error::NotFound);
    }
    let local_prefix = state.bridge.config.local_url.to_string();
    let posts = state
        .bridge
        .storage
        .get_local_object_count(&local_prefix)
        .await
        .unwrap_or(0);
    Ok(Json(json!({
        "version": version,
        "software": {
            "name": env!("CARGO_PKG_NAME"),
            "version": env!("CARGO_PKG_VERSION"),
        },
        "protocols": ["activitypub"],
        "services": {"inbound": [], "outbound": []},
        "openRegistrations": false,
        "usage": {
            "users": {"total": 1},
            "localPosts": posts,
        },
        "metadata": {},
    })))
}

#[derive(Deserialize)]
pub struct NostrJsonQuery {
    name: Option<String>,
}

/// `/.well-known/nostr.json`: NIP-05 names.
///
/// The operator's own name answers with the operator's real key. Names of
/// the form `user_at_host` resolve the fediverse handle `user@host`, derive
/// its stable key, persist the reverse index and answer with the derived
/// key.
pub async fn nostr_json(
    Query(query): Query<NostrJsonQuery>,
    State(state): State<Arc<AppState>>,
) -> Result<Json<Value>, Error> {
    let Some(name) = query.name.map(|n| n.to_lowercase()) else {
        return Err(Error::NotFound);
    };
    let bridge = &state.bridge;

    if name == bridge.config.username.to_lowercase() {
        return Ok(Json(json!({
            "names": {name: bridge.operator_id()}
        })));
    }

    let Some((user, host)) = name.split_once("_at_") else {
        return Err(Error::NotFound);
    };
    let handle = format!("{user}@{host}");
    let actor_url = bridge.fetcher.resolve_handle(&handle).await?;
    let pubkey = bridge.signer.public_key_for(actor_url.as_str())?;
    if let Err(e) = bridge
        .storage
        .store_actor_key(&pubkey.to_hex(), actor_url.as_str())
        .await
    {
        debug!("persisting nip05 mapping for {handle}: {e}");
    }
    Ok(Json(json!({
        "names": {name: pubkey.to_hex()}
    })))
}

async fn local_actor(state: &AppState) -> Result<ActorDoc, Error> {
    let metadata: Option<Value> = state
        .bridge
        .storage
        .get_kv("profile_metadata")
        .await?
        .and_then(|raw| serde_json::from_str(&raw).ok());
    to_apub::local_actor_doc(
        &state.bridge.config,
        metadata.as_ref(),
        &state.bridge.signer.public_key(),
    )
}

pub async fn actor(
    Path(user): Path<String>,
    State(state): State<Arc<AppState>>,
) -> Result<ApubJson<WithContext<ActorDoc>>, Error> {
    if user != state.bridge.config.username {
        return Err(Error::NotFound);
    }
    let doc = local_actor(&state).await?;
    Ok(ApubJson(WithContext::new_default(doc)))
}

/// Instance service actor, the signing identity offered for actor-less
/// signature challenges.
pub async fn service_actor(
    State(state): State<Arc<AppState>>,
) -> Result<ApubJson<WithContext<Value>>, Error> {
    let config = &state.bridge.config;
    let id = config.service_actor_url();
    let key = ApubPublicKey::new(id.clone(), config.keypair.public_key.clone());
    Ok(ApubJson(WithContext::new_default(json!({
        "id": id,
        "type": "Application",
        "preferredUsername": config.domain(),
        "inbox": format!("{}inbox", config.local_url),
        "publicKey": key,
    }))))
}

pub async fn followers(
    Path(user): Path<String>,
    State(state): State<Arc<AppState>>,
) -> Result<ApubJson<WithContext<Value>>, Error> {
    if user != state.bridge.config.username {
        return Err(Error::NotFound);
    }
    let followers = state
        .bridge
        .storage
        .get_ap_followers(&state.bridge.operator_id())
        .await?;
    Ok(ApubJson(WithContext::new_default(json!({
        "id": state.bridge.config.followers_url(),
        "type": "OrderedCollection",
        "totalItems": followers.len(),
        "orderedItems": followers,
    }))))
}

pub async fn following(
    Path(user): Path<String>,
    State(state): State<Arc<AppState>>,
) -> Result<ApubJson<WithContext<Value>>, Error> {
    if user != state.bridge.config.username {
        return Err(Error::NotFound);
    }
    let following = state
        .bridge
        .storage
        .get_ap_following(&state.bridge.operator_id())
        .await?;
    Ok(ApubJson(WithContext::new_default(json!({
        "id": format!("{}users/{}/following", state.bridge.config.local_url, user),
        "type": "OrderedCollection",
        "totalItems": following.len(),
        "orderedItems": following,
    }))))
}

pub async fn outbox(
    Path(user): Path<String>,
    State(state): State<Arc<AppState>>,
) -> Result<ApubJson<WithContext<Value>>, Error> {
    if user != state.bridge.config.username {
        return Err(Error::NotFound);
    }
    let local_prefix = state.bridge.config.local_url.to_string();
    let storage = &state.bridge.storage;
    let total = storage.get_local_object_count(&local_prefix).await?;
    let recent = storage.get_recent_local_objects(&local_prefix, 20).await?;
    let id = format!("{}users/{user}/outbox", state.bridge.config.local_url);
    Ok(ApubJson(WithContext::new_default(json!({
        "id": id,
        "type": "OrderedCollection",
        "totalItems": total,
        "first": {
            "id": format!("{id}?page=1"),
            "type": "OrderedCollectionPage",
            "partOf": id,
            "orderedItems": recent,
        },
    }))))
}

/// Stub object document for a bridged-out event. The event itself lives on
/// the relays; this gives remote servers something dereferenceable.
pub async fn object(
    Path(id): Path<String>,
    State(state): State<Arc<AppState>>,
) -> Result<ApubJson<WithContext<Value>>, Error> {
    let config = &state.bridge.config;
    let object_url = config.object_url(&id);
    // only objects we have bridged resolve
    if state
        .bridge
        .storage
        .get_native_id_for(object_url.as_str())
        .await?
        .is_none()
    {
        return Err(Error::NotFound);
    }
    Ok(ApubJson(WithContext::new_default(json!({
        "id": object_url,
        "type": "Note",
        "attributedTo": config.actor_url(),
        "to": [crate::apub::PUBLIC],
    }))))
}

pub async fn tag(
    Path(tag): Path<String>,
    State(state): State<Arc<AppState>>,
) -> ApubJson<WithContext<Value>> {
    ApubJson(WithContext::new_default(json!({
        "id": state.bridge.config.tag_url(&tag),
        "type": "OrderedCollection",
        "totalItems": 0,
        "orderedItems": [],
    })))
}
