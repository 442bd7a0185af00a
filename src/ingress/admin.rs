//! Admin API under `/web`
//!
//! The dashboard itself is served elsewhere; these are the JSON endpoints it
//! calls. Everything is behind HTTP Basic auth compared in constant time,
//! and the whole surface is absent when no password is configured.

use crate::{error::Error, ingress::AppState};
use axum::{
    body::Body,
    extract::{Query, State},
    http::{header, Request, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use base64::{engine::general_purpose::STANDARD as Base64, Engine};
use serde::Deserialize;
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use std::{sync::Arc, time::Duration};

/// Timeout for the handle lookup test.
const HANDLE_TEST_TIMEOUT: Duration = Duration::from_secs(8);

pub fn router(state: Arc<AppState>) -> Router<Arc<AppState>> {
    Router::new()
        .route("/relays", get(list_relays).post(add_relay))
        .route("/relays/remove", post(remove_relay))
        .route("/relays/reset", post(reset_relay))
        .route("/status", get(status))
        .route("/handle", get(handle_test))
        .layer(middleware::from_fn_with_state(state, basic_auth))
}

/// Fixed-length digests make the comparison independent of where the
/// password differs.
fn digests_match(provided: &str, expected: &str) -> bool {
    let a = Sha256::digest(provided.as_bytes());
    let b = Sha256::digest(expected.as_bytes());
    a == b
}

async fn basic_auth(
    State(state): State<Arc<AppState>>,
    request: Request<Body>,
    next: Next,
) -> Response {
    let unauthorized = || {
        (
            StatusCode::UNAUTHORIZED,
            [(header::WWW_AUTHENTICATE, "Basic realm=\"causeway\"")],
        )
            .into_response()
    };
    let Some(expected) = state.bridge.config.web_admin.clone() else {
        return unauthorized();
    };
    let provided = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Basic "))
        .and_then(|v| Base64.decode(v).ok())
        .and_then(|decoded| String::from_utf8(decoded).ok())
        .and_then(|creds| creds.split_once(':').map(|(_, pass)| pass.to_string()));
    match provided {
        Some(password) if digests_match(&password, &expected) => next.run(request).await,
        _ => unauthorized(),
    }
}

async fn list_relays(State(state): State<Arc<AppState>>) -> Json<Value> {
    let states = state.bridge.relays.circuit_states().await;
    let relays: Vec<Value> = states
        .into_iter()
        .map(|(url, circuit, failures)| {
            json!({"url": url, "circuit": circuit, "failures": failures})
        })
        .collect();
    Json(json!({"relays": relays}))
}

#[derive(Deserialize)]
struct RelayRequest {
    url: String,
}

async fn add_relay(
    State(state): State<Arc<AppState>>,
    Json(request): Json<RelayRequest>,
) -> Result<StatusCode, Error> {
    if !request.url.starts_with("wss://") && !request.url.starts_with("ws://") {
        return Err(Error::Config(format!("not a relay url: {}", request.url)));
    }
    state.bridge.relays.add_relay(&request.url).await;
    persist_relays(&state).await;
    Ok(StatusCode::CREATED)
}

async fn remove_relay(
    State(state): State<Arc<AppState>>,
    Json(request): Json<RelayRequest>,
) -> StatusCode {
    state.bridge.relays.remove_relay(&request.url).await;
    persist_relays(&state).await;
    StatusCode::NO_CONTENT
}

async fn reset_relay(
    State(state): State<Arc<AppState>>,
    Json(request): Json<RelayRequest>,
) -> StatusCode {
    state.bridge.relays.reset_circuit(&request.url).await;
    StatusCode::NO_CONTENT
}

async fn persist_relays(state: &AppState) {
    let relays = state.bridge.relays.relays().await;
    if let Err(e) = state
        .bridge
        .storage
        .set_kv("nostr_relays", &relays.join(","))
        .await
    {
        tracing::warn!("persisting relay list: {e}");
    }
}

async fn status(State(state): State<Arc<AppState>>) -> Result<Json<Value>, Error> {
    let storage = &state.bridge.storage;
    let operator = state.bridge.operator_id();
    let followers = storage.get_followers(&operator).await?.len();
    let following = storage.get_following(&operator).await?.len();
    Ok(Json(json!({
        "followers": followers,
        "following": following,
        "resync_last_run": storage.get_kv("resync_last_run").await?,
        "resync_last_count": storage.get_kv("resync_last_count").await?,
        "known_actors": storage.get_all_actor_keys().await?.len(),
    })))
}

#[derive(Deserialize)]
struct HandleQuery {
    q: String,
}

/// Resolve a `user@host` handle end to end, for troubleshooting.
async fn handle_test(
    State(state): State<Arc<AppState>>,
    Query(query): Query<HandleQuery>,
) -> Result<Json<Value>, Error> {
    let resolved = tokio::time::timeout(
        HANDLE_TEST_TIMEOUT,
        state.bridge.fetcher.resolve_handle(&query.q),
    )
    .await
    .map_err(|_| Error::Other(format!("resolving {} timed out", query.q)))??;
    let derived = state.bridge.signer.public_key_for(resolved.as_str())?;
    Ok(Json(json!({
        "handle": query.q,
        "actor": resolved,
        "derived_pubkey": derived.to_hex(),
    })))
}
