//! The HTTP surface of the bridge
//!
//! Federated servers talk to the endpoints here: discovery, the actor and
//! object documents, and the inbox hot path with its concurrency caps. The
//! admin API is mounted under `/web` when a password is configured.

use crate::handlers::{activity_handler::ActivityHandler, Bridge};
use axum::{
    body::Body,
    extract::DefaultBodyLimit,
    http::{header, HeaderValue, Method, Request, Response as HttpResponse, StatusCode},
    middleware::{self, Next},
    response::Response,
    routing::{get, post},
    Router,
};
use std::{sync::Arc, time::Instant};
use tower_http::catch_panic::CatchPanicLayer;
use tracing::{error, info};

pub mod admin;
pub mod http;
pub mod inbox;

/// Maximum accepted inbox body size.
const MAX_BODY_BYTES: usize = 1024 * 1024;

/// Shared state behind every route.
pub struct AppState {
    pub bridge: Arc<Bridge>,
    pub activities: Arc<ActivityHandler>,
    pub inbox_guard: inbox::InboxGuard,
}

impl AppState {
    pub fn new(bridge: Arc<Bridge>, activities: Arc<ActivityHandler>) -> Arc<Self> {
        let inbox_guard = inbox::InboxGuard::new(
            bridge.config.max_concurrent_activities,
            bridge.config.max_per_origin_concurrency,
        );
        Arc::new(AppState {
            bridge,
            activities,
            inbox_guard,
        })
    }
}

/// Assemble the full router.
pub fn router(state: Arc<AppState>) -> Router {
    let admin_enabled = state.bridge.config.web_admin.is_some();
    let mut router = Router::new()
        .route("/.well-known/webfinger", get(http::webfinger))
        .route("/.well-known/nodeinfo", get(http::nodeinfo_index))
        .route("/.well-known/nostr.json", get(http::nostr_json))
        .route("/nodeinfo/:version", get(http::nodeinfo))
        .route("/actor", get(http::service_actor))
        .route("/users/:user", get(http::actor))
        .route("/users/:user/followers", get(http::followers))
        .route("/users/:user/following", get(http::following))
        .route("/users/:user/outbox", get(http::outbox))
        .route("/users/:user/inbox", post(inbox::post_inbox))
        .route("/inbox", post(inbox::post_inbox))
        .route("/objects/:id", get(http::object))
        .route("/tags/:tag", get(http::tag));
    if admin_enabled {
        router = router.nest("/web", admin::router(state.clone()));
    }
    router
        .layer(DefaultBodyLimit::max(MAX_BODY_BYTES))
        .layer(CatchPanicLayer::custom(handle_panic))
        .layer(middleware::from_fn(log_request))
        .layer(middleware::from_fn(permissive_cors))
        .with_state(state)
}

/// A panicking handler answers 500 and the process stays up.
fn handle_panic(panic: Box<dyn std::any::Any + Send + 'static>) -> HttpResponse<Body> {
    let detail = panic
        .downcast_ref::<String>()
        .map(String::as_str)
        .or_else(|| panic.downcast_ref::<&str>().copied())
        .unwrap_or("unknown panic");
    error!("handler panicked: {detail}");
    let mut response = HttpResponse::new(Body::from("internal server error"));
    *response.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
    response
}

/// Structured request log with latency.
async fn log_request(request: Request<Body>, next: Next) -> Response {
    let method = request.method().clone();
    let path = request.uri().path().to_string();
    let ip = real_ip(&request);
    let started = Instant::now();
    let response = next.run(request).await;
    info!(
        %method,
        path,
        status = response.status().as_u16(),
        ip,
        elapsed_ms = started.elapsed().as_millis() as u64,
        "request"
    );
    response
}

/// Permissive CORS for read endpoints; browsers never post to the inbox.
async fn permissive_cors(request: Request<Body>, next: Next) -> Response {
    if request.method() == Method::OPTIONS {
        let mut response = Response::new(Body::empty());
        *response.status_mut() = StatusCode::NO_CONTENT;
        apply_cors(&mut response);
        return response;
    }
    let mut response = next.run(request).await;
    apply_cors(&mut response);
    response
}

fn apply_cors(response: &mut Response) {
    let headers = response.headers_mut();
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_ORIGIN,
        HeaderValue::from_static("*"),
    );
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_METHODS,
        HeaderValue::from_static("GET, POST, OPTIONS"),
    );
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_HEADERS,
        HeaderValue::from_static("Content-Type, Authorization, Signature, Digest, Date"),
    );
}

/// Client address as seen through reverse proxies.
pub(crate) fn real_ip(request: &Request<Body>) -> String {
    let headers = request.headers();
    headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(|v| v.trim().to_string())
        .or_else(|| {
            headers
                .get("x-real-ip")
                .and_then(|v| v.to_str().ok())
                .map(str::to_string)
        })
        .unwrap_or_else(|| "unknown".to_string())
}
