//! The inbox hot path
//!
//! Signature verification, then two layers of admission control: a
//! per-origin cap so one noisy peer cannot monopolize capacity, and a global
//! cap protecting the process. Admitted activities are answered with 202 and
//! processed asynchronously under a deadline.

use crate::{
    apub::activity::{Activity, ActivityType},
    error::Error,
    httpsig,
    ingress::AppState,
};
use axum::{
    body::Bytes,
    extract::State,
    http::{HeaderMap, StatusCode, Uri},
    response::IntoResponse,
};
use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};
use tracing::{debug, warn};

/// Admission control over in-flight inbox activities.
pub struct InboxGuard {
    global: Arc<tokio::sync::Semaphore>,
    per_origin: Arc<Mutex<HashMap<String, usize>>>,
    max_per_origin: usize,
}

impl InboxGuard {
    pub fn new(max_global: usize, max_per_origin: usize) -> Self {
        InboxGuard {
            global: Arc::new(tokio::sync::Semaphore::new(max_global)),
            per_origin: Arc::new(Mutex::new(HashMap::new())),
            max_per_origin,
        }
    }

    /// Try to admit one activity from `origin`.
    ///
    /// The returned permit releases both counters when dropped, whatever
    /// path the processing takes.
    pub fn try_admit(&self, origin: &str) -> Result<InboxPermit, Error> {
        {
            let mut counts = self.per_origin.lock().expect("per-origin lock");
            let count = counts.entry(origin.to_string()).or_insert(0);
            if *count >= self.max_per_origin {
                return Err(Error::OriginBusy);
            }
            *count += 1;
        }

        match Arc::clone(&self.global).try_acquire_owned() {
            Ok(permit) => Ok(InboxPermit {
                _global: permit,
                per_origin: Arc::clone(&self.per_origin),
                origin: origin.to_string(),
            }),
            Err(_) => {
                release_origin(&self.per_origin, origin);
                Err(Error::Overloaded)
            }
        }
    }

    #[cfg(test)]
    pub fn in_flight_for(&self, origin: &str) -> usize {
        self.per_origin
            .lock()
            .expect("per-origin lock")
            .get(origin)
            .copied()
            .unwrap_or(0)
    }
}

fn release_origin(per_origin: &Mutex<HashMap<String, usize>>, origin: &str) {
    let mut counts = per_origin.lock().expect("per-origin lock");
    if let Some(count) = counts.get_mut(origin) {
        *count -= 1;
        // drop empty entries so the map doesn't grow with every origin ever seen
        if *count == 0 {
            counts.remove(origin);
        }
    }
}

/// Holds one admitted activity's slots.
pub struct InboxPermit {
    _global: tokio::sync::OwnedSemaphorePermit,
    per_origin: Arc<Mutex<HashMap<String, usize>>>,
    origin: String,
}

impl Drop for InboxPermit {
    fn drop(&mut self) {
        release_origin(&self.per_origin, &self.origin);
    }
}

/// `POST /inbox` and `POST /users/{user}/inbox`.
pub async fn post_inbox(
    State(state): State<Arc<AppState>>,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> impl IntoResponse {
    match receive(state, &uri, &headers, &body).await {
        Ok(()) => StatusCode::ACCEPTED.into_response(),
        Err(Error::OriginBusy) => StatusCode::TOO_MANY_REQUESTS.into_response(),
        Err(Error::Overloaded) => StatusCode::SERVICE_UNAVAILABLE.into_response(),
        Err(Error::MalformedActivity(e)) => {
            debug!("malformed activity: {e}");
            (StatusCode::BAD_REQUEST, "malformed activity").into_response()
        }
        Err(
            e @ (Error::SignatureInvalid
            | Error::DigestMismatch
            | Error::ClockSkew
            | Error::DateHeaderInvalid
            | Error::Gone),
        ) => {
            debug!("rejecting inbox request: {e}");
            StatusCode::UNAUTHORIZED.into_response()
        }
        Err(e) => {
            warn!("inbox processing setup failed: {e}");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

async fn receive(
    state: Arc<AppState>,
    uri: &Uri,
    headers: &HeaderMap,
    body: &Bytes,
) -> Result<(), Error> {
    let activity: Activity = serde_json::from_slice(body)?;
    verify_request(&state, uri, headers, body, &activity).await?;

    let origin = activity
        .actor
        .host_str()
        .map(str::to_string)
        .unwrap_or_else(|| {
            headers
                .get("x-forwarded-for")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.split(',').next())
                .map(|v| v.trim().to_string())
                .unwrap_or_else(|| "unknown".to_string())
        });

    let permit = state.inbox_guard.try_admit(&origin)?;

    // answered with 202 from here on; processing happens on its own task
    let timeout = state.bridge.config.inbox_timeout;
    let activities = state.activities.clone();
    let activity_id = activity.id.clone();
    tokio::spawn(async move {
        let result = tokio::time::timeout(timeout, activities.handle_activity(activity)).await;
        match result {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!("processing {activity_id} failed: {e}"),
            Err(_) => warn!("processing {activity_id} abandoned after {timeout:?}"),
        }
        drop(permit);
    });
    Ok(())
}

/// Full inbound verification: clock skew, body digest, then the signature
/// against the signing actor's published key.
///
/// A signing actor that is gone (410) passes only for `Delete` activities,
/// so deleted accounts can still announce their own deletion.
async fn verify_request(
    state: &AppState,
    uri: &Uri,
    headers: &HeaderMap,
    body: &Bytes,
    activity: &Activity,
) -> Result<(), Error> {
    httpsig::verify_date(headers.get("date"), state.bridge.config.clock_skew)?;
    httpsig::verify_digest(headers.get("digest"), body)?;

    let parsed = httpsig::parse_signature_header(headers)?;
    let signing_actor = parsed.actor_url()?;
    let actor = match state.bridge.fetcher.fetch_actor(&signing_actor).await {
        Ok(actor) => actor,
        Err(Error::Gone) => {
            return if activity.activity_type() == ActivityType::Delete {
                debug!("accepting unsigned Delete from gone actor {signing_actor}");
                Ok(())
            } else {
                Err(Error::Gone)
            };
        }
        Err(e) => {
            debug!("cannot fetch signing actor {signing_actor}: {e}");
            return Err(Error::SignatureInvalid);
        }
    };
    let public_key_pem = actor
        .public_key
        .as_ref()
        .map(|k| k.public_key_pem.as_str())
        .ok_or(Error::SignatureInvalid)?;

    let path_and_query = uri
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/inbox");
    httpsig::verify_signature(&parsed, "POST", path_and_query, headers, public_key_pem)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_per_origin_cap() {
        let guard = InboxGuard::new(50, 5);
        let mut permits = Vec::new();
        for _ in 0..5 {
            permits.push(guard.try_admit("mastodon.example").unwrap());
        }
        assert_eq!(
            guard.try_admit("mastodon.example").unwrap_err(),
            Error::OriginBusy
        );
        // other origins are unaffected
        let other = guard.try_admit("pleroma.example").unwrap();
        drop(other);

        drop(permits.pop());
        guard.try_admit("mastodon.example").unwrap();
    }

    #[test]
    fn test_global_cap_and_origin_rollback() {
        let guard = InboxGuard::new(2, 5);
        let _a = guard.try_admit("a.example").unwrap();
        let _b = guard.try_admit("b.example").unwrap();

        // global cap reached: rejected, and the per-origin count is rolled back
        assert_eq!(guard.try_admit("c.example").unwrap_err(), Error::Overloaded);
        assert_eq!(guard.in_flight_for("c.example"), 0);
    }

    #[test]
    fn test_permit_release_removes_entry() {
        let guard = InboxGuard::new(10, 5);
        let permit = guard.try_admit("solo.example").unwrap();
        assert_eq!(guard.in_flight_for("solo.example"), 1);
        drop(permit);
        assert_eq!(guard.in_flight_for("solo.example"), 0);
    }

    #[test]
    fn test_spec_load_mix() {
        // 60 simultaneous activities, 20 from one origin: at most 50 admitted
        // globally, at most 5 of the noisy origin's in flight
        let guard = InboxGuard::new(50, 5);
        let mut admitted = 0;
        let mut noisy_admitted = 0;
        let mut permits = Vec::new();
        for i in 0..60 {
            let origin = if i < 20 {
                "mastodon.example"
            } else {
                // spread the rest over distinct origins
                match i % 8 {
                    0 => "a.example",
                    1 => "b.example",
                    2 => "c.example",
                    3 => "d.example",
                    4 => "e.example",
                    5 => "f.example",
                    6 => "g.example",
                    _ => "h.example",
                }
            };
            if let Ok(permit) = guard.try_admit(origin) {
                admitted += 1;
                if origin == "mastodon.example" {
                    noisy_admitted += 1;
                }
                permits.push(permit);
            }
        }
        assert!(admitted <= 50);
        assert_eq!(noisy_admitted, 5);
    }
}
