//! Background maintenance tasks

use crate::{
    atproto::{NotificationPoller, ThirdNetworkClient},
    handlers::Bridge,
    transmute::to_nostr,
};
use chrono::{SecondsFormat, Utc};
use std::{sync::Arc, time::Duration};
use tokio::sync::watch;
use tracing::{debug, info, warn};
use url::Url;

/// Pacing between per-actor refetches during a resync sweep.
const RESYNC_PACING: Duration = Duration::from_millis(300);

/// Third-network polling interval.
const POLL_INTERVAL: Duration = Duration::from_secs(30);

/// Periodically refetch every known remote actor and re-emit its profile
/// metadata under the derived key, so relay-side profiles don't go stale.
pub async fn run_profile_resync(bridge: Arc<Bridge>, mut shutdown: watch::Receiver<bool>) {
    loop {
        tokio::select! {
            _ = tokio::time::sleep(bridge.config.resync_interval) => {}
            _ = shutdown.changed() => return,
        }

        let actors = match bridge.storage.get_all_actor_keys().await {
            Ok(actors) => actors,
            Err(e) => {
                warn!("listing actors for resync: {e}");
                continue;
            }
        };
        info!("profile resync: {} actors", actors.len());

        let mut refreshed = 0usize;
        for (_pubkey, foreign_id) in actors {
            if *shutdown.borrow() {
                return;
            }
            let Ok(url) = Url::parse(&foreign_id) else {
                continue;
            };
            bridge.fetcher.invalidate(&url).await;
            let result = async {
                let actor = bridge.fetcher.fetch_actor(&url).await?;
                let builder = to_nostr::metadata_from_actor(&actor, &bridge.config.domain())?;
                let event = bridge.signer.sign_as_derived(builder, &foreign_id)?;
                bridge.relays.publish(event).await
            }
            .await;
            match result {
                Ok(_) => refreshed += 1,
                Err(e) => debug!("resync of {foreign_id} failed: {e}"),
            }
            tokio::time::sleep(RESYNC_PACING).await;
        }

        let now = Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true);
        if let Err(e) = bridge.storage.set_kv("resync_last_run", &now).await {
            warn!("persisting resync timestamp: {e}");
        }
        if let Err(e) = bridge
            .storage
            .set_kv("resync_last_count", &refreshed.to_string())
            .await
        {
            warn!("persisting resync count: {e}");
        }
        info!("profile resync finished: {refreshed} refreshed");
    }
}

/// Drive the third-network poller: a fixed interval, an external trigger,
/// and whatever back-off the server demands.
pub async fn run_notification_poller(
    bridge: Arc<Bridge>,
    client: Arc<dyn ThirdNetworkClient>,
    mut trigger: tokio::sync::mpsc::Receiver<()>,
    mut shutdown: watch::Receiver<bool>,
) {
    let poller = NotificationPoller::new(bridge, client);
    loop {
        let backoff = match poller.poll_once().await {
            Ok(Some(retry_after)) => Duration::from_secs(retry_after),
            Ok(None) => POLL_INTERVAL,
            Err(e) => {
                warn!("notification poll failed: {e}");
                POLL_INTERVAL
            }
        };
        tokio::select! {
            _ = tokio::time::sleep(backoff) => {}
            Some(()) = trigger.recv() => {
                debug!("notification poll triggered externally");
            }
            _ = shutdown.changed() => return,
        }
    }
}
