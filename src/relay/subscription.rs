//! The read-side subscription over the operator's events
//!
//! One logical subscription spans every relay in the current set. Relay-list
//! changes cancel and immediately restart it; a plain disconnect waits the
//! reconnect backoff first. Events are handed to the sink through a bounded
//! semaphore and dropped with a warning when the sink cannot keep up.

use crate::relay::manager::RelayManager;
use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use nostr::{ClientMessage, Event, Filter, JsonUtil, Kind, PublicKey, RelayMessage,
    SubscriptionId, Timestamp};
use std::{collections::HashSet, sync::Arc, time::Duration};
use tokio::sync::{mpsc, watch, Semaphore};
use tokio_tungstenite::{connect_async, tungstenite::Message as WsMessage};
use tracing::{debug, info, warn};

/// Reconnect backoff after a relay drops the connection.
const RECONNECT_BACKOFF: Duration = Duration::from_secs(5);

/// Receives the operator's events from the subscription.
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn handle_event(&self, event: Event);
}

/// Event kinds the subscription asks relays for.
pub fn observed_kinds() -> Vec<Kind> {
    vec![
        Kind::Metadata,
        Kind::TextNote,
        Kind::EventDeletion,
        Kind::Repost,
        Kind::Reaction,
        Kind::ZapReceipt,
        Kind::RelayList,
        Kind::Custom(1068),
        Kind::LongFormTextNote,
    ]
}

/// Drive the subscription until `shutdown` flips.
///
/// Never returns under normal operation; the caller runs it on its own task.
pub async fn run_subscription_loop(
    manager: Arc<RelayManager>,
    author: PublicKey,
    sink: Arc<dyn EventSink>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut restart_rx = match manager.take_restart_receiver().await {
        Some(rx) => rx,
        None => {
            warn!("subscription restart channel already taken, not subscribing");
            return;
        }
    };
    let limiter = Arc::new(Semaphore::new(manager.subscription_concurrency()));
    let mut seen: HashSet<nostr::EventId> = HashSet::new();

    loop {
        if *shutdown.borrow() {
            return;
        }
        let relays = manager.relays().await;
        if relays.is_empty() {
            info!("no relays configured, waiting for configuration");
            tokio::select! {
                _ = restart_rx.recv() => continue,
                _ = shutdown.changed() => return,
            }
        }

        let (event_tx, mut event_rx) = mpsc::channel::<Event>(64);
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let since = Timestamp::now();
        for relay in &relays {
            tokio::spawn(relay_reader(
                relay.clone(),
                author,
                since,
                event_tx.clone(),
                cancel_rx.clone(),
            ));
        }
        drop(event_tx);

        info!("subscribed to {} relays", relays.len());
        loop {
            tokio::select! {
                maybe_event = event_rx.recv() => {
                    let Some(event) = maybe_event else { break };
                    if !seen.insert(event.id) {
                        continue;
                    }
                    if seen.len() > 10_000 {
                        seen.clear();
                        seen.insert(event.id);
                    }
                    match Arc::clone(&limiter).try_acquire_owned() {
                        Ok(permit) => {
                            let sink = Arc::clone(&sink);
                            tokio::spawn(async move {
                                sink.handle_event(event).await;
                                drop(permit);
                            });
                        }
                        Err(_) => {
                            warn!("subscription dispatch saturated, dropping event {}", event.id);
                        }
                    }
                }
                _ = restart_rx.recv() => {
                    info!("relay set changed, restarting subscription");
                    break;
                }
                _ = shutdown.changed() => {
                    let _ = cancel_tx.send(true);
                    return;
                }
            }
        }
        let _ = cancel_tx.send(true);
    }
}

/// One relay connection: subscribe, forward events, reconnect on drop.
async fn relay_reader(
    relay_url: String,
    author: PublicKey,
    initial_since: Timestamp,
    events: mpsc::Sender<Event>,
    mut cancel: watch::Receiver<bool>,
) {
    let mut since = initial_since;
    loop {
        if *cancel.borrow() {
            return;
        }
        match read_until_disconnect(&relay_url, author, since, &events, &mut cancel).await {
            ReadEnd::Cancelled => return,
            ReadEnd::Disconnected => {
                debug!("{relay_url} disconnected, reconnecting in {RECONNECT_BACKOFF:?}");
            }
        }
        tokio::select! {
            _ = tokio::time::sleep(RECONNECT_BACKOFF) => {}
            _ = cancel.changed() => return,
        }
        since = Timestamp::now();
    }
}

enum ReadEnd {
    Cancelled,
    Disconnected,
}

async fn read_until_disconnect(
    relay_url: &str,
    author: PublicKey,
    since: Timestamp,
    events: &mpsc::Sender<Event>,
    cancel: &mut watch::Receiver<bool>,
) -> ReadEnd {
    let (stream, _) = match connect_async(relay_url).await {
        Ok(connected) => connected,
        Err(e) => {
            debug!("connect to {relay_url}: {e}");
            return ReadEnd::Disconnected;
        }
    };
    let (mut tx, mut rx) = stream.split();

    let filter = Filter::new()
        .author(author)
        .kinds(observed_kinds())
        .since(since);
    let req = ClientMessage::req(SubscriptionId::new("causeway"), vec![filter]);
    if tx.send(WsMessage::Text(req.as_json())).await.is_err() {
        return ReadEnd::Disconnected;
    }

    loop {
        let message = tokio::select! {
            m = rx.next() => m,
            _ = cancel.changed() => {
                let _ = tx.send(WsMessage::Close(None)).await;
                return ReadEnd::Cancelled;
            }
        };
        let text = match message {
            Some(Ok(WsMessage::Text(t))) => t,
            Some(Ok(WsMessage::Ping(_) | WsMessage::Pong(_) | WsMessage::Binary(_))) => continue,
            Some(Ok(WsMessage::Close(_))) | Some(Ok(_)) | Some(Err(_)) | None => {
                return ReadEnd::Disconnected;
            }
        };
        match RelayMessage::from_json(&text) {
            Ok(RelayMessage::Event { event, .. }) => {
                if events.send(*event).await.is_err() {
                    return ReadEnd::Cancelled;
                }
            }
            Ok(RelayMessage::EndOfStoredEvents(_)) => {
                debug!("{relay_url}: end of stored events");
            }
            Ok(RelayMessage::Notice { message }) => {
                warn!("NOTICE from {relay_url}: {message}");
            }
            Ok(RelayMessage::Closed { message, .. }) => {
                warn!("{relay_url} closed our subscription: {message}");
                return ReadEnd::Disconnected;
            }
            Ok(_) | Err(_) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_observed_kinds_cover_bridged_kinds() {
        let kinds = observed_kinds();
        for expected in [0u16, 1, 5, 6, 7, 1068, 9735, 10002, 30023] {
            assert!(
                kinds.iter().any(|k| k.as_u16() == expected),
                "kind {expected} missing from subscription filter"
            );
        }
    }
}
