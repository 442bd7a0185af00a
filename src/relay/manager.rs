//! Relay set, rate-limited publishing, and circuit bookkeeping

use crate::{
    config::BridgeConfig,
    error::Error,
    relay::circuit::{CircuitBreaker, CircuitState},
};
use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use nostr::{ClientMessage, Event, JsonUtil, RelayMessage};
use std::{
    collections::HashMap,
    sync::Arc,
    time::{Duration, Instant},
};
use tokio::sync::{mpsc, Mutex};
use tokio_tungstenite::{connect_async, tungstenite::Message as WsMessage};
use tracing::{debug, warn};

/// Sends one event to one relay and reports the relay's verdict.
///
/// A trait seam so the publish pipeline and breaker logic are testable
/// without sockets; [WebSocketTransport] is the production implementation.
#[async_trait]
pub trait RelayTransport: Send + Sync {
    async fn publish(&self, relay_url: &str, event: &Event) -> Result<(), Error>;
}

/// Dials the relay, sends `["EVENT", …]` and waits for the matching
/// `["OK", …]` acknowledgement.
pub struct WebSocketTransport;

#[async_trait]
impl RelayTransport for WebSocketTransport {
    async fn publish(&self, relay_url: &str, event: &Event) -> Result<(), Error> {
        let (stream, _) = connect_async(relay_url)
            .await
            .map_err(|e| Error::Other(format!("connect to {relay_url}: {e}")))?;
        let (mut tx, mut rx) = stream.split();

        tx.send(WsMessage::Text(ClientMessage::event(event.clone()).as_json()))
            .await
            .map_err(|e| Error::Other(format!("send to {relay_url}: {e}")))?;

        while let Some(message) = rx.next().await {
            let text = match message {
                Ok(WsMessage::Text(t)) => t,
                Ok(WsMessage::Close(_)) | Err(_) => break,
                _ => continue,
            };
            let Ok(parsed) = RelayMessage::from_json(&text) else {
                continue;
            };
            if let RelayMessage::Ok {
                event_id,
                status,
                message,
            } = parsed
            {
                if event_id != event.id {
                    continue;
                }
                let _ = tx.send(WsMessage::Close(None)).await;
                if status {
                    return Ok(());
                }
                if message.contains("pow:") {
                    return Err(Error::RelayPow(message));
                }
                if message.starts_with("blocked:") || message.starts_with("invalid:") {
                    return Err(Error::RelayPolicy(message));
                }
                return Err(Error::Other(format!("{relay_url} rejected event: {message}")));
            }
        }
        Err(Error::Other(format!("{relay_url} closed without OK")))
    }
}

/// Token bucket protecting strict anti-spam relays from publish bursts.
struct TokenBucket {
    rate: f64,
    capacity: f64,
    state: Mutex<(f64, Instant)>,
}

impl TokenBucket {
    fn new(rate: f64, capacity: u32) -> Self {
        TokenBucket {
            rate,
            capacity: f64::from(capacity),
            state: Mutex::new((f64::from(capacity), Instant::now())),
        }
    }

    async fn acquire(&self) {
        loop {
            let wait = {
                let mut state = self.state.lock().await;
                let (ref mut tokens, ref mut refilled) = *state;
                *tokens = (*tokens + refilled.elapsed().as_secs_f64() * self.rate)
                    .min(self.capacity);
                *refilled = Instant::now();
                if *tokens >= 1.0 {
                    *tokens -= 1.0;
                    return;
                }
                Duration::from_secs_f64((1.0 - *tokens) / self.rate)
            };
            tokio::time::sleep(wait).await;
        }
    }
}

/// Per-relay result aggregate of one publish fan-out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PublishOutcome {
    /// Relays which accepted the event
    pub accepted: usize,
    /// Relays a network attempt was made against
    pub attempted: usize,
}

#[derive(Default)]
struct RelaySet {
    relays: Vec<String>,
    circuits: HashMap<String, CircuitBreaker>,
}

/// Owns the relay list and all publish traffic to it.
pub struct RelayManager {
    config: Arc<BridgeConfig>,
    transport: Arc<dyn RelayTransport>,
    set: Arc<Mutex<RelaySet>>,
    limiter: Arc<TokenBucket>,
    restart_tx: mpsc::Sender<()>,
    restart_rx: Mutex<Option<mpsc::Receiver<()>>>,
}

impl RelayManager {
    /// Manager over the configured initial relay set.
    pub fn new(config: Arc<BridgeConfig>, transport: Arc<dyn RelayTransport>) -> Arc<Self> {
        let (restart_tx, restart_rx) = mpsc::channel(1);
        let set = RelaySet {
            relays: config.relays.clone(),
            circuits: HashMap::new(),
        };
        Arc::new(RelayManager {
            limiter: Arc::new(TokenBucket::new(config.publish_rate, config.publish_burst)),
            config,
            transport,
            set: Arc::new(Mutex::new(set)),
            restart_tx,
            restart_rx: Mutex::new(Some(restart_rx)),
        })
    }

    /// Snapshot of the current relay list.
    pub async fn relays(&self) -> Vec<String> {
        self.set.lock().await.relays.clone()
    }

    /// In-flight bound for subscription dispatch.
    pub fn subscription_concurrency(&self) -> usize {
        self.config.subscription_concurrency
    }

    /// Receiver for subscription-restart signals. Taken once by the
    /// subscription loop.
    pub async fn take_restart_receiver(&self) -> Option<mpsc::Receiver<()>> {
        self.restart_rx.lock().await.take()
    }

    fn signal_restart(&self) {
        // non-blocking: a pending signal already covers this change
        let _ = self.restart_tx.try_send(());
    }

    /// Add a relay at runtime.
    pub async fn add_relay(&self, url: &str) {
        let mut set = self.set.lock().await;
        if set.relays.iter().any(|r| r == url) {
            return;
        }
        set.relays.push(url.to_string());
        drop(set);
        self.signal_restart();
    }

    /// Remove a relay at runtime.
    pub async fn remove_relay(&self, url: &str) {
        let mut set = self.set.lock().await;
        let before = set.relays.len();
        set.relays.retain(|r| r != url);
        let changed = set.relays.len() != before;
        drop(set);
        if changed {
            self.signal_restart();
        }
    }

    /// Reconcile the relay list against a full replacement set, as carried
    /// by a relay-list event: relays not listed are dropped, missing ones
    /// added. Signals a subscription restart when anything changed.
    pub async fn reconcile(&self, desired: &[String]) {
        let mut set = self.set.lock().await;
        let before = set.relays.clone();
        set.relays.retain(|r| desired.contains(r));
        for url in desired {
            if !set.relays.contains(url) {
                set.relays.push(url.clone());
            }
        }
        let changed = set.relays != before;
        drop(set);
        if changed {
            self.signal_restart();
        }
    }

    /// Clear a relay's circuit, including a permanent open.
    pub async fn reset_circuit(&self, url: &str) {
        let mut set = self.set.lock().await;
        if let Some(circuit) = set.circuits.get_mut(url) {
            circuit.reset();
        }
    }

    /// Circuit state per relay, for the admin surface.
    pub async fn circuit_states(&self) -> Vec<(String, CircuitState, u32)> {
        let set = self.set.lock().await;
        set.relays
            .iter()
            .map(|url| match set.circuits.get(url) {
                Some(c) => (url.clone(), c.state(), c.failures()),
                None => (url.clone(), CircuitState::Closed, 0),
            })
            .collect()
    }

    /// Publish an event to every healthy relay.
    ///
    /// Runs on its own spawned task with a per-relay deadline independent of
    /// the caller, so a short-lived caller (such as an HTTP request) cannot
    /// abort delivery mid-handshake. Succeeds when at least one relay
    /// accepted the event.
    pub async fn publish(&self, event: Event) -> Result<PublishOutcome, Error> {
        let handle = tokio::spawn(publish_task(
            Arc::clone(&self.config),
            Arc::clone(&self.set),
            Arc::clone(&self.transport),
            Arc::clone(&self.limiter),
            event,
        ));
        handle
            .await
            .map_err(|e| Error::Other(format!("publish task failed: {e}")))?
    }
}

async fn publish_task(
    config: Arc<BridgeConfig>,
    set: Arc<Mutex<RelaySet>>,
    transport: Arc<dyn RelayTransport>,
    limiter: Arc<TokenBucket>,
    event: Event,
) -> Result<PublishOutcome, Error> {
    let eligible: Vec<String> = {
        let mut set = set.lock().await;
        let threshold = config.circuit_failure_threshold;
        let cooldown = config.circuit_cooldown;
        let relays = set.relays.clone();
        relays
            .into_iter()
            .filter(|url| {
                set.circuits
                    .entry(url.clone())
                    .or_insert_with(|| CircuitBreaker::new(threshold, cooldown))
                    .should_attempt()
            })
            .collect()
    };
    if eligible.is_empty() {
        warn!("No healthy relay to publish {} to", event.id);
        return Err(Error::PublishFailed(event.id));
    }

    limiter.acquire().await;

    let timeout = config.publish_timeout;
    let attempts = eligible.iter().map(|url| {
        let transport = Arc::clone(&transport);
        let event = &event;
        async move {
            let result = tokio::time::timeout(timeout, transport.publish(url, event))
                .await
                .unwrap_or_else(|_| Err(Error::Other(format!("publish to {url} timed out"))));
            (url.clone(), result)
        }
    });
    let results = futures::future::join_all(attempts).await;

    let mut outcome = PublishOutcome {
        accepted: 0,
        attempted: results.len(),
    };
    let mut set = set.lock().await;
    for (url, result) in results {
        let Some(circuit) = set.circuits.get_mut(&url) else {
            continue;
        };
        match result {
            Ok(()) => {
                outcome.accepted += 1;
                circuit.record_success();
            }
            Err(Error::RelayPolicy(reason)) => {
                // the relay is healthy, it just rejects this event
                debug!("{url} rejected event {} by policy: {reason}", event.id);
                circuit.record_success();
            }
            Err(Error::RelayPow(reason)) => {
                warn!("{url} demands proof of work, disabling: {reason}");
                circuit.record_failure(&format!("pow: {reason}"));
            }
            Err(e) => {
                debug!("publish to {url} failed: {e}");
                circuit.record_failure(&e.to_string());
            }
        }
    }
    drop(set);

    if outcome.accepted == 0 {
        return Err(Error::PublishFailed(event.id));
    }
    Ok(outcome)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::tests::test_config;
    use nostr::{EventBuilder, Keys};
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct ScriptedTransport {
        calls: AtomicUsize,
        /// per-relay behavior keyed by url
        script: HashMap<String, fn() -> Result<(), Error>>,
    }

    #[async_trait]
    impl RelayTransport for ScriptedTransport {
        async fn publish(&self, relay_url: &str, _event: &Event) -> Result<(), Error> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match self.script.get(relay_url) {
                Some(behavior) => behavior(),
                None => Ok(()),
            }
        }
    }

    fn manager_with(
        relays: Vec<&str>,
        script: HashMap<String, fn() -> Result<(), Error>>,
    ) -> (Arc<RelayManager>, Arc<ScriptedTransport>) {
        let mut config = test_config();
        config.relays = relays.into_iter().map(str::to_string).collect();
        // keep tests fast
        config.publish_rate = 1000.0;
        config.publish_burst = 1000;
        let transport = Arc::new(ScriptedTransport {
            calls: AtomicUsize::new(0),
            script,
        });
        let manager = RelayManager::new(Arc::new(config), transport.clone());
        (manager, transport)
    }

    fn test_event() -> Event {
        let keys = Keys::generate();
        EventBuilder::text_note("hello").sign_with_keys(&keys).unwrap()
    }

    #[tokio::test]
    async fn test_publish_succeeds_with_one_acceptance() {
        let mut script: HashMap<String, fn() -> Result<(), Error>> = HashMap::new();
        script.insert("wss://bad.example".to_string(), || {
            Err(Error::Other("connection refused".to_string()))
        });
        let (manager, _) = manager_with(vec!["wss://good.example", "wss://bad.example"], script);

        let outcome = manager.publish(test_event()).await.unwrap();
        assert_eq!(outcome.accepted, 1);
        assert_eq!(outcome.attempted, 2);
    }

    #[tokio::test]
    async fn test_open_circuit_makes_no_network_call() {
        let mut script: HashMap<String, fn() -> Result<(), Error>> = HashMap::new();
        script.insert("wss://down.example".to_string(), || {
            Err(Error::Other("connection refused".to_string()))
        });
        let (manager, transport) = manager_with(vec!["wss://down.example"], script);

        for _ in 0..3 {
            let _ = manager.publish(test_event()).await;
        }
        assert_eq!(transport.calls.load(Ordering::SeqCst), 3);

        // circuit is now open: publish is skipped entirely
        let result = manager.publish(test_event()).await;
        assert!(matches!(result, Err(Error::PublishFailed(_))));
        assert_eq!(transport.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_pow_demand_until_manual_reset() {
        let mut script: HashMap<String, fn() -> Result<(), Error>> = HashMap::new();
        script.insert("wss://pow.example".to_string(), || {
            Err(Error::RelayPow("pow: 28 bits needed".to_string()))
        });
        let (manager, transport) = manager_with(vec!["wss://pow.example"], script);

        let _ = manager.publish(test_event()).await;
        assert_eq!(transport.calls.load(Ordering::SeqCst), 1);
        let states = manager.circuit_states().await;
        assert_eq!(states[0].1, CircuitState::OpenPermanent);

        // skipped with no network call while permanently open
        let _ = manager.publish(test_event()).await;
        assert_eq!(transport.calls.load(Ordering::SeqCst), 1);

        manager.reset_circuit("wss://pow.example").await;
        let _ = manager.publish(test_event()).await;
        assert_eq!(transport.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_policy_rejection_leaves_circuit_closed() {
        let mut script: HashMap<String, fn() -> Result<(), Error>> = HashMap::new();
        script.insert("wss://strict.example".to_string(), || {
            Err(Error::RelayPolicy("blocked: not on allowlist".to_string()))
        });
        let (manager, transport) = manager_with(vec!["wss://strict.example"], script);

        for _ in 0..5 {
            let result = manager.publish(test_event()).await;
            // the event itself failed on every relay
            assert!(matches!(result, Err(Error::PublishFailed(_))));
        }
        // but the relay stays healthy and keeps being attempted
        assert_eq!(transport.calls.load(Ordering::SeqCst), 5);
        let states = manager.circuit_states().await;
        assert_eq!(states[0].1, CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_reconcile_replaces_set_and_signals_restart() {
        let (manager, _) = manager_with(vec!["wss://a", "wss://z"], HashMap::new());
        let mut restart_rx = manager.take_restart_receiver().await.unwrap();

        manager
            .reconcile(&[
                "wss://a".to_string(),
                "wss://b".to_string(),
                "wss://c".to_string(),
            ])
            .await;

        let mut relays = manager.relays().await;
        relays.sort();
        assert_eq!(relays, vec!["wss://a", "wss://b", "wss://c"]);
        restart_rx.try_recv().unwrap();
    }

    #[tokio::test]
    async fn test_add_remove_relay() {
        let (manager, _) = manager_with(vec!["wss://a"], HashMap::new());
        manager.add_relay("wss://b").await;
        manager.add_relay("wss://b").await;
        assert_eq!(manager.relays().await.len(), 2);
        manager.remove_relay("wss://a").await;
        assert_eq!(manager.relays().await, vec!["wss://b"]);
    }
}
