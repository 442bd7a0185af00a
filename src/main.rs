use causeway::{
    config::BridgeConfig,
    federator::Federator,
    fetch::Fetcher,
    handlers::{activity_handler::ActivityHandler, event_handler::EventHandler, Bridge},
    identity::Signer,
    ingress::{self, AppState},
    relay::{subscription, RelayManager, WebSocketTransport},
    storage::{memory::MemoryStorage, Storage},
    workers,
};
use std::{net::SocketAddr, process::ExitCode, sync::Arc};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> ExitCode {
    let level = std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string());
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(format!("causeway={level}"))),
        )
        .init();

    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e}");
            ExitCode::FAILURE
        }
    }
}

async fn run() -> Result<(), causeway::error::Error> {
    let mut config = BridgeConfig::from_env()?;

    let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new());
    if config.database_url.is_some() {
        warn!("DATABASE_URL is set but this build bundles only the in-memory store");
    } else {
        warn!("no DATABASE_URL configured, state will not survive restarts");
    }

    // a persisted relay list overrides the environment
    if let Some(persisted) = storage.get_kv("nostr_relays").await? {
        config.relays = persisted
            .split(',')
            .map(|r| r.trim().to_string())
            .filter(|r| !r.is_empty())
            .collect();
    }
    if config.relays.is_empty() {
        return Err(causeway::error::Error::Config(
            "no relays configured, set NOSTR_RELAY".into(),
        ));
    }

    let config = Arc::new(config);
    let signer = Arc::new(Signer::new(&config.nostr_private_key)?);
    info!("operator pubkey {}", signer.public_key().to_hex());
    info!("local actor {}", config.actor_url());

    let fetcher = Arc::new(Fetcher::new(config.clone()));
    let relays = RelayManager::new(config.clone(), Arc::new(WebSocketTransport));
    let federator = Arc::new(Federator::new(
        config.clone(),
        fetcher.clone(),
        storage.clone(),
        signer.public_key().to_hex(),
    ));
    let bridge = Arc::new(Bridge {
        config: config.clone(),
        signer,
        storage,
        fetcher,
        relays: relays.clone(),
        federator,
    });

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);

    let sink = Arc::new(EventHandler::new(bridge.clone()));
    tokio::spawn(subscription::run_subscription_loop(
        relays,
        bridge.signer.public_key(),
        sink,
        shutdown_rx.clone(),
    ));
    tokio::spawn(workers::run_profile_resync(
        bridge.clone(),
        shutdown_rx.clone(),
    ));

    let activities = Arc::new(ActivityHandler::new(bridge.clone()));
    let state = AppState::new(bridge, activities);
    let app = ingress::router(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    info!("listening on {addr}");
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| causeway::error::Error::Config(format!("binding {addr}: {e}")))?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(shutdown_tx))
        .await
        .map_err(|e| causeway::error::Error::Other(format!("http server: {e}")))?;

    info!("shut down cleanly");
    Ok(())
}

async fn shutdown_signal(shutdown_tx: tokio::sync::watch::Sender<bool>) {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(_) => std::future::pending().await,
        }
    };
    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
    info!("shutdown signal received");
    let _ = shutdown_tx.send(true);
}
