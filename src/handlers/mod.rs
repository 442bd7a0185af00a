//! The two bridging pipelines
//!
//! [event_handler::EventHandler] carries the operator's native events out to
//! the fediverse; [activity_handler::ActivityHandler] carries verified
//! remote activities back onto the relays. Both share one [Bridge] of
//! collaborators instead of importing each other.

use crate::{
    config::BridgeConfig, federator::Federator, fetch::Fetcher, identity::Signer,
    relay::RelayManager, storage::Storage,
};
use std::sync::Arc;

pub mod activity_handler;
pub mod event_handler;

/// Everything the handlers need, built once at startup.
pub struct Bridge {
    pub config: Arc<BridgeConfig>,
    pub signer: Arc<Signer>,
    pub storage: Arc<dyn Storage>,
    pub fetcher: Arc<Fetcher>,
    pub relays: Arc<RelayManager>,
    pub federator: Arc<Federator>,
}

impl Bridge {
    /// The operator's identity as stored in the follow graph.
    pub fn operator_id(&self) -> String {
        self.signer.public_key().to_hex()
    }
}
