//! Error types returned across the bridge

use nostr::event::id::EventId;

/// Errors which can occur while bridging between the relay network and the
/// fediverse.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// Configuration or initialization problem, fatal at startup
    #[error("Invalid configuration: {0}")]
    Config(String),
    /// Object was not found locally
    #[error("Object was not found locally")]
    NotFound,
    /// Remote object or actor returned 410 Gone
    #[error("Remote resource is gone")]
    Gone,
    /// Inbound request is missing the Date header or it failed to parse
    #[error("Missing or unparseable Date header")]
    DateHeaderInvalid,
    /// Inbound request Date is outside the accepted clock skew window
    #[error("Date header outside allowed clock skew")]
    ClockSkew,
    /// Incoming request has an invalid digest for its body
    #[error("Incoming request has an invalid digest for its body")]
    DigestMismatch,
    /// Incoming request has a missing or invalid HTTP signature
    #[error("Incoming request has an invalid HTTP signature")]
    SignatureInvalid,
    /// Failed to resolve a handle via webfinger
    #[error("Failed to resolve actor via webfinger")]
    WebfingerResolveFailed,
    /// Incoming activity could not be parsed
    #[error("Malformed activity: {0}")]
    MalformedActivity(#[from] serde_json::Error),
    /// A relay rejected this specific event by static policy
    #[error("Relay rejected event by policy: {0}")]
    RelayPolicy(String),
    /// A relay demands proof of work which we will never satisfy
    #[error("Relay demands proof of work: {0}")]
    RelayPow(String),
    /// No relay accepted the event
    #[error("Event {0} was not accepted by any relay")]
    PublishFailed(EventId),
    /// Event signature check failed on the subscription stream
    #[error("Event has an invalid signature")]
    EventSignatureInvalid,
    /// Per-origin inbox concurrency cap reached
    #[error("Too many in-flight activities from this origin")]
    OriginBusy,
    /// Global inbox concurrency cap reached
    #[error("Global activity processing capacity exhausted")]
    Overloaded,
    /// Third-network session expired or was rejected
    #[error("Third-network session is not authorized")]
    Unauthorized,
    /// Remote server asked us to back off
    #[error("Rate limited, retry after {0} seconds")]
    RateLimited(u64),
    /// Underlying persistence failure
    #[error("Storage error: {0}")]
    Storage(String),
    /// Event building or signing failed
    #[error("Signer error: {0}")]
    Signer(String),
    /// Outbound HTTP failure
    #[error(transparent)]
    Http(#[from] reqwest::Error),
    /// Url could not be parsed
    #[error(transparent)]
    UrlParse(#[from] url::ParseError),
    /// other error
    #[error("{0}")]
    Other(String),
}

impl Error {
    pub(crate) fn other<T: std::fmt::Display>(error: T) -> Self {
        Error::Other(error.to_string())
    }
}

impl From<nostr::event::builder::Error> for Error {
    fn from(e: nostr::event::builder::Error) -> Self {
        Error::Signer(e.to_string())
    }
}

impl From<nostr::key::Error> for Error {
    fn from(e: nostr::key::Error) -> Self {
        Error::Signer(e.to_string())
    }
}

impl PartialEq for Error {
    fn eq(&self, other: &Self) -> bool {
        std::mem::discriminant(self) == std::mem::discriminant(other)
    }
}
