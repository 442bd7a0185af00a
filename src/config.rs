//! Bridge configuration, read from the environment at startup
//!
//! Use [BridgeConfig::builder] in tests, or [BridgeConfig::from_env] in the
//! binary. All tunables carry the defaults described in the operator
//! documentation and can be left untouched.

use crate::error::Error;
use derive_builder::Builder;
use rand::rngs::OsRng;
use rsa::{
    pkcs8::{DecodePrivateKey, EncodePrivateKey, EncodePublicKey, LineEnding},
    RsaPrivateKey, RsaPublicKey,
};
use std::{env, fs, path::Path, time::Duration};
use url::Url;

/// RSA keypair used for HTTP signatures, in PEM format.
///
/// This is separate from the operator's Nostr key. It is loaded from disk, or
/// generated and written on first start.
#[derive(Debug, Clone)]
pub struct Keypair {
    /// Private key in PKCS#8 PEM format
    pub private_key: String,
    /// Public key in PEM format
    pub public_key: String,
}

impl Keypair {
    /// Parse the private key PEM into an [RsaPrivateKey].
    pub fn rsa_private_key(&self) -> Result<RsaPrivateKey, Error> {
        RsaPrivateKey::from_pkcs8_pem(&self.private_key)
            .map_err(|e| Error::Config(format!("invalid RSA private key: {e}")))
    }
}

/// Generate a fresh RSA keypair for HTTP signatures.
pub fn generate_rsa_keypair() -> Result<Keypair, Error> {
    let mut rng = OsRng;
    let private = RsaPrivateKey::new(&mut rng, 2048)
        .map_err(|e| Error::Config(format!("RSA key generation failed: {e}")))?;
    let public = RsaPublicKey::from(&private);
    let private_key = private
        .to_pkcs8_pem(LineEnding::LF)
        .map_err(|e| Error::Config(format!("RSA private key encoding failed: {e}")))?
        .to_string();
    let public_key = public
        .to_public_key_pem(LineEnding::LF)
        .map_err(|e| Error::Config(format!("RSA public key encoding failed: {e}")))?;
    Ok(Keypair {
        private_key,
        public_key,
    })
}

/// Load the keypair from the given paths, generating and persisting a new one
/// when the private key file does not exist yet.
pub fn load_or_generate_keypair(private_path: &str, public_path: &str) -> Result<Keypair, Error> {
    if Path::new(private_path).exists() {
        let private_key = fs::read_to_string(private_path)
            .map_err(|e| Error::Config(format!("reading {private_path}: {e}")))?;
        let public_key = fs::read_to_string(public_path)
            .map_err(|e| Error::Config(format!("reading {public_path}: {e}")))?;
        return Ok(Keypair {
            private_key,
            public_key,
        });
    }
    let keypair = generate_rsa_keypair()?;
    fs::write(private_path, &keypair.private_key)
        .map_err(|e| Error::Config(format!("writing {private_path}: {e}")))?;
    fs::write(public_path, &keypair.public_key)
        .map_err(|e| Error::Config(format!("writing {public_path}: {e}")))?;
    tracing::info!("Generated new RSA keypair at {private_path}");
    Ok(keypair)
}

/// Configuration for the bridge process.
#[derive(Builder, Clone)]
pub struct BridgeConfig {
    /// Hex-encoded secp256k1 private key of the operator
    #[builder(setter(into))]
    pub nostr_private_key: String,
    /// Local part of the operator's fediverse handle
    #[builder(setter(into), default = "\"operator\".to_string()")]
    pub username: String,
    /// HTTPS base url this bridge is reachable at, e.g. `https://bridge.example`
    pub local_url: Url,
    /// Initial relay set. May be superseded at runtime by the persisted
    /// `nostr_relays` key or a kind-10002 relay list.
    #[builder(default)]
    pub relays: Vec<String>,
    /// Connection string of the external key/value store
    #[builder(default)]
    pub database_url: Option<String>,
    /// RSA keypair for HTTP signatures
    pub keypair: Keypair,
    /// Password for the admin API. `None` disables the admin surface entirely.
    #[builder(default)]
    pub web_admin: Option<String>,
    /// Listen port
    #[builder(default = "8080")]
    pub port: u16,
    /// Append a source-url line to every bridged note
    #[builder(default = "false")]
    pub show_source_link: bool,

    /// Consecutive publish failures before a relay circuit opens
    #[builder(default = "3")]
    pub circuit_failure_threshold: u32,
    /// How long a temporarily opened circuit stays open
    #[builder(default = "Duration::from_secs(5 * 60)")]
    pub circuit_cooldown: Duration,
    /// Deadline for one publish fan-out, independent of the caller
    #[builder(default = "Duration::from_secs(15)")]
    pub publish_timeout: Duration,
    /// Timeout for fetching remote objects and actors
    #[builder(default = "Duration::from_secs(10)")]
    pub fetch_timeout: Duration,
    /// Deadline for processing one inbound activity
    #[builder(default = "Duration::from_secs(30)")]
    pub inbox_timeout: Duration,
    /// Accepted clock skew on inbound signature dates, in either direction
    #[builder(default = "Duration::from_secs(30)")]
    pub clock_skew: Duration,
    /// Global cap on concurrently processed inbound activities
    #[builder(default = "50")]
    pub max_concurrent_activities: usize,
    /// Cap on concurrently processed activities per remote origin
    #[builder(default = "5")]
    pub max_per_origin_concurrency: usize,
    /// Bound on concurrent actor fetches and deliveries during fan-out
    #[builder(default = "10")]
    pub federation_concurrency: usize,
    /// In-flight bound on the relay subscription dispatch
    #[builder(default = "20")]
    pub subscription_concurrency: usize,
    /// Sustained outbound publish rate, events per second
    #[builder(default = "2.0")]
    pub publish_rate: f64,
    /// Outbound publish burst size
    #[builder(default = "5")]
    pub publish_burst: u32,
    /// Interval between remote profile re-syncs
    #[builder(default = "Duration::from_secs(24 * 60 * 60)")]
    pub resync_interval: Duration,
}

impl BridgeConfig {
    /// Returns a new config builder with default tunables.
    pub fn builder() -> BridgeConfigBuilder {
        BridgeConfigBuilder::default()
    }

    /// Read configuration from the environment.
    ///
    /// `NOSTR_PRIVATE_KEY` and `LOCAL_DOMAIN` are required; everything else
    /// has a default. Fails with [Error::Config] on any invalid value.
    pub fn from_env() -> Result<Self, Error> {
        let nostr_private_key = env::var("NOSTR_PRIVATE_KEY")
            .map_err(|_| Error::Config("NOSTR_PRIVATE_KEY is required".into()))?;
        let local_url = env::var("LOCAL_DOMAIN")
            .map_err(|_| Error::Config("LOCAL_DOMAIN is required".into()))
            .and_then(|raw| {
                Url::parse(&raw).map_err(|e| Error::Config(format!("LOCAL_DOMAIN: {e}")))
            })?;

        let private_path =
            env::var("RSA_PRIVATE_KEY_PATH").unwrap_or_else(|_| "private.pem".to_string());
        let public_path =
            env::var("RSA_PUBLIC_KEY_PATH").unwrap_or_else(|_| "public.pem".to_string());
        let keypair = load_or_generate_keypair(&private_path, &public_path)?;

        let relays = env::var("NOSTR_RELAY")
            .map(|raw| {
                raw.split(',')
                    .map(|r| r.trim().to_string())
                    .filter(|r| !r.is_empty())
                    .collect()
            })
            .unwrap_or_default();

        let port = match env::var("PORT") {
            Ok(raw) => raw
                .parse()
                .map_err(|_| Error::Config(format!("PORT is not a port number: {raw}")))?,
            Err(_) => 8080,
        };

        let mut builder = BridgeConfig::builder();
        builder
            .nostr_private_key(nostr_private_key)
            .local_url(local_url)
            .keypair(keypair)
            .relays(relays)
            .database_url(env::var("DATABASE_URL").ok())
            .web_admin(env::var("WEB_ADMIN").ok())
            .port(port)
            .show_source_link(env::var("SHOW_SOURCE_LINK").is_ok_and(|v| v == "1" || v == "true"));
        if let Ok(username) = env::var("NOSTR_USERNAME") {
            builder.username(username);
        }
        builder
            .build()
            .map_err(|e| Error::Config(e.to_string()))
    }

    /// Host (with port, if any) of the local url. Used to recognize our own
    /// objects and to build webfinger subjects.
    pub fn domain(&self) -> String {
        let mut domain = self
            .local_url
            .host_str()
            .unwrap_or_default()
            .to_string();
        if let Some(port) = self.local_url.port() {
            domain = format!("{domain}:{port}");
        }
        domain
    }

    /// Url of the operator's fediverse actor.
    pub fn actor_url(&self) -> Url {
        self.join(&format!("users/{}", self.username))
    }

    /// Url of the instance service actor.
    pub fn service_actor_url(&self) -> Url {
        self.join("actor")
    }

    /// Url under which a local (bridged-out) event is served.
    pub fn object_url(&self, event_id: &str) -> Url {
        self.join(&format!("objects/{event_id}"))
    }

    /// Url of the hashtag collection page.
    pub fn tag_url(&self, tag: &str) -> Url {
        self.join(&format!("tags/{tag}"))
    }

    /// Url of the operator's followers collection.
    pub fn followers_url(&self) -> Url {
        self.join(&format!("users/{}/followers", self.username))
    }

    /// True if the url points at this bridge.
    pub fn is_local_url(&self, url: &Url) -> bool {
        let mut domain = url.host_str().unwrap_or_default().to_string();
        if let Some(port) = url.port() {
            domain = format!("{domain}:{port}");
        }
        domain == self.domain()
    }

    fn join(&self, path: &str) -> Url {
        self.local_url
            .join(path)
            .unwrap_or_else(|_| self.local_url.clone())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn test_config() -> BridgeConfig {
        BridgeConfig::builder()
            .nostr_private_key(
                // throwaway key, appears in multiple test modules
                "a2a44b32b0ad9ebbd46a7eb70b1e1d26ba2b4a2a27a2a1a6b1a2c3d4e5f60718".to_string(),
            )
            .local_url(Url::parse("https://bridge.example").unwrap())
            .keypair(generate_rsa_keypair().unwrap())
            .relays(vec!["wss://relay.example".to_string()])
            .build()
            .unwrap()
    }

    #[test]
    fn test_local_urls() {
        let config = test_config();
        assert_eq!(config.domain(), "bridge.example");
        assert_eq!(
            config.actor_url().as_str(),
            "https://bridge.example/users/operator"
        );
        assert_eq!(
            config.object_url("abc").as_str(),
            "https://bridge.example/objects/abc"
        );
        assert!(config.is_local_url(&Url::parse("https://bridge.example/objects/x").unwrap()));
        assert!(!config.is_local_url(&Url::parse("https://mastodon.example/users/a").unwrap()));
    }

    #[test]
    fn test_keypair_roundtrip() {
        let keypair = generate_rsa_keypair().unwrap();
        assert!(keypair.private_key.contains("PRIVATE KEY"));
        assert!(keypair.public_key.contains("PUBLIC KEY"));
        keypair.rsa_private_key().unwrap();
    }
}
