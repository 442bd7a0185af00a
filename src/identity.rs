//! Operator identity and deterministic derived identities
//!
//! The operator's secp256k1 key signs their own bridged events. Every remote
//! participant the bridge observes gets a stable keypair derived as
//! `sha256(operator_secret_hex ":" foreign_id)`, so derived identities
//! survive restarts without persisting key material, and a leak of a derived
//! key never forges the operator.

use crate::error::Error;
use dashmap::DashMap;
use nostr::{Event, EventBuilder, Keys, Kind, PublicKey, SecretKey, Tag};
use sha2::{Digest, Sha256};

/// Holds the operator key and the derived-key cache.
pub struct Signer {
    operator: Keys,
    secret_hex: String,
    derived: DashMap<String, Keys>,
}

impl Signer {
    /// Build a signer from the operator's hex-encoded secret key.
    pub fn new(secret_hex: &str) -> Result<Self, Error> {
        let secret = SecretKey::from_hex(secret_hex)
            .map_err(|e| Error::Config(format!("NOSTR_PRIVATE_KEY: {e}")))?;
        Ok(Signer {
            operator: Keys::new(secret),
            secret_hex: secret_hex.to_string(),
            derived: DashMap::new(),
        })
    }

    /// The operator's public key.
    pub fn public_key(&self) -> PublicKey {
        self.operator.public_key()
    }

    /// Sign an event with the operator's own key.
    pub fn sign_as_self(&self, builder: EventBuilder) -> Result<Event, Error> {
        Ok(builder.sign_with_keys(&self.operator)?)
    }

    /// Deterministic keypair for a foreign participant.
    ///
    /// Computed lazily on first encounter and cached for the process
    /// lifetime; never persisted.
    pub fn derived_keys(&self, foreign_id: &str) -> Result<Keys, Error> {
        if let Some(keys) = self.derived.get(foreign_id) {
            return Ok(keys.clone());
        }
        let mut hasher = Sha256::new();
        hasher.update(self.secret_hex.as_bytes());
        hasher.update(b":");
        hasher.update(foreign_id.as_bytes());
        let digest = hasher.finalize();
        let secret = SecretKey::from_slice(&digest)
            .map_err(|e| Error::Signer(format!("derived key for {foreign_id}: {e}")))?;
        let keys = Keys::new(secret);
        self.derived.insert(foreign_id.to_string(), keys.clone());
        Ok(keys)
    }

    /// Public key a foreign participant appears under on the relays.
    pub fn public_key_for(&self, foreign_id: &str) -> Result<PublicKey, Error> {
        Ok(self.derived_keys(foreign_id)?.public_key())
    }

    /// Sign an event with the derived key of a foreign participant.
    pub fn sign_as_derived(&self, builder: EventBuilder, foreign_id: &str) -> Result<Event, Error> {
        let keys = self.derived_keys(foreign_id)?;
        Ok(builder.sign_with_keys(&keys)?)
    }

    /// Encrypted direct message from the operator to themselves, used for
    /// bridge notifications (new follower, surfaced errors).
    pub fn create_self_dm(&self, plaintext: &str) -> Result<Event, Error> {
        let secret = self.operator.secret_key()?;
        let recipient = self.operator.public_key();
        let ciphertext = nostr::nips::nip04::encrypt(secret, &recipient, plaintext)
            .map_err(|e| Error::Signer(format!("nip04 encrypt: {e}")))?;
        let builder = EventBuilder::new(Kind::EncryptedDirectMessage, ciphertext)
            .tag(Tag::public_key(recipient));
        self.sign_as_self(builder)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TEST_KEY: &str = "67dea2ed018072d675f5415ecfaed7d2597555e202d85b3d65ea4e58d2d92ffa";

    fn test_signer() -> Signer {
        Signer::new(TEST_KEY).unwrap()
    }

    #[test]
    fn test_rejects_bad_key() {
        assert!(Signer::new("not hex").is_err());
        assert!(Signer::new("abcd").is_err());
    }

    #[test]
    fn test_derivation_is_deterministic() {
        let signer = test_signer();
        let a = signer
            .public_key_for("https://mastodon.example/users/alice")
            .unwrap();
        let b = signer
            .public_key_for("https://mastodon.example/users/alice")
            .unwrap();
        assert_eq!(a, b);

        // a fresh signer from the same secret derives the same key
        let other = test_signer();
        let c = other
            .public_key_for("https://mastodon.example/users/alice")
            .unwrap();
        assert_eq!(a, c);
    }

    #[test]
    fn test_distinct_actors_get_distinct_keys() {
        let signer = test_signer();
        let alice = signer
            .public_key_for("https://mastodon.example/users/alice")
            .unwrap();
        let bob = signer
            .public_key_for("https://mastodon.example/users/bob")
            .unwrap();
        assert_ne!(alice, bob);
        assert_ne!(alice, signer.public_key());
    }

    #[test]
    fn test_derived_signature_verifies() {
        let signer = test_signer();
        let event = signer
            .sign_as_derived(
                EventBuilder::text_note("mirrored"),
                "https://mastodon.example/users/alice",
            )
            .unwrap();
        assert!(event.verify().is_ok());
        assert_eq!(
            event.pubkey,
            signer
                .public_key_for("https://mastodon.example/users/alice")
                .unwrap()
        );
    }

    #[test]
    fn test_self_dm_is_encrypted() {
        let signer = test_signer();
        let event = signer.create_self_dm("🔔 New Fediverse follower").unwrap();
        assert_eq!(event.kind, Kind::EncryptedDirectMessage);
        assert!(!event.content.contains("follower"));
        assert!(event.verify().is_ok());
    }
}
