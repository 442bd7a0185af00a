//! Creating and verifying HTTP signatures on federated requests
//!
//! Outbound deliveries sign the pseudo-header set
//! `(request-target) host date digest` with RSA-SHA256. Inbound requests are
//! checked in a fixed order: `Date` presence and clock skew, body digest,
//! then the signature itself against the signing actor's advertised key.

use crate::error::Error;
use base64::{engine::general_purpose::STANDARD as Base64, Engine};
use http::{HeaderMap, HeaderValue};
use once_cell::sync::Lazy;
use regex::Regex;
use rsa::{
    pkcs1v15::{Signature, SigningKey, VerifyingKey},
    pkcs8::DecodePublicKey,
    signature::{SignatureEncoding, Signer as _, Verifier as _},
    RsaPrivateKey, RsaPublicKey,
};
use sha2::{Digest, Sha256};
use std::time::{Duration, SystemTime};
use url::Url;

/// `Digest` header value for a request body.
pub fn body_digest(body: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(body);
    format!("SHA-256={}", Base64.encode(hasher.finalize()))
}

fn request_target(method: &str, path_and_query: &str) -> String {
    format!("{} {}", method.to_lowercase(), path_and_query)
}

fn host_of(url: &Url) -> String {
    let mut host = url.host_str().unwrap_or_default().to_string();
    if let Some(port) = url.port() {
        host = format!("{host}:{port}");
    }
    host
}

/// Headers for one signed delivery: `Host`, `Date`, `Digest` and the
/// `Signature` itself. The `Date` is taken immediately before signing so the
/// signature and body are frozen together.
pub fn sign_request_headers(
    method: &str,
    target: &Url,
    body: &[u8],
    key_id: &str,
    private_key: &RsaPrivateKey,
) -> Result<Vec<(&'static str, String)>, Error> {
    let host = host_of(target);
    let date = httpdate::fmt_http_date(SystemTime::now());
    let digest = body_digest(body);
    let path_and_query = match target.query() {
        Some(q) => format!("{}?{}", target.path(), q),
        None => target.path().to_string(),
    };

    let signing_string = format!(
        "(request-target): {}\nhost: {}\ndate: {}\ndigest: {}",
        request_target(method, &path_and_query),
        host,
        date,
        digest
    );

    let signing_key = SigningKey::<Sha256>::new(private_key.clone());
    let signature = signing_key.sign(signing_string.as_bytes());
    let header = format!(
        "keyId=\"{}\",algorithm=\"rsa-sha256\",headers=\"(request-target) host date digest\",signature=\"{}\"",
        key_id,
        Base64.encode(signature.to_bytes())
    );

    Ok(vec![
        ("host", host),
        ("date", date),
        ("digest", digest),
        ("signature", header),
    ])
}

/// Check the `Date` header against the local clock. Rejection is symmetric:
/// a request from the future is as invalid as a stale one.
pub fn verify_date(date: Option<&HeaderValue>, skew: Duration) -> Result<(), Error> {
    let raw = date
        .and_then(|v| v.to_str().ok())
        .ok_or(Error::DateHeaderInvalid)?;
    let parsed = httpdate::parse_http_date(raw).map_err(|_| Error::DateHeaderInvalid)?;
    let now = SystemTime::now();
    let offset = match now.duration_since(parsed) {
        Ok(elapsed) => elapsed,
        Err(e) => e.duration(),
    };
    if offset > skew {
        return Err(Error::ClockSkew);
    }
    Ok(())
}

/// Verify the body against the `Digest` header when one is present.
///
/// Only `sha-256` entries are checked; entries for other algorithms are
/// skipped. A missing header passes.
pub fn verify_digest(digest: Option<&HeaderValue>, body: &[u8]) -> Result<(), Error> {
    let Some(raw) = digest.and_then(|v| v.to_str().ok()) else {
        return Ok(());
    };
    for part in raw.split(',') {
        let mut iter = part.splitn(2, '=');
        let (Some(algorithm), Some(value)) = (iter.next(), iter.next()) else {
            continue;
        };
        if !algorithm.trim().eq_ignore_ascii_case("sha-256") {
            continue;
        }
        let mut hasher = Sha256::new();
        hasher.update(body);
        if Base64.encode(hasher.finalize()) != value.trim() {
            return Err(Error::DigestMismatch);
        }
    }
    Ok(())
}

/// The parsed parameters of a `Signature` header.
#[derive(Clone, Debug)]
pub struct SignatureHeader {
    /// Advertised key id, usually `<actor>#main-key`
    pub key_id: String,
    /// Pseudo-header names in signing order
    pub headers: Vec<String>,
    /// Decoded signature bytes
    pub signature: Vec<u8>,
}

impl SignatureHeader {
    /// The actor document url behind the key id (fragment stripped).
    pub fn actor_url(&self) -> Result<Url, Error> {
        let mut url = Url::parse(&self.key_id).map_err(|_| Error::SignatureInvalid)?;
        url.set_fragment(None);
        Ok(url)
    }
}

static SIGNATURE_PARAM: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"(\w+)="([^"]*)""#).expect("compile regex"));

/// Parse a `Signature` header into its parameters.
pub fn parse_signature_header(headers: &HeaderMap) -> Result<SignatureHeader, Error> {
    let raw = headers
        .get("signature")
        .and_then(|v| v.to_str().ok())
        .ok_or(Error::SignatureInvalid)?;

    let mut key_id = None;
    let mut header_list = "date".to_string();
    let mut signature = None;
    for caps in SIGNATURE_PARAM.captures_iter(raw) {
        match &caps[1] {
            "keyId" => key_id = Some(caps[2].to_string()),
            "headers" => header_list = caps[2].to_string(),
            "signature" => {
                signature =
                    Some(Base64.decode(&caps[2]).map_err(|_| Error::SignatureInvalid)?);
            }
            _ => {}
        }
    }

    Ok(SignatureHeader {
        key_id: key_id.ok_or(Error::SignatureInvalid)?,
        headers: header_list.split_whitespace().map(str::to_string).collect(),
        signature: signature.ok_or(Error::SignatureInvalid)?,
    })
}

/// Verify a parsed signature against the signing actor's public key.
///
/// The signing string is rebuilt from the header names the signer advertised;
/// any listed header missing from the request fails verification.
pub fn verify_signature(
    parsed: &SignatureHeader,
    method: &str,
    path_and_query: &str,
    headers: &HeaderMap,
    public_key_pem: &str,
) -> Result<(), Error> {
    let mut lines = Vec::with_capacity(parsed.headers.len());
    for name in &parsed.headers {
        if name == "(request-target)" {
            lines.push(format!(
                "(request-target): {}",
                request_target(method, path_and_query)
            ));
            continue;
        }
        let value = headers
            .get(name.as_str())
            .and_then(|v| v.to_str().ok())
            .ok_or(Error::SignatureInvalid)?;
        lines.push(format!("{name}: {value}"));
    }
    let signing_string = lines.join("\n");

    let public_key =
        RsaPublicKey::from_public_key_pem(public_key_pem).map_err(|_| Error::SignatureInvalid)?;
    let verifying_key = VerifyingKey::<Sha256>::new(public_key);
    let signature =
        Signature::try_from(parsed.signature.as_slice()).map_err(|_| Error::SignatureInvalid)?;
    verifying_key
        .verify(signing_string.as_bytes(), &signature)
        .map_err(|_| Error::SignatureInvalid)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::generate_rsa_keypair;

    fn signed_request(body: &[u8]) -> (HeaderMap, String) {
        let keypair = generate_rsa_keypair().unwrap();
        let target = Url::parse("https://mastodon.example/users/alice/inbox").unwrap();
        let header_pairs = sign_request_headers(
            "POST",
            &target,
            body,
            "https://bridge.example/users/operator#main-key",
            &keypair.rsa_private_key().unwrap(),
        )
        .unwrap();
        let mut headers = HeaderMap::new();
        for (name, value) in header_pairs {
            headers.insert(name, HeaderValue::from_str(&value).unwrap());
        }
        (headers, keypair.public_key)
    }

    #[test]
    fn test_sign_verify_roundtrip() -> anyhow::Result<()> {
        let body = br#"{"type":"Create"}"#;
        let (headers, public_pem) = signed_request(body);

        verify_date(headers.get("date"), Duration::from_secs(30))?;
        verify_digest(headers.get("digest"), body)?;

        let parsed = parse_signature_header(&headers)?;
        assert_eq!(
            parsed.actor_url()?.as_str(),
            "https://bridge.example/users/operator"
        );
        verify_signature(
            &parsed,
            "POST",
            "/users/alice/inbox",
            &headers,
            &public_pem,
        )?;
        Ok(())
    }

    #[test]
    fn test_tampered_body_fails_digest() {
        let (headers, _) = signed_request(b"original");
        assert_eq!(
            verify_digest(headers.get("digest"), b"tampered"),
            Err(Error::DigestMismatch)
        );
    }

    #[test]
    fn test_foreign_digest_algorithm_skipped() {
        let value = HeaderValue::from_static("SHA-512=AAAA");
        verify_digest(Some(&value), b"anything").unwrap();
    }

    #[test]
    fn test_clock_skew_symmetric() {
        let skew = Duration::from_secs(30);
        let past = SystemTime::now() - Duration::from_secs(40);
        let future = SystemTime::now() + Duration::from_secs(40);
        let near = SystemTime::now() - Duration::from_secs(10);

        for (time, expected) in [
            (past, Err(Error::ClockSkew)),
            (future, Err(Error::ClockSkew)),
            (near, Ok(())),
        ] {
            let value = HeaderValue::from_str(&httpdate::fmt_http_date(time)).unwrap();
            assert_eq!(verify_date(Some(&value), skew), expected);
        }
    }

    #[test]
    fn test_missing_date_rejected() {
        assert_eq!(
            verify_date(None, Duration::from_secs(30)),
            Err(Error::DateHeaderInvalid)
        );
    }

    #[test]
    fn test_wrong_key_fails_verification() {
        let body = b"payload";
        let (headers, _) = signed_request(body);
        let other = generate_rsa_keypair().unwrap();
        let parsed = parse_signature_header(&headers).unwrap();
        assert_eq!(
            verify_signature(
                &parsed,
                "POST",
                "/users/alice/inbox",
                &headers,
                &other.public_key,
            ),
            Err(Error::SignatureInvalid)
        );
    }
}
