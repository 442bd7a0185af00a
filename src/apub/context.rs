//! Wrapper for federated structs which handles the `@context` field

use crate::apub::helpers::deserialize_context;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Default context used in Activitypub
const DEFAULT_CONTEXT: &str = "https://www.w3.org/ns/activitystreams";

/// Extension context carrying the vocabulary the bridge uses beyond the
/// core: `sensitive`, `Hashtag`, `Emoji`, `quoteUrl` and the `proxyOf`
/// back-reference.
fn extended_context() -> Value {
    serde_json::json!({
        "sensitive": "as:sensitive",
        "Hashtag": "as:Hashtag",
        "quoteUrl": "as:quoteUrl",
        "toot": "http://joinmastodon.org/ns#",
        "Emoji": "toot:Emoji",
        "proxyOf": "toot:proxyOf"
    })
}

/// Wrapper for federated structs which handles the `@context` field.
#[derive(Serialize, Deserialize, Debug)]
pub struct WithContext<T> {
    #[serde(rename = "@context")]
    #[serde(deserialize_with = "deserialize_context")]
    context: Vec<Value>,
    #[serde(flatten)]
    inner: T,
}

impl<T> WithContext<T> {
    /// Wrap with the default Activitypub context plus the bridge extensions.
    pub fn new_default(inner: T) -> WithContext<T> {
        let context = vec![Value::String(DEFAULT_CONTEXT.to_string()), extended_context()];
        WithContext::new(inner, context)
    }

    /// Wrap with a custom context.
    pub fn new(inner: T, context: Vec<Value>) -> WithContext<T> {
        WithContext { context, inner }
    }

    /// Returns the inner `T` object which this `WithContext` object is wrapping
    pub fn inner(&self) -> &T {
        &self.inner
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_context_serializes_first() {
        #[derive(Serialize)]
        struct Note {
            content: String,
        }
        let note = WithContext::new_default(Note {
            content: "Hello world".to_string(),
        });
        let serialized = serde_json::to_string(&note).unwrap();
        assert!(serialized.starts_with(r#"{"@context":["#));
        assert!(serialized.contains("Hello world"));
    }

    #[test]
    fn test_accepts_single_context() {
        #[derive(Deserialize, Debug)]
        struct Empty {}
        let parsed: WithContext<Empty> = serde_json::from_str(
            r#"{"@context": "https://www.w3.org/ns/activitystreams"}"#,
        )
        .unwrap();
        assert_eq!(parsed.context.len(), 1);
    }
}
