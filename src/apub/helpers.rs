//! Serde deserializers for the shapes remote platforms actually send
//!
//! Each helper targets one field family of the bridge's documents rather
//! than being a generic shape adapter: addressing lists, object references,
//! avatar images, the `@context` array, and lossy tag arrays.

use crate::apub::actor::Image;
use serde::{Deserialize, Deserializer};
use serde_json::Value;
use url::Url;

/// Addressing fields (`to`, `cc`) arrive as a single string, an array of
/// strings, or occasionally objects carrying an `id`. Collapse them all to
/// the flat target list the federator expands.
pub fn deserialize_addressing<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let mut targets = Vec::new();
    collect_addresses(Value::deserialize(deserializer)?, &mut targets);
    Ok(targets)
}

fn collect_addresses(value: Value, targets: &mut Vec<String>) {
    match value {
        Value::String(address) => targets.push(address),
        Value::Array(values) => {
            for value in values {
                collect_addresses(value, targets);
            }
        }
        Value::Object(map) => {
            if let Some(id) = map.get("id").and_then(Value::as_str) {
                targets.push(id.to_string());
            }
        }
        _ => {}
    }
}

/// Object references (`inReplyTo`, `url`) come as a bare string, an embedded
/// object, or an array of either. Threading depends on them, so pull out the
/// first usable url instead of dropping the field.
pub fn deserialize_object_url<'de, D>(deserializer: D) -> Result<Option<Url>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(extract_url(&Value::deserialize(deserializer)?))
}

fn extract_url(value: &Value) -> Option<Url> {
    match value {
        Value::String(raw) => Url::parse(raw).ok(),
        Value::Object(map) => map
            .get("id")
            .or_else(|| map.get("href"))
            .and_then(Value::as_str)
            .and_then(|raw| Url::parse(raw).ok()),
        Value::Array(values) => values.iter().find_map(extract_url),
        _ => None,
    }
}

/// Avatars and banners are usually a single `Image` object, but some
/// platforms send an array of candidates or a bare url string. Anything
/// unusable leaves the actor without one rather than rejecting it.
pub fn deserialize_icon<'de, D>(deserializer: D) -> Result<Option<Image>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(extract_image(Value::deserialize(deserializer)?))
}

fn extract_image(value: Value) -> Option<Image> {
    match value {
        Value::String(raw) => Url::parse(&raw).ok().map(Image::new),
        Value::Object(_) => serde_json::from_value(value).ok(),
        Value::Array(values) => values.into_iter().find_map(extract_image),
        _ => None,
    }
}

/// `@context` is a single IRI, an extension object, or an array mixing both.
pub fn deserialize_context<'de, D>(deserializer: D) -> Result<Vec<Value>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Value::deserialize(deserializer)? {
        Value::Array(values) => values,
        other => vec![other],
    })
}

/// Deserialize an array, silently dropping elements which fail to parse.
///
/// Tag arrays mix `Mention`, `Hashtag`, `Emoji` and platform-specific items
/// we have no use for; one exotic item must not reject the whole object.
pub fn deserialize_lossy_vec<'de, T, D>(deserializer: D) -> Result<Vec<T>, D::Error>
where
    T: serde::de::DeserializeOwned,
    D: Deserializer<'de>,
{
    let values: Vec<Value> = Deserialize::deserialize(deserializer)?;
    Ok(values
        .into_iter()
        .filter_map(|v| serde_json::from_value(v).ok())
        .collect())
}
