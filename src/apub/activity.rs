//! The activity envelope and its typed verb view

use crate::apub::helpers::deserialize_addressing;
use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use url::Url;

/// The verbs the bridge reacts to. Everything else lands in `Unknown` and is
/// logged once, then ignored.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ActivityType {
    Create,
    Update,
    Delete,
    Follow,
    Accept,
    Reject,
    Like,
    EmojiReact,
    Announce,
    Undo,
    Move,
    Unknown,
}

impl ActivityType {
    /// Parse an ActivityStreams `type` value.
    pub fn from_str(kind: &str) -> ActivityType {
        match kind {
            "Create" => ActivityType::Create,
            "Update" => ActivityType::Update,
            "Delete" => ActivityType::Delete,
            "Follow" => ActivityType::Follow,
            "Accept" => ActivityType::Accept,
            "Reject" => ActivityType::Reject,
            "Like" => ActivityType::Like,
            "EmojiReact" => ActivityType::EmojiReact,
            "Announce" => ActivityType::Announce,
            "Undo" => ActivityType::Undo,
            "Move" => ActivityType::Move,
            _ => ActivityType::Unknown,
        }
    }
}

/// A federated activity, inbound or outbound.
///
/// `object` stays a raw value: depending on the verb it is a bare id string,
/// an embedded object, or a nested activity, and the handler decides which
/// view it needs.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Activity {
    pub id: Url,
    #[serde(rename = "type")]
    pub kind: String,
    pub actor: Url,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub object: Value,
    #[serde(default, deserialize_with = "deserialize_addressing", skip_serializing_if = "Vec::is_empty")]
    pub to: Vec<String>,
    #[serde(default, deserialize_with = "deserialize_addressing", skip_serializing_if = "Vec::is_empty")]
    pub cc: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub published: Option<String>,
    /// Emoji reaction content (`EmojiReact` carries it on the activity)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(default, deserialize_with = "crate::apub::helpers::deserialize_lossy_vec", skip_serializing_if = "Vec::is_empty")]
    pub tag: Vec<crate::apub::object::TagItem>,
}

impl Activity {
    /// New activity with the given verb; addressing is filled by the caller.
    pub fn new(kind: &str, id: Url, actor: Url, object: Value) -> Self {
        Activity {
            id,
            kind: kind.to_string(),
            actor,
            object,
            to: Vec::new(),
            cc: Vec::new(),
            published: Some(now_rfc3339()),
            content: None,
            tag: Vec::new(),
        }
    }

    /// The typed verb of this activity.
    pub fn activity_type(&self) -> ActivityType {
        ActivityType::from_str(&self.kind)
    }

    /// The id of the object, whether it is embedded or referenced.
    pub fn object_id(&self) -> Option<Url> {
        match &self.object {
            Value::String(s) => Url::parse(s).ok(),
            Value::Object(map) => map
                .get("id")
                .and_then(Value::as_str)
                .and_then(|s| Url::parse(s).ok()),
            _ => None,
        }
    }

    /// The `type` of an embedded object, if one is embedded.
    pub fn object_type(&self) -> Option<&str> {
        self.object.get("type").and_then(Value::as_str)
    }
}

/// Current time in the format remote servers expect in `published`.
pub fn now_rfc3339() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_object_id_from_string_and_embedded() {
        let follow: Activity = serde_json::from_str(
            r#"{
                "id": "https://mastodon.example/activities/1",
                "type": "Follow",
                "actor": "https://mastodon.example/users/alice",
                "object": "https://bridge.example/users/operator"
            }"#,
        )
        .unwrap();
        assert_eq!(follow.activity_type(), ActivityType::Follow);
        assert_eq!(
            follow.object_id().unwrap().as_str(),
            "https://bridge.example/users/operator"
        );

        let create: Activity = serde_json::from_str(
            r#"{
                "id": "https://mastodon.example/activities/2",
                "type": "Create",
                "actor": "https://mastodon.example/users/alice",
                "object": {"id": "https://mastodon.example/notes/1", "type": "Note", "content": "hi"}
            }"#,
        )
        .unwrap();
        assert_eq!(create.object_type(), Some("Note"));
        assert_eq!(
            create.object_id().unwrap().as_str(),
            "https://mastodon.example/notes/1"
        );
    }

    #[test]
    fn test_unknown_verb() {
        let activity: Activity = serde_json::from_str(
            r#"{
                "id": "https://example.com/activities/3",
                "type": "Arrive",
                "actor": "https://example.com/users/a"
            }"#,
        )
        .unwrap();
        assert_eq!(activity.activity_type(), ActivityType::Unknown);
        assert!(activity.object_id().is_none());
    }
}
