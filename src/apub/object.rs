//! Content objects: notes, articles, questions, and the tagged view over
//! arbitrary remote documents

use crate::apub::{
    actor::{ActorDoc, Image},
    activity::Activity,
    helpers::{deserialize_addressing, deserialize_lossy_vec, deserialize_object_url},
    ProxyOf,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use url::Url;

/// An item in an object's `tag` array.
///
/// Unknown item types are dropped during deserialization rather than
/// rejecting the whole object.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(tag = "type")]
pub enum TagItem {
    /// A user mention; `href` points at the mentioned actor
    Mention {
        href: Url,
        #[serde(skip_serializing_if = "Option::is_none")]
        name: Option<String>,
    },
    /// A hashtag; `name` carries the leading `#`
    Hashtag {
        #[serde(skip_serializing_if = "Option::is_none")]
        href: Option<Url>,
        name: String,
    },
    /// A custom emoji with its image
    Emoji {
        name: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        icon: Option<Image>,
    },
}

/// A media attachment or link card.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Attachment {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub media_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<Url>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub href: Option<Url>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

impl Attachment {
    /// The target this attachment points at, whichever field carries it.
    pub fn target(&self) -> Option<&Url> {
        self.url.as_ref().or(self.href.as_ref())
    }

    /// True for image/video/audio documents, false for link cards.
    pub fn is_media(&self) -> bool {
        matches!(self.kind.as_str(), "Document" | "Image" | "Video" | "Audio")
    }
}

/// One selectable answer of a `Question`.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct QuestionOption {
    #[serde(rename = "type", default = "note_type")]
    pub kind: String,
    pub name: String,
}

fn note_type() -> String {
    "Note".to_string()
}

/// A content object: `Note`, `Article`, `Question` or `Page`.
///
/// One struct covers all of them; the `kind` field discriminates, and the
/// fields only some kinds use stay `None` elsewhere.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Note {
    #[serde(rename = "type")]
    pub kind: String,
    pub id: Url,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attributed_to: Option<Url>,
    #[serde(default, deserialize_with = "deserialize_addressing", skip_serializing_if = "Vec::is_empty")]
    pub to: Vec<String>,
    #[serde(default, deserialize_with = "deserialize_addressing", skip_serializing_if = "Vec::is_empty")]
    pub cc: Vec<String>,
    #[serde(default)]
    pub content: String,
    /// Title, for articles
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Content warning
    #[serde(skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub sensitive: bool,
    #[serde(default, deserialize_with = "deserialize_object_url", skip_serializing_if = "Option::is_none")]
    pub in_reply_to: Option<Url>,
    #[serde(default, alias = "_misskey_quote", skip_serializing_if = "Option::is_none")]
    pub quote_url: Option<Url>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub published: Option<String>,
    /// Human-browsable location of this object
    #[serde(default, deserialize_with = "deserialize_object_url", skip_serializing_if = "Option::is_none")]
    pub url: Option<Url>,
    #[serde(default, deserialize_with = "deserialize_lossy_vec", skip_serializing_if = "Vec::is_empty")]
    pub tag: Vec<TagItem>,
    #[serde(default, deserialize_with = "deserialize_lossy_vec", skip_serializing_if = "Vec::is_empty")]
    pub attachment: Vec<Attachment>,
    /// Single-choice poll options
    #[serde(skip_serializing_if = "Option::is_none")]
    pub one_of: Option<Vec<QuestionOption>>,
    /// Multiple-choice poll options
    #[serde(skip_serializing_if = "Option::is_none")]
    pub any_of: Option<Vec<QuestionOption>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end_time: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub proxy_of: Option<ProxyOf>,
}

impl Note {
    /// Empty object of the given kind; the transmuter fills in the rest.
    pub fn empty(kind: &str, id: Url) -> Self {
        Note {
            kind: kind.to_string(),
            id,
            attributed_to: None,
            to: Vec::new(),
            cc: Vec::new(),
            content: String::new(),
            name: None,
            summary: None,
            sensitive: false,
            in_reply_to: None,
            quote_url: None,
            published: None,
            url: None,
            tag: Vec::new(),
            attachment: Vec::new(),
            one_of: None,
            any_of: None,
            end_time: None,
            proxy_of: None,
        }
    }

    /// Does the addressing include the public collection?
    pub fn is_public(&self) -> bool {
        let is_public = |addr: &String| {
            addr == crate::apub::PUBLIC || addr == "as:Public" || addr == "Public"
        };
        self.to.iter().any(is_public) || self.cc.iter().any(is_public)
    }
}

/// A remote document, discriminated by its `type` field.
///
/// Documents with types we cannot handle stay around as raw values so
/// nothing is silently lost.
#[derive(Clone, Debug)]
pub enum RemoteObject {
    Actor(Box<ActorDoc>),
    Note(Box<Note>),
    Article(Box<Note>),
    Question(Box<Note>),
    Activity(Box<Activity>),
    Unknown(Value),
}

impl RemoteObject {
    /// Classify a raw document by its `type` tag.
    pub fn from_value(value: Value) -> RemoteObject {
        let kind = value
            .get("type")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        match kind.as_str() {
            "Person" | "Service" | "Application" | "Organization" | "Group" => {
                match serde_json::from_value(value.clone()) {
                    Ok(actor) => RemoteObject::Actor(Box::new(actor)),
                    Err(_) => RemoteObject::Unknown(value),
                }
            }
            "Note" | "Page" => match serde_json::from_value(value.clone()) {
                Ok(note) => RemoteObject::Note(Box::new(note)),
                Err(_) => RemoteObject::Unknown(value),
            },
            "Article" => match serde_json::from_value(value.clone()) {
                Ok(note) => RemoteObject::Article(Box::new(note)),
                Err(_) => RemoteObject::Unknown(value),
            },
            "Question" => match serde_json::from_value(value.clone()) {
                Ok(note) => RemoteObject::Question(Box::new(note)),
                Err(_) => RemoteObject::Unknown(value),
            },
            "Create" | "Update" | "Delete" | "Follow" | "Accept" | "Reject" | "Like"
            | "EmojiReact" | "Announce" | "Undo" | "Move" => {
                match serde_json::from_value(value.clone()) {
                    Ok(activity) => RemoteObject::Activity(Box::new(activity)),
                    Err(_) => RemoteObject::Unknown(value),
                }
            }
            _ => RemoteObject::Unknown(value),
        }
    }

    /// The content object inside, for the three content-bearing variants.
    pub fn as_note(&self) -> Option<&Note> {
        match self {
            RemoteObject::Note(n) | RemoteObject::Article(n) | RemoteObject::Question(n) => Some(n),
            _ => None,
        }
    }

    /// The actor document inside, if this is one.
    pub fn as_actor(&self) -> Option<&ActorDoc> {
        match self {
            RemoteObject::Actor(a) => Some(a),
            _ => None,
        }
    }
}
