//! Converting native events into federated activities

use crate::{
    apub::{
        activity::Activity,
        actor::{ActorDoc, Endpoints, Image, PublicKey as ApubPublicKey},
        object::{Attachment, Note, QuestionOption, TagItem},
        PUBLIC,
    },
    config::BridgeConfig,
    error::Error,
    transmute::{
        markdown::{self, escape_html},
        proxy_of_event, proxy_of_pubkey, reference_url, timestamp_rfc3339,
    },
};
use nostr::{nips::nip19::ToBech32, Event};
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;
use url::Url;

static NOSTR_REF: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?:nostr:)?\b((?:note|npub|nevent|nprofile|naddr)1[02-9ac-hj-np-z]+)")
        .expect("compile regex")
});

/// Remote facts a note conversion needs, resolved by the caller.
#[derive(Default)]
pub struct OutboundRefs {
    /// Federated id of the event this one replies to
    pub in_reply_to: Option<Url>,
    /// Federated id of the quoted event
    pub quote: Option<Url>,
    /// Mentioned actors: `(actor url, @handle)`
    pub mentions: Vec<(Url, String)>,
}

/// Render native plain text into the HTML remote platforms display.
///
/// Inline bech32 references become links to a human-browsable redirector.
pub fn render_content_html(content: &str) -> String {
    let escaped = escape_html(content);
    let linked = NOSTR_REF.replace_all(&escaped, |caps: &regex::Captures| {
        let bech = &caps[1];
        format!(r#"<a href="{}">{}</a>"#, reference_url(bech), bech)
    });
    let paragraphs: Vec<String> = linked
        .split("\n\n")
        .map(|p| p.replace('\n', "<br>"))
        .collect();
    paragraphs
        .iter()
        .map(|p| format!("<p>{p}</p>"))
        .collect::<String>()
}

/// True when a short note is nothing but a reference to the quoted event,
/// which federates better as an `Announce` than as an empty `Create`.
pub fn is_bare_repost(event: &Event, quote: Option<&str>) -> bool {
    if quote.is_none() {
        return false;
    }
    let content = event.content.trim();
    content.is_empty() || NOSTR_REF.replace_all(content, "").trim().is_empty()
}

/// Kind-1 short note into a federated `Note`.
pub fn note_from_event(
    config: &BridgeConfig,
    event: &Event,
    refs: OutboundRefs,
) -> Result<Note, Error> {
    let mut note = Note::empty("Note", config.object_url(&event.id.to_hex()));
    note.attributed_to = Some(config.actor_url());
    note.to = vec![PUBLIC.to_string()];
    note.cc = vec![config.followers_url().to_string()];
    note.published = Some(timestamp_rfc3339(event.created_at));
    note.in_reply_to = refs.in_reply_to;
    note.quote_url = refs.quote;
    note.proxy_of = Some(proxy_of_event(&event.id)?);

    let mut content = event.content.clone();
    if config.show_source_link {
        let bech = event
            .id
            .to_bech32()
            .map_err(|e| Error::Other(format!("bech32: {e}")))?;
        content.push_str(&format!("\n\n{}", reference_url(&bech)));
    }
    note.content = render_content_html(&content);

    for (href, handle) in refs.mentions {
        note.tag.push(TagItem::Mention {
            href,
            name: Some(handle),
        });
    }

    for tag in event.tags.iter() {
        let values = tag.as_slice();
        match values.first().map(String::as_str) {
            Some("t") => {
                if let Some(name) = values.get(1) {
                    note.tag.push(TagItem::Hashtag {
                        href: Some(config.tag_url(name)),
                        name: format!("#{name}"),
                    });
                }
            }
            Some("content-warning") => {
                note.sensitive = true;
                note.summary = values.get(1).cloned().filter(|s| !s.is_empty());
            }
            Some("emoji") => {
                if let (Some(shortcode), Some(image)) = (values.get(1), values.get(2)) {
                    if let Ok(url) = Url::parse(image) {
                        note.tag.push(TagItem::Emoji {
                            name: format!(":{shortcode}:"),
                            icon: Some(Image::new(url)),
                        });
                    }
                }
            }
            Some("imeta") => {
                if let Some(attachment) = attachment_from_imeta(values) {
                    note.attachment.push(attachment);
                }
            }
            _ => {}
        }
    }
    Ok(note)
}

/// `imeta` tags carry space-separated `key value` pairs per element.
fn attachment_from_imeta(values: &[String]) -> Option<Attachment> {
    let mut url = None;
    let mut media_type = None;
    let mut alt = None;
    for entry in &values[1..] {
        let (key, value) = entry.split_once(' ')?;
        match key {
            "url" => url = Url::parse(value).ok(),
            "m" => media_type = Some(value.to_string()),
            "alt" => alt = Some(value.to_string()),
            _ => {}
        }
    }
    Some(Attachment {
        kind: "Document".to_string(),
        media_type,
        url: Some(url?),
        href: None,
        name: alt,
    })
}

/// Kind-1068 poll into a federated `Question`.
pub fn question_from_event(config: &BridgeConfig, event: &Event) -> Result<Note, Error> {
    let mut note = Note::empty("Question", config.object_url(&event.id.to_hex()));
    note.attributed_to = Some(config.actor_url());
    note.to = vec![PUBLIC.to_string()];
    note.cc = vec![config.followers_url().to_string()];
    note.published = Some(timestamp_rfc3339(event.created_at));
    note.proxy_of = Some(proxy_of_event(&event.id)?);
    note.content = render_content_html(&event.content);

    let mut options = Vec::new();
    let mut multiple_choice = false;
    for tag in event.tags.iter() {
        let values = tag.as_slice();
        match values.first().map(String::as_str) {
            Some("option") => {
                // ["option", id, label]
                if let Some(label) = values.get(2).or_else(|| values.get(1)) {
                    options.push(QuestionOption {
                        kind: "Note".to_string(),
                        name: label.clone(),
                    });
                }
            }
            Some("polltype") => {
                multiple_choice = values.get(1).map(String::as_str) == Some("multiplechoice");
            }
            Some("endsAt") => {
                if let Some(ts) = values.get(1).and_then(|v| v.parse::<u64>().ok()) {
                    note.end_time = Some(timestamp_rfc3339(nostr::Timestamp::from(ts)));
                }
            }
            _ => {}
        }
    }
    if multiple_choice {
        note.any_of = Some(options);
    } else {
        note.one_of = Some(options);
    }
    Ok(note)
}

/// Kind-30023 long-form markdown into a federated `Article`.
pub fn article_from_event(
    config: &BridgeConfig,
    event: &Event,
    refs: OutboundRefs,
) -> Result<Note, Error> {
    let mut note = Note::empty("Article", config.object_url(&event.id.to_hex()));
    note.attributed_to = Some(config.actor_url());
    note.to = vec![PUBLIC.to_string()];
    note.cc = vec![config.followers_url().to_string()];
    note.in_reply_to = refs.in_reply_to;
    note.proxy_of = Some(proxy_of_event(&event.id)?);
    note.content = markdown::render(&event.content);

    let mut published = None;
    for tag in event.tags.iter() {
        let values = tag.as_slice();
        match values.first().map(String::as_str) {
            Some("title") => note.name = values.get(1).cloned(),
            Some("summary") => note.summary = values.get(1).cloned(),
            Some("published_at") => {
                published = values
                    .get(1)
                    .and_then(|v| v.parse::<u64>().ok())
                    .map(|ts| timestamp_rfc3339(nostr::Timestamp::from(ts)));
            }
            Some("t") => {
                if let Some(name) = values.get(1) {
                    note.tag.push(TagItem::Hashtag {
                        href: Some(config.tag_url(name)),
                        name: format!("#{name}"),
                    });
                }
            }
            _ => {}
        }
    }
    note.published = Some(published.unwrap_or_else(|| timestamp_rfc3339(event.created_at)));
    Ok(note)
}

/// Wrap a content object in its `Create` activity.
pub fn create_activity(config: &BridgeConfig, note: Note) -> Result<Activity, Error> {
    let id = Url::parse(&format!("{}#create", note.id))?;
    let mut activity = Activity::new(
        "Create",
        id,
        config.actor_url(),
        serde_json::to_value(&note).map_err(Error::MalformedActivity)?,
    );
    activity.published = note.published.clone();
    activity.to = note.to.clone();
    activity.cc = note.cc.clone();
    Ok(activity)
}

/// The operator's actor document, synthesized from configuration and the
/// latest kind-0 profile content when one is known.
pub fn local_actor_doc(
    config: &BridgeConfig,
    metadata: Option<&Value>,
    operator_pubkey: &nostr::PublicKey,
) -> Result<ActorDoc, Error> {
    let actor_url = config.actor_url();
    let field = |name: &str| -> Option<String> {
        metadata?
            .get(name)
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
    };
    let image_field = |name: &str| -> Option<Image> {
        field(name)
            .and_then(|raw| Url::parse(&raw).ok())
            .map(Image::new)
    };

    Ok(ActorDoc {
        id: actor_url.clone(),
        kind: "Person".to_string(),
        preferred_username: Some(config.username.clone()),
        name: field("display_name").or_else(|| field("name")),
        summary: field("about").map(|about| render_content_html(&about)),
        inbox: config.local_url.join("inbox")?,
        outbox: Some(config.local_url.join(&format!("users/{}/outbox", config.username))?),
        followers: Some(config.followers_url()),
        following: Some(
            config
                .local_url
                .join(&format!("users/{}/following", config.username))?,
        ),
        endpoints: Some(Endpoints {
            shared_inbox: Some(config.local_url.join("inbox")?),
        }),
        public_key: Some(ApubPublicKey::new(
            actor_url,
            config.keypair.public_key.clone(),
        )),
        icon: image_field("picture"),
        image: image_field("banner"),
        tag: Vec::new(),
        published: None,
        proxy_of: Some(proxy_of_pubkey(operator_pubkey)?),
    })
}

/// Kind-0 profile metadata into an `Update(Person)` for the local actor.
pub fn update_from_metadata(config: &BridgeConfig, event: &Event) -> Result<Activity, Error> {
    let metadata: Value = serde_json::from_str(&event.content)?;
    let actor_url = config.actor_url();
    let mut actor = local_actor_doc(config, Some(&metadata), &event.pubkey)?;
    for tag in event.tags.iter() {
        let values = tag.as_slice();
        if values.first().map(String::as_str) == Some("emoji") {
            if let (Some(shortcode), Some(image)) = (values.get(1), values.get(2)) {
                if let Ok(url) = Url::parse(image) {
                    actor.tag.push(TagItem::Emoji {
                        name: format!(":{shortcode}:"),
                        icon: Some(Image::new(url)),
                    });
                }
            }
        }
    }

    let id = Url::parse(&format!("{actor_url}#updates/{}", event.created_at.as_u64()))?;
    let mut activity = Activity::new(
        "Update",
        id,
        actor_url,
        serde_json::to_value(&actor).map_err(Error::MalformedActivity)?,
    );
    activity.to = vec![PUBLIC.to_string()];
    activity.cc = vec![config.followers_url().to_string()];
    Ok(activity)
}

/// Kind-5 deletion into a `Delete` for the previously bridged object.
pub fn delete_activity(
    config: &BridgeConfig,
    event: &Event,
    foreign_object_id: &Url,
) -> Result<Activity, Error> {
    let id = Url::parse(&format!(
        "{}#delete",
        config.object_url(&event.id.to_hex())
    ))?;
    let mut activity = Activity::new(
        "Delete",
        id,
        config.actor_url(),
        Value::String(foreign_object_id.to_string()),
    );
    activity.to = vec![PUBLIC.to_string()];
    Ok(activity)
}

/// Kind-6 repost (or a bare quote note) into an `Announce`.
pub fn announce_activity(
    config: &BridgeConfig,
    event: &Event,
    target: &Url,
) -> Result<Activity, Error> {
    let id = Url::parse(&format!(
        "{}#announce",
        config.object_url(&event.id.to_hex())
    ))?;
    let mut activity = Activity::new(
        "Announce",
        id,
        config.actor_url(),
        Value::String(target.to_string()),
    );
    activity.to = vec![PUBLIC.to_string()];
    activity.cc = vec![config.followers_url().to_string()];
    Ok(activity)
}

/// Kind-7 reaction into `Like` or `EmojiReact`.
pub fn reaction_activity(
    config: &BridgeConfig,
    event: &Event,
    target: &Url,
) -> Result<Activity, Error> {
    let id = Url::parse(&format!(
        "{}#react",
        config.object_url(&event.id.to_hex())
    ))?;
    let content = event.content.trim();
    let kind = if content.is_empty() || content == "+" {
        "Like"
    } else {
        "EmojiReact"
    };
    let mut activity = Activity::new(kind, id, config.actor_url(), Value::String(target.to_string()));
    if kind == "EmojiReact" {
        activity.content = Some(content.to_string());
        // a custom emoji reaction carries its image along
        for tag in event.tags.iter() {
            let values = tag.as_slice();
            if values.first().map(String::as_str) == Some("emoji") {
                if let (Some(shortcode), Some(image)) = (values.get(1), values.get(2)) {
                    if let Ok(url) = Url::parse(image) {
                        activity.tag.push(TagItem::Emoji {
                            name: format!(":{shortcode}:"),
                            icon: Some(Image::new(url)),
                        });
                    }
                }
            }
        }
    }
    Ok(activity)
}

/// Kind-9735 zap receipt into the namespace-extended `Zap` activity.
///
/// The receipt embeds the zap request; its amount and comment become the
/// display content, `⚡ <sats> sats`.
pub fn zap_activity(
    config: &BridgeConfig,
    event: &Event,
    target: Option<&Url>,
) -> Result<Activity, Error> {
    let request: Option<Value> = event
        .tags
        .iter()
        .find_map(|tag| {
            let values = tag.as_slice();
            if values.first().map(String::as_str) == Some("description") {
                values.get(1).and_then(|raw| serde_json::from_str(raw).ok())
            } else {
                None
            }
        });

    let amount_msat = request
        .as_ref()
        .and_then(|req| req.get("tags"))
        .and_then(Value::as_array)
        .and_then(|tags| {
            tags.iter().find_map(|tag| {
                let entry = tag.as_array()?;
                if entry.first()?.as_str()? == "amount" {
                    entry.get(1)?.as_str()?.parse::<u64>().ok()
                } else {
                    None
                }
            })
        });
    let comment = request
        .as_ref()
        .and_then(|req| req.get("content"))
        .and_then(Value::as_str)
        .filter(|c| !c.is_empty());

    let mut content = match amount_msat {
        Some(msat) => format!("⚡ {} sats", msat / 1000),
        None => "⚡ zap".to_string(),
    };
    if let Some(comment) = comment {
        content.push_str(&format!(" · {comment}"));
    }

    let id = Url::parse(&format!("{}#zap", config.object_url(&event.id.to_hex())))?;
    let object = match target {
        Some(url) => Value::String(url.to_string()),
        None => Value::Null,
    };
    let mut activity = Activity::new("Zap", id, config.actor_url(), object);
    activity.content = Some(content);
    activity.to = vec![PUBLIC.to_string()];
    Ok(activity)
}
