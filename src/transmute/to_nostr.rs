//! Converting federated activities into native event builders
//!
//! Builders come back unsigned; the activity handler picks the signing key
//! (operator or derived) and publishes.

use crate::{
    apub::{
        actor::ActorDoc,
        object::{Note, TagItem},
    },
    error::Error,
    transmute::{build_tag, html::html_to_text, parse_published, proxy_tag},
};
use nostr::{EventBuilder, Kind, PublicKey, Tag};
use url::Url;

/// Native facts a note conversion needs, resolved by the caller.
#[derive(Default)]
pub struct InboundRefs {
    /// Native id (hex) of the direct parent, for replies
    pub reply_parent: Option<String>,
    /// Native id (hex) of the thread root, when known and distinct
    pub root: Option<String>,
    /// Native id (hex) of the quoted event
    pub quote: Option<String>,
    /// Derived keys of mentioned actors
    pub mentions: Vec<PublicKey>,
}

/// Federated `Note` into a kind-1 short note builder.
pub fn note_event_from_note(note: &Note, refs: InboundRefs) -> Result<EventBuilder, Error> {
    let flattened = html_to_text(&note.content);
    let mut content = flattened.text;

    let mut tags: Vec<Tag> = Vec::new();
    tags.push(proxy_tag(note.id.as_str()));

    if let Some(parent) = &refs.reply_parent {
        match &refs.root {
            Some(root) if root != parent => {
                tags.push(build_tag(&["e", root, "", "root"])?);
                tags.push(build_tag(&["e", parent, "", "reply"])?);
            }
            _ => tags.push(build_tag(&["e", parent, "", "reply"])?),
        }
    }
    if let Some(quote) = &refs.quote {
        tags.push(build_tag(&["q", quote])?);
    }
    for pubkey in &refs.mentions {
        tags.push(Tag::public_key(*pubkey));
    }

    if note.sensitive || note.summary.is_some() {
        match &note.summary {
            Some(summary) if !summary.is_empty() => {
                tags.push(build_tag(&["content-warning", summary])?);
            }
            _ => tags.push(build_tag(&["content-warning"])?),
        }
    }

    for item in &note.tag {
        match item {
            TagItem::Hashtag { name, .. } => {
                let bare = name.trim_start_matches('#').to_lowercase();
                if !bare.is_empty() {
                    tags.push(build_tag(&["t", &bare])?);
                }
            }
            TagItem::Emoji { name, icon } => {
                if let Some(icon) = icon {
                    let shortcode = name.trim_matches(':');
                    tags.push(build_tag(&["emoji", shortcode, icon.url.as_str()])?);
                }
            }
            TagItem::Mention { .. } => {}
        }
    }

    for attachment in &note.attachment {
        let Some(target) = attachment.target() else {
            continue;
        };
        if attachment.is_media() {
            let mut entries = vec![format!("url {target}")];
            if let Some(media_type) = &attachment.media_type {
                entries.push(format!("m {media_type}"));
            }
            if let Some(alt) = &attachment.name {
                entries.push(format!("alt {alt}"));
            }
            let mut values = vec!["imeta".to_string()];
            values.extend(entries);
            let refs: Vec<&str> = values.iter().map(String::as_str).collect();
            tags.push(build_tag(&refs)?);
            if !content.contains(target.as_str()) {
                content.push_str(&format!("\n{target}"));
            }
        } else if !content.contains(target.as_str()) {
            content.push_str(&format!("\n{target}"));
        }
    }

    for hidden in &flattened.hidden_urls {
        if !content.contains(hidden) {
            content.push_str(&format!("\n{hidden}"));
        }
    }

    Ok(EventBuilder::new(Kind::TextNote, content, tags)
        .custom_created_at(parse_published(note.published.as_deref())))
}

/// `Announce` into a kind-6 repost builder.
pub fn repost_from_announce(
    foreign_id: &Url,
    target_native_hex: &str,
    target_author: Option<PublicKey>,
) -> Result<EventBuilder, Error> {
    let mut tags = vec![
        proxy_tag(foreign_id.as_str()),
        build_tag(&["e", target_native_hex])?,
    ];
    if let Some(author) = target_author {
        tags.push(Tag::public_key(author));
    }
    Ok(EventBuilder::new(Kind::Repost, "", tags))
}

/// `Like` or `EmojiReact` into a kind-7 reaction builder.
pub fn reaction_event(
    foreign_id: &Url,
    target_native_hex: &str,
    content: &str,
) -> Result<EventBuilder, Error> {
    let tags = vec![
        proxy_tag(foreign_id.as_str()),
        build_tag(&["e", target_native_hex])?,
    ];
    Ok(EventBuilder::new(Kind::Reaction, content, tags))
}

/// `Delete` into a kind-5 deletion builder.
pub fn deletion_event(foreign_id: &Url, target_native_hex: &str) -> Result<EventBuilder, Error> {
    let tags = vec![
        proxy_tag(foreign_id.as_str()),
        build_tag(&["e", target_native_hex])?,
    ];
    Ok(EventBuilder::new(Kind::EventDeletion, "", tags))
}

/// Remote actor profile into a kind-0 metadata builder.
///
/// The `nip05` points at the bridge's own name endpoint, which resolves
/// `user_at_host` names, so derived identities verify against us.
pub fn metadata_from_actor(actor: &ActorDoc, bridge_domain: &str) -> Result<EventBuilder, Error> {
    let mut metadata = serde_json::Map::new();
    if let Some(username) = &actor.preferred_username {
        metadata.insert("name".to_string(), username.clone().into());
        if let Some(host) = actor.id.host_str() {
            metadata.insert(
                "nip05".to_string(),
                format!("{username}_at_{host}@{bridge_domain}").into(),
            );
        }
    }
    if let Some(name) = &actor.name {
        metadata.insert("display_name".to_string(), name.clone().into());
    }
    if let Some(summary) = &actor.summary {
        metadata.insert("about".to_string(), html_to_text(summary).text.into());
    }
    if let Some(icon) = &actor.icon {
        metadata.insert("picture".to_string(), icon.url.to_string().into());
    }
    if let Some(image) = &actor.image {
        metadata.insert("banner".to_string(), image.url.to_string().into());
    }

    let content = serde_json::to_string(&metadata).map_err(Error::MalformedActivity)?;
    Ok(EventBuilder::new(Kind::Metadata, content, [proxy_tag(actor.id.as_str())]))
}

/// The bridge's relay set as a kind-10002 relay list builder, published
/// alongside derived profile metadata.
pub fn relay_list_event(foreign_id: &Url, relays: &[String]) -> Result<EventBuilder, Error> {
    let mut tags = vec![proxy_tag(foreign_id.as_str())];
    for relay in relays {
        tags.push(build_tag(&["r", relay])?);
    }
    Ok(EventBuilder::new(Kind::RelayList, "", tags))
}

#[cfg(test)]
mod tests {
    use super::*;
    use nostr::{Event, Keys};

    fn sign(builder: EventBuilder) -> Event {
        builder.sign_with_keys(&Keys::generate()).unwrap()
    }

    fn sample_note(content: &str) -> Note {
        let mut note = Note::empty("Note", Url::parse("https://mastodon.example/notes/1").unwrap());
        note.content = content.to_string();
        note.published = Some("2023-11-14T22:13:20Z".to_string());
        note
    }

    fn tag_values(event: &Event, key: &str) -> Vec<Vec<String>> {
        event
            .tags
            .iter()
            .map(|t| t.as_slice().to_vec())
            .filter(|v| v.first().map(String::as_str) == Some(key))
            .collect()
    }

    #[test]
    fn test_proxy_tag_always_present() {
        let note = sample_note("<p>hi</p>");
        let event = sign(note_event_from_note(&note, InboundRefs::default()).unwrap());
        let proxies = tag_values(&event, "proxy");
        assert_eq!(proxies.len(), 1);
        assert_eq!(proxies[0][1], "https://mastodon.example/notes/1");
        assert_eq!(proxies[0][2], "activitypub");
        assert_eq!(event.created_at.as_u64(), 1700000000);
    }

    #[test]
    fn test_reply_and_root_markers() {
        let note = sample_note("<p>reply</p>");
        let refs = InboundRefs {
            reply_parent: Some("bb".repeat(32)),
            root: Some("aa".repeat(32)),
            ..Default::default()
        };
        let event = sign(note_event_from_note(&note, refs).unwrap());
        let e_tags = tag_values(&event, "e");
        assert_eq!(e_tags.len(), 2);
        assert_eq!(e_tags[0][3], "root");
        assert_eq!(e_tags[1][3], "reply");
    }

    #[test]
    fn test_full_note_roundtrip_fields() {
        let mut note = sample_note("<p>all the trimmings</p>");
        note.summary = Some("cw".to_string());
        note.sensitive = true;
        note.tag.push(TagItem::Hashtag {
            href: None,
            name: "#Rust".to_string(),
        });
        note.attachment.push(crate::apub::object::Attachment {
            kind: "Document".to_string(),
            media_type: Some("image/png".to_string()),
            url: Some(Url::parse("https://img.example/shot.png").unwrap()),
            href: None,
            name: None,
        });
        let refs = InboundRefs {
            quote: Some("cc".repeat(32)),
            mentions: vec![Keys::generate().public_key()],
            ..Default::default()
        };
        let event = sign(note_event_from_note(&note, refs).unwrap());

        assert_eq!(tag_values(&event, "content-warning")[0][1], "cw");
        assert_eq!(tag_values(&event, "t")[0][1], "rust");
        assert_eq!(tag_values(&event, "q").len(), 1);
        assert_eq!(tag_values(&event, "p").len(), 1);
        let imeta = &tag_values(&event, "imeta")[0];
        assert!(imeta.contains(&"url https://img.example/shot.png".to_string()));
        assert!(imeta.contains(&"m image/png".to_string()));
        assert!(event.content.contains("https://img.example/shot.png"));
    }

    #[test]
    fn test_hidden_urls_appended() {
        let note = sample_note(
            r#"<p>read <a href="https://blog.example/post">my post</a></p>"#,
        );
        let event = sign(note_event_from_note(&note, InboundRefs::default()).unwrap());
        assert_eq!(event.content, "read my post\nhttps://blog.example/post");
    }

    #[test]
    fn test_link_card_appended_without_imeta() {
        let mut note = sample_note("<p>card</p>");
        note.attachment.push(crate::apub::object::Attachment {
            kind: "Link".to_string(),
            media_type: None,
            url: None,
            href: Some(Url::parse("https://news.example/story").unwrap()),
            name: None,
        });
        let event = sign(note_event_from_note(&note, InboundRefs::default()).unwrap());
        assert!(tag_values(&event, "imeta").is_empty());
        assert!(event.content.ends_with("https://news.example/story"));
    }

    #[test]
    fn test_metadata_from_actor() {
        let actor: ActorDoc = serde_json::from_str(
            r#"{
                "id": "https://mastodon.example/users/alice",
                "type": "Person",
                "preferredUsername": "alice",
                "name": "Alice",
                "summary": "<p>I toot</p>",
                "inbox": "https://mastodon.example/users/alice/inbox",
                "icon": {"type": "Image", "url": "https://mastodon.example/avatar.png"}
            }"#,
        )
        .unwrap();
        let event = sign(metadata_from_actor(&actor, "bridge.example").unwrap());
        assert_eq!(event.kind, Kind::Metadata);
        let metadata: serde_json::Value = serde_json::from_str(&event.content).unwrap();
        assert_eq!(metadata["name"], "alice");
        assert_eq!(metadata["display_name"], "Alice");
        assert_eq!(metadata["about"], "I toot");
        assert_eq!(metadata["nip05"], "alice_at_mastodon.example@bridge.example");
        assert!(!tag_values(&event, "proxy").is_empty());
    }

    #[test]
    fn test_relay_list() {
        let foreign = Url::parse("https://mastodon.example/users/alice").unwrap();
        let relays = vec!["wss://a.example".to_string(), "wss://b.example".to_string()];
        let event = sign(relay_list_event(&foreign, &relays).unwrap());
        assert_eq!(event.kind, Kind::RelayList);
        assert_eq!(tag_values(&event, "r").len(), 2);
    }

    #[test]
    fn test_reaction_and_deletion_and_repost() {
        let foreign = Url::parse("https://mastodon.example/activities/1").unwrap();
        let target = "ab".repeat(32);

        let like = sign(reaction_event(&foreign, &target, "+").unwrap());
        assert_eq!(like.kind, Kind::Reaction);
        assert_eq!(like.content, "+");

        let deletion = sign(deletion_event(&foreign, &target).unwrap());
        assert_eq!(deletion.kind, Kind::EventDeletion);
        assert_eq!(tag_values(&deletion, "e")[0][1], target);

        let author = Keys::generate().public_key();
        let repost = sign(repost_from_announce(&foreign, &target, Some(author)).unwrap());
        assert_eq!(repost.kind, Kind::Repost);
        assert_eq!(tag_values(&repost, "e")[0][1], target);
        assert_eq!(tag_values(&repost, "p").len(), 1);
    }
}
