//! Pure conversions between native events and federated activities
//!
//! Nothing in this module does I/O. Converters receive every remote fact
//! they need (resolved parent ids, mention targets) from the handlers and
//! return data for the handlers to sign, store and send.

use crate::{apub::ProxyOf, error::Error};
use chrono::{DateTime, SecondsFormat, Utc};
use nostr::{
    nips::nip19::ToBech32,
    Event, EventId, PublicKey, Tag, TagKind, Timestamp,
};

pub mod html;
pub mod markdown;
pub mod to_apub;
pub mod to_nostr;

/// Protocol name recorded in proxy tags on events mirrored in from the
/// fediverse.
pub const PROXY_PROTOCOL: &str = "activitypub";

/// Human-browsable redirector for inline native references.
pub fn reference_url(bech32: &str) -> String {
    format!("https://njump.me/{bech32}")
}

/// The loop-prevention tag placed on every event the bridge produces.
pub fn proxy_tag(foreign_id: &str) -> Tag {
    Tag::custom(
        TagKind::Custom("proxy".into()),
        [foreign_id.to_string(), PROXY_PROTOCOL.to_string()],
    )
}

/// Foreign object id recorded in an event's proxy tag, if it has one.
pub fn proxy_source(event: &Event) -> Option<&str> {
    event.tags.iter().find_map(|tag| {
        let values = tag.as_slice();
        if values.first().map(String::as_str) == Some("proxy") {
            values.get(1).map(String::as_str)
        } else {
            None
        }
    })
}

/// Whether this event was produced by a bridge and must not cross again.
pub fn has_proxy_tag(event: &Event) -> bool {
    proxy_source(event).is_some()
}

/// `proxyOf` block for a federated object mirroring the given native event.
pub fn proxy_of_event(event_id: &EventId) -> Result<ProxyOf, Error> {
    let bech = event_id
        .to_bech32()
        .map_err(|e| Error::Other(format!("bech32: {e}")))?;
    Ok(ProxyOf::nostr(bech))
}

/// `proxyOf` block for a federated actor mirroring the given native key.
pub fn proxy_of_pubkey(pubkey: &PublicKey) -> Result<ProxyOf, Error> {
    let bech = pubkey
        .to_bech32()
        .map_err(|e| Error::Other(format!("bech32: {e}")))?;
    Ok(ProxyOf::nostr(bech))
}

/// Build a tag from raw string values.
pub fn build_tag(values: &[&str]) -> Result<Tag, Error> {
    Tag::parse(values).map_err(|e| Error::Other(format!("tag {values:?}: {e}")))
}

/// Event timestamp formatted for the `published` field.
pub fn timestamp_rfc3339(timestamp: Timestamp) -> String {
    DateTime::<Utc>::from_timestamp(timestamp.as_u64() as i64, 0)
        .unwrap_or_else(Utc::now)
        .to_rfc3339_opts(SecondsFormat::Secs, true)
}

/// Parse a remote `published` value, falling back to now.
pub fn parse_published(published: Option<&str>) -> Timestamp {
    published
        .and_then(|raw| DateTime::parse_from_rfc3339(raw).ok())
        .map(|dt| Timestamp::from(dt.timestamp().max(0) as u64))
        .unwrap_or_else(Timestamp::now)
}

/// Is this reaction content an emoji rather than a plain `+` style like?
///
/// Checks the Unicode blocks emoji actually live in. Symbols near block
/// boundaries (misc-technical arrows) may land on either side; both map to
/// a reaction, so the stakes are display only.
pub fn is_emoji(content: &str) -> bool {
    let trimmed = content.trim();
    !trimmed.is_empty()
        && trimmed.chars().all(|c| {
            matches!(u32::from(c),
                0x1F000..=0x1FAFF   // emoji, symbols, pictographs
                | 0x2600..=0x27BF   // misc symbols, dingbats
                | 0x2190..=0x21FF   // arrows
                | 0x2300..=0x23FF   // misc technical
                | 0x2B00..=0x2BFF   // arrows and shapes
                | 0xFE00..=0xFE0F   // variation selectors
                | 0x200D..=0x200D   // zero-width joiner
                | 0x1F1E6..=0x1F1FF // regional indicators
            )
        })
}

/// The threading references carried in a native event's `e`/`q` tags.
#[derive(Debug, Default, PartialEq)]
pub struct EventRefs {
    /// Direct parent
    pub reply: Option<String>,
    /// Thread root
    pub root: Option<String>,
    /// Quoted event
    pub quote: Option<String>,
}

/// Extract reply/root/quote references from an event.
///
/// Explicit `reply`/`root` markers win; for marker-less legacy tags the
/// earliest `e` tag is the root and the latest the direct parent.
pub fn event_refs(event: &Event) -> EventRefs {
    let mut refs = EventRefs::default();
    let mut unmarked: Vec<String> = Vec::new();
    for tag in event.tags.iter() {
        let values = tag.as_slice();
        match values.first().map(String::as_str) {
            Some("e") => {
                let Some(id) = values.get(1) else { continue };
                match values.get(3).map(String::as_str) {
                    Some("reply") => refs.reply = Some(id.clone()),
                    Some("root") => refs.root = Some(id.clone()),
                    Some("mention") => {}
                    _ => unmarked.push(id.clone()),
                }
            }
            Some("q") => {
                if let Some(id) = values.get(1) {
                    refs.quote = Some(id.clone());
                }
            }
            _ => {}
        }
    }
    if refs.reply.is_none() && refs.root.is_none() && !unmarked.is_empty() {
        refs.root = unmarked.first().cloned();
        refs.reply = unmarked.last().cloned();
    }
    refs
}
