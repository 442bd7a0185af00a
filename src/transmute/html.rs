//! Flattening remote HTML content into relay-ready plain text

use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::HashSet;

static ANCHOR: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?s)<a[^>]*\bhref="([^"]+)"[^>]*>(.*?)</a>"#).expect("compile regex")
});
static BREAK: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)<br\s*/?>").expect("compile regex"));
static PARAGRAPH_CLOSE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)</p>\s*<p[^>]*>").expect("compile regex"));
static TAG: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?s)<[^>]*>").expect("compile regex"));

/// Decode the named and numeric entities that actually occur in fediverse
/// content.
pub fn decode_entities(text: &str) -> String {
    static NUMERIC: Lazy<Regex> =
        Lazy::new(|| Regex::new(r"&#(x?[0-9a-fA-F]+);").expect("compile regex"));
    let decoded = NUMERIC.replace_all(text, |caps: &regex::Captures| {
        let body = &caps[1];
        let code = if let Some(hex) = body.strip_prefix('x').or_else(|| body.strip_prefix('X')) {
            u32::from_str_radix(hex, 16).ok()
        } else {
            body.parse().ok()
        };
        code.and_then(char::from_u32)
            .map(String::from)
            .unwrap_or_else(|| caps[0].to_string())
    });
    decoded
        .replace("&nbsp;", " ")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&apos;", "'")
        .replace("&amp;", "&")
}

/// Result of flattening one HTML body.
pub struct PlainText {
    /// The visible text with structure collapsed to line breaks
    pub text: String,
    /// Urls that appeared only in `href` attributes, not in the visible
    /// text. Mention anchors and hashtag-search anchors are excluded.
    pub hidden_urls: Vec<String>,
}

/// Strip an HTML fragment to plain text.
///
/// Anchor targets that the visible text doesn't show (link shorteners,
/// "read more" cards) are collected so the caller can append them; without
/// that the relay-side reader loses the link entirely.
pub fn html_to_text(html: &str) -> PlainText {
    let mut hidden: Vec<String> = Vec::new();
    let mut seen: HashSet<String> = HashSet::new();

    let with_anchors = ANCHOR.replace_all(html, |caps: &regex::Captures| {
        let href = caps[1].to_string();
        let inner_html = &caps[2];
        let inner_text = decode_entities(&TAG.replace_all(inner_html, ""));
        let shown = inner_text.trim();
        if !shown.is_empty()
            && !href.contains(shown)
            && !is_mention_anchor(shown)
            && !is_hashtag_anchor(&href, shown)
            && seen.insert(href.clone())
        {
            hidden.push(href);
        }
        inner_text
    });

    let with_breaks = BREAK.replace_all(&with_anchors, "\n");
    let with_paragraphs = PARAGRAPH_CLOSE.replace_all(&with_breaks, "\n\n");
    let stripped = TAG.replace_all(&with_paragraphs, "");
    let text = decode_entities(&stripped).trim().to_string();

    PlainText {
        text,
        hidden_urls: hidden,
    }
}

fn is_mention_anchor(shown: &str) -> bool {
    shown.starts_with('@')
}

fn is_hashtag_anchor(href: &str, shown: &str) -> bool {
    shown.starts_with('#') || href.contains("/tags/") || href.contains("/tag/")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_basic_strip() {
        let result = html_to_text("<p>Hello <b>world</b></p>");
        assert_eq!(result.text, "Hello world");
        assert!(result.hidden_urls.is_empty());
    }

    #[test]
    fn test_paragraphs_and_breaks() {
        let result = html_to_text("<p>one<br>two</p><p>three</p>");
        assert_eq!(result.text, "one\ntwo\n\nthree");
    }

    #[test]
    fn test_entities() {
        let result = html_to_text("<p>a &amp; b &lt;c&gt; &#8217;quoted&#x2019;</p>");
        assert_eq!(result.text, "a & b <c> ’quoted’");
    }

    #[test]
    fn test_hidden_anchor_collected() {
        let html = r#"<p>check <a href="https://example.com/very/long/path">this post</a></p>"#;
        let result = html_to_text(html);
        assert_eq!(result.text, "check this post");
        assert_eq!(result.hidden_urls, vec!["https://example.com/very/long/path"]);
    }

    #[test]
    fn test_visible_url_not_collected() {
        let html = r#"<p><a href="https://example.com/page">https://example.com/page</a></p>"#;
        let result = html_to_text(html);
        assert_eq!(result.text, "https://example.com/page");
        assert!(result.hidden_urls.is_empty());
    }

    #[test]
    fn test_mention_and_hashtag_anchors_excluded() {
        let html = concat!(
            r#"<p><a href="https://mastodon.example/users/alice">@alice</a> "#,
            r#"<a href="https://mastodon.example/tags/rust">#rust</a> "#,
            r#"<a href="https://shortener.example/x">details</a></p>"#
        );
        let result = html_to_text(html);
        assert_eq!(result.hidden_urls, vec!["https://shortener.example/x"]);
    }

    #[test]
    fn test_mastodon_ellipsed_link() {
        // mastodon renders shortened urls with invisible spans
        let html = concat!(
            r#"<p><a href="https://example.com/articles/2026/a-very-long-slug">"#,
            r#"<span class="invisible">https://</span>"#,
            r#"<span class="ellipsis">example.com/articles/2026</span>"#,
            r#"<span class="invisible">/a-very-long-slug</span></a></p>"#
        );
        let result = html_to_text(html);
        assert_eq!(result.text, "https://example.com/articles/2026/a-very-long-slug");
    }
}
