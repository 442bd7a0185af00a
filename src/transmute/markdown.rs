//! Rendering of long-form markdown into the HTML subset remote platforms
//! display
//!
//! Covers what long-form native articles actually use: fenced code blocks,
//! headings H1-H3, paragraphs with line breaks, links, inline code, bold,
//! italic and horizontal rules. Anything else passes through as text.

use once_cell::sync::Lazy;
use regex::Regex;

static LINK: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\[([^\]]+)\]\(([^)\s]+)\)").expect("compile regex"));
static BOLD: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\*\*([^*]+)\*\*").expect("compile regex"));
static ITALIC: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\*([^*]+)\*|_([^_]+)_").expect("compile regex"));
static INLINE_CODE: Lazy<Regex> = Lazy::new(|| Regex::new(r"`([^`]+)`").expect("compile regex"));
static BARE_URL: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?:^|\s)(https?://[^\s<]+)").expect("compile regex"));

/// Escape the characters HTML cares about.
pub fn escape_html(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

/// Render a markdown document to HTML.
pub fn render(markdown: &str) -> String {
    let mut html = String::new();
    let mut paragraph: Vec<String> = Vec::new();
    let mut code_block: Option<Vec<String>> = None;

    let flush_paragraph = |html: &mut String, paragraph: &mut Vec<String>| {
        if paragraph.is_empty() {
            return;
        }
        let body = paragraph
            .iter()
            .map(|line| render_inline(line))
            .collect::<Vec<_>>()
            .join("<br>");
        html.push_str(&format!("<p>{body}</p>"));
        paragraph.clear();
    };

    for line in markdown.lines() {
        if let Some(ref mut code) = code_block {
            if line.trim_start().starts_with("```") {
                html.push_str(&format!("<pre><code>{}</code></pre>", escape_html(&code.join("\n"))));
                code_block = None;
            } else {
                code.push(line.to_string());
            }
            continue;
        }
        let trimmed = line.trim_end();
        if trimmed.trim_start().starts_with("```") {
            flush_paragraph(&mut html, &mut paragraph);
            code_block = Some(Vec::new());
            continue;
        }
        if trimmed.is_empty() {
            flush_paragraph(&mut html, &mut paragraph);
            continue;
        }
        if trimmed == "---" || trimmed == "***" {
            flush_paragraph(&mut html, &mut paragraph);
            html.push_str("<hr>");
            continue;
        }
        if let Some(heading) = trimmed.strip_prefix("### ") {
            flush_paragraph(&mut html, &mut paragraph);
            html.push_str(&format!("<h3>{}</h3>", render_inline(heading)));
            continue;
        }
        if let Some(heading) = trimmed.strip_prefix("## ") {
            flush_paragraph(&mut html, &mut paragraph);
            html.push_str(&format!("<h2>{}</h2>", render_inline(heading)));
            continue;
        }
        if let Some(heading) = trimmed.strip_prefix("# ") {
            flush_paragraph(&mut html, &mut paragraph);
            html.push_str(&format!("<h1>{}</h1>", render_inline(heading)));
            continue;
        }
        paragraph.push(trimmed.to_string());
    }
    if let Some(code) = code_block {
        // unterminated fence, keep the content anyway
        html.push_str(&format!("<pre><code>{}</code></pre>", escape_html(&code.join("\n"))));
    }
    flush_paragraph(&mut html, &mut paragraph);
    html
}

fn render_inline(line: &str) -> String {
    // inline code is opaque: protect it from the other passes by rendering
    // it first on the escaped text
    let escaped = escape_html(line);
    let with_code = INLINE_CODE.replace_all(&escaped, "<code>$1</code>");
    let with_links = LINK.replace_all(&with_code, r#"<a href="$2">$1</a>"#);
    let with_bare = BARE_URL.replace_all(&with_links, |caps: &regex::Captures| {
        let url = &caps[1];
        let lead = caps[0].strip_suffix(url).unwrap_or_default();
        format!(r#"{lead}<a href="{url}">{url}</a>"#)
    });
    let with_bold = BOLD.replace_all(&with_bare, "<strong>$1</strong>");
    ITALIC
        .replace_all(&with_bold, |caps: &regex::Captures| {
            let inner = caps
                .get(1)
                .or_else(|| caps.get(2))
                .map(|m| m.as_str())
                .unwrap_or_default();
            format!("<em>{inner}</em>")
        })
        .into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_paragraphs_and_breaks() {
        let html = render("first line\nsecond line\n\nnew paragraph");
        assert_eq!(
            html,
            "<p>first line<br>second line</p><p>new paragraph</p>"
        );
    }

    #[test]
    fn test_headings() {
        let html = render("# Title\n## Section\n### Sub\nbody");
        assert_eq!(
            html,
            "<h1>Title</h1><h2>Section</h2><h3>Sub</h3><p>body</p>"
        );
    }

    #[test]
    fn test_fenced_code_is_escaped_verbatim() {
        let html = render("```\nlet x = a < b && *c*;\n```");
        assert_eq!(
            html,
            "<pre><code>let x = a &lt; b &amp;&amp; *c*;</code></pre>"
        );
    }

    #[test]
    fn test_inline_markup() {
        let html = render("**bold** and *italic* and `code` and [a link](https://example.com)");
        assert!(html.contains("<strong>bold</strong>"));
        assert!(html.contains("<em>italic</em>"));
        assert!(html.contains("<code>code</code>"));
        assert!(html.contains(r#"<a href="https://example.com">a link</a>"#));
    }

    #[test]
    fn test_horizontal_rule() {
        assert_eq!(render("above\n\n---\n\nbelow"), "<p>above</p><hr><p>below</p>");
    }

    #[test]
    fn test_bare_url_becomes_link() {
        let html = render("see https://example.com/page for details");
        assert!(html.contains(r#"<a href="https://example.com/page">"#));
    }
}
