//! HTML to readable plain text
//!
//! Sanitizes with `ammonia` (images, scripts and styles removed), renders with
//! `html2text`'s rich decorator so link targets can be kept as `text [href]`,
//! then shortens overlong bracketed URLs.

use std::sync::LazyLock;

use html2text::render::RichAnnotation;
use regex::{Captures, Regex};

use crate::mime::PartKind;

/// Appended to a bracketed URL that was cut short
pub const TRUNCATION_MARKER: &str = "…(sliced)";

/// Smallest render width handed to `html2text`
const MIN_RENDER_WIDTH: usize = 80;

static BRACKETED_URL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\[(https?://[^\s\]]+)\]").expect("valid bracketed URL regex")
});

/// Size limits applied by the normalizer
#[derive(Debug, Clone, Copy)]
pub struct NormalizeOptions {
    /// Input beyond this many characters is dropped before conversion
    pub max_input_chars: usize,
    /// Bracketed URLs longer than this many characters are shortened
    pub max_url_len: usize,
}

impl Default for NormalizeOptions {
    fn default() -> Self {
        Self {
            max_input_chars: 50_000,
            max_url_len: 1000,
        }
    }
}

/// Convert HTML content to readable text
///
/// Never fails: if rendering errors, the sanitized markup is returned as-is
/// (still bounded and URL-truncated).
pub fn normalize_email_html(html: &str, options: NormalizeOptions) -> String {
    let bounded = truncate_chars(html, options.max_input_chars);
    let sanitized = sanitize(bounded);
    let text = match render_text(&sanitized) {
        Ok(text) => text,
        Err(e) => {
            tracing::warn!(error = %e, "html rendering failed; using sanitized markup");
            sanitized
        }
    };
    truncate_urls(&text, options.max_url_len)
}

/// Normalize content according to its content type
///
/// Plain text is only bounded and URL-truncated; HTML is rendered first.
pub fn normalize_content(content: &str, content_type: &str, options: NormalizeOptions) -> String {
    match PartKind::of(content_type) {
        PartKind::Html => normalize_email_html(content, options),
        _ => truncate_urls(
            truncate_chars(content, options.max_input_chars),
            options.max_url_len,
        ),
    }
}

/// Shorten bracketed URLs longer than `max_len` characters
///
/// The kept prefix is exactly `max_len` characters followed by
/// [`TRUNCATION_MARKER`]; the surrounding brackets are preserved.
pub fn truncate_urls(text: &str, max_len: usize) -> String {
    BRACKETED_URL
        .replace_all(text, |caps: &Captures<'_>| {
            let url = &caps[1];
            if url.chars().count() <= max_len {
                format!("[{url}]")
            } else {
                let kept: String = url.chars().take(max_len).collect();
                format!("[{kept}{TRUNCATION_MARKER}]")
            }
        })
        .into_owned()
}

fn sanitize(html: &str) -> String {
    ammonia::Builder::default()
        .rm_tags(&["img"])
        .link_rel(None)
        .clean(html)
        .to_string()
}

/// Width no rendered line can reach, so text is never wrapped
///
/// Rendered text is never longer than the markup it came from.
fn render_width(html: &str) -> usize {
    html.chars().count().saturating_add(1).max(MIN_RENDER_WIDTH)
}

/// Render sanitized HTML, writing each link's target after its text
fn render_text(html: &str) -> Result<String, html2text::Error> {
    let lines = html2text::config::rich().lines_from_read(html.as_bytes(), render_width(html))?;
    let mut out = Vec::with_capacity(lines.len());

    for line in lines {
        let mut rendered = String::new();
        let mut open_link: Option<String> = None;

        for piece in line.tagged_strings() {
            let link = piece.tag.iter().find_map(|a| match a {
                RichAnnotation::Link(href) => Some(href.clone()),
                _ => None,
            });
            if piece
                .tag
                .iter()
                .any(|a| matches!(a, RichAnnotation::Image(_)))
            {
                continue;
            }
            if open_link != link
                && let Some(href) = open_link.take()
            {
                rendered.push_str(&format!(" [{href}]"));
            }
            open_link = link;
            rendered.push_str(&piece.s);
        }
        if let Some(href) = open_link {
            rendered.push_str(&format!(" [{href}]"));
        }
        out.push(rendered.trim_end().to_owned());
    }

    Ok(collapse_blank_lines(&out).trim().to_owned())
}

/// Collapse runs of blank lines into a single blank line
fn collapse_blank_lines(lines: &[String]) -> String {
    let mut kept: Vec<&str> = Vec::with_capacity(lines.len());
    for line in lines {
        if line.is_empty() && kept.last().is_some_and(|l| l.is_empty()) {
            continue;
        }
        kept.push(line);
    }
    kept.join("\n")
}

/// Truncate string to maximum characters (Unicode-aware)
///
/// Preserves complete characters, never splitting multi-byte sequences.
pub fn truncate_chars(input: &str, max_chars: usize) -> &str {
    match input.char_indices().nth(max_chars) {
        Some((idx, _)) => &input[..idx],
        None => input,
    }
}

#[cfg(test)]
mod tests {
    use super::{
        NormalizeOptions, TRUNCATION_MARKER, normalize_content, normalize_email_html,
        truncate_chars, truncate_urls,
    };

    #[test]
    fn truncates_unicode_by_character() {
        assert_eq!(truncate_chars("a😀b😀c", 4), "a😀b😀");
        assert_eq!(truncate_chars("short", 10), "short");
    }

    #[test]
    fn truncates_long_bracketed_url_to_exact_length_plus_marker() {
        let out = truncate_urls("[https://example.com/very/long/path/exceeding]", 20);
        assert_eq!(out, format!("[https://example.com/{TRUNCATION_MARKER}]"));
    }

    #[test]
    fn leaves_urls_at_or_under_the_limit_unchanged() {
        let exact = "[https://example.com/]";
        assert_eq!(truncate_urls(exact, 20), exact);
        let text = "see [https://a.io/x] and [https://b.io]";
        assert_eq!(truncate_urls(text, 20), text);
    }

    #[test]
    fn ignores_brackets_without_urls() {
        let text = "[not a url] [ftp://example.com/long/long/long]";
        assert_eq!(truncate_urls(text, 5), text);
    }

    #[test]
    fn renders_links_with_targets_and_drops_images() {
        let html = r#"<p>Hello <b>world</b>! Visit <a href="https://example.com">our site</a>.</p><img src="image.jpg" alt="logo" />"#;
        let text = normalize_email_html(html, NormalizeOptions::default());
        assert!(text.contains("Hello"));
        assert!(text.contains("world"));
        assert!(text.contains("our site [https://example.com]"));
        assert!(!text.contains("image.jpg"));
        assert!(!text.contains("logo"));
        assert!(!text.contains('<'));
    }

    #[test]
    fn drops_script_content() {
        let html = "<p>visible</p><script>alert('x')</script>";
        let text = normalize_email_html(html, NormalizeOptions::default());
        assert!(text.contains("visible"));
        assert!(!text.contains("alert"));
    }

    #[test]
    fn long_link_targets_are_truncated_after_rendering() {
        let long = format!("https://example.com/{}", "a".repeat(100));
        let html = format!(r#"<a href="{long}">click</a>"#);
        let options = NormalizeOptions {
            max_input_chars: 50_000,
            max_url_len: 30,
        };
        let text = normalize_email_html(&html, options);
        assert!(text.contains(TRUNCATION_MARKER));
        assert!(!text.contains(&long));
    }

    #[test]
    fn oversized_input_is_truncated_not_rejected() {
        let html = format!("<p>{}</p><p>tail-marker</p>", "x".repeat(200));
        let options = NormalizeOptions {
            max_input_chars: 100,
            max_url_len: 1000,
        };
        let text = normalize_email_html(&html, options);
        assert!(!text.is_empty());
        assert!(!text.contains("tail-marker"));
    }

    #[test]
    fn long_paragraph_is_not_wrapped() {
        let paragraph = "word ".repeat(3000);
        let html = format!("<p>{paragraph}</p>");
        let text = normalize_email_html(&html, NormalizeOptions::default());
        assert_eq!(text.trim().lines().count(), 1);
        assert_eq!(text.split_whitespace().count(), 3000);
    }

    #[test]
    fn plain_content_is_not_rendered_as_html() {
        let plain = "a < b\n\nline two [https://example.com/abcdefghijklmnop]";
        let options = NormalizeOptions {
            max_input_chars: 50_000,
            max_url_len: 10,
        };
        let text = normalize_content(plain, "text/plain", options);
        assert!(text.starts_with("a < b\n\nline two"));
        assert!(text.ends_with(&format!("[https://ex{TRUNCATION_MARKER}]")));
    }
}
