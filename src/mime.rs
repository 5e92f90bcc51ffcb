//! Message parsing and MIME handling
//!
//! Flattens the Gmail part tree of a message into a [`ParsedEmail`]: one
//! canonical content string, a content type, single-address header fields,
//! and (optionally) fetched attachments.
//!
//! Content collection is a pure fold over the tree. Inside a
//! `multipart/alternative` container exactly one branch is taken, preferring
//! HTML, so equivalent representations are never concatenated.

use std::collections::BTreeMap;
use std::sync::LazyLock;

use regex::Regex;

use crate::errors::AppResult;
use crate::gmail::{MailProvider, decode_base64};
use crate::models::{Attachment, GmailMessage, Header, MessagePart, ParsedEmail};

/// Separator placed between collected content leaves
const CONTENT_SEPARATOR: &str = "\n";

static ANGLE_ADDRESS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"<([^>]+)>").expect("valid address regex"));

/// Structural role of a part, derived from its MIME type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartKind {
    PlainText,
    Html,
    Alternative,
    /// Any other `multipart/*` container
    Container,
    Other,
}

impl PartKind {
    /// Classify a MIME type, ignoring parameters and case
    pub fn of(mime_type: &str) -> Self {
        let essence = mime_type
            .split(';')
            .next()
            .unwrap_or_default()
            .trim()
            .to_ascii_lowercase();
        match essence.as_str() {
            "text/plain" => Self::PlainText,
            "text/html" => Self::Html,
            "multipart/alternative" => Self::Alternative,
            e if e.starts_with("multipart/") => Self::Container,
            _ => Self::Other,
        }
    }
}

fn kind(part: &MessagePart) -> PartKind {
    PartKind::of(&part.mime_type)
}

/// Whether a part's payload lives out of band
fn is_attachment_ref(part: &MessagePart) -> bool {
    part.body.data.is_none() && part.body.attachment_id.is_some()
}

fn contains_html(part: &MessagePart) -> bool {
    kind(part) == PartKind::Html || part.parts.iter().any(contains_html)
}

/// Collect the text leaves that make up the message content, in tree order
///
/// Depth-first. A `multipart/alternative` contributes a single branch: its
/// `text/html` child, else the first child whose subtree holds HTML, else
/// every child in turn. Only branches with at least one inline leaf are
/// eligible. Other containers contribute every child. Text leaves whose
/// payload is an attachment reference are not content.
pub fn collect_content_parts(root: &MessagePart) -> Vec<&MessagePart> {
    match kind(root) {
        PartKind::PlainText | PartKind::Html if !is_attachment_ref(root) => vec![root],
        PartKind::Alternative => {
            let inline = |p: &&MessagePart| !collect_content_parts(p).is_empty();
            let chosen = root
                .parts
                .iter()
                .filter(inline)
                .find(|p| kind(p) == PartKind::Html)
                .or_else(|| root.parts.iter().filter(inline).find(|p| contains_html(p)));
            match chosen {
                Some(branch) => collect_content_parts(branch),
                None => collect_children(root),
            }
        }
        _ => collect_children(root),
    }
}

fn collect_children(part: &MessagePart) -> Vec<&MessagePart> {
    part.parts.iter().flat_map(collect_content_parts).collect()
}

/// Decode a leaf's transport encoding into text
///
/// Returns `None` when the payload is not valid base64; invalid UTF-8 is
/// replaced rather than rejected.
fn decode_part_text(part: &MessagePart) -> Option<String> {
    let data = part.body.data.as_deref()?;
    let bytes = decode_base64(data)?;
    Some(String::from_utf8_lossy(&bytes).into_owned())
}

/// Join the decoded leaves and derive the overall content type
fn assemble_content(message_id: &str, parts: &[&MessagePart]) -> (String, String) {
    let decoded: Vec<String> = parts
        .iter()
        .map(|part| match decode_part_text(part) {
            Some(text) => text,
            None if part.body.data.is_none() => String::new(),
            None => {
                tracing::warn!(
                    message_id,
                    part_id = part.part_id.as_deref().unwrap_or(""),
                    "skipping part with undecodable body"
                );
                String::new()
            }
        })
        .collect();

    let content_type = if parts.iter().any(|p| kind(p) == PartKind::Html) {
        "text/html"
    } else {
        "text/plain"
    };
    (decoded.join(CONTENT_SEPARATOR), content_type.to_owned())
}

/// Every part in the tree that carries a filename and an attachment reference
pub fn attachment_parts(root: &MessagePart) -> Vec<&MessagePart> {
    let mut found = Vec::new();
    if !root.filename.trim().is_empty() && root.body.attachment_id.is_some() {
        found.push(root);
    }
    for child in &root.parts {
        found.extend(attachment_parts(child));
    }
    found
}

/// Fetch every attachment of the message through the provider
///
/// # Errors
///
/// Any fetch failure fails the whole parse.
async fn fetch_attachments(
    message: &GmailMessage,
    provider: &dyn MailProvider,
) -> AppResult<Vec<Attachment>> {
    let mut attachments = Vec::new();
    for part in attachment_parts(&message.payload) {
        let Some(attachment_id) = part.body.attachment_id.as_deref() else {
            continue;
        };
        let data = provider.get_attachment(&message.id, attachment_id).await?;
        tracing::debug!(
            message_id = %message.id,
            filename = %part.filename,
            bytes = data.len(),
            "fetched attachment"
        );
        attachments.push(Attachment {
            filename: part.filename.clone(),
            mime_type: part.mime_type.clone(),
            size: part.body.size,
            data,
        });
    }
    Ok(attachments)
}

/// Convert header list to a case-folded map
///
/// Returns first value for each header key.
fn to_header_map(headers: &[Header]) -> BTreeMap<String, String> {
    let mut map = BTreeMap::new();
    for h in headers {
        map.entry(h.name.to_ascii_lowercase())
            .or_insert_with(|| h.value.clone());
    }
    map
}

/// Reduce an address header to a single address
///
/// Prefers the first angle-bracket-delimited address, else the trimmed value.
pub fn extract_address(value: &str) -> Option<String> {
    if let Some(caps) = ANGLE_ADDRESS.captures(value)
        && let Some(m) = caps.get(1)
    {
        return Some(m.as_str().to_owned());
    }
    let trimmed = value.trim();
    (!trimmed.is_empty()).then(|| trimmed.to_owned())
}

/// Parse a fetched message into its flattened representation
///
/// Attachments are fetched only when `attachments` is provided.
///
/// # Errors
///
/// Propagates attachment fetch failures; content extraction itself never
/// fails.
pub async fn parse_email(
    message: &GmailMessage,
    attachments: Option<&dyn MailProvider>,
) -> AppResult<ParsedEmail> {
    let headers = to_header_map(&message.payload.headers);
    let parts = collect_content_parts(&message.payload);
    let (content, content_type) = assemble_content(&message.id, &parts);

    let attachments = match attachments {
        Some(provider) => fetch_attachments(message, provider).await?,
        None => Vec::new(),
    };

    let address = |name: &str| headers.get(name).and_then(|v| extract_address(v));

    Ok(ParsedEmail {
        id: message.id.clone(),
        thread_id: message.thread_id.clone(),
        labels: message.label_ids.clone(),
        from: address("from"),
        to: address("to"),
        cc: address("cc"),
        bcc: address("bcc"),
        subject: headers.get("subject").cloned(),
        date: headers.get("date").cloned(),
        snippet: message.snippet.clone(),
        content,
        content_type,
        attachments,
    })
}

#[cfg(test)]
mod tests {
    use base64::Engine;
    use base64::engine::general_purpose::URL_SAFE_NO_PAD;

    use super::{
        PartKind, attachment_parts, collect_content_parts, extract_address, parse_email,
    };
    use crate::models::{GmailMessage, Header, MessagePart, MessagePartBody};
    use crate::test_support::FakeProvider;

    fn leaf(mime_type: &str, text: &str) -> MessagePart {
        MessagePart {
            mime_type: mime_type.to_owned(),
            body: MessagePartBody {
                size: text.len() as u64,
                data: Some(URL_SAFE_NO_PAD.encode(text)),
                attachment_id: None,
            },
            ..MessagePart::default()
        }
    }

    fn container(mime_type: &str, parts: Vec<MessagePart>) -> MessagePart {
        MessagePart {
            mime_type: mime_type.to_owned(),
            parts,
            ..MessagePart::default()
        }
    }

    fn attachment(filename: &str, attachment_id: &str) -> MessagePart {
        MessagePart {
            mime_type: "application/pdf".to_owned(),
            filename: filename.to_owned(),
            body: MessagePartBody {
                size: 4,
                data: None,
                attachment_id: Some(attachment_id.to_owned()),
            },
            ..MessagePart::default()
        }
    }

    fn message(payload: MessagePart, headers: Vec<(&str, &str)>) -> GmailMessage {
        let mut payload = payload;
        payload.headers = headers
            .into_iter()
            .map(|(name, value)| Header {
                name: name.to_owned(),
                value: value.to_owned(),
            })
            .collect();
        GmailMessage {
            id: "m1".to_owned(),
            thread_id: "t1".to_owned(),
            label_ids: vec!["INBOX".to_owned()],
            snippet: Some("preview".to_owned()),
            history_id: None,
            payload,
        }
    }

    #[test]
    fn classifies_mime_types_ignoring_case_and_parameters() {
        assert_eq!(PartKind::of("text/plain; charset=UTF-8"), PartKind::PlainText);
        assert_eq!(PartKind::of("TEXT/HTML"), PartKind::Html);
        assert_eq!(PartKind::of("multipart/alternative"), PartKind::Alternative);
        assert_eq!(PartKind::of("multipart/related"), PartKind::Container);
        assert_eq!(PartKind::of("image/png"), PartKind::Other);
    }

    #[test]
    fn alternative_selects_only_the_html_branch() {
        let root = container(
            "multipart/alternative",
            vec![leaf("text/plain", "plain body"), leaf("text/html", "<p>html body</p>")],
        );
        let parts = collect_content_parts(&root);
        assert_eq!(parts.len(), 1);
        assert_eq!(parts[0].mime_type, "text/html");
    }

    #[test]
    fn alternative_prefers_branch_holding_nested_html() {
        let related = container(
            "multipart/related",
            vec![leaf("text/html", "<p>rich</p>"), leaf("image/png", "png")],
        );
        let root = container(
            "multipart/alternative",
            vec![leaf("text/plain", "plain"), related],
        );
        let parts = collect_content_parts(&root);
        assert_eq!(parts.len(), 1);
        assert_eq!(parts[0].mime_type, "text/html");
    }

    #[test]
    fn alternative_without_html_falls_through_to_children() {
        let root = container(
            "multipart/alternative",
            vec![leaf("text/plain", "only plain"), leaf("text/enriched", "x")],
        );
        let parts = collect_content_parts(&root);
        assert_eq!(parts.len(), 1);
        assert_eq!(parts[0].mime_type, "text/plain");
    }

    #[test]
    fn alternative_with_out_of_band_html_keeps_plain_text() {
        let mut html = attachment("", "att-html");
        html.mime_type = "text/html".to_owned();
        let root = container(
            "multipart/alternative",
            vec![leaf("text/plain", "plain"), html],
        );
        let parts = collect_content_parts(&root);
        assert_eq!(parts.len(), 1);
        assert_eq!(parts[0].mime_type, "text/plain");
    }

    #[test]
    fn alternative_skips_nested_branch_without_inline_html() {
        let mut html = attachment("", "att-html");
        html.mime_type = "text/html".to_owned();
        let root = container(
            "multipart/alternative",
            vec![
                leaf("text/plain", "plain"),
                container("multipart/related", vec![html]),
            ],
        );
        let parts = collect_content_parts(&root);
        assert_eq!(parts.len(), 1);
        assert_eq!(parts[0].mime_type, "text/plain");
    }

    #[test]
    fn mixed_container_collects_every_child_in_order() {
        let root = container(
            "multipart/mixed",
            vec![
                leaf("text/plain", "first"),
                container(
                    "multipart/alternative",
                    vec![leaf("text/plain", "alt plain"), leaf("text/html", "alt html")],
                ),
                attachment("report.pdf", "att-1"),
                leaf("text/plain", "last"),
            ],
        );
        let bodies: Vec<&str> = collect_content_parts(&root)
            .iter()
            .map(|p| p.mime_type.as_str())
            .collect();
        assert_eq!(bodies, vec!["text/plain", "text/html", "text/plain"]);
    }

    #[test]
    fn text_attachment_reference_is_not_content() {
        let mut notes = attachment("notes.txt", "att-2");
        notes.mime_type = "text/plain".to_owned();
        let root = container("multipart/mixed", vec![leaf("text/plain", "body"), notes]);
        assert_eq!(collect_content_parts(&root).len(), 1);
        assert_eq!(attachment_parts(&root).len(), 1);
    }

    #[test]
    fn extracts_angle_bracket_address_over_bare_token() {
        assert_eq!(
            extract_address("Jane Doe <jane@example.com>").as_deref(),
            Some("jane@example.com")
        );
        assert_eq!(
            extract_address("  bob@example.com ").as_deref(),
            Some("bob@example.com")
        );
        assert_eq!(
            extract_address("a@example.com, Bob <b@example.com>").as_deref(),
            Some("b@example.com")
        );
        assert_eq!(extract_address("   "), None);
    }

    #[tokio::test]
    async fn parses_headers_content_and_type() {
        let payload = container(
            "multipart/mixed",
            vec![
                leaf("text/plain", "Hello"),
                container(
                    "multipart/alternative",
                    vec![leaf("text/plain", "World"), leaf("text/html", "<b>World</b>")],
                ),
            ],
        );
        let msg = message(
            payload,
            vec![
                ("FROM", "Billing <billing@example.com>"),
                ("To", "me@example.com"),
                ("Subject", "Invoice due"),
                ("Date", "Mon, 1 Jan 2024 10:00:00 +0000"),
            ],
        );

        let parsed = parse_email(&msg, None).await.expect("parse succeeds");
        assert_eq!(parsed.from.as_deref(), Some("billing@example.com"));
        assert_eq!(parsed.to.as_deref(), Some("me@example.com"));
        assert_eq!(parsed.cc, None);
        assert_eq!(parsed.subject.as_deref(), Some("Invoice due"));
        assert_eq!(parsed.content, "Hello\n<b>World</b>");
        assert_eq!(parsed.content_type, "text/html");
        assert!(parsed.attachments.is_empty());
    }

    #[tokio::test]
    async fn single_part_plain_message_is_plain_text() {
        let msg = message(leaf("text/plain", "just text"), vec![("Subject", "Hi")]);
        let parsed = parse_email(&msg, None).await.expect("parse succeeds");
        assert_eq!(parsed.content, "just text");
        assert_eq!(parsed.content_type, "text/plain");
    }

    #[tokio::test]
    async fn undecodable_leaf_contributes_nothing() {
        let mut broken = leaf("text/plain", "");
        broken.body.data = Some("%%%".to_owned());
        let msg = message(
            container("multipart/mixed", vec![broken, leaf("text/plain", "ok")]),
            vec![],
        );
        let parsed = parse_email(&msg, None).await.expect("parse succeeds");
        assert_eq!(parsed.content, "\nok");
    }

    #[tokio::test]
    async fn fetches_nested_attachments_when_requested() {
        let payload = container(
            "multipart/mixed",
            vec![
                leaf("text/plain", "see attached"),
                container("multipart/mixed", vec![attachment("deep.pdf", "att-9")]),
            ],
        );
        let msg = message(payload, vec![]);
        let provider = FakeProvider::default();
        provider.put_attachment("m1", "att-9", b"%PDF".to_vec());

        let parsed = parse_email(&msg, Some(&provider)).await.expect("parse succeeds");
        assert_eq!(parsed.attachments.len(), 1);
        assert_eq!(parsed.attachments[0].filename, "deep.pdf");
        assert_eq!(parsed.attachments[0].data, b"%PDF".to_vec());
        assert_eq!(parsed.attachments[0].size, 4);
    }

    #[tokio::test]
    async fn attachment_fetch_failure_fails_the_parse() {
        let payload = container(
            "multipart/mixed",
            vec![leaf("text/plain", "x"), attachment("missing.pdf", "att-404")],
        );
        let msg = message(payload, vec![]);
        let provider = FakeProvider::default();

        let err = parse_email(&msg, Some(&provider))
            .await
            .expect_err("must fail");
        assert!(err.to_string().contains("att-404"));
    }
}
