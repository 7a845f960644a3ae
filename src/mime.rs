//! Header and body parsing for cached messages
//!
//! Parses fetched header blocks into envelope fields and raw RFC822 messages
//! into a short plain-text preview using `mailparse`. HTML-only messages are
//! rendered to text with `html2text`.

use std::collections::BTreeMap;

use mailparse::{DispositionType, MailHeader, ParsedMail};

use crate::errors::{AppError, AppResult};

/// Maximum characters kept in a body preview
pub const PREVIEW_CHARS: usize = 300;

/// Envelope fields extracted from a header block
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Envelope {
    pub message_id: Option<String>,
    pub subject: Option<String>,
    pub from: Option<String>,
    pub to: Option<String>,
    pub date: Option<String>,
}

/// Parse the selected header fields of a message
///
/// # Errors
///
/// - `Internal` if `mailparse` rejects the header block
pub fn parse_envelope(header_bytes: &[u8]) -> AppResult<Envelope> {
    let headers = parse_header_bytes(header_bytes)?;
    let map = to_header_map(&headers);
    Ok(Envelope {
        message_id: map.get("message-id").cloned(),
        subject: map.get("subject").cloned(),
        from: map.get("from").cloned(),
        to: map.get("to").cloned(),
        date: map.get("date").cloned(),
    })
}

/// Build a whitespace-collapsed preview of the message body
///
/// Prefers the first non-attachment `text/plain` part and falls back to
/// rendered `text/html`. Returns `None` when neither yields text.
pub fn body_preview(raw: &[u8]) -> AppResult<Option<String>> {
    let parsed = mailparse::parse_mail(raw)
        .map_err(|e| AppError::Internal(format!("failed to parse RFC822 message: {e}")))?;

    let mut body_text = None;
    let mut body_html = None;
    walk_parts(&parsed, &mut body_text, &mut body_html);

    let text = body_text.or_else(|| {
        body_html.and_then(|html| html2text::from_read(html.as_bytes(), 120).ok())
    });
    Ok(text
        .map(|t| collapse_whitespace(&t))
        .filter(|t| !t.is_empty())
        .map(|t| truncate_chars(t, PREVIEW_CHARS)))
}

/// Walk MIME part tree recursively
///
/// Records the first inline text/plain and text/html bodies.
fn walk_parts(
    part: &ParsedMail<'_>,
    body_text: &mut Option<String>,
    body_html: &mut Option<String>,
) {
    if part.subparts.is_empty() {
        let ctype = part.ctype.mimetype.to_ascii_lowercase();
        let disp = part.get_content_disposition();
        let is_attachment = disp.disposition == DispositionType::Attachment
            || disp.params.contains_key("filename");
        if is_attachment {
            return;
        }
        if ctype == "text/plain"
            && body_text.is_none()
            && let Ok(text) = part.get_body()
        {
            *body_text = Some(text);
        }
        if ctype == "text/html"
            && body_html.is_none()
            && let Ok(html) = part.get_body()
        {
            *body_html = Some(html);
        }
        return;
    }

    for sub in &part.subparts {
        walk_parts(sub, body_text, body_html);
    }
}

/// Parse header bytes into key-value pairs
pub fn parse_header_bytes(header_bytes: &[u8]) -> AppResult<Vec<(String, String)>> {
    let (headers, _) = mailparse::parse_headers(header_bytes)
        .map_err(|e| AppError::Internal(format!("failed to parse message headers: {e}")))?;
    Ok(to_tuples(headers))
}

/// Convert mailparse headers to tuples
fn to_tuples(headers: Vec<MailHeader<'_>>) -> Vec<(String, String)> {
    headers
        .into_iter()
        .map(|h| (h.get_key(), h.get_value()))
        .collect()
}

/// Convert header tuples to case-insensitive map
///
/// Returns first value for each header key (case-insensitive).
fn to_header_map(headers: &[(String, String)]) -> BTreeMap<String, String> {
    let mut map = BTreeMap::new();
    for (k, v) in headers {
        let key = k.to_ascii_lowercase();
        map.entry(key).or_insert_with(|| v.trim().to_owned());
    }
    map
}

fn collapse_whitespace(input: &str) -> String {
    input.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Truncate string to maximum characters (Unicode-aware)
///
/// Preserves complete characters, never splitting multi-byte sequences.
pub fn truncate_chars(input: String, max_chars: usize) -> String {
    if input.chars().count() <= max_chars {
        return input;
    }
    input.chars().take(max_chars).collect()
}
