//! Message parser: raw RFC 5322 / MIME bytes to a [`NormalizedMessage`].
//!
//! `mail-parser` accepts nearly anything, so the header section is checked
//! first: input that is empty, binary, truncated inside the headers, or made
//! of lines that are not header fields is rejected with a [`ParseError`].
//! Missing headers are not errors and fall back to placeholder values.

use mail_parser::{MessageParser, MimeHeaders};
use serde::{Deserialize, Serialize};

use crate::error::ParseError;

/// Placeholder for a missing From/To header.
pub const UNKNOWN_ADDRESS: &str = "unknown";

/// Placeholder for a missing Subject header.
pub const NO_SUBJECT: &str = "(no subject)";

/// A decoded message, immutable once built.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NormalizedMessage {
    pub sender: String,
    pub recipient: String,
    pub subject: String,
    pub body_text: String,
    /// Message-ID header, when present.
    pub message_id: Option<String>,
}

/// Parse a complete raw message.
pub fn parse(raw: &[u8]) -> Result<NormalizedMessage, ParseError> {
    check_header_section(raw)?;

    let parsed = MessageParser::default()
        .parse(raw)
        .ok_or(ParseError::Undecodable)?;

    let subject = parsed
        .subject()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .unwrap_or(NO_SUBJECT)
        .to_string();

    Ok(NormalizedMessage {
        sender: first_address(parsed.from()),
        recipient: first_address(parsed.to()),
        subject,
        body_text: extract_text(&parsed),
        message_id: parsed.message_id().map(|s| s.to_string()),
    })
}

/// Parse on the blocking pool; the caller awaits the outcome.
pub async fn parse_owned(raw: Vec<u8>) -> Result<NormalizedMessage, ParseError> {
    tokio::task::spawn_blocking(move || parse(&raw))
        .await
        .unwrap_or_else(|e| {
            tracing::error!("Parser task panicked: {e}");
            Err(ParseError::Undecodable)
        })
}

/// First address of a header, or [`UNKNOWN_ADDRESS`].
fn first_address(addr: Option<&mail_parser::Address>) -> String {
    addr.and_then(|a| a.first())
        .and_then(|a| a.address())
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| s.to_string())
        .unwrap_or_else(|| UNKNOWN_ADDRESS.to_string())
}

/// Readable body text: the text part when there is one, otherwise the HTML
/// part with tags stripped, otherwise a text attachment, otherwise empty.
fn extract_text(parsed: &mail_parser::Message) -> String {
    // `text_body` may hold HTML parts converted to text; only a real
    // text/plain part counts here.
    let plain = parsed
        .text_body
        .iter()
        .filter_map(|id| parsed.part(*id))
        .filter(|part| is_content_type(part, "text", "plain"))
        .find_map(|part| part.text_contents());
    if let Some(text) = plain {
        return text.trim_end().to_string();
    }
    if let Some(html) = parsed.body_html(0) {
        return strip_html(html.as_ref());
    }
    if let Some(text) = parsed.body_text(0) {
        return text.trim_end().to_string();
    }
    for part in parsed.attachments() {
        if is_content_type(part, "text", "plain") {
            if let Ok(text) = std::str::from_utf8(part.contents()) {
                return text.trim_end().to_string();
            }
        }
    }
    String::new()
}

/// Whether a part has the given content type. Parts without a
/// Content-Type header count as `text/plain`.
fn is_content_type(part: &mail_parser::MessagePart, ctype: &str, subtype: &str) -> bool {
    match MimeHeaders::content_type(part) {
        Some(ct) => {
            ct.ctype().eq_ignore_ascii_case(ctype)
                && ct.subtype().is_some_and(|s| s.eq_ignore_ascii_case(subtype))
        }
        None => ctype == "text" && subtype == "plain",
    }
}

/// Strip HTML tags from content (basic).
fn strip_html(html: &str) -> String {
    let mut result = String::new();
    let mut in_tag = false;
    for ch in html.chars() {
        match ch {
            '<' => in_tag = true,
            '>' => in_tag = false,
            _ if !in_tag => result.push(ch),
            _ => {}
        }
    }
    // Normalize whitespace
    result.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Validate the header section of a raw message.
///
/// The section ends at the first empty line. Without one, the input must
/// end on a line terminator, otherwise it was cut mid-header.
fn check_header_section(raw: &[u8]) -> Result<(), ParseError> {
    if raw.iter().all(u8::is_ascii_whitespace) {
        return Err(ParseError::Empty);
    }

    let mut offset = 0;
    let mut line_no = 0;
    while offset < raw.len() {
        line_no += 1;
        let (line, next) = match raw[offset..].iter().position(|&b| b == b'\n') {
            Some(pos) => (&raw[offset..offset + pos], offset + pos + 1),
            None => return Err(ParseError::Truncated),
        };
        let line = line.strip_suffix(b"\r").unwrap_or(line);

        if line.is_empty() {
            return Ok(());
        }
        if line
            .iter()
            .any(|&b| (b < 0x20 && b != b'\t') || b == 0x7f)
        {
            return Err(ParseError::ControlCharacter { line: line_no });
        }
        let is_continuation = line[0] == b' ' || line[0] == b'\t';
        if is_continuation {
            if line_no == 1 {
                return Err(ParseError::MalformedHeader { line: line_no });
            }
        } else if !is_field_line(line) {
            return Err(ParseError::MalformedHeader { line: line_no });
        }
        offset = next;
    }
    Ok(())
}

/// `field-name ":"` with printable US-ASCII names, tolerating whitespace
/// before the colon as older mailers emit it.
fn is_field_line(line: &[u8]) -> bool {
    let Some(colon) = line.iter().position(|&b| b == b':') else {
        return false;
    };
    let name = &line[..colon];
    let name_end = name
        .iter()
        .rposition(|&b| b != b' ' && b != b'\t')
        .map_or(0, |i| i + 1);
    name_end > 0 && name[..name_end].iter().all(|&b| (33..=126).contains(&b))
}
