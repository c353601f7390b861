//! Raw RFC 5322 bytes → [`ParsedEmail`].

use chrono::{DateTime, Utc};
use mail_parser::{MessageParser, MimeHeaders};
use sha2::{Digest, Sha256};

use crate::error::MailError;
use crate::pipeline::types::{AttachmentMeta, ParsedEmail};

/// Longest body excerpt kept on a record, in characters.
pub const EXCERPT_CHARS: usize = 2000;

/// Parse one fetched message.
///
/// `now` anchors `age_days` so a whole batch ages consistently.
pub fn parse_message(
    provider_id: &str,
    raw: &[u8],
    now: DateTime<Utc>,
) -> Result<ParsedEmail, MailError> {
    let unparseable = || MailError::Unparseable {
        id: provider_id.to_string(),
    };
    if raw.iter().all(u8::is_ascii_whitespace) {
        return Err(unparseable());
    }
    let parsed = MessageParser::default().parse(raw).ok_or_else(unparseable)?;

    let subject = parsed.subject().unwrap_or("").trim().to_string();
    let (from_address, from_name) = parsed
        .from()
        .and_then(|addr| addr.first())
        .map(|a| {
            (
                a.address().unwrap_or("").trim().to_lowercase(),
                a.name().map(|n| n.trim().to_string()).filter(|n| !n.is_empty()),
            )
        })
        .unwrap_or_default();

    let date = parsed
        .date()
        .and_then(|d| DateTime::<Utc>::from_timestamp(d.to_timestamp(), 0));
    let message_id = parsed
        .message_id()
        .map(|id| id.trim().trim_matches(|c| c == '<' || c == '>').to_string())
        .filter(|id| !id.is_empty());

    let text = extract_text(&parsed);
    // Provider ids change when a message moves between folders, so the
    // fallback key uses message content only.
    let hash = match &message_id {
        Some(id) => dedup_hash(id),
        None => dedup_hash(&format!(
            "{from_address}|{subject}|{}|{:x}",
            date.map(|d| d.to_rfc3339()).unwrap_or_default(),
            Sha256::digest(text.as_bytes())
        )),
    };

    let attachments = parsed
        .attachments()
        .map(|part: &mail_parser::MessagePart| AttachmentMeta {
            filename: MimeHeaders::attachment_name(part).map(str::to_string),
            content_type: MimeHeaders::content_type(part)
                .map(|ct| match ct.subtype() {
                    Some(sub) => format!("{}/{}", ct.ctype(), sub),
                    None => ct.ctype().to_string(),
                })
                .unwrap_or_else(|| "application/octet-stream".to_string()),
            size: part.contents().len(),
        })
        .collect();

    Ok(ParsedEmail {
        provider_id: provider_id.to_string(),
        hash,
        message_id,
        subject,
        from_address,
        from_name,
        to: extract_addresses(parsed.to()),
        date,
        body_excerpt: excerpt(&text),
        attachments,
        size: raw.len(),
        age_days: date.map(|d| now.signed_duration_since(d).num_days()),
    })
}

/// Stand-in for a message the parser rejected, so it can still be recorded
/// (as an error) instead of vanishing.
pub fn unparseable_placeholder(provider_id: &str, raw: &[u8]) -> ParsedEmail {
    let mut hasher = Sha256::new();
    hasher.update(provider_id.as_bytes());
    hasher.update(raw);
    ParsedEmail {
        provider_id: provider_id.to_string(),
        hash: format!("{:x}", hasher.finalize()),
        message_id: None,
        subject: String::new(),
        from_address: String::new(),
        from_name: None,
        to: Vec::new(),
        date: None,
        body_excerpt: String::new(),
        attachments: Vec::new(),
        size: raw.len(),
        age_days: None,
    }
}

/// Hex SHA-256 of a stable message identifier.
pub fn dedup_hash(key: &str) -> String {
    format!("{:x}", Sha256::digest(key.as_bytes()))
}

fn extract_text(parsed: &mail_parser::Message) -> String {
    if let Some(text) = parsed.body_text(0)
        && !text.trim().is_empty()
    {
        return text.to_string();
    }
    if let Some(html) = parsed.body_html(0) {
        return strip_html(html.as_ref());
    }
    String::new()
}

fn excerpt(body: &str) -> String {
    let stripped = strip_quoted_text(body);
    if stripped.chars().count() <= EXCERPT_CHARS {
        stripped
    } else {
        stripped.chars().take(EXCERPT_CHARS).collect()
    }
}

/// Flatten `To:` into plain lowercased addresses, groups included.
pub fn extract_addresses(addr: Option<&mail_parser::Address>) -> Vec<String> {
    let Some(addr) = addr else {
        return Vec::new();
    };
    let list: Vec<&mail_parser::Addr> = match addr {
        mail_parser::Address::List(addrs) => addrs.iter().collect(),
        mail_parser::Address::Group(groups) => {
            groups.iter().flat_map(|g| g.addresses.iter()).collect()
        }
    };
    list.into_iter()
        .filter_map(|a| a.address.as_ref().map(|s| s.to_lowercase()))
        .collect()
}

/// Drop tags and the contents of `<style>`/`<script>`, decode the common
/// entities and normalize whitespace.
pub fn strip_html(html: &str) -> String {
    let mut result = String::with_capacity(html.len() / 2);
    let mut in_tag = false;
    let mut tag = String::new();
    let mut skip_until: Option<&str> = None;

    for ch in html.chars() {
        match ch {
            '<' => {
                in_tag = true;
                tag.clear();
            }
            '>' if in_tag => {
                in_tag = false;
                let name = tag
                    .trim_start_matches('/')
                    .split(|c: char| c.is_whitespace())
                    .next()
                    .unwrap_or("")
                    .to_ascii_lowercase();
                let closing = tag.starts_with('/');
                match (skip_until, closing) {
                    (Some(until), true) if name == until => skip_until = None,
                    (None, false) if name == "style" => skip_until = Some("style"),
                    (None, false) if name == "script" => skip_until = Some("script"),
                    _ => {}
                }
                // Block-level boundaries separate words.
                result.push(' ');
            }
            _ if in_tag => tag.push(ch),
            _ if skip_until.is_none() => result.push(ch),
            _ => {}
        }
    }

    let decoded = result
        .replace("&nbsp;", " ")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&amp;", "&");
    decoded.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Remove quoted reply text: `>` lines and everything after an
/// "On ... wrote:" attribution or an "Original Message" separator.
pub fn strip_quoted_text(body: &str) -> String {
    let mut result = Vec::new();

    for line in body.lines() {
        let trimmed = line.trim();
        if trimmed.starts_with('>') {
            continue;
        }
        if trimmed.starts_with("On ") && trimmed.ends_with("wrote:") {
            break;
        }
        if trimmed.starts_with("---") && trimmed.contains("Original Message") {
            break;
        }
        result.push(line);
    }

    while result.last().is_some_and(|l| l.trim().is_empty()) {
        result.pop();
    }
    result.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 15, 12, 0, 0).unwrap()
    }

    const PLAIN: &str = "From: \"Deals Team\" <Deals@Shop.Example.com>\r\n\
To: me@example.com, other@example.com\r\n\
Subject: 50% off everything\r\n\
Date: Fri, 30 Jan 2026 10:00:00 +0000\r\n\
Message-ID: <promo-1@shop.example.com>\r\n\
\r\n\
Huge sale this weekend.\r\n\
\r\n\
On Thu, Jan 29, 2026 at 9:00 AM Someone wrote:\r\n\
> earlier text\r\n";

    #[test]
    fn parses_headers_and_body() {
        let email = parse_message("1.eml", PLAIN.as_bytes(), now()).unwrap();
        assert_eq!(email.subject, "50% off everything");
        assert_eq!(email.from_address, "deals@shop.example.com");
        assert_eq!(email.from_name.as_deref(), Some("Deals Team"));
        assert_eq!(email.to, vec!["me@example.com", "other@example.com"]);
        assert_eq!(email.message_id.as_deref(), Some("promo-1@shop.example.com"));
        assert_eq!(email.body_excerpt, "Huge sale this weekend.");
        assert_eq!(email.age_days, Some(44));
        assert_eq!(email.size, PLAIN.len());
        assert_eq!(email.sender_domain(), Some("shop.example.com"));
    }

    #[test]
    fn hash_is_stable_per_message_id() {
        let a = parse_message("1.eml", PLAIN.as_bytes(), now()).unwrap();
        let b = parse_message("other-name.eml", PLAIN.as_bytes(), now()).unwrap();
        assert_eq!(a.hash, b.hash);
        assert_eq!(a.hash, dedup_hash("promo-1@shop.example.com"));
        assert_eq!(a.hash.len(), 64);
    }

    #[test]
    fn missing_message_id_hashes_content_not_location() {
        let raw = "From: a@b.com\r\nSubject: hi\r\n\r\nbody\r\n";
        let a = parse_message("new/1.eml", raw.as_bytes(), now()).unwrap();
        let b = parse_message("cur/1.eml:2,S", raw.as_bytes(), now()).unwrap();
        assert!(a.message_id.is_none());
        assert_eq!(a.hash, b.hash);
        assert!(a.date.is_none());
        assert_eq!(a.age_days_or_zero(), 0);

        let other_body = "From: a@b.com\r\nSubject: hi\r\n\r\nsomething else\r\n";
        let c = parse_message("new/1.eml", other_body.as_bytes(), now()).unwrap();
        assert_ne!(a.hash, c.hash);
        let other_sender = "From: z@b.com\r\nSubject: hi\r\n\r\nbody\r\n";
        let d = parse_message("new/1.eml", other_sender.as_bytes(), now()).unwrap();
        assert_ne!(a.hash, d.hash);
    }

    #[test]
    fn html_only_body_becomes_text() {
        let raw = "From: news@medium.com\r\n\
Subject: Digest\r\n\
Content-Type: text/html; charset=utf-8\r\n\
\r\n\
<html><body><p>Top stories</p><p>Rust and you</p></body></html>\r\n";
        let email = parse_message("1.eml", raw.as_bytes(), now()).unwrap();
        assert!(email.body_excerpt.contains("Top stories"));
        assert!(email.body_excerpt.contains("Rust and you"));
        assert!(!email.body_excerpt.contains("<p>"));
    }

    #[test]
    fn attachments_recorded_without_bytes() {
        let raw = "From: billing@bank.com\r\n\
Subject: Statement\r\n\
MIME-Version: 1.0\r\n\
Content-Type: multipart/mixed; boundary=\"XX\"\r\n\
\r\n\
--XX\r\n\
Content-Type: text/plain\r\n\
\r\n\
Your statement is attached.\r\n\
--XX\r\n\
Content-Type: application/pdf\r\n\
Content-Disposition: attachment; filename=\"statement.pdf\"\r\n\
\r\n\
%PDF-1.4 fake\r\n\
--XX--\r\n";
        let email = parse_message("1.eml", raw.as_bytes(), now()).unwrap();
        assert_eq!(email.attachments.len(), 1);
        let att = &email.attachments[0];
        assert_eq!(att.filename.as_deref(), Some("statement.pdf"));
        assert_eq!(att.content_type, "application/pdf");
        assert!(att.size > 0);
        assert!(email.has_attachments());
    }

    #[test]
    fn blank_input_is_unparseable() {
        let err = parse_message("x.eml", b" \r\n", now()).unwrap_err();
        assert!(matches!(err, MailError::Unparseable { .. }));
    }

    #[test]
    fn placeholder_hash_depends_on_content() {
        let a = unparseable_placeholder("x", b"one");
        let b = unparseable_placeholder("x", b"two");
        assert_ne!(a.hash, b.hash);
        assert!(a.hash.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn strip_html_basic() {
        assert_eq!(strip_html("<p>Hello</p>"), "Hello");
        assert_eq!(
            strip_html("<div><b>Bold</b> and <i>italic</i></div>"),
            "Bold and italic"
        );
        assert_eq!(strip_html("No HTML here"), "No HTML here");
        assert_eq!(strip_html(""), "");
    }

    #[test]
    fn strip_html_drops_scripts() {
        assert_eq!(
            strip_html("<script>var x = 1;</script><p>Visible</p>"),
            "Visible"
        );
    }

    #[test]
    fn strip_quoted_lines_and_attribution() {
        let body = "Thanks!\n\n> quoted\nMore\n\n--- Original Message ---\nold";
        assert_eq!(strip_quoted_text(body), "Thanks!\n\nMore");
    }

    #[test]
    fn excerpt_truncates_long_bodies() {
        let long = "a".repeat(EXCERPT_CHARS + 50);
        assert_eq!(excerpt(&long).chars().count(), EXCERPT_CHARS);
    }
}
