//! Raw RFC 822 → `EmailEnvelope` normalization for adapters that fetch raw mail.

use chrono::{DateTime, Utc};
use mail_parser::{MessageParser, MimeHeaders};

use crate::mail::types::{Attachment, EmailEnvelope};

const SNIPPET_CHARS: usize = 200;

/// Parse a raw message into an envelope. Returns `None` if the bytes are not
/// a parseable message.
pub fn envelope_from_rfc822(id: impl Into<String>, raw: &[u8]) -> Option<EmailEnvelope> {
    let parsed = MessageParser::default().parse(raw)?;

    let from = parsed
        .from()
        .and_then(|addr| addr.first())
        .and_then(|a| a.address())
        .map(|s| s.to_string())
        .unwrap_or_default();

    let text_body = parsed.body_text(0).map(|t| t.to_string());
    let html_body = parsed.body_html(0).map(|h| h.to_string());

    let snippet_source = match (&text_body, &html_body) {
        (Some(text), _) => text.clone(),
        (None, Some(html)) => strip_html(html),
        (None, None) => String::new(),
    };

    let attachments = parsed
        .attachments()
        .map(|part| {
            let part: &mail_parser::MessagePart = part;
            let mime_type = MimeHeaders::content_type(part)
                .map(|ct| match ct.subtype() {
                    Some(sub) => format!("{}/{}", ct.ctype(), sub),
                    None => ct.ctype().to_string(),
                })
                .unwrap_or_else(|| "application/octet-stream".to_string());
            Attachment {
                filename: MimeHeaders::attachment_name(part)
                    .unwrap_or("attachment")
                    .to_string(),
                mime_type,
                size: part.contents().len(),
            }
        })
        .collect();

    Some(EmailEnvelope {
        id: id.into(),
        subject: parsed.subject().unwrap_or_default().to_string(),
        from,
        to: extract_addresses(parsed.to()),
        cc: extract_addresses(parsed.cc()),
        bcc: extract_addresses(parsed.bcc()),
        date: parsed
            .date()
            .and_then(|d| DateTime::<Utc>::from_timestamp(d.to_timestamp(), 0)),
        snippet: snippet(&snippet_source),
        text_body,
        html_body,
        attachments,
    })
}

/// Extract email addresses from an optional address header.
fn extract_addresses(addr: Option<&mail_parser::Address>) -> Vec<String> {
    let Some(addr) = addr else {
        return Vec::new();
    };
    match addr {
        mail_parser::Address::List(addrs) => addrs
            .iter()
            .filter_map(|a| a.address.as_ref().map(|s| s.to_string()))
            .collect(),
        mail_parser::Address::Group(groups) => groups
            .iter()
            .flat_map(|g| {
                g.addresses
                    .iter()
                    .filter_map(|a| a.address.as_ref().map(|s| s.to_string()))
            })
            .collect(),
    }
}

fn strip_html(html: &str) -> String {
    let mut result = String::with_capacity(html.len());
    let mut in_tag = false;
    for ch in html.chars() {
        match ch {
            '<' => in_tag = true,
            '>' => {
                in_tag = false;
                result.push(' ');
            }
            _ if !in_tag => result.push(ch),
            _ => {}
        }
    }
    result
}

/// Collapse whitespace and keep the first `SNIPPET_CHARS` characters.
fn snippet(text: &str) -> String {
    text.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .chars()
        .take(SNIPPET_CHARS)
        .collect()
}
