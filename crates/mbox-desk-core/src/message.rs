use std::collections::BTreeSet;
use std::sync::LazyLock;

use chrono::{DateTime, Utc};
use mail_parser::{HeaderValue, Message, MimeHeaders, PartType};
use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

const NO_SUBJECT: &str = "(no subject)";

static AUTOMATED_SENDER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^(mailer-daemon|postmaster|no[-_]?reply)@").expect("valid sender regex")
});

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Participant {
    pub email: String,
    pub name: Option<String>,
}

impl Participant {
    /// `Name <email>` when a display name is known, otherwise the bare address.
    pub fn display(&self) -> String {
        match self.name.as_deref() {
            Some(name) if !name.trim().is_empty() => format!("{} <{}>", name.trim(), self.email),
            _ => self.email.clone(),
        }
    }
}

/// One email normalized out of the archive.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageRecord {
    pub id: String,
    pub thread_id: String,
    pub sent_at: DateTime<Utc>,
    pub from: Participant,
    pub to: Vec<String>,
    pub subject: String,
    pub body_plain: String,
    pub body_html: Option<String>,
    pub labels: BTreeSet<String>,
    pub is_auto_response: bool,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ExtractError {
    #[error("message #{position} could not be split out of the mbox")]
    Unsplittable { position: usize },
    #[error("message #{position} is not a parseable RFC 5322 message")]
    Unparseable { position: usize },
    #[error("message {id} has neither a Date header nor an mbox timestamp")]
    MissingDate { id: String },
    #[error("message {id} has no sender address")]
    MissingSender { id: String },
    #[error("message {id} has an empty body")]
    EmptyBody { id: String },
}

/// Builds a [`MessageRecord`] from a parsed message.
///
/// `raw` is the exact message bytes (used to derive a stable id when the
/// message has no `Message-ID`), `envelope_date` the unix timestamp of the mbox
/// `From ` separator line, if any.
pub fn extract_record(
    message: &Message<'_>,
    raw: &[u8],
    envelope_date: Option<i64>,
) -> Result<MessageRecord, ExtractError> {
    let id = message
        .message_id()
        .map(normalize_id)
        .filter(|id| !id.is_empty())
        .unwrap_or_else(|| Uuid::new_v5(&Uuid::NAMESPACE_OID, raw).to_string());

    let thread_id = header_text(message, "X-GM-THRID")
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
        .or_else(|| first_id(message.references()))
        .or_else(|| first_id(message.in_reply_to()))
        .unwrap_or_else(|| id.clone());

    let timestamp = message
        .date()
        .map(|date| date.to_timestamp())
        .or(envelope_date.filter(|ts| *ts > 0))
        .ok_or_else(|| ExtractError::MissingDate { id: id.clone() })?;
    let sent_at = DateTime::<Utc>::from_timestamp(timestamp, 0)
        .ok_or_else(|| ExtractError::MissingDate { id: id.clone() })?;

    let from = message
        .from()
        .and_then(|address| address.first())
        .and_then(|addr| {
            let email = addr.address()?.trim();
            (!email.is_empty()).then(|| Participant {
                email: email.to_string(),
                name: addr
                    .name()
                    .map(|name| name.trim().to_string())
                    .filter(|name| !name.is_empty()),
            })
        })
        .ok_or_else(|| ExtractError::MissingSender { id: id.clone() })?;

    let to = message
        .to()
        .map(|address| {
            address
                .iter()
                .filter_map(|addr| addr.address().map(|email| email.trim().to_string()))
                .filter(|email| !email.is_empty())
                .collect()
        })
        .unwrap_or_default();

    let subject = message
        .subject()
        .map(|subject| subject.trim().to_string())
        .filter(|subject| !subject.is_empty())
        .unwrap_or_else(|| NO_SUBJECT.to_string());

    let body_html = message
        .html_part(0)
        .and_then(|part| match &part.body {
            PartType::Html(html) => Some(html.to_string()),
            _ => None,
        })
        .filter(|html| !html.trim().is_empty());
    let body_plain = message
        .text_part(0)
        .and_then(|part| match &part.body {
            PartType::Text(text) => Some(text.to_string()),
            _ => None,
        })
        .or_else(|| message.body_text(0).map(|text| text.into_owned()))
        .unwrap_or_default();

    if body_plain.trim().is_empty() && body_html.is_none() {
        return Err(ExtractError::EmptyBody { id });
    }

    let labels = header_text(message, "X-Gmail-Labels")
        .map(|value| parse_labels(&value))
        .unwrap_or_default();

    let is_auto_response = is_automated(message, &from.email);

    Ok(MessageRecord {
        id,
        thread_id,
        sent_at,
        from,
        to,
        subject,
        body_plain,
        body_html,
        labels,
        is_auto_response,
    })
}

/// Splits a Gmail `X-Gmail-Labels` value into lower-cased label names.
pub fn parse_labels(value: &str) -> BTreeSet<String> {
    value
        .split(',')
        .map(|label| label.trim().to_lowercase())
        .filter(|label| !label.is_empty())
        .collect()
}

fn is_automated(message: &Message<'_>, sender: &str) -> bool {
    let auto_submitted = header_text(message, "Auto-Submitted")
        .map(|value| value.trim().to_lowercase())
        .unwrap_or_default();
    if !auto_submitted.is_empty() && auto_submitted != "no" {
        return true;
    }

    if header_text(message, "X-Auto-Response-Suppress")
        .is_some_and(|value| value.to_lowercase().contains("all"))
    {
        return true;
    }

    if header_text(message, "Precedence").is_some_and(|value| {
        matches!(
            value.trim().to_lowercase().as_str(),
            "bulk" | "junk" | "list"
        )
    }) {
        return true;
    }

    if message.content_type().is_some_and(|ct| {
        ct.ctype().eq_ignore_ascii_case("multipart")
            && ct
                .subtype()
                .is_some_and(|sub| sub.eq_ignore_ascii_case("report"))
    }) {
        return true;
    }

    AUTOMATED_SENDER.is_match(sender)
}

fn header_text(message: &Message<'_>, name: &str) -> Option<String> {
    message
        .headers()
        .iter()
        .find(|header| header.name().eq_ignore_ascii_case(name))
        .and_then(|header| header.value().as_text())
        .map(str::to_string)
}

fn first_id(value: &HeaderValue<'_>) -> Option<String> {
    let candidate = match value.as_text_list() {
        Some(list) => list.first().map(|id| id.to_string()),
        None => value.as_text().map(str::to_string),
    };
    candidate
        .map(|id| normalize_id(&id))
        .filter(|id| !id.is_empty())
}

fn normalize_id(id: &str) -> String {
    id.trim()
        .trim_start_matches('<')
        .trim_end_matches('>')
        .trim()
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use mail_parser::MessageParser;

    fn extract(raw: &str) -> Result<MessageRecord, ExtractError> {
        let message = MessageParser::default()
            .parse(raw.as_bytes())
            .expect("parseable message");
        extract_record(&message, raw.as_bytes(), None)
    }

    const BASIC: &str = "From: \"Alice Example\" <alice@example.com>\r\n\
To: Support <support@acme.test>, bob@example.com\r\n\
Subject: Printer on fire\r\n\
Date: Tue, 1 Oct 2024 10:00:00 +0000\r\n\
Message-ID: <m1@example.com>\r\n\
X-GM-THRID: 1812345\r\n\
X-Gmail-Labels: Inbox, Important,Opened\r\n\
\r\n\
It is on fire.\r\n";

    #[test]
    fn extracts_core_fields() {
        let record = extract(BASIC).expect("record");
        assert_eq!(record.id, "m1@example.com");
        assert_eq!(record.thread_id, "1812345");
        assert_eq!(record.from.email, "alice@example.com");
        assert_eq!(record.from.name.as_deref(), Some("Alice Example"));
        assert_eq!(
            record.to,
            vec!["support@acme.test".to_string(), "bob@example.com".to_string()]
        );
        assert_eq!(record.subject, "Printer on fire");
        assert_eq!(record.sent_at.to_rfc3339(), "2024-10-01T10:00:00+00:00");
        assert!(record.body_plain.contains("It is on fire."));
        assert!(record.body_html.is_none());
        assert!(record.labels.contains("inbox"));
        assert!(record.labels.contains("important"));
        assert!(!record.is_auto_response);
    }

    #[test]
    fn thread_id_falls_back_to_references_then_own_id() {
        let reply = "From: bob@example.com\r\n\
Subject: Re: hi\r\n\
Date: Tue, 1 Oct 2024 11:00:00 +0000\r\n\
Message-ID: <m2@example.com>\r\n\
References: <root@example.com> <m1@example.com>\r\n\
\r\n\
reply\r\n";
        assert_eq!(extract(reply).expect("record").thread_id, "root@example.com");

        let lone = "From: bob@example.com\r\n\
Date: Tue, 1 Oct 2024 11:00:00 +0000\r\n\
Message-ID: <solo@example.com>\r\n\
\r\n\
hello\r\n";
        let record = extract(lone).expect("record");
        assert_eq!(record.thread_id, "solo@example.com");
        assert_eq!(record.subject, NO_SUBJECT);
    }

    #[test]
    fn missing_message_id_gets_stable_content_id() {
        let raw = "From: bob@example.com\r\n\
Date: Tue, 1 Oct 2024 11:00:00 +0000\r\n\
\r\n\
hello\r\n";
        let first = extract(raw).expect("record");
        let second = extract(raw).expect("record");
        assert_eq!(first.id, second.id);
        assert_eq!(first.thread_id, first.id);
    }

    #[test]
    fn envelope_date_used_when_header_missing() {
        let raw = "From: bob@example.com\r\nMessage-ID: <x@y>\r\n\r\nhello\r\n";
        let message = MessageParser::default().parse(raw.as_bytes()).expect("parse");
        let record = extract_record(&message, raw.as_bytes(), Some(1_700_000_000)).expect("record");
        assert_eq!(record.sent_at.timestamp(), 1_700_000_000);

        let err = extract_record(&message, raw.as_bytes(), None).expect_err("no date");
        assert_eq!(err, ExtractError::MissingDate { id: "x@y".into() });
    }

    #[test]
    fn empty_body_is_rejected() {
        let raw = "From: bob@example.com\r\nDate: Tue, 1 Oct 2024 11:00:00 +0000\r\nMessage-ID: <e@y>\r\n\r\n   \r\n";
        assert_eq!(
            extract(raw).expect_err("empty"),
            ExtractError::EmptyBody { id: "e@y".into() }
        );
    }

    #[test]
    fn missing_sender_is_rejected() {
        let raw = "Date: Tue, 1 Oct 2024 11:00:00 +0000\r\nMessage-ID: <s@y>\r\n\r\nbody\r\n";
        assert_eq!(
            extract(raw).expect_err("no sender"),
            ExtractError::MissingSender { id: "s@y".into() }
        );
    }

    #[test]
    fn html_alternative_is_kept() {
        let raw = "From: bob@example.com\r\n\
Date: Tue, 1 Oct 2024 11:00:00 +0000\r\n\
Message-ID: <h@y>\r\n\
MIME-Version: 1.0\r\n\
Content-Type: multipart/alternative; boundary=\"b1\"\r\n\
\r\n\
--b1\r\n\
Content-Type: text/plain; charset=utf-8\r\n\
\r\n\
plain text\r\n\
--b1\r\n\
Content-Type: text/html; charset=utf-8\r\n\
\r\n\
<p>html text</p>\r\n\
--b1--\r\n";
        let record = extract(raw).expect("record");
        assert!(record.body_plain.contains("plain text"));
        assert!(record.body_html.as_deref().unwrap_or_default().contains("<p>html text</p>"));
    }

    #[test]
    fn detects_automated_messages() {
        let cases = [
            "Auto-Submitted: auto-replied\r\n",
            "Precedence: bulk\r\n",
            "X-Auto-Response-Suppress: All\r\n",
        ];
        for header in cases {
            let raw = format!(
                "From: bob@example.com\r\nDate: Tue, 1 Oct 2024 11:00:00 +0000\r\nMessage-ID: <a@y>\r\n{header}\r\nbody\r\n"
            );
            assert!(extract(&raw).expect("record").is_auto_response, "{header}");
        }

        let daemon = "From: MAILER-DAEMON@mx.example.com\r\nDate: Tue, 1 Oct 2024 11:00:00 +0000\r\nMessage-ID: <d@y>\r\n\r\nbounce\r\n";
        assert!(extract(daemon).expect("record").is_auto_response);

        let human = "From: bob@example.com\r\nAuto-Submitted: no\r\nDate: Tue, 1 Oct 2024 11:00:00 +0000\r\nMessage-ID: <n@y>\r\n\r\nhi\r\n";
        assert!(!extract(human).expect("record").is_auto_response);
    }

    #[test]
    fn participant_display_includes_name() {
        let named = Participant {
            email: "a@b.c".into(),
            name: Some("Ann".into()),
        };
        assert_eq!(named.display(), "Ann <a@b.c>");
        let bare = Participant {
            email: "a@b.c".into(),
            name: None,
        };
        assert_eq!(bare.display(), "a@b.c");
    }
}
