//! Turns threads and messages into helpdesk requests.

use crate::engine::ImportSettings;
use crate::message::{MessageRecord, Participant};
use crate::threads::Thread;
use crate::ticketing::{GroupId, NewReply, NewTicket};

/// Escapes the five HTML special characters.
pub fn html_escape(input: &str) -> String {
    let mut escaped = String::with_capacity(input.len());
    for ch in input.chars() {
        match ch {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&#x27;"),
            _ => escaped.push(ch),
        }
    }
    escaped
}

/// HTML fragment for one message: a bold date/sender line followed by the body.
///
/// HTML bodies are kept as-is, plain bodies are escaped with line breaks
/// preserved.
pub fn render_message_html(message: &MessageRecord) -> String {
    let heading = format!(
        "<strong>{} {}</strong>",
        message.sent_at.format("%Y-%m-%d %H:%M:%S UTC"),
        html_escape(&message.from.display())
    );

    match message.body_html.as_deref().filter(|html| !html.trim().is_empty()) {
        Some(html) => format!("<p>{heading}</p>{html}"),
        None => {
            let body = html_escape(message.body_plain.trim_end())
                .replace("\r\n", "\n")
                .replace('\n', "<br>");
            format!("<p>{heading}<br>{body}</p>")
        }
    }
}

fn is_owner(participant: &Participant, settings: &ImportSettings) -> bool {
    participant.email.eq_ignore_ascii_case(settings.mailbox_owner.trim())
}

/// Ticket request for a thread's opening message.
///
/// When the mailbox owner wrote the opener, the first recipient becomes the
/// requester so the ticket belongs to the customer.
pub fn ticket_payload(thread: &Thread, settings: &ImportSettings, group_id: GroupId) -> NewTicket {
    let opener = thread.opener();
    let requester = if is_owner(&opener.from, settings) {
        opener
            .to
            .first()
            .map(|email| Participant {
                email: email.clone(),
                name: None,
            })
            .unwrap_or_else(|| opener.from.clone())
    } else {
        opener.from.clone()
    };

    NewTicket {
        subject: opener.subject.clone(),
        description_html: render_message_html(opener),
        requester,
        original_date: opener.sent_at,
        original_date_field: settings.original_date_field.clone(),
        group_id,
        tags: vec![settings.tag.clone()],
    }
}

/// Reply request for a later message of a thread.
pub fn reply_payload(message: &MessageRecord, settings: &ImportSettings) -> NewReply {
    NewReply {
        body_html: render_message_html(message),
        sender: message.from.clone(),
        sent_at: message.sent_at,
        incoming: !is_owner(&message.from, settings),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::threads::ThreadGrouper;
    use chrono::{TimeZone, Utc};
    use std::collections::BTreeSet;
    use std::time::Duration;

    fn settings() -> ImportSettings {
        ImportSettings {
            original_date_field: "cf_original_date".into(),
            group_name: "imported".into(),
            tag: "imported".into(),
            mailbox_owner: "Support@Acme.test".into(),
            rate_delay: Duration::ZERO,
        }
    }

    fn record(id: &str, from: &str, minute: u32) -> MessageRecord {
        MessageRecord {
            id: id.into(),
            thread_id: "t1".into(),
            sent_at: Utc.with_ymd_and_hms(2024, 3, 1, 9, minute, 0).unwrap(),
            from: Participant {
                email: from.into(),
                name: Some("Sender & Co".into()),
            },
            to: vec!["customer@example.com".into()],
            subject: "Order <42>".into(),
            body_plain: "line one\nline <two>\n".into(),
            body_html: None,
            labels: BTreeSet::new(),
            is_auto_response: false,
        }
    }

    #[test]
    fn escapes_special_characters() {
        assert_eq!(
            html_escape(r#"<a href="x">Tom & 'Jerry'</a>"#),
            "&lt;a href=&quot;x&quot;&gt;Tom &amp; &#x27;Jerry&#x27;&lt;/a&gt;"
        );
    }

    #[test]
    fn plain_body_is_escaped_with_breaks() {
        let html = render_message_html(&record("m1", "alice@example.com", 5));
        assert_eq!(
            html,
            "<p><strong>2024-03-01 09:05:00 UTC Sender &amp; Co &lt;alice@example.com&gt;</strong>\
             <br>line one<br>line &lt;two&gt;</p>"
        );
    }

    #[test]
    fn html_body_is_kept_verbatim() {
        let mut message = record("m1", "alice@example.com", 5);
        message.body_html = Some("<div><b>hi</b></div>".into());
        let html = render_message_html(&message);
        assert!(html.ends_with("</p><div><b>hi</b></div>"), "{html}");
    }

    #[test]
    fn ticket_uses_opener_sender_as_requester() {
        let thread = ThreadGrouper::from_iter([
            record("m2", "support@acme.test", 10),
            record("m1", "alice@example.com", 5),
        ])
        .finish()
        .next()
        .expect("one thread");

        let ticket = ticket_payload(&thread, &settings(), GroupId(4));
        assert_eq!(ticket.requester.email, "alice@example.com");
        assert_eq!(ticket.subject, "Order <42>");
        assert_eq!(ticket.tags, vec!["imported".to_string()]);
        assert_eq!(ticket.group_id, GroupId(4));
        assert_eq!(ticket.original_date, thread.opener().sent_at);
        assert_eq!(ticket.original_date_field, "cf_original_date");
    }

    #[test]
    fn owner_opened_thread_is_requested_by_recipient() {
        let thread = ThreadGrouper::from_iter([record("m1", "support@acme.test", 5)])
            .finish()
            .next()
            .expect("one thread");

        let ticket = ticket_payload(&thread, &settings(), GroupId(1));
        assert_eq!(ticket.requester.email, "customer@example.com");
        assert_eq!(ticket.requester.name, None);
    }

    #[test]
    fn reply_direction_follows_owner() {
        let settings = settings();
        assert!(reply_payload(&record("m1", "alice@example.com", 1), &settings).incoming);
        assert!(!reply_payload(&record("m2", "SUPPORT@acme.test", 2), &settings).incoming);
    }
}
