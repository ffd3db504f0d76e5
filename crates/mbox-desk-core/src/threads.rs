use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use tracing::debug;

use crate::message::MessageRecord;

/// A conversation ready for import: messages sorted by `sent_at`, then `id`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Thread {
    thread_id: String,
    messages: Vec<MessageRecord>,
}

impl Thread {
    pub fn thread_id(&self) -> &str {
        &self.thread_id
    }

    pub fn messages(&self) -> &[MessageRecord] {
        &self.messages
    }

    /// The message that opens the ticket.
    pub fn opener(&self) -> &MessageRecord {
        &self.messages[0]
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn earliest(&self) -> DateTime<Utc> {
        self.opener().sent_at
    }
}

/// Collects importable messages and orders them into threads.
///
/// Threads come out ordered by their earliest message (ties by thread id), which
/// is also the order a resumed run walks them in.
#[derive(Debug, Default)]
pub struct ThreadGrouper {
    buckets: HashMap<String, Vec<MessageRecord>>,
    seen_ids: HashSet<String>,
    duplicates: usize,
}

impl ThreadGrouper {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a message. Returns `false` when a message with the same id was
    /// already added; the duplicate is dropped.
    pub fn push(&mut self, record: MessageRecord) -> bool {
        if !self.seen_ids.insert(record.id.clone()) {
            debug!(message_id = %record.id, "dropping duplicate message");
            self.duplicates += 1;
            return false;
        }
        self.buckets
            .entry(record.thread_id.clone())
            .or_default()
            .push(record);
        true
    }

    pub fn duplicates(&self) -> usize {
        self.duplicates
    }

    pub fn finish(self) -> Threads {
        let mut threads: Vec<Thread> = self
            .buckets
            .into_iter()
            .map(|(thread_id, mut messages)| {
                messages.sort_by(|a, b| a.sent_at.cmp(&b.sent_at).then_with(|| a.id.cmp(&b.id)));
                Thread {
                    thread_id,
                    messages,
                }
            })
            .collect();
        threads.sort_by(|a, b| {
            a.earliest()
                .cmp(&b.earliest())
                .then_with(|| a.thread_id.cmp(&b.thread_id))
        });
        Threads {
            inner: threads.into_iter(),
        }
    }
}

impl Extend<MessageRecord> for ThreadGrouper {
    fn extend<I: IntoIterator<Item = MessageRecord>>(&mut self, iter: I) {
        for record in iter {
            self.push(record);
        }
    }
}

impl FromIterator<MessageRecord> for ThreadGrouper {
    fn from_iter<I: IntoIterator<Item = MessageRecord>>(iter: I) -> Self {
        let mut grouper = ThreadGrouper::new();
        grouper.extend(iter);
        grouper
    }
}

/// Ordered threads produced by [`ThreadGrouper::finish`].
#[derive(Debug)]
pub struct Threads {
    inner: std::vec::IntoIter<Thread>,
}

impl Iterator for Threads {
    type Item = Thread;

    fn next(&mut self) -> Option<Self::Item> {
        self.inner.next()
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.inner.size_hint()
    }
}

impl ExactSizeIterator for Threads {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Participant;
    use chrono::TimeZone;

    fn msg(id: &str, thread: &str, hour: u32) -> MessageRecord {
        MessageRecord {
            id: id.into(),
            thread_id: thread.into(),
            sent_at: Utc.with_ymd_and_hms(2024, 3, 1, hour, 0, 0).unwrap(),
            from: Participant {
                email: "a@b.c".into(),
                name: None,
            },
            to: vec![],
            subject: "s".into(),
            body_plain: "b".into(),
            body_html: None,
            labels: Default::default(),
            is_auto_response: false,
        }
    }

    #[test]
    fn messages_sorted_chronologically_regardless_of_input_order() {
        let threads: Vec<Thread> = [msg("c", "t", 12), msg("a", "t", 8), msg("b", "t", 10)]
            .into_iter()
            .collect::<ThreadGrouper>()
            .finish()
            .collect();

        assert_eq!(threads.len(), 1);
        let ids: Vec<&str> = threads[0].messages().iter().map(|m| m.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b", "c"]);
        assert_eq!(threads[0].opener().id, "a");
    }

    #[test]
    fn equal_timestamps_are_ordered_by_id() {
        let threads: Vec<Thread> = [msg("z", "t", 9), msg("m", "t", 9)]
            .into_iter()
            .collect::<ThreadGrouper>()
            .finish()
            .collect();
        let ids: Vec<&str> = threads[0].messages().iter().map(|m| m.id.as_str()).collect();
        assert_eq!(ids, vec!["m", "z"]);
    }

    #[test]
    fn threads_ordered_by_earliest_message() {
        let threads: Vec<String> = [
            msg("late-1", "late", 20),
            msg("early-2", "early", 23),
            msg("early-1", "early", 1),
            msg("mid-1", "mid", 5),
        ]
        .into_iter()
        .collect::<ThreadGrouper>()
        .finish()
        .map(|t| t.thread_id().to_string())
        .collect();

        assert_eq!(threads, vec!["early", "mid", "late"]);
    }

    #[test]
    fn duplicate_message_ids_are_dropped() {
        let mut grouper = ThreadGrouper::new();
        assert!(grouper.push(msg("a", "t", 1)));
        assert!(!grouper.push(msg("a", "t", 1)));
        assert_eq!(grouper.duplicates(), 1);
        let threads: Vec<Thread> = grouper.finish().collect();
        assert_eq!(threads[0].len(), 1);
    }

    #[test]
    fn no_messages_means_no_threads() {
        assert_eq!(ThreadGrouper::new().finish().count(), 0);
    }
}
