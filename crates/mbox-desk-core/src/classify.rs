use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::message::MessageRecord;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Classification {
    Import,
    SkipSpam,
    SkipTrash,
    SkipAutoResponse,
}

impl Classification {
    pub fn is_import(self) -> bool {
        matches!(self, Classification::Import)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Classification::Import => "import",
            Classification::SkipSpam => "skip_spam",
            Classification::SkipTrash => "skip_trash",
            Classification::SkipAutoResponse => "skip_auto_response",
        }
    }
}

/// Decides whether a message belongs in the import.
///
/// Spam wins over trash, and both win over the auto-response signal.
#[derive(Debug, Clone)]
pub struct Classifier {
    spam_labels: BTreeSet<String>,
    trash_labels: BTreeSet<String>,
}

impl Classifier {
    pub fn new<S, T>(spam_labels: S, trash_labels: T) -> Self
    where
        S: IntoIterator,
        S::Item: AsRef<str>,
        T: IntoIterator,
        T::Item: AsRef<str>,
    {
        Self {
            spam_labels: normalize(spam_labels),
            trash_labels: normalize(trash_labels),
        }
    }

    pub fn classify(&self, record: &MessageRecord) -> Classification {
        let has_any = |wanted: &BTreeSet<String>| {
            record
                .labels
                .iter()
                .any(|label| wanted.contains(&label.to_lowercase()))
        };

        if has_any(&self.spam_labels) {
            Classification::SkipSpam
        } else if has_any(&self.trash_labels) {
            Classification::SkipTrash
        } else if record.is_auto_response {
            Classification::SkipAutoResponse
        } else {
            Classification::Import
        }
    }
}

impl Default for Classifier {
    fn default() -> Self {
        Self::new(["spam"], ["trash"])
    }
}

fn normalize<I>(labels: I) -> BTreeSet<String>
where
    I: IntoIterator,
    I::Item: AsRef<str>,
{
    labels
        .into_iter()
        .map(|label| label.as_ref().trim().to_lowercase())
        .filter(|label| !label.is_empty())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Participant;
    use chrono::{TimeZone, Utc};

    fn record(labels: &[&str], auto: bool) -> MessageRecord {
        MessageRecord {
            id: "m".into(),
            thread_id: "t".into(),
            sent_at: Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
            from: Participant {
                email: "a@b.c".into(),
                name: None,
            },
            to: vec![],
            subject: "s".into(),
            body_plain: "b".into(),
            body_html: None,
            labels: labels.iter().map(|l| l.to_string()).collect(),
            is_auto_response: auto,
        }
    }

    #[test]
    fn plain_message_is_imported() {
        let classifier = Classifier::default();
        assert_eq!(
            classifier.classify(&record(&["inbox"], false)),
            Classification::Import
        );
    }

    #[test]
    fn precedence_is_spam_then_trash_then_auto_response() {
        let classifier = Classifier::default();
        assert_eq!(
            classifier.classify(&record(&["trash", "spam"], true)),
            Classification::SkipSpam
        );
        assert_eq!(
            classifier.classify(&record(&["trash"], true)),
            Classification::SkipTrash
        );
        assert_eq!(
            classifier.classify(&record(&["inbox"], true)),
            Classification::SkipAutoResponse
        );
    }

    #[test]
    fn configured_labels_are_case_insensitive() {
        let classifier = Classifier::new(["Junk "], ["Bin"]);
        assert_eq!(
            classifier.classify(&record(&["JUNK"], false)),
            Classification::SkipSpam
        );
        assert_eq!(
            classifier.classify(&record(&["bin"], false)),
            Classification::SkipTrash
        );
        assert_eq!(
            classifier.classify(&record(&["spam"], false)),
            Classification::Import
        );
    }

    #[test]
    fn every_combination_yields_exactly_one_outcome() {
        let classifier = Classifier::default();
        let label_sets: [&[&str]; 4] = [&[], &["spam"], &["trash"], &["spam", "trash"]];
        for labels in label_sets {
            for auto in [false, true] {
                let outcome = classifier.classify(&record(labels, auto));
                let expected = if labels.contains(&"spam") {
                    Classification::SkipSpam
                } else if labels.contains(&"trash") {
                    Classification::SkipTrash
                } else if auto {
                    Classification::SkipAutoResponse
                } else {
                    Classification::Import
                };
                assert_eq!(outcome, expected, "labels={labels:?} auto={auto}");
            }
        }
    }
}
