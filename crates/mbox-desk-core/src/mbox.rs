use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};

use mail_parser::MessageParser;
use mail_parser::mailbox::mbox::MessageIterator;
use thiserror::Error;

use crate::message::{ExtractError, MessageRecord, extract_record};

pub type RecordIter<'a> = Box<dyn Iterator<Item = Result<MessageRecord, ExtractError>> + 'a>;

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("failed to open mbox {path}: {source}")]
    Open {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// A finite sequence of email records that can be re-read from the start.
pub trait MessageSource {
    fn records(&self) -> Result<RecordIter<'_>, SourceError>;
}

/// Reads messages out of an mbox file on disk.
#[derive(Debug, Clone)]
pub struct MboxSource {
    path: PathBuf,
}

impl MboxSource {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, SourceError> {
        let path = path.as_ref().to_path_buf();
        // Fail early on a missing file rather than at the first run.
        File::open(&path).map_err(|source| SourceError::Open {
            path: path.clone(),
            source,
        })?;
        Ok(Self { path })
    }
}

impl MessageSource for MboxSource {
    fn records(&self) -> Result<RecordIter<'_>, SourceError> {
        let file = File::open(&self.path).map_err(|source| SourceError::Open {
            path: self.path.clone(),
            source,
        })?;
        let parser = MessageParser::default();
        let iter = MessageIterator::new(BufReader::new(file))
            .enumerate()
            .map(move |(position, item)| {
                let entry = item.map_err(|_| ExtractError::Unsplittable { position })?;
                let envelope_date = i64::try_from(entry.internal_date()).ok();
                let raw = entry.contents();
                let message = parser
                    .parse(raw)
                    .ok_or(ExtractError::Unparseable { position })?;
                extract_record(&message, raw, envelope_date)
            });
        Ok(Box::new(iter))
    }
}

impl MessageSource for Vec<MessageRecord> {
    fn records(&self) -> Result<RecordIter<'_>, SourceError> {
        Ok(Box::new(self.iter().cloned().map(Ok)))
    }
}
