use std::fmt;
use std::time::Duration;

use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error, info, info_span, warn};

use crate::classify::{Classification, Classifier};
use crate::mbox::{MessageSource, SourceError};
use crate::payload::{reply_payload, ticket_payload};
use crate::progress::{ProgressError, ProgressStore};
use crate::threads::{Thread, ThreadGrouper};
use crate::ticketing::{GroupId, TicketId, TicketingClient, TicketingError};

/// Per-run constants handed over by the configuration layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImportSettings {
    pub original_date_field: String,
    pub group_name: String,
    pub tag: String,
    pub mailbox_owner: String,
    /// Pause after every successful remote write.
    pub rate_delay: Duration,
}

/// Where a thread stands while the engine works on it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ThreadState {
    Pending,
    TicketCreating,
    TicketCreated,
    RepliesAppending,
    Complete,
    Failed(String),
}

impl ThreadState {
    pub fn name(&self) -> &'static str {
        match self {
            ThreadState::Pending => "pending",
            ThreadState::TicketCreating => "ticket_creating",
            ThreadState::TicketCreated => "ticket_created",
            ThreadState::RepliesAppending => "replies_appending",
            ThreadState::Complete => "complete",
            ThreadState::Failed(_) => "failed",
        }
    }
}

impl fmt::Display for ThreadState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ThreadState::Failed(reason) => write!(f, "failed: {reason}"),
            other => f.write_str(other.name()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThreadFailure {
    pub thread_id: String,
    /// State the thread was in when the failing step ran.
    pub during: &'static str,
    pub reason: String,
}

/// Summary of one [`ImportEngine::run`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunReport {
    pub messages_seen: usize,
    pub malformed: usize,
    pub duplicates: usize,
    pub skipped_spam: usize,
    pub skipped_trash: usize,
    pub skipped_auto_response: usize,
    pub threads_total: usize,
    pub already_complete: usize,
    pub completed: usize,
    pub tickets_created: usize,
    pub replies_appended: usize,
    pub failures: Vec<ThreadFailure>,
    pub cancelled: bool,
}

impl RunReport {
    /// True when every thread ended up complete and the run was not interrupted.
    pub fn is_clean(&self) -> bool {
        !self.cancelled && self.failures.is_empty()
    }

    pub fn failed(&self) -> usize {
        self.failures.len()
    }

    fn count_skip(&mut self, classification: Classification) {
        match classification {
            Classification::SkipSpam => self.skipped_spam += 1,
            Classification::SkipTrash => self.skipped_trash += 1,
            Classification::SkipAutoResponse => self.skipped_auto_response += 1,
            Classification::Import => {}
        }
    }
}

/// Errors that abort a whole run. Failures confined to one thread land in
/// [`RunReport::failures`] instead.
#[derive(Debug, Error)]
pub enum ImportError {
    #[error("helpdesk rejected the import: {0}")]
    Fatal(#[source] TicketingError),
    #[error("custom ticket field {0:?} does not exist in the helpdesk")]
    MissingCustomField(String),
    #[error("group {0:?} does not exist in the helpdesk")]
    MissingGroup(String),
    #[error("progress store error: {0}")]
    Progress(#[from] ProgressError),
    #[error("message source error: {0}")]
    Source(#[from] SourceError),
}

/// Why work on a single thread stopped early.
#[derive(Debug)]
enum Interrupt {
    Remote(TicketingError),
    Progress(ProgressError),
    Cancelled,
}

impl From<TicketingError> for Interrupt {
    fn from(err: TicketingError) -> Self {
        match err {
            TicketingError::Cancelled => Interrupt::Cancelled,
            other => Interrupt::Remote(other),
        }
    }
}

impl From<ProgressError> for Interrupt {
    fn from(err: ProgressError) -> Self {
        Interrupt::Progress(err)
    }
}

enum Preflight {
    Ready(GroupId),
    Cancelled,
}

/// Drives threads from a [`MessageSource`] into a [`TicketingClient`],
/// committing progress after every confirmed remote step.
pub struct ImportEngine<C, S> {
    client: C,
    source: S,
    progress: ProgressStore,
    classifier: Classifier,
    settings: ImportSettings,
    cancel: CancellationToken,
}

impl<C, S> ImportEngine<C, S>
where
    C: TicketingClient,
    S: MessageSource,
{
    pub fn new(
        client: C,
        source: S,
        progress: ProgressStore,
        classifier: Classifier,
        settings: ImportSettings,
    ) -> Self {
        Self {
            client,
            source,
            progress,
            classifier,
            settings,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Token that stops the run at the next step boundary.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn progress(&self) -> &ProgressStore {
        &self.progress
    }

    /// Forgets all recorded progress so the next run starts from scratch.
    pub async fn purge(&self) -> Result<u64, ImportError> {
        let removed = self.progress.purge().await?;
        info!(removed, "progress store purged");
        Ok(removed)
    }

    pub async fn run(&self) -> Result<RunReport, ImportError> {
        let mut report = RunReport::default();
        let threads = self.collect_threads(&mut report)?;
        report.threads_total = threads.len();

        let mut pending = Vec::with_capacity(threads.len());
        for thread in threads {
            if self.progress.is_complete(thread.thread_id()).await? {
                debug!(thread_id = thread.thread_id(), "thread already imported");
                report.already_complete += 1;
            } else {
                pending.push(thread);
            }
        }

        if pending.is_empty() {
            info!(
                threads = report.threads_total,
                "nothing new to import"
            );
            return Ok(report);
        }

        if self.cancel.is_cancelled() {
            report.cancelled = true;
            return Ok(report);
        }

        let group_id = match self.preflight().await? {
            Preflight::Ready(group_id) => group_id,
            Preflight::Cancelled => {
                report.cancelled = true;
                return Ok(report);
            }
        };

        info!(
            pending = pending.len(),
            already_complete = report.already_complete,
            "starting import"
        );

        for thread in &pending {
            if self.cancel.is_cancelled() {
                report.cancelled = true;
                break;
            }

            let mut state = ThreadState::Pending;
            let span = info_span!("thread", thread_id = thread.thread_id(), messages = thread.len());
            let outcome = self
                .import_thread(thread, group_id, &mut state, &mut report)
                .instrument(span)
                .await;

            match outcome {
                Ok(()) => report.completed += 1,
                Err(Interrupt::Cancelled) => {
                    info!(
                        thread_id = thread.thread_id(),
                        state = %state,
                        "import cancelled, progress saved"
                    );
                    report.cancelled = true;
                    break;
                }
                Err(Interrupt::Progress(err)) => {
                    error!(thread_id = thread.thread_id(), error = %err, "progress commit failed");
                    return Err(err.into());
                }
                Err(Interrupt::Remote(err)) if err.is_fatal() => {
                    error!(thread_id = thread.thread_id(), error = %err, "fatal helpdesk failure");
                    return Err(ImportError::Fatal(err));
                }
                Err(Interrupt::Remote(err)) => {
                    let during = state.name();
                    state = ThreadState::Failed(err.to_string());
                    warn!(thread_id = thread.thread_id(), during, state = %state, "thread import failed");
                    report.failures.push(ThreadFailure {
                        thread_id: thread.thread_id().to_string(),
                        during,
                        reason: err.to_string(),
                    });
                }
            }
        }

        info!(
            completed = report.completed,
            failed = report.failed(),
            already_complete = report.already_complete,
            cancelled = report.cancelled,
            "import finished"
        );
        Ok(report)
    }

    fn collect_threads(&self, report: &mut RunReport) -> Result<Vec<Thread>, ImportError> {
        let mut grouper = ThreadGrouper::new();
        for item in self.source.records()? {
            report.messages_seen += 1;
            let record = match item {
                Ok(record) => record,
                Err(err) => {
                    warn!(error = %err, "skipping malformed message");
                    report.malformed += 1;
                    continue;
                }
            };

            let classification = self.classifier.classify(&record);
            if classification.is_import() {
                grouper.push(record);
            } else {
                debug!(
                    message_id = %record.id,
                    classification = classification.as_str(),
                    "message excluded"
                );
                report.count_skip(classification);
            }
        }
        report.duplicates = grouper.duplicates();
        Ok(grouper.finish().collect())
    }

    /// Checks the helpdesk has the custom date field and the target group.
    async fn preflight(&self) -> Result<Preflight, ImportError> {
        let field = &self.settings.original_date_field;
        match self.client.has_ticket_field(field).await {
            Ok(true) => {}
            Ok(false) => return Err(ImportError::MissingCustomField(field.clone())),
            Err(TicketingError::Cancelled) => return Ok(Preflight::Cancelled),
            Err(err) => return Err(ImportError::Fatal(err)),
        }

        if self.cancel.is_cancelled() {
            return Ok(Preflight::Cancelled);
        }
        let group = &self.settings.group_name;
        match self.client.ensure_group(group).await {
            Ok(Some(group_id)) => Ok(Preflight::Ready(group_id)),
            Ok(None) => Err(ImportError::MissingGroup(group.clone())),
            Err(TicketingError::Cancelled) => Ok(Preflight::Cancelled),
            Err(err) => Err(ImportError::Fatal(err)),
        }
    }

    async fn import_thread(
        &self,
        thread: &Thread,
        group_id: GroupId,
        state: &mut ThreadState,
        report: &mut RunReport,
    ) -> Result<(), Interrupt> {
        let thread_id = thread.thread_id();

        let (ticket_id, applied) = match self.progress.resume_point(thread_id).await? {
            Some(resume) => {
                info!(
                    ticket_id = %resume.remote_ticket_id,
                    applied = resume.last_message_index_applied,
                    "resuming thread"
                );
                (
                    TicketId::new(resume.remote_ticket_id),
                    resume.last_message_index_applied as usize,
                )
            }
            None => {
                self.transition(state, ThreadState::TicketCreating);
                self.ensure_not_cancelled()?;
                let ticket = ticket_payload(thread, &self.settings, group_id);
                let ticket_id = self.client.create_ticket(&ticket).await?;
                report.tickets_created += 1;

                if let Err(err) = self
                    .progress
                    .record_ticket_created(thread_id, ticket_id.as_str())
                    .await
                {
                    error!(
                        ticket_id = %ticket_id,
                        error = %err,
                        "ticket created but progress not recorded; re-running may duplicate it"
                    );
                    return Err(err.into());
                }
                self.transition(state, ThreadState::TicketCreated);
                info!(ticket_id = %ticket_id, "ticket created");
                self.pace().await?;
                (ticket_id, 1)
            }
        };

        if applied > thread.len() {
            warn!(
                applied,
                messages = thread.len(),
                "stored progress is ahead of the thread; marking complete"
            );
        }

        self.transition(state, ThreadState::RepliesAppending);
        for (index, message) in thread.messages().iter().enumerate().skip(applied) {
            self.ensure_not_cancelled()?;
            let reply = reply_payload(message, &self.settings);
            self.client.append_reply(&ticket_id, &reply).await?;
            report.replies_appended += 1;

            let position = (index + 1) as u32;
            if let Err(err) = self.progress.record_reply_applied(thread_id, position).await {
                error!(
                    ticket_id = %ticket_id,
                    message_id = %message.id,
                    position,
                    error = %err,
                    "reply appended but progress not recorded"
                );
                return Err(err.into());
            }
            debug!(ticket_id = %ticket_id, position, "reply appended");
            self.pace().await?;
        }

        self.progress.mark_complete(thread_id).await?;
        self.transition(state, ThreadState::Complete);
        info!(ticket_id = %ticket_id, "thread complete");
        Ok(())
    }

    fn transition(&self, state: &mut ThreadState, next: ThreadState) {
        debug!(from = state.name(), to = next.name(), "thread state change");
        *state = next;
    }

    fn ensure_not_cancelled(&self) -> Result<(), Interrupt> {
        if self.cancel.is_cancelled() {
            Err(Interrupt::Cancelled)
        } else {
            Ok(())
        }
    }

    async fn pace(&self) -> Result<(), Interrupt> {
        if self.settings.rate_delay.is_zero() {
            return Ok(());
        }
        tokio::select! {
            _ = self.cancel.cancelled() => Err(Interrupt::Cancelled),
            _ = tokio::time::sleep(self.settings.rate_delay) => Ok(()),
        }
    }
}
