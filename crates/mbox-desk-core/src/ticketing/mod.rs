pub mod error;
pub mod freshdesk;
pub mod mock;
pub mod retry;

pub use error::{TicketingError, TransientKind};
pub use freshdesk::FreshdeskClient;
pub use mock::{MockTicket, MockTicketingClient, Operation, RecordedCall};
pub use retry::{RetryPolicy, RetryingClient};

use std::fmt;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::message::Participant;

/// Identifier the helpdesk assigned to a ticket.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TicketId(String);

impl TicketId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TicketId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for TicketId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct GroupId(pub u64);

impl fmt::Display for GroupId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Ticket opened from the first message of a thread.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewTicket {
    pub subject: String,
    pub description_html: String,
    pub requester: Participant,
    pub original_date: DateTime<Utc>,
    pub original_date_field: String,
    pub group_id: GroupId,
    pub tags: Vec<String>,
}

/// Follow-up entry built from a later message of the thread.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewReply {
    pub body_html: String,
    pub sender: Participant,
    pub sent_at: DateTime<Utc>,
    /// `true` when the message came from someone other than the mailbox owner.
    pub incoming: bool,
}

/// Capabilities the importer needs from a helpdesk.
#[async_trait]
pub trait TicketingClient: Send + Sync {
    async fn create_ticket(&self, ticket: &NewTicket) -> Result<TicketId, TicketingError>;

    async fn append_reply(
        &self,
        ticket_id: &TicketId,
        reply: &NewReply,
    ) -> Result<(), TicketingError>;

    /// Looks up a group by exact name. `Ok(None)` means it does not exist.
    async fn ensure_group(&self, name: &str) -> Result<Option<GroupId>, TicketingError>;

    async fn has_ticket_field(&self, name: &str) -> Result<bool, TicketingError>;

    /// Replaces the ticket's tags.
    async fn set_tags(&self, ticket_id: &TicketId, tags: &[String]) -> Result<(), TicketingError>;

    async fn set_custom_field(
        &self,
        ticket_id: &TicketId,
        field: &str,
        value: &serde_json::Value,
    ) -> Result<(), TicketingError>;
}
