use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::Value;

use super::{GroupId, NewReply, NewTicket, TicketId, TicketingClient, TicketingError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    CreateTicket,
    AppendReply,
    EnsureGroup,
    HasTicketField,
    SetTags,
    SetCustomField,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RecordedCall {
    pub operation: Operation,
    pub ticket_id: Option<TicketId>,
    /// Whether the call returned `Ok`.
    pub succeeded: bool,
}

/// A ticket as the mock helpdesk stores it.
#[derive(Debug, Clone, PartialEq)]
pub struct MockTicket {
    pub ticket: NewTicket,
    pub replies: Vec<NewReply>,
    pub tags: Vec<String>,
    pub custom_fields: BTreeMap<String, Value>,
}

#[derive(Debug, Default)]
struct MockState {
    next_id: u64,
    tickets: BTreeMap<TicketId, MockTicket>,
    order: Vec<TicketId>,
    groups: HashMap<String, GroupId>,
    fields: HashSet<String>,
    failures: HashMap<Operation, VecDeque<TicketingError>>,
    calls: Vec<RecordedCall>,
}

/// In-memory helpdesk for tests: records every call and replays scripted failures.
#[derive(Debug, Default, Clone)]
pub struct MockTicketingClient {
    state: Arc<Mutex<MockState>>,
}

impl MockTicketingClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_group(self, name: impl Into<String>, id: u64) -> Self {
        self.lock().groups.insert(name.into(), GroupId(id));
        self
    }

    pub fn with_ticket_field(self, name: impl Into<String>) -> Self {
        self.lock().fields.insert(name.into());
        self
    }

    /// The next call of `operation` fails with `error` instead of taking effect.
    /// Repeated calls queue further failures.
    pub fn fail_next(&self, operation: Operation, error: TicketingError) {
        self.lock()
            .failures
            .entry(operation)
            .or_default()
            .push_back(error);
    }

    /// Tickets in creation order.
    pub fn tickets(&self) -> Vec<(TicketId, MockTicket)> {
        let state = self.lock();
        state
            .order
            .iter()
            .filter_map(|id| state.tickets.get(id).map(|t| (id.clone(), t.clone())))
            .collect()
    }

    pub fn ticket(&self, id: &TicketId) -> Option<MockTicket> {
        self.lock().tickets.get(id).cloned()
    }

    pub fn calls(&self) -> Vec<RecordedCall> {
        self.lock().calls.clone()
    }

    /// Number of attempts of `operation`, failed ones included.
    pub fn count(&self, operation: Operation) -> usize {
        self.lock()
            .calls
            .iter()
            .filter(|call| call.operation == operation)
            .count()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MockState> {
        self.state.lock().expect("lock mock ticketing state")
    }

    fn record<T>(
        &self,
        operation: Operation,
        ticket_id: Option<&TicketId>,
        apply: impl FnOnce(&mut MockState) -> Result<T, TicketingError>,
    ) -> Result<T, TicketingError> {
        let mut state = self.lock();
        let scripted = state
            .failures
            .get_mut(&operation)
            .and_then(VecDeque::pop_front);
        let result = match scripted {
            Some(err) => Err(err),
            None => apply(&mut state),
        };
        state.calls.push(RecordedCall {
            operation,
            ticket_id: ticket_id.cloned(),
            succeeded: result.is_ok(),
        });
        result
    }
}

fn not_found(id: &TicketId) -> TicketingError {
    TicketingError::permanent(Some(404), format!("ticket {id} not found"))
}

#[async_trait]
impl TicketingClient for MockTicketingClient {
    async fn create_ticket(&self, ticket: &NewTicket) -> Result<TicketId, TicketingError> {
        self.record(Operation::CreateTicket, None, |state| {
            state.next_id += 1;
            let id = TicketId::new(state.next_id.to_string());
            state.tickets.insert(
                id.clone(),
                MockTicket {
                    ticket: ticket.clone(),
                    replies: Vec::new(),
                    tags: ticket.tags.clone(),
                    custom_fields: BTreeMap::from([(
                        ticket.original_date_field.clone(),
                        Value::String(ticket.original_date.format("%Y-%m-%d").to_string()),
                    )]),
                },
            );
            state.order.push(id.clone());
            Ok(id)
        })
    }

    async fn append_reply(
        &self,
        ticket_id: &TicketId,
        reply: &NewReply,
    ) -> Result<(), TicketingError> {
        self.record(Operation::AppendReply, Some(ticket_id), |state| {
            let ticket = state.tickets.get_mut(ticket_id).ok_or_else(|| not_found(ticket_id))?;
            ticket.replies.push(reply.clone());
            Ok(())
        })
    }

    async fn ensure_group(&self, name: &str) -> Result<Option<GroupId>, TicketingError> {
        self.record(Operation::EnsureGroup, None, |state| {
            Ok(state.groups.get(name).copied())
        })
    }

    async fn has_ticket_field(&self, name: &str) -> Result<bool, TicketingError> {
        self.record(Operation::HasTicketField, None, |state| {
            Ok(state.fields.contains(name))
        })
    }

    async fn set_tags(&self, ticket_id: &TicketId, tags: &[String]) -> Result<(), TicketingError> {
        self.record(Operation::SetTags, Some(ticket_id), |state| {
            let ticket = state.tickets.get_mut(ticket_id).ok_or_else(|| not_found(ticket_id))?;
            ticket.tags = tags.to_vec();
            Ok(())
        })
    }

    async fn set_custom_field(
        &self,
        ticket_id: &TicketId,
        field: &str,
        value: &Value,
    ) -> Result<(), TicketingError> {
        self.record(Operation::SetCustomField, Some(ticket_id), |state| {
            let ticket = state.tickets.get_mut(ticket_id).ok_or_else(|| not_found(ticket_id))?;
            ticket.custom_fields.insert(field.to_string(), value.clone());
            Ok(())
        })
    }
}
