use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::header::{HeaderMap, RETRY_AFTER};
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use super::{GroupId, NewReply, NewTicket, TicketId, TicketingClient, TicketingError, TransientKind};

const GROUPS_PER_PAGE: usize = 100;
const MAX_GROUP_PAGES: usize = 50;
const MAX_ERROR_BODY: usize = 500;

/// Freshdesk v2 REST API client.
pub struct FreshdeskClient {
    http: Client,
    api_base: String,
    api_key: String,
    ticket_status: u8,
    ticket_priority: u8,
}

#[derive(Debug, Serialize)]
struct CreateTicketBody<'a> {
    email: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    name: Option<&'a str>,
    subject: &'a str,
    description: &'a str,
    status: u8,
    priority: u8,
    tags: &'a [String],
    group_id: u64,
    custom_fields: BTreeMap<&'a str, String>,
}

#[derive(Debug, Serialize)]
struct CreateNoteBody<'a> {
    body: &'a str,
    private: bool,
    incoming: bool,
}

#[derive(Debug, Deserialize)]
struct CreatedTicket {
    id: u64,
}

#[derive(Debug, Deserialize)]
struct Group {
    id: u64,
    name: String,
}

#[derive(Debug, Deserialize)]
struct TicketField {
    name: String,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    description: Option<String>,
    #[serde(default)]
    errors: Vec<FieldError>,
}

#[derive(Debug, Deserialize)]
struct FieldError {
    field: Option<String>,
    message: Option<String>,
}

impl FreshdeskClient {
    pub fn new(http: Client, domain: &str, api_key: impl Into<String>) -> Self {
        Self {
            http,
            api_base: format!("https://{domain}.freshdesk.com/api/v2"),
            api_key: api_key.into(),
            ticket_status: 5,
            ticket_priority: 1,
        }
    }

    pub fn with_api_base(mut self, api_base: impl Into<String>) -> Self {
        self.api_base = api_base.into().trim_end_matches('/').to_string();
        self
    }

    /// Status and priority given to every created ticket (Freshdesk codes).
    pub fn with_ticket_defaults(mut self, status: u8, priority: u8) -> Self {
        self.ticket_status = status;
        self.ticket_priority = priority;
        self
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.api_base, path)
    }

    async fn send(&self, request: RequestBuilder) -> Result<Response, TicketingError> {
        let response = request
            .basic_auth(&self.api_key, Some("X"))
            .send()
            .await
            .map_err(map_transport_error)?;

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let retry_after = retry_after_from_headers(response.headers());
        let body = response.text().await.unwrap_or_default();
        Err(classify_status(status, retry_after, &body))
    }

    /// Decodes a successful response. Failures at this point are permanent: the
    /// remote side already acted, so repeating the request could duplicate it.
    async fn send_json<T: DeserializeOwned>(
        &self,
        request: RequestBuilder,
    ) -> Result<T, TicketingError> {
        let response = self.send(request).await?;
        let status = response.status().as_u16();
        let body = response.text().await.map_err(|err| {
            TicketingError::permanent(Some(status), format!("response body lost: {err}"))
        })?;
        serde_json::from_str(&body).map_err(|err| {
            TicketingError::permanent(Some(status), format!("undecodable response: {err}"))
        })
    }

    async fn update_ticket(&self, ticket_id: &TicketId, body: &Value) -> Result<(), TicketingError> {
        let url = self.url(&format!("tickets/{ticket_id}"));
        self.send(self.http.put(&url).json(body)).await?;
        Ok(())
    }
}

#[async_trait]
impl TicketingClient for FreshdeskClient {
    async fn create_ticket(&self, ticket: &NewTicket) -> Result<TicketId, TicketingError> {
        let mut custom_fields = BTreeMap::new();
        custom_fields.insert(
            ticket.original_date_field.as_str(),
            format_date(ticket.original_date),
        );
        let body = CreateTicketBody {
            email: &ticket.requester.email,
            name: ticket.requester.name.as_deref(),
            subject: &ticket.subject,
            description: &ticket.description_html,
            status: self.ticket_status,
            priority: self.ticket_priority,
            tags: &ticket.tags,
            group_id: ticket.group_id.0,
            custom_fields,
        };

        let created: CreatedTicket = self
            .send_json(self.http.post(self.url("tickets")).json(&body))
            .await?;
        debug!(ticket_id = created.id, "freshdesk ticket created");
        Ok(TicketId::new(created.id.to_string()))
    }

    async fn append_reply(
        &self,
        ticket_id: &TicketId,
        reply: &NewReply,
    ) -> Result<(), TicketingError> {
        let url = self.url(&format!("tickets/{ticket_id}/notes"));
        let body = CreateNoteBody {
            body: &reply.body_html,
            private: false,
            incoming: reply.incoming,
        };
        self.send(self.http.post(&url).json(&body)).await?;
        Ok(())
    }

    async fn ensure_group(&self, name: &str) -> Result<Option<GroupId>, TicketingError> {
        let url = self.url("groups");
        for page in 1..=MAX_GROUP_PAGES {
            let groups: Vec<Group> = self
                .send_json(
                    self.http
                        .get(&url)
                        .query(&[("per_page", GROUPS_PER_PAGE), ("page", page)]),
                )
                .await?;
            if let Some(group) = groups.iter().find(|group| group.name == name) {
                return Ok(Some(GroupId(group.id)));
            }
            if groups.len() < GROUPS_PER_PAGE {
                break;
            }
        }
        Ok(None)
    }

    async fn has_ticket_field(&self, name: &str) -> Result<bool, TicketingError> {
        let fields: Vec<TicketField> = self
            .send_json(self.http.get(self.url("ticket_fields")))
            .await?;
        Ok(fields.iter().any(|field| field.name == name))
    }

    async fn set_tags(&self, ticket_id: &TicketId, tags: &[String]) -> Result<(), TicketingError> {
        self.update_ticket(ticket_id, &serde_json::json!({ "tags": tags }))
            .await
    }

    async fn set_custom_field(
        &self,
        ticket_id: &TicketId,
        field: &str,
        value: &Value,
    ) -> Result<(), TicketingError> {
        self.update_ticket(
            ticket_id,
            &serde_json::json!({ "custom_fields": { field: value } }),
        )
        .await
    }
}

fn format_date(value: DateTime<Utc>) -> String {
    value.format("%Y-%m-%d").to_string()
}

fn map_transport_error(err: reqwest::Error) -> TicketingError {
    if err.is_timeout() {
        TicketingError::transient(TransientKind::Timeout, err.to_string())
    } else if err.is_builder() {
        TicketingError::permanent(None, format!("invalid request: {err}"))
    } else {
        TicketingError::transient(TransientKind::Network, err.to_string())
    }
}

fn classify_status(status: StatusCode, retry_after: Option<Duration>, body: &str) -> TicketingError {
    let detail = error_detail(status, body);
    match status {
        StatusCode::UNAUTHORIZED => {
            TicketingError::Fatal(format!("authentication rejected: {detail}"))
        }
        StatusCode::TOO_MANY_REQUESTS => TicketingError::Transient {
            kind: TransientKind::RateLimited,
            message: detail,
            retry_after,
        },
        StatusCode::REQUEST_TIMEOUT => TicketingError::transient(TransientKind::Timeout, detail),
        status if status.is_server_error() => TicketingError::Transient {
            kind: TransientKind::Server,
            message: detail,
            retry_after,
        },
        status => TicketingError::permanent(Some(status.as_u16()), detail),
    }
}

fn error_detail(status: StatusCode, body: &str) -> String {
    if let Ok(parsed) = serde_json::from_str::<ErrorBody>(body) {
        let mut parts: Vec<String> = parsed.description.into_iter().collect();
        parts.extend(parsed.errors.into_iter().map(|err| {
            format!(
                "{}: {}",
                err.field.as_deref().unwrap_or("request"),
                err.message.as_deref().unwrap_or("invalid")
            )
        }));
        if !parts.is_empty() {
            return format!("{status}: {}", parts.join("; "));
        }
    }

    let trimmed = body.trim();
    if trimmed.is_empty() {
        status.to_string()
    } else {
        let snippet: String = trimmed.chars().take(MAX_ERROR_BODY).collect();
        format!("{status}: {snippet}")
    }
}

fn retry_after_from_headers(headers: &HeaderMap) -> Option<Duration> {
    let raw = headers.get(RETRY_AFTER)?.to_str().ok()?.trim();
    if let Ok(secs) = raw.parse::<u64>() {
        return Some(Duration::from_secs(secs));
    }

    // HTTP-date format
    let at = DateTime::parse_from_rfc2822(raw).ok()?;
    let delta_ms = (at.with_timezone(&Utc) - Utc::now()).num_milliseconds();
    (delta_ms > 0).then(|| Duration::from_millis(delta_ms as u64))
}
