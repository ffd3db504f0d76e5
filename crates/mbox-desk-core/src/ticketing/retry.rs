use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use super::{GroupId, NewReply, NewTicket, TicketId, TicketingClient, TicketingError};

/// Exponential backoff schedule applied to transient failures.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts including the first one.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub multiplier: f64,
    pub max_delay: Duration,
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_secs(1),
            multiplier: 2.0,
            max_delay: Duration::from_secs(60),
            jitter: true,
        }
    }
}

impl RetryPolicy {
    /// Same attempt budget, no waiting between attempts.
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            base_delay: Duration::ZERO,
            multiplier: 1.0,
            max_delay: Duration::ZERO,
            jitter: false,
        }
    }

    /// Delay to wait after failed attempt number `attempt` (1-based).
    ///
    /// A server-provided `retry_after` acts as a floor; the result never
    /// exceeds `max_delay`.
    pub fn delay_for(&self, attempt: u32, retry_after: Option<Duration>) -> Duration {
        let exp = attempt.saturating_sub(1).min(30) as i32;
        let mut secs = self.base_delay.as_secs_f64() * self.multiplier.powi(exp);
        if self.jitter {
            let factor: f64 = rand::thread_rng().gen_range(0.75..=1.25);
            secs *= factor;
        }
        let max = self.max_delay.as_secs_f64();
        if !secs.is_finite() {
            secs = max;
        }
        let mut delay = Duration::from_secs_f64(secs.clamp(0.0, max));
        if let Some(floor) = retry_after {
            delay = delay.max(floor);
        }
        delay.min(self.max_delay)
    }
}

/// Wraps a [`TicketingClient`] and retries transient failures.
///
/// Permanent and fatal errors pass through untouched. When the attempt budget
/// runs out the last error is wrapped in [`TicketingError::Exhausted`].
pub struct RetryingClient<C> {
    inner: C,
    policy: RetryPolicy,
    cancel: CancellationToken,
}

impl<C: TicketingClient> RetryingClient<C> {
    pub fn new(inner: C, policy: RetryPolicy) -> Self {
        Self {
            inner,
            policy,
            cancel: CancellationToken::new(),
        }
    }

    /// Backoff sleeps end early with [`TicketingError::Cancelled`] once `cancel` fires.
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    async fn call<T, F, Fut>(
        &self,
        operation: &'static str,
        mut attempt_fn: F,
    ) -> Result<T, TicketingError>
    where
        F: FnMut() -> Fut + Send,
        Fut: Future<Output = Result<T, TicketingError>> + Send,
        T: Send,
    {
        let max_attempts = self.policy.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            let err = match attempt_fn().await {
                Ok(value) => return Ok(value),
                Err(err) if err.is_transient() => err,
                Err(err) => return Err(err),
            };

            if attempt >= max_attempts {
                return Err(TicketingError::Exhausted {
                    operation,
                    attempts: attempt,
                    last: Box::new(err),
                });
            }

            let delay = self.policy.delay_for(attempt, err.retry_after());
            warn!(
                operation,
                attempt,
                max_attempts,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "transient helpdesk failure, retrying"
            );

            tokio::select! {
                _ = self.cancel.cancelled() => return Err(TicketingError::Cancelled),
                _ = tokio::time::sleep(delay) => {}
            }
            attempt += 1;
        }
    }
}

#[async_trait]
impl<C: TicketingClient> TicketingClient for RetryingClient<C> {
    async fn create_ticket(&self, ticket: &NewTicket) -> Result<TicketId, TicketingError> {
        self.call("create_ticket", || self.inner.create_ticket(ticket))
            .await
    }

    async fn append_reply(
        &self,
        ticket_id: &TicketId,
        reply: &NewReply,
    ) -> Result<(), TicketingError> {
        self.call("append_reply", || self.inner.append_reply(ticket_id, reply))
            .await
    }

    async fn ensure_group(&self, name: &str) -> Result<Option<GroupId>, TicketingError> {
        self.call("ensure_group", || self.inner.ensure_group(name))
            .await
    }

    async fn has_ticket_field(&self, name: &str) -> Result<bool, TicketingError> {
        self.call("has_ticket_field", || self.inner.has_ticket_field(name))
            .await
    }

    async fn set_tags(&self, ticket_id: &TicketId, tags: &[String]) -> Result<(), TicketingError> {
        self.call("set_tags", || self.inner.set_tags(ticket_id, tags))
            .await
    }

    async fn set_custom_field(
        &self,
        ticket_id: &TicketId,
        field: &str,
        value: &Value,
    ) -> Result<(), TicketingError> {
        self.call("set_custom_field", || {
            self.inner.set_custom_field(ticket_id, field, value)
        })
        .await
    }
}
