use std::fmt;
use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransientKind {
    Network,
    Timeout,
    RateLimited,
    Server,
}

impl fmt::Display for TransientKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TransientKind::Network => "network",
            TransientKind::Timeout => "timeout",
            TransientKind::RateLimited => "rate limit",
            TransientKind::Server => "server",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Error)]
pub enum TicketingError {
    /// Worth retrying: network trouble, timeouts, 5xx, rate limiting.
    #[error("transient {kind} failure: {message}")]
    Transient {
        kind: TransientKind,
        message: String,
        retry_after: Option<Duration>,
    },
    /// The request itself was refused; repeating it will not help.
    #[error("permanent failure: {message}")]
    Permanent {
        status: Option<u16>,
        message: String,
    },
    #[error("{operation} still failing after {attempts} attempts: {last}")]
    Exhausted {
        operation: &'static str,
        attempts: u32,
        #[source]
        last: Box<TicketingError>,
    },
    /// Nothing else in the run can succeed (bad credentials and the like).
    #[error("fatal: {0}")]
    Fatal(String),
    #[error("cancelled while waiting to retry")]
    Cancelled,
}

impl TicketingError {
    pub fn transient(kind: TransientKind, message: impl Into<String>) -> Self {
        TicketingError::Transient {
            kind,
            message: message.into(),
            retry_after: None,
        }
    }

    pub fn permanent(status: Option<u16>, message: impl Into<String>) -> Self {
        TicketingError::Permanent {
            status,
            message: message.into(),
        }
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, TicketingError::Transient { .. })
    }

    pub fn is_fatal(&self) -> bool {
        matches!(self, TicketingError::Fatal(_))
    }

    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            TicketingError::Transient { retry_after, .. } => *retry_after,
            _ => None,
        }
    }
}
