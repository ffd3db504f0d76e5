pub mod classify;
pub mod config;
pub mod db;
pub mod engine;
pub mod mbox;
pub mod message;
pub mod migrations;
pub mod payload;
pub mod progress;
pub mod telemetry;
pub mod threads;
pub mod ticketing;

pub use classify::{Classification, Classifier};
pub use config::Config;
pub use db::Database;
pub use engine::{ImportEngine, ImportError, ImportSettings, RunReport, ThreadFailure, ThreadState};
pub use mbox::{MboxSource, MessageSource};
pub use message::{MessageRecord, Participant};
pub use progress::{ImportRecord, ImportStatus, ProgressStore};
pub use telemetry::{TelemetryError, TelemetryGuard, init_telemetry};
pub use threads::{Thread, ThreadGrouper};
pub use ticketing::{
    FreshdeskClient, MockTicketingClient, RetryPolicy, RetryingClient, TicketId, TicketingClient,
    TicketingError,
};
