//! Finds recurring-payment emails in a user's mailbox and turns them into
//! reviewable subscription candidates.

pub mod config;
pub mod crypto;
pub mod db;
pub mod error;
pub mod extract;
pub mod gmail;
pub mod ingest;
pub mod mailbox;
pub mod models;
pub mod oauth;
pub mod pipeline;
pub mod token;
pub mod vendor;

pub use error::{MailboxError, OAuthError, PipelineError};
pub use models::{BatchSummary, ReviewStatus, SubscriptionCandidate};
pub use pipeline::{Cancellation, IngestionOptions, IngestionPipeline};
