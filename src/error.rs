use std::time::Duration;

use crate::models::ReviewStatus;

/// Failures reported by the remote mailbox provider.
#[derive(Debug, thiserror::Error)]
pub enum MailboxError {
    #[error("Access token rejected by provider")]
    AuthExpired,
    #[error("Provider rate limit hit")]
    RateLimited { retry_after: Option<Duration> },
    #[error("Message {0} not found")]
    NotFound(String),
    #[error("Provider call timed out after {0:?}")]
    Timeout(Duration),
    #[error("Provider error: {0}")]
    Provider(String),
}

/// Failures from the OAuth token endpoint.
#[derive(Debug, thiserror::Error)]
pub enum OAuthError {
    #[error("Refresh token revoked or expired")]
    InvalidGrant,
    #[error("HTTP: {0}")]
    Http(#[from] hyper::Error),
    #[error("Token endpoint returned {status}: {message}")]
    Endpoint { status: u16, message: String },
    #[error("Malformed token response: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("Token response missing {0}")]
    MissingField(&'static str),
    #[error("Invalid token request: {0}")]
    Request(String),
    #[error("Token endpoint timed out after {0:?}")]
    Timeout(Duration),
}

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("User {0} has not connected a mailbox")]
    NotConnected(String),
    #[error("Mailbox authorization expired; reconnect required")]
    AuthExpired,
    #[error("Provider rate limit hit")]
    RateLimited { retry_after: Option<Duration> },
    #[error("Malformed message: {0}")]
    MalformedMessage(String),
    #[error("Storage: {0}")]
    Persistence(#[from] sqlx::Error),
    #[error("Token encryption: {0}")]
    Crypto(String),
    #[error("Provider: {0}")]
    Provider(String),
    #[error("Configuration: {0}")]
    Config(String),
    #[error("Candidate {id} not found")]
    CandidateNotFound { id: String },
    #[error("Subscription {id} not found")]
    SubscriptionNotFound { id: String },
    #[error("Candidate {id} is {from:?} and cannot become {to:?}")]
    InvalidTransition {
        id: String,
        from: ReviewStatus,
        to: ReviewStatus,
    },
}

impl From<MailboxError> for PipelineError {
    fn from(err: MailboxError) -> Self {
        match err {
            MailboxError::AuthExpired => PipelineError::AuthExpired,
            MailboxError::RateLimited { retry_after } => PipelineError::RateLimited { retry_after },
            other => PipelineError::Provider(other.to_string()),
        }
    }
}

impl From<OAuthError> for PipelineError {
    fn from(err: OAuthError) -> Self {
        match err {
            OAuthError::InvalidGrant => PipelineError::AuthExpired,
            other => PipelineError::Provider(other.to_string()),
        }
    }
}
