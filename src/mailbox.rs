use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{self, StreamExt};

use crate::error::MailboxError;
use crate::models::RawMessage;

/// One page of search results.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SearchPage {
    pub message_ids: Vec<String>,
    pub next_page_token: Option<String>,
    pub total_estimate: u32,
}

/// Remote mailbox provider. The access token is passed on every call so a
/// refreshed token takes effect immediately.
#[async_trait]
pub trait MailboxApi: Send + Sync {
    async fn search(
        &self,
        access_token: &str,
        query: &str,
        max_results: u32,
        page_token: Option<&str>,
    ) -> Result<SearchPage, MailboxError>;

    async fn fetch_metadata(
        &self,
        access_token: &str,
        message_id: &str,
    ) -> Result<RawMessage, MailboxError>;

    async fn profile_email(&self, access_token: &str) -> Result<String, MailboxError>;
}

/// OR-joins the keywords into a provider search expression. Multi-word
/// keywords are quoted.
pub fn build_query<S: AsRef<str>>(keywords: &[S]) -> String {
    let terms: Vec<String> = keywords
        .iter()
        .map(|k| k.as_ref().trim())
        .filter(|k| !k.is_empty())
        .map(|k| {
            if k.contains(char::is_whitespace) {
                format!("\"{}\"", k.replace('"', ""))
            } else {
                k.to_string()
            }
        })
        .collect();

    match terms.len() {
        0 => String::new(),
        1 => terms[0].clone(),
        _ => format!("({})", terms.join(" OR ")),
    }
}

pub async fn with_timeout<T, F>(limit: Duration, call: F) -> Result<T, MailboxError>
where
    F: Future<Output = Result<T, MailboxError>>,
{
    match tokio::time::timeout(limit, call).await {
        Ok(result) => result,
        Err(_) => Err(MailboxError::Timeout(limit)),
    }
}

/// Fetches metadata for every id with at most `concurrency` calls in
/// flight. Results keep the order of `ids`; one failure never affects the
/// others.
pub async fn fetch_all(
    api: &dyn MailboxApi,
    access_token: &str,
    ids: &[String],
    concurrency: usize,
    timeout: Duration,
) -> Vec<(String, Result<RawMessage, MailboxError>)> {
    stream::iter(ids.iter().cloned())
        .map(|id| async move {
            let result = with_timeout(timeout, api.fetch_metadata(access_token, &id)).await;
            if let Err(e) = &result {
                tracing::debug!("Fetch of message {} failed: {}", id, e);
            }
            (id, result)
        })
        .buffered(concurrency.max(1))
        .collect()
        .await
}
