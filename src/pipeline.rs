//! Batch orchestration: token → search → fetch → extract → dedup/store.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::Instant;

use crate::config::ScanConfig;
use crate::error::{MailboxError, PipelineError};
use crate::extract::SignalExtractor;
use crate::ingest::{BatchDedup, CandidateStore};
use crate::mailbox::{MailboxApi, SearchPage, build_query, fetch_all, with_timeout};
use crate::models::{BatchSummary, RawMessage, ReviewStatus, StopReason, SubscriptionCandidate};
use crate::token::TokenManager;

/// Per-run overrides. Unset fields fall back to `[scan]` settings.
#[derive(Debug, Clone, Default)]
pub struct IngestionOptions {
    pub max_results: Option<u32>,
    pub keywords: Option<Vec<String>>,
    /// Resume token returned by an earlier, interrupted run.
    pub page_token: Option<String>,
}

/// Read side of a cancellation signal.
#[derive(Debug, Clone)]
pub struct Cancellation {
    rx: watch::Receiver<bool>,
}

#[derive(Debug)]
pub struct CancelHandle {
    tx: watch::Sender<bool>,
}

pub fn cancellation() -> (CancelHandle, Cancellation) {
    let (tx, rx) = watch::channel(false);
    (CancelHandle { tx }, Cancellation { rx })
}

impl CancelHandle {
    pub fn cancel(&self) {
        let _ = self.tx.send(true);
    }
}

impl Cancellation {
    pub fn never() -> Self {
        cancellation().1
    }

    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once cancellation is requested. Never resolves when the
    /// handle was dropped without cancelling.
    pub async fn cancelled(&self) {
        let mut rx = self.rx.clone();
        if rx.wait_for(|cancelled| *cancelled).await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

/// Why a step of the batch did not complete.
enum Halt {
    Stop(StopReason),
    Fail(PipelineError),
}

impl From<PipelineError> for Halt {
    fn from(err: PipelineError) -> Self {
        Halt::Fail(err)
    }
}

impl From<StopReason> for Halt {
    fn from(reason: StopReason) -> Self {
        Halt::Stop(reason)
    }
}

/// Bounds for one batch: every wait and provider call races these.
#[derive(Clone, Copy)]
struct Bounds<'a> {
    cancel: &'a Cancellation,
    deadline: Instant,
}

impl Bounds<'_> {
    fn interruption(&self) -> Option<StopReason> {
        if self.cancel.is_cancelled() {
            Some(StopReason::Cancelled)
        } else if Instant::now() >= self.deadline {
            Some(StopReason::TimedOut)
        } else {
            None
        }
    }

    async fn race<T>(&self, fut: impl Future<Output = T>) -> Result<T, StopReason> {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(StopReason::Cancelled),
            _ = tokio::time::sleep_until(self.deadline) => Err(StopReason::TimedOut),
            out = fut => Ok(out),
        }
    }

    async fn pause(&self, delay: Duration) -> Result<(), StopReason> {
        self.race(tokio::time::sleep(delay)).await
    }
}

struct AuthState {
    token: String,
    refreshed: bool,
}

pub struct IngestionPipeline {
    tokens: Arc<TokenManager>,
    mailbox: Arc<dyn MailboxApi>,
    extractor: SignalExtractor,
    store: CandidateStore,
    scan: ScanConfig,
}

impl IngestionPipeline {
    pub fn new(
        tokens: Arc<TokenManager>,
        mailbox: Arc<dyn MailboxApi>,
        extractor: SignalExtractor,
        store: CandidateStore,
        scan: ScanConfig,
    ) -> Self {
        Self {
            tokens,
            mailbox,
            extractor,
            store,
            scan,
        }
    }

    pub fn store(&self) -> &CandidateStore {
        &self.store
    }

    /// Runs one ingestion batch for `user_id`.
    ///
    /// Only credential and provider-auth failures abort the batch. A rate
    /// limit that outlasts the retry budget ends it early with `stopped` and
    /// `resume_page_token` set, as do cancellation and the batch deadline.
    /// Those two are raced against every provider call, token refresh and
    /// backoff wait.
    pub async fn run_ingestion(
        &self,
        user_id: &str,
        options: IngestionOptions,
        cancel: &Cancellation,
    ) -> Result<BatchSummary, PipelineError> {
        let keywords = options.keywords.unwrap_or_else(|| self.scan.keywords.clone());
        let query = build_query(&keywords);
        let max_results = options.max_results.unwrap_or(self.scan.max_results);
        let deadline = Instant::now() + self.scan.batch_timeout();

        tracing::info!(
            "Starting ingestion for {} (query {:?}, max {})",
            user_id,
            query,
            max_results
        );

        let bounds = Bounds { cancel, deadline };
        let mut summary = BatchSummary::default();
        let mut page_token = options.page_token;

        let mut auth = match bounds.race(self.tokens.get_valid_token(user_id, false)).await {
            Ok(token) => AuthState {
                token: token?,
                refreshed: false,
            },
            Err(reason) => {
                summary.stopped = Some(reason);
                summary.resume_page_token = page_token;
                tracing::warn!("Ingestion for {} stopped before search: {:?}", user_id, reason);
                return Ok(summary);
            }
        };
        let mut dedup = BatchDedup::default();
        let mut remaining = max_results;

        'pages: while remaining > 0 {
            if let Some(reason) = bounds.interruption() {
                summary.stopped = Some(reason);
                summary.resume_page_token = page_token;
                break;
            }

            let page_size = remaining.min(self.scan.page_size.max(1));
            let page = match self
                .search_page(&mut auth, bounds, user_id, &query, page_size, page_token.as_deref())
                .await
            {
                Ok(page) => page,
                Err(Halt::Stop(reason)) => {
                    summary.stopped = Some(reason);
                    summary.resume_page_token = page_token;
                    break;
                }
                Err(Halt::Fail(e)) => return Err(e),
            };

            let ids: Vec<String> = page
                .message_ids
                .iter()
                .take(remaining as usize)
                .cloned()
                .collect();
            tracing::debug!(
                "Page returned {} ids (estimate {})",
                ids.len(),
                page.total_estimate
            );

            let messages = match self.fetch_page(&mut auth, bounds, user_id, &ids).await {
                Ok(messages) => messages,
                Err(Halt::Stop(reason)) => {
                    summary.stopped = Some(reason);
                    summary.resume_page_token = page_token;
                    break;
                }
                Err(Halt::Fail(e)) => return Err(e),
            };

            for message in &messages {
                if let Some(reason) = bounds.interruption() {
                    // Re-reading this page on resume is safe; stored
                    // messages are skipped by id.
                    summary.stopped = Some(reason);
                    summary.resume_page_token = page_token;
                    break 'pages;
                }
                let signal = self.extractor.parse(message);
                let result = self.store.ingest_one(&mut dedup, &signal, user_id).await;
                summary.record(result);
            }

            remaining = remaining.saturating_sub(ids.len() as u32);
            match page.next_page_token {
                Some(next) if !ids.is_empty() => page_token = Some(next),
                _ => break,
            }
        }

        if let Some(reason) = summary.stopped {
            tracing::warn!("Ingestion for {} stopped early: {:?}", user_id, reason);
        }
        tracing::info!(
            "Ingestion for {} finished: {} saved, {} skipped, {} low confidence, {} errors",
            user_id,
            summary.saved,
            summary.skipped,
            summary.low_confidence,
            summary.errors
        );
        Ok(summary)
    }

    pub async fn get_candidates(
        &self,
        user_id: &str,
        status: Option<ReviewStatus>,
    ) -> Result<Vec<SubscriptionCandidate>, PipelineError> {
        self.store.get_candidates(user_id, status).await
    }

    async fn search_page(
        &self,
        auth: &mut AuthState,
        bounds: Bounds<'_>,
        user_id: &str,
        query: &str,
        page_size: u32,
        page_token: Option<&str>,
    ) -> Result<SearchPage, Halt> {
        let mut attempt = 0;
        loop {
            let result = bounds
                .race(with_timeout(
                    self.scan.request_timeout(),
                    self.mailbox.search(&auth.token, query, page_size, page_token),
                ))
                .await?;

            match result {
                Ok(page) => return Ok(page),
                Err(MailboxError::AuthExpired) => self.reauthorize(auth, bounds, user_id).await?,
                Err(MailboxError::RateLimited { retry_after }) => {
                    attempt += 1;
                    if attempt > self.scan.rate_limit_retries {
                        return Err(StopReason::RateLimited.into());
                    }
                    let delay = retry_after.unwrap_or_else(|| self.scan.backoff(attempt));
                    tracing::warn!("Search rate limited; retrying in {:?}", delay);
                    bounds.pause(delay).await?;
                }
                Err(e) => return Err(PipelineError::from(e).into()),
            }
        }
    }

    /// Fetches a page of messages. Auth and rate-limit failures are retried
    /// as a group; any other failure drops just that message.
    async fn fetch_page(
        &self,
        auth: &mut AuthState,
        bounds: Bounds<'_>,
        user_id: &str,
        ids: &[String],
    ) -> Result<Vec<RawMessage>, Halt> {
        let mut fetched: HashMap<String, RawMessage> = HashMap::with_capacity(ids.len());
        let mut pending = ids.to_vec();
        let mut attempt = 0;

        while !pending.is_empty() {
            let results = bounds
                .race(fetch_all(
                    self.mailbox.as_ref(),
                    &auth.token,
                    &pending,
                    self.scan.fetch_concurrency,
                    self.scan.request_timeout(),
                ))
                .await?;

            let mut unauthorized = Vec::new();
            let mut limited = Vec::new();
            let mut retry_after = None;
            for (id, result) in results {
                match result {
                    Ok(message) => {
                        fetched.insert(id, message);
                    }
                    Err(MailboxError::AuthExpired) => unauthorized.push(id),
                    Err(MailboxError::RateLimited { retry_after: after }) => {
                        retry_after = retry_after.or(after);
                        limited.push(id);
                    }
                    Err(e) => tracing::warn!("Skipping message {}: {}", id, e),
                }
            }

            if !unauthorized.is_empty() {
                self.reauthorize(auth, bounds, user_id).await?;
            } else if !limited.is_empty() {
                attempt += 1;
                if attempt > self.scan.rate_limit_retries {
                    return Err(StopReason::RateLimited.into());
                }
                let delay = retry_after.unwrap_or_else(|| self.scan.backoff(attempt));
                tracing::warn!(
                    "{} fetches rate limited; retrying in {:?}",
                    limited.len(),
                    delay
                );
                bounds.pause(delay).await?;
            }

            pending = unauthorized;
            pending.extend(limited);
        }

        Ok(ids.iter().filter_map(|id| fetched.remove(id)).collect())
    }

    /// One forced refresh per batch; a second authorization failure is fatal.
    async fn reauthorize(
        &self,
        auth: &mut AuthState,
        bounds: Bounds<'_>,
        user_id: &str,
    ) -> Result<(), Halt> {
        if auth.refreshed {
            tracing::warn!("Provider rejected refreshed token for {}", user_id);
            return Err(PipelineError::AuthExpired.into());
        }
        auth.refreshed = true;
        auth.token = bounds.race(self.tokens.get_valid_token(user_id, true)).await??;
        tracing::info!("Retrying with refreshed token for {}", user_id);
        Ok(())
    }
}
