use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::{Duration as StdDuration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};

use subscout::config::ScanConfig;
use subscout::crypto::TokenCipher;
use subscout::db::Database;
use subscout::extract::SignalExtractor;
use subscout::ingest::{BATCH_DUPLICATE, CandidateStore};
use subscout::mailbox::{MailboxApi, SearchPage};
use subscout::models::{
    BillingCycle, MailboxCredential, MessageOutcome, RawMessage, StopReason, TransactionType,
};
use subscout::oauth::{OAuthClient, RefreshedToken, TokenGrant};
use subscout::pipeline::{
    CancelHandle, Cancellation, IngestionOptions, IngestionPipeline, cancellation,
};
use subscout::token::TokenManager;
use subscout::{MailboxError, OAuthError, PipelineError, ReviewStatus};

const USER: &str = "user-1";

fn cipher() -> TokenCipher {
    TokenCipher::new([3u8; 32])
}

fn message(id: &str, from: &str, subject: &str, snippet: &str) -> RawMessage {
    RawMessage {
        id: id.to_string(),
        thread_id: format!("thread-{}", id),
        from_address: Some(from.to_string()),
        subject: Some(subject.to_string()),
        snippet: Some(snippet.to_string()),
        internal_date: 1_760_000_000_000,
    }
}

fn netflix(id: &str) -> RawMessage {
    message(
        id,
        "Netflix <info@mailer.netflix.com>",
        "Your monthly membership payment",
        "processed your payment of $15.49",
    )
}

fn spotify(id: &str) -> RawMessage {
    message(
        id,
        "Spotify <no-reply@spotify.com>",
        "Your Spotify Premium receipt",
        "You paid $9.99 for your monthly plan",
    )
}

fn dropbox(id: &str) -> RawMessage {
    message(
        id,
        "Dropbox <no-reply@dropbox.com>",
        "Your Dropbox Plus subscription renewal",
        "We charged $11.99 for your monthly plan",
    )
}

/// Serves a fixed mailbox in search order, paged by offset.
#[derive(Default)]
struct FakeMailbox {
    order: Vec<String>,
    messages: HashMap<String, RawMessage>,
    /// Tokens the provider accepts.
    accepted: Mutex<HashSet<String>>,
    broken: HashSet<String>,
    rate_limited_searches: AtomicUsize,
    /// Retry-After reported with each rate limit; 1ms when unset.
    rate_limit_delay: Option<StdDuration>,
    fetch_delay: Option<StdDuration>,
    /// Cancels the batch when the named message is fetched.
    cancel_on_fetch: Mutex<Option<(String, CancelHandle)>>,
    searches: AtomicUsize,
}

impl FakeMailbox {
    fn new(messages: Vec<RawMessage>) -> Self {
        let mailbox = Self {
            order: messages.iter().map(|m| m.id.clone()).collect(),
            messages: messages.into_iter().map(|m| (m.id.clone(), m)).collect(),
            ..Default::default()
        };
        mailbox.accept("stored-access");
        mailbox
    }

    fn accept(&self, token: &str) {
        self.accepted.lock().unwrap().insert(token.to_string());
    }

    fn revoke_all(&self) {
        self.accepted.lock().unwrap().clear();
    }

    fn check(&self, token: &str) -> Result<(), MailboxError> {
        if self.accepted.lock().unwrap().contains(token) {
            Ok(())
        } else {
            Err(MailboxError::AuthExpired)
        }
    }
}

#[async_trait]
impl MailboxApi for FakeMailbox {
    async fn search(
        &self,
        access_token: &str,
        _query: &str,
        max_results: u32,
        page_token: Option<&str>,
    ) -> Result<SearchPage, MailboxError> {
        self.searches.fetch_add(1, Ordering::SeqCst);
        self.check(access_token)?;
        if self
            .rate_limited_searches
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(MailboxError::RateLimited {
                retry_after: Some(
                    self.rate_limit_delay
                        .unwrap_or(StdDuration::from_millis(1)),
                ),
            });
        }

        let start: usize = page_token.map(|t| t.parse().unwrap()).unwrap_or(0);
        let end = (start + max_results as usize).min(self.order.len());
        Ok(SearchPage {
            message_ids: self.order[start..end].to_vec(),
            next_page_token: (end < self.order.len()).then(|| end.to_string()),
            total_estimate: self.order.len() as u32,
        })
    }

    async fn fetch_metadata(
        &self,
        access_token: &str,
        message_id: &str,
    ) -> Result<RawMessage, MailboxError> {
        self.check(access_token)?;
        if let Some(delay) = self.fetch_delay {
            tokio::time::sleep(delay).await;
        }
        if let Some((id, handle)) = self.cancel_on_fetch.lock().unwrap().as_ref() {
            if id == message_id {
                handle.cancel();
            }
        }
        if self.broken.contains(message_id) {
            return Err(MailboxError::Provider("backend error".to_string()));
        }
        self.messages
            .get(message_id)
            .cloned()
            .ok_or_else(|| MailboxError::NotFound(message_id.to_string()))
    }

    async fn profile_email(&self, access_token: &str) -> Result<String, MailboxError> {
        self.check(access_token)?;
        Ok("me@example.com".to_string())
    }
}

/// Issues `fresh-N` tokens with a fixed absolute expiry.
struct FakeOAuth {
    refreshes: AtomicUsize,
    expires_at: DateTime<Utc>,
    mailbox: Option<Arc<FakeMailbox>>,
    /// Never answers refresh requests.
    hang: AtomicBool,
}

#[async_trait]
impl OAuthClient for FakeOAuth {
    async fn exchange_auth_code(&self, code: &str) -> Result<TokenGrant, OAuthError> {
        if code != "good-code" {
            return Err(OAuthError::InvalidGrant);
        }
        Ok(TokenGrant {
            access_token: "stored-access".to_string(),
            refresh_token: "stored-refresh".to_string(),
            expires_at: self.expires_at,
        })
    }

    async fn refresh_access_token(
        &self,
        refresh_token: &str,
    ) -> Result<RefreshedToken, OAuthError> {
        assert_eq!(refresh_token, "stored-refresh");
        if self.hang.load(Ordering::SeqCst) {
            tokio::time::sleep(StdDuration::from_secs(3600)).await;
        }
        let n = self.refreshes.fetch_add(1, Ordering::SeqCst) + 1;
        let token = format!("fresh-{}", n);
        if let Some(mailbox) = &self.mailbox {
            mailbox.accept(&token);
        }
        Ok(RefreshedToken {
            access_token: token,
            refresh_token: None,
            expires_at: self.expires_at,
        })
    }
}

struct Harness {
    db: Database,
    mailbox: Arc<FakeMailbox>,
    oauth: Arc<FakeOAuth>,
    pipeline: IngestionPipeline,
}

fn millis(at: DateTime<Utc>) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(at.timestamp_millis()).unwrap()
}

fn scan_config() -> ScanConfig {
    ScanConfig {
        page_size: 2,
        backoff_initial_ms: 1,
        ..ScanConfig::default()
    }
}

async fn harness(mailbox: FakeMailbox, token_expires_at: DateTime<Utc>, grant_on_refresh: bool) -> Harness {
    harness_with(mailbox, token_expires_at, grant_on_refresh, scan_config()).await
}

async fn harness_with(
    mailbox: FakeMailbox,
    token_expires_at: DateTime<Utc>,
    grant_on_refresh: bool,
    scan: ScanConfig,
) -> Harness {
    let db = Database::in_memory().await.unwrap();
    db.upsert_credential(&MailboxCredential {
        user_id: USER.to_string(),
        email: "me@example.com".to_string(),
        access_token: cipher().encrypt("stored-access").unwrap(),
        refresh_token: cipher().encrypt("stored-refresh").unwrap(),
        expires_at: millis(token_expires_at),
        connected_at: millis(Utc::now()),
    })
    .await
    .unwrap();

    let mailbox = Arc::new(mailbox);
    let oauth = Arc::new(FakeOAuth {
        refreshes: AtomicUsize::new(0),
        expires_at: millis(Utc::now() + Duration::minutes(58)),
        mailbox: grant_on_refresh.then(|| mailbox.clone()),
        hang: AtomicBool::new(false),
    });
    let tokens = Arc::new(TokenManager::new(db.clone(), cipher(), oauth.clone(), 300));
    let pipeline = IngestionPipeline::new(
        tokens,
        mailbox.clone(),
        SignalExtractor::default(),
        CandidateStore::new(db.clone(), scan.min_confidence),
        scan,
    );

    Harness {
        db,
        mailbox,
        oauth,
        pipeline,
    }
}

async fn run(h: &Harness) -> Result<subscout::BatchSummary, PipelineError> {
    h.pipeline
        .run_ingestion(USER, IngestionOptions::default(), &Cancellation::never())
        .await
}

#[tokio::test]
async fn netflix_receipt_becomes_a_pending_candidate() {
    let h = harness(FakeMailbox::new(vec![netflix("m1")]), Utc::now() + Duration::hours(1), true).await;

    let summary = run(&h).await.unwrap();
    assert_eq!((summary.saved, summary.total), (1, 1));

    let candidates = h.pipeline.get_candidates(USER, Some(ReviewStatus::Pending)).await.unwrap();
    assert_eq!(candidates.len(), 1);
    let c = &candidates[0];
    assert_eq!(c.vendor_name, "Netflix");
    assert_eq!(c.confidence, 100);
    assert_eq!(c.data.amount, Some(15.49));
    assert_eq!(c.data.currency.as_deref(), Some("USD"));
    assert_eq!(c.data.billing_cycle, BillingCycle::Monthly);
    assert!(c.data.transaction_types.contains(&TransactionType::Payment));
    assert!(!c.signals.is_empty());
    assert_eq!(h.oauth.refreshes.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn newsletter_is_counted_as_low_confidence() {
    let newsletter = message("m1", "", "Top Tech News This Week", "");
    let h = harness(FakeMailbox::new(vec![newsletter]), Utc::now() + Duration::hours(1), true).await;

    let summary = run(&h).await.unwrap();
    assert_eq!(summary.low_confidence, 1);
    assert_eq!(summary.results[0].outcome, MessageOutcome::LowConfidence { confidence: 0 });
    assert!(h.pipeline.get_candidates(USER, None).await.unwrap().is_empty());
}

#[tokio::test]
async fn second_spotify_receipt_in_batch_is_skipped() {
    let h = harness(
        FakeMailbox::new(vec![spotify("m1"), spotify("m2")]),
        Utc::now() + Duration::hours(1),
        true,
    )
    .await;

    let summary = run(&h).await.unwrap();
    assert_eq!((summary.saved, summary.skipped), (1, 1));
    assert_eq!(
        summary.results[1].outcome,
        MessageOutcome::Skipped {
            reason: BATCH_DUPLICATE.to_string()
        }
    );

    let candidates = h.pipeline.get_candidates(USER, None).await.unwrap();
    assert_eq!(candidates.len(), 1);
    assert_eq!(candidates[0].message_id, "m1");
    assert_eq!(candidates[0].status, ReviewStatus::Pending);
}

#[tokio::test]
async fn rescanning_the_same_mailbox_saves_nothing_new() {
    let h = harness(
        FakeMailbox::new(vec![netflix("m1"), spotify("m2"), netflix("m3")]),
        Utc::now() + Duration::hours(1),
        true,
    )
    .await;

    let first = run(&h).await.unwrap();
    let second = run(&h).await.unwrap();

    assert_eq!(first.saved, 2);
    assert_eq!(second.saved, 0);
    assert_eq!(second.skipped, 3);
    assert_eq!(h.pipeline.get_candidates(USER, None).await.unwrap().len(), 2);
}

#[tokio::test]
async fn unauthorized_search_retries_once_with_forced_refresh() {
    let h = harness(FakeMailbox::new(vec![netflix("m1")]), Utc::now() + Duration::hours(1), true).await;
    h.mailbox.revoke_all();

    let summary = run(&h).await.unwrap();
    assert_eq!(summary.saved, 1);
    assert_eq!(h.oauth.refreshes.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn repeated_authorization_failure_aborts_batch() {
    let h = harness(FakeMailbox::new(vec![netflix("m1")]), Utc::now() + Duration::hours(1), false).await;
    h.mailbox.revoke_all();

    let err = run(&h).await.unwrap_err();
    assert!(matches!(err, PipelineError::AuthExpired));
    assert_eq!(h.oauth.refreshes.load(Ordering::SeqCst), 1);
    assert_eq!(h.mailbox.searches.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn expiring_token_is_refreshed_and_provider_expiry_stored() {
    let h = harness(FakeMailbox::new(vec![netflix("m1")]), Utc::now() + Duration::minutes(1), true).await;

    run(&h).await.unwrap();

    let stored = h.db.find_credential(USER).await.unwrap().unwrap();
    assert_eq!(stored.expires_at, h.oauth.expires_at);
    assert_eq!(h.oauth.refreshes.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn user_without_credential_is_not_connected() {
    let h = harness(FakeMailbox::new(vec![netflix("m1")]), Utc::now() + Duration::hours(1), true).await;

    let err = h
        .pipeline
        .run_ingestion("stranger", IngestionOptions::default(), &Cancellation::never())
        .await
        .unwrap_err();
    assert!(matches!(err, PipelineError::NotConnected(ref user) if user == "stranger"));
}

#[tokio::test]
async fn failed_fetch_is_excluded_without_failing_batch() {
    let mut mailbox = FakeMailbox::new(vec![netflix("m1"), spotify("m2")]);
    mailbox.broken.insert("m1".to_string());
    let h = harness(mailbox, Utc::now() + Duration::hours(1), true).await;

    let summary = run(&h).await.unwrap();
    assert_eq!(summary.total, 1);
    assert_eq!(summary.saved, 1);
    assert_eq!(summary.results[0].message_id, "m2");
}

#[tokio::test]
async fn persistent_rate_limit_returns_resumable_partial_summary() {
    let mailbox = FakeMailbox::new(vec![netflix("m1"), spotify("m2"), dropbox("m3")]);
    let h = harness(mailbox, Utc::now() + Duration::hours(1), true).await;

    let first_page = h
        .pipeline
        .run_ingestion(
            USER,
            IngestionOptions {
                max_results: Some(2),
                ..Default::default()
            },
            &Cancellation::never(),
        )
        .await
        .unwrap();
    assert_eq!(first_page.saved, 2);
    assert!(first_page.stopped.is_none());

    h.mailbox.rate_limited_searches.store(100, Ordering::SeqCst);
    let throttled = h
        .pipeline
        .run_ingestion(
            USER,
            IngestionOptions {
                page_token: Some("2".to_string()),
                ..Default::default()
            },
            &Cancellation::never(),
        )
        .await
        .unwrap();
    assert_eq!(throttled.stopped, Some(StopReason::RateLimited));
    assert_eq!(throttled.resume_page_token.as_deref(), Some("2"));
    assert_eq!(throttled.total, 0);
    // One attempt plus three retries.
    assert_eq!(h.mailbox.searches.load(Ordering::SeqCst), 1 + 4);

    h.mailbox.rate_limited_searches.store(0, Ordering::SeqCst);
    let resumed = h
        .pipeline
        .run_ingestion(
            USER,
            IngestionOptions {
                page_token: throttled.resume_page_token.clone(),
                ..Default::default()
            },
            &Cancellation::never(),
        )
        .await
        .unwrap();
    assert_eq!(resumed.saved, 1);
    assert_eq!(resumed.results[0].message_id, "m3");
}

#[tokio::test]
async fn cancelled_scan_stops_before_first_page() {
    let h = harness(FakeMailbox::new(vec![netflix("m1")]), Utc::now() + Duration::hours(1), true).await;
    let (handle, cancel) = cancellation();
    handle.cancel();

    let summary = h
        .pipeline
        .run_ingestion(USER, IngestionOptions::default(), &cancel)
        .await
        .unwrap();
    assert_eq!(summary.stopped, Some(StopReason::Cancelled));
    assert_eq!(summary.total, 0);
    assert_eq!(h.mailbox.searches.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn cancel_during_rate_limit_backoff_stops_promptly() {
    let mut mailbox = FakeMailbox::new(vec![netflix("m1")]);
    mailbox.rate_limit_delay = Some(StdDuration::from_secs(60));
    mailbox.rate_limited_searches.store(100, Ordering::SeqCst);
    let h = harness(mailbox, Utc::now() + Duration::hours(1), true).await;
    let (handle, cancel) = cancellation();

    let started = Instant::now();
    let (summary, ()) = tokio::join!(
        h.pipeline.run_ingestion(USER, IngestionOptions::default(), &cancel),
        async {
            tokio::time::sleep(StdDuration::from_millis(100)).await;
            handle.cancel();
        }
    );
    let summary = summary.unwrap();

    assert!(started.elapsed() < StdDuration::from_secs(10));
    assert_eq!(summary.stopped, Some(StopReason::Cancelled));
    assert_eq!(summary.resume_page_token, None);
    assert_eq!(summary.total, 0);
    assert_eq!(h.mailbox.searches.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn retry_after_beyond_batch_deadline_times_out() {
    let mut mailbox = FakeMailbox::new(vec![netflix("m1")]);
    mailbox.rate_limit_delay = Some(StdDuration::from_secs(3600));
    mailbox.rate_limited_searches.store(100, Ordering::SeqCst);
    let scan = ScanConfig {
        batch_timeout_secs: 1,
        ..scan_config()
    };
    let h = harness_with(mailbox, Utc::now() + Duration::hours(1), true, scan).await;

    let started = Instant::now();
    let summary = run(&h).await.unwrap();

    assert!(started.elapsed() < StdDuration::from_secs(10));
    assert_eq!(summary.stopped, Some(StopReason::TimedOut));
    assert_eq!(h.mailbox.searches.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn batch_deadline_expiring_mid_batch_keeps_finished_pages() {
    let mut mailbox = FakeMailbox::new(vec![netflix("m1"), spotify("m2"), dropbox("m3"), netflix("m4")]);
    mailbox.fetch_delay = Some(StdDuration::from_millis(700));
    let scan = ScanConfig {
        batch_timeout_secs: 1,
        ..scan_config()
    };
    let h = harness_with(mailbox, Utc::now() + Duration::hours(1), true, scan).await;

    let summary = run(&h).await.unwrap();

    assert_eq!(summary.stopped, Some(StopReason::TimedOut));
    assert_eq!(summary.resume_page_token.as_deref(), Some("2"));
    assert_eq!((summary.total, summary.saved), (2, 2));
    assert_eq!(h.pipeline.get_candidates(USER, None).await.unwrap().len(), 2);
}

#[tokio::test]
async fn cancel_on_second_page_keeps_saved_candidates_and_resumes_there() {
    let mailbox = FakeMailbox::new(vec![netflix("m1"), spotify("m2"), dropbox("m3"), netflix("m4")]);
    let (handle, cancel) = cancellation();
    *mailbox.cancel_on_fetch.lock().unwrap() = Some(("m3".to_string(), handle));
    let h = harness(mailbox, Utc::now() + Duration::hours(1), true).await;

    let summary = h
        .pipeline
        .run_ingestion(USER, IngestionOptions::default(), &cancel)
        .await
        .unwrap();
    assert_eq!(summary.stopped, Some(StopReason::Cancelled));
    assert_eq!(summary.resume_page_token.as_deref(), Some("2"));
    assert_eq!(summary.saved, 2);
    assert_eq!(h.pipeline.get_candidates(USER, None).await.unwrap().len(), 2);

    let resumed = h
        .pipeline
        .run_ingestion(
            USER,
            IngestionOptions {
                page_token: summary.resume_page_token.clone(),
                ..Default::default()
            },
            &Cancellation::never(),
        )
        .await
        .unwrap();
    assert!(resumed.stopped.is_none());
    let ids: Vec<&str> = resumed.results.iter().map(|r| r.message_id.as_str()).collect();
    assert_eq!(ids, ["m3", "m4"]);
    assert_eq!((resumed.saved, resumed.skipped), (1, 1));
}

#[tokio::test]
async fn stalled_token_refresh_is_bounded_by_batch_deadline() {
    let scan = ScanConfig {
        batch_timeout_secs: 1,
        ..scan_config()
    };
    let h = harness_with(
        FakeMailbox::new(vec![netflix("m1")]),
        Utc::now() - Duration::minutes(1),
        true,
        scan,
    )
    .await;
    h.oauth.hang.store(true, Ordering::SeqCst);

    let summary = tokio::time::timeout(StdDuration::from_secs(10), run(&h))
        .await
        .expect("batch deadline bounds the refresh")
        .unwrap();

    assert_eq!(summary.stopped, Some(StopReason::TimedOut));
    assert_eq!(summary.total, 0);
    assert_eq!(h.mailbox.searches.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn connect_stores_encrypted_credential() {
    let db = Database::in_memory().await.unwrap();
    let mailbox = FakeMailbox::new(Vec::new());
    let expires_at = millis(Utc::now() + Duration::hours(1));
    let oauth = Arc::new(FakeOAuth {
        refreshes: AtomicUsize::new(0),
        expires_at,
        mailbox: None,
        hang: AtomicBool::new(false),
    });
    let tokens = TokenManager::new(db.clone(), cipher(), oauth, 300);

    let err = tokens.connect(USER, "bad-code", &mailbox).await.unwrap_err();
    assert!(matches!(err, PipelineError::AuthExpired));

    let credential = tokens.connect(USER, "good-code", &mailbox).await.unwrap();
    assert_eq!(credential.email, "me@example.com");

    let stored = db.find_credential(USER).await.unwrap().unwrap();
    assert_eq!(stored.expires_at, expires_at);
    assert!(!stored.access_token.contains("stored-access"));
    assert_eq!(cipher().decrypt(&stored.refresh_token).unwrap(), "stored-refresh");
    assert_eq!(tokens.get_valid_token(USER, false).await.unwrap(), "stored-access");
}

#[tokio::test]
async fn approving_a_candidate_blocks_future_duplicates() {
    let h = harness(FakeMailbox::new(vec![netflix("m1")]), Utc::now() + Duration::hours(1), true).await;
    run(&h).await.unwrap();
    let candidate = h.pipeline.get_candidates(USER, None).await.unwrap().remove(0);
    h.pipeline.store().approve(USER, &candidate.id).await.unwrap();

    let sub = h.db.find_subscription_by_vendor(USER, "NETFLIX", Some(15.49)).await.unwrap();
    assert!(sub.is_some());
    assert_eq!(
        h.pipeline.get_candidates(USER, Some(ReviewStatus::Approved)).await.unwrap().len(),
        1
    );

    let again = run(&h).await.unwrap();
    assert_eq!((again.saved, again.skipped), (0, 1));
}
