use std::collections::HashSet;

use chrono::Utc;

use crate::db::{Database, InsertOutcome};
use crate::error::PipelineError;
use crate::models::{
    BatchSummary, CandidateMetadata, ExtractedData, MessageOutcome, MessageResult, ParsedSignal,
    ResolutionMethod, ReviewStatus, SubscriptionCandidate, TransactionType, VendorMatch,
};

pub const BATCH_DUPLICATE: &str = "Already processed in this batch";

/// `(vendor, amount)` keys already seen in the current batch. Amounts are
/// compared in cents; a missing amount keys as zero.
#[derive(Debug, Default)]
pub struct BatchDedup {
    seen: HashSet<(String, i64)>,
}

impl BatchDedup {
    /// True the first time a key is offered.
    pub fn first_sighting(&mut self, vendor: &str, amount: Option<f64>) -> bool {
        let cents = (amount.unwrap_or(0.0) * 100.0).round() as i64;
        self.seen.insert((vendor.to_lowercase(), cents))
    }
}

/// Deduplicates parsed signals and persists the survivors as pending
/// candidates.
#[derive(Clone)]
pub struct CandidateStore {
    db: Database,
    min_confidence: u8,
}

impl CandidateStore {
    pub fn new(db: Database, min_confidence: u8) -> Self {
        Self { db, min_confidence }
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    pub async fn ingest(&self, signals: &[ParsedSignal], user_id: &str) -> BatchSummary {
        let mut dedup = BatchDedup::default();
        let mut summary = BatchSummary::default();
        for signal in signals {
            summary.record(self.ingest_one(&mut dedup, signal, user_id).await);
        }
        summary
    }

    /// Decides the outcome for one signal. Storage failures are reported as
    /// an `Error` outcome, never returned.
    pub async fn ingest_one(
        &self,
        dedup: &mut BatchDedup,
        signal: &ParsedSignal,
        user_id: &str,
    ) -> MessageResult {
        let result = |outcome| MessageResult {
            message_id: signal.message_id.clone(),
            vendor: signal.vendor_name().map(str::to_string),
            outcome,
        };

        let vendor = match &signal.vendor {
            Some(vendor) if signal.parsed && signal.confidence >= self.min_confidence => vendor,
            _ => {
                tracing::debug!(
                    "Message {} below threshold ({} < {})",
                    signal.message_id,
                    signal.confidence,
                    self.min_confidence
                );
                return result(MessageOutcome::LowConfidence {
                    confidence: signal.confidence,
                });
            }
        };

        if !dedup.first_sighting(&vendor.name, signal.amount) {
            return result(MessageOutcome::Skipped {
                reason: BATCH_DUPLICATE.to_string(),
            });
        }

        match self.find_duplicate(user_id, signal, &vendor.name).await {
            Ok(Some(reason)) => {
                tracing::debug!("Message {} skipped: {}", signal.message_id, reason);
                return result(MessageOutcome::Skipped { reason });
            }
            Ok(None) => {}
            Err(e) => {
                tracing::warn!("Duplicate check failed for {}: {}", signal.message_id, e);
                return result(MessageOutcome::Error {
                    message: e.to_string(),
                });
            }
        }

        let candidate = build_candidate(user_id, signal, vendor);
        match self.db.insert_candidate(&candidate).await {
            Ok(InsertOutcome::Inserted) => {
                tracing::debug!("Saved candidate {} for {}", candidate.id, vendor.name);
                result(MessageOutcome::Saved {
                    candidate_id: candidate.id,
                })
            }
            Ok(InsertOutcome::AlreadyExists) => result(MessageOutcome::Skipped {
                reason: "Candidate already exists for this message".to_string(),
            }),
            Err(e) => {
                tracing::warn!("Failed to save candidate for {}: {}", signal.message_id, e);
                result(MessageOutcome::Error {
                    message: e.to_string(),
                })
            }
        }
    }

    /// Rejected candidates count too, so dismissed vendors are not
    /// suggested again.
    async fn find_duplicate(
        &self,
        user_id: &str,
        signal: &ParsedSignal,
        vendor: &str,
    ) -> Result<Option<String>, PipelineError> {
        if self.db.find_candidate(user_id, &signal.message_id).await?.is_some() {
            return Ok(Some("Message already ingested".to_string()));
        }
        if let Some(existing) = self
            .db
            .find_candidate_by_vendor(user_id, vendor, signal.amount)
            .await?
        {
            return Ok(Some(format!(
                "Duplicate of {} candidate {}",
                existing.status.as_str().to_lowercase(),
                existing.id
            )));
        }
        if let Some(subscription) = self
            .db
            .find_subscription_by_vendor(user_id, vendor, signal.amount)
            .await?
        {
            return Ok(Some(format!(
                "Already tracked as subscription {}",
                subscription.name
            )));
        }
        Ok(None)
    }

    pub async fn get_candidates(
        &self,
        user_id: &str,
        status: Option<ReviewStatus>,
    ) -> Result<Vec<SubscriptionCandidate>, PipelineError> {
        self.db.get_candidates(user_id, status).await
    }

    /// Approves a pending candidate and records the subscription.
    pub async fn approve(
        &self,
        user_id: &str,
        candidate_id: &str,
    ) -> Result<SubscriptionCandidate, PipelineError> {
        self.db
            .transition_candidate(user_id, candidate_id, ReviewStatus::Approved, None)
            .await
    }

    pub async fn reject(
        &self,
        user_id: &str,
        candidate_id: &str,
    ) -> Result<SubscriptionCandidate, PipelineError> {
        self.db
            .transition_candidate(user_id, candidate_id, ReviewStatus::Rejected, None)
            .await
    }

    /// Links a pending candidate to a subscription the user already has.
    pub async fn merge(
        &self,
        user_id: &str,
        candidate_id: &str,
        subscription_id: &str,
    ) -> Result<SubscriptionCandidate, PipelineError> {
        if self.db.get_subscription(user_id, subscription_id).await?.is_none() {
            return Err(PipelineError::SubscriptionNotFound {
                id: subscription_id.to_string(),
            });
        }
        self.db
            .transition_candidate(
                user_id,
                candidate_id,
                ReviewStatus::Merged,
                Some(subscription_id),
            )
            .await
    }
}

fn build_candidate(user_id: &str, signal: &ParsedSignal, vendor: &VendorMatch) -> SubscriptionCandidate {
    let now = Utc::now();
    SubscriptionCandidate {
        id: uuid::Uuid::new_v4().to_string(),
        user_id: user_id.to_string(),
        message_id: signal.message_id.clone(),
        vendor_name: vendor.name.clone(),
        raw_vendor: signal.raw_vendor.clone(),
        vendor_icon: vendor.icon.clone(),
        confidence: signal.confidence,
        data: ExtractedData {
            amount: signal.amount,
            currency: signal.currency.clone(),
            billing_cycle: signal.billing_cycle,
            renewal_date: signal.renewal_date,
            transaction_types: signal.transaction_types.clone(),
        },
        status: ReviewStatus::Pending,
        signals: explain(signal),
        metadata: CandidateMetadata {
            subject: signal.subject.clone(),
            sender: signal.sender.clone(),
            received_at: signal.received_at,
        },
        created_at: chrono::DateTime::from_timestamp_millis(now.timestamp_millis()).unwrap_or(now),
        reviewed_at: None,
        merged_into: None,
    }
}

/// Human-readable reasons a signal became a candidate.
pub fn explain(signal: &ParsedSignal) -> Vec<String> {
    let mut reasons = Vec::new();

    if let Some(vendor) = &signal.vendor {
        reasons.push(match vendor.method {
            ResolutionMethod::Exact => format!("Vendor \"{}\" matched a known service", vendor.name),
            ResolutionMethod::Fuzzy => format!(
                "Vendor \"{}\" is a close match (similarity {:.2})",
                vendor.name, vendor.confidence
            ),
            ResolutionMethod::Extracted => {
                format!("Vendor \"{}\" taken from the sender", vendor.name)
            }
        });
    }

    if signal.billing_cycle.is_known() {
        reasons.push(format!("Billed {}", signal.billing_cycle.as_str()));
    }

    if let Some(amount) = signal.amount {
        reasons.push(format!(
            "Amount {:.2} {}",
            amount,
            signal.currency.as_deref().unwrap_or("USD")
        ));
    }

    let kinds: Vec<&str> = signal
        .transaction_types
        .iter()
        .filter(|t| **t != TransactionType::Unknown)
        .map(|t| t.as_str())
        .collect();
    if !kinds.is_empty() {
        reasons.push(format!("Mentions {}", kinds.join(", ")));
    }

    if let Some(date) = signal.renewal_date {
        reasons.push(format!("Renews on {}", date));
    }

    reasons
}
