use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

/// Stored mailbox credential. Token fields hold ciphertext envelopes, never
/// plaintext.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MailboxCredential {
    pub user_id: String,
    pub email: String,
    pub access_token: String,
    pub refresh_token: String,
    pub expires_at: DateTime<Utc>,
    pub connected_at: DateTime<Utc>,
}

/// One message as returned by the mailbox provider. Lives only for the
/// duration of a batch.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RawMessage {
    pub id: String,
    pub thread_id: String,
    pub from_address: Option<String>,
    pub subject: Option<String>,
    pub snippet: Option<String>,
    pub internal_date: i64,
}

impl RawMessage {
    pub fn received_at(&self) -> DateTime<Utc> {
        DateTime::from_timestamp_millis(self.internal_date).unwrap_or_default()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BillingCycle {
    Monthly,
    Yearly,
    Weekly,
    Unknown,
}

impl BillingCycle {
    pub fn as_str(&self) -> &'static str {
        match self {
            BillingCycle::Monthly => "monthly",
            BillingCycle::Yearly => "yearly",
            BillingCycle::Weekly => "weekly",
            BillingCycle::Unknown => "unknown",
        }
    }

    pub fn parse(value: &str) -> Self {
        match value {
            "monthly" => BillingCycle::Monthly,
            "yearly" => BillingCycle::Yearly,
            "weekly" => BillingCycle::Weekly,
            _ => BillingCycle::Unknown,
        }
    }

    pub fn is_known(&self) -> bool {
        !matches!(self, BillingCycle::Unknown)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransactionType {
    Renewal,
    Payment,
    Invoice,
    Subscription,
    Trial,
    Cancelled,
    Unknown,
}

impl TransactionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionType::Renewal => "renewal",
            TransactionType::Payment => "payment",
            TransactionType::Invoice => "invoice",
            TransactionType::Subscription => "subscription",
            TransactionType::Trial => "trial",
            TransactionType::Cancelled => "cancelled",
            TransactionType::Unknown => "unknown",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ResolutionMethod {
    Exact,
    Fuzzy,
    Extracted,
}

/// Canonical vendor identity produced by the resolver.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VendorMatch {
    pub name: String,
    pub icon: String,
    pub method: ResolutionMethod,
    pub confidence: f64,
}

/// Structured facts pulled out of a single message. Never persisted directly.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParsedSignal {
    pub message_id: String,
    pub parsed: bool,
    pub error: Option<String>,
    pub vendor: Option<VendorMatch>,
    /// Sender text the vendor was derived from, kept for review.
    pub raw_vendor: String,
    pub billing_cycle: BillingCycle,
    pub transaction_types: Vec<TransactionType>,
    pub amount: Option<f64>,
    pub currency: Option<String>,
    pub renewal_date: Option<NaiveDate>,
    pub confidence: u8,
    pub subject: String,
    pub sender: String,
    pub received_at: DateTime<Utc>,
}

impl ParsedSignal {
    pub fn vendor_name(&self) -> Option<&str> {
        self.vendor.as_ref().map(|v| v.name.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ReviewStatus {
    Pending,
    Approved,
    Rejected,
    Merged,
}

impl ReviewStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReviewStatus::Pending => "PENDING",
            ReviewStatus::Approved => "APPROVED",
            ReviewStatus::Rejected => "REJECTED",
            ReviewStatus::Merged => "MERGED",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.to_ascii_uppercase().as_str() {
            "PENDING" => Some(ReviewStatus::Pending),
            "APPROVED" => Some(ReviewStatus::Approved),
            "REJECTED" => Some(ReviewStatus::Rejected),
            "MERGED" => Some(ReviewStatus::Merged),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, ReviewStatus::Pending)
    }

    /// Only pending candidates move, and only into a terminal state.
    pub fn can_transition_to(&self, next: ReviewStatus) -> bool {
        matches!(self, ReviewStatus::Pending) && next.is_terminal()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractedData {
    pub amount: Option<f64>,
    pub currency: Option<String>,
    pub billing_cycle: BillingCycle,
    pub renewal_date: Option<NaiveDate>,
    pub transaction_types: Vec<TransactionType>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CandidateMetadata {
    pub subject: String,
    pub sender: String,
    pub received_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubscriptionCandidate {
    pub id: String,
    pub user_id: String,
    pub message_id: String,
    pub vendor_name: String,
    pub raw_vendor: String,
    pub vendor_icon: String,
    pub confidence: u8,
    pub data: ExtractedData,
    pub status: ReviewStatus,
    pub signals: Vec<String>,
    pub metadata: CandidateMetadata,
    pub created_at: DateTime<Utc>,
    pub reviewed_at: Option<DateTime<Utc>>,
    pub merged_into: Option<String>,
}

/// Durable subscription row written when a candidate is approved.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Subscription {
    pub id: String,
    pub user_id: String,
    pub name: String,
    pub amount: Option<f64>,
    pub currency: Option<String>,
    pub billing_cycle: BillingCycle,
    pub source_candidate_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum MessageOutcome {
    Saved { candidate_id: String },
    Skipped { reason: String },
    LowConfidence { confidence: u8 },
    Error { message: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageResult {
    pub message_id: String,
    pub vendor: Option<String>,
    #[serde(flatten)]
    pub outcome: MessageOutcome,
}

/// Why a batch stopped before exhausting its search results.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    RateLimited,
    Cancelled,
    TimedOut,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BatchSummary {
    pub saved: usize,
    pub skipped: usize,
    pub errors: usize,
    pub low_confidence: usize,
    pub total: usize,
    pub results: Vec<MessageResult>,
    /// Page to resume from when the batch stopped early.
    pub resume_page_token: Option<String>,
    pub stopped: Option<StopReason>,
}

impl BatchSummary {
    pub fn record(&mut self, result: MessageResult) {
        self.total += 1;
        match result.outcome {
            MessageOutcome::Saved { .. } => self.saved += 1,
            MessageOutcome::Skipped { .. } => self.skipped += 1,
            MessageOutcome::LowConfidence { .. } => self.low_confidence += 1,
            MessageOutcome::Error { .. } => self.errors += 1,
        }
        self.results.push(result);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_pending_transitions_into_terminal_states() {
        assert!(ReviewStatus::Pending.can_transition_to(ReviewStatus::Approved));
        assert!(ReviewStatus::Pending.can_transition_to(ReviewStatus::Rejected));
        assert!(ReviewStatus::Pending.can_transition_to(ReviewStatus::Merged));
        assert!(!ReviewStatus::Pending.can_transition_to(ReviewStatus::Pending));
        assert!(!ReviewStatus::Approved.can_transition_to(ReviewStatus::Rejected));
        assert!(!ReviewStatus::Merged.can_transition_to(ReviewStatus::Approved));
    }

    #[test]
    fn summary_tallies_every_bucket() {
        let mut summary = BatchSummary::default();
        for outcome in [
            MessageOutcome::Saved { candidate_id: "c1".into() },
            MessageOutcome::Skipped { reason: "dup".into() },
            MessageOutcome::LowConfidence { confidence: 40 },
            MessageOutcome::Error { message: "disk".into() },
        ] {
            summary.record(MessageResult {
                message_id: "m".into(),
                vendor: None,
                outcome,
            });
        }
        assert_eq!(
            (summary.saved, summary.skipped, summary.low_confidence, summary.errors),
            (1, 1, 1, 1)
        );
        assert_eq!(summary.total, 4);
    }
}
