use crate::error::PipelineError;
use crate::models::{
    BillingCycle, CandidateMetadata, ExtractedData, MailboxCredential, ReviewStatus,
    Subscription, SubscriptionCandidate,
};
use chrono::{DateTime, NaiveDate, Utc};
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::Row;

type Result<T> = std::result::Result<T, PipelineError>;

/// Amounts closer than half a cent compare equal.
const AMOUNT_EPSILON: f64 = 0.005;

const CANDIDATE_COLUMNS: &str = "id, user_id, message_id, vendor_name, raw_vendor, vendor_icon, \
     confidence, amount, currency, billing_cycle, renewal_date, transaction_types, status, \
     signals, subject, sender, received_at, created_at, reviewed_at, merged_into";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted,
    /// The `(user_id, message_id)` pair was already stored.
    AlreadyExists,
}

#[derive(Clone)]
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    pub async fn new(database_url: &str) -> Result<Self> {
        use sqlx::sqlite::SqliteConnectOptions;
        use std::str::FromStr;

        let options = SqliteConnectOptions::from_str(database_url)?.create_if_missing(true);

        let pool = SqlitePool::connect_with(options).await?;
        Ok(Self { pool })
    }

    /// Single-connection in-memory database; every handle shares one schema.
    pub async fn in_memory() -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await?;
        let db = Self { pool };
        db.run_migrations().await?;
        Ok(db)
    }

    pub async fn run_migrations(&self) -> Result<()> {
        let schema = include_str!("../schema.sql");
        sqlx::query(schema).execute(&self.pool).await?;
        Ok(())
    }

    pub async fn find_credential(&self, user_id: &str) -> Result<Option<MailboxCredential>> {
        let row = sqlx::query(
            "SELECT user_id, email, access_token, refresh_token, expires_at, connected_at
             FROM mailbox_credentials
             WHERE user_id = ?",
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|row| MailboxCredential {
            user_id: row.get(0),
            email: row.get(1),
            access_token: row.get(2),
            refresh_token: row.get(3),
            expires_at: from_millis(row.get(4)),
            connected_at: from_millis(row.get(5)),
        }))
    }

    pub async fn upsert_credential(&self, credential: &MailboxCredential) -> Result<()> {
        sqlx::query(
            "INSERT INTO mailbox_credentials (user_id, email, access_token, refresh_token, expires_at, connected_at)
             VALUES (?, ?, ?, ?, ?, ?)
             ON CONFLICT(user_id) DO UPDATE SET email=excluded.email, access_token=excluded.access_token,
             refresh_token=excluded.refresh_token, expires_at=excluded.expires_at,
             connected_at=excluded.connected_at",
        )
        .bind(&credential.user_id)
        .bind(&credential.email)
        .bind(&credential.access_token)
        .bind(&credential.refresh_token)
        .bind(credential.expires_at.timestamp_millis())
        .bind(credential.connected_at.timestamp_millis())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Stores a refreshed access token only if the expiry is still the one
    /// the caller read. Returns `false` when another refresh got there first.
    pub async fn update_access_token(
        &self,
        user_id: &str,
        access_token: &str,
        refresh_token: Option<&str>,
        expires_at: DateTime<Utc>,
        expected_expires_at: DateTime<Utc>,
    ) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE mailbox_credentials
             SET access_token = ?, refresh_token = COALESCE(?, refresh_token), expires_at = ?
             WHERE user_id = ? AND expires_at = ?",
        )
        .bind(access_token)
        .bind(refresh_token)
        .bind(expires_at.timestamp_millis())
        .bind(user_id)
        .bind(expected_expires_at.timestamp_millis())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    pub async fn delete_credential(&self, user_id: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM mailbox_credentials WHERE user_id = ?")
            .bind(user_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn find_candidate(
        &self,
        user_id: &str,
        message_id: &str,
    ) -> Result<Option<SubscriptionCandidate>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM subscription_candidates WHERE user_id = ? AND message_id = ?",
            CANDIDATE_COLUMNS
        ))
        .bind(user_id)
        .bind(message_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|r| candidate_from_row(&r)).transpose()
    }

    pub async fn get_candidate(
        &self,
        user_id: &str,
        id: &str,
    ) -> Result<Option<SubscriptionCandidate>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM subscription_candidates WHERE user_id = ? AND id = ?",
            CANDIDATE_COLUMNS
        ))
        .bind(user_id)
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|r| candidate_from_row(&r)).transpose()
    }

    pub async fn insert_candidate(&self, candidate: &SubscriptionCandidate) -> Result<InsertOutcome> {
        let transaction_types = to_json(&candidate.data.transaction_types)?;
        let signals = to_json(&candidate.signals)?;

        let result = sqlx::query(
            "INSERT INTO subscription_candidates (id, user_id, message_id, vendor_name, raw_vendor, vendor_icon,
             confidence, amount, currency, billing_cycle, renewal_date, transaction_types, status, signals,
             subject, sender, received_at, created_at, reviewed_at, merged_into)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(user_id, message_id) DO NOTHING",
        )
        .bind(&candidate.id)
        .bind(&candidate.user_id)
        .bind(&candidate.message_id)
        .bind(&candidate.vendor_name)
        .bind(&candidate.raw_vendor)
        .bind(&candidate.vendor_icon)
        .bind(candidate.confidence as i64)
        .bind(candidate.data.amount)
        .bind(&candidate.data.currency)
        .bind(candidate.data.billing_cycle.as_str())
        .bind(candidate.data.renewal_date.map(|d| d.to_string()))
        .bind(transaction_types)
        .bind(candidate.status.as_str())
        .bind(signals)
        .bind(&candidate.metadata.subject)
        .bind(&candidate.metadata.sender)
        .bind(candidate.metadata.received_at.timestamp_millis())
        .bind(candidate.created_at.timestamp_millis())
        .bind(candidate.reviewed_at.map(|t| t.timestamp_millis()))
        .bind(&candidate.merged_into)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            Ok(InsertOutcome::AlreadyExists)
        } else {
            Ok(InsertOutcome::Inserted)
        }
    }

    /// Case-insensitive vendor match, narrowed to the amount when one is given.
    pub async fn find_candidate_by_vendor(
        &self,
        user_id: &str,
        vendor_name: &str,
        amount: Option<f64>,
    ) -> Result<Option<SubscriptionCandidate>> {
        let row = match amount {
            Some(amount) => {
                sqlx::query(&format!(
                    "SELECT {} FROM subscription_candidates
                     WHERE user_id = ? AND vendor_name = ? COLLATE NOCASE
                     AND amount IS NOT NULL AND ABS(amount - ?) < ?
                     ORDER BY created_at ASC LIMIT 1",
                    CANDIDATE_COLUMNS
                ))
                .bind(user_id)
                .bind(vendor_name)
                .bind(amount)
                .bind(AMOUNT_EPSILON)
                .fetch_optional(&self.pool)
                .await?
            }
            None => {
                sqlx::query(&format!(
                    "SELECT {} FROM subscription_candidates
                     WHERE user_id = ? AND vendor_name = ? COLLATE NOCASE
                     ORDER BY created_at ASC LIMIT 1",
                    CANDIDATE_COLUMNS
                ))
                .bind(user_id)
                .bind(vendor_name)
                .fetch_optional(&self.pool)
                .await?
            }
        };

        row.map(|r| candidate_from_row(&r)).transpose()
    }

    pub async fn find_subscription_by_vendor(
        &self,
        user_id: &str,
        name: &str,
        amount: Option<f64>,
    ) -> Result<Option<Subscription>> {
        let row = match amount {
            Some(amount) => {
                sqlx::query(
                    "SELECT id, user_id, name, amount, currency, billing_cycle, source_candidate_id, created_at
                     FROM subscriptions
                     WHERE user_id = ? AND name = ? COLLATE NOCASE
                     AND amount IS NOT NULL AND ABS(amount - ?) < ?
                     LIMIT 1",
                )
                .bind(user_id)
                .bind(name)
                .bind(amount)
                .bind(AMOUNT_EPSILON)
                .fetch_optional(&self.pool)
                .await?
            }
            None => {
                sqlx::query(
                    "SELECT id, user_id, name, amount, currency, billing_cycle, source_candidate_id, created_at
                     FROM subscriptions
                     WHERE user_id = ? AND name = ? COLLATE NOCASE
                     LIMIT 1",
                )
                .bind(user_id)
                .bind(name)
                .fetch_optional(&self.pool)
                .await?
            }
        };

        Ok(row.map(|r| subscription_from_row(&r)))
    }

    pub async fn insert_subscription(&self, subscription: &Subscription) -> Result<()> {
        sqlx::query(
            "INSERT INTO subscriptions (id, user_id, name, amount, currency, billing_cycle, source_candidate_id, created_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&subscription.id)
        .bind(&subscription.user_id)
        .bind(&subscription.name)
        .bind(subscription.amount)
        .bind(&subscription.currency)
        .bind(subscription.billing_cycle.as_str())
        .bind(&subscription.source_candidate_id)
        .bind(subscription.created_at.timestamp_millis())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_subscription(&self, user_id: &str, id: &str) -> Result<Option<Subscription>> {
        let row = sqlx::query(
            "SELECT id, user_id, name, amount, currency, billing_cycle, source_candidate_id, created_at
             FROM subscriptions
             WHERE user_id = ? AND id = ?",
        )
        .bind(user_id)
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|r| subscription_from_row(&r)))
    }

    pub async fn get_candidates(
        &self,
        user_id: &str,
        status: Option<ReviewStatus>,
    ) -> Result<Vec<SubscriptionCandidate>> {
        let rows = match status {
            Some(status) => {
                sqlx::query(&format!(
                    "SELECT {} FROM subscription_candidates
                     WHERE user_id = ? AND status = ?
                     ORDER BY received_at DESC",
                    CANDIDATE_COLUMNS
                ))
                .bind(user_id)
                .bind(status.as_str())
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query(&format!(
                    "SELECT {} FROM subscription_candidates
                     WHERE user_id = ?
                     ORDER BY received_at DESC",
                    CANDIDATE_COLUMNS
                ))
                .bind(user_id)
                .fetch_all(&self.pool)
                .await?
            }
        };

        rows.iter().map(candidate_from_row).collect()
    }

    /// Moves a pending candidate into a terminal status. Approval writes the
    /// durable subscription row in the same transaction.
    pub async fn transition_candidate(
        &self,
        user_id: &str,
        id: &str,
        to: ReviewStatus,
        merged_into: Option<&str>,
    ) -> Result<SubscriptionCandidate> {
        let candidate = self
            .get_candidate(user_id, id)
            .await?
            .ok_or_else(|| PipelineError::CandidateNotFound { id: id.to_string() })?;

        if !candidate.status.can_transition_to(to) {
            return Err(PipelineError::InvalidTransition {
                id: id.to_string(),
                from: candidate.status,
                to,
            });
        }

        let now = Utc::now();
        let mut tx = self.pool.begin().await?;

        let result = sqlx::query(
            "UPDATE subscription_candidates
             SET status = ?, reviewed_at = ?, merged_into = ?
             WHERE user_id = ? AND id = ? AND status = 'PENDING'",
        )
        .bind(to.as_str())
        .bind(now.timestamp_millis())
        .bind(merged_into)
        .bind(user_id)
        .bind(id)
        .execute(&mut *tx)
        .await?;

        // Someone else reviewed it between the read and the update.
        if result.rows_affected() == 0 {
            tx.rollback().await?;
            let current = self
                .get_candidate(user_id, id)
                .await?
                .map(|c| c.status)
                .unwrap_or(ReviewStatus::Pending);
            return Err(PipelineError::InvalidTransition {
                id: id.to_string(),
                from: current,
                to,
            });
        }

        if to == ReviewStatus::Approved {
            sqlx::query(
                "INSERT INTO subscriptions (id, user_id, name, amount, currency, billing_cycle, source_candidate_id, created_at)
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(uuid::Uuid::new_v4().to_string())
            .bind(user_id)
            .bind(&candidate.vendor_name)
            .bind(candidate.data.amount)
            .bind(&candidate.data.currency)
            .bind(candidate.data.billing_cycle.as_str())
            .bind(&candidate.id)
            .bind(now.timestamp_millis())
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;

        Ok(SubscriptionCandidate {
            status: to,
            reviewed_at: Some(from_millis(now.timestamp_millis())),
            merged_into: merged_into.map(str::to_string),
            ..candidate
        })
    }
}

fn from_millis(millis: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(millis).unwrap_or_default()
}

fn to_json<T: serde::Serialize>(value: &T) -> Result<String> {
    serde_json::to_string(value)
        .map_err(|e| PipelineError::Persistence(sqlx::Error::Protocol(e.to_string())))
}

fn from_json<T: serde::de::DeserializeOwned>(raw: &str) -> Result<T> {
    serde_json::from_str(raw)
        .map_err(|e| PipelineError::Persistence(sqlx::Error::Decode(Box::new(e))))
}

fn candidate_from_row(row: &SqliteRow) -> Result<SubscriptionCandidate> {
    let status: String = row.get(12);
    let status = ReviewStatus::parse(&status).ok_or_else(|| {
        PipelineError::Persistence(sqlx::Error::Decode(
            format!("unknown review status {}", status).into(),
        ))
    })?;
    let renewal_date: Option<String> = row.get(10);
    let transaction_types: String = row.get(11);
    let signals: String = row.get(13);
    let reviewed_at: Option<i64> = row.get(18);

    Ok(SubscriptionCandidate {
        id: row.get(0),
        user_id: row.get(1),
        message_id: row.get(2),
        vendor_name: row.get(3),
        raw_vendor: row.get(4),
        vendor_icon: row.get(5),
        confidence: row.get::<i64, _>(6).clamp(0, 100) as u8,
        data: ExtractedData {
            amount: row.get(7),
            currency: row.get(8),
            billing_cycle: BillingCycle::parse(row.get::<&str, _>(9)),
            renewal_date: renewal_date.and_then(|d| NaiveDate::parse_from_str(&d, "%Y-%m-%d").ok()),
            transaction_types: from_json(&transaction_types)?,
        },
        status,
        signals: from_json(&signals)?,
        metadata: CandidateMetadata {
            subject: row.get(14),
            sender: row.get(15),
            received_at: from_millis(row.get(16)),
        },
        created_at: from_millis(row.get(17)),
        reviewed_at: reviewed_at.map(from_millis),
        merged_into: row.get(19),
    })
}

fn subscription_from_row(row: &SqliteRow) -> Subscription {
    Subscription {
        id: row.get(0),
        user_id: row.get(1),
        name: row.get(2),
        amount: row.get(3),
        currency: row.get(4),
        billing_cycle: BillingCycle::parse(row.get::<&str, _>(5)),
        source_candidate_id: row.get(6),
        created_at: from_millis(row.get(7)),
    }
}
