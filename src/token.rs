//! Access-token lifecycle: decrypt, refresh near expiry, and serialize
//! refreshes per user.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use tokio::sync::Mutex;

use crate::crypto::TokenCipher;
use crate::db::Database;
use crate::error::PipelineError;
use crate::mailbox::MailboxApi;
use crate::models::MailboxCredential;
use crate::oauth::OAuthClient;

pub struct TokenManager {
    db: Database,
    cipher: TokenCipher,
    oauth: Arc<dyn OAuthClient>,
    refresh_buffer: Duration,
    locks: DashMap<String, Arc<Mutex<()>>>,
}

impl TokenManager {
    pub fn new(
        db: Database,
        cipher: TokenCipher,
        oauth: Arc<dyn OAuthClient>,
        refresh_buffer_secs: i64,
    ) -> Self {
        Self {
            db,
            cipher,
            oauth,
            refresh_buffer: Duration::seconds(refresh_buffer_secs.max(0)),
            locks: DashMap::new(),
        }
    }

    /// Returns a usable access token, refreshing when the stored one is
    /// within the buffer of expiry or when `force_refresh` is set.
    pub async fn get_valid_token(
        &self,
        user_id: &str,
        force_refresh: bool,
    ) -> Result<String, PipelineError> {
        let credential = self.load(user_id).await?;
        if !force_refresh && !self.needs_refresh(credential.expires_at, Utc::now()) {
            return self.cipher.decrypt(&credential.access_token);
        }

        let lock = self
            .locks
            .entry(user_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let result = self.refresh_serialized(&lock, &credential).await;

        // Held only by the map and this call: nobody else is waiting.
        self.locks
            .remove_if(user_id, |_, held| Arc::strong_count(held) == 2);
        result
    }

    async fn refresh_serialized(
        &self,
        lock: &Mutex<()>,
        seen: &MailboxCredential,
    ) -> Result<String, PipelineError> {
        let _guard = lock.lock().await;

        // Another task may have refreshed while we waited.
        let current = self.load(&seen.user_id).await?;
        if current.expires_at != seen.expires_at
            && !self.needs_refresh(current.expires_at, Utc::now())
        {
            tracing::debug!("Token for {} refreshed concurrently", seen.user_id);
            return self.cipher.decrypt(&current.access_token);
        }

        self.refresh(&current).await
    }

    async fn refresh(&self, credential: &MailboxCredential) -> Result<String, PipelineError> {
        let refresh_token = self.cipher.decrypt(&credential.refresh_token)?;
        let refreshed = self.oauth.refresh_access_token(&refresh_token).await?;

        let access = self.cipher.encrypt(&refreshed.access_token)?;
        let rotated = refreshed
            .refresh_token
            .as_deref()
            .map(|t| self.cipher.encrypt(t))
            .transpose()?;

        let stored = self
            .db
            .update_access_token(
                &credential.user_id,
                &access,
                rotated.as_deref(),
                refreshed.expires_at,
                credential.expires_at,
            )
            .await?;

        if !stored {
            // A refresh from another process won; its token is just as valid.
            let winner = self.load(&credential.user_id).await?;
            tracing::debug!("Lost refresh race for {}", credential.user_id);
            return self.cipher.decrypt(&winner.access_token);
        }

        tracing::info!(
            "Refreshed access token for {} (expires {})",
            credential.user_id,
            refreshed.expires_at
        );
        Ok(refreshed.access_token)
    }

    /// Exchanges an authorization code and stores the encrypted credential,
    /// replacing any previous one for the user.
    pub async fn connect(
        &self,
        user_id: &str,
        auth_code: &str,
        mailbox: &dyn MailboxApi,
    ) -> Result<MailboxCredential, PipelineError> {
        let grant = self.oauth.exchange_auth_code(auth_code).await?;
        let email = mailbox.profile_email(&grant.access_token).await?;

        let credential = MailboxCredential {
            user_id: user_id.to_string(),
            email,
            access_token: self.cipher.encrypt(&grant.access_token)?,
            refresh_token: self.cipher.encrypt(&grant.refresh_token)?,
            expires_at: truncate_millis(grant.expires_at),
            connected_at: truncate_millis(Utc::now()),
        };
        self.db.upsert_credential(&credential).await?;
        tracing::info!("Connected mailbox {} for {}", credential.email, user_id);
        Ok(credential)
    }

    pub async fn disconnect(&self, user_id: &str) -> Result<bool, PipelineError> {
        let removed = self.db.delete_credential(user_id).await?;
        self.locks.remove(user_id);
        if removed {
            tracing::info!("Disconnected mailbox for {}", user_id);
        }
        Ok(removed)
    }

    async fn load(&self, user_id: &str) -> Result<MailboxCredential, PipelineError> {
        self.db
            .find_credential(user_id)
            .await?
            .ok_or_else(|| PipelineError::NotConnected(user_id.to_string()))
    }

    fn needs_refresh(&self, expires_at: DateTime<Utc>, now: DateTime<Utc>) -> bool {
        now > expires_at - self.refresh_buffer
    }
}

/// Stored timestamps carry millisecond precision.
fn truncate_millis(at: DateTime<Utc>) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(at.timestamp_millis()).unwrap_or(at)
}
