use std::future::Future;
use std::path::Path;
use std::time::Duration as StdDuration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use hyper::client::HttpConnector;
use hyper_rustls::HttpsConnector;
use serde::Deserialize;
use url::Url;
use yup_oauth2::{ApplicationSecret, read_application_secret};

use crate::error::OAuthError;

/// Read-only mailbox access is all the pipeline needs.
pub const SCOPES: &[&str] = &["https://www.googleapis.com/auth/gmail.readonly"];

/// Lifetime assumed when the provider omits any expiry information.
const FALLBACK_LIFETIME_SECS: i64 = 3600;

const DEFAULT_REQUEST_TIMEOUT: StdDuration = StdDuration::from_secs(20);

/// Result of a code exchange.
#[derive(Debug, Clone, PartialEq)]
pub struct TokenGrant {
    pub access_token: String,
    pub refresh_token: String,
    pub expires_at: DateTime<Utc>,
}

/// Result of a refresh. `expires_at` is absolute; store it as-is.
#[derive(Debug, Clone, PartialEq)]
pub struct RefreshedToken {
    pub access_token: String,
    /// Set when the provider rotated the refresh token.
    pub refresh_token: Option<String>,
    pub expires_at: DateTime<Utc>,
}

#[async_trait]
pub trait OAuthClient: Send + Sync {
    async fn exchange_auth_code(&self, code: &str) -> Result<TokenGrant, OAuthError>;
    async fn refresh_access_token(&self, refresh_token: &str) -> Result<RefreshedToken, OAuthError>;
}

/// Token endpoint payload. Some providers (and SDK wrappers) send an
/// absolute `expiry_date` in epoch millis, others only a relative
/// `expires_in` in seconds.
#[derive(Debug, Deserialize)]
pub struct TokenResponse {
    pub access_token: Option<String>,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub expires_in: Option<i64>,
    #[serde(default)]
    pub expiry_date: Option<i64>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub error_description: Option<String>,
}

impl TokenResponse {
    /// Absolute expiry. An explicit `expiry_date` wins; `expires_in` is
    /// anchored to when the response arrived, never to a stored expiry.
    pub fn expires_at(&self, received_at: DateTime<Utc>) -> DateTime<Utc> {
        if let Some(at) = self.expiry_date.and_then(DateTime::from_timestamp_millis) {
            return at;
        }
        let lifetime = self.expires_in.unwrap_or(FALLBACK_LIFETIME_SECS);
        received_at + Duration::seconds(lifetime)
    }
}

pub fn https_connector() -> anyhow::Result<HttpsConnector<HttpConnector>> {
    Ok(hyper_rustls::HttpsConnectorBuilder::new()
        .with_native_roots()
        .context("Failed to load native roots")?
        .https_only()
        .enable_http1()
        .build())
}

/// Consent URL requesting offline access so a refresh token is issued.
pub fn authorize_url(
    secret: &ApplicationSecret,
    redirect_uri: &str,
    state: &str,
) -> Result<Url, OAuthError> {
    let scope = SCOPES.join(" ");
    Url::parse_with_params(
        &secret.auth_uri,
        &[
            ("client_id", secret.client_id.as_str()),
            ("redirect_uri", redirect_uri),
            ("response_type", "code"),
            ("scope", scope.as_str()),
            ("access_type", "offline"),
            ("prompt", "consent"),
            ("state", state),
        ],
    )
    .map_err(|e| OAuthError::Request(e.to_string()))
}

async fn bounded<T>(
    limit: StdDuration,
    fut: impl Future<Output = Result<T, OAuthError>>,
) -> Result<T, OAuthError> {
    tokio::time::timeout(limit, fut)
        .await
        .map_err(|_| OAuthError::Timeout(limit))?
}

pub struct GoogleOAuth {
    secret: ApplicationSecret,
    redirect_uri: String,
    client: hyper::Client<HttpsConnector<HttpConnector>>,
    timeout: StdDuration,
}

impl GoogleOAuth {
    pub fn new(secret: ApplicationSecret, redirect_uri: impl Into<String>) -> anyhow::Result<Self> {
        let client = hyper::Client::builder().build(https_connector()?);
        Ok(Self {
            secret,
            redirect_uri: redirect_uri.into(),
            client,
            timeout: DEFAULT_REQUEST_TIMEOUT,
        })
    }

    /// Bounds each token-endpoint call, body read included.
    pub fn with_timeout(mut self, timeout: StdDuration) -> Self {
        self.timeout = timeout;
        self
    }

    pub async fn load_secret<P: AsRef<Path>>(path: P) -> anyhow::Result<ApplicationSecret> {
        read_application_secret(path)
            .await
            .context("Failed to read application secret")
    }

    pub fn authorize_url(&self, state: &str) -> Result<Url, OAuthError> {
        authorize_url(&self.secret, &self.redirect_uri, state)
    }

    async fn post_form(&self, params: &[(&str, &str)]) -> Result<TokenResponse, OAuthError> {
        let body = url::form_urlencoded::Serializer::new(String::new())
            .extend_pairs(params)
            .finish();

        let request = hyper::Request::builder()
            .method(hyper::Method::POST)
            .uri(&self.secret.token_uri)
            .header(hyper::header::CONTENT_TYPE, "application/x-www-form-urlencoded")
            .body(hyper::Body::from(body))
            .map_err(|e| OAuthError::Request(e.to_string()))?;

        let (status, bytes) = bounded(self.timeout, async {
            let response = self.client.request(request).await?;
            let status = response.status();
            let bytes = hyper::body::to_bytes(response.into_body()).await?;
            Ok::<_, OAuthError>((status, bytes))
        })
        .await?;

        let parsed: Result<TokenResponse, _> = serde_json::from_slice(&bytes);
        if !status.is_success() {
            if let Ok(body) = &parsed {
                if body.error.as_deref() == Some("invalid_grant") {
                    return Err(OAuthError::InvalidGrant);
                }
            }
            return Err(OAuthError::Endpoint {
                status: status.as_u16(),
                message: match parsed {
                    Ok(body) => body
                        .error_description
                        .or(body.error)
                        .unwrap_or_default(),
                    Err(_) => String::from_utf8_lossy(&bytes).into_owned(),
                },
            });
        }
        Ok(parsed?)
    }
}

#[async_trait]
impl OAuthClient for GoogleOAuth {
    async fn exchange_auth_code(&self, code: &str) -> Result<TokenGrant, OAuthError> {
        let response = self
            .post_form(&[
                ("grant_type", "authorization_code"),
                ("code", code),
                ("client_id", self.secret.client_id.as_str()),
                ("client_secret", self.secret.client_secret.as_str()),
                ("redirect_uri", self.redirect_uri.as_str()),
            ])
            .await?;

        let expires_at = response.expires_at(Utc::now());
        Ok(TokenGrant {
            access_token: response
                .access_token
                .ok_or(OAuthError::MissingField("access_token"))?,
            refresh_token: response
                .refresh_token
                .ok_or(OAuthError::MissingField("refresh_token"))?,
            expires_at,
        })
    }

    async fn refresh_access_token(&self, refresh_token: &str) -> Result<RefreshedToken, OAuthError> {
        let response = self
            .post_form(&[
                ("grant_type", "refresh_token"),
                ("refresh_token", refresh_token),
                ("client_id", self.secret.client_id.as_str()),
                ("client_secret", self.secret.client_secret.as_str()),
            ])
            .await?;

        let expires_at = response.expires_at(Utc::now());
        Ok(RefreshedToken {
            access_token: response
                .access_token
                .ok_or(OAuthError::MissingField("access_token"))?,
            refresh_token: response.refresh_token,
            expires_at,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(millis: i64) -> DateTime<Utc> {
        DateTime::from_timestamp_millis(millis).unwrap()
    }

    #[test]
    fn absolute_expiry_is_used_verbatim() {
        let response: TokenResponse = serde_json::from_str(
            r#"{"access_token":"ya29.a","expires_in":3599,"expiry_date":1760003600000}"#,
        )
        .unwrap();
        assert_eq!(response.expires_at(at(1_760_000_000_000)), at(1_760_003_600_000));
    }

    #[test]
    fn relative_expiry_is_anchored_to_receipt() {
        let response: TokenResponse =
            serde_json::from_str(r#"{"access_token":"ya29.a","expires_in":3599}"#).unwrap();
        assert_eq!(response.expires_at(at(1_760_000_000_000)), at(1_760_003_599_000));
    }

    #[test]
    fn missing_expiry_assumes_one_hour() {
        let response: TokenResponse = serde_json::from_str(r#"{"access_token":"ya29.a"}"#).unwrap();
        assert_eq!(response.expires_at(at(0)), at(3_600_000));
    }

    #[tokio::test]
    async fn stalled_token_endpoint_times_out() {
        let limit = StdDuration::from_millis(20);
        let result = bounded(limit, std::future::pending::<Result<(), OAuthError>>()).await;
        assert!(matches!(result, Err(OAuthError::Timeout(d)) if d == limit));

        let ok = bounded(limit, async { Ok::<_, OAuthError>(7) }).await;
        assert_eq!(ok.unwrap(), 7);
    }

    #[test]
    fn authorize_url_requests_offline_access() {
        let secret = ApplicationSecret {
            client_id: "client-123".to_string(),
            client_secret: "shh".to_string(),
            auth_uri: "https://accounts.google.com/o/oauth2/auth".to_string(),
            token_uri: "https://oauth2.googleapis.com/token".to_string(),
            ..Default::default()
        };
        let url = authorize_url(&secret, "http://localhost:8080/oauth/callback", "user-1").unwrap();
        let pairs: Vec<(String, String)> = url.query_pairs().into_owned().collect();
        assert!(pairs.contains(&("access_type".to_string(), "offline".to_string())));
        assert!(pairs.contains(&("client_id".to_string(), "client-123".to_string())));
        assert!(pairs.contains(&("state".to_string(), "user-1".to_string())));
        assert!(pairs.contains(&("scope".to_string(), SCOPES[0].to_string())));
    }
}
