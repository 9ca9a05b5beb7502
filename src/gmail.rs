use async_trait::async_trait;
use google_gmail1::Gmail;
use hyper::client::HttpConnector;
use hyper_rustls::HttpsConnector;

use crate::error::MailboxError;
use crate::mailbox::{MailboxApi, SearchPage};
use crate::models::RawMessage;
use crate::oauth::https_connector;

/// Gmail REST client. The hub is rebuilt per call around the caller's
/// bearer token; the underlying connection pool is shared.
#[derive(Clone)]
pub struct GmailClient {
    client: hyper::Client<HttpsConnector<HttpConnector>>,
}

impl GmailClient {
    pub fn new() -> anyhow::Result<Self> {
        Ok(Self {
            client: hyper::Client::builder().build(https_connector()?),
        })
    }

    fn hub(&self, access_token: &str) -> Gmail<HttpsConnector<HttpConnector>> {
        Gmail::new(self.client.clone(), access_token.to_string())
    }
}

#[async_trait]
impl MailboxApi for GmailClient {
    async fn search(
        &self,
        access_token: &str,
        query: &str,
        max_results: u32,
        page_token: Option<&str>,
    ) -> Result<SearchPage, MailboxError> {
        let hub = self.hub(access_token);
        let mut req = hub.users().messages_list("me").q(query).max_results(max_results);

        if let Some(token) = page_token {
            req = req.page_token(token);
        }

        let (_, message_list) = req.doit().await?;

        let message_ids = message_list
            .messages
            .unwrap_or_default()
            .into_iter()
            .filter_map(|m| m.id)
            .collect();

        Ok(SearchPage {
            message_ids,
            next_page_token: message_list.next_page_token,
            total_estimate: message_list.result_size_estimate.unwrap_or(0),
        })
    }

    async fn fetch_metadata(
        &self,
        access_token: &str,
        message_id: &str,
    ) -> Result<RawMessage, MailboxError> {
        let hub = self.hub(access_token);
        let (_, msg) = hub
            .users()
            .messages_get("me", message_id)
            .format("metadata")
            .add_metadata_headers("From")
            .add_metadata_headers("Subject")
            .doit()
            .await?;

        let mut from = None;
        let mut subject = None;

        if let Some(headers) = msg.payload.as_ref().and_then(|p| p.headers.as_ref()) {
            for header in headers {
                match header.name.as_deref() {
                    Some(name) if name.eq_ignore_ascii_case("From") => from = header.value.clone(),
                    Some(name) if name.eq_ignore_ascii_case("Subject") => {
                        subject = header.value.clone()
                    }
                    _ => {}
                }
            }
        }

        Ok(RawMessage {
            id: msg.id.unwrap_or_else(|| message_id.to_string()),
            thread_id: msg.thread_id.unwrap_or_default(),
            from_address: from,
            subject,
            snippet: msg.snippet,
            internal_date: msg.internal_date.unwrap_or(0),
        })
    }

    async fn profile_email(&self, access_token: &str) -> Result<String, MailboxError> {
        let hub = self.hub(access_token);
        let (_, profile) = hub.users().get_profile("me").doit().await?;
        profile
            .email_address
            .ok_or_else(|| MailboxError::Provider("Profile has no email address".to_string()))
    }
}

impl From<google_gmail1::Error> for MailboxError {
    fn from(err: google_gmail1::Error) -> Self {
        use google_gmail1::Error;

        match err {
            Error::BadRequest(body) => {
                let error = &body["error"];
                let status = error["code"].as_u64().unwrap_or(400) as u16;
                let reason = error["errors"][0]["reason"].as_str().unwrap_or_default();
                let message = error["message"].as_str().unwrap_or_default();
                classify(status, reason, message, None)
            }
            Error::Failure(response) => {
                let retry_after = response
                    .headers()
                    .get(hyper::header::RETRY_AFTER)
                    .and_then(|v| v.to_str().ok())
                    .and_then(|v| v.trim().parse::<u64>().ok())
                    .map(std::time::Duration::from_secs);
                let status = response.status();
                classify(
                    status.as_u16(),
                    "",
                    status.canonical_reason().unwrap_or_default(),
                    retry_after,
                )
            }
            Error::MissingToken(_) => MailboxError::AuthExpired,
            other => MailboxError::Provider(other.to_string()),
        }
    }
}

fn classify(
    status: u16,
    reason: &str,
    message: &str,
    retry_after: Option<std::time::Duration>,
) -> MailboxError {
    match status {
        401 => MailboxError::AuthExpired,
        429 => MailboxError::RateLimited { retry_after },
        403 if reason.ends_with("RateLimitExceeded") || reason == "rateLimitExceeded" => {
            MailboxError::RateLimited { retry_after }
        }
        404 => MailboxError::NotFound(message.to_string()),
        _ => MailboxError::Provider(format!("{} {}", status, message)),
    }
}
