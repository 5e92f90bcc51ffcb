//! Gmail REST transport and provider seam
//!
//! [`MailProvider`] is the contract the history sync, the MIME parser, and the
//! ingestion pipeline depend on. [`GmailClient`] implements it over the Gmail
//! v1 REST API with `reqwest`. Every request carries the configured timeout,
//! and rate-limited requests are retried a bounded number of times before the
//! failure is surfaced as transient.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::{STANDARD, STANDARD_NO_PAD, URL_SAFE, URL_SAFE_NO_PAD};
use chrono::{DateTime, Utc};
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use tokio::sync::Mutex;
use tokio::time::sleep;

use crate::config::GoogleConfig;
use crate::cursor::HistoryCursor;
use crate::errors::{AppError, AppResult, status_error};
use crate::models::{
    AttachmentResponse, GmailMessage, HistoryRecord, HistoryResponse, WatchRequest,
    WatchResponse,
};

/// Rate-limited requests are retried this many times
const MAX_RATE_LIMIT_RETRIES: u32 = 4;
/// Access tokens are refreshed this long before they expire
const TOKEN_EXPIRY_SKEW_SECS: i64 = 60;

/// Mail provider operations consumed by the core
#[async_trait]
pub trait MailProvider: Send + Sync {
    /// Arm or renew the push subscription
    async fn watch(&self, request: &WatchRequest) -> AppResult<WatchResponse>;

    /// Stop push delivery for the mailbox
    async fn stop(&self) -> AppResult<()>;

    /// `messageAdded` history records after `start` up to and including `end`
    ///
    /// # Errors
    ///
    /// Returns `HistoryExpired` if the provider no longer retains history for
    /// `start`.
    async fn list_history(
        &self,
        start: HistoryCursor,
        end: HistoryCursor,
    ) -> AppResult<Vec<HistoryRecord>>;

    /// Full message including the MIME part tree
    async fn get_message(&self, id: &str) -> AppResult<GmailMessage>;

    /// Raw bytes of an out-of-band attachment
    async fn get_attachment(&self, message_id: &str, attachment_id: &str) -> AppResult<Vec<u8>>;
}

#[derive(Debug, Clone)]
struct AccessToken {
    value: SecretString,
    expires_at: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    expires_in: i64,
}

/// OAuth access-token source backed by a stored refresh token
///
/// Tokens are cached until shortly before expiry; concurrent callers share a
/// single refresh.
pub struct GoogleAuth {
    http: Client,
    client_id: String,
    client_secret: SecretString,
    refresh_token: SecretString,
    token_url: String,
    cached: Mutex<Option<AccessToken>>,
}

impl GoogleAuth {
    pub fn new(http: Client, config: &GoogleConfig) -> Self {
        Self {
            http,
            client_id: config.client_id.clone(),
            client_secret: config.client_secret.clone(),
            refresh_token: config.refresh_token.clone(),
            token_url: config.token_url.clone(),
            cached: Mutex::new(None),
        }
    }

    /// Return a valid access token, refreshing it if needed
    ///
    /// # Errors
    ///
    /// - `AuthFailed` if the token endpoint rejects the refresh token
    /// - `Timeout`/`Upstream` for transport failures
    pub async fn access_token(&self) -> AppResult<SecretString> {
        let mut cached = self.cached.lock().await;
        if let Some(token) = cached.as_ref()
            && token.expires_at > Utc::now()
        {
            return Ok(token.value.clone());
        }

        let response = self
            .http
            .post(&self.token_url)
            .form(&[
                ("client_id", self.client_id.as_str()),
                ("client_secret", self.client_secret.expose_secret()),
                ("refresh_token", self.refresh_token.expose_secret()),
                ("grant_type", "refresh_token"),
            ])
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(match status_error("token refresh", status, &body) {
                AppError::InvalidInput(detail) | AppError::NotFound(detail) => {
                    AppError::AuthFailed(detail)
                }
                other => other,
            });
        }

        let payload: TokenResponse = response.json().await?;
        let lifetime = payload.expires_in.saturating_sub(TOKEN_EXPIRY_SKEW_SECS).max(0);
        let token = AccessToken {
            value: SecretString::new(payload.access_token.into()),
            expires_at: Utc::now() + chrono::Duration::seconds(lifetime),
        };
        tracing::debug!(expires_at = %token.expires_at, "refreshed gmail access token");
        let value = token.value.clone();
        *cached = Some(token);
        Ok(value)
    }
}

/// Gmail v1 REST client
pub struct GmailClient {
    http: Client,
    auth: Arc<GoogleAuth>,
    api_base: String,
    user_id: String,
}

impl GmailClient {
    pub fn new(http: Client, auth: Arc<GoogleAuth>, config: &GoogleConfig) -> Self {
        Self {
            http,
            auth,
            api_base: config.api_base.trim_end_matches('/').to_owned(),
            user_id: config.user_id.clone(),
        }
    }

    fn user_url(&self, path: &str) -> String {
        format!(
            "{}/users/{}/{path}",
            self.api_base,
            urlencoding::encode(&self.user_id)
        )
    }

    /// Send an authorized request, retrying on `429 Too Many Requests`
    ///
    /// `build` is invoked once per attempt so the request can be replayed.
    /// Returns the response only when its status is a success.
    async fn execute<F>(&self, operation: &str, build: F) -> AppResult<Response>
    where
        F: Fn(&Client) -> RequestBuilder,
    {
        let mut backoff = Duration::from_secs(1);
        let mut attempt = 0;
        loop {
            let token = self.auth.access_token().await?;
            let response = build(&self.http)
                .bearer_auth(token.expose_secret())
                .header("accept", "application/json")
                .send()
                .await
                .map_err(|e| annotate(operation, e.into()))?;

            let status = response.status();
            if status == StatusCode::TOO_MANY_REQUESTS && attempt < MAX_RATE_LIMIT_RETRIES {
                let wait = response
                    .headers()
                    .get("retry-after")
                    .and_then(|v| v.to_str().ok())
                    .and_then(|v| v.trim().parse::<u64>().ok())
                    .map(Duration::from_secs)
                    .unwrap_or(backoff);
                tracing::warn!(
                    operation = %operation,
                    attempt,
                    wait_ms = wait.as_millis() as u64,
                    "gmail rate limited"
                );
                sleep(wait).await;
                backoff = (backoff * 2).min(Duration::from_secs(32));
                attempt += 1;
                continue;
            }

            if !status.is_success() {
                let body = response.text().await.unwrap_or_default();
                return Err(status_error(operation, status, &body));
            }

            return Ok(response);
        }
    }

    /// [`execute`](Self::execute) and decode the JSON body
    async fn send<T, F>(&self, operation: &str, build: F) -> AppResult<T>
    where
        T: DeserializeOwned,
        F: Fn(&Client) -> RequestBuilder,
    {
        self.execute(operation, build)
            .await?
            .json::<T>()
            .await
            .map_err(|e| annotate(operation, e.into()))
    }
}

#[async_trait]
impl MailProvider for GmailClient {
    async fn watch(&self, request: &WatchRequest) -> AppResult<WatchResponse> {
        let url = self.user_url("watch");
        self.send("watch", |http| http.post(&url).json(request))
            .await
            .map_err(|e| match e {
                AppError::NotFound(msg) => AppError::SubscriptionLost(msg),
                other => other,
            })
    }

    async fn stop(&self) -> AppResult<()> {
        let url = self.user_url("stop");
        // users.stop answers with an empty body
        self.execute("stop", |http| http.post(&url)).await?;
        Ok(())
    }

    async fn list_history(
        &self,
        start: HistoryCursor,
        end: HistoryCursor,
    ) -> AppResult<Vec<HistoryRecord>> {
        let url = self.user_url("history");
        let start_param = start.to_string();
        let mut records = Vec::new();
        let mut page_token: Option<String> = None;

        loop {
            let mut query = vec![
                ("startHistoryId", start_param.clone()),
                ("historyTypes", "messageAdded".to_owned()),
            ];
            if let Some(token) = &page_token {
                query.push(("pageToken", token.clone()));
            }

            let page: HistoryResponse = self
                .send("history.list", |http| http.get(&url).query(&query))
                .await
                .map_err(|e| match e {
                    AppError::NotFound(_) => AppError::HistoryExpired(format!(
                        "history no longer retained for cursor {start}"
                    )),
                    other => other,
                })?;

            let reached_end = page.history.last().is_some_and(|r| r.id > end);
            records.extend(page.history);

            match page.next_page_token {
                Some(token) if !reached_end => page_token = Some(token),
                _ => break,
            }
        }

        Ok(retain_through(records, end))
    }

    async fn get_message(&self, id: &str) -> AppResult<GmailMessage> {
        let url = self.user_url(&format!("messages/{}", urlencoding::encode(id)));
        self.send("messages.get", |http| {
            http.get(&url).query(&[("format", "full")])
        })
        .await
    }

    async fn get_attachment(&self, message_id: &str, attachment_id: &str) -> AppResult<Vec<u8>> {
        let url = self.user_url(&format!(
            "messages/{}/attachments/{}",
            urlencoding::encode(message_id),
            urlencoding::encode(attachment_id)
        ));
        let attachment: AttachmentResponse =
            self.send("attachments.get", |http| http.get(&url)).await?;
        decode_base64(&attachment.data).ok_or_else(|| {
            AppError::Internal(format!(
                "attachment {attachment_id} of message {message_id} is not valid base64"
            ))
        })
    }
}

/// Drop records newer than `end`, keeping provider order
fn retain_through(records: Vec<HistoryRecord>, end: HistoryCursor) -> Vec<HistoryRecord> {
    records.into_iter().filter(|r| r.id <= end).collect()
}

fn annotate(operation: &str, err: AppError) -> AppError {
    match err {
        AppError::Timeout(msg) => AppError::Timeout(format!("{operation}: {msg}")),
        AppError::Upstream(msg) => AppError::Upstream(format!("{operation}: {msg}")),
        AppError::Internal(msg) => AppError::Internal(format!("{operation}: {msg}")),
        other => other,
    }
}

/// Decode Gmail body data
///
/// Gmail uses URL-safe base64 but padding varies, and some proxies re-encode
/// with the standard alphabet, so every variant is tried.
pub fn decode_base64(data: &str) -> Option<Vec<u8>> {
    let trimmed = data.trim();
    [&URL_SAFE_NO_PAD, &URL_SAFE, &STANDARD, &STANDARD_NO_PAD]
        .into_iter()
        .find_map(|engine| engine.decode(trimmed).ok())
}
