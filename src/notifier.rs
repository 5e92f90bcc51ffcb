//! Digest formatting and delivery to a Discord direct message
//!
//! The digest is Discord-flavored markdown: sender, subject heading, the
//! model summary, and a deep link back to the message. Delivery opens a DM
//! channel with the configured user once and reuses it afterwards.

use async_trait::async_trait;
use reqwest::Client;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use serde_json::json;
use tokio::sync::Mutex;

use crate::config::DiscordConfig;
use crate::errors::{AppError, AppResult, status_error};
use crate::html::truncate_chars;
use crate::models::ParsedEmail;

/// Discord rejects message content longer than this many characters
pub const MESSAGE_LIMIT: usize = 2000;
/// Room left for the `<@id>` mention line
const MENTION_RESERVE: usize = 32;
const MAX_SUBJECT_CHARS: usize = 256;
/// `SUPPRESS_EMBEDS` message flag
const SUPPRESS_EMBEDS: u64 = 1 << 2;

pub const NO_SUBJECT: &str = "(no subject)";
const UNKNOWN_SENDER: &str = "(unknown sender)";

/// Delivers a formatted digest
#[async_trait]
pub trait Notifier: Send + Sync {
    /// Post `message`, pinging the recipient when `mention` is set
    async fn notify(&self, message: &str, mention: bool) -> AppResult<()>;
}

/// Web link that opens the message in Gmail
pub fn deep_link(base: &str, message_id: &str) -> String {
    format!("{base}{}", urlencoding::encode(message_id))
}

/// Render the digest for one message
///
/// The summary is shortened so the digest, plus a mention line, fits in
/// [`MESSAGE_LIMIT`].
pub fn format_digest(email: &ParsedEmail, summary: &str, link: &str) -> String {
    let from = email.from.as_deref().unwrap_or(UNKNOWN_SENDER);
    let subject = email
        .subject
        .as_deref()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map_or(NO_SUBJECT, |s| truncate_chars(s, MAX_SUBJECT_CHARS));

    let head =
        format!("# 📧 New Email Received.\n**From:** {from}\n## {subject}\n**Summary:**\n");
    let tail = format!("\n\n[See full email]({link})");
    let budget = MESSAGE_LIMIT
        .saturating_sub(MENTION_RESERVE)
        .saturating_sub(head.chars().count() + tail.chars().count());

    let summary = summary.trim();
    let body = if summary.chars().count() <= budget {
        summary.to_owned()
    } else {
        let kept = truncate_chars(summary, budget.saturating_sub(1));
        format!("{}…", kept.trim_end())
    };
    format!("{head}{body}{tail}")
}

#[derive(Debug, Deserialize)]
struct Channel {
    id: String,
}

/// [`Notifier`] posting to a DM channel via the Discord REST API
pub struct DiscordNotifier {
    http: Client,
    bot_token: SecretString,
    user_id: String,
    api_base: String,
    channel_id: Mutex<Option<String>>,
}

impl DiscordNotifier {
    pub fn new(http: Client, config: &DiscordConfig) -> Self {
        Self {
            http,
            bot_token: config.bot_token.clone(),
            user_id: config.user_id.clone(),
            api_base: config.api_base.trim_end_matches('/').to_owned(),
            channel_id: Mutex::new(None),
        }
    }

    fn authorization(&self) -> String {
        format!("Bot {}", self.bot_token.expose_secret())
    }

    /// DM channel with the configured user, opened on first use
    async fn dm_channel(&self) -> AppResult<String> {
        let mut cached = self.channel_id.lock().await;
        if let Some(id) = cached.as_ref() {
            return Ok(id.clone());
        }

        let response = self
            .http
            .post(format!("{}/users/@me/channels", self.api_base))
            .header("authorization", self.authorization())
            .json(&json!({ "recipient_id": self.user_id }))
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(status_error("users.channels.create", status, &body));
        }

        let channel: Channel = response.json().await?;
        tracing::debug!(channel_id = %channel.id, "opened discord dm channel");
        *cached = Some(channel.id.clone());
        Ok(channel.id)
    }

    fn content(&self, message: &str, mention: bool) -> String {
        if mention {
            format!("<@{}>\n{message}", self.user_id)
        } else {
            message.to_owned()
        }
    }
}

#[async_trait]
impl Notifier for DiscordNotifier {
    async fn notify(&self, message: &str, mention: bool) -> AppResult<()> {
        let content = self.content(message, mention);
        if content.chars().count() > MESSAGE_LIMIT {
            return Err(AppError::invalid(format!(
                "digest exceeds {MESSAGE_LIMIT} characters"
            )));
        }

        let channel_id = self.dm_channel().await?;
        let response = self
            .http
            .post(format!(
                "{}/channels/{}/messages",
                self.api_base,
                urlencoding::encode(&channel_id)
            ))
            .header("authorization", self.authorization())
            .json(&json!({ "content": content, "flags": SUPPRESS_EMBEDS }))
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            if status == reqwest::StatusCode::NOT_FOUND {
                // channel gone; reopen on the next attempt
                self.channel_id.lock().await.take();
            }
            return Err(status_error("channels.messages.create", status, &body));
        }
        tracing::info!(mention, chars = content.chars().count(), "delivered digest");
        Ok(())
    }
}
