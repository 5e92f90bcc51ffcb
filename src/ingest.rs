//! Push notification handling
//!
//! [`IngestionController`] turns one push notification into digests: it asks
//! [`HistorySync`] for the delta, fetches and filters each added message,
//! parses and normalizes it, and hands it to the summarizer and notifier.
//!
//! Notifications are handled one at a time in arrival order. The cursor is
//! advanced only after every message of the delta went through, so a failure
//! partway re-delivers the whole batch on the next notification; messages
//! before the failure may be notified twice.

use std::sync::Arc;

use tokio::sync::Mutex;

use crate::config::DigestConfig;
use crate::cursor::HistoryCursor;
use crate::errors::{AppError, AppResult};
use crate::gmail::MailProvider;
use crate::history::HistorySync;
use crate::html::{NormalizeOptions, normalize_content};
use crate::mime::parse_email;
use crate::models::{ParsedEmail, PushNotification};
use crate::notifier::{NO_SUBJECT, Notifier, deep_link, format_digest};
use crate::summarizer::Summarizer;

const INBOX: &str = "INBOX";
const DRAFT: &str = "DRAFT";
const SENT: &str = "SENT";
const IMPORTANT: &str = "IMPORTANT";

/// Per-message processing knobs
#[derive(Debug, Clone)]
pub struct IngestOptions {
    pub fetch_attachments: bool,
    pub normalize: NormalizeOptions,
    /// Prefix the message id is appended to for the "see full email" link
    pub deep_link_base: String,
}

impl IngestOptions {
    pub fn from_config(config: &DigestConfig) -> Self {
        Self {
            fetch_attachments: config.fetch_attachments,
            normalize: NormalizeOptions {
                max_input_chars: config.html_max_input_chars,
                max_url_len: config.url_max_len,
            },
            deep_link_base: config.deep_link_base.clone(),
        }
    }
}

/// Outcome of one handled notification
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchReport {
    /// Messages summarized and delivered
    pub delivered: usize,
    /// Messages filtered out or gone before they could be fetched
    pub skipped: usize,
    /// History expired; changes in the lost window were not processed
    pub data_loss: bool,
}

enum Outcome {
    Delivered,
    Skipped,
}

/// Whether a message is genuine inbound mail
///
/// Drafts and sent mail are excluded even when they also carry `INBOX`.
pub fn is_inbound(labels: &[String]) -> bool {
    let has = |label: &str| labels.iter().any(|l| l == label);
    has(INBOX) && !has(DRAFT) && !has(SENT)
}

/// Text handed to the summarizer for one message
///
/// The normalized body, or the provider snippet when the body is empty,
/// followed by a listing of fetched attachments.
fn summary_content(parsed: &ParsedEmail, options: NormalizeOptions) -> String {
    let mut content = normalize_content(&parsed.content, &parsed.content_type, options);
    if content.trim().is_empty()
        && let Some(snippet) = parsed.snippet.as_deref()
    {
        content = snippet.to_owned();
    }
    if !parsed.attachments.is_empty() {
        content.push_str("\n\nAttachments:");
        for attachment in &parsed.attachments {
            content.push_str(&format!(
                "\n- {} ({}, {} bytes)",
                attachment.filename,
                attachment.mime_type,
                attachment.size.max(attachment.data.len() as u64)
            ));
        }
    }
    content
}

pub struct IngestionController {
    provider: Arc<dyn MailProvider>,
    history: Arc<HistorySync>,
    summarizer: Arc<dyn Summarizer>,
    notifier: Arc<dyn Notifier>,
    options: IngestOptions,
    /// Serializes notifications; tokio's mutex queues waiters in FIFO order
    gate: Mutex<()>,
}

impl IngestionController {
    pub fn new(
        provider: Arc<dyn MailProvider>,
        history: Arc<HistorySync>,
        summarizer: Arc<dyn Summarizer>,
        notifier: Arc<dyn Notifier>,
        options: IngestOptions,
    ) -> Self {
        Self {
            provider,
            history,
            summarizer,
            notifier,
            options,
            gate: Mutex::new(()),
        }
    }

    /// React to one push notification
    ///
    /// A notification without a cursor is a no-op.
    ///
    /// # Errors
    ///
    /// Any failure while fetching, summarizing, or delivering a message
    /// aborts the batch without advancing the cursor. Expired history is not
    /// an error: the watch is re-armed and the report flags the data loss.
    pub async fn handle(&self, notification: &PushNotification) -> AppResult<BatchReport> {
        let Some(cursor) = notification.history_id else {
            tracing::debug!("notification without history id ignored");
            return Ok(BatchReport::default());
        };

        let _turn = self.gate.lock().await;

        let delta = match self.history.reconcile(cursor).await {
            Ok(delta) => delta,
            Err(AppError::HistoryExpired(detail)) => {
                return self.recover_from_expired_history(cursor, &detail).await;
            }
            Err(e) => return Err(e),
        };

        let mut report = BatchReport::default();
        for message_id in &delta.message_ids {
            match self.process_message(message_id).await {
                Ok(Outcome::Delivered) => report.delivered += 1,
                Ok(Outcome::Skipped) => report.skipped += 1,
                Err(e) => {
                    tracing::warn!(
                        message_id = %message_id,
                        delivered = report.delivered,
                        remaining = delta.message_ids.len() - report.delivered - report.skipped,
                        code = e.code(),
                        error = %e,
                        "batch aborted; cursor kept so the batch is retried"
                    );
                    return Err(e);
                }
            }
        }

        self.history.advance(&delta).await;
        if !delta.is_empty() {
            tracing::info!(
                from = ?delta.from.map(|c| c.value()),
                cursor = %cursor,
                delivered = report.delivered,
                skipped = report.skipped,
                "processed history delta"
            );
        }
        Ok(report)
    }

    async fn recover_from_expired_history(
        &self,
        notified: HistoryCursor,
        detail: &str,
    ) -> AppResult<BatchReport> {
        let tracked = self.history.cursor().await.tracked();
        tracing::error!(
            from = ?tracked.map(|c| c.value()),
            to = %notified,
            detail,
            "history expired; messages added in this range are lost, re-arming watch"
        );
        self.history.arm().await?;
        Ok(BatchReport {
            data_loss: true,
            ..BatchReport::default()
        })
    }

    async fn process_message(&self, message_id: &str) -> AppResult<Outcome> {
        let message = match self.provider.get_message(message_id).await {
            Ok(message) => message,
            Err(AppError::NotFound(_)) => {
                tracing::info!(message_id, "message gone before fetch; skipping");
                return Ok(Outcome::Skipped);
            }
            Err(e) => return Err(e),
        };

        if !is_inbound(&message.label_ids) {
            tracing::debug!(message_id, labels = ?message.label_ids, "not inbound mail; skipping");
            return Ok(Outcome::Skipped);
        }

        let attachments = self
            .options
            .fetch_attachments
            .then_some(&*self.provider as &dyn MailProvider);
        let parsed = parse_email(&message, attachments).await?;
        tracing::debug!(
            message_id,
            thread_id = %parsed.thread_id,
            from = ?parsed.from,
            to = ?parsed.to,
            cc = ?parsed.cc,
            bcc = ?parsed.bcc,
            date = ?parsed.date,
            content_type = %parsed.content_type,
            "parsed message"
        );
        let content = summary_content(&parsed, self.options.normalize);
        let subject = parsed.subject.as_deref().unwrap_or(NO_SUBJECT);

        let summary = self.summarizer.summarize(subject, &content).await?;
        let link = deep_link(&self.options.deep_link_base, &parsed.id);
        let digest = format_digest(&parsed, &summary, &link);
        self.notifier
            .notify(&digest, parsed.has_label(IMPORTANT))
            .await?;

        tracing::info!(
            message_id,
            attachments = parsed.attachments.len(),
            "delivered digest"
        );
        Ok(Outcome::Delivered)
    }
}
