//! In-memory fakes for the provider, summarizer, and notifier seams

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use chrono::{DateTime, Utc};

use crate::cursor::HistoryCursor;
use crate::errors::{AppError, AppResult};
use crate::gmail::MailProvider;
use crate::history::{HistorySync, RenewalSettings};
use crate::html::NormalizeOptions;
use crate::ingest::{IngestOptions, IngestionController};
use crate::models::{
    GmailMessage, Header, HistoryRecord, MessageAdded, MessagePart, MessagePartBody, MessageRef,
    WatchRequest, WatchResponse,
};
use crate::notifier::Notifier;
use crate::summarizer::Summarizer;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// History record holding one `messageAdded` event per id
pub fn history_record(id: u64, message_ids: &[&str]) -> HistoryRecord {
    HistoryRecord {
        id: HistoryCursor::new(id),
        messages_added: message_ids
            .iter()
            .map(|message_id| MessageAdded {
                message: MessageRef {
                    id: (*message_id).to_owned(),
                    thread_id: format!("thread-{message_id}"),
                    label_ids: Vec::new(),
                },
            })
            .collect(),
    }
}

/// Single-part message with the given labels, subject, and body
pub fn message(
    id: &str,
    labels: &[&str],
    subject: &str,
    mime_type: &str,
    body: &str,
) -> GmailMessage {
    GmailMessage {
        id: id.to_owned(),
        thread_id: format!("thread-{id}"),
        label_ids: labels.iter().map(|l| (*l).to_owned()).collect(),
        snippet: None,
        history_id: None,
        payload: MessagePart {
            mime_type: mime_type.to_owned(),
            headers: vec![
                Header {
                    name: "From".to_owned(),
                    value: "Billing <billing@example.com>".to_owned(),
                },
                Header {
                    name: "Subject".to_owned(),
                    value: subject.to_owned(),
                },
            ],
            body: MessagePartBody {
                attachment_id: None,
                size: body.len() as u64,
                data: Some(URL_SAFE_NO_PAD.encode(body)),
            },
            ..MessagePart::default()
        },
    }
}

#[derive(Default)]
struct ProviderState {
    watch_seed: Option<u64>,
    watch_failures: VecDeque<AppError>,
    watch_calls: usize,
    stop_calls: usize,
    history: Vec<HistoryRecord>,
    history_failures: VecDeque<AppError>,
    history_calls: Vec<(HistoryCursor, HistoryCursor)>,
    messages: HashMap<String, GmailMessage>,
    message_failures: HashMap<String, AppError>,
    fetched: Vec<String>,
    attachments: HashMap<(String, String), Vec<u8>>,
}

/// Scriptable [`MailProvider`]
///
/// Watches succeed with a seven-day expiry unless a failure is queued;
/// history queries return the stored records in `(start, end]`.
#[derive(Default)]
pub struct FakeProvider {
    state: Mutex<ProviderState>,
}

impl FakeProvider {
    pub fn set_watch_seed(&self, seed: u64) {
        lock(&self.state).watch_seed = Some(seed);
    }

    pub fn fail_watch(&self, error: AppError) {
        lock(&self.state).watch_failures.push_back(error);
    }

    pub fn push_history(&self, record: HistoryRecord) {
        lock(&self.state).history.push(record);
    }

    pub fn fail_history(&self, error: AppError) {
        lock(&self.state).history_failures.push_back(error);
    }

    pub fn put_message(&self, message: GmailMessage) {
        lock(&self.state)
            .messages
            .insert(message.id.clone(), message);
    }

    /// Fail the next fetch of `id`
    pub fn fail_message(&self, id: &str, error: AppError) {
        lock(&self.state)
            .message_failures
            .insert(id.to_owned(), error);
    }

    pub fn put_attachment(&self, message_id: &str, attachment_id: &str, data: Vec<u8>) {
        lock(&self.state)
            .attachments
            .insert((message_id.to_owned(), attachment_id.to_owned()), data);
    }

    pub fn watch_calls(&self) -> usize {
        lock(&self.state).watch_calls
    }

    pub fn stop_calls(&self) -> usize {
        lock(&self.state).stop_calls
    }

    pub fn history_calls(&self) -> Vec<(HistoryCursor, HistoryCursor)> {
        lock(&self.state).history_calls.clone()
    }

    pub fn fetched(&self) -> Vec<String> {
        lock(&self.state).fetched.clone()
    }
}

#[async_trait]
impl MailProvider for FakeProvider {
    async fn watch(&self, _request: &WatchRequest) -> AppResult<WatchResponse> {
        let mut state = lock(&self.state);
        state.watch_calls += 1;
        if let Some(error) = state.watch_failures.pop_front() {
            return Err(error);
        }
        let expires: DateTime<Utc> = Utc::now() + chrono::Duration::days(7);
        Ok(WatchResponse {
            history_id: HistoryCursor::new(state.watch_seed.unwrap_or(1)),
            expiration: expires.timestamp_millis().to_string(),
        })
    }

    async fn stop(&self) -> AppResult<()> {
        lock(&self.state).stop_calls += 1;
        Ok(())
    }

    async fn list_history(
        &self,
        start: HistoryCursor,
        end: HistoryCursor,
    ) -> AppResult<Vec<HistoryRecord>> {
        let mut state = lock(&self.state);
        state.history_calls.push((start, end));
        if let Some(error) = state.history_failures.pop_front() {
            return Err(error);
        }
        Ok(state
            .history
            .iter()
            .filter(|r| r.id > start && r.id <= end)
            .cloned()
            .collect())
    }

    async fn get_message(&self, id: &str) -> AppResult<GmailMessage> {
        let mut state = lock(&self.state);
        state.fetched.push(id.to_owned());
        if let Some(error) = state.message_failures.remove(id) {
            return Err(error);
        }
        state
            .messages
            .get(id)
            .cloned()
            .ok_or_else(|| AppError::NotFound(format!("message {id}")))
    }

    async fn get_attachment(&self, message_id: &str, attachment_id: &str) -> AppResult<Vec<u8>> {
        lock(&self.state)
            .attachments
            .get(&(message_id.to_owned(), attachment_id.to_owned()))
            .cloned()
            .ok_or_else(|| {
                AppError::NotFound(format!("attachment {attachment_id} of message {message_id}"))
            })
    }
}

/// [`Summarizer`] that echoes the subject and records every call
#[derive(Default)]
pub struct RecordingSummarizer {
    calls: Mutex<Vec<(String, String)>>,
    failing_subject: Mutex<Option<String>>,
}

impl RecordingSummarizer {
    /// Fail every call whose subject equals `subject`
    pub fn fail_for(&self, subject: &str) {
        *lock(&self.failing_subject) = Some(subject.to_owned());
    }

    pub fn calls(&self) -> Vec<(String, String)> {
        lock(&self.calls).clone()
    }
}

#[async_trait]
impl Summarizer for RecordingSummarizer {
    async fn summarize(&self, subject: &str, content: &str) -> AppResult<String> {
        lock(&self.calls).push((subject.to_owned(), content.to_owned()));
        if lock(&self.failing_subject).as_deref() == Some(subject) {
            return Err(AppError::upstream(format!("model unavailable for '{subject}'")));
        }
        Ok(format!("Summary of {subject}."))
    }
}

/// [`Notifier`] that records every delivered message
#[derive(Default)]
pub struct RecordingNotifier {
    sent: Mutex<Vec<(String, bool)>>,
    failing: Mutex<bool>,
}

impl RecordingNotifier {
    pub fn set_failing(&self, failing: bool) {
        *lock(&self.failing) = failing;
    }

    pub fn sent(&self) -> Vec<(String, bool)> {
        lock(&self.sent).clone()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn notify(&self, message: &str, mention: bool) -> AppResult<()> {
        if *lock(&self.failing) {
            return Err(AppError::upstream("chat delivery failed"));
        }
        lock(&self.sent).push((message.to_owned(), mention));
        Ok(())
    }
}

/// Controller wired to fakes
pub struct Harness {
    pub provider: Arc<FakeProvider>,
    pub history: Arc<HistorySync>,
    pub summarizer: Arc<RecordingSummarizer>,
    pub notifier: Arc<RecordingNotifier>,
    pub controller: Arc<IngestionController>,
}

impl Harness {
    pub fn new() -> Self {
        let provider = Arc::new(FakeProvider::default());
        let history = Arc::new(HistorySync::new(
            provider.clone(),
            WatchRequest::include("projects/p/topics/gmail", vec!["INBOX".to_owned()]),
            RenewalSettings::default(),
        ));
        let summarizer = Arc::new(RecordingSummarizer::default());
        let notifier = Arc::new(RecordingNotifier::default());
        let controller = Arc::new(IngestionController::new(
            provider.clone(),
            history.clone(),
            summarizer.clone(),
            notifier.clone(),
            IngestOptions {
                fetch_attachments: true,
                normalize: NormalizeOptions::default(),
                deep_link_base: "https://mail.google.com/mail/u/0/#inbox/".to_owned(),
            },
        ));
        Self {
            provider,
            history,
            summarizer,
            notifier,
            controller,
        }
    }

    /// Armed harness whose cursor is already tracking `baseline`
    pub async fn tracking(baseline: u64) -> Self {
        let harness = Self::new();
        harness.history.arm().await.expect("arm");
        harness
            .history
            .reconcile(HistoryCursor::new(baseline))
            .await
            .expect("baseline");
        harness
    }
}
