//! Watch subscription lifecycle and history-cursor reconciliation
//!
//! [`HistorySync`] owns the mailbox watch and the [`CursorState`]. Push
//! notifications only carry the mailbox's latest history id, so each one is
//! turned into a [`Delta`]: the ids of messages added between the tracked
//! cursor and the notified one. The cursor moves only when the caller reports
//! the delta as processed via [`HistorySync::advance`], which makes a failed
//! batch reappear whole on the next notification.
//!
//! Renewal runs as a cancellable background task that re-issues the watch
//! shortly before it expires and backs off while the provider is failing.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

use crate::config::WatchConfig;
use crate::cursor::{CursorState, HistoryCursor};
use crate::errors::AppResult;
use crate::gmail::MailProvider;
use crate::models::{HistoryRecord, WatchRequest, WatchResponse};

/// Extra lead subtracted on top of the configured margin
const RENEWAL_SLACK_MS: i64 = 1_000;

/// Timing of the background renewal task
#[derive(Debug, Clone, Copy)]
pub struct RenewalSettings {
    /// Renew this long before the watch expires
    pub margin: Duration,
    pub backoff_initial: Duration,
    pub backoff_max: Duration,
}

impl RenewalSettings {
    pub fn from_config(config: &WatchConfig) -> Self {
        Self {
            margin: config.renewal_margin(),
            backoff_initial: Duration::from_secs(config.renewal_backoff_initial_secs.max(1)),
            backoff_max: Duration::from_secs(config.renewal_backoff_max_secs.max(1)),
        }
    }
}

impl Default for RenewalSettings {
    fn default() -> Self {
        Self {
            margin: Duration::from_secs(60),
            backoff_initial: Duration::from_secs(5),
            backoff_max: Duration::from_secs(300),
        }
    }
}

/// Active push registration for the mailbox
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchSubscription {
    pub topic: String,
    pub label_ids: Vec<String>,
    pub expires_at: DateTime<Utc>,
    /// History id the provider reported when the watch was last issued
    pub cursor: HistoryCursor,
}

/// Messages added between two cursors
///
/// An empty delta without a target (baseline adoption or a stale
/// notification) has nothing to acknowledge.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Delta {
    /// Added message ids in history order, without duplicates
    pub message_ids: Vec<String>,
    /// Cursor the delta was computed from
    pub from: Option<HistoryCursor>,
    /// Cursor to store once the delta has been processed
    pub target: Option<HistoryCursor>,
}

impl Delta {
    pub fn is_empty(&self) -> bool {
        self.message_ids.is_empty()
    }
}

#[derive(Debug, Default)]
struct SyncState {
    subscription: Option<WatchSubscription>,
    cursor: CursorState,
}

/// Subscription owner and history reconciler for a single mailbox
pub struct HistorySync {
    provider: Arc<dyn MailProvider>,
    request: WatchRequest,
    settings: RenewalSettings,
    state: Mutex<SyncState>,
    /// Signalled when the subscription is replaced outside the renewal task
    rescheduled: Notify,
}

impl HistorySync {
    pub fn new(
        provider: Arc<dyn MailProvider>,
        request: WatchRequest,
        settings: RenewalSettings,
    ) -> Self {
        Self {
            provider,
            request,
            settings,
            state: Mutex::new(SyncState::default()),
            rescheduled: Notify::new(),
        }
    }

    /// Issue a fresh watch and reset the cursor to its seed
    ///
    /// The next [`reconcile`](Self::reconcile) adopts whatever cursor it is
    /// given as the baseline.
    ///
    /// # Errors
    ///
    /// Propagates provider failures; the previous state is kept in that case.
    pub async fn arm(&self) -> AppResult<WatchSubscription> {
        let response = self.provider.watch(&self.request).await?;
        let subscription = self.subscription_from(&response)?;
        {
            let mut state = self.state.lock().await;
            state.cursor = CursorState::Seeded(response.history_id);
            state.subscription = Some(subscription.clone());
        }
        self.rescheduled.notify_one();
        tracing::info!(
            topic = %subscription.topic,
            labels = ?subscription.label_ids,
            cursor = %subscription.cursor,
            expires_at = %subscription.expires_at,
            "armed mailbox watch"
        );
        Ok(subscription)
    }

    /// Re-issue the watch to extend its expiration
    ///
    /// Leaves the cursor alone unless the previous watch had already expired,
    /// in which case notifications may have been missed and the cursor is
    /// reset exactly as [`arm`](Self::arm) would.
    ///
    /// # Errors
    ///
    /// Propagates provider failures; the caller is expected to retry.
    pub async fn renew(&self) -> AppResult<WatchSubscription> {
        self.renew_at(Utc::now()).await
    }

    async fn renew_at(&self, now: DateTime<Utc>) -> AppResult<WatchSubscription> {
        let response = self.provider.watch(&self.request).await?;
        let subscription = self.subscription_from(&response)?;

        let mut state = self.state.lock().await;
        let lapsed = state
            .subscription
            .as_ref()
            .is_none_or(|previous| previous.expires_at <= now);
        if lapsed {
            tracing::error!(
                previous_expiry = ?state.subscription.as_ref().map(|s| s.expires_at),
                tracked = ?state.cursor.tracked().map(|c| c.value()),
                seed = %response.history_id,
                "watch lapsed before renewal; changes since expiry are lost, re-seeding cursor"
            );
            state.cursor = CursorState::Seeded(response.history_id);
        }
        state.subscription = Some(subscription.clone());
        Ok(subscription)
    }

    fn subscription_from(&self, response: &WatchResponse) -> AppResult<WatchSubscription> {
        Ok(WatchSubscription {
            topic: self.request.topic_name.clone(),
            label_ids: self.request.label_ids.clone(),
            expires_at: response.expires_at()?,
            cursor: response.history_id,
        })
    }

    /// Compute the messages added since the tracked cursor
    ///
    /// Only the baseline case mutates state: with no tracked cursor the new
    /// one is adopted and an empty delta returned. A notification at or
    /// behind the tracked cursor (duplicate or reordered delivery) yields an
    /// empty delta. Otherwise the provider is queried, and repeating the call
    /// before [`advance`](Self::advance) yields the same ids.
    ///
    /// # Errors
    ///
    /// - `HistoryExpired` when the tracked cursor is older than the provider's
    ///   retention; the caller must re-[`arm`](Self::arm)
    /// - transient provider failures
    pub async fn reconcile(&self, new: HistoryCursor) -> AppResult<Delta> {
        let from = {
            let mut state = self.state.lock().await;
            match state.cursor {
                CursorState::Unarmed | CursorState::Seeded(_) => {
                    tracing::info!(cursor = %new, "adopted baseline cursor");
                    state.cursor = CursorState::Tracking(new);
                    return Ok(Delta::default());
                }
                CursorState::Tracking(tracked) if new <= tracked => {
                    tracing::debug!(
                        tracked = %tracked,
                        notified = %new,
                        "notification at or behind tracked cursor"
                    );
                    return Ok(Delta::default());
                }
                CursorState::Tracking(tracked) => tracked,
            }
        };

        let records = self.provider.list_history(from, new).await?;
        let message_ids = collect_added_ids(&records);
        tracing::debug!(
            from = %from,
            to = %new,
            records = records.len(),
            messages = message_ids.len(),
            "computed history delta"
        );
        Ok(Delta {
            message_ids,
            from: Some(from),
            target: Some(new),
        })
    }

    /// Record a delta as processed
    ///
    /// Moves the cursor forward to the delta's target. Ignored when the
    /// watch was re-armed since the delta was computed, or when the cursor
    /// already passed the target.
    pub async fn advance(&self, delta: &Delta) {
        let Some(target) = delta.target else {
            return;
        };
        let mut state = self.state.lock().await;
        match state.cursor {
            CursorState::Tracking(current) if current < target => {
                state.cursor = CursorState::Tracking(target);
                tracing::debug!(from = %current, to = %target, "advanced history cursor");
            }
            other => {
                tracing::debug!(state = ?other, target = %target, "cursor not advanced");
            }
        }
    }

    /// Stop the provider-side watch and forget the subscription
    ///
    /// The cursor returns to unarmed, so a later [`arm`](Self::arm) starts a
    /// fresh baseline.
    pub async fn disarm(&self) -> AppResult<()> {
        self.provider.stop().await?;
        let mut state = self.state.lock().await;
        state.subscription = None;
        state.cursor = CursorState::Unarmed;
        tracing::info!("stopped mailbox watch");
        Ok(())
    }

    pub async fn subscription(&self) -> Option<WatchSubscription> {
        self.state.lock().await.subscription.clone()
    }

    pub async fn cursor(&self) -> CursorState {
        self.state.lock().await.cursor
    }

    /// Start the background renewal task
    ///
    /// The task sleeps until shortly before the current watch expires, renews
    /// it (retrying with exponential backoff), and repeats. It stops when
    /// `cancel` fires.
    pub fn spawn_renewal(self: &Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        let sync = Arc::clone(self);
        tokio::spawn(async move { sync.renewal_loop(cancel).await })
    }

    async fn renewal_loop(&self, cancel: CancellationToken) {
        loop {
            let Some(subscription) = self.subscription().await else {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = self.rescheduled.notified() => {}
                }
                continue;
            };

            let delay = renewal_delay(subscription.expires_at, Utc::now(), self.settings.margin);
            tracing::debug!(
                expires_at = %subscription.expires_at,
                delay_secs = delay.as_secs(),
                "scheduled watch renewal"
            );
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = self.rescheduled.notified() => continue,
                _ = sleep(delay) => {}
            }

            if !self.renew_with_backoff(&cancel).await {
                break;
            }
        }
        tracing::info!("watch renewal stopped");
    }

    /// Returns `false` if cancelled before a renewal succeeded
    async fn renew_with_backoff(&self, cancel: &CancellationToken) -> bool {
        let mut backoff = self.settings.backoff_initial;
        let mut attempt: u32 = 1;
        loop {
            match self.renew().await {
                Ok(subscription) => {
                    tracing::info!(
                        attempt,
                        expires_at = %subscription.expires_at,
                        "renewed mailbox watch"
                    );
                    return true;
                }
                Err(e) => {
                    tracing::error!(
                        attempt,
                        code = e.code(),
                        error = %e,
                        retry_in_secs = backoff.as_secs(),
                        "watch renewal failed"
                    );
                    tokio::select! {
                        _ = cancel.cancelled() => return false,
                        _ = sleep(backoff) => {}
                    }
                    backoff = (backoff * 2).min(self.settings.backoff_max);
                    attempt += 1;
                }
            }
        }
    }
}

/// Time to wait before renewing a watch that expires at `expires_at`
///
/// Fires `margin` plus one second ahead of expiry, immediately if that point
/// has already passed.
pub fn renewal_delay(expires_at: DateTime<Utc>, now: DateTime<Utc>, margin: Duration) -> Duration {
    let remaining_ms = (expires_at - now).num_milliseconds();
    let lead_ms = i64::try_from(margin.as_millis())
        .unwrap_or(i64::MAX)
        .saturating_add(RENEWAL_SLACK_MS);
    let wait_ms = remaining_ms.saturating_sub(lead_ms).max(0);
    Duration::from_millis(u64::try_from(wait_ms).unwrap_or(0))
}

/// Flatten `messageAdded` ids across records, first occurrence wins
pub fn collect_added_ids(records: &[HistoryRecord]) -> Vec<String> {
    let mut seen = HashSet::new();
    records
        .iter()
        .flat_map(|record| &record.messages_added)
        .filter(|added| seen.insert(added.message.id.as_str()))
        .map(|added| added.message.id.clone())
        .collect()
}
