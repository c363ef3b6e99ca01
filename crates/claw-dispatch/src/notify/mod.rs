//! The notification pipeline.
//!
//! A flushed aggregation group is handed to a chain of [`Notifier`] stages,
//! each wrapping the next:
//!
//! ```text
//! Mute(inhibitor) -> Mute(silencer) -> Router -> per receiver:
//!     Dedup -> Retry -> Fanout -> integrations
//! ```
//!
//! [`build_pipeline`] assembles the chain, interleaving [`Log`] stages so
//! each step's outcome shows up in the trace.

mod dedup;
mod fanout;
mod log;
mod mute;
mod retry;
mod router;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::NotifyError;
use crate::inhibit::Inhibitor;
use crate::integration::Receiver;
use crate::route::GroupKey;
use crate::silence::Silencer;
use crate::store::NotificationLog;
use crate::types::{Alert, Fingerprint, FingerprintBuilder, LabelSet};

pub use dedup::Dedup;
pub use fanout::Fanout;
pub use log::Log;
pub use mute::Mute;
pub use retry::{Retry, RetryConfig};
pub use router::Router;

/// Everything a stage needs to know about the flush it is handling.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NotifyContext {
    /// The receiver the group routes to.
    pub receiver: String,
    /// Human-readable group key.
    pub group_key: String,
    /// Stable identity of the group, used to key the notification log.
    pub group_fingerprint: Fingerprint,
    /// The labels the group was formed on.
    pub group_labels: LabelSet,
    /// How long a successful notification stays fresh.
    pub repeat_interval: Duration,
    /// The evaluation time for this flush.
    pub now: DateTime<Utc>,
}

impl NotifyContext {
    /// Creates a context for a flush of `key` happening now.
    #[must_use]
    pub fn new(receiver: impl Into<String>, key: &GroupKey, repeat_interval: Duration) -> Self {
        Self {
            receiver: receiver.into(),
            group_key: key.to_string(),
            group_fingerprint: key.fingerprint(),
            group_labels: key.labels(),
            repeat_interval,
            now: Utc::now(),
        }
    }

    /// Overrides the evaluation time.
    #[must_use]
    pub const fn with_now(mut self, now: DateTime<Utc>) -> Self {
        self.now = now;
        self
    }

    /// Returns true if a notification recorded at `at` is still within the
    /// repeat interval.
    #[must_use]
    pub fn is_fresh(&self, at: DateTime<Utc>) -> bool {
        let age = self.now.signed_duration_since(at);
        age.to_std().map_or(true, |age| age < self.repeat_interval)
    }
}

/// One stage of the notification pipeline.
#[async_trait]
pub trait Notifier: Send + Sync {
    /// Processes a batch of alerts.
    ///
    /// Returns `Ok(true)` if something was delivered and `Ok(false)` if the
    /// batch was suppressed (muted, deduplicated or nothing to send).
    ///
    /// # Errors
    ///
    /// Returns the failure of this stage or of any stage it wraps.
    async fn notify(&self, ctx: &NotifyContext, alerts: &[Alert]) -> Result<bool, NotifyError>;
}

#[async_trait]
impl<N: Notifier + ?Sized> Notifier for Arc<N> {
    async fn notify(&self, ctx: &NotifyContext, alerts: &[Alert]) -> Result<bool, NotifyError> {
        (**self).notify(ctx, alerts).await
    }
}

/// A point-in-time muting decision.
pub trait Muter: Send + Sync {
    /// Returns true if alerts with `labels` are muted at `now`.
    fn mutes(&self, labels: &LabelSet, now: DateTime<Utc>) -> bool;
}

impl<M: Muter + ?Sized> Muter for Arc<M> {
    fn mutes(&self, labels: &LabelSet, now: DateTime<Utc>) -> bool {
        (**self).mutes(labels, now)
    }
}

/// Hashes the content of a batch: which alerts it holds and whether each
/// is resolved at `now`. Independent of batch order.
#[must_use]
pub fn content_hash(alerts: &[Alert], now: DateTime<Utc>) -> u64 {
    let mut entries: Vec<(Fingerprint, bool)> = alerts
        .iter()
        .map(|a| (a.fingerprint(), a.is_resolved_at(now)))
        .collect();
    entries.sort_unstable();

    let mut builder = FingerprintBuilder::new(b'B');
    for (fingerprint, resolved) in entries {
        builder.u64(fingerprint.0).tag(u8::from(resolved));
    }
    builder.finish().0
}

/// Assembles the full pipeline for a set of receivers.
#[must_use]
pub fn build_pipeline(
    receivers: Vec<Receiver>,
    inhibitor: Arc<Inhibitor>,
    silencer: Silencer,
    notification_log: Arc<dyn NotificationLog>,
    retry: &RetryConfig,
) -> Arc<dyn Notifier> {
    let mut router = Router::new();
    for receiver in receivers {
        let name = receiver.name.clone();
        let stage = Fanout::new(receiver, Arc::clone(&notification_log));
        let stage = Retry::new(retry.clone(), stage);
        let stage = Log::new("retry", stage);
        let stage = Dedup::new(Arc::clone(&notification_log), stage);
        let stage = Log::new("dedup", stage);
        router.insert(name, Arc::new(stage));
    }

    let stage = Log::new("route", router);
    let stage = Mute::new(silencer, stage);
    let stage = Log::new("silence", stage);
    let stage = Mute::new(inhibitor, stage);
    Arc::new(Log::new("inhibit", stage))
}
