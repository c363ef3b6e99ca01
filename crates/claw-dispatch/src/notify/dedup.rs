use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, warn};

use super::{content_hash, Notifier, NotifyContext};
use crate::error::NotifyError;
use crate::store::{NotificationLog, NotifyInfo};
use crate::types::Alert;

/// Suppresses a batch that was already delivered to the receiver recently.
///
/// A batch is suppressed only when the last record for the (receiver,
/// group) pair was a success, has the same content hash and is younger
/// than the repeat interval. Every attempt that reaches the inner stage is
/// recorded afterwards, successful or not.
///
/// An unreadable log is treated as "no previous notification" and a failed
/// write is logged; neither fails the flush.
pub struct Dedup<N> {
    log: Arc<dyn NotificationLog>,
    inner: N,
}

impl<N> Dedup<N> {
    /// Wraps `inner` with deduplication against `log`.
    pub fn new(log: Arc<dyn NotificationLog>, inner: N) -> Self {
        Self { log, inner }
    }

    fn previous(&self, ctx: &NotifyContext) -> Option<NotifyInfo> {
        match self.log.get(&ctx.receiver, ctx.group_fingerprint) {
            Ok(info) => info,
            Err(e) => {
                warn!(receiver = %ctx.receiver, group = %ctx.group_key, error = %e, "notification log unreadable");
                None
            }
        }
    }
}

impl<N> std::fmt::Debug for Dedup<N> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dedup").finish_non_exhaustive()
    }
}

#[async_trait]
impl<N: Notifier> Notifier for Dedup<N> {
    async fn notify(&self, ctx: &NotifyContext, alerts: &[Alert]) -> Result<bool, NotifyError> {
        let hash = content_hash(alerts, ctx.now);

        if let Some(prev) = self.previous(ctx) {
            if prev.success && prev.hash == hash && ctx.is_fresh(prev.timestamp) {
                debug!(receiver = %ctx.receiver, group = %ctx.group_key, "already notified, skipping");
                return Ok(false);
            }
        }

        let result = self.inner.notify(ctx, alerts).await;

        let info = NotifyInfo {
            timestamp: ctx.now,
            hash,
            success: result.is_ok(),
        };
        if let Err(e) = self.log.set(&ctx.receiver, ctx.group_fingerprint, info) {
            warn!(receiver = %ctx.receiver, group = %ctx.group_key, error = %e, "failed to record notification");
        }

        result
    }
}
