use async_trait::async_trait;
use tracing::debug;

use super::{Muter, Notifier, NotifyContext};
use crate::error::NotifyError;
use crate::types::Alert;

/// Drops muted alerts before passing the batch on.
///
/// If every alert is muted the inner stage is not called at all.
#[derive(Debug)]
pub struct Mute<M, N> {
    muter: M,
    inner: N,
}

impl<M, N> Mute<M, N> {
    /// Wraps `inner` with a muting filter.
    pub const fn new(muter: M, inner: N) -> Self {
        Self { muter, inner }
    }
}

#[async_trait]
impl<M: Muter, N: Notifier> Notifier for Mute<M, N> {
    async fn notify(&self, ctx: &NotifyContext, alerts: &[Alert]) -> Result<bool, NotifyError> {
        let kept: Vec<Alert> = alerts
            .iter()
            .filter(|a| !self.muter.mutes(&a.labels, ctx.now))
            .cloned()
            .collect();

        let muted = alerts.len() - kept.len();
        if kept.is_empty() {
            debug!(group = %ctx.group_key, muted, "all alerts muted");
            return Ok(false);
        }
        if muted > 0 {
            debug!(group = %ctx.group_key, muted, remaining = kept.len(), "muted alerts removed");
        }

        self.inner.notify(ctx, &kept).await
    }
}
