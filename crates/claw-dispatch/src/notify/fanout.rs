use std::sync::Arc;

use async_trait::async_trait;
use futures::future::join_all;
use tracing::{debug, warn};

use super::{content_hash, Notifier, NotifyContext};
use crate::error::NotifyError;
use crate::integration::{Integration, Receiver};
use crate::store::{NotificationLog, NotifyInfo};
use crate::types::Alert;

/// Delivers a batch to every integration of a receiver concurrently.
///
/// Each integration's success is recorded in the notification log under its
/// own key, so when a retry re-runs the fanout, integrations that already
/// delivered this exact content are skipped.
pub struct Fanout {
    receiver: String,
    integrations: Vec<Arc<dyn Integration>>,
    log: Arc<dyn NotificationLog>,
}

impl Fanout {
    /// Creates a fanout over the receiver's integrations.
    pub fn new(receiver: Receiver, log: Arc<dyn NotificationLog>) -> Self {
        Self {
            receiver: receiver.name,
            integrations: receiver.integrations,
            log,
        }
    }

    fn log_key(&self, index: usize, integration: &dyn Integration) -> String {
        format!("{}/{index}/{}", self.receiver, integration.name())
    }

    fn already_delivered(&self, key: &str, ctx: &NotifyContext, hash: u64) -> bool {
        match self.log.get(key, ctx.group_fingerprint) {
            Ok(Some(prev)) => prev.success && prev.hash == hash && ctx.is_fresh(prev.timestamp),
            Ok(None) => false,
            Err(e) => {
                warn!(integration = %key, error = %e, "notification log unreadable");
                false
            }
        }
    }

    async fn deliver(
        &self,
        index: usize,
        integration: &dyn Integration,
        ctx: &NotifyContext,
        alerts: &[Alert],
        hash: u64,
    ) -> Result<bool, NotifyError> {
        let key = self.log_key(index, integration);
        if self.already_delivered(&key, ctx, hash) {
            debug!(integration = %key, "already delivered, skipping");
            return Ok(false);
        }

        integration.send(ctx, alerts).await?;

        let info = NotifyInfo {
            timestamp: ctx.now,
            hash,
            success: true,
        };
        if let Err(e) = self.log.set(&key, ctx.group_fingerprint, info) {
            warn!(integration = %key, error = %e, "failed to record delivery");
        }
        Ok(true)
    }
}

impl std::fmt::Debug for Fanout {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Fanout")
            .field("receiver", &self.receiver)
            .field("integrations", &self.integrations)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl Notifier for Fanout {
    async fn notify(&self, ctx: &NotifyContext, alerts: &[Alert]) -> Result<bool, NotifyError> {
        let hash = content_hash(alerts, ctx.now);
        let results = join_all(
            self.integrations
                .iter()
                .enumerate()
                .map(|(i, integration)| self.deliver(i, integration.as_ref(), ctx, alerts, hash)),
        )
        .await;

        let total = results.len();
        let mut delivered = false;
        let mut failures = Vec::new();
        for result in results {
            match result {
                Ok(sent) => delivered |= sent,
                Err(e) => failures.push(e),
            }
        }

        match failures.len() {
            0 => Ok(delivered),
            1 if total == 1 => Err(failures.remove(0)),
            _ => Err(NotifyError::Partial {
                receiver: self.receiver.clone(),
                total,
                failures,
            }),
        }
    }
}
