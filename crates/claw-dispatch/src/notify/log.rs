use async_trait::async_trait;
use tracing::{debug, warn};

use super::{Notifier, NotifyContext};
use crate::error::NotifyError;
use crate::types::Alert;

/// Traces the outcome of the stage it wraps and passes it through unchanged.
#[derive(Debug)]
pub struct Log<N> {
    step: &'static str,
    inner: N,
}

impl<N> Log<N> {
    /// Wraps `inner`, labelling trace events with `step`.
    pub const fn new(step: &'static str, inner: N) -> Self {
        Self { step, inner }
    }
}

#[async_trait]
impl<N: Notifier> Notifier for Log<N> {
    async fn notify(&self, ctx: &NotifyContext, alerts: &[Alert]) -> Result<bool, NotifyError> {
        let result = self.inner.notify(ctx, alerts).await;
        match &result {
            Ok(delivered) => debug!(
                step = self.step,
                receiver = %ctx.receiver,
                group = %ctx.group_key,
                alerts = alerts.len(),
                delivered,
                "notify step completed"
            ),
            Err(e) => warn!(
                step = self.step,
                receiver = %ctx.receiver,
                group = %ctx.group_key,
                alerts = alerts.len(),
                error = %e,
                "notify step failed"
            ),
        }
        result
    }
}
