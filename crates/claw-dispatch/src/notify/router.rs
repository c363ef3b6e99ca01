use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::error;

use super::{Notifier, NotifyContext};
use crate::error::NotifyError;
use crate::types::Alert;

/// Dispatches a batch to the sub-pipeline of the context's receiver.
#[derive(Default)]
pub struct Router {
    routes: HashMap<String, Arc<dyn Notifier>>,
}

impl Router {
    /// Creates an empty router.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers the sub-pipeline for `receiver`, replacing any previous one.
    pub fn insert(&mut self, receiver: impl Into<String>, notifier: Arc<dyn Notifier>) {
        self.routes.insert(receiver.into(), notifier);
    }

    /// Returns true if `receiver` has a sub-pipeline.
    #[must_use]
    pub fn contains(&self, receiver: &str) -> bool {
        self.routes.contains_key(receiver)
    }

    /// Names of all registered receivers.
    pub fn receivers(&self) -> impl Iterator<Item = &str> {
        self.routes.keys().map(String::as_str)
    }
}

impl std::fmt::Debug for Router {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut names: Vec<_> = self.receivers().collect();
        names.sort_unstable();
        f.debug_struct("Router").field("receivers", &names).finish()
    }
}

#[async_trait]
impl Notifier for Router {
    async fn notify(&self, ctx: &NotifyContext, alerts: &[Alert]) -> Result<bool, NotifyError> {
        let Some(notifier) = self.routes.get(&ctx.receiver) else {
            error!(receiver = %ctx.receiver, group = %ctx.group_key, "no pipeline for receiver");
            return Err(NotifyError::UnknownReceiver {
                name: ctx.receiver.clone(),
            });
        };
        notifier.notify(ctx, alerts).await
    }
}
