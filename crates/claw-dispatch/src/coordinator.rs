//! Owns the running dispatcher and inhibitor and swaps them on reload.
//!
//! A new configuration is fully built before the running instance is
//! touched, so a document that fails validation leaves the old instance
//! running. Once built, the old dispatcher is stopped completely before the
//! new one starts: two dispatchers never flush side by side.

use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::{error, info};

use crate::config::Config;
use crate::dispatch::Dispatcher;
use crate::error::{ConfigError, Result};
use crate::inhibit::Inhibitor;
use crate::integration::Integration;
use crate::notify::build_pipeline;
use crate::silence::Silencer;
use crate::store::{AlertProvider, NotificationLog, SilenceProvider};

/// The stores shared by every configuration generation.
#[derive(Clone)]
pub struct Stores {
    /// Alert store and feed.
    pub alerts: Arc<dyn AlertProvider>,
    /// Silence store.
    pub silences: Arc<dyn SilenceProvider>,
    /// Notification log.
    pub notification_log: Arc<dyn NotificationLog>,
}

impl std::fmt::Debug for Stores {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Stores").finish_non_exhaustive()
    }
}

struct Active {
    generation: u64,
    dispatcher: Arc<Dispatcher>,
    inhibitor: Arc<Inhibitor>,
}

/// Applies configurations and owns the resulting dispatcher.
pub struct Coordinator {
    stores: Stores,
    attached: Vec<(String, Arc<dyn Integration>)>,
    active: Mutex<Option<Active>>,
    generations: AtomicU64,
}

impl Coordinator {
    /// Creates a coordinator with nothing running.
    #[must_use]
    pub fn new(stores: Stores) -> Self {
        Self {
            stores,
            attached: Vec::new(),
            active: Mutex::new(None),
            generations: AtomicU64::new(0),
        }
    }

    /// Attaches an in-process integration to the receiver named `receiver`
    /// in every configuration applied from now on. Ignored for
    /// configurations that do not define that receiver.
    #[must_use]
    pub fn with_integration(
        mut self,
        receiver: impl Into<String>,
        integration: Arc<dyn Integration>,
    ) -> Self {
        self.attached.push((receiver.into(), integration));
        self
    }

    /// Validates `config`, then replaces the running instance with one built
    /// from it. Returns the new generation number.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if `config` is invalid, in which case
    /// the running instance is untouched, or a store error if the alert
    /// feed cannot be subscribed to.
    pub async fn apply(&self, config: &Config) -> Result<u64> {
        config.validate()?;
        let route = Arc::new(config.build_route()?);
        let inhibitor = Arc::new(Inhibitor::new(config.build_inhibit_rules()?));
        let mut receivers = config.build_receivers()?;
        for receiver in &mut receivers {
            for (name, integration) in &self.attached {
                if *name == receiver.name {
                    receiver.integrations.push(Arc::clone(integration));
                }
            }
        }
        let notifier = build_pipeline(
            receivers,
            Arc::clone(&inhibitor),
            Silencer::new(Arc::clone(&self.stores.silences)),
            Arc::clone(&self.stores.notification_log),
            &config.retry.to_retry_config(),
        );
        let dispatcher = Arc::new(Dispatcher::new(
            route,
            Arc::clone(&self.stores.alerts),
            notifier,
        ));

        let mut active = self.active.lock().await;

        // Feeds are acquired while the old instance is still running.
        let inhibitor_feed = self.stores.alerts.subscribe()?;
        let dispatcher_feed = self.stores.alerts.subscribe()?;

        if let Some(old) = active.take() {
            old.dispatcher.stop().await;
            old.inhibitor.stop().await;
            info!(generation = old.generation, "stopped previous configuration");
        }

        let generation = self.generations.fetch_add(1, Ordering::SeqCst) + 1;

        inhibitor.spawn(Arc::clone(&self.stores.alerts), inhibitor_feed);
        dispatcher.spawn(dispatcher_feed);
        info!(
            generation,
            receivers = config.receivers.len(),
            inhibit_rules = config.inhibit_rules.len(),
            "configuration applied"
        );

        *active = Some(Active {
            generation,
            dispatcher,
            inhibitor,
        });
        Ok(generation)
    }

    /// Loads a configuration file and applies it.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be loaded or applied. The running
    /// instance is kept on any configuration error.
    pub async fn reload_file(&self, path: impl AsRef<Path>) -> Result<u64> {
        let path = path.as_ref();
        let config = Config::load_file(path).map_err(|e: ConfigError| {
            error!(path = %path.display(), error = %e, "failed to load configuration");
            e
        })?;
        self.apply(&config).await
    }

    /// Stops the running instance, if any. Safe to call more than once.
    pub async fn shutdown(&self) {
        let mut active = self.active.lock().await;
        if let Some(old) = active.take() {
            old.dispatcher.stop().await;
            old.inhibitor.stop().await;
            info!(generation = old.generation, "shut down");
        }
    }

    /// Generation of the running configuration, if one is running.
    pub async fn generation(&self) -> Option<u64> {
        self.active.lock().await.as_ref().map(|a| a.generation)
    }

    /// The running dispatcher, if any.
    pub async fn dispatcher(&self) -> Option<Arc<Dispatcher>> {
        self.active.lock().await.as_ref().map(|a| Arc::clone(&a.dispatcher))
    }
}

impl std::fmt::Debug for Coordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Coordinator").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::DispatchError;
    use crate::silence::MemSilences;
    use crate::store::{MemAlerts, MemNotificationLog};

    fn stores() -> Stores {
        Stores {
            alerts: Arc::new(MemAlerts::new()),
            silences: Arc::new(MemSilences::new()),
            notification_log: Arc::new(MemNotificationLog::new()),
        }
    }

    fn config(receiver: &str) -> Config {
        Config::from_json(&format!(
            r#"{{"route": {{"receiver": "{receiver}"}}, "receivers": [{{"name": "{receiver}"}}]}}"#
        ))
        .unwrap()
    }

    #[tokio::test]
    async fn apply_starts_and_replaces() {
        let coordinator = Coordinator::new(stores());
        assert_eq!(coordinator.generation().await, None);

        assert_eq!(coordinator.apply(&config("a")).await.unwrap(), 1);
        let first = coordinator.dispatcher().await.unwrap();
        assert_eq!(first.route().receiver(), "a");

        assert_eq!(coordinator.apply(&config("b")).await.unwrap(), 2);
        let second = coordinator.dispatcher().await.unwrap();
        assert_eq!(second.route().receiver(), "b");
        assert!(!Arc::ptr_eq(&first, &second));

        coordinator.shutdown().await;
        assert_eq!(coordinator.generation().await, None);
    }

    #[tokio::test]
    async fn invalid_config_keeps_running_instance() {
        let coordinator = Coordinator::new(stores());
        coordinator.apply(&config("a")).await.unwrap();

        let mut bad = config("a");
        bad.route.receiver = Some("ghost".to_string());
        let err = coordinator.apply(&bad).await.unwrap_err();

        assert!(matches!(err, DispatchError::Config(ConfigError::UnknownReceiver { .. })));
        assert_eq!(coordinator.generation().await, Some(1));
        coordinator.shutdown().await;
    }

    #[tokio::test]
    async fn reload_missing_file_keeps_running_instance() {
        let coordinator = Coordinator::new(stores());
        coordinator.apply(&config("a")).await.unwrap();

        assert!(coordinator.reload_file("/nonexistent/config.json").await.is_err());
        assert_eq!(coordinator.generation().await, Some(1));
        coordinator.shutdown().await;
    }

    #[tokio::test]
    async fn shutdown_is_idempotent() {
        let coordinator = Coordinator::new(stores());
        coordinator.shutdown().await;
        coordinator.apply(&config("a")).await.unwrap();
        coordinator.shutdown().await;
        coordinator.shutdown().await;
    }
}
