//! Interfaces to the external stores the dispatch core depends on.
//!
//! This module provides the traits for abstracting over the alert store,
//! the silence store and the notification log, together with thread-safe
//! in-memory implementations:
//! - [`MemAlerts`]: alert store with a live broadcast feed
//! - [`MemNotificationLog`]: per-key notification records
//!
//! The in-memory silence store lives in [`crate::silence`].

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tracing::debug;

use crate::error::StoreError;
use crate::types::{Alert, Fingerprint, LabelSet};

/// One step of an alert feed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FeedEvent {
    /// An alert was created, updated or resolved.
    Alert(Alert),
    /// The subscriber fell behind and missed this many updates. It should
    /// resynchronise from [`AlertProvider::active`].
    Lagged(u64),
}

/// A live subscription to alert changes.
///
/// The subscription first yields the alerts that were active when it was
/// created, then every subsequent update in the order the store saw them.
#[derive(Debug)]
pub struct AlertSubscription {
    backfill: VecDeque<Alert>,
    updates: broadcast::Receiver<Alert>,
}

impl AlertSubscription {
    /// Creates a subscription from a backfill and a live receiver.
    #[must_use]
    pub fn new(backfill: Vec<Alert>, updates: broadcast::Receiver<Alert>) -> Self {
        Self {
            backfill: backfill.into(),
            updates,
        }
    }

    /// Waits for the next feed event. Returns `None` once the store is gone.
    pub async fn next(&mut self) -> Option<FeedEvent> {
        if let Some(alert) = self.backfill.pop_front() {
            return Some(FeedEvent::Alert(alert));
        }

        match self.updates.recv().await {
            Ok(alert) => Some(FeedEvent::Alert(alert)),
            Err(RecvError::Lagged(missed)) => Some(FeedEvent::Lagged(missed)),
            Err(RecvError::Closed) => None,
        }
    }
}

/// Source of truth for alerts.
pub trait AlertProvider: Send + Sync {
    /// Subscribes to alert changes, starting with the active alerts.
    ///
    /// # Errors
    ///
    /// Returns an error if the store is unavailable.
    fn subscribe(&self) -> Result<AlertSubscription, StoreError>;

    /// Returns the alerts active right now.
    ///
    /// # Errors
    ///
    /// Returns an error if the store is unavailable.
    fn active(&self) -> Result<Vec<Alert>, StoreError>;

    /// Returns the latest state of the alert with the given fingerprint.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::NotFound` if the alert is unknown.
    fn get(&self, fingerprint: Fingerprint) -> Result<Alert, StoreError>;

    /// Inserts or replaces alerts, publishing each to subscribers.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot accept the alerts.
    fn put(&self, alerts: Vec<Alert>) -> Result<(), StoreError>;
}

/// Point-in-time silence membership.
pub trait SilenceProvider: Send + Sync {
    /// Returns true if any silence valid at `now` matches `labels`.
    ///
    /// # Errors
    ///
    /// Returns an error if the store is unavailable.
    fn mutes(&self, labels: &LabelSet, now: DateTime<Utc>) -> Result<bool, StoreError>;
}

/// The last recorded notification for a (receiver, group) pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotifyInfo {
    /// When the notification was attempted.
    pub timestamp: DateTime<Utc>,
    /// Content hash of the notified alert batch.
    pub hash: u64,
    /// Whether delivery succeeded.
    pub success: bool,
}

/// Persistent record of past notifications. Writes are atomic per key.
pub trait NotificationLog: Send + Sync {
    /// Reads the record for `(receiver, fingerprint)`.
    ///
    /// # Errors
    ///
    /// Returns an error if the log is unavailable.
    fn get(&self, receiver: &str, fingerprint: Fingerprint) -> Result<Option<NotifyInfo>, StoreError>;

    /// Replaces the record for `(receiver, fingerprint)`.
    ///
    /// # Errors
    ///
    /// Returns an error if the log is unavailable.
    fn set(&self, receiver: &str, fingerprint: Fingerprint, info: NotifyInfo) -> Result<(), StoreError>;
}

/// Configuration for [`MemAlerts`].
#[derive(Debug, Clone)]
pub struct MemAlertsConfig {
    /// Channel capacity for the live feed.
    pub feed_buffer_size: usize,
    /// How long resolved alerts are kept by [`MemAlerts::gc`].
    pub resolved_retention: Duration,
}

impl Default for MemAlertsConfig {
    fn default() -> Self {
        Self {
            feed_buffer_size: 1024,
            resolved_retention: Duration::from_secs(60 * 60),
        }
    }
}

/// Thread-safe in-memory alert store with a live feed.
#[derive(Debug)]
pub struct MemAlerts {
    config: MemAlertsConfig,
    alerts: RwLock<HashMap<Fingerprint, Alert>>,
    feed: broadcast::Sender<Alert>,
}

impl MemAlerts {
    /// Creates an empty store with default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(MemAlertsConfig::default())
    }

    /// Creates an empty store.
    #[must_use]
    pub fn with_config(config: MemAlertsConfig) -> Self {
        let (feed, _) = broadcast::channel(config.feed_buffer_size.max(1));
        Self {
            config,
            alerts: RwLock::new(HashMap::new()),
            feed,
        }
    }

    /// Returns the number of stored alerts, resolved ones included.
    #[must_use]
    pub fn len(&self) -> usize {
        self.alerts.read().len()
    }

    /// Returns true if the store is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.alerts.read().is_empty()
    }

    /// Drops alerts resolved for longer than the retention period.
    ///
    /// Returns the number of alerts removed.
    pub fn gc(&self, now: DateTime<Utc>) -> usize {
        let retention = chrono::Duration::from_std(self.config.resolved_retention)
            .unwrap_or_else(|_| chrono::Duration::zero());
        let mut alerts = self.alerts.write();
        let before = alerts.len();
        alerts.retain(|_, a| a.ends_at.is_none_or(|end| now.signed_duration_since(end) < retention));
        let removed = before - alerts.len();
        if removed > 0 {
            debug!(removed, "garbage collected resolved alerts");
        }
        removed
    }
}

impl Default for MemAlerts {
    fn default() -> Self {
        Self::new()
    }
}

impl AlertProvider for MemAlerts {
    fn subscribe(&self) -> Result<AlertSubscription, StoreError> {
        // Subscribe before taking the snapshot so no update falls in between.
        let updates = self.feed.subscribe();
        let backfill = self.active()?;
        Ok(AlertSubscription::new(backfill, updates))
    }

    fn active(&self) -> Result<Vec<Alert>, StoreError> {
        let now = Utc::now();
        Ok(self
            .alerts
            .read()
            .values()
            .filter(|a| !a.is_resolved_at(now))
            .cloned()
            .collect())
    }

    fn get(&self, fingerprint: Fingerprint) -> Result<Alert, StoreError> {
        self.alerts
            .read()
            .get(&fingerprint)
            .cloned()
            .ok_or_else(|| StoreError::NotFound {
                id: fingerprint.to_string(),
            })
    }

    fn put(&self, alerts: Vec<Alert>) -> Result<(), StoreError> {
        // The feed is published under the write lock so subscribers see
        // updates to one fingerprint in the order they were stored.
        let mut stored = self.alerts.write();
        for alert in alerts {
            stored.insert(alert.fingerprint(), alert.clone());
            // Sending fails only when nobody is subscribed.
            let _ = self.feed.send(alert);
        }
        Ok(())
    }
}

/// Thread-safe in-memory notification log.
#[derive(Debug, Default)]
pub struct MemNotificationLog {
    entries: RwLock<HashMap<(String, Fingerprint), NotifyInfo>>,
}

impl MemNotificationLog {
    /// Creates an empty log.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the number of records.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    /// Returns true if the log is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

impl NotificationLog for MemNotificationLog {
    fn get(&self, receiver: &str, fingerprint: Fingerprint) -> Result<Option<NotifyInfo>, StoreError> {
        Ok(self
            .entries
            .read()
            .get(&(receiver.to_string(), fingerprint))
            .copied())
    }

    fn set(&self, receiver: &str, fingerprint: Fingerprint, info: NotifyInfo) -> Result<(), StoreError> {
        self.entries
            .write()
            .insert((receiver.to_string(), fingerprint), info);
        Ok(())
    }
}
