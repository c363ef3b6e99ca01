//! Inhibition of alerts by co-occurring higher-priority alerts.
//!
//! The [`Inhibitor`] follows the alert feed, keeps the set of active alerts
//! and answers whether a label set is currently inhibited by one of its
//! [`InhibitRule`]s.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::StoreError;
use crate::matcher::Matchers;
use crate::notify::Muter;
use crate::store::{AlertProvider, AlertSubscription, FeedEvent};
use crate::types::{Alert, Fingerprint, LabelSet};

/// How often the inhibitor drops alerts that timed out.
pub const DEFAULT_PRUNE_INTERVAL: Duration = Duration::from_secs(60);

/// Suppresses target alerts while a matching source alert is active.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InhibitRule {
    source: Matchers,
    target: Matchers,
    equal: Vec<String>,
}

impl InhibitRule {
    /// Creates a rule.
    ///
    /// `equal` lists labels whose values must agree between source and
    /// target. An empty list means any source inhibits any target.
    #[must_use]
    pub fn new(source: Matchers, target: Matchers, equal: Vec<String>) -> Self {
        Self {
            source,
            target,
            equal,
        }
    }

    /// Matchers selecting inhibiting alerts.
    #[must_use]
    pub const fn source(&self) -> &Matchers {
        &self.source
    }

    /// Matchers selecting inhibited alerts.
    #[must_use]
    pub const fn target(&self) -> &Matchers {
        &self.target
    }

    /// Labels that must have equal values.
    #[must_use]
    pub fn equal(&self) -> &[String] {
        &self.equal
    }

    fn equal_labels_match(&self, source: &LabelSet, target: &LabelSet) -> bool {
        self.equal.iter().all(|name| source.get(name) == target.get(name))
    }

    /// Finds an active alert that inhibits `target` under this rule.
    ///
    /// `skip` filters out candidate sources; it is how earlier rules get
    /// precedence over later ones.
    fn find_source<'a>(
        &self,
        target: &LabelSet,
        target_fp: Fingerprint,
        active: &'a HashMap<Fingerprint, Alert>,
        now: DateTime<Utc>,
        skip: impl Fn(&Alert) -> bool,
    ) -> Option<&'a Alert> {
        if !self.target.matches(target) {
            return None;
        }
        active.iter().find_map(|(fp, source)| {
            let hit = *fp != target_fp
                && !source.is_resolved_at(now)
                && self.source.matches(&source.labels)
                && self.equal_labels_match(&source.labels, target)
                && !skip(source);
            hit.then_some(source)
        })
    }
}

/// Answers whether alerts are inhibited, following the alert feed.
///
/// Rules are evaluated in insertion order and the first rule that finds an
/// inhibiting source wins. A source alert that is itself directly inhibited
/// by an earlier rule cannot inhibit through a later one; this check is one
/// level deep, rules never chain.
pub struct Inhibitor {
    rules: Vec<InhibitRule>,
    active: RwLock<HashMap<Fingerprint, Alert>>,
    prune_interval: Duration,
    cancel: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl Inhibitor {
    /// Creates an inhibitor with no known alerts.
    #[must_use]
    pub fn new(rules: Vec<InhibitRule>) -> Self {
        Self {
            rules,
            active: RwLock::new(HashMap::new()),
            prune_interval: DEFAULT_PRUNE_INTERVAL,
            cancel: CancellationToken::new(),
            task: Mutex::new(None),
        }
    }

    /// Sets how often alerts whose `ends_at` has passed are dropped.
    #[must_use]
    pub fn with_prune_interval(mut self, interval: Duration) -> Self {
        self.prune_interval = interval.max(Duration::from_millis(1));
        self
    }

    /// The configured rules.
    #[must_use]
    pub fn rules(&self) -> &[InhibitRule] {
        &self.rules
    }

    /// Number of alerts currently considered active.
    #[must_use]
    pub fn active_count(&self) -> usize {
        self.active.read().len()
    }

    /// Subscribes to the alert feed and starts following it.
    ///
    /// # Errors
    ///
    /// Returns an error if the alert store cannot be subscribed to.
    pub fn start(self: &Arc<Self>, alerts: Arc<dyn AlertProvider>) -> Result<(), StoreError> {
        let subscription = alerts.subscribe()?;
        self.spawn(alerts, subscription);
        Ok(())
    }

    /// Starts following an existing subscription.
    pub fn spawn(self: &Arc<Self>, alerts: Arc<dyn AlertProvider>, subscription: AlertSubscription) {
        let this = Arc::clone(self);
        let handle = tokio::spawn(async move { this.run(alerts, subscription).await });
        if let Some(previous) = self.task.lock().replace(handle) {
            previous.abort();
        }
    }

    async fn run(&self, alerts: Arc<dyn AlertProvider>, mut subscription: AlertSubscription) {
        info!(rules = self.rules.len(), "inhibitor started");
        let mut sweep = tokio::time::interval(self.prune_interval);
        sweep.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                biased;
                () = self.cancel.cancelled() => break,
                _ = sweep.tick() => {
                    let removed = self.prune(Utc::now());
                    if removed > 0 {
                        debug!(removed, "pruned expired alerts from inhibitor");
                    }
                }
                event = subscription.next() => match event {
                    Some(FeedEvent::Alert(alert)) => self.observe(alert),
                    Some(FeedEvent::Lagged(missed)) => {
                        warn!(missed, "inhibitor lagged behind alert feed, resynchronising");
                        match alerts.active() {
                            Ok(active) => self.resync(active),
                            Err(e) => warn!(error = %e, "failed to resynchronise inhibitor"),
                        }
                    }
                    None => {
                        debug!("alert feed closed");
                        break;
                    }
                },
            }
        }
        info!("inhibitor stopped");
    }

    /// Stops following the feed and waits for the background task to exit.
    ///
    /// Safe to call more than once and on an inhibitor that never started.
    pub async fn stop(&self) {
        self.cancel.cancel();
        let handle = self.task.lock().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                if e.is_panic() {
                    error!("inhibitor task panicked");
                }
            }
        }
    }

    /// Applies one alert update to the active set.
    pub fn observe(&self, alert: Alert) {
        let fp = alert.fingerprint();
        let mut active = self.active.write();
        if alert.is_resolved() {
            active.remove(&fp);
        } else {
            active.insert(fp, alert);
        }
    }

    /// Drops alerts resolved at `now`, including those that timed out
    /// through `ends_at` without an explicit update. Returns how many were
    /// removed.
    pub fn prune(&self, now: DateTime<Utc>) -> usize {
        let mut active = self.active.write();
        let before = active.len();
        active.retain(|_, alert| !alert.is_resolved_at(now));
        before - active.len()
    }

    /// Replaces the active set wholesale.
    pub fn resync(&self, alerts: Vec<Alert>) {
        let now = Utc::now();
        let fresh = alerts
            .into_iter()
            .filter(|a| !a.is_resolved_at(now))
            .map(|a| (a.fingerprint(), a))
            .collect();
        *self.active.write() = fresh;
    }

    /// Returns true if `labels` is inhibited at `now`.
    #[must_use]
    pub fn is_inhibited(&self, labels: &LabelSet, now: DateTime<Utc>) -> bool {
        let active = self.active.read();
        let target_fp = labels.fingerprint();

        for (i, rule) in self.rules.iter().enumerate() {
            let earlier = &self.rules[..i];
            let directly_inhibited = |source: &Alert| {
                let source_fp = source.fingerprint();
                earlier.iter().any(|r| {
                    r.find_source(&source.labels, source_fp, &active, now, |_| false)
                        .is_some()
                })
            };

            if let Some(source) = rule.find_source(labels, target_fp, &active, now, directly_inhibited) {
                debug!(
                    target = %labels,
                    source = %source.labels,
                    rule = i,
                    "alert inhibited"
                );
                return true;
            }
        }
        false
    }
}

impl std::fmt::Debug for Inhibitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Inhibitor")
            .field("rules", &self.rules.len())
            .field("active", &self.active_count())
            .finish_non_exhaustive()
    }
}

impl Muter for Inhibitor {
    fn mutes(&self, labels: &LabelSet, now: DateTime<Utc>) -> bool {
        self.is_inhibited(labels, now)
    }
}
