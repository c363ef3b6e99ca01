//! The dispatcher: routing alerts into aggregation groups and flushing
//! groups through the notification pipeline on their timers.
//!
//! Every aggregation group runs as its own task. A group flushes first
//! `group_wait` after it is created, then every `repeat_interval`, or
//! `group_interval` after the previous flush when its contents change.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use chrono::Utc;
use futures::FutureExt;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::StoreError;
use crate::notify::{Notifier, NotifyContext};
use crate::route::{GroupKey, Route, RouteOpts};
use crate::store::{AlertProvider, AlertSubscription, FeedEvent};
use crate::types::{Alert, Fingerprint};

type GroupTable = Arc<Mutex<HashMap<GroupKey, GroupHandle>>>;

struct GroupHandle {
    group: Arc<AggrGroup>,
    task: JoinHandle<()>,
}

#[derive(Debug)]
struct GroupState {
    alerts: BTreeMap<Fingerprint, Alert>,
    next_flush: Instant,
    last_flush: Option<Instant>,
    empty_since: Option<Instant>,
}

/// What a group does when its deadline passes.
#[derive(Debug)]
enum Wakeup {
    Flush(Vec<Alert>),
    Idle,
    Evict,
}

/// Alerts sharing a route and grouping label values.
#[derive(Debug)]
struct AggrGroup {
    key: GroupKey,
    opts: RouteOpts,
    state: Mutex<GroupState>,
    wake: Notify,
}

impl AggrGroup {
    fn new(key: GroupKey, opts: RouteOpts, now: Instant) -> Self {
        let next_flush = now + opts.group_wait;
        Self {
            key,
            opts,
            state: Mutex::new(GroupState {
                alerts: BTreeMap::new(),
                next_flush,
                last_flush: None,
                empty_since: None,
            }),
            wake: Notify::new(),
        }
    }

    /// Adds or replaces an alert.
    ///
    /// Once the group has flushed, a change pulls the next flush forward to
    /// `group_interval` after the previous one. Before the first flush the
    /// `group_wait` deadline stands. A change arriving more than
    /// `group_interval` after the previous flush is flushed at once.
    fn insert(&self, alert: Alert) {
        let fp = alert.fingerprint();
        let mut state = self.state.lock();
        let changed = state.alerts.get(&fp) != Some(&alert);
        state.alerts.insert(fp, alert);
        state.empty_since = None;

        if !changed {
            return;
        }
        if let Some(last) = state.last_flush {
            let candidate = last + self.opts.group_interval;
            if candidate < state.next_flush {
                state.next_flush = candidate;
                self.wake.notify_one();
            }
        }
    }

    fn deadline(&self) -> Instant {
        self.state.lock().next_flush
    }

    fn on_deadline(&self, now: Instant) -> Wakeup {
        let mut state = self.state.lock();
        if now < state.next_flush {
            return Wakeup::Idle;
        }

        if state.alerts.is_empty() {
            let since = *state.empty_since.get_or_insert(now);
            if now.duration_since(since) >= self.opts.group_interval {
                return Wakeup::Evict;
            }
            state.next_flush = since + self.opts.group_interval;
            return Wakeup::Idle;
        }

        state.last_flush = Some(now);
        state.next_flush = now + self.opts.repeat_interval;
        Wakeup::Flush(state.alerts.values().cloned().collect())
    }

    /// Drops the resolved alerts that were just delivered, unless they
    /// changed while the flush was running.
    fn on_delivered(&self, sent: &[Alert]) {
        let now = Utc::now();
        let mut state = self.state.lock();
        for alert in sent.iter().filter(|a| a.is_resolved_at(now)) {
            let fp = alert.fingerprint();
            if state.alerts.get(&fp) == Some(alert) {
                state.alerts.remove(&fp);
            }
        }
        if state.alerts.is_empty() && state.empty_since.is_none() {
            let now = Instant::now();
            state.empty_since = Some(now);
            let evict_at = now + self.opts.group_interval;
            if evict_at < state.next_flush {
                state.next_flush = evict_at;
            }
        }
    }

    /// Schedules another attempt one `group_interval` after the failed flush.
    fn on_failed(&self) {
        let mut state = self.state.lock();
        if let Some(last) = state.last_flush {
            let retry_at = last + self.opts.group_interval;
            if retry_at < state.next_flush {
                state.next_flush = retry_at;
            }
        }
    }

    fn alerts(&self) -> Vec<Alert> {
        self.state.lock().alerts.values().cloned().collect()
    }

    fn fingerprints(&self) -> Vec<Fingerprint> {
        self.state.lock().alerts.keys().copied().collect()
    }
}

/// Routes alerts from the feed into aggregation groups and flushes them
/// through a notifier.
///
/// A dispatcher runs once: after [`Dispatcher::stop`] it cannot be started
/// again. Configuration reloads build a new dispatcher.
pub struct Dispatcher {
    route: Arc<Route>,
    alerts: Arc<dyn AlertProvider>,
    notifier: Arc<dyn Notifier>,
    groups: GroupTable,
    cancel: CancellationToken,
    run_task: Mutex<Option<JoinHandle<()>>>,
    stopping: tokio::sync::Mutex<()>,
}

impl Dispatcher {
    /// Creates a dispatcher. Nothing runs until [`Dispatcher::start`].
    #[must_use]
    pub fn new(route: Arc<Route>, alerts: Arc<dyn AlertProvider>, notifier: Arc<dyn Notifier>) -> Self {
        Self {
            route,
            alerts,
            notifier,
            groups: Arc::new(Mutex::new(HashMap::new())),
            cancel: CancellationToken::new(),
            run_task: Mutex::new(None),
            stopping: tokio::sync::Mutex::new(()),
        }
    }

    /// The routing tree.
    #[must_use]
    pub fn route(&self) -> &Route {
        &self.route
    }

    /// Subscribes to the alert feed and starts dispatching.
    ///
    /// # Errors
    ///
    /// Returns an error if the alert store cannot be subscribed to.
    pub fn start(self: &Arc<Self>) -> Result<(), StoreError> {
        let subscription = self.alerts.subscribe()?;
        self.spawn(subscription);
        Ok(())
    }

    /// Starts dispatching from an existing subscription.
    pub fn spawn(self: &Arc<Self>, subscription: AlertSubscription) {
        let this = Arc::clone(self);
        let handle = tokio::spawn(async move { this.run(subscription).await });
        if let Some(previous) = self.run_task.lock().replace(handle) {
            previous.abort();
        }
    }

    /// Consumes the feed until the dispatcher is stopped or the feed closes.
    pub async fn run(&self, mut subscription: AlertSubscription) {
        info!("dispatcher started");
        loop {
            tokio::select! {
                biased;
                () = self.cancel.cancelled() => break,
                event = subscription.next() => match event {
                    Some(FeedEvent::Alert(alert)) => self.process_alert(alert),
                    Some(FeedEvent::Lagged(missed)) => {
                        warn!(missed, "dispatcher lagged behind alert feed, resynchronising");
                        self.resync();
                    }
                    None => {
                        debug!("alert feed closed");
                        break;
                    }
                },
            }
        }
        info!("dispatcher stopped consuming alerts");
    }

    /// Stops the dispatcher and waits until every group task has exited.
    ///
    /// Flushes in flight are abandoned. No flush starts once this returns.
    /// Safe to call more than once and on a dispatcher that never started.
    pub async fn stop(&self) {
        let _serialised = self.stopping.lock().await;
        self.cancel.cancel();

        let run_task = self.run_task.lock().take();
        if let Some(handle) = run_task {
            if let Err(e) = handle.await {
                if e.is_panic() {
                    error!("dispatcher task panicked");
                }
            }
        }

        let tasks: Vec<_> = self.groups.lock().drain().map(|(_, h)| h.task).collect();
        let count = tasks.len();
        for task in tasks {
            if let Err(e) = task.await {
                if e.is_panic() {
                    error!("aggregation group task panicked");
                }
            }
        }
        if count > 0 {
            info!(groups = count, "dispatcher stopped");
        }
    }

    /// Keys of the live aggregation groups.
    #[must_use]
    pub fn group_keys(&self) -> Vec<GroupKey> {
        self.groups.lock().keys().cloned().collect()
    }

    /// Number of live aggregation groups.
    #[must_use]
    pub fn group_count(&self) -> usize {
        self.groups.lock().len()
    }

    /// Current alerts of a group.
    #[must_use]
    pub fn group_alerts(&self, key: &GroupKey) -> Option<Vec<Alert>> {
        self.groups.lock().get(key).map(|h| h.group.alerts())
    }

    fn process_alert(&self, alert: Alert) {
        for route in self.route.match_labels(&alert.labels) {
            let key = route.opts().group_key(route.id(), &alert.labels);

            let mut groups = self.groups.lock();
            if let Some(handle) = groups.get(&key) {
                handle.group.insert(alert.clone());
                continue;
            }
            if alert.is_resolved() {
                continue;
            }

            let group = Arc::new(AggrGroup::new(key.clone(), route.opts().clone(), Instant::now()));
            group.insert(alert.clone());
            debug!(group = %key, receiver = %route.receiver(), "created aggregation group");

            let task = tokio::spawn(run_group(
                Arc::clone(&group),
                Arc::clone(&self.notifier),
                Arc::clone(&self.groups),
                self.cancel.clone(),
            ));
            groups.insert(key, GroupHandle { group, task });
        }
    }

    /// Re-reads the alert store after missing feed updates.
    fn resync(&self) {
        let active = match self.alerts.active() {
            Ok(active) => active,
            Err(e) => {
                warn!(error = %e, "failed to resynchronise dispatcher");
                return;
            }
        };

        let seen: HashSet<Fingerprint> = active.iter().map(Alert::fingerprint).collect();
        let grouped: Vec<Fingerprint> = self
            .groups
            .lock()
            .values()
            .flat_map(|h| h.group.fingerprints())
            .filter(|fp| !seen.contains(fp))
            .collect();

        for alert in active {
            self.process_alert(alert);
        }
        for fp in grouped {
            match self.alerts.get(fp) {
                Ok(alert) => self.process_alert(alert),
                Err(e) => debug!(fingerprint = %fp, error = %e, "grouped alert not in store"),
            }
        }
    }
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("groups", &self.group_count())
            .field("stopped", &self.cancel.is_cancelled())
            .finish_non_exhaustive()
    }
}

async fn run_group(
    group: Arc<AggrGroup>,
    notifier: Arc<dyn Notifier>,
    groups: GroupTable,
    cancel: CancellationToken,
) {
    loop {
        let deadline = group.deadline();
        tokio::select! {
            biased;
            () = cancel.cancelled() => return,
            () = group.wake.notified() => continue,
            () = sleep_until(deadline) => {}
        }

        let batch = match group.on_deadline(Instant::now()) {
            Wakeup::Flush(batch) => batch,
            Wakeup::Idle => continue,
            Wakeup::Evict => {
                if evict(&group, &groups) {
                    return;
                }
                continue;
            }
        };

        let ctx = NotifyContext::new(&group.opts.receiver, &group.key, group.opts.repeat_interval);
        debug!(group = %group.key, alerts = batch.len(), "flushing aggregation group");

        let flush = AssertUnwindSafe(notifier.notify(&ctx, &batch)).catch_unwind();
        let outcome = tokio::select! {
            biased;
            () = cancel.cancelled() => {
                debug!(group = %group.key, "abandoning in-flight flush");
                return;
            }
            outcome = flush => outcome,
        };

        match outcome {
            Ok(Ok(_)) => group.on_delivered(&batch),
            Ok(Err(e)) => {
                warn!(group = %group.key, receiver = %ctx.receiver, error = %e, "notification failed");
                group.on_failed();
            }
            Err(_) => {
                error!(group = %group.key, receiver = %ctx.receiver, "notification pipeline panicked");
                group.on_failed();
            }
        }
    }
}

/// Removes an idle group from the table. Holding the table lock while
/// checking keeps a concurrent insert from landing in an evicted group.
fn evict(group: &Arc<AggrGroup>, groups: &GroupTable) -> bool {
    let mut table = groups.lock();
    let state = group.state.lock();
    if !state.alerts.is_empty() {
        return false;
    }
    drop(state);
    table.remove(&group.key);
    debug!(group = %group.key, "evicted idle aggregation group");
    true
}
