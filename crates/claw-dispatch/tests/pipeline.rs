//! End-to-end tests: alert store, dispatcher, inhibitor, silencer and the
//! full notification pipeline wired together.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use parking_lot::Mutex;

use claw_dispatch::{
    build_pipeline, Alert, AlertProvider, Config, Coordinator, Dispatcher, InhibitRule, Inhibitor,
    Integration, LabelSet, Matcher, Matchers, MemAlerts, MemNotificationLog, MemSilences,
    NotificationLog, NotifyContext, NotifyError, Receiver, RetryConfig, Route, Silence, Silencer,
    Stores,
};

/// Integration that records what it was asked to send.
#[derive(Debug, Default)]
struct Sink {
    sends: Mutex<Vec<(String, Vec<Alert>)>>,
    script: Mutex<Vec<Result<(), NotifyError>>>,
}

impl Sink {
    fn failing_with(errors: Vec<NotifyError>) -> Arc<Self> {
        let sink = Self::default();
        *sink.script.lock() = errors.into_iter().map(Err).rev().collect();
        Arc::new(sink)
    }

    fn sends(&self) -> Vec<(String, Vec<Alert>)> {
        self.sends.lock().clone()
    }

    fn count(&self) -> usize {
        self.sends.lock().len()
    }
}

#[async_trait]
impl Integration for Sink {
    fn name(&self) -> &str {
        "sink"
    }

    async fn send(&self, ctx: &NotifyContext, alerts: &[Alert]) -> Result<(), NotifyError> {
        self.sends.lock().push((ctx.receiver.clone(), alerts.to_vec()));
        self.script.lock().pop().unwrap_or(Ok(()))
    }
}

fn secs(s: u64) -> Duration {
    Duration::from_secs(s)
}

async fn advance(d: Duration) {
    tokio::time::sleep(d).await;
}

fn alert(pairs: &[(&str, &str)]) -> Alert {
    Alert::new(pairs.iter().copied().collect::<LabelSet>())
}

fn instances(batch: &[Alert]) -> Vec<String> {
    let mut names: Vec<String> = batch
        .iter()
        .map(|a| a.labels.get("instance").unwrap_or_default().to_string())
        .collect();
    names.sort();
    names
}

fn fast_retry() -> RetryConfig {
    RetryConfig {
        initial_delay: Duration::from_millis(100),
        max_delay: secs(1),
        backoff_multiplier: 2.0,
        max_attempts: 3,
        max_elapsed: secs(10),
    }
}

fn default_route(group_by: &[&str]) -> Route {
    Route::builder()
        .receiver("team")
        .group_by(group_by.iter().copied())
        .group_wait(secs(30))
        .group_interval(secs(300))
        .repeat_interval(secs(3600))
        .build()
        .unwrap()
}

struct Harness {
    alerts: Arc<MemAlerts>,
    silences: Arc<MemSilences>,
    log: Arc<MemNotificationLog>,
    inhibitor: Arc<Inhibitor>,
    dispatcher: Arc<Dispatcher>,
}

impl Harness {
    fn start(route: Route, rules: Vec<InhibitRule>, receivers: Vec<Receiver>) -> Self {
        let alerts = Arc::new(MemAlerts::new());
        let silences = Arc::new(MemSilences::new());
        let log = Arc::new(MemNotificationLog::new());
        Self::start_with(alerts, silences, log, route, rules, receivers)
    }

    fn start_with(
        alerts: Arc<MemAlerts>,
        silences: Arc<MemSilences>,
        log: Arc<MemNotificationLog>,
        route: Route,
        rules: Vec<InhibitRule>,
        receivers: Vec<Receiver>,
    ) -> Self {
        let inhibitor = Arc::new(Inhibitor::new(rules));
        inhibitor.start(alerts.clone()).unwrap();

        let notifier = build_pipeline(
            receivers,
            Arc::clone(&inhibitor),
            Silencer::new(silences.clone()),
            log.clone() as Arc<dyn NotificationLog>,
            &fast_retry(),
        );
        let dispatcher = Arc::new(Dispatcher::new(Arc::new(route), alerts.clone(), notifier));
        dispatcher.start().unwrap();

        Self {
            alerts,
            silences,
            log,
            inhibitor,
            dispatcher,
        }
    }

    fn put(&self, alerts: Vec<Alert>) {
        self.alerts.put(alerts).unwrap();
    }

    async fn stop(&self) {
        self.dispatcher.stop().await;
        self.inhibitor.stop().await;
    }
}

fn receiver(name: &str, sink: &Arc<Sink>) -> Receiver {
    Receiver::new(name).with_integration(sink.clone())
}

mod grouping_tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn alerts_are_batched_per_group() {
        let sink = Arc::new(Sink::default());
        let h = Harness::start(default_route(&["job"]), vec![], vec![receiver("team", &sink)]);

        h.put(vec![
            alert(&[("job", "api"), ("instance", "a")]),
            alert(&[("job", "api"), ("instance", "b")]),
            alert(&[("job", "db"), ("instance", "c")]),
        ]);

        advance(secs(29)).await;
        assert_eq!(sink.count(), 0);

        advance(secs(2)).await;
        let mut batches: Vec<Vec<String>> = sink.sends().iter().map(|(_, b)| instances(b)).collect();
        batches.sort();
        assert_eq!(batches, vec![vec!["a".to_string(), "b".to_string()], vec!["c".to_string()]]);
        h.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn continue_routes_notify_every_receiver() {
        let sink = Arc::new(Sink::default());
        let route = Route::builder()
            .receiver("team")
            .group_wait(secs(30))
            .route(
                Route::builder()
                    .receiver("pager")
                    .matcher(Matcher::equal("severity", "critical").unwrap())
                    .continue_matching(true),
            )
            .route(
                Route::builder()
                    .receiver("chat")
                    .matcher(Matcher::regex("severity", "critical|warning").unwrap()),
            )
            .build()
            .unwrap();
        let h = Harness::start(
            route,
            vec![],
            vec![
                receiver("team", &sink),
                receiver("pager", &sink),
                receiver("chat", &sink),
            ],
        );

        h.put(vec![alert(&[("severity", "critical"), ("instance", "a")])]);
        advance(secs(31)).await;

        let mut receivers: Vec<String> = sink.sends().into_iter().map(|(r, _)| r).collect();
        receivers.sort();
        assert_eq!(receivers, vec!["chat".to_string(), "pager".to_string()]);
        h.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn resolution_is_notified_then_group_is_evicted() {
        let sink = Arc::new(Sink::default());
        let h = Harness::start(default_route(&["job"]), vec![], vec![receiver("team", &sink)]);

        let firing = alert(&[("job", "api"), ("instance", "a")]);
        h.put(vec![firing.clone()]);
        advance(secs(31)).await;
        assert_eq!(sink.count(), 1);

        h.put(vec![firing.resolved_at(Utc::now() - ChronoDuration::seconds(1))]);
        advance(secs(300)).await;

        let sends = sink.sends();
        assert_eq!(sends.len(), 2);
        assert!(sends[1].1[0].is_resolved());

        advance(secs(301)).await;
        assert_eq!(h.dispatcher.group_count(), 0);
        h.stop().await;
    }
}

mod muting_tests {
    use super::*;

    fn severity_rule() -> InhibitRule {
        InhibitRule::new(
            Matchers::new(vec![Matcher::equal("severity", "critical").unwrap()]),
            Matchers::new(vec![Matcher::equal("severity", "warning").unwrap()]),
            vec!["cluster".to_string()],
        )
    }

    #[tokio::test(start_paused = true)]
    async fn inhibited_alerts_are_dropped_from_the_batch() {
        let sink = Arc::new(Sink::default());
        let h = Harness::start(
            default_route(&["cluster"]),
            vec![severity_rule()],
            vec![receiver("team", &sink)],
        );

        h.put(vec![
            alert(&[("cluster", "a"), ("severity", "critical"), ("instance", "crit-a")]),
            alert(&[("cluster", "a"), ("severity", "warning"), ("instance", "warn-a")]),
            alert(&[("cluster", "b"), ("severity", "warning"), ("instance", "warn-b")]),
        ]);
        advance(secs(31)).await;

        let mut batches: Vec<Vec<String>> = sink.sends().iter().map(|(_, b)| instances(b)).collect();
        batches.sort();
        assert_eq!(
            batches,
            vec![vec!["crit-a".to_string()], vec!["warn-b".to_string()]]
        );
        h.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn silenced_group_is_not_delivered_until_silence_expires() {
        let sink = Arc::new(Sink::default());
        let h = Harness::start(default_route(&["job"]), vec![], vec![receiver("team", &sink)]);

        let now = Utc::now();
        let silence = Silence::new(
            Matchers::new(vec![Matcher::equal("instance", "a").unwrap()]),
            now - ChronoDuration::minutes(1),
            now + ChronoDuration::hours(1),
            "ops",
            "maintenance",
        )
        .unwrap();
        let silence_id = h.silences.create(silence).unwrap();

        h.put(vec![alert(&[("job", "api"), ("instance", "a")])]);
        advance(secs(31)).await;
        assert_eq!(sink.count(), 0);

        h.silences.expire(&silence_id, Utc::now()).unwrap();
        h.put(vec![alert(&[("job", "api"), ("instance", "b")])]);
        advance(secs(300)).await;

        let sends = sink.sends();
        assert_eq!(sends.len(), 1);
        assert_eq!(instances(&sends[0].1), vec!["a".to_string(), "b".to_string()]);
        h.stop().await;
    }
}

mod delivery_tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn transient_failures_are_retried_within_one_flush() {
        let sink = Sink::failing_with(vec![
            NotifyError::retryable("sink", "503"),
            NotifyError::retryable("sink", "503"),
        ]);
        let h = Harness::start(default_route(&["job"]), vec![], vec![receiver("team", &sink)]);

        h.put(vec![alert(&[("job", "api"), ("instance", "a")])]);
        advance(secs(31)).await;
        assert_eq!(sink.count(), 3);

        advance(secs(600)).await;
        assert_eq!(sink.count(), 3);
        h.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn permanent_failure_is_retried_at_the_next_interval() {
        let sink = Sink::failing_with(vec![NotifyError::permanent("sink", "400")]);
        let h = Harness::start(default_route(&["job"]), vec![], vec![receiver("team", &sink)]);

        h.put(vec![alert(&[("job", "api"), ("instance", "a")])]);
        advance(secs(31)).await;
        assert_eq!(sink.count(), 1);

        advance(secs(300)).await;
        assert_eq!(sink.count(), 2);
        h.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn restarted_dispatcher_does_not_resend_delivered_content() {
        let sink = Arc::new(Sink::default());
        let first = Harness::start(default_route(&["job"]), vec![], vec![receiver("team", &sink)]);
        first.put(vec![alert(&[("job", "api"), ("instance", "a")])]);
        advance(secs(31)).await;
        assert_eq!(sink.count(), 1);
        first.stop().await;

        let second = Harness::start_with(
            Arc::clone(&first.alerts),
            Arc::clone(&first.silences),
            Arc::clone(&first.log),
            default_route(&["job"]),
            vec![],
            vec![receiver("team", &sink)],
        );
        advance(secs(31)).await;

        assert_eq!(second.dispatcher.group_count(), 1);
        assert_eq!(sink.count(), 1);
        second.stop().await;
    }
}

mod reload_tests {
    use super::*;

    fn config(receiver: &str) -> Config {
        Config::from_json(&format!(
            r#"{{
                "route": {{"receiver": "{receiver}", "group_by": ["job"], "group_wait_secs": 30}},
                "receivers": [{{"name": "a"}}, {{"name": "b"}}]
            }}"#
        ))
        .unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn reload_before_group_wait_hands_groups_to_the_new_configuration() {
        let alerts = Arc::new(MemAlerts::new());
        let sink_a = Arc::new(Sink::default());
        let sink_b = Arc::new(Sink::default());
        let coordinator = Coordinator::new(Stores {
            alerts: alerts.clone(),
            silences: Arc::new(MemSilences::new()),
            notification_log: Arc::new(MemNotificationLog::new()),
        })
        .with_integration("a", sink_a.clone())
        .with_integration("b", sink_b.clone());

        coordinator.apply(&config("a")).await.unwrap();
        alerts.put(vec![alert(&[("job", "api"), ("instance", "x")])]).unwrap();
        advance(secs(10)).await;

        coordinator.apply(&config("b")).await.unwrap();
        advance(secs(31)).await;

        assert_eq!(sink_a.count(), 0);
        let sends = sink_b.sends();
        assert_eq!(sends.len(), 1);
        assert_eq!(sends[0].0, "b");
        assert_eq!(instances(&sends[0].1), vec!["x".to_string()]);

        advance(secs(600)).await;
        assert_eq!(sink_a.count(), 0);
        assert_eq!(sink_b.count(), 1);
        coordinator.shutdown().await;
    }
}
