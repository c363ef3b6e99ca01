//! The routing tree.
//!
//! A [`Route`] is built once per configuration generation with
//! [`RouteBuilder`] and never changes afterwards. Children inherit the
//! grouping labels and timing parameters they do not set themselves.

use std::fmt;
use std::time::Duration;

use crate::error::ConfigError;
use crate::matcher::{Matcher, Matchers};
use crate::types::{Fingerprint, FingerprintBuilder, LabelSet};

/// Default delay before the first notification of a new group.
pub const DEFAULT_GROUP_WAIT: Duration = Duration::from_secs(30);
/// Default delay between notifications about changes to a group.
pub const DEFAULT_GROUP_INTERVAL: Duration = Duration::from_secs(5 * 60);
/// Default delay before re-sending an unchanged notification.
pub const DEFAULT_REPEAT_INTERVAL: Duration = Duration::from_secs(4 * 60 * 60);

/// Position of a route in its tree, e.g. `0.2.1`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RouteId(String);

impl RouteId {
    /// The id of the root route.
    #[must_use]
    pub fn root() -> Self {
        Self("0".to_string())
    }

    fn child(&self, index: usize) -> Self {
        Self(format!("{}.{index}", self.0))
    }

    /// Returns the id as a string.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RouteId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Notification policy attached to a route.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteOpts {
    /// Receiver notified for alerts matching the route.
    pub receiver: String,
    /// Labels whose values split alerts into groups, sorted.
    pub group_by: Vec<String>,
    /// Delay before the first notification of a new group.
    pub group_wait: Duration,
    /// Minimum delay between notifications about a changing group.
    pub group_interval: Duration,
    /// Delay before an unchanged group is notified again.
    pub repeat_interval: Duration,
}

impl RouteOpts {
    /// Computes the aggregation key for an alert routed here.
    #[must_use]
    pub fn group_key(&self, route: &RouteId, labels: &LabelSet) -> GroupKey {
        GroupKey {
            route: route.clone(),
            values: self
                .group_by
                .iter()
                .map(|name| (name.clone(), labels.get(name).map(str::to_string)))
                .collect(),
        }
    }
}

/// Identity of an aggregation group: the route plus the alert's values for
/// the route's grouping labels.
///
/// A missing label is recorded as `None`, which is distinct from every real
/// value including the empty string.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct GroupKey {
    route: RouteId,
    values: Vec<(String, Option<String>)>,
}

impl GroupKey {
    /// The route this group belongs to.
    #[must_use]
    pub const fn route(&self) -> &RouteId {
        &self.route
    }

    /// Stable hash of the key, used by the notification log.
    #[must_use]
    pub fn fingerprint(&self) -> Fingerprint {
        let mut builder = FingerprintBuilder::new(b'G');
        builder.str(self.route.as_str());
        for (name, value) in &self.values {
            builder.str(name);
            match value {
                Some(v) => builder.tag(1).str(v),
                None => builder.tag(0),
            };
        }
        builder.finish()
    }

    /// The grouping labels that are present, as a label set.
    #[must_use]
    pub fn labels(&self) -> LabelSet {
        self.values
            .iter()
            .filter_map(|(k, v)| v.as_ref().map(|v| (k.clone(), v.clone())))
            .collect()
    }
}

impl fmt::Display for GroupKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{{", self.route)?;
        for (i, (name, value)) in self.values.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            match value {
                Some(v) => write!(f, "{name}=\"{v}\"")?,
                None => write!(f, "{name}=<absent>")?,
            }
        }
        f.write_str("}")
    }
}

/// A node in the routing tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route {
    id: RouteId,
    matchers: Matchers,
    continue_matching: bool,
    opts: RouteOpts,
    routes: Vec<Route>,
}

impl Route {
    /// Creates a builder for a route.
    pub fn builder() -> RouteBuilder {
        RouteBuilder::default()
    }

    /// The route's position in the tree.
    #[must_use]
    pub const fn id(&self) -> &RouteId {
        &self.id
    }

    /// The route's notification policy.
    #[must_use]
    pub const fn opts(&self) -> &RouteOpts {
        &self.opts
    }

    /// The receiver for this route.
    #[must_use]
    pub fn receiver(&self) -> &str {
        &self.opts.receiver
    }

    /// The route's matchers.
    #[must_use]
    pub const fn matchers(&self) -> &Matchers {
        &self.matchers
    }

    /// Whether sibling routes are still evaluated after this one matches.
    #[must_use]
    pub const fn continue_matching(&self) -> bool {
        self.continue_matching
    }

    /// Child routes in evaluation order.
    #[must_use]
    pub fn routes(&self) -> &[Route] {
        &self.routes
    }

    /// Returns the routes an alert with `labels` is delivered through.
    ///
    /// Evaluation is depth first. A matching node hands the alert to its
    /// children in order; a matching child without `continue` ends the
    /// evaluation of its siblings. A matching node none of whose children
    /// match is itself a result. An alert not matching this node yields an
    /// empty list.
    #[must_use]
    pub fn match_labels(&self, labels: &LabelSet) -> Vec<&Self> {
        let mut matches = Vec::new();
        self.collect_matches(labels, &mut matches);
        matches
    }

    fn collect_matches<'a>(&'a self, labels: &LabelSet, out: &mut Vec<&'a Self>) -> bool {
        if !self.matchers.matches(labels) {
            return false;
        }

        let before = out.len();
        for child in &self.routes {
            if child.collect_matches(labels, out) && !child.continue_matching {
                break;
            }
        }

        if out.len() == before {
            out.push(self);
        }
        true
    }

    /// Visits every route in the tree, parents before children.
    pub fn walk<'a>(&'a self, visit: &mut impl FnMut(&'a Self)) {
        visit(self);
        for child in &self.routes {
            child.walk(visit);
        }
    }
}

/// Builder for [`Route`] trees.
#[derive(Debug, Default, Clone)]
pub struct RouteBuilder {
    receiver: Option<String>,
    matchers: Vec<Matcher>,
    continue_matching: bool,
    group_by: Option<Vec<String>>,
    group_wait: Option<Duration>,
    group_interval: Option<Duration>,
    repeat_interval: Option<Duration>,
    routes: Vec<RouteBuilder>,
}

impl RouteBuilder {
    /// Sets the receiver. Children without one inherit their parent's.
    #[must_use]
    pub fn receiver(mut self, receiver: impl Into<String>) -> Self {
        self.receiver = Some(receiver.into());
        self
    }

    /// Adds a matcher.
    #[must_use]
    pub fn matcher(mut self, matcher: Matcher) -> Self {
        self.matchers.push(matcher);
        self
    }

    /// Sets whether siblings are evaluated after a match.
    #[must_use]
    pub const fn continue_matching(mut self, value: bool) -> Self {
        self.continue_matching = value;
        self
    }

    /// Sets the grouping labels.
    #[must_use]
    pub fn group_by<I, S>(mut self, labels: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.group_by = Some(labels.into_iter().map(Into::into).collect());
        self
    }

    /// Sets the initial group wait.
    #[must_use]
    pub const fn group_wait(mut self, d: Duration) -> Self {
        self.group_wait = Some(d);
        self
    }

    /// Sets the group interval.
    #[must_use]
    pub const fn group_interval(mut self, d: Duration) -> Self {
        self.group_interval = Some(d);
        self
    }

    /// Sets the repeat interval.
    #[must_use]
    pub const fn repeat_interval(mut self, d: Duration) -> Self {
        self.repeat_interval = Some(d);
        self
    }

    /// Appends a child route.
    #[must_use]
    pub fn route(mut self, child: Self) -> Self {
        self.routes.push(child);
        self
    }

    /// Builds this builder as the root of a tree.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::Invalid` if the root has no receiver, has
    /// matchers, or if any route ends up with a zero group or repeat interval.
    pub fn build(self) -> Result<Route, ConfigError> {
        if !self.matchers.is_empty() {
            return Err(ConfigError::Invalid {
                reason: "root route must not have matchers".to_string(),
            });
        }
        let receiver = match &self.receiver {
            Some(r) if !r.is_empty() => r.clone(),
            _ => {
                return Err(ConfigError::Invalid {
                    reason: "root route must have a receiver".to_string(),
                })
            }
        };

        let defaults = RouteOpts {
            receiver,
            group_by: Vec::new(),
            group_wait: DEFAULT_GROUP_WAIT,
            group_interval: DEFAULT_GROUP_INTERVAL,
            repeat_interval: DEFAULT_REPEAT_INTERVAL,
        };
        self.finish(&defaults, RouteId::root())
    }

    fn finish(self, parent: &RouteOpts, id: RouteId) -> Result<Route, ConfigError> {
        let mut group_by = self.group_by.unwrap_or_else(|| parent.group_by.clone());
        group_by.sort();
        group_by.dedup();

        let opts = RouteOpts {
            receiver: self.receiver.unwrap_or_else(|| parent.receiver.clone()),
            group_by,
            group_wait: self.group_wait.unwrap_or(parent.group_wait),
            group_interval: self.group_interval.unwrap_or(parent.group_interval),
            repeat_interval: self.repeat_interval.unwrap_or(parent.repeat_interval),
        };

        if opts.group_interval.is_zero() || opts.repeat_interval.is_zero() {
            return Err(ConfigError::Invalid {
                reason: format!("route {id}: group_interval and repeat_interval must be non-zero"),
            });
        }

        let routes = self
            .routes
            .into_iter()
            .enumerate()
            .map(|(i, child)| child.finish(&opts, id.child(i)))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Route {
            id,
            matchers: Matchers::new(self.matchers),
            continue_matching: self.continue_matching,
            opts,
            routes,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn labels(pairs: &[(&str, &str)]) -> LabelSet {
        pairs.iter().copied().collect()
    }

    fn eq(name: &str, value: &str) -> Matcher {
        Matcher::equal(name, value).unwrap()
    }

    fn receivers(routes: &[&Route]) -> Vec<String> {
        routes.iter().map(|r| r.receiver().to_string()).collect()
    }

    fn tree() -> Route {
        Route::builder()
            .receiver("default")
            .group_by(["alertname"])
            .route(
                Route::builder()
                    .receiver("database")
                    .matcher(eq("team", "db"))
                    .group_by(["alertname", "cluster"])
                    .route(Route::builder().receiver("db-pager").matcher(eq("severity", "critical"))),
            )
            .route(
                Route::builder()
                    .receiver("frontend")
                    .matcher(eq("team", "frontend"))
                    .continue_matching(true),
            )
            .route(
                Route::builder()
                    .receiver("audit")
                    .matcher(Matcher::regex("team", "front.*").unwrap()),
            )
            .build()
            .unwrap()
    }

    mod builder_tests {
        use super::*;

        #[test]
        fn root_requires_receiver() {
            let err = Route::builder().build().unwrap_err();
            assert!(matches!(err, ConfigError::Invalid { .. }));
        }

        #[test]
        fn root_rejects_matchers() {
            let err = Route::builder()
                .receiver("r")
                .matcher(eq("a", "b"))
                .build()
                .unwrap_err();
            assert!(matches!(err, ConfigError::Invalid { .. }));
        }

        #[test]
        fn zero_repeat_interval_rejected() {
            let err = Route::builder()
                .receiver("r")
                .repeat_interval(Duration::ZERO)
                .build()
                .unwrap_err();
            assert!(matches!(err, ConfigError::Invalid { .. }));
        }

        #[test]
        fn defaults_applied_to_root() {
            let root = Route::builder().receiver("r").build().unwrap();
            assert_eq!(root.opts().group_wait, DEFAULT_GROUP_WAIT);
            assert_eq!(root.opts().group_interval, DEFAULT_GROUP_INTERVAL);
            assert_eq!(root.opts().repeat_interval, DEFAULT_REPEAT_INTERVAL);
            assert_eq!(root.id().as_str(), "0");
        }

        #[test]
        fn children_inherit_unset_fields() {
            let root = Route::builder()
                .receiver("r")
                .group_by(["job"])
                .group_wait(Duration::from_secs(10))
                .route(
                    Route::builder()
                        .matcher(eq("a", "b"))
                        .repeat_interval(Duration::from_secs(60)),
                )
                .build()
                .unwrap();

            let child = &root.routes()[0];
            assert_eq!(child.receiver(), "r");
            assert_eq!(child.opts().group_by, vec!["job".to_string()]);
            assert_eq!(child.opts().group_wait, Duration::from_secs(10));
            assert_eq!(child.opts().repeat_interval, Duration::from_secs(60));
            assert_eq!(child.id().as_str(), "0.0");
        }

        #[test]
        fn group_by_sorted_and_deduplicated() {
            let root = Route::builder()
                .receiver("r")
                .group_by(["zone", "alertname", "zone"])
                .build()
                .unwrap();
            assert_eq!(root.opts().group_by, vec!["alertname", "zone"]);
        }
    }

    mod matching_tests {
        use super::*;

        #[test]
        fn unmatched_alert_falls_back_to_root() {
            let root = tree();
            let matched = root.match_labels(&labels(&[("team", "ops")]));
            assert_eq!(receivers(&matched), vec!["default"]);
        }

        #[test]
        fn deepest_match_wins() {
            let root = tree();
            let matched = root.match_labels(&labels(&[("team", "db"), ("severity", "critical")]));
            assert_eq!(receivers(&matched), vec!["db-pager"]);
        }

        #[test]
        fn parent_used_when_no_child_matches() {
            let root = tree();
            let matched = root.match_labels(&labels(&[("team", "db"), ("severity", "warning")]));
            assert_eq!(receivers(&matched), vec!["database"]);
        }

        #[test]
        fn continue_fans_out_to_siblings() {
            let root = tree();
            let matched = root.match_labels(&labels(&[("team", "frontend")]));
            assert_eq!(receivers(&matched), vec!["frontend", "audit"]);
        }

        #[test]
        fn non_continue_match_stops_siblings() {
            let root = Route::builder()
                .receiver("default")
                .route(Route::builder().receiver("first").matcher(eq("a", "1")))
                .route(Route::builder().receiver("second").matcher(eq("a", "1")))
                .build()
                .unwrap();
            let matched = root.match_labels(&labels(&[("a", "1")]));
            assert_eq!(receivers(&matched), vec!["first"]);
        }

        #[test]
        fn walk_visits_every_route() {
            let root = tree();
            let mut seen = Vec::new();
            root.walk(&mut |r| seen.push(r.receiver().to_string()));
            assert_eq!(seen, vec!["default", "database", "db-pager", "frontend", "audit"]);
        }
    }

    mod group_key_tests {
        use super::*;

        #[test]
        fn absent_label_is_distinct_from_empty_value() {
            let route = Route::builder().receiver("r").group_by(["team"]).build().unwrap();
            let absent = route.opts().group_key(route.id(), &labels(&[("a", "1")]));
            let empty = route.opts().group_key(route.id(), &labels(&[("team", "")]));
            assert_ne!(absent, empty);
            assert_ne!(absent.fingerprint(), empty.fingerprint());
            assert_eq!(absent.to_string(), "0:{team=<absent>}");
            assert_eq!(empty.to_string(), r#"0:{team=""}"#);
        }

        #[test]
        fn fingerprint_is_pinned() {
            let route = Route::builder().receiver("r").group_by(["job"]).build().unwrap();
            let key = route.opts().group_key(route.id(), &labels(&[("job", "api"), ("x", "y")]));
            assert_eq!(key.fingerprint(), Fingerprint(0x44a0_b34f_5ff9_a5ea));
        }

        #[test]
        fn labels_only_contain_present_values() {
            let route = Route::builder()
                .receiver("r")
                .group_by(["job", "team"])
                .build()
                .unwrap();
            let key = route.opts().group_key(route.id(), &labels(&[("job", "api"), ("x", "y")]));
            assert_eq!(key.labels(), labels(&[("job", "api")]));
        }

        #[test]
        fn same_values_on_different_routes_differ() {
            let root = tree();
            let l = labels(&[("alertname", "Down")]);
            let a = root.opts().group_key(root.id(), &l);
            let child = &root.routes()[1];
            let b = child.opts().group_key(child.id(), &l);
            assert_ne!(a, b);
        }

        proptest! {
            #[test]
            fn key_depends_only_on_grouping_labels(
                job in "[a-z]{1,5}",
                noise_a in "[a-z]{1,5}",
                noise_b in "[a-z]{1,5}",
            ) {
                let route = Route::builder().receiver("r").group_by(["job"]).build().unwrap();
                let a = route.opts().group_key(route.id(), &LabelSet::new().with("job", job.clone()).with("instance", noise_a));
                let b = route.opts().group_key(route.id(), &LabelSet::new().with("job", job).with("instance", noise_b));
                prop_assert_eq!(a, b);
            }
        }
    }
}
