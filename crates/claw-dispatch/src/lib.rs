//! # claw-dispatch
//!
//! Alert grouping, inhibition and notification dispatch for Clawbernetes.
//!
//! This crate turns a stream of alerts into batched notifications:
//!
//! - **Routing**: a tree of label matchers decides which receiver handles an alert
//! - **Grouping**: alerts sharing a route and the route's `group_by` labels are
//!   batched into one aggregation group with its own flush timers
//! - **Inhibition**: firing source alerts suppress matching target alerts
//! - **Silencing**: time-bounded matcher sets mute alerts
//! - **Notification pipeline**: mute, route, deduplicate, retry and fan out to
//!   every integration of a receiver
//! - **Reload**: a [`Coordinator`] swaps in a new configuration without
//!   running two dispatchers side by side
//!
//! ## Quick Start
//!
//! ```rust
//! use claw_dispatch::{Alert, LabelSet, Matcher, Route};
//! use std::time::Duration;
//!
//! let route = Route::builder()
//!     .receiver("default")
//!     .group_by(["alertname"])
//!     .group_wait(Duration::from_secs(30))
//!     .route(
//!         Route::builder()
//!             .receiver("database")
//!             .matcher(Matcher::equal("team", "db").unwrap()),
//!     )
//!     .build()
//!     .unwrap();
//!
//! let alert = Alert::new(
//!     LabelSet::new()
//!         .with("alertname", "HighLatency")
//!         .with("team", "db"),
//! );
//!
//! let matched = route.match_labels(&alert.labels);
//! assert_eq!(matched.len(), 1);
//! assert_eq!(matched[0].receiver(), "database");
//! ```
//!
//! ## Running a Dispatcher
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use claw_dispatch::{Config, Coordinator, MemAlerts, MemNotificationLog, MemSilences, Stores};
//!
//! # async fn run() -> claw_dispatch::Result<()> {
//! let stores = Stores {
//!     alerts: Arc::new(MemAlerts::new()),
//!     silences: Arc::new(MemSilences::new()),
//!     notification_log: Arc::new(MemNotificationLog::new()),
//! };
//! let coordinator = Coordinator::new(stores);
//! coordinator.apply(&Config::load_file("dispatch.json")?).await?;
//! // ...
//! coordinator.shutdown().await;
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]

pub mod config;
pub mod coordinator;
pub mod dispatch;
pub mod error;
pub mod inhibit;
pub mod integration;
pub mod matcher;
pub mod notify;
pub mod route;
pub mod silence;
pub mod store;
pub mod types;

// Re-export main types at crate root
pub use config::Config;
pub use coordinator::{Coordinator, Stores};
pub use dispatch::Dispatcher;
pub use error::{ConfigError, DispatchError, NotifyError, Result, StoreError};
pub use inhibit::{InhibitRule, Inhibitor};
pub use integration::{
    Integration, LogConfig, LogIntegration, Receiver, WebhookConfig, WebhookIntegration,
    WebhookPayload,
};
pub use matcher::{Matcher, Matchers};
pub use notify::{build_pipeline, Muter, Notifier, NotifyContext, RetryConfig};
pub use route::{GroupKey, Route, RouteBuilder, RouteOpts};
pub use silence::{MemSilences, Silence, Silencer};
pub use store::{
    AlertProvider, MemAlerts, MemNotificationLog, NotificationLog, NotifyInfo, SilenceProvider,
};
pub use types::{Alert, AlertStatus, Fingerprint, LabelSet};
