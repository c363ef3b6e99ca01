//! Delivery integrations.
//!
//! This module provides the [`Integration`] trait and implementations for
//! delivering a notification batch to the outside world:
//! - [`WebhookIntegration`]: Alertmanager-compatible JSON over HTTP
//! - [`LogIntegration`]: writes alerts to the trace

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::{ConfigError, NotifyError};
use crate::notify::NotifyContext;
use crate::types::{Alert, AlertStatus, LabelSet};

/// A single delivery mechanism of a receiver.
#[async_trait]
pub trait Integration: Send + Sync + fmt::Debug {
    /// Returns the name of this integration, unique within its receiver.
    fn name(&self) -> &str;

    /// Delivers a batch.
    ///
    /// # Errors
    ///
    /// Returns `NotifyError::Retryable` for transient failures and
    /// `NotifyError::Permanent` for failures retrying will not fix.
    async fn send(&self, ctx: &NotifyContext, alerts: &[Alert]) -> Result<(), NotifyError>;
}

/// A named receiver together with its integrations.
#[derive(Debug, Clone)]
pub struct Receiver {
    /// Receiver name, referenced by routes.
    pub name: String,
    /// Integrations notified for every batch.
    pub integrations: Vec<Arc<dyn Integration>>,
}

impl Receiver {
    /// Creates a receiver with no integrations.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            integrations: Vec::new(),
        }
    }

    /// Adds an integration.
    #[must_use]
    pub fn with_integration(mut self, integration: Arc<dyn Integration>) -> Self {
        self.integrations.push(integration);
        self
    }
}

const fn default_max_alerts() -> usize {
    0
}

const fn default_timeout_secs() -> u64 {
    10
}

const fn default_send_resolved() -> bool {
    true
}

/// Configuration for a webhook integration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WebhookConfig {
    /// The URL to POST notifications to.
    pub url: String,
    /// HTTP headers to include with requests.
    #[serde(default)]
    pub headers: HashMap<String, String>,
    /// Maximum number of alerts per notification (0 means unlimited).
    #[serde(default = "default_max_alerts")]
    pub max_alerts: usize,
    /// Timeout in seconds for each request.
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// Whether resolved alerts are delivered.
    #[serde(default = "default_send_resolved")]
    pub send_resolved: bool,
}

impl WebhookConfig {
    /// Creates a configuration with default settings.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::Invalid` if the URL is empty.
    pub fn new(url: impl Into<String>) -> Result<Self, ConfigError> {
        let config = Self {
            url: url.into(),
            headers: HashMap::new(),
            max_alerts: default_max_alerts(),
            timeout_secs: default_timeout_secs(),
            send_resolved: default_send_resolved(),
        };
        config.validate()?;
        Ok(config)
    }

    /// Adds a header to the configuration.
    #[must_use]
    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }

    /// Sets the maximum alerts per notification.
    #[must_use]
    pub const fn with_max_alerts(mut self, max: usize) -> Self {
        self.max_alerts = max;
        self
    }

    /// Sets the request timeout.
    #[must_use]
    pub const fn with_timeout_secs(mut self, secs: u64) -> Self {
        self.timeout_secs = secs;
        self
    }

    /// Sets whether resolved alerts are delivered.
    #[must_use]
    pub const fn with_send_resolved(mut self, send_resolved: bool) -> Self {
        self.send_resolved = send_resolved;
        self
    }

    /// Checks the configuration.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::Invalid` if the URL is empty or not HTTP(S),
    /// or the timeout is zero.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.url.is_empty() {
            return Err(ConfigError::Invalid {
                reason: "webhook URL cannot be empty".to_string(),
            });
        }
        if !(self.url.starts_with("http://") || self.url.starts_with("https://")) {
            return Err(ConfigError::Invalid {
                reason: format!("webhook URL must be http or https: {}", self.url),
            });
        }
        if self.timeout_secs == 0 {
            return Err(ConfigError::Invalid {
                reason: "webhook timeout must be positive".to_string(),
            });
        }
        Ok(())
    }
}

/// Posts notifications as JSON to a configured URL.
///
/// The body follows the Alertmanager webhook format (version 4). Server
/// errors, throttling and transport failures are retryable; other client
/// errors are permanent.
#[derive(Debug, Clone)]
pub struct WebhookIntegration {
    name: String,
    config: WebhookConfig,
    external_url: String,
    client: reqwest::Client,
}

impl WebhookIntegration {
    /// Creates a webhook integration.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::Invalid` if the configuration is invalid or the
    /// HTTP client cannot be built.
    pub fn new(name: impl Into<String>, config: WebhookConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| ConfigError::Invalid {
                reason: format!("failed to build HTTP client: {e}"),
            })?;

        Ok(Self {
            name: name.into(),
            config,
            external_url: String::new(),
            client,
        })
    }

    /// Sets the external URL advertised in payloads.
    #[must_use]
    pub fn with_external_url(mut self, url: impl Into<String>) -> Self {
        self.external_url = url.into();
        self
    }

    /// Returns the webhook URL.
    #[must_use]
    pub fn url(&self) -> &str {
        &self.config.url
    }

    /// Builds the payload for a batch.
    #[must_use]
    pub fn payload(&self, ctx: &NotifyContext, alerts: &[Alert]) -> WebhookPayload {
        let mut payload = WebhookPayload::new(ctx, alerts, self.config.max_alerts);
        payload.external_url.clone_from(&self.external_url);
        payload
    }
}

#[async_trait]
impl Integration for WebhookIntegration {
    fn name(&self) -> &str {
        &self.name
    }

    async fn send(&self, ctx: &NotifyContext, alerts: &[Alert]) -> Result<(), NotifyError> {
        let alerts: Vec<Alert> = if self.config.send_resolved {
            alerts.to_vec()
        } else {
            alerts
                .iter()
                .filter(|a| !a.is_resolved_at(ctx.now))
                .cloned()
                .collect()
        };
        if alerts.is_empty() {
            debug!(integration = %self.name, "no alerts to deliver");
            return Ok(());
        }

        let payload = self.payload(ctx, &alerts);
        let mut request = self.client.post(&self.config.url).json(&payload);
        for (key, value) in &self.config.headers {
            request = request.header(key.as_str(), value.as_str());
        }

        let response = request.send().await.map_err(|e| {
            if e.is_builder() {
                NotifyError::permanent(&self.name, format!("invalid request: {e}"))
            } else {
                NotifyError::retryable(&self.name, format!("request failed: {e}"))
            }
        })?;

        let status = response.status();
        if status.is_success() {
            info!(
                integration = %self.name,
                url = %self.config.url,
                alerts = payload.alerts.len(),
                status = %payload.status,
                "webhook notification sent"
            );
            return Ok(());
        }

        let reason = format!("unexpected status {}", status.as_u16());
        if status.is_server_error() || status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            Err(NotifyError::retryable(&self.name, reason))
        } else {
            Err(NotifyError::permanent(&self.name, reason))
        }
    }
}

/// The payload format for webhook notifications.
///
/// This format is compatible with Alertmanager webhook receivers.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookPayload {
    /// The payload version.
    pub version: String,
    /// Group key identifying this alert group.
    pub group_key: String,
    /// Number of alerts dropped by `max_alerts`.
    pub truncated_alerts: usize,
    /// Firing if any alert is firing, resolved otherwise.
    pub status: AlertStatus,
    /// The receiver handling this notification.
    pub receiver: String,
    /// The labels the group was formed on.
    pub group_labels: LabelSet,
    /// Labels common to all alerts.
    pub common_labels: LabelSet,
    /// Annotations common to all alerts.
    pub common_annotations: HashMap<String, String>,
    /// External URL for more information.
    pub external_url: String,
    /// The alerts in this notification.
    pub alerts: Vec<WebhookAlert>,
}

impl WebhookPayload {
    /// Creates a payload for a batch, keeping at most `max_alerts` alerts
    /// (0 keeps all).
    #[must_use]
    pub fn new(ctx: &NotifyContext, alerts: &[Alert], max_alerts: usize) -> Self {
        let status = if alerts.iter().any(|a| !a.is_resolved_at(ctx.now)) {
            AlertStatus::Firing
        } else {
            AlertStatus::Resolved
        };
        let kept = if max_alerts == 0 {
            alerts.len()
        } else {
            alerts.len().min(max_alerts)
        };
        let (common_labels, common_annotations) = Self::extract_common(alerts);

        Self {
            version: "4".to_string(),
            group_key: ctx.group_key.clone(),
            truncated_alerts: alerts.len() - kept,
            status,
            receiver: ctx.receiver.clone(),
            group_labels: ctx.group_labels.clone(),
            common_labels,
            common_annotations,
            external_url: String::new(),
            alerts: alerts[..kept]
                .iter()
                .map(|a| WebhookAlert::new(a, ctx.now))
                .collect(),
        }
    }

    fn extract_common(alerts: &[Alert]) -> (LabelSet, HashMap<String, String>) {
        let Some(first) = alerts.first() else {
            return (LabelSet::new(), HashMap::new());
        };

        let common_labels = first
            .labels
            .iter()
            .filter(|(k, v)| alerts.iter().all(|a| a.labels.get(k) == Some(*v)))
            .collect();

        let common_annotations = first
            .annotations
            .iter()
            .filter(|(k, v)| alerts.iter().all(|a| a.annotations.get(*k) == Some(*v)))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();

        (common_labels, common_annotations)
    }
}

/// Alert format in webhook payloads.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookAlert {
    /// The status of this alert.
    pub status: AlertStatus,
    /// Labels attached to the alert.
    pub labels: LabelSet,
    /// Annotations for the alert.
    pub annotations: HashMap<String, String>,
    /// When the alert started firing.
    pub starts_at: DateTime<Utc>,
    /// When the alert ends, if known.
    pub ends_at: Option<DateTime<Utc>>,
    /// URL to the alert source.
    pub generator_url: String,
    /// Fingerprint of the alert's labels.
    pub fingerprint: String,
}

impl WebhookAlert {
    /// Creates a webhook alert as seen at `now`.
    #[must_use]
    pub fn new(alert: &Alert, now: DateTime<Utc>) -> Self {
        Self {
            status: alert.status_at(now),
            labels: alert.labels.clone(),
            annotations: alert.annotations.clone(),
            starts_at: alert.starts_at,
            ends_at: alert.ends_at,
            generator_url: alert.generator_url.clone(),
            fingerprint: alert.fingerprint().to_string(),
        }
    }
}

/// Configuration for a log integration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LogConfig {
    /// Whether resolved alerts are logged.
    #[serde(default = "default_send_resolved")]
    pub send_resolved: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            send_resolved: default_send_resolved(),
        }
    }
}

/// Writes each alert of a batch to the trace.
///
/// Firing alerts are logged at `warn`, resolved ones at `info`.
#[derive(Debug, Clone)]
pub struct LogIntegration {
    name: String,
    send_resolved: bool,
}

impl LogIntegration {
    /// Creates a log integration.
    #[must_use]
    pub fn new(name: impl Into<String>, config: &LogConfig) -> Self {
        Self {
            name: name.into(),
            send_resolved: config.send_resolved,
        }
    }
}

#[async_trait]
impl Integration for LogIntegration {
    fn name(&self) -> &str {
        &self.name
    }

    async fn send(&self, ctx: &NotifyContext, alerts: &[Alert]) -> Result<(), NotifyError> {
        for alert in alerts {
            match alert.status_at(ctx.now) {
                AlertStatus::Firing => warn!(
                    receiver = %ctx.receiver,
                    group = %ctx.group_key,
                    alert = %alert.name(),
                    labels = %alert.labels,
                    starts_at = %alert.starts_at,
                    "ALERT"
                ),
                AlertStatus::Resolved if self.send_resolved => info!(
                    receiver = %ctx.receiver,
                    group = %ctx.group_key,
                    alert = %alert.name(),
                    labels = %alert.labels,
                    "RESOLVED"
                ),
                AlertStatus::Resolved => {}
            }
        }
        Ok(())
    }
}
