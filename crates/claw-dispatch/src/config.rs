//! Dispatcher configuration.
//!
//! The configuration is a JSON document describing:
//! - the routing tree (`route`)
//! - inhibition rules (`inhibit_rules`)
//! - receivers and their integrations (`receivers`)
//! - the retry policy (`retry`) and global settings (`global`)
//!
//! Loading always validates. A document that fails validation is never
//! partially applied.

use std::collections::{BTreeMap, HashSet};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::inhibit::InhibitRule;
use crate::integration::{Integration, LogConfig, LogIntegration, Receiver, WebhookConfig, WebhookIntegration};
use crate::matcher::{Matcher, Matchers};
use crate::notify::RetryConfig;
use crate::route::{Route, RouteBuilder};

/// Settings shared by all receivers.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GlobalConfig {
    /// URL of this dispatcher, advertised in webhook payloads.
    #[serde(default)]
    pub external_url: String,
}

/// A node of the routing tree as written in the document.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RouteConfig {
    /// Receiver for alerts ending here. Inherited when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub receiver: Option<String>,
    /// Labels that must equal the given values.
    #[serde(default, rename = "match", skip_serializing_if = "BTreeMap::is_empty")]
    pub match_eq: BTreeMap<String, String>,
    /// Labels that must fully match the given patterns.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub match_re: BTreeMap<String, String>,
    /// Grouping labels. Inherited when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group_by: Option<Vec<String>>,
    /// Initial group wait in seconds. Inherited when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group_wait_secs: Option<u64>,
    /// Group interval in seconds. Inherited when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group_interval_secs: Option<u64>,
    /// Repeat interval in seconds. Inherited when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repeat_interval_secs: Option<u64>,
    /// Keep evaluating siblings after this route matches.
    #[serde(default, rename = "continue")]
    pub continue_matching: bool,
    /// Child routes, evaluated in order.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub routes: Vec<RouteConfig>,
}

impl RouteConfig {
    fn builder(&self) -> Result<RouteBuilder, ConfigError> {
        let mut builder = Route::builder().continue_matching(self.continue_matching);
        if let Some(receiver) = &self.receiver {
            builder = builder.receiver(receiver.clone());
        }
        for matcher in matchers(&self.match_eq, &self.match_re)? {
            builder = builder.matcher(matcher);
        }
        if let Some(group_by) = &self.group_by {
            builder = builder.group_by(group_by.iter().cloned());
        }
        if let Some(secs) = self.group_wait_secs {
            builder = builder.group_wait(Duration::from_secs(secs));
        }
        if let Some(secs) = self.group_interval_secs {
            builder = builder.group_interval(Duration::from_secs(secs));
        }
        if let Some(secs) = self.repeat_interval_secs {
            builder = builder.repeat_interval(Duration::from_secs(secs));
        }
        for child in &self.routes {
            builder = builder.route(child.builder()?);
        }
        Ok(builder)
    }
}

/// An inhibition rule as written in the document.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct InhibitRuleConfig {
    /// Equality matchers for the inhibiting alert.
    #[serde(default)]
    pub source_match: BTreeMap<String, String>,
    /// Regex matchers for the inhibiting alert.
    #[serde(default)]
    pub source_match_re: BTreeMap<String, String>,
    /// Equality matchers for the inhibited alert.
    #[serde(default)]
    pub target_match: BTreeMap<String, String>,
    /// Regex matchers for the inhibited alert.
    #[serde(default)]
    pub target_match_re: BTreeMap<String, String>,
    /// Labels whose values must agree.
    #[serde(default)]
    pub equal: Vec<String>,
}

impl InhibitRuleConfig {
    fn build(&self) -> Result<InhibitRule, ConfigError> {
        Ok(InhibitRule::new(
            Matchers::new(matchers(&self.source_match, &self.source_match_re)?),
            Matchers::new(matchers(&self.target_match, &self.target_match_re)?),
            self.equal.clone(),
        ))
    }
}

/// A receiver as written in the document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ReceiverConfig {
    /// Unique receiver name.
    pub name: String,
    /// Webhook integrations.
    #[serde(default)]
    pub webhook_configs: Vec<WebhookConfig>,
    /// Log integrations.
    #[serde(default)]
    pub log_configs: Vec<LogConfig>,
}

impl ReceiverConfig {
    /// Creates a receiver with no integrations.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            webhook_configs: Vec::new(),
            log_configs: Vec::new(),
        }
    }

    fn build(&self, global: &GlobalConfig) -> Result<Receiver, ConfigError> {
        let mut integrations: Vec<Arc<dyn Integration>> = Vec::new();
        for (i, webhook) in self.webhook_configs.iter().enumerate() {
            let integration = WebhookIntegration::new(format!("webhook/{i}"), webhook.clone())?
                .with_external_url(global.external_url.clone());
            integrations.push(Arc::new(integration));
        }
        for (i, log) in self.log_configs.iter().enumerate() {
            integrations.push(Arc::new(LogIntegration::new(format!("log/{i}"), log)));
        }
        Ok(Receiver {
            name: self.name.clone(),
            integrations,
        })
    }
}

/// Retry policy as written in the document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RetrySettings {
    /// Delay after the first failure in milliseconds.
    pub initial_delay_ms: u64,
    /// Upper bound for a single delay in seconds.
    pub max_delay_secs: u64,
    /// Growth factor between delays.
    pub backoff_multiplier: f64,
    /// Maximum attempts per flush, including the first.
    pub max_attempts: u32,
    /// Total time budget per flush in seconds.
    pub max_elapsed_secs: u64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        let defaults = RetryConfig::default();
        Self {
            initial_delay_ms: u64::try_from(defaults.initial_delay.as_millis()).unwrap_or(u64::MAX),
            max_delay_secs: defaults.max_delay.as_secs(),
            backoff_multiplier: defaults.backoff_multiplier,
            max_attempts: defaults.max_attempts,
            max_elapsed_secs: defaults.max_elapsed.as_secs(),
        }
    }
}

impl RetrySettings {
    /// Converts to the pipeline's retry policy.
    #[must_use]
    pub const fn to_retry_config(&self) -> RetryConfig {
        RetryConfig {
            initial_delay: Duration::from_millis(self.initial_delay_ms),
            max_delay: Duration::from_secs(self.max_delay_secs),
            backoff_multiplier: self.backoff_multiplier,
            max_attempts: self.max_attempts,
            max_elapsed: Duration::from_secs(self.max_elapsed_secs),
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.max_attempts == 0 {
            return Err(ConfigError::Invalid {
                reason: "retry.max_attempts must be at least 1".to_string(),
            });
        }
        if self.backoff_multiplier.is_nan() || self.backoff_multiplier < 1.0 {
            return Err(ConfigError::Invalid {
                reason: "retry.backoff_multiplier must be at least 1".to_string(),
            });
        }
        Ok(())
    }
}

/// The complete configuration document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Global settings.
    #[serde(default)]
    pub global: GlobalConfig,
    /// The routing tree.
    pub route: RouteConfig,
    /// Inhibition rules, in precedence order.
    #[serde(default)]
    pub inhibit_rules: Vec<InhibitRuleConfig>,
    /// Receivers.
    #[serde(default)]
    pub receivers: Vec<ReceiverConfig>,
    /// Retry policy for deliveries.
    #[serde(default)]
    pub retry: RetrySettings,
}

impl Config {
    /// Loads and validates configuration from a JSON file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, parsed or validated.
    pub fn load_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path.as_ref())?;
        Self::from_json(&content)
    }

    /// Parses and validates configuration from a JSON string.
    ///
    /// # Errors
    ///
    /// Returns an error if the JSON is invalid or validation fails.
    pub fn from_json(content: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validates the configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if receivers are duplicated or missing, a matcher
    /// does not compile, the tree is malformed or an integration is invalid.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut names = HashSet::new();
        for receiver in &self.receivers {
            if receiver.name.is_empty() {
                return Err(ConfigError::Invalid {
                    reason: "receiver name cannot be empty".to_string(),
                });
            }
            if !names.insert(receiver.name.as_str()) {
                return Err(ConfigError::DuplicateReceiver {
                    name: receiver.name.clone(),
                });
            }
            for webhook in &receiver.webhook_configs {
                webhook.validate()?;
            }
        }

        let route = self.build_route()?;
        let mut missing = None;
        route.walk(&mut |r| {
            if missing.is_none() && !names.contains(r.receiver()) {
                missing = Some(r.receiver().to_string());
            }
        });
        if let Some(name) = missing {
            return Err(ConfigError::UnknownReceiver { name });
        }

        self.build_inhibit_rules()?;
        self.retry.validate()
    }

    /// Builds the routing tree.
    ///
    /// # Errors
    ///
    /// Returns an error if a matcher does not compile or the tree is invalid.
    pub fn build_route(&self) -> Result<Route, ConfigError> {
        self.route.builder()?.build()
    }

    /// Builds the inhibition rules, in document order.
    ///
    /// # Errors
    ///
    /// Returns an error if a matcher does not compile.
    pub fn build_inhibit_rules(&self) -> Result<Vec<InhibitRule>, ConfigError> {
        self.inhibit_rules.iter().map(InhibitRuleConfig::build).collect()
    }

    /// Builds every receiver with its integrations.
    ///
    /// # Errors
    ///
    /// Returns an error if an integration cannot be created.
    pub fn build_receivers(&self) -> Result<Vec<Receiver>, ConfigError> {
        self.receivers.iter().map(|r| r.build(&self.global)).collect()
    }
}

fn matchers(
    equal: &BTreeMap<String, String>,
    regex: &BTreeMap<String, String>,
) -> Result<Vec<Matcher>, ConfigError> {
    let equal = equal.iter().map(|(k, v)| Matcher::equal(k.clone(), v.clone()));
    let regex = regex.iter().map(|(k, v)| Matcher::regex(k.clone(), v.clone()));
    equal.chain(regex).collect()
}
