//! Core types for the dispatch pipeline.
//!
//! This module provides the fundamental types used throughout the claw-dispatch crate:
//! - [`LabelSet`]: The identifying labels of an alert
//! - [`Fingerprint`]: A stable hash identifying a label set or group
//! - [`AlertStatus`]: Whether an alert is firing or resolved
//! - [`Alert`]: A single state of an alert as seen on the feed

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// The name under which alerting rules publish the alert name.
pub const ALERT_NAME_LABEL: &str = "alertname";

/// A stable 64-bit hash identifying a label set or an aggregation group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fingerprint(pub u64);

/// Builds a [`Fingerprint`] from a canonical byte encoding.
///
/// Strings are length-prefixed so adjacent fields cannot run into each
/// other. The value is the first eight bytes of the blake3 digest, read
/// little-endian, and is stable across builds and platforms.
pub(crate) struct FingerprintBuilder(blake3::Hasher);

impl FingerprintBuilder {
    /// Starts a fingerprint in the namespace `tag`.
    pub(crate) fn new(tag: u8) -> Self {
        let mut builder = Self(blake3::Hasher::new());
        builder.tag(tag);
        builder
    }

    pub(crate) fn tag(&mut self, tag: u8) -> &mut Self {
        self.0.update(&[tag]);
        self
    }

    pub(crate) fn str(&mut self, value: &str) -> &mut Self {
        self.u64(value.len() as u64);
        self.0.update(value.as_bytes());
        self
    }

    pub(crate) fn u64(&mut self, value: u64) -> &mut Self {
        self.0.update(&value.to_le_bytes());
        self
    }

    pub(crate) fn finish(&self) -> Fingerprint {
        let digest = self.0.finalize();
        let mut head = [0u8; 8];
        head.copy_from_slice(&digest.as_bytes()[..8]);
        Fingerprint(u64::from_le_bytes(head))
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

/// The identifying labels of an alert.
///
/// Keys are unique and kept sorted, so two label sets with the same content
/// always produce the same [`Fingerprint`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LabelSet(BTreeMap<String, String>);

impl LabelSet {
    /// Creates an empty label set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the value of a label.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&str> {
        self.0.get(name).map(String::as_str)
    }

    /// Sets a label, returning the previous value.
    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<String>) -> Option<String> {
        self.0.insert(name.into(), value.into())
    }

    /// Adds a label, builder style.
    #[must_use]
    pub fn with(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.insert(name, value);
        self
    }

    /// Iterates over labels in name order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Returns the number of labels.
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Returns true if there are no labels.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Computes the fingerprint of this label set.
    #[must_use]
    pub fn fingerprint(&self) -> Fingerprint {
        let mut builder = FingerprintBuilder::new(b'L');
        for (name, value) in &self.0 {
            builder.str(name).str(value);
        }
        builder.finish()
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for LabelSet {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self(iter.into_iter().map(|(k, v)| (k.into(), v.into())).collect())
    }
}

impl fmt::Display for LabelSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("{")?;
        for (i, (k, v)) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{k}=\"{v}\"")?;
        }
        f.write_str("}")
    }
}

/// Whether an alert is firing or resolved at a point in time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertStatus {
    /// The alert is actively firing.
    Firing,
    /// The alert has ended.
    Resolved,
}

impl AlertStatus {
    /// Returns the status as a string.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Firing => "firing",
            Self::Resolved => "resolved",
        }
    }
}

impl fmt::Display for AlertStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single state of an alert.
///
/// Alerts are never mutated in place by the dispatch core: a resolved alert
/// is a new value carrying the same labels and an `ends_at` in the past.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Alert {
    /// Identifying labels.
    pub labels: LabelSet,
    /// Display metadata, not used for matching.
    #[serde(default)]
    pub annotations: HashMap<String, String>,
    /// When the alert started firing.
    pub starts_at: DateTime<Utc>,
    /// When the alert ends. `None` means open-ended.
    #[serde(default)]
    pub ends_at: Option<DateTime<Utc>>,
    /// Link back to the rule that generated the alert.
    #[serde(default)]
    pub generator_url: String,
}

impl Alert {
    /// Creates a firing alert with the given labels, starting now.
    #[must_use]
    pub fn new(labels: LabelSet) -> Self {
        Self {
            labels,
            annotations: HashMap::new(),
            starts_at: Utc::now(),
            ends_at: None,
            generator_url: String::new(),
        }
    }

    /// Adds an annotation.
    #[must_use]
    pub fn with_annotation(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.annotations.insert(key.into(), value.into());
        self
    }

    /// Sets the start time.
    #[must_use]
    pub const fn with_starts_at(mut self, at: DateTime<Utc>) -> Self {
        self.starts_at = at;
        self
    }

    /// Sets the end time.
    #[must_use]
    pub const fn with_ends_at(mut self, at: DateTime<Utc>) -> Self {
        self.ends_at = Some(at);
        self
    }

    /// Sets the generator URL.
    #[must_use]
    pub fn with_generator_url(mut self, url: impl Into<String>) -> Self {
        self.generator_url = url.into();
        self
    }

    /// Returns the resolved state of this alert, ending at `at`.
    #[must_use]
    pub fn resolved_at(&self, at: DateTime<Utc>) -> Self {
        Self {
            ends_at: Some(at),
            ..self.clone()
        }
    }

    /// The alert's identity.
    #[must_use]
    pub fn fingerprint(&self) -> Fingerprint {
        self.labels.fingerprint()
    }

    /// The value of the `alertname` label, or an empty string.
    #[must_use]
    pub fn name(&self) -> &str {
        self.labels.get(ALERT_NAME_LABEL).unwrap_or_default()
    }

    /// Returns true if the alert has ended as of `now`.
    #[must_use]
    pub fn is_resolved_at(&self, now: DateTime<Utc>) -> bool {
        self.ends_at.is_some_and(|end| end <= now)
    }

    /// Returns true if the alert has ended as of the current wall-clock time.
    #[must_use]
    pub fn is_resolved(&self) -> bool {
        self.is_resolved_at(Utc::now())
    }

    /// The alert's status as of `now`.
    #[must_use]
    pub fn status_at(&self, now: DateTime<Utc>) -> AlertStatus {
        if self.is_resolved_at(now) {
            AlertStatus::Resolved
        } else {
            AlertStatus::Firing
        }
    }
}
