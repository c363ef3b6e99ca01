//! Silences and the silencer muting source.
//!
//! Silences can be created, expired and deleted at any time, so the
//! [`Silencer`] asks the store on every call instead of caching decisions.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::StoreError;
use crate::matcher::Matchers;
use crate::notify::Muter;
use crate::store::SilenceProvider;
use crate::types::LabelSet;

/// A silence that suppresses alerts matching certain criteria.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Silence {
    /// Unique identifier for this silence.
    pub id: String,
    /// Label matchers (alerts matching all of them are silenced).
    pub matchers: Matchers,
    /// When the silence starts.
    pub starts_at: DateTime<Utc>,
    /// When the silence ends.
    pub ends_at: DateTime<Utc>,
    /// Who created the silence.
    pub created_by: String,
    /// Comment explaining the silence.
    pub comment: String,
}

impl Silence {
    /// Creates a new silence.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::Rejected` if `ends_at` is not after `starts_at`
    /// or the silence has no matchers.
    pub fn new(
        matchers: Matchers,
        starts_at: DateTime<Utc>,
        ends_at: DateTime<Utc>,
        created_by: impl Into<String>,
        comment: impl Into<String>,
    ) -> Result<Self, StoreError> {
        if ends_at <= starts_at {
            return Err(StoreError::Rejected {
                reason: "silence end time must be after start time".to_string(),
            });
        }
        if matchers.is_empty() {
            return Err(StoreError::Rejected {
                reason: "silence must have at least one matcher".to_string(),
            });
        }

        Ok(Self {
            id: Uuid::new_v4().to_string(),
            matchers,
            starts_at,
            ends_at,
            created_by: created_by.into(),
            comment: comment.into(),
        })
    }

    /// Checks if the silence is in effect at `now`.
    #[must_use]
    pub fn is_active_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.starts_at && now < self.ends_at
    }

    /// Checks if the silence mutes `labels` at `now`.
    #[must_use]
    pub fn mutes(&self, labels: &LabelSet, now: DateTime<Utc>) -> bool {
        self.is_active_at(now) && self.matchers.matches(labels)
    }
}

/// Thread-safe in-memory silence store.
#[derive(Debug, Default)]
pub struct MemSilences {
    silences: RwLock<HashMap<String, Silence>>,
}

impl MemSilences {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a silence, returning its id.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::Rejected` if a silence with the same id exists.
    pub fn create(&self, silence: Silence) -> Result<String, StoreError> {
        let mut silences = self.silences.write();
        if silences.contains_key(&silence.id) {
            return Err(StoreError::Rejected {
                reason: format!("silence with ID '{}' already exists", silence.id),
            });
        }

        info!(
            silence_id = %silence.id,
            matchers = %silence.matchers,
            ends_at = %silence.ends_at,
            "added silence"
        );
        let id = silence.id.clone();
        silences.insert(id.clone(), silence);
        Ok(id)
    }

    /// Ends a silence at `now`. A silence that has not started yet is
    /// collapsed so it never takes effect.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::NotFound` if the silence doesn't exist.
    pub fn expire(&self, silence_id: &str, now: DateTime<Utc>) -> Result<(), StoreError> {
        let mut silences = self.silences.write();
        let silence = silences
            .get_mut(silence_id)
            .ok_or_else(|| StoreError::NotFound {
                id: silence_id.to_string(),
            })?;

        if silence.starts_at > now {
            silence.starts_at = now;
        }
        if silence.ends_at > now {
            silence.ends_at = now;
        }
        info!(silence_id = %silence_id, "expired silence");
        Ok(())
    }

    /// Removes a silence.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::NotFound` if the silence doesn't exist.
    pub fn delete(&self, silence_id: &str) -> Result<(), StoreError> {
        if self.silences.write().remove(silence_id).is_none() {
            return Err(StoreError::NotFound {
                id: silence_id.to_string(),
            });
        }
        info!(silence_id = %silence_id, "removed silence");
        Ok(())
    }

    /// Gets a silence by id.
    #[must_use]
    pub fn get(&self, silence_id: &str) -> Option<Silence> {
        self.silences.read().get(silence_id).cloned()
    }

    /// Returns all silences.
    #[must_use]
    pub fn list(&self) -> Vec<Silence> {
        self.silences.read().values().cloned().collect()
    }

    /// Returns the silences in effect at `now`.
    #[must_use]
    pub fn active(&self, now: DateTime<Utc>) -> Vec<Silence> {
        self.silences
            .read()
            .values()
            .filter(|s| s.is_active_at(now))
            .cloned()
            .collect()
    }
}

impl SilenceProvider for MemSilences {
    fn mutes(&self, labels: &LabelSet, now: DateTime<Utc>) -> Result<bool, StoreError> {
        Ok(self.silences.read().values().any(|s| s.mutes(labels, now)))
    }
}

/// Muting source backed by a silence store.
///
/// If the store cannot be queried the silencer fails open: the alert is
/// treated as not silenced and a warning is logged.
#[derive(Clone)]
pub struct Silencer {
    silences: Arc<dyn SilenceProvider>,
}

impl Silencer {
    /// Creates a silencer over a silence store.
    #[must_use]
    pub fn new(silences: Arc<dyn SilenceProvider>) -> Self {
        Self { silences }
    }
}

impl std::fmt::Debug for Silencer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Silencer").finish_non_exhaustive()
    }
}

impl Muter for Silencer {
    fn mutes(&self, labels: &LabelSet, now: DateTime<Utc>) -> bool {
        match self.silences.mutes(labels, now) {
            Ok(muted) => muted,
            Err(e) => {
                warn!(error = %e, labels = %labels, "silence store unavailable, not muting");
                false
            }
        }
    }
}
