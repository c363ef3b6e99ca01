//! Label matchers shared by routes, inhibit rules and silences.
//!
//! A label that is absent from a label set is matched as if its value were
//! the empty string, so `severity=""` selects alerts without a severity.

use std::fmt;

use regex::Regex;

use crate::error::ConfigError;
use crate::types::LabelSet;

/// How a matcher compares a label value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MatchKind {
    /// Value must equal the matcher value.
    Equal,
    /// Value must differ from the matcher value.
    NotEqual,
    /// Value must fully match the pattern.
    Regex,
    /// Value must not fully match the pattern.
    NotRegex,
}

impl MatchKind {
    /// Returns the operator symbol.
    #[must_use]
    pub const fn as_symbol(&self) -> &'static str {
        match self {
            Self::Equal => "=",
            Self::NotEqual => "!=",
            Self::Regex => "=~",
            Self::NotRegex => "!~",
        }
    }
}

/// A predicate over one label.
#[derive(Debug, Clone)]
pub struct Matcher {
    name: String,
    value: String,
    kind: MatchKind,
    regex: Option<Regex>,
}

impl Matcher {
    /// Creates a matcher of the given kind.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::InvalidMatcher` if the label name is empty or a
    /// regex pattern does not compile.
    pub fn new(
        name: impl Into<String>,
        kind: MatchKind,
        value: impl Into<String>,
    ) -> Result<Self, ConfigError> {
        let name = name.into();
        let value = value.into();
        if name.is_empty() {
            return Err(ConfigError::InvalidMatcher {
                label: name,
                reason: "label name cannot be empty".to_string(),
            });
        }

        let regex = match kind {
            MatchKind::Regex | MatchKind::NotRegex => Some(
                // Patterns are anchored on both ends.
                Regex::new(&format!("^(?:{value})$")).map_err(|e| ConfigError::InvalidMatcher {
                    label: name.clone(),
                    reason: e.to_string(),
                })?,
            ),
            MatchKind::Equal | MatchKind::NotEqual => None,
        };

        Ok(Self {
            name,
            value,
            kind,
            regex,
        })
    }

    /// Creates an equality matcher. Infallible for non-empty names.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::InvalidMatcher` if the label name is empty.
    pub fn equal(name: impl Into<String>, value: impl Into<String>) -> Result<Self, ConfigError> {
        Self::new(name, MatchKind::Equal, value)
    }

    /// Creates a regex matcher.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::InvalidMatcher` if the pattern does not compile.
    pub fn regex(name: impl Into<String>, pattern: impl Into<String>) -> Result<Self, ConfigError> {
        Self::new(name, MatchKind::Regex, pattern)
    }

    /// The label this matcher inspects.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The value or pattern this matcher compares against.
    #[must_use]
    pub fn value(&self) -> &str {
        &self.value
    }

    /// The comparison kind.
    #[must_use]
    pub const fn kind(&self) -> MatchKind {
        self.kind
    }

    /// Evaluates the matcher against a label set.
    #[must_use]
    pub fn matches(&self, labels: &LabelSet) -> bool {
        let actual = labels.get(&self.name).unwrap_or_default();
        match (self.kind, &self.regex) {
            (MatchKind::Equal, _) => actual == self.value,
            (MatchKind::NotEqual, _) => actual != self.value,
            (MatchKind::Regex, Some(re)) => re.is_match(actual),
            (MatchKind::NotRegex, Some(re)) => !re.is_match(actual),
            (MatchKind::Regex | MatchKind::NotRegex, None) => false,
        }
    }
}

impl PartialEq for Matcher {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name && self.value == other.value && self.kind == other.kind
    }
}

impl Eq for Matcher {}

impl fmt::Display for Matcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}\"{}\"", self.name, self.kind.as_symbol(), self.value)
    }
}

/// A conjunction of matchers. An empty set matches everything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Matchers(Vec<Matcher>);

impl Matchers {
    /// Creates a matcher set.
    #[must_use]
    pub fn new(matchers: Vec<Matcher>) -> Self {
        Self(matchers)
    }

    /// Returns true if every matcher matches.
    #[must_use]
    pub fn matches(&self, labels: &LabelSet) -> bool {
        self.0.iter().all(|m| m.matches(labels))
    }

    /// Iterates over the matchers.
    pub fn iter(&self) -> impl Iterator<Item = &Matcher> {
        self.0.iter()
    }

    /// Returns true if the set is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl FromIterator<Matcher> for Matchers {
    fn from_iter<I: IntoIterator<Item = Matcher>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl fmt::Display for Matchers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("{")?;
        for (i, m) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{m}")?;
        }
        f.write_str("}")
    }
}
