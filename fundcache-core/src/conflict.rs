//! Conflict report types.
//!
//! Conflicts are produced transiently by the detector and returned to the
//! caller; they are never stored as cache data.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Kind of problem found among a set of keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictType {
    /// Key does not follow the canonical grammar.
    Format,
    /// The same key appears more than once, or two sources target one key.
    Duplicate,
    /// Keys differ only by version.
    Version,
    /// Keys are suspiciously close to each other (possible typo).
    Similarity,
}

/// How serious a conflict is. Ordered from least to most severe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    /// High and critical conflicts block a checked migration.
    pub fn is_blocking(&self) -> bool {
        *self >= Severity::High
    }
}

impl fmt::Display for ConflictType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Format => write!(f, "format"),
            Self::Duplicate => write!(f, "duplicate"),
            Self::Version => write!(f, "version"),
            Self::Similarity => write!(f, "similarity"),
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Low => write!(f, "low"),
            Self::Medium => write!(f, "medium"),
            Self::High => write!(f, "high"),
            Self::Critical => write!(f, "critical"),
        }
    }
}

/// A single detected conflict.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Conflict {
    #[serde(rename = "type")]
    pub conflict_type: ConflictType,
    pub severity: Severity,
    pub keys: Vec<String>,
    pub description: String,
    pub suggestions: Vec<String>,
}

impl Conflict {
    pub fn new(
        conflict_type: ConflictType,
        severity: Severity,
        keys: Vec<String>,
        description: impl Into<String>,
    ) -> Self {
        Self {
            conflict_type,
            severity,
            keys,
            description: description.into(),
            suggestions: Vec::new(),
        }
    }

    pub fn with_suggestions<I, S>(mut self, suggestions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.suggestions = suggestions.into_iter().map(Into::into).collect();
        self
    }

    pub fn is_blocking(&self) -> bool {
        self.severity.is_blocking()
    }
}

impl fmt::Display for Conflict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}/{}] {} ({})",
            self.conflict_type,
            self.severity,
            self.description,
            self.keys.join(", ")
        )
    }
}
