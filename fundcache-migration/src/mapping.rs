//! Ordered old-key to new-key mappings.

use std::collections::HashSet;
use std::path::Path;

use fundcache_core::{CacheResult, KeyError, StorageError};
use serde::{Deserialize, Serialize};

/// An ordered list of `(old_key, new_key)` pairs.
///
/// Order is the caller's insertion order and decides batch composition.
/// A repeated old key keeps its first position and takes the latest target.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MigrationMapping {
    pairs: Vec<(String, String)>,
}

impl MigrationMapping {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from pairs, in order.
    pub fn from_pairs<I, A, B>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (A, B)>,
        A: Into<String>,
        B: Into<String>,
    {
        let mut mapping = Self::new();
        for (old_key, new_key) in pairs {
            mapping.insert(old_key, new_key);
        }
        mapping
    }

    /// Build by applying `generate` to every old key.
    ///
    /// Keys for which `generate` fails are returned separately instead of
    /// aborting the whole mapping.
    pub fn generate<I, S, F>(old_keys: I, mut generate: F) -> (Self, Vec<(String, KeyError)>)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
        F: FnMut(&str) -> Result<String, KeyError>,
    {
        let mut mapping = Self::new();
        let mut rejected = Vec::new();
        for old_key in old_keys {
            let old_key = old_key.into();
            match generate(&old_key) {
                Ok(new_key) => mapping.insert(old_key, new_key),
                Err(e) => rejected.push((old_key, e)),
            }
        }
        (mapping, rejected)
    }

    /// Parse a JSON object of `{"old": "new", ...}`. Document order is kept.
    pub fn from_json_str(json: &str) -> CacheResult<Self> {
        let object: serde_json::Map<String, serde_json::Value> = serde_json::from_str(json)?;
        let mut mapping = Self::new();
        for (old_key, value) in object {
            let new_key = value.as_str().ok_or_else(|| StorageError::Decoding {
                reason: format!("mapping target for '{}' is not a string", old_key),
            })?;
            mapping.insert(old_key, new_key);
        }
        Ok(mapping)
    }

    /// Read a JSON mapping file.
    pub fn from_json_file(path: impl AsRef<Path>) -> CacheResult<Self> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path).map_err(|e| StorageError::Read {
            key: path.display().to_string(),
            reason: e.to_string(),
        })?;
        Self::from_json_str(&json)
    }

    pub fn insert(&mut self, old_key: impl Into<String>, new_key: impl Into<String>) {
        let old_key = old_key.into();
        let new_key = new_key.into();
        match self.pairs.iter_mut().find(|(old, _)| *old == old_key) {
            Some(pair) => pair.1 = new_key,
            None => self.pairs.push((old_key, new_key)),
        }
    }

    /// Target for `old_key`, if mapped.
    pub fn get(&self, old_key: &str) -> Option<&str> {
        self.pairs
            .iter()
            .find(|(old, _)| old == old_key)
            .map(|(_, new)| new.as_str())
    }

    pub fn len(&self) -> usize {
        self.pairs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.pairs.iter().map(|(o, n)| (o.as_str(), n.as_str()))
    }

    pub fn old_keys(&self) -> Vec<String> {
        self.pairs.iter().map(|(o, _)| o.clone()).collect()
    }

    pub fn new_keys(&self) -> Vec<String> {
        self.pairs.iter().map(|(_, n)| n.clone()).collect()
    }

    /// Consecutive chunks of at most `size` pairs.
    pub fn batches(&self, size: usize) -> impl Iterator<Item = &[(String, String)]> {
        self.pairs.chunks(size.max(1))
    }

    /// The subset of this mapping whose old keys are in `keys`.
    pub fn retain_old_keys<'a>(&self, keys: impl IntoIterator<Item = &'a str>) -> Self {
        let wanted: HashSet<&str> = keys.into_iter().collect();
        Self {
            pairs: self
                .pairs
                .iter()
                .filter(|(old, _)| wanted.contains(old.as_str()))
                .cloned()
                .collect(),
        }
    }
}

impl<A: Into<String>, B: Into<String>> FromIterator<(A, B)> for MigrationMapping {
    fn from_iter<I: IntoIterator<Item = (A, B)>>(iter: I) -> Self {
        Self::from_pairs(iter)
    }
}
