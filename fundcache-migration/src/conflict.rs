//! Conflict detection over key sets and migration mappings.
//!
//! Detection runs three independent passes and concatenates their output:
//!
//! 1. **Format**: every key that fails the codec is a `format/high` conflict.
//! 2. **Semantic**: canonical keys sharing `module:type:identifier` with more
//!    than one distinct version are a `version/medium` conflict.
//! 3. **Naming**: exact duplicates are `duplicate/high`; distinct keys whose
//!    normalized Levenshtein similarity reaches the threshold are
//!    `similarity/low`.
//!
//! Passes never short-circuit and results are not de-duplicated across passes.

use std::collections::HashMap;

use fundcache_core::{CacheKey, Conflict, ConflictConfig, ConflictType, KeyCodec, Severity};

use crate::mapping::MigrationMapping;

/// Finds format, version, duplicate and similarity conflicts.
#[derive(Debug, Clone)]
pub struct ConflictDetector {
    codec: KeyCodec,
    config: ConflictConfig,
}

impl Default for ConflictDetector {
    fn default() -> Self {
        Self::new(ConflictConfig::default())
    }
}

impl ConflictDetector {
    pub fn new(config: ConflictConfig) -> Self {
        Self {
            codec: KeyCodec::new(config.codec.clone()),
            config,
        }
    }

    pub fn config(&self) -> &ConflictConfig {
        &self.config
    }

    pub fn codec(&self) -> &KeyCodec {
        &self.codec
    }

    /// Run all passes over `keys`.
    pub fn detect<K: AsRef<str>>(&self, keys: &[K]) -> Vec<Conflict> {
        let keys: Vec<&str> = keys.iter().map(AsRef::as_ref).collect();

        let mut conflicts = self.format_pass(&keys);
        conflicts.extend(self.semantic_pass(&keys));
        conflicts.extend(self.naming_pass(&keys));
        conflicts
    }

    /// Run all passes over the targets of `mapping`, then flag every target
    /// claimed by more than one source as `duplicate/critical`.
    pub fn detect_mapping(&self, mapping: &MigrationMapping) -> Vec<Conflict> {
        let targets = mapping.new_keys();
        let mut conflicts = self.detect(&targets);

        let mut sources: Vec<(&str, Vec<&str>)> = Vec::new();
        for (old_key, new_key) in mapping.iter() {
            match sources.iter_mut().find(|(target, _)| *target == new_key) {
                Some((_, olds)) => olds.push(old_key),
                None => sources.push((new_key, vec![old_key])),
            }
        }

        for (target, olds) in sources.into_iter().filter(|(_, olds)| olds.len() > 1) {
            let mut keys: Vec<String> = olds.iter().map(|k| k.to_string()).collect();
            keys.push(target.to_string());
            conflicts.push(
                Conflict::new(
                    ConflictType::Duplicate,
                    Severity::Critical,
                    keys,
                    format!("{} source keys map to '{}'", olds.len(), target),
                )
                .with_suggestions([
                    "map each source to a distinct target",
                    "merge the sources before migrating",
                ]),
            );
        }

        conflicts
    }

    fn format_pass(&self, keys: &[&str]) -> Vec<Conflict> {
        keys.iter()
            .filter_map(|key| {
                self.codec.explain(key).map(|reason| {
                    Conflict::new(
                        ConflictType::Format,
                        Severity::High,
                        vec![key.to_string()],
                        format!("Invalid key format: {}", reason),
                    )
                    .with_suggestions(["rename to module:type:identifier:version"])
                })
            })
            .collect()
    }

    fn semantic_pass(&self, keys: &[&str]) -> Vec<Conflict> {
        // Groups in first-seen order, each holding distinct keys in input order.
        let mut groups: Vec<(String, Vec<CacheKey>)> = Vec::new();
        for key in keys {
            let Ok(parsed) = self.codec.parse(key) else {
                continue;
            };
            let base = parsed.base();
            match groups.iter_mut().find(|(b, _)| *b == base) {
                Some((_, members)) => {
                    if !members.contains(&parsed) {
                        members.push(parsed);
                    }
                }
                None => groups.push((base, vec![parsed])),
            }
        }

        groups
            .into_iter()
            .filter(|(_, members)| members.len() > 1)
            .map(|(base, members)| {
                let versions: Vec<&str> = members.iter().map(|k| k.version()).collect();
                let latest = members
                    .iter()
                    .max_by(|a, b| a.cmp_version(b))
                    .map(|k| k.version())
                    .unwrap_or_default();
                let description = format!(
                    "'{}' exists in {} versions: {} (latest {})",
                    base,
                    members.len(),
                    versions.join(", "),
                    latest
                );
                Conflict::new(
                    ConflictType::Version,
                    Severity::Medium,
                    members.iter().map(ToString::to_string).collect(),
                    description,
                )
                .with_suggestions(self.config.version_resolution.ordered_suggestions())
            })
            .collect()
    }

    fn naming_pass(&self, keys: &[&str]) -> Vec<Conflict> {
        let mut conflicts = Vec::new();

        let mut counts: HashMap<&str, usize> = HashMap::new();
        let mut distinct: Vec<&str> = Vec::new();
        for key in keys {
            let count = counts.entry(key).or_insert(0);
            if *count == 0 {
                distinct.push(key);
            }
            *count += 1;
        }

        for key in &distinct {
            let count = counts.get(key).copied().unwrap_or(0);
            if count > 1 {
                conflicts.push(
                    Conflict::new(
                        ConflictType::Duplicate,
                        Severity::High,
                        vec![key.to_string(); count],
                        format!("'{}' appears {} times", key, count),
                    )
                    .with_suggestions(["remove the repeated entries"]),
                );
            }
        }

        for (i, a) in distinct.iter().enumerate() {
            for b in &distinct[i + 1..] {
                let similarity = strsim::normalized_levenshtein(a, b);
                if similarity >= self.config.similarity_threshold {
                    conflicts.push(
                        Conflict::new(
                            ConflictType::Similarity,
                            Severity::Low,
                            vec![a.to_string(), b.to_string()],
                            format!(
                                "keys are {:.0}% similar, possible typo",
                                similarity * 100.0
                            ),
                        )
                        .with_suggestions(["confirm both keys are intended"]),
                    );
                }
            }
        }

        conflicts
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fundcache_core::VersionResolution;
    use proptest::prelude::*;

    fn of_type(conflicts: &[Conflict], conflict_type: ConflictType) -> Vec<&Conflict> {
        conflicts
            .iter()
            .filter(|c| c.conflict_type == conflict_type)
            .collect()
    }

    #[test]
    fn test_clean_keys_have_no_conflicts() {
        let detector = ConflictDetector::default();
        let keys = [
            "fund:detail:000001:v1",
            "user:favorites:default:v1",
            "market:index:hs300:v2",
        ];
        assert!(detector.detect(&keys).is_empty());
    }

    #[test]
    fn test_empty_input() {
        let detector = ConflictDetector::default();
        assert!(detector.detect::<&str>(&[]).is_empty());
    }

    #[test]
    fn test_format_conflicts_explain_reason() {
        let detector = ConflictDetector::default();
        let conflicts = detector.detect(&["fund_favorites", "Fund:Detail:1:v1"]);

        let format = of_type(&conflicts, ConflictType::Format);
        assert_eq!(format.len(), 2);
        assert!(format.iter().all(|c| c.severity == Severity::High));
        assert!(format[0].description.contains("expected 4 components"));
    }

    #[test]
    fn test_version_conflict_references_both_keys() {
        let detector = ConflictDetector::default();
        let conflicts = detector.detect(&["fund:detail:000001:v1", "fund:detail:000001:v2"]);

        let version = of_type(&conflicts, ConflictType::Version);
        assert_eq!(version.len(), 1);
        assert_eq!(version[0].severity, Severity::Medium);
        assert_eq!(
            version[0].keys,
            vec!["fund:detail:000001:v1", "fund:detail:000001:v2"]
        );
        assert_eq!(
            version[0].suggestions,
            vec!["keep latest", "merge", "namespace by timestamp"]
        );
    }

    #[test]
    fn test_version_conflict_names_latest_numerically() {
        let detector = ConflictDetector::default();
        let conflicts = detector.detect(&[
            "fund:detail:1:v10",
            "fund:detail:1:v99999999999999999999999",
            "fund:detail:1:v9",
        ]);

        let version = of_type(&conflicts, ConflictType::Version);
        assert_eq!(version.len(), 1);
        assert!(version[0]
            .description
            .ends_with("(latest v99999999999999999999999)"));
    }

    #[test]
    fn test_version_resolution_orders_suggestions() {
        let detector = ConflictDetector::new(
            ConflictConfig::default().with_version_resolution(VersionResolution::Merge),
        );
        let conflicts = detector.detect(&["fund:detail:1:v1", "fund:detail:1:v3"]);
        let version = of_type(&conflicts, ConflictType::Version);
        assert_eq!(version[0].suggestions[0], "merge");
    }

    #[test]
    fn test_duplicates_reported_once_per_key() {
        let detector = ConflictDetector::default();
        let key = "fund:detail:000001:v1";
        let conflicts = detector.detect(&[key, key, key]);

        let duplicates = of_type(&conflicts, ConflictType::Duplicate);
        assert_eq!(duplicates.len(), 1);
        assert_eq!(duplicates[0].keys.len(), 3);
        assert_eq!(duplicates[0].severity, Severity::High);
        // Duplicates of one key never form a version group.
        assert!(of_type(&conflicts, ConflictType::Version).is_empty());
    }

    #[test]
    fn test_similarity_flags_near_typos() {
        let detector = ConflictDetector::default();
        let conflicts = detector.detect(&["portfolio:holdings:alpha:v1", "portfolio:holdings:alpah:v1"]);

        let similar = of_type(&conflicts, ConflictType::Similarity);
        assert_eq!(similar.len(), 1);
        assert_eq!(similar[0].severity, Severity::Low);
    }

    #[test]
    fn test_similarity_threshold_is_configurable() {
        let strict = ConflictDetector::new(ConflictConfig::default().with_similarity_threshold(1.0));
        let conflicts = strict.detect(&["portfolio:holdings:alpha:v1", "portfolio:holdings:alpah:v1"]);
        assert!(of_type(&conflicts, ConflictType::Similarity).is_empty());
    }

    #[test]
    fn test_passes_do_not_short_circuit() {
        let detector = ConflictDetector::default();
        let conflicts = detector.detect(&[
            "bad key",
            "fund:detail:9:v1",
            "fund:detail:9:v2",
            "fund:detail:9:v2",
        ]);

        assert_eq!(of_type(&conflicts, ConflictType::Format).len(), 1);
        assert_eq!(of_type(&conflicts, ConflictType::Version).len(), 1);
        assert_eq!(of_type(&conflicts, ConflictType::Duplicate).len(), 1);
        assert_eq!(of_type(&conflicts, ConflictType::Similarity).len(), 1);
    }

    #[test]
    fn test_detect_mapping_flags_many_to_one() {
        let detector = ConflictDetector::default();
        let mapping = MigrationMapping::from_pairs([
            ("fav_a", "user:favorites:default:v1"),
            ("fav_b", "user:favorites:default:v1"),
            ("nav", "fund:nav:000001:v1"),
        ]);

        let conflicts = detector.detect_mapping(&mapping);
        let critical: Vec<_> = conflicts
            .iter()
            .filter(|c| c.severity == Severity::Critical)
            .collect();
        assert_eq!(critical.len(), 1);
        assert_eq!(
            critical[0].keys,
            vec!["fav_a", "fav_b", "user:favorites:default:v1"]
        );
        assert!(conflicts.iter().any(|c| c.conflict_type == ConflictType::Duplicate
            && c.severity == Severity::High));
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]

        #[test]
        fn prop_every_invalid_key_yields_one_format_conflict(
            keys in proptest::collection::vec("[A-Z]{1,6}", 0..8),
        ) {
            let detector = ConflictDetector::default();
            let conflicts = detector.detect(&keys);
            prop_assert_eq!(of_type(&conflicts, ConflictType::Format).len(), keys.len());
        }
    }
}
