//! Property-Based Tests for Canonical Keys and Mappings
//!
//! For any generated fields, `generate` followed by `parse` SHALL give back
//! the same key, and a mapping built from legacy keys SHALL only target
//! keys the codec accepts.

use fundcache_core::KeyCodec;
use fundcache_migration::{ConflictDetector, MigrationMapping};
use fundcache_test_utils::{
    arb_canonical_key, arb_identifier, arb_key_type, arb_legacy_key, arb_module, arb_version,
};
use proptest::prelude::*;

proptest! {
    #![proptest_config(ProptestConfig::with_cases(100))]

    #[test]
    fn prop_generate_then_parse_round_trips(
        module in arb_module(),
        key_type in arb_key_type(),
        identifier in arb_identifier(),
        version in arb_version(),
    ) {
        let codec = KeyCodec::default();
        let key = codec.generate(&module, &key_type, &identifier, Some(&version)).unwrap();
        let parsed = codec.parse(&key.to_string()).unwrap();

        prop_assert_eq!(&parsed, &key);
        prop_assert_eq!(parsed.module(), module.as_str());
        prop_assert_eq!(parsed.key_type(), key_type.as_str());
        prop_assert_eq!(parsed.identifier(), identifier.as_str());
        prop_assert_eq!(parsed.version(), version.as_str());
    }

    #[test]
    fn prop_canonical_keys_have_no_format_conflicts(
        keys in prop::collection::vec(arb_canonical_key(), 1..20)
    ) {
        let conflicts = ConflictDetector::default().detect(&keys);
        prop_assert!(conflicts
            .iter()
            .all(|c| !c.description.starts_with("Invalid key format")));
    }

    #[test]
    fn prop_generated_mapping_targets_validate(
        legacy in prop::collection::vec(arb_legacy_key(), 1..30)
    ) {
        let codec = KeyCodec::default();
        let (mapping, errors) = MigrationMapping::generate(legacy.iter(), |old| {
            codec
                .generate_v1("fund", "legacy", old)
                .map(|key| key.to_string())
        });

        prop_assert!(errors.is_empty());
        prop_assert!(mapping.len() <= legacy.len());
        for (_, new_key) in mapping.iter() {
            prop_assert!(codec.validate(new_key));
        }
    }
}
