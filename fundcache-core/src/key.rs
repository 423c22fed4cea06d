//! Canonical cache key codec.
//!
//! Every canonical key has exactly four `:`-separated fields:
//!
//! ```text
//! module:type:identifier:version
//! fund:detail:000001:v1
//! ```
//!
//! - `module` and `type` are lowercase tokens (`[a-z][a-z0-9_]*`)
//! - `identifier` is `[a-z0-9_-]{1,100}`
//! - `version` is `v` followed by digits
//! - the whole key is at most 255 characters
//!
//! In strict mode `module` must also belong to [`KNOWN_MODULES`].

use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use once_cell::sync::Lazy;
use regex::Regex;

use crate::config::KeyCodecConfig;
use crate::error::KeyError;

/// Field separator of the canonical form.
pub const SEPARATOR: char = ':';

/// Maximum length of a canonical key.
pub const MAX_KEY_LENGTH: usize = 255;

/// Maximum length of the identifier field.
pub const MAX_IDENTIFIER_LENGTH: usize = 100;

/// Version assigned when none is supplied.
pub const DEFAULT_VERSION: &str = "v1";

/// Modules recognised in strict mode.
pub const KNOWN_MODULES: [&str; 5] = ["fund", "portfolio", "search", "user", "market"];

static TOKEN_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[a-z][a-z0-9_]*$").expect("Invalid token regex"));
static IDENTIFIER_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[a-z0-9_-]+$").expect("Invalid identifier regex"));
static VERSION_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^v[0-9]+$").expect("Invalid version regex"));
static DISALLOWED_RUN_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[^a-z0-9_-]+").expect("Invalid disallowed-run regex"));

/// A parsed canonical cache key.
///
/// Fields are private: a `CacheKey` only comes out of [`KeyCodec::generate`]
/// or [`KeyCodec::parse`], so holding one means the grammar already holds.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CacheKey {
    module: String,
    key_type: String,
    identifier: String,
    version: String,
}

impl CacheKey {
    pub fn module(&self) -> &str {
        &self.module
    }

    pub fn key_type(&self) -> &str {
        &self.key_type
    }

    pub fn identifier(&self) -> &str {
        &self.identifier
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    /// Numeric part of the version (`v12` -> 12), or `None` past `u64::MAX`.
    pub fn version_number(&self) -> Option<u64> {
        self.version[1..].parse().ok()
    }

    /// Order by numeric version without overflow: fewer significant digits
    /// is older, equal lengths compare digit by digit.
    pub fn cmp_version(&self, other: &CacheKey) -> Ordering {
        let ours = self.version[1..].trim_start_matches('0');
        let theirs = other.version[1..].trim_start_matches('0');
        ours.len().cmp(&theirs.len()).then_with(|| ours.cmp(theirs))
    }

    /// `module:type:identifier`, the grouping used for version conflicts.
    pub fn base(&self) -> String {
        format!(
            "{}{sep}{}{sep}{}",
            self.module,
            self.key_type,
            self.identifier,
            sep = SEPARATOR
        )
    }

    /// Same key with a different version. The version must already be canonical.
    pub fn with_version(&self, version: u64) -> Self {
        Self {
            version: format!("v{}", version),
            ..self.clone()
        }
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}{sep}{}{sep}{}{sep}{}",
            self.module,
            self.key_type,
            self.identifier,
            self.version,
            sep = SEPARATOR
        )
    }
}

impl FromStr for CacheKey {
    type Err = KeyError;

    /// Parses with the default (strict) codec.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        KeyCodec::default().parse(s)
    }
}

/// Generates, validates and parses canonical keys.
///
/// The codec holds only immutable configuration, so `generate` is a pure
/// function of its inputs.
#[derive(Debug, Clone, Default)]
pub struct KeyCodec {
    config: KeyCodecConfig,
}

impl KeyCodec {
    pub fn new(config: KeyCodecConfig) -> Self {
        Self { config }
    }

    /// A codec that accepts any lowercase module token.
    pub fn lenient() -> Self {
        Self::new(KeyCodecConfig::default().with_strict(false))
    }

    pub fn config(&self) -> &KeyCodecConfig {
        &self.config
    }

    /// Build a canonical key from raw fields.
    ///
    /// `module` and `key_type` are trimmed and lowercased. `identifier` is
    /// lowercased, runs of characters outside `[a-z0-9_-]` become a single
    /// `_`, and leading/trailing `_` are trimmed. An empty `version` becomes
    /// `v1`; a bare number gets a `v` prefix.
    pub fn generate(
        &self,
        module: &str,
        key_type: &str,
        identifier: &str,
        version: Option<&str>,
    ) -> Result<CacheKey, KeyError> {
        for (field, raw) in [
            ("module", module),
            ("type", key_type),
            ("identifier", identifier),
            ("version", version.unwrap_or_default()),
        ] {
            if raw.contains(SEPARATOR) {
                return Err(invalid_argument(field, "must not contain ':'"));
            }
        }

        let module = normalize_token("module", module)?;
        let key_type = normalize_token("type", key_type)?;
        let identifier = normalize_identifier(identifier)?;
        let version = normalize_version(version.unwrap_or_default())?;

        if self.config.strict && !self.config.allowed_modules.iter().any(|m| *m == module) {
            return Err(invalid_argument(
                "module",
                &format!("'{}' is not recognised", module),
            ));
        }

        let key = CacheKey {
            module,
            key_type,
            identifier,
            version,
        };
        let length = key.to_string().len();
        if length > MAX_KEY_LENGTH {
            return Err(invalid_argument(
                "key",
                &format!("length {} exceeds {}", length, MAX_KEY_LENGTH),
            ));
        }
        Ok(key)
    }

    /// `generate` with the default version.
    pub fn generate_v1(
        &self,
        module: &str,
        key_type: &str,
        identifier: &str,
    ) -> Result<CacheKey, KeyError> {
        self.generate(module, key_type, identifier, None)
    }

    /// Parse a canonical key, rejecting anything outside the grammar.
    pub fn parse(&self, key: &str) -> Result<CacheKey, KeyError> {
        if key.is_empty() {
            return Err(invalid_format(key, "key is empty"));
        }
        if key.len() > MAX_KEY_LENGTH {
            return Err(invalid_format(
                key,
                &format!("length {} exceeds {}", key.len(), MAX_KEY_LENGTH),
            ));
        }

        let parts: Vec<&str> = key.split(SEPARATOR).collect();
        if parts.len() != 4 {
            return Err(invalid_format(
                key,
                &format!("expected 4 components, found {}", parts.len()),
            ));
        }

        let (module, key_type, identifier, version) = (parts[0], parts[1], parts[2], parts[3]);

        if !TOKEN_RE.is_match(module) {
            return Err(invalid_format(key, "module must be a lowercase token"));
        }
        if self.config.strict && !self.config.allowed_modules.iter().any(|m| m == module) {
            return Err(invalid_format(
                key,
                &format!("module '{}' is not recognised", module),
            ));
        }
        if !TOKEN_RE.is_match(key_type) {
            return Err(invalid_format(key, "type must be a lowercase token"));
        }
        if identifier.len() > MAX_IDENTIFIER_LENGTH {
            return Err(invalid_format(
                key,
                &format!("identifier exceeds {} characters", MAX_IDENTIFIER_LENGTH),
            ));
        }
        if !IDENTIFIER_RE.is_match(identifier) {
            return Err(invalid_format(
                key,
                "identifier must match [a-z0-9_-]+",
            ));
        }
        if !VERSION_RE.is_match(version) {
            return Err(invalid_format(key, "version must match v[0-9]+"));
        }

        Ok(CacheKey {
            module: module.to_string(),
            key_type: key_type.to_string(),
            identifier: identifier.to_string(),
            version: version.to_string(),
        })
    }

    /// True iff `key` is canonical under this codec's configuration.
    pub fn validate(&self, key: &str) -> bool {
        self.parse(key).is_ok()
    }

    /// Why `key` is not canonical, or `None` if it is.
    pub fn explain(&self, key: &str) -> Option<String> {
        match self.parse(key) {
            Ok(_) => None,
            Err(KeyError::InvalidKeyFormat { reason, .. }) => Some(reason),
            Err(other) => Some(other.to_string()),
        }
    }
}

fn normalize_token(field: &str, raw: &str) -> Result<String, KeyError> {
    let value = raw.trim().to_lowercase();
    if value.is_empty() {
        return Err(invalid_argument(field, "must not be empty"));
    }
    if !TOKEN_RE.is_match(&value) {
        return Err(invalid_argument(
            field,
            &format!("'{}' is not a lowercase token", value),
        ));
    }
    Ok(value)
}

fn normalize_identifier(raw: &str) -> Result<String, KeyError> {
    if raw.trim().is_empty() {
        return Err(invalid_argument("identifier", "must not be empty"));
    }
    let lowered = raw.to_lowercase();
    let replaced = DISALLOWED_RUN_RE.replace_all(&lowered, "_");
    let mut value = replaced.trim_matches('_').to_string();
    if value.len() > MAX_IDENTIFIER_LENGTH {
        // only ASCII survives the replacement, so byte truncation is safe
        value.truncate(MAX_IDENTIFIER_LENGTH);
        value = value.trim_end_matches('_').to_string();
    }
    if value.is_empty() {
        return Err(invalid_argument(
            "identifier",
            "contains no usable characters",
        ));
    }
    Ok(value)
}

fn normalize_version(raw: &str) -> Result<String, KeyError> {
    let value = raw.trim().to_lowercase();
    if value.is_empty() {
        return Ok(DEFAULT_VERSION.to_string());
    }
    if value.chars().all(|c| c.is_ascii_digit()) {
        return Ok(format!("v{}", value));
    }
    if VERSION_RE.is_match(&value) {
        return Ok(value);
    }
    Err(invalid_argument(
        "version",
        &format!("'{}' is not of the form v<number>", raw),
    ))
}

fn invalid_argument(field: &str, reason: &str) -> KeyError {
    KeyError::InvalidArgument {
        field: field.to_string(),
        reason: reason.to_string(),
    }
}

fn invalid_format(key: &str, reason: &str) -> KeyError {
    KeyError::InvalidKeyFormat {
        key: key.to_string(),
        reason: reason.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_normalizes_fields() {
        let codec = KeyCodec::default();
        let key = codec
            .generate(" Fund ", "Detail", "  Growth Fund #1! ", Some("3"))
            .unwrap();
        assert_eq!(key.to_string(), "fund:detail:growth_fund_1:v3");
    }

    #[test]
    fn test_generate_defaults_version() {
        let codec = KeyCodec::default();
        let key = codec.generate("user", "favorites", "default", None).unwrap();
        assert_eq!(key.version(), "v1");

        let key = codec.generate("user", "favorites", "default", Some("")).unwrap();
        assert_eq!(key.version(), "v1");

        let key = codec.generate("user", "favorites", "default", Some("V7")).unwrap();
        assert_eq!(key.version(), "v7");
    }

    #[test]
    fn test_generate_rejects_empty_and_separator() {
        let codec = KeyCodec::default();
        assert!(matches!(
            codec.generate("", "detail", "x", None),
            Err(KeyError::InvalidArgument { .. })
        ));
        assert!(matches!(
            codec.generate("fund", " ", "x", None),
            Err(KeyError::InvalidArgument { .. })
        ));
        assert!(matches!(
            codec.generate("fund", "detail", "", None),
            Err(KeyError::InvalidArgument { .. })
        ));
        assert!(matches!(
            codec.generate("fund", "detail", "a:b", None),
            Err(KeyError::InvalidArgument { .. })
        ));
        assert!(matches!(
            codec.generate("fund", "detail", "x", Some("v1:2")),
            Err(KeyError::InvalidArgument { .. })
        ));
        assert!(matches!(
            codec.generate("fund", "detail", "!!!", None),
            Err(KeyError::InvalidArgument { .. })
        ));
        assert!(matches!(
            codec.generate("fund", "detail", "x", Some("latest")),
            Err(KeyError::InvalidArgument { .. })
        ));
    }

    #[test]
    fn test_generate_rejects_overlong_key() {
        let codec = KeyCodec::default();
        let long_type = "t".repeat(200);
        let result = codec.generate_v1("fund", &long_type, &"i".repeat(80));
        assert!(matches!(
            result,
            Err(KeyError::InvalidArgument { ref field, .. }) if field == "key"
        ));

        // right at the limit still round-trips
        let key_type = "t".repeat(MAX_KEY_LENGTH - "fund::i:v1".len());
        let key = codec.generate_v1("fund", &key_type, "i").unwrap();
        assert_eq!(key.to_string().len(), MAX_KEY_LENGTH);
        assert_eq!(codec.parse(&key.to_string()).unwrap(), key);
    }

    #[test]
    fn test_generate_strict_rejects_unknown_module() {
        assert!(matches!(
            KeyCodec::default().generate_v1("news", "feed", "today"),
            Err(KeyError::InvalidArgument { .. })
        ));
        let key = KeyCodec::lenient().generate_v1("news", "feed", "today").unwrap();
        assert_eq!(key.to_string(), "news:feed:today:v1");
    }

    #[test]
    fn test_generate_truncates_long_identifier() {
        let codec = KeyCodec::default();
        let raw = "a".repeat(150);
        let key = codec.generate_v1("fund", "detail", &raw).unwrap();
        assert_eq!(key.identifier().len(), MAX_IDENTIFIER_LENGTH);
        assert!(codec.validate(&key.to_string()));
    }

    #[test]
    fn test_validate_rejections() {
        let codec = KeyCodec::default();
        assert!(codec.validate("fund:detail:000001:v1"));
        assert!(!codec.validate(""));
        assert!(!codec.validate("fund:detail:000001"));
        assert!(!codec.validate("fund:detail:000001:"));
        assert!(!codec.validate("Fund:detail:000001:v1"));
        assert!(!codec.validate("fund:detail:ABC:v1"));
        assert!(!codec.validate("fund:detail:000001:v1:extra"));
        assert!(!codec.validate("fund:detail:v1"));
        assert!(!codec.validate("fund:detail:000001:1"));
        assert!(!codec.validate(&format!("fund:detail:{}:v1", "a".repeat(101))));
        assert!(!codec.validate("fund::000001:v1"));
    }

    #[test]
    fn test_strict_mode_restricts_modules() {
        let strict = KeyCodec::default();
        let lenient = KeyCodec::lenient();
        assert!(!strict.validate("news:feed:today:v1"));
        assert!(lenient.validate("news:feed:today:v1"));
        for module in KNOWN_MODULES {
            assert!(strict.validate(&format!("{}:list:all:v1", module)));
        }
    }

    #[test]
    fn test_parse_exposes_components() {
        let key: CacheKey = "portfolio:holdings:acct-9:v12".parse().unwrap();
        assert_eq!(key.module(), "portfolio");
        assert_eq!(key.key_type(), "holdings");
        assert_eq!(key.identifier(), "acct-9");
        assert_eq!(key.version(), "v12");
        assert_eq!(key.version_number(), Some(12));
        assert_eq!(key.base(), "portfolio:holdings:acct-9");
        assert_eq!(key.with_version(13).to_string(), "portfolio:holdings:acct-9:v13");
    }

    #[test]
    fn test_version_order_survives_overflow() {
        let codec = KeyCodec::default();
        let huge: CacheKey = "fund:detail:1:v99999999999999999999999".parse().unwrap();
        let small = codec.generate("fund", "detail", "1", Some("v7")).unwrap();
        let padded: CacheKey = "fund:detail:1:v007".parse().unwrap();

        assert_eq!(huge.version_number(), None);
        assert_eq!(huge.cmp_version(&small), Ordering::Greater);
        assert_eq!(small.cmp_version(&huge), Ordering::Less);
        assert_eq!(small.cmp_version(&padded), Ordering::Equal);
        assert_eq!(
            small.cmp_version(&small.with_version(10)),
            Ordering::Less
        );
    }

    #[test]
    fn test_explain_names_the_failure() {
        let codec = KeyCodec::default();
        assert_eq!(codec.explain("fund:detail:1:v1"), None);
        let reason = codec.explain("fund_favorites").unwrap();
        assert!(reason.contains("expected 4 components"));
    }

    #[test]
    fn test_rejects_overlong_key() {
        let codec = KeyCodec::lenient();
        let long_type = "t".repeat(200);
        let key = format!("fund:{}:{}:v1", long_type, "i".repeat(60));
        assert!(key.len() > MAX_KEY_LENGTH);
        assert!(!codec.validate(&key));
    }
}
