//! Per-language grammar profiles.
//!
//! A [`LanguageProfile`] says where a language's grammar artifact comes from,
//! how it is verified, and which [`Tier`] it belongs to. Profiles are read-only
//! once loaded; the cache layer never writes them back.

use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Loading and eviction class of a language.
///
/// Serialized as the integers `1`, `2` and `3`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum Tier {
    /// Preloaded eagerly and protected from eviction.
    Eager = 1,
    /// Loaded on first use.
    OnDemand = 2,
    /// Rarely used; first to be evicted.
    Lazy = 3,
}

impl Tier {
    /// All tiers, most protected first.
    pub const ALL: [Tier; 3] = [Tier::Eager, Tier::OnDemand, Tier::Lazy];

    /// Numeric tier (1, 2 or 3).
    pub fn number(self) -> u8 {
        self as u8
    }
}

impl TryFrom<u8> for Tier {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(Tier::Eager),
            2 => Ok(Tier::OnDemand),
            3 => Ok(Tier::Lazy),
            other => Err(format!("tier must be 1, 2 or 3, got {other}")),
        }
    }
}

impl From<Tier> for u8 {
    fn from(tier: Tier) -> Self {
        tier.number()
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "tier-{}", self.number())
    }
}

/// Where a language's grammar comes from and how it is checked.
///
/// ## TOML Example
///
/// ```toml
/// [languages.python]
/// file_extensions = ["py", "pyi"]
/// tier = 1
/// primary_source_url = "https://grammars.example/python.json"
/// fallback_source_urls = ["https://mirror.example/python.json"]
/// expected_hash = "sha256:9f86d081884c7d659a2feaa0c55ad015a3bf4f1b2b0b822cd15d6c15b0f00a08"
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LanguageProfile {
    /// Canonical language name. Filled from the `[languages.<name>]` key when
    /// omitted in TOML.
    #[serde(default)]
    pub name: String,

    /// File extensions (without the dot) that map to this language.
    #[serde(default)]
    pub file_extensions: BTreeSet<String>,

    /// Loading and eviction class.
    #[serde(default = "default_tier")]
    pub tier: Tier,

    /// Source tried first.
    pub primary_source_url: String,

    /// Mirrors tried in order after the primary source.
    #[serde(default)]
    pub fallback_source_urls: Vec<String>,

    /// A local copy of the artifact, tried after every remote source.
    #[serde(default)]
    pub local_source_path: Option<String>,

    /// Expected SHA-256 of the artifact, hex, optionally prefixed `sha256:`.
    #[serde(default)]
    pub expected_hash: Option<String>,

    /// Expected artifact size in bytes.
    #[serde(default)]
    pub expected_size_bytes: Option<u64>,

    /// Ordering within a tier (lower loads first).
    #[serde(default)]
    pub priority_within_tier: i32,
}

fn default_tier() -> Tier {
    Tier::OnDemand
}

impl LanguageProfile {
    /// Create a profile with a primary source and defaults for everything else.
    pub fn new(name: impl Into<String>, primary_source_url: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            file_extensions: BTreeSet::new(),
            tier: default_tier(),
            primary_source_url: primary_source_url.into(),
            fallback_source_urls: Vec::new(),
            local_source_path: None,
            expected_hash: None,
            expected_size_bytes: None,
            priority_within_tier: 0,
        }
    }

    /// Builder: set the tier.
    pub fn with_tier(mut self, tier: Tier) -> Self {
        self.tier = tier;
        self
    }

    /// Builder: add a file extension.
    pub fn with_extension(mut self, ext: impl Into<String>) -> Self {
        self.file_extensions.insert(ext.into().to_lowercase());
        self
    }

    /// Builder: append a fallback source.
    pub fn with_fallback(mut self, url: impl Into<String>) -> Self {
        self.fallback_source_urls.push(url.into());
        self
    }

    /// Builder: set the local source path.
    pub fn with_local_source(mut self, path: impl Into<String>) -> Self {
        self.local_source_path = Some(path.into());
        self
    }

    /// Builder: set the expected hash.
    pub fn with_expected_hash(mut self, hash: impl Into<String>) -> Self {
        self.expected_hash = Some(hash.into());
        self
    }

    /// Builder: set the expected size.
    pub fn with_expected_size(mut self, bytes: u64) -> Self {
        self.expected_size_bytes = Some(bytes);
        self
    }

    /// Builder: set the priority within the tier.
    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority_within_tier = priority;
        self
    }

    /// The configured hash with any `sha256:` prefix removed, lowercased.
    pub fn normalized_expected_hash(&self) -> Option<String> {
        self.expected_hash.as_deref().map(normalize_hash)
    }
}

/// Strip an optional `sha256:` prefix and lowercase a hex digest.
pub fn normalize_hash(raw: &str) -> String {
    let trimmed = raw.trim();
    trimmed
        .strip_prefix("sha256:")
        .unwrap_or(trimmed)
        .to_ascii_lowercase()
}

/// Whether `raw` is a well-formed SHA-256 hex digest (prefix allowed).
pub fn is_valid_hash(raw: &str) -> bool {
    let digest = normalize_hash(raw);
    digest.len() == 64 && digest.chars().all(|c| c.is_ascii_hexdigit())
}
