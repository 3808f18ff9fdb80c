//! Read-only view over the configured language profiles.
//!
//! Resolves a language by canonical name, by alias (`ts`, `py`, any
//! configured extension), or from a file path.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;

use parsekit_config::{LanguageProfile, Tier};

/// Lookup table over [`LanguageProfile`]s.
#[derive(Debug, Clone, Default)]
pub struct LanguageCatalog {
    profiles: BTreeMap<String, LanguageProfile>,
    by_extension: HashMap<String, String>,
}

impl LanguageCatalog {
    /// Build a catalog from profiles keyed by canonical name.
    pub fn new(profiles: BTreeMap<String, LanguageProfile>) -> Self {
        let mut by_extension = HashMap::new();
        for (name, profile) in &profiles {
            for ext in &profile.file_extensions {
                by_extension.insert(ext.to_lowercase(), name.clone());
            }
        }
        Self {
            profiles,
            by_extension,
        }
    }

    /// Build a catalog from a list of profiles.
    pub fn from_profiles(profiles: impl IntoIterator<Item = LanguageProfile>) -> Self {
        Self::new(
            profiles
                .into_iter()
                .map(|p| (p.name.clone(), p))
                .collect(),
        )
    }

    /// Profile for a canonical name or alias.
    pub fn profile(&self, language: &str) -> Option<&LanguageProfile> {
        self.canonical_name(language)
            .and_then(|name| self.profiles.get(name))
    }

    /// Resolve a name or alias to the canonical language name.
    ///
    /// Exact names win; otherwise the lowercased input is tried as a name
    /// and then as a file extension.
    pub fn canonical_name(&self, language: &str) -> Option<&str> {
        if let Some((name, _)) = self.profiles.get_key_value(language) {
            return Some(name.as_str());
        }
        let lowered = language.trim().to_lowercase();
        if let Some((name, _)) = self.profiles.get_key_value(&lowered) {
            return Some(name.as_str());
        }
        self.by_extension
            .get(lowered.trim_start_matches('.'))
            .map(String::as_str)
    }

    /// Detect the language of a file from its extension.
    pub fn detect(&self, path: &Path) -> Option<&LanguageProfile> {
        let ext = path.extension()?.to_str()?.to_lowercase();
        let name = self.by_extension.get(&ext)?;
        self.profiles.get(name)
    }

    /// All profiles, ordered by name.
    pub fn profiles(&self) -> impl Iterator<Item = &LanguageProfile> {
        self.profiles.values()
    }

    /// All canonical names, ordered.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.profiles.keys().map(String::as_str)
    }

    /// Profiles in a tier, ordered by `priority_within_tier` then name.
    pub fn in_tier(&self, tier: Tier) -> Vec<&LanguageProfile> {
        let mut selected: Vec<&LanguageProfile> =
            self.profiles.values().filter(|p| p.tier == tier).collect();
        selected.sort_by(|a, b| {
            a.priority_within_tier
                .cmp(&b.priority_within_tier)
                .then_with(|| a.name.cmp(&b.name))
        });
        selected
    }

    /// Number of configured languages.
    pub fn len(&self) -> usize {
        self.profiles.len()
    }

    /// Whether no languages are configured.
    pub fn is_empty(&self) -> bool {
        self.profiles.is_empty()
    }
}
