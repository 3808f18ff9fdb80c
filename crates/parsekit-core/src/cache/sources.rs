//! Ordering of candidate download sources for a language.

use parsekit_config::{CacheConfig, LanguageProfile, Tier};

use super::fetch::is_local_source;
use super::store::SourceKind;

/// A source to try, tagged with the kind recorded if it succeeds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceCandidate {
    pub url: String,
    pub kind: SourceKind,
}

impl SourceCandidate {
    fn new(url: impl Into<String>, kind: SourceKind) -> Self {
        Self {
            url: url.into(),
            kind,
        }
    }
}

/// Builds the ordered source list for a profile.
///
/// Order: primary, profile fallbacks, global mirrors (skipped for Tier-3),
/// then the profile's local copy. Duplicate URLs keep their first position.
/// Offline, only sources on the local filesystem remain.
#[derive(Debug, Clone, Default)]
pub struct FallbackSourceResolver {
    mirrors: Vec<String>,
    offline: bool,
}

impl FallbackSourceResolver {
    pub fn new(mirrors: Vec<String>, offline: bool) -> Self {
        Self { mirrors, offline }
    }

    pub fn from_config(config: &CacheConfig) -> Self {
        Self::new(config.mirrors.clone(), config.offline)
    }

    pub fn resolve(&self, profile: &LanguageProfile) -> Vec<SourceCandidate> {
        let mut candidates = vec![SourceCandidate::new(
            profile.primary_source_url.as_str(),
            SourceKind::Primary,
        )];
        candidates.extend(
            profile
                .fallback_source_urls
                .iter()
                .map(|url| SourceCandidate::new(url.as_str(), SourceKind::Fallback)),
        );
        if profile.tier != Tier::Lazy {
            candidates.extend(self.mirrors.iter().map(|template| {
                SourceCandidate::new(
                    template.replace("{language}", &profile.name),
                    SourceKind::Fallback,
                )
            }));
        }
        if let Some(path) = &profile.local_source_path {
            candidates.push(SourceCandidate::new(path.as_str(), SourceKind::Local));
        }

        let mut seen = std::collections::HashSet::new();
        candidates.retain(|c| !c.url.is_empty() && seen.insert(c.url.clone()));

        if self.offline {
            candidates.retain(|c| c.kind == SourceKind::Local || is_local_source(&c.url));
        }
        candidates
    }
}
