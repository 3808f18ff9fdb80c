//! Tiered eviction planning.
//!
//! Planning is a pure function over the current records so the ordering
//! rules can be tested without a filesystem. The manager applies the plan
//! while holding exclusive access to the cache directory.
//!
//! Rules, applied in order:
//!
//! 1. Records in the `failed` state are always removed.
//! 2. Tier-2/3 artifacts idle longer than `max_age` are removed.
//! 3. While over `budget_bytes`, Tier-2/3 artifacts are removed highest tier
//!    first, least recently used first.
//! 4. Tier-1 artifacts become candidates only once no Tier-2/3 artifact
//!    remains, or when Tier-1 artifacts alone exceed the budget.
//!
//! Artifacts accessed within `protect_recent`, and artifacts a caller holds a
//! lease on, are never removed by rules 2-4.

use std::collections::BTreeSet;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parsekit_config::{CacheConfig, Tier};
use serde::Serialize;

use super::store::{ArtifactRecord, IntegrityState};

/// Limits an eviction pass enforces.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EvictionPolicy {
    pub budget_bytes: Option<u64>,
    pub max_age: Option<Duration>,
    pub protect_recent: Duration,
}

impl Default for EvictionPolicy {
    /// No limits, with the configured default recent-access protection.
    fn default() -> Self {
        Self {
            budget_bytes: None,
            max_age: None,
            protect_recent: Duration::from_secs(CacheConfig::default().protect_recent_secs),
        }
    }
}

impl EvictionPolicy {
    pub fn from_config(config: &CacheConfig) -> Self {
        Self {
            budget_bytes: config.budget_bytes,
            max_age: config.max_age_secs.map(Duration::from_secs),
            protect_recent: Duration::from_secs(config.protect_recent_secs),
        }
    }

    pub fn with_budget(mut self, bytes: u64) -> Self {
        self.budget_bytes = Some(bytes);
        self
    }

    pub fn with_max_age(mut self, age: Duration) -> Self {
        self.max_age = Some(age);
        self
    }

    pub fn with_protect_recent(mut self, window: Duration) -> Self {
        self.protect_recent = window;
        self
    }
}

/// Why an artifact was removed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum EvictionReason {
    Failed,
    Expired,
    OverBudget,
}

/// One removal decided by a pass.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EvictedArtifact {
    pub language: String,
    pub tier: Tier,
    pub size_bytes: u64,
    pub reason: EvictionReason,
}

/// Outcome of an eviction pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct EvictionReport {
    pub evicted: Vec<EvictedArtifact>,
    /// Language directories without a usable record.
    pub orphans_removed: Vec<String>,
    pub bytes_before: u64,
    pub bytes_after: u64,
    /// False when protected artifacts kept the cache above budget.
    pub budget_satisfied: bool,
}

impl EvictionReport {
    pub fn bytes_freed(&self) -> u64 {
        self.bytes_before.saturating_sub(self.bytes_after)
    }
}

fn idle_for(record: &ArtifactRecord, now: DateTime<Utc>) -> Duration {
    (now - record.last_accessed_at).to_std().unwrap_or(Duration::ZERO)
}

/// Decide which records to remove. The returned report has no orphans; the
/// manager fills those in.
pub fn plan(
    records: &[ArtifactRecord],
    policy: &EvictionPolicy,
    now: DateTime<Utc>,
) -> EvictionReport {
    plan_with_leases(records, policy, &BTreeSet::new(), now)
}

/// Like [`plan`], never choosing a language in `leased` except for a failed
/// record.
pub fn plan_with_leases(
    records: &[ArtifactRecord],
    policy: &EvictionPolicy,
    leased: &BTreeSet<String>,
    now: DateTime<Utc>,
) -> EvictionReport {
    let bytes_before: u64 = records.iter().map(|r| r.size_bytes).sum();
    let mut remaining: Vec<&ArtifactRecord> = Vec::with_capacity(records.len());
    let mut evicted = Vec::new();

    let evict = |record: &ArtifactRecord, reason| EvictedArtifact {
        language: record.language.clone(),
        tier: record.tier,
        size_bytes: record.size_bytes,
        reason,
    };
    let protected = |record: &ArtifactRecord| {
        leased.contains(&record.language) || idle_for(record, now) < policy.protect_recent
    };

    for record in records {
        if record.integrity_state == IntegrityState::Failed {
            evicted.push(evict(record, EvictionReason::Failed));
            continue;
        }
        let expired = policy.max_age.is_some_and(|max_age| {
            record.tier != Tier::Eager && !protected(record) && idle_for(record, now) > max_age
        });
        if expired {
            evicted.push(evict(record, EvictionReason::Expired));
        } else {
            remaining.push(record);
        }
    }

    let mut total: u64 = remaining.iter().map(|r| r.size_bytes).sum();
    if let Some(budget) = policy.budget_bytes {
        // Highest tier first, then least recently used.
        remaining.sort_by(|a, b| {
            b.tier
                .cmp(&a.tier)
                .then_with(|| a.last_accessed_at.cmp(&b.last_accessed_at))
        });

        let mut kept = Vec::with_capacity(remaining.len());
        for record in remaining.iter().copied() {
            if total > budget && record.tier != Tier::Eager && !protected(record) {
                total -= record.size_bytes;
                evicted.push(evict(record, EvictionReason::OverBudget));
            } else {
                kept.push(record);
            }
        }

        let lower_tiers_remain = kept.iter().any(|r| r.tier != Tier::Eager);
        let eager_bytes: u64 = kept
            .iter()
            .filter(|r| r.tier == Tier::Eager)
            .map(|r| r.size_bytes)
            .sum();
        if total > budget && (!lower_tiers_remain || eager_bytes > budget) {
            // `kept` is already least recently used first within Tier-1.
            for record in kept.iter().copied().filter(|r| r.tier == Tier::Eager) {
                if total <= budget {
                    break;
                }
                if protected(record) {
                    continue;
                }
                total -= record.size_bytes;
                evicted.push(evict(record, EvictionReason::OverBudget));
            }
        }
    }

    EvictionReport {
        evicted,
        orphans_removed: Vec::new(),
        bytes_before,
        bytes_after: total,
        budget_satisfied: policy.budget_bytes.is_none_or(|budget| total <= budget),
    }
}
