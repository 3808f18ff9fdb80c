//! Download orchestration and cache maintenance.
//!
//! Concurrency rules:
//!
//! - Operations on one language are serialized by a per-language mutex, so
//!   concurrent `ensure_artifact` calls for the same language share a single
//!   download; the waiters find the verified artifact once it is committed.
//! - `ensure_artifact` and `verify` hold the directory gate shared; `evict`
//!   and `clear` hold it exclusively. An eviction pass therefore never runs
//!   while an artifact is being downloaded or verified.
//! - An eviction pass skips recently accessed artifacts and any artifact an
//!   [`ArtifactLease`] is outstanding for. Leases are taken before the gate
//!   is released, so a caller reading the artifact file through a lease never
//!   races an eviction.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use parsekit_config::{CacheConfig, LanguageProfile, RetryConfig, Tier, TrustPolicy};
use serde::Serialize;
use tempfile::TempPath;
use tokio::sync::{OwnedMutexGuard, RwLock, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::eviction::{self, EvictionPolicy, EvictionReport};
use super::fetch::{ArtifactFetcher, FetchError, FetchedArtifact, SourceFetcher};
use super::integrity::IntegrityVerifier;
use super::sources::{FallbackSourceResolver, SourceCandidate};
use super::store::{ArtifactRecord, ArtifactStore, IntegrityState, StoreError};
use super::{CacheError, SourceFailure};
use crate::catalog::LanguageCatalog;

/// Result of a Tier-1 preload.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PreloadReport {
    /// Languages with a verified artifact, in completion order.
    pub ready: Vec<String>,
    /// Languages that failed, with the error message.
    pub failed: Vec<(String, String)>,
}

impl PreloadReport {
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Snapshot of cache health after re-verifying every record.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CacheHealth {
    pub verified: Vec<String>,
    /// Accepted on first download and not yet re-verified.
    pub pending: Vec<String>,
    pub failed: Vec<String>,
    /// Configured languages with no cached artifact.
    pub missing: Vec<String>,
    /// Tier-1 languages with no usable artifact.
    pub missing_tier1: Vec<String>,
    pub total_bytes: u64,
    /// Bytes per tier number.
    pub bytes_by_tier: BTreeMap<u8, u64>,
}

impl CacheHealth {
    /// Every Tier-1 language is ready and nothing failed verification.
    pub fn is_healthy(&self) -> bool {
        self.failed.is_empty() && self.missing_tier1.is_empty()
    }
}

#[derive(Debug, Clone)]
struct Settings {
    retry: RetryConfig,
    trust_policy: TrustPolicy,
    request_timeout: Duration,
    max_concurrent_downloads: usize,
    eviction: EvictionPolicy,
}

enum SourceError {
    Cancelled,
    Store(StoreError),
    Exhausted(SourceFailure),
}

struct Staged {
    path: TempPath,
    fetched: FetchedArtifact,
}

type LeaseTable = Mutex<HashMap<String, usize>>;

/// A verified artifact that eviction leaves in place until the lease is
/// dropped.
#[derive(Debug)]
pub struct ArtifactLease {
    record: ArtifactRecord,
    leases: Arc<LeaseTable>,
}

impl ArtifactLease {
    fn acquire(record: ArtifactRecord, leases: &Arc<LeaseTable>) -> Self {
        let mut table = leases.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        *table.entry(record.language.clone()).or_insert(0) += 1;
        Self {
            record,
            leases: Arc::clone(leases),
        }
    }

    pub fn record(&self) -> &ArtifactRecord {
        &self.record
    }

    pub fn language(&self) -> &str {
        &self.record.language
    }

    pub fn path(&self) -> &Path {
        &self.record.local_path
    }
}

impl Drop for ArtifactLease {
    fn drop(&mut self) {
        let mut table = self.leases.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(count) = table.get_mut(&self.record.language) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                table.remove(&self.record.language);
            }
        }
    }
}

type InFlight = Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>;

/// Exclusive hold on one language. The in-flight entry is removed once no
/// other caller holds or waits for it.
struct LanguageGuard<'a> {
    in_flight: &'a InFlight,
    language: String,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for LanguageGuard<'_> {
    fn drop(&mut self) {
        let mut in_flight = self
            .in_flight
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        self.guard.take();
        let idle = in_flight
            .get(&self.language)
            .is_some_and(|lock| Arc::strong_count(lock) == 1);
        if idle {
            in_flight.remove(&self.language);
        }
    }
}

/// Owns grammar artifacts and their metadata records.
pub struct GrammarCacheManager {
    catalog: Arc<LanguageCatalog>,
    store: ArtifactStore,
    fetcher: Arc<dyn ArtifactFetcher>,
    resolver: FallbackSourceResolver,
    settings: Settings,
    in_flight: InFlight,
    leases: Arc<LeaseTable>,
    gate: RwLock<()>,
    shutdown: CancellationToken,
}

impl GrammarCacheManager {
    /// Open the cache described by `config`, fetching over HTTP and from the
    /// local filesystem.
    pub async fn open(
        config: &CacheConfig,
        catalog: Arc<LanguageCatalog>,
    ) -> Result<Self, CacheError> {
        let fetcher = SourceFetcher::new(config.request_timeout()).map_err(CacheError::Fetcher)?;
        Self::open_with_fetcher(config, catalog, Arc::new(fetcher)).await
    }

    /// Open the cache with a custom fetcher.
    pub async fn open_with_fetcher(
        config: &CacheConfig,
        catalog: Arc<LanguageCatalog>,
        fetcher: Arc<dyn ArtifactFetcher>,
    ) -> Result<Self, CacheError> {
        let store = ArtifactStore::open(config.root_path()).await?;
        info!(
            root = %store.root().display(),
            languages = catalog.len(),
            fetcher = fetcher.name(),
            trust_policy = %config.trust_policy,
            offline = config.offline,
            "Grammar cache opened"
        );
        Ok(Self {
            catalog,
            store,
            fetcher,
            resolver: FallbackSourceResolver::from_config(config),
            settings: Settings {
                retry: config.retry.clone(),
                trust_policy: config.trust_policy,
                request_timeout: config.request_timeout(),
                max_concurrent_downloads: config.max_concurrent_downloads.max(1),
                eviction: EvictionPolicy::from_config(config),
            },
            in_flight: Mutex::new(HashMap::new()),
            leases: Arc::new(Mutex::new(HashMap::new())),
            gate: RwLock::new(()),
            shutdown: CancellationToken::new(),
        })
    }

    pub fn catalog(&self) -> &LanguageCatalog {
        &self.catalog
    }

    pub fn store(&self) -> &ArtifactStore {
        &self.store
    }

    /// Eviction limits from configuration.
    pub fn eviction_policy(&self) -> &EvictionPolicy {
        &self.settings.eviction
    }

    /// Token cancelling every operation that was not given its own token.
    pub fn shutdown_token(&self) -> &CancellationToken {
        &self.shutdown
    }

    /// Abort in-flight downloads started through the non-cancellable API.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    /// Serialize work on `language`, which must be a canonical name.
    async fn lock_language(
        &self,
        language: &str,
        cancel: &CancellationToken,
    ) -> Result<LanguageGuard<'_>, CacheError> {
        let lock = {
            let mut in_flight = self
                .in_flight
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            in_flight
                .entry(language.to_string())
                .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
                .clone()
        };
        let mut slot = LanguageGuard {
            in_flight: &self.in_flight,
            language: language.to_string(),
            guard: None,
        };
        let guard = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(CacheError::Cancelled),
            guard = lock.lock_owned() => guard,
        };
        slot.guard = Some(guard);
        Ok(slot)
    }

    /// Number of languages with a download or verification in progress or
    /// queued.
    pub fn in_flight_count(&self) -> usize {
        self.in_flight
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }

    fn leased_languages(&self) -> BTreeSet<String> {
        self.leases
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .keys()
            .cloned()
            .collect()
    }

    fn resolve_profile(&self, language: &str) -> Result<LanguageProfile, CacheError> {
        self.catalog
            .profile(language)
            .cloned()
            .ok_or_else(|| CacheError::UnsupportedLanguage(language.to_string()))
    }

    // ── ensure ──────────────────────────────────────────────────────────

    /// Path to a verified artifact for `language`, downloading if needed.
    pub async fn ensure_artifact(&self, language: &str) -> Result<PathBuf, CacheError> {
        self.ensure_record(language, &self.shutdown)
            .await
            .map(|record| record.local_path)
    }

    /// Like [`ensure_artifact`](Self::ensure_artifact), aborting when
    /// `cancel` fires. Partial downloads are removed on cancellation.
    pub async fn ensure_artifact_cancellable(
        &self,
        language: &str,
        cancel: &CancellationToken,
    ) -> Result<PathBuf, CacheError> {
        self.ensure_record(language, cancel)
            .await
            .map(|record| record.local_path)
    }

    /// Verified record for `language`, downloading if needed.
    pub async fn ensure_record(
        &self,
        language: &str,
        cancel: &CancellationToken,
    ) -> Result<ArtifactRecord, CacheError> {
        self.lease(language, cancel)
            .await
            .map(|lease| lease.record().clone())
    }

    /// Verified artifact for `language`, downloading if needed, kept safe from
    /// eviction while the returned lease is alive.
    pub async fn lease(
        &self,
        language: &str,
        cancel: &CancellationToken,
    ) -> Result<ArtifactLease, CacheError> {
        let profile = self.resolve_profile(language)?;
        let _language_guard = self.lock_language(&profile.name, cancel).await?;
        let _gate = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(CacheError::Cancelled),
            guard = self.gate.read() => guard,
        };

        let record = match self.cached_record(&profile).await? {
            Some(record) => {
                debug!(language = %profile.name, "Grammar served from cache");
                record
            }
            None => self.download(&profile, cancel).await?,
        };
        Ok(ArtifactLease::acquire(record, &self.leases))
    }

    /// Load, re-verify and touch the cached record. Anything unusable is
    /// removed so the caller downloads afresh.
    async fn cached_record(
        &self,
        profile: &LanguageProfile,
    ) -> Result<Option<ArtifactRecord>, CacheError> {
        let language = profile.name.as_str();
        let mut record = match self.store.load_record(language).await {
            Ok(Some(record)) => record,
            Ok(None) => return Ok(None),
            Err(StoreError::Corrupt { path, source }) => {
                warn!(
                    language,
                    path = %path.display(),
                    error = %source,
                    "Discarding corrupt metadata record"
                );
                self.store.remove(language).await?;
                return Ok(None);
            }
            Err(e) => return Err(e.into()),
        };

        if !record.is_usable() {
            info!(language, "Removing artifact previously marked failed");
            self.store.remove(language).await?;
            return Ok(None);
        }

        if let Some(expected) = profile.expected_hash.as_deref() {
            if !IntegrityVerifier::matches(expected, &record.content_hash) {
                info!(language, "Configured hash changed; refreshing artifact");
                self.store.remove(language).await?;
                return Ok(None);
            }
        }

        let path = self.store.artifact_path(language);
        let intact = match IntegrityVerifier::hash_file(&path).await {
            Ok(digest) => IntegrityVerifier::matches(&record.content_hash, &digest.hash),
            Err(_) => false,
        };
        if !intact {
            warn!(
                language,
                path = %path.display(),
                "Cached artifact failed verification; removing"
            );
            self.store.remove(language).await?;
            return Ok(None);
        }

        let now = Utc::now();
        record.local_path = path;
        record.last_verified_at = now;
        if record.integrity_state == IntegrityState::Pending {
            record.integrity_state = IntegrityState::Verified;
        }
        record.touch(now);
        self.store.save_record(&record).await?;
        Ok(Some(record))
    }

    async fn download(
        &self,
        profile: &LanguageProfile,
        cancel: &CancellationToken,
    ) -> Result<ArtifactRecord, CacheError> {
        let language = profile.name.as_str();
        let expected_hash = profile.normalized_expected_hash();
        if expected_hash.is_none() && self.settings.trust_policy == TrustPolicy::RequireHash {
            warn!(language, "No expected hash configured; refusing download under require-hash");
            return Err(CacheError::IntegrityFailure {
                language: language.to_string(),
                sources: Vec::new(),
            });
        }

        let candidates = self.resolver.resolve(profile);
        let mut failures = Vec::with_capacity(candidates.len());
        for candidate in &candidates {
            match self
                .fetch_source(profile, candidate, expected_hash.as_deref(), cancel)
                .await
            {
                Ok(staged) => {
                    let hash_configured = expected_hash.is_some();
                    return self.commit(profile, candidate, staged, hash_configured).await;
                }
                Err(SourceError::Cancelled) => {
                    info!(language, "Grammar download cancelled");
                    return Err(CacheError::Cancelled);
                }
                Err(SourceError::Store(e)) => return Err(e.into()),
                Err(SourceError::Exhausted(failure)) => {
                    warn!(
                        language,
                        source = %failure.url,
                        kind = %failure.kind,
                        attempts = failure.attempts,
                        "Source exhausted"
                    );
                    failures.push(failure);
                }
            }
        }

        let language = language.to_string();
        if failures.iter().any(SourceFailure::is_integrity) {
            Err(CacheError::IntegrityFailure {
                language,
                sources: failures,
            })
        } else {
            Err(CacheError::DownloadFailure {
                language,
                sources: failures,
            })
        }
    }

    /// Try one source up to the configured number of attempts.
    async fn fetch_source(
        &self,
        profile: &LanguageProfile,
        candidate: &SourceCandidate,
        expected_hash: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<Staged, SourceError> {
        let language = profile.name.as_str();
        let attempts = self.settings.retry.attempts.max(1);
        let mut reasons = Vec::new();

        for attempt in 1..=attempts {
            let delay = self.settings.retry.delay_before(attempt);
            if !delay.is_zero() {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return Err(SourceError::Cancelled),
                    _ = tokio::time::sleep(delay) => {}
                }
            }

            let staged = self.store.stage(language).await.map_err(SourceError::Store)?;
            debug!(language, source = %candidate.url, attempt, "Fetching grammar");
            let timeout = self.settings.request_timeout;
            let fetch = self
                .fetcher
                .fetch_limited(&candidate.url, &staged, profile.expected_size_bytes);
            let result = tokio::select! {
                biased;
                _ = cancel.cancelled() => Err(FetchError::Cancelled),
                r = tokio::time::timeout(timeout, fetch) => {
                    r.unwrap_or(Err(FetchError::Timeout(timeout)))
                }
            };

            match result.and_then(|fetched| check(fetched, profile, expected_hash)) {
                Ok(fetched) => {
                    return Ok(Staged {
                        path: staged,
                        fetched,
                    });
                }
                // Dropping `staged` removes the partial file.
                Err(FetchError::Cancelled) => return Err(SourceError::Cancelled),
                Err(reason) => {
                    debug!(
                        language,
                        source = %candidate.url,
                        attempt,
                        error = %reason,
                        "Fetch attempt failed"
                    );
                    let retryable = reason.is_retryable();
                    reasons.push(reason);
                    drop(staged);
                    if !retryable {
                        break;
                    }
                }
            }
        }

        Err(SourceError::Exhausted(SourceFailure {
            url: candidate.url.clone(),
            kind: candidate.kind,
            attempts: reasons.len() as u32,
            reasons,
        }))
    }

    async fn commit(
        &self,
        profile: &LanguageProfile,
        candidate: &SourceCandidate,
        staged: Staged,
        hash_configured: bool,
    ) -> Result<ArtifactRecord, CacheError> {
        let language = profile.name.as_str();
        let local_path = self.store.commit(language, staged.path)?;
        let now = Utc::now();
        let record = ArtifactRecord {
            language: language.to_string(),
            local_path,
            content_hash: staged.fetched.hash,
            size_bytes: staged.fetched.size_bytes,
            source_url: candidate.url.clone(),
            source_kind: candidate.kind,
            downloaded_at: now,
            last_verified_at: now,
            last_accessed_at: now,
            access_count: 1,
            integrity_state: if hash_configured {
                IntegrityState::Verified
            } else {
                IntegrityState::Pending
            },
            tier: profile.tier,
        };
        self.store.save_record(&record).await?;
        info!(
            language,
            source = %record.source_url,
            kind = %record.source_kind,
            bytes = record.size_bytes,
            state = ?record.integrity_state,
            "Grammar artifact cached"
        );
        Ok(record)
    }

    // ── verify / describe / health ──────────────────────────────────────

    /// Re-hash the cached artifact and compare it with its record.
    ///
    /// Returns `false` when the language is not configured, or when the
    /// artifact or record is missing, unreadable or mismatched; a mismatch
    /// marks the record failed.
    pub async fn verify(&self, language: &str) -> bool {
        let Some(name) = self.catalog.canonical_name(language).map(str::to_string) else {
            debug!(language, "Refusing to verify an unconfigured language");
            return false;
        };
        let Ok(_language_guard) = self.lock_language(&name, &self.shutdown).await else {
            return false;
        };
        let _gate = self.gate.read().await;

        let mut record = match self.store.load_record(&name).await {
            Ok(Some(record)) => record,
            Ok(None) => return false,
            Err(e) => {
                debug!(language = %name, error = %e, "Record unreadable during verification");
                return false;
            }
        };
        if !record.is_usable() {
            return false;
        }

        let path = self.store.artifact_path(&name);
        let intact = IntegrityVerifier::verify_file(&path, &record.content_hash).await;
        let now = Utc::now();
        if intact {
            record.last_verified_at = now;
            if record.integrity_state == IntegrityState::Pending {
                record.integrity_state = IntegrityState::Verified;
            }
        } else {
            warn!(language = %name, "Artifact failed verification");
            record.integrity_state = IntegrityState::Failed;
        }
        if let Err(e) = self.store.save_record(&record).await {
            warn!(language = %name, error = %e, "Failed to persist verification result");
        }
        intact
    }

    /// Snapshot of every configured or cached language and its record.
    pub async fn describe_cache(&self) -> BTreeMap<String, Option<ArtifactRecord>> {
        let _gate = self.gate.read().await;
        let mut snapshot: BTreeMap<String, Option<ArtifactRecord>> = self
            .catalog
            .names()
            .map(|name| (name.to_string(), None))
            .collect();
        let stored = self.store.list_languages().await.unwrap_or_default();
        for name in stored {
            snapshot.entry(name).or_insert(None);
        }
        for (name, slot) in snapshot.iter_mut() {
            *slot = self.store.load_record(name).await.ok().flatten();
        }
        snapshot
    }

    /// Re-verify every cached artifact and summarize the cache.
    pub async fn health(&self) -> CacheHealth {
        let languages: Vec<String> = self.describe_cache().await.into_keys().collect();
        let mut health = CacheHealth::default();

        for language in languages {
            let present = self.store.artifact_path(&language).exists();
            // Records of languages no longer configured are reported as stored.
            if present && self.catalog.canonical_name(&language).is_some() {
                self.verify(&language).await;
            }
            let record = self.store.load_record(&language).await.ok().flatten();
            let tier = self
                .catalog
                .profile(&language)
                .map(|p| p.tier)
                .or(record.as_ref().map(|r| r.tier));

            match &record {
                Some(r) if present => {
                    match r.integrity_state {
                        IntegrityState::Verified => health.verified.push(language.clone()),
                        IntegrityState::Pending => health.pending.push(language.clone()),
                        IntegrityState::Failed => health.failed.push(language.clone()),
                    }
                    if r.is_usable() {
                        health.total_bytes += r.size_bytes;
                        *health.bytes_by_tier.entry(r.tier.number()).or_default() += r.size_bytes;
                    }
                }
                _ => health.missing.push(language.clone()),
            }

            let usable = present && record.as_ref().is_some_and(ArtifactRecord::is_usable);
            if tier == Some(Tier::Eager) && !usable {
                health.missing_tier1.push(language);
            }
        }
        health
    }

    // ── evict / clear ───────────────────────────────────────────────────

    /// Run an eviction pass with the configured limits.
    pub async fn evict_configured(&self) -> Result<EvictionReport, CacheError> {
        let policy = self.settings.eviction.clone();
        self.evict(&policy).await
    }

    /// Run an eviction pass. Holds exclusive access to the cache directory
    /// and leaves leased artifacts in place.
    pub async fn evict(&self, policy: &EvictionPolicy) -> Result<EvictionReport, CacheError> {
        let _gate = self.gate.write().await;
        let leased = self.leased_languages();

        let mut records = Vec::new();
        let mut orphans = Vec::new();
        for language in self.store.list_languages().await? {
            let artifact_exists = self.store.artifact_path(&language).exists();
            match self.store.load_record(&language).await {
                Ok(Some(record)) if artifact_exists => records.push(record),
                _ if leased.contains(&language) => {}
                _ => orphans.push(language),
            }
        }

        let mut report = eviction::plan_with_leases(&records, policy, &leased, Utc::now());
        for evicted in &report.evicted {
            self.store.remove(&evicted.language).await?;
            info!(
                language = %evicted.language,
                tier = evicted.tier.number(),
                bytes = evicted.size_bytes,
                reason = ?evicted.reason,
                "Evicted grammar artifact"
            );
        }
        for orphan in &orphans {
            self.store.remove(orphan).await?;
            debug!(language = %orphan, "Removed orphaned cache directory");
        }
        report.orphans_removed = orphans;

        if !report.budget_satisfied {
            warn!(
                bytes = report.bytes_after,
                budget = ?policy.budget_bytes,
                "Cache remains over budget; remaining artifacts are protected"
            );
        }
        Ok(report)
    }

    /// Remove every artifact and record. Returns the number of languages removed.
    pub async fn clear(&self) -> Result<usize, CacheError> {
        let _gate = self.gate.write().await;
        let removed = self.store.clear().await?;
        info!(removed, "Grammar cache cleared");
        Ok(removed)
    }

    // ── preload ─────────────────────────────────────────────────────────

    /// Download every Tier-1 language, lowest `priority_within_tier` first,
    /// at most `max_concurrent_downloads` at a time. Tier-2/3 languages load
    /// on first use.
    pub async fn preload(self: &Arc<Self>) -> PreloadReport {
        self.preload_cancellable(&self.shutdown.child_token()).await
    }

    pub async fn preload_cancellable(
        self: &Arc<Self>,
        cancel: &CancellationToken,
    ) -> PreloadReport {
        let languages: Vec<String> = self
            .catalog
            .in_tier(Tier::Eager)
            .into_iter()
            .map(|p| p.name.clone())
            .collect();
        info!(
            languages = languages.len(),
            width = self.settings.max_concurrent_downloads,
            "Preloading Tier-1 grammars"
        );

        // Permits are taken before spawning so downloads start in priority
        // order.
        let permits = Arc::new(Semaphore::new(self.settings.max_concurrent_downloads));
        let mut tasks = JoinSet::new();
        let mut report = PreloadReport::default();
        for language in languages {
            let permit = tokio::select! {
                biased;
                _ = cancel.cancelled() => None,
                permit = Arc::clone(&permits).acquire_owned() => permit.ok(),
            };
            let Some(permit) = permit else {
                report.failed.push((language, CacheError::Cancelled.to_string()));
                continue;
            };
            let manager = Arc::clone(self);
            let cancel = cancel.clone();
            tasks.spawn(async move {
                let result = manager.ensure_record(&language, &cancel).await.map(|_| ());
                drop(permit);
                (language, result)
            });
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((language, Ok(()))) => report.ready.push(language),
                Ok((language, Err(e))) => {
                    warn!(language = %language, error = %e, "Tier-1 preload failed");
                    report.failed.push((language, e.to_string()));
                }
                Err(e) => warn!(error = %e, "Preload task panicked"),
            }
        }
        report.failed.sort();
        info!(
            ready = report.ready.len(),
            failed = report.failed.len(),
            "Tier-1 preload finished"
        );
        report
    }
}

/// Reject fetched bytes that do not match the profile.
fn check(
    fetched: FetchedArtifact,
    profile: &LanguageProfile,
    expected_hash: Option<&str>,
) -> Result<FetchedArtifact, FetchError> {
    if let Some(expected) = profile.expected_size_bytes {
        if fetched.size_bytes != expected {
            return Err(FetchError::SizeMismatch {
                expected,
                actual: fetched.size_bytes,
            });
        }
    }
    if let Some(expected) = expected_hash {
        if !IntegrityVerifier::matches(expected, &fetched.hash) {
            return Err(FetchError::HashMismatch {
                expected: expected.to_string(),
                actual: fetched.hash,
            });
        }
    }
    Ok(fetched)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::BoxFuture;
    use crate::cache::SourceKind;
    use crate::cache::store::PARTIAL_PREFIX;
    use std::path::Path;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    /// Serves fixed bytes for every URL containing "good", fails otherwise.
    struct FixedFetcher {
        body: Vec<u8>,
        calls: AtomicUsize,
        order: Mutex<Vec<String>>,
    }

    impl FixedFetcher {
        fn new(body: &[u8]) -> Arc<Self> {
            Arc::new(Self {
                body: body.to_vec(),
                calls: AtomicUsize::new(0),
                order: Mutex::new(Vec::new()),
            })
        }
    }

    impl ArtifactFetcher for FixedFetcher {
        fn name(&self) -> &str {
            "fixed"
        }

        fn fetch<'a>(
            &'a self,
            source: &'a str,
            dest: &'a Path,
        ) -> BoxFuture<'a, Result<FetchedArtifact, FetchError>> {
            Box::pin(async move {
                self.calls.fetch_add(1, Ordering::SeqCst);
                self.order.lock().unwrap().push(source.to_string());
                if !source.contains("good") {
                    return Err(FetchError::Network("connection refused".into()));
                }
                tokio::fs::write(dest, &self.body)
                    .await
                    .map_err(|e| FetchError::Io(e.to_string()))?;
                Ok(FetchedArtifact {
                    hash: IntegrityVerifier::hash_bytes(&self.body),
                    size_bytes: self.body.len() as u64,
                })
            })
        }
    }

    /// Writes a few bytes, then never finishes.
    struct StallingFetcher {
        started: tokio::sync::Notify,
    }

    impl ArtifactFetcher for StallingFetcher {
        fn name(&self) -> &str {
            "stalling"
        }

        fn fetch<'a>(
            &'a self,
            _source: &'a str,
            dest: &'a Path,
        ) -> BoxFuture<'a, Result<FetchedArtifact, FetchError>> {
            Box::pin(async move {
                tokio::fs::write(dest, b"half a grammar")
                    .await
                    .map_err(|e| FetchError::Io(e.to_string()))?;
                self.started.notify_one();
                std::future::pending().await
            })
        }
    }

    fn partials(dir: &Path) -> Vec<String> {
        std::fs::read_dir(dir)
            .map(|entries| {
                entries
                    .filter_map(Result::ok)
                    .map(|e| e.file_name().to_string_lossy().into_owned())
                    .filter(|name| name.starts_with(PARTIAL_PREFIX))
                    .collect()
            })
            .unwrap_or_default()
    }

    fn pinned(name: &str) -> LanguageProfile {
        LanguageProfile::new(name, format!("https://good/{name}"))
            .with_expected_hash(IntegrityVerifier::hash_bytes(b"rules"))
    }

    fn no_protection() -> EvictionPolicy {
        EvictionPolicy::default()
            .with_budget(0)
            .with_protect_recent(Duration::ZERO)
    }

    fn config(dir: &TempDir) -> CacheConfig {
        let mut config = CacheConfig {
            root: dir.path().join("cache").display().to_string(),
            ..CacheConfig::default()
        };
        config.retry.base_delay_ms = 1;
        config.retry.max_delay_ms = 2;
        config
    }

    async fn manager(
        config: &CacheConfig,
        profiles: Vec<LanguageProfile>,
        fetcher: Arc<FixedFetcher>,
    ) -> GrammarCacheManager {
        let catalog = Arc::new(LanguageCatalog::from_profiles(profiles));
        GrammarCacheManager::open_with_fetcher(config, catalog, fetcher)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_ensure_then_cached() {
        let dir = TempDir::new().unwrap();
        let fetcher = FixedFetcher::new(b"rules");
        let hash = IntegrityVerifier::hash_bytes(b"rules");
        let profile =
            LanguageProfile::new("python", "https://good/python").with_expected_hash(hash);
        let cache = manager(&config(&dir), vec![profile], fetcher.clone()).await;

        let first = cache.ensure_artifact("python").await.unwrap();
        let second = cache.ensure_artifact("python").await.unwrap();
        assert_eq!(first, second);
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 1);

        let record = cache.store().load_record("python").await.unwrap().unwrap();
        assert_eq!(record.access_count, 2);
        assert_eq!(record.integrity_state, IntegrityState::Verified);
        assert_eq!(record.source_kind, SourceKind::Primary);
    }

    #[tokio::test]
    async fn test_unknown_language() {
        let dir = TempDir::new().unwrap();
        let cache = manager(&config(&dir), Vec::new(), FixedFetcher::new(b"x")).await;
        assert!(matches!(
            cache.ensure_artifact("cobol").await,
            Err(CacheError::UnsupportedLanguage(_))
        ));
    }

    #[tokio::test]
    async fn test_require_hash_refuses_without_network() {
        let dir = TempDir::new().unwrap();
        let fetcher = FixedFetcher::new(b"rules");
        let profile = LanguageProfile::new("python", "https://good/python");
        let cache = manager(&config(&dir), vec![profile], fetcher.clone()).await;

        let err = cache.ensure_artifact("python").await.unwrap_err();
        assert!(matches!(
            err,
            CacheError::IntegrityFailure { ref sources, .. } if sources.is_empty()
        ));
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_trust_on_first_download_records_pending() {
        let dir = TempDir::new().unwrap();
        let mut config = config(&dir);
        config.trust_policy = TrustPolicy::TrustOnFirstDownload;
        let profile = LanguageProfile::new("python", "https://good/python");
        let cache = manager(&config, vec![profile], FixedFetcher::new(b"rules")).await;

        cache.ensure_artifact("python").await.unwrap();
        let record = cache.store().load_record("python").await.unwrap().unwrap();
        assert_eq!(record.integrity_state, IntegrityState::Pending);
        assert_eq!(record.content_hash, IntegrityVerifier::hash_bytes(b"rules"));

        assert!(cache.verify("python").await);
        let record = cache.store().load_record("python").await.unwrap().unwrap();
        assert_eq!(record.integrity_state, IntegrityState::Verified);
    }

    #[tokio::test]
    async fn test_size_mismatch_rejected() {
        let dir = TempDir::new().unwrap();
        let hash = IntegrityVerifier::hash_bytes(b"rules");
        let profile = LanguageProfile::new("python", "https://good/python")
            .with_expected_hash(hash)
            .with_expected_size(999);
        let fetcher = FixedFetcher::new(b"rules");
        let cache = manager(&config(&dir), vec![profile], fetcher.clone()).await;

        let err = cache.ensure_artifact("python").await.unwrap_err();
        assert!(matches!(err, CacheError::IntegrityFailure { .. }));
        // Integrity mismatches are not retried against the same source.
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 1);
        assert!(!cache.store().artifact_path("python").exists());
    }

    #[tokio::test]
    async fn test_cancelled_before_download() {
        let dir = TempDir::new().unwrap();
        let hash = IntegrityVerifier::hash_bytes(b"rules");
        let profile =
            LanguageProfile::new("python", "https://good/python").with_expected_hash(hash);
        let cache = manager(&config(&dir), vec![profile], FixedFetcher::new(b"rules")).await;

        let token = CancellationToken::new();
        token.cancel();
        let result = cache.ensure_artifact_cancellable("python", &token).await;
        assert!(matches!(result, Err(CacheError::Cancelled)));
        assert!(!cache.store().artifact_path("python").exists());
    }

    #[tokio::test]
    async fn test_verify_missing_is_false() {
        let dir = TempDir::new().unwrap();
        let cache = manager(&config(&dir), Vec::new(), FixedFetcher::new(b"x")).await;
        assert!(!cache.verify("python").await);
    }

    #[tokio::test]
    async fn test_describe_and_clear() {
        let dir = TempDir::new().unwrap();
        let hash = IntegrityVerifier::hash_bytes(b"rules");
        let profiles = vec![
            LanguageProfile::new("python", "https://good/python").with_expected_hash(hash.clone()),
            LanguageProfile::new("go", "https://good/go").with_expected_hash(hash),
        ];
        let cache = manager(&config(&dir), profiles, FixedFetcher::new(b"rules")).await;
        cache.ensure_artifact("go").await.unwrap();

        let snapshot = cache.describe_cache().await;
        assert_eq!(snapshot.len(), 2);
        assert!(snapshot["go"].is_some());
        assert!(snapshot["python"].is_none());

        assert_eq!(cache.clear().await.unwrap(), 1);
        assert!(cache.describe_cache().await["go"].is_none());
    }

    #[tokio::test]
    async fn test_health_reports_missing_tier1() {
        let dir = TempDir::new().unwrap();
        let hash = IntegrityVerifier::hash_bytes(b"rules");
        let profiles = vec![
            LanguageProfile::new("python", "https://good/python")
                .with_tier(Tier::Eager)
                .with_expected_hash(hash.clone()),
            LanguageProfile::new("typescript", "https://down/ts")
                .with_tier(Tier::Eager)
                .with_expected_hash(hash.clone()),
            LanguageProfile::new("go", "https://good/go").with_expected_hash(hash),
        ];
        let cache = Arc::new(manager(&config(&dir), profiles, FixedFetcher::new(b"rules")).await);

        let report = cache.preload().await;
        assert_eq!(report.ready, vec!["python".to_string()]);
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].0, "typescript");

        let health = cache.health().await;
        assert_eq!(health.verified, vec!["python".to_string()]);
        assert_eq!(health.missing, vec!["go".to_string(), "typescript".to_string()]);
        assert_eq!(health.missing_tier1, vec!["typescript".to_string()]);
        assert_eq!(health.total_bytes, 5);
        assert!(!health.is_healthy());
    }

    #[tokio::test]
    async fn test_evict_removes_orphans() {
        let dir = TempDir::new().unwrap();
        let cache = manager(&config(&dir), Vec::new(), FixedFetcher::new(b"x")).await;
        std::fs::create_dir_all(cache.store().language_dir("stale")).unwrap();

        let report = cache.evict(&EvictionPolicy::default()).await.unwrap();
        assert_eq!(report.orphans_removed, vec!["stale".to_string()]);
        assert!(!cache.store().language_dir("stale").exists());
    }

    #[tokio::test]
    async fn test_cancel_mid_download_removes_partial() {
        let dir = TempDir::new().unwrap();
        let fetcher = Arc::new(StallingFetcher {
            started: tokio::sync::Notify::new(),
        });
        let catalog = Arc::new(LanguageCatalog::from_profiles(vec![pinned("python")]));
        let cache = Arc::new(
            GrammarCacheManager::open_with_fetcher(&config(&dir), catalog, fetcher.clone())
                .await
                .unwrap(),
        );

        let token = CancellationToken::new();
        let task = {
            let cache = Arc::clone(&cache);
            let token = token.clone();
            tokio::spawn(async move { cache.ensure_artifact_cancellable("python", &token).await })
        };
        fetcher.started.notified().await;
        let language_dir = cache.store().language_dir("python");
        assert_eq!(partials(&language_dir).len(), 1);

        token.cancel();
        assert!(matches!(task.await.unwrap(), Err(CacheError::Cancelled)));
        assert!(partials(&language_dir).is_empty());
        assert!(!cache.store().artifact_path("python").exists());
        assert_eq!(cache.in_flight_count(), 0);
    }

    #[tokio::test]
    async fn test_default_policy_keeps_just_ensured_artifact() {
        let dir = TempDir::new().unwrap();
        let fetcher = FixedFetcher::new(b"rules");
        let cache = manager(&config(&dir), vec![pinned("python")], fetcher).await;

        let path = cache.ensure_artifact("python").await.unwrap();
        let report = cache.evict(&EvictionPolicy::default().with_budget(0)).await.unwrap();
        assert!(report.evicted.is_empty());
        assert!(!report.budget_satisfied);
        assert!(path.exists());
    }

    #[tokio::test]
    async fn test_leased_artifact_survives_eviction() {
        let dir = TempDir::new().unwrap();
        let fetcher = FixedFetcher::new(b"rules");
        let cache = manager(&config(&dir), vec![pinned("python")], fetcher).await;

        let lease = cache.lease("python", &CancellationToken::new()).await.unwrap();
        assert_eq!(lease.language(), "python");
        let report = cache.evict(&no_protection()).await.unwrap();
        assert!(report.evicted.is_empty());
        assert_eq!(std::fs::read(lease.path()).unwrap(), b"rules");

        drop(lease);
        let report = cache.evict(&no_protection()).await.unwrap();
        assert_eq!(report.evicted.len(), 1);
        assert!(!cache.store().artifact_path("python").exists());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_eviction_concurrent_with_leases() {
        let dir = TempDir::new().unwrap();
        let fetcher = FixedFetcher::new(b"rules");
        let cache = Arc::new(manager(&config(&dir), vec![pinned("python")], fetcher.clone()).await);

        let reader = {
            let cache = Arc::clone(&cache);
            tokio::spawn(async move {
                for _ in 0..25 {
                    let lease = cache.lease("python", &CancellationToken::new()).await.unwrap();
                    tokio::task::yield_now().await;
                    assert_eq!(tokio::fs::read(lease.path()).await.unwrap(), b"rules");
                }
            })
        };
        let evictor = {
            let cache = Arc::clone(&cache);
            tokio::spawn(async move {
                for _ in 0..25 {
                    cache.evict(&no_protection()).await.unwrap();
                    tokio::task::yield_now().await;
                }
            })
        };
        reader.await.unwrap();
        evictor.await.unwrap();
        assert!(fetcher.calls.load(Ordering::SeqCst) >= 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_preload_follows_priority_order() {
        let dir = TempDir::new().unwrap();
        let mut config = config(&dir);
        config.max_concurrent_downloads = 1;
        let profiles = vec![
            pinned("go").with_tier(Tier::Eager).with_priority(2),
            pinned("python").with_tier(Tier::Eager).with_priority(0),
            pinned("rust").with_tier(Tier::Eager).with_priority(1),
        ];
        let fetcher = FixedFetcher::new(b"rules");
        let cache = Arc::new(manager(&config, profiles, fetcher.clone()).await);

        let report = cache.preload().await;
        assert!(report.is_complete());
        assert_eq!(
            *fetcher.order.lock().unwrap(),
            vec![
                "https://good/python".to_string(),
                "https://good/rust".to_string(),
                "https://good/go".to_string(),
            ]
        );
        assert_eq!(report.ready, vec!["python", "rust", "go"]);
    }

    #[tokio::test]
    async fn test_in_flight_released_and_unknown_names_rejected() {
        let dir = TempDir::new().unwrap();
        let fetcher = FixedFetcher::new(b"rules");
        let cache = manager(&config(&dir), vec![pinned("python")], fetcher).await;

        cache.ensure_artifact("python").await.unwrap();
        assert_eq!(cache.in_flight_count(), 0);

        assert!(!cache.verify("../python").await);
        assert!(!cache.verify("../../etc").await);
        assert_eq!(cache.in_flight_count(), 0);
        assert!(cache.verify("Python").await);
    }
}
