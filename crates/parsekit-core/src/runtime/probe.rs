use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::Utc;
use tracing::{debug, info};

use super::{BackendKind, CapabilityResult};
use crate::adapter::ParsingAdapter;

/// Probes backends and remembers the answers until [`reset`](Self::reset).
///
/// Probing never fails: an unavailable backend, a probe error and a probe
/// timeout all produce a result with `available = false` and a diagnostic.
pub struct CapabilityProbe {
    backends: BTreeMap<BackendKind, Arc<dyn ParsingAdapter>>,
    results: Mutex<HashMap<BackendKind, CapabilityResult>>,
    generation: AtomicU64,
    timeout: Duration,
}

impl CapabilityProbe {
    /// Create a probe with no registered backends.
    pub fn new(timeout: Duration) -> Self {
        Self {
            backends: BTreeMap::new(),
            results: Mutex::new(HashMap::new()),
            generation: AtomicU64::new(0),
            timeout,
        }
    }

    /// Register a backend under its own kind, replacing any previous one.
    pub fn with_backend(mut self, adapter: Arc<dyn ParsingAdapter>) -> Self {
        self.backends.insert(adapter.kind(), adapter);
        self
    }

    /// The registered implementation of `kind`.
    pub fn backend(&self, kind: BackendKind) -> Option<Arc<dyn ParsingAdapter>> {
        self.backends.get(&kind).cloned()
    }

    /// Registered backend kinds, in preference order.
    pub fn registered(&self) -> Vec<BackendKind> {
        self.backends.keys().copied().collect()
    }

    /// Incremented by every [`reset`](Self::reset).
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    fn results(&self) -> MutexGuard<'_, HashMap<BackendKind, CapabilityResult>> {
        self.results
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// The memoized result for `kind`, without probing.
    pub fn cached(&self, kind: BackendKind) -> Option<CapabilityResult> {
        self.results().get(&kind).cloned()
    }

    /// Probe `kind`, or return the memoized result.
    pub async fn probe(&self, kind: BackendKind) -> CapabilityResult {
        if let Some(result) = self.cached(kind) {
            return result;
        }

        let generation = self.generation();
        let (available, message) = match self.backends.get(&kind) {
            None => (false, "backend not configured".to_string()),
            Some(adapter) => match tokio::time::timeout(self.timeout, adapter.probe()).await {
                Ok(Ok(detail)) => (true, detail),
                Ok(Err(diagnostic)) => (false, diagnostic),
                Err(_) => (false, format!("probe timed out after {:?}", self.timeout)),
            },
        };
        let result = CapabilityResult {
            backend_kind: kind,
            available,
            probed_at: Utc::now(),
            message,
        };
        info!(
            backend = %kind,
            available,
            message = %result.message,
            "Probed parsing backend"
        );

        let mut results = self.results();
        // A reset while probing invalidates this answer for everyone else.
        if self.generation() != generation {
            return result;
        }
        results.entry(kind).or_insert(result).clone()
    }

    /// Forget every memoized result.
    pub fn reset(&self) {
        let mut results = self.results();
        results.clear();
        self.generation.fetch_add(1, Ordering::AcqRel);
        debug!("Capability probe cache reset");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::testing::StubAdapter;

    #[tokio::test]
    async fn test_probe_memoizes() {
        let stub = StubAdapter::new(BackendKind::Native, true);
        let probe = CapabilityProbe::new(Duration::from_secs(1)).with_backend(stub.clone());

        let first = probe.probe(BackendKind::Native).await;
        let second = probe.probe(BackendKind::Native).await;
        assert!(first.available);
        assert_eq!(first, second);
        assert_eq!(stub.probe_calls(), 1);
    }

    #[tokio::test]
    async fn test_reset_forces_reprobe() {
        let stub = StubAdapter::new(BackendKind::Sandboxed, false);
        let probe = CapabilityProbe::new(Duration::from_secs(1)).with_backend(stub.clone());

        assert!(!probe.probe(BackendKind::Sandboxed).await.available);
        stub.set_available(true);
        assert!(!probe.probe(BackendKind::Sandboxed).await.available);

        probe.reset();
        assert_eq!(probe.generation(), 1);
        assert!(probe.cached(BackendKind::Sandboxed).is_none());
        assert!(probe.probe(BackendKind::Sandboxed).await.available);
        assert_eq!(stub.probe_calls(), 2);
    }

    #[tokio::test]
    async fn test_unregistered_backend_is_unavailable() {
        let probe = CapabilityProbe::new(Duration::from_secs(1));
        let result = probe.probe(BackendKind::ExternalProcess).await;
        assert!(!result.available);
        assert_eq!(result.message, "backend not configured");
    }

    #[tokio::test]
    async fn test_probe_timeout_is_unavailable() {
        let stub = StubAdapter::slow(BackendKind::Native, Duration::from_secs(5));
        let probe = CapabilityProbe::new(Duration::from_millis(20)).with_backend(stub);
        let result = probe.probe(BackendKind::Native).await;
        assert!(!result.available);
        assert!(result.message.contains("timed out"));
    }
}
