use std::sync::{Arc, Mutex};

use parsekit_config::RuntimePreference;
use tracing::{info, warn};

use super::{BackendHandle, BackendKind, CapabilityProbe, RuntimeError};

/// Picks the active backend for a session.
///
/// The choice is cached and reused until the probe is reset; a call after
/// [`CapabilityProbe::reset`] re-evaluates from scratch.
pub struct RuntimeSelector {
    probe: Arc<CapabilityProbe>,
    preference: RuntimePreference,
    selected: Mutex<Option<(u64, BackendHandle)>>,
}

impl RuntimeSelector {
    pub fn new(probe: Arc<CapabilityProbe>, preference: RuntimePreference) -> Self {
        Self {
            probe,
            preference,
            selected: Mutex::new(None),
        }
    }

    pub fn probe(&self) -> &Arc<CapabilityProbe> {
        &self.probe
    }

    pub fn preference(&self) -> RuntimePreference {
        self.preference
    }

    /// Backends considered, in order.
    pub fn candidates(&self) -> Vec<BackendKind> {
        match self.preference {
            RuntimePreference::Auto => BackendKind::PREFERENCE_ORDER.to_vec(),
            RuntimePreference::Native => vec![BackendKind::Native],
            RuntimePreference::Sandboxed => vec![BackendKind::Sandboxed],
            RuntimePreference::ExternalProcess => vec![BackendKind::ExternalProcess],
        }
    }

    fn cached(&self, generation: u64) -> Option<BackendHandle> {
        let selected = self
            .selected
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        match &*selected {
            Some((cached_generation, handle)) if *cached_generation == generation => {
                Some(handle.clone())
            }
            _ => None,
        }
    }

    /// The first available backend in preference order.
    ///
    /// `NoRuntimeAvailable` carries the diagnostic of every backend probed.
    /// It is not retried here; reset the probe and call again after fixing
    /// the environment.
    pub async fn select_backend(&self) -> Result<BackendHandle, RuntimeError> {
        let generation = self.probe.generation();
        if let Some(handle) = self.cached(generation) {
            return Ok(handle);
        }

        let mut diagnostics = Vec::new();
        for kind in self.candidates() {
            let result = self.probe.probe(kind).await;
            if result.available {
                if let Some(adapter) = self.probe.backend(kind) {
                    let handle = BackendHandle::new(adapter);
                    info!(
                        backend = %kind,
                        preference = %self.preference,
                        "Selected parsing backend"
                    );
                    let mut selected = self
                        .selected
                        .lock()
                        .unwrap_or_else(|poisoned| poisoned.into_inner());
                    *selected = Some((generation, handle.clone()));
                    return Ok(handle);
                }
            }
            diagnostics.push(result);
        }

        warn!(
            preference = %self.preference,
            probed = diagnostics.len(),
            "No parsing backend available"
        );
        Err(RuntimeError::NoRuntimeAvailable { diagnostics })
    }
}
