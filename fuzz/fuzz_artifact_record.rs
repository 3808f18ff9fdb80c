//! Fuzz target for decoding persisted artifact records.
//!
//! Run with: cargo +nightly fuzz run fuzz_artifact_record

#![no_main]

use libfuzzer_sys::fuzz_target;
use parsekit_core::cache::ArtifactRecord;

fuzz_target!(|data: &[u8]| {
    if let Ok(record) = serde_json::from_slice::<ArtifactRecord>(data) {
        let _ = record.is_usable();
        let encoded = serde_json::to_vec(&record).unwrap_or_default();
        let again: ArtifactRecord =
            serde_json::from_slice(&encoded).expect("re-encoded record decodes");
        assert_eq!(record, again);
    }
});
