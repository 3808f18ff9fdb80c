#![deny(unsafe_code)]

//! Shared test utilities for the parsekit workspace.
//!
//! Provides config builders, a scripted artifact fetcher, a temp-dir backed
//! cache and tracing helpers so that individual crate tests stay concise.
//!
//! Add this crate as a `[dev-dependency]` in any workspace member:
//!
//! ```toml
//! [dev-dependencies]
//! parsekit-test-utils = { workspace = true }
//! ```

pub mod cache;
pub mod config;
pub mod fetcher;
pub mod grammars;
pub mod tracing_setup;

pub use cache::TestCache;
pub use config::{ProfileBuilder, TestConfigBuilder};
pub use fetcher::{Response, ScriptedFetcher};
pub use tracing_setup::init_test_tracing;
