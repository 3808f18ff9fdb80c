#![deny(unsafe_code)]

//! parsekit core: grammar artifact cache and parsing backend selection.
//!
//! The [`cache`] module downloads, verifies and evicts per-language grammar
//! artifacts. [`runtime`] probes the parsing backends and picks one for the
//! session, and [`adapter`] defines the contract every backend satisfies.
//! [`ParseService`] wires them together from an
//! [`AppConfig`](parsekit_config::AppConfig).

use std::future::Future;
use std::pin::Pin;

/// A type-erased, `Send`-safe, boxed future, the return type for async trait
/// methods that are called through `dyn Trait`.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Parsing backends and the uniform adapter contract.
pub mod adapter;
/// Compile-time build metadata (version, git hash, profile).
pub mod build_info;
/// Grammar artifact download, verification, and eviction.
pub mod cache;
/// Language lookup by name, alias, and file extension.
pub mod catalog;
/// Backend capability probing and selection.
pub mod runtime;
/// Composition root used by the CLI.
pub mod service;

pub use adapter::{
    BatchAborted, BatchOptions, BatchProgress, BatchResults, NodeId, ParseFailure,
    ParseFailureKind, ParseOutcome, ParsedSource, ParsingAdapter, Span, SyntaxNode,
};
pub use cache::{ArtifactRecord, CacheError, GrammarCacheManager};
pub use catalog::LanguageCatalog;
pub use runtime::{
    BackendHandle, BackendKind, CapabilityProbe, CapabilityResult, RuntimeError, RuntimeSelector,
};
pub use service::{ParseService, ServiceError};
