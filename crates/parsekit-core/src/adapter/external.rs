//! A separate parser process driven over JSON stdio.
//!
//! Invocations:
//!
//! | Command | stdin | `data` on success |
//! |---------|-------|-------------------|
//! | `--version` | | (plain text) |
//! | `parse --stdin --language <lang> [--file-path <p>]` | source text | `{nodes: [...]}` |
//! | `batch --stdin` | `{files: [{source_code, file_path, language}], max_concurrency}` | `{results: [{file_path, success, nodes, error}]}` |
//!
//! Every response is an envelope `{success, data, error}`. A process that
//! cannot be spawned, times out, or exits without a readable envelope is
//! `BackendUnavailable`; an envelope with `success: false` is
//! `BackendInternalError`.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use parsekit_config::ExternalProcessConfig;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

use super::{
    BatchAborted, BatchOptions, BatchProgress, BatchResults, ParseFailure, ParseFailureKind,
    ParseOutcome, ParsedSource, ParsingAdapter, RawNode, batch,
};
use crate::BoxFuture;
use crate::catalog::LanguageCatalog;
use crate::runtime::BackendKind;

#[derive(Debug, Deserialize)]
struct Envelope<T> {
    success: bool,
    data: Option<T>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ParseData {
    nodes: Vec<RawNode>,
}

#[derive(Debug, Serialize)]
struct BatchRequest<'a> {
    files: Vec<BatchFile<'a>>,
    max_concurrency: usize,
}

#[derive(Debug, Serialize)]
struct BatchFile<'a> {
    source_code: &'a str,
    file_path: String,
    language: &'a str,
}

#[derive(Debug, Deserialize)]
struct BatchData {
    results: Vec<BatchItem>,
}

#[derive(Debug, Deserialize)]
struct BatchItem {
    file_path: String,
    success: bool,
    #[serde(default)]
    nodes: Vec<RawNode>,
    #[serde(default)]
    error: Option<String>,
}

/// Runs an external parser for every request.
pub struct ExternalProcessBackend {
    config: ExternalProcessConfig,
    catalog: Arc<LanguageCatalog>,
}

impl ExternalProcessBackend {
    pub fn new(config: ExternalProcessConfig, catalog: Arc<LanguageCatalog>) -> Self {
        Self { config, catalog }
    }

    fn timeout(&self) -> Duration {
        Duration::from_secs(self.config.timeout_secs)
    }

    fn unavailable(&self, detail: impl std::fmt::Display) -> ParseFailure {
        ParseFailure::new(
            ParseFailureKind::BackendUnavailable,
            format!("{}: {detail}", self.config.program),
        )
    }

    /// Run the process with `command` appended to the configured arguments,
    /// feeding `input` on stdin. Returns stdout and whether the exit was clean.
    async fn invoke(
        &self,
        command: &[&str],
        input: Vec<u8>,
    ) -> Result<(Vec<u8>, bool), ParseFailure> {
        let mut child = tokio::process::Command::new(&self.config.program)
            .args(&self.config.args)
            .args(command)
            .envs(&self.config.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| self.unavailable(format!("spawn failed: {e}")).with_cause(e))?;

        if let Some(mut stdin) = child.stdin.take() {
            tokio::spawn(async move {
                if let Err(e) = stdin.write_all(&input).await {
                    // The process may exit before reading everything.
                    if e.kind() != std::io::ErrorKind::BrokenPipe {
                        debug!(error = %e, "Failed to write parser stdin");
                    }
                }
            });
        }

        let output = match tokio::time::timeout(self.timeout(), child.wait_with_output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => return Err(self.unavailable(format!("wait failed: {e}")).with_cause(e)),
            Err(_) => {
                return Err(self.unavailable(format!("timed out after {:?}", self.timeout())));
            }
        };
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            debug!(
                status = %output.status,
                stderr = %stderr.trim(),
                "Parser process exited with failure"
            );
        }
        Ok((output.stdout, output.status.success()))
    }

    fn decode<T: DeserializeOwned>(
        &self,
        stdout: &[u8],
        clean_exit: bool,
    ) -> Result<T, ParseFailure> {
        let envelope: Envelope<T> = match serde_json::from_slice(stdout) {
            Ok(envelope) => envelope,
            Err(e) if clean_exit => {
                return Err(self.unavailable(format!("malformed response: {e}")).with_cause(e));
            }
            Err(_) => return Err(self.unavailable("exited with failure and no response")),
        };
        if !envelope.success {
            return Err(ParseFailure::new(
                ParseFailureKind::BackendInternalError,
                envelope
                    .error
                    .unwrap_or_else(|| "parser reported failure".to_string()),
            ));
        }
        envelope
            .data
            .ok_or_else(|| self.unavailable("response carries no data"))
    }

    fn canonical(&self, language: &str) -> Result<String, ParseFailure> {
        self.catalog
            .canonical_name(language)
            .map(str::to_string)
            .ok_or_else(|| ParseFailure::unsupported_language(language))
    }

    async fn parse_batch(
        &self,
        files: &[(PathBuf, String, String)],
        concurrency: usize,
    ) -> Result<HashMap<String, BatchItem>, ParseFailure> {
        let request = BatchRequest {
            files: files
                .iter()
                .map(|(path, language, source)| BatchFile {
                    source_code: source,
                    file_path: path.to_string_lossy().into_owned(),
                    language,
                })
                .collect(),
            max_concurrency: concurrency,
        };
        let input = serde_json::to_vec(&request).map_err(|e| {
            ParseFailure::new(ParseFailureKind::BackendInternalError, e.to_string()).with_cause(e)
        })?;
        let (stdout, clean) = self.invoke(&["batch", "--stdin"], input).await?;
        let data: BatchData = self.decode(&stdout, clean)?;
        Ok(data
            .results
            .into_iter()
            .map(|item| (item.file_path.clone(), item))
            .collect())
    }

    async fn run_batch(
        self: Arc<Self>,
        paths: Vec<PathBuf>,
        options: BatchOptions,
    ) -> Result<BatchResults, BatchAborted> {
        let total = paths.len();
        let mut results = BatchResults::new();
        let mut ready = Vec::new();

        for path in paths {
            let outcome = match tokio::fs::read_to_string(&path).await {
                Err(e) => Err(ParseFailure::source_read(&path, e)),
                Ok(source) => match self.catalog.detect(&path) {
                    Some(profile) => {
                        ready.push((path, profile.name.clone(), source));
                        continue;
                    }
                    None => Err(ParseFailure::new(
                        ParseFailureKind::UnsupportedLanguage,
                        format!("no language claims {}", path.display()),
                    )
                    .with_path(&path)),
                },
            };
            results.insert(path, outcome);
        }

        if ready.is_empty() {
            debug!(total, "Nothing readable to send to the parser");
            return report(results, total, &options);
        }

        let batch = tokio::select! {
            biased;
            _ = options.cancel.cancelled() => {
                return Err(BatchAborted::Cancelled { completed: results, total });
            }
            batch = self.parse_batch(&ready, options.concurrency_limit.max(1)) => batch,
        };

        let mut by_path = match batch {
            Ok(by_path) => by_path,
            Err(failure) => {
                warn!(
                    error = %failure,
                    files = ready.len(),
                    "Batch invocation failed, parsing sequentially"
                );
                let paths = results
                    .keys()
                    .cloned()
                    .chain(ready.into_iter().map(|(p, _, _)| p))
                    .collect();
                return batch::run(self, paths, options.with_concurrency(1)).await;
            }
        };

        for (path, language, _) in ready {
            let key = path.to_string_lossy().into_owned();
            let outcome = match by_path.remove(&key) {
                Some(item) if item.success => Ok(ParsedSource::from_raw(
                    &language,
                    Some(path.as_path()),
                    BackendKind::ExternalProcess,
                    item.nodes,
                )),
                Some(item) => Err(ParseFailure::new(
                    ParseFailureKind::BackendInternalError,
                    item.error.unwrap_or_else(|| "parser reported failure".to_string()),
                )
                .with_path(&path)),
                None => Err(ParseFailure::new(
                    ParseFailureKind::BackendInternalError,
                    "parser returned no result for this file",
                )
                .with_path(&path)),
            };
            results.insert(path, outcome);
        }

        report(results, total, &options)
    }
}

/// Replay collected outcomes through the progress callback in path order,
/// stopping at the first failure when the batch is fail-fast.
fn report(
    results: BatchResults,
    total: usize,
    options: &BatchOptions,
) -> Result<BatchResults, BatchAborted> {
    let mut reported = BatchResults::new();
    for (path, outcome) in results {
        if let Some(callback) = &options.on_progress {
            callback(&BatchProgress {
                completed: reported.len() + 1,
                total,
                path: path.clone(),
                succeeded: outcome.is_ok(),
            });
        }
        match outcome {
            Err(failure) if !options.continue_on_error => {
                return Err(BatchAborted::Failed {
                    path,
                    failure,
                    completed: reported,
                });
            }
            outcome => {
                reported.insert(path, outcome);
            }
        }
    }
    Ok(reported)
}

impl ParsingAdapter for ExternalProcessBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::ExternalProcess
    }

    fn catalog(&self) -> &LanguageCatalog {
        &self.catalog
    }

    fn probe(&self) -> BoxFuture<'_, Result<String, String>> {
        Box::pin(async move {
            match self.invoke(&["--version"], Vec::new()).await {
                Ok((stdout, true)) => {
                    let version = String::from_utf8_lossy(&stdout).trim().to_string();
                    info!(
                        program = %self.config.program,
                        version = %version,
                        "External parser found"
                    );
                    Ok(version)
                }
                Ok((_, false)) => Err(format!("{} --version failed", self.config.program)),
                Err(failure) => Err(failure.message),
            }
        })
    }

    fn parse_one<'a>(
        &'a self,
        source: &'a str,
        language: &'a str,
        path_hint: Option<&'a Path>,
    ) -> BoxFuture<'a, ParseOutcome> {
        Box::pin(async move {
            let language = self.canonical(language)?;
            let hint = path_hint.map(|p| p.to_string_lossy().into_owned());
            let mut command = vec!["parse", "--stdin", "--language", language.as_str()];
            if let Some(hint) = &hint {
                command.extend(["--file-path", hint.as_str()]);
            }

            let (stdout, clean) = self.invoke(&command, source.as_bytes().to_vec()).await?;
            let data: ParseData = self.decode(&stdout, clean)?;
            Ok(ParsedSource::from_raw(
                &language,
                path_hint,
                BackendKind::ExternalProcess,
                data.nodes,
            ))
        })
    }

    /// One `batch` invocation for every readable file. When that invocation
    /// fails the files are parsed one at a time instead.
    fn parse_many(
        self: Arc<Self>,
        paths: Vec<PathBuf>,
        options: BatchOptions,
    ) -> BoxFuture<'static, Result<BatchResults, BatchAborted>> {
        Box::pin(self.run_batch(paths, options))
    }
}
