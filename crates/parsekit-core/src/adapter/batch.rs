use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, warn};

use super::{
    BatchAborted, BatchOptions, BatchProgress, BatchResults, ParseFailure, ParseFailureKind,
    ParseOutcome, ParsingAdapter,
};
use crate::BoxFuture;

/// Read, detect and parse every path on `adapter`, at most
/// `options.concurrency_limit` at a time.
///
/// Each outcome is recorded as soon as its task finishes. A task that
/// panics is recorded as a `BackendInternalError` for its path. With
/// `continue_on_error` unset the first failure aborts the remaining tasks.
pub fn run<A>(
    adapter: Arc<A>,
    paths: Vec<PathBuf>,
    options: BatchOptions,
) -> BoxFuture<'static, Result<BatchResults, BatchAborted>>
where
    A: ParsingAdapter + ?Sized,
{
    Box::pin(async move {
        let total = paths.len();
        let semaphore = Arc::new(Semaphore::new(options.concurrency_limit.max(1)));
        let mut tasks = JoinSet::new();
        let mut pending: HashMap<tokio::task::Id, PathBuf> = HashMap::with_capacity(total);

        for path in paths {
            let adapter = adapter.clone();
            let semaphore = semaphore.clone();
            let task_path = path.clone();
            let handle = tasks.spawn(async move {
                match semaphore.acquire_owned().await {
                    Ok(_permit) => parse_path(adapter.as_ref(), &task_path).await,
                    Err(_) => Err(ParseFailure::new(
                        ParseFailureKind::BackendInternalError,
                        "batch scheduler closed",
                    )
                    .with_path(&task_path)),
                }
            });
            pending.insert(handle.id(), path);
        }

        let mut results = BatchResults::new();
        loop {
            let joined = tokio::select! {
                biased;
                _ = options.cancel.cancelled() => {
                    tasks.abort_all();
                    debug!(completed = results.len(), total, "Batch cancelled");
                    return Err(BatchAborted::Cancelled { completed: results, total });
                }
                joined = tasks.join_next_with_id() => joined,
            };
            let Some(joined) = joined else { break };

            let (id, outcome) = match joined {
                Ok((id, outcome)) => (id, outcome),
                Err(e) => {
                    warn!(error = %e, "Parse task did not complete");
                    let failure = ParseFailure::new(
                        ParseFailureKind::BackendInternalError,
                        format!("parse task failed: {e}"),
                    );
                    (e.id(), Err(failure))
                }
            };
            let Some(path) = pending.remove(&id) else {
                continue;
            };
            let outcome = outcome.map_err(|failure| match failure.path {
                Some(_) => failure,
                None => failure.with_path(&path),
            });

            if let Some(callback) = &options.on_progress {
                callback(&BatchProgress {
                    completed: results.len() + 1,
                    total,
                    path: path.clone(),
                    succeeded: outcome.is_ok(),
                });
            }

            match outcome {
                Err(failure) if !options.continue_on_error => {
                    tasks.abort_all();
                    warn!(path = %path.display(), error = %failure, "Batch aborted on failure");
                    return Err(BatchAborted::Failed {
                        path,
                        failure,
                        completed: results,
                    });
                }
                outcome => {
                    results.insert(path, outcome);
                }
            }
        }

        debug!(
            total,
            failed = results.values().filter(|o| o.is_err()).count(),
            "Batch complete"
        );
        Ok(results)
    })
}

async fn parse_path<A>(adapter: &A, path: &Path) -> ParseOutcome
where
    A: ParsingAdapter + ?Sized,
{
    let source = tokio::fs::read_to_string(path)
        .await
        .map_err(|e| ParseFailure::source_read(path, e))?;
    let language = match adapter.catalog().detect(path) {
        Some(profile) => profile.name.clone(),
        None => {
            return Err(ParseFailure::new(
                ParseFailureKind::UnsupportedLanguage,
                format!("no language claims {}", path.display()),
            )
            .with_path(path));
        }
    };
    adapter
        .parse_one(&source, &language, Some(path))
        .await
        .map_err(|failure| match failure.path {
            Some(_) => failure,
            None => failure.with_path(path),
        })
}
