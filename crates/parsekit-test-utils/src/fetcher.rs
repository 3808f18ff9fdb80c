//! An [`ArtifactFetcher`] that serves scripted responses per URL.
//!
//! Every call is logged, so tests can count network accesses.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;

use parsekit_core::BoxFuture;
use parsekit_core::cache::fetch::StagingWriter;
use parsekit_core::cache::{ArtifactFetcher, FetchError, FetchedArtifact};

/// One scripted answer.
#[derive(Debug, Clone)]
pub enum Response {
    /// Write these bytes to the destination.
    Serve(Vec<u8>),
    /// Fail without writing.
    Fail(FetchError),
}

#[derive(Debug, Default)]
struct State {
    scripts: HashMap<String, Vec<Response>>,
    served: HashMap<String, usize>,
    calls: Vec<String>,
}

/// Fetcher whose responses are set up per URL.
///
/// A script is consumed in order; its last response repeats. URLs without a
/// script answer `NotFound`.
#[derive(Debug, Default)]
pub struct ScriptedFetcher {
    state: Mutex<State>,
    delay: Duration,
}

impl ScriptedFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait this long inside every fetch.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Always serve `bytes` from `url`.
    pub fn serve(self, url: &str, bytes: impl Into<Vec<u8>>) -> Self {
        self.script(url, vec![Response::Serve(bytes.into())])
    }

    /// Always fail `url` with `error`.
    pub fn fail(self, url: &str, error: FetchError) -> Self {
        self.script(url, vec![Response::Fail(error)])
    }

    pub fn script(self, url: &str, responses: Vec<Response>) -> Self {
        self.set_script(url, responses);
        self
    }

    /// Replace the script for `url` on a shared fetcher.
    pub fn set_script(&self, url: &str, responses: Vec<Response>) {
        let mut state = self.state.lock().unwrap();
        state.scripts.insert(url.to_string(), responses);
        state.served.remove(url);
    }

    /// Every URL fetched, in call order.
    pub fn calls(&self) -> Vec<String> {
        self.state.lock().unwrap().calls.clone()
    }

    pub fn calls_to(&self, url: &str) -> usize {
        self.state
            .lock()
            .unwrap()
            .calls
            .iter()
            .filter(|u| *u == url)
            .count()
    }

    pub fn total_calls(&self) -> usize {
        self.state.lock().unwrap().calls.len()
    }

    fn next_response(&self, url: &str) -> Option<Response> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(url.to_string());
        let index = *state.served.get(url).unwrap_or(&0);
        let script = state.scripts.get(url)?;
        let response = script.get(index).or_else(|| script.last())?.clone();
        state.served.insert(url.to_string(), index + 1);
        Some(response)
    }
}

impl ArtifactFetcher for ScriptedFetcher {
    fn name(&self) -> &str {
        "scripted"
    }

    fn fetch<'a>(
        &'a self,
        source: &'a str,
        dest: &'a Path,
    ) -> BoxFuture<'a, Result<FetchedArtifact, FetchError>> {
        Box::pin(async move {
            let response = self.next_response(source);
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            match response {
                None => Err(FetchError::NotFound(source.to_string())),
                Some(Response::Fail(error)) => Err(error),
                Some(Response::Serve(bytes)) => {
                    let mut writer = StagingWriter::create(dest).await?;
                    writer.write(&bytes).await?;
                    writer.finish().await
                }
            }
        })
    }
}
