//! Text completion service seam.
//!
//! Everything that talks to a model goes through `TextCompletionService`.
//! `GatedService` adds the shared concurrency gate and per-call timeout;
//! `ScriptedService` replays canned responses for tests and `--replay`.

use std::collections::VecDeque;
use std::sync::mpsc;
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

use tracing::warn;

use crate::llm::gate::CompletionGate;

/// Per-call generation settings
#[derive(Debug, Clone, PartialEq)]
pub struct GenerateOptions
{
    pub json_mode: bool,
    pub temperature: f32,
    pub seed: Option<u64>,
    pub timeout: Duration,
}

impl Default for GenerateOptions
{
    fn default() -> Self
    {
        Self { json_mode: true, temperature: 0.0, seed: None, timeout: Duration::from_secs(30) }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ServiceError
{
    #[error("completion service unavailable: {0}")]
    Unavailable(String),

    #[error("completion timed out after {timeout_ms} ms")]
    Timeout
    {
        timeout_ms: u64,
    },

    #[error("completion failed: {0}")]
    Failed(String),
}

impl ServiceError
{
    /// Short code used in logs and repair prompts
    pub fn code(&self) -> &'static str
    {
        match self
        {
            ServiceError::Unavailable(_) => "unavailable",
            ServiceError::Timeout { .. } => "timeout",
            ServiceError::Failed(_) => "failed",
        }
    }
}

pub trait TextCompletionService: Send + Sync
{
    /// Raw model output; callers must treat it as untrusted text
    fn generate(
        &self,
        system_prompt: &str,
        user_prompt: &str,
        options: &GenerateOptions,
    ) -> Result<String, ServiceError>;
}

/// Service used when no model is configured
#[derive(Debug, Clone, Default)]
pub struct UnavailableService;

impl TextCompletionService for UnavailableService
{
    fn generate(
        &self,
        _system_prompt: &str,
        _user_prompt: &str,
        _options: &GenerateOptions,
    ) -> Result<String, ServiceError>
    {
        Err(ServiceError::Unavailable("no completion backend configured".to_string()))
    }
}

/// One recorded call to a `ScriptedService`
#[derive(Debug, Clone, PartialEq)]
pub struct RecordedCall
{
    pub system_prompt: String,
    pub user_prompt: String,
    pub options: GenerateOptions,
}

/// Replays queued responses in order; `None` entries fail the call
#[derive(Debug, Default)]
pub struct ScriptedService
{
    responses: Mutex<VecDeque<Option<String>>>,
    calls: Mutex<Vec<RecordedCall>>,
}

impl ScriptedService
{
    pub fn new<I>(responses: I) -> Self
    where
        I: IntoIterator<Item = Option<String>>,
    {
        Self {
            responses: Mutex::new(
                responses
                    .into_iter()
                    .collect(),
            ),
            calls: Mutex::new(Vec::new()),
        }
    }

    /// Every response succeeds with the given text
    pub fn replies<I, S>(responses: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::new(
            responses
                .into_iter()
                .map(|r| Some(r.into())),
        )
    }

    /// Parse a JSON array of strings and nulls
    pub fn from_json(raw: &str) -> Result<Self, serde_json::Error>
    {
        let items: Vec<Option<String>> = serde_json::from_str(raw)?;
        Ok(Self::new(items))
    }

    pub fn calls(&self) -> Vec<RecordedCall>
    {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn call_count(&self) -> usize
    {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn remaining(&self) -> usize
    {
        self.responses
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

impl TextCompletionService for ScriptedService
{
    fn generate(
        &self,
        system_prompt: &str,
        user_prompt: &str,
        options: &GenerateOptions,
    ) -> Result<String, ServiceError>
    {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(RecordedCall {
                system_prompt: system_prompt.to_string(),
                user_prompt: user_prompt.to_string(),
                options: options.clone(),
            });

        let next = self
            .responses
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front();

        match next
        {
            Some(Some(text)) => Ok(text),
            Some(None) => Err(ServiceError::Failed("scripted failure".to_string())),
            None => Err(ServiceError::Unavailable("script exhausted".to_string())),
        }
    }
}

/// Routes every call through the shared gate and enforces its timeout
#[derive(Clone)]
pub struct GatedService
{
    inner: Arc<dyn TextCompletionService>,
    gate: Arc<CompletionGate>,
}

impl std::fmt::Debug for GatedService
{
    fn fmt(
        &self,
        f: &mut std::fmt::Formatter<'_>,
    ) -> std::fmt::Result
    {
        f.debug_struct("GatedService")
            .field("gate", &self.gate)
            .finish_non_exhaustive()
    }
}

impl GatedService
{
    pub fn new(
        inner: Arc<dyn TextCompletionService>,
        gate: Arc<CompletionGate>,
    ) -> Self
    {
        Self { inner, gate }
    }

    pub fn gate(&self) -> &Arc<CompletionGate>
    {
        &self.gate
    }
}

impl TextCompletionService for GatedService
{
    fn generate(
        &self,
        system_prompt: &str,
        user_prompt: &str,
        options: &GenerateOptions,
    ) -> Result<String, ServiceError>
    {
        let permit = self
            .gate
            .acquire_owned();
        let started = Instant::now();

        // The worker holds the permit until the backend returns, so a timed
        // out call keeps its slot and later callers queue behind it
        let (tx, rx) = mpsc::channel();
        let inner = Arc::clone(&self.inner);
        let (system, user, opts) = (system_prompt.to_string(), user_prompt.to_string(), options.clone());

        thread::Builder::new()
            .name("snapdiff-completion".to_string())
            .spawn(move || {
                let result = inner.generate(&system, &user, &opts);
                drop(permit);
                let _ = tx.send(result);
            })
            .map_err(|e| ServiceError::Failed(format!("spawn worker: {e}")))?;

        match rx.recv_timeout(options.timeout)
        {
            Ok(result) => result,
            Err(mpsc::RecvTimeoutError::Timeout) =>
            {
                let timeout_ms = options
                    .timeout
                    .as_millis() as u64;
                warn!(timeout_ms, elapsed_ms = started.elapsed().as_millis() as u64, "completion_timeout");
                Err(ServiceError::Timeout { timeout_ms })
            }
            Err(mpsc::RecvTimeoutError::Disconnected) =>
            {
                Err(ServiceError::Failed("completion worker exited without a result".to_string()))
            }
        }
    }
}
