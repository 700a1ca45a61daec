// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! The model-backend seam.
//!
//! Transcription and translation models live behind [`ModelBackend`]; the
//! orchestrator and engine only ever see this trait. Real implementations
//! wrap GPU inference processes; [`ScriptedBackend`] is the in-process
//! double used by the test suites and by local development.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use crate::error::BackendError;

/// An opaque inference backend hosting both model families.
///
/// `load` is heavy (model weights into memory) and is driven exclusively
/// through the orchestrator's initialize-once guard; implementations may
/// assume it is never called concurrently.
#[async_trait]
pub trait ModelBackend: Send + Sync {
    fn name(&self) -> &str;

    /// Load model weights. Called at most once per process.
    async fn load(&self) -> Result<(), BackendError>;

    fn is_loaded(&self) -> bool;

    async fn transcribe(
        &self,
        audio: &[u8],
        language_hint: Option<&str>,
    ) -> Result<String, BackendError>;

    async fn translate(
        &self,
        text: &str,
        source_lang: &str,
        target_lang: &str,
    ) -> Result<String, BackendError>;
}

/// Deterministic in-process backend.
///
/// Outputs are derived from the inputs, failures can be scripted ahead of
/// time, and every call is counted, which is what the resilience tests
/// need to assert "the backend was invoked at most once".
pub struct ScriptedBackend {
    loaded: AtomicBool,
    load_calls: AtomicUsize,
    calls: AtomicUsize,
    scripted_failures: Mutex<VecDeque<BackendError>>,
    call_delay: Duration,
}

impl Default for ScriptedBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl ScriptedBackend {
    #[must_use]
    pub fn new() -> Self {
        Self {
            loaded: AtomicBool::new(false),
            load_calls: AtomicUsize::new(0),
            calls: AtomicUsize::new(0),
            scripted_failures: Mutex::new(VecDeque::new()),
            call_delay: Duration::ZERO,
        }
    }

    /// Delay injected into every inference call, to exercise concurrency
    /// bounds and timeouts.
    #[must_use]
    pub fn with_call_delay(mut self, delay: Duration) -> Self {
        self.call_delay = delay;
        self
    }

    /// Queue failures to be returned by the next calls, in order.
    pub fn script_failure(&self, err: BackendError) {
        self.scripted_failures.lock().push_back(err);
    }

    pub fn script_failures(&self, n: usize, make: impl Fn() -> BackendError) {
        let mut q = self.scripted_failures.lock();
        for _ in 0..n {
            q.push_back(make());
        }
    }

    /// Total inference calls (transcribe + translate) observed.
    #[must_use]
    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// How many times `load` ran.
    #[must_use]
    pub fn load_count(&self) -> usize {
        self.load_calls.load(Ordering::SeqCst)
    }

    async fn begin_call(&self) -> Result<(), BackendError> {
        if !self.is_loaded() {
            return Err(BackendError::Permanent("model not loaded".into()));
        }
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.call_delay > Duration::ZERO {
            tokio::time::sleep(self.call_delay).await;
        }
        if let Some(err) = self.scripted_failures.lock().pop_front() {
            return Err(err);
        }
        Ok(())
    }
}

#[async_trait]
impl ModelBackend for ScriptedBackend {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn load(&self) -> Result<(), BackendError> {
        self.load_calls.fetch_add(1, Ordering::SeqCst);
        // Simulate weight loading being slow
        tokio::time::sleep(Duration::from_millis(10)).await;
        self.loaded.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn is_loaded(&self) -> bool {
        self.loaded.load(Ordering::SeqCst)
    }

    async fn transcribe(
        &self,
        audio: &[u8],
        language_hint: Option<&str>,
    ) -> Result<String, BackendError> {
        self.begin_call().await?;
        Ok(format!(
            "transcript[{} bytes, lang={}]",
            audio.len(),
            language_hint.unwrap_or("auto")
        ))
    }

    async fn translate(
        &self,
        text: &str,
        source_lang: &str,
        target_lang: &str,
    ) -> Result<String, BackendError> {
        self.begin_call().await?;
        Ok(format!("[{source_lang}->{target_lang}] {text}"))
    }
}
