//! Evaluator call boundary.
//!
//! The evaluator itself is external and opaque: given a window it scans the
//! patient data store and writes clinical results. This module only knows
//! how to invoke it, bound its runtime, and classify the outcome. It never
//! touches the run ledger.

pub mod command;
pub mod content;
pub mod http;

use crate::config::{EvaluatorConfig, EvaluatorKind};
use crate::run::Window;
use anyhow::{Context, Result};
use futures::FutureExt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, warn};

/// Longest failure text kept for the ledger.
const MAX_REASON_LEN: usize = 2000;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EvaluationError {
    #[error("{0}")]
    Failed(String),

    #[error("timeout after {:.3}s", .0.as_secs_f64())]
    Timeout(Duration),

    #[error("evaluator panicked")]
    Panicked,
}

impl EvaluationError {
    pub fn failed(reason: impl Into<String>) -> Self {
        EvaluationError::Failed(truncate_reason(reason.into()))
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, EvaluationError::Timeout(_))
    }
}

/// A successful evaluation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Evaluation {
    pub summary: Option<String>,
    pub elapsed: Duration,
}

/// Anything that can evaluate the recommendations over a window.
///
/// Implementations must tolerate being invoked again for the same window:
/// failed windows are replayed.
#[async_trait::async_trait]
pub trait Evaluator: Send + Sync {
    fn name(&self) -> &str;

    /// Returns an optional one-line summary on success.
    async fn evaluate(&self, window: &Window) -> Result<Option<String>, EvaluationError>;
}

/// Wraps an [`Evaluator`] with a hard timeout and panic isolation.
#[derive(Clone)]
pub struct EvaluatorAdapter {
    inner: Arc<dyn Evaluator>,
    timeout: Duration,
}

impl EvaluatorAdapter {
    pub fn new(inner: Arc<dyn Evaluator>, timeout: Duration) -> Self {
        Self { inner, timeout }
    }

    pub fn name(&self) -> &str {
        self.inner.name()
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Invoke the evaluator once. No retries here; a failed window is
    /// re-offered by the allocator on a later trigger.
    pub async fn evaluate(&self, window: Window) -> Result<Evaluation, EvaluationError> {
        let started = Instant::now();
        let call = AssertUnwindSafe(self.inner.evaluate(&window)).catch_unwind();

        let result = match tokio::time::timeout(self.timeout, call).await {
            Err(_) => Err(EvaluationError::Timeout(self.timeout)),
            Ok(Err(_panic)) => Err(EvaluationError::Panicked),
            Ok(Ok(result)) => result,
        };
        let elapsed = started.elapsed();

        match result {
            Ok(summary) => {
                debug!(evaluator = self.name(), %window, elapsed_ms = elapsed.as_millis() as u64, "evaluation returned");
                Ok(Evaluation {
                    summary: summary.filter(|s| !s.trim().is_empty()),
                    elapsed,
                })
            }
            Err(e) => {
                warn!(evaluator = self.name(), %window, elapsed_ms = elapsed.as_millis() as u64, error = %e, "evaluation failed");
                Err(e)
            }
        }
    }
}

/// In-process evaluator backed by an async closure.
pub struct FnEvaluator<F> {
    name: String,
    f: F,
}

impl<F> FnEvaluator<F> {
    pub fn new(name: impl Into<String>, f: F) -> Self {
        Self {
            name: name.into(),
            f,
        }
    }
}

#[async_trait::async_trait]
impl<F, Fut> Evaluator for FnEvaluator<F>
where
    F: Fn(Window) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Option<String>, EvaluationError>> + Send + 'static,
{
    fn name(&self) -> &str {
        &self.name
    }

    async fn evaluate(&self, window: &Window) -> Result<Option<String>, EvaluationError> {
        (self.f)(*window).await
    }
}

/// Build the configured evaluator backend.
pub fn from_config(cfg: &EvaluatorConfig) -> Result<EvaluatorAdapter> {
    let inner: Arc<dyn Evaluator> = match cfg.kind {
        EvaluatorKind::Command => {
            let program = cfg
                .command
                .as_deref()
                .context("evaluator.kind = \"command\" requires evaluator.command")?;
            Arc::new(command::CommandEvaluator::new(
                program,
                cfg.args.clone(),
                cfg.working_dir.clone(),
            ))
        }
        EvaluatorKind::Http => {
            let url = cfg
                .url
                .as_deref()
                .context("evaluator.kind = \"http\" requires evaluator.url")?;
            Arc::new(http::HttpEvaluator::new(url)?)
        }
    };
    Ok(EvaluatorAdapter::new(inner, cfg.timeout()))
}

fn truncate_reason(mut reason: String) -> String {
    if reason.len() > MAX_REASON_LEN {
        let mut cut = MAX_REASON_LEN;
        while !reason.is_char_boundary(cut) {
            cut -= 1;
        }
        reason.truncate(cut);
        reason.push_str("...");
    }
    reason
}
