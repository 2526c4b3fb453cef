//! HTTP evaluator: POST the window to an evaluation service.

use super::{EvaluationError, Evaluator};
use crate::run::{format_ts, Window};
use anyhow::Result;
use reqwest::Client;
use serde::Serialize;

#[derive(Debug, Serialize)]
struct EvaluateRequest {
    window_start: String,
    window_end: String,
}

/// Any 2xx response is success; the trimmed body becomes the run summary.
pub struct HttpEvaluator {
    name: String,
    url: String,
    client: Client,
}

impl HttpEvaluator {
    /// No client-side request timeout; the adapter bounds the call.
    pub fn new(url: &str) -> Result<Self> {
        let client = Client::builder().build()?;
        Ok(Self {
            name: format!("http:{url}"),
            url: url.to_string(),
            client,
        })
    }
}

#[async_trait::async_trait]
impl Evaluator for HttpEvaluator {
    fn name(&self) -> &str {
        &self.name
    }

    async fn evaluate(&self, window: &Window) -> Result<Option<String>, EvaluationError> {
        let body = EvaluateRequest {
            window_start: format_ts(window.start),
            window_end: format_ts(window.end),
        };

        let resp = self
            .client
            .post(&self.url)
            .json(&body)
            .send()
            .await
            .map_err(|e| EvaluationError::failed(format!("request to {} failed: {e}", self.url)))?;

        let status = resp.status();
        let text = match resp.text().await {
            Ok(text) => text,
            Err(e) if status.is_success() => {
                return Err(EvaluationError::failed(format!(
                    "{} returned {} but the body could not be read: {e}",
                    self.url, status
                )));
            }
            Err(_) => String::new(),
        };
        if status.is_success() {
            Ok(Some(text.trim().to_string()))
        } else {
            Err(EvaluationError::failed(format!(
                "{} returned {}: {}",
                self.url,
                status,
                text.trim()
            )))
        }
    }
}
