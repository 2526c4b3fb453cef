//! Content server readiness gate.
//!
//! The evaluator pulls recommendation definitions from the content server,
//! so no run may start before that server answers its health check.

use crate::config::ContentServerConfig;
use anyhow::{bail, Context, Result};
use reqwest::Client;
use std::time::Duration;
use tracing::{info, warn};

pub struct ContentServerGate {
    client: Client,
    url: String,
    max_attempts: u32,
    retry_delay: Duration,
}

impl ContentServerGate {
    /// Returns `None` when no health URL is configured.
    pub fn from_config(cfg: &ContentServerConfig) -> Result<Option<Self>> {
        let Some(url) = cfg.health_url.as_deref() else {
            return Ok(None);
        };
        let client = Client::builder()
            .timeout(Duration::from_secs(cfg.request_timeout_sec.max(1)))
            .build()
            .context("failed to build content server HTTP client")?;
        Ok(Some(Self {
            client,
            url: url.to_string(),
            max_attempts: cfg.max_attempts.max(1),
            retry_delay: Duration::from_secs(cfg.retry_delay_sec),
        }))
    }

    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    /// One health probe; any 2xx is healthy.
    pub async fn check(&self) -> Result<()> {
        let resp = self
            .client
            .get(&self.url)
            .send()
            .await
            .with_context(|| format!("content server {} unreachable", self.url))?;
        if !resp.status().is_success() {
            bail!("content server {} returned {}", self.url, resp.status());
        }
        Ok(())
    }

    /// Probe until healthy or attempts run out.
    pub async fn wait_until_healthy(&self) -> Result<()> {
        let mut attempt = 1;
        loop {
            match self.check().await {
                Ok(()) => {
                    info!(url = %self.url, attempt, "content server healthy");
                    return Ok(());
                }
                Err(e) if attempt >= self.max_attempts => {
                    return Err(e.context(format!(
                        "content server not healthy after {} attempts",
                        self.max_attempts
                    )));
                }
                Err(e) => {
                    warn!(url = %self.url, attempt, max = self.max_attempts, error = %e, "content server not ready, retrying");
                    tokio::time::sleep(self.retry_delay).await;
                    attempt += 1;
                }
            }
        }
    }
}
