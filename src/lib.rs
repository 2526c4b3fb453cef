//! apply-recommendations -- trigger-and-window coordinator for clinical
//! recommendation evaluation runs.
//!
//! Timer ticks and HTTP requests both ask the [`coordinator::Coordinator`]
//! for a run. The coordinator allows one run at a time, hands each run a
//! half-open time window that continues where the last successful run left
//! off, replays failed windows, and records every attempt in a SQLite run
//! ledger.

pub mod api;
pub mod config;
pub mod coordinator;
pub mod evaluator;
pub mod run;
pub mod storage;

use std::sync::Arc;

use anyhow::{bail, Context, Result};
use tracing::info;
use tracing_subscriber::EnvFilter;

use crate::config::{Config, LoggingConfig};
use crate::coordinator::{run_timer_loop, Coordinator, SystemClock, WindowAllocator};
use crate::evaluator::content::ContentServerGate;
use crate::storage::RunLedger;

/// Install the global tracing subscriber. `RUST_LOG` wins over the
/// configured level.
pub fn init_tracing(cfg: &LoggingConfig) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cfg.level));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    let _ = if cfg.json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
}

/// Open the run ledger named by the config.
pub fn open_ledger(cfg: &Config) -> Result<RunLedger> {
    let db_path = &cfg.storage.db_path;
    info!(db_path = %db_path.display(), "opening run ledger");
    let pool = storage::open_pool(db_path)
        .with_context(|| format!("failed to open run ledger at {}", db_path.display()))?;
    Ok(RunLedger::new(pool))
}

pub fn build_allocator(cfg: &Config, ledger: RunLedger) -> WindowAllocator {
    WindowAllocator::new(ledger, cfg.window.global_start, cfg.window.min_window())
}

/// Wire ledger, allocator and evaluator into a coordinator on the system clock.
pub fn build_coordinator(cfg: &Config) -> Result<Coordinator> {
    let ledger = open_ledger(cfg)?;
    let allocator = build_allocator(cfg, ledger.clone());
    let evaluator = evaluator::from_config(&cfg.evaluator)?;
    Ok(Coordinator::new(ledger, allocator, evaluator, Arc::new(SystemClock)))
}

/// Crash recovery plus the content server gate. Required before the first
/// trigger is accepted.
pub async fn prepare(cfg: &Config, coordinator: &Coordinator) -> Result<()> {
    coordinator.recover()?;
    if let Some(gate) = ContentServerGate::from_config(&cfg.content_server)? {
        gate.wait_until_healthy().await?;
    }
    Ok(())
}

/// Run the service: recover, wait for the content server, then start the
/// configured trigger sources until shutdown or a fatal ledger failure.
pub async fn serve(cfg: Config) -> Result<()> {
    let coordinator = build_coordinator(&cfg)?;
    prepare(&cfg, &coordinator).await?;

    let shutdown = coordinator.shutdown_token();
    tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("shutdown signal received");
                shutdown.cancel();
            }
        }
    });

    let timer = cfg.trigger.method.uses_timer().then(|| {
        tokio::spawn(run_timer_loop(coordinator.clone(), cfg.trigger.run_interval()))
    });

    if cfg.trigger.method.uses_http() {
        let addr = cfg.trigger.bind_addr();
        let listener = tokio::net::TcpListener::bind(addr)
            .await
            .with_context(|| format!("failed to bind trigger listener on {addr}"))?;
        info!(%addr, "HTTP trigger listening");
        let app = api::router(api::state::AppState::new(coordinator.clone()));
        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown.clone().cancelled_owned())
            .await
            .context("HTTP trigger listener failed")?;
    } else {
        shutdown.cancelled().await;
    }

    if let Some(timer) = timer {
        timer.await.context("timer trigger task panicked")??;
    }

    if coordinator.is_halted() {
        bail!("coordinator halted after a run ledger failure");
    }
    info!("shutdown complete");
    Ok(())
}
