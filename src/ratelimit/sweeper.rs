//! Periodic deletion of stale window records.
//!
//! Sweeping is storage hygiene only. Errors are logged and reported to
//! whoever scheduled the sweep, never to request handlers.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::store::WindowStore;
use crate::error::Result;

/// Sweep scheduling configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SweepConfig {
    /// Whether the background sweeper runs at all
    #[serde(default = "default_enabled")]
    pub enabled: bool,

    /// Seconds between sweeps
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,

    /// Records whose window started longer ago than this are deleted
    #[serde(default = "default_max_age_ms")]
    pub max_age_ms: u64,

    /// Maximum deletions per batch
    #[serde(default = "default_batch_limit")]
    pub batch_limit: usize,
}

impl Default for SweepConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            interval_secs: default_interval_secs(),
            max_age_ms: default_max_age_ms(),
            batch_limit: default_batch_limit(),
        }
    }
}

fn default_enabled() -> bool {
    true
}

fn default_interval_secs() -> u64 {
    3600
}

fn default_max_age_ms() -> u64 {
    // 24 hours
    86_400_000
}

fn default_batch_limit() -> usize {
    500
}

/// Sweep in batches until a batch comes back short. Returns the total deleted.
pub async fn sweep_until_clean(
    store: &dyn WindowStore,
    max_age_ms: u64,
    batch_limit: usize,
) -> Result<usize> {
    let batch_limit = batch_limit.max(1);
    let mut total = 0;

    loop {
        let deleted = store.sweep_older_than(max_age_ms, batch_limit).await?;
        total += deleted;
        debug!(deleted = deleted, total = total, "Sweep batch finished");

        if deleted < batch_limit {
            return Ok(total);
        }
    }
}

/// Background task running `sweep_until_clean` on an interval.
pub struct Sweeper {
    handle: JoinHandle<()>,
}

impl Sweeper {
    /// Start sweeping `store` until `shutdown` flips to `true`.
    pub fn spawn(
        store: Arc<dyn WindowStore>,
        config: SweepConfig,
        mut shutdown: watch::Receiver<bool>,
    ) -> Self {
        let handle = tokio::spawn(async move {
            let mut interval =
                tokio::time::interval(Duration::from_secs(config.interval_secs.max(1)));

            info!(
                interval_secs = config.interval_secs,
                max_age_ms = config.max_age_ms,
                "Window record sweeper started"
            );

            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        match sweep_until_clean(store.as_ref(), config.max_age_ms, config.batch_limit).await {
                            Ok(0) => {}
                            Ok(deleted) => info!(deleted = deleted, "Swept stale window records"),
                            Err(e) => warn!(error = %e, "Window record sweep failed"),
                        }
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }

            info!("Window record sweeper stopped");
        });

        Self { handle }
    }

    /// Wait for the task to exit after shutdown was signalled.
    pub async fn join(self) {
        if let Err(e) = self.handle.await {
            warn!(error = %e, "Sweeper task panicked");
        }
    }
}
