//! Recovery supervisor: one background task that periodically prunes expired reservations
//! and re-drives runs left orphaned by a crashed worker.
//!
//! Each tick is logged. A failed tick doubles the delay before the next one (capped), and a
//! successful tick resets it.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::orchestrator::{Orchestrator, RecoveryReport};

const MAX_BACKOFF_FACTOR: u32 = 8;

#[derive(Clone, Debug)]
pub struct RecoveryConfig {
    pub interval: Duration,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
        }
    }
}

pub struct RecoverySupervisor {
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<u64>,
}

impl RecoverySupervisor {
    /// Spawns the supervisor. The first sweep runs immediately.
    pub fn start(orchestrator: Arc<Orchestrator>, config: RecoveryConfig) -> Self {
        let (shutdown, mut stop) = watch::channel(false);
        let handle = tokio::spawn(async move {
            let mut ticks: u64 = 0;
            let mut failures: u32 = 0;
            loop {
                ticks += 1;
                match orchestrator.recover_orphans().await {
                    Ok(report) => {
                        failures = 0;
                        log_report(ticks, &report);
                    }
                    Err(e) => {
                        failures = failures.saturating_add(1);
                        tracing::error!(tick = ticks, failures, error = %e, "recovery tick failed");
                    }
                }
                let delay = next_delay(config.interval, failures);
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    changed = stop.changed() => {
                        if changed.is_err() || *stop.borrow() {
                            break;
                        }
                    }
                }
            }
            tracing::info!(ticks, "recovery supervisor stopped");
            ticks
        });
        Self { shutdown, handle }
    }

    /// Stops the loop and waits for it; returns the number of ticks that ran.
    pub async fn shutdown(self) -> u64 {
        let _ = self.shutdown.send(true);
        match self.handle.await {
            Ok(ticks) => ticks,
            Err(e) => {
                tracing::warn!(error = %e, "recovery supervisor task ended abnormally");
                0
            }
        }
    }
}

fn log_report(tick: u64, report: &RecoveryReport) {
    if report.resumed.is_empty() && report.pruned_reservations == 0 {
        tracing::debug!(tick, "recovery tick: nothing to do");
    } else {
        tracing::info!(
            tick,
            pruned = report.pruned_reservations,
            resumed = report.resumed.len(),
            "recovery tick"
        );
    }
}

fn next_delay(interval: Duration, failures: u32) -> Duration {
    let factor = 2u32
        .saturating_pow(failures)
        .min(MAX_BACKOFF_FACTOR);
    interval.saturating_mul(factor)
}
