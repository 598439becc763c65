//! Background job scheduling.
//!
//! Three cadences drive the engine: a fast loop settling observed
//! deposits, a medium loop checking dispatched transfers and expiring
//! stale payments, and a slow loop that sweeps wallets and executes
//! withdrawals. All loops stop on the shutdown signal.

use std::future::Future;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{MissedTickBehavior, interval};
use tracing::{debug, error, info, warn};

use crate::domain::{AppError, TransferResult};

use super::processing::Processing;

/// Cadence settings for the background jobs
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub enabled: bool,
    /// How often observed deposits are checked for confirmations
    pub incoming_check_interval: Duration,
    /// How often dispatched internal transfers and withdrawals are checked
    pub progress_check_interval: Duration,
    /// How often sweeps, withdrawals and payment expiry run
    pub transfer_interval: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            incoming_check_interval: Duration::from_secs(30),
            progress_check_interval: Duration::from_secs(120),
            transfer_interval: Duration::from_secs(600),
        }
    }
}

/// Start the scheduler. The returned sender stops it when set to `true`.
pub fn spawn_scheduler(
    processing: Processing,
    config: SchedulerConfig,
) -> (JoinHandle<()>, watch::Sender<bool>) {
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let handle = tokio::spawn(run_scheduler(processing, config, shutdown_rx));
    (handle, shutdown_tx)
}

async fn run_scheduler(
    processing: Processing,
    config: SchedulerConfig,
    mut shutdown: watch::Receiver<bool>,
) {
    if !config.enabled {
        info!("Scheduler is disabled, background jobs will not run");
        return;
    }
    info!(
        incoming_check_secs = config.incoming_check_interval.as_secs(),
        progress_check_secs = config.progress_check_interval.as_secs(),
        transfer_secs = config.transfer_interval.as_secs(),
        "Scheduler started"
    );

    let mut incoming_check = interval(config.incoming_check_interval);
    incoming_check.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut progress_check = interval(config.progress_check_interval);
    progress_check.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut transfers = interval(config.transfer_interval);
    transfers.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = incoming_check.tick() => {
                run_job("incoming_check", processing.check_incoming_transfers()).await;
            }
            _ = progress_check.tick() => {
                run_job("internal_check", processing.check_internal_transfers()).await;
                run_job("withdrawal_check", processing.check_withdrawals()).await;
                run_job("payment_expiry", processing.run_payment_expiry()).await;
            }
            _ = transfers.tick() => {
                run_job("internal_transfers", processing.run_internal_transfers()).await;
                run_job("withdrawals", processing.run_withdrawals()).await;
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    info!("Scheduler shutting down");
                    return;
                }
            }
        }
    }
}

async fn run_job<F>(name: &'static str, job: F)
where
    F: Future<Output = Result<TransferResult, AppError>>,
{
    match job.await {
        Ok(result) if result.total_errors() > 0 => {
            warn!(
                job = name,
                created = result.created_transaction_ids.len(),
                rolled_back = result.rolled_back_transaction_ids.len(),
                errors = ?result.errors,
                "Job finished with errors"
            );
        }
        Ok(result) => {
            debug!(
                job = name,
                created = result.created_transaction_ids.len(),
                "Job finished"
            );
        }
        Err(e) => {
            error!(job = name, error = %e, "Job failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_cadences() {
        let config = SchedulerConfig::default();
        assert!(config.enabled);
        assert!(config.incoming_check_interval < config.progress_check_interval);
        assert!(config.progress_check_interval < config.transfer_interval);
    }
}
