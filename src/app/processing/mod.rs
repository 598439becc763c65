//! Transfer processing workflows.
//!
//! [`Processing`] drives every money movement in the engine: webhook-fed
//! deposits, consolidation sweeps to outbound wallets, merchant
//! withdrawals, virtual topups and payment expiry. Each workflow lives in
//! its own submodule; this module owns the shared struct and the bounded
//! fan-out used by the batch jobs.

mod incoming;
mod internal;
mod topup;
mod webhook;
mod withdrawal;

use std::future::Future;
use std::sync::Arc;

use rust_decimal::Decimal;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

use crate::app::ledger::Ledger;
use crate::app::transactions::Transactions;
use crate::app::wallets::Wallets;
use crate::domain::{
    AppError, Broadcaster, CurrencyConverter, EventPublisher, FeeCalculator, PaymentGateway,
    PaymentGuardStore, TransferResult,
};

/// Concurrent transfers per batch job
const TRANSFER_CONCURRENCY: usize = 8;

/// Concurrent wallet provisions during outbound bootstrap
const OUTBOUND_PROVISION_CONCURRENCY: usize = 4;

/// Tunables for the processing workflows
#[derive(Debug, Clone)]
pub struct ProcessingConfig {
    /// Fraction of an incoming payment kept as the service fee
    pub service_fee_rate: Decimal,
    /// Transactions or orders pulled per batch job pass
    pub batch_limit: i64,
    /// Wallet balances pulled per page during consolidation sweeps
    pub sweep_page_size: i64,
}

impl Default for ProcessingConfig {
    fn default() -> Self {
        Self {
            service_fee_rate: Decimal::ZERO,
            batch_limit: 200,
            sweep_page_size: 300,
        }
    }
}

/// Orchestrates transfers across the ledger, wallets and external services
#[derive(Clone)]
pub struct Processing {
    ledger: Arc<Ledger>,
    wallets: Arc<Wallets>,
    transactions: Arc<Transactions>,
    converter: Arc<dyn CurrencyConverter>,
    fees: Arc<dyn FeeCalculator>,
    broadcaster: Arc<dyn Broadcaster>,
    payments: Arc<dyn PaymentGateway>,
    events: Arc<dyn EventPublisher>,
    guards: Arc<dyn PaymentGuardStore>,
    config: ProcessingConfig,
}

impl Processing {
    #[allow(clippy::too_many_arguments)]
    #[must_use]
    pub fn new(
        ledger: Arc<Ledger>,
        wallets: Arc<Wallets>,
        transactions: Arc<Transactions>,
        converter: Arc<dyn CurrencyConverter>,
        fees: Arc<dyn FeeCalculator>,
        broadcaster: Arc<dyn Broadcaster>,
        payments: Arc<dyn PaymentGateway>,
        events: Arc<dyn EventPublisher>,
        guards: Arc<dyn PaymentGuardStore>,
        config: ProcessingConfig,
    ) -> Self {
        Self {
            ledger,
            wallets,
            transactions,
            converter,
            fees,
            broadcaster,
            payments,
            events,
            guards,
            config,
        }
    }
}

/// Runs one future per item with at most `concurrency` in flight and merges
/// their outcomes.
///
/// Item failures land in the merged [`TransferResult`]; only a breakdown of
/// the fan-out itself (a poisoned semaphore or a panicked task) fails the
/// whole batch.
async fn fan_out<T, F, Fut>(
    items: Vec<T>,
    concurrency: usize,
    make: F,
) -> Result<TransferResult, AppError>
where
    T: Send + 'static,
    F: Fn(T) -> Fut,
    Fut: Future<Output = TransferResult> + Send + 'static,
{
    let semaphore = Arc::new(Semaphore::new(concurrency));
    let mut tasks = JoinSet::new();

    for item in items {
        let permit = semaphore
            .clone()
            .acquire_owned()
            .await
            .map_err(|e| AppError::Internal(format!("transfer semaphore closed: {e}")))?;
        let future = make(item);
        tasks.spawn(async move {
            let _permit = permit;
            future.await
        });
    }

    let mut merged = TransferResult::new();
    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok(result) => merged.merge(result),
            Err(e) => merged.record_error(format!("transfer task aborted: {e}")),
        }
    }
    Ok(merged)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn test_fan_out_merges_all_results() {
        let result = fan_out(vec![1i64, 2, 3], 2, |id| async move {
            let mut r = TransferResult::new();
            if id == 2 {
                r.record_error(format!("item {id} failed"));
            } else {
                r.record_created(id);
            }
            r
        })
        .await
        .unwrap();

        let mut created = result.created_transaction_ids.clone();
        created.sort_unstable();
        assert_eq!(created, vec![1, 3]);
        assert_eq!(result.errors, vec!["item 2 failed".to_string()]);
    }

    #[tokio::test]
    async fn test_fan_out_bounds_in_flight_tasks() {
        let active = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let result = fan_out(
            (0..16).collect::<Vec<i64>>(),
            3,
            |_| {
                let active = active.clone();
                let peak = peak.clone();
                async move {
                    let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(std::time::Duration::from_millis(5)).await;
                    active.fetch_sub(1, Ordering::SeqCst);
                    TransferResult::new()
                }
            },
        )
        .await
        .unwrap();

        assert!(result.errors.is_empty());
        assert!(peak.load(Ordering::SeqCst) <= 3);
    }

    #[tokio::test]
    async fn test_fan_out_empty_batch() {
        let result = fan_out(Vec::<i64>::new(), 4, |_| async { TransferResult::new() })
            .await
            .unwrap();
        assert_eq!(result, TransferResult::new());
    }
}
