//! Balance ledger service.

use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{instrument, warn};

use crate::domain::{
    AppError, Balance, BalanceOwner, BalanceOwnerType, BalanceUpdate, LedgerError, LedgerStore,
    SystemBalance,
};

/// Application service for balance reads and writes
pub struct Ledger {
    store: Arc<dyn LedgerStore>,
}

impl Ledger {
    #[must_use]
    pub fn new(store: Arc<dyn LedgerStore>) -> Self {
        Self { store }
    }

    /// Get a balance row, if the owner holds this currency at all
    #[instrument(skip(self), fields(owner = %owner))]
    pub async fn balance(
        &self,
        owner: BalanceOwner,
        ticker: &str,
        network_id: i64,
    ) -> Result<Option<Balance>, AppError> {
        self.store.get_balance(owner, ticker, network_id).await
    }

    /// Get a balance row that must exist
    #[instrument(skip(self), fields(owner = %owner))]
    pub async fn require_balance(
        &self,
        owner: BalanceOwner,
        ticker: &str,
        network_id: i64,
    ) -> Result<Balance, AppError> {
        self.store
            .get_balance(owner, ticker, network_id)
            .await?
            .ok_or_else(|| {
                AppError::Ledger(LedgerError::BalanceNotFound(format!(
                    "{owner} {ticker} on network {network_id}"
                )))
            })
    }

    #[instrument(skip(self))]
    pub async fn balance_by_id(&self, balance_id: i64) -> Result<Balance, AppError> {
        self.store
            .get_balance_by_id(balance_id)
            .await?
            .ok_or_else(|| {
                AppError::Ledger(LedgerError::BalanceNotFound(format!("id {balance_id}")))
            })
    }

    /// Apply one balance change with its audit record
    #[instrument(skip(self, update), fields(owner = %update.owner, amount = %update.amount, operation = %update.operation))]
    pub async fn apply_update(&self, update: &BalanceUpdate) -> Result<Balance, AppError> {
        self.store.apply_update(update).await
    }

    /// Apply several balance changes atomically
    #[instrument(skip(self, updates), fields(count = updates.len()))]
    pub async fn apply_updates(&self, updates: &[BalanceUpdate]) -> Result<(), AppError> {
        self.store.apply_updates(updates).await.map(|_| ())
    }

    /// Inbound wallet balances holding funds, paged for consolidation sweeps
    #[instrument(skip(self))]
    pub async fn list_funded_inbound_balances(
        &self,
        offset: i64,
        limit: i64,
    ) -> Result<Vec<Balance>, AppError> {
        self.store.list_inbound_wallet_balances(offset, limit).await
    }

    /// Compute the service-wide float per currency and network.
    ///
    /// Wallet holdings accumulate first, merchant claims subtract from them.
    /// A merchant claim in a currency no wallet holds means the books are
    /// broken and aborts the report.
    #[instrument(skip(self))]
    pub async fn system_balances(&self) -> Result<Vec<SystemBalance>, AppError> {
        let mut totals: BTreeMap<String, SystemBalance> = BTreeMap::new();

        for balance in self.store.list_balances(BalanceOwnerType::Wallet).await? {
            let position = SystemBalance {
                blockchain: balance.blockchain,
                network_id: balance.network_id,
                currency: balance.ticker().to_string(),
                currency_type: balance.currency_type,
                decimals: balance.amount.decimals(),
                amount: rust_decimal::Decimal::ZERO,
            };
            let entry = totals.entry(position.key()).or_insert(position);
            entry.amount += balance.amount.value();
        }

        for balance in self.store.list_balances(BalanceOwnerType::Merchant).await? {
            let key = format!(
                "{}/{}/{}",
                balance.ticker(),
                balance.blockchain,
                balance.network_id
            );
            let Some(entry) = totals.get_mut(&key) else {
                return Err(AppError::Ledger(LedgerError::OrphanMerchantBalance(key)));
            };
            entry.amount -= balance.amount.value();
            if entry.amount.is_sign_negative() {
                warn!(
                    position = %key,
                    amount = %entry.amount,
                    "Merchant claims exceed wallet holdings"
                );
            }
        }

        Ok(totals.into_values().collect())
    }

    /// The float position for one currency and network, if any wallet holds it
    #[instrument(skip(self))]
    pub async fn system_balance(
        &self,
        ticker: &str,
        network_id: i64,
    ) -> Result<Option<SystemBalance>, AppError> {
        let positions = self.system_balances().await?;
        Ok(positions
            .into_iter()
            .find(|p| p.currency == ticker && p.network_id == network_id))
    }
}
