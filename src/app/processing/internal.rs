//! Funds consolidation.
//!
//! Deposited funds accumulate on single-use inbound wallets. The sweep job
//! moves them to the per-blockchain outbound wallet so withdrawals can be
//! paid from one place. Native coins keep a slice behind for future gas;
//! tokens move in full.

use rust_decimal::Decimal;
use serde_json::json;
use tracing::{error, info, instrument};

use crate::domain::currency::Currency;
use crate::domain::{
    Amount, AppError, Balance, BalanceOperation, BalanceOwner, BalanceUpdate, Blockchain,
    BlockchainError, CancelUpdate, ConfirmUpdate, NewTransaction, Transaction, TransactionError,
    TransactionStatus, TransactionType, TransferResult, Wallet, WalletError, WalletType,
};

use super::{OUTBOUND_PROVISION_CONCURRENCY, Processing, TRANSFER_CONCURRENCY, fan_out};

/// Share of a native coin balance swept out, leaving gas headroom
const NATIVE_SWEEP_FACTOR: (i64, u32) = (90, 2);

/// Tracks how far a sweep got so the rollback unwinds exactly that much
#[derive(Default)]
struct SweepAttempt {
    transaction: Option<Transaction>,
    debited: bool,
}

impl Processing {
    /// Sweep funded inbound wallet balances to the outbound wallets.
    ///
    /// Balances are paged so a large wallet fleet cannot pin the whole set
    /// in memory; each page fans out over the transfer pool.
    #[instrument(skip(self))]
    pub async fn run_internal_transfers(&self) -> Result<TransferResult, AppError> {
        let page_size = self.config.sweep_page_size;
        let mut merged = TransferResult::new();
        let mut offset = 0;

        loop {
            let page = self
                .ledger
                .list_funded_inbound_balances(offset, page_size)
                .await?;
            let fetched = page.len() as i64;

            let result = fan_out(page, TRANSFER_CONCURRENCY, |balance| {
                let this = self.clone();
                async move { this.sweep_balance(balance).await }
            })
            .await?;
            merged.merge(result);

            if fetched < page_size {
                break;
            }
            offset += page_size;
        }

        info!(
            created = merged.created_transaction_ids.len(),
            rolled_back = merged.rolled_back_transaction_ids.len(),
            errors = merged.total_errors(),
            "Internal transfer pass finished"
        );
        Ok(merged)
    }

    async fn sweep_balance(&self, balance: Balance) -> TransferResult {
        let mut result = TransferResult::new();

        let Some(swept_currency) = balance.resolve_currency() else {
            result.record_error(format!(
                "balance {} holds unknown currency {}",
                balance.id,
                balance.ticker()
            ));
            return result;
        };
        let Some(is_test) = swept_currency.match_network_id(balance.network_id) else {
            result.record_error(format!(
                "balance {} is on foreign network {}",
                balance.id, balance.network_id
            ));
            return result;
        };

        match self.sweep_worth_moving(&balance, swept_currency).await {
            Ok(true) => {}
            Ok(false) => return result,
            Err(e) => {
                result.record_error(format!("sweep threshold for balance {}: {e}", balance.id));
                return result;
            }
        }

        let prepared = self
            .prepare_sweep(&balance, swept_currency, is_test)
            .await;
        let (wallet, outbound, amount, raw) = match prepared {
            Ok(prepared) => prepared,
            Err(e) => {
                result.record_error(format!("sweep setup for balance {}: {e}", balance.id));
                return result;
            }
        };

        // The pending nonce is reserved from here on. Failures below must
        // unwind it together with whatever else already happened.
        let mut attempt = SweepAttempt::default();
        let dispatched = self
            .dispatch_internal_transfer(
                &mut attempt,
                &wallet,
                &outbound,
                swept_currency,
                is_test,
                &amount,
                &raw,
            )
            .await;

        match dispatched {
            Ok(transaction_id) => result.record_created(transaction_id),
            Err(e) => {
                result.record_error(format!("internal sweep from wallet {}: {e}", wallet.id));
                self.rollback_internal_transfer(&attempt, &wallet, swept_currency, is_test, &amount, &e)
                    .await;
                if let Some(transaction) = &attempt.transaction {
                    result.record_rollback(transaction.id);
                }
            }
        }
        result
    }

    /// A balance is worth sweeping once it exceeds the currency's minimum
    /// transfer value; smaller ones would be eaten by fees.
    async fn sweep_worth_moving(
        &self,
        balance: &Balance,
        swept_currency: &'static Currency,
    ) -> Result<bool, AppError> {
        let floor = self
            .converter
            .fiat_to_crypto(
                &Amount::usd(swept_currency.min_transfer_usd)?,
                swept_currency,
            )
            .await?;
        Ok(balance.amount.compare(&floor)?.is_ge())
    }

    async fn prepare_sweep(
        &self,
        balance: &Balance,
        swept_currency: &'static Currency,
        is_test: bool,
    ) -> Result<(Wallet, Wallet, Amount, String), AppError> {
        let amount = if swept_currency.is_token() {
            balance.amount.clone()
        } else {
            let (mantissa, scale) = NATIVE_SWEEP_FACTOR;
            balance.amount.mul_decimal(Decimal::new(mantissa, scale))?
        };

        let wallet = self.wallets.wallet(balance.owner.owner_id).await?;
        let outbound = self.wallets.outbound_wallet(swept_currency.blockchain).await?;
        let fee = self.fees.estimate_fee(swept_currency, is_test).await?;
        let (raw, _nonce) = self
            .wallets
            .create_signed_transaction(
                &wallet,
                swept_currency,
                is_test,
                amount.clone(),
                &outbound.address,
                fee,
            )
            .await?;
        Ok((wallet, outbound, amount, raw))
    }

    async fn dispatch_internal_transfer(
        &self,
        attempt: &mut SweepAttempt,
        wallet: &Wallet,
        outbound: &Wallet,
        swept_currency: &'static Currency,
        is_test: bool,
        amount: &Amount,
        raw: &str,
    ) -> Result<i64, AppError> {
        let usd_amount = self.converter.crypto_to_fiat(amount, "USD").await?;
        let transaction = self
            .transactions
            .create(&NewTransaction {
                transaction_type: TransactionType::Internal,
                status: TransactionStatus::InProgress,
                entity_id: 0,
                merchant_id: 0,
                sender_wallet_id: Some(wallet.id),
                recipient_wallet_id: Some(outbound.id),
                sender_address: Some(wallet.address.clone()),
                recipient_address: Some(outbound.address.clone()),
                blockchain: swept_currency.blockchain,
                network_id: swept_currency.network_id(is_test),
                currency_type: swept_currency.currency_type,
                amount: amount.clone(),
                fact_amount: None,
                service_fee: Amount::zero(
                    swept_currency.ticker,
                    swept_currency.decimals,
                    amount.kind(),
                ),
                network_fee: None,
                usd_amount,
                hash: None,
                is_test,
                metadata: json!({}),
            })
            .await?;
        attempt.transaction = Some(transaction.clone());

        let debit = BalanceUpdate::new(
            wallet.owner(),
            swept_currency,
            is_test,
            BalanceOperation::Decrement,
            amount.clone(),
            "locking balance for internal transaction",
        )
        .with_metadata(json!({
            "senderWalletId": wallet.id,
            "transactionId": transaction.id,
        }));
        self.ledger.apply_update(&debit).await?;
        attempt.debited = true;

        let hash = self
            .broadcaster
            .broadcast_transaction(swept_currency.blockchain, raw, is_test)
            .await?;

        // The transfer is on chain; a failure to store its hash must not
        // trigger a rollback of funds that actually moved.
        if let Err(e) = self.transactions.set_hash(transaction.id, &hash).await {
            error!(
                transaction_id = transaction.id,
                hash = %hash,
                error = %e,
                "Failed to store broadcast hash for internal transfer"
            );
        }

        info!(
            transaction_id = transaction.id,
            wallet_id = wallet.id,
            amount = %amount,
            hash = %hash,
            "Dispatched internal transfer"
        );
        Ok(transaction.id)
    }

    /// Unwind an internal transfer that never reached the chain.
    ///
    /// Steps run in reverse creation order and a failing step is logged
    /// and skipped so the rest still unwinds.
    async fn rollback_internal_transfer(
        &self,
        attempt: &SweepAttempt,
        wallet: &Wallet,
        swept_currency: &'static Currency,
        is_test: bool,
        amount: &Amount,
        cause: &AppError,
    ) {
        if let Err(e) = self.wallets.rollback_pending_nonce(wallet.id, is_test).await {
            error!(
                wallet_id = wallet.id,
                error = %e,
                "Failed to roll back pending nonce for internal transfer"
            );
        }

        let Some(transaction) = &attempt.transaction else {
            return;
        };
        let cancel = CancelUpdate {
            status: TransactionStatus::Cancelled,
            reason: format!("internal transfer rollback. Reason: {cause}"),
            network_fee: None,
        };
        if let Err(e) = self.transactions.cancel(transaction, &cancel).await {
            error!(
                transaction_id = transaction.id,
                error = %e,
                "Failed to cancel internal transfer during rollback"
            );
        }

        if attempt.debited {
            let credit = BalanceUpdate::new(
                wallet.owner(),
                swept_currency,
                is_test,
                BalanceOperation::Increment,
                amount.clone(),
                "Unlocking balance due to internal transfer rollback",
            )
            .with_metadata(json!({
                "senderWalletId": wallet.id,
                "transactionId": transaction.id,
            }));
            if let Err(e) = self.ledger.apply_update(&credit).await {
                error!(
                    transaction_id = transaction.id,
                    error = %e,
                    "Failed to restore balance during internal transfer rollback"
                );
            }
        }
    }

    /// Settle internal transfers the chain has confirmed and unwind the
    /// ones it reverted.
    #[instrument(skip(self))]
    pub async fn check_internal_transfers(&self) -> Result<TransferResult, AppError> {
        let batch = self
            .transactions
            .list_in_progress(TransactionType::Internal, self.config.batch_limit)
            .await?;

        fan_out(batch, TRANSFER_CONCURRENCY, |transaction| {
            let this = self.clone();
            async move { this.check_internal_transaction(transaction).await }
        })
        .await
    }

    async fn check_internal_transaction(&self, transaction: Transaction) -> TransferResult {
        let mut result = TransferResult::new();
        let Some(hash) = transaction.hash.clone() else {
            result.record_error(format!("internal tx {} has no hash", transaction.id));
            return result;
        };

        let receipt = match self
            .broadcaster
            .get_transaction_receipt(transaction.blockchain, &hash, transaction.is_test)
            .await
        {
            Ok(receipt) => receipt,
            Err(AppError::Blockchain(BlockchainError::ReceiptNotFound(_))) => {
                return result;
            }
            Err(e) => {
                result.record_error(format!("receipt lookup for tx {}: {e}", transaction.id));
                return result;
            }
        };

        if receipt.success && !receipt.is_confirmed {
            return result;
        }

        let outcome = if receipt.success {
            self.settle_internal(&transaction, receipt.network_fee).await
        } else {
            self.revert_internal(&transaction, receipt.network_fee).await
        };
        match outcome {
            Ok(()) => result.record_created(transaction.id),
            Err(e) => result.record_error(format!("internal tx {}: {e}", transaction.id)),
        }
        result
    }

    async fn settle_internal(
        &self,
        transaction: &Transaction,
        network_fee: Amount,
    ) -> Result<(), AppError> {
        let sender_wallet_id = transaction.sender_wallet_id.ok_or_else(|| {
            AppError::Transaction(TransactionError::InvalidCreation(format!(
                "internal tx {} has no sender wallet",
                transaction.id
            )))
        })?;
        // The chain consumed the nonce, confirm it regardless of how the
        // row transition below fares.
        self.wallets
            .confirm_pending_nonce(sender_wallet_id, transaction.is_test)
            .await?;

        self.transactions
            .confirm(
                transaction,
                &ConfirmUpdate {
                    status: TransactionStatus::Completed,
                    fact_amount: transaction.amount.clone(),
                    network_fee: Some(network_fee),
                    zero_service_fee: false,
                },
            )
            .await?;
        Ok(())
    }

    async fn revert_internal(
        &self,
        transaction: &Transaction,
        network_fee: Amount,
    ) -> Result<(), AppError> {
        let sender_wallet_id = transaction.sender_wallet_id.ok_or_else(|| {
            AppError::Transaction(TransactionError::InvalidCreation(format!(
                "internal tx {} has no sender wallet",
                transaction.id
            )))
        })?;
        let swept_currency = transaction.resolve_currency().ok_or_else(|| {
            AppError::Blockchain(BlockchainError::UnsupportedAsset(format!(
                "{} on {}",
                transaction.ticker(),
                transaction.blockchain
            )))
        })?;

        self.wallets
            .confirm_pending_nonce(sender_wallet_id, transaction.is_test)
            .await?;
        self.transactions
            .cancel(
                transaction,
                &CancelUpdate {
                    status: TransactionStatus::Failed,
                    reason: "blockchain confirmed failure (revert)".to_string(),
                    network_fee: Some(network_fee),
                },
            )
            .await?;

        // The principal never left the wallet on chain, put it back on
        // the books.
        let credit = BalanceUpdate::new(
            BalanceOwner::wallet(sender_wallet_id),
            swept_currency,
            transaction.is_test,
            BalanceOperation::Increment,
            transaction.amount.clone(),
            "transaction was reverted by blockchain",
        )
        .with_metadata(json!({
            "senderWalletId": sender_wallet_id,
            "transactionId": transaction.id,
        }));
        self.ledger.apply_update(&credit).await?;
        Ok(())
    }

    /// Make sure every blockchain has a subscribed outbound wallet.
    ///
    /// Runs at startup; a failure on one chain does not block the others.
    #[instrument(skip(self))]
    pub async fn ensure_outbound_wallets(&self) -> Result<TransferResult, AppError> {
        fan_out(
            Blockchain::all().to_vec(),
            OUTBOUND_PROVISION_CONCURRENCY,
            |blockchain| {
                let this = self.clone();
                async move { this.ensure_outbound_wallet(blockchain).await }
            },
        )
        .await
    }

    async fn ensure_outbound_wallet(&self, blockchain: Blockchain) -> TransferResult {
        let mut result = TransferResult::new();
        if let Err(e) = self.ensure_outbound_wallet_inner(blockchain).await {
            result.record_error(format!("outbound wallet for {blockchain}: {e}"));
        }
        result
    }

    async fn ensure_outbound_wallet_inner(&self, blockchain: Blockchain) -> Result<(), AppError> {
        let wallet = match self.wallets.outbound_wallet(blockchain).await {
            Ok(wallet) => wallet,
            Err(AppError::Wallet(WalletError::NoOutboundWallet(_))) => {
                self.wallets
                    .create_wallet(blockchain, WalletType::Outbound)
                    .await?
            }
            Err(e) => return Err(e),
        };

        self.wallets.ensure_subscription(&wallet, false).await?;
        self.wallets.ensure_subscription(&wallet, true).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_native_sweep_factor_is_ninety_percent() {
        let (mantissa, scale) = NATIVE_SWEEP_FACTOR;
        assert_eq!(Decimal::new(mantissa, scale), dec!(0.90));

        let balance = Amount::crypto("ETH", dec!(2), 18).unwrap();
        let swept = balance.mul_decimal(Decimal::new(mantissa, scale)).unwrap();
        assert_eq!(swept.value(), dec!(1.8));
    }
}
