//! Merchant withdrawals.
//!
//! Orders come from the payments service and are paid from the outbound
//! wallet. The merchant is debited the amount plus the withdrawal service
//! fee when the transfer is dispatched; a revert or rollback restores
//! both sides. Failures that retrying cannot fix sink the payment, all
//! others leave the order pending for the next pass.

use serde_json::json;
use tracing::{error, info, instrument, warn};

use crate::domain::currency::Currency;
use crate::domain::{
    Amount, AppError, Balance, BalanceOperation, BalanceOwner, BalanceUpdate, BlockchainError,
    CancelUpdate, ConfirmUpdate, Event, NewTransaction, Transaction, TransactionError,
    TransactionStatus, TransactionType, TransferResult, ValidationError, Wallet, WithdrawalOrder,
};

use super::{Processing, TRANSFER_CONCURRENCY, fan_out};

/// Tracks how far a withdrawal got so the rollback unwinds exactly that much
#[derive(Default)]
struct WithdrawalAttempt {
    transaction: Option<Transaction>,
    debited: bool,
}

impl Processing {
    /// Execute pending withdrawal orders from the payments service.
    #[instrument(skip(self))]
    pub async fn run_withdrawals(&self) -> Result<TransferResult, AppError> {
        let orders = self
            .payments
            .list_pending_withdrawals(self.config.batch_limit)
            .await?;

        fan_out(orders, TRANSFER_CONCURRENCY, |order| {
            let this = self.clone();
            async move { this.process_withdrawal(order).await }
        })
        .await
    }

    async fn process_withdrawal(&self, order: WithdrawalOrder) -> TransferResult {
        let mut result = TransferResult::new();

        if let Err(e) = validate_withdrawal_order(&order) {
            result.record_error(format!("withdrawal for payment {}: {e}", order.payment_id));
            return result;
        }

        let prepared = match self.prepare_withdrawal(&order).await {
            Ok(Some(prepared)) => prepared,
            Ok(None) => return result,
            Err(e) => {
                if e.is_permanent_payment_failure() {
                    self.sink_payment(order.payment_id, order.merchant_id, &e).await;
                }
                result.record_error(format!("withdrawal for payment {}: {e}", order.payment_id));
                return result;
            }
        };
        let (outbound, withdrawal_currency, is_test, amount, service_fee, raw) = prepared;

        // The pending nonce is reserved from here on. Failures below must
        // unwind it together with whatever else already happened.
        let mut attempt = WithdrawalAttempt::default();
        let dispatched = self
            .dispatch_withdrawal(
                &mut attempt,
                &order,
                &outbound,
                withdrawal_currency,
                is_test,
                &amount,
                &service_fee,
                &raw,
            )
            .await;

        match dispatched {
            Ok(transaction_id) => result.record_created(transaction_id),
            Err(e) => {
                result.record_error(format!("withdrawal for payment {}: {e}", order.payment_id));
                self.rollback_withdrawal(
                    &attempt,
                    &order,
                    &outbound,
                    withdrawal_currency,
                    is_test,
                    &amount,
                    &service_fee,
                    &e,
                )
                .await;
                if let Some(transaction) = &attempt.transaction {
                    result.record_rollback(transaction.id);
                }
                if e.is_permanent_payment_failure() {
                    self.sink_payment(order.payment_id, order.merchant_id, &e).await;
                }
            }
        }
        result
    }

    /// Resolve the order against the ledger and sign the transfer.
    ///
    /// Returns `None` when the outbound wallet cannot pay yet; the order
    /// stays pending until a consolidation sweep lands.
    #[allow(clippy::type_complexity)]
    async fn prepare_withdrawal(
        &self,
        order: &WithdrawalOrder,
    ) -> Result<Option<(Wallet, &'static Currency, bool, Amount, Amount, String)>, AppError> {
        let merchant_balance = self.ledger.balance_by_id(order.balance_id).await?;
        if merchant_balance.owner != BalanceOwner::merchant(order.merchant_id) {
            return Err(AppError::Validation(ValidationError::InvalidField {
                field: "balance_id".to_string(),
                message: format!(
                    "balance {} does not belong to merchant {}",
                    order.balance_id, order.merchant_id
                ),
            }));
        }

        let withdrawal_currency = merchant_balance.resolve_currency().ok_or_else(|| {
            AppError::Blockchain(BlockchainError::UnsupportedAsset(format!(
                "{} on {}",
                merchant_balance.ticker(),
                merchant_balance.blockchain
            )))
        })?;
        let is_test = withdrawal_currency
            .match_network_id(merchant_balance.network_id)
            .ok_or_else(|| {
                AppError::Blockchain(BlockchainError::UnsupportedAsset(format!(
                    "balance {} is on foreign network {}",
                    merchant_balance.id, merchant_balance.network_id
                )))
            })?;

        let amount = Amount::crypto(
            withdrawal_currency.ticker,
            order.amount,
            withdrawal_currency.decimals,
        )?;
        let fee_usd = self
            .fees
            .withdrawal_fee_usd(withdrawal_currency, is_test)
            .await?;
        let service_fee = self
            .converter
            .fiat_to_crypto(&fee_usd, withdrawal_currency)
            .await?;

        // Merchant must cover principal and fee; that failure is permanent.
        merchant_balance
            .covers(&[&amount, &service_fee])
            .map_err(AppError::Ledger)?;

        let outbound = self
            .wallets
            .outbound_wallet(withdrawal_currency.blockchain)
            .await?;
        let outbound_balance = self
            .ledger
            .balance(
                outbound.owner(),
                withdrawal_currency.ticker,
                merchant_balance.network_id,
            )
            .await?;
        let outbound_covers = outbound_balance
            .as_ref()
            .map(|balance| balance.covers(&[&amount]).is_ok())
            .unwrap_or(false);
        if !outbound_covers {
            // Not enough consolidated funds yet. Retried next pass.
            warn!(
                payment_id = order.payment_id,
                ticker = withdrawal_currency.ticker,
                "Outbound wallet cannot cover withdrawal yet, leaving order pending"
            );
            return Ok(None);
        }

        let fee = self.fees.estimate_fee(withdrawal_currency, is_test).await?;
        let (raw, _nonce) = self
            .wallets
            .create_signed_transaction(
                &outbound,
                withdrawal_currency,
                is_test,
                amount.clone(),
                &order.recipient_address,
                fee,
            )
            .await?;

        Ok(Some((outbound, withdrawal_currency, is_test, amount, service_fee, raw)))
    }

    #[allow(clippy::too_many_arguments)]
    async fn dispatch_withdrawal(
        &self,
        attempt: &mut WithdrawalAttempt,
        order: &WithdrawalOrder,
        outbound: &Wallet,
        withdrawal_currency: &'static Currency,
        is_test: bool,
        amount: &Amount,
        service_fee: &Amount,
        raw: &str,
    ) -> Result<i64, AppError> {
        let usd_amount = self.converter.crypto_to_fiat(amount, "USD").await?;
        let transaction = self
            .transactions
            .create(&NewTransaction {
                transaction_type: TransactionType::Withdrawal,
                status: TransactionStatus::InProgress,
                entity_id: order.payment_id,
                merchant_id: order.merchant_id,
                sender_wallet_id: Some(outbound.id),
                recipient_wallet_id: None,
                sender_address: Some(outbound.address.clone()),
                recipient_address: Some(order.recipient_address.clone()),
                blockchain: withdrawal_currency.blockchain,
                network_id: withdrawal_currency.network_id(is_test),
                currency_type: withdrawal_currency.currency_type,
                amount: amount.clone(),
                fact_amount: None,
                service_fee: service_fee.clone(),
                network_fee: None,
                usd_amount,
                hash: None,
                is_test,
                metadata: json!({}),
            })
            .await?;
        attempt.transaction = Some(transaction.clone());

        let debits = withdrawal_balance_updates(
            order,
            outbound,
            withdrawal_currency,
            is_test,
            amount,
            service_fee,
            transaction.id,
            BalanceOperation::Decrement,
            "Decrementing balances for withdrawal",
        )?;
        self.ledger.apply_updates(&debits).await?;
        attempt.debited = true;

        let hash = self
            .broadcaster
            .broadcast_transaction(withdrawal_currency.blockchain, raw, is_test)
            .await?;

        // The transfer is on chain; bookkeeping failures below must not
        // trigger a rollback of funds that actually moved.
        if let Err(e) = self.transactions.set_hash(transaction.id, &hash).await {
            error!(
                transaction_id = transaction.id,
                hash = %hash,
                error = %e,
                "Failed to store broadcast hash for withdrawal"
            );
        }
        if let Err(e) = self.payments.mark_in_progress(order.payment_id).await {
            error!(
                payment_id = order.payment_id,
                error = %e,
                "Failed to mark withdrawal payment in progress"
            );
        }
        self.events.publish(Event::WithdrawalCreated {
            payment_id: order.payment_id,
            transaction_id: transaction.id,
        });

        info!(
            transaction_id = transaction.id,
            payment_id = order.payment_id,
            amount = %amount,
            hash = %hash,
            "Dispatched withdrawal"
        );
        Ok(transaction.id)
    }

    /// Unwind a withdrawal that never reached the chain, in reverse
    /// creation order. A failing step is logged and skipped so the rest
    /// still unwinds.
    #[allow(clippy::too_many_arguments)]
    async fn rollback_withdrawal(
        &self,
        attempt: &WithdrawalAttempt,
        order: &WithdrawalOrder,
        outbound: &Wallet,
        withdrawal_currency: &'static Currency,
        is_test: bool,
        amount: &Amount,
        service_fee: &Amount,
        cause: &AppError,
    ) {
        if let Err(e) = self.wallets.rollback_pending_nonce(outbound.id, is_test).await {
            error!(
                wallet_id = outbound.id,
                error = %e,
                "Failed to roll back pending nonce for withdrawal"
            );
        }

        let Some(transaction) = &attempt.transaction else {
            return;
        };
        let cancel = CancelUpdate {
            status: TransactionStatus::Cancelled,
            reason: format!("withdrawal rollback. Reason: {cause}"),
            network_fee: None,
        };
        if let Err(e) = self.transactions.cancel(transaction, &cancel).await {
            error!(
                transaction_id = transaction.id,
                error = %e,
                "Failed to cancel withdrawal during rollback"
            );
        }

        if attempt.debited {
            let credits = withdrawal_balance_updates(
                order,
                outbound,
                withdrawal_currency,
                is_test,
                amount,
                service_fee,
                transaction.id,
                BalanceOperation::Increment,
                "Balance rollback after failed transaction",
            );
            match credits {
                Ok(credits) => {
                    if let Err(e) = self.ledger.apply_updates(&credits).await {
                        error!(
                            transaction_id = transaction.id,
                            error = %e,
                            "Failed to restore balances during withdrawal rollback"
                        );
                    }
                }
                Err(e) => error!(
                    transaction_id = transaction.id,
                    error = %e,
                    "Failed to build rollback credits for withdrawal"
                ),
            }
        }
    }

    /// Permanently fail the payment on the payments side.
    pub(super) async fn sink_payment(&self, payment_id: i64, merchant_id: i64, cause: &AppError) {
        if let Err(e) = self.payments.mark_failed(payment_id, &cause.to_string()).await {
            error!(
                payment_id,
                error = %e,
                "Failed to mark payment failed"
            );
            return;
        }
        self.events.publish(Event::PaymentStatusChanged {
            payment_id,
            merchant_id,
            status: "failed".to_string(),
        });
    }

    /// Settle withdrawals the chain has confirmed and unwind the ones it
    /// reverted.
    #[instrument(skip(self))]
    pub async fn check_withdrawals(&self) -> Result<TransferResult, AppError> {
        let batch = self
            .transactions
            .list_in_progress(TransactionType::Withdrawal, self.config.batch_limit)
            .await?;

        fan_out(batch, TRANSFER_CONCURRENCY, |transaction| {
            let this = self.clone();
            async move { this.check_withdrawal_transaction(transaction).await }
        })
        .await
    }

    async fn check_withdrawal_transaction(&self, transaction: Transaction) -> TransferResult {
        let mut result = TransferResult::new();
        let Some(hash) = transaction.hash.clone() else {
            result.record_error(format!("withdrawal tx {} has no hash", transaction.id));
            return result;
        };

        let receipt = match self
            .broadcaster
            .get_transaction_receipt(transaction.blockchain, &hash, transaction.is_test)
            .await
        {
            Ok(receipt) => receipt,
            Err(AppError::Blockchain(BlockchainError::ReceiptNotFound(_))) => return result,
            Err(e) => {
                result.record_error(format!("receipt lookup for tx {}: {e}", transaction.id));
                return result;
            }
        };

        if receipt.success && !receipt.is_confirmed {
            return result;
        }

        let outcome = if receipt.success {
            self.settle_withdrawal(&transaction, receipt.network_fee).await
        } else {
            self.revert_withdrawal(&transaction, receipt.network_fee).await
        };
        match outcome {
            Ok(()) => result.record_created(transaction.id),
            Err(e) => result.record_error(format!("withdrawal tx {}: {e}", transaction.id)),
        }
        result
    }

    async fn settle_withdrawal(
        &self,
        transaction: &Transaction,
        network_fee: Amount,
    ) -> Result<(), AppError> {
        let sender_wallet_id = sender_wallet_id(transaction)?;
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

        self.payments.mark_succeeded(transaction.entity_id).await?;
        self.events.publish(Event::PaymentStatusChanged {
            payment_id: transaction.entity_id,
            merchant_id: transaction.merchant_id,
            status: "succeeded".to_string(),
        });
        Ok(())
    }

    async fn revert_withdrawal(
        &self,
        transaction: &Transaction,
        network_fee: Amount,
    ) -> Result<(), AppError> {
        let wallet_id = sender_wallet_id(transaction)?;
        let withdrawal_currency = transaction.resolve_currency().ok_or_else(|| {
            AppError::Blockchain(BlockchainError::UnsupportedAsset(format!(
                "{} on {}",
                transaction.ticker(),
                transaction.blockchain
            )))
        })?;

        self.wallets
            .confirm_pending_nonce(wallet_id, transaction.is_test)
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

        // Neither the principal nor the service fee left the books on
        // chain, restore both sides.
        let merchant_credit = transaction.amount.checked_add(&transaction.service_fee)?;
        let credits = [
            BalanceUpdate::new(
                BalanceOwner::merchant(transaction.merchant_id),
                withdrawal_currency,
                transaction.is_test,
                BalanceOperation::Increment,
                merchant_credit,
                "transaction was reverted by blockchain",
            )
            .with_metadata(json!({
                "merchantId": transaction.merchant_id,
                "transactionId": transaction.id,
            })),
            BalanceUpdate::new(
                BalanceOwner::wallet(wallet_id),
                withdrawal_currency,
                transaction.is_test,
                BalanceOperation::Increment,
                transaction.amount.clone(),
                "transaction was reverted by blockchain",
            )
            .with_metadata(json!({
                "senderWalletId": wallet_id,
                "transactionId": transaction.id,
            })),
        ];
        self.ledger.apply_updates(&credits).await?;

        self.sink_payment(
            transaction.entity_id,
            transaction.merchant_id,
            &AppError::Blockchain(BlockchainError::BroadcastRejected(
                "blockchain confirmed failure (revert)".to_string(),
            )),
        )
        .await;
        Ok(())
    }
}

fn sender_wallet_id(transaction: &Transaction) -> Result<i64, AppError> {
    transaction.sender_wallet_id.ok_or_else(|| {
        AppError::Transaction(TransactionError::InvalidCreation(format!(
            "withdrawal tx {} has no sender wallet",
            transaction.id
        )))
    })
}

/// The two balance movements of a withdrawal: the merchant pays principal
/// plus service fee, the outbound wallet surrenders the principal.
#[allow(clippy::too_many_arguments)]
fn withdrawal_balance_updates(
    order: &WithdrawalOrder,
    outbound: &Wallet,
    withdrawal_currency: &'static Currency,
    is_test: bool,
    amount: &Amount,
    service_fee: &Amount,
    transaction_id: i64,
    operation: BalanceOperation,
    comment: &str,
) -> Result<[BalanceUpdate; 2], AppError> {
    let merchant_total = amount.checked_add(service_fee)?;
    Ok([
        BalanceUpdate::new(
            BalanceOwner::merchant(order.merchant_id),
            withdrawal_currency,
            is_test,
            operation,
            merchant_total,
            comment,
        )
        .with_metadata(json!({
            "merchantId": order.merchant_id,
            "transactionId": transaction_id,
        })),
        BalanceUpdate::new(
            outbound.owner(),
            withdrawal_currency,
            is_test,
            operation,
            amount.clone(),
            comment,
        )
        .with_metadata(json!({
            "senderWalletId": outbound.id,
            "transactionId": transaction_id,
        })),
    ])
}

fn validate_withdrawal_order(order: &WithdrawalOrder) -> Result<(), AppError> {
    if order.payment_id < 1 {
        return Err(invalid_field("payment_id", "must be a positive id"));
    }
    if order.merchant_id < 1 {
        return Err(invalid_field("merchant_id", "must be a positive id"));
    }
    if order.balance_id < 1 {
        return Err(invalid_field("balance_id", "must be a positive id"));
    }
    if order.recipient_address.trim().is_empty() {
        return Err(AppError::Validation(ValidationError::MissingField(
            "recipient_address".to_string(),
        )));
    }
    if order.amount.is_sign_negative() || order.amount.is_zero() {
        return Err(invalid_field("amount", "must be greater than zero"));
    }
    Ok(())
}

fn invalid_field(field: &str, message: &str) -> AppError {
    AppError::Validation(ValidationError::InvalidField {
        field: field.to_string(),
        message: message.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::currency;
    use crate::domain::Blockchain;
    use rust_decimal::Decimal;
    use rust_decimal_macros::dec;

    fn order() -> WithdrawalOrder {
        WithdrawalOrder {
            payment_id: 900,
            merchant_id: 4,
            balance_id: 11,
            recipient_address: "0xrecipient".to_string(),
            amount: dec!(0.25),
        }
    }

    fn outbound() -> Wallet {
        Wallet {
            id: 71,
            uuid: uuid::Uuid::new_v4(),
            blockchain: Blockchain::Ethereum,
            address: "0xoutbound".to_string(),
            wallet_type: crate::domain::WalletType::Outbound,
            mainnet_subscription_id: None,
            testnet_subscription_id: None,
            confirmed_mainnet_transactions: 0,
            pending_mainnet_transactions: 0,
            confirmed_testnet_transactions: 0,
            pending_testnet_transactions: 0,
            created_at: chrono::Utc::now(),
            updated_at: chrono::Utc::now(),
        }
    }

    #[test]
    fn test_validate_withdrawal_order() {
        assert!(validate_withdrawal_order(&order()).is_ok());

        let mut bad = order();
        bad.payment_id = 0;
        assert!(validate_withdrawal_order(&bad).is_err());

        let mut bad = order();
        bad.merchant_id = 0;
        assert!(validate_withdrawal_order(&bad).is_err());

        let mut bad = order();
        bad.balance_id = -2;
        assert!(validate_withdrawal_order(&bad).is_err());

        let mut bad = order();
        bad.recipient_address = "  ".to_string();
        assert!(validate_withdrawal_order(&bad).is_err());

        let mut bad = order();
        bad.amount = Decimal::ZERO;
        assert!(validate_withdrawal_order(&bad).is_err());
    }

    #[test]
    fn test_withdrawal_balance_updates_split_sides() {
        let eth = currency::find(Blockchain::Ethereum, "ETH").unwrap();
        let amount = Amount::crypto("ETH", dec!(0.25), 18).unwrap();
        let service_fee = Amount::crypto("ETH", dec!(0.001), 18).unwrap();

        let updates = withdrawal_balance_updates(
            &order(),
            &outbound(),
            eth,
            false,
            &amount,
            &service_fee,
            55,
            BalanceOperation::Decrement,
            "Decrementing balances for withdrawal",
        )
        .unwrap();

        assert_eq!(updates[0].owner, BalanceOwner::merchant(4));
        assert_eq!(updates[0].amount.value(), dec!(0.251));
        assert_eq!(updates[0].operation, BalanceOperation::Decrement);
        assert_eq!(updates[0].metadata["transactionId"], 55);

        assert_eq!(updates[1].owner, BalanceOwner::wallet(71));
        assert_eq!(updates[1].amount.value(), dec!(0.25));
        assert_eq!(updates[1].metadata["senderWalletId"], 71);
    }
}
