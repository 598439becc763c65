//! Incoming payment workflows.
//!
//! A payment method provisions an inbound wallet and a pending incoming
//! transaction quoting the crypto price. The progress check settles
//! deposits once the chain confirms them, and the expiry job cancels
//! quotes whose deposit window lapsed.

use serde_json::{Map, Value};
use tracing::{info, instrument, warn};

use crate::domain::currency::{self, Currency};
use crate::domain::{
    Amount, AmountKind, AppError, BlockchainError, CancelUpdate, ConfirmUpdate, Event, LockKey,
    NewTransaction, PaymentMethodOrder, Transaction, TransactionError, TransactionStatus,
    TransactionType, TransferResult, ValidationError,
};

use super::{Processing, fan_out};

impl Processing {
    /// Provision (or re-provision) the deposit leg of a payment.
    ///
    /// Picking the same currency again returns the existing quote.
    /// Switching currencies cancels the old quote and issues a new one on a
    /// freshly locked wallet. The whole operation holds the payment guard,
    /// so concurrent calls for one payment serialize.
    #[instrument(skip(self, order), fields(payment_id = order.payment_id, ticker = %order.ticker))]
    pub async fn set_payment_method(
        &self,
        order: PaymentMethodOrder,
    ) -> Result<Transaction, AppError> {
        validate_payment_method_order(&order)?;
        let deposit_currency =
            currency::find(order.blockchain, &order.ticker).ok_or_else(|| {
                AppError::Blockchain(BlockchainError::UnsupportedAsset(format!(
                    "{} on {}",
                    order.ticker, order.blockchain
                )))
            })?;

        let guard = self.guards.lock_payment(order.payment_id).await?;
        let result = self.provision_payment_method(&order, deposit_currency).await;
        if let Err(e) = guard.release().await {
            warn!(
                payment_id = order.payment_id,
                error = %e,
                "Failed to release payment guard"
            );
        }
        result
    }

    async fn provision_payment_method(
        &self,
        order: &PaymentMethodOrder,
        deposit_currency: &'static Currency,
    ) -> Result<Transaction, AppError> {
        let network_id = deposit_currency.network_id(order.is_test);

        if let Some(existing) = self
            .transactions
            .latest_pending_incoming(order.payment_id)
            .await?
        {
            if existing.ticker() == deposit_currency.ticker && existing.network_id == network_id {
                info!(
                    transaction_id = existing.id,
                    "Payment method unchanged, reusing pending transaction"
                );
                return Ok(existing);
            }
            self.transactions
                .cancel(
                    &existing,
                    &CancelUpdate {
                        status: TransactionStatus::Cancelled,
                        reason: "payment method changed".to_string(),
                        network_fee: None,
                    },
                )
                .await?;
        }

        let usd_price = self.converter.fiat_to_fiat(&order.price, "USD").await?;
        let amount = self
            .converter
            .fiat_to_crypto(&usd_price, deposit_currency)
            .await?;
        let service_fee = if self.config.service_fee_rate.is_zero() {
            Amount::zero(deposit_currency.ticker, deposit_currency.decimals, amount.kind())
        } else {
            amount.mul_decimal(self.config.service_fee_rate)?
        };

        let (wallet, lock) = self
            .wallets
            .acquire_wallet(order.merchant_id, deposit_currency, order.is_test)
            .await?;

        let provisioned = async {
            self.wallets
                .ensure_subscription(&wallet, order.is_test)
                .await?;
            self.transactions
                .create(&NewTransaction {
                    transaction_type: TransactionType::Incoming,
                    status: TransactionStatus::Pending,
                    entity_id: order.payment_id,
                    merchant_id: order.merchant_id,
                    sender_wallet_id: None,
                    recipient_wallet_id: Some(wallet.id),
                    sender_address: None,
                    recipient_address: Some(wallet.address.clone()),
                    blockchain: deposit_currency.blockchain,
                    network_id,
                    currency_type: deposit_currency.currency_type,
                    amount: amount.clone(),
                    fact_amount: None,
                    service_fee,
                    network_fee: None,
                    usd_amount: usd_price,
                    hash: None,
                    is_test: order.is_test,
                    metadata: Value::Object(Map::new()),
                })
                .await
        }
        .await;

        match provisioned {
            Ok(transaction) => {
                info!(
                    transaction_id = transaction.id,
                    wallet_id = wallet.id,
                    amount = %amount,
                    "Provisioned payment method"
                );
                Ok(transaction)
            }
            Err(e) => {
                // The quote never materialized, so the wallet goes back
                // into the pool instead of waiting for expiry.
                let key = LockKey {
                    wallet_id: lock.wallet_id,
                    currency: lock.currency.clone(),
                    network_id: lock.network_id,
                };
                if let Err(release_err) = self.wallets.release_wallet(&key).await {
                    warn!(
                        wallet_id = lock.wallet_id,
                        error = %release_err,
                        "Failed to release wallet lock after provisioning error"
                    );
                }
                Err(e)
            }
        }
    }

    /// Settle incoming transactions whose deposits have enough
    /// confirmations, and fail the ones the chain reverted.
    #[instrument(skip(self))]
    pub async fn check_incoming_transfers(&self) -> Result<TransferResult, AppError> {
        let batch = self
            .transactions
            .list_in_progress(TransactionType::Incoming, self.config.batch_limit)
            .await?;

        fan_out(batch, super::TRANSFER_CONCURRENCY, |transaction| {
            let this = self.clone();
            async move { this.check_incoming_transaction(transaction).await }
        })
        .await
    }

    async fn check_incoming_transaction(&self, transaction: Transaction) -> TransferResult {
        let mut result = TransferResult::new();
        let Some(hash) = transaction.hash.clone() else {
            // In progress without a hash cannot happen for deposits, skip
            // rather than guessing.
            result.record_error(format!("incoming tx {} has no hash", transaction.id));
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
            self.settle_incoming(&transaction, receipt.network_fee).await
        } else {
            self.fail_incoming(&transaction, receipt.network_fee).await
        };
        match outcome {
            Ok(()) => result.record_created(transaction.id),
            Err(e) => result.record_error(format!("incoming tx {}: {e}", transaction.id)),
        }
        result
    }

    async fn settle_incoming(
        &self,
        transaction: &Transaction,
        network_fee: Amount,
    ) -> Result<(), AppError> {
        let target = match transaction.status {
            TransactionStatus::InProgress => TransactionStatus::Completed,
            TransactionStatus::InProgressInvalid => TransactionStatus::CompletedInvalid,
            other => {
                return Err(AppError::Transaction(TransactionError::InvalidTransition {
                    id: transaction.id,
                    from: other,
                    to: TransactionStatus::Completed,
                }));
            }
        };
        let fact = transaction.fact_amount.clone().ok_or_else(|| {
            AppError::Transaction(TransactionError::MissingFactAmount(transaction.id))
        })?;

        self.transactions
            .confirm(
                transaction,
                &ConfirmUpdate {
                    status: target,
                    fact_amount: fact,
                    network_fee: Some(network_fee),
                    zero_service_fee: target == TransactionStatus::CompletedInvalid,
                },
            )
            .await?;

        if target == TransactionStatus::Completed
            && transaction.merchant_id != 0
            && transaction.entity_id != 0
        {
            self.payments.mark_succeeded(transaction.entity_id).await?;
            self.events.publish(Event::PaymentStatusChanged {
                payment_id: transaction.entity_id,
                merchant_id: transaction.merchant_id,
                status: "succeeded".to_string(),
            });
        }
        Ok(())
    }

    async fn fail_incoming(
        &self,
        transaction: &Transaction,
        network_fee: Amount,
    ) -> Result<(), AppError> {
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
        Ok(())
    }

    /// Cancel the quotes of payments whose deposit window lapsed and mark
    /// the payments expired.
    #[instrument(skip(self))]
    pub async fn run_payment_expiry(&self) -> Result<TransferResult, AppError> {
        let expired = self
            .payments
            .list_expired_payments(self.config.batch_limit)
            .await?;

        fan_out(expired, super::TRANSFER_CONCURRENCY, |payment_id| {
            let this = self.clone();
            async move { this.expire_payment(payment_id).await }
        })
        .await
    }

    async fn expire_payment(&self, payment_id: i64) -> TransferResult {
        let mut result = TransferResult::new();
        let outcome = self.expire_payment_inner(payment_id).await;
        match outcome {
            Ok(Some(transaction_id)) => result.record_created(transaction_id),
            Ok(None) => {}
            Err(e) => result.record_error(format!("payment {payment_id} expiry: {e}")),
        }
        result
    }

    async fn expire_payment_inner(&self, payment_id: i64) -> Result<Option<i64>, AppError> {
        let pending = self.transactions.latest_pending_incoming(payment_id).await?;
        let mut merchant_id = None;

        if let Some(transaction) = &pending {
            self.transactions
                .cancel(
                    transaction,
                    &CancelUpdate {
                        status: TransactionStatus::Cancelled,
                        reason: "payment expired".to_string(),
                        network_fee: None,
                    },
                )
                .await?;
            merchant_id = Some(transaction.merchant_id);
        }

        // Expired is terminal on the payments side even when no quote was
        // ever provisioned.
        self.payments.mark_expired(payment_id).await?;
        if let Some(merchant_id) = merchant_id {
            self.events.publish(Event::PaymentStatusChanged {
                payment_id,
                merchant_id,
                status: "expired".to_string(),
            });
        }
        Ok(pending.map(|t| t.id))
    }
}

fn validate_payment_method_order(order: &PaymentMethodOrder) -> Result<(), AppError> {
    if order.payment_id < 1 {
        return Err(invalid_field("payment_id", "must be a positive id"));
    }
    if order.merchant_id < 1 {
        return Err(invalid_field("merchant_id", "must be a positive id"));
    }
    if !order.price.is_positive() {
        return Err(invalid_field("price", "must be greater than zero"));
    }
    if order.price.kind() != AmountKind::Fiat {
        return Err(invalid_field("price", "must be a fiat amount"));
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
    use crate::domain::Blockchain;
    use rust_decimal_macros::dec;

    fn order() -> PaymentMethodOrder {
        PaymentMethodOrder {
            payment_id: 77,
            merchant_id: 3,
            blockchain: Blockchain::Ethereum,
            ticker: "ETH".to_string(),
            price: Amount::usd(dec!(120)).unwrap(),
            is_test: false,
        }
    }

    #[test]
    fn test_validate_payment_method_order() {
        assert!(validate_payment_method_order(&order()).is_ok());

        let mut bad = order();
        bad.payment_id = 0;
        assert!(validate_payment_method_order(&bad).is_err());

        let mut bad = order();
        bad.merchant_id = -4;
        assert!(validate_payment_method_order(&bad).is_err());

        let mut bad = order();
        bad.price = Amount::usd(dec!(0)).unwrap();
        assert!(validate_payment_method_order(&bad).is_err());

        let mut bad = order();
        bad.price = Amount::crypto("ETH", dec!(1), 18).unwrap();
        assert!(validate_payment_method_order(&bad).is_err());
    }
}
