//! Deposit notification handling.
//!
//! The node gateway delivers one webhook per observed transfer to a
//! subscribed address. Deposits that match a pending incoming transaction
//! advance it; everything else is recorded as an unexpected deposit
//! credited to the system.

use std::str::FromStr;

use rust_decimal::Decimal;
use serde_json::{Value, json};
use tracing::{debug, info, instrument};
use uuid::Uuid;

use crate::domain::currency::{self, Blockchain, Currency, CurrencyType};
use crate::domain::{
    Amount, AppError, BlockchainError, Event, LockKey, MoneyError, NewTransaction, NodeWebhook,
    ReceiveUpdate, Transaction, TransactionStatus, TransactionType, ValidationError, Wallet,
    WalletError,
};

use super::Processing;

/// Underpayments within this USD value still count as paid in full
const UNDERPAY_TOLERANCE_USD_CENTS: i64 = 1;

impl Processing {
    /// Process one deposit notification for a subscribed wallet.
    ///
    /// The wallet and network come from the delivery URL; the webhook body
    /// carries the on-chain observation. Redelivered notifications are
    /// deduplicated by transaction hash.
    #[instrument(skip(self, webhook), fields(tx_id = %webhook.tx_id, asset = %webhook.asset))]
    pub async fn process_webhook(
        &self,
        wallet_uuid: Uuid,
        network_id: i64,
        webhook: NodeWebhook,
    ) -> Result<(), AppError> {
        if webhook.mempool {
            debug!("Ignoring mempool notification");
            return Ok(());
        }
        if webhook.transaction_kind == "fee" {
            debug!("Ignoring fee notification");
            return Ok(());
        }

        let wallet = self
            .wallets
            .wallet_by_uuid(&wallet_uuid)
            .await?
            .ok_or_else(|| AppError::Wallet(WalletError::NotFound(wallet_uuid.to_string())))?;

        let native = currency::native_coin(wallet.blockchain);
        let is_test = native.match_network_id(network_id).ok_or_else(|| {
            AppError::Blockchain(BlockchainError::UnsupportedAsset(format!(
                "network {network_id} does not belong to {}",
                wallet.blockchain
            )))
        })?;

        let deposit_currency = if webhook.asset.eq_ignore_ascii_case(native.ticker) {
            native
        } else {
            currency::find_by_contract(wallet.blockchain, &webhook.asset, is_test).ok_or_else(
                || {
                    AppError::Blockchain(BlockchainError::UnsupportedAsset(format!(
                        "unknown asset {} on {}",
                        webhook.asset, wallet.blockchain
                    )))
                },
            )?
        };

        let value = Decimal::from_str(webhook.amount.trim()).map_err(|_| {
            AppError::Money(MoneyError::InvalidAmount(format!(
                "webhook amount is not a decimal: {}",
                webhook.amount
            )))
        })?;
        let fact = Amount::crypto(deposit_currency.ticker, value, deposit_currency.decimals)?;

        let expected = if is_activation_transfer(wallet.blockchain, deposit_currency, &fact) {
            // Tron wallets receive a 1 sun transfer on first use to create
            // the account. It never belongs to a payment.
            None
        } else {
            self.transactions
                .find_expected_incoming(wallet.id, deposit_currency.ticker, network_id)
                .await?
        };

        match expected {
            Some(transaction) => {
                self.receive_expected_deposit(
                    &wallet,
                    deposit_currency,
                    network_id,
                    &transaction,
                    fact,
                    &webhook,
                )
                .await
            }
            None => {
                self.record_unexpected_deposit(
                    &wallet,
                    deposit_currency,
                    network_id,
                    is_test,
                    fact,
                    &webhook,
                )
                .await
            }
        }
    }

    /// Match an observed deposit against the pending incoming transaction
    /// on the wallet and move it into progress.
    async fn receive_expected_deposit(
        &self,
        wallet: &Wallet,
        currency: &'static Currency,
        network_id: i64,
        transaction: &Transaction,
        fact: Amount,
        webhook: &NodeWebhook,
    ) -> Result<(), AppError> {
        let sender = webhook.counter_address.clone().ok_or_else(|| {
            AppError::Validation(ValidationError::MissingField("counterAddress".to_string()))
        })?;

        let (status, metadata) = match resolve_deposit_amount(&transaction.amount, &fact) {
            DepositAssessment::Settled(metadata) => (TransactionStatus::InProgress, metadata),
            DepositAssessment::Short => {
                // One cent of slack absorbs rate drift between quoting the
                // payment and the sender dispatching it.
                let tolerance = self
                    .converter
                    .fiat_to_crypto(
                        &Amount::usd(Decimal::new(UNDERPAY_TOLERANCE_USD_CENTS, 2))?,
                        currency,
                    )
                    .await?;
                if fact.checked_add(&tolerance)?.compare(&transaction.amount)?.is_ge() {
                    (TransactionStatus::InProgress, Value::Object(Default::default()))
                } else {
                    (
                        TransactionStatus::InProgressInvalid,
                        json!({ "errorReason": "incoming tx amount is less than expected" }),
                    )
                }
            }
        };

        let lock = LockKey {
            wallet_id: wallet.id,
            currency: currency.ticker.to_string(),
            network_id,
        };
        let update = ReceiveUpdate {
            status,
            sender_address: sender,
            hash: webhook.tx_id.clone(),
            fact_amount: fact,
            metadata,
        };
        self.transactions
            .receive(transaction.id, &update, Some(&lock))
            .await?;

        if status == TransactionStatus::InProgress && transaction.entity_id != 0 {
            self.payments.mark_in_progress(transaction.entity_id).await?;
            self.events.publish(Event::PaymentStatusChanged {
                payment_id: transaction.entity_id,
                merchant_id: transaction.merchant_id,
                status: "in_progress".to_string(),
            });
        }

        info!(
            transaction_id = transaction.id,
            status = %status,
            "Received expected deposit"
        );
        Ok(())
    }

    /// Record a deposit no payment is waiting for so the funds stay on the
    /// books. The system absorbs it once confirmed.
    async fn record_unexpected_deposit(
        &self,
        wallet: &Wallet,
        currency: &'static Currency,
        network_id: i64,
        is_test: bool,
        fact: Amount,
        webhook: &NodeWebhook,
    ) -> Result<(), AppError> {
        if let Some(existing) = self
            .transactions
            .get_by_hash(network_id, &webhook.tx_id)
            .await?
        {
            debug!(
                transaction_id = existing.id,
                "Deposit already recorded, ignoring redelivery"
            );
            return Ok(());
        }

        let usd_amount = self.converter.crypto_to_fiat(&fact, "USD").await?;
        let created = self
            .transactions
            .create(&NewTransaction {
                transaction_type: TransactionType::Incoming,
                status: TransactionStatus::InProgress,
                entity_id: 0,
                merchant_id: 0,
                sender_wallet_id: None,
                recipient_wallet_id: Some(wallet.id),
                sender_address: webhook.counter_address.clone(),
                recipient_address: Some(wallet.address.clone()),
                blockchain: wallet.blockchain,
                network_id,
                currency_type: currency.currency_type,
                amount: fact.clone(),
                fact_amount: Some(fact.clone()),
                service_fee: Amount::zero(currency.ticker, currency.decimals, fact.kind()),
                network_fee: None,
                usd_amount,
                hash: Some(webhook.tx_id.clone()),
                is_test,
                metadata: json!({ "comment": "Unexpected transaction" }),
            })
            .await?;

        info!(
            transaction_id = created.id,
            wallet_id = wallet.id,
            amount = %fact,
            "Recorded unexpected deposit"
        );
        Ok(())
    }
}

/// Outcome of comparing the observed deposit against the quoted amount
enum DepositAssessment {
    /// Paid in full, with a note when overpaid
    Settled(Value),
    /// Short of the quote before tolerance is applied
    Short,
}

fn resolve_deposit_amount(expected: &Amount, fact: &Amount) -> DepositAssessment {
    match fact.compare(expected) {
        Ok(std::cmp::Ordering::Greater) => DepositAssessment::Settled(json!({
            "comment": "incoming tx amount is higher than expected"
        })),
        Ok(std::cmp::Ordering::Equal) => {
            DepositAssessment::Settled(Value::Object(Default::default()))
        }
        Ok(std::cmp::Ordering::Less) | Err(_) => DepositAssessment::Short,
    }
}

/// Tron account activation transfers move exactly one sun of TRX.
fn is_activation_transfer(
    blockchain: Blockchain,
    currency: &Currency,
    amount: &Amount,
) -> bool {
    blockchain == Blockchain::Tron
        && currency.currency_type == CurrencyType::Coin
        && amount.to_raw_string() == "1"
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn trx(value: Decimal) -> Amount {
        Amount::crypto("TRX", value, 6).unwrap()
    }

    #[test]
    fn test_activation_transfer_detection() {
        let tron_native = currency::native_coin(Blockchain::Tron);
        assert!(is_activation_transfer(
            Blockchain::Tron,
            tron_native,
            &trx(dec!(0.000001))
        ));
        assert!(!is_activation_transfer(
            Blockchain::Tron,
            tron_native,
            &trx(dec!(0.000002))
        ));

        let eth_native = currency::native_coin(Blockchain::Ethereum);
        let dust = Amount::from_raw("ETH", "1", 18).unwrap();
        assert!(!is_activation_transfer(
            Blockchain::Ethereum,
            eth_native,
            &dust
        ));
    }

    #[test]
    fn test_resolve_deposit_amount_exact_and_over() {
        let expected = trx(dec!(100));

        match resolve_deposit_amount(&expected, &trx(dec!(100))) {
            DepositAssessment::Settled(metadata) => {
                assert_eq!(metadata, Value::Object(Default::default()));
            }
            DepositAssessment::Short => panic!("exact payment must settle"),
        }

        match resolve_deposit_amount(&expected, &trx(dec!(150))) {
            DepositAssessment::Settled(metadata) => {
                assert_eq!(
                    metadata["comment"],
                    "incoming tx amount is higher than expected"
                );
            }
            DepositAssessment::Short => panic!("overpayment must settle"),
        }
    }

    #[test]
    fn test_resolve_deposit_amount_short() {
        let expected = trx(dec!(100));
        assert!(matches!(
            resolve_deposit_amount(&expected, &trx(dec!(99.9))),
            DepositAssessment::Short
        ));
    }
}
