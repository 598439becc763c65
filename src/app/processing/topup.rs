//! Virtual topups.
//!
//! A topup credits a merchant from the service float without touching any
//! blockchain. It only goes through while wallet holdings exceed merchant
//! claims by at least the topup amount, so the books stay backed by real
//! funds.

use rust_decimal::Decimal;
use serde_json::json;
use tracing::{info, instrument};

use crate::domain::currency;
use crate::domain::{
    Amount, AppError, Blockchain, BlockchainError, ConfirmUpdate, Event, LedgerError,
    NewTransaction, Transaction, TransactionStatus, TransactionType, ValidationError,
};

use super::Processing;

impl Processing {
    /// Credit a merchant from the service float.
    ///
    /// Creates the backing payment record first, then settles the virtual
    /// transaction immediately; there is no chain leg to wait for.
    #[instrument(skip(self), fields(merchant_id, ticker))]
    pub async fn create_topup(
        &self,
        merchant_id: i64,
        blockchain: Blockchain,
        ticker: &str,
        amount: Decimal,
        is_test: bool,
    ) -> Result<Transaction, AppError> {
        if merchant_id < 1 {
            return Err(AppError::Validation(ValidationError::InvalidField {
                field: "merchant_id".to_string(),
                message: "must be a positive id".to_string(),
            }));
        }
        let topup_currency = currency::find(blockchain, ticker).ok_or_else(|| {
            AppError::Blockchain(BlockchainError::UnsupportedAsset(format!(
                "{ticker} on {blockchain}"
            )))
        })?;
        let network_id = topup_currency.network_id(is_test);
        let amount = Amount::crypto(topup_currency.ticker, amount, topup_currency.decimals)?;
        if !amount.is_positive() {
            return Err(AppError::Validation(ValidationError::InvalidField {
                field: "amount".to_string(),
                message: "must be greater than zero".to_string(),
            }));
        }

        let float = self
            .ledger
            .system_balance(topup_currency.ticker, network_id)
            .await?
            .ok_or_else(|| {
                AppError::Ledger(LedgerError::BalanceNotFound(format!(
                    "no system float for {} on network {network_id}",
                    topup_currency.ticker
                )))
            })?;
        float.covers(&amount).map_err(AppError::Ledger)?;

        let usd_amount = self.converter.crypto_to_fiat(&amount, "USD").await?;
        let payment_id = self
            .payments
            .create_topup_payment(merchant_id, &amount, &usd_amount)
            .await?;

        let created = self
            .transactions
            .create(&NewTransaction {
                transaction_type: TransactionType::Virtual,
                status: TransactionStatus::InProgress,
                entity_id: payment_id,
                merchant_id,
                sender_wallet_id: None,
                recipient_wallet_id: None,
                sender_address: None,
                recipient_address: None,
                blockchain: topup_currency.blockchain,
                network_id,
                currency_type: topup_currency.currency_type,
                amount: amount.clone(),
                fact_amount: Some(amount.clone()),
                service_fee: Amount::zero(
                    topup_currency.ticker,
                    topup_currency.decimals,
                    amount.kind(),
                ),
                network_fee: None,
                usd_amount,
                hash: None,
                is_test,
                metadata: json!({ "comment": "internal system topup" }),
            })
            .await;
        let transaction = match created {
            Ok(transaction) => transaction,
            Err(e) => {
                self.sink_payment(payment_id, merchant_id, &e).await;
                return Err(e);
            }
        };

        let confirmed = self
            .transactions
            .confirm(
                &transaction,
                &ConfirmUpdate {
                    status: TransactionStatus::Completed,
                    fact_amount: amount.clone(),
                    network_fee: None,
                    zero_service_fee: false,
                },
            )
            .await;
        let confirmed = match confirmed {
            Ok(confirmed) => confirmed,
            Err(e) => {
                self.sink_payment(payment_id, merchant_id, &e).await;
                return Err(e);
            }
        };

        self.payments.mark_succeeded(payment_id).await?;
        self.events.publish(Event::PaymentStatusChanged {
            payment_id,
            merchant_id,
            status: "succeeded".to_string(),
        });

        info!(
            transaction_id = confirmed.id,
            merchant_id,
            amount = %amount,
            "Created virtual topup"
        );
        Ok(confirmed)
    }
}
