//! Transaction settlement service.
//!
//! Owns the transaction state machine. Confirmation is the only transition
//! that moves money: the balance changes it produces are computed here and
//! applied by the store in the same database transaction as the status
//! update, so a crash can never leave a confirmed row with unpaid balances.

use serde_json::json;
use std::sync::Arc;
use tracing::{info, instrument};

use crate::domain::{
    Amount, AmountKind, AppError, BalanceOperation, BalanceOwner, BalanceUpdate, BlockchainError,
    CancelUpdate, ConfirmUpdate, LedgerStore, LockKey, NewTransaction, ReceiveUpdate,
    SYSTEM_MERCHANT_ID, Transaction, TransactionError, TransactionStatus, TransactionStore,
    TransactionType, ValidationError,
};

/// Application service for transaction lifecycle and settlement
pub struct Transactions {
    store: Arc<dyn TransactionStore>,
    ledger: Arc<dyn LedgerStore>,
}

impl Transactions {
    #[must_use]
    pub fn new(store: Arc<dyn TransactionStore>, ledger: Arc<dyn LedgerStore>) -> Self {
        Self { store, ledger }
    }

    #[instrument(skip(self))]
    pub async fn get(&self, transaction_id: i64) -> Result<Transaction, AppError> {
        self.store
            .get_transaction(transaction_id)
            .await?
            .ok_or_else(|| AppError::Transaction(TransactionError::NotFound(transaction_id)))
    }

    #[instrument(skip(self))]
    pub async fn get_by_hash(
        &self,
        network_id: i64,
        hash: &str,
    ) -> Result<Option<Transaction>, AppError> {
        self.store.get_transaction_by_hash(network_id, hash).await
    }

    /// The latest pending incoming transaction for a payment, if any
    #[instrument(skip(self))]
    pub async fn latest_pending_incoming(
        &self,
        entity_id: i64,
    ) -> Result<Option<Transaction>, AppError> {
        self.store
            .get_latest_by_entity(
                entity_id,
                TransactionType::Incoming,
                &[TransactionStatus::Pending],
            )
            .await
    }

    /// The pending incoming transaction a deposit on this wallet should match
    #[instrument(skip(self))]
    pub async fn find_expected_incoming(
        &self,
        wallet_id: i64,
        ticker: &str,
        network_id: i64,
    ) -> Result<Option<Transaction>, AppError> {
        self.store
            .find_expected_incoming(wallet_id, ticker, network_id)
            .await
    }

    /// Transactions of a type still waiting for a chain outcome
    #[instrument(skip(self))]
    pub async fn list_in_progress(
        &self,
        transaction_type: TransactionType,
        limit: i64,
    ) -> Result<Vec<Transaction>, AppError> {
        self.store
            .list_by_status(
                transaction_type,
                &[
                    TransactionStatus::InProgress,
                    TransactionStatus::InProgressInvalid,
                ],
                limit,
            )
            .await
    }

    /// Create a transaction after validating its shape for the given type
    #[instrument(skip(self, new), fields(transaction_type = %new.transaction_type, amount = %new.amount))]
    pub async fn create(&self, new: &NewTransaction) -> Result<Transaction, AppError> {
        validate_creation(new)?;
        let transaction = self.store.create_transaction(new).await?;
        info!(
            transaction_id = transaction.id,
            entity_id = transaction.entity_id,
            "Created {} transaction",
            transaction.transaction_type
        );
        Ok(transaction)
    }

    /// Record the first on-chain observation of a pending incoming
    /// transaction. The wallet lock, when given, is released in the same
    /// database transaction as the status change.
    #[instrument(skip(self, update, lock), fields(status = %update.status))]
    pub async fn receive(
        &self,
        transaction_id: i64,
        update: &ReceiveUpdate,
        lock: Option<&LockKey>,
    ) -> Result<Transaction, AppError> {
        if !matches!(
            update.status,
            TransactionStatus::InProgress | TransactionStatus::InProgressInvalid
        ) {
            return Err(AppError::Transaction(TransactionError::InvalidCreation(
                format!("cannot receive into status {}", update.status),
            )));
        }
        if update.sender_address.is_empty() {
            return Err(missing_field("sender_address"));
        }
        if update.hash.is_empty() {
            return Err(missing_field("hash"));
        }
        if !update.fact_amount.is_positive() {
            return Err(AppError::Transaction(TransactionError::MissingFactAmount(
                transaction_id,
            )));
        }

        self.store
            .receive_transaction(transaction_id, TransactionStatus::Pending, update, lock)
            .await
    }

    /// Confirm a transaction and settle its balances.
    ///
    /// The caller passes the transaction as it last read it; if the row has
    /// moved on since, the store rejects the transition.
    #[instrument(skip(self, transaction, update), fields(transaction_id = transaction.id, status = %update.status))]
    pub async fn confirm(
        &self,
        transaction: &Transaction,
        update: &ConfirmUpdate,
    ) -> Result<Transaction, AppError> {
        if update.status == transaction.status {
            return Err(AppError::Transaction(TransactionError::SameStatus {
                id: transaction.id,
                status: transaction.status,
            }));
        }
        if !update.fact_amount.is_positive() {
            return Err(AppError::Transaction(TransactionError::MissingFactAmount(
                transaction.id,
            )));
        }

        let updates = settlement_updates(transaction, update)?;
        let confirmed = self
            .store
            .confirm_transaction(transaction.id, transaction.status, update, &updates)
            .await?;
        info!(
            transaction_id = confirmed.id,
            balance_updates = updates.len(),
            "Confirmed {} transaction as {}",
            confirmed.transaction_type,
            confirmed.status
        );
        Ok(confirmed)
    }

    /// Cancel or fail a transaction.
    ///
    /// A non-zero network fee is charged to the sender wallet first, as its
    /// own operation: the chain took that fee even though the transaction
    /// never settled. Incoming cancellations release the wallet lock.
    #[instrument(skip(self, transaction, update), fields(transaction_id = transaction.id, status = %update.status))]
    pub async fn cancel(
        &self,
        transaction: &Transaction,
        update: &CancelUpdate,
    ) -> Result<Transaction, AppError> {
        if !matches!(
            update.status,
            TransactionStatus::Cancelled | TransactionStatus::Failed
        ) {
            return Err(AppError::Transaction(TransactionError::InvalidCreation(
                format!("cannot cancel into status {}", update.status),
            )));
        }

        // Charge the fee only when one of our wallets paid it. A failed
        // deposit's fee was spent by the external sender.
        if let (Some(fee), Some(sender_wallet_id)) =
            (&update.network_fee, transaction.sender_wallet_id)
        {
            if !fee.is_zero() {
                let network_currency = transaction.network_currency();
                let charge = BalanceUpdate::new(
                    BalanceOwner::wallet(sender_wallet_id),
                    network_currency,
                    transaction.is_test,
                    BalanceOperation::Decrement,
                    fee.clone(),
                    &format!(
                        "network fee for canceled {} tx",
                        transaction.transaction_type
                    ),
                )
                .with_metadata(json!({
                    "senderWalletId": sender_wallet_id,
                    "transactionId": transaction.id,
                }));
                self.ledger.apply_update(&charge).await?;
            }
        }

        let lock = incoming_lock_key(transaction);
        let cancelled = self
            .store
            .cancel_transaction(transaction.id, update, lock.as_ref())
            .await?;
        info!(
            transaction_id = cancelled.id,
            reason = %update.reason,
            "Cancelled {} transaction as {}",
            cancelled.transaction_type,
            cancelled.status
        );
        Ok(cancelled)
    }

    /// Record the on-chain hash of a broadcast transaction
    #[instrument(skip(self))]
    pub async fn set_hash(&self, transaction_id: i64, hash: &str) -> Result<(), AppError> {
        self.store.set_transaction_hash(transaction_id, hash).await
    }
}

fn missing_field(field: &str) -> AppError {
    AppError::Validation(ValidationError::MissingField(field.to_string()))
}

fn invalid_creation(message: impl Into<String>) -> AppError {
    AppError::Transaction(TransactionError::InvalidCreation(message.into()))
}

/// The wallet lock an incoming transaction holds, if it holds one
fn incoming_lock_key(transaction: &Transaction) -> Option<LockKey> {
    match (
        transaction.transaction_type,
        transaction.recipient_wallet_id,
    ) {
        (TransactionType::Incoming, Some(wallet_id)) => Some(LockKey {
            wallet_id,
            currency: transaction.ticker().to_string(),
            network_id: transaction.network_id,
        }),
        _ => None,
    }
}

fn validate_creation(new: &NewTransaction) -> Result<(), AppError> {
    if !new.amount.is_positive() {
        return Err(invalid_creation("amount must be positive"));
    }
    if !new.service_fee.is_compatible(&new.amount) {
        return Err(invalid_creation(format!(
            "service fee {} is not compatible with amount {}",
            new.service_fee, new.amount
        )));
    }
    if new.usd_amount.kind() != AmountKind::Fiat || new.usd_amount.ticker() != "USD" {
        return Err(invalid_creation("usd_amount must be denominated in USD"));
    }

    match new.transaction_type {
        TransactionType::Incoming => {
            if new.recipient_wallet_id.is_none() {
                return Err(invalid_creation(
                    "incoming transaction requires a recipient wallet",
                ));
            }
            if new.entity_id == 0 && new.hash.is_none() {
                return Err(invalid_creation(
                    "unexpected incoming transaction requires a hash",
                ));
            }
        }
        TransactionType::Internal => {
            if new.entity_id != 0 {
                return Err(invalid_creation(
                    "internal transaction cannot reference a payment",
                ));
            }
            if new.sender_wallet_id.is_none() || new.recipient_wallet_id.is_none() {
                return Err(invalid_creation(
                    "internal transaction requires sender and recipient wallets",
                ));
            }
        }
        TransactionType::Withdrawal => {
            if new.entity_id == 0 {
                return Err(invalid_creation("withdrawal requires a payment"));
            }
            if new.sender_wallet_id.is_none() {
                return Err(invalid_creation("withdrawal requires a sender wallet"));
            }
            if new.recipient_address.as_deref().map_or(true, str::is_empty) {
                return Err(invalid_creation("withdrawal requires a recipient address"));
            }
        }
        TransactionType::Virtual => {
            if !new.service_fee.is_zero() {
                return Err(invalid_creation(
                    "virtual transaction cannot carry a service fee",
                ));
            }
            if new.entity_id == 0 {
                return Err(invalid_creation("virtual transaction requires a payment"));
            }
            if new.sender_wallet_id.is_some()
                || new.recipient_wallet_id.is_some()
                || new.hash.is_some()
            {
                return Err(invalid_creation(
                    "virtual transaction cannot reference wallets or a hash",
                ));
            }
        }
    }
    Ok(())
}

/// Balance changes a confirmation settles, in application order.
///
/// Incoming deposits credit the receiving wallet with what actually arrived
/// and the merchant with what was promised, less the service fee. Outgoing
/// transactions already paid their principal at creation, so confirmation
/// only charges the network fee. Virtual topups credit the merchant alone.
fn settlement_updates(
    transaction: &Transaction,
    update: &ConfirmUpdate,
) -> Result<Vec<BalanceUpdate>, AppError> {
    if !matches!(
        update.status,
        TransactionStatus::Completed | TransactionStatus::CompletedInvalid
    ) {
        return Err(AppError::Transaction(TransactionError::InvalidTransition {
            id: transaction.id,
            from: transaction.status,
            to: update.status,
        }));
    }

    let currency = transaction.resolve_currency().ok_or_else(|| {
        AppError::Blockchain(BlockchainError::UnsupportedAsset(format!(
            "{} on {}",
            transaction.ticker(),
            transaction.blockchain
        )))
    })?;
    let hash = transaction.hash.as_deref().unwrap_or("");
    let fact = &update.fact_amount;
    let mut updates = Vec::new();

    match transaction.transaction_type {
        TransactionType::Incoming => {
            let recipient_wallet_id = transaction
                .recipient_wallet_id
                .ok_or_else(|| missing_field("recipient_wallet_id"))?;
            updates.push(
                BalanceUpdate::new(
                    BalanceOwner::wallet(recipient_wallet_id),
                    currency,
                    transaction.is_test,
                    BalanceOperation::Increment,
                    fact.clone(),
                    &format!("incoming tx {hash}"),
                )
                .with_metadata(json!({
                    "recipientWalletId": recipient_wallet_id,
                    "merchantId": transaction.merchant_id,
                    "transactionId": transaction.id,
                })),
            );

            // An invalid deposit stays on the wallet until a human resolves
            // it; the merchant is only credited for valid ones.
            if update.status != TransactionStatus::CompletedInvalid
                && transaction.merchant_id != SYSTEM_MERCHANT_ID
            {
                let credited = fact
                    .min(&transaction.amount)?
                    .checked_sub(&transaction.service_fee)?;
                if !credited.is_zero() {
                    updates.push(
                        BalanceUpdate::new(
                            BalanceOwner::merchant(transaction.merchant_id),
                            currency,
                            transaction.is_test,
                            BalanceOperation::Increment,
                            credited,
                            &format!("incoming tx {hash}"),
                        )
                        .with_metadata(json!({
                            "merchantId": transaction.merchant_id,
                            "transactionId": transaction.id,
                        })),
                    );
                }
            }
        }
        TransactionType::Internal => {
            let recipient_wallet_id = transaction
                .recipient_wallet_id
                .ok_or_else(|| missing_field("recipient_wallet_id"))?;
            updates.push(
                BalanceUpdate::new(
                    BalanceOwner::wallet(recipient_wallet_id),
                    currency,
                    transaction.is_test,
                    BalanceOperation::Increment,
                    fact.clone(),
                    &format!("incoming tx {hash}"),
                )
                .with_metadata(json!({
                    "recipientWalletId": recipient_wallet_id,
                    "transactionId": transaction.id,
                })),
            );
            push_network_fee(&mut updates, transaction, update, hash)?;
        }
        TransactionType::Withdrawal => {
            push_network_fee(&mut updates, transaction, update, hash)?;
        }
        TransactionType::Virtual => {
            if update.status != TransactionStatus::Completed {
                return Err(AppError::Transaction(TransactionError::InvalidTransition {
                    id: transaction.id,
                    from: transaction.status,
                    to: update.status,
                }));
            }
            if transaction.merchant_id == SYSTEM_MERCHANT_ID {
                return Err(invalid_creation(
                    "virtual transaction requires a merchant",
                ));
            }
            updates.push(
                BalanceUpdate::new(
                    BalanceOwner::merchant(transaction.merchant_id),
                    currency,
                    transaction.is_test,
                    BalanceOperation::Increment,
                    fact.clone(),
                    "virtual system topup",
                )
                .with_metadata(json!({
                    "merchantId": transaction.merchant_id,
                    "transactionId": transaction.id,
                })),
            );
        }
    }

    Ok(updates)
}

/// Charge the confirmed network fee to the sender wallet, in native coin
fn push_network_fee(
    updates: &mut Vec<BalanceUpdate>,
    transaction: &Transaction,
    update: &ConfirmUpdate,
    hash: &str,
) -> Result<(), AppError> {
    let Some(fee) = &update.network_fee else {
        return Ok(());
    };
    if fee.is_zero() {
        return Ok(());
    }

    let sender_wallet_id = transaction
        .sender_wallet_id
        .ok_or_else(|| missing_field("sender_wallet_id"))?;
    let network_currency = transaction.network_currency();
    updates.push(
        BalanceUpdate::new(
            BalanceOwner::wallet(sender_wallet_id),
            network_currency,
            transaction.is_test,
            BalanceOperation::Decrement,
            fee.clone(),
            &format!(
                "decrementing balance as a fee to {} tx {hash} ({})",
                transaction.transaction_type, network_currency.ticker
            ),
        )
        .with_metadata(json!({
            "senderWalletId": sender_wallet_id,
            "transactionId": transaction.id,
        })),
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{Blockchain, CurrencyType};
    use chrono::Utc;
    use rust_decimal_macros::dec;
    use serde_json::Value;
    use uuid::Uuid;

    fn eth(value: rust_decimal::Decimal) -> Amount {
        Amount::crypto("ETH", value, 18).unwrap()
    }

    fn sample_transaction(transaction_type: TransactionType) -> Transaction {
        Transaction {
            id: 42,
            uuid: Uuid::nil(),
            transaction_type,
            status: TransactionStatus::InProgress,
            entity_id: 7,
            merchant_id: 3,
            sender_wallet_id: Some(10),
            recipient_wallet_id: Some(11),
            sender_address: Some("0xSender".to_string()),
            recipient_address: Some("0xRecipient".to_string()),
            blockchain: Blockchain::Ethereum,
            network_id: 1,
            currency_type: CurrencyType::Coin,
            amount: eth(dec!(1)),
            fact_amount: None,
            service_fee: eth(dec!(0.1)),
            network_fee: None,
            usd_amount: Amount::usd(dec!(3000)).unwrap(),
            hash: Some("0xabc".to_string()),
            is_test: false,
            metadata: Value::Object(serde_json::Map::new()),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    fn completed(fact: Amount) -> ConfirmUpdate {
        ConfirmUpdate {
            status: TransactionStatus::Completed,
            fact_amount: fact,
            network_fee: None,
            zero_service_fee: false,
        }
    }

    #[test]
    fn test_incoming_settlement_credits_wallet_and_merchant() {
        let transaction = sample_transaction(TransactionType::Incoming);
        let updates = settlement_updates(&transaction, &completed(eth(dec!(1.2)))).unwrap();

        assert_eq!(updates.len(), 2);
        // Wallet gets what actually arrived.
        assert_eq!(updates[0].owner, BalanceOwner::wallet(11));
        assert_eq!(updates[0].operation, BalanceOperation::Increment);
        assert_eq!(updates[0].amount.value(), dec!(1.2));
        assert_eq!(updates[0].comment, "incoming tx 0xabc");
        // Merchant gets at most what was promised, less the service fee.
        assert_eq!(updates[1].owner, BalanceOwner::merchant(3));
        assert_eq!(updates[1].amount.value(), dec!(0.9));
    }

    #[test]
    fn test_incoming_underpayment_credits_fact_minus_fee() {
        let transaction = sample_transaction(TransactionType::Incoming);
        let updates = settlement_updates(&transaction, &completed(eth(dec!(0.5)))).unwrap();

        assert_eq!(updates[0].amount.value(), dec!(0.5));
        assert_eq!(updates[1].amount.value(), dec!(0.4));
    }

    #[test]
    fn test_completed_invalid_skips_merchant_credit() {
        let transaction = sample_transaction(TransactionType::Incoming);
        let update = ConfirmUpdate {
            status: TransactionStatus::CompletedInvalid,
            fact_amount: eth(dec!(0.5)),
            network_fee: None,
            zero_service_fee: true,
        };
        let updates = settlement_updates(&transaction, &update).unwrap();

        assert_eq!(updates.len(), 1);
        assert_eq!(updates[0].owner, BalanceOwner::wallet(11));
    }

    #[test]
    fn test_system_incoming_skips_merchant_credit() {
        let mut transaction = sample_transaction(TransactionType::Incoming);
        transaction.merchant_id = SYSTEM_MERCHANT_ID;
        let updates = settlement_updates(&transaction, &completed(eth(dec!(1)))).unwrap();

        assert_eq!(updates.len(), 1);
        assert_eq!(updates[0].owner, BalanceOwner::wallet(11));
    }

    #[test]
    fn test_internal_settlement_moves_funds_and_charges_fee() {
        let transaction = sample_transaction(TransactionType::Internal);
        let update = ConfirmUpdate {
            status: TransactionStatus::Completed,
            fact_amount: eth(dec!(1)),
            network_fee: Some(eth(dec!(0.002))),
            zero_service_fee: false,
        };
        let updates = settlement_updates(&transaction, &update).unwrap();

        assert_eq!(updates.len(), 2);
        assert_eq!(updates[0].owner, BalanceOwner::wallet(11));
        assert_eq!(updates[0].operation, BalanceOperation::Increment);
        assert_eq!(updates[1].owner, BalanceOwner::wallet(10));
        assert_eq!(updates[1].operation, BalanceOperation::Decrement);
        assert_eq!(updates[1].amount.value(), dec!(0.002));
        assert_eq!(updates[1].amount.ticker(), "ETH");
        assert_eq!(
            updates[1].comment,
            "decrementing balance as a fee to internal tx 0xabc (ETH)"
        );
    }

    #[test]
    fn test_withdrawal_settlement_charges_fee_only() {
        let transaction = sample_transaction(TransactionType::Withdrawal);
        let update = ConfirmUpdate {
            status: TransactionStatus::Completed,
            fact_amount: eth(dec!(1)),
            network_fee: Some(eth(dec!(0.003))),
            zero_service_fee: false,
        };
        let updates = settlement_updates(&transaction, &update).unwrap();

        // The principal was debited at creation.
        assert_eq!(updates.len(), 1);
        assert_eq!(updates[0].owner, BalanceOwner::wallet(10));
        assert_eq!(updates[0].operation, BalanceOperation::Decrement);
    }

    #[test]
    fn test_token_network_fee_is_charged_in_native_coin() {
        let mut transaction = sample_transaction(TransactionType::Withdrawal);
        transaction.blockchain = Blockchain::Tron;
        transaction.network_id = 728126428;
        transaction.currency_type = CurrencyType::Token;
        transaction.amount = Amount::crypto("USDT", dec!(100), 6).unwrap();
        transaction.service_fee = Amount::crypto("USDT", dec!(1), 6).unwrap();

        let update = ConfirmUpdate {
            status: TransactionStatus::Completed,
            fact_amount: Amount::crypto("USDT", dec!(100), 6).unwrap(),
            network_fee: Some(Amount::crypto("TRX", dec!(27), 6).unwrap()),
            zero_service_fee: false,
        };
        let updates = settlement_updates(&transaction, &update).unwrap();

        assert_eq!(updates.len(), 1);
        assert_eq!(updates[0].amount.ticker(), "TRX");
    }

    #[test]
    fn test_virtual_settlement_credits_merchant() {
        let mut transaction = sample_transaction(TransactionType::Virtual);
        transaction.sender_wallet_id = None;
        transaction.recipient_wallet_id = None;
        transaction.hash = None;

        let updates = settlement_updates(&transaction, &completed(eth(dec!(2)))).unwrap();
        assert_eq!(updates.len(), 1);
        assert_eq!(updates[0].owner, BalanceOwner::merchant(3));
        assert_eq!(updates[0].comment, "virtual system topup");
    }

    #[test]
    fn test_virtual_settlement_rejects_invalid_outcome() {
        let transaction = sample_transaction(TransactionType::Virtual);
        let update = ConfirmUpdate {
            status: TransactionStatus::CompletedInvalid,
            fact_amount: eth(dec!(2)),
            network_fee: None,
            zero_service_fee: false,
        };
        assert!(matches!(
            settlement_updates(&transaction, &update),
            Err(AppError::Transaction(
                TransactionError::InvalidTransition { .. }
            ))
        ));
    }

    #[test]
    fn test_settlement_rejects_non_terminal_target() {
        let transaction = sample_transaction(TransactionType::Incoming);
        let update = ConfirmUpdate {
            status: TransactionStatus::Failed,
            fact_amount: eth(dec!(1)),
            network_fee: None,
            zero_service_fee: false,
        };
        assert!(settlement_updates(&transaction, &update).is_err());
    }

    fn sample_new(transaction_type: TransactionType) -> NewTransaction {
        NewTransaction {
            transaction_type,
            status: TransactionStatus::Pending,
            entity_id: 7,
            merchant_id: 3,
            sender_wallet_id: Some(10),
            recipient_wallet_id: Some(11),
            sender_address: None,
            recipient_address: Some("0xRecipient".to_string()),
            blockchain: Blockchain::Ethereum,
            network_id: 1,
            currency_type: CurrencyType::Coin,
            amount: eth(dec!(1)),
            fact_amount: None,
            service_fee: eth(dec!(0.1)),
            network_fee: None,
            usd_amount: Amount::usd(dec!(3000)).unwrap(),
            hash: None,
            is_test: false,
            metadata: Value::Object(serde_json::Map::new()),
        }
    }

    #[test]
    fn test_validate_creation_accepts_expected_incoming() {
        assert!(validate_creation(&sample_new(TransactionType::Incoming)).is_ok());
    }

    #[test]
    fn test_validate_creation_rejects_zero_amount() {
        let mut new = sample_new(TransactionType::Incoming);
        new.amount = eth(dec!(0));
        assert!(validate_creation(&new).is_err());
    }

    #[test]
    fn test_validate_creation_rejects_mismatched_service_fee() {
        let mut new = sample_new(TransactionType::Incoming);
        new.service_fee = Amount::crypto("USDT", dec!(0.1), 6).unwrap();
        assert!(validate_creation(&new).is_err());
    }

    #[test]
    fn test_validate_creation_rejects_non_usd_quote() {
        let mut new = sample_new(TransactionType::Incoming);
        new.usd_amount = eth(dec!(1));
        assert!(validate_creation(&new).is_err());
    }

    #[test]
    fn test_validate_creation_unexpected_incoming_requires_hash() {
        let mut new = sample_new(TransactionType::Incoming);
        new.entity_id = 0;
        assert!(validate_creation(&new).is_err());

        new.hash = Some("0xabc".to_string());
        assert!(validate_creation(&new).is_ok());
    }

    #[test]
    fn test_validate_creation_internal_rules() {
        let mut new = sample_new(TransactionType::Internal);
        assert!(validate_creation(&new).is_err());

        new.entity_id = 0;
        assert!(validate_creation(&new).is_ok());

        new.sender_wallet_id = None;
        assert!(validate_creation(&new).is_err());
    }

    #[test]
    fn test_validate_creation_withdrawal_rules() {
        let mut new = sample_new(TransactionType::Withdrawal);
        assert!(validate_creation(&new).is_ok());

        new.recipient_address = Some(String::new());
        assert!(validate_creation(&new).is_err());
    }

    #[test]
    fn test_validate_creation_virtual_rules() {
        let mut new = sample_new(TransactionType::Virtual);
        new.sender_wallet_id = None;
        new.recipient_wallet_id = None;
        new.service_fee = eth(dec!(0));
        assert!(validate_creation(&new).is_ok());

        new.service_fee = eth(dec!(0.1));
        assert!(validate_creation(&new).is_err());
    }

    #[test]
    fn test_incoming_lock_key_only_for_incoming_with_wallet() {
        let transaction = sample_transaction(TransactionType::Incoming);
        let key = incoming_lock_key(&transaction).unwrap();
        assert_eq!(key.wallet_id, 11);
        assert_eq!(key.currency, "ETH");
        assert_eq!(key.network_id, 1);

        assert!(incoming_lock_key(&sample_transaction(TransactionType::Withdrawal)).is_none());
    }
}
