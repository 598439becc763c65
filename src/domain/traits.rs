//! Domain traits defining contracts for storage and external systems.
//!
//! Each port is deliberately narrow: services receive exactly the
//! capabilities they use, which keeps test doubles small and swaps cheap.

use async_trait::async_trait;
use uuid::Uuid;

use super::currency::{Blockchain, Currency};
use super::error::AppError;
use super::money::Amount;
use super::types::{
    Balance, BalanceOwner, BalanceOwnerType, BalanceUpdate, CancelUpdate, ConfirmUpdate,
    CreatedWallet, Event, FeeEstimate, LockKey, NewTransaction, ReceiveUpdate, SigningRequest,
    Transaction, TransactionReceipt, TransactionStatus, TransactionType, Wallet, WalletLock,
    WalletType, WithdrawalOrder,
};

/// Balance persistence with audit trail
#[async_trait]
pub trait LedgerStore: Send + Sync {
    /// Get a balance by owner, ticker and network
    async fn get_balance(
        &self,
        owner: BalanceOwner,
        ticker: &str,
        network_id: i64,
    ) -> Result<Option<Balance>, AppError>;

    /// Get a balance by primary key
    async fn get_balance_by_id(&self, id: i64) -> Result<Option<Balance>, AppError>;

    /// List all balances owned by merchants or by wallets
    async fn list_balances(&self, owner_type: BalanceOwnerType) -> Result<Vec<Balance>, AppError>;

    /// List balances held on inbound wallets, paginated by primary key
    async fn list_inbound_wallet_balances(
        &self,
        offset: i64,
        limit: i64,
    ) -> Result<Vec<Balance>, AppError>;

    /// Apply one balance change and write its audit record
    async fn apply_update(&self, update: &BalanceUpdate) -> Result<Balance, AppError>;

    /// Apply several balance changes in a single database transaction
    async fn apply_updates(&self, updates: &[BalanceUpdate]) -> Result<Vec<Balance>, AppError>;
}

/// Wallet, lock and nonce persistence
#[async_trait]
pub trait WalletStore: Send + Sync {
    /// Persist a wallet created by the signing service
    async fn create_wallet(
        &self,
        blockchain: Blockchain,
        wallet_type: WalletType,
        uuid: Uuid,
        address: &str,
    ) -> Result<Wallet, AppError>;

    /// Get a wallet by primary key
    async fn get_wallet(&self, id: i64) -> Result<Option<Wallet>, AppError>;

    /// Get a wallet by its signing-service UUID
    async fn get_wallet_by_uuid(&self, uuid: &Uuid) -> Result<Option<Wallet>, AppError>;

    /// Get the outbound wallet for a blockchain
    async fn get_outbound_wallet(&self, blockchain: Blockchain)
        -> Result<Option<Wallet>, AppError>;

    /// Store the node gateway subscription id for a wallet
    async fn set_subscription_id(
        &self,
        wallet_id: i64,
        is_test: bool,
        subscription_id: &str,
    ) -> Result<(), AppError>;

    /// Atomically pick a free inbound wallet and lock it for a payment.
    /// Returns `None` when every inbound wallet is already claimed.
    async fn acquire_available_wallet(
        &self,
        merchant_id: i64,
        blockchain: Blockchain,
        ticker: &str,
        network_id: i64,
    ) -> Result<Option<(Wallet, WalletLock)>, AppError>;

    /// Lock a specific wallet for a payment
    async fn lock_wallet(
        &self,
        wallet_id: i64,
        merchant_id: i64,
        ticker: &str,
        network_id: i64,
    ) -> Result<WalletLock, AppError>;

    /// Release a wallet lock
    async fn release_lock(&self, key: &LockKey) -> Result<(), AppError>;

    /// Reserve the next nonce for signing. Returns the nonce value and
    /// leaves it pending until confirmed or rolled back.
    async fn increment_pending_nonce(&self, wallet_id: i64, is_test: bool)
        -> Result<i64, AppError>;

    /// Move one pending nonce to confirmed
    async fn confirm_pending_nonce(&self, wallet_id: i64, is_test: bool) -> Result<(), AppError>;

    /// Drop one pending nonce after a failed signing or broadcast
    async fn rollback_pending_nonce(&self, wallet_id: i64, is_test: bool) -> Result<(), AppError>;
}

/// Transaction persistence and guarded status transitions.
///
/// Transition methods update the row only while it still has
/// `expected_status`, so concurrent processors cannot double-settle.
#[async_trait]
pub trait TransactionStore: Send + Sync {
    /// Insert a new transaction row
    async fn create_transaction(&self, new: &NewTransaction) -> Result<Transaction, AppError>;

    /// Get a transaction by primary key
    async fn get_transaction(&self, id: i64) -> Result<Option<Transaction>, AppError>;

    /// Get a transaction by network and on-chain hash
    async fn get_transaction_by_hash(
        &self,
        network_id: i64,
        hash: &str,
    ) -> Result<Option<Transaction>, AppError>;

    /// Latest transaction for an external payment, filtered by type and status
    async fn get_latest_by_entity(
        &self,
        entity_id: i64,
        transaction_type: TransactionType,
        statuses: &[TransactionStatus],
    ) -> Result<Option<Transaction>, AppError>;

    /// The pending incoming transaction a deposit on this wallet should match
    async fn find_expected_incoming(
        &self,
        wallet_id: i64,
        ticker: &str,
        network_id: i64,
    ) -> Result<Option<Transaction>, AppError>;

    /// List transactions of a type in any of the given statuses
    async fn list_by_status(
        &self,
        transaction_type: TransactionType,
        statuses: &[TransactionStatus],
        limit: i64,
    ) -> Result<Vec<Transaction>, AppError>;

    /// Record the first on-chain observation, releasing the wallet lock
    /// in the same database transaction when a key is given
    async fn receive_transaction(
        &self,
        id: i64,
        expected_status: TransactionStatus,
        update: &ReceiveUpdate,
        release_lock: Option<&LockKey>,
    ) -> Result<Transaction, AppError>;

    /// Finalize a transaction and apply its settlement balance changes
    /// in the same database transaction
    async fn confirm_transaction(
        &self,
        id: i64,
        expected_status: TransactionStatus,
        update: &ConfirmUpdate,
        settlement: &[BalanceUpdate],
    ) -> Result<Transaction, AppError>;

    /// Cancel or fail a transaction, releasing the wallet lock in the
    /// same database transaction when a key is given
    async fn cancel_transaction(
        &self,
        id: i64,
        update: &CancelUpdate,
        release_lock: Option<&LockKey>,
    ) -> Result<Transaction, AppError>;

    /// Attach the broadcast hash to a transaction
    async fn set_transaction_hash(&self, id: i64, hash: &str) -> Result<(), AppError>;
}

/// Exclusive processing claim on one external payment
#[async_trait]
pub trait PaymentGuard: Send {
    /// Release the claim. Dropping without releasing also frees it.
    async fn release(self: Box<Self>) -> Result<(), AppError>;
}

/// Issues processing claims keyed by external payment id
#[async_trait]
pub trait PaymentGuardStore: Send + Sync {
    /// Block until this payment can be processed exclusively
    async fn lock_payment(&self, payment_id: i64) -> Result<Box<dyn PaymentGuard>, AppError>;
}

/// Key management service that holds private keys and signs on our behalf
#[async_trait]
pub trait SigningClient: Send + Sync {
    /// Create a new custodial wallet
    async fn create_wallet(&self, blockchain: Blockchain) -> Result<CreatedWallet, AppError>;

    /// Produce a signed raw transaction ready for broadcast
    async fn sign_transaction(&self, request: &SigningRequest) -> Result<String, AppError>;
}

/// Blockchain node access for broadcasting and receipt lookups
#[async_trait]
pub trait Broadcaster: Send + Sync {
    /// Broadcast a signed raw transaction, returning its hash
    async fn broadcast_transaction(
        &self,
        blockchain: Blockchain,
        raw: &str,
        is_test: bool,
    ) -> Result<String, AppError>;

    /// Fetch the receipt for a transaction hash
    async fn get_transaction_receipt(
        &self,
        blockchain: Blockchain,
        hash: &str,
        is_test: bool,
    ) -> Result<TransactionReceipt, AppError>;
}

/// Network fee estimation
#[async_trait]
pub trait FeeCalculator: Send + Sync {
    /// Estimate the worst-case network fee for one transfer of a currency
    async fn estimate_fee(
        &self,
        currency: &Currency,
        is_test: bool,
    ) -> Result<FeeEstimate, AppError>;

    /// Service fee charged to merchants for a withdrawal, in USD
    async fn withdrawal_fee_usd(
        &self,
        currency: &Currency,
        is_test: bool,
    ) -> Result<Amount, AppError>;
}

/// Manages node gateway subscriptions for wallet deposit notifications
#[async_trait]
pub trait WalletSubscriber: Send + Sync {
    /// Subscribe a wallet address, returning the subscription id
    async fn subscribe(&self, wallet: &Wallet, is_test: bool) -> Result<String, AppError>;

    /// Remove a subscription
    async fn unsubscribe(&self, subscription_id: &str) -> Result<(), AppError>;
}

/// Exchange rate conversions
#[async_trait]
pub trait CurrencyConverter: Send + Sync {
    /// Convert a fiat amount into a crypto currency
    async fn fiat_to_crypto(&self, from: &Amount, to: &Currency) -> Result<Amount, AppError>;

    /// Convert a crypto amount into a fiat currency
    async fn crypto_to_fiat(&self, from: &Amount, fiat_ticker: &str) -> Result<Amount, AppError>;

    /// Convert between fiat currencies
    async fn fiat_to_fiat(&self, from: &Amount, fiat_ticker: &str) -> Result<Amount, AppError>;
}

/// The payments service owning merchant-facing payment records
#[async_trait]
pub trait PaymentGateway: Send + Sync {
    /// Withdrawal orders waiting to be executed
    async fn list_pending_withdrawals(&self, limit: i64) -> Result<Vec<WithdrawalOrder>, AppError>;

    /// Payment ids whose deposit window has lapsed
    async fn list_expired_payments(&self, limit: i64) -> Result<Vec<i64>, AppError>;

    /// Create a payment record backing a system topup, returning its id
    async fn create_topup_payment(
        &self,
        merchant_id: i64,
        amount: &Amount,
        usd_amount: &Amount,
    ) -> Result<i64, AppError>;

    /// Mark a payment as being processed
    async fn mark_in_progress(&self, payment_id: i64) -> Result<(), AppError>;

    /// Mark a payment as successfully settled
    async fn mark_succeeded(&self, payment_id: i64) -> Result<(), AppError>;

    /// Mark a payment as permanently failed
    async fn mark_failed(&self, payment_id: i64, reason: &str) -> Result<(), AppError>;

    /// Mark a payment as expired
    async fn mark_expired(&self, payment_id: i64) -> Result<(), AppError>;
}

/// Fire-and-forget delivery of domain events
pub trait EventPublisher: Send + Sync {
    /// Publish an event to all registered handlers without blocking
    fn publish(&self, event: Event);
}

/// A consumer of domain events
#[async_trait]
pub trait EventHandler: Send + Sync {
    /// Handle one event. Errors are logged by the bus, never retried.
    async fn handle(&self, event: &Event) -> Result<(), AppError>;

    /// Handler name used in logs
    fn name(&self) -> &str;
}

/// Liveness of an infrastructure dependency
#[async_trait]
pub trait HealthProbe: Send + Sync {
    /// Check connectivity
    async fn health_check(&self) -> Result<(), AppError>;
}
