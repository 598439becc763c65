//! Mock implementations for testing.
//!
//! [`MemoryStore`] mirrors the Postgres store in memory, including the
//! status-transition guards and lock bookkeeping, so workflow tests exercise
//! the same failure paths the production store produces. The remaining mocks
//! stand in for the external HTTP collaborators.

use async_trait::async_trait;
use chrono::Utc;
use rust_decimal::{Decimal, RoundingStrategy};
use serde_json::Value;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use uuid::Uuid;

use crate::domain::{
    Amount, AppError, Balance, BalanceOperation, BalanceOwner, BalanceOwnerType, BalanceUpdate,
    Blockchain, BlockchainError, Broadcaster, CancelUpdate, ConfirmUpdate, CreatedWallet, Currency,
    CurrencyConverter, DatabaseError, Event, EventPublisher, ExternalServiceError, FeeCalculator,
    FeeEstimate, FeeParams, HealthProbe, LedgerError, LedgerStore, LockKey, MoneyError,
    NewTransaction, PaymentGateway, PaymentGuard, PaymentGuardStore, ReceiveUpdate, SigningClient,
    SigningError, SigningRequest, Transaction, TransactionError, TransactionReceipt,
    TransactionStatus, TransactionStore, TransactionType, ValidationError, Wallet, WalletError,
    WalletLock, WalletStore, WalletSubscriber, WalletType, WithdrawalOrder, currency,
};

/// Configuration for mock behavior
#[derive(Debug, Clone, Default)]
pub struct MockConfig {
    pub should_fail: bool,
    pub error_message: Option<String>,
}

impl MockConfig {
    #[must_use]
    pub fn success() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn failure(message: impl Into<String>) -> Self {
        Self {
            should_fail: true,
            error_message: Some(message.into()),
        }
    }

    fn message(&self) -> String {
        self.error_message
            .clone()
            .unwrap_or_else(|| "Mock error".to_string())
    }
}

#[derive(Default)]
struct StoreState {
    balances: Vec<Balance>,
    audit_log: Vec<(i64, String, Value)>,
    wallets: Vec<Wallet>,
    locks: Vec<WalletLock>,
    transactions: Vec<Transaction>,
    next_balance_id: i64,
    next_wallet_id: i64,
    next_lock_id: i64,
    next_transaction_id: i64,
}

/// In-memory store implementing every persistence port.
///
/// One instance plays the role the Postgres store plays in production, so a
/// test wires [`crate::app::Processing`] against a single shared store.
pub struct MemoryStore {
    state: Mutex<StoreState>,
    claimed_payments: Arc<Mutex<HashSet<i64>>>,
    config: MockConfig,
    is_healthy: AtomicBool,
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(MockConfig::success())
    }

    #[must_use]
    pub fn with_config(config: MockConfig) -> Self {
        Self {
            state: Mutex::new(StoreState {
                next_balance_id: 1,
                next_wallet_id: 1,
                next_lock_id: 1,
                next_transaction_id: 1,
                ..StoreState::default()
            }),
            claimed_payments: Arc::new(Mutex::new(HashSet::new())),
            config,
            is_healthy: AtomicBool::new(true),
        }
    }

    #[must_use]
    pub fn failing(message: impl Into<String>) -> Self {
        Self::with_config(MockConfig::failure(message))
    }

    pub fn set_healthy(&self, healthy: bool) {
        self.is_healthy.store(healthy, Ordering::Relaxed);
    }

    fn check_should_fail(&self) -> Result<(), AppError> {
        if self.config.should_fail {
            return Err(AppError::Database(DatabaseError::Query(
                self.config.message(),
            )));
        }
        Ok(())
    }

    /// Seed a wallet row directly, bypassing the signing service
    pub fn insert_wallet(&self, blockchain: Blockchain, wallet_type: WalletType) -> Wallet {
        let mut state = self.state.lock().unwrap();
        let id = state.next_wallet_id;
        state.next_wallet_id += 1;
        let now = Utc::now();
        let wallet = Wallet {
            id,
            uuid: Uuid::new_v4(),
            blockchain,
            address: format!("addr-{}-{id}", blockchain.as_str().to_lowercase()),
            wallet_type,
            mainnet_subscription_id: Some(format!("sub-main-{id}")),
            testnet_subscription_id: Some(format!("sub-test-{id}")),
            confirmed_mainnet_transactions: 0,
            pending_mainnet_transactions: 0,
            confirmed_testnet_transactions: 0,
            pending_testnet_transactions: 0,
            created_at: now,
            updated_at: now,
        };
        state.wallets.push(wallet.clone());
        wallet
    }

    /// Seed a balance row directly, bypassing the audit trail
    pub fn insert_balance(
        &self,
        owner: BalanceOwner,
        balance_currency: &Currency,
        is_test: bool,
        amount: Decimal,
    ) -> Balance {
        let mut state = self.state.lock().unwrap();
        let id = state.next_balance_id;
        state.next_balance_id += 1;
        let now = Utc::now();
        let balance = Balance {
            id,
            uuid: Uuid::new_v4(),
            owner,
            blockchain: balance_currency.blockchain,
            network_id: balance_currency.network_id(is_test),
            currency_type: balance_currency.currency_type,
            amount: Amount::crypto(balance_currency.ticker, amount, balance_currency.decimals)
                .expect("seed amount"),
            created_at: now,
            updated_at: now,
        };
        state.balances.push(balance.clone());
        balance
    }

    pub fn all_balances(&self) -> Vec<Balance> {
        self.state.lock().unwrap().balances.clone()
    }

    pub fn all_transactions(&self) -> Vec<Transaction> {
        self.state.lock().unwrap().transactions.clone()
    }

    pub fn all_locks(&self) -> Vec<WalletLock> {
        self.state.lock().unwrap().locks.clone()
    }

    pub fn audit_entries(&self) -> Vec<(i64, String, Value)> {
        self.state.lock().unwrap().audit_log.clone()
    }

    pub fn wallet_row(&self, wallet_id: i64) -> Option<Wallet> {
        self.state
            .lock()
            .unwrap()
            .wallets
            .iter()
            .find(|w| w.id == wallet_id)
            .cloned()
    }

    pub fn balance_amount(&self, owner: BalanceOwner, ticker: &str, network_id: i64) -> Decimal {
        self.state
            .lock()
            .unwrap()
            .balances
            .iter()
            .find(|b| b.owner == owner && b.ticker() == ticker && b.network_id == network_id)
            .map(|b| b.amount.value())
            .unwrap_or(Decimal::ZERO)
    }

    pub fn transaction_row(&self, id: i64) -> Option<Transaction> {
        self.state
            .lock()
            .unwrap()
            .transactions
            .iter()
            .find(|t| t.id == id)
            .cloned()
    }

    fn apply_update_locked(
        state: &mut StoreState,
        update: &BalanceUpdate,
    ) -> Result<Balance, AppError> {
        if update.amount.is_zero() {
            return Err(AppError::Validation(ValidationError::InvalidField {
                field: "amount".to_string(),
                message: "balance update amount must be non-zero".to_string(),
            }));
        }

        let position = state.balances.iter().position(|b| {
            b.owner == update.owner
                && b.ticker() == update.amount.ticker()
                && b.network_id == update.network_id
        });
        let position = match position {
            Some(position) => position,
            None => {
                let id = state.next_balance_id;
                state.next_balance_id += 1;
                let now = Utc::now();
                state.balances.push(Balance {
                    id,
                    uuid: Uuid::new_v4(),
                    owner: update.owner,
                    blockchain: update.blockchain,
                    network_id: update.network_id,
                    currency_type: update.currency_type,
                    amount: Amount::zero(
                        update.amount.ticker(),
                        update.amount.decimals(),
                        update.amount.kind(),
                    ),
                    created_at: now,
                    updated_at: now,
                });
                state.balances.len() - 1
            }
        };

        let balance = &state.balances[position];
        if balance.amount.decimals() != update.amount.decimals() {
            return Err(AppError::Ledger(LedgerError::IncompatibleBalance(format!(
                "balance {} holds {} with {} decimals, update carries {}",
                balance.id,
                balance.ticker(),
                balance.amount.decimals(),
                update.amount.decimals()
            ))));
        }

        let updated = match update.operation {
            BalanceOperation::Increment => balance.amount.checked_add(&update.amount)?,
            BalanceOperation::Decrement => balance
                .amount
                .checked_sub(&update.amount)
                .map_err(|_| LedgerError::InsufficientFunds {
                    owner_type: update.owner.owner_type,
                    ticker: update.amount.ticker().to_string(),
                    available: balance.amount.value().to_string(),
                    required: update.amount.value().to_string(),
                })?,
        };

        let balance_id = balance.id;
        state.balances[position].amount = updated;
        state.balances[position].updated_at = Utc::now();
        state
            .audit_log
            .push((balance_id, update.comment.clone(), update.metadata.clone()));
        Ok(state.balances[position].clone())
    }

    fn release_lock_locked(state: &mut StoreState, key: &LockKey) -> Result<(), AppError> {
        let before = state.locks.len();
        state.locks.retain(|l| {
            !(l.wallet_id == key.wallet_id
                && l.currency == key.currency
                && l.network_id == key.network_id)
        });
        if state.locks.len() == before {
            return Err(AppError::Wallet(WalletError::LockNotFound {
                wallet_id: key.wallet_id,
                currency: key.currency.clone(),
                network_id: key.network_id,
            }));
        }
        Ok(())
    }

    fn discard_lock_locked(state: &mut StoreState, key: &LockKey) {
        state.locks.retain(|l| {
            !(l.wallet_id == key.wallet_id
                && l.currency == key.currency
                && l.network_id == key.network_id)
        });
    }

    fn hash_taken(state: &StoreState, network_id: i64, hash: &str, skip_id: i64) -> bool {
        !hash.is_empty()
            && state.transactions.iter().any(|t| {
                t.id != skip_id && t.network_id == network_id && t.hash.as_deref() == Some(hash)
            })
    }

    fn insert_lock_locked(
        state: &mut StoreState,
        wallet_id: i64,
        merchant_id: i64,
        ticker: &str,
        network_id: i64,
    ) -> Result<WalletLock, AppError> {
        let conflict = state.locks.iter().any(|l| {
            l.wallet_id == wallet_id && l.currency == ticker && l.network_id == network_id
        });
        if conflict {
            return Err(AppError::Wallet(WalletError::AlreadyLocked {
                wallet_id,
                currency: ticker.to_string(),
                network_id,
            }));
        }
        let id = state.next_lock_id;
        state.next_lock_id += 1;
        let lock = WalletLock {
            id,
            wallet_id,
            merchant_id,
            currency: ticker.to_string(),
            network_id,
            locked_at: Utc::now(),
            locked_until: None,
        };
        state.locks.push(lock.clone());
        Ok(lock)
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl LedgerStore for MemoryStore {
    async fn get_balance(
        &self,
        owner: BalanceOwner,
        ticker: &str,
        network_id: i64,
    ) -> Result<Option<Balance>, AppError> {
        self.check_should_fail()?;
        let state = self.state.lock().unwrap();
        Ok(state
            .balances
            .iter()
            .find(|b| b.owner == owner && b.ticker() == ticker && b.network_id == network_id)
            .cloned())
    }

    async fn get_balance_by_id(&self, id: i64) -> Result<Option<Balance>, AppError> {
        self.check_should_fail()?;
        let state = self.state.lock().unwrap();
        Ok(state.balances.iter().find(|b| b.id == id).cloned())
    }

    async fn list_balances(&self, owner_type: BalanceOwnerType) -> Result<Vec<Balance>, AppError> {
        self.check_should_fail()?;
        let state = self.state.lock().unwrap();
        Ok(state
            .balances
            .iter()
            .filter(|b| b.owner.owner_type == owner_type)
            .cloned()
            .collect())
    }

    async fn list_inbound_wallet_balances(
        &self,
        offset: i64,
        limit: i64,
    ) -> Result<Vec<Balance>, AppError> {
        self.check_should_fail()?;
        let state = self.state.lock().unwrap();
        let inbound: HashSet<i64> = state
            .wallets
            .iter()
            .filter(|w| w.wallet_type == WalletType::Inbound)
            .map(|w| w.id)
            .collect();
        let mut funded: Vec<Balance> = state
            .balances
            .iter()
            .filter(|b| {
                b.owner.owner_type == BalanceOwnerType::Wallet
                    && inbound.contains(&b.owner.owner_id)
                    && b.amount.is_positive()
            })
            .cloned()
            .collect();
        funded.sort_by_key(|b| b.id);
        Ok(funded
            .into_iter()
            .skip(offset.max(0) as usize)
            .take(limit.max(0) as usize)
            .collect())
    }

    async fn apply_update(&self, update: &BalanceUpdate) -> Result<Balance, AppError> {
        self.check_should_fail()?;
        let mut state = self.state.lock().unwrap();
        Self::apply_update_locked(&mut state, update)
    }

    async fn apply_updates(&self, updates: &[BalanceUpdate]) -> Result<Vec<Balance>, AppError> {
        self.check_should_fail()?;
        // All-or-nothing like the transactional production path.
        let mut state = self.state.lock().unwrap();
        let snapshot = state.balances.clone();
        let mut applied = Vec::with_capacity(updates.len());
        for update in updates {
            match Self::apply_update_locked(&mut state, update) {
                Ok(balance) => applied.push(balance),
                Err(e) => {
                    state.balances = snapshot;
                    return Err(e);
                }
            }
        }
        Ok(applied)
    }
}

#[async_trait]
impl WalletStore for MemoryStore {
    async fn create_wallet(
        &self,
        blockchain: Blockchain,
        wallet_type: WalletType,
        uuid: Uuid,
        address: &str,
    ) -> Result<Wallet, AppError> {
        self.check_should_fail()?;
        let mut state = self.state.lock().unwrap();
        let id = state.next_wallet_id;
        state.next_wallet_id += 1;
        let now = Utc::now();
        let wallet = Wallet {
            id,
            uuid,
            blockchain,
            address: address.to_string(),
            wallet_type,
            mainnet_subscription_id: None,
            testnet_subscription_id: None,
            confirmed_mainnet_transactions: 0,
            pending_mainnet_transactions: 0,
            confirmed_testnet_transactions: 0,
            pending_testnet_transactions: 0,
            created_at: now,
            updated_at: now,
        };
        state.wallets.push(wallet.clone());
        Ok(wallet)
    }

    async fn get_wallet(&self, id: i64) -> Result<Option<Wallet>, AppError> {
        self.check_should_fail()?;
        let state = self.state.lock().unwrap();
        Ok(state.wallets.iter().find(|w| w.id == id).cloned())
    }

    async fn get_wallet_by_uuid(&self, uuid: &Uuid) -> Result<Option<Wallet>, AppError> {
        self.check_should_fail()?;
        let state = self.state.lock().unwrap();
        Ok(state.wallets.iter().find(|w| w.uuid == *uuid).cloned())
    }

    async fn get_outbound_wallet(
        &self,
        blockchain: Blockchain,
    ) -> Result<Option<Wallet>, AppError> {
        self.check_should_fail()?;
        let state = self.state.lock().unwrap();
        Ok(state
            .wallets
            .iter()
            .find(|w| w.blockchain == blockchain && w.wallet_type == WalletType::Outbound)
            .cloned())
    }

    async fn set_subscription_id(
        &self,
        wallet_id: i64,
        is_test: bool,
        subscription_id: &str,
    ) -> Result<(), AppError> {
        self.check_should_fail()?;
        let mut state = self.state.lock().unwrap();
        let wallet = state
            .wallets
            .iter_mut()
            .find(|w| w.id == wallet_id)
            .ok_or_else(|| AppError::Wallet(WalletError::NotFound(wallet_id.to_string())))?;
        if is_test {
            wallet.testnet_subscription_id = Some(subscription_id.to_string());
        } else {
            wallet.mainnet_subscription_id = Some(subscription_id.to_string());
        }
        wallet.updated_at = Utc::now();
        Ok(())
    }

    async fn acquire_available_wallet(
        &self,
        merchant_id: i64,
        blockchain: Blockchain,
        ticker: &str,
        network_id: i64,
    ) -> Result<Option<(Wallet, WalletLock)>, AppError> {
        self.check_should_fail()?;
        let mut state = self.state.lock().unwrap();
        let candidate = state
            .wallets
            .iter()
            .filter(|w| w.blockchain == blockchain && w.wallet_type == WalletType::Inbound)
            .find(|w| {
                !state.locks.iter().any(|l| {
                    l.wallet_id == w.id && l.currency == ticker && l.network_id == network_id
                })
            })
            .cloned();
        let Some(wallet) = candidate else {
            return Ok(None);
        };
        let lock =
            Self::insert_lock_locked(&mut state, wallet.id, merchant_id, ticker, network_id)?;
        Ok(Some((wallet, lock)))
    }

    async fn lock_wallet(
        &self,
        wallet_id: i64,
        merchant_id: i64,
        ticker: &str,
        network_id: i64,
    ) -> Result<WalletLock, AppError> {
        self.check_should_fail()?;
        let mut state = self.state.lock().unwrap();
        Self::insert_lock_locked(&mut state, wallet_id, merchant_id, ticker, network_id)
    }

    async fn release_lock(&self, key: &LockKey) -> Result<(), AppError> {
        self.check_should_fail()?;
        let mut state = self.state.lock().unwrap();
        Self::release_lock_locked(&mut state, key)
    }

    async fn increment_pending_nonce(
        &self,
        wallet_id: i64,
        is_test: bool,
    ) -> Result<i64, AppError> {
        self.check_should_fail()?;
        let mut state = self.state.lock().unwrap();
        let wallet = state
            .wallets
            .iter_mut()
            .find(|w| w.id == wallet_id)
            .ok_or_else(|| AppError::Wallet(WalletError::NotFound(wallet_id.to_string())))?;
        let nonce = if is_test {
            let nonce = wallet.confirmed_testnet_transactions + wallet.pending_testnet_transactions;
            wallet.pending_testnet_transactions += 1;
            nonce
        } else {
            let nonce = wallet.confirmed_mainnet_transactions + wallet.pending_mainnet_transactions;
            wallet.pending_mainnet_transactions += 1;
            nonce
        };
        wallet.updated_at = Utc::now();
        Ok(nonce)
    }

    async fn confirm_pending_nonce(&self, wallet_id: i64, is_test: bool) -> Result<(), AppError> {
        self.check_should_fail()?;
        let mut state = self.state.lock().unwrap();
        let wallet = state
            .wallets
            .iter_mut()
            .find(|w| w.id == wallet_id)
            .ok_or_else(|| AppError::Wallet(WalletError::NotFound(wallet_id.to_string())))?;
        let pending = if is_test {
            &mut wallet.pending_testnet_transactions
        } else {
            &mut wallet.pending_mainnet_transactions
        };
        if *pending <= 0 {
            return Err(AppError::Wallet(WalletError::NoPendingTransactions(
                wallet_id,
            )));
        }
        *pending -= 1;
        if is_test {
            wallet.confirmed_testnet_transactions += 1;
        } else {
            wallet.confirmed_mainnet_transactions += 1;
        }
        wallet.updated_at = Utc::now();
        Ok(())
    }

    async fn rollback_pending_nonce(&self, wallet_id: i64, is_test: bool) -> Result<(), AppError> {
        self.check_should_fail()?;
        let mut state = self.state.lock().unwrap();
        let wallet = state
            .wallets
            .iter_mut()
            .find(|w| w.id == wallet_id)
            .ok_or_else(|| AppError::Wallet(WalletError::NotFound(wallet_id.to_string())))?;
        let pending = if is_test {
            &mut wallet.pending_testnet_transactions
        } else {
            &mut wallet.pending_mainnet_transactions
        };
        if *pending <= 0 {
            return Err(AppError::Wallet(WalletError::NoPendingTransactions(
                wallet_id,
            )));
        }
        *pending -= 1;
        wallet.updated_at = Utc::now();
        Ok(())
    }
}

#[async_trait]
impl TransactionStore for MemoryStore {
    async fn create_transaction(&self, new: &NewTransaction) -> Result<Transaction, AppError> {
        self.check_should_fail()?;
        let mut state = self.state.lock().unwrap();
        if let Some(hash) = new.hash.as_deref() {
            if Self::hash_taken(&state, new.network_id, hash, 0) {
                return Err(AppError::Transaction(TransactionError::DuplicateHash {
                    network_id: new.network_id,
                    hash: hash.to_string(),
                }));
            }
        }
        let id = state.next_transaction_id;
        state.next_transaction_id += 1;
        let now = Utc::now();
        let transaction = Transaction {
            id,
            uuid: Uuid::new_v4(),
            transaction_type: new.transaction_type,
            status: new.status,
            entity_id: new.entity_id,
            merchant_id: new.merchant_id,
            sender_wallet_id: new.sender_wallet_id,
            recipient_wallet_id: new.recipient_wallet_id,
            sender_address: new.sender_address.clone(),
            recipient_address: new.recipient_address.clone(),
            blockchain: new.blockchain,
            network_id: new.network_id,
            currency_type: new.currency_type,
            amount: new.amount.clone(),
            fact_amount: new.fact_amount.clone(),
            service_fee: new.service_fee.clone(),
            network_fee: new.network_fee.clone(),
            usd_amount: new.usd_amount.clone(),
            hash: new.hash.clone(),
            is_test: new.is_test,
            metadata: new.metadata.clone(),
            created_at: now,
            updated_at: now,
        };
        state.transactions.push(transaction.clone());
        Ok(transaction)
    }

    async fn get_transaction(&self, id: i64) -> Result<Option<Transaction>, AppError> {
        self.check_should_fail()?;
        let state = self.state.lock().unwrap();
        Ok(state.transactions.iter().find(|t| t.id == id).cloned())
    }

    async fn get_transaction_by_hash(
        &self,
        network_id: i64,
        hash: &str,
    ) -> Result<Option<Transaction>, AppError> {
        self.check_should_fail()?;
        let state = self.state.lock().unwrap();
        Ok(state
            .transactions
            .iter()
            .find(|t| t.network_id == network_id && t.hash.as_deref() == Some(hash))
            .cloned())
    }

    async fn get_latest_by_entity(
        &self,
        entity_id: i64,
        transaction_type: TransactionType,
        statuses: &[TransactionStatus],
    ) -> Result<Option<Transaction>, AppError> {
        self.check_should_fail()?;
        let state = self.state.lock().unwrap();
        Ok(state
            .transactions
            .iter()
            .filter(|t| {
                t.entity_id == entity_id
                    && t.transaction_type == transaction_type
                    && statuses.contains(&t.status)
            })
            .max_by_key(|t| t.id)
            .cloned())
    }

    async fn find_expected_incoming(
        &self,
        wallet_id: i64,
        ticker: &str,
        network_id: i64,
    ) -> Result<Option<Transaction>, AppError> {
        self.check_should_fail()?;
        let state = self.state.lock().unwrap();
        Ok(state
            .transactions
            .iter()
            .filter(|t| {
                t.recipient_wallet_id == Some(wallet_id)
                    && t.ticker() == ticker
                    && t.network_id == network_id
                    && t.transaction_type == TransactionType::Incoming
                    && t.status == TransactionStatus::Pending
                    && t.hash.as_deref().unwrap_or_default().is_empty()
            })
            .max_by_key(|t| t.id)
            .cloned())
    }

    async fn list_by_status(
        &self,
        transaction_type: TransactionType,
        statuses: &[TransactionStatus],
        limit: i64,
    ) -> Result<Vec<Transaction>, AppError> {
        self.check_should_fail()?;
        let state = self.state.lock().unwrap();
        let mut matching: Vec<Transaction> = state
            .transactions
            .iter()
            .filter(|t| t.transaction_type == transaction_type && statuses.contains(&t.status))
            .cloned()
            .collect();
        matching.sort_by_key(|t| t.id);
        matching.truncate(limit.max(0) as usize);
        Ok(matching)
    }

    async fn receive_transaction(
        &self,
        id: i64,
        expected_status: TransactionStatus,
        update: &ReceiveUpdate,
        release_lock: Option<&LockKey>,
    ) -> Result<Transaction, AppError> {
        self.check_should_fail()?;
        let mut state = self.state.lock().unwrap();
        let position = state
            .transactions
            .iter()
            .position(|t| t.id == id)
            .ok_or(AppError::Transaction(TransactionError::NotFound(id)))?;
        let current = state.transactions[position].clone();
        if current.status != expected_status {
            return Err(AppError::Transaction(TransactionError::InvalidTransition {
                id,
                from: current.status,
                to: update.status,
            }));
        }
        if Self::hash_taken(&state, current.network_id, &update.hash, id) {
            return Err(AppError::Transaction(TransactionError::DuplicateHash {
                network_id: current.network_id,
                hash: update.hash.clone(),
            }));
        }
        if let Some(key) = release_lock {
            Self::release_lock_locked(&mut state, key)?;
        }
        let transaction = &mut state.transactions[position];
        transaction.status = update.status;
        transaction.sender_address = Some(update.sender_address.clone());
        transaction.hash = Some(update.hash.clone());
        transaction.fact_amount = Some(update.fact_amount.clone());
        merge_metadata(&mut transaction.metadata, &update.metadata);
        transaction.updated_at = Utc::now();
        Ok(transaction.clone())
    }

    async fn confirm_transaction(
        &self,
        id: i64,
        expected_status: TransactionStatus,
        update: &ConfirmUpdate,
        settlement: &[BalanceUpdate],
    ) -> Result<Transaction, AppError> {
        self.check_should_fail()?;
        let mut state = self.state.lock().unwrap();
        let position = state
            .transactions
            .iter()
            .position(|t| t.id == id)
            .ok_or(AppError::Transaction(TransactionError::NotFound(id)))?;
        let current = state.transactions[position].clone();
        if current.status == update.status {
            return Err(AppError::Transaction(TransactionError::SameStatus {
                id,
                status: current.status,
            }));
        }
        if current.status.is_final() {
            return Err(AppError::Transaction(TransactionError::Terminal {
                id,
                status: current.status,
            }));
        }
        if current.status != expected_status {
            return Err(AppError::Transaction(TransactionError::InvalidTransition {
                id,
                from: current.status,
                to: update.status,
            }));
        }

        let snapshot = state.balances.clone();
        for balance_update in settlement {
            if let Err(e) = Self::apply_update_locked(&mut state, balance_update) {
                state.balances = snapshot;
                return Err(e);
            }
        }

        let transaction = &mut state.transactions[position];
        transaction.status = update.status;
        transaction.fact_amount = Some(update.fact_amount.clone());
        if let Some(fee) = &update.network_fee {
            transaction.network_fee = Some(fee.clone());
        }
        if update.zero_service_fee {
            transaction.service_fee = Amount::zero(
                transaction.service_fee.ticker(),
                transaction.service_fee.decimals(),
                transaction.service_fee.kind(),
            );
        }
        transaction.updated_at = Utc::now();
        Ok(transaction.clone())
    }

    async fn cancel_transaction(
        &self,
        id: i64,
        update: &CancelUpdate,
        release_lock: Option<&LockKey>,
    ) -> Result<Transaction, AppError> {
        self.check_should_fail()?;
        let mut state = self.state.lock().unwrap();
        let position = state
            .transactions
            .iter()
            .position(|t| t.id == id)
            .ok_or(AppError::Transaction(TransactionError::NotFound(id)))?;
        let current = state.transactions[position].clone();
        if current.status.is_final() {
            return Err(AppError::Transaction(TransactionError::Terminal {
                id,
                status: current.status,
            }));
        }
        if let Some(key) = release_lock {
            Self::discard_lock_locked(&mut state, key);
        }
        let transaction = &mut state.transactions[position];
        transaction.status = update.status;
        if let Some(fee) = &update.network_fee {
            transaction.network_fee = Some(fee.clone());
        }
        merge_metadata(
            &mut transaction.metadata,
            &serde_json::json!({ "comment": update.reason }),
        );
        transaction.updated_at = Utc::now();
        Ok(transaction.clone())
    }

    async fn set_transaction_hash(&self, id: i64, hash: &str) -> Result<(), AppError> {
        self.check_should_fail()?;
        let mut state = self.state.lock().unwrap();
        let network_id = state
            .transactions
            .iter()
            .find(|t| t.id == id)
            .map(|t| t.network_id)
            .ok_or(AppError::Transaction(TransactionError::NotFound(id)))?;
        if Self::hash_taken(&state, network_id, hash, id) {
            return Err(AppError::Transaction(TransactionError::DuplicateHash {
                network_id,
                hash: hash.to_string(),
            }));
        }
        let transaction = state
            .transactions
            .iter_mut()
            .find(|t| t.id == id)
            .expect("presence checked above");
        transaction.hash = Some(hash.to_string());
        transaction.updated_at = Utc::now();
        Ok(())
    }
}

fn merge_metadata(target: &mut Value, patch: &Value) {
    let mut map = match target {
        Value::Object(entries) => std::mem::take(entries),
        _ => serde_json::Map::new(),
    };
    if let Value::Object(entries) = patch {
        for (key, value) in entries {
            map.insert(key.clone(), value.clone());
        }
    }
    *target = Value::Object(map);
}

struct MemoryPaymentGuard {
    payment_id: i64,
    claimed: Arc<Mutex<HashSet<i64>>>,
}

impl Drop for MemoryPaymentGuard {
    fn drop(&mut self) {
        self.claimed.lock().unwrap().remove(&self.payment_id);
    }
}

#[async_trait]
impl PaymentGuard for MemoryPaymentGuard {
    async fn release(self: Box<Self>) -> Result<(), AppError> {
        // Drop does the bookkeeping.
        Ok(())
    }
}

#[async_trait]
impl PaymentGuardStore for MemoryStore {
    async fn lock_payment(&self, payment_id: i64) -> Result<Box<dyn PaymentGuard>, AppError> {
        self.check_should_fail()?;
        loop {
            {
                let mut claimed = self.claimed_payments.lock().unwrap();
                if claimed.insert(payment_id) {
                    return Ok(Box::new(MemoryPaymentGuard {
                        payment_id,
                        claimed: Arc::clone(&self.claimed_payments),
                    }));
                }
            }
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
    }
}

#[async_trait]
impl HealthProbe for MemoryStore {
    async fn health_check(&self) -> Result<(), AppError> {
        if !self.is_healthy.load(Ordering::Relaxed) {
            return Err(AppError::Database(DatabaseError::Connection(
                "Unhealthy".to_string(),
            )));
        }
        self.check_should_fail()
    }
}

/// Mock signing service
pub struct MockSigner {
    config: MockConfig,
    created: AtomicI64,
    requests: Mutex<Vec<SigningRequest>>,
}

impl MockSigner {
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(MockConfig::success())
    }

    #[must_use]
    pub fn with_config(config: MockConfig) -> Self {
        Self {
            config,
            created: AtomicI64::new(1),
            requests: Mutex::new(Vec::new()),
        }
    }

    #[must_use]
    pub fn failing(message: impl Into<String>) -> Self {
        Self::with_config(MockConfig::failure(message))
    }

    pub fn signed_requests(&self) -> Vec<SigningRequest> {
        self.requests.lock().unwrap().clone()
    }

    fn check_should_fail(&self) -> Result<(), AppError> {
        if self.config.should_fail {
            return Err(AppError::Signing(SigningError::Unavailable(
                self.config.message(),
            )));
        }
        Ok(())
    }
}

impl Default for MockSigner {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SigningClient for MockSigner {
    async fn create_wallet(&self, blockchain: Blockchain) -> Result<CreatedWallet, AppError> {
        self.check_should_fail()?;
        let seq = self.created.fetch_add(1, Ordering::Relaxed);
        Ok(CreatedWallet {
            uuid: Uuid::new_v4(),
            address: format!("addr-{}-{seq}", blockchain.as_str().to_lowercase()),
        })
    }

    async fn sign_transaction(&self, request: &SigningRequest) -> Result<String, AppError> {
        self.check_should_fail()?;
        self.requests.lock().unwrap().push(request.clone());
        Ok(format!("raw-{}-{}", request.wallet_uuid, request.nonce))
    }
}

/// Mock node gateway broadcast side
pub struct MockBroadcaster {
    config: MockConfig,
    insufficient_funds: bool,
    broadcasts: Mutex<Vec<String>>,
    receipts: Mutex<Vec<TransactionReceipt>>,
    next_hash: AtomicI64,
    is_healthy: AtomicBool,
}

impl MockBroadcaster {
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(MockConfig::success())
    }

    #[must_use]
    pub fn with_config(config: MockConfig) -> Self {
        Self {
            config,
            insufficient_funds: false,
            broadcasts: Mutex::new(Vec::new()),
            receipts: Mutex::new(Vec::new()),
            next_hash: AtomicI64::new(1),
            is_healthy: AtomicBool::new(true),
        }
    }

    #[must_use]
    pub fn failing(message: impl Into<String>) -> Self {
        Self::with_config(MockConfig::failure(message))
    }

    /// Broadcasts fail as the chain rejecting the transfer for lack of funds
    #[must_use]
    pub fn rejecting_for_insufficient_funds() -> Self {
        Self {
            insufficient_funds: true,
            ..Self::with_config(MockConfig::failure("insufficient funds for gas"))
        }
    }

    pub fn set_healthy(&self, healthy: bool) {
        self.is_healthy.store(healthy, Ordering::Relaxed);
    }

    /// Queue the receipt returned for its hash
    pub fn push_receipt(&self, receipt: TransactionReceipt) {
        self.receipts.lock().unwrap().push(receipt);
    }

    pub fn broadcast_count(&self) -> usize {
        self.broadcasts.lock().unwrap().len()
    }

    pub fn broadcasts(&self) -> Vec<String> {
        self.broadcasts.lock().unwrap().clone()
    }

    fn check_should_fail(&self) -> Result<(), AppError> {
        if self.config.should_fail {
            let message = self.config.message();
            if self.insufficient_funds {
                return Err(AppError::Blockchain(BlockchainError::InsufficientFunds(
                    message,
                )));
            }
            return Err(AppError::Blockchain(BlockchainError::Connection(message)));
        }
        Ok(())
    }
}

impl Default for MockBroadcaster {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Broadcaster for MockBroadcaster {
    async fn broadcast_transaction(
        &self,
        _blockchain: Blockchain,
        raw: &str,
        _is_test: bool,
    ) -> Result<String, AppError> {
        self.check_should_fail()?;
        self.broadcasts.lock().unwrap().push(raw.to_string());
        let seq = self.next_hash.fetch_add(1, Ordering::Relaxed);
        Ok(format!("0xhash{seq}"))
    }

    async fn get_transaction_receipt(
        &self,
        _blockchain: Blockchain,
        hash: &str,
        _is_test: bool,
    ) -> Result<TransactionReceipt, AppError> {
        self.check_should_fail()?;
        self.receipts
            .lock()
            .unwrap()
            .iter()
            .find(|r| r.hash == hash)
            .cloned()
            .ok_or_else(|| {
                AppError::Blockchain(BlockchainError::ReceiptNotFound(hash.to_string()))
            })
    }
}

#[async_trait]
impl HealthProbe for MockBroadcaster {
    async fn health_check(&self) -> Result<(), AppError> {
        if !self.is_healthy.load(Ordering::Relaxed) {
            return Err(AppError::Blockchain(BlockchainError::Connection(
                "Unhealthy".to_string(),
            )));
        }
        self.check_should_fail()
    }
}

/// Mock fee estimator with one flat fee per chain
pub struct MockFees {
    config: MockConfig,
    fee: Decimal,
    withdrawal_fee_usd: Decimal,
}

impl MockFees {
    #[must_use]
    pub fn new() -> Self {
        Self {
            config: MockConfig::success(),
            fee: Decimal::new(1, 3),
            withdrawal_fee_usd: Decimal::ONE,
        }
    }

    #[must_use]
    pub fn failing(message: impl Into<String>) -> Self {
        Self {
            config: MockConfig::failure(message),
            ..Self::new()
        }
    }

    /// Flat network fee in native coin units
    #[must_use]
    pub fn with_fee(mut self, fee: Decimal) -> Self {
        self.fee = fee;
        self
    }

    #[must_use]
    pub fn with_withdrawal_fee_usd(mut self, fee: Decimal) -> Self {
        self.withdrawal_fee_usd = fee;
        self
    }

    fn check_should_fail(&self) -> Result<(), AppError> {
        if self.config.should_fail {
            return Err(AppError::ExternalService(ExternalServiceError::Network(
                self.config.message(),
            )));
        }
        Ok(())
    }
}

impl Default for MockFees {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl FeeCalculator for MockFees {
    async fn estimate_fee(
        &self,
        fee_currency: &Currency,
        is_test: bool,
    ) -> Result<FeeEstimate, AppError> {
        self.check_should_fail()?;
        let native = currency::native_coin(fee_currency.blockchain);
        let params = if fee_currency.blockchain.is_evm() {
            FeeParams::Evm {
                gas_units: 21_000,
                max_fee_per_gas: 1_000_000_000,
                max_priority_fee_per_gas: 100_000_000,
            }
        } else {
            FeeParams::Tron { fee_limit: 30_000_000 }
        };
        Ok(FeeEstimate {
            blockchain: fee_currency.blockchain,
            is_test,
            total: Amount::crypto(native.ticker, self.fee, native.decimals)?,
            params,
        })
    }

    async fn withdrawal_fee_usd(
        &self,
        _currency: &Currency,
        _is_test: bool,
    ) -> Result<Amount, AppError> {
        self.check_should_fail()?;
        Ok(Amount::usd(self.withdrawal_fee_usd)?)
    }
}

/// Mock subscription manager
pub struct MockSubscriber {
    config: MockConfig,
    subscribed: Mutex<Vec<(i64, bool)>>,
    unsubscribed: Mutex<Vec<String>>,
}

impl MockSubscriber {
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(MockConfig::success())
    }

    #[must_use]
    pub fn with_config(config: MockConfig) -> Self {
        Self {
            config,
            subscribed: Mutex::new(Vec::new()),
            unsubscribed: Mutex::new(Vec::new()),
        }
    }

    #[must_use]
    pub fn failing(message: impl Into<String>) -> Self {
        Self::with_config(MockConfig::failure(message))
    }

    /// (wallet id, is_test) pairs subscribed so far
    pub fn subscriptions(&self) -> Vec<(i64, bool)> {
        self.subscribed.lock().unwrap().clone()
    }

    fn check_should_fail(&self) -> Result<(), AppError> {
        if self.config.should_fail {
            return Err(AppError::ExternalService(ExternalServiceError::Network(
                self.config.message(),
            )));
        }
        Ok(())
    }
}

impl Default for MockSubscriber {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl WalletSubscriber for MockSubscriber {
    async fn subscribe(&self, wallet: &Wallet, is_test: bool) -> Result<String, AppError> {
        self.check_should_fail()?;
        self.subscribed.lock().unwrap().push((wallet.id, is_test));
        let network = if is_test { "testnet" } else { "mainnet" };
        Ok(format!("sub-{network}-{}", wallet.id))
    }

    async fn unsubscribe(&self, subscription_id: &str) -> Result<(), AppError> {
        self.check_should_fail()?;
        self.unsubscribed
            .lock()
            .unwrap()
            .push(subscription_id.to_string());
        Ok(())
    }
}

/// Mock converter quoting from a fixed USD price table.
///
/// Defaults: ETH 2000, BNB 500, MATIC 0.5, TRX 0.1, stables at par.
pub struct MockConverter {
    config: MockConfig,
    usd_prices: Mutex<Vec<(String, Decimal)>>,
}

impl MockConverter {
    #[must_use]
    pub fn new() -> Self {
        Self {
            config: MockConfig::success(),
            usd_prices: Mutex::new(vec![
                ("ETH".to_string(), Decimal::from(2000)),
                ("BNB".to_string(), Decimal::from(500)),
                ("MATIC".to_string(), Decimal::new(5, 1)),
                ("TRX".to_string(), Decimal::new(1, 1)),
                ("USDT".to_string(), Decimal::ONE),
                ("USDC".to_string(), Decimal::ONE),
                ("USD".to_string(), Decimal::ONE),
            ]),
        }
    }

    #[must_use]
    pub fn failing(message: impl Into<String>) -> Self {
        Self {
            config: MockConfig::failure(message),
            ..Self::new()
        }
    }

    #[must_use]
    pub fn with_rate(self, ticker: &str, usd_price: Decimal) -> Self {
        {
            let mut prices = self.usd_prices.lock().unwrap();
            prices.retain(|(t, _)| t != ticker);
            prices.push((ticker.to_string(), usd_price));
        }
        self
    }

    fn usd_price(&self, ticker: &str) -> Result<Decimal, AppError> {
        self.usd_prices
            .lock()
            .unwrap()
            .iter()
            .find(|(t, _)| t == ticker)
            .map(|(_, price)| *price)
            .ok_or_else(|| {
                AppError::ExternalService(ExternalServiceError::ParseError(format!(
                    "no mock rate for {ticker}"
                )))
            })
    }

    fn check_should_fail(&self) -> Result<(), AppError> {
        if self.config.should_fail {
            return Err(AppError::ExternalService(ExternalServiceError::Network(
                self.config.message(),
            )));
        }
        Ok(())
    }
}

impl Default for MockConverter {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CurrencyConverter for MockConverter {
    async fn fiat_to_crypto(&self, from: &Amount, to: &Currency) -> Result<Amount, AppError> {
        self.check_should_fail()?;
        let usd = from
            .value()
            .checked_mul(self.usd_price(from.ticker())?)
            .ok_or_else(|| MoneyError::Overflow(from.to_string()))?;
        let value = usd
            .checked_div(self.usd_price(to.ticker)?)
            .ok_or_else(|| MoneyError::Overflow(from.to_string()))?
            .round_dp_with_strategy(to.decimals, RoundingStrategy::ToZero);
        Ok(Amount::crypto(to.ticker, value, to.decimals)?)
    }

    async fn crypto_to_fiat(&self, from: &Amount, fiat_ticker: &str) -> Result<Amount, AppError> {
        self.check_should_fail()?;
        let usd = from
            .value()
            .checked_mul(self.usd_price(from.ticker())?)
            .ok_or_else(|| MoneyError::Overflow(from.to_string()))?;
        let value = usd
            .checked_div(self.usd_price(fiat_ticker)?)
            .ok_or_else(|| MoneyError::Overflow(from.to_string()))?
            .round_dp_with_strategy(2, RoundingStrategy::ToZero);
        Ok(Amount::fiat(fiat_ticker, value, 2)?)
    }

    async fn fiat_to_fiat(&self, from: &Amount, fiat_ticker: &str) -> Result<Amount, AppError> {
        self.check_should_fail()?;
        if from.ticker() == fiat_ticker {
            return Ok(from.clone());
        }
        self.crypto_to_fiat(from, fiat_ticker).await
    }
}

/// Mock payments service with queued work lists and recorded transitions
pub struct MockPayments {
    config: MockConfig,
    withdrawals: Mutex<Vec<WithdrawalOrder>>,
    expired: Mutex<Vec<i64>>,
    transitions: Mutex<Vec<(i64, String)>>,
    next_payment_id: AtomicI64,
}

impl MockPayments {
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(MockConfig::success())
    }

    #[must_use]
    pub fn with_config(config: MockConfig) -> Self {
        Self {
            config,
            withdrawals: Mutex::new(Vec::new()),
            expired: Mutex::new(Vec::new()),
            transitions: Mutex::new(Vec::new()),
            next_payment_id: AtomicI64::new(1000),
        }
    }

    #[must_use]
    pub fn failing(message: impl Into<String>) -> Self {
        Self::with_config(MockConfig::failure(message))
    }

    /// Queue a withdrawal order for the next work-list pull
    pub fn push_withdrawal(&self, order: WithdrawalOrder) {
        self.withdrawals.lock().unwrap().push(order);
    }

    /// Queue an expired payment id for the next work-list pull
    pub fn push_expired(&self, payment_id: i64) {
        self.expired.lock().unwrap().push(payment_id);
    }

    /// (payment id, transition) pairs reported so far. Failed transitions
    /// are recorded as `failed: {reason}`.
    pub fn transitions(&self) -> Vec<(i64, String)> {
        self.transitions.lock().unwrap().clone()
    }

    fn record(&self, payment_id: i64, transition: impl Into<String>) {
        self.transitions
            .lock()
            .unwrap()
            .push((payment_id, transition.into()));
    }

    fn check_should_fail(&self) -> Result<(), AppError> {
        if self.config.should_fail {
            return Err(AppError::ExternalService(ExternalServiceError::Network(
                self.config.message(),
            )));
        }
        Ok(())
    }
}

impl Default for MockPayments {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PaymentGateway for MockPayments {
    async fn list_pending_withdrawals(&self, limit: i64) -> Result<Vec<WithdrawalOrder>, AppError> {
        self.check_should_fail()?;
        let mut queued = self.withdrawals.lock().unwrap();
        let take = (limit.max(0) as usize).min(queued.len());
        Ok(queued.drain(..take).collect())
    }

    async fn list_expired_payments(&self, limit: i64) -> Result<Vec<i64>, AppError> {
        self.check_should_fail()?;
        let mut queued = self.expired.lock().unwrap();
        let take = (limit.max(0) as usize).min(queued.len());
        Ok(queued.drain(..take).collect())
    }

    async fn create_topup_payment(
        &self,
        _merchant_id: i64,
        _amount: &Amount,
        _usd_amount: &Amount,
    ) -> Result<i64, AppError> {
        self.check_should_fail()?;
        Ok(self.next_payment_id.fetch_add(1, Ordering::Relaxed))
    }

    async fn mark_in_progress(&self, payment_id: i64) -> Result<(), AppError> {
        self.check_should_fail()?;
        self.record(payment_id, "in-progress");
        Ok(())
    }

    async fn mark_succeeded(&self, payment_id: i64) -> Result<(), AppError> {
        self.check_should_fail()?;
        self.record(payment_id, "succeeded");
        Ok(())
    }

    async fn mark_failed(&self, payment_id: i64, reason: &str) -> Result<(), AppError> {
        self.check_should_fail()?;
        self.record(payment_id, format!("failed: {reason}"));
        Ok(())
    }

    async fn mark_expired(&self, payment_id: i64) -> Result<(), AppError> {
        self.check_should_fail()?;
        self.record(payment_id, "expired");
        Ok(())
    }
}

/// Event publisher recording everything it sees
#[derive(Default)]
pub struct RecordingEvents {
    events: Mutex<Vec<Event>>,
}

impl RecordingEvents {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<Event> {
        self.events.lock().unwrap().clone()
    }

    pub fn topics(&self) -> Vec<&'static str> {
        self.events.lock().unwrap().iter().map(Event::topic).collect()
    }
}

impl EventPublisher for RecordingEvents {
    fn publish(&self, event: Event) {
        self.events.lock().unwrap().push(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn eth() -> &'static Currency {
        currency::find(Blockchain::Ethereum, "ETH").unwrap()
    }

    #[tokio::test]
    async fn test_memory_store_rejects_decrement_below_zero() {
        let store = MemoryStore::new();
        let owner = BalanceOwner::merchant(1);
        store.insert_balance(owner, eth(), false, dec!(1));

        let update = BalanceUpdate::new(
            owner,
            eth(),
            false,
            BalanceOperation::Decrement,
            Amount::crypto("ETH", dec!(2), 18).unwrap(),
            "overdraft attempt",
        );
        let err = store.apply_update(&update).await.unwrap_err();
        assert!(matches!(
            err,
            AppError::Ledger(LedgerError::InsufficientFunds { .. })
        ));
        assert_eq!(
            store.balance_amount(owner, "ETH", eth().network_id(false)),
            dec!(1)
        );
    }

    #[tokio::test]
    async fn test_memory_store_batch_update_is_atomic() {
        let store = MemoryStore::new();
        let owner = BalanceOwner::merchant(1);
        store.insert_balance(owner, eth(), false, dec!(1));

        let credit = BalanceUpdate::new(
            BalanceOwner::merchant(2),
            eth(),
            false,
            BalanceOperation::Increment,
            Amount::crypto("ETH", dec!(5), 18).unwrap(),
            "credit",
        );
        let overdraft = BalanceUpdate::new(
            owner,
            eth(),
            false,
            BalanceOperation::Decrement,
            Amount::crypto("ETH", dec!(2), 18).unwrap(),
            "overdraft",
        );
        assert!(store.apply_updates(&[credit, overdraft]).await.is_err());
        // The first update must have been rolled back with the second.
        assert_eq!(
            store.balance_amount(BalanceOwner::merchant(2), "ETH", eth().network_id(false)),
            dec!(0)
        );
    }

    #[tokio::test]
    async fn test_memory_store_acquire_skips_locked_wallets() {
        let store = MemoryStore::new();
        let first = store.insert_wallet(Blockchain::Ethereum, WalletType::Inbound);
        let second = store.insert_wallet(Blockchain::Ethereum, WalletType::Inbound);

        let (claimed, _) = store
            .acquire_available_wallet(1, Blockchain::Ethereum, "ETH", 1)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(claimed.id, first.id);

        let (next, _) = store
            .acquire_available_wallet(2, Blockchain::Ethereum, "ETH", 1)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(next.id, second.id);

        assert!(
            store
                .acquire_available_wallet(3, Blockchain::Ethereum, "ETH", 1)
                .await
                .unwrap()
                .is_none()
        );
    }

    #[tokio::test]
    async fn test_memory_store_nonce_cycle() {
        let store = MemoryStore::new();
        let wallet = store.insert_wallet(Blockchain::Tron, WalletType::Outbound);

        assert_eq!(store.increment_pending_nonce(wallet.id, false).await.unwrap(), 0);
        assert_eq!(store.increment_pending_nonce(wallet.id, false).await.unwrap(), 1);
        store.confirm_pending_nonce(wallet.id, false).await.unwrap();
        store.rollback_pending_nonce(wallet.id, false).await.unwrap();
        // One confirmed, none pending: next nonce continues from 1.
        assert_eq!(store.increment_pending_nonce(wallet.id, false).await.unwrap(), 1);

        let err = store
            .rollback_pending_nonce(wallet.id, true)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            AppError::Wallet(WalletError::NoPendingTransactions(_))
        ));
    }

    #[tokio::test]
    async fn test_payment_guard_serializes_claims() {
        let store = Arc::new(MemoryStore::new());
        let guard = store.lock_payment(7).await.unwrap();

        let contender = {
            let store = Arc::clone(&store);
            tokio::spawn(async move { store.lock_payment(7).await.map(|_| ()) })
        };
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert!(!contender.is_finished());

        guard.release().await.unwrap();
        contender.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_mock_converter_round_trips_through_usd() {
        let converter = MockConverter::new();
        let usd = Amount::usd(dec!(100)).unwrap();
        let crypto = converter.fiat_to_crypto(&usd, eth()).await.unwrap();
        assert_eq!(crypto.value(), dec!(0.05));

        let back = converter.crypto_to_fiat(&crypto, "USD").await.unwrap();
        assert_eq!(back.value(), dec!(100));
    }

    #[tokio::test]
    async fn test_mock_payments_drains_queued_work() {
        let payments = MockPayments::new();
        payments.push_expired(11);
        payments.push_expired(12);

        assert_eq!(payments.list_expired_payments(1).await.unwrap(), vec![11]);
        assert_eq!(payments.list_expired_payments(10).await.unwrap(), vec![12]);
        assert!(payments.list_expired_payments(10).await.unwrap().is_empty());
    }
}
