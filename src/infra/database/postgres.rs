//! PostgreSQL persistence for wallets, balances and transactions.
//!
//! All multi-row invariants (balance plus audit record, status transition
//! plus settlement, lock release alongside a transaction update) are held
//! inside a single database transaction here, so services above never have
//! to sequence partial writes.

use async_trait::async_trait;
use rust_decimal::Decimal;
use serde_json::{Map, Value};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgPool, Postgres, Row, Transaction as PgTransaction};
use std::time::Duration;
use tracing::{info, instrument};
use uuid::Uuid;

use crate::domain::{
    Amount, AppError, Balance, BalanceOperation, BalanceOwner, BalanceOwnerType, BalanceUpdate,
    Blockchain, CancelUpdate, ConfirmUpdate, CurrencyType, DatabaseError, HealthProbe, LedgerError,
    LedgerStore, LockKey, NewTransaction, PaymentGuard, PaymentGuardStore, ReceiveUpdate,
    Transaction, TransactionError, TransactionStatus, TransactionStore, TransactionType,
    ValidationError, Wallet, WalletError, WalletLock, WalletStore, WalletType, currency,
};

/// PostgreSQL connection pool configuration
#[derive(Debug, Clone)]
pub struct PostgresConfig {
    pub max_connections: u32,
    pub min_connections: u32,
    pub acquire_timeout: Duration,
    pub idle_timeout: Duration,
    pub max_lifetime: Duration,
}

impl Default for PostgresConfig {
    fn default() -> Self {
        Self {
            max_connections: 10,
            min_connections: 2,
            acquire_timeout: Duration::from_secs(3),
            idle_timeout: Duration::from_secs(600),
            max_lifetime: Duration::from_secs(1800),
        }
    }
}

const TRANSACTION_COLUMNS: &str = "id, uuid, transaction_type, status, entity_id, merchant_id, \
     sender_wallet_id, recipient_wallet_id, sender_address, recipient_address, blockchain, \
     network_id, currency, currency_type, decimals, network_decimals, amount, fact_amount, \
     service_fee, network_fee, usd_amount, hash, is_test, metadata, created_at, updated_at";

const BALANCE_COLUMNS: &str =
    "id, uuid, owner_type, owner_id, blockchain, network_id, currency, currency_type, decimals, \
     amount, created_at, updated_at";

const WALLET_COLUMNS: &str = "id, uuid, blockchain, address, wallet_type, \
     mainnet_subscription_id, testnet_subscription_id, confirmed_mainnet_transactions, \
     pending_mainnet_transactions, confirmed_testnet_transactions, \
     pending_testnet_transactions, created_at, updated_at";

/// PostgreSQL store with connection pooling
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    /// Create a new PostgreSQL store with custom configuration
    pub async fn new(database_url: &str, config: PostgresConfig) -> Result<Self, AppError> {
        info!("Connecting to PostgreSQL...");
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(config.acquire_timeout)
            .idle_timeout(config.idle_timeout)
            .max_lifetime(config.max_lifetime)
            .connect(database_url)
            .await
            .map_err(|e| AppError::Database(DatabaseError::Connection(e.to_string())))?;
        info!("Connected to PostgreSQL");
        Ok(Self { pool })
    }

    /// Create a new PostgreSQL store with default configuration
    pub async fn with_defaults(database_url: &str) -> Result<Self, AppError> {
        Self::new(database_url, PostgresConfig::default()).await
    }

    /// Run database migrations using sqlx migrate
    pub async fn run_migrations(&self) -> Result<(), AppError> {
        info!("Running database migrations...");
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| AppError::Database(DatabaseError::Migration(e.to_string())))?;
        info!("Database migrations completed successfully");
        Ok(())
    }

    /// Get the underlying connection pool (for testing)
    #[must_use]
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    fn row_to_wallet(row: &PgRow) -> Result<Wallet, AppError> {
        let blockchain_str: String = row.get("blockchain");
        let wallet_type_str: String = row.get("wallet_type");

        Ok(Wallet {
            id: row.get("id"),
            uuid: row.get("uuid"),
            blockchain: blockchain_str.parse().unwrap_or(Blockchain::Ethereum),
            address: row.get("address"),
            wallet_type: wallet_type_str.parse().unwrap_or(WalletType::Inbound),
            mainnet_subscription_id: row.get("mainnet_subscription_id"),
            testnet_subscription_id: row.get("testnet_subscription_id"),
            confirmed_mainnet_transactions: row.get("confirmed_mainnet_transactions"),
            pending_mainnet_transactions: row.get("pending_mainnet_transactions"),
            confirmed_testnet_transactions: row.get("confirmed_testnet_transactions"),
            pending_testnet_transactions: row.get("pending_testnet_transactions"),
            created_at: row.get("created_at"),
            updated_at: row.get("updated_at"),
        })
    }

    fn row_to_lock(row: &PgRow) -> WalletLock {
        WalletLock {
            id: row.get("id"),
            wallet_id: row.get("wallet_id"),
            merchant_id: row.get("merchant_id"),
            currency: row.get("currency"),
            network_id: row.get("network_id"),
            locked_at: row.get("locked_at"),
            locked_until: row.get("locked_until"),
        }
    }

    fn row_to_balance(row: &PgRow) -> Result<Balance, AppError> {
        let owner_type_str: String = row.get("owner_type");
        let blockchain_str: String = row.get("blockchain");
        let currency_type_str: String = row.get("currency_type");
        let ticker: String = row.get("currency");
        let decimals: i32 = row.get("decimals");
        let value: Decimal = row.get("amount");

        Ok(Balance {
            id: row.get("id"),
            uuid: row.get("uuid"),
            owner: BalanceOwner {
                owner_type: owner_type_str.parse().unwrap_or(BalanceOwnerType::Wallet),
                owner_id: row.get("owner_id"),
            },
            blockchain: blockchain_str.parse().unwrap_or(Blockchain::Ethereum),
            network_id: row.get("network_id"),
            currency_type: currency_type_str.parse().unwrap_or(CurrencyType::Coin),
            amount: Amount::crypto(&ticker, value, decimals as u32)?,
            created_at: row.get("created_at"),
            updated_at: row.get("updated_at"),
        })
    }

    fn row_to_transaction(row: &PgRow) -> Result<Transaction, AppError> {
        let type_str: String = row.get("transaction_type");
        let status_str: String = row.get("status");
        let blockchain_str: String = row.get("blockchain");
        let currency_type_str: String = row.get("currency_type");
        let ticker: String = row.get("currency");
        let blockchain: Blockchain = blockchain_str.parse().unwrap_or(Blockchain::Ethereum);
        let decimals = row.get::<i32, _>("decimals") as u32;
        let network_decimals = row.get::<i32, _>("network_decimals") as u32;
        let network_ticker = blockchain.native_ticker();

        let fact_amount = row
            .get::<Option<Decimal>, _>("fact_amount")
            .map(|value| Amount::crypto(&ticker, value, decimals))
            .transpose()?;
        let network_fee = row
            .get::<Option<Decimal>, _>("network_fee")
            .map(|value| Amount::crypto(network_ticker, value, network_decimals))
            .transpose()?;

        Ok(Transaction {
            id: row.get("id"),
            uuid: row.get("uuid"),
            transaction_type: type_str.parse().unwrap_or(TransactionType::Incoming),
            status: status_str.parse().unwrap_or(TransactionStatus::Pending),
            entity_id: row.get("entity_id"),
            merchant_id: row.get("merchant_id"),
            sender_wallet_id: row.get("sender_wallet_id"),
            recipient_wallet_id: row.get("recipient_wallet_id"),
            sender_address: row.get("sender_address"),
            recipient_address: row.get("recipient_address"),
            blockchain,
            network_id: row.get("network_id"),
            currency_type: currency_type_str.parse().unwrap_or(CurrencyType::Coin),
            amount: Amount::crypto(&ticker, row.get("amount"), decimals)?,
            fact_amount,
            service_fee: Amount::crypto(&ticker, row.get("service_fee"), decimals)?,
            network_fee,
            usd_amount: Amount::usd(row.get("usd_amount"))?,
            hash: row.get("hash"),
            is_test: row.get("is_test"),
            metadata: row.get("metadata"),
            created_at: row.get("created_at"),
            updated_at: row.get("updated_at"),
        })
    }

    /// Applies one balance change inside an open database transaction.
    ///
    /// Locks the balance row, creates it at zero if it does not exist yet,
    /// rejects decrements below zero and writes the audit record.
    async fn apply_update_in(
        tx: &mut PgTransaction<'static, Postgres>,
        update: &BalanceUpdate,
    ) -> Result<Balance, AppError> {
        if update.amount.is_zero() {
            return Err(AppError::Validation(ValidationError::InvalidField {
                field: "amount".to_string(),
                message: "balance update amount must be non-zero".to_string(),
            }));
        }

        let row = sqlx::query(&format!(
            "SELECT {BALANCE_COLUMNS} FROM balances \
             WHERE owner_type = $1 AND owner_id = $2 AND currency = $3 AND network_id = $4 \
             FOR UPDATE"
        ))
        .bind(update.owner.owner_type.as_str())
        .bind(update.owner.owner_id)
        .bind(update.amount.ticker())
        .bind(update.network_id)
        .fetch_optional(&mut **tx)
        .await
        .map_err(|e| AppError::Database(DatabaseError::Query(e.to_string())))?;

        let balance = match row {
            Some(row) => Self::row_to_balance(&row)?,
            None => {
                let row = sqlx::query(&format!(
                    "INSERT INTO balances \
                     (uuid, owner_type, owner_id, blockchain, network_id, currency, \
                      currency_type, decimals, amount) \
                     VALUES ($1, $2, $3, $4, $5, $6, $7, $8, 0) \
                     RETURNING {BALANCE_COLUMNS}"
                ))
                .bind(Uuid::new_v4())
                .bind(update.owner.owner_type.as_str())
                .bind(update.owner.owner_id)
                .bind(update.blockchain.as_str())
                .bind(update.network_id)
                .bind(update.amount.ticker())
                .bind(update.currency_type.as_str())
                .bind(update.amount.decimals() as i32)
                .fetch_one(&mut **tx)
                .await
                .map_err(|e| AppError::Database(DatabaseError::from(e)))?;
                Self::row_to_balance(&row)?
            }
        };

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

        let row = sqlx::query(&format!(
            "UPDATE balances SET amount = $1, updated_at = NOW() WHERE id = $2 \
             RETURNING {BALANCE_COLUMNS}"
        ))
        .bind(updated.value())
        .bind(balance.id)
        .fetch_one(&mut **tx)
        .await
        .map_err(|e| AppError::Database(DatabaseError::Query(e.to_string())))?;

        sqlx::query(
            "INSERT INTO balance_audit_log (balance_id, comment, metadata) VALUES ($1, $2, $3)",
        )
        .bind(balance.id)
        .bind(&update.comment)
        .bind(audit_metadata(update))
        .execute(&mut **tx)
        .await
        .map_err(|e| AppError::Database(DatabaseError::Query(e.to_string())))?;

        Self::row_to_balance(&row)
    }

    /// Loads a transaction row under `FOR UPDATE` so status checks and the
    /// following write happen against a stable row.
    async fn lock_transaction_row(
        tx: &mut PgTransaction<'static, Postgres>,
        id: i64,
    ) -> Result<Transaction, AppError> {
        let row = sqlx::query(&format!(
            "SELECT {TRANSACTION_COLUMNS} FROM transactions WHERE id = $1 FOR UPDATE"
        ))
        .bind(id)
        .fetch_optional(&mut **tx)
        .await
        .map_err(|e| AppError::Database(DatabaseError::Query(e.to_string())))?;

        match row {
            Some(row) => Self::row_to_transaction(&row),
            None => Err(AppError::Transaction(TransactionError::NotFound(id))),
        }
    }

    async fn release_lock_in(
        tx: &mut PgTransaction<'static, Postgres>,
        key: &LockKey,
    ) -> Result<(), AppError> {
        let result = sqlx::query(
            "DELETE FROM wallet_locks WHERE wallet_id = $1 AND currency = $2 AND network_id = $3",
        )
        .bind(key.wallet_id)
        .bind(&key.currency)
        .bind(key.network_id)
        .execute(&mut **tx)
        .await
        .map_err(|e| AppError::Database(DatabaseError::Query(e.to_string())))?;

        if result.rows_affected() == 0 {
            return Err(AppError::Wallet(WalletError::LockNotFound {
                wallet_id: key.wallet_id,
                currency: key.currency.clone(),
                network_id: key.network_id,
            }));
        }
        Ok(())
    }

    /// Tolerant variant for cancellation paths. A transaction past the
    /// receive step has already released its lock, so zero rows is fine.
    async fn discard_lock_in(
        tx: &mut PgTransaction<'static, Postgres>,
        key: &LockKey,
    ) -> Result<(), AppError> {
        sqlx::query(
            "DELETE FROM wallet_locks WHERE wallet_id = $1 AND currency = $2 AND network_id = $3",
        )
        .bind(key.wallet_id)
        .bind(&key.currency)
        .bind(key.network_id)
        .execute(&mut **tx)
        .await
        .map_err(|e| AppError::Database(DatabaseError::Query(e.to_string())))?;
        Ok(())
    }

    fn map_hash_conflict(err: sqlx::Error, network_id: i64, hash: &str) -> AppError {
        match &err {
            sqlx::Error::Database(db_err) if db_err.is_unique_violation() => {
                AppError::Transaction(TransactionError::DuplicateHash {
                    network_id,
                    hash: hash.to_string(),
                })
            }
            _ => AppError::Database(DatabaseError::from(err)),
        }
    }
}

/// Audit metadata: caller-provided keys plus the applied delta in both raw
/// and human units.
fn audit_metadata(update: &BalanceUpdate) -> Value {
    let mut map = match &update.metadata {
        Value::Object(entries) => entries.clone(),
        _ => Map::new(),
    };
    map.insert(
        "operation".to_string(),
        Value::String(update.operation.as_str().to_string()),
    );
    map.insert(
        "amountRaw".to_string(),
        Value::String(update.amount.to_raw_string()),
    );
    map.insert(
        "amountFormatted".to_string(),
        Value::String(update.amount.to_string()),
    );
    Value::Object(map)
}

/// Advisory lock key for an external payment, stable across processes.
pub(crate) fn payment_lock_key(payment_id: i64) -> i64 {
    i64::from(crc32fast::hash(format!("payments.{payment_id}").as_bytes()))
}

#[async_trait]
impl LedgerStore for PostgresStore {
    #[instrument(skip(self))]
    async fn get_balance(
        &self,
        owner: BalanceOwner,
        ticker: &str,
        network_id: i64,
    ) -> Result<Option<Balance>, AppError> {
        let row = sqlx::query(&format!(
            "SELECT {BALANCE_COLUMNS} FROM balances \
             WHERE owner_type = $1 AND owner_id = $2 AND currency = $3 AND network_id = $4"
        ))
        .bind(owner.owner_type.as_str())
        .bind(owner.owner_id)
        .bind(ticker)
        .bind(network_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| AppError::Database(DatabaseError::Query(e.to_string())))?;

        match row {
            Some(row) => Ok(Some(Self::row_to_balance(&row)?)),
            None => Ok(None),
        }
    }

    #[instrument(skip(self))]
    async fn get_balance_by_id(&self, id: i64) -> Result<Option<Balance>, AppError> {
        let row = sqlx::query(&format!(
            "SELECT {BALANCE_COLUMNS} FROM balances WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| AppError::Database(DatabaseError::Query(e.to_string())))?;

        match row {
            Some(row) => Ok(Some(Self::row_to_balance(&row)?)),
            None => Ok(None),
        }
    }

    #[instrument(skip(self))]
    async fn list_balances(&self, owner_type: BalanceOwnerType) -> Result<Vec<Balance>, AppError> {
        let rows = sqlx::query(&format!(
            "SELECT {BALANCE_COLUMNS} FROM balances WHERE owner_type = $1 ORDER BY id"
        ))
        .bind(owner_type.as_str())
        .fetch_all(&self.pool)
        .await
        .map_err(|e| AppError::Database(DatabaseError::Query(e.to_string())))?;

        rows.iter().map(Self::row_to_balance).collect()
    }

    #[instrument(skip(self))]
    async fn list_inbound_wallet_balances(
        &self,
        offset: i64,
        limit: i64,
    ) -> Result<Vec<Balance>, AppError> {
        let rows = sqlx::query(
            "SELECT b.id, b.uuid, b.owner_type, b.owner_id, b.blockchain, b.network_id, \
                    b.currency, b.currency_type, b.decimals, b.amount, b.created_at, b.updated_at \
             FROM balances b \
             JOIN wallets w ON w.id = b.owner_id \
             WHERE b.owner_type = 'wallet' AND w.wallet_type = 'inbound' AND b.amount > 0 \
             ORDER BY b.id \
             OFFSET $1 LIMIT $2",
        )
        .bind(offset)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| AppError::Database(DatabaseError::Query(e.to_string())))?;

        rows.iter().map(Self::row_to_balance).collect()
    }

    #[instrument(skip(self, update), fields(owner = %update.owner, operation = %update.operation, amount = %update.amount))]
    async fn apply_update(&self, update: &BalanceUpdate) -> Result<Balance, AppError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| AppError::Database(DatabaseError::Connection(e.to_string())))?;
        let balance = Self::apply_update_in(&mut tx, update).await?;
        tx.commit()
            .await
            .map_err(|e| AppError::Database(DatabaseError::Query(e.to_string())))?;
        Ok(balance)
    }

    #[instrument(skip(self, updates), fields(count = updates.len()))]
    async fn apply_updates(&self, updates: &[BalanceUpdate]) -> Result<Vec<Balance>, AppError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| AppError::Database(DatabaseError::Connection(e.to_string())))?;
        let mut balances = Vec::with_capacity(updates.len());
        for update in updates {
            balances.push(Self::apply_update_in(&mut tx, update).await?);
        }
        tx.commit()
            .await
            .map_err(|e| AppError::Database(DatabaseError::Query(e.to_string())))?;
        Ok(balances)
    }
}

#[async_trait]
impl WalletStore for PostgresStore {
    #[instrument(skip(self))]
    async fn create_wallet(
        &self,
        blockchain: Blockchain,
        wallet_type: WalletType,
        uuid: Uuid,
        address: &str,
    ) -> Result<Wallet, AppError> {
        let row = sqlx::query(&format!(
            "INSERT INTO wallets (uuid, blockchain, address, wallet_type) \
             VALUES ($1, $2, $3, $4) \
             RETURNING {WALLET_COLUMNS}"
        ))
        .bind(uuid)
        .bind(blockchain.as_str())
        .bind(address)
        .bind(wallet_type.as_str())
        .fetch_one(&self.pool)
        .await
        .map_err(|e| AppError::Database(DatabaseError::from(e)))?;

        Self::row_to_wallet(&row)
    }

    #[instrument(skip(self))]
    async fn get_wallet(&self, id: i64) -> Result<Option<Wallet>, AppError> {
        let row = sqlx::query(&format!("SELECT {WALLET_COLUMNS} FROM wallets WHERE id = $1"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| AppError::Database(DatabaseError::Query(e.to_string())))?;

        match row {
            Some(row) => Ok(Some(Self::row_to_wallet(&row)?)),
            None => Ok(None),
        }
    }

    #[instrument(skip(self))]
    async fn get_wallet_by_uuid(&self, uuid: &Uuid) -> Result<Option<Wallet>, AppError> {
        let row = sqlx::query(&format!(
            "SELECT {WALLET_COLUMNS} FROM wallets WHERE uuid = $1"
        ))
        .bind(uuid)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| AppError::Database(DatabaseError::Query(e.to_string())))?;

        match row {
            Some(row) => Ok(Some(Self::row_to_wallet(&row)?)),
            None => Ok(None),
        }
    }

    #[instrument(skip(self))]
    async fn get_outbound_wallet(
        &self,
        blockchain: Blockchain,
    ) -> Result<Option<Wallet>, AppError> {
        let row = sqlx::query(&format!(
            "SELECT {WALLET_COLUMNS} FROM wallets \
             WHERE blockchain = $1 AND wallet_type = 'outbound' \
             ORDER BY id LIMIT 1"
        ))
        .bind(blockchain.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| AppError::Database(DatabaseError::Query(e.to_string())))?;

        match row {
            Some(row) => Ok(Some(Self::row_to_wallet(&row)?)),
            None => Ok(None),
        }
    }

    #[instrument(skip(self))]
    async fn set_subscription_id(
        &self,
        wallet_id: i64,
        is_test: bool,
        subscription_id: &str,
    ) -> Result<(), AppError> {
        let column = if is_test {
            "testnet_subscription_id"
        } else {
            "mainnet_subscription_id"
        };
        let result = sqlx::query(&format!(
            "UPDATE wallets SET {column} = $1, updated_at = NOW() WHERE id = $2"
        ))
        .bind(subscription_id)
        .bind(wallet_id)
        .execute(&self.pool)
        .await
        .map_err(|e| AppError::Database(DatabaseError::Query(e.to_string())))?;

        if result.rows_affected() == 0 {
            return Err(AppError::Wallet(WalletError::NotFound(
                wallet_id.to_string(),
            )));
        }
        Ok(())
    }

    #[instrument(skip(self))]
    async fn acquire_available_wallet(
        &self,
        merchant_id: i64,
        blockchain: Blockchain,
        ticker: &str,
        network_id: i64,
    ) -> Result<Option<(Wallet, WalletLock)>, AppError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| AppError::Database(DatabaseError::Connection(e.to_string())))?;

        // SKIP LOCKED lets concurrent acquisitions each claim a different
        // wallet instead of queueing on the first candidate.
        let row = sqlx::query(&format!(
            "SELECT {WALLET_COLUMNS} FROM wallets \
             WHERE blockchain = $1 AND wallet_type = 'inbound' \
               AND NOT EXISTS (\
                   SELECT 1 FROM wallet_locks l \
                   WHERE l.wallet_id = wallets.id AND l.currency = $2 AND l.network_id = $3) \
             ORDER BY id \
             LIMIT 1 \
             FOR UPDATE SKIP LOCKED"
        ))
        .bind(blockchain.as_str())
        .bind(ticker)
        .bind(network_id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| AppError::Database(DatabaseError::Query(e.to_string())))?;

        let Some(row) = row else {
            return Ok(None);
        };
        let wallet = Self::row_to_wallet(&row)?;

        let lock_row = sqlx::query(
            "INSERT INTO wallet_locks (wallet_id, merchant_id, currency, network_id) \
             VALUES ($1, $2, $3, $4) \
             RETURNING id, wallet_id, merchant_id, currency, network_id, locked_at, locked_until",
        )
        .bind(wallet.id)
        .bind(merchant_id)
        .bind(ticker)
        .bind(network_id)
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| match &e {
            sqlx::Error::Database(db_err) if db_err.is_unique_violation() => {
                AppError::Wallet(WalletError::AlreadyLocked {
                    wallet_id: wallet.id,
                    currency: ticker.to_string(),
                    network_id,
                })
            }
            _ => AppError::Database(DatabaseError::from(e)),
        })?;
        let lock = Self::row_to_lock(&lock_row);

        tx.commit()
            .await
            .map_err(|e| AppError::Database(DatabaseError::Query(e.to_string())))?;
        Ok(Some((wallet, lock)))
    }

    #[instrument(skip(self))]
    async fn lock_wallet(
        &self,
        wallet_id: i64,
        merchant_id: i64,
        ticker: &str,
        network_id: i64,
    ) -> Result<WalletLock, AppError> {
        let row = sqlx::query(
            "INSERT INTO wallet_locks (wallet_id, merchant_id, currency, network_id) \
             VALUES ($1, $2, $3, $4) \
             RETURNING id, wallet_id, merchant_id, currency, network_id, locked_at, locked_until",
        )
        .bind(wallet_id)
        .bind(merchant_id)
        .bind(ticker)
        .bind(network_id)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| match &e {
            sqlx::Error::Database(db_err) if db_err.is_unique_violation() => {
                AppError::Wallet(WalletError::AlreadyLocked {
                    wallet_id,
                    currency: ticker.to_string(),
                    network_id,
                })
            }
            _ => AppError::Database(DatabaseError::from(e)),
        })?;

        Ok(Self::row_to_lock(&row))
    }

    #[instrument(skip(self))]
    async fn release_lock(&self, key: &LockKey) -> Result<(), AppError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| AppError::Database(DatabaseError::Connection(e.to_string())))?;
        Self::release_lock_in(&mut tx, key).await?;
        tx.commit()
            .await
            .map_err(|e| AppError::Database(DatabaseError::Query(e.to_string())))?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn increment_pending_nonce(
        &self,
        wallet_id: i64,
        is_test: bool,
    ) -> Result<i64, AppError> {
        let (pending, confirmed) = nonce_columns(is_test);
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| AppError::Database(DatabaseError::Connection(e.to_string())))?;

        let row = sqlx::query(&format!(
            "SELECT {pending} AS pending, {confirmed} AS confirmed \
             FROM wallets WHERE id = $1 FOR UPDATE"
        ))
        .bind(wallet_id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| AppError::Database(DatabaseError::Query(e.to_string())))?
        .ok_or_else(|| AppError::Wallet(WalletError::NotFound(wallet_id.to_string())))?;

        let pending_count: i64 = row.get("pending");
        let confirmed_count: i64 = row.get("confirmed");
        let nonce = confirmed_count + pending_count;

        sqlx::query(&format!(
            "UPDATE wallets SET {pending} = {pending} + 1, updated_at = NOW() WHERE id = $1"
        ))
        .bind(wallet_id)
        .execute(&mut *tx)
        .await
        .map_err(|e| AppError::Database(DatabaseError::Query(e.to_string())))?;

        tx.commit()
            .await
            .map_err(|e| AppError::Database(DatabaseError::Query(e.to_string())))?;
        Ok(nonce)
    }

    #[instrument(skip(self))]
    async fn confirm_pending_nonce(&self, wallet_id: i64, is_test: bool) -> Result<(), AppError> {
        let (pending, confirmed) = nonce_columns(is_test);
        let result = sqlx::query(&format!(
            "UPDATE wallets \
             SET {confirmed} = {confirmed} + 1, {pending} = {pending} - 1, updated_at = NOW() \
             WHERE id = $1 AND {pending} > 0"
        ))
        .bind(wallet_id)
        .execute(&self.pool)
        .await
        .map_err(|e| AppError::Database(DatabaseError::Query(e.to_string())))?;

        if result.rows_affected() == 0 {
            return Err(AppError::Wallet(WalletError::NoPendingTransactions(
                wallet_id,
            )));
        }
        Ok(())
    }

    #[instrument(skip(self))]
    async fn rollback_pending_nonce(&self, wallet_id: i64, is_test: bool) -> Result<(), AppError> {
        let (pending, _) = nonce_columns(is_test);
        let result = sqlx::query(&format!(
            "UPDATE wallets SET {pending} = {pending} - 1, updated_at = NOW() \
             WHERE id = $1 AND {pending} > 0"
        ))
        .bind(wallet_id)
        .execute(&self.pool)
        .await
        .map_err(|e| AppError::Database(DatabaseError::Query(e.to_string())))?;

        if result.rows_affected() == 0 {
            return Err(AppError::Wallet(WalletError::NoPendingTransactions(
                wallet_id,
            )));
        }
        Ok(())
    }
}

fn nonce_columns(is_test: bool) -> (&'static str, &'static str) {
    if is_test {
        (
            "pending_testnet_transactions",
            "confirmed_testnet_transactions",
        )
    } else {
        (
            "pending_mainnet_transactions",
            "confirmed_mainnet_transactions",
        )
    }
}

#[async_trait]
impl TransactionStore for PostgresStore {
    #[instrument(skip(self, new), fields(transaction_type = %new.transaction_type, amount = %new.amount))]
    async fn create_transaction(&self, new: &NewTransaction) -> Result<Transaction, AppError> {
        let network_decimals = currency::native_coin(new.blockchain).decimals;
        let hash = new.hash.as_deref().unwrap_or_default();

        let row = sqlx::query(&format!(
            "INSERT INTO transactions \
             (uuid, transaction_type, status, entity_id, merchant_id, sender_wallet_id, \
              recipient_wallet_id, sender_address, recipient_address, blockchain, network_id, \
              currency, currency_type, decimals, network_decimals, amount, fact_amount, \
              service_fee, network_fee, usd_amount, hash, is_test, metadata) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, \
                     $17, $18, $19, $20, $21, $22, $23) \
             RETURNING {TRANSACTION_COLUMNS}"
        ))
        .bind(Uuid::now_v7())
        .bind(new.transaction_type.as_str())
        .bind(new.status.as_str())
        .bind(new.entity_id)
        .bind(new.merchant_id)
        .bind(new.sender_wallet_id)
        .bind(new.recipient_wallet_id)
        .bind(&new.sender_address)
        .bind(&new.recipient_address)
        .bind(new.blockchain.as_str())
        .bind(new.network_id)
        .bind(new.amount.ticker())
        .bind(new.currency_type.as_str())
        .bind(new.amount.decimals() as i32)
        .bind(network_decimals as i32)
        .bind(new.amount.value())
        .bind(new.fact_amount.as_ref().map(Amount::value))
        .bind(new.service_fee.value())
        .bind(new.network_fee.as_ref().map(Amount::value))
        .bind(new.usd_amount.value())
        .bind(&new.hash)
        .bind(new.is_test)
        .bind(&new.metadata)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| Self::map_hash_conflict(e, new.network_id, hash))?;

        Self::row_to_transaction(&row)
    }

    #[instrument(skip(self))]
    async fn get_transaction(&self, id: i64) -> Result<Option<Transaction>, AppError> {
        let row = sqlx::query(&format!(
            "SELECT {TRANSACTION_COLUMNS} FROM transactions WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| AppError::Database(DatabaseError::Query(e.to_string())))?;

        match row {
            Some(row) => Ok(Some(Self::row_to_transaction(&row)?)),
            None => Ok(None),
        }
    }

    #[instrument(skip(self))]
    async fn get_transaction_by_hash(
        &self,
        network_id: i64,
        hash: &str,
    ) -> Result<Option<Transaction>, AppError> {
        let row = sqlx::query(&format!(
            "SELECT {TRANSACTION_COLUMNS} FROM transactions \
             WHERE network_id = $1 AND hash = $2"
        ))
        .bind(network_id)
        .bind(hash)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| AppError::Database(DatabaseError::Query(e.to_string())))?;

        match row {
            Some(row) => Ok(Some(Self::row_to_transaction(&row)?)),
            None => Ok(None),
        }
    }

    #[instrument(skip(self))]
    async fn get_latest_by_entity(
        &self,
        entity_id: i64,
        transaction_type: TransactionType,
        statuses: &[TransactionStatus],
    ) -> Result<Option<Transaction>, AppError> {
        let statuses: Vec<String> = statuses.iter().map(|s| s.as_str().to_string()).collect();
        let row = sqlx::query(&format!(
            "SELECT {TRANSACTION_COLUMNS} FROM transactions \
             WHERE entity_id = $1 AND transaction_type = $2 AND status = ANY($3) \
             ORDER BY id DESC LIMIT 1"
        ))
        .bind(entity_id)
        .bind(transaction_type.as_str())
        .bind(&statuses)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| AppError::Database(DatabaseError::Query(e.to_string())))?;

        match row {
            Some(row) => Ok(Some(Self::row_to_transaction(&row)?)),
            None => Ok(None),
        }
    }

    #[instrument(skip(self))]
    async fn find_expected_incoming(
        &self,
        wallet_id: i64,
        ticker: &str,
        network_id: i64,
    ) -> Result<Option<Transaction>, AppError> {
        let row = sqlx::query(&format!(
            "SELECT {TRANSACTION_COLUMNS} FROM transactions \
             WHERE recipient_wallet_id = $1 AND currency = $2 AND network_id = $3 \
               AND transaction_type = 'incoming' AND status = 'pending' \
               AND (hash IS NULL OR hash = '') \
             ORDER BY id DESC LIMIT 1"
        ))
        .bind(wallet_id)
        .bind(ticker)
        .bind(network_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| AppError::Database(DatabaseError::Query(e.to_string())))?;

        match row {
            Some(row) => Ok(Some(Self::row_to_transaction(&row)?)),
            None => Ok(None),
        }
    }

    #[instrument(skip(self))]
    async fn list_by_status(
        &self,
        transaction_type: TransactionType,
        statuses: &[TransactionStatus],
        limit: i64,
    ) -> Result<Vec<Transaction>, AppError> {
        let statuses: Vec<String> = statuses.iter().map(|s| s.as_str().to_string()).collect();
        let rows = sqlx::query(&format!(
            "SELECT {TRANSACTION_COLUMNS} FROM transactions \
             WHERE transaction_type = $1 AND status = ANY($2) \
             ORDER BY id LIMIT $3"
        ))
        .bind(transaction_type.as_str())
        .bind(&statuses)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| AppError::Database(DatabaseError::Query(e.to_string())))?;

        rows.iter().map(Self::row_to_transaction).collect()
    }

    #[instrument(skip(self, update), fields(status = %update.status, hash = %update.hash))]
    async fn receive_transaction(
        &self,
        id: i64,
        expected_status: TransactionStatus,
        update: &ReceiveUpdate,
        release_lock: Option<&LockKey>,
    ) -> Result<Transaction, AppError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| AppError::Database(DatabaseError::Connection(e.to_string())))?;

        let current = Self::lock_transaction_row(&mut tx, id).await?;
        if current.status != expected_status {
            return Err(AppError::Transaction(TransactionError::InvalidTransition {
                id,
                from: current.status,
                to: update.status,
            }));
        }

        let row = sqlx::query(&format!(
            "UPDATE transactions \
             SET status = $1, sender_address = $2, hash = $3, fact_amount = $4, \
                 metadata = metadata || $5::jsonb, updated_at = NOW() \
             WHERE id = $6 \
             RETURNING {TRANSACTION_COLUMNS}"
        ))
        .bind(update.status.as_str())
        .bind(&update.sender_address)
        .bind(&update.hash)
        .bind(update.fact_amount.value())
        .bind(&update.metadata)
        .bind(id)
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| Self::map_hash_conflict(e, current.network_id, &update.hash))?;

        if let Some(key) = release_lock {
            Self::release_lock_in(&mut tx, key).await?;
        }

        tx.commit()
            .await
            .map_err(|e| AppError::Database(DatabaseError::Query(e.to_string())))?;
        Self::row_to_transaction(&row)
    }

    #[instrument(skip(self, update, settlement), fields(status = %update.status, updates = settlement.len()))]
    async fn confirm_transaction(
        &self,
        id: i64,
        expected_status: TransactionStatus,
        update: &ConfirmUpdate,
        settlement: &[BalanceUpdate],
    ) -> Result<Transaction, AppError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| AppError::Database(DatabaseError::Connection(e.to_string())))?;

        let current = Self::lock_transaction_row(&mut tx, id).await?;
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

        let row = sqlx::query(&format!(
            "UPDATE transactions \
             SET status = $1, fact_amount = $2, \
                 network_fee = COALESCE($3, network_fee), \
                 service_fee = CASE WHEN $4 THEN 0 ELSE service_fee END, \
                 updated_at = NOW() \
             WHERE id = $5 \
             RETURNING {TRANSACTION_COLUMNS}"
        ))
        .bind(update.status.as_str())
        .bind(update.fact_amount.value())
        .bind(update.network_fee.as_ref().map(Amount::value))
        .bind(update.zero_service_fee)
        .bind(id)
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| AppError::Database(DatabaseError::Query(e.to_string())))?;

        for balance_update in settlement {
            Self::apply_update_in(&mut tx, balance_update).await?;
        }

        tx.commit()
            .await
            .map_err(|e| AppError::Database(DatabaseError::Query(e.to_string())))?;
        Self::row_to_transaction(&row)
    }

    #[instrument(skip(self, update), fields(status = %update.status, reason = %update.reason))]
    async fn cancel_transaction(
        &self,
        id: i64,
        update: &CancelUpdate,
        release_lock: Option<&LockKey>,
    ) -> Result<Transaction, AppError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| AppError::Database(DatabaseError::Connection(e.to_string())))?;

        let current = Self::lock_transaction_row(&mut tx, id).await?;
        if current.status.is_final() {
            return Err(AppError::Transaction(TransactionError::Terminal {
                id,
                status: current.status,
            }));
        }

        let metadata = serde_json::json!({ "comment": update.reason });
        let row = sqlx::query(&format!(
            "UPDATE transactions \
             SET status = $1, network_fee = COALESCE($2, network_fee), \
                 metadata = metadata || $3::jsonb, updated_at = NOW() \
             WHERE id = $4 \
             RETURNING {TRANSACTION_COLUMNS}"
        ))
        .bind(update.status.as_str())
        .bind(update.network_fee.as_ref().map(Amount::value))
        .bind(&metadata)
        .bind(id)
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| AppError::Database(DatabaseError::Query(e.to_string())))?;

        if let Some(key) = release_lock {
            Self::discard_lock_in(&mut tx, key).await?;
        }

        tx.commit()
            .await
            .map_err(|e| AppError::Database(DatabaseError::Query(e.to_string())))?;
        Self::row_to_transaction(&row)
    }

    #[instrument(skip(self))]
    async fn set_transaction_hash(&self, id: i64, hash: &str) -> Result<(), AppError> {
        let network_id: i64 = sqlx::query("SELECT network_id FROM transactions WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| AppError::Database(DatabaseError::Query(e.to_string())))?
            .map(|row| row.get("network_id"))
            .ok_or(AppError::Transaction(TransactionError::NotFound(id)))?;

        sqlx::query("UPDATE transactions SET hash = $1, updated_at = NOW() WHERE id = $2")
            .bind(hash)
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(|e| Self::map_hash_conflict(e, network_id, hash))?;
        Ok(())
    }
}

/// Holds an advisory lock on one payment for the guard's lifetime.
///
/// The lock is transaction-scoped: releasing commits the transaction,
/// dropping the guard rolls it back. Either way the claim is gone.
pub struct PgPaymentGuard {
    tx: Option<PgTransaction<'static, Postgres>>,
}

#[async_trait]
impl PaymentGuard for PgPaymentGuard {
    async fn release(mut self: Box<Self>) -> Result<(), AppError> {
        if let Some(tx) = self.tx.take() {
            tx.commit()
                .await
                .map_err(|e| AppError::Database(DatabaseError::Query(e.to_string())))?;
        }
        Ok(())
    }
}

#[async_trait]
impl PaymentGuardStore for PostgresStore {
    #[instrument(skip(self))]
    async fn lock_payment(&self, payment_id: i64) -> Result<Box<dyn PaymentGuard>, AppError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| AppError::Database(DatabaseError::Connection(e.to_string())))?;

        sqlx::query("SELECT pg_advisory_xact_lock($1)")
            .bind(payment_lock_key(payment_id))
            .execute(&mut *tx)
            .await
            .map_err(|e| AppError::Database(DatabaseError::Query(e.to_string())))?;

        Ok(Box::new(PgPaymentGuard { tx: Some(tx) }))
    }
}

#[async_trait]
impl HealthProbe for PostgresStore {
    #[instrument(skip(self))]
    async fn health_check(&self) -> Result<(), AppError> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(|e| AppError::Database(DatabaseError::Connection(e.to_string())))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::currency;
    use rust_decimal_macros::dec;

    #[test]
    fn test_postgres_config_default() {
        let config = PostgresConfig::default();
        assert_eq!(config.max_connections, 10);
        assert_eq!(config.min_connections, 2);
        assert_eq!(config.acquire_timeout, Duration::from_secs(3));
        assert_eq!(config.idle_timeout, Duration::from_secs(600));
        assert_eq!(config.max_lifetime, Duration::from_secs(1800));
    }

    #[test]
    fn test_audit_metadata_preserves_caller_keys() {
        let eth = currency::find(Blockchain::Ethereum, "ETH").unwrap();
        let update = BalanceUpdate::new(
            BalanceOwner::merchant(7),
            eth,
            false,
            BalanceOperation::Increment,
            Amount::crypto("ETH", dec!(0.5), 18).unwrap(),
            "incoming tx 0xabc",
        )
        .with_metadata(serde_json::json!({ "transactionId": 42 }));

        let metadata = audit_metadata(&update);
        assert_eq!(metadata["transactionId"], 42);
        assert_eq!(metadata["operation"], "increment");
        assert_eq!(metadata["amountRaw"], "500000000000000000");
        assert_eq!(metadata["amountFormatted"], "0.5 ETH");
    }

    #[test]
    fn test_payment_lock_key_is_stable() {
        assert_eq!(payment_lock_key(42), payment_lock_key(42));
        assert_ne!(payment_lock_key(42), payment_lock_key(43));
        // Fits the signed 64-bit advisory lock keyspace without wrapping.
        assert!(payment_lock_key(i64::MAX) >= 0);
    }
}
