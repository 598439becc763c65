//! Application error types.
//!
//! A single top-level [`AppError`] wraps closed per-domain sub-enums so that
//! callers can match failure classes exhaustively instead of probing error
//! chains.

use thiserror::Error;

use super::types::{BalanceOwnerType, TransactionStatus};

/// Top-level application error
#[derive(Debug, Error)]
pub enum AppError {
    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Money error: {0}")]
    Money(#[from] MoneyError),

    #[error("Ledger error: {0}")]
    Ledger(#[from] LedgerError),

    #[error("Wallet error: {0}")]
    Wallet(#[from] WalletError),

    #[error("Transaction error: {0}")]
    Transaction(#[from] TransactionError),

    #[error("Signing error: {0}")]
    Signing(#[from] SigningError),

    #[error("Blockchain error: {0}")]
    Blockchain(#[from] BlockchainError),

    #[error("External service error: {0}")]
    ExternalService(#[from] ExternalServiceError),

    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Authentication error: {0}")]
    Authentication(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl AppError {
    /// Whether this failure permanently sinks the enclosing payment.
    ///
    /// A merchant-side insufficiency or a broadcast rejected for lack of
    /// funds will not resolve by retrying; everything else is treated as
    /// transient and left for the next scheduler pass.
    #[must_use]
    pub fn is_permanent_payment_failure(&self) -> bool {
        match self {
            AppError::Ledger(LedgerError::InsufficientFunds { owner_type, .. }) => {
                *owner_type == BalanceOwnerType::Merchant
            }
            AppError::Blockchain(BlockchainError::InsufficientFunds(_)) => true,
            _ => false,
        }
    }
}

/// Database access errors
#[derive(Debug, Error)]
pub enum DatabaseError {
    #[error("connection failed: {0}")]
    Connection(String),

    #[error("query failed: {0}")]
    Query(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("duplicate record: {0}")]
    Duplicate(String),

    #[error("migration failed: {0}")]
    Migration(String),
}

impl From<sqlx::Error> for DatabaseError {
    fn from(err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::RowNotFound => DatabaseError::NotFound(err.to_string()),
            sqlx::Error::Database(db_err) if db_err.is_unique_violation() => {
                DatabaseError::Duplicate(err.to_string())
            }
            sqlx::Error::PoolTimedOut | sqlx::Error::Io(_) => {
                DatabaseError::Connection(err.to_string())
            }
            _ => DatabaseError::Query(err.to_string()),
        }
    }
}

/// Money arithmetic errors
#[derive(Debug, Error, PartialEq, Eq)]
pub enum MoneyError {
    #[error("incompatible amounts: {expected} vs {actual}")]
    IncompatibleAmounts { expected: String, actual: String },

    #[error("invalid amount: {0}")]
    InvalidAmount(String),

    #[error("resulting amount is negative")]
    NegativeResult,

    #[error("arithmetic overflow: {0}")]
    Overflow(String),
}

/// Balance ledger errors
#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("insufficient {owner_type} balance: {available} {ticker} available, {required} {ticker} required")]
    InsufficientFunds {
        owner_type: BalanceOwnerType,
        ticker: String,
        available: String,
        required: String,
    },

    #[error("balance not found: {0}")]
    BalanceNotFound(String),

    #[error("balance is incompatible with requested delta: {0}")]
    IncompatibleBalance(String),

    #[error("merchant balance {0} has no wallet-side counterpart")]
    OrphanMerchantBalance(String),
}

/// Wallet, lock and nonce errors
#[derive(Debug, Error)]
pub enum WalletError {
    #[error("wallet not found: {0}")]
    NotFound(String),

    #[error("no outbound wallet for blockchain {0}")]
    NoOutboundWallet(String),

    #[error("wallet {wallet_id} is already locked for {currency}/{network_id}")]
    AlreadyLocked {
        wallet_id: i64,
        currency: String,
        network_id: i64,
    },

    #[error("lock not found for wallet {wallet_id} ({currency}/{network_id})")]
    LockNotFound {
        wallet_id: i64,
        currency: String,
        network_id: i64,
    },

    #[error("wallet {0} has no pending transactions to settle")]
    NoPendingTransactions(i64),
}

/// Transaction state machine errors
#[derive(Debug, Error)]
pub enum TransactionError {
    #[error("transaction not found: {0}")]
    NotFound(i64),

    #[error("transaction with hash {hash} already exists on network {network_id}")]
    DuplicateHash { network_id: i64, hash: String },

    #[error("transaction {id} already has status {status}")]
    SameStatus { id: i64, status: TransactionStatus },

    #[error("transaction {id} is terminal ({status})")]
    Terminal { id: i64, status: TransactionStatus },

    #[error("invalid transition for transaction {id}: {from} -> {to}")]
    InvalidTransition {
        id: i64,
        from: TransactionStatus,
        to: TransactionStatus,
    },

    #[error("transaction {0} has no fact amount")]
    MissingFactAmount(i64),

    #[error("invalid transaction: {0}")]
    InvalidCreation(String),
}

/// Signing service errors
#[derive(Debug, Error)]
pub enum SigningError {
    #[error("signing service unavailable: {0}")]
    Unavailable(String),

    #[error("signing request rejected: {0}")]
    Rejected(String),

    #[error("no transaction composer registered for blockchain {0}")]
    UnsupportedBlockchain(String),
}

/// Blockchain provider errors
#[derive(Debug, Error)]
pub enum BlockchainError {
    #[error("connection failed: {0}")]
    Connection(String),

    #[error("broadcast rejected: {0}")]
    BroadcastRejected(String),

    #[error("insufficient funds on chain: {0}")]
    InsufficientFunds(String),

    #[error("receipt not found for {0}")]
    ReceiptNotFound(String),

    #[error("unsupported asset: {0}")]
    UnsupportedAsset(String),
}

/// External HTTP collaborator errors
#[derive(Debug, Error)]
pub enum ExternalServiceError {
    #[error("network error: {0}")]
    Network(String),

    #[error("API error (status {status_code}): {message}")]
    ApiError { status_code: u16, message: String },

    #[error("response parsing failed: {0}")]
    ParseError(String),

    #[error("misconfigured: {0}")]
    Configuration(String),

    #[error("timeout: {0}")]
    Timeout(String),

    #[error("service unavailable: {0}")]
    Unavailable(String),
}

/// Input validation errors
#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("missing field: {0}")]
    MissingField(String),

    #[error("invalid field {field}: {message}")]
    InvalidField { field: String, message: String },

    #[error("{0}")]
    Multiple(String),
}

/// Startup configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("environment variable {0} is not set")]
    MissingVariable(String),

    #[error("environment variable {name} is invalid: {message}")]
    InvalidVariable { name: String, message: String },
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::types::BalanceOwnerType;

    #[test]
    fn test_permanent_payment_failure_classification() {
        let merchant_short = AppError::Ledger(LedgerError::InsufficientFunds {
            owner_type: BalanceOwnerType::Merchant,
            ticker: "ETH".to_string(),
            available: "0.1".to_string(),
            required: "0.5".to_string(),
        });
        assert!(merchant_short.is_permanent_payment_failure());

        let wallet_short = AppError::Ledger(LedgerError::InsufficientFunds {
            owner_type: BalanceOwnerType::Wallet,
            ticker: "ETH".to_string(),
            available: "0.1".to_string(),
            required: "0.5".to_string(),
        });
        assert!(!wallet_short.is_permanent_payment_failure());

        let broadcast_rejected = AppError::Blockchain(BlockchainError::InsufficientFunds(
            "insufficient funds for gas".to_string(),
        ));
        assert!(broadcast_rejected.is_permanent_payment_failure());

        let transient = AppError::ExternalService(ExternalServiceError::Timeout(
            "gateway timed out".to_string(),
        ));
        assert!(!transient.is_permanent_payment_failure());
    }

    #[test]
    fn test_sqlx_error_mapping() {
        let err = DatabaseError::from(sqlx::Error::RowNotFound);
        assert!(matches!(err, DatabaseError::NotFound(_)));
    }
}
