//! Core domain entities: wallets, balances, transactions and the payloads
//! that move between the engine and its collaborators.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use utoipa::ToSchema;
use uuid::Uuid;

use super::currency::{self, Blockchain, Currency, CurrencyType};
use super::error::{LedgerError, MoneyError};
use super::money::Amount;

/// Merchant id reserved for system-owned funds (unexpected deposits,
/// internal transfers, service balances).
pub const SYSTEM_MERCHANT_ID: i64 = 0;

/// Lifecycle of a ledger transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TransactionStatus {
    /// Created, nothing observed on chain yet
    #[default]
    Pending,
    /// Observed on chain, awaiting confirmations
    InProgress,
    /// Observed on chain with an amount below the expected one
    InProgressInvalid,
    /// Confirmed and settled
    Completed,
    /// Confirmed and settled, but flagged invalid (merchant not credited)
    CompletedInvalid,
    /// Cancelled before reaching the chain
    Cancelled,
    /// Rejected or reverted by the chain
    Failed,
}

impl TransactionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::InProgress => "inProgress",
            Self::InProgressInvalid => "inProgressInv",
            Self::Completed => "completed",
            Self::CompletedInvalid => "completedInv",
            Self::Cancelled => "canceled",
            Self::Failed => "failed",
        }
    }

    /// Terminal statuses admit no further transitions.
    #[must_use]
    pub fn is_final(&self) -> bool {
        matches!(
            self,
            Self::Completed | Self::CompletedInvalid | Self::Cancelled | Self::Failed
        )
    }
}

impl std::str::FromStr for TransactionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "inProgress" => Ok(Self::InProgress),
            "inProgressInv" => Ok(Self::InProgressInvalid),
            "completed" => Ok(Self::Completed),
            "completedInv" => Ok(Self::CompletedInvalid),
            "canceled" => Ok(Self::Cancelled),
            "failed" => Ok(Self::Failed),
            _ => Err(format!("Invalid transaction status: {}", s)),
        }
    }
}

impl std::fmt::Display for TransactionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Direction and purpose of a ledger transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionType {
    /// Customer deposit into an inbound wallet
    Incoming,
    /// Funds consolidation from an inbound to the outbound wallet
    Internal,
    /// Merchant payout to an external address
    Withdrawal,
    /// Ledger-only movement with no on-chain counterpart
    Virtual,
}

impl TransactionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Incoming => "incoming",
            Self::Internal => "internal",
            Self::Withdrawal => "withdrawal",
            Self::Virtual => "virtual",
        }
    }
}

impl std::str::FromStr for TransactionType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "incoming" => Ok(Self::Incoming),
            "internal" => Ok(Self::Internal),
            "withdrawal" => Ok(Self::Withdrawal),
            "virtual" => Ok(Self::Virtual),
            _ => Err(format!("Invalid transaction type: {}", s)),
        }
    }
}

impl std::fmt::Display for TransactionType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Wallet role in the funds flow
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WalletType {
    /// Receives customer deposits, one payment at a time
    Inbound,
    /// Holds consolidated funds and pays withdrawals
    Outbound,
}

impl WalletType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Inbound => "inbound",
            Self::Outbound => "outbound",
        }
    }
}

impl std::str::FromStr for WalletType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "inbound" => Ok(Self::Inbound),
            "outbound" => Ok(Self::Outbound),
            _ => Err(format!("Invalid wallet type: {}", s)),
        }
    }
}

impl std::fmt::Display for WalletType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Who a balance belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BalanceOwnerType {
    Merchant,
    Wallet,
}

impl BalanceOwnerType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Merchant => "merchant",
            Self::Wallet => "wallet",
        }
    }
}

impl std::str::FromStr for BalanceOwnerType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "merchant" => Ok(Self::Merchant),
            "wallet" => Ok(Self::Wallet),
            _ => Err(format!("Invalid balance owner type: {}", s)),
        }
    }
}

impl std::fmt::Display for BalanceOwnerType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A balance owner reference
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BalanceOwner {
    pub owner_type: BalanceOwnerType,
    pub owner_id: i64,
}

impl BalanceOwner {
    #[must_use]
    pub fn merchant(id: i64) -> Self {
        Self {
            owner_type: BalanceOwnerType::Merchant,
            owner_id: id,
        }
    }

    #[must_use]
    pub fn wallet(id: i64) -> Self {
        Self {
            owner_type: BalanceOwnerType::Wallet,
            owner_id: id,
        }
    }
}

impl std::fmt::Display for BalanceOwner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.owner_type, self.owner_id)
    }
}

/// Direction of a balance change
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BalanceOperation {
    Increment,
    Decrement,
}

impl BalanceOperation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Increment => "increment",
            Self::Decrement => "decrement",
        }
    }
}

impl std::str::FromStr for BalanceOperation {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "increment" => Ok(Self::Increment),
            "decrement" => Ok(Self::Decrement),
            _ => Err(format!("Invalid balance operation: {}", s)),
        }
    }
}

impl std::fmt::Display for BalanceOperation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A custodial wallet managed through the signing service.
///
/// Nonce counters are tracked per network so mainnet and testnet signing
/// never contend for the same sequence.
#[derive(Debug, Clone, PartialEq)]
pub struct Wallet {
    pub id: i64,
    pub uuid: Uuid,
    pub blockchain: Blockchain,
    pub address: String,
    pub wallet_type: WalletType,
    pub mainnet_subscription_id: Option<String>,
    pub testnet_subscription_id: Option<String>,
    pub confirmed_mainnet_transactions: i64,
    pub pending_mainnet_transactions: i64,
    pub confirmed_testnet_transactions: i64,
    pub pending_testnet_transactions: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Wallet {
    #[must_use]
    pub fn subscription_id(&self, is_test: bool) -> Option<&str> {
        if is_test {
            self.testnet_subscription_id.as_deref()
        } else {
            self.mainnet_subscription_id.as_deref()
        }
    }

    #[must_use]
    pub fn owner(&self) -> BalanceOwner {
        BalanceOwner::wallet(self.id)
    }
}

/// An exclusive claim on an inbound wallet for one payment's currency
#[derive(Debug, Clone, PartialEq)]
pub struct WalletLock {
    pub id: i64,
    pub wallet_id: i64,
    pub merchant_id: i64,
    pub currency: String,
    pub network_id: i64,
    pub locked_at: DateTime<Utc>,
    pub locked_until: Option<DateTime<Utc>>,
}

/// Identifies a wallet lock without loading it
#[derive(Debug, Clone, PartialEq)]
pub struct LockKey {
    pub wallet_id: i64,
    pub currency: String,
    pub network_id: i64,
}

/// A single-currency balance row owned by a merchant or a wallet
#[derive(Debug, Clone, PartialEq)]
pub struct Balance {
    pub id: i64,
    pub uuid: Uuid,
    pub owner: BalanceOwner,
    pub blockchain: Blockchain,
    pub network_id: i64,
    pub currency_type: CurrencyType,
    pub amount: Amount,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Balance {
    #[must_use]
    pub fn ticker(&self) -> &str {
        self.amount.ticker()
    }

    /// Checks that the balance can pay all expenses at once.
    pub fn covers(&self, expenses: &[&Amount]) -> Result<(), LedgerError> {
        let mut required = Amount::zero(
            self.amount.ticker(),
            self.amount.decimals(),
            self.amount.kind(),
        );
        for expense in expenses {
            required = required
                .checked_add(expense)
                .map_err(|e| LedgerError::IncompatibleBalance(e.to_string()))?;
        }
        match self.amount.checked_sub(&required) {
            Ok(_) => Ok(()),
            Err(MoneyError::NegativeResult) => {
                Err(LedgerError::InsufficientFunds {
                    owner_type: self.owner.owner_type,
                    ticker: self.amount.ticker().to_string(),
                    available: self.amount.value().to_string(),
                    required: required.value().to_string(),
                })
            }
            Err(e) => Err(LedgerError::IncompatibleBalance(e.to_string())),
        }
    }

    #[must_use]
    pub fn resolve_currency(&self) -> Option<&'static Currency> {
        currency::find(self.blockchain, self.amount.ticker())
    }
}

/// One signed balance change, applied atomically with its audit record
#[derive(Debug, Clone, PartialEq)]
pub struct BalanceUpdate {
    pub owner: BalanceOwner,
    pub blockchain: Blockchain,
    pub network_id: i64,
    pub currency_type: CurrencyType,
    pub operation: BalanceOperation,
    pub amount: Amount,
    pub comment: String,
    pub metadata: Value,
}

impl BalanceUpdate {
    #[must_use]
    pub fn new(
        owner: BalanceOwner,
        currency: &Currency,
        is_test: bool,
        operation: BalanceOperation,
        amount: Amount,
        comment: &str,
    ) -> Self {
        Self {
            owner,
            blockchain: currency.blockchain,
            network_id: currency.network_id(is_test),
            currency_type: currency.currency_type,
            operation,
            amount,
            comment: comment.to_string(),
            metadata: Value::Object(serde_json::Map::new()),
        }
    }

    #[must_use]
    pub fn with_metadata(mut self, metadata: Value) -> Self {
        self.metadata = metadata;
        self
    }
}

/// A ledger transaction row.
///
/// `amount` is what was promised, `fact_amount` is what the chain actually
/// delivered. `network_fee` is always denominated in the blockchain's
/// native coin.
#[derive(Debug, Clone, PartialEq)]
pub struct Transaction {
    pub id: i64,
    pub uuid: Uuid,
    pub transaction_type: TransactionType,
    pub status: TransactionStatus,
    /// External payment id, zero for system transactions
    pub entity_id: i64,
    pub merchant_id: i64,
    pub sender_wallet_id: Option<i64>,
    pub recipient_wallet_id: Option<i64>,
    pub sender_address: Option<String>,
    pub recipient_address: Option<String>,
    pub blockchain: Blockchain,
    pub network_id: i64,
    pub currency_type: CurrencyType,
    pub amount: Amount,
    pub fact_amount: Option<Amount>,
    pub service_fee: Amount,
    pub network_fee: Option<Amount>,
    pub usd_amount: Amount,
    pub hash: Option<String>,
    pub is_test: bool,
    pub metadata: Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Transaction {
    #[must_use]
    pub fn ticker(&self) -> &str {
        self.amount.ticker()
    }

    #[must_use]
    pub fn resolve_currency(&self) -> Option<&'static Currency> {
        currency::find(self.blockchain, self.amount.ticker())
    }

    /// The currency network fees are charged in.
    #[must_use]
    pub fn network_currency(&self) -> &'static Currency {
        currency::native_coin(self.blockchain)
    }
}

/// Payload for creating a transaction row
#[derive(Debug, Clone, PartialEq)]
pub struct NewTransaction {
    pub transaction_type: TransactionType,
    pub status: TransactionStatus,
    pub entity_id: i64,
    pub merchant_id: i64,
    pub sender_wallet_id: Option<i64>,
    pub recipient_wallet_id: Option<i64>,
    pub sender_address: Option<String>,
    pub recipient_address: Option<String>,
    pub blockchain: Blockchain,
    pub network_id: i64,
    pub currency_type: CurrencyType,
    pub amount: Amount,
    pub fact_amount: Option<Amount>,
    pub service_fee: Amount,
    pub network_fee: Option<Amount>,
    pub usd_amount: Amount,
    pub hash: Option<String>,
    pub is_test: bool,
    pub metadata: Value,
}

/// Fields set when a pending transaction is first observed on chain
#[derive(Debug, Clone, PartialEq)]
pub struct ReceiveUpdate {
    pub status: TransactionStatus,
    pub sender_address: String,
    pub hash: String,
    pub fact_amount: Amount,
    pub metadata: Value,
}

/// Fields set when a transaction reaches a confirmed outcome
#[derive(Debug, Clone, PartialEq)]
pub struct ConfirmUpdate {
    pub status: TransactionStatus,
    pub fact_amount: Amount,
    pub network_fee: Option<Amount>,
    /// Invalid completions forfeit the service fee along with the credit.
    pub zero_service_fee: bool,
}

/// Fields set when a transaction is cancelled or failed
#[derive(Debug, Clone, PartialEq)]
pub struct CancelUpdate {
    pub status: TransactionStatus,
    pub reason: String,
    pub network_fee: Option<Amount>,
}

/// Outcome of a confirmed transaction as reported by the blockchain gateway
#[derive(Debug, Clone, PartialEq)]
pub struct TransactionReceipt {
    pub blockchain: Blockchain,
    pub is_test: bool,
    pub sender: String,
    pub recipient: String,
    pub hash: String,
    pub nonce: i64,
    pub network_fee: Amount,
    pub success: bool,
    pub confirmations: u64,
    pub is_confirmed: bool,
}

/// Aggregated outcome of a batch processing pass
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TransferResult {
    pub created_transaction_ids: Vec<i64>,
    pub rolled_back_transaction_ids: Vec<i64>,
    pub errors: Vec<String>,
}

impl TransferResult {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_created(&mut self, transaction_id: i64) {
        self.created_transaction_ids.push(transaction_id);
    }

    pub fn record_rollback(&mut self, transaction_id: i64) {
        self.rolled_back_transaction_ids.push(transaction_id);
    }

    pub fn record_error(&mut self, error: impl Into<String>) {
        self.errors.push(error.into());
    }

    pub fn merge(&mut self, other: TransferResult) {
        self.created_transaction_ids
            .extend(other.created_transaction_ids);
        self.rolled_back_transaction_ids
            .extend(other.rolled_back_transaction_ids);
        self.errors.extend(other.errors);
    }

    #[must_use]
    pub fn total_errors(&self) -> usize {
        self.errors.len()
    }
}

/// Incoming transaction notification from the node gateway.
///
/// `amount` arrives as a decimal string in human units, `asset` is the
/// native ticker for coin transfers and the contract address for tokens.
/// The wallet and network are carried in the delivery URL, not the body.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct NodeWebhook {
    pub subscription_type: String,
    #[serde(rename = "txId")]
    pub tx_id: String,
    pub address: String,
    #[serde(default)]
    pub counter_address: Option<String>,
    pub asset: String,
    pub amount: String,
    pub chain: String,
    #[serde(rename = "type")]
    pub transaction_kind: String,
    #[serde(default)]
    pub mempool: bool,
    #[serde(default)]
    pub block_number: Option<i64>,
}

/// A service-wide float position: wallet holdings minus merchant claims.
///
/// May legitimately go negative when merchants are credited ahead of
/// consolidation; negative positions block topups and withdrawals.
#[derive(Debug, Clone, PartialEq)]
pub struct SystemBalance {
    pub blockchain: Blockchain,
    pub network_id: i64,
    pub currency: String,
    pub currency_type: CurrencyType,
    pub decimals: u32,
    pub amount: Decimal,
}

impl SystemBalance {
    #[must_use]
    pub fn key(&self) -> String {
        format!("{}/{}/{}", self.currency, self.blockchain, self.network_id)
    }

    /// Checks that the float can absorb a claim of `amount`.
    pub fn covers(&self, amount: &Amount) -> Result<(), LedgerError> {
        if self.currency != amount.ticker() {
            return Err(LedgerError::IncompatibleBalance(format!(
                "system balance {} cannot cover {}",
                self.key(),
                amount
            )));
        }
        if self.amount < amount.value() {
            return Err(LedgerError::InsufficientFunds {
                owner_type: BalanceOwnerType::Wallet,
                ticker: self.currency.clone(),
                available: self.amount.to_string(),
                required: amount.value().to_string(),
            });
        }
        Ok(())
    }
}

/// Domain events published after state transitions
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum Event {
    PaymentStatusChanged {
        payment_id: i64,
        merchant_id: i64,
        status: String,
    },
    WithdrawalCreated {
        payment_id: i64,
        transaction_id: i64,
    },
}

impl Event {
    #[must_use]
    pub fn topic(&self) -> &'static str {
        match self {
            Event::PaymentStatusChanged { .. } => "payment.status_changed",
            Event::WithdrawalCreated { .. } => "withdrawal.created",
        }
    }
}

/// A withdrawal order pulled from the payments service
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct WithdrawalOrder {
    pub payment_id: i64,
    pub merchant_id: i64,
    pub balance_id: i64,
    pub recipient_address: String,
    pub amount: Decimal,
}

/// Request to provision an inbound wallet for a payment.
///
/// `price` is the fiat price of the payment; the crypto amount is quoted
/// from it at provisioning time.
#[derive(Debug, Clone, PartialEq)]
pub struct PaymentMethodOrder {
    pub payment_id: i64,
    pub merchant_id: i64,
    pub blockchain: Blockchain,
    pub ticker: String,
    pub price: Amount,
    pub is_test: bool,
}

/// A wallet freshly created by the signing service
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct CreatedWallet {
    pub uuid: Uuid,
    pub address: String,
}

/// Everything the signing service needs to produce a raw transaction
#[derive(Debug, Clone, PartialEq)]
pub struct SigningRequest {
    pub wallet_uuid: Uuid,
    pub blockchain: Blockchain,
    pub is_test: bool,
    pub asset_type: CurrencyType,
    pub contract_address: Option<String>,
    pub amount: Amount,
    pub recipient: String,
    pub network_id: i64,
    pub nonce: i64,
    pub fee: FeeEstimate,
}

/// Network fee estimate with chain-specific signing parameters
#[derive(Debug, Clone, PartialEq)]
pub struct FeeEstimate {
    pub blockchain: Blockchain,
    pub is_test: bool,
    /// Worst-case total cost in the native coin
    pub total: Amount,
    pub params: FeeParams,
}

/// Chain-specific fee parameters passed through to the signer
#[derive(Debug, Clone, PartialEq)]
pub enum FeeParams {
    Evm {
        gas_units: u64,
        max_fee_per_gas: u128,
        max_priority_fee_per_gas: u128,
    },
    Tron {
        fee_limit: i64,
    },
}

/// Health status enum
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    /// All systems operational
    Healthy,
    /// Some systems degraded but functional
    Degraded,
    /// Critical systems unavailable
    Unhealthy,
}

/// Health check response
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct HealthResponse {
    /// Overall system status
    pub status: HealthStatus,
    /// Database health status
    pub database: HealthStatus,
    /// Node gateway health status
    pub gateway: HealthStatus,
    /// Current server timestamp
    pub timestamp: DateTime<Utc>,
    /// Application version
    #[schema(example = "0.1.0")]
    pub version: String,
}

impl HealthResponse {
    #[must_use]
    pub fn new(database: HealthStatus, gateway: HealthStatus) -> Self {
        let status = match (&database, &gateway) {
            (HealthStatus::Healthy, HealthStatus::Healthy) => HealthStatus::Healthy,
            (HealthStatus::Unhealthy, _) | (_, HealthStatus::Unhealthy) => HealthStatus::Unhealthy,
            _ => HealthStatus::Degraded,
        };
        Self {
            status,
            database,
            gateway,
            timestamp: Utc::now(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

/// Error response structure
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ErrorResponse {
    /// Error details
    pub error: ErrorDetail,
}

/// Error detail structure
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ErrorDetail {
    /// Error type identifier
    #[schema(example = "validation_error")]
    pub r#type: String,
    /// Human-readable error message
    #[schema(example = "Amount must be greater than 0")]
    pub message: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use std::str::FromStr;

    #[test]
    fn test_transaction_status_display_and_parsing() {
        let statuses = vec![
            (TransactionStatus::Pending, "pending"),
            (TransactionStatus::InProgress, "inProgress"),
            (TransactionStatus::InProgressInvalid, "inProgressInv"),
            (TransactionStatus::Completed, "completed"),
            (TransactionStatus::CompletedInvalid, "completedInv"),
            (TransactionStatus::Cancelled, "canceled"),
            (TransactionStatus::Failed, "failed"),
        ];

        for (status, string) in statuses {
            assert_eq!(status.as_str(), string);
            assert_eq!(status.to_string(), string);
            assert_eq!(TransactionStatus::from_str(string).unwrap(), status);
        }

        assert!(TransactionStatus::from_str("invalid").is_err());
    }

    #[test]
    fn test_transaction_status_finality() {
        assert!(!TransactionStatus::Pending.is_final());
        assert!(!TransactionStatus::InProgress.is_final());
        assert!(!TransactionStatus::InProgressInvalid.is_final());
        assert!(TransactionStatus::Completed.is_final());
        assert!(TransactionStatus::CompletedInvalid.is_final());
        assert!(TransactionStatus::Cancelled.is_final());
        assert!(TransactionStatus::Failed.is_final());
    }

    #[test]
    fn test_transaction_type_display_and_parsing() {
        let types = vec![
            (TransactionType::Incoming, "incoming"),
            (TransactionType::Internal, "internal"),
            (TransactionType::Withdrawal, "withdrawal"),
            (TransactionType::Virtual, "virtual"),
        ];

        for (transaction_type, string) in types {
            assert_eq!(transaction_type.as_str(), string);
            assert_eq!(transaction_type.to_string(), string);
            assert_eq!(TransactionType::from_str(string).unwrap(), transaction_type);
        }

        assert!(TransactionType::from_str("invalid").is_err());
    }

    #[test]
    fn test_owner_and_operation_display_and_parsing() {
        assert_eq!(BalanceOwnerType::from_str("merchant").unwrap(), BalanceOwnerType::Merchant);
        assert_eq!(BalanceOwnerType::from_str("wallet").unwrap(), BalanceOwnerType::Wallet);
        assert_eq!(BalanceOwner::merchant(7).to_string(), "merchant:7");
        assert_eq!(WalletType::from_str("inbound").unwrap(), WalletType::Inbound);
        assert_eq!(WalletType::from_str("outbound").unwrap(), WalletType::Outbound);
        assert_eq!(BalanceOperation::from_str("increment").unwrap(), BalanceOperation::Increment);
        assert_eq!(BalanceOperation::from_str("decrement").unwrap(), BalanceOperation::Decrement);
        assert!(BalanceOwnerType::from_str("system").is_err());
        assert!(BalanceOperation::from_str("set").is_err());
    }

    fn test_balance(amount: Amount) -> Balance {
        Balance {
            id: 1,
            uuid: Uuid::new_v4(),
            owner: BalanceOwner::merchant(42),
            blockchain: Blockchain::Ethereum,
            network_id: 1,
            currency_type: CurrencyType::Coin,
            amount,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn test_balance_covers_multiple_expenses() {
        let balance = test_balance(Amount::crypto("ETH", dec!(1), 18).unwrap());
        let half = Amount::crypto("ETH", dec!(0.5), 18).unwrap();
        let fee = Amount::crypto("ETH", dec!(0.4), 18).unwrap();

        assert!(balance.covers(&[&half]).is_ok());
        assert!(balance.covers(&[&half, &fee]).is_ok());

        let too_much = Amount::crypto("ETH", dec!(0.2), 18).unwrap();
        let err = balance.covers(&[&half, &fee, &too_much]).unwrap_err();
        match err {
            LedgerError::InsufficientFunds {
                owner_type,
                available,
                required,
                ..
            } => {
                assert_eq!(owner_type, BalanceOwnerType::Merchant);
                assert_eq!(available, "1");
                assert_eq!(required, "1.1");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_balance_covers_rejects_foreign_currency() {
        let balance = test_balance(Amount::crypto("ETH", dec!(1), 18).unwrap());
        let usdt = Amount::crypto("USDT", dec!(1), 6).unwrap();
        assert!(matches!(
            balance.covers(&[&usdt]),
            Err(LedgerError::IncompatibleBalance(_))
        ));
    }

    #[test]
    fn test_node_webhook_deserialization() {
        let payload = serde_json::json!({
            "subscriptionType": "ADDRESS_TRANSACTION",
            "txId": "0xabc123",
            "address": "0xRecipient",
            "counterAddress": "0xSender",
            "asset": "ETH",
            "amount": "0.5",
            "chain": "ethereum",
            "type": "native",
            "mempool": false,
            "blockNumber": 19000000
        });

        let webhook: NodeWebhook = serde_json::from_value(payload).unwrap();
        assert_eq!(webhook.tx_id, "0xabc123");
        assert_eq!(webhook.amount, "0.5");
        assert_eq!(webhook.chain, "ethereum");
        assert_eq!(webhook.counter_address.as_deref(), Some("0xSender"));
        assert!(!webhook.mempool);
    }

    #[test]
    fn test_transfer_result_merge() {
        let mut result = TransferResult::new();
        result.record_created(1);
        result.record_error("first failure");

        let mut other = TransferResult::new();
        other.record_created(2);
        other.record_rollback(2);
        other.record_error("second failure");

        result.merge(other);
        assert_eq!(result.created_transaction_ids, vec![1, 2]);
        assert_eq!(result.rolled_back_transaction_ids, vec![2]);
        assert_eq!(result.total_errors(), 2);
    }

    #[test]
    fn test_system_balance_covers() {
        let float = SystemBalance {
            blockchain: Blockchain::Tron,
            network_id: 728126428,
            currency: "TRX".to_string(),
            currency_type: CurrencyType::Coin,
            decimals: 6,
            amount: dec!(100),
        };

        let claim = Amount::crypto("TRX", dec!(60), 6).unwrap();
        assert!(float.covers(&claim).is_ok());

        let too_much = Amount::crypto("TRX", dec!(100.000001), 6).unwrap();
        assert!(matches!(
            float.covers(&too_much),
            Err(LedgerError::InsufficientFunds { .. })
        ));

        let wrong_ticker = Amount::crypto("USDT", dec!(1), 6).unwrap();
        assert!(matches!(
            float.covers(&wrong_ticker),
            Err(LedgerError::IncompatibleBalance(_))
        ));
    }

    #[test]
    fn test_event_topics() {
        let event = Event::PaymentStatusChanged {
            payment_id: 1,
            merchant_id: 2,
            status: "succeeded".to_string(),
        };
        assert_eq!(event.topic(), "payment.status_changed");

        let event = Event::WithdrawalCreated {
            payment_id: 1,
            transaction_id: 9,
        };
        assert_eq!(event.topic(), "withdrawal.created");
    }

    #[test]
    fn test_system_balance_key() {
        let position = SystemBalance {
            blockchain: Blockchain::Tron,
            network_id: 728126428,
            currency: "USDT".to_string(),
            currency_type: CurrencyType::Token,
            decimals: 6,
            amount: dec!(-3.5),
        };
        assert_eq!(position.key(), "USDT/TRON/728126428");
    }
}
