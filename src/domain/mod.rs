//! Domain layer containing core business types, traits, and error definitions.

pub mod currency;
pub mod error;
pub mod money;
pub mod traits;
pub mod types;

pub use currency::{Blockchain, Currency, CurrencyType};
pub use error::{
    AppError, BlockchainError, ConfigError, DatabaseError, ExternalServiceError, LedgerError,
    MoneyError, SigningError, TransactionError, ValidationError, WalletError,
};
pub use money::{Amount, AmountKind};
pub use traits::{
    Broadcaster, CurrencyConverter, EventHandler, EventPublisher, FeeCalculator, HealthProbe,
    LedgerStore, PaymentGateway, PaymentGuard, PaymentGuardStore, SigningClient, TransactionStore,
    WalletStore, WalletSubscriber,
};
pub use types::{
    Balance, BalanceOperation, BalanceOwner, BalanceOwnerType, BalanceUpdate, CancelUpdate,
    ConfirmUpdate, CreatedWallet, ErrorDetail, ErrorResponse, Event, FeeEstimate, FeeParams,
    HealthResponse, HealthStatus, LockKey, NewTransaction, NodeWebhook, PaymentMethodOrder,
    ReceiveUpdate, SigningRequest, SystemBalance, Transaction, TransactionReceipt, TransactionStatus,
    TransactionType, TransferResult, Wallet, WalletLock, WalletType, WithdrawalOrder,
    SYSTEM_MERCHANT_ID,
};
