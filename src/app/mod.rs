//! Application layer containing business logic and shared state.

pub mod ledger;
pub mod processing;
pub mod scheduler;
pub mod state;
pub mod transactions;
pub mod wallets;

pub use ledger::Ledger;
pub use processing::{Processing, ProcessingConfig};
pub use scheduler::{SchedulerConfig, spawn_scheduler};
pub use state::AppState;
pub use transactions::Transactions;
pub use wallets::Wallets;
