//! The API layer, containing web handlers and routing.

pub mod admin;
pub mod handlers;
pub mod router;

pub use admin::{
    CreateTopupRequest, SystemBalanceResponse, SystemBalancesResponse, TopupResponse,
    create_topup_handler, system_balances_handler,
};
pub use handlers::ApiDoc;
pub use router::create_router;
