//! Blockchain-facing clients.
//!
//! This module talks to the chains through two services: the node gateway
//! (broadcasting, receipts, gas prices, address subscriptions) and the rates
//! service (fiat conversion).

pub mod gateway;
pub mod rates;

// Re-export main types
pub use gateway::{NodeGatewayClient, NodeGatewayConfig};
pub use rates::{RatesClient, RatesConfig};
