//! Crypto payment settlement engine.
//!
//! Detects merchant deposits through node gateway webhooks, consolidates
//! funds onto outbound wallets, executes merchant withdrawals and keeps a
//! double-entry style balance ledger with a full audit trail.
//!
//! The crate is layered: [`domain`] holds the core types and port traits,
//! [`app`] the settlement workflows, [`infra`] the Postgres store and HTTP
//! clients, and [`api`] the axum surface.

pub mod api;
pub mod app;
pub mod domain;
pub mod infra;

#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;
