//! Infrastructure layer implementations.

pub mod blockchain;
pub mod database;
pub mod events;
pub mod payments;
pub mod signing;

pub use blockchain::{NodeGatewayClient, NodeGatewayConfig, RatesClient, RatesConfig};
pub use database::{PostgresConfig, PostgresStore};
pub use events::{EventBus, LoggingEventHandler};
pub use payments::{PaymentsClient, PaymentsConfig};
pub use signing::{KmsClient, KmsConfig};
