//! Application state management.

use std::sync::Arc;

use secrecy::SecretString;

use crate::domain::HealthProbe;

use super::ledger::Ledger;
use super::processing::Processing;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub processing: Arc<Processing>,
    pub ledger: Arc<Ledger>,
    pub database: Arc<dyn HealthProbe>,
    pub gateway: Arc<dyn HealthProbe>,
    /// Shared secret authenticating node gateway webhooks (optional)
    pub webhook_secret: Option<SecretString>,
}

impl AppState {
    /// Create a new application state
    #[must_use]
    pub fn new(
        processing: Arc<Processing>,
        ledger: Arc<Ledger>,
        database: Arc<dyn HealthProbe>,
        gateway: Arc<dyn HealthProbe>,
    ) -> Self {
        Self {
            processing,
            ledger,
            database,
            gateway,
            webhook_secret: None,
        }
    }

    /// Set the shared webhook secret (builder pattern)
    #[must_use]
    pub fn with_webhook_secret(mut self, secret: Option<SecretString>) -> Self {
        self.webhook_secret = secret;
        self
    }
}
