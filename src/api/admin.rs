//! Admin API handlers for merchant topups and float reporting.
//!
//! Operator-facing endpoints; deploy behind network-level access control.

use std::str::FromStr;
use std::sync::Arc;

use axum::{
    Json,
    extract::State,
};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::warn;
use utoipa::ToSchema;
use uuid::Uuid;
use validator::Validate;

use crate::app::AppState;
use crate::domain::{AppError, Blockchain, SystemBalance, ValidationError};

/// Request body for crediting a merchant from the system float
#[derive(Debug, Deserialize, Serialize, ToSchema, Validate)]
pub struct CreateTopupRequest {
    /// Merchant to credit
    #[validate(range(min = 1, message = "merchant_id must be positive"))]
    #[schema(example = 42)]
    pub merchant_id: i64,
    /// Blockchain the currency lives on (ETH, MATIC, BSC or TRON)
    #[validate(length(min = 1, message = "blockchain must not be empty"))]
    #[schema(example = "ETH")]
    pub blockchain: String,
    /// Currency ticker
    #[validate(length(min = 1, message = "ticker must not be empty"))]
    #[schema(example = "USDT")]
    pub ticker: String,
    /// Amount in currency units
    #[schema(value_type = String, example = "125.50")]
    pub amount: Decimal,
    /// Whether to credit the test-network balance
    #[serde(default)]
    pub is_test: bool,
}

/// Response for a completed topup
#[derive(Debug, Serialize, ToSchema)]
pub struct TopupResponse {
    /// Internal transaction id
    pub transaction_id: i64,
    /// Public transaction identifier
    pub transaction_uuid: Uuid,
    /// Final transaction status
    #[schema(example = "completed")]
    pub status: String,
    /// Credited amount in currency units
    #[schema(example = "125.50")]
    pub amount: String,
    /// Credited amount in USD
    #[schema(example = "125.48")]
    pub usd_amount: String,
    /// Whether the test-network balance was credited
    pub is_test: bool,
}

/// A single float position for one currency on one network
#[derive(Debug, Serialize, ToSchema)]
pub struct SystemBalanceResponse {
    /// Blockchain identifier
    #[schema(example = "ETH")]
    pub blockchain: String,
    /// Network id the position was aggregated on
    pub network_id: i64,
    /// Currency ticker
    #[schema(example = "USDT")]
    pub currency: String,
    /// Whether the currency is a native coin or a token
    #[schema(example = "token")]
    pub currency_type: String,
    /// Decimal places of the currency
    pub decimals: u32,
    /// Wallet holdings minus merchant claims, in currency units
    #[schema(example = "1042.337")]
    pub amount: String,
}

impl From<SystemBalance> for SystemBalanceResponse {
    fn from(position: SystemBalance) -> Self {
        Self {
            blockchain: position.blockchain.to_string(),
            network_id: position.network_id,
            currency: position.currency,
            currency_type: position.currency_type.as_str().to_string(),
            decimals: position.decimals,
            amount: position.amount.to_string(),
        }
    }
}

/// Response for listing all float positions
#[derive(Debug, Serialize, ToSchema)]
pub struct SystemBalancesResponse {
    /// Total count of positions
    pub count: usize,
    /// One entry per currency and network
    pub balances: Vec<SystemBalanceResponse>,
}

/// Credit a merchant balance from the system float
///
/// POST /admin/topups
#[utoipa::path(
    post,
    path = "/admin/topups",
    tag = "admin",
    request_body = CreateTopupRequest,
    responses(
        (status = 200, description = "Merchant credited", body = TopupResponse),
        (status = 400, description = "Invalid request", body = crate::domain::ErrorResponse),
        (status = 402, description = "System float cannot cover the amount", body = crate::domain::ErrorResponse),
    )
)]
pub async fn create_topup_handler(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<CreateTopupRequest>,
) -> Result<Json<TopupResponse>, AppError> {
    payload.validate().map_err(|e| {
        warn!(error = %e, "Topup request failed validation");
        AppError::Validation(ValidationError::Multiple(e.to_string()))
    })?;

    let blockchain = Blockchain::from_str(payload.blockchain.trim()).map_err(|message| {
        AppError::Validation(ValidationError::InvalidField {
            field: "blockchain".to_string(),
            message,
        })
    })?;

    let transaction = state
        .processing
        .create_topup(
            payload.merchant_id,
            blockchain,
            payload.ticker.trim(),
            payload.amount,
            payload.is_test,
        )
        .await?;

    warn!(
        merchant_id = payload.merchant_id,
        transaction_id = transaction.id,
        amount = %payload.amount,
        ticker = %payload.ticker,
        "Admin credited merchant from system float"
    );

    Ok(Json(TopupResponse {
        transaction_id: transaction.id,
        transaction_uuid: transaction.uuid,
        status: transaction.status.as_str().to_string(),
        amount: transaction.amount.value().to_string(),
        usd_amount: transaction.usd_amount.value().to_string(),
        is_test: transaction.is_test,
    }))
}

/// List system float positions across all currencies and networks
///
/// GET /admin/system-balances
#[utoipa::path(
    get,
    path = "/admin/system-balances",
    tag = "admin",
    responses(
        (status = 200, description = "Float positions per currency and network", body = SystemBalancesResponse),
        (status = 503, description = "Database unavailable", body = crate::domain::ErrorResponse),
    )
)]
pub async fn system_balances_handler(
    State(state): State<Arc<AppState>>,
) -> Result<Json<SystemBalancesResponse>, AppError> {
    let balances: Vec<SystemBalanceResponse> = state
        .ledger
        .system_balances()
        .await?
        .into_iter()
        .map(SystemBalanceResponse::from)
        .collect();

    Ok(Json(SystemBalancesResponse {
        count: balances.len(),
        balances,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_topup_request_validation() {
        let valid = CreateTopupRequest {
            merchant_id: 42,
            blockchain: "ETH".to_string(),
            ticker: "USDT".to_string(),
            amount: dec!(125.50),
            is_test: false,
        };
        assert!(valid.validate().is_ok());

        let bad_merchant = CreateTopupRequest {
            merchant_id: 0,
            blockchain: "ETH".to_string(),
            ticker: "USDT".to_string(),
            amount: dec!(125.50),
            is_test: false,
        };
        assert!(bad_merchant.validate().is_err());

        let empty_ticker = CreateTopupRequest {
            merchant_id: 42,
            blockchain: "ETH".to_string(),
            ticker: String::new(),
            amount: dec!(125.50),
            is_test: false,
        };
        assert!(empty_ticker.validate().is_err());
    }

    #[test]
    fn test_system_balance_response_mapping() {
        let position = SystemBalance {
            blockchain: Blockchain::Tron,
            network_id: 728126428,
            currency: "USDT".to_string(),
            currency_type: crate::domain::CurrencyType::Token,
            decimals: 6,
            amount: dec!(-3.5),
        };
        let response = SystemBalanceResponse::from(position);
        assert_eq!(response.blockchain, "TRON");
        assert_eq!(response.currency_type, "token");
        assert_eq!(response.amount, "-3.5");
    }
}
