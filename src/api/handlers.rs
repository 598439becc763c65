//! HTTP request handlers with OpenAPI documentation.

use std::sync::Arc;

use axum::{
    Json,
    body::Bytes,
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
};
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use hmac::{Hmac, Mac};
use secrecy::{ExposeSecret, SecretString};
use sha2::Sha512;
use tracing::{error, info};
use utoipa::OpenApi;
use uuid::Uuid;

use crate::app::AppState;
use crate::domain::{
    AppError, BlockchainError, DatabaseError, ErrorDetail, ErrorResponse, ExternalServiceError,
    HealthProbe, HealthResponse, HealthStatus, LedgerError, NodeWebhook, SigningError,
    TransactionError, ValidationError, WalletError,
};

use super::admin::{CreateTopupRequest, SystemBalanceResponse, SystemBalancesResponse, TopupResponse};

/// Webhook signature header set by the node gateway
const PAYLOAD_HASH_HEADER: &str = "x-payload-hash";

/// OpenAPI documentation structure
#[derive(OpenApi)]
#[openapi(
    info(
        title = "Settlement Engine API",
        version = "0.1.0",
        description = "Crypto payment settlement engine: deposit webhooks, merchant topups and float reporting",
        contact(
            name = "API Support",
            email = "support@example.com"
        ),
        license(
            name = "MIT"
        )
    ),
    paths(
        health_check_handler,
        liveness_handler,
        readiness_handler,
        super::admin::create_topup_handler,
        super::admin::system_balances_handler,
    ),
    components(
        schemas(
            HealthResponse,
            HealthStatus,
            ErrorResponse,
            ErrorDetail,
            CreateTopupRequest,
            TopupResponse,
            SystemBalanceResponse,
            SystemBalancesResponse,
        )
    ),
    tags(
        (name = "health", description = "Health check endpoints"),
        (name = "admin", description = "Operator endpoints for topups and float reporting")
    )
)]
pub struct ApiDoc;

/// Handle a deposit notification from the node gateway
///
/// The wallet UUID and network id are carried in the path; the body is the
/// raw webhook payload. When a webhook secret is configured, the
/// `x-payload-hash` header must carry the Base64 HMAC-SHA512 of the body.
pub async fn node_webhook_handler(
    State(state): State<Arc<AppState>>,
    Path((wallet_uuid, network_id)): Path<(Uuid, i64)>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<StatusCode, AppError> {
    if let Some(secret) = &state.webhook_secret {
        verify_webhook_signature(secret, &headers, &body)?;
    }

    let webhook: NodeWebhook = serde_json::from_slice(&body).map_err(|e| {
        AppError::Validation(ValidationError::InvalidField {
            field: "body".to_string(),
            message: format!("malformed webhook payload: {e}"),
        })
    })?;

    let tx_id = webhook.tx_id.clone();
    state
        .processing
        .process_webhook(wallet_uuid, network_id, webhook)
        .await?;

    info!(%wallet_uuid, network_id, tx_id = %tx_id, "Webhook processed");
    Ok(StatusCode::NO_CONTENT)
}

fn verify_webhook_signature(
    secret: &SecretString,
    headers: &HeaderMap,
    body: &[u8],
) -> Result<(), AppError> {
    let provided = headers
        .get(PAYLOAD_HASH_HEADER)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| {
            AppError::Authentication(format!("Missing {PAYLOAD_HASH_HEADER} header"))
        })?;
    let digest = BASE64_STANDARD
        .decode(provided)
        .map_err(|_| AppError::Authentication("Malformed webhook signature".to_string()))?;

    let mut mac = Hmac::<Sha512>::new_from_slice(secret.expose_secret().as_bytes())
        .map_err(|e| AppError::Internal(format!("webhook secret unusable: {e}")))?;
    mac.update(body);
    mac.verify_slice(&digest)
        .map_err(|_| AppError::Authentication("Invalid webhook signature".to_string()))
}

/// Detailed health check
#[utoipa::path(
    get,
    path = "/health",
    tag = "health",
    responses(
        (status = 200, description = "Health status", body = HealthResponse)
    )
)]
pub async fn health_check_handler(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    Json(check_health(&state).await)
}

/// Kubernetes liveness probe
#[utoipa::path(
    get,
    path = "/health/live",
    tag = "health",
    responses(
        (status = 200, description = "Application is alive")
    )
)]
pub async fn liveness_handler() -> StatusCode {
    StatusCode::OK
}

/// Kubernetes readiness probe
#[utoipa::path(
    get,
    path = "/health/ready",
    tag = "health",
    responses(
        (status = 200, description = "Application is ready to serve traffic"),
        (status = 503, description = "Application is not ready")
    )
)]
pub async fn readiness_handler(State(state): State<Arc<AppState>>) -> StatusCode {
    let health = check_health(&state).await;
    match health.status {
        HealthStatus::Healthy | HealthStatus::Degraded => StatusCode::OK,
        HealthStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
    }
}

async fn check_health(state: &AppState) -> HealthResponse {
    let (database, gateway) = tokio::join!(
        probe_status(&state.database),
        probe_status(&state.gateway)
    );
    HealthResponse::new(database, gateway)
}

async fn probe_status(probe: &Arc<dyn HealthProbe>) -> HealthStatus {
    match probe.health_check().await {
        Ok(()) => HealthStatus::Healthy,
        Err(_) => HealthStatus::Unhealthy,
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> axum::response::Response {
        let (status, error_type, message) = match &self {
            AppError::Database(db_err) => match db_err {
                DatabaseError::Connection(_) => (
                    StatusCode::SERVICE_UNAVAILABLE,
                    "database_error",
                    self.to_string(),
                ),
                DatabaseError::NotFound(_) => {
                    (StatusCode::NOT_FOUND, "not_found", self.to_string())
                }
                DatabaseError::Duplicate(_) => {
                    (StatusCode::CONFLICT, "duplicate", self.to_string())
                }
                DatabaseError::Query(_) | DatabaseError::Migration(_) => (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "database_error",
                    self.to_string(),
                ),
            },
            AppError::Money(_) => (
                StatusCode::BAD_REQUEST,
                "money_error",
                self.to_string(),
            ),
            AppError::Ledger(ledger_err) => match ledger_err {
                LedgerError::InsufficientFunds { .. } => (
                    StatusCode::PAYMENT_REQUIRED,
                    "insufficient_funds",
                    self.to_string(),
                ),
                LedgerError::BalanceNotFound(_) => {
                    (StatusCode::NOT_FOUND, "not_found", self.to_string())
                }
                LedgerError::IncompatibleBalance(_) => (
                    StatusCode::BAD_REQUEST,
                    "ledger_error",
                    self.to_string(),
                ),
                LedgerError::OrphanMerchantBalance(_) => (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "ledger_error",
                    self.to_string(),
                ),
            },
            AppError::Wallet(wallet_err) => match wallet_err {
                WalletError::NotFound(_) | WalletError::NoOutboundWallet(_) => {
                    (StatusCode::NOT_FOUND, "not_found", self.to_string())
                }
                WalletError::AlreadyLocked { .. } => {
                    (StatusCode::CONFLICT, "wallet_locked", self.to_string())
                }
                WalletError::LockNotFound { .. } | WalletError::NoPendingTransactions(_) => (
                    StatusCode::CONFLICT,
                    "wallet_error",
                    self.to_string(),
                ),
            },
            AppError::Transaction(tx_err) => match tx_err {
                TransactionError::NotFound(_) => {
                    (StatusCode::NOT_FOUND, "not_found", self.to_string())
                }
                TransactionError::DuplicateHash { .. } => {
                    (StatusCode::CONFLICT, "duplicate", self.to_string())
                }
                TransactionError::SameStatus { .. }
                | TransactionError::Terminal { .. }
                | TransactionError::InvalidTransition { .. } => (
                    StatusCode::CONFLICT,
                    "transaction_conflict",
                    self.to_string(),
                ),
                TransactionError::MissingFactAmount(_)
                | TransactionError::InvalidCreation(_) => (
                    StatusCode::BAD_REQUEST,
                    "transaction_error",
                    self.to_string(),
                ),
            },
            AppError::Signing(signing_err) => match signing_err {
                SigningError::Unavailable(_) => (
                    StatusCode::SERVICE_UNAVAILABLE,
                    "signing_error",
                    self.to_string(),
                ),
                SigningError::Rejected(_) | SigningError::UnsupportedBlockchain(_) => (
                    StatusCode::BAD_REQUEST,
                    "signing_error",
                    self.to_string(),
                ),
            },
            AppError::Blockchain(bc_err) => match bc_err {
                BlockchainError::Connection(_) => (
                    StatusCode::SERVICE_UNAVAILABLE,
                    "blockchain_error",
                    self.to_string(),
                ),
                BlockchainError::InsufficientFunds(_) => (
                    StatusCode::PAYMENT_REQUIRED,
                    "insufficient_funds",
                    self.to_string(),
                ),
                BlockchainError::ReceiptNotFound(_) => {
                    (StatusCode::NOT_FOUND, "not_found", self.to_string())
                }
                BlockchainError::BroadcastRejected(_) | BlockchainError::UnsupportedAsset(_) => (
                    StatusCode::BAD_REQUEST,
                    "blockchain_error",
                    self.to_string(),
                ),
            },
            AppError::ExternalService(ext_err) => match ext_err {
                ExternalServiceError::Timeout(_) => {
                    (StatusCode::GATEWAY_TIMEOUT, "timeout", self.to_string())
                }
                ExternalServiceError::Network(_)
                | ExternalServiceError::ApiError { .. }
                | ExternalServiceError::ParseError(_)
                | ExternalServiceError::Configuration(_)
                | ExternalServiceError::Unavailable(_) => (
                    StatusCode::BAD_GATEWAY,
                    "external_service_error",
                    self.to_string(),
                ),
            },
            AppError::Validation(_) => (
                StatusCode::BAD_REQUEST,
                "validation_error",
                self.to_string(),
            ),
            AppError::Config(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "configuration_error",
                self.to_string(),
            ),
            AppError::Authentication(_) => (
                StatusCode::UNAUTHORIZED,
                "authentication_error",
                self.to_string(),
            ),
            AppError::Internal(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "internal_error",
                self.to_string(),
            ),
        };

        if status.is_server_error() {
            error!(error_type = %error_type, message = %message, "Server error");
        }

        let body = Json(ErrorResponse {
            error: ErrorDetail {
                r#type: error_type.to_string(),
                message,
            },
        });

        (status, body).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn signature_for(secret: &str, body: &[u8]) -> String {
        let mut mac = Hmac::<Sha512>::new_from_slice(secret.as_bytes()).unwrap();
        mac.update(body);
        BASE64_STANDARD.encode(mac.finalize().into_bytes())
    }

    #[test]
    fn test_webhook_signature_round_trip() {
        let secret = SecretString::from("topsecret");
        let body = br#"{"txId":"0xabc"}"#;

        let mut headers = HeaderMap::new();
        headers.insert(
            PAYLOAD_HASH_HEADER,
            signature_for("topsecret", body).parse().unwrap(),
        );
        assert!(verify_webhook_signature(&secret, &headers, body).is_ok());
    }

    #[test]
    fn test_webhook_signature_rejects_tampered_body_and_wrong_key() {
        let secret = SecretString::from("topsecret");
        let body = br#"{"txId":"0xabc"}"#;

        let mut headers = HeaderMap::new();
        headers.insert(
            PAYLOAD_HASH_HEADER,
            signature_for("topsecret", body).parse().unwrap(),
        );
        assert!(verify_webhook_signature(&secret, &headers, b"{}").is_err());

        let mut headers = HeaderMap::new();
        headers.insert(
            PAYLOAD_HASH_HEADER,
            signature_for("other-key", body).parse().unwrap(),
        );
        assert!(verify_webhook_signature(&secret, &headers, body).is_err());
    }

    #[test]
    fn test_webhook_signature_requires_header() {
        let secret = SecretString::from("topsecret");
        let headers = HeaderMap::new();
        let result = verify_webhook_signature(&secret, &headers, b"{}");
        assert!(matches!(result, Err(AppError::Authentication(_))));
    }

    #[test]
    fn test_error_status_mapping() {
        let not_found = AppError::Transaction(TransactionError::NotFound(9)).into_response();
        assert_eq!(not_found.status(), StatusCode::NOT_FOUND);

        let conflict = AppError::Wallet(WalletError::AlreadyLocked {
            wallet_id: 1,
            currency: "ETH".to_string(),
            network_id: 1,
        })
        .into_response();
        assert_eq!(conflict.status(), StatusCode::CONFLICT);

        let unauthorized = AppError::Authentication("bad secret".to_string()).into_response();
        assert_eq!(unauthorized.status(), StatusCode::UNAUTHORIZED);

        let underfunded = AppError::Ledger(LedgerError::InsufficientFunds {
            owner_type: crate::domain::BalanceOwnerType::Merchant,
            ticker: "ETH".to_string(),
            available: "0".to_string(),
            required: "1".to_string(),
        })
        .into_response();
        assert_eq!(underfunded.status(), StatusCode::PAYMENT_REQUIRED);
    }
}
