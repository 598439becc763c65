//! Payments service client.
//!
//! The payments service owns the merchant-facing payment records. This engine
//! settles funds and reports the resulting status transitions back to it.
//! When no service is configured the client runs in mock mode and only logs,
//! which keeps local development working without the full platform.

use async_trait::async_trait;
use reqwest::Client;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use serde_json::json;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;
use tracing::{debug, error, instrument, warn};

use crate::domain::{Amount, AppError, ExternalServiceError, PaymentGateway, WithdrawalOrder};

/// Payments service connection settings
#[derive(Debug, Clone)]
pub struct PaymentsConfig {
    pub base_url: String,
    pub api_key: Option<SecretString>,
}

/// HTTP client for the payments service
pub struct PaymentsClient {
    http_client: Client,
    config: Option<PaymentsConfig>,
    /// Ids handed out for topup payments in mock mode
    mock_topup_id: AtomicI64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ExpiredPaymentsResponse {
    payment_ids: Vec<i64>,
}

#[derive(Debug, Deserialize)]
struct CreatedPaymentResponse {
    id: i64,
}

impl PaymentsClient {
    pub fn new(config: Option<PaymentsConfig>) -> Result<Self, AppError> {
        if config.is_none() {
            warn!("No payments service configured, using mock responses (MOCK MODE)");
        }

        let http_client = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| {
                AppError::ExternalService(ExternalServiceError::Configuration(e.to_string()))
            })?;

        Ok(Self {
            http_client,
            config: config.map(|c| PaymentsConfig {
                base_url: c.base_url.trim_end_matches('/').to_string(),
                ..c
            }),
            mock_topup_id: AtomicI64::new(1),
        })
    }

    fn authorized(
        &self,
        config: &PaymentsConfig,
        builder: reqwest::RequestBuilder,
    ) -> reqwest::RequestBuilder {
        match &config.api_key {
            Some(key) => builder.header("X-Api-Key", key.expose_secret()),
            None => builder,
        }
    }

    async fn check(&self, response: reqwest::Response) -> Result<reqwest::Response, AppError> {
        if response.status().is_success() {
            return Ok(response);
        }
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        error!(status = %status, body = %body, "Payments service returned error");
        Err(AppError::ExternalService(ExternalServiceError::ApiError {
            status_code: status.as_u16(),
            message: body,
        }))
    }

    async fn transition(
        &self,
        payment_id: i64,
        action: &str,
        body: Option<serde_json::Value>,
    ) -> Result<(), AppError> {
        let Some(config) = &self.config else {
            debug!(payment_id, action, "Mock payment transition");
            return Ok(());
        };

        let url = format!("{}/v1/payments/{payment_id}/{action}", config.base_url);
        debug!(url = %url, "Reporting payment transition");

        let mut request = self.authorized(config, self.http_client.post(&url));
        if let Some(body) = body {
            request = request.json(&body);
        }
        let response = request.send().await.map_err(|e| {
            error!(error = %e, payment_id, action, "Payment transition request failed");
            AppError::ExternalService(ExternalServiceError::Network(e.to_string()))
        })?;
        self.check(response).await?;
        Ok(())
    }
}

#[async_trait]
impl PaymentGateway for PaymentsClient {
    #[instrument(skip(self))]
    async fn list_pending_withdrawals(&self, limit: i64) -> Result<Vec<WithdrawalOrder>, AppError> {
        let Some(config) = &self.config else {
            return Ok(Vec::new());
        };

        let url = format!("{}/v1/withdrawals", config.base_url);
        debug!(url = %url, limit, "Fetching pending withdrawals");

        let response = self
            .authorized(config, self.http_client.get(&url))
            .query(&[("status", "pending"), ("limit", &limit.to_string())])
            .send()
            .await
            .map_err(|e| {
                error!(error = %e, "Withdrawal list request failed");
                AppError::ExternalService(ExternalServiceError::Network(e.to_string()))
            })?;
        let response = self.check(response).await?;

        response.json().await.map_err(|e| {
            AppError::ExternalService(ExternalServiceError::ParseError(e.to_string()))
        })
    }

    #[instrument(skip(self))]
    async fn list_expired_payments(&self, limit: i64) -> Result<Vec<i64>, AppError> {
        let Some(config) = &self.config else {
            return Ok(Vec::new());
        };

        let url = format!("{}/v1/payments/expired", config.base_url);
        debug!(url = %url, limit, "Fetching expired payments");

        let response = self
            .authorized(config, self.http_client.get(&url))
            .query(&[("limit", limit)])
            .send()
            .await
            .map_err(|e| {
                error!(error = %e, "Expired payment list request failed");
                AppError::ExternalService(ExternalServiceError::Network(e.to_string()))
            })?;
        let response = self.check(response).await?;

        let parsed: ExpiredPaymentsResponse = response.json().await.map_err(|e| {
            AppError::ExternalService(ExternalServiceError::ParseError(e.to_string()))
        })?;
        Ok(parsed.payment_ids)
    }

    #[instrument(skip(self, amount, usd_amount), fields(amount = %amount))]
    async fn create_topup_payment(
        &self,
        merchant_id: i64,
        amount: &Amount,
        usd_amount: &Amount,
    ) -> Result<i64, AppError> {
        let Some(config) = &self.config else {
            let id = self.mock_topup_id.fetch_add(1, Ordering::Relaxed);
            debug!(merchant_id, payment_id = id, "Mock topup payment created");
            return Ok(id);
        };

        let url = format!("{}/v1/payments/topups", config.base_url);
        let body = json!({
            "merchantId": merchant_id,
            "ticker": amount.ticker(),
            "amount": amount.value(),
            "usdAmount": usd_amount.value(),
        });
        debug!(url = %url, merchant_id, "Creating topup payment");

        let response = self
            .authorized(config, self.http_client.post(&url))
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                error!(error = %e, "Topup payment request failed");
                AppError::ExternalService(ExternalServiceError::Network(e.to_string()))
            })?;
        let response = self.check(response).await?;

        let created: CreatedPaymentResponse = response.json().await.map_err(|e| {
            AppError::ExternalService(ExternalServiceError::ParseError(e.to_string()))
        })?;
        Ok(created.id)
    }

    #[instrument(skip(self))]
    async fn mark_in_progress(&self, payment_id: i64) -> Result<(), AppError> {
        self.transition(payment_id, "in-progress", None).await
    }

    #[instrument(skip(self))]
    async fn mark_succeeded(&self, payment_id: i64) -> Result<(), AppError> {
        self.transition(payment_id, "succeeded", None).await
    }

    #[instrument(skip(self))]
    async fn mark_failed(&self, payment_id: i64, reason: &str) -> Result<(), AppError> {
        self.transition(payment_id, "failed", Some(json!({ "reason": reason })))
            .await
    }

    #[instrument(skip(self))]
    async fn mark_expired(&self, payment_id: i64) -> Result<(), AppError> {
        self.transition(payment_id, "expired", None).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[tokio::test]
    async fn test_mock_mode_returns_empty_work_lists() {
        let client = PaymentsClient::new(None).unwrap();
        assert!(client.list_pending_withdrawals(10).await.unwrap().is_empty());
        assert!(client.list_expired_payments(10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_mock_mode_hands_out_distinct_topup_ids() {
        let client = PaymentsClient::new(None).unwrap();
        let amount = Amount::crypto("TRX", dec!(100), 6).unwrap();
        let usd = Amount::usd(dec!(12)).unwrap();

        let first = client.create_topup_payment(7, &amount, &usd).await.unwrap();
        let second = client.create_topup_payment(7, &amount, &usd).await.unwrap();
        assert!(first >= 1);
        assert_eq!(second, first + 1);
    }

    #[tokio::test]
    async fn test_mock_mode_accepts_transitions() {
        let client = PaymentsClient::new(None).unwrap();
        client.mark_in_progress(1).await.unwrap();
        client.mark_succeeded(1).await.unwrap();
        client.mark_failed(1, "insufficient merchant balance").await.unwrap();
        client.mark_expired(1).await.unwrap();
    }
}
