//! Node gateway client.
//!
//! One HTTP service fronts every blockchain node we use. It broadcasts raw
//! transactions, serves receipts and gas prices, and manages address
//! subscriptions that feed the deposit webhook.

use async_trait::async_trait;
use reqwest::Client;
use rust_decimal::Decimal;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use tracing::{debug, error, instrument};

use crate::domain::{
    Amount, AppError, Blockchain, BlockchainError, Broadcaster, Currency, CurrencyConverter,
    CurrencyType, ExternalServiceError, FeeCalculator, FeeEstimate, FeeParams, HealthProbe,
    TransactionReceipt, Wallet, WalletSubscriber, currency,
};

/// Gas units for a plain EVM coin transfer
const EVM_GAS_UNITS_COIN: u64 = 21_000;
/// Gas units reserved for an ERC-20 style token transfer
const EVM_GAS_UNITS_TOKEN: u64 = 65_000;
/// Tron energy budget for a coin transfer, in sun
const TRON_FEE_LIMIT_COIN: i64 = 350_000;
/// Tron energy budget for a TRC-20 transfer, in sun
const TRON_FEE_LIMIT_TOKEN: i64 = 30_000_000;

/// Node gateway connection settings
#[derive(Debug, Clone)]
pub struct NodeGatewayConfig {
    pub base_url: String,
    pub api_key: Option<SecretString>,
    /// Public URL deposit notifications should be delivered to
    pub callback_url: Option<String>,
}

/// HTTP client for the node gateway
pub struct NodeGatewayClient {
    http_client: Client,
    config: NodeGatewayConfig,
    converter: Arc<dyn CurrencyConverter>,
}

#[derive(Debug, Deserialize)]
struct BroadcastResponse {
    hash: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ReceiptResponse {
    sender: String,
    recipient: String,
    hash: String,
    nonce: i64,
    /// Network fee paid, in smallest native units
    network_fee: String,
    success: bool,
    confirmations: u64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct EvmFeeResponse {
    /// Current base fee per gas, in wei
    base_fee: String,
    /// Suggested priority fee per gas, in wei
    priority_fee: String,
}

#[derive(Debug, Deserialize)]
struct SubscriptionResponse {
    id: String,
}

fn chain_slug(blockchain: Blockchain) -> &'static str {
    match blockchain {
        Blockchain::Ethereum => "eth",
        Blockchain::Polygon => "matic",
        Blockchain::BinanceSmartChain => "bsc",
        Blockchain::Tron => "tron",
    }
}

/// Base fee headroom, in percent. Ethereum base fees move faster between
/// blocks than the sidechains', so it gets the larger cushion.
fn fee_confidence_percent(blockchain: Blockchain) -> u128 {
    match blockchain {
        Blockchain::Ethereum => 115,
        Blockchain::Polygon | Blockchain::BinanceSmartChain => 110,
        Blockchain::Tron => 100,
    }
}

fn evm_gas_units(currency_type: CurrencyType) -> u64 {
    match currency_type {
        CurrencyType::Coin => EVM_GAS_UNITS_COIN,
        CurrencyType::Token => EVM_GAS_UNITS_TOKEN,
    }
}

fn tron_fee_limit(currency_type: CurrencyType) -> i64 {
    match currency_type {
        CurrencyType::Coin => TRON_FEE_LIMIT_COIN,
        CurrencyType::Token => TRON_FEE_LIMIT_TOKEN,
    }
}

fn receipt_from_response(
    response: ReceiptResponse,
    blockchain: Blockchain,
    is_test: bool,
) -> Result<TransactionReceipt, AppError> {
    let native = currency::native_coin(blockchain);
    let network_fee = Amount::from_raw(native.ticker, &response.network_fee, native.decimals)?;
    let is_confirmed = response.confirmations >= blockchain.required_confirmations();

    Ok(TransactionReceipt {
        blockchain,
        is_test,
        sender: response.sender,
        recipient: response.recipient,
        hash: response.hash,
        nonce: response.nonce,
        network_fee,
        success: response.success,
        confirmations: response.confirmations,
        is_confirmed,
    })
}

impl NodeGatewayClient {
    pub fn new(
        config: NodeGatewayConfig,
        converter: Arc<dyn CurrencyConverter>,
    ) -> Result<Self, AppError> {
        let http_client = Client::builder()
            .timeout(std::time::Duration::from_secs(30))
            .build()
            .map_err(|e| {
                AppError::ExternalService(ExternalServiceError::Configuration(e.to_string()))
            })?;

        Ok(Self {
            http_client,
            config: NodeGatewayConfig {
                base_url: config.base_url.trim_end_matches('/').to_string(),
                ..config
            },
            converter,
        })
    }

    fn authorized(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.config.api_key {
            Some(key) => builder.header("X-Api-Key", key.expose_secret()),
            None => builder,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.config.base_url, path)
    }

    async fn fetch_evm_fees(
        &self,
        blockchain: Blockchain,
        is_test: bool,
    ) -> Result<EvmFeeResponse, AppError> {
        let url = self.url(&format!("/v1/{}/fees", chain_slug(blockchain)));
        debug!(url = %url, is_test, "Fetching gas prices");

        let response = self
            .authorized(self.http_client.get(&url))
            .query(&[("isTest", is_test)])
            .send()
            .await
            .map_err(|e| {
                error!(error = %e, "Node gateway fee request failed");
                AppError::Blockchain(BlockchainError::Connection(e.to_string()))
            })?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            error!(status = %status, body = %body, "Node gateway fee request returned error");
            return Err(AppError::Blockchain(BlockchainError::Connection(format!(
                "status {status}: {body}"
            ))));
        }

        response.json().await.map_err(|e| {
            AppError::ExternalService(ExternalServiceError::ParseError(e.to_string()))
        })
    }
}

#[async_trait]
impl Broadcaster for NodeGatewayClient {
    #[instrument(skip(self, raw), fields(blockchain = %blockchain, is_test))]
    async fn broadcast_transaction(
        &self,
        blockchain: Blockchain,
        raw: &str,
        is_test: bool,
    ) -> Result<String, AppError> {
        let url = self.url(&format!("/v1/{}/broadcast", chain_slug(blockchain)));
        let body = json!({ "raw": raw, "isTest": is_test });

        let response = self
            .authorized(self.http_client.post(&url))
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                error!(error = %e, "Broadcast request failed");
                AppError::Blockchain(BlockchainError::Connection(e.to_string()))
            })?;

        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            error!(status = %status, body = %message, "Broadcast rejected");
            if status.is_client_error() && message.to_lowercase().contains("insufficient funds") {
                return Err(AppError::Blockchain(BlockchainError::InsufficientFunds(
                    message,
                )));
            }
            if status.is_client_error() {
                return Err(AppError::Blockchain(BlockchainError::BroadcastRejected(
                    message,
                )));
            }
            return Err(AppError::Blockchain(BlockchainError::Connection(format!(
                "status {status}: {message}"
            ))));
        }

        let broadcast: BroadcastResponse = response.json().await.map_err(|e| {
            AppError::ExternalService(ExternalServiceError::ParseError(e.to_string()))
        })?;
        Ok(broadcast.hash)
    }

    #[instrument(skip(self), fields(blockchain = %blockchain))]
    async fn get_transaction_receipt(
        &self,
        blockchain: Blockchain,
        hash: &str,
        is_test: bool,
    ) -> Result<TransactionReceipt, AppError> {
        let url = self.url(&format!(
            "/v1/{}/transactions/{hash}",
            chain_slug(blockchain)
        ));

        let response = self
            .authorized(self.http_client.get(&url))
            .query(&[("isTest", is_test)])
            .send()
            .await
            .map_err(|e| {
                error!(error = %e, "Receipt request failed");
                AppError::Blockchain(BlockchainError::Connection(e.to_string()))
            })?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(AppError::Blockchain(BlockchainError::ReceiptNotFound(
                hash.to_string(),
            )));
        }
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            error!(status = %status, body = %body, "Receipt request returned error");
            return Err(AppError::Blockchain(BlockchainError::Connection(format!(
                "status {status}: {body}"
            ))));
        }

        let receipt: ReceiptResponse = response.json().await.map_err(|e| {
            AppError::ExternalService(ExternalServiceError::ParseError(e.to_string()))
        })?;
        receipt_from_response(receipt, blockchain, is_test)
    }
}

#[async_trait]
impl FeeCalculator for NodeGatewayClient {
    #[instrument(skip(self, currency), fields(ticker = currency.ticker, blockchain = %currency.blockchain))]
    async fn estimate_fee(
        &self,
        currency: &Currency,
        is_test: bool,
    ) -> Result<FeeEstimate, AppError> {
        let native = currency::native_coin(currency.blockchain);

        if currency.blockchain.is_evm() {
            let fees = self.fetch_evm_fees(currency.blockchain, is_test).await?;
            let base: u128 = fees.base_fee.trim().parse().map_err(|_| {
                AppError::ExternalService(ExternalServiceError::ParseError(format!(
                    "invalid base fee: {}",
                    fees.base_fee
                )))
            })?;
            let priority: u128 = fees.priority_fee.trim().parse().map_err(|_| {
                AppError::ExternalService(ExternalServiceError::ParseError(format!(
                    "invalid priority fee: {}",
                    fees.priority_fee
                )))
            })?;

            let max_fee_per_gas =
                base * fee_confidence_percent(currency.blockchain) / 100 + priority;
            let gas_units = evm_gas_units(currency.currency_type);
            let total_wei = max_fee_per_gas * u128::from(gas_units);
            let total = Amount::from_raw(native.ticker, &total_wei.to_string(), native.decimals)?;

            return Ok(FeeEstimate {
                blockchain: currency.blockchain,
                is_test,
                total,
                params: FeeParams::Evm {
                    gas_units,
                    max_fee_per_gas,
                    max_priority_fee_per_gas: priority,
                },
            });
        }

        let fee_limit = tron_fee_limit(currency.currency_type);
        let total = Amount::from_raw(native.ticker, &fee_limit.to_string(), native.decimals)?;
        Ok(FeeEstimate {
            blockchain: currency.blockchain,
            is_test,
            total,
            params: FeeParams::Tron { fee_limit },
        })
    }

    /// The network cost in USD, floored at one cent, with a 50% markup.
    #[instrument(skip(self, currency), fields(ticker = currency.ticker))]
    async fn withdrawal_fee_usd(
        &self,
        currency: &Currency,
        is_test: bool,
    ) -> Result<Amount, AppError> {
        let estimate = self.estimate_fee(currency, is_test).await?;
        let cost_usd = self.converter.crypto_to_fiat(&estimate.total, "USD").await?;

        let floor = Amount::usd(Decimal::new(1, 2))?;
        let base = match cost_usd.compare(&floor)? {
            std::cmp::Ordering::Less => floor,
            _ => cost_usd,
        };
        Ok(base.mul_decimal(Decimal::new(15, 1))?)
    }
}

#[async_trait]
impl WalletSubscriber for NodeGatewayClient {
    #[instrument(skip(self, wallet), fields(wallet_id = wallet.id, address = %wallet.address))]
    async fn subscribe(&self, wallet: &Wallet, is_test: bool) -> Result<String, AppError> {
        let native = currency::native_coin(wallet.blockchain);
        let url = self.url("/v1/subscriptions");
        let body = json!({
            "address": wallet.address,
            "blockchain": chain_slug(wallet.blockchain),
            "networkId": native.network_id(is_test),
            "url": self.config.callback_url,
        });

        let response = self
            .authorized(self.http_client.post(&url))
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                error!(error = %e, "Subscription request failed");
                AppError::ExternalService(ExternalServiceError::Network(e.to_string()))
            })?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            error!(status = %status, body = %body, "Subscription request returned error");
            return Err(AppError::ExternalService(ExternalServiceError::ApiError {
                status_code: status.as_u16(),
                message: body,
            }));
        }

        let subscription: SubscriptionResponse = response.json().await.map_err(|e| {
            AppError::ExternalService(ExternalServiceError::ParseError(e.to_string()))
        })?;
        Ok(subscription.id)
    }

    #[instrument(skip(self))]
    async fn unsubscribe(&self, subscription_id: &str) -> Result<(), AppError> {
        let url = self.url(&format!("/v1/subscriptions/{subscription_id}"));

        let response = self
            .authorized(self.http_client.delete(&url))
            .send()
            .await
            .map_err(|e| AppError::ExternalService(ExternalServiceError::Network(e.to_string())))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(AppError::ExternalService(ExternalServiceError::ApiError {
                status_code: status.as_u16(),
                message: body,
            }));
        }
        Ok(())
    }
}

#[async_trait]
impl HealthProbe for NodeGatewayClient {
    #[instrument(skip(self))]
    async fn health_check(&self) -> Result<(), AppError> {
        let response = self
            .authorized(self.http_client.get(self.url("/health")))
            .send()
            .await
            .map_err(|e| {
                AppError::ExternalService(ExternalServiceError::Unavailable(e.to_string()))
            })?;

        if !response.status().is_success() {
            return Err(AppError::ExternalService(ExternalServiceError::Unavailable(
                format!("node gateway returned {}", response.status()),
            )));
        }
        Ok(())
    }
}
