//! Key management service client.
//!
//! Private keys never leave the KMS. We send transaction parameters and get
//! back a signed raw transaction. The payload shape differs per chain
//! family, so requests are composed through a registry of per-blockchain
//! composers instead of branching inside the client.

use async_trait::async_trait;
use reqwest::Client;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use serde_json::{Value, json};
use std::collections::HashMap;
use tracing::{debug, error, instrument};
use uuid::Uuid;

use crate::domain::{
    AppError, Blockchain, CreatedWallet, ExternalServiceError, FeeParams, SigningClient,
    SigningError, SigningRequest,
};

/// Builds KMS signing requests for one family of blockchains
pub trait TransactionComposer: Send + Sync {
    /// Request path under the wallet resource
    fn path(&self, wallet_uuid: &Uuid) -> String;

    /// JSON body of the signing request
    fn payload(&self, request: &SigningRequest) -> Result<Value, AppError>;
}

/// Composer for EVM chains (Ethereum, Polygon, BNB Smart Chain)
pub struct EvmComposer;

impl TransactionComposer for EvmComposer {
    fn path(&self, wallet_uuid: &Uuid) -> String {
        format!("/v1/wallets/{wallet_uuid}/evm/transactions")
    }

    fn payload(&self, request: &SigningRequest) -> Result<Value, AppError> {
        let FeeParams::Evm {
            gas_units,
            max_fee_per_gas,
            max_priority_fee_per_gas,
        } = &request.fee.params
        else {
            return Err(AppError::Signing(SigningError::Rejected(format!(
                "non-EVM fee parameters for {} transaction",
                request.blockchain
            ))));
        };

        Ok(json!({
            "amount": request.amount.to_raw_string(),
            "assetType": request.asset_type.as_str(),
            "contractAddress": request.contract_address,
            "gas": gas_units,
            "maxFeePerGas": max_fee_per_gas.to_string(),
            "maxPriorityPerGas": max_priority_fee_per_gas.to_string(),
            "networkId": request.network_id,
            "nonce": request.nonce,
            "recipient": request.recipient,
        }))
    }
}

/// Composer for Tron
pub struct TronComposer;

impl TransactionComposer for TronComposer {
    fn path(&self, wallet_uuid: &Uuid) -> String {
        format!("/v1/wallets/{wallet_uuid}/tron/transactions")
    }

    fn payload(&self, request: &SigningRequest) -> Result<Value, AppError> {
        let FeeParams::Tron { fee_limit } = &request.fee.params else {
            return Err(AppError::Signing(SigningError::Rejected(
                "non-Tron fee parameters for Tron transaction".to_string(),
            )));
        };

        Ok(json!({
            "amount": request.amount.to_raw_string(),
            "assetType": request.asset_type.as_str(),
            "contractAddress": request.contract_address,
            "feeLimit": fee_limit,
            "isTest": request.is_test,
            "recipient": request.recipient,
        }))
    }
}

#[derive(Debug, Deserialize)]
struct SignedTransactionResponse {
    raw: String,
}

/// Key management service connection settings
#[derive(Debug, Clone)]
pub struct KmsConfig {
    pub base_url: String,
    pub api_key: Option<SecretString>,
}

/// HTTP client for the key management service
pub struct KmsClient {
    http_client: Client,
    config: KmsConfig,
    composers: HashMap<Blockchain, Box<dyn TransactionComposer>>,
}

impl KmsClient {
    /// Create a KMS client with composers for every supported blockchain
    pub fn new(config: KmsConfig) -> Result<Self, AppError> {
        let http_client = Client::builder()
            .timeout(std::time::Duration::from_secs(30))
            .build()
            .map_err(|e| {
                AppError::ExternalService(ExternalServiceError::Configuration(e.to_string()))
            })?;

        let mut composers: HashMap<Blockchain, Box<dyn TransactionComposer>> = HashMap::new();
        for blockchain in Blockchain::all() {
            let composer: Box<dyn TransactionComposer> = if blockchain.is_evm() {
                Box::new(EvmComposer)
            } else {
                Box::new(TronComposer)
            };
            composers.insert(*blockchain, composer);
        }

        Ok(Self {
            http_client,
            config: KmsConfig {
                base_url: config.base_url.trim_end_matches('/').to_string(),
                ..config
            },
            composers,
        })
    }

    fn composer_for(&self, blockchain: Blockchain) -> Result<&dyn TransactionComposer, AppError> {
        self.composers
            .get(&blockchain)
            .map(AsRef::as_ref)
            .ok_or_else(|| {
                AppError::Signing(SigningError::UnsupportedBlockchain(blockchain.to_string()))
            })
    }

    fn authorized(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.config.api_key {
            Some(key) => builder.header("X-Api-Key", key.expose_secret()),
            None => builder,
        }
    }

    async fn post(&self, path: &str, body: &Value) -> Result<reqwest::Response, AppError> {
        let url = format!("{}{}", self.config.base_url, path);
        debug!(url = %url, "Calling KMS");

        let response = self
            .authorized(self.http_client.post(&url))
            .json(body)
            .send()
            .await
            .map_err(|e| {
                error!(error = %e, "KMS request failed");
                AppError::Signing(SigningError::Unavailable(e.to_string()))
            })?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            error!(status = %status, body = %body, "KMS returned error");
            if status.is_server_error() {
                return Err(AppError::Signing(SigningError::Unavailable(format!(
                    "status {status}: {body}"
                ))));
            }
            return Err(AppError::Signing(SigningError::Rejected(format!(
                "status {status}: {body}"
            ))));
        }

        Ok(response)
    }
}

#[async_trait]
impl SigningClient for KmsClient {
    #[instrument(skip(self))]
    async fn create_wallet(&self, blockchain: Blockchain) -> Result<CreatedWallet, AppError> {
        let body = json!({ "blockchain": blockchain.as_str() });
        let response = self.post("/v1/wallets", &body).await?;

        let wallet: CreatedWallet = response.json().await.map_err(|e| {
            error!(error = %e, "Failed to parse KMS wallet response");
            AppError::ExternalService(ExternalServiceError::ParseError(e.to_string()))
        })?;
        Ok(wallet)
    }

    #[instrument(skip(self, request), fields(blockchain = %request.blockchain, nonce = request.nonce))]
    async fn sign_transaction(&self, request: &SigningRequest) -> Result<String, AppError> {
        let composer = self.composer_for(request.blockchain)?;
        let path = composer.path(&request.wallet_uuid);
        let payload = composer.payload(request)?;

        let response = self.post(&path, &payload).await?;
        let signed: SignedTransactionResponse = response.json().await.map_err(|e| {
            error!(error = %e, "Failed to parse KMS signing response");
            AppError::ExternalService(ExternalServiceError::ParseError(e.to_string()))
        })?;
        Ok(signed.raw)
    }
}
