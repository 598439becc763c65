//! Exchange rate client.
//!
//! Fetches spot prices from the rates service and converts between fiat and
//! crypto denominations. Rates are cached briefly so fee estimation and
//! threshold checks inside one scheduler pass do not hammer the service.

use async_trait::async_trait;
use dashmap::DashMap;
use reqwest::Client;
use rust_decimal::{Decimal, RoundingStrategy};
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use std::time::{Duration, Instant};
use tracing::{debug, error, instrument};

use crate::domain::{
    Amount, AppError, Currency, CurrencyConverter, ExternalServiceError, MoneyError,
};

const RATE_CACHE_TTL: Duration = Duration::from_secs(30);
const FIAT_DECIMALS: u32 = 2;

/// Rates service connection settings
#[derive(Debug, Clone)]
pub struct RatesConfig {
    pub base_url: String,
    pub api_key: Option<SecretString>,
}

#[derive(Debug, Clone)]
struct CachedRate {
    rate: Decimal,
    fetched_at: Instant,
}

impl CachedRate {
    fn is_stale(&self, ttl: Duration) -> bool {
        self.fetched_at.elapsed() >= ttl
    }
}

#[derive(Debug, Deserialize)]
struct RateResponse {
    /// Price of one unit of the base asset, quoted in the quote asset
    rate: Decimal,
}

/// HTTP client for the rates service
pub struct RatesClient {
    http_client: Client,
    config: RatesConfig,
    cache: DashMap<String, CachedRate>,
}

fn pair_key(base: &str, quote: &str) -> String {
    format!("{base}/{quote}")
}

impl RatesClient {
    pub fn new(config: RatesConfig) -> Result<Self, AppError> {
        let http_client = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| {
                AppError::ExternalService(ExternalServiceError::Configuration(e.to_string()))
            })?;

        Ok(Self {
            http_client,
            config: RatesConfig {
                base_url: config.base_url.trim_end_matches('/').to_string(),
                ..config
            },
            cache: DashMap::new(),
        })
    }

    fn authorized(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.config.api_key {
            Some(key) => builder.header("X-Api-Key", key.expose_secret()),
            None => builder,
        }
    }

    /// Price of one unit of `base`, quoted in `quote`.
    async fn rate(&self, base: &str, quote: &str) -> Result<Decimal, AppError> {
        let key = pair_key(base, quote);
        if let Some(cached) = self.cache.get(&key) {
            if !cached.is_stale(RATE_CACHE_TTL) {
                return Ok(cached.rate);
            }
        }

        let url = format!("{}/v1/rates", self.config.base_url);
        debug!(pair = %key, "Fetching exchange rate");

        let response = self
            .authorized(self.http_client.get(&url))
            .query(&[("base", base), ("quote", quote)])
            .send()
            .await
            .map_err(|e| {
                error!(error = %e, pair = %key, "Rate request failed");
                AppError::ExternalService(ExternalServiceError::Network(e.to_string()))
            })?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            error!(status = %status, body = %body, pair = %key, "Rate request returned error");
            return Err(AppError::ExternalService(ExternalServiceError::ApiError {
                status_code: status.as_u16(),
                message: body,
            }));
        }

        let parsed: RateResponse = response.json().await.map_err(|e| {
            AppError::ExternalService(ExternalServiceError::ParseError(e.to_string()))
        })?;
        if parsed.rate <= Decimal::ZERO {
            return Err(AppError::ExternalService(ExternalServiceError::ParseError(
                format!("non-positive rate for {key}: {}", parsed.rate),
            )));
        }

        self.cache.insert(
            key,
            CachedRate {
                rate: parsed.rate,
                fetched_at: Instant::now(),
            },
        );
        Ok(parsed.rate)
    }
}

#[async_trait]
impl CurrencyConverter for RatesClient {
    #[instrument(skip(self, from, to), fields(from = %from, ticker = to.ticker))]
    async fn fiat_to_crypto(&self, from: &Amount, to: &Currency) -> Result<Amount, AppError> {
        let rate = self.rate(to.ticker, from.ticker()).await?;
        let value = from
            .value()
            .checked_div(rate)
            .ok_or_else(|| MoneyError::Overflow(format!("{from} / {rate}")))?
            .round_dp_with_strategy(to.decimals, RoundingStrategy::ToZero);
        Ok(Amount::crypto(to.ticker, value, to.decimals)?)
    }

    #[instrument(skip(self, from), fields(from = %from, fiat_ticker))]
    async fn crypto_to_fiat(&self, from: &Amount, fiat_ticker: &str) -> Result<Amount, AppError> {
        let rate = self.rate(from.ticker(), fiat_ticker).await?;
        let value = from
            .value()
            .checked_mul(rate)
            .ok_or_else(|| MoneyError::Overflow(format!("{from} * {rate}")))?
            .round_dp_with_strategy(FIAT_DECIMALS, RoundingStrategy::ToZero);
        Ok(Amount::fiat(fiat_ticker, value, FIAT_DECIMALS)?)
    }

    #[instrument(skip(self, from), fields(from = %from, fiat_ticker))]
    async fn fiat_to_fiat(&self, from: &Amount, fiat_ticker: &str) -> Result<Amount, AppError> {
        if from.ticker() == fiat_ticker {
            return Ok(from.clone());
        }
        let rate = self.rate(from.ticker(), fiat_ticker).await?;
        let value = from
            .value()
            .checked_mul(rate)
            .ok_or_else(|| MoneyError::Overflow(format!("{from} * {rate}")))?
            .round_dp_with_strategy(FIAT_DECIMALS, RoundingStrategy::ToZero);
        Ok(Amount::fiat(fiat_ticker, value, FIAT_DECIMALS)?)
    }
}
