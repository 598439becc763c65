//! HTTP integration tests for the node gateway, KMS, rates and payments
//! clients.
//!
//! Uses `wiremock` to stand in for the upstream services and drives the
//! real clients against it, covering request shapes, response parsing and
//! error classification.

use std::sync::Arc;

use chrono::Utc;
use rust_decimal_macros::dec;
use secrecy::SecretString;
use serde_json::json;
use uuid::Uuid;
use wiremock::matchers::{body_partial_json, header, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

use oxide_settlement::domain::currency;
use oxide_settlement::domain::{
    Amount, AppError, Blockchain, BlockchainError, Broadcaster, CurrencyConverter, CurrencyType,
    ExternalServiceError, FeeCalculator, FeeEstimate, FeeParams, HealthProbe, PaymentGateway,
    SigningClient, SigningError, SigningRequest, Wallet, WalletSubscriber, WalletType,
};
use oxide_settlement::infra::{
    KmsClient, KmsConfig, NodeGatewayClient, NodeGatewayConfig, PaymentsClient, PaymentsConfig,
    RatesClient, RatesConfig,
};
use oxide_settlement::test_utils::MockConverter;

// ============================================================================
// NODE GATEWAY TESTS
// ============================================================================

mod node_gateway_tests {
    use super::*;

    fn gateway(server: &MockServer) -> NodeGatewayClient {
        NodeGatewayClient::new(
            NodeGatewayConfig {
                base_url: server.uri(),
                api_key: Some(SecretString::from("gateway-key")),
                callback_url: Some("https://engine.example.com/webhook".to_string()),
            },
            Arc::new(MockConverter::new()),
        )
        .unwrap()
    }

    fn inbound_wallet() -> Wallet {
        Wallet {
            id: 1,
            uuid: Uuid::new_v4(),
            blockchain: Blockchain::Ethereum,
            address: "0xdeposit".to_string(),
            wallet_type: WalletType::Inbound,
            mainnet_subscription_id: None,
            testnet_subscription_id: None,
            confirmed_mainnet_transactions: 0,
            pending_mainnet_transactions: 0,
            confirmed_testnet_transactions: 0,
            pending_testnet_transactions: 0,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_broadcast_returns_transaction_hash() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/eth/broadcast"))
            .and(header("X-Api-Key", "gateway-key"))
            .and(body_partial_json(json!({"raw": "0xsigned", "isTest": false})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"hash": "0xbroadcast"})))
            .expect(1)
            .mount(&server)
            .await;

        let client = gateway(&server);
        let hash = client
            .broadcast_transaction(Blockchain::Ethereum, "0xsigned", false)
            .await
            .unwrap();
        assert_eq!(hash, "0xbroadcast");
    }

    #[tokio::test]
    async fn test_broadcast_classifies_insufficient_funds() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/eth/broadcast"))
            .respond_with(
                ResponseTemplate::new(400)
                    .set_body_string("insufficient funds for gas * price + value"),
            )
            .mount(&server)
            .await;

        let err = gateway(&server)
            .broadcast_transaction(Blockchain::Ethereum, "0xsigned", false)
            .await
            .expect_err("Underfunded broadcast must fail");
        assert!(matches!(
            err,
            AppError::Blockchain(BlockchainError::InsufficientFunds(_))
        ));
    }

    #[tokio::test]
    async fn test_broadcast_rejection_and_outage_are_distinct() {
        let rejecting = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(422).set_body_string("nonce too low"))
            .mount(&rejecting)
            .await;
        let err = gateway(&rejecting)
            .broadcast_transaction(Blockchain::Ethereum, "0xsigned", false)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            AppError::Blockchain(BlockchainError::BroadcastRejected(_))
        ));

        let down = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(503).set_body_string("maintenance"))
            .mount(&down)
            .await;
        let err = gateway(&down)
            .broadcast_transaction(Blockchain::Ethereum, "0xsigned", false)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            AppError::Blockchain(BlockchainError::Connection(_))
        ));
    }

    #[tokio::test]
    async fn test_receipt_tracks_confirmation_threshold() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/eth/transactions/0xdead"))
            .and(query_param("isTest", "false"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "sender": "0xsender",
                "recipient": "0xrecipient",
                "hash": "0xdead",
                "nonce": 4,
                "networkFee": "21000000000000",
                "success": true,
                "confirmations": 12
            })))
            .mount(&server)
            .await;

        let receipt = gateway(&server)
            .get_transaction_receipt(Blockchain::Ethereum, "0xdead", false)
            .await
            .unwrap();
        assert!(receipt.success);
        assert!(receipt.is_confirmed);
        assert_eq!(receipt.nonce, 4);
        assert_eq!(receipt.network_fee.value(), dec!(0.000021));
        assert_eq!(receipt.network_fee.ticker(), "ETH");
    }

    #[tokio::test]
    async fn test_missing_receipt_is_reported() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404).set_body_string("not found"))
            .mount(&server)
            .await;

        let err = gateway(&server)
            .get_transaction_receipt(Blockchain::Ethereum, "0xmissing", false)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            AppError::Blockchain(BlockchainError::ReceiptNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_evm_fee_estimate_applies_headroom() {
        let server = MockServer::start().await;
        // 100 gwei base, 2 gwei priority.
        Mock::given(method("GET"))
            .and(path("/v1/eth/fees"))
            .and(query_param("isTest", "false"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "baseFee": "100000000000",
                "priorityFee": "2000000000"
            })))
            .mount(&server)
            .await;

        let client = gateway(&server);
        let eth = currency::find(Blockchain::Ethereum, "ETH").unwrap();
        let usdt = currency::find(Blockchain::Ethereum, "USDT").unwrap();

        // 115% of base plus priority: 117 gwei across 21k gas units.
        let coin = client.estimate_fee(eth, false).await.unwrap();
        assert_eq!(coin.total.value(), dec!(0.002457));
        assert!(matches!(
            coin.params,
            FeeParams::Evm {
                gas_units: 21_000,
                max_fee_per_gas: 117_000_000_000,
                max_priority_fee_per_gas: 2_000_000_000,
            }
        ));

        // Token transfers budget 65k gas units.
        let token = client.estimate_fee(usdt, false).await.unwrap();
        assert_eq!(token.total.value(), dec!(0.007605));
        assert!(matches!(
            token.params,
            FeeParams::Evm {
                gas_units: 65_000,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_fee_estimate_errors_surface() {
        let down = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(500).set_body_string("boom"))
            .mount(&down)
            .await;
        let eth = currency::find(Blockchain::Ethereum, "ETH").unwrap();
        let err = gateway(&down).estimate_fee(eth, false).await.unwrap_err();
        assert!(matches!(
            err,
            AppError::Blockchain(BlockchainError::Connection(_))
        ));

        let garbled = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_string("not valid json"))
            .mount(&garbled)
            .await;
        let err = gateway(&garbled).estimate_fee(eth, false).await.unwrap_err();
        assert!(matches!(
            err,
            AppError::ExternalService(ExternalServiceError::ParseError(_))
        ));
    }

    #[tokio::test]
    async fn test_subscribe_registers_deposit_callback() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/subscriptions"))
            .and(body_partial_json(json!({
                "address": "0xdeposit",
                "blockchain": "eth",
                "networkId": 1,
                "url": "https://engine.example.com/webhook"
            })))
            .respond_with(ResponseTemplate::new(201).set_body_json(json!({"id": "sub-123"})))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("DELETE"))
            .and(path("/v1/subscriptions/sub-123"))
            .respond_with(ResponseTemplate::new(204))
            .expect(1)
            .mount(&server)
            .await;

        let client = gateway(&server);
        let id = client.subscribe(&inbound_wallet(), false).await.unwrap();
        assert_eq!(id, "sub-123");
        client.unsubscribe("sub-123").await.unwrap();
    }

    #[tokio::test]
    async fn test_subscribe_failure_carries_status_code() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(403).set_body_string("address quota exceeded"))
            .mount(&server)
            .await;

        let err = gateway(&server)
            .subscribe(&inbound_wallet(), false)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            AppError::ExternalService(ExternalServiceError::ApiError {
                status_code: 403,
                ..
            })
        ));
    }

    #[tokio::test]
    async fn test_health_check_reflects_gateway_status() {
        let healthy = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/health"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&healthy)
            .await;
        assert!(gateway(&healthy).health_check().await.is_ok());

        let down = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&down)
            .await;
        let err = gateway(&down).health_check().await.unwrap_err();
        assert!(matches!(
            err,
            AppError::ExternalService(ExternalServiceError::Unavailable(_))
        ));
    }
}

// ============================================================================
// KMS TESTS
// ============================================================================

mod kms_tests {
    use super::*;

    fn kms(server: &MockServer) -> KmsClient {
        KmsClient::new(KmsConfig {
            base_url: server.uri(),
            api_key: Some(SecretString::from("kms-key")),
        })
        .unwrap()
    }

    fn evm_signing_request() -> SigningRequest {
        let eth = currency::find(Blockchain::Ethereum, "ETH").unwrap();
        SigningRequest {
            wallet_uuid: Uuid::nil(),
            blockchain: Blockchain::Ethereum,
            is_test: false,
            asset_type: CurrencyType::Coin,
            contract_address: None,
            amount: Amount::crypto("ETH", dec!(0.5), 18).unwrap(),
            recipient: "0xRecipient".to_string(),
            network_id: eth.network_id(false),
            nonce: 7,
            fee: FeeEstimate {
                blockchain: Blockchain::Ethereum,
                is_test: false,
                total: Amount::crypto("ETH", dec!(0.001), 18).unwrap(),
                params: FeeParams::Evm {
                    gas_units: 21_000,
                    max_fee_per_gas: 40_000_000_000,
                    max_priority_fee_per_gas: 2_000_000_000,
                },
            },
        }
    }

    #[tokio::test]
    async fn test_create_wallet_parses_kms_response() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/wallets"))
            .and(header("X-Api-Key", "kms-key"))
            .and(body_partial_json(json!({"blockchain": "TRON"})))
            .respond_with(ResponseTemplate::new(201).set_body_json(json!({
                "uuid": "8f14e45f-ceea-467f-a34e-d7b6c2b0a2f1",
                "address": "TNewWallet"
            })))
            .expect(1)
            .mount(&server)
            .await;

        let created = kms(&server).create_wallet(Blockchain::Tron).await.unwrap();
        assert_eq!(
            created.uuid,
            Uuid::parse_str("8f14e45f-ceea-467f-a34e-d7b6c2b0a2f1").unwrap()
        );
        assert_eq!(created.address, "TNewWallet");
    }

    #[tokio::test]
    async fn test_sign_transaction_posts_composed_payload() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path(
                "/v1/wallets/00000000-0000-0000-0000-000000000000/evm/transactions",
            ))
            .and(body_partial_json(json!({
                "amount": "500000000000000000",
                "gas": 21_000,
                "maxFeePerGas": "40000000000",
                "networkId": 1,
                "nonce": 7,
                "recipient": "0xRecipient"
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"raw": "0xsignedraw"})))
            .expect(1)
            .mount(&server)
            .await;

        let raw = kms(&server)
            .sign_transaction(&evm_signing_request())
            .await
            .unwrap();
        assert_eq!(raw, "0xsignedraw");
    }

    #[tokio::test]
    async fn test_signing_rejection_and_outage_are_distinct() {
        let rejecting = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(400).set_body_string("unknown wallet"))
            .mount(&rejecting)
            .await;
        let err = kms(&rejecting)
            .sign_transaction(&evm_signing_request())
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Signing(SigningError::Rejected(_))));

        let down = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(503).set_body_string("maintenance"))
            .mount(&down)
            .await;
        let err = kms(&down)
            .sign_transaction(&evm_signing_request())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            AppError::Signing(SigningError::Unavailable(_))
        ));
    }
}

// ============================================================================
// RATES TESTS
// ============================================================================

mod rates_tests {
    use super::*;

    fn rates(server: &MockServer) -> RatesClient {
        RatesClient::new(RatesConfig {
            base_url: server.uri(),
            api_key: None,
        })
        .unwrap()
    }

    #[tokio::test]
    async fn test_crypto_to_fiat_truncates_to_cents() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/rates"))
            .and(query_param("base", "ETH"))
            .and(query_param("quote", "USD"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"rate": "2000"})))
            .mount(&server)
            .await;

        let amount = Amount::crypto("ETH", dec!(0.0123456), 18).unwrap();
        let usd = rates(&server).crypto_to_fiat(&amount, "USD").await.unwrap();
        // 24.6912 truncated to cents, never rounded up.
        assert_eq!(usd.value(), dec!(24.69));
        assert_eq!(usd.ticker(), "USD");
    }

    #[tokio::test]
    async fn test_fiat_to_crypto_truncates_to_currency_decimals() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/rates"))
            .and(query_param("base", "USDT"))
            .and(query_param("quote", "USD"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"rate": "1.0007"})))
            .mount(&server)
            .await;

        let usdt = currency::find(Blockchain::Ethereum, "USDT").unwrap();
        let price = Amount::usd(dec!(50)).unwrap();
        let quoted = rates(&server).fiat_to_crypto(&price, usdt).await.unwrap();
        assert_eq!(quoted.value(), dec!(49.965024));
        assert_eq!(quoted.decimals(), 6);
    }

    #[tokio::test]
    async fn test_rates_are_cached_within_ttl() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/rates"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"rate": "2000"})))
            .expect(1)
            .mount(&server)
            .await;

        let client = rates(&server);
        let amount = Amount::crypto("ETH", dec!(0.001), 18).unwrap();
        let first = client.crypto_to_fiat(&amount, "USD").await.unwrap();
        let second = client.crypto_to_fiat(&amount, "USD").await.unwrap();
        assert_eq!(first.value(), dec!(2));
        assert_eq!(second.value(), dec!(2));
    }

    #[tokio::test]
    async fn test_non_positive_rate_is_rejected() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"rate": "0"})))
            .mount(&server)
            .await;

        let amount = Amount::crypto("ETH", dec!(1), 18).unwrap();
        let err = rates(&server)
            .crypto_to_fiat(&amount, "USD")
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            AppError::ExternalService(ExternalServiceError::ParseError(_))
        ));
    }

    #[tokio::test]
    async fn test_rate_service_error_carries_status() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(429).set_body_string("rate limited"))
            .mount(&server)
            .await;

        let amount = Amount::crypto("ETH", dec!(1), 18).unwrap();
        let err = rates(&server)
            .crypto_to_fiat(&amount, "USD")
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            AppError::ExternalService(ExternalServiceError::ApiError {
                status_code: 429,
                ..
            })
        ));
    }

    #[tokio::test]
    async fn test_fiat_to_fiat_same_ticker_skips_the_service() {
        // No mocks mounted: any request would fail.
        let server = MockServer::start().await;
        let usd = Amount::usd(dec!(10)).unwrap();
        let same = rates(&server).fiat_to_fiat(&usd, "USD").await.unwrap();
        assert_eq!(same, usd);
    }
}

// ============================================================================
// PAYMENTS SERVICE TESTS
// ============================================================================

mod payments_tests {
    use super::*;

    fn payments(server: &MockServer) -> PaymentsClient {
        PaymentsClient::new(Some(PaymentsConfig {
            base_url: server.uri(),
            api_key: Some(SecretString::from("payments-key")),
        }))
        .unwrap()
    }

    #[tokio::test]
    async fn test_list_pending_withdrawals_parses_orders() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/withdrawals"))
            .and(query_param("status", "pending"))
            .and(query_param("limit", "50"))
            .and(header("X-Api-Key", "payments-key"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([
                {
                    "paymentId": 31,
                    "merchantId": 7,
                    "balanceId": 11,
                    "recipientAddress": "0xcustomer",
                    "amount": "0.75"
                }
            ])))
            .mount(&server)
            .await;

        let orders = payments(&server).list_pending_withdrawals(50).await.unwrap();
        assert_eq!(orders.len(), 1);
        assert_eq!(orders[0].payment_id, 31);
        assert_eq!(orders[0].merchant_id, 7);
        assert_eq!(orders[0].balance_id, 11);
        assert_eq!(orders[0].recipient_address, "0xcustomer");
        assert_eq!(orders[0].amount, dec!(0.75));
    }

    #[tokio::test]
    async fn test_list_expired_payments_parses_ids() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/payments/expired"))
            .and(query_param("limit", "25"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(json!({"paymentIds": [4, 9]})),
            )
            .mount(&server)
            .await;

        let ids = payments(&server).list_expired_payments(25).await.unwrap();
        assert_eq!(ids, vec![4, 9]);
    }

    #[tokio::test]
    async fn test_transitions_post_to_payment_actions() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/payments/31/in-progress"))
            .respond_with(ResponseTemplate::new(204))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/v1/payments/31/succeeded"))
            .respond_with(ResponseTemplate::new(204))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/v1/payments/31/failed"))
            .and(body_partial_json(
                json!({"reason": "insufficient merchant balance"}),
            ))
            .respond_with(ResponseTemplate::new(204))
            .expect(1)
            .mount(&server)
            .await;

        let client = payments(&server);
        client.mark_in_progress(31).await.unwrap();
        client.mark_succeeded(31).await.unwrap();
        client
            .mark_failed(31, "insufficient merchant balance")
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_create_topup_payment_returns_id() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/payments/topups"))
            .and(body_partial_json(json!({
                "merchantId": 12,
                "ticker": "ETH"
            })))
            .respond_with(ResponseTemplate::new(201).set_body_json(json!({"id": 555})))
            .mount(&server)
            .await;

        let amount = Amount::crypto("ETH", dec!(0.5), 18).unwrap();
        let usd = Amount::usd(dec!(1000)).unwrap();
        let id = payments(&server)
            .create_topup_payment(12, &amount, &usd)
            .await
            .unwrap();
        assert_eq!(id, 555);
    }

    #[tokio::test]
    async fn test_payment_service_error_carries_status() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500).set_body_string("boom"))
            .mount(&server)
            .await;

        let err = payments(&server).mark_expired(31).await.unwrap_err();
        assert!(matches!(
            err,
            AppError::ExternalService(ExternalServiceError::ApiError {
                status_code: 500,
                ..
            })
        ));
    }
}
