//! HTTP-level tests for the settlement API.
//!
//! Requests go through the full router so routing, extraction, signature
//! checks and error mapping are all exercised the way the node gateway and
//! operators hit them.

use std::sync::Arc;

use axum::{
    body::Body,
    http::{Request, StatusCode},
};
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use hmac::{Hmac, Mac};
use http_body_util::BodyExt;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use secrecy::SecretString;
use serde_json::{Value, json};
use sha2::Sha512;
use tower::ServiceExt;
use uuid::Uuid;

use oxide_settlement::api::create_router;
use oxide_settlement::app::{
    AppState, Ledger, Processing, ProcessingConfig, Transactions, Wallets,
};
use oxide_settlement::domain::currency;
use oxide_settlement::domain::{
    Amount, BalanceOwner, Blockchain, HealthResponse, HealthStatus, NodeWebhook, WalletType,
};
use oxide_settlement::test_utils::{
    MemoryStore, MockBroadcaster, MockConverter, MockFees, MockPayments, MockSigner,
    MockSubscriber, RecordingEvents,
};

/// Shared secret for the signed-webhook tests
const TEST_WEBHOOK_SECRET: &str = "test-webhook-secret";

struct TestApp {
    state: Arc<AppState>,
    store: Arc<MemoryStore>,
    broadcaster: Arc<MockBroadcaster>,
}

fn build_app(webhook_secret: Option<&str>) -> TestApp {
    let store = Arc::new(MemoryStore::new());
    let broadcaster = Arc::new(MockBroadcaster::new());

    let ledger = Arc::new(Ledger::new(Arc::clone(&store) as _));
    let wallets = Arc::new(Wallets::new(
        Arc::clone(&store) as _,
        Arc::new(MockSigner::new()) as _,
        Arc::new(MockSubscriber::new()) as _,
    ));
    let transactions = Arc::new(Transactions::new(
        Arc::clone(&store) as _,
        Arc::clone(&store) as _,
    ));
    let processing = Arc::new(Processing::new(
        Arc::clone(&ledger),
        wallets,
        transactions,
        Arc::new(MockConverter::new()) as _,
        Arc::new(MockFees::new()) as _,
        Arc::clone(&broadcaster) as _,
        Arc::new(MockPayments::new()) as _,
        Arc::new(RecordingEvents::new()) as _,
        Arc::clone(&store) as _,
        ProcessingConfig::default(),
    ));

    let state = Arc::new(
        AppState::new(
            processing,
            ledger,
            Arc::clone(&store) as _,
            Arc::clone(&broadcaster) as _,
        )
        .with_webhook_secret(webhook_secret.map(SecretString::from)),
    );

    TestApp {
        state,
        store,
        broadcaster,
    }
}

fn app() -> TestApp {
    build_app(None)
}

fn webhook_body(address: &str, tx_id: &str, amount: &str) -> Vec<u8> {
    let webhook = NodeWebhook {
        subscription_type: "ADDRESS_EVENT".to_string(),
        tx_id: tx_id.to_string(),
        address: address.to_string(),
        counter_address: Some("0xcounterparty".to_string()),
        asset: "ETH".to_string(),
        amount: amount.to_string(),
        chain: "ethereum-mainnet".to_string(),
        transaction_kind: "native".to_string(),
        mempool: false,
        block_number: Some(19_000_000),
    };
    serde_json::to_vec(&webhook).unwrap()
}

fn sign(secret: &str, body: &[u8]) -> String {
    let mut mac = Hmac::<Sha512>::new_from_slice(secret.as_bytes()).unwrap();
    mac.update(body);
    BASE64_STANDARD.encode(mac.finalize().into_bytes())
}

fn webhook_request(wallet_uuid: Uuid, body: Vec<u8>, signature: Option<&str>) -> Request<Body> {
    let mut builder = Request::builder()
        .method("POST")
        .uri(format!("/webhook/{wallet_uuid}/1"))
        .header("Content-Type", "application/json");
    if let Some(signature) = signature {
        builder = builder.header("x-payload-hash", signature);
    }
    builder.body(Body::from(body)).unwrap()
}

#[tokio::test]
async fn test_webhook_records_deposit() {
    let app = app();
    let wallet = app
        .store
        .insert_wallet(Blockchain::Ethereum, WalletType::Inbound);
    let router = create_router(app.state);

    let body = webhook_body(&wallet.address, "0xdeposit", "0.3");
    let response = router
        .oneshot(webhook_request(wallet.uuid, body, None))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::NO_CONTENT);
    let transactions = app.store.all_transactions();
    assert_eq!(transactions.len(), 1);
    assert_eq!(transactions[0].hash.as_deref(), Some("0xdeposit"));
}

#[tokio::test]
async fn test_webhook_rejects_malformed_payload() {
    let app = app();
    let wallet = app
        .store
        .insert_wallet(Blockchain::Ethereum, WalletType::Inbound);
    let router = create_router(app.state);

    let response = router
        .oneshot(webhook_request(
            wallet.uuid,
            b"{\"txId\": \"0xabc\"".to_vec(),
            None,
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert!(app.store.all_transactions().is_empty());
}

#[tokio::test]
async fn test_webhook_unknown_wallet_is_not_found() {
    let app = app();
    let router = create_router(app.state);

    let body = webhook_body("0xnowhere", "0xdeposit", "0.3");
    let response = router
        .oneshot(webhook_request(Uuid::new_v4(), body, None))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    let body_bytes = response.into_body().collect().await.unwrap().to_bytes();
    let error: Value = serde_json::from_slice(&body_bytes).unwrap();
    assert_eq!(error["error"]["type"], "not_found");
}

#[tokio::test]
async fn test_webhook_signature_required_when_secret_configured() {
    let app = build_app(Some(TEST_WEBHOOK_SECRET));
    let wallet = app
        .store
        .insert_wallet(Blockchain::Ethereum, WalletType::Inbound);
    let router = create_router(app.state);

    let body = webhook_body(&wallet.address, "0xsigned", "0.3");
    let signature = sign(TEST_WEBHOOK_SECRET, &body);

    let response = router
        .clone()
        .oneshot(webhook_request(wallet.uuid, body.clone(), Some(&signature)))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NO_CONTENT);

    // Missing header.
    let response = router
        .clone()
        .oneshot(webhook_request(wallet.uuid, body.clone(), None))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    // Signature computed with the wrong secret.
    let forged = sign("wrong-secret", &body);
    let response = router
        .oneshot(webhook_request(wallet.uuid, body, Some(&forged)))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    // Only the correctly signed delivery went through.
    assert_eq!(app.store.all_transactions().len(), 1);
}

#[tokio::test]
async fn test_health_reports_component_status() {
    let app = app();
    let router = create_router(app.state);

    let response = router
        .oneshot(
            Request::builder()
                .method("GET")
                .uri("/health")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let body_bytes = response.into_body().collect().await.unwrap().to_bytes();
    let health: HealthResponse = serde_json::from_slice(&body_bytes).unwrap();
    assert_eq!(health.status, HealthStatus::Healthy);
    assert_eq!(health.database, HealthStatus::Healthy);
    assert_eq!(health.gateway, HealthStatus::Healthy);
}

#[tokio::test]
async fn test_health_unhealthy_when_gateway_is_down() {
    let app = app();
    app.broadcaster.set_healthy(false);
    let router = create_router(app.state);

    let response = router
        .clone()
        .oneshot(
            Request::builder()
                .method("GET")
                .uri("/health")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let body_bytes = response.into_body().collect().await.unwrap().to_bytes();
    let health: HealthResponse = serde_json::from_slice(&body_bytes).unwrap();
    assert_eq!(health.status, HealthStatus::Unhealthy);
    assert_eq!(health.database, HealthStatus::Healthy);
    assert_eq!(health.gateway, HealthStatus::Unhealthy);

    // An unhealthy dependency also fails the readiness probe.
    let response = router
        .oneshot(
            Request::builder()
                .method("GET")
                .uri("/health/ready")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
}

#[tokio::test]
async fn test_liveness_ignores_dependencies() {
    let app = app();
    app.store.set_healthy(false);
    app.broadcaster.set_healthy(false);
    let router = create_router(app.state);

    let response = router
        .oneshot(
            Request::builder()
                .method("GET")
                .uri("/health/live")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn test_admin_topup_credits_merchant() {
    let app = app();
    let eth = currency::find(Blockchain::Ethereum, "ETH").unwrap();
    let wallet = app
        .store
        .insert_wallet(Blockchain::Ethereum, WalletType::Inbound);
    app.store.insert_balance(wallet.owner(), eth, false, dec!(2));
    let router = create_router(app.state);

    let payload = json!({
        "merchant_id": 12,
        "blockchain": "ETH",
        "ticker": "ETH",
        "amount": "0.5",
    });
    let response = router
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/admin/topups")
                .header("Content-Type", "application/json")
                .body(Body::from(payload.to_string()))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let body_bytes = response.into_body().collect().await.unwrap().to_bytes();
    let topup: Value = serde_json::from_slice(&body_bytes).unwrap();
    assert_eq!(topup["status"], "completed");
    assert_eq!(topup["amount"], "0.5");
    assert_eq!(topup["is_test"], false);

    assert_eq!(
        app.store
            .balance_amount(BalanceOwner::merchant(12), "ETH", 1),
        dec!(0.5)
    );
}

#[tokio::test]
async fn test_admin_topup_validation_error() {
    let app = app();
    let router = create_router(app.state);

    let payload = json!({
        "merchant_id": 0,
        "blockchain": "ETH",
        "ticker": "ETH",
        "amount": "0.5",
    });
    let response = router
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/admin/topups")
                .header("Content-Type", "application/json")
                .body(Body::from(payload.to_string()))
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_admin_topup_rejected_beyond_float() {
    let app = app();
    let eth = currency::find(Blockchain::Ethereum, "ETH").unwrap();
    let wallet = app
        .store
        .insert_wallet(Blockchain::Ethereum, WalletType::Inbound);
    app.store
        .insert_balance(wallet.owner(), eth, false, dec!(0.1));
    let router = create_router(app.state);

    let payload = json!({
        "merchant_id": 12,
        "blockchain": "ETH",
        "ticker": "ETH",
        "amount": "0.5",
    });
    let response = router
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/admin/topups")
                .header("Content-Type", "application/json")
                .body(Body::from(payload.to_string()))
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::PAYMENT_REQUIRED);

    let body_bytes = response.into_body().collect().await.unwrap().to_bytes();
    let error: Value = serde_json::from_slice(&body_bytes).unwrap();
    assert_eq!(error["error"]["type"], "insufficient_funds");
}

#[tokio::test]
async fn test_admin_system_balances_reports_float() {
    let app = app();
    let eth = currency::find(Blockchain::Ethereum, "ETH").unwrap();
    let usdt = currency::find(Blockchain::Ethereum, "USDT").unwrap();
    let wallet = app
        .store
        .insert_wallet(Blockchain::Ethereum, WalletType::Inbound);
    app.store
        .insert_balance(wallet.owner(), eth, false, dec!(1.5));
    app.store
        .insert_balance(wallet.owner(), usdt, false, dec!(250));
    app.store
        .insert_balance(BalanceOwner::merchant(3), eth, false, dec!(0.5));
    let router = create_router(app.state);

    let response = router
        .oneshot(
            Request::builder()
                .method("GET")
                .uri("/admin/system-balances")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let body_bytes = response.into_body().collect().await.unwrap().to_bytes();
    let report: Value = serde_json::from_slice(&body_bytes).unwrap();
    assert_eq!(report["count"], 2);

    let balances = report["balances"].as_array().unwrap();
    let eth_position = balances
        .iter()
        .find(|b| b["currency"] == "ETH")
        .expect("ETH position");
    // Wallet holdings minus the merchant claim.
    let amount: Decimal = eth_position["amount"].as_str().unwrap().parse().unwrap();
    assert_eq!(amount, dec!(1));
    assert_eq!(eth_position["blockchain"], "ETH");

    let usdt_position = balances
        .iter()
        .find(|b| b["currency"] == "USDT")
        .expect("USDT position");
    let amount: Decimal = usdt_position["amount"].as_str().unwrap().parse().unwrap();
    assert_eq!(amount, dec!(250));
}

#[tokio::test]
async fn test_swagger_ui_is_served() {
    let app = app();
    let router = create_router(app.state);

    let response = router
        .oneshot(
            Request::builder()
                .method("GET")
                .uri("/api-docs/openapi.json")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let body_bytes = response.into_body().collect().await.unwrap().to_bytes();
    let spec: Value = serde_json::from_slice(&body_bytes).unwrap();
    assert_eq!(spec["info"]["title"], "Settlement Engine API");
    assert!(spec["paths"].get("/admin/topups").is_some());
}

#[tokio::test]
async fn test_amount_survives_json_round_trip() {
    // The webhook body quotes amounts as strings; make sure the typed
    // parse keeps full precision end to end.
    let app = app();
    let wallet = app
        .store
        .insert_wallet(Blockchain::Ethereum, WalletType::Inbound);
    let router = create_router(app.state);

    let body = webhook_body(&wallet.address, "0xprecise", "0.123456789012345678");
    let response = router
        .oneshot(webhook_request(wallet.uuid, body, None))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NO_CONTENT);

    let recorded = &app.store.all_transactions()[0];
    let expected = Amount::crypto("ETH", dec!(0.123456789012345678), 18).unwrap();
    assert_eq!(recorded.amount, expected);
}
