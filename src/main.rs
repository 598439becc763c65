//! Application entry point.

use std::env;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use dotenvy::dotenv;
use rust_decimal::Decimal;
use secrecy::SecretString;
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use oxide_settlement::api::create_router;
use oxide_settlement::app::{
    AppState, Ledger, Processing, ProcessingConfig, SchedulerConfig, Transactions, Wallets,
    spawn_scheduler,
};
use oxide_settlement::infra::{
    EventBus, KmsClient, KmsConfig, LoggingEventHandler, NodeGatewayClient, NodeGatewayConfig,
    PaymentsClient, PaymentsConfig, PostgresConfig, PostgresStore, RatesClient, RatesConfig,
};

/// Application configuration
struct Config {
    database_url: String,
    host: String,
    port: u16,
    node_gateway: NodeGatewayConfig,
    kms: KmsConfig,
    rates: RatesConfig,
    /// Payments service connection (optional - uses mock mode if not set)
    payments: Option<PaymentsConfig>,
    /// Shared secret for webhook signatures (optional - auth disabled if not set)
    webhook_secret: Option<SecretString>,
    processing: ProcessingConfig,
    scheduler: SchedulerConfig,
}

impl Config {
    fn from_env() -> Result<Self> {
        let database_url = env::var("DATABASE_URL").context("DATABASE_URL not set")?;
        let host = env::var("HOST").unwrap_or_else(|_| "0.0.0.0".to_string());
        let port = env::var("PORT")
            .ok()
            .and_then(|p| p.parse().ok())
            .unwrap_or(3000);

        let node_gateway = NodeGatewayConfig {
            base_url: env::var("NODE_GATEWAY_URL").context("NODE_GATEWAY_URL not set")?,
            api_key: secret_var("NODE_GATEWAY_API_KEY"),
            callback_url: env::var("WEBHOOK_CALLBACK_URL")
                .ok()
                .filter(|u| !u.is_empty()),
        };

        let kms = KmsConfig {
            base_url: env::var("KMS_URL").context("KMS_URL not set")?,
            api_key: secret_var("KMS_API_KEY"),
        };

        let rates = RatesConfig {
            base_url: env::var("RATES_URL").context("RATES_URL not set")?,
            api_key: secret_var("RATES_API_KEY"),
        };

        // Payments service configuration (optional)
        let payments = env::var("PAYMENTS_URL")
            .ok()
            .filter(|u| !u.is_empty())
            .map(|base_url| PaymentsConfig {
                base_url,
                api_key: secret_var("PAYMENTS_API_KEY"),
            });

        let webhook_secret = secret_var("WEBHOOK_SECRET");

        let service_fee_rate = match env::var("SERVICE_FEE_RATE") {
            Ok(raw) => Decimal::from_str(raw.trim())
                .context("SERVICE_FEE_RATE is not a valid decimal")?,
            Err(_) => Decimal::ZERO,
        };
        anyhow::ensure!(
            service_fee_rate >= Decimal::ZERO && service_fee_rate < Decimal::ONE,
            "SERVICE_FEE_RATE must be in [0, 1), got {service_fee_rate}"
        );

        let defaults = ProcessingConfig::default();
        let processing = ProcessingConfig {
            service_fee_rate,
            batch_limit: parse_var("BATCH_LIMIT", defaults.batch_limit),
            sweep_page_size: parse_var("SWEEP_PAGE_SIZE", defaults.sweep_page_size),
        };

        let scheduler_defaults = SchedulerConfig::default();
        let scheduler = SchedulerConfig {
            enabled: env::var("ENABLE_SCHEDULER")
                .map(|v| v == "true" || v == "1")
                .unwrap_or(true),
            incoming_check_interval: duration_var(
                "INCOMING_CHECK_INTERVAL_SECS",
                scheduler_defaults.incoming_check_interval,
            ),
            progress_check_interval: duration_var(
                "PROGRESS_CHECK_INTERVAL_SECS",
                scheduler_defaults.progress_check_interval,
            ),
            transfer_interval: duration_var(
                "TRANSFER_INTERVAL_SECS",
                scheduler_defaults.transfer_interval,
            ),
        };

        Ok(Self {
            database_url,
            host,
            port,
            node_gateway,
            kms,
            rates,
            payments,
            webhook_secret,
            processing,
            scheduler,
        })
    }
}

fn secret_var(name: &str) -> Option<SecretString> {
    env::var(name)
        .ok()
        .filter(|s| !s.is_empty())
        .map(SecretString::from)
}

fn parse_var<T: FromStr>(name: &str, default: T) -> T {
    env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn duration_var(name: &str, default: Duration) -> Duration {
    env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .map(Duration::from_secs)
        .unwrap_or(default)
}

fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,tower_http=debug,sqlx=warn"));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C"),
        _ = terminate => info!("Received SIGTERM"),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv().ok();
    init_tracing();

    info!("🏗️  Settlement Engine v{}", env!("CARGO_PKG_VERSION"));

    let config = Config::from_env()?;

    info!("📦 Initializing infrastructure...");

    // Initialize database
    let store =
        Arc::new(PostgresStore::new(&config.database_url, PostgresConfig::default()).await?);
    store.run_migrations().await?;
    info!("   ✓ Database connected and migrations applied");

    // Exchange rates feed every fiat conversion, including gas pricing
    let converter = Arc::new(RatesClient::new(config.rates.clone())?);
    info!("   ✓ Rates client created");

    let gateway = Arc::new(NodeGatewayClient::new(
        config.node_gateway.clone(),
        Arc::clone(&converter) as _,
    )?);
    info!("   ✓ Node gateway client created");
    if config.node_gateway.callback_url.is_none() {
        warn!(
            "   ⚠ WEBHOOK_CALLBACK_URL not set - new wallet subscriptions will have no delivery target"
        );
    }

    let signer = Arc::new(KmsClient::new(config.kms.clone())?);
    info!("   ✓ Signing service client created");

    let payments = Arc::new(PaymentsClient::new(config.payments.clone())?);
    if config.payments.is_some() {
        info!("   ✓ Payments service client created");
    } else {
        warn!("   ⚠ Payments service client created (MOCK MODE - no PAYMENTS_URL)");
    }

    let events = Arc::new(EventBus::new().with_handler(Arc::new(LoggingEventHandler)));

    // Application services
    let ledger = Arc::new(Ledger::new(Arc::clone(&store) as _));
    let wallets = Arc::new(Wallets::new(
        Arc::clone(&store) as _,
        Arc::clone(&signer) as _,
        Arc::clone(&gateway) as _,
    ));
    let transactions = Arc::new(Transactions::new(
        Arc::clone(&store) as _,
        Arc::clone(&store) as _,
    ));
    let processing = Processing::new(
        Arc::clone(&ledger),
        Arc::clone(&wallets),
        Arc::clone(&transactions),
        Arc::clone(&converter) as _,
        Arc::clone(&gateway) as _,
        Arc::clone(&gateway) as _,
        Arc::clone(&payments) as _,
        Arc::clone(&events) as _,
        Arc::clone(&store) as _,
        config.processing.clone(),
    );
    info!(
        "   ✓ Processing services created (service fee rate: {})",
        config.processing.service_fee_rate
    );

    // Every chain needs its consolidation target before sweeps can run
    match processing.ensure_outbound_wallets().await {
        Ok(result) if result.total_errors() == 0 => {
            info!("   ✓ Outbound wallets provisioned");
        }
        Ok(result) => {
            warn!(
                errors = result.total_errors(),
                "   ⚠ Outbound wallet provisioning left gaps, sweeps on those chains will fail"
            );
        }
        Err(e) => {
            warn!(error = %e, "   ⚠ Outbound wallet provisioning failed, sweeps will fail");
        }
    }

    let app_state = AppState::new(
        Arc::new(processing.clone()),
        Arc::clone(&ledger),
        Arc::clone(&store) as _,
        Arc::clone(&gateway) as _,
    )
    .with_webhook_secret(config.webhook_secret.clone());

    if config.webhook_secret.is_some() {
        info!("   ✓ Webhook secret configured");
    } else {
        info!("   ○ Webhook secret not configured (webhook auth disabled)");
    }

    let app_state = Arc::new(app_state);

    // Start the batch scheduler
    let (scheduler_handle, scheduler_shutdown_tx) =
        spawn_scheduler(processing, config.scheduler.clone());
    if config.scheduler.enabled {
        info!("   ✓ Scheduler started");
    } else {
        info!("   ○ Scheduler disabled");
    }

    let router = create_router(app_state);

    let addr = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;

    info!("🚀 Server starting on http://{}", addr);
    info!("📖 Swagger UI available at http://{}/swagger-ui", addr);
    info!("📄 OpenAPI spec at http://{}/api-docs/openapi.json", addr);

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // Signal the scheduler and let in-flight jobs drain
    let _ = scheduler_shutdown_tx.send(true);
    let _ = scheduler_handle.await;

    info!("Server shutdown complete");
    Ok(())
}
