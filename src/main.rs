//! Investment management backend core: order lifecycle, account
//! aggregation/reconciliation, portfolio valuation streaming, and the
//! job scheduler that drives them, behind one HTTP/WS surface.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use futures_util::future::BoxFuture;
use rand::Rng;
use rust_decimal::Decimal;
use tokio::net::TcpListener;
use tracing::info;

use vp_core::aggregation::{AggregationEngine, CustodianAdapter, ManualCustodian, PlaidLikeCustodian};
use vp_core::api::{self, ApiState};
use vp_core::auth::{AuthState, JwtHandler, UserStore};
use vp_core::config::Config;
use vp_core::error::AppError;
use vp_core::events;
use vp_core::market_data::MarketDataCache;
use vp_core::orders::{OrderEngine, SimBroker};
use vp_core::reliability::{BreakerConfig, BreakerRegistry};
use vp_core::scheduler::{JobDefinition, JobScheduler};
use vp_core::store::Store;
use vp_core::streaming::StreamingHub;
use vp_core::telemetry::{AlertPipeline, BusAlertSink, MetricKind, MetricsRegistry};

/// Symbols the paper broker and market data cache are seeded with at
/// boot. A real deployment replaces this with a venue quote feed; there
/// is none here, so `refresh_market_data` below just walks these.
const SEED_SYMBOLS: &[(&str, &str)] = &[
    ("AAPL", "190.50"),
    ("MSFT", "415.20"),
    ("SPY", "560.10"),
    ("VTI", "275.40"),
    ("BND", "72.85"),
];

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env().context("failed to load configuration")?;
    vp_core::telemetry::logging::init(&config.log_level);

    info!(environment = %config.environment, port = config.port, "starting core backend");

    // Auth owns its own SQLite file and must initialize before the main
    // store opens a connection to the same data directory.
    let auth_db_path = format!("{}.auth", config.database_path);
    let user_store = Arc::new(UserStore::new(&auth_db_path).context("failed to init user store")?);
    let jwt_handler = Arc::new(JwtHandler::new(config.jwt_signing_key.clone()));
    let auth_state = AuthState::new(user_store.clone(), jwt_handler.clone());
    info!(path = %auth_db_path, "auth store initialized");

    let store = Store::open(&config.database_path).context("failed to open store")?;
    info!(path = %config.database_path, "store initialized");

    let bus = events::new_bus(1024);
    let breakers = BreakerRegistry::new(BreakerConfig::default());
    let market_data = Arc::new(MarketDataCache::new());

    let broker = Arc::new(SimBroker::new());
    for (symbol, price) in SEED_SYMBOLS {
        let price: Decimal = price.parse().expect("seed price literal parses");
        broker.set_reference_price(symbol, price);
        market_data.set(symbol, price);
    }

    let order_engine = Arc::new(OrderEngine::new(
        store.clone(),
        bus.clone(),
        broker.clone(),
        breakers.clone(),
        market_data.clone(),
    ));

    let mut custodians: HashMap<String, Arc<dyn CustodianAdapter>> = HashMap::new();
    for custodian_cfg in &config.custodians {
        custodians.insert(
            custodian_cfg.name.clone(),
            Arc::new(PlaidLikeCustodian::new(custodian_cfg.name.clone())),
        );
    }
    custodians.insert("manual".to_string(), Arc::new(ManualCustodian));
    let custodian_names: Vec<String> = custodians.keys().cloned().collect();

    let webhook_secrets: HashMap<String, String> = config
        .custodians
        .iter()
        .map(|c| (c.name.clone(), c.webhook_secret.clone()))
        .collect();

    let aggregation = Arc::new(AggregationEngine::new(
        store.clone(),
        bus.clone(),
        custodians,
        breakers.clone(),
    ));

    let metrics = Arc::new(MetricsRegistry::new());
    let alerts = Arc::new(AlertPipeline::new(Box::new(BusAlertSink::new(bus.clone()))));

    let streaming = Arc::new(StreamingHub::new());
    streaming.spawn_bus_listener(bus.clone(), aggregation.clone(), market_data.clone());

    let mut scheduler = JobScheduler::new(store.clone(), 4);

    {
        let aggregation = aggregation.clone();
        let metrics = metrics.clone();
        let alerts = alerts.clone();
        scheduler.register(JobDefinition {
            name: "reconcile_all_accounts".to_string(),
            interval: Duration::from_secs(24 * 3600),
            reentrant: false,
            run: Arc::new(move || -> BoxFuture<'static, Result<String, AppError>> {
                let aggregation = aggregation.clone();
                let metrics = metrics.clone();
                let alerts = alerts.clone();
                Box::pin(async move {
                    let results = aggregation.sync_all_active().await;
                    let total = results.len();
                    let failed = results.iter().filter(|(_, r)| r.is_err()).count();
                    let now_ms = chrono::Utc::now().timestamp_millis();
                    metrics.record("reconcile.accounts_total", MetricKind::Gauge, total as f64, now_ms);
                    metrics.record("reconcile.accounts_failed", MetricKind::Gauge, failed as f64, now_ms);
                    let failure_rate = if total > 0 { failed as f64 / total as f64 } else { 0.0 };
                    alerts.evaluate(
                        "reconcile.failure_rate_high",
                        failure_rate > 0.2,
                        format!("{failed}/{total} accounts failed to reconcile in the daily run"),
                        vp_core::error::Severity::High,
                    );
                    Ok(format!("{} synced, {} failed", total - failed, failed))
                })
            }),
        });
    }

    {
        let order_engine = order_engine.clone();
        scheduler.register(JobDefinition {
            name: "expire_day_orders".to_string(),
            interval: Duration::from_secs(24 * 3600),
            reentrant: false,
            run: Arc::new(move || -> BoxFuture<'static, Result<String, AppError>> {
                let order_engine = order_engine.clone();
                Box::pin(async move {
                    let n = order_engine.expire_day_orders().await?;
                    Ok(format!("{n} day orders expired"))
                })
            }),
        });
    }

    {
        let market_data = market_data.clone();
        let broker = broker.clone();
        scheduler.register(JobDefinition {
            name: "refresh_market_data".to_string(),
            interval: Duration::from_secs(3600),
            reentrant: false,
            run: Arc::new(move || -> BoxFuture<'static, Result<String, AppError>> {
                let market_data = market_data.clone();
                let broker = broker.clone();
                Box::pin(async move {
                    let mut rng = rand::thread_rng();
                    let mut updated = 0usize;
                    for (symbol, _) in SEED_SYMBOLS {
                        if let Some(current) = market_data.get(symbol) {
                            // +/-1%, expressed in basis points to stay in decimal arithmetic.
                            let drift_bp: i64 = rng.gen_range(-100..=100);
                            let factor = Decimal::ONE + Decimal::new(drift_bp, 4);
                            let next = (current * factor).round_dp(4);
                            market_data.set(symbol, next);
                            broker.set_reference_price(symbol, next);
                            updated += 1;
                        }
                    }
                    Ok(format!("{updated} symbols refreshed"))
                })
            }),
        });
    }

    let scheduler = Arc::new(scheduler);
    let _job_handles = scheduler.clone().spawn_all();

    let api_state = ApiState {
        store: store.clone(),
        orders: order_engine,
        aggregation,
        streaming,
        scheduler,
        market_data,
        breakers,
        metrics,
        alerts,
        custodian_names,
        webhook_secrets: Arc::new(webhook_secrets),
    };

    let metrics_handle = metrics_exporter_prometheus::PrometheusBuilder::new()
        .install_recorder()
        .context("failed to install metrics recorder")?;

    let app = api::build_router(
        api_state,
        auth_state,
        jwt_handler,
        &config.allowed_cors_origins,
        metrics_handle,
    );

    let addr = format!("0.0.0.0:{}", config.port);
    let listener = TcpListener::bind(&addr).await.context("failed to bind listener")?;
    info!(%addr, "api server listening");

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await
    .context("server error")?;

    Ok(())
}
