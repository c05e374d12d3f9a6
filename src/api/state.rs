//! Shared application state handed to every protected HTTP/WS handler.

use std::collections::HashMap;
use std::sync::Arc;

use crate::aggregation::AggregationEngine;
use crate::market_data::MarketDataCache;
use crate::orders::OrderEngine;
use crate::reliability::BreakerRegistry;
use crate::scheduler::JobScheduler;
use crate::store::Store;
use crate::streaming::StreamingHub;
use crate::telemetry::{AlertPipeline, MetricsRegistry};

#[derive(Clone)]
pub struct ApiState {
    pub store: Store,
    pub orders: Arc<OrderEngine>,
    pub aggregation: Arc<AggregationEngine>,
    pub streaming: Arc<StreamingHub>,
    pub scheduler: Arc<JobScheduler>,
    pub market_data: Arc<MarketDataCache>,
    pub breakers: BreakerRegistry,
    pub metrics: Arc<MetricsRegistry>,
    pub alerts: Arc<AlertPipeline>,
    /// Custodian names the aggregation engine has an adapter for, used
    /// only to enumerate breaker targets on the detailed health endpoint.
    pub custodian_names: Vec<String>,
    /// Per-custodian webhook HMAC secrets, keyed by custodian name. A
    /// custodian with no entry here is a configuration error (§6), not a
    /// reason to accept unsigned webhooks.
    pub webhook_secrets: Arc<HashMap<String, String>>,
}
