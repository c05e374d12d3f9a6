//! Account Aggregation & Reconciliation Engine (§4.2).

pub mod custodian;
pub mod rebalance;
pub mod sync;

pub use custodian::{CustodianAdapter, LinkSession, ManualCustodian, PlaidLikeCustodian};
pub use rebalance::{compute_recommendations, RebalancePriority, RebalanceRecommendation};
pub use sync::{AggregatedHolding, AggregationEngine, UnifiedView};
