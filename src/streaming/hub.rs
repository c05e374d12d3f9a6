//! Real-time streaming hub (§4.3): fans domain events out to per-user
//! WebSocket sessions with a bounded, backpressure-aware queue per session.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex as SyncMutex, RwLock};
use rust_decimal::Decimal;
use serde::Serialize;
use tokio::sync::Notify;
use tracing::{info, warn};
use uuid::Uuid;

use crate::aggregation::AggregationEngine;
use crate::events::{AlertSeverity as BusAlertSeverity, DomainEvent};
use crate::market_data::MarketDataCache;

pub const DEFAULT_QUEUE_CAPACITY: usize = 256;
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(20);
pub const HEARTBEAT_TIMEOUT: Duration = Duration::from_secs(45);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertSeverity {
    Low,
    Medium,
    High,
    Critical,
}

impl From<BusAlertSeverity> for AlertSeverity {
    fn from(s: BusAlertSeverity) -> Self {
        match s {
            BusAlertSeverity::Low => AlertSeverity::Low,
            BusAlertSeverity::Medium => AlertSeverity::Medium,
            BusAlertSeverity::High => AlertSeverity::High,
            BusAlertSeverity::Critical => AlertSeverity::Critical,
        }
    }
}

/// One outbound message, per the frame table in §4.3.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Frame {
    PortfolioUpdate {
        total_value: Decimal,
        day_change: Decimal,
        day_change_pct: Decimal,
        market_open: bool,
    },
    PriceUpdate {
        prices: HashMap<String, Decimal>,
    },
    ChartData {
        timeframe: String,
        points: Vec<(DateTime<Utc>, Decimal)>,
    },
    Alert {
        id: Uuid,
        severity: AlertSeverity,
        title: String,
        body: String,
        symbol: Option<String>,
        timestamp: DateTime<Utc>,
    },
    Pong,
    Ping,
}

impl Frame {
    /// Critical alerts are the one frame kind the hub will never drop
    /// (§4.3 "Backpressure").
    fn is_critical(&self) -> bool {
        matches!(self, Frame::Alert { severity: AlertSeverity::Critical, .. })
    }
}

pub enum PushOutcome {
    Admitted,
    AdmittedDroppedOldest,
    DroppedIncoming,
    Terminate,
}

/// Bounded per-session frame queue with drop-oldest-non-critical
/// backpressure. A plain `mpsc` channel can't evict from the middle, so
/// this keeps its own deque behind a lock plus a `Notify` for the reader.
pub struct SessionQueue {
    inner: SyncMutex<VecDeque<Frame>>,
    notify: Notify,
    capacity: usize,
    lag: AtomicU64,
    closed: std::sync::atomic::AtomicBool,
}

impl SessionQueue {
    fn new(capacity: usize) -> Self {
        Self {
            inner: SyncMutex::new(VecDeque::with_capacity(capacity)),
            notify: Notify::new(),
            capacity,
            lag: AtomicU64::new(0),
            closed: std::sync::atomic::AtomicBool::new(false),
        }
    }

    pub fn lag(&self) -> u64 {
        self.lag.load(Ordering::Relaxed)
    }

    pub fn push(&self, frame: Frame) -> PushOutcome {
        let mut q = self.inner.lock();
        if q.len() < self.capacity {
            q.push_back(frame);
            drop(q);
            self.notify.notify_one();
            return PushOutcome::Admitted;
        }

        match q.iter().position(|f| !f.is_critical()) {
            Some(pos) => {
                q.remove(pos);
                q.push_back(frame);
                self.lag.fetch_add(1, Ordering::Relaxed);
                drop(q);
                self.notify.notify_one();
                PushOutcome::AdmittedDroppedOldest
            }
            None if frame.is_critical() => PushOutcome::Terminate,
            None => PushOutcome::DroppedIncoming,
        }
    }

    /// Waits for and returns the next frame, or `None` once `close()` has
    /// been called and the queue has drained.
    pub async fn recv(&self) -> Option<Frame> {
        loop {
            {
                let mut q = self.inner.lock();
                if let Some(frame) = q.pop_front() {
                    return Some(frame);
                }
                if self.closed.load(Ordering::Relaxed) {
                    return None;
                }
            }
            self.notify.notified().await;
        }
    }

    pub fn close(&self) {
        self.closed.store(true, Ordering::Relaxed);
        self.notify.notify_one();
    }
}

struct Session {
    user_id: Uuid,
    queue: Arc<SessionQueue>,
}

/// Per-user fan-out registry. `spawn_bus_listener` wires a subscription
/// to the shared event bus so engines never talk to sessions directly.
pub struct StreamingHub {
    sessions: RwLock<HashMap<Uuid, Session>>,
    by_user: RwLock<HashMap<Uuid, HashSet<Uuid>>>,
}

impl StreamingHub {
    pub fn new() -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            by_user: RwLock::new(HashMap::new()),
        }
    }

    /// Registers a fresh session for `user_id`. Per §4.3 "Heartbeat &
    /// reconnection", every reconnect is treated as brand new — no sticky
    /// state carries over.
    pub fn register(&self, user_id: Uuid) -> (Uuid, Arc<SessionQueue>) {
        let session_id = Uuid::new_v4();
        let queue = Arc::new(SessionQueue::new(DEFAULT_QUEUE_CAPACITY));
        self.sessions.write().insert(
            session_id,
            Session {
                user_id,
                queue: queue.clone(),
            },
        );
        self.by_user.write().entry(user_id).or_default().insert(session_id);
        (session_id, queue)
    }

    pub fn unregister(&self, session_id: Uuid) {
        if let Some(session) = self.sessions.write().remove(&session_id) {
            session.queue.close();
            if let Some(set) = self.by_user.write().get_mut(&session.user_id) {
                set.remove(&session_id);
            }
        }
    }

    fn all_sessions(&self) -> Vec<(Uuid, Arc<SessionQueue>)> {
        self.sessions
            .read()
            .iter()
            .map(|(id, s)| (*id, s.queue.clone()))
            .collect()
    }

    fn sessions_for(&self, user_id: Uuid) -> Vec<(Uuid, Arc<SessionQueue>)> {
        let by_user = self.by_user.read();
        let Some(ids) = by_user.get(&user_id) else {
            return Vec::new();
        };
        let sessions = self.sessions.read();
        ids.iter()
            .filter_map(|id| sessions.get(id).map(|s| (*id, s.queue.clone())))
            .collect()
    }

    /// Routes one frame to every session the user currently has open.
    /// Sessions that can't admit a critical alert are torn down — the
    /// client is expected to reconnect and resubscribe (§4.3).
    pub fn publish_to_user(&self, user_id: Uuid, frame: Frame) {
        for (session_id, queue) in self.sessions_for(user_id) {
            match queue.push(frame.clone()) {
                PushOutcome::Terminate => {
                    warn!(%session_id, %user_id, "session queue saturated with critical alerts, terminating");
                    self.unregister(session_id);
                }
                PushOutcome::DroppedIncoming | PushOutcome::AdmittedDroppedOldest => {
                    // lag already recorded on the queue; nothing further to do.
                }
                PushOutcome::Admitted => {}
            }
        }
    }

    /// Routes one frame to every open session regardless of user, for
    /// platform-wide alerts (§4.3, `DomainEvent::Alert { user_id: None }`).
    pub fn publish_broadcast(&self, frame: Frame) {
        for (session_id, queue) in self.all_sessions() {
            if let PushOutcome::Terminate = queue.push(frame.clone()) {
                warn!(%session_id, "session queue saturated with critical alerts, terminating");
                self.unregister(session_id);
            }
        }
    }

    /// Converts one domain event into the frames it should push. Alerts
    /// translate directly; order/account/holding events instead trigger a
    /// fresh portfolio recompute, since none of them carry the recomputed
    /// totals themselves.
    async fn frames_for_event(
        event: &DomainEvent,
        user_id: Uuid,
        aggregation: &AggregationEngine,
        market_data: &MarketDataCache,
    ) -> Vec<Frame> {
        match event {
            DomainEvent::Alert {
                id,
                severity,
                title,
                body,
                symbol,
                ..
            } => vec![Frame::Alert {
                id: *id,
                severity: (*severity).into(),
                title: title.clone(),
                body: body.clone(),
                symbol: symbol.clone(),
                timestamp: Utc::now(),
            }],
            DomainEvent::OrderFilled { .. }
            | DomainEvent::OrderStateChanged { .. }
            | DomainEvent::AccountUpdated { .. }
            | DomainEvent::HoldingUpdated { .. } => {
                snapshot_frames(aggregation, market_data, user_id, None).await
            }
        }
    }

    /// Spawns the task that subscribes to the shared bus and fans every
    /// event out to the relevant user's sessions, for the lifetime of the
    /// returned `JoinHandle`'s owner.
    pub fn spawn_bus_listener(
        self: &Arc<Self>,
        bus: crate::events::EventBus,
        aggregation: Arc<AggregationEngine>,
        market_data: Arc<MarketDataCache>,
    ) -> tokio::task::JoinHandle<()> {
        let hub = self.clone();
        let mut rx = bus.subscribe();
        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(event) => match event.user_id() {
                        Some(user_id) => {
                            for frame in
                                Self::frames_for_event(&event, user_id, &aggregation, &market_data).await
                            {
                                hub.publish_to_user(user_id, frame);
                            }
                        }
                        None => {
                            if let DomainEvent::Alert {
                                id,
                                severity,
                                title,
                                body,
                                symbol,
                                ..
                            } = &event
                            {
                                hub.publish_broadcast(Frame::Alert {
                                    id: *id,
                                    severity: (*severity).into(),
                                    title: title.clone(),
                                    body: body.clone(),
                                    symbol: symbol.clone(),
                                    timestamp: Utc::now(),
                                });
                            }
                        }
                    },
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                        warn!(skipped = n, "streaming hub lagged behind the event bus");
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => {
                        info!("event bus closed, streaming hub listener exiting");
                        break;
                    }
                }
            }
        })
    }
}

/// Builds the full snapshot of frames for a user: current portfolio value,
/// latest known prices per symbol held, and (when a timeframe is given) a
/// chart point. Shared between the websocket handler's initial/subscribe
/// snapshot and the bus listener's recompute on domain events.
pub async fn snapshot_frames(
    aggregation: &AggregationEngine,
    market_data: &MarketDataCache,
    user_id: Uuid,
    timeframe: Option<&str>,
) -> Vec<Frame> {
    let mut frames = Vec::new();
    match aggregation.unified_view(user_id).await {
        Ok(view) => {
            frames.push(Frame::PortfolioUpdate {
                total_value: view.total_value,
                // No historical baseline is tracked in-process; a real
                // deployment would diff against yesterday's close.
                day_change: Decimal::ZERO,
                day_change_pct: Decimal::ZERO,
                market_open: true,
            });
            let mut prices: HashMap<String, Decimal> = HashMap::new();
            for holding in &view.holdings {
                if let Some(price) = market_data.get(&holding.symbol) {
                    prices.insert(holding.symbol.clone(), price);
                }
            }
            if !prices.is_empty() {
                frames.push(Frame::PriceUpdate { prices });
            }
            if let Some(timeframe) = timeframe {
                // There's no stored price history to chart against; the
                // single point is the latest known total value so a
                // subscribing client has something to plot as further
                // pushes arrive.
                frames.push(Frame::ChartData {
                    timeframe: timeframe.to_string(),
                    points: vec![(Utc::now(), view.total_value)],
                });
            }
        }
        Err(err) => warn!(%user_id, error = %err, "failed to build portfolio snapshot"),
    }
    frames
}

impl Default for StreamingHub {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn low_alert() -> Frame {
        Frame::Alert {
            id: Uuid::new_v4(),
            severity: AlertSeverity::Low,
            title: "t".into(),
            body: "b".into(),
            symbol: None,
            timestamp: Utc::now(),
        }
    }

    fn critical_alert() -> Frame {
        Frame::Alert {
            id: Uuid::new_v4(),
            severity: AlertSeverity::Critical,
            title: "t".into(),
            body: "b".into(),
            symbol: None,
            timestamp: Utc::now(),
        }
    }

    #[test]
    fn drops_oldest_non_critical_when_full() {
        let q = SessionQueue::new(2);
        assert!(matches!(q.push(low_alert()), PushOutcome::Admitted));
        assert!(matches!(q.push(low_alert()), PushOutcome::Admitted));
        assert!(matches!(q.push(low_alert()), PushOutcome::AdmittedDroppedOldest));
        assert_eq!(q.lag(), 1);
    }

    #[test]
    fn terminates_when_queue_is_all_critical_and_full() {
        let q = SessionQueue::new(1);
        assert!(matches!(q.push(critical_alert()), PushOutcome::Admitted));
        assert!(matches!(q.push(critical_alert()), PushOutcome::Terminate));
    }

    #[tokio::test]
    async fn register_and_publish_routes_to_session() {
        let hub = StreamingHub::new();
        let user_id = Uuid::new_v4();
        let (_session_id, queue) = hub.register(user_id);
        hub.publish_to_user(user_id, low_alert());
        let frame = queue.recv().await;
        assert!(matches!(frame, Some(Frame::Alert { .. })));
    }
}
