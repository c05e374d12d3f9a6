//! Domain event bus. Engines publish events; the streaming hub and the
//! alert pipeline consume them, breaking the direct-callback coupling
//! that the design notes (§9) call out.

use crate::domain::{Order, SyncStatus};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum DomainEvent {
    OrderFilled {
        order: Box<Order>,
        delta_filled: Decimal,
        fill_price: Decimal,
    },
    OrderStateChanged {
        order_id: Uuid,
        user_id: Uuid,
        state: crate::domain::OrderState,
    },
    AccountUpdated {
        account_id: Uuid,
        user_id: Uuid,
        sync_status: SyncStatus,
    },
    HoldingUpdated {
        account_id: Uuid,
        user_id: Uuid,
        symbol: String,
    },
    Alert {
        user_id: Option<Uuid>,
        id: Uuid,
        severity: AlertSeverity,
        title: String,
        body: String,
        symbol: Option<String>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertSeverity {
    Low,
    Medium,
    High,
    Critical,
}

impl DomainEvent {
    /// The user this event is scoped to, used by the streaming hub to
    /// route to the right set of sessions. `None` means broadcast-wide
    /// (not currently produced, but kept so routing logic has one place
    /// to extend for platform-wide alerts).
    pub fn user_id(&self) -> Option<Uuid> {
        match self {
            DomainEvent::OrderFilled { order, .. } => Some(order.user_id),
            DomainEvent::OrderStateChanged { user_id, .. } => Some(*user_id),
            DomainEvent::AccountUpdated { user_id, .. } => Some(*user_id),
            DomainEvent::HoldingUpdated { user_id, .. } => Some(*user_id),
            DomainEvent::Alert { user_id, .. } => *user_id,
        }
    }
}

/// Single in-process bus all engines publish onto. `tokio::sync::broadcast`
/// gives every subscriber its own FIFO-ordered receiver, matching the
/// ordering guarantee in §5 ("event-bus delivery within one subscriber is
/// FIFO w.r.t. publish order").
pub type EventBus = tokio::sync::broadcast::Sender<DomainEvent>;

pub fn new_bus(capacity: usize) -> EventBus {
    let (tx, _rx) = tokio::sync::broadcast::channel(capacity);
    tx
}
