//! Real-Time Portfolio Valuation & Streaming Hub (§4.3).

pub mod hub;

pub use hub::{
    snapshot_frames, AlertSeverity, Frame, PushOutcome, SessionQueue, StreamingHub,
    DEFAULT_QUEUE_CAPACITY, HEARTBEAT_INTERVAL, HEARTBEAT_TIMEOUT,
};
