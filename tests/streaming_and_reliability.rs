//! Streaming hub backpressure and circuit breaker integration tests (§4.3, §4.4).

use uuid::Uuid;
use vp_core::reliability::{BreakerConfig, BreakerRegistry, BreakerState};
use vp_core::streaming::{AlertSeverity, Frame, PushOutcome, StreamingHub, DEFAULT_QUEUE_CAPACITY};

#[test]
fn session_queue_drops_oldest_non_critical_frame_once_full() {
    let hub = StreamingHub::new();
    let user_id = Uuid::new_v4();
    let (_session_id, queue) = hub.register(user_id);

    for i in 0..DEFAULT_QUEUE_CAPACITY {
        let outcome = queue.push(Frame::PriceUpdate {
            prices: [("AAPL".to_string(), rust_decimal_macros::dec!(150))].into_iter().collect(),
        });
        assert!(matches!(outcome, PushOutcome::Admitted), "frame {i} should still fit under capacity");
    }

    // Queue is now full; the next non-critical frame evicts the oldest.
    let outcome = queue.push(Frame::Ping);
    assert!(matches!(outcome, PushOutcome::AdmittedDroppedOldest));
    assert_eq!(queue.lag(), 1);
}

#[test]
fn session_queue_never_drops_critical_alerts_it_terminates_instead() {
    let hub = StreamingHub::new();
    let user_id = Uuid::new_v4();
    let (_session_id, queue) = hub.register(user_id);

    for _ in 0..DEFAULT_QUEUE_CAPACITY {
        let outcome = queue.push(Frame::Alert {
            id: Uuid::new_v4(),
            severity: AlertSeverity::Critical,
            title: "drift".to_string(),
            body: "position drift detected".to_string(),
            symbol: None,
            timestamp: chrono::Utc::now(),
        });
        assert!(matches!(outcome, PushOutcome::Admitted));
    }

    // Queue is saturated with nothing but critical alerts: can't evict
    // anything non-critical to make room for one more.
    let outcome = queue.push(Frame::Alert {
        id: Uuid::new_v4(),
        severity: AlertSeverity::Critical,
        title: "drift".to_string(),
        body: "position drift detected".to_string(),
        symbol: None,
        timestamp: chrono::Utc::now(),
    });
    assert!(matches!(outcome, PushOutcome::Terminate));
}

#[tokio::test]
async fn registered_session_receives_frames_published_to_its_user() {
    let hub = StreamingHub::new();
    let user_id = Uuid::new_v4();
    let (_session_id, queue) = hub.register(user_id);

    hub.publish_to_user(user_id, Frame::Pong);
    let frame = queue.recv().await.expect("frame delivered");
    assert!(matches!(frame, Frame::Pong));
}

#[test]
fn circuit_breaker_opens_after_the_configured_consecutive_failures() {
    let registry = BreakerRegistry::new(BreakerConfig {
        consecutive_failure_threshold: 3,
        ..BreakerConfig::default()
    });
    let breaker = registry.get("custodian-x");
    assert_eq!(breaker.state(), BreakerState::Closed);

    breaker.record_failure();
    breaker.record_failure();
    assert_eq!(breaker.state(), BreakerState::Closed, "below threshold, still closed");

    breaker.record_failure();
    assert_eq!(breaker.state(), BreakerState::Open);
    assert!(!breaker.allow_request(), "an open breaker must reject immediately");
}

#[test]
fn circuit_breaker_success_resets_the_consecutive_failure_count() {
    let registry = BreakerRegistry::new(BreakerConfig {
        consecutive_failure_threshold: 2,
        ..BreakerConfig::default()
    });
    let breaker = registry.get("broker-y");

    breaker.record_failure();
    breaker.record_success();
    breaker.record_failure();
    assert_eq!(
        breaker.state(),
        BreakerState::Closed,
        "a success between failures should reset the consecutive-failure streak"
    );
}

#[test]
fn registry_hands_out_one_breaker_per_name() {
    let registry = BreakerRegistry::new(BreakerConfig::default());
    let a = registry.get("broker");
    let b = registry.get("broker");
    let c = registry.get("custodian");

    a.record_failure();
    assert!(std::sync::Arc::ptr_eq(&a, &b), "same name must return the same breaker instance");
    assert!(!std::sync::Arc::ptr_eq(&a, &c), "different names must get independent breakers");
}
