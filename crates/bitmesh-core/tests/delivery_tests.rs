//! Delivery reliability scenarios: ack dedup and the favorite retry schedule

use bitmesh_core::config::{DeliveryConfig, RetryConfig};
use bitmesh_core::delivery::{DeliveryTracker, RetryQueue, TimeoutOutcome};
use bitmesh_core::protocol::ChatMessage;
use bitmesh_core::types::{PeerId, Timestamp};

fn private_message(id: &str) -> ChatMessage {
    ChatMessage {
        id: id.into(),
        sender: "alice".into(),
        content: "hello".into(),
        timestamp: 0,
        is_private: true,
        ..ChatMessage::default()
    }
}

#[test]
fn test_ack_dedup_removes_pending_exactly_once() {
    let mut tracker = DeliveryTracker::new(DeliveryConfig::default());
    let message = private_message("m1");
    let now = Timestamp::new(0);

    tracker.track_message(&message, "peer", "bob", true, now);
    let ack = DeliveryTracker::generate_ack(&message, "peer", "bob", 1, now);

    assert!(tracker.process_delivery_ack(&ack));
    assert!(!tracker.is_pending("m1"));

    // Replay of the same ack is a complete no-op, even if the message was
    // re-tracked meanwhile.
    tracker.track_message(&message, "peer", "bob", true, now);
    assert!(!tracker.process_delivery_ack(&ack));
    assert!(tracker.is_pending("m1"));
}

#[test]
fn test_favorite_retry_timeline() {
    // Message to a favorite at t=0, never acked: one retry fires at 2 s,
    // 4 s and 6 s, then the message is done.
    let mut queue = RetryQueue::new(RetryConfig::default());
    let mut tracker = DeliveryTracker::new(DeliveryConfig::default());
    let message = private_message("m1");
    let t0 = Timestamp::new(0);

    tracker.track_message(&message, "peer", "bob", true, t0);
    queue
        .add_message_for_retry(
            &message.content,
            &[],
            true,
            Some(PeerId::new([2; 8])),
            "bob",
            &message.id,
            0,
            t0,
        )
        .unwrap();

    let mut retry_times = Vec::new();
    for millis in (0..15_000).step_by(250) {
        let now = Timestamp::new(millis);
        for due in queue.process_retry_queue(now) {
            assert!(matches!(
                tracker.handle_timeout(&due.original_message_id),
                TimeoutOutcome::Retry { .. }
            ));
            retry_times.push(millis);
        }
    }

    assert_eq!(retry_times, vec![2_000, 4_000, 6_000]);
    assert!(queue.is_empty());
}

#[test]
fn test_non_favorite_is_single_shot() {
    let mut tracker = DeliveryTracker::new(DeliveryConfig::default());
    let message = private_message("m1");
    tracker.track_message(&message, "peer", "carol", false, Timestamp::new(0));

    assert_eq!(tracker.handle_timeout("m1"), TimeoutOutcome::Dropped);
    assert!(!tracker.is_pending("m1"));
}

#[test]
fn test_ack_arriving_mid_retry_cancels_the_rest() {
    let mut queue = RetryQueue::new(RetryConfig::default());
    let mut tracker = DeliveryTracker::new(DeliveryConfig::default());
    let message = private_message("m1");
    let t0 = Timestamp::new(0);

    tracker.track_message(&message, "peer", "bob", true, t0);
    queue
        .add_message_for_retry("hello", &[], true, None, "bob", "m1", 0, t0)
        .unwrap();

    // First retry fires.
    assert_eq!(queue.process_retry_queue(Timestamp::new(2_000)).len(), 1);

    // Ack lands before the second retry.
    let ack = DeliveryTracker::generate_ack(&message, "peer", "bob", 1, Timestamp::new(2_500));
    assert!(tracker.process_delivery_ack(&ack));
    queue.remove_by_original_id("m1");

    assert!(queue.process_retry_queue(Timestamp::new(10_000)).is_empty());
    assert!(!tracker.is_pending("m1"));
}
