//! Handshake arbitration scenarios

use bitmesh_core::config::HandshakeConfig;
use bitmesh_core::noise::{HandshakeCoordinator, HandshakePhase};
use bitmesh_core::types::{PeerId, Timestamp};
use bitmesh_core::NoiseRole;

fn peer(name: &str) -> PeerId {
    PeerId::from_bytes(name.as_bytes())
}

const T0: Timestamp = Timestamp::new(1_000_000);

#[test]
fn test_tie_break_aaa_initiates_zzz_responds() {
    let aaa = peer("AAA");
    let zzz = peer("ZZZ");

    assert_eq!(
        HandshakeCoordinator::determine_role(&aaa, &zzz),
        NoiseRole::Initiator
    );
    assert_eq!(
        HandshakeCoordinator::determine_role(&zzz, &aaa),
        NoiseRole::Responder
    );

    // Both sides ask at the same moment: only AAA goes ahead.
    let coordinator_a = HandshakeCoordinator::new(HandshakeConfig::default());
    let coordinator_z = HandshakeCoordinator::new(HandshakeConfig::default());
    assert!(coordinator_a.should_initiate(&aaa, &zzz, false, T0));
    assert!(!coordinator_z.should_initiate(&zzz, &aaa, false, T0));
}

#[test]
fn test_retry_lifecycle_to_exhaustion() {
    let me = peer("AAA");
    let remote = peer("ZZZ");
    let mut coordinator = HandshakeCoordinator::new(HandshakeConfig::default());
    let mut now = T0;

    for attempt in 1..=3u32 {
        assert!(
            coordinator.should_initiate(&me, &remote, false, now),
            "attempt {attempt} should be allowed"
        );
        coordinator.record_initiation(remote, now);
        assert_eq!(coordinator.phase(&remote), HandshakePhase::Initiating);

        now = now.plus_millis(11_000);
        coordinator.record_failure(remote, "no response", now);
        now = now.plus_millis(3_000);
    }

    // Three failed attempts: retries exhausted for good.
    assert!(!coordinator.should_initiate(&me, &remote, false, now));
    assert!(!coordinator.should_initiate(&me, &remote, false, now.plus_millis(600_000)));
    assert_eq!(coordinator.retry_delay_remaining(&remote, now), None);
}

#[test]
fn test_stale_scan_reports_and_clears() {
    let remote = peer("ZZZ");
    let mut coordinator = HandshakeCoordinator::new(HandshakeConfig::default());

    coordinator.record_initiation(remote, T0);
    assert!(coordinator.cleanup_stale(T0.plus_millis(29_999)).is_empty());

    let stale = coordinator.cleanup_stale(T0.plus_millis(30_001));
    assert_eq!(stale, vec![remote]);
    // The record is gone, so a fresh initiation is allowed immediately.
    assert!(coordinator.should_initiate(&peer("AAA"), &remote, false, T0.plus_millis(30_001)));
}

#[test]
fn test_success_clears_attempt_accounting() {
    let remote = peer("ZZZ");
    let mut coordinator = HandshakeCoordinator::new(HandshakeConfig::default());

    coordinator.record_initiation(remote, T0);
    coordinator.record_failure(remote, "transient", T0.plus_millis(100));
    coordinator.record_initiation(remote, T0.plus_millis(2_200));
    coordinator.record_success(remote, T0.plus_millis(2_500));

    assert_eq!(coordinator.phase(&remote), HandshakePhase::Established);
    assert_eq!(coordinator.retry_count(&remote), 0);
    assert!(!coordinator.should_accept_initiation(&remote));
}
