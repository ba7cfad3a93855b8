//! Noise XX interop between independent session instances
//!
//! Two managers playing initiator and responder must converge on the same
//! transcript hash and on transport ciphers that invert each other.

use bitmesh_core::noise::{
    HandshakeCoordinator, NoiseKeyPair, NoiseSessionManager, SessionState,
};
use bitmesh_core::types::PeerId;
use bitmesh_core::NoiseRole;

fn alice_and_bob() -> (NoiseSessionManager, NoiseSessionManager, PeerId, PeerId) {
    // Fixed static keys make the static halves reproducible; ephemerals are
    // fresh per handshake, as the pattern requires.
    let initiator_static = NoiseKeyPair::from_bytes(&[0x01; 32]);
    let responder_static = NoiseKeyPair::from_bytes(&[0x02; 32]);
    let alice_id = PeerId::new([0xA1; 8]);
    let bob_id = PeerId::new([0xB2; 8]);
    (
        NoiseSessionManager::new(initiator_static),
        NoiseSessionManager::new(responder_static),
        alice_id,
        bob_id,
    )
}

fn handshake(
    alice: &mut NoiseSessionManager,
    bob: &mut NoiseSessionManager,
    alice_id: PeerId,
    bob_id: PeerId,
) {
    // -> e
    let msg1 = alice.initiate_handshake(bob_id).unwrap().unwrap();
    // <- e, ee, s, es
    let msg2 = bob
        .handle_incoming_handshake(alice_id, &msg1)
        .unwrap()
        .unwrap();
    // -> s, se
    let msg3 = alice
        .handle_incoming_handshake(bob_id, &msg2)
        .unwrap()
        .unwrap();
    assert!(bob
        .handle_incoming_handshake(alice_id, &msg3)
        .unwrap()
        .is_none());
}

#[test]
fn test_xx_message_sizes() {
    let (mut alice, mut bob, alice_id, bob_id) = alice_and_bob();

    let msg1 = alice.initiate_handshake(bob_id).unwrap().unwrap();
    assert_eq!(msg1.len(), 32); // e

    let msg2 = bob
        .handle_incoming_handshake(alice_id, &msg1)
        .unwrap()
        .unwrap();
    assert_eq!(msg2.len(), 96); // e ‖ encrypted s ‖ tag

    let msg3 = alice
        .handle_incoming_handshake(bob_id, &msg2)
        .unwrap()
        .unwrap();
    assert_eq!(msg3.len(), 64); // encrypted s ‖ tag
}

#[test]
fn test_handshake_hashes_match() {
    let (mut alice, mut bob, alice_id, bob_id) = alice_and_bob();
    handshake(&mut alice, &mut bob, alice_id, bob_id);

    let alice_hash = alice.handshake_hash(&bob_id).unwrap();
    let bob_hash = bob.handshake_hash(&alice_id).unwrap();
    assert_eq!(alice_hash, bob_hash);
    assert_ne!(alice_hash, [0u8; 32]);
}

#[test]
fn test_transport_ciphers_invert_each_other() {
    let (mut alice, mut bob, alice_id, bob_id) = alice_and_bob();
    handshake(&mut alice, &mut bob, alice_id, bob_id);

    // Counter 0: 3-byte plaintext becomes a 19-byte ciphertext.
    let ciphertext = alice.encrypt(&bob_id, b"foo").unwrap();
    assert_eq!(ciphertext.len(), 19);
    assert_eq!(bob.decrypt(&alice_id, &ciphertext).unwrap(), b"foo");

    let reply = bob.encrypt(&alice_id, b"bar").unwrap();
    assert_eq!(alice.decrypt(&bob_id, &reply).unwrap(), b"bar");

    // Counters advance independently per direction.
    for round in 0u32..16 {
        let plaintext = round.to_be_bytes();
        let ciphertext = alice.encrypt(&bob_id, &plaintext).unwrap();
        assert_eq!(bob.decrypt(&alice_id, &ciphertext).unwrap(), plaintext);
    }
}

#[test]
fn test_both_sides_learn_remote_statics() {
    let (mut alice, mut bob, alice_id, bob_id) = alice_and_bob();
    let alice_static = alice.local_key().public_key_bytes();
    let bob_static = bob.local_key().public_key_bytes();
    handshake(&mut alice, &mut bob, alice_id, bob_id);

    assert_eq!(
        alice.get(&bob_id).unwrap().remote_static().copied(),
        Some(bob_static)
    );
    assert_eq!(
        bob.get(&alice_id).unwrap().remote_static().copied(),
        Some(alice_static)
    );

    // Fingerprints derive from the statics and cross-match.
    let alice_view = alice.get(&bob_id).unwrap().peer_fingerprint().cloned();
    assert_eq!(
        alice_view,
        Some(bitmesh_core::noise::generate_fingerprint(bob_static))
    );
}

#[test]
fn test_replayed_handshake_message_fails_cleanly() {
    let (mut alice, mut bob, alice_id, bob_id) = alice_and_bob();
    let msg1 = alice.initiate_handshake(bob_id).unwrap().unwrap();
    bob.handle_incoming_handshake(alice_id, &msg1).unwrap();

    // Feeding message one again mid-pattern is a protocol violation.
    assert!(bob.handle_incoming_handshake(alice_id, &msg1).is_err());
    assert_eq!(bob.get(&alice_id).unwrap().state(), SessionState::Failed);
}

#[test]
fn test_role_assignment_matches_session_roles() {
    let (mut alice, mut bob, alice_id, bob_id) = alice_and_bob();
    handshake(&mut alice, &mut bob, alice_id, bob_id);

    assert_eq!(alice.get(&bob_id).unwrap().role(), NoiseRole::Initiator);
    assert_eq!(bob.get(&alice_id).unwrap().role(), NoiseRole::Responder);

    // The coordinator would have assigned the same roles from the IDs.
    assert_eq!(
        HandshakeCoordinator::determine_role(&alice_id, &bob_id),
        NoiseRole::Initiator
    );
}
