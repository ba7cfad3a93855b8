//! Property-based invariants for the wire codecs, dedup filter, role
//! tie-break and the social-state machine.

use proptest::prelude::*;

use bitmesh_core::config::IdentityConfig;
use bitmesh_core::identity::{IdentityStore, MemoryBlobStore};
use bitmesh_core::noise::HandshakeCoordinator;
use bitmesh_core::protocol::packet::MessageType;
use bitmesh_core::protocol::{BloomFilter, ChatMessage, Packet, PacketFlags};
use bitmesh_core::types::{Fingerprint, PeerId, Timestamp, Ttl};
use bitmesh_core::NoiseRole;

// ----------------------------------------------------------------------------
// Strategies
// ----------------------------------------------------------------------------

fn message_type() -> impl Strategy<Value = MessageType> {
    prop::sample::select(vec![
        MessageType::Announce,
        MessageType::Leave,
        MessageType::Message,
        MessageType::FragmentStart,
        MessageType::FragmentContinue,
        MessageType::FragmentEnd,
        MessageType::DeliveryAck,
        MessageType::DeliveryStatusRequest,
        MessageType::ReadReceipt,
        MessageType::NoiseHandshakeInit,
        MessageType::NoiseHandshakeResp,
        MessageType::NoiseEncrypted,
        MessageType::NoiseIdentityAnnounce,
        MessageType::VersionHello,
        MessageType::VersionAck,
        MessageType::ProtocolAck,
        MessageType::ProtocolNack,
        MessageType::SystemValidation,
    ])
}

fn peer_id() -> impl Strategy<Value = PeerId> {
    any::<[u8; 8]>().prop_map(PeerId::new)
}

fn nonzero_peer_id() -> impl Strategy<Value = PeerId> {
    any::<[u8; 8]>()
        .prop_filter("recipient must not be all-zero", |bytes| {
            bytes != &[0u8; 8]
        })
        .prop_map(PeerId::new)
}

prop_compose! {
    fn packet()(
        message_type in message_type(),
        ttl in 0u8..=7,
        timestamp in any::<u64>(),
        sender in peer_id(),
        recipient in prop::option::of(nonzero_peer_id()),
        payload in prop::collection::vec(any::<u8>(), 0..256),
        signature in prop::option::of(any::<[u8; 32]>()),
    ) -> Packet {
        let mut flags = PacketFlags::NONE;
        if recipient.is_some() {
            flags = flags.with_recipient();
        }
        let signature = signature.map(|half| {
            let mut full = [0u8; 64];
            full[..32].copy_from_slice(&half);
            full[32..].copy_from_slice(&half);
            full
        });
        if signature.is_some() {
            flags = flags.with_signature();
        }
        Packet {
            version: 1,
            message_type,
            ttl: Ttl::new(ttl),
            flags,
            timestamp: Timestamp::new(timestamp),
            sender_id: sender,
            recipient_id: recipient,
            payload,
            signature,
        }
    }
}

prop_compose! {
    fn chat_message()(
        id in "[a-zA-Z0-9-]{1,40}",
        sender in "[a-zA-Z0-9 ]{1,24}",
        content in ".{0,200}",
        timestamp in any::<u64>(),
        is_relay in any::<bool>(),
        is_private in any::<bool>(),
        original_sender in prop::option::of("[a-z]{1,16}"),
        recipient_nickname in prop::option::of("[a-z]{1,16}"),
        sender_peer_id in prop::option::of("[0-9a-f]{16}"),
        mentions in prop::collection::vec("[a-z]{1,12}", 0..5),
    ) -> ChatMessage {
        ChatMessage {
            id,
            sender,
            content,
            timestamp,
            is_relay,
            is_private,
            original_sender,
            recipient_nickname,
            sender_peer_id,
            mentions,
        }
    }
}

// ----------------------------------------------------------------------------
// Properties
// ----------------------------------------------------------------------------

proptest! {
    /// Framing round-trip: parsing a framed packet reproduces it exactly.
    #[test]
    fn prop_packet_round_trip(packet in packet()) {
        let bytes = packet.frame().unwrap();
        let parsed = Packet::parse(&bytes).unwrap();
        prop_assert_eq!(parsed, packet);
    }

    /// Chat-message round-trip through the TLV codec.
    #[test]
    fn prop_chat_message_round_trip(message in chat_message()) {
        let decoded = ChatMessage::decode(&message.encode()).unwrap();
        prop_assert_eq!(decoded, message);
    }

    /// Bloom filters never report a false negative.
    #[test]
    fn prop_bloom_no_false_negative(
        items in prop::collection::vec(prop::collection::vec(any::<u8>(), 1..32), 1..200)
    ) {
        let mut filter = BloomFilter::new(1_000, 0.01);
        for item in &items {
            filter.insert(item);
        }
        for item in &items {
            prop_assert!(filter.contains(item));
        }
    }

    /// For any distinct pair, the roles are antisymmetric and exactly one
    /// side initiates.
    #[test]
    fn prop_role_tie_break_antisymmetric(a in peer_id(), b in peer_id()) {
        prop_assume!(a != b);
        let role_ab = HandshakeCoordinator::determine_role(&a, &b);
        let role_ba = HandshakeCoordinator::determine_role(&b, &a);
        prop_assert_ne!(role_ab, role_ba);
        let initiators = [role_ab, role_ba]
            .iter()
            .filter(|role| **role == NoiseRole::Initiator)
            .count();
        prop_assert_eq!(initiators, 1);
    }

    /// After any sequence of favorite/block mutations, a blocked peer is
    /// never a favorite.
    #[test]
    fn prop_blocked_never_favorite(
        operations in prop::collection::vec((0u8..4, any::<bool>()), 0..50)
    ) {
        let mut store = IdentityStore::new(
            Box::new(MemoryBlobStore::new()),
            IdentityConfig::default(),
            Timestamp::new(0),
        );
        let fingerprint = Fingerprint::new([7; 32]);
        let mut now = Timestamp::new(1);

        for (op, value) in operations {
            now = now.plus_millis(10);
            match op {
                0 => store.set_favorite(&fingerprint, value, now),
                1 => store.set_blocked(&fingerprint, value, now),
                2 => store.set_verified(&fingerprint, value, now),
                _ => {
                    let mut identity = store.get_social_identity(&fingerprint);
                    identity.is_favorite = value;
                    store.update_social_identity(identity, now);
                }
            }
            if store.is_blocked(&fingerprint) {
                prop_assert!(!store.is_favorite(&fingerprint));
            }
        }
    }

    /// TTL decrement is monotone and bottoms out at zero.
    #[test]
    fn prop_ttl_decrements_to_none(start in 0u8..=255) {
        let mut ttl = Ttl::new(start);
        let mut steps = 0u16;
        while let Some(next) = ttl.decrement() {
            prop_assert_eq!(next.value(), ttl.value() - 1);
            ttl = next;
            steps += 1;
        }
        prop_assert_eq!(ttl.value(), 0);
        prop_assert_eq!(steps, start as u16);
    }
}
