//! The per-packet router
//!
//! Single-threaded, run-to-completion glue for the whole core. Three kinds
//! of events drive it: incoming transport bytes, the periodic tick, and
//! application sends. Handlers are synchronous; outbound bytes and
//! UI-visible updates accumulate on queues the host drains after each call.
//! A handler error never escapes: it becomes a counter and, where tied to a
//! peer or message, an app-visible status.

use std::collections::BTreeMap;
use std::collections::BTreeSet;

use tracing::{debug, warn};
use uuid::Uuid;

use crate::config::ProtocolConfig;
use crate::delivery::{DeliveryTracker, RetryQueue, TimeoutOutcome};
use crate::errors::{MeshError, ParseError, Result};
use crate::identity::{BlobStore, HandshakeState, IdentityStore, STATIC_KEY_KEY};
use crate::noise::{
    generate_fingerprint, HandshakeCoordinator, IdentityKeyPair, NoiseKeyPair, NoiseSessionManager,
};
use crate::protocol::compression;
use crate::protocol::fragmentation::{split_frame, FragmentReassembler, FRAGMENT_HEADER_SIZE};
use crate::protocol::message::{
    ChatMessage, DeliveryAck, NoiseIdentityAnnouncement, ProtocolAck, ProtocolNack, ReadReceipt,
    VersionAck, VersionHello,
};
use crate::protocol::packet::{MessageType, Packet, PacketFlags};
use crate::protocol::{BloomFilter, PacketId};
use crate::transport::{AppEvent, DeliveryStatus, Effect, DEFAULT_MTU};
use crate::types::{Fingerprint, PeerId, Timestamp};

/// Bound on the in-memory message log
const MESSAGE_LOG_CAP: usize = 500;

// ----------------------------------------------------------------------------
// Counters
// ----------------------------------------------------------------------------

/// Per-router counters. Errors inside handlers land here instead of
/// propagating.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RouterStats {
    pub packets_received: u64,
    pub parse_failures: u64,
    pub unknown_type_dropped: u64,
    pub duplicates_dropped: u64,
    pub relayed: u64,
    pub messages_delivered: u64,
    pub decrypt_failures: u64,
}

// ----------------------------------------------------------------------------
// Router
// ----------------------------------------------------------------------------

/// Validates, decrypts and dispatches every packet, decrements TTL for mesh
/// relay, and owns all protocol subsystems.
pub struct Router {
    my_peer_id: PeerId,
    nickname: String,
    config: ProtocolConfig,
    mtu: u16,

    sessions: NoiseSessionManager,
    identity_keys: IdentityKeyPair,
    coordinator: HandshakeCoordinator,
    identity: IdentityStore,
    tracker: DeliveryTracker,
    retry_queue: RetryQueue,
    dedup: BloomFilter,
    reassembler: FragmentReassembler,

    peers: BTreeSet<PeerId>,
    messages: Vec<ChatMessage>,
    private_chats: BTreeMap<String, Vec<ChatMessage>>,

    effects: Vec<Effect>,
    app_events: Vec<AppEvent>,
    stats: RouterStats,
    last_sent: Timestamp,
}

impl Router {
    /// Boot the core. The static Noise key is loaded from the blob store
    /// (key `"static_key"`) or generated and persisted on first boot; the
    /// identity cache is loaded from the same store.
    pub fn new(
        my_peer_id: PeerId,
        nickname: impl Into<String>,
        mut storage: Box<dyn BlobStore>,
        config: ProtocolConfig,
        now: Timestamp,
    ) -> Self {
        let static_key = Self::load_or_create_static_key(&mut *storage);
        let identity = IdentityStore::new(storage, config.identity.clone(), now);

        Self {
            my_peer_id,
            nickname: nickname.into(),
            mtu: DEFAULT_MTU,
            sessions: NoiseSessionManager::new(static_key),
            identity_keys: IdentityKeyPair::generate(),
            coordinator: HandshakeCoordinator::new(config.handshake.clone()),
            identity,
            tracker: DeliveryTracker::new(config.delivery.clone()),
            retry_queue: RetryQueue::new(config.retry.clone()),
            dedup: BloomFilter::new(config.dedup.expected_items, config.dedup.false_positive_rate),
            reassembler: FragmentReassembler::new(),
            peers: BTreeSet::new(),
            messages: Vec::new(),
            private_chats: BTreeMap::new(),
            effects: Vec::new(),
            app_events: Vec::new(),
            stats: RouterStats::default(),
            last_sent: Timestamp::new(0),
            config,
        }
    }

    fn load_or_create_static_key(storage: &mut dyn BlobStore) -> NoiseKeyPair {
        match storage.load(STATIC_KEY_KEY) {
            Ok(Some(blob)) if blob.len() == 32 => {
                let mut key = [0u8; 32];
                key.copy_from_slice(&blob);
                return NoiseKeyPair::from_bytes(&key);
            }
            Ok(Some(_)) => warn!("stored static key has wrong length, regenerating"),
            Ok(None) => {}
            Err(err) => warn!(%err, "static key load failed, regenerating"),
        }
        let key = NoiseKeyPair::generate();
        if let Err(err) = storage.store(STATIC_KEY_KEY, &key.private_key_bytes()) {
            warn!(%err, "static key persist failed");
        }
        key
    }

    // ------------------------------------------------------------------------
    // Host surface
    // ------------------------------------------------------------------------

    /// Drain the pending transport effects.
    pub fn take_effects(&mut self) -> Vec<Effect> {
        core::mem::take(&mut self.effects)
    }

    /// Drain the pending app events.
    pub fn take_app_events(&mut self) -> Vec<AppEvent> {
        core::mem::take(&mut self.app_events)
    }

    pub fn stats(&self) -> &RouterStats {
        &self.stats
    }

    pub fn my_peer_id(&self) -> PeerId {
        self.my_peer_id
    }

    pub fn peers(&self) -> Vec<PeerId> {
        self.peers.iter().copied().collect()
    }

    /// The transport's advertised MTU, driving fragmentation.
    pub fn set_mtu(&mut self, mtu: u16) {
        self.mtu = mtu.max((FRAGMENT_HEADER_SIZE + 32) as u16);
    }

    /// True when the host may enter low-power sleep: nothing queued to send
    /// and no retry due within the next two seconds.
    pub fn can_sleep(&self, now: Timestamp) -> bool {
        if !self.effects.is_empty() {
            return false;
        }
        match self.retry_queue.next_deadline() {
            Some(deadline) => deadline.as_millis() > now.plus_millis(2_000).as_millis(),
            None => true,
        }
    }

    // ------------------------------------------------------------------------
    // Application surface
    // ------------------------------------------------------------------------

    pub fn set_nickname(&mut self, nickname: impl Into<String>) {
        self.nickname = nickname.into();
    }

    /// Broadcast a public chat message. Returns the message ID.
    pub fn send_public(&mut self, content: &str, now: Timestamp) -> Result<String> {
        let message = ChatMessage {
            id: Uuid::new_v4().to_string(),
            sender: self.nickname.clone(),
            content: content.to_string(),
            timestamp: now.as_millis(),
            sender_peer_id: Some(self.my_peer_id.to_string()),
            ..ChatMessage::default()
        };

        let mut packet = Packet::broadcast(
            MessageType::Message,
            self.my_peer_id,
            now,
            message.encode(),
        );
        Self::apply_compression(&mut packet);
        self.push_message(message.clone());
        self.send_packet(packet)?;
        Ok(message.id)
    }

    /// Send a private message. Encrypted when a session is established;
    /// tracked for delivery, and queued for retry when the recipient is a
    /// favorite.
    pub fn send_private(
        &mut self,
        recipient: PeerId,
        content: &str,
        now: Timestamp,
    ) -> Result<String> {
        let recipient_nickname = self.nickname_for(&recipient);
        let message = ChatMessage {
            id: Uuid::new_v4().to_string(),
            sender: self.nickname.clone(),
            content: content.to_string(),
            timestamp: now.as_millis(),
            is_private: true,
            recipient_nickname: Some(recipient_nickname.clone()),
            sender_peer_id: Some(self.my_peer_id.to_string()),
            ..ChatMessage::default()
        };

        let is_favorite = self
            .identity
            .fingerprint_for_peer(&recipient)
            .map(|fingerprint| self.identity.is_favorite(fingerprint))
            .unwrap_or(false);

        self.tracker.track_message(
            &message,
            &recipient.to_string(),
            &recipient_nickname,
            is_favorite,
            now,
        );
        if is_favorite {
            // Queue full or already queued: the message still goes out once.
            if let Err(err) = self.retry_queue.add_message_for_retry(
                content,
                &message.mentions,
                true,
                Some(recipient),
                &recipient_nickname,
                &message.id,
                message.timestamp,
                now,
            ) {
                debug!(%err, "retry enqueue refused");
            }
        }

        self.push_message(message.clone());
        self.send_private_payload(recipient, &message, now)?;
        Ok(message.id)
    }

    /// Broadcast our presence.
    pub fn announce(&mut self, now: Timestamp) -> Result<()> {
        let packet = Packet::broadcast(
            MessageType::Announce,
            self.my_peer_id,
            now,
            self.nickname.clone().into_bytes(),
        );
        self.send_packet(packet)
    }

    /// Broadcast a graceful departure.
    pub fn leave(&mut self, now: Timestamp) -> Result<()> {
        let packet = Packet::broadcast(MessageType::Leave, self.my_peer_id, now, Vec::new());
        self.send_packet(packet)
    }

    pub fn set_favorite(&mut self, fingerprint: &Fingerprint, favorite: bool, now: Timestamp) {
        self.identity.set_favorite(fingerprint, favorite, now);
    }

    pub fn set_blocked(&mut self, fingerprint: &Fingerprint, blocked: bool, now: Timestamp) {
        self.identity.set_blocked(fingerprint, blocked, now);
    }

    pub fn set_verified(&mut self, fingerprint: &Fingerprint, verified: bool, now: Timestamp) {
        self.identity.set_verified(fingerprint, verified, now);
    }

    /// All messages seen, oldest first.
    pub fn messages(&self) -> &[ChatMessage] {
        &self.messages
    }

    /// Private conversations keyed by the remote peer ID (hex).
    pub fn private_chats(&self) -> &BTreeMap<String, Vec<ChatMessage>> {
        &self.private_chats
    }

    /// Read-only access to the identity store.
    pub fn identity(&self) -> &IdentityStore {
        &self.identity
    }

    /// Panic wipe: identities, sessions, retry state.
    pub fn clear_all_data(&mut self) {
        self.identity.clear_all_identity_data();
        self.retry_queue.clear_retry_queue();
        self.coordinator.clear_all();
        self.messages.clear();
        self.private_chats.clear();
    }

    // ------------------------------------------------------------------------
    // Transport events
    // ------------------------------------------------------------------------

    /// A peer appeared. Registers the session and, when the tie-break says
    /// we initiate, starts the handshake.
    pub fn on_peer_connect(&mut self, peer_id: PeerId, now: Timestamp) {
        self.peers.insert(peer_id);
        self.identity.register_ephemeral_session(peer_id, now);
        self.emit_peer_list();
        self.maybe_initiate_handshake(peer_id, false, now);
    }

    /// A peer went away. Its transient state dies with it; social identity
    /// remains keyed by fingerprint.
    pub fn on_peer_disconnect(&mut self, peer_id: PeerId) {
        self.peers.remove(&peer_id);
        self.identity.remove_ephemeral_session(&peer_id);
        self.sessions.remove(&peer_id);
        self.coordinator.reset_state(&peer_id);
        self.emit_peer_list();
    }

    /// Ingress entry point. Never fails outward; errors become counters.
    pub fn handle_incoming(&mut self, bytes: &[u8], _rssi: i16, now: Timestamp) {
        self.stats.packets_received += 1;
        if let Err(err) = self.process_frame(bytes, now) {
            match &err {
                MeshError::Parse(ParseError::UnknownMessageType(_)) => {
                    self.stats.unknown_type_dropped += 1;
                }
                MeshError::Parse(_) => self.stats.parse_failures += 1,
                MeshError::Crypto(_) => self.stats.decrypt_failures += 1,
                _ => {}
            }
            debug!(%err, "packet dropped");
        }
    }

    /// Deadline driver. Runs the coordinator stale scan, retry queue,
    /// delivery cleanup, reassembly expiry and the coalesced identity save.
    pub fn tick(&mut self, now: Timestamp) {
        // Stale handshakes: drop the records, fail the sessions, tell the app.
        for peer_id in self.coordinator.cleanup_stale(now) {
            self.sessions.remove(&peer_id);
            self.identity.update_handshake_state(
                &peer_id,
                HandshakeState::Failed {
                    reason: "handshake timed out".to_string(),
                },
                now,
            );
            self.app_events.push(AppEvent::HandshakeFailed {
                peer_id,
                reason: "handshake timed out".to_string(),
            });
        }

        // Retry pass: re-send due messages, surface exhaustion.
        let max_retries = self.config.retry.max_retries;
        for retryable in self.retry_queue.process_retry_queue(now) {
            match self.tracker.handle_timeout(&retryable.original_message_id) {
                TimeoutOutcome::Retry { retry_count } => {
                    self.app_events.push(AppEvent::DeliveryStatusChanged {
                        message_id: retryable.original_message_id.clone(),
                        status: DeliveryStatus::Retrying {
                            attempt: retry_count,
                        },
                    });
                    if let Some(recipient) = retryable.recipient_peer_id {
                        let message = ChatMessage {
                            id: retryable.original_message_id.clone(),
                            sender: self.nickname.clone(),
                            content: retryable.content.clone(),
                            timestamp: retryable.original_timestamp,
                            is_private: true,
                            recipient_nickname: Some(retryable.recipient_nickname.clone()),
                            sender_peer_id: Some(self.my_peer_id.to_string()),
                            mentions: retryable.mentions.clone(),
                            ..ChatMessage::default()
                        };
                        if let Err(err) = self.send_private_payload(recipient, &message, now) {
                            debug!(%err, "retry send failed");
                        }
                    }
                }
                TimeoutOutcome::Dropped | TimeoutOutcome::NotTracked => {}
            }
            if retryable.retry_count >= max_retries {
                self.app_events.push(AppEvent::DeliveryStatusChanged {
                    message_id: retryable.original_message_id.clone(),
                    status: DeliveryStatus::Undelivered,
                });
            }
        }

        // Re-initiate handshakes whose retry delay has passed.
        let candidates: Vec<PeerId> = self.peers.iter().copied().collect();
        for peer_id in candidates {
            let established = self
                .sessions
                .get(&peer_id)
                .is_some_and(|session| session.is_established());
            if !established {
                self.maybe_initiate_handshake(peer_id, true, now);
            }
        }

        self.tracker.cleanup_old_deliveries(now);
        self.reassembler
            .cleanup_expired(now, self.config.fragment.reassembly_timeout_ms);
        self.identity.tick(now);
    }

    // ------------------------------------------------------------------------
    // Ingress pipeline
    // ------------------------------------------------------------------------

    fn process_frame(&mut self, bytes: &[u8], now: Timestamp) -> Result<()> {
        let packet = Packet::parse(bytes)?;

        // Duplicate suppression on (sender, timestamp).
        let packet_id = PacketId::new(&packet.sender_id, packet.timestamp);
        if self.dedup.contains(packet_id.as_bytes()) {
            self.stats.duplicates_dropped += 1;
            debug!(sender = %packet.sender_id, "duplicate packet dropped");
            return Ok(());
        }
        self.dedup.insert(packet_id.as_bytes());

        let addressed_to_us = packet.recipient_id == Some(self.my_peer_id);
        if addressed_to_us || packet.is_broadcast() {
            // Inflate for local dispatch only; relayed copies keep the
            // original payload bytes. Compression under encryption is
            // undone after decryption, inside the handler.
            let mut local = packet.clone();
            if local.flags.is_compressed() && !local.flags.is_encrypted() {
                local.payload = compression::decompress(&local.payload)?;
                local.flags = local.flags.without_compression();
            }
            self.dispatch(&local, now)?;
        }

        // Relay after local processing, so duplicates we originate are
        // already marked in the dedup filter.
        self.maybe_relay(&packet, addressed_to_us)?;
        Ok(())
    }

    fn maybe_relay(&mut self, packet: &Packet, addressed_to_us: bool) -> Result<()> {
        let relay_wanted = if packet.is_broadcast() {
            packet.message_type.is_relay_eligible()
        } else {
            // Forward directed packets that are not for us.
            !addressed_to_us
        };
        if !relay_wanted {
            return Ok(());
        }
        let Some(ttl) = packet.ttl.decrement() else {
            return Ok(());
        };

        let mut relayed = packet.clone();
        relayed.ttl = ttl;
        let bytes = relayed.frame()?;
        self.effects.push(Effect::Broadcast(bytes));
        self.stats.relayed += 1;
        Ok(())
    }

    fn dispatch(&mut self, packet: &Packet, now: Timestamp) -> Result<()> {
        match packet.message_type {
            MessageType::Announce => self.handle_announce(packet, now),
            MessageType::Leave => self.handle_leave(packet),
            MessageType::Message => self.handle_chat_message(packet, now),
            MessageType::FragmentStart
            | MessageType::FragmentContinue
            | MessageType::FragmentEnd => self.handle_fragment(packet, now),
            MessageType::DeliveryAck => self.handle_delivery_ack(packet, now),
            MessageType::NoiseHandshakeInit => self.handle_handshake_init(packet, now),
            MessageType::NoiseHandshakeResp => self.handle_handshake_resp(packet, now),
            MessageType::NoiseEncrypted => self.handle_noise_encrypted(packet, now),
            MessageType::NoiseIdentityAnnounce => self.handle_identity_announce(packet, now),
            MessageType::ReadReceipt => {
                // Decoded for validity; read state is a UI concern.
                let receipt = ReadReceipt::decode(&packet.payload)?;
                debug!(message_id = %receipt.original_message_id, "read receipt");
                Ok(())
            }
            MessageType::ProtocolAck => {
                let ack = ProtocolAck::decode(&packet.payload)?;
                debug!(packet_id = %ack.original_packet_id, "protocol ack");
                Ok(())
            }
            MessageType::ProtocolNack => {
                let nack = ProtocolNack::decode(&packet.payload)?;
                debug!(packet_id = %nack.original_packet_id, reason = %nack.reason, "protocol nack");
                Ok(())
            }
            MessageType::VersionHello => {
                let hello = VersionHello::decode(&packet.payload)?;
                debug!(preferred = hello.preferred_version, "version hello");
                Ok(())
            }
            MessageType::VersionAck => {
                let ack = VersionAck::decode(&packet.payload)?;
                debug!(agreed = ack.agreed_version, "version ack");
                Ok(())
            }
            MessageType::DeliveryStatusRequest | MessageType::SystemValidation => {
                debug!(message_type = ?packet.message_type, "no-op control packet");
                Ok(())
            }
        }
    }

    // ------------------------------------------------------------------------
    // Handlers
    // ------------------------------------------------------------------------

    fn handle_announce(&mut self, packet: &Packet, now: Timestamp) -> Result<()> {
        let peer_id = packet.sender_id;
        let nickname = String::from_utf8_lossy(&packet.payload).into_owned();

        let newly_seen = self.peers.insert(peer_id);
        if self.identity.ephemeral_session(&peer_id).is_none() {
            self.identity.register_ephemeral_session(peer_id, now);
        }
        if let Some(fingerprint) = self.identity.fingerprint_for_peer(&peer_id).cloned() {
            let mut social = self.identity.get_social_identity(&fingerprint);
            if social.claimed_nickname != nickname {
                social.claimed_nickname = nickname;
                self.identity.update_social_identity(social, now);
            }
        }
        if newly_seen {
            self.emit_peer_list();
        }
        self.maybe_initiate_handshake(peer_id, false, now);
        Ok(())
    }

    fn handle_leave(&mut self, packet: &Packet) -> Result<()> {
        let peer_id = packet.sender_id;
        if self.peers.remove(&peer_id) {
            self.identity.remove_ephemeral_session(&peer_id);
            self.sessions.remove(&peer_id);
            self.coordinator.reset_state(&peer_id);
            self.emit_peer_list();
        }
        Ok(())
    }

    fn handle_chat_message(&mut self, packet: &Packet, now: Timestamp) -> Result<()> {
        let payload = self.open_payload(packet, now)?;
        let message = ChatMessage::decode(&payload)?;

        // Blocked peers are silently ignored.
        if let Some(fingerprint) = self.identity.fingerprint_for_peer(&packet.sender_id) {
            if self.identity.is_blocked(fingerprint) {
                debug!(peer = %packet.sender_id, "message from blocked peer dropped");
                return Ok(());
            }
        }

        self.stats.messages_delivered += 1;
        self.push_message(message.clone());
        self.app_events
            .push(AppEvent::MessageReceived(message.clone()));

        // Private messages addressed to us are acked immediately.
        if message.is_private && packet.recipient_id == Some(self.my_peer_id) {
            let ack = DeliveryTracker::generate_ack(
                &message,
                &self.my_peer_id.to_string(),
                &self.nickname.clone(),
                0,
                now,
            );
            self.tracker.record_sent_ack(&ack.ack_id);
            self.send_ack(packet.sender_id, &ack, now)?;
        }
        Ok(())
    }

    fn handle_fragment(&mut self, packet: &Packet, now: Timestamp) -> Result<()> {
        if let Some(frame) =
            self.reassembler
                .add_fragment(packet.message_type, &packet.payload, now)?
        {
            // The reassembled unit is a complete outer frame; run it through
            // the full pipeline (it has its own dedup identity).
            self.process_frame(&frame, now)?;
        }
        Ok(())
    }

    fn handle_delivery_ack(&mut self, packet: &Packet, now: Timestamp) -> Result<()> {
        let payload = self.open_payload(packet, now)?;
        let ack = DeliveryAck::decode(&payload)?;
        if self.tracker.process_delivery_ack(&ack) {
            self.retry_queue
                .remove_by_original_id(&ack.original_message_id);
            self.app_events.push(AppEvent::DeliveryStatusChanged {
                message_id: ack.original_message_id,
                status: DeliveryStatus::Delivered,
            });
        }
        Ok(())
    }

    fn handle_handshake_init(&mut self, packet: &Packet, now: Timestamp) -> Result<()> {
        let peer_id = packet.sender_id;
        if self.coordinator.is_duplicate_handshake_message(&packet.payload) {
            debug!(peer = %peer_id, "duplicate handshake init dropped");
            return Ok(());
        }
        if !self.coordinator.should_accept_initiation(&peer_id) {
            debug!(peer = %peer_id, "handshake init refused (already established)");
            return Ok(());
        }

        if self.identity.ephemeral_session(&peer_id).is_none() {
            self.identity.register_ephemeral_session(peer_id, now);
        }
        self.identity
            .update_handshake_state(&peer_id, HandshakeState::InProgress, now);
        self.coordinator.record_response(peer_id, now);

        // Crossed initiations: an incoming init means the remote holds the
        // initiator role, so any half-open initiator session of ours loses.
        if self
            .sessions
            .get(&peer_id)
            .is_some_and(|session| {
                session.role() == crate::noise::NoiseRole::Initiator && !session.is_established()
            })
        {
            self.sessions.remove(&peer_id);
        }

        match self.sessions.handle_incoming_handshake(peer_id, &packet.payload) {
            Ok(Some(response)) => {
                let reply = Packet::directed(
                    MessageType::NoiseHandshakeResp,
                    self.my_peer_id,
                    peer_id,
                    now,
                    response,
                );
                self.send_packet(reply)?;
            }
            Ok(None) => {}
            Err(err) => {
                self.coordinator
                    .record_failure(peer_id, err.to_string(), now);
                return Err(err);
            }
        }
        self.after_handshake_progress(peer_id, now)
    }

    fn handle_handshake_resp(&mut self, packet: &Packet, now: Timestamp) -> Result<()> {
        let peer_id = packet.sender_id;
        if self.coordinator.is_duplicate_handshake_message(&packet.payload) {
            debug!(peer = %peer_id, "duplicate handshake message dropped");
            return Ok(());
        }

        match self.sessions.handle_incoming_handshake(peer_id, &packet.payload) {
            Ok(Some(response)) => {
                let reply = Packet::directed(
                    MessageType::NoiseHandshakeResp,
                    self.my_peer_id,
                    peer_id,
                    now,
                    response,
                );
                self.send_packet(reply)?;
            }
            Ok(None) => {}
            Err(err) => {
                self.coordinator
                    .record_failure(peer_id, err.to_string(), now);
                return Err(err);
            }
        }
        self.after_handshake_progress(peer_id, now)
    }

    fn handle_noise_encrypted(&mut self, packet: &Packet, now: Timestamp) -> Result<()> {
        let plaintext = self.decrypt_from(packet.sender_id, &packet.payload, now)?;
        // The container holds a complete inner frame; dispatch it locally
        // without another dedup or relay pass.
        let inner = Packet::parse(&plaintext)?;
        self.dispatch(&inner, now)
    }

    fn handle_identity_announce(&mut self, packet: &Packet, now: Timestamp) -> Result<()> {
        let peer_id = packet.sender_id;
        let announcement = NoiseIdentityAnnouncement::decode(&packet.payload)?;

        let Some(handshake_hash) = self.sessions.handshake_hash(&peer_id) else {
            debug!(peer = %peer_id, "identity announce without established session");
            return Ok(());
        };
        announcement.verify(&handshake_hash)?;

        let public_key: [u8; 32] = announcement
            .public_key
            .as_slice()
            .try_into()
            .map_err(|_| MeshError::malformed("announced public key"))?;
        crate::noise::validate_public_key(&public_key)?;
        // The announced static must be the one the handshake authenticated.
        if self
            .sessions
            .get(&peer_id)
            .and_then(|session| session.remote_static().copied())
            != Some(public_key)
        {
            return Err(MeshError::Crypto(
                crate::errors::CryptoError::SignatureInvalid,
            ));
        }

        let fingerprint = generate_fingerprint(public_key);
        let mut social = self.identity.get_social_identity(&fingerprint);
        social.claimed_nickname = announcement.nickname.clone();
        self.identity.update_social_identity(social, now);
        self.identity.update_handshake_state(
            &peer_id,
            HandshakeState::Completed {
                fingerprint: fingerprint.clone(),
            },
            now,
        );

        // Peer rotated its transient ID: move the live session over.
        if !announcement.previous_peer_id.is_empty() {
            if let Some(previous) = peer_from_hex(&announcement.previous_peer_id) {
                self.sessions.migrate_session(&previous, peer_id);
                self.peers.remove(&previous);
                self.peers.insert(peer_id);
            }
        }

        self.app_events.push(AppEvent::PeerIdentityVerified {
            peer_id,
            fingerprint,
            nickname: announcement.nickname,
        });
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Handshake driving
    // ------------------------------------------------------------------------

    fn maybe_initiate_handshake(&mut self, peer_id: PeerId, force_if_stale: bool, now: Timestamp) {
        if !self
            .coordinator
            .should_initiate(&self.my_peer_id, &peer_id, force_if_stale, now)
        {
            return;
        }
        match self.sessions.initiate_handshake(peer_id) {
            Ok(Some(first_message)) => {
                self.coordinator.record_initiation(peer_id, now);
                self.identity
                    .update_handshake_state(&peer_id, HandshakeState::InProgress, now);
                let packet = Packet::directed(
                    MessageType::NoiseHandshakeInit,
                    self.my_peer_id,
                    peer_id,
                    now,
                    first_message,
                );
                if let Err(err) = self.send_packet(packet) {
                    warn!(%err, peer = %peer_id, "handshake init send failed");
                }
            }
            Ok(None) => {}
            Err(err) => {
                self.coordinator
                    .record_failure(peer_id, err.to_string(), now);
                if self.coordinator.retry_delay_remaining(&peer_id, now).is_none() {
                    self.app_events.push(AppEvent::HandshakeFailed {
                        peer_id,
                        reason: err.to_string(),
                    });
                }
            }
        }
    }

    /// After any handshake message: if the session just became established,
    /// record success, bind the fingerprint, and announce our identity over
    /// the fresh channel.
    fn after_handshake_progress(&mut self, peer_id: PeerId, now: Timestamp) -> Result<()> {
        let Some(session) = self.sessions.get(&peer_id) else {
            return Ok(());
        };
        if !session.is_established() {
            return Ok(());
        }
        if self.coordinator.phase(&peer_id) == crate::noise::HandshakePhase::Established {
            return Ok(());
        }

        let fingerprint = session.peer_fingerprint().cloned();
        self.coordinator.record_success(peer_id, now);
        if let Some(fingerprint) = fingerprint {
            self.identity.update_handshake_state(
                &peer_id,
                HandshakeState::Completed { fingerprint },
                now,
            );
        }
        self.send_identity_announcement(peer_id, now)
    }

    fn send_identity_announcement(&mut self, peer_id: PeerId, now: Timestamp) -> Result<()> {
        let Some(handshake_hash) = self.sessions.handshake_hash(&peer_id) else {
            return Ok(());
        };
        let mut announcement = NoiseIdentityAnnouncement {
            peer_id: self.my_peer_id.to_string(),
            public_key: self.sessions.local_key().public_key_bytes().to_vec(),
            signing_public_key: self.identity_keys.public_key_bytes().to_vec(),
            nickname: self.nickname.clone(),
            timestamp: now.as_millis(),
            previous_peer_id: String::new(),
            signature: Vec::new(),
        };
        announcement.signature = self
            .identity_keys
            .sign(announcement.signing_payload(&handshake_hash))
            .to_vec();

        let packet = Packet::directed(
            MessageType::NoiseIdentityAnnounce,
            self.my_peer_id,
            peer_id,
            now,
            announcement.encode(),
        );
        self.send_packet(packet)
    }

    // ------------------------------------------------------------------------
    // Egress
    // ------------------------------------------------------------------------

    fn send_private_payload(
        &mut self,
        recipient: PeerId,
        message: &ChatMessage,
        now: Timestamp,
    ) -> Result<()> {
        let mut packet = Packet::directed(
            MessageType::Message,
            self.my_peer_id,
            recipient,
            now,
            message.encode(),
        );
        Self::apply_compression(&mut packet);
        self.encrypt_if_session(recipient, &mut packet)?;
        self.send_packet(packet)
    }

    fn send_ack(&mut self, recipient: PeerId, ack: &DeliveryAck, now: Timestamp) -> Result<()> {
        let mut packet = Packet::directed(
            MessageType::DeliveryAck,
            self.my_peer_id,
            recipient,
            now,
            ack.encode(),
        );
        self.encrypt_if_session(recipient, &mut packet)?;
        self.send_packet(packet)
    }

    /// Compress the payload, keeping the flag only when it actually shrank.
    fn apply_compression(packet: &mut Packet) {
        if let Some(compressed) = compression::compress_if_smaller(&packet.payload) {
            packet.payload = compressed;
            packet.flags = packet.flags.with_compression();
        }
    }

    fn encrypt_if_session(&mut self, recipient: PeerId, packet: &mut Packet) -> Result<()> {
        let established = self
            .sessions
            .get(&recipient)
            .is_some_and(|session| session.is_established());
        if established {
            packet.payload = self.sessions.encrypt(&recipient, &packet.payload)?;
            packet.flags = packet.flags.with_encryption();
        }
        Ok(())
    }

    /// Frame and transmit, fragmenting when the frame exceeds the MTU, and
    /// marking our own packet in the dedup filter so relayed echoes die.
    fn send_packet(&mut self, mut packet: Packet) -> Result<()> {
        // Dedup identity is (sender, timestamp): a sender must never reuse a
        // timestamp, so bump within the same millisecond.
        if packet.timestamp <= self.last_sent {
            packet.timestamp = self.last_sent.plus_millis(1);
        }
        self.last_sent = packet.timestamp;

        let frame = packet.frame()?;
        self.dedup
            .insert(PacketId::new(&packet.sender_id, packet.timestamp).as_bytes());

        if frame.len() <= self.mtu as usize {
            self.effects.push(Effect::Broadcast(frame));
            return Ok(());
        }

        // Each fragment is its own packet; re-entering send_packet gives
        // every one a distinct dedup identity. Fragment frames always fit
        // the MTU, so the recursion terminates immediately.
        let fragments = split_frame(&frame, self.mtu as usize - 30)?;
        for (message_type, payload) in fragments {
            let fragment_packet =
                Packet::broadcast(message_type, self.my_peer_id, packet.timestamp, payload)
                    .with_ttl(packet.ttl);
            self.send_packet(fragment_packet)?;
        }
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------------

    /// Undo the payload transforms in reverse egress order: decrypt with the
    /// session cipher, then inflate.
    fn open_payload(&mut self, packet: &Packet, now: Timestamp) -> Result<Vec<u8>> {
        let mut payload = packet.payload.clone();
        if packet.flags.is_encrypted() {
            payload = self.decrypt_from(packet.sender_id, &payload, now)?;
            if packet.flags.is_compressed() {
                payload = compression::decompress(&payload)?;
            }
        }
        Ok(payload)
    }

    fn decrypt_from(
        &mut self,
        peer_id: PeerId,
        ciphertext: &[u8],
        now: Timestamp,
    ) -> Result<Vec<u8>> {
        match self.sessions.decrypt(&peer_id, ciphertext) {
            Ok(plaintext) => Ok(plaintext),
            Err(err) => {
                // An AEAD failure killed the session; it stays failed until
                // the coordinator restarts the pair. A missing session is
                // just a drop.
                if matches!(err, MeshError::Crypto(crate::errors::CryptoError::AeadFailed)) {
                    self.coordinator.record_failure(peer_id, err.to_string(), now);
                    self.app_events.push(AppEvent::SessionLost { peer_id });
                }
                Err(err)
            }
        }
    }

    fn nickname_for(&self, peer_id: &PeerId) -> String {
        self.identity
            .fingerprint_for_peer(peer_id)
            .map(|fingerprint| {
                self.identity
                    .get_social_identity(fingerprint)
                    .display_name()
                    .to_string()
            })
            .unwrap_or_else(|| "Unknown".to_string())
    }

    fn push_message(&mut self, message: ChatMessage) {
        if message.is_private {
            let chat_key = if message.sender == self.nickname {
                message
                    .recipient_nickname
                    .clone()
                    .unwrap_or_else(|| "Unknown".to_string())
            } else {
                message.sender_peer_id.clone().unwrap_or_default()
            };
            let chat = self.private_chats.entry(chat_key).or_default();
            chat.push(message.clone());
            if chat.len() > MESSAGE_LOG_CAP {
                chat.remove(0);
            }
        }
        self.messages.push(message);
        if self.messages.len() > MESSAGE_LOG_CAP {
            self.messages.remove(0);
        }
    }

    fn emit_peer_list(&mut self) {
        self.app_events.push(AppEvent::PeerListChanged {
            peers: self.peers.iter().copied().collect(),
        });
    }
}

impl core::fmt::Debug for Router {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Router")
            .field("my_peer_id", &self.my_peer_id)
            .field("peers", &self.peers.len())
            .field("stats", &self.stats)
            .finish_non_exhaustive()
    }
}

/// Parse a 16-hex-digit peer ID.
fn peer_from_hex(hex_id: &str) -> Option<PeerId> {
    let bytes = hex::decode(hex_id).ok()?;
    (bytes.len() == 8).then(|| PeerId::from_bytes(&bytes))
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
