//! Delivery tracking for private messages
//!
//! Private messages get a pending-delivery entry that is cleared by a
//! deduplicated `DELIVERY_ACK`. Timeouts retry only for favorites, up to the
//! configured bound; everyone else is best-effort single-shot.

use hashbrown::HashSet;
use tracing::debug;
use uuid::Uuid;

use crate::config::DeliveryConfig;
use crate::protocol::message::{ChatMessage, DeliveryAck};
use crate::types::Timestamp;

// ----------------------------------------------------------------------------
// Bounded ID Set
// ----------------------------------------------------------------------------

/// Insertion-ordered set of string IDs with a hard cap. When the cap is
/// exceeded the oldest half is dropped.
#[derive(Debug, Default)]
pub struct BoundedIdSet {
    order: Vec<String>,
    members: HashSet<String>,
    capacity: usize,
}

impl BoundedIdSet {
    pub fn new(capacity: usize) -> Self {
        Self {
            order: Vec::new(),
            members: HashSet::new(),
            capacity,
        }
    }

    /// Insert, returning false when the ID was already present.
    pub fn insert(&mut self, id: &str) -> bool {
        if !self.members.insert(id.to_string()) {
            return false;
        }
        self.order.push(id.to_string());
        if self.order.len() > self.capacity {
            let drop_count = self.order.len() / 2;
            for old in self.order.drain(..drop_count) {
                self.members.remove(&old);
            }
        }
        true
    }

    pub fn contains(&self, id: &str) -> bool {
        self.members.contains(id)
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}

// ----------------------------------------------------------------------------
// Pending Delivery
// ----------------------------------------------------------------------------

/// One private message awaiting its delivery ack.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingDelivery {
    pub message_id: String,
    pub sent_at: Timestamp,
    pub recipient_id: String,
    pub recipient_nickname: String,
    pub retry_count: u32,
    pub is_favorite: bool,
}

/// What a delivery timeout decided.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutOutcome {
    /// Favorite with retries left: counter bumped, caller should resend
    Retry { retry_count: u32 },
    /// Out of retries, or not a favorite: entry dropped
    Dropped,
    /// No such pending delivery
    NotTracked,
}

// ----------------------------------------------------------------------------
// Delivery Tracker
// ----------------------------------------------------------------------------

/// Tracks per-message delivery state for private messages.
#[derive(Debug)]
pub struct DeliveryTracker {
    config: DeliveryConfig,
    pending: hashbrown::HashMap<String, PendingDelivery>,
    received_ack_ids: BoundedIdSet,
    sent_ack_ids: BoundedIdSet,
}

impl DeliveryTracker {
    pub fn new(config: DeliveryConfig) -> Self {
        let capacity = config.ack_id_capacity;
        Self {
            config,
            pending: hashbrown::HashMap::new(),
            received_ack_ids: BoundedIdSet::new(capacity),
            sent_ack_ids: BoundedIdSet::new(capacity),
        }
    }

    /// Start tracking a private message. Public messages are ignored.
    pub fn track_message(
        &mut self,
        message: &ChatMessage,
        recipient_id: &str,
        recipient_nickname: &str,
        is_favorite: bool,
        now: Timestamp,
    ) {
        if !message.is_private {
            return;
        }
        self.pending.insert(
            message.id.clone(),
            PendingDelivery {
                message_id: message.id.clone(),
                sent_at: now,
                recipient_id: recipient_id.to_string(),
                recipient_nickname: recipient_nickname.to_string(),
                retry_count: 0,
                is_favorite,
            },
        );
    }

    /// Process an incoming ack. Duplicate acks (same `ack_id`) are dropped;
    /// a fresh ack clears the pending entry. Returns true when the ack was
    /// fresh.
    pub fn process_delivery_ack(&mut self, ack: &DeliveryAck) -> bool {
        if !self.received_ack_ids.insert(&ack.ack_id) {
            debug!(ack_id = %ack.ack_id, "duplicate delivery ack dropped");
            return false;
        }
        self.pending.remove(&ack.original_message_id);
        true
    }

    /// Build the ack for a received private message. Pure constructor; the
    /// caller frames and sends it, then records it with
    /// [`record_sent_ack`](Self::record_sent_ack).
    pub fn generate_ack(
        message: &ChatMessage,
        my_peer_id: &str,
        my_nickname: &str,
        hop_count: u8,
        now: Timestamp,
    ) -> DeliveryAck {
        DeliveryAck {
            original_message_id: message.id.clone(),
            ack_id: Uuid::new_v4().to_string(),
            recipient_id: my_peer_id.to_string(),
            recipient_nickname: my_nickname.to_string(),
            timestamp: now.as_millis(),
            hop_count,
        }
    }

    /// Remember that we sent an ack, so repeats of the same message do not
    /// trigger another one.
    pub fn record_sent_ack(&mut self, ack_id: &str) {
        self.sent_ack_ids.insert(ack_id);
    }

    pub fn has_sent_ack(&self, ack_id: &str) -> bool {
        self.sent_ack_ids.contains(ack_id)
    }

    /// Decide what to do about a message whose ack never arrived.
    pub fn handle_timeout(&mut self, message_id: &str) -> TimeoutOutcome {
        let Some(delivery) = self.pending.get_mut(message_id) else {
            return TimeoutOutcome::NotTracked;
        };
        if delivery.retry_count < self.config.max_retries && delivery.is_favorite {
            delivery.retry_count += 1;
            TimeoutOutcome::Retry {
                retry_count: delivery.retry_count,
            }
        } else {
            self.pending.remove(message_id);
            TimeoutOutcome::Dropped
        }
    }

    /// Drop pending entries older than the configured horizon.
    pub fn cleanup_old_deliveries(&mut self, now: Timestamp) {
        let max_age = self.config.max_delivery_age_ms;
        self.pending
            .retain(|_, delivery| now.millis_since(delivery.sent_at) <= max_age);
    }

    /// Explicitly stop tracking a message.
    pub fn clear_delivery_status(&mut self, message_id: &str) {
        self.pending.remove(message_id);
    }

    pub fn is_pending(&self, message_id: &str) -> bool {
        self.pending.contains_key(message_id)
    }

    pub fn pending_deliveries(&self) -> impl Iterator<Item = &PendingDelivery> {
        self.pending.values()
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
