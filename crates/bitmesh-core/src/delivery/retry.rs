//! Outbound retry queue
//!
//! A bounded queue of messages awaiting re-send. Backoff is linear and
//! anchored at enqueue time: the n-th retry fires `2000·n` ms after the
//! message entered the queue, giving the 2 s / 4 s / 6 s schedule.

use tracing::debug;
use uuid::Uuid;

use crate::config::RetryConfig;
use crate::errors::{DeliveryError, MeshError, Result};
use crate::types::{PeerId, Timestamp};

// ----------------------------------------------------------------------------
// Retryable Message
// ----------------------------------------------------------------------------

/// A message queued for re-send.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryableMessage {
    pub id: String,
    pub original_message_id: String,
    pub original_timestamp: u64,
    pub content: String,
    pub mentions: Vec<String>,
    pub is_private: bool,
    pub recipient_peer_id: Option<PeerId>,
    pub recipient_nickname: String,
    pub retry_count: u32,
    pub next_retry_time: Timestamp,
    queued_at: Timestamp,
}

// ----------------------------------------------------------------------------
// Retry Queue
// ----------------------------------------------------------------------------

/// Bounded outbound retry queue.
#[derive(Debug)]
pub struct RetryQueue {
    config: RetryConfig,
    queue: Vec<RetryableMessage>,
}

impl RetryQueue {
    pub fn new(config: RetryConfig) -> Self {
        Self {
            config,
            queue: Vec::new(),
        }
    }

    /// Queue a message for retry. Rejects when the queue is full or the
    /// message is already queued.
    #[allow(clippy::too_many_arguments)]
    pub fn add_message_for_retry(
        &mut self,
        content: &str,
        mentions: &[String],
        is_private: bool,
        recipient_peer_id: Option<PeerId>,
        recipient_nickname: &str,
        original_message_id: &str,
        original_timestamp: u64,
        now: Timestamp,
    ) -> Result<()> {
        if self.queue.len() >= self.config.capacity {
            return Err(MeshError::Delivery(DeliveryError::QueueFull {
                capacity: self.config.capacity,
            }));
        }
        if self
            .queue
            .iter()
            .any(|queued| queued.original_message_id == original_message_id)
        {
            return Err(MeshError::Delivery(DeliveryError::AlreadyQueued {
                message_id: original_message_id.to_string(),
            }));
        }

        self.queue.push(RetryableMessage {
            id: Uuid::new_v4().to_string(),
            original_message_id: original_message_id.to_string(),
            original_timestamp,
            content: content.to_string(),
            mentions: mentions.to_vec(),
            is_private,
            recipient_peer_id,
            recipient_nickname: recipient_nickname.to_string(),
            retry_count: 0,
            next_retry_time: now.plus_millis(self.config.base_backoff_ms),
            queued_at: now,
        });
        Ok(())
    }

    /// Drain every entry whose retry deadline has passed. Returned messages
    /// should be re-sent by the caller; each has its counter bumped and, if
    /// budget remains, is re-queued for the next deadline. Exhausted entries
    /// are dropped after their final send.
    pub fn process_retry_queue(&mut self, now: Timestamp) -> Vec<RetryableMessage> {
        let (due, remaining): (Vec<_>, Vec<_>) = self
            .queue
            .drain(..)
            .partition(|message| message.next_retry_time <= now);
        self.queue = remaining;

        let mut to_send = Vec::new();
        for mut message in due {
            if message.retry_count >= self.config.max_retries {
                debug!(message_id = %message.original_message_id, "retry budget exhausted");
                continue;
            }
            message.retry_count += 1;
            message.next_retry_time = message
                .queued_at
                .plus_millis(self.config.base_backoff_ms * (message.retry_count + 1) as u64);
            if message.retry_count < self.config.max_retries {
                self.queue.push(message.clone());
            }
            to_send.push(message);
        }
        to_send
    }

    /// Wipe the queue, e.g. on identity reset.
    pub fn clear_retry_queue(&mut self) {
        self.queue.clear();
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Earliest pending deadline, for sleep scheduling.
    pub fn next_deadline(&self) -> Option<Timestamp> {
        self.queue
            .iter()
            .map(|message| message.next_retry_time)
            .min()
    }

    /// Remove a message once its delivery was confirmed.
    pub fn remove_by_original_id(&mut self, original_message_id: &str) {
        self.queue
            .retain(|message| message.original_message_id != original_message_id);
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn queue() -> RetryQueue {
        RetryQueue::new(RetryConfig::default())
    }

    fn add(queue: &mut RetryQueue, id: &str, now: Timestamp) -> Result<()> {
        queue.add_message_for_retry("hello", &[], true, None, "bob", id, 0, now)
    }

    const T0: Timestamp = Timestamp::new(0);

    #[test]
    fn test_retry_schedule_is_2_4_6_seconds() {
        let mut queue = queue();
        add(&mut queue, "m1", T0).unwrap();

        // Nothing due before 2 s.
        assert!(queue.process_retry_queue(Timestamp::new(1_999)).is_empty());

        let first = queue.process_retry_queue(Timestamp::new(2_000));
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].retry_count, 1);

        assert!(queue.process_retry_queue(Timestamp::new(3_999)).is_empty());
        let second = queue.process_retry_queue(Timestamp::new(4_000));
        assert_eq!(second.len(), 1);
        assert_eq!(second[0].retry_count, 2);

        let third = queue.process_retry_queue(Timestamp::new(6_000));
        assert_eq!(third.len(), 1);
        assert_eq!(third[0].retry_count, 3);

        // Budget exhausted: the queue is empty and nothing fires again.
        assert!(queue.is_empty());
        assert!(queue.process_retry_queue(Timestamp::new(60_000)).is_empty());
    }

    #[test]
    fn test_at_most_three_retries_within_twelve_seconds() {
        let mut queue = queue();
        add(&mut queue, "m1", T0).unwrap();

        let mut sends = 0;
        for millis in (0..=12_000).step_by(500) {
            sends += queue.process_retry_queue(Timestamp::new(millis)).len();
        }
        assert_eq!(sends, 3);
    }

    #[test]
    fn test_duplicate_original_id_rejected() {
        let mut queue = queue();
        add(&mut queue, "m1", T0).unwrap();
        assert!(matches!(
            add(&mut queue, "m1", T0),
            Err(MeshError::Delivery(DeliveryError::AlreadyQueued { .. }))
        ));
    }

    #[test]
    fn test_capacity_is_hard() {
        let mut queue = queue();
        for i in 0..50 {
            add(&mut queue, &format!("m{i}"), T0).unwrap();
        }
        assert!(matches!(
            add(&mut queue, "overflow", T0),
            Err(MeshError::Delivery(DeliveryError::QueueFull { capacity: 50 }))
        ));
    }

    #[test]
    fn test_clear_and_remove() {
        let mut queue = queue();
        add(&mut queue, "m1", T0).unwrap();
        add(&mut queue, "m2", T0).unwrap();

        queue.remove_by_original_id("m1");
        assert_eq!(queue.len(), 1);

        queue.clear_retry_queue();
        assert!(queue.is_empty());
        assert!(queue.next_deadline().is_none());
    }

    #[test]
    fn test_next_deadline_tracks_earliest() {
        let mut queue = queue();
        add(&mut queue, "m1", T0).unwrap();
        add(&mut queue, "m2", Timestamp::new(1_000)).unwrap();
        assert_eq!(queue.next_deadline(), Some(Timestamp::new(2_000)));
    }
}
