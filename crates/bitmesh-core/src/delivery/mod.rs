//! Delivery reliability: pending-delivery tracking with deduplicated acks,
//! and the bounded outbound retry queue.

pub mod retry;
pub mod tracker;

pub use retry::{RetryQueue, RetryableMessage};
pub use tracker::{BoundedIdSet, DeliveryTracker, PendingDelivery, TimeoutOutcome};
