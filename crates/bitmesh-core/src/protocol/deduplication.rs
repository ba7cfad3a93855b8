//! Packet deduplication with a constant-memory bloom filter
//!
//! Mesh relay loops are broken by remembering "have we seen this packet id"
//! in a fixed-size bit array. False positives are acceptable (a packet is
//! occasionally dropped as a duplicate); false negatives never happen.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::types::{PeerId, Timestamp};

// ----------------------------------------------------------------------------
// Packet Identity
// ----------------------------------------------------------------------------

/// Identifier for deduplication: SHA-256 over `sender_id ‖ timestamp`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PacketId([u8; 32]);

impl PacketId {
    /// Derive the dedup identity of a packet.
    pub fn new(sender_id: &PeerId, timestamp: Timestamp) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(sender_id.as_bytes());
        hasher.update(timestamp.as_millis().to_be_bytes());
        let digest = hasher.finalize();
        let mut id = [0u8; 32];
        id.copy_from_slice(&digest);
        Self(id)
    }

    /// Get the raw bytes
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

// ----------------------------------------------------------------------------
// Bloom Filter
// ----------------------------------------------------------------------------

/// Bit-array bloom filter parameterised by expected item count and target
/// false-positive rate.
///
/// Sizing: `m = ceil(-n·ln(p) / ln(2)²)` bits, clamped to at least 64;
/// `k = round(m/n · ln 2)` hash functions, clamped to `1..=10`. The `k`
/// indices come from disjoint 4-byte windows of a single SHA-256 digest.
#[derive(Debug, Clone)]
pub struct BloomFilter {
    bits: Vec<u64>,
    bit_count: usize,
    hash_count: usize,
    insert_count: usize,
}

impl BloomFilter {
    /// Create a filter sized for `expected_items` at `false_positive_rate`.
    pub fn new(expected_items: usize, false_positive_rate: f64) -> Self {
        let n = expected_items.max(1) as f64;
        let m = -(n * false_positive_rate.ln()) / (core::f64::consts::LN_2.powi(2));
        let bit_count = (m.ceil() as usize).max(64);

        let k = bit_count as f64 / n * core::f64::consts::LN_2;
        let hash_count = (k.round() as usize).clamp(1, 10);

        let words = (bit_count + 63) / 64;
        Self {
            bits: vec![0u64; words],
            bit_count,
            hash_count,
            insert_count: 0,
        }
    }

    /// Insert an item. Idempotent.
    pub fn insert<T: AsRef<[u8]>>(&mut self, item: T) {
        for index in self.bit_indices(item.as_ref()) {
            self.bits[index / 64] |= 1u64 << (index % 64);
        }
        self.insert_count += 1;
    }

    /// Membership test. May report false positives, never false negatives.
    pub fn contains<T: AsRef<[u8]>>(&self, item: T) -> bool {
        self.bit_indices(item.as_ref())
            .into_iter()
            .all(|index| self.bits[index / 64] & (1u64 << (index % 64)) != 0)
    }

    /// Clear all bits.
    pub fn reset(&mut self) {
        self.bits.fill(0);
        self.insert_count = 0;
    }

    /// Estimated false-positive rate given the inserts so far:
    /// `(1 - e^(-k·n/m))^k`.
    pub fn estimated_fpr(&self) -> f64 {
        if self.insert_count == 0 {
            return 0.0;
        }
        let ratio =
            (self.hash_count * self.insert_count) as f64 / self.bit_count as f64;
        (1.0 - (-ratio).exp()).powf(self.hash_count as f64)
    }

    /// Size of the bit array in bytes.
    pub fn memory_bytes(&self) -> usize {
        self.bits.len() * core::mem::size_of::<u64>()
    }

    /// Number of inserts performed since construction or the last reset.
    pub fn insert_count(&self) -> usize {
        self.insert_count
    }

    /// The `k` bit positions for an item: SHA-256 the item once, then take
    /// 4-byte little-endian windows at offset `i·4 mod 29`, absolute value,
    /// modulo the bit count.
    fn bit_indices(&self, item: &[u8]) -> Vec<usize> {
        let digest = Sha256::digest(item);
        (0..self.hash_count)
            .map(|i| {
                let offset = (i * 4) % (digest.len() - 3);
                let word = u32::from_le_bytes([
                    digest[offset],
                    digest[offset + 1],
                    digest[offset + 2],
                    digest[offset + 3],
                ]);
                (word as i32).unsigned_abs() as usize % self.bit_count
            })
            .collect()
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
