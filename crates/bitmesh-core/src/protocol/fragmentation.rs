//! Fragmentation and reassembly for MTU-limited transports
//!
//! A frame larger than the transport MTU is split into a `FRAGMENT_START`,
//! zero or more `FRAGMENT_CONTINUE`, and a `FRAGMENT_END` packet. Each
//! fragment payload starts with an 8-byte random fragment ID and a u16
//! big-endian index. Reassembly buffers are keyed by fragment ID and expire
//! after 30 seconds; out-of-order arrival is fine, completion requires the
//! end fragment plus every index before it.

use std::collections::BTreeMap;

use rand_core::{OsRng, RngCore};

use crate::errors::{MeshError, Result};
use crate::protocol::packet::MessageType;
use crate::types::Timestamp;

/// Fragment payload prefix: fragment ID (8) + index (2)
pub const FRAGMENT_HEADER_SIZE: usize = 10;

/// Upper bound on a reassembled frame (a max-payload packet plus framing)
pub const MAX_REASSEMBLED_SIZE: usize = 4096;

// ----------------------------------------------------------------------------
// Fragment ID
// ----------------------------------------------------------------------------

/// Random per-message identifier tying fragments together.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FragmentId([u8; 8]);

impl FragmentId {
    /// Generate a fresh random fragment ID.
    pub fn random() -> Self {
        let mut bytes = [0u8; 8];
        OsRng.fill_bytes(&mut bytes);
        Self(bytes)
    }

    pub const fn new(bytes: [u8; 8]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 8] {
        &self.0
    }
}

// ----------------------------------------------------------------------------
// Splitting
// ----------------------------------------------------------------------------

/// Split `frame` into fragment payloads of at most `max_fragment_size` bytes
/// each (including the 10-byte prefix), tagged with the packet type each
/// fragment should be sent as.
pub fn split_frame(
    frame: &[u8],
    max_fragment_size: usize,
) -> Result<Vec<(MessageType, Vec<u8>)>> {
    if frame.is_empty() {
        return Err(MeshError::malformed("empty frame"));
    }
    let chunk_size = max_fragment_size.saturating_sub(FRAGMENT_HEADER_SIZE);
    if chunk_size == 0 {
        return Err(MeshError::malformed("MTU smaller than fragment header"));
    }

    let total = frame.len().div_ceil(chunk_size);
    if total > u16::MAX as usize {
        return Err(MeshError::malformed("frame needs too many fragments"));
    }

    let fragment_id = FragmentId::random();
    let mut fragments = Vec::with_capacity(total);
    for (index, chunk) in frame.chunks(chunk_size).enumerate() {
        let message_type = if index == 0 {
            MessageType::FragmentStart
        } else if index == total - 1 {
            MessageType::FragmentEnd
        } else {
            MessageType::FragmentContinue
        };

        let mut payload = Vec::with_capacity(FRAGMENT_HEADER_SIZE + chunk.len());
        payload.extend_from_slice(fragment_id.as_bytes());
        payload.extend_from_slice(&(index as u16).to_be_bytes());
        payload.extend_from_slice(chunk);
        fragments.push((message_type, payload));
    }
    Ok(fragments)
}

// ----------------------------------------------------------------------------
// Reassembly
// ----------------------------------------------------------------------------

#[derive(Debug)]
struct PartialFrame {
    chunks: BTreeMap<u16, Vec<u8>>,
    end_index: Option<u16>,
    total_bytes: usize,
    first_seen: Timestamp,
}

impl PartialFrame {
    fn new(now: Timestamp) -> Self {
        Self {
            chunks: BTreeMap::new(),
            end_index: None,
            total_bytes: 0,
            first_seen: now,
        }
    }

    fn is_complete(&self) -> bool {
        match self.end_index {
            Some(end) => self.chunks.len() == end as usize + 1,
            None => false,
        }
    }

    fn assemble(&self) -> Vec<u8> {
        let mut frame = Vec::with_capacity(self.total_bytes);
        for chunk in self.chunks.values() {
            frame.extend_from_slice(chunk);
        }
        frame
    }
}

/// Reassembles fragmented frames, keyed by fragment ID.
#[derive(Debug, Default)]
pub struct FragmentReassembler {
    partial: BTreeMap<FragmentId, PartialFrame>,
}

impl FragmentReassembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one fragment payload. Returns the reassembled frame once the end
    /// fragment and every index before it have arrived.
    pub fn add_fragment(
        &mut self,
        message_type: MessageType,
        payload: &[u8],
        now: Timestamp,
    ) -> Result<Option<Vec<u8>>> {
        if payload.len() < FRAGMENT_HEADER_SIZE {
            return Err(MeshError::short_buffer(FRAGMENT_HEADER_SIZE, payload.len()));
        }
        let mut id_bytes = [0u8; 8];
        id_bytes.copy_from_slice(&payload[..8]);
        let fragment_id = FragmentId::new(id_bytes);
        let index = u16::from_be_bytes([payload[8], payload[9]]);
        let chunk = &payload[FRAGMENT_HEADER_SIZE..];

        if message_type == MessageType::FragmentStart && index != 0 {
            return Err(MeshError::malformed("start fragment with nonzero index"));
        }

        let partial = self
            .partial
            .entry(fragment_id)
            .or_insert_with(|| PartialFrame::new(now));

        if message_type == MessageType::FragmentEnd {
            // Conflicting end markers abort the whole frame.
            if partial.end_index.is_some_and(|end| end != index) {
                self.partial.remove(&fragment_id);
                return Err(MeshError::malformed("conflicting end fragment"));
            }
            partial.end_index = Some(index);
        }

        if partial.chunks.contains_key(&index) {
            // Duplicate fragment, nothing new.
            return Ok(None);
        }
        partial.total_bytes += chunk.len();
        if partial.total_bytes > MAX_REASSEMBLED_SIZE {
            self.partial.remove(&fragment_id);
            return Err(MeshError::malformed("reassembled frame too large"));
        }
        partial.chunks.insert(index, chunk.to_vec());

        if partial.is_complete() {
            let frame = partial.assemble();
            self.partial.remove(&fragment_id);
            Ok(Some(frame))
        } else {
            Ok(None)
        }
    }

    /// Drop partial buffers older than `timeout_ms`.
    pub fn cleanup_expired(&mut self, now: Timestamp, timeout_ms: u64) {
        self.partial
            .retain(|_, partial| now.millis_since(partial.first_seen) <= timeout_ms);
    }

    /// Number of frames still being assembled.
    pub fn pending_count(&self) -> usize {
        self.partial.len()
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    const NOW: Timestamp = Timestamp::new(1_000);

    #[test]
    fn test_split_types_and_prefix() {
        let frame = vec![0xCDu8; 250];
        let fragments = split_frame(&frame, 110).unwrap();
        assert_eq!(fragments.len(), 3);
        assert_eq!(fragments[0].0, MessageType::FragmentStart);
        assert_eq!(fragments[1].0, MessageType::FragmentContinue);
        assert_eq!(fragments[2].0, MessageType::FragmentEnd);

        // Same fragment ID on every piece, indices sequential.
        let id = &fragments[0].1[..8];
        for (i, (_, payload)) in fragments.iter().enumerate() {
            assert_eq!(&payload[..8], id);
            assert_eq!(u16::from_be_bytes([payload[8], payload[9]]), i as u16);
            assert!(payload.len() <= 110);
        }
    }

    #[test]
    fn test_two_fragment_split() {
        let frame = vec![1u8; 150];
        let fragments = split_frame(&frame, 110).unwrap();
        assert_eq!(fragments.len(), 2);
        assert_eq!(fragments[0].0, MessageType::FragmentStart);
        assert_eq!(fragments[1].0, MessageType::FragmentEnd);
    }

    #[test]
    fn test_reassembly_in_order() {
        let frame: Vec<u8> = (0..=255u8).cycle().take(500).collect();
        let fragments = split_frame(&frame, 120).unwrap();

        let mut reassembler = FragmentReassembler::new();
        let mut result = None;
        for (message_type, payload) in &fragments {
            result = reassembler
                .add_fragment(*message_type, payload, NOW)
                .unwrap();
        }
        assert_eq!(result.unwrap(), frame);
        assert_eq!(reassembler.pending_count(), 0);
    }

    #[test]
    fn test_reassembly_out_of_order() {
        let frame: Vec<u8> = (0..400u16).map(|i| i as u8).collect();
        let mut fragments = split_frame(&frame, 110).unwrap();
        fragments.reverse();

        let mut reassembler = FragmentReassembler::new();
        let mut result = None;
        for (message_type, payload) in &fragments {
            result = reassembler
                .add_fragment(*message_type, payload, NOW)
                .unwrap();
        }
        assert_eq!(result.unwrap(), frame);
    }

    #[test]
    fn test_duplicate_fragment_ignored() {
        let frame = vec![9u8; 300];
        let fragments = split_frame(&frame, 120).unwrap();

        let mut reassembler = FragmentReassembler::new();
        let (t0, p0) = &fragments[0];
        assert!(reassembler.add_fragment(*t0, p0, NOW).unwrap().is_none());
        assert!(reassembler.add_fragment(*t0, p0, NOW).unwrap().is_none());

        for (message_type, payload) in &fragments[1..] {
            if let Some(result) = reassembler
                .add_fragment(*message_type, payload, NOW)
                .unwrap()
            {
                assert_eq!(result, frame);
                return;
            }
        }
        panic!("frame never completed");
    }

    #[test]
    fn test_expiry_drops_stale_partials() {
        let frame = vec![7u8; 300];
        let fragments = split_frame(&frame, 120).unwrap();

        let mut reassembler = FragmentReassembler::new();
        let (t0, p0) = &fragments[0];
        reassembler.add_fragment(*t0, p0, NOW).unwrap();
        assert_eq!(reassembler.pending_count(), 1);

        reassembler.cleanup_expired(NOW.plus_millis(30_001), 30_000);
        assert_eq!(reassembler.pending_count(), 0);
    }

    #[test]
    fn test_short_fragment_rejected() {
        let mut reassembler = FragmentReassembler::new();
        assert!(reassembler
            .add_fragment(MessageType::FragmentStart, &[1, 2, 3], NOW)
            .is_err());
    }
}
