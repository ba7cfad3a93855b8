//! LZ4 payload compression
//!
//! Egress keeps the `IS_COMPRESSED` flag only when the compressed form is
//! strictly smaller than the original. Ingress inflates into a bounded
//! buffer; anything that would exceed the payload limit is dropped.

use crate::errors::{MeshError, ParseError, Result};
use crate::protocol::packet::MAX_PAYLOAD_SIZE;

/// Compress `payload`, returning the LZ4 block only when it is strictly
/// smaller than the input.
pub fn compress_if_smaller(payload: &[u8]) -> Option<Vec<u8>> {
    if payload.is_empty() {
        return None;
    }
    let compressed = lz4_flex::block::compress(payload);
    if compressed.len() < payload.len() {
        Some(compressed)
    } else {
        None
    }
}

/// Inflate an LZ4 block, enforcing the payload size limit.
pub fn decompress(payload: &[u8]) -> Result<Vec<u8>> {
    let mut output = vec![0u8; MAX_PAYLOAD_SIZE];
    let written = lz4_flex::block::decompress_into(payload, &mut output).map_err(|_| {
        MeshError::Parse(ParseError::PayloadTooLarge {
            size: MAX_PAYLOAD_SIZE + 1,
            max: MAX_PAYLOAD_SIZE,
        })
    })?;
    output.truncate(written);
    Ok(output)
}
