//! Packet framing and the binary wire format
//!
//! The outer frame every transport byte-string decodes to. Field order is
//! fixed: `version, type, ttl, flags, timestamp (8B BE), payload length
//! (2B BE), sender ID (8B), [recipient ID (8B)], payload, [signature (64B)]`.
//! All integers are big-endian. Bytes on the wire must be identical across
//! implementations.

use serde::{Deserialize, Serialize};

use crate::errors::{MeshError, ParseError, Result};
use crate::types::{PeerId, Timestamp, Ttl};

// ----------------------------------------------------------------------------
// Protocol Constants
// ----------------------------------------------------------------------------

/// The only supported protocol version
pub const PROTOCOL_VERSION: u8 = 1;

/// Maximum payload size in bytes, before and after decompression
pub const MAX_PAYLOAD_SIZE: usize = 2048;

/// Fixed header: version + type + ttl + flags + timestamp + payload length
pub const HEADER_SIZE: usize = 14;

/// Signature length when `HAS_SIGNATURE` is set
pub const SIGNATURE_SIZE: usize = 64;

// ----------------------------------------------------------------------------
// Message Types
// ----------------------------------------------------------------------------

/// Every packet type that can appear on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum MessageType {
    /// Peer presence broadcast
    Announce = 0x01,
    /// Graceful peer departure
    Leave = 0x03,
    /// Chat message (public broadcast or private)
    Message = 0x04,
    /// First fragment of an oversized frame
    FragmentStart = 0x05,
    /// Middle fragment
    FragmentContinue = 0x06,
    /// Final fragment
    FragmentEnd = 0x07,
    /// Delivery confirmation for a private message
    DeliveryAck = 0x0A,
    /// Query for the delivery state of a message
    DeliveryStatusRequest = 0x0B,
    /// Read confirmation
    ReadReceipt = 0x0C,
    /// First Noise XX handshake message (initiator → responder)
    NoiseHandshakeInit = 0x10,
    /// Second/third Noise XX handshake messages
    NoiseHandshakeResp = 0x11,
    /// Transport-encrypted payload
    NoiseEncrypted = 0x12,
    /// Signed static-key announcement, bound to the handshake hash
    NoiseIdentityAnnounce = 0x13,
    /// Protocol version negotiation offer
    VersionHello = 0x20,
    /// Version negotiation answer
    VersionAck = 0x21,
    /// Hop-by-hop protocol-level ack
    ProtocolAck = 0x22,
    /// Hop-by-hop protocol-level nack
    ProtocolNack = 0x23,
    /// Session liveness probe
    SystemValidation = 0x24,
}

impl MessageType {
    /// Convert from the raw wire byte
    pub fn from_u8(value: u8) -> Result<Self> {
        Ok(match value {
            0x01 => MessageType::Announce,
            0x03 => MessageType::Leave,
            0x04 => MessageType::Message,
            0x05 => MessageType::FragmentStart,
            0x06 => MessageType::FragmentContinue,
            0x07 => MessageType::FragmentEnd,
            0x0A => MessageType::DeliveryAck,
            0x0B => MessageType::DeliveryStatusRequest,
            0x0C => MessageType::ReadReceipt,
            0x10 => MessageType::NoiseHandshakeInit,
            0x11 => MessageType::NoiseHandshakeResp,
            0x12 => MessageType::NoiseEncrypted,
            0x13 => MessageType::NoiseIdentityAnnounce,
            0x20 => MessageType::VersionHello,
            0x21 => MessageType::VersionAck,
            0x22 => MessageType::ProtocolAck,
            0x23 => MessageType::ProtocolNack,
            0x24 => MessageType::SystemValidation,
            other => return Err(MeshError::Parse(ParseError::UnknownMessageType(other))),
        })
    }

    /// Convert to the raw wire byte
    pub fn as_u8(self) -> u8 {
        self as u8
    }

    /// Types whose broadcasts are rebroadcast by intermediate nodes.
    pub fn is_relay_eligible(self) -> bool {
        matches!(
            self,
            MessageType::Announce
                | MessageType::Leave
                | MessageType::Message
                | MessageType::FragmentStart
                | MessageType::FragmentContinue
                | MessageType::FragmentEnd
                | MessageType::NoiseIdentityAnnounce
        )
    }
}

// ----------------------------------------------------------------------------
// Packet Flags
// ----------------------------------------------------------------------------

/// Flag byte controlling optional fields and payload transforms.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PacketFlags(u8);

impl PacketFlags {
    /// No optional fields present
    pub const NONE: Self = Self(0x00);
    /// Recipient ID field is present
    pub const HAS_RECIPIENT: u8 = 0x01;
    /// Signature field is present
    pub const HAS_SIGNATURE: u8 = 0x02;
    /// Payload is LZ4-compressed
    pub const IS_COMPRESSED: u8 = 0x04;
    /// Payload is Noise-encrypted
    pub const IS_ENCRYPTED: u8 = 0x08;

    /// Create flags from the raw byte
    pub const fn new(value: u8) -> Self {
        Self(value)
    }

    /// Get the raw byte
    pub const fn as_u8(self) -> u8 {
        self.0
    }

    pub const fn has_recipient(self) -> bool {
        self.0 & Self::HAS_RECIPIENT != 0
    }

    pub const fn has_signature(self) -> bool {
        self.0 & Self::HAS_SIGNATURE != 0
    }

    pub const fn is_compressed(self) -> bool {
        self.0 & Self::IS_COMPRESSED != 0
    }

    pub const fn is_encrypted(self) -> bool {
        self.0 & Self::IS_ENCRYPTED != 0
    }

    pub fn with_recipient(mut self) -> Self {
        self.0 |= Self::HAS_RECIPIENT;
        self
    }

    pub fn with_signature(mut self) -> Self {
        self.0 |= Self::HAS_SIGNATURE;
        self
    }

    pub fn with_compression(mut self) -> Self {
        self.0 |= Self::IS_COMPRESSED;
        self
    }

    pub fn with_encryption(mut self) -> Self {
        self.0 |= Self::IS_ENCRYPTED;
        self
    }

    pub fn without_compression(mut self) -> Self {
        self.0 &= !Self::IS_COMPRESSED;
        self
    }
}

// ----------------------------------------------------------------------------
// Packet
// ----------------------------------------------------------------------------

/// The outer frame carried by the transport.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Packet {
    pub version: u8,
    pub message_type: MessageType,
    pub ttl: Ttl,
    pub flags: PacketFlags,
    pub timestamp: Timestamp,
    pub sender_id: PeerId,
    /// Present iff `flags.has_recipient()`
    pub recipient_id: Option<PeerId>,
    pub payload: Vec<u8>,
    /// Present iff `flags.has_signature()`
    #[serde(with = "signature_serde")]
    pub signature: Option<[u8; 64]>,
}

impl Packet {
    /// Build a broadcast packet with default TTL and no optional fields.
    pub fn broadcast(
        message_type: MessageType,
        sender_id: PeerId,
        timestamp: Timestamp,
        payload: Vec<u8>,
    ) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            message_type,
            ttl: Ttl::DEFAULT,
            flags: PacketFlags::NONE,
            timestamp,
            sender_id,
            recipient_id: None,
            payload,
            signature: None,
        }
    }

    /// Build a directed packet.
    pub fn directed(
        message_type: MessageType,
        sender_id: PeerId,
        recipient_id: PeerId,
        timestamp: Timestamp,
        payload: Vec<u8>,
    ) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            message_type,
            ttl: Ttl::DEFAULT,
            flags: PacketFlags::NONE.with_recipient(),
            timestamp,
            sender_id,
            recipient_id: Some(recipient_id),
            payload,
            signature: None,
        }
    }

    pub fn with_ttl(mut self, ttl: Ttl) -> Self {
        self.ttl = ttl;
        self
    }

    pub fn with_signature(mut self, signature: [u8; 64]) -> Self {
        self.signature = Some(signature);
        self.flags = self.flags.with_signature();
        self
    }

    /// True when the packet has no recipient or targets the broadcast address.
    pub fn is_broadcast(&self) -> bool {
        match self.recipient_id {
            None => true,
            Some(id) => id.is_broadcast(),
        }
    }

    /// Check the §3 structural invariants.
    pub fn validate(&self) -> Result<()> {
        if self.version != PROTOCOL_VERSION {
            return Err(MeshError::Parse(ParseError::BadVersion(self.version)));
        }
        if self.payload.len() > MAX_PAYLOAD_SIZE {
            return Err(MeshError::Parse(ParseError::PayloadTooLarge {
                size: self.payload.len(),
                max: MAX_PAYLOAD_SIZE,
            }));
        }
        match (self.flags.has_recipient(), &self.recipient_id) {
            (true, Some(id)) if id.is_null() => {
                return Err(MeshError::Parse(ParseError::NullRecipient));
            }
            (true, None) | (false, Some(_)) => {
                return Err(MeshError::malformed("recipient flag/field mismatch"));
            }
            _ => {}
        }
        match (self.flags.has_signature(), &self.signature) {
            (true, None) | (false, Some(_)) => {
                return Err(MeshError::malformed("signature flag/field mismatch"));
            }
            _ => {}
        }
        Ok(())
    }

    /// Serialize to the wire format.
    pub fn frame(&self) -> Result<Vec<u8>> {
        self.validate()?;

        let mut buf = Vec::with_capacity(
            HEADER_SIZE
                + 8
                + if self.recipient_id.is_some() { 8 } else { 0 }
                + self.payload.len()
                + if self.signature.is_some() { SIGNATURE_SIZE } else { 0 },
        );
        buf.push(self.version);
        buf.push(self.message_type.as_u8());
        buf.push(self.ttl.value());
        buf.push(self.flags.as_u8());
        buf.extend_from_slice(&self.timestamp.as_millis().to_be_bytes());
        buf.extend_from_slice(&(self.payload.len() as u16).to_be_bytes());
        buf.extend_from_slice(self.sender_id.as_bytes());
        if let Some(recipient) = &self.recipient_id {
            buf.extend_from_slice(recipient.as_bytes());
        }
        buf.extend_from_slice(&self.payload);
        if let Some(signature) = &self.signature {
            buf.extend_from_slice(signature);
        }
        Ok(buf)
    }

    /// Parse from the wire format.
    pub fn parse(data: &[u8]) -> Result<Self> {
        // Fixed header plus the always-present sender ID
        if data.len() < HEADER_SIZE + 8 {
            return Err(MeshError::short_buffer(HEADER_SIZE + 8, data.len()));
        }

        let version = data[0];
        if version != PROTOCOL_VERSION {
            return Err(MeshError::Parse(ParseError::BadVersion(version)));
        }
        let message_type = MessageType::from_u8(data[1])?;
        let ttl = Ttl::new(data[2]);
        let flags = PacketFlags::new(data[3]);
        let timestamp_bytes: [u8; 8] = data[4..12]
            .try_into()
            .map_err(|_| MeshError::malformed("timestamp"))?;
        let timestamp = Timestamp::new(u64::from_be_bytes(timestamp_bytes));
        let payload_len = u16::from_be_bytes([data[12], data[13]]) as usize;
        if payload_len > MAX_PAYLOAD_SIZE {
            return Err(MeshError::Parse(ParseError::PayloadTooLarge {
                size: payload_len,
                max: MAX_PAYLOAD_SIZE,
            }));
        }

        let mut offset = 14;
        let sender_id = PeerId::from_bytes(&data[offset..offset + 8]);
        offset += 8;

        let recipient_id = if flags.has_recipient() {
            if data.len() < offset + 8 {
                return Err(MeshError::short_buffer(offset + 8, data.len()));
            }
            let recipient = PeerId::from_bytes(&data[offset..offset + 8]);
            offset += 8;
            if recipient.is_null() {
                return Err(MeshError::Parse(ParseError::NullRecipient));
            }
            Some(recipient)
        } else {
            None
        };

        if data.len() < offset + payload_len {
            return Err(MeshError::short_buffer(offset + payload_len, data.len()));
        }
        let payload = data[offset..offset + payload_len].to_vec();
        offset += payload_len;

        let signature = if flags.has_signature() {
            if data.len() < offset + SIGNATURE_SIZE {
                return Err(MeshError::short_buffer(offset + SIGNATURE_SIZE, data.len()));
            }
            let mut sig = [0u8; 64];
            sig.copy_from_slice(&data[offset..offset + SIGNATURE_SIZE]);
            Some(sig)
        } else {
            None
        };

        Ok(Self {
            version,
            message_type,
            ttl,
            flags,
            timestamp,
            sender_id,
            recipient_id,
            payload,
            signature,
        })
    }
}

// ----------------------------------------------------------------------------
// Serde helper for the 64-byte signature
// ----------------------------------------------------------------------------

mod signature_serde {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(value: &Option<[u8; 64]>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match value {
            Some(array) => serializer.serialize_some(&array[..]),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<[u8; 64]>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let opt_vec: Option<Vec<u8>> = Option::deserialize(deserializer)?;
        match opt_vec {
            Some(vec) => {
                if vec.len() == 64 {
                    let mut array = [0u8; 64];
                    array.copy_from_slice(&vec);
                    Ok(Some(array))
                } else {
                    Err(serde::de::Error::invalid_length(vec.len(), &"64 bytes"))
                }
            }
            None => Ok(None),
        }
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
