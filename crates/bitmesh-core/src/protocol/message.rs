//! Inner message payloads and their binary codecs
//!
//! Every payload that rides inside a [`Packet`](crate::protocol::Packet) is
//! encoded here: the chat message TLV, delivery/read receipts, protocol
//! acks/nacks, the signed identity announcement and version negotiation.
//! Strings are u16-big-endian length prefixed UTF-8.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::errors::{MeshError, Result};
use crate::protocol::packet::MessageType;
use crate::types::{PeerId, Timestamp};

// ----------------------------------------------------------------------------
// Wire primitives
// ----------------------------------------------------------------------------

pub(crate) mod wire {
    use crate::errors::{MeshError, Result};

    pub fn write_u16(buf: &mut Vec<u8>, value: u16) {
        buf.extend_from_slice(&value.to_be_bytes());
    }

    pub fn write_u64(buf: &mut Vec<u8>, value: u64) {
        buf.extend_from_slice(&value.to_be_bytes());
    }

    pub fn write_string(buf: &mut Vec<u8>, value: &str) {
        write_u16(buf, value.len() as u16);
        buf.extend_from_slice(value.as_bytes());
    }

    pub fn write_bytes(buf: &mut Vec<u8>, value: &[u8]) {
        write_u16(buf, value.len() as u16);
        buf.extend_from_slice(value);
    }

    /// Cursor over a borrowed buffer with bounds-checked reads.
    pub struct Reader<'a> {
        data: &'a [u8],
        offset: usize,
    }

    impl<'a> Reader<'a> {
        pub fn new(data: &'a [u8]) -> Self {
            Self { data, offset: 0 }
        }

        fn take(&mut self, len: usize) -> Result<&'a [u8]> {
            if self.data.len() < self.offset + len {
                return Err(MeshError::short_buffer(self.offset + len, self.data.len()));
            }
            let slice = &self.data[self.offset..self.offset + len];
            self.offset += len;
            Ok(slice)
        }

        pub fn read_u8(&mut self) -> Result<u8> {
            Ok(self.take(1)?[0])
        }

        pub fn read_u16(&mut self) -> Result<u16> {
            let bytes = self.take(2)?;
            Ok(u16::from_be_bytes([bytes[0], bytes[1]]))
        }

        pub fn read_u64(&mut self) -> Result<u64> {
            let bytes = self.take(8)?;
            let bytes: [u8; 8] = bytes
                .try_into()
                .map_err(|_| MeshError::malformed("u64 field"))?;
            Ok(u64::from_be_bytes(bytes))
        }

        pub fn read_string(&mut self) -> Result<String> {
            let len = self.read_u16()? as usize;
            let bytes = self.take(len)?;
            Ok(String::from_utf8_lossy(bytes).into_owned())
        }

        pub fn read_bytes(&mut self) -> Result<Vec<u8>> {
            let len = self.read_u16()? as usize;
            Ok(self.take(len)?.to_vec())
        }

        pub fn remaining(&self) -> usize {
            self.data.len() - self.offset
        }
    }
}

use wire::Reader;

// ----------------------------------------------------------------------------
// Chat Message
// ----------------------------------------------------------------------------

const MSG_IS_RELAY: u8 = 0x01;
const MSG_IS_PRIVATE: u8 = 0x02;
const MSG_HAS_ORIGINAL_SENDER: u8 = 0x04;
const MSG_HAS_RECIPIENT_NICKNAME: u8 = 0x08;
const MSG_HAS_SENDER_PEER_ID: u8 = 0x10;
const MSG_HAS_MENTIONS: u8 = 0x20;

/// The inner payload of a `MESSAGE` packet.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub id: String,
    pub sender: String,
    pub content: String,
    pub timestamp: u64,
    pub is_relay: bool,
    pub is_private: bool,
    pub original_sender: Option<String>,
    pub recipient_nickname: Option<String>,
    pub sender_peer_id: Option<String>,
    pub mentions: Vec<String>,
}

impl ChatMessage {
    /// Encode to the TLV wire format.
    pub fn encode(&self) -> Vec<u8> {
        let mut flags = 0u8;
        if self.is_relay {
            flags |= MSG_IS_RELAY;
        }
        if self.is_private {
            flags |= MSG_IS_PRIVATE;
        }
        if self.original_sender.is_some() {
            flags |= MSG_HAS_ORIGINAL_SENDER;
        }
        if self.recipient_nickname.is_some() {
            flags |= MSG_HAS_RECIPIENT_NICKNAME;
        }
        if self.sender_peer_id.is_some() {
            flags |= MSG_HAS_SENDER_PEER_ID;
        }
        if !self.mentions.is_empty() {
            flags |= MSG_HAS_MENTIONS;
        }

        let mut buf = Vec::new();
        buf.push(flags);
        wire::write_u64(&mut buf, self.timestamp);
        wire::write_string(&mut buf, &self.id);
        wire::write_string(&mut buf, &self.sender);
        wire::write_string(&mut buf, &self.content);
        if let Some(original_sender) = &self.original_sender {
            wire::write_string(&mut buf, original_sender);
        }
        if let Some(recipient_nickname) = &self.recipient_nickname {
            wire::write_string(&mut buf, recipient_nickname);
        }
        if let Some(sender_peer_id) = &self.sender_peer_id {
            wire::write_string(&mut buf, sender_peer_id);
        }
        if !self.mentions.is_empty() {
            buf.push(self.mentions.len() as u8);
            for mention in &self.mentions {
                wire::write_string(&mut buf, mention);
            }
        }
        buf
    }

    /// Decode from the TLV wire format.
    pub fn decode(data: &[u8]) -> Result<Self> {
        let mut reader = Reader::new(data);
        let flags = reader.read_u8()?;
        let timestamp = reader.read_u64()?;
        let id = reader.read_string()?;
        let sender = reader.read_string()?;
        let content = reader.read_string()?;

        let original_sender = if flags & MSG_HAS_ORIGINAL_SENDER != 0 {
            Some(reader.read_string()?)
        } else {
            None
        };
        let recipient_nickname = if flags & MSG_HAS_RECIPIENT_NICKNAME != 0 {
            Some(reader.read_string()?)
        } else {
            None
        };
        let sender_peer_id = if flags & MSG_HAS_SENDER_PEER_ID != 0 {
            Some(reader.read_string()?)
        } else {
            None
        };
        let mut mentions = Vec::new();
        if flags & MSG_HAS_MENTIONS != 0 {
            let count = reader.read_u8()?;
            for _ in 0..count {
                mentions.push(reader.read_string()?);
            }
        }

        Ok(Self {
            id,
            sender,
            content,
            timestamp,
            is_relay: flags & MSG_IS_RELAY != 0,
            is_private: flags & MSG_IS_PRIVATE != 0,
            original_sender,
            recipient_nickname,
            sender_peer_id,
            mentions,
        })
    }
}

// ----------------------------------------------------------------------------
// Delivery Acknowledgment
// ----------------------------------------------------------------------------

/// Confirmation that a private message reached its recipient.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryAck {
    pub original_message_id: String,
    pub ack_id: String,
    pub recipient_id: String,
    pub recipient_nickname: String,
    pub timestamp: u64,
    pub hop_count: u8,
}

impl DeliveryAck {
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        wire::write_string(&mut buf, &self.original_message_id);
        wire::write_string(&mut buf, &self.ack_id);
        wire::write_string(&mut buf, &self.recipient_id);
        wire::write_string(&mut buf, &self.recipient_nickname);
        wire::write_u64(&mut buf, self.timestamp);
        buf.push(self.hop_count);
        buf
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        let mut reader = Reader::new(data);
        Ok(Self {
            original_message_id: reader.read_string()?,
            ack_id: reader.read_string()?,
            recipient_id: reader.read_string()?,
            recipient_nickname: reader.read_string()?,
            timestamp: reader.read_u64()?,
            hop_count: reader.read_u8()?,
        })
    }
}

// ----------------------------------------------------------------------------
// Read Receipt
// ----------------------------------------------------------------------------

/// Confirmation that a private message was displayed to the user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReadReceipt {
    pub original_message_id: String,
    pub receipt_id: String,
    pub reader_id: String,
    pub reader_nickname: String,
    pub timestamp: u64,
}

impl ReadReceipt {
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        wire::write_string(&mut buf, &self.original_message_id);
        wire::write_string(&mut buf, &self.receipt_id);
        wire::write_string(&mut buf, &self.reader_id);
        wire::write_string(&mut buf, &self.reader_nickname);
        wire::write_u64(&mut buf, self.timestamp);
        buf
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        let mut reader = Reader::new(data);
        Ok(Self {
            original_message_id: reader.read_string()?,
            receipt_id: reader.read_string()?,
            reader_id: reader.read_string()?,
            reader_nickname: reader.read_string()?,
            timestamp: reader.read_u64()?,
        })
    }
}

// ----------------------------------------------------------------------------
// Protocol Ack / Nack
// ----------------------------------------------------------------------------

/// Hop-by-hop acknowledgment of a protocol packet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProtocolAck {
    pub original_packet_id: String,
    pub ack_id: String,
    pub sender_id: String,
    pub receiver_id: String,
    pub packet_type: MessageType,
    pub timestamp: u64,
    pub hop_count: u8,
}

impl ProtocolAck {
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        wire::write_string(&mut buf, &self.original_packet_id);
        wire::write_string(&mut buf, &self.ack_id);
        wire::write_string(&mut buf, &self.sender_id);
        wire::write_string(&mut buf, &self.receiver_id);
        buf.push(self.packet_type.as_u8());
        wire::write_u64(&mut buf, self.timestamp);
        buf.push(self.hop_count);
        buf
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        let mut reader = Reader::new(data);
        Ok(Self {
            original_packet_id: reader.read_string()?,
            ack_id: reader.read_string()?,
            sender_id: reader.read_string()?,
            receiver_id: reader.read_string()?,
            packet_type: MessageType::from_u8(reader.read_u8()?)?,
            timestamp: reader.read_u64()?,
            hop_count: reader.read_u8()?,
        })
    }
}

/// Hop-by-hop rejection of a protocol packet, with a reason.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProtocolNack {
    pub original_packet_id: String,
    pub nack_id: String,
    pub sender_id: String,
    pub receiver_id: String,
    pub packet_type: MessageType,
    pub timestamp: u64,
    pub reason: String,
    pub error_code: u8,
}

impl ProtocolNack {
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        wire::write_string(&mut buf, &self.original_packet_id);
        wire::write_string(&mut buf, &self.nack_id);
        wire::write_string(&mut buf, &self.sender_id);
        wire::write_string(&mut buf, &self.receiver_id);
        buf.push(self.packet_type.as_u8());
        wire::write_u64(&mut buf, self.timestamp);
        wire::write_string(&mut buf, &self.reason);
        buf.push(self.error_code);
        buf
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        let mut reader = Reader::new(data);
        Ok(Self {
            original_packet_id: reader.read_string()?,
            nack_id: reader.read_string()?,
            sender_id: reader.read_string()?,
            receiver_id: reader.read_string()?,
            packet_type: MessageType::from_u8(reader.read_u8()?)?,
            timestamp: reader.read_u64()?,
            reason: reader.read_string()?,
            error_code: reader.read_u8()?,
        })
    }
}

// ----------------------------------------------------------------------------
// Noise Identity Announcement
// ----------------------------------------------------------------------------

/// Signed announcement binding a transient peer ID to a static identity.
///
/// The signature covers the session's handshake hash followed by the
/// announcement fields, so an announcement cannot be replayed into a
/// different session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NoiseIdentityAnnouncement {
    pub peer_id: String,
    pub public_key: Vec<u8>,
    pub signing_public_key: Vec<u8>,
    pub nickname: String,
    pub timestamp: u64,
    /// Previous transient ID when rotating, empty otherwise
    pub previous_peer_id: String,
    pub signature: Vec<u8>,
}

impl NoiseIdentityAnnouncement {
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        wire::write_string(&mut buf, &self.peer_id);
        wire::write_bytes(&mut buf, &self.public_key);
        wire::write_bytes(&mut buf, &self.signing_public_key);
        wire::write_string(&mut buf, &self.nickname);
        wire::write_u64(&mut buf, self.timestamp);
        wire::write_string(&mut buf, &self.previous_peer_id);
        wire::write_bytes(&mut buf, &self.signature);
        buf
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        let mut reader = Reader::new(data);
        Ok(Self {
            peer_id: reader.read_string()?,
            public_key: reader.read_bytes()?,
            signing_public_key: reader.read_bytes()?,
            nickname: reader.read_string()?,
            timestamp: reader.read_u64()?,
            previous_peer_id: reader.read_string()?,
            signature: reader.read_bytes()?,
        })
    }

    /// The byte string the signature covers: `handshake_hash ‖ fields`.
    pub fn signing_payload(&self, handshake_hash: &[u8]) -> Vec<u8> {
        let mut buf = Vec::with_capacity(handshake_hash.len() + 128);
        buf.extend_from_slice(handshake_hash);
        wire::write_string(&mut buf, &self.peer_id);
        wire::write_bytes(&mut buf, &self.public_key);
        wire::write_bytes(&mut buf, &self.signing_public_key);
        wire::write_string(&mut buf, &self.nickname);
        wire::write_u64(&mut buf, self.timestamp);
        wire::write_string(&mut buf, &self.previous_peer_id);
        buf
    }

    /// Verify the embedded Ed25519 signature against the announced signing key.
    pub fn verify(&self, handshake_hash: &[u8]) -> Result<()> {
        use ed25519_dalek::{Signature, Verifier, VerifyingKey};

        let key_bytes: [u8; 32] = self
            .signing_public_key
            .as_slice()
            .try_into()
            .map_err(|_| MeshError::malformed("signing public key"))?;
        let sig_bytes: [u8; 64] = self
            .signature
            .as_slice()
            .try_into()
            .map_err(|_| MeshError::malformed("announcement signature"))?;

        let verifying_key = VerifyingKey::from_bytes(&key_bytes)
            .map_err(|_| crate::errors::CryptoError::SignatureInvalid)?;
        let signature = Signature::from_bytes(&sig_bytes);
        verifying_key
            .verify(&self.signing_payload(handshake_hash), &signature)
            .map_err(|_| crate::errors::CryptoError::SignatureInvalid)?;
        Ok(())
    }
}

// ----------------------------------------------------------------------------
// Version Negotiation
// ----------------------------------------------------------------------------

/// Offer of supported protocol versions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionHello {
    pub supported_versions: Vec<u8>,
    pub preferred_version: u8,
    pub client_version: String,
    pub platform: String,
    pub capabilities: Vec<String>,
}

impl VersionHello {
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        buf.push(self.supported_versions.len() as u8);
        buf.extend_from_slice(&self.supported_versions);
        buf.push(self.preferred_version);
        wire::write_string(&mut buf, &self.client_version);
        wire::write_string(&mut buf, &self.platform);
        buf.push(self.capabilities.len() as u8);
        for capability in &self.capabilities {
            wire::write_string(&mut buf, capability);
        }
        buf
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        let mut reader = Reader::new(data);
        let count = reader.read_u8()? as usize;
        let mut supported_versions = Vec::with_capacity(count);
        for _ in 0..count {
            supported_versions.push(reader.read_u8()?);
        }
        let preferred_version = reader.read_u8()?;
        let client_version = reader.read_string()?;
        let platform = reader.read_string()?;
        let capability_count = reader.read_u8()? as usize;
        let mut capabilities = Vec::with_capacity(capability_count);
        for _ in 0..capability_count {
            capabilities.push(reader.read_string()?);
        }
        Ok(Self {
            supported_versions,
            preferred_version,
            client_version,
            platform,
            capabilities,
        })
    }
}

/// Answer to a [`VersionHello`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionAck {
    pub agreed_version: u8,
    pub server_version: String,
    pub platform: String,
    pub capabilities: Vec<String>,
    pub rejected: bool,
    pub reason: String,
}

impl VersionAck {
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        buf.push(self.agreed_version);
        wire::write_string(&mut buf, &self.server_version);
        wire::write_string(&mut buf, &self.platform);
        buf.push(self.capabilities.len() as u8);
        for capability in &self.capabilities {
            wire::write_string(&mut buf, capability);
        }
        buf.push(self.rejected as u8);
        wire::write_string(&mut buf, &self.reason);
        buf
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        let mut reader = Reader::new(data);
        let agreed_version = reader.read_u8()?;
        let server_version = reader.read_string()?;
        let platform = reader.read_string()?;
        let capability_count = reader.read_u8()? as usize;
        let mut capabilities = Vec::with_capacity(capability_count);
        for _ in 0..capability_count {
            capabilities.push(reader.read_string()?);
        }
        Ok(Self {
            agreed_version,
            server_version,
            platform,
            capabilities,
            rejected: reader.read_u8()? != 0,
            reason: reader.read_string()?,
        })
    }
}

// ----------------------------------------------------------------------------
// Packet identity for acks
// ----------------------------------------------------------------------------

/// Stable hex identifier for a packet, used by protocol acks and nacks.
pub fn packet_id_hex(sender_id: &PeerId, timestamp: Timestamp) -> String {
    let mut hasher = Sha256::new();
    hasher.update(sender_id.as_bytes());
    hasher.update(timestamp.as_millis().to_be_bytes());
    hex::encode(&hasher.finalize()[..8])
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_message() -> ChatMessage {
        ChatMessage {
            id: "msg-1".into(),
            sender: "alice".into(),
            content: "hello".into(),
            timestamp: 1_700_000_000_000,
            is_relay: false,
            is_private: true,
            original_sender: None,
            recipient_nickname: Some("bob".into()),
            sender_peer_id: Some("0102030405060708".into()),
            mentions: vec!["bob".into(), "carol".into()],
        }
    }

    #[test]
    fn test_chat_message_round_trip() {
        let msg = sample_message();
        let decoded = ChatMessage::decode(&msg.encode()).unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn test_chat_message_minimal() {
        let msg = ChatMessage {
            id: "x".into(),
            sender: "s".into(),
            content: "c".into(),
            timestamp: 7,
            ..ChatMessage::default()
        };
        let bytes = msg.encode();
        // flags + timestamp + three u16-prefixed strings
        assert_eq!(bytes.len(), 1 + 8 + (2 + 1) * 3);
        assert_eq!(bytes[0], 0); // no flags set
        let decoded = ChatMessage::decode(&bytes).unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn test_chat_message_flag_bits() {
        let msg = sample_message();
        let bytes = msg.encode();
        assert_eq!(
            bytes[0],
            MSG_IS_PRIVATE | MSG_HAS_RECIPIENT_NICKNAME | MSG_HAS_SENDER_PEER_ID | MSG_HAS_MENTIONS
        );
    }

    #[test]
    fn test_chat_message_truncated_rejected() {
        let bytes = sample_message().encode();
        assert!(ChatMessage::decode(&bytes[..bytes.len() - 3]).is_err());
    }

    #[test]
    fn test_delivery_ack_round_trip() {
        let ack = DeliveryAck {
            original_message_id: "msg-1".into(),
            ack_id: "ack-1".into(),
            recipient_id: "0102030405060708".into(),
            recipient_nickname: "bob".into(),
            timestamp: 123,
            hop_count: 2,
        };
        assert_eq!(DeliveryAck::decode(&ack.encode()).unwrap(), ack);
    }

    #[test]
    fn test_read_receipt_round_trip() {
        let receipt = ReadReceipt {
            original_message_id: "msg-1".into(),
            receipt_id: "r-1".into(),
            reader_id: "0102030405060708".into(),
            reader_nickname: "bob".into(),
            timestamp: 99,
        };
        assert_eq!(ReadReceipt::decode(&receipt.encode()).unwrap(), receipt);
    }

    #[test]
    fn test_protocol_ack_nack_round_trip() {
        let ack = ProtocolAck {
            original_packet_id: "p-1".into(),
            ack_id: "a-1".into(),
            sender_id: "s".into(),
            receiver_id: "r".into(),
            packet_type: MessageType::NoiseHandshakeInit,
            timestamp: 5,
            hop_count: 1,
        };
        assert_eq!(ProtocolAck::decode(&ack.encode()).unwrap(), ack);

        let nack = ProtocolNack {
            original_packet_id: "p-1".into(),
            nack_id: "n-1".into(),
            sender_id: "s".into(),
            receiver_id: "r".into(),
            packet_type: MessageType::Message,
            timestamp: 5,
            reason: "unsupported".into(),
            error_code: 3,
        };
        assert_eq!(ProtocolNack::decode(&nack.encode()).unwrap(), nack);
    }

    #[test]
    fn test_identity_announcement_sign_verify() {
        use ed25519_dalek::{Signer, SigningKey};

        let signing_key = SigningKey::from_bytes(&[7u8; 32]);
        let mut announcement = NoiseIdentityAnnouncement {
            peer_id: "0102030405060708".into(),
            public_key: vec![1; 32],
            signing_public_key: signing_key.verifying_key().to_bytes().to_vec(),
            nickname: "alice".into(),
            timestamp: 1,
            previous_peer_id: String::new(),
            signature: Vec::new(),
        };
        let hash = [0xAAu8; 32];
        let signature = signing_key.sign(&announcement.signing_payload(&hash));
        announcement.signature = signature.to_bytes().to_vec();

        let decoded = NoiseIdentityAnnouncement::decode(&announcement.encode()).unwrap();
        assert_eq!(decoded, announcement);
        decoded.verify(&hash).unwrap();

        // Binding to a different handshake hash must fail.
        assert!(decoded.verify(&[0xBBu8; 32]).is_err());
    }

    #[test]
    fn test_version_negotiation_round_trip() {
        let hello = VersionHello {
            supported_versions: vec![1],
            preferred_version: 1,
            client_version: "0.1.0".into(),
            platform: "esp32".into(),
            capabilities: vec!["noise".into()],
        };
        assert_eq!(VersionHello::decode(&hello.encode()).unwrap(), hello);

        let ack = VersionAck {
            agreed_version: 1,
            server_version: "0.1.0".into(),
            platform: "linux".into(),
            capabilities: vec![],
            rejected: false,
            reason: String::new(),
        };
        assert_eq!(VersionAck::decode(&ack.encode()).unwrap(), ack);
    }

    #[test]
    fn test_packet_id_hex_is_stable() {
        let a = packet_id_hex(&PeerId::new([1; 8]), Timestamp::new(5));
        let b = packet_id_hex(&PeerId::new([1; 8]), Timestamp::new(5));
        let c = packet_id_hex(&PeerId::new([1; 8]), Timestamp::new(6));
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.len(), 16);
    }
}
