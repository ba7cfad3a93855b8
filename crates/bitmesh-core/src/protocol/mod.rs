//! Wire protocol: framing, inner message codecs, fragmentation, compression
//! and duplicate suppression.

pub mod compression;
pub mod deduplication;
pub mod fragmentation;
pub mod message;
pub mod packet;

pub use deduplication::{BloomFilter, PacketId};
pub use fragmentation::{FragmentId, FragmentReassembler};
pub use message::{
    ChatMessage, DeliveryAck, NoiseIdentityAnnouncement, ProtocolAck, ProtocolNack, ReadReceipt,
    VersionAck, VersionHello,
};
pub use packet::{MessageType, Packet, PacketFlags, MAX_PAYLOAD_SIZE, PROTOCOL_VERSION};
