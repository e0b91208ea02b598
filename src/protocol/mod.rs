//! Data model for the framed telemetry protocol.
//!
//! A wire frame carries one [`Packet`]. Packets hold numbered [`Record`]s,
//! each of which holds tagged [`SubRecord`]s: opaque telemetry data on the
//! way in, confirmations on the way out. Encoding and decoding of frames
//! lives in [`codec`].

pub mod codec;

use bytes::Bytes;

/// Service tag for telemetry data records.
pub const SERVICE_TELEDATA: u8 = 2;

/// Wire tag for the confirmation subrecord.
pub const SR_CONFIRMATION: u8 = 0;

/// Processing result code for a successfully handled packet.
pub const PROC_OK: u8 = 0;

/// Kind of packet carried by a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketType {
    /// Server-to-client confirmation packet.
    Response,
    /// Client-to-server application data packet.
    Appdata,
}

impl PacketType {
    /// Wire tag for this packet kind.
    pub fn wire_tag(self) -> u8 {
        match self {
            PacketType::Response => 0,
            PacketType::Appdata => 1,
        }
    }

    /// Decode a wire tag, if known.
    pub fn from_wire(tag: u8) -> Option<Self> {
        match tag {
            0 => Some(PacketType::Response),
            1 => Some(PacketType::Appdata),
            _ => None,
        }
    }
}

/// Packet-level payload present on `Response` packets only.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResponseHeader {
    /// Identifier of the packet being responded to.
    pub responding_to: u16,
    /// Overall processing result (0 = success).
    pub proc_result: u8,
}

/// Tagged payload variant within a record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubRecord {
    /// Opaque telemetry payload, passed through undecoded.
    Telemetry { tag: u8, data: Bytes },
    /// Acknowledgement of one received record.
    Confirmation { confirmed_record: u16, status: u8 },
}

/// A numbered sub-unit of a packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    /// Record number, assigned by the sender.
    pub number: u16,
    /// Service tag (e.g. [`SERVICE_TELEDATA`]).
    pub service: u8,
    /// Ordered subrecords.
    pub subrecords: Vec<SubRecord>,
}

/// One self-delimited unit of the wire protocol.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub kind: PacketType,
    /// Packet identifier, assigned by the sender.
    pub id: u16,
    /// Ordered records.
    pub records: Vec<Record>,
    /// Present exactly when `kind` is [`PacketType::Response`].
    pub response: Option<ResponseHeader>,
}

impl Packet {
    /// Build an application data packet.
    pub fn appdata(id: u16, records: Vec<Record>) -> Self {
        Packet {
            kind: PacketType::Appdata,
            id,
            records,
            response: None,
        }
    }
}
