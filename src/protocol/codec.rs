//! Wire codec for telemetry frames.
//!
//! Frame layout:
//!
//! ```text
//! magic   u8      0x54
//! version u8      0x01
//! kind    u8      packet type tag
//! id      u16 LE  packet identifier
//! len     u16 LE  body length in bytes
//! body    [len]   response header (Response packets only), record count,
//!                 records
//! check   u8      wrapping byte sum of header + body
//! ```
//!
//! Decoding distinguishes "the buffer does not yet hold a full frame" from
//! "the bytes cannot be a valid frame": [`parse`] returns
//! [`DecodeOutcome::Incomplete`] for the former (the buffer is left intact
//! for the next read) and [`DecodeOutcome::Corrupt`] for the latter (the
//! caller decides how much to discard).

use super::{Packet, PacketType, Record, ResponseHeader, SubRecord, SR_CONFIRMATION};
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// First byte of every frame.
pub const MAGIC: u8 = 0x54;

/// Protocol version this codec speaks.
pub const VERSION: u8 = 0x01;

/// Fixed header size preceding the body.
const HEADER_LEN: usize = 7;

/// Encoded size of a confirmation subrecord payload.
const CONFIRMATION_LEN: usize = 3;

/// Outcome of attempting to decode one frame from the front of a buffer.
#[derive(Debug)]
pub enum DecodeOutcome {
    /// A complete frame was consumed from the buffer.
    Frame(Packet),
    /// The buffer holds a prefix of a valid frame; read more bytes.
    Incomplete,
    /// The buffer front cannot be a valid frame. Nothing was consumed.
    Corrupt(CodecError),
}

/// Codec failures.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    /// First byte is not the frame magic.
    BadMagic(u8),
    /// Unsupported protocol version.
    BadVersion(u8),
    /// Unknown packet type tag.
    UnknownKind(u8),
    /// Checksum over header + body does not match the trailing byte.
    ChecksumMismatch { expected: u8, found: u8 },
    /// Body ended in the middle of a field.
    TruncatedBody,
    /// Body bytes left over after the declared records.
    TrailingBytes(usize),
    /// Confirmation subrecord with the wrong payload length.
    BadConfirmationLength(usize),
    /// Response header present/absent does not match the packet kind.
    ResponseHeaderMismatch,
    /// More records than the wire format can express.
    TooManyRecords(usize),
    /// More subrecords in one record than the wire format can express.
    TooManySubRecords(usize),
    /// Subrecord payload larger than the wire format can express.
    OversizedSubRecord(usize),
    /// Body larger than the wire format can express.
    OversizedBody(usize),
}

impl std::fmt::Display for CodecError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CodecError::BadMagic(b) => write!(f, "bad frame magic: {:#04x}", b),
            CodecError::BadVersion(v) => write!(f, "unsupported protocol version: {}", v),
            CodecError::UnknownKind(t) => write!(f, "unknown packet type tag: {}", t),
            CodecError::ChecksumMismatch { expected, found } => {
                write!(f, "checksum mismatch: expected {:#04x}, found {:#04x}", expected, found)
            }
            CodecError::TruncatedBody => write!(f, "frame body ends mid-field"),
            CodecError::TrailingBytes(n) => write!(f, "{} stray bytes after last record", n),
            CodecError::BadConfirmationLength(n) => {
                write!(f, "confirmation subrecord with payload length {}", n)
            }
            CodecError::ResponseHeaderMismatch => {
                write!(f, "response header does not match packet kind")
            }
            CodecError::TooManyRecords(n) => write!(f, "{} records exceed wire limit", n),
            CodecError::TooManySubRecords(n) => write!(f, "{} subrecords exceed wire limit", n),
            CodecError::OversizedSubRecord(n) => {
                write!(f, "subrecord payload of {} bytes exceeds wire limit", n)
            }
            CodecError::OversizedBody(n) => write!(f, "body of {} bytes exceeds wire limit", n),
        }
    }
}

impl std::error::Error for CodecError {}

/// Try to decode one frame from the front of `buffer`.
///
/// On [`DecodeOutcome::Frame`] exactly the frame's bytes have been consumed
/// and any following bytes remain in place. On any other outcome the buffer
/// is untouched.
pub fn parse(buffer: &mut BytesMut) -> DecodeOutcome {
    if buffer.is_empty() {
        return DecodeOutcome::Incomplete;
    }
    if buffer[0] != MAGIC {
        return DecodeOutcome::Corrupt(CodecError::BadMagic(buffer[0]));
    }
    if buffer.len() >= 2 && buffer[1] != VERSION {
        return DecodeOutcome::Corrupt(CodecError::BadVersion(buffer[1]));
    }
    if buffer.len() < HEADER_LEN {
        return DecodeOutcome::Incomplete;
    }

    let kind_tag = buffer[2];
    let id = u16::from_le_bytes([buffer[3], buffer[4]]);
    let body_len = u16::from_le_bytes([buffer[5], buffer[6]]) as usize;
    let total = HEADER_LEN + body_len + 1;
    if buffer.len() < total {
        return DecodeOutcome::Incomplete;
    }

    let expected = checksum(&buffer[..HEADER_LEN + body_len]);
    let found = buffer[HEADER_LEN + body_len];
    if expected != found {
        return DecodeOutcome::Corrupt(CodecError::ChecksumMismatch { expected, found });
    }

    let kind = match PacketType::from_wire(kind_tag) {
        Some(kind) => kind,
        None => return DecodeOutcome::Corrupt(CodecError::UnknownKind(kind_tag)),
    };

    match decode_body(kind, id, &buffer[HEADER_LEN..HEADER_LEN + body_len]) {
        Ok(packet) => {
            buffer.advance(total);
            DecodeOutcome::Frame(packet)
        }
        Err(e) => DecodeOutcome::Corrupt(e),
    }
}

/// Serialize a packet into its wire frame.
///
/// Fails only if the packet's logical structure cannot be expressed on the
/// wire; it never performs I/O.
pub fn form(packet: &Packet) -> Result<Bytes, CodecError> {
    match (packet.kind, &packet.response) {
        (PacketType::Response, None) | (PacketType::Appdata, Some(_)) => {
            return Err(CodecError::ResponseHeaderMismatch);
        }
        _ => {}
    }
    if packet.records.len() > u8::MAX as usize {
        return Err(CodecError::TooManyRecords(packet.records.len()));
    }

    let mut body = BytesMut::new();
    if let Some(header) = &packet.response {
        body.put_u16_le(header.responding_to);
        body.put_u8(header.proc_result);
    }
    body.put_u8(packet.records.len() as u8);
    for record in &packet.records {
        if record.subrecords.len() > u8::MAX as usize {
            return Err(CodecError::TooManySubRecords(record.subrecords.len()));
        }
        body.put_u16_le(record.number);
        body.put_u8(record.service);
        body.put_u8(record.subrecords.len() as u8);
        for subrecord in &record.subrecords {
            match subrecord {
                SubRecord::Confirmation {
                    confirmed_record,
                    status,
                } => {
                    body.put_u8(SR_CONFIRMATION);
                    body.put_u16_le(CONFIRMATION_LEN as u16);
                    body.put_u16_le(*confirmed_record);
                    body.put_u8(*status);
                }
                SubRecord::Telemetry { tag, data } => {
                    if data.len() > u16::MAX as usize {
                        return Err(CodecError::OversizedSubRecord(data.len()));
                    }
                    body.put_u8(*tag);
                    body.put_u16_le(data.len() as u16);
                    body.put_slice(data);
                }
            }
        }
    }
    if body.len() > u16::MAX as usize {
        return Err(CodecError::OversizedBody(body.len()));
    }

    let mut frame = BytesMut::with_capacity(HEADER_LEN + body.len() + 1);
    frame.put_u8(MAGIC);
    frame.put_u8(VERSION);
    frame.put_u8(packet.kind.wire_tag());
    frame.put_u16_le(packet.id);
    frame.put_u16_le(body.len() as u16);
    frame.put_slice(&body);
    let check = checksum(&frame);
    frame.put_u8(check);
    Ok(frame.freeze())
}

/// Wrapping byte sum over header and body.
fn checksum(bytes: &[u8]) -> u8 {
    bytes.iter().fold(0u8, |sum, b| sum.wrapping_add(*b))
}

fn decode_body(kind: PacketType, id: u16, body: &[u8]) -> Result<Packet, CodecError> {
    let mut reader = Reader::new(body);
    let response = if kind == PacketType::Response {
        Some(ResponseHeader {
            responding_to: reader.read_u16()?,
            proc_result: reader.read_u8()?,
        })
    } else {
        None
    };
    let num_records = reader.read_u8()? as usize;
    let mut records = Vec::with_capacity(num_records);
    for _ in 0..num_records {
        let number = reader.read_u16()?;
        let service = reader.read_u8()?;
        let num_subrecords = reader.read_u8()? as usize;
        let mut subrecords = Vec::with_capacity(num_subrecords);
        for _ in 0..num_subrecords {
            let tag = reader.read_u8()?;
            let len = reader.read_u16()? as usize;
            let data = reader.read_bytes(len)?;
            if tag == SR_CONFIRMATION {
                if len != CONFIRMATION_LEN {
                    return Err(CodecError::BadConfirmationLength(len));
                }
                subrecords.push(SubRecord::Confirmation {
                    confirmed_record: u16::from_le_bytes([data[0], data[1]]),
                    status: data[2],
                });
            } else {
                subrecords.push(SubRecord::Telemetry {
                    tag,
                    data: Bytes::copy_from_slice(data),
                });
            }
        }
        records.push(Record {
            number,
            service,
            subrecords,
        });
    }
    let leftover = reader.remaining();
    if leftover != 0 {
        return Err(CodecError::TrailingBytes(leftover));
    }
    Ok(Packet {
        kind,
        id,
        records,
        response,
    })
}

/// Bounds-checked reader over a body slice.
struct Reader<'a> {
    body: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(body: &'a [u8]) -> Self {
        Reader { body, pos: 0 }
    }

    fn remaining(&self) -> usize {
        self.body.len() - self.pos
    }

    fn read_u8(&mut self) -> Result<u8, CodecError> {
        let bytes = self.read_bytes(1)?;
        Ok(bytes[0])
    }

    fn read_u16(&mut self) -> Result<u16, CodecError> {
        let bytes = self.read_bytes(2)?;
        Ok(u16::from_le_bytes([bytes[0], bytes[1]]))
    }

    fn read_bytes(&mut self, len: usize) -> Result<&'a [u8], CodecError> {
        if self.remaining() < len {
            return Err(CodecError::TruncatedBody);
        }
        let bytes = &self.body[self.pos..self.pos + len];
        self.pos += len;
        Ok(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::SERVICE_TELEDATA;

    fn sample_appdata(id: u16, num_records: u16) -> Packet {
        let records = (0..num_records)
            .map(|n| Record {
                number: n,
                service: SERVICE_TELEDATA,
                subrecords: vec![SubRecord::Telemetry {
                    tag: 16,
                    data: Bytes::from_static(&[0xde, 0xad, 0xbe, 0xef]),
                }],
            })
            .collect();
        Packet::appdata(id, records)
    }

    #[test]
    fn test_form_then_parse_appdata() {
        let packet = sample_appdata(42, 3);
        let wire = form(&packet).unwrap();
        let mut buffer = BytesMut::from(&wire[..]);

        match parse(&mut buffer) {
            DecodeOutcome::Frame(decoded) => assert_eq!(decoded, packet),
            other => panic!("unexpected: {:?}", other),
        }
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_parse_prefix_is_incomplete() {
        let wire = form(&sample_appdata(1, 2)).unwrap();

        // Every strict prefix must ask for more bytes and consume nothing.
        for cut in 0..wire.len() {
            let mut buffer = BytesMut::from(&wire[..cut]);
            match parse(&mut buffer) {
                DecodeOutcome::Incomplete => {}
                other => panic!("prefix of {} bytes: unexpected {:?}", cut, other),
            }
            assert_eq!(buffer.len(), cut);
        }
    }

    #[test]
    fn test_parse_concatenated_frames() {
        let first = sample_appdata(0, 1);
        let second = sample_appdata(1, 2);
        let mut buffer = BytesMut::new();
        buffer.extend_from_slice(&form(&first).unwrap());
        buffer.extend_from_slice(&form(&second).unwrap());

        match parse(&mut buffer) {
            DecodeOutcome::Frame(decoded) => assert_eq!(decoded, first),
            other => panic!("unexpected: {:?}", other),
        }
        match parse(&mut buffer) {
            DecodeOutcome::Frame(decoded) => assert_eq!(decoded, second),
            other => panic!("unexpected: {:?}", other),
        }
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_parse_bad_magic() {
        let mut buffer = BytesMut::from(&b"garbage"[..]);
        match parse(&mut buffer) {
            DecodeOutcome::Corrupt(CodecError::BadMagic(b'g')) => {}
            other => panic!("unexpected: {:?}", other),
        }
        // Nothing consumed; the caller chooses what to discard.
        assert_eq!(&buffer[..], b"garbage");
    }

    #[test]
    fn test_parse_checksum_mismatch() {
        let wire = form(&sample_appdata(5, 1)).unwrap();
        let mut corrupted = BytesMut::from(&wire[..]);
        let body_byte = wire.len() - 2;
        corrupted[body_byte] ^= 0xff;

        match parse(&mut corrupted) {
            DecodeOutcome::Corrupt(CodecError::ChecksumMismatch { .. }) => {}
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_parse_unknown_kind() {
        let wire = form(&sample_appdata(5, 1)).unwrap();
        let mut corrupted = BytesMut::from(&wire[..]);
        corrupted[2] = 9;
        // Fix the checksum so only the kind tag is wrong.
        let end = corrupted.len() - 1;
        let check = checksum(&corrupted[..end]);
        corrupted[end] = check;

        match parse(&mut corrupted) {
            DecodeOutcome::Corrupt(CodecError::UnknownKind(9)) => {}
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_form_then_parse_response() {
        let packet = Packet {
            kind: PacketType::Response,
            id: 7,
            records: vec![Record {
                number: 0,
                service: SERVICE_TELEDATA,
                subrecords: vec![
                    SubRecord::Confirmation {
                        confirmed_record: 12,
                        status: 0,
                    },
                    SubRecord::Confirmation {
                        confirmed_record: 13,
                        status: 0,
                    },
                ],
            }],
            response: Some(ResponseHeader {
                responding_to: 99,
                proc_result: 0,
            }),
        };
        let wire = form(&packet).unwrap();
        let mut buffer = BytesMut::from(&wire[..]);

        match parse(&mut buffer) {
            DecodeOutcome::Frame(decoded) => assert_eq!(decoded, packet),
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_form_rejects_header_mismatch() {
        let mut packet = sample_appdata(1, 1);
        packet.response = Some(ResponseHeader {
            responding_to: 0,
            proc_result: 0,
        });
        assert_eq!(form(&packet), Err(CodecError::ResponseHeaderMismatch));

        let headerless = Packet {
            kind: PacketType::Response,
            id: 0,
            records: Vec::new(),
            response: None,
        };
        assert_eq!(form(&headerless), Err(CodecError::ResponseHeaderMismatch));
    }

    #[test]
    fn test_form_rejects_oversized_subrecord() {
        let packet = Packet::appdata(
            0,
            vec![Record {
                number: 0,
                service: SERVICE_TELEDATA,
                subrecords: vec![SubRecord::Telemetry {
                    tag: 16,
                    data: Bytes::from(vec![0u8; u16::MAX as usize + 1]),
                }],
            }],
        );
        assert_eq!(
            form(&packet),
            Err(CodecError::OversizedSubRecord(u16::MAX as usize + 1))
        );
    }
}
