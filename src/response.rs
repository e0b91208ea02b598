//! Confirmation response construction.

use crate::protocol::{
    Packet, PacketType, Record, ResponseHeader, SubRecord, PROC_OK, SERVICE_TELEDATA,
};

/// Build the confirmation packet for one received packet.
///
/// Emits one [`SubRecord::Confirmation`] per input record, in input order,
/// each confirming that record's number with a success status. The
/// confirmations travel in a single output record numbered `record_id`,
/// under the input's service tag, inside a response packet carrying
/// `packet_id` and referencing the input packet's id.
///
/// Pure and deterministic; callers advance the sequence counters.
pub fn build_response(received: &Packet, packet_id: u16, record_id: u16) -> Packet {
    let confirmations = received
        .records
        .iter()
        .map(|record| SubRecord::Confirmation {
            confirmed_record: record.number,
            status: PROC_OK,
        })
        .collect();

    let service = received
        .records
        .first()
        .map(|record| record.service)
        .unwrap_or(SERVICE_TELEDATA);

    Packet {
        kind: PacketType::Response,
        id: packet_id,
        records: vec![Record {
            number: record_id,
            service,
            subrecords: confirmations,
        }],
        response: Some(ResponseHeader {
            responding_to: received.id,
            proc_result: PROC_OK,
        }),
    }
}
