//! Per-connection outgoing sequence counters.

/// Pair of wrapping 16-bit counters for outgoing packet and record
/// identifiers. Owned exclusively by one connection's handler.
#[derive(Debug, Default)]
pub struct SequenceCounter {
    packet_id: u16,
    record_id: u16,
}

impl SequenceCounter {
    /// Both counters start at 0.
    pub fn new() -> Self {
        SequenceCounter::default()
    }

    /// Return the current packet id and advance it, wrapping 65535 to 0.
    pub fn next_packet_id(&mut self) -> u16 {
        let id = self.packet_id;
        self.packet_id = self.packet_id.wrapping_add(1);
        id
    }

    /// Return the current record id and advance it, wrapping 65535 to 0.
    pub fn next_record_id(&mut self) -> u16 {
        let id = self.record_id;
        self.record_id = self.record_id.wrapping_add(1);
        id
    }
}
