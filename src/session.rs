//! Per-connection session handling.
//!
//! One task per accepted connection drives the full lifecycle: read bytes
//! under an idle deadline, reassemble frames from the connection's own
//! buffer, confirm each decoded packet in arrival order, and report counts.
//! Responses are strictly ordered; response *k* is fully written before
//! packet *k+1* is taken from the buffer.
//!
//! Any transport error is terminal for the connection and for nothing else.
//! A corrupt frame costs the buffered bytes but keeps the connection open;
//! an incomplete frame just waits for the next read.

use crate::config::Config;
use crate::protocol::codec::{self, DecodeOutcome};
use crate::response::build_response;
use crate::sequence::SequenceCounter;
use crate::stats::{Snapshot, StatsHandle};
use bytes::BytesMut;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::{interval_at, timeout, timeout_at, Instant};
use tracing::{debug, trace, warn};

/// Upper bound on bytes taken from the socket per read call.
const READ_CHUNK: usize = 1024;

/// Final lifetime counts for one connection, delivered exactly once to the
/// shutdown coordinator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionReport {
    pub connection_id: u64,
    pub received: u64,
    pub sent: u64,
}

/// Drive one connection until it ends.
///
/// The connection ends on read error, EOF, idle timeout, write failure, or
/// once the configured packet budget is reached. After the loop the
/// remaining stats delta is reported, the close grace period (if any) lets
/// in-flight bytes drain, and the final report is returned.
pub async fn handle_connection(
    mut stream: TcpStream,
    connection_id: u64,
    config: Arc<Config>,
    stats: StatsHandle,
) -> ConnectionReport {
    let idle = Duration::from_secs(config.idle_timeout);
    let write_deadline = Duration::from_secs(config.write_timeout);
    let report_period = Duration::from_secs(config.report_interval);

    // Unconsumed bytes; owned by this task alone.
    let mut buffer = BytesMut::with_capacity(4 * READ_CHUNK);
    let mut chunk = [0u8; READ_CHUNK];
    let mut seq = SequenceCounter::new();
    let mut received: u64 = 0;
    let mut sent: u64 = 0;
    // Deltas since the last snapshot report.
    let mut window_received: u64 = 0;
    let mut window_sent: u64 = 0;

    let mut report_ticker = interval_at(Instant::now() + report_period, report_period);
    let mut idle_deadline = Instant::now() + idle;

    'connection: while config.max_packets.map_or(true, |budget| received < budget) {
        tokio::select! {
            _ = report_ticker.tick() => {
                stats.report(Snapshot {
                    connection_id,
                    received: window_received,
                    sent: window_sent,
                });
                window_received = 0;
                window_sent = 0;
                continue;
            }
            read = timeout_at(idle_deadline, stream.read(&mut chunk)) => match read {
                Err(_) => {
                    debug!(connection = connection_id, "idle timeout, closing");
                    break 'connection;
                }
                Ok(Err(e)) => {
                    debug!(connection = connection_id, error = %e, "read failed");
                    break 'connection;
                }
                Ok(Ok(0)) => {
                    trace!(connection = connection_id, "closed by peer");
                    break 'connection;
                }
                Ok(Ok(n)) => {
                    idle_deadline = Instant::now() + idle;
                    buffer.extend_from_slice(&chunk[..n]);
                }
            }
        }

        // Drain every complete frame the buffer now holds, in order.
        while !buffer.is_empty() {
            match codec::parse(&mut buffer) {
                DecodeOutcome::Frame(packet) => {
                    trace!(
                        connection = connection_id,
                        packet_id = packet.id,
                        records = packet.records.len(),
                        "received packet"
                    );
                    received += 1;
                    window_received += 1;

                    let reply =
                        build_response(&packet, seq.next_packet_id(), seq.next_record_id());
                    let wire = match codec::form(&reply) {
                        Ok(wire) => wire,
                        Err(e) => {
                            // No reply for this cycle; the connection lives on.
                            warn!(connection = connection_id, error = %e, "failed to form response");
                            break;
                        }
                    };
                    match timeout(write_deadline, stream.write_all(&wire)).await {
                        Ok(Ok(())) => {
                            sent += 1;
                            window_sent += 1;
                        }
                        Ok(Err(e)) => {
                            warn!(connection = connection_id, error = %e, "write failed");
                            break 'connection;
                        }
                        Err(_) => {
                            warn!(connection = connection_id, "write timed out");
                            break 'connection;
                        }
                    }
                    if config.max_packets.map_or(false, |budget| received >= budget) {
                        break;
                    }
                }
                DecodeOutcome::Incomplete => break,
                DecodeOutcome::Corrupt(e) => {
                    warn!(
                        connection = connection_id,
                        error = %e,
                        discarded = buffer.len(),
                        "corrupt frame, discarding buffer"
                    );
                    buffer.clear();
                    break;
                }
            }
        }
    }

    if window_received != 0 || window_sent != 0 {
        stats.report(Snapshot {
            connection_id,
            received: window_received,
            sent: window_sent,
        });
    }
    if config.close_grace > 0 {
        tokio::time::sleep(Duration::from_secs(config.close_grace)).await;
    }
    debug!(connection = connection_id, received, sent, "closing connection");
    ConnectionReport {
        connection_id,
        received,
        sent,
    }
}
