//! TCP listener and shutdown coordination.
//!
//! Accepts connections, hands each one to its own session task, and tracks
//! how many are active. A shutdown signal (or a failed accept) stops the
//! accept loop; the coordinator then waits for every active session to
//! deliver its final report before logging the per-connection summary and
//! returning. Running sessions are never cancelled.

use crate::config::Config;
use crate::session::{self, ConnectionReport};
use crate::stats;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info};

/// Server instance
pub struct Server {
    config: Arc<Config>,
}

impl Server {
    /// Create a new server instance
    pub fn new(config: Config) -> Self {
        Server {
            config: Arc::new(config),
        }
    }

    /// Bind the configured address and serve until shutdown.
    ///
    /// A bind failure is fatal and propagates to the caller.
    pub async fn run(
        &self,
        shutdown: watch::Receiver<bool>,
    ) -> Result<(), Box<dyn std::error::Error>> {
        let listener = TcpListener::bind(&self.config.listen).await?;
        info!(
            address = %self.config.listen,
            max_packets = ?self.config.max_packets,
            "server listening"
        );
        self.serve(listener, shutdown).await;
        Ok(())
    }

    /// Accept connections on `listener` until `shutdown` fires or accept
    /// fails, then drain every active session before returning.
    pub async fn serve(&self, listener: TcpListener, mut shutdown: watch::Receiver<bool>) {
        let flush_interval = Duration::from_secs(self.config.flush_interval);
        let (stats, stats_task) = stats::spawn_aggregator(flush_interval);
        let (report_tx, mut report_rx) = mpsc::unbounded_channel::<ConnectionReport>();

        // Connection ids are assigned here and nowhere else.
        let mut next_connection_id: u64 = 1;
        let mut active: usize = 0;
        let mut summary: Vec<ConnectionReport> = Vec::new();

        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    // A dropped sender counts as a shutdown request.
                    if changed.is_err() || *shutdown.borrow() {
                        info!("shutdown requested, no longer accepting");
                        break;
                    }
                }
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        let connection_id = next_connection_id;
                        next_connection_id += 1;
                        active += 1;
                        debug!(connection = connection_id, peer = %peer, "accepted connection");

                        let config = Arc::clone(&self.config);
                        let stats = stats.clone();
                        let report_tx = report_tx.clone();
                        tokio::spawn(async move {
                            let report =
                                session::handle_connection(stream, connection_id, config, stats)
                                    .await;
                            let _ = report_tx.send(report);
                        });
                    }
                    Err(e) => {
                        // Fail-fast: a broken listener drains into shutdown.
                        error!(error = %e, "accept failed, shutting down");
                        break;
                    }
                },
                Some(report) = report_rx.recv() => {
                    active -= 1;
                    debug!(
                        connection = report.connection_id,
                        received = report.received,
                        sent = report.sent,
                        "connection finished"
                    );
                    summary.push(report);
                }
            }
        }

        drop(listener);

        // Active sessions run to their natural end; wait for every final
        // report before declaring the server stopped.
        while active > 0 {
            if let Some(report) = report_rx.recv().await {
                active -= 1;
                debug!(
                    connection = report.connection_id,
                    received = report.received,
                    sent = report.sent,
                    "connection finished"
                );
                summary.push(report);
            }
        }

        // Closing the last stats handle lets the aggregator flush and exit.
        drop(stats);
        let _ = stats_task.await;

        summary.sort_by_key(|report| report.connection_id);
        for report in &summary {
            info!(
                connection = report.connection_id,
                received = report.received,
                sent = report.sent,
                "connection summary"
            );
        }
        info!(connections = summary.len(), "server stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::codec::{self, DecodeOutcome};
    use crate::protocol::{Packet, PacketType, Record, SubRecord, SERVICE_TELEDATA};
    use bytes::{Bytes, BytesMut};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;

    fn test_config(max_packets: Option<u64>) -> Config {
        Config {
            listen: "127.0.0.1:0".to_string(),
            max_packets,
            idle_timeout: 5,
            write_timeout: 5,
            close_grace: 0,
            report_interval: 3600,
            flush_interval: 3600,
            log_level: "info".to_string(),
        }
    }

    async fn read_packet(stream: &mut TcpStream, buffer: &mut BytesMut) -> Packet {
        loop {
            match codec::parse(buffer) {
                DecodeOutcome::Frame(packet) => return packet,
                DecodeOutcome::Incomplete => {
                    let mut chunk = [0u8; 1024];
                    let n = stream.read(&mut chunk).await.unwrap();
                    assert!(n > 0, "connection closed while waiting for a frame");
                    buffer.extend_from_slice(&chunk[..n]);
                }
                DecodeOutcome::Corrupt(e) => panic!("corrupt response: {}", e),
            }
        }
    }

    #[tokio::test]
    async fn test_serve_returns_on_shutdown_with_no_connections() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let server = Server::new(test_config(None));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let serve_task = tokio::spawn(async move { server.serve(listener, shutdown_rx).await });
        shutdown_tx.send(true).unwrap();
        serve_task.await.unwrap();
    }

    #[tokio::test]
    async fn test_end_to_end_three_record_confirmation() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = Server::new(test_config(None));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let serve_task = tokio::spawn(async move { server.serve(listener, shutdown_rx).await });

        let mut client = TcpStream::connect(addr).await.unwrap();
        let records = (0..3u16)
            .map(|n| Record {
                number: n,
                service: SERVICE_TELEDATA,
                subrecords: vec![SubRecord::Telemetry {
                    tag: 16,
                    data: Bytes::from_static(&[0xaa, 0xbb]),
                }],
            })
            .collect();
        let packet = Packet::appdata(55, records);
        client
            .write_all(&codec::form(&packet).unwrap())
            .await
            .unwrap();

        let mut buffer = BytesMut::new();
        let reply = read_packet(&mut client, &mut buffer).await;

        // First response of the connection: packet id 0, one confirmation
        // per input record, numbers and order preserved.
        assert_eq!(reply.kind, PacketType::Response);
        assert_eq!(reply.id, 0);
        assert_eq!(reply.response.unwrap().responding_to, 55);
        assert_eq!(reply.records.len(), 1);
        let confirmations: Vec<_> = reply.records[0]
            .subrecords
            .iter()
            .map(|sub| match sub {
                SubRecord::Confirmation {
                    confirmed_record,
                    status,
                } => (*confirmed_record, *status),
                other => panic!("unexpected subrecord: {:?}", other),
            })
            .collect();
        assert_eq!(confirmations, vec![(0, 0), (1, 0), (2, 0)]);

        // Shutdown must wait for the session to finish.
        drop(client);
        shutdown_tx.send(true).unwrap();
        serve_task.await.unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_waits_for_budgeted_session() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = Server::new(test_config(Some(1)));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let serve_task = tokio::spawn(async move { server.serve(listener, shutdown_rx).await });

        let mut client = TcpStream::connect(addr).await.unwrap();
        let packet = Packet::appdata(
            0,
            vec![Record {
                number: 0,
                service: SERVICE_TELEDATA,
                subrecords: vec![SubRecord::Telemetry {
                    tag: 16,
                    data: Bytes::from_static(&[1]),
                }],
            }],
        );
        client
            .write_all(&codec::form(&packet).unwrap())
            .await
            .unwrap();
        let mut buffer = BytesMut::new();
        let reply = read_packet(&mut client, &mut buffer).await;
        assert_eq!(reply.id, 0);

        // The session ends on its own once the budget of 1 is reached, even
        // though the client keeps its end open.
        shutdown_tx.send(true).unwrap();
        serve_task.await.unwrap();
    }
}
