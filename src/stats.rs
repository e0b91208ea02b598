//! Process-wide throughput statistics.
//!
//! Connection handlers report periodic [`Snapshot`]s of the packets they
//! received and the replies they sent since their last report. A single
//! aggregator task sums them into [`Totals`] and logs the window on a fixed
//! flush interval.
//!
//! Hand-off is a bounded channel with a non-blocking send: when the queue is
//! full the snapshot is dropped and a warning logged, so a delayed
//! aggregator can never stall a handler.

use std::time::Duration;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

/// Capacity of the snapshot queue feeding the aggregator.
pub const SNAPSHOT_QUEUE_DEPTH: usize = 64;

/// Counts accumulated by one connection since its last report.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Snapshot {
    pub connection_id: u64,
    /// Packets received in this window.
    pub received: u64,
    /// Replies sent in this window.
    pub sent: u64,
}

/// Running sums across all connections since the last flush.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Totals {
    pub num_data: u64,
    pub num_reply: u64,
}

impl Totals {
    /// Fold one snapshot into the running sums.
    pub fn absorb(&mut self, snapshot: &Snapshot) {
        self.num_data += snapshot.received;
        self.num_reply += snapshot.sent;
    }

    /// Return the current sums and reset to zero.
    pub fn take(&mut self) -> Totals {
        std::mem::take(self)
    }

    pub fn is_zero(&self) -> bool {
        *self == Totals::default()
    }
}

/// Cloneable sender handed to each connection handler.
#[derive(Debug, Clone)]
pub struct StatsHandle {
    tx: mpsc::Sender<Snapshot>,
}

impl StatsHandle {
    pub(crate) fn new(tx: mpsc::Sender<Snapshot>) -> Self {
        StatsHandle { tx }
    }

    /// Hand a snapshot to the aggregator without waiting.
    ///
    /// Drops the snapshot if the queue is full; the window totals lose that
    /// delta but the per-connection lifetime counts reported at close are
    /// unaffected.
    pub fn report(&self, snapshot: Snapshot) {
        match self.tx.try_send(snapshot) {
            Ok(()) => {}
            Err(TrySendError::Full(dropped)) => {
                warn!(
                    connection = dropped.connection_id,
                    "stats queue full, dropping snapshot"
                );
            }
            Err(TrySendError::Closed(_)) => {
                debug!("stats aggregator stopped, snapshot discarded");
            }
        }
    }
}

/// Spawn the aggregator task.
///
/// The task logs and resets the totals every `flush_interval`, and exits
/// once every [`StatsHandle`] has been dropped, flushing any remainder.
pub fn spawn_aggregator(flush_interval: Duration) -> (StatsHandle, JoinHandle<()>) {
    let (tx, mut rx) = mpsc::channel::<Snapshot>(SNAPSHOT_QUEUE_DEPTH);
    let task = tokio::spawn(async move {
        let mut totals = Totals::default();
        let first_flush = tokio::time::Instant::now() + flush_interval;
        let mut ticker = tokio::time::interval_at(first_flush, flush_interval);
        loop {
            tokio::select! {
                snapshot = rx.recv() => match snapshot {
                    Some(snapshot) => {
                        trace!(
                            connection = snapshot.connection_id,
                            received = snapshot.received,
                            sent = snapshot.sent,
                            "snapshot received"
                        );
                        totals.absorb(&snapshot);
                    }
                    None => break,
                },
                _ = ticker.tick() => {
                    let window = totals.take();
                    info!(
                        num_data = window.num_data,
                        num_reply = window.num_reply,
                        "stats window"
                    );
                }
            }
        }
        let remainder = totals.take();
        if !remainder.is_zero() {
            info!(
                num_data = remainder.num_data,
                num_reply = remainder.num_reply,
                "stats final"
            );
        }
    });
    (StatsHandle::new(tx), task)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_totals_absorb_and_reset() {
        let mut totals = Totals::default();
        totals.absorb(&Snapshot {
            connection_id: 1,
            received: 5,
            sent: 5,
        });
        totals.absorb(&Snapshot {
            connection_id: 2,
            received: 3,
            sent: 3,
        });
        assert_eq!(
            totals,
            Totals {
                num_data: 8,
                num_reply: 8
            }
        );

        let window = totals.take();
        assert_eq!(window.num_data, 8);
        assert_eq!(window.num_reply, 8);
        assert!(totals.is_zero());
    }

    #[tokio::test]
    async fn test_report_drops_when_queue_full() {
        let (tx, mut rx) = mpsc::channel(1);
        let handle = StatsHandle::new(tx);
        let snapshot = Snapshot {
            connection_id: 1,
            received: 1,
            sent: 1,
        };

        handle.report(snapshot);
        // Queue full: this one is dropped, not blocked on.
        handle.report(snapshot);

        assert_eq!(rx.recv().await, Some(snapshot));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_aggregator_exits_when_handles_dropped() {
        let (handle, task) = spawn_aggregator(Duration::from_secs(3600));
        handle.report(Snapshot {
            connection_id: 1,
            received: 2,
            sent: 2,
        });
        drop(handle);
        task.await.unwrap();
    }
}
