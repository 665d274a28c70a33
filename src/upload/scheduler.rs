// # Queue Scheduler
//
// Observes the batch's queued items and the transport's active-transfer
// count, and starts new transfers up to the concurrency budget. A pass is
// synchronous bookkeeping; the transfers themselves run as spawned tasks
// that report back through the outcome channel so the engine re-fires the
// scheduler once a slot frees up.

use super::batch::BatchState;
use super::transport::TransportManager;
use crate::error::UploadError;
use crate::models::ClientId;
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc as tokio_mpsc;
use tracing::{debug, info, warn};

/// Result of an attempted `start_transfer`, reported to the engine loop.
#[derive(Debug)]
pub struct StartOutcome {
    pub client_id: ClientId,
    pub result: Result<(), UploadError>,
}

#[derive(Clone)]
pub struct QueueScheduler {
    transport: TransportManager,
    max_concurrent: usize,
    /// Starts issued but not yet reported back; the de-dup guard, and part
    /// of slot accounting so an issued start cannot double-book a slot
    /// before its record mutates.
    starting: Arc<Mutex<HashSet<ClientId>>>,
    outcome_tx: tokio_mpsc::UnboundedSender<StartOutcome>,
}

impl QueueScheduler {
    pub fn new(
        transport: TransportManager,
        max_concurrent: usize,
        outcome_tx: tokio_mpsc::UnboundedSender<StartOutcome>,
    ) -> Self {
        QueueScheduler {
            transport,
            max_concurrent: max_concurrent.max(1),
            starting: Arc::new(Mutex::new(HashSet::new())),
            outcome_tx,
        }
    }

    /// Run one scheduling pass. Returns how many transfers were started.
    ///
    /// Takes the oldest queued items FIFO and starts each unless a start is
    /// already in flight, the record is stale (missing, no file handle, or
    /// carrying a session id from a previous context - those are purged and
    /// the item failed with an expired-session error), or the record is not
    /// startable.
    pub fn pass(&self, batch: &mut BatchState) -> usize {
        let mut starting = self.starting.lock().unwrap();

        let snapshot = self.transport.snapshot();
        let active: HashSet<ClientId> = snapshot
            .values()
            .filter(|r| r.status.is_active())
            .map(|r| r.client_ref)
            .chain(starting.iter().copied())
            .collect();

        let available = self.max_concurrent.saturating_sub(active.len());
        if available == 0 {
            return 0;
        }

        let queued = batch.queued_client_ids();
        if queued.is_empty() {
            return 0;
        }

        let mut started = 0;
        for client_id in queued {
            if started >= available {
                break;
            }
            if starting.contains(&client_id) {
                continue;
            }

            match snapshot.get(&client_id) {
                None => {
                    warn!(
                        "QueueScheduler: no transport record for queued item {}, failing it",
                        client_id
                    );
                    batch.fail_item(&client_id, UploadError::expired_session());
                    continue;
                }
                Some(record) if record.file.is_none() || record.session_id.is_some() => {
                    // Rehydrated or stale record from a previous session:
                    // purge it instead of pretending it can resume.
                    warn!(
                        "QueueScheduler: purging stale record for {} (file: {}, session: {:?})",
                        client_id,
                        record.file.is_some(),
                        record.session_id
                    );
                    self.transport.remove_record(&client_id);
                    batch.fail_item(&client_id, UploadError::expired_session());
                    continue;
                }
                Some(record) if !record.status.is_startable() => {
                    debug!(
                        "QueueScheduler: record {} not startable ({:?}), skipping",
                        client_id, record.status
                    );
                    continue;
                }
                Some(_) => {}
            }

            starting.insert(client_id);
            started += 1;
            info!("QueueScheduler: starting transfer for {}", client_id);

            let transport = self.transport.clone();
            let starting_guard = self.starting.clone();
            let outcome_tx = self.outcome_tx.clone();
            tokio::spawn(async move {
                let result = transport.start_transfer(client_id).await;
                starting_guard.lock().unwrap().remove(&client_id);
                // Receiver gone means the engine shut down; nothing to do.
                let _ = outcome_tx.send(StartOutcome { client_id, result });
            });
        }

        started
    }

    /// Number of starts currently in flight.
    pub fn starting_count(&self) -> usize {
        self.starting.lock().unwrap().len()
    }

    /// Dialog close: clear the transient bookkeeping only. In-flight
    /// network transfers are deliberately left to run to completion.
    pub fn clear_pending_starts(&self) {
        self.starting.lock().unwrap().clear();
    }
}
