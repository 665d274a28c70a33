// # Upload Engine - Orchestrator
//
// Thin coordinator wiring the focused services together:
// - TransportManager: low-level transfer state machine per file
// - reconcile(): pure projection of transport state onto batch items
// - QueueScheduler: starts transfers within the concurrency budget
// - StabilityVerifier: confirms completed uploads are durable server-side
// - FinalizeCoordinator: commits the batch
//
// One spawned worker task owns every reconciliation/scheduling pass, so
// passes run synchronously to completion and never interleave. Everything
// else (transport notifications, start outcomes, stability changes, batch
// mutations) just feeds that loop through channels.

use super::batch::BatchState;
use super::finalize::{FinalizeCoordinator, FinalizeError};
use super::reconcile::reconcile;
use super::scheduler::{QueueScheduler, StartOutcome};
use super::stability::{StabilityState, StabilityVerifier};
use super::transport::TransportManager;
use crate::api::{AssetRecord, FinalizeRequest, UploadApi};
use crate::config::UploadConfig;
use crate::models::{
    BatchContext, CategoryField, ClientId, NewUpload, SessionId, UploadItem, Warning,
};
use std::collections::HashMap;
use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc, Mutex,
};
use std::time::Instant;
use tokio::sync::mpsc as tokio_mpsc;
use tracing::{debug, info, warn};

/// Notifications for whoever renders the batch.
#[derive(Debug, Clone)]
pub enum BatchEvent {
    /// Item list or item state changed; pull a fresh `items()` snapshot.
    ItemsChanged,
    /// A session's durability state changed; check `stability_states()`.
    StabilityChanged,
    /// The batch was committed; refresh the asset catalog view.
    Finalized { assets: Vec<AssetRecord> },
}

struct EngineInner {
    config: UploadConfig,
    transport: TransportManager,
    batch: Mutex<BatchState>,
    scheduler: QueueScheduler,
    verifier: StabilityVerifier,
    coordinator: FinalizeCoordinator,
    nudge_tx: tokio_mpsc::UnboundedSender<()>,
    subscribers: Mutex<HashMap<u64, tokio_mpsc::UnboundedSender<BatchEvent>>>,
    next_subscription_id: AtomicU64,
}

/// Cloneable handle to one upload dialog session's orchestration.
///
/// The transport manager is injected: it outlives the engine and is shared
/// across dialog sessions, which is exactly why stale-record filtering
/// exists in the scheduler.
#[derive(Clone)]
pub struct UploadEngine {
    inner: Arc<EngineInner>,
}

impl UploadEngine {
    /// Build the engine and spawn its worker loop on the current runtime.
    pub fn start(
        api: Arc<dyn UploadApi>,
        transport: TransportManager,
        context: BatchContext,
        config: UploadConfig,
    ) -> Self {
        let (start_tx, start_rx) = tokio_mpsc::unbounded_channel();
        let (stability_tx, stability_rx) = tokio_mpsc::unbounded_channel();
        let (nudge_tx, nudge_rx) = tokio_mpsc::unbounded_channel();
        let transport_rx = transport.subscribe();

        let scheduler = QueueScheduler::new(transport.clone(), config.max_concurrent, start_tx);
        let verifier = StabilityVerifier::new(api.clone(), config.stability.clone(), stability_tx);
        let coordinator = FinalizeCoordinator::new(api);

        let engine = UploadEngine {
            inner: Arc::new(EngineInner {
                config,
                transport,
                batch: Mutex::new(BatchState::new(context)),
                scheduler,
                verifier,
                coordinator,
                nudge_tx,
                subscribers: Mutex::new(HashMap::new()),
                next_subscription_id: AtomicU64::new(1),
            }),
        };

        let worker = engine.clone();
        tokio::spawn(async move {
            worker
                .run_event_loop(transport_rx, start_rx, stability_rx, nudge_rx)
                .await;
        });

        engine
    }

    async fn run_event_loop(
        &self,
        mut transport_rx: tokio_mpsc::UnboundedReceiver<super::transport::TransportEvent>,
        mut start_rx: tokio_mpsc::UnboundedReceiver<StartOutcome>,
        mut stability_rx: tokio_mpsc::UnboundedReceiver<SessionId>,
        mut nudge_rx: tokio_mpsc::UnboundedReceiver<()>,
    ) {
        debug!("UploadEngine: worker started");
        loop {
            tokio::select! {
                event = transport_rx.recv() => match event {
                    Some(_) => self.run_pass(),
                    None => break,
                },
                outcome = start_rx.recv() => match outcome {
                    Some(outcome) => self.handle_start_outcome(outcome),
                    None => break,
                },
                changed = stability_rx.recv() => match changed {
                    Some(session_id) => {
                        debug!("UploadEngine: stability changed for {}", session_id);
                        self.emit(BatchEvent::StabilityChanged);
                        self.run_pass();
                    }
                    None => break,
                },
                nudge = nudge_rx.recv() => match nudge {
                    Some(()) => self.run_pass(),
                    None => break,
                },
            }
        }
        debug!("UploadEngine: worker exiting");
    }

    /// One synchronous reconciliation + scheduling pass.
    fn run_pass(&self) {
        let inner = &self.inner;
        let changed = {
            let mut batch = inner.batch.lock().unwrap();
            let snapshot = inner.transport.snapshot();
            let next = reconcile(
                &snapshot,
                batch.items(),
                Instant::now(),
                &inner.config.reconcile,
            );
            let changed = next.as_slice() != batch.items();
            batch.apply_reconciled(next);

            // Every complete item enters the durability check; tracking is
            // de-duplicated inside the verifier.
            for item in batch.completed_items() {
                if let Some(session_id) = &item.session_id {
                    inner.verifier.track(session_id.clone());
                }
            }

            inner.scheduler.pass(&mut batch);
            changed
        };

        if changed {
            self.emit(BatchEvent::ItemsChanged);
        }
    }

    fn handle_start_outcome(&self, outcome: StartOutcome) {
        if let Err(e) = outcome.result {
            warn!(
                "UploadEngine: start for {} failed ({}): {}",
                outcome.client_id,
                e.category(),
                e.message()
            );
            // Reconciliation usually picks the failure up from the record;
            // this covers rejections that never mutated one. No-op when the
            // item already went terminal.
            let mut batch = self.inner.batch.lock().unwrap();
            batch.fail_item(&outcome.client_id, e);
        }
        self.run_pass();
    }

    // ---- intake and batch mutations -------------------------------------

    /// Add files to the batch; returns the client ids in intake order.
    pub fn add_files(&self, files: Vec<NewUpload>) -> Vec<ClientId> {
        let mut ids = Vec::with_capacity(files.len());
        {
            let mut batch = self.inner.batch.lock().unwrap();
            for file in files {
                let client_id = ClientId::new();
                batch.add_item(client_id, &file.filename, file.source.size(), &file.mime_type);
                self.inner.transport.add_record(
                    client_id,
                    file.source,
                    &file.filename,
                    &file.mime_type,
                );
                ids.push(client_id);
            }
        }
        info!("UploadEngine: added {} file(s) to batch", ids.len());
        self.emit(BatchEvent::ItemsChanged);
        self.nudge();
        ids
    }

    pub fn set_title(&self, client_id: &ClientId, raw_title: &str) {
        self.inner.batch.lock().unwrap().set_title(client_id, raw_title);
        self.emit(BatchEvent::ItemsChanged);
    }

    pub fn set_global_metadata(&self, key: &str, value: &str) {
        self.inner.batch.lock().unwrap().set_global_metadata(key, value);
        self.emit(BatchEvent::ItemsChanged);
    }

    pub fn override_item_metadata(&self, client_id: &ClientId, key: &str, value: &str) {
        self.inner
            .batch
            .lock()
            .unwrap()
            .override_item_metadata(client_id, key, value);
        self.emit(BatchEvent::ItemsChanged);
    }

    pub fn change_category(&self, category_id: &str, fields: Vec<CategoryField>) {
        self.inner
            .batch
            .lock()
            .unwrap()
            .change_category(category_id, fields);
        self.emit(BatchEvent::ItemsChanged);
    }

    /// Remove an item from the batch and its record from the transport
    /// store. A transfer already in flight will finish against nothing and
    /// its late notification reconciles to a no-op.
    pub fn remove_item(&self, client_id: &ClientId) {
        {
            let mut batch = self.inner.batch.lock().unwrap();
            batch.remove_item(client_id);
            self.inner.transport.remove_record(client_id);
        }
        self.emit(BatchEvent::ItemsChanged);
        self.nudge();
    }

    /// User-triggered retry of a failed item: fresh transport record, item
    /// back in the queue with the failed attempt's session discarded, next
    /// scheduler pass picks it up.
    pub fn retry_item(&self, client_id: &ClientId) -> bool {
        let retried = {
            let mut batch = self.inner.batch.lock().unwrap();
            let stale_session = batch.item(client_id).and_then(|i| i.session_id.clone());
            let retried =
                batch.retry_item(client_id) && self.inner.transport.reset_record(client_id);
            if retried {
                if let Some(session_id) = stale_session {
                    self.inner.verifier.untrack(&session_id);
                }
            }
            retried
        };
        if retried {
            self.emit(BatchEvent::ItemsChanged);
            self.nudge();
        }
        retried
    }

    /// Dialog close: purge the batch and the scheduler's transient
    /// bookkeeping. In-flight transfers keep running; their records stay
    /// in the shared transport store until explicitly removed or purged as
    /// stale by a later session's scheduler.
    pub fn reset(&self) {
        self.inner.batch.lock().unwrap().reset();
        self.inner.scheduler.clear_pending_starts();
        self.inner.verifier.reset();
        self.emit(BatchEvent::ItemsChanged);
    }

    // ---- queries --------------------------------------------------------

    pub fn items(&self) -> Vec<UploadItem> {
        self.inner.batch.lock().unwrap().items().to_vec()
    }

    pub fn item(&self, client_id: &ClientId) -> Option<UploadItem> {
        self.inner.batch.lock().unwrap().item(client_id).cloned()
    }

    pub fn context(&self) -> BatchContext {
        self.inner.batch.lock().unwrap().context().clone()
    }

    pub fn warnings(&self) -> Vec<Warning> {
        self.inner.batch.lock().unwrap().warnings()
    }

    pub fn effective_metadata(&self, client_id: &ClientId) -> HashMap<String, String> {
        self.inner.batch.lock().unwrap().effective_metadata(client_id)
    }

    pub fn can_finalize(&self) -> bool {
        self.inner.batch.lock().unwrap().can_finalize()
    }

    /// True only when every complete item's session has been independently
    /// confirmed durable by the backend.
    pub fn all_backend_stable(&self) -> bool {
        let batch = self.inner.batch.lock().unwrap();
        let sessions: Vec<SessionId> = batch
            .completed_items()
            .iter()
            .filter_map(|i| i.session_id.clone())
            .collect();
        self.inner.verifier.all_confirmed(sessions.iter())
    }

    /// The two-stage gate for the finalize user action.
    pub fn finalize_ready(&self) -> bool {
        self.can_finalize() && self.all_backend_stable()
    }

    pub fn stability_states(&self) -> HashMap<SessionId, StabilityState> {
        self.inner.verifier.states()
    }

    // ---- finalize -------------------------------------------------------

    /// Commit the batch. On full success every item is purged from both
    /// stores and subscribers get `Finalized`; on any failure no state is
    /// cleared and the aggregated error is returned for a batch-level
    /// banner.
    pub async fn finalize(&self) -> Result<Vec<AssetRecord>, FinalizeError> {
        let requests = self.build_finalize_requests()?;

        let assets = self.inner.coordinator.finalize_batch(requests).await?;

        {
            let mut batch = self.inner.batch.lock().unwrap();
            let ids: Vec<ClientId> = batch.items().iter().map(|i| i.client_id).collect();
            for client_id in &ids {
                self.inner.transport.remove_record(client_id);
            }
            batch.apply_reconciled(Vec::new());
        }
        self.inner.verifier.reset();

        let records: Vec<AssetRecord> = assets.into_iter().map(|(_, asset)| asset).collect();
        self.emit(BatchEvent::Finalized {
            assets: records.clone(),
        });
        self.emit(BatchEvent::ItemsChanged);
        Ok(records)
    }

    fn build_finalize_requests(
        &self,
    ) -> Result<Vec<(ClientId, FinalizeRequest)>, FinalizeError> {
        let batch = self.inner.batch.lock().unwrap();

        if !batch.can_finalize() {
            return Err(FinalizeError::Blocked(
                "category, transfers or required metadata are not settled".to_string(),
            ));
        }

        let category_id = match &batch.context().category_id {
            Some(category_id) => category_id.clone(),
            None => return Err(FinalizeError::Blocked("no category selected".to_string())),
        };

        let complete = batch.completed_items();
        let mut sessions = Vec::with_capacity(complete.len());
        for item in &complete {
            match &item.session_id {
                Some(session_id) => sessions.push(session_id.clone()),
                None => {
                    // Cannot happen if the bridge holds its invariant.
                    return Err(FinalizeError::Blocked(format!(
                        "item {} is complete without a session id",
                        item.client_id
                    )));
                }
            }
        }

        if !self.inner.verifier.all_confirmed(sessions.iter()) {
            return Err(FinalizeError::Blocked(
                "backend has not confirmed all uploads durable yet".to_string(),
            ));
        }

        let requests = complete
            .iter()
            .zip(sessions)
            .map(|(item, session_id)| {
                (
                    item.client_id,
                    FinalizeRequest {
                        session_id,
                        title: item.title.clone(),
                        filename: item.resolved_filename.clone(),
                        category_id: category_id.clone(),
                        metadata: batch.effective_metadata(&item.client_id),
                    },
                )
            })
            .collect();
        Ok(requests)
    }

    // ---- events ---------------------------------------------------------

    /// Subscribe to batch notifications.
    /// Subscription is removed automatically when the receiver is dropped.
    pub fn subscribe(&self) -> tokio_mpsc::UnboundedReceiver<BatchEvent> {
        let (tx, rx) = tokio_mpsc::unbounded_channel();
        let id = self.inner.next_subscription_id.fetch_add(1, Ordering::SeqCst);
        self.inner.subscribers.lock().unwrap().insert(id, tx);
        rx
    }

    fn emit(&self, event: BatchEvent) {
        let mut subscribers = self.inner.subscribers.lock().unwrap();
        subscribers.retain(|_, tx| tx.send(event.clone()).is_ok());
    }

    fn nudge(&self) {
        let _ = self.inner.nudge_tx.send(());
    }
}
