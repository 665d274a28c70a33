// # Transport Manager
//
// Process-wide store of per-file transport records. Knows nothing about
// batches, titles or categories: it owns the low-level transfer state
// machine (`pending -> initiating -> uploading -> completed`) and a
// subscribe/notify interface, and that is all.
//
// The manager is an explicitly constructed, cloneable service - one
// instance per authenticated session, passed by reference to whichever
// context needs it. Records persist across dialog sessions until removed,
// so consumers must filter by client id before acting on a snapshot.

use crate::api::{InitiateRequest, UploadApi};
use crate::error::UploadError;
use crate::models::{ClientId, FileSource, TransportRecord, TransportStatus};
use std::collections::HashMap;
use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc, Mutex,
};
use tokio::sync::mpsc as tokio_mpsc;
use tracing::{debug, info, warn};

type SubscriptionId = u64;

/// Notification that a record mutated. Subscribers are expected to pull a
/// fresh snapshot rather than interpret the event as a delta.
#[derive(Debug, Clone)]
pub struct TransportEvent {
    pub client_ref: ClientId,
}

/// Transfer sizing knobs the manager needs from the engine config.
#[derive(Debug, Clone)]
pub struct TransferSettings {
    pub chunk_threshold: u64,
    pub chunk_size: u64,
}

#[derive(Clone)]
pub struct TransportManager {
    api: Arc<dyn UploadApi>,
    settings: TransferSettings,
    records: Arc<Mutex<HashMap<ClientId, TransportRecord>>>,
    subscribers: Arc<Mutex<HashMap<SubscriptionId, tokio_mpsc::UnboundedSender<TransportEvent>>>>,
    next_subscription_id: Arc<AtomicU64>,
}

impl TransportManager {
    pub fn new(api: Arc<dyn UploadApi>, settings: TransferSettings) -> Self {
        TransportManager {
            api,
            settings,
            records: Arc::new(Mutex::new(HashMap::new())),
            subscribers: Arc::new(Mutex::new(HashMap::new())),
            next_subscription_id: Arc::new(AtomicU64::new(1)),
        }
    }

    /// Create a pending record for a file. The direct-vs-chunked decision
    /// happens here, once, by the size threshold.
    pub fn add_record(
        &self,
        client_id: ClientId,
        file: FileSource,
        filename: &str,
        mime_type: &str,
    ) {
        let record = TransportRecord::new(
            client_id,
            file,
            filename,
            mime_type,
            self.settings.chunk_threshold,
            self.settings.chunk_size,
        );
        debug!(
            "TransportManager: added record {} ({} bytes, {:?})",
            client_id, record.file_size, record.upload_type
        );
        self.records.lock().unwrap().insert(client_id, record);
        self.notify(client_id);
    }

    /// Re-insert a record restored from a previous session. Such records
    /// typically carry a session id but no file handle; the scheduler
    /// purges them on the next start attempt.
    pub fn restore_record(&self, record: TransportRecord) {
        let client_ref = record.client_ref;
        self.records.lock().unwrap().insert(client_ref, record);
        self.notify(client_ref);
    }

    pub fn get(&self, client_id: &ClientId) -> Option<TransportRecord> {
        self.records.lock().unwrap().get(client_id).cloned()
    }

    pub fn snapshot(&self) -> HashMap<ClientId, TransportRecord> {
        self.records.lock().unwrap().clone()
    }

    /// Number of records currently occupying a concurrency slot.
    pub fn active_count(&self) -> usize {
        self.records
            .lock()
            .unwrap()
            .values()
            .filter(|r| r.status.is_active())
            .count()
    }

    pub fn remove_record(&self, client_id: &ClientId) {
        if self.records.lock().unwrap().remove(client_id).is_some() {
            debug!("TransportManager: removed record {}", client_id);
            self.notify(*client_id);
        }
    }

    /// Replace a failed record with a fresh pending one, keeping the file
    /// handle. A session id is assigned at most once per record, so retry
    /// means a new record, not a cleared field. Returns false when there is
    /// nothing to reset.
    pub fn reset_record(&self, client_id: &ClientId) -> bool {
        let reset = {
            let mut records = self.records.lock().unwrap();
            match records.get(client_id) {
                Some(old) if old.status == TransportStatus::Failed => match old.file.clone() {
                    Some(file) => {
                        let fresh = TransportRecord::new(
                            *client_id,
                            file,
                            &old.filename,
                            &old.mime_type,
                            self.settings.chunk_threshold,
                            self.settings.chunk_size,
                        );
                        records.insert(*client_id, fresh);
                        true
                    }
                    None => false,
                },
                _ => false,
            }
        };

        if reset {
            info!("TransportManager: reset record {} for retry", client_id);
            self.notify(*client_id);
        }
        reset
    }

    /// Subscribe to record-change notifications.
    /// Subscription is removed automatically when the receiver is dropped.
    pub fn subscribe(&self) -> tokio_mpsc::UnboundedReceiver<TransportEvent> {
        let (tx, rx) = tokio_mpsc::unbounded_channel();
        let id = self.next_subscription_id.fetch_add(1, Ordering::SeqCst);
        self.subscribers.lock().unwrap().insert(id, tx);
        rx
    }

    fn notify(&self, client_ref: ClientId) {
        let mut subs = self.subscribers.lock().unwrap();
        subs.retain(|_, tx| tx.send(TransportEvent { client_ref }).is_ok());
    }

    /// Drive a record through its transfer. Notifies after every mutation;
    /// any failure moves the record to `failed` (still notifying, so a
    /// concurrency slot is freed) and surfaces the classified error.
    ///
    /// No auto-retry: a failed transfer is only retried by a fresh call
    /// after `reset_record`.
    pub async fn start_transfer(&self, client_id: ClientId) -> Result<(), UploadError> {
        let (file, request) = self.begin_initiate(&client_id)?;

        let outcome = match self.api.initiate(&request).await {
            Ok(outcome) => outcome,
            Err(e) => {
                self.fail_record(&client_id, e.clone());
                return Err(e);
            }
        };

        info!(
            "TransportManager: initiated session {} for {}",
            outcome.session_id, client_id
        );

        {
            let mut records = self.records.lock().unwrap();
            if let Some(record) = records.get_mut(&client_id) {
                if record.session_id.is_none() {
                    record.session_id = Some(outcome.session_id.clone());
                }
                record.multipart_upload_id = outcome.multipart_upload_id.clone();
                record.status = TransportStatus::Uploading;
                record.touch();
            }
        }
        self.notify(client_id);

        let session_id = outcome.session_id;
        let chunk_size = request.chunk_size;
        let total = request.size;

        let transfer: Result<(), UploadError> = async {
            match chunk_size {
                // Chunked: sequential parts with per-part progress.
                Some(chunk_size) => {
                    let mut offset: u64 = 0;
                    let mut part_number: u32 = 1;
                    while offset < total {
                        let len = chunk_size.min(total - offset);
                        let data = file
                            .read_range(offset, len)
                            .await
                            .map_err(|e| UploadError::source_read(&e))?;
                        self.api.upload_part(&session_id, part_number, data).await?;

                        offset += len;
                        part_number += 1;
                        self.set_progress(&client_id, ((offset * 100) / total.max(1)) as u8);
                    }
                    Ok(())
                }
                // Direct: a single content upload.
                None => {
                    let data = file
                        .read_range(0, total)
                        .await
                        .map_err(|e| UploadError::source_read(&e))?;
                    self.api.upload_direct(&session_id, data).await?;
                    self.set_progress(&client_id, 100);
                    Ok(())
                }
            }
        }
        .await;

        if let Err(e) = transfer {
            self.fail_record(&client_id, e.clone());
            return Err(e);
        }

        if let Err(e) = self.api.complete(&session_id).await {
            self.fail_record(&client_id, e.clone());
            return Err(e);
        }

        {
            let mut records = self.records.lock().unwrap();
            if let Some(record) = records.get_mut(&client_id) {
                record.status = TransportStatus::Completed;
                record.progress = 100;
                record.touch();
            }
        }
        self.notify(client_id);

        info!("TransportManager: transfer {} completed", client_id);
        Ok(())
    }

    /// Validate the record is startable, flip it to `initiating` and build
    /// the initiate request.
    fn begin_initiate(
        &self,
        client_id: &ClientId,
    ) -> Result<(FileSource, InitiateRequest), UploadError> {
        let prepared = {
            let mut records = self.records.lock().unwrap();
            let record = records.get_mut(client_id).ok_or_else(|| UploadError::Unknown {
                message: format!("no transport record for {}", client_id),
                http_status: None,
            })?;

            if !record.status.is_startable() {
                return Err(UploadError::Pipeline {
                    message: format!(
                        "transfer for {} is not in a startable state ({:?})",
                        client_id, record.status
                    ),
                    http_status: None,
                });
            }

            let file = match record.file.clone() {
                Some(file) => file,
                None => {
                    // Rehydrated record without bytes to send.
                    record.status = TransportStatus::Failed;
                    record.error = Some(UploadError::expired_session());
                    record.touch();
                    return Err(UploadError::expired_session());
                }
            };

            record.status = TransportStatus::Initiating;
            record.touch();

            let request = InitiateRequest {
                filename: record.filename.clone(),
                size: record.file_size,
                mime_type: record.mime_type.clone(),
                upload_type: record.upload_type,
                chunk_size: record.chunk_size,
            };
            (file, request)
        };

        self.notify(*client_id);
        Ok(prepared)
    }

    fn set_progress(&self, client_id: &ClientId, progress: u8) {
        {
            let mut records = self.records.lock().unwrap();
            if let Some(record) = records.get_mut(client_id) {
                record.progress = progress.min(100);
                record.touch();
            }
        }
        self.notify(*client_id);
    }

    fn fail_record(&self, client_id: &ClientId, error: UploadError) {
        warn!(
            "TransportManager: transfer {} failed ({}): {}",
            client_id,
            error.category(),
            error.message()
        );
        {
            let mut records = self.records.lock().unwrap();
            if let Some(record) = records.get_mut(client_id) {
                // Never regress a completed record.
                if record.status != TransportStatus::Completed {
                    record.status = TransportStatus::Failed;
                    record.error = Some(error);
                    record.touch();
                }
            }
        }
        self.notify(*client_id);
    }
}
