// In-memory upload backend for integration tests
//
// Tracks sessions and received bytes instead of talking to a real service,
// with scripted failures keyed by filename so a test can break exactly one
// call of one transfer.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use stower::api::{
    AssetRecord, FinalizeRequest, InitiateOutcome, InitiateRequest, SessionStatus, UploadApi,
};
use stower::error::UploadError;
use stower::models::SessionId;
use tokio::sync::Semaphore;

#[derive(Debug, Default)]
struct SessionRecord {
    filename: String,
    expected_size: u64,
    received: u64,
    completed: bool,
    status_polls: u32,
}

#[derive(Default)]
pub struct MockUploadApi {
    sessions: Mutex<HashMap<SessionId, SessionRecord>>,
    next_session: AtomicU64,
    initiate_order: Mutex<Vec<String>>,
    /// One-shot failures keyed by (filename, part number).
    part_failures: Mutex<HashMap<(String, u32), UploadError>>,
    /// One-shot failures for direct uploads, keyed by filename.
    direct_failures: Mutex<HashMap<String, UploadError>>,
    /// One-shot failures for initiate, keyed by filename.
    initiate_failures: Mutex<HashMap<String, UploadError>>,
    /// One-shot failures for finalize, keyed by the finalized filename.
    finalize_failures: Mutex<HashMap<String, UploadError>>,
    /// Status reports object_exists only after this many polls (by filename).
    stable_after_polls: Mutex<HashMap<String, u32>>,
    finalized: Mutex<Vec<String>>,
    /// When set, initiate blocks until the test releases a permit.
    initiate_gate: Option<Arc<Semaphore>>,
}

impl MockUploadApi {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make initiate wait for a permit so a test controls when each
    /// transfer is allowed to begin.
    pub fn with_initiate_gate(gate: Arc<Semaphore>) -> Self {
        MockUploadApi {
            initiate_gate: Some(gate),
            ..Self::default()
        }
    }

    pub fn fail_initiate(&self, filename: &str, error: UploadError) {
        self.initiate_failures
            .lock()
            .unwrap()
            .insert(filename.to_string(), error);
    }

    pub fn fail_part(&self, filename: &str, part_number: u32, error: UploadError) {
        self.part_failures
            .lock()
            .unwrap()
            .insert((filename.to_string(), part_number), error);
    }

    pub fn fail_direct(&self, filename: &str, error: UploadError) {
        self.direct_failures
            .lock()
            .unwrap()
            .insert(filename.to_string(), error);
    }

    pub fn fail_finalize(&self, filename: &str, error: UploadError) {
        self.finalize_failures
            .lock()
            .unwrap()
            .insert(filename.to_string(), error);
    }

    pub fn stable_after_polls(&self, filename: &str, polls: u32) {
        self.stable_after_polls
            .lock()
            .unwrap()
            .insert(filename.to_string(), polls);
    }

    /// Filenames in the order their sessions were opened.
    pub fn initiate_order(&self) -> Vec<String> {
        self.initiate_order.lock().unwrap().clone()
    }

    pub fn received_bytes(&self, filename: &str) -> u64 {
        self.sessions
            .lock()
            .unwrap()
            .values()
            .filter(|s| s.filename == filename)
            .map(|s| s.received)
            .max()
            .unwrap_or(0)
    }

    pub fn session_count(&self) -> usize {
        self.sessions.lock().unwrap().len()
    }

    pub fn finalized_filenames(&self) -> Vec<String> {
        self.finalized.lock().unwrap().clone()
    }
}

#[async_trait::async_trait]
impl UploadApi for MockUploadApi {
    async fn initiate(&self, request: &InitiateRequest) -> Result<InitiateOutcome, UploadError> {
        if let Some(gate) = &self.initiate_gate {
            match gate.acquire().await {
                Ok(permit) => permit.forget(),
                Err(_) => {
                    return Err(UploadError::Unknown {
                        message: "initiate gate closed".to_string(),
                        http_status: None,
                    })
                }
            }
        }

        if let Some(error) = self
            .initiate_failures
            .lock()
            .unwrap()
            .remove(&request.filename)
        {
            return Err(error);
        }

        let n = self.next_session.fetch_add(1, Ordering::SeqCst) + 1;
        let session_id = SessionId::new(format!("mock-session-{}", n));
        self.sessions.lock().unwrap().insert(
            session_id.clone(),
            SessionRecord {
                filename: request.filename.clone(),
                expected_size: request.size,
                ..SessionRecord::default()
            },
        );
        self.initiate_order
            .lock()
            .unwrap()
            .push(request.filename.clone());

        Ok(InitiateOutcome {
            session_id,
            multipart_upload_id: None,
        })
    }

    async fn upload_direct(&self, session: &SessionId, data: Vec<u8>) -> Result<(), UploadError> {
        let mut sessions = self.sessions.lock().unwrap();
        let record = sessions.get_mut(session).ok_or_else(|| UploadError::Pipeline {
            message: format!("unknown session {}", session),
            http_status: Some(409),
        })?;

        if let Some(error) = self
            .direct_failures
            .lock()
            .unwrap()
            .remove(&record.filename)
        {
            return Err(error);
        }

        record.received = data.len() as u64;
        Ok(())
    }

    async fn upload_part(
        &self,
        session: &SessionId,
        part_number: u32,
        data: Vec<u8>,
    ) -> Result<(), UploadError> {
        let mut sessions = self.sessions.lock().unwrap();
        let record = sessions.get_mut(session).ok_or_else(|| UploadError::Pipeline {
            message: format!("unknown session {}", session),
            http_status: Some(409),
        })?;

        let key = (record.filename.clone(), part_number);
        if let Some(error) = self.part_failures.lock().unwrap().remove(&key) {
            return Err(error);
        }

        record.received += data.len() as u64;
        Ok(())
    }

    async fn complete(&self, session: &SessionId) -> Result<(), UploadError> {
        let mut sessions = self.sessions.lock().unwrap();
        let record = sessions.get_mut(session).ok_or_else(|| UploadError::Pipeline {
            message: format!("unknown session {}", session),
            http_status: Some(409),
        })?;
        record.completed = true;
        Ok(())
    }

    async fn status(&self, session: &SessionId) -> Result<SessionStatus, UploadError> {
        let mut sessions = self.sessions.lock().unwrap();
        let record = sessions.get_mut(session).ok_or_else(|| UploadError::Pipeline {
            message: format!("unknown session {}", session),
            http_status: Some(409),
        })?;

        record.status_polls += 1;
        let threshold = self
            .stable_after_polls
            .lock()
            .unwrap()
            .get(&record.filename)
            .copied()
            .unwrap_or(0);

        Ok(SessionStatus {
            uploaded_size: record.received,
            expected_size: record.expected_size,
            object_exists: record.completed && record.status_polls > threshold,
        })
    }

    async fn finalize(&self, request: &FinalizeRequest) -> Result<AssetRecord, UploadError> {
        if let Some(error) = self
            .finalize_failures
            .lock()
            .unwrap()
            .remove(&request.filename)
        {
            return Err(error);
        }

        {
            let sessions = self.sessions.lock().unwrap();
            if !sessions.contains_key(&request.session_id) {
                return Err(UploadError::Pipeline {
                    message: format!("unknown session {}", request.session_id),
                    http_status: Some(409),
                });
            }
        }

        self.finalized
            .lock()
            .unwrap()
            .push(request.filename.clone());

        Ok(AssetRecord {
            asset_id: format!("asset-{}", request.session_id),
            title: request.title.clone(),
            filename: request.filename.clone(),
        })
    }
}
