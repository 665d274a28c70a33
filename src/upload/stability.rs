// # Stability Verifier
//
// Client-observed completion can precede durable server-side visibility,
// particularly for chunked transfers whose final assembly is asynchronous.
// This verifier polls the status endpoint for every completed item's
// session until the backend confirms the object exists with all expected
// bytes, and gates the finalize action on that confirmation.

use crate::api::UploadApi;
use crate::config::StabilityPolicy;
use crate::models::SessionId;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc as tokio_mpsc;
use tracing::{debug, info, warn};

/// Where a session stands in the durability check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StabilityState {
    /// Poll task running, not yet confirmed.
    Checking,
    /// Backend confirmed: object exists and uploaded bytes cover the
    /// expected size.
    Confirmed,
    /// Poll attempts exhausted without confirmation. Finalize stays
    /// blocked; the caller decides whether to keep waiting or reset.
    Stuck,
}

#[derive(Clone)]
pub struct StabilityVerifier {
    api: Arc<dyn UploadApi>,
    policy: StabilityPolicy,
    states: Arc<Mutex<HashMap<SessionId, StabilityState>>>,
    /// Signals the engine that a session's state changed.
    notify_tx: tokio_mpsc::UnboundedSender<SessionId>,
}

impl StabilityVerifier {
    pub fn new(
        api: Arc<dyn UploadApi>,
        policy: StabilityPolicy,
        notify_tx: tokio_mpsc::UnboundedSender<SessionId>,
    ) -> Self {
        StabilityVerifier {
            api,
            policy,
            states: Arc::new(Mutex::new(HashMap::new())),
            notify_tx,
        }
    }

    /// Begin (or continue) tracking a session. Concurrent calls for the
    /// same session are de-duplicated; only the first spawns a poll task.
    pub fn track(&self, session_id: SessionId) {
        {
            let mut states = self.states.lock().unwrap();
            if states.contains_key(&session_id) {
                return;
            }
            states.insert(session_id.clone(), StabilityState::Checking);
        }

        debug!("StabilityVerifier: tracking session {}", session_id);
        let verifier = self.clone();
        tokio::spawn(async move {
            verifier.poll_until_settled(session_id).await;
        });
    }

    async fn poll_until_settled(&self, session_id: SessionId) {
        let mut delay = self.policy.interval;

        for attempt in 1..=self.policy.max_attempts {
            match self.api.status(&session_id).await {
                Ok(status) => {
                    if status.object_exists
                        && status.expected_size > 0
                        && status.uploaded_size >= status.expected_size
                    {
                        info!(
                            "StabilityVerifier: session {} confirmed durable after {} poll(s)",
                            session_id, attempt
                        );
                        self.set_state(session_id, StabilityState::Confirmed);
                        return;
                    }
                    debug!(
                        "StabilityVerifier: session {} not stable yet ({}/{} bytes, exists: {})",
                        session_id, status.uploaded_size, status.expected_size, status.object_exists
                    );
                }
                // Transient status failures keep polling; the attempt cap
                // bounds the total wait either way.
                Err(e) => {
                    debug!(
                        "StabilityVerifier: status poll for {} failed: {}",
                        session_id, e
                    );
                }
            }

            tokio::time::sleep(delay).await;
            delay = delay
                .mul_f64(self.policy.backoff_factor)
                .min(self.policy.max_interval);
        }

        warn!(
            "StabilityVerifier: session {} still unconfirmed after {} attempts, marking stuck",
            session_id, self.policy.max_attempts
        );
        self.set_state(session_id, StabilityState::Stuck);
    }

    fn set_state(&self, session_id: SessionId, state: StabilityState) {
        {
            let mut states = self.states.lock().unwrap();
            // A session untracked mid-poll stays forgotten.
            match states.get_mut(&session_id) {
                Some(entry) => *entry = state,
                None => return,
            }
        }
        let _ = self.notify_tx.send(session_id);
    }

    pub fn state(&self, session_id: &SessionId) -> Option<StabilityState> {
        self.states.lock().unwrap().get(session_id).copied()
    }

    pub fn states(&self) -> HashMap<SessionId, StabilityState> {
        self.states.lock().unwrap().clone()
    }

    /// True only when every given session has been independently confirmed.
    pub fn all_confirmed<'a>(&self, sessions: impl IntoIterator<Item = &'a SessionId>) -> bool {
        let states = self.states.lock().unwrap();
        sessions
            .into_iter()
            .all(|sid| states.get(sid) == Some(&StabilityState::Confirmed))
    }

    pub fn any_stuck(&self) -> bool {
        self.states
            .lock()
            .unwrap()
            .values()
            .any(|s| *s == StabilityState::Stuck)
    }

    /// Forget one session. Used when a retry discards a failed attempt's
    /// session; a poll task still running for it finds the entry gone and
    /// goes quiet.
    pub fn untrack(&self, session_id: &SessionId) {
        if self.states.lock().unwrap().remove(session_id).is_some() {
            debug!("StabilityVerifier: untracked session {}", session_id);
        }
    }

    /// Forget all tracked sessions (batch purge or session reset).
    pub fn reset(&self) {
        self.states.lock().unwrap().clear();
    }
}
