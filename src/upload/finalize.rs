// # Finalize Coordinator
//
// Commits a fully-uploaded, backend-stable batch: one finalize call per
// complete item, in parallel, all-or-nothing. On any failure nothing is
// cleared - items stay queryable so the user can retry - and the failures
// surface as one aggregated batch-level error, never per-item noise.

use crate::api::{AssetRecord, FinalizeRequest, UploadApi};
use crate::error::UploadError;
use crate::models::ClientId;
use std::sync::Arc;
use thiserror::Error;
use tracing::{info, warn};

#[derive(Error, Debug)]
pub enum FinalizeError {
    /// The gate was not satisfied; nothing was attempted.
    #[error("finalize blocked: {0}")]
    Blocked(String),

    /// Some finalize calls failed. Successes are not rolled back on the
    /// backend, but no local state is cleared so the batch can be retried.
    #[error("finalize failed for {} of {} item(s)", failures.len(), total)]
    Calls {
        total: usize,
        failures: Vec<(ClientId, UploadError)>,
    },
}

impl FinalizeError {
    /// One aggregated message suitable for a batch-level banner.
    pub fn banner_message(&self) -> String {
        match self {
            FinalizeError::Blocked(reason) => format!("Cannot finalize yet: {}", reason),
            FinalizeError::Calls { total, failures } => {
                let details: Vec<String> = failures
                    .iter()
                    .map(|(id, e)| format!("{}: {}", id, e.message()))
                    .collect();
                format!(
                    "Finalize failed for {} of {} item(s): {}",
                    failures.len(),
                    total,
                    details.join("; ")
                )
            }
        }
    }
}

#[derive(Clone)]
pub struct FinalizeCoordinator {
    api: Arc<dyn UploadApi>,
}

impl FinalizeCoordinator {
    pub fn new(api: Arc<dyn UploadApi>) -> Self {
        FinalizeCoordinator { api }
    }

    /// Issue every finalize call in parallel. All must succeed for the
    /// batch to be considered finalized.
    pub async fn finalize_batch(
        &self,
        requests: Vec<(ClientId, FinalizeRequest)>,
    ) -> Result<Vec<(ClientId, AssetRecord)>, FinalizeError> {
        let total = requests.len();
        info!("FinalizeCoordinator: finalizing {} item(s)", total);

        let calls = requests.into_iter().map(|(client_id, request)| {
            let api = self.api.clone();
            async move { (client_id, api.finalize(&request).await) }
        });
        let results = futures::future::join_all(calls).await;

        let mut assets = Vec::new();
        let mut failures = Vec::new();
        for (client_id, result) in results {
            match result {
                Ok(asset) => assets.push((client_id, asset)),
                Err(e) => failures.push((client_id, e)),
            }
        }

        if failures.is_empty() {
            info!("FinalizeCoordinator: batch finalized ({} asset(s))", total);
            Ok(assets)
        } else {
            warn!(
                "FinalizeCoordinator: {} of {} finalize call(s) failed",
                failures.len(),
                total
            );
            Err(FinalizeError::Calls { total, failures })
        }
    }
}
