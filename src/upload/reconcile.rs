// # Reconciliation Bridge
//
// A single pure projection from (transport snapshot, batch items) to the
// next batch items. Runs after every transport notification and after
// every batch mutation. Because it reads current snapshots rather than
// deltas, out-of-order or duplicate notifications converge to the same
// fixed point - the system's core correctness property.
//
// The function never panics and never throws: on anything unexpected it
// leaves the prior item state unchanged rather than crash the pass.

use crate::config::ReconcilePolicy;
use crate::error::UploadError;
use crate::models::{ClientId, ItemStatus, TransportRecord, TransportStatus, UploadItem};
use std::collections::HashMap;
use std::time::Instant;

/// Project the transport snapshot onto the batch items.
///
/// - Correlation is by `ClientId` only; records with no matching item
///   belong to another batch and are ignored.
/// - Status resolves by fixed priority: failed > completed-with-session
///   (a completed record without a session id is a synthesized failure) >
///   uploading/initiating > pending.
/// - At most one state transition per record per pass; terminal items are
///   never revisited.
pub fn reconcile(
    records: &HashMap<ClientId, TransportRecord>,
    items: &[UploadItem],
    now: Instant,
    policy: &ReconcilePolicy,
) -> Vec<UploadItem> {
    items
        .iter()
        .map(|item| match records.get(&item.client_id) {
            Some(record) => reconcile_item(item, record, now, policy),
            None => item.clone(),
        })
        .collect()
}

fn reconcile_item(
    item: &UploadItem,
    record: &TransportRecord,
    now: Instant,
    policy: &ReconcilePolicy,
) -> UploadItem {
    // Monotonicity: once terminal, an item never moves again.
    if item.status.is_terminal() {
        return item.clone();
    }

    let mut next = item.clone();

    match record.status {
        // Failure overrides any other signal; the structured error is
        // copied across unchanged.
        TransportStatus::Failed => {
            next.status = ItemStatus::Failed;
            next.error = Some(record.error.clone().unwrap_or(UploadError::Unknown {
                message: "transfer failed".to_string(),
                http_status: None,
            }));
        }

        // Completion is only believed with a durable session reference.
        TransportStatus::Completed => match &record.session_id {
            Some(session_id) => {
                next.status = ItemStatus::Complete;
                if next.session_id.is_none() {
                    next.session_id = Some(session_id.clone());
                }
                next.progress = 100;
                next.error = None;
                next.last_propagated_progress = 100;
                next.last_propagated_at = Some(now);
            }
            None => {
                next.status = ItemStatus::Failed;
                next.error = Some(UploadError::session_missing());
            }
        },

        TransportStatus::Uploading | TransportStatus::Initiating => {
            // Moves the item out of `queued` exactly once; an item that is
            // already uploading just receives throttled progress.
            if next.status == ItemStatus::Queued {
                next.status = ItemStatus::Uploading;
            }
            if next.session_id.is_none() {
                next.session_id = record.session_id.clone();
            }
            if should_propagate_progress(&next, record, now, policy) {
                next.progress = record.progress;
                next.last_propagated_progress = record.progress;
                next.last_propagated_at = Some(now);
            }
        }

        // A pending or paused record never reverts an advanced item.
        TransportStatus::Pending | TransportStatus::Paused => {}
    }

    next
}

/// Progress propagates on the first nonzero value, then only when the
/// visual delta or the heartbeat interval is reached, so long chunked
/// phases keep the indicator alive without flooding the batch with
/// updates.
fn should_propagate_progress(
    item: &UploadItem,
    record: &TransportRecord,
    now: Instant,
    policy: &ReconcilePolicy,
) -> bool {
    if record.progress == item.last_propagated_progress {
        return false;
    }
    if item.progress == 0 && record.progress > 0 {
        return true;
    }

    let delta = (record.progress as f64 - item.last_propagated_progress as f64).abs();
    if delta >= policy.min_progress_delta {
        return true;
    }

    match item.last_propagated_at {
        Some(last) => now.duration_since(last) >= policy.heartbeat,
        None => true,
    }
}
