// # Batch Manager
//
// Owns the semantic unit of work: the set of items in the current upload
// dialog session, their titles and metadata drafts, the target category,
// and the computed aggregates the UI reads (status partitions,
// finalize-eligibility, validation warnings).
//
// Items live only for the current session: finalize success or a session
// reset purges them. A prior session's leftover transport records are
// never reattached here.

use crate::error::UploadError;
use crate::models::{
    BatchContext, CategoryField, ClientId, ItemStatus, UploadItem, Warning, WarningKind,
    WarningSeverity,
};
use std::collections::HashMap;
use tracing::{debug, info, warn};

#[derive(Debug)]
pub struct BatchState {
    /// Intake order is preserved; the scheduler's FIFO reads it directly.
    items: Vec<UploadItem>,
    context: BatchContext,
    global_metadata: HashMap<String, String>,
    /// Dropped-field notices from the last category change; replaced on the
    /// next change, cleared on reset.
    category_warnings: Vec<Warning>,
}

impl BatchState {
    pub fn new(context: BatchContext) -> Self {
        BatchState {
            items: Vec::new(),
            context,
            global_metadata: HashMap::new(),
            category_warnings: Vec::new(),
        }
    }

    pub fn add_item(
        &mut self,
        client_id: ClientId,
        filename: &str,
        file_size: u64,
        mime_type: &str,
    ) {
        debug!("BatchManager: added item {} ({})", client_id, filename);
        self.items
            .push(UploadItem::new(client_id, filename, file_size, mime_type));
    }

    pub fn items(&self) -> &[UploadItem] {
        &self.items
    }

    pub fn item(&self, client_id: &ClientId) -> Option<&UploadItem> {
        self.items.iter().find(|i| i.client_id == *client_id)
    }

    pub fn context(&self) -> &BatchContext {
        &self.context
    }

    /// Replace the item list with the bridge's projection.
    pub fn apply_reconciled(&mut self, items: Vec<UploadItem>) {
        self.items = items;
    }

    pub fn set_title(&mut self, client_id: &ClientId, raw_title: &str) {
        if let Some(item) = self.item_mut(client_id) {
            item.set_title(raw_title);
        }
    }

    pub fn set_global_metadata(&mut self, key: &str, value: &str) {
        self.global_metadata.insert(key.to_string(), value.to_string());
    }

    pub fn override_item_metadata(&mut self, client_id: &ClientId, key: &str, value: &str) {
        if let Some(item) = self.item_mut(client_id) {
            item.metadata_draft.insert(key.to_string(), value.to_string());
            item.overridden_fields.insert(key.to_string());
        }
    }

    /// Per-item override wins over the global draft, field by field.
    pub fn effective_metadata(&self, client_id: &ClientId) -> HashMap<String, String> {
        let mut merged = self.global_metadata.clone();
        if let Some(item) = self.item(client_id) {
            for (key, value) in &item.metadata_draft {
                if item.overridden_fields.contains(key) {
                    merged.insert(key.clone(), value.clone());
                }
            }
        }
        merged
    }

    /// Switch the target category. In-flight transfers are untouched; only
    /// the metadata schema changes. Values for fields no longer applicable
    /// are purged, with a warning naming what was dropped.
    pub fn change_category(&mut self, category_id: &str, fields: Vec<CategoryField>) {
        let valid: Vec<String> = fields.iter().map(|f| f.key.clone()).collect();
        let mut dropped: Vec<String> = Vec::new();

        self.global_metadata.retain(|key, _| {
            let keep = valid.contains(key);
            if !keep {
                dropped.push(key.clone());
            }
            keep
        });

        for item in &mut self.items {
            item.metadata_draft.retain(|key, _| {
                let keep = valid.contains(key);
                if !keep && !dropped.contains(key) {
                    dropped.push(key.clone());
                }
                keep
            });
            item.overridden_fields.retain(|key| valid.contains(key));
        }

        self.context.category_id = Some(category_id.to_string());
        self.context.fields = fields;

        self.category_warnings.clear();
        if !dropped.is_empty() {
            warn!(
                "BatchManager: category change to {} dropped metadata fields: {:?}",
                category_id, dropped
            );
            self.category_warnings.push(Warning {
                kind: WarningKind::FieldsDropped,
                severity: WarningSeverity::Warn,
                affected_fields: dropped,
            });
        }
    }

    pub fn remove_item(&mut self, client_id: &ClientId) {
        self.items.retain(|i| i.client_id != *client_id);
    }

    /// Return a failed item to the queue for another attempt. This is the
    /// explicit user-triggered path; reconciliation itself never moves an
    /// item out of a terminal state. The failed attempt's session id is
    /// discarded here so the item adopts whatever session the fresh
    /// transport record is assigned.
    pub fn retry_item(&mut self, client_id: &ClientId) -> bool {
        match self.item_mut(client_id) {
            Some(item) if item.status == ItemStatus::Failed => {
                info!("BatchManager: retrying item {}", client_id);
                item.status = ItemStatus::Queued;
                item.session_id = None;
                item.progress = 0;
                item.error = None;
                item.last_propagated_progress = 0;
                item.last_propagated_at = None;
                true
            }
            _ => false,
        }
    }

    /// Mark an item failed outside reconciliation (stale-record purges,
    /// start rejections).
    pub fn fail_item(&mut self, client_id: &ClientId, error: UploadError) {
        if let Some(item) = self.item_mut(client_id) {
            if !item.status.is_terminal() {
                item.status = ItemStatus::Failed;
                item.error = Some(error);
            }
        }
    }

    /// Queued client ids in intake order.
    pub fn queued_client_ids(&self) -> Vec<ClientId> {
        self.items
            .iter()
            .filter(|i| i.status == ItemStatus::Queued)
            .map(|i| i.client_id)
            .collect()
    }

    pub fn count_with_status(&self, status: ItemStatus) -> usize {
        self.items.iter().filter(|i| i.status == status).count()
    }

    pub fn completed_items(&self) -> Vec<&UploadItem> {
        self.items
            .iter()
            .filter(|i| i.status == ItemStatus::Complete)
            .collect()
    }

    /// Required-metadata validation plus the last category-change notices.
    pub fn warnings(&self) -> Vec<Warning> {
        let mut warnings = self.category_warnings.clone();

        let mut missing: Vec<String> = Vec::new();
        for field in self.context.fields.iter().filter(|f| f.required) {
            let satisfied_globally = self
                .global_metadata
                .get(&field.key)
                .is_some_and(|v| !v.trim().is_empty());

            let missing_somewhere = self.items.iter().any(|item| {
                let overridden = item.overridden_fields.contains(&field.key)
                    && item
                        .metadata_draft
                        .get(&field.key)
                        .is_some_and(|v| !v.trim().is_empty());
                !(overridden || satisfied_globally)
            });

            if missing_somewhere && !self.items.is_empty() {
                missing.push(field.key.clone());
            }
        }
        if !missing.is_empty() {
            warnings.push(Warning {
                kind: WarningKind::MissingRequiredField,
                severity: WarningSeverity::Error,
                affected_fields: missing,
            });
        }

        warnings
    }

    /// Finalize-eligibility: category selected, every item terminal, at
    /// least one complete, no unresolved error-severity warning.
    ///
    /// Backend stability is a separate gate owned by the engine; this flag
    /// deliberately does not know about it.
    pub fn can_finalize(&self) -> bool {
        self.context.category_id.is_some()
            && !self.items.is_empty()
            && self.items.iter().all(|i| i.status.is_terminal())
            && self.items.iter().any(|i| i.status == ItemStatus::Complete)
            && !self
                .warnings()
                .iter()
                .any(|w| w.severity == WarningSeverity::Error)
    }

    /// Dialog-session reset. Items are not persisted across sessions; the
    /// company/brand context survives, the category selection does not.
    pub fn reset(&mut self) {
        self.items.clear();
        self.global_metadata.clear();
        self.category_warnings.clear();
        self.context.category_id = None;
        self.context.fields.clear();
    }

    fn item_mut(&mut self, client_id: &ClientId) -> Option<&mut UploadItem> {
        self.items.iter_mut().find(|i| i.client_id == *client_id)
    }
}
