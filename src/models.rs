use crate::error::UploadError;
use crate::naming;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::io::SeekFrom;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use uuid::Uuid;

/// Client-generated correlation id, created at file intake.
///
/// The only valid key for matching a `TransportRecord` to an `UploadItem`.
/// A distinct type on purpose: filenames, titles and session ids must never
/// be used for correlation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ClientId(Uuid);

impl ClientId {
    pub fn new() -> Self {
        ClientId(Uuid::new_v4())
    }
}

impl Default for ClientId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Backend-assigned identifier for a transfer, created by a successful
/// initiate call. Required before a transfer may be considered complete.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(String);

impl SessionId {
    pub fn new(id: impl Into<String>) -> Self {
        SessionId(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// User-visible status of a batch item.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ItemStatus {
    Queued,
    Uploading,
    Complete,
    Failed,
}

impl ItemStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, ItemStatus::Complete | ItemStatus::Failed)
    }
}

/// Low-level status of a transport record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportStatus {
    Pending,
    Initiating,
    Uploading,
    Completed,
    Failed,
    Paused,
}

impl TransportStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TransportStatus::Completed | TransportStatus::Failed)
    }

    /// Whether a fresh `start_transfer` may be issued for this record.
    pub fn is_startable(&self) -> bool {
        matches!(self, TransportStatus::Pending | TransportStatus::Paused)
    }

    /// Whether the record occupies a concurrency slot.
    pub fn is_active(&self) -> bool {
        matches!(self, TransportStatus::Initiating | TransportStatus::Uploading)
    }
}

/// Transfer strategy, chosen once at record creation by the size threshold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UploadType {
    Direct,
    Chunked,
}

/// Source of an upload's bytes.
///
/// In-memory buffers come from drag-and-drop intake; path sources let large
/// files stay on disk and be read range by range during chunked transfers.
#[derive(Debug, Clone)]
pub enum FileSource {
    Memory(Arc<Vec<u8>>),
    Path { path: PathBuf, size: u64 },
}

impl FileSource {
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        FileSource::Memory(Arc::new(bytes))
    }

    /// Create a path-backed source, capturing the file size up front.
    pub fn from_path(path: PathBuf) -> std::io::Result<Self> {
        let size = std::fs::metadata(&path)?.len();
        Ok(FileSource::Path { path, size })
    }

    pub fn size(&self) -> u64 {
        match self {
            FileSource::Memory(bytes) => bytes.len() as u64,
            FileSource::Path { size, .. } => *size,
        }
    }

    /// Read `len` bytes starting at `offset`, clamped to the source size.
    pub async fn read_range(&self, offset: u64, len: u64) -> std::io::Result<Vec<u8>> {
        match self {
            FileSource::Memory(bytes) => {
                let start = (offset as usize).min(bytes.len());
                let end = ((offset.saturating_add(len)) as usize).min(bytes.len());
                Ok(bytes[start..end].to_vec())
            }
            FileSource::Path { path, .. } => {
                let mut file = tokio::fs::File::open(path).await?;
                file.seek(SeekFrom::Start(offset)).await?;
                let mut buf = Vec::with_capacity(len as usize);
                file.take(len).read_to_end(&mut buf).await?;
                Ok(buf)
            }
        }
    }
}

/// One file in the current upload dialog session, as the user sees it.
///
/// Correlated to its `TransportRecord` by `client_id` and nothing else.
#[derive(Debug, Clone, PartialEq)]
pub struct UploadItem {
    pub client_id: ClientId,
    pub original_filename: String,
    pub file_size: u64,
    pub mime_type: String,
    /// Normalized display title; never empty.
    pub title: String,
    /// Always `slug(title) + '.' + extension(original_filename)`; no
    /// independent mutation path.
    pub resolved_filename: String,
    pub status: ItemStatus,
    /// Assigned exactly once, projected from the transport side; never
    /// reassigned or cleared afterward.
    pub session_id: Option<SessionId>,
    pub progress: u8,
    pub error: Option<UploadError>,
    pub metadata_draft: HashMap<String, String>,
    pub overridden_fields: HashSet<String>,
    /// Progress value last pushed onto this item by the reconciliation
    /// bridge; drives the delta part of the throttle.
    pub last_propagated_progress: u8,
    /// When the bridge last pushed progress; drives the heartbeat part.
    pub last_propagated_at: Option<Instant>,
}

impl UploadItem {
    pub fn new(
        client_id: ClientId,
        original_filename: impl Into<String>,
        file_size: u64,
        mime_type: impl Into<String>,
    ) -> Self {
        let original_filename = original_filename.into();
        let title = naming::normalize_title(&original_filename);
        let resolved_filename = naming::resolved_filename(&title, &original_filename);

        UploadItem {
            client_id,
            original_filename,
            file_size,
            mime_type: mime_type.into(),
            title,
            resolved_filename,
            status: ItemStatus::Queued,
            session_id: None,
            progress: 0,
            error: None,
            metadata_draft: HashMap::new(),
            overridden_fields: HashSet::new(),
            last_propagated_progress: 0,
            last_propagated_at: None,
        }
    }

    /// Re-normalize the title and re-derive the filename. The extension is
    /// always taken from `original_filename`, so it can never drift.
    pub fn set_title(&mut self, raw_title: &str) {
        self.title = naming::normalize_title(raw_title);
        self.resolved_filename = naming::resolved_filename(&self.title, &self.original_filename);
    }
}

/// Per-file bookkeeping entry on the transport side.
#[derive(Debug, Clone)]
pub struct TransportRecord {
    pub client_ref: ClientId,
    /// Absent on records rehydrated from a previous session; such records
    /// cannot be started and are purged by the scheduler.
    pub file: Option<FileSource>,
    pub filename: String,
    pub file_size: u64,
    pub mime_type: String,
    pub status: TransportStatus,
    /// Set once by a successful initiate call, never reassigned or cleared.
    pub session_id: Option<SessionId>,
    pub progress: u8,
    pub upload_type: UploadType,
    /// Present only for chunked transfers.
    pub chunk_size: Option<u64>,
    pub multipart_upload_id: Option<String>,
    pub error: Option<UploadError>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TransportRecord {
    /// Create a pending record, choosing the transfer strategy by size.
    pub fn new(
        client_ref: ClientId,
        file: FileSource,
        filename: impl Into<String>,
        mime_type: impl Into<String>,
        chunk_threshold: u64,
        chunk_size: u64,
    ) -> Self {
        let file_size = file.size();
        let (upload_type, chunk_size) = if file_size >= chunk_threshold {
            (UploadType::Chunked, Some(chunk_size))
        } else {
            (UploadType::Direct, None)
        };

        let now = Utc::now();
        TransportRecord {
            client_ref,
            file: Some(file),
            filename: filename.into(),
            file_size,
            mime_type: mime_type.into(),
            status: TransportStatus::Pending,
            session_id: None,
            progress: 0,
            upload_type,
            chunk_size,
            multipart_upload_id: None,
            error: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}

/// A metadata field defined by the selected category.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CategoryField {
    pub key: String,
    pub label: String,
    pub required: bool,
}

impl CategoryField {
    pub fn new(key: impl Into<String>, label: impl Into<String>, required: bool) -> Self {
        CategoryField {
            key: key.into(),
            label: label.into(),
            required,
        }
    }
}

/// Where the current batch lands: company, brand and (once chosen) category.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchContext {
    pub company_id: String,
    pub brand_id: String,
    /// Finalize is blocked until the user selects a category.
    pub category_id: Option<String>,
    /// Metadata fields valid for the selected category.
    pub fields: Vec<CategoryField>,
}

impl BatchContext {
    pub fn new(company_id: impl Into<String>, brand_id: impl Into<String>) -> Self {
        BatchContext {
            company_id: company_id.into(),
            brand_id: brand_id.into(),
            category_id: None,
            fields: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WarningSeverity {
    Info,
    Warn,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WarningKind {
    /// A required category field has no effective value on some item.
    MissingRequiredField,
    /// A category change dropped metadata values for fields that no longer
    /// apply.
    FieldsDropped,
}

/// Metadata validation notice. Severity `Error` blocks finalize.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Warning {
    pub kind: WarningKind,
    pub severity: WarningSeverity,
    pub affected_fields: Vec<String>,
}

/// A file handed to the engine at intake.
#[derive(Debug, Clone)]
pub struct NewUpload {
    pub filename: String,
    pub mime_type: String,
    pub source: FileSource,
}

impl NewUpload {
    pub fn new(
        filename: impl Into<String>,
        mime_type: impl Into<String>,
        source: FileSource,
    ) -> Self {
        NewUpload {
            filename: filename.into(),
            mime_type: mime_type.into(),
            source,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[tokio::test]
    async fn test_path_source_reads_ranges_clamped_to_file_size() {
        let mut tmp = tempfile::NamedTempFile::new().unwrap();
        tmp.write_all(&[0u8, 1, 2, 3, 4, 5, 6, 7, 8, 9]).unwrap();

        let source = FileSource::from_path(tmp.path().to_path_buf()).unwrap();
        assert_eq!(source.size(), 10);
        assert_eq!(source.read_range(2, 3).await.unwrap(), vec![2, 3, 4]);
        assert_eq!(
            source.read_range(8, 100).await.unwrap(),
            vec![8, 9],
            "tail read clamps to the file size"
        );
    }

    #[tokio::test]
    async fn test_memory_source_range_past_end_is_empty() {
        let source = FileSource::from_bytes(vec![1, 2, 3]);
        assert!(source.read_range(10, 5).await.unwrap().is_empty());
    }

    #[test]
    fn test_title_edit_rederives_filename_but_keeps_extension() {
        let mut item =
            UploadItem::new(ClientId::new(), "Raw_Cut FINAL.MOV", 10, "video/quicktime");
        assert_eq!(item.title, "Raw Cut Final");
        assert_eq!(item.resolved_filename, "raw-cut-final.mov");

        item.set_title("  Beach Day!!  ");
        assert_eq!(item.title, "Beach Day");
        assert_eq!(item.resolved_filename, "beach-day.mov");
    }

    #[test]
    fn test_record_strategy_chosen_by_size_threshold() {
        let id = ClientId::new();
        let small = TransportRecord::new(
            id,
            FileSource::from_bytes(vec![0; 10]),
            "small.bin",
            "application/octet-stream",
            64,
            64,
        );
        assert_eq!(small.upload_type, UploadType::Direct);
        assert_eq!(small.chunk_size, None);

        let large = TransportRecord::new(
            id,
            FileSource::from_bytes(vec![0; 64]),
            "large.bin",
            "application/octet-stream",
            64,
            64,
        );
        assert_eq!(large.upload_type, UploadType::Chunked);
        assert_eq!(large.chunk_size, Some(64));
    }
}
