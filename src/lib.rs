// Library exports for integration tests and embedding dashboards

pub mod api;
pub mod config;
pub mod error;
pub mod models;
pub mod naming;
pub mod upload;

pub use error::UploadError;
pub use models::{
    BatchContext, CategoryField, ClientId, FileSource, ItemStatus, NewUpload, SessionId,
    TransportStatus, UploadItem, UploadType, Warning, WarningKind, WarningSeverity,
};
pub use upload::{BatchEvent, UploadEngine};
