// # Upload Orchestration
//
// The services that take a dropped file from intake to a finalized asset:
// transport transfers bytes, the batch holds the editable view, reconcile
// bridges the two, the scheduler meters concurrency, stability confirms
// durability and finalize commits.

pub mod batch;
pub mod engine;
pub mod finalize;
pub mod reconcile;
pub mod scheduler;
pub mod stability;
pub mod transport;

pub use batch::BatchState;
pub use engine::{BatchEvent, UploadEngine};
pub use finalize::{FinalizeCoordinator, FinalizeError};
pub use reconcile::reconcile;
pub use scheduler::{QueueScheduler, StartOutcome};
pub use stability::{StabilityState, StabilityVerifier};
pub use transport::{TransferSettings, TransportEvent, TransportManager};
