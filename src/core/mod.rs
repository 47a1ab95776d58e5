pub mod cache;
pub mod conflict;
pub mod engine;
pub mod error;
pub mod events;
pub mod history;
pub mod lock_retry;
pub mod queue;
pub mod stability;
pub mod upload;
pub mod verify;
pub mod watcher;

pub use cache::ChecksumCache;
pub use conflict::{ConflictAction, ConflictPolicy, ConflictResolver, PendingConflict, SettledConflict};
pub use engine::{IntegrityReport, LocalFiles, OsFiles, Pipeline};
pub use error::{FileAccessError, TransferError};
pub use events::PipelineEvent;
pub use history::{UploadHistoryStore, UploadRecord};
pub use lock_retry::{LockRetrySettings, LockedAccessRetrier};
pub use queue::{QueueItem, QueueSnapshot, QueueStatus, TransferQueue};
pub use stability::StabilityTracker;
pub use upload::{UploadEngine, UploadSettings};
pub use verify::{IntegrityVerifier, VerifyOutcome, VerifySettings};
pub use watcher::{DirectoryWatcher, WatchFilter};
