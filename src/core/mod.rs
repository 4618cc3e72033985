pub mod cache;
pub mod comparator;
pub mod content_type;
pub mod engine;
pub mod file_state;
pub mod metadata;
pub mod scanner;
pub mod transfer;

pub use cache::{FingerprintCache, FingerprintStore};
pub use comparator::{ChangeDetector, Decision, SkipReason, UploadReason};
pub use content_type::content_type_for;
pub use engine::{EntryOutcome, SyncEngine, SyncReport, SyncStatus};
pub use file_state::{calculate_file_hash, calculate_hash, FingerprintRecord};
pub use metadata::{MetadataResolver, ResolvedMetadata};
pub use scanner::{EntryKind, FileSystemEntry, TreeWalker};
pub use transfer::{RemoteSyncExecutor, UploadOutcome, VerifyOutcome};
