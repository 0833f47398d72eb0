pub mod analysis;
pub mod api;
pub mod config;
pub mod error;
pub mod merge;
pub mod progress;
pub mod record;
pub mod schema;
pub mod storage;

pub use analysis::{DuplicateCandidate, DuplicateScan, ReviewItem};
pub use api::{handle_invocation, handle_json, MergeInvocation, MergeResponse};
pub use config::AppConfig;
pub use error::{Error, ErrorKind, ErrorObject, MergeError, MergeStep};
pub use merge::{
    FieldPolicy, LockTable, MergeEngine, MergeReport, MergeRequest, MergeState, ReferencePolicy,
};
pub use progress::{MergeReporter, SilentReporter};
pub use record::{FieldValue, Fields, MergeableRecord};
pub use schema::{EntityType, SchemaMap};
pub use storage::Database;
