//! Task index engine.
//!
//! Task rows are a derived projection of task blocks in leaf documents:
//! - `derive`: turn one document into rows, honouring persisted overrides
//! - `diff`: compare with persisted rows, skipping unchanged hashes
//! - `index`: persistence and the `TaskIndexer` that ties both together
//! - `classify`: project/area classification of container schemas

mod classify;
mod derive;
mod diff;
mod index;

pub use classify::{classify_schema, SchemaClass};
pub use derive::{
    derive_rows, source_hash, task_id, DerivationContext, AREA_PROP, ATTR_CHECKED, ATTR_DUE,
    ATTR_NEXT_ACTION, ATTR_PRIORITY, ATTR_SCHEDULED, ATTR_STATUS, PROJECT_PROP,
};
pub use diff::{diff, TaskIndexDiff};
pub use index::{
    FsTaskIndex, ReindexSummary, TaskIndexError, TaskIndexStore, TaskIndexer, TaskOverride,
    TASK_INDEX_FILE,
};
