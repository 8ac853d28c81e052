//! Diffing freshly derived task rows against the persisted ones. Rows whose
//! source hash is unchanged are left alone.

use crate::model::TaskIndexRow;
use std::collections::{HashMap, HashSet};

/// Changes needed to bring one document's persisted rows up to date.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TaskIndexDiff {
    pub to_upsert: Vec<TaskIndexRow>,
    pub to_delete_ids: Vec<String>,
}

impl TaskIndexDiff {
    pub fn is_empty(&self) -> bool {
        self.to_upsert.is_empty() && self.to_delete_ids.is_empty()
    }
}

/// Compare persisted rows with freshly derived ones.
///
/// Rows whose hash is unchanged are left out so their `updated_at` stays put.
/// New or changed rows are stamped with `now`; persisted rows that were not
/// derived again are deleted.
pub fn diff(existing: &[TaskIndexRow], derived: Vec<TaskIndexRow>, now: i64) -> TaskIndexDiff {
    let persisted: HashMap<&str, &str> = existing
        .iter()
        .map(|r| (r.task_id.as_str(), r.source_hash.as_str()))
        .collect();
    let derived_ids: HashSet<String> = derived.iter().map(|r| r.task_id.clone()).collect();

    let to_upsert = derived
        .into_iter()
        .filter(|row| persisted.get(row.task_id.as_str()) != Some(&row.source_hash.as_str()))
        .map(|mut row| {
            row.updated_at = now;
            row
        })
        .collect();

    let to_delete_ids = existing
        .iter()
        .filter(|r| !derived_ids.contains(&r.task_id))
        .map(|r| r.task_id.clone())
        .collect();

    TaskIndexDiff {
        to_upsert,
        to_delete_ids,
    }
}
