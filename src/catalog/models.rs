//! Entities from spec.md §3: Fingerprint, Trigger, Destination, Task.

use crate::ids::{HumanReadableId, InferenceServerUid};
use camino::Utf8PathBuf;
use time::OffsetDateTime;

/// Immutable-ish rule binding a classification criterion to a remote
/// inference endpoint and a set of forwarding destinations. Created and
/// deleted via the external catalog API; never mutated by the core pipeline.
#[derive(Debug, Clone, PartialEq)]
pub struct Fingerprint {
    pub id: i64,
    pub human_readable_id: HumanReadableId,
    pub inference_server_url: String,
    pub version: Option<String>,
    pub description: Option<String>,
    pub delete_locally: bool,
    pub delete_remotely: bool,
    pub created_timestamp: OffsetDateTime,
    pub triggers: Vec<Trigger>,
    pub destinations: Vec<Destination>,
}

/// One pattern-match row belonging to a Fingerprint (spec.md §3, §4.3).
///
/// Patterns are case-insensitive regular expressions; `sop_class_uid_exact`
/// is an equality check. An absent optional field means "this clause passes".
#[derive(Debug, Clone, PartialEq)]
pub struct Trigger {
    pub id: i64,
    pub fingerprint_id: i64,
    pub study_description_pattern: Option<String>,
    pub series_description_pattern: Option<String>,
    pub sop_class_uid_exact: Option<String>,
    pub exclude_pattern: Option<String>,
}

/// A downstream DICOM peer that may be referenced by many Fingerprints.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Destination {
    pub id: i64,
    pub host: String,
    pub port: u16,
    pub ae_title: crate::ids::AeTitle,
}

/// Task status codes, persisted as the integers from spec.md §4.6.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskStatus {
    Pending,
    Posted,
    Retrieved,
    Forwarded,
    Succeeded,
    FailedCleaned,
    Failed,
}

impl TaskStatus {
    pub fn code(self) -> i64 {
        match self {
            TaskStatus::Pending => 0,
            TaskStatus::Posted => 1,
            TaskStatus::Retrieved => 2,
            TaskStatus::Forwarded => 3,
            TaskStatus::Succeeded => 10,
            TaskStatus::FailedCleaned => 11,
            TaskStatus::Failed => -1,
        }
    }

    pub fn from_code(code: i64) -> Option<Self> {
        let status = match code {
            0 => TaskStatus::Pending,
            1 => TaskStatus::Posted,
            2 => TaskStatus::Retrieved,
            3 => TaskStatus::Forwarded,
            10 => TaskStatus::Succeeded,
            11 => TaskStatus::FailedCleaned,
            -1 => TaskStatus::Failed,
            _ => return None,
        };
        Some(status)
    }

    /// Terminal states: SUCCEEDED, FAILED_CLEANED. `FAILED` is terminal for
    /// the Retire phase's purposes (spec.md §4.6 Phase A) but still has
    /// cleanup pending, so it is intentionally excluded here.
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskStatus::Succeeded | TaskStatus::FailedCleaned)
    }

    /// Whether `self -> next` is a legal transition per the state machine in
    /// spec.md §4.6, with the documented `RETRIEVED -> FAILED` exception
    /// (invariant 2 calls the edge `RETRIEVABLE -> FAILED`; "Retrieved" is the
    /// status this spec names that state).
    pub fn can_transition_to(self, next: TaskStatus) -> bool {
        use TaskStatus::*;
        match (self, next) {
            (Pending, Posted) => true,
            (Posted, Retrieved) => true,
            (Retrieved, Forwarded) => true,
            (Forwarded, Succeeded) => true,
            (Failed, FailedCleaned) => true,
            // Phase A (Retire) may fail any non-terminal, non-FAILED task
            // regardless of its current status.
            (from, Failed) if !from.is_terminal() && from != Failed => true,
            _ => false,
        }
    }
}

/// The persistent unit of work produced by a (StudyGroup x matching
/// Fingerprint) pair (spec.md §3).
#[derive(Debug, Clone, PartialEq)]
pub struct Task {
    pub id: i64,
    pub fingerprint_id: i64,
    pub input_archive_path: Utf8PathBuf,
    pub output_archive_path: Utf8PathBuf,
    pub status: TaskStatus,
    pub inference_server_uid: Option<InferenceServerUid>,
    pub deleted_local: bool,
    pub deleted_remote: bool,
    pub created_timestamp: OffsetDateTime,
}

/// Fields of a Task which may be updated by `update_task` (spec.md §4.2).
/// Each field is optional; absent fields are left untouched.
#[derive(Debug, Clone, Default)]
pub struct TaskUpdate {
    pub inference_server_uid: Option<InferenceServerUid>,
    pub status: Option<TaskStatus>,
    pub deleted_local: Option<bool>,
    pub deleted_remote: Option<bool>,
}

impl TaskUpdate {
    pub fn status(status: TaskStatus) -> Self {
        Self {
            status: Some(status),
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_code_roundtrip() {
        for status in [
            TaskStatus::Pending,
            TaskStatus::Posted,
            TaskStatus::Retrieved,
            TaskStatus::Forwarded,
            TaskStatus::Succeeded,
            TaskStatus::FailedCleaned,
            TaskStatus::Failed,
        ] {
            assert_eq!(TaskStatus::from_code(status.code()), Some(status));
        }
    }

    #[test]
    fn test_monotonic_transitions() {
        assert!(TaskStatus::Pending.can_transition_to(TaskStatus::Posted));
        assert!(TaskStatus::Posted.can_transition_to(TaskStatus::Retrieved));
        assert!(TaskStatus::Retrieved.can_transition_to(TaskStatus::Forwarded));
        assert!(TaskStatus::Forwarded.can_transition_to(TaskStatus::Succeeded));
        assert!(!TaskStatus::Posted.can_transition_to(TaskStatus::Pending));
        assert!(!TaskStatus::Succeeded.can_transition_to(TaskStatus::Failed));
    }

    #[test]
    fn test_retrieved_can_fail() {
        assert!(TaskStatus::Retrieved.can_transition_to(TaskStatus::Failed));
    }
}
