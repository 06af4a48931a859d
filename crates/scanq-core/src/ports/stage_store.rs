//! StageStore port - a relocatable keyed store of task folders.
//!
//! Every lifecycle stage is a keyed collection of folders, and a task's
//! ownership is encoded by which collection holds its folder. Nothing else is
//! shared between worker processes.
//!
//! # Implementations
//! - `FsStageStore`: one directory per stage, `rename(2)` as the move
//! - `InMemoryStageStore`: one mutex-guarded map, the move is a single critical section

use std::path::PathBuf;

use async_trait::async_trait;

use crate::domain::{FolderName, Stage, StoreError, TaskRecord};

/// Marker written into a task folder once the operator schedules it.
pub const PREPARED_MARKER: &str = "prepared";

/// StageStore holds task folders, each in exactly one stage.
///
/// # Contract
/// - `move_task` is atomic for every concurrent reader: the folder is never
///   observable in both stages and never in neither.
/// - `move_task` never overwrites. A folder already present at the
///   destination is [`StoreError::DestConflict`]; a folder absent from the
///   source is [`StoreError::SourceMissing`].
/// - `insert` is all-or-nothing: either the complete folder appears in the
///   stage or nothing does.
/// - `list` returns folder names in ascending order.
#[async_trait]
pub trait StageStore: Send + Sync {
    /// Create any missing stage locations.
    async fn ensure_layout(&self) -> Result<(), StoreError>;

    /// Create a new task folder holding `record` in `stage`.
    async fn insert(&self, stage: Stage, record: &TaskRecord) -> Result<FolderName, StoreError>;

    async fn read_record(&self, stage: Stage, folder: &FolderName)
    -> Result<TaskRecord, StoreError>;

    /// Overwrite the record of a folder in place.
    async fn write_record(
        &self,
        stage: Stage,
        folder: &FolderName,
        record: &TaskRecord,
    ) -> Result<(), StoreError>;

    async fn list(&self, stage: Stage) -> Result<Vec<FolderName>, StoreError>;

    async fn contains(&self, stage: Stage, folder: &FolderName) -> Result<bool, StoreError>;

    /// First stage, in lifecycle order, that holds `folder`.
    async fn locate(&self, folder: &FolderName) -> Result<Option<Stage>, StoreError> {
        for stage in Stage::ALL {
            if self.contains(stage, folder).await? {
                return Ok(Some(stage));
            }
        }
        Ok(None)
    }

    /// Relocate a folder. This is the only state transition primitive.
    async fn move_task(&self, folder: &FolderName, from: Stage, to: Stage)
    -> Result<(), StoreError>;

    /// Remove everything in a stage.
    async fn clear(&self, stage: Stage) -> Result<(), StoreError>;

    /// Remove one folder and all of its contents.
    async fn remove(&self, stage: Stage, folder: &FolderName) -> Result<(), StoreError>;

    async fn set_marker(
        &self,
        stage: Stage,
        folder: &FolderName,
        marker: &str,
    ) -> Result<(), StoreError>;

    /// `false` when the marker or the folder itself is absent.
    async fn has_marker(
        &self,
        stage: Stage,
        folder: &FolderName,
        marker: &str,
    ) -> Result<bool, StoreError>;

    /// Location handed to processing collaborators.
    fn task_path(&self, stage: Stage, folder: &FolderName) -> PathBuf;
}
