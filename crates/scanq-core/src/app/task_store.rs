//! TaskStore - creation, reads and guarded writes of task records.
//!
//! # Mutability
//! | state          | `write` | `update_parameters` | `schedule`       |
//! |----------------|---------|---------------------|------------------|
//! | created        | yes     | yes                 | yes              |
//! | scheduled_acq  | no      | no                  | no-op            |
//! | acq / recon    | yes     | no                  | no               |
//! | anything else  | no      | no                  | no               |
//!
//! Writes in the active stages belong to the worker that claimed the task.

use std::path::PathBuf;
use std::sync::Arc;

use tracing::{debug, info};

use crate::domain::{
    ExamInfo, FolderName, Parameters, ScanSpec, Stage, StoreError, TaskRecord, TaskState,
};
use crate::ports::{Clock, IdGenerator, PREPARED_MARKER, StageStore};

#[derive(Clone)]
pub struct TaskStore {
    store: Arc<dyn StageStore>,
    clock: Arc<dyn Clock>,
    ids: Arc<dyn IdGenerator>,
}

impl TaskStore {
    pub fn new(
        store: Arc<dyn StageStore>,
        clock: Arc<dyn Clock>,
        ids: Arc<dyn IdGenerator>,
    ) -> Self {
        Self { store, clock, ids }
    }

    pub fn stage_store(&self) -> &Arc<dyn StageStore> {
        &self.store
    }

    /// Exam context for scans started now.
    pub fn open_exam(&self, patient_position: impl Into<String>) -> ExamInfo {
        ExamInfo {
            id: self.ids.generate_exam_id(),
            patient_position: patient_position.into(),
            started_at: self.clock.now(),
        }
    }

    /// Validate `spec` and place a new task in the acquisition queue.
    ///
    /// Nothing is written when validation fails.
    pub async fn create(&self, spec: ScanSpec) -> Result<FolderName, StoreError> {
        let record = TaskRecord::from_spec(self.ids.generate_task_id(), spec, self.clock.now())?;
        let folder = self.store.insert(Stage::AcqQueue, &record).await?;
        info!(
            folder = %folder,
            sequence = %record.sequence,
            scan_counter = record.scan_counter,
            "task created"
        );
        Ok(folder)
    }

    pub async fn read(&self, stage: Stage, folder: &FolderName) -> Result<TaskRecord, StoreError> {
        self.store.read_record(stage, folder).await
    }

    /// Overwrite the record of a task that is still mutable in `stage`.
    pub async fn write(
        &self,
        stage: Stage,
        folder: &FolderName,
        record: &TaskRecord,
    ) -> Result<(), StoreError> {
        if record.folder_name() != *folder {
            return Err(StoreError::InvalidSpec(format!(
                "record {} cannot be written into folder {folder}",
                record.id
            )));
        }
        let state = self.state_in(stage, folder).await?;
        match state {
            TaskState::Created | TaskState::Acq | TaskState::Recon => {
                self.store.write_record(stage, folder, record).await
            }
            other => Err(not_mutable(folder, other)),
        }
    }

    /// Freeze a created task and make it eligible for acquisition.
    ///
    /// Scheduling an already scheduled task is a no-op.
    pub async fn schedule(&self, folder: &FolderName) -> Result<(), StoreError> {
        let stage = self.require_stage(folder).await?;
        match self.state_in(stage, folder).await? {
            TaskState::ScheduledAcq => Ok(()),
            TaskState::Created => {
                let mut record = self.store.read_record(stage, folder).await?;
                record.timestamps.scheduled_at = Some(self.clock.now());
                self.store.write_record(stage, folder, &record).await?;
                // marker last: a crash in between leaves the task editable
                self.store.set_marker(stage, folder, PREPARED_MARKER).await?;
                info!(folder = %folder, "task scheduled for acquisition");
                Ok(())
            }
            other => Err(not_mutable(folder, other)),
        }
    }

    /// Merge `params` into the parameters of a created task.
    pub async fn update_parameters(
        &self,
        folder: &FolderName,
        params: Parameters,
    ) -> Result<TaskRecord, StoreError> {
        let stage = self.require_stage(folder).await?;
        match self.state_in(stage, folder).await? {
            TaskState::Created => {
                let mut record = self.store.read_record(stage, folder).await?;
                if let Some(key) = params.keys().find(|k| k.trim().is_empty()) {
                    return Err(StoreError::InvalidSpec(format!(
                        "parameter key '{key}' must not be blank"
                    )));
                }
                record.parameters.extend(params);
                self.store.write_record(stage, folder, &record).await?;
                debug!(folder = %folder, "parameters updated");
                Ok(record)
            }
            other => Err(not_mutable(folder, other)),
        }
    }

    /// Create a new task from the settings of `source`, wherever it lives.
    pub async fn duplicate(
        &self,
        source: &FolderName,
        scan_counter: i64,
    ) -> Result<FolderName, StoreError> {
        let stage = self.require_stage(source).await?;
        let original = self.store.read_record(stage, source).await?;

        let mut spec = ScanSpec::new(original.sequence, scan_counter, original.exam);
        spec.protocol_name = original.protocol_name;
        spec.description = original.description;
        spec.patient = original.patient;
        spec.system = original.system;
        spec.parameters = original.parameters;
        spec.processing = original.processing;

        let folder = self.create(spec).await?;
        info!(source = %source, folder = %folder, "task duplicated");
        Ok(folder)
    }

    /// Earliest stage holding `folder`, if any.
    pub async fn locate(&self, folder: &FolderName) -> Result<Option<Stage>, StoreError> {
        self.store.locate(folder).await
    }

    pub async fn path_of(&self, folder: &FolderName) -> Result<PathBuf, StoreError> {
        let stage = self.require_stage(folder).await?;
        Ok(self.store.task_path(stage, folder))
    }

    /// Current derived state of a task.
    pub async fn state_of(&self, folder: &FolderName) -> Result<TaskState, StoreError> {
        let stage = self.require_stage(folder).await?;
        self.state_in(stage, folder).await
    }

    async fn require_stage(&self, folder: &FolderName) -> Result<Stage, StoreError> {
        self.locate(folder)
            .await?
            .ok_or_else(|| StoreError::Untracked {
                folder: folder.clone(),
            })
    }

    async fn state_in(&self, stage: Stage, folder: &FolderName) -> Result<TaskState, StoreError> {
        let prepared = if stage == Stage::AcqQueue {
            self.store.has_marker(stage, folder, PREPARED_MARKER).await?
        } else {
            false
        };
        Ok(TaskState::derive(stage, prepared))
    }
}

fn not_mutable(folder: &FolderName, state: TaskState) -> StoreError {
    StoreError::NotMutable {
        folder: folder.clone(),
        state: state.label().to_string(),
    }
}
