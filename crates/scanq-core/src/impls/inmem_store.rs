//! InMemoryStageStore - stage store for tests and dry runs.
//!
//! # Implementation
//! - `BTreeMap<Stage, BTreeMap<FolderName, Entry>>` behind one tokio `Mutex`
//! - every operation, `move_task` included, is a single critical section,
//!   which gives the same all-or-nothing visibility as a rename
//! - records are kept as JSON text so corrupt records can be injected

use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::domain::{FolderName, Stage, StoreError, TaskRecord};
use crate::ports::StageStore;

#[derive(Debug, Default)]
struct Entry {
    record_json: String,
    markers: BTreeSet<String>,
}

type Stages = BTreeMap<Stage, BTreeMap<FolderName, Entry>>;

pub struct InMemoryStageStore {
    stages: Mutex<Stages>,
    /// Only used to build `task_path`; nothing is ever written there.
    root: PathBuf,
}

impl InMemoryStageStore {
    pub fn new() -> Self {
        Self::with_root("/nonexistent/scanq")
    }

    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        let stages = Stage::ALL
            .into_iter()
            .map(|stage| (stage, BTreeMap::new()))
            .collect();
        Self {
            stages: Mutex::new(stages),
            root: root.into(),
        }
    }

    /// Place a folder holding arbitrary record text, bypassing validation.
    #[cfg(test)]
    pub(crate) async fn insert_raw(&self, stage: Stage, folder: FolderName, record_json: impl Into<String>) {
        let mut stages = self.stages.lock().await;
        stages.entry(stage).or_default().insert(
            folder,
            Entry {
                record_json: record_json.into(),
                markers: BTreeSet::new(),
            },
        );
    }

    fn not_found(&self, stage: Stage, folder: &FolderName) -> StoreError {
        StoreError::NotFound {
            path: self.task_path(stage, folder),
        }
    }

    fn encode(record: &TaskRecord) -> Result<String, StoreError> {
        serde_json::to_string(record).map_err(|e| StoreError::WriteFailed {
            path: PathBuf::from(record.folder_name().as_str()),
            source: std::io::Error::other(e),
        })
    }
}

impl Default for InMemoryStageStore {
    fn default() -> Self {
        Self::new()
    }
}


#[async_trait]
impl StageStore for InMemoryStageStore {
    async fn ensure_layout(&self) -> Result<(), StoreError> {
        let mut stages = self.stages.lock().await;
        for stage in Stage::ALL {
            stages.entry(stage).or_default();
        }
        Ok(())
    }

    async fn insert(&self, stage: Stage, record: &TaskRecord) -> Result<FolderName, StoreError> {
        let folder = record.folder_name();
        let record_json = Self::encode(record)?;
        let mut stages = self.stages.lock().await;
        let slot = stages.entry(stage).or_default();
        if slot.contains_key(&folder) {
            return Err(StoreError::DestConflict { folder, to: stage });
        }
        slot.insert(
            folder.clone(),
            Entry {
                record_json,
                markers: BTreeSet::new(),
            },
        );
        Ok(folder)
    }

    async fn read_record(
        &self,
        stage: Stage,
        folder: &FolderName,
    ) -> Result<TaskRecord, StoreError> {
        let stages = self.stages.lock().await;
        let entry = stages
            .get(&stage)
            .and_then(|s| s.get(folder))
            .ok_or_else(|| self.not_found(stage, folder))?;
        let path = self.task_path(stage, folder);
        let record: TaskRecord =
            serde_json::from_str(&entry.record_json).map_err(|e| StoreError::Corrupt {
                path: path.clone(),
                reason: e.to_string(),
            })?;
        if record.folder_name() != *folder {
            return Err(StoreError::Corrupt {
                path,
                reason: format!("record id {} does not match folder {folder}", record.id),
            });
        }
        Ok(record)
    }

    async fn write_record(
        &self,
        stage: Stage,
        folder: &FolderName,
        record: &TaskRecord,
    ) -> Result<(), StoreError> {
        let record_json = Self::encode(record)?;
        let mut stages = self.stages.lock().await;
        let entry = stages
            .get_mut(&stage)
            .and_then(|s| s.get_mut(folder))
            .ok_or_else(|| self.not_found(stage, folder))?;
        entry.record_json = record_json;
        Ok(())
    }

    async fn list(&self, stage: Stage) -> Result<Vec<FolderName>, StoreError> {
        let stages = self.stages.lock().await;
        Ok(stages
            .get(&stage)
            .map(|s| s.keys().cloned().collect())
            .unwrap_or_default())
    }

    async fn contains(&self, stage: Stage, folder: &FolderName) -> Result<bool, StoreError> {
        let stages = self.stages.lock().await;
        Ok(stages.get(&stage).is_some_and(|s| s.contains_key(folder)))
    }

    async fn move_task(
        &self,
        folder: &FolderName,
        from: Stage,
        to: Stage,
    ) -> Result<(), StoreError> {
        let mut stages = self.stages.lock().await;
        let in_source = stages.get(&from).is_some_and(|s| s.contains_key(folder));
        if !in_source {
            return Err(StoreError::SourceMissing {
                folder: folder.clone(),
                from,
            });
        }
        if from == to {
            return Ok(());
        }
        if stages.get(&to).is_some_and(|s| s.contains_key(folder)) {
            return Err(StoreError::DestConflict {
                folder: folder.clone(),
                to,
            });
        }
        let Some(entry) = stages.get_mut(&from).and_then(|s| s.remove(folder)) else {
            return Err(StoreError::SourceMissing {
                folder: folder.clone(),
                from,
            });
        };
        stages.entry(to).or_default().insert(folder.clone(), entry);
        Ok(())
    }

    async fn clear(&self, stage: Stage) -> Result<(), StoreError> {
        let mut stages = self.stages.lock().await;
        if let Some(s) = stages.get_mut(&stage) {
            s.clear();
        }
        Ok(())
    }

    async fn remove(&self, stage: Stage, folder: &FolderName) -> Result<(), StoreError> {
        let mut stages = self.stages.lock().await;
        stages
            .get_mut(&stage)
            .and_then(|s| s.remove(folder))
            .map(|_| ())
            .ok_or_else(|| self.not_found(stage, folder))
    }

    async fn set_marker(
        &self,
        stage: Stage,
        folder: &FolderName,
        marker: &str,
    ) -> Result<(), StoreError> {
        let mut stages = self.stages.lock().await;
        let entry = stages
            .get_mut(&stage)
            .and_then(|s| s.get_mut(folder))
            .ok_or_else(|| self.not_found(stage, folder))?;
        entry.markers.insert(marker.to_string());
        Ok(())
    }

    async fn has_marker(
        &self,
        stage: Stage,
        folder: &FolderName,
        marker: &str,
    ) -> Result<bool, StoreError> {
        let stages = self.stages.lock().await;
        Ok(stages
            .get(&stage)
            .and_then(|s| s.get(folder))
            .is_some_and(|e| e.markers.contains(marker)))
    }

    fn task_path(&self, stage: Stage, folder: &FolderName) -> PathBuf {
        self.root.join(stage.dir_name()).join(folder)
    }
}
