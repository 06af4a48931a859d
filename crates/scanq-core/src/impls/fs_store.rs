//! FsStageStore - stage directories on a local or shared filesystem.
//!
//! # Layout
//! ```text
//! <root>/queue_acq/<folder>/task.json
//! <root>/acq/<folder>/...
//! <root>/queue_recon/ ... /recon/ ... /complete/ ... /failure/
//! <root>/.staging/            (half-built folders, never listed)
//! ```
//!
//! A move is one `rename(2)` of the task folder. On one filesystem that is
//! atomic, which is what every ownership decision relies on. All stage
//! directories must therefore live on the same filesystem as `.staging/`.

use std::io;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::fs;
use tracing::{debug, warn};

use crate::domain::{FolderName, Stage, StoreError, TaskRecord};
use crate::ports::StageStore;

/// File holding the serialized task record inside each task folder.
pub const RECORD_FILE: &str = "task.json";

const STAGING_DIR: &str = ".staging";
const RECORD_TMP_FILE: &str = ".task.json.tmp";

pub struct FsStageStore {
    root: PathBuf,
}

impl FsStageStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn stage_dir(&self, stage: Stage) -> PathBuf {
        self.root.join(stage.dir_name())
    }

    fn staging_dir(&self) -> PathBuf {
        self.root.join(STAGING_DIR)
    }
}

/// Read a task record straight from a task folder path.
///
/// A missing folder is `NotFound`. A folder without a record file, a record
/// that does not parse, or one whose id disagrees with the folder name is
/// `Corrupt`.
pub async fn read_record_file(folder_path: &Path) -> Result<TaskRecord, StoreError> {
    let file = folder_path.join(RECORD_FILE);
    let raw = match fs::read(&file).await {
        Ok(raw) => raw,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            if !exists(folder_path).await? {
                return Err(StoreError::NotFound {
                    path: folder_path.to_path_buf(),
                });
            }
            return Err(StoreError::Corrupt {
                path: file,
                reason: format!("task folder has no {RECORD_FILE}"),
            });
        }
        Err(e) => return Err(StoreError::io(&file, e)),
    };
    let record: TaskRecord = serde_json::from_slice(&raw).map_err(|e| StoreError::Corrupt {
        path: file.clone(),
        reason: e.to_string(),
    })?;

    if let Some(name) = folder_path.file_name().and_then(|n| n.to_str())
        && name != record.folder_name().as_str()
    {
        return Err(StoreError::Corrupt {
            path: file,
            reason: format!("record id {} does not match folder {name}", record.id),
        });
    }
    Ok(record)
}

/// Write `record` to `folder_path/task.json` through a temp file and a rename,
/// so a reader sees either the old or the new record.
async fn write_record_file(folder_path: &Path, record: &TaskRecord) -> Result<(), StoreError> {
    let file = folder_path.join(RECORD_FILE);
    let tmp = folder_path.join(RECORD_TMP_FILE);
    let bytes = serde_json::to_vec_pretty(record).map_err(|e| StoreError::WriteFailed {
        path: file.clone(),
        source: io::Error::other(e),
    })?;

    fs::write(&tmp, &bytes)
        .await
        .map_err(|source| StoreError::WriteFailed {
            path: tmp.clone(),
            source,
        })?;
    if let Err(source) = fs::rename(&tmp, &file).await {
        let _ = fs::remove_file(&tmp).await;
        return Err(StoreError::WriteFailed { path: file, source });
    }
    Ok(())
}

async fn exists(path: &Path) -> Result<bool, StoreError> {
    fs::try_exists(path)
        .await
        .map_err(|e| StoreError::io(path, e))
}

#[async_trait]
impl StageStore for FsStageStore {
    async fn ensure_layout(&self) -> Result<(), StoreError> {
        for stage in Stage::ALL {
            let dir = self.stage_dir(stage);
            fs::create_dir_all(&dir)
                .await
                .map_err(|e| StoreError::io(&dir, e))?;
        }
        let staging = self.staging_dir();
        fs::create_dir_all(&staging)
            .await
            .map_err(|e| StoreError::io(&staging, e))?;
        Ok(())
    }

    async fn insert(&self, stage: Stage, record: &TaskRecord) -> Result<FolderName, StoreError> {
        let folder = record.folder_name();
        let dest = self.task_path(stage, &folder);
        if exists(&dest).await? {
            return Err(StoreError::DestConflict { folder, to: stage });
        }

        let staging = self.staging_dir().join(&folder);
        if exists(&staging).await? {
            // leftover from a crashed create
            fs::remove_dir_all(&staging)
                .await
                .map_err(|e| StoreError::io(&staging, e))?;
        }
        fs::create_dir_all(&staging)
            .await
            .map_err(|e| StoreError::io(&staging, e))?;

        if let Err(err) = write_record_file(&staging, record).await {
            let _ = fs::remove_dir_all(&staging).await;
            return Err(err);
        }

        if let Err(e) = fs::rename(&staging, &dest).await {
            let _ = fs::remove_dir_all(&staging).await;
            return Err(match e.kind() {
                io::ErrorKind::AlreadyExists | io::ErrorKind::DirectoryNotEmpty => {
                    StoreError::DestConflict { folder, to: stage }
                }
                _ => StoreError::io(&dest, e),
            });
        }
        debug!(folder = %folder, stage = %stage, "task folder created");
        Ok(folder)
    }

    async fn read_record(
        &self,
        stage: Stage,
        folder: &FolderName,
    ) -> Result<TaskRecord, StoreError> {
        read_record_file(&self.task_path(stage, folder)).await
    }

    async fn write_record(
        &self,
        stage: Stage,
        folder: &FolderName,
        record: &TaskRecord,
    ) -> Result<(), StoreError> {
        let path = self.task_path(stage, folder);
        if !exists(&path).await? {
            return Err(StoreError::NotFound { path });
        }
        write_record_file(&path, record).await
    }

    async fn list(&self, stage: Stage) -> Result<Vec<FolderName>, StoreError> {
        let dir = self.stage_dir(stage);
        let mut entries = fs::read_dir(&dir)
            .await
            .map_err(|e| StoreError::io(&dir, e))?;

        let mut folders = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| StoreError::io(&dir, e))?
        {
            // vanished between readdir and stat: it was moved, skip it
            let Ok(file_type) = entry.file_type().await else {
                continue;
            };
            if !file_type.is_dir() {
                continue;
            }
            let name = entry.file_name();
            match name.to_str().and_then(FolderName::parse) {
                Some(folder) => folders.push(folder),
                None => debug!(entry = ?name, stage = %stage, "ignoring non-task entry"),
            }
        }
        folders.sort();
        Ok(folders)
    }

    async fn contains(&self, stage: Stage, folder: &FolderName) -> Result<bool, StoreError> {
        exists(&self.task_path(stage, folder)).await
    }

    async fn move_task(
        &self,
        folder: &FolderName,
        from: Stage,
        to: Stage,
    ) -> Result<(), StoreError> {
        let src = self.task_path(from, folder);
        let dst = self.task_path(to, folder);

        if from == to {
            return if exists(&src).await? {
                Ok(())
            } else {
                Err(StoreError::SourceMissing {
                    folder: folder.clone(),
                    from,
                })
            };
        }

        // rename(2) silently replaces an empty directory, so refuse up front.
        // If the destination is occupied because a competing worker just
        // moved this very folder there, the source is gone too: that is a
        // lost race, not a conflict.
        if exists(&dst).await? {
            if !exists(&src).await? {
                return Err(StoreError::SourceMissing {
                    folder: folder.clone(),
                    from,
                });
            }
            return Err(StoreError::DestConflict {
                folder: folder.clone(),
                to,
            });
        }

        match fs::rename(&src, &dst).await {
            Ok(()) => {
                debug!(folder = %folder, from = %from, to = %to, "task moved");
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                let to_dir = self.stage_dir(to);
                if !exists(&to_dir).await? {
                    return Err(StoreError::io(to_dir, e));
                }
                Err(StoreError::SourceMissing {
                    folder: folder.clone(),
                    from,
                })
            }
            Err(e)
                if matches!(
                    e.kind(),
                    io::ErrorKind::AlreadyExists | io::ErrorKind::DirectoryNotEmpty
                ) =>
            {
                Err(StoreError::DestConflict {
                    folder: folder.clone(),
                    to,
                })
            }
            Err(e) => Err(StoreError::io(&src, e)),
        }
    }

    async fn clear(&self, stage: Stage) -> Result<(), StoreError> {
        let dir = self.stage_dir(stage);
        let mut entries = fs::read_dir(&dir)
            .await
            .map_err(|e| StoreError::io(&dir, e))?;
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| StoreError::io(&dir, e))?
        {
            let path = entry.path();
            let result = match entry.file_type().await {
                Ok(t) if t.is_dir() => fs::remove_dir_all(&path).await,
                Ok(_) => fs::remove_file(&path).await,
                Err(e) => Err(e),
            };
            match result {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => return Err(StoreError::io(path, e)),
            }
        }
        warn!(stage = %stage, "stage directory cleared");
        Ok(())
    }

    async fn remove(&self, stage: Stage, folder: &FolderName) -> Result<(), StoreError> {
        let path = self.task_path(stage, folder);
        fs::remove_dir_all(&path).await.map_err(|e| {
            if e.kind() == io::ErrorKind::NotFound {
                StoreError::NotFound { path: path.clone() }
            } else {
                StoreError::io(&path, e)
            }
        })
    }

    async fn set_marker(
        &self,
        stage: Stage,
        folder: &FolderName,
        marker: &str,
    ) -> Result<(), StoreError> {
        let path = self.task_path(stage, folder);
        if !exists(&path).await? {
            return Err(StoreError::NotFound { path });
        }
        let marker_path = path.join(marker);
        fs::write(&marker_path, b"")
            .await
            .map_err(|source| StoreError::WriteFailed {
                path: marker_path,
                source,
            })
    }

    async fn has_marker(
        &self,
        stage: Stage,
        folder: &FolderName,
        marker: &str,
    ) -> Result<bool, StoreError> {
        exists(&self.task_path(stage, folder).join(marker)).await
    }

    fn task_path(&self, stage: Stage, folder: &FolderName) -> PathBuf {
        self.stage_dir(stage).join(folder)
    }
}
