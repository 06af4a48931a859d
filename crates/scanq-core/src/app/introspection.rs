//! Introspection - read-only view of every task and its derived state.
//!
//! Each call re-scans the stages. There is no cached list to go stale.

use std::collections::BTreeSet;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::domain::{FolderName, Stage, StoreError, TaskState};
use crate::ports::{PREPARED_MARKER, StageStore};

/// One task as seen by a scan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskEntry {
    pub folder: FolderName,
    pub state: TaskState,
}

/// Number of tasks per derived state.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueCounts {
    pub created: usize,
    pub scheduled_acq: usize,
    pub acq: usize,
    pub scheduled_recon: usize,
    pub recon: usize,
    pub complete: usize,
    pub failure: usize,
}

impl QueueCounts {
    fn bump(&mut self, state: TaskState) {
        let slot = match state {
            TaskState::Created => &mut self.created,
            TaskState::ScheduledAcq => &mut self.scheduled_acq,
            TaskState::Acq => &mut self.acq,
            TaskState::ScheduledRecon => &mut self.scheduled_recon,
            TaskState::Recon => &mut self.recon,
            TaskState::Complete => &mut self.complete,
            TaskState::Failure => &mut self.failure,
        };
        *slot += 1;
    }

    pub fn total(&self) -> usize {
        self.created
            + self.scheduled_acq
            + self.acq
            + self.scheduled_recon
            + self.recon
            + self.complete
            + self.failure
    }
}

/// Console status at one instant, as the operator UI shows it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueSnapshot {
    pub entries: Vec<TaskEntry>,
    pub counts: QueueCounts,
    /// A task is being acquired.
    pub acquisition_active: bool,
    /// A task is waiting for or undergoing reconstruction.
    pub reconstruction_active: bool,
    pub last_completed: Option<FolderName>,
}

#[derive(Clone)]
pub struct Introspection {
    store: Arc<dyn StageStore>,
}

impl Introspection {
    pub fn new(store: Arc<dyn StageStore>) -> Self {
        Self { store }
    }

    /// Every task in stage order, then folder order within a stage.
    ///
    /// A folder seen in two stages (a move raced the scan) is reported once,
    /// under the earlier stage. Folders that disappear mid-scan are dropped.
    pub async fn list_tasks(&self) -> Result<Vec<TaskEntry>, StoreError> {
        let mut seen = BTreeSet::new();
        let mut entries = Vec::new();

        for stage in Stage::ALL {
            for folder in self.store.list(stage).await? {
                if !seen.insert(folder.clone()) {
                    debug!(folder = %folder, stage = %stage, "folder already listed in an earlier stage");
                    continue;
                }
                let prepared = stage == Stage::AcqQueue
                    && self.store.has_marker(stage, &folder, PREPARED_MARKER).await?;
                entries.push(TaskEntry {
                    folder,
                    state: TaskState::derive(stage, prepared),
                });
            }
        }
        Ok(entries)
    }

    pub async fn snapshot(&self) -> Result<QueueSnapshot, StoreError> {
        let entries = self.list_tasks().await?;

        let mut counts = QueueCounts::default();
        let mut last_completed: Option<&FolderName> = None;
        for entry in &entries {
            counts.bump(entry.state);
            if entry.state == TaskState::Complete {
                last_completed = last_completed.max(Some(&entry.folder));
            }
        }
        let last_completed = last_completed.cloned();

        Ok(QueueSnapshot {
            acquisition_active: counts.acq > 0,
            reconstruction_active: counts.scheduled_recon + counts.recon > 0,
            last_completed,
            counts,
            entries,
        })
    }
}
