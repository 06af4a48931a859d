//! Cleanup - the only component that deletes task folders.
//!
//! Scanner loops never remove anything; finished tasks stay in `complete` or
//! `failure` until an operator purges them.

use std::sync::Arc;

use tracing::{info, warn};

use crate::domain::{FolderName, Stage, StoreError};
use crate::ports::StageStore;

#[derive(Clone)]
pub struct Cleanup {
    store: Arc<dyn StageStore>,
}

impl Cleanup {
    pub fn new(store: Arc<dyn StageStore>) -> Self {
        Self { store }
    }

    /// Delete a task that reached a terminal stage.
    pub async fn purge(&self, folder: &FolderName) -> Result<Stage, StoreError> {
        let stage = self.store.locate(folder).await?.ok_or_else(|| StoreError::Untracked {
            folder: folder.clone(),
        })?;
        if !stage.is_terminal() {
            return Err(StoreError::NotTerminal {
                folder: folder.clone(),
                stage,
            });
        }
        self.store.remove(stage, folder).await?;
        info!(folder = %folder, stage = %stage, "task purged");
        Ok(stage)
    }

    /// Remove everything in one stage.
    pub async fn clear_stage(&self, stage: Stage) -> Result<(), StoreError> {
        self.store.clear(stage).await
    }

    /// Remove every task in every stage. Used when an exam is opened or closed,
    /// never while workers are running.
    pub async fn clear_all(&self) -> Result<(), StoreError> {
        warn!("clearing all stages");
        for stage in Stage::ALL {
            self.store.clear(stage).await?;
        }
        Ok(())
    }
}
