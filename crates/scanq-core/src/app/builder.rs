//! ConsoleBuilder - wiring of the console services.
//!
//! Fail-fast: `expect_workers()` names the workers this process will run, and
//! `build()` refuses to produce a console when one of them has no collaborator.

use std::sync::Arc;

use crate::app::cleanup::Cleanup;
use crate::app::introspection::Introspection;
use crate::app::scanner_loop::{LoopSettings, ScannerLoop, WorkerKind};
use crate::app::task_store::TaskStore;
use crate::app::worker_group::WorkerGroup;
use crate::config::ConsoleConfig;
use crate::impls::FsStageStore;
use crate::ports::{Clock, IdGenerator, Processor, StageStore, SystemClock, UlidGenerator};

/// # Example
/// ```ignore
/// let console = ConsoleBuilder::new(Arc::new(FsStageStore::new(root)))
///     .acquisition(Arc::new(Driver::default()))
///     .reconstruction(Arc::new(Pipeline::default()))
///     .expect_workers(&[WorkerKind::Acquisition, WorkerKind::Reconstruction])
///     .build()?;
/// let group = console.spawn_workers();
/// ```
pub struct ConsoleBuilder {
    store: Arc<dyn StageStore>,
    clock: Option<Arc<dyn Clock>>,
    ids: Option<Arc<dyn IdGenerator>>,
    acquisition_settings: LoopSettings,
    reconstruction_settings: LoopSettings,
    acquisition: Option<Arc<dyn Processor>>,
    reconstruction: Option<Arc<dyn Processor>>,
    expected_workers: Vec<WorkerKind>,
}

#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    #[error("missing collaborators for workers: {0:?}")]
    MissingProcessors(Vec<&'static str>),
}

impl ConsoleBuilder {
    pub fn new(store: Arc<dyn StageStore>) -> Self {
        Self {
            store,
            clock: None,
            ids: None,
            acquisition_settings: LoopSettings::default(),
            reconstruction_settings: LoopSettings::default(),
            acquisition: None,
            reconstruction: None,
            expected_workers: Vec::new(),
        }
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn id_generator(mut self, ids: Arc<dyn IdGenerator>) -> Self {
        self.ids = Some(ids);
        self
    }

    /// Filesystem-backed console rooted at `config.data_root`.
    pub fn from_config(config: &ConsoleConfig) -> Self {
        Self::new(Arc::new(FsStageStore::new(&config.data_root)))
            .worker_settings(
                WorkerKind::Acquisition,
                config.loop_settings(WorkerKind::Acquisition),
            )
            .worker_settings(
                WorkerKind::Reconstruction,
                config.loop_settings(WorkerKind::Reconstruction),
            )
    }

    /// Same loop settings for both workers.
    pub fn settings(self, settings: LoopSettings) -> Self {
        self.worker_settings(WorkerKind::Acquisition, settings.clone())
            .worker_settings(WorkerKind::Reconstruction, settings)
    }

    pub fn worker_settings(mut self, kind: WorkerKind, settings: LoopSettings) -> Self {
        match kind {
            WorkerKind::Acquisition => self.acquisition_settings = settings,
            WorkerKind::Reconstruction => self.reconstruction_settings = settings,
        }
        self
    }

    pub fn acquisition(mut self, processor: Arc<dyn Processor>) -> Self {
        self.acquisition = Some(processor);
        self
    }

    pub fn reconstruction(mut self, processor: Arc<dyn Processor>) -> Self {
        self.reconstruction = Some(processor);
        self
    }

    pub fn expect_workers(mut self, workers: &[WorkerKind]) -> Self {
        self.expected_workers = workers.to_vec();
        self
    }

    pub fn build(self) -> Result<Console, BuildError> {
        let missing: Vec<&'static str> = self
            .expected_workers
            .iter()
            .filter(|kind| match kind {
                WorkerKind::Acquisition => self.acquisition.is_none(),
                WorkerKind::Reconstruction => self.reconstruction.is_none(),
            })
            .map(|kind| kind.name())
            .collect();
        if !missing.is_empty() {
            return Err(BuildError::MissingProcessors(missing));
        }

        let clock: Arc<dyn Clock> = self.clock.unwrap_or_else(|| Arc::new(SystemClock));
        let ids: Arc<dyn IdGenerator> = self
            .ids
            .unwrap_or_else(|| Arc::new(UlidGenerator::new(Arc::clone(&clock))));

        let scanner = |kind: WorkerKind, processor: Option<Arc<dyn Processor>>, settings: LoopSettings| {
            processor.map(|p| {
                Arc::new(ScannerLoop::new(
                    kind,
                    Arc::clone(&self.store),
                    p,
                    Arc::clone(&clock),
                    settings,
                ))
            })
        };
        let acquisition = scanner(
            WorkerKind::Acquisition,
            self.acquisition.clone(),
            self.acquisition_settings.clone(),
        );
        let reconstruction = scanner(
            WorkerKind::Reconstruction,
            self.reconstruction.clone(),
            self.reconstruction_settings.clone(),
        );

        Ok(Console {
            tasks: TaskStore::new(Arc::clone(&self.store), Arc::clone(&clock), ids),
            introspection: Introspection::new(Arc::clone(&self.store)),
            cleanup: Cleanup::new(Arc::clone(&self.store)),
            acquisition,
            reconstruction,
            store: self.store,
        })
    }
}

/// The assembled console: operator services plus the configured workers.
pub struct Console {
    pub tasks: TaskStore,
    pub introspection: Introspection,
    pub cleanup: Cleanup,
    acquisition: Option<Arc<ScannerLoop>>,
    reconstruction: Option<Arc<ScannerLoop>>,
    store: Arc<dyn StageStore>,
}

impl Console {
    pub fn store(&self) -> &Arc<dyn StageStore> {
        &self.store
    }

    pub fn scanner(&self, kind: WorkerKind) -> Option<Arc<ScannerLoop>> {
        match kind {
            WorkerKind::Acquisition => self.acquisition.clone(),
            WorkerKind::Reconstruction => self.reconstruction.clone(),
        }
    }

    /// Spawn every worker that has a collaborator.
    pub fn spawn_workers(&self) -> WorkerGroup {
        WorkerGroup::spawn(
            [WorkerKind::Acquisition, WorkerKind::Reconstruction]
                .into_iter()
                .filter_map(|kind| self.scanner(kind)),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::impls::InMemoryStageStore;
    use crate::testing::ScriptedProcessor;

    fn store() -> Arc<dyn StageStore> {
        Arc::new(InMemoryStageStore::new())
    }

    #[test]
    fn build_success() {
        let console = ConsoleBuilder::new(store())
            .acquisition(ScriptedProcessor::ok())
            .reconstruction(ScriptedProcessor::ok())
            .expect_workers(&[WorkerKind::Acquisition, WorkerKind::Reconstruction])
            .build()
            .unwrap();
        assert!(console.scanner(WorkerKind::Acquisition).is_some());
        assert!(console.scanner(WorkerKind::Reconstruction).is_some());
    }

    #[test]
    fn build_missing_processor() {
        let result = ConsoleBuilder::new(store())
            .acquisition(ScriptedProcessor::ok())
            .expect_workers(&[WorkerKind::Acquisition, WorkerKind::Reconstruction])
            .build();
        assert!(matches!(
            result,
            Err(BuildError::MissingProcessors(missing)) if missing == vec!["reconstruction"]
        ));
    }

    #[tokio::test]
    async fn from_config_roots_store_at_data_root() {
        let dir = tempfile::tempdir().unwrap();
        let config = ConsoleConfig {
            data_root: dir.path().to_path_buf(),
            ..ConsoleConfig::default()
        };
        let console = ConsoleBuilder::from_config(&config).build().unwrap();

        console.store().ensure_layout().await.unwrap();
        assert!(dir.path().join("queue_acq").is_dir());
        assert!(dir.path().join("failure").is_dir());
    }

    #[test]
    fn build_without_workers_serves_operator_calls() {
        let console = ConsoleBuilder::new(store()).build().unwrap();
        assert!(console.scanner(WorkerKind::Acquisition).is_none());
        assert!(console.scanner(WorkerKind::Reconstruction).is_none());
    }
}
