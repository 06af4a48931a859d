//! ScannerLoop - the polling worker that claims, processes and advances tasks.
//!
//! # Tick
//! 1. finish a transition left over from an earlier I/O failure, if any
//! 2. select the smallest eligible folder in the input stage
//! 3. claim it by moving it into the active stage (`SourceMissing` = lost race)
//! 4. run the collaborator under the timeout (or skip it for bypass)
//! 5. advance to the next stage, or record the reason and move to failure
//!
//! One loop owns one active stage. Running two loops of the same kind against
//! one store is safe for claiming, but `prepare` must only run while no other
//! loop of that kind is alive.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, watch};
use tracing::{debug, error, info, warn};

use crate::app::backoff::RetryPolicy;
use crate::domain::{
    FolderName, LoopError, ProcessingError, ReconMode, Stage, StoreError, TaskRecord,
};
use crate::ports::{Clock, PREPARED_MARKER, Processor, StageStore};

/// Which worker a loop runs as. Fixes its stages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WorkerKind {
    Acquisition,
    Reconstruction,
}

impl WorkerKind {
    pub fn name(self) -> &'static str {
        match self {
            WorkerKind::Acquisition => "acquisition",
            WorkerKind::Reconstruction => "reconstruction",
        }
    }

    pub fn input(self) -> Stage {
        match self {
            WorkerKind::Acquisition => Stage::AcqQueue,
            WorkerKind::Reconstruction => Stage::ReconQueue,
        }
    }

    pub fn active(self) -> Stage {
        match self {
            WorkerKind::Acquisition => Stage::Acq,
            WorkerKind::Reconstruction => Stage::Recon,
        }
    }

    pub fn next(self) -> Stage {
        match self {
            WorkerKind::Acquisition => Stage::ReconQueue,
            WorkerKind::Reconstruction => Stage::Complete,
        }
    }

    pub fn failure(self) -> Stage {
        Stage::Failure
    }

    /// Only scheduled tasks are eligible for acquisition.
    fn requires_marker(self) -> bool {
        self == WorkerKind::Acquisition
    }

    fn bypasses(self, record: &TaskRecord) -> bool {
        self == WorkerKind::Reconstruction && record.processing.mode == ReconMode::Bypass
    }
}

#[derive(Debug, Clone)]
pub struct LoopSettings {
    pub poll_interval: Duration,
    /// `None` lets the collaborator run for as long as it likes.
    pub timeout: Option<Duration>,
    pub backoff: RetryPolicy,
}

impl Default for LoopSettings {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(100),
            timeout: Some(Duration::from_secs(30 * 60)),
            backoff: RetryPolicy::default(),
        }
    }
}

/// What one tick did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TickOutcome {
    Idle,
    /// Another loop moved the candidate first.
    LostRace { folder: FolderName },
    Advanced {
        folder: FolderName,
        to: Stage,
        bypassed: bool,
    },
    Failed { folder: FolderName, reason: String },
    /// The claimed record is unreadable; the folder stays in the active stage.
    LeftInPlace { folder: FolderName },
    /// The claimed folder disappeared from the active stage before it could be advanced.
    Vanished { folder: FolderName },
}

/// Result of startup recovery.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RecoveryReport {
    pub requeued: Vec<FolderName>,
    /// Processed before the interruption; moved on to the next stage.
    pub forwarded: Vec<FolderName>,
    pub failed: Vec<FolderName>,
}

impl RecoveryReport {
    pub fn is_empty(&self) -> bool {
        self.requeued.is_empty() && self.forwarded.is_empty() && self.failed.is_empty()
    }
}

/// A transition that must still happen for a task already processed.
#[derive(Debug, Clone)]
enum Pending {
    Advance {
        folder: FolderName,
        to: Stage,
        outcome: TickOutcome,
    },
    Fail { folder: FolderName, reason: String },
}

pub struct ScannerLoop {
    kind: WorkerKind,
    store: Arc<dyn StageStore>,
    processor: Arc<dyn Processor>,
    clock: Arc<dyn Clock>,
    settings: LoopSettings,
    pending: Mutex<Option<Pending>>,
}

impl ScannerLoop {
    pub fn new(
        kind: WorkerKind,
        store: Arc<dyn StageStore>,
        processor: Arc<dyn Processor>,
        clock: Arc<dyn Clock>,
        settings: LoopSettings,
    ) -> Self {
        Self {
            kind,
            store,
            processor,
            clock,
            settings,
            pending: Mutex::new(None),
        }
    }

    pub fn kind(&self) -> WorkerKind {
        self.kind
    }

    /// Settle every task stranded in the active stage.
    ///
    /// A task whose collaborator already answered completes the transition it
    /// was making: to failure when it carries a failure from this stage, to
    /// the next stage when its processing finished. Every other task returns
    /// to the input stage.
    ///
    /// Must run once before `run`, while no other loop of this kind is alive.
    pub async fn prepare(&self) -> Result<RecoveryReport, StoreError> {
        self.store.ensure_layout().await?;
        *self.pending.lock().await = None;

        let worker = self.kind.name();
        let active = self.kind.active();
        let input = self.kind.input();
        let mut report = RecoveryReport::default();

        for folder in self.store.list(active).await? {
            let record = match self.store.read_record(active, &folder).await {
                Ok(record) => Some(record),
                Err(e) => {
                    warn!(worker, folder = %folder, error = %e, "stranded task has unreadable record");
                    None
                }
            };

            if let Some(to) = record.as_ref().and_then(|r| self.settled_stage(r)) {
                match self.store.move_task(&folder, active, to).await {
                    Ok(()) => {
                        info!(worker, folder = %folder, to = %to, "finished interrupted transition");
                        if to == self.kind.failure() {
                            report.failed.push(folder);
                        } else {
                            report.forwarded.push(folder);
                        }
                    }
                    Err(StoreError::SourceMissing { .. }) => {
                        debug!(worker, folder = %folder, "stranded task already gone");
                    }
                    Err(e) => return Err(e),
                }
                continue;
            }

            if let Some(mut record) = record {
                record.recoveries = record.recoveries.saturating_add(1);
                if let Err(e) = self.store.write_record(active, &folder, &record).await {
                    warn!(worker, folder = %folder, error = %e, "could not count recovery");
                }
            }

            match self.store.move_task(&folder, active, input).await {
                Ok(()) => {
                    info!(worker, folder = %folder, to = %input, "requeued stranded task");
                    report.requeued.push(folder);
                }
                Err(StoreError::SourceMissing { .. }) => {
                    debug!(worker, folder = %folder, "stranded task already gone");
                }
                Err(StoreError::DestConflict { .. }) => {
                    error!(
                        worker,
                        folder = %folder,
                        "stranded task also present in {input}; moving it to failure"
                    );
                    let reason = format!("recovered from {active} but {input} already holds the folder");
                    match self.fail_claimed(&folder, &reason).await? {
                        TickOutcome::Failed { .. } => report.failed.push(folder),
                        outcome => {
                            warn!(worker, folder = %folder, ?outcome, "conflicting stranded task was not failed");
                        }
                    }
                }
                Err(e) => return Err(e),
            }
        }
        Ok(report)
    }

    /// Run ticks until `shutdown` flips to `true` or a fatal store error occurs.
    ///
    /// Shutdown is only observed between ticks and during the idle sleep; a
    /// collaborator call in flight always completes first. A transition still
    /// pending after an I/O failure gets one more attempt before returning.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Result<(), LoopError> {
        let worker = self.kind.name();
        info!(worker, input = %self.kind.input(), "scanner loop started");
        let mut failures: u32 = 0;

        loop {
            if *shutdown.borrow() {
                break;
            }

            let wait = match self.tick().await {
                Ok(TickOutcome::Idle) => {
                    failures = 0;
                    Some(self.settings.poll_interval)
                }
                Ok(_) => {
                    failures = 0;
                    None
                }
                Err(e) if e.is_fatal() => {
                    error!(worker, error = %e, "scanner loop halted");
                    return Err(LoopError::Halted { worker, source: e });
                }
                Err(e) => {
                    failures = failures.saturating_add(1);
                    let delay = self.settings.backoff.next_delay(failures);
                    warn!(worker, error = %e, failures, delay_ms = delay.as_millis() as u64, "tick failed; backing off");
                    Some(delay)
                }
            };

            if let Some(delay) = wait {
                tokio::select! {
                    changed = shutdown.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                    _ = tokio::time::sleep(delay) => {}
                }
            }
        }

        self.flush_pending().await;
        info!(worker, "scanner loop stopped");
        Ok(())
    }

    /// One pass of select, claim, process, advance.
    pub async fn tick(&self) -> Result<TickOutcome, StoreError> {
        let leftover = self.pending.lock().await.take();
        if let Some(step) = leftover {
            debug!(worker = self.kind.name(), "retrying unfinished transition");
            return self.finish(step).await;
        }

        let Some(folder) = self.select().await? else {
            return Ok(TickOutcome::Idle);
        };

        match self
            .store
            .move_task(&folder, self.kind.input(), self.kind.active())
            .await
        {
            Ok(()) => {}
            Err(e) if e.is_transient() => {
                debug!(worker = self.kind.name(), folder = %folder, "lost claim race");
                return Ok(TickOutcome::LostRace { folder });
            }
            Err(e) => return Err(e),
        }
        debug!(worker = self.kind.name(), folder = %folder, "task claimed");

        self.process_claimed(folder).await
    }

    /// Record `reason` on a claimed task and move it to the failure stage.
    ///
    /// Calling this again for a task that already reached the failure stage
    /// is a no-op with the same outcome.
    pub async fn fail_claimed(
        &self,
        folder: &FolderName,
        reason: &str,
    ) -> Result<TickOutcome, StoreError> {
        let active = self.kind.active();
        let failure = self.kind.failure();
        let outcome = TickOutcome::Failed {
            folder: folder.clone(),
            reason: reason.to_string(),
        };

        if !self.store.contains(active, folder).await?
            && self.store.contains(failure, folder).await?
        {
            return Ok(outcome);
        }

        let mut record = match self.store.read_record(active, folder).await {
            Ok(record) => record,
            Err(e @ StoreError::Corrupt { .. }) => {
                error!(
                    worker = self.kind.name(),
                    folder = %folder,
                    error = %e,
                    reason = %reason,
                    "cannot record failure on a corrupt record; leaving it in {active}"
                );
                return Ok(TickOutcome::LeftInPlace {
                    folder: folder.clone(),
                });
            }
            Err(StoreError::NotFound { .. }) => {
                warn!(worker = self.kind.name(), folder = %folder, "claimed task vanished before it could be failed");
                return Ok(TickOutcome::Vanished {
                    folder: folder.clone(),
                });
            }
            Err(e) => return Err(e),
        };
        record.mark_failed(active, reason, self.clock.now());
        self.store.write_record(active, folder, &record).await?;

        self.advance(folder, failure, outcome).await
    }

    /// Where a stranded task belongs once its collaborator has answered.
    fn settled_stage(&self, record: &TaskRecord) -> Option<Stage> {
        let active = self.kind.active();
        if record.failure.as_ref().is_some_and(|f| f.stage == active) {
            Some(self.kind.failure())
        } else if record.finished_at(active).is_some() {
            Some(self.kind.next())
        } else {
            None
        }
    }

    async fn select(&self) -> Result<Option<FolderName>, StoreError> {
        let input = self.kind.input();
        for folder in self.store.list(input).await? {
            if !self.kind.requires_marker()
                || self.store.has_marker(input, &folder, PREPARED_MARKER).await?
            {
                return Ok(Some(folder));
            }
        }
        Ok(None)
    }

    async fn process_claimed(&self, folder: FolderName) -> Result<TickOutcome, StoreError> {
        let worker = self.kind.name();
        let active = self.kind.active();

        let mut record = match self.store.read_record(active, &folder).await {
            Ok(record) => record,
            Err(e @ StoreError::Corrupt { .. }) => {
                error!(worker, folder = %folder, error = %e, "claimed task has a corrupt record; leaving it in {active}");
                return Ok(TickOutcome::LeftInPlace { folder });
            }
            Err(StoreError::NotFound { .. }) => {
                warn!(worker, folder = %folder, "claimed task vanished before processing");
                return Ok(TickOutcome::Vanished { folder });
            }
            Err(e) => {
                self.release(&folder).await;
                return Err(e);
            }
        };

        if self.kind.bypasses(&record) {
            info!(worker, folder = %folder, "bypass mode; skipping collaborator");
            let to = self.kind.next();
            let outcome = TickOutcome::Advanced {
                folder: folder.clone(),
                to,
                bypassed: true,
            };
            return self.finish(Pending::Advance { folder, to, outcome }).await;
        }

        record.mark_started(active, self.clock.now());
        if let Err(e) = self.store.write_record(active, &folder, &record).await {
            warn!(worker, folder = %folder, error = %e, "could not stamp start time");
        }

        let path = self.store.task_path(active, &folder);
        info!(worker, folder = %folder, collaborator = self.processor.name(), "processing task");

        match self.invoke(&path, &record).await {
            Ok(()) => {
                record.mark_finished(active, self.clock.now());
                if let Err(e) = self.store.write_record(active, &folder, &record).await {
                    warn!(worker, folder = %folder, error = %e, "could not stamp finish time");
                }
                let to = self.kind.next();
                let outcome = TickOutcome::Advanced {
                    folder: folder.clone(),
                    to,
                    bypassed: false,
                };
                self.finish(Pending::Advance { folder, to, outcome }).await
            }
            Err(e) => {
                warn!(worker, folder = %folder, reason = %e.reason, "processing failed");
                self.finish(Pending::Fail {
                    folder,
                    reason: e.reason,
                })
                .await
            }
        }
    }

    async fn invoke(&self, path: &Path, record: &TaskRecord) -> Result<(), ProcessingError> {
        let call = self.processor.process(path, record);
        match self.settings.timeout {
            Some(limit) => match tokio::time::timeout(limit, call).await {
                Ok(result) => result,
                Err(_) => Err(ProcessingError::new(format!("timed out after {limit:?}"))),
            },
            None => call.await,
        }
    }

    /// Perform a post-processing transition, remembering it if storage failed.
    async fn finish(&self, step: Pending) -> Result<TickOutcome, StoreError> {
        let result = match &step {
            Pending::Advance {
                folder,
                to,
                outcome,
            } => self.advance(folder, *to, outcome.clone()).await,
            Pending::Fail { folder, reason } => self.fail_claimed(folder, reason).await,
        };
        if let Err(e) = &result
            && e.is_io()
        {
            *self.pending.lock().await = Some(step);
        }
        result
    }

    /// One last try at a leftover transition before the loop stops.
    async fn flush_pending(&self) {
        let leftover = self.pending.lock().await.take();
        let Some(step) = leftover else {
            return;
        };
        let worker = self.kind.name();
        match self.finish(step).await {
            Ok(outcome) => info!(worker, ?outcome, "finished pending transition before stopping"),
            Err(e) => {
                warn!(worker, error = %e, "pending transition still failing; startup recovery will settle it");
            }
        }
    }

    async fn advance(
        &self,
        folder: &FolderName,
        to: Stage,
        outcome: TickOutcome,
    ) -> Result<TickOutcome, StoreError> {
        match self.store.move_task(folder, self.kind.active(), to).await {
            Ok(()) => {
                info!(worker = self.kind.name(), folder = %folder, to = %to, "task advanced");
                Ok(outcome)
            }
            Err(StoreError::SourceMissing { .. }) => {
                if self.store.contains(to, folder).await? {
                    return Ok(outcome);
                }
                warn!(worker = self.kind.name(), folder = %folder, "claimed task vanished before it could advance");
                Ok(TickOutcome::Vanished {
                    folder: folder.clone(),
                })
            }
            Err(e) => Err(e),
        }
    }

    /// Best-effort return of a claimed but unprocessed task to the input stage.
    async fn release(&self, folder: &FolderName) {
        if let Err(e) = self
            .store
            .move_task(folder, self.kind.active(), self.kind.input())
            .await
        {
            warn!(worker = self.kind.name(), folder = %folder, error = %e, "could not release claimed task; startup recovery will requeue it");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::TaskStore;
    use crate::domain::TaskState;
    use crate::impls::InMemoryStageStore;
    use crate::ports::SystemClock;
    use crate::impls::RECORD_FILE;
    use crate::testing::{
        FaultyStore, ScriptedProcessor, fs_store, inmem_task_store, spec, wait_for_stage,
    };
    use async_trait::async_trait;
    use std::collections::BTreeSet;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Fails its first call after scribbling over the task record.
    struct Scribbler {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl Processor for Scribbler {
        fn name(&self) -> &str {
            "scribbler"
        }

        async fn process(&self, task_path: &Path, _record: &TaskRecord) -> Result<(), ProcessingError> {
            if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
                std::fs::write(task_path.join(RECORD_FILE), b"{ half").unwrap();
                return Err(ProcessingError::new("device timeout"));
            }
            Ok(())
        }
    }

    fn settings() -> LoopSettings {
        LoopSettings {
            poll_interval: Duration::from_millis(5),
            timeout: None,
            backoff: RetryPolicy {
                base_delay: Duration::from_millis(5),
                multiplier: 2.0,
                max_delay: Duration::from_millis(50),
            },
        }
    }

    fn scanner(
        kind: WorkerKind,
        store: Arc<dyn StageStore>,
        processor: Arc<ScriptedProcessor>,
    ) -> ScannerLoop {
        ScannerLoop::new(kind, store, processor, Arc::new(SystemClock), settings())
    }

    async fn scheduled(tasks: &TaskStore, counter: i64) -> FolderName {
        let folder = tasks.create(spec("se_1d", counter)).await.unwrap();
        tasks.schedule(&folder).await.unwrap();
        folder
    }

    #[tokio::test]
    async fn idle_when_input_is_empty() {
        let (store, _tasks) = inmem_task_store();
        let worker = scanner(WorkerKind::Acquisition, store, ScriptedProcessor::ok());
        assert_eq!(worker.tick().await.unwrap(), TickOutcome::Idle);
    }

    #[tokio::test]
    async fn acquisition_skips_unscheduled_tasks() {
        let (store, tasks) = inmem_task_store();
        tasks.create(spec("se", 1)).await.unwrap();
        let processor = ScriptedProcessor::ok();
        let worker = scanner(WorkerKind::Acquisition, store, processor.clone());

        assert_eq!(worker.tick().await.unwrap(), TickOutcome::Idle);
        assert_eq!(processor.calls(), 0);
    }

    #[tokio::test]
    async fn acquisition_success_moves_task_to_recon_queue() {
        let (store, tasks) = inmem_task_store();
        let folder = scheduled(&tasks, 1).await;
        let processor = ScriptedProcessor::ok();
        let worker = scanner(WorkerKind::Acquisition, store.clone(), processor.clone());

        let outcome = worker.tick().await.unwrap();

        assert_eq!(
            outcome,
            TickOutcome::Advanced {
                folder: folder.clone(),
                to: Stage::ReconQueue,
                bypassed: false
            }
        );
        assert_eq!(processor.calls(), 1);
        assert!(!store.contains(Stage::Acq, &folder).await.unwrap());
        assert_eq!(tasks.state_of(&folder).await.unwrap(), TaskState::ScheduledRecon);
        let record = tasks.read(Stage::ReconQueue, &folder).await.unwrap();
        assert!(record.timestamps.acq_started_at.is_some());
        assert!(record.timestamps.acq_finished_at.is_some());
    }

    #[tokio::test]
    async fn processing_error_lands_in_failure_with_reason() {
        let (store, tasks) = inmem_task_store();
        let folder = scheduled(&tasks, 1).await;
        let worker = scanner(
            WorkerKind::Acquisition,
            store.clone(),
            ScriptedProcessor::failing("device timeout"),
        );

        let outcome = worker.tick().await.unwrap();

        assert_eq!(
            outcome,
            TickOutcome::Failed {
                folder: folder.clone(),
                reason: "device timeout".to_string()
            }
        );
        assert_eq!(tasks.locate(&folder).await.unwrap(), Some(Stage::Failure));
        let record = tasks.read(Stage::Failure, &folder).await.unwrap();
        let failure = record.failure.unwrap();
        assert_eq!(failure.reason, "device timeout");
        assert_eq!(failure.stage, Stage::Acq);
    }

    #[tokio::test]
    async fn bypass_skips_the_collaborator() {
        let (store, tasks) = inmem_task_store();
        let folder = tasks
            .create(spec("se", 1).with_mode(ReconMode::Bypass))
            .await
            .unwrap();
        store
            .move_task(&folder, Stage::AcqQueue, Stage::ReconQueue)
            .await
            .unwrap();
        let processor = ScriptedProcessor::ok();
        let worker = scanner(WorkerKind::Reconstruction, store.clone(), processor.clone());

        let outcome = worker.tick().await.unwrap();

        assert_eq!(
            outcome,
            TickOutcome::Advanced {
                folder: folder.clone(),
                to: Stage::Complete,
                bypassed: true
            }
        );
        assert_eq!(processor.calls(), 0);
        assert_eq!(tasks.locate(&folder).await.unwrap(), Some(Stage::Complete));
    }

    #[tokio::test]
    async fn full_reconstruction_completes() {
        let (store, tasks) = inmem_task_store();
        let folder = tasks.create(spec("se", 1)).await.unwrap();
        store
            .move_task(&folder, Stage::AcqQueue, Stage::ReconQueue)
            .await
            .unwrap();
        let processor = ScriptedProcessor::ok();
        let worker = scanner(WorkerKind::Reconstruction, store.clone(), processor.clone());

        worker.tick().await.unwrap();

        assert_eq!(processor.calls(), 1);
        assert_eq!(tasks.state_of(&folder).await.unwrap(), TaskState::Complete);
        let record = tasks.read(Stage::Complete, &folder).await.unwrap();
        assert!(record.timestamps.recon_finished_at.is_some());
    }

    #[tokio::test]
    async fn ticks_pick_smallest_folder_first() {
        let (store, tasks) = inmem_task_store();
        let mut folders = Vec::new();
        for counter in 0..3 {
            folders.push(scheduled(&tasks, counter).await);
        }
        folders.sort();
        let worker = scanner(WorkerKind::Acquisition, store, ScriptedProcessor::ok());

        for expected in folders {
            match worker.tick().await.unwrap() {
                TickOutcome::Advanced { folder, .. } => assert_eq!(folder, expected),
                other => panic!("unexpected outcome {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn failure_transition_is_idempotent() {
        let (store, tasks) = inmem_task_store();
        let folder = scheduled(&tasks, 1).await;
        store
            .move_task(&folder, Stage::AcqQueue, Stage::Acq)
            .await
            .unwrap();
        let worker = scanner(WorkerKind::Acquisition, store.clone(), ScriptedProcessor::ok());

        let first = worker.fail_claimed(&folder, "coil unplugged").await.unwrap();
        let second = worker.fail_claimed(&folder, "coil unplugged").await.unwrap();

        assert_eq!(first, second);
        let holders: Vec<Stage> = {
            let mut v = Vec::new();
            for stage in Stage::ALL {
                if store.contains(stage, &folder).await.unwrap() {
                    v.push(stage);
                }
            }
            v
        };
        assert_eq!(holders, vec![Stage::Failure]);
    }

    #[tokio::test]
    async fn prepare_requeues_stranded_tasks() {
        let (store, tasks) = inmem_task_store();
        let folder = scheduled(&tasks, 1).await;
        store
            .move_task(&folder, Stage::AcqQueue, Stage::Acq)
            .await
            .unwrap();
        let worker = scanner(WorkerKind::Acquisition, store.clone(), ScriptedProcessor::ok());

        let report = worker.prepare().await.unwrap();

        assert_eq!(report.requeued, vec![folder.clone()]);
        assert!(report.failed.is_empty());
        assert_eq!(tasks.state_of(&folder).await.unwrap(), TaskState::ScheduledAcq);
        let record = tasks.read(Stage::AcqQueue, &folder).await.unwrap();
        assert_eq!(record.recoveries, 1);
    }

    #[tokio::test]
    async fn prepare_fails_task_that_conflicts_with_its_queue() {
        let (store, tasks) = inmem_task_store();
        let folder = tasks.create(spec("se", 1)).await.unwrap();
        let record = tasks.read(Stage::AcqQueue, &folder).await.unwrap();
        store.move_task(&folder, Stage::AcqQueue, Stage::ReconQueue).await.unwrap();
        store.insert(Stage::Recon, &record).await.unwrap();
        let worker = scanner(WorkerKind::Reconstruction, store.clone(), ScriptedProcessor::ok());

        let report = worker.prepare().await.unwrap();

        assert_eq!(report.failed, vec![folder.clone()]);
        assert!(store.contains(Stage::Failure, &folder).await.unwrap());
        assert!(!store.contains(Stage::Recon, &folder).await.unwrap());
        assert!(store.contains(Stage::ReconQueue, &folder).await.unwrap());
    }

    #[tokio::test]
    async fn corrupt_record_is_left_in_place() {
        let store = Arc::new(InMemoryStageStore::new());
        let folder = FolderName::parse("scan-01broken").unwrap();
        store.insert_raw(Stage::ReconQueue, folder.clone(), "{").await;
        let processor = ScriptedProcessor::ok();
        let worker = scanner(WorkerKind::Reconstruction, store.clone(), processor.clone());

        let outcome = worker.tick().await.unwrap();

        assert_eq!(outcome, TickOutcome::LeftInPlace { folder: folder.clone() });
        assert!(store.contains(Stage::Recon, &folder).await.unwrap());
        assert_eq!(processor.calls(), 0);
    }

    #[tokio::test]
    async fn claim_conflict_halts_the_loop() {
        let (store, tasks) = inmem_task_store();
        let folder = scheduled(&tasks, 1).await;
        let record = tasks.read(Stage::AcqQueue, &folder).await.unwrap();
        store.insert(Stage::Acq, &record).await.unwrap();
        let worker = scanner(WorkerKind::Acquisition, store.clone(), ScriptedProcessor::ok());
        let (_tx, rx) = watch::channel(false);

        let err = worker.run(rx).await.unwrap_err();

        match err {
            LoopError::Halted { worker, source } => {
                assert_eq!(worker, "acquisition");
                assert!(matches!(source, StoreError::DestConflict { to: Stage::Acq, .. }));
            }
            other => panic!("unexpected error {other:?}"),
        }
        assert!(store.contains(Stage::AcqQueue, &folder).await.unwrap());
    }

    #[tokio::test]
    async fn hung_collaborator_times_out() {
        let (store, tasks) = inmem_task_store();
        let folder = scheduled(&tasks, 1).await;
        let processor = ScriptedProcessor::ok().with_delay(Duration::from_secs(5));
        let worker = ScannerLoop::new(
            WorkerKind::Acquisition,
            store.clone(),
            processor,
            Arc::new(SystemClock),
            LoopSettings {
                timeout: Some(Duration::from_millis(20)),
                ..settings()
            },
        );

        match worker.tick().await.unwrap() {
            TickOutcome::Failed { reason, .. } => assert!(reason.starts_with("timed out after")),
            other => panic!("unexpected outcome {other:?}"),
        }
        assert_eq!(tasks.locate(&folder).await.unwrap(), Some(Stage::Failure));
    }

    #[tokio::test]
    async fn run_exits_immediately_when_already_cancelled() {
        let (store, tasks) = inmem_task_store();
        scheduled(&tasks, 1).await;
        let processor = ScriptedProcessor::ok();
        let worker = scanner(WorkerKind::Acquisition, store, processor.clone());
        let (tx, rx) = watch::channel(false);
        tx.send(true).unwrap();

        worker.run(rx).await.unwrap();
        assert_eq!(processor.calls(), 0);
    }

    #[tokio::test]
    async fn shutdown_lets_in_flight_task_finish() {
        let (store, tasks) = inmem_task_store();
        let folder = scheduled(&tasks, 1).await;
        let processor = ScriptedProcessor::ok().with_delay(Duration::from_millis(300));
        let worker = Arc::new(scanner(WorkerKind::Acquisition, store.clone(), processor.clone()));
        let (tx, rx) = watch::channel(false);

        let handle = tokio::spawn({
            let worker = Arc::clone(&worker);
            async move { worker.run(rx).await }
        });
        processor.started().await;
        tx.send(true).unwrap();
        handle.await.unwrap().unwrap();

        assert_eq!(processor.calls(), 1);
        assert_eq!(tasks.locate(&folder).await.unwrap(), Some(Stage::ReconQueue));
    }

    #[tokio::test]
    async fn pending_advance_completes_on_next_tick() {
        let (store, tasks) = inmem_task_store();
        let folder = scheduled(&tasks, 1).await;
        let faulty = FaultyStore::new(store.clone());
        faulty.fail_moves_into(Stage::ReconQueue, 1).await;
        let processor = ScriptedProcessor::ok();
        let worker = scanner(WorkerKind::Acquisition, faulty.clone(), processor.clone());

        assert!(worker.tick().await.unwrap_err().is_io());
        assert_eq!(tasks.locate(&folder).await.unwrap(), Some(Stage::Acq));

        assert_eq!(
            worker.tick().await.unwrap(),
            TickOutcome::Advanced {
                folder: folder.clone(),
                to: Stage::ReconQueue,
                bypassed: false
            }
        );
        assert_eq!(processor.calls(), 1);
        assert_eq!(worker.tick().await.unwrap(), TickOutcome::Idle);
    }

    #[tokio::test]
    async fn pending_failure_is_retried_without_reprocessing() {
        let (store, tasks) = inmem_task_store();
        let folder = scheduled(&tasks, 1).await;
        let faulty = FaultyStore::new(store.clone());
        faulty.fail_moves_into(Stage::Failure, 1).await;
        let processor = ScriptedProcessor::failing("device timeout");
        let worker = scanner(WorkerKind::Acquisition, faulty.clone(), processor.clone());

        assert!(worker.tick().await.unwrap_err().is_io());
        let outcome = worker.tick().await.unwrap();

        assert_eq!(
            outcome,
            TickOutcome::Failed {
                folder: folder.clone(),
                reason: "device timeout".to_string()
            }
        );
        assert_eq!(processor.calls(), 1);
        assert_eq!(tasks.locate(&folder).await.unwrap(), Some(Stage::Failure));
    }

    #[tokio::test]
    async fn run_backs_off_after_io_errors_and_recovers() {
        let (store, tasks) = inmem_task_store();
        let folder = scheduled(&tasks, 1).await;
        let faulty = FaultyStore::new(store.clone());
        faulty.fail_moves_into(Stage::ReconQueue, 3).await;
        let processor = ScriptedProcessor::ok();
        let worker = Arc::new(scanner(WorkerKind::Acquisition, faulty.clone(), processor.clone()));
        let (tx, rx) = watch::channel(false);

        let handle = tokio::spawn({
            let worker = Arc::clone(&worker);
            async move { worker.run(rx).await }
        });
        wait_for_stage(&*store, &folder, Stage::ReconQueue).await;
        tx.send(true).unwrap();
        handle.await.unwrap().unwrap();

        assert_eq!(processor.calls(), 1);
    }

    #[tokio::test]
    async fn shutdown_during_backoff_still_settles_failed_task() {
        let (store, tasks) = inmem_task_store();
        let folder = scheduled(&tasks, 1).await;
        let faulty = FaultyStore::new(store.clone());
        faulty.fail_moves_into(Stage::Failure, 1).await;
        let processor = ScriptedProcessor::failing("device timeout");
        let worker = Arc::new(ScannerLoop::new(
            WorkerKind::Acquisition,
            faulty.clone(),
            processor.clone(),
            Arc::new(SystemClock),
            LoopSettings {
                backoff: RetryPolicy {
                    base_delay: Duration::from_secs(60),
                    multiplier: 1.0,
                    max_delay: Duration::from_secs(60),
                },
                ..settings()
            },
        ));
        let (tx, rx) = watch::channel(false);

        let handle = tokio::spawn({
            let worker = Arc::clone(&worker);
            async move { worker.run(rx).await }
        });
        processor.started().await;
        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap()
            .unwrap();

        assert_eq!(processor.calls(), 1);
        assert_eq!(tasks.locate(&folder).await.unwrap(), Some(Stage::Failure));
    }

    #[tokio::test]
    async fn prepare_fails_stranded_task_that_already_failed() {
        let (store, tasks) = inmem_task_store();
        let folder = scheduled(&tasks, 1).await;
        let faulty = FaultyStore::new(store.clone());
        faulty.fail_moves_into(Stage::Failure, 1).await;
        let processor = ScriptedProcessor::failing("device timeout");
        let first = scanner(WorkerKind::Acquisition, faulty.clone(), processor.clone());
        assert!(first.tick().await.unwrap_err().is_io());
        drop(first);

        let restarted = scanner(WorkerKind::Acquisition, store.clone(), processor.clone());
        let report = restarted.prepare().await.unwrap();

        assert_eq!(report.failed, vec![folder.clone()]);
        assert!(report.requeued.is_empty());
        let record = tasks.read(Stage::Failure, &folder).await.unwrap();
        assert_eq!(record.failure.unwrap().reason, "device timeout");
        assert_eq!(record.recoveries, 0);
        assert_eq!(restarted.tick().await.unwrap(), TickOutcome::Idle);
        assert_eq!(processor.calls(), 1);
    }

    #[tokio::test]
    async fn prepare_forwards_stranded_task_that_already_finished() {
        let (store, tasks) = inmem_task_store();
        let folder = scheduled(&tasks, 1).await;
        let faulty = FaultyStore::new(store.clone());
        faulty.fail_moves_into(Stage::ReconQueue, 1).await;
        let processor = ScriptedProcessor::ok();
        let first = scanner(WorkerKind::Acquisition, faulty.clone(), processor.clone());
        assert!(first.tick().await.unwrap_err().is_io());
        drop(first);

        let restarted = scanner(WorkerKind::Acquisition, store.clone(), processor.clone());
        let report = restarted.prepare().await.unwrap();

        assert_eq!(report.forwarded, vec![folder.clone()]);
        assert!(report.requeued.is_empty());
        assert_eq!(tasks.state_of(&folder).await.unwrap(), TaskState::ScheduledRecon);
        assert_eq!(restarted.tick().await.unwrap(), TickOutcome::Idle);
        assert_eq!(processor.calls(), 1);
    }

    #[tokio::test]
    async fn read_failure_after_claim_releases_the_task() {
        let (store, tasks) = inmem_task_store();
        let folder = scheduled(&tasks, 1).await;
        let faulty = FaultyStore::new(store.clone());
        faulty.fail_reads(1);
        let processor = ScriptedProcessor::ok();
        let worker = scanner(WorkerKind::Acquisition, faulty.clone(), processor.clone());

        assert!(worker.tick().await.unwrap_err().is_io());
        assert_eq!(tasks.state_of(&folder).await.unwrap(), TaskState::ScheduledAcq);
        assert_eq!(processor.calls(), 0);

        assert!(matches!(worker.tick().await.unwrap(), TickOutcome::Advanced { .. }));
        assert_eq!(processor.calls(), 1);
    }

    #[tokio::test]
    async fn failing_a_corrupt_record_leaves_it_in_place() {
        let store = Arc::new(InMemoryStageStore::new());
        let folder = FolderName::parse("scan-01half").unwrap();
        store.insert_raw(Stage::Acq, folder.clone(), "{ half").await;
        let worker = scanner(WorkerKind::Acquisition, store.clone(), ScriptedProcessor::ok());

        let outcome = worker.fail_claimed(&folder, "device timeout").await.unwrap();

        assert_eq!(outcome, TickOutcome::LeftInPlace { folder: folder.clone() });
        assert!(store.contains(Stage::Acq, &folder).await.unwrap());
    }

    #[tokio::test]
    async fn corrupt_record_after_failure_does_not_halt_the_worker() {
        let (_tmp, fs) = fs_store().await;
        let store: Arc<dyn StageStore> = Arc::new(fs);
        let tasks = TaskStore::new(
            Arc::clone(&store),
            Arc::new(SystemClock),
            Arc::new(crate::ports::UlidGenerator::new(SystemClock)),
        );
        scheduled(&tasks, 1).await;
        scheduled(&tasks, 2).await;
        let worker = Arc::new(ScannerLoop::new(
            WorkerKind::Acquisition,
            Arc::clone(&store),
            Arc::new(Scribbler {
                calls: AtomicUsize::new(0),
            }),
            Arc::new(SystemClock),
            settings(),
        ));
        let (tx, rx) = watch::channel(false);

        let handle = tokio::spawn({
            let worker = Arc::clone(&worker);
            async move { worker.run(rx).await }
        });
        tokio::time::timeout(Duration::from_secs(5), async {
            while store.list(Stage::ReconQueue).await.unwrap().is_empty() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        tx.send(true).unwrap();

        handle.await.unwrap().unwrap();
        assert_eq!(store.list(Stage::Acq).await.unwrap().len(), 1);
        assert_eq!(store.list(Stage::ReconQueue).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn claimed_folder_without_record_is_left_in_place() {
        let (_tmp, fs) = fs_store().await;
        let folder = FolderName::parse("scan-01norecord").unwrap();
        std::fs::create_dir(fs.task_path(Stage::ReconQueue, &folder)).unwrap();
        let store = Arc::new(fs);
        let processor = ScriptedProcessor::ok();
        let worker = scanner(WorkerKind::Reconstruction, store.clone(), processor.clone());

        assert_eq!(
            worker.tick().await.unwrap(),
            TickOutcome::LeftInPlace { folder: folder.clone() }
        );
        assert!(store.contains(Stage::Recon, &folder).await.unwrap());
        assert_eq!(processor.calls(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn racing_workers_claim_each_task_once() {
        let (_tmp, fs) = fs_store().await;
        let store: Arc<dyn StageStore> = Arc::new(fs);
        let tasks = TaskStore::new(
            Arc::clone(&store),
            Arc::new(SystemClock),
            Arc::new(crate::ports::UlidGenerator::new(SystemClock)),
        );
        let mut created = BTreeSet::new();
        for counter in 0..12 {
            created.insert(scheduled(&tasks, counter).await);
        }

        let processor = ScriptedProcessor::ok().with_delay(Duration::from_millis(2));
        let a = Arc::new(scanner(WorkerKind::Acquisition, Arc::clone(&store), processor.clone()));
        let b = Arc::new(scanner(WorkerKind::Acquisition, Arc::clone(&store), processor.clone()));

        let drain = |worker: Arc<ScannerLoop>| async move {
            let mut outcomes = Vec::new();
            loop {
                match worker.tick().await.unwrap() {
                    TickOutcome::Idle => break,
                    outcome => outcomes.push(outcome),
                }
            }
            outcomes
        };
        let (left, right) = tokio::join!(tokio::spawn(drain(a)), tokio::spawn(drain(b)));
        let outcomes: Vec<TickOutcome> = left.unwrap().into_iter().chain(right.unwrap()).collect();

        let advanced: Vec<&FolderName> = outcomes
            .iter()
            .filter_map(|o| match o {
                TickOutcome::Advanced { folder, .. } => Some(folder),
                _ => None,
            })
            .collect();
        assert_eq!(advanced.len(), created.len());
        assert_eq!(advanced.iter().copied().cloned().collect::<BTreeSet<_>>(), created);
        assert!(outcomes
            .iter()
            .all(|o| matches!(o, TickOutcome::Advanced { .. } | TickOutcome::LostRace { .. })));
        assert_eq!(processor.calls(), created.len());

        let in_recon_queue: BTreeSet<_> = store.list(Stage::ReconQueue).await.unwrap().into_iter().collect();
        assert_eq!(in_recon_queue, created);
        assert!(store.list(Stage::Acq).await.unwrap().is_empty());
        assert!(store.list(Stage::AcqQueue).await.unwrap().is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn concurrent_moves_have_one_winner() {
        let (_tmp, store) = fs_store().await;
        let store = Arc::new(store);
        let rec = crate::testing::record("se", 1);
        let folder = store.insert(Stage::AcqQueue, &rec).await.unwrap();

        let race = |store: Arc<crate::impls::FsStageStore>, folder: FolderName| async move {
            store.move_task(&folder, Stage::AcqQueue, Stage::Acq).await
        };
        let (x, y) = tokio::join!(
            tokio::spawn(race(Arc::clone(&store), folder.clone())),
            tokio::spawn(race(Arc::clone(&store), folder.clone())),
        );
        let results = [x.unwrap(), y.unwrap()];

        assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
        assert!(results
            .iter()
            .any(|r| matches!(r, Err(StoreError::SourceMissing { .. }))));
        assert!(store.contains(Stage::Acq, &folder).await.unwrap());
        assert!(!store.contains(Stage::AcqQueue, &folder).await.unwrap());
    }
}
