use std::sync::Arc;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::app::scanner_loop::ScannerLoop;
use crate::domain::LoopError;

/// Worker group handle.
/// - every loop runs `prepare` and then `run` on its own tokio task
/// - one loop halting requests shutdown for the whole group
/// - `shutdown_and_join()` waits for all loops to finish their current tick
pub struct WorkerGroup {
    shutdown_tx: Arc<watch::Sender<bool>>,
    joins: Vec<(&'static str, JoinHandle<Result<(), LoopError>>)>,
}

impl WorkerGroup {
    pub fn spawn(loops: impl IntoIterator<Item = Arc<ScannerLoop>>) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let shutdown_tx = Arc::new(shutdown_tx);

        let mut joins = Vec::new();
        for scanner in loops {
            let worker = scanner.kind().name();
            let rx = shutdown_rx.clone();
            let tx = Arc::clone(&shutdown_tx);

            let join = tokio::spawn(async move {
                let result = run_worker(&scanner, rx).await;
                if result.is_err() {
                    // ignore send error: receivers may already be dropped
                    let _ = tx.send(true);
                }
                result
            });
            joins.push((worker, join));
        }

        Self { shutdown_tx, joins }
    }

    /// Ask every loop to stop after its current tick.
    pub fn request_shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    /// Resolves once shutdown was requested, by the caller or by a halted loop.
    pub async fn stopped(&self) {
        let mut rx = self.shutdown_tx.subscribe();
        let _ = rx.wait_for(|stop| *stop).await;
    }

    /// Shutdown and wait for all loops; reports the first failure.
    pub async fn shutdown_and_join(self) -> Result<(), LoopError> {
        self.request_shutdown();
        let mut first_error = None;
        for (worker, join) in self.joins {
            let result = match join.await {
                Ok(result) => result,
                Err(e) => Err(LoopError::Aborted {
                    worker,
                    reason: e.to_string(),
                }),
            };
            if let Err(e) = result {
                error!(worker, error = %e, "worker ended with an error");
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

async fn run_worker(scanner: &ScannerLoop, shutdown: watch::Receiver<bool>) -> Result<(), LoopError> {
    let worker = scanner.kind().name();
    let report = scanner
        .prepare()
        .await
        .map_err(|source| LoopError::Recovery { worker, source })?;
    if !report.is_empty() {
        info!(
            worker,
            requeued = report.requeued.len(),
            forwarded = report.forwarded.len(),
            failed = report.failed.len(),
            "startup recovery finished"
        );
    }
    scanner.run(shutdown).await
}
