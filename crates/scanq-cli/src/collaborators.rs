//! Simulated acquisition driver and reconstruction pipeline.
//!
//! They produce the files a real driver and pipeline would leave in a task
//! folder, so the whole queue can be exercised without hardware.

use std::path::Path;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde::Serialize;
use tokio::fs;
use tokio::time::sleep;

use scanq_core::domain::{Parameters, ProcessingError, ReconMode, TaskRecord};
use scanq_core::ports::{Processor, RAW_DATA_DIR};

pub const KSPACE_FILE: &str = "kspace.json";
pub const DICOM_DIR: &str = "dicom";

#[derive(Serialize)]
struct KspaceHeader<'a> {
    sequence: &'a str,
    scan_counter: u32,
    parameters: &'a Parameters,
    acquired_at: chrono::DateTime<Utc>,
}

fn io_failure(what: &str, err: std::io::Error) -> ProcessingError {
    ProcessingError::new(format!("{what}: {err}"))
}

/// Writes `rawdata/kspace.json` after a delay.
pub struct SimulatedAcquisition {
    delay: Duration,
    remaining_failures: AtomicU32,
}

impl SimulatedAcquisition {
    /// `failures` first calls report a device timeout.
    pub fn new(delay: Duration, failures: u32) -> Self {
        Self {
            delay,
            remaining_failures: AtomicU32::new(failures),
        }
    }
}

#[async_trait]
impl Processor for SimulatedAcquisition {
    fn name(&self) -> &str {
        "simulated-acquisition"
    }

    async fn process(&self, task_path: &Path, record: &TaskRecord) -> Result<(), ProcessingError> {
        sleep(self.delay).await;

        let injected = self
            .remaining_failures
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(ProcessingError::new("device timeout"));
        }

        let raw = task_path.join(RAW_DATA_DIR);
        fs::create_dir_all(&raw)
            .await
            .map_err(|e| io_failure("creating raw data folder", e))?;
        let header = KspaceHeader {
            sequence: &record.sequence,
            scan_counter: record.scan_counter,
            parameters: &record.parameters,
            acquired_at: Utc::now(),
        };
        let bytes = serde_json::to_vec_pretty(&header)
            .map_err(|e| ProcessingError::new(format!("encoding k-space header: {e}")))?;
        fs::write(raw.join(KSPACE_FILE), bytes)
            .await
            .map_err(|e| io_failure("writing k-space", e))?;
        Ok(())
    }
}

/// Writes placeholder images into `dicom/`.
///
/// `fake_dicoms` always produces `images` files. `full` first requires the
/// raw data left by acquisition.
pub struct SimulatedReconstruction {
    delay: Duration,
    images: u32,
}

impl SimulatedReconstruction {
    pub fn new(delay: Duration, images: u32) -> Self {
        Self { delay, images }
    }
}

#[async_trait]
impl Processor for SimulatedReconstruction {
    fn name(&self) -> &str {
        "simulated-reconstruction"
    }

    async fn process(&self, task_path: &Path, record: &TaskRecord) -> Result<(), ProcessingError> {
        if record.processing.mode == ReconMode::Full {
            let kspace = task_path.join(RAW_DATA_DIR).join(KSPACE_FILE);
            let present = fs::try_exists(&kspace)
                .await
                .map_err(|e| io_failure("checking raw data", e))?;
            if !present {
                return Err(ProcessingError::new(format!(
                    "raw data missing: {} not found",
                    kspace.display()
                )));
            }
        }

        sleep(self.delay).await;

        let out = task_path.join(DICOM_DIR);
        fs::create_dir_all(&out)
            .await
            .map_err(|e| io_failure("creating image folder", e))?;
        for n in 1..=self.images {
            let body = format!("DICM placeholder {} image {n}\n", record.id);
            fs::write(out.join(format!("IM_{n:04}.dcm")), body)
                .await
                .map_err(|e| io_failure("writing image", e))?;
        }
        Ok(())
    }
}
