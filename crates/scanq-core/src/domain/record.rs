//! Task record: the serialized description of one scan.
//!
//! The record never stores its own state. Where the folder lives is the state;
//! see [`crate::domain::stage`].

use std::collections::BTreeMap;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use super::errors::StoreError;
use super::folder::FolderName;
use super::ids::{ExamId, TaskId};
use super::stage::Stage;

/// A sequence parameter value: a scalar or an array of values.
///
/// Objects are not representable, so a record carrying a nested map fails to
/// deserialize.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParamValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    Array(Vec<ParamValue>),
}

pub type Parameters = BTreeMap<String, ParamValue>;

/// Patient snapshot captured when the scan was created.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PatientInfo {
    pub first_name: String,
    pub last_name: String,
    pub mrn: String,
    pub birth_date: Option<NaiveDate>,
    pub gender: String,
    pub weight_kg: Option<f64>,
    pub height_cm: Option<f64>,
}

impl PatientInfo {
    pub fn full_name(&self) -> String {
        format!("{}, {}", self.last_name, self.first_name)
    }
}

/// Exam snapshot captured when the scan was created.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExamInfo {
    pub id: ExamId,
    #[serde(default)]
    pub patient_position: String,
    pub started_at: DateTime<Utc>,
}

/// Scanner system snapshot captured when the scan was created.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SystemInfo {
    pub name: String,
    pub model: String,
    pub serial_number: String,
    pub software_version: String,
}

/// How the reconstruction worker treats the task.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReconMode {
    /// Skip reconstruction entirely; the task goes straight to complete.
    Bypass,
    /// Produce placeholder output instead of running the pipeline.
    FakeDicoms,
    /// Run the full reconstruction pipeline.
    #[default]
    Full,
}

/// Processing selector plus algorithm options handed to the collaborator.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProcessingOptions {
    pub mode: ReconMode,
    pub kspace_filter: Option<String>,
    pub denoise: bool,
    pub b0_correction: bool,
}

/// Lifecycle timestamps. Each one is written by whoever owns the folder at the time.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LifecycleTimes {
    pub created_at: Option<DateTime<Utc>>,
    pub scheduled_at: Option<DateTime<Utc>>,
    pub acq_started_at: Option<DateTime<Utc>>,
    pub acq_finished_at: Option<DateTime<Utc>>,
    pub recon_started_at: Option<DateTime<Utc>>,
    pub recon_finished_at: Option<DateTime<Utc>>,
    pub failed_at: Option<DateTime<Utc>>,
}

/// Why a task ended up in the failure stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureInfo {
    /// Stage the task was in when it failed.
    pub stage: Stage,
    pub reason: String,
    pub at: DateTime<Utc>,
}

/// Creation input for a scan.
///
/// `scan_counter` is signed on purpose: a negative counter is representable in
/// the input and rejected by [`ScanSpec::validate`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScanSpec {
    pub sequence: String,
    #[serde(default)]
    pub protocol_name: String,
    #[serde(default)]
    pub description: String,
    pub scan_counter: i64,
    #[serde(default)]
    pub patient: PatientInfo,
    pub exam: ExamInfo,
    #[serde(default)]
    pub system: SystemInfo,
    #[serde(default)]
    pub parameters: Parameters,
    #[serde(default)]
    pub processing: ProcessingOptions,
}

impl ScanSpec {
    /// Minimal spec for `sequence` within `exam`.
    pub fn new(sequence: impl Into<String>, scan_counter: i64, exam: ExamInfo) -> Self {
        Self {
            sequence: sequence.into(),
            protocol_name: String::new(),
            description: String::new(),
            scan_counter,
            patient: PatientInfo::default(),
            exam,
            system: SystemInfo::default(),
            parameters: Parameters::new(),
            processing: ProcessingOptions::default(),
        }
    }

    pub fn with_mode(mut self, mode: ReconMode) -> Self {
        self.processing.mode = mode;
        self
    }

    pub fn with_parameter(mut self, key: impl Into<String>, value: ParamValue) -> Self {
        self.parameters.insert(key.into(), value);
        self
    }

    /// Check the rules a spec must satisfy before anything is written.
    pub fn validate(&self) -> Result<u32, StoreError> {
        if self.sequence.trim().is_empty() {
            return Err(StoreError::InvalidSpec(
                "sequence identifier must not be empty".to_string(),
            ));
        }
        if self.scan_counter < 0 {
            return Err(StoreError::InvalidSpec(format!(
                "scan counter must be non-negative, got {}",
                self.scan_counter
            )));
        }
        let counter = u32::try_from(self.scan_counter).map_err(|_| {
            StoreError::InvalidSpec(format!("scan counter {} is too large", self.scan_counter))
        })?;
        if let Some(key) = self.parameters.keys().find(|k| k.trim().is_empty()) {
            return Err(StoreError::InvalidSpec(format!(
                "parameter key '{key}' must not be blank"
            )));
        }
        Ok(counter)
    }
}

/// One scan, as persisted in its folder.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRecord {
    pub id: TaskId,
    pub sequence: String,
    #[serde(default)]
    pub protocol_name: String,
    #[serde(default)]
    pub description: String,
    pub scan_counter: u32,
    pub patient: PatientInfo,
    pub exam: ExamInfo,
    pub system: SystemInfo,
    #[serde(default)]
    pub parameters: Parameters,
    #[serde(default)]
    pub processing: ProcessingOptions,
    #[serde(default)]
    pub timestamps: LifecycleTimes,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<FailureInfo>,
    /// Times startup recovery returned this task to its queue.
    #[serde(default)]
    pub recoveries: u32,
}

impl TaskRecord {
    /// Build a fresh record from a validated spec.
    pub fn from_spec(id: TaskId, spec: ScanSpec, now: DateTime<Utc>) -> Result<Self, StoreError> {
        let scan_counter = spec.validate()?;
        Ok(Self {
            id,
            sequence: spec.sequence,
            protocol_name: spec.protocol_name,
            description: spec.description,
            scan_counter,
            patient: spec.patient,
            exam: spec.exam,
            system: spec.system,
            parameters: spec.parameters,
            processing: spec.processing,
            timestamps: LifecycleTimes {
                created_at: Some(now),
                ..LifecycleTimes::default()
            },
            failure: None,
            recoveries: 0,
        })
    }

    pub fn folder_name(&self) -> FolderName {
        FolderName::for_task(self.id)
    }

    /// Record a failure; the latest failure wins.
    pub fn mark_failed(&mut self, stage: Stage, reason: impl Into<String>, now: DateTime<Utc>) {
        self.failure = Some(FailureInfo {
            stage,
            reason: reason.into(),
            at: now,
        });
        self.timestamps.failed_at = Some(now);
    }

    /// Stamp the start of processing in an active stage.
    pub fn mark_started(&mut self, stage: Stage, now: DateTime<Utc>) {
        match stage {
            Stage::Acq => self.timestamps.acq_started_at = Some(now),
            Stage::Recon => self.timestamps.recon_started_at = Some(now),
            _ => {}
        }
    }

    /// When processing in an active stage completed, if it did.
    pub fn finished_at(&self, stage: Stage) -> Option<DateTime<Utc>> {
        match stage {
            Stage::Acq => self.timestamps.acq_finished_at,
            Stage::Recon => self.timestamps.recon_finished_at,
            _ => None,
        }
    }

    /// Stamp the end of processing in an active stage.
    pub fn mark_finished(&mut self, stage: Stage, now: DateTime<Utc>) {
        match stage {
            Stage::Acq => self.timestamps.acq_finished_at = Some(now),
            Stage::Recon => self.timestamps.recon_finished_at = Some(now),
            _ => {}
        }
    }
}
