//! Stage - stage ディレクトリと、そこから導出されるタスク状態

use serde::{Deserialize, Serialize};
use std::fmt;

/// Stage はライフサイクル上の置き場所
///
/// タスクフォルダは常にちょうど 1 つの stage にあり、stage 間の移動が状態遷移。
///
/// # 状態遷移
/// - AcqQueue -> Acq -> ReconQueue -> Recon -> Complete
/// - Acq | Recon -> Failure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    /// Created or scheduled, waiting for the acquisition worker.
    AcqQueue,
    /// Claimed by the acquisition worker.
    Acq,
    /// Raw data acquired, waiting for the reconstruction worker.
    ReconQueue,
    /// Claimed by the reconstruction worker.
    Recon,
    Complete,
    Failure,
}

impl Stage {
    /// Fixed iteration order used by introspection and layout creation.
    pub const ALL: [Stage; 6] = [
        Stage::AcqQueue,
        Stage::Acq,
        Stage::ReconQueue,
        Stage::Recon,
        Stage::Complete,
        Stage::Failure,
    ];

    /// Directory name of this stage under the data root.
    pub fn dir_name(self) -> &'static str {
        match self {
            Stage::AcqQueue => "queue_acq",
            Stage::Acq => "acq",
            Stage::ReconQueue => "queue_recon",
            Stage::Recon => "recon",
            Stage::Complete => "complete",
            Stage::Failure => "failure",
        }
    }

    /// Complete and Failure are kept for operator review; only cleanup removes them.
    pub fn is_terminal(self) -> bool {
        matches!(self, Stage::Complete | Stage::Failure)
    }

    /// Stages owned by exactly one claiming worker.
    pub fn is_active(self) -> bool {
        matches!(self, Stage::Acq | Stage::Recon)
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.dir_name())
    }
}

/// Logical task state as shown to operators.
///
/// Never persisted: it is computed from the stage holding the folder, plus the
/// `prepared` marker inside the acquisition queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    /// In the acquisition queue, still editable.
    Created,
    /// In the acquisition queue and frozen; eligible for acquisition.
    ScheduledAcq,
    Acq,
    ScheduledRecon,
    Recon,
    Complete,
    Failure,
}

impl TaskState {
    /// Derive the state of a folder found in `stage`.
    pub fn derive(stage: Stage, prepared: bool) -> Self {
        match stage {
            Stage::AcqQueue if prepared => TaskState::ScheduledAcq,
            Stage::AcqQueue => TaskState::Created,
            Stage::Acq => TaskState::Acq,
            Stage::ReconQueue => TaskState::ScheduledRecon,
            Stage::Recon => TaskState::Recon,
            Stage::Complete => TaskState::Complete,
            Stage::Failure => TaskState::Failure,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            TaskState::Created => "created",
            TaskState::ScheduledAcq => "scheduled_acq",
            TaskState::Acq => "acq",
            TaskState::ScheduledRecon => "scheduled_recon",
            TaskState::Recon => "recon",
            TaskState::Complete => "complete",
            TaskState::Failure => "failure",
        }
    }

    pub fn stage(self) -> Stage {
        match self {
            TaskState::Created | TaskState::ScheduledAcq => Stage::AcqQueue,
            TaskState::Acq => Stage::Acq,
            TaskState::ScheduledRecon => Stage::ReconQueue,
            TaskState::Recon => Stage::Recon,
            TaskState::Complete => Stage::Complete,
            TaskState::Failure => Stage::Failure,
        }
    }

    pub fn is_terminal(self) -> bool {
        self.stage().is_terminal()
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}
