//! ドメインモデル（ID, stage, task record, errors）

pub mod errors;
pub mod folder;
pub mod ids;
pub mod record;
pub mod stage;

pub use self::errors::{ErrorKind, LoopError, ProcessingError, StoreError};
pub use self::folder::FolderName;
pub use self::ids::{ExamId, TaskId};
pub use self::record::{
    ExamInfo, FailureInfo, LifecycleTimes, ParamValue, Parameters, PatientInfo,
    ProcessingOptions, ReconMode, ScanSpec, SystemInfo, TaskRecord,
};
pub use self::stage::{Stage, TaskState};
