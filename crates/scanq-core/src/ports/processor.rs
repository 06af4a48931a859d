//! Processor port - claim したタスクに対してワーカーが行う処理
//!
//! 収集ドライバや再構成パイプラインの実体はこの crate の外側にある。
//! ScannerLoop が解釈するのは成功か失敗かだけ。

use std::path::Path;

use async_trait::async_trait;

use crate::domain::{ProcessingError, TaskRecord};

/// Name of the subfolder an acquisition collaborator writes raw data into.
pub const RAW_DATA_DIR: &str = "rawdata";

/// A processing collaborator.
///
/// # Example
/// ```ignore
/// struct Driver;
///
/// #[async_trait]
/// impl Processor for Driver {
///     fn name(&self) -> &str { "driver" }
///
///     async fn process(&self, task_path: &Path, record: &TaskRecord) -> Result<(), ProcessingError> {
///         acquire(task_path.join(RAW_DATA_DIR), &record.parameters).await
///             .map_err(|e| ProcessingError::new(e.to_string()))
///     }
/// }
/// ```
#[async_trait]
pub trait Processor: Send + Sync {
    fn name(&self) -> &str;

    /// Process the task whose folder is at `task_path`.
    ///
    /// May block for minutes. The caller does nothing else in the meantime.
    async fn process(&self, task_path: &Path, record: &TaskRecord) -> Result<(), ProcessingError>;
}
