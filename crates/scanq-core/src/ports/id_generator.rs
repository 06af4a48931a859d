//! IdGenerator port - ID 生成の抽象化
//!
//! # 実装
//! - **UlidGenerator**: ULID ベース（タイムスタンプは `Clock` から取得）

use crate::domain::ids::{ExamId, TaskId};
use crate::ports::Clock;
use ulid::Ulid;

/// IdGenerator はプロセス間の調整なしで一意な ID を発行
///
/// # スレッド安全性
/// - `Send + Sync` 必須（コンソールの全サービスで共有）
pub trait IdGenerator: Send + Sync {
    fn generate_task_id(&self) -> TaskId;

    fn generate_exam_id(&self) -> ExamId;
}

/// ULID-based generator.
///
/// The timestamp part comes from the clock, so a `FixedClock` yields ids with
/// a known time component while the random part keeps them unique.
pub struct UlidGenerator<C> {
    clock: C,
}

impl<C: Clock> UlidGenerator<C> {
    pub fn new(clock: C) -> Self {
        Self { clock }
    }

    fn next_ulid(&self) -> Ulid {
        let timestamp_ms = self.clock.now().timestamp_millis() as u64;
        Ulid::from_parts(timestamp_ms, rand::random())
    }
}

impl<C: Clock> IdGenerator for UlidGenerator<C> {
    fn generate_task_id(&self) -> TaskId {
        TaskId::from(self.next_ulid())
    }

    fn generate_exam_id(&self) -> ExamId {
        ExamId::from(self.next_ulid())
    }
}
