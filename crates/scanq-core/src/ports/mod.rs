//! Ports - 抽象化レイヤー
//!
//! 調整コアの外側にあるものとの境界を trait で表現する。
//! stage の永続化先、処理コラボレータ、時刻と ID の供給元。

pub mod clock;
pub mod id_generator;
pub mod processor;
pub mod stage_store;

pub use self::clock::{Clock, FixedClock, SystemClock};
pub use self::id_generator::{IdGenerator, UlidGenerator};
pub use self::processor::{Processor, RAW_DATA_DIR};
pub use self::stage_store::{PREPARED_MARKER, StageStore};
