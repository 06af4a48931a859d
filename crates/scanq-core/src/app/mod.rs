//! App - アプリケーション層
//!
//! ports を組み合わせてコンソールのサービスを構成する。
//!
//! # 主要コンポーネント
//! - **ConsoleBuilder**: 配線と fail-fast 検証
//! - **TaskStore**: task record の作成 / 読み取り / 状態チェック付き書き込み
//! - **ScannerLoop**: select -> claim -> process -> advance（ワーカー種別ごと）
//! - **WorkerGroup**: 共通の shutdown シグナルでループ群を実行
//! - **Introspection**: 全タスクの導出状態（読み取り専用）
//! - **Cleanup**: タスクフォルダを削除する唯一の経路

pub mod backoff;
pub mod builder;
pub mod cleanup;
pub mod introspection;
pub mod scanner_loop;
pub mod task_store;
pub mod worker_group;

pub use self::backoff::RetryPolicy;
pub use self::builder::{BuildError, Console, ConsoleBuilder};
pub use self::cleanup::Cleanup;
pub use self::introspection::{Introspection, QueueCounts, QueueSnapshot, TaskEntry};
pub use self::scanner_loop::{LoopSettings, RecoveryReport, ScannerLoop, TickOutcome, WorkerKind};
pub use self::task_store::TaskStore;
pub use self::worker_group::WorkerGroup;
