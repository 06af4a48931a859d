//! scanq-core
//!
//! Task queue and state machine for a scanner console.
//!
//! スキャン 1 件 = フォルダ 1 つ。フォルダが置かれた stage ディレクトリがそのまま状態で、
//! フォルダの移動だけが状態遷移。ワーカープロセス間の調整もこの移動だけで行う。
//!
//! # モジュール構成
//! - **domain**: ドメインモデル（ids, stage, task record, errors）
//! - **ports**: 抽象化レイヤー（StageStore, Processor, Clock, IdGenerator）
//! - **impls**: 実装（FsStageStore, InMemoryStageStore）
//! - **app**: アプリケーションロジック（TaskStore, ScannerLoop, WorkerGroup, Introspection, Cleanup, ConsoleBuilder）
//! - **config**: ConsoleConfig（TOML / JSON）

pub mod app;
pub mod config;
pub mod domain;
pub mod impls;
pub mod ports;
