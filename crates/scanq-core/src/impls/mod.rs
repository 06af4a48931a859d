//! Impls - implementations of the ports.
//!
//! # Included
//! - **FsStageStore**: stage directories on disk; what the console runs on
//! - **InMemoryStageStore**: same contract in one process, for tests and dry runs

pub mod fs_store;
pub mod inmem_store;

pub use self::fs_store::{FsStageStore, RECORD_FILE, read_record_file};
pub use self::inmem_store::InMemoryStageStore;
