//! Storage for pipeline progress.
//!
//! This crate provides a trait-based checkpoint store with a JSON file
//! implementation, the canonical plan hash used to decide whether a stored
//! checkpoint may be resumed, and the small JSON file helpers the scheduler
//! uses for its state file.

#![warn(missing_docs)]

pub mod trait_;
pub mod json_storage;
pub mod hash;

pub use trait_::{CheckpointStore, Result, StorageError};
pub use json_storage::{
    checkpoint_path, read_json_lenient, remove_if_exists, write_json_atomic, JsonCheckpointStore,
    STATE_DIR,
};
pub use hash::hash_plan;
