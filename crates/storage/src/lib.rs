//! Durable stage state for stagegate.
//!
//! This crate provides the [`StageStateStore`] interface with an on-disk JSON
//! implementation and an in-memory one.

#![warn(missing_docs)]

pub mod trait_;
pub mod json_storage;
pub mod memory;

pub use trait_::{ArtifactArea, Result, StageStateStore, StorageError};
pub use json_storage::JsonStageStore;
pub use memory::MemoryStageStore;
