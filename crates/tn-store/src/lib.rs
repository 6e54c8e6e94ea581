//! # tn-store
//!
//! The persistence interface consumed by the orchestration master, and an
//! in-memory implementation used for sandbox runs and tests.

mod memory;
mod rows;
mod store;

pub use memory::MemoryStore;
pub use rows::{AllocationRow, ExperimentRow, NewTrial, SnapshotRecord, TaskLog, TrialRow, TrialSnapshotWrite};
pub use store::{Store, StoreResult};
