//! Bulk submissions: batch orders split into sequentially processed batches.

pub mod model;
mod orchestrator;
pub mod planner;
pub mod store;

pub use model::{Batch, BatchOrder, BatchOrderParameter, FailurePolicy, JobProgress};
pub use orchestrator::BatchOrchestrator;
pub use planner::plan_batches;
pub use store::{BatchOrderStore, BatchStore, BlobPersistence, DirectoryBlobStore, InMemoryBlobStore};
