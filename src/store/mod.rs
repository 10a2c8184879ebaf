mod job_store;
mod tracker;

pub use job_store::JobStore;
pub use tracker::{Registration, TransferTracker};
