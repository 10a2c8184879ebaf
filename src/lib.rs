//! Asynchronous resolution of part chains, tracked per job and rolled up
//! through batches into batch orders.

pub mod batch;
pub mod callback;
pub mod cli;
pub mod config;
pub mod connector;
pub mod error;
pub mod logging;
pub mod orchestrator;
pub mod poller;
pub mod state_machine;
pub mod store;
pub mod ui;

pub use error::PartchainError;
