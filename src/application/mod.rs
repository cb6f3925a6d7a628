//! Application Layer
//!
//! Use cases built on the domain ports.

pub mod batcher;

pub use batcher::{BatchConfig, BatchWorker, Batcher, QueryState};
