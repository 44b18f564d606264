pub mod analyze;
pub mod bench;
pub mod cli;
pub mod client;
pub mod config;
pub mod dataset;
pub mod ingest;
pub mod lifecycle;
pub mod loader;
pub mod memory;
pub mod metrics;
pub mod report;
pub mod utils;

pub use config::{Opts, RunConfig};
