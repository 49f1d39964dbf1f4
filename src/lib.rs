pub mod adapters;
pub mod config;
pub mod core;
pub mod domain;
pub mod utils;

pub use adapters::{build_requests, HttpFetcher, LocalStorage};
pub use config::IngestConfig;
#[cfg(feature = "cli")]
pub use config::CliArgs;
pub use core::{
    engine::{EngineSettings, IngestionEngine},
    output::{OutputSettings, OutputWriter},
    processor::DataProcessor,
};
pub use utils::error::{IngestError, Result};
